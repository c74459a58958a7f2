//! HORNET: Playbooks
//!
//! Named response playbooks: ordered action templates matched to event
//! types. The registry ships with built-ins and accepts tenant-specific
//! registrations at startup.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Playbook priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybookPriority {
    Low,
    Medium,
    High,
    Critical,
}

/// One step in a playbook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybookStep {
    pub order: u32,
    pub action_type: String,
    /// Target template; `{entity}` placeholders are filled by the responder
    pub target: String,
    #[serde(default)]
    pub params: serde_json::Value,
    /// Step may execute without oversight sign-off
    #[serde(default)]
    pub auto_approve: bool,
}

/// A registered playbook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Playbook {
    pub id: String,
    pub name: String,
    pub description: String,
    /// Event types (exact or dotted prefix) that activate the playbook
    pub triggers: Vec<String>,
    pub priority: PlaybookPriority,
    pub steps: Vec<PlaybookStep>,
    pub auto_approve_all: bool,
    pub requires_oversight: bool,
}

impl Playbook {
    /// Whether the playbook applies to an event type. A trigger matches
    /// exactly or as a dotted prefix ("auth." matches "auth.brute_force").
    pub fn matches(&self, event_type: &str) -> bool {
        self.triggers.iter().any(|t| {
            event_type == t || (t.ends_with('.') && event_type.starts_with(t.as_str()))
        })
    }
}

/// Playbook registry.
pub struct PlaybookRegistry {
    playbooks: RwLock<HashMap<String, Playbook>>,
}

impl Default for PlaybookRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl PlaybookRegistry {
    pub fn empty() -> Self {
        Self {
            playbooks: RwLock::new(HashMap::new()),
        }
    }

    /// Registry seeded with the built-in playbooks.
    pub fn builtin() -> Self {
        let registry = Self::empty();
        registry.register(brute_force_containment());
        registry.register(ransomware_response());
        registry
    }

    pub fn register(&self, playbook: Playbook) {
        self.playbooks.write().insert(playbook.id.clone(), playbook);
    }

    pub fn get(&self, id: &str) -> Option<Playbook> {
        self.playbooks.read().get(id).cloned()
    }

    pub fn all(&self) -> Vec<Playbook> {
        let mut all: Vec<Playbook> = self.playbooks.read().values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Playbooks matching an event type, highest priority first.
    pub fn find_for_event(&self, event_type: &str) -> Vec<Playbook> {
        let mut matched: Vec<Playbook> = self
            .playbooks
            .read()
            .values()
            .filter(|p| p.matches(event_type))
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.priority.cmp(&a.priority));
        matched
    }
}

fn brute_force_containment() -> Playbook {
    Playbook {
        id: "brute_force_containment".into(),
        name: "Brute Force Containment".into(),
        description: "Block the source, lock the targeted account, notify the SOC.".into(),
        triggers: vec!["auth.brute_force".into(), "auth.login_failure".into()],
        priority: PlaybookPriority::High,
        steps: vec![
            PlaybookStep {
                order: 0,
                action_type: "block_ip".into(),
                target: "{ip}".into(),
                params: json!({"duration_minutes": 60}),
                auto_approve: false,
            },
            PlaybookStep {
                order: 1,
                action_type: "force_password_reset".into(),
                target: "{user}".into(),
                params: json!({}),
                auto_approve: false,
            },
            PlaybookStep {
                order: 2,
                action_type: "notify_team".into(),
                target: "soc".into(),
                params: json!({"channel": "detections"}),
                auto_approve: true,
            },
        ],
        auto_approve_all: false,
        requires_oversight: true,
    }
}

fn ransomware_response() -> Playbook {
    Playbook {
        id: "ransomware_response".into(),
        name: "Ransomware Response".into(),
        description: "Isolate the endpoint, kill the process, page on-call.".into(),
        triggers: vec![
            "endpoint.ransomware_behavior".into(),
            "data.encryption_anomaly".into(),
        ],
        priority: PlaybookPriority::Critical,
        steps: vec![
            PlaybookStep {
                order: 0,
                action_type: "isolate_endpoint".into(),
                target: "{hostname}".into(),
                params: json!({}),
                auto_approve: false,
            },
            PlaybookStep {
                order: 0,
                action_type: "kill_process".into(),
                target: "{hostname}".into(),
                params: json!({}),
                auto_approve: false,
            },
            PlaybookStep {
                order: 1,
                action_type: "page_oncall".into(),
                target: "security-oncall".into(),
                params: json!({"urgency": "high"}),
                auto_approve: true,
            },
        ],
        auto_approve_all: false,
        requires_oversight: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_registry() {
        let registry = PlaybookRegistry::builtin();
        assert_eq!(registry.all().len(), 2);
        assert!(registry.get("brute_force_containment").is_some());
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn test_trigger_matching() {
        let registry = PlaybookRegistry::builtin();
        let matched = registry.find_for_event("auth.brute_force");
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].id, "brute_force_containment");
        assert!(registry.find_for_event("dns.query").is_empty());
    }

    #[test]
    fn test_prefix_trigger() {
        let registry = PlaybookRegistry::empty();
        registry.register(Playbook {
            id: "any_auth".into(),
            name: "Any Auth".into(),
            description: String::new(),
            triggers: vec!["auth.".into()],
            priority: PlaybookPriority::Low,
            steps: vec![],
            auto_approve_all: false,
            requires_oversight: true,
        });
        assert_eq!(registry.find_for_event("auth.mfa_disabled").len(), 1);
        assert!(registry.find_for_event("network.ddos").is_empty());
    }

    #[test]
    fn test_priority_ordering() {
        let registry = PlaybookRegistry::builtin();
        let mut playbook = brute_force_containment();
        playbook.id = "auth_catchall".into();
        playbook.triggers = vec!["auth.brute_force".into()];
        playbook.priority = PlaybookPriority::Critical;
        registry.register(playbook);

        let matched = registry.find_for_event("auth.brute_force");
        assert_eq!(matched[0].priority, PlaybookPriority::Critical);
    }
}
