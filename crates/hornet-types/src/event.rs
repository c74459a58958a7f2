//! HORNET: Security Events
//!
//! Normalized ingress events. An event is immutable once published to the
//! bus; the provisional incident id it carries makes downstream incident
//! creation idempotent under at-least-once delivery.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Event and incident severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Uppercase wire form, as stored and logged.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        }
    }

    /// Parse the uppercase wire form, defaulting to LOW on anything else.
    pub fn parse_lossy(s: &str) -> Self {
        match s.to_ascii_uppercase().as_str() {
            "MEDIUM" => Self::Medium,
            "HIGH" => Self::High,
            "CRITICAL" => Self::Critical,
            _ => Self::Low,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed entity observed in an event (ip, user, hostname, domain, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Entity {
    /// Entity class
    #[serde(rename = "type")]
    pub entity_type: String,
    /// Entity value
    pub value: String,
}

impl Entity {
    pub fn new(entity_type: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            value: value.into(),
        }
    }
}

/// A normalized security event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Event id
    pub id: Uuid,
    /// Owning tenant
    pub tenant_id: Uuid,
    /// Provisional incident id; used verbatim if the event is promoted
    pub incident_id: Uuid,
    /// Event occurrence time
    pub timestamp: DateTime<Utc>,
    /// Source system (hostname, service name)
    pub source: String,
    /// Source class (edr, waf, syslog, edge_agent, ...)
    pub source_type: String,
    /// Dotted event type (e.g. "auth.brute_force")
    pub event_type: String,
    /// Severity as reported by the source
    pub severity: Severity,
    /// Entities observed in the event
    #[serde(default)]
    pub entities: Vec<Entity>,
    /// Source-specific payload, opaque to the core
    #[serde(default)]
    pub raw_payload: serde_json::Value,
}

impl Event {
    /// Values of all entities of a given class.
    pub fn entities_of_type(&self, entity_type: &str) -> Vec<&str> {
        self.entities
            .iter()
            .filter(|e| e.entity_type == entity_type)
            .map(|e| e.value.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_roundtrip() {
        let json = serde_json::to_string(&Severity::High).unwrap();
        assert_eq!(json, "\"HIGH\"");
        let back: Severity = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Severity::High);
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::Low < Severity::Medium);
    }

    #[test]
    fn test_severity_parse_lossy() {
        assert_eq!(Severity::parse_lossy("critical"), Severity::Critical);
        assert_eq!(Severity::parse_lossy("bogus"), Severity::Low);
    }

    #[test]
    fn test_entities_of_type() {
        let event = Event {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            incident_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source: "fw-01".into(),
            source_type: "firewall".into(),
            event_type: "auth.brute_force".into(),
            severity: Severity::High,
            entities: vec![
                Entity::new("ip", "192.168.1.100"),
                Entity::new("user", "admin"),
                Entity::new("ip", "10.0.0.5"),
            ],
            raw_payload: serde_json::json!({}),
        };

        assert_eq!(event.entities_of_type("ip"), vec!["192.168.1.100", "10.0.0.5"]);
        assert_eq!(event.entities_of_type("user"), vec!["admin"]);
        assert!(event.entities_of_type("domain").is_empty());
    }
}
