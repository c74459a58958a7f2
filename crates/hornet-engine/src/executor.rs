//! HORNET: Action Executor
//!
//! Runs approved actions through connectors in dependency-ordered parallel
//! groups, records rollback handles, and supports explicit incident-level
//! rollback in reverse order. A failed action never triggers rollback on
//! its own, and a failure inside a group does not cancel its peers.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use hornet_store::{ActionUpdate, Storage};
use hornet_types::{ActionStatus, HornetError};

/// Result of one connector call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorOutcome {
    pub success: bool,
    pub message: String,
    #[serde(default)]
    pub data: serde_json::Value,
    /// Handle the connector issues for a later rollback
    pub rollback_handle: Option<String>,
}

impl ConnectorOutcome {
    pub fn ok(data: serde_json::Value, rollback_handle: Option<String>) -> Self {
        Self {
            success: true,
            message: String::new(),
            data,
            rollback_handle,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: serde_json::Value::Null,
            rollback_handle: None,
        }
    }
}

/// Opaque driver to an external system.
#[async_trait]
pub trait Connector: Send + Sync {
    fn name(&self) -> &str;

    /// Pre-flight check for an action.
    async fn validate(
        &self,
        action_type: &str,
        target: &str,
        parameters: &serde_json::Value,
    ) -> Result<bool, HornetError>;

    /// Execute the action.
    async fn execute(
        &self,
        action_type: &str,
        target: &str,
        parameters: &serde_json::Value,
    ) -> Result<ConnectorOutcome, HornetError>;

    /// Undo a previously executed action by its handle.
    async fn rollback(&self, rollback_handle: &str) -> Result<ConnectorOutcome, HornetError>;

    async fn health_check(&self) -> bool;
}

/// Connector class an action type routes to. Notification actions complete
/// without a configured connector.
pub fn connector_type_for(action_type: &str) -> Option<&'static str> {
    match action_type {
        "block_ip" | "block_ip_range" | "block_domain" | "unblock_ip" => Some("firewall"),
        "disable_account" | "force_password_reset" | "revoke_sessions" | "enforce_mfa" => {
            Some("identity")
        }
        "isolate_endpoint" | "kill_process" | "quarantine_file" | "collect_forensics" => {
            Some("edr")
        }
        "revoke_iam_role" | "disable_access_key" | "stop_instance" => Some("cloud"),
        "notify_user" | "notify_team" | "page_oncall" => Some("notification"),
        _ => None,
    }
}

/// One action inside an execution plan.
#[derive(Debug, Clone)]
pub struct PlannedAction {
    pub action_id: Uuid,
    pub action_type: String,
    pub target: String,
    pub parameters: serde_json::Value,
}

/// Plan handed over by the coordinator after oversight approval.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    pub incident_id: Uuid,
    pub tenant_id: Uuid,
    pub actions: Vec<PlannedAction>,
    /// Waves of action ids that may run concurrently, in order
    pub parallel_groups: Vec<Vec<Uuid>>,
    /// action id -> predecessor action ids
    pub dependencies: HashMap<Uuid, Vec<Uuid>>,
}

/// Terminal disposition of one planned action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionDisposition {
    Completed,
    Failed,
    Blocked,
}

/// Record returned for each planned action.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionRecord {
    pub action_id: Uuid,
    pub disposition: ExecutionDisposition,
    pub connector: Option<&'static str>,
    pub error: Option<String>,
    pub rollback_handle: Option<String>,
}

/// Executes approved actions against target systems.
pub struct ActionExecutor {
    connectors: RwLock<HashMap<String, Arc<dyn Connector>>>,
    storage: Arc<dyn Storage>,
    call_timeout: Duration,
}

impl ActionExecutor {
    pub fn new(storage: Arc<dyn Storage>, call_timeout: Duration) -> Self {
        Self {
            connectors: RwLock::new(HashMap::new()),
            storage,
            call_timeout,
        }
    }

    pub fn register_connector(&self, connector_type: impl Into<String>, connector: Arc<dyn Connector>) {
        let connector_type = connector_type.into();
        tracing::info!(connector_type = %connector_type, "connector registered");
        self.connectors.write().insert(connector_type, connector);
    }

    fn connector(&self, connector_type: &str) -> Option<Arc<dyn Connector>> {
        self.connectors.read().get(connector_type).cloned()
    }

    /// Health of every registered connector.
    pub async fn connector_health(&self) -> HashMap<String, bool> {
        let connectors: Vec<(String, Arc<dyn Connector>)> = self
            .connectors
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let mut health = HashMap::new();
        for (name, connector) in connectors {
            health.insert(name, connector.health_check().await);
        }
        health
    }

    /// Execute a plan. Groups run in order; inside a group, actions whose
    /// predecessors all completed run concurrently, the rest are blocked.
    pub async fn execute_plan(&self, plan: &ExecutionPlan) -> Vec<ExecutionRecord> {
        let by_id: HashMap<Uuid, &PlannedAction> =
            plan.actions.iter().map(|a| (a.action_id, a)).collect();
        let mut completed: HashSet<Uuid> = HashSet::new();
        let mut failed: HashSet<Uuid> = HashSet::new();
        let mut records = Vec::new();

        for group in &plan.parallel_groups {
            let mut runnable = Vec::new();
            for action_id in group {
                let Some(action) = by_id.get(action_id) else {
                    continue;
                };
                let deps = plan.dependencies.get(action_id).cloned().unwrap_or_default();
                if deps.iter().any(|d| failed.contains(d)) {
                    records.push(self.record_blocked(plan, *action).await);
                    failed.insert(*action_id);
                    continue;
                }
                if !deps.iter().all(|d| completed.contains(d)) {
                    // Predecessor never ran (malformed plan); treat as blocked.
                    records.push(self.record_blocked(plan, *action).await);
                    failed.insert(*action_id);
                    continue;
                }
                runnable.push(*action);
            }

            let results = join_all(
                runnable
                    .iter()
                    .map(|action| self.execute_action(plan, *action)),
            )
            .await;

            for record in results {
                match record.disposition {
                    ExecutionDisposition::Completed => {
                        completed.insert(record.action_id);
                    }
                    _ => {
                        failed.insert(record.action_id);
                    }
                }
                records.push(record);
            }
        }
        records
    }

    async fn record_blocked(&self, plan: &ExecutionPlan, action: &PlannedAction) -> ExecutionRecord {
        tracing::warn!(action_id = %action.action_id, "action blocked by failed predecessor");
        let update = ActionUpdate {
            result: Some(json!({"blocked": true, "reason": "predecessor failed"})),
            ..Default::default()
        };
        if let Err(e) = self
            .storage
            .update_action(plan.tenant_id, action.action_id, update)
            .await
        {
            tracing::error!(error = %e, "blocked-action record failed");
        }
        ExecutionRecord {
            action_id: action.action_id,
            disposition: ExecutionDisposition::Blocked,
            connector: None,
            error: Some("predecessor failed".into()),
            rollback_handle: None,
        }
    }

    /// Execute a single approved action end to end.
    async fn execute_action(&self, plan: &ExecutionPlan, action: &PlannedAction) -> ExecutionRecord {
        let fail = |error: String, connector: Option<&'static str>| ExecutionRecord {
            action_id: action.action_id,
            disposition: ExecutionDisposition::Failed,
            connector,
            error: Some(error),
            rollback_handle: None,
        };

        if let Err(e) = self
            .storage
            .update_action(
                plan.tenant_id,
                action.action_id,
                ActionUpdate {
                    status: Some(ActionStatus::Executing),
                    ..Default::default()
                },
            )
            .await
        {
            return fail(format!("status update failed: {e}"), None);
        }

        let Some(connector_type) = connector_type_for(&action.action_type) else {
            self.finish_action(plan, action.action_id, None, ConnectorOutcome::failed("unknown action type"))
                .await;
            return fail(format!("unknown action type: {}", action.action_type), None);
        };

        let connector = self.connector(connector_type);
        let outcome = match connector {
            None if connector_type == "notification" => {
                // Notification actions have no side effect outside messaging.
                ConnectorOutcome::ok(json!({"notified": true}), None)
            }
            None => ConnectorOutcome::failed(format!("connector not configured: {connector_type}")),
            Some(connector) => {
                match connector
                    .validate(&action.action_type, &action.target, &action.parameters)
                    .await
                {
                    Ok(true) => {
                        match tokio::time::timeout(
                            self.call_timeout,
                            connector.execute(&action.action_type, &action.target, &action.parameters),
                        )
                        .await
                        {
                            Ok(Ok(outcome)) => outcome,
                            Ok(Err(e)) => ConnectorOutcome::failed(e.to_string()),
                            Err(_) => ConnectorOutcome::failed("action execution timed out"),
                        }
                    }
                    Ok(false) => ConnectorOutcome::failed("action validation failed"),
                    Err(e) => ConnectorOutcome::failed(format!("validation error: {e}")),
                }
            }
        };

        let success = outcome.success;
        let error = (!success).then(|| outcome.message.clone());
        let rollback_handle = outcome.rollback_handle.clone();
        self.finish_action(plan, action.action_id, Some(connector_type), outcome)
            .await;

        metrics::increment_counter!(
            "hornet_actions_total",
            "action_type" => action.action_type.clone(),
            "status" => if success { "completed" } else { "failed" }
        );

        ExecutionRecord {
            action_id: action.action_id,
            disposition: if success {
                ExecutionDisposition::Completed
            } else {
                ExecutionDisposition::Failed
            },
            connector: Some(connector_type),
            error,
            rollback_handle,
        }
    }

    async fn finish_action(
        &self,
        plan: &ExecutionPlan,
        action_id: Uuid,
        connector: Option<&'static str>,
        outcome: ConnectorOutcome,
    ) {
        let status = if outcome.success {
            ActionStatus::Completed
        } else {
            ActionStatus::Failed
        };
        let update = ActionUpdate {
            status: Some(status),
            result: Some(json!({
                "success": outcome.success,
                "message": outcome.message,
                "data": outcome.data,
                "connector": connector,
            })),
            rollback_handle: outcome.rollback_handle,
            ..Default::default()
        };
        if let Err(e) = self.storage.update_action(plan.tenant_id, action_id, update).await {
            tracing::error!(%action_id, error = %e, "action result persist failed");
        }
    }

    /// Roll back every completed action of an incident, newest first. Only
    /// invoked explicitly; plain failures never trigger it.
    pub async fn rollback_incident(
        &self,
        tenant_id: Uuid,
        incident_id: Uuid,
    ) -> Result<Vec<ExecutionRecord>, HornetError> {
        let mut actions = self.storage.list_actions(tenant_id, incident_id).await?;
        actions.reverse();

        let mut records = Vec::new();
        for action in actions {
            let Some(handle) = action.rollback_handle.clone() else {
                continue;
            };
            if action.status != ActionStatus::Completed {
                continue;
            }
            let Some(connector_type) = connector_type_for(&action.action_type) else {
                continue;
            };
            let Some(connector) = self.connector(connector_type) else {
                tracing::warn!(action_id = %action.id, connector_type, "rollback connector missing");
                continue;
            };

            match connector.rollback(&handle).await {
                Ok(outcome) if outcome.success => {
                    self.storage
                        .update_action(
                            tenant_id,
                            action.id,
                            ActionUpdate {
                                status: Some(ActionStatus::RolledBack),
                                ..Default::default()
                            },
                        )
                        .await?;
                    tracing::info!(action_id = %action.id, "action rolled back");
                    records.push(ExecutionRecord {
                        action_id: action.id,
                        disposition: ExecutionDisposition::Completed,
                        connector: Some(connector_type),
                        error: None,
                        rollback_handle: None,
                    });
                }
                Ok(outcome) => {
                    tracing::error!(action_id = %action.id, message = %outcome.message, "rollback rejected");
                    records.push(ExecutionRecord {
                        action_id: action.id,
                        disposition: ExecutionDisposition::Failed,
                        connector: Some(connector_type),
                        error: Some(outcome.message),
                        rollback_handle: None,
                    });
                }
                Err(e) => {
                    tracing::error!(action_id = %action.id, error = %e, "rollback failed");
                    records.push(ExecutionRecord {
                        action_id: action.id,
                        disposition: ExecutionDisposition::Failed,
                        connector: Some(connector_type),
                        error: Some(e.to_string()),
                        rollback_handle: None,
                    });
                }
            }
        }
        Ok(records)
    }
}

/// Connector that records calls and succeeds or fails on command. Stands in
/// for real drivers in development and tests.
pub struct MockConnector {
    name: String,
    fail_execute: bool,
    fail_validate: bool,
    calls: parking_lot::Mutex<Vec<String>>,
    rollbacks: parking_lot::Mutex<Vec<String>>,
    counter: std::sync::atomic::AtomicU64,
}

impl MockConnector {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fail_execute: false,
            fail_validate: false,
            calls: parking_lot::Mutex::new(Vec::new()),
            rollbacks: parking_lot::Mutex::new(Vec::new()),
            counter: std::sync::atomic::AtomicU64::new(0),
        }
    }

    pub fn failing(mut self) -> Self {
        self.fail_execute = true;
        self
    }

    pub fn rejecting_validation(mut self) -> Self {
        self.fail_validate = true;
        self
    }

    /// Executed `action_type:target` pairs, in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Rollback handles received, in call order.
    pub fn rollbacks(&self) -> Vec<String> {
        self.rollbacks.lock().clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn validate(
        &self,
        _action_type: &str,
        _target: &str,
        _parameters: &serde_json::Value,
    ) -> Result<bool, HornetError> {
        Ok(!self.fail_validate)
    }

    async fn execute(
        &self,
        action_type: &str,
        target: &str,
        _parameters: &serde_json::Value,
    ) -> Result<ConnectorOutcome, HornetError> {
        self.calls.lock().push(format!("{action_type}:{target}"));
        if self.fail_execute {
            return Ok(ConnectorOutcome::failed("mock failure"));
        }
        let n = self
            .counter
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(ConnectorOutcome::ok(
            json!({"target": target}),
            Some(format!("{}-rollback-{n}", self.name)),
        ))
    }

    async fn rollback(&self, rollback_handle: &str) -> Result<ConnectorOutcome, HornetError> {
        self.rollbacks.lock().push(rollback_handle.to_string());
        Ok(ConnectorOutcome::ok(serde_json::Value::Null, None))
    }

    async fn health_check(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use hornet_store::MemoryStorage;
    use hornet_types::{Action, ActionRisk};

    async fn seed_action(
        storage: &MemoryStorage,
        tenant: Uuid,
        incident: Uuid,
        action_type: &str,
        target: &str,
    ) -> Uuid {
        let action = Action {
            id: Uuid::new_v4(),
            incident_id: incident,
            tenant_id: tenant,
            action_type: action_type.into(),
            target: target.into(),
            parameters: json!({}),
            risk_level: ActionRisk::Medium,
            status: ActionStatus::Proposed,
            proposed_by: "responder".into(),
            proposed_at: Utc::now(),
            approved_by: Some("oversight".into()),
            approved_at: None,
            executed_at: None,
            result: None,
            rollback_plan: json!({}),
            rollback_handle: None,
            justification: String::new(),
            veto_reason: None,
        };
        storage.insert_action(tenant, &action).await.unwrap();
        storage
            .update_action(
                tenant,
                action.id,
                ActionUpdate {
                    status: Some(ActionStatus::Approved),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        action.id
    }

    fn plan_for(
        tenant: Uuid,
        incident: Uuid,
        actions: Vec<(Uuid, &str, &str)>,
        groups: Vec<Vec<Uuid>>,
        dependencies: HashMap<Uuid, Vec<Uuid>>,
    ) -> ExecutionPlan {
        ExecutionPlan {
            incident_id: incident,
            tenant_id: tenant,
            actions: actions
                .into_iter()
                .map(|(id, action_type, target)| PlannedAction {
                    action_id: id,
                    action_type: action_type.into(),
                    target: target.into(),
                    parameters: json!({}),
                })
                .collect(),
            parallel_groups: groups,
            dependencies,
        }
    }

    #[tokio::test]
    async fn test_plan_executes_groups_in_order() {
        let storage = Arc::new(MemoryStorage::new());
        let executor = ActionExecutor::new(storage.clone(), Duration::from_secs(5));
        let firewall = Arc::new(MockConnector::new("firewall"));
        executor.register_connector("firewall", firewall.clone());

        let tenant = Uuid::new_v4();
        let incident = Uuid::new_v4();
        let a = seed_action(&storage, tenant, incident, "block_ip", "1.1.1.1").await;
        let b = seed_action(&storage, tenant, incident, "block_ip", "2.2.2.2").await;

        let plan = plan_for(
            tenant,
            incident,
            vec![(a, "block_ip", "1.1.1.1"), (b, "block_ip", "2.2.2.2")],
            vec![vec![a], vec![b]],
            HashMap::new(),
        );
        let records = executor.execute_plan(&plan).await;

        assert_eq!(records.len(), 2);
        assert!(records
            .iter()
            .all(|r| r.disposition == ExecutionDisposition::Completed));
        assert_eq!(firewall.calls(), vec!["block_ip:1.1.1.1", "block_ip:2.2.2.2"]);

        let actions = storage.list_actions(tenant, incident).await.unwrap();
        assert!(actions.iter().all(|a| a.status == ActionStatus::Completed));
        assert!(actions.iter().all(|a| a.rollback_handle.is_some()));
    }

    #[tokio::test]
    async fn test_failed_predecessor_blocks_dependents() {
        let storage = Arc::new(MemoryStorage::new());
        let executor = ActionExecutor::new(storage.clone(), Duration::from_secs(5));
        executor.register_connector("firewall", Arc::new(MockConnector::new("firewall").failing()));
        let identity = Arc::new(MockConnector::new("identity"));
        executor.register_connector("identity", identity.clone());

        let tenant = Uuid::new_v4();
        let incident = Uuid::new_v4();
        let a = seed_action(&storage, tenant, incident, "block_ip", "1.1.1.1").await;
        let b = seed_action(&storage, tenant, incident, "disable_account", "jdoe").await;

        let mut dependencies = HashMap::new();
        dependencies.insert(b, vec![a]);
        let plan = plan_for(
            tenant,
            incident,
            vec![(a, "block_ip", "1.1.1.1"), (b, "disable_account", "jdoe")],
            vec![vec![a], vec![b]],
            dependencies,
        );
        let records = executor.execute_plan(&plan).await;

        assert_eq!(records[0].disposition, ExecutionDisposition::Failed);
        assert_eq!(records[1].disposition, ExecutionDisposition::Blocked);
        // The blocked action never reached its connector.
        assert!(identity.calls().is_empty());
    }

    #[tokio::test]
    async fn test_failure_does_not_cancel_group_peers() {
        let storage = Arc::new(MemoryStorage::new());
        let executor = ActionExecutor::new(storage.clone(), Duration::from_secs(5));
        executor.register_connector("firewall", Arc::new(MockConnector::new("firewall").failing()));
        let identity = Arc::new(MockConnector::new("identity"));
        executor.register_connector("identity", identity.clone());

        let tenant = Uuid::new_v4();
        let incident = Uuid::new_v4();
        let a = seed_action(&storage, tenant, incident, "block_ip", "1.1.1.1").await;
        let b = seed_action(&storage, tenant, incident, "disable_account", "jdoe").await;

        let plan = plan_for(
            tenant,
            incident,
            vec![(a, "block_ip", "1.1.1.1"), (b, "disable_account", "jdoe")],
            vec![vec![a, b]],
            HashMap::new(),
        );
        let records = executor.execute_plan(&plan).await;

        let completed = records
            .iter()
            .filter(|r| r.disposition == ExecutionDisposition::Completed)
            .count();
        assert_eq!(completed, 1);
        assert_eq!(identity.calls(), vec!["disable_account:jdoe"]);
    }

    #[tokio::test]
    async fn test_notification_completes_without_connector() {
        let storage = Arc::new(MemoryStorage::new());
        let executor = ActionExecutor::new(storage.clone(), Duration::from_secs(5));

        let tenant = Uuid::new_v4();
        let incident = Uuid::new_v4();
        let a = seed_action(&storage, tenant, incident, "notify_team", "soc").await;

        let plan = plan_for(
            tenant,
            incident,
            vec![(a, "notify_team", "soc")],
            vec![vec![a]],
            HashMap::new(),
        );
        let records = executor.execute_plan(&plan).await;
        assert_eq!(records[0].disposition, ExecutionDisposition::Completed);
    }

    #[tokio::test]
    async fn test_rollback_walks_in_reverse() {
        let storage = Arc::new(MemoryStorage::new());
        let executor = ActionExecutor::new(storage.clone(), Duration::from_secs(5));
        let firewall = Arc::new(MockConnector::new("firewall"));
        executor.register_connector("firewall", firewall.clone());

        let tenant = Uuid::new_v4();
        let incident = Uuid::new_v4();
        let a = seed_action(&storage, tenant, incident, "block_ip", "1.1.1.1").await;
        let b = seed_action(&storage, tenant, incident, "block_ip", "2.2.2.2").await;

        let plan = plan_for(
            tenant,
            incident,
            vec![(a, "block_ip", "1.1.1.1"), (b, "block_ip", "2.2.2.2")],
            vec![vec![a], vec![b]],
            HashMap::new(),
        );
        executor.execute_plan(&plan).await;

        let records = executor.rollback_incident(tenant, incident).await.unwrap();
        assert_eq!(records.len(), 2);
        // Newest handle first.
        assert_eq!(
            firewall.rollbacks(),
            vec!["firewall-rollback-1", "firewall-rollback-0"]
        );
        let actions = storage.list_actions(tenant, incident).await.unwrap();
        assert!(actions.iter().all(|a| a.status == ActionStatus::RolledBack));
    }

    #[tokio::test]
    async fn test_validation_rejection_fails_action() {
        let storage = Arc::new(MemoryStorage::new());
        let executor = ActionExecutor::new(storage.clone(), Duration::from_secs(5));
        executor.register_connector(
            "firewall",
            Arc::new(MockConnector::new("firewall").rejecting_validation()),
        );

        let tenant = Uuid::new_v4();
        let incident = Uuid::new_v4();
        let a = seed_action(&storage, tenant, incident, "block_ip", "1.1.1.1").await;

        let plan = plan_for(
            tenant,
            incident,
            vec![(a, "block_ip", "1.1.1.1")],
            vec![vec![a]],
            HashMap::new(),
        );
        let records = executor.execute_plan(&plan).await;
        assert_eq!(records[0].disposition, ExecutionDisposition::Failed);
        assert_eq!(records[0].error.as_deref(), Some("action validation failed"));
    }
}
