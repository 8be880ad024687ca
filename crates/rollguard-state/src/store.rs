//! StateStore — redb-backed state persistence for rollguard.
//!
//! Provides typed operations over deployment reports, rollback settings,
//! instance reports, and archived monitoring sessions. All values are
//! JSON-serialized into redb's `&[u8]` value columns. The store supports
//! both on-disk and in-memory backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

fn check_segment(field: &'static str, value: &str) -> StateResult<()> {
    if is_valid_key_segment(value) {
        Ok(())
    } else {
        Err(StateError::InvalidKey {
            field,
            value: value.to_string(),
        })
    }
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        for table in [DEPLOYMENTS, SETTINGS, INSTANCES, SESSIONS] {
            txn.open_table(table).map_err(map_err!(Table))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn put_json<T: Serialize>(&self, table: JsonTable, key: &str, value: &T) -> StateResult<()> {
        let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            t.insert(key, bytes.as_slice()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get_json<T: DeserializeOwned>(&self, table: JsonTable, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table).map_err(map_err!(Table))?;
        match t.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn scan_prefix<T: DeserializeOwned>(&self, table: JsonTable, prefix: &str) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in t.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(prefix) {
                let item = serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(item);
            }
        }
        Ok(results)
    }

    // ── Deployments ────────────────────────────────────────────────

    /// Insert or update a deployment report. Returns the previous record.
    ///
    /// The read of the previous record and the write happen in one
    /// transaction, so status regressions and `is_rollback` changes are
    /// rejected atomically.
    pub fn put_deployment(&self, deployment: &Deployment) -> StateResult<Option<Deployment>> {
        check_segment("application_id", &deployment.application_id)?;
        check_segment("deployment id", &deployment.id)?;
        let key = deployment.table_key();
        let value = serde_json::to_vec(deployment).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let previous = {
            let mut table = txn.open_table(DEPLOYMENTS).map_err(map_err!(Table))?;
            let previous: Option<Deployment> = match table.get(key.as_str()).map_err(map_err!(Read))? {
                Some(guard) => {
                    Some(serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?)
                }
                None => None,
            };
            if let Some(prev) = &previous {
                if !prev.status.can_transition_to(deployment.status) {
                    return Err(StateError::InvalidTransition {
                        id: deployment.id.clone(),
                        from: prev.status.to_string(),
                        to: deployment.status.to_string(),
                    });
                }
                if prev.is_rollback != deployment.is_rollback {
                    return Err(StateError::RollbackFlagChanged(deployment.id.clone()));
                }
            }
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
            previous
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, status = %deployment.status, "deployment stored");
        Ok(previous)
    }

    /// Get one deployment of an application.
    pub fn get_deployment(
        &self,
        application_id: &str,
        deployment_id: &str,
    ) -> StateResult<Option<Deployment>> {
        self.get_json(DEPLOYMENTS, &deployment_key(application_id, deployment_id))
    }

    /// All deployments of an application, oldest first.
    pub fn list_deployments_for_application(
        &self,
        application_id: &str,
    ) -> StateResult<Vec<Deployment>> {
        let mut deployments: Vec<Deployment> =
            self.scan_prefix(DEPLOYMENTS, &format!("{application_id}/"))?;
        deployments.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        Ok(deployments)
    }

    /// Newest finished deployment requested before `deployment`, i.e. the
    /// revision a rollback returns to. Pull request previews never qualify.
    pub fn previous_successful_deployment(
        &self,
        application_id: &str,
        deployment: &Deployment,
    ) -> StateResult<Option<Deployment>> {
        Ok(self
            .list_deployments_for_application(application_id)?
            .into_iter()
            .rev()
            .find(|d| {
                d.id != deployment.id
                    && d.status == DeploymentStatus::Finished
                    && !d.is_pull_request()
                    && deployment.is_newer_than(d)
            }))
    }

    /// Whether a newer, non-cancelled, non-preview deployment exists for the
    /// application.
    pub fn has_newer_deployment(
        &self,
        application_id: &str,
        deployment: &Deployment,
    ) -> StateResult<bool> {
        Ok(self
            .list_deployments_for_application(application_id)?
            .iter()
            .any(|d| d.supersedes(deployment)))
    }

    // ── Settings ───────────────────────────────────────────────────

    /// Replace an application's rollback settings.
    pub fn put_settings(&self, application_id: &str, settings: &RollbackSettings) -> StateResult<()> {
        check_segment("application_id", application_id)?;
        let settings = settings.clone().normalized();
        self.put_json(SETTINGS, application_id, &settings)?;
        debug!(%application_id, enabled = settings.auto_rollback_enabled, "settings stored");
        Ok(())
    }

    /// An application's rollback settings; the disabled defaults when none
    /// were ever stored.
    pub fn get_settings(&self, application_id: &str) -> StateResult<RollbackSettings> {
        let settings: Option<RollbackSettings> = self.get_json(SETTINGS, application_id)?;
        Ok(settings.unwrap_or_default().normalized())
    }

    // ── Instances ──────────────────────────────────────────────────

    /// Insert or update an instance report.
    pub fn put_instance(&self, instance: &InstanceState) -> StateResult<()> {
        check_segment("application_id", &instance.application_id)?;
        check_segment("deployment_id", &instance.deployment_id)?;
        self.put_json(INSTANCES, &instance.table_key(), instance)
    }

    /// List all instances reported for one deployment of an application.
    pub fn list_instances_for_deployment(
        &self,
        application_id: &str,
        deployment_id: &str,
    ) -> StateResult<Vec<InstanceState>> {
        let prefix = format!("{}:", deployment_key(application_id, deployment_id));
        self.scan_prefix(INSTANCES, &prefix)
    }

    /// Total restarts across a deployment's instances; `None` when no
    /// instance was ever reported.
    pub fn restart_count_for_deployment(
        &self,
        application_id: &str,
        deployment_id: &str,
    ) -> StateResult<Option<u32>> {
        let instances = self.list_instances_for_deployment(application_id, deployment_id)?;
        if instances.is_empty() {
            return Ok(None);
        }
        Ok(Some(
            instances
                .iter()
                .map(|i| i.restart_count)
                .fold(0u32, u32::saturating_add),
        ))
    }

    // ── Sessions ───────────────────────────────────────────────────

    /// Archive a monitoring session record.
    pub fn put_session(&self, record: &SessionRecord) -> StateResult<()> {
        let key = record.table_key();
        self.put_json(SESSIONS, &key, record)?;
        debug!(%key, status = %record.status, "session archived");
        Ok(())
    }

    /// Get the archived session for one deployment.
    pub fn get_session(
        &self,
        application_id: &str,
        deployment_id: &str,
    ) -> StateResult<Option<SessionRecord>> {
        self.get_json(SESSIONS, &session_key(application_id, deployment_id))
    }

    /// Archived sessions for an application, oldest first.
    pub fn list_sessions_for_application(
        &self,
        application_id: &str,
    ) -> StateResult<Vec<SessionRecord>> {
        let mut records: Vec<SessionRecord> =
            self.scan_prefix(SESSIONS, &format!("{application_id}:"))?;
        records.sort_by_key(|r| r.started_at);
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_deployment(app: &str, id: &str, created_at: u64, status: DeploymentStatus) -> Deployment {
        Deployment {
            id: id.to_string(),
            application_id: app.to_string(),
            status,
            is_rollback: false,
            pull_request_id: None,
            commit: Some("abc123".to_string()),
            created_at,
            updated_at: created_at,
        }
    }

    fn test_instance(deployment_id: &str, index: u32, restarts: u32) -> InstanceState {
        app_instance("app", deployment_id, index, restarts)
    }

    fn app_instance(app: &str, deployment_id: &str, index: u32, restarts: u32) -> InstanceState {
        InstanceState {
            id: format!("inst-{index}"),
            application_id: app.to_string(),
            deployment_id: deployment_id.to_string(),
            address: format!("127.0.0.1:{}", 9000 + index),
            status: InstanceStatus::Running,
            restart_count: restarts,
            started_at: 1000,
            updated_at: 1000,
        }
    }

    fn test_record(app: &str, deployment_id: &str, started_at: u64) -> SessionRecord {
        SessionRecord {
            application_id: app.to_string(),
            deployment_id: deployment_id.to_string(),
            rollback_target: "d0".to_string(),
            status: SessionStatus::Succeeded,
            reason: None,
            total_checks: 10,
            checks_performed: 10,
            consecutive_failures: 0,
            rollback_succeeded: None,
            started_at,
            finished_at: Some(started_at + 300),
        }
    }

    // ── Deployments ────────────────────────────────────────────────

    #[test]
    fn deployment_put_and_get() {
        let store = StateStore::open_in_memory().unwrap();
        let d = test_deployment("app", "d1", 1000, DeploymentStatus::Queued);

        assert!(store.put_deployment(&d).unwrap().is_none());
        assert_eq!(store.get_deployment("app", "d1").unwrap(), Some(d));
        assert!(store.get_deployment("app", "nope").unwrap().is_none());
    }

    #[test]
    fn deployment_update_returns_previous() {
        let store = StateStore::open_in_memory().unwrap();
        let mut d = test_deployment("app", "d1", 1000, DeploymentStatus::InProgress);
        store.put_deployment(&d).unwrap();

        d.status = DeploymentStatus::Finished;
        let prev = store.put_deployment(&d).unwrap().unwrap();
        assert_eq!(prev.status, DeploymentStatus::InProgress);
    }

    #[test]
    fn deployment_status_regression_rejected() {
        let store = StateStore::open_in_memory().unwrap();
        let mut d = test_deployment("app", "d1", 1000, DeploymentStatus::Finished);
        store.put_deployment(&d).unwrap();

        d.status = DeploymentStatus::InProgress;
        let err = store.put_deployment(&d).unwrap_err();
        assert!(matches!(err, StateError::InvalidTransition { .. }));

        let stored = store.get_deployment("app", "d1").unwrap().unwrap();
        assert_eq!(stored.status, DeploymentStatus::Finished);
    }

    #[test]
    fn deployment_rollback_flag_is_immutable() {
        let store = StateStore::open_in_memory().unwrap();
        let mut d = test_deployment("app", "d1", 1000, DeploymentStatus::Queued);
        store.put_deployment(&d).unwrap();

        d.is_rollback = true;
        let err = store.put_deployment(&d).unwrap_err();
        assert!(matches!(err, StateError::RollbackFlagChanged(_)));
    }

    #[test]
    fn deployments_listed_per_application_in_order() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_deployment(&test_deployment("app", "b", 2000, DeploymentStatus::Finished)).unwrap();
        store.put_deployment(&test_deployment("app", "a", 1000, DeploymentStatus::Finished)).unwrap();
        store.put_deployment(&test_deployment("other", "c", 1500, DeploymentStatus::Finished)).unwrap();

        let ids: Vec<_> = store
            .list_deployments_for_application("app")
            .unwrap()
            .into_iter()
            .map(|d| d.id)
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn previous_successful_skips_failed_and_newer() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_deployment(&test_deployment("app", "d1", 1000, DeploymentStatus::Finished)).unwrap();
        store.put_deployment(&test_deployment("app", "d2", 2000, DeploymentStatus::Failed)).unwrap();
        let current = test_deployment("app", "d3", 3000, DeploymentStatus::Finished);
        store.put_deployment(&current).unwrap();
        store.put_deployment(&test_deployment("app", "d4", 4000, DeploymentStatus::Finished)).unwrap();

        let prev = store.previous_successful_deployment("app", &current).unwrap().unwrap();
        assert_eq!(prev.id, "d1");
    }

    #[test]
    fn previous_successful_skips_pull_request_previews() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_deployment(&test_deployment("app", "d1", 1000, DeploymentStatus::Finished)).unwrap();
        let mut preview = test_deployment("app", "pr7", 1500, DeploymentStatus::Finished);
        preview.pull_request_id = Some(7);
        store.put_deployment(&preview).unwrap();
        let current = test_deployment("app", "d2", 2000, DeploymentStatus::Finished);
        store.put_deployment(&current).unwrap();

        let prev = store.previous_successful_deployment("app", &current).unwrap().unwrap();
        assert_eq!(prev.id, "d1");
    }

    #[test]
    fn previous_successful_none_for_first_deployment() {
        let store = StateStore::open_in_memory().unwrap();
        let first = test_deployment("app", "d1", 1000, DeploymentStatus::Finished);
        store.put_deployment(&first).unwrap();
        assert!(store.previous_successful_deployment("app", &first).unwrap().is_none());
    }

    #[test]
    fn newer_deployment_detection_ignores_cancelled() {
        let store = StateStore::open_in_memory().unwrap();
        let current = test_deployment("app", "d1", 1000, DeploymentStatus::Finished);
        store.put_deployment(&current).unwrap();
        assert!(!store.has_newer_deployment("app", &current).unwrap());

        store.put_deployment(&test_deployment("app", "d2", 2000, DeploymentStatus::Cancelled)).unwrap();
        assert!(!store.has_newer_deployment("app", &current).unwrap());

        store.put_deployment(&test_deployment("app", "d3", 3000, DeploymentStatus::Queued)).unwrap();
        assert!(store.has_newer_deployment("app", &current).unwrap());
    }

    #[test]
    fn newer_pull_request_preview_is_not_a_successor() {
        let store = StateStore::open_in_memory().unwrap();
        let current = test_deployment("app", "d1", 1000, DeploymentStatus::Finished);
        store.put_deployment(&current).unwrap();

        let mut preview = test_deployment("app", "pr9", 2000, DeploymentStatus::InProgress);
        preview.pull_request_id = Some(9);
        store.put_deployment(&preview).unwrap();
        assert!(!store.has_newer_deployment("app", &current).unwrap());
    }

    #[test]
    fn ids_with_key_separators_are_rejected() {
        let store = StateStore::open_in_memory().unwrap();

        let err = store
            .put_deployment(&test_deployment("team/app", "d1", 1000, DeploymentStatus::Queued))
            .unwrap_err();
        assert!(matches!(err, StateError::InvalidKey { .. }));
        let err = store
            .put_deployment(&test_deployment("app", "d:1", 1000, DeploymentStatus::Queued))
            .unwrap_err();
        assert!(matches!(err, StateError::InvalidKey { .. }));
        assert!(store.put_settings("app:x", &RollbackSettings::default()).is_err());
        assert!(store.put_instance(&app_instance("", "d1", 0, 0)).is_err());
        assert!(store.list_deployments_for_application("team").unwrap().is_empty());
    }

    // ── Settings ───────────────────────────────────────────────────

    #[test]
    fn missing_settings_read_as_disabled() {
        let store = StateStore::open_in_memory().unwrap();
        let settings = store.get_settings("app").unwrap();
        assert!(!settings.auto_rollback_enabled);
        assert_eq!(settings.rollback_validation_seconds, DEFAULT_VALIDATION_SECS);
    }

    #[test]
    fn settings_normalized_on_write() {
        let store = StateStore::open_in_memory().unwrap();
        let settings = RollbackSettings {
            auto_rollback_enabled: true,
            rollback_validation_seconds: 0,
            ..Default::default()
        };
        store.put_settings("app", &settings).unwrap();

        let stored = store.get_settings("app").unwrap();
        assert!(stored.auto_rollback_enabled);
        assert_eq!(stored.rollback_validation_seconds, DEFAULT_VALIDATION_SECS);
    }

    // ── Instances ──────────────────────────────────────────────────

    #[test]
    fn instances_listed_per_deployment() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_instance(&test_instance("d1", 0, 1)).unwrap();
        store.put_instance(&test_instance("d1", 1, 2)).unwrap();
        store.put_instance(&test_instance("d2", 0, 7)).unwrap();

        assert_eq!(store.list_instances_for_deployment("app", "d1").unwrap().len(), 2);
        assert_eq!(store.restart_count_for_deployment("app", "d1").unwrap(), Some(3));
        assert_eq!(store.restart_count_for_deployment("app", "missing").unwrap(), None);
    }

    #[test]
    fn instances_scoped_to_their_application() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_instance(&app_instance("api", "1", 0, 0)).unwrap();
        store.put_instance(&app_instance("web", "1", 0, 9)).unwrap();

        let api = store.list_instances_for_deployment("api", "1").unwrap();
        assert_eq!(api.len(), 1);
        assert_eq!(api[0].application_id, "api");
        assert_eq!(store.restart_count_for_deployment("api", "1").unwrap(), Some(0));
        assert_eq!(store.restart_count_for_deployment("web", "1").unwrap(), Some(9));
    }

    #[test]
    fn instance_update_in_place() {
        let store = StateStore::open_in_memory().unwrap();
        let mut inst = test_instance("d1", 0, 0);
        store.put_instance(&inst).unwrap();

        inst.restart_count = 4;
        inst.status = InstanceStatus::Restarting;
        store.put_instance(&inst).unwrap();

        let all = store.list_instances_for_deployment("app", "d1").unwrap();
        assert_eq!(all, vec![inst]);
    }

    // ── Sessions ───────────────────────────────────────────────────

    #[test]
    fn sessions_archived_per_application() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_session(&test_record("app", "d2", 2000)).unwrap();
        store.put_session(&test_record("app", "d1", 1000)).unwrap();
        store.put_session(&test_record("other", "d9", 1500)).unwrap();

        let records = store.list_sessions_for_application("app").unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].deployment_id, "d1");
        assert!(store.get_session("app", "d2").unwrap().is_some());
        assert!(store.get_session("app", "d9").unwrap().is_none());
        let other = store.get_session("other", "d9").unwrap().unwrap();
        assert_eq!(other.table_key(), session_key("other", "d9"));
    }

    // ── Persistence ────────────────────────────────────────────────

    #[test]
    fn persistent_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rollguard.redb");

        {
            let store = StateStore::open(&path).unwrap();
            store
                .put_deployment(&test_deployment("app", "d1", 1000, DeploymentStatus::Finished))
                .unwrap();
        }

        let store = StateStore::open(&path).unwrap();
        assert!(store.get_deployment("app", "d1").unwrap().is_some());
    }
}
