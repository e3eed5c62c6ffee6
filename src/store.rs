//! Database store for delegate tasks and selection logs
//!
//! Timestamps are stored as epoch milliseconds. Set-valued task fields are
//! stored as JSON text.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::dispatch::selection_log::SelectionLogEntry;
use crate::dispatch::task::{DelegateTask, TaskStatus};
use crate::error::{DispatchError, Result};

const SCHEMA: &str = include_str!("../migrations/20240601000000_dispatch.sql");

const TASK_COLUMNS: &str = r#"
    id, account_id, description, payload, capabilities, selectors, setup_abstractions,
    status, version, created_at, updated_at, expires_at, started_at, delegate_id,
    eligible_delegate_ids, excluded_delegate_ids, validating_delegate_ids,
    validation_results, offered_delegate_ids, offered_at, attempts, max_retries, result,
    error_message, abort_notified
"#;

/// Database store
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create the tables if they do not exist. The binary runs the migration
    /// through `sqlx::migrate!`; tests and embedded users call this instead.
    pub async fn ensure_schema(&self) -> Result<()> {
        for statement in SCHEMA.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    // Task operations

    pub async fn insert_task(&self, task: &DelegateTask) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO delegate_tasks (
                id, account_id, description, payload, capabilities, selectors, setup_abstractions,
                status, version, created_at, updated_at, expires_at, started_at, delegate_id,
                eligible_delegate_ids, excluded_delegate_ids, validating_delegate_ids,
                validation_results, offered_delegate_ids, offered_at, attempts, max_retries,
                result, error_message, abort_notified
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(task.id.to_string())
        .bind(&task.account_id)
        .bind(&task.description)
        .bind(serde_json::to_string(&task.payload)?)
        .bind(serde_json::to_string(&task.capabilities)?)
        .bind(serde_json::to_string(&task.selectors)?)
        .bind(serde_json::to_string(&task.setup_abstractions)?)
        .bind(task.status.as_str())
        .bind(task.version)
        .bind(task.created_at.timestamp_millis())
        .bind(task.updated_at.timestamp_millis())
        .bind(task.expires_at.timestamp_millis())
        .bind(task.started_at.map(|t| t.timestamp_millis()))
        .bind(&task.delegate_id)
        .bind(serde_json::to_string(&task.eligible_delegate_ids)?)
        .bind(serde_json::to_string(&task.excluded_delegate_ids)?)
        .bind(serde_json::to_string(&task.validating_delegate_ids)?)
        .bind(serde_json::to_string(&task.validation_results)?)
        .bind(serde_json::to_string(&task.offered_delegate_ids)?)
        .bind(task.offered_at.map(|t| t.timestamp_millis()))
        .bind(i64::from(task.attempts))
        .bind(i64::from(task.max_retries))
        .bind(task.result.as_ref().map(serde_json::to_string).transpose()?)
        .bind(&task.error_message)
        .bind(task.abort_notified)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn find_task(&self, account_id: &str, id: Uuid) -> Result<Option<DelegateTask>> {
        let row = sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {} FROM delegate_tasks WHERE id = ? AND account_id = ?",
            TASK_COLUMNS
        ))
        .bind(id.to_string())
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(TryInto::try_into).transpose()
    }

    pub async fn list_tasks_by_status(&self, status: TaskStatus) -> Result<Vec<DelegateTask>> {
        let rows = sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {} FROM delegate_tasks WHERE status = ? ORDER BY created_at, id",
            TASK_COLUMNS
        ))
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    pub async fn list_account_tasks_by_status(
        &self,
        account_id: &str,
        status: TaskStatus,
    ) -> Result<Vec<DelegateTask>> {
        let rows = sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {} FROM delegate_tasks WHERE account_id = ? AND status = ? ORDER BY created_at, id",
            TASK_COLUMNS
        ))
        .bind(account_id)
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    pub async fn list_started_for_delegate(&self, delegate_id: &str) -> Result<Vec<DelegateTask>> {
        let rows = sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {} FROM delegate_tasks WHERE delegate_id = ? AND status = 'started' ORDER BY created_at, id",
            TASK_COLUMNS
        ))
        .bind(delegate_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    /// Queued tasks whose expiry is at or before `now`
    pub async fn list_overdue_queued(&self, now: DateTime<Utc>) -> Result<Vec<DelegateTask>> {
        let rows = sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {} FROM delegate_tasks WHERE status = 'queued' AND expires_at <= ? ORDER BY expires_at, id",
            TASK_COLUMNS
        ))
        .bind(now.timestamp_millis())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    /// Aborted tasks last owned by `delegate_id` that it has not been told about
    pub async fn list_unnotified_aborts(
        &self,
        account_id: &str,
        delegate_id: &str,
    ) -> Result<Vec<DelegateTask>> {
        let rows = sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {} FROM delegate_tasks WHERE account_id = ? AND delegate_id = ? AND status = 'aborted' AND abort_notified = 0 ORDER BY updated_at, id",
            TASK_COLUMNS
        ))
        .bind(account_id)
        .bind(delegate_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    /// Flag an abort notice as delivered. Returns false if someone else got there first.
    pub async fn mark_abort_notified(&self, account_id: &str, id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE delegate_tasks
            SET abort_notified = 1
            WHERE id = ? AND account_id = ? AND status = 'aborted' AND abort_notified = 0
            "#,
        )
        .bind(id.to_string())
        .bind(account_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// The claim: `QUEUED → STARTED` only if nobody else wrote the task since
    /// `expected_version` was read. True iff this caller won.
    pub async fn claim_task(
        &self,
        account_id: &str,
        id: Uuid,
        delegate_id: &str,
        expected_version: i64,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let now_ms = now.timestamp_millis();
        let result = sqlx::query(
            r#"
            UPDATE delegate_tasks
            SET status = 'started', delegate_id = ?, started_at = ?, updated_at = ?, version = version + 1
            WHERE id = ? AND account_id = ? AND version = ?
              AND status = 'queued' AND delegate_id IS NULL AND expires_at > ?
            "#,
        )
        .bind(delegate_id)
        .bind(now_ms)
        .bind(now_ms)
        .bind(id.to_string())
        .bind(account_id)
        .bind(expected_version)
        .bind(now_ms)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Write every mutable field of `task` if the stored row still has
    /// `task.version` and `expected_status`. True iff the write happened.
    pub async fn replace_task(&self, task: &DelegateTask, expected_status: TaskStatus) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE delegate_tasks
            SET status = ?, version = version + 1, updated_at = ?, started_at = ?, delegate_id = ?,
                eligible_delegate_ids = ?, excluded_delegate_ids = ?, validating_delegate_ids = ?,
                validation_results = ?, offered_delegate_ids = ?, offered_at = ?, attempts = ?,
                result = ?, error_message = ?, abort_notified = ?
            WHERE id = ? AND account_id = ? AND version = ? AND status = ?
            "#,
        )
        .bind(task.status.as_str())
        .bind(task.updated_at.timestamp_millis())
        .bind(task.started_at.map(|t| t.timestamp_millis()))
        .bind(&task.delegate_id)
        .bind(serde_json::to_string(&task.eligible_delegate_ids)?)
        .bind(serde_json::to_string(&task.excluded_delegate_ids)?)
        .bind(serde_json::to_string(&task.validating_delegate_ids)?)
        .bind(serde_json::to_string(&task.validation_results)?)
        .bind(serde_json::to_string(&task.offered_delegate_ids)?)
        .bind(task.offered_at.map(|t| t.timestamp_millis()))
        .bind(i64::from(task.attempts))
        .bind(task.result.as_ref().map(serde_json::to_string).transpose()?)
        .bind(&task.error_message)
        .bind(task.abort_notified)
        .bind(task.id.to_string())
        .bind(&task.account_id)
        .bind(task.version)
        .bind(expected_status.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    // Selection log operations

    /// Insert entries in one transaction; rows already present are skipped
    pub async fn insert_selection_entries(&self, entries: &[SelectionLogEntry]) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;

        for entry in entries {
            let seq = entry
                .seq
                .ok_or_else(|| DispatchError::Internal("selection log entry without seq".to_string()))?;
            let result = sqlx::query(
                r#"
                INSERT OR IGNORE INTO selection_log_entries
                    (task_id, seq, account_id, delegate_id, kind, conclusion, reason, recorded_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(entry.task_id.to_string())
            .bind(i64::from(seq))
            .bind(&entry.account_id)
            .bind(&entry.delegate_id)
            .bind(entry.kind.as_str())
            .bind(entry.conclusion.as_str())
            .bind(&entry.reason)
            .bind(entry.recorded_at.timestamp_millis())
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected();
        }

        tx.commit().await?;
        Ok(inserted)
    }

    pub async fn fetch_selection_entries(
        &self,
        account_id: &str,
        task_id: Uuid,
    ) -> Result<Vec<SelectionLogEntry>> {
        let rows = sqlx::query_as::<_, SelectionLogRow>(
            r#"
            SELECT task_id, seq, account_id, delegate_id, kind, reason, recorded_at
            FROM selection_log_entries
            WHERE account_id = ? AND task_id = ?
            ORDER BY seq
            "#,
        )
        .bind(account_id)
        .bind(task_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    pub async fn max_selection_seq(&self, task_id: Uuid) -> Result<Option<u32>> {
        let max: Option<i64> =
            sqlx::query_scalar("SELECT MAX(seq) FROM selection_log_entries WHERE task_id = ?")
                .bind(task_id.to_string())
                .fetch_one(&self.pool)
                .await?;

        max.map(|m| {
            u32::try_from(m).map_err(|e| DispatchError::Internal(format!("Invalid seq: {}", e)))
        })
        .transpose()
    }
}

// Internal row types for sqlx

fn millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| DispatchError::Internal(format!("Invalid timestamp: {}", ms)))
}

fn count(value: i64, column: &str) -> Result<u32> {
    u32::try_from(value).map_err(|e| DispatchError::Internal(format!("Invalid {}: {}", column, e)))
}

#[derive(sqlx::FromRow)]
struct TaskRow {
    id: String,
    account_id: String,
    description: Option<String>,
    payload: String,
    capabilities: String,
    selectors: String,
    setup_abstractions: String,
    status: String,
    version: i64,
    created_at: i64,
    updated_at: i64,
    expires_at: i64,
    started_at: Option<i64>,
    delegate_id: Option<String>,
    eligible_delegate_ids: String,
    excluded_delegate_ids: String,
    validating_delegate_ids: String,
    validation_results: String,
    offered_delegate_ids: String,
    offered_at: Option<i64>,
    attempts: i64,
    max_retries: i64,
    result: Option<String>,
    error_message: Option<String>,
    abort_notified: bool,
}

impl TryFrom<TaskRow> for DelegateTask {
    type Error = DispatchError;

    fn try_from(row: TaskRow) -> Result<Self> {
        Ok(DelegateTask {
            id: Uuid::parse_str(&row.id)
                .map_err(|e| DispatchError::Internal(format!("Invalid UUID: {}", e)))?,
            account_id: row.account_id,
            description: row.description,
            payload: serde_json::from_str(&row.payload)?,
            capabilities: serde_json::from_str(&row.capabilities)?,
            selectors: serde_json::from_str(&row.selectors)?,
            setup_abstractions: serde_json::from_str(&row.setup_abstractions)?,
            status: row
                .status
                .parse()
                .map_err(|e| DispatchError::Internal(format!("Invalid status: {}", e)))?,
            version: row.version,
            created_at: millis(row.created_at)?,
            updated_at: millis(row.updated_at)?,
            expires_at: millis(row.expires_at)?,
            started_at: row.started_at.map(millis).transpose()?,
            delegate_id: row.delegate_id,
            eligible_delegate_ids: serde_json::from_str(&row.eligible_delegate_ids)?,
            excluded_delegate_ids: serde_json::from_str(&row.excluded_delegate_ids)?,
            validating_delegate_ids: serde_json::from_str(&row.validating_delegate_ids)?,
            validation_results: serde_json::from_str(&row.validation_results)?,
            offered_delegate_ids: serde_json::from_str(&row.offered_delegate_ids)?,
            offered_at: row.offered_at.map(millis).transpose()?,
            attempts: count(row.attempts, "attempts")?,
            max_retries: count(row.max_retries, "max_retries")?,
            result: row.result.as_deref().map(serde_json::from_str).transpose()?,
            error_message: row.error_message,
            abort_notified: row.abort_notified,
        })
    }
}

#[derive(sqlx::FromRow)]
struct SelectionLogRow {
    task_id: String,
    seq: i64,
    account_id: String,
    delegate_id: Option<String>,
    kind: String,
    reason: String,
    recorded_at: i64,
}

impl TryFrom<SelectionLogRow> for SelectionLogEntry {
    type Error = DispatchError;

    fn try_from(row: SelectionLogRow) -> Result<Self> {
        let kind: crate::dispatch::selection_log::DecisionKind = row
            .kind
            .parse()
            .map_err(|e| DispatchError::Internal(format!("Invalid decision kind: {}", e)))?;

        Ok(SelectionLogEntry {
            task_id: Uuid::parse_str(&row.task_id)
                .map_err(|e| DispatchError::Internal(format!("Invalid UUID: {}", e)))?,
            account_id: row.account_id,
            seq: Some(count(row.seq, "seq")?),
            delegate_id: row.delegate_id,
            kind,
            conclusion: kind.conclusion(),
            reason: row.reason,
            recorded_at: millis(row.recorded_at)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DispatchConfig;
    use crate::dispatch::selection_log::{Conclusion, DecisionKind};
    use crate::dispatch::task::TaskSubmission;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::time::Duration;

    async fn setup_test_db() -> Store {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory database");

        let store = Store::new(pool);
        store.ensure_schema().await.expect("Failed to create schema");
        store
    }

    fn make_task(account_id: &str) -> DelegateTask {
        let config = DispatchConfig::new(1, Duration::from_secs(60));
        DelegateTask::from_submission(
            TaskSubmission::new(account_id, serde_json::json!({"script": "echo hi"}))
                .with_selectors(["gpu"])
                .with_abstraction("envId", "prod"),
            &config,
            Utc::now(),
        )
        .unwrap()
    }

    fn entry(task_id: Uuid, seq: u32, kind: DecisionKind) -> SelectionLogEntry {
        SelectionLogEntry {
            task_id,
            account_id: "acct".to_string(),
            seq: Some(seq),
            delegate_id: Some("d-1".to_string()),
            kind,
            conclusion: kind.conclusion(),
            reason: "because".to_string(),
            recorded_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_ensure_schema_is_repeatable() {
        let store = setup_test_db().await;
        store.ensure_schema().await.unwrap();
    }

    #[tokio::test]
    async fn test_insert_and_find_task() {
        let store = setup_test_db().await;
        let task = make_task("acct");
        store.insert_task(&task).await.unwrap();

        let found = store.find_task("acct", task.id).await.unwrap().unwrap();
        assert_eq!(found.id, task.id);
        assert_eq!(found.status, TaskStatus::Queued);
        assert!(found.selectors.contains("gpu"));
        assert_eq!(found.setup_abstractions.get("envId").map(String::as_str), Some("prod"));
        assert_eq!(found.payload, serde_json::json!({"script": "echo hi"}));
        assert_eq!(found.expires_at.timestamp_millis(), task.expires_at.timestamp_millis());
    }

    #[tokio::test]
    async fn test_find_task_is_account_scoped() {
        let store = setup_test_db().await;
        let task = make_task("acct");
        store.insert_task(&task).await.unwrap();

        assert!(store.find_task("someone-else", task.id).await.unwrap().is_none());
        assert!(store.find_task("acct", Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_claim_task_succeeds_once() {
        let store = setup_test_db().await;
        let task = make_task("acct");
        store.insert_task(&task).await.unwrap();
        let now = Utc::now();

        assert!(store.claim_task("acct", task.id, "d-1", 0, now).await.unwrap());
        assert!(!store.claim_task("acct", task.id, "d-2", 0, now).await.unwrap());
        // a fresh read does not help either: the task is no longer queued
        assert!(!store.claim_task("acct", task.id, "d-2", 1, now).await.unwrap());

        let claimed = store.find_task("acct", task.id).await.unwrap().unwrap();
        assert_eq!(claimed.status, TaskStatus::Started);
        assert_eq!(claimed.delegate_id.as_deref(), Some("d-1"));
        assert_eq!(claimed.version, 1);
        assert!(claimed.started_at.is_some());
    }

    #[tokio::test]
    async fn test_claim_task_rejects_expired() {
        let store = setup_test_db().await;
        let task = make_task("acct");
        store.insert_task(&task).await.unwrap();

        let later = task.expires_at + chrono::Duration::seconds(1);
        assert!(!store.claim_task("acct", task.id, "d-1", 0, later).await.unwrap());
    }

    #[tokio::test]
    async fn test_replace_task_is_version_conditional() {
        let store = setup_test_db().await;
        let task = make_task("acct");
        store.insert_task(&task).await.unwrap();

        let mut aborted = task.clone();
        aborted.status = TaskStatus::Aborted;
        assert!(store.replace_task(&aborted, TaskStatus::Queued).await.unwrap());

        // stale version
        let mut expired = task.clone();
        expired.status = TaskStatus::Expired;
        assert!(!store.replace_task(&expired, TaskStatus::Queued).await.unwrap());

        let stored = store.find_task("acct", task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Aborted);
        assert_eq!(stored.version, 1);
    }

    #[tokio::test]
    async fn test_replace_task_persists_bookkeeping() {
        let store = setup_test_db().await;
        let mut task = make_task("acct");
        store.insert_task(&task).await.unwrap();

        task.eligible_delegate_ids = vec!["d-1".to_string(), "d-2".to_string()];
        task.excluded_delegate_ids.insert("d-3".to_string());
        task.attempts = 1;
        task.error_message = Some("boom".to_string());
        task.offered_delegate_ids.insert("d-1".to_string());
        task.offered_at = Some(task.created_at);
        assert!(store.replace_task(&task, TaskStatus::Queued).await.unwrap());

        let stored = store.find_task("acct", task.id).await.unwrap().unwrap();
        assert_eq!(stored.eligible_delegate_ids, vec!["d-1", "d-2"]);
        assert!(stored.excluded_delegate_ids.contains("d-3"));
        assert_eq!(stored.attempts, 1);
        assert_eq!(stored.error_message.as_deref(), Some("boom"));
        assert!(stored.offered_delegate_ids.contains("d-1"));
        assert_eq!(
            stored.offered_at.map(|t| t.timestamp_millis()),
            Some(task.created_at.timestamp_millis())
        );
    }

    #[tokio::test]
    async fn test_list_overdue_queued() {
        let store = setup_test_db().await;
        let task = make_task("acct");
        store.insert_task(&task).await.unwrap();

        assert!(store.list_overdue_queued(Utc::now()).await.unwrap().is_empty());
        let overdue = store.list_overdue_queued(task.expires_at).await.unwrap();
        assert_eq!(overdue.len(), 1);
    }

    #[tokio::test]
    async fn test_list_started_for_delegate() {
        let store = setup_test_db().await;
        let a = make_task("acct");
        let b = make_task("acct");
        store.insert_task(&a).await.unwrap();
        store.insert_task(&b).await.unwrap();
        store.claim_task("acct", a.id, "d-1", 0, Utc::now()).await.unwrap();

        let started = store.list_started_for_delegate("d-1").await.unwrap();
        assert_eq!(started.len(), 1);
        assert_eq!(started[0].id, a.id);
        assert_eq!(
            store.list_account_tasks_by_status("acct", TaskStatus::Queued).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn test_abort_notice_delivered_once() {
        let store = setup_test_db().await;
        let mut task = make_task("acct");
        task.delegate_id = Some("d-1".to_string());
        task.status = TaskStatus::Aborted;
        store.insert_task(&task).await.unwrap();

        assert_eq!(store.list_unnotified_aborts("acct", "d-1").await.unwrap().len(), 1);
        assert!(store.mark_abort_notified("acct", task.id).await.unwrap());
        assert!(!store.mark_abort_notified("acct", task.id).await.unwrap());
        assert!(store.list_unnotified_aborts("acct", "d-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_selection_entries_insert_or_ignore() {
        let store = setup_test_db().await;
        let task_id = Uuid::new_v4();
        let entries = vec![
            entry(task_id, 0, DecisionKind::CanAssign),
            entry(task_id, 1, DecisionKind::Assigned),
        ];

        assert_eq!(store.insert_selection_entries(&entries).await.unwrap(), 2);
        assert_eq!(store.insert_selection_entries(&entries).await.unwrap(), 0);
        assert_eq!(store.max_selection_seq(task_id).await.unwrap(), Some(1));
        assert_eq!(store.max_selection_seq(Uuid::new_v4()).await.unwrap(), None);

        let fetched = store.fetch_selection_entries("acct", task_id).await.unwrap();
        assert_eq!(fetched.len(), 2);
        assert_eq!(fetched[1].conclusion, Conclusion::Selected);
    }

    #[tokio::test]
    async fn test_selection_entry_without_seq_is_rejected() {
        let store = setup_test_db().await;
        let mut e = entry(Uuid::new_v4(), 0, DecisionKind::CanAssign);
        e.seq = None;

        let err = store.insert_selection_entries(&[e]).await.unwrap_err();
        assert!(matches!(err, DispatchError::Internal(_)));
    }

    #[tokio::test]
    async fn test_task_row_try_from_invalid_status() {
        let store = setup_test_db().await;
        let task = make_task("acct");
        store.insert_task(&task).await.unwrap();

        let row = sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {} FROM delegate_tasks WHERE id = ?",
            TASK_COLUMNS
        ))
        .bind(task.id.to_string())
        .fetch_one(&store.pool)
        .await
        .unwrap();
        let row = TaskRow {
            status: "running".to_string(),
            ..row
        };

        let result: Result<DelegateTask> = row.try_into();
        assert!(matches!(result, Err(DispatchError::Internal(_))));
    }
}
