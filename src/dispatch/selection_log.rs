//! Selection logs
//!
//! Every eligibility decision and every terminal transition of a task is
//! written down so an operator can see why a task went where it went, or
//! why it went nowhere. Entries are grouped into batches per task and saved
//! atomically; re-saving a batch is a no-op.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::Result;
use crate::store::Store;

/// Why a delegate was included, excluded or chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionKind {
    CanAssign,
    ExcludeScope,
    MissingSelector,
    MissingAllSelectors,
    Assigned,
    Disconnected,
    ProfileScopeNotMatched,
    MissingCapability,
    NotApproved,
    TaskFinished,
    TaskFailed,
    TaskAborted,
    TaskExpired,
}

/// Coarse grouping of decision kinds, as shown to operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Conclusion {
    Accepted,
    Rejected,
    Selected,
    Disconnected,
    Info,
}

impl Conclusion {
    pub fn as_str(&self) -> &'static str {
        match self {
            Conclusion::Accepted => "Accepted",
            Conclusion::Rejected => "Rejected",
            Conclusion::Selected => "Selected",
            Conclusion::Disconnected => "Disconnected",
            Conclusion::Info => "Info",
        }
    }
}

impl DecisionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionKind::CanAssign => "CAN_ASSIGN",
            DecisionKind::ExcludeScope => "EXCLUDE_SCOPE",
            DecisionKind::MissingSelector => "MISSING_SELECTOR",
            DecisionKind::MissingAllSelectors => "MISSING_ALL_SELECTORS",
            DecisionKind::Assigned => "ASSIGNED",
            DecisionKind::Disconnected => "DISCONNECTED",
            DecisionKind::ProfileScopeNotMatched => "PROFILE_SCOPE_NOT_MATCHED",
            DecisionKind::MissingCapability => "MISSING_CAPABILITY",
            DecisionKind::NotApproved => "NOT_APPROVED",
            DecisionKind::TaskFinished => "TASK_FINISHED",
            DecisionKind::TaskFailed => "TASK_FAILED",
            DecisionKind::TaskAborted => "TASK_ABORTED",
            DecisionKind::TaskExpired => "TASK_EXPIRED",
        }
    }

    pub fn conclusion(&self) -> Conclusion {
        match self {
            DecisionKind::CanAssign => Conclusion::Accepted,
            DecisionKind::Assigned => Conclusion::Selected,
            DecisionKind::Disconnected => Conclusion::Disconnected,
            DecisionKind::ExcludeScope
            | DecisionKind::MissingSelector
            | DecisionKind::MissingAllSelectors
            | DecisionKind::ProfileScopeNotMatched
            | DecisionKind::MissingCapability
            | DecisionKind::NotApproved
            | DecisionKind::TaskFailed => Conclusion::Rejected,
            DecisionKind::TaskFinished
            | DecisionKind::TaskAborted
            | DecisionKind::TaskExpired => Conclusion::Info,
        }
    }

    /// Kinds that record a task's terminal transition
    pub fn is_terminal_record(&self) -> bool {
        matches!(
            self,
            DecisionKind::TaskFinished
                | DecisionKind::TaskFailed
                | DecisionKind::TaskAborted
                | DecisionKind::TaskExpired
        )
    }
}

impl std::str::FromStr for DecisionKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "CAN_ASSIGN" => Ok(DecisionKind::CanAssign),
            "EXCLUDE_SCOPE" => Ok(DecisionKind::ExcludeScope),
            "MISSING_SELECTOR" => Ok(DecisionKind::MissingSelector),
            "MISSING_ALL_SELECTORS" => Ok(DecisionKind::MissingAllSelectors),
            "ASSIGNED" => Ok(DecisionKind::Assigned),
            "DISCONNECTED" => Ok(DecisionKind::Disconnected),
            "PROFILE_SCOPE_NOT_MATCHED" => Ok(DecisionKind::ProfileScopeNotMatched),
            "MISSING_CAPABILITY" => Ok(DecisionKind::MissingCapability),
            "NOT_APPROVED" => Ok(DecisionKind::NotApproved),
            "TASK_FINISHED" => Ok(DecisionKind::TaskFinished),
            "TASK_FAILED" => Ok(DecisionKind::TaskFailed),
            "TASK_ABORTED" => Ok(DecisionKind::TaskAborted),
            "TASK_EXPIRED" => Ok(DecisionKind::TaskExpired),
            _ => Err(format!("Invalid decision kind: {}", s)),
        }
    }
}

/// One decision. `seq` is assigned when the batch is saved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionLogEntry {
    pub task_id: Uuid,
    pub account_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delegate_id: Option<String>,
    pub kind: DecisionKind,
    pub conclusion: Conclusion,
    pub reason: String,
    pub recorded_at: DateTime<Utc>,
}

/// Decisions gathered during one evaluation of a task
#[derive(Debug, Clone)]
pub struct BatchDelegateSelectionLog {
    task_id: Uuid,
    account_id: String,
    entries: Vec<SelectionLogEntry>,
}

impl BatchDelegateSelectionLog {
    pub fn new(task_id: Uuid, account_id: impl Into<String>) -> Self {
        Self {
            task_id,
            account_id: account_id.into(),
            entries: Vec::new(),
        }
    }

    pub fn task_id(&self) -> Uuid {
        self.task_id
    }

    pub fn record(&mut self, delegate_id: Option<&str>, kind: DecisionKind, reason: impl Into<String>) {
        self.entries.push(SelectionLogEntry {
            task_id: self.task_id,
            account_id: self.account_id.clone(),
            seq: None,
            delegate_id: delegate_id.map(str::to_string),
            kind,
            conclusion: kind.conclusion(),
            reason: reason.into(),
            recorded_at: Utc::now(),
        });
    }

    pub fn entries(&self) -> &[SelectionLogEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn count(&self, kind: DecisionKind) -> usize {
        self.entries.iter().filter(|e| e.kind == kind).count()
    }
}

/// Next unassigned seq of one task, loaded from the store on first use
type Cursor = Arc<Mutex<Option<u32>>>;

/// Persists batches and answers audit queries
pub struct SelectionLogRecorder {
    store: Store,
    cursors: Mutex<HashMap<Uuid, Cursor>>,
}

impl SelectionLogRecorder {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            cursors: Mutex::new(HashMap::new()),
        }
    }

    async fn cursor(&self, task_id: Uuid) -> Cursor {
        self.cursors.lock().await.entry(task_id).or_default().clone()
    }

    /// Append a batch atomically. Entries keep the order they were recorded in.
    ///
    /// Sequence numbers are assigned on first save and written back into the
    /// batch, so saving the same batch again inserts nothing.
    pub async fn save(&self, batch: &mut BatchDelegateSelectionLog) -> Result<u64> {
        if batch.is_empty() {
            return Ok(0);
        }

        // Only batches of the same task wait on each other
        let cursor = self.cursor(batch.task_id).await;
        let mut next = cursor.lock().await;
        if batch.entries.iter().any(|e| e.seq.is_none()) {
            let mut seq = match *next {
                Some(seq) => seq,
                None => self
                    .store
                    .max_selection_seq(batch.task_id)
                    .await?
                    .map_or(0, |max| max + 1),
            };
            for entry in batch.entries.iter_mut().filter(|e| e.seq.is_none()) {
                entry.seq = Some(seq);
                seq += 1;
            }
            *next = Some(seq);
        }

        let inserted = self.store.insert_selection_entries(&batch.entries).await?;
        drop(next);

        tracing::debug!(
            task_id = %batch.task_id,
            inserted = inserted,
            "Saved selection log batch"
        );
        Ok(inserted)
    }

    pub async fn fetch_task_selection_logs(
        &self,
        account_id: &str,
        task_id: Uuid,
    ) -> Result<Vec<SelectionLogEntry>> {
        self.store.fetch_selection_entries(account_id, task_id).await
    }

    /// The delegate named by the latest ASSIGNED entry, if any
    pub async fn fetch_selected_delegate_for_task(
        &self,
        account_id: &str,
        task_id: Uuid,
    ) -> Result<Option<String>> {
        let entries = self.fetch_task_selection_logs(account_id, task_id).await?;
        Ok(entries
            .into_iter()
            .rev()
            .find(|e| e.kind == DecisionKind::Assigned)
            .and_then(|e| e.delegate_id))
    }

    /// Drop the in-memory cursor of a task that will not be logged again
    pub async fn forget(&self, task_id: Uuid) {
        self.cursors.lock().await.remove(&task_id);
    }
}
