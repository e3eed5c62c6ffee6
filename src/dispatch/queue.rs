//! Task queue and claim engine
//!
//! The only write that needs mutual exclusion is the claim, and it is a
//! compare-and-swap in the store. Every other transition is a
//! read-modify-write that retries on a version conflict, so two concurrent
//! transitions on one task never overwrite each other.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::task::{DelegateTask, TaskStatus, ValidationSummary};
use crate::error::{DispatchError, Result};
use crate::store::Store;

const MAX_WRITE_ATTEMPTS: usize = 16;

/// Why a claim was refused before the conditional write was attempted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimRejection {
    NotQueued(TaskStatus),
    Expired,
    Excluded,
    NotEligible,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// The caller won the task
    Claimed(DelegateTask),
    /// The caller already owned it
    AlreadyOwned(DelegateTask),
    /// Someone else won, or the task changed underneath
    Conflict,
    Rejected(ClaimRejection),
}

/// Result of a read-modify-write
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub task: DelegateTask,
    pub changed: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FailOver {
    /// Back in the queue without the failed delegate
    Requeued(DelegateTask),
    /// Moved to `ERROR`: retries used up or nobody left to try
    Exhausted(DelegateTask),
    /// Already terminal; the failure report was disregarded
    Ignored(DelegateTask),
}

/// Check the claim preconditions against a task read from the store
pub fn check_claim(task: &DelegateTask, delegate_id: &str, now: DateTime<Utc>) -> std::result::Result<(), ClaimRejection> {
    if task.status != TaskStatus::Queued {
        return Err(ClaimRejection::NotQueued(task.status));
    }
    if task.is_expired(now) {
        return Err(ClaimRejection::Expired);
    }
    if task.is_excluded(delegate_id) {
        return Err(ClaimRejection::Excluded);
    }
    if !task.is_eligible(delegate_id) {
        return Err(ClaimRejection::NotEligible);
    }
    Ok(())
}

pub struct TaskQueue {
    store: Store,
}

impl TaskQueue {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn enqueue(&self, task: &DelegateTask) -> Result<()> {
        self.store.insert_task(task).await?;
        tracing::info!(
            task_id = %task.id,
            account_id = %task.account_id,
            eligible = task.eligible_delegate_ids.len(),
            "Task queued"
        );
        Ok(())
    }

    pub async fn find(&self, account_id: &str, task_id: Uuid) -> Result<Option<DelegateTask>> {
        self.store.find_task(account_id, task_id).await
    }

    pub async fn get(&self, account_id: &str, task_id: Uuid) -> Result<DelegateTask> {
        self.find(account_id, task_id)
            .await?
            .ok_or(DispatchError::TaskNotFound(task_id))
    }

    /// Attempt the `QUEUED → STARTED` transition for `delegate_id`.
    ///
    /// `task` is the caller's read of the record. If another write lands in
    /// between and the task is still claimable, the claim is retried against
    /// the fresh read; it only reports `Conflict` once someone else owns it.
    pub async fn claim(&self, task: &DelegateTask, delegate_id: &str, now: DateTime<Utc>) -> Result<ClaimOutcome> {
        if task.is_owned_by(delegate_id) {
            return Ok(ClaimOutcome::AlreadyOwned(task.clone()));
        }
        if let Err(rejection) = check_claim(task, delegate_id, now) {
            return Ok(ClaimOutcome::Rejected(rejection));
        }

        let mut current = task.clone();
        for _ in 0..MAX_WRITE_ATTEMPTS {
            let won = self
                .store
                .claim_task(&current.account_id, current.id, delegate_id, current.version, now)
                .await?;

            if won {
                let mut claimed = current;
                claimed.status = TaskStatus::Started;
                claimed.delegate_id = Some(delegate_id.to_string());
                claimed.started_at = Some(now);
                claimed.updated_at = now;
                claimed.version += 1;
                tracing::info!(task_id = %task.id, delegate_id = %delegate_id, "Task claimed");
                return Ok(ClaimOutcome::Claimed(claimed));
            }

            let Some(latest) = self.find(&task.account_id, task.id).await? else {
                return Ok(ClaimOutcome::Conflict);
            };
            if latest.is_owned_by(delegate_id) {
                return Ok(ClaimOutcome::AlreadyOwned(latest));
            }
            match check_claim(&latest, delegate_id, now) {
                Ok(()) => {
                    tracing::debug!(task_id = %task.id, delegate_id = %delegate_id, "Task changed under the claim, retrying");
                    current = latest;
                }
                Err(ClaimRejection::NotQueued(TaskStatus::Started)) => {
                    tracing::debug!(task_id = %task.id, delegate_id = %delegate_id, "Claim lost");
                    return Ok(ClaimOutcome::Conflict);
                }
                Err(rejection) => return Ok(ClaimOutcome::Rejected(rejection)),
            }
        }
        Err(DispatchError::Internal(format!(
            "Gave up claiming task {} after {} conflicting attempts",
            task.id, MAX_WRITE_ATTEMPTS
        )))
    }

    /// Read-modify-write with retry on version conflict.
    ///
    /// `apply` returns `Ok(false)` to leave the task untouched.
    pub async fn update<F>(&self, account_id: &str, task_id: Uuid, mut apply: F) -> Result<Transition>
    where
        F: FnMut(&mut DelegateTask) -> Result<bool>,
    {
        for _ in 0..MAX_WRITE_ATTEMPTS {
            let current = self.get(account_id, task_id).await?;
            let mut next = current.clone();
            if !apply(&mut next)? {
                return Ok(Transition {
                    task: current,
                    changed: false,
                });
            }
            next.updated_at = Utc::now();
            if self.store.replace_task(&next, current.status).await? {
                next.version += 1;
                return Ok(Transition {
                    task: next,
                    changed: true,
                });
            }
            tracing::debug!(task_id = %task_id, "Task write conflict, retrying");
        }
        Err(DispatchError::Internal(format!(
            "Gave up writing task {} after {} conflicting attempts",
            task_id, MAX_WRITE_ATTEMPTS
        )))
    }

    /// Replace the eligible set of a queued task
    pub async fn set_eligible(&self, account_id: &str, task_id: Uuid, eligible: Vec<String>) -> Result<Transition> {
        self.update(account_id, task_id, |task| {
            if task.status != TaskStatus::Queued || task.eligible_delegate_ids == eligible {
                return Ok(false);
            }
            task.eligible_delegate_ids = eligible.clone();
            Ok(true)
        })
        .await
    }

    /// Admit a late joiner into the eligible set of a queued task
    pub async fn admit(&self, account_id: &str, task_id: Uuid, delegate_id: &str) -> Result<Transition> {
        self.update(account_id, task_id, |task| {
            if task.status != TaskStatus::Queued
                || task.is_eligible(delegate_id)
                || task.is_excluded(delegate_id)
            {
                return Ok(false);
            }
            task.eligible_delegate_ids.push(delegate_id.to_string());
            Ok(true)
        })
        .await
    }

    pub async fn mark_validating(&self, account_id: &str, task_id: Uuid, delegate_id: &str) -> Result<Transition> {
        self.update(account_id, task_id, |task| {
            if task.status != TaskStatus::Queued {
                return Ok(false);
            }
            Ok(task.validating_delegate_ids.insert(delegate_id.to_string()))
        })
        .await
    }

    /// Store what a delegate's probes said about a queued task
    pub async fn record_validation(
        &self,
        account_id: &str,
        task_id: Uuid,
        delegate_id: &str,
        summary: ValidationSummary,
    ) -> Result<Transition> {
        self.update(account_id, task_id, |task| {
            if task.status != TaskStatus::Queued {
                return Ok(false);
            }
            task.validating_delegate_ids.remove(delegate_id);
            task.validation_results
                .insert(delegate_id.to_string(), summary.clone());
            Ok(true)
        })
        .await
    }

    /// Note that `delegate_id` was offered the task. A new round forgets
    /// earlier offerees.
    pub async fn record_offer(
        &self,
        account_id: &str,
        task_id: Uuid,
        delegate_id: &str,
        new_round: bool,
        now: DateTime<Utc>,
    ) -> Result<Transition> {
        self.update(account_id, task_id, |task| {
            if task.status != TaskStatus::Queued {
                return Ok(false);
            }
            if new_round {
                task.offered_delegate_ids.clear();
            }
            task.offered_delegate_ids.insert(delegate_id.to_string());
            task.offered_at = Some(now);
            Ok(true)
        })
        .await
    }

    /// Take a delegate out of the running for a queued task for good
    pub async fn exclude(&self, account_id: &str, task_id: Uuid, delegate_id: &str) -> Result<Transition> {
        self.update(account_id, task_id, |task| {
            if task.status != TaskStatus::Queued || task.is_excluded(delegate_id) {
                return Ok(false);
            }
            task.excluded_delegate_ids.insert(delegate_id.to_string());
            task.eligible_delegate_ids.retain(|d| d != delegate_id);
            task.validating_delegate_ids.remove(delegate_id);
            Ok(true)
        })
        .await
    }

    /// `STARTED → FINISHED`. A report for a task that already ended is disregarded.
    pub async fn complete(
        &self,
        account_id: &str,
        task_id: Uuid,
        delegate_id: &str,
        result: serde_json::Value,
    ) -> Result<Transition> {
        self.update(account_id, task_id, |task| {
            if task.status.is_terminal() {
                return Ok(false);
            }
            if !task.is_owned_by(delegate_id) {
                return Err(DispatchError::NotAssigned {
                    task_id,
                    delegate_id: delegate_id.to_string(),
                });
            }
            task.status = TaskStatus::Finished;
            task.result = Some(result.clone());
            Ok(true)
        })
        .await
    }

    /// A started task failed on `delegate_id`: re-queue it for the remaining
    /// `candidates` or, with no budget or nobody left, move it to `ERROR`.
    pub async fn fail_over(
        &self,
        account_id: &str,
        task_id: Uuid,
        delegate_id: &str,
        reason: &str,
        candidates: &[String],
    ) -> Result<FailOver> {
        let transition = self
            .update(account_id, task_id, |task| {
                if task.status.is_terminal() {
                    return Ok(false);
                }
                if !task.is_owned_by(delegate_id) {
                    return Err(DispatchError::NotAssigned {
                        task_id,
                        delegate_id: delegate_id.to_string(),
                    });
                }

                let had_budget = task.has_retry_budget();
                task.attempts += 1;
                task.excluded_delegate_ids.insert(delegate_id.to_string());
                task.validating_delegate_ids.remove(delegate_id);
                let remaining: Vec<String> = candidates
                    .iter()
                    .filter(|c| !task.is_excluded(c))
                    .cloned()
                    .collect();

                if !had_budget {
                    task.status = TaskStatus::Error;
                    task.error_message = Some(format!(
                        "Task failed {} time(s), retry budget of {} exhausted. Last error: {}",
                        task.attempts, task.max_retries, reason
                    ));
                } else if remaining.is_empty() {
                    task.status = TaskStatus::Error;
                    task.error_message = Some(format!(
                        "All eligible delegates failed to complete the task. Last error: {}",
                        reason
                    ));
                } else {
                    task.status = TaskStatus::Queued;
                    task.delegate_id = None;
                    task.started_at = None;
                    task.eligible_delegate_ids = remaining;
                    task.offered_delegate_ids.clear();
                    task.offered_at = None;
                    task.error_message = Some(reason.to_string());
                }
                Ok(true)
            })
            .await?;

        let task = transition.task;
        Ok(match (transition.changed, task.status) {
            (false, _) => FailOver::Ignored(task),
            (true, TaskStatus::Queued) => {
                tracing::info!(task_id = %task_id, failed_delegate = %delegate_id, attempts = task.attempts, "Task re-queued");
                FailOver::Requeued(task)
            }
            (true, _) => {
                tracing::warn!(task_id = %task_id, attempts = task.attempts, "Task failed on every delegate");
                FailOver::Exhausted(task)
            }
        })
    }

    /// `QUEUED|STARTED → ABORTED`; no-op on a terminal task
    pub async fn abort(&self, account_id: &str, task_id: Uuid) -> Result<Transition> {
        self.update(account_id, task_id, |task| {
            if task.status.is_terminal() {
                return Ok(false);
            }
            task.status = TaskStatus::Aborted;
            task.abort_notified = false;
            Ok(true)
        })
        .await
    }

    /// `QUEUED|STARTED → EXPIRED`; no-op on a terminal task
    pub async fn expire(&self, account_id: &str, task_id: Uuid, message: &str) -> Result<Transition> {
        self.update(account_id, task_id, |task| {
            if task.status.is_terminal() {
                return Ok(false);
            }
            task.status = TaskStatus::Expired;
            task.error_message = Some(message.to_string());
            Ok(true)
        })
        .await
    }

    /// Sweep transition: only a task that is still queued and past its deadline
    pub async fn expire_overdue(
        &self,
        account_id: &str,
        task_id: Uuid,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<Transition> {
        self.update(account_id, task_id, |task| {
            if task.status != TaskStatus::Queued || !task.is_expired(now) {
                return Ok(false);
            }
            task.status = TaskStatus::Expired;
            task.error_message = Some(message.to_string());
            Ok(true)
        })
        .await
    }

    pub async fn overdue(&self, now: DateTime<Utc>) -> Result<Vec<DelegateTask>> {
        self.store.list_overdue_queued(now).await
    }

    pub async fn started(&self) -> Result<Vec<DelegateTask>> {
        self.store.list_tasks_by_status(TaskStatus::Started).await
    }

    pub async fn all_queued(&self) -> Result<Vec<DelegateTask>> {
        self.store.list_tasks_by_status(TaskStatus::Queued).await
    }

    pub async fn started_by(&self, delegate_id: &str) -> Result<Vec<DelegateTask>> {
        self.store.list_started_for_delegate(delegate_id).await
    }

    pub async fn queued(&self, account_id: &str) -> Result<Vec<DelegateTask>> {
        self.store
            .list_account_tasks_by_status(account_id, TaskStatus::Queued)
            .await
    }

    /// Abort notices for `delegate_id`, each handed out once
    pub async fn take_abort_notices(&self, account_id: &str, delegate_id: &str) -> Result<Vec<Uuid>> {
        let mut notices = Vec::new();
        for task in self.store.list_unnotified_aborts(account_id, delegate_id).await? {
            if self.store.mark_abort_notified(account_id, task.id).await? {
                notices.push(task.id);
            }
        }
        Ok(notices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DispatchConfig;
    use crate::dispatch::task::TaskSubmission;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::time::Duration;

    async fn setup_queue() -> TaskQueue {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = Store::new(pool);
        store.ensure_schema().await.unwrap();
        TaskQueue::new(store)
    }

    async fn queued_task(queue: &TaskQueue, eligible: &[&str], max_retries: u32) -> DelegateTask {
        let config = DispatchConfig::new(max_retries, Duration::from_secs(60));
        let mut task = DelegateTask::from_submission(
            TaskSubmission::new("acct", serde_json::json!({})),
            &config,
            Utc::now(),
        )
        .unwrap();
        task.eligible_delegate_ids = eligible.iter().map(|s| s.to_string()).collect();
        queue.enqueue(&task).await.unwrap();
        task
    }

    fn candidates(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_claim_and_conflict() {
        let queue = setup_queue().await;
        let task = queued_task(&queue, &["d-1", "d-2"], 1).await;
        let now = Utc::now();

        let first = queue.claim(&task, "d-1", now).await.unwrap();
        assert!(matches!(first, ClaimOutcome::Claimed(ref t) if t.delegate_id.as_deref() == Some("d-1")));

        // d-2 read the same version before d-1 won
        let second = queue.claim(&task, "d-2", now).await.unwrap();
        assert_eq!(second, ClaimOutcome::Conflict);
    }

    #[tokio::test]
    async fn test_claim_survives_unrelated_write() {
        let queue = setup_queue().await;
        let stale = queued_task(&queue, &["d-1", "d-2"], 1).await;

        // d-2 starts validating, bumping the version under d-1's read
        queue.mark_validating("acct", stale.id, "d-2").await.unwrap();

        let outcome = queue.claim(&stale, "d-1", Utc::now()).await.unwrap();
        let ClaimOutcome::Claimed(claimed) = outcome else {
            panic!("expected claim, got {:?}", outcome);
        };
        assert_eq!(claimed.delegate_id.as_deref(), Some("d-1"));
        assert!(claimed.validating_delegate_ids.contains("d-2"));

        let stored = queue.get("acct", stale.id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Started);
        assert_eq!(stored.version, claimed.version);
    }

    #[tokio::test]
    async fn test_claim_rejected_when_excluded_meanwhile() {
        let queue = setup_queue().await;
        let stale = queued_task(&queue, &["d-1", "d-2"], 1).await;
        queue.exclude("acct", stale.id, "d-1").await.unwrap();

        assert_eq!(
            queue.claim(&stale, "d-1", Utc::now()).await.unwrap(),
            ClaimOutcome::Rejected(ClaimRejection::Excluded)
        );
    }

    #[tokio::test]
    async fn test_record_offer_rounds() {
        let queue = setup_queue().await;
        let task = queued_task(&queue, &["d-1", "d-2"], 1).await;
        let now = Utc::now();

        queue.record_offer("acct", task.id, "d-1", false, now).await.unwrap();
        let t = queue.record_offer("acct", task.id, "d-2", false, now).await.unwrap().task;
        assert_eq!(t.offered_delegate_ids.len(), 2);
        assert_eq!(t.offered_at, Some(now));

        let t = queue.record_offer("acct", task.id, "d-1", true, now).await.unwrap().task;
        assert_eq!(t.offered_delegate_ids.iter().collect::<Vec<_>>(), vec!["d-1"]);

        queue.claim(&t, "d-1", now).await.unwrap();
        assert!(!queue.record_offer("acct", task.id, "d-2", false, now).await.unwrap().changed);
    }

    #[tokio::test]
    async fn test_claim_rejections() {
        let queue = setup_queue().await;
        let task = queued_task(&queue, &["d-1"], 1).await;
        let now = Utc::now();

        assert_eq!(
            queue.claim(&task, "d-9", now).await.unwrap(),
            ClaimOutcome::Rejected(ClaimRejection::NotEligible)
        );
        assert_eq!(
            queue.claim(&task, "d-1", task.expires_at).await.unwrap(),
            ClaimOutcome::Rejected(ClaimRejection::Expired)
        );

        let excluded = queue.exclude("acct", task.id, "d-1").await.unwrap().task;
        assert_eq!(
            queue.claim(&excluded, "d-1", now).await.unwrap(),
            ClaimOutcome::Rejected(ClaimRejection::Excluded)
        );
    }

    #[tokio::test]
    async fn test_reclaim_by_owner() {
        let queue = setup_queue().await;
        let task = queued_task(&queue, &["d-1"], 1).await;
        queue.claim(&task, "d-1", Utc::now()).await.unwrap();

        let current = queue.get("acct", task.id).await.unwrap();
        assert!(matches!(
            queue.claim(&current, "d-1", Utc::now()).await.unwrap(),
            ClaimOutcome::AlreadyOwned(_)
        ));
    }

    #[tokio::test]
    async fn test_complete_requires_owner() {
        let queue = setup_queue().await;
        let task = queued_task(&queue, &["d-1"], 1).await;
        queue.claim(&task, "d-1", Utc::now()).await.unwrap();

        let err = queue
            .complete("acct", task.id, "d-2", serde_json::json!(null))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::NotAssigned { .. }));

        let done = queue
            .complete("acct", task.id, "d-1", serde_json::json!({"ok": true}))
            .await
            .unwrap();
        assert!(done.changed);
        assert_eq!(done.task.status, TaskStatus::Finished);

        // late duplicate report is disregarded
        let again = queue
            .complete("acct", task.id, "d-1", serde_json::json!(null))
            .await
            .unwrap();
        assert!(!again.changed);
        assert_eq!(again.task.result, Some(serde_json::json!({"ok": true})));
    }

    #[tokio::test]
    async fn test_fail_over_requeues_without_failed_delegate() {
        let queue = setup_queue().await;
        let task = queued_task(&queue, &["d-1", "d-2"], 1).await;
        queue.claim(&task, "d-1", Utc::now()).await.unwrap();

        let outcome = queue
            .fail_over("acct", task.id, "d-1", "exit 1", &candidates(&["d-1", "d-2"]))
            .await
            .unwrap();
        let FailOver::Requeued(requeued) = outcome else {
            panic!("expected requeue, got {:?}", outcome);
        };
        assert_eq!(requeued.status, TaskStatus::Queued);
        assert!(requeued.delegate_id.is_none());
        assert!(requeued.is_excluded("d-1"));
        assert_eq!(requeued.eligible_delegate_ids, vec!["d-2"]);
        assert_eq!(requeued.attempts, 1);
        assert!(requeued.offered_delegate_ids.is_empty());

        assert!(matches!(
            queue.claim(&requeued, "d-2", Utc::now()).await.unwrap(),
            ClaimOutcome::Claimed(_)
        ));
    }

    #[tokio::test]
    async fn test_fail_over_exhausts_retry_budget() {
        let queue = setup_queue().await;
        let task = queued_task(&queue, &["d-1", "d-2"], 0).await;
        queue.claim(&task, "d-1", Utc::now()).await.unwrap();

        let outcome = queue
            .fail_over("acct", task.id, "d-1", "exit 1", &candidates(&["d-2"]))
            .await
            .unwrap();
        let FailOver::Exhausted(failed) = outcome else {
            panic!("expected exhaustion, got {:?}", outcome);
        };
        assert_eq!(failed.status, TaskStatus::Error);
        assert!(failed.error_message.unwrap().contains("retry budget of 0"));
    }

    #[tokio::test]
    async fn test_fail_over_with_nobody_left() {
        let queue = setup_queue().await;
        let task = queued_task(&queue, &["d-1"], 3).await;
        queue.claim(&task, "d-1", Utc::now()).await.unwrap();

        let outcome = queue
            .fail_over("acct", task.id, "d-1", "oom", &candidates(&["d-1"]))
            .await
            .unwrap();
        assert!(matches!(outcome, FailOver::Exhausted(ref t) if t.status == TaskStatus::Error));
    }

    #[tokio::test]
    async fn test_fail_over_on_aborted_task_is_ignored() {
        let queue = setup_queue().await;
        let task = queued_task(&queue, &["d-1"], 3).await;
        queue.claim(&task, "d-1", Utc::now()).await.unwrap();
        queue.abort("acct", task.id).await.unwrap();

        let outcome = queue
            .fail_over("acct", task.id, "d-1", "late", &candidates(&["d-2"]))
            .await
            .unwrap();
        assert!(matches!(outcome, FailOver::Ignored(ref t) if t.status == TaskStatus::Aborted));
    }

    #[tokio::test]
    async fn test_abort_and_expire_are_idempotent() {
        let queue = setup_queue().await;
        let task = queued_task(&queue, &[], 1).await;

        let aborted = queue.abort("acct", task.id).await.unwrap();
        assert!(aborted.changed);
        assert!(!queue.abort("acct", task.id).await.unwrap().changed);

        let expired = queue.expire("acct", task.id, "too late").await.unwrap();
        assert!(!expired.changed);
        assert_eq!(expired.task.status, TaskStatus::Aborted);
    }

    #[tokio::test]
    async fn test_expire_overdue_only_touches_queued() {
        let queue = setup_queue().await;
        let task = queued_task(&queue, &["d-1"], 1).await;

        let early = queue
            .expire_overdue("acct", task.id, "expired", Utc::now())
            .await
            .unwrap();
        assert!(!early.changed);

        queue.claim(&task, "d-1", Utc::now()).await.unwrap();
        let late = queue
            .expire_overdue("acct", task.id, "expired", task.expires_at)
            .await
            .unwrap();
        assert!(!late.changed);
        assert_eq!(late.task.status, TaskStatus::Started);
    }

    #[tokio::test]
    async fn test_validation_bookkeeping() {
        let queue = setup_queue().await;
        let task = queued_task(&queue, &["d-1"], 1).await;

        let t = queue.mark_validating("acct", task.id, "d-1").await.unwrap().task;
        assert!(t.validating_delegate_ids.contains("d-1"));

        let t = queue
            .record_validation(
                "acct",
                task.id,
                "d-1",
                ValidationSummary {
                    validated: true,
                    failed_criteria: vec![],
                },
            )
            .await
            .unwrap()
            .task;
        assert!(t.validating_delegate_ids.is_empty());
        assert!(t.validation_results["d-1"].validated);
        assert_eq!(t.status, TaskStatus::Queued);
    }

    #[tokio::test]
    async fn test_admit_late_joiner() {
        let queue = setup_queue().await;
        let task = queued_task(&queue, &["d-1"], 1).await;

        let t = queue.admit("acct", task.id, "d-2").await.unwrap();
        assert!(t.changed);
        assert!(t.task.is_eligible("d-2"));
        assert!(!queue.admit("acct", task.id, "d-2").await.unwrap().changed);
    }

    #[tokio::test]
    async fn test_abort_notices_delivered_once() {
        let queue = setup_queue().await;
        let task = queued_task(&queue, &["d-1"], 1).await;
        queue.claim(&task, "d-1", Utc::now()).await.unwrap();
        queue.abort("acct", task.id).await.unwrap();

        assert_eq!(queue.take_abort_notices("acct", "d-1").await.unwrap(), vec![task.id]);
        assert!(queue.take_abort_notices("acct", "d-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_get_missing_task() {
        let queue = setup_queue().await;
        let err = queue.get("acct", Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, DispatchError::TaskNotFound(_)));
    }
}
