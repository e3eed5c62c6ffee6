//! Dispatcher
//!
//! Ties the registries, the claim engine and the selection log together and
//! exposes the task lifecycle to producers and delegates:
//! - eligibility computation and selection logging on submit and re-queue
//! - the acquire flow with capability validation and late joiners
//! - result, progress and connection-result reporting
//! - abort, expiry and fail-over of stalled or disconnected delegates
//! - event broadcasting

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::broadcast;
use uuid::Uuid;

use super::capability::{
    CapabilityDescriptor, CapabilityRegistry, DelegateConnectionResult, PermissionResult,
    ProbeRequest,
};
use super::delegate::{ApprovalAction, ConnectionMode, Delegate, DelegateRegistration};
use super::queue::{check_claim, ClaimOutcome, ClaimRejection, FailOver, TaskQueue};
use super::registry::{order_candidates, DelegateRegistry, EligibilityQuery, Verdict};
use super::selection_log::{
    BatchDelegateSelectionLog, Conclusion, DecisionKind, SelectionLogEntry, SelectionLogRecorder,
};
use super::task::{
    AcquireOutcome, DelegateTask, TaskEvent, TaskResponse, TaskStatus, TaskSubmission,
    ValidationSummary,
};
use crate::config::DispatchConfig;
use crate::error::{DispatchError, Result};
use crate::store::Store;

pub const NO_ACTIVE_DELEGATES: &str = "There were no active delegates to complete the task.";
pub const NO_ELIGIBLE_DELEGATES: &str =
    "None of the active delegates were eligible to complete the task.";

/// Events emitted by the dispatcher
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchEvent {
    TaskQueued {
        account_id: String,
        task_id: Uuid,
        eligible: Vec<String>,
    },
    /// The task is offered to the next candidate in dispatch order
    TaskOffered {
        account_id: String,
        task_id: Uuid,
        delegate_id: String,
    },
    TaskAssigned {
        account_id: String,
        task_id: Uuid,
        delegate_id: String,
    },
    TaskProgress {
        account_id: String,
        task_id: Uuid,
        delegate_id: String,
        progress: serde_json::Value,
    },
    /// Reached `FINISHED` or `ERROR`
    TaskCompleted {
        account_id: String,
        task_id: Uuid,
        status: TaskStatus,
    },
    TaskRequeued {
        account_id: String,
        task_id: Uuid,
        failed_delegate_id: String,
        eligible: Vec<String>,
    },
    TaskAborted {
        account_id: String,
        task_id: Uuid,
        delegate_id: Option<String>,
    },
    TaskExpired {
        account_id: String,
        task_id: Uuid,
    },
    DelegateDisconnected {
        account_id: String,
        delegate_id: String,
    },
}

impl DispatchEvent {
    /// Whether this event ends the life of `task_id`
    pub fn ends_task(&self, task_id: Uuid) -> bool {
        match self {
            DispatchEvent::TaskCompleted { task_id: id, .. }
            | DispatchEvent::TaskAborted { task_id: id, .. }
            | DispatchEvent::TaskExpired { task_id: id, .. } => *id == task_id,
            _ => false,
        }
    }
}

enum CapabilityVerdict {
    Allowed,
    Pending(Vec<CapabilityDescriptor>),
    Denied(Vec<String>),
}

pub struct Dispatcher {
    config: DispatchConfig,
    registry: DelegateRegistry,
    capabilities: CapabilityRegistry,
    queue: TaskQueue,
    selection_logs: SelectionLogRecorder,
    event_tx: broadcast::Sender<DispatchEvent>,
}

impl Dispatcher {
    pub fn new(store: Store, config: DispatchConfig) -> Self {
        let (event_tx, _) = broadcast::channel(1024);
        Self {
            registry: DelegateRegistry::new(&config),
            capabilities: CapabilityRegistry::from_config(&config),
            queue: TaskQueue::new(store.clone()),
            selection_logs: SelectionLogRecorder::new(store),
            config,
            event_tx,
        }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub fn registry(&self) -> &DelegateRegistry {
        &self.registry
    }

    pub fn capabilities(&self) -> &CapabilityRegistry {
        &self.capabilities
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DispatchEvent> {
        self.event_tx.subscribe()
    }

    pub fn subscribe_probes(&self) -> broadcast::Receiver<ProbeRequest> {
        self.capabilities.subscribe_probes()
    }

    fn emit(&self, event: DispatchEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Persist a batch. Audit logging never fails the operation it describes.
    async fn flush(&self, batch: &mut BatchDelegateSelectionLog) {
        if let Err(e) = self.selection_logs.save(batch).await {
            tracing::warn!(task_id = %batch.task_id(), error = %e, "Failed to save selection log");
        }
    }

    async fn finish_log(&self, mut batch: BatchDelegateSelectionLog) {
        self.flush(&mut batch).await;
        self.selection_logs.forget(batch.task_id()).await;
    }

    // Delegate operations

    pub async fn register_delegate(&self, registration: DelegateRegistration) -> Delegate {
        let previous = self.registry.get(&registration.delegate_id).await;
        let delegate = self.registry.register(registration, Utc::now()).await;
        let profile_changed = previous.map_or(false, |p| {
            p.group_name != delegate.group_name
                || p.profile != delegate.profile
                || p.selectors != delegate.selectors
        });
        if profile_changed {
            let dropped = self.capabilities.invalidate(&delegate.id).await;
            tracing::debug!(delegate_id = %delegate.id, dropped = dropped, "Capability cache invalidated");
        }
        delegate
    }

    /// An unknown delegate is created on the spot. Fails only if the
    /// delegate belongs to another account.
    pub async fn register_heartbeat(
        &self,
        account_id: &str,
        delegate_id: &str,
        at: DateTime<Utc>,
        mode: ConnectionMode,
    ) -> Result<Delegate> {
        tracing::debug!(delegate_id = %delegate_id, "Heartbeat");
        self.registry
            .register_heartbeat(account_id, delegate_id, at, mode)
            .await
    }

    pub async fn list_delegates(&self, account_id: &str) -> Vec<Delegate> {
        self.registry.list_account(account_id).await
    }

    pub async fn list_eligible(&self, account_id: &str, required_selectors: &BTreeSet<String>) -> Vec<Delegate> {
        self.registry
            .list_eligible(account_id, required_selectors, Utc::now())
            .await
    }

    pub async fn mark_approval(
        &self,
        account_id: &str,
        delegate_id: &str,
        action: ApprovalAction,
    ) -> Result<Delegate> {
        self.registry
            .get_for_account(account_id, delegate_id)
            .await
            .ok_or_else(|| DispatchError::DelegateNotFound(delegate_id.to_string()))?;
        self.registry.mark_approval(delegate_id, action).await
    }

    /// Mark a delegate disconnected, fail over whatever it was running and
    /// offer queued tasks it was offered to the next candidate.
    /// Returns how many tasks were failed over.
    pub async fn mark_disconnected(&self, account_id: &str, delegate_id: &str) -> Result<usize> {
        self.registry
            .get_for_account(account_id, delegate_id)
            .await
            .ok_or_else(|| DispatchError::DelegateNotFound(delegate_id.to_string()))?;
        self.registry.mark_disconnected(delegate_id).await;
        self.emit(DispatchEvent::DelegateDisconnected {
            account_id: account_id.to_string(),
            delegate_id: delegate_id.to_string(),
        });

        let now = Utc::now();
        let failed_over = self
            .fail_over_owned(delegate_id, "Delegate disconnected while executing the task", now)
            .await?;

        for task in self.queue.queued(account_id).await? {
            if task.offered_delegate_ids.contains(delegate_id) && !task.is_expired(now) {
                self.offer(&task, false, now).await;
            }
        }
        Ok(failed_over)
    }

    async fn fail_over_owned(&self, delegate_id: &str, reason: &str, now: DateTime<Utc>) -> Result<usize> {
        let mut failed_over = 0;
        for task in self.queue.started_by(delegate_id).await? {
            if self
                .try_fail_over(&task.account_id, task.id, delegate_id, DecisionKind::Disconnected, reason, now)
                .await?
            {
                failed_over += 1;
            }
        }
        Ok(failed_over)
    }

    // Eligibility

    fn query(task: &DelegateTask) -> EligibilityQuery<'_> {
        EligibilityQuery {
            account_id: &task.account_id,
            selectors: &task.selectors,
            setup_abstractions: &task.setup_abstractions,
        }
    }

    async fn check_capabilities(
        &self,
        delegate: &Delegate,
        task: &DelegateTask,
        now: DateTime<Utc>,
    ) -> CapabilityVerdict {
        if task.capabilities.is_empty() {
            return CapabilityVerdict::Allowed;
        }
        let results = self
            .capabilities
            .batch_check_at(delegate, &task.capabilities, Some(task.id), now)
            .await;

        let denied: Vec<String> = results
            .iter()
            .filter(|(_, r)| *r == PermissionResult::Denied)
            .map(|(c, _)| c.criteria())
            .collect();
        if !denied.is_empty() {
            return CapabilityVerdict::Denied(denied);
        }
        let pending: Vec<CapabilityDescriptor> = results
            .into_iter()
            .filter(|(_, r)| *r == PermissionResult::Unchecked)
            .map(|(c, _)| c)
            .collect();
        if pending.is_empty() {
            CapabilityVerdict::Allowed
        } else {
            CapabilityVerdict::Pending(pending)
        }
    }

    /// Judge every delegate of the task's account not already excluded,
    /// logging each decision. Returns the eligible ones in dispatch order.
    async fn evaluate_candidates(
        &self,
        task: &DelegateTask,
        batch: &mut BatchDelegateSelectionLog,
        now: DateTime<Utc>,
    ) -> Vec<Delegate> {
        let mut eligible = Vec::new();
        for (delegate, verdict) in self.registry.evaluate(&Self::query(task), now).await {
            if task.is_excluded(&delegate.id) {
                continue;
            }
            match verdict {
                Verdict::Ineligible { kind, reason } => batch.record(Some(&delegate.id), kind, reason),
                Verdict::Eligible => match self.check_capabilities(&delegate, task, now).await {
                    CapabilityVerdict::Denied(criteria) => batch.record(
                        Some(&delegate.id),
                        DecisionKind::MissingCapability,
                        format!("Missing capabilities: [{}]", criteria.join(", ")),
                    ),
                    CapabilityVerdict::Pending(_) => {
                        batch.record(
                            Some(&delegate.id),
                            DecisionKind::CanAssign,
                            "Delegate is eligible, capabilities pending validation",
                        );
                        eligible.push(delegate);
                    }
                    CapabilityVerdict::Allowed => {
                        batch.record(
                            Some(&delegate.id),
                            DecisionKind::CanAssign,
                            "Delegate is eligible to execute the task",
                        );
                        eligible.push(delegate);
                    }
                },
            }
        }
        order_candidates(&mut eligible);
        eligible
    }

    /// Next delegate to offer `task` to: live eligible delegates minus
    /// exclusions and `already_tried`, most recent heartbeat first, then by id
    pub async fn obtain_capable_delegate_id(
        &self,
        task: &DelegateTask,
        already_tried: &BTreeSet<String>,
    ) -> Option<String> {
        let now = Utc::now();
        let query = Self::query(task);
        let mut live = Vec::new();
        for id in &task.eligible_delegate_ids {
            if already_tried.contains(id) || task.is_excluded(id) {
                continue;
            }
            if let Some(delegate) = self.registry.get_for_account(&task.account_id, id).await {
                if self.registry.verdict(&delegate, &query, now).is_eligible() {
                    live.push(delegate);
                }
            }
        }
        order_candidates(&mut live);
        live.into_iter().next().map(|d| d.id)
    }

    // Producer operations

    pub async fn queue_task(&self, submission: TaskSubmission) -> Result<DelegateTask> {
        let now = Utc::now();
        let mut task = DelegateTask::from_submission(submission, &self.config, now)?;
        let mut batch = BatchDelegateSelectionLog::new(task.id, &task.account_id);

        let eligible = self.evaluate_candidates(&task, &mut batch, now).await;
        task.eligible_delegate_ids = eligible.into_iter().map(|d| d.id).collect();

        self.queue.enqueue(&task).await?;
        self.flush(&mut batch).await;

        self.emit(DispatchEvent::TaskQueued {
            account_id: task.account_id.clone(),
            task_id: task.id,
            eligible: task.eligible_delegate_ids.clone(),
        });
        self.offer(&task, false, now).await;
        Ok(task)
    }

    /// Offer `task` to the next candidate not yet offered it this round. With
    /// `restart`, a round in which every candidate was offered starts over.
    /// Returns whether an offer went out.
    async fn offer(&self, task: &DelegateTask, restart: bool, now: DateTime<Utc>) -> bool {
        let mut new_round = false;
        let mut next = self
            .obtain_capable_delegate_id(task, &task.offered_delegate_ids)
            .await;
        if next.is_none() && restart && !task.offered_delegate_ids.is_empty() {
            next = self.obtain_capable_delegate_id(task, &BTreeSet::new()).await;
            new_round = true;
        }
        let Some(delegate_id) = next else {
            tracing::info!(task_id = %task.id, "No delegate left to offer the task to, it stays queued");
            return false;
        };

        match self
            .queue
            .record_offer(&task.account_id, task.id, &delegate_id, new_round, now)
            .await
        {
            Ok(transition) if transition.changed => {
                tracing::debug!(task_id = %task.id, delegate_id = %delegate_id, new_round = new_round, "Task offered");
                self.emit(DispatchEvent::TaskOffered {
                    account_id: task.account_id.clone(),
                    task_id: task.id,
                    delegate_id,
                });
                true
            }
            Ok(_) => false,
            Err(e) => {
                tracing::warn!(task_id = %task.id, error = %e, "Failed to record offer");
                false
            }
        }
    }

    /// Offer a task on after its current offeree dropped out, if it is still
    /// waiting for a delegate
    async fn offer_next(&self, account_id: &str, task_id: Uuid, now: DateTime<Utc>) {
        match self.queue.find(account_id, task_id).await {
            Ok(Some(task)) if task.status == TaskStatus::Queued && !task.is_expired(now) => {
                self.offer(&task, false, now).await;
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(task_id = %task_id, error = %e, "Failed to re-read task for the next offer"),
        }
    }

    /// Queue a task and wait for it to end, up to the sync timeout.
    ///
    /// On timeout the task is left to the normal retry and expiry handling.
    pub async fn execute_task(&self, submission: TaskSubmission) -> Result<serde_json::Value> {
        let mut events = self.subscribe();
        let task = self.queue_task(submission).await?;

        let wait = async {
            loop {
                match events.recv().await {
                    Ok(event) if event.ends_task(task.id) => break,
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(task_id = %task.id, skipped = skipped, "Event receiver lagged");
                        let current = self.queue.get(&task.account_id, task.id).await?;
                        if current.status.is_terminal() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(DispatchError::Internal("Event bus closed".to_string()));
                    }
                }
            }
            Ok::<(), DispatchError>(())
        };

        if tokio::time::timeout(self.config.sync_task_timeout, wait)
            .await
            .is_err()
        {
            tracing::warn!(task_id = %task.id, "Synchronous task timed out");
            return Err(DispatchError::SyncTimeout(task.id));
        }

        let task = self.queue.get(&task.account_id, task.id).await?;
        sync_outcome(task)
    }

    pub async fn get_task(&self, account_id: &str, task_id: Uuid) -> Result<DelegateTask> {
        self.queue.get(account_id, task_id).await
    }

    /// Cooperative cancel. Calling it on a task that already ended is a no-op.
    pub async fn abort_task(&self, account_id: &str, task_id: Uuid) -> Result<DelegateTask> {
        let transition = self.queue.abort(account_id, task_id).await?;
        if transition.changed {
            let task = &transition.task;
            let mut batch = BatchDelegateSelectionLog::new(task_id, account_id);
            batch.record(
                task.delegate_id.as_deref(),
                DecisionKind::TaskAborted,
                "Task was aborted",
            );
            self.finish_log(batch).await;
            tracing::info!(task_id = %task_id, "Task aborted");
            self.emit(DispatchEvent::TaskAborted {
                account_id: account_id.to_string(),
                task_id,
                delegate_id: task.delegate_id.clone(),
            });
        }
        Ok(transition.task)
    }

    /// Expire a task now. Calling it on a task that already ended is a no-op.
    pub async fn expire_task(&self, account_id: &str, task_id: Uuid) -> Result<DelegateTask> {
        let task = self.queue.get(account_id, task_id).await?;
        if task.status.is_terminal() {
            return Ok(task);
        }
        let now = Utc::now();
        let message = self.expiry_message(&task, now).await?;
        let transition = self.queue.expire(account_id, task_id, &message).await?;
        if transition.changed {
            self.record_expiry(&transition.task, &message).await;
        }
        Ok(transition.task)
    }

    async fn record_expiry(&self, task: &DelegateTask, message: &str) {
        let mut batch = BatchDelegateSelectionLog::new(task.id, &task.account_id);
        batch.record(None, DecisionKind::TaskExpired, message);
        self.finish_log(batch).await;
        tracing::info!(task_id = %task.id, "Task expired");
        self.emit(DispatchEvent::TaskExpired {
            account_id: task.account_id.clone(),
            task_id: task.id,
        });
    }

    /// Operator-facing explanation of why nobody ran the task
    async fn expiry_message(&self, task: &DelegateTask, now: DateTime<Utc>) -> Result<String> {
        let entries = self
            .selection_logs
            .fetch_task_selection_logs(&task.account_id, task.id)
            .await?;
        let mut reasons = exclusion_reasons(&entries);
        for (delegate_id, summary) in &task.validation_results {
            if !summary.validated {
                reasons
                    .entry(delegate_id.clone())
                    .or_insert_with(|| {
                        format!(
                            "{}: [{}]",
                            DecisionKind::MissingCapability.as_str(),
                            summary.failed_criteria.join(", ")
                        )
                    });
            }
        }

        let any_active = self
            .registry
            .list_account(&task.account_id)
            .await
            .iter()
            .any(|d| d.is_live(now, DispatchConfig::chrono(self.config.heartbeat_timeout)));

        let mut message = if any_active {
            NO_ELIGIBLE_DELEGATES.to_string()
        } else {
            NO_ACTIVE_DELEGATES.to_string()
        };
        for (delegate_id, reason) in reasons {
            message.push_str(&format!("\n  {} : {}", delegate_id, reason));
        }
        Ok(message)
    }

    pub async fn fetch_task_selection_logs(
        &self,
        account_id: &str,
        task_id: Uuid,
    ) -> Result<Vec<SelectionLogEntry>> {
        self.selection_logs
            .fetch_task_selection_logs(account_id, task_id)
            .await
    }

    pub async fn fetch_selected_delegate_for_task(
        &self,
        account_id: &str,
        task_id: Uuid,
    ) -> Result<Option<String>> {
        self.selection_logs
            .fetch_selected_delegate_for_task(account_id, task_id)
            .await
    }

    // Delegate-facing operations

    /// Try to take a task. Losing the race, being ineligible or having
    /// capabilities still unchecked are outcomes, not errors.
    pub async fn acquire_task(
        &self,
        account_id: &str,
        delegate_id: &str,
        task_id: Uuid,
    ) -> Result<AcquireOutcome> {
        let now = Utc::now();
        let Some(delegate) = self.registry.get_for_account(account_id, delegate_id).await else {
            tracing::debug!(delegate_id = %delegate_id, "Acquire from unknown delegate");
            return Ok(AcquireOutcome::NotAvailable);
        };
        let Some(mut task) = self.queue.find(account_id, task_id).await? else {
            return Ok(AcquireOutcome::NotAvailable);
        };

        if task.is_owned_by(delegate_id) {
            return package(&task);
        }
        match check_claim(&task, delegate_id, now) {
            Ok(()) | Err(ClaimRejection::NotEligible) => {}
            Err(rejection) => {
                tracing::debug!(task_id = %task_id, delegate_id = %delegate_id, ?rejection, "Task not claimable");
                return Ok(AcquireOutcome::NotAvailable);
            }
        }

        let mut batch = BatchDelegateSelectionLog::new(task_id, account_id);
        match self.registry.verdict(&delegate, &Self::query(&task), now) {
            Verdict::Ineligible { kind, reason } => {
                tracing::debug!(task_id = %task_id, delegate_id = %delegate_id, kind = kind.as_str(), "Delegate not eligible");
                if !task.is_eligible(delegate_id) {
                    batch.record(Some(delegate_id), kind, reason);
                    self.flush(&mut batch).await;
                }
                if task.offered_delegate_ids.contains(delegate_id) {
                    self.offer_next(account_id, task_id, now).await;
                }
                return Ok(AcquireOutcome::NotAvailable);
            }
            Verdict::Eligible if !task.is_eligible(delegate_id) => {
                batch.record(
                    Some(delegate_id),
                    DecisionKind::CanAssign,
                    "Delegate joined after the task was queued and is eligible",
                );
                task = self.queue.admit(account_id, task_id, delegate_id).await?.task;
            }
            Verdict::Eligible => {}
        }

        match self.check_capabilities(&delegate, &task, now).await {
            CapabilityVerdict::Denied(criteria) => {
                batch.record(
                    Some(delegate_id),
                    DecisionKind::MissingCapability,
                    format!("Missing capabilities: [{}]", criteria.join(", ")),
                );
                self.queue.exclude(account_id, task_id, delegate_id).await?;
                self.flush(&mut batch).await;
                self.offer_next(account_id, task_id, now).await;
                return Ok(AcquireOutcome::NotAvailable);
            }
            CapabilityVerdict::Pending(capabilities) => {
                self.queue.mark_validating(account_id, task_id, delegate_id).await?;
                self.flush(&mut batch).await;
                return Ok(AcquireOutcome::ValidationRequired {
                    task_id,
                    capabilities,
                });
            }
            CapabilityVerdict::Allowed => {}
        }

        match self.queue.claim(&task, delegate_id, now).await? {
            ClaimOutcome::Claimed(claimed) => {
                batch.record(Some(delegate_id), DecisionKind::Assigned, "Delegate acquired the task");
                self.flush(&mut batch).await;
                self.emit(DispatchEvent::TaskAssigned {
                    account_id: account_id.to_string(),
                    task_id,
                    delegate_id: delegate_id.to_string(),
                });
                package(&claimed)
            }
            ClaimOutcome::AlreadyOwned(owned) => package(&owned),
            ClaimOutcome::Conflict | ClaimOutcome::Rejected(_) => {
                self.flush(&mut batch).await;
                self.offer_next(account_id, task_id, now).await;
                Ok(AcquireOutcome::NotAvailable)
            }
        }
    }

    /// Cache probe verdicts that were not requested on behalf of a task.
    /// The reporting connection's delegate id wins over whatever the results claim.
    pub async fn record_probe_results(
        &self,
        delegate_id: &str,
        results: Vec<DelegateConnectionResult>,
    ) -> Vec<DelegateConnectionResult> {
        let results: Vec<DelegateConnectionResult> = results
            .into_iter()
            .map(|r| DelegateConnectionResult {
                delegate_id: delegate_id.to_string(),
                ..r
            })
            .collect();
        self.capabilities.record_results(&results, Utc::now()).await;
        results
    }

    /// Store probe results from a delegate. Task status is not touched.
    pub async fn report_connection_results(
        &self,
        account_id: &str,
        delegate_id: &str,
        task_id: Uuid,
        results: Vec<DelegateConnectionResult>,
    ) -> Result<()> {
        let results = self.record_probe_results(delegate_id, results).await;

        let failed_criteria: Vec<String> = results
            .iter()
            .filter(|r| !r.validated)
            .map(|r| r.capability.criteria())
            .collect();
        tracing::debug!(
            task_id = %task_id,
            delegate_id = %delegate_id,
            failed = failed_criteria.len(),
            "Connection results reported"
        );
        self.queue
            .record_validation(
                account_id,
                task_id,
                delegate_id,
                ValidationSummary {
                    validated: failed_criteria.is_empty(),
                    failed_criteria,
                },
            )
            .await?;
        Ok(())
    }

    /// Pass a progress update through. Returns false if it was disregarded
    /// because the reporter no longer owns a running task.
    pub async fn publish_task_progress_response(
        &self,
        account_id: &str,
        delegate_id: &str,
        task_id: Uuid,
        progress: serde_json::Value,
    ) -> Result<bool> {
        let task = self.queue.get(account_id, task_id).await?;
        if !task.is_owned_by(delegate_id) {
            tracing::debug!(task_id = %task_id, delegate_id = %delegate_id, "Progress disregarded");
            return Ok(false);
        }
        self.emit(DispatchEvent::TaskProgress {
            account_id: account_id.to_string(),
            task_id,
            delegate_id: delegate_id.to_string(),
            progress,
        });
        Ok(true)
    }

    /// Final report from the executing delegate. A report for a task that
    /// was aborted or already ended is disregarded.
    pub async fn report_task_response(
        &self,
        account_id: &str,
        delegate_id: &str,
        task_id: Uuid,
        response: TaskResponse,
    ) -> Result<DelegateTask> {
        match response {
            TaskResponse::Success { result } => {
                let transition = self
                    .queue
                    .complete(account_id, task_id, delegate_id, result)
                    .await?;
                if transition.changed {
                    let mut batch = BatchDelegateSelectionLog::new(task_id, account_id);
                    batch.record(Some(delegate_id), DecisionKind::TaskFinished, "Task finished successfully");
                    self.finish_log(batch).await;
                    tracing::info!(task_id = %task_id, delegate_id = %delegate_id, "Task finished");
                    self.emit(DispatchEvent::TaskCompleted {
                        account_id: account_id.to_string(),
                        task_id,
                        status: TaskStatus::Finished,
                    });
                } else {
                    tracing::debug!(task_id = %task_id, "Result for ended task disregarded");
                }
                Ok(transition.task)
            }
            TaskResponse::Failure { message } => {
                let outcome = self
                    .fail_over(account_id, task_id, delegate_id, DecisionKind::TaskFailed, &message, Utc::now())
                    .await?;
                Ok(match outcome {
                    FailOver::Requeued(t) | FailOver::Exhausted(t) | FailOver::Ignored(t) => t,
                })
            }
        }
    }

    async fn fail_over(
        &self,
        account_id: &str,
        task_id: Uuid,
        delegate_id: &str,
        kind: DecisionKind,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<FailOver> {
        let task = self.queue.get(account_id, task_id).await?;
        if task.status.is_terminal() {
            return Ok(FailOver::Ignored(task));
        }

        let mut batch = BatchDelegateSelectionLog::new(task_id, account_id);
        batch.record(Some(delegate_id), kind, reason);

        let mut remaining = task.clone();
        remaining
            .excluded_delegate_ids
            .insert(delegate_id.to_string());
        let candidates: Vec<String> = self
            .evaluate_candidates(&remaining, &mut batch, now)
            .await
            .into_iter()
            .map(|d| d.id)
            .collect();

        let outcome = self
            .queue
            .fail_over(account_id, task_id, delegate_id, reason, &candidates)
            .await?;

        match &outcome {
            FailOver::Requeued(task) => {
                self.flush(&mut batch).await;
                self.emit(DispatchEvent::TaskRequeued {
                    account_id: account_id.to_string(),
                    task_id,
                    failed_delegate_id: delegate_id.to_string(),
                    eligible: task.eligible_delegate_ids.clone(),
                });
                self.offer(task, false, now).await;
            }
            FailOver::Exhausted(task) => {
                batch.record(
                    None,
                    DecisionKind::TaskFailed,
                    task.error_message.clone().unwrap_or_default(),
                );
                self.finish_log(batch).await;
                self.emit(DispatchEvent::TaskCompleted {
                    account_id: account_id.to_string(),
                    task_id,
                    status: TaskStatus::Error,
                });
            }
            FailOver::Ignored(_) => {}
        }
        Ok(outcome)
    }

    /// Fail over unless a concurrent report got there first.
    /// Returns whether this call moved the task.
    async fn try_fail_over(
        &self,
        account_id: &str,
        task_id: Uuid,
        delegate_id: &str,
        kind: DecisionKind,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        match self
            .fail_over(account_id, task_id, delegate_id, kind, reason, now)
            .await
        {
            Ok(FailOver::Ignored(_)) => Ok(false),
            Ok(_) => Ok(true),
            Err(DispatchError::NotAssigned { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Queued tasks this delegate could take, plus abort notices for tasks it ran
    pub async fn poll_task_events(&self, account_id: &str, delegate_id: &str) -> Result<Vec<TaskEvent>> {
        let now = Utc::now();
        let mut events = Vec::new();

        if let Some(delegate) = self.registry.get_for_account(account_id, delegate_id).await {
            for task in self.queue.queued(account_id).await? {
                if task.is_expired(now) || task.is_excluded(delegate_id) {
                    continue;
                }
                if self
                    .registry
                    .verdict(&delegate, &Self::query(&task), now)
                    .is_eligible()
                {
                    events.push(TaskEvent::Queued { task_id: task.id });
                }
            }
        }
        for task_id in self.queue.take_abort_notices(account_id, delegate_id).await? {
            events.push(TaskEvent::Aborted { task_id });
        }
        Ok(events)
    }

    // Sweeps

    /// Expire queued tasks past their deadline
    pub async fn expire_overdue(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut expired = 0;
        for task in self.queue.overdue(now).await? {
            let message = self.expiry_message(&task, now).await?;
            let transition = self
                .queue
                .expire_overdue(&task.account_id, task.id, &message, now)
                .await?;
            if transition.changed {
                self.record_expiry(&transition.task, &message).await;
                expired += 1;
            }
        }
        Ok(expired)
    }

    /// Fail over started tasks whose delegate has been silent longer than the
    /// execution timeout
    pub async fn requeue_stalled(&self, now: DateTime<Utc>) -> Result<usize> {
        let timeout = DispatchConfig::chrono(self.config.execution_timeout);
        let mut requeued = 0;
        for task in self.queue.started().await? {
            let Some(owner) = task.delegate_id.clone() else {
                continue;
            };
            let stalled = match self.registry.get(&owner).await {
                Some(d) => !d.connected || now.signed_duration_since(d.last_heartbeat) > timeout,
                None => true,
            };
            if !stalled {
                continue;
            }
            let reason = format!(
                "No heartbeat from the executing delegate within the {}s execution timeout",
                timeout.num_seconds()
            );
            if self
                .try_fail_over(&task.account_id, task.id, &owner, DecisionKind::Disconnected, &reason, now)
                .await?
            {
                requeued += 1;
            }
        }
        Ok(requeued)
    }

    /// Offer on queued tasks whose last offer went unanswered for the offer
    /// timeout, or that were never offered. Returns how many offers went out.
    pub async fn reoffer_stale(&self, now: DateTime<Utc>) -> Result<usize> {
        let timeout = DispatchConfig::chrono(self.config.offer_timeout);
        let mut reoffered = 0;
        for task in self.queue.all_queued().await? {
            if task.is_expired(now) || !task.offer_is_stale(now, timeout) {
                continue;
            }
            if self.offer(&task, true, now).await {
                reoffered += 1;
            }
        }
        Ok(reoffered)
    }

    /// Remove delegates silent past the reap threshold. Returns how many were removed.
    pub async fn reap_silent_delegates(&self, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = now - DispatchConfig::chrono(self.config.delegate_reap_after);
        let mut reaped = 0;
        for delegate in self.registry.silent_since(cutoff).await {
            self.fail_over_owned(&delegate.id, "Delegate was removed after prolonged silence", now)
                .await?;
            self.registry.remove(&delegate.id).await;
            self.capabilities.invalidate(&delegate.id).await;
            tracing::info!(delegate_id = %delegate.id, "Reaped silent delegate");
            reaped += 1;
        }
        Ok(reaped)
    }

    pub async fn evict_capabilities(&self, now: DateTime<Utc>) -> usize {
        self.capabilities.evict_expired(now).await
    }
}

fn package(task: &DelegateTask) -> Result<AcquireOutcome> {
    task.package()
        .map(AcquireOutcome::Acquired)
        .ok_or_else(|| DispatchError::Internal(format!("Started task {} has no delegate", task.id)))
}

/// Latest exclusion reason per delegate; a later CAN_ASSIGN clears it
fn exclusion_reasons(entries: &[SelectionLogEntry]) -> BTreeMap<String, String> {
    let mut reasons = BTreeMap::new();
    for entry in entries {
        let Some(delegate_id) = &entry.delegate_id else {
            continue;
        };
        match entry.conclusion {
            Conclusion::Rejected | Conclusion::Disconnected => {
                reasons.insert(
                    delegate_id.clone(),
                    format!("{}: {}", entry.kind.as_str(), entry.reason),
                );
            }
            Conclusion::Accepted => {
                reasons.remove(delegate_id);
            }
            Conclusion::Selected | Conclusion::Info => {}
        }
    }
    reasons
}

fn sync_outcome(task: DelegateTask) -> Result<serde_json::Value> {
    match task.status {
        TaskStatus::Finished => Ok(task.result.unwrap_or(serde_json::Value::Null)),
        TaskStatus::Error => Err(DispatchError::AllDelegatesFailed {
            task_id: task.id,
            message: task.error_message.unwrap_or_default(),
        }),
        TaskStatus::Expired => Err(DispatchError::Expired {
            task_id: task.id,
            message: task.error_message.unwrap_or_default(),
        }),
        TaskStatus::Aborted => Err(DispatchError::Aborted(task.id)),
        status => Err(DispatchError::InvalidStateTransition(format!(
            "Task {} is still {}",
            task.id,
            status.as_str()
        ))),
    }
}
