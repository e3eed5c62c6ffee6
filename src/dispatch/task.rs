//! Delegate tasks
//!
//! A task is an opaque payload plus the requirements a delegate has to meet
//! to run it. The record also carries the dispatch bookkeeping: which
//! delegates were found eligible, which were tried and excluded, and what
//! their capability probes reported.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

use super::capability::CapabilityDescriptor;
use crate::config::DispatchConfig;
use crate::error::{DispatchError, Result};

/// Status of a delegate task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for a delegate to claim it
    Queued,
    /// Claimed and executing on exactly one delegate
    Started,
    /// Delegate reported success
    Finished,
    /// Retries exhausted, or no delegate left to try
    Error,
    /// Cancelled by the producer
    Aborted,
    /// Aged out
    Expired,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Started => "started",
            TaskStatus::Finished => "finished",
            TaskStatus::Error => "error",
            TaskStatus::Aborted => "aborted",
            TaskStatus::Expired => "expired",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Finished | TaskStatus::Error | TaskStatus::Aborted | TaskStatus::Expired
        )
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "queued" => Ok(TaskStatus::Queued),
            "started" => Ok(TaskStatus::Started),
            "finished" => Ok(TaskStatus::Finished),
            "error" => Ok(TaskStatus::Error),
            "aborted" => Ok(TaskStatus::Aborted),
            "expired" => Ok(TaskStatus::Expired),
            _ => Err(format!("Invalid task status: {}", s)),
        }
    }
}

/// What a delegate's capability probes reported for one task
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationSummary {
    pub validated: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed_criteria: Vec<String>,
}

/// A unit of remote work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelegateTask {
    pub id: Uuid,
    pub account_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub payload: serde_json::Value,
    pub capabilities: Vec<CapabilityDescriptor>,
    pub selectors: BTreeSet<String>,
    pub setup_abstractions: BTreeMap<String, String>,
    pub status: TaskStatus,
    /// Bumped on every write; the claim compares against it
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delegate_id: Option<String>,
    pub eligible_delegate_ids: Vec<String>,
    pub excluded_delegate_ids: BTreeSet<String>,
    pub validating_delegate_ids: BTreeSet<String>,
    pub validation_results: BTreeMap<String, ValidationSummary>,
    /// Delegates offered the task in the current round
    pub offered_delegate_ids: BTreeSet<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offered_at: Option<DateTime<Utc>>,
    /// Execution failures so far
    pub attempts: u32,
    pub max_retries: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip)]
    pub abort_notified: bool,
}

impl DelegateTask {
    /// Build a queued task from a validated submission
    pub fn from_submission(
        submission: TaskSubmission,
        config: &DispatchConfig,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        submission.validate()?;

        let expiry = submission
            .expiry_secs
            .map(std::time::Duration::from_secs)
            .unwrap_or(config.default_task_expiry);

        Ok(Self {
            id: Uuid::new_v4(),
            account_id: submission.account_id,
            description: submission.description,
            payload: submission.payload,
            capabilities: submission.capabilities,
            selectors: submission.selectors,
            setup_abstractions: submission.setup_abstractions,
            status: TaskStatus::Queued,
            version: 0,
            created_at: now,
            updated_at: now,
            expires_at: now + DispatchConfig::chrono(expiry),
            started_at: None,
            delegate_id: None,
            eligible_delegate_ids: Vec::new(),
            excluded_delegate_ids: BTreeSet::new(),
            validating_delegate_ids: BTreeSet::new(),
            validation_results: BTreeMap::new(),
            offered_delegate_ids: BTreeSet::new(),
            offered_at: None,
            attempts: 0,
            max_retries: submission.max_retries.unwrap_or(config.max_retries),
            result: None,
            error_message: None,
            abort_notified: false,
        })
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn is_excluded(&self, delegate_id: &str) -> bool {
        self.excluded_delegate_ids.contains(delegate_id)
    }

    pub fn is_eligible(&self, delegate_id: &str) -> bool {
        self.eligible_delegate_ids.iter().any(|d| d == delegate_id)
    }

    pub fn is_owned_by(&self, delegate_id: &str) -> bool {
        self.status == TaskStatus::Started && self.delegate_id.as_deref() == Some(delegate_id)
    }

    /// Whether the last offer went unanswered for longer than `timeout`
    pub fn offer_is_stale(&self, now: DateTime<Utc>, timeout: chrono::Duration) -> bool {
        self.offered_at
            .map_or(true, |at| now.signed_duration_since(at) >= timeout)
    }

    /// Whether another failure would still leave retry budget
    pub fn has_retry_budget(&self) -> bool {
        self.attempts < self.max_retries
    }

    /// The package handed to the winning delegate
    pub fn package(&self) -> Option<TaskPackage> {
        Some(TaskPackage {
            task_id: self.id,
            account_id: self.account_id.clone(),
            delegate_id: self.delegate_id.clone()?,
            description: self.description.clone(),
            payload: self.payload.clone(),
            capabilities: self.capabilities.clone(),
            expires_at: self.expires_at,
        })
    }
}

/// A producer's request to run some work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSubmission {
    pub account_id: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub capabilities: Vec<CapabilityDescriptor>,
    #[serde(default)]
    pub selectors: BTreeSet<String>,
    #[serde(default)]
    pub setup_abstractions: BTreeMap<String, String>,
    /// Overrides the configured default expiry
    #[serde(default)]
    pub expiry_secs: Option<u64>,
    /// Overrides the configured retry budget
    #[serde(default)]
    pub max_retries: Option<u32>,
}

impl TaskSubmission {
    pub fn new(account_id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            account_id: account_id.into(),
            description: None,
            payload,
            capabilities: Vec::new(),
            selectors: BTreeSet::new(),
            setup_abstractions: BTreeMap::new(),
            expiry_secs: None,
            max_retries: None,
        }
    }

    pub fn with_selectors(mut self, selectors: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.selectors = selectors.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_capability(mut self, capability: CapabilityDescriptor) -> Self {
        self.capabilities.push(capability);
        self
    }

    pub fn with_abstraction(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.setup_abstractions.insert(key.into(), value.into());
        self
    }

    pub fn with_expiry_secs(mut self, secs: u64) -> Self {
        self.expiry_secs = Some(secs);
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.account_id.trim().is_empty() {
            return Err(DispatchError::InvalidTask("account_id is required".to_string()));
        }
        if self.expiry_secs == Some(0) {
            return Err(DispatchError::InvalidTask(
                "expiry_secs must be positive".to_string(),
            ));
        }
        if self.selectors.iter().any(|s| s.trim().is_empty()) {
            return Err(DispatchError::InvalidTask("selectors must not be blank".to_string()));
        }
        for capability in &self.capabilities {
            capability.validate().map_err(DispatchError::InvalidTask)?;
        }
        Ok(())
    }
}

/// What the winning delegate receives
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskPackage {
    pub task_id: Uuid,
    pub account_id: String,
    pub delegate_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub payload: serde_json::Value,
    pub capabilities: Vec<CapabilityDescriptor>,
    pub expires_at: DateTime<Utc>,
}

/// Final report from the executing delegate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TaskResponse {
    Success {
        #[serde(default)]
        result: serde_json::Value,
    },
    Failure {
        message: String,
    },
}

/// Result of `acquire_task`
#[derive(Debug, Clone, PartialEq)]
pub enum AcquireOutcome {
    /// The caller owns the task
    Acquired(TaskPackage),
    /// Probe these capabilities, report the results, then ask again
    ValidationRequired {
        task_id: Uuid,
        capabilities: Vec<CapabilityDescriptor>,
    },
    /// Nothing for this delegate: lost the race, not eligible, or gone
    NotAvailable,
}

impl AcquireOutcome {
    pub fn is_acquired(&self) -> bool {
        matches!(self, AcquireOutcome::Acquired(_))
    }
}

/// An entry returned by task event polling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TaskEvent {
    Queued { task_id: Uuid },
    Aborted { task_id: Uuid },
}
