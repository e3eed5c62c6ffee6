//! Dispatch configuration
//!
//! The retry budget and the execution timeout are deployment decisions, so
//! they have to be supplied explicitly. Everything else has a default.

use std::time::Duration;

pub const DEFAULT_HEARTBEAT_TIMEOUT_SECS: u64 = 90;
pub const DEFAULT_TASK_EXPIRY_SECS: u64 = 3600;
pub const DEFAULT_SYNC_TASK_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_CAPABILITY_ALLOWED_VALIDITY_SECS: u64 = 6 * 3600;
pub const DEFAULT_CAPABILITY_DENIED_VALIDITY_SECS: u64 = 600;
pub const DEFAULT_DELEGATE_REAP_AFTER_SECS: u64 = 6 * 3600;
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 5;
pub const DEFAULT_OFFER_TIMEOUT_SECS: u64 = 30;

const MAX_DURATION_DAYS: i64 = 36_500;

/// Tunables for the dispatcher, claim engine and background sweeper
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// How many times a failed task is re-queued before it ends in `ERROR`
    pub max_retries: u32,
    /// Heartbeat silence from an executing delegate after which its task fails over
    pub execution_timeout: Duration,
    /// Heartbeat age after which a delegate no longer counts as live
    pub heartbeat_timeout: Duration,
    /// Expiry applied to submissions that do not carry their own
    pub default_task_expiry: Duration,
    /// How long `execute_task` waits for a result
    pub sync_task_timeout: Duration,
    /// Validity window of an ALLOWED capability verdict
    pub capability_allowed_validity: Duration,
    /// Validity window of a DENIED capability verdict
    pub capability_denied_validity: Duration,
    /// Heartbeat silence after which the reaper removes a delegate
    pub delegate_reap_after: Duration,
    /// Period of the background sweeper
    pub sweep_interval: Duration,
    /// How long an offered delegate has to act before the task is offered on
    pub offer_timeout: Duration,
    /// Whether a delegate auto-created by a heartbeat starts out approved
    pub approve_on_heartbeat: bool,
}

impl DispatchConfig {
    pub fn new(max_retries: u32, execution_timeout: Duration) -> Self {
        Self {
            max_retries,
            execution_timeout,
            heartbeat_timeout: Duration::from_secs(DEFAULT_HEARTBEAT_TIMEOUT_SECS),
            default_task_expiry: Duration::from_secs(DEFAULT_TASK_EXPIRY_SECS),
            sync_task_timeout: Duration::from_secs(DEFAULT_SYNC_TASK_TIMEOUT_SECS),
            capability_allowed_validity: Duration::from_secs(
                DEFAULT_CAPABILITY_ALLOWED_VALIDITY_SECS,
            ),
            capability_denied_validity: Duration::from_secs(
                DEFAULT_CAPABILITY_DENIED_VALIDITY_SECS,
            ),
            delegate_reap_after: Duration::from_secs(DEFAULT_DELEGATE_REAP_AFTER_SECS),
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
            offer_timeout: Duration::from_secs(DEFAULT_OFFER_TIMEOUT_SECS),
            approve_on_heartbeat: true,
        }
    }

    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    pub fn with_default_task_expiry(mut self, expiry: Duration) -> Self {
        self.default_task_expiry = expiry;
        self
    }

    pub fn with_sync_task_timeout(mut self, timeout: Duration) -> Self {
        self.sync_task_timeout = timeout;
        self
    }

    pub fn with_capability_validity(mut self, allowed: Duration, denied: Duration) -> Self {
        self.capability_allowed_validity = allowed;
        self.capability_denied_validity = denied;
        self
    }

    pub fn with_delegate_reap_after(mut self, reap_after: Duration) -> Self {
        self.delegate_reap_after = reap_after;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_offer_timeout(mut self, timeout: Duration) -> Self {
        self.offer_timeout = timeout;
        self
    }

    pub fn with_approve_on_heartbeat(mut self, approve: bool) -> Self {
        self.approve_on_heartbeat = approve;
        self
    }

    /// `std::time::Duration` → `chrono::Duration`, capped at a century so
    /// timestamp arithmetic cannot overflow
    pub(crate) fn chrono(d: Duration) -> chrono::Duration {
        let cap = chrono::Duration::days(MAX_DURATION_DAYS);
        chrono::Duration::from_std(d).map_or(cap, |d| d.min(cap))
    }
}
