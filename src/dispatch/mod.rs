//! Delegate task dispatch
//!
//! Producers queue tasks for an account; delegates (remote agents) heartbeat,
//! discover tasks they are eligible for and race to claim them. Exactly one
//! delegate wins each claim, failed runs are retried on other delegates, and
//! every inclusion or exclusion decision lands in a per-task selection log.

pub mod capability;
pub mod delegate;
pub mod dispatcher;
pub mod queue;
pub mod registry;
pub mod selection_log;
pub mod sweeper;
pub mod task;

pub use capability::{
    CapabilityDescriptor, CapabilityRegistry, DelegateConnectionResult, PermissionResult,
    ProbeRequest,
};
pub use delegate::{
    ApprovalAction, ApprovalState, ConnectionMode, Delegate, DelegateProfile, DelegateRegistration,
    ScopeRule,
};
pub use dispatcher::{DispatchEvent, Dispatcher};
pub use queue::{ClaimOutcome, TaskQueue};
pub use registry::DelegateRegistry;
pub use selection_log::{
    BatchDelegateSelectionLog, Conclusion, DecisionKind, SelectionLogEntry, SelectionLogRecorder,
};
pub use sweeper::SweepReport;
pub use task::{
    AcquireOutcome, DelegateTask, TaskEvent, TaskPackage, TaskResponse, TaskStatus, TaskSubmission,
};
