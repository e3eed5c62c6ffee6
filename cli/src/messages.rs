//! Wire types for the dispatch server
//!
//! These mirror the server's protocol. Fields the CLI never reads are left
//! out; serde skips them on the way in.

#![allow(dead_code)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// A resource a task needs from the delegate that runs it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CapabilityDescriptor {
    HttpConnection { url: String },
    SocketConnection { host: String, port: u16 },
    ProcessExecutor { executable: String },
    SystemEnv { variable: String, expected: String },
    DelegateGroup { group: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionMode {
    Polling,
    Streaming,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalState {
    Pending,
    Approved,
    Rejected,
    Blocklisted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Started,
    Finished,
    Error,
    Aborted,
    Expired,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskStatus::Queued | TaskStatus::Started)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delegate {
    pub id: String,
    pub account_id: String,
    #[serde(default)]
    pub selectors: BTreeSet<String>,
    pub connection_mode: ConnectionMode,
    pub approval: ApprovalState,
    pub connected: bool,
    pub last_heartbeat: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelegateTask {
    pub id: Uuid,
    pub account_id: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub delegate_id: Option<String>,
    #[serde(default)]
    pub eligible_delegate_ids: Vec<String>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error_message: Option<String>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionLogEntry {
    #[serde(default)]
    pub seq: Option<u32>,
    #[serde(default)]
    pub delegate_id: Option<String>,
    pub kind: String,
    pub conclusion: String,
    pub reason: String,
    pub recorded_at: DateTime<Utc>,
}

/// Body for queueing a task
#[derive(Debug, Clone, Default, Serialize)]
pub struct CreateTaskRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub payload: serde_json::Value,
    pub capabilities: Vec<CapabilityDescriptor>,
    pub selectors: BTreeSet<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiry_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecuteTaskResponse {
    pub result: serde_json::Value,
}

/// What the winning delegate receives
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPackage {
    pub task_id: Uuid,
    pub delegate_id: String,
    #[serde(default)]
    pub description: Option<String>,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub capabilities: Vec<CapabilityDescriptor>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TaskResponse {
    Success { result: serde_json::Value },
    Failure { message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelegateConnectionResult {
    pub delegate_id: String,
    pub capability: CapabilityDescriptor,
    pub validated: bool,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TaskEvent {
    Queued { task_id: Uuid },
    Aborted { task_id: Uuid },
}

/// Messages from delegate to server
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Register {
        delegate_id: String,
        account_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        group_name: Option<String>,
        selectors: BTreeSet<String>,
        connection_mode: ConnectionMode,
    },
    Heartbeat {
        account_id: String,
        delegate_id: String,
        connection_mode: ConnectionMode,
    },
    Poll,
    Acquire { task_id: Uuid },
    ReportConnectionResults {
        #[serde(skip_serializing_if = "Option::is_none")]
        task_id: Option<Uuid>,
        results: Vec<DelegateConnectionResult>,
    },
    Progress {
        task_id: Uuid,
        progress: serde_json::Value,
    },
    ReportResult {
        task_id: Uuid,
        response: TaskResponse,
    },
}

/// Messages from server to delegate
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Registered { delegate: Delegate },
    HeartbeatAck {
        delegate_id: String,
        approval: ApprovalState,
    },
    TaskEvents { events: Vec<TaskEvent> },
    TaskOffered { task_id: Uuid },
    ValidateCapabilities {
        #[serde(default)]
        task_id: Option<Uuid>,
        capabilities: Vec<CapabilityDescriptor>,
    },
    TaskAcquired { package: TaskPackage },
    ValidationRequired {
        task_id: Uuid,
        capabilities: Vec<CapabilityDescriptor>,
    },
    NoTask { task_id: Uuid },
    TaskAborted { task_id: Uuid },
    ResultAccepted { task_id: Uuid, status: TaskStatus },
    Ack,
    Error { message: String },
}
