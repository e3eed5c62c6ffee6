//! Request and response bodies for the REST surface

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

use crate::dispatch::{
    ApprovalAction, CapabilityDescriptor, ConnectionMode, DelegateProfile, DelegateRegistration,
    ScopeRule, TaskSubmission,
};

/// Request to queue a task. The account comes from the path.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateTaskRequest {
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
    #[serde(default)]
    pub expiry_secs: Option<u64>,
    #[serde(default)]
    pub max_retries: Option<u32>,
}

impl CreateTaskRequest {
    pub fn into_submission(self, account_id: &str) -> TaskSubmission {
        TaskSubmission {
            account_id: account_id.to_string(),
            description: self.description,
            payload: self.payload,
            capabilities: self.capabilities,
            selectors: self.selectors,
            setup_abstractions: self.setup_abstractions,
            expiry_secs: self.expiry_secs,
            max_retries: self.max_retries,
        }
    }
}

/// Result of a synchronous execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteTaskResponse {
    pub result: serde_json::Value,
}

/// Full delegate registration. The account comes from the path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterDelegateRequest {
    pub delegate_id: String,
    #[serde(default)]
    pub group_name: Option<String>,
    #[serde(default)]
    pub selectors: BTreeSet<String>,
    #[serde(default)]
    pub include_scopes: Vec<ScopeRule>,
    #[serde(default)]
    pub exclude_scopes: Vec<ScopeRule>,
    #[serde(default)]
    pub profile: Option<DelegateProfile>,
    #[serde(default = "default_connection_mode")]
    pub connection_mode: ConnectionMode,
}

fn default_connection_mode() -> ConnectionMode {
    ConnectionMode::Polling
}

impl RegisterDelegateRequest {
    pub fn into_registration(self, account_id: &str) -> DelegateRegistration {
        DelegateRegistration {
            delegate_id: self.delegate_id,
            account_id: account_id.to_string(),
            group_name: self.group_name,
            selectors: self.selectors,
            include_scopes: self.include_scopes,
            exclude_scopes: self.exclude_scopes,
            profile: self.profile,
            connection_mode: self.connection_mode,
        }
    }
}

/// Request to approve, reject or blocklist a delegate
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub action: ApprovalAction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectedDelegateResponse {
    pub task_id: Uuid,
    pub delegate_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisconnectResponse {
    pub delegate_id: String,
    /// Started tasks that were failed over
    pub failed_over: usize,
}
