//! Delegate model
//!
//! A delegate is a remote worker process. Besides identity it carries the
//! selectors it declares, the scope rules that restrict which tasks it may
//! take, an optional profile with its own scoping rules, its approval state
//! and its liveness (connection flag plus last heartbeat).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Task or rule value that matches anything
pub const SCOPE_WILDCARD: &str = "*";

/// How a delegate talks to the dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionMode {
    /// Periodically polls for task events
    Polling,
    /// Holds an open WebSocket and receives pushes
    Streaming,
}

impl ConnectionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionMode::Polling => "polling",
            ConnectionMode::Streaming => "streaming",
        }
    }
}

impl std::str::FromStr for ConnectionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "polling" => Ok(ConnectionMode::Polling),
            "streaming" => Ok(ConnectionMode::Streaming),
            _ => Err(format!("Invalid connection mode: {}", s)),
        }
    }
}

/// Approval state of a delegate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalState {
    Pending,
    Approved,
    Rejected,
    Blocklisted,
}

impl ApprovalState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalState::Pending => "pending",
            ApprovalState::Approved => "approved",
            ApprovalState::Rejected => "rejected",
            ApprovalState::Blocklisted => "blocklisted",
        }
    }
}

impl std::str::FromStr for ApprovalState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ApprovalState::Pending),
            "approved" => Ok(ApprovalState::Approved),
            "rejected" => Ok(ApprovalState::Rejected),
            "blocklisted" => Ok(ApprovalState::Blocklisted),
            _ => Err(format!("Invalid approval state: {}", s)),
        }
    }
}

/// Administrative approval action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalAction {
    Approve,
    Reject,
    Blocklist,
}

impl ApprovalAction {
    /// The approval state this action moves a delegate into
    pub fn target_state(&self) -> ApprovalState {
        match self {
            ApprovalAction::Approve => ApprovalState::Approved,
            ApprovalAction::Reject => ApprovalState::Rejected,
            ApprovalAction::Blocklist => ApprovalState::Blocklisted,
        }
    }
}

/// A scope rule: the task's setup abstraction `key` must take one of `values`.
///
/// A value ending in `*` is a prefix glob. A task value of `*` matches any rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeRule {
    pub key: String,
    pub values: Vec<String>,
}

impl ScopeRule {
    pub fn new(key: impl Into<String>, values: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            key: key.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    /// Whether the task's abstractions satisfy this rule.
    ///
    /// A task that does not carry the rule's key does not match.
    pub fn matches(&self, abstractions: &BTreeMap<String, String>) -> bool {
        let Some(task_value) = abstractions.get(&self.key) else {
            return false;
        };
        if task_value == SCOPE_WILDCARD {
            return true;
        }
        self.values.iter().any(|v| value_matches(v, task_value))
    }

    pub fn describe(&self) -> String {
        format!("{} in [{}]", self.key, self.values.join(", "))
    }
}

fn value_matches(pattern: &str, value: &str) -> bool {
    if pattern == SCOPE_WILDCARD {
        return true;
    }
    match pattern.strip_suffix('*') {
        Some(prefix) => value.starts_with(prefix),
        None => pattern == value,
    }
}

/// Delegate profile: a named set of scoping rules shared by many delegates
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegateProfile {
    pub id: String,
    #[serde(default)]
    pub scoping_rules: Vec<ScopeRule>,
}

impl DelegateProfile {
    /// Every rule whose key the task carries must accept the task's value
    pub fn admits(&self, abstractions: &BTreeMap<String, String>) -> bool {
        self.scoping_rules
            .iter()
            .filter(|rule| abstractions.contains_key(&rule.key))
            .all(|rule| rule.matches(abstractions))
    }
}

/// Outcome of checking a delegate's include/exclude scopes against a task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopeVerdict {
    InScope,
    NoIncludeMatched,
    Excluded(ScopeRule),
}

/// A registered delegate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delegate {
    pub id: String,
    pub account_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_name: Option<String>,
    pub selectors: BTreeSet<String>,
    pub include_scopes: Vec<ScopeRule>,
    pub exclude_scopes: Vec<ScopeRule>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile: Option<DelegateProfile>,
    pub connection_mode: ConnectionMode,
    pub approval: ApprovalState,
    pub connected: bool,
    pub last_heartbeat: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
}

impl Delegate {
    /// Minimal delegate record, as created by a heartbeat from an unknown delegate
    pub fn minimal(
        id: impl Into<String>,
        account_id: impl Into<String>,
        connection_mode: ConnectionMode,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            account_id: account_id.into(),
            group_name: None,
            selectors: BTreeSet::new(),
            include_scopes: Vec::new(),
            exclude_scopes: Vec::new(),
            profile: None,
            connection_mode,
            approval: ApprovalState::Pending,
            connected: true,
            last_heartbeat: now,
            registered_at: now,
        }
    }

    pub fn with_selectors(mut self, selectors: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.selectors = selectors.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group_name = Some(group.into());
        self
    }

    pub fn with_include_scope(mut self, rule: ScopeRule) -> Self {
        self.include_scopes.push(rule);
        self
    }

    pub fn with_exclude_scope(mut self, rule: ScopeRule) -> Self {
        self.exclude_scopes.push(rule);
        self
    }

    pub fn with_profile(mut self, profile: DelegateProfile) -> Self {
        self.profile = Some(profile);
        self
    }

    pub fn with_approval(mut self, approval: ApprovalState) -> Self {
        self.approval = approval;
        self
    }

    pub fn is_approved(&self) -> bool {
        self.approval == ApprovalState::Approved
    }

    /// Live means connected and heard from within `timeout`
    pub fn is_live(&self, now: DateTime<Utc>, timeout: chrono::Duration) -> bool {
        self.connected && now.signed_duration_since(self.last_heartbeat) < timeout
    }

    /// Apply a heartbeat. Older timestamps never move liveness backwards.
    ///
    /// Returns true if the stored heartbeat advanced.
    pub fn record_heartbeat(&mut self, at: DateTime<Utc>, mode: ConnectionMode) -> bool {
        self.connected = true;
        self.connection_mode = mode;
        if at > self.last_heartbeat {
            self.last_heartbeat = at;
            true
        } else {
            false
        }
    }

    /// Required selectors this delegate does not declare, in sorted order
    pub fn missing_selectors<'a>(&self, required: &'a BTreeSet<String>) -> Vec<&'a str> {
        required
            .iter()
            .filter(|s| !self.selectors.contains(*s))
            .map(String::as_str)
            .collect()
    }

    pub fn scope_verdict(&self, abstractions: &BTreeMap<String, String>) -> ScopeVerdict {
        if !self.include_scopes.is_empty()
            && !self.include_scopes.iter().any(|rule| rule.matches(abstractions))
        {
            return ScopeVerdict::NoIncludeMatched;
        }
        match self
            .exclude_scopes
            .iter()
            .find(|rule| rule.matches(abstractions))
        {
            Some(rule) => ScopeVerdict::Excluded(rule.clone()),
            None => ScopeVerdict::InScope,
        }
    }

    pub fn profile_admits(&self, abstractions: &BTreeMap<String, String>) -> bool {
        self.profile
            .as_ref()
            .map_or(true, |profile| profile.admits(abstractions))
    }
}

/// Full registration as sent by the provisioning layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelegateRegistration {
    pub delegate_id: String,
    pub account_id: String,
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
    pub connection_mode: ConnectionMode,
}

impl DelegateRegistration {
    pub fn into_delegate(self, approval: ApprovalState, now: DateTime<Utc>) -> Delegate {
        Delegate {
            id: self.delegate_id,
            account_id: self.account_id,
            group_name: self.group_name,
            selectors: self.selectors,
            include_scopes: self.include_scopes,
            exclude_scopes: self.exclude_scopes,
            profile: self.profile,
            connection_mode: self.connection_mode,
            approval,
            connected: true,
            last_heartbeat: now,
            registered_at: now,
        }
    }
}
