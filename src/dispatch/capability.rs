//! Capability descriptors and the permission cache
//!
//! A task declares the resources it needs (an HTTP endpoint, a socket, an
//! executable, ...). Whether a delegate can reach them is either decided
//! locally by the dispatcher or probed on the delegate itself. Probe verdicts
//! are cached per (delegate, descriptor) with a bounded validity window.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use super::delegate::Delegate;
use crate::config::DispatchConfig;

/// A resource a task needs from whichever delegate runs it
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CapabilityDescriptor {
    /// Delegate must be able to reach an HTTP(S) URL
    HttpConnection { url: String },
    /// Delegate must be able to open a TCP connection
    SocketConnection { host: String, port: u16 },
    /// Delegate must have an executable on its path
    ProcessExecutor { executable: String },
    /// Delegate environment variable must hold a value
    SystemEnv { variable: String, expected: String },
    /// Delegate must belong to a named group
    DelegateGroup { group: String },
}

/// Where a capability gets evaluated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationMode {
    /// Decided by the dispatcher from the delegate record
    Manager,
    /// Probed on the delegate, verdict cached
    Agent,
}

impl CapabilityDescriptor {
    pub fn kind(&self) -> &'static str {
        match self {
            CapabilityDescriptor::HttpConnection { .. } => "http_connection",
            CapabilityDescriptor::SocketConnection { .. } => "socket_connection",
            CapabilityDescriptor::ProcessExecutor { .. } => "process_executor",
            CapabilityDescriptor::SystemEnv { .. } => "system_env",
            CapabilityDescriptor::DelegateGroup { .. } => "delegate_group",
        }
    }

    pub fn evaluation_mode(&self) -> EvaluationMode {
        match self {
            CapabilityDescriptor::DelegateGroup { .. } => EvaluationMode::Manager,
            _ => EvaluationMode::Agent,
        }
    }

    /// Human readable criteria, also the input to the fingerprint
    pub fn criteria(&self) -> String {
        match self {
            CapabilityDescriptor::HttpConnection { url } => url.clone(),
            CapabilityDescriptor::SocketConnection { host, port } => format!("{}:{}", host, port),
            CapabilityDescriptor::ProcessExecutor { executable } => executable.clone(),
            CapabilityDescriptor::SystemEnv { variable, expected } => {
                format!("{}={}", variable, expected)
            }
            CapabilityDescriptor::DelegateGroup { group } => group.clone(),
        }
    }

    /// Stable fingerprint used as the cache key
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.kind().as_bytes());
        hasher.update(b":");
        hasher.update(self.criteria().as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn validate(&self) -> Result<(), String> {
        let blank = match self {
            CapabilityDescriptor::HttpConnection { url } => url.trim().is_empty(),
            CapabilityDescriptor::SocketConnection { host, .. } => host.trim().is_empty(),
            CapabilityDescriptor::ProcessExecutor { executable } => executable.trim().is_empty(),
            CapabilityDescriptor::SystemEnv { variable, .. } => variable.trim().is_empty(),
            CapabilityDescriptor::DelegateGroup { group } => group.trim().is_empty(),
        };
        if blank {
            return Err(format!("{} capability has empty criteria", self.kind()));
        }
        if let CapabilityDescriptor::HttpConnection { url } = self {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(format!("http_connection criteria is not a URL: {}", url));
            }
        }
        Ok(())
    }
}

/// Verdict for one (delegate, capability) pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PermissionResult {
    Allowed,
    Denied,
    Unchecked,
}

impl PermissionResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionResult::Allowed => "ALLOWED",
            PermissionResult::Denied => "DENIED",
            PermissionResult::Unchecked => "UNCHECKED",
        }
    }
}

impl std::str::FromStr for PermissionResult {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ALLOWED" => Ok(PermissionResult::Allowed),
            "DENIED" => Ok(PermissionResult::Denied),
            "UNCHECKED" => Ok(PermissionResult::Unchecked),
            _ => Err(format!("Invalid permission result: {}", s)),
        }
    }
}

/// Cached verdict for a delegate against one capability fingerprint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilitySubjectPermission {
    pub delegate_id: String,
    pub descriptor_hash: String,
    pub criteria: String,
    pub permission: PermissionResult,
    pub checked_at: DateTime<Utc>,
    pub max_validity: Duration,
}

impl CapabilitySubjectPermission {
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.checked_at) >= DispatchConfig::chrono(self.max_validity)
    }

    /// The verdict as of `now`; a stale record reads as unchecked
    pub fn effective(&self, now: DateTime<Utc>) -> PermissionResult {
        if self.is_stale(now) {
            PermissionResult::Unchecked
        } else {
            self.permission
        }
    }
}

/// A delegate's answer to one probe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelegateConnectionResult {
    pub delegate_id: String,
    pub capability: CapabilityDescriptor,
    pub validated: bool,
    #[serde(default)]
    pub duration_ms: u64,
}

/// Request for a delegate to probe a batch of capabilities
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeRequest {
    pub delegate_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<Uuid>,
    pub capabilities: Vec<CapabilityDescriptor>,
    pub requested_at: DateTime<Utc>,
}

type PermissionKey = (String, String);

/// Permission cache plus the outbound probe channel
pub struct CapabilityRegistry {
    permissions: RwLock<HashMap<PermissionKey, CapabilitySubjectPermission>>,
    in_flight: RwLock<HashMap<PermissionKey, DateTime<Utc>>>,
    allowed_validity: Duration,
    denied_validity: Duration,
    probe_tx: broadcast::Sender<ProbeRequest>,
}

impl CapabilityRegistry {
    pub fn new(allowed_validity: Duration, denied_validity: Duration) -> Self {
        let (probe_tx, _) = broadcast::channel(256);
        Self {
            permissions: RwLock::new(HashMap::new()),
            in_flight: RwLock::new(HashMap::new()),
            allowed_validity,
            denied_validity,
            probe_tx,
        }
    }

    pub fn from_config(config: &DispatchConfig) -> Self {
        Self::new(
            config.capability_allowed_validity,
            config.capability_denied_validity,
        )
    }

    /// Subscribe to probe requests bound for delegates
    pub fn subscribe_probes(&self) -> broadcast::Receiver<ProbeRequest> {
        self.probe_tx.subscribe()
    }

    /// Check one capability for one delegate
    pub async fn check_permission(
        &self,
        delegate: &Delegate,
        descriptor: &CapabilityDescriptor,
    ) -> PermissionResult {
        let mut results = self
            .batch_check_at(delegate, std::slice::from_ref(descriptor), None, Utc::now())
            .await;
        results
            .pop()
            .map_or(PermissionResult::Unchecked, |(_, result)| result)
    }

    /// Check several capabilities; unchecked agent-side ones go out as a single probe
    pub async fn batch_check(
        &self,
        delegate: &Delegate,
        descriptors: &[CapabilityDescriptor],
        task_id: Option<Uuid>,
    ) -> Vec<(CapabilityDescriptor, PermissionResult)> {
        self.batch_check_at(delegate, descriptors, task_id, Utc::now())
            .await
    }

    pub async fn batch_check_at(
        &self,
        delegate: &Delegate,
        descriptors: &[CapabilityDescriptor],
        task_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Vec<(CapabilityDescriptor, PermissionResult)> {
        let mut results = Vec::with_capacity(descriptors.len());
        let mut unchecked = Vec::new();

        {
            let permissions = self.permissions.read().await;
            for descriptor in descriptors {
                let result = match descriptor.evaluation_mode() {
                    EvaluationMode::Manager => evaluate_locally(delegate, descriptor),
                    EvaluationMode::Agent => permissions
                        .get(&(delegate.id.clone(), descriptor.fingerprint()))
                        .map_or(PermissionResult::Unchecked, |p| p.effective(now)),
                };
                if result == PermissionResult::Unchecked {
                    unchecked.push(descriptor.clone());
                }
                results.push((descriptor.clone(), result));
            }
        }

        if !unchecked.is_empty() {
            self.request_probe(&delegate.id, unchecked, task_id, now)
                .await;
        }
        results
    }

    /// Emit one probe for the descriptors not already being probed
    async fn request_probe(
        &self,
        delegate_id: &str,
        descriptors: Vec<CapabilityDescriptor>,
        task_id: Option<Uuid>,
        now: DateTime<Utc>,
    ) {
        let retry_after = DispatchConfig::chrono(self.denied_validity);
        let mut in_flight = self.in_flight.write().await;
        let mut seen = BTreeSet::new();
        let pending: Vec<CapabilityDescriptor> = descriptors
            .into_iter()
            .filter(|d| {
                let key = (delegate_id.to_string(), d.fingerprint());
                let fresh = in_flight
                    .get(&key)
                    .map_or(true, |since| now.signed_duration_since(*since) >= retry_after);
                fresh && seen.insert(key.1)
            })
            .collect();

        if pending.is_empty() {
            return;
        }
        for d in &pending {
            in_flight.insert((delegate_id.to_string(), d.fingerprint()), now);
        }
        drop(in_flight);

        tracing::debug!(
            delegate_id = %delegate_id,
            count = pending.len(),
            "Requesting capability probe"
        );
        // No subscriber means the delegate is not streaming; it will pick
        // the probe up again on its next acquire attempt.
        let _ = self.probe_tx.send(ProbeRequest {
            delegate_id: delegate_id.to_string(),
            task_id,
            capabilities: pending,
            requested_at: now,
        });
    }

    /// Store probe verdicts reported by delegates
    pub async fn record_results(&self, results: &[DelegateConnectionResult], checked_at: DateTime<Utc>) {
        let mut permissions = self.permissions.write().await;
        let mut in_flight = self.in_flight.write().await;
        for result in results {
            if result.capability.evaluation_mode() == EvaluationMode::Manager {
                continue;
            }
            let hash = result.capability.fingerprint();
            let key = (result.delegate_id.clone(), hash.clone());
            let (permission, max_validity) = if result.validated {
                (PermissionResult::Allowed, self.allowed_validity)
            } else {
                (PermissionResult::Denied, self.denied_validity)
            };
            in_flight.remove(&key);
            permissions.insert(
                key,
                CapabilitySubjectPermission {
                    delegate_id: result.delegate_id.clone(),
                    descriptor_hash: hash,
                    criteria: result.capability.criteria(),
                    permission,
                    checked_at,
                    max_validity,
                },
            );
        }
    }

    pub async fn cached(
        &self,
        delegate_id: &str,
        descriptor: &CapabilityDescriptor,
    ) -> Option<CapabilitySubjectPermission> {
        self.permissions
            .read()
            .await
            .get(&(delegate_id.to_string(), descriptor.fingerprint()))
            .cloned()
    }

    /// Drop every cached verdict for a delegate. Returns how many were removed.
    pub async fn invalidate(&self, delegate_id: &str) -> usize {
        let mut permissions = self.permissions.write().await;
        let before = permissions.len();
        permissions.retain(|(d, _), _| d != delegate_id);
        self.in_flight
            .write()
            .await
            .retain(|(d, _), _| d != delegate_id);
        before - permissions.len()
    }

    /// Drop stale verdicts
    pub async fn evict_expired(&self, now: DateTime<Utc>) -> usize {
        let mut permissions = self.permissions.write().await;
        let before = permissions.len();
        permissions.retain(|_, p| !p.is_stale(now));
        before - permissions.len()
    }
}

fn evaluate_locally(delegate: &Delegate, descriptor: &CapabilityDescriptor) -> PermissionResult {
    match descriptor {
        CapabilityDescriptor::DelegateGroup { group } => {
            if delegate.group_name.as_deref() == Some(group.as_str()) {
                PermissionResult::Allowed
            } else {
                PermissionResult::Denied
            }
        }
        _ => PermissionResult::Unchecked,
    }
}
