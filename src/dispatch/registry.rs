//! Delegate registry
//!
//! Source of truth for which delegates exist and whether they can take work
//! right now. Lookups that find nobody return empty results, never errors.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tokio::sync::RwLock;

use super::delegate::{
    ApprovalAction, ApprovalState, ConnectionMode, Delegate, DelegateRegistration, ScopeVerdict,
};
use super::selection_log::DecisionKind;
use crate::config::DispatchConfig;
use crate::error::{DispatchError, Result};

/// What a task requires of a delegate, minus capabilities
#[derive(Debug, Clone, Copy)]
pub struct EligibilityQuery<'a> {
    pub account_id: &'a str,
    pub selectors: &'a BTreeSet<String>,
    pub setup_abstractions: &'a BTreeMap<String, String>,
}

/// Registry verdict for one delegate against one query
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Eligible,
    Ineligible { kind: DecisionKind, reason: String },
}

impl Verdict {
    fn reject(kind: DecisionKind, reason: impl Into<String>) -> Self {
        Verdict::Ineligible {
            kind,
            reason: reason.into(),
        }
    }

    pub fn is_eligible(&self) -> bool {
        matches!(self, Verdict::Eligible)
    }
}

pub struct DelegateRegistry {
    delegates: RwLock<HashMap<String, Delegate>>,
    heartbeat_timeout: chrono::Duration,
    approve_on_heartbeat: bool,
}

impl DelegateRegistry {
    pub fn new(config: &DispatchConfig) -> Self {
        Self {
            delegates: RwLock::new(HashMap::new()),
            heartbeat_timeout: DispatchConfig::chrono(config.heartbeat_timeout),
            approve_on_heartbeat: config.approve_on_heartbeat,
        }
    }

    fn initial_approval(&self) -> ApprovalState {
        if self.approve_on_heartbeat {
            ApprovalState::Approved
        } else {
            ApprovalState::Pending
        }
    }

    /// Create or replace a delegate's declared attributes. Approval and
    /// liveness history of an existing record are kept.
    pub async fn register(&self, registration: DelegateRegistration, now: DateTime<Utc>) -> Delegate {
        let mut delegates = self.delegates.write().await;
        let existing = delegates.get(&registration.delegate_id);
        let approval = existing.map_or_else(|| self.initial_approval(), |d| d.approval);
        let last_heartbeat = existing.map_or(now, |d| d.last_heartbeat.max(now));
        let registered_at = existing.map_or(now, |d| d.registered_at);

        let mut delegate = registration.into_delegate(approval, now);
        delegate.last_heartbeat = last_heartbeat;
        delegate.registered_at = registered_at;

        tracing::info!(
            delegate_id = %delegate.id,
            account_id = %delegate.account_id,
            selectors = ?delegate.selectors,
            "Delegate registered"
        );
        delegates.insert(delegate.id.clone(), delegate.clone());
        delegate
    }

    /// Record a heartbeat. An unknown delegate is created in a minimal state;
    /// a heartbeat naming another account than the delegate's is refused.
    pub async fn register_heartbeat(
        &self,
        account_id: &str,
        delegate_id: &str,
        at: DateTime<Utc>,
        mode: ConnectionMode,
    ) -> Result<Delegate> {
        let mut delegates = self.delegates.write().await;
        match delegates.get_mut(delegate_id) {
            Some(delegate) if delegate.account_id != account_id => {
                tracing::warn!(
                    delegate_id = %delegate_id,
                    account_id = %account_id,
                    owner = %delegate.account_id,
                    "Heartbeat for a delegate of another account refused"
                );
                Err(DispatchError::DelegateNotFound(delegate_id.to_string()))
            }
            Some(delegate) => {
                delegate.record_heartbeat(at, mode);
                Ok(delegate.clone())
            }
            None => {
                tracing::info!(
                    delegate_id = %delegate_id,
                    account_id = %account_id,
                    "Heartbeat from unknown delegate, creating it"
                );
                let delegate = Delegate::minimal(delegate_id, account_id, mode, at)
                    .with_approval(self.initial_approval());
                delegates.insert(delegate_id.to_string(), delegate.clone());
                Ok(delegate)
            }
        }
    }

    pub async fn get(&self, delegate_id: &str) -> Option<Delegate> {
        self.delegates.read().await.get(delegate_id).cloned()
    }

    pub async fn get_for_account(&self, account_id: &str, delegate_id: &str) -> Option<Delegate> {
        self.get(delegate_id)
            .await
            .filter(|d| d.account_id == account_id)
    }

    /// All delegates of an account, by id
    pub async fn list_account(&self, account_id: &str) -> Vec<Delegate> {
        let mut delegates: Vec<Delegate> = self
            .delegates
            .read()
            .await
            .values()
            .filter(|d| d.account_id == account_id)
            .cloned()
            .collect();
        delegates.sort_by(|a, b| a.id.cmp(&b.id));
        delegates
    }

    /// Judge one delegate against a query
    pub fn verdict(&self, delegate: &Delegate, query: &EligibilityQuery<'_>, now: DateTime<Utc>) -> Verdict {
        if !delegate.is_approved() {
            return Verdict::reject(
                DecisionKind::NotApproved,
                format!("Delegate approval state is {}", delegate.approval.as_str()),
            );
        }
        if !delegate.connected {
            return Verdict::reject(DecisionKind::Disconnected, "Delegate is disconnected");
        }
        if !delegate.is_live(now, self.heartbeat_timeout) {
            return Verdict::reject(
                DecisionKind::Disconnected,
                format!(
                    "No heartbeat for {}s",
                    now.signed_duration_since(delegate.last_heartbeat).num_seconds()
                ),
            );
        }
        match delegate.scope_verdict(query.setup_abstractions) {
            ScopeVerdict::InScope => {}
            ScopeVerdict::NoIncludeMatched => {
                return Verdict::reject(
                    DecisionKind::ExcludeScope,
                    "No include scope of the delegate matched the task",
                );
            }
            ScopeVerdict::Excluded(rule) => {
                return Verdict::reject(
                    DecisionKind::ExcludeScope,
                    format!("Exclude scope matched: {}", rule.describe()),
                );
            }
        }
        if !delegate.profile_admits(query.setup_abstractions) {
            let profile = delegate.profile.as_ref().map_or("", |p| p.id.as_str());
            return Verdict::reject(
                DecisionKind::ProfileScopeNotMatched,
                format!("Scoping rules of profile {} do not match the task", profile),
            );
        }

        let missing = delegate.missing_selectors(query.selectors);
        if missing.is_empty() {
            Verdict::Eligible
        } else if missing.len() == query.selectors.len() {
            Verdict::reject(
                DecisionKind::MissingAllSelectors,
                format!(
                    "The delegate selector tags are not part of the task selector tags: [{}]",
                    missing.join(", ")
                ),
            )
        } else {
            Verdict::reject(
                DecisionKind::MissingSelector,
                format!("Missing selectors: [{}]", missing.join(", ")),
            )
        }
    }

    /// Judge every delegate of the query's account, in id order
    pub async fn evaluate(&self, query: &EligibilityQuery<'_>, now: DateTime<Utc>) -> Vec<(Delegate, Verdict)> {
        self.list_account(query.account_id)
            .await
            .into_iter()
            .map(|d| {
                let verdict = self.verdict(&d, query, now);
                (d, verdict)
            })
            .collect()
    }

    /// Approved, live, in-scope delegates declaring every required selector,
    /// in dispatch order
    pub async fn list_eligible(
        &self,
        account_id: &str,
        required_selectors: &BTreeSet<String>,
        now: DateTime<Utc>,
    ) -> Vec<Delegate> {
        let abstractions = BTreeMap::new();
        let query = EligibilityQuery {
            account_id,
            selectors: required_selectors,
            setup_abstractions: &abstractions,
        };
        let mut eligible: Vec<Delegate> = self
            .evaluate(&query, now)
            .await
            .into_iter()
            .filter(|(_, v)| v.is_eligible())
            .map(|(d, _)| d)
            .collect();
        order_candidates(&mut eligible);
        eligible
    }

    pub async fn is_live(&self, delegate_id: &str, now: DateTime<Utc>) -> bool {
        self.get(delegate_id)
            .await
            .map_or(false, |d| d.is_live(now, self.heartbeat_timeout))
    }

    pub async fn mark_disconnected(&self, delegate_id: &str) -> Option<Delegate> {
        let mut delegates = self.delegates.write().await;
        let delegate = delegates.get_mut(delegate_id)?;
        delegate.connected = false;
        tracing::info!(delegate_id = %delegate_id, "Delegate disconnected");
        Some(delegate.clone())
    }

    pub async fn mark_approval(&self, delegate_id: &str, action: ApprovalAction) -> Result<Delegate> {
        let mut delegates = self.delegates.write().await;
        let delegate = delegates
            .get_mut(delegate_id)
            .ok_or_else(|| DispatchError::DelegateNotFound(delegate_id.to_string()))?;
        delegate.approval = action.target_state();
        tracing::info!(
            delegate_id = %delegate_id,
            approval = delegate.approval.as_str(),
            "Delegate approval changed"
        );
        Ok(delegate.clone())
    }

    /// Delegates whose last heartbeat is older than `cutoff`
    pub async fn silent_since(&self, cutoff: DateTime<Utc>) -> Vec<Delegate> {
        self.delegates
            .read()
            .await
            .values()
            .filter(|d| d.last_heartbeat < cutoff)
            .cloned()
            .collect()
    }

    pub async fn remove(&self, delegate_id: &str) -> Option<Delegate> {
        self.delegates.write().await.remove(delegate_id)
    }
}

/// Dispatch order: most recent heartbeat first, then lexical id
pub fn order_candidates(candidates: &mut [Delegate]) {
    candidates.sort_by(|a, b| {
        b.last_heartbeat
            .cmp(&a.last_heartbeat)
            .then_with(|| a.id.cmp(&b.id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::delegate::{DelegateProfile, ScopeRule};
    use std::time::Duration;

    fn config() -> DispatchConfig {
        DispatchConfig::new(1, Duration::from_secs(60)).with_heartbeat_timeout(Duration::from_secs(30))
    }

    fn selectors(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn registration(id: &str, tags: &[&str]) -> DelegateRegistration {
        DelegateRegistration {
            delegate_id: id.to_string(),
            account_id: "acct".to_string(),
            group_name: None,
            selectors: selectors(tags),
            include_scopes: vec![],
            exclude_scopes: vec![],
            profile: None,
            connection_mode: ConnectionMode::Polling,
        }
    }

    #[tokio::test]
    async fn test_heartbeat_creates_unknown_delegate() {
        let registry = DelegateRegistry::new(&config());
        let now = Utc::now();

        let d = registry
            .register_heartbeat("acct", "d-1", now, ConnectionMode::Polling)
            .await
            .unwrap();
        assert_eq!(d.approval, ApprovalState::Approved);
        assert!(d.selectors.is_empty());
        assert!(registry.get("d-1").await.is_some());
    }

    #[tokio::test]
    async fn test_heartbeat_from_other_account_is_refused() {
        let registry = DelegateRegistry::new(&config());
        let t0 = Utc::now();
        registry
            .register_heartbeat("acct", "d-1", t0, ConnectionMode::Polling)
            .await
            .unwrap();

        let later = t0 + chrono::Duration::seconds(10);
        let err = registry
            .register_heartbeat("other", "d-1", later, ConnectionMode::Streaming)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::DelegateNotFound(_)));

        let d = registry.get("d-1").await.unwrap();
        assert_eq!(d.account_id, "acct");
        assert_eq!(d.last_heartbeat, t0);
        assert_eq!(d.connection_mode, ConnectionMode::Polling);
    }

    #[tokio::test]
    async fn test_heartbeat_creates_pending_when_not_auto_approved() {
        let registry = DelegateRegistry::new(&config().with_approve_on_heartbeat(false));
        let d = registry
            .register_heartbeat("acct", "d-1", Utc::now(), ConnectionMode::Polling)
            .await
            .unwrap();
        assert_eq!(d.approval, ApprovalState::Pending);
    }

    #[tokio::test]
    async fn test_repeated_heartbeats_do_not_regress() {
        let registry = DelegateRegistry::new(&config());
        let t0 = Utc::now();
        let t1 = t0 + chrono::Duration::seconds(10);

        registry.register_heartbeat("acct", "d-1", t1, ConnectionMode::Polling).await.unwrap();
        registry.register_heartbeat("acct", "d-1", t1, ConnectionMode::Polling).await.unwrap();
        let d = registry.register_heartbeat("acct", "d-1", t0, ConnectionMode::Polling).await.unwrap();

        assert_eq!(d.last_heartbeat, t1);
        assert!(registry.is_live("d-1", t1 + chrono::Duration::seconds(29)).await);
    }

    #[tokio::test]
    async fn test_register_keeps_approval() {
        let registry = DelegateRegistry::new(&config().with_approve_on_heartbeat(false));
        let now = Utc::now();
        registry.register(registration("d-1", &["gpu"]), now).await;
        registry.mark_approval("d-1", ApprovalAction::Approve).await.unwrap();

        let d = registry.register(registration("d-1", &["gpu", "linux"]), now).await;
        assert_eq!(d.approval, ApprovalState::Approved);
        assert_eq!(d.selectors, selectors(&["gpu", "linux"]));
    }

    #[tokio::test]
    async fn test_selector_superset_law() {
        let registry = DelegateRegistry::new(&config());
        let now = Utc::now();
        registry.register(registration("d-1", &["a", "b", "c"]), now).await;

        let eligible = registry.list_eligible("acct", &selectors(&["a", "b"]), now).await;
        assert_eq!(eligible.len(), 1);

        let eligible = registry.list_eligible("acct", &selectors(&["a", "d"]), now).await;
        assert!(eligible.is_empty());

        let eligible = registry.list_eligible("acct", &BTreeSet::new(), now).await;
        assert_eq!(eligible.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_selector_kinds() {
        let registry = DelegateRegistry::new(&config());
        let now = Utc::now();
        let d = registry.register(registration("d-1", &["linux"]), now).await;
        let abstractions = BTreeMap::new();

        let required = selectors(&["gpu", "linux"]);
        let query = EligibilityQuery {
            account_id: "acct",
            selectors: &required,
            setup_abstractions: &abstractions,
        };
        assert!(matches!(
            registry.verdict(&d, &query, now),
            Verdict::Ineligible { kind: DecisionKind::MissingSelector, .. }
        ));

        let required = selectors(&["gpu"]);
        let query = EligibilityQuery {
            account_id: "acct",
            selectors: &required,
            setup_abstractions: &abstractions,
        };
        assert!(matches!(
            registry.verdict(&d, &query, now),
            Verdict::Ineligible { kind: DecisionKind::MissingAllSelectors, .. }
        ));
    }

    #[tokio::test]
    async fn test_verdict_order_and_kinds() {
        let registry = DelegateRegistry::new(&config());
        let now = Utc::now();
        let required = BTreeSet::new();
        let abstractions: BTreeMap<String, String> =
            [("envId".to_string(), "prod".to_string())].into_iter().collect();
        let query = EligibilityQuery {
            account_id: "acct",
            selectors: &required,
            setup_abstractions: &abstractions,
        };

        let base = Delegate::minimal("d", "acct", ConnectionMode::Polling, now)
            .with_approval(ApprovalState::Approved);

        let pending = base.clone().with_approval(ApprovalState::Pending);
        assert!(matches!(
            registry.verdict(&pending, &query, now),
            Verdict::Ineligible { kind: DecisionKind::NotApproved, .. }
        ));

        assert!(matches!(
            registry.verdict(&base, &query, now + chrono::Duration::seconds(31)),
            Verdict::Ineligible { kind: DecisionKind::Disconnected, .. }
        ));

        let excluded = base.clone().with_exclude_scope(ScopeRule::new("envId", ["prod"]));
        assert!(matches!(
            registry.verdict(&excluded, &query, now),
            Verdict::Ineligible { kind: DecisionKind::ExcludeScope, .. }
        ));

        let profiled = base.clone().with_profile(DelegateProfile {
            id: "non-prod".to_string(),
            scoping_rules: vec![ScopeRule::new("envId", ["dev"])],
        });
        assert!(matches!(
            registry.verdict(&profiled, &query, now),
            Verdict::Ineligible { kind: DecisionKind::ProfileScopeNotMatched, .. }
        ));

        assert_eq!(registry.verdict(&base, &query, now), Verdict::Eligible);
    }

    #[tokio::test]
    async fn test_list_eligible_filters_account_and_liveness() {
        let registry = DelegateRegistry::new(&config());
        let now = Utc::now();
        registry.register(registration("d-1", &[]), now).await;
        registry
            .register_heartbeat("other", "d-9", now, ConnectionMode::Polling)
            .await
            .unwrap();
        registry.register(registration("d-2", &[]), now).await;
        registry.mark_disconnected("d-2").await;

        let eligible = registry.list_eligible("acct", &BTreeSet::new(), now).await;
        let ids: Vec<_> = eligible.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["d-1"]);
    }

    #[tokio::test]
    async fn test_mark_approval_unknown_delegate() {
        let registry = DelegateRegistry::new(&config());
        let err = registry
            .mark_approval("ghost", ApprovalAction::Blocklist)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::DelegateNotFound(_)));
    }

    #[tokio::test]
    async fn test_blocklisted_delegate_is_never_eligible() {
        let registry = DelegateRegistry::new(&config());
        let now = Utc::now();
        registry.register(registration("d-1", &[]), now).await;
        registry.mark_approval("d-1", ApprovalAction::Blocklist).await.unwrap();

        assert!(registry.list_eligible("acct", &BTreeSet::new(), now).await.is_empty());
    }

    #[test]
    fn test_order_candidates() {
        let now = Utc::now();
        let older = now - chrono::Duration::seconds(5);
        let mut candidates = vec![
            Delegate::minimal("b", "acct", ConnectionMode::Polling, now),
            Delegate::minimal("c", "acct", ConnectionMode::Polling, older),
            Delegate::minimal("a", "acct", ConnectionMode::Polling, now),
        ];
        order_candidates(&mut candidates);
        let ids: Vec<_> = candidates.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_silent_since_and_remove() {
        let registry = DelegateRegistry::new(&config());
        let now = Utc::now();
        registry
            .register_heartbeat("acct", "old", now - chrono::Duration::hours(7), ConnectionMode::Polling)
            .await
            .unwrap();
        registry.register_heartbeat("acct", "new", now, ConnectionMode::Polling).await.unwrap();

        let silent = registry.silent_since(now - chrono::Duration::hours(6)).await;
        assert_eq!(silent.len(), 1);
        assert_eq!(silent[0].id, "old");

        assert!(registry.remove("old").await.is_some());
        assert!(registry.get("old").await.is_none());
    }
}
