//! Background sweeper
//!
//! Periodically expires overdue queued tasks, fails over tasks whose delegate
//! went silent, offers on tasks whose offer went unanswered, reaps
//! long-silent delegates and drops stale capability records. Runs until the
//! shutdown signal flips.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use super::dispatcher::Dispatcher;
use crate::config::DispatchConfig;
use crate::error::Result;

/// What one pass did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub requeued: usize,
    pub reoffered: usize,
    pub reaped: usize,
    pub evicted: usize,
}

impl SweepReport {
    pub fn is_idle(&self) -> bool {
        *self == SweepReport::default()
    }

    fn absorb(&mut self, other: SweepReport) {
        self.expired += other.expired;
        self.requeued += other.requeued;
        self.reoffered += other.reoffered;
        self.reaped += other.reaped;
        self.evicted += other.evicted;
    }
}

/// Run every sweep once against `now`
pub async fn run_once(dispatcher: &Dispatcher, now: DateTime<Utc>) -> Result<SweepReport> {
    let report = SweepReport {
        expired: dispatcher.expire_overdue(now).await?,
        requeued: dispatcher.requeue_stalled(now).await?,
        reoffered: dispatcher.reoffer_stale(now).await?,
        reaped: dispatcher.reap_silent_delegates(now).await?,
        evicted: dispatcher.evict_capabilities(now).await,
    };

    if report.is_idle() {
        tracing::debug!("Sweep pass found nothing to do");
    } else {
        tracing::info!(
            expired = report.expired,
            requeued = report.requeued,
            reoffered = report.reoffered,
            reaped = report.reaped,
            evicted = report.evicted,
            "Sweep pass completed"
        );
    }
    Ok(report)
}

/// Spawn the sweep loop. The handle resolves to the totals over its lifetime.
pub fn spawn(
    dispatcher: Arc<Dispatcher>,
    config: &DispatchConfig,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<SweepReport> {
    let period = config.sweep_interval;
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut totals = SweepReport::default();

        tracing::info!(interval_ms = period.as_millis() as u64, "Sweeper started");

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::info!("Sweeper shutting down");
                        break;
                    }
                }
                _ = ticker.tick() => {
                    match run_once(&dispatcher, Utc::now()).await {
                        Ok(report) => totals.absorb(report),
                        Err(e) => tracing::error!(error = %e, "Sweep pass failed"),
                    }
                }
            }
        }

        totals
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::delegate::{ConnectionMode, DelegateRegistration};
    use crate::dispatch::selection_log::DecisionKind;
    use crate::dispatch::task::{TaskStatus, TaskSubmission};
    use crate::store::Store;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::time::Duration;

    async fn dispatcher(config: DispatchConfig) -> Dispatcher {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = Store::new(pool);
        store.ensure_schema().await.unwrap();
        Dispatcher::new(store, config)
    }

    fn registration(id: &str) -> DelegateRegistration {
        DelegateRegistration {
            delegate_id: id.to_string(),
            account_id: "acct".to_string(),
            group_name: None,
            selectors: Default::default(),
            include_scopes: vec![],
            exclude_scopes: vec![],
            profile: None,
            connection_mode: ConnectionMode::Polling,
        }
    }

    #[tokio::test]
    async fn test_run_once_expires_overdue_tasks() {
        let d = dispatcher(DispatchConfig::new(1, Duration::from_secs(60))).await;
        let task = d
            .queue_task(TaskSubmission::new("acct", serde_json::json!({})).with_expiry_secs(30))
            .await
            .unwrap();

        let early = run_once(&d, Utc::now()).await.unwrap();
        assert_eq!(early.expired, 0);

        let later = Utc::now() + chrono::Duration::seconds(31);
        let report = run_once(&d, later).await.unwrap();
        assert_eq!(report.expired, 1);

        let expired = d.get_task("acct", task.id).await.unwrap();
        assert_eq!(expired.status, TaskStatus::Expired);
        let logs = d.fetch_task_selection_logs("acct", task.id).await.unwrap();
        assert!(logs.iter().all(|e| e.kind != DecisionKind::CanAssign));
        assert_eq!(logs.last().unwrap().kind, DecisionKind::TaskExpired);
    }

    #[tokio::test]
    async fn test_run_once_requeues_stalled_and_reaps() {
        let config = DispatchConfig::new(2, Duration::from_secs(60))
            .with_heartbeat_timeout(Duration::from_secs(30))
            .with_delegate_reap_after(Duration::from_secs(600));
        let d = dispatcher(config).await;
        d.register_delegate(registration("d-1")).await;
        d.register_delegate(registration("d-2")).await;
        let task = d
            .queue_task(TaskSubmission::new("acct", serde_json::json!({})))
            .await
            .unwrap();
        assert!(d.acquire_task("acct", "d-1", task.id).await.unwrap().is_acquired());

        let later = Utc::now() + chrono::Duration::seconds(120);
        d.register_heartbeat("acct", "d-2", later, ConnectionMode::Polling)
            .await
            .unwrap();
        let report = run_once(&d, later).await.unwrap();
        assert_eq!(report.requeued, 1);
        assert_eq!(report.reaped, 0);
        let requeued = d.get_task("acct", task.id).await.unwrap();
        assert_eq!(requeued.status, TaskStatus::Queued);
        assert_eq!(requeued.eligible_delegate_ids, vec!["d-2"]);

        let much_later = Utc::now() + chrono::Duration::seconds(900);
        let report = run_once(&d, much_later).await.unwrap();
        assert_eq!(report.reaped, 2);
        assert!(d.list_delegates("acct").await.is_empty());
    }

    #[tokio::test]
    async fn test_run_once_reoffers_unanswered_tasks() {
        let config = DispatchConfig::new(1, Duration::from_secs(60))
            .with_offer_timeout(Duration::from_secs(10));
        let d = dispatcher(config).await;
        let t0 = Utc::now();
        d.register_delegate(registration("d-1")).await;
        d.register_delegate(registration("d-2")).await;
        d.register_heartbeat("acct", "d-1", t0 + chrono::Duration::seconds(1), ConnectionMode::Polling)
            .await
            .unwrap();
        let task = d
            .queue_task(TaskSubmission::new("acct", serde_json::json!({})))
            .await
            .unwrap();
        let offered = |t: &crate::dispatch::task::DelegateTask| {
            t.offered_delegate_ids.iter().cloned().collect::<Vec<_>>()
        };
        assert_eq!(offered(&d.get_task("acct", task.id).await.unwrap()), vec!["d-1"]);

        let report = run_once(&d, t0 + chrono::Duration::seconds(5)).await.unwrap();
        assert_eq!(report.reoffered, 0);

        let report = run_once(&d, t0 + chrono::Duration::seconds(11)).await.unwrap();
        assert_eq!(report.reoffered, 1);
        assert_eq!(
            offered(&d.get_task("acct", task.id).await.unwrap()),
            vec!["d-1", "d-2"]
        );

        // everyone had a turn, the next stale pass starts over
        let report = run_once(&d, t0 + chrono::Duration::seconds(22)).await.unwrap();
        assert_eq!(report.reoffered, 1);
        assert_eq!(offered(&d.get_task("acct", task.id).await.unwrap()), vec!["d-1"]);
    }

    #[tokio::test]
    async fn test_spawn_stops_on_shutdown() {
        let config = DispatchConfig::new(1, Duration::from_secs(60))
            .with_sweep_interval(Duration::from_millis(10));
        let d = Arc::new(dispatcher(config.clone()).await);
        let (tx, rx) = watch::channel(false);

        let handle = spawn(d, &config, rx);
        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(true).unwrap();

        let totals = handle.await.unwrap();
        assert!(totals.is_idle());
    }
}
