//! Periodic refresh of aggregate views.
//!
//! Each scheduled view gets its own background task, so one view's
//! refreshes never overlap while different views refresh concurrently. A
//! failed refresh is logged and counted; the view keeps its previous content
//! and the next tick tries again.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use serde::Serialize;
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::cache::ResultCache;
use crate::engine::Engine;
use crate::error::{Result, StoreError};
use crate::events::{EventKind, Events};
use crate::retry::RetryPolicy;

/// Refresh statement used when a view does not give its own.
pub const DEFAULT_REFRESH_TEMPLATE: &str = "REFRESH MATERIALIZED VIEW {view}";

/// How long `shutdown` waits for a refresh in progress before aborting it.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

static VIEW_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_$]*(\.[A-Za-z_][A-Za-z0-9_$]*)?$").expect("valid view pattern"));

// ============================================================================
// Configuration
// ============================================================================

/// A view to refresh periodically.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewRefresh {
    pub view: String,
    pub interval: Duration,
    /// Statement to run; rendered from the scheduler's template when unset
    pub sql: Option<String>,
    /// Retry policy for each refresh; the scheduler default when unset
    pub policy: Option<RetryPolicy>,
}

impl ViewRefresh {
    pub fn new(view: impl Into<String>, interval: Duration) -> Self {
        Self {
            view: view.into(),
            interval,
            sql: None,
            policy: None,
        }
    }

    pub fn sql(mut self, sql: impl Into<String>) -> Self {
        self.sql = Some(sql.into());
        self
    }

    pub fn policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = Some(policy);
        self
    }
}

/// Render a refresh template for `view`.
pub fn render_refresh(template: &str, view: &str) -> String {
    template.replace("{view}", view)
}

// ============================================================================
// Status
// ============================================================================

/// Refresh history of one view.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RefreshStatus {
    pub view: String,
    pub interval_ms: u64,
    pub last_success: Option<DateTime<Utc>>,
    pub last_failure: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
    pub total_refreshes: u64,
    pub total_failures: u64,
}

impl RefreshStatus {
    fn new(view: &str, interval: Duration) -> Self {
        Self {
            view: view.to_string(),
            interval_ms: interval.as_millis() as u64,
            last_success: None,
            last_failure: None,
            last_error: None,
            consecutive_failures: 0,
            total_refreshes: 0,
            total_failures: 0,
        }
    }
}

// ============================================================================
// Refresh job
// ============================================================================

struct RefreshJob {
    view: String,
    sql: String,
    interval: Duration,
    policy: RetryPolicy,
    status: Mutex<RefreshStatus>,
    /// Held for the duration of one refresh; shared by every job that has
    /// refreshed this view, so a replaced schedule cannot overlap its successor
    running: Arc<tokio::sync::Mutex<()>>,
}

/// What a refresh needs, shared by the background tasks.
#[derive(Clone)]
struct Refresher {
    engine: Engine,
    cache: Option<ResultCache>,
    events: Events,
}

impl Refresher {
    async fn refresh(&self, job: &RefreshJob) -> Result<()> {
        let _running = job.running.lock().await;

        match self.engine.execute(&job.sql, &[], &job.policy).await {
            Ok(_) => {
                let total = {
                    let mut status = job.status.lock();
                    status.last_success = Some(Utc::now());
                    status.consecutive_failures = 0;
                    status.total_refreshes += 1;
                    status.total_refreshes
                };
                if let Some(cache) = &self.cache {
                    cache.invalidate(&job.view);
                }
                tracing::debug!(view = %job.view, total, "view refreshed");
                self.events
                    .emit(EventKind::RefreshSucceeded, json!({ "view": job.view, "total": total }));
                Ok(())
            }
            Err(e) => {
                let consecutive = {
                    let mut status = job.status.lock();
                    status.last_failure = Some(Utc::now());
                    status.last_error = Some(e.to_string());
                    status.consecutive_failures += 1;
                    status.total_failures += 1;
                    status.consecutive_failures
                };
                tracing::error!(
                    view = %job.view,
                    consecutive_failures = consecutive,
                    kind = e.kind(),
                    error = %e,
                    "view refresh failed"
                );
                self.events.emit(
                    EventKind::RefreshFailed,
                    json!({ "view": job.view, "kind": e.kind(), "consecutive_failures": consecutive }),
                );
                Err(e)
            }
        }
    }
}

/// Refresh `job` every `job.interval` until shutdown is signalled.
async fn refresh_task(refresher: Refresher, job: Arc<RefreshJob>, mut shutdown_rx: watch::Receiver<bool>) {
    let mut ticker = interval(job.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately
    ticker.tick().await;

    tracing::info!(view = %job.view, interval_ms = job.interval.as_millis() as u64, "view refresh scheduled");

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                // Failures are recorded in the job status
                let _ = refresher.refresh(&job).await;
            }
        }
    }

    tracing::info!(view = %job.view, "view refresh stopped");
}

struct ScheduledView {
    job: Arc<RefreshJob>,
    handle: JoinHandle<()>,
}

// ============================================================================
// Scheduler
// ============================================================================

/// Owns the background refresh tasks.
#[derive(Clone)]
pub struct RefreshScheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    refresher: Refresher,
    template: String,
    default_policy: RetryPolicy,
    shutdown_tx: watch::Sender<bool>,
    views: Mutex<HashMap<String, ScheduledView>>,
    /// Per-view refresh locks, kept across re-scheduling
    refresh_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl RefreshScheduler {
    /// `default_policy` applies to views scheduled without their own. Refresh
    /// statements are idempotent, so writes are always retried.
    pub fn new(
        engine: Engine,
        cache: Option<ResultCache>,
        template: impl Into<String>,
        default_policy: RetryPolicy,
        events: Events,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(SchedulerInner {
                refresher: Refresher { engine, cache, events },
                template: template.into(),
                default_policy: default_policy.retry_writes(true),
                shutdown_tx,
                views: Mutex::new(HashMap::new()),
                refresh_locks: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Refresh `view` every `interval` with the templated statement.
    pub fn schedule(&self, view: &str, interval: Duration) -> Result<()> {
        self.schedule_with(ViewRefresh::new(view, interval))
    }

    /// Schedule a view refresh, replacing any existing schedule for the view.
    pub fn schedule_with(&self, refresh: ViewRefresh) -> Result<()> {
        if *self.inner.shutdown_tx.borrow() {
            return Err(StoreError::Config("refresh scheduler is shut down".into()));
        }
        if refresh.interval.is_zero() {
            return Err(StoreError::Config(format!(
                "refresh interval for view {} must be positive",
                refresh.view
            )));
        }
        let sql = match refresh.sql {
            Some(sql) => sql,
            None if VIEW_NAME.is_match(&refresh.view) => render_refresh(&self.inner.template, &refresh.view),
            None => return Err(StoreError::Config(format!("invalid view name: {:?}", refresh.view))),
        };

        let running = Arc::clone(self.inner.refresh_locks.lock().entry(refresh.view.clone()).or_default());
        let job = Arc::new(RefreshJob {
            status: Mutex::new(RefreshStatus::new(&refresh.view, refresh.interval)),
            view: refresh.view,
            sql,
            interval: refresh.interval,
            policy: refresh.policy.unwrap_or_else(|| self.inner.default_policy.clone()),
            running,
        });

        let handle = tokio::spawn(refresh_task(
            self.inner.refresher.clone(),
            Arc::clone(&job),
            self.inner.shutdown_tx.subscribe(),
        ));

        let previous = self
            .inner
            .views
            .lock()
            .insert(job.view.clone(), ScheduledView { job, handle });
        if let Some(previous) = previous {
            tracing::debug!(view = %previous.job.view, "replacing view refresh schedule");
            previous.handle.abort();
        }
        Ok(())
    }

    /// Stop refreshing `view`. Returns whether it was scheduled.
    pub fn unschedule(&self, view: &str) -> bool {
        match self.inner.views.lock().remove(view) {
            Some(scheduled) => {
                scheduled.handle.abort();
                tracing::info!(view, "view refresh unscheduled");
                true
            }
            None => false,
        }
    }

    /// Refresh a scheduled view immediately, outside its schedule. Waits for
    /// a refresh already in progress to finish first.
    pub async fn refresh_now(&self, view: &str) -> Result<()> {
        let job = self
            .inner
            .views
            .lock()
            .get(view)
            .map(|scheduled| Arc::clone(&scheduled.job))
            .ok_or_else(|| StoreError::Config(format!("view {view} is not scheduled")))?;
        self.inner.refresher.refresh(&job).await
    }

    pub fn status(&self, view: &str) -> Option<RefreshStatus> {
        self.inner
            .views
            .lock()
            .get(view)
            .map(|scheduled| scheduled.job.status.lock().clone())
    }

    /// Status of every scheduled view, ordered by view name.
    pub fn statuses(&self) -> Vec<RefreshStatus> {
        let mut all: Vec<RefreshStatus> = self
            .inner
            .views
            .lock()
            .values()
            .map(|scheduled| scheduled.job.status.lock().clone())
            .collect();
        all.sort_by(|a, b| a.view.cmp(&b.view));
        all
    }

    pub fn scheduled(&self) -> Vec<String> {
        let mut views: Vec<String> = self.inner.views.lock().keys().cloned().collect();
        views.sort();
        views
    }

    pub fn is_shut_down(&self) -> bool {
        *self.inner.shutdown_tx.borrow()
    }

    /// Stop all refresh tasks. A refresh in progress gets a short grace
    /// period to finish before it is aborted.
    pub async fn shutdown(&self) {
        self.inner.shutdown_tx.send_replace(true);
        let scheduled: Vec<ScheduledView> = self.inner.views.lock().drain().map(|(_, v)| v).collect();

        for mut view in scheduled {
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut view.handle).await.is_err() {
                tracing::warn!(view = %view.job.view, "refresh did not stop in time, aborting");
                view.handle.abort();
            }
        }
        tracing::info!("refresh scheduler stopped");
    }
}
