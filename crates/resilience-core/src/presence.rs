//! Self-side liveness publishing and observer-side staleness evaluation.

use std::{
    fmt,
    str::FromStr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{
    runtime::Handle,
    sync::Mutex,
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(45);

/// Presence value as stored for a subject.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Idle,
    Dnd,
    Offline,
}

impl PresenceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Idle => "idle",
            Self::Dnd => "dnd",
            Self::Offline => "offline",
        }
    }
}

impl fmt::Display for PresenceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PresenceStatus {
    type Err = PresenceError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "online" => Ok(Self::Online),
            "idle" => Ok(Self::Idle),
            "dnd" => Ok(Self::Dnd),
            "offline" => Ok(Self::Offline),
            _ => Err(PresenceError::UnknownStatus(value.to_owned())),
        }
    }
}

/// Liveness record as read from the external store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PresenceRecord {
    pub status: PresenceStatus,
    /// RFC 3339 timestamp of the last publish or touch.
    pub updated_at: Option<String>,
}

impl PresenceRecord {
    pub fn new(status: PresenceStatus, updated_at: DateTime<Utc>) -> Self {
        Self {
            status,
            updated_at: Some(updated_at.to_rfc3339()),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PresenceError {
    #[error("unknown presence status '{0}'")]
    UnknownStatus(String),
    #[error("presence session is already running")]
    AlreadyRunning,
    #[error("presence store failure: {0}")]
    Store(String),
}

/// Durable presence accessor. Failures are tolerated by the tracker.
#[async_trait]
pub trait PresenceStore: Send + Sync {
    async fn set_presence(
        &self,
        subject_id: &str,
        status: PresenceStatus,
    ) -> Result<(), PresenceError>;

    /// Refresh `updated_at` without changing the stored status.
    async fn touch_presence(&self, subject_id: &str) -> Result<(), PresenceError>;
}

/// Send primitive usable during teardown.
///
/// Implementations must return without waiting for any response.
pub trait ExitTransport: Send + Sync {
    fn send_offline(&self, subject_id: &str);
}

/// Teardown hooks that all funnel into [`PresenceTracker::handle_teardown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownSignal {
    /// The process or page is about to unload.
    BeforeUnload,
    /// The client became hidden or was backgrounded.
    Hidden,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceConfig {
    pub heartbeat_interval: Duration,
    pub stale_after: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            stale_after: DEFAULT_STALE_AFTER,
        }
    }
}

/// Status an observer should display for `record` at `now`.
pub fn effective_status(record: &PresenceRecord, now: DateTime<Utc>) -> PresenceStatus {
    effective_status_with(record, now, DEFAULT_STALE_AFTER)
}

/// [`effective_status`] with an explicit staleness window.
///
/// `offline` is returned verbatim. A missing or unparseable timestamp trusts
/// the stored value. Otherwise a record older than `stale_after` reads as
/// `offline`.
pub fn effective_status_with(
    record: &PresenceRecord,
    now: DateTime<Utc>,
    stale_after: Duration,
) -> PresenceStatus {
    if record.status == PresenceStatus::Offline {
        return PresenceStatus::Offline;
    }

    let Some(updated_at) = record
        .updated_at
        .as_deref()
        .and_then(|raw| DateTime::parse_from_rfc3339(raw.trim()).ok())
    else {
        return record.status;
    };

    let age_ms = now
        .signed_duration_since(updated_at.with_timezone(&Utc))
        .num_milliseconds();
    if age_ms > stale_after.as_millis() as i64 {
        PresenceStatus::Offline
    } else {
        record.status
    }
}

#[derive(Debug)]
struct RunningHeartbeat {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

/// Publishes this client's liveness for one session.
///
/// Construct one per session and call [`PresenceTracker::end_session`] when
/// it ends so the heartbeat does not outlive a reconnect.
pub struct PresenceTracker {
    subject_id: String,
    store: Arc<dyn PresenceStore>,
    exit: Arc<dyn ExitTransport>,
    config: PresenceConfig,
    runtime: Handle,
    heartbeat: Mutex<Option<RunningHeartbeat>>,
    teardown_armed: AtomicBool,
}

impl PresenceTracker {
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime context.
    pub fn new(
        subject_id: impl Into<String>,
        store: Arc<dyn PresenceStore>,
        exit: Arc<dyn ExitTransport>,
        config: PresenceConfig,
    ) -> Self {
        Self::with_runtime(subject_id, store, exit, config, Handle::current())
    }

    pub fn with_runtime(
        subject_id: impl Into<String>,
        store: Arc<dyn PresenceStore>,
        exit: Arc<dyn ExitTransport>,
        config: PresenceConfig,
        runtime: Handle,
    ) -> Self {
        Self {
            subject_id: subject_id.into(),
            store,
            exit,
            config,
            runtime,
            heartbeat: Mutex::new(None),
            teardown_armed: AtomicBool::new(false),
        }
    }

    pub fn subject_id(&self) -> &str {
        &self.subject_id
    }

    pub fn config(&self) -> PresenceConfig {
        self.config
    }

    pub async fn is_running(&self) -> bool {
        self.heartbeat.lock().await.is_some()
    }

    /// Publish `online` and start the heartbeat.
    pub async fn start_session(&self) -> Result<(), PresenceError> {
        let mut guard = self.heartbeat.lock().await;
        if guard.is_some() {
            return Err(PresenceError::AlreadyRunning);
        }

        self.teardown_armed.store(true, Ordering::SeqCst);
        self.publish_online().await;

        let stop = CancellationToken::new();
        let stop_child = stop.child_token();
        let store = Arc::clone(&self.store);
        let subject_id = self.subject_id.clone();
        let period = self.config.heartbeat_interval;
        let runtime = self.runtime.clone();
        let task = self.runtime.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = stop_child.cancelled() => break,
                    _ = ticker.tick() => {
                        // Detached so a slow store never delays the next tick.
                        let store = Arc::clone(&store);
                        let subject_id = subject_id.clone();
                        runtime.spawn(async move {
                            touch_best_effort(store.as_ref(), &subject_id).await;
                        });
                    }
                }
            }
        });

        *guard = Some(RunningHeartbeat { stop, task });
        debug!(subject_id = %self.subject_id, "presence session started");
        Ok(())
    }

    /// Single handler for every teardown hook.
    ///
    /// Sends `offline` through the exit transport at most once per armed
    /// session and never blocks. The heartbeat keeps running, so a touch may
    /// still land after the offline signal; observers tolerate that.
    pub fn handle_teardown(&self, signal: TeardownSignal) {
        if !self.teardown_armed.swap(false, Ordering::SeqCst) {
            debug!(subject_id = %self.subject_id, ?signal, "presence teardown already signalled");
            return;
        }
        debug!(subject_id = %self.subject_id, ?signal, "presence teardown; sending offline");
        self.exit.send_offline(&self.subject_id);
    }

    /// Re-publish `online` after the client comes back to the foreground.
    pub async fn handle_resume(&self) {
        if !self.is_running().await {
            return;
        }
        self.teardown_armed.store(true, Ordering::SeqCst);
        self.publish_online().await;
    }

    /// Stop the heartbeat and signal `offline`.
    pub async fn end_session(&self) {
        let running = {
            let mut guard = self.heartbeat.lock().await;
            guard.take()
        };

        if let Some(running) = running {
            running.stop.cancel();
            let _ = running.task.await;
        }

        self.handle_teardown(TeardownSignal::BeforeUnload);
        debug!(subject_id = %self.subject_id, "presence session ended");
    }

    async fn publish_online(&self) {
        // Best-effort: a failed publish is repaired by the next session or
        // reads as offline once the record goes stale.
        if let Err(err) = self
            .store
            .set_presence(&self.subject_id, PresenceStatus::Online)
            .await
        {
            debug!(subject_id = %self.subject_id, error = %err, "presence publish failed");
        }
    }
}

impl fmt::Debug for PresenceTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PresenceTracker")
            .field("subject_id", &self.subject_id)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

async fn touch_best_effort(store: &dyn PresenceStore, subject_id: &str) {
    // Heartbeat touches are fire-and-forget; the result is deliberately dropped.
    if let Err(err) = store.touch_presence(subject_id).await {
        debug!(%subject_id, error = %err, "presence heartbeat touch failed");
    }
}
