//! Client-side resilience layer.
//!
//! This crate retries named operations with jittered backoff, classifies
//! failures into user-facing outcomes, tracks presence liveness against
//! staleness, and gates notifications on quiet hours.

/// Environment-backed runtime configuration.
pub mod config;
/// Operation errors and the failure classifier.
pub mod error;
/// Presence publishing and staleness evaluation.
pub mod presence;
/// Quiet-hours notification gate.
pub mod quiet_hours;
/// Backoff policy used by the retry scheduler.
pub mod retry;
/// Keyed retry scheduler.
pub mod scheduler;

pub use config::{ConfigError, ResilienceConfig};
pub use error::{OperationError, OperationOutcome, OutcomeKind, classify};
pub use presence::{
    ExitTransport, PresenceConfig, PresenceError, PresenceRecord, PresenceStatus, PresenceStore,
    PresenceTracker, TeardownSignal, effective_status, effective_status_with,
};
pub use quiet_hours::{QuietHoursError, QuietHoursWindow, is_suppressed};
pub use retry::RetryPolicy;
pub use scheduler::{RetryTask, TaskRetryScheduler};
