//! Smoke binary wiring the resilience layer against local or REST collaborators.

mod logging;

use std::{
    env,
    process,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use chrono::Utc;
use resilience_core::{
    ExitTransport, OperationError, PresenceConfig, PresenceStore, PresenceTracker,
    QuietHoursWindow, ResilienceConfig, RetryPolicy, RetryTask, TaskRetryScheduler,
    TeardownSignal, classify, effective_status_with,
};
use resilience_platform::{
    InMemoryPresenceStore, RestPresenceClient, RestPresenceConfig, rest::EXIT_REQUEST_TIMEOUT,
};
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

const DEFAULT_SESSION_SECS: u64 = 20;

#[tokio::main]
async fn main() {
    logging::init();

    let config = match ResilienceConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Invalid configuration: {err}");
            process::exit(2);
        }
    };
    info!(?config, "starting resilience smoke run");

    run_retry_demo(config.retry).await;
    run_quiet_hours_demo();

    if let Err(err) = run_presence_demo(config.presence).await {
        eprintln!("Presence demo failed: {err}");
        process::exit(1);
    }
}

async fn run_retry_demo(policy: RetryPolicy) {
    let scheduler = TaskRetryScheduler::new(policy);
    let calls = Arc::new(AtomicU32::new(0));

    let attempts_seen = Arc::clone(&calls);
    scheduler.submit(
        RetryTask::new("send-message:smoke", move |attempt| {
            attempts_seen.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 3 {
                    Err(OperationError::new("fetch_failed", "Failed to fetch"))
                } else {
                    Ok(())
                }
            }
        })
        .initial_delay(Duration::from_millis(200))
        .on_attempt_failed(|err, attempt, next_delay| {
            let outcome = classify("Send message", err);
            info!(
                attempt,
                next_delay_ms = next_delay.map(|d| d.as_millis() as u64),
                title = %outcome.title,
                retryable = outcome.retryable,
                "{}",
                outcome.description
            );
        }),
    );

    let denied = OperationError::new("42501", "new row violates row-level security policy");
    let outcome = classify("Send message", &denied);
    if outcome.retryable {
        warn!("denied error unexpectedly classified as retryable");
    } else {
        info!(title = %outcome.title, "terminal failure; not handed to the scheduler");
    }

    scheduler.wait_until_drained().await;
    info!(
        runs = calls.load(Ordering::SeqCst),
        "retry demo finished"
    );
}

fn run_quiet_hours_demo() {
    let timezone = env::var("RESILIENCE_SMOKE_TIMEZONE").unwrap_or_else(|_| "UTC".to_owned());
    match QuietHoursWindow::from_clock_strings(true, "23:00", "07:00", timezone) {
        Ok(window) => info!(
            timezone = %window.timezone,
            suppressed = window.is_suppressed(Utc::now()),
            "quiet hours evaluated"
        ),
        Err(err) => warn!(error = %err, "quiet hours window rejected"),
    }
}

async fn run_presence_demo(config: PresenceConfig) -> Result<(), String> {
    let subject_id = env::var("RESILIENCE_SUBJECT_ID")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let session_secs = env::var("RESILIENCE_SMOKE_SESSION_SECS")
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(DEFAULT_SESSION_SECS);

    let local = InMemoryPresenceStore::default();
    let rest_client = rest_config_from_env()?.map(|rest| {
        info!(base_url = %rest.base_url, "using REST presence backend");
        Arc::new(RestPresenceClient::new(rest))
    });
    let (store, exit): (Arc<dyn PresenceStore>, Arc<dyn ExitTransport>) = match &rest_client {
        Some(client) => {
            let store: Arc<dyn PresenceStore> = client.clone();
            let exit: Arc<dyn ExitTransport> = client.clone();
            (store, exit)
        }
        None => {
            info!("using in-memory presence backend");
            let store: Arc<dyn PresenceStore> = Arc::new(local.clone());
            let exit: Arc<dyn ExitTransport> = Arc::new(local.clone());
            (store, exit)
        }
    };

    let tracker = PresenceTracker::new(subject_id.clone(), store, exit, config);
    tracker
        .start_session()
        .await
        .map_err(|err| err.to_string())?;
    info!(%subject_id, session_secs, "presence session running; Ctrl-C to end early");

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(err) = signal {
                warn!(error = %err, "ctrl-c handler unavailable");
            }
            tracker.handle_teardown(TeardownSignal::BeforeUnload);
        }
        _ = tokio::time::sleep(Duration::from_secs(session_secs)) => {
            tracker.handle_teardown(TeardownSignal::Hidden);
        }
    }
    tracker.end_session().await;
    if let Some(client) = &rest_client
        && client.flush_exit_signals(EXIT_REQUEST_TIMEOUT).await
    {
        debug!("offline signal flushed");
    }

    match local.get(&subject_id) {
        Ok(Some(record)) => info!(
            stored = %record.status,
            effective = %effective_status_with(&record, Utc::now(), tracker.config().stale_after),
            "observer view of own presence"
        ),
        Ok(None) => debug!("no local presence record to observe"),
        Err(err) => warn!(error = %err, "local presence record unreadable"),
    }
    Ok(())
}

fn rest_config_from_env() -> Result<Option<RestPresenceConfig>, String> {
    let lookup = |key: &str| env::var(key).ok().filter(|v| !v.trim().is_empty());

    let (Some(base_url), Some(token)) = (
        lookup("RESILIENCE_REST_URL"),
        lookup("RESILIENCE_REST_TOKEN"),
    ) else {
        return Ok(None);
    };

    let base_url = Url::parse(base_url.trim())
        .map_err(|err| format!("invalid RESILIENCE_REST_URL='{base_url}': {err}"))?;
    let mut config = RestPresenceConfig::new(base_url, token.trim());
    if let Some(table) = lookup("RESILIENCE_REST_TABLE") {
        config = config.with_table(table.trim());
    }
    if let Some(api_key) = lookup("RESILIENCE_REST_API_KEY") {
        config = config.with_api_key(api_key.trim());
    }
    Ok(Some(config))
}
