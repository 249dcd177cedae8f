use std::{
    collections::HashMap,
    fmt,
    future::Future,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use futures::{FutureExt, future::BoxFuture};
use tokio::{runtime::Handle, sync::watch, task::JoinHandle};
use tracing::{debug, warn};

use crate::{error::OperationError, retry::RetryPolicy};

/// Unit of work run once per attempt. Receives the 1-based attempt number.
pub type RunFn =
    Arc<dyn Fn(u32) -> BoxFuture<'static, Result<(), OperationError>> + Send + Sync + 'static>;
/// Called after every failed attempt with the delay before the next one, or
/// `None` when no further attempt will be made.
pub type AttemptFailedFn =
    Arc<dyn Fn(&OperationError, u32, Option<Duration>) + Send + Sync + 'static>;
/// Called once when a task gives up, with the final error and attempt count.
pub type PermanentFailureFn = Arc<dyn Fn(&OperationError, u32) + Send + Sync + 'static>;

/// A named, retryable operation submitted to [`TaskRetryScheduler`].
pub struct RetryTask {
    key: String,
    max_attempts: Option<u32>,
    initial_delay: Option<Duration>,
    run: RunFn,
    on_attempt_failed: Option<AttemptFailedFn>,
    on_permanent_failure: Option<PermanentFailureFn>,
}

impl RetryTask {
    pub fn new<F, Fut>(key: impl Into<String>, run: F) -> Self
    where
        F: Fn(u32) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), OperationError>> + Send + 'static,
    {
        Self {
            key: key.into(),
            max_attempts: None,
            initial_delay: None,
            run: Arc::new(move |attempt| run(attempt).boxed()),
            on_attempt_failed: None,
            on_permanent_failure: None,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Override the scheduler's default attempt budget for this task.
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Override the scheduler's default first backoff delay for this task.
    pub fn initial_delay(mut self, initial_delay: Duration) -> Self {
        self.initial_delay = Some(initial_delay);
        self
    }

    pub fn on_attempt_failed<F>(mut self, callback: F) -> Self
    where
        F: Fn(&OperationError, u32, Option<Duration>) + Send + Sync + 'static,
    {
        self.on_attempt_failed = Some(Arc::new(callback));
        self
    }

    pub fn on_permanent_failure<F>(mut self, callback: F) -> Self
    where
        F: Fn(&OperationError, u32) + Send + Sync + 'static,
    {
        self.on_permanent_failure = Some(Arc::new(callback));
        self
    }

    fn resolve(self, defaults: RetryPolicy) -> (String, Arc<ResolvedTask>) {
        let mut policy = defaults;
        if let Some(max_attempts) = self.max_attempts {
            policy = policy.with_max_attempts(max_attempts);
        }
        if let Some(initial_delay) = self.initial_delay {
            policy = policy.with_initial_delay_ms(initial_delay.as_millis() as u64);
        }

        (
            self.key,
            Arc::new(ResolvedTask {
                policy,
                run: self.run,
                on_attempt_failed: self.on_attempt_failed,
                on_permanent_failure: self.on_permanent_failure,
            }),
        )
    }
}

impl fmt::Debug for RetryTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryTask")
            .field("key", &self.key)
            .field("max_attempts", &self.max_attempts)
            .field("initial_delay", &self.initial_delay)
            .finish_non_exhaustive()
    }
}

struct ResolvedTask {
    policy: RetryPolicy,
    run: RunFn,
    on_attempt_failed: Option<AttemptFailedFn>,
    on_permanent_failure: Option<PermanentFailureFn>,
}

struct PendingTimer {
    id: u64,
    handle: JoinHandle<()>,
}

struct TrackedTask {
    generation: u64,
    task: Arc<ResolvedTask>,
    attempts: u32,
    in_flight: bool,
    timer: Option<PendingTimer>,
}

struct AttemptClaim {
    task: Arc<ResolvedTask>,
    attempt: u32,
    generation: u64,
}

type TaskMap = HashMap<String, TrackedTask>;

struct SchedulerInner {
    runtime: Handle,
    defaults: RetryPolicy,
    tasks: Mutex<TaskMap>,
    next_id: AtomicU64,
    size_tx: watch::Sender<usize>,
}

/// Runs named operations and retries failures with capped, jittered backoff.
///
/// A key is tracked from submission until the task succeeds or exhausts its
/// attempts. While tracked, further submissions for the key are dropped and
/// attempts for it never overlap. Distinct keys run independently.
///
/// Nothing is persisted: dropping the scheduler (or calling
/// [`TaskRetryScheduler::shutdown`]) loses all pending work.
#[derive(Clone)]
pub struct TaskRetryScheduler {
    inner: Arc<SchedulerInner>,
}

impl TaskRetryScheduler {
    /// Create a scheduler bound to the current Tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime context.
    pub fn new(defaults: RetryPolicy) -> Self {
        Self::with_runtime(Handle::current(), defaults)
    }

    /// Create a scheduler that spawns attempts and timers on `runtime`.
    pub fn with_runtime(runtime: Handle, defaults: RetryPolicy) -> Self {
        let (size_tx, _) = watch::channel(0);
        Self {
            inner: Arc::new(SchedulerInner {
                runtime,
                defaults,
                tasks: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                size_tx,
            }),
        }
    }

    /// Register `task` and start its first attempt.
    ///
    /// Returns `false` without touching anything when the key is already
    /// tracked. The duplicate is dropped rather than queued, so callers must
    /// only reuse a key for requests the in-flight one also satisfies.
    pub fn submit(&self, task: RetryTask) -> bool {
        let (key, task) = task.resolve(self.inner.defaults);

        let claim = {
            let mut tasks = self.inner.lock();
            if tasks.contains_key(&key) {
                debug!(task_key = %key, "task already tracked; dropping duplicate submission");
                return false;
            }

            let generation = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
            tasks.insert(
                key.clone(),
                TrackedTask {
                    generation,
                    task,
                    attempts: 0,
                    in_flight: false,
                    timer: None,
                },
            );
            self.inner.publish_size(&tasks);
            claim_attempt(&mut tasks, &key, None)
        };

        debug!(task_key = %key, "task submitted");
        if let Some(claim) = claim {
            self.inner.spawn_attempt(key, claim);
        }
        true
    }

    /// Skip the pending backoff for `key` and start the next attempt now.
    ///
    /// Returns `false` when the key is not tracked or an attempt is already
    /// in flight.
    pub fn retry_now(&self, key: &str) -> bool {
        let claim = claim_attempt(&mut self.inner.lock(), key, None);
        match claim {
            Some(claim) => {
                debug!(task_key = %key, attempt = claim.attempt, "immediate retry requested");
                self.inner.spawn_attempt(key.to_owned(), claim);
                true
            }
            None => false,
        }
    }

    /// Number of tasks still tracked (pending or in flight).
    pub fn size(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_tracked(&self, key: &str) -> bool {
        self.inner.lock().contains_key(key)
    }

    /// Resolve once no task is tracked.
    pub async fn wait_until_drained(&self) {
        let mut size_rx = self.inner.size_tx.subscribe();
        // The sender lives as long as `self`, so this cannot observe a closed channel.
        let _ = size_rx.wait_for(|size| *size == 0).await;
    }

    /// Drop every tracked task and release its pending timer.
    ///
    /// Attempts already in flight run to completion but their results are
    /// ignored.
    pub fn shutdown(&self) {
        let mut tasks = self.inner.lock();
        let dropped = tasks.len();
        for (_, tracked) in tasks.drain() {
            if let Some(timer) = tracked.timer {
                timer.handle.abort();
            }
        }
        self.inner.publish_size(&tasks);
        debug!(dropped, "retry scheduler shut down");
    }
}

impl fmt::Debug for TaskRetryScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRetryScheduler")
            .field("defaults", &self.inner.defaults)
            .field("size", &self.size())
            .finish()
    }
}

impl SchedulerInner {
    fn lock(&self) -> MutexGuard<'_, TaskMap> {
        // Every critical section leaves the map consistent, so a panic
        // elsewhere never invalidates it.
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish_size(&self, tasks: &TaskMap) {
        self.size_tx.send_replace(tasks.len());
    }

    fn spawn_attempt(self: &Arc<Self>, key: String, claim: AttemptClaim) {
        let inner = Arc::clone(self);
        self.runtime.spawn(async move {
            inner.execute(key, claim).await;
        });
    }

    async fn execute(self: Arc<Self>, key: String, claim: AttemptClaim) {
        let AttemptClaim {
            task,
            attempt,
            generation,
        } = claim;

        // `run` itself may panic before handing back a future, so call it inside the guard.
        let result = match AssertUnwindSafe(async { (task.run)(attempt).await })
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(_) => {
                warn!(task_key = %key, attempt, "task panicked while running");
                Err(OperationError::new(
                    "task_panicked",
                    "task panicked while running",
                ))
            }
        };

        let error = match result {
            Ok(()) => {
                if self.remove_if_current(&key, generation) {
                    debug!(task_key = %key, attempt, "task succeeded");
                }
                return;
            }
            Err(error) => error,
        };

        if attempt >= task.policy.max_attempts() {
            if !self.remove_if_current(&key, generation) {
                debug!(task_key = %key, attempt, "task dropped before final failure was reported");
                return;
            }
            warn!(task_key = %key, attempt, error = %error, "task failed permanently");
            if let Some(callback) = &task.on_attempt_failed {
                notify(&key, || callback(&error, attempt, None));
            }
            if let Some(callback) = &task.on_permanent_failure {
                notify(&key, || callback(&error, attempt));
            }
            return;
        }

        if !self.is_current(&key, generation) {
            debug!(task_key = %key, attempt, "task dropped before retry was scheduled");
            return;
        }

        let delay = task.policy.delay_for_attempt(attempt);
        debug!(
            task_key = %key,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "task attempt failed; retry scheduled"
        );
        if let Some(callback) = &task.on_attempt_failed {
            notify(&key, || callback(&error, attempt, Some(delay)));
        }
        self.schedule_retry(key, generation, delay);
    }

    fn schedule_retry(self: &Arc<Self>, key: String, generation: u64, delay: Duration) {
        let mut tasks = self.lock();
        let Some(tracked) = tasks
            .get_mut(&key)
            .filter(|tracked| tracked.generation == generation)
        else {
            return;
        };

        let timer_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::clone(self);
        let timer_key = key.clone();
        // The lock is held until the timer is stored, so even a zero delay
        // finds its own id when it fires.
        let handle = self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let claim = claim_attempt(&mut inner.lock(), &timer_key, Some(timer_id));
            if let Some(claim) = claim {
                inner.execute(timer_key, claim).await;
            }
        });

        tracked.in_flight = false;
        if let Some(previous) = tracked.timer.replace(PendingTimer {
            id: timer_id,
            handle,
        }) {
            previous.handle.abort();
        }
    }

    fn is_current(&self, key: &str, generation: u64) -> bool {
        self.lock()
            .get(key)
            .is_some_and(|tracked| tracked.generation == generation)
    }

    fn remove_if_current(&self, key: &str, generation: u64) -> bool {
        let mut tasks = self.lock();
        if !tasks
            .get(key)
            .is_some_and(|tracked| tracked.generation == generation)
        {
            return false;
        }
        tasks.remove(key);
        self.publish_size(&tasks);
        true
    }
}

/// Start the next attempt for `key` if it is tracked and idle.
///
/// `fired_timer` identifies the backoff timer that triggered the call; a stale
/// timer (already replaced or cancelled) claims nothing. Any other caller
/// cancels the pending timer.
fn claim_attempt(tasks: &mut TaskMap, key: &str, fired_timer: Option<u64>) -> Option<AttemptClaim> {
    let tracked = tasks.get_mut(key)?;

    match fired_timer {
        Some(id) => {
            if tracked.timer.as_ref().map(|timer| timer.id) != Some(id) {
                return None;
            }
            tracked.timer = None;
        }
        None => {
            if let Some(timer) = tracked.timer.take() {
                timer.handle.abort();
            }
        }
    }

    if tracked.in_flight {
        return None;
    }

    tracked.in_flight = true;
    tracked.attempts += 1;
    Some(AttemptClaim {
        task: Arc::clone(&tracked.task),
        attempt: tracked.attempts,
        generation: tracked.generation,
    })
}

fn notify(key: &str, callback: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(callback)).is_err() {
        warn!(task_key = %key, "retry callback panicked");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use tokio::{
        sync::{Barrier, Notify, mpsc},
        time::{Instant, timeout},
    };

    use super::*;

    const DRAIN_TIMEOUT: Duration = Duration::from_secs(600);

    fn scheduler() -> TaskRetryScheduler {
        TaskRetryScheduler::new(RetryPolicy::default())
    }

    fn recorder() -> Arc<StdMutex<Vec<u32>>> {
        Arc::new(StdMutex::new(Vec::new()))
    }

    async fn drained(scheduler: &TaskRetryScheduler) {
        timeout(DRAIN_TIMEOUT, scheduler.wait_until_drained())
            .await
            .expect("scheduler should drain");
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_success() {
        let scheduler = scheduler();
        let attempts = recorder();
        let seen = Arc::clone(&attempts);

        let submitted = scheduler.submit(
            RetryTask::new("send:1", move |attempt| {
                seen.lock().unwrap().push(attempt);
                async move {
                    if attempt < 3 {
                        Err(OperationError::from("Failed to fetch"))
                    } else {
                        Ok(())
                    }
                }
            })
            .max_attempts(3),
        );
        assert!(submitted);

        drained(&scheduler).await;
        assert_eq!(*attempts.lock().unwrap(), vec![1, 2, 3]);
        assert_eq!(scheduler.size(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let scheduler = scheduler();
        let attempts = recorder();
        let seen = Arc::clone(&attempts);
        let events = Arc::new(StdMutex::new(Vec::<String>::new()));
        let failed_events = Arc::clone(&events);
        let permanent_events = Arc::clone(&events);

        scheduler.submit(
            RetryTask::new("send:2", move |attempt| {
                seen.lock().unwrap().push(attempt);
                async { Err(OperationError::from("network down")) }
            })
            .max_attempts(2)
            .on_attempt_failed(move |_, attempt, delay| {
                failed_events
                    .lock()
                    .unwrap()
                    .push(format!("failed:{attempt}:{}", delay.is_some()));
            })
            .on_permanent_failure(move |err, attempts| {
                permanent_events
                    .lock()
                    .unwrap()
                    .push(format!("permanent:{attempts}:{}", err.message));
            }),
        );

        drained(&scheduler).await;
        assert_eq!(*attempts.lock().unwrap(), vec![1, 2]);
        assert_eq!(
            *events.lock().unwrap(),
            vec![
                "failed:1:true".to_owned(),
                "failed:2:false".to_owned(),
                "permanent:2:network down".to_owned(),
            ]
        );
        assert_eq!(scheduler.size(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_submission_is_dropped() {
        let scheduler = scheduler();
        let release = Arc::new(Notify::new());
        let original = recorder();
        let duplicate = recorder();

        let gate = Arc::clone(&release);
        let seen = Arc::clone(&original);
        assert!(scheduler.submit(RetryTask::new("edit:9", move |attempt| {
            seen.lock().unwrap().push(attempt);
            let gate = Arc::clone(&gate);
            async move {
                gate.notified().await;
                Ok(())
            }
        })));
        tokio::task::yield_now().await;

        let seen = Arc::clone(&duplicate);
        assert!(!scheduler.submit(RetryTask::new("edit:9", move |attempt| {
            seen.lock().unwrap().push(attempt);
            async { Ok(()) }
        })));
        assert_eq!(scheduler.size(), 1);

        release.notify_one();
        drained(&scheduler).await;
        assert_eq!(*original.lock().unwrap(), vec![1]);
        assert!(duplicate.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_waits_within_jitter_window() {
        let scheduler = scheduler();
        let started = Arc::new(StdMutex::new(Vec::<Instant>::new()));
        let delays = Arc::new(StdMutex::new(Vec::<Duration>::new()));

        let seen = Arc::clone(&started);
        let reported = Arc::clone(&delays);
        scheduler.submit(
            RetryTask::new("upload:1", move |attempt| {
                seen.lock().unwrap().push(Instant::now());
                async move {
                    if attempt < 4 {
                        Err(OperationError::from("503 temporarily unavailable"))
                    } else {
                        Ok(())
                    }
                }
            })
            .on_attempt_failed(move |_, _, delay| {
                reported.lock().unwrap().extend(delay);
            }),
        );

        drained(&scheduler).await;
        let started = started.lock().unwrap();
        let delays = delays.lock().unwrap();
        assert_eq!(started.len(), 4);
        assert_eq!(delays.len(), 3);

        for (index, delay) in delays.iter().enumerate() {
            let floor = Duration::from_millis(1_000 << index);
            assert!(*delay >= floor && *delay < floor + Duration::from_millis(250));
            let waited = started[index + 1] - started[index];
            assert!(waited >= *delay, "waited {waited:?} < reported {delay:?}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn distinct_keys_run_concurrently() {
        let scheduler = scheduler();
        let barrier = Arc::new(Barrier::new(2));

        for key in ["a", "b"] {
            let barrier = Arc::clone(&barrier);
            scheduler.submit(
                RetryTask::new(key, move |_| {
                    let barrier = Arc::clone(&barrier);
                    async move {
                        barrier.wait().await;
                        Ok(())
                    }
                })
                .max_attempts(1),
            );
        }

        drained(&scheduler).await;
        assert_eq!(scheduler.size(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn same_key_attempts_never_overlap() {
        let scheduler = scheduler();
        let running = Arc::new(AtomicU64::new(0));
        let overlaps = Arc::new(AtomicU64::new(0));

        let (running_in, overlaps_in) = (Arc::clone(&running), Arc::clone(&overlaps));
        let key_scheduler = scheduler.clone();
        scheduler.submit(
            RetryTask::new("sync", move |attempt| {
                let running = Arc::clone(&running_in);
                let overlaps = Arc::clone(&overlaps_in);
                let key_scheduler = key_scheduler.clone();
                async move {
                    if running.fetch_add(1, Ordering::SeqCst) > 0 {
                        overlaps.fetch_add(1, Ordering::SeqCst);
                    }
                    // Asking for an immediate retry while in flight must not start one.
                    assert!(!key_scheduler.retry_now("sync"));
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    if attempt < 3 {
                        Err(OperationError::from("timeout"))
                    } else {
                        Ok(())
                    }
                }
            })
            .initial_delay(Duration::from_millis(10)),
        );

        drained(&scheduler).await;
        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_now_skips_pending_backoff() {
        let scheduler = scheduler();
        let (failed_tx, mut failed_rx) = mpsc::unbounded_channel();
        let attempts = recorder();
        let seen = Arc::clone(&attempts);

        scheduler.submit(
            RetryTask::new("react:1", move |attempt| {
                seen.lock().unwrap().push(attempt);
                async move {
                    if attempt == 1 {
                        Err(OperationError::from("Failed to fetch"))
                    } else {
                        Ok(())
                    }
                }
            })
            .initial_delay(Duration::from_secs(20))
            .on_attempt_failed(move |_, attempt, _| {
                let _ = failed_tx.send(attempt);
            }),
        );

        let start = Instant::now();
        assert_eq!(failed_rx.recv().await, Some(1));
        while !scheduler.retry_now("react:1") {
            tokio::task::yield_now().await;
        }

        drained(&scheduler).await;
        assert!(start.elapsed() < Duration::from_secs(20));
        assert_eq!(*attempts.lock().unwrap(), vec![1, 2]);
        assert!(!scheduler.retry_now("react:1"));
    }

    async fn explode(_attempt: u32) -> Result<(), OperationError> {
        panic!("boom")
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_run_is_reported_as_failure() {
        let scheduler = scheduler();
        let reported = Arc::new(StdMutex::new(None::<(String, u32)>));
        let sink = Arc::clone(&reported);

        scheduler.submit(
            RetryTask::new("explode", explode)
                .max_attempts(1)
                .on_permanent_failure(move |err, attempts| {
                    *sink.lock().unwrap() = Some((err.code.clone(), attempts));
                }),
        );

        drained(&scheduler).await;
        assert_eq!(
            *reported.lock().unwrap(),
            Some(("task_panicked".to_owned(), 1))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn run_panicking_before_its_future_is_reported_as_failure() {
        let scheduler = scheduler();
        let reported = Arc::new(StdMutex::new(None::<(String, u32)>));
        let sink = Arc::clone(&reported);

        scheduler.submit(
            RetryTask::new(
                "sync-panic",
                |_| -> std::future::Ready<Result<(), OperationError>> {
                    panic!("boom before future")
                },
            )
            .max_attempts(1)
            .on_permanent_failure(move |err, attempts| {
                *sink.lock().unwrap() = Some((err.code.clone(), attempts));
            }),
        );

        drained(&scheduler).await;
        assert_eq!(
            *reported.lock().unwrap(),
            Some(("task_panicked".to_owned(), 1))
        );
        assert!(!scheduler.is_tracked("sync-panic"));
        assert!(scheduler.submit(RetryTask::new("sync-panic", |_| async { Ok(()) })));
        drained(&scheduler).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_submits_for_one_key_track_a_single_task() {
        const SUBMITTERS: usize = 16;

        let scheduler = scheduler();
        let runs = Arc::new(AtomicU64::new(0));
        let release = Arc::new(Notify::new());
        let start = Arc::new(std::sync::Barrier::new(SUBMITTERS));

        let submitters = (0..SUBMITTERS)
            .map(|_| {
                let scheduler = scheduler.clone();
                let runs = Arc::clone(&runs);
                let release = Arc::clone(&release);
                let start = Arc::clone(&start);
                tokio::task::spawn_blocking(move || {
                    start.wait();
                    scheduler.submit(RetryTask::new("contended", move |_| {
                        runs.fetch_add(1, Ordering::SeqCst);
                        let release = Arc::clone(&release);
                        async move {
                            release.notified().await;
                            Ok(())
                        }
                    }))
                })
            })
            .collect::<Vec<_>>();

        let mut accepted = 0;
        for submitter in submitters {
            if submitter.await.expect("submitter should not panic") {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 1);
        assert_eq!(scheduler.size(), 1);

        release.notify_one();
        timeout(Duration::from_secs(10), scheduler.wait_until_drained())
            .await
            .expect("scheduler should drain");
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_pending_retries() {
        let scheduler = scheduler();
        let attempts = recorder();
        let seen = Arc::clone(&attempts);
        let (failed_tx, mut failed_rx) = mpsc::unbounded_channel();

        scheduler.submit(
            RetryTask::new("presence", move |attempt| {
                seen.lock().unwrap().push(attempt);
                async { Err(OperationError::from("network")) }
            })
            .on_attempt_failed(move |_, attempt, _| {
                let _ = failed_tx.send(attempt);
            }),
        );

        assert_eq!(failed_rx.recv().await, Some(1));
        scheduler.shutdown();
        assert_eq!(scheduler.size(), 0);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(*attempts.lock().unwrap(), vec![1]);
        assert!(!scheduler.is_tracked("presence"));
    }

    #[tokio::test(start_paused = true)]
    async fn key_is_reusable_after_completion() {
        let scheduler = scheduler();
        let runs = Arc::new(AtomicU64::new(0));

        for _ in 0..2 {
            let runs = Arc::clone(&runs);
            assert!(scheduler.submit(RetryTask::new("typing", move |_| {
                runs.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })));
            drained(&scheduler).await;
        }

        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_callback_does_not_strand_task() {
        let scheduler = scheduler();
        let attempts = recorder();
        let seen = Arc::clone(&attempts);

        scheduler.submit(
            RetryTask::new("cb", move |attempt| {
                seen.lock().unwrap().push(attempt);
                async move {
                    if attempt == 1 {
                        Err(OperationError::from("rate limit"))
                    } else {
                        Ok(())
                    }
                }
            })
            .on_attempt_failed(|_, _, _| panic!("callback bug")),
        );

        drained(&scheduler).await;
        assert_eq!(*attempts.lock().unwrap(), vec![1, 2]);
    }
}
