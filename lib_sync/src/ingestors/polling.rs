//! # Adaptive Polling Scheduler
//!
//! Runs caller-supplied async fetchers on self-rescheduling timers, one timer
//! per task. A task never runs on a fixed rate: the next delay is computed
//! after the previous run finished, so a slow fetch cannot overlap itself.
//!
//! ## Interval computation
//!
//! ```text
//! effective = current
//!           * inactivity multiplier   (no user interaction within the threshold)
//!           * priority factor         (high 0.5, normal 1, low 2)
//!           + jitter                  (up to jitter_ratio of the above)
//! clamped to [min_interval, max_interval]
//! ```
//!
//! `current` starts at the task's base interval. Each failure multiplies it by
//! the backoff multiplier (capped at `max_interval`); after `max_retries`
//! consecutive failures it is pinned at `max_interval`. A success resets it.
//!
//! ## Gates
//!
//! Before a timed run the task checks its `should_poll` predicate and that all
//! its dependencies last succeeded with no consecutive errors. A gated run is
//! skipped and the task simply reschedules.
//!
//! ## Environment
//!
//! Timers are suspended while the consumer is in the background or the network
//! is down. Foreground, network-up and user-activity transitions re-evaluate
//! every task; network-up also resets all retry counters.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, watch, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::backoff::add_jitter;
use crate::configs::PollingConfig;
use crate::core::environment::{is_stale, EnvironmentEvent, EnvironmentObserver};
use crate::core::lock_or_recover;
use crate::error::SyncError;

/// Zero-argument async fetch. Failure is an `Err`, never a sentinel value.
pub type PollFetcher = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;
/// Called with each successful result.
pub type SuccessHook = Arc<dyn Fn(&Value) + Send + Sync>;
/// Called with each failure.
pub type ErrorHook = Arc<dyn Fn(&SyncError) + Send + Sync>;
/// Extra gate evaluated before each timed run.
pub type PollPredicate = Arc<dyn Fn() -> bool + Send + Sync>;

/// Scales the interval of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Polls twice as often.
    High,
    /// Polls at the base interval.
    #[default]
    Normal,
    /// Polls half as often.
    Low,
}

/// Registration of one pull task.
#[derive(Clone)]
pub struct PollTask {
    key: String,
    fetcher: PollFetcher,
    interval: Option<Duration>,
    priority: Priority,
    dependencies: Vec<String>,
    on_success: Option<SuccessHook>,
    on_error: Option<ErrorHook>,
    should_poll: Option<PollPredicate>,
}

impl PollTask {
    /// Task `key` running `fetcher`.
    pub fn new<F, Fut>(key: impl Into<String>, fetch: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let fetcher: PollFetcher =
            Arc::new(move || -> BoxFuture<'static, anyhow::Result<Value>> { Box::pin(fetch()) });
        Self {
            key: key.into(),
            fetcher,
            interval: None,
            priority: Priority::Normal,
            dependencies: Vec::new(),
            on_success: None,
            on_error: None,
            should_poll: None,
        }
    }

    /// Base interval. Defaults to the scheduler's configured default.
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    /// Priority class.
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Only run while task `key` is healthy.
    pub fn depends_on(mut self, key: impl Into<String>) -> Self {
        self.dependencies.push(key.into());
        self
    }

    /// Hook for successful results.
    pub fn on_success(mut self, hook: impl Fn(&Value) + Send + Sync + 'static) -> Self {
        self.on_success = Some(Arc::new(hook));
        self
    }

    /// Hook for failures.
    pub fn on_error(mut self, hook: impl Fn(&SyncError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(hook));
        self
    }

    /// Predicate that must hold for a timed run.
    pub fn should_poll(mut self, predicate: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        self.should_poll = Some(Arc::new(predicate));
        self
    }

    /// Task key.
    pub fn key(&self) -> &str {
        &self.key
    }
}

/// Where a task is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskPhase {
    /// Registered, no timer yet, or stopped.
    Idle,
    /// Timer armed after a success.
    Scheduled,
    /// Fetch in flight.
    Running,
    /// Timer armed after a failure.
    Backoff,
    /// Suspended by the environment or by request.
    Paused,
}

/// Snapshot of one task.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStatus {
    /// Task key.
    pub key: String,
    /// Current phase.
    pub phase: TaskPhase,
    /// Priority class.
    pub priority: Priority,
    /// Interval the task was registered with, after clamping.
    pub base_interval_ms: u64,
    /// Interval after backoff, before priority, inactivity and jitter.
    pub current_interval_ms: u64,
    /// Delay of the armed timer, if any.
    pub next_delay_ms: Option<u64>,
    /// Failures counted toward `max_retries`; reset by success or network recovery.
    pub retry_count: u32,
    /// Failures since the last success.
    pub consecutive_errors: u32,
    /// Fetches started.
    pub executions: u64,
    /// Completion time of the last successful fetch.
    pub last_success_at: Option<DateTime<Utc>>,
    /// Rendered last failure, cleared by a success.
    pub last_error: Option<String>,
    /// Paused by `pause_task`/`pause_all` (independent of the environment).
    pub paused: bool,
}

struct TaskRuntime {
    phase: TaskPhase,
    current_interval: Duration,
    next_delay: Option<Duration>,
    retry_count: u32,
    consecutive_errors: u32,
    executions: u64,
    last_success_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

struct TaskShared {
    spec: PollTask,
    base_interval: Duration,
    runtime: Mutex<TaskRuntime>,
    kick: Notify,
    paused: watch::Sender<bool>,
    cancel: CancellationToken,
}

impl TaskShared {
    fn status(&self) -> TaskStatus {
        let rt = lock_or_recover(&self.runtime);
        TaskStatus {
            key: self.spec.key.clone(),
            phase: rt.phase,
            priority: self.spec.priority,
            base_interval_ms: self.base_interval.as_millis() as u64,
            current_interval_ms: rt.current_interval.as_millis() as u64,
            next_delay_ms: rt.next_delay.map(|d| d.as_millis() as u64),
            retry_count: rt.retry_count,
            consecutive_errors: rt.consecutive_errors,
            executions: rt.executions,
            last_success_at: rt.last_success_at,
            last_error: rt.last_error.clone(),
            paused: *self.paused.borrow(),
        }
    }

    fn healthy(&self) -> bool {
        let rt = lock_or_recover(&self.runtime);
        rt.last_success_at.is_some() && rt.consecutive_errors == 0
    }

    fn set_phase(&self, phase: TaskPhase, next_delay: Option<Duration>) {
        let mut rt = lock_or_recover(&self.runtime);
        rt.phase = match phase {
            TaskPhase::Scheduled if rt.consecutive_errors > 0 => TaskPhase::Backoff,
            other => other,
        };
        rt.next_delay = next_delay;
    }

    fn reset_retries(&self) {
        let mut rt = lock_or_recover(&self.runtime);
        rt.retry_count = 0;
        rt.current_interval = self.base_interval;
    }
}

type TaskTable = Arc<Mutex<HashMap<String, Arc<TaskShared>>>>;

/// Everything a task loop needs besides its own state.
#[derive(Clone)]
struct LoopContext {
    config: PollingConfig,
    environment: Arc<dyn EnvironmentObserver>,
    tasks: TaskTable,
    epoch: watch::Receiver<u64>,
}

impl LoopContext {
    fn environment_blocks(&self) -> bool {
        !self.environment.is_foreground() || !self.environment.is_network_up()
    }

    fn user_inactive(&self) -> bool {
        is_stale(
            self.environment.last_user_activity_at(),
            Instant::now(),
            self.config.inactivity_threshold(),
        )
    }

    fn next_delay(&self, task: &TaskShared) -> Duration {
        let current = lock_or_recover(&task.runtime).current_interval;
        let effective = effective_interval(current, task.spec.priority, self.user_inactive(), &self.config);
        clamp(add_jitter(effective, self.config.jitter_ratio), &self.config)
    }

    /// Reason a timed run must be skipped, if any.
    fn gate(&self, task: &TaskShared) -> Option<String> {
        if self.environment_blocks() {
            return Some("environment paused".to_string());
        }
        if let Some(predicate) = &task.spec.should_poll {
            if !predicate() {
                return Some("shouldPoll returned false".to_string());
            }
        }
        if task.spec.dependencies.is_empty() {
            return None;
        }
        let tasks = lock_or_recover(&self.tasks);
        for dep in &task.spec.dependencies {
            match tasks.get(dep) {
                Some(other) if other.healthy() => {}
                Some(_) => return Some(format!("dependency '{}' unhealthy", dep)),
                None => return Some(format!("dependency '{}' not registered", dep)),
            }
        }
        None
    }
}

/// Interval before jitter: current interval scaled by inactivity and priority,
/// clamped to the configured bounds.
pub fn effective_interval(
    current: Duration,
    priority: Priority,
    user_inactive: bool,
    config: &PollingConfig,
) -> Duration {
    let mut factor = match priority {
        Priority::High => config.high_priority_factor,
        Priority::Normal => 1.0,
        Priority::Low => config.low_priority_factor,
    };
    if user_inactive {
        factor *= config.inactivity_multiplier;
    }
    clamp(current.mul_f64(factor), config)
}

fn clamp(interval: Duration, config: &PollingConfig) -> Duration {
    interval.clamp(config.min_interval(), config.max_interval())
}

/// Self-rescheduling pull tasks with adaptive intervals.
pub struct PollingScheduler {
    config: PollingConfig,
    environment: Arc<dyn EnvironmentObserver>,
    tasks: TaskTable,
    epoch: watch::Sender<u64>,
    cancel: CancellationToken,
}

impl PollingScheduler {
    /// Creates the scheduler and starts watching `environment`.
    pub fn new(config: PollingConfig, environment: Arc<dyn EnvironmentObserver>) -> Self {
        let (epoch, _) = watch::channel(0u64);
        let scheduler = Self {
            config,
            environment,
            tasks: Arc::new(Mutex::new(HashMap::new())),
            epoch,
            cancel: CancellationToken::new(),
        };
        scheduler.spawn_environment_watch();
        scheduler
    }

    /// Registers `task`, replacing any task with the same key, and arms its
    /// first timer one interval from now.
    pub fn add_task(&self, task: PollTask) {
        let key = task.key.clone();
        self.remove_task(&key);

        let base_interval = clamp(
            task.interval.unwrap_or_else(|| self.config.default_interval()),
            &self.config,
        );
        let (paused, _) = watch::channel(false);
        let shared = Arc::new(TaskShared {
            spec: task,
            base_interval,
            runtime: Mutex::new(TaskRuntime {
                phase: TaskPhase::Idle,
                current_interval: base_interval,
                next_delay: None,
                retry_count: 0,
                consecutive_errors: 0,
                executions: 0,
                last_success_at: None,
                last_error: None,
            }),
            kick: Notify::new(),
            paused,
            cancel: self.cancel.child_token(),
        });

        lock_or_recover(&self.tasks).insert(key.clone(), Arc::clone(&shared));
        log::info!("[poll] task '{}' added, base interval {:?}", key, base_interval);

        let ctx = LoopContext {
            config: self.config.clone(),
            environment: Arc::clone(&self.environment),
            tasks: Arc::clone(&self.tasks),
            epoch: self.epoch.subscribe(),
        };
        tokio::spawn(drive(shared, ctx));
    }

    /// Stops scheduling `key`. An in-flight fetch still completes.
    pub fn remove_task(&self, key: &str) -> bool {
        let removed = lock_or_recover(&self.tasks).remove(key);
        match removed {
            Some(task) => {
                task.cancel.cancel();
                log::info!("[poll] task '{}' removed", key);
                true
            }
            None => false,
        }
    }

    /// Runs `key` now, bypassing its timer and gates.
    pub fn run_now(&self, key: &str) -> bool {
        self.with_task(key, |task| task.kick.notify_one())
    }

    /// Suspends `key` until [`resume_task`](Self::resume_task).
    pub fn pause_task(&self, key: &str) -> bool {
        self.with_task(key, |task| {
            task.paused.send_replace(true);
        })
    }

    /// Lifts a [`pause_task`](Self::pause_task).
    pub fn resume_task(&self, key: &str) -> bool {
        self.with_task(key, |task| {
            task.paused.send_replace(false);
        })
    }

    /// Pauses every registered task.
    pub fn pause_all(&self) {
        for task in self.snapshot() {
            task.paused.send_replace(true);
        }
    }

    /// Resumes every registered task.
    pub fn resume_all(&self) {
        for task in self.snapshot() {
            task.paused.send_replace(false);
        }
    }

    /// Status of one task.
    pub fn task_status(&self, key: &str) -> Option<TaskStatus> {
        lock_or_recover(&self.tasks).get(key).map(|t| t.status())
    }

    /// Status of every task, sorted by key.
    pub fn statuses(&self) -> Vec<TaskStatus> {
        let mut all: Vec<TaskStatus> = self.snapshot().iter().map(|t| t.status()).collect();
        all.sort_by(|a, b| a.key.cmp(&b.key));
        all
    }

    /// Stops every task and the environment watch.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        lock_or_recover(&self.tasks).clear();
    }

    fn snapshot(&self) -> Vec<Arc<TaskShared>> {
        lock_or_recover(&self.tasks).values().cloned().collect()
    }

    fn with_task(&self, key: &str, f: impl FnOnce(&TaskShared)) -> bool {
        let task = lock_or_recover(&self.tasks).get(key).cloned();
        match task {
            Some(task) => {
                f(&task);
                true
            }
            None => false,
        }
    }

    fn spawn_environment_watch(&self) {
        let mut events = self.environment.events();
        let epoch = self.epoch.clone();
        let tasks = Arc::clone(&self.tasks);
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.recv() => event,
                };
                match event {
                    Ok(EnvironmentEvent::NetworkUp) => {
                        let all: Vec<Arc<TaskShared>> =
                            lock_or_recover(&tasks).values().cloned().collect();
                        log::info!("[poll] network back, resetting {} task(s)", all.len());
                        for task in all {
                            task.reset_retries();
                        }
                    }
                    Ok(event) => log::debug!("[poll] environment {:?}", event),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        log::debug!("[poll] missed {} environment event(s)", missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
                epoch.send_modify(|e| *e += 1);
            }
        });
    }
}

impl Drop for PollingScheduler {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn drive(task: Arc<TaskShared>, mut ctx: LoopContext) {
    let mut paused_rx = task.paused.subscribe();

    loop {
        if task.cancel.is_cancelled() {
            break;
        }

        let paused = *paused_rx.borrow_and_update();
        if paused || ctx.environment_blocks() {
            task.set_phase(TaskPhase::Paused, None);
            tokio::select! {
                _ = task.cancel.cancelled() => break,
                Ok(_) = ctx.epoch.changed() => {}
                Ok(_) = paused_rx.changed() => {}
                _ = task.kick.notified() => execute(&task, &ctx.config).await,
            }
            continue;
        }

        let delay = ctx.next_delay(&task);
        task.set_phase(TaskPhase::Scheduled, Some(delay));

        let manual = tokio::select! {
            _ = task.cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => false,
            _ = task.kick.notified() => true,
            Ok(_) = ctx.epoch.changed() => continue,
            Ok(_) = paused_rx.changed() => continue,
        };

        if !manual {
            if let Some(reason) = ctx.gate(&task) {
                log::debug!("[poll] '{}' skipped: {}", task.spec.key, reason);
                continue;
            }
        }

        execute(&task, &ctx.config).await;
    }

    task.set_phase(TaskPhase::Idle, None);
    log::debug!("[poll] '{}' loop stopped", task.spec.key);
}

async fn execute(task: &TaskShared, config: &PollingConfig) {
    {
        let mut rt = lock_or_recover(&task.runtime);
        rt.phase = TaskPhase::Running;
        rt.next_delay = None;
        rt.executions += 1;
    }

    match (task.spec.fetcher)().await {
        Ok(value) => {
            {
                let mut rt = lock_or_recover(&task.runtime);
                rt.retry_count = 0;
                rt.consecutive_errors = 0;
                rt.current_interval = task.base_interval;
                rt.last_success_at = Some(Utc::now());
                rt.last_error = None;
                rt.phase = TaskPhase::Scheduled;
            }
            if let Some(hook) = &task.spec.on_success {
                hook(&value);
            }
        }
        Err(err) => {
            let error = SyncError::Polling {
                key: task.spec.key.clone(),
                message: format!("{:#}", err),
            };
            let next = {
                let mut rt = lock_or_recover(&task.runtime);
                rt.retry_count += 1;
                rt.consecutive_errors += 1;
                rt.current_interval = if rt.retry_count >= config.max_retries {
                    config.max_interval()
                } else {
                    rt.current_interval
                        .mul_f64(config.backoff_multiplier)
                        .min(config.max_interval())
                };
                rt.last_error = Some(error.to_string());
                rt.phase = TaskPhase::Backoff;
                rt.current_interval
            };
            log::warn!("[poll] {} (next base interval {:?})", error, next);
            if let Some(hook) = &task.spec.on_error {
                hook(&error);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::environment::SharedEnvironment;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn config() -> PollingConfig {
        PollingConfig {
            jitter_ratio: 0.0,
            max_interval_ms: 10_000,
            ..PollingConfig::default()
        }
    }

    fn scheduler(config: PollingConfig) -> (PollingScheduler, Arc<SharedEnvironment>) {
        let env = Arc::new(SharedEnvironment::default());
        (PollingScheduler::new(config, env.clone()), env)
    }

    /// Fetcher that records call times and fails while `failing` is set.
    fn recording(
        failing: Arc<AtomicBool>,
        calls: Arc<Mutex<Vec<Instant>>>,
    ) -> impl Fn() -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync + 'static {
        move || -> BoxFuture<'static, anyhow::Result<Value>> {
            let failing = failing.clone();
            let calls = calls.clone();
            Box::pin(async move {
                calls.lock().unwrap().push(Instant::now());
                if failing.load(Ordering::SeqCst) {
                    anyhow::bail!("upstream 503")
                }
                Ok(json!({"ok": true}))
            })
        }
    }

    fn gaps(start: Instant, calls: &[Instant]) -> Vec<u64> {
        let mut prev = start;
        calls
            .iter()
            .map(|t| {
                let gap = (*t - prev).as_millis() as u64;
                prev = *t;
                gap
            })
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn failures_back_off_geometrically() {
        let (scheduler, _env) = scheduler(config());
        let calls = Arc::new(Mutex::new(Vec::new()));
        let errors = Arc::new(AtomicUsize::new(0));
        let seen = errors.clone();

        let start = Instant::now();
        scheduler.add_task(
            PollTask::new("orders", recording(Arc::new(AtomicBool::new(true)), calls.clone()))
                .interval(Duration::from_millis(1_000))
                .on_error(move |_| {
                    seen.fetch_add(1, Ordering::SeqCst);
                }),
        );

        tokio::time::sleep(Duration::from_millis(1_000 + 1_500 + 2_250 + 10)).await;
        let observed = gaps(start, &calls.lock().unwrap());
        assert_eq!(observed, vec![1_000, 1_500, 2_250]);
        assert_eq!(errors.load(Ordering::SeqCst), 3);

        let status = scheduler.task_status("orders").unwrap();
        assert_eq!(status.retry_count, 3);
        assert_eq!(status.phase, TaskPhase::Backoff);
        assert!(status.last_error.unwrap().contains("upstream 503"));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_pin_at_max_and_success_resets() {
        let cfg = PollingConfig {
            max_retries: 2,
            max_interval_ms: 5_000,
            ..config()
        };
        let (scheduler, _env) = scheduler(cfg);
        let failing = Arc::new(AtomicBool::new(true));
        let calls = Arc::new(Mutex::new(Vec::new()));

        let start = Instant::now();
        scheduler.add_task(
            PollTask::new("stats", recording(failing.clone(), calls.clone()))
                .interval(Duration::from_millis(1_000)),
        );

        tokio::time::sleep(Duration::from_millis(1_000 + 1_500 + 5_000 + 10)).await;
        assert_eq!(gaps(start, &calls.lock().unwrap()), vec![1_000, 1_500, 5_000]);

        failing.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(5_000)).await;
        let status = scheduler.task_status("stats").unwrap();
        assert_eq!(status.retry_count, 0);
        assert_eq!(status.current_interval_ms, 1_000);
        assert!(status.last_success_at.is_some());

        let before = calls.lock().unwrap().len();
        tokio::time::sleep(Duration::from_millis(1_010)).await;
        assert_eq!(calls.lock().unwrap().len(), before + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn success_hook_sees_the_value() {
        let (scheduler, _env) = scheduler(config());
        let got = Arc::new(Mutex::new(None));
        let sink = got.clone();
        scheduler.add_task(
            PollTask::new("users", || async { Ok::<_, anyhow::Error>(json!([1, 2, 3])) })
                .interval(Duration::from_millis(2_000))
                .on_success(move |v| *sink.lock().unwrap() = Some(v.clone())),
        );

        tokio::time::sleep(Duration::from_millis(2_001)).await;
        assert_eq!(*got.lock().unwrap(), Some(json!([1, 2, 3])));
        assert_eq!(scheduler.task_status("users").unwrap().executions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unhealthy_dependency_gates_the_task() {
        let (scheduler, _env) = scheduler(config());
        let parent_failing = Arc::new(AtomicBool::new(true));
        let parent_calls = Arc::new(Mutex::new(Vec::new()));
        let child_calls = Arc::new(Mutex::new(Vec::new()));

        scheduler.add_task(
            PollTask::new("session", recording(parent_failing.clone(), parent_calls.clone()))
                .interval(Duration::from_millis(1_000)),
        );
        scheduler.add_task(
            PollTask::new("orders", recording(Arc::new(AtomicBool::new(false)), child_calls.clone()))
                .interval(Duration::from_millis(1_000))
                .depends_on("session"),
        );

        tokio::time::sleep(Duration::from_millis(4_000)).await;
        assert!(!parent_calls.lock().unwrap().is_empty());
        assert!(child_calls.lock().unwrap().is_empty());

        parent_failing.store(false, Ordering::SeqCst);
        scheduler.run_now("session");
        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert!(!child_calls.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn should_poll_false_skips_without_fetching() {
        let (scheduler, _env) = scheduler(config());
        let calls = Arc::new(Mutex::new(Vec::new()));
        scheduler.add_task(
            PollTask::new("feed", recording(Arc::new(AtomicBool::new(false)), calls.clone()))
                .interval(Duration::from_millis(1_000))
                .should_poll(|| false),
        );

        tokio::time::sleep(Duration::from_millis(5_500)).await;
        assert!(calls.lock().unwrap().is_empty());
        let status = scheduler.task_status("feed").unwrap();
        assert_eq!(status.phase, TaskPhase::Scheduled);
        assert_eq!(status.next_delay_ms, Some(1_000));
    }

    #[tokio::test(start_paused = true)]
    async fn background_pauses_and_network_up_resets_retries() {
        let (scheduler, env) = scheduler(config());
        let failing = Arc::new(AtomicBool::new(true));
        let calls = Arc::new(Mutex::new(Vec::new()));
        scheduler.add_task(
            PollTask::new("orders", recording(failing.clone(), calls.clone()))
                .interval(Duration::from_millis(1_000)),
        );

        tokio::time::sleep(Duration::from_millis(2_600)).await;
        assert_eq!(calls.lock().unwrap().len(), 2);

        env.set_foreground(false);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(calls.lock().unwrap().len(), 2);
        assert_eq!(scheduler.task_status("orders").unwrap().phase, TaskPhase::Paused);

        env.set_network_up(false);
        env.set_foreground(true);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(calls.lock().unwrap().len(), 2);

        env.set_network_up(true);
        tokio::time::sleep(Duration::from_millis(10)).await;
        let status = scheduler.task_status("orders").unwrap();
        assert_eq!(status.retry_count, 0);
        assert_eq!(status.current_interval_ms, 1_000);

        tokio::time::sleep(Duration::from_millis(1_000)).await;
        assert_eq!(calls.lock().unwrap().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn manual_pause_run_now_and_remove() {
        let (scheduler, _env) = scheduler(config());
        let calls = Arc::new(Mutex::new(Vec::new()));
        scheduler.add_task(
            PollTask::new("k", recording(Arc::new(AtomicBool::new(false)), calls.clone()))
                .interval(Duration::from_millis(1_000)),
        );

        assert!(scheduler.pause_task("k"));
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(calls.lock().unwrap().is_empty());
        assert!(scheduler.task_status("k").unwrap().paused);

        assert!(scheduler.run_now("k"));
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(calls.lock().unwrap().len(), 1);

        assert!(scheduler.resume_task("k"));
        tokio::time::sleep(Duration::from_millis(1_001)).await;
        assert_eq!(calls.lock().unwrap().len(), 2);

        assert!(scheduler.remove_task("k"));
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(calls.lock().unwrap().len(), 2);
        assert!(scheduler.task_status("k").is_none());
        assert!(!scheduler.run_now("k"));
    }

    #[test]
    fn priority_and_inactivity_scale_the_interval() {
        let cfg = PollingConfig::default();
        let base = Duration::from_secs(10);
        assert_eq!(effective_interval(base, Priority::High, false, &cfg), Duration::from_secs(5));
        assert_eq!(effective_interval(base, Priority::Low, false, &cfg), Duration::from_secs(20));
        assert_eq!(effective_interval(base, Priority::Low, true, &cfg), Duration::from_secs(40));
        assert_eq!(
            effective_interval(Duration::from_millis(200), Priority::High, false, &cfg),
            Duration::from_secs(1)
        );
        assert_eq!(
            effective_interval(Duration::from_secs(400), Priority::Normal, false, &cfg),
            Duration::from_secs(300)
        );
    }
}
