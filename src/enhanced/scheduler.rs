//! Scheduler
//!
//! Admits caller-supplied executors under a global concurrency bound, per
//! category rate windows and the circuit breaker, in priority order, and
//! retries failed attempts with backoff.
//!
//! ## Admission
//!
//! A background driver task runs one admission pass whenever something may
//! have changed: a request was enqueued, a slot was freed, work was
//! cancelled, or the earliest pending deadline passed (pause end, retry ready
//! time, breaker recovery, queue timeout). Each pass:
//!
//! 1. promotes delayed retries whose backoff has elapsed,
//! 2. rejects requests that have been ready longer than their queue timeout,
//! 3. admits head-of-queue requests while a slot is free, subject to the
//!    global pause, the circuit breaker and the head request's category
//!    window. A throttled head blocks admission instead of being skipped.
//!
//! All state lives behind one `parking_lot` mutex that is never held across
//! an `.await`; the only suspension point is the executor itself, which runs
//! on its own task.
//!
//! ## Usage
//!
//! ```no_run
//! use tokio_upstream_orchestrator::config::OrchestratorConfig;
//! use tokio_upstream_orchestrator::enhanced::{EnqueueOptions, Priority, Scheduler};
//! use tokio_upstream_orchestrator::{RequestDescriptor, UpstreamError};
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let scheduler = Scheduler::new(&OrchestratorConfig::default())?;
//! let descriptor = RequestDescriptor::get("/items/42");
//!
//! let body = scheduler
//!     .enqueue(&descriptor, EnqueueOptions::priority(Priority::High), || async {
//!         Ok::<_, UpstreamError>("payload".to_string())
//!     })
//!     .await?;
//! # let _ = body;
//! # Ok(()) }
//! ```

use crate::config::{validation, OrchestratorConfig};
use crate::enhanced::backpressure::{
    Backpressure, BackpressureSettings, BackpressureStats, ThrottleDecision,
};
use crate::enhanced::circuit_breaker::{Admission, CircuitBreaker, CircuitBreakerStats};
use crate::enhanced::priority::{Priority, PriorityQueue};
use crate::enhanced::rate_limit::{RateLimitInfo, RateWindows};
use crate::enhanced::retry::RetryPolicy;
use crate::error::{ErrorClass, SchedulerError, UpstreamError};
use crate::metrics;
use crate::request::{Method, RequestDescriptor};
use crate::OrchestratorError;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Per-request overrides.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnqueueOptions {
    /// Admission priority. Demoted by one level on each retry.
    pub priority: Priority,
    /// Retry budget; the configured default when `None`.
    pub max_retries: Option<u32>,
    /// Queue timeout; the configured default when `None`.
    pub timeout: Option<Duration>,
}

impl EnqueueOptions {
    /// Options with only a priority set.
    pub fn priority(priority: Priority) -> Self {
        Self {
            priority,
            ..Self::default()
        }
    }

    /// Override the retry budget.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Override the queue timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Type-erased unit of work. Settles its caller exactly once: `run` delivers
/// the value on success, `fail` delivers a terminal error.
trait Job: Send {
    fn run(&mut self) -> BoxFuture<'_, Result<(), UpstreamError>>;
    fn fail(&mut self, error: SchedulerError);
    fn is_closed(&self) -> bool;
}

struct ExecutorJob<T, F> {
    executor: F,
    reply: Option<oneshot::Sender<Result<T, SchedulerError>>>,
}

impl<T, F, Fut> Job for ExecutorJob<T, F>
where
    T: Send + 'static,
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, UpstreamError>> + Send + 'static,
{
    fn run(&mut self) -> BoxFuture<'_, Result<(), UpstreamError>> {
        let call = (self.executor)();
        Box::pin(async move {
            let value = call.await?;
            if let Some(reply) = self.reply.take() {
                let _ = reply.send(Ok(value));
            }
            Ok(())
        })
    }

    fn fail(&mut self, error: SchedulerError) {
        if let Some(reply) = self.reply.take() {
            let _ = reply.send(Err(error));
        }
    }

    fn is_closed(&self) -> bool {
        self.reply.as_ref().map_or(true, |r| r.is_closed())
    }
}

struct QueuedRequest {
    id: u64,
    method: Method,
    url: String,
    category: String,
    priority: Priority,
    retry_count: u32,
    max_retries: u32,
    queue_timeout: Duration,
    ready_at: Instant,
    job: Box<dyn Job>,
}

struct InFlight {
    url: String,
    cancel: Option<oneshot::Sender<SchedulerError>>,
}

enum Outcome {
    Finished(Result<(), UpstreamError>),
    Aborted(SchedulerError),
}

#[derive(Debug, Default)]
struct Counters {
    enqueued: u64,
    admitted: u64,
    completed: u64,
    failed: u64,
    retried: u64,
    timed_out: u64,
    cancelled: u64,
    circuit_rejections: u64,
    total_wait: Duration,
}

struct State {
    queue: PriorityQueue<QueuedRequest>,
    delayed: Vec<QueuedRequest>,
    processing: HashMap<u64, InFlight>,
    windows: RateWindows,
    backpressure: Backpressure,
    counters: Counters,
    next_id: u64,
    shutting_down: bool,
}

#[derive(Debug, Clone)]
struct Settings {
    max_concurrent: usize,
    max_queue: usize,
    queue_timeout: Duration,
    sweep_interval: Duration,
    execution_timeout: Option<Duration>,
}

struct Shared {
    state: Mutex<State>,
    wake: Notify,
    breaker: CircuitBreaker,
    retry: RetryPolicy,
    settings: Settings,
}

/// Priority admission scheduler.
///
/// Dropping the scheduler shuts it down: outstanding work is rejected with
/// [`SchedulerError::ShuttingDown`].
pub struct Scheduler {
    shared: Arc<Shared>,
    driver: JoinHandle<()>,
}

/// Snapshot of scheduler state and counters.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SchedulerMetrics {
    /// Ready requests waiting for admission.
    pub queued: usize,
    /// Ready requests by priority.
    pub queued_by_priority: BTreeMap<Priority, usize>,
    /// Retries waiting out their backoff.
    pub delayed: usize,
    /// Executors currently running.
    pub processing: usize,
    /// Requests accepted since construction.
    pub enqueued: u64,
    /// Requests settled successfully.
    pub completed: u64,
    /// Requests rejected after a non-retryable failure or exhausted retries.
    pub failed: u64,
    /// Retries scheduled.
    pub retried: u64,
    /// Requests rejected by the queue timeout.
    pub timed_out: u64,
    /// Requests cancelled, including abandoned ones.
    pub cancelled: u64,
    /// Requests failed fast by an open circuit.
    pub circuit_rejections: u64,
    /// Pause and throttle counters.
    pub backpressure: BackpressureStats,
    /// Remaining global pause, if any.
    pub paused_for: Option<Duration>,
    /// Circuit breaker snapshot.
    pub circuit: CircuitBreakerStats,
    /// Rate-window usage per category.
    pub categories: BTreeMap<String, RateLimitInfo>,
    /// Mean time admitted requests spent ready in the queue.
    pub average_queue_wait: Duration,
}

impl Scheduler {
    /// Build a scheduler and start its driver task.
    ///
    /// # Errors
    ///
    /// - [`OrchestratorError::ConfigError`] if `config` fails validation.
    /// - [`OrchestratorError::Other`] if called outside a Tokio runtime.
    pub fn new(config: &OrchestratorConfig) -> Result<Self, OrchestratorError> {
        validation::validate(config).map_err(|errors| {
            OrchestratorError::ConfigError(
                errors
                    .iter()
                    .map(|e| e.to_string())
                    .collect::<Vec<_>>()
                    .join("; "),
            )
        })?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| OrchestratorError::Other(format!("scheduler needs a tokio runtime: {e}")))?;

        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                queue: PriorityQueue::new(),
                delayed: Vec::new(),
                processing: HashMap::new(),
                windows: RateWindows::from_config(
                    &config.categories,
                    &config.scheduler.default_category,
                ),
                backpressure: Backpressure::new(BackpressureSettings::from_config(
                    &config.backpressure,
                )),
                counters: Counters::default(),
                next_id: 0,
                shutting_down: false,
            }),
            wake: Notify::new(),
            breaker: CircuitBreaker::from_config(&config.circuit_breaker),
            retry: RetryPolicy::from_config(&config.retry),
            settings: Settings {
                max_concurrent: config.scheduler.max_concurrent,
                max_queue: config.scheduler.max_queue,
                queue_timeout: config.scheduler.queue_timeout(),
                sweep_interval: config.scheduler.sweep_interval(),
                execution_timeout: config.scheduler.execution_timeout(),
            },
        });

        let driver = runtime.spawn(drive(Arc::clone(&shared)));
        info!(
            max_concurrent = config.scheduler.max_concurrent,
            categories = config.categories.len(),
            "scheduler started"
        );
        Ok(Self { shared, driver })
    }

    /// Queue `executor` and return a future for its terminal outcome.
    ///
    /// The request joins the queue when this is called, so admission order
    /// among equal priorities is call order. The executor may be invoked
    /// more than once (retries). Dropping the returned future abandons the
    /// request; if it has not been admitted yet it never runs.
    ///
    /// # Errors
    ///
    /// Any [`SchedulerError`]; retries are invisible until exhausted.
    pub fn enqueue<T, F, Fut>(
        &self,
        descriptor: &RequestDescriptor,
        options: EnqueueOptions,
        executor: F,
    ) -> impl Future<Output = Result<T, SchedulerError>> + Send + 'static
    where
        T: Send + 'static,
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, UpstreamError>> + Send + 'static,
    {
        let (reply, outcome) = oneshot::channel();
        let job = ExecutorJob {
            executor,
            reply: Some(reply),
        };
        let submitted = self.shared.submit(descriptor, options, Box::new(job));
        async move {
            submitted?;
            outcome.await.unwrap_or(Err(SchedulerError::Cancelled))
        }
    }

    /// Cancel every queued, delayed and in-flight request. Returns how many.
    pub fn cancel_all(&self) -> usize {
        self.shared.cancel_where(|_| true, SchedulerError::Cancelled)
    }

    /// Cancel every request whose url contains `url_pattern`. Returns how many.
    pub fn cancel(&self, url_pattern: &str) -> usize {
        self.shared
            .cancel_where(|url| url.contains(url_pattern), SchedulerError::Cancelled)
    }

    /// Reject all outstanding work with [`SchedulerError::ShuttingDown`] and
    /// stop admitting. Later enqueues fail immediately.
    pub fn shutdown(&self) {
        let rejected = {
            let mut state = self.shared.state.lock();
            if state.shutting_down {
                return;
            }
            state.shutting_down = true;
            drop(state);
            self.shared
                .cancel_where(|_| true, SchedulerError::ShuttingDown)
        };
        self.shared.wake.notify_one();
        info!(rejected = rejected, "scheduler shut down");
    }

    /// The breaker guarding the upstream.
    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.shared.breaker
    }

    /// Current state and counters.
    pub fn metrics(&self) -> SchedulerMetrics {
        let now = Instant::now();
        let mut guard = self.shared.state.lock();
        let state = &mut *guard;
        let counters = &state.counters;
        let average_queue_wait = if counters.admitted == 0 {
            Duration::ZERO
        } else {
            counters.total_wait / counters.admitted.min(u32::MAX as u64) as u32
        };

        SchedulerMetrics {
            queued: state.queue.len(),
            queued_by_priority: state.queue.counts().into_iter().collect(),
            delayed: state.delayed.len(),
            processing: state.processing.len(),
            enqueued: counters.enqueued,
            completed: counters.completed,
            failed: counters.failed,
            retried: counters.retried,
            timed_out: counters.timed_out,
            cancelled: counters.cancelled,
            circuit_rejections: counters.circuit_rejections,
            backpressure: state.backpressure.stats(),
            paused_for: state
                .backpressure
                .paused_until(now)
                .map(|until| until.saturating_duration_since(now)),
            circuit: self.shared.breaker.stats(),
            categories: state.windows.usage_all(now),
            average_queue_wait,
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
        self.driver.abort();
    }
}

async fn drive(shared: Arc<Shared>) {
    while let Some(next) = shared.pump(Instant::now()) {
        tokio::select! {
            _ = shared.wake.notified() => {}
            _ = tokio::time::sleep_until(next) => {}
        }
    }
    debug!("scheduler driver stopped");
}

async fn attempt(job: &mut dyn Job, limit: Option<Duration>) -> Result<(), UpstreamError> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, job.run())
            .await
            .unwrap_or(Err(UpstreamError::Timeout)),
        None => job.run().await,
    }
}

impl Shared {
    fn submit(
        &self,
        descriptor: &RequestDescriptor,
        options: EnqueueOptions,
        job: Box<dyn Job>,
    ) -> Result<(), SchedulerError> {
        let mut state = self.state.lock();
        if state.shutting_down {
            return Err(SchedulerError::ShuttingDown);
        }
        if state.queue.len() + state.delayed.len() >= self.settings.max_queue {
            warn!(
                capacity = self.settings.max_queue,
                url = %descriptor.url,
                "scheduler queue full, rejecting"
            );
            return Err(SchedulerError::QueueFull {
                capacity: self.settings.max_queue,
            });
        }

        state.next_id += 1;
        let id = state.next_id;
        let category = descriptor
            .category
            .clone()
            .unwrap_or_else(|| state.windows.classify(&descriptor.url));
        let request = QueuedRequest {
            id,
            method: descriptor.method,
            url: descriptor.url.clone(),
            category,
            priority: options.priority,
            retry_count: 0,
            max_retries: options.max_retries.unwrap_or(self.retry.max_retries),
            queue_timeout: options.timeout.unwrap_or(self.settings.queue_timeout),
            ready_at: Instant::now(),
            job,
        };
        debug!(
            id = id,
            method = %request.method,
            url = %request.url,
            category = %request.category,
            priority = %request.priority,
            "request enqueued"
        );
        state.queue.push(request.priority, request);
        state.counters.enqueued += 1;
        drop(state);

        self.wake.notify_one();
        Ok(())
    }

    /// One admission pass. Returns when to run the next one, or `None` once
    /// shut down.
    fn pump(self: &Arc<Self>, now: Instant) -> Option<Instant> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.shutting_down {
            return None;
        }

        Self::promote_delayed(state, now);
        Self::sweep_queue(state, now);
        self.admit(state, now);

        metrics::set_queue_depth("queued", state.queue.len() as i64);
        metrics::set_queue_depth("delayed", state.delayed.len() as i64);
        metrics::set_queue_depth("processing", state.processing.len() as i64);

        Some(self.next_wake(state, now))
    }

    fn promote_delayed(state: &mut State, now: Instant) {
        if state.delayed.is_empty() {
            return;
        }
        let (mut ready, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut state.delayed)
            .into_iter()
            .partition(|r| r.ready_at <= now);
        state.delayed = waiting;
        ready.sort_by_key(|r| (r.ready_at, r.id));
        for request in ready {
            debug!(
                id = request.id,
                retry = request.retry_count,
                priority = %request.priority,
                "retry ready"
            );
            state.queue.push(request.priority, request);
        }
    }

    fn sweep_queue(state: &mut State, now: Instant) {
        for mut request in state.queue.drain_where(|r| r.job.is_closed()) {
            request.job.fail(SchedulerError::Cancelled);
            state.counters.cancelled += 1;
            metrics::inc_request("cancelled");
        }

        let expired = state
            .queue
            .drain_where(|r| now.saturating_duration_since(r.ready_at) >= r.queue_timeout);
        for mut request in expired {
            let waited = now.saturating_duration_since(request.ready_at);
            warn!(
                id = request.id,
                url = %request.url,
                waited_ms = waited.as_millis() as u64,
                "request timed out in queue"
            );
            request.job.fail(SchedulerError::QueueTimeout { waited });
            state.counters.timed_out += 1;
            metrics::inc_request("timed_out");
        }
    }

    fn admit(self: &Arc<Self>, state: &mut State, now: Instant) {
        while state.processing.len() < self.settings.max_concurrent {
            let Some(category) = state.queue.peek().map(|(_, r)| r.category.clone()) else {
                break;
            };
            if state.backpressure.paused_until(now).is_some() {
                break;
            }

            let trial = match self.breaker.try_acquire() {
                Admission::Allowed => false,
                Admission::Trial => true,
                Admission::TrialsExhausted => break,
                Admission::Rejected => {
                    if let Some((_, mut request)) = state.queue.pop() {
                        warn!(
                            id = request.id,
                            url = %request.url,
                            "circuit open, failing request fast"
                        );
                        request.job.fail(SchedulerError::CircuitOpen);
                        state.counters.circuit_rejections += 1;
                        metrics::inc_request("circuit_open");
                    }
                    state.backpressure.circuit_open(now);
                    metrics::inc_backpressure("circuit_open");
                    continue;
                }
            };

            if let Err(throttle) = state.windows.check(&category, now) {
                if trial {
                    self.breaker.release_trial();
                }
                match state.backpressure.throttled(now, throttle.wait) {
                    ThrottleDecision::Pause(pause) => {
                        debug!(
                            category = %category,
                            reason = ?throttle.reason,
                            pause_ms = pause.as_millis() as u64,
                            "category throttled"
                        );
                        metrics::inc_backpressure("preventive");
                    }
                    ThrottleDecision::EmergencyReset(_) => {
                        state.windows.reset_all();
                        metrics::inc_backpressure("emergency");
                    }
                }
                break;
            }

            let Some((_, request)) = state.queue.pop() else {
                if trial {
                    self.breaker.release_trial();
                }
                break;
            };
            state.windows.record(&category, now);
            state.backpressure.admitted();
            self.start(state, request, trial, now);
        }
    }

    fn start(self: &Arc<Self>, state: &mut State, mut request: QueuedRequest, trial: bool, now: Instant) {
        let wait = now.saturating_duration_since(request.ready_at);
        state.counters.admitted += 1;
        state.counters.total_wait += wait;
        metrics::record_queue_wait(wait);

        let (cancel, cancelled) = oneshot::channel();
        state.processing.insert(
            request.id,
            InFlight {
                url: request.url.clone(),
                cancel: Some(cancel),
            },
        );
        debug!(
            id = request.id,
            url = %request.url,
            category = %request.category,
            priority = %request.priority,
            retry = request.retry_count,
            trial = trial,
            wait_ms = wait.as_millis() as u64,
            "request admitted"
        );

        let shared = Arc::clone(self);
        let limit = self.settings.execution_timeout;
        tokio::spawn(async move {
            let outcome = tokio::select! {
                result = attempt(request.job.as_mut(), limit) => Outcome::Finished(result),
                reason = cancelled => Outcome::Aborted(reason.unwrap_or(SchedulerError::Cancelled)),
            };
            shared.settle(request, trial, outcome);
        });
    }

    fn settle(&self, mut request: QueuedRequest, trial: bool, outcome: Outcome) {
        let now = Instant::now();
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let aborted = state
                .processing
                .remove(&request.id)
                .map_or(true, |flight| flight.cancel.is_none());
            let abort_reason = if state.shutting_down {
                SchedulerError::ShuttingDown
            } else {
                SchedulerError::Cancelled
            };

            match outcome {
                Outcome::Finished(Ok(())) => {
                    self.breaker.record_success(trial);
                    state.windows.recover(&request.category);
                    state.backpressure.succeeded();
                    state.counters.completed += 1;
                    metrics::inc_request("completed");
                    debug!(id = request.id, url = %request.url, "request completed");
                }
                Outcome::Finished(Err(_)) if aborted => {
                    if trial {
                        self.breaker.release_trial();
                    }
                    request.job.fail(abort_reason);
                    state.counters.cancelled += 1;
                    metrics::inc_request("cancelled");
                }
                Outcome::Finished(Err(error)) => self.handle_failure(state, request, trial, error, now),
                Outcome::Aborted(reason) => {
                    if trial {
                        self.breaker.release_trial();
                    }
                    debug!(id = request.id, url = %request.url, reason = %reason, "in-flight request aborted");
                    request.job.fail(reason);
                    state.counters.cancelled += 1;
                    metrics::inc_request("cancelled");
                }
            }
        }
        self.wake.notify_one();
    }

    fn handle_failure(
        &self,
        state: &mut State,
        mut request: QueuedRequest,
        trial: bool,
        error: UpstreamError,
        now: Instant,
    ) {
        let class = error.class();
        match &error {
            UpstreamError::RateLimited { retry_after } => {
                self.breaker.record_failure(trial);
                state.windows.shrink(&request.category);
                state.backpressure.rate_limited(now, *retry_after);
                metrics::inc_backpressure("rate_limit");
            }
            UpstreamError::Client { .. } => {
                if trial {
                    self.breaker.release_trial();
                }
            }
            _ => self.breaker.record_failure(trial),
        }

        let next_retry = request.retry_count + 1;
        if class != ErrorClass::Client && next_retry <= request.max_retries && !state.shutting_down {
            let delay = self.retry.delay(next_retry);
            request.retry_count = next_retry;
            request.priority = request.priority.demote();
            request.ready_at = now + delay;
            info!(
                id = request.id,
                url = %request.url,
                error = %error,
                retry = next_retry,
                max_retries = request.max_retries,
                delay_ms = delay.as_millis() as u64,
                priority = %request.priority,
                "scheduling retry"
            );
            state.counters.retried += 1;
            metrics::inc_retry(match class {
                ErrorClass::RateLimited => "rate_limited",
                _ => "transient",
            });
            state.delayed.push(request);
        } else {
            warn!(
                id = request.id,
                url = %request.url,
                error = %error,
                attempts = next_retry,
                "request failed"
            );
            request.job.fail(SchedulerError::exhausted(error, next_retry));
            state.counters.failed += 1;
            metrics::inc_request("failed");
        }
    }

    fn cancel_where<P>(&self, matches: P, reason: SchedulerError) -> usize
    where
        P: Fn(&str) -> bool,
    {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let mut settled = 0;

        for mut request in state.queue.drain_where(|r| matches(&r.url)) {
            request.job.fail(reason.clone());
            settled += 1;
        }
        let (hit, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut state.delayed)
            .into_iter()
            .partition(|r| matches(&r.url));
        state.delayed = kept;
        for mut request in hit {
            request.job.fail(reason.clone());
            settled += 1;
        }
        state.counters.cancelled += settled as u64;

        // In-flight work is settled by its own task once it observes the signal.
        let mut aborted = 0;
        for flight in state.processing.values_mut() {
            if matches(&flight.url) {
                if let Some(cancel) = flight.cancel.take() {
                    let _ = cancel.send(reason.clone());
                    aborted += 1;
                }
            }
        }
        drop(guard);

        if settled + aborted > 0 {
            info!(queued = settled, in_flight = aborted, reason = %reason, "requests cancelled");
            self.wake.notify_one();
        }
        settled + aborted
    }

    fn next_wake(&self, state: &State, now: Instant) -> Instant {
        let mut next = now
            .checked_add(self.settings.sweep_interval)
            .unwrap_or(now + Duration::from_secs(1));
        if let Some(until) = state.backpressure.paused_until(now) {
            next = next.min(until);
        }
        for request in &state.delayed {
            next = next.min(request.ready_at);
        }
        for (_, request) in state.queue.iter() {
            if let Some(deadline) = request.ready_at.checked_add(request.queue_timeout) {
                next = next.min(deadline);
            }
        }
        if !state.queue.is_empty() {
            if let Some(recovery) = self.breaker.recovery_deadline() {
                next = next.min(recovery);
            }
        }
        next.max(now + Duration::from_millis(1))
    }
}
