//! Watchdog preemption for running scripts.
//!
//! A [`Watchdog`] owns a registry of the executions currently running under a time or memory
//! ceiling and a background thread that polls them. When an execution goes over one of its
//! limits the thread marks the entry as killed and raises the interrupt flag of the engine
//! running it; the engine notices at its next interrupt check and unwinds with an uncatchable
//! error. The context that started the execution then sees the fatal abort marker and reports
//! [`Error::ResourceLimitExceeded`](crate::Error::ResourceLimitExceeded).
//!
//! # Lifecycle
//!
//! The thread is only started once an execution asks for a nonzero limit. After that it stays
//! alive, idling on a condition variable while no limited execution is registered.
//!
//! Contexts use [`Watchdog::global`] unless one is injected with
//! [`ContextBuilder::with_watchdog`](crate::ContextBuilder::with_watchdog). A private watchdog
//! stops and joins its thread when dropped.
//!
//! # Configuration
//!
//! The poll interval of the process-wide watchdog can be configured via environment variable:
//!
//! ```bash
//! export JSBRIDGE_WATCHDOG_POLL_MS=5  # Default is 10
//! ```

pub(crate) mod signals;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, LazyLock, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{Level, instrument};

use self::signals::EngineSignals;
use crate::context::ContextId;
use crate::error::LimitKind;
use crate::metrics::{METRIC_LIMIT_TYPE_LABEL, METRIC_WATCHDOG_TERMINATIONS};

/// Environment variable to configure the poll interval of the process-wide watchdog.
pub const ENV_WATCHDOG_POLL_MS: &str = "JSBRIDGE_WATCHDOG_POLL_MS";

/// Default poll interval.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

static GLOBAL_WATCHDOG: LazyLock<Arc<Watchdog>> = LazyLock::new(|| {
    let poll_interval = std::env::var(ENV_WATCHDOG_POLL_MS)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .filter(|&ms| ms > 0)
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_POLL_INTERVAL);
    tracing::debug!(?poll_interval, "Initialized process-wide watchdog");
    Arc::new(Watchdog::with_poll_interval(poll_interval))
});

/// Record that the watchdog terminated an execution.
///
/// Emits the `watchdog_terminations_total` counter metric with the limit that fired as the
/// `limit_type` label, and logs a warning.
fn record_limit_exceeded(entry: &WatchdogEntry, kind: LimitKind) {
    metrics::counter!(
        METRIC_WATCHDOG_TERMINATIONS,
        METRIC_LIMIT_TYPE_LABEL => kind.as_str()
    )
    .increment(1);

    tracing::warn!(
        context = %entry.context,
        time_limit = ?entry.time_limit,
        memory_limit = ?entry.memory_limit,
        heap_used = entry.signals.heap_used(),
        "Watchdog {kind} limit exceeded, requesting execution termination"
    );
}

/// The ceilings applied to one execution.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct Limits {
    pub(crate) time: Option<Duration>,
    pub(crate) memory: Option<u64>,
}

impl Limits {
    pub(crate) fn is_unlimited(&self) -> bool {
        self.time.is_none() && self.memory.is_none()
    }
}

struct WatchdogEntry {
    token: u64,
    context: ContextId,
    signals: Arc<EngineSignals>,
    time_limit: Option<Duration>,
    memory_limit: Option<u64>,
    deadline: Option<Instant>,
    killed: bool,
    live: bool,
}

impl WatchdogEntry {
    fn is_armed(&self) -> bool {
        self.live && !self.killed && (self.deadline.is_some() || self.memory_limit.is_some())
    }

    fn check(&self, now: Instant) -> Option<LimitKind> {
        if self.deadline.is_some_and(|deadline| now >= deadline) {
            return Some(LimitKind::Time);
        }
        if let Some(limit) = self.memory_limit
            && self.signals.heap_used() as u64 > limit
        {
            return Some(LimitKind::Memory);
        }
        None
    }
}

#[derive(Default)]
struct RegistryState {
    entries: Vec<WatchdogEntry>,
    next_token: u64,
    shutdown: bool,
}

impl RegistryState {
    // linear scan, at most one live entry per context
    fn live_entry(&mut self, context: ContextId) -> Option<&mut WatchdogEntry> {
        self.entries
            .iter_mut()
            .find(|e| e.context == context && e.live && !e.killed)
    }
}

#[derive(Default)]
struct Registry {
    state: Mutex<RegistryState>,
    wakeup: Condvar,
    running: AtomicBool,
}

impl Registry {
    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn deregister(&self, token: u64) {
        let mut state = self.lock();
        for entry in state.entries.iter_mut().filter(|e| e.token == token) {
            entry.live = false;
        }
        state.entries.retain(|e| e.live);
    }
}

/// The watchdog thread body.
fn monitor(registry: Arc<Registry>, poll_interval: Duration) {
    let mut state = registry.lock();
    loop {
        if state.shutdown {
            break;
        }

        if !state.entries.iter().any(WatchdogEntry::is_armed) {
            state = registry
                .wakeup
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
            continue;
        }

        let now = Instant::now();
        for entry in state.entries.iter_mut().filter(|e| e.is_armed()) {
            if let Some(kind) = entry.check(now) {
                entry.killed = true;
                entry.signals.terminate(kind);
                record_limit_exceeded(entry, kind);
            }
        }

        state = match registry.wakeup.wait_timeout(state, poll_interval) {
            Ok((state, _)) => state,
            Err(poisoned) => poisoned.into_inner().0,
        };
    }
    registry.running.store(false, Ordering::Release);
}

/// A background monitor enforcing time and memory ceilings on running scripts.
pub struct Watchdog {
    registry: Arc<Registry>,
    poll_interval: Duration,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Watchdog {
    /// Create a watchdog with the default poll interval.
    pub fn new() -> Self {
        Self::with_poll_interval(DEFAULT_POLL_INTERVAL)
    }

    /// Create a watchdog that checks its registry every `poll_interval`.
    pub fn with_poll_interval(poll_interval: Duration) -> Self {
        Self {
            registry: Arc::default(),
            poll_interval: poll_interval.max(Duration::from_millis(1)),
            thread: Mutex::new(None),
        }
    }

    /// The process-wide watchdog shared by every context that was not given its own.
    pub fn global() -> Arc<Watchdog> {
        GLOBAL_WATCHDOG.clone()
    }

    /// How often the registry is checked.
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Whether the monitor thread has been started.
    pub fn is_running(&self) -> bool {
        self.registry.running.load(Ordering::Acquire)
    }

    /// Number of executions currently registered.
    pub fn active_executions(&self) -> usize {
        self.registry.lock().entries.len()
    }

    /// Register an execution. The entry is removed when the returned guard is dropped.
    #[instrument(skip_all, level = Level::DEBUG)]
    pub(crate) fn register(
        &self,
        context: ContextId,
        signals: Arc<EngineSignals>,
        limits: Limits,
    ) -> Registration {
        let token = {
            let mut state = self.registry.lock();
            let token = state.next_token;
            state.next_token += 1;
            state.entries.push(WatchdogEntry {
                token,
                context,
                signals,
                time_limit: limits.time,
                memory_limit: limits.memory,
                deadline: limits.time.map(|limit| Instant::now() + limit),
                killed: false,
                live: true,
            });
            token
        };

        if !limits.is_unlimited() {
            self.ensure_running();
        }
        self.registry.wakeup.notify_all();

        Registration {
            registry: self.registry.clone(),
            token,
        }
    }

    /// Update the time limit of the live execution of `context`, restarting its deadline from now.
    ///
    /// Returns false if `context` has no live execution.
    pub(crate) fn update_time_limit(&self, context: ContextId, limit: Option<Duration>) -> bool {
        let updated = {
            let mut state = self.registry.lock();
            match state.live_entry(context) {
                Some(entry) => {
                    entry.time_limit = limit;
                    entry.deadline = limit.map(|limit| Instant::now() + limit);
                    true
                }
                None => false,
            }
        };
        if updated {
            self.registry.wakeup.notify_all();
        }
        updated
    }

    /// Update the memory limit of the live execution of `context`.
    ///
    /// Returns false if `context` has no live execution.
    pub(crate) fn update_memory_limit(&self, context: ContextId, limit: Option<u64>) -> bool {
        let updated = {
            let mut state = self.registry.lock();
            match state.live_entry(context) {
                Some(entry) => {
                    entry.memory_limit = limit;
                    true
                }
                None => false,
            }
        };
        if updated {
            self.registry.wakeup.notify_all();
        }
        updated
    }

    /// Start the monitor thread if it is not running yet.
    pub(crate) fn ensure_running(&self) {
        let mut thread = self.thread.lock().unwrap_or_else(PoisonError::into_inner);
        if thread.is_some() {
            return;
        }

        let registry = self.registry.clone();
        let poll_interval = self.poll_interval;
        self.registry.running.store(true, Ordering::Release);
        match std::thread::Builder::new()
            .name("jsbridge-watchdog".into())
            .spawn(move || monitor(registry, poll_interval))
        {
            Ok(handle) => {
                tracing::debug!(?poll_interval, "Started watchdog thread");
                *thread = Some(handle);
            }
            Err(e) => {
                self.registry.running.store(false, Ordering::Release);
                tracing::error!("Failed to start watchdog thread: {e}. Limits will not be enforced.");
            }
        }
    }
}

impl Default for Watchdog {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Watchdog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Watchdog")
            .field("poll_interval", &self.poll_interval)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.registry.lock().shutdown = true;
        self.registry.wakeup.notify_all();
        let thread = self
            .thread
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(thread) = thread
            && thread.join().is_err()
        {
            tracing::error!("Watchdog thread panicked");
        }
    }
}

/// Keeps an execution registered with a [`Watchdog`] until dropped.
pub(crate) struct Registration {
    registry: Arc<Registry>,
    token: u64,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.deregister(self.token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wait_for_abort(signals: &EngineSignals, timeout: Duration) -> Option<LimitKind> {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if let Some(kind) = signals.fatal_abort() {
                return Some(kind);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        None
    }

    #[test]
    fn kills_after_deadline() {
        let watchdog = Watchdog::with_poll_interval(Duration::from_millis(1));
        let signals = EngineSignals::new();
        let start = Instant::now();
        let _registration = watchdog.register(
            ContextId::next(),
            signals.clone(),
            Limits {
                time: Some(Duration::from_millis(20)),
                memory: None,
            },
        );
        assert!(watchdog.is_running());
        assert_eq!(
            wait_for_abort(&signals, Duration::from_secs(5)),
            Some(LimitKind::Time)
        );
        assert!(start.elapsed() >= Duration::from_millis(20));
        assert!(signals.should_interrupt());
    }

    #[test]
    fn kills_over_memory() {
        let watchdog = Watchdog::with_poll_interval(Duration::from_millis(1));
        let signals = EngineSignals::new();
        let _registration = watchdog.register(
            ContextId::next(),
            signals.clone(),
            Limits {
                time: None,
                memory: Some(100),
            },
        );
        assert_eq!(wait_for_abort(&signals, Duration::from_millis(50)), None);
        signals.record_alloc(1000);
        assert_eq!(
            wait_for_abort(&signals, Duration::from_secs(5)),
            Some(LimitKind::Memory)
        );
    }

    #[test]
    fn unlimited_executions_do_not_start_the_thread() {
        let watchdog = Watchdog::with_poll_interval(Duration::from_millis(1));
        let signals = EngineSignals::new();
        let registration = watchdog.register(ContextId::next(), signals, Limits::default());
        assert!(!watchdog.is_running());
        assert_eq!(watchdog.active_executions(), 1);
        drop(registration);
        assert_eq!(watchdog.active_executions(), 0);
    }

    #[test]
    fn live_entry_update() {
        let watchdog = Watchdog::with_poll_interval(Duration::from_millis(1));
        let signals = EngineSignals::new();
        let context = ContextId::next();

        assert!(!watchdog.update_time_limit(context, Some(Duration::from_millis(5))));

        let _registration = watchdog.register(context, signals.clone(), Limits::default());
        assert!(watchdog.update_time_limit(context, Some(Duration::from_millis(5))));
        assert!(!watchdog.update_time_limit(ContextId::next(), None));
        watchdog.ensure_running();

        assert_eq!(
            wait_for_abort(&signals, Duration::from_secs(5)),
            Some(LimitKind::Time)
        );
        // killed entries are no longer live
        assert!(!watchdog.update_memory_limit(context, Some(1)));
    }

    #[test]
    fn entries_are_checked_independently() {
        let watchdog = Watchdog::with_poll_interval(Duration::from_millis(1));
        let hungry = EngineSignals::new();
        let frugal = EngineSignals::new();
        let limits = Limits {
            time: None,
            memory: Some(500),
        };
        let _a = watchdog.register(ContextId::next(), hungry.clone(), limits);
        let _b = watchdog.register(ContextId::next(), frugal.clone(), limits);
        hungry.record_alloc(1000);
        frugal.record_alloc(400);
        assert_eq!(
            wait_for_abort(&hungry, Duration::from_secs(5)),
            Some(LimitKind::Memory)
        );
        assert_eq!(wait_for_abort(&frugal, Duration::from_millis(50)), None);
    }

    #[test]
    fn drop_joins_the_thread() {
        let watchdog = Watchdog::with_poll_interval(Duration::from_millis(1));
        watchdog.ensure_running();
        assert!(watchdog.is_running());
        drop(watchdog);
    }
}
