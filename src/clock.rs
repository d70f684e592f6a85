//! Delayed-callback scheduling.
//!
//! Bots never sleep. Starting an order arms a timer through a [`Clock`], and the
//! dispatcher is re-entered from the timer's callback once it fires. Two clocks
//! are provided:
//!
//! - [`TokioClock`]: one spawned task per timer, racing `tokio::time::sleep`
//!   against a [`CancellationToken`].
//! - [`VirtualClock`]: time only moves when [`VirtualClock::advance`] is called.
//!   Used by tests, the scripted demo and the benchmarks.
//!
//! Implementations must not hold their own locks while running a callback: the
//! callback takes the dispatcher lock, and the dispatcher calls back into the
//! clock while holding it.

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub type TimerCallback = Box<dyn FnOnce() + Send + 'static>;

/// Handle to an armed timer, used to cancel it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerToken(u64);

impl fmt::Display for TimerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer-{}", self.0)
    }
}

pub trait Clock: Send + Sync {
    /// Runs `callback` once `delay` has elapsed, unless cancelled first.
    fn after(&self, delay: Duration, callback: TimerCallback) -> TimerToken;

    /// Cancels a pending timer. Returns `false` if it already fired or was
    /// already cancelled; in that case the callback may still be running or
    /// about to run.
    fn cancel(&self, token: TimerToken) -> bool;
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Wall-clock timers on a Tokio runtime.
pub struct TokioClock {
    handle: Handle,
    next_token: AtomicU64,
    timers: Arc<Mutex<HashMap<TimerToken, CancellationToken>>>,
}

impl TokioClock {
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            next_token: AtomicU64::new(1),
            timers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Binds to the runtime of the calling task. Panics outside a Tokio runtime.
    pub fn current() -> Self {
        Self::new(Handle::current())
    }

    /// Timers armed and neither fired nor cancelled.
    pub fn pending(&self) -> usize {
        lock(&self.timers).len()
    }
}

impl Clock for TokioClock {
    fn after(&self, delay: Duration, callback: TimerCallback) -> TimerToken {
        let token = TimerToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        let cancel = CancellationToken::new();
        lock(&self.timers).insert(token, cancel.clone());

        let timers = Arc::clone(&self.timers);
        self.handle.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(%token, "timer cancelled");
                }
                _ = tokio::time::sleep(delay) => {
                    // whoever removes the entry first decides: fire or cancel
                    let armed = lock(&timers).remove(&token).is_some();
                    if armed {
                        callback();
                    }
                }
            }
        });
        token
    }

    fn cancel(&self, token: TimerToken) -> bool {
        match lock(&self.timers).remove(&token) {
            Some(cancel) => {
                cancel.cancel();
                true
            }
            None => false,
        }
    }
}

/// Manually driven clock. Time starts at zero.
#[derive(Default)]
pub struct VirtualClock {
    inner: Mutex<VirtualState>,
}

#[derive(Default)]
struct VirtualState {
    now: Duration,
    next_token: u64,
    queue: BTreeMap<(Duration, TimerToken), TimerCallback>,
    deadlines: HashMap<TimerToken, Duration>,
}

impl VirtualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now(&self) -> Duration {
        lock(&self.inner).now
    }

    pub fn pending(&self) -> usize {
        lock(&self.inner).deadlines.len()
    }

    /// Deadline of the earliest armed timer.
    pub fn next_deadline(&self) -> Option<Duration> {
        lock(&self.inner).queue.keys().next().map(|(at, _)| *at)
    }

    /// Moves time forward by `by`, firing every timer that falls due in
    /// deadline order (timers armed by those callbacks included). Returns the
    /// number of callbacks run.
    pub fn advance(&self, by: Duration) -> usize {
        let target = lock(&self.inner).now.saturating_add(by);
        let mut fired = 0;
        loop {
            let due = {
                let mut state = lock(&self.inner);
                match state.queue.keys().next().copied() {
                    Some(key) if key.0 <= target => {
                        state.now = key.0;
                        state.deadlines.remove(&key.1);
                        state.queue.remove(&key)
                    }
                    _ => {
                        state.now = target;
                        None
                    }
                }
            };
            match due {
                Some(callback) => {
                    callback();
                    fired += 1;
                }
                None => break,
            }
        }
        fired
    }

    /// Advances straight through every armed timer, including ones armed along
    /// the way, until nothing is pending. Returns the number of callbacks run.
    pub fn run_until_idle(&self) -> usize {
        let mut fired = 0;
        while let Some(deadline) = self.next_deadline() {
            let by = deadline.saturating_sub(self.now());
            fired += self.advance(by);
        }
        fired
    }
}

impl Clock for VirtualClock {
    fn after(&self, delay: Duration, callback: TimerCallback) -> TimerToken {
        let mut state = lock(&self.inner);
        state.next_token += 1;
        let token = TimerToken(state.next_token);
        // far-future deadlines saturate instead of overflowing
        let at = state.now.saturating_add(delay);
        state.deadlines.insert(token, at);
        state.queue.insert((at, token), callback);
        token
    }

    fn cancel(&self, token: TimerToken) -> bool {
        let mut state = lock(&self.inner);
        match state.deadlines.remove(&token) {
            Some(at) => state.queue.remove(&(at, token)).is_some(),
            None => false,
        }
    }
}
