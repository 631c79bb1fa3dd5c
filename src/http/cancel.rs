//! Request cancellation
//!
//! A `CancelToken` carries an explicit cancel signal and an optional
//! deadline. Blocking waits inside the transport park on condition
//! variables; a token wakes them through registered callbacks when it is
//! cancelled, and bounds each wait by its deadline so expiry is noticed
//! without a timer thread.

use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

/// Why a token stopped the operation it guards
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cancelled {
    /// `CancelToken::cancel` was called
    Cancelled,
    /// The deadline passed
    DeadlineExceeded,
}

impl fmt::Display for Cancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cancelled::Cancelled => write!(f, "request cancelled"),
            Cancelled::DeadlineExceeded => write!(f, "deadline exceeded"),
        }
    }
}

type Watcher = Box<dyn Fn() + Send + Sync>;

struct State {
    cancelled: bool,
    next_id: u64,
    watchers: Vec<(u64, Arc<Watcher>)>,
}

struct Inner {
    deadline: Option<Instant>,
    state: Mutex<State>,
    cond: Condvar,
}

/// Cancellation signal with an optional deadline
///
/// Clones share the same signal.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl CancelToken {
    /// Create a token with no deadline
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Create a token that expires at `deadline`
    pub fn with_deadline(deadline: Instant) -> Self {
        Self::build(Some(deadline))
    }

    /// Create a token that expires after `timeout`
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::build(Some(Instant::now() + timeout))
    }

    fn build(deadline: Option<Instant>) -> Self {
        CancelToken {
            inner: Arc::new(Inner {
                deadline,
                state: Mutex::new(State {
                    cancelled: false,
                    next_id: 0,
                    watchers: Vec::new(),
                }),
                cond: Condvar::new(),
            }),
        }
    }

    /// Cancel every operation guarded by this token
    pub fn cancel(&self) {
        let watchers = {
            let mut state = lock(&self.inner.state);
            if state.cancelled {
                return;
            }
            state.cancelled = true;
            state.watchers.iter().map(|(_, w)| Arc::clone(w)).collect::<Vec<_>>()
        };
        self.inner.cond.notify_all();

        for watcher in watchers {
            watcher();
        }
    }

    /// Whether `cancel` has been called
    pub fn is_cancelled(&self) -> bool {
        lock(&self.inner.state).cancelled
    }

    /// The deadline, if any
    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    /// Time left before the deadline (None = no deadline)
    pub fn remaining(&self) -> Option<Duration> {
        self.inner
            .deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Current cancellation state
    pub fn check(&self) -> Result<(), Cancelled> {
        if self.is_cancelled() {
            return Err(Cancelled::Cancelled);
        }
        match self.inner.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(Cancelled::DeadlineExceeded),
            _ => Ok(()),
        }
    }

    /// Register a callback run when the token is cancelled
    ///
    /// Runs immediately if the token is already cancelled. The callback is
    /// removed when the returned guard drops.
    pub fn on_cancel<F>(&self, f: F) -> CancelGuard
    where
        F: Fn() + Send + Sync + 'static,
    {
        let watcher: Arc<Watcher> = Arc::new(Box::new(f));
        let id = {
            let mut state = lock(&self.inner.state);
            if state.cancelled {
                None
            } else {
                let id = state.next_id;
                state.next_id += 1;
                state.watchers.push((id, Arc::clone(&watcher)));
                Some(id)
            }
        };

        if id.is_none() {
            watcher();
        }

        CancelGuard {
            token: Arc::downgrade(&self.inner),
            id,
        }
    }

    /// Sleep for `duration`, returning early if the token fires
    pub fn sleep(&self, duration: Duration) -> Result<(), Cancelled> {
        let until = Instant::now() + duration;
        let mut state = lock(&self.inner.state);
        loop {
            if state.cancelled {
                return Err(Cancelled::Cancelled);
            }
            let now = Instant::now();
            if let Some(deadline) = self.inner.deadline {
                if now >= deadline {
                    return Err(Cancelled::DeadlineExceeded);
                }
            }
            if now >= until {
                return Ok(());
            }
            let mut wait = until - now;
            if let Some(left) = self.remaining() {
                wait = wait.min(left);
            }
            state = match self.inner.cond.wait_timeout(state, wait) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    /// Park on `cond`, bounded by this token's deadline
    ///
    /// Callers re-check their predicate and `check()` after every return.
    pub(crate) fn wait<'a, T>(&self, cond: &Condvar, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        match self.remaining() {
            Some(left) => match cond.wait_timeout(guard, left) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            },
            None => match cond.wait(guard) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            },
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .field("deadline", &self.inner.deadline)
            .finish()
    }
}

/// Registration handle returned by `CancelToken::on_cancel`
pub struct CancelGuard {
    token: Weak<Inner>,
    id: Option<u64>,
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if let (Some(inner), Some(id)) = (self.token.upgrade(), self.id) {
            lock(&inner.state).watchers.retain(|(wid, _)| *wid != id);
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
