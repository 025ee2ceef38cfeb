//! Process-wide foreground/background gate.
//!
//! The gate is the only authority on whether network work may run. Every
//! network-touching path in the pool, the subscription runner and the cache
//! calls [`LifecycleGate::can_operate`] first and quietly does nothing when it
//! returns false.
//!
//! On mobile the OS can sever sockets the instant the app backgrounds, so
//! with [`TeardownPolicy::Aggressive`] the network flag drops synchronously,
//! before listeners or anything else run. Returning to the foreground waits
//! out a settle delay before re-enabling the network and draining the
//! deferred-operation queue in FIFO order.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::watch;

use crate::config::{LifecycleConfig, TeardownPolicy};
use crate::tlog;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppState {
    Foreground,
    Background,
}

type Listener = Arc<dyn Fn(AppState) + Send + Sync>;
type DeferredOp = Box<dyn FnOnce() + Send>;

struct GateInner {
    config: LifecycleConfig,
    state: Mutex<AppState>,
    network_allowed: watch::Sender<bool>,
    /// Bumped on every transition; delayed flag flips only apply if no newer
    /// transition happened in the meantime.
    generation: AtomicU64,
    listeners: Mutex<Vec<(u64, Listener)>>,
    next_listener_id: AtomicU64,
    deferred: Mutex<VecDeque<DeferredOp>>,
    runtime: Option<Handle>,
}

/// Cheap to clone; all clones share one gate.
#[derive(Clone)]
pub struct LifecycleGate {
    inner: Arc<GateInner>,
}

/// Returned by [`LifecycleGate::on_change`]. Dropping it keeps the listener.
pub struct ListenerHandle {
    id: u64,
    gate: Weak<GateInner>,
}

impl ListenerHandle {
    pub fn unsubscribe(self) {
        if let Some(inner) = self.gate.upgrade() {
            inner.listeners.lock().retain(|(id, _)| *id != self.id);
        }
    }
}

impl LifecycleGate {
    /// Starts foregrounded with network access allowed.
    ///
    /// Delayed transitions are scheduled on the Tokio runtime current at
    /// construction; without one they apply immediately.
    pub fn new(config: LifecycleConfig) -> Self {
        let (network_allowed, _) = watch::channel(true);
        Self {
            inner: Arc::new(GateInner {
                config,
                state: Mutex::new(AppState::Foreground),
                network_allowed,
                generation: AtomicU64::new(0),
                listeners: Mutex::new(Vec::new()),
                next_listener_id: AtomicU64::new(1),
                deferred: Mutex::new(VecDeque::new()),
                runtime: Handle::try_current().ok(),
            }),
        }
    }

    pub fn can_operate(&self) -> bool {
        *self.inner.network_allowed.borrow()
    }

    pub fn state(&self) -> AppState {
        *self.inner.state.lock()
    }

    /// Receiver that observes every change of the network-allowed flag.
    /// Long-running work selects on it to abandon cleanly when backgrounded.
    pub fn network_watch(&self) -> watch::Receiver<bool> {
        self.inner.network_allowed.subscribe()
    }

    pub fn transition(&self, next: AppState) {
        if next == AppState::Background
            && self.inner.config.teardown == TeardownPolicy::Aggressive
        {
            // Must precede everything else: the transport may already be gone.
            self.set_network_allowed(false);
        }

        let previous = std::mem::replace(&mut *self.inner.state.lock(), next);
        if previous == next {
            return;
        }
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        tlog!("LIFE", "transition {:?} -> {:?} gen={}", previous, next, generation);

        match next {
            AppState::Background => {
                if self.inner.config.teardown == TeardownPolicy::Lenient {
                    let grace = self.inner.config.background_grace();
                    self.schedule(generation, grace, |gate| gate.set_network_allowed(false));
                }
            }
            AppState::Foreground => {
                let settle = self.inner.config.foreground_settle();
                self.schedule(generation, settle, |gate| {
                    gate.set_network_allowed(true);
                    gate.drain_deferred();
                });
            }
        }

        self.notify_listeners(next);
    }

    /// Register a listener invoked synchronously on every transition.
    pub fn on_change<F>(&self, listener: F) -> ListenerHandle
    where
        F: Fn(AppState) + Send + Sync + 'static,
    {
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed);
        self.inner.listeners.lock().push((id, Arc::new(listener)));
        ListenerHandle {
            id,
            gate: Arc::downgrade(&self.inner),
        }
    }

    /// Run `op` now if the network is usable, otherwise queue it for the next
    /// completed foreground transition. Queued ops run exactly once, in order.
    pub fn defer_until_foreground<F>(&self, op: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            // The flag is checked under the queue lock so a concurrent drain
            // cannot miss this op.
            let mut deferred = self.inner.deferred.lock();
            if !self.can_operate() {
                deferred.push_back(Box::new(op));
                return;
            }
        }
        run_guarded("deferred op", op);
    }

    pub fn pending_deferred(&self) -> usize {
        self.inner.deferred.lock().len()
    }

    fn set_network_allowed(&self, allowed: bool) {
        let previous = self.inner.network_allowed.send_replace(allowed);
        if previous != allowed {
            tlog!("LIFE", "network allowed: {}", allowed);
        }
    }

    fn drain_deferred(&self) {
        let mut ran = 0usize;
        loop {
            if !self.can_operate() {
                break;
            }
            let op = self.inner.deferred.lock().pop_front();
            match op {
                Some(op) => {
                    run_guarded("deferred op", op);
                    ran += 1;
                }
                None => break,
            }
        }
        if ran > 0 {
            tlog!("LIFE", "drained {} deferred op(s)", ran);
        }
    }

    fn notify_listeners(&self, state: AppState) {
        // Snapshot so listeners may (un)register without deadlocking
        let listeners: Vec<Listener> = self
            .inner
            .listeners
            .lock()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in listeners {
            run_guarded("lifecycle listener", || listener(state));
        }
    }

    fn schedule<F>(&self, generation: u64, delay: Duration, action: F)
    where
        F: FnOnce(&LifecycleGate) + Send + 'static,
    {
        let runtime = match &self.inner.runtime {
            Some(handle) if !delay.is_zero() => handle.clone(),
            _ => {
                action(self);
                return;
            }
        };

        let gate = self.clone();
        runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if gate.inner.generation.load(Ordering::SeqCst) == generation {
                action(&gate);
            } else {
                tlog!("LIFE", "superseded transition gen={} dropped", generation);
            }
        });
    }
}

fn run_guarded<F: FnOnce()>(what: &str, f: F) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        tlog!("ERROR", "{} panicked; continuing", what);
    }
}
