//! Engine lifecycle tracking.
//!
//! Records whether the engine process has been launched and whether it has announced
//! readiness, and holds the continuations waiting for readiness.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::oneshot;

use crate::error::BridgeError;

/// Lifecycle of the engine. Transitions only move forward.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum LifecycleState {
    /// `start_engine` has not been called.
    #[default]
    NotStarted,
    /// Spawn issued, waiting for the engine's ready signal.
    Started,
    /// Engine accepts application events.
    Ready,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Started => "started",
            Self::Ready => "ready",
        }
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Continuation run once when the engine becomes ready.
pub type ReadyWaiter = Box<dyn FnOnce() + Send + 'static>;

/// Waiters taken out of the tracker by [`LifecycleTracker::mark_ready`].
///
/// Holding them separately lets the owner release any lock around the tracker before
/// the continuations run.
#[must_use = "waiters only fire when notify_all is called"]
pub struct ReadyWaiters(VecDeque<ReadyWaiter>);

impl ReadyWaiters {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Run every waiter in registration order. Returns how many ran.
    pub fn notify_all(mut self) -> usize {
        let mut notified = 0;
        while let Some(waiter) = self.0.pop_front() {
            waiter();
            notified += 1;
        }
        notified
    }
}

impl std::fmt::Debug for ReadyWaiters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ReadyWaiters").field(&self.0.len()).finish()
    }
}

/// State machine `NotStarted -> Started -> Ready` with deferred ready notifications.
#[derive(Default)]
pub struct LifecycleTracker {
    state: LifecycleState,
    waiters: VecDeque<ReadyWaiter>,
}

impl LifecycleTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Callers guarantee this runs at most once; the supervisor rejects a second start
    /// before reaching here.
    pub fn mark_started(&mut self) {
        debug_assert_eq!(self.state, LifecycleState::NotStarted);
        if self.state == LifecycleState::NotStarted {
            self.state = LifecycleState::Started;
        }
    }

    pub fn is_started(&self) -> bool {
        self.state >= LifecycleState::Started
    }

    pub fn is_ready(&self) -> bool {
        self.state == LifecycleState::Ready
    }

    /// Move to `Ready` and hand back the pending waiters.
    ///
    /// Only the call that performs the transition returns waiters; later calls return
    /// an empty set. The queue is swapped out before anything runs, so a waiter that
    /// registers again sees `is_ready() == true` and takes the immediate path.
    pub fn mark_ready(&mut self) -> ReadyWaiters {
        if self.state == LifecycleState::Ready {
            return ReadyWaiters(VecDeque::new());
        }
        self.state = LifecycleState::Ready;
        ReadyWaiters(std::mem::take(&mut self.waiters))
    }

    /// Run `waiter` now if ready, otherwise queue it for [`mark_ready`](Self::mark_ready).
    pub fn when_ready(&mut self, waiter: impl FnOnce() + Send + 'static) {
        if self.is_ready() {
            waiter();
        } else {
            self.waiters.push_back(Box::new(waiter));
        }
    }

    pub fn pending_waiters(&self) -> usize {
        self.waiters.len()
    }
}

impl std::fmt::Debug for LifecycleTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleTracker")
            .field("state", &self.state)
            .field("pending_waiters", &self.waiters.len())
            .finish()
    }
}

/// Lifecycle tracker shared between the host API and the engine's reader task.
///
/// All access is serialized behind one mutex. Waiters never run while it is held.
#[derive(Clone, Default)]
pub struct EngineStatus {
    inner: Arc<Mutex<LifecycleTracker>>,
}

impl EngineStatus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every mutation is a single assignment or queue swap, so a poisoned tracker is
    /// still consistent.
    fn lock(&self) -> MutexGuard<'_, LifecycleTracker> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::error!("Lifecycle mutex poisoned - recovering");
            poisoned.into_inner()
        })
    }

    pub fn state(&self) -> LifecycleState {
        self.lock().state()
    }

    pub fn is_started(&self) -> bool {
        self.lock().is_started()
    }

    pub fn is_ready(&self) -> bool {
        self.lock().is_ready()
    }

    /// Check-and-set for the start transition. Returns false if already started.
    pub fn try_mark_started(&self) -> bool {
        let mut tracker = self.lock();
        if tracker.is_started() {
            return false;
        }
        tracker.mark_started();
        true
    }

    /// Mark ready and run the pending waiters.
    ///
    /// Returns the number of waiters notified, or `None` if the engine was already
    /// ready.
    pub fn mark_ready(&self) -> Option<usize> {
        let waiters = {
            let mut tracker = self.lock();
            if tracker.is_ready() {
                return None;
            }
            tracker.mark_ready()
        };
        Some(waiters.notify_all())
    }

    pub fn when_ready(&self, waiter: impl FnOnce() + Send + 'static) {
        let mut tracker = self.lock();
        if tracker.is_ready() {
            drop(tracker);
            waiter();
        } else {
            tracker.when_ready(waiter);
        }
    }

    /// Register for the ready transition.
    ///
    /// Fails with [`BridgeError::NotStarted`] without registering anything when the
    /// engine has not been started.
    pub fn ready_signal(&self) -> Result<oneshot::Receiver<()>, BridgeError> {
        let (tx, rx) = oneshot::channel();
        let mut tracker = self.lock();
        if !tracker.is_started() {
            return Err(BridgeError::NotStarted);
        }
        if tracker.is_ready() {
            let _ = tx.send(());
        } else {
            tracker.when_ready(move || {
                let _ = tx.send(());
            });
        }
        Ok(rx)
    }
}

impl std::fmt::Debug for EngineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("EngineStatus").field(&*self.lock()).finish()
    }
}
