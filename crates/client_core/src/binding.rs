use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use shared::{
    error::PermissionError,
    protocol::{DocumentRecord, QueryTarget, SnapshotPayload},
};

use crate::{PermissionObserver, SnapshotSource, SubscriptionHandle, SubscriptionSink};

/// Lifecycle of one binding. Transitions fire only on input change, store
/// push, store error, or consumer detach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Subscribing,
    Subscribed,
    Error,
}

/// What the consumer renders: the last full snapshot, a loading flag, and
/// the structured error if the subscription was rejected.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveState {
    pub snapshot: Option<SnapshotPayload>,
    pub loading: bool,
    pub error: Option<PermissionError>,
}

impl LiveState {
    fn reset() -> Self {
        Self {
            snapshot: None,
            loading: false,
            error: None,
        }
    }

    fn loading() -> Self {
        Self {
            snapshot: None,
            loading: true,
            error: None,
        }
    }

    pub fn records(&self) -> &[DocumentRecord] {
        self.snapshot
            .as_ref()
            .map(SnapshotPayload::records)
            .unwrap_or_default()
    }

    pub fn document(&self) -> Option<&DocumentRecord> {
        self.snapshot.as_ref().and_then(SnapshotPayload::document)
    }
}

struct Inner {
    phase: Phase,
    state: LiveState,
    active: Option<SubscriptionHandle>,
    // Bumped on every input change; stale subscription callbacks check it
    // and drop themselves instead of clobbering the successor's state.
    generation: u64,
}

/// Bridges one live query or document reference into consumer-facing state.
///
/// At most one subscription is live per binding at any time: the previous
/// handle is cancelled synchronously inside [`set_target`]/[`detach`] before
/// any replacement opens. Each push replaces the snapshot wholesale.
///
/// [`set_target`]: LiveBinding::set_target
/// [`detach`]: LiveBinding::detach
pub struct LiveBinding {
    source: Arc<dyn SnapshotSource>,
    observers: Arc<[Arc<dyn PermissionObserver>]>,
    inner: Arc<Mutex<Inner>>,
}

impl LiveBinding {
    pub fn new(
        source: Arc<dyn SnapshotSource>,
        observers: Vec<Arc<dyn PermissionObserver>>,
    ) -> Self {
        Self {
            source,
            observers: observers.into(),
            inner: Arc::new(Mutex::new(Inner {
                phase: Phase::Idle,
                state: LiveState::reset(),
                active: None,
                generation: 0,
            })),
        }
    }

    /// Points the binding at a new target, or at nothing. The previous
    /// subscription is torn down exactly once before anything else happens.
    pub fn set_target(&self, target: Option<QueryTarget>) -> anyhow::Result<()> {
        let previous = {
            let mut guard = lock(&self.inner);
            guard.generation += 1;
            guard.active.take()
        };
        if let Some(handle) = previous {
            handle.cancel();
        }

        let Some(target) = target else {
            let mut guard = lock(&self.inner);
            guard.phase = Phase::Idle;
            guard.state = LiveState::reset();
            return Ok(());
        };

        let generation = {
            let mut guard = lock(&self.inner);
            guard.phase = Phase::Subscribing;
            guard.state = LiveState::loading();
            guard.generation
        };

        let sink = Arc::new(BindingSink {
            inner: Arc::downgrade(&self.inner),
            observers: Arc::clone(&self.observers),
            generation,
        });

        match self.source.subscribe(target, sink) {
            Ok(handle) => {
                let mut guard = lock(&self.inner);
                if guard.generation == generation {
                    guard.active = Some(handle);
                } else {
                    // The input changed again while we were subscribing.
                    drop(guard);
                    handle.cancel();
                }
                Ok(())
            }
            Err(error) => {
                let mut guard = lock(&self.inner);
                if guard.generation == generation {
                    guard.phase = Phase::Idle;
                    guard.state = LiveState::reset();
                }
                Err(error)
            }
        }
    }

    /// Consumer is going away: tear down and reset. Equivalent to
    /// `set_target(None)`.
    pub fn detach(&self) {
        let _ = self.set_target(None);
    }

    pub fn state(&self) -> LiveState {
        lock(&self.inner).state.clone()
    }

    pub fn phase(&self) -> Phase {
        lock(&self.inner).phase
    }
}

struct BindingSink {
    inner: Weak<Mutex<Inner>>,
    observers: Arc<[Arc<dyn PermissionObserver>]>,
    generation: u64,
}

impl SubscriptionSink for BindingSink {
    fn on_snapshot(&self, snapshot: SnapshotPayload) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let mut guard = lock(&inner);
        if guard.generation != self.generation {
            return;
        }
        guard.phase = Phase::Subscribed;
        guard.state = LiveState {
            snapshot: Some(snapshot),
            loading: false,
            error: None,
        };
    }

    fn on_error(&self, error: PermissionError) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        {
            let mut guard = lock(&inner);
            if guard.generation != self.generation {
                return;
            }
            guard.phase = Phase::Error;
            guard.state = LiveState {
                snapshot: None,
                loading: false,
                error: Some(error.clone()),
            };
        }
        // Observers run outside the lock; one of them inspecting the binding
        // must not deadlock.
        for observer in self.observers.iter() {
            observer.permission_denied(&error);
        }
    }
}

fn lock<'a>(inner: &'a Arc<Mutex<Inner>>) -> MutexGuard<'a, Inner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
#[path = "tests/binding_tests.rs"]
mod tests;
