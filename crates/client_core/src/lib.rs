use std::sync::Arc;

use shared::{error::PermissionError, protocol::SnapshotPayload};

mod binding;
mod http;
mod remote;

pub use binding::{LiveBinding, LiveState, Phase};
pub use http::MarketplaceClient;
pub use remote::RemoteStore;

/// Receives pushes for one subscription. The store client calls these from
/// its own tasks, on its own schedule.
pub trait SubscriptionSink: Send + Sync {
    fn on_snapshot(&self, snapshot: SnapshotPayload);
    fn on_error(&self, error: PermissionError);
}

/// Anything a live binding can subscribe against: the remote store in
/// production, a scripted fake in tests.
pub trait SnapshotSource: Send + Sync {
    fn subscribe(
        &self,
        target: shared::protocol::QueryTarget,
        sink: Arc<dyn SubscriptionSink>,
    ) -> anyhow::Result<SubscriptionHandle>;
}

/// Out-of-band receiver for permission errors, injected into a binding at
/// construction so diagnostics never depend on ambient global state.
pub trait PermissionObserver: Send + Sync {
    fn permission_denied(&self, error: &PermissionError);
}

/// Owns one live subscription's teardown. Cancellation runs exactly once,
/// whether triggered explicitly or by drop.
pub struct SubscriptionHandle {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl SubscriptionHandle {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}
