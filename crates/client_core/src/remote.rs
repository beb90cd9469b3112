use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use anyhow::{anyhow, Context, Result};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

use shared::{
    domain::UserId,
    protocol::{ClientRequest, QueryTarget, ServerEvent},
};

use crate::{SnapshotSource, SubscriptionHandle, SubscriptionSink};

type SinkRegistry = Arc<Mutex<HashMap<Uuid, Arc<dyn SubscriptionSink>>>>;

/// WebSocket-backed [`SnapshotSource`]: one socket per store, subscriptions
/// multiplexed by id. Carries no reconnection policy — if the socket dies,
/// live bindings simply stop receiving pushes.
pub struct RemoteStore {
    outgoing: mpsc::UnboundedSender<ClientRequest>,
    registry: SinkRegistry,
}

impl RemoteStore {
    pub async fn connect(server_url: &str, user_id: Option<UserId>) -> Result<Arc<Self>> {
        let ws_url = websocket_url(server_url, user_id)?;
        let (ws_stream, _) = connect_async(ws_url.as_str())
            .await
            .with_context(|| format!("failed to connect websocket: {ws_url}"))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<ClientRequest>();
        tokio::spawn(async move {
            while let Some(request) = outgoing_rx.recv().await {
                let text = match serde_json::to_string(&request) {
                    Ok(text) => text,
                    Err(_) => continue,
                };
                if ws_writer.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
        });

        let registry: SinkRegistry = Arc::new(Mutex::new(HashMap::new()));
        let reader_registry = Arc::clone(&registry);
        tokio::spawn(async move {
            while let Some(message) = ws_reader.next().await {
                match message {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerEvent>(&text) {
                        Ok(event) => dispatch_event(&reader_registry, event),
                        Err(err) => warn!(%err, "store: invalid server event"),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        warn!(%err, "store: websocket receive failed");
                        break;
                    }
                }
            }
            // Connection gone; drop all routing. Bindings keep their last
            // state and reconnection is the caller's business.
            lock_registry(&reader_registry).clear();
        });

        Ok(Arc::new(Self { outgoing, registry }))
    }
}

fn dispatch_event(registry: &SinkRegistry, event: ServerEvent) {
    match event {
        ServerEvent::SnapshotPushed {
            subscription_id,
            snapshot,
        } => {
            let sink = lock_registry(registry).get(&subscription_id).cloned();
            match sink {
                Some(sink) => sink.on_snapshot(snapshot),
                None => debug!(%subscription_id, "store: push for unknown subscription"),
            }
        }
        ServerEvent::SubscriptionDenied {
            subscription_id,
            error,
        } => {
            // A denied subscription never produces pushes; forget it.
            let sink = lock_registry(registry).remove(&subscription_id);
            if let Some(sink) = sink {
                sink.on_error(error);
            }
        }
        ServerEvent::Error(error) => warn!(%error, "store: server error event"),
    }
}

impl SnapshotSource for RemoteStore {
    fn subscribe(
        &self,
        target: QueryTarget,
        sink: Arc<dyn SubscriptionSink>,
    ) -> Result<SubscriptionHandle> {
        let subscription_id = Uuid::new_v4();
        lock_registry(&self.registry).insert(subscription_id, sink);

        if self
            .outgoing
            .send(ClientRequest::Subscribe {
                subscription_id,
                target,
            })
            .is_err()
        {
            lock_registry(&self.registry).remove(&subscription_id);
            return Err(anyhow!("store connection is closed"));
        }

        let registry = Arc::clone(&self.registry);
        let outgoing = self.outgoing.clone();
        Ok(SubscriptionHandle::new(move || {
            lock_registry(&registry).remove(&subscription_id);
            let _ = outgoing.send(ClientRequest::Unsubscribe { subscription_id });
        }))
    }
}

fn websocket_url(server_url: &str, user_id: Option<UserId>) -> Result<Url> {
    let mut url = Url::parse(server_url).context("invalid server url")?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(anyhow!("unsupported server url scheme: {other}")),
    };
    url.set_scheme(scheme)
        .map_err(|_| anyhow!("failed to set websocket scheme"))?;
    url.set_path("/ws");
    url.set_query(None);
    if let Some(user_id) = user_id {
        url.query_pairs_mut()
            .append_pair("user_id", &user_id.0.to_string());
    }
    Ok(url)
}

fn lock_registry(
    registry: &SinkRegistry,
) -> std::sync::MutexGuard<'_, HashMap<Uuid, Arc<dyn SubscriptionSink>>> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}
