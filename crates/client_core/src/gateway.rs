use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, Mutex},
    time::Duration,
};

use futures::{SinkExt, Stream, StreamExt};
use shared::protocol::{ChannelAuthResponse, ChannelFrame, GatewayCommand, ServerEvent};
use tokio::{
    sync::{broadcast, mpsc, oneshot},
    task::JoinHandle,
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{self, Message},
};
use tracing::{debug, info, warn};
use url::Url;

use crate::{error::ClientError, ClientEvent};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

type Routes = Arc<Mutex<HashMap<String, mpsc::UnboundedSender<ServerEvent>>>>;

/// One WebSocket to the server's channel gateway, shared by every subscription.
pub(crate) struct GatewayConnection {
    socket_id: String,
    commands: mpsc::UnboundedSender<GatewayCommand>,
    routes: Routes,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl GatewayConnection {
    pub(crate) async fn connect(
        url: &Url,
        events: broadcast::Sender<ClientEvent>,
    ) -> Result<Self, ClientError> {
        let (stream, _) = connect_async(url.as_str()).await?;
        let (mut sink, mut source) = stream.split();

        let socket_id = tokio::time::timeout(HANDSHAKE_TIMEOUT, read_socket_id(&mut source))
            .await
            .map_err(|_| ClientError::HandshakeTimeout)??;
        info!(%url, %socket_id, "gateway connected");

        let (commands, mut outbound) = mpsc::unbounded_channel::<GatewayCommand>();
        let writer = tokio::spawn(async move {
            while let Some(command) = outbound.recv().await {
                let text = match serde_json::to_string(&command) {
                    Ok(text) => text,
                    Err(error) => {
                        warn!(%error, "failed to encode gateway command");
                        continue;
                    }
                };
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
        });

        let routes: Routes = Arc::default();
        let reader_routes = routes.clone();
        let reader = tokio::spawn(async move {
            while let Some(message) = source.next().await {
                match message {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ChannelFrame>(&text) {
                        Ok(frame) => route_frame(&reader_routes, &events, frame),
                        Err(error) => {
                            let _ = events.send(ClientEvent::Error(format!(
                                "invalid gateway frame: {error}"
                            )));
                        }
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(error) => {
                        let _ = events.send(ClientEvent::Error(format!(
                            "websocket receive failed: {error}"
                        )));
                        break;
                    }
                }
            }
            // dropping the senders ends every subscription task
            if let Ok(mut routes) = reader_routes.lock() {
                routes.clear();
            }
            let _ = events.send(ClientEvent::Disconnected);
        });

        Ok(Self {
            socket_id,
            commands,
            routes,
            reader,
            writer,
        })
    }

    pub(crate) fn socket_id(&self) -> &str {
        &self.socket_id
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.reader.is_finished() || self.commands.is_closed()
    }

    /// Registers the channel route before sending `subscribe` so the
    /// subscription snapshot cannot be missed. `on_event` runs on a single
    /// task, one event at a time, in arrival order; see
    /// [`Subscription::confirmed`] to wait for the gateway's answer.
    pub(crate) fn subscribe<F, Fut>(
        &self,
        channel: &str,
        auth: ChannelAuthResponse,
        on_event: F,
    ) -> Result<Subscription, ClientError>
    where
        F: Fn(ServerEvent) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel();
        if let Ok(mut routes) = self.routes.lock() {
            routes.insert(channel.to_string(), tx);
        }

        let subscribe = GatewayCommand::Subscribe {
            channel: channel.to_string(),
            auth: auth.auth,
            channel_data: auth.channel_data,
        };
        if self.commands.send(subscribe).is_err() {
            if let Ok(mut routes) = self.routes.lock() {
                routes.remove(channel);
            }
            return Err(ClientError::GatewayClosed);
        }

        let (ready_tx, ready_rx) = oneshot::channel();
        let task = tokio::spawn(async move {
            let mut ready = Some(ready_tx);
            while let Some(event) = rx.recv().await {
                let outcome = match &event {
                    ServerEvent::SubscriptionSucceeded { .. } => Some(Ok(())),
                    ServerEvent::SubscriptionError { message } => Some(Err(message.clone())),
                    _ => None,
                };
                on_event(event).await;
                if let Some(outcome) = outcome {
                    if let Some(ready) = ready.take() {
                        let _ = ready.send(outcome);
                    }
                }
            }
        });

        Ok(Subscription {
            channel: channel.to_string(),
            commands: self.commands.clone(),
            routes: self.routes.clone(),
            ready: Some(ready_rx),
            task,
        })
    }
}

impl Drop for GatewayConnection {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

async fn read_socket_id<S>(source: &mut S) -> Result<String, ClientError>
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    while let Some(message) = source.next().await {
        if let Message::Text(text) = message? {
            let frame: ChannelFrame = serde_json::from_str(&text)?;
            if let ServerEvent::ConnectionEstablished { socket_id } = frame.event {
                return Ok(socket_id);
            }
        }
    }
    Err(ClientError::GatewayClosed)
}

fn route_frame(routes: &Routes, events: &broadcast::Sender<ClientEvent>, frame: ChannelFrame) {
    let Some(channel) = frame.channel else {
        if let ServerEvent::Error(error) = frame.event {
            let _ = events.send(ClientEvent::Error(error.message));
        }
        return;
    };
    let route = routes
        .lock()
        .ok()
        .and_then(|routes| routes.get(&channel).cloned());
    match route {
        Some(tx) => {
            let _ = tx.send(frame.event);
        }
        None => debug!(%channel, event = frame.event.name(), "frame for unsubscribed channel"),
    }
}

/// Live binding to one room channel. Dropping it stops event delivery and
/// tells the gateway to unsubscribe.
pub struct Subscription {
    channel: String,
    commands: mpsc::UnboundedSender<GatewayCommand>,
    routes: Routes,
    ready: Option<oneshot::Receiver<Result<(), String>>>,
    task: JoinHandle<()>,
}

impl Subscription {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Waits until the gateway accepts or rejects the subscription. Once this
    /// returns `Ok`, every later event on the channel reaches `on_event`.
    pub async fn confirmed(&mut self) -> Result<(), ClientError> {
        let Some(ready) = self.ready.take() else {
            return Ok(());
        };
        match tokio::time::timeout(HANDSHAKE_TIMEOUT, ready).await {
            Err(_) => Err(ClientError::HandshakeTimeout),
            Ok(Err(_)) => Err(ClientError::GatewayClosed),
            Ok(Ok(Err(message))) => Err(ClientError::SubscriptionRejected(message)),
            Ok(Ok(Ok(()))) => Ok(()),
        }
    }

    pub fn cancel(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
        if let Ok(mut routes) = self.routes.lock() {
            routes.remove(&self.channel);
        }
        let _ = self.commands.send(GatewayCommand::Unsubscribe {
            channel: self.channel.clone(),
        });
    }
}
