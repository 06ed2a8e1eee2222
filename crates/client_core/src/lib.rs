use std::sync::Arc;

use reqwest::{Client, Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use shared::{
    domain::{GuildId, MessageId, PollOptionId, RoomKey, UserId},
    error::{ApiError, ErrorCode},
    protocol::{
        ChannelAuthResponse, CreateGuildRequest, EditMessageRequest, GuildSummary,
        JoinGuildRequest, LoginRequest, LoginResponse, MarkSeenRequest, MarkSeenResponse,
        MessagePayload, MessageStatusRequest, SendMessageRequest, ServerEvent, SuccessResponse,
        VoteRequest,
    },
};
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{info, warn};
use url::Url;

pub mod error;
mod gateway;
pub mod presence;
pub mod store;

pub use error::ClientError;
pub use gateway::Subscription;
pub use presence::PresenceTracker;
pub use store::ChatStore;

use gateway::GatewayConnection;

pub const USER_ID_HEADER: &str = "x-user-id";

#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Every event delivered on the active room channel, after it was applied.
    Server { channel: String, event: ServerEvent },
    PresenceChanged { channel: String, online: usize },
    RoomSwitched(RoomKey),
    Error(String),
    Disconnected,
}

struct Shared {
    store: RwLock<ChatStore>,
    presence: Mutex<PresenceTracker>,
    events: broadcast::Sender<ClientEvent>,
}

#[derive(Default)]
struct Session {
    gateway: Option<GatewayConnection>,
    subscription: Option<Subscription>,
}

/// HTTP + gateway client for one signed-in user.
pub struct ChatClient {
    http: Client,
    base_url: Url,
    user_id: RwLock<Option<UserId>>,
    shared: Arc<Shared>,
    session: Mutex<Session>,
}

impl ChatClient {
    pub fn new(server_url: &str) -> Result<Self, ClientError> {
        let mut base_url = Url::parse(server_url)?;
        if !matches!(base_url.scheme(), "http" | "https") {
            return Err(ClientError::InvalidServerUrl(server_url.to_string()));
        }
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let (events, _) = broadcast::channel(1024);
        Ok(Self {
            http: Client::new(),
            base_url,
            user_id: RwLock::new(None),
            shared: Arc::new(Shared {
                store: RwLock::new(ChatStore::new()),
                presence: Mutex::new(PresenceTracker::new()),
                events,
            }),
            session: Mutex::new(Session::default()),
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.shared.events.subscribe()
    }

    pub async fn user_id(&self) -> Option<UserId> {
        *self.user_id.read().await
    }

    pub async fn login(
        &self,
        handle: &str,
        first_name: Option<&str>,
        last_name: Option<&str>,
        email: Option<&str>,
    ) -> Result<UserId, ClientError> {
        let request = LoginRequest {
            handle: handle.to_string(),
            first_name: first_name.map(str::to_string),
            last_name: last_name.map(str::to_string),
            email: email.map(str::to_string),
        };
        let response = self
            .http
            .post(self.endpoint("login")?)
            .json(&request)
            .send()
            .await?;
        let LoginResponse { user_id } = read_json(response).await?;
        *self.user_id.write().await = Some(user_id);
        info!(user_id = user_id.0, handle, "logged in");
        Ok(user_id)
    }

    pub async fn room(&self) -> RoomKey {
        self.shared.store.read().await.room()
    }

    pub async fn messages(&self) -> Vec<MessagePayload> {
        self.shared.store.read().await.messages().to_vec()
    }

    pub async fn guilds(&self) -> Vec<GuildSummary> {
        self.shared.store.read().await.guilds().to_vec()
    }

    /// Online count for the active room's channel.
    pub async fn online_users(&self) -> usize {
        let channel = self.room().await.channel_name();
        self.shared.presence.lock().await.count(&channel)
    }

    pub async fn list_guilds(&self) -> Result<Vec<GuildSummary>, ClientError> {
        let response = self.authed(Method::GET, "guilds").await?.send().await?;
        let guilds: Vec<GuildSummary> = read_json(response).await?;
        self.shared.store.write().await.set_guilds(guilds.clone());
        Ok(guilds)
    }

    pub async fn create_guild(&self, name: &str) -> Result<GuildSummary, ClientError> {
        let request = CreateGuildRequest {
            name: name.to_string(),
        };
        let response = self
            .authed(Method::POST, "guilds")
            .await?
            .json(&request)
            .send()
            .await?;
        let guild: GuildSummary = read_json(response).await?;
        self.shared.store.write().await.add_guild(guild.clone());
        Ok(guild)
    }

    pub async fn join_guild(&self, invite_code: &str) -> Result<GuildSummary, ClientError> {
        let request = JoinGuildRequest {
            invite_code: invite_code.to_string(),
        };
        let response = self
            .authed(Method::POST, "guilds/join")
            .await?
            .json(&request)
            .send()
            .await?;
        let guild: GuildSummary = read_json(response).await?;
        self.shared.store.write().await.add_guild(guild.clone());
        Ok(guild)
    }

    /// Moves the session to another room: the previous subscription is torn
    /// down, the new room channel is subscribed, the store is replaced with
    /// the room's canonical messages, and unseen messages are acknowledged in
    /// the background.
    pub async fn switch_room(&self, guild_id: Option<GuildId>) -> Result<(), ClientError> {
        let user_id = self.require_user().await?;
        let room = RoomKey::for_guild(guild_id);
        let mut session = self.session.lock().await;

        if let Some(previous) = session.subscription.take() {
            self.shared.presence.lock().await.forget(previous.channel());
            previous.cancel();
        }
        {
            let mut store = self.shared.store.write().await;
            store.switch_room(room);
            store.begin_loading();
        }

        let messages = match self.subscribe_then_fetch(&mut session, room).await {
            Ok(messages) => messages,
            Err(error) => {
                self.shared.store.write().await.finish_loading();
                return Err(error);
            }
        };
        let unseen = {
            let mut store = self.shared.store.write().await;
            store.set_messages(messages);
            store.unseen_ids(user_id)
        };
        self.spawn_seen_sweep(user_id, unseen);

        info!(user_id = user_id.0, %room, "switched room");
        let _ = self.shared.events.send(ClientEvent::RoomSwitched(room));
        Ok(())
    }

    /// The history fetch starts only after the gateway confirmed the
    /// subscription, so a message committed after the fetch read its rows is
    /// still delivered live and replayed over the fetched list.
    async fn subscribe_then_fetch(
        &self,
        session: &mut Session,
        room: RoomKey,
    ) -> Result<Vec<MessagePayload>, ClientError> {
        let channel = room.channel_name();
        let gateway = self.ensure_gateway(session).await?;
        let auth = self.authorize_channel(gateway.socket_id(), &channel).await?;
        let shared = self.shared.clone();
        let route_channel = channel.clone();
        let mut subscription = gateway.subscribe(&channel, auth, move |event| {
            let shared = shared.clone();
            let channel = route_channel.clone();
            async move { shared.dispatch(&channel, event).await }
        })?;
        subscription.confirmed().await?;
        session.subscription = Some(subscription);

        self.fetch_messages(room.guild_id()).await
    }

    /// Drops the room subscription and the gateway socket.
    pub async fn disconnect(&self) {
        let mut session = self.session.lock().await;
        if let Some(subscription) = session.subscription.take() {
            self.shared.presence.lock().await.forget(subscription.channel());
        }
        session.gateway = None;
    }

    pub async fn send_message(
        &self,
        mut request: SendMessageRequest,
    ) -> Result<MessagePayload, ClientError> {
        if request.guild_id.is_none() {
            request.guild_id = self.room().await.guild_id();
        }
        let response = self
            .authed(Method::POST, "messages")
            .await?
            .json(&request)
            .send()
            .await?;
        let message: MessagePayload = read_json(response).await?;
        let mut store = self.shared.store.write().await;
        if message.room() == store.room() {
            store.add(message.clone());
        }
        Ok(message)
    }

    pub async fn send_text(&self, content: &str) -> Result<MessagePayload, ClientError> {
        self.send_message(SendMessageRequest {
            content: Some(content.to_string()),
            ..SendMessageRequest::default()
        })
        .await
    }

    pub async fn edit_message(
        &self,
        id: MessageId,
        content: &str,
    ) -> Result<MessagePayload, ClientError> {
        let request = EditMessageRequest {
            id,
            content: content.to_string(),
        };
        let response = self
            .authed(Method::PATCH, "messages")
            .await?
            .json(&request)
            .send()
            .await?;
        let message: MessagePayload = read_json(response).await?;
        self.shared.store.write().await.update(message.clone());
        Ok(message)
    }

    pub async fn delete_message(&self, id: MessageId) -> Result<(), ClientError> {
        let response = self
            .authed(Method::DELETE, "messages")
            .await?
            .query(&[("id", id.to_string())])
            .send()
            .await?;
        let _: SuccessResponse = read_json(response).await?;
        self.shared.store.write().await.delete(id);
        Ok(())
    }

    pub async fn vote(
        &self,
        message_id: MessageId,
        option_id: PollOptionId,
    ) -> Result<MessagePayload, ClientError> {
        let request = VoteRequest {
            message_id,
            option_id,
        };
        let response = self
            .authed(Method::POST, "polls/vote")
            .await?
            .json(&request)
            .send()
            .await?;
        let message: MessagePayload = read_json(response).await?;
        self.shared.store.write().await.update(message.clone());
        Ok(message)
    }

    /// Returns how many of `message_ids` the server reported as updated.
    pub async fn mark_seen(&self, message_ids: &[MessageId]) -> Result<usize, ClientError> {
        let user_id = self.require_user().await?;
        post_seen(&self.http, &self.base_url, user_id, message_ids.to_vec()).await
    }

    pub async fn mark_status_seen(&self, message_id: MessageId) -> Result<(), ClientError> {
        let request = MessageStatusRequest {
            message_id: Some(message_id),
        };
        let response = self
            .authed(Method::POST, "messages/status")
            .await?
            .json(&request)
            .send()
            .await?;
        let _: SuccessResponse = read_json(response).await?;
        Ok(())
    }

    async fn fetch_messages(
        &self,
        guild_id: Option<GuildId>,
    ) -> Result<Vec<MessagePayload>, ClientError> {
        let mut request = self.authed(Method::GET, "messages").await?;
        if let Some(guild_id) = guild_id {
            request = request.query(&[("guild_id", guild_id.0)]);
        }
        read_json(request.send().await?).await
    }

    async fn authorize_channel(
        &self,
        socket_id: &str,
        channel: &str,
    ) -> Result<ChannelAuthResponse, ClientError> {
        let response = self
            .authed(Method::POST, "pusher/auth")
            .await?
            .form(&[("socket_id", socket_id), ("channel_name", channel)])
            .send()
            .await?;
        read_json(response).await
    }

    fn spawn_seen_sweep(&self, user_id: UserId, unseen: Vec<MessageId>) {
        if unseen.is_empty() {
            return;
        }
        let http = self.http.clone();
        let base_url = self.base_url.clone();
        let events = self.shared.events.clone();
        tokio::spawn(async move {
            let pending = unseen.len();
            if let Err(error) = post_seen(&http, &base_url, user_id, unseen).await {
                warn!(%error, pending, "failed to mark messages seen");
                let _ = events.send(ClientEvent::Error(format!(
                    "failed to mark messages seen: {error}"
                )));
            }
        });
    }

    async fn ensure_gateway<'a>(
        &self,
        session: &'a mut Session,
    ) -> Result<&'a GatewayConnection, ClientError> {
        if session
            .gateway
            .as_ref()
            .is_some_and(GatewayConnection::is_closed)
        {
            session.subscription = None;
            session.gateway = None;
        }
        if session.gateway.is_none() {
            let gateway =
                GatewayConnection::connect(&self.gateway_url()?, self.shared.events.clone())
                    .await?;
            session.gateway = Some(gateway);
        }
        session.gateway.as_ref().ok_or(ClientError::GatewayClosed)
    }

    fn gateway_url(&self) -> Result<Url, ClientError> {
        let mut url = self.base_url.join("ws")?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|_| ClientError::InvalidServerUrl(self.base_url.to_string()))?;
        Ok(url)
    }

    fn endpoint(&self, path: &str) -> Result<Url, ClientError> {
        Ok(self.base_url.join(path)?)
    }

    async fn require_user(&self) -> Result<UserId, ClientError> {
        self.user_id().await.ok_or(ClientError::NotLoggedIn)
    }

    async fn authed(&self, method: Method, path: &str) -> Result<RequestBuilder, ClientError> {
        let user_id = self.require_user().await?;
        Ok(self
            .http
            .request(method, self.endpoint(path)?)
            .header(USER_ID_HEADER, user_id.0.to_string()))
    }
}

impl Shared {
    async fn dispatch(&self, channel: &str, event: ServerEvent) {
        let online = self.presence.lock().await.apply(channel, &event);
        if let Some(online) = online {
            let _ = self.events.send(ClientEvent::PresenceChanged {
                channel: channel.to_string(),
                online,
            });
        }
        if let ServerEvent::SubscriptionError { message } = &event {
            warn!(%channel, %message, "subscription rejected");
            let _ = self.events.send(ClientEvent::Error(message.clone()));
        }
        self.store.write().await.apply_event(&event);
        let _ = self.events.send(ClientEvent::Server {
            channel: channel.to_string(),
            event,
        });
    }
}

async fn post_seen(
    http: &Client,
    base_url: &Url,
    user_id: UserId,
    message_ids: Vec<MessageId>,
) -> Result<usize, ClientError> {
    let response = http
        .post(base_url.join("messages/seen")?)
        .header(USER_ID_HEADER, user_id.0.to_string())
        .json(&MarkSeenRequest { message_ids })
        .send()
        .await?;
    let MarkSeenResponse { updated, .. } = read_json(response).await?;
    Ok(updated)
}

async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json().await?);
    }
    let body = response.text().await.unwrap_or_default();
    let error = serde_json::from_str::<ApiError>(&body)
        .unwrap_or_else(|_| ApiError::new(ErrorCode::Internal, body));
    Err(ClientError::Api {
        status: status.as_u16(),
        error,
    })
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
