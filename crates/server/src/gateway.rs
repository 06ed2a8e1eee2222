use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use shared::{
    error::ApiError,
    protocol::{ChannelFrame, GatewayCommand, ServerEvent},
};
use tracing::{debug, info, warn};

use crate::app_state::AppState;

pub(crate) async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ws_connection(state, socket))
}

async fn ws_connection(state: Arc<AppState>, socket: WebSocket) {
    let (mut sender, mut receiver) = socket.split();
    let (socket_id, mut outbound) = state.hub.connect().await;
    info!(%socket_id, "gateway connected");

    let send_task = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            let text = match serde_json::to_string(&frame) {
                Ok(v) => v,
                Err(_) => continue,
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(message)) = receiver.next().await {
        match message {
            Message::Text(text) => handle_command(&state, &socket_id, &text).await,
            Message::Close(_) => break,
            _ => {}
        }
    }

    state.hub.disconnect(&socket_id).await;
    send_task.abort();
    info!(%socket_id, "gateway disconnected");
}

async fn handle_command(state: &AppState, socket_id: &str, text: &str) {
    let command = match serde_json::from_str::<GatewayCommand>(text) {
        Ok(command) => command,
        Err(error) => {
            debug!(%socket_id, %error, "malformed gateway frame");
            reply(
                state,
                socket_id,
                None,
                ServerEvent::Error(ApiError::validation("malformed gateway frame")),
            )
            .await;
            return;
        }
    };

    match command {
        GatewayCommand::Subscribe {
            channel,
            auth,
            channel_data,
        } => {
            let member = match state
                .api
                .channel_auth
                .verify(socket_id, &channel, &auth, &channel_data)
            {
                Ok(member) => member,
                Err(error) => {
                    warn!(%socket_id, %channel, %error, "rejected subscription");
                    reply(
                        state,
                        socket_id,
                        Some(channel),
                        ServerEvent::SubscriptionError {
                            message: error.to_string(),
                        },
                    )
                    .await;
                    return;
                }
            };
            if let Err(error) = state.hub.subscribe(socket_id, &channel, member).await {
                warn!(%socket_id, %channel, %error, "subscribe failed");
            }
        }
        GatewayCommand::Unsubscribe { channel } => {
            state.hub.unsubscribe(socket_id, &channel).await;
        }
    }
}

async fn reply(state: &AppState, socket_id: &str, channel: Option<String>, event: ServerEvent) {
    if let Err(error) = state
        .hub
        .send_to(socket_id, ChannelFrame { channel, event })
        .await
    {
        debug!(%socket_id, %error, "reply to closed socket");
    }
}

#[cfg(test)]
#[path = "tests/gateway_tests.rs"]
mod tests;
