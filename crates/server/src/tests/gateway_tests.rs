use std::time::Duration;

use futures::{SinkExt, StreamExt};
use shared::{
    domain::UserProfile,
    protocol::{GatewayCommand, SendMessageRequest},
};
use storage::Storage;
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite, MaybeTlsStream, WebSocketStream};

use super::*;
use crate::{build_router, build_state, config::Settings};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn spawn_server() -> (String, Arc<AppState>) {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let settings = Settings {
        publish_max_retries: 0,
        ..Settings::default()
    };
    let state = build_state(storage, &settings);
    let app = build_router(state.clone(), settings.max_body_bytes);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    (format!("ws://{addr}/ws"), state)
}

async fn user(state: &AppState, handle: &str) -> UserProfile {
    let user_id = state
        .api
        .storage
        .upsert_user(handle, None, None, None)
        .await
        .expect("user");
    server_api::current_user(&state.api, Some(user_id))
        .await
        .expect("profile")
}

async fn next_frame(socket: &mut Socket) -> ChannelFrame {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("frame in time")
            .expect("socket open")
            .expect("frame");
        if let tungstenite::Message::Text(text) = message {
            return serde_json::from_str(&text).expect("channel frame");
        }
    }
}

async fn connect(url: &str) -> (Socket, String) {
    let (mut socket, _) = connect_async(url).await.expect("connect");
    let frame = next_frame(&mut socket).await;
    let ServerEvent::ConnectionEstablished { socket_id } = frame.event else {
        panic!("expected connection-established, got {frame:?}");
    };
    (socket, socket_id)
}

async fn send_command(socket: &mut Socket, command: &GatewayCommand) {
    socket
        .send(tungstenite::Message::Text(
            serde_json::to_string(command).expect("json"),
        ))
        .await
        .expect("send");
}

async fn subscribe(state: &AppState, socket: &mut Socket, socket_id: &str, who: &UserProfile) {
    let auth = server_api::authorize_channel(
        &state.api,
        who,
        Some(socket_id),
        Some("presence-global"),
    )
    .await
    .expect("auth");
    send_command(
        socket,
        &GatewayCommand::Subscribe {
            channel: "presence-global".into(),
            auth: auth.auth,
            channel_data: auth.channel_data,
        },
    )
    .await;
}

#[tokio::test]
async fn subscribers_see_presence_and_lifecycle_events() {
    let (url, state) = spawn_server().await;
    let alice = user(&state, "alice").await;
    let bob = user(&state, "bob").await;

    let (mut alice_ws, alice_socket) = connect(&url).await;
    subscribe(&state, &mut alice_ws, &alice_socket, &alice).await;
    let frame = next_frame(&mut alice_ws).await;
    assert_eq!(frame.channel.as_deref(), Some("presence-global"));
    let ServerEvent::SubscriptionSucceeded { count, .. } = frame.event else {
        panic!("expected subscription-succeeded, got {frame:?}");
    };
    assert_eq!(count, 1);

    let (mut bob_ws, bob_socket) = connect(&url).await;
    subscribe(&state, &mut bob_ws, &bob_socket, &bob).await;
    let frame = next_frame(&mut bob_ws).await;
    assert!(matches!(
        frame.event,
        ServerEvent::SubscriptionSucceeded { count: 2, .. }
    ));
    let frame = next_frame(&mut alice_ws).await;
    let ServerEvent::MemberAdded { member } = frame.event else {
        panic!("expected member-added, got {frame:?}");
    };
    assert_eq!(member.user_id, bob.user_id);

    let sent = server_api::send_message(
        &state.api,
        &bob,
        SendMessageRequest {
            content: Some("over the wire".into()),
            ..SendMessageRequest::default()
        },
    )
    .await
    .expect("send");
    for socket in [&mut alice_ws, &mut bob_ws] {
        let frame = next_frame(socket).await;
        let ServerEvent::MessageCreated { message } = frame.event else {
            panic!("expected message-created, got {frame:?}");
        };
        assert_eq!(message.id, sent.id);
    }

    bob_ws.close(None).await.expect("close");
    let frame = next_frame(&mut alice_ws).await;
    assert_eq!(
        frame.event,
        ServerEvent::MemberRemoved {
            user_id: bob.user_id
        }
    );
}

#[tokio::test]
async fn subscription_with_foreign_auth_is_rejected() {
    let (url, state) = spawn_server().await;
    let alice = user(&state, "alice").await;

    let (mut ws, socket_id) = connect(&url).await;
    // signed for another socket
    let auth = server_api::authorize_channel(&state.api, &alice, Some("999.1"), Some("presence-global"))
        .await
        .expect("auth");
    send_command(
        &mut ws,
        &GatewayCommand::Subscribe {
            channel: "presence-global".into(),
            auth: auth.auth,
            channel_data: auth.channel_data,
        },
    )
    .await;

    let frame = next_frame(&mut ws).await;
    assert!(
        matches!(frame.event, ServerEvent::SubscriptionError { .. }),
        "{frame:?}"
    );
    assert_eq!(state.hub.presence_count("presence-global").await, 0);
    assert_ne!(socket_id, "999.1");

    ws.send(tungstenite::Message::Text("{not json".into()))
        .await
        .expect("send garbage");
    let frame = next_frame(&mut ws).await;
    assert!(matches!(frame.event, ServerEvent::Error(_)), "{frame:?}");
}

#[tokio::test]
async fn unsubscribe_leaves_the_channel() {
    let (url, state) = spawn_server().await;
    let alice = user(&state, "alice").await;

    let (mut ws, socket_id) = connect(&url).await;
    subscribe(&state, &mut ws, &socket_id, &alice).await;
    next_frame(&mut ws).await;
    assert_eq!(state.hub.presence_count("presence-global").await, 1);

    send_command(
        &mut ws,
        &GatewayCommand::Unsubscribe {
            channel: "presence-global".into(),
        },
    )
    .await;
    let mut remaining = state.hub.presence_count("presence-global").await;
    for _ in 0..50 {
        if remaining == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        remaining = state.hub.presence_count("presence-global").await;
    }
    assert_eq!(remaining, 0);
}
