use std::{net::SocketAddr, sync::Arc};

use axum::{
    routing::{get, post},
    Router,
};
use fanout::{ChannelAuthorizer, ChannelHub, Fanout};
use server_api::ApiContext;
use storage::Storage;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod api;
mod app_state;
mod config;
mod gateway;

use app_state::AppState;
use config::{load_settings, prepare_database_url, Settings};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = load_settings();
    let database_url = prepare_database_url(&settings.database_url);
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;

    let state = build_state(storage, &settings);
    let app = build_router(state, settings.max_body_bytes);

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, policy = ?settings.publish_policy(), "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_state(storage: Storage, settings: &Settings) -> Arc<AppState> {
    let hub = Arc::new(ChannelHub::new());
    let api = ApiContext {
        storage,
        fanout: Fanout::new(hub.clone(), settings.publish_policy()),
        channel_auth: ChannelAuthorizer::new(settings.channel_auth()),
    };
    Arc::new(AppState { api, hub })
}

fn build_router(state: Arc<AppState>, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/healthz", get(api::healthz))
        .route("/login", post(api::login))
        .route(
            "/messages",
            post(api::send_message)
                .get(api::list_messages)
                .delete(api::delete_message)
                .patch(api::edit_message),
        )
        .route("/messages/seen", post(api::mark_seen))
        .route("/messages/status", post(api::message_status))
        .route("/polls/vote", post(api::vote))
        .route("/pusher/auth", post(api::channel_auth))
        .route("/guilds", post(api::create_guild).get(api::list_guilds))
        .route("/guilds/join", post(api::join_guild))
        .route("/ws", get(gateway::ws_handler))
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
        .with_state(state)
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
