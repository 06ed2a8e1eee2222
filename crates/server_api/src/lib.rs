use fanout::{ChannelAuthorizer, Fanout};
use shared::{
    domain::{UserId, UserProfile},
    error::ApiError,
};
use storage::Storage;
use tracing::error;

mod channel_auth;
mod guilds;
mod messages;
mod rooms;

pub use channel_auth::{authorize_channel, presence_member};
pub use guilds::{create_guild, join_guild, list_guilds, INVITE_CODE_LEN};
pub use messages::{
    delete_message, edit_message, list_messages, mark_seen, mark_seen_one, send_message, vote,
    WRITE_RETRY,
};
pub use rooms::{resolve_channel, resolve_room};

#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
    pub fanout: Fanout,
    pub channel_auth: ChannelAuthorizer,
}

/// Resolves the caller's identity; a missing id or an unknown user is `Unauthorized`.
pub async fn current_user(
    ctx: &ApiContext,
    user_id: Option<UserId>,
) -> Result<UserProfile, ApiError> {
    let Some(user_id) = user_id else {
        return Err(ApiError::unauthorized());
    };
    ctx.storage
        .find_user(user_id)
        .await
        .map_err(internal)?
        .ok_or_else(ApiError::unauthorized)
}

pub async fn login(
    ctx: &ApiContext,
    handle: &str,
    first_name: Option<&str>,
    last_name: Option<&str>,
    email: Option<&str>,
) -> Result<UserId, ApiError> {
    let handle = handle.trim();
    if handle.is_empty() {
        return Err(ApiError::validation("handle is required"));
    }
    ctx.storage
        .upsert_user(handle, first_name, last_name, email)
        .await
        .map_err(internal)
}

pub(crate) fn internal(err: anyhow::Error) -> ApiError {
    error!(error = ?err, "request failed");
    ApiError::internal()
}
