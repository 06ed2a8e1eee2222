use fanout::{is_valid_socket_id, ChannelAuthError};
use shared::{
    domain::UserProfile,
    error::ApiError,
    protocol::{ChannelAuthResponse, PresenceInfo, PresenceMember},
};
use tracing::debug;

use crate::{internal, rooms::resolve_channel, ApiContext};

pub fn presence_member(user: &UserProfile) -> PresenceMember {
    PresenceMember {
        user_id: user.user_id,
        user_info: PresenceInfo {
            name: user.display_name(),
            email: user.primary_email().map(str::to_string),
        },
    }
}

/// Signs a presence subscription for `channel_name` bound to `socket_id`.
pub async fn authorize_channel(
    ctx: &ApiContext,
    user: &UserProfile,
    socket_id: Option<&str>,
    channel_name: Option<&str>,
) -> Result<ChannelAuthResponse, ApiError> {
    let (Some(socket_id), Some(channel_name)) = (
        socket_id.map(str::trim).filter(|s| !s.is_empty()),
        channel_name.map(str::trim).filter(|s| !s.is_empty()),
    ) else {
        return Err(ApiError::validation("missing socket_id or channel_name"));
    };
    if !is_valid_socket_id(socket_id) {
        return Err(ApiError::validation("malformed socket_id"));
    }

    resolve_channel(ctx, user.user_id, channel_name).await?;
    let response = ctx
        .channel_auth
        .authorize(socket_id, channel_name, &presence_member(user))
        .map_err(|err| match err {
            ChannelAuthError::MalformedSocketId(_) => ApiError::validation("malformed socket_id"),
            other => internal(other.into()),
        })?;
    debug!(user_id = %user.user_id, channel = channel_name, socket_id, "channel authorized");
    Ok(response)
}
