use shared::{
    domain::{GuildId, RoomKey, UserId},
    error::ApiError,
};

use crate::{internal, ApiContext};

/// Maps an optional guild id to its room, checking membership for guild rooms.
pub async fn resolve_room(
    ctx: &ApiContext,
    user_id: UserId,
    guild_id: Option<GuildId>,
) -> Result<RoomKey, ApiError> {
    let room = RoomKey::for_guild(guild_id);
    ensure_room_member(ctx, user_id, room).await?;
    Ok(room)
}

/// Inverse of [`RoomKey::channel_name`], with the same membership check.
pub async fn resolve_channel(
    ctx: &ApiContext,
    user_id: UserId,
    channel: &str,
) -> Result<RoomKey, ApiError> {
    let room = RoomKey::from_channel_name(channel)
        .ok_or_else(|| ApiError::validation(format!("unknown channel '{channel}'")))?;
    ensure_room_member(ctx, user_id, room).await?;
    Ok(room)
}

pub(crate) async fn ensure_room_member(
    ctx: &ApiContext,
    user_id: UserId,
    room: RoomKey,
) -> Result<(), ApiError> {
    let RoomKey::Guild(guild_id) = room else {
        return Ok(());
    };
    ctx.storage
        .find_membership(guild_id, user_id)
        .await
        .map_err(internal)?
        .map(|_| ())
        .ok_or_else(|| ApiError::forbidden("user is not a member"))
}
