use rand::{distributions::Alphanumeric, Rng};
use shared::{
    domain::{Role, UserId},
    error::ApiError,
    protocol::GuildSummary,
};
use tracing::{info, warn};

use crate::{internal, ApiContext};

pub const INVITE_CODE_LEN: usize = 6;
const INVITE_CODE_ATTEMPTS: usize = 5;

fn generate_invite_code() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(INVITE_CODE_LEN)
        .map(char::from)
        .collect()
}

pub async fn create_guild(
    ctx: &ApiContext,
    owner: UserId,
    name: &str,
) -> Result<GuildSummary, ApiError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ApiError::validation("guild name is required"));
    }

    for _ in 0..INVITE_CODE_ATTEMPTS {
        let invite_code = generate_invite_code();
        match ctx
            .storage
            .insert_guild(name, owner, &invite_code)
            .await
            .map_err(internal)?
        {
            Some(guild) => {
                info!(guild_id = %guild.guild_id, %owner, "guild created");
                return Ok(guild.summary(Some(Role::Owner)));
            }
            None => warn!(%invite_code, "invite code collision, regenerating"),
        }
    }
    Err(ApiError::conflict("could not allocate a unique invite code"))
}

pub async fn join_guild(
    ctx: &ApiContext,
    user_id: UserId,
    invite_code: &str,
) -> Result<GuildSummary, ApiError> {
    let invite_code = invite_code.trim();
    if invite_code.is_empty() {
        return Err(ApiError::validation("invite code is required"));
    }

    let guild = ctx
        .storage
        .find_guild_by_invite_code(invite_code)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::not_found("invalid invite code"))?;
    let inserted = ctx
        .storage
        .insert_membership(guild.guild_id, user_id, Role::Member)
        .await
        .map_err(internal)?;
    if !inserted {
        return Err(ApiError::conflict("already a member"));
    }

    info!(guild_id = %guild.guild_id, %user_id, "guild joined");
    Ok(guild.summary(Some(Role::Member)))
}

pub async fn list_guilds(ctx: &ApiContext, user_id: UserId) -> Result<Vec<GuildSummary>, ApiError> {
    let guilds = ctx
        .storage
        .list_guilds_for_user(user_id)
        .await
        .map_err(internal)?;
    Ok(guilds
        .into_iter()
        .map(|(guild, role)| guild.summary(Some(role)))
        .collect())
}
