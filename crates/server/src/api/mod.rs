use std::sync::Arc;

use axum::{
    async_trait,
    extract::{FromRequestParts, Query, State},
    http::{request::Parts, StatusCode},
    Form, Json,
};
use serde::Deserialize;
use server_api::{current_user, ApiContext};
use shared::{
    domain::{GuildId, MessageId, UserId, UserProfile},
    error::{ApiError, ErrorCode},
    protocol::{
        ChannelAuthResponse, CreateGuildRequest, EditMessageRequest, GuildSummary,
        JoinGuildRequest, LoginRequest, LoginResponse, MarkSeenRequest, MarkSeenResponse,
        MessagePayload, MessageStatusRequest, SendMessageRequest, SuccessResponse, VoteRequest,
    },
};
use tracing::error;

use crate::app_state::AppState;

pub(crate) const USER_ID_HEADER: &str = "x-user-id";

pub(crate) type ApiRejection = (StatusCode, Json<ApiError>);
type ApiResult<T> = Result<T, ApiRejection>;

pub(crate) fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorCode::Forbidden => StatusCode::FORBIDDEN,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Validation | ErrorCode::Conflict => StatusCode::BAD_REQUEST,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub(crate) fn reject(err: ApiError) -> ApiRejection {
    (status_for(err.code), Json(err))
}

/// Caller identity taken from the `x-user-id` header and checked against stored profiles.
pub(crate) struct CurrentUser(pub(crate) UserProfile);

#[async_trait]
impl FromRequestParts<Arc<AppState>> for CurrentUser {
    type Rejection = ApiRejection;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let user_id = parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(|raw| raw.trim().parse::<i64>().ok())
            .map(UserId);
        current_user(&state.api, user_id)
            .await
            .map(CurrentUser)
            .map_err(reject)
    }
}

fn api(state: &AppState) -> &ApiContext {
    &state.api
}

pub(crate) async fn healthz(State(state): State<Arc<AppState>>) -> ApiResult<&'static str> {
    state.api.storage.health_check().await.map_err(|err| {
        error!(error = ?err, "health check failed");
        reject(ApiError::internal())
    })?;
    Ok("ok")
}

pub(crate) async fn login(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> ApiResult<Json<LoginResponse>> {
    let user_id = server_api::login(
        api(&state),
        &req.handle,
        req.first_name.as_deref(),
        req.last_name.as_deref(),
        req.email.as_deref(),
    )
    .await
    .map_err(reject)?;
    Ok(Json(LoginResponse { user_id }))
}

#[derive(Debug, Deserialize)]
pub(crate) struct RoomQuery {
    guild_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct MessageIdQuery {
    id: Option<String>,
}

pub(crate) async fn send_message(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    Json(req): Json<SendMessageRequest>,
) -> ApiResult<(StatusCode, Json<MessagePayload>)> {
    let message = server_api::send_message(api(&state), &user, req)
        .await
        .map_err(reject)?;
    Ok((StatusCode::CREATED, Json(message)))
}

pub(crate) async fn list_messages(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    Query(q): Query<RoomQuery>,
) -> ApiResult<Json<Vec<MessagePayload>>> {
    let messages = server_api::list_messages(api(&state), &user, q.guild_id.map(GuildId))
        .await
        .map_err(reject)?;
    Ok(Json(messages))
}

pub(crate) async fn delete_message(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    Query(q): Query<MessageIdQuery>,
) -> ApiResult<Json<SuccessResponse>> {
    let message_id = q
        .id
        .as_deref()
        .map(str::trim)
        .filter(|raw| !raw.is_empty())
        .map(|raw| {
            raw.parse::<MessageId>()
                .map_err(|_| reject(ApiError::validation("invalid message id")))
        })
        .transpose()?;
    server_api::delete_message(api(&state), &user, message_id)
        .await
        .map_err(reject)?;
    Ok(Json(SuccessResponse { success: true }))
}

pub(crate) async fn edit_message(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    Json(req): Json<EditMessageRequest>,
) -> ApiResult<Json<MessagePayload>> {
    let message = server_api::edit_message(api(&state), &user, req)
        .await
        .map_err(reject)?;
    Ok(Json(message))
}

pub(crate) async fn mark_seen(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    Json(req): Json<MarkSeenRequest>,
) -> ApiResult<Json<MarkSeenResponse>> {
    let updated = server_api::mark_seen(api(&state), &user, &req.message_ids)
        .await
        .map_err(reject)?;
    Ok(Json(MarkSeenResponse {
        success: true,
        updated: updated.len(),
    }))
}

pub(crate) async fn message_status(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    Json(req): Json<MessageStatusRequest>,
) -> ApiResult<Json<SuccessResponse>> {
    server_api::mark_seen_one(api(&state), &user, req.message_id)
        .await
        .map_err(reject)?;
    Ok(Json(SuccessResponse { success: true }))
}

pub(crate) async fn vote(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    Json(req): Json<VoteRequest>,
) -> ApiResult<Json<MessagePayload>> {
    let message = server_api::vote(api(&state), &user, req.message_id, req.option_id)
        .await
        .map_err(reject)?;
    Ok(Json(message))
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChannelAuthForm {
    socket_id: Option<String>,
    channel_name: Option<String>,
}

pub(crate) async fn channel_auth(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    Form(form): Form<ChannelAuthForm>,
) -> ApiResult<Json<ChannelAuthResponse>> {
    let response = server_api::authorize_channel(
        api(&state),
        &user,
        form.socket_id.as_deref(),
        form.channel_name.as_deref(),
    )
    .await
    .map_err(reject)?;
    Ok(Json(response))
}

pub(crate) async fn create_guild(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    Json(req): Json<CreateGuildRequest>,
) -> ApiResult<Json<GuildSummary>> {
    let guild = server_api::create_guild(api(&state), user.user_id, &req.name)
        .await
        .map_err(reject)?;
    Ok(Json(guild))
}

pub(crate) async fn list_guilds(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
) -> ApiResult<Json<Vec<GuildSummary>>> {
    let guilds = server_api::list_guilds(api(&state), user.user_id)
        .await
        .map_err(reject)?;
    Ok(Json(guilds))
}

pub(crate) async fn join_guild(
    State(state): State<Arc<AppState>>,
    CurrentUser(user): CurrentUser,
    Json(req): Json<JoinGuildRequest>,
) -> ApiResult<Json<GuildSummary>> {
    let guild = server_api::join_guild(api(&state), user.user_id, &req.invite_code)
        .await
        .map_err(reject)?;
    Ok(Json(guild))
}

#[cfg(test)]
#[path = "tests/mod_tests.rs"]
mod tests;
