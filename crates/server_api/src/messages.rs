use std::{collections::HashSet, time::Duration};

use chrono::Utc;
use shared::{
    domain::{GuildId, MessageId, MessageKind, PollOptionId, UserId, UserProfile},
    error::{ApiError, ErrorCode},
    protocol::{
        EditMessageRequest, FileReference, MessagePayload, PollOption, PollPayload,
        SendMessageRequest, ServerEvent,
    },
};
use fanout::RetryConfig;
use storage::{MessagePatch, NewMessage, UpdateOutcome};
use tracing::{debug, info, warn};

use crate::{
    internal,
    rooms::{ensure_room_member, resolve_room},
    ApiContext,
};

/// Backoff for version-guarded writes. A write only goes stale when another
/// write to the same row committed, so the budget bounds tolerated contention.
pub const WRITE_RETRY: RetryConfig = RetryConfig {
    max_retries: 63,
    initial_backoff: Duration::from_millis(2),
    max_backoff: Duration::from_millis(40),
    backoff_multiplier: 2.0,
    jitter: true,
};

enum Applied {
    Changed(MessagePayload),
    Unchanged(MessagePayload),
}

/// Read-modify-write on one message in a room `actor` belongs to. `plan` sees
/// the current row and returns the patch to apply, or `None` when nothing
/// needs to change.
async fn apply_with_retry<F>(
    ctx: &ApiContext,
    actor: UserId,
    message_id: MessageId,
    mut plan: F,
) -> Result<Applied, ApiError>
where
    F: FnMut(&MessagePayload) -> Result<Option<MessagePatch>, ApiError>,
{
    let mut backoff = WRITE_RETRY.initial_backoff;
    let mut member_checked = false;
    for attempt in 0..=WRITE_RETRY.max_retries {
        let stored = ctx
            .storage
            .find_message(message_id)
            .await
            .map_err(internal)?
            .ok_or_else(|| ApiError::not_found("message not found"))?;
        if !member_checked {
            ensure_room_member(ctx, actor, stored.message.room()).await?;
            member_checked = true;
        }
        let Some(patch) = plan(&stored.message)? else {
            return Ok(Applied::Unchanged(stored.message));
        };
        match ctx
            .storage
            .update_message(message_id, stored.version, &patch)
            .await
            .map_err(internal)?
        {
            UpdateOutcome::Updated(updated) => return Ok(Applied::Changed(updated.message)),
            UpdateOutcome::Missing => return Err(ApiError::not_found("message not found")),
            UpdateOutcome::Stale => {
                let delay = WRITE_RETRY.delay(backoff);
                debug!(%message_id, attempt, ?delay, "concurrent write, reloading");
                tokio::time::sleep(delay).await;
                backoff = WRITE_RETRY.next_backoff(backoff);
            }
        }
    }
    warn!(%message_id, "write retries exhausted");
    Err(ApiError::conflict("message is being modified concurrently"))
}

pub async fn send_message(
    ctx: &ApiContext,
    author: &UserProfile,
    request: SendMessageRequest,
) -> Result<MessagePayload, ApiError> {
    let (content, file, poll) = validate_draft(&request)?;
    let room = resolve_room(ctx, author.user_id, request.guild_id).await?;

    let stored = ctx
        .storage
        .insert_message(NewMessage {
            id: MessageId::generate(),
            author_id: author.user_id,
            author_name: author.display_name(),
            guild_id: room.guild_id(),
            kind: request.kind,
            content,
            file,
            poll,
            created_at: Utc::now(),
        })
        .await
        .map_err(internal)?;
    let message = stored.message;
    info!(message_id = %message.id, %room, kind = message.kind.as_str(), "message created");

    ctx.fanout
        .publish_or_log(
            room,
            &ServerEvent::MessageCreated {
                message: message.clone(),
            },
        )
        .await;
    Ok(message)
}

type Draft = (String, Option<FileReference>, Option<PollPayload>);

fn validate_draft(request: &SendMessageRequest) -> Result<Draft, ApiError> {
    let content = request.content.as_deref().unwrap_or_default().trim().to_string();
    match request.kind {
        MessageKind::Text => {
            if content.is_empty() {
                return Err(ApiError::validation("content is required"));
            }
            Ok((content, None, None))
        }
        MessageKind::File | MessageKind::Image => {
            let url = request
                .file_url
                .as_deref()
                .map(str::trim)
                .filter(|url| !url.is_empty())
                .ok_or_else(|| ApiError::validation("file_url is required"))?;
            let name = request
                .file_name
                .as_deref()
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_string);
            let file = FileReference {
                url: url.to_string(),
                name,
            };
            Ok((content, Some(file), None))
        }
        MessageKind::Poll => {
            let question = request
                .poll_question
                .as_deref()
                .map(str::trim)
                .filter(|question| !question.is_empty())
                .ok_or_else(|| ApiError::validation("poll question is required"))?;
            let options: Vec<PollOption> = request
                .poll_options
                .iter()
                .map(|text| text.trim())
                .filter(|text| !text.is_empty())
                .map(|text| PollOption {
                    id: PollOptionId::generate(),
                    text: text.to_string(),
                    votes: Default::default(),
                })
                .collect();
            if options.len() < 2 {
                return Err(ApiError::validation("a poll needs at least two options"));
            }
            let content = if content.is_empty() {
                question.to_string()
            } else {
                content
            };
            let poll = PollPayload {
                question: question.to_string(),
                options,
            };
            Ok((content, None, Some(poll)))
        }
    }
}

pub async fn list_messages(
    ctx: &ApiContext,
    viewer: &UserProfile,
    guild_id: Option<GuildId>,
) -> Result<Vec<MessagePayload>, ApiError> {
    let room = resolve_room(ctx, viewer.user_id, guild_id).await?;
    let messages = ctx
        .storage
        .find_messages_by_room(room)
        .await
        .map_err(internal)?;
    Ok(messages.into_iter().map(|stored| stored.message).collect())
}

pub async fn edit_message(
    ctx: &ApiContext,
    editor: &UserProfile,
    request: EditMessageRequest,
) -> Result<MessagePayload, ApiError> {
    let content = request.content.trim().to_string();
    let applied = apply_with_retry(ctx, editor.user_id, request.id, |message| {
        if message.author_id != editor.user_id {
            return Err(ApiError::forbidden("only the author can edit a message"));
        }
        if message.kind != MessageKind::Text {
            return Err(ApiError::validation("only text messages can be edited"));
        }
        if content.is_empty() {
            return Err(ApiError::validation("content is required"));
        }
        Ok(Some(MessagePatch {
            content: Some(content.clone()),
            updated_at: Some(Utc::now()),
            ..MessagePatch::default()
        }))
    })
    .await?;

    let (Applied::Changed(message) | Applied::Unchanged(message)) = applied;
    ctx.fanout
        .publish_or_log(
            message.room(),
            &ServerEvent::MessageUpdated {
                message: message.clone(),
            },
        )
        .await;
    Ok(message)
}

pub async fn delete_message(
    ctx: &ApiContext,
    actor: &UserProfile,
    message_id: Option<MessageId>,
) -> Result<(), ApiError> {
    let message_id = message_id.ok_or_else(|| ApiError::validation("message id is required"))?;
    let message = ctx
        .storage
        .find_message(message_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::not_found("message not found"))?
        .message;

    if !may_delete(ctx, actor.user_id, &message).await? {
        return Err(ApiError::forbidden(
            "only the author or the guild owner can delete a message",
        ));
    }
    if !ctx
        .storage
        .delete_message(message_id)
        .await
        .map_err(internal)?
    {
        return Err(ApiError::not_found("message not found"));
    }
    info!(%message_id, room = %message.room(), "message deleted");

    ctx.fanout
        .publish_or_log(
            message.room(),
            &ServerEvent::MessageDeleted {
                message_id,
                guild_id: message.guild_id,
            },
        )
        .await;
    Ok(())
}

async fn may_delete(
    ctx: &ApiContext,
    actor: UserId,
    message: &MessagePayload,
) -> Result<bool, ApiError> {
    if message.author_id == actor {
        return Ok(true);
    }
    let Some(guild_id) = message.guild_id else {
        return Ok(false);
    };
    let guild = ctx.storage.find_guild(guild_id).await.map_err(internal)?;
    Ok(guild.is_some_and(|guild| guild.owner_id == actor))
}

fn seen_patch(viewer: UserId, message: &MessagePayload) -> Option<MessagePatch> {
    if message.author_id == viewer || message.is_seen_by(viewer) {
        return None;
    }
    let mut seen_by = message.seen_by.clone();
    seen_by.insert(viewer);
    Some(MessagePatch {
        seen_by: Some(seen_by),
        ..MessagePatch::default()
    })
}

/// Marks every listed message as seen by `viewer`, returning those that changed.
/// Missing ids and ids in rooms the viewer cannot read are skipped; the call
/// fails only when none of the ids were usable.
pub async fn mark_seen(
    ctx: &ApiContext,
    viewer: &UserProfile,
    message_ids: &[MessageId],
) -> Result<Vec<MessagePayload>, ApiError> {
    if message_ids.is_empty() {
        return Err(ApiError::validation("message_ids must not be empty"));
    }

    let mut requested = HashSet::new();
    let mut ids = message_ids.to_vec();
    ids.retain(|id| requested.insert(*id));
    let mut found = 0;
    let mut denied = 0;
    let mut updated = Vec::new();
    for message_id in ids {
        match apply_with_retry(ctx, viewer.user_id, message_id, |message| {
            Ok(seen_patch(viewer.user_id, message))
        })
        .await
        {
            Ok(Applied::Changed(message)) => {
                found += 1;
                ctx.fanout
                    .publish_or_log(
                        message.room(),
                        &ServerEvent::MessageUpdated {
                            message: message.clone(),
                        },
                    )
                    .await;
                updated.push(message);
            }
            Ok(Applied::Unchanged(_)) => found += 1,
            Err(err) if err.code == ErrorCode::NotFound => {
                debug!(%message_id, "skipping missing message");
            }
            Err(err) if err.code == ErrorCode::Forbidden => {
                debug!(%message_id, "skipping message outside the viewer's rooms");
                denied += 1;
            }
            Err(err) if err.code == ErrorCode::Conflict => {
                warn!(%message_id, "skipping contended message");
                found += 1;
            }
            Err(err) => return Err(err),
        }
    }

    match (found, denied) {
        (0, 0) => Err(ApiError::not_found("message not found")),
        (0, _) => Err(ApiError::forbidden("user is not a member")),
        _ => Ok(updated),
    }
}

/// Single-message variant of [`mark_seen`]; returns whether anything changed.
pub async fn mark_seen_one(
    ctx: &ApiContext,
    viewer: &UserProfile,
    message_id: Option<MessageId>,
) -> Result<bool, ApiError> {
    let message_id = message_id.ok_or_else(|| ApiError::validation("message_id is required"))?;
    let applied = apply_with_retry(ctx, viewer.user_id, message_id, |message| {
        Ok(seen_patch(viewer.user_id, message))
    })
    .await?;
    match applied {
        Applied::Changed(message) => {
            ctx.fanout
                .publish_or_log(
                    message.room(),
                    &ServerEvent::MessageUpdated { message },
                )
                .await;
            Ok(true)
        }
        Applied::Unchanged(_) => Ok(false),
    }
}

/// Single-choice vote; switching options moves the voter.
pub async fn vote(
    ctx: &ApiContext,
    voter: &UserProfile,
    message_id: MessageId,
    option_id: PollOptionId,
) -> Result<MessagePayload, ApiError> {
    let applied = apply_with_retry(ctx, voter.user_id, message_id, |message| {
        let poll = match (&message.kind, &message.poll) {
            (MessageKind::Poll, Some(poll)) => poll,
            _ => return Err(ApiError::validation("message is not a poll")),
        };
        if poll.option(option_id).is_none() {
            return Err(ApiError::validation("unknown poll option"));
        }
        if poll
            .voted_option(voter.user_id)
            .is_some_and(|current| current.id == option_id)
        {
            return Ok(None);
        }

        let options = poll
            .options
            .iter()
            .cloned()
            .map(|mut option| {
                if option.id == option_id {
                    option.votes.insert(voter.user_id);
                } else {
                    option.votes.remove(&voter.user_id);
                }
                option
            })
            .collect();
        Ok(Some(MessagePatch {
            poll_options: Some(options),
            ..MessagePatch::default()
        }))
    })
    .await?;

    match applied {
        Applied::Changed(message) => {
            ctx.fanout
                .publish_or_log(
                    message.room(),
                    &ServerEvent::MessageUpdated {
                        message: message.clone(),
                    },
                )
                .await;
            Ok(message)
        }
        Applied::Unchanged(message) => Ok(message),
    }
}

#[cfg(test)]
#[path = "tests/messages_tests.rs"]
mod tests;
