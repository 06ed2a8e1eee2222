use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{GuildId, MessageId, MessageKind, PollOptionId, Role, RoomKey, UserId},
    error::ApiError,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileReference {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollOption {
    pub id: PollOptionId,
    pub text: String,
    #[serde(default)]
    pub votes: BTreeSet<UserId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollPayload {
    pub question: String,
    pub options: Vec<PollOption>,
}

impl PollPayload {
    pub fn total_votes(&self) -> usize {
        self.options.iter().map(|option| option.votes.len()).sum()
    }

    pub fn option(&self, option_id: PollOptionId) -> Option<&PollOption> {
        self.options.iter().find(|option| option.id == option_id)
    }

    pub fn voted_option(&self, user_id: UserId) -> Option<&PollOption> {
        self.options
            .iter()
            .find(|option| option.votes.contains(&user_id))
    }
}

/// Canonical message as stored by the server and fanned out to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub id: MessageId,
    pub author_id: UserId,
    pub author_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guild_id: Option<GuildId>,
    pub kind: MessageKind,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<FileReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll: Option<PollPayload>,
    #[serde(default)]
    pub seen_by: BTreeSet<UserId>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl MessagePayload {
    pub fn room(&self) -> RoomKey {
        RoomKey::for_guild(self.guild_id)
    }

    pub fn is_seen_by(&self, user_id: UserId) -> bool {
        self.seen_by.contains(&user_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuildSummary {
    pub guild_id: GuildId,
    pub name: String,
    pub owner_id: UserId,
    pub invite_code: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

/// Identity bound into a channel authorization and announced to other subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceMember {
    pub user_id: UserId,
    pub user_info: PresenceInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum ServerEvent {
    MessageCreated {
        message: MessagePayload,
    },
    MessageUpdated {
        message: MessagePayload,
    },
    MessageDeleted {
        message_id: MessageId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        guild_id: Option<GuildId>,
    },
    ConnectionEstablished {
        socket_id: String,
    },
    SubscriptionSucceeded {
        count: usize,
        members: Vec<PresenceMember>,
    },
    SubscriptionError {
        message: String,
    },
    MemberAdded {
        member: PresenceMember,
    },
    MemberRemoved {
        user_id: UserId,
    },
    Error(ApiError),
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::MessageCreated { .. } => "message-created",
            ServerEvent::MessageUpdated { .. } => "message-updated",
            ServerEvent::MessageDeleted { .. } => "message-deleted",
            ServerEvent::ConnectionEstablished { .. } => "connection-established",
            ServerEvent::SubscriptionSucceeded { .. } => "subscription-succeeded",
            ServerEvent::SubscriptionError { .. } => "subscription-error",
            ServerEvent::MemberAdded { .. } => "member-added",
            ServerEvent::MemberRemoved { .. } => "member-removed",
            ServerEvent::Error(_) => "error",
        }
    }
}

/// Server-to-client gateway frame. `channel` is absent for connection-level events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    pub event: ServerEvent,
}

/// Client-to-server gateway frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum GatewayCommand {
    Subscribe {
        channel: String,
        auth: String,
        channel_data: String,
    },
    Unsubscribe {
        channel: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub handle: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginResponse {
    pub user_id: UserId,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SendMessageRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guild_id: Option<GuildId>,
    #[serde(default)]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll_question: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub poll_options: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EditMessageRequest {
    pub id: MessageId,
    pub content: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MarkSeenRequest {
    #[serde(default)]
    pub message_ids: Vec<MessageId>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageStatusRequest {
    #[serde(default)]
    pub message_id: Option<MessageId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteRequest {
    pub message_id: MessageId,
    pub option_id: PollOptionId,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateGuildRequest {
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JoinGuildRequest {
    #[serde(default)]
    pub invite_code: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelAuthResponse {
    pub auth: String,
    pub channel_data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuccessResponse {
    pub success: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarkSeenResponse {
    pub success: bool,
    pub updated: usize,
}
