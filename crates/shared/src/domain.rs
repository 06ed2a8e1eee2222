use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

macro_rules! uuid_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn generate() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(GuildId);
uuid_newtype!(MessageId);
uuid_newtype!(PollOptionId);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    #[default]
    Text,
    File,
    Image,
    Poll,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::File => "file",
            MessageKind::Image => "image",
            MessageKind::Poll => "poll",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "text" => Some(MessageKind::Text),
            "file" => Some(MessageKind::File),
            "image" => Some(MessageKind::Image),
            "poll" => Some(MessageKind::Poll),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Owner,
    Admin,
    Member,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Owner => "owner",
            Role::Admin => "admin",
            Role::Member => "member",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "owner" => Role::Owner,
            "admin" => Role::Admin,
            _ => Role::Member,
        }
    }
}

pub const GLOBAL_ROOM: &str = "global";
const CHANNEL_PREFIX: &str = "presence-";
const GUILD_CHANNEL_PREFIX: &str = "presence-guild-";

/// Scoping unit for messages and the suffix of the room's channel name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomKey {
    Global,
    Guild(GuildId),
}

impl RoomKey {
    pub fn for_guild(guild_id: Option<GuildId>) -> Self {
        guild_id.map_or(RoomKey::Global, RoomKey::Guild)
    }

    pub fn guild_id(self) -> Option<GuildId> {
        match self {
            RoomKey::Global => None,
            RoomKey::Guild(guild_id) => Some(guild_id),
        }
    }

    pub fn channel_name(self) -> String {
        match self {
            RoomKey::Global => format!("{CHANNEL_PREFIX}{GLOBAL_ROOM}"),
            RoomKey::Guild(guild_id) => format!("{GUILD_CHANNEL_PREFIX}{}", guild_id.0),
        }
    }

    /// Accepts only canonical names, so `presence-guild-007` is rejected
    /// rather than aliased onto guild 7's channel.
    pub fn from_channel_name(channel: &str) -> Option<Self> {
        if let Some(raw_id) = channel.strip_prefix(GUILD_CHANNEL_PREFIX) {
            return raw_id
                .parse::<i64>()
                .ok()
                .map(|id| RoomKey::Guild(GuildId(id)))
                .filter(|room| room.channel_name() == channel);
        }
        (channel.strip_prefix(CHANNEL_PREFIX) == Some(GLOBAL_ROOM)).then_some(RoomKey::Global)
    }
}

impl fmt::Display for RoomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoomKey::Global => f.write_str(GLOBAL_ROOM),
            RoomKey::Guild(guild_id) => write!(f, "{}", guild_id.0),
        }
    }
}

/// Identity record as handed over by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<String>,
    #[serde(default)]
    pub emails: Vec<String>,
}

impl UserProfile {
    /// Full name, then handle, then first email, then `"Anonymous"`.
    pub fn display_name(&self) -> String {
        let full_name = [self.first_name.as_deref(), self.last_name.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        if !full_name.is_empty() {
            return full_name;
        }

        self.handle
            .iter()
            .chain(self.emails.iter())
            .map(|candidate| candidate.trim())
            .find(|candidate| !candidate.is_empty())
            .unwrap_or("Anonymous")
            .to_string()
    }

    pub fn primary_email(&self) -> Option<&str> {
        self.emails
            .iter()
            .map(|email| email.trim())
            .find(|email| !email.is_empty())
    }
}
