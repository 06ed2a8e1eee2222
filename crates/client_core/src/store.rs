use shared::{
    domain::{GuildId, MessageId, RoomKey, UserId},
    protocol::{GuildSummary, MessagePayload, ServerEvent},
};

/// Client-side view of the active room: its messages in arrival order plus
/// the caller's guild list.
///
/// Reducers are idempotent so that an optimistic local write and the matching
/// fanout event can both be applied without duplicating the message.
#[derive(Debug, Clone)]
pub struct ChatStore {
    room: RoomKey,
    messages: Vec<MessagePayload>,
    guilds: Vec<GuildSummary>,
    /// Lifecycle events held back while the room's history is being fetched.
    pending: Option<Vec<ServerEvent>>,
}

impl Default for ChatStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ChatStore {
    pub fn new() -> Self {
        Self {
            room: RoomKey::Global,
            messages: Vec::new(),
            guilds: Vec::new(),
            pending: None,
        }
    }

    pub fn room(&self) -> RoomKey {
        self.room
    }

    pub fn messages(&self) -> &[MessagePayload] {
        &self.messages
    }

    pub fn message(&self, id: MessageId) -> Option<&MessagePayload> {
        self.messages.iter().find(|message| message.id == id)
    }

    /// Appends `message` unless one with the same id is already present.
    pub fn add(&mut self, message: MessagePayload) -> bool {
        if self.message(message.id).is_some() {
            return false;
        }
        self.messages.push(message);
        true
    }

    /// Replaces the message list wholesale, keeping the first copy of any
    /// repeated id, then replays events held back by [`Self::begin_loading`].
    pub fn set_messages(&mut self, messages: Vec<MessagePayload>) {
        self.messages.clear();
        for message in messages {
            self.add(message);
        }
        self.finish_loading();
    }

    /// Starts holding back lifecycle events until the next
    /// [`Self::set_messages`] or [`Self::finish_loading`]. Events that race a
    /// history fetch are then applied on top of it instead of being lost.
    pub fn begin_loading(&mut self) {
        self.pending = Some(Vec::new());
    }

    pub fn is_loading(&self) -> bool {
        self.pending.is_some()
    }

    /// Applies held-back events in arrival order.
    pub fn finish_loading(&mut self) {
        for event in self.pending.take().unwrap_or_default() {
            self.apply_event(&event);
        }
    }

    /// Overwrites the stored copy with the canonical one. Unknown ids are dropped.
    pub fn update(&mut self, message: MessagePayload) -> bool {
        match self.messages.iter_mut().find(|stored| stored.id == message.id) {
            Some(stored) => {
                *stored = message;
                true
            }
            None => false,
        }
    }

    /// Applies a local partial edit to one message. Unknown ids are dropped.
    pub fn update_with(&mut self, id: MessageId, apply: impl FnOnce(&mut MessagePayload)) -> bool {
        match self.messages.iter_mut().find(|stored| stored.id == id) {
            Some(stored) => {
                apply(stored);
                true
            }
            None => false,
        }
    }

    pub fn delete(&mut self, id: MessageId) -> bool {
        let before = self.messages.len();
        self.messages.retain(|message| message.id != id);
        self.messages.len() != before
    }

    pub fn guilds(&self) -> &[GuildSummary] {
        &self.guilds
    }

    pub fn set_guilds(&mut self, guilds: Vec<GuildSummary>) {
        self.guilds = guilds;
    }

    pub fn add_guild(&mut self, guild: GuildSummary) -> bool {
        if self.guilds.iter().any(|g| g.guild_id == guild.guild_id) {
            return false;
        }
        self.guilds.push(guild);
        true
    }

    pub fn current_guild(&self) -> Option<&GuildSummary> {
        let guild_id = self.room.guild_id()?;
        self.guilds.iter().find(|g| g.guild_id == guild_id)
    }

    pub fn current_guild_id(&self) -> Option<GuildId> {
        self.room.guild_id()
    }

    /// Discards everything known about the previous room.
    pub fn switch_room(&mut self, room: RoomKey) {
        self.room = room;
        self.messages.clear();
        self.pending = None;
    }

    /// Reduces one lifecycle event into the store. Events for other rooms
    /// (late deliveries from a torn-down subscription) are ignored; while
    /// loading, events for this room are queued and `false` is returned.
    pub fn apply_event(&mut self, event: &ServerEvent) -> bool {
        if let Some(pending) = self.pending.as_mut() {
            if event_room(event) == Some(self.room) {
                pending.push(event.clone());
            }
            return false;
        }
        match event {
            ServerEvent::MessageCreated { message } if message.room() == self.room => {
                self.add(message.clone())
            }
            ServerEvent::MessageUpdated { message } if message.room() == self.room => {
                self.update(message.clone())
            }
            ServerEvent::MessageDeleted {
                message_id,
                guild_id,
            } if RoomKey::for_guild(*guild_id) == self.room => self.delete(*message_id),
            _ => false,
        }
    }

    /// Messages the viewer has not acknowledged yet, excluding their own.
    pub fn unseen_ids(&self, viewer: UserId) -> Vec<MessageId> {
        self.messages
            .iter()
            .filter(|message| message.author_id != viewer && !message.is_seen_by(viewer))
            .map(|message| message.id)
            .collect()
    }
}

fn event_room(event: &ServerEvent) -> Option<RoomKey> {
    match event {
        ServerEvent::MessageCreated { message } | ServerEvent::MessageUpdated { message } => {
            Some(message.room())
        }
        ServerEvent::MessageDeleted { guild_id, .. } => Some(RoomKey::for_guild(*guild_id)),
        _ => None,
    }
}

#[cfg(test)]
#[path = "tests/store_tests.rs"]
mod tests;
