use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::atomic::{AtomicU64, Ordering},
};

use async_trait::async_trait;
use shared::{
    domain::UserId,
    protocol::{ChannelFrame, PresenceMember, ServerEvent},
};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

use crate::{PublishError, Publisher};

pub type SocketId = String;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HubError {
    #[error("unknown socket {0}")]
    UnknownSocket(SocketId),
}

struct Connection {
    outbound: mpsc::UnboundedSender<ChannelFrame>,
    channels: HashSet<String>,
}

#[derive(Default)]
struct ChannelMembers {
    sockets: HashMap<SocketId, PresenceMember>,
}

impl ChannelMembers {
    fn sockets_for(&self, user_id: UserId) -> usize {
        self.sockets
            .values()
            .filter(|member| member.user_id == user_id)
            .count()
    }

    /// One entry per user, ordered by user id.
    fn distinct_members(&self) -> Vec<PresenceMember> {
        let mut by_user = BTreeMap::new();
        for member in self.sockets.values() {
            by_user.entry(member.user_id).or_insert_with(|| member.clone());
        }
        by_user.into_values().collect()
    }
}

#[derive(Default)]
struct HubState {
    connections: HashMap<SocketId, Connection>,
    channels: HashMap<String, ChannelMembers>,
}

impl HubState {
    fn send(&self, socket_id: &str, frame: ChannelFrame) {
        if let Some(connection) = self.connections.get(socket_id) {
            // a closed receiver means the gateway task is tearing down
            let _ = connection.outbound.send(frame);
        }
    }

    fn broadcast(&self, channel: &str, event: &ServerEvent, skip: Option<&str>) -> usize {
        let Some(members) = self.channels.get(channel) else {
            return 0;
        };
        let mut delivered = 0;
        for socket_id in members.sockets.keys() {
            if Some(socket_id.as_str()) == skip {
                continue;
            }
            self.send(
                socket_id,
                ChannelFrame {
                    channel: Some(channel.to_string()),
                    event: event.clone(),
                },
            );
            delivered += 1;
        }
        delivered
    }

    fn leave(&mut self, socket_id: &str, channel: &str) {
        let Some(members) = self.channels.get_mut(channel) else {
            return;
        };
        let Some(member) = members.sockets.remove(socket_id) else {
            return;
        };
        let last_socket = members.sockets_for(member.user_id) == 0;
        let now_empty = members.sockets.is_empty();
        if now_empty {
            self.channels.remove(channel);
        } else if last_socket {
            self.broadcast(
                channel,
                &ServerEvent::MemberRemoved {
                    user_id: member.user_id,
                },
                None,
            );
        }
        if let Some(connection) = self.connections.get_mut(socket_id) {
            connection.channels.remove(channel);
        }
    }
}

/// In-process presence broker. Each connected socket gets an outbound queue;
/// presence channels track which user every subscribed socket belongs to.
pub struct ChannelHub {
    state: Mutex<HubState>,
    next_socket: AtomicU64,
}

impl Default for ChannelHub {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelHub {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HubState::default()),
            next_socket: AtomicU64::new(1),
        }
    }

    /// Registers a socket and queues its `connection-established` frame.
    pub async fn connect(&self) -> (SocketId, mpsc::UnboundedReceiver<ChannelFrame>) {
        let sequence = self.next_socket.fetch_add(1, Ordering::Relaxed);
        let socket_id = format!("{}.{}", sequence, rand::random::<u32>());
        let (outbound, inbound) = mpsc::unbounded_channel();
        let _ = outbound.send(ChannelFrame {
            channel: None,
            event: ServerEvent::ConnectionEstablished {
                socket_id: socket_id.clone(),
            },
        });

        let mut state = self.state.lock().await;
        state.connections.insert(
            socket_id.clone(),
            Connection {
                outbound,
                channels: HashSet::new(),
            },
        );
        debug!(%socket_id, "socket connected");
        (socket_id, inbound)
    }

    /// Adds the socket to `channel`. The socket receives the member snapshot;
    /// other subscribers hear `member-added` only for the user's first socket.
    pub async fn subscribe(
        &self,
        socket_id: &str,
        channel: &str,
        member: PresenceMember,
    ) -> Result<(), HubError> {
        let mut state = self.state.lock().await;
        let Some(connection) = state.connections.get_mut(socket_id) else {
            return Err(HubError::UnknownSocket(socket_id.to_string()));
        };
        connection.channels.insert(channel.to_string());

        let members = state.channels.entry(channel.to_string()).or_default();
        let first_socket_for_user = members.sockets_for(member.user_id) == 0;
        members.sockets.insert(socket_id.to_string(), member.clone());
        let snapshot = members.distinct_members();

        state.send(
            socket_id,
            ChannelFrame {
                channel: Some(channel.to_string()),
                event: ServerEvent::SubscriptionSucceeded {
                    count: snapshot.len(),
                    members: snapshot,
                },
            },
        );
        if first_socket_for_user {
            state.broadcast(
                channel,
                &ServerEvent::MemberAdded { member },
                Some(socket_id),
            );
        }
        info!(%socket_id, channel, "subscribed");
        Ok(())
    }

    /// Queues a frame for one socket, e.g. a `subscription-error`.
    pub async fn send_to(&self, socket_id: &str, frame: ChannelFrame) -> Result<(), HubError> {
        let state = self.state.lock().await;
        if !state.connections.contains_key(socket_id) {
            return Err(HubError::UnknownSocket(socket_id.to_string()));
        }
        state.send(socket_id, frame);
        Ok(())
    }

    pub async fn unsubscribe(&self, socket_id: &str, channel: &str) {
        let mut state = self.state.lock().await;
        state.leave(socket_id, channel);
        debug!(%socket_id, channel, "unsubscribed");
    }

    /// Drops the socket and leaves every channel it joined.
    pub async fn disconnect(&self, socket_id: &str) {
        let mut state = self.state.lock().await;
        let channels: Vec<String> = state
            .connections
            .get(socket_id)
            .map(|connection| connection.channels.iter().cloned().collect())
            .unwrap_or_default();
        for channel in channels {
            state.leave(socket_id, &channel);
        }
        state.connections.remove(socket_id);
        debug!(%socket_id, "socket disconnected");
    }

    /// Distinct users currently present on `channel`.
    pub async fn presence_count(&self, channel: &str) -> usize {
        let state = self.state.lock().await;
        state
            .channels
            .get(channel)
            .map(|members| members.distinct_members().len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl Publisher for ChannelHub {
    async fn publish(&self, channel: &str, event: &ServerEvent) -> Result<(), PublishError> {
        let state = self.state.lock().await;
        let delivered = state.broadcast(channel, event, None);
        debug!(channel, event = event.name(), delivered, "hub delivered event");
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/hub_tests.rs"]
mod tests;
