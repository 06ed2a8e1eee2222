//! Event fanout: publishes lifecycle events on room channels and authorizes
//! presence subscriptions.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use rand::Rng;
use shared::{domain::RoomKey, protocol::ServerEvent};
use thiserror::Error;
use tracing::{debug, warn};

mod auth;
mod hub;

pub use auth::{is_valid_socket_id, ChannelAuthConfig, ChannelAuthError, ChannelAuthorizer, ChannelClaims};
pub use hub::{ChannelHub, HubError, SocketId};

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("publisher unavailable: {0}")]
    Unavailable(String),
    #[error("publish to {channel} failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        channel: String,
        attempts: u32,
        last_error: String,
    },
}

#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, channel: &str, event: &ServerEvent) -> Result<(), PublishError>;
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Attempts after the first one.
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
    /// Scale each delay by a random factor in 0.7..=1.3.
    pub jitter: bool,
}

impl RetryConfig {
    /// The delay to sleep before the next attempt.
    pub fn delay(&self, backoff: Duration) -> Duration {
        with_jitter(backoff, self.jitter)
    }

    pub fn next_backoff(&self, backoff: Duration) -> Duration {
        Duration::from_millis(
            ((backoff.as_millis() as f64 * self.backoff_multiplier)
                .min(self.max_backoff.as_millis() as f64)) as u64,
        )
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub enum PublishPolicy {
    #[default]
    BestEffort,
    Retry(RetryConfig),
}

/// Room-scoped publishing front for the lifecycle engine.
#[derive(Clone)]
pub struct Fanout {
    publisher: Arc<dyn Publisher>,
    policy: PublishPolicy,
}

impl Fanout {
    pub fn new(publisher: Arc<dyn Publisher>, policy: PublishPolicy) -> Self {
        Self { publisher, policy }
    }

    pub fn policy(&self) -> &PublishPolicy {
        &self.policy
    }

    pub async fn publish(&self, room: RoomKey, event: &ServerEvent) -> Result<(), PublishError> {
        let channel = room.channel_name();
        match &self.policy {
            PublishPolicy::BestEffort => self.publisher.publish(&channel, event).await,
            PublishPolicy::Retry(config) => self.publish_with_retry(&channel, event, config).await,
        }
    }

    /// Publishes and logs failures; the caller's committed state stands either way.
    pub async fn publish_or_log(&self, room: RoomKey, event: &ServerEvent) {
        match self.publish(room, event).await {
            Ok(()) => debug!(%room, event = event.name(), "published"),
            Err(error) => warn!(%room, event = event.name(), %error, "fanout publish failed"),
        }
    }

    async fn publish_with_retry(
        &self,
        channel: &str,
        event: &ServerEvent,
        config: &RetryConfig,
    ) -> Result<(), PublishError> {
        let mut attempt = 0;
        let mut backoff = config.initial_backoff;

        loop {
            match self.publisher.publish(channel, event).await {
                Ok(()) => return Ok(()),
                Err(error) => {
                    attempt += 1;
                    if attempt > config.max_retries {
                        return Err(PublishError::RetriesExhausted {
                            channel: channel.to_string(),
                            attempts: attempt,
                            last_error: error.to_string(),
                        });
                    }

                    let delay = config.delay(backoff);
                    warn!(
                        channel,
                        attempt,
                        max_retries = config.max_retries,
                        ?delay,
                        %error,
                        "publish failed, retrying"
                    );
                    tokio::time::sleep(delay).await;

                    backoff = config.next_backoff(backoff);
                }
            }
        }
    }
}

fn with_jitter(delay: Duration, jitter: bool) -> Duration {
    if !jitter {
        return delay;
    }
    let factor = rand::thread_rng().gen_range(0.7..=1.3);
    Duration::from_millis((delay.as_millis() as f64 * factor) as u64)
}
