use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use shared::protocol::{ChannelAuthResponse, PresenceMember};
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct ChannelAuthConfig {
    pub app_key: String,
    pub app_secret: String,
    pub ttl_seconds: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelClaims {
    pub iss: String,
    pub sub: String,
    pub socket_id: String,
    pub channel: String,
    /// Serialized [`PresenceMember`], signed verbatim.
    pub channel_data: String,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Debug, Error)]
pub enum ChannelAuthError {
    #[error("malformed socket id: {0}")]
    MalformedSocketId(String),
    #[error("signature does not cover {0}")]
    Mismatch(&'static str),
    #[error("invalid channel data: {0}")]
    ChannelData(#[from] serde_json::Error),
    #[error("token error: {0}")]
    Token(#[from] jsonwebtoken::errors::Error),
}

/// Signs and checks presence-channel subscriptions for a single app key.
#[derive(Debug, Clone)]
pub struct ChannelAuthorizer {
    config: ChannelAuthConfig,
}

impl ChannelAuthorizer {
    pub fn new(config: ChannelAuthConfig) -> Self {
        Self { config }
    }

    pub fn app_key(&self) -> &str {
        &self.config.app_key
    }

    pub fn authorize(
        &self,
        socket_id: &str,
        channel: &str,
        member: &PresenceMember,
    ) -> Result<ChannelAuthResponse, ChannelAuthError> {
        if !is_valid_socket_id(socket_id) {
            return Err(ChannelAuthError::MalformedSocketId(socket_id.to_string()));
        }

        let channel_data = serde_json::to_string(member)?;
        let now = Utc::now();
        let claims = ChannelClaims {
            iss: self.config.app_key.clone(),
            sub: format!("user:{}", member.user_id.0),
            socket_id: socket_id.to_string(),
            channel: channel.to_string(),
            channel_data: channel_data.clone(),
            iat: now.timestamp(),
            exp: (now + Duration::seconds(self.config.ttl_seconds)).timestamp(),
        };
        let auth = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.config.app_secret.as_bytes()),
        )?;

        Ok(ChannelAuthResponse { auth, channel_data })
    }

    /// Checks that `auth` was issued for exactly this socket, channel and
    /// channel data, and returns the member it names.
    pub fn verify(
        &self,
        socket_id: &str,
        channel: &str,
        auth: &str,
        channel_data: &str,
    ) -> Result<PresenceMember, ChannelAuthError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[self.config.app_key.as_str()]);
        let claims = decode::<ChannelClaims>(
            auth,
            &DecodingKey::from_secret(self.config.app_secret.as_bytes()),
            &validation,
        )?
        .claims;

        if claims.socket_id != socket_id {
            return Err(ChannelAuthError::Mismatch("socket_id"));
        }
        if claims.channel != channel {
            return Err(ChannelAuthError::Mismatch("channel"));
        }
        if claims.channel_data != channel_data {
            return Err(ChannelAuthError::Mismatch("channel_data"));
        }

        let member: PresenceMember = serde_json::from_str(channel_data)?;
        if claims.sub != format!("user:{}", member.user_id.0) {
            return Err(ChannelAuthError::Mismatch("sub"));
        }
        Ok(member)
    }
}

/// Socket ids are two dot-separated decimal runs, e.g. `1234.5678`.
pub fn is_valid_socket_id(socket_id: &str) -> bool {
    let Some((left, right)) = socket_id.split_once('.') else {
        return false;
    };
    [left, right]
        .iter()
        .all(|part| !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit()))
}

#[cfg(test)]
#[path = "tests/auth_tests.rs"]
mod tests;
