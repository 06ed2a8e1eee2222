use std::{collections::HashMap, fs, time::Duration};

use fanout::{ChannelAuthConfig, PublishPolicy, RetryConfig};
use serde::Deserialize;
use tracing::warn;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub server_bind: String,
    pub database_url: String,
    pub fanout_app_key: String,
    pub fanout_app_secret: String,
    pub channel_auth_ttl_seconds: i64,
    /// Zero disables retries.
    pub publish_max_retries: u32,
    pub publish_initial_backoff_ms: u64,
    pub max_body_bytes: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_bind: "127.0.0.1:8443".into(),
            database_url: "sqlite://./data/server.db".into(),
            fanout_app_key: "devkey".into(),
            fanout_app_secret: "devsecret".into(),
            channel_auth_ttl_seconds: 3600,
            publish_max_retries: 3,
            publish_initial_backoff_ms: 100,
            max_body_bytes: 1024 * 1024,
        }
    }
}

impl Settings {
    pub fn channel_auth(&self) -> ChannelAuthConfig {
        ChannelAuthConfig {
            app_key: self.fanout_app_key.clone(),
            app_secret: self.fanout_app_secret.clone(),
            ttl_seconds: self.channel_auth_ttl_seconds,
        }
    }

    pub fn publish_policy(&self) -> PublishPolicy {
        if self.publish_max_retries == 0 {
            return PublishPolicy::BestEffort;
        }
        PublishPolicy::Retry(RetryConfig {
            max_retries: self.publish_max_retries,
            initial_backoff: Duration::from_millis(self.publish_initial_backoff_ms),
            ..RetryConfig::default()
        })
    }
}

/// Defaults, then `server.toml`, then environment variables.
pub fn load_settings() -> Settings {
    let mut settings = Settings::default();
    if let Ok(raw) = fs::read_to_string("server.toml") {
        apply_file(&mut settings, &raw);
    }
    apply_env(&mut settings, |key| std::env::var(key).ok());
    settings
}

fn apply_file(settings: &mut Settings, raw: &str) {
    let file_cfg = match toml::from_str::<HashMap<String, toml::Value>>(raw) {
        Ok(file_cfg) => file_cfg,
        Err(error) => {
            warn!(%error, "ignoring unparseable server.toml");
            return;
        }
    };
    let text = |key: &str| -> Option<String> {
        file_cfg.get(key).map(|value| match value {
            toml::Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    };

    if let Some(v) = text("bind_addr") {
        settings.server_bind = v;
    }
    if let Some(v) = text("database_url") {
        settings.database_url = v;
    }
    if let Some(v) = text("fanout_app_key") {
        settings.fanout_app_key = v;
    }
    if let Some(v) = text("fanout_app_secret") {
        settings.fanout_app_secret = v;
    }
    set_parsed(&mut settings.channel_auth_ttl_seconds, text("channel_auth_ttl_seconds"));
    set_parsed(&mut settings.publish_max_retries, text("publish_max_retries"));
    set_parsed(
        &mut settings.publish_initial_backoff_ms,
        text("publish_initial_backoff_ms"),
    );
    set_parsed(&mut settings.max_body_bytes, text("max_body_bytes"));
}

fn apply_env(settings: &mut Settings, var: impl Fn(&str) -> Option<String>) {
    // later names win
    for key in ["SERVER_BIND", "APP__BIND_ADDR"] {
        if let Some(v) = var(key) {
            settings.server_bind = v;
        }
    }
    for key in ["DATABASE_URL", "APP__DATABASE_URL"] {
        if let Some(v) = var(key) {
            settings.database_url = v;
        }
    }
    if let Some(v) = var("APP__FANOUT_APP_KEY") {
        settings.fanout_app_key = v;
    }
    if let Some(v) = var("APP__FANOUT_APP_SECRET") {
        settings.fanout_app_secret = v;
    }
    set_parsed(
        &mut settings.channel_auth_ttl_seconds,
        var("APP__CHANNEL_AUTH_TTL_SECONDS"),
    );
    set_parsed(&mut settings.publish_max_retries, var("APP__PUBLISH_MAX_RETRIES"));
    set_parsed(
        &mut settings.publish_initial_backoff_ms,
        var("APP__PUBLISH_INITIAL_BACKOFF_MS"),
    );
    set_parsed(&mut settings.max_body_bytes, var("APP__MAX_BODY_BYTES"));
}

fn set_parsed<T: std::str::FromStr>(slot: &mut T, raw: Option<String>) {
    let Some(raw) = raw else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(parsed) => *slot = parsed,
        Err(_) => warn!(value = %raw, "ignoring unparseable setting"),
    }
}

pub fn prepare_database_url(raw_database_url: &str) -> String {
    normalize_database_url(raw_database_url)
}

fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return Settings::default().database_url;
    }
    if raw_database_url.starts_with("sqlite::memory:") {
        return raw_database_url.to_string();
    }
    if let Some(path) = raw_database_url.strip_prefix("sqlite://") {
        if has_drive_letter(path) {
            return format!("sqlite:{path}");
        }
        return raw_database_url.to_string();
    }
    if raw_database_url.contains("://") {
        return raw_database_url.to_string();
    }

    let path = raw_database_url
        .strip_prefix("sqlite:")
        .unwrap_or(raw_database_url)
        .replace('\\', "/");
    if has_drive_letter(&path) {
        format!("sqlite:{path}")
    } else {
        format!("sqlite://{path}")
    }
}

fn has_drive_letter(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 3 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' && bytes[2] == b'/'
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
