use super::*;

use std::{
    collections::HashMap,
    env, fs,
    time::{SystemTime, UNIX_EPOCH},
};

#[test]
fn normalizes_plain_file_path_to_sqlite_url() {
    assert_eq!(
        normalize_database_url("./data/test.db"),
        "sqlite://./data/test.db"
    );
    assert_eq!(normalize_database_url("  "), Settings::default().database_url);
    assert_eq!(normalize_database_url("sqlite::memory:"), "sqlite::memory:");
}

#[test]
fn keeps_windows_absolute_path_with_single_sqlite_colon() {
    assert_eq!(
        normalize_database_url("sqlite:C:\\Users\\alice\\test.db"),
        "sqlite:C:/Users/alice/test.db"
    );
    assert_eq!(
        normalize_database_url("C:\\Users\\alice\\test.db"),
        "sqlite:C:/Users/alice/test.db"
    );
    assert_eq!(
        normalize_database_url("sqlite://C:/Users/alice/test.db"),
        "sqlite:C:/Users/alice/test.db"
    );
}

#[test]
fn file_settings_override_defaults() {
    let mut settings = Settings::default();
    apply_file(
        &mut settings,
        r#"
bind_addr = "0.0.0.0:9000"
fanout_app_key = "filekey"
publish_max_retries = 0
channel_auth_ttl_seconds = "120"
"#,
    );
    assert_eq!(settings.server_bind, "0.0.0.0:9000");
    assert_eq!(settings.fanout_app_key, "filekey");
    assert_eq!(settings.channel_auth_ttl_seconds, 120);
    assert!(matches!(settings.publish_policy(), PublishPolicy::BestEffort));
}

#[test]
fn env_overrides_with_app_prefixed_names_winning() {
    let vars = HashMap::from([
        ("SERVER_BIND", "127.0.0.1:1"),
        ("APP__BIND_ADDR", "127.0.0.1:2"),
        ("DATABASE_URL", "sqlite::memory:"),
        ("APP__FANOUT_APP_SECRET", "prod-secret"),
        ("APP__PUBLISH_MAX_RETRIES", "7"),
        ("APP__PUBLISH_INITIAL_BACKOFF_MS", "25"),
        ("APP__CHANNEL_AUTH_TTL_SECONDS", "not-a-number"),
    ]);
    let mut settings = Settings::default();
    apply_env(&mut settings, |key| vars.get(key).map(|v| v.to_string()));

    assert_eq!(settings.server_bind, "127.0.0.1:2");
    assert_eq!(settings.database_url, "sqlite::memory:");
    assert_eq!(settings.channel_auth().app_secret, "prod-secret");
    assert_eq!(settings.channel_auth_ttl_seconds, 3600);
    let PublishPolicy::Retry(retry) = settings.publish_policy() else {
        panic!("expected retry policy");
    };
    assert_eq!(retry.max_retries, 7);
    assert_eq!(retry.initial_backoff, Duration::from_millis(25));
}

#[tokio::test]
async fn prepared_database_url_creates_openable_sqlite_file() {
    let suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();

    let temp_root = env::temp_dir().join(format!("guild_chat_server_open_test_{suffix}"));
    let db_path = temp_root.join("nested").join("server.db");

    let prepared = prepare_database_url(db_path.to_string_lossy().as_ref());
    let storage = storage::Storage::new(&prepared).await.expect("open sqlite");
    drop(storage);

    assert!(
        db_path.exists(),
        "database file should be created: {}",
        db_path.display()
    );

    fs::remove_dir_all(temp_root).expect("cleanup");
}
