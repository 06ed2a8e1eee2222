use chrono::Utc;
use shared::domain::{MessageId, MessageKind, Role, RoomKey};
use storage::{NewMessage, Storage};

#[tokio::test]
async fn guild_join_and_room_scoped_history_acceptance() {
    let temp_dir = tempfile::tempdir().expect("tempdir");
    let database_url = format!(
        "sqlite://{}",
        temp_dir
            .path()
            .join("acceptance.db")
            .to_string_lossy()
            .replace('\\', "/")
    );
    let storage = Storage::new(&database_url).await.expect("db");

    let alice = storage
        .upsert_user("acceptance-alice", Some("Alice"), None, None)
        .await
        .expect("alice");
    let bob = storage
        .upsert_user("acceptance-bob", None, None, Some("bob@example.com"))
        .await
        .expect("bob");

    let guild = storage
        .insert_guild("Test", alice, "C1C1C1")
        .await
        .expect("guild")
        .expect("created");
    let joined = storage
        .find_guild_by_invite_code("C1C1C1")
        .await
        .expect("lookup")
        .expect("guild exists");
    assert!(storage
        .insert_membership(joined.guild_id, bob, Role::Member)
        .await
        .expect("join"));

    assert_eq!(
        storage.find_membership(guild.guild_id, alice).await.expect("alice role"),
        Some(Role::Owner)
    );
    assert_eq!(
        storage.find_membership(guild.guild_id, bob).await.expect("bob role"),
        Some(Role::Member)
    );
    let bob_guilds = storage.list_guilds_for_user(bob).await.expect("bob guilds");
    assert_eq!(bob_guilds.len(), 1);
    assert_eq!(bob_guilds[0].0.name, "Test");

    storage
        .insert_message(NewMessage {
            id: MessageId::generate(),
            author_id: alice,
            author_name: "Alice".into(),
            guild_id: Some(guild.guild_id),
            kind: MessageKind::Text,
            content: "welcome".into(),
            file: None,
            poll: None,
            created_at: Utc::now(),
        })
        .await
        .expect("message");

    assert!(storage
        .find_messages_by_room(RoomKey::Global)
        .await
        .expect("global")
        .is_empty());
    let history = storage
        .find_messages_by_room(RoomKey::Guild(guild.guild_id))
        .await
        .expect("guild history");
    assert_eq!(history.len(), 1);
    assert!(history[0].message.seen_by.is_empty());

    // reopening the same file keeps the data
    drop(storage);
    let reopened = Storage::new(&database_url).await.expect("reopen");
    assert_eq!(
        reopened
            .find_messages_by_room(RoomKey::Guild(guild.guild_id))
            .await
            .expect("history after reopen")
            .len(),
        1
    );
}
