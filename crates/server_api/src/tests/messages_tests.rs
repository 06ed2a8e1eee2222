use super::*;
use crate::{
    current_user,
    test_support::{harness, harness_with, Harness, RecordingPublisher},
};
use shared::domain::RoomKey;

async fn profiles(h: &Harness) -> (UserProfile, UserProfile) {
    let alice = current_user(&h.ctx, Some(h.alice)).await.expect("alice");
    let bob = current_user(&h.ctx, Some(h.bob)).await.expect("bob");
    (alice, bob)
}

fn text(content: &str) -> SendMessageRequest {
    SendMessageRequest {
        content: Some(content.into()),
        ..SendMessageRequest::default()
    }
}

fn coffee_poll() -> SendMessageRequest {
    SendMessageRequest {
        kind: MessageKind::Poll,
        poll_question: Some("Coffee?".into()),
        poll_options: vec!["Yes".into(), "  ".into(), "No".into()],
        ..SendMessageRequest::default()
    }
}

#[tokio::test]
async fn send_text_resolves_author_name_and_publishes_on_room_channel() {
    let h = harness().await;
    let (alice, bob) = profiles(&h).await;

    let message = send_message(&h.ctx, &alice, text("  hello  "))
        .await
        .expect("send");
    assert_eq!(message.content, "hello");
    assert_eq!(message.author_name, "Alice Liddell");
    assert!(message.seen_by.is_empty());
    assert_eq!(message.room(), RoomKey::Global);

    let from_bob = send_message(&h.ctx, &bob, text("hey")).await.expect("send");
    // no name parts, so the handle wins over the email
    assert_eq!(from_bob.author_name, "bob");

    let published = h.published().await;
    assert_eq!(published.len(), 2);
    assert_eq!(published[0].0, "presence-global");
    assert_eq!(
        published[0].1,
        ServerEvent::MessageCreated {
            message: message.clone()
        }
    );
}

#[tokio::test]
async fn send_validates_payload_per_kind() {
    let h = harness().await;
    let (alice, _) = profiles(&h).await;

    let err = send_message(&h.ctx, &alice, text("   "))
        .await
        .expect_err("blank text");
    assert_eq!(err.code, ErrorCode::Validation);

    let mut one_option = coffee_poll();
    one_option.poll_options = vec!["Yes".into(), " ".into()];
    let err = send_message(&h.ctx, &alice, one_option)
        .await
        .expect_err("one real option");
    assert_eq!(err.code, ErrorCode::Validation);

    let file_without_url = SendMessageRequest {
        kind: MessageKind::Image,
        file_name: Some("cat.png".into()),
        ..SendMessageRequest::default()
    };
    let err = send_message(&h.ctx, &alice, file_without_url)
        .await
        .expect_err("file url required");
    assert_eq!(err.code, ErrorCode::Validation);

    let poll = send_message(&h.ctx, &alice, coffee_poll())
        .await
        .expect("poll");
    let payload = poll.poll.expect("poll payload");
    assert_eq!(
        payload.options.iter().map(|o| o.text.as_str()).collect::<Vec<_>>(),
        vec!["Yes", "No"]
    );
    assert_ne!(payload.options[0].id, payload.options[1].id);
    assert_eq!(poll.content, "Coffee?");
    assert_eq!(h.published().await.len(), 1);
}

#[tokio::test]
async fn guild_messages_require_membership_and_stay_in_their_room() {
    let h = harness().await;
    let (alice, bob) = profiles(&h).await;
    let guild = h
        .ctx
        .storage
        .insert_guild("ops", h.alice, "OPS200")
        .await
        .expect("guild")
        .expect("created");

    let mut request = text("guild only");
    request.guild_id = Some(guild.guild_id);
    let err = send_message(&h.ctx, &bob, request.clone())
        .await
        .expect_err("outsider");
    assert_eq!(err.code, ErrorCode::Forbidden);

    send_message(&h.ctx, &alice, request).await.expect("owner");
    assert!(list_messages(&h.ctx, &alice, None)
        .await
        .expect("global")
        .is_empty());
    let in_guild = list_messages(&h.ctx, &alice, Some(guild.guild_id))
        .await
        .expect("guild");
    assert_eq!(in_guild.len(), 1);
    assert_eq!(
        h.published().await[0].0,
        format!("presence-guild-{}", guild.guild_id.0)
    );

    let err = list_messages(&h.ctx, &bob, Some(guild.guild_id))
        .await
        .expect_err("outsider listing");
    assert_eq!(err.code, ErrorCode::Forbidden);
}

#[tokio::test]
async fn edit_is_author_only_and_text_only() {
    let h = harness().await;
    let (alice, bob) = profiles(&h).await;
    let message = send_message(&h.ctx, &alice, text("draft")).await.expect("send");

    let err = edit_message(
        &h.ctx,
        &bob,
        EditMessageRequest {
            id: message.id,
            content: "hijack".into(),
        },
    )
    .await
    .expect_err("not author");
    assert_eq!(err.code, ErrorCode::Forbidden);

    let err = edit_message(
        &h.ctx,
        &alice,
        EditMessageRequest {
            id: message.id,
            content: "  ".into(),
        },
    )
    .await
    .expect_err("blank edit");
    assert_eq!(err.code, ErrorCode::Validation);

    let edited = edit_message(
        &h.ctx,
        &alice,
        EditMessageRequest {
            id: message.id,
            content: "final".into(),
        },
    )
    .await
    .expect("edit");
    assert_eq!(edited.content, "final");
    assert!(edited.updated_at.is_some());
    assert_eq!(edited.created_at, message.created_at);

    let poll = send_message(&h.ctx, &alice, coffee_poll()).await.expect("poll");
    let err = edit_message(
        &h.ctx,
        &alice,
        EditMessageRequest {
            id: poll.id,
            content: "Tea?".into(),
        },
    )
    .await
    .expect_err("poll edit");
    assert_eq!(err.code, ErrorCode::Validation);

    let err = edit_message(
        &h.ctx,
        &alice,
        EditMessageRequest {
            id: MessageId::generate(),
            content: "ghost".into(),
        },
    )
    .await
    .expect_err("missing");
    assert_eq!(err.code, ErrorCode::NotFound);
}

#[tokio::test]
async fn guild_owner_may_delete_member_messages_but_members_may_not() {
    let h = harness().await;
    let (alice, bob) = profiles(&h).await;
    let guild = h
        .ctx
        .storage
        .insert_guild("ops", h.alice, "OPS201")
        .await
        .expect("guild")
        .expect("created");
    h.ctx
        .storage
        .insert_membership(guild.guild_id, h.bob, shared::domain::Role::Member)
        .await
        .expect("join");

    let mut request = text("from bob");
    request.guild_id = Some(guild.guild_id);
    let bobs = send_message(&h.ctx, &bob, request.clone()).await.expect("bob");
    request.content = Some("from alice".into());
    let alices = send_message(&h.ctx, &alice, request).await.expect("alice");

    let err = delete_message(&h.ctx, &bob, Some(alices.id))
        .await
        .expect_err("member deleting owner message");
    assert_eq!(err.code, ErrorCode::Forbidden);

    delete_message(&h.ctx, &alice, Some(bobs.id))
        .await
        .expect("owner deletes");
    let last = h.published().await.pop().expect("event");
    assert_eq!(
        last.1,
        ServerEvent::MessageDeleted {
            message_id: bobs.id,
            guild_id: Some(guild.guild_id),
        }
    );

    let err = delete_message(&h.ctx, &alice, None)
        .await
        .expect_err("missing id");
    assert_eq!(err.code, ErrorCode::Validation);
}

#[tokio::test]
async fn global_messages_are_deletable_only_by_their_author() {
    let h = harness().await;
    let (alice, bob) = profiles(&h).await;
    let message = send_message(&h.ctx, &alice, text("mine")).await.expect("send");

    let err = delete_message(&h.ctx, &bob, Some(message.id))
        .await
        .expect_err("other user");
    assert_eq!(err.code, ErrorCode::Forbidden);
    delete_message(&h.ctx, &alice, Some(message.id))
        .await
        .expect("author");
}

#[tokio::test]
async fn deletion_is_terminal() {
    let h = harness().await;
    let (alice, bob) = profiles(&h).await;
    let message = send_message(&h.ctx, &alice, text("bye")).await.expect("send");
    let poll = send_message(&h.ctx, &alice, coffee_poll()).await.expect("poll");
    let option = poll.poll.as_ref().expect("poll").options[0].id;

    delete_message(&h.ctx, &alice, Some(message.id))
        .await
        .expect("delete");
    delete_message(&h.ctx, &alice, Some(poll.id))
        .await
        .expect("delete poll");

    let codes = [
        delete_message(&h.ctx, &alice, Some(message.id))
            .await
            .expect_err("delete again")
            .code,
        edit_message(
            &h.ctx,
            &alice,
            EditMessageRequest {
                id: message.id,
                content: "x".into(),
            },
        )
        .await
        .expect_err("edit")
        .code,
        mark_seen(&h.ctx, &bob, &[message.id])
            .await
            .expect_err("seen")
            .code,
        mark_seen_one(&h.ctx, &bob, Some(message.id))
            .await
            .expect_err("status")
            .code,
        vote(&h.ctx, &bob, poll.id, option)
            .await
            .expect_err("vote")
            .code,
    ];
    assert!(codes.iter().all(|code| *code == ErrorCode::NotFound), "{codes:?}");
}

#[tokio::test]
async fn mark_seen_is_idempotent_and_never_includes_the_author() {
    let h = harness().await;
    let (alice, bob) = profiles(&h).await;
    let message = send_message(&h.ctx, &alice, text("read me")).await.expect("send");
    let before = h.published().await.len();

    let updated = mark_seen(&h.ctx, &bob, &[message.id, message.id])
        .await
        .expect("seen");
    assert_eq!(updated.len(), 1);
    assert_eq!(updated[0].seen_by.iter().copied().collect::<Vec<_>>(), vec![h.bob]);

    let again = mark_seen(&h.ctx, &bob, &[message.id]).await.expect("again");
    assert!(again.is_empty());

    let own = mark_seen(&h.ctx, &alice, &[message.id]).await.expect("own");
    assert!(own.is_empty());
    assert!(!mark_seen_one(&h.ctx, &alice, Some(message.id))
        .await
        .expect("own status"));

    let stored = list_messages(&h.ctx, &alice, None).await.expect("list");
    assert_eq!(stored[0].seen_by.len(), 1);
    assert!(!stored[0].is_seen_by(h.alice));
    // one message-updated for the single real mutation
    assert_eq!(h.published().await.len(), before + 1);
}

#[tokio::test]
async fn mark_seen_skips_missing_ids_unless_all_are_missing() {
    let h = harness().await;
    let (alice, bob) = profiles(&h).await;
    let message = send_message(&h.ctx, &alice, text("one")).await.expect("send");

    let err = mark_seen(&h.ctx, &bob, &[]).await.expect_err("empty");
    assert_eq!(err.code, ErrorCode::Validation);

    let updated = mark_seen(&h.ctx, &bob, &[MessageId::generate(), message.id])
        .await
        .expect("partial");
    assert_eq!(updated.len(), 1);

    let err = mark_seen(&h.ctx, &bob, &[MessageId::generate()])
        .await
        .expect_err("all missing");
    assert_eq!(err.code, ErrorCode::NotFound);
}

#[tokio::test]
async fn mark_seen_one_publishes_message_updated_on_room_channel() {
    let h = harness().await;
    let (alice, bob) = profiles(&h).await;
    let message = send_message(&h.ctx, &alice, text("status")).await.expect("send");

    assert!(mark_seen_one(&h.ctx, &bob, Some(message.id))
        .await
        .expect("status"));
    let (channel, event) = h.published().await.pop().expect("event");
    assert_eq!(channel, "presence-global");
    let ServerEvent::MessageUpdated { message: updated } = event else {
        panic!("expected message-updated");
    };
    assert!(updated.is_seen_by(h.bob));

    let err = mark_seen_one(&h.ctx, &bob, None).await.expect_err("no id");
    assert_eq!(err.code, ErrorCode::Validation);
}

#[tokio::test]
async fn votes_are_single_choice_and_last_vote_wins() {
    let h = harness().await;
    let (alice, bob) = profiles(&h).await;
    let poll = send_message(&h.ctx, &alice, coffee_poll()).await.expect("poll");
    let options = poll.poll.as_ref().expect("poll").options.clone();
    let (yes, no) = (options[0].id, options[1].id);

    vote(&h.ctx, &bob, poll.id, yes).await.expect("yes");
    let published_after_first = h.published().await.len();
    let same = vote(&h.ctx, &bob, poll.id, yes).await.expect("same again");
    assert_eq!(h.published().await.len(), published_after_first);
    assert!(same.poll.as_ref().expect("poll").options[0].votes.contains(&h.bob));

    let switched = vote(&h.ctx, &bob, poll.id, no).await.expect("no");
    let payload = switched.poll.expect("poll");
    assert!(!payload.option(yes).expect("yes").votes.contains(&h.bob));
    assert!(payload.option(no).expect("no").votes.contains(&h.bob));
    assert_eq!(payload.total_votes(), 1);
    assert_eq!(h.published().await.len(), published_after_first + 1);

    let err = vote(&h.ctx, &bob, poll.id, PollOptionId::generate())
        .await
        .expect_err("unknown option");
    assert_eq!(err.code, ErrorCode::Validation);

    let plain = send_message(&h.ctx, &alice, text("not a poll")).await.expect("send");
    let err = vote(&h.ctx, &bob, plain.id, yes).await.expect_err("not a poll");
    assert_eq!(err.code, ErrorCode::Validation);
}

#[tokio::test]
async fn publish_failures_do_not_fail_committed_writes() {
    let h = harness_with(RecordingPublisher {
        fail: true,
        ..RecordingPublisher::default()
    })
    .await;
    let (alice, bob) = profiles(&h).await;

    let message = send_message(&h.ctx, &alice, text("offline fanout"))
        .await
        .expect("send still succeeds");
    let updated = mark_seen(&h.ctx, &bob, &[message.id]).await.expect("seen");
    assert_eq!(updated.len(), 1);
    assert_eq!(list_messages(&h.ctx, &bob, None).await.expect("list").len(), 1);
}

#[tokio::test]
async fn seen_by_accumulates_across_viewers() {
    let h = harness().await;
    let (alice, bob) = profiles(&h).await;
    let message = send_message(&h.ctx, &alice, text("popular")).await.expect("send");

    let carol_id = h
        .ctx
        .storage
        .upsert_user("carol", None, None, None)
        .await
        .expect("carol");
    let carol = current_user(&h.ctx, Some(carol_id)).await.expect("profile");

    mark_seen(&h.ctx, &bob, &[message.id]).await.expect("bob");
    let updated = mark_seen(&h.ctx, &carol, &[message.id]).await.expect("carol");
    assert_eq!(
        updated[0].seen_by.iter().copied().collect::<Vec<_>>(),
        vec![h.bob, carol_id]
    );
    let stored = h
        .ctx
        .storage
        .find_message(message.id)
        .await
        .expect("load")
        .expect("present");
    assert_eq!(stored.version, 2);
}

async fn extra_users(h: &Harness, count: usize) -> Vec<UserProfile> {
    let mut users = Vec::with_capacity(count);
    for n in 0..count {
        let user_id = h
            .ctx
            .storage
            .upsert_user(&format!("voter{n}"), None, None, None)
            .await
            .expect("user");
        users.push(current_user(&h.ctx, Some(user_id)).await.expect("profile"));
    }
    users
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_votes_all_land() {
    let h = harness().await;
    let (alice, _) = profiles(&h).await;
    let poll = send_message(&h.ctx, &alice, coffee_poll()).await.expect("poll");
    let options = poll.poll.as_ref().expect("poll").options.clone();
    let voters = extra_users(&h, 20).await;

    let mut tasks = Vec::new();
    for (n, voter) in voters.into_iter().enumerate() {
        let ctx = h.ctx.clone();
        let (message_id, option_id) = (poll.id, options[n % 2].id);
        tasks.push(tokio::spawn(async move {
            vote(&ctx, &voter, message_id, option_id).await
        }));
    }
    for task in tasks {
        task.await.expect("join").expect("vote accepted");
    }

    let stored = h
        .ctx
        .storage
        .find_message(poll.id)
        .await
        .expect("load")
        .expect("present");
    let payload = stored.message.poll.expect("poll");
    assert_eq!(payload.total_votes(), 20);
    assert_eq!(payload.options[0].votes.len(), 10);
    assert_eq!(payload.options[1].votes.len(), 10);
    assert_eq!(stored.version, 20);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_seen_sweeps_all_land() {
    let h = harness().await;
    let (alice, _) = profiles(&h).await;
    let first = send_message(&h.ctx, &alice, text("one")).await.expect("send");
    let second = send_message(&h.ctx, &alice, text("two")).await.expect("send");
    let viewers = extra_users(&h, 12).await;

    let mut tasks = Vec::new();
    for viewer in viewers {
        let ctx = h.ctx.clone();
        let ids = [first.id, second.id];
        tasks.push(tokio::spawn(async move { mark_seen(&ctx, &viewer, &ids).await }));
    }
    for task in tasks {
        let updated = task.await.expect("join").expect("sweep accepted");
        assert_eq!(updated.len(), 2);
    }

    for message in list_messages(&h.ctx, &alice, None).await.expect("list") {
        assert_eq!(message.seen_by.len(), 12);
    }
}

#[tokio::test]
async fn outsiders_cannot_touch_guild_messages() {
    let h = harness().await;
    let (alice, bob) = profiles(&h).await;
    let guild = h
        .ctx
        .storage
        .insert_guild("ops", h.alice, "OPS201")
        .await
        .expect("guild")
        .expect("created");
    let mut request = coffee_poll();
    request.guild_id = Some(guild.guild_id);
    let poll = send_message(&h.ctx, &alice, request).await.expect("poll");
    let yes = poll.poll.as_ref().expect("poll").options[0].id;
    let global = send_message(&h.ctx, &alice, text("lobby")).await.expect("send");
    let before = h.published().await.len();

    let err = vote(&h.ctx, &bob, poll.id, yes).await.expect_err("vote");
    assert_eq!(err.code, ErrorCode::Forbidden);
    let err = mark_seen_one(&h.ctx, &bob, Some(poll.id))
        .await
        .expect_err("status");
    assert_eq!(err.code, ErrorCode::Forbidden);
    let err = mark_seen(&h.ctx, &bob, &[poll.id]).await.expect_err("seen");
    assert_eq!(err.code, ErrorCode::Forbidden);

    // readable ids in the same batch still go through
    let updated = mark_seen(&h.ctx, &bob, &[poll.id, global.id])
        .await
        .expect("mixed batch");
    assert_eq!(updated.len(), 1);
    assert_eq!(updated[0].id, global.id);

    let stored = h
        .ctx
        .storage
        .find_message(poll.id)
        .await
        .expect("load")
        .expect("present")
        .message;
    assert!(stored.seen_by.is_empty());
    assert_eq!(stored.poll.expect("poll").total_votes(), 0);
    assert_eq!(h.published().await.len(), before + 1);

    h.ctx
        .storage
        .insert_membership(guild.guild_id, h.bob, shared::domain::Role::Member)
        .await
        .expect("join");
    vote(&h.ctx, &bob, poll.id, yes).await.expect("member vote");
}
