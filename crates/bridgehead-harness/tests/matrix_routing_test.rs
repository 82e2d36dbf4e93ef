//! Event routing from the processor to the test backend.

use std::sync::Arc;

use bridgehead_core::{Event, EventId, Membership, PermissionLevel, Portal, RoomId, User, UserId};
use bridgehead_harness::{
    Capabilities, EXAMPLE_CONFIG, MockCrypto, MockIntentSource, Record, Recorder, SimEnv, TestChild,
    TestConfig, mock_crypto::encrypted_event, test_info,
};
use bridgehead_server::{Bridge, BridgeRuntime};
use serde_json::{Value, json};

const BOT: &str = "@bridgebot:example.com";
const ALICE: &str = "@alice:example.com";
const BOB: &str = "@bob:example.com";
const GHOST: &str = "@bridge_42:example.com";
const PORTAL: &str = "!portal:example.com";

struct Harness {
    runtime: BridgeRuntime<SimEnv>,
    child: Arc<TestChild>,
    intents: Arc<MockIntentSource>,
    recorder: Recorder,
    _config: TestConfig,
}

impl Harness {
    async fn boot(config: TestConfig, child: TestChild) -> Self {
        let recorder = child.recorder().clone();
        let child = Arc::new(child);
        let intents = Arc::new(MockIntentSource::new(BOT));

        let mut bridge = Bridge::new(test_info(), Arc::clone(&child) as _, SimEnv::with_seed(11))
            .with_intents(Arc::clone(&intents) as _)
            .with_flags(config.flags());
        bridge.load_config().unwrap();
        let runtime = bridge.init().await.unwrap();
        runtime.start().await.unwrap();

        Self { runtime, child, intents, recorder, _config: config }
    }

    async fn plain(child: impl FnOnce(TestChild) -> TestChild) -> Self {
        let recorder = Recorder::new();
        let child = child(TestChild::new(EXAMPLE_CONFIG, recorder));
        Self::boot(TestConfig::in_memory().unwrap(), child).await
    }

    async fn send(&self, evt: Event) {
        self.runtime.processor().dispatch(evt).await;
    }

    /// Routed records, without lifecycle and member tracking noise.
    fn routed(&self) -> Vec<Record> {
        self.recorder.records_without(|r| {
            matches!(
                r,
                Record::Init
                    | Record::Start
                    | Record::Stop
                    | Record::CryptoInit
                    | Record::CryptoStart
                    | Record::CryptoStop
                    | Record::MemberTracked { .. }
            )
        })
    }
}

fn member(room: &str, sender: &str, target: &str, membership: Membership) -> Event {
    let mut evt = Event::new(
        "m.room.member",
        RoomId::from(room),
        UserId::from(sender),
        json!({"membership": membership.as_str()}),
    );
    evt.state_key = Some(target.to_string());
    evt.event_id = EventId::from("$member");
    evt
}

fn message(room: &str, sender: &str, body: &str) -> Event {
    let mut evt = Event::new(
        "m.room.message",
        RoomId::from(room),
        UserId::from(sender),
        json!({"msgtype": "m.text", "body": body}),
    );
    evt.event_id = EventId::from("$message");
    evt
}

fn ephemeral(event_type: &str, room: &str, content: Value) -> Event {
    Event::new(event_type, RoomId::from(room), UserId::default(), content)
}

fn received(sender: &str, body: &str) -> Record {
    Record::Received {
        room_id: RoomId::from(PORTAL),
        sender: UserId::from(sender),
        event_type: "m.room.message".to_string(),
        body: Some(body.to_string()),
    }
}

#[tokio::test]
async fn test_bot_invite_sets_management_room() {
    let h = Harness::plain(|child| child).await;
    let room = "!dm:example.com";

    h.send(member(room, ALICE, BOT, Membership::Invite)).await;

    assert_eq!(h.intents.bot().joined_rooms(), [RoomId::from(room)]);
    let alice = h.child.user(&UserId::from(ALICE)).unwrap();
    assert_eq!(alice.management_room_id(), Some(RoomId::from(room)));
}

#[tokio::test]
async fn test_bot_invite_keeps_existing_management_room() {
    let h = Harness::plain(|child| child).await;
    let alice = h.child.add_user(ALICE, PermissionLevel::USER);
    alice.set_management_room(RoomId::from("!first:example.com"));

    h.send(member("!second:example.com", ALICE, BOT, Membership::Invite)).await;

    assert_eq!(h.intents.bot().joined_rooms().len(), 1);
    assert_eq!(alice.management_room_id(), Some(RoomId::from("!first:example.com")));
}

#[tokio::test]
async fn test_bot_invite_from_relay_user_joins_without_management_room() {
    let h = Harness::plain(|child| child.with_default_level(PermissionLevel::RELAY)).await;

    h.send(member("!dm:example.com", BOB, BOT, Membership::Invite)).await;

    assert_eq!(h.intents.bot().joined_rooms().len(), 1);
    assert!(h.child.user(&UserId::from(BOB)).unwrap().management_room_id().is_none());
}

#[tokio::test]
async fn test_ghost_invite_creates_private_portal() {
    let h = Harness::plain(|child| child).await;
    let room = "!private:example.com";

    h.send(member(room, ALICE, GHOST, Membership::Invite)).await;

    assert_eq!(h.intents.mock_for(&UserId::from(GHOST)).joined_rooms(), [RoomId::from(room)]);
    assert_eq!(
        h.routed(),
        [Record::PrivatePortal {
            room_id: RoomId::from(room),
            user_id: UserId::from(ALICE),
            ghost: UserId::from(GHOST),
        }]
    );
}

#[tokio::test]
async fn test_ghost_invite_from_relay_user_is_ignored() {
    let h = Harness::plain(|child| child.with_default_level(PermissionLevel::RELAY)).await;

    h.send(member("!private:example.com", BOB, GHOST, Membership::Invite)).await;

    assert!(h.intents.mock_for(&UserId::from(GHOST)).joined_rooms().is_empty());
    assert!(h.routed().is_empty());
}

#[tokio::test]
async fn test_membership_changes_reach_capable_portal() {
    let h = Harness::plain(|child| child).await;
    h.child.add_portal(PORTAL, Capabilities::all());
    h.child.add_user(ALICE, PermissionLevel::USER);

    h.send(member(PORTAL, ALICE, GHOST, Membership::Invite)).await;
    h.send(member(PORTAL, ALICE, GHOST, Membership::Leave)).await;
    h.send(member(PORTAL, ALICE, GHOST, Membership::Ban)).await;
    h.send(member(PORTAL, ALICE, ALICE, Membership::Leave)).await;

    let room_id = RoomId::from(PORTAL);
    let (alice, ghost) = (UserId::from(ALICE), UserId::from(GHOST));
    assert_eq!(
        h.routed(),
        [
            Record::Invite {
                room_id: room_id.clone(),
                sender: alice.clone(),
                ghost: ghost.clone(),
            },
            Record::Kick { room_id: room_id.clone(), sender: alice.clone(), ghost: ghost.clone() },
            Record::Kick { room_id: room_id.clone(), sender: alice.clone(), ghost },
            Record::Leave { room_id, user_id: alice },
        ]
    );
}

#[tokio::test]
async fn test_membership_is_skipped_without_capability_or_known_sender() {
    let h = Harness::plain(|child| child).await;
    h.child.add_portal(PORTAL, Capabilities::none());
    h.child.add_portal("!other:example.com", Capabilities::all());
    h.child.add_user(ALICE, PermissionLevel::USER);

    h.send(member(PORTAL, ALICE, ALICE, Membership::Leave)).await;
    h.send(member("!other:example.com", BOB, BOB, Membership::Leave)).await;
    h.send(member("!other:example.com", GHOST, GHOST, Membership::Leave)).await;

    assert!(h.routed().is_empty());
}

#[tokio::test]
async fn test_membership_is_cached() {
    let h = Harness::plain(|child| child).await;

    h.send(member(PORTAL, ALICE, ALICE, Membership::Join)).await;

    let state = h.runtime.state_store();
    let membership = state.get_membership(&RoomId::from(PORTAL), &UserId::from(ALICE)).unwrap();
    assert_eq!(membership, Membership::Join);
}

#[tokio::test]
async fn test_messages_reach_portal() {
    let h = Harness::plain(|child| child.with_default_level(PermissionLevel::RELAY)).await;
    h.child.add_portal(PORTAL, Capabilities { disappearing: true, ..Capabilities::none() });

    h.send(message(PORTAL, ALICE, "hello")).await;

    assert_eq!(
        h.routed(),
        [received(ALICE, "hello"), Record::Disappearing { room_id: RoomId::from(PORTAL) }]
    );
}

#[tokio::test]
async fn test_messages_from_puppets_and_blocked_users_are_dropped() {
    let h = Harness::plain(|child| child.with_default_level(PermissionLevel::BLOCK)).await;
    h.child.add_portal(PORTAL, Capabilities::all());

    h.send(message(PORTAL, BOT, "from the bot")).await;
    h.send(message(PORTAL, GHOST, "from a ghost")).await;
    h.send(message(PORTAL, ALICE, "from a blocked user")).await;
    h.send(message("!unbridged:example.com", BOB, "nowhere")).await;

    assert!(h.routed().is_empty());
}

#[tokio::test]
async fn test_prefixed_messages_are_commands() {
    let h = Harness::plain(TestChild::with_commands).await;
    h.child.add_portal(PORTAL, Capabilities::none());
    h.child.add_user(ALICE, PermissionLevel::USER);
    h.child.add_user(BOB, PermissionLevel::RELAY);

    h.send(message(PORTAL, ALICE, "!bridge help")).await;
    h.send(message(PORTAL, ALICE, "help")).await;
    h.send(message(PORTAL, BOB, "!bridge help")).await;

    assert_eq!(
        h.routed(),
        [
            Record::Command {
                room_id: RoomId::from(PORTAL),
                user_id: UserId::from(ALICE),
                message: "help".to_string(),
            },
            received(ALICE, "help"),
            received(BOB, "!bridge help"),
        ]
    );
}

#[tokio::test]
async fn test_management_room_messages_are_commands() {
    let h = Harness::plain(TestChild::with_commands).await;
    let alice = h.child.add_user(ALICE, PermissionLevel::USER);
    alice.set_management_room(RoomId::from("!mgmt:example.com"));

    h.send(message("!mgmt:example.com", ALICE, "login")).await;

    assert_eq!(
        h.routed(),
        [Record::Command {
            room_id: RoomId::from("!mgmt:example.com"),
            user_id: UserId::from(ALICE),
            message: "login".to_string(),
        }]
    );
}

#[tokio::test]
async fn test_commands_without_processor_are_messages() {
    let h = Harness::plain(|child| child).await;
    h.child.add_portal(PORTAL, Capabilities::none());

    h.send(message(PORTAL, ALICE, "!bridge help")).await;

    assert_eq!(h.routed(), [received(ALICE, "!bridge help")]);
}

#[tokio::test]
async fn test_read_receipts_skip_puppets() {
    let h = Harness::plain(|child| child).await;
    h.child.add_portal(PORTAL, Capabilities::all());
    h.child.add_user(ALICE, PermissionLevel::USER);

    h.send(ephemeral(
        "m.receipt",
        PORTAL,
        json!({
            "$read": {"m.read": {
                ALICE: {"ts": 1_700_000_000_123_i64},
                GHOST: {"ts": 1},
                BOB: {"ts": 2},
            }},
        }),
    ))
    .await;

    assert_eq!(
        h.routed(),
        [Record::ReadReceipt {
            room_id: RoomId::from(PORTAL),
            user_id: UserId::from(ALICE),
            event_id: EventId::from("$read"),
            ts: 1_700_000_000_123,
        }]
    );
}

#[tokio::test]
async fn test_typing_excludes_puppets() {
    let h = Harness::plain(|child| child).await;
    h.child.add_portal(PORTAL, Capabilities::all());

    h.send(ephemeral("m.typing", PORTAL, json!({"user_ids": [ALICE, GHOST, BOT, BOB]}))).await;

    assert_eq!(
        h.routed(),
        [Record::Typing {
            room_id: RoomId::from(PORTAL),
            user_ids: vec![UserId::from(ALICE), UserId::from(BOB)],
        }]
    );
}

#[tokio::test]
async fn test_typing_without_capability_is_ignored() {
    let h = Harness::plain(|child| child).await;
    h.child.add_portal(PORTAL, Capabilities { receipts: true, ..Capabilities::none() });

    h.send(ephemeral("m.typing", PORTAL, json!({"user_ids": [ALICE]}))).await;

    assert!(h.routed().is_empty());
}

#[tokio::test]
async fn test_room_metadata_changes() {
    let h = Harness::plain(|child| child).await;
    h.child.add_portal(PORTAL, Capabilities::all());
    h.child.add_user(ALICE, PermissionLevel::USER);

    for event_type in ["m.room.name", "m.room.topic", "m.room.avatar"] {
        let mut evt = Event::new(event_type, RoomId::from(PORTAL), UserId::from(ALICE), json!({}));
        evt.state_key = Some(String::new());
        h.send(evt).await;
    }
    let rename =
        Event::new("m.room.name", RoomId::from(PORTAL), UserId::from(GHOST), json!({"name": "x"}));
    h.send(rename).await;

    let kinds: Vec<String> = h
        .routed()
        .into_iter()
        .filter_map(|r| match r {
            Record::Meta { event_type, .. } => Some(event_type),
            _ => None,
        })
        .collect();
    assert_eq!(kinds, ["m.room.name", "m.room.topic", "m.room.avatar"]);
}

#[tokio::test]
async fn test_encryption_event_marks_portal() {
    let h = Harness::plain(|child| child).await;
    let portal = h.child.add_portal(PORTAL, Capabilities::none());

    let mut evt = Event::new(
        "m.room.encryption",
        RoomId::from(PORTAL),
        UserId::from(ALICE),
        json!({"algorithm": "m.megolm.v1.aes-sha2"}),
    );
    evt.state_key = Some(String::new());
    h.send(evt).await;

    assert!(portal.is_encrypted());
    assert!(h.runtime.state_store().is_encrypted(&RoomId::from(PORTAL)).unwrap());
}

async fn encrypted_harness(crypto: MockCrypto, recorder: Recorder) -> (Harness, Arc<MockCrypto>) {
    let crypto = Arc::new(crypto);
    let child = TestChild::new(EXAMPLE_CONFIG, recorder).with_crypto(Arc::clone(&crypto));
    let h = Harness::boot(TestConfig::with_encryption().unwrap(), child).await;
    h.child.add_portal(PORTAL, Capabilities::none());
    (h, crypto)
}

#[tokio::test]
async fn test_encrypted_message_is_decrypted_and_redispatched() {
    let recorder = Recorder::new();
    let (h, crypto) = encrypted_harness(MockCrypto::new(recorder.clone()), recorder).await;
    crypto.add_session("s1");

    h.send(encrypted_event(PORTAL, ALICE, "s1", "m.room.message", json!({"body": "secret"}))).await;

    assert_eq!(h.routed(), [received(ALICE, "secret")]);
}

#[tokio::test]
async fn test_missing_session_is_requested() {
    let recorder = Recorder::new();
    let crypto = MockCrypto::new(recorder.clone()).delivering_requested_sessions();
    let (h, _crypto) = encrypted_harness(crypto, recorder).await;

    let late = encrypted_event(PORTAL, ALICE, "late", "m.room.message", json!({"body": "finally"}));
    h.send(late).await;

    assert_eq!(
        h.routed(),
        [Record::SessionRequested { session_id: "late".into() }, received(ALICE, "finally")]
    );
}

#[tokio::test]
async fn test_session_that_never_arrives_drops_event() {
    let recorder = Recorder::new();
    let (h, _crypto) = encrypted_harness(MockCrypto::new(recorder.clone()), recorder).await;

    h.send(encrypted_event(PORTAL, ALICE, "lost", "m.room.message", json!({"body": "gone"}))).await;

    assert_eq!(h.routed(), [Record::SessionRequested { session_id: "lost".into() }]);
}

#[tokio::test]
async fn test_doubly_encrypted_payload_is_dropped() {
    let recorder = Recorder::new();
    let (h, crypto) = encrypted_harness(MockCrypto::new(recorder.clone()), recorder).await;
    crypto.add_session("outer");

    h.send(encrypted_event(PORTAL, ALICE, "outer", "m.room.encrypted", json!({}))).await;

    assert!(h.routed().is_empty());
}

#[tokio::test]
async fn test_member_events_reach_crypto() {
    let recorder = Recorder::new();
    let (h, _crypto) = encrypted_harness(MockCrypto::new(recorder.clone()), recorder.clone()).await;

    h.send(member(PORTAL, ALICE, ALICE, Membership::Join)).await;

    assert!(recorder.records().contains(&Record::MemberTracked {
        room_id: RoomId::from(PORTAL),
        user_id: UserId::from(ALICE),
    }));
}

#[tokio::test]
async fn test_encrypted_events_are_ignored_without_crypto() {
    let h = Harness::plain(|child| child).await;
    h.child.add_portal(PORTAL, Capabilities::none());

    h.send(encrypted_event(PORTAL, ALICE, "s1", "m.room.message", json!({"body": "secret"}))).await;

    assert!(h.routed().is_empty());
}
