//! Persistence of the shared database across restarts.

use std::sync::Arc;

use bridgehead_core::{Environment, Membership, RoomId, SenderKey, SessionId, UserId};
use bridgehead_harness::SimEnv;
use bridgehead_server::{
    CryptoStore, Database, Schema, StateStore, StorageError,
    crypto_store::{Account, NonceSource},
};
use regex::Regex;
use tempfile::tempdir;

const OWNER: &str = "bridgehead-test";

fn nonces(seed: u64) -> NonceSource {
    let env = SimEnv::with_seed(seed);
    Arc::new(move |buf: &mut [u8]| env.random_bytes(buf))
}

fn crypto_store(db: Database, pickle_key: &str) -> CryptoStore {
    let ghosts = Regex::new("^@bridge_.+:example\\.com$").unwrap();
    CryptoStore::new(db, UserId::from("@bridgebot:example.com"), ghosts, pickle_key, nonces(3))
}

#[test]
fn test_schema_versions_survive_restart() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("bridge.redb").display().to_string();

    {
        let db = Database::open(&path, OWNER).unwrap();
        db.upgrade(&Schema { component: "main", versions: &[&["portal"]] }).unwrap();
        db.put("portal", "!room:example.com", &"bridged".to_string()).unwrap();
    }

    {
        let db = Database::open(&path, OWNER).unwrap();
        assert_eq!(db.version("main").unwrap(), 1);

        db.upgrade(&Schema { component: "main", versions: &[&["portal"], &["puppet"]] }).unwrap();
        assert_eq!(db.version("main").unwrap(), 2);
        let value: Option<String> = db.get("portal", "!room:example.com").unwrap();
        assert_eq!(value.as_deref(), Some("bridged"));
    }
}

#[test]
fn test_undeclared_component_tables_are_foreign_after_restart() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("bridge.redb").display().to_string();

    {
        let db = Database::open(&path, OWNER).unwrap();
        let state = StateStore::new(db.clone());
        state.upgrade().unwrap();
        db.upgrade(&Schema { component: "main", versions: &[&["portal"]] }).unwrap();
    }

    let db = Database::open(&path, OWNER).unwrap();
    let err = db.upgrade(&Schema { component: "main", versions: &[&["portal"]] }).unwrap_err();
    assert!(matches!(
        err,
        StorageError::ForeignTables(ref tables) if tables.iter().all(|t| t.starts_with("mx_"))
    ));

    // Declaring the state store first makes its tables ours again.
    let _state = StateStore::new(db.clone());
    db.upgrade(&Schema { component: "main", versions: &[&["portal"]] }).unwrap();
}

#[test]
fn test_room_state_survives_restart() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("bridge.redb").display().to_string();
    let room = RoomId::from("!room:example.com");
    let alice = UserId::from("@alice:example.com");

    {
        let state = StateStore::new(Database::open(&path, OWNER).unwrap());
        state.upgrade().unwrap();
        state.set_membership(&room, &alice, Membership::Join).unwrap();
        let encryption = serde_json::json!({"algorithm": "m.megolm.v1.aes-sha2"});
        state.set_encryption_event(&room, &encryption).unwrap();
    }

    let state = StateStore::new(Database::open(&path, OWNER).unwrap());
    state.upgrade().unwrap();
    assert_eq!(state.get_membership(&room, &alice).unwrap(), Membership::Join);
    assert!(state.is_encrypted(&room).unwrap());
}

#[test]
fn test_crypto_material_survives_restart() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("bridge.redb").display().to_string();
    let room = RoomId::from("!room:example.com");
    let (sender, session) = (SenderKey::from("curve-key"), SessionId::from("megolm-1"));

    {
        let store = crypto_store(Database::open(&path, OWNER).unwrap(), "pickle key");
        store.upgrade().unwrap();
        store
            .put_account(&Account {
                device_id: "BRIDGEDEV".into(),
                shared: true,
                sync_token: "s72594_4483_1934".to_string(),
                pickle: b"account pickle".to_vec(),
            })
            .unwrap();
        store.put_group_session(&room, &sender, &session, b"group pickle").unwrap();
        store.put_olm_session(&sender, &SessionId::from("olm-1"), b"olm pickle").unwrap();
    }

    let store = crypto_store(Database::open(&path, OWNER).unwrap(), "pickle key");
    store.upgrade().unwrap();

    assert_eq!(store.find_device_id().as_str(), "BRIDGEDEV");
    let account = store.get_account().unwrap().unwrap();
    assert!(account.shared);
    assert_eq!(account.pickle, b"account pickle");
    let group = store.get_group_session(&room, &sender, &session).unwrap().unwrap();
    assert_eq!(group, b"group pickle");
    assert_eq!(
        store.get_olm_sessions(&sender).unwrap(),
        [(SessionId::from("olm-1"), b"olm pickle".to_vec())]
    );
}

#[test]
fn test_changed_pickle_key_cannot_open_material() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("bridge.redb").display().to_string();
    let room = RoomId::from("!room:example.com");
    let (sender, session) = (SenderKey::from("curve-key"), SessionId::from("megolm-1"));

    {
        let store = crypto_store(Database::open(&path, OWNER).unwrap(), "original key");
        store.upgrade().unwrap();
        store.put_group_session(&room, &sender, &session, b"group pickle").unwrap();
    }

    let store = crypto_store(Database::open(&path, OWNER).unwrap(), "rotated key");
    store.upgrade().unwrap();

    assert!(store.has_group_session(&room, &sender, &session).unwrap());
    let err = store.get_group_session(&room, &sender, &session).unwrap_err();
    assert!(matches!(err, StorageError::Pickle(_)));
}

#[test]
fn test_encryption_recipients_after_restart() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("bridge.redb").display().to_string();
    let room = RoomId::from("!room:example.com");

    {
        let db = Database::open(&path, OWNER).unwrap();
        let state = StateStore::new(db.clone());
        let _crypto = crypto_store(db, "pickle key");
        state.upgrade().unwrap();
        for (user, membership) in [
            ("@alice:example.com", Membership::Join),
            ("@bob:example.com", Membership::Invite),
            ("@carol:example.com", Membership::Leave),
            ("@bridge_42:example.com", Membership::Join),
            ("@bridgebot:example.com", Membership::Join),
        ] {
            state.set_membership(&room, &UserId::from(user), membership).unwrap();
        }
    }

    let db = Database::open(&path, OWNER).unwrap();
    let _state = StateStore::new(db.clone());
    let store = crypto_store(db, "pickle key");
    store.upgrade().unwrap();

    let mut members = store.get_room_members(&room).unwrap();
    members.sort();
    assert_eq!(members, [UserId::from("@alice:example.com"), UserId::from("@bob:example.com")]);
}
