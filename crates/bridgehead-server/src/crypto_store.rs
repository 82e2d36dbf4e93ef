//! Persistence for end-to-bridge encryption session material.
//!
//! Rows are scoped by account (the bot's user ID) so several accounts can
//! share one database. Pickles are sealed with a key derived from the
//! configured pickle key before they are written.

use std::sync::Arc;

use bridgehead_core::{DeviceId, Membership, RoomId, SenderKey, SessionId, UserId};
use bridgehead_crypto::{NONCE_SIZE, PickleKey, SealedPickle};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{
    state_store::{MemberProfile, USER_PROFILE_TABLE, room_prefix},
    storage::{Database, Schema, StorageError, decode},
};

/// Table: crypto_account
/// Key: account_id
/// Value: CBOR [`StoredAccount`]
pub const ACCOUNT_TABLE: &str = "crypto_account";

/// Table: crypto_olm_session
/// Key: `account_id \0 sender_key \0 session_id`
/// Value: sealed pickle
pub const OLM_SESSION_TABLE: &str = "crypto_olm_session";

/// Table: crypto_megolm_inbound_session
/// Key: `account_id \0 room_id \0 sender_key \0 session_id`
/// Value: sealed pickle
pub const MEGOLM_INBOUND_TABLE: &str = "crypto_megolm_inbound_session";

/// Crypto store schema.
pub const CRYPTO_STORE_SCHEMA: Schema = Schema {
    component: "crypto_store",
    versions: &[&[ACCOUNT_TABLE, OLM_SESSION_TABLE, MEGOLM_INBOUND_TABLE]],
};

/// Source of nonces for sealing.
pub type NonceSource = Arc<dyn Fn(&mut [u8]) + Send + Sync>;

/// The encryption account of the store's user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    /// Device the account is logged in as.
    pub device_id: DeviceId,
    /// Whether the device keys were uploaded.
    pub shared: bool,
    /// Sync position of the engine.
    pub sync_token: String,
    /// Pickled account (plaintext).
    pub pickle: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct StoredAccount {
    device_id: DeviceId,
    shared: bool,
    sync_token: String,
    sealed: Vec<u8>,
}

/// Crypto store bound to one account.
#[derive(Clone)]
pub struct CryptoStore {
    db: Database,
    account_id: UserId,
    ghost_regex: Regex,
    pickle_key: PickleKey,
    nonces: NonceSource,
}

impl std::fmt::Debug for CryptoStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoStore").field("account_id", &self.account_id).finish_non_exhaustive()
    }
}

impl CryptoStore {
    /// Bind to `db` for `account_id` and declare the crypto tables.
    ///
    /// Users matching `ghost_regex` are puppeted by the bridge and never
    /// count as encryption recipients.
    pub fn new(
        db: Database,
        account_id: UserId,
        ghost_regex: Regex,
        pickle_key: &str,
        nonces: NonceSource,
    ) -> Self {
        db.declare(&CRYPTO_STORE_SCHEMA);
        let pickle_key = PickleKey::derive(pickle_key.as_bytes(), account_id.as_str());
        Self { db, account_id, ghost_regex, pickle_key, nonces }
    }

    /// Bring the crypto tables to the latest version.
    pub fn upgrade(&self) -> Result<(), StorageError> {
        self.db.upgrade(&CRYPTO_STORE_SCHEMA)
    }

    /// Account the store is scoped to.
    pub fn account_id(&self) -> &UserId {
        &self.account_id
    }

    /// Device ID of the stored account.
    ///
    /// Best effort: a missing account (first run) and a failed lookup both
    /// return the empty device ID. Failures are logged.
    pub fn find_device_id(&self) -> DeviceId {
        match self.db.get::<StoredAccount>(ACCOUNT_TABLE, self.account_id.as_str()) {
            Ok(Some(account)) => account.device_id,
            Ok(None) => DeviceId::default(),
            Err(e) => {
                warn!(account_id = %self.account_id, error = %e, "failed to read device ID");
                DeviceId::default()
            },
        }
    }

    /// Users that should receive keys for `room_id`.
    ///
    /// Joined and invited members, minus the store's own account and every
    /// ghost. Rows that fail to decode are logged and skipped.
    pub fn get_room_members(&self, room_id: &RoomId) -> Result<Vec<UserId>, StorageError> {
        let prefix = room_prefix(room_id);
        let rows = self.db.scan_prefix(USER_PROFILE_TABLE, &prefix)?;

        let mut members = Vec::new();
        for (key, value) in rows {
            let user_id = UserId::from(&key[prefix.len()..]);
            let member: MemberProfile = match decode(&value) {
                Ok(member) => member,
                Err(e) => {
                    warn!(%room_id, %user_id, error = %e, "failed to read member");
                    continue;
                },
            };
            if !matches!(member.membership, Membership::Join | Membership::Invite) {
                continue;
            }
            if user_id == self.account_id || self.ghost_regex.is_match(user_id.as_str()) {
                continue;
            }
            members.push(user_id);
        }
        Ok(members)
    }

    /// Save the account, sealing its pickle.
    pub fn put_account(&self, account: &Account) -> Result<(), StorageError> {
        let key = self.account_id.as_str();
        let stored = StoredAccount {
            device_id: account.device_id.clone(),
            shared: account.shared,
            sync_token: account.sync_token.clone(),
            sealed: self.seal(ACCOUNT_TABLE, key, &account.pickle),
        };
        self.db.put(ACCOUNT_TABLE, key, &stored)
    }

    /// Load the account, `None` on first run.
    pub fn get_account(&self) -> Result<Option<Account>, StorageError> {
        let key = self.account_id.as_str();
        let Some(stored) = self.db.get::<StoredAccount>(ACCOUNT_TABLE, key)? else {
            return Ok(None);
        };
        Ok(Some(Account {
            device_id: stored.device_id,
            shared: stored.shared,
            sync_token: stored.sync_token,
            pickle: self.open(ACCOUNT_TABLE, key, &stored.sealed)?,
        }))
    }

    /// Save an Olm session with `sender_key`.
    pub fn put_olm_session(
        &self,
        sender_key: &SenderKey,
        session_id: &SessionId,
        pickle: &[u8],
    ) -> Result<(), StorageError> {
        let key = format!("{}\0{sender_key}\0{session_id}", self.account_id);
        self.db.put_raw(OLM_SESSION_TABLE, &key, &self.seal(OLM_SESSION_TABLE, &key, pickle))
    }

    /// All Olm sessions with `sender_key`, in session ID order.
    pub fn get_olm_sessions(
        &self,
        sender_key: &SenderKey,
    ) -> Result<Vec<(SessionId, Vec<u8>)>, StorageError> {
        let prefix = format!("{}\0{sender_key}\0", self.account_id);
        self.db
            .scan_prefix(OLM_SESSION_TABLE, &prefix)?
            .into_iter()
            .map(|(key, sealed)| {
                let pickle = self.open(OLM_SESSION_TABLE, &key, &sealed)?;
                Ok((SessionId::from(&key[prefix.len()..]), pickle))
            })
            .collect()
    }

    /// Save a Megolm inbound session.
    pub fn put_group_session(
        &self,
        room_id: &RoomId,
        sender_key: &SenderKey,
        session_id: &SessionId,
        pickle: &[u8],
    ) -> Result<(), StorageError> {
        let key = self.group_session_key(room_id, sender_key, session_id);
        self.db.put_raw(MEGOLM_INBOUND_TABLE, &key, &self.seal(MEGOLM_INBOUND_TABLE, &key, pickle))
    }

    /// Load a Megolm inbound session.
    pub fn get_group_session(
        &self,
        room_id: &RoomId,
        sender_key: &SenderKey,
        session_id: &SessionId,
    ) -> Result<Option<Vec<u8>>, StorageError> {
        let key = self.group_session_key(room_id, sender_key, session_id);
        self.db
            .get_raw(MEGOLM_INBOUND_TABLE, &key)?
            .map(|sealed| self.open(MEGOLM_INBOUND_TABLE, &key, &sealed))
            .transpose()
    }

    /// True if the Megolm inbound session is stored.
    pub fn has_group_session(
        &self,
        room_id: &RoomId,
        sender_key: &SenderKey,
        session_id: &SessionId,
    ) -> Result<bool, StorageError> {
        let key = self.group_session_key(room_id, sender_key, session_id);
        Ok(self.db.get_raw(MEGOLM_INBOUND_TABLE, &key)?.is_some())
    }

    fn group_session_key(
        &self,
        room_id: &RoomId,
        sender_key: &SenderKey,
        session_id: &SessionId,
    ) -> String {
        format!("{}\0{room_id}\0{sender_key}\0{session_id}", self.account_id)
    }

    fn seal(&self, table: &str, key: &str, pickle: &[u8]) -> Vec<u8> {
        let mut nonce = [0u8; NONCE_SIZE];
        (self.nonces)(&mut nonce);
        let binding = row_binding(table, key);
        bridgehead_crypto::seal(&self.pickle_key, binding.as_bytes(), pickle, nonce).to_bytes()
    }

    fn open(&self, table: &str, key: &str, sealed: &[u8]) -> Result<Vec<u8>, StorageError> {
        let sealed =
            SealedPickle::from_bytes(sealed).map_err(|e| StorageError::Pickle(e.to_string()))?;
        bridgehead_crypto::open(&self.pickle_key, row_binding(table, key).as_bytes(), &sealed)
            .map_err(|e| StorageError::Pickle(e.to_string()))
    }
}

/// Associated data tying a sealed pickle to its row.
fn row_binding(table: &str, key: &str) -> String {
    format!("{table}\0{key}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        state_store::StateStore,
        storage::MEMORY_PATH,
    };

    const SELF_ID: &str = "@bot:example.com";

    fn counter_nonces() -> NonceSource {
        let next = std::sync::atomic::AtomicU8::new(0);
        Arc::new(move |buf: &mut [u8]| {
            buf.fill(next.fetch_add(1, std::sync::atomic::Ordering::SeqCst));
        })
    }

    fn stores() -> (StateStore, CryptoStore) {
        let db = Database::open(MEMORY_PATH, "test").unwrap();
        let state = StateStore::new(db.clone());
        let crypto = CryptoStore::new(
            db,
            UserId::from(SELF_ID),
            Regex::new("^@example_.+:example\\.com$").unwrap(),
            "pickle key",
            counter_nonces(),
        );
        state.upgrade().unwrap();
        crypto.upgrade().unwrap();
        (state, crypto)
    }

    #[test]
    fn room_members_exclude_self_and_ghosts() {
        let (state, crypto) = stores();
        let room = RoomId::from("!room:example.com");
        let set = |user: &str, membership| {
            state.set_membership(&room, &UserId::from(user), membership).unwrap();
        };

        set("@alice:example.com", Membership::Join);
        set("@bob:example.com", Membership::Invite);
        set("@example_g1:example.com", Membership::Join);
        set(SELF_ID, Membership::Join);
        set("@carol:example.com", Membership::Leave);
        set("@dave:example.com", Membership::Ban);
        let other = RoomId::from("!other:example.com");
        state.set_membership(&other, &UserId::from("@eve:example.com"), Membership::Join).unwrap();

        let mut members = crypto.get_room_members(&room).unwrap();
        members.sort();
        assert_eq!(members, [UserId::from("@alice:example.com"), UserId::from("@bob:example.com")]);
    }

    #[test]
    fn undecodable_member_rows_are_skipped() {
        let (state, crypto) = stores();
        let room = RoomId::from("!room:example.com");
        state.set_membership(&room, &UserId::from("@alice:example.com"), Membership::Join).unwrap();
        crypto
            .db
            .put_raw(
                USER_PROFILE_TABLE,
                &crate::state_store::profile_key(&room, &UserId::from("@bad:example.com")),
                b"\xff\xff",
            )
            .unwrap();

        assert_eq!(crypto.get_room_members(&room).unwrap(), [UserId::from("@alice:example.com")]);
    }

    #[test]
    fn device_id_is_empty_on_first_run() {
        let (_, crypto) = stores();
        assert!(crypto.find_device_id().is_empty());
    }

    #[test]
    fn device_id_lookup_failure_is_swallowed() {
        let (_, crypto) = stores();
        crypto.db.put_raw(ACCOUNT_TABLE, SELF_ID, b"\xff").unwrap();
        assert!(crypto.find_device_id().is_empty());
    }

    #[test]
    fn account_pickle_is_sealed_at_rest() {
        let (_, crypto) = stores();
        let account = Account {
            device_id: DeviceId::from("DEVICE"),
            shared: true,
            sync_token: "s1".to_string(),
            pickle: b"secret account pickle".to_vec(),
        };
        crypto.put_account(&account).unwrap();

        assert_eq!(crypto.get_account().unwrap(), Some(account));
        assert_eq!(crypto.find_device_id(), DeviceId::from("DEVICE"));

        let raw = crypto.db.get_raw(ACCOUNT_TABLE, SELF_ID).unwrap().unwrap();
        assert!(!raw.windows(6).any(|w| w == b"secret"));
    }

    #[test]
    fn sessions_are_scoped_and_listed() {
        let (_, crypto) = stores();
        let sender = SenderKey::from("curve");
        crypto.put_olm_session(&sender, &SessionId::from("s2"), b"two").unwrap();
        crypto.put_olm_session(&sender, &SessionId::from("s1"), b"one").unwrap();
        let other = SenderKey::from("other");
        crypto.put_olm_session(&other, &SessionId::from("s3"), b"three").unwrap();

        let sessions = crypto.get_olm_sessions(&sender).unwrap();
        assert_eq!(
            sessions,
            [(SessionId::from("s1"), b"one".to_vec()), (SessionId::from("s2"), b"two".to_vec())]
        );
    }

    #[test]
    fn group_sessions() {
        let (_, crypto) = stores();
        let room = RoomId::from("!room:example.com");
        let (sender, session) = (SenderKey::from("curve"), SessionId::from("megolm"));

        assert!(!crypto.has_group_session(&room, &sender, &session).unwrap());
        crypto.put_group_session(&room, &sender, &session, b"inbound").unwrap();
        assert!(crypto.has_group_session(&room, &sender, &session).unwrap());
        let inbound = crypto.get_group_session(&room, &sender, &session).unwrap();
        assert_eq!(inbound, Some(b"inbound".to_vec()));
    }

    #[test]
    fn sealed_rows_cannot_be_moved() {
        let (_, crypto) = stores();
        let room = RoomId::from("!room:example.com");
        let sender = SenderKey::from("curve");
        crypto.put_group_session(&room, &sender, &SessionId::from("a"), b"inbound").unwrap();

        let from = crypto.group_session_key(&room, &sender, &SessionId::from("a"));
        let to = crypto.group_session_key(&room, &sender, &SessionId::from("b"));
        let sealed = crypto.db.get_raw(MEGOLM_INBOUND_TABLE, &from).unwrap().unwrap();
        crypto.db.put_raw(MEGOLM_INBOUND_TABLE, &to, &sealed).unwrap();

        let err = crypto.get_group_session(&room, &sender, &SessionId::from("b")).unwrap_err();
        assert!(matches!(err, StorageError::Pickle(_)));
    }
}
