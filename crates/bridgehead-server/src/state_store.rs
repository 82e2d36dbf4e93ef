//! Chat-network room state cache.
//!
//! Membership and profile of every user the bridge has seen in a room, the
//! encryption settings of each room and which puppets are registered. The
//! crypto store reads the membership rows directly for recipient lists.

use bridgehead_core::{Event, EventType, Membership, RoomId, UserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::trace;

use crate::storage::{Database, Schema, StorageError};

/// Table: mx_user_profile
/// Key: `room_id \0 user_id`
/// Value: CBOR [`MemberProfile`]
pub const USER_PROFILE_TABLE: &str = "mx_user_profile";

/// Table: mx_room_state
/// Key: room_id
/// Value: CBOR [`RoomState`]
pub const ROOM_STATE_TABLE: &str = "mx_room_state";

/// Table: mx_registrations
/// Key: user_id
/// Value: CBOR `true`
pub const REGISTRATIONS_TABLE: &str = "mx_registrations";

/// State store schema.
pub const STATE_STORE_SCHEMA: Schema = Schema {
    component: "state_store",
    versions: &[&[USER_PROFILE_TABLE, ROOM_STATE_TABLE, REGISTRATIONS_TABLE]],
};

/// A user's membership and profile in one room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberProfile {
    /// Membership state.
    pub membership: Membership,
    /// Room-specific display name.
    #[serde(default)]
    pub displayname: String,
    /// Room-specific avatar.
    #[serde(default)]
    pub avatar_url: String,
}

/// Per-room state the bridge cares about.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoomState {
    /// JSON content of `m.room.encryption`, if the room is encrypted.
    #[serde(default)]
    pub encryption: Option<String>,
}

/// Key of a membership row.
pub fn profile_key(room_id: &RoomId, user_id: &UserId) -> String {
    format!("{room_id}\0{user_id}")
}

/// Prefix shared by every membership row of a room.
pub fn room_prefix(room_id: &RoomId) -> String {
    format!("{room_id}\0")
}

/// State store over the shared database.
#[derive(Debug, Clone)]
pub struct StateStore {
    db: Database,
}

impl StateStore {
    /// Bind to `db` and declare the state store tables.
    pub fn new(db: Database) -> Self {
        db.declare(&STATE_STORE_SCHEMA);
        Self { db }
    }

    /// Bring the state store tables to the latest version.
    pub fn upgrade(&self) -> Result<(), StorageError> {
        self.db.upgrade(&STATE_STORE_SCHEMA)
    }

    /// Record `user_id`'s membership, keeping any known profile.
    pub fn set_membership(
        &self,
        room_id: &RoomId,
        user_id: &UserId,
        membership: Membership,
    ) -> Result<(), StorageError> {
        let mut member = self.get_member(room_id, user_id)?.unwrap_or(MemberProfile {
            membership,
            displayname: String::new(),
            avatar_url: String::new(),
        });
        member.membership = membership;
        self.set_member(room_id, user_id, &member)
    }

    /// Record membership and profile.
    pub fn set_member(
        &self,
        room_id: &RoomId,
        user_id: &UserId,
        member: &MemberProfile,
    ) -> Result<(), StorageError> {
        self.db.put(USER_PROFILE_TABLE, &profile_key(room_id, user_id), member)
    }

    /// Membership and profile, `None` if never seen.
    pub fn get_member(
        &self,
        room_id: &RoomId,
        user_id: &UserId,
    ) -> Result<Option<MemberProfile>, StorageError> {
        self.db.get(USER_PROFILE_TABLE, &profile_key(room_id, user_id))
    }

    /// Membership, `Leave` if never seen.
    pub fn get_membership(
        &self,
        room_id: &RoomId,
        user_id: &UserId,
    ) -> Result<Membership, StorageError> {
        Ok(self.get_member(room_id, user_id)?.map_or(Membership::Leave, |m| m.membership))
    }

    /// Record the room's `m.room.encryption` content.
    pub fn set_encryption_event(
        &self,
        room_id: &RoomId,
        content: &Value,
    ) -> Result<(), StorageError> {
        let mut state: RoomState =
            self.db.get(ROOM_STATE_TABLE, room_id.as_str())?.unwrap_or_default();
        state.encryption = Some(content.to_string());
        self.db.put(ROOM_STATE_TABLE, room_id.as_str(), &state)
    }

    /// The room's `m.room.encryption` content, if any.
    pub fn get_encryption_event(&self, room_id: &RoomId) -> Result<Option<Value>, StorageError> {
        let state: Option<RoomState> = self.db.get(ROOM_STATE_TABLE, room_id.as_str())?;
        state
            .and_then(|s| s.encryption)
            .map(|raw| {
                serde_json::from_str(&raw).map_err(|e| StorageError::Serialization(e.to_string()))
            })
            .transpose()
    }

    /// True once the room has an encryption event.
    pub fn is_encrypted(&self, room_id: &RoomId) -> Result<bool, StorageError> {
        Ok(self.get_encryption_event(room_id)?.is_some())
    }

    /// True if the puppet was registered with the homeserver.
    pub fn is_registered(&self, user_id: &UserId) -> Result<bool, StorageError> {
        Ok(self.db.get::<bool>(REGISTRATIONS_TABLE, user_id.as_str())?.unwrap_or(false))
    }

    /// Remember that the puppet is registered.
    pub fn mark_registered(&self, user_id: &UserId) -> Result<(), StorageError> {
        self.db.put(REGISTRATIONS_TABLE, user_id.as_str(), &true)
    }

    /// Apply a state event to the cache. Other events are ignored.
    pub fn update_state(&self, evt: &Event) -> Result<(), StorageError> {
        if evt.event_type == EventType::MEMBER {
            let (Some(target), Some(membership)) = (evt.target_user(), evt.membership()) else {
                return Ok(());
            };
            trace!(
                room_id = %evt.room_id,
                user_id = %target,
                membership = membership.as_str(),
                "membership"
            );
            let str_field = |name: &str| {
                evt.content.get(name).and_then(Value::as_str).unwrap_or_default().to_string()
            };
            let member = MemberProfile {
                membership,
                displayname: str_field("displayname"),
                avatar_url: str_field("avatar_url"),
            };
            self.set_member(&evt.room_id, &target, &member)
        } else if evt.event_type == EventType::ENCRYPTION {
            self.set_encryption_event(&evt.room_id, &evt.content)
        } else {
            Ok(())
        }
    }
}
