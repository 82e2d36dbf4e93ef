//! Chat-network events as delivered by the application-service transport.
//!
//! Only the envelope is typed. Content stays a JSON value: the core routes
//! events by type and reads a handful of well-known fields, everything else
//! is the concrete backend's business.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{DeviceId, EventId, RoomId, SenderKey, SessionId, UserId};

/// Event type string, e.g. `m.room.message`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventType(String);

impl EventType {
    /// `m.room.member`
    pub const MEMBER: &'static str = "m.room.member";
    /// `m.room.message`
    pub const MESSAGE: &'static str = "m.room.message";
    /// `m.sticker`
    pub const STICKER: &'static str = "m.sticker";
    /// `m.reaction`
    pub const REACTION: &'static str = "m.reaction";
    /// `m.room.redaction`
    pub const REDACTION: &'static str = "m.room.redaction";
    /// `m.room.encrypted`
    pub const ENCRYPTED: &'static str = "m.room.encrypted";
    /// `m.room.encryption`
    pub const ENCRYPTION: &'static str = "m.room.encryption";
    /// `m.room.name`
    pub const ROOM_NAME: &'static str = "m.room.name";
    /// `m.room.topic`
    pub const ROOM_TOPIC: &'static str = "m.room.topic";
    /// `m.room.avatar`
    pub const ROOM_AVATAR: &'static str = "m.room.avatar";
    /// `m.receipt` (ephemeral)
    pub const RECEIPT: &'static str = "m.receipt";
    /// `m.typing` (ephemeral)
    pub const TYPING: &'static str = "m.typing";
    /// `m.presence` (ephemeral)
    pub const PRESENCE: &'static str = "m.presence";

    /// Wrap a raw type string.
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Raw type string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Ephemeral events are never persisted in the room timeline.
    pub fn is_ephemeral(&self) -> bool {
        matches!(self.0.as_str(), Self::RECEIPT | Self::TYPING | Self::PRESENCE)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EventType {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

impl PartialEq<&str> for EventType {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

/// Room membership state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Membership {
    /// Currently in the room.
    Join,
    /// Invited but not yet joined.
    Invite,
    /// Left, was kicked, or had an invite rejected/withdrawn.
    Leave,
    /// Banned.
    Ban,
    /// Asked to join.
    Knock,
}

impl Membership {
    /// Wire representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Join => "join",
            Self::Invite => "invite",
            Self::Leave => "leave",
            Self::Ban => "ban",
            Self::Knock => "knock",
        }
    }

    /// Parse the wire representation.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "join" => Some(Self::Join),
            "invite" => Some(Self::Invite),
            "leave" => Some(Self::Leave),
            "ban" => Some(Self::Ban),
            "knock" => Some(Self::Knock),
            _ => None,
        }
    }

    /// Join and invite count as "in the room" for encryption fan-out.
    pub fn is_member(self) -> bool {
        matches!(self, Self::Join | Self::Invite)
    }
}

/// A single chat-network event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Event type.
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Room the event belongs to. Empty for events without a room.
    #[serde(default, skip_serializing_if = "RoomId::is_empty")]
    pub room_id: RoomId,
    /// Sender. Empty for ephemeral events.
    #[serde(default, skip_serializing_if = "UserId::is_empty")]
    pub sender: UserId,
    /// Event ID. Empty for ephemeral events.
    #[serde(default, skip_serializing_if = "EventId::is_empty")]
    pub event_id: EventId,
    /// State key, present only on state events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_key: Option<String>,
    /// Origin server timestamp in milliseconds.
    #[serde(default, rename = "origin_server_ts")]
    pub timestamp: i64,
    /// Raw event content.
    #[serde(default)]
    pub content: Value,
    /// Unsigned data (transaction IDs, relations, age).
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub unsigned: Value,
}

impl Event {
    /// Build an event with empty ids and content. Mostly useful in tests and
    /// when re-wrapping decrypted payloads.
    pub fn new(
        event_type: impl Into<String>,
        room_id: RoomId,
        sender: UserId,
        content: Value,
    ) -> Self {
        Self {
            event_type: EventType::new(event_type),
            room_id,
            sender,
            event_id: EventId::default(),
            state_key: None,
            timestamp: 0,
            content,
            unsigned: Value::Null,
        }
    }

    /// True for state events (those carrying a state key).
    pub fn is_state(&self) -> bool {
        self.state_key.is_some()
    }

    /// `content.membership` of a member event.
    pub fn membership(&self) -> Option<Membership> {
        self.content.get("membership").and_then(Value::as_str).and_then(Membership::parse)
    }

    /// The state key interpreted as a user ID (member events).
    pub fn target_user(&self) -> Option<UserId> {
        self.state_key.as_deref().map(UserId::from)
    }

    /// `content.body` of a message event.
    pub fn body(&self) -> Option<&str> {
        self.content.get("body").and_then(Value::as_str)
    }

    /// Event this message replies to, if any.
    pub fn reply_to(&self) -> Option<EventId> {
        self.content
            .pointer("/m.relates_to/m.in_reply_to/event_id")
            .and_then(Value::as_str)
            .map(EventId::from)
    }
}

/// Content of an `m.room.encrypted` event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncryptedEventContent {
    /// Encryption algorithm, e.g. `m.megolm.v1.aes-sha2`.
    pub algorithm: String,
    /// Curve25519 key of the sending device.
    #[serde(default, skip_serializing_if = "SenderKey::is_empty")]
    pub sender_key: SenderKey,
    /// Sending device.
    #[serde(default, skip_serializing_if = "DeviceId::is_empty")]
    pub device_id: DeviceId,
    /// Megolm session the payload was encrypted with.
    #[serde(default, skip_serializing_if = "SessionId::is_empty")]
    pub session_id: SessionId,
    /// Ciphertext. A string for Megolm, a per-recipient map for Olm.
    pub ciphertext: Value,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn parses_member_event() {
        let raw = json!({
            "type": "m.room.member",
            "room_id": "!room:example.com",
            "sender": "@alice:example.com",
            "event_id": "$abc",
            "state_key": "@ghost_1:example.com",
            "origin_server_ts": 1_700_000_000_000_i64,
            "content": { "membership": "invite" }
        });
        let evt: Event = serde_json::from_value(raw).unwrap();

        assert_eq!(evt.event_type, EventType::MEMBER);
        assert_eq!(evt.membership(), Some(Membership::Invite));
        assert_eq!(evt.target_user(), Some(UserId::from("@ghost_1:example.com")));
        assert!(evt.is_state());
    }

    #[test]
    fn parses_ephemeral_event_without_ids() {
        let raw = json!({
            "type": "m.typing",
            "room_id": "!room:example.com",
            "content": { "user_ids": ["@alice:example.com"] }
        });
        let evt: Event = serde_json::from_value(raw).unwrap();

        assert!(evt.event_type.is_ephemeral());
        assert!(evt.sender.is_empty());
        assert!(evt.event_id.is_empty());
    }

    #[test]
    fn reply_target() {
        let evt = Event::new(
            EventType::MESSAGE,
            RoomId::from("!r:x"),
            UserId::from("@a:x"),
            json!({
                "body": "hi",
                "m.relates_to": { "m.in_reply_to": { "event_id": "$orig" } }
            }),
        );
        assert_eq!(evt.reply_to(), Some(EventId::from("$orig")));
        assert_eq!(evt.body(), Some("hi"));
    }

    #[test]
    fn membership_wire_format() {
        let all = [
            Membership::Join,
            Membership::Invite,
            Membership::Leave,
            Membership::Ban,
            Membership::Knock,
        ];
        for m in all {
            assert_eq!(Membership::parse(m.as_str()), Some(m));
        }
        assert!(Membership::Join.is_member());
        assert!(Membership::Invite.is_member());
        assert!(!Membership::Leave.is_member());
    }
}
