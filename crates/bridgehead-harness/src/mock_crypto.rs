//! Encryption engine double.
//!
//! "Ciphertext" is the plaintext event itself, `{"type": ..., "content": ...}`.
//! Decryption succeeds only for sessions marked available.

use std::{
    collections::HashSet,
    sync::{Mutex, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use bridgehead_core::{
    Crypto, CryptoError, DeviceId, EncryptedEventContent, Event, EventType, RoomId, SenderKey,
    SessionId, UserId,
};
use serde_json::{Value, json};

use crate::record::{Record, Recorder};

/// Algorithm name stamped on encrypted content.
pub const MOCK_ALGORITHM: &str = "m.megolm.v1.aes-sha2";

/// Session ID used for every outbound message.
pub const OUTBOUND_SESSION: &str = "mock-outbound";

/// Scriptable [`Crypto`].
#[derive(Debug)]
pub struct MockCrypto {
    recorder: Recorder,
    init_error: Option<CryptoError>,
    deliver_on_request: bool,
    sessions: Mutex<HashSet<SessionId>>,
}

impl MockCrypto {
    /// Engine with no sessions.
    pub fn new(recorder: Recorder) -> Self {
        Self {
            recorder,
            init_error: None,
            deliver_on_request: false,
            sessions: Mutex::new(HashSet::new()),
        }
    }

    /// Make `init` fail with `error`.
    #[must_use]
    pub fn failing_init(mut self, error: CryptoError) -> Self {
        self.init_error = Some(error);
        self
    }

    /// Make a requested session available immediately.
    #[must_use]
    pub fn delivering_requested_sessions(mut self) -> Self {
        self.deliver_on_request = true;
        self
    }

    /// Mark `session_id` as received.
    pub fn add_session(&self, session_id: impl Into<SessionId>) {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner).insert(session_id.into());
    }

    fn has_session(&self, session_id: &SessionId) -> bool {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner).contains(session_id)
    }
}

/// `m.room.encrypted` event wrapping `event_type`/`content` under `session_id`.
pub fn encrypted_event(
    room_id: &str,
    sender: &str,
    session_id: &str,
    event_type: &str,
    content: Value,
) -> Event {
    let mut evt = Event::new(
        EventType::ENCRYPTED,
        RoomId::from(room_id),
        UserId::from(sender),
        json!({
            "algorithm": MOCK_ALGORITHM,
            "sender_key": "mock-sender-key",
            "device_id": "MOCKDEVICE",
            "session_id": session_id,
            "ciphertext": {"type": event_type, "content": content},
        }),
    );
    evt.event_id = format!("$enc-{session_id}").into();
    evt
}

#[async_trait]
impl Crypto for MockCrypto {
    async fn handle_member_event(&self, evt: &Event) {
        if let Some(user_id) = evt.target_user() {
            self.recorder.push(Record::MemberTracked { room_id: evt.room_id.clone(), user_id });
        }
    }

    async fn decrypt(&self, evt: &Event) -> Result<Event, CryptoError> {
        let content: EncryptedEventContent = serde_json::from_value(evt.content.clone())
            .map_err(|e| CryptoError::DecryptionFailed(e.to_string()))?;
        if !self.has_session(&content.session_id) {
            return Err(CryptoError::NoSession {
                sender_key: content.sender_key.to_string(),
                session_id: content.session_id.to_string(),
            });
        }

        let event_type = content
            .ciphertext
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| CryptoError::DecryptionFailed("payload has no type".to_string()))?;
        let plaintext = content.ciphertext.get("content").cloned().unwrap_or(Value::Null);

        let mut decrypted =
            Event::new(event_type, evt.room_id.clone(), evt.sender.clone(), plaintext);
        decrypted.event_id = evt.event_id.clone();
        decrypted.timestamp = evt.timestamp;
        Ok(decrypted)
    }

    async fn encrypt(
        &self,
        _room_id: &RoomId,
        event_type: &EventType,
        content: &Value,
    ) -> Result<EncryptedEventContent, CryptoError> {
        Ok(EncryptedEventContent {
            algorithm: MOCK_ALGORITHM.to_string(),
            sender_key: SenderKey::default(),
            device_id: DeviceId::default(),
            session_id: SessionId::from(OUTBOUND_SESSION),
            ciphertext: json!({"type": event_type, "content": content}),
        })
    }

    async fn wait_for_session(
        &self,
        _room_id: &RoomId,
        _sender_key: &SenderKey,
        session_id: &SessionId,
        _timeout: Duration,
    ) -> bool {
        self.has_session(session_id)
    }

    async fn request_session(
        &self,
        _room_id: &RoomId,
        _sender_key: &SenderKey,
        session_id: &SessionId,
        _from_user: &UserId,
        _from_device: &DeviceId,
    ) {
        self.recorder.push(Record::SessionRequested { session_id: session_id.clone() });
        if self.deliver_on_request {
            self.add_session(session_id.clone());
        }
    }

    async fn reset_session(&self, _room_id: &RoomId) {}

    async fn init(&self) -> Result<(), CryptoError> {
        self.recorder.push(Record::CryptoInit);
        match &self.init_error {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    async fn start(&self) {
        self.recorder.push(Record::CryptoStart);
    }

    async fn stop(&self) {
        self.recorder.push(Record::CryptoStop);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn decrypts_only_known_sessions() {
        let crypto = MockCrypto::new(Recorder::new());
        let evt = encrypted_event(
            "!room:example.com",
            "@alice:example.com",
            "s1",
            "m.room.message",
            json!({"body": "hi"}),
        );

        let err = crypto.decrypt(&evt).await.unwrap_err();
        assert!(matches!(err, CryptoError::NoSession { ref session_id, .. } if session_id == "s1"));

        crypto.add_session("s1");
        let plain = crypto.decrypt(&evt).await.unwrap();
        assert_eq!(plain.event_type, "m.room.message");
        assert_eq!(plain.body(), Some("hi"));
        assert_eq!(plain.event_id, evt.event_id);
    }

    #[tokio::test]
    async fn encrypt_then_decrypt() {
        let crypto = MockCrypto::new(Recorder::new());
        crypto.add_session(OUTBOUND_SESSION);
        let room = RoomId::from("!room:example.com");

        let event_type = EventType::from("m.room.message");
        let content = crypto.encrypt(&room, &event_type, &json!({"body": "x"})).await.unwrap();
        let content = serde_json::to_value(content).unwrap();
        let evt = Event::new(EventType::ENCRYPTED, room, UserId::from("@bot:example.com"), content);
        assert_eq!(crypto.decrypt(&evt).await.unwrap().body(), Some("x"));
    }
}
