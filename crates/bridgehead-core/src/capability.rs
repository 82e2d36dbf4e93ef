//! Capability contracts between the bridge core and a network backend.
//!
//! The core never constructs portals, users or ghosts. A backend hands them
//! out by identifier and the core talks to them only through these traits.
//!
//! Optional behaviour is split into narrow traits ([`MembershipHandlingPortal`],
//! [`TypingPortal`], ...). A [`Portal`] advertises one by overriding the
//! matching `as_*` accessor; the default returns `None`, and callers treat a
//! missing capability as a no-op rather than an error.

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use serde_json::Value;

use crate::{
    api::{Versions, Whoami},
    error::{CryptoError, DoublePuppetError, IntentError},
    event::{EncryptedEventContent, Event, EventType},
    ids::{ContentUri, DeviceId, EventId, RoomId, SenderKey, SessionId, UserId},
    permission::PermissionLevel,
};

/// Per-user scratchpad used by multi-step commands (login flows and the like).
pub type CommandState = HashMap<String, Value>;

/// An acting identity on the chat network: the bridge bot, a ghost, or a
/// double puppet.
#[async_trait]
pub trait Intent: Send + Sync {
    /// User this intent acts as.
    fn user_id(&self) -> &UserId;

    /// Spec versions advertised by the homeserver.
    async fn versions(&self) -> Result<Versions, IntentError>;

    /// Identity the intent's credentials authenticate as.
    async fn whoami(&self) -> Result<Whoami, IntentError>;

    /// Set the profile avatar. The empty URI removes it.
    async fn set_avatar_url(&self, uri: &ContentUri) -> Result<(), IntentError>;

    /// Set the profile display name. The empty string removes it.
    async fn set_display_name(&self, name: &str) -> Result<(), IntentError>;

    /// Join a room the intent was invited to.
    async fn join_room(&self, room_id: &RoomId) -> Result<(), IntentError>;

    /// Send a timeline event and return its ID.
    async fn send_message_event(
        &self,
        room_id: &RoomId,
        event_type: &EventType,
        content: &Value,
    ) -> Result<EventId, IntentError>;
}

/// A bridged conversation.
#[async_trait]
pub trait Portal: Send + Sync {
    /// True once the room has end-to-end encryption enabled.
    fn is_encrypted(&self) -> bool;

    /// True for one-to-one conversations.
    fn is_private_chat(&self) -> bool;

    /// Record that the room enabled encryption.
    fn mark_encrypted(&self);

    /// Identity used to speak in this conversation.
    fn main_intent(&self) -> Arc<dyn Intent>;

    /// Bridge a chat-network event to the remote network.
    async fn receive_matrix_event(&self, user: Arc<dyn User>, evt: &Event);

    /// Membership handling capability.
    fn as_membership_handler(&self) -> Option<&dyn MembershipHandlingPortal> {
        None
    }

    /// Read receipt capability.
    fn as_read_receipt_handler(&self) -> Option<&dyn ReadReceiptHandlingPortal> {
        None
    }

    /// Typing notification capability.
    fn as_typing_handler(&self) -> Option<&dyn TypingPortal> {
        None
    }

    /// Room metadata (name, topic, avatar) capability.
    fn as_meta_handler(&self) -> Option<&dyn MetaHandlingPortal> {
        None
    }

    /// Disappearing message capability.
    fn as_disappearing(&self) -> Option<&dyn DisappearingPortal> {
        None
    }
}

/// Portal that reacts to membership changes of bridge users and ghosts.
#[async_trait]
pub trait MembershipHandlingPortal: Send + Sync {
    /// `sender` left the room.
    async fn handle_matrix_leave(&self, sender: Arc<dyn User>);
    /// `sender` kicked `ghost` out of the room.
    async fn handle_matrix_kick(&self, sender: Arc<dyn User>, ghost: Arc<dyn Ghost>);
    /// `sender` invited `ghost` into the room.
    async fn handle_matrix_invite(&self, sender: Arc<dyn User>, ghost: Arc<dyn Ghost>);
}

/// Portal that forwards read receipts.
#[async_trait]
pub trait ReadReceiptHandlingPortal: Send + Sync {
    /// `sender` read up to `event_id` at `receipt_ts_ms` (Unix milliseconds).
    async fn handle_matrix_read_receipt(
        &self,
        sender: Arc<dyn User>,
        event_id: &EventId,
        receipt_ts_ms: i64,
    );
}

/// Portal that forwards typing notifications.
#[async_trait]
pub trait TypingPortal: Send + Sync {
    /// Complete list of users currently typing in the room.
    async fn handle_matrix_typing(&self, user_ids: &[UserId]);
}

/// Portal that forwards name, topic and avatar changes.
#[async_trait]
pub trait MetaHandlingPortal: Send + Sync {
    /// `sender` changed room metadata with `evt`.
    async fn handle_matrix_meta(&self, sender: Arc<dyn User>, evt: &Event);
}

/// Portal with messages that expire.
pub trait DisappearingPortal: Send + Sync {
    /// Arm timers for messages that should disappear.
    fn schedule_disappearing(&self);
}

/// A local operator of the bridge.
pub trait User: Send + Sync {
    /// User's chat-network ID.
    fn user_id(&self) -> UserId;

    /// Effective permission level.
    fn permission_level(&self) -> PermissionLevel;

    /// True if logged in to the remote network.
    fn is_logged_in(&self) -> bool;

    /// Private room between the user and the bridge bot, if one exists.
    fn management_room_id(&self) -> Option<RoomId>;

    /// Make `room_id` the user's management room.
    fn set_management_room(&self, room_id: RoomId);

    /// Current multi-step command state.
    fn command_state(&self) -> Option<CommandState>;

    /// Replace (or clear, with `None`) the command state.
    fn set_command_state(&self, state: Option<CommandState>);

    /// User's double puppet, if configured.
    fn double_puppet(&self) -> Option<Arc<dyn DoublePuppet>>;

    /// Ghost representing the user's own remote account, if any.
    fn ghost(&self) -> Option<Arc<dyn Ghost>>;
}

/// A chat-network account acting as itself for remote-network messages.
#[async_trait]
pub trait DoublePuppet: Send + Sync {
    /// Intent using the account's own credentials, if set up.
    fn custom_intent(&self) -> Option<Arc<dyn Intent>>;

    /// Replace the credentials. Verifies `access_token` authenticates as
    /// `user_id` before switching.
    async fn switch_custom_user_id(
        &self,
        access_token: &str,
        user_id: &UserId,
    ) -> Result<(), DoublePuppetError>;
}

/// A puppeted chat-network identity for a remote-network user.
pub trait Ghost: Send + Sync {
    /// Ghost's chat-network ID.
    fn user_id(&self) -> UserId;

    /// Remote-network user this ghost represents.
    fn remote_id(&self) -> String;

    /// Intent using the appservice's credentials for this ghost.
    fn default_intent(&self) -> Arc<dyn Intent>;

    /// Double puppet capability, for ghosts of logged-in users.
    fn as_double_puppet(&self) -> Option<&dyn DoublePuppet> {
        None
    }
}

/// End-to-bridge encryption engine.
#[async_trait]
pub trait Crypto: Send + Sync {
    /// Track device lists for a membership change.
    async fn handle_member_event(&self, evt: &Event);

    /// Decrypt an `m.room.encrypted` event into its plaintext form.
    async fn decrypt(&self, evt: &Event) -> Result<Event, CryptoError>;

    /// Encrypt content for every member device in the room.
    async fn encrypt(
        &self,
        room_id: &RoomId,
        event_type: &EventType,
        content: &Value,
    ) -> Result<EncryptedEventContent, CryptoError>;

    /// Wait up to `timeout` for a session to arrive. True if it did.
    async fn wait_for_session(
        &self,
        room_id: &RoomId,
        sender_key: &SenderKey,
        session_id: &SessionId,
        timeout: Duration,
    ) -> bool;

    /// Ask `from_user`'s `from_device` to share a session.
    async fn request_session(
        &self,
        room_id: &RoomId,
        sender_key: &SenderKey,
        session_id: &SessionId,
        from_user: &UserId,
        from_device: &DeviceId,
    );

    /// Drop the outbound session so the next message starts a new one.
    async fn reset_session(&self, room_id: &RoomId);

    /// Load or create the account and log in the device.
    async fn init(&self) -> Result<(), CryptoError>;

    /// Run the engine's sync loop. Returns once stopped.
    async fn start(&self);

    /// Stop the sync loop.
    async fn stop(&self);
}
