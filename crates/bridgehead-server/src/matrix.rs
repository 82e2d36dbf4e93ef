//! Routing of chat-network events to the backend.
//!
//! Every optional portal capability is checked before use. A portal that
//! lacks one simply does not see the event.

use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use async_trait::async_trait;
use bridgehead_core::{
    Crypto, CryptoError, EncryptedEventContent, Event, EventId, EventType, Membership,
    PermissionLevel, SenderKey, SessionId, User, UserId,
};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::{
    appservice::IntentSource,
    child::{ChildOverride, CommandProcessor},
    config::BaseConfig,
    processor::{EventHandler, EventProcessor},
    state_store::StateStore,
};

/// How long a decryption waits for a requested session.
pub const SESSION_WAIT: Duration = Duration::from_secs(3);

/// Event types the handler registers for.
pub const HANDLED_TYPES: &[&str] = &[
    EventType::MEMBER,
    EventType::ENCRYPTION,
    EventType::ENCRYPTED,
    EventType::MESSAGE,
    EventType::STICKER,
    EventType::REACTION,
    EventType::REDACTION,
    EventType::RECEIPT,
    EventType::TYPING,
    EventType::ROOM_NAME,
    EventType::ROOM_TOPIC,
    EventType::ROOM_AVATAR,
];

/// Routes chat-network events to portals, users and the command processor.
pub struct MatrixHandler {
    child: Arc<dyn ChildOverride>,
    intents: Arc<dyn IntentSource>,
    state_store: StateStore,
    crypto: Option<Arc<dyn Crypto>>,
    commands: Option<Arc<dyn CommandProcessor>>,
    bot_user_id: UserId,
    command_prefix: String,
    processor: Weak<EventProcessor>,
}

impl std::fmt::Debug for MatrixHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MatrixHandler")
            .field("bot_user_id", &self.bot_user_id)
            .finish_non_exhaustive()
    }
}

impl MatrixHandler {
    /// Handler for the bridge described by `config`.
    ///
    /// Decrypted events are re-dispatched through `processor`.
    pub fn new(
        config: &BaseConfig,
        child: Arc<dyn ChildOverride>,
        intents: Arc<dyn IntentSource>,
        state_store: StateStore,
        crypto: Option<Arc<dyn Crypto>>,
        processor: Weak<EventProcessor>,
    ) -> Self {
        Self {
            commands: child.command_processor(),
            child,
            intents,
            state_store,
            crypto,
            bot_user_id: config.bot_user_id(),
            command_prefix: config.bridge.command_prefix.clone(),
            processor,
        }
    }

    /// Register for every handled event type.
    pub fn register(self: &Arc<Self>, processor: &EventProcessor) {
        for event_type in HANDLED_TYPES {
            processor.on(*event_type, Arc::clone(self) as Arc<dyn EventHandler>);
        }
    }

    fn is_bridge_puppet(&self, user_id: &UserId) -> bool {
        *user_id == self.bot_user_id || self.child.is_ghost(user_id)
    }

    async fn handle_membership(&self, evt: &Event) {
        if let Err(e) = self.state_store.update_state(evt) {
            warn!(room_id = %evt.room_id, error = %e, "failed to cache membership");
        }
        if let Some(crypto) = &self.crypto {
            crypto.handle_member_event(evt).await;
        }

        let (Some(target), Some(membership)) = (evt.target_user(), evt.membership()) else {
            return;
        };
        if membership == Membership::Invite && target == self.bot_user_id {
            self.handle_bot_invite(evt).await;
            return;
        }

        let portal = self.child.get_portal(&evt.room_id);
        if membership == Membership::Invite && portal.is_none() && self.child.is_ghost(&target) {
            self.handle_private_chat_invite(evt, &target).await;
            return;
        }

        let Some(portal) = portal else {
            return;
        };
        let Some(handler) = portal.as_membership_handler() else {
            return;
        };
        if self.is_bridge_puppet(&evt.sender) {
            return;
        }
        let Some(user) = self.child.get_user(&evt.sender, false) else {
            return;
        };

        match membership {
            Membership::Leave if target == evt.sender => handler.handle_matrix_leave(user).await,
            Membership::Leave | Membership::Ban => {
                if let Some(ghost) = self.child.get_ghost(&target) {
                    handler.handle_matrix_kick(user, ghost).await;
                }
            },
            Membership::Invite => {
                if let Some(ghost) = self.child.get_ghost(&target) {
                    handler.handle_matrix_invite(user, ghost).await;
                }
            },
            Membership::Join | Membership::Knock => {},
        }
    }

    async fn handle_bot_invite(&self, evt: &Event) {
        let Some(user) = self.child.get_user(&evt.sender, true) else {
            return;
        };
        if let Err(e) = self.intents.bot_intent().join_room(&evt.room_id).await {
            warn!(room_id = %evt.room_id, error = %e, "failed to accept invite");
            return;
        }
        info!(room_id = %evt.room_id, inviter = %evt.sender, "joined room after invite");

        if user.permission_level() >= PermissionLevel::USER && user.management_room_id().is_none() {
            info!(user_id = %evt.sender, room_id = %evt.room_id, "set management room");
            user.set_management_room(evt.room_id.clone());
        }
    }

    async fn handle_private_chat_invite(&self, evt: &Event, target: &UserId) {
        let Some(user) = self.child.get_user(&evt.sender, true) else {
            return;
        };
        if user.permission_level() < PermissionLevel::USER {
            debug!(user_id = %evt.sender, "ignoring private chat invite from unprivileged user");
            return;
        }
        let Some(ghost) = self.child.get_ghost(target) else {
            return;
        };
        if let Err(e) = ghost.default_intent().join_room(&evt.room_id).await {
            warn!(
                room_id = %evt.room_id,
                ghost = %target,
                error = %e,
                "failed to accept private chat invite"
            );
            return;
        }
        self.child.create_private_portal(&evt.room_id, user, ghost).await;
    }

    async fn handle_encryption(&self, evt: &Event) {
        if let Err(e) = self.state_store.update_state(evt) {
            warn!(room_id = %evt.room_id, error = %e, "failed to cache encryption event");
        }
        if let Some(portal) = self.child.get_portal(&evt.room_id) {
            portal.mark_encrypted();
        }
    }

    async fn handle_encrypted(&self, evt: &Event) {
        let Some(crypto) = &self.crypto else {
            return;
        };
        let Some(decrypted) = decrypt(crypto.as_ref(), evt).await else {
            return;
        };
        if decrypted.event_type == EventType::ENCRYPTED {
            warn!(event_id = %evt.event_id, "decrypted payload is itself encrypted, dropping");
            return;
        }
        if let Some(processor) = self.processor.upgrade() {
            processor.dispatch(decrypted).await;
        }
    }

    async fn handle_message(&self, evt: &Event) {
        if self.is_bridge_puppet(&evt.sender) {
            return;
        }
        let Some(user) = self.child.get_user(&evt.sender, true) else {
            return;
        };
        let level = user.permission_level();
        if level < PermissionLevel::RELAY {
            debug!(user_id = %evt.sender, "ignoring message from blocked user");
            return;
        }

        if evt.event_type == EventType::MESSAGE && level >= PermissionLevel::USER {
            let command = self.as_command(user.as_ref(), evt);
            if let (Some(commands), Some(command)) = (&self.commands, command) {
                let user = Arc::clone(&user);
                commands.handle(&evt.room_id, &evt.event_id, user, command, evt.reply_to()).await;
                return;
            }
        }

        let Some(portal) = self.child.get_portal(&evt.room_id) else {
            return;
        };
        portal.receive_matrix_event(user, evt).await;
        if let Some(disappearing) = portal.as_disappearing() {
            disappearing.schedule_disappearing();
        }
    }

    /// Command text, if the message is a command.
    fn as_command<'a>(&self, user: &dyn User, evt: &'a Event) -> Option<&'a str> {
        let body = evt.body()?;
        if !self.command_prefix.is_empty() {
            if let Some(rest) = body.strip_prefix(self.command_prefix.as_str()) {
                return Some(rest.trim_start());
            }
        }
        (user.management_room_id().as_ref() == Some(&evt.room_id)).then_some(body)
    }

    async fn handle_receipt(&self, evt: &Event) {
        let Some(portal) = self.child.get_portal(&evt.room_id) else {
            return;
        };
        let Some(handler) = portal.as_read_receipt_handler() else {
            return;
        };
        let Some(receipts) = evt.content.as_object() else {
            return;
        };
        for (event_id, kinds) in receipts {
            let Some(readers) = kinds.get("m.read").and_then(Value::as_object) else {
                continue;
            };
            for (user_id, receipt) in readers {
                let user_id = UserId::from(user_id.as_str());
                if self.is_bridge_puppet(&user_id) {
                    continue;
                }
                let Some(user) = self.child.get_user(&user_id, false) else {
                    continue;
                };
                let ts = receipt.get("ts").and_then(Value::as_i64).unwrap_or_default();
                let event_id = EventId::from(event_id.as_str());
                handler.handle_matrix_read_receipt(user, &event_id, ts).await;
            }
        }
    }

    async fn handle_typing(&self, evt: &Event) {
        let Some(portal) = self.child.get_portal(&evt.room_id) else {
            return;
        };
        let Some(handler) = portal.as_typing_handler() else {
            return;
        };
        let typing: Vec<UserId> = evt
            .content
            .get("user_ids")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(Value::as_str)
            .map(UserId::from)
            .filter(|user_id| !self.is_bridge_puppet(user_id))
            .collect();
        handler.handle_matrix_typing(&typing).await;
    }

    async fn handle_meta(&self, evt: &Event) {
        if self.is_bridge_puppet(&evt.sender) {
            return;
        }
        let Some(portal) = self.child.get_portal(&evt.room_id) else {
            return;
        };
        let Some(handler) = portal.as_meta_handler() else {
            return;
        };
        let Some(user) = self.child.get_user(&evt.sender, false) else {
            return;
        };
        handler.handle_matrix_meta(user, evt).await;
    }
}

/// Decrypt `evt`, requesting and briefly waiting for a missing session.
async fn decrypt(crypto: &dyn Crypto, evt: &Event) -> Option<Event> {
    let err = match crypto.decrypt(evt).await {
        Ok(decrypted) => return Some(decrypted),
        Err(err) => err,
    };
    let CryptoError::NoSession { sender_key, session_id } = &err else {
        warn!(event_id = %evt.event_id, error = %err, "failed to decrypt event");
        return None;
    };

    let (sender_key, session_id) =
        (SenderKey::from(sender_key.as_str()), SessionId::from(session_id.as_str()));
    let device_id = serde_json::from_value::<EncryptedEventContent>(evt.content.clone())
        .map(|content| content.device_id)
        .unwrap_or_default();
    debug!(event_id = %evt.event_id, %session_id, "session missing, requesting it");
    crypto.request_session(&evt.room_id, &sender_key, &session_id, &evt.sender, &device_id).await;
    if !crypto.wait_for_session(&evt.room_id, &sender_key, &session_id, SESSION_WAIT).await {
        warn!(event_id = %evt.event_id, %session_id, "session did not arrive in time");
        return None;
    }

    match crypto.decrypt(evt).await {
        Ok(decrypted) => Some(decrypted),
        Err(e) => {
            warn!(
                event_id = %evt.event_id,
                error = %e,
                "failed to decrypt event after receiving session"
            );
            None
        },
    }
}

#[async_trait]
impl EventHandler for MatrixHandler {
    async fn handle(&self, evt: &Event) {
        debug!(event_type = %evt.event_type, room_id = %evt.room_id, "handling event");
        match evt.event_type.as_str() {
            EventType::MEMBER => self.handle_membership(evt).await,
            EventType::ENCRYPTION => self.handle_encryption(evt).await,
            EventType::ENCRYPTED => self.handle_encrypted(evt).await,
            EventType::MESSAGE
            | EventType::STICKER
            | EventType::REACTION
            | EventType::REDACTION => {
                self.handle_message(evt).await;
            },
            EventType::RECEIPT => self.handle_receipt(evt).await,
            EventType::TYPING => self.handle_typing(evt).await,
            EventType::ROOM_NAME | EventType::ROOM_TOPIC | EventType::ROOM_AVATAR => {
                self.handle_meta(evt).await;
            },
            _ => {},
        }
    }
}
