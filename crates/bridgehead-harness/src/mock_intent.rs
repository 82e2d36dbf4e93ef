//! Scripted homeserver identities.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, PoisonError},
};

use async_trait::async_trait;
use bridgehead_core::{
    ContentUri, EventId, EventType, Intent, IntentError, RoomId, UserId, Versions, Whoami,
};
use bridgehead_server::IntentSource;
use serde_json::Value;

/// A call made through a [`MockIntent`].
#[derive(Debug, Clone, PartialEq)]
pub enum IntentCall {
    /// `versions`
    Versions,
    /// `whoami`
    Whoami,
    /// `set_avatar_url`
    SetAvatarUrl(ContentUri),
    /// `set_display_name`
    SetDisplayName(String),
    /// `join_room`
    JoinRoom(RoomId),
    /// `send_message_event`
    SendMessage {
        /// Target room
        room_id: RoomId,
        /// Event type
        event_type: EventType,
        /// Content
        content: Value,
    },
}

/// [`Intent`] answering from scripted queues.
///
/// `versions` and `whoami` pop their queue; once a queue is empty they
/// succeed (advertising v1.1, and this intent's own user ID).
#[derive(Debug)]
pub struct MockIntent {
    user_id: UserId,
    versions: Mutex<VecDeque<Result<Versions, IntentError>>>,
    whoami: Mutex<VecDeque<Result<Whoami, IntentError>>>,
    join_error: Mutex<Option<IntentError>>,
    calls: Mutex<Vec<IntentCall>>,
}

impl MockIntent {
    /// Intent acting as `user_id`.
    pub fn new(user_id: impl Into<UserId>) -> Self {
        Self {
            user_id: user_id.into(),
            versions: Mutex::new(VecDeque::new()),
            whoami: Mutex::new(VecDeque::new()),
            join_error: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Queue a `versions` answer.
    pub fn push_versions(&self, result: Result<Versions, IntentError>) {
        self.versions.lock().unwrap_or_else(PoisonError::into_inner).push_back(result);
    }

    /// Queue a `whoami` answer.
    pub fn push_whoami(&self, result: Result<Whoami, IntentError>) {
        self.whoami.lock().unwrap_or_else(PoisonError::into_inner).push_back(result);
    }

    /// Make every `join_room` fail with `error`.
    pub fn fail_joins(&self, error: IntentError) {
        *self.join_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(error);
    }

    /// Calls so far, in order.
    pub fn calls(&self) -> Vec<IntentCall> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Rooms joined so far.
    pub fn joined_rooms(&self) -> Vec<RoomId> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                IntentCall::JoinRoom(room_id) => Some(room_id),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: IntentCall) {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).push(call);
    }
}

/// `whoami` answer for `user_id`.
pub fn whoami(user_id: &str) -> Whoami {
    Whoami { user_id: UserId::from(user_id), device_id: None, is_guest: false }
}

/// `versions` answer advertising exactly `versions`.
pub fn versions(versions: &[&str]) -> Versions {
    Versions {
        versions: versions.iter().map(|v| (*v).to_string()).collect(),
        ..Versions::default()
    }
}

#[async_trait]
impl Intent for MockIntent {
    fn user_id(&self) -> &UserId {
        &self.user_id
    }

    async fn versions(&self) -> Result<Versions, IntentError> {
        self.record(IntentCall::Versions);
        let next = self.versions.lock().unwrap_or_else(PoisonError::into_inner).pop_front();
        next.unwrap_or_else(|| Ok(versions(&["v1.1"])))
    }

    async fn whoami(&self) -> Result<Whoami, IntentError> {
        self.record(IntentCall::Whoami);
        let next = self.whoami.lock().unwrap_or_else(PoisonError::into_inner).pop_front();
        next.unwrap_or_else(|| Ok(whoami(self.user_id.as_str())))
    }

    async fn set_avatar_url(&self, uri: &ContentUri) -> Result<(), IntentError> {
        self.record(IntentCall::SetAvatarUrl(uri.clone()));
        Ok(())
    }

    async fn set_display_name(&self, name: &str) -> Result<(), IntentError> {
        self.record(IntentCall::SetDisplayName(name.to_string()));
        Ok(())
    }

    async fn join_room(&self, room_id: &RoomId) -> Result<(), IntentError> {
        self.record(IntentCall::JoinRoom(room_id.clone()));
        match self.join_error.lock().unwrap_or_else(PoisonError::into_inner).clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn send_message_event(
        &self,
        room_id: &RoomId,
        event_type: &EventType,
        content: &Value,
    ) -> Result<EventId, IntentError> {
        let n = {
            let mut calls = self.calls.lock().unwrap_or_else(PoisonError::into_inner);
            calls.push(IntentCall::SendMessage {
                room_id: room_id.clone(),
                event_type: event_type.clone(),
                content: content.clone(),
            });
            calls.len()
        };
        Ok(EventId::new(format!("$mock{n}")))
    }
}

/// [`IntentSource`] handing out [`MockIntent`]s, one per user.
#[derive(Debug)]
pub struct MockIntentSource {
    bot: Arc<MockIntent>,
    others: Mutex<HashMap<UserId, Arc<MockIntent>>>,
}

impl MockIntentSource {
    /// Source whose bot is `bot_user_id`.
    pub fn new(bot_user_id: impl Into<UserId>) -> Self {
        Self { bot: Arc::new(MockIntent::new(bot_user_id)), others: Mutex::new(HashMap::new()) }
    }

    /// The bot's intent, for scripting and assertions.
    pub fn bot(&self) -> Arc<MockIntent> {
        Arc::clone(&self.bot)
    }

    /// Intent of `user_id`, created on first use.
    pub fn mock_for(&self, user_id: &UserId) -> Arc<MockIntent> {
        if *user_id == *self.bot.user_id() {
            return self.bot();
        }
        let mut others = self.others.lock().unwrap_or_else(PoisonError::into_inner);
        let intent = others
            .entry(user_id.clone())
            .or_insert_with(|| Arc::new(MockIntent::new(user_id.clone())));
        Arc::clone(intent)
    }
}

impl IntentSource for MockIntentSource {
    fn bot_intent(&self) -> Arc<dyn Intent> {
        self.bot()
    }

    fn intent(&self, user_id: &UserId) -> Arc<dyn Intent> {
        self.mock_for(user_id)
    }
}
