//! In-memory network backend.
//!
//! [`TestChild`] hands out [`TestPortal`]s, [`TestUser`]s and [`TestGhost`]s
//! from maps and appends every call the runtime makes into them to a shared
//! [`Recorder`].

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use bridgehead_core::{
    BridgeStateErrorMap, CommandState, Crypto, DisappearingPortal, DoublePuppet, Event, EventId,
    Ghost, Intent, MembershipHandlingPortal, MetaHandlingPortal, PermissionLevel, Portal,
    ReadReceiptHandlingPortal, RoomId, TypingPortal, User, UserId,
};
use bridgehead_server::{BridgeContext, ChildOverride, CommandProcessor, CryptoStore};

use crate::{
    mock_crypto::MockCrypto,
    mock_intent::MockIntent,
    record::{Record, Recorder},
};

/// Localpart prefix that marks a user ID as one of our ghosts.
pub const GHOST_PREFIX: &str = "@bridge_";

/// Optional capabilities a [`TestPortal`] advertises.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[allow(clippy::struct_excessive_bools)]
pub struct Capabilities {
    /// [`MembershipHandlingPortal`]
    pub membership: bool,
    /// [`ReadReceiptHandlingPortal`]
    pub receipts: bool,
    /// [`TypingPortal`]
    pub typing: bool,
    /// [`MetaHandlingPortal`]
    pub meta: bool,
    /// [`DisappearingPortal`]
    pub disappearing: bool,
}

impl Capabilities {
    /// Every capability.
    pub fn all() -> Self {
        Self { membership: true, receipts: true, typing: true, meta: true, disappearing: true }
    }

    /// No optional capability.
    pub fn none() -> Self {
        Self::default()
    }
}

/// A portal that records what it is asked to do.
pub struct TestPortal {
    room_id: RoomId,
    private_chat: bool,
    encrypted: AtomicBool,
    capabilities: Capabilities,
    intent: Arc<dyn Intent>,
    recorder: Recorder,
}

impl std::fmt::Debug for TestPortal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestPortal")
            .field("room_id", &self.room_id)
            .field("capabilities", &self.capabilities)
            .finish_non_exhaustive()
    }
}

impl TestPortal {
    /// Portal for `room_id` speaking as `intent`.
    pub fn new(
        room_id: RoomId,
        capabilities: Capabilities,
        intent: Arc<dyn Intent>,
        recorder: Recorder,
    ) -> Self {
        Self {
            room_id,
            private_chat: false,
            encrypted: AtomicBool::new(false),
            capabilities,
            intent,
            recorder,
        }
    }

    /// Room this portal bridges.
    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }
}

#[async_trait]
impl Portal for TestPortal {
    fn is_encrypted(&self) -> bool {
        self.encrypted.load(Ordering::SeqCst)
    }

    fn is_private_chat(&self) -> bool {
        self.private_chat
    }

    fn mark_encrypted(&self) {
        self.encrypted.store(true, Ordering::SeqCst);
    }

    fn main_intent(&self) -> Arc<dyn Intent> {
        Arc::clone(&self.intent)
    }

    async fn receive_matrix_event(&self, _user: Arc<dyn User>, evt: &Event) {
        self.recorder.push(Record::Received {
            room_id: self.room_id.clone(),
            sender: evt.sender.clone(),
            event_type: evt.event_type.to_string(),
            body: evt.body().map(str::to_string),
        });
    }

    fn as_membership_handler(&self) -> Option<&dyn MembershipHandlingPortal> {
        self.capabilities.membership.then_some(self as &dyn MembershipHandlingPortal)
    }

    fn as_read_receipt_handler(&self) -> Option<&dyn ReadReceiptHandlingPortal> {
        self.capabilities.receipts.then_some(self as &dyn ReadReceiptHandlingPortal)
    }

    fn as_typing_handler(&self) -> Option<&dyn TypingPortal> {
        self.capabilities.typing.then_some(self as &dyn TypingPortal)
    }

    fn as_meta_handler(&self) -> Option<&dyn MetaHandlingPortal> {
        self.capabilities.meta.then_some(self as &dyn MetaHandlingPortal)
    }

    fn as_disappearing(&self) -> Option<&dyn DisappearingPortal> {
        self.capabilities.disappearing.then_some(self as &dyn DisappearingPortal)
    }
}

#[async_trait]
impl MembershipHandlingPortal for TestPortal {
    async fn handle_matrix_leave(&self, sender: Arc<dyn User>) {
        self.recorder
            .push(Record::Leave { room_id: self.room_id.clone(), user_id: sender.user_id() });
    }

    async fn handle_matrix_kick(&self, sender: Arc<dyn User>, ghost: Arc<dyn Ghost>) {
        self.recorder.push(Record::Kick {
            room_id: self.room_id.clone(),
            sender: sender.user_id(),
            ghost: ghost.user_id(),
        });
    }

    async fn handle_matrix_invite(&self, sender: Arc<dyn User>, ghost: Arc<dyn Ghost>) {
        self.recorder.push(Record::Invite {
            room_id: self.room_id.clone(),
            sender: sender.user_id(),
            ghost: ghost.user_id(),
        });
    }
}

#[async_trait]
impl ReadReceiptHandlingPortal for TestPortal {
    async fn handle_matrix_read_receipt(
        &self,
        sender: Arc<dyn User>,
        event_id: &EventId,
        receipt_ts_ms: i64,
    ) {
        self.recorder.push(Record::ReadReceipt {
            room_id: self.room_id.clone(),
            user_id: sender.user_id(),
            event_id: event_id.clone(),
            ts: receipt_ts_ms,
        });
    }
}

#[async_trait]
impl TypingPortal for TestPortal {
    async fn handle_matrix_typing(&self, user_ids: &[UserId]) {
        self.recorder
            .push(Record::Typing { room_id: self.room_id.clone(), user_ids: user_ids.to_vec() });
    }
}

#[async_trait]
impl MetaHandlingPortal for TestPortal {
    async fn handle_matrix_meta(&self, sender: Arc<dyn User>, evt: &Event) {
        self.recorder.push(Record::Meta {
            room_id: self.room_id.clone(),
            sender: sender.user_id(),
            event_type: evt.event_type.to_string(),
        });
    }
}

impl DisappearingPortal for TestPortal {
    fn schedule_disappearing(&self) {
        self.recorder.push(Record::Disappearing { room_id: self.room_id.clone() });
    }
}

/// A local user with a fixed permission level.
#[derive(Debug)]
pub struct TestUser {
    user_id: UserId,
    level: PermissionLevel,
    management_room: Mutex<Option<RoomId>>,
    command_state: Mutex<Option<CommandState>>,
}

impl TestUser {
    /// `user_id` at `level`, without a management room.
    pub fn new(user_id: UserId, level: PermissionLevel) -> Self {
        Self { user_id, level, management_room: Mutex::new(None), command_state: Mutex::new(None) }
    }
}

impl User for TestUser {
    fn user_id(&self) -> UserId {
        self.user_id.clone()
    }

    fn permission_level(&self) -> PermissionLevel {
        self.level
    }

    fn is_logged_in(&self) -> bool {
        false
    }

    fn management_room_id(&self) -> Option<RoomId> {
        self.management_room.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn set_management_room(&self, room_id: RoomId) {
        *self.management_room.lock().unwrap_or_else(PoisonError::into_inner) = Some(room_id);
    }

    fn command_state(&self) -> Option<CommandState> {
        self.command_state.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn set_command_state(&self, state: Option<CommandState>) {
        *self.command_state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn double_puppet(&self) -> Option<Arc<dyn DoublePuppet>> {
        None
    }

    fn ghost(&self) -> Option<Arc<dyn Ghost>> {
        None
    }
}

/// A ghost acting through the intent source it was created from.
pub struct TestGhost {
    user_id: UserId,
    intent: Arc<dyn Intent>,
}

impl std::fmt::Debug for TestGhost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestGhost").field("user_id", &self.user_id).finish_non_exhaustive()
    }
}

impl TestGhost {
    /// Ghost `user_id` acting as `intent`.
    pub fn new(user_id: UserId, intent: Arc<dyn Intent>) -> Self {
        Self { user_id, intent }
    }
}

impl Ghost for TestGhost {
    fn user_id(&self) -> UserId {
        self.user_id.clone()
    }

    fn remote_id(&self) -> String {
        self.user_id
            .localpart()
            .and_then(|localpart| localpart.strip_prefix(&GHOST_PREFIX[1..]))
            .unwrap_or_default()
            .to_string()
    }

    fn default_intent(&self) -> Arc<dyn Intent> {
        Arc::clone(&self.intent)
    }
}

struct RecordingCommands(Recorder);

#[async_trait]
impl CommandProcessor for RecordingCommands {
    async fn handle(
        &self,
        room_id: &RoomId,
        _event_id: &EventId,
        user: Arc<dyn User>,
        message: &str,
        _reply_to: Option<EventId>,
    ) {
        self.0.push(Record::Command {
            room_id: room_id.clone(),
            user_id: user.user_id(),
            message: message.to_string(),
        });
    }
}

/// Backend double.
///
/// Users unknown to the backend are created at `default_level` when the
/// runtime asks for creation. Any user ID starting with [`GHOST_PREFIX`] is a
/// ghost.
pub struct TestChild {
    example: String,
    recorder: Recorder,
    crypto: Option<Arc<MockCrypto>>,
    tables: &'static [&'static [&'static str]],
    human_errors: BridgeStateErrorMap,
    commands: bool,
    default_level: PermissionLevel,
    portals: Mutex<HashMap<RoomId, Arc<TestPortal>>>,
    users: Mutex<HashMap<UserId, Arc<TestUser>>>,
    ghosts: Mutex<HashMap<UserId, Arc<TestGhost>>>,
    context: Mutex<Option<BridgeContext>>,
    crypto_store: Mutex<Option<CryptoStore>>,
}

impl std::fmt::Debug for TestChild {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestChild")
            .field("encryption", &self.crypto.is_some())
            .field("default_level", &self.default_level)
            .finish_non_exhaustive()
    }
}

impl TestChild {
    /// Backend whose example configuration is `example`.
    pub fn new(example: impl Into<String>, recorder: Recorder) -> Self {
        Self {
            example: example.into(),
            recorder,
            crypto: None,
            tables: &[],
            human_errors: BridgeStateErrorMap::new(),
            commands: false,
            default_level: PermissionLevel::USER,
            portals: Mutex::new(HashMap::new()),
            users: Mutex::new(HashMap::new()),
            ghosts: Mutex::new(HashMap::new()),
            context: Mutex::new(None),
            crypto_store: Mutex::new(None),
        }
    }

    /// Hand `crypto` to the runtime when encryption is allowed.
    #[must_use]
    pub fn with_crypto(mut self, crypto: Arc<MockCrypto>) -> Self {
        self.crypto = Some(crypto);
        self
    }

    /// Declare `tables` as the backend's schema.
    #[must_use]
    pub fn with_tables(mut self, tables: &'static [&'static [&'static str]]) -> Self {
        self.tables = tables;
        self
    }

    /// Register `errors` as the backend's human-readable messages.
    #[must_use]
    pub fn with_human_errors(mut self, errors: BridgeStateErrorMap) -> Self {
        self.human_errors = errors;
        self
    }

    /// Record commands instead of treating them as messages.
    #[must_use]
    pub fn with_commands(mut self) -> Self {
        self.commands = true;
        self
    }

    /// Level of users created on first sight.
    #[must_use]
    pub fn with_default_level(mut self, level: PermissionLevel) -> Self {
        self.default_level = level;
        self
    }

    /// Bridge `room_id` with the given capabilities.
    pub fn add_portal(
        &self,
        room_id: impl Into<RoomId>,
        capabilities: Capabilities,
    ) -> Arc<TestPortal> {
        let room_id = room_id.into();
        let portal = Arc::new(TestPortal::new(
            room_id.clone(),
            capabilities,
            self.bot_intent(),
            self.recorder.clone(),
        ));
        let mut portals = self.portals.lock().unwrap_or_else(PoisonError::into_inner);
        portals.insert(room_id, Arc::clone(&portal));
        portal
    }

    /// Known user `user_id` at `level`.
    pub fn add_user(&self, user_id: impl Into<UserId>, level: PermissionLevel) -> Arc<TestUser> {
        let user_id = user_id.into();
        let user = Arc::new(TestUser::new(user_id.clone(), level));
        let mut users = self.users.lock().unwrap_or_else(PoisonError::into_inner);
        users.insert(user_id, Arc::clone(&user));
        user
    }

    /// User `user_id`, if known.
    pub fn user(&self, user_id: &UserId) -> Option<Arc<TestUser>> {
        self.users.lock().unwrap_or_else(PoisonError::into_inner).get(user_id).cloned()
    }

    /// The shared call log.
    pub fn recorder(&self) -> &Recorder {
        &self.recorder
    }

    /// Records so far.
    pub fn records(&self) -> Vec<Record> {
        self.recorder.records()
    }

    /// Context received in `init`.
    pub fn context(&self) -> Option<BridgeContext> {
        self.context.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Store handed to `make_crypto`.
    pub fn crypto_store(&self) -> Option<CryptoStore> {
        self.crypto_store.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn intent_for(&self, user_id: &UserId) -> Arc<dyn Intent> {
        match self.context() {
            Some(ctx) => ctx.intents.intent(user_id),
            None => Arc::new(MockIntent::new(user_id.clone())),
        }
    }

    fn bot_intent(&self) -> Arc<dyn Intent> {
        match self.context() {
            Some(ctx) => ctx.intents.bot_intent(),
            None => Arc::new(MockIntent::new("@bridgebot:example.com")),
        }
    }
}

#[async_trait]
impl ChildOverride for TestChild {
    fn example_config(&self) -> &str {
        &self.example
    }

    fn database_tables(&self) -> &'static [&'static [&'static str]] {
        self.tables
    }

    fn human_errors(&self) -> BridgeStateErrorMap {
        self.human_errors.clone()
    }

    fn command_processor(&self) -> Option<Arc<dyn CommandProcessor>> {
        self.commands.then(|| {
            Arc::new(RecordingCommands(self.recorder.clone())) as Arc<dyn CommandProcessor>
        })
    }

    fn make_crypto(&self, store: CryptoStore, _bot: Arc<dyn Intent>) -> Option<Arc<dyn Crypto>> {
        *self.crypto_store.lock().unwrap_or_else(PoisonError::into_inner) = Some(store);
        self.crypto.clone().map(|crypto| crypto as Arc<dyn Crypto>)
    }

    async fn init(&self, ctx: BridgeContext) {
        *self.context.lock().unwrap_or_else(PoisonError::into_inner) = Some(ctx);
        self.recorder.push(Record::Init);
    }

    async fn start(&self) {
        self.recorder.push(Record::Start);
    }

    async fn stop(&self) {
        self.recorder.push(Record::Stop);
    }

    fn get_portal(&self, room_id: &RoomId) -> Option<Arc<dyn Portal>> {
        let portals = self.portals.lock().unwrap_or_else(PoisonError::into_inner);
        portals.get(room_id).map(|portal| Arc::clone(portal) as Arc<dyn Portal>)
    }

    fn get_user(&self, user_id: &UserId, create: bool) -> Option<Arc<dyn User>> {
        let mut users = self.users.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(user) = users.get(user_id) {
            return Some(Arc::clone(user) as Arc<dyn User>);
        }
        if !create {
            return None;
        }
        let user = Arc::new(TestUser::new(user_id.clone(), self.default_level));
        users.insert(user_id.clone(), Arc::clone(&user));
        Some(user)
    }

    fn is_ghost(&self, user_id: &UserId) -> bool {
        user_id.as_str().starts_with(GHOST_PREFIX)
    }

    fn get_ghost(&self, user_id: &UserId) -> Option<Arc<dyn Ghost>> {
        if !self.is_ghost(user_id) {
            return None;
        }
        let mut ghosts = self.ghosts.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(ghost) = ghosts.get(user_id) {
            return Some(Arc::clone(ghost) as Arc<dyn Ghost>);
        }
        let ghost = Arc::new(TestGhost::new(user_id.clone(), self.intent_for(user_id)));
        ghosts.insert(user_id.clone(), Arc::clone(&ghost));
        Some(ghost)
    }

    async fn create_private_portal(
        &self,
        room_id: &RoomId,
        user: Arc<dyn User>,
        ghost: Arc<dyn Ghost>,
    ) {
        self.recorder.push(Record::PrivatePortal {
            room_id: room_id.clone(),
            user_id: user.user_id(),
            ghost: ghost.user_id(),
        });
        self.add_portal(room_id.clone(), Capabilities::all());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn users_are_created_only_on_request() {
        let child = TestChild::new("", Recorder::new()).with_default_level(PermissionLevel::RELAY);
        let alice = UserId::from("@alice:example.com");

        assert!(child.get_user(&alice, false).is_none());
        let created = child.get_user(&alice, true).unwrap();
        assert_eq!(created.permission_level(), PermissionLevel::RELAY);
        assert!(child.get_user(&alice, false).is_some());
    }

    #[test]
    fn ghosts_are_recognised_by_prefix() {
        let child = TestChild::new("", Recorder::new());
        let ghost_id = UserId::from("@bridge_42:example.com");

        assert!(child.is_ghost(&ghost_id));
        assert!(!child.is_ghost(&UserId::from("@alice:example.com")));
        assert_eq!(child.get_ghost(&ghost_id).unwrap().remote_id(), "42");
        assert!(child.get_ghost(&UserId::from("@alice:example.com")).is_none());
    }

    #[test]
    fn capabilities_follow_flags() {
        let child = TestChild::new("", Recorder::new());
        let plain = child.add_portal("!plain:example.com", Capabilities::none());
        let full = child
            .add_portal("!full:example.com", Capabilities { typing: true, ..Capabilities::none() });

        assert!(plain.as_typing_handler().is_none());
        assert!(full.as_typing_handler().is_some());
        assert!(full.as_membership_handler().is_none());
    }
}
