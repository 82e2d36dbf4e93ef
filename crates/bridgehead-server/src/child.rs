//! The contract a network backend implements.
//!
//! The runtime never builds portals, users or ghosts itself. It asks the
//! [`ChildOverride`] for them by ID and checks their optional capabilities
//! before use.

use std::sync::Arc;

use async_trait::async_trait;
use bridgehead_core::{
    BridgeStateErrorMap, Crypto, EventId, Ghost, Intent, Portal, RoomId, User, UserId,
};

use crate::{
    appservice::IntentSource,
    config::{BaseConfig, ConfigDocument},
    crypto_store::CryptoStore,
    error::ConfigError,
    state_store::StateStore,
    status_reporter::BridgeStateReporter,
    storage::Database,
    version::BridgeInfo,
};

/// Handles bot commands.
#[async_trait]
pub trait CommandProcessor: Send + Sync {
    /// Run `message` as a command from `user`, sent as `event_id` in
    /// `room_id`.
    async fn handle(
        &self,
        room_id: &RoomId,
        event_id: &EventId,
        user: Arc<dyn User>,
        message: &str,
        reply_to: Option<EventId>,
    );
}

/// Everything the runtime built that a backend may need.
#[derive(Clone)]
pub struct BridgeContext {
    /// Name and version of the bridge.
    pub info: Arc<BridgeInfo>,
    /// Shared configuration sections.
    pub config: Arc<BaseConfig>,
    /// Full configuration document, including backend sections.
    pub document: Arc<ConfigDocument>,
    /// Shared database. Backends declare their tables through
    /// [`ChildOverride::database_tables`].
    pub db: Database,
    /// Room state cache.
    pub state_store: StateStore,
    /// Acting identities.
    pub intents: Arc<dyn IntentSource>,
    /// Encryption engine, when enabled.
    pub crypto: Option<Arc<dyn Crypto>>,
    /// Bridge-state reporting.
    pub reporter: Arc<BridgeStateReporter>,
}

impl std::fmt::Debug for BridgeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeContext")
            .field("info", &self.info.name)
            .field("encryption", &self.crypto.is_some())
            .finish_non_exhaustive()
    }
}

/// A network backend.
#[async_trait]
pub trait ChildOverride: Send + Sync {
    /// Example configuration (TOML). Its keys and defaults are the base the
    /// user's file is upgraded against.
    fn example_config(&self) -> &str;

    /// Read the backend's own sections. Called once after the configuration
    /// is loaded; backends keep what they need behind interior mutability.
    fn configure(&self, _document: &ConfigDocument) -> Result<(), ConfigError> {
        Ok(())
    }

    /// Backend tables, one slice per schema version.
    fn database_tables(&self) -> &'static [&'static [&'static str]] {
        &[]
    }

    /// Messages for the backend's bridge-state error codes.
    fn human_errors(&self) -> BridgeStateErrorMap {
        BridgeStateErrorMap::new()
    }

    /// Command handler for management rooms and prefixed messages.
    fn command_processor(&self) -> Option<Arc<dyn CommandProcessor>> {
        None
    }

    /// Build the encryption engine over `store`. `None` disables encryption.
    fn make_crypto(&self, _store: CryptoStore, _bot: Arc<dyn Intent>) -> Option<Arc<dyn Crypto>> {
        None
    }

    /// Backend initialization, after every runtime subsystem exists.
    async fn init(&self, ctx: BridgeContext);

    /// Start the backend. Called after the runtime is connected.
    async fn start(&self);

    /// Stop the backend.
    async fn stop(&self);

    /// Portal for a chat-network room.
    fn get_portal(&self, room_id: &RoomId) -> Option<Arc<dyn Portal>>;

    /// Local user, created on first sight if `create` is set.
    fn get_user(&self, user_id: &UserId, create: bool) -> Option<Arc<dyn User>>;

    /// True if `user_id` is one of our ghosts.
    fn is_ghost(&self, user_id: &UserId) -> bool;

    /// Ghost by chat-network ID.
    fn get_ghost(&self, user_id: &UserId) -> Option<Arc<dyn Ghost>>;

    /// Turn `room_id` into a private chat between `user` and `ghost`.
    async fn create_private_portal(
        &self,
        room_id: &RoomId,
        user: Arc<dyn User>,
        ghost: Arc<dyn Ghost>,
    );
}
