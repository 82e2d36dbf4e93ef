//! Bridgehead core: the I/O-free half of the bridge runtime.
//!
//! This crate defines what a network backend must provide and what the
//! runtime reports outward, without touching the network, the disk or a
//! clock of its own. The runtime (`bridgehead-server`) supplies real I/O.
//!
//! # Components
//!
//! - [`capability`]: role contracts (portal, user, ghost, double puppet,
//!   intent, crypto engine) with optional capabilities
//! - [`status`]: connectivity snapshots and their deduplication
//! - [`env`]: time, sleep and randomness behind a trait
//! - [`ids`], [`event`], [`api`]: chat-network identifiers, events and
//!   response bodies
//! - [`permission`]: permission levels and the lookup table

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod api;
pub mod capability;
pub mod env;
pub mod error;
pub mod event;
pub mod ids;
pub mod permission;
pub mod status;

pub use api::{Versions, Whoami};
pub use capability::{
    CommandState, Crypto, DisappearingPortal, DoublePuppet, Ghost, Intent, MembershipHandlingPortal,
    MetaHandlingPortal, Portal, ReadReceiptHandlingPortal, TypingPortal, User,
};
pub use env::Environment;
pub use error::{CryptoError, DoublePuppetError, IntentError};
pub use event::{EncryptedEventContent, Event, EventType, Membership};
pub use ids::{ContentUri, DeviceId, EventId, RoomId, SenderKey, SessionId, UserId};
pub use permission::{PermissionLevel, Permissions};
pub use status::{
    BridgeState, BridgeStateErrorCode, BridgeStateErrorMap, BridgeStateEvent, BridgeStateFiller,
    GlobalBridgeState,
};
