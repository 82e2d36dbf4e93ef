//! Bridgehead bridge runtime.
//!
//! Connects a chat network's application service interface to a network
//! backend implementing [`ChildOverride`]. The runtime owns everything that
//! is the same for every bridge: flags, configuration, the appservice
//! transport, storage, event routing, end-to-bridge encryption storage and
//! bridge-state reporting.
//!
//! # Components
//!
//! - [`Bridge`]: flag parsing, configuration loading, registration, init
//! - [`BridgeRuntime`]: start and stop ordering, readiness
//! - [`AppService`]: HTTP endpoint for homeserver pushes, [`IntentSource`]
//! - [`EventProcessor`] and [`MatrixHandler`]: event dispatch and routing
//! - [`Database`], [`StateStore`], [`CryptoStore`]: persistence over redb
//! - [`BridgeStateReporter`]: deduplicated bridge-state pushes
//! - [`SystemEnv`]: production environment (real time, OS randomness)
//!
//! # Example
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use bridgehead_server::{Bridge, BridgeInfo, ChildOverride, SystemEnv};
//! # async fn run(child: Arc<dyn ChildOverride>) -> std::process::ExitCode {
//! let mut info = BridgeInfo::new(
//!     "example-bridge",
//!     "https://example.com",
//!     "An example bridge",
//!     "0.1.0",
//!     "Example",
//! );
//! info.init_version("v0.1.0", "", "unknown");
//! Bridge::new(info, child, SystemEnv::new()).main().await
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod appservice;
mod bridge;
pub mod child;
pub mod config;
pub mod crypto_store;
mod error;
pub mod flags;
pub mod logging;
pub mod matrix;
pub mod processor;
pub mod state_store;
pub mod status_reporter;
pub mod storage;
mod system_env;
pub mod version;

pub use appservice::{AppService, HomeserverClient, IntentApi, IntentSource};
pub use bridge::{
    Bridge, BridgeRuntime, MAIN_COMPONENT, RETRY_INTERVAL, ensure_connection, report_fatal,
    shutdown_signal, update_bot_profile,
};
pub use child::{BridgeContext, ChildOverride, CommandProcessor};
pub use config::{BaseConfig, ConfigDocument};
pub use crypto_store::CryptoStore;
pub use error::{
    ConfigError, FatalError, HINT_FOREIGN_TABLES, HINT_NOT_OWNED, HINT_UNSUPPORTED_VERSION,
};
pub use flags::Flags;
pub use matrix::MatrixHandler;
pub use processor::{EventHandler, EventProcessor, ExecMode};
pub use state_store::StateStore;
pub use status_reporter::{BridgeStateReporter, HttpStateSink, StateSink};
pub use storage::{Database, Schema, StorageError};
pub use system_env::SystemEnv;
pub use version::BridgeInfo;
