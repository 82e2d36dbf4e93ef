//! Runtime error types.
//!
//! [`FatalError`] is the only error that ends the process. Everything below
//! the lifecycle returns a layer-specific error and the lifecycle decides
//! whether it is fatal; [`crate::Bridge::main`] turns a `FatalError` into the
//! matching exit status.

use std::path::PathBuf;

use bridgehead_core::{CryptoError, UserId};
use thiserror::Error;

use crate::storage::StorageError;

/// Hint printed when foreign tables block a schema upgrade.
pub const HINT_FOREIGN_TABLES: &str = "You can use --ignore-foreign-tables to ignore this error";

/// Hint printed when the database belongs to another program.
pub const HINT_NOT_OWNED: &str =
    "Sharing the same database with different programs is not supported";

/// Hint printed when the schema is newer than this build.
pub const HINT_UNSUPPORTED_VERSION: &str = "Downgrading the bridge is not supported";

/// Errors from loading, upgrading and saving configuration and registration
/// files.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// File could not be read or written.
    #[error("{}: {source}", path.display())]
    Io {
        /// File involved
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },

    /// Document is not valid TOML.
    #[error("parse error: {0}")]
    Parse(String),

    /// Document could not be rendered.
    #[error("serialize error: {0}")]
    Serialize(String),

    /// Document parsed but a value is unusable.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// A condition that stops the bridge.
///
/// Each variant has exactly one exit status, see [`FatalError::exit_code`].
#[derive(Error, Debug)]
pub enum FatalError {
    /// Command line could not be parsed.
    #[error("{0}")]
    Flags(String),

    /// `--no-update` and `--generate-registration` were both given.
    ///
    /// Generated tokens must be written back into the config, so discarding
    /// them silently is not an option.
    #[error("--no-update is not compatible with --generate-registration")]
    IncompatibleFlags,

    /// Configuration could not be loaded.
    #[error("failed to load config: {0}")]
    Config(#[source] ConfigError),

    /// Log file could not be opened.
    #[error("failed to open log file: {0}")]
    LogFile(String),

    /// Database could not be opened.
    #[error("failed to initialize database connection: {0}")]
    Database(#[source] StorageError),

    /// Schema upgrade of a database component failed.
    #[error("failed to initialize {component}: {source}")]
    DatabaseUpgrade {
        /// Component that failed (`main database`, `matrix state store`, ...)
        component: String,
        /// Cause
        source: StorageError,
    },

    /// Homeserver rejected the appservice token.
    #[error(
        "the as_token was not accepted. Is the registration file installed in your homeserver \
         correctly?"
    )]
    TokenRejected,

    /// Homeserver accepted the token but not the bot's user ID.
    #[error(
        "the as_token was accepted, but the /register request was not. Are the homeserver domain \
         and username template in the config correct, and do they match the values in the \
         registration?"
    )]
    NamespaceRejected,

    /// Homeserver says the token belongs to someone else.
    #[error("unexpected user ID in whoami call: got {actual}, expected {expected}")]
    WrongIdentity {
        /// Bot user ID from the config
        expected: UserId,
        /// User ID the homeserver reported
        actual: UserId,
    },

    /// Encryption engine failed to initialize.
    #[error("error initializing end-to-bridge encryption: {0}")]
    CryptoInit(#[source] CryptoError),

    /// Registration file could not be written.
    #[error("failed to save registration: {0}")]
    RegistrationSave(#[source] ConfigError),

    /// Tokens could not be written back into the config.
    #[error("failed to save config: {0}")]
    ConfigSave(#[source] ConfigError),
}

impl FatalError {
    /// Process exit status for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Flags(_) => 1,
            Self::IncompatibleFlags => 5,
            Self::Config(_) => 10,
            Self::LogFile(_) => 12,
            Self::Database(_) => 14,
            Self::DatabaseUpgrade { .. } => 15,
            Self::TokenRejected | Self::NamespaceRejected => 16,
            Self::WrongIdentity { .. } => 17,
            Self::CryptoInit(_) => 19,
            Self::RegistrationSave(_) => 21,
            Self::ConfigSave(_) => 22,
        }
    }

    /// Remediation hint for schema upgrade failures with a known cause.
    pub fn hint(&self) -> Option<&'static str> {
        let Self::DatabaseUpgrade { source, .. } = self else {
            return None;
        };
        match source {
            StorageError::ForeignTables(_) => Some(HINT_FOREIGN_TABLES),
            StorageError::NotOwned { .. } => Some(HINT_NOT_OWNED),
            StorageError::UnsupportedVersion { .. } => Some(HINT_UNSUPPORTED_VERSION),
            _ => None,
        }
    }
}
