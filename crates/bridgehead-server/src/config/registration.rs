//! Appservice registration file.

use std::path::Path;

use bridgehead_core::Environment;
use serde::{Deserialize, Serialize};

use crate::{ConfigError, config::BaseConfig};

/// Length of generated `as_token` and `hs_token`.
pub const TOKEN_LENGTH: usize = 64;

const TOKEN_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// The registration a homeserver needs to route traffic to the bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    /// Registration ID.
    pub id: String,
    /// Where the homeserver pushes transactions.
    pub url: String,
    /// Token the bridge uses towards the homeserver.
    pub as_token: String,
    /// Token the homeserver uses towards the bridge.
    pub hs_token: String,
    /// Bot localpart.
    pub sender_localpart: String,
    /// Whether the homeserver rate-limits the bridge.
    pub rate_limited: bool,
    /// Reserved user, alias and room namespaces.
    pub namespaces: Namespaces,
    /// Receive receipts and typing notifications.
    #[serde(
        rename = "de.sorunome.msc2409.push_ephemeral",
        default,
        skip_serializing_if = "std::ops::Not::not"
    )]
    pub push_ephemeral: bool,
}

/// Namespaces claimed by the registration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Namespaces {
    /// User ID patterns.
    #[serde(default)]
    pub users: Vec<Namespace>,
    /// Room alias patterns.
    #[serde(default)]
    pub aliases: Vec<Namespace>,
    /// Room ID patterns.
    #[serde(default)]
    pub rooms: Vec<Namespace>,
}

/// One namespace regex.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Namespace {
    /// Whether other appservices and users are locked out.
    pub exclusive: bool,
    /// Regex over full IDs.
    pub regex: String,
}

impl Registration {
    /// Build a registration with freshly generated tokens.
    pub fn generate<E: Environment>(config: &BaseConfig, env: &E) -> Result<Self, ConfigError> {
        let domain = regex::escape(&config.homeserver.domain);
        let bot = regex::escape(&config.appservice.bot.username);
        let ghosts = config.ghost_localpart_pattern()?;

        Ok(Self {
            id: config.appservice.id.clone(),
            url: config.appservice.address.clone(),
            as_token: random_token(env),
            hs_token: random_token(env),
            sender_localpart: config.appservice.bot.username.clone(),
            rate_limited: false,
            namespaces: Namespaces {
                users: vec![
                    Namespace { exclusive: true, regex: format!("^@{bot}:{domain}$") },
                    Namespace { exclusive: true, regex: format!("^@{ghosts}:{domain}$") },
                ],
                aliases: Vec::new(),
                rooms: Vec::new(),
            },
            push_ephemeral: config.appservice.ephemeral_events,
        })
    }

    /// Write as JSON, which homeservers accept as YAML.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let data =
            serde_json::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?;
        std::fs::write(path, data)
            .map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })
    }

    /// Read a file written by [`Registration::save`].
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
        serde_json::from_str(&data).map_err(|e| ConfigError::Parse(e.to_string()))
    }
}

/// Uniform alphanumeric token from `env`'s randomness.
fn random_token<E: Environment>(env: &E) -> String {
    // Largest multiple of the alphabet size that fits in a byte, so every
    // character is equally likely.
    let limit = (256 / TOKEN_ALPHABET.len() * TOKEN_ALPHABET.len()) as u8;

    let mut token = String::with_capacity(TOKEN_LENGTH);
    let mut buf = [0u8; TOKEN_LENGTH];
    while token.len() < TOKEN_LENGTH {
        env.random_bytes(&mut buf);
        for byte in buf.iter().filter(|b| **b < limit) {
            if token.len() == TOKEN_LENGTH {
                break;
            }
            token.push(char::from(TOKEN_ALPHABET[usize::from(*byte) % TOKEN_ALPHABET.len()]));
        }
    }
    token
}
