//! Bridge configuration.
//!
//! The configuration file is TOML. Sections every bridge shares are typed in
//! [`BaseConfig`]; backend-specific sections stay in the [`ConfigDocument`]
//! and are extracted by the backend itself.

pub mod registration;
pub mod upgrade;

use bridgehead_core::{ContentUri, Permissions, UserId};
use regex::Regex;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::ConfigError;

/// Placeholder in `bridge.username_template` replaced by the remote user's
/// identifier.
pub const LOCALPART_PLACEHOLDER: &str = "{localpart}";

/// Magic value for `appservice.bot.avatar` / `displayname` that clears the
/// profile field.
pub const REMOVE: &str = "remove";

/// Sections shared by every bridge.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BaseConfig {
    /// `[homeserver]`
    pub homeserver: HomeserverConfig,
    /// `[appservice]`
    pub appservice: AppServiceConfig,
    /// `[bridge]`
    pub bridge: BridgeConfig,
    /// `[logging]`
    pub logging: LoggingConfig,
}

/// `[homeserver]`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HomeserverConfig {
    /// Client-server API base URL.
    pub address: String,
    /// Server name used in user IDs.
    pub domain: String,
    /// Where bridge-state snapshots are pushed. Disabled when unset.
    pub status_endpoint: Option<String>,
}

/// `[appservice]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppServiceConfig {
    /// URL the homeserver uses to reach the bridge.
    pub address: String,
    /// Interface to listen on.
    pub hostname: String,
    /// Port to listen on.
    pub port: u16,
    /// Registration ID.
    pub id: String,
    /// Token the bridge uses towards the homeserver.
    pub as_token: String,
    /// Token the homeserver uses towards the bridge.
    pub hs_token: String,
    /// Ask the homeserver to push receipts and typing notifications.
    pub ephemeral_events: bool,
    /// `[appservice.bot]`
    pub bot: BotConfig,
    /// `[appservice.database]`
    pub database: DatabaseConfig,
}

impl Default for AppServiceConfig {
    fn default() -> Self {
        Self {
            address: "http://localhost:29300".to_string(),
            hostname: "0.0.0.0".to_string(),
            port: 29300,
            id: "bridgehead".to_string(),
            as_token: String::new(),
            hs_token: String::new(),
            ephemeral_events: false,
            bot: BotConfig::default(),
            database: DatabaseConfig::default(),
        }
    }
}

/// `[appservice.bot]`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    /// Bot localpart.
    pub username: String,
    /// Display name, empty to leave alone, `remove` to clear.
    pub displayname: String,
    /// `mxc://` avatar, empty to leave alone, `remove` to clear.
    pub avatar: String,
}

impl BotConfig {
    /// Configured avatar, if it is a well-formed content URI.
    pub fn parsed_avatar(&self) -> Option<ContentUri> {
        ContentUri::parse(&self.avatar)
    }
}

/// `[appservice.database]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Database file, or `:memory:`.
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { path: "bridgehead.redb".to_string() }
    }
}

/// `[bridge]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Ghost localpart template containing [`LOCALPART_PLACEHOLDER`].
    pub username_template: String,
    /// Prefix marking a message outside the management room as a command.
    pub command_prefix: String,
    /// Who may use the bridge.
    pub permissions: Permissions,
    /// `[bridge.encryption]`
    pub encryption: EncryptionConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            username_template: format!("bridge_{LOCALPART_PLACEHOLDER}"),
            command_prefix: "!bridge".to_string(),
            permissions: Permissions::default(),
            encryption: EncryptionConfig::default(),
        }
    }
}

/// `[bridge.encryption]`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncryptionConfig {
    /// Allow end-to-bridge encryption.
    pub allow: bool,
    /// Enable encryption in new portals by default.
    pub default: bool,
    /// Secret protecting persisted session material.
    pub pickle_key: String,
}

/// `[logging]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Directory log files are written to.
    pub directory: String,
    /// Log file name; `{date}` becomes the UTC date. Empty disables the file.
    pub file_name_format: String,
    /// Filter for terminal output, in `EnvFilter` syntax.
    pub print_level: String,
    /// Filter for the log file, in `EnvFilter` syntax.
    pub file_level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: "./logs".to_string(),
            file_name_format: String::new(),
            print_level: "info".to_string(),
            file_level: "debug".to_string(),
        }
    }
}

impl BaseConfig {
    /// The bridge bot's user ID.
    pub fn bot_user_id(&self) -> UserId {
        UserId::from_parts(&self.appservice.bot.username, &self.homeserver.domain)
    }

    /// Ghost user ID for a remote identifier.
    pub fn format_username(&self, remote_id: &str) -> UserId {
        let localpart = self.bridge.username_template.replacen(LOCALPART_PLACEHOLDER, remote_id, 1);
        UserId::from_parts(&localpart, &self.homeserver.domain)
    }

    /// Ghost localpart regex without anchors or server name, as used in the
    /// registration's user namespace.
    pub fn ghost_localpart_pattern(&self) -> Result<String, ConfigError> {
        let (prefix, suffix) =
            self.bridge.username_template.split_once(LOCALPART_PLACEHOLDER).ok_or_else(|| {
                ConfigError::Invalid(format!(
                    "bridge.username_template must contain {LOCALPART_PLACEHOLDER}"
                ))
            })?;
        Ok(format!("{}.+{}", regex::escape(prefix), regex::escape(suffix)))
    }

    /// Regex matching every ghost user ID on our server.
    pub fn ghost_regex(&self) -> Result<Regex, ConfigError> {
        let pattern = format!(
            "^@{}:{}$",
            self.ghost_localpart_pattern()?,
            regex::escape(&self.homeserver.domain)
        );
        Regex::new(&pattern).map_err(|e| ConfigError::Invalid(e.to_string()))
    }
}

/// A parsed configuration file.
///
/// Backends keep their own sections here and deserialize them on demand.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigDocument {
    table: toml::Table,
}

impl ConfigDocument {
    /// Parse TOML text.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let table = text.parse::<toml::Table>().map_err(|e| ConfigError::Parse(e.to_string()))?;
        Ok(Self { table })
    }

    /// Wrap an already parsed table.
    pub fn from_table(table: toml::Table) -> Self {
        Self { table }
    }

    /// Raw table.
    pub fn table(&self) -> &toml::Table {
        &self.table
    }

    /// The shared sections.
    pub fn base(&self) -> Result<BaseConfig, ConfigError> {
        toml::Value::Table(self.table.clone())
            .try_into::<BaseConfig>()
            .map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    /// A backend section, `None` if the key is absent.
    pub fn section<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, ConfigError> {
        self.table
            .get(key)
            .cloned()
            .map(|value| {
                value.try_into::<T>().map_err(|e| ConfigError::Invalid(format!("[{key}]: {e}")))
            })
            .transpose()
    }

    /// Render back to TOML text.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string(&self.table).map_err(|e| ConfigError::Serialize(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use bridgehead_core::PermissionLevel;

    use super::*;

    const SAMPLE: &str = r#"
[homeserver]
address = "https://matrix.example.com"
domain = "example.com"

[appservice]
port = 29317

[appservice.bot]
username = "examplebot"
avatar = "mxc://example.com/abc"

[bridge]
username_template = "example_{localpart}"

[bridge.permissions]
"*" = "relay"
"example.com" = "user"

[network]
api_url = "https://remote.example"
"#;

    #[test]
    fn parses_shared_sections_with_defaults() {
        let config = ConfigDocument::parse(SAMPLE).unwrap().base().unwrap();

        assert_eq!(config.appservice.port, 29317);
        assert_eq!(config.appservice.hostname, "0.0.0.0");
        assert_eq!(config.logging.print_level, "info");
        assert_eq!(config.bot_user_id(), UserId::from("@examplebot:example.com"));
        assert_eq!(config.bot_user_id().as_str(), "@examplebot:example.com");
        assert_eq!(
            config.bridge.permissions.get(&UserId::from("@a:example.com")),
            PermissionLevel::USER
        );
        let avatar = config.appservice.bot.parsed_avatar().unwrap();
        assert_eq!(avatar.as_str(), "mxc://example.com/abc");
    }

    #[test]
    fn backend_sections_are_extracted_on_demand() {
        #[derive(Deserialize)]
        struct Network {
            api_url: String,
        }

        let doc = ConfigDocument::parse(SAMPLE).unwrap();
        let network: Network = doc.section("network").unwrap().unwrap();
        assert_eq!(network.api_url, "https://remote.example");
        assert!(doc.section::<Network>("missing").unwrap().is_none());
    }

    #[test]
    fn ghost_ids() {
        let config = ConfigDocument::parse(SAMPLE).unwrap().base().unwrap();
        let ghost = config.format_username("1234");
        assert_eq!(ghost.as_str(), "@example_1234:example.com");

        let regex = config.ghost_regex().unwrap();
        assert!(regex.is_match(ghost.as_str()));
        assert!(!regex.is_match("@example_:example.com"));
        assert!(!regex.is_match("@examplebot:example.com"));
        assert!(!regex.is_match("@example_1234:example.org"));
    }

    #[test]
    fn template_without_placeholder_is_invalid() {
        let mut config = BaseConfig::default();
        config.bridge.username_template = "static".to_string();
        assert!(matches!(config.ghost_regex(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn wrong_type_is_invalid() {
        let doc = ConfigDocument::parse("[appservice]\nport = \"high\"\n").unwrap();
        assert!(matches!(doc.base(), Err(ConfigError::Invalid(_))));
    }
}
