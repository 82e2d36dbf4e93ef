//! Configuration files in a temporary directory.

use std::{
    io,
    path::{Path, PathBuf},
};

use bridgehead_server::{BridgeInfo, Flags};
use tempfile::TempDir;

/// Example configuration of the test backend.
///
/// The appservice listens on an ephemeral loopback port and the homeserver
/// address is unroutable; tests talk to the homeserver through mocks.
pub const EXAMPLE_CONFIG: &str = r#"
[homeserver]
address = "http://127.0.0.1:1"
domain = "example.com"

[appservice]
address = "http://127.0.0.1:29300"
hostname = "127.0.0.1"
port = 0
id = "testbridge"
as_token = "generate"
hs_token = "generate"

[appservice.bot]
username = "bridgebot"
displayname = "Test bridge bot"
avatar = ""

[appservice.database]
path = ":memory:"

[bridge]
username_template = "bridge_{localpart}"
command_prefix = "!bridge"

[bridge.permissions]
"*" = "relay"
"example.com" = "user"

[bridge.encryption]
allow = false
pickle_key = "test pickle key"

[logging]
directory = "./logs"
file_name_format = ""
print_level = "warn"
file_level = "debug"
"#;

/// Bridge identity used throughout the tests.
pub fn test_info() -> BridgeInfo {
    BridgeInfo::new(
        "bridgehead-test",
        "https://example.com/bridgehead",
        "A test bridge",
        "0.1.0",
        "Test",
    )
}

/// A config file, its registration path and a database path, all inside
/// one temporary directory that lives as long as this value.
#[derive(Debug)]
pub struct TestConfig {
    dir: TempDir,
    config: PathBuf,
    registration: PathBuf,
    database: PathBuf,
}

impl TestConfig {
    /// Write `text` as the config file.
    pub fn with_text(text: &str) -> io::Result<Self> {
        let dir = tempfile::tempdir()?;
        let config = dir.path().join("config.toml");
        std::fs::write(&config, text)?;
        Ok(Self {
            registration: dir.path().join("registration.yaml"),
            database: dir.path().join("bridge.redb"),
            config,
            dir,
        })
    }

    /// The example config with an in-memory database.
    pub fn in_memory() -> io::Result<Self> {
        Self::with_text(EXAMPLE_CONFIG)
    }

    /// The example config with a database file in the directory, and
    /// encryption allowed if `encryption` is set.
    pub fn on_disk(encryption: bool) -> io::Result<Self> {
        let this = Self::in_memory()?;
        let database = this.database.to_string_lossy().replace('\\', "/");
        let text = EXAMPLE_CONFIG
            .replace(r#"path = ":memory:""#, &format!("path = {database:?}"))
            .replace("allow = false", &format!("allow = {encryption}"));
        std::fs::write(&this.config, text)?;
        Ok(this)
    }

    /// The example config with encryption allowed, in memory.
    pub fn with_encryption() -> io::Result<Self> {
        Self::with_text(&EXAMPLE_CONFIG.replace("allow = false", "allow = true"))
    }

    /// Flags pointing at this directory's files.
    pub fn flags(&self) -> Flags {
        Flags {
            config: self.config.clone(),
            registration: self.registration.clone(),
            ..Flags::default()
        }
    }

    /// Command line pointing at this directory's files.
    pub fn args(&self, extra: &[&str]) -> Vec<String> {
        let mut args = vec![
            "bridgehead-test".to_string(),
            "-c".to_string(),
            self.config.display().to_string(),
            "-r".to_string(),
            self.registration.display().to_string(),
        ];
        args.extend(extra.iter().map(|arg| (*arg).to_string()));
        args
    }

    /// Current contents of the config file.
    pub fn read(&self) -> io::Result<String> {
        std::fs::read_to_string(&self.config)
    }

    /// Config file path.
    pub fn config_path(&self) -> &Path {
        &self.config
    }

    /// Registration file path.
    pub fn registration_path(&self) -> &Path {
        &self.registration
    }

    /// Database file path used by [`TestConfig::on_disk`].
    pub fn database_path(&self) -> &Path {
        &self.database
    }

    /// The temporary directory.
    pub fn dir(&self) -> &Path {
        self.dir.path()
    }
}

#[cfg(test)]
mod tests {
    use bridgehead_server::ConfigDocument;

    use super::*;

    #[test]
    fn example_config_parses() {
        let config = ConfigDocument::parse(EXAMPLE_CONFIG).unwrap().base().unwrap();
        assert_eq!(config.bot_user_id().as_str(), "@bridgebot:example.com");
        assert_eq!(config.appservice.port, 0);
        assert!(!config.bridge.encryption.allow);
    }

    #[test]
    fn on_disk_points_at_the_directory() {
        let test = TestConfig::on_disk(true).unwrap();
        let config = ConfigDocument::parse(&test.read().unwrap()).unwrap().base().unwrap();
        assert!(config.bridge.encryption.allow);
        assert!(config.appservice.database.path.ends_with("bridge.redb"));
    }
}
