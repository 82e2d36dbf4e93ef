//! Property-based tests for configuration upgrades
//!
//! Whatever subset of keys a user overrides, the upgraded file and the
//! fallback merge agree, user values win, and example-only keys survive.

use bridgehead_server::config::upgrade::{do_upgrade, merge_fallback};
use proptest::prelude::*;
use tempfile::tempdir;
use toml::Table;

const EXAMPLE: &str = r#"# Example bridge configuration.
[appservice]
# Port the bridge listens on.
port = 29300
hostname = "0.0.0.0"

[bridge]
command_prefix = "!ex" # prefix for commands

[bridge.relay]
enabled = false
"#;

fn user_config(port: Option<u16>, prefix: Option<&str>, relay: Option<bool>) -> String {
    let mut out = String::new();
    if let Some(port) = port {
        out.push_str(&format!("[appservice]\nport = {port}\n"));
    }
    if let Some(prefix) = prefix {
        out.push_str(&format!("[bridge]\ncommand_prefix = \"{prefix}\"\n"));
    }
    if let Some(relay) = relay {
        out.push_str(&format!("[bridge.relay]\nenabled = {relay}\n"));
    }
    out
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Property: upgraded and fallback documents hold the same values
    #[test]
    fn prop_upgrade_matches_fallback(
        port in proptest::option::of(any::<u16>()),
        prefix in proptest::option::of("[a-z!]{1,8}"),
        relay in proptest::option::of(any::<bool>()),
    ) {
        let user = user_config(port, prefix.as_deref(), relay);
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, &user).unwrap();

        let outcome = do_upgrade(&path, true, EXAMPLE, &[]).unwrap();
        prop_assert!(outcome.upgraded);
        let upgraded: Table = outcome.data.parse().unwrap();
        prop_assert_eq!(&upgraded, &merge_fallback(EXAMPLE, &user).unwrap());

        let expected_port = port.map_or(29300, i64::from);
        prop_assert_eq!(upgraded["appservice"]["port"].as_integer(), Some(expected_port));
        prop_assert_eq!(upgraded["appservice"]["hostname"].as_str(), Some("0.0.0.0"));
        prop_assert_eq!(
            upgraded["bridge"]["command_prefix"].as_str(),
            Some(prefix.as_deref().unwrap_or("!ex"))
        );
        prop_assert_eq!(
            upgraded["bridge"]["relay"]["enabled"].as_bool(),
            Some(relay.unwrap_or(false))
        );
    }

    /// Property: the example's comments are always kept
    #[test]
    fn prop_example_comments_are_kept(
        port in proptest::option::of(any::<u16>()),
        prefix in proptest::option::of("[a-z!]{1,8}"),
    ) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, user_config(port, prefix.as_deref(), None)).unwrap();

        do_upgrade(&path, true, EXAMPLE, &[]).unwrap();
        let saved = std::fs::read_to_string(&path).unwrap();
        for comment in [
            "# Example bridge configuration.",
            "# Port the bridge listens on.",
            "# prefix for commands",
        ] {
            prop_assert!(saved.contains(comment), "{:?} missing from:\n{}", comment, saved);
        }
    }
}
