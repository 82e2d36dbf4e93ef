//! Chat-network identifiers.
//!
//! Thin string newtypes so that a room ID can never be passed where a user ID
//! is expected. Parsing is deliberately lenient: the homeserver is the
//! authority on validity, the bridge only needs to split and compare.

use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wrap a raw identifier string.
            pub fn new(raw: impl Into<String>) -> Self {
                Self(raw.into())
            }

            /// Raw identifier string.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// True if the identifier is the empty string.
            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(raw: &str) -> Self {
                Self(raw.to_string())
            }
        }

        impl From<String> for $name {
            fn from(raw: String) -> Self {
                Self(raw)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(
    /// A chat-network user ID, `@localpart:server.name`.
    UserId
);
string_id!(
    /// A room (conversation) ID, `!opaque:server.name`.
    RoomId
);
string_id!(
    /// An event ID, `$opaque`.
    EventId
);
string_id!(
    /// An end-to-end encryption device ID.
    DeviceId
);
string_id!(
    /// Curve25519 identity key of a device, unpadded base64.
    SenderKey
);
string_id!(
    /// Olm or Megolm session identifier.
    SessionId
);

impl UserId {
    /// Build `@localpart:server`.
    pub fn from_parts(localpart: &str, server_name: &str) -> Self {
        Self(format!("@{localpart}:{server_name}"))
    }

    /// Split into `(localpart, server_name)`. `None` if the sigil or the
    /// separator is missing.
    pub fn parse(&self) -> Option<(&str, &str)> {
        self.0.strip_prefix('@')?.split_once(':')
    }

    /// Localpart without the sigil. `None` if the ID is malformed.
    pub fn localpart(&self) -> Option<&str> {
        self.parse().map(|(localpart, _)| localpart)
    }

    /// Server name part. `None` if the ID is malformed.
    pub fn server_name(&self) -> Option<&str> {
        self.parse().map(|(_, server)| server)
    }
}

/// An `mxc://` content URI pointing at uploaded media.
///
/// The default value is the empty URI, which the homeserver interprets as
/// "remove".
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentUri(String);

impl ContentUri {
    /// Parse an `mxc://server/media_id` string. `None` if it is not a
    /// well-formed content URI.
    pub fn parse(raw: &str) -> Option<Self> {
        let rest = raw.strip_prefix("mxc://")?;
        let (server, media) = rest.split_once('/')?;
        if server.is_empty() || media.is_empty() || media.contains('/') {
            return None;
        }
        Some(Self(raw.to_string()))
    }

    /// True for the empty ("remove") URI.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Raw URI string (empty for the "remove" URI).
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_id_parts() {
        let user = UserId::from("@alice:example.com");
        assert_eq!(user.localpart(), Some("alice"));
        assert_eq!(user.server_name(), Some("example.com"));
        assert_eq!(UserId::from_parts("alice", "example.com"), user);
    }

    #[test]
    fn user_id_server_with_port() {
        let user = UserId::from("@bot:localhost:8448");
        assert_eq!(user.localpart(), Some("bot"));
        assert_eq!(user.server_name(), Some("localhost:8448"));
    }

    #[test]
    fn malformed_user_id() {
        assert_eq!(UserId::from("alice:example.com").parse(), None);
        assert_eq!(UserId::from("@alice").parse(), None);
    }

    #[test]
    fn content_uri_parsing() {
        assert!(ContentUri::parse("mxc://example.com/abc123").is_some());
        assert!(ContentUri::parse("https://example.com/abc123").is_none());
        assert!(ContentUri::parse("mxc://example.com/").is_none());
        assert!(ContentUri::parse("mxc:///abc").is_none());
        assert!(ContentUri::default().is_empty());
    }

    #[test]
    fn ids_serialize_transparently() {
        let room = RoomId::from("!room:example.com");
        let json = serde_json::to_string(&room).unwrap();
        assert_eq!(json, "\"!room:example.com\"");
    }
}
