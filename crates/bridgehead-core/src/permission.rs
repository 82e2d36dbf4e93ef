//! Bridge permission levels.

use std::{collections::HashMap, fmt};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::ids::UserId;

/// How much a chat-network user may do with the bridge. Higher is more.
///
/// In configuration a level is either one of the names `block`, `relay`,
/// `user`, `admin` or a raw integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PermissionLevel(pub u32);

impl PermissionLevel {
    /// Ignored entirely.
    pub const BLOCK: Self = Self(0);
    /// May use the bridge through a relay account.
    pub const RELAY: Self = Self(5);
    /// May log in and bridge their own account.
    pub const USER: Self = Self(10);
    /// May run administrative commands.
    pub const ADMIN: Self = Self(100);

    fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "block" => Some(Self::BLOCK),
            "relay" => Some(Self::RELAY),
            "user" => Some(Self::USER),
            "admin" => Some(Self::ADMIN),
            _ => None,
        }
    }
}

impl fmt::Display for PermissionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::BLOCK => f.write_str("block"),
            Self::RELAY => f.write_str("relay"),
            Self::USER => f.write_str("user"),
            Self::ADMIN => f.write_str("admin"),
            Self(other) => write!(f, "{other}"),
        }
    }
}

impl Serialize for PermissionLevel {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match *self {
            Self::BLOCK | Self::RELAY | Self::USER | Self::ADMIN => {
                serializer.serialize_str(&self.to_string())
            },
            Self(other) => serializer.serialize_u32(other),
        }
    }
}

impl<'de> Deserialize<'de> for PermissionLevel {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Name(String),
            Level(u32),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Level(level) => Ok(Self(level)),
            Raw::Name(name) => Self::from_name(&name)
                .ok_or_else(|| {
                    serde::de::Error::custom(format!("unknown permission level {name:?}"))
                }),
        }
    }
}

/// Permission table keyed by user ID, server name, or `*`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Permissions(HashMap<String, PermissionLevel>);

impl Permissions {
    /// Build from `(key, level)` pairs.
    pub fn new(entries: impl IntoIterator<Item = (String, PermissionLevel)>) -> Self {
        Self(entries.into_iter().collect())
    }

    /// Level for `user_id`: an exact user entry wins over a server-name entry,
    /// which wins over `*`. Unlisted users get [`PermissionLevel::BLOCK`].
    pub fn get(&self, user_id: &UserId) -> PermissionLevel {
        if let Some(level) = self.0.get(user_id.as_str()) {
            return *level;
        }
        if let Some(level) = user_id.server_name().and_then(|server| self.0.get(server)) {
            return *level;
        }
        self.0.get("*").copied().unwrap_or(PermissionLevel::BLOCK)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> Permissions {
        Permissions::new([
            ("*".to_string(), PermissionLevel::RELAY),
            ("example.com".to_string(), PermissionLevel::USER),
            ("@boss:example.com".to_string(), PermissionLevel::ADMIN),
        ])
    }

    #[test]
    fn most_specific_entry_wins() {
        let perms = table();
        assert_eq!(perms.get(&UserId::from("@boss:example.com")), PermissionLevel::ADMIN);
        assert_eq!(perms.get(&UserId::from("@alice:example.com")), PermissionLevel::USER);
        assert_eq!(perms.get(&UserId::from("@eve:elsewhere.org")), PermissionLevel::RELAY);
    }

    #[test]
    fn unlisted_is_blocked() {
        assert_eq!(Permissions::default().get(&UserId::from("@a:b")), PermissionLevel::BLOCK);
    }

    #[test]
    fn deserializes_names_and_numbers() {
        let perms: Permissions =
            serde_json::from_str(r#"{"*": "relay", "example.com": 50, "@a:b": "Admin"}"#).unwrap();
        assert_eq!(perms.get(&UserId::from("@x:example.com")), PermissionLevel(50));
        assert_eq!(perms.get(&UserId::from("@a:b")), PermissionLevel::ADMIN);
        assert!(serde_json::from_str::<Permissions>(r#"{"*": "god"}"#).is_err());
    }
}
