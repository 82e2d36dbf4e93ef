//! Response bodies of the homeserver endpoints the core relies on.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::ids::{DeviceId, UserId};

/// `GET /_matrix/client/versions`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Versions {
    /// Supported spec versions, e.g. `["r0.6.1", "v1.1"]`.
    #[serde(default)]
    pub versions: Vec<String>,
    /// Unstable feature flags.
    #[serde(default)]
    pub unstable_features: HashMap<String, bool>,
}

impl Versions {
    /// True if any advertised version is `v{major}.{minor}` or newer.
    ///
    /// Legacy `r0.x.y` versions count as major version 0.
    pub fn supports(&self, major: u32, minor: u32) -> bool {
        self.versions
            .iter()
            .filter_map(|v| parse_version(v))
            .any(|(maj, min)| (maj, min) >= (major, minor))
    }

    /// True if the unstable feature is advertised and enabled.
    pub fn has_unstable(&self, feature: &str) -> bool {
        self.unstable_features.get(feature).copied().unwrap_or(false)
    }
}

fn parse_version(raw: &str) -> Option<(u32, u32)> {
    if raw.starts_with('r') {
        return Some((0, 0));
    }
    let (major, minor) = raw.strip_prefix('v')?.split_once('.')?;
    Some((major.parse().ok()?, minor.parse().ok()?))
}

/// `GET /_matrix/client/v3/account/whoami`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Whoami {
    /// User the token authenticates as.
    pub user_id: UserId,
    /// Device the token belongs to, absent for appservice tokens.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<DeviceId>,
    /// Guest account flag.
    #[serde(default)]
    pub is_guest: bool,
}
