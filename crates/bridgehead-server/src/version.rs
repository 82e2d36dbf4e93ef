//! Bridge identity and build version.

/// Version of the bridgehead runtime itself.
pub const RUNTIME_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Static description of a concrete bridge plus its resolved version strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeInfo {
    /// Short program name, e.g. `mautrix-example`.
    pub name: String,
    /// Project URL, used for release and commit links.
    pub url: String,
    /// One-line description for `--help`.
    pub description: String,
    /// Version the backend was compiled as.
    pub version: String,
    /// Human-readable name of the remote network.
    pub protocol_name: String,

    /// `<name> <version> (<build time>)`.
    pub version_desc: String,
    /// Markdown version with a link to the release or commit.
    pub linkified_version: String,
    /// Build timestamp as passed in by the build.
    pub build_time: String,
    /// HTTP user agent for homeserver requests.
    pub user_agent: String,
}

impl BridgeInfo {
    /// Describe a bridge. Call [`BridgeInfo::init_version`] before use.
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        description: impl Into<String>,
        version: impl Into<String>,
        protocol_name: impl Into<String>,
    ) -> Self {
        let mut info = Self {
            name: name.into(),
            url: url.into(),
            description: description.into(),
            version: version.into(),
            protocol_name: protocol_name.into(),
            version_desc: String::new(),
            linkified_version: String::new(),
            build_time: String::new(),
            user_agent: String::new(),
        };
        info.user_agent = user_agent(&info.name, &info.version);
        info.version_desc = format!("{} {}", info.name, info.version);
        info
    }

    /// Resolve the version strings from build metadata.
    ///
    /// A build whose git tag is not exactly the compiled version is a dev
    /// build: `+dev` and the short commit hash are appended.
    pub fn init_version(&mut self, tag: &str, commit: &str, build_time: &str) {
        let tag = tag.strip_prefix('v').unwrap_or(tag);
        let short_commit = commit.get(..8).filter(|_| commit.len() > 8);

        if tag != self.version {
            let suffix = if self.version.ends_with("+dev") { "" } else { "+dev" };
            let hash = short_commit.unwrap_or("unknown");
            self.version = format!("{}{suffix}.{hash}", self.version);
        }

        self.linkified_version = format!("v{}", self.version);
        if tag == self.version {
            self.linkified_version = format!("[v{}]({}/releases/v{tag})", self.version, self.url);
        } else if let Some(short) = short_commit {
            let link = format!("[{short}]({}/commit/{commit})", self.url);
            self.linkified_version = self.linkified_version.replacen(short, &link, 1);
        }

        self.user_agent = user_agent(&self.name, &self.version);
        self.version_desc = format!("{} {} ({build_time})", self.name, self.version);
        self.build_time = build_time.to_string();
    }
}

fn user_agent(name: &str, version: &str) -> String {
    format!("{name}/{version} bridgehead/{RUNTIME_VERSION}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> BridgeInfo {
        BridgeInfo::new(
            "example-bridge",
            "https://example.com/bridge",
            "An example",
            "0.4.0",
            "Example",
        )
    }

    #[test]
    fn release_build() {
        let mut info = info();
        info.init_version("v0.4.0", "0123456789abcdef", "2026-01-01T00:00:00Z");

        assert_eq!(info.version, "0.4.0");
        assert_eq!(info.linkified_version, "[v0.4.0](https://example.com/bridge/releases/v0.4.0)");
        assert_eq!(info.version_desc, "example-bridge 0.4.0 (2026-01-01T00:00:00Z)");
        assert_eq!(info.user_agent, format!("example-bridge/0.4.0 bridgehead/{RUNTIME_VERSION}"));
    }

    #[test]
    fn dev_build_links_commit() {
        let mut info = info();
        info.init_version("v0.3.0", "0123456789abcdef", "now");

        assert_eq!(info.version, "0.4.0+dev.01234567");
        assert_eq!(
            info.linkified_version,
            "v0.4.0+dev.[01234567](https://example.com/bridge/commit/0123456789abcdef)"
        );
    }

    #[test]
    fn dev_build_without_commit() {
        let mut info = info();
        info.init_version("", "abc", "now");
        assert_eq!(info.version, "0.4.0+dev.unknown");
        assert_eq!(info.linkified_version, "v0.4.0+dev.unknown");
    }

    #[test]
    fn existing_dev_suffix_not_repeated() {
        let mut info = BridgeInfo::new("b", "u", "d", "0.5.0+dev", "p");
        info.init_version("", "0123456789", "now");
        assert_eq!(info.version, "0.5.0+dev.01234567");
    }
}
