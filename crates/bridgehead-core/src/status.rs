//! Bridge connectivity state snapshots.
//!
//! A [`BridgeState`] is what the bridge tells an external status monitor
//! about itself or about one user's remote connection. Snapshots are cheap
//! values: [`BridgeState::fill_at`] stamps time, source, identity, TTL and the
//! human-readable message; [`should_deduplicate`] decides whether a candidate
//! is worth sending given the previous one.
//!
//! # Re-announcement window
//!
//! ```text
//!   sent           ttl/5            ttl
//!    │───suppressed──│────resent────│ (monitor expires state)
//! ```
//!
//! An unchanged state is suppressed for one fifth of its TTL and re-sent
//! afterwards, so a steady state is refreshed well before the monitor
//! expires it. A change of event kind or error code is never suppressed.
//! The window is derived from the TTL; the two constants below must move
//! together.

use std::{
    collections::HashMap,
    fmt,
    sync::{LazyLock, PoisonError, RwLock},
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::UserId;

/// TTL in seconds for snapshots carrying an error code.
pub const ERROR_TTL_SECS: i64 = 60;

/// TTL in seconds for snapshots without an error code.
pub const OK_TTL_SECS: i64 = 240;

/// Fraction of the TTL during which an unchanged state is not re-sent.
pub const DEDUP_WINDOW_DIVISOR: i64 = 5;

/// Value of [`BridgeState::source`] for snapshots produced by the bridge.
pub const SOURCE_BRIDGE: &str = "bridge";

/// Connectivity event kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BridgeStateEvent {
    /// Bridge has not been set up.
    Unconfigured,
    /// Bridge process is up.
    Running,
    /// Connecting to the remote network.
    Connecting,
    /// Connected and catching up on history.
    Backfilling,
    /// Connected to the remote network.
    Connected,
    /// Temporarily disconnected, will retry.
    TransientDisconnect,
    /// Remote network rejected the credentials.
    BadCredentials,
    /// Something went wrong that the bridge can't classify.
    UnknownError,
    /// User logged out of the remote network.
    LoggedOut,
}

impl BridgeStateEvent {
    /// Wire representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unconfigured => "UNCONFIGURED",
            Self::Running => "RUNNING",
            Self::Connecting => "CONNECTING",
            Self::Backfilling => "BACKFILLING",
            Self::Connected => "CONNECTED",
            Self::TransientDisconnect => "TRANSIENT_DISCONNECT",
            Self::BadCredentials => "BAD_CREDENTIALS",
            Self::UnknownError => "UNKNOWN_ERROR",
            Self::LoggedOut => "LOGGED_OUT",
        }
    }
}

impl fmt::Display for BridgeStateEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Machine-readable error code, chosen by the backend (e.g. `wa-logged-out`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BridgeStateErrorCode(String);

impl BridgeStateErrorCode {
    /// Wrap a raw code.
    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into())
    }

    /// Raw code.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True when no error is set.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for BridgeStateErrorCode {
    fn from(code: &str) -> Self {
        Self(code.to_string())
    }
}

/// Error code to human-readable message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BridgeStateErrorMap(HashMap<BridgeStateErrorCode, String>);

impl BridgeStateErrorMap {
    /// Empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge `other` into this map. Entries in `other` replace same-code
    /// entries; all other entries are kept.
    pub fn update(&mut self, other: &Self) {
        for (code, message) in &other.0 {
            self.0.insert(code.clone(), message.clone());
        }
    }

    /// Message registered for `code`.
    pub fn get(&self, code: &BridgeStateErrorCode) -> Option<&str> {
        self.0.get(code).map(String::as_str)
    }

    /// Register a single message.
    pub fn insert(&mut self, code: impl Into<BridgeStateErrorCode>, message: impl Into<String>) {
        self.0.insert(code.into(), message.into());
    }

    /// Number of registered codes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<C: Into<BridgeStateErrorCode>, M: Into<String>> FromIterator<(C, M)> for BridgeStateErrorMap {
    fn from_iter<I: IntoIterator<Item = (C, M)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(c, m)| (c.into(), m.into())).collect())
    }
}

impl From<String> for BridgeStateErrorCode {
    fn from(code: String) -> Self {
        Self(code)
    }
}

/// Process-wide registry of human-readable error messages.
///
/// Backends merge their messages in during startup. Lives for the whole
/// process; there is no teardown.
static HUMAN_ERRORS: LazyLock<RwLock<BridgeStateErrorMap>> =
    LazyLock::new(|| RwLock::new(BridgeStateErrorMap::new()));

/// Merge messages into the process-wide registry.
pub fn register_human_errors(errors: &BridgeStateErrorMap) {
    HUMAN_ERRORS.write().unwrap_or_else(PoisonError::into_inner).update(errors);
}

/// Snapshot of the process-wide registry.
pub fn human_errors() -> BridgeStateErrorMap {
    HUMAN_ERRORS.read().unwrap_or_else(PoisonError::into_inner).clone()
}

/// Identity that a snapshot can be attributed to.
pub trait BridgeStateFiller {
    /// Chat-network user the state belongs to.
    fn user_id(&self) -> UserId;
    /// Remote-network identifier of the account.
    fn remote_id(&self) -> String;
    /// Remote-network display name of the account.
    fn remote_name(&self) -> String;
}

/// A connectivity snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeState {
    /// Event kind.
    pub state_event: BridgeStateEvent,
    /// Unix seconds when the snapshot was filled.
    pub timestamp: i64,
    /// Seconds the monitor should trust this snapshot.
    pub ttl: i64,

    /// Who produced the snapshot.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source: String,
    /// Machine-readable error code.
    #[serde(default, skip_serializing_if = "BridgeStateErrorCode::is_empty")]
    pub error: BridgeStateErrorCode,
    /// Human-readable message.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,

    /// Acting chat-network user.
    #[serde(default, skip_serializing_if = "UserId::is_empty")]
    pub user_id: UserId,
    /// Remote-network account ID.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub remote_id: String,
    /// Remote-network account display name.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub remote_name: String,

    /// Free-form reason.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    /// Free-form extra data.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub info: HashMap<String, Value>,
}

impl BridgeState {
    /// Unfilled snapshot of the given kind.
    pub fn new(state_event: BridgeStateEvent) -> Self {
        Self {
            state_event,
            timestamp: 0,
            ttl: 0,
            source: String::new(),
            error: BridgeStateErrorCode::default(),
            message: String::new(),
            user_id: UserId::default(),
            remote_id: String::new(),
            remote_name: String::new(),
            reason: String::new(),
            info: HashMap::new(),
        }
    }

    /// Unfilled error snapshot.
    pub fn with_error(
        state_event: BridgeStateEvent,
        error: impl Into<BridgeStateErrorCode>,
    ) -> Self {
        Self { error: error.into(), ..Self::new(state_event) }
    }

    /// Fill using the system clock and the process-wide message registry.
    #[allow(clippy::expect_used, clippy::disallowed_methods)]
    pub fn fill(self, filler: Option<&dyn BridgeStateFiller>) -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("invariant: system clock is after Unix epoch (1970-01-01)")
            .as_secs() as i64;
        self.fill_at(filler, now, &human_errors())
    }

    /// Stamp identity, time, source and TTL.
    ///
    /// TTL is [`ERROR_TTL_SECS`] when an error code is set, [`OK_TTL_SECS`]
    /// otherwise. A registered message for the error code replaces any
    /// caller-supplied message.
    pub fn fill_at(
        mut self,
        filler: Option<&dyn BridgeStateFiller>,
        now: i64,
        errors: &BridgeStateErrorMap,
    ) -> Self {
        if let Some(filler) = filler {
            self.user_id = filler.user_id();
            self.remote_id = filler.remote_id();
            self.remote_name = filler.remote_name();
        }

        self.timestamp = now;
        self.source = SOURCE_BRIDGE.to_string();
        if self.error.is_empty() {
            self.ttl = OK_TTL_SECS;
        } else {
            self.ttl = ERROR_TTL_SECS;
            if let Some(message) = errors.get(&self.error) {
                self.message = message.to_string();
            }
        }
        self
    }

    /// End of the suppression window that starts at this snapshot.
    pub fn dedup_deadline(&self) -> i64 {
        self.timestamp + self.ttl / DEDUP_WINDOW_DIVISOR
    }

    /// See [`should_deduplicate`].
    pub fn should_deduplicate(&self, candidate: &Self) -> bool {
        should_deduplicate(Some(self), candidate)
    }
}

/// True if `candidate` repeats `previous` and falls inside its suppression
/// window.
///
/// Never true without a previous snapshot, and never true when the event
/// kind or the error code changed. `candidate` must already be filled: its
/// timestamp is the "now" the window is measured against.
pub fn should_deduplicate(previous: Option<&BridgeState>, candidate: &BridgeState) -> bool {
    let Some(previous) = previous else {
        return false;
    };
    if previous.state_event != candidate.state_event || previous.error != candidate.error {
        return false;
    }
    candidate.timestamp < previous.dedup_deadline()
}

/// Bridge-wide state plus one state per remote login, as returned to the
/// monitor's status query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalBridgeState {
    /// State per remote account, keyed by remote ID.
    #[serde(rename = "remoteState")]
    pub remote_states: HashMap<String, BridgeState>,
    /// State of the bridge process itself.
    #[serde(rename = "bridgeState")]
    pub bridge_state: BridgeState,
}
