//! Pushes bridge-state snapshots to the monitoring endpoint.
//!
//! Each remote account (and the bridge itself, keyed by the empty remote ID)
//! keeps its last sent snapshot so repeats inside the re-announcement window
//! are dropped.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use bridgehead_core::{
    BridgeState, BridgeStateErrorMap, BridgeStateEvent, BridgeStateFiller, GlobalBridgeState,
    IntentError,
    status::{human_errors, should_deduplicate},
};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::appservice::HomeserverClient;

/// Destination for snapshots.
#[async_trait]
pub trait StateSink: Send + Sync {
    /// Deliver one snapshot.
    async fn push(&self, state: &BridgeState) -> Result<(), IntentError>;
}

/// Posts snapshots as JSON to `homeserver.status_endpoint`.
#[derive(Debug, Clone)]
pub struct HttpStateSink {
    client: HomeserverClient,
    endpoint: String,
}

impl HttpStateSink {
    /// Sink posting to `endpoint` with the appservice token.
    pub fn new(client: HomeserverClient, endpoint: impl Into<String>) -> Self {
        Self { client, endpoint: endpoint.into() }
    }
}

#[async_trait]
impl StateSink for HttpStateSink {
    async fn push(&self, state: &BridgeState) -> Result<(), IntentError> {
        let body = serde_json::to_value(state)
            .map_err(|e| IntentError::InvalidResponse(e.to_string()))?;
        self.client.post_json(&self.endpoint, &body).await
    }
}

/// Fills, deduplicates and sends snapshots.
pub struct BridgeStateReporter {
    sink: Option<Arc<dyn StateSink>>,
    errors: BridgeStateErrorMap,
    previous: Mutex<HashMap<String, BridgeState>>,
}

impl std::fmt::Debug for BridgeStateReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeStateReporter")
            .field("enabled", &self.sink.is_some())
            .field("errors", &self.errors.len())
            .finish_non_exhaustive()
    }
}

impl BridgeStateReporter {
    /// Reporter delivering to `sink`. Without a sink snapshots are only
    /// tracked.
    ///
    /// Messages are looked up in the process-wide registry when a snapshot
    /// is filled, with `errors` taking precedence.
    pub fn new(sink: Option<Arc<dyn StateSink>>, errors: BridgeStateErrorMap) -> Self {
        Self { sink, errors, previous: Mutex::new(HashMap::new()) }
    }

    /// Fill `state` at `now` and send it unless it repeats the last snapshot
    /// for the same remote account.
    ///
    /// Returns true if the snapshot was sent. A failed push is logged and the
    /// snapshot is not remembered, so the next attempt is not suppressed.
    pub async fn send(
        &self,
        state: BridgeState,
        filler: Option<&(dyn BridgeStateFiller + Sync)>,
        now: i64,
    ) -> bool {
        let mut errors = human_errors();
        errors.update(&self.errors);
        let state = state.fill_at(filler.map(|f| f as &dyn BridgeStateFiller), now, &errors);
        let state_event = state.state_event.as_str();
        let mut previous = self.previous.lock().await;
        if should_deduplicate(previous.get(&state.remote_id), &state) {
            debug!(state_event, remote_id = %state.remote_id, "deduplicated bridge state");
            return false;
        }

        if let Some(sink) = &self.sink {
            if let Err(e) = sink.push(&state).await {
                warn!(state_event, error = %e, "failed to send bridge state");
                return false;
            }
        }
        debug!(state_event, remote_id = %state.remote_id, "sent bridge state");
        previous.insert(state.remote_id.clone(), state);
        true
    }

    /// Last snapshot of the bridge and of every remote account.
    pub async fn global_state(&self) -> GlobalBridgeState {
        let previous = self.previous.lock().await;
        let bridge_state = previous
            .get("")
            .cloned()
            .unwrap_or_else(|| BridgeState::new(BridgeStateEvent::Unconfigured));
        let remote_states = previous
            .iter()
            .filter(|(remote_id, _)| !remote_id.is_empty())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        GlobalBridgeState { remote_states, bridge_state }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use bridgehead_core::{
        UserId,
        status::{OK_TTL_SECS, register_human_errors},
    };

    use super::*;

    #[derive(Default)]
    struct Recording {
        sent: StdMutex<Vec<BridgeState>>,
        fail: bool,
    }

    #[async_trait]
    impl StateSink for Recording {
        async fn push(&self, state: &BridgeState) -> Result<(), IntentError> {
            if self.fail {
                return Err(IntentError::Transport("down".to_string()));
            }
            self.sent.lock().unwrap().push(state.clone());
            Ok(())
        }
    }

    struct Login;

    impl BridgeStateFiller for Login {
        fn user_id(&self) -> UserId {
            UserId::from("@alice:example.com")
        }
        fn remote_id(&self) -> String {
            "remote-alice".to_string()
        }
        fn remote_name(&self) -> String {
            "Alice".to_string()
        }
    }

    fn reporter(sink: &Arc<Recording>) -> BridgeStateReporter {
        let mut errors = BridgeStateErrorMap::new();
        errors.insert("net-error", "network unreachable");
        BridgeStateReporter::new(Some(Arc::clone(sink) as Arc<dyn StateSink>), errors)
    }

    #[tokio::test]
    async fn repeats_are_suppressed_inside_window() {
        let sink = Arc::new(Recording::default());
        let reporter = reporter(&sink);
        let connected = || BridgeState::new(BridgeStateEvent::Connected);

        assert!(reporter.send(connected(), None, 1000).await);
        assert!(!reporter.send(connected(), None, 1000 + OK_TTL_SECS / 5 - 1).await);
        assert!(reporter.send(connected(), None, 1000 + OK_TTL_SECS / 5).await);
        let disconnected = BridgeState::new(BridgeStateEvent::TransientDisconnect);
        assert!(reporter.send(disconnected, None, 1049).await);
        assert_eq!(sink.sent.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn accounts_are_tracked_separately() {
        let sink = Arc::new(Recording::default());
        let reporter = reporter(&sink);

        assert!(reporter.send(BridgeState::new(BridgeStateEvent::Running), None, 10).await);
        assert!(reporter.send(BridgeState::new(BridgeStateEvent::Running), Some(&Login), 10).await);

        let global = reporter.global_state().await;
        assert_eq!(global.bridge_state.state_event, BridgeStateEvent::Running);
        assert_eq!(global.remote_states["remote-alice"].remote_name, "Alice");
        assert_eq!(
            global.remote_states["remote-alice"].user_id,
            UserId::from("@alice:example.com")
        );
    }

    #[tokio::test]
    async fn registered_messages_replace_caller_text() {
        let sink = Arc::new(Recording::default());
        let reporter = reporter(&sink);
        let mut state = BridgeState::with_error(BridgeStateEvent::TransientDisconnect, "net-error");
        state.message = "ignored".to_string();

        assert!(reporter.send(state, None, 5).await);
        let sent = sink.sent.lock().unwrap();
        assert_eq!(sent[0].message, "network unreachable");
        assert_eq!(sent[0].ttl, 60);
    }

    #[tokio::test]
    async fn messages_registered_after_construction_are_used() {
        let sink = Arc::new(Recording::default());
        let reporter = reporter(&sink);
        register_human_errors(
            &[("reporter-late-error", "registered after start")].into_iter().collect(),
        );

        let state =
            BridgeState::with_error(BridgeStateEvent::BadCredentials, "reporter-late-error");
        assert!(reporter.send(state, None, 5).await);
        assert_eq!(sink.sent.lock().unwrap()[0].message, "registered after start");
    }

    #[tokio::test]
    async fn own_messages_override_the_registry() {
        let sink = Arc::new(Recording::default());
        let reporter = reporter(&sink);
        register_human_errors(&[("net-error", "from the registry")].into_iter().collect());

        let state = BridgeState::with_error(BridgeStateEvent::TransientDisconnect, "net-error");
        assert!(reporter.send(state, None, 5).await);
        assert_eq!(sink.sent.lock().unwrap()[0].message, "network unreachable");
    }

    #[tokio::test]
    async fn failed_push_is_not_remembered() {
        let sink = Arc::new(Recording { fail: true, ..Recording::default() });
        let reporter = reporter(&sink);

        assert!(!reporter.send(BridgeState::new(BridgeStateEvent::Running), None, 10).await);
        let global = reporter.global_state().await;
        assert_eq!(global.bridge_state.state_event, BridgeStateEvent::Unconfigured);
    }

    #[tokio::test]
    async fn without_sink_states_are_tracked() {
        let reporter = BridgeStateReporter::new(None, BridgeStateErrorMap::new());
        assert!(reporter.send(BridgeState::new(BridgeStateEvent::Running), None, 10).await);
        assert!(!reporter.send(BridgeState::new(BridgeStateEvent::Running), None, 11).await);
    }
}
