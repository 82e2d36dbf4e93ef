//! Application service transport.
//!
//! The homeserver pushes events to [`AppService`] over HTTP; the bridge acts
//! through [`Intent`]s handed out by an [`IntentSource`].
//!
//! ```text
//! homeserver --PUT transactions--> AppService --events--> EventProcessor
//!     ^                                 |
//!     +------- IntentApi (client) ------+
//! ```

pub mod client;
pub mod server;

use std::{
    collections::{HashSet, VecDeque},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use axum::{http::StatusCode, response::Response};
use bridgehead_core::{Event, Intent, UserId};
use serde::Deserialize;
use serde_json::Value;
use tokio::{
    net::TcpListener,
    sync::{mpsc, watch},
};
use tracing::{debug, error, info, warn};

pub use self::client::{HomeserverClient, IntentApi};
use self::server::{REQUEST_TIMEOUT, empty, matrix_error};
use crate::{config::BaseConfig, error::ConfigError};

/// Transaction IDs remembered for duplicate detection.
pub const SEEN_TRANSACTIONS: usize = 256;

/// Hands out acting identities.
pub trait IntentSource: Send + Sync {
    /// The appservice bot.
    fn bot_intent(&self) -> Arc<dyn Intent>;

    /// Any user in the appservice namespace.
    fn intent(&self, user_id: &UserId) -> Arc<dyn Intent>;
}

#[derive(Deserialize)]
struct Transaction {
    #[serde(default)]
    events: Vec<Value>,
    #[serde(default)]
    ephemeral: Vec<Value>,
    #[serde(default, rename = "de.sorunome.msc2409.ephemeral")]
    unstable_ephemeral: Vec<Value>,
}

#[derive(Default)]
struct SeenTransactions {
    order: VecDeque<String>,
    ids: HashSet<String>,
}

impl SeenTransactions {
    fn contains(&self, txn_id: &str) -> bool {
        self.ids.contains(txn_id)
    }

    fn insert(&mut self, txn_id: &str) {
        if self.ids.insert(txn_id.to_string()) {
            self.order.push_back(txn_id.to_string());
        }
        while self.order.len() > SEEN_TRANSACTIONS {
            if let Some(old) = self.order.pop_front() {
                self.ids.remove(&old);
            }
        }
    }
}

/// The application service endpoint.
pub struct AppService {
    hostname: String,
    port: u16,
    hs_token: String,
    client: HomeserverClient,
    ready: AtomicBool,
    events: mpsc::UnboundedSender<Event>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Event>>>,
    shutdown: watch::Sender<bool>,
    seen: Mutex<SeenTransactions>,
    request_timeout: Duration,
}

impl std::fmt::Debug for AppService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppService")
            .field("hostname", &self.hostname)
            .field("port", &self.port)
            .field("ready", &self.is_ready())
            .finish_non_exhaustive()
    }
}

impl AppService {
    /// Build from the shared configuration.
    pub fn new(config: &BaseConfig, user_agent: &str, txn_seed: u64) -> Result<Self, ConfigError> {
        let client = HomeserverClient::new(
            &config.homeserver.address,
            &config.appservice.as_token,
            config.bot_user_id(),
            user_agent,
            txn_seed,
        )?;
        let (events, receiver) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            hostname: config.appservice.hostname.clone(),
            port: config.appservice.port,
            hs_token: config.appservice.hs_token.clone(),
            client,
            ready: AtomicBool::new(false),
            events,
            receiver: Mutex::new(Some(receiver)),
            shutdown,
            seen: Mutex::new(SeenTransactions::default()),
            request_timeout: REQUEST_TIMEOUT,
        })
    }

    /// Override the per-request deadline.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Shared homeserver client.
    pub fn client(&self) -> &HomeserverClient {
        &self.client
    }

    /// Receiving end of the event channel. `None` after the first call.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<Event>> {
        self.receiver.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    /// Mark the bridge as ready to serve.
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    /// True once the bridge finished starting.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    /// Serve homeserver pushes until [`AppService::stop`] is called.
    pub async fn start(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        if *shutdown.borrow_and_update() {
            return;
        }
        let listener = match TcpListener::bind((self.hostname.as_str(), self.port)).await {
            Ok(listener) => listener,
            Err(e) => {
                error!(
                    hostname = %self.hostname,
                    port = self.port,
                    error = %e,
                    "failed to bind appservice listener"
                );
                return;
            },
        };
        info!(hostname = %self.hostname, port = self.port, "appservice listening");

        let stopped = async move {
            while !*shutdown.borrow_and_update() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        };
        let app = server::router(Arc::clone(&self));
        if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(stopped).await {
            error!(error = %e, "appservice server failed");
        }
        info!("appservice stopped");
    }

    /// Stop accepting connections.
    pub fn stop(&self) {
        self.shutdown.send_replace(true);
    }

    /// Accept one pushed transaction.
    ///
    /// `token` comes from the bearer header or the `access_token` query.
    /// A transaction ID already seen is acknowledged without redelivery.
    pub fn handle_transaction(&self, token: Option<&str>, txn_id: &str, body: &[u8]) -> Response {
        match token {
            None => {
                let status = StatusCode::UNAUTHORIZED;
                return matrix_error(status, "M_MISSING_TOKEN", "missing access token");
            },
            Some(token) if token != self.hs_token => {
                return matrix_error(StatusCode::FORBIDDEN, "M_FORBIDDEN", "invalid access token");
            },
            Some(_) => {},
        }

        let mut seen = self.seen.lock().unwrap_or_else(PoisonError::into_inner);
        if seen.contains(txn_id) {
            debug!(txn_id, "ignoring duplicate transaction");
            return empty(StatusCode::OK);
        }
        let txn: Transaction = match serde_json::from_slice(body) {
            Ok(txn) => txn,
            Err(e) => {
                let message = format!("invalid transaction body: {e}");
                return matrix_error(StatusCode::BAD_REQUEST, "M_NOT_JSON", message);
            },
        };
        seen.insert(txn_id);
        drop(seen);

        let ephemeral = txn.ephemeral.into_iter().chain(txn.unstable_ephemeral);
        let mut delivered = 0usize;
        for raw in txn.events.into_iter().chain(ephemeral) {
            match serde_json::from_value::<Event>(raw) {
                Ok(event) => {
                    if self.events.send(event).is_err() {
                        warn!(txn_id, "event processor gone, dropping events");
                        break;
                    }
                    delivered += 1;
                },
                Err(e) => warn!(txn_id, error = %e, "skipping malformed event"),
            }
        }
        debug!(txn_id, delivered, "received transaction");
        empty(StatusCode::OK)
    }
}

impl IntentSource for AppService {
    fn bot_intent(&self) -> Arc<dyn Intent> {
        Arc::new(self.client.intent(self.client.bot_user_id().clone()))
    }

    fn intent(&self, user_id: &UserId) -> Arc<dyn Intent> {
        Arc::new(self.client.intent(user_id.clone()))
    }
}
