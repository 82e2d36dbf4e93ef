//! Homeserver client API.
//!
//! Every intent shares one [`HomeserverClient`] and authenticates with the
//! appservice token. Intents other than the bot masquerade with the
//! `user_id` query parameter.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use async_trait::async_trait;
use bridgehead_core::{
    ContentUri, EventId, EventType, Intent, IntentError, RoomId, UserId, Versions, Whoami,
};
use reqwest::{Method, Url};
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::{Value, json};

use crate::error::ConfigError;

/// Client for the homeserver's client-server API.
#[derive(Debug, Clone)]
pub struct HomeserverClient {
    http: reqwest::Client,
    base: Url,
    as_token: String,
    bot_user_id: UserId,
    txn_prefix: u64,
    txn_counter: Arc<AtomicU64>,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    errcode: Option<String>,
    #[serde(default)]
    error: String,
}

#[derive(Deserialize)]
struct SendResponse {
    event_id: EventId,
}

impl HomeserverClient {
    /// Client for the homeserver at `address`.
    ///
    /// `txn_seed` makes transaction IDs unique across restarts.
    pub fn new(
        address: &str,
        as_token: &str,
        bot_user_id: UserId,
        user_agent: &str,
        txn_seed: u64,
    ) -> Result<Self, ConfigError> {
        let base = Url::parse(address)
            .map_err(|e| ConfigError::Invalid(format!("homeserver.address {address:?}: {e}")))?;
        if base.cannot_be_a_base() {
            let message = format!("homeserver.address {address:?} is not an HTTP URL");
            return Err(ConfigError::Invalid(message));
        }
        let http = reqwest::Client::builder()
            .user_agent(user_agent)
            .build()
            .map_err(|e| ConfigError::Invalid(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            base,
            as_token: as_token.to_string(),
            bot_user_id,
            txn_prefix: txn_seed,
            txn_counter: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Intent acting as `user_id`.
    pub fn intent(&self, user_id: UserId) -> IntentApi {
        IntentApi { client: self.clone(), user_id }
    }

    /// The appservice bot's user ID.
    pub fn bot_user_id(&self) -> &UserId {
        &self.bot_user_id
    }

    /// POST `body` as JSON to an absolute URL with the appservice token.
    pub async fn post_json(&self, url: &str, body: &Value) -> Result<(), IntentError> {
        let url = Url::parse(url)
            .map_err(|e| IntentError::Transport(format!("invalid URL {url:?}: {e}")))?;
        self.send::<Value>(Method::POST, url, Some(body)).await.map(drop)
    }

    fn url(&self, segments: &[&str], as_user: &UserId) -> Result<Url, IntentError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|()| IntentError::Transport(format!("{} cannot be a base URL", self.base)))?
            .pop_if_empty()
            .extend(segments);
        if *as_user != self.bot_user_id {
            url.query_pairs_mut().append_pair("user_id", as_user.as_str());
        }
        Ok(url)
    }

    fn next_txn_id(&self) -> String {
        let n = self.txn_counter.fetch_add(1, Ordering::Relaxed);
        format!("bh{:x}.{n}", self.txn_prefix)
    }

    async fn send<T: DeserializeOwned>(
        &self,
        method: Method,
        url: Url,
        body: Option<&Value>,
    ) -> Result<T, IntentError> {
        let mut request = self.http.request(method, url).bearer_auth(&self.as_token);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await.map_err(|e| IntentError::Transport(e.to_string()))?;

        let status = response.status();
        let bytes = response.bytes().await.map_err(|e| IntentError::Transport(e.to_string()))?;
        if !status.is_success() {
            let body: Option<ErrorBody> = serde_json::from_slice(&bytes).ok();
            let (errcode, message) = match body {
                Some(ErrorBody { errcode, error }) => (errcode, error),
                None => (None, String::from_utf8_lossy(&bytes).into_owned()),
            };
            return Err(IntentError::Http {
                status: status.as_u16(),
                errcode: errcode.unwrap_or_else(|| "M_UNKNOWN".to_string()),
                message,
            });
        }
        serde_json::from_slice(&bytes).map_err(|e| IntentError::InvalidResponse(e.to_string()))
    }
}

/// [`Intent`] backed by the homeserver client API.
#[derive(Debug, Clone)]
pub struct IntentApi {
    client: HomeserverClient,
    user_id: UserId,
}

#[async_trait]
impl Intent for IntentApi {
    fn user_id(&self) -> &UserId {
        &self.user_id
    }

    async fn versions(&self) -> Result<Versions, IntentError> {
        // Unauthenticated endpoint, never masqueraded.
        let url = self.client.url(&["_matrix", "client", "versions"], &self.client.bot_user_id)?;
        self.client.send(Method::GET, url, None).await
    }

    async fn whoami(&self) -> Result<Whoami, IntentError> {
        let url =
            self.client.url(&["_matrix", "client", "v3", "account", "whoami"], &self.user_id)?;
        self.client.send(Method::GET, url, None).await
    }

    async fn set_avatar_url(&self, uri: &ContentUri) -> Result<(), IntentError> {
        let segments = ["_matrix", "client", "v3", "profile", self.user_id.as_str(), "avatar_url"];
        let url = self.client.url(&segments, &self.user_id)?;
        let body = json!({ "avatar_url": uri.as_str() });
        self.client.send::<Value>(Method::PUT, url, Some(&body)).await.map(drop)
    }

    async fn set_display_name(&self, name: &str) -> Result<(), IntentError> {
        let segments = ["_matrix", "client", "v3", "profile", self.user_id.as_str(), "displayname"];
        let url = self.client.url(&segments, &self.user_id)?;
        let body = json!({ "displayname": name });
        self.client.send::<Value>(Method::PUT, url, Some(&body)).await.map(drop)
    }

    async fn join_room(&self, room_id: &RoomId) -> Result<(), IntentError> {
        let url =
            self.client.url(&["_matrix", "client", "v3", "join", room_id.as_str()], &self.user_id)?;
        self.client.send::<Value>(Method::POST, url, Some(&json!({}))).await.map(drop)
    }

    async fn send_message_event(
        &self,
        room_id: &RoomId,
        event_type: &EventType,
        content: &Value,
    ) -> Result<EventId, IntentError> {
        let txn_id = self.client.next_txn_id();
        let segments = [
            "_matrix",
            "client",
            "v3",
            "rooms",
            room_id.as_str(),
            "send",
            event_type.as_str(),
            &txn_id,
        ];
        let url = self.client.url(&segments, &self.user_id)?;
        let response: SendResponse = self.client.send(Method::PUT, url, Some(content)).await?;
        Ok(response.event_id)
    }
}
