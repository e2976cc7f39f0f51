//! Broker handshake: the HTTP exchange that precedes the WebSocket.
//!
//! The link POSTs its public key to the broker's `conn` endpoint and gets
//! back a salt, a temporary broker key, the negotiated payload format, and
//! the WebSocket path.  The WebSocket URL carries the dsId and an auth
//! token derived from the salt and the ECDH shared secret.

use std::time::Duration;

use dslink_protocol::{PROTOCOL_VERSION, SUPPORTED_FORMATS};
use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::config::LinkConfig;
use crate::error::HandshakeError;
use crate::keys::{auth_token, LinkKeys};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// The broker's reply to the handshake request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteEndpoint {
    #[serde(default)]
    pub ds_id: Option<String>,
    #[serde(default)]
    pub public_key: Option<String>,
    #[serde(default)]
    pub ws_uri: Option<String>,
    #[serde(default)]
    pub http_uri: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub temp_key: Option<String>,
    #[serde(default)]
    pub salt: Option<String>,
    /// Where this link is mounted in the broker's tree.
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub format: Option<String>,
}

/// A completed handshake: everything needed to open the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub endpoint: RemoteEndpoint,
    pub ws_url: String,
    /// Payload format for this connection, `json` or `msgpack`.
    pub format: String,
}

/// Performs the pre-connection exchange with the broker.  A failure counts
/// as one connection attempt.
#[async_trait::async_trait]
pub trait Handshaker: Send + Sync + 'static {
    async fn handshake(&self) -> Result<Session, HandshakeError>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HandshakeRequest<'a> {
    public_key: String,
    is_requester: bool,
    is_responder: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    link_data: Option<&'a serde_json::Value>,
    version: &'static str,
    formats: [&'static str; 2],
    enable_web_socket_compression: bool,
}

/// [`Handshaker`] speaking the broker's HTTP `conn` endpoint.
pub struct HttpHandshake {
    client: reqwest::Client,
    broker_url: String,
    ds_id: String,
    keys: LinkKeys,
    requester: bool,
    responder: bool,
    link_data: Option<serde_json::Value>,
    format_override: Option<String>,
}

impl HttpHandshake {
    pub fn new(config: &LinkConfig, keys: LinkKeys) -> Self {
        Self {
            client: reqwest::Client::new(),
            broker_url: config.broker_url.clone(),
            ds_id: keys.ds_id(&config.name),
            keys,
            requester: config.requester,
            responder: config.responder,
            link_data: config.link_data.clone(),
            format_override: config.format_override().map(str::to_owned),
        }
    }

    pub fn ds_id(&self) -> &str {
        &self.ds_id
    }

    fn request_body(&self) -> HandshakeRequest<'_> {
        HandshakeRequest {
            public_key: self.keys.public_key_b64(),
            is_requester: self.requester,
            is_responder: self.responder,
            link_data: self.link_data.as_ref(),
            version: PROTOCOL_VERSION,
            formats: SUPPORTED_FORMATS,
            enable_web_socket_compression: false,
        }
    }
}

#[async_trait::async_trait]
impl Handshaker for HttpHandshake {
    async fn handshake(&self) -> Result<Session, HandshakeError> {
        let mut url = Url::parse(&self.broker_url).map_err(|e| HandshakeError::Url(e.to_string()))?;
        url.query_pairs_mut().append_pair("dsId", &self.ds_id);
        tracing::debug!(url = %url, "handshake");

        let response = self
            .client
            .post(url)
            .timeout(HANDSHAKE_TIMEOUT)
            .json(&self.request_body())
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(HandshakeError::Rejected(format!("broker answered {status}")));
        }
        let endpoint: RemoteEndpoint = response.json().await?;

        let format = self
            .format_override
            .clone()
            .or_else(|| endpoint.format.clone())
            .unwrap_or_else(|| "json".to_owned());
        let shared = match endpoint.temp_key.as_deref() {
            Some(key) if !key.is_empty() => self.keys.shared_secret(key)?,
            _ => Vec::new(),
        };
        let auth = auth_token(endpoint.salt.as_deref().unwrap_or_default(), &shared);
        let ws_uri = endpoint
            .ws_uri
            .as_deref()
            .ok_or_else(|| HandshakeError::Rejected("broker sent no wsUri".into()))?;
        let ws_url = build_ws_url(&self.broker_url, ws_uri, &self.ds_id, &auth, &format)?;

        tracing::info!(
            ds_id = %self.ds_id,
            path = endpoint.path.as_deref().unwrap_or("?"),
            format = %format,
            "handshake accepted"
        );
        Ok(Session {
            endpoint,
            ws_url,
            format,
        })
    }
}

/// Compose the WebSocket URL from the broker URL's origin and the
/// handshake's `wsUri`.  An absolute `wsUri` is used as is.
pub fn build_ws_url(
    broker_url: &str,
    ws_uri: &str,
    ds_id: &str,
    auth: &str,
    format: &str,
) -> Result<String, HandshakeError> {
    let mut url = if ws_uri.starts_with("ws://") || ws_uri.starts_with("wss://") {
        Url::parse(ws_uri).map_err(|e| HandshakeError::Url(e.to_string()))?
    } else {
        let mut url = Url::parse(broker_url).map_err(|e| HandshakeError::Url(e.to_string()))?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|_| HandshakeError::Url(format!("cannot derive websocket url from {broker_url}")))?;
        url.set_path(ws_uri);
        url.set_query(None);
        url
    };
    url.query_pairs_mut()
        .append_pair("dsId", ds_id)
        .append_pair("auth", auth)
        .append_pair("format", format);
    Ok(url.to_string())
}
