//! etcd v3 over its JSON gateway.
//!
//! Keys and values travel base64 encoded. Watches are a single streaming
//! POST whose body is a sequence of newline-delimited JSON frames.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use futures_util::stream::{self, StreamExt};
use log::{debug, info, warn};
use reqwest::{Client, RequestBuilder, Response};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};

use super::{
    prefix_range_end, ConnectOptions, Connector, EventKind, KeyValue, RangePage, RemoteStore, WatchEvent,
    WatchStream,
};
use crate::error::{ConnectError, RemoteError};

/// Maximum length of a response body quoted in an error.
const MAX_ERROR_BODY_LENGTH: usize = 200;

fn sanitize_error_body(body: &str) -> String {
    if body.len() > MAX_ERROR_BODY_LENGTH {
        let mut end = MAX_ERROR_BODY_LENGTH;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}... (truncated)", &body[..end])
    } else {
        body.to_string()
    }
}

/// Dials [`EtcdGateway`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct EtcdConnector;

#[async_trait]
impl Connector for EtcdConnector {
    async fn connect(
        &self,
        options: &ConnectOptions,
    ) -> Result<Arc<dyn RemoteStore>, ConnectError> {
        Ok(Arc::new(EtcdGateway::connect(options).await?))
    }
}

/// A connection to one etcd member through the JSON gateway.
#[derive(Debug)]
pub struct EtcdGateway {
    client: Client,
    base_url: String,
    token: Option<String>,
    request_timeout: Duration,
    closed: AtomicBool,
}

#[derive(Serialize)]
struct RangeRequest {
    key: String,
    range_end: String,
    limit: i64,
}

#[derive(Deserialize)]
struct RangeResponse {
    #[serde(default)]
    kvs: Vec<RawKeyValue>,
    #[serde(default)]
    more: bool,
}

#[derive(Deserialize)]
struct RawKeyValue {
    #[serde(default)]
    key: String,
    #[serde(default)]
    value: String,
}

#[derive(Serialize)]
struct WatchRequest {
    create_request: WatchCreateRequest,
}

#[derive(Serialize)]
struct WatchCreateRequest {
    key: String,
    range_end: String,
}

#[derive(Deserialize)]
struct WatchFrame {
    result: Option<WatchResult>,
    error: Option<GatewayError>,
}

#[derive(Deserialize)]
struct WatchResult {
    #[serde(default)]
    events: Vec<RawEvent>,
    #[serde(default)]
    canceled: bool,
    #[serde(default)]
    cancel_reason: String,
}

#[derive(Deserialize)]
struct RawEvent {
    // The gateway omits the field for PUT, the enum's zero value.
    #[serde(rename = "type", default)]
    kind: RawEventKind,
    kv: Option<RawKeyValue>,
}

#[derive(Deserialize, Default, Clone, Copy)]
enum RawEventKind {
    #[default]
    #[serde(rename = "PUT")]
    Put,
    #[serde(rename = "DELETE")]
    Delete,
}

#[derive(Deserialize)]
struct GatewayError {
    #[serde(default)]
    message: String,
}

#[derive(Serialize)]
struct AuthRequest<'a> {
    name: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct AuthResponse {
    #[serde(default)]
    token: String,
}

impl EtcdGateway {
    /// Connects to the first reachable endpoint, authenticating when a
    /// username is configured.
    pub async fn connect(options: &ConnectOptions) -> Result<Self, ConnectError> {
        let client = Client::builder()
            .connect_timeout(options.dial_timeout)
            .tcp_keepalive(options.keep_alive)
            .build()
            .map_err(|e| ConnectError::Other(format!("Failed to build HTTP client: {}", e)))?;

        let mut last_error = None;
        for endpoint in &options.endpoints {
            let base_url = base_url(endpoint);
            if let Err(e) = check_reachable(&client, &base_url, options.dial_timeout).await {
                debug!("etcd endpoint {} unavailable: {}", endpoint, e);
                last_error = Some(e);
                continue;
            }

            let token = match &options.username {
                Some(username) => {
                    let password = options
                        .password
                        .as_ref()
                        .map(|p| p.expose_secret())
                        .unwrap_or_default();
                    Some(
                        authenticate(
                            &client,
                            &base_url,
                            username,
                            password,
                            options.request_timeout,
                        )
                        .await?,
                    )
                }
                None => None,
            };

            info!("Connected to etcd at {}", endpoint);
            return Ok(Self {
                client,
                base_url,
                token,
                request_timeout: options.request_timeout,
                closed: AtomicBool::new(false),
            });
        }

        Err(last_error.unwrap_or_else(|| ConnectError::Other("no endpoints configured".into())))
    }

    fn post(&self, path: &str) -> Result<RequestBuilder, RemoteError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RemoteError::Closed);
        }
        let request = self.client.post(format!("{}{}", self.base_url, path));
        Ok(match &self.token {
            Some(token) => request.header(reqwest::header::AUTHORIZATION, token),
            None => request,
        })
    }
}

#[async_trait]
impl RemoteStore for EtcdGateway {
    async fn range(&self, from: &str, end: &str, limit: usize) -> Result<RangePage, RemoteError> {
        let body = RangeRequest {
            key: STANDARD.encode(from),
            range_end: STANDARD.encode(end),
            limit: i64::try_from(limit).unwrap_or(i64::MAX),
        };
        let response = self
            .post("/v3/kv/range")?
            .timeout(self.request_timeout)
            .json(&body)
            .send()
            .await?;
        let response: RangeResponse = check_status(response).await?.json().await?;

        let mut kvs = Vec::with_capacity(response.kvs.len());
        for raw in response.kvs {
            kvs.push(decode_key_value(raw)?);
        }
        Ok(RangePage {
            kvs,
            more: response.more,
        })
    }

    async fn watch_prefix(&self, prefix: &str) -> Result<WatchStream, RemoteError> {
        let body = WatchRequest {
            create_request: WatchCreateRequest {
                key: STANDARD.encode(prefix),
                range_end: STANDARD.encode(prefix_range_end(prefix)),
            },
        };
        let response = self.post("/v3/watch")?.json(&body).send().await?;
        let response = check_status(response).await?;
        debug!("Watch created on {}", prefix);

        let frames = stream::unfold(
            (Box::pin(response.bytes_stream()), Vec::<u8>::new(), false),
            |(mut body, mut buf, done)| async move {
                if done {
                    return None;
                }
                loop {
                    if let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                        let line: Vec<u8> = buf.drain(..=pos).collect();
                        match decode_watch_frame(&line) {
                            Ok(Some(events)) => return Some((Ok(events), (body, buf, false))),
                            Ok(None) => continue,
                            Err(e) => return Some((Err(e), (body, buf, true))),
                        }
                    }
                    match body.next().await {
                        Some(Ok(chunk)) => buf.extend_from_slice(&chunk),
                        Some(Err(e)) => return Some((Err(e.into()), (body, buf, true))),
                        None => {
                            // A final frame without trailing newline.
                            if buf.iter().any(|b| !b.is_ascii_whitespace()) {
                                let line = std::mem::take(&mut buf);
                                match decode_watch_frame(&line) {
                                    Ok(Some(events)) => {
                                        return Some((Ok(events), (body, buf, true)))
                                    }
                                    Ok(None) => return None,
                                    Err(e) => return Some((Err(e), (body, buf, true))),
                                }
                            }
                            return None;
                        }
                    }
                }
            },
        );
        Ok(frames.boxed())
    }

    async fn close(&self) -> Result<(), RemoteError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

fn base_url(endpoint: &str) -> String {
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        endpoint.trim_end_matches('/').to_string()
    } else {
        format!("http://{}", endpoint)
    }
}

async fn check_reachable(
    client: &Client,
    base_url: &str,
    timeout: Duration,
) -> Result<(), ConnectError> {
    let response = client
        .post(format!("{}/v3/maintenance/status", base_url))
        .timeout(timeout)
        .json(&serde_json::json!({}))
        .send()
        .await
        .map_err(|e| dial_error(e, timeout))?;

    let status = response.status();
    // A member with auth enabled rejects the status check but is reachable.
    if status.is_success() || status.as_u16() == 401 {
        Ok(())
    } else {
        let body = response.text().await.unwrap_or_default();
        Err(ConnectError::Other(format!(
            "status check returned {}: {}",
            status,
            sanitize_error_body(&body)
        )))
    }
}

async fn authenticate(
    client: &Client,
    base_url: &str,
    username: &str,
    password: &str,
    timeout: Duration,
) -> Result<String, ConnectError> {
    let response = client
        .post(format!("{}/v3/auth/authenticate", base_url))
        .timeout(timeout)
        .json(&AuthRequest {
            name: username,
            password,
        })
        .send()
        .await
        .map_err(|e| dial_error(e, timeout))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        warn!("etcd authentication for '{}' failed with {}", username, status);
        return Err(ConnectError::Auth(sanitize_error_body(&body)));
    }

    let auth: AuthResponse = response
        .json()
        .await
        .map_err(|e| ConnectError::Auth(format!("Failed to parse auth response: {}", e)))?;
    if auth.token.is_empty() {
        return Err(ConnectError::Auth("empty token in auth response".into()));
    }
    Ok(auth.token)
}

fn dial_error(err: reqwest::Error, timeout: Duration) -> ConnectError {
    if err.is_timeout() || err.is_connect() {
        ConnectError::Timeout(timeout)
    } else {
        ConnectError::Other(err.to_string())
    }
}

async fn check_status(response: Response) -> Result<Response, RemoteError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<GatewayError>(&body)
        .map(|e| e.message)
        .ok()
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| sanitize_error_body(&body));
    Err(RemoteError::Status {
        status: status.as_u16(),
        message,
    })
}

fn decode_key_value(raw: RawKeyValue) -> Result<KeyValue, RemoteError> {
    let key = STANDARD
        .decode(raw.key.as_bytes())
        .map_err(|e| RemoteError::Malformed(format!("key is not base64: {}", e)))?;
    let value = STANDARD
        .decode(raw.value.as_bytes())
        .map_err(|e| RemoteError::Malformed(format!("value is not base64: {}", e)))?;
    Ok(KeyValue {
        key: String::from_utf8_lossy(&key).into_owned(),
        value,
    })
}

/// Decodes one watch frame. `None` for frames without events, such as
/// the creation acknowledgement.
fn decode_watch_frame(line: &[u8]) -> Result<Option<Vec<WatchEvent>>, RemoteError> {
    let text = String::from_utf8_lossy(line);
    let text = text.trim();
    if text.is_empty() {
        return Ok(None);
    }

    let frame: WatchFrame = serde_json::from_str(text)
        .map_err(|e| RemoteError::Malformed(format!("bad watch frame: {}", e)))?;
    if let Some(error) = frame.error {
        return Err(RemoteError::WatchCanceled(error.message));
    }
    let Some(result) = frame.result else {
        return Ok(None);
    };
    if result.canceled {
        return Err(RemoteError::WatchCanceled(result.cancel_reason));
    }
    if result.events.is_empty() {
        return Ok(None);
    }

    let mut events = Vec::with_capacity(result.events.len());
    for raw in result.events {
        let Some(kv) = raw.kv else { continue };
        let kv = decode_key_value(kv)?;
        events.push(WatchEvent {
            kind: match raw.kind {
                RawEventKind::Put => EventKind::Put,
                RawEventKind::Delete => EventKind::Delete,
            },
            key: kv.key,
            value: kv.value,
        });
    }
    Ok(Some(events))
}
