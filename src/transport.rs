// ===============================
// src/transport.rs
// ===============================
//
// Capability-opaque transports. The drivers only see these traits; the
// reqwest / tungstenite implementations below are what the binary wires in.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, Interval};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};
use url::Url;

use crate::envelope::{Method, RestRequest};
use crate::error::TransportError;

#[derive(Debug, Clone)]
pub struct RawRestResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

#[async_trait]
pub trait RestTransport: Send + Sync {
    async fn execute(&self, request: &RestRequest, timeout: Duration) -> Result<RawRestResponse, TransportError>;
}

/// Outbound command for a live socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Close,
}

/// A connected socket as two channels. The inbound channel closing means the
/// socket is gone.
#[derive(Debug)]
pub struct WebsocketSession {
    pub sender: mpsc::Sender<Outbound>,
    pub receiver: mpsc::Receiver<String>,
}

#[async_trait]
pub trait WebsocketConnector: Send + Sync {
    async fn connect(&self, url: &str, protocol_heartbeat: Option<Duration>) -> Result<WebsocketSession, TransportError>;
}

// ---------------------------------------------------------------
// reqwest
// ---------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct ReqwestTransport {
    http: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl RestTransport for ReqwestTransport {
    async fn execute(&self, request: &RestRequest, timeout: Duration) -> Result<RawRestResponse, TransportError> {
        let method = match request.method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Delete => reqwest::Method::DELETE,
        };
        let mut rb = self.http.request(method, request.url()).timeout(timeout);
        for (k, v) in &request.headers {
            rb = rb.header(k.as_str(), v.as_str());
        }
        if let Some(body) = &request.payload {
            rb = rb.body(body.clone());
        }

        let rsp = rb.send().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout(timeout)
            } else {
                TransportError::Request(e.to_string())
            }
        })?;
        let status = rsp.status().as_u16();
        let headers = rsp
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
            .collect();
        let body = rsp
            .text()
            .await
            .map_err(|e| TransportError::Request(e.to_string()))?;
        Ok(RawRestResponse { status, headers, body })
    }
}

// ---------------------------------------------------------------
// tokio-tungstenite
// ---------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
pub struct TungsteniteConnector;

#[async_trait]
impl WebsocketConnector for TungsteniteConnector {
    async fn connect(&self, url: &str, protocol_heartbeat: Option<Duration>) -> Result<WebsocketSession, TransportError> {
        let parsed = Url::parse(url).map_err(|e| TransportError::Connect(format!("bad url {url}: {e}")))?;
        let (ws, _resp) = connect_async(parsed.as_str())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let (mut write, mut read) = ws.split();

        let (out_tx, mut out_rx) = mpsc::channel::<Outbound>(256);
        let (in_tx, in_rx) = mpsc::channel::<String>(4096);
        let url = url.to_string();

        // pump: frames <-> channels, plus protocol-level pings
        tokio::spawn(async move {
            let mut ping = protocol_heartbeat
                .filter(|p| !p.is_zero())
                .map(|p| interval_at(Instant::now() + p, p));
            loop {
                tokio::select! {
                    frame = read.next() => match frame {
                        Some(Ok(Message::Text(text))) => {
                            if in_tx.send(text).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Close(reason))) => {
                            debug!(%url, ?reason, "close frame received");
                            break;
                        }
                        Some(Ok(_)) => {} // ping/pong/binary
                        Some(Err(e)) => {
                            warn!(%url, ?e, "ws read error");
                            break;
                        }
                        None => break,
                    },
                    cmd = out_rx.recv() => match cmd {
                        Some(Outbound::Text(text)) => {
                            if let Err(e) = write.send(Message::Text(text)).await {
                                warn!(%url, ?e, "ws write error");
                                break;
                            }
                        }
                        Some(Outbound::Close) | None => {
                            let _ = write.send(Message::Close(None)).await;
                            break;
                        }
                    },
                    _ = tick(&mut ping) => {
                        if let Err(e) = write.send(Message::Ping(Vec::new())).await {
                            warn!(%url, ?e, "ws ping failed");
                            break;
                        }
                    }
                }
            }
            debug!(%url, "ws pump finished");
        });

        Ok(WebsocketSession {
            sender: out_tx,
            receiver: in_rx,
        })
    }
}

/// Ticks an optional interval; never resolves when disabled.
pub(crate) async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(i) => {
            i.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
