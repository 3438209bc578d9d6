// ===============================
// src/envelope.rs
// ===============================
//
// Venue-neutral request/response wrappers passed between the drivers and the
// venue adapter. Payloads are decoded lazily and at most once.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::OnceCell;
use serde_json::Value;

use crate::domain::{Order, TimePoint};
use crate::error::AdapterError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Method {
    #[default]
    Get,
    Post,
    Put,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RestRequest {
    /// Stamped by the REST driver at send time.
    pub id: u64,
    pub base_url: String,
    pub path: String,
    pub method: Method,
    pub query_params: Vec<(String, String)>,
    pub payload: Option<String>,
    pub headers: Vec<(String, String)>,
}

impl RestRequest {
    pub fn new(method: Method, base_url: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method,
            base_url: base_url.into(),
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn query(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.query_params.push((key.into(), value.to_string()));
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query_params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Percent-encoded query in insertion order; this exact string is what gets signed.
    pub fn query_string(&self) -> String {
        self.query_params
            .iter()
            .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&")
    }

    pub fn url(&self) -> String {
        let base = format!("{}{}", self.base_url.trim_end_matches('/'), self.path);
        if self.query_params.is_empty() {
            base
        } else {
            format!("{}?{}", base, self.query_string())
        }
    }
}

/// Builds a request for a given send time, so timestamps and signatures are fresh
/// on every attempt and every page.
#[derive(Clone)]
pub struct RequestBuilder(Arc<dyn Fn(TimePoint) -> RestRequest + Send + Sync>);

impl RequestBuilder {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(TimePoint) -> RestRequest + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub fn build(&self, now: TimePoint) -> RestRequest {
        (self.0)(now)
    }
}

impl fmt::Debug for RequestBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RequestBuilder")
    }
}

/// Follow-up page request plus the pacing delay before sending it.
#[derive(Debug, Clone)]
pub struct Continuation {
    pub builder: RequestBuilder,
    pub delay: Duration,
}

#[derive(Debug)]
pub struct RestResponse {
    pub request: RestRequest,
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
    decoded: OnceCell<Value>,
    pub next: Option<Continuation>,
}

impl RestResponse {
    pub fn new(request: RestRequest, status: u16, headers: Vec<(String, String)>, body: String) -> Self {
        Self {
            request,
            status,
            headers,
            body,
            decoded: OnceCell::new(),
            next: None,
        }
    }

    pub fn json_payload(&self) -> Result<&Value, AdapterError> {
        self.decoded
            .get_or_try_init(|| serde_json::from_str(&self.body))
            .map_err(AdapterError::from)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionRole {
    MarketData,
    Account,
    Trade,
}

impl ConnectionRole {
    pub const ALL: [ConnectionRole; 3] = [
        ConnectionRole::MarketData,
        ConnectionRole::Account,
        ConnectionRole::Trade,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionRole::MarketData => "market-data",
            ConnectionRole::Account => "account",
            ConnectionRole::Trade => "trade",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebsocketRequestKind {
    Subscribe,
    Login,
    Ping,
    CreateOrder,
    CancelOrder,
    Other,
}

#[derive(Debug, Clone)]
pub struct WebsocketRequest {
    pub id: String,
    /// Empty payloads are never sent.
    pub payload: String,
    pub kind: WebsocketRequestKind,
    /// The order a create/cancel request refers to.
    pub order: Option<Order>,
}

impl WebsocketRequest {
    pub fn new(id: impl Into<String>, kind: WebsocketRequestKind, payload: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            payload: payload.into(),
            kind,
            order: None,
        }
    }

    pub fn with_order(self, order: Order) -> Self {
        Self {
            order: Some(order),
            ..self
        }
    }
}

#[derive(Debug)]
pub struct WebsocketMessage {
    pub role: ConnectionRole,
    pub url: String,
    pub payload: String,
    decoded: OnceCell<Value>,
    /// Set when the message is a response to one of our requests.
    pub request_id: Option<String>,
    /// The outstanding request matched by `request_id`, if still known.
    pub request: Option<WebsocketRequest>,
}

impl WebsocketMessage {
    pub fn new(role: ConnectionRole, url: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            role,
            url: url.into(),
            payload: payload.into(),
            decoded: OnceCell::new(),
            request_id: None,
            request: None,
        }
    }

    pub fn json_payload(&self) -> Result<&Value, AdapterError> {
        self.decoded
            .get_or_try_init(|| serde_json::from_str(&self.payload))
            .map_err(AdapterError::from)
    }

    pub fn request_kind(&self) -> Option<WebsocketRequestKind> {
        self.request.as_ref().map(|r| r.kind)
    }
}
