//! Transport to the CTMS portal through the relay middleware.
//!
//! The portal cannot be reached directly (no CORS, cookie-bound sessions), so
//! every request goes to `{relay}/api/middleware` with the real target encoded
//! in relay headers and the `url` query parameter. The relay answers with a
//! JSON envelope wrapping the portal's status, body and new session cookie.

use async_trait::async_trait;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use http::{HeaderMap, HeaderValue, Method};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use serde::Deserialize;
use serde_json::Value;
use std::num::NonZeroU32;
use std::time::Duration;
use tracing::{debug, trace};
use url::Url;

use super::errors::TransportFailure;
use super::json::parse_json_with_context;
use super::middleware::TransactionMiddleware;
use super::session::FormFields;
use crate::utils::runtime_from_secs;

/// Cookie the portal keeps its session in.
pub const SESSION_COOKIE: &str = "ASP.NET_SessionId";
const ACCEPT: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,image/apng,*/*;q=0.8,application/signed-exchange;v=b3;q=0.9";
const RELAY_ENDPOINT: &str = "api/middleware";

#[derive(Debug, Clone, Default)]
pub enum RequestBody {
    #[default]
    None,
    Form(FormFields),
    Json(Value),
}

/// One logical request to a portal path.
#[derive(Debug, Clone)]
pub struct RelayRequest {
    /// Portal path, e.g. `/Lichhoc.aspx`. Empty for the home page.
    pub path: String,
    pub method: Method,
    /// Extra headers; they override the relay defaults.
    pub headers: Vec<(String, String)>,
    /// Extra query parameters appended after `url`.
    pub query: Vec<(String, String)>,
    pub body: RequestBody,
    pub session_token: Option<String>,
}

impl RelayRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            method,
            headers: Vec::new(),
            query: Vec::new(),
            body: RequestBody::None,
            session_token: None,
        }
    }

    pub fn form(&self) -> Option<&FormFields> {
        match &self.body {
            RequestBody::Form(fields) => Some(fields),
            _ => None,
        }
    }
}

/// What the relay reported for a successful portal response.
#[derive(Debug, Clone)]
pub struct RelayResponse {
    pub status: u16,
    pub body: String,
    /// New session token, when the portal set one.
    pub session: Option<String>,
    /// Portal-side latency measured by the relay.
    pub runtime: Duration,
}

/// Sends one request and returns the portal's reply. Implementations never retry.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: RelayRequest) -> Result<RelayResponse, TransportFailure>;
}

#[derive(Debug, Deserialize)]
struct Envelope {
    status: u16,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    data: Option<EnvelopeData>,
    #[serde(default)]
    runtime: f64,
}

#[derive(Debug, Deserialize)]
struct EnvelopeData {
    #[serde(default)]
    response: Option<String>,
    #[serde(default)]
    session: Option<String>,
}

impl Envelope {
    fn into_result(self) -> Result<RelayResponse, TransportFailure> {
        let runtime = runtime_from_secs(self.runtime);
        let (body, session) = match self.data {
            Some(data) => (data.response, data.session.filter(|s| !s.is_empty())),
            None => (None, None),
        };

        if !(200..300).contains(&self.status) {
            if let Some(description) = &self.description {
                debug!(status = self.status, description, "Relay reported upstream failure");
            }
            return Err(TransportFailure::Upstream {
                status: self.status,
                body,
                runtime,
            });
        }

        Ok(RelayResponse {
            status: self.status,
            body: body.unwrap_or_default(),
            session,
            runtime,
        })
    }
}

/// [`Transport`] that talks to a real relay over HTTP.
pub struct RelayTransport {
    client: ClientWithMiddleware,
    relay: Url,
    portal: Url,
    limiter: Option<DefaultDirectRateLimiter>,
}

impl RelayTransport {
    /// Build a transport for `relay` forwarding to `portal`.
    ///
    /// `rate_limit_per_minute` of `None` or zero disables rate limiting.
    pub fn new(
        relay: Url,
        portal: Url,
        timeout: Duration,
        rate_limit_per_minute: Option<u32>,
    ) -> Result<Self, anyhow::Error> {
        let client = ClientBuilder::new(
            reqwest::Client::builder()
                .timeout(timeout)
                .user_agent(concat!("ctms/", env!("CARGO_PKG_VERSION")))
                .build()?,
        )
        .with(TransactionMiddleware)
        .build();

        let limiter = rate_limit_per_minute
            .and_then(NonZeroU32::new)
            .map(|n| RateLimiter::direct(Quota::per_minute(n)));

        Ok(Self {
            client,
            relay,
            portal,
            limiter,
        })
    }

    /// Portal origin without a trailing slash, e.g. `http://ctms.fithou.net.vn`.
    fn origin(&self) -> String {
        self.portal.origin().ascii_serialization()
    }

    fn relay_headers(&self, request: &RelayRequest) -> HeaderMap {
        let origin = self.origin();
        let defaults = [
            ("Accept", ACCEPT.to_owned()),
            ("Session-Cookie-Key", SESSION_COOKIE.to_owned()),
            (
                "Session-Cookie-Value",
                request.session_token.clone().unwrap_or_default(),
            ),
            ("Set-Host", self.portal.host_str().unwrap_or_default().to_owned()),
            ("Set-Origin", origin.clone()),
            ("Set-Referer", format!("{origin}{}", request.path)),
            ("Upgrade-Insecure-Requests", "1".to_owned()),
        ];

        let mut headers = HeaderMap::new();
        let extra = request
            .headers
            .iter()
            .map(|(name, value)| (name.as_str(), value.clone()));
        for (name, value) in defaults.into_iter().chain(extra) {
            match (
                http::HeaderName::try_from(name),
                HeaderValue::try_from(value.as_str()),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => debug!(header = name, "Dropping header that is not valid HTTP"),
            }
        }
        headers
    }
}

#[async_trait]
impl Transport for RelayTransport {
    async fn send(&self, request: RelayRequest) -> Result<RelayResponse, TransportFailure> {
        if let Some(limiter) = &self.limiter {
            limiter.until_ready().await;
        }

        let endpoint = self
            .relay
            .join(RELAY_ENDPOINT)
            .map_err(|e| TransportFailure::Unreachable(e.into()))?;

        let mut query = vec![("url".to_owned(), format!("{}{}", self.origin(), request.path))];
        query.extend(request.query.iter().cloned());

        let mut builder = self
            .client
            .request(request.method.clone(), endpoint)
            .headers(self.relay_headers(&request))
            .query(&query);
        builder = match &request.body {
            RequestBody::None => builder,
            RequestBody::Form(fields) => builder.form(fields),
            RequestBody::Json(value) => builder.json(value),
        };

        let response = builder
            .send()
            .await
            .map_err(|e| TransportFailure::Unreachable(e.into()))?;
        let text = response
            .text()
            .await
            .map_err(|e| TransportFailure::Unreachable(e.into()))?;
        trace!(path = request.path, bytes = text.len(), "Relay envelope received");

        parse_json_with_context::<Envelope>(&text)
            .map_err(TransportFailure::Malformed)?
            .into_result()
    }
}
