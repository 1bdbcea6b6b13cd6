//! HTTP transport for webhook delivery with configurable timeouts.
//!
//! The dispatcher talks to destinations through the `HttpTransport` trait.
//! `ReqwestTransport` is the production implementation; `mock::MockTransport`
//! replays scripted responses in tests.

use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{info_span, Instrument};
use uuid::Uuid;

use crate::error::{DeliveryError, Result};

/// Largest response body kept for the delivery log.
pub const MAX_RESPONSE_BODY_SIZE: usize = 64 * 1024;

const TRUNCATION_SUFFIX: &str = "... (truncated)";

/// Configuration for the HTTP transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Total time allowed for one request.
    pub timeout: Duration,
    /// Time allowed to establish the connection.
    pub connect_timeout: Duration,
    /// User agent string for requests.
    pub user_agent: String,
    /// Maximum number of redirects to follow.
    pub max_redirects: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(2),
            user_agent: concat!("hookrelay/", env!("CARGO_PKG_VERSION")).to_string(),
            max_redirects: 5,
        }
    }
}

/// A single POST to a destination.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    /// Destination URL.
    pub url: String,
    /// Header name/value pairs in send order.
    pub headers: Vec<(String, String)>,
    /// JSON body.
    pub body: Bytes,
    /// Event identity, for tracing.
    pub event_id: Option<Uuid>,
    /// 1-based attempt number, for tracing.
    pub attempt_number: u32,
}

impl TransportRequest {
    /// Value of the first header named `name`, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// What the destination answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    /// HTTP status code.
    pub status_code: u16,
    /// Response body, truncated to `MAX_RESPONSE_BODY_SIZE`.
    pub body: String,
}

impl TransportResponse {
    /// Creates a response.
    pub fn new(status_code: u16, body: impl Into<String>) -> Self {
        Self { status_code, body: body.into() }
    }

    /// Whether the status is 2xx.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}

/// Sends webhook requests.
///
/// Transport failures (timeouts, DNS, refused connections) are returned as
/// errors. Any HTTP response, including 4xx and 5xx, is returned as `Ok`;
/// classifying it is the caller's job.
#[async_trait::async_trait]
pub trait HttpTransport: Send + Sync + std::fmt::Debug {
    /// Posts `request` and returns the destination's answer.
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse>;
}

/// reqwest-backed transport with connection pooling.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
    config: ClientConfig,
}

impl ReqwestTransport {
    /// Creates a transport with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` if the HTTP client cannot be
    /// built.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects as usize))
            .build()
            .map_err(|e| {
                DeliveryError::configuration(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self { client, config })
    }

    /// Creates a transport with default configuration.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` if the HTTP client cannot be
    /// built.
    pub fn with_defaults() -> Result<Self> {
        Self::new(ClientConfig::default())
    }

    /// Active configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }
}

#[async_trait::async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse> {
        let start_time = Instant::now();

        let span = info_span!(
            "webhook_delivery",
            event_id = ?request.event_id,
            url = %request.url,
            attempt = request.attempt_number
        );

        async move {
            tracing::debug!("starting webhook delivery");

            let mut http_request = self.client.post(&request.url).body(request.body.clone());
            for (key, value) in &request.headers {
                if !is_managed_header(key) {
                    http_request = http_request.header(key.as_str(), value.as_str());
                }
            }

            let response = match http_request.send().await {
                Ok(response) => response,
                Err(e) => {
                    let duration = start_time.elapsed();
                    tracing::warn!(duration_ms = duration.as_millis(), "request failed: {}", e);

                    if e.is_timeout() {
                        return Err(DeliveryError::timeout(self.config.timeout.as_secs()));
                    }
                    if e.is_connect() {
                        return Err(DeliveryError::network(format!("connection failed: {e}")));
                    }
                    return Err(DeliveryError::network(e.to_string()));
                },
            };

            let status_code = response.status().as_u16();
            let body = match response.bytes().await {
                Ok(bytes) => truncate_body(&bytes),
                Err(e) => {
                    tracing::warn!("failed to read response body: {}", e);
                    format!("[failed to read response body: {e}]")
                },
            };

            tracing::debug!(
                status = status_code,
                duration_ms = start_time.elapsed().as_millis(),
                "received response"
            );

            Ok(TransportResponse { status_code, body })
        }
        .instrument(span)
        .await
    }
}

/// Decodes a response body lossily and caps it at `MAX_RESPONSE_BODY_SIZE`
/// bytes including the truncation suffix.
pub fn truncate_body(bytes: &[u8]) -> String {
    if bytes.len() <= MAX_RESPONSE_BODY_SIZE {
        return String::from_utf8_lossy(bytes).into_owned();
    }

    let max_content = MAX_RESPONSE_BODY_SIZE - TRUNCATION_SUFFIX.len();
    let truncated = String::from_utf8_lossy(&bytes[..max_content]);
    format!("{truncated}{TRUNCATION_SUFFIX}")
}

/// Headers the HTTP stack sets itself. Injected values are dropped.
fn is_managed_header(header_name: &str) -> bool {
    let lowercase = header_name.to_lowercase();
    matches!(
        lowercase.as_str(),
        "content-length"
            | "host"
            | "user-agent"
            | "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// In-memory transport for tests.
pub mod mock {
    use std::{collections::VecDeque, sync::Arc};

    use tokio::sync::Mutex;

    use super::{HttpTransport, TransportRequest, TransportResponse};
    use crate::error::{DeliveryError, Result};

    /// Replays scripted responses in order and records every request.
    ///
    /// When the script runs out, `fallback` is returned.
    #[derive(Debug, Clone)]
    pub struct MockTransport {
        script: Arc<Mutex<VecDeque<Result<TransportResponse>>>>,
        requests: Arc<Mutex<Vec<TransportRequest>>>,
        fallback: Arc<Mutex<Result<TransportResponse>>>,
    }

    impl MockTransport {
        /// Creates a transport that answers 200 OK by default.
        pub fn new() -> Self {
            Self::always(200, "OK")
        }

        /// Creates a transport that always answers `status_code`.
        pub fn always(status_code: u16, body: &str) -> Self {
            Self {
                script: Arc::new(Mutex::new(VecDeque::new())),
                requests: Arc::new(Mutex::new(Vec::new())),
                fallback: Arc::new(Mutex::new(Ok(TransportResponse::new(status_code, body)))),
            }
        }

        /// Queues one response.
        pub async fn push_response(&self, status_code: u16, body: &str) {
            self.script.lock().await.push_back(Ok(TransportResponse::new(status_code, body)));
        }

        /// Queues one transport failure.
        pub async fn push_error(&self, error: DeliveryError) {
            self.script.lock().await.push_back(Err(error));
        }

        /// Replaces the answer used once the script is empty.
        pub async fn set_fallback(&self, response: Result<TransportResponse>) {
            *self.fallback.lock().await = response;
        }

        /// Requests received so far.
        pub async fn requests(&self) -> Vec<TransportRequest> {
            self.requests.lock().await.clone()
        }

        /// Number of requests received so far.
        pub async fn request_count(&self) -> usize {
            self.requests.lock().await.len()
        }
    }

    impl Default for MockTransport {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait::async_trait]
    impl HttpTransport for MockTransport {
        async fn send(&self, request: TransportRequest) -> Result<TransportResponse> {
            self.requests.lock().await.push(request);

            if let Some(next) = self.script.lock().await.pop_front() {
                return next;
            }
            self.fallback.lock().await.clone()
        }
    }
}
