//! Subscription HTTP Client
//!
//! Uses hyper with tokio for plain HTTP/1.1 requests.
//! Features:
//! - Bounded connect and read timeouts
//! - Automatic HTTPS with rustls (memory-safe TLS)
//! - Response body size cap
//! - Fixed `User-Agent` recognised by subscription hosts

use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Bytes;
use hyper::header::{HeaderMap, HeaderValue, CONTENT_TYPE, HOST, USER_AGENT};
use hyper::{Method, Request, StatusCode};
use rustls::ClientConfig;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};
use url::Url;

/// HTTP client errors
#[derive(Debug, Error)]
pub enum HttpError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connect timeout after {0:?}")]
    ConnectTimeout(Duration),

    #[error("Read timeout after {0:?}")]
    ReadTimeout(Duration),

    #[error("HTTP error: {0}")]
    HttpError(String),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Body read error: {0}")]
    BodyError(String),

    #[error("Response body exceeds {0} bytes")]
    BodyTooLarge(usize),
}

impl HttpError {
    /// Whether the failure was a timeout (connect or read)
    pub fn is_timeout(&self) -> bool {
        matches!(self, HttpError::ConnectTimeout(_) | HttpError::ReadTimeout(_))
    }
}

/// HTTP client configuration
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// TCP connect + TLS handshake timeout
    pub connect_timeout: Duration,
    /// Timeout for sending the request and reading the whole body
    pub read_timeout: Duration,
    /// User-Agent string
    pub user_agent: String,
    /// Maximum response body size
    pub max_body_size: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(15),
            // Subscription hosts key the document format off this value
            user_agent: "clash".to_string(),
            max_body_size: 10 * 1024 * 1024, // 10 MB
        }
    }
}

/// HTTP response wrapper
#[derive(Debug)]
pub struct Response {
    /// Status code
    pub status: StatusCode,
    /// Response headers
    pub headers: HeaderMap,
    /// Response body
    pub body: Vec<u8>,
    /// Time to first byte
    pub ttfb: Duration,
    /// Total download time
    pub total_time: Duration,
    /// Requested URL
    pub final_url: String,
}

impl Response {
    /// Check if response was successful (2xx)
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Get body as string
    pub fn text(&self) -> Result<String, std::string::FromUtf8Error> {
        String::from_utf8(self.body.clone())
    }

    /// Consume the response, returning the body as a string
    pub fn into_text(self) -> Result<String, std::string::FromUtf8Error> {
        String::from_utf8(self.body)
    }

    /// Get Content-Type header
    pub fn content_type(&self) -> Option<&str> {
        self.headers.get(CONTENT_TYPE)?.to_str().ok()
    }
}

/// Client statistics
#[derive(Debug, Default)]
struct ClientStats {
    requests_made: AtomicU64,
    bytes_downloaded: AtomicU64,
}

/// HTTP client used for subscription downloads
pub struct HttpClient {
    /// Configuration
    config: HttpClientConfig,
    /// Shared TLS configuration (built once)
    tls: Arc<ClientConfig>,
    /// Statistics
    stats: ClientStats,
}

impl HttpClient {
    /// Create a new HTTP client
    pub fn new(config: HttpClientConfig) -> Self {
        info!(
            "HTTP client initialized (connect: {:?}, read: {:?}, UA: {})",
            config.connect_timeout, config.read_timeout, config.user_agent
        );

        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls = ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        Self {
            config,
            tls: Arc::new(tls),
            stats: ClientStats::default(),
        }
    }

    /// Create with default configuration
    pub fn with_defaults() -> Self {
        Self::new(HttpClientConfig::default())
    }

    /// Get the active configuration
    pub fn config(&self) -> &HttpClientConfig {
        &self.config
    }

    /// Perform a GET request
    ///
    /// Non-2xx statuses are returned as `Ok`; callers decide what a
    /// failed status means for them.
    pub async fn get(&self, url: &str) -> Result<Response, HttpError> {
        let start = Instant::now();
        self.stats.requests_made.fetch_add(1, Ordering::Relaxed);

        // 1. Parse URL
        let parsed = Url::parse(url).map_err(|e| HttpError::InvalidUrl(e.to_string()))?;
        let is_https = match parsed.scheme() {
            "http" => false,
            "https" => true,
            other => return Err(HttpError::InvalidUrl(format!("unsupported scheme: {}", other))),
        };
        let host = parsed
            .host_str()
            .ok_or_else(|| HttpError::InvalidUrl("No host in URL".to_string()))?
            .to_string();
        let port = parsed
            .port_or_known_default()
            .ok_or_else(|| HttpError::InvalidUrl("No port in URL".to_string()))?;

        // 2. Build request (origin-form target, explicit Host)
        let mut target = parsed.path().to_string();
        if let Some(query) = parsed.query() {
            target.push('?');
            target.push_str(query);
        }
        let host_header = match parsed.port() {
            Some(p) => format!("{}:{}", host, p),
            None => host.clone(),
        };
        let user_agent = HeaderValue::from_str(&self.config.user_agent)
            .map_err(|e| HttpError::HttpError(e.to_string()))?;
        let request = Request::builder()
            .method(Method::GET)
            .uri(target)
            .header(HOST, host_header)
            .header(USER_AGENT, user_agent)
            .body(Full::new(Bytes::new()))
            .map_err(|e| HttpError::HttpError(e.to_string()))?;

        // 3. Connect (TCP + optional TLS) under the connect timeout
        let connect_timeout = self.config.connect_timeout;
        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect((host.as_str(), port)))
            .await
            .map_err(|_| HttpError::ConnectTimeout(connect_timeout))?
            .map_err(|e| HttpError::ConnectionFailed(e.to_string()))?;

        let ttfb_start = Instant::now();
        let read_timeout = self.config.read_timeout;
        let exchange = if is_https {
            let connector = TlsConnector::from(self.tls.clone());
            let server_name = rustls::pki_types::ServerName::try_from(host.clone())
                .map_err(|_| HttpError::TlsError("Invalid server name".to_string()))?;

            let tls_stream = tokio::time::timeout(connect_timeout, connector.connect(server_name, stream))
                .await
                .map_err(|_| HttpError::ConnectTimeout(connect_timeout))?
                .map_err(|e| HttpError::TlsError(e.to_string()))?;

            tokio::time::timeout(read_timeout, self.exchange(tls_stream, request)).await
        } else {
            tokio::time::timeout(read_timeout, self.exchange(stream, request)).await
        };

        let (status, headers, body, ttfb) = exchange.map_err(|_| HttpError::ReadTimeout(read_timeout))??;
        let ttfb = ttfb.unwrap_or_else(|| ttfb_start.elapsed());
        let total_time = start.elapsed();

        self.stats
            .bytes_downloaded
            .fetch_add(body.len() as u64, Ordering::Relaxed);

        debug!(
            "HTTP GET {} -> {} ({} bytes, {:?} TTFB)",
            url,
            status,
            body.len(),
            ttfb
        );

        Ok(Response {
            status,
            headers,
            body,
            ttfb,
            total_time,
            final_url: url.to_string(),
        })
    }

    /// Send one request over an established stream and collect the body
    async fn exchange<S>(
        &self,
        stream: S,
        request: Request<Full<Bytes>>,
    ) -> Result<(StatusCode, HeaderMap, Vec<u8>, Option<Duration>), HttpError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let sent_at = Instant::now();
        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| HttpError::HttpError(e.to_string()))?;

        tokio::spawn(async move {
            if let Err(e) = conn.await {
                warn!("Connection error: {}", e);
            }
        });

        let response = sender
            .send_request(request)
            .await
            .map_err(|e| HttpError::HttpError(e.to_string()))?;
        let ttfb = Some(sent_at.elapsed());

        let status = response.status();
        let headers = response.headers().clone();

        let limit = self.config.max_body_size;
        let collected = Limited::new(response.into_body(), limit)
            .collect()
            .await
            .map_err(|e| {
                if e.downcast_ref::<LengthLimitError>().is_some() {
                    HttpError::BodyTooLarge(limit)
                } else {
                    HttpError::BodyError(e.to_string())
                }
            })?;

        Ok((status, headers, collected.to_bytes().to_vec(), ttfb))
    }

    /// Get client statistics: (requests made, bytes downloaded)
    pub fn stats(&self) -> (u64, u64) {
        (
            self.stats.requests_made.load(Ordering::Relaxed),
            self.stats.bytes_downloaded.load(Ordering::Relaxed),
        )
    }
}
