//! HTTP client shared by backend adapters.
//!
//! Wraps reqwest with the policies every backend call needs: a request
//! timeout, an explicit set of expected statuses, translation of everything
//! else into the error taxonomy, and bounded backoff that rotates through
//! the backend's endpoints (primary, then secondary replicas).

use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, RANGE};
use reqwest::{Client, Method, Response};
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;
use url::Url;

use stowage_common::{Error, HttpConfig, Result, RetryConfig};
use stowage_stream::{into_stream, transport_error, BoxStream, ByteRange, ResponseStream};

use crate::retry::RetryExecutor;

/// Builds the error raised for an unexpected status.
pub type ErrorMapper = fn(u16, String) -> Error;

/// Backend HTTP client.
#[derive(Debug, Clone)]
pub struct BackendClient {
    http: Client,
    endpoints: Vec<Url>,
    retry: RetryConfig,
    timeout: Duration,
}

impl BackendClient {
    /// Create a client for a backend reachable at `endpoints`.
    ///
    /// # Errors
    /// - No endpoints, or an endpoint that is not a valid URL
    pub fn new(endpoints: &[&str], http: &HttpConfig, retry: RetryConfig) -> Result<Self> {
        if endpoints.is_empty() {
            return Err(Error::InvalidInput(
                "A backend needs at least one endpoint".to_string(),
            ));
        }
        let endpoints = endpoints
            .iter()
            .map(|e| {
                Url::parse(e)
                    .map_err(|err| Error::InvalidInput(format!("Invalid endpoint {}: {}", e, err)))
            })
            .collect::<Result<Vec<_>>>()?;

        let client = Client::builder()
            .user_agent(http.user_agent.as_str())
            .connect_timeout(http.connect_timeout)
            .build()
            .map_err(|e| Error::InvalidInput(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http: client,
            endpoints,
            retry,
            timeout: http.timeout,
        })
    }

    pub fn get(&self, path: &str) -> BackendRequest<'_> {
        self.request(Method::GET, path)
    }

    pub fn put(&self, path: &str) -> BackendRequest<'_> {
        self.request(Method::PUT, path)
    }

    pub fn post(&self, path: &str) -> BackendRequest<'_> {
        self.request(Method::POST, path)
    }

    pub fn delete(&self, path: &str) -> BackendRequest<'_> {
        self.request(Method::DELETE, path)
    }

    /// Start a request for `path`, relative to whichever endpoint is tried.
    pub fn request(&self, method: Method, path: &str) -> BackendRequest<'_> {
        BackendRequest {
            client: self,
            method,
            path: path.to_string(),
            query: Vec::new(),
            headers: HeaderMap::new(),
            body: Body::Empty,
            expects: Vec::new(),
            throws: None,
        }
    }

    fn url(&self, attempt: u32, path: &str) -> String {
        let endpoint = &self.endpoints[attempt as usize % self.endpoints.len()];
        format!("{}{}", endpoint.as_str().trim_end_matches('/'), path)
    }
}

enum Body {
    Empty,
    Bytes(Bytes),
    Json(serde_json::Value),
    // Sent once; a request carrying a stream is never retried.
    Stream(Mutex<Option<BoxStream>>, usize),
}

/// A single backend call being assembled.
pub struct BackendRequest<'a> {
    client: &'a BackendClient,
    method: Method,
    path: String,
    query: Vec<(String, String)>,
    headers: HeaderMap,
    body: Body,
    expects: Vec<u16>,
    throws: Option<ErrorMapper>,
}

impl BackendRequest<'_> {
    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn range(self, range: &ByteRange) -> Self {
        match HeaderValue::from_str(&range.to_header()) {
            Ok(value) => self.header(RANGE, value),
            Err(_) => self,
        }
    }

    pub fn bytes(mut self, data: impl Into<Bytes>) -> Self {
        self.body = Body::Bytes(data.into());
        self
    }

    pub fn json(mut self, value: serde_json::Value) -> Self {
        self.body = Body::Json(value);
        self
    }

    /// Send `stream` as the body, pulled `chunk_size` bytes at a time.
    pub fn stream(mut self, stream: BoxStream, chunk_size: usize) -> Self {
        self.body = Body::Stream(Mutex::new(Some(stream)), chunk_size);
        self
    }

    /// Statuses that count as success. Any 2xx when left empty.
    pub fn expects(mut self, statuses: &[u16]) -> Self {
        self.expects = statuses.to_vec();
        self
    }

    /// Error constructor for unexpected statuses, e.g. [`Error::download`].
    pub fn throws(mut self, mapper: ErrorMapper) -> Self {
        self.throws = Some(mapper);
        self
    }

    fn expected(&self, status: u16) -> bool {
        if self.expects.is_empty() {
            (200..300).contains(&status)
        } else {
            self.expects.contains(&status)
        }
    }

    /// Send the request, retrying transient failures.
    pub async fn send(self) -> Result<Response> {
        let retry = match self.body {
            Body::Stream(..) => RetryConfig {
                max_retries: 0,
                ..self.client.retry.clone()
            },
            _ => self.client.retry.clone(),
        };

        let result = RetryExecutor::new(retry)
            .execute_attempts(|attempt| self.attempt(attempt), Error::is_transient)
            .await;

        match (result, self.throws) {
            // Out of retries: report in the caller's taxonomy.
            (Err(Error::Provider { status, message }), Some(throws)) => Err(throws(status, message)),
            (other, _) => other,
        }
    }

    /// Send and decode a JSON response body.
    pub async fn send_json<T: serde::de::DeserializeOwned>(self) -> Result<T> {
        let throws = self.throws.unwrap_or(Error::provider);
        let response = self.send().await?;
        let status = response.status().as_u16();
        response
            .json()
            .await
            .map_err(|e| throws(status, format!("Failed to parse response: {}", e)))
    }

    /// Send and relay the response body as a stream, e.g. for downloads.
    pub async fn send_stream(self) -> Result<BoxStream> {
        let response = self.send().await?;
        Ok(Box::new(ResponseStream::new(response)))
    }

    async fn attempt(&self, attempt: u32) -> Result<Response> {
        let url = self.client.url(attempt, &self.path);
        debug!("{} {} (attempt {})", self.method, url, attempt + 1);

        let mut builder = self
            .client
            .http
            .request(self.method.clone(), &url)
            .timeout(self.client.timeout)
            .headers(self.headers.clone());
        if !self.query.is_empty() {
            builder = builder.query(&self.query);
        }
        builder = match &self.body {
            Body::Empty => builder,
            Body::Bytes(data) => builder.body(data.clone()),
            Body::Json(value) => builder.json(value),
            Body::Stream(slot, chunk_size) => {
                let stream = slot
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .take()
                    .ok_or_else(|| {
                        Error::InvalidInput("Request body stream was already sent".to_string())
                    })?;
                let builder = match stream.size() {
                    Some(size) => builder.header(reqwest::header::CONTENT_LENGTH, size),
                    None => builder,
                };
                builder.body(reqwest::Body::wrap_stream(into_stream(stream, *chunk_size)))
            }
        };

        let response = builder.send().await.map_err(transport_error)?;
        let status = response.status().as_u16();
        if self.expected(status) {
            return Ok(response);
        }

        let message = response.text().await.unwrap_or_default();
        debug!("{} {} returned unexpected status {}", self.method, url, status);
        Err(match status {
            404 | 410 => Error::NotFound(format!("{}: {}", self.path, message)),
            429 | 500..=599 => Error::provider(status, message),
            _ => self.throws.unwrap_or(Error::provider)(status, message),
        })
    }
}
