use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{CONTENT_TYPE, ETAG};
use thiserror::Error;

use crate::errors::{ClientError, ErrorKind};

/// Outgoing request handed to a [`Transport`].
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    /// Absolute URL including the query string.
    pub url: String,
    /// Headers of the request.
    pub headers: Vec<(String, String)>,
    /// JSON body of `POST` requests.
    pub body: Option<String>,
}

impl HttpRequest {
    /// A request without headers and body.
    pub fn new(url: String) -> Self {
        Self {
            url,
            headers: Vec::new(),
            body: None,
        }
    }

    /// Appends a header.
    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_owned(), value.to_owned()));
        self
    }

    /// Sets the body.
    pub fn body(mut self, body: String) -> Self {
        self.body = Some(body);
        self
    }
}

/// Response of a completed request, whatever its status.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    /// HTTP status code.
    pub status: u16,
    /// Value of the `ETag` response header.
    pub etag: Option<String>,
    /// Response body, empty when there was none.
    pub body: String,
}

/// A request that produced no HTTP response.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    /// No response arrived within the configured timeout.
    #[error("Request timed out.")]
    Timeout,
    /// Any other failure, like a refused connection.
    #[error("{0}")]
    Request(String),
}

/// HTTP client used by the fetcher and the metrics sender.
///
/// Calls are cancelled by dropping the returned future, implementations must abort the
/// underlying request when that happens. Timeouts belong to the implementation and are
/// reported as [`TransportError::Timeout`].
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends a `GET` request.
    async fn get(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;

    /// Sends a `POST` request with a JSON body.
    async fn post(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;
}

/// [`Transport`] backed by [`reqwest`].
pub struct HttpTransport {
    http_client: reqwest::Client,
}

impl HttpTransport {
    /// Creates a transport whose requests time out after `timeout`.
    ///
    /// # Errors
    ///
    /// Fails when the underlying client can't be initialized.
    pub fn new(timeout: Duration) -> Result<Self, ClientError> {
        let http_client = reqwest::Client::builder().timeout(timeout).build().map_err(|err| {
            ClientError::new(ErrorKind::HttpClientInitFailure, format!("Failed to initialize the HTTP client. {err}"))
        })?;
        Ok(Self { http_client })
    }

    async fn send(&self, mut builder: reqwest::RequestBuilder, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            builder = builder.header(CONTENT_TYPE, "application/json").body(body);
        }
        let response = builder.send().await.map_err(to_transport_error)?;
        let status = response.status().as_u16();
        let etag = response
            .headers()
            .get(ETAG)
            .and_then(|header| header.to_str().ok())
            .map(str::to_owned);
        // reading the body to the end releases the connection
        let body = response.text().await.map_err(to_transport_error)?;
        Ok(HttpResponse { status, etag, body })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let builder = self.http_client.get(request.url.as_str());
        self.send(builder, request).await
    }

    async fn post(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let builder = self.http_client.post(request.url.as_str());
        self.send(builder, request).await
    }
}

fn to_transport_error(error: reqwest::Error) -> TransportError {
    if error.is_timeout() {
        TransportError::Timeout
    } else {
        TransportError::Request(error.to_string())
    }
}
