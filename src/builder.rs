use std::sync::Arc;
use std::time::Duration;

use log::LevelFilter;
use reqwest::header::{HeaderName, HeaderValue, AUTHORIZATION};
use reqwest::Url;

use crate::backup::{NoopBackup, StateBackup};
use crate::cache::{InMemoryToggleCache, ToggleCache};
use crate::constants::*;
use crate::errors::{ClientError, ErrorKind};
use crate::fetch::transport::Transport;
use crate::model::context::Context;
use crate::Client;

pub(crate) struct Options {
    proxy_url: Url,
    client_key: String,
    app_name: String,
    instance_id: String,
    refresh_interval: Duration,
    metrics_interval: Duration,
    longest_acceptable_interval: Duration,
    polling: bool,
    metrics: bool,
    http_timeout: Duration,
    headers: Vec<(String, String)>,
    context: Context,
    cache: Box<dyn ToggleCache>,
    backup: Arc<dyn StateBackup>,
    transport: Option<Arc<dyn Transport>>,
    log_level: LevelFilter,
}

impl Options {
    pub(crate) fn proxy_url(&self) -> &Url {
        &self.proxy_url
    }

    pub(crate) fn app_name(&self) -> &str {
        &self.app_name
    }

    pub(crate) fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub(crate) fn refresh_interval(&self) -> Duration {
        self.refresh_interval
    }

    pub(crate) fn metrics_interval(&self) -> Duration {
        self.metrics_interval
    }

    pub(crate) fn longest_acceptable_interval(&self) -> Duration {
        self.longest_acceptable_interval
    }

    pub(crate) fn polling(&self) -> bool {
        self.polling
    }

    pub(crate) fn metrics(&self) -> bool {
        self.metrics
    }

    pub(crate) fn http_timeout(&self) -> Duration {
        self.http_timeout
    }

    pub(crate) fn context(&self) -> &Context {
        &self.context
    }

    pub(crate) fn backup(&self) -> &Arc<dyn StateBackup> {
        &self.backup
    }

    pub(crate) fn transport(&self) -> Option<&Arc<dyn Transport>> {
        self.transport.as_ref()
    }

    pub(crate) fn log_level(&self) -> LevelFilter {
        self.log_level
    }

    /// Moves the toggle store out, leaving the default in-memory store behind.
    pub(crate) fn take_cache(&mut self) -> Box<dyn ToggleCache> {
        std::mem::replace(&mut self.cache, Box::new(InMemoryToggleCache::new()))
    }

    /// Headers sent with every fetch and metrics request.
    pub(crate) fn request_headers(&self) -> Vec<(String, String)> {
        let mut headers = vec![
            (AUTHORIZATION.as_str().to_owned(), self.client_key.clone()),
            (APP_NAME_HEADER.to_owned(), self.app_name.clone()),
            (SDK_HEADER.to_owned(), format!("{SDK_NAME}:{PKG_VERSION}")),
            (CONNECTION_ID_HEADER.to_owned(), self.instance_id.clone()),
        ];
        headers.extend(self.headers.iter().cloned());
        headers
    }
}

/// Builder to create an Unleash sync [`Client`].
///
/// # Examples
///
/// ```no_run
/// use std::time::Duration;
/// use unleash_sync::{Client, Context};
///
/// # async fn run() {
/// let client = Client::builder("https://proxy.example.com/proxy", "client-key", "my-app")
///     .refresh_interval(Duration::from_secs(30))
///     .context(Context::new().user_id("123"))
///     .build()
///     .unwrap();
/// # }
/// ```
pub struct ClientBuilder {
    proxy_url: String,
    client_key: String,
    app_name: String,
    instance_id: Option<String>,
    refresh_interval: Option<Duration>,
    metrics_interval: Option<Duration>,
    longest_acceptable_interval: Option<Duration>,
    polling: bool,
    metrics: bool,
    http_timeout: Option<Duration>,
    headers: Vec<(String, String)>,
    context: Context,
    cache: Option<Box<dyn ToggleCache>>,
    backup: Option<Box<dyn StateBackup>>,
    transport: Option<Arc<dyn Transport>>,
    log_level: LevelFilter,
}

impl ClientBuilder {
    pub(crate) fn new(proxy_url: &str, client_key: &str, app_name: &str) -> Self {
        Self {
            proxy_url: proxy_url.to_owned(),
            client_key: client_key.to_owned(),
            app_name: app_name.to_owned(),
            instance_id: None,
            refresh_interval: None,
            metrics_interval: None,
            longest_acceptable_interval: None,
            polling: true,
            metrics: true,
            http_timeout: None,
            headers: Vec::new(),
            context: Context::default(),
            cache: None,
            backup: None,
            transport: None,
            log_level: LevelFilter::Warn,
        }
    }

    /// Sets the identifier of this client instance, sent as connection id and in metrics.
    /// Defaults to a random UUID.
    pub fn instance_id(mut self, instance_id: &str) -> Self {
        self.instance_id = Some(instance_id.to_owned());
        self
    }

    /// Sets the interval of polling for toggle changes, also the base interval of the fetch
    /// throttler. Default value is `60` seconds.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use std::time::Duration;
    /// use unleash_sync::Client;
    ///
    /// let builder = Client::builder("https://proxy.example.com/proxy", "client-key", "my-app")
    ///     .refresh_interval(Duration::from_secs(15));
    /// ```
    pub fn refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = Some(interval);
        self
    }

    /// Sets the interval of sending metrics, also the base interval of the metrics throttler.
    /// Default value is `60` seconds.
    pub fn metrics_interval(mut self, interval: Duration) -> Self {
        self.metrics_interval = Some(interval);
        self
    }

    /// Sets the ceiling the throttlers back off to on 429/5xx responses.
    /// Default value is `300` seconds.
    pub fn longest_acceptable_interval(mut self, interval: Duration) -> Self {
        self.longest_acceptable_interval = Some(interval);
        self
    }

    /// Indicates whether toggles are polled in the background. Default value is `true`.
    pub fn polling(mut self, enabled: bool) -> Self {
        self.polling = enabled;
        self
    }

    /// Indicates whether metrics are sent in the background. Default value is `true`.
    ///
    /// Evaluations are counted either way and can be sent with [`Client::send_metrics_now`].
    pub fn metrics(mut self, enabled: bool) -> Self {
        self.metrics = enabled;
        self
    }

    /// Sets the HTTP request timeout of the default transport.
    /// Default value is `30` seconds.
    pub fn http_timeout(mut self, timeout: Duration) -> Self {
        self.http_timeout = Some(timeout);
        self
    }

    /// Adds a header sent with every request.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use unleash_sync::Client;
    ///
    /// let builder = Client::builder("https://proxy.example.com/proxy", "client-key", "my-app")
    ///     .header("x-tenant", "acme");
    /// ```
    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_owned(), value.to_owned()));
        self
    }

    /// Sets the initial [`Context`]. Default value is an empty context.
    pub fn context(mut self, context: Context) -> Self {
        self.context = context;
        self
    }

    /// Sets a [`ToggleCache`] implementation that stores the current toggles.
    /// Defaults to an in-memory store.
    pub fn cache(mut self, cache: Box<dyn ToggleCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Sets a [`StateBackup`] implementation that keeps the last known toggles between runs.
    /// Default value is [`NoopBackup`].
    pub fn backup(mut self, backup: Box<dyn StateBackup>) -> Self {
        self.backup = Some(backup);
        self
    }

    /// Replaces the [`reqwest`] based HTTP transport.
    ///
    /// Request headers (client key, app name, custom headers) are handed to the transport
    /// with each request; the HTTP timeout is the transport's concern.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Sets the minimum level of the log records emitted by the client.
    /// Default value is [`LevelFilter::Warn`].
    pub fn log_level(mut self, level: LevelFilter) -> Self {
        self.log_level = level;
        self
    }

    /// Creates a [`Client`] from the configuration made on the builder.
    ///
    /// Must be called within a Tokio runtime, the client starts its background tasks here.
    ///
    /// # Errors
    ///
    /// This method fails if the client key or the app name is empty, the proxy URL is
    /// invalid, a custom header is invalid or the HTTP client can't be initialized.
    pub fn build(self) -> Result<Client, ClientError> {
        Client::with_options(self.build_options()?)
    }

    pub(crate) fn build_options(self) -> Result<Options, ClientError> {
        if self.client_key.is_empty() {
            return Err(ClientError::new(
                ErrorKind::MissingClientKey,
                "Client key cannot be empty".to_owned(),
            ));
        }
        if self.app_name.is_empty() {
            return Err(ClientError::new(
                ErrorKind::MissingAppName,
                "App name cannot be empty".to_owned(),
            ));
        }
        let proxy_url = Url::parse(&self.proxy_url).map_err(|err| {
            ClientError::new(
                ErrorKind::InvalidProxyUrl,
                format!("Proxy URL '{}' is invalid. {err}", self.proxy_url),
            )
        })?;
        if proxy_url.cannot_be_a_base() {
            return Err(ClientError::new(
                ErrorKind::InvalidProxyUrl,
                format!("Proxy URL '{}' is invalid.", self.proxy_url),
            ));
        }
        for (name, value) in &self.headers {
            validate_header(name, value)?;
        }
        Ok(Options {
            proxy_url,
            client_key: self.client_key,
            app_name: self.app_name,
            instance_id: self
                .instance_id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            refresh_interval: self
                .refresh_interval
                .unwrap_or(Duration::from_secs(DEFAULT_REFRESH_INTERVAL_SECS)),
            metrics_interval: self
                .metrics_interval
                .unwrap_or(Duration::from_secs(DEFAULT_METRICS_INTERVAL_SECS)),
            longest_acceptable_interval: self
                .longest_acceptable_interval
                .unwrap_or(Duration::from_secs(DEFAULT_LONGEST_ACCEPTABLE_INTERVAL_SECS)),
            polling: self.polling,
            metrics: self.metrics,
            http_timeout: self
                .http_timeout
                .unwrap_or(Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS)),
            headers: self.headers,
            context: self.context,
            cache: self.cache.unwrap_or_else(|| Box::new(InMemoryToggleCache::new())),
            backup: self
                .backup
                .map_or_else(|| Arc::new(NoopBackup::new()) as Arc<dyn StateBackup>, Arc::from),
            transport: self.transport,
            log_level: self.log_level,
        })
    }
}

fn validate_header(name: &str, value: &str) -> Result<(), ClientError> {
    HeaderName::from_bytes(name.as_bytes()).map_err(|err| {
        ClientError::new(ErrorKind::HttpClientInitFailure, format!("Invalid header name '{name}'. {err}"))
    })?;
    HeaderValue::from_str(value).map_err(|err| {
        ClientError::new(ErrorKind::HttpClientInitFailure, format!("Invalid value for header '{name}'. {err}"))
    })?;
    Ok(())
}

#[cfg(test)]
mod builder_tests {
    use std::time::Duration;

    use crate::builder::ClientBuilder;
    use crate::constants::test_constants::{MOCK_APP, MOCK_KEY};
    use crate::constants::PKG_VERSION;
    use crate::errors::ErrorKind;

    const URL: &str = "http://localhost/proxy";

    #[test]
    fn defaults() {
        let options = ClientBuilder::new(URL, MOCK_KEY, MOCK_APP).build_options().unwrap();
        assert_eq!(options.proxy_url().as_str(), URL);
        assert_eq!(options.refresh_interval(), Duration::from_secs(60));
        assert_eq!(options.metrics_interval(), Duration::from_secs(60));
        assert_eq!(options.longest_acceptable_interval(), Duration::from_secs(300));
        assert_eq!(options.http_timeout(), Duration::from_secs(30));
        assert!(options.polling());
        assert!(options.metrics());
        assert!(uuid::Uuid::parse_str(options.instance_id()).is_ok());
    }

    #[test]
    fn request_headers() {
        let options = ClientBuilder::new(URL, MOCK_KEY, MOCK_APP)
            .instance_id("instance-1")
            .header("x-custom", "value")
            .build_options()
            .unwrap();
        let headers = options.request_headers();
        let get = |name: &str| {
            headers
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, v)| v.clone())
        };
        assert_eq!(get("authorization").as_deref(), Some(MOCK_KEY));
        assert_eq!(get("unleash-appname").as_deref(), Some(MOCK_APP));
        assert_eq!(get("unleash-connection-id").as_deref(), Some("instance-1"));
        assert_eq!(get("unleash-sdk"), Some(format!("unleash-sync:{PKG_VERSION}")));
        assert_eq!(get("x-custom").as_deref(), Some("value"));
    }

    #[test]
    fn validation() {
        let err = ClientBuilder::new(URL, "", MOCK_APP).build_options().err().unwrap();
        assert_eq!(err.kind, ErrorKind::MissingClientKey);

        let err = ClientBuilder::new(URL, MOCK_KEY, "").build_options().err().unwrap();
        assert_eq!(err.kind, ErrorKind::MissingAppName);

        let err = ClientBuilder::new("not a url", MOCK_KEY, MOCK_APP).build_options().err().unwrap();
        assert_eq!(err.kind, ErrorKind::InvalidProxyUrl);

        let err = ClientBuilder::new("mailto:someone@example.com", MOCK_KEY, MOCK_APP)
            .build_options()
            .err()
            .unwrap();
        assert_eq!(err.kind, ErrorKind::InvalidProxyUrl);

        let err = ClientBuilder::new(URL, MOCK_KEY, MOCK_APP)
            .header("bad header", "v")
            .build_options()
            .err()
            .unwrap();
        assert_eq!(err.kind, ErrorKind::HttpClientInitFailure);
        assert!(err.message.starts_with("Invalid header name 'bad header'."));
    }
}
