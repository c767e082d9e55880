use std::collections::HashMap;
use std::sync::{Arc, Once};
use std::time::Duration;

use log::Level;
use tokio::sync::watch;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::builder::{ClientBuilder, Options};
use crate::cache::{ObservableCache, StateUpdates};
use crate::errors::{ClientError, ErrorKind};
use crate::fetch::fetcher::{FetchResult, Fetcher};
use crate::fetch::transport::{HttpTransport, Transport};
use crate::logger::Logger;
use crate::metrics::sender::{MetricsSender, SendStatus};
use crate::model::context::Context;
use crate::model::toggle::{Toggle, Variant};
use crate::throttle::Throttler;
use crate::utils::SystemClock;

/// The main component for keeping feature toggles in sync with the Unleash proxy.
///
/// # Examples
///
/// ```no_run
/// use unleash_sync::{Client, Context};
///
/// #[tokio::main]
/// async fn main() {
///     let client = Client::builder("https://proxy.example.com/proxy", "client-key", "my-app")
///         .context(Context::new().user_id("123"))
///         .build()
///         .unwrap();
///
///     let is_toggle_enabled = client.is_enabled("toggle", false);
/// }
/// ```
pub struct Client {
    cache: Arc<ObservableCache>,
    fetcher: Arc<Fetcher>,
    metrics: Arc<MetricsSender>,
    contexts: watch::Sender<Context>,
    ready: watch::Receiver<bool>,
    cancellation_token: CancellationToken,
    close: Once,
    logger: Logger,
}

impl Client {
    pub(crate) fn with_options(mut options: Options) -> Result<Self, ClientError> {
        let logger = Logger::new(Logger::CLIENT, options.log_level());
        let transport: Arc<dyn Transport> = match options.transport() {
            Some(transport) => Arc::clone(transport),
            None => Arc::new(HttpTransport::new(options.http_timeout())?),
        };

        let cache = Arc::new(ObservableCache::new(
            options.take_cache(),
            Arc::clone(options.backup()),
            logger.for_target(Logger::CACHE),
        ));
        match options.backup().load(options.context()) {
            Ok(Some(state)) => {
                log_debug!(logger, "Loaded {} toggles from backup", state.toggles().len());
                cache.write(Arc::new(state));
            }
            Ok(None) => {}
            Err(err) => log_event!(
                logger,
                Level::Warn,
                ErrorKind::PersistenceFailure,
                "Failed to load toggle state backup. {err}"
            ),
        }

        let (fetcher, states) = Fetcher::new(
            options.proxy_url().clone(),
            options.app_name(),
            options.request_headers(),
            Arc::clone(&transport),
            Throttler::new(
                options.refresh_interval(),
                options.longest_acceptable_interval(),
                options.proxy_url().as_str(),
                logger.for_target(Logger::THROTTLER),
            ),
            logger.for_target(Logger::FETCHER),
        );
        cache.subscribe_to(states);

        let metrics = MetricsSender::new(
            &options,
            transport,
            Arc::new(SystemClock),
            logger.for_target(Logger::METRICS),
        );

        let (contexts, context_receiver) = watch::channel(options.context().clone());
        let (ready_sender, ready) = watch::channel(false);
        let client = Self {
            cache,
            fetcher: Arc::new(fetcher),
            metrics: Arc::new(metrics),
            contexts,
            ready,
            cancellation_token: CancellationToken::new(),
            close: Once::new(),
            logger,
        };
        client.start_context_sync(context_receiver, ready_sender);
        if options.polling() {
            client.start_poll(options.refresh_interval());
        }
        if options.metrics() {
            client.start_metrics(options.metrics_interval());
        }
        Ok(client)
    }

    /// Creates a new [`ClientBuilder`] used to build a [`Client`].
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use std::time::Duration;
    /// use unleash_sync::Client;
    ///
    /// # async fn run() {
    /// let client = Client::builder("https://proxy.example.com/proxy", "client-key", "my-app")
    ///     .refresh_interval(Duration::from_secs(30))
    ///     .build()
    ///     .unwrap();
    /// # }
    /// ```
    pub fn builder(proxy_url: &str, client_key: &str, app_name: &str) -> ClientBuilder {
        ClientBuilder::new(proxy_url, client_key, app_name)
    }

    /// Returns whether the toggle identified by `name` is enabled for the current context.
    ///
    /// Returns `default` if the toggle is unknown. The evaluation is counted into metrics.
    pub fn is_enabled(&self, name: &str, default: bool) -> bool {
        let enabled = self.cache.get(name).map_or(default, |toggle| toggle.enabled);
        self.metrics.count(name, enabled)
    }

    /// Returns the variant of the toggle identified by `name`.
    ///
    /// Returns the `disabled` variant if the toggle is unknown. The evaluation is counted
    /// into metrics.
    pub fn get_variant(&self, name: &str) -> Variant {
        let (enabled, variant) = match self.cache.get(name) {
            Some(toggle) => (toggle.enabled, toggle.variant),
            None => (false, Variant::disabled()),
        };
        self.metrics.count(name, enabled);
        self.metrics.count_variant(name, variant)
    }

    /// Returns the toggle identified by `name`, counting the lookup into metrics when found.
    pub fn get_toggle(&self, name: &str) -> Option<Toggle> {
        let toggle = self.cache.get(name)?;
        self.metrics.count(name, toggle.enabled);
        Some(toggle)
    }

    /// Returns all toggles of the current state. Nothing is counted.
    pub fn toggles(&self) -> HashMap<String, Toggle> {
        self.cache
            .read()
            .map(|state| state.toggles().clone())
            .unwrap_or_default()
    }

    /// The context the client currently fetches toggles for.
    pub fn context(&self) -> Context {
        self.contexts.borrow().clone()
    }

    /// Replaces the context and fetches its toggles in the background.
    pub fn set_context(&self, context: Context) {
        self.contexts.send_replace(context);
    }

    /// Replaces the context and waits until its toggles are fetched and stored.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use unleash_sync::{Client, Context, FetchResult};
    ///
    /// #[tokio::main]
    /// async fn main() {
    ///     let client = Client::builder("https://proxy.example.com/proxy", "client-key", "my-app")
    ///         .build()
    ///         .unwrap();
    ///
    ///     let result = client.update_context(Context::new().user_id("123")).await;
    ///     assert!(matches!(result, FetchResult::Success(_)));
    /// }
    /// ```
    pub async fn update_context(&self, context: Context) -> FetchResult {
        // the context task must not start a second fetch for the same change
        self.contexts.send_if_modified(|current| {
            *current = context.clone();
            false
        });
        let result = self.fetcher.fetch_if_context_changed(context).await;
        self.applied(result).await
    }

    /// Fetches the toggles of the current context now, subject to the fetch throttler.
    pub async fn refresh_toggles_now(&self) -> FetchResult {
        let result = self.fetcher.force_fetch(self.context()).await;
        self.applied(result).await
    }

    /// Sends the counted evaluations now, subject to the metrics throttler.
    pub async fn send_metrics_now(&self) -> SendStatus {
        self.metrics.send_metrics(None).await
    }

    /// Subscribes to accepted toggle states, starting with the current one.
    pub fn states(&self) -> StateUpdates {
        self.cache.subscribe()
    }

    /// True once the initial fetch finished, whatever its outcome.
    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Asynchronously waits for the initial fetch for a maximum duration specified in
    /// `wait_timeout`.
    ///
    /// # Errors
    ///
    /// This method fails if the initial fetch takes more time than `wait_timeout`, or the
    /// client was closed before it finished.
    pub async fn wait_for_ready(&self, wait_timeout: Duration) -> Result<(), ClientError> {
        let mut ready = self.ready.clone();
        let wait = async move {
            while !*ready.borrow_and_update() {
                if ready.changed().await.is_err() {
                    return false;
                }
            }
            true
        };
        let message = match timeout(wait_timeout, wait).await {
            Ok(true) => return Ok(()),
            Ok(false) => "Client was closed before the initial fetch finished.".to_owned(),
            Err(_) => format!(
                "Client initialization timed out after {}s.",
                wait_timeout.as_secs()
            ),
        };
        let err = ClientError::new(ErrorKind::ClientInitTimedOut, message);
        log_event!(self.logger, Level::Warn, err.kind, "{}", err);
        Err(err)
    }

    /// Stops the background tasks. Calling it more than once has no effect.
    pub fn close(&self) {
        self.close.call_once(|| {
            log_debug!(self.logger, "Closing client");
            self.cancellation_token.cancel();
        });
    }

    // lookups right after a successful fetch must already see its toggles
    async fn applied(&self, result: FetchResult) -> FetchResult {
        if let FetchResult::Success(state) = &result {
            self.cache.published(state).await;
        }
        result
    }

    fn start_context_sync(&self, mut contexts: watch::Receiver<Context>, ready: watch::Sender<bool>) {
        let fetcher = Arc::clone(&self.fetcher);
        let cache = Arc::clone(&self.cache);
        let token = self.cancellation_token.clone();
        let logger = self.logger;
        tokio::spawn(async move {
            let initial = contexts.borrow_and_update().clone();
            let initial_fetch = async {
                if let FetchResult::Success(state) = fetcher.fetch_if_context_changed(initial).await {
                    cache.published(&state).await;
                }
            };
            tokio::select! {
                _ = initial_fetch => {},
                _ = token.cancelled() => return,
            }
            log_debug!(logger, "Initial fetch finished");
            ready.send_replace(true);

            // the watch starts with the newest context, equal to the initial one unless changed
            let watch = fetcher.start_watching_context(contexts);
            token.cancelled().await;
            watch.unsubscribe();
        });
    }

    fn start_poll(&self, interval: Duration) {
        let fetcher = Arc::clone(&self.fetcher);
        let contexts = self.contexts.subscribe();
        let token = self.cancellation_token.clone();

        tokio::spawn(async move {
            let mut int = interval_at(Instant::now() + interval, interval);
            int.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = int.tick() => {
                        let context = contexts.borrow().clone();
                        fetcher.force_fetch(context).await;
                    },
                    _ = token.cancelled() => break
                }
            }
        });
    }

    fn start_metrics(&self, interval: Duration) {
        let metrics = Arc::clone(&self.metrics);
        let token = self.cancellation_token.clone();

        tokio::spawn(async move {
            let mut int = interval_at(Instant::now() + interval, interval);
            int.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = int.tick() => {
                        metrics.send_metrics(None).await;
                    },
                    _ = token.cancelled() => break
                }
            }
        });
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.close();
    }
}
