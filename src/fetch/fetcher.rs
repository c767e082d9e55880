use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use log::Level;
use reqwest::header::IF_NONE_MATCH;
use reqwest::Url;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::errors::ErrorKind::*;
use crate::errors::{ClientError, ErrorKind};
use crate::fetch::transport::{HttpRequest, HttpResponse, Transport, TransportError};
use crate::logger::Logger;
use crate::model::context::Context;
use crate::model::toggle::{state_from_json, ToggleState};
use crate::throttle::Throttler;

/// Outcome of a fetch.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchResult {
    /// New toggles were fetched and published.
    Success(Arc<ToggleState>),
    /// The toggles didn't change, or the context equals the one of the last attempt.
    NotModified,
    /// The fetch throttler denied the attempt, no request was sent.
    Throttled,
    /// A fetch for a newer context superseded this one, its result was discarded.
    Cancelled,
    /// The request failed, the cache was left untouched.
    Failure(ClientError),
}

struct InFlight {
    id: u64,
    token: CancellationToken,
}

#[derive(Default)]
struct AttemptState {
    context_for_last_attempt: Option<Context>,
    in_flight: Option<InFlight>,
    etag: Option<(Context, String)>,
}

impl AttemptState {
    fn is_current(&self, id: u64) -> bool {
        self.in_flight.as_ref().is_some_and(|attempt| attempt.id == id)
    }
}

struct Attempt {
    id: u64,
    token: CancellationToken,
    etag: Option<String>,
}

/// Retrieves toggles for a [`Context`] and publishes accepted states.
///
/// Every started fetch cancels the one still in flight, so only the result of the newest
/// context can reach the output channel.
pub struct Fetcher {
    url: Url,
    app_name: String,
    headers: Vec<(String, String)>,
    transport: Arc<dyn Transport>,
    throttler: Throttler,
    attempts: Mutex<AttemptState>,
    next_id: AtomicU64,
    states: mpsc::UnboundedSender<Arc<ToggleState>>,
    logger: Logger,
}

impl Fetcher {
    /// Creates the fetcher and the receiving end of its output channel.
    pub fn new(
        url: Url,
        app_name: &str,
        headers: Vec<(String, String)>,
        transport: Arc<dyn Transport>,
        throttler: Throttler,
        logger: Logger,
    ) -> (Self, mpsc::UnboundedReceiver<Arc<ToggleState>>) {
        let (states, receiver) = mpsc::unbounded_channel();
        let fetcher = Self {
            url,
            app_name: app_name.to_owned(),
            headers,
            transport,
            throttler,
            attempts: Mutex::new(AttemptState::default()),
            next_id: AtomicU64::new(1),
            states,
            logger,
        };
        (fetcher, receiver)
    }

    /// Fetches only when `context` differs from the context of the last attempt.
    pub async fn fetch_if_context_changed(&self, context: Context) -> FetchResult {
        match self.begin_attempt(&context, true) {
            Some(attempt) => self.execute(attempt, context).await,
            None => {
                log_debug!(self.logger, "Context unchanged, skipping fetch");
                FetchResult::NotModified
            }
        }
    }

    /// Fetches regardless of the last context, if the fetch throttler allows it.
    pub async fn force_fetch(&self, context: Context) -> FetchResult {
        if !self.throttler.perform_action() {
            return FetchResult::Throttled;
        }
        self.do_fetch(context).await
    }

    /// Cancels the fetch in flight and fetches the toggles of `context`.
    pub async fn do_fetch(&self, context: Context) -> FetchResult {
        match self.begin_attempt(&context, false) {
            Some(attempt) => self.execute(attempt, context).await,
            None => FetchResult::NotModified,
        }
    }

    /// Fetches for every context published on `contexts`, starting with the current one.
    ///
    /// Attempts are registered in delivery order, only the request runs as its own task, so
    /// a newer change always cancels the older fetch.
    pub fn start_watching_context(self: &Arc<Self>, mut contexts: watch::Receiver<Context>) -> ContextWatch {
        let token = CancellationToken::new();
        let stop = token.clone();
        let fetcher = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let context = contexts.borrow_and_update().clone();
                match fetcher.begin_attempt(&context, true) {
                    Some(attempt) => {
                        let task_fetcher = Arc::clone(&fetcher);
                        tokio::spawn(async move { task_fetcher.execute(attempt, context).await });
                    }
                    None => log_debug!(fetcher.logger, "Context unchanged, skipping fetch"),
                }
                tokio::select! {
                    _ = stop.cancelled() => break,
                    changed = contexts.changed() => if changed.is_err() { break },
                }
            }
            log_debug!(fetcher.logger, "Stopped watching context changes");
        });
        ContextWatch { token }
    }

    /// The throttler guarding forced fetches.
    pub fn throttler(&self) -> &Throttler {
        &self.throttler
    }

    fn begin_attempt(&self, context: &Context, only_if_changed: bool) -> Option<Attempt> {
        let mut attempts = self.lock();
        if only_if_changed && attempts.context_for_last_attempt.as_ref() == Some(context) {
            return None;
        }
        if let Some(previous) = attempts.in_flight.take() {
            log_debug!(self.logger, "Cancelling fetch #{} for a superseded context", previous.id);
            previous.token.cancel();
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let token = CancellationToken::new();
        attempts.in_flight = Some(InFlight {
            id,
            token: token.clone(),
        });
        attempts.context_for_last_attempt = Some(context.clone());
        let etag = match &attempts.etag {
            Some((etag_context, etag)) if etag_context == context => Some(etag.clone()),
            _ => None,
        };
        Some(Attempt { id, token, etag })
    }

    async fn execute(&self, attempt: Attempt, context: Context) -> FetchResult {
        let request = self.request_for(&context, attempt.etag.as_deref());
        log_debug!(self.logger, "Fetch #{} started: {}", attempt.id, request.url);
        let response = tokio::select! {
            _ = attempt.token.cancelled() => return FetchResult::Cancelled,
            response = self.transport.get(request) => response,
        };
        let result = match response {
            Ok(response) => {
                if !self.report_status(attempt.id, response.status) {
                    log_debug!(self.logger, "Fetch #{} completed after being superseded, discarding response", attempt.id);
                    return FetchResult::Cancelled;
                }
                self.handle_response(attempt.id, response, context)
            }
            Err(err) => FetchResult::Failure(self.transport_failure(err)),
        };
        if !matches!(result, FetchResult::Success(_) | FetchResult::Cancelled) {
            self.finish(attempt.id);
        }
        result
    }

    fn handle_response(&self, id: u64, response: HttpResponse, context: Context) -> FetchResult {
        match response.status {
            200..=299 => {
                let etag = response.etag;
                match state_from_json(&response.body, context.clone(), etag.clone(), Utc::now()) {
                    Ok(state) => self.accept(id, Arc::new(state), context, etag),
                    Err(parse_error) => {
                        let msg = format!("Fetching toggles was successful but the HTTP response content was invalid. {parse_error}");
                        FetchResult::Failure(self.failure(InvalidHttpResponseContent, msg))
                    }
                }
            }
            304 => {
                log_debug!(self.logger, "Fetch #{id} was successful: not modified");
                FetchResult::NotModified
            }
            code @ (429 | 500..=599) => {
                let msg = format!("Retryable HTTP response was received while trying to fetch toggles. Status code: {code}");
                FetchResult::Failure(self.failure(RetryableHttpResponse, msg))
            }
            code => {
                let msg = format!("Unexpected HTTP response was received while trying to fetch toggles. Status code: {code}");
                FetchResult::Failure(self.failure(UnexpectedHttpResponse, msg))
            }
        }
    }

    fn accept(&self, id: u64, state: Arc<ToggleState>, context: Context, etag: Option<String>) -> FetchResult {
        let mut attempts = self.lock();
        if !attempts.is_current(id) {
            log_debug!(self.logger, "Fetch #{id} completed after being superseded, discarding result");
            return FetchResult::Cancelled;
        }
        attempts.in_flight = None;
        attempts.etag = etag.map(|etag| (context, etag));
        log_debug!(self.logger, "Fetch #{id} was successful: {} toggles fetched", state.toggles().len());
        // the receiver is gone only when the cache was dropped
        let _ = self.states.send(Arc::clone(&state));
        FetchResult::Success(state)
    }

    // a superseded attempt must not move the backoff
    fn report_status(&self, id: u64, status: u16) -> bool {
        let attempts = self.lock();
        if !attempts.is_current(id) {
            return false;
        }
        self.throttler.handle(status);
        true
    }

    fn finish(&self, id: u64) {
        let mut attempts = self.lock();
        if attempts.is_current(id) {
            attempts.in_flight = None;
        }
    }

    fn request_for(&self, context: &Context, etag: Option<&str>) -> HttpRequest {
        let mut url = self.url.clone();
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("appName", &self.app_name);
            for (key, value) in context.query_pairs() {
                query.append_pair(&key, &value);
            }
        }
        let mut request = HttpRequest::new(url.to_string());
        for (name, value) in &self.headers {
            request = request.header(name, value);
        }
        if let Some(etag) = etag {
            request = request.header(IF_NONE_MATCH.as_str(), etag);
        }
        request
    }

    fn transport_failure(&self, error: TransportError) -> ClientError {
        match error {
            TransportError::Timeout => {
                self.failure(HttpRequestTimeout, "Request timed out while trying to fetch toggles.".to_owned())
            }
            TransportError::Request(err) => self.failure(
                HttpRequestFailure,
                format!("Unexpected error occurred while trying to fetch toggles. It is most likely due to a local network issue. {err}"),
            ),
        }
    }

    fn failure(&self, kind: ErrorKind, msg: String) -> ClientError {
        log_event!(self.logger, Level::Error, kind, "{}", msg);
        ClientError::new(kind, msg)
    }

    fn lock(&self) -> MutexGuard<'_, AttemptState> {
        self.attempts.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle of a running context watch. Dropping it stops the watch.
pub struct ContextWatch {
    token: CancellationToken,
}

impl ContextWatch {
    /// Stops reacting to context changes. A fetch already in flight runs to completion.
    pub fn unsubscribe(&self) {
        self.token.cancel();
    }

    /// False once unsubscribed.
    pub fn is_active(&self) -> bool {
        !self.token.is_cancelled()
    }
}

impl Drop for ContextWatch {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
