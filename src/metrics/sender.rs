use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard};

use log::Level;
use reqwest::Url;

use crate::builder::Options;
use crate::constants::METRICS_PATH;
use crate::errors::ErrorKind::*;
use crate::errors::{ClientError, ErrorKind};
use crate::fetch::transport::{HttpRequest, Transport, TransportError};
use crate::logger::Logger;
use crate::metrics::bucket::{Bucket, CountBucket, MetricsPayload};
use crate::model::toggle::Variant;
use crate::throttle::Throttler;
use crate::utils::Clock;

/// Called once with the outcome of a send that reached the network.
pub type OnComplete = Box<dyn FnOnce(Result<(), ClientError>) + Send>;

/// Outcome of [`MetricsSender::send_metrics`].
#[derive(Debug, Clone, PartialEq)]
pub enum SendStatus {
    /// Nothing was counted since the last send, or there is no metrics URL.
    NothingToSend,
    /// Another send is in flight, this one was skipped.
    AlreadyInFlight,
    /// The metrics throttler denied the send, the counters stay in the live bucket.
    Throttled,
    /// The bucket was delivered.
    Sent,
    /// Delivery failed, the counters were merged back into the live bucket.
    Failed(ClientError),
}

/// Counts toggle evaluations and periodically delivers them to the metrics endpoint.
pub struct MetricsSender {
    url: Option<Url>,
    app_name: String,
    instance_id: String,
    headers: Vec<(String, String)>,
    transport: Arc<dyn Transport>,
    throttler: Throttler,
    bucket: RwLock<CountBucket>,
    in_flight: AtomicBool,
    clock: Arc<dyn Clock>,
    logger: Logger,
}

/// Holds the in-flight flag. Dropping it releases the flag and merges undelivered
/// counters back, whichever way the send ends.
struct SendGuard<'a> {
    sender: &'a MetricsSender,
    unsent: Option<Bucket>,
}

impl Drop for SendGuard<'_> {
    fn drop(&mut self) {
        if let Some(bucket) = self.unsent.take() {
            self.sender.merge_back(&bucket);
        }
        self.sender.in_flight.store(false, Ordering::SeqCst);
    }
}

impl MetricsSender {
    pub(crate) fn new(options: &Options, transport: Arc<dyn Transport>, clock: Arc<dyn Clock>, logger: Logger) -> Self {
        let url = metrics_url(options.proxy_url());
        let target = url.as_ref().map_or_else(String::new, Url::to_string);
        Self {
            throttler: Throttler::new(
                options.metrics_interval(),
                options.longest_acceptable_interval(),
                &target,
                logger.for_target(Logger::THROTTLER),
            ),
            url,
            app_name: options.app_name().to_owned(),
            instance_id: options.instance_id().to_owned(),
            headers: options.request_headers(),
            transport,
            bucket: RwLock::new(CountBucket::new(clock.now())),
            in_flight: AtomicBool::new(false),
            clock,
            logger,
        }
    }

    /// Counts one evaluation of `feature`, hands `enabled` back.
    pub fn count(&self, feature: &str, enabled: bool) -> bool {
        self.live().count(feature, enabled)
    }

    /// Counts one evaluation of `feature` resulting in `variant`, hands `variant` back.
    pub fn count_variant(&self, feature: &str, variant: Variant) -> Variant {
        self.live().count_variant(feature, variant)
    }

    /// True when nothing was counted since the last send.
    pub fn is_empty(&self) -> bool {
        self.live().is_empty()
    }

    #[cfg(test)]
    pub fn throttler(&self) -> &Throttler {
        &self.throttler
    }

    /// Delivers the counters collected since the last successful send.
    ///
    /// At most one send is in flight at a time. `on_complete` is only invoked when a request
    /// was made; a panic inside it is caught and logged.
    pub async fn send_metrics(&self, on_complete: Option<OnComplete>) -> SendStatus {
        let Some(url) = &self.url else {
            log_debug!(self.logger, "No metrics URL, skipping metrics reporting");
            return SendStatus::NothingToSend;
        };
        if self.is_empty() {
            log_debug!(self.logger, "No metrics to report");
            return SendStatus::NothingToSend;
        }
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            log_debug!(self.logger, "Metrics report already in flight, skipping this send");
            return SendStatus::AlreadyInFlight;
        }
        let mut guard = SendGuard {
            sender: self,
            unsent: None,
        };
        if !self.throttler.perform_action() {
            return SendStatus::Throttled;
        }

        let bucket = self.swap_and_freeze();
        let payload = MetricsPayload {
            app_name: &self.app_name,
            instance_id: &self.instance_id,
            bucket: &bucket,
        };
        let body = serde_json::to_string(&payload);
        guard.unsent = Some(bucket);
        let body = match body {
            Ok(body) => body,
            Err(err) => {
                let error = self.failure(PayloadSerializationFailure, format!("Failed to serialize metrics payload. {err}"));
                drop(guard);
                return self.complete(on_complete, Err(error));
            }
        };

        let mut request = HttpRequest::new(url.to_string()).body(body);
        for (name, value) in &self.headers {
            request = request.header(name, value);
        }
        let result = match self.transport.post(request).await {
            Ok(response) => {
                log_debug!(self.logger, "Received status code {} from POST {}", response.status, url);
                self.throttler.handle(response.status);
                match response.status {
                    200..=299 => Ok(()),
                    code @ (429 | 500..=599) => Err(self.failure(
                        RetryableHttpResponse,
                        format!("Retryable HTTP response was received while trying to send metrics. Status code: {code}"),
                    )),
                    code => Err(self.failure(
                        UnexpectedHttpResponse,
                        format!("Unexpected HTTP response was received while trying to send metrics. Status code: {code}"),
                    )),
                }
            }
            Err(TransportError::Timeout) => {
                Err(self.failure(HttpRequestTimeout, "Request timed out while trying to send metrics.".to_owned()))
            }
            Err(TransportError::Request(err)) => Err(self.failure(
                HttpRequestFailure,
                format!("Unexpected error occurred while trying to send metrics. {err}"),
            )),
        };
        if result.is_ok() {
            guard.unsent = None;
        }
        drop(guard);
        self.complete(on_complete, result)
    }

    fn complete(&self, on_complete: Option<OnComplete>, result: Result<(), ClientError>) -> SendStatus {
        if let Some(callback) = on_complete {
            let outcome = result.clone();
            if catch_unwind(AssertUnwindSafe(move || callback(outcome))).is_err() {
                log_warn!(self.logger, "Metrics completion callback panicked");
            }
        }
        match result {
            Ok(()) => SendStatus::Sent,
            Err(err) => SendStatus::Failed(err),
        }
    }

    fn swap_and_freeze(&self) -> Bucket {
        let mut live = self.bucket.write().unwrap_or_else(PoisonError::into_inner);
        let now = self.clock.now();
        let retired = std::mem::replace(&mut *live, CountBucket::new(now));
        drop(live);
        retired.freeze(now)
    }

    // the live bucket keeps its own start, the window of the failed bucket is lost
    fn merge_back(&self, bucket: &Bucket) {
        log_debug!(self.logger, "Merging {} undelivered toggle counters back", bucket.toggles.len());
        self.live().merge(bucket);
    }

    fn live(&self) -> RwLockReadGuard<'_, CountBucket> {
        self.bucket.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn failure(&self, kind: ErrorKind, msg: String) -> ClientError {
        log_event!(self.logger, Level::Warn, kind, "{}", msg);
        ClientError::new(kind, msg)
    }
}

fn metrics_url(proxy_url: &Url) -> Option<Url> {
    let mut url = proxy_url.clone();
    url.set_query(None);
    {
        let mut segments = url.path_segments_mut().ok()?;
        segments.pop_if_empty().extend(METRICS_PATH);
    }
    Some(url)
}
