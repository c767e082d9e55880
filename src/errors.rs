use std::error::Error;
use std::fmt::{Display, Formatter};

/// Error kind that represents failures reported by the SDK components.
///
/// The numeric value of each kind is attached to log records as `event_id`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// Initialization of the internal [`reqwest::Client`] failed.
    HttpClientInitFailure = 1000,
    /// The configured proxy URL could not be parsed.
    InvalidProxyUrl = 1001,
    /// No client key was given to the builder.
    MissingClientKey = 1002,
    /// No application name was given to the builder.
    MissingAppName = 1003,
    /// The server answered with 429 or a 5xx status, the request may succeed later.
    RetryableHttpResponse = 1100,
    /// Unexpected HTTP response was received (a non-retryable status code).
    UnexpectedHttpResponse = 1101,
    /// The HTTP request timed out.
    HttpRequestTimeout = 1102,
    /// The HTTP request failed (most likely, due to a local network issue).
    HttpRequestFailure = 1103,
    /// A 200 OK response arrived with a body that is not a valid toggle document.
    InvalidHttpResponseContent = 1105,
    /// Reading or writing the local backup failed.
    PersistenceFailure = 2200,
    /// The metrics payload could not be serialized.
    PayloadSerializationFailure = 2300,
    /// No toggle state became available within the given time.
    ClientInitTimedOut = 4200,
}

impl ErrorKind {
    pub(crate) fn as_u16(&self) -> u16 {
        *self as u16
    }
}

/// Error struct that holds the [`ErrorKind`] and message of the reported failure.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientError {
    /// Error kind that represents the failure.
    pub kind: ErrorKind,
    /// The text representation of the failure.
    pub message: String,
}

impl ClientError {
    pub(crate) fn new(kind: ErrorKind, message: String) -> Self {
        Self { message, kind }
    }

    /// True when repeating the same request later has a chance to succeed.
    ///
    /// Transport failures (timeouts, connection errors) and 429/5xx responses are retryable,
    /// everything else points to a problem a retry won't fix.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::RetryableHttpResponse
                | ErrorKind::HttpRequestTimeout
                | ErrorKind::HttpRequestFailure
        )
    }
}

impl Display for ClientError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.message.as_str())
    }
}

impl Error for ClientError {}
