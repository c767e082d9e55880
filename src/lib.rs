//! Unleash toggle synchronization for Rust.
//!
//! Keeps a local view of the toggles evaluated by an Unleash frontend API (or proxy) in
//! sync with a changing [`Context`], and reports toggle usage metrics back to it.

#![warn(missing_docs)]

#[macro_use]
mod macros;
mod backup;
mod builder;
mod cache;
mod client;
mod constants;
mod errors;
mod fetch;
mod logger;
mod metrics;
mod model;
mod throttle;
mod utils;

pub use backup::{BackupError, FileBackup, NoopBackup, StateBackup};
pub use builder::ClientBuilder;
pub use cache::{InMemoryToggleCache, ObservableCache, StateUpdates, ToggleCache};
pub use client::Client;
pub use constants::PKG_VERSION;
pub use errors::{ClientError, ErrorKind};
pub use fetch::fetcher::{ContextWatch, FetchResult, Fetcher};
pub use fetch::transport::{HttpRequest, HttpResponse, HttpTransport, Transport, TransportError};
pub use logger::Logger;
pub use metrics::sender::SendStatus;
pub use model::context::Context;
pub use model::toggle::{Payload, Toggle, ToggleState, Variant};
pub use throttle::Throttler;
