/// Version of this crate, sent in the `unleash-sdk` header.
pub const PKG_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const SDK_NAME: &str = "unleash-sync";

pub const METRICS_PATH: [&str; 2] = ["client", "metrics"];

pub const APP_NAME_HEADER: &str = "unleash-appname";
pub const SDK_HEADER: &str = "unleash-sdk";
pub const CONNECTION_ID_HEADER: &str = "unleash-connection-id";

pub const DISABLED_VARIANT_NAME: &str = "disabled";

pub const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_METRICS_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_LONGEST_ACCEPTABLE_INTERVAL_SECS: u64 = 300;
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

#[cfg(test)]
pub mod test_constants {
    pub const MOCK_PATH: &str = "/proxy";
    pub const MOCK_METRICS_PATH: &str = "/proxy/client/metrics";
    pub const MOCK_KEY: &str = "some-key";
    pub const MOCK_APP: &str = "test-app";
}
