use log::{Level, LevelFilter};

/// Logging handle given to each component at construction.
///
/// Records are forwarded to the [`log`] facade under the component's target, but only when
/// both the configured minimum level and the facade's global max level allow them.
#[derive(Debug, Clone, Copy)]
pub struct Logger {
    target: &'static str,
    level: LevelFilter,
}

impl Logger {
    /// Log targets, one per component.
    pub const THROTTLER: &'static str = "unleash_sync::throttler";
    pub const FETCHER: &'static str = "unleash_sync::fetcher";
    pub const METRICS: &'static str = "unleash_sync::metrics";
    pub const CACHE: &'static str = "unleash_sync::cache";
    pub const CLIENT: &'static str = "unleash_sync::client";

    /// Creates a logger for `target` that drops records below `level`.
    pub fn new(target: &'static str, level: LevelFilter) -> Self {
        Self { target, level }
    }

    /// Same minimum level, different component.
    pub fn for_target(&self, target: &'static str) -> Self {
        Self::new(target, self.level)
    }

    /// The `log` target records are emitted under.
    pub fn target(&self) -> &'static str {
        self.target
    }

    /// Whether a record at `level` would be emitted.
    pub fn enabled(&self, level: Level) -> bool {
        level <= self.level && level <= log::max_level()
    }
}

impl Default for Logger {
    fn default() -> Self {
        Self::new(Self::CLIENT, LevelFilter::Warn)
    }
}
