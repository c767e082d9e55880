macro_rules! log_event {
    ($logger:expr, $level:expr, $kind:expr, $($arg:tt)+) => {{
        let logger: &$crate::logger::Logger = &$logger;
        if logger.enabled($level) {
            log::log!(target: logger.target(), $level, event_id = $kind.as_u16(); $($arg)+);
        }
    }};
}

macro_rules! log_debug {
    ($logger:expr, $($arg:tt)+) => {{
        let logger: &$crate::logger::Logger = &$logger;
        if logger.enabled(log::Level::Debug) {
            log::log!(target: logger.target(), log::Level::Debug, $($arg)+);
        }
    }};
}

macro_rules! log_warn {
    ($logger:expr, $($arg:tt)+) => {{
        let logger: &$crate::logger::Logger = &$logger;
        if logger.enabled(log::Level::Warn) {
            log::log!(target: logger.target(), log::Level::Warn, $($arg)+);
        }
    }};
}
