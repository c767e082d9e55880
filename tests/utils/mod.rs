use log::kv::Key;
use log::{set_max_level, Level, Log, Metadata, Record};
use std::cell::RefCell;

pub const KEY: &str = "some-key";
pub const APP: &str = "test-app";

pub fn toggles_json(toggles: &[(&str, bool)]) -> String {
    let entries: Vec<String> = toggles
        .iter()
        .map(|(name, enabled)| {
            format!(r#"{{"name": "{name}", "enabled": {enabled}, "variant": {{"name": "disabled", "enabled": false}}}}"#)
        })
        .collect();
    format!(r#"{{"toggles": [{}]}}"#, entries.join(","))
}

pub struct PrintLog {}

impl Log for PrintLog {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level() && metadata.target().contains("unleash_sync")
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let level = match record.level() {
            Level::Error => "[ERROR]",
            Level::Warn => "[WARN]",
            Level::Info => "[INFO]",
            Level::Debug => "[DEBUG]",
            Level::Trace => "[TRACE]",
        };
        println!("{level} {}", record.args());
    }

    fn flush(&self) {}
}

pub struct RecordingLogger {}

impl RecordingLogger {
    thread_local!(pub static LOGS: RefCell<String> = RefCell::new(String::default()));
}

impl Log for RecordingLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level() && metadata.target().contains("unleash_sync")
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let level = match record.level() {
            Level::Error => "ERROR",
            Level::Warn => "WARNING",
            Level::Info => "INFO",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        };
        let event_id = record
            .key_values()
            .get(Key::from("event_id"))
            .and_then(|id| id.to_i64())
            .unwrap_or_default();
        Self::LOGS.with_borrow_mut(|l| l.push_str(format!("{level} [{event_id}] {}\n", record.args()).as_str()));
    }

    fn flush(&self) {}
}

pub fn log_record_init() {
    set_max_level(log::LevelFilter::Info);
    _ = log::set_logger(&RecordingLogger {});
}
