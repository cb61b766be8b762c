use crate::config::connection_string::sanitize;
use log::{Level, LevelFilter};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Destination of log records emitted by the engine.
pub trait LogSink: Send + Sync {
    fn write(&self, level: Level, message: &str);
}

/// Forwards records to the `log` facade under the `ddbc_engine` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogCrateSink;

impl LogSink for LogCrateSink {
    fn write(&self, level: Level, message: &str) {
        log::log!(target: "ddbc_engine", level, "{}", message);
    }
}

/// Hands records to a host callback. Calls are serialized by the sink's own
/// lock; the engine never holds any other lock while dispatching.
pub struct CallbackSink {
    callback: Mutex<Box<dyn FnMut(Level, &str) + Send>>,
}

impl CallbackSink {
    pub fn new(callback: impl FnMut(Level, &str) + Send + 'static) -> Self {
        Self {
            callback: Mutex::new(Box::new(callback)),
        }
    }
}

impl LogSink for CallbackSink {
    fn write(&self, level: Level, message: &str) {
        let mut callback = self.callback.lock().unwrap_or_else(|e| e.into_inner());
        (callback)(level, message);
    }
}

/// Structured logger shared by every component created from one driver
/// context. `enabled` is a single relaxed atomic load, so disabled levels
/// cost nothing beyond that check; message formatting only happens after it.
pub struct StructuredLogger {
    level: AtomicUsize,
    sink: Arc<dyn LogSink>,
}

impl StructuredLogger {
    pub fn new(level: LevelFilter, sink: Arc<dyn LogSink>) -> Self {
        Self {
            level: AtomicUsize::new(level as usize),
            sink,
        }
    }

    /// Logger that drops everything.
    pub fn disabled() -> Self {
        Self::new(LevelFilter::Off, Arc::new(LogCrateSink))
    }

    pub fn set_level(&self, level: LevelFilter) {
        self.level.store(level as usize, Ordering::Relaxed);
    }

    pub fn level(&self) -> LevelFilter {
        match self.level.load(Ordering::Relaxed) {
            0 => LevelFilter::Off,
            1 => LevelFilter::Error,
            2 => LevelFilter::Warn,
            3 => LevelFilter::Info,
            4 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    }

    #[inline]
    pub fn enabled(&self, level: Level) -> bool {
        level as usize <= self.level.load(Ordering::Relaxed)
    }

    pub fn log(&self, level: Level, args: fmt::Arguments<'_>) {
        if !self.enabled(level) {
            return;
        }
        self.sink.write(level, &args.to_string());
    }

    pub fn error(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Error, args);
    }

    pub fn warn(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Warn, args);
    }

    pub fn info(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Info, args);
    }

    pub fn debug(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Debug, args);
    }

    pub fn trace(&self, args: fmt::Arguments<'_>) {
        self.log(Level::Trace, args);
    }

    pub fn log_query(&self, level: Level, query: &str, param_count: usize) {
        if !self.enabled(level) {
            return;
        }
        self.sink
            .write(level, &format!("Query: {}, params={}", query, param_count));
    }

    /// The connection string is sanitized before it reaches the sink.
    pub fn log_connection(&self, level: Level, connection_string: &str, action: &str) {
        if !self.enabled(level) {
            return;
        }
        self.sink.write(
            level,
            &format!("Connection {}: {}", action, sanitize(connection_string)),
        );
    }

    pub fn log_error(&self, context: &str, error: &dyn fmt::Display) {
        if !self.enabled(Level::Error) {
            return;
        }
        self.sink
            .write(Level::Error, &format!("Error: {}: {}", context, error));
    }
}

impl Default for StructuredLogger {
    fn default() -> Self {
        Self::new(LevelFilter::Info, Arc::new(LogCrateSink))
    }
}

impl fmt::Debug for StructuredLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StructuredLogger")
            .field("level", &self.level())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize as Counter;

    #[derive(Default)]
    struct Capture {
        lines: Mutex<Vec<(Level, String)>>,
    }

    impl LogSink for Capture {
        fn write(&self, level: Level, message: &str) {
            self.lines.lock().unwrap().push((level, message.to_string()));
        }
    }

    #[test]
    fn test_structured_logger_default() {
        let logger = StructuredLogger::default();
        assert_eq!(logger.level(), LevelFilter::Info);
        assert!(logger.enabled(Level::Warn));
        assert!(!logger.enabled(Level::Debug));
    }

    #[test]
    fn test_structured_logger_disabled() {
        let logger = StructuredLogger::disabled();
        assert!(!logger.enabled(Level::Error));
        logger.error(format_args!("dropped"));
    }

    #[test]
    fn test_level_filter_applies_before_sink() {
        let capture = Arc::new(Capture::default());
        let logger = StructuredLogger::new(LevelFilter::Warn, capture.clone());
        logger.info(format_args!("not shown"));
        logger.warn(format_args!("shown {}", 1));
        let lines = capture.lines.lock().unwrap();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0], (Level::Warn, "shown 1".to_string()));
    }

    #[test]
    fn test_set_level_at_runtime() {
        let capture = Arc::new(Capture::default());
        let logger = StructuredLogger::new(LevelFilter::Off, capture.clone());
        logger.debug(format_args!("a"));
        logger.set_level(LevelFilter::Trace);
        logger.trace(format_args!("b"));
        assert_eq!(capture.lines.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_log_connection_masks_password() {
        let capture = Arc::new(Capture::default());
        let logger = StructuredLogger::new(LevelFilter::Info, capture.clone());
        logger.log_connection(Level::Info, "Server=db;UID=sa;PWD=secret;", "connect");
        let lines = capture.lines.lock().unwrap();
        assert!(!lines[0].1.contains("secret"));
        assert!(lines[0].1.starts_with("Connection connect: "));
    }

    #[test]
    fn test_callback_sink_receives_messages() {
        let seen = Arc::new(Counter::new(0));
        let seen_cb = seen.clone();
        let sink = CallbackSink::new(move |level, msg| {
            assert_eq!(level, Level::Error);
            assert!(msg.contains("boom"));
            seen_cb.fetch_add(1, Ordering::SeqCst);
        });
        let logger = StructuredLogger::new(LevelFilter::Error, Arc::new(sink));
        logger.log_error("execute", &"boom");
        logger.log_query(Level::Info, "SELECT 1", 0);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
