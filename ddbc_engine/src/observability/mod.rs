pub mod logging;

pub use logging::{CallbackSink, LogCrateSink, LogSink, StructuredLogger};

/// Logs through a [`StructuredLogger`], formatting only when the level is
/// enabled.
#[macro_export]
macro_rules! ddbc_log {
    ($logger:expr, $level:expr, $($arg:tt)+) => {{
        let logger: &$crate::observability::StructuredLogger = &$logger;
        let level = $level;
        if logger.enabled(level) {
            logger.log(level, format_args!($($arg)+));
        }
    }};
}
