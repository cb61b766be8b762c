use ddbc_engine::driver::mock::MockDriver;
use ddbc_engine::observability::LogCrateSink;
use ddbc_engine::{Client, ConnectionOptions, DriverContext, EngineConfig, StructuredLogger};
use log::LevelFilter;
use std::sync::Arc;
use std::time::Duration;

/// Context over a fresh mock driver, logging through the `log` facade.
pub fn mock_context() -> (Arc<MockDriver>, Arc<DriverContext>) {
    super::init_test_logging();
    let mock = Arc::new(MockDriver::new());
    let logger = Arc::new(StructuredLogger::new(LevelFilter::Debug, Arc::new(LogCrateSink)));
    let ctx = DriverContext::new(mock.clone(), logger);
    (mock, ctx)
}

pub fn mock_client(options: ConnectionOptions) -> (Arc<MockDriver>, Client) {
    let (mock, ctx) = mock_context();
    let config = EngineConfig {
        log_level: "debug".to_string(),
        ..EngineConfig::default()
    };
    let client = Client::with_options(ctx, config, options).expect("valid config");
    (mock, client)
}

pub fn pooled_client(max_size: usize, idle_timeout: Duration) -> (Arc<MockDriver>, Client) {
    let (mock, client) = mock_client(ConnectionOptions::default());
    client
        .enable_pooling(max_size, idle_timeout)
        .expect("valid pool settings");
    (mock, client)
}
