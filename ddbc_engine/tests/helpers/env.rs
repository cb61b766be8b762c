//! Helper functions for reading environment variables in tests

use ddbc_engine::test_helpers::load_dotenv;

/// Path of the driver library for real-driver tests, from `DDBC_TEST_DRIVER`.
/// Returns None if not set (tests should be skipped in this case)
pub fn get_test_driver() -> Option<String> {
    load_dotenv();
    std::env::var("DDBC_TEST_DRIVER")
        .ok()
        .filter(|s| !s.is_empty())
}

/// Connection string for real-driver tests, from `DDBC_TEST_DSN`.
pub fn get_test_dsn() -> Option<String> {
    load_dotenv();
    std::env::var("DDBC_TEST_DSN").ok().filter(|s| !s.is_empty())
}

/// Routes engine logs through `env_logger`; `RUST_LOG` picks the level.
pub fn init_test_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}
