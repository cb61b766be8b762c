//! Engine configuration read from `DDBC_*` environment variables.
use ddbc_engine::{DdbcError, EngineConfig};
use serial_test::serial;
use std::time::Duration;

const VARS: [&str; 5] = [
    "DDBC_POOL_MAX_SIZE",
    "DDBC_POOL_IDLE_TIMEOUT_SECS",
    "DDBC_FETCH_SIZE",
    "DDBC_LOG_LEVEL",
    "DDBC_POOLING",
];

fn clear_env() {
    for var in VARS {
        std::env::remove_var(var);
    }
}

#[test]
#[serial]
fn test_defaults_without_env() {
    clear_env();
    let config = EngineConfig::from_env().unwrap();
    assert_eq!(config, EngineConfig::default());
    assert_eq!(config.pool.max_size, 10);
    assert_eq!(config.pool.idle_timeout, Duration::from_secs(300));
}

#[test]
#[serial]
fn test_env_overrides() {
    clear_env();
    std::env::set_var("DDBC_POOL_MAX_SIZE", "4");
    std::env::set_var("DDBC_POOL_IDLE_TIMEOUT_SECS", "0");
    std::env::set_var("DDBC_FETCH_SIZE", "50");
    std::env::set_var("DDBC_LOG_LEVEL", "warn");
    std::env::set_var("DDBC_POOLING", "yes");
    let config = EngineConfig::from_env().unwrap();
    clear_env();

    assert!(config.pooling);
    assert_eq!(config.pool.max_size, 4);
    assert_eq!(config.pool.idle_timeout, Duration::ZERO);
    assert_eq!(config.default_fetch_size, 50);
    assert_eq!(config.level_filter().unwrap(), log::LevelFilter::Warn);
}

#[test]
#[serial]
fn test_malformed_env_is_rejected() {
    clear_env();
    std::env::set_var("DDBC_POOLING", "maybe");
    assert!(matches!(EngineConfig::from_env(), Err(DdbcError::Config(_))));
    clear_env();

    std::env::set_var("DDBC_POOL_MAX_SIZE", "0");
    assert!(matches!(EngineConfig::from_env(), Err(DdbcError::Config(_))));
    clear_env();
}
