//! Smoke test against a real SQL Server driver. Needs `DDBC_TEST_DRIVER`
//! (path of the driver library) and `DDBC_TEST_DSN`, read from the
//! environment or a `.env` file.
#![cfg(feature = "native-driver")]

use ddbc_engine::{Client, EngineConfig, Value};

mod helpers;
use helpers::{get_test_driver, get_test_dsn, init_test_logging};

#[test]
#[ignore]
fn test_select_through_real_driver() {
    init_test_logging();
    let (Some(driver), Some(dsn)) = (get_test_driver(), get_test_dsn()) else {
        eprintln!("Skipping: DDBC_TEST_DRIVER and DDBC_TEST_DSN must be set");
        return;
    };
    let client = Client::load(driver, EngineConfig::default()).expect("driver loads");
    let mut handle = client.connect(&dsn).expect("connects");
    let mut cursor = handle.cursor().unwrap();
    cursor
        .execute("SELECT CAST(? AS INT) AS n, N'ok' AS s", &[Value::Int(42)])
        .unwrap();
    assert_eq!(cursor.description()[0].name, "n");
    assert_eq!(
        cursor.fetchone().unwrap(),
        Some(vec![Value::Int(42), Value::from("ok")])
    );
    cursor.close().unwrap();
    handle.close().unwrap();
}
