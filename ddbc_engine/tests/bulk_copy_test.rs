//! Bulk copy driven through connection handles.
use ddbc_engine::driver::mock::{MockControl, MockOp};
use ddbc_engine::driver::sql::*;
use ddbc_engine::driver::BcpControlValue;
use ddbc_engine::engine::BcpState;
use ddbc_engine::{BcpOptions, ConnectionOptions, DdbcError, Value};

mod helpers;
use helpers::mock_client;

const DSN: &str = "Server=db;Database=warehouse";

#[test]
fn test_row_by_row_copy_in() {
    let (mock, client) = mock_client(ConnectionOptions::default().bulk_copy(true));
    let handle = client.connect(DSN).unwrap();
    let op = handle.open_bulk_copy("dbo.readings", None, None, "IN").unwrap();
    op.control("BCPBATCH", BcpControlValue::Int(100)).unwrap();

    let readings = [(1, Some(20.5)), (2, None), (3, Some(-4.25))];
    for (sensor, value) in readings {
        op.bind_column(&Value::Int(sensor), 0, -1, None, SQLINT4, 1).unwrap();
        let value = value.map_or(Value::Null, Value::Float);
        op.bind_column(&value, 8, -1, None, SQLFLTN, 2).unwrap();
        assert_eq!(op.send_row().unwrap(), 1);
    }
    assert_eq!(op.finish().unwrap(), 3);
    assert_eq!(op.state(), BcpState::Finished);

    let session = &mock.finished_bcp_sessions()[0];
    assert_eq!(session.table, "dbo.readings");
    assert_eq!(session.direction, DB_IN);
    assert_eq!(session.controls, vec![(BCPBATCH, MockControl::Int(100))]);
    assert_eq!(session.rows.len(), 3);
    assert_eq!(session.rows[1][1], (2, None));
    assert_eq!(session.rows[2][1], (2, Some((-4.25f64).to_ne_bytes().to_vec())));
}

#[test]
fn test_queryout_to_file_from_options() {
    let (mock, client) = mock_client(ConnectionOptions::default().bulk_copy(true));
    mock.set_bcp_exec_rows(7);
    let handle = client.connect(DSN).unwrap();
    let options = BcpOptions {
        direction: "queryout".to_string(),
        query: Some("SELECT id, name FROM dbo.customers".to_string()),
        data_file: Some("customers.dat".to_string()),
        bulk_mode: Some("native".to_string()),
        ..BcpOptions::default()
    };
    let op = handle.bulk_copy().unwrap();
    assert_eq!(op.run(&options).unwrap(), 7);

    let session = &mock.finished_bcp_sessions()[0];
    assert_eq!(session.table, "SELECT id, name FROM dbo.customers");
    assert_eq!(session.direction, DB_QUERYOUT);
    assert_eq!(session.data_file.as_deref(), Some("customers.dat"));
    assert_eq!(session.bulk_mode, Some((BCP_OUT_NATIVE_MODE, None, None)));
}

#[test]
fn test_operation_can_be_reinitialized_after_finish() {
    let (mock, client) = mock_client(ConnectionOptions::default().bulk_copy(true));
    let handle = client.connect(DSN).unwrap();
    let op = handle.open_bulk_copy("dbo.a", None, None, "in").unwrap();
    assert!(matches!(
        op.initialize("dbo.b", None, None, "in"),
        Err(DdbcError::State(_))
    ));
    op.finish().unwrap();
    op.initialize("dbo.b", Some("b.dat"), Some("b.err"), "out").unwrap();
    op.close().unwrap();
    assert_eq!(mock.finished_bcp_sessions().len(), 2);
    assert_eq!(mock.call_count(MockOp::BcpInit), 2);
}

#[test]
fn test_bulk_copy_enabled_on_demand() {
    let (mock, client) = mock_client(ConnectionOptions::default());
    let handle = client.connect(DSN).unwrap();
    {
        let op = handle.open_bulk_copy("dbo.t", None, None, "in").unwrap();
        assert_eq!(op.state(), BcpState::Initialized);
    }
    assert_eq!(mock.finished_bcp_sessions().len(), 1);
    assert_eq!(mock.live_handles(ddbc_engine::driver::HandleKind::Connection), 1);
}

#[test]
fn test_closed_handle_rejects_bulk_copy() {
    let (_mock, client) = mock_client(ConnectionOptions::default().bulk_copy(true));
    let mut handle = client.connect(DSN).unwrap();
    handle.close().unwrap();
    assert!(matches!(handle.bulk_copy(), Err(DdbcError::State(_))));
}
