//! Cursor execution through a client connection handle.
use chrono::NaiveDate;
use ddbc_engine::driver::mock::{MockOp, MockResult, MockResultSet};
use ddbc_engine::driver::sql::*;
use ddbc_engine::{ConnectionOptions, CursorState, DdbcError, Numeric, ParamInfo, Value};

mod helpers;
use helpers::mock_client;

const DSN: &str = "Server=db;Database=app";

#[test]
fn test_direct_execution_vs_prepared_execution() {
    let (mock, client) = mock_client(ConnectionOptions::default());
    let handle = client.connect(DSN).unwrap();
    let mut cursor = handle.cursor().unwrap();

    cursor.execute("SELECT 1", &[]).unwrap();
    assert_eq!(mock.call_count(MockOp::ExecDirect), 1);
    assert_eq!(mock.call_count(MockOp::Prepare), 0);

    cursor.execute("SELECT ?", &[Value::Int(1)]).unwrap();
    assert_eq!(mock.call_count(MockOp::Prepare), 1);
    assert_eq!(mock.call_count(MockOp::Execute), 1);
    assert!(cursor.is_prepared());

    let executed = mock.executed();
    assert!(!executed[0].prepared);
    assert!(executed[1].prepared);
    assert_eq!(executed[1].params, vec![Value::Int(1)]);
}

#[test]
fn test_direct_execute_after_prepared_sends_no_parameters() {
    let (mock, client) = mock_client(ConnectionOptions::default());
    let handle = client.connect(DSN).unwrap();
    let mut cursor = handle.cursor().unwrap();

    cursor.execute("SELECT ?", &[Value::from("first-value".repeat(100))]).unwrap();
    cursor.execute("SELECT 1", &[]).unwrap();

    let executed = mock.executed();
    assert_eq!(executed[0].params.len(), 1);
    assert!(!executed[1].prepared);
    assert!(executed[1].params.is_empty());
}

#[test]
fn test_executemany_stops_at_mismatched_row() {
    let (mock, client) = mock_client(ConnectionOptions::default());
    let handle = client.connect(DSN).unwrap();
    let mut cursor = handle.cursor().unwrap();
    mock.push_result(MockResult::rows_affected(1));

    let err = cursor
        .executemany(
            "INSERT INTO t (id) VALUES (?)",
            &[
                vec![Value::Int(1)],
                vec![Value::from("two")],
                vec![Value::Int(3)],
            ],
        )
        .unwrap_err();

    match err {
        DdbcError::TypeMismatch {
            param_index, row, ..
        } => {
            assert_eq!(param_index, 0);
            assert_eq!(row, Some(2));
        }
        other => panic!("expected type mismatch, got {other}"),
    }
    assert_eq!(cursor.rowcount(), 1);
    assert_eq!(mock.call_count(MockOp::Execute), 1);
}

#[test]
fn test_executemany_infers_types_past_leading_nulls() {
    let (mock, client) = mock_client(ConnectionOptions::default());
    let handle = client.connect(DSN).unwrap();
    let mut cursor = handle.cursor().unwrap();
    cursor
        .executemany(
            "INSERT INTO t (a, b) VALUES (?, ?)",
            &[
                vec![Value::Null, Value::from("x")],
                vec![Value::Float(2.5), Value::Null],
            ],
        )
        .unwrap();
    let executed = mock.executed();
    assert_eq!(executed.len(), 2);
    assert_eq!(executed[0].params, vec![Value::Null, Value::from("x")]);
    assert_eq!(executed[1].params, vec![Value::Float(2.5), Value::Null]);
    assert_eq!(cursor.state(), CursorState::NoResultSet);
}

#[test]
fn test_null_round_trip_for_every_type() {
    let (mock, client) = mock_client(ConnectionOptions::default());
    let handle = client.connect(DSN).unwrap();
    let mut cursor = handle.cursor().unwrap();

    let infos = [
        ParamInfo::new(SQL_C_CHAR, SQL_VARCHAR).size(10, 0),
        ParamInfo::new(SQL_C_WCHAR, SQL_WVARCHAR).size(10, 0),
        ParamInfo::new(SQL_C_BINARY, SQL_VARBINARY).size(10, 0),
        ParamInfo::new(SQL_C_BIT, SQL_BIT),
        ParamInfo::new(SQL_C_UTINYINT, SQL_TINYINT),
        ParamInfo::new(SQL_C_SSHORT, SQL_SMALLINT),
        ParamInfo::new(SQL_C_SLONG, SQL_INTEGER),
        ParamInfo::new(SQL_C_SBIGINT, SQL_BIGINT),
        ParamInfo::new(SQL_C_FLOAT, SQL_REAL),
        ParamInfo::new(SQL_C_DOUBLE, SQL_DOUBLE),
        ParamInfo::new(SQL_C_TYPE_DATE, SQL_TYPE_DATE),
        ParamInfo::new(SQL_C_TYPE_TIME, SQL_TYPE_TIME),
        ParamInfo::new(SQL_C_TYPE_TIMESTAMP, SQL_TYPE_TIMESTAMP).size(26, 6),
        ParamInfo::new(SQL_C_NUMERIC, SQL_NUMERIC).size(10, 2),
    ];
    let nulls = vec![Value::Null; infos.len()];
    let placeholders = vec!["?"; infos.len()].join(", ");
    cursor
        .execute_with_info(&format!("INSERT INTO t VALUES ({placeholders})"), &nulls, &infos)
        .unwrap();
    assert_eq!(mock.executed()[0].params, nulls);

    let sql_types = [
        SQL_CHAR,
        SQL_VARCHAR,
        SQL_WVARCHAR,
        SQL_BINARY,
        SQL_VARBINARY,
        SQL_BIT,
        SQL_TINYINT,
        SQL_SMALLINT,
        SQL_INTEGER,
        SQL_BIGINT,
        SQL_REAL,
        SQL_FLOAT,
        SQL_DOUBLE,
        SQL_TYPE_DATE,
        SQL_TYPE_TIME,
        SQL_TYPE_TIMESTAMP,
        SQL_DECIMAL,
        SQL_NUMERIC,
        SQL_GUID,
    ];
    let columns: Vec<(String, i16)> = sql_types
        .iter()
        .enumerate()
        .map(|(i, t)| (format!("c{i}"), *t))
        .collect();
    let column_refs: Vec<(&str, i16)> = columns.iter().map(|(n, t)| (n.as_str(), *t)).collect();
    mock.push_result(MockResult::query(
        MockResultSet::new(&column_refs).row(vec![Value::Null; sql_types.len()]),
    ));
    cursor.execute("SELECT * FROM t", &[]).unwrap();
    assert_eq!(cursor.fetchone().unwrap(), Some(vec![Value::Null; sql_types.len()]));
}

#[test]
fn test_typed_values_come_back_from_result_set() {
    let (mock, client) = mock_client(ConnectionOptions::default());
    let handle = client.connect(DSN).unwrap();
    let mut cursor = handle.cursor().unwrap();
    let day = NaiveDate::from_ymd_opt(2024, 2, 29).unwrap();
    let amount = Numeric::parse("1234.50").unwrap();
    mock.push_result(MockResult::query(
        MockResultSet::new(&[
            ("day", SQL_TYPE_DATE),
            ("amount", SQL_DECIMAL),
            ("flag", SQL_BIT),
            ("payload", SQL_VARBINARY),
        ])
        .row(vec![
            Value::Date(day),
            Value::Numeric(amount),
            Value::Bool(true),
            Value::Bytes(vec![0xde, 0xad]),
        ]),
    ));
    cursor.execute("SELECT day, amount, flag, payload FROM t", &[]).unwrap();
    let row = cursor.fetchone().unwrap().unwrap();
    assert_eq!(row[0], Value::Date(day));
    assert_eq!(row[1], Value::Numeric(amount));
    assert_eq!(row[2], Value::Bool(true));
    assert_eq!(row[3], Value::Bytes(vec![0xde, 0xad]));
}

#[test]
fn test_cursor_handles_are_released() {
    let (mock, client) = mock_client(ConnectionOptions::default());
    let mut handle = client.connect(DSN).unwrap();
    {
        let mut cursor = handle.cursor().unwrap();
        cursor.execute("SELECT 1", &[]).unwrap();
        assert_eq!(mock.live_handles(ddbc_engine::driver::HandleKind::Statement), 1);
        cursor.close().unwrap();
        cursor.close().unwrap();
        assert!(cursor.is_closed());
    }
    drop(handle.cursor().unwrap());
    handle.close().unwrap();
    assert_eq!(mock.live_handles(ddbc_engine::driver::HandleKind::Statement), 0);
    assert_eq!(mock.invalid_frees(), 0);
}
