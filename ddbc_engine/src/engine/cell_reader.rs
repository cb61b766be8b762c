use crate::driver::sql::*;
use crate::driver::{ReturnCode, SqlReturn};
use crate::engine::value::{date_from_sql, time_from_sql, timestamp_from_sql, Numeric, Value};
use crate::error::{DdbcError, ErrorInfo, Result};
use crate::handles::DriverHandle;

/// Buffer used for column types without a dedicated mapping, terminator included.
const FALLBACK_BUFFER_LEN: usize = 1024;
/// Chunk size used when the driver cannot report the total length up front.
const STREAM_CHUNK_LEN: usize = 4096;

/// Reads column `column` (1-based) of the current row, converting it
/// according to the column's declared SQL type.
pub fn read_cell(stmt: &DriverHandle, column: u16, sql_type: i16) -> Result<Value> {
    match sql_type {
        SQL_CHAR | SQL_VARCHAR | SQL_LONGVARCHAR => {
            Ok(read_variable(stmt, column, SQL_C_CHAR, 1)?.map_or(Value::Null, |b| Value::Text(narrow_text(&b))))
        }
        SQL_WCHAR | SQL_WVARCHAR | SQL_WLONGVARCHAR => {
            Ok(read_variable(stmt, column, SQL_C_WCHAR, 2)?.map_or(Value::Null, |b| Value::Text(wide_text(&b))))
        }
        SQL_BINARY | SQL_VARBINARY | SQL_LONGVARBINARY => {
            Ok(read_variable(stmt, column, SQL_C_BINARY, 0)?.map_or(Value::Null, Value::Bytes))
        }
        SQL_TINYINT => read_fixed::<1>(stmt, column, SQL_C_UTINYINT, |b| Ok(Value::Int(i64::from(b[0])))),
        SQL_SMALLINT => read_fixed::<2>(stmt, column, SQL_C_SSHORT, |b| {
            Ok(Value::Int(i64::from(i16::from_ne_bytes(b))))
        }),
        SQL_INTEGER => read_fixed::<4>(stmt, column, SQL_C_SLONG, |b| {
            Ok(Value::Int(i64::from(i32::from_ne_bytes(b))))
        }),
        SQL_BIGINT => read_fixed::<8>(stmt, column, SQL_C_SBIGINT, |b| Ok(Value::Int(i64::from_ne_bytes(b)))),
        SQL_REAL => read_fixed::<4>(stmt, column, SQL_C_FLOAT, |b| {
            Ok(Value::Float(f64::from(f32::from_ne_bytes(b))))
        }),
        SQL_FLOAT | SQL_DOUBLE => {
            read_fixed::<8>(stmt, column, SQL_C_DOUBLE, |b| Ok(Value::Float(f64::from_ne_bytes(b))))
        }
        SQL_BIT => read_fixed::<1>(stmt, column, SQL_C_BIT, |b| Ok(Value::Bool(b[0] != 0))),
        SQL_TYPE_DATE => read_fixed::<6>(stmt, column, SQL_C_TYPE_DATE, |b| {
            Date::from_bytes(&b)
                .as_ref()
                .and_then(date_from_sql)
                .map(Value::Date)
                .ok_or_else(|| invalid_value(column, "date"))
        }),
        SQL_TYPE_TIME | SQL_SS_TIME2 => read_fixed::<6>(stmt, column, SQL_C_TYPE_TIME, |b| {
            Time::from_bytes(&b)
                .as_ref()
                .and_then(time_from_sql)
                .map(Value::Time)
                .ok_or_else(|| invalid_value(column, "time"))
        }),
        SQL_TYPE_TIMESTAMP => read_fixed::<16>(stmt, column, SQL_C_TYPE_TIMESTAMP, |b| {
            Timestamp::from_bytes(&b)
                .as_ref()
                .and_then(timestamp_from_sql)
                .map(Value::Timestamp)
                .ok_or_else(|| invalid_value(column, "timestamp"))
        }),
        SQL_DECIMAL | SQL_NUMERIC => Ok(match read_fallback(stmt, column)? {
            Some(text) => match Numeric::parse(&text) {
                Ok(n) => Value::Numeric(n),
                Err(_) => Value::Text(text),
            },
            None => Value::Null,
        }),
        _ => Ok(read_fallback(stmt, column)?.map_or(Value::Null, Value::Text)),
    }
}

/// Reads every column of the current row. `types` holds the declared SQL
/// type of each column in order.
pub fn read_row(stmt: &DriverHandle, types: &[i16]) -> Result<Vec<Value>> {
    let mut row = Vec::with_capacity(types.len());
    for (index, sql_type) in types.iter().enumerate() {
        let column = u16::try_from(index + 1)
            .map_err(|_| DdbcError::InvalidArgument(format!("Column index out of range: {}", index + 1)))?;
        row.push(read_cell(stmt, column, *sql_type)?);
    }
    Ok(row)
}

fn get_data(
    stmt: &DriverHandle,
    column: u16,
    c_type: i16,
    target: &mut [u8],
    indicator: &mut isize,
) -> Result<SqlReturn> {
    let ret = stmt.api().get_data(stmt.raw(), column, c_type, target, indicator);
    if ret.is_no_data() {
        return Ok(ret);
    }
    stmt.check(ret, |info| DdbcError::Execution { info, row: None })?;
    Ok(ret)
}

fn read_fixed<const N: usize>(
    stmt: &DriverHandle,
    column: u16,
    c_type: i16,
    decode: impl FnOnce([u8; N]) -> Result<Value>,
) -> Result<Value> {
    let mut buf = [0u8; N];
    let mut indicator: isize = 0;
    let ret = get_data(stmt, column, c_type, &mut buf, &mut indicator)?;
    if ret.is_no_data() || indicator == SQL_NULL_DATA {
        return Ok(Value::Null);
    }
    decode(buf)
}

/// Queries the length of a variable-length cell, then reads it with a buffer
/// of that size. `None` means SQL NULL.
fn read_variable(stmt: &DriverHandle, column: u16, c_type: i16, nul_width: usize) -> Result<Option<Vec<u8>>> {
    let mut head = [0u8; 2];
    let mut indicator: isize = 0;
    let ret = get_data(stmt, column, c_type, &mut head[..nul_width], &mut indicator)?;
    if indicator == SQL_NULL_DATA {
        return Ok(None);
    }
    if ret.is_no_data() || indicator == 0 {
        return Ok(Some(Vec::new()));
    }
    let capacity = match usize::try_from(indicator) {
        Ok(len) => len,
        Err(_) => STREAM_CHUNK_LEN,
    };
    read_streamed(stmt, column, c_type, nul_width, capacity, Vec::new())
}

/// Reads a cell through a fixed char buffer, continuing with a larger read
/// when the first one was truncated.
fn read_fallback(stmt: &DriverHandle, column: u16) -> Result<Option<String>> {
    let mut buf = [0u8; FALLBACK_BUFFER_LEN];
    let mut indicator: isize = 0;
    let ret = get_data(stmt, column, SQL_C_CHAR, &mut buf, &mut indicator)?;
    if indicator == SQL_NULL_DATA {
        return Ok(None);
    }
    if ret.is_no_data() {
        return Ok(Some(String::new()));
    }
    let room = FALLBACK_BUFFER_LEN - 1;
    let written = written_len(indicator, room);
    let mut out = buf[..written].to_vec();
    if ret == SqlReturn::SUCCESS_WITH_INFO && written == room {
        let remaining = match usize::try_from(indicator) {
            Ok(total) if total > written => total - written,
            _ => STREAM_CHUNK_LEN,
        };
        out = match read_streamed(stmt, column, SQL_C_CHAR, 1, remaining, out)? {
            Some(all) => all,
            None => return Ok(None),
        };
    }
    Ok(Some(narrow_text(&out)))
}

/// Reads the rest of a cell into `out`, `capacity` data bytes at a time,
/// until the driver reports that nothing was truncated.
fn read_streamed(
    stmt: &DriverHandle,
    column: u16,
    c_type: i16,
    nul_width: usize,
    mut capacity: usize,
    mut out: Vec<u8>,
) -> Result<Option<Vec<u8>>> {
    loop {
        let mut buf = vec![0u8; capacity + nul_width];
        let mut indicator: isize = 0;
        let ret = get_data(stmt, column, c_type, &mut buf, &mut indicator)?;
        if ret.is_no_data() {
            break;
        }
        if indicator == SQL_NULL_DATA {
            return Ok(None);
        }
        let written = written_len(indicator, capacity);
        out.extend_from_slice(&buf[..written]);
        if ret == SqlReturn::SUCCESS {
            break;
        }
        capacity = match usize::try_from(indicator) {
            Ok(total) if total > written => total - written,
            _ => STREAM_CHUNK_LEN,
        };
    }
    Ok(Some(out))
}

/// Data bytes a read placed in a buffer with `room` bytes available before
/// the terminator.
fn written_len(indicator: isize, room: usize) -> usize {
    match usize::try_from(indicator) {
        Ok(len) => len.min(room),
        Err(_) => room,
    }
}

fn narrow_text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

fn wide_text(bytes: &[u8]) -> String {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_ne_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16_lossy(&units)
}

fn invalid_value(column: u16, kind: &str) -> DdbcError {
    DdbcError::Execution {
        info: ErrorInfo::message(format!("Column {column} holds an invalid {kind} value")),
        row: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::mock::{MockDriver, MockOp, MockResult, MockResultSet};
    use crate::driver::{DriverApi, HandleKind};
    use crate::engine::connection::{Connection, ConnectionOptions};
    use crate::engine::environment::DriverContext;
    use crate::observability::StructuredLogger;
    use chrono::{NaiveDate, NaiveTime};
    use std::sync::Arc;

    struct Fixture {
        mock: Arc<MockDriver>,
        _conn: Connection,
        stmt: Arc<DriverHandle>,
    }

    fn fetch_first(set: MockResultSet) -> Fixture {
        let mock = Arc::new(MockDriver::new());
        let ctx = DriverContext::new(mock.clone(), Arc::new(StructuredLogger::disabled()));
        let conn = Connection::open(ctx, "Server=mock", ConnectionOptions::default()).unwrap();
        let stmt = conn.alloc_statement_handle().unwrap();
        mock.push_result(MockResult::query(set));
        assert!(mock.exec_direct(stmt.raw(), "SELECT").succeeded());
        assert!(mock.fetch(stmt.raw()).succeeded());
        Fixture {
            mock,
            _conn: conn,
            stmt,
        }
    }

    #[test]
    fn test_reads_text_with_length_query_then_sized_read() {
        let f = fetch_first(
            MockResultSet::new(&[("a", SQL_VARCHAR), ("b", SQL_WVARCHAR)])
                .row(vec![Value::from("hello"), Value::from("grüße")]),
        );
        let row = read_row(&f.stmt, &[SQL_VARCHAR, SQL_WVARCHAR]).unwrap();
        assert_eq!(row, vec![Value::from("hello"), Value::from("grüße")]);
        assert_eq!(f.mock.call_count(MockOp::GetData), 4);
    }

    #[test]
    fn test_empty_text_skips_second_read() {
        let f = fetch_first(MockResultSet::new(&[("a", SQL_VARCHAR)]).row(vec![Value::from("")]));
        assert_eq!(read_cell(&f.stmt, 1, SQL_VARCHAR).unwrap(), Value::from(""));
        assert_eq!(f.mock.call_count(MockOp::GetData), 1);
    }

    #[test]
    fn test_null_indicator_yields_null_for_every_type() {
        let types = [
            SQL_VARCHAR,
            SQL_WVARCHAR,
            SQL_VARBINARY,
            SQL_TINYINT,
            SQL_SMALLINT,
            SQL_INTEGER,
            SQL_BIGINT,
            SQL_REAL,
            SQL_DOUBLE,
            SQL_BIT,
            SQL_TYPE_DATE,
            SQL_TYPE_TIME,
            SQL_TYPE_TIMESTAMP,
            SQL_NUMERIC,
            SQL_GUID,
        ];
        let columns: Vec<(&str, i16)> = types.iter().map(|t| ("c", *t)).collect();
        let f = fetch_first(MockResultSet::new(&columns).row(vec![Value::Null; types.len()]));
        let row = read_row(&f.stmt, &types).unwrap();
        assert!(row.iter().all(Value::is_null));
    }

    #[test]
    fn test_fixed_width_types() {
        let date = NaiveDate::from_ymd_opt(2024, 2, 29).unwrap();
        let time = NaiveTime::from_hms_opt(13, 45, 10).unwrap();
        let ts = date.and_hms_micro_opt(8, 30, 0, 123_456).unwrap();
        let f = fetch_first(
            MockResultSet::new(&[
                ("t", SQL_TINYINT),
                ("s", SQL_SMALLINT),
                ("i", SQL_INTEGER),
                ("b", SQL_BIGINT),
                ("r", SQL_REAL),
                ("d", SQL_DOUBLE),
                ("bit", SQL_BIT),
                ("date", SQL_TYPE_DATE),
                ("time", SQL_SS_TIME2),
                ("ts", SQL_TYPE_TIMESTAMP),
            ])
            .row(vec![
                Value::Int(200),
                Value::Int(-300),
                Value::Int(70_000),
                Value::Int(1 << 40),
                Value::Float(1.5),
                Value::Float(2.25),
                Value::Bool(true),
                Value::Date(date),
                Value::Time(time),
                Value::Timestamp(ts),
            ]),
        );
        let row = read_row(
            &f.stmt,
            &[
                SQL_TINYINT,
                SQL_SMALLINT,
                SQL_INTEGER,
                SQL_BIGINT,
                SQL_REAL,
                SQL_DOUBLE,
                SQL_BIT,
                SQL_TYPE_DATE,
                SQL_SS_TIME2,
                SQL_TYPE_TIMESTAMP,
            ],
        )
        .unwrap();
        assert_eq!(
            row,
            vec![
                Value::Int(200),
                Value::Int(-300),
                Value::Int(70_000),
                Value::Int(1 << 40),
                Value::Float(1.5),
                Value::Float(2.25),
                Value::Bool(true),
                Value::Date(date),
                Value::Time(time),
                Value::Timestamp(ts),
            ]
        );
    }

    #[test]
    fn test_binary_and_long_fallback() {
        let long = "x".repeat(FALLBACK_BUFFER_LEN * 2 + 17);
        let f = fetch_first(
            MockResultSet::new(&[("bin", SQL_VARBINARY), ("xml", -152)])
                .row(vec![Value::Bytes(vec![0, 1, 2, 255]), Value::from(long.as_str())]),
        );
        assert_eq!(read_cell(&f.stmt, 1, SQL_VARBINARY).unwrap(), Value::Bytes(vec![0, 1, 2, 255]));
        assert_eq!(read_cell(&f.stmt, 2, -152).unwrap(), Value::Text(long));
    }

    #[test]
    fn test_numeric_reads_through_char_fallback() {
        let n = Numeric::parse("-1234.5600").unwrap();
        let f = fetch_first(MockResultSet::new(&[("n", SQL_NUMERIC)]).row(vec![Value::Numeric(n)]));
        assert_eq!(read_cell(&f.stmt, 1, SQL_NUMERIC).unwrap(), Value::Numeric(n));
    }

    #[test]
    fn test_driver_failure_surfaces_diagnostics() {
        let f = fetch_first(MockResultSet::new(&[("i", SQL_INTEGER)]).row(vec![Value::Int(1)]));
        f.mock.fail_next(MockOp::GetData, "HY000", "read failed");
        let err = read_cell(&f.stmt, 1, SQL_INTEGER).unwrap_err();
        assert!(matches!(err, DdbcError::Execution { .. }));
        assert_eq!(err.sql_state(), "HY000");
        assert_eq!(f.stmt.kind(), HandleKind::Statement);
    }
}
