//! Statement execution and result iteration over one statement handle.

use super::cell_reader::read_row;
use super::connection::Connection;
use super::params::{ParamBufferSet, ParamInfo};
use super::value::Value;
use crate::driver::sql::SQL_NULLABLE;
use crate::driver::{ColumnAttributes, HandleKind, ReturnCode, SqlReturn};
use crate::error::{DdbcError, ErrorInfo, Result};
use crate::handles::DriverHandle;
use crate::observability::StructuredLogger;
use log::Level;
use std::sync::Arc;

/// Lifecycle of a cursor. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorState {
    /// Nothing prepared or executed since creation or `reset`.
    Open,
    Prepared,
    /// The statement ran but its result shape has not been read yet.
    Executed,
    ResultSetAvailable,
    NoResultSet,
    Closed,
}

/// Metadata of one result column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDescription {
    pub name: String,
    pub type_code: i16,
    pub display_size: usize,
    pub internal_size: usize,
    pub precision: usize,
    pub scale: i16,
    pub null_ok: bool,
}

impl ColumnDescription {
    fn from_attributes(attrs: ColumnAttributes) -> Self {
        Self {
            name: attrs.name,
            type_code: attrs.data_type,
            display_size: attrs.column_size,
            internal_size: attrs.column_size,
            precision: attrs.column_size,
            scale: attrs.decimal_digits,
            null_ok: attrs.nullable == SQL_NULLABLE,
        }
    }

    /// `(name, type_code, display_size, internal_size, precision, scale, null_ok)`
    pub fn as_tuple(&self) -> (&str, i16, usize, usize, usize, i16, bool) {
        (
            &self.name,
            self.type_code,
            self.display_size,
            self.internal_size,
            self.precision,
            self.scale,
            self.null_ok,
        )
    }
}

fn execution(info: ErrorInfo) -> DdbcError {
    DdbcError::Execution { info, row: None }
}

/// A prepared or directly executed statement plus its result iteration
/// state. Only one cursor should be active on a connection at a time.
pub struct Cursor {
    dbc: Arc<DriverHandle>,
    logger: Arc<StructuredLogger>,
    stmt: Option<Arc<DriverHandle>>,
    state: CursorState,
    rowcount: isize,
    description: Vec<ColumnDescription>,
    arraysize: usize,
    output_size: Option<(usize, Option<usize>)>,
    last_statement: Option<String>,
    prepared: bool,
}

impl Cursor {
    /// Allocates a statement handle on `conn`. `arraysize` is the batch size
    /// `fetchmany` uses when no size is given.
    pub fn new(conn: &Connection, arraysize: usize) -> Result<Self> {
        let dbc = conn.handle().map_err(|_| DdbcError::Allocation {
            kind: HandleKind::Statement,
            info: ErrorInfo::new("08003", "Connection is not open"),
        })?;
        let stmt = conn.alloc_statement_handle()?;
        Ok(Self {
            logger: dbc.logger().clone(),
            dbc,
            stmt: Some(stmt),
            state: CursorState::Open,
            rowcount: -1,
            description: Vec::new(),
            arraysize: arraysize.max(1),
            output_size: None,
            last_statement: None,
            prepared: false,
        })
    }

    fn statement(&self) -> Result<Arc<DriverHandle>> {
        match (&self.stmt, self.state) {
            (_, CursorState::Closed) | (None, _) => Err(DdbcError::State(
                "Operation cannot be performed: the cursor is closed.".to_string(),
            )),
            (Some(stmt), _) => Ok(stmt.clone()),
        }
    }

    /// Executes `sql` with one descriptor inferred per parameter value.
    pub fn execute(&mut self, sql: &str, params: &[Value]) -> Result<()> {
        let infos: Vec<ParamInfo> = params.iter().map(ParamInfo::infer).collect();
        self.execute_with_info(sql, params, &infos)
    }

    /// Executes `sql`. Without parameters the statement is run directly;
    /// otherwise it is prepared, bound and then executed.
    pub fn execute_with_info(&mut self, sql: &str, params: &[Value], infos: &[ParamInfo]) -> Result<()> {
        let stmt = self.statement()?;
        let buffers = if params.is_empty() && infos.is_empty() {
            None
        } else {
            Some(ParamBufferSet::build(params, infos)?)
        };

        self.close_results(&stmt)?;
        self.logger.log_query(Level::Debug, sql, params.len());
        let api = stmt.api().clone();

        match buffers {
            None => {
                let ret = api.exec_direct(stmt.raw(), sql);
                self.last_statement = Some(sql.to_string());
                self.prepared = false;
                check_exec(&stmt, ret)?;
            }
            Some(mut buffers) => {
                self.prepare(&stmt, sql)?;
                let executed = buffers
                    .bind(&stmt)
                    .and_then(|()| check_exec(&stmt, api.execute(stmt.raw())));
                let unbound = buffers.unbind(&stmt);
                executed?;
                unbound?;
            }
        }

        self.state = CursorState::Executed;
        self.rowcount = read_row_count(&stmt)?;
        self.describe(&stmt)
    }

    /// Runs `sql` once per row, with descriptors inferred per column from the
    /// first non-null value.
    pub fn executemany(&mut self, sql: &str, rows: &[Vec<Value>]) -> Result<()> {
        let infos = ParamInfo::infer_columns(rows);
        self.executemany_with_info(sql, rows, &infos)
    }

    /// Prepares `sql` once and executes it for every row. The row count is
    /// the sum of the counts the driver reported as valid; it stays `-1` when
    /// no row reported one. The first failing row aborts the batch with an
    /// error tagged with its 1-based row number, leaving the count of the rows
    /// before it.
    pub fn executemany_with_info(
        &mut self,
        sql: &str,
        rows: &[Vec<Value>],
        infos: &[ParamInfo],
    ) -> Result<()> {
        let stmt = self.statement()?;
        self.close_results(&stmt)?;
        if rows.is_empty() {
            return Ok(());
        }
        self.logger.log_query(Level::Debug, sql, infos.len());
        self.prepare(&stmt, sql)?;

        let api = stmt.api().clone();
        for (index, row) in rows.iter().enumerate() {
            let outcome = ParamBufferSet::build(row, infos).and_then(|mut buffers| {
                let executed = buffers.bind(&stmt).and_then(|()| {
                    check_exec(&stmt, api.execute(stmt.raw()))?;
                    read_row_count(&stmt)
                });
                let unbound = buffers.unbind(&stmt);
                let count = executed?;
                unbound?;
                stmt.check(api.free_stmt_close(stmt.raw()), execution)?;
                Ok(count)
            });
            let count = match outcome {
                Ok(count) => count,
                Err(e) => {
                    self.state = CursorState::Executed;
                    crate::ddbc_log!(self.logger, Level::Warn, "executemany stopped at row {}: {}", index + 1, e);
                    return Err(e.at_row(index + 1));
                }
            };
            if count >= 0 {
                self.rowcount = if self.rowcount < 0 { count } else { self.rowcount + count };
            }
        }
        self.state = CursorState::NoResultSet;
        Ok(())
    }

    fn prepare(&mut self, stmt: &DriverHandle, sql: &str) -> Result<()> {
        let ret = stmt.api().prepare(stmt.raw(), sql);
        stmt.check(ret, execution)?;
        self.state = CursorState::Prepared;
        self.prepared = true;
        self.last_statement = Some(sql.to_string());
        Ok(())
    }

    /// Discards pending results of the previous execution and clears the
    /// per-execution state.
    fn close_results(&mut self, stmt: &DriverHandle) -> Result<()> {
        if matches!(
            self.state,
            CursorState::Executed | CursorState::ResultSetAvailable | CursorState::NoResultSet
        ) {
            stmt.check(stmt.api().free_stmt_close(stmt.raw()), execution)?;
        }
        self.rowcount = -1;
        self.description.clear();
        self.state = CursorState::Open;
        Ok(())
    }

    fn describe(&mut self, stmt: &DriverHandle) -> Result<()> {
        let api = stmt.api();
        let mut count: i16 = 0;
        stmt.check(api.num_result_cols(stmt.raw(), &mut count), execution)?;
        let mut description = Vec::with_capacity(usize::try_from(count).unwrap_or(0));
        for column in 1..=count.max(0) as u16 {
            let mut attrs = ColumnAttributes::default();
            stmt.check(api.describe_col(stmt.raw(), column, &mut attrs), execution)?;
            description.push(ColumnDescription::from_attributes(attrs));
        }
        self.state = if description.is_empty() {
            CursorState::NoResultSet
        } else {
            CursorState::ResultSetAvailable
        };
        self.description = description;
        Ok(())
    }

    /// Next row of the current result set, or `None` once it is exhausted or
    /// when the statement produced no result set.
    pub fn fetchone(&mut self) -> Result<Option<Vec<Value>>> {
        let stmt = self.statement()?;
        if self.state != CursorState::ResultSetAvailable || self.description.is_empty() {
            return Ok(None);
        }
        let ret = stmt.api().fetch(stmt.raw());
        if ret.is_no_data() {
            return Ok(None);
        }
        stmt.check(ret, execution)?;
        let types: Vec<i16> = self.description.iter().map(|c| c.type_code).collect();
        read_row(&stmt, &types).map(Some)
    }

    /// Up to `size` rows; `size <= 0` fetches `arraysize` rows.
    pub fn fetchmany(&mut self, size: isize) -> Result<Vec<Vec<Value>>> {
        let limit = usize::try_from(size).ok().filter(|n| *n > 0).unwrap_or(self.arraysize);
        let mut rows = Vec::with_capacity(limit.min(1024));
        while rows.len() < limit {
            match self.fetchone()? {
                Some(row) => rows.push(row),
                None => break,
            }
        }
        Ok(rows)
    }

    pub fn fetchall(&mut self) -> Result<Vec<Vec<Value>>> {
        let mut rows = Vec::new();
        while let Some(row) = self.fetchone()? {
            rows.push(row);
        }
        Ok(rows)
    }

    /// Moves to the next result set. Returns `false` after the last one.
    pub fn nextset(&mut self) -> Result<bool> {
        let stmt = self.statement()?;
        if matches!(self.state, CursorState::Open | CursorState::Prepared) {
            return Ok(false);
        }
        let ret = stmt.api().more_results(stmt.raw());
        if ret.is_no_data() {
            self.description.clear();
            self.state = CursorState::NoResultSet;
            return Ok(false);
        }
        stmt.check(ret, execution)?;
        self.rowcount = read_row_count(&stmt)?;
        self.describe(&stmt)?;
        Ok(true)
    }

    /// Replaces the statement handle with a fresh one and clears all
    /// execution state, so the cursor can run an unrelated statement.
    pub fn reset(&mut self) -> Result<()> {
        if self.state == CursorState::Closed {
            return Ok(());
        }
        if let Some(old) = self.stmt.take() {
            old.release();
        }
        let stmt = DriverHandle::allocate(
            self.dbc.api().clone(),
            self.logger.clone(),
            HandleKind::Statement,
            Some(self.dbc.clone()),
        )?;
        self.stmt = Some(stmt);
        self.state = CursorState::Open;
        self.rowcount = -1;
        self.description.clear();
        self.last_statement = None;
        self.prepared = false;
        Ok(())
    }

    /// Frees the statement handle. Closing twice is a no-op.
    pub fn close(&mut self) -> Result<()> {
        if self.state == CursorState::Closed {
            return Ok(());
        }
        self.state = CursorState::Closed;
        self.description.clear();
        match self.stmt.take() {
            Some(stmt) => stmt.close(),
            None => Ok(()),
        }
    }

    pub fn description(&self) -> &[ColumnDescription] {
        &self.description
    }

    /// Rows affected by the last execution, `-1` when unknown.
    pub fn rowcount(&self) -> isize {
        self.rowcount
    }

    pub fn arraysize(&self) -> usize {
        self.arraysize
    }

    pub fn set_arraysize(&mut self, size: usize) -> Result<()> {
        if size == 0 {
            return Err(DdbcError::InvalidArgument(
                "arraysize must be greater than zero".to_string(),
            ));
        }
        self.arraysize = size;
        Ok(())
    }

    /// Accepted for DB-API compatibility; descriptors are taken from the
    /// values or from `execute_with_info`.
    pub fn setinputsizes(&mut self, sizes: &[ParamInfo]) {
        crate::ddbc_log!(self.logger, Level::Trace, "setinputsizes ignored ({} sizes)", sizes.len());
    }

    pub fn setoutputsize(&mut self, size: usize, column: Option<usize>) {
        self.output_size = Some((size, column));
    }

    pub fn output_size(&self) -> Option<(usize, Option<usize>)> {
        self.output_size
    }

    pub fn state(&self) -> CursorState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == CursorState::Closed
    }

    pub fn last_statement(&self) -> Option<&str> {
        self.last_statement.as_deref()
    }

    pub fn is_prepared(&self) -> bool {
        self.prepared
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        if let Some(stmt) = self.stmt.take() {
            stmt.release();
        }
    }
}

/// `SQL_NO_DATA` from an execute means the statement touched no rows.
fn check_exec(stmt: &DriverHandle, ret: SqlReturn) -> Result<()> {
    if ret.is_no_data() {
        return Ok(());
    }
    stmt.check(ret, execution)
}

fn read_row_count(stmt: &DriverHandle) -> Result<isize> {
    let mut count: isize = -1;
    stmt.check(stmt.api().row_count(stmt.raw(), &mut count), execution)?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::mock::{MockDriver, MockOp, MockResult, MockResultSet};
    use crate::driver::sql::*;
    use crate::engine::connection::ConnectionOptions;
    use crate::engine::environment::DriverContext;

    fn setup() -> (Arc<MockDriver>, Connection) {
        let mock = Arc::new(MockDriver::new());
        let ctx = DriverContext::new(mock.clone(), Arc::new(StructuredLogger::disabled()));
        let conn = Connection::open(ctx, "Server=mock", ConnectionOptions::default()).unwrap();
        (mock, conn)
    }

    #[test]
    fn test_execute_without_params_skips_prepare() {
        let (mock, conn) = setup();
        let mut cursor = Cursor::new(&conn, 1).unwrap();
        mock.push_result(MockResult::rows_affected(3));
        cursor.execute("DELETE FROM t", &[]).unwrap();
        assert_eq!(mock.call_count(MockOp::Prepare), 0);
        assert_eq!(mock.call_count(MockOp::ExecDirect), 1);
        assert_eq!(cursor.rowcount(), 3);
        assert_eq!(cursor.state(), CursorState::NoResultSet);
        assert!(!cursor.is_prepared());
    }

    #[test]
    fn test_execute_with_params_prepares_first() {
        let (mock, conn) = setup();
        let mut cursor = Cursor::new(&conn, 1).unwrap();
        mock.push_result(MockResult::rows_affected(1));
        cursor
            .execute("UPDATE t SET a = ? WHERE id = ?", &[Value::from("x"), Value::Int(7)])
            .unwrap();
        let calls = mock.calls();
        let prepare = calls.iter().position(|c| *c == MockOp::Prepare).unwrap();
        let execute = calls.iter().position(|c| *c == MockOp::Execute).unwrap();
        assert!(prepare < execute);
        assert_eq!(mock.executed()[0].params, vec![Value::from("x"), Value::Int(7)]);
        assert_eq!(cursor.last_statement(), Some("UPDATE t SET a = ? WHERE id = ?"));
    }

    #[test]
    fn test_execute_leaves_no_parameters_bound() {
        let (mock, conn) = setup();
        let mut cursor = Cursor::new(&conn, 1).unwrap();
        cursor.execute("UPDATE t SET a = ?", &[Value::Int(7)]).unwrap();
        cursor.execute("SELECT 1", &[]).unwrap();
        let executed = mock.executed();
        assert_eq!(executed[0].params, vec![Value::Int(7)]);
        assert!(executed[1].params.is_empty());
        assert_eq!(mock.call_count(MockOp::ResetParams), 2);
    }

    #[test]
    fn test_failed_execute_leaves_no_parameters_bound() {
        let (mock, conn) = setup();
        let mut cursor = Cursor::new(&conn, 1).unwrap();
        mock.fail_next(MockOp::Execute, "23000", "Violation of PRIMARY KEY constraint");
        let err = cursor.execute("INSERT INTO t VALUES (?)", &[Value::Int(1)]).unwrap_err();
        assert_eq!(err.sql_state(), "23000");
        cursor.execute("SELECT 1", &[]).unwrap();
        assert!(mock.executed().last().unwrap().params.is_empty());
    }

    #[test]
    fn test_fetch_and_description() {
        let (mock, conn) = setup();
        let mut cursor = Cursor::new(&conn, 2).unwrap();
        mock.push_result(MockResult::query(
            MockResultSet::new(&[("id", SQL_INTEGER), ("name", SQL_WVARCHAR)])
                .row(vec![Value::Int(1), Value::from("a")])
                .row(vec![Value::Int(2), Value::from("b")])
                .row(vec![Value::Int(3), Value::Null]),
        ));
        cursor.execute("SELECT id, name FROM t", &[]).unwrap();
        assert_eq!(cursor.state(), CursorState::ResultSetAvailable);
        assert_eq!(
            cursor.description()[0].as_tuple(),
            ("id", SQL_INTEGER, 255, 255, 255, 0, true)
        );

        assert_eq!(cursor.fetchone().unwrap(), Some(vec![Value::Int(1), Value::from("a")]));
        assert_eq!(cursor.fetchmany(0).unwrap().len(), 2);
        assert_eq!(cursor.fetchone().unwrap(), None);
        assert!(cursor.fetchall().unwrap().is_empty());
    }

    #[test]
    fn test_nextset_rederives_description() {
        let (mock, conn) = setup();
        let mut cursor = Cursor::new(&conn, 1).unwrap();
        mock.push_result(MockResult::multi(vec![
            MockResultSet::new(&[("a", SQL_INTEGER)]).row(vec![Value::Int(1)]),
            MockResultSet::new(&[("b", SQL_VARCHAR), ("c", SQL_BIT)]).row(vec![Value::from("x"), Value::Bool(false)]),
        ]));
        cursor.execute("SELECT 1; SELECT 'x', 0", &[]).unwrap();
        assert_eq!(cursor.fetchall().unwrap(), vec![vec![Value::Int(1)]]);
        assert!(cursor.nextset().unwrap());
        assert_eq!(cursor.description().len(), 2);
        assert_eq!(cursor.fetchone().unwrap(), Some(vec![Value::from("x"), Value::Bool(false)]));
        assert!(!cursor.nextset().unwrap());
        assert!(cursor.description().is_empty());
    }

    #[test]
    fn test_executemany_sums_valid_counts() {
        let (mock, conn) = setup();
        let mut cursor = Cursor::new(&conn, 1).unwrap();
        mock.push_result(MockResult::rows_affected(1));
        mock.push_result(MockResult::rows_affected(-1));
        mock.push_result(MockResult::rows_affected(2));
        cursor
            .executemany(
                "INSERT INTO t VALUES (?)",
                &[vec![Value::Int(1)], vec![Value::Int(2)], vec![Value::Int(3)]],
            )
            .unwrap();
        assert_eq!(cursor.rowcount(), 3);
        assert_eq!(mock.call_count(MockOp::Prepare), 1);
        assert_eq!(mock.call_count(MockOp::Execute), 3);
    }

    #[test]
    fn test_executemany_all_invalid_counts_stays_unknown() {
        let (_mock, conn) = setup();
        let mut cursor = Cursor::new(&conn, 1).unwrap();
        cursor
            .executemany("EXEC p ?", &[vec![Value::Int(1)], vec![Value::Int(2)]])
            .unwrap();
        assert_eq!(cursor.rowcount(), -1);
    }

    #[test]
    fn test_executemany_abort_leaves_no_parameters_bound() {
        let (mock, conn) = setup();
        let mut cursor = Cursor::new(&conn, 1).unwrap();
        mock.fail_after(MockOp::Execute, 1, "22003", "Arithmetic overflow");
        let err = cursor
            .executemany("INSERT INTO t VALUES (?)", &[vec![Value::Int(1)], vec![Value::Int(2)]])
            .unwrap_err();
        assert_eq!(err.sql_state(), "22003");
        cursor.execute("SELECT 1", &[]).unwrap();
        assert!(mock.executed().last().unwrap().params.is_empty());
    }

    #[test]
    fn test_executemany_without_rows_discards_previous_results() {
        let (mock, conn) = setup();
        let mut cursor = Cursor::new(&conn, 1).unwrap();
        mock.push_result(MockResult::query(
            MockResultSet::new(&[("id", SQL_INTEGER)]).row(vec![Value::Int(1)]),
        ));
        cursor.execute("SELECT id FROM t", &[]).unwrap();
        mock.clear_calls();
        cursor.executemany("INSERT INTO t VALUES (?)", &[]).unwrap();
        assert_eq!(mock.call_count(MockOp::CloseCursor), 1);
        assert_eq!(mock.call_count(MockOp::Prepare), 0);
        assert_eq!(cursor.state(), CursorState::Open);
        assert_eq!(cursor.rowcount(), -1);
        assert!(cursor.description().is_empty());
        assert_eq!(cursor.fetchone().unwrap(), None);
    }

    #[test]
    fn test_type_mismatch_detected_before_driver_call() {
        let (mock, conn) = setup();
        let mut cursor = Cursor::new(&conn, 1).unwrap();
        mock.clear_calls();
        let err = cursor
            .execute_with_info(
                "SELECT ?",
                &[Value::from("text")],
                &[ParamInfo::new(SQL_C_SLONG, SQL_INTEGER)],
            )
            .unwrap_err();
        assert!(matches!(err, DdbcError::TypeMismatch { param_index: 0, .. }));
        assert!(mock.calls().is_empty());

        let err = cursor.execute_with_info("SELECT ?", &[Value::Int(1)], &[]).unwrap_err();
        assert!(matches!(err, DdbcError::InvalidArgument(_)));
    }

    #[test]
    fn test_execute_failure_carries_diagnostics() {
        let (mock, conn) = setup();
        let mut cursor = Cursor::new(&conn, 1).unwrap();
        mock.fail_next(MockOp::ExecDirect, "42S02", "Invalid object name 'missing'");
        let err = cursor.execute("SELECT * FROM missing", &[]).unwrap_err();
        assert_eq!(err.sql_state(), "42S02");
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn test_no_data_from_execute_is_success() {
        let (mock, conn) = setup();
        let mut cursor = Cursor::new(&conn, 1).unwrap();
        mock.push_result(MockResult::rows_affected(0));
        cursor.execute("DELETE FROM t WHERE 1 = 0", &[]).unwrap();
        assert_eq!(cursor.rowcount(), 0);
    }

    #[test]
    fn test_reset_reallocates_statement() {
        let (mock, conn) = setup();
        let mut cursor = Cursor::new(&conn, 1).unwrap();
        cursor.execute("SELECT 1", &[]).unwrap();
        cursor.reset().unwrap();
        assert_eq!(cursor.state(), CursorState::Open);
        assert_eq!(cursor.rowcount(), -1);
        assert!(cursor.last_statement().is_none());
        assert_eq!(mock.freed_handles(HandleKind::Statement), 1);
        assert_eq!(mock.live_handles(HandleKind::Statement), 1);
    }

    #[test]
    fn test_closed_cursor_rejects_operations() {
        let (mock, conn) = setup();
        let mut cursor = Cursor::new(&conn, 1).unwrap();
        cursor.close().unwrap();
        cursor.close().unwrap();
        assert!(cursor.is_closed());
        assert!(matches!(cursor.execute("SELECT 1", &[]), Err(DdbcError::State(_))));
        assert!(matches!(cursor.fetchone(), Err(DdbcError::State(_))));
        assert_eq!(mock.live_handles(HandleKind::Statement), 0);
        assert_eq!(mock.invalid_frees(), 0);
    }

    #[test]
    fn test_arraysize_and_output_size() {
        let (_mock, conn) = setup();
        let mut cursor = Cursor::new(&conn, 5).unwrap();
        assert_eq!(cursor.arraysize(), 5);
        assert!(cursor.set_arraysize(0).is_err());
        cursor.set_arraysize(3).unwrap();
        cursor.setinputsizes(&[ParamInfo::new(SQL_C_SLONG, SQL_INTEGER)]);
        cursor.setoutputsize(100, Some(2));
        assert_eq!(cursor.output_size(), Some((100, Some(2))));
    }
}
