//! In-process driver with scripted results and failure injection.
//!
//! `MockDriver` behaves like an ODBC driver from the engine's point of view:
//! handles are allocated and freed, bound parameter buffers are read when the
//! statement executes, `get_data` supports length queries and partial reads, and
//! bulk-copy bindings are read at `bcp_send_row` time. Every call is recorded
//! in a journal so tests can assert on call order.

use super::sql::Numeric as SqlNumeric;
use super::sql::*;
use super::{
    BcpBinding, BcpControlValue, ColumnAttributes, ColumnFormat, DriverApi, HandleKind,
    ParameterBinding, RawHandle, SqlReturn,
};
use crate::engine::value::{
    date_from_sql, date_to_sql, time_from_sql, time_to_sql, timestamp_from_sql,
    timestamp_to_sql, Numeric, Value,
};
use crate::error::DiagnosticRecord;
use std::collections::{HashMap, VecDeque};
use std::ffi::c_void;
use std::sync::{Mutex, MutexGuard};

/// Driver entry point, as recorded in the call journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    AllocHandle,
    FreeHandle,
    SetEnvAttr,
    SetConnectAttr,
    GetConnectAttr,
    Connect,
    Disconnect,
    EndTran,
    ExecDirect,
    Prepare,
    Execute,
    CloseCursor,
    ResetParams,
    BindParameter,
    GetAppParamDesc,
    SetDescField,
    RowCount,
    NumResultCols,
    DescribeCol,
    Fetch,
    GetData,
    MoreResults,
    BcpInit,
    BcpControl,
    BcpSetBulkMode,
    BcpReadFmt,
    BcpColumns,
    BcpColFmt,
    BcpBind,
    BcpSendRow,
    BcpExec,
    BcpDone,
}

/// One scripted result set.
#[derive(Debug, Clone, Default)]
pub struct MockResultSet {
    pub columns: Vec<ColumnAttributes>,
    pub rows: Vec<Vec<Value>>,
}

impl MockResultSet {
    /// Columns are given as `(name, sql_type)`; size 255, no decimal digits,
    /// nullable.
    pub fn new(columns: &[(&str, i16)]) -> Self {
        Self {
            columns: columns
                .iter()
                .map(|(name, data_type)| mock_column(name, *data_type, 255, 0, true))
                .collect(),
            rows: Vec::new(),
        }
    }

    pub fn with_columns(columns: Vec<ColumnAttributes>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn row(mut self, values: Vec<Value>) -> Self {
        self.rows.push(values);
        self
    }
}

pub fn mock_column(
    name: &str,
    data_type: i16,
    column_size: usize,
    decimal_digits: i16,
    nullable: bool,
) -> ColumnAttributes {
    ColumnAttributes {
        name: name.to_string(),
        data_type,
        column_size,
        decimal_digits,
        nullable: if nullable { SQL_NULLABLE } else { SQL_NO_NULLS },
    }
}

/// Outcome of one `execute`/`exec_direct`.
#[derive(Debug, Clone)]
pub struct MockResult {
    pub row_count: isize,
    pub result_sets: Vec<MockResultSet>,
}

impl MockResult {
    pub fn rows_affected(count: isize) -> Self {
        Self {
            row_count: count,
            result_sets: Vec::new(),
        }
    }

    pub fn query(set: MockResultSet) -> Self {
        Self {
            row_count: -1,
            result_sets: vec![set],
        }
    }

    pub fn multi(sets: Vec<MockResultSet>) -> Self {
        Self {
            row_count: -1,
            result_sets: sets,
        }
    }
}

/// A statement the driver executed, with parameter values decoded from the
/// bound buffers at execute time.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutedStatement {
    pub sql: String,
    pub prepared: bool,
    pub params: Vec<Value>,
}

/// State of one bulk-copy session on a connection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MockBcpSession {
    pub table: String,
    pub data_file: Option<String>,
    pub error_file: Option<String>,
    pub direction: i32,
    pub controls: Vec<(i32, MockControl)>,
    pub bulk_mode: Option<(i32, Option<Vec<u8>>, Option<Vec<u8>>)>,
    pub format_file: Option<String>,
    pub columns: Option<i32>,
    pub column_formats: Vec<MockColumnFormat>,
    /// Rows as sent, each cell keyed by server column; `None` is NULL.
    pub rows: Vec<Vec<(i32, Option<Vec<u8>>)>>,
    pub done: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MockControl {
    Int(i64),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockColumnFormat {
    pub file_column: i32,
    pub user_data_type: i32,
    pub indicator_length: i32,
    pub user_data_length: i32,
    pub terminator: Option<Vec<u8>>,
    pub server_column: i32,
}

struct Failure {
    skip: usize,
    record: DiagnosticRecord,
}

#[derive(Default)]
struct ConnState {
    connected: bool,
    connection_string: String,
    attrs: HashMap<i32, usize>,
    bcp: Option<MockBcpSession>,
    bcp_bindings: HashMap<i32, BcpBinding>,
}

#[derive(Default)]
struct StmtState {
    prepared_sql: Option<String>,
    bindings: HashMap<u16, ParameterBinding>,
    sets: VecDeque<MockResultSet>,
    current: Option<MockResultSet>,
    row: Option<usize>,
    read_offsets: HashMap<u16, usize>,
    row_count: isize,
}

#[derive(Default)]
struct MockState {
    next_handle: usize,
    live: HashMap<usize, HandleKind>,
    freed: Vec<(HandleKind, usize)>,
    invalid_frees: usize,
    conns: HashMap<usize, ConnState>,
    stmts: HashMap<usize, StmtState>,
    descs: HashMap<usize, usize>,
    diags: HashMap<usize, Vec<DiagnosticRecord>>,
    journal: Vec<MockOp>,
    failures: HashMap<MockOp, VecDeque<Failure>>,
    results: VecDeque<MockResult>,
    executed: Vec<ExecutedStatement>,
    desc_fields: Vec<(i16, i16, usize)>,
    finished_bcp: Vec<MockBcpSession>,
    connect_count: usize,
    disconnect_count: usize,
    reject_reset: bool,
    refuse_bcp_mode: bool,
    bcp_exec_rows: i32,
}

// SAFETY: the raw pointers held in recorded bindings are only dereferenced
// while the state lock is held, under the bind contracts of `DriverApi`.
unsafe impl Send for MockState {}

/// Scriptable in-process driver.
#[derive(Default)]
pub struct MockDriver {
    state: Mutex<MockState>,
}

impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queues the result of the next execution.
    pub fn push_result(&self, result: MockResult) {
        self.state().results.push_back(result);
    }

    /// Makes the next call of `op` fail with the given diagnostic.
    pub fn fail_next(&self, op: MockOp, sql_state: &str, message: &str) {
        self.fail_after(op, 0, sql_state, message);
    }

    /// Lets `successes` calls of `op` through, then fails the following one.
    pub fn fail_after(&self, op: MockOp, successes: usize, sql_state: &str, message: &str) {
        self.state()
            .failures
            .entry(op)
            .or_default()
            .push_back(Failure {
                skip: successes,
                record: DiagnosticRecord {
                    sql_state: sql_state.to_string(),
                    native_error: 0,
                    message: message.to_string(),
                },
            });
    }

    /// Marks every currently connected link as dead.
    pub fn kill_connections(&self) {
        for conn in self.state().conns.values_mut() {
            if conn.connected {
                conn.attrs.insert(SQL_ATTR_CONNECTION_DEAD, SQL_CD_TRUE);
            }
        }
    }

    pub fn set_reject_reset(&self, reject: bool) {
        self.state().reject_reset = reject;
    }

    /// Accept `SQL_COPT_SS_BCP` writes without ever turning the mode on.
    pub fn set_refuse_bcp_mode(&self, refuse: bool) {
        self.state().refuse_bcp_mode = refuse;
    }

    pub fn set_bcp_exec_rows(&self, rows: i32) {
        self.state().bcp_exec_rows = rows;
    }

    pub fn calls(&self) -> Vec<MockOp> {
        self.state().journal.clone()
    }

    pub fn call_count(&self, op: MockOp) -> usize {
        self.state().journal.iter().filter(|c| **c == op).count()
    }

    pub fn clear_calls(&self) {
        self.state().journal.clear();
    }

    pub fn executed(&self) -> Vec<ExecutedStatement> {
        self.state().executed.clone()
    }

    pub fn desc_fields(&self) -> Vec<(i16, i16, usize)> {
        self.state().desc_fields.clone()
    }

    pub fn connect_count(&self) -> usize {
        self.state().connect_count
    }

    pub fn disconnect_count(&self) -> usize {
        self.state().disconnect_count
    }

    pub fn live_handles(&self, kind: HandleKind) -> usize {
        self.state().live.values().filter(|k| **k == kind).count()
    }

    pub fn freed_handles(&self, kind: HandleKind) -> usize {
        self.state().freed.iter().filter(|(k, _)| *k == kind).count()
    }

    /// Frees of handles that were never allocated or already freed.
    pub fn invalid_frees(&self) -> usize {
        self.state().invalid_frees
    }

    pub fn connect_attr(&self, dbc: RawHandle, attribute: i32) -> Option<usize> {
        self.state()
            .conns
            .get(&dbc.0)
            .and_then(|c| c.attrs.get(&attribute).copied())
    }

    pub fn connection_string(&self, dbc: RawHandle) -> Option<String> {
        self.state()
            .conns
            .get(&dbc.0)
            .map(|c| c.connection_string.clone())
    }

    /// Active bulk-copy session of the first connection that has one.
    pub fn bcp_session(&self) -> Option<MockBcpSession> {
        self.state().conns.values().find_map(|c| c.bcp.clone())
    }

    /// Bulk-copy sessions completed with `bcp_done`.
    pub fn finished_bcp_sessions(&self) -> Vec<MockBcpSession> {
        self.state().finished_bcp.clone()
    }

    fn new_handle(state: &mut MockState, kind: HandleKind) -> usize {
        state.next_handle += 1;
        let id = 0x1000 + state.next_handle;
        state.live.insert(id, kind);
        id
    }
}

impl MockState {
    /// Records the call, clears stale diagnostics and applies an injected
    /// failure if one is due.
    fn enter(&mut self, op: MockOp, handle: RawHandle) -> Option<SqlReturn> {
        self.journal.push(op);
        self.diags.remove(&handle.0);
        let queue = self.failures.get_mut(&op)?;
        let front = queue.front_mut()?;
        if front.skip > 0 {
            front.skip -= 1;
            return None;
        }
        let failure = queue.pop_front()?;
        self.diags.insert(handle.0, vec![failure.record]);
        Some(SqlReturn::ERROR)
    }

    fn error(&mut self, handle: RawHandle, sql_state: &str, message: &str) -> SqlReturn {
        self.diags.insert(
            handle.0,
            vec![DiagnosticRecord {
                sql_state: sql_state.to_string(),
                native_error: 0,
                message: message.to_string(),
            }],
        );
        SqlReturn::ERROR
    }

    fn is_live(&self, handle: RawHandle, kind: HandleKind) -> bool {
        self.live.get(&handle.0) == Some(&kind)
    }

    fn start_execution(&mut self, stmt: RawHandle, sql: String, prepared: bool) -> SqlReturn {
        let params = match self.stmts.get(&stmt.0) {
            Some(s) => {
                let mut numbers: Vec<_> = s.bindings.keys().copied().collect();
                numbers.sort_unstable();
                // SAFETY: the bind contract keeps every bound buffer alive
                // until execute returns; bindings are cleared before the
                // buffers are freed.
                numbers
                    .iter()
                    .map(|n| unsafe { decode_parameter(&s.bindings[n]) })
                    .collect()
            }
            None => return SqlReturn::INVALID_HANDLE,
        };
        self.executed.push(ExecutedStatement {
            sql,
            prepared,
            params,
        });
        let result = self
            .results
            .pop_front()
            .unwrap_or_else(|| MockResult::rows_affected(-1));
        let Some(s) = self.stmts.get_mut(&stmt.0) else {
            return SqlReturn::INVALID_HANDLE;
        };
        s.row_count = result.row_count;
        s.sets = result.result_sets.into();
        s.current = s.sets.pop_front();
        s.row = None;
        s.read_offsets.clear();
        SqlReturn::SUCCESS
    }
}

/// Reads one bound parameter back the way a driver would at execute time.
///
/// # Safety
/// The binding's pointers must be valid for the declared C type.
unsafe fn decode_parameter(b: &ParameterBinding) -> Value {
    let indicator = if b.indicator_ptr.is_null() {
        0
    } else {
        std::ptr::read_unaligned(b.indicator_ptr)
    };
    if indicator == SQL_NULL_DATA || b.value_ptr.is_null() {
        return Value::Null;
    }
    let p = b.value_ptr as *const u8;
    match b.c_type {
        SQL_C_CHAR => {
            let bytes = std::slice::from_raw_parts(p, indicator.max(0) as usize);
            Value::Text(String::from_utf8_lossy(bytes).into_owned())
        }
        SQL_C_WCHAR => {
            let units = std::slice::from_raw_parts(p as *const u16, indicator.max(0) as usize / 2);
            Value::Text(String::from_utf16_lossy(units))
        }
        SQL_C_BINARY => Value::Bytes(std::slice::from_raw_parts(p, indicator.max(0) as usize).to_vec()),
        SQL_C_BIT => Value::Bool(std::ptr::read_unaligned(p) != 0),
        SQL_C_TINYINT | SQL_C_STINYINT => Value::Int(i64::from(std::ptr::read_unaligned(p as *const i8))),
        SQL_C_UTINYINT => Value::Int(i64::from(std::ptr::read_unaligned(p))),
        SQL_C_SHORT | SQL_C_SSHORT => Value::Int(i64::from(std::ptr::read_unaligned(p as *const i16))),
        SQL_C_USHORT => Value::Int(i64::from(std::ptr::read_unaligned(p as *const u16))),
        SQL_C_LONG | SQL_C_SLONG => Value::Int(i64::from(std::ptr::read_unaligned(p as *const i32))),
        SQL_C_ULONG => Value::Int(i64::from(std::ptr::read_unaligned(p as *const u32))),
        SQL_C_SBIGINT => Value::Int(std::ptr::read_unaligned(p as *const i64)),
        SQL_C_UBIGINT => Value::Int(std::ptr::read_unaligned(p as *const u64) as i64),
        SQL_C_FLOAT => Value::Float(f64::from(std::ptr::read_unaligned(p as *const f32))),
        SQL_C_DOUBLE => Value::Float(std::ptr::read_unaligned(p as *const f64)),
        SQL_C_TYPE_DATE => date_from_sql(&std::ptr::read_unaligned(p as *const Date))
            .map(Value::Date)
            .unwrap_or(Value::Null),
        SQL_C_TYPE_TIME => time_from_sql(&std::ptr::read_unaligned(p as *const Time))
            .map(Value::Time)
            .unwrap_or(Value::Null),
        SQL_C_TYPE_TIMESTAMP => {
            let raw = std::ptr::read_unaligned(p as *const Timestamp);
            timestamp_from_sql(&raw).map(Value::Timestamp).unwrap_or(Value::Null)
        }
        SQL_C_NUMERIC => Value::Numeric(Numeric::from_sql(&std::ptr::read_unaligned(
            p as *const SqlNumeric,
        ))),
        _ => Value::Null,
    }
}

/// Encodes a cell for `get_data`. Variable-length encodings return
/// `(bytes, terminator_width)`; fixed ones have width 0 and must fit exactly.
fn encode_cell(c_type: i16, value: &Value) -> Option<(Vec<u8>, usize, bool)> {
    let fixed = |bytes: Vec<u8>| Some((bytes, 0, false));
    match c_type {
        SQL_C_CHAR => Some((value.to_text()?.into_bytes(), 1, true)),
        SQL_C_WCHAR => {
            let units: Vec<u8> = value
                .to_text()?
                .encode_utf16()
                .flat_map(|u| u.to_ne_bytes())
                .collect();
            Some((units, 2, true))
        }
        SQL_C_BINARY => match value {
            Value::Bytes(b) => Some((b.clone(), 0, true)),
            other => Some((other.to_text()?.into_bytes(), 0, true)),
        },
        SQL_C_UTINYINT => fixed(vec![value.as_i64()? as u8]),
        SQL_C_STINYINT | SQL_C_TINYINT => fixed((value.as_i64()? as i8).to_ne_bytes().to_vec()),
        SQL_C_SSHORT | SQL_C_SHORT => fixed((value.as_i64()? as i16).to_ne_bytes().to_vec()),
        SQL_C_SLONG | SQL_C_LONG => fixed((value.as_i64()? as i32).to_ne_bytes().to_vec()),
        SQL_C_SBIGINT => fixed(value.as_i64()?.to_ne_bytes().to_vec()),
        SQL_C_BIT => fixed(vec![u8::from(value.as_i64()? != 0)]),
        SQL_C_FLOAT | SQL_C_DOUBLE => {
            let v = match value {
                Value::Float(f) => *f,
                Value::Int(i) => *i as f64,
                _ => return None,
            };
            if c_type == SQL_C_FLOAT {
                fixed((v as f32).to_ne_bytes().to_vec())
            } else {
                fixed(v.to_ne_bytes().to_vec())
            }
        }
        SQL_C_TYPE_DATE => match value {
            Value::Date(d) => fixed(date_to_sql(d).to_bytes()),
            _ => None,
        },
        SQL_C_TYPE_TIME => match value {
            Value::Time(t) => fixed(time_to_sql(t).to_bytes()),
            _ => None,
        },
        SQL_C_TYPE_TIMESTAMP => match value {
            Value::Timestamp(ts) => fixed(timestamp_to_sql(ts).to_bytes()),
            _ => None,
        },
        _ => None,
    }
}

impl DriverApi for MockDriver {
    fn alloc_handle(&self, kind: HandleKind, parent: RawHandle, out: &mut RawHandle) -> SqlReturn {
        let mut s = self.state();
        if let Some(ret) = s.enter(MockOp::AllocHandle, parent) {
            return ret;
        }
        match kind {
            HandleKind::Environment => {}
            HandleKind::Connection => {
                if !s.is_live(parent, HandleKind::Environment) {
                    return SqlReturn::INVALID_HANDLE;
                }
            }
            HandleKind::Statement => {
                if !s.is_live(parent, HandleKind::Connection) {
                    return SqlReturn::INVALID_HANDLE;
                }
                if !s.conns.get(&parent.0).is_some_and(|c| c.connected) {
                    return s.error(parent, "08003", "Connection not open");
                }
            }
            HandleKind::Descriptor => return s.error(parent, "HY092", "Explicit descriptors unsupported"),
        }
        let id = MockDriver::new_handle(&mut *s, kind);
        match kind {
            HandleKind::Connection => {
                s.conns.insert(id, ConnState::default());
            }
            HandleKind::Statement => {
                s.stmts.insert(
                    id,
                    StmtState {
                        row_count: -1,
                        ..StmtState::default()
                    },
                );
            }
            _ => {}
        }
        *out = RawHandle(id);
        SqlReturn::SUCCESS
    }

    fn free_handle(&self, kind: HandleKind, handle: RawHandle) -> SqlReturn {
        let mut s = self.state();
        s.journal.push(MockOp::FreeHandle);
        if s.live.get(&handle.0) != Some(&kind) {
            s.invalid_frees += 1;
            return SqlReturn::INVALID_HANDLE;
        }
        s.live.remove(&handle.0);
        s.conns.remove(&handle.0);
        if s.stmts.remove(&handle.0).is_some() {
            s.descs.retain(|_, stmt| *stmt != handle.0);
        }
        s.freed.push((kind, handle.0));
        SqlReturn::SUCCESS
    }

    fn set_env_attr(&self, env: RawHandle, _attribute: i32, _value: usize) -> SqlReturn {
        let mut s = self.state();
        if let Some(ret) = s.enter(MockOp::SetEnvAttr, env) {
            return ret;
        }
        if !s.is_live(env, HandleKind::Environment) {
            return SqlReturn::INVALID_HANDLE;
        }
        SqlReturn::SUCCESS
    }

    fn set_connect_attr(&self, dbc: RawHandle, attribute: i32, value: usize) -> SqlReturn {
        let mut s = self.state();
        if let Some(ret) = s.enter(MockOp::SetConnectAttr, dbc) {
            return ret;
        }
        if attribute == SQL_COPT_SS_RESET_CONNECTION && s.reject_reset {
            return s.error(dbc, "HY000", "Session reset rejected");
        }
        let refuse_bcp = s.refuse_bcp_mode;
        let Some(conn) = s.conns.get_mut(&dbc.0) else {
            return SqlReturn::INVALID_HANDLE;
        };
        if attribute == SQL_COPT_SS_BCP && refuse_bcp {
            return SqlReturn::SUCCESS_WITH_INFO;
        }
        if attribute != SQL_COPT_SS_RESET_CONNECTION {
            conn.attrs.insert(attribute, value);
        }
        SqlReturn::SUCCESS
    }

    fn get_connect_attr(&self, dbc: RawHandle, attribute: i32, value: &mut usize) -> SqlReturn {
        let mut s = self.state();
        if let Some(ret) = s.enter(MockOp::GetConnectAttr, dbc) {
            return ret;
        }
        let Some(conn) = s.conns.get(&dbc.0) else {
            return SqlReturn::INVALID_HANDLE;
        };
        *value = conn.attrs.get(&attribute).copied().unwrap_or(0);
        SqlReturn::SUCCESS
    }

    fn driver_connect(&self, dbc: RawHandle, connection_string: &str) -> SqlReturn {
        let mut s = self.state();
        if let Some(ret) = s.enter(MockOp::Connect, dbc) {
            return ret;
        }
        let Some(conn) = s.conns.get_mut(&dbc.0) else {
            return SqlReturn::INVALID_HANDLE;
        };
        if conn.connected {
            return s.error(dbc, "08002", "Connection name in use");
        }
        conn.connected = true;
        conn.connection_string = connection_string.to_string();
        conn.attrs.remove(&SQL_ATTR_CONNECTION_DEAD);
        conn.attrs.entry(SQL_ATTR_AUTOCOMMIT).or_insert(SQL_AUTOCOMMIT_ON);
        s.connect_count += 1;
        SqlReturn::SUCCESS
    }

    fn disconnect(&self, dbc: RawHandle) -> SqlReturn {
        let mut s = self.state();
        if let Some(ret) = s.enter(MockOp::Disconnect, dbc) {
            return ret;
        }
        let Some(conn) = s.conns.get_mut(&dbc.0) else {
            return SqlReturn::INVALID_HANDLE;
        };
        if !conn.connected {
            return s.error(dbc, "08003", "Connection not open");
        }
        conn.connected = false;
        s.disconnect_count += 1;
        SqlReturn::SUCCESS
    }

    fn end_tran(&self, _kind: HandleKind, handle: RawHandle, _completion: i16) -> SqlReturn {
        let mut s = self.state();
        if let Some(ret) = s.enter(MockOp::EndTran, handle) {
            return ret;
        }
        match s.conns.get(&handle.0) {
            Some(c) if c.connected => SqlReturn::SUCCESS,
            Some(_) => s.error(handle, "08003", "Connection not open"),
            None => SqlReturn::INVALID_HANDLE,
        }
    }

    fn get_diag_rec(
        &self,
        _kind: HandleKind,
        handle: RawHandle,
        record: i16,
        out: &mut DiagnosticRecord,
    ) -> SqlReturn {
        let s = self.state();
        let index = usize::try_from(record.max(1) - 1).unwrap_or(0);
        match s.diags.get(&handle.0).and_then(|d| d.get(index)) {
            Some(rec) => {
                *out = rec.clone();
                SqlReturn::SUCCESS
            }
            None => SqlReturn::NO_DATA,
        }
    }

    fn exec_direct(&self, stmt: RawHandle, sql: &str) -> SqlReturn {
        let mut s = self.state();
        if let Some(ret) = s.enter(MockOp::ExecDirect, stmt) {
            return ret;
        }
        s.start_execution(stmt, sql.to_string(), false)
    }

    fn prepare(&self, stmt: RawHandle, sql: &str) -> SqlReturn {
        let mut s = self.state();
        if let Some(ret) = s.enter(MockOp::Prepare, stmt) {
            return ret;
        }
        let Some(st) = s.stmts.get_mut(&stmt.0) else {
            return SqlReturn::INVALID_HANDLE;
        };
        st.prepared_sql = Some(sql.to_string());
        SqlReturn::SUCCESS
    }

    fn execute(&self, stmt: RawHandle) -> SqlReturn {
        let mut s = self.state();
        if let Some(ret) = s.enter(MockOp::Execute, stmt) {
            return ret;
        }
        let Some(sql) = s.stmts.get(&stmt.0).and_then(|st| st.prepared_sql.clone()) else {
            return s.error(stmt, "HY010", "Function sequence error");
        };
        s.start_execution(stmt, sql, true)
    }

    fn free_stmt_close(&self, stmt: RawHandle) -> SqlReturn {
        let mut s = self.state();
        if let Some(ret) = s.enter(MockOp::CloseCursor, stmt) {
            return ret;
        }
        let Some(st) = s.stmts.get_mut(&stmt.0) else {
            return SqlReturn::INVALID_HANDLE;
        };
        st.sets.clear();
        st.current = None;
        st.row = None;
        SqlReturn::SUCCESS
    }

    fn reset_params(&self, stmt: RawHandle) -> SqlReturn {
        let mut s = self.state();
        if let Some(ret) = s.enter(MockOp::ResetParams, stmt) {
            return ret;
        }
        let Some(st) = s.stmts.get_mut(&stmt.0) else {
            return SqlReturn::INVALID_HANDLE;
        };
        st.bindings.clear();
        SqlReturn::SUCCESS
    }

    unsafe fn bind_parameter(
        &self,
        stmt: RawHandle,
        number: u16,
        binding: &ParameterBinding,
    ) -> SqlReturn {
        let mut s = self.state();
        if let Some(ret) = s.enter(MockOp::BindParameter, stmt) {
            return ret;
        }
        let Some(st) = s.stmts.get_mut(&stmt.0) else {
            return SqlReturn::INVALID_HANDLE;
        };
        st.bindings.insert(number, *binding);
        SqlReturn::SUCCESS
    }

    fn get_app_param_desc(&self, stmt: RawHandle, out: &mut RawHandle) -> SqlReturn {
        let mut s = self.state();
        if let Some(ret) = s.enter(MockOp::GetAppParamDesc, stmt) {
            return ret;
        }
        if !s.stmts.contains_key(&stmt.0) {
            return SqlReturn::INVALID_HANDLE;
        }
        let existing = s.descs.iter().find(|(_, st)| **st == stmt.0).map(|(d, _)| *d);
        let desc = existing.unwrap_or_else(|| {
            s.next_handle += 1;
            let id = 0x1000 + s.next_handle;
            s.descs.insert(id, stmt.0);
            id
        });
        *out = RawHandle(desc);
        SqlReturn::SUCCESS
    }

    unsafe fn set_desc_field(
        &self,
        desc: RawHandle,
        record: i16,
        field: i16,
        value: *mut c_void,
        _length: i32,
    ) -> SqlReturn {
        let mut s = self.state();
        if let Some(ret) = s.enter(MockOp::SetDescField, desc) {
            return ret;
        }
        if !s.descs.contains_key(&desc.0) {
            return SqlReturn::INVALID_HANDLE;
        }
        s.desc_fields.push((record, field, value as usize));
        SqlReturn::SUCCESS
    }

    fn row_count(&self, stmt: RawHandle, out: &mut isize) -> SqlReturn {
        let mut s = self.state();
        if let Some(ret) = s.enter(MockOp::RowCount, stmt) {
            return ret;
        }
        let Some(st) = s.stmts.get(&stmt.0) else {
            return SqlReturn::INVALID_HANDLE;
        };
        *out = st.row_count;
        SqlReturn::SUCCESS
    }

    fn num_result_cols(&self, stmt: RawHandle, out: &mut i16) -> SqlReturn {
        let mut s = self.state();
        if let Some(ret) = s.enter(MockOp::NumResultCols, stmt) {
            return ret;
        }
        let Some(st) = s.stmts.get(&stmt.0) else {
            return SqlReturn::INVALID_HANDLE;
        };
        *out = st.current.as_ref().map(|set| set.columns.len() as i16).unwrap_or(0);
        SqlReturn::SUCCESS
    }

    fn describe_col(&self, stmt: RawHandle, column: u16, out: &mut ColumnAttributes) -> SqlReturn {
        let mut s = self.state();
        if let Some(ret) = s.enter(MockOp::DescribeCol, stmt) {
            return ret;
        }
        let attrs = s
            .stmts
            .get(&stmt.0)
            .and_then(|st| st.current.as_ref())
            .and_then(|set| set.columns.get(usize::from(column).wrapping_sub(1)))
            .cloned();
        match attrs {
            Some(a) => {
                *out = a;
                SqlReturn::SUCCESS
            }
            None => s.error(stmt, "07009", "Invalid descriptor index"),
        }
    }

    fn fetch(&self, stmt: RawHandle) -> SqlReturn {
        let mut s = self.state();
        if let Some(ret) = s.enter(MockOp::Fetch, stmt) {
            return ret;
        }
        let Some(st) = s.stmts.get_mut(&stmt.0) else {
            return SqlReturn::INVALID_HANDLE;
        };
        let Some(set) = st.current.as_ref() else {
            return s.error(stmt, "24000", "Invalid cursor state");
        };
        let next = st.row.map(|r| r + 1).unwrap_or(0);
        st.read_offsets.clear();
        if next >= set.rows.len() {
            st.row = Some(set.rows.len());
            return SqlReturn::NO_DATA;
        }
        st.row = Some(next);
        SqlReturn::SUCCESS
    }

    fn get_data(
        &self,
        stmt: RawHandle,
        column: u16,
        c_type: i16,
        target: &mut [u8],
        indicator: &mut isize,
    ) -> SqlReturn {
        let mut s = self.state();
        if let Some(ret) = s.enter(MockOp::GetData, stmt) {
            return ret;
        }
        let Some(st) = s.stmts.get_mut(&stmt.0) else {
            return SqlReturn::INVALID_HANDLE;
        };
        let value = st
            .current
            .as_ref()
            .zip(st.row)
            .and_then(|(set, row)| set.rows.get(row))
            .and_then(|row| row.get(usize::from(column).wrapping_sub(1)))
            .cloned();
        let Some(value) = value else {
            return s.error(stmt, "07009", "Invalid descriptor index");
        };
        if value.is_null() {
            *indicator = SQL_NULL_DATA;
            return SqlReturn::SUCCESS;
        }
        let Some((bytes, nul_width, variable)) = encode_cell(c_type, &value) else {
            return s.error(stmt, "07006", "Restricted data type attribute violation");
        };
        if !variable {
            if target.len() < bytes.len() {
                return s.error(stmt, "HY090", "Invalid buffer length");
            }
            target[..bytes.len()].copy_from_slice(&bytes);
            *indicator = bytes.len() as isize;
            return SqlReturn::SUCCESS;
        }
        let offset = st.read_offsets.get(&column).copied();
        if offset.is_some_and(|o| o >= bytes.len()) {
            return SqlReturn::NO_DATA;
        }
        let start = offset.unwrap_or(0);
        let remaining = &bytes[start..];
        *indicator = remaining.len() as isize;
        if target.len() <= nul_width {
            return SqlReturn::SUCCESS_WITH_INFO;
        }
        let room = target.len() - nul_width;
        let room = room - room % nul_width.max(1);
        let n = remaining.len().min(room);
        target[..n].copy_from_slice(&remaining[..n]);
        for b in target.iter_mut().skip(n).take(nul_width) {
            *b = 0;
        }
        st.read_offsets.insert(column, start + n);
        if n < remaining.len() {
            SqlReturn::SUCCESS_WITH_INFO
        } else {
            SqlReturn::SUCCESS
        }
    }

    fn more_results(&self, stmt: RawHandle) -> SqlReturn {
        let mut s = self.state();
        if let Some(ret) = s.enter(MockOp::MoreResults, stmt) {
            return ret;
        }
        let Some(st) = s.stmts.get_mut(&stmt.0) else {
            return SqlReturn::INVALID_HANDLE;
        };
        st.row = None;
        st.read_offsets.clear();
        st.current = st.sets.pop_front();
        if st.current.is_some() {
            SqlReturn::SUCCESS
        } else {
            SqlReturn::NO_DATA
        }
    }

    fn bcp_init(
        &self,
        dbc: RawHandle,
        table: &str,
        data_file: Option<&str>,
        error_file: Option<&str>,
        direction: i32,
    ) -> SqlReturn {
        let mut s = self.state();
        if let Some(ret) = s.enter(MockOp::BcpInit, dbc) {
            return ret;
        }
        let Some(conn) = s.conns.get_mut(&dbc.0) else {
            return SqlReturn::INVALID_HANDLE;
        };
        if conn.attrs.get(&SQL_COPT_SS_BCP).copied() != Some(SQL_BCP_ON) {
            return s.error(dbc, "HY000", "Bulk copy mode is not enabled on this connection");
        }
        conn.bcp = Some(MockBcpSession {
            table: table.to_string(),
            data_file: data_file.map(str::to_string),
            error_file: error_file.map(str::to_string),
            direction,
            ..MockBcpSession::default()
        });
        conn.bcp_bindings.clear();
        SqlReturn::SUCCESS
    }

    fn bcp_control(&self, dbc: RawHandle, option: i32, value: BcpControlValue<'_>) -> SqlReturn {
        let mut s = self.state();
        if let Some(ret) = s.enter(MockOp::BcpControl, dbc) {
            return ret;
        }
        let Some(session) = s.conns.get_mut(&dbc.0).and_then(|c| c.bcp.as_mut()) else {
            return s.error(dbc, "HY010", "bcp_init has not been called");
        };
        let value = match value {
            BcpControlValue::Int(v) => MockControl::Int(v),
            BcpControlValue::Text(t) => MockControl::Text(t.to_string()),
        };
        session.controls.push((option, value));
        SqlReturn::SUCCESS
    }

    fn bcp_set_bulk_mode(
        &self,
        dbc: RawHandle,
        mode: i32,
        field_terminator: Option<&[u8]>,
        row_terminator: Option<&[u8]>,
    ) -> SqlReturn {
        let mut s = self.state();
        if let Some(ret) = s.enter(MockOp::BcpSetBulkMode, dbc) {
            return ret;
        }
        let Some(session) = s.conns.get_mut(&dbc.0).and_then(|c| c.bcp.as_mut()) else {
            return s.error(dbc, "HY010", "bcp_init has not been called");
        };
        session.bulk_mode = Some((
            mode,
            field_terminator.map(<[u8]>::to_vec),
            row_terminator.map(<[u8]>::to_vec),
        ));
        SqlReturn::SUCCESS
    }

    fn bcp_read_fmt(&self, dbc: RawHandle, path: &str) -> SqlReturn {
        let mut s = self.state();
        if let Some(ret) = s.enter(MockOp::BcpReadFmt, dbc) {
            return ret;
        }
        let Some(session) = s.conns.get_mut(&dbc.0).and_then(|c| c.bcp.as_mut()) else {
            return s.error(dbc, "HY010", "bcp_init has not been called");
        };
        session.format_file = Some(path.to_string());
        SqlReturn::SUCCESS
    }

    fn bcp_columns(&self, dbc: RawHandle, count: i32) -> SqlReturn {
        let mut s = self.state();
        if let Some(ret) = s.enter(MockOp::BcpColumns, dbc) {
            return ret;
        }
        let Some(session) = s.conns.get_mut(&dbc.0).and_then(|c| c.bcp.as_mut()) else {
            return s.error(dbc, "HY010", "bcp_init has not been called");
        };
        session.columns = Some(count);
        SqlReturn::SUCCESS
    }

    fn bcp_col_fmt(&self, dbc: RawHandle, format: &ColumnFormat<'_>) -> SqlReturn {
        let mut s = self.state();
        if let Some(ret) = s.enter(MockOp::BcpColFmt, dbc) {
            return ret;
        }
        let Some(session) = s.conns.get_mut(&dbc.0).and_then(|c| c.bcp.as_mut()) else {
            return s.error(dbc, "HY010", "bcp_init has not been called");
        };
        session.column_formats.push(MockColumnFormat {
            file_column: format.file_column,
            user_data_type: format.user_data_type,
            indicator_length: format.indicator_length,
            user_data_length: format.user_data_length,
            terminator: format.terminator.map(<[u8]>::to_vec),
            server_column: format.server_column,
        });
        SqlReturn::SUCCESS
    }

    unsafe fn bcp_bind(&self, dbc: RawHandle, binding: &BcpBinding) -> SqlReturn {
        let mut s = self.state();
        if let Some(ret) = s.enter(MockOp::BcpBind, dbc) {
            return ret;
        }
        let Some(conn) = s.conns.get_mut(&dbc.0) else {
            return SqlReturn::INVALID_HANDLE;
        };
        if conn.bcp.is_none() {
            return s.error(dbc, "HY010", "bcp_init has not been called");
        }
        conn.bcp_bindings.insert(binding.server_column, *binding);
        SqlReturn::SUCCESS
    }

    fn bcp_send_row(&self, dbc: RawHandle) -> SqlReturn {
        let mut s = self.state();
        if let Some(ret) = s.enter(MockOp::BcpSendRow, dbc) {
            return ret;
        }
        let Some(conn) = s.conns.get_mut(&dbc.0) else {
            return SqlReturn::INVALID_HANDLE;
        };
        let mut columns: Vec<_> = conn.bcp_bindings.values().copied().collect();
        columns.sort_by_key(|b| b.server_column);
        let row = columns
            .iter()
            .map(|b| {
                let cell = if b.data_length < 0 || b.data.is_null() {
                    None
                } else {
                    // SAFETY: the bind contract keeps `data` valid for `data_length` bytes.
                    Some(unsafe {
                        std::slice::from_raw_parts(b.data, b.data_length as usize).to_vec()
                    })
                };
                (b.server_column, cell)
            })
            .collect();
        let Some(session) = conn.bcp.as_mut() else {
            return s.error(dbc, "HY010", "bcp_init has not been called");
        };
        session.rows.push(row);
        SqlReturn::SUCCESS
    }

    fn bcp_exec(&self, dbc: RawHandle, rows_copied: &mut i32) -> SqlReturn {
        let mut s = self.state();
        if let Some(ret) = s.enter(MockOp::BcpExec, dbc) {
            return ret;
        }
        let rows = s.bcp_exec_rows;
        if s.conns.get(&dbc.0).and_then(|c| c.bcp.as_ref()).is_none() {
            return s.error(dbc, "HY010", "bcp_init has not been called");
        }
        *rows_copied = rows;
        SqlReturn::SUCCESS
    }

    fn bcp_done(&self, dbc: RawHandle, rows_committed: &mut i32) -> SqlReturn {
        let mut s = self.state();
        if let Some(ret) = s.enter(MockOp::BcpDone, dbc) {
            return ret;
        }
        let Some(conn) = s.conns.get_mut(&dbc.0) else {
            return SqlReturn::INVALID_HANDLE;
        };
        let Some(mut session) = conn.bcp.take() else {
            return s.error(dbc, "HY010", "bcp_init has not been called");
        };
        conn.bcp_bindings.clear();
        session.done = true;
        *rows_committed = session.rows.len() as i32;
        s.finished_bcp.push(session);
        SqlReturn::SUCCESS
    }
}
