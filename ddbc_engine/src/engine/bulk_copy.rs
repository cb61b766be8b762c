//! SQL Server bulk-copy (BCP) operations on an open connection.

use super::connection::Connection;
use super::value::Value;
use crate::driver::sql::*;
use crate::driver::{BcpBinding, BcpControlValue, ColumnFormat, ReturnCode};
use crate::error::{DdbcError, ErrorInfo, Result};
use crate::handles::DriverHandle;
use crate::observability::StructuredLogger;
use log::Level;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// Lifecycle of a bulk-copy operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BcpState {
    Uninitialized,
    Initialized,
    Finished,
}

/// Copy direction accepted by [`BulkCopyOperation::initialize`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BcpDirection {
    In,
    Out,
    QueryOut,
}

impl BcpDirection {
    /// Case-insensitive `in`, `out` or `queryout`.
    pub fn parse(direction: &str) -> Result<Self> {
        match direction.to_ascii_lowercase().as_str() {
            "in" => Ok(Self::In),
            "out" => Ok(Self::Out),
            "queryout" => Ok(Self::QueryOut),
            _ => Err(DdbcError::InvalidArgument(format!(
                "Invalid BCP direction string: {direction}"
            ))),
        }
    }

    fn code(self) -> i32 {
        match self {
            Self::In => DB_IN,
            Self::Out => DB_OUT,
            Self::QueryOut => DB_QUERYOUT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ControlKind {
    Int,
    Text,
}

/// Property name, driver option code and the value kind it takes.
const CONTROL_PROPERTIES: &[(&str, i32, ControlKind)] = &[
    ("BCPMAXERRS", BCPMAXERRS, ControlKind::Int),
    ("BCPFIRST", BCPFIRST, ControlKind::Int),
    ("BCPLAST", BCPLAST, ControlKind::Int),
    ("BCPBATCH", BCPBATCH, ControlKind::Int),
    ("BCPKEEPNULLS", BCPKEEPNULLS, ControlKind::Int),
    ("BCPKEEPIDENTITY", BCPKEEPIDENTITY, ControlKind::Int),
    ("BCPHINTS", BCPHINTSW, ControlKind::Text),
    ("BCPFILECP", BCPFILECP, ControlKind::Int),
];

fn control_property(name: &str) -> Option<(i32, ControlKind)> {
    CONTROL_PROPERTIES
        .iter()
        .find(|(n, _, _)| *n == name)
        .map(|(_, code, kind)| (*code, *kind))
}

/// Buffers handed to `bcp_bind` for one server column. They stay put until
/// the column is rebound successfully or the operation ends.
struct BoundColumn {
    data: Box<[u8]>,
    terminator: Option<Box<[u8]>>,
}

struct Inner {
    state: BcpState,
    arena: HashMap<i32, BoundColumn>,
    enabled_bcp_mode: bool,
}

/// One bulk-copy operation bound to a connection.
///
/// Every state-changing call runs under the operation's own lock. Only one
/// operation (or cursor) should be active on a connection at a time.
pub struct BulkCopyOperation {
    dbc: Arc<DriverHandle>,
    logger: Arc<StructuredLogger>,
    inner: Mutex<Inner>,
}

fn bcp_error(info: ErrorInfo) -> DdbcError {
    DdbcError::BulkCopy(info)
}

fn empty_to_none(bytes: Option<&[u8]>) -> Option<&[u8]> {
    bytes.filter(|b| !b.is_empty())
}

impl BulkCopyOperation {
    pub fn new(conn: &Connection) -> Result<Self> {
        let dbc = conn.handle()?;
        Ok(Self {
            logger: dbc.logger().clone(),
            dbc,
            inner: Mutex::new(Inner {
                state: BcpState::Uninitialized,
                arena: HashMap::new(),
                enabled_bcp_mode: false,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn require_initialized(inner: &Inner, operation: &str) -> Result<()> {
        if inner.state == BcpState::Initialized {
            Ok(())
        } else {
            Err(DdbcError::State(format!(
                "{operation} requires an initialized bulk copy operation"
            )))
        }
    }

    pub fn state(&self) -> BcpState {
        self.lock().state
    }

    fn bcp_mode_on(&self) -> bool {
        let mut value = SQL_BCP_OFF;
        let ret = self
            .dbc
            .api()
            .get_connect_attr(self.dbc.raw(), SQL_COPT_SS_BCP, &mut value);
        ret.succeeded() && value == SQL_BCP_ON
    }

    /// Turns bulk-copy mode on when it is off, then re-reads it. Init is
    /// refused unless the mode reads as on right before the call.
    fn ensure_bcp_mode(&self, inner: &mut Inner) -> Result<()> {
        if self.bcp_mode_on() {
            return Ok(());
        }
        crate::ddbc_log!(self.logger, Level::Debug, "Enabling bulk copy mode on connection");
        let ret = self
            .dbc
            .api()
            .set_connect_attr(self.dbc.raw(), SQL_COPT_SS_BCP, SQL_BCP_ON);
        self.dbc.check(ret, bcp_error)?;
        inner.enabled_bcp_mode = true;
        if !self.bcp_mode_on() {
            return Err(DdbcError::BulkCopy(ErrorInfo::message(
                "Bulk copy mode is not enabled on the connection",
            )));
        }
        Ok(())
    }

    /// Starts an operation on `table` (the query text for `queryout`).
    /// Allowed again once a previous operation has finished.
    pub fn initialize(
        &self,
        table: &str,
        data_file: Option<&str>,
        error_file: Option<&str>,
        direction: &str,
    ) -> Result<()> {
        let mut inner = self.lock();
        if inner.state == BcpState::Initialized {
            return Err(DdbcError::State(
                "Bulk copy already initialized; call finish() or close() first".to_string(),
            ));
        }
        let direction = BcpDirection::parse(direction)?;
        if table.trim().is_empty() {
            return Err(DdbcError::InvalidArgument(
                "The table name (or query for queryout) must be provided".to_string(),
            ));
        }
        self.ensure_bcp_mode(&mut inner)?;

        let data_file = data_file.filter(|f| !f.is_empty());
        let error_file = error_file.filter(|f| !f.is_empty());
        let ret = self
            .dbc
            .api()
            .bcp_init(self.dbc.raw(), table, data_file, error_file, direction.code());
        self.dbc.check(ret, bcp_error)?;

        inner.arena.clear();
        inner.state = BcpState::Initialized;
        crate::ddbc_log!(
            self.logger,
            Level::Info,
            "Bulk copy initialized: table={}, direction={:?}",
            table,
            direction
        );
        Ok(())
    }

    /// Sets one named tunable. The name and value kind are checked before
    /// anything is sent to the driver.
    pub fn control(&self, name: &str, value: BcpControlValue<'_>) -> Result<()> {
        let inner = self.lock();
        Self::require_initialized(&inner, "control")?;
        let (code, kind) = control_property(name).ok_or_else(|| {
            DdbcError::InvalidArgument(format!("Unknown bulk copy property: {name}"))
        })?;
        let matches_kind = matches!(
            (kind, value),
            (ControlKind::Int, BcpControlValue::Int(_)) | (ControlKind::Text, BcpControlValue::Text(_))
        );
        if !matches_kind {
            return Err(DdbcError::InvalidArgument(format!(
                "Bulk copy property {name} expects {} value",
                if kind == ControlKind::Int { "an integer" } else { "a string" }
            )));
        }
        let ret = self.dbc.api().bcp_control(self.dbc.raw(), code, value);
        self.dbc.check(ret, bcp_error)
    }

    /// `mode` is `char` or `native`. Empty terminators are sent as absent.
    pub fn set_bulk_mode(
        &self,
        mode: &str,
        field_terminator: Option<&[u8]>,
        row_terminator: Option<&[u8]>,
    ) -> Result<()> {
        let inner = self.lock();
        Self::require_initialized(&inner, "set_bulk_mode")?;
        let code = match mode {
            "char" => BCP_OUT_CHARACTER_MODE,
            "native" => BCP_OUT_NATIVE_MODE,
            other => {
                return Err(DdbcError::InvalidArgument(format!(
                    "Invalid bulk mode '{other}'; expected 'char' or 'native'"
                )))
            }
        };
        let ret = self.dbc.api().bcp_set_bulk_mode(
            self.dbc.raw(),
            code,
            empty_to_none(field_terminator),
            empty_to_none(row_terminator),
        );
        self.dbc.check(ret, bcp_error)
    }

    pub fn read_format_file(&self, path: &str) -> Result<()> {
        let inner = self.lock();
        Self::require_initialized(&inner, "read_format_file")?;
        if path.is_empty() {
            return Err(DdbcError::InvalidArgument(
                "Format file path cannot be empty".to_string(),
            ));
        }
        let ret = self.dbc.api().bcp_read_fmt(self.dbc.raw(), path);
        self.dbc.check(ret, bcp_error)
    }

    /// Declares the number of columns in the data file.
    pub fn define_columns(&self, count: i32) -> Result<()> {
        let inner = self.lock();
        Self::require_initialized(&inner, "define_columns")?;
        if count <= 0 {
            return Err(DdbcError::InvalidArgument(format!(
                "Invalid number of columns: {count}"
            )));
        }
        let ret = self.dbc.api().bcp_columns(self.dbc.raw(), count);
        self.dbc.check(ret, bcp_error)
    }

    /// Maps one data-file column onto a server column.
    pub fn define_column_format(
        &self,
        file_column: i32,
        user_data_type: i32,
        indicator_length: i32,
        user_data_length: i32,
        terminator: Option<&[u8]>,
        server_column: i32,
    ) -> Result<()> {
        let inner = self.lock();
        Self::require_initialized(&inner, "define_column_format")?;
        if file_column <= 0 {
            return Err(DdbcError::InvalidArgument(format!(
                "file column must be 1-based, got {file_column}"
            )));
        }
        let format = ColumnFormat {
            file_column,
            user_data_type,
            indicator_length,
            user_data_length,
            terminator: empty_to_none(terminator),
            server_column,
        };
        let ret = self.dbc.api().bcp_col_fmt(self.dbc.raw(), &format);
        self.dbc.check(ret, bcp_error)
    }

    /// Converts `value` to the buffer layout of `data_type` and binds it to
    /// `server_column` for the next `send_row`. A negative `data_length`
    /// means the length of the converted value.
    pub fn bind_column(
        &self,
        value: &Value,
        indicator_length: i32,
        data_length: i32,
        terminator: Option<&[u8]>,
        data_type: i32,
        server_column: i32,
    ) -> Result<()> {
        let mut inner = self.lock();
        Self::require_initialized(&inner, "bind_column")?;
        if server_column <= 0 {
            return Err(DdbcError::InvalidArgument(format!(
                "server column must be 1-based, got {server_column}"
            )));
        }
        let data = encode_bcp_value(value, data_type, indicator_length)?;
        let data_length = match data {
            None => SQL_NULL_DATA as i32,
            Some(ref bytes) if data_length < 0 => i32::try_from(bytes.len()).map_err(|_| {
                DdbcError::InvalidArgument("Bound value exceeds the bulk copy length limit".to_string())
            })?,
            Some(ref bytes) => {
                if data_length as usize > bytes.len() {
                    return Err(DdbcError::InvalidArgument(format!(
                        "data length {data_length} exceeds the {} bytes of the bound value",
                        bytes.len()
                    )));
                }
                data_length
            }
        };
        let column = BoundColumn {
            data: data.unwrap_or_default().into_boxed_slice(),
            terminator: empty_to_none(terminator).map(Box::from),
        };
        let (terminator_ptr, terminator_length) = match &column.terminator {
            Some(t) => (t.as_ptr(), t.len() as i32),
            None => (std::ptr::null(), 0),
        };
        let binding = BcpBinding {
            data: if data_length == SQL_NULL_DATA as i32 {
                std::ptr::null()
            } else {
                column.data.as_ptr()
            },
            indicator_length,
            data_length,
            terminator: terminator_ptr,
            terminator_length,
            data_type,
            server_column,
        };
        // SAFETY: the buffers are moved into the arena below and stay there
        // until the column is rebound or the operation finishes.
        let ret = unsafe { self.dbc.api().bcp_bind(self.dbc.raw(), &binding) };
        self.dbc.check(ret, bcp_error)?;
        inner.arena.insert(server_column, column);
        Ok(())
    }

    /// Sends the currently bound row. Returns the rows sent, 0 when the
    /// driver reports there is nothing more to send.
    pub fn send_row(&self) -> Result<usize> {
        let inner = self.lock();
        Self::require_initialized(&inner, "send_row")?;
        let ret = self.dbc.api().bcp_send_row(self.dbc.raw());
        if ret.is_no_data() {
            return Ok(0);
        }
        self.dbc.check(ret, bcp_error)?;
        Ok(1)
    }

    /// Runs the file-based transfer and returns the rows copied.
    pub fn execute(&self) -> Result<i32> {
        let inner = self.lock();
        Self::require_initialized(&inner, "execute")?;
        let mut rows = 0;
        let ret = self.dbc.api().bcp_exec(self.dbc.raw(), &mut rows);
        self.dbc.check(ret, bcp_error)?;
        crate::ddbc_log!(self.logger, Level::Info, "Bulk copy executed: {} rows copied", rows);
        Ok(rows)
    }

    /// Completes the operation and returns the rows committed by the last
    /// batch. A no-op when nothing is active; after a failure the operation
    /// stays initialized so finishing can be retried.
    pub fn finish(&self) -> Result<i32> {
        let mut inner = self.lock();
        self.finish_locked(&mut inner)
    }

    fn finish_locked(&self, inner: &mut Inner) -> Result<i32> {
        if inner.state != BcpState::Initialized {
            return Ok(0);
        }
        let mut rows = 0;
        let ret = self.dbc.api().bcp_done(self.dbc.raw(), &mut rows);
        if !ret.succeeded() {
            return Err(DdbcError::BulkCopy(self.dbc.error_info()));
        }
        inner.state = BcpState::Finished;
        inner.arena.clear();
        crate::ddbc_log!(self.logger, Level::Info, "Bulk copy finished: {} rows committed", rows);
        Ok(rows)
    }

    /// Finishes an active operation, reporting a failure to finish.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.lock();
        self.finish_locked(&mut inner).map(|_| ())
    }

    /// Drives a complete file-based operation described by `options`:
    /// init, controls, bulk mode, format, transfer, finish. Returns the rows
    /// copied by the transfer.
    pub fn run(&self, options: &BcpOptions) -> Result<i32> {
        options.validate()?;
        let direction = BcpDirection::parse(&options.direction)?;
        let target = match direction {
            BcpDirection::QueryOut => options.query.as_deref().unwrap_or_default(),
            _ => options.table.as_str(),
        };
        self.initialize(
            target,
            options.data_file.as_deref(),
            options.error_file.as_deref(),
            &options.direction,
        )?;

        let outcome = self.configure_and_execute(options);
        match outcome {
            Ok(rows) => {
                self.finish()?;
                Ok(rows)
            }
            Err(e) => {
                if let Err(finish_err) = self.finish() {
                    self.logger.log_error("finish failed bulk copy", &finish_err);
                }
                Err(e)
            }
        }
    }

    fn configure_and_execute(&self, options: &BcpOptions) -> Result<i32> {
        if let Some(hints) = options.hints.as_deref() {
            self.control("BCPHINTS", BcpControlValue::Text(hints))?;
        }
        let int_controls = [
            ("BCPBATCH", options.batch_size),
            ("BCPMAXERRS", options.max_errors),
            ("BCPFIRST", options.first_row),
            ("BCPLAST", options.last_row),
            ("BCPFILECP", options.code_page),
        ];
        for (name, value) in int_controls {
            if let Some(value) = value {
                self.control(name, BcpControlValue::Int(value))?;
            }
        }
        if options.keep_identity {
            self.control("BCPKEEPIDENTITY", BcpControlValue::Int(1))?;
        }
        if options.keep_nulls {
            self.control("BCPKEEPNULLS", BcpControlValue::Int(1))?;
        }
        if let Some(mode) = options.bulk_mode.as_deref() {
            self.set_bulk_mode(
                mode,
                options.field_terminator.as_deref().map(str::as_bytes),
                options.row_terminator.as_deref().map(str::as_bytes),
            )?;
        }
        if let Some(path) = options.format_file.as_deref() {
            self.read_format_file(path)?;
        } else if !options.columns.is_empty() {
            let count = i32::try_from(options.columns.len())
                .map_err(|_| DdbcError::InvalidArgument("Too many column formats".to_string()))?;
            self.define_columns(count)?;
            for col in &options.columns {
                self.define_column_format(
                    col.file_column,
                    col.user_data_type,
                    col.prefix_len,
                    col.data_len,
                    col.terminator.as_deref().map(str::as_bytes),
                    col.server_column,
                )?;
            }
        }
        self.execute()
    }
}

impl Drop for BulkCopyOperation {
    fn drop(&mut self) {
        let mut inner = self.lock();
        if let Err(e) = self.finish_locked(&mut inner) {
            self.logger.log_error("finish bulk copy on drop", &e);
        }
        inner.arena.clear();
        if inner.enabled_bcp_mode && self.dbc.is_open() {
            let ret = self
                .dbc
                .api()
                .set_connect_attr(self.dbc.raw(), SQL_COPT_SS_BCP, SQL_BCP_OFF);
            if !ret.succeeded() {
                crate::ddbc_log!(
                    self.logger,
                    Level::Warn,
                    "Could not switch bulk copy mode off: {}",
                    self.dbc.error_info()
                );
            }
        }
    }
}

/// Converts a value to the bytes `bcp_bind` expects for `data_type`.
/// `None` is SQL NULL.
fn encode_bcp_value(value: &Value, data_type: i32, indicator_length: i32) -> Result<Option<Vec<u8>>> {
    let mismatch = || {
        DdbcError::InvalidArgument(format!(
            "Cannot bind {} value as bulk copy type {data_type:#x}",
            value.kind_name()
        ))
    };
    let out_of_range = |v: i64| {
        DdbcError::InvalidArgument(format!(
            "Integer {v} does not fit bulk copy type {data_type:#x}"
        ))
    };
    let bytes = match value {
        Value::Null => return Ok(None),
        Value::Text(s) => match data_type {
            SQLNCHAR | SQLNVARCHAR | SQLNTEXT => {
                s.encode_utf16().flat_map(u16::to_ne_bytes).collect()
            }
            SQLCHARACTER | SQLVARCHAR | SQLBIGCHAR | SQLBIGVARCHAR | SQLTEXT => {
                s.as_bytes().to_vec()
            }
            _ => return Err(mismatch()),
        },
        Value::Bytes(b) => b.clone(),
        Value::Bool(b) => match data_type {
            SQLBIT | SQLINT1 => vec![u8::from(*b)],
            _ => return Err(mismatch()),
        },
        Value::Int(v) => {
            let width = match data_type {
                SQLINT1 | SQLBIT => 1,
                SQLINT2 => 2,
                SQLINT4 => 4,
                SQLINT8 => 8,
                SQLINTN => match indicator_length {
                    1 | 2 | 4 | 8 => indicator_length,
                    other => {
                        return Err(DdbcError::InvalidArgument(format!(
                            "SQLINTN needs an indicator length of 1, 2, 4 or 8, got {other}"
                        )))
                    }
                },
                _ => return Err(mismatch()),
            };
            match width {
                1 => vec![u8::try_from(*v).map_err(|_| out_of_range(*v))?],
                2 => i16::try_from(*v).map_err(|_| out_of_range(*v))?.to_ne_bytes().to_vec(),
                4 => i32::try_from(*v).map_err(|_| out_of_range(*v))?.to_ne_bytes().to_vec(),
                _ => v.to_ne_bytes().to_vec(),
            }
        }
        Value::Float(f) => match data_type {
            SQLFLT4 => (*f as f32).to_ne_bytes().to_vec(),
            SQLFLT8 => f.to_ne_bytes().to_vec(),
            SQLFLTN if indicator_length == 4 => (*f as f32).to_ne_bytes().to_vec(),
            SQLFLTN => f.to_ne_bytes().to_vec(),
            _ => return Err(mismatch()),
        },
        Value::Date(_) | Value::Time(_) | Value::Timestamp(_) | Value::Numeric(_) => {
            match data_type {
                SQLCHARACTER | SQLVARCHAR | SQLBIGCHAR | SQLBIGVARCHAR => {
                    value.to_text().ok_or_else(mismatch)?.into_bytes()
                }
                _ => return Err(mismatch()),
            }
        }
    };
    Ok(Some(bytes))
}

/// One column of a programmatic file layout (`bcp_colfmt`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BcpColumnFormat {
    pub file_column: i32,
    pub user_data_type: i32,
    pub prefix_len: i32,
    pub data_len: i32,
    pub terminator: Option<String>,
    pub server_column: i32,
}

impl Default for BcpColumnFormat {
    fn default() -> Self {
        Self {
            file_column: 1,
            user_data_type: 0,
            prefix_len: 0,
            data_len: 0,
            terminator: None,
            server_column: 1,
        }
    }
}

/// Description of a whole file-based bulk-copy run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BcpOptions {
    pub table: String,
    pub direction: String,
    pub data_file: Option<String>,
    pub error_file: Option<String>,
    pub format_file: Option<String>,
    /// Source query for `queryout`.
    pub query: Option<String>,
    /// `char` or `native`.
    pub bulk_mode: Option<String>,
    pub field_terminator: Option<String>,
    pub row_terminator: Option<String>,
    pub batch_size: Option<i64>,
    pub max_errors: Option<i64>,
    pub first_row: Option<i64>,
    pub last_row: Option<i64>,
    pub code_page: Option<i64>,
    pub hints: Option<String>,
    pub keep_identity: bool,
    pub keep_nulls: bool,
    pub columns: Vec<BcpColumnFormat>,
}

impl BcpOptions {
    pub fn from_json(json: &str) -> Result<Self> {
        let options: Self = serde_json::from_str(json)
            .map_err(|e| DdbcError::InvalidArgument(format!("Invalid bulk copy options: {e}")))?;
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(DdbcError::InvalidArgument(msg));
        let direction = BcpDirection::parse(&self.direction)?;
        let has_data_file = self.data_file.as_deref().is_some_and(|f| !f.is_empty());
        match direction {
            BcpDirection::In | BcpDirection::Out => {
                if self.table.trim().is_empty() {
                    return invalid("table is required for directions 'in' and 'out'".to_string());
                }
                if !has_data_file {
                    return invalid(format!("data_file is required for direction '{}'", self.direction));
                }
            }
            BcpDirection::QueryOut => {
                if self.query.as_deref().map_or(true, |q| q.trim().is_empty()) {
                    return invalid("query is required for direction 'queryout'".to_string());
                }
                if !has_data_file {
                    return invalid("data_file is required for direction 'queryout'".to_string());
                }
            }
        }
        if self.format_file.is_some() && !self.columns.is_empty() {
            return invalid("Cannot specify both columns and format_file".to_string());
        }
        if let Some(mode) = self.bulk_mode.as_deref() {
            if mode != "char" && mode != "native" {
                return invalid(format!("Invalid bulk mode '{mode}'; expected 'char' or 'native'"));
            }
        }
        for (name, value) in [
            ("batch_size", self.batch_size),
            ("max_errors", self.max_errors),
            ("first_row", self.first_row),
            ("last_row", self.last_row),
            ("code_page", self.code_page),
        ] {
            if value.is_some_and(|v| v < 0) {
                return invalid(format!("{name} must be non-negative"));
            }
        }
        if let (Some(first), Some(last)) = (self.first_row, self.last_row) {
            if first > last {
                return invalid("first_row cannot be greater than last_row".to_string());
            }
        }
        for col in &self.columns {
            if col.file_column <= 0 || col.server_column <= 0 {
                return invalid("column positions must be 1-based".to_string());
            }
            if col.prefix_len < 0 || col.data_len < 0 {
                return invalid("prefix_len and data_len must be non-negative".to_string());
            }
        }
        Ok(())
    }
}
