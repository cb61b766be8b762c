//! The narrow function table the engine consumes.
//!
//! Everything above this module talks to the database client library only
//! through [`DriverApi`]. A backend may be a dynamically loaded driver
//! library (`native-driver` feature) or an in-process implementation such as
//! [`mock::MockDriver`].

#[cfg(feature = "native-driver")]
pub mod library;
#[cfg(any(test, feature = "test-helpers"))]
pub mod mock;
pub mod sql;

use crate::error::DiagnosticRecord;
use std::ffi::c_void;
use std::fmt;

pub use odbc_api::sys::{HandleType, SqlReturn};

/// Classification of a driver return code.
pub trait ReturnCode {
    /// `SQL_SUCCEEDED`: success or success with info.
    fn succeeded(self) -> bool;
    fn is_no_data(self) -> bool;
}

impl ReturnCode for SqlReturn {
    fn succeeded(self) -> bool {
        self == SqlReturn::SUCCESS || self == SqlReturn::SUCCESS_WITH_INFO
    }

    fn is_no_data(self) -> bool {
        self == SqlReturn::NO_DATA
    }
}

/// Maps a bulk-copy `SUCCEED`/`FAIL` result onto the ODBC codes.
pub fn bcp_return(code: i32) -> SqlReturn {
    if code == sql::SUCCEED {
        SqlReturn::SUCCESS
    } else {
        SqlReturn::ERROR
    }
}

/// Kind of driver handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleKind {
    Environment,
    Connection,
    Statement,
    Descriptor,
}

impl HandleKind {
    pub fn handle_type(self) -> HandleType {
        match self {
            HandleKind::Environment => HandleType::Env,
            HandleKind::Connection => HandleType::Dbc,
            HandleKind::Statement => HandleType::Stmt,
            HandleKind::Descriptor => HandleType::Desc,
        }
    }
}

impl fmt::Display for HandleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HandleKind::Environment => "environment",
            HandleKind::Connection => "connection",
            HandleKind::Statement => "statement",
            HandleKind::Descriptor => "descriptor",
        };
        f.write_str(name)
    }
}

/// Opaque handle value owned by the driver. Zero is the null handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RawHandle(pub usize);

impl RawHandle {
    pub const NULL: RawHandle = RawHandle(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// Column metadata as reported by `SQLDescribeCol`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColumnAttributes {
    pub name: String,
    pub data_type: i16,
    pub column_size: usize,
    pub decimal_digits: i16,
    pub nullable: i16,
}

/// Arguments of one `SQLBindParameter` call. The pointers must stay valid
/// until the statement has been executed.
#[derive(Debug, Clone, Copy)]
pub struct ParameterBinding {
    pub io_type: i16,
    pub c_type: i16,
    pub sql_type: i16,
    pub column_size: usize,
    pub decimal_digits: i16,
    pub value_ptr: *mut c_void,
    pub buffer_length: isize,
    pub indicator_ptr: *mut isize,
}

/// Value of a `bcp_control` call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BcpControlValue<'a> {
    Int(i64),
    Text(&'a str),
}

/// Arguments of one `bcp_colfmt` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnFormat<'a> {
    pub file_column: i32,
    pub user_data_type: i32,
    pub indicator_length: i32,
    pub user_data_length: i32,
    pub terminator: Option<&'a [u8]>,
    pub server_column: i32,
}

/// Arguments of one `bcp_bind` call. `data` (and `terminator` when present)
/// must stay valid until the row has been sent or the batch executed.
#[derive(Debug, Clone, Copy)]
pub struct BcpBinding {
    pub data: *const u8,
    pub indicator_length: i32,
    pub data_length: i32,
    pub terminator: *const u8,
    pub terminator_length: i32,
    pub data_type: i32,
    pub server_column: i32,
}

/// Driver function table.
///
/// Methods mirror the ODBC and SQL Server bulk-copy entry points one to one;
/// out-parameters are written through `&mut` references. Methods taking raw
/// buffer addresses that the driver dereferences after the call returns are
/// `unsafe`.
pub trait DriverApi: Send + Sync {
    fn alloc_handle(&self, kind: HandleKind, parent: RawHandle, out: &mut RawHandle) -> SqlReturn;
    fn free_handle(&self, kind: HandleKind, handle: RawHandle) -> SqlReturn;
    fn set_env_attr(&self, env: RawHandle, attribute: i32, value: usize) -> SqlReturn;
    fn set_connect_attr(&self, dbc: RawHandle, attribute: i32, value: usize) -> SqlReturn;
    fn get_connect_attr(&self, dbc: RawHandle, attribute: i32, value: &mut usize) -> SqlReturn;
    fn driver_connect(&self, dbc: RawHandle, connection_string: &str) -> SqlReturn;
    fn disconnect(&self, dbc: RawHandle) -> SqlReturn;
    fn end_tran(&self, kind: HandleKind, handle: RawHandle, completion: i16) -> SqlReturn;
    fn get_diag_rec(
        &self,
        kind: HandleKind,
        handle: RawHandle,
        record: i16,
        out: &mut DiagnosticRecord,
    ) -> SqlReturn;

    fn exec_direct(&self, stmt: RawHandle, sql: &str) -> SqlReturn;
    fn prepare(&self, stmt: RawHandle, sql: &str) -> SqlReturn;
    fn execute(&self, stmt: RawHandle) -> SqlReturn;
    fn free_stmt_close(&self, stmt: RawHandle) -> SqlReturn;
    fn reset_params(&self, stmt: RawHandle) -> SqlReturn;

    /// # Safety
    /// `binding.value_ptr` and `binding.indicator_ptr` must remain valid and
    /// unaliased until the next `execute` on `stmt` has returned.
    unsafe fn bind_parameter(&self, stmt: RawHandle, number: u16, binding: &ParameterBinding)
        -> SqlReturn;

    fn get_app_param_desc(&self, stmt: RawHandle, out: &mut RawHandle) -> SqlReturn;

    /// # Safety
    /// When `field` is `SQL_DESC_DATA_PTR`, `value` must remain valid until
    /// the next `execute` on the owning statement has returned.
    unsafe fn set_desc_field(
        &self,
        desc: RawHandle,
        record: i16,
        field: i16,
        value: *mut c_void,
        length: i32,
    ) -> SqlReturn;

    fn row_count(&self, stmt: RawHandle, out: &mut isize) -> SqlReturn;
    fn num_result_cols(&self, stmt: RawHandle, out: &mut i16) -> SqlReturn;
    fn describe_col(&self, stmt: RawHandle, column: u16, out: &mut ColumnAttributes) -> SqlReturn;
    fn fetch(&self, stmt: RawHandle) -> SqlReturn;
    fn get_data(
        &self,
        stmt: RawHandle,
        column: u16,
        c_type: i16,
        target: &mut [u8],
        indicator: &mut isize,
    ) -> SqlReturn;
    fn more_results(&self, stmt: RawHandle) -> SqlReturn;

    fn bcp_init(
        &self,
        dbc: RawHandle,
        table: &str,
        data_file: Option<&str>,
        error_file: Option<&str>,
        direction: i32,
    ) -> SqlReturn;
    fn bcp_control(&self, dbc: RawHandle, option: i32, value: BcpControlValue<'_>) -> SqlReturn;
    fn bcp_set_bulk_mode(
        &self,
        dbc: RawHandle,
        mode: i32,
        field_terminator: Option<&[u8]>,
        row_terminator: Option<&[u8]>,
    ) -> SqlReturn;
    fn bcp_read_fmt(&self, dbc: RawHandle, path: &str) -> SqlReturn;
    fn bcp_columns(&self, dbc: RawHandle, count: i32) -> SqlReturn;
    fn bcp_col_fmt(&self, dbc: RawHandle, format: &ColumnFormat<'_>) -> SqlReturn;

    /// # Safety
    /// `binding.data` and `binding.terminator` must remain valid until the
    /// row has been sent with `bcp_send_row` or transferred by `bcp_exec`.
    unsafe fn bcp_bind(&self, dbc: RawHandle, binding: &BcpBinding) -> SqlReturn;

    fn bcp_send_row(&self, dbc: RawHandle) -> SqlReturn;
    /// Returns `SUCCESS` or `ERROR`; `rows_copied` receives the copied row count.
    fn bcp_exec(&self, dbc: RawHandle, rows_copied: &mut i32) -> SqlReturn;
    /// `rows_committed` receives the rows committed by the final batch.
    fn bcp_done(&self, dbc: RawHandle, rows_committed: &mut i32) -> SqlReturn;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sql_return_succeeded() {
        assert!(SqlReturn::SUCCESS.succeeded());
        assert!(SqlReturn::SUCCESS_WITH_INFO.succeeded());
        assert!(!SqlReturn::NO_DATA.succeeded());
        assert!(!SqlReturn::ERROR.succeeded());
        assert!(SqlReturn::NO_DATA.is_no_data());
        assert!(!SqlReturn::SUCCESS.is_no_data());
    }

    #[test]
    fn test_bcp_codes_map_to_sql_return() {
        assert_eq!(bcp_return(sql::SUCCEED), SqlReturn::SUCCESS);
        assert_eq!(bcp_return(sql::FAIL), SqlReturn::ERROR);
    }

    #[test]
    fn test_handle_kind_codes() {
        assert_eq!(HandleKind::Environment.handle_type() as i16, 1);
        assert_eq!(HandleKind::Descriptor.handle_type() as i16, 4);
        assert_eq!(HandleKind::Statement.to_string(), "statement");
        assert!(RawHandle::NULL.is_null());
    }
}
