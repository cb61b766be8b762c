//! [`DriverApi`] backed by a driver shared library loaded at runtime.
//!
//! Entry points are resolved once, when the library is opened. Wide-character
//! (`W`) variants are used throughout; `SQLWCHAR` is UTF-16 on every
//! supported driver manager.

use super::{
    bcp_return, BcpBinding, BcpControlValue, ColumnAttributes, ColumnFormat, DriverApi,
    HandleKind, ParameterBinding, RawHandle, ReturnCode, SqlReturn,
};
use crate::error::{DdbcError, DiagnosticRecord, ErrorInfo, Result};
use libloading::Library;
use odbc_api::sys::{
    DriverConnectOption, FreeStmtOption, Handle, HandleType, Integer, Len, Pointer, SmallInt,
    SqlDataType, ULen, USmallInt, WChar, IS_INTEGER, IS_POINTER, IS_UINTEGER,
};
use std::ffi::c_void;
use std::path::{Path, PathBuf};
use std::ptr;

type AllocHandleFn = unsafe extern "system" fn(HandleType, Handle, *mut Handle) -> SqlReturn;
type FreeHandleFn = unsafe extern "system" fn(HandleType, Handle) -> SqlReturn;
type SetAttrFn = unsafe extern "system" fn(Handle, Integer, Pointer, Integer) -> SqlReturn;
type GetAttrFn = unsafe extern "system" fn(Handle, Integer, Pointer, Integer, *mut Integer) -> SqlReturn;
type DriverConnectFn = unsafe extern "system" fn(
    Handle,
    Pointer,
    *const WChar,
    SmallInt,
    *mut WChar,
    SmallInt,
    *mut SmallInt,
    DriverConnectOption,
) -> SqlReturn;
type HandleFn = unsafe extern "system" fn(Handle) -> SqlReturn;
type EndTranFn = unsafe extern "system" fn(HandleType, Handle, SmallInt) -> SqlReturn;
type GetDiagRecFn = unsafe extern "system" fn(
    HandleType,
    Handle,
    SmallInt,
    *mut WChar,
    *mut Integer,
    *mut WChar,
    SmallInt,
    *mut SmallInt,
) -> SqlReturn;
type SqlTextFn = unsafe extern "system" fn(Handle, *const WChar, Integer) -> SqlReturn;
type FreeStmtFn = unsafe extern "system" fn(Handle, FreeStmtOption) -> SqlReturn;
type BindParameterFn = unsafe extern "system" fn(
    Handle,
    USmallInt,
    SmallInt,
    SmallInt,
    SqlDataType,
    ULen,
    SmallInt,
    Pointer,
    Len,
    *mut Len,
) -> SqlReturn;
type SetDescFieldFn = unsafe extern "system" fn(Handle, SmallInt, SmallInt, Pointer, Integer) -> SqlReturn;
type RowCountFn = unsafe extern "system" fn(Handle, *mut Len) -> SqlReturn;
type NumResultColsFn = unsafe extern "system" fn(Handle, *mut SmallInt) -> SqlReturn;
type DescribeColFn = unsafe extern "system" fn(
    Handle,
    USmallInt,
    *mut WChar,
    SmallInt,
    *mut SmallInt,
    *mut SmallInt,
    *mut ULen,
    *mut SmallInt,
    *mut SmallInt,
) -> SqlReturn;
type GetDataFn =
    unsafe extern "system" fn(Handle, USmallInt, SmallInt, Pointer, Len, *mut Len) -> SqlReturn;

// Bulk-copy entry points return the msodbcsql `SUCCEED`/`FAIL` codes.
type BcpInitFn =
    unsafe extern "system" fn(Handle, *const WChar, *const WChar, *const WChar, Integer) -> i16;
type BcpControlFn = unsafe extern "system" fn(Handle, Integer, Pointer) -> i16;
type BcpSetBulkModeFn =
    unsafe extern "system" fn(Handle, Integer, *const c_void, Integer, *const c_void, Integer) -> i16;
type BcpReadFmtFn = unsafe extern "system" fn(Handle, *const WChar) -> i16;
type BcpColumnsFn = unsafe extern "system" fn(Handle, Integer) -> i16;
type BcpColFmtFn =
    unsafe extern "system" fn(Handle, Integer, u8, Integer, Integer, *const u8, Integer, Integer) -> i16;
type BcpBindFn =
    unsafe extern "system" fn(Handle, *const u8, Integer, Integer, *const u8, Integer, Integer, Integer) -> i16;
type BcpSendRowFn = unsafe extern "system" fn(Handle) -> i16;
type BcpExecFn = unsafe extern "system" fn(Handle, *mut Integer) -> i16;
type BcpDoneFn = unsafe extern "system" fn(Handle) -> Integer;

struct Entries {
    alloc_handle: AllocHandleFn,
    free_handle: FreeHandleFn,
    set_env_attr: SetAttrFn,
    set_connect_attr: SetAttrFn,
    get_connect_attr: GetAttrFn,
    driver_connect: DriverConnectFn,
    disconnect: HandleFn,
    end_tran: EndTranFn,
    get_diag_rec: GetDiagRecFn,
    exec_direct: SqlTextFn,
    prepare: SqlTextFn,
    execute: HandleFn,
    free_stmt: FreeStmtFn,
    bind_parameter: BindParameterFn,
    get_stmt_attr: GetAttrFn,
    set_desc_field: SetDescFieldFn,
    row_count: RowCountFn,
    num_result_cols: NumResultColsFn,
    describe_col: DescribeColFn,
    fetch: HandleFn,
    get_data: GetDataFn,
    more_results: HandleFn,
    bcp_init: BcpInitFn,
    bcp_control: BcpControlFn,
    bcp_set_bulk_mode: BcpSetBulkModeFn,
    bcp_read_fmt: BcpReadFmtFn,
    bcp_columns: BcpColumnsFn,
    bcp_col_fmt: BcpColFmtFn,
    bcp_bind: BcpBindFn,
    bcp_send_row: BcpSendRowFn,
    bcp_exec: BcpExecFn,
    bcp_done: BcpDoneFn,
}

/// A loaded driver library and its resolved entry points.
pub struct DriverLibrary {
    path: PathBuf,
    entries: Entries,
    // Declared last so the entry points never outlive the mapping.
    _library: Library,
}

fn load_error(path: &Path, err: libloading::Error) -> DdbcError {
    DdbcError::Config(ErrorInfo::message(format!(
        "Failed to load driver library {}: {}",
        path.display(),
        err
    )))
}

impl DriverLibrary {
    /// Opens the library at `path` and resolves every entry point the engine
    /// uses. Fails with a configuration error naming the first missing symbol.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        // SAFETY: loading a driver runs its initializers; the caller chose the path.
        let library = unsafe { Library::new(path) }.map_err(|e| load_error(path, e))?;

        macro_rules! sym {
            ($ty:ty, $name:literal) => {
                // SAFETY: the type alias matches the documented C prototype.
                *unsafe { library.get::<$ty>($name) }.map_err(|e| load_error(path, e))?
            };
        }

        let entries = Entries {
            alloc_handle: sym!(AllocHandleFn, b"SQLAllocHandle\0"),
            free_handle: sym!(FreeHandleFn, b"SQLFreeHandle\0"),
            set_env_attr: sym!(SetAttrFn, b"SQLSetEnvAttr\0"),
            set_connect_attr: sym!(SetAttrFn, b"SQLSetConnectAttrW\0"),
            get_connect_attr: sym!(GetAttrFn, b"SQLGetConnectAttrW\0"),
            driver_connect: sym!(DriverConnectFn, b"SQLDriverConnectW\0"),
            disconnect: sym!(HandleFn, b"SQLDisconnect\0"),
            end_tran: sym!(EndTranFn, b"SQLEndTran\0"),
            get_diag_rec: sym!(GetDiagRecFn, b"SQLGetDiagRecW\0"),
            exec_direct: sym!(SqlTextFn, b"SQLExecDirectW\0"),
            prepare: sym!(SqlTextFn, b"SQLPrepareW\0"),
            execute: sym!(HandleFn, b"SQLExecute\0"),
            free_stmt: sym!(FreeStmtFn, b"SQLFreeStmt\0"),
            bind_parameter: sym!(BindParameterFn, b"SQLBindParameter\0"),
            get_stmt_attr: sym!(GetAttrFn, b"SQLGetStmtAttrW\0"),
            set_desc_field: sym!(SetDescFieldFn, b"SQLSetDescFieldW\0"),
            row_count: sym!(RowCountFn, b"SQLRowCount\0"),
            num_result_cols: sym!(NumResultColsFn, b"SQLNumResultCols\0"),
            describe_col: sym!(DescribeColFn, b"SQLDescribeColW\0"),
            fetch: sym!(HandleFn, b"SQLFetch\0"),
            get_data: sym!(GetDataFn, b"SQLGetData\0"),
            more_results: sym!(HandleFn, b"SQLMoreResults\0"),
            bcp_init: sym!(BcpInitFn, b"bcp_initW\0"),
            bcp_control: sym!(BcpControlFn, b"bcp_control\0"),
            bcp_set_bulk_mode: sym!(BcpSetBulkModeFn, b"bcp_setbulkmode\0"),
            bcp_read_fmt: sym!(BcpReadFmtFn, b"bcp_readfmtW\0"),
            bcp_columns: sym!(BcpColumnsFn, b"bcp_columns\0"),
            bcp_col_fmt: sym!(BcpColFmtFn, b"bcp_colfmt\0"),
            bcp_bind: sym!(BcpBindFn, b"bcp_bind\0"),
            bcp_send_row: sym!(BcpSendRowFn, b"bcp_sendrow\0"),
            bcp_exec: sym!(BcpExecFn, b"bcp_exec\0"),
            bcp_done: sym!(BcpDoneFn, b"bcp_done\0"),
        };

        log::info!("Loaded driver library {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            entries,
            _library: library,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn h(handle: RawHandle) -> Handle {
    handle.0 as Handle
}

fn wide(text: &str) -> Vec<u16> {
    text.encode_utf16().chain(std::iter::once(0)).collect()
}

fn wide_ptr(text: &Option<Vec<u16>>) -> *const u16 {
    text.as_ref().map(|t| t.as_ptr()).unwrap_or(ptr::null())
}

fn from_wide(units: &[u16]) -> String {
    let end = units.iter().position(|u| *u == 0).unwrap_or(units.len());
    String::from_utf16_lossy(&units[..end])
}

impl DriverApi for DriverLibrary {
    fn alloc_handle(&self, kind: HandleKind, parent: RawHandle, out: &mut RawHandle) -> SqlReturn {
        let mut raw: Handle = ptr::null_mut();
        // SAFETY: `raw` is a local the driver writes the new handle into.
        let ret = unsafe { (self.entries.alloc_handle)(kind.handle_type(), h(parent), &mut raw) };
        *out = RawHandle(raw as usize);
        ret
    }

    fn free_handle(&self, kind: HandleKind, handle: RawHandle) -> SqlReturn {
        // SAFETY: the handle was allocated by this library with the same kind.
        unsafe { (self.entries.free_handle)(kind.handle_type(), h(handle)) }
    }

    fn set_env_attr(&self, env: RawHandle, attribute: i32, value: usize) -> SqlReturn {
        // SAFETY: integer attributes are passed by value in the pointer slot.
        unsafe { (self.entries.set_env_attr)(h(env), attribute, value as Pointer, IS_INTEGER) }
    }

    fn set_connect_attr(&self, dbc: RawHandle, attribute: i32, value: usize) -> SqlReturn {
        // SAFETY: integer attributes are passed by value in the pointer slot.
        unsafe { (self.entries.set_connect_attr)(h(dbc), attribute, value as Pointer, IS_UINTEGER) }
    }

    fn get_connect_attr(&self, dbc: RawHandle, attribute: i32, value: &mut usize) -> SqlReturn {
        let mut len: Integer = 0;
        // SAFETY: `value` is a live, pointer-sized integer for the driver to fill.
        unsafe {
            (self.entries.get_connect_attr)(
                h(dbc),
                attribute,
                value as *mut usize as Pointer,
                IS_UINTEGER,
                &mut len,
            )
        }
    }

    fn driver_connect(&self, dbc: RawHandle, connection_string: &str) -> SqlReturn {
        let text = wide(connection_string);
        let mut out_len: SmallInt = 0;
        // SAFETY: `text` is NUL-terminated and outlives the call; no output
        // buffer is requested.
        unsafe {
            (self.entries.driver_connect)(
                h(dbc),
                ptr::null_mut(),
                text.as_ptr(),
                (text.len() - 1) as SmallInt,
                ptr::null_mut(),
                0,
                &mut out_len,
                DriverConnectOption::NoPrompt,
            )
        }
    }

    fn disconnect(&self, dbc: RawHandle) -> SqlReturn {
        // SAFETY: plain handle argument.
        unsafe { (self.entries.disconnect)(h(dbc)) }
    }

    fn end_tran(&self, kind: HandleKind, handle: RawHandle, completion: i16) -> SqlReturn {
        // SAFETY: plain handle and code arguments.
        unsafe { (self.entries.end_tran)(kind.handle_type(), h(handle), completion) }
    }

    fn get_diag_rec(
        &self,
        kind: HandleKind,
        handle: RawHandle,
        record: i16,
        out: &mut DiagnosticRecord,
    ) -> SqlReturn {
        let mut state = [0u16; 6];
        let mut native: Integer = 0;
        let mut message = vec![0u16; 1024];
        let mut text_len: SmallInt = 0;
        loop {
            // SAFETY: every buffer is a live local whose length is passed
            // alongside it.
            let ret = unsafe {
                (self.entries.get_diag_rec)(
                    kind.handle_type(),
                    h(handle),
                    record,
                    state.as_mut_ptr(),
                    &mut native,
                    message.as_mut_ptr(),
                    message.len() as SmallInt,
                    &mut text_len,
                )
            };
            if !ret.succeeded() {
                return ret;
            }
            let needed = text_len.max(0) as usize + 1;
            if needed > message.len() && message.len() < i16::MAX as usize {
                message.resize(needed.min(i16::MAX as usize), 0);
                continue;
            }
            out.sql_state = from_wide(&state);
            out.native_error = native;
            out.message = from_wide(&message);
            return SqlReturn::SUCCESS;
        }
    }

    fn exec_direct(&self, stmt: RawHandle, sql: &str) -> SqlReturn {
        let text = wide(sql);
        // SAFETY: `text` outlives the call and its length excludes the NUL.
        unsafe { (self.entries.exec_direct)(h(stmt), text.as_ptr(), (text.len() - 1) as Integer) }
    }

    fn prepare(&self, stmt: RawHandle, sql: &str) -> SqlReturn {
        let text = wide(sql);
        // SAFETY: `text` outlives the call and its length excludes the NUL.
        unsafe { (self.entries.prepare)(h(stmt), text.as_ptr(), (text.len() - 1) as Integer) }
    }

    fn execute(&self, stmt: RawHandle) -> SqlReturn {
        // SAFETY: bound buffers are kept alive by the caller until this returns.
        unsafe { (self.entries.execute)(h(stmt)) }
    }

    fn free_stmt_close(&self, stmt: RawHandle) -> SqlReturn {
        // SAFETY: plain handle argument.
        unsafe { (self.entries.free_stmt)(h(stmt), FreeStmtOption::Close) }
    }

    fn reset_params(&self, stmt: RawHandle) -> SqlReturn {
        // SAFETY: plain handle argument.
        unsafe { (self.entries.free_stmt)(h(stmt), FreeStmtOption::ResetParams) }
    }

    unsafe fn bind_parameter(
        &self,
        stmt: RawHandle,
        number: u16,
        b: &ParameterBinding,
    ) -> SqlReturn {
        // SAFETY: buffer lifetimes are the caller's obligation, see `DriverApi`.
        unsafe {
            (self.entries.bind_parameter)(
                h(stmt),
                number,
                b.io_type,
                b.c_type,
                SqlDataType(b.sql_type),
                b.column_size,
                b.decimal_digits,
                b.value_ptr,
                b.buffer_length,
                b.indicator_ptr,
            )
        }
    }

    fn get_app_param_desc(&self, stmt: RawHandle, out: &mut RawHandle) -> SqlReturn {
        let mut desc: Handle = ptr::null_mut();
        let mut len: Integer = 0;
        // SAFETY: `desc` is a live local sized for a handle.
        let ret = unsafe {
            (self.entries.get_stmt_attr)(
                h(stmt),
                super::sql::SQL_ATTR_APP_PARAM_DESC,
                &mut desc as *mut Handle as Pointer,
                IS_POINTER,
                &mut len,
            )
        };
        *out = RawHandle(desc as usize);
        ret
    }

    unsafe fn set_desc_field(
        &self,
        desc: RawHandle,
        record: i16,
        field: i16,
        value: *mut c_void,
        length: i32,
    ) -> SqlReturn {
        // SAFETY: pointer-valued fields are the caller's obligation, see `DriverApi`.
        unsafe { (self.entries.set_desc_field)(h(desc), record, field, value, length) }
    }

    fn row_count(&self, stmt: RawHandle, out: &mut isize) -> SqlReturn {
        // SAFETY: `out` is a live reference for the driver to fill.
        unsafe { (self.entries.row_count)(h(stmt), out) }
    }

    fn num_result_cols(&self, stmt: RawHandle, out: &mut i16) -> SqlReturn {
        // SAFETY: `out` is a live reference for the driver to fill.
        unsafe { (self.entries.num_result_cols)(h(stmt), out) }
    }

    fn describe_col(&self, stmt: RawHandle, column: u16, out: &mut ColumnAttributes) -> SqlReturn {
        let mut name = vec![0u16; 256];
        loop {
            let mut name_len: SmallInt = 0;
            // SAFETY: `name` is live with its length passed alongside; the
            // other out-params are fields of `out`.
            let ret = unsafe {
                (self.entries.describe_col)(
                    h(stmt),
                    column,
                    name.as_mut_ptr(),
                    name.len() as SmallInt,
                    &mut name_len,
                    &mut out.data_type,
                    &mut out.column_size,
                    &mut out.decimal_digits,
                    &mut out.nullable,
                )
            };
            if !ret.succeeded() {
                return ret;
            }
            let needed = name_len.max(0) as usize + 1;
            if needed > name.len() {
                name.resize(needed, 0);
                continue;
            }
            out.name = from_wide(&name);
            return ret;
        }
    }

    fn fetch(&self, stmt: RawHandle) -> SqlReturn {
        // SAFETY: plain handle argument; no columns are bound.
        unsafe { (self.entries.fetch)(h(stmt)) }
    }

    fn get_data(
        &self,
        stmt: RawHandle,
        column: u16,
        c_type: i16,
        target: &mut [u8],
        indicator: &mut isize,
    ) -> SqlReturn {
        let data = if target.is_empty() {
            ptr::null_mut()
        } else {
            target.as_mut_ptr() as Pointer
        };
        // SAFETY: the driver writes at most `target.len()` bytes into `target`.
        unsafe {
            (self.entries.get_data)(h(stmt), column, c_type, data, target.len() as Len, indicator)
        }
    }

    fn more_results(&self, stmt: RawHandle) -> SqlReturn {
        // SAFETY: plain handle argument.
        unsafe { (self.entries.more_results)(h(stmt)) }
    }

    fn bcp_init(
        &self,
        dbc: RawHandle,
        table: &str,
        data_file: Option<&str>,
        error_file: Option<&str>,
        direction: i32,
    ) -> SqlReturn {
        let table = wide(table);
        let data_file = data_file.map(wide);
        let error_file = error_file.map(wide);
        // SAFETY: every string is NUL-terminated and outlives the call; absent
        // files are passed as null.
        bcp_return(i32::from(unsafe {
            (self.entries.bcp_init)(
                h(dbc),
                table.as_ptr(),
                wide_ptr(&data_file),
                wide_ptr(&error_file),
                direction,
            )
        }))
    }

    fn bcp_control(&self, dbc: RawHandle, option: i32, value: BcpControlValue<'_>) -> SqlReturn {
        let ret = match value {
            // SAFETY: integer options are passed by value in the pointer slot.
            BcpControlValue::Int(v) => unsafe {
                (self.entries.bcp_control)(h(dbc), option, v as isize as Pointer)
            },
            BcpControlValue::Text(t) => {
                let text = wide(t);
                // SAFETY: the driver copies the NUL-terminated text during the call.
                unsafe { (self.entries.bcp_control)(h(dbc), option, text.as_ptr() as Pointer) }
            }
        };
        bcp_return(i32::from(ret))
    }

    fn bcp_set_bulk_mode(
        &self,
        dbc: RawHandle,
        mode: i32,
        field_terminator: Option<&[u8]>,
        row_terminator: Option<&[u8]>,
    ) -> SqlReturn {
        let (field_ptr, field_len) = field_terminator
            .map(|t| (t.as_ptr() as *const c_void, t.len() as Integer))
            .unwrap_or((ptr::null(), 0));
        let (row_ptr, row_len) = row_terminator
            .map(|t| (t.as_ptr() as *const c_void, t.len() as Integer))
            .unwrap_or((ptr::null(), 0));
        // SAFETY: terminators are borrowed for the call with their lengths.
        bcp_return(i32::from(unsafe {
            (self.entries.bcp_set_bulk_mode)(h(dbc), mode, field_ptr, field_len, row_ptr, row_len)
        }))
    }

    fn bcp_read_fmt(&self, dbc: RawHandle, path: &str) -> SqlReturn {
        let path = wide(path);
        // SAFETY: `path` is NUL-terminated and outlives the call.
        bcp_return(i32::from(unsafe { (self.entries.bcp_read_fmt)(h(dbc), path.as_ptr()) }))
    }

    fn bcp_columns(&self, dbc: RawHandle, count: i32) -> SqlReturn {
        // SAFETY: plain handle and count arguments.
        bcp_return(i32::from(unsafe { (self.entries.bcp_columns)(h(dbc), count) }))
    }

    fn bcp_col_fmt(&self, dbc: RawHandle, f: &ColumnFormat<'_>) -> SqlReturn {
        let (term, term_len) = f
            .terminator
            .map(|t| (t.as_ptr(), t.len() as Integer))
            .unwrap_or((ptr::null(), 0));
        // SAFETY: the terminator is borrowed for the call with its length.
        bcp_return(i32::from(unsafe {
            (self.entries.bcp_col_fmt)(
                h(dbc),
                f.file_column,
                f.user_data_type as u8,
                f.indicator_length,
                f.user_data_length,
                term,
                term_len,
                f.server_column,
            )
        }))
    }

    unsafe fn bcp_bind(&self, dbc: RawHandle, b: &BcpBinding) -> SqlReturn {
        // SAFETY: buffer lifetimes are the caller's obligation, see `DriverApi`.
        bcp_return(i32::from(unsafe {
            (self.entries.bcp_bind)(
                h(dbc),
                b.data,
                b.indicator_length,
                b.data_length,
                b.terminator,
                b.terminator_length,
                b.data_type,
                b.server_column,
            )
        }))
    }

    fn bcp_send_row(&self, dbc: RawHandle) -> SqlReturn {
        // SAFETY: the caller keeps every `bcp_bind` buffer alive across this call.
        bcp_return(i32::from(unsafe { (self.entries.bcp_send_row)(h(dbc)) }))
    }

    fn bcp_exec(&self, dbc: RawHandle, rows_copied: &mut i32) -> SqlReturn {
        // SAFETY: `rows_copied` is a live reference for the driver to fill.
        bcp_return(i32::from(unsafe { (self.entries.bcp_exec)(h(dbc), rows_copied) }))
    }

    fn bcp_done(&self, dbc: RawHandle, rows_committed: &mut i32) -> SqlReturn {
        // SAFETY: plain handle argument.
        let rows = unsafe { (self.entries.bcp_done)(h(dbc)) };
        if rows < 0 {
            return SqlReturn::ERROR;
        }
        *rows_committed = rows;
        SqlReturn::SUCCESS
    }
}
