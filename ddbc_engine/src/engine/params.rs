//! Parameter descriptors and the buffers bound for one execution.

use super::buffer::AlignedBuffer;
use super::value::{date_to_sql, time_to_sql, timestamp_to_sql, Value};
use crate::driver::sql::*;
use crate::driver::{HandleKind, ParameterBinding, RawHandle, ReturnCode};
use crate::error::{DdbcError, ErrorInfo, Result};
use crate::handles::{collect_diagnostics, DriverHandle};
use std::ffi::c_void;
use std::ptr;

/// Wide strings longer than this are sent as `SQL_WLONGVARCHAR`.
const MAX_INLINE_WCHARS: usize = 4000;
/// Binary values longer than this are sent as `SQL_LONGVARBINARY`.
const MAX_INLINE_BYTES: usize = 8000;

/// How one parameter is bound: direction, C type of the buffer, SQL type of
/// the target, column size and decimal digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamInfo {
    pub direction: i16,
    pub c_type: i16,
    pub sql_type: i16,
    pub column_size: usize,
    pub decimal_digits: i16,
}

impl ParamInfo {
    pub fn new(c_type: i16, sql_type: i16) -> Self {
        Self {
            direction: SQL_PARAM_INPUT,
            c_type,
            sql_type,
            column_size: 0,
            decimal_digits: 0,
        }
    }

    #[must_use]
    pub fn size(mut self, column_size: usize, decimal_digits: i16) -> Self {
        self.column_size = column_size;
        self.decimal_digits = decimal_digits;
        self
    }

    #[must_use]
    pub fn direction(mut self, direction: i16) -> Self {
        self.direction = direction;
        self
    }

    /// Descriptor matching the value's own kind.
    pub fn infer(value: &Value) -> Self {
        match value {
            Value::Null => Self::new(SQL_C_DEFAULT, SQL_VARCHAR).size(1, 0),
            Value::Bool(_) => Self::new(SQL_C_BIT, SQL_BIT).size(1, 0),
            Value::Int(v) if i32::try_from(*v).is_ok() => {
                Self::new(SQL_C_SLONG, SQL_INTEGER).size(10, 0)
            }
            Value::Int(_) => Self::new(SQL_C_SBIGINT, SQL_BIGINT).size(19, 0),
            Value::Float(_) => Self::new(SQL_C_DOUBLE, SQL_DOUBLE).size(15, 0),
            Value::Text(s) => {
                let units = s.encode_utf16().count().max(1);
                if units > MAX_INLINE_WCHARS {
                    Self::new(SQL_C_WCHAR, SQL_WLONGVARCHAR).size(units, 0)
                } else {
                    Self::new(SQL_C_WCHAR, SQL_WVARCHAR).size(units, 0)
                }
            }
            Value::Bytes(b) => {
                let len = b.len().max(1);
                if len > MAX_INLINE_BYTES {
                    Self::new(SQL_C_BINARY, SQL_LONGVARBINARY).size(len, 0)
                } else {
                    Self::new(SQL_C_BINARY, SQL_VARBINARY).size(len, 0)
                }
            }
            Value::Date(_) => Self::new(SQL_C_TYPE_DATE, SQL_TYPE_DATE).size(10, 0),
            Value::Time(_) => Self::new(SQL_C_TYPE_TIME, SQL_TYPE_TIME).size(8, 0),
            Value::Timestamp(_) => Self::new(SQL_C_TYPE_TIMESTAMP, SQL_TYPE_TIMESTAMP).size(26, 6),
            Value::Numeric(n) => Self::new(SQL_C_NUMERIC, SQL_NUMERIC)
                .size(usize::from(n.precision), i16::from(n.scale)),
        }
    }

    /// One descriptor per column of a batch, each inferred from the first
    /// non-null value in that column.
    pub fn infer_columns(rows: &[Vec<Value>]) -> Vec<ParamInfo> {
        let width = rows.first().map(Vec::len).unwrap_or(0);
        (0..width)
            .map(|col| {
                rows.iter()
                    .filter_map(|row| row.get(col))
                    .find(|v| !v.is_null())
                    .map(ParamInfo::infer)
                    .unwrap_or_else(|| ParamInfo::infer(&Value::Null))
            })
            .collect()
    }
}

/// Owned buffer plus length/indicator cell for one parameter.
struct BoundParam {
    info: ParamInfo,
    data: Option<AlignedBuffer>,
    indicator: Box<isize>,
    buffer_length: isize,
}

/// Buffers backing every parameter of one execution. The set must outlive
/// the `execute` call that reads them; dropping it releases every buffer at
/// once.
pub struct ParamBufferSet {
    params: Vec<BoundParam>,
}

fn mismatch(param_index: usize, c_type: i16) -> DdbcError {
    DdbcError::TypeMismatch {
        param_index,
        c_type: c_type_name(c_type),
        row: None,
    }
}

/// Integral or floating value narrowed or widened to the target width.
fn numeric_bytes(c_type: i16, value: &Value) -> Option<Vec<u8>> {
    let (int, float) = match value {
        Value::Int(v) => (*v, *v as f64),
        Value::Float(v) => (*v as i64, *v),
        _ => return None,
    };
    let bytes = match c_type {
        SQL_C_TINYINT | SQL_C_STINYINT => (int as i8).to_ne_bytes().to_vec(),
        SQL_C_UTINYINT => (int as u8).to_ne_bytes().to_vec(),
        SQL_C_SHORT | SQL_C_SSHORT => (int as i16).to_ne_bytes().to_vec(),
        SQL_C_USHORT => (int as u16).to_ne_bytes().to_vec(),
        SQL_C_LONG | SQL_C_SLONG => (int as i32).to_ne_bytes().to_vec(),
        SQL_C_ULONG => (int as u32).to_ne_bytes().to_vec(),
        SQL_C_SBIGINT => int.to_ne_bytes().to_vec(),
        SQL_C_UBIGINT => (int as u64).to_ne_bytes().to_vec(),
        SQL_C_FLOAT => (float as f32).to_ne_bytes().to_vec(),
        SQL_C_DOUBLE => float.to_ne_bytes().to_vec(),
        _ => return None,
    };
    Some(bytes)
}

fn is_numeric_c_type(c_type: i16) -> bool {
    matches!(
        c_type,
        SQL_C_TINYINT
            | SQL_C_STINYINT
            | SQL_C_UTINYINT
            | SQL_C_SHORT
            | SQL_C_SSHORT
            | SQL_C_USHORT
            | SQL_C_LONG
            | SQL_C_SLONG
            | SQL_C_ULONG
            | SQL_C_SBIGINT
            | SQL_C_UBIGINT
            | SQL_C_FLOAT
            | SQL_C_DOUBLE
    )
}

/// Buffer contents, indicator and buffer length for one non-null value.
fn encode(index: usize, info: &ParamInfo, value: &Value) -> Result<(Vec<u8>, isize, isize)> {
    let fixed = |bytes: Vec<u8>| -> Result<(Vec<u8>, isize, isize)> {
        let len = bytes.len() as isize;
        Ok((bytes, len, len))
    };
    match info.c_type {
        SQL_C_CHAR => {
            let mut bytes = match value {
                Value::Text(s) => s.as_bytes().to_vec(),
                Value::Bytes(b) => b.clone(),
                _ => return Err(mismatch(index, info.c_type)),
            };
            let len = bytes.len() as isize;
            bytes.push(0);
            Ok((bytes, len, len + 1))
        }
        SQL_C_WCHAR => {
            let text = match value {
                Value::Text(s) => s.clone(),
                Value::Bytes(b) => match std::str::from_utf8(b) {
                    Ok(s) => s.to_string(),
                    Err(_) => return Err(mismatch(index, info.c_type)),
                },
                _ => return Err(mismatch(index, info.c_type)),
            };
            let mut bytes: Vec<u8> = text.encode_utf16().flat_map(u16::to_ne_bytes).collect();
            let len = bytes.len() as isize;
            bytes.extend_from_slice(&[0, 0]);
            Ok((bytes, len, len + 2))
        }
        SQL_C_BINARY => match value {
            Value::Bytes(b) => fixed(b.clone()),
            Value::Text(s) => fixed(s.as_bytes().to_vec()),
            _ => Err(mismatch(index, info.c_type)),
        },
        SQL_C_BIT => match value {
            Value::Bool(b) => fixed(vec![u8::from(*b)]),
            _ => Err(mismatch(index, info.c_type)),
        },
        SQL_C_TYPE_DATE => match value {
            Value::Date(d) => fixed(date_to_sql(d).to_bytes()),
            _ => Err(mismatch(index, info.c_type)),
        },
        SQL_C_TYPE_TIME => match value {
            Value::Time(t) => fixed(time_to_sql(t).to_bytes()),
            _ => Err(mismatch(index, info.c_type)),
        },
        SQL_C_TYPE_TIMESTAMP => match value {
            Value::Timestamp(ts) => fixed(timestamp_to_sql(ts).to_bytes()),
            _ => Err(mismatch(index, info.c_type)),
        },
        SQL_C_NUMERIC => match value {
            Value::Numeric(n) => fixed(n.to_sql().to_bytes()),
            _ => Err(mismatch(index, info.c_type)),
        },
        c if is_numeric_c_type(c) => match numeric_bytes(c, value) {
            Some(bytes) => fixed(bytes),
            None => Err(mismatch(index, info.c_type)),
        },
        other => Err(DdbcError::InvalidArgument(format!(
            "Unsupported C type {other} for parameter {index}"
        ))),
    }
}

impl ParamBufferSet {
    /// Type-checks every value against its descriptor and copies it into an
    /// owned buffer. Nothing is sent to the driver here, so a mismatch in
    /// any parameter leaves the statement untouched.
    pub fn build(params: &[Value], infos: &[ParamInfo]) -> Result<Self> {
        if params.len() != infos.len() {
            return Err(DdbcError::InvalidArgument(format!(
                "Number of parameter descriptors ({}) does not match number of parameters ({})",
                infos.len(),
                params.len()
            )));
        }
        let mut bound = Vec::with_capacity(params.len());
        for (index, (value, info)) in params.iter().zip(infos).enumerate() {
            if value.is_null() {
                bound.push(BoundParam {
                    info: *info,
                    data: None,
                    indicator: Box::new(SQL_NULL_DATA),
                    buffer_length: 0,
                });
                continue;
            }
            let info = if info.c_type == SQL_C_DEFAULT {
                ParamInfo::infer(value).direction(info.direction)
            } else {
                *info
            };
            let (bytes, indicator, buffer_length) = encode(index, &info, value)?;
            bound.push(BoundParam {
                info,
                data: Some(AlignedBuffer::from_bytes(&bytes)),
                indicator: Box::new(indicator),
                buffer_length,
            });
        }
        Ok(Self { params: bound })
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Binds every buffer to `stmt`, replacing earlier bindings. Numeric
    /// parameters also get their descriptor record updated, which the driver
    /// requires for precision and scale to take effect.
    pub fn bind(&mut self, stmt: &DriverHandle) -> Result<()> {
        let api = stmt.api().clone();
        let raw = stmt.raw();
        stmt.check(api.reset_params(raw), execution)?;

        for (index, param) in self.params.iter_mut().enumerate() {
            let number = u16::try_from(index + 1).map_err(|_| {
                DdbcError::InvalidArgument(format!("Too many parameters: {}", index + 1))
            })?;
            let value_ptr = match param.data.as_mut() {
                Some(data) => data.as_mut_ptr(),
                None => ptr::null_mut(),
            };
            let binding = ParameterBinding {
                io_type: param.info.direction,
                c_type: param.info.c_type,
                sql_type: param.info.sql_type,
                column_size: param.info.column_size,
                decimal_digits: param.info.decimal_digits,
                value_ptr,
                buffer_length: param.buffer_length,
                indicator_ptr: &mut *param.indicator as *mut isize,
            };
            // SAFETY: the buffers are owned by `self`, which the caller keeps
            // alive until `execute` has returned.
            let ret = unsafe { api.bind_parameter(raw, number, &binding) };
            stmt.check(ret, execution)?;

            if param.info.c_type == SQL_C_NUMERIC && !value_ptr.is_null() {
                bind_numeric_descriptor(stmt, number, &param.info, value_ptr)?;
            }
        }
        Ok(())
    }

    /// Clears the parameter bindings of `stmt`, then releases the buffers
    /// they pointed at.
    pub fn unbind(self, stmt: &DriverHandle) -> Result<()> {
        stmt.check(stmt.api().reset_params(stmt.raw()), execution)
    }
}

fn execution(info: ErrorInfo) -> DdbcError {
    DdbcError::Execution { info, row: None }
}

fn bind_numeric_descriptor(
    stmt: &DriverHandle,
    record: u16,
    info: &ParamInfo,
    data: *mut c_void,
) -> Result<()> {
    let api = stmt.api();
    let mut desc = RawHandle::NULL;
    stmt.check(api.get_app_param_desc(stmt.raw(), &mut desc), execution)?;

    let record = record as i16;
    let fields: [(i16, *mut c_void); 4] = [
        (SQL_DESC_TYPE, SQL_C_NUMERIC as isize as *mut c_void),
        (SQL_DESC_PRECISION, info.column_size as *mut c_void),
        (SQL_DESC_SCALE, info.decimal_digits as isize as *mut c_void),
        (SQL_DESC_DATA_PTR, data),
    ];
    for (field, value) in fields {
        // SAFETY: `data` points into a buffer owned by the parameter set that
        // stays alive until `execute` has returned; the other fields are
        // passed by value.
        let ret = unsafe { api.set_desc_field(desc, record, field, value, 0) };
        if !ret.succeeded() {
            let records = collect_diagnostics(&**api, HandleKind::Descriptor, desc);
            return Err(execution(ErrorInfo::from_records(&records)));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::value::Numeric;

    #[test]
    fn test_infer_int_widths() {
        assert_eq!(ParamInfo::infer(&Value::Int(7)).c_type, SQL_C_SLONG);
        assert_eq!(ParamInfo::infer(&Value::Int(1 << 40)).c_type, SQL_C_SBIGINT);
        assert_eq!(ParamInfo::infer(&Value::Null).c_type, SQL_C_DEFAULT);
    }

    #[test]
    fn test_infer_long_text_uses_long_type() {
        let long = Value::Text("x".repeat(5000));
        let info = ParamInfo::infer(&long);
        assert_eq!(info.sql_type, SQL_WLONGVARCHAR);
        assert_eq!(info.column_size, 5000);
    }

    #[test]
    fn test_infer_columns_skips_leading_nulls() {
        let rows = vec![
            vec![Value::Null, Value::Int(1)],
            vec![Value::Text("a".into()), Value::Int(2)],
        ];
        let infos = ParamInfo::infer_columns(&rows);
        assert_eq!(infos[0].c_type, SQL_C_WCHAR);
        assert_eq!(infos[1].c_type, SQL_C_SLONG);
    }

    #[test]
    fn test_text_for_integer_slot_is_mismatch() {
        let infos = [
            ParamInfo::new(SQL_C_WCHAR, SQL_WVARCHAR),
            ParamInfo::new(SQL_C_LONG, SQL_INTEGER),
        ];
        let err = ParamBufferSet::build(&[Value::from("a"), Value::from("b")], &infos)
            .err()
            .unwrap();
        match err {
            DdbcError::TypeMismatch {
                param_index,
                c_type,
                row,
            } => {
                assert_eq!(param_index, 1);
                assert_eq!(c_type, "SQL_C_LONG");
                assert_eq!(row, None);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_numeric_c_types_accept_int_and_float() {
        let infos = [
            ParamInfo::new(SQL_C_DOUBLE, SQL_DOUBLE),
            ParamInfo::new(SQL_C_SSHORT, SQL_SMALLINT),
        ];
        let set = ParamBufferSet::build(&[Value::Int(3), Value::Float(12.9)], &infos).unwrap();
        let first = set.params[0].data.as_ref().unwrap();
        assert_eq!(first.as_bytes(), &3.0f64.to_ne_bytes());
        let second = set.params[1].data.as_ref().unwrap();
        assert_eq!(second.as_bytes(), &12i16.to_ne_bytes());
    }

    fn mismatched_index(values: &[Value], infos: &[ParamInfo]) -> Option<usize> {
        match ParamBufferSet::build(values, infos) {
            Err(DdbcError::TypeMismatch { param_index, .. }) => Some(param_index),
            _ => None,
        }
    }

    #[test]
    fn test_date_for_timestamp_slot_is_mismatch() {
        let date = chrono::NaiveDate::from_ymd_opt(2024, 2, 29).unwrap();
        let infos = [ParamInfo::new(SQL_C_TYPE_TIMESTAMP, SQL_TYPE_TIMESTAMP).size(26, 6)];
        assert_eq!(mismatched_index(&[Value::Date(date)], &infos), Some(0));
    }

    #[test]
    fn test_timestamp_for_date_slot_is_mismatch() {
        let ts = chrono::NaiveDate::from_ymd_opt(2024, 2, 29)
            .unwrap()
            .and_hms_opt(12, 30, 0)
            .unwrap();
        let infos = [ParamInfo::new(SQL_C_TYPE_DATE, SQL_TYPE_DATE)];
        assert_eq!(mismatched_index(&[Value::Timestamp(ts)], &infos), Some(0));
    }

    #[test]
    fn test_int_for_bit_slot_is_mismatch() {
        let infos = [ParamInfo::new(SQL_C_BIT, SQL_BIT)];
        assert_eq!(mismatched_index(&[Value::Int(5)], &infos), Some(0));
        let set = ParamBufferSet::build(&[Value::Bool(true)], &infos).unwrap();
        assert_eq!(set.params[0].data.as_ref().unwrap().as_bytes(), &[1]);
    }

    #[test]
    fn test_invalid_utf8_for_wchar_slot_is_mismatch() {
        let infos = [ParamInfo::new(SQL_C_WCHAR, SQL_WVARCHAR)];
        let bytes = Value::Bytes(vec![0xff, 0xfe, 0x41]);
        assert_eq!(mismatched_index(&[bytes], &infos), Some(0));
        let set = ParamBufferSet::build(&[Value::Bytes(b"ok".to_vec())], &infos).unwrap();
        assert_eq!(*set.params[0].indicator, 4);
    }

    #[test]
    fn test_bool_for_integer_slot_is_mismatch() {
        let infos = [
            ParamInfo::new(SQL_C_SLONG, SQL_INTEGER),
            ParamInfo::new(SQL_C_DOUBLE, SQL_DOUBLE),
        ];
        assert_eq!(mismatched_index(&[Value::Int(1), Value::Bool(true)], &infos), Some(1));
        assert_eq!(mismatched_index(&[Value::Bool(false), Value::Float(1.0)], &infos), Some(0));
    }

    #[test]
    fn test_null_binds_without_buffer() {
        let infos = [ParamInfo::new(SQL_C_LONG, SQL_INTEGER)];
        let set = ParamBufferSet::build(&[Value::Null], &infos).unwrap();
        assert!(set.params[0].data.is_none());
        assert_eq!(*set.params[0].indicator, SQL_NULL_DATA);
    }

    #[test]
    fn test_wchar_indicator_is_byte_length_without_terminator() {
        let infos = [ParamInfo::new(SQL_C_WCHAR, SQL_WVARCHAR)];
        let set = ParamBufferSet::build(&[Value::from("héllo")], &infos).unwrap();
        assert_eq!(*set.params[0].indicator, 10);
        assert_eq!(set.params[0].buffer_length, 12);
    }

    #[test]
    fn test_default_c_type_infers_from_value() {
        let infos = [ParamInfo::new(SQL_C_DEFAULT, SQL_VARCHAR)];
        let value = Value::Numeric(Numeric::parse("12.50").unwrap());
        let set = ParamBufferSet::build(&[value], &infos).unwrap();
        assert_eq!(set.params[0].info.c_type, SQL_C_NUMERIC);
        assert_eq!(set.params[0].info.column_size, 4);
        assert_eq!(set.params[0].info.decimal_digits, 2);
    }

    #[test]
    fn test_length_mismatch_is_invalid_argument() {
        let err = ParamBufferSet::build(&[Value::Int(1)], &[]).err().unwrap();
        assert!(matches!(err, DdbcError::InvalidArgument(_)));
    }

    #[test]
    fn test_unknown_c_type_is_invalid_argument() {
        let infos = [ParamInfo::new(1234, SQL_INTEGER)];
        let err = ParamBufferSet::build(&[Value::Int(1)], &infos).err().unwrap();
        assert!(matches!(err, DdbcError::InvalidArgument(_)));
    }
}
