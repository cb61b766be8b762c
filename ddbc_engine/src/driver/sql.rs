//! Codes and C layouts shared with the driver.
//!
//! ODBC definitions come from `odbc_api::sys`; they are re-exported here as
//! plain integers so they can be used as match patterns. The SQL Server
//! bulk-copy codes (`msodbcsql.h`) are declared locally.

use odbc_api::sys::{
    CDataType, CompletionType, ConnectionAttribute, EnvironmentAttribute, Nullability, ParamType,
    SqlDataType, StatementAttribute,
};
use std::mem::size_of;
use std::ptr;

pub use odbc_api::sys::{Date, Numeric, Time, Timestamp, NO_TOTAL, NULL_DATA};

// Length / indicator sentinels
pub const SQL_NULL_DATA: isize = NULL_DATA;
pub const SQL_NO_TOTAL: isize = NO_TOTAL;
pub const SQL_VARLEN_DATA: i32 = -10;

// Environment attributes
pub const SQL_ATTR_ODBC_VERSION: i32 = EnvironmentAttribute::OdbcVersion as i32;
pub const SQL_OV_ODBC3_80: usize = 380;

// Connection attributes
pub const SQL_ATTR_AUTOCOMMIT: i32 = ConnectionAttribute::AUTOCOMMIT.0;
pub const SQL_ATTR_LOGIN_TIMEOUT: i32 = ConnectionAttribute::LOGIN_TIMEOUT.0;
pub const SQL_ATTR_CONNECTION_DEAD: i32 = ConnectionAttribute::CONNECTION_DEAD.0;
pub const SQL_COPT_SS_RESET_CONNECTION: i32 = 1204;
pub const SQL_COPT_SS_BCP: i32 = 1219;
pub const SQL_AUTOCOMMIT_OFF: usize = 0;
pub const SQL_AUTOCOMMIT_ON: usize = 1;
pub const SQL_CD_TRUE: usize = 1;
pub const SQL_RESET_CONNECTION_YES: usize = 1;
pub const SQL_BCP_OFF: usize = 0;
pub const SQL_BCP_ON: usize = 1;

// Statement attributes
pub const SQL_ATTR_APP_PARAM_DESC: i32 = StatementAttribute::AppParamDesc as i32;

// Transaction completion
pub const SQL_COMMIT: i16 = CompletionType::Commit as i16;
pub const SQL_ROLLBACK: i16 = CompletionType::Rollback as i16;

// Descriptor fields
pub const SQL_DESC_TYPE: i16 = 1002;
pub const SQL_DESC_PRECISION: i16 = 1005;
pub const SQL_DESC_SCALE: i16 = 1006;
pub const SQL_DESC_DATA_PTR: i16 = 1010;

// Parameter direction
pub const SQL_PARAM_INPUT: i16 = ParamType::Input as i16;
pub const SQL_PARAM_INPUT_OUTPUT: i16 = ParamType::InputOutput as i16;
pub const SQL_PARAM_OUTPUT: i16 = ParamType::Output as i16;

// Nullability
pub const SQL_NO_NULLS: i16 = Nullability::NO_NULLS.0;
pub const SQL_NULLABLE: i16 = Nullability::NULLABLE.0;

// SQL data types
pub const SQL_UNKNOWN_TYPE: i16 = SqlDataType::UNKNOWN_TYPE.0;
pub const SQL_CHAR: i16 = SqlDataType::CHAR.0;
pub const SQL_NUMERIC: i16 = SqlDataType::NUMERIC.0;
pub const SQL_DECIMAL: i16 = SqlDataType::DECIMAL.0;
pub const SQL_INTEGER: i16 = SqlDataType::INTEGER.0;
pub const SQL_SMALLINT: i16 = SqlDataType::SMALLINT.0;
pub const SQL_FLOAT: i16 = SqlDataType::FLOAT.0;
pub const SQL_REAL: i16 = SqlDataType::REAL.0;
pub const SQL_DOUBLE: i16 = SqlDataType::DOUBLE.0;
pub const SQL_VARCHAR: i16 = SqlDataType::VARCHAR.0;
pub const SQL_TYPE_DATE: i16 = SqlDataType::DATE.0;
pub const SQL_TYPE_TIME: i16 = SqlDataType::TIME.0;
pub const SQL_TYPE_TIMESTAMP: i16 = SqlDataType::TIMESTAMP.0;
pub const SQL_LONGVARCHAR: i16 = SqlDataType::EXT_LONG_VARCHAR.0;
pub const SQL_BINARY: i16 = SqlDataType::EXT_BINARY.0;
pub const SQL_VARBINARY: i16 = SqlDataType::EXT_VAR_BINARY.0;
pub const SQL_LONGVARBINARY: i16 = SqlDataType::EXT_LONG_VAR_BINARY.0;
pub const SQL_BIGINT: i16 = SqlDataType::EXT_BIG_INT.0;
pub const SQL_TINYINT: i16 = SqlDataType::EXT_TINY_INT.0;
pub const SQL_BIT: i16 = SqlDataType::EXT_BIT.0;
pub const SQL_WCHAR: i16 = SqlDataType::EXT_W_CHAR.0;
pub const SQL_WVARCHAR: i16 = SqlDataType::EXT_W_VARCHAR.0;
pub const SQL_WLONGVARCHAR: i16 = SqlDataType::EXT_W_LONG_VARCHAR.0;
pub const SQL_GUID: i16 = SqlDataType::EXT_GUID.0;
pub const SQL_SS_TIME2: i16 = -154;

// C data types. The plain LONG, SHORT and TINYINT codes reuse the SQL type
// code of the same width.
pub const SQL_C_CHAR: i16 = CDataType::Char as i16;
pub const SQL_C_WCHAR: i16 = CDataType::WChar as i16;
pub const SQL_C_LONG: i16 = SQL_INTEGER;
pub const SQL_C_SHORT: i16 = SQL_SMALLINT;
pub const SQL_C_FLOAT: i16 = CDataType::Float as i16;
pub const SQL_C_DOUBLE: i16 = CDataType::Double as i16;
pub const SQL_C_NUMERIC: i16 = CDataType::Numeric as i16;
pub const SQL_C_DEFAULT: i16 = CDataType::Default as i16;
pub const SQL_C_BIT: i16 = CDataType::Bit as i16;
pub const SQL_C_BINARY: i16 = CDataType::Binary as i16;
pub const SQL_C_SBIGINT: i16 = CDataType::SBigInt as i16;
pub const SQL_C_UBIGINT: i16 = CDataType::UBigInt as i16;
pub const SQL_C_TINYINT: i16 = SQL_TINYINT;
pub const SQL_C_STINYINT: i16 = CDataType::STinyInt as i16;
pub const SQL_C_UTINYINT: i16 = CDataType::UTinyInt as i16;
pub const SQL_C_SSHORT: i16 = CDataType::SShort as i16;
pub const SQL_C_USHORT: i16 = CDataType::UShort as i16;
pub const SQL_C_SLONG: i16 = CDataType::SLong as i16;
pub const SQL_C_ULONG: i16 = CDataType::ULong as i16;
pub const SQL_C_TYPE_DATE: i16 = CDataType::TypeDate as i16;
pub const SQL_C_TYPE_TIME: i16 = CDataType::TypeTime as i16;
pub const SQL_C_TYPE_TIMESTAMP: i16 = CDataType::TypeTimestamp as i16;

/// Human-readable name of a C type code, used in type-mismatch errors.
pub fn c_type_name(c_type: i16) -> &'static str {
    match c_type {
        SQL_C_CHAR => "SQL_C_CHAR",
        SQL_C_WCHAR => "SQL_C_WCHAR",
        SQL_C_LONG => "SQL_C_LONG",
        SQL_C_SLONG => "SQL_C_SLONG",
        SQL_C_ULONG => "SQL_C_ULONG",
        SQL_C_SHORT => "SQL_C_SHORT",
        SQL_C_SSHORT => "SQL_C_SSHORT",
        SQL_C_USHORT => "SQL_C_USHORT",
        SQL_C_TINYINT => "SQL_C_TINYINT",
        SQL_C_STINYINT => "SQL_C_STINYINT",
        SQL_C_UTINYINT => "SQL_C_UTINYINT",
        SQL_C_SBIGINT => "SQL_C_SBIGINT",
        SQL_C_UBIGINT => "SQL_C_UBIGINT",
        SQL_C_FLOAT => "SQL_C_FLOAT",
        SQL_C_DOUBLE => "SQL_C_DOUBLE",
        SQL_C_BIT => "SQL_C_BIT",
        SQL_C_BINARY => "SQL_C_BINARY",
        SQL_C_NUMERIC => "SQL_C_NUMERIC",
        SQL_C_TYPE_DATE => "SQL_C_TYPE_DATE",
        SQL_C_TYPE_TIME => "SQL_C_TYPE_TIME",
        SQL_C_TYPE_TIMESTAMP => "SQL_C_TYPE_TIMESTAMP",
        SQL_C_DEFAULT => "SQL_C_DEFAULT",
        _ => "UNKNOWN",
    }
}

// Bulk-copy return codes and directions
pub const SUCCEED: i32 = 1;
pub const FAIL: i32 = 0;
pub const DB_IN: i32 = 1;
pub const DB_OUT: i32 = 2;
pub const DB_QUERYOUT: i32 = 3;

// Bulk-copy control options
pub const BCPMAXERRS: i32 = 1;
pub const BCPFIRST: i32 = 2;
pub const BCPLAST: i32 = 3;
pub const BCPBATCH: i32 = 4;
pub const BCPKEEPNULLS: i32 = 5;
pub const BCPKEEPIDENTITY: i32 = 8;
pub const BCPHINTSA: i32 = 10;
pub const BCPHINTSW: i32 = 11;
pub const BCPFILECP: i32 = 12;

// Bulk modes for bcp_setbulkmode
pub const BCP_OUT_CHARACTER_MODE: i32 = 0x01;
pub const BCP_OUT_NATIVE_MODE: i32 = 0x04;

// Bulk-copy data type tags
pub const SQLTEXT: i32 = 0x23;
pub const SQLVARBINARY: i32 = 0x25;
pub const SQLINTN: i32 = 0x26;
pub const SQLVARCHAR: i32 = 0x27;
pub const SQLBINARY: i32 = 0x2d;
pub const SQLIMAGE: i32 = 0x22;
pub const SQLCHARACTER: i32 = 0x2f;
pub const SQLINT1: i32 = 0x30;
pub const SQLBIT: i32 = 0x32;
pub const SQLINT2: i32 = 0x34;
pub const SQLINT4: i32 = 0x38;
pub const SQLFLT4: i32 = 0x3b;
pub const SQLFLT8: i32 = 0x3e;
pub const SQLNTEXT: i32 = 0x63;
pub const SQLFLTN: i32 = 0x6d;
pub const SQLINT8: i32 = 0x7f;
pub const SQLBIGVARBINARY: i32 = 0xa5;
pub const SQLBIGVARCHAR: i32 = 0xa7;
pub const SQLBIGBINARY: i32 = 0xad;
pub const SQLBIGCHAR: i32 = 0xaf;
pub const SQLNVARCHAR: i32 = 0xe7;
pub const SQLNCHAR: i32 = 0xef;

/// Fixed-layout structs the driver reads and writes by value.
///
/// # Safety
/// Implementors must be `#[repr(C)]`, free of padding, and valid for every
/// bit pattern.
pub unsafe trait CStruct: Copy {
    /// Native-endian image of the struct, as bound into a parameter buffer.
    fn to_bytes(&self) -> Vec<u8> {
        // SAFETY: the trait contract rules out padding, so every byte of
        // `self` is initialized.
        unsafe { std::slice::from_raw_parts(self as *const Self as *const u8, size_of::<Self>()) }
            .to_vec()
    }

    /// Reads the struct back from a buffer filled by the driver. `None` when
    /// the buffer is too short.
    fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < size_of::<Self>() {
            return None;
        }
        // SAFETY: length checked above; any bit pattern is a valid `Self`.
        Some(unsafe { ptr::read_unaligned(bytes.as_ptr() as *const Self) })
    }
}

// SAFETY: `SQL_DATE_STRUCT`, `SQL_TIME_STRUCT`, `SQL_TIMESTAMP_STRUCT` and
// `SQL_NUMERIC_STRUCT` are plain integer fields laid out without gaps.
unsafe impl CStruct for Date {}
unsafe impl CStruct for Time {}
unsafe impl CStruct for Timestamp {}
unsafe impl CStruct for Numeric {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_struct_layouts_match_odbc_headers() {
        assert_eq!(size_of::<Date>(), 6);
        assert_eq!(size_of::<Time>(), 6);
        assert_eq!(size_of::<Timestamp>(), 16);
        assert_eq!(size_of::<Numeric>(), 19);
    }

    #[test]
    fn test_c_type_codes() {
        assert_eq!(SQL_C_SBIGINT, -25);
        assert_eq!(SQL_C_UBIGINT, -27);
        assert_eq!(SQL_C_STINYINT, -26);
        assert_eq!(SQL_C_UTINYINT, -28);
        assert_eq!(SQL_C_LONG, 4);
        assert_eq!(c_type_name(SQL_C_SBIGINT), "SQL_C_SBIGINT");
        assert_eq!(c_type_name(1234), "UNKNOWN");
    }

    #[test]
    fn test_timestamp_byte_layout() {
        let ts = Timestamp {
            year: 2024,
            month: 2,
            day: 29,
            hour: 23,
            minute: 59,
            second: 58,
            fraction: 123_456_789,
        };
        let bytes = ts.to_bytes();
        assert_eq!(&bytes[0..2], &2024i16.to_ne_bytes());
        assert_eq!(&bytes[12..16], &123_456_789u32.to_ne_bytes());
        assert_eq!(Timestamp::from_bytes(&bytes), Some(ts));
        assert_eq!(Timestamp::from_bytes(&bytes[..10]), None);
    }
}
