use crate::driver::sql::{
    Date as SqlDate, Numeric as SqlNumeric, Time as SqlTime, Timestamp as SqlTimestamp,
};
use crate::error::{DdbcError, Result};
use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use std::fmt;

/// A parameter or cell value. One case per supported SQL/C type family.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Date(NaiveDate),
    Time(NaiveTime),
    Timestamp(NaiveDateTime),
    Numeric(Numeric),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Text(_) => "text",
            Value::Bytes(_) => "bytes",
            Value::Date(_) => "date",
            Value::Time(_) => "time",
            Value::Timestamp(_) => "timestamp",
            Value::Numeric(_) => "numeric",
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Text rendering used when a value is shipped through a character buffer.
    pub fn to_text(&self) -> Option<String> {
        match self {
            Value::Null => None,
            Value::Bool(b) => Some(if *b { "1" } else { "0" }.to_string()),
            Value::Int(v) => Some(v.to_string()),
            Value::Float(v) => Some(v.to_string()),
            Value::Text(s) => Some(s.clone()),
            Value::Bytes(b) => Some(String::from_utf8_lossy(b).into_owned()),
            Value::Date(d) => Some(d.format("%Y-%m-%d").to_string()),
            Value::Time(t) => Some(t.format("%H:%M:%S").to_string()),
            Value::Timestamp(ts) => Some(ts.format("%Y-%m-%d %H:%M:%S%.6f").to_string()),
            Value::Numeric(n) => Some(n.to_string()),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// Fixed-point decimal in the driver's representation: an unsigned scaled
/// magnitude plus sign, precision and scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Numeric {
    pub precision: u8,
    pub scale: i8,
    pub positive: bool,
    pub magnitude: u128,
}

impl Numeric {
    /// Parses `[-+]digits[.digits]`. Precision is the number of significant
    /// digits (at least 1), scale the number of fraction digits.
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim();
        let (positive, body) = match text.strip_prefix('-') {
            Some(rest) => (false, rest),
            None => (true, text.strip_prefix('+').unwrap_or(text)),
        };
        let (int_part, frac_part) = body.split_once('.').unwrap_or((body, ""));
        if int_part.is_empty() && frac_part.is_empty() {
            return Err(DdbcError::InvalidArgument(format!(
                "invalid numeric literal '{text}'"
            )));
        }
        let mut magnitude: u128 = 0;
        for ch in int_part.chars().chain(frac_part.chars()) {
            let digit = ch.to_digit(10).ok_or_else(|| {
                DdbcError::InvalidArgument(format!("invalid numeric literal '{text}'"))
            })?;
            magnitude = magnitude
                .checked_mul(10)
                .and_then(|m| m.checked_add(u128::from(digit)))
                .ok_or_else(|| {
                    DdbcError::InvalidArgument(format!("numeric literal '{text}' overflows"))
                })?;
        }
        let significant = int_part.trim_start_matches('0').len() + frac_part.len();
        if significant > 38 {
            return Err(DdbcError::InvalidArgument(format!(
                "numeric literal '{text}' exceeds precision 38"
            )));
        }
        Ok(Self {
            precision: significant.max(1) as u8,
            scale: frac_part.len() as i8,
            positive: positive || magnitude == 0,
            magnitude,
        })
    }

    pub(crate) fn to_sql(self) -> SqlNumeric {
        SqlNumeric {
            precision: self.precision,
            scale: self.scale,
            sign: u8::from(self.positive),
            val: self.magnitude.to_le_bytes(),
        }
    }

    pub(crate) fn from_sql(raw: &SqlNumeric) -> Self {
        Self {
            precision: raw.precision,
            scale: raw.scale,
            positive: raw.sign != 0,
            magnitude: u128::from_le_bytes(raw.val),
        }
    }
}

impl fmt::Display for Numeric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let digits = self.magnitude.to_string();
        let scale = self.scale.max(0) as usize;
        let sign = if self.positive { "" } else { "-" };
        if scale == 0 {
            return write!(f, "{sign}{digits}");
        }
        let padded = format!("{digits:0>width$}", width = scale + 1);
        let (int_part, frac_part) = padded.split_at(padded.len() - scale);
        write!(f, "{sign}{int_part}.{frac_part}")
    }
}

pub(crate) fn date_to_sql(d: &NaiveDate) -> SqlDate {
    SqlDate {
        year: d.year() as i16,
        month: d.month() as u16,
        day: d.day() as u16,
    }
}

pub(crate) fn time_to_sql(t: &NaiveTime) -> SqlTime {
    SqlTime {
        hour: t.hour() as u16,
        minute: t.minute() as u16,
        second: t.second() as u16,
    }
}

pub(crate) fn timestamp_to_sql(ts: &NaiveDateTime) -> SqlTimestamp {
    SqlTimestamp {
        year: ts.year() as i16,
        month: ts.month() as u16,
        day: ts.day() as u16,
        hour: ts.hour() as u16,
        minute: ts.minute() as u16,
        second: ts.second() as u16,
        fraction: ts.nanosecond(),
    }
}

pub(crate) fn date_from_sql(raw: &SqlDate) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(i32::from(raw.year), u32::from(raw.month), u32::from(raw.day))
}

pub(crate) fn time_from_sql(raw: &SqlTime) -> Option<NaiveTime> {
    NaiveTime::from_hms_opt(
        u32::from(raw.hour),
        u32::from(raw.minute),
        u32::from(raw.second),
    )
}

/// Sub-microsecond digits of the driver's nanosecond fraction are dropped.
pub(crate) fn timestamp_from_sql(raw: &SqlTimestamp) -> Option<NaiveDateTime> {
    let date = NaiveDate::from_ymd_opt(i32::from(raw.year), u32::from(raw.month), u32::from(raw.day))?;
    let time = NaiveTime::from_hms_micro_opt(
        u32::from(raw.hour),
        u32::from(raw.minute),
        u32::from(raw.second),
        raw.fraction / 1000,
    )?;
    Some(NaiveDateTime::new(date, time))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_parse_and_display() {
        let n = Numeric::parse("-123.4500").unwrap();
        assert_eq!(n.precision, 7);
        assert_eq!(n.scale, 4);
        assert!(!n.positive);
        assert_eq!(n.magnitude, 1_234_500);
        assert_eq!(n.to_string(), "-123.4500");

        let small = Numeric::parse("0.05").unwrap();
        assert_eq!(small.precision, 2);
        assert_eq!(small.to_string(), "0.05");

        let int = Numeric::parse("42").unwrap();
        assert_eq!(int.scale, 0);
        assert_eq!(int.to_string(), "42");
    }

    #[test]
    fn test_numeric_parse_rejects_garbage() {
        assert!(matches!(
            Numeric::parse("12a"),
            Err(DdbcError::InvalidArgument(_))
        ));
        assert!(Numeric::parse("-").is_err());
        assert!(Numeric::parse("1234567890123456789012345678901234567890").is_err());
    }

    #[test]
    fn test_numeric_sql_struct_is_little_endian() {
        let n = Numeric::parse("2.56").unwrap();
        let raw = n.to_sql();
        assert_eq!(raw.sign, 1);
        assert_eq!(raw.val[0], 0x00);
        assert_eq!(raw.val[1], 0x01);
        assert_eq!(Numeric::from_sql(&raw), n);
    }

    #[test]
    fn test_timestamp_fraction_truncated_to_micros() {
        let raw = SqlTimestamp {
            year: 2023,
            month: 12,
            day: 31,
            hour: 10,
            minute: 20,
            second: 30,
            fraction: 123_456_789,
        };
        let ts = timestamp_from_sql(&raw).unwrap();
        assert_eq!(ts.nanosecond(), 123_456_000);
    }

    #[test]
    fn test_invalid_date_struct() {
        let raw = SqlDate {
            year: 2023,
            month: 2,
            day: 30,
        };
        assert!(date_from_sql(&raw).is_none());
    }

    #[test]
    fn test_value_conversions() {
        assert_eq!(Value::from(Some(5i64)), Value::Int(5));
        assert_eq!(Value::from(None::<i64>), Value::Null);
        assert_eq!(Value::from("x").as_str(), Some("x"));
        assert_eq!(Value::Bool(true).to_text().as_deref(), Some("1"));
        assert_eq!(Value::Null.to_text(), None);
    }
}
