mod buffer;
pub mod bulk_copy;
pub mod cell_reader;
pub mod client;
pub mod connection;
pub mod cursor;
pub mod environment;
pub mod params;
pub mod value;

pub use bulk_copy::{BcpColumnFormat, BcpDirection, BcpOptions, BcpState, BulkCopyOperation};
pub use cell_reader::{read_cell, read_row};
pub use client::{Client, ConnectionHandle};
pub use connection::{Connection, ConnectionOptions};
pub use cursor::{ColumnDescription, Cursor, CursorState};
pub use environment::DriverContext;
pub use params::{ParamBufferSet, ParamInfo};
pub use value::{Numeric, Value};
