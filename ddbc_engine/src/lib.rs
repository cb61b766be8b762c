//! Driver binding layer for SQL Server over ODBC: pooled connections, a
//! DB-API style cursor and the `bcp_*` bulk-copy engine, all driven through
//! the [`driver::DriverApi`] function table.

pub mod config;
pub mod driver;
pub mod engine;
mod error;
pub mod handles;
pub mod observability;
pub mod pool;

pub use config::{EngineConfig, PoolSettings};
pub use engine::{
    BcpOptions, BulkCopyOperation, Client, ColumnDescription, Connection, ConnectionHandle,
    ConnectionOptions, Cursor, CursorState, DriverContext, Numeric, ParamInfo, Value,
};
pub use error::{DdbcError, DiagnosticRecord, ErrorCategory, ErrorInfo, Result};
pub use observability::{LogSink, StructuredLogger};
pub use pool::{ConnectionPool, PoolManager, PoolState};

#[cfg(feature = "test-helpers")]
pub mod test_helpers {
    use std::sync::Once;

    static DOTENV: Once = Once::new();

    /// Loads `.env` from the working directory or its parents, once per
    /// process. A missing file is fine.
    pub fn load_dotenv() {
        DOTENV.call_once(|| {
            let _ = dotenvy::dotenv();
        });
    }
}
