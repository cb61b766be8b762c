use super::environment::DriverContext;
use crate::driver::sql::*;
use crate::driver::{HandleKind, ReturnCode};
use crate::error::{DdbcError, ErrorInfo, Result};
use crate::handles::DriverHandle;
use log::Level;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use zeroize::Zeroizing;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Settings applied around `connect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnectionOptions {
    /// Autocommit mode applied right after connecting. Off by default, as
    /// DB-API connections start inside a transaction.
    pub autocommit: bool,
    /// Enable `SQL_COPT_SS_BCP` before connecting; the driver only honours it
    /// on a connection that is not yet open.
    pub bulk_copy: bool,
    pub login_timeout_secs: Option<u32>,
}

impl ConnectionOptions {
    #[must_use]
    pub fn autocommit(mut self, enabled: bool) -> Self {
        self.autocommit = enabled;
        self
    }

    #[must_use]
    pub fn bulk_copy(mut self, enabled: bool) -> Self {
        self.bulk_copy = enabled;
        self
    }

    #[must_use]
    pub fn login_timeout(mut self, secs: u32) -> Self {
        self.login_timeout_secs = Some(secs);
        self
    }
}

/// One physical database connection.
pub struct Connection {
    id: u64,
    ctx: Arc<DriverContext>,
    handle: Option<Arc<DriverHandle>>,
    connection_string: Zeroizing<String>,
    options: ConnectionOptions,
    autocommit: bool,
    connected: bool,
    pooled: bool,
    last_used: Instant,
}

fn not_open() -> ErrorInfo {
    ErrorInfo::new("08003", "Connection is not open")
}

impl Connection {
    /// A connection that has not been opened yet.
    pub fn new(
        ctx: Arc<DriverContext>,
        connection_string: &str,
        options: ConnectionOptions,
    ) -> Self {
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            ctx,
            handle: None,
            connection_string: Zeroizing::new(connection_string.to_string()),
            options,
            autocommit: false,
            connected: false,
            pooled: false,
            last_used: Instant::now(),
        }
    }

    /// Creates and connects in one step.
    pub fn open(
        ctx: Arc<DriverContext>,
        connection_string: &str,
        options: ConnectionOptions,
    ) -> Result<Self> {
        let mut conn = Self::new(ctx, connection_string, options);
        conn.connect()?;
        Ok(conn)
    }

    pub fn connect(&mut self) -> Result<()> {
        if self.connected {
            return Ok(());
        }
        if self.connection_string.trim().is_empty() {
            return Err(DdbcError::Connection(ErrorInfo::message(
                "Connection string cannot be empty",
            )));
        }

        let env = self.ctx.environment()?;
        let dbc = match &self.handle {
            Some(h) => h.clone(),
            None => {
                let h = DriverHandle::allocate(
                    self.ctx.api().clone(),
                    self.ctx.logger().clone(),
                    HandleKind::Connection,
                    Some(env),
                )?;
                self.handle = Some(h.clone());
                h
            }
        };
        let api = self.ctx.api();

        if let Some(secs) = self.options.login_timeout_secs {
            let ret = api.set_connect_attr(dbc.raw(), SQL_ATTR_LOGIN_TIMEOUT, secs as usize);
            dbc.check(ret, DdbcError::Config)?;
        }
        if self.options.bulk_copy {
            let ret = api.set_connect_attr(dbc.raw(), SQL_COPT_SS_BCP, SQL_BCP_ON);
            dbc.check(ret, DdbcError::Config)?;
        }

        let ret = api.driver_connect(dbc.raw(), &self.connection_string);
        if !ret.succeeded() {
            let info = dbc.error_info();
            self.ctx
                .logger()
                .log_connection(Level::Error, &self.connection_string, "failed");
            self.handle = None;
            return Err(DdbcError::Connection(info));
        }
        self.connected = true;
        self.ctx
            .logger()
            .log_connection(Level::Info, &self.connection_string, "opened");

        if let Err(e) = self.apply_autocommit(self.options.autocommit) {
            if let Err(disconnect_err) = self.disconnect() {
                self.ctx.logger().log_error("disconnect after failed setup", &disconnect_err);
            }
            return Err(e);
        }
        self.touch();
        Ok(())
    }

    /// Tears down the link. Disconnecting a closed connection is a no-op.
    pub fn disconnect(&mut self) -> Result<()> {
        let Some(dbc) = self.handle.take() else {
            self.connected = false;
            return Ok(());
        };
        if !self.connected {
            return Ok(());
        }
        self.connected = false;
        let ret = self.ctx.api().disconnect(dbc.raw());
        let result = dbc.check(ret, DdbcError::Connection);
        self.ctx
            .logger()
            .log_connection(Level::Info, &self.connection_string, "closed");
        // Statement handles still alive keep `dbc` until they are freed.
        drop(dbc);
        result
    }

    pub fn commit(&self) -> Result<()> {
        self.end_transaction(SQL_COMMIT)
    }

    pub fn rollback(&self) -> Result<()> {
        self.end_transaction(SQL_ROLLBACK)
    }

    fn end_transaction(&self, completion: i16) -> Result<()> {
        let dbc = self.open_handle().map_err(|_| DdbcError::Transaction(not_open()))?;
        let ret = self
            .ctx
            .api()
            .end_tran(HandleKind::Connection, dbc.raw(), completion);
        dbc.check(ret, DdbcError::Transaction)
    }

    /// The cached flag changes only when the driver accepts the new mode.
    pub fn set_autocommit(&mut self, enabled: bool) -> Result<()> {
        if !self.connected {
            return Err(DdbcError::Config(not_open()));
        }
        self.apply_autocommit(enabled)
    }

    fn apply_autocommit(&mut self, enabled: bool) -> Result<()> {
        let dbc = self.open_handle().map_err(|_| DdbcError::Config(not_open()))?;
        let value = if enabled {
            SQL_AUTOCOMMIT_ON
        } else {
            SQL_AUTOCOMMIT_OFF
        };
        let ret = self
            .ctx
            .api()
            .set_connect_attr(dbc.raw(), SQL_ATTR_AUTOCOMMIT, value);
        dbc.check(ret, DdbcError::Config)?;
        self.autocommit = enabled;
        Ok(())
    }

    /// Cached autocommit mode; no driver round-trip.
    pub fn autocommit(&self) -> bool {
        self.autocommit
    }

    /// Asks the driver to reset session state for reuse. A rejection is
    /// reported as `false`, never as an error.
    pub fn reset(&mut self) -> bool {
        let Ok(dbc) = self.open_handle() else {
            return false;
        };
        let ret = self.ctx.api().set_connect_attr(
            dbc.raw(),
            SQL_COPT_SS_RESET_CONNECTION,
            SQL_RESET_CONNECTION_YES,
        );
        if !ret.succeeded() {
            let info = dbc.error_info();
            crate::ddbc_log!(
                self.ctx.logger(),
                Level::Warn,
                "Connection {} reset rejected: {}",
                self.id,
                info
            );
            return false;
        }
        self.touch();
        true
    }

    /// Reads `SQL_ATTR_CONNECTION_DEAD`. A driver that cannot answer is
    /// assumed to be alive; a closed connection never is.
    pub fn is_alive(&self) -> bool {
        let Ok(dbc) = self.open_handle() else {
            return false;
        };
        let mut dead = 0usize;
        let ret = self
            .ctx
            .api()
            .get_connect_attr(dbc.raw(), SQL_ATTR_CONNECTION_DEAD, &mut dead);
        if !ret.succeeded() {
            crate::ddbc_log!(
                self.ctx.logger(),
                Level::Debug,
                "Connection {} liveness unknown, assuming alive",
                self.id
            );
            return true;
        }
        dead != SQL_CD_TRUE
    }

    pub fn alloc_statement_handle(&self) -> Result<Arc<DriverHandle>> {
        let dbc = self.handle.clone().ok_or_else(|| DdbcError::Allocation {
            kind: HandleKind::Statement,
            info: ErrorInfo::message("Connection handle is not allocated"),
        })?;
        DriverHandle::allocate(
            self.ctx.api().clone(),
            self.ctx.logger().clone(),
            HandleKind::Statement,
            Some(dbc),
        )
    }

    fn open_handle(&self) -> Result<&Arc<DriverHandle>> {
        match &self.handle {
            Some(h) if self.connected => Ok(h),
            _ => Err(DdbcError::State("Connection is not open".to_string())),
        }
    }

    /// Connection handle shared with cursors and bulk-copy operations.
    pub fn handle(&self) -> Result<Arc<DriverHandle>> {
        self.open_handle().cloned()
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn context(&self) -> &Arc<DriverContext> {
        &self.ctx
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn is_pooled(&self) -> bool {
        self.pooled
    }

    pub(crate) fn set_pooled(&mut self, pooled: bool) {
        self.pooled = pooled;
    }

    pub fn last_used(&self) -> Instant {
        self.last_used
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }

    pub fn touch(&mut self) {
        self.last_used = Instant::now();
    }

    #[cfg(test)]
    pub(crate) fn backdate(&mut self, by: Duration) {
        if let Some(t) = self.last_used.checked_sub(by) {
            self.last_used = t;
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Err(e) = self.disconnect() {
            self.ctx.logger().log_error("disconnect on drop", &e);
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("connected", &self.connected)
            .field("pooled", &self.pooled)
            .field("autocommit", &self.autocommit)
            .finish()
    }
}
