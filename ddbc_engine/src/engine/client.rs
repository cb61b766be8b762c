use super::bulk_copy::BulkCopyOperation;
use super::connection::{Connection, ConnectionOptions};
use super::cursor::Cursor;
use super::environment::DriverContext;
use crate::config::connection_string::sanitize;
use crate::config::{EngineConfig, PoolSettings};
use crate::error::{DdbcError, Result};
use crate::observability::StructuredLogger;
use crate::pool::{PoolManager, PoolState};
use log::Level;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Entry point for callers: opens connections, directly or through a pool
/// per connection string.
pub struct Client {
    ctx: Arc<DriverContext>,
    config: EngineConfig,
    options: ConnectionOptions,
    pools: Mutex<Option<Arc<PoolManager>>>,
}

impl Client {
    pub fn new(ctx: Arc<DriverContext>, config: EngineConfig) -> Result<Self> {
        Self::with_options(ctx, config, ConnectionOptions::default())
    }

    pub fn with_options(
        ctx: Arc<DriverContext>,
        config: EngineConfig,
        options: ConnectionOptions,
    ) -> Result<Self> {
        config.validate()?;
        ctx.logger().set_level(config.level_filter()?);
        let pools = config
            .pooling
            .then(|| Arc::new(PoolManager::new(ctx.clone(), config.pool, options)));
        Ok(Self {
            ctx,
            config,
            options,
            pools: Mutex::new(pools),
        })
    }

    /// Client over a driver library, logging through the `log` facade at
    /// the configured level.
    #[cfg(feature = "native-driver")]
    pub fn load(driver_path: impl AsRef<std::path::Path>, config: EngineConfig) -> Result<Self> {
        let logger = Arc::new(StructuredLogger::new(
            config.level_filter()?,
            Arc::new(crate::observability::LogCrateSink),
        ));
        let ctx = DriverContext::load(driver_path, logger)?;
        Self::new(ctx, config)
    }

    fn pools(&self) -> MutexGuard<'_, Option<Arc<PoolManager>>> {
        self.pools.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn logger(&self) -> &Arc<StructuredLogger> {
        self.ctx.logger()
    }

    pub fn context(&self) -> &Arc<DriverContext> {
        &self.ctx
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Opens a connection, taken from the pool for `connection_string` when
    /// pooling is enabled.
    pub fn connect(&self, connection_string: &str) -> Result<ConnectionHandle> {
        let pools = self.pools().clone();
        let conn = match &pools {
            Some(manager) => manager.acquire_connection(connection_string)?,
            None => Connection::open(self.ctx.clone(), connection_string, self.options)?,
        };
        crate::ddbc_log!(
            self.logger(),
            Level::Debug,
            "Connection {} handed out for {} (pooled: {})",
            conn.id(),
            sanitize(connection_string),
            pools.is_some()
        );
        Ok(ConnectionHandle {
            conn: Some(conn),
            pools,
            logger: self.logger().clone(),
            fetch_size: self.config.default_fetch_size,
        })
    }

    /// Turns pooling on, or changes the settings used by pools created from
    /// now on when it already is.
    pub fn enable_pooling(&self, max_size: usize, idle_timeout: Duration) -> Result<()> {
        let settings = PoolSettings::new().max_size(max_size).idle_timeout(idle_timeout);
        settings.validate()?;
        let mut pools = self.pools();
        if let Some(manager) = pools.as_ref() {
            return manager.configure(settings);
        }
        *pools = Some(Arc::new(PoolManager::new(self.ctx.clone(), settings, self.options)));
        crate::ddbc_log!(
            self.logger(),
            Level::Info,
            "Pooling enabled: max_size={}, idle_timeout={}s",
            max_size,
            idle_timeout.as_secs()
        );
        Ok(())
    }

    /// Closes every pool and opens direct connections from now on.
    /// Connections already handed out are disconnected when closed.
    pub fn disable_pooling(&self) {
        let manager = self.pools().take();
        if let Some(manager) = manager {
            manager.close_pools();
        }
    }

    pub fn close_pools(&self) {
        let manager = self.pools().clone();
        if let Some(manager) = manager {
            manager.close_pools();
        }
    }

    pub fn is_pooling(&self) -> bool {
        self.pools().is_some()
    }

    pub fn pool_state(&self, connection_string: &str) -> Option<PoolState> {
        let manager = self.pools().clone();
        manager.and_then(|m| m.pool_state(connection_string))
    }
}

/// A connection handed out by [`Client::connect`]. Closing it returns a
/// pooled connection to its pool and disconnects a direct one.
pub struct ConnectionHandle {
    conn: Option<Connection>,
    pools: Option<Arc<PoolManager>>,
    logger: Arc<StructuredLogger>,
    fetch_size: usize,
}

impl ConnectionHandle {
    fn conn(&self) -> Result<&Connection> {
        self.conn
            .as_ref()
            .ok_or_else(|| DdbcError::State("Connection is closed".to_string()))
    }

    fn conn_mut(&mut self) -> Result<&mut Connection> {
        self.conn
            .as_mut()
            .ok_or_else(|| DdbcError::State("Connection is closed".to_string()))
    }

    pub fn connection(&self) -> Result<&Connection> {
        self.conn()
    }

    pub fn cursor(&self) -> Result<Cursor> {
        Cursor::new(self.conn()?, self.fetch_size)
    }

    pub fn commit(&self) -> Result<()> {
        self.conn()?.commit()
    }

    pub fn rollback(&self) -> Result<()> {
        self.conn()?.rollback()
    }

    pub fn set_autocommit(&mut self, enabled: bool) -> Result<()> {
        self.conn_mut()?.set_autocommit(enabled)
    }

    pub fn autocommit(&self) -> Result<bool> {
        Ok(self.conn()?.autocommit())
    }

    /// A bulk-copy operation on this connection, not yet initialized.
    pub fn bulk_copy(&self) -> Result<BulkCopyOperation> {
        BulkCopyOperation::new(self.conn()?)
    }

    /// A bulk-copy operation already initialized for `table`.
    pub fn open_bulk_copy(
        &self,
        table: &str,
        data_file: Option<&str>,
        error_file: Option<&str>,
        direction: &str,
    ) -> Result<BulkCopyOperation> {
        let op = self.bulk_copy()?;
        op.initialize(table, data_file, error_file, direction)?;
        Ok(op)
    }

    pub fn is_closed(&self) -> bool {
        self.conn.is_none()
    }

    /// Rolls back an open transaction, then releases the connection.
    /// Closing twice is a no-op. The connection is released even when the
    /// rollback fails; the rollback error is reported afterwards.
    pub fn close(&mut self) -> Result<()> {
        let Some(mut conn) = self.conn.take() else {
            return Ok(());
        };
        let rollback = if conn.is_connected() && !conn.autocommit() {
            conn.rollback()
        } else {
            Ok(())
        };
        match &self.pools {
            Some(manager) if conn.is_pooled() => {
                let connection_string = conn.connection_string().to_string();
                manager.return_connection(&connection_string, conn);
            }
            _ => conn.disconnect()?,
        }
        rollback
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            self.logger.log_error("close connection handle", &e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::mock::{MockDriver, MockOp};

    fn client(pooling: bool) -> (Arc<MockDriver>, Client) {
        let mock = Arc::new(MockDriver::new());
        let ctx = DriverContext::new(mock.clone(), Arc::new(StructuredLogger::disabled()));
        let config = EngineConfig {
            pooling,
            log_level: "off".to_string(),
            ..EngineConfig::default()
        };
        (mock, Client::new(ctx, config).unwrap())
    }

    #[test]
    fn test_direct_connection_disconnects_on_close() {
        let (mock, client) = client(false);
        let mut handle = client.connect("Server=mock").unwrap();
        assert!(!handle.connection().unwrap().is_pooled());
        handle.close().unwrap();
        handle.close().unwrap();
        assert!(handle.is_closed());
        assert_eq!(mock.disconnect_count(), 1);
        assert!(matches!(handle.cursor(), Err(DdbcError::State(_))));
    }

    #[test]
    fn test_close_rolls_back_open_transaction() {
        let (mock, client) = client(false);
        let mut handle = client.connect("Server=mock").unwrap();
        assert!(!handle.autocommit().unwrap());
        handle.close().unwrap();
        assert_eq!(mock.call_count(MockOp::EndTran), 1);

        let mut handle = client.connect("Server=mock").unwrap();
        handle.set_autocommit(true).unwrap();
        mock.clear_calls();
        handle.close().unwrap();
        assert_eq!(mock.call_count(MockOp::EndTran), 0);
    }

    #[test]
    fn test_pooled_connection_returns_to_pool() {
        let (mock, client) = client(true);
        let first_id = {
            let handle = client.connect("Server=mock").unwrap();
            handle.connection().unwrap().id()
        };
        assert_eq!(client.pool_state("Server=mock").unwrap().idle, 1);
        let handle = client.connect("Server=mock").unwrap();
        assert_eq!(handle.connection().unwrap().id(), first_id);
        assert_eq!(mock.connect_count(), 1);
    }

    #[test]
    fn test_enable_and_disable_pooling() {
        let (mock, client) = client(false);
        assert!(!client.is_pooling());
        client.enable_pooling(2, Duration::from_secs(60)).unwrap();
        assert!(client.is_pooling());
        drop(client.connect("Server=mock").unwrap());
        client.disable_pooling();
        assert!(!client.is_pooling());
        assert_eq!(mock.disconnect_count(), 1);
        assert!(client.enable_pooling(0, Duration::from_secs(1)).is_err());
    }

    #[test]
    fn test_cursor_uses_default_fetch_size() {
        let (_mock, client) = client(false);
        let handle = client.connect("Server=mock").unwrap();
        assert_eq!(handle.cursor().unwrap().arraysize(), 1);
    }
}
