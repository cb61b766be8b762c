use super::{ConnectionPool, PoolState};
use crate::config::PoolSettings;
use crate::engine::connection::{Connection, ConnectionOptions};
use crate::engine::environment::DriverContext;
use crate::error::Result;
use log::Level;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

struct Registry {
    defaults: PoolSettings,
    pools: HashMap<String, Arc<ConnectionPool>>,
}

/// Registry of pools keyed by connection string, one pool per distinct
/// string, created on first use.
///
/// The registry lock covers map lookups and inserts only; acquire, release
/// and close run against the pool after the lock has been dropped.
pub struct PoolManager {
    ctx: Arc<DriverContext>,
    options: ConnectionOptions,
    registry: Mutex<Registry>,
}

impl PoolManager {
    pub fn new(ctx: Arc<DriverContext>, defaults: PoolSettings, options: ConnectionOptions) -> Self {
        Self {
            ctx,
            options,
            registry: Mutex::new(Registry {
                defaults,
                pools: HashMap::new(),
            }),
        }
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Sets the settings used by pools created from now on. Existing pools
    /// keep the settings they were created with.
    pub fn configure(&self, settings: PoolSettings) -> Result<()> {
        settings.validate()?;
        self.registry().defaults = settings;
        crate::ddbc_log!(
            self.ctx.logger(),
            Level::Info,
            "Pooling configured: max_size={}, idle_timeout={}s",
            settings.max_size,
            settings.idle_timeout.as_secs()
        );
        Ok(())
    }

    pub fn defaults(&self) -> PoolSettings {
        self.registry().defaults
    }

    fn pool_for(&self, connection_string: &str) -> Result<Arc<ConnectionPool>> {
        let mut registry = self.registry();
        if let Some(pool) = registry.pools.get(connection_string) {
            return Ok(pool.clone());
        }
        let pool = Arc::new(ConnectionPool::new(
            self.ctx.clone(),
            connection_string,
            registry.defaults,
            self.options,
        )?);
        registry
            .pools
            .insert(connection_string.to_string(), pool.clone());
        Ok(pool)
    }

    pub fn acquire_connection(&self, connection_string: &str) -> Result<Connection> {
        let pool = self.pool_for(connection_string)?;
        pool.acquire()
    }

    /// Hands a connection back to the pool for `connection_string`. Without
    /// such a pool the connection is disconnected.
    pub fn return_connection(&self, connection_string: &str, mut conn: Connection) {
        let pool = self.registry().pools.get(connection_string).cloned();
        match pool {
            Some(pool) => pool.release(conn),
            None => {
                crate::ddbc_log!(
                    self.ctx.logger(),
                    Level::Warn,
                    "No pool for returned connection {}, disconnecting",
                    conn.id()
                );
                if let Err(e) = conn.disconnect() {
                    self.ctx.logger().log_error("disconnect unpooled connection", &e);
                }
            }
        }
    }

    /// Closes and forgets every pool.
    pub fn close_pools(&self) {
        let pools: Vec<_> = self.registry().pools.drain().map(|(_, p)| p).collect();
        for pool in pools {
            pool.close();
        }
    }

    pub fn pool_count(&self) -> usize {
        self.registry().pools.len()
    }

    pub fn pool_state(&self, connection_string: &str) -> Option<PoolState> {
        let pool = self.registry().pools.get(connection_string).cloned();
        pool.map(|p| p.state())
    }
}

impl Drop for PoolManager {
    fn drop(&mut self) {
        self.close_pools();
    }
}
