use crate::driver::sql::{SQL_ATTR_ODBC_VERSION, SQL_OV_ODBC3_80};
use crate::driver::{DriverApi, HandleKind, ReturnCode};
use crate::error::{DdbcError, ErrorInfo, Result};
use crate::handles::DriverHandle;
use crate::observability::StructuredLogger;
use std::fmt;
use std::sync::{Arc, OnceLock};

/// Explicitly constructed registry shared by every connection, cursor and
/// bulk-copy operation: the driver function table, the logger and the
/// environment handle.
///
/// The environment handle is allocated on first use and at most once. A
/// failed allocation is remembered; later callers get the same error.
pub struct DriverContext {
    api: Arc<dyn DriverApi>,
    logger: Arc<StructuredLogger>,
    env: OnceLock<std::result::Result<Arc<DriverHandle>, DdbcError>>,
}

impl DriverContext {
    pub fn new(api: Arc<dyn DriverApi>, logger: Arc<StructuredLogger>) -> Arc<Self> {
        Arc::new(Self {
            api,
            logger,
            env: OnceLock::new(),
        })
    }

    /// Context over a driver library loaded from `path`.
    #[cfg(feature = "native-driver")]
    pub fn load(
        path: impl AsRef<std::path::Path>,
        logger: Arc<StructuredLogger>,
    ) -> Result<Arc<Self>> {
        let library = crate::driver::library::DriverLibrary::load(path)?;
        Ok(Self::new(Arc::new(library), logger))
    }

    pub fn api(&self) -> &Arc<dyn DriverApi> {
        &self.api
    }

    pub fn logger(&self) -> &Arc<StructuredLogger> {
        &self.logger
    }

    /// The shared environment handle, allocated on first call.
    pub fn environment(&self) -> Result<Arc<DriverHandle>> {
        self.env
            .get_or_init(|| self.init_environment())
            .as_ref()
            .map(Arc::clone)
            .map_err(Clone::clone)
    }

    pub fn is_initialized(&self) -> bool {
        matches!(self.env.get(), Some(Ok(_)))
    }

    fn init_environment(&self) -> Result<Arc<DriverHandle>> {
        let env = DriverHandle::allocate(
            self.api.clone(),
            self.logger.clone(),
            HandleKind::Environment,
            None,
        )?;
        let ret = self
            .api
            .set_env_attr(env.raw(), SQL_ATTR_ODBC_VERSION, SQL_OV_ODBC3_80);
        if !ret.succeeded() {
            let info = env.error_info();
            env.release();
            return Err(DdbcError::Allocation {
                kind: HandleKind::Environment,
                info: ErrorInfo {
                    message: format!("Failed to set ODBC version: {}", info.message),
                    ..info
                },
            });
        }
        self.logger.debug(format_args!("Environment handle initialized"));
        Ok(env)
    }
}

impl fmt::Debug for DriverContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverContext")
            .field("initialized", &self.is_initialized())
            .field("logger", &self.logger)
            .finish()
    }
}
