use crate::driver::{DriverApi, HandleKind, RawHandle, ReturnCode, SqlReturn};
use crate::error::{DdbcError, DiagnosticRecord, ErrorInfo, Result};
use crate::observability::StructuredLogger;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Reads every diagnostic record attached to `handle`, stopping at the first
/// record the driver does not return.
pub fn collect_diagnostics(
    api: &dyn DriverApi,
    kind: HandleKind,
    handle: RawHandle,
) -> Vec<DiagnosticRecord> {
    let mut records = Vec::new();
    let mut number: i16 = 1;
    loop {
        let mut record = DiagnosticRecord::default();
        if !api.get_diag_rec(kind, handle, number, &mut record).succeeded() {
            break;
        }
        records.push(record);
        number = match number.checked_add(1) {
            Some(n) => n,
            None => break,
        };
    }
    records
}

/// Owned driver handle.
///
/// The raw value is freed with the driver exactly once: by [`close`],
/// [`release`] or drop, whichever comes first. A child keeps its parent alive
/// through `parent`, so an environment is never freed while a connection
/// allocated from it still exists.
///
/// [`close`]: DriverHandle::close
/// [`release`]: DriverHandle::release
pub struct DriverHandle {
    kind: HandleKind,
    raw: AtomicUsize,
    api: Arc<dyn DriverApi>,
    logger: Arc<StructuredLogger>,
    parent: Option<Arc<DriverHandle>>,
}

impl DriverHandle {
    /// Allocates a new handle of `kind` under `parent`. Environment handles
    /// take no parent.
    pub fn allocate(
        api: Arc<dyn DriverApi>,
        logger: Arc<StructuredLogger>,
        kind: HandleKind,
        parent: Option<Arc<DriverHandle>>,
    ) -> Result<Arc<DriverHandle>> {
        let parent_raw = match &parent {
            Some(p) => {
                let raw = p.raw();
                if raw.is_null() {
                    return Err(DdbcError::State(format!(
                        "cannot allocate {kind} handle: parent {} handle is closed",
                        p.kind
                    )));
                }
                raw
            }
            None => RawHandle::NULL,
        };

        let mut out = RawHandle::NULL;
        let ret = api.alloc_handle(kind, parent_raw, &mut out);
        if !ret.succeeded() || out.is_null() {
            let info = match &parent {
                Some(p) => ErrorInfo::from_records(&collect_diagnostics(&*api, p.kind, parent_raw)),
                None => ErrorInfo::message(format!("driver returned {}", ret.0)),
            };
            return Err(DdbcError::Allocation { kind, info });
        }

        crate::ddbc_log!(logger, log::Level::Trace, "Allocated {} handle {:#x}", kind, out.0);
        Ok(Arc::new(DriverHandle {
            kind,
            raw: AtomicUsize::new(out.0),
            api,
            logger,
            parent,
        }))
    }

    pub fn kind(&self) -> HandleKind {
        self.kind
    }

    /// Current raw value; null once the handle has been freed.
    pub fn raw(&self) -> RawHandle {
        RawHandle(self.raw.load(Ordering::Acquire))
    }

    pub fn is_open(&self) -> bool {
        !self.raw().is_null()
    }

    pub fn api(&self) -> &Arc<dyn DriverApi> {
        &self.api
    }

    pub fn logger(&self) -> &Arc<StructuredLogger> {
        &self.logger
    }

    pub fn parent(&self) -> Option<&Arc<DriverHandle>> {
        self.parent.as_ref()
    }

    pub fn diagnostics(&self) -> Vec<DiagnosticRecord> {
        let raw = self.raw();
        if raw.is_null() {
            return Vec::new();
        }
        collect_diagnostics(&*self.api, self.kind, raw)
    }

    /// Error info for the last failed call on this handle.
    pub fn error_info(&self) -> ErrorInfo {
        ErrorInfo::from_records(&self.diagnostics())
    }

    /// Maps a driver return code to `Ok`, or to an error built from this
    /// handle's diagnostics.
    pub fn check(&self, ret: SqlReturn, make: impl FnOnce(ErrorInfo) -> DdbcError) -> Result<()> {
        if ret.succeeded() {
            Ok(())
        } else {
            Err(make(self.error_info()))
        }
    }

    fn take(&self) -> RawHandle {
        RawHandle(self.raw.swap(0, Ordering::AcqRel))
    }

    /// Frees the handle, reporting a driver failure. Closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        let raw = self.take();
        if raw.is_null() {
            return Ok(());
        }
        let ret = self.api.free_handle(self.kind, raw);
        if ret.succeeded() {
            crate::ddbc_log!(self.logger, log::Level::Trace, "Freed {} handle {:#x}", self.kind, raw.0);
            Ok(())
        } else {
            Err(DdbcError::Internal(format!(
                "failed to free {} handle {:#x}: driver returned {}",
                self.kind, raw.0, ret.0
            )))
        }
    }

    /// Frees the handle, logging instead of reporting a failure.
    pub fn release(&self) {
        if let Err(e) = self.close() {
            self.logger.log_error("free handle", &e);
        }
    }
}

impl Drop for DriverHandle {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for DriverHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverHandle")
            .field("kind", &self.kind)
            .field("raw", &format_args!("{:#x}", self.raw().0))
            .finish()
    }
}
