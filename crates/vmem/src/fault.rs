//! Process-wide write fault dispatch.
//!
//! One SIGSEGV/SIGBUS handler is installed for the whole process. It asks each
//! registered [`FaultHandler`] in turn whether it owns the faulting address;
//! the first one that does fixes up the protection and the faulting store is
//! retried when the signal handler returns. Unclaimed faults go to whatever
//! handler was installed before.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, TryLockError};

use once_cell::sync::{Lazy, OnceCell};

use crate::platform;
use crate::{Result, VmemError};

/// Runs on the faulting thread, inside the signal handler.
///
/// Implementations may only touch atomics and change page protection: no
/// allocation, no locks, no logging.
pub trait FaultHandler: Send + Sync {
    /// Returns true when the access may be retried.
    fn on_write_fault(&self, host_addr: usize) -> bool;
}

struct Entry {
    id: u64,
    handler: Arc<dyn FaultHandler>,
}

static HANDLERS: Lazy<RwLock<Vec<Entry>>> = Lazy::new(|| RwLock::new(Vec::new()));
static NEXT_ID: AtomicU64 = AtomicU64::new(1);
static INSTALLED: OnceCell<std::result::Result<(), i32>> = OnceCell::new();

/// Installs the process handler. Idempotent.
pub fn install() -> Result<()> {
    Lazy::force(&HANDLERS);
    let rv = INSTALLED.get_or_init(|| {
        let rv = unsafe { platform::install_fault_handler(dispatch) };
        match rv {
            Ok(()) => {
                log::info!("vmem: fault handler installed");
                Ok(())
            }
            Err(err) => Err(err.raw_os_error().unwrap_or(0)),
        }
    });
    rv.map_err(|code| VmemError::FaultHandler(io::Error::from_raw_os_error(code)))
}

/// Offers a fault to the registered handlers. Called by the signal handler,
/// public so the decision can be exercised without raising a signal.
pub fn dispatch(host_addr: usize) -> bool {
    // Writers only hold the lock for a push or a retain, and never touch
    // guarded memory while they do, so waiting them out always ends.
    loop {
        let handlers = match HANDLERS.try_read() {
            Ok(handlers) => handlers,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => {
                std::hint::spin_loop();
                continue;
            }
        };
        return handlers.iter().any(|e| e.handler.on_write_fault(host_addr));
    }
}

/// Keeps a handler registered until dropped.
#[must_use = "the handler is unregistered when this is dropped"]
pub struct FaultRegistration {
    id: u64,
}

impl FaultRegistration {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for FaultRegistration {
    fn drop(&mut self) {
        let mut handlers = HANDLERS.write().unwrap_or_else(PoisonError::into_inner);
        handlers.retain(|e| e.id != self.id);
    }
}

pub fn register(handler: Arc<dyn FaultHandler>) -> Result<FaultRegistration> {
    install()?;
    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    HANDLERS
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .push(Entry { id, handler });
    log::debug!("vmem: fault handler {id} registered");
    Ok(FaultRegistration { id })
}

pub fn handler_count() -> usize {
    HANDLERS.read().unwrap_or_else(PoisonError::into_inner).len()
}
