use std::fmt;
use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, VmemError>;

#[derive(Debug, Error)]
pub enum VmemError {
    #[error("invalid configuration: {0}")]
    Config(&'static str),

    #[error("failed to create {size:#x} byte shared memory backing: {source}")]
    Backing {
        size: usize,
        #[source]
        source: io::Error,
    },

    #[error("failed to reserve {size:#x} bytes of address space: {source}")]
    Reserve {
        size: usize,
        #[source]
        source: io::Error,
    },

    #[error("failed to prepare {size:#x} byte jit block: {source}")]
    Jit {
        size: usize,
        #[source]
        source: io::Error,
    },

    #[error("a {size:#x} byte context does not fit the {area:#x} byte context area")]
    ContextTooLarge { size: usize, area: usize },

    #[error("{len:#x} bytes at {offset:#x} run past the {size:#x} byte jit block")]
    JitBounds { offset: usize, len: usize, size: usize },

    #[error("failed to install fault handler: {0}")]
    FaultHandler(#[source] io::Error),

    #[error("fast memory is not supported on this platform")]
    Unsupported,
}

/// Address space changes after `init` cannot be rolled back, code already
/// generated against the old layout would run on garbage.
#[cold]
#[inline(never)]
pub fn fatal_impl(args: fmt::Arguments<'_>) -> ! {
    log::error!("vmem: {args}");
    std::process::abort();
}

macro_rules! fatal {
    ($($arg:tt)*) => {
        $crate::error::fatal_impl(format_args!($($arg)*))
    };
}

pub(crate) use fatal;
