//! OS primitives. Only the POSIX backend exists so far, a Windows one would
//! provide the same functions on top of `VirtualAlloc` and file mappings.

#[cfg(unix)]
mod posix;
#[cfg(unix)]
pub use posix::*;

#[cfg(not(unix))]
compile_error!("vmem currently only has a POSIX backend");
