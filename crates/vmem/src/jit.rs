//! Code buffers for generated host code.
//!
//! Two strategies produce a [`JitBlock`]:
//! - [`JitStrategy::Rwx`]: one mapping that is readable, writable and
//!   executable at once. Fails on hosts enforcing W^X.
//! - [`JitStrategy::DualView`]: two views of one shared memory object, read-write
//!   for the emitter and read-execute for running the code. Both views sit in
//!   one reservation so relative branches from the code to the rest of the
//!   process keep their reach.
//!
//! Writers only ever get the RW view, callers only ever jump through the RX view.

use std::ops::Range;

use crate::platform::{self, SharedMemory};
use crate::{Access, Result, VmemError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JitStrategy {
    Rwx,
    DualView,
}

/// Reserved address space for code, large enough for either strategy.
pub struct CodeArea {
    base: *mut u8,
    reserved: usize,
    size: usize,
}

impl CodeArea {
    /// Reserves room for `size` bytes of code (rounded up to pages).
    pub fn reserve(size: usize) -> Result<CodeArea> {
        let size = size.max(1).next_multiple_of(platform::page_size());
        let reserved = size * 2;
        let base = platform::reserve(reserved).map_err(|source| VmemError::Reserve {
            size: reserved,
            source,
        })?;
        Ok(CodeArea { base, reserved, size })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn base(&self) -> *mut u8 {
        self.base
    }
}

impl Drop for CodeArea {
    fn drop(&mut self) {
        if let Err(err) = unsafe { platform::release(self.base, self.reserved) } {
            log::error!("vmem: releasing code area at {:p} failed: {err}", self.base);
        }
    }
}

// The area is an address range, ownership moves with the value.
unsafe impl Send for CodeArea {}

pub struct JitBlock {
    strategy: JitStrategy,
    rw: *mut u8,
    rx: *mut u8,
    size: usize,
    _backing: Option<SharedMemory>,
    area: CodeArea,
}

unsafe impl Send for JitBlock {}

/// Turns a reserved area into a code buffer.
pub fn prepare_jit_block(area: CodeArea, strategy: JitStrategy) -> Result<JitBlock> {
    let size = area.size;
    let jit_err = |source| VmemError::Jit { size, source };

    let block = match strategy {
        JitStrategy::Rwx => {
            let rv = unsafe { platform::protect(area.base, size, Access::ReadWriteExec) };
            if let Err(err) = rv {
                log::debug!("vmem: mprotect rwx failed ({err}), remapping the area");
                unsafe { platform::map_rwx_fixed(area.base, size) }.map_err(jit_err)?;
            }
            JitBlock {
                strategy,
                rw: area.base,
                rx: area.base,
                size,
                _backing: None,
                area,
            }
        }
        JitStrategy::DualView => {
            let backing = SharedMemory::create(size).map_err(jit_err)?;
            let rx = area.base;
            let rw = area.base.wrapping_add(size);
            unsafe {
                platform::map_shared_fixed(backing.raw_fd(), 0, rx, size, Access::ReadExec)
                    .map_err(jit_err)?;
                platform::map_shared_fixed(backing.raw_fd(), 0, rw, size, Access::ReadWrite)
                    .map_err(jit_err)?;
            }
            JitBlock {
                strategy,
                rw,
                rx,
                size,
                _backing: Some(backing),
                area,
            }
        }
    };

    log::info!(
        "vmem: jit block {:?} of {:#x} bytes, rw {:p} rx {:p} rx_offset {}",
        block.strategy,
        block.size,
        block.rw,
        block.rx,
        block.rx_offset()
    );
    Ok(block)
}

impl JitBlock {
    pub fn strategy(&self) -> JitStrategy {
        self.strategy
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Constant displacement from the RW view to the RX view, zero for RWX.
    pub fn rx_offset(&self) -> isize {
        self.rx as isize - self.rw as isize
    }

    /// Copies `code` in through the RW view and makes it visible to the
    /// instruction stream.
    pub fn write(&mut self, offset: usize, code: &[u8]) -> Result<()> {
        self.check_range(offset, code.len())?;
        if self.strategy == JitStrategy::Rwx {
            platform::jit_write_protect(false);
        }
        unsafe {
            std::ptr::copy_nonoverlapping(code.as_ptr(), self.rw.add(offset), code.len());
        }
        if self.strategy == JitStrategy::Rwx {
            platform::jit_write_protect(true);
        }
        self.flush(offset..offset + code.len());
        Ok(())
    }

    /// The RW view. Call [`JitBlock::flush`] before running what was written.
    pub fn writer(&mut self) -> &mut [u8] {
        if self.strategy == JitStrategy::Rwx {
            platform::jit_write_protect(false);
        }
        unsafe { std::slice::from_raw_parts_mut(self.rw, self.size) }
    }

    pub fn flush(&self, range: Range<usize>) {
        let range = range.start.min(self.size)..range.end.min(self.size);
        if self.strategy == JitStrategy::Rwx {
            platform::jit_write_protect(true);
        }
        unsafe {
            flush_cache(
                self.rx.add(range.start)..self.rx.add(range.end),
                self.rw.add(range.start)..self.rw.add(range.end),
            );
        }
    }

    /// Execution address of `offset`, always in the RX view.
    pub fn exec_addr(&self, offset: usize) -> Result<*const u8> {
        self.check_range(offset, 1)?;
        Ok(self.rx.wrapping_add(offset))
    }

    fn check_range(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(VmemError::JitBounds {
                offset,
                len,
                size: self.size,
            }),
        }
    }

    pub fn area(&self) -> &CodeArea {
        &self.area
    }
}

/// Cache maintenance after writing code: invalidates the instruction cache
/// over `icache` and cleans the data cache over `dcache`. A no-op on hosts
/// with coherent caches.
///
/// # Safety
/// Both ranges must be mapped.
pub unsafe fn flush_cache(icache: Range<*mut u8>, dcache: Range<*mut u8>) {
    unsafe {
        platform::flush_icache(dcache.start, dcache.end);
        if icache != dcache {
            platform::flush_icache(icache.start, icache.end);
        }
    }
}
