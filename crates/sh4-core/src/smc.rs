//! Self-modifying code detection.
//!
//! RAM pages that cached blocks were decoded from are write-protected. A
//! guest store into one of them faults; the guard lifts the protection,
//! notes the RAM offset in a lock-free log and lets the store retry. The
//! engine drains the log at the next boundary and drops the stale blocks.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use vmem::{Access, BackingRegion, FaultHandler, PageBitmap, ViewTable, VirtualMemory};

pub const FAULT_LOG_CAPACITY: usize = 64;

const EMPTY: u32 = u32::MAX;
/// Logged when a fault could not be tied to a tracked page.
pub const UNRESOLVED: u32 = u32::MAX - 1;

/// RAM offset written by a store to `host`, if `host` is a writable RAM view.
pub fn resolve_code_write(views: &ViewTable, ram: BackingRegion, host: usize) -> Option<u32> {
    let hit = views.resolve(host)?;
    if !hit.writable || !ram.contains(hit.backing_offset) {
        return None;
    }
    Some((hit.backing_offset - ram.offset) as u32)
}

/// Fixed-size log filled from the fault handler. Entries past the capacity
/// only set the overflow flag.
pub struct FaultLog {
    entries: [AtomicU32; FAULT_LOG_CAPACITY],
    len: AtomicUsize,
    overflow: AtomicBool,
}

impl Default for FaultLog {
    fn default() -> Self {
        Self {
            entries: std::array::from_fn(|_| AtomicU32::new(EMPTY)),
            len: AtomicUsize::new(0),
            overflow: AtomicBool::new(false),
        }
    }
}

impl FaultLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, offset: u32) {
        let idx = self.len.fetch_add(1, Ordering::AcqRel);
        match self.entries.get(idx) {
            Some(slot) => slot.store(offset, Ordering::Release),
            None => self.overflow.store(true, Ordering::Release),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len.load(Ordering::Acquire) == 0 && !self.overflow.load(Ordering::Acquire)
    }

    /// Moves the logged offsets into `out`. Returns true when the log cannot
    /// be trusted entry by entry and the whole cache must go.
    pub fn drain_into(&self, out: &mut Vec<u32>) -> bool {
        let len = self.len.swap(0, Ordering::AcqRel);
        let mut coarse = self.overflow.swap(false, Ordering::AcqRel);
        for slot in &self.entries[..len.min(FAULT_LOG_CAPACITY)] {
            match slot.swap(EMPTY, Ordering::AcqRel) {
                // A push that has claimed the slot but not stored yet.
                EMPTY | UNRESOLVED => coarse = true,
                offset => out.push(offset),
            }
        }
        coarse
    }
}

/// Write-protects RAM pages holding cached code.
pub struct CodeGuard {
    views: Arc<ViewTable>,
    ram: BackingRegion,
    page_size: usize,
    protected: PageBitmap,
    log: FaultLog,
}

impl CodeGuard {
    pub fn new(vm: &VirtualMemory) -> Arc<CodeGuard> {
        let ram = vm.backing_layout().ram;
        let page_size = vm.page_size();
        Arc::new(CodeGuard {
            views: vm.views(),
            ram,
            page_size,
            protected: PageBitmap::new(ram.size / page_size),
            log: FaultLog::new(),
        })
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn ram_size(&self) -> usize {
        self.ram.size
    }

    /// Protects the host page holding RAM offset `offset` in every view.
    pub fn protect_ram_page(&self, offset: u32) {
        let page = offset as usize / self.page_size;
        if page * self.page_size >= self.ram.size || self.protected.set(page) {
            return;
        }
        self.views
            .protect_backing(self.ram.offset + page * self.page_size, self.page_size, Access::Read);
        log::trace!("smc: protect ram page {:#x}", page * self.page_size);
    }

    pub fn unprotect_all(&self) {
        let pages = self.protected.take_all();
        for &page in &pages {
            self.views.protect_backing(
                self.ram.offset + page * self.page_size,
                self.page_size,
                Access::ReadWrite,
            );
        }
        if !pages.is_empty() {
            log::debug!("smc: unprotected {} ram pages", pages.len());
        }
    }

    pub fn is_protected(&self, offset: u32) -> bool {
        self.protected.test(offset as usize / self.page_size)
    }

    pub fn protected_pages(&self) -> usize {
        self.protected.count()
    }

    pub fn log(&self) -> &FaultLog {
        &self.log
    }
}

impl FaultHandler for CodeGuard {
    fn on_write_fault(&self, host_addr: usize) -> bool {
        let Some(offset) = resolve_code_write(&self.views, self.ram, host_addr) else {
            return false;
        };
        let page = offset as usize / self.page_size;
        if self.protected.clear(page) {
            self.log.push(offset);
        } else {
            // Another thread lifted it first, or it was never ours.
            self.log.push(UNRESOLVED);
        }
        self.views
            .protect_backing(self.ram.offset + page * self.page_size, self.page_size, Access::ReadWrite);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmem::VmemConfig;

    #[test]
    fn log_drains_in_order() {
        let log = FaultLog::new();
        assert!(log.is_empty());
        log.push(0x1000);
        log.push(0x2004);
        let mut out = Vec::new();
        assert!(!log.drain_into(&mut out));
        assert_eq!(out, [0x1000, 0x2004]);
        assert!(log.is_empty());
    }

    #[test]
    fn overflow_forces_coarse_reset() {
        let log = FaultLog::new();
        for i in 0..FAULT_LOG_CAPACITY as u32 + 3 {
            log.push(i * 4);
        }
        let mut out = Vec::new();
        assert!(log.drain_into(&mut out));
        assert_eq!(out.len(), FAULT_LOG_CAPACITY);

        out.clear();
        log.push(UNRESOLVED);
        assert!(log.drain_into(&mut out));
        assert!(out.is_empty());
    }

    #[test]
    fn resolves_only_writable_ram() {
        let mut vm = VirtualMemory::init(VmemConfig::dreamcast()).expect("vmem");
        vm.create_default_mappings();
        let views = vm.views();
        let ram = vm.backing_layout().ram;
        let base = vm.vmem_base() as usize;

        assert_eq!(resolve_code_write(&views, ram, base + 0x0C00_1234), Some(0x1234));
        // Third mirror of RAM.
        assert_eq!(resolve_code_write(&views, ram, base + 0x0E00_0010), Some(0x10));
        // VRAM is not code.
        assert_eq!(resolve_code_write(&views, ram, base + 0x0400_0000), None);
        // Area 0 is not mapped.
        assert_eq!(resolve_code_write(&views, ram, base + 0x10), None);
    }

    #[test]
    fn guard_claims_each_page_once() {
        let mut vm = VirtualMemory::init(VmemConfig::dreamcast()).expect("vmem");
        vm.create_default_mappings();
        let guard = CodeGuard::new(&vm);
        let ps = guard.page_size() as u32;
        let host = vm.vmem_base() as usize + 0x0C00_0000 + 2 * ps as usize + 8;

        guard.protect_ram_page(2 * ps);
        assert!(guard.is_protected(2 * ps + 100));
        assert!(guard.on_write_fault(host));
        assert!(!guard.is_protected(2 * ps));

        let mut out = Vec::new();
        assert!(!guard.log().drain_into(&mut out));
        assert_eq!(out, [2 * ps + 8]);

        // Not ours: the caller learns nothing reliable.
        assert!(guard.on_write_fault(host));
        assert!(guard.log().drain_into(&mut out));

        assert!(!guard.on_write_fault(vm.vmem_base() as usize + 0x0400_0000));
        guard.unprotect_all();
    }
}
