//! Write-trap watchers over guest memory regions.
//!
//! A watcher write-protects pages of one backing region. The first write to a
//! protected page faults, the watcher marks the page dirty and unprotects it,
//! and the store goes through. Device models use this to learn which parts of
//! VRAM or sound RAM changed since they last looked.

use std::sync::Arc;

use crate::fault::FaultHandler;
use crate::mapping::{BackingLayout, BackingRegion, ViewTable};
use crate::pages::PageBitmap;
use crate::{Access, VirtualMemory};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchKind {
    Vram,
    Aram,
    ElanRam,
}

impl WatchKind {
    pub fn name(self) -> &'static str {
        match self {
            WatchKind::Vram => "vram",
            WatchKind::Aram => "aram",
            WatchKind::ElanRam => "elan",
        }
    }

    pub fn region(self, layout: &BackingLayout) -> BackingRegion {
        match self {
            WatchKind::Vram => layout.vram,
            WatchKind::Aram => layout.aram,
            WatchKind::ElanRam => layout.elan,
        }
    }
}

pub struct MemWatcher {
    kind: WatchKind,
    region: BackingRegion,
    views: Arc<ViewTable>,
    page_size: usize,
    protected: PageBitmap,
    dirty: PageBitmap,
}

impl MemWatcher {
    /// `None` when the region does not exist on this system. The watcher sees
    /// the views of the current mappings, rebuild it after `create_mappings`.
    pub fn new(vm: &VirtualMemory, kind: WatchKind) -> Option<Arc<MemWatcher>> {
        let region = kind.region(vm.backing_layout());
        if region.size == 0 {
            return None;
        }
        let page_size = vm.page_size();
        let pages = region.size / page_size;
        Some(Arc::new(MemWatcher {
            kind,
            region,
            views: vm.views(),
            page_size,
            protected: PageBitmap::new(pages),
            dirty: PageBitmap::new(pages),
        }))
    }

    pub fn kind(&self) -> WatchKind {
        self.kind
    }

    pub fn size(&self) -> u32 {
        self.region.size as u32
    }

    fn page_range(&self, offset: u32, size: u32) -> std::ops::Range<usize> {
        let start = (offset as usize).min(self.region.size) / self.page_size;
        let end = (offset as usize + size as usize)
            .min(self.region.size)
            .div_ceil(self.page_size);
        start..end
    }

    /// Starts trapping writes to the pages covering `[offset, offset + size)`.
    pub fn protect_mem(&self, offset: u32, size: u32) {
        let pages = self.page_range(offset, size);
        if pages.is_empty() {
            return;
        }
        for page in pages.clone() {
            self.protected.set(page);
        }
        self.views.protect_backing(
            self.region.offset + pages.start * self.page_size,
            pages.len() * self.page_size,
            Access::Read,
        );
        log::trace!(
            "vmem: {} protect {:#x}+{:#x}",
            self.kind.name(),
            pages.start * self.page_size,
            pages.len() * self.page_size
        );
    }

    pub fn unprotect_mem(&self, offset: u32, size: u32) {
        let pages = self.page_range(offset, size);
        if pages.is_empty() {
            return;
        }
        for page in pages.clone() {
            self.protected.clear(page);
        }
        self.views.protect_backing(
            self.region.offset + pages.start * self.page_size,
            pages.len() * self.page_size,
            Access::ReadWrite,
        );
    }

    pub fn is_protected(&self, offset: u32) -> bool {
        self.protected.test(offset as usize / self.page_size)
    }

    /// Region-relative offset of `host`, or `None` when it is outside the region.
    pub fn get_mem_offset(&self, host: *const u8) -> Option<u32> {
        let hit = self.views.resolve(host as usize)?;
        self.region
            .contains(hit.backing_offset)
            .then(|| (hit.backing_offset - self.region.offset) as u32)
    }

    /// Handles a write to `host`. Returns false when the address is not a
    /// writable view of this region.
    pub fn hit(&self, host: usize) -> bool {
        let Some(hit) = self.views.resolve(host) else {
            return false;
        };
        if !hit.writable || !self.region.contains(hit.backing_offset) {
            return false;
        }
        let page = (hit.backing_offset - self.region.offset) / self.page_size;
        // A cleared bit means another thread won the race for this page, the
        // protection is already being lifted.
        if self.protected.clear(page) {
            self.dirty.set(page);
        }
        self.views.protect_backing(
            self.region.offset + page * self.page_size,
            self.page_size,
            Access::ReadWrite,
        );
        true
    }

    /// Region offsets of the pages written since the last call.
    pub fn take_dirty(&self) -> Vec<u32> {
        self.dirty
            .take_all()
            .into_iter()
            .map(|page| (page * self.page_size) as u32)
            .collect()
    }

    /// Drops every protection and forgets dirty pages.
    pub fn reset(&self) {
        self.unprotect_mem(0, self.size());
        self.dirty.clear_all();
    }
}

impl FaultHandler for MemWatcher {
    fn on_write_fault(&self, host_addr: usize) -> bool {
        self.hit(host_addr)
    }
}
