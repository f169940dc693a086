//! Host virtual memory backing the SH4 core.
//!
//! One contiguous reservation holds, in order, the block lookup table, the
//! CPU context and the unified guest address space. Guest RAM, VRAM, ARAM and
//! Elan RAM live in one shared memory object that is mapped into the guest
//! space as many times as the console mirrors it, so the core never has to
//! mask addresses on the fast path.
//!
//! ```text
//! context_base                                 vmem_base
//! | lookup table (on demand) | context area    | guest space (512MB or 4GB) | ARAM window |
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

mod error;
pub mod fault;
pub mod jit;
mod mapping;
mod pages;
mod platform;
pub mod watch;

pub use error::{Result, VmemError};
pub use fault::{FaultHandler, FaultRegistration};
pub use jit::{CodeArea, JitBlock, JitStrategy, flush_cache, prepare_jit_block};
pub use mapping::{
    ARAM_WINDOW, AddressSpace, BackingLayout, BackingRegion, Mapping, ResolvedAddr, SPACE_4G,
    SPACE_512M, View, ViewTable, dreamcast_mappings,
};
pub use pages::PageBitmap;
pub use watch::{MemWatcher, WatchKind};

use error::fatal;
use mapping::page_span;
use platform::SharedMemory;

/// Alignment of the guest base and of the areas in front of it.
pub const RESERVATION_ALIGN: usize = 0x1_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    None,
    Read,
    ReadWrite,
    ReadExec,
    ReadWriteExec,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmemConfig {
    pub ram_size: usize,
    pub vram_size: usize,
    pub aram_size: usize,
    /// Zero on systems without the Elan geometry processor.
    pub elan_ram_size: usize,
    /// Try the 4GB layout first, falling back to 512MB.
    pub prefer_4gb: bool,
    /// Bytes needed for the CPU context, placed right before the guest base.
    pub context_size: usize,
    /// Bytes of lookup table placed before the context.
    pub lookup_table_size: usize,
}

impl VmemConfig {
    pub fn dreamcast() -> Self {
        Self {
            ram_size: 16 * 1024 * 1024,
            vram_size: 8 * 1024 * 1024,
            aram_size: 2 * 1024 * 1024,
            elan_ram_size: 0,
            prefer_4gb: false,
            context_size: RESERVATION_ALIGN,
            lookup_table_size: 0,
        }
    }

    pub fn naomi() -> Self {
        Self {
            ram_size: 32 * 1024 * 1024,
            vram_size: 16 * 1024 * 1024,
            aram_size: 8 * 1024 * 1024,
            ..Self::dreamcast()
        }
    }

    pub fn naomi2() -> Self {
        Self {
            elan_ram_size: 32 * 1024 * 1024,
            ..Self::naomi()
        }
    }

    pub fn with_context(mut self, context_size: usize, lookup_table_size: usize) -> Self {
        self.context_size = context_size;
        self.lookup_table_size = lookup_table_size;
        self
    }

    pub fn backing_layout(&self) -> BackingLayout {
        BackingLayout::new(
            self.ram_size,
            self.vram_size,
            self.aram_size,
            self.elan_ram_size,
        )
    }

    fn validate(&self, page_size: usize) -> Result<()> {
        let sized = |size: usize| size.is_power_of_two() && size % page_size == 0;
        if !sized(self.ram_size) || !sized(self.vram_size) || !sized(self.aram_size) {
            return Err(VmemError::Config(
                "ram, vram and aram sizes must be page multiples and powers of two",
            ));
        }
        if self.elan_ram_size != 0 && !sized(self.elan_ram_size) {
            return Err(VmemError::Config("elan ram size must be a page multiple and a power of two"));
        }
        if self.ram_size > 0x0100_0000 * 4 || self.vram_size > 0x0100_0000 {
            return Err(VmemError::Config("ram or vram does not fit its guest area"));
        }
        if self.aram_size as u64 > ARAM_WINDOW {
            return Err(VmemError::Config("aram does not fit its guest area"));
        }
        if self.context_size == 0 {
            return Err(VmemError::Config("context size must not be zero"));
        }
        Ok(())
    }
}

impl Default for VmemConfig {
    fn default() -> Self {
        Self::dreamcast()
    }
}

/// The reserved address range and its backing store.
///
/// Reconfiguration (`create_mappings`) needs `&mut self`, so it cannot happen
/// while an engine holds a shared borrow of the memory.
pub struct VirtualMemory {
    config: VmemConfig,
    space: AddressSpace,
    layout: BackingLayout,
    backing: SharedMemory,
    raw_base: *mut u8,
    raw_size: usize,
    context_base: *mut u8,
    vmem_base: *mut u8,
    lookup_size: usize,
    context_area_size: usize,
    page_size: usize,
    mappings: Vec<Mapping>,
    views: Arc<ViewTable>,
    context_claimed: AtomicBool,
}

// The raw pointers describe a process-wide reservation, not thread-local data.
unsafe impl Send for VirtualMemory {}
unsafe impl Sync for VirtualMemory {}

impl VirtualMemory {
    /// Creates the backing store and reserves the address range. This is the
    /// only recoverable failure in the crate, callers without fast memory
    /// must use a slower addressing mode.
    pub fn init(config: VmemConfig) -> Result<Self> {
        let page_size = platform::page_size();
        config.validate(page_size)?;

        let layout = config.backing_layout();
        let backing = SharedMemory::create(layout.total()).map_err(|source| VmemError::Backing {
            size: layout.total(),
            source,
        })?;

        let lookup_size = config.lookup_table_size.next_multiple_of(RESERVATION_ALIGN);
        let context_area_size = config.context_size.next_multiple_of(RESERVATION_ALIGN);
        let prefix = lookup_size + context_area_size;

        let mut last_err = None;
        for space in Self::candidate_spaces(&config) {
            let raw_size = prefix + space.reserved_size() as usize + RESERVATION_ALIGN;
            let raw_base = match platform::reserve(raw_size) {
                Ok(base) => base,
                Err(source) => {
                    log::warn!("vmem: could not reserve {raw_size:#x} bytes for {space:?}: {source}");
                    last_err = Some(VmemError::Reserve { size: raw_size, source });
                    continue;
                }
            };

            let aligned = (raw_base as usize).next_multiple_of(RESERVATION_ALIGN) as *mut u8;
            let context_base = aligned;
            let vmem_base = aligned.wrapping_add(prefix);

            let vm = VirtualMemory {
                config: config.clone(),
                space,
                layout,
                backing,
                raw_base,
                raw_size,
                context_base,
                vmem_base,
                lookup_size,
                context_area_size,
                page_size,
                mappings: Vec::new(),
                views: Arc::new(ViewTable::default()),
                context_claimed: AtomicBool::new(false),
            };

            // The lookup table stays inaccessible until it is paged in.
            let (ctx, ctx_size) = vm.context_area();
            if let Err(err) = unsafe { platform::protect(ctx, ctx_size, Access::ReadWrite) } {
                fatal!("unlocking the context area failed: {err}");
            }

            log::info!(
                "vmem: {:?} address space at {:p}, context block at {:p} ({:#x} lookup, {:#x} context)",
                space,
                vmem_base,
                context_base,
                lookup_size,
                context_area_size
            );
            return Ok(vm);
        }

        Err(last_err.unwrap_or(VmemError::Unsupported))
    }

    fn candidate_spaces(config: &VmemConfig) -> Vec<AddressSpace> {
        if config.prefer_4gb && cfg!(target_pointer_width = "64") {
            vec![AddressSpace::Space4G, AddressSpace::Space512M]
        } else {
            vec![AddressSpace::Space512M]
        }
    }

    pub fn config(&self) -> &VmemConfig {
        &self.config
    }

    pub fn address_space(&self) -> AddressSpace {
        self.space
    }

    pub fn backing_layout(&self) -> &BackingLayout {
        &self.layout
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn vmem_base(&self) -> *mut u8 {
        self.vmem_base
    }

    pub fn context_base(&self) -> *mut u8 {
        self.context_base
    }

    /// Start and size of the lookup table reservation.
    pub fn lookup_table(&self) -> (*mut u8, usize) {
        (self.context_base, self.lookup_size)
    }

    /// Start and size of the always-accessible context area, which ends at
    /// the guest base.
    pub fn context_area(&self) -> (*mut u8, usize) {
        (self.context_base.wrapping_add(self.lookup_size), self.context_area_size)
    }

    /// Hands out the context block to a single owner at a time.
    pub fn claim_context(&self) -> Option<ContextClaim<'_>> {
        self.context_claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        Some(ContextClaim { vm: self })
    }

    pub fn mappings(&self) -> &[Mapping] {
        &self.mappings
    }

    /// Views built by the last `create_mappings`.
    pub fn views(&self) -> Arc<ViewTable> {
        Arc::clone(&self.views)
    }

    /// Binds `maps` into the guest space, replacing any previous mappings.
    pub fn create_mappings(&mut self, maps: &[Mapping]) {
        if let Err(bad) = mapping::validate(maps) {
            fatal!("invalid mapping {bad:x?}");
        }
        let reserved = self.space.reserved_size();
        if let Some(bad) = maps.iter().find(|m| m.end > reserved) {
            fatal!("mapping {bad:x?} exceeds the {reserved:#x} byte guest space");
        }
        if let Some(bad) = maps
            .iter()
            .find(|m| m.is_backed() && m.backing_offset + m.backing_size > self.backing.size())
        {
            fatal!("mapping {bad:x?} exceeds the backing store");
        }

        // Drop every previous view in one go.
        if let Err(err) = unsafe { platform::reserve_fixed(self.vmem_base, reserved as usize) } {
            fatal!("re-reserving the guest space failed: {err}");
        }

        for map in maps.iter().filter(|m| m.is_backed()) {
            let access = if map.allow_writes { Access::ReadWrite } else { Access::Read };
            for start in map.mirrors() {
                let addr = self.vmem_base.wrapping_add(start as usize);
                let rv = unsafe {
                    platform::map_shared_fixed(
                        self.backing.raw_fd(),
                        map.backing_offset,
                        addr,
                        map.backing_size,
                        access,
                    )
                };
                if let Err(err) = rv {
                    fatal!("mapping {map:x?} at {addr:p} failed: {err}");
                }
            }
            log::debug!(
                "vmem: {:#010x}..{:#010x} -> backing {:#x}+{:#x} x{} {:?}",
                map.start,
                map.end,
                map.backing_offset,
                map.backing_size,
                map.mirror_count().unwrap_or(0),
                access
            );
        }

        self.mappings = maps.to_vec();
        self.views = Arc::new(ViewTable::build(self.vmem_base as usize, maps, self.page_size));
    }

    /// Binds the console's standard memory map for the reserved space size.
    pub fn create_default_mappings(&mut self) {
        let maps = dreamcast_mappings(self.space, &self.layout);
        self.create_mappings(&maps);
    }

    /// Host pointer for a guest offset, if that offset is backed.
    pub fn guest_ptr(&self, offset: u64) -> Option<*mut u8> {
        self.mappings
            .iter()
            .find(|m| m.is_backed() && offset >= m.start && offset < m.end)
            .map(|_| self.vmem_base.wrapping_add(offset as usize))
    }

    /// Maps a guest address through the address space folding rules.
    pub fn guest_addr_ptr(&self, addr: u32) -> Option<*mut u8> {
        self.guest_ptr(self.space.offset_of(addr))
    }

    pub fn ondemand_page(&self, addr: *mut u8, size: usize) {
        let (start, len) = page_span(addr as usize, size, self.page_size);
        if let Err(err) = unsafe { platform::protect(start as *mut u8, len, Access::ReadWrite) } {
            fatal!("committing {start:#x}+{len:#x} failed: {err}");
        }
    }

    pub fn reset_mem(&self, addr: *mut u8, size: usize) {
        let (start, len) = page_span(addr as usize, size, self.page_size);
        if let Err(err) = unsafe { platform::decommit(start as *mut u8, len) } {
            fatal!("decommitting {start:#x}+{len:#x} failed: {err}");
        }
    }

    pub fn region_lock(&self, addr: *mut u8, len: usize) {
        let (start, len) = page_span(addr as usize, len, self.page_size);
        if let Err(err) = unsafe { platform::protect(start as *mut u8, len, Access::Read) } {
            fatal!("locking {start:#x}+{len:#x} failed: {err}");
        }
    }

    pub fn region_unlock(&self, addr: *mut u8, len: usize) {
        let (start, len) = page_span(addr as usize, len, self.page_size);
        if let Err(err) = unsafe { platform::protect(start as *mut u8, len, Access::ReadWrite) } {
            fatal!("unlocking {start:#x}+{len:#x} failed: {err}");
        }
    }

    /// Write-protects a backing range through every writable view.
    pub fn lock_backing(&self, backing_offset: usize, len: usize) {
        self.views.protect_backing(backing_offset, len, Access::Read);
    }

    pub fn unlock_backing(&self, backing_offset: usize, len: usize) {
        self.views.protect_backing(backing_offset, len, Access::ReadWrite);
    }
}

impl Drop for VirtualMemory {
    fn drop(&mut self) {
        if let Err(err) = unsafe { platform::release(self.raw_base, self.raw_size) } {
            log::error!("vmem: releasing the reservation failed: {err}");
        }
    }
}

/// Exclusive access to the context block of a `VirtualMemory`.
pub struct ContextClaim<'a> {
    vm: &'a VirtualMemory,
}

impl<'a> ContextClaim<'a> {
    pub fn vm(&self) -> &'a VirtualMemory {
        self.vm
    }

    /// Address of a `size` byte context that ends exactly at the guest base.
    pub fn context_ptr(&self, size: usize) -> Result<*mut u8> {
        let (_, area) = self.vm.context_area();
        if size > area {
            return Err(VmemError::ContextTooLarge { size, area });
        }
        Ok(self.vm.vmem_base.wrapping_sub(size))
    }

    pub fn lookup_table(&self) -> (*mut u8, usize) {
        self.vm.lookup_table()
    }
}

impl Drop for ContextClaim<'_> {
    fn drop(&mut self) {
        self.vm.context_claimed.store(false, Ordering::Release);
    }
}
