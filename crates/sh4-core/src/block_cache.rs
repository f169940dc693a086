//! Decoded block store.
//!
//! Blocks are kept in slots and found by start PC, first through the page
//! lookup table living in front of the context (when there is one), then
//! through a hash map. Every block is also filed under the pages it was
//! decoded from so a write can find the blocks it invalidates.

use std::collections::HashMap;
use std::sync::Arc;

use vmem::{PageBitmap, VirtualMemory};

use crate::ir::{Block, Instr, normalize_code_addr};
use crate::sh4dec::decode;
use crate::sh4mem::{MemoryBus, read_mem};
use crate::smc::CodeGuard;

pub const MAX_BLOCK_INSTRS: usize = 64;
/// Blocks never run past a guest page.
pub const GUEST_PAGE_SIZE: u32 = 0x1000;

const RAM_BASE: u32 = 0x0C00_0000;
const CODE_WINDOW: usize = 0x0200_0000;

/// One `u32` per 2-byte code slot of the 32MB code window. Zero is empty,
/// anything else is a slot id plus one. Host pages are committed on first
/// write.
pub struct LookupTable<'vm> {
    vm: &'vm VirtualMemory,
    base: *mut u32,
    page_size: usize,
    committed: PageBitmap,
}

impl<'vm> LookupTable<'vm> {
    pub const SIZE: usize = (CODE_WINDOW >> 1) * size_of::<u32>();

    /// `None` when the reservation is too small to hold the table.
    pub fn new(vm: &'vm VirtualMemory, base: *mut u8, size: usize) -> Option<Self> {
        if size < Self::SIZE || base.is_null() {
            return None;
        }
        let page_size = vm.page_size();
        Some(Self {
            vm,
            base: base.cast(),
            page_size,
            committed: PageBitmap::new(Self::SIZE / page_size),
        })
    }

    fn index(pc: u32) -> usize {
        (pc as usize & (CODE_WINDOW - 1)) >> 1
    }

    pub fn get(&self, pc: u32) -> u32 {
        let idx = Self::index(pc);
        if !self.committed.test(idx * 4 / self.page_size) {
            return 0;
        }
        unsafe { self.base.add(idx).read() }
    }

    pub fn set(&mut self, pc: u32, entry: u32) {
        let idx = Self::index(pc);
        let page = idx * 4 / self.page_size;
        if !self.committed.test(page) {
            if entry == 0 {
                return;
            }
            self.committed.set(page);
            self.vm
                .ondemand_page(self.base.wrapping_add(page * self.page_size / 4).cast(), self.page_size);
        }
        unsafe { self.base.add(idx).write(entry) }
    }

    /// Decommits the whole table.
    pub fn clear(&mut self) {
        if self.committed.count() == 0 {
            return;
        }
        self.vm.reset_mem(self.base.cast(), Self::SIZE);
        self.committed.clear_all();
    }

    pub fn committed_pages(&self) -> usize {
        self.committed.count()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub builds: u64,
    pub hits: u64,
    pub invalidations: u64,
    pub resets: u64,
}

pub struct BlockCache<'vm> {
    slots: Vec<Option<Arc<Block>>>,
    free: Vec<u32>,
    by_pc: HashMap<u32, u32>,
    pages: HashMap<u32, Vec<u32>>,
    lookup: Option<LookupTable<'vm>>,
    guard: Option<Arc<CodeGuard>>,
    ram_mask: u32,
    page_size: u32,
    stats: CacheStats,
}

impl<'vm> BlockCache<'vm> {
    /// `page_size` is the invalidation granularity, the host page size when
    /// a guard is attached.
    pub fn new(ram_size: usize, page_size: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            by_pc: HashMap::new(),
            pages: HashMap::new(),
            lookup: None,
            guard: None,
            ram_mask: (ram_size as u32).wrapping_sub(1),
            page_size: page_size as u32,
            stats: CacheStats::default(),
        }
    }

    pub fn attach_lookup(&mut self, lookup: LookupTable<'vm>) {
        self.lookup = Some(lookup);
    }

    pub fn attach_guard(&mut self, guard: Arc<CodeGuard>) {
        self.guard = Some(guard);
    }

    pub fn guard(&self) -> Option<&Arc<CodeGuard>> {
        self.guard.as_ref()
    }

    pub fn lookup_table(&self) -> Option<&LookupTable<'vm>> {
        self.lookup.as_ref()
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    pub fn len(&self) -> usize {
        self.by_pc.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_pc.is_empty()
    }

    fn find_slot(&self, pc: u32) -> Option<u32> {
        if let Some(lookup) = &self.lookup {
            let entry = lookup.get(pc);
            if entry != 0 {
                let slot = entry - 1;
                let hit = self.slots.get(slot as usize).and_then(Option::as_ref);
                if hit.is_some_and(|b| b.start_pc == pc) {
                    return Some(slot);
                }
            }
        }
        self.by_pc.get(&pc).copied()
    }

    /// The cached block for `pc`, without building or verifying it.
    pub fn lookup(&self, pc: u32) -> Option<Arc<Block>> {
        let slot = self.find_slot(pc)?;
        self.slots[slot as usize].clone()
    }

    /// Whether `block` is still the cached block for its start PC.
    pub fn is_live(&self, block: &Arc<Block>) -> bool {
        self.lookup(block.start_pc).is_some_and(|b| Arc::ptr_eq(&b, block))
    }

    /// Returns the block for `pc`, decoding it when it is not cached or its
    /// source changed under an unguarded block.
    pub fn build_block<B: MemoryBus + ?Sized>(&mut self, pc: u32, bus: &mut B) -> Arc<Block> {
        if let Some(slot) = self.find_slot(pc) {
            if let Some(block) = self.slots[slot as usize].clone() {
                if block.guarded || Self::matches_memory(&block, bus) {
                    self.stats.hits += 1;
                    return block;
                }
                log::debug!("blocks: {pc:#010x} changed under an unguarded block");
                self.remove_slot(slot);
            }
        }

        let block = Arc::new(self.decode_block(pc, bus));
        self.insert(Arc::clone(&block));
        block
    }

    fn matches_memory<B: MemoryBus + ?Sized>(block: &Block, bus: &mut B) -> bool {
        block
            .instrs
            .iter()
            .all(|i| read_mem::<u16, B>(bus, i.pc) == i.raw)
    }

    fn decode_block<B: MemoryBus + ?Sized>(&mut self, pc: u32, bus: &mut B) -> Block {
        let mut instrs: Vec<Instr> = Vec::with_capacity(16);
        let mut cur = pc;
        loop {
            let instr = decode(cur, read_mem::<u16, B>(bus, cur));
            instrs.push(instr);
            cur = cur.wrapping_add(2);

            if instr.is_delayed() {
                // The slot belongs to the branch even across a page end.
                instrs.push(decode(cur, read_mem::<u16, B>(bus, cur)));
                cur = cur.wrapping_add(2);
                break;
            }
            if instr.ends_block() || instrs.len() >= MAX_BLOCK_INSTRS || cur % GUEST_PAGE_SIZE == 0 {
                break;
            }
        }

        let len = cur.wrapping_sub(pc);
        let start = normalize_code_addr(pc, self.ram_mask);
        let phys = start..start + len;

        let in_ram = start & 0x1C00_0000 == RAM_BASE && phys.end - RAM_BASE <= self.ram_mask + 1;
        let guarded = match &self.guard {
            Some(guard) if in_ram && bus.mem_ptr(pc, len).is_some() => {
                for page in self.page_keys(&phys) {
                    guard.protect_ram_page(page * self.page_size - RAM_BASE);
                }
                true
            }
            _ => false,
        };

        self.stats.builds += 1;
        log::debug!(
            "blocks: built {pc:#010x} ({} instrs, phys {:#010x}..{:#010x}{})",
            instrs.len(),
            phys.start,
            phys.end,
            if guarded { ", guarded" } else { "" }
        );

        Block {
            start_pc: pc,
            pc_next: cur,
            instrs: instrs.into_boxed_slice(),
            phys,
            guarded,
        }
    }

    fn page_keys(&self, phys: &std::ops::Range<u32>) -> std::ops::RangeInclusive<u32> {
        phys.start / self.page_size..=(phys.end - 1) / self.page_size
    }

    fn insert(&mut self, block: Arc<Block>) {
        let slot = match self.free.pop() {
            Some(slot) => slot,
            None => {
                self.slots.push(None);
                (self.slots.len() - 1) as u32
            }
        };
        for page in self.page_keys(&block.phys) {
            self.pages.entry(page).or_default().push(slot);
        }
        self.by_pc.insert(block.start_pc, slot);
        if let Some(lookup) = &mut self.lookup {
            lookup.set(block.start_pc, slot + 1);
        }
        self.slots[slot as usize] = Some(block);
    }

    fn remove_slot(&mut self, slot: u32) {
        let Some(block) = self.slots[slot as usize].take() else {
            return;
        };
        for page in self.page_keys(&block.phys) {
            if let Some(list) = self.pages.get_mut(&page) {
                list.retain(|&s| s != slot);
                if list.is_empty() {
                    self.pages.remove(&page);
                }
            }
        }
        if self.by_pc.get(&block.start_pc) == Some(&slot) {
            self.by_pc.remove(&block.start_pc);
        }
        if let Some(lookup) = &mut self.lookup {
            if lookup.get(block.start_pc) == slot + 1 {
                lookup.set(block.start_pc, 0);
            }
        }
        self.free.push(slot);
        self.stats.invalidations += 1;
    }

    /// Drops every block whose source range covers `addr`.
    pub fn invalidate_block(&mut self, addr: u32) -> usize {
        let phys = normalize_code_addr(addr, self.ram_mask);
        let victims: Vec<u32> = self
            .pages
            .get(&(phys / self.page_size))
            .into_iter()
            .flatten()
            .copied()
            .filter(|&s| self.slots[s as usize].as_ref().is_some_and(|b| b.covers(phys)))
            .collect();
        for &slot in &victims {
            self.remove_slot(slot);
        }
        if !victims.is_empty() {
            log::debug!("blocks: write to {addr:#010x} dropped {} blocks", victims.len());
        }
        victims.len()
    }

    /// Drops every block decoded from the page holding RAM offset `offset`.
    pub fn invalidate_ram_page(&mut self, offset: u32) -> usize {
        let key = (RAM_BASE + (offset & self.ram_mask)) / self.page_size;
        let victims = self.pages.get(&key).cloned().unwrap_or_default();
        for &slot in &victims {
            self.remove_slot(slot);
        }
        log::debug!("blocks: ram page {offset:#x} dropped {} blocks", victims.len());
        victims.len()
    }

    /// Drops everything, lifts all code protection and decommits the
    /// lookup table.
    pub fn reset(&mut self) {
        let dropped = self.by_pc.len();
        self.slots.clear();
        self.free.clear();
        self.by_pc.clear();
        self.pages.clear();
        if let Some(lookup) = &mut self.lookup {
            lookup.clear();
        }
        if let Some(guard) = &self.guard {
            guard.unprotect_all();
        }
        self.stats.resets += 1;
        log::debug!("blocks: cache reset, {dropped} blocks dropped");
    }

    pub fn clear_caches(&mut self) {
        self.reset();
    }
}
