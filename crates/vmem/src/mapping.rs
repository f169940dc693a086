use crate::platform;
use crate::{Access, error::fatal};

pub const SPACE_512M: u64 = 0x2000_0000;
pub const SPACE_4G: u64 = 0x1_0000_0000;

/// Writable ARAM window placed right after the 512MB space. Some games read
/// past the end of sound RAM so the whole window is filled with mirrors.
pub const ARAM_WINDOW: u64 = 0x80_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressSpace {
    /// 29 bit physical space, P0..P3 are folded by masking the address.
    Space512M,
    /// Full 32 bit space, every segment gets its own views.
    Space4G,
}

impl AddressSpace {
    pub const fn size(self) -> u64 {
        match self {
            AddressSpace::Space512M => SPACE_512M,
            AddressSpace::Space4G => SPACE_4G,
        }
    }

    /// Bytes reserved after the guest base.
    pub const fn reserved_size(self) -> u64 {
        match self {
            AddressSpace::Space512M => SPACE_512M + ARAM_WINDOW,
            AddressSpace::Space4G => SPACE_4G,
        }
    }

    /// Maps a guest address to its offset from the guest base.
    pub const fn offset_of(self, addr: u32) -> u64 {
        match self {
            AddressSpace::Space512M => (addr & 0x1FFF_FFFF) as u64,
            AddressSpace::Space4G => addr as u64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BackingRegion {
    pub offset: usize,
    pub size: usize,
}

impl BackingRegion {
    pub const fn end(&self) -> usize {
        self.offset + self.size
    }

    pub const fn contains(&self, offset: usize) -> bool {
        offset >= self.offset && offset < self.offset + self.size
    }
}

/// Where each guest memory lives inside the shared backing store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackingLayout {
    pub ram: BackingRegion,
    pub vram: BackingRegion,
    pub aram: BackingRegion,
    pub elan: BackingRegion,
}

impl BackingLayout {
    pub const fn new(ram: usize, vram: usize, aram: usize, elan: usize) -> Self {
        let ram = BackingRegion { offset: 0, size: ram };
        let vram = BackingRegion { offset: ram.end(), size: vram };
        let aram = BackingRegion { offset: vram.end(), size: aram };
        let elan = BackingRegion { offset: aram.end(), size: elan };
        Self { ram, vram, aram, elan }
    }

    pub const fn total(&self) -> usize {
        self.elan.end()
    }
}

/// Placement of one guest region inside the reserved range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    /// Offset from the guest base, inclusive.
    pub start: u64,
    /// Offset from the guest base, exclusive.
    pub end: u64,
    pub backing_offset: usize,
    /// Zero leaves the range reserved and inaccessible.
    pub backing_size: usize,
    pub allow_writes: bool,
}

impl Mapping {
    pub const fn unmapped(start: u64, end: u64) -> Self {
        Self {
            start,
            end,
            backing_offset: 0,
            backing_size: 0,
            allow_writes: false,
        }
    }

    pub const fn backed(start: u64, end: u64, region: BackingRegion, allow_writes: bool) -> Self {
        Self {
            start,
            end,
            backing_offset: region.offset,
            backing_size: region.size,
            allow_writes,
        }
    }

    pub const fn is_backed(&self) -> bool {
        self.backing_size != 0
    }

    pub const fn span(&self) -> u64 {
        self.end - self.start
    }

    /// Number of views, `None` when the span is not a whole number of copies.
    pub fn mirror_count(&self) -> Option<u64> {
        if !self.is_backed() {
            return Some(0);
        }
        let size = self.backing_size as u64;
        (self.span() % size == 0).then(|| self.span() / size)
    }

    /// Start offsets of every mirror.
    pub fn mirrors(&self) -> impl Iterator<Item = u64> + '_ {
        let count = self.mirror_count().unwrap_or(0);
        (0..count).map(move |i| self.start + i * self.backing_size as u64)
    }

    fn is_valid(&self) -> bool {
        self.start < self.end && self.mirror_count().is_some()
    }
}

const fn segment(base: u64, layout: &BackingLayout, aram_writable: bool) -> [Mapping; 11] {
    [
        Mapping::unmapped(base, base + 0x0080_0000),
        Mapping::backed(base + 0x0080_0000, base + 0x0100_0000, layout.aram, aram_writable),
        Mapping::unmapped(base + 0x0100_0000, base + 0x0280_0000),
        Mapping::backed(base + 0x0280_0000, base + 0x0300_0000, layout.aram, aram_writable),
        Mapping::unmapped(base + 0x0300_0000, base + 0x0400_0000),
        Mapping::backed(base + 0x0400_0000, base + 0x0500_0000, layout.vram, true),
        Mapping::unmapped(base + 0x0500_0000, base + 0x0600_0000),
        Mapping::backed(base + 0x0600_0000, base + 0x0700_0000, layout.vram, true),
        Mapping::unmapped(base + 0x0700_0000, base + 0x0A00_0000),
        Mapping::unmapped(base + 0x0A00_0000, base + 0x0C00_0000),
        Mapping::backed(base + 0x0C00_0000, base + 0x1000_0000, layout.ram, true),
    ]
}

/// The standard console layout. Area 0 (boot ROM, flash, registers) is left
/// unmapped and reaches the bus handlers instead.
pub fn dreamcast_mappings(space: AddressSpace, layout: &BackingLayout) -> Vec<Mapping> {
    fn push_segment(maps: &mut Vec<Mapping>, base: u64, layout: &BackingLayout, aram_writable: bool) {
        let mut seg = segment(base, layout, aram_writable);
        if layout.elan.size != 0 {
            seg[9] = Mapping::backed(base + 0x0A00_0000, base + 0x0C00_0000, layout.elan, true);
        }
        maps.extend(seg);
    }

    let mut maps = Vec::new();
    match space {
        AddressSpace::Space512M => {
            push_segment(&mut maps, 0, layout, false);
            maps.push(Mapping::unmapped(0x1000_0000, SPACE_512M));
            maps.push(Mapping::backed(SPACE_512M, SPACE_512M + ARAM_WINDOW, layout.aram, true));
        }
        AddressSpace::Space4G => {
            for base in [0x0000_0000, 0x8000_0000, 0xA000_0000, 0xC000_0000] {
                push_segment(&mut maps, base, layout, true);
                maps.push(Mapping::unmapped(base + 0x1000_0000, base + 0x2000_0000));
            }
            maps.push(Mapping::unmapped(0x2000_0000, 0x8000_0000));
            maps.push(Mapping::unmapped(0xE000_0000, SPACE_4G));
        }
    }
    maps.sort_by_key(|m| m.start);
    maps
}

/// One live view of the backing store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct View {
    pub host_start: usize,
    pub len: usize,
    pub guest_offset: u64,
    pub backing_offset: usize,
    pub writable: bool,
}

impl View {
    pub fn contains(&self, host: usize) -> bool {
        host >= self.host_start && host - self.host_start < self.len
    }
}

/// Result of resolving a host address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedAddr {
    pub backing_offset: usize,
    /// Offset from the guest base of the view that was hit.
    pub guest_offset: u64,
    pub writable: bool,
}

/// Snapshot of the views built by `create_mappings`, shared with fault
/// handlers so they never have to look at the `VirtualMemory` itself.
#[derive(Debug, Default)]
pub struct ViewTable {
    views: Vec<View>,
    page_size: usize,
}

impl ViewTable {
    pub(crate) fn build(base: usize, maps: &[Mapping], page_size: usize) -> Self {
        let mut views = Vec::new();
        for map in maps.iter().filter(|m| m.is_backed()) {
            for start in map.mirrors() {
                views.push(View {
                    host_start: base + start as usize,
                    len: map.backing_size,
                    guest_offset: start,
                    backing_offset: map.backing_offset,
                    writable: map.allow_writes,
                });
            }
        }
        views.sort_by_key(|v| v.host_start);
        Self { views, page_size }
    }

    pub fn views(&self) -> &[View] {
        &self.views
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn resolve(&self, host: usize) -> Option<ResolvedAddr> {
        let idx = self.views.partition_point(|v| v.host_start <= host);
        let view = self.views.get(idx.checked_sub(1)?)?;
        if !view.contains(host) {
            return None;
        }
        let delta = host - view.host_start;
        Some(ResolvedAddr {
            backing_offset: view.backing_offset + delta,
            guest_offset: view.guest_offset + delta as u64,
            writable: view.writable,
        })
    }

    /// Host ranges of every writable view that covers part of
    /// `[backing_offset, backing_offset + len)`.
    pub fn writable_ranges(
        &self,
        backing_offset: usize,
        len: usize,
    ) -> impl Iterator<Item = (usize, usize)> + '_ {
        let end = backing_offset + len;
        self.views.iter().filter(|v| v.writable).filter_map(move |v| {
            let lo = backing_offset.max(v.backing_offset);
            let hi = end.min(v.backing_offset + v.len);
            (lo < hi).then(|| (v.host_start + (lo - v.backing_offset), hi - lo))
        })
    }

    /// Applies `access` to every writable view of a page-aligned backing range.
    pub fn protect_backing(&self, backing_offset: usize, len: usize, access: Access) {
        for (host, size) in self.writable_ranges(backing_offset, len) {
            let (start, size) = page_span(host, size, self.page_size);
            if let Err(err) = unsafe { platform::protect(start as *mut u8, size, access) } {
                fatal!("protect {start:#x}+{size:#x} as {access:?} failed: {err}");
            }
        }
    }
}

pub(crate) fn page_span(addr: usize, len: usize, page_size: usize) -> (usize, usize) {
    let start = addr & !(page_size - 1);
    let end = (addr + len).next_multiple_of(page_size);
    (start, end - start)
}

pub(crate) fn validate(maps: &[Mapping]) -> Result<(), &Mapping> {
    match maps.iter().find(|m| !m.is_valid()) {
        Some(bad) => Err(bad),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dc_layout() -> BackingLayout {
        BackingLayout::new(0x100_0000, 0x80_0000, 0x20_0000, 0)
    }

    #[test]
    fn mirror_counts() {
        let layout = dc_layout();
        let ram = Mapping::backed(0x0C00_0000, 0x1000_0000, layout.ram, true);
        assert_eq!(ram.mirror_count(), Some(4));
        let starts: Vec<u64> = ram.mirrors().collect();
        assert_eq!(starts, vec![0x0C00_0000, 0x0D00_0000, 0x0E00_0000, 0x0F00_0000]);

        let odd = Mapping::backed(0, 0x300_0000, layout.ram, true);
        assert_eq!(odd.mirror_count(), Some(3));
        let bad = Mapping::backed(0, 0x90_0000, layout.vram, true);
        assert_eq!(bad.mirror_count(), None);
    }

    #[test]
    fn dreamcast_tables_are_contiguous() {
        for space in [AddressSpace::Space512M, AddressSpace::Space4G] {
            let maps = dreamcast_mappings(space, &dc_layout());
            assert!(validate(&maps).is_ok());
            let mut cursor = 0;
            for map in &maps {
                assert_eq!(map.start, cursor, "gap before {map:?}");
                cursor = map.end;
            }
            assert_eq!(cursor, space.reserved_size());
        }
    }

    #[test]
    fn validate_reports_the_bad_mapping() {
        let layout = dc_layout();
        let mut maps = dreamcast_mappings(AddressSpace::Space512M, &layout);
        maps.push(Mapping::backed(0, 0x90_0000, layout.vram, true));
        let bad = validate(&maps).unwrap_err();
        assert_eq!(bad.end, 0x90_0000);
        assert_eq!(bad.backing_size, layout.vram.size);
    }

    #[test]
    fn resolve_through_mirrors() {
        let layout = dc_layout();
        let maps = dreamcast_mappings(AddressSpace::Space512M, &layout);
        let table = ViewTable::build(0x1000_0000_0000, &maps, 4096);

        let hit = table.resolve(0x1000_0000_0000 + 0x0D00_1234).unwrap();
        assert_eq!(hit.backing_offset, 0x1234);
        assert_eq!(hit.guest_offset, 0x0D00_1234);

        let vram = table.resolve(0x1000_0000_0000 + 0x0680_0010).unwrap();
        assert_eq!(vram.backing_offset, layout.vram.offset + 0x10);

        assert!(table.resolve(0x1000_0000_0000 + 0x0800_0000).is_none());
        assert!(table.resolve(0x10).is_none());

        let aram_ro = table.resolve(0x1000_0000_0000 + 0x0080_0004).unwrap();
        assert!(!aram_ro.writable);

        // RAM is visible 4 times, all writable.
        assert_eq!(table.writable_ranges(0x2000, 0x1000).count(), 4);
        // ARAM has 8 read-only views in the low area and 4 writable ones after 512MB.
        assert_eq!(table.writable_ranges(layout.aram.offset, 0x1000).count(), 4);
    }
}
