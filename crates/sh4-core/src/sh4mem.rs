use std::marker::PhantomData;
use std::ptr;

use thiserror::Error;
use vmem::VirtualMemory;

mod sealed {
    pub trait IntType {}
    impl IntType for u8 {}
    impl IntType for u16 {}
    impl IntType for u32 {}
    impl IntType for u64 {}
}

/// Guest memory as seen by the CPU. Every access goes through here, so a
/// bus decides what is plain memory and what is a device.
pub trait MemoryBus {
    fn read8(&mut self, addr: u32) -> u8;
    fn read16(&mut self, addr: u32) -> u16;
    fn read32(&mut self, addr: u32) -> u32;
    fn read64(&mut self, addr: u32) -> u64;
    fn write8(&mut self, addr: u32, value: u8);
    fn write16(&mut self, addr: u32, value: u16);
    fn write32(&mut self, addr: u32, value: u32);
    fn write64(&mut self, addr: u32, value: u64);

    /// Host pointer for `size` bytes at `addr` when they are plain memory.
    fn mem_ptr(&mut self, addr: u32, size: u32) -> Option<*mut u8>;
}

pub trait MemoryData: sealed::IntType + Copy + Default + std::fmt::LowerHex {
    fn from_u32(v: u32) -> Self;
    fn to_u32(self) -> u32;
    fn read_from<B: MemoryBus + ?Sized>(bus: &mut B, addr: u32) -> Self;
    fn write_to<B: MemoryBus + ?Sized>(self, bus: &mut B, addr: u32);
    fn mmio_read(handler: &mut dyn MmioHandler, offset: u32) -> Self;
    fn mmio_write(self, handler: &mut dyn MmioHandler, offset: u32);
}

macro_rules! memory_data {
    ($($ty:ty => $read:ident, $write:ident;)*) => {
        $(
            impl MemoryData for $ty {
                fn from_u32(v: u32) -> Self {
                    v as $ty
                }
                fn to_u32(self) -> u32 {
                    self as u32
                }
                fn read_from<B: MemoryBus + ?Sized>(bus: &mut B, addr: u32) -> Self {
                    bus.$read(addr)
                }
                fn write_to<B: MemoryBus + ?Sized>(self, bus: &mut B, addr: u32) {
                    bus.$write(addr, self)
                }
                fn mmio_read(handler: &mut dyn MmioHandler, offset: u32) -> Self {
                    handler.$read(offset)
                }
                fn mmio_write(self, handler: &mut dyn MmioHandler, offset: u32) {
                    handler.$write(offset, self)
                }
            }
        )*
    };
}

memory_data! {
    u8 => read8, write8;
    u16 => read16, write16;
    u32 => read32, write32;
    u64 => read64, write64;
}

#[inline(always)]
pub fn read_mem<T: MemoryData, B: MemoryBus + ?Sized>(bus: &mut B, addr: u32) -> T {
    T::read_from(bus, addr)
}

#[inline(always)]
pub fn write_mem<T: MemoryData, B: MemoryBus + ?Sized>(bus: &mut B, addr: u32, data: T) {
    data.write_to(bus, addr)
}

/// A memory-mapped device. Offsets are the guest address masked with the
/// mask given at registration.
pub trait MmioHandler {
    fn read8(&mut self, offset: u32) -> u8;
    fn read16(&mut self, offset: u32) -> u16;
    fn read32(&mut self, offset: u32) -> u32;
    fn write8(&mut self, offset: u32, value: u8);
    fn write16(&mut self, offset: u32, value: u16);
    fn write32(&mut self, offset: u32, value: u32);

    fn read64(&mut self, offset: u32) -> u64 {
        let lo = self.read32(offset) as u64;
        let hi = self.read32(offset.wrapping_add(4)) as u64;
        lo | (hi << 32)
    }

    fn write64(&mut self, offset: u32, value: u64) {
        self.write32(offset, value as u32);
        self.write32(offset.wrapping_add(4), (value >> 32) as u32);
    }
}

pub const MAX_MEMHANDLERS: usize = 256;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BusError {
    #[error("handler range {base:#010x}..={end:#010x} is empty")]
    EmptyRange { base: u32, end: u32 },

    #[error("no free memory handler slots")]
    TooManyHandlers,
}
const REGION_SIZE: u64 = 0x0100_0000;
const REGION_MASK: u32 = 0x00FF_FFFF;

#[derive(Debug, Clone, Copy)]
enum Route {
    Unassigned,
    Fast { base: *mut u8, mask: u32 },
    Handler { idx: usize, mask: u32 },
}

/// The standard bus: one route per 16MB region, reads and writes routed
/// separately. Regions fully covered by a backed view go straight to host
/// memory, so stores into protected code pages fault like any other write.
pub struct Sh4Bus<'vm> {
    reads: [Route; 256],
    writes: [Route; 256],
    handlers: Vec<Box<dyn MmioHandler + 'vm>>,
    _vm: PhantomData<&'vm VirtualMemory>,
}

impl<'vm> Sh4Bus<'vm> {
    pub fn new(vm: &'vm VirtualMemory) -> Self {
        let mut reads = [Route::Unassigned; 256];
        let mut writes = [Route::Unassigned; 256];
        let space = vm.address_space();

        for region in 0..256usize {
            let offset = space.offset_of((region as u32) << 24);
            let map = vm
                .mappings()
                .iter()
                .find(|m| m.is_backed() && m.start <= offset && offset + REGION_SIZE <= m.end);
            if let Some(map) = map {
                let route = Route::Fast {
                    base: vm.vmem_base().wrapping_add(offset as usize),
                    mask: REGION_MASK,
                };
                reads[region] = route;
                if map.allow_writes {
                    writes[region] = route;
                }
            }
        }

        log::debug!(
            "sh4mem: {} fast read regions, {} fast write regions",
            reads.iter().filter(|r| matches!(r, Route::Fast { .. })).count(),
            writes.iter().filter(|r| matches!(r, Route::Fast { .. })).count()
        );

        Self {
            reads,
            writes,
            handlers: Vec::new(),
            _vm: PhantomData,
        }
    }

    /// Routes the regions `base >> 24 ..= end >> 24` to `handler`, replacing
    /// any fast path there.
    pub fn register_mem_handler(
        &mut self,
        base: u32,
        end: u32,
        mask: u32,
        handler: Box<dyn MmioHandler + 'vm>,
    ) -> Result<(), BusError> {
        if base > end {
            return Err(BusError::EmptyRange { base, end });
        }
        if self.handlers.len() >= MAX_MEMHANDLERS {
            return Err(BusError::TooManyHandlers);
        }

        let idx = self.handlers.len();
        self.handlers.push(handler);

        for region in (base >> 24) as usize..=(end >> 24) as usize {
            let route = Route::Handler { idx, mask };
            self.reads[region] = route;
            self.writes[region] = route;
        }
        log::debug!("sh4mem: handler {idx} at {base:#010x}..={end:#010x} mask {mask:#x}");
        Ok(())
    }

    pub fn is_fast(&self, addr: u32) -> bool {
        matches!(self.reads[(addr >> 24) as usize], Route::Fast { .. })
    }

    #[inline(always)]
    fn read<T: MemoryData>(&mut self, addr: u32) -> T {
        match self.reads[(addr >> 24) as usize] {
            Route::Fast { base, mask } => unsafe {
                ptr::read_unaligned(base.add((addr & mask) as usize) as *const T)
            },
            Route::Handler { idx, mask } => T::mmio_read(self.handlers[idx].as_mut(), addr & mask),
            Route::Unassigned => {
                log::warn!("sh4mem: unassigned read{} at {addr:#010x}", size_of::<T>() * 8);
                T::default()
            }
        }
    }

    #[inline(always)]
    fn write<T: MemoryData>(&mut self, addr: u32, value: T) {
        match self.writes[(addr >> 24) as usize] {
            Route::Fast { base, mask } => unsafe {
                ptr::write_unaligned(base.add((addr & mask) as usize) as *mut T, value)
            },
            Route::Handler { idx, mask } => value.mmio_write(self.handlers[idx].as_mut(), addr & mask),
            Route::Unassigned => {
                log::warn!(
                    "sh4mem: unassigned write{} at {addr:#010x} data = {value:x}",
                    size_of::<T>() * 8
                );
            }
        }
    }
}

impl MemoryBus for Sh4Bus<'_> {
    fn read8(&mut self, addr: u32) -> u8 {
        self.read(addr)
    }
    fn read16(&mut self, addr: u32) -> u16 {
        self.read(addr)
    }
    fn read32(&mut self, addr: u32) -> u32 {
        self.read(addr)
    }
    fn read64(&mut self, addr: u32) -> u64 {
        self.read(addr)
    }
    fn write8(&mut self, addr: u32, value: u8) {
        self.write(addr, value)
    }
    fn write16(&mut self, addr: u32, value: u16) {
        self.write(addr, value)
    }
    fn write32(&mut self, addr: u32, value: u32) {
        self.write(addr, value)
    }
    fn write64(&mut self, addr: u32, value: u64) {
        self.write(addr, value)
    }

    fn mem_ptr(&mut self, addr: u32, size: u32) -> Option<*mut u8> {
        match self.reads[(addr >> 24) as usize] {
            Route::Fast { base, mask } => {
                let offset = addr & mask;
                (offset as u64 + size as u64 <= mask as u64 + 1)
                    .then(|| base.wrapping_add(offset as usize))
            }
            _ => None,
        }
    }
}
