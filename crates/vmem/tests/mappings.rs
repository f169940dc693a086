use vmem::{AddressSpace, Mapping, VirtualMemory, VmemConfig};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn dreamcast() -> VirtualMemory {
    init_logging();
    let mut vm = VirtualMemory::init(VmemConfig::dreamcast().with_context(0x200, 0x10_0000))
        .expect("reserving the address space");
    vm.create_default_mappings();
    vm
}

unsafe fn write32(vm: &VirtualMemory, offset: u64, value: u32) {
    let ptr = vm.guest_ptr(offset).expect("backed offset") as *mut u32;
    unsafe { ptr.write_volatile(value) };
}

unsafe fn read32(vm: &VirtualMemory, offset: u64) -> u32 {
    let ptr = vm.guest_ptr(offset).expect("backed offset") as *const u32;
    unsafe { ptr.read_volatile() }
}

#[test]
fn layout_places_context_before_guest_base() {
    let vm = dreamcast();
    let (ctx, ctx_size) = vm.context_area();
    let (lookup, lookup_size) = vm.lookup_table();

    assert_eq!(vm.address_space(), AddressSpace::Space512M);
    assert_eq!(lookup, vm.context_base());
    assert_eq!(lookup as usize + lookup_size, ctx as usize);
    assert_eq!(ctx as usize + ctx_size, vm.vmem_base() as usize);
    assert_eq!(vm.vmem_base() as usize % vmem::RESERVATION_ALIGN, 0);

    let claim = vm.claim_context().expect("first claim");
    assert!(vm.claim_context().is_none());
    let ptr = claim.context_ptr(0x120).expect("fits");
    assert_eq!(ptr as usize + 0x120, vm.vmem_base() as usize);
    // The context area is usable straight away.
    unsafe { ptr.write_bytes(0xAB, 0x120) };
    assert!(matches!(
        claim.context_ptr(ctx_size + 1),
        Err(vmem::VmemError::ContextTooLarge { .. })
    ));
    drop(claim);
    assert!(vm.claim_context().is_some());
}

#[test]
fn ram_mirrors_share_backing() {
    let vm = dreamcast();
    unsafe {
        write32(&vm, 0x0C00_1000, 0xDEAD_BEEF);
        assert_eq!(read32(&vm, 0x0D00_1000), 0xDEAD_BEEF);
        assert_eq!(read32(&vm, 0x0F00_1000), 0xDEAD_BEEF);

        write32(&vm, 0x0E00_0FFC, 0x1234_5678);
        assert_eq!(read32(&vm, 0x0C00_0FFC), 0x1234_5678);
    }
}

#[test]
fn vram_and_aram_windows() {
    let vm = dreamcast();
    let layout = *vm.backing_layout();
    unsafe {
        write32(&vm, 0x0400_0010, 0xCAFE_F00D);
        // 8MB of VRAM repeats twice in each 16MB area, and the area is mirrored.
        assert_eq!(read32(&vm, 0x0480_0010), 0xCAFE_F00D);
        assert_eq!(read32(&vm, 0x0600_0010), 0xCAFE_F00D);

        // ARAM is only writable through the window after the 512MB space.
        write32(&vm, vmem::SPACE_512M + 0x40, 0x0BAD_CAFE);
        assert_eq!(read32(&vm, 0x0080_0040), 0x0BAD_CAFE);
        assert_eq!(read32(&vm, 0x00A0_0040), 0x0BAD_CAFE);
        assert_eq!(read32(&vm, 0x0280_0040), 0x0BAD_CAFE);
    }
    assert_eq!(layout.aram.size, 2 * 1024 * 1024);
    assert!(vm.guest_ptr(0x0800_0000).is_none());
    assert!(vm.guest_ptr(0).is_none());
    assert!(vm.guest_addr_ptr(0x8C00_0000).is_some());
    assert_eq!(vm.guest_addr_ptr(0xAC00_0100), vm.guest_ptr(0x0C00_0100));
}

#[test]
fn create_mappings_is_idempotent() {
    let mut vm = dreamcast();
    unsafe { write32(&vm, 0x0C00_0000, 0x5555_AAAA) };

    vm.create_default_mappings();
    vm.create_default_mappings();
    unsafe {
        assert_eq!(read32(&vm, 0x0D00_0000), 0x5555_AAAA);
    }

    // A smaller table drops the views it no longer lists.
    let layout = *vm.backing_layout();
    vm.create_mappings(&[
        Mapping::unmapped(0, 0x0C00_0000),
        Mapping::backed(0x0C00_0000, 0x0D00_0000, layout.ram, true),
        Mapping::unmapped(0x0D00_0000, vmem::SPACE_512M),
    ]);
    assert!(vm.guest_ptr(0x0D00_0000).is_none());
    assert!(vm.guest_ptr(0x0400_0000).is_none());
    unsafe {
        assert_eq!(read32(&vm, 0x0C00_0000), 0x5555_AAAA);
    }
    assert_eq!(vm.views().views().len(), 1);
}

#[test]
fn lookup_table_pages_on_demand() {
    let vm = dreamcast();
    let (lookup, size) = vm.lookup_table();
    let page = vm.page_size();
    assert!(size >= page * 4);

    let entry = unsafe { lookup.add(page * 2 + 8) } as *mut u32;
    vm.ondemand_page(entry as *mut u8, 4);
    unsafe {
        assert_eq!(entry.read_volatile(), 0);
        entry.write_volatile(77);
        assert_eq!(entry.read_volatile(), 77);
    }

    vm.reset_mem(lookup, size);
    vm.ondemand_page(entry as *mut u8, 4);
    unsafe {
        assert_eq!(entry.read_volatile(), 0, "decommitted pages come back zeroed");
    }
}

#[test]
fn naomi_sizes() {
    init_logging();
    let mut vm = VirtualMemory::init(VmemConfig::naomi2()).expect("reserving naomi2 space");
    vm.create_default_mappings();
    let layout = *vm.backing_layout();
    assert_eq!(layout.ram.size, 32 * 1024 * 1024);
    assert_eq!(layout.elan.offset, layout.aram.end());
    // 32MB of RAM fills area 3 twice.
    unsafe {
        write32(&vm, 0x0C00_0004, 1);
        assert_eq!(read32(&vm, 0x0E00_0004), 1);
        write32(&vm, 0x0A00_0000, 2);
    }
    assert!(vm.guest_ptr(0x0A00_0000).is_some());
}

#[test]
fn rejects_bad_sizes() {
    let cfg = VmemConfig {
        ram_size: 3 * 1024 * 1024,
        ..VmemConfig::dreamcast()
    };
    assert!(matches!(
        VirtualMemory::init(cfg),
        Err(vmem::VmemError::Config(_))
    ));
}

#[cfg(target_pointer_width = "64")]
#[test]
fn four_gig_space_mirrors_segments() {
    init_logging();
    let cfg = VmemConfig {
        prefer_4gb: true,
        ..VmemConfig::dreamcast()
    };
    let mut vm = VirtualMemory::init(cfg).expect("reserving the address space");
    vm.create_default_mappings();
    if vm.address_space() != AddressSpace::Space4G {
        // The host refused 4GB and we fell back, nothing more to check.
        return;
    }
    unsafe {
        write32(&vm, 0x8C00_0020, 0xFEED_FACE);
        assert_eq!(read32(&vm, 0xAC00_0020), 0xFEED_FACE);
        assert_eq!(read32(&vm, 0x0C00_0020), 0xFEED_FACE);
        assert_eq!(read32(&vm, 0xCD00_0020), 0xFEED_FACE);
    }
    assert!(vm.guest_ptr(0xE000_0000).is_none());
    assert_eq!(vm.guest_addr_ptr(0x8C00_0000), vm.guest_ptr(0x8C00_0000));
}
