use vmem::{CodeArea, JitStrategy, VmemError, prepare_jit_block};

#[cfg(target_arch = "x86_64")]
const RETURN_42: &[u8] = &[0xB8, 0x2A, 0x00, 0x00, 0x00, 0xC3]; // mov eax, 42; ret

#[cfg(target_arch = "aarch64")]
const RETURN_42: &[u8] = &[
    0x40, 0x05, 0x80, 0x52, // mov w0, #42
    0xC0, 0x03, 0x5F, 0xD6, // ret
];

fn run(strategy: JitStrategy) -> Option<i32> {
    let _ = env_logger::builder().is_test(true).try_init();
    let area = CodeArea::reserve(0x4000).expect("reserving code area");
    let mut block = match prepare_jit_block(area, strategy) {
        Ok(block) => block,
        // Hardened hosts may refuse one of the strategies.
        Err(err) => {
            eprintln!("{strategy:?} unavailable: {err}");
            return None;
        }
    };

    match strategy {
        JitStrategy::Rwx => assert_eq!(block.rx_offset(), 0),
        JitStrategy::DualView => assert_eq!(block.rx_offset(), -(block.size() as isize)),
    }

    #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
    {
        block.write(0x100, RETURN_42).expect("in bounds");
        let entry: extern "C" fn() -> i32 =
            unsafe { std::mem::transmute(block.exec_addr(0x100).expect("in bounds")) };
        return Some(entry());
    }

    #[allow(unreachable_code)]
    {
        block.write(0, &[0]).expect("in bounds");
        None
    }
}

#[test]
fn rwx_block_runs_code() {
    if let Some(rv) = run(JitStrategy::Rwx) {
        assert_eq!(rv, 42);
    }
}

#[test]
fn dual_view_block_runs_code() {
    if let Some(rv) = run(JitStrategy::DualView) {
        assert_eq!(rv, 42);
    }
}

#[test]
fn dual_view_writes_show_through_rx() {
    let area = CodeArea::reserve(0x1000).expect("reserving code area");
    let Ok(mut block) = prepare_jit_block(area, JitStrategy::DualView) else {
        return;
    };
    block.writer()[..4].copy_from_slice(&[1, 2, 3, 4]);
    block.flush(0..4);
    let rx = unsafe { std::slice::from_raw_parts(block.exec_addr(0).unwrap(), 4) };
    assert_eq!(rx, &[1, 2, 3, 4]);
}

#[test]
fn out_of_range_access_is_an_error() {
    let area = CodeArea::reserve(0x1000).unwrap();
    let mut block = prepare_jit_block(area, JitStrategy::DualView)
        .or_else(|_| prepare_jit_block(CodeArea::reserve(0x1000).unwrap(), JitStrategy::Rwx))
        .unwrap();
    let size = block.size();
    assert!(matches!(
        block.write(size - 2, &[0; 4]),
        Err(VmemError::JitBounds { offset, len: 4, .. }) if offset == size - 2
    ));
    assert!(matches!(block.write(usize::MAX, &[0; 2]), Err(VmemError::JitBounds { .. })));
    assert!(matches!(block.exec_addr(size), Err(VmemError::JitBounds { .. })));
    block.write(size - 4, &[0; 4]).unwrap();
    assert!(block.exec_addr(size - 1).is_ok());
}
