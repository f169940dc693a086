use std::ffi::CString;
use std::fs::OpenOptions;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};

use once_cell::sync::Lazy;

use crate::Access;

static PAGE_SIZE: Lazy<usize> = Lazy::new(|| {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 { 4096 } else { size as usize }
});

pub fn page_size() -> usize {
    *PAGE_SIZE
}

fn prot(access: Access) -> libc::c_int {
    match access {
        Access::None => libc::PROT_NONE,
        Access::Read => libc::PROT_READ,
        Access::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
        Access::ReadExec => libc::PROT_READ | libc::PROT_EXEC,
        Access::ReadWriteExec => libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
    }
}

#[cfg(target_os = "linux")]
const RESERVE_FLAGS: libc::c_int = libc::MAP_PRIVATE | libc::MAP_ANON | libc::MAP_NORESERVE;
#[cfg(not(target_os = "linux"))]
const RESERVE_FLAGS: libc::c_int = libc::MAP_PRIVATE | libc::MAP_ANON;

fn check_map(ptr: *mut libc::c_void) -> io::Result<*mut u8> {
    if ptr == libc::MAP_FAILED {
        Err(io::Error::last_os_error())
    } else {
        Ok(ptr as *mut u8)
    }
}

fn check_rc(rc: libc::c_int) -> io::Result<()> {
    if rc != 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Reserves `size` bytes of inaccessible address space anywhere.
pub fn reserve(size: usize) -> io::Result<*mut u8> {
    check_map(unsafe { libc::mmap(ptr::null_mut(), size, libc::PROT_NONE, RESERVE_FLAGS, -1, 0) })
}

/// Replaces whatever is mapped at `addr` with inaccessible anonymous memory.
pub unsafe fn reserve_fixed(addr: *mut u8, size: usize) -> io::Result<()> {
    let rv = unsafe {
        libc::mmap(
            addr as *mut _,
            size,
            libc::PROT_NONE,
            RESERVE_FLAGS | libc::MAP_FIXED,
            -1,
            0,
        )
    };
    check_map(rv).map(|_| ())
}

pub unsafe fn release(addr: *mut u8, size: usize) -> io::Result<()> {
    check_rc(unsafe { libc::munmap(addr as *mut _, size) })
}

pub unsafe fn protect(addr: *mut u8, size: usize, access: Access) -> io::Result<()> {
    check_rc(unsafe { libc::mprotect(addr as *mut _, size, prot(access)) })
}

/// Makes the range inaccessible and hands its pages back to the OS. The next
/// commit sees zero-filled memory.
pub unsafe fn decommit(addr: *mut u8, size: usize) -> io::Result<()> {
    unsafe {
        protect(addr, size, Access::None)?;
        check_rc(libc::madvise(addr as *mut _, size, libc::MADV_DONTNEED))
    }
}

pub unsafe fn map_shared_fixed(
    fd: RawFd,
    offset: usize,
    addr: *mut u8,
    size: usize,
    access: Access,
) -> io::Result<()> {
    let rv = unsafe {
        libc::mmap(
            addr as *mut _,
            size,
            prot(access),
            libc::MAP_SHARED | libc::MAP_FIXED,
            fd,
            offset as libc::off_t,
        )
    };
    check_map(rv).map(|_| ())
}

#[cfg(target_os = "macos")]
const JIT_FLAGS: libc::c_int = libc::MAP_JIT;
#[cfg(not(target_os = "macos"))]
const JIT_FLAGS: libc::c_int = 0;

/// Fresh private read-write-execute memory at `addr`.
pub unsafe fn map_rwx_fixed(addr: *mut u8, size: usize) -> io::Result<()> {
    let rv = unsafe {
        libc::mmap(
            addr as *mut _,
            size,
            prot(Access::ReadWriteExec),
            libc::MAP_PRIVATE | libc::MAP_ANON | libc::MAP_FIXED | JIT_FLAGS,
            -1,
            0,
        )
    };
    check_map(rv).map(|_| ())
}

/// File descriptor backed memory that can be mapped several times.
#[derive(Debug)]
pub struct SharedMemory {
    fd: OwnedFd,
    size: usize,
}

impl SharedMemory {
    pub fn create(size: usize) -> io::Result<SharedMemory> {
        let fd = match anonymous_fd() {
            Ok(fd) => fd,
            Err(err) => {
                log::warn!("vmem: anonymous shared memory unavailable ({err}), using a temp file");
                temp_file_fd()?
            }
        };

        check_rc(unsafe { libc::ftruncate(fd.as_raw_fd(), size as libc::off_t) })?;
        Ok(SharedMemory { fd, size })
    }

    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

static SHM_SERIAL: AtomicU32 = AtomicU32::new(0);

fn shm_name(prefix: &str) -> io::Result<CString> {
    let serial = SHM_SERIAL.fetch_add(1, Ordering::Relaxed);
    CString::new(format!("/{prefix}_{}_{serial}", std::process::id()))
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn anonymous_fd() -> io::Result<OwnedFd> {
    let name = shm_name("sh4_mem")?;
    let fd = unsafe { libc::memfd_create(name.as_ptr(), libc::MFD_CLOEXEC) };
    if fd < 0 {
        return posix_shm_fd();
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn anonymous_fd() -> io::Result<OwnedFd> {
    posix_shm_fd()
}

fn posix_shm_fd() -> io::Result<OwnedFd> {
    let name = shm_name("sh4_mem")?;
    let fd = unsafe {
        libc::shm_open(
            name.as_ptr(),
            libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
            0o600,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // The name is only needed to get the descriptor.
    unsafe { libc::shm_unlink(name.as_ptr()) };
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn temp_file_fd() -> io::Result<OwnedFd> {
    let serial = SHM_SERIAL.fetch_add(1, Ordering::Relaxed);
    let path = std::env::temp_dir().join(format!("sh4_mem_{}_{serial}", std::process::id()));
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .open(&path)?;
    std::fs::remove_file(&path)?;
    Ok(OwnedFd::from(file))
}

#[cfg(all(target_arch = "aarch64", target_os = "linux"))]
unsafe extern "C" {
    fn __clear_cache(begin: *mut libc::c_char, end: *mut libc::c_char);
}

#[cfg(all(target_arch = "aarch64", target_os = "macos"))]
unsafe extern "C" {
    fn sys_icache_invalidate(start: *mut libc::c_void, len: libc::size_t);
}

#[cfg(all(target_arch = "aarch64", target_os = "linux"))]
pub unsafe fn flush_icache(start: *mut u8, end: *mut u8) {
    if start < end {
        unsafe { __clear_cache(start as *mut libc::c_char, end as *mut libc::c_char) };
    }
}

#[cfg(all(target_arch = "aarch64", target_os = "macos"))]
pub unsafe fn flush_icache(start: *mut u8, end: *mut u8) {
    if start < end {
        unsafe { sys_icache_invalidate(start as *mut libc::c_void, end as usize - start as usize) };
    }
}

#[cfg(not(all(
    target_arch = "aarch64",
    any(target_os = "linux", target_os = "macos")
)))]
pub unsafe fn flush_icache(_start: *mut u8, _end: *mut u8) {}

#[cfg(all(target_os = "macos", target_arch = "aarch64"))]
unsafe extern "C" {
    fn pthread_jit_write_protect_supported_np() -> libc::c_int;
    fn pthread_jit_write_protect_np(enabled: libc::c_int);
}

/// Toggles per-thread write access to `MAP_JIT` memory on Apple silicon.
#[cfg(all(target_os = "macos", target_arch = "aarch64"))]
pub fn jit_write_protect(enabled: bool) {
    unsafe {
        if pthread_jit_write_protect_supported_np() != 0 {
            pthread_jit_write_protect_np(enabled as libc::c_int);
        }
    }
}

#[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
pub fn jit_write_protect(_enabled: bool) {}

pub type FaultCallback = fn(usize) -> bool;

static mut PREV_SEGV: Option<libc::sigaction> = None;
static mut PREV_BUS: Option<libc::sigaction> = None;
static mut FAULT_CALLBACK: Option<FaultCallback> = None;

#[cfg(any(target_os = "linux", target_os = "android"))]
unsafe fn fault_address(info: *mut libc::siginfo_t) -> usize {
    unsafe { (*info).si_addr() as usize }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
unsafe fn fault_address(info: *mut libc::siginfo_t) -> usize {
    unsafe { (*info).si_addr as usize }
}

extern "C" fn on_fault(sig: libc::c_int, info: *mut libc::siginfo_t, uctx: *mut libc::c_void) {
    unsafe {
        let addr = fault_address(info);
        let callback = *ptr::addr_of!(FAULT_CALLBACK);
        if let Some(callback) = callback {
            if callback(addr) {
                return;
            }
        }

        let prev = if sig == libc::SIGBUS {
            *ptr::addr_of!(PREV_BUS)
        } else {
            *ptr::addr_of!(PREV_SEGV)
        };
        chain(sig, info, uctx, prev);
    }
}

unsafe fn chain(
    sig: libc::c_int,
    info: *mut libc::siginfo_t,
    uctx: *mut libc::c_void,
    prev: Option<libc::sigaction>,
) {
    let Some(prev) = prev else {
        unsafe { restore_default(sig) };
        return;
    };

    if prev.sa_sigaction == libc::SIG_DFL || prev.sa_sigaction == libc::SIG_IGN {
        // Returning re-executes the access under the default action.
        unsafe { libc::sigaction(sig, &prev, ptr::null_mut()) };
        return;
    }

    unsafe {
        if prev.sa_flags & libc::SA_SIGINFO != 0 {
            let handler: extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void) =
                std::mem::transmute(prev.sa_sigaction);
            handler(sig, info, uctx);
        } else {
            let handler: extern "C" fn(libc::c_int) = std::mem::transmute(prev.sa_sigaction);
            handler(sig);
        }
    }
}

unsafe fn restore_default(sig: libc::c_int) {
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = libc::SIG_DFL;
        libc::sigemptyset(&mut sa.sa_mask);
        libc::sigaction(sig, &sa, ptr::null_mut());
    }
}

/// Installs `callback` for SIGSEGV and SIGBUS. Must only be called once per
/// process, the caller serializes.
pub unsafe fn install_fault_handler(callback: FaultCallback) -> io::Result<()> {
    unsafe {
        *ptr::addr_of_mut!(FAULT_CALLBACK) = Some(callback);

        let mut sa: libc::sigaction = std::mem::zeroed();
        let handler: extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void) = on_fault;
        sa.sa_sigaction = handler as libc::sighandler_t;
        sa.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK;
        libc::sigemptyset(&mut sa.sa_mask);

        let mut prev: libc::sigaction = std::mem::zeroed();
        check_rc(libc::sigaction(libc::SIGSEGV, &sa, &mut prev))?;
        *ptr::addr_of_mut!(PREV_SEGV) = Some(prev);

        let mut prev: libc::sigaction = std::mem::zeroed();
        check_rc(libc::sigaction(libc::SIGBUS, &sa, &mut prev))?;
        *ptr::addr_of_mut!(PREV_BUS) = Some(prev);
    }
    Ok(())
}
