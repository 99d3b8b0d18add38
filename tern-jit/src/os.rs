use std::fs::File;
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::ptr;
use std::sync::atomic::{Ordering, fence};

use lazy_static::lazy_static;

use crate::error::{JitError, JitResult};

pub const K: usize = 1024;

lazy_static! {
    static ref PAGE_SIZE: usize = determine_page_size();
}

fn determine_page_size() -> usize {
    let val = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };

    if val <= 0 {
        panic!("could not determine page size.");
    }

    val as usize
}

pub fn page_size() -> usize {
    *PAGE_SIZE
}

pub fn align_up(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

pub fn page_align_up(value: usize) -> usize {
    align_up(value, page_size())
}

pub fn is_page_aligned(value: usize) -> bool {
    value & (page_size() - 1) == 0
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum MemoryPermission {
    ReadWrite,
    ReadExecute,
    ReadWriteExecute,
}

impl MemoryPermission {
    fn prot(self) -> libc::c_int {
        match self {
            MemoryPermission::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
            MemoryPermission::ReadExecute => libc::PROT_READ | libc::PROT_EXEC,
            MemoryPermission::ReadWriteExecute => libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
        }
    }
}

/// Anonymous file of `size` bytes backing both views of the code cache.
pub fn create_backing_file(name: &str, size: usize) -> JitResult<File> {
    let file = memfd(name).or_else(|_| tempfile::tempfile()).map_err(JitError::BackingFile)?;
    file.set_len(size as u64)
        .map_err(|source| JitError::Resize { size, source })?;
    Ok(file)
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn memfd(name: &str) -> io::Result<File> {
    let name = std::ffi::CString::new(name).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let fd = unsafe { libc::memfd_create(name.as_ptr(), libc::MFD_CLOEXEC) };

    if fd < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(unsafe { File::from_raw_fd(fd) })
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn memfd(_name: &str) -> io::Result<File> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "memfd_create"))
}

/// Maps `size` bytes of `file` starting at `offset` with `MAP_SHARED`.
pub fn map_shared(file: &File, offset: usize, size: usize, permission: MemoryPermission) -> JitResult<*mut u8> {
    debug_assert!(is_page_aligned(offset));
    debug_assert!(is_page_aligned(size));

    let ptr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            size,
            permission.prot(),
            libc::MAP_SHARED,
            file.as_raw_fd(),
            offset as libc::off_t,
        )
    };

    if ptr == libc::MAP_FAILED {
        return Err(JitError::Map {
            size,
            source: io::Error::last_os_error(),
        });
    }

    Ok(ptr as *mut u8)
}

/// Anonymous mapping; `shared` mappings stay shared with forked children.
pub fn map_anonymous(size: usize, permission: MemoryPermission, shared: bool) -> JitResult<*mut u8> {
    debug_assert!(is_page_aligned(size));

    let visibility = if shared { libc::MAP_SHARED } else { libc::MAP_PRIVATE };
    let ptr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            size,
            permission.prot(),
            visibility | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };

    if ptr == libc::MAP_FAILED {
        return Err(JitError::Map {
            size,
            source: io::Error::last_os_error(),
        });
    }

    Ok(ptr as *mut u8)
}

pub fn unmap(ptr: *mut u8, size: usize) {
    let result = unsafe { libc::munmap(ptr as *mut libc::c_void, size) };

    if result != 0 {
        panic!("munmap() failed");
    }
}

/// Makes `size` bytes at `start`, freshly written through another view,
/// safe to execute.
#[cfg(all(target_arch = "arm", any(target_os = "linux", target_os = "android")))]
pub fn flush_icache(start: *const u8, size: usize) {
    const ARM_NR_CACHEFLUSH: libc::c_long = 0x0f0002;

    fence(Ordering::Release);
    let begin = start as usize;
    let result = unsafe { libc::syscall(ARM_NR_CACHEFLUSH, begin, begin + size, 0) };

    if result != 0 {
        panic!("cacheflush failed");
    }
}

#[cfg(not(all(target_arch = "arm", any(target_os = "linux", target_os = "android"))))]
pub fn flush_icache(_start: *const u8, _size: usize) {
    // coherent instruction caches on the host; only order the writes
    fence(Ordering::Release);
    std::sync::atomic::compiler_fence(Ordering::SeqCst);
}
