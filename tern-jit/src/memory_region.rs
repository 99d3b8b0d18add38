//! Code cache memory: one backing file seen through two views.
//!
//! ```text
//!  file offset 0                 max/2                      max
//!  | code (exec_mspace)          | data (data_mspace)         |
//!  writable view: whole file, RW
//!  executable view: code half, RX
//! ```
//!
//! Code is written through the writable view at the same offset it is later
//! executed from. No pointer into the executable view is ever writable.

use std::fs::File;
use std::ptr;

use tracing::{info, warn};

use tern_compiler::InstructionSet;

use crate::error::{JitError, JitResult};
use crate::mspace::MSpace;
use crate::os::{self, MemoryPermission};

pub const CODE_ALIGNMENT: usize = 8;
pub const DATA_ALIGNMENT: usize = 4;

pub struct JitMemoryRegion {
    // Keeps the backing pages alive; `None` for a fused anonymous mapping.
    _backing: Option<File>,
    data_view: *mut u8,
    exec_view: *const u8,
    fused: bool,
    max_capacity: usize,
    current_capacity: usize,
    exec_mspace: MSpace,
    data_mspace: MSpace,
    used_memory_for_code: usize,
    used_memory_for_data: usize,
}

// The views are owned by the region and only touched through it.
unsafe impl Send for JitMemoryRegion {}

impl JitMemoryRegion {
    pub fn initialize(initial_capacity: usize, max_capacity: usize, rwx_allowed: bool) -> JitResult<JitMemoryRegion> {
        let unit = 2 * os::page_size();
        let initial = os::align_up(initial_capacity, unit);
        let max = os::align_up(max_capacity, unit);
        if initial == 0 || initial > max {
            return Err(JitError::InvalidCapacity {
                initial: initial_capacity,
                max: max_capacity,
            });
        }
        let half = max / 2;

        let file = os::create_backing_file("tern-jit-code-cache", max)?;
        let data_view = os::map_shared(&file, 0, max, MemoryPermission::ReadWrite)?;

        let (backing, data_view, exec_view, fused) =
            match os::map_shared(&file, 0, half, MemoryPermission::ReadExecute) {
                Ok(exec_view) => (Some(file), data_view, exec_view as *const u8, false),
                Err(err) if rwx_allowed => {
                    warn!(error = %err, "dual view mapping failed, using a single RWX mapping");
                    os::unmap(data_view, max);
                    let view = os::map_anonymous(max, MemoryPermission::ReadWriteExecute, false)?;
                    (None, view, view as *const u8, true)
                }
                Err(err) => {
                    os::unmap(data_view, max);
                    return Err(err);
                }
            };

        let exec_base = exec_view as usize;
        let data_base = data_view as usize + half;

        info!(
            initial_capacity = initial,
            max_capacity = max,
            fused,
            "jit memory region initialized"
        );

        Ok(JitMemoryRegion {
            _backing: backing,
            data_view,
            exec_view,
            fused,
            max_capacity: max,
            current_capacity: initial,
            exec_mspace: MSpace::new(exec_base, initial / 2, half),
            data_mspace: MSpace::new(data_base, initial / 2, half),
            used_memory_for_code: 0,
            used_memory_for_data: 0,
        })
    }

    pub fn is_fused(&self) -> bool {
        self.fused
    }

    pub fn current_capacity(&self) -> usize {
        self.current_capacity
    }

    pub fn max_capacity(&self) -> usize {
        self.max_capacity
    }

    pub fn used_memory_for_code(&self) -> usize {
        self.used_memory_for_code
    }

    pub fn used_memory_for_data(&self) -> usize {
        self.used_memory_for_data
    }

    pub fn exec_begin(&self) -> usize {
        self.exec_view as usize
    }

    /// End of the code half that is currently usable.
    pub fn exec_end(&self) -> usize {
        self.exec_begin() + self.current_capacity / 2
    }

    pub fn is_in_exec_space(&self, ptr: usize) -> bool {
        self.exec_begin() <= ptr && ptr < self.exec_begin() + self.max_capacity / 2
    }

    pub fn is_in_data_space(&self, ptr: usize) -> bool {
        self.data_mspace.contains(ptr)
    }

    /// Address in the writable view aliasing executable address `ptr`.
    pub fn writable_alias(&self, ptr: *const u8) -> *mut u8 {
        let address = ptr as usize;
        assert!(self.is_in_exec_space(address), "{:#x} is not code", address);
        unsafe { self.data_view.add(address - self.exec_begin()) }
    }

    /// Executable address aliasing writable code address `ptr`.
    pub fn executable_alias(&self, ptr: *const u8) -> *const u8 {
        let offset = ptr as usize - self.data_view as usize;
        assert!(offset < self.max_capacity / 2, "{:p} is not writable code", ptr);
        unsafe { self.exec_view.add(offset) }
    }

    /// Returns the writable and the executable address of `size` bytes of
    /// code memory.
    pub fn allocate_code(&mut self, size: usize) -> Option<(*mut u8, *const u8)> {
        let alignment = CODE_ALIGNMENT.max(InstructionSet::Thumb2.code_alignment());
        let executable = self.exec_mspace.alloc(size, alignment)? as *const u8;
        let usable = self.exec_mspace.usable_size(executable as usize).unwrap_or(size);
        self.used_memory_for_code += usable;
        Some((self.writable_alias(executable), executable))
    }

    pub fn allocate_data(&mut self, size: usize) -> Option<*mut u8> {
        let address = self.data_mspace.alloc(size, DATA_ALIGNMENT)?;
        let usable = self.data_mspace.usable_size(address).unwrap_or(size);
        self.used_memory_for_data += usable;
        Some(address as *mut u8)
    }

    /// Publishes `size` bytes written at `writable` for execution at
    /// `executable`. Both views share pages, so this is a release fence
    /// plus an instruction cache flush.
    pub fn commit_code(&self, writable: *const u8, executable: *const u8, size: usize) {
        debug_assert_eq!(self.writable_alias(executable) as *const u8, writable);
        os::flush_icache(executable, size);
    }

    /// Copies `bytes` into code memory at executable address `executable`.
    pub fn write_code(&self, executable: *const u8, bytes: &[u8]) {
        let writable = self.writable_alias(executable);
        unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), writable, bytes.len()) };
    }

    pub fn free_code(&mut self, executable: *const u8) {
        let size = self.exec_mspace.free(executable as usize);
        self.used_memory_for_code -= size;
    }

    pub fn free_data(&mut self, data: *mut u8) {
        let size = self.data_mspace.free(data as usize);
        self.used_memory_for_data -= size;
    }

    /// Doubles the usable capacity, up to the maximum. Returns false when
    /// already at the maximum.
    pub fn increase_code_cache_capacity(&mut self) -> bool {
        if self.current_capacity == self.max_capacity {
            return false;
        }

        let new_capacity = (self.current_capacity * 2).min(self.max_capacity);
        self.exec_mspace.set_footprint_limit(new_capacity / 2);
        self.data_mspace.set_footprint_limit(new_capacity / 2);
        info!(
            from = self.current_capacity,
            to = new_capacity,
            "increasing code cache capacity"
        );
        self.current_capacity = new_capacity;
        true
    }
}

impl Drop for JitMemoryRegion {
    fn drop(&mut self) {
        if !self.fused {
            os::unmap(self.exec_view as *mut u8, self.max_capacity / 2);
        }
        os::unmap(self.data_view, self.max_capacity);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region() -> JitMemoryRegion {
        let page = os::page_size();
        JitMemoryRegion::initialize(4 * page, 16 * page, false).unwrap()
    }

    #[test]
    fn test_code_written_through_data_view_is_visible() {
        let mut region = region();
        let (writable, executable) = region.allocate_code(64).unwrap();
        assert_ne!(writable as *const u8, executable);
        assert!(region.is_in_exec_space(executable as usize));
        assert_eq!(executable as usize % CODE_ALIGNMENT, 0);

        let bytes: Vec<u8> = (0..64).collect();
        region.write_code(executable, &bytes);
        region.commit_code(writable, executable, bytes.len());

        let seen = unsafe { std::slice::from_raw_parts(executable, 64) };
        assert_eq!(seen, &bytes[..]);
        assert_eq!(region.executable_alias(writable), executable);
    }

    #[test]
    fn test_accounting() {
        let mut region = region();
        let (_, code) = region.allocate_code(100).unwrap();
        let data = region.allocate_data(30).unwrap();
        assert!(region.is_in_data_space(data as usize));
        assert!(!region.is_in_exec_space(data as usize));
        assert_eq!(region.used_memory_for_code(), 104);
        assert_eq!(region.used_memory_for_data(), 32);

        region.free_code(code);
        region.free_data(data);
        assert_eq!(region.used_memory_for_code(), 0);
        assert_eq!(region.used_memory_for_data(), 0);
    }

    #[test]
    fn test_growth_until_max() {
        let page = os::page_size();
        let mut region = region();
        assert_eq!(region.current_capacity(), 4 * page);

        // The initial code half holds two pages.
        assert!(region.allocate_code(2 * page).is_some());
        assert!(region.allocate_code(8).is_none());

        assert!(region.increase_code_cache_capacity());
        assert_eq!(region.current_capacity(), 8 * page);
        assert!(region.allocate_code(8).is_some());

        assert!(region.increase_code_cache_capacity());
        assert!(!region.increase_code_cache_capacity());
        assert_eq!(region.current_capacity(), region.max_capacity());
        assert_eq!(region.exec_end() - region.exec_begin(), 8 * page);
    }

    #[test]
    fn test_invalid_capacity() {
        let page = os::page_size();
        assert!(matches!(
            JitMemoryRegion::initialize(8 * page, 4 * page, false),
            Err(JitError::InvalidCapacity { .. })
        ));
    }
}
