use std::mem::size_of;
use std::ops::Deref;

use memoffset::offset_of;

use tern_compiler::InstructionSet;
use tern_compiler::stack_map::{CodeInfo, FrameInfo};

use crate::memory_region::CODE_ALIGNMENT;
use crate::os::align_up;

/// Prelude placed immediately before every code body. The stack walker
/// finds it by subtracting `HEADER_SIZE` from the code pointer.
#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub struct OatQuickMethodHeader {
    pub stack_map: usize,
    pub frame_size: u32,
    pub core_spill_mask: u32,
    pub fp_spill_mask: u32,
    pub code_size: u32,
}

pub const HEADER_SIZE: usize = (size_of::<OatQuickMethodHeader>() + CODE_ALIGNMENT - 1) & !(CODE_ALIGNMENT - 1);

pub fn stack_map_offset() -> usize {
    offset_of!(OatQuickMethodHeader, stack_map)
}

pub fn frame_size_offset() -> usize {
    offset_of!(OatQuickMethodHeader, frame_size)
}

pub fn code_size_offset() -> usize {
    offset_of!(OatQuickMethodHeader, code_size)
}

impl OatQuickMethodHeader {
    /// Header preceding the code at `code`.
    pub fn from_code_ptr(code: usize) -> *const OatQuickMethodHeader {
        debug_assert_eq!(code % CODE_ALIGNMENT, 0);
        (code - HEADER_SIZE) as *const OatQuickMethodHeader
    }

    /// Header for an entrypoint, which carries the Thumb bit.
    pub fn from_entry_point(entry_point: usize) -> *const OatQuickMethodHeader {
        OatQuickMethodHeader::from_code_ptr(code_from_entry_point(entry_point))
    }

    pub fn code_ptr(&self) -> usize {
        self as *const OatQuickMethodHeader as usize + HEADER_SIZE
    }

    pub fn code_end(&self) -> usize {
        self.code_ptr() + self.code_size as usize
    }

    pub fn contains(&self, pc: usize) -> bool {
        self.code_ptr() <= pc && pc < self.code_end()
    }

    pub fn entry_point(&self) -> usize {
        entry_point_from_code(self.code_ptr())
    }

    pub fn native_pc_offset(&self, pc: usize) -> u32 {
        debug_assert!(self.contains(pc));
        (pc - self.code_ptr()) as u32
    }

    pub fn frame_info(&self) -> FrameInfo {
        FrameInfo {
            frame_size: self.frame_size,
            core_spill_mask: self.core_spill_mask,
            fp_spill_mask: self.fp_spill_mask,
            code_size: self.code_size,
            number_of_dex_registers: 0,
        }
    }

    /// Decodes the stack map blob. `stack_map_size` bytes must be readable
    /// at `self.stack_map`.
    pub fn code_info(&self, stack_map_size: usize) -> std::io::Result<CodeInfo> {
        let blob = unsafe { std::slice::from_raw_parts(self.stack_map as *const u8, stack_map_size) };
        CodeInfo::decode(blob)
    }
}

pub fn entry_point_from_code(code: usize) -> usize {
    code + InstructionSet::Thumb2.entry_point_delta()
}

pub fn code_from_entry_point(entry_point: usize) -> usize {
    entry_point & !1
}

/// Size of the code allocation holding `code_size` bytes and the header.
pub fn allocation_size(code_size: usize) -> usize {
    align_up(HEADER_SIZE + code_size, CODE_ALIGNMENT)
}

/// A header of committed code. Valid until the code cache frees the code,
/// which never happens while the code may still run.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct HeaderRef(*const OatQuickMethodHeader);

unsafe impl Send for HeaderRef {}

impl HeaderRef {
    pub(crate) fn for_code(code: usize) -> HeaderRef {
        HeaderRef(OatQuickMethodHeader::from_code_ptr(code))
    }

    pub fn as_ptr(self) -> *const OatQuickMethodHeader {
        self.0
    }
}

impl Deref for HeaderRef {
    type Target = OatQuickMethodHeader;

    fn deref(&self) -> &OatQuickMethodHeader {
        unsafe { &*self.0 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        assert_eq!(stack_map_offset(), 0);
        assert_eq!(frame_size_offset(), size_of::<usize>());
        assert_eq!(code_size_offset(), size_of::<usize>() + 12);
        assert_eq!(HEADER_SIZE % CODE_ALIGNMENT, 0);
        assert!(HEADER_SIZE >= size_of::<OatQuickMethodHeader>());
    }

    #[test]
    fn test_header_precedes_code() {
        #[repr(C, align(8))]
        struct Buffer([u8; 128]);
        let mut buffer = Buffer([0; 128]);
        let header = buffer.0.as_mut_ptr() as *mut OatQuickMethodHeader;
        unsafe {
            header.write(OatQuickMethodHeader {
                stack_map: 0,
                frame_size: 16,
                core_spill_mask: 1 << 14,
                fp_spill_mask: 0,
                code_size: 32,
            });
        }
        let code = header as usize + HEADER_SIZE;
        let entry = entry_point_from_code(code);
        assert_eq!(entry & 1, 1);
        assert_eq!(OatQuickMethodHeader::from_entry_point(entry), header as *const _);

        let header = HeaderRef::for_code(code);
        assert_eq!(header.code_ptr(), code);
        assert!(header.contains(code));
        assert!(header.contains(code + 31));
        assert!(!header.contains(code + 32));
        assert_eq!(header.native_pc_offset(code + 6), 6);
        assert_eq!(header.frame_info().frame_size, 16);
    }
}
