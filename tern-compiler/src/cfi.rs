//! DWARF call frame instructions describing the frame set up by compiled
//! code, so unwinders and debuggers can walk through it.

const DW_CFA_ADVANCE_LOC: u8 = 0x40;
const DW_CFA_OFFSET: u8 = 0x80;
const DW_CFA_RESTORE: u8 = 0xc0;
const DW_CFA_ADVANCE_LOC1: u8 = 0x02;
const DW_CFA_ADVANCE_LOC2: u8 = 0x03;
const DW_CFA_ADVANCE_LOC4: u8 = 0x04;
const DW_CFA_OFFSET_EXTENDED: u8 = 0x05;
const DW_CFA_RESTORE_EXTENDED: u8 = 0x06;
const DW_CFA_REMEMBER_STATE: u8 = 0x0a;
const DW_CFA_RESTORE_STATE: u8 = 0x0b;
const DW_CFA_DEF_CFA_OFFSET: u8 = 0x0e;

pub const DATA_ALIGNMENT_FACTOR: i32 = -4;

/// DWARF register number.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct DwarfReg(pub u32);

impl DwarfReg {
    pub fn core(reg: u32) -> DwarfReg {
        DwarfReg(reg)
    }

    /// ARM VFP single precision registers are numbered from 64.
    pub fn s(reg: u32) -> DwarfReg {
        DwarfReg(64 + reg)
    }
}

pub struct CfiWriter {
    enabled: bool,
    data: Vec<u8>,
    current_pc: u32,
    cfa_offset: i32,
    remembered: Vec<i32>,
}

impl CfiWriter {
    pub fn new(enabled: bool) -> CfiWriter {
        CfiWriter {
            enabled,
            data: Vec::new(),
            current_pc: 0,
            cfa_offset: 0,
            remembered: Vec::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn cfa_offset(&self) -> i32 {
        self.cfa_offset
    }

    pub fn advance_pc(&mut self, pc: u32) {
        if !self.enabled {
            return;
        }
        assert!(pc >= self.current_pc, "CFI must advance monotonically");
        let delta = pc - self.current_pc;
        if delta == 0 {
            return;
        }
        if delta < 0x40 {
            self.data.push(DW_CFA_ADVANCE_LOC | delta as u8);
        } else if delta <= 0xff {
            self.data.push(DW_CFA_ADVANCE_LOC1);
            self.data.push(delta as u8);
        } else if delta <= 0xffff {
            self.data.push(DW_CFA_ADVANCE_LOC2);
            self.data.extend_from_slice(&(delta as u16).to_le_bytes());
        } else {
            self.data.push(DW_CFA_ADVANCE_LOC4);
            self.data.extend_from_slice(&delta.to_le_bytes());
        }
        self.current_pc = pc;
    }

    pub fn adjust_cfa_offset(&mut self, delta: i32) {
        self.def_cfa_offset(self.cfa_offset + delta);
    }

    pub fn def_cfa_offset(&mut self, offset: i32) {
        if self.enabled && offset != self.cfa_offset {
            self.data.push(DW_CFA_DEF_CFA_OFFSET);
            write_uleb128(&mut self.data, offset as u32);
        }
        self.cfa_offset = offset;
    }

    /// `reg` is saved at `cfa + offset`; `offset` is relative to the CFA
    /// so it is negative for slots in the current frame.
    pub fn rel_offset(&mut self, reg: DwarfReg, offset: i32) {
        if !self.enabled {
            return;
        }
        let factored = (offset / DATA_ALIGNMENT_FACTOR) as u32;
        if reg.0 < 0x40 {
            self.data.push(DW_CFA_OFFSET | reg.0 as u8);
        } else {
            self.data.push(DW_CFA_OFFSET_EXTENDED);
            write_uleb128(&mut self.data, reg.0);
        }
        write_uleb128(&mut self.data, factored);
    }

    /// Records registers of `mask` stored at ascending addresses starting at
    /// `sp + sp_offset`.
    pub fn rel_offset_for_many(&mut self, first: fn(u32) -> DwarfReg, sp_offset: i32, mask: u32) {
        let mut offset = sp_offset - self.cfa_offset;
        for reg in 0..32 {
            if mask & (1 << reg) != 0 {
                self.rel_offset(first(reg), offset);
                offset += 4;
            }
        }
    }

    pub fn restore(&mut self, reg: DwarfReg) {
        if !self.enabled {
            return;
        }
        if reg.0 < 0x40 {
            self.data.push(DW_CFA_RESTORE | reg.0 as u8);
        } else {
            self.data.push(DW_CFA_RESTORE_EXTENDED);
            write_uleb128(&mut self.data, reg.0);
        }
    }

    pub fn restore_many(&mut self, first: fn(u32) -> DwarfReg, mask: u32) {
        for reg in 0..32 {
            if mask & (1 << reg) != 0 {
                self.restore(first(reg));
            }
        }
    }

    pub fn remember_state(&mut self) {
        if self.enabled {
            self.data.push(DW_CFA_REMEMBER_STATE);
        }
        self.remembered.push(self.cfa_offset);
    }

    pub fn restore_state(&mut self) {
        if self.enabled {
            self.data.push(DW_CFA_RESTORE_STATE);
        }
        self.cfa_offset = self.remembered.pop().expect("unbalanced CFI restore_state");
    }

    pub fn finish(self) -> Vec<u8> {
        self.data
    }
}

fn write_uleb128(data: &mut Vec<u8>, mut value: u32) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            data.push(byte);
            return;
        }
        data.push(byte | 0x80);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prologue_epilogue() {
        let mut cfi = CfiWriter::new(true);
        cfi.advance_pc(2);
        cfi.adjust_cfa_offset(12);
        cfi.rel_offset_for_many(DwarfReg::core, 0, (1 << 5) | (1 << 6) | (1 << 14));
        cfi.advance_pc(4);
        cfi.adjust_cfa_offset(20);
        cfi.remember_state();
        cfi.adjust_cfa_offset(-32);
        cfi.restore_state();
        assert_eq!(cfi.cfa_offset(), 32);

        let data = cfi.finish();
        assert_eq!(
            data,
            vec![
                0x42, 0x0e, 12, // advance 2, cfa = 12
                0x85, 3, 0x86, 2, 0x8e, 1, // r5 at cfa-12, r6 at cfa-8, lr at cfa-4
                0x42, 0x0e, 32, // advance 2, cfa = 32
                0x0a, 0x0e, 0, 0x0b,
            ]
        );
    }

    #[test]
    fn test_disabled_tracks_offset_only() {
        let mut cfi = CfiWriter::new(false);
        cfi.adjust_cfa_offset(16);
        cfi.rel_offset(DwarfReg::s(16), -4);
        assert_eq!(cfi.cfa_offset(), 16);
        assert!(cfi.finish().is_empty());
    }

    #[test]
    fn test_large_advance_and_extended_register() {
        let mut cfi = CfiWriter::new(true);
        cfi.advance_pc(0x1234);
        cfi.rel_offset(DwarfReg::s(16), -8);
        assert_eq!(cfi.finish(), vec![0x03, 0x34, 0x12, 0x05, 80, 2]);
    }
}
