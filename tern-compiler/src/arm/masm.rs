//! Macro assembler on top of the Thumb-2 assembler.
//!
//! Macro instructions may expand into several machine instructions and may
//! use the scratch registers (IP, S30 and S31). Sequences whose exact layout
//! matters are emitted through an `ExactAssemblyScope`, which only exposes
//! the raw assembler and keeps the literal pool out of the sequence.

use std::cell::Cell;
use std::ops::{Deref, DerefMut};
use std::rc::Rc;

use tern_asm::thumb2::{
    encode_vfp_imm_f32, encode_vfp_imm_f64, is_modified_immediate, Cond, DRegister, DataOp, LoadKind, Register,
    SRegister, Shift, StoreKind,
};
use tern_asm::{Assembler, Label};

/// Literal pool checks between instructions leave room for this much code.
pub const DEFAULT_POOL_MARGIN: usize = 256;

#[derive(Clone)]
struct ScratchRegisters {
    regs: &'static [u8],
    used: Rc<Cell<u32>>,
}

impl ScratchRegisters {
    fn new(regs: &'static [u8]) -> ScratchRegisters {
        ScratchRegisters {
            regs,
            used: Rc::new(Cell::new(0)),
        }
    }

    fn get(&self) -> (u8, u32) {
        let used = self.used.get();
        for (idx, &reg) in self.regs.iter().enumerate() {
            let bit = 1 << idx;
            if used & bit == 0 {
                self.used.set(used | bit);
                return (reg, bit);
            }
        }
        panic!("all scratch registers used");
    }

    /// Two consecutive registers starting at an even code.
    fn get_pair(&self) -> (u8, u32) {
        let used = self.used.get();
        for idx in 0..self.regs.len().saturating_sub(1) {
            let bits = 0b11 << idx;
            let reg = self.regs[idx];
            if reg % 2 == 0 && self.regs[idx + 1] == reg + 1 && used & bits == 0 {
                self.used.set(used | bits);
                return (reg, bits);
            }
        }
        panic!("no scratch register pair available");
    }

    fn available(&self) -> usize {
        self.regs.len() - self.used.get().count_ones() as usize
    }
}

/// A scratch register, released on drop.
pub struct ScratchReg<T> {
    reg: T,
    bits: u32,
    used: Rc<Cell<u32>>,
}

impl<T> Deref for ScratchReg<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.reg
    }
}

impl<T> Drop for ScratchReg<T> {
    fn drop(&mut self) {
        self.used.set(self.used.get() & !self.bits);
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ScopeSize {
    Exact,
    Maximum,
}

pub struct ArmMacroAssembler {
    asm: Assembler,
    core_scratch: ScratchRegisters,
    fp_scratch: ScratchRegisters,
    exact_scopes: u32,
    emit_comments: bool,
    comments: Vec<(u32, String)>,
}

impl ArmMacroAssembler {
    pub fn new(emit_comments: bool) -> ArmMacroAssembler {
        ArmMacroAssembler {
            asm: Assembler::new(),
            core_scratch: ScratchRegisters::new(&[12]),
            fp_scratch: ScratchRegisters::new(&[30, 31]),
            exact_scopes: 0,
            emit_comments,
            comments: Vec::new(),
        }
    }

    pub fn scratch(&self) -> ScratchReg<Register> {
        let (reg, bits) = self.core_scratch.get();
        ScratchReg {
            reg: Register::new(reg),
            bits,
            used: self.core_scratch.used.clone(),
        }
    }

    pub fn scratch_s(&self) -> ScratchReg<SRegister> {
        let (reg, bits) = self.fp_scratch.get();
        ScratchReg {
            reg: SRegister::new(reg),
            bits,
            used: self.fp_scratch.used.clone(),
        }
    }

    pub fn scratch_d(&self) -> ScratchReg<DRegister> {
        let (reg, bits) = self.fp_scratch.get_pair();
        ScratchReg {
            reg: DRegister::from_low(SRegister::new(reg)),
            bits,
            used: self.fp_scratch.used.clone(),
        }
    }

    pub fn has_core_scratch(&self) -> bool {
        self.core_scratch.available() > 0
    }

    pub fn comment(&mut self, text: impl FnOnce() -> String) {
        if self.emit_comments {
            let pos = self.asm.position() as u32;
            self.comments.push((pos, text()));
        }
    }

    pub fn comments(&self) -> &[(u32, String)] {
        &self.comments
    }

    pub fn finalize(self) -> (Vec<u8>, Vec<(u32, String)>) {
        assert_eq!(self.exact_scopes, 0);
        (self.asm.finalize(), self.comments)
    }

    fn check_macro(&self) {
        assert_eq!(self.exact_scopes, 0, "macro instruction inside an exact assembly scope");
    }

    /// Dumps the literal pool behind a branch when `margin` more bytes could
    /// push the oldest pending literal out of range.
    pub fn maybe_emit_literal_pool(&mut self, margin: usize) {
        if self.asm.is_literal_pool_blocked() || self.asm.in_it_block() {
            return;
        }
        if self.asm.literal_pool_needed(margin) {
            self.asm.emit_literal_pool();
        }
    }

    pub fn exact_scope(&mut self, size: usize, kind: ScopeSize) -> ExactAssemblyScope<'_> {
        self.maybe_emit_literal_pool(size);
        self.asm.block_literal_pool();
        self.exact_scopes += 1;
        let start = self.asm.position();
        ExactAssemblyScope {
            masm: self,
            start,
            size,
            kind,
        }
    }

    pub fn emission_check_scope(&mut self, max_size: usize) -> EmissionCheckScope<'_> {
        self.maybe_emit_literal_pool(max_size);
        self.asm.block_literal_pool();
        let start = self.asm.position();
        EmissionCheckScope {
            masm: self,
            start,
            max_size,
        }
    }

    pub fn mov(&mut self, rd: Register, rm: Register) {
        if rd != rm {
            self.asm.mov_reg16(rd, rm);
        }
    }

    /// Materializes `value` without touching the flags.
    pub fn load_const(&mut self, rd: Register, value: i32) {
        self.check_macro();
        let bits = value as u32;
        if is_modified_immediate(bits) {
            self.asm.mov_w_imm(false, rd, bits);
        } else if is_modified_immediate(!bits) {
            self.asm.mvn_w_imm(false, rd, !bits);
        } else {
            self.asm.movw(rd, bits & 0xffff);
            if bits >> 16 != 0 {
                self.asm.movt(rd, bits >> 16);
            }
        }
    }

    /// Like `load_const`, but may clobber the flags for a shorter encoding.
    pub fn load_const_flags_dead(&mut self, rd: Register, value: i32) {
        if rd.is_low() && (0..256).contains(&value) && !self.asm.in_it_block() {
            self.asm.movs_imm8(rd, value as u32);
        } else {
            self.load_const(rd, value);
        }
    }

    /// `rd = rn + value` without touching the flags.
    pub fn add_constant(&mut self, rd: Register, rn: Register, value: i32) {
        self.check_macro();
        if value == 0 {
            self.mov(rd, rn);
        } else if is_modified_immediate(value as u32) {
            self.asm.dp_imm(DataOp::Add, false, rd, rn, value as u32);
        } else if value != i32::MIN && is_modified_immediate(value.wrapping_neg() as u32) {
            self.asm.dp_imm(DataOp::Sub, false, rd, rn, value.wrapping_neg() as u32);
        } else if (0..4096).contains(&value) {
            self.asm.addw(rd, rn, value as u32);
        } else if (-4095..0).contains(&value) {
            self.asm.subw(rd, rn, (-value) as u32);
        } else if rd != rn {
            self.load_const(rd, value);
            self.asm.dp_reg(DataOp::Add, false, rd, rn, rd, Shift::LSL, 0);
        } else {
            let temp = self.scratch();
            self.load_const(*temp, value);
            self.asm.dp_reg(DataOp::Add, false, rd, rn, *temp, Shift::LSL, 0);
        }
    }

    /// `rd = rn + value`, setting the flags as `ADDS` would.
    pub fn add_constant_set_flags(&mut self, rd: Register, rn: Register, value: i32) {
        self.check_macro();
        if is_modified_immediate(value as u32) {
            self.asm.dp_imm(DataOp::Add, true, rd, rn, value as u32);
        } else if value != i32::MIN && is_modified_immediate(value.wrapping_neg() as u32) {
            self.asm.dp_imm(DataOp::Sub, true, rd, rn, value.wrapping_neg() as u32);
        } else if rd != rn {
            self.load_const(rd, value);
            self.asm.dp_reg(DataOp::Add, true, rd, rn, rd, Shift::LSL, 0);
        } else {
            let temp = self.scratch();
            self.load_const(*temp, value);
            self.asm.dp_reg(DataOp::Add, true, rd, rn, *temp, Shift::LSL, 0);
        }
    }

    /// Bitwise `op` with an immediate, using the complemented form when only
    /// `!value` is encodable.
    pub fn bitwise_const(&mut self, op: DataOp, set_flags: bool, rd: Register, rn: Register, value: u32) {
        self.check_macro();
        if is_modified_immediate(value) {
            self.asm.dp_imm(op, set_flags, rd, rn, value);
            return;
        }
        let complement = match op {
            DataOp::And => Some(DataOp::Bic),
            DataOp::Orr => Some(DataOp::Orn),
            _ => None,
        };
        match complement {
            Some(inverted) if is_modified_immediate(!value) => {
                self.asm.dp_imm(inverted, set_flags, rd, rn, !value);
            }
            _ => {
                let temp = self.scratch();
                self.load_const(*temp, value as i32);
                self.asm.dp_reg(op, set_flags, rd, rn, *temp, Shift::LSL, 0);
            }
        }
    }

    pub fn cmp_const(&mut self, rn: Register, value: i32) {
        self.check_macro();
        if rn.is_low() && (0..256).contains(&value) {
            self.asm.cmp_imm8(rn, value as u32);
        } else if is_modified_immediate(value as u32) {
            self.asm.cmp_w_imm(rn, value as u32);
        } else if value != i32::MIN && is_modified_immediate(value.wrapping_neg() as u32) {
            self.asm.cmn_w_imm(rn, value.wrapping_neg() as u32);
        } else {
            let temp = self.scratch();
            self.load_const(*temp, value);
            self.asm.cmp_reg16(rn, *temp);
        }
    }

    /// Splits `offset` into a base adjustment and an offset the immediate
    /// forms accept.
    fn split_offset(offset: i32, limit: i32) -> (i32, i32) {
        if offset >= 0 {
            let low = offset & (limit - 1);
            (offset - low, low)
        } else {
            (offset, 0)
        }
    }

    pub fn load_from_offset(&mut self, kind: LoadKind, rt: Register, base: Register, offset: i32) {
        self.check_macro();
        if (-255..4096).contains(&offset) {
            self.asm.ldr_imm(kind, rt, base, offset);
            return;
        }
        let (adjust, low) = Self::split_offset(offset, 4096);
        if rt != base {
            self.add_constant(rt, base, adjust);
            self.asm.ldr_imm(kind, rt, rt, low);
        } else {
            let temp = self.scratch();
            self.add_constant(*temp, base, adjust);
            self.asm.ldr_imm(kind, rt, *temp, low);
        }
    }

    pub fn store_to_offset(&mut self, kind: StoreKind, rt: Register, base: Register, offset: i32) {
        self.check_macro();
        if (-255..4096).contains(&offset) {
            self.asm.str_imm(kind, rt, base, offset);
            return;
        }
        let (adjust, low) = Self::split_offset(offset, 4096);
        let temp = self.scratch();
        assert!(rt != *temp && base != *temp);
        self.add_constant(*temp, base, adjust);
        self.asm.str_imm(kind, rt, *temp, low);
    }

    pub fn load_pair_from_offset(&mut self, low: Register, high: Register, base: Register, offset: i32) {
        self.check_macro();
        if offset % 4 == 0 && (-1020..=1020).contains(&offset) && low != high {
            self.asm.ldrd(low, high, base, offset);
        } else if low == base {
            self.load_from_offset(LoadKind::Word, high, base, offset + 4);
            self.load_from_offset(LoadKind::Word, low, base, offset);
        } else {
            self.load_from_offset(LoadKind::Word, low, base, offset);
            self.load_from_offset(LoadKind::Word, high, base, offset + 4);
        }
    }

    pub fn store_pair_to_offset(&mut self, low: Register, high: Register, base: Register, offset: i32) {
        self.check_macro();
        if offset % 4 == 0 && (-1020..=1020).contains(&offset) {
            self.asm.strd(low, high, base, offset);
        } else {
            self.store_to_offset(StoreKind::Word, low, base, offset);
            self.store_to_offset(StoreKind::Word, high, base, offset + 4);
        }
    }

    fn vfp_offset_fits(offset: i32) -> bool {
        offset % 4 == 0 && (-1020..=1020).contains(&offset)
    }

    pub fn load_s_from_offset(&mut self, sd: SRegister, base: Register, offset: i32) {
        self.check_macro();
        if Self::vfp_offset_fits(offset) {
            self.asm.vldr_s(sd, base, offset);
        } else {
            let temp = self.scratch();
            self.add_constant(*temp, base, offset);
            self.asm.vldr_s(sd, *temp, 0);
        }
    }

    pub fn store_s_to_offset(&mut self, sd: SRegister, base: Register, offset: i32) {
        self.check_macro();
        if Self::vfp_offset_fits(offset) {
            self.asm.vstr_s(sd, base, offset);
        } else {
            let temp = self.scratch();
            self.add_constant(*temp, base, offset);
            self.asm.vstr_s(sd, *temp, 0);
        }
    }

    pub fn load_d_from_offset(&mut self, dd: DRegister, base: Register, offset: i32) {
        self.check_macro();
        if Self::vfp_offset_fits(offset) {
            self.asm.vldr_d(dd, base, offset);
        } else {
            let temp = self.scratch();
            self.add_constant(*temp, base, offset);
            self.asm.vldr_d(dd, *temp, 0);
        }
    }

    pub fn store_d_to_offset(&mut self, dd: DRegister, base: Register, offset: i32) {
        self.check_macro();
        if Self::vfp_offset_fits(offset) {
            self.asm.vstr_d(dd, base, offset);
        } else {
            let temp = self.scratch();
            self.add_constant(*temp, base, offset);
            self.asm.vstr_d(dd, *temp, 0);
        }
    }

    pub fn load_sconst(&mut self, sd: SRegister, value: f32) {
        self.check_macro();
        match encode_vfp_imm_f32(value) {
            Some(imm8) => self.asm.vmov_s_imm(sd, imm8),
            None => {
                let literal = self.asm.new_literal_u32(value.to_bits());
                self.asm.vldr_literal_s(sd, literal);
            }
        }
    }

    pub fn load_dconst(&mut self, dd: DRegister, value: f64) {
        self.check_macro();
        match encode_vfp_imm_f64(value) {
            Some(imm8) => self.asm.vmov_d_imm(dd, imm8),
            None => {
                let literal = self.asm.new_literal_u64(value.to_bits());
                self.asm.vldr_literal_d(dd, literal);
            }
        }
    }

    /// Branches to `target` when `rn` is zero (`nonzero == false`) or not.
    /// CBZ/CBNZ only reach 126 bytes forward, so they are used only when the
    /// caller knows the target is near.
    pub fn compare_and_branch(&mut self, rn: Register, nonzero: bool, target: Label, is_far_target: bool) {
        self.check_macro();
        let forward = self.asm.offset(target).is_none();
        if !is_far_target && forward && rn.is_low() {
            if nonzero {
                self.asm.cbnz(rn, target);
            } else {
                self.asm.cbz(rn, target);
            }
        } else {
            self.cmp_const(rn, 0);
            self.asm.b_cond(if nonzero { Cond::NE } else { Cond::EQ }, target);
        }
    }
}

impl Deref for ArmMacroAssembler {
    type Target = Assembler;

    fn deref(&self) -> &Assembler {
        &self.asm
    }
}

impl DerefMut for ArmMacroAssembler {
    fn deref_mut(&mut self) -> &mut Assembler {
        &mut self.asm
    }
}

/// A region emitted instruction by instruction: no macro expansion, no
/// literal pool, and a size checked when the scope ends.
pub struct ExactAssemblyScope<'a> {
    masm: &'a mut ArmMacroAssembler,
    start: usize,
    size: usize,
    kind: ScopeSize,
}

impl ExactAssemblyScope<'_> {
    pub fn emitted(&self) -> usize {
        self.masm.asm.position() - self.start
    }
}

impl Deref for ExactAssemblyScope<'_> {
    type Target = Assembler;

    fn deref(&self) -> &Assembler {
        &self.masm.asm
    }
}

impl DerefMut for ExactAssemblyScope<'_> {
    fn deref_mut(&mut self) -> &mut Assembler {
        &mut self.masm.asm
    }
}

impl Drop for ExactAssemblyScope<'_> {
    fn drop(&mut self) {
        let emitted = self.emitted();
        self.masm.exact_scopes -= 1;
        self.masm.asm.release_literal_pool();
        if std::thread::panicking() {
            return;
        }
        match self.kind {
            ScopeSize::Exact => assert_eq!(emitted, self.size, "exact assembly scope size mismatch"),
            ScopeSize::Maximum => assert!(emitted <= self.size, "exact assembly scope overflow"),
        }
    }
}

/// Allows macro instructions but keeps the literal pool out and bounds the
/// emitted size.
pub struct EmissionCheckScope<'a> {
    masm: &'a mut ArmMacroAssembler,
    start: usize,
    max_size: usize,
}

impl Deref for EmissionCheckScope<'_> {
    type Target = ArmMacroAssembler;

    fn deref(&self) -> &ArmMacroAssembler {
        self.masm
    }
}

impl DerefMut for EmissionCheckScope<'_> {
    fn deref_mut(&mut self) -> &mut ArmMacroAssembler {
        self.masm
    }
}

impl Drop for EmissionCheckScope<'_> {
    fn drop(&mut self) {
        let emitted = self.masm.asm.position() - self.start;
        self.masm.asm.release_literal_pool();
        if !std::thread::panicking() {
            assert!(emitted <= self.max_size, "emission check scope overflow");
        }
    }
}

#[cfg(test)]
mod tests {
    use tern_asm::thumb2::{IP, R0, R1, R2, R8, S0, S30};

    use super::*;

    fn halfwords(masm: ArmMacroAssembler) -> Vec<u16> {
        let (code, _) = masm.finalize();
        code.chunks(2).map(|c| u16::from_le_bytes([c[0], c[1]])).collect()
    }

    #[test]
    fn test_load_const_forms() {
        let mut masm = ArmMacroAssembler::new(false);
        masm.load_const(R0, 0);
        masm.load_const(R1, -256);
        masm.load_const(R2, 0x1234_5678);
        let code = halfwords(masm);
        // MOV.W r0, #0
        assert_eq!(&code[0..2], &[0xF04F, 0x0000]);
        // MVN.W r1, #0xff
        assert_eq!(&code[2..4], &[0xF06F, 0x01FF]);
        // MOVW r2, #0x5678; MOVT r2, #0x1234
        assert_eq!(code.len(), 8);
    }

    #[test]
    fn test_flags_dead_constant_is_narrow() {
        let mut masm = ArmMacroAssembler::new(false);
        masm.load_const_flags_dead(R1, 7);
        assert_eq!(halfwords(masm), vec![0x2107]);
    }

    #[test]
    fn test_scratch_released_on_drop() {
        let masm = ArmMacroAssembler::new(false);
        {
            let ip = masm.scratch();
            assert_eq!(*ip, IP);
            assert!(!masm.has_core_scratch());
        }
        assert!(masm.has_core_scratch());
        let d = masm.scratch_d();
        assert_eq!(d.low(), S30);
    }

    #[test]
    #[should_panic(expected = "all scratch registers used")]
    fn test_scratch_exhaustion_is_fatal() {
        let masm = ArmMacroAssembler::new(false);
        let _a = masm.scratch();
        let _b = masm.scratch();
    }

    #[test]
    fn test_large_offset_load_uses_destination_as_base() {
        let mut masm = ArmMacroAssembler::new(false);
        masm.load_from_offset(LoadKind::Word, R0, R1, 0x1004);
        let code = halfwords(masm);
        // ADD.W r0, r1, #0x1000; LDR r0, [r0, #4]
        assert_eq!(code, vec![0xF501, 0x5080, 0x6840]);
    }

    #[test]
    fn test_exact_scope_blocks_pool() {
        let mut masm = ArmMacroAssembler::new(false);
        {
            let mut scope = masm.exact_scope(6, ScopeSize::Exact);
            scope.cmp_w_imm(R8, 0);
            assert!(scope.is_literal_pool_blocked());
            scope.nop();
        }
        assert!(!masm.is_literal_pool_blocked());
        masm.load_sconst(S0, 1.0);
        assert_eq!(halfwords(masm).len(), 5);
    }

    #[test]
    #[should_panic(expected = "size mismatch")]
    fn test_exact_scope_size_checked() {
        let mut masm = ArmMacroAssembler::new(false);
        let mut scope = masm.exact_scope(4, ScopeSize::Exact);
        scope.nop();
    }
}
