use crate::{AssemblerBuffer, Label};

pub const R0: Register = Register(0);
pub const R1: Register = Register(1);
pub const R2: Register = Register(2);
pub const R3: Register = Register(3);
pub const R4: Register = Register(4);
pub const R5: Register = Register(5);
pub const R6: Register = Register(6);
pub const R7: Register = Register(7);
pub const R8: Register = Register(8);
pub const R9: Register = Register(9);
pub const R10: Register = Register(10);
pub const R11: Register = Register(11);
pub const R12: Register = Register(12);
pub const R13: Register = Register(13);
pub const R14: Register = Register(14);
pub const R15: Register = Register(15);
pub const IP: Register = R12;
pub const SP: Register = R13;
pub const LR: Register = R14;
pub const PC: Register = R15;

#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct Register(u8);

impl Register {
    pub const fn new(value: u8) -> Register {
        assert!(value < 16);
        Register(value)
    }

    pub fn code(self) -> u32 {
        self.0 as u32
    }

    pub fn mask(self) -> u32 {
        1 << self.0
    }

    pub fn is_low(self) -> bool {
        self.0 < 8
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct SRegister(u8);

impl SRegister {
    pub const fn new(value: u8) -> SRegister {
        assert!(value < 32);
        SRegister(value)
    }

    pub fn code(self) -> u32 {
        self.0 as u32
    }

    pub fn mask(self) -> u32 {
        1 << self.0
    }

    // Vd:D split of a single-precision register number.
    fn vd(self) -> u32 {
        (self.0 as u32) >> 1
    }

    fn d(self) -> u32 {
        (self.0 as u32) & 1
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct DRegister(u8);

impl DRegister {
    pub const fn new(value: u8) -> DRegister {
        assert!(value < 32);
        DRegister(value)
    }

    pub fn code(self) -> u32 {
        self.0 as u32
    }

    pub fn low(self) -> SRegister {
        assert!(self.0 < 16);
        SRegister(self.0 * 2)
    }

    pub fn high(self) -> SRegister {
        assert!(self.0 < 16);
        SRegister(self.0 * 2 + 1)
    }

    pub fn from_low(reg: SRegister) -> DRegister {
        assert!(reg.0 % 2 == 0);
        DRegister(reg.0 / 2)
    }

    // D:Vd split of a double-precision register number.
    fn vd(self) -> u32 {
        (self.0 as u32) & 0xF
    }

    fn d(self) -> u32 {
        (self.0 as u32) >> 4
    }
}

pub const S0: SRegister = SRegister(0);
pub const S1: SRegister = SRegister(1);
pub const S2: SRegister = SRegister(2);
pub const S3: SRegister = SRegister(3);
pub const S4: SRegister = SRegister(4);
pub const S5: SRegister = SRegister(5);
pub const S6: SRegister = SRegister(6);
pub const S7: SRegister = SRegister(7);
pub const S8: SRegister = SRegister(8);
pub const S9: SRegister = SRegister(9);
pub const S10: SRegister = SRegister(10);
pub const S11: SRegister = SRegister(11);
pub const S12: SRegister = SRegister(12);
pub const S13: SRegister = SRegister(13);
pub const S14: SRegister = SRegister(14);
pub const S15: SRegister = SRegister(15);
pub const S16: SRegister = SRegister(16);
pub const S17: SRegister = SRegister(17);
pub const S18: SRegister = SRegister(18);
pub const S19: SRegister = SRegister(19);
pub const S20: SRegister = SRegister(20);
pub const S21: SRegister = SRegister(21);
pub const S22: SRegister = SRegister(22);
pub const S23: SRegister = SRegister(23);
pub const S24: SRegister = SRegister(24);
pub const S25: SRegister = SRegister(25);
pub const S26: SRegister = SRegister(26);
pub const S27: SRegister = SRegister(27);
pub const S28: SRegister = SRegister(28);
pub const S29: SRegister = SRegister(29);
pub const S30: SRegister = SRegister(30);
pub const S31: SRegister = SRegister(31);

pub const D0: DRegister = DRegister(0);
pub const D1: DRegister = DRegister(1);
pub const D2: DRegister = DRegister(2);
pub const D3: DRegister = DRegister(3);
pub const D4: DRegister = DRegister(4);
pub const D5: DRegister = DRegister(5);
pub const D6: DRegister = DRegister(6);
pub const D7: DRegister = DRegister(7);
pub const D8: DRegister = DRegister(8);
pub const D9: DRegister = DRegister(9);
pub const D10: DRegister = DRegister(10);
pub const D11: DRegister = DRegister(11);
pub const D12: DRegister = DRegister(12);
pub const D13: DRegister = DRegister(13);
pub const D14: DRegister = DRegister(14);
pub const D15: DRegister = DRegister(15);

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum Cond {
    EQ,
    NE,
    HS,
    LO,
    MI,
    PL,
    VS,
    VC,
    HI,
    LS,
    GE,
    LT,
    GT,
    LE,
    AL,
}

impl Cond {
    pub fn invert(self) -> Cond {
        match self {
            Cond::EQ => Cond::NE,
            Cond::NE => Cond::EQ,
            Cond::HS => Cond::LO,
            Cond::LO => Cond::HS,
            Cond::MI => Cond::PL,
            Cond::PL => Cond::MI,
            Cond::VS => Cond::VC,
            Cond::VC => Cond::VS,
            Cond::HI => Cond::LS,
            Cond::LS => Cond::HI,
            Cond::GE => Cond::LT,
            Cond::LT => Cond::GE,
            Cond::GT => Cond::LE,
            Cond::LE => Cond::GT,
            Cond::AL => panic!("AL cannot be inverted"),
        }
    }

    pub fn u32(self) -> u32 {
        match self {
            Cond::EQ => 0b0000,
            Cond::NE => 0b0001,
            Cond::HS => 0b0010,
            Cond::LO => 0b0011,
            Cond::MI => 0b0100,
            Cond::PL => 0b0101,
            Cond::VS => 0b0110,
            Cond::VC => 0b0111,
            Cond::HI => 0b1000,
            Cond::LS => 0b1001,
            Cond::GE => 0b1010,
            Cond::LT => 0b1011,
            Cond::GT => 0b1100,
            Cond::LE => 0b1101,
            Cond::AL => 0b1110,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Shift {
    LSL,
    LSR,
    ASR,
    ROR,
}

impl Shift {
    fn u32(self) -> u32 {
        match self {
            Shift::LSL => 0,
            Shift::LSR => 1,
            Shift::ASR => 2,
            Shift::ROR => 3,
        }
    }
}

/// Data-processing opcodes shared by the modified-immediate and
/// shifted-register T32 encodings.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum DataOp {
    And,
    Bic,
    Orr,
    Orn,
    Eor,
    Add,
    Adc,
    Sbc,
    Sub,
    Rsb,
}

impl DataOp {
    fn u32(self) -> u32 {
        match self {
            DataOp::And => 0,
            DataOp::Bic => 1,
            DataOp::Orr => 2,
            DataOp::Orn => 3,
            DataOp::Eor => 4,
            DataOp::Add => 8,
            DataOp::Adc => 10,
            DataOp::Sbc => 11,
            DataOp::Sub => 13,
            DataOp::Rsb => 14,
        }
    }
}

/// Opcodes of the 16-bit register data-processing group. All of them set
/// flags outside an IT block.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum DataOp16 {
    Ands,
    Eors,
    Lsls,
    Lsrs,
    Asrs,
    Adcs,
    Sbcs,
    Rors,
    Tst,
    Rsbs,
    Cmp,
    Cmn,
    Orrs,
    Muls,
    Bics,
    Mvns,
}

impl DataOp16 {
    fn u32(self) -> u32 {
        match self {
            DataOp16::Ands => 0,
            DataOp16::Eors => 1,
            DataOp16::Lsls => 2,
            DataOp16::Lsrs => 3,
            DataOp16::Asrs => 4,
            DataOp16::Adcs => 5,
            DataOp16::Sbcs => 6,
            DataOp16::Rors => 7,
            DataOp16::Tst => 8,
            DataOp16::Rsbs => 9,
            DataOp16::Cmp => 10,
            DataOp16::Cmn => 11,
            DataOp16::Orrs => 12,
            DataOp16::Muls => 13,
            DataOp16::Bics => 14,
            DataOp16::Mvns => 15,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum LoadKind {
    Word,
    UnsignedByte,
    SignedByte,
    UnsignedHalf,
    SignedHalf,
}

impl LoadKind {
    pub fn size(self) -> u32 {
        match self {
            LoadKind::Word => 4,
            LoadKind::UnsignedByte | LoadKind::SignedByte => 1,
            LoadKind::UnsignedHalf | LoadKind::SignedHalf => 2,
        }
    }

    // hw1 of the imm12 form without Rn.
    fn t32_imm12(self) -> u32 {
        match self {
            LoadKind::Word => 0xF8D0,
            LoadKind::UnsignedByte => 0xF890,
            LoadKind::SignedByte => 0xF990,
            LoadKind::UnsignedHalf => 0xF8B0,
            LoadKind::SignedHalf => 0xF9B0,
        }
    }

    fn t16_reg(self) -> u32 {
        match self {
            LoadKind::Word => 0x5800,
            LoadKind::UnsignedByte => 0x5C00,
            LoadKind::SignedByte => 0x5600,
            LoadKind::UnsignedHalf => 0x5A00,
            LoadKind::SignedHalf => 0x5E00,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum StoreKind {
    Word,
    Byte,
    Half,
}

impl StoreKind {
    pub fn size(self) -> u32 {
        match self {
            StoreKind::Word => 4,
            StoreKind::Byte => 1,
            StoreKind::Half => 2,
        }
    }

    fn t32_imm12(self) -> u32 {
        match self {
            StoreKind::Word => 0xF8C0,
            StoreKind::Byte => 0xF880,
            StoreKind::Half => 0xF8A0,
        }
    }

    fn t16_reg(self) -> u32 {
        match self {
            StoreKind::Word => 0x5000,
            StoreKind::Byte => 0x5400,
            StoreKind::Half => 0x5200,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum BarrierOption {
    Sy,
    Ish,
    IshSt,
}

impl BarrierOption {
    fn u32(self) -> u32 {
        match self {
            BarrierOption::Sy => 0xF,
            BarrierOption::Ish => 0xB,
            BarrierOption::IshSt => 0xA,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct Literal(usize);

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum LiteralValue {
    Word(u32),
    DoubleWord(u64),
}

struct LiteralData {
    value: LiteralValue,
    label: Label,
    placed: bool,
    unique: bool,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum LiteralUse {
    Ldr,
    Vldr,
}

impl LiteralUse {
    // Largest forward distance from Align(PC, 4) the encoding reaches.
    fn range(self) -> usize {
        match self {
            LiteralUse::Ldr => 4095,
            LiteralUse::Vldr => 1020,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum JumpKind {
    Unconditional16,
    Unconditional32,
    Conditional16(Cond),
    Conditional32(Cond),
    CompareZero(bool, Register),
    Link,
    Adr(Register, bool),
    LoadLiteral(Register),
    LoadLiteralS(SRegister),
    LoadLiteralD(DRegister),
    TableEntry(Label),
}

pub struct AssemblerThumb2 {
    unresolved_jumps: Vec<(u32, Label, JumpKind)>,
    buffer: AssemblerBuffer,
    literals: Vec<LiteralData>,
    pending_literals: Vec<Literal>,
    first_literal_use: Option<(usize, LiteralUse)>,
    literal_pool_blocked: u32,
    it_remaining: u32,
}

impl AssemblerThumb2 {
    pub fn new() -> AssemblerThumb2 {
        AssemblerThumb2 {
            unresolved_jumps: Vec::new(),
            buffer: AssemblerBuffer::new(),
            literals: Vec::new(),
            pending_literals: Vec::new(),
            first_literal_use: None,
            literal_pool_blocked: 0,
            it_remaining: 0,
        }
    }

    pub fn create_label(&mut self) -> Label {
        self.buffer.create_label()
    }

    pub fn create_and_bind_label(&mut self) -> Label {
        self.buffer.create_and_bind_label()
    }

    pub fn bind_label(&mut self, lbl: Label) {
        assert!(self.it_remaining == 0, "label bound inside IT block");
        self.buffer.bind_label(lbl);
    }

    pub fn offset(&self, lbl: Label) -> Option<u32> {
        self.buffer.offset(lbl)
    }

    pub fn position(&self) -> usize {
        self.buffer.position()
    }

    pub fn code(&self) -> &[u8] {
        &self.buffer.code
    }

    pub fn in_it_block(&self) -> bool {
        self.it_remaining > 0
    }

    pub fn finalize(mut self) -> Vec<u8> {
        assert!(self.it_remaining == 0, "unterminated IT block");
        self.emit_literal_pool_at_end();
        self.resolve_jumps();
        self.buffer.code
    }

    pub fn emit_u16(&mut self, value: u16) {
        self.buffer.emit_u16(value);
    }

    pub fn emit_u32(&mut self, value: u32) {
        self.buffer.emit_u32(value);
    }

    pub fn emit_u64(&mut self, value: u64) {
        self.buffer.emit_u64(value);
    }

    pub fn align(&mut self, alignment: usize) {
        assert!(alignment.is_power_of_two() && alignment >= 2);
        while self.position() % alignment != 0 {
            self.emit_u16(0);
        }
    }

    fn emit16(&mut self, insn: u32) {
        assert!(insn <= 0xFFFF);
        self.buffer.emit_u16(insn as u16);
        self.step_it();
    }

    // A 32-bit instruction is stored as two halfwords, leading halfword first.
    fn emit32(&mut self, insn: u32) {
        self.buffer.emit_u16((insn >> 16) as u16);
        self.buffer.emit_u16(insn as u16);
        self.step_it();
    }

    fn step_it(&mut self) {
        if self.it_remaining > 0 {
            self.it_remaining -= 1;
        }
    }

    fn resolve_jumps(&mut self) {
        let unresolved_jumps = std::mem::replace(&mut self.unresolved_jumps, Vec::new());

        let old_position = self.position();

        for (pc, lbl, kind) in unresolved_jumps {
            if let Some(lbl_offset) = self.offset(lbl) {
                let pc = pc as usize;
                self.buffer.set_position(pc);
                let target = lbl_offset as i32;
                let pc_value = pc as i32 + 4;
                let aligned_pc_value = (pc_value as i32) & !3;

                match kind {
                    JumpKind::Unconditional16 => {
                        self.buffer.emit_u16(inst::b16(target - pc_value) as u16);
                    }
                    JumpKind::Unconditional32 => self.emit_raw32(inst::b32(target - pc_value)),
                    JumpKind::Conditional16(cond) => {
                        self.buffer
                            .emit_u16(inst::bcond16(cond, target - pc_value) as u16);
                    }
                    JumpKind::Conditional32(cond) => {
                        self.emit_raw32(inst::bcond32(cond, target - pc_value))
                    }
                    JumpKind::CompareZero(nonzero, rn) => {
                        self.buffer
                            .emit_u16(inst::cbz(nonzero, rn, target - pc_value) as u16);
                    }
                    JumpKind::Link => self.emit_raw32(inst::bl(target - pc_value)),
                    JumpKind::Adr(rd, thumb) => {
                        let distance = target - aligned_pc_value + if thumb { 1 } else { 0 };
                        self.emit_raw32(inst::adr32(rd, distance));
                    }
                    JumpKind::LoadLiteral(rt) => {
                        self.emit_raw32(inst::ldr_literal(rt, target - aligned_pc_value))
                    }
                    JumpKind::LoadLiteralS(sd) => {
                        let distance = target - aligned_pc_value;
                        self.emit_raw32(cls::vfp_load_store(
                            true,
                            false,
                            sd.vd(),
                            sd.d(),
                            PC,
                            distance,
                        ))
                    }
                    JumpKind::LoadLiteralD(dd) => {
                        let distance = target - aligned_pc_value;
                        self.emit_raw32(cls::vfp_load_store(
                            true,
                            true,
                            dd.vd(),
                            dd.d(),
                            PC,
                            distance,
                        ))
                    }
                    JumpKind::TableEntry(base) => {
                        let base = self.offset(base).expect("unbound jump table base");
                        let value = target - base as i32 + 1;
                        self.buffer.emit_u32(value as u32);
                    }
                }
            } else {
                panic!("unbound label");
            }
        }

        self.buffer.set_position(old_position);
    }

    fn emit_raw32(&mut self, insn: u32) {
        self.buffer.emit_u16((insn >> 16) as u16);
        self.buffer.emit_u16(insn as u16);
    }

    fn emit_jump_placeholder16(&mut self, lbl: Label, kind: JumpKind) {
        let pc = self.position() as u32;
        self.unresolved_jumps.push((pc, lbl, kind));
        self.emit16(0xBF00);
    }

    fn emit_jump_placeholder32(&mut self, lbl: Label, kind: JumpKind) {
        let pc = self.position() as u32;
        self.unresolved_jumps.push((pc, lbl, kind));
        self.emit32(0xF3AF8000);
    }

    fn pc_value(&self) -> i32 {
        self.position() as i32 + 4
    }

    fn aligned_pc_value(&self) -> i32 {
        self.pc_value() & !3
    }
}

// Branches and control flow.
impl AssemblerThumb2 {
    pub fn b(&mut self, lbl: Label) {
        if let Some(target) = self.offset(lbl) {
            let distance = target as i32 - self.pc_value();
            if fits_branch16(distance) {
                self.emit16(inst::b16(distance));
            } else {
                self.emit32(inst::b32(distance));
            }
        } else {
            self.emit_jump_placeholder32(lbl, JumpKind::Unconditional32);
        }
    }

    /// Forward branch the caller knows lands within 2KB.
    pub fn b_near(&mut self, lbl: Label) {
        if let Some(target) = self.offset(lbl) {
            let distance = target as i32 - self.pc_value();
            self.emit16(inst::b16(distance));
        } else {
            self.emit_jump_placeholder16(lbl, JumpKind::Unconditional16);
        }
    }

    pub fn b_cond(&mut self, cond: Cond, lbl: Label) {
        assert!(self.it_remaining == 0, "conditional branch inside IT block");
        if let Some(target) = self.offset(lbl) {
            let distance = target as i32 - self.pc_value();
            if fits_bcond16(distance) {
                self.emit16(inst::bcond16(cond, distance));
            } else {
                self.emit32(inst::bcond32(cond, distance));
            }
        } else {
            self.emit_jump_placeholder32(lbl, JumpKind::Conditional32(cond));
        }
    }

    /// Forward conditional branch the caller knows lands within 256 bytes.
    pub fn b_cond_near(&mut self, cond: Cond, lbl: Label) {
        assert!(self.it_remaining == 0, "conditional branch inside IT block");
        if let Some(target) = self.offset(lbl) {
            let distance = target as i32 - self.pc_value();
            self.emit16(inst::bcond16(cond, distance));
        } else {
            self.emit_jump_placeholder16(lbl, JumpKind::Conditional16(cond));
        }
    }

    pub fn cbz(&mut self, rn: Register, lbl: Label) {
        assert!(self.offset(lbl).is_none(), "cbz only branches forward");
        assert!(self.it_remaining == 0);
        self.emit_jump_placeholder16(lbl, JumpKind::CompareZero(false, rn));
    }

    pub fn cbnz(&mut self, rn: Register, lbl: Label) {
        assert!(self.offset(lbl).is_none(), "cbnz only branches forward");
        assert!(self.it_remaining == 0);
        self.emit_jump_placeholder16(lbl, JumpKind::CompareZero(true, rn));
    }

    pub fn bl(&mut self, lbl: Label) {
        if let Some(target) = self.offset(lbl) {
            let distance = target as i32 - self.pc_value();
            self.emit32(inst::bl(distance));
        } else {
            self.emit_jump_placeholder32(lbl, JumpKind::Link);
        }
    }

    /// BL with a zero displacement, to be patched by a linker.
    pub fn bl_placeholder(&mut self) -> usize {
        let pos = self.position();
        self.emit32(inst::bl(0));
        pos
    }

    pub fn bx(&mut self, rm: Register) {
        self.emit16(0x4700 | rm.code() << 3);
    }

    pub fn blx(&mut self, rm: Register) {
        self.emit16(0x4780 | rm.code() << 3);
    }

    /// ADR.W to a label.
    pub fn adr(&mut self, rd: Register, lbl: Label) {
        self.adr_impl(rd, lbl, false);
    }

    /// ADR.W to a label with the Thumb state bit set in the result.
    pub fn adr_code(&mut self, rd: Register, lbl: Label) {
        self.adr_impl(rd, lbl, true);
    }

    fn adr_impl(&mut self, rd: Register, lbl: Label, thumb: bool) {
        if let Some(target) = self.offset(lbl) {
            let distance = target as i32 - self.aligned_pc_value() + if thumb { 1 } else { 0 };
            self.emit32(inst::adr32(rd, distance));
        } else {
            self.emit_jump_placeholder32(lbl, JumpKind::Adr(rd, thumb));
        }
    }

    /// Starts an IT block. `then_else` lists the predicate of the
    /// instructions following the first one: `true` for then, `false` for else.
    pub fn it_block(&mut self, cond: Cond, then_else: &[bool]) {
        assert!(self.it_remaining == 0, "nested IT block");
        assert!(then_else.len() <= 3);
        assert!(cond != Cond::AL || then_else.iter().all(|&t| t));
        let firstcond0 = cond.u32() & 1;
        let mut mask = 0;
        for (idx, &then) in then_else.iter().enumerate() {
            let bit = if then { firstcond0 } else { firstcond0 ^ 1 };
            mask |= bit << (3 - idx);
        }
        mask |= 1 << (3 - then_else.len());
        self.emit16(0xBF00 | cond.u32() << 4 | mask);
        self.it_remaining = 1 + then_else.len() as u32;
    }

    pub fn it(&mut self, cond: Cond) {
        self.it_block(cond, &[]);
    }

    pub fn itt(&mut self, cond: Cond) {
        self.it_block(cond, &[true]);
    }

    pub fn ite(&mut self, cond: Cond) {
        self.it_block(cond, &[false]);
    }

    pub fn nop(&mut self) {
        self.emit16(0xBF00);
    }

    pub fn bkpt(&mut self, imm8: u32) {
        assert!(fits_u8(imm8));
        self.emit16(0xBE00 | imm8);
    }

    pub fn udf(&mut self, imm8: u32) {
        assert!(fits_u8(imm8));
        self.emit16(0xDE00 | imm8);
    }
}

// Data processing.
impl AssemblerThumb2 {
    pub fn movs_imm8(&mut self, rd: Register, imm8: u32) {
        assert!(rd.is_low() && fits_u8(imm8));
        self.emit16(0x2000 | rd.code() << 8 | imm8);
    }

    pub fn mov_w_imm(&mut self, set_flags: bool, rd: Register, imm: u32) {
        self.dp_imm(DataOp::Orr, set_flags, rd, PC, imm);
    }

    pub fn mvn_w_imm(&mut self, set_flags: bool, rd: Register, imm: u32) {
        self.dp_imm(DataOp::Orn, set_flags, rd, PC, imm);
    }

    pub fn movw(&mut self, rd: Register, imm16: u32) {
        self.emit32(cls::mov_wide(0xF240, rd, imm16));
    }

    pub fn movt(&mut self, rd: Register, imm16: u32) {
        self.emit32(cls::mov_wide(0xF2C0, rd, imm16));
    }

    /// 16-bit MOV between any two registers, flags unchanged.
    pub fn mov_reg16(&mut self, rd: Register, rm: Register) {
        let d = rd.code() >> 3;
        self.emit16(0x4600 | d << 7 | rm.code() << 3 | (rd.code() & 7));
    }

    pub fn mov_w_reg(&mut self, set_flags: bool, rd: Register, rm: Register) {
        self.dp_reg(DataOp::Orr, set_flags, rd, PC, rm, Shift::LSL, 0);
    }

    pub fn mvn_w_reg(&mut self, set_flags: bool, rd: Register, rm: Register) {
        self.dp_reg(DataOp::Orn, set_flags, rd, PC, rm, Shift::LSL, 0);
    }

    /// T32 data processing with a modified immediate operand.
    pub fn dp_imm(&mut self, op: DataOp, set_flags: bool, rd: Register, rn: Register, imm: u32) {
        let imm12 = encode_modified_immediate(imm).expect("immediate not encodable");
        self.emit32(cls::dp_modified_imm(op, set_flags, rd, rn, imm12));
    }

    pub fn dp_reg(
        &mut self,
        op: DataOp,
        set_flags: bool,
        rd: Register,
        rn: Register,
        rm: Register,
        shift: Shift,
        amount: u32,
    ) {
        self.emit32(cls::dp_shifted_reg(op, set_flags, rd, rn, rm, shift, amount));
    }

    pub fn dp16(&mut self, op: DataOp16, rdn: Register, rm: Register) {
        assert!(rdn.is_low() && rm.is_low());
        self.emit16(0x4000 | op.u32() << 6 | rm.code() << 3 | rdn.code());
    }

    pub fn adds_imm3(&mut self, rd: Register, rn: Register, imm3: u32) {
        assert!(rd.is_low() && rn.is_low() && imm3 < 8);
        self.emit16(0x1C00 | imm3 << 6 | rn.code() << 3 | rd.code());
    }

    pub fn subs_imm3(&mut self, rd: Register, rn: Register, imm3: u32) {
        assert!(rd.is_low() && rn.is_low() && imm3 < 8);
        self.emit16(0x1E00 | imm3 << 6 | rn.code() << 3 | rd.code());
    }

    pub fn adds_imm8(&mut self, rdn: Register, imm8: u32) {
        assert!(rdn.is_low() && fits_u8(imm8));
        self.emit16(0x3000 | rdn.code() << 8 | imm8);
    }

    pub fn subs_imm8(&mut self, rdn: Register, imm8: u32) {
        assert!(rdn.is_low() && fits_u8(imm8));
        self.emit16(0x3800 | rdn.code() << 8 | imm8);
    }

    pub fn adds_reg16(&mut self, rd: Register, rn: Register, rm: Register) {
        assert!(rd.is_low() && rn.is_low() && rm.is_low());
        self.emit16(0x1800 | rm.code() << 6 | rn.code() << 3 | rd.code());
    }

    pub fn subs_reg16(&mut self, rd: Register, rn: Register, rm: Register) {
        assert!(rd.is_low() && rn.is_low() && rm.is_low());
        self.emit16(0x1A00 | rm.code() << 6 | rn.code() << 3 | rd.code());
    }

    /// 16-bit ADD rdn, rm without flag update; any registers.
    pub fn add_reg16(&mut self, rdn: Register, rm: Register) {
        let dn = rdn.code() >> 3;
        self.emit16(0x4400 | dn << 7 | rm.code() << 3 | (rdn.code() & 7));
    }

    pub fn addw(&mut self, rd: Register, rn: Register, imm12: u32) {
        self.emit32(cls::plain_imm12(0xF200, rd, rn, imm12));
    }

    pub fn subw(&mut self, rd: Register, rn: Register, imm12: u32) {
        self.emit32(cls::plain_imm12(0xF2A0, rd, rn, imm12));
    }

    pub fn add_sp_imm7(&mut self, imm: u32) {
        assert!(imm % 4 == 0 && imm / 4 < 128);
        self.emit16(0xB000 | imm / 4);
    }

    pub fn sub_sp_imm7(&mut self, imm: u32) {
        assert!(imm % 4 == 0 && imm / 4 < 128);
        self.emit16(0xB080 | imm / 4);
    }

    pub fn add_rd_sp_imm8(&mut self, rd: Register, imm: u32) {
        assert!(rd.is_low() && imm % 4 == 0 && imm / 4 < 256);
        self.emit16(0xA800 | rd.code() << 8 | imm / 4);
    }

    pub fn cmp_imm8(&mut self, rn: Register, imm8: u32) {
        assert!(rn.is_low() && fits_u8(imm8));
        self.emit16(0x2800 | rn.code() << 8 | imm8);
    }

    pub fn cmp_reg16(&mut self, rn: Register, rm: Register) {
        if rn.is_low() && rm.is_low() {
            self.dp16(DataOp16::Cmp, rn, rm);
        } else {
            let n = rn.code() >> 3;
            self.emit16(0x4500 | n << 7 | rm.code() << 3 | (rn.code() & 7));
        }
    }

    pub fn cmp_w_imm(&mut self, rn: Register, imm: u32) {
        self.dp_imm(DataOp::Sub, true, PC, rn, imm);
    }

    pub fn cmn_w_imm(&mut self, rn: Register, imm: u32) {
        self.dp_imm(DataOp::Add, true, PC, rn, imm);
    }

    pub fn tst_w_imm(&mut self, rn: Register, imm: u32) {
        self.dp_imm(DataOp::And, true, PC, rn, imm);
    }

    pub fn cmp_w_reg(&mut self, rn: Register, rm: Register, shift: Shift, amount: u32) {
        self.dp_reg(DataOp::Sub, true, PC, rn, rm, shift, amount);
    }

    pub fn tst_w_reg(&mut self, rn: Register, rm: Register) {
        self.dp_reg(DataOp::And, true, PC, rn, rm, Shift::LSL, 0);
    }

    pub fn teq_w_reg(&mut self, rn: Register, rm: Register) {
        self.dp_reg(DataOp::Eor, true, PC, rn, rm, Shift::LSL, 0);
    }

    /// 16-bit LSLS/LSRS/ASRS by immediate. An amount of 32 is encoded as 0
    /// for the right shifts.
    pub fn shift_imm16(&mut self, shift: Shift, rd: Register, rm: Register, amount: u32) {
        assert!(rd.is_low() && rm.is_low());
        let (op, imm5) = match shift {
            Shift::LSL => {
                assert!(amount < 32);
                (0x0000, amount)
            }
            Shift::LSR => {
                assert!(amount >= 1 && amount <= 32);
                (0x0800, amount & 31)
            }
            Shift::ASR => {
                assert!(amount >= 1 && amount <= 32);
                (0x1000, amount & 31)
            }
            Shift::ROR => panic!("no 16-bit ROR by immediate"),
        };
        self.emit16(op | imm5 << 6 | rm.code() << 3 | rd.code());
    }

    pub fn shift_imm_w(
        &mut self,
        shift: Shift,
        set_flags: bool,
        rd: Register,
        rm: Register,
        amount: u32,
    ) {
        let imm5 = match shift {
            Shift::LSL => {
                assert!(amount < 32);
                amount
            }
            Shift::LSR | Shift::ASR => {
                assert!(amount >= 1 && amount <= 32);
                amount & 31
            }
            Shift::ROR => {
                assert!(amount >= 1 && amount < 32);
                amount
            }
        };
        self.emit32(cls::dp_shifted_reg(
            DataOp::Orr,
            set_flags,
            rd,
            PC,
            rm,
            shift,
            imm5,
        ));
    }

    pub fn shift_reg_w(
        &mut self,
        shift: Shift,
        set_flags: bool,
        rd: Register,
        rn: Register,
        rm: Register,
    ) {
        assert!(!is_sp_or_pc(rd) && !is_sp_or_pc(rn) && !is_sp_or_pc(rm));
        let s = set_flags as u32;
        self.emit32(
            (0xFA00 | shift.u32() << 5 | s << 4 | rn.code()) << 16
                | 0xF000
                | rd.code() << 8
                | rm.code(),
        );
    }

    pub fn mul(&mut self, rd: Register, rn: Register, rm: Register) {
        self.emit32((0xFB00 | rn.code()) << 16 | 0xF000 | rd.code() << 8 | rm.code());
    }

    pub fn mla(&mut self, rd: Register, rn: Register, rm: Register, ra: Register) {
        assert!(ra != PC);
        self.emit32((0xFB00 | rn.code()) << 16 | ra.code() << 12 | rd.code() << 8 | rm.code());
    }

    pub fn mls(&mut self, rd: Register, rn: Register, rm: Register, ra: Register) {
        self.emit32(
            (0xFB00 | rn.code()) << 16 | ra.code() << 12 | rd.code() << 8 | 0x10 | rm.code(),
        );
    }

    pub fn umull(&mut self, rd_lo: Register, rd_hi: Register, rn: Register, rm: Register) {
        assert!(rd_lo != rd_hi);
        self.emit32(
            (0xFBA0 | rn.code()) << 16 | rd_lo.code() << 12 | rd_hi.code() << 8 | rm.code(),
        );
    }

    pub fn smull(&mut self, rd_lo: Register, rd_hi: Register, rn: Register, rm: Register) {
        assert!(rd_lo != rd_hi);
        self.emit32(
            (0xFB80 | rn.code()) << 16 | rd_lo.code() << 12 | rd_hi.code() << 8 | rm.code(),
        );
    }

    pub fn sdiv(&mut self, rd: Register, rn: Register, rm: Register) {
        self.emit32((0xFB90 | rn.code()) << 16 | 0xF0F0 | rd.code() << 8 | rm.code());
    }

    pub fn udiv(&mut self, rd: Register, rn: Register, rm: Register) {
        self.emit32((0xFBB0 | rn.code()) << 16 | 0xF0F0 | rd.code() << 8 | rm.code());
    }

    pub fn sxtb(&mut self, rd: Register, rm: Register) {
        self.extend(0xB240, 0xFA4F, rd, rm);
    }

    pub fn sxth(&mut self, rd: Register, rm: Register) {
        self.extend(0xB200, 0xFA0F, rd, rm);
    }

    pub fn uxtb(&mut self, rd: Register, rm: Register) {
        self.extend(0xB2C0, 0xFA5F, rd, rm);
    }

    pub fn uxth(&mut self, rd: Register, rm: Register) {
        self.extend(0xB280, 0xFA1F, rd, rm);
    }

    fn extend(&mut self, narrow: u32, wide: u32, rd: Register, rm: Register) {
        if rd.is_low() && rm.is_low() {
            self.emit16(narrow | rm.code() << 3 | rd.code());
        } else {
            self.emit32(wide << 16 | 0xF080 | rd.code() << 8 | rm.code());
        }
    }

    pub fn clz(&mut self, rd: Register, rm: Register) {
        self.emit32((0xFAB0 | rm.code()) << 16 | 0xF080 | rd.code() << 8 | rm.code());
    }

    pub fn rbit(&mut self, rd: Register, rm: Register) {
        self.emit32((0xFA90 | rm.code()) << 16 | 0xF0A0 | rd.code() << 8 | rm.code());
    }

    pub fn rev(&mut self, rd: Register, rm: Register) {
        if rd.is_low() && rm.is_low() {
            self.emit16(0xBA00 | rm.code() << 3 | rd.code());
        } else {
            self.emit32((0xFA90 | rm.code()) << 16 | 0xF080 | rd.code() << 8 | rm.code());
        }
    }
}

// Loads and stores.
impl AssemblerThumb2 {
    /// Picks the narrowest encoding of an immediate-offset load.
    pub fn ldr_imm(&mut self, kind: LoadKind, rt: Register, rn: Register, offset: i32) {
        if self.can_use_ldr16(kind, rt, rn, offset) {
            self.ldr16_imm(kind, rt, rn, offset as u32);
        } else if offset >= 0 {
            self.ldr_w_imm12(kind, rt, rn, offset as u32);
        } else {
            self.ldr_w_imm8_neg(kind, rt, rn, (-offset) as u32);
        }
    }

    pub fn str_imm(&mut self, kind: StoreKind, rt: Register, rn: Register, offset: i32) {
        if self.can_use_str16(kind, rt, rn, offset) {
            self.str16_imm(kind, rt, rn, offset as u32);
        } else if offset >= 0 {
            self.str_w_imm12(kind, rt, rn, offset as u32);
        } else {
            self.str_w_imm8_neg(kind, rt, rn, (-offset) as u32);
        }
    }

    pub fn can_use_ldr16(&self, kind: LoadKind, rt: Register, rn: Register, offset: i32) -> bool {
        if offset < 0 || !rt.is_low() {
            return false;
        }
        let offset = offset as u32;
        match kind {
            LoadKind::Word if rn == SP => offset % 4 == 0 && offset / 4 < 256,
            LoadKind::Word => rn.is_low() && offset % 4 == 0 && offset / 4 < 32,
            LoadKind::UnsignedByte => rn.is_low() && offset < 32,
            LoadKind::UnsignedHalf => rn.is_low() && offset % 2 == 0 && offset / 2 < 32,
            LoadKind::SignedByte | LoadKind::SignedHalf => false,
        }
    }

    fn can_use_str16(&self, kind: StoreKind, rt: Register, rn: Register, offset: i32) -> bool {
        if offset < 0 || !rt.is_low() {
            return false;
        }
        let offset = offset as u32;
        match kind {
            StoreKind::Word if rn == SP => offset % 4 == 0 && offset / 4 < 256,
            StoreKind::Word => rn.is_low() && offset % 4 == 0 && offset / 4 < 32,
            StoreKind::Byte => rn.is_low() && offset < 32,
            StoreKind::Half => rn.is_low() && offset % 2 == 0 && offset / 2 < 32,
        }
    }

    pub fn ldr16_imm(&mut self, kind: LoadKind, rt: Register, rn: Register, offset: u32) {
        assert!(self.can_use_ldr16(kind, rt, rn, offset as i32));
        let insn = match kind {
            LoadKind::Word if rn == SP => 0x9800 | rt.code() << 8 | offset / 4,
            LoadKind::Word => 0x6800 | (offset / 4) << 6 | rn.code() << 3 | rt.code(),
            LoadKind::UnsignedByte => 0x7800 | offset << 6 | rn.code() << 3 | rt.code(),
            LoadKind::UnsignedHalf => 0x8800 | (offset / 2) << 6 | rn.code() << 3 | rt.code(),
            LoadKind::SignedByte | LoadKind::SignedHalf => unreachable!(),
        };
        self.emit16(insn);
    }

    pub fn str16_imm(&mut self, kind: StoreKind, rt: Register, rn: Register, offset: u32) {
        assert!(self.can_use_str16(kind, rt, rn, offset as i32));
        let insn = match kind {
            StoreKind::Word if rn == SP => 0x9000 | rt.code() << 8 | offset / 4,
            StoreKind::Word => 0x6000 | (offset / 4) << 6 | rn.code() << 3 | rt.code(),
            StoreKind::Byte => 0x7000 | offset << 6 | rn.code() << 3 | rt.code(),
            StoreKind::Half => 0x8000 | (offset / 2) << 6 | rn.code() << 3 | rt.code(),
        };
        self.emit16(insn);
    }

    pub fn ldr_w_imm12(&mut self, kind: LoadKind, rt: Register, rn: Register, offset: u32) {
        assert!(fits_u12(offset) && rn != PC);
        self.emit32((kind.t32_imm12() | rn.code()) << 16 | rt.code() << 12 | offset);
    }

    pub fn str_w_imm12(&mut self, kind: StoreKind, rt: Register, rn: Register, offset: u32) {
        assert!(fits_u12(offset) && rn != PC);
        self.emit32((kind.t32_imm12() | rn.code()) << 16 | rt.code() << 12 | offset);
    }

    pub fn ldr_w_imm8_neg(&mut self, kind: LoadKind, rt: Register, rn: Register, offset: u32) {
        assert!(fits_u8(offset));
        let hw1 = kind.t32_imm12() - 0x80 | rn.code();
        self.emit32(hw1 << 16 | rt.code() << 12 | 0xC00 | offset);
    }

    pub fn str_w_imm8_neg(&mut self, kind: StoreKind, rt: Register, rn: Register, offset: u32) {
        assert!(fits_u8(offset));
        let hw1 = kind.t32_imm12() - 0x80 | rn.code();
        self.emit32(hw1 << 16 | rt.code() << 12 | 0xC00 | offset);
    }

    /// Load with a register offset shifted left by `shift` (0..=3).
    pub fn ldr_reg(&mut self, kind: LoadKind, rt: Register, rn: Register, rm: Register, shift: u32) {
        assert!(shift < 4);
        if shift == 0 && rt.is_low() && rn.is_low() && rm.is_low() {
            self.emit16(kind.t16_reg() | rm.code() << 6 | rn.code() << 3 | rt.code());
        } else {
            let hw1 = kind.t32_imm12() - 0x80 | rn.code();
            self.emit32(hw1 << 16 | rt.code() << 12 | shift << 4 | rm.code());
        }
    }

    pub fn str_reg(&mut self, kind: StoreKind, rt: Register, rn: Register, rm: Register, shift: u32) {
        assert!(shift < 4);
        if shift == 0 && rt.is_low() && rn.is_low() && rm.is_low() {
            self.emit16(kind.t16_reg() | rm.code() << 6 | rn.code() << 3 | rt.code());
        } else {
            let hw1 = kind.t32_imm12() - 0x80 | rn.code();
            self.emit32(hw1 << 16 | rt.code() << 12 | shift << 4 | rm.code());
        }
    }

    pub fn ldrd(&mut self, rt: Register, rt2: Register, rn: Register, offset: i32) {
        self.emit32(cls::load_store_dual(true, rt, rt2, rn, offset));
    }

    pub fn strd(&mut self, rt: Register, rt2: Register, rn: Register, offset: i32) {
        self.emit32(cls::load_store_dual(false, rt, rt2, rn, offset));
    }

    pub fn ldrex(&mut self, rt: Register, rn: Register) {
        self.emit32((0xE850 | rn.code()) << 16 | rt.code() << 12 | 0xF00);
    }

    pub fn strex(&mut self, rd: Register, rt: Register, rn: Register) {
        assert!(rd != rt && rd != rn);
        self.emit32((0xE840 | rn.code()) << 16 | rt.code() << 12 | rd.code() << 8);
    }

    pub fn ldrexd(&mut self, rt: Register, rt2: Register, rn: Register) {
        assert!(rt != rt2);
        self.emit32((0xE8D0 | rn.code()) << 16 | rt.code() << 12 | rt2.code() << 8 | 0x7F);
    }

    pub fn strexd(&mut self, rd: Register, rt: Register, rt2: Register, rn: Register) {
        assert!(rd != rt && rd != rt2 && rd != rn);
        self.emit32(
            (0xE8C0 | rn.code()) << 16 | rt.code() << 12 | rt2.code() << 8 | 0x70 | rd.code(),
        );
    }

    pub fn dmb(&mut self, option: BarrierOption) {
        self.emit32(0xF3BF_8F50 | option.u32());
    }

    /// PUSH of the registers in `mask`, narrowest encoding.
    pub fn push(&mut self, mask: u32) {
        assert!(mask != 0 && mask & (SP.mask() | PC.mask()) == 0);
        if mask & !(0xFF | LR.mask()) == 0 {
            let m = (mask >> 14) & 1;
            self.emit16(0xB400 | m << 8 | (mask & 0xFF));
        } else if mask.count_ones() == 1 {
            let rt = mask.trailing_zeros();
            self.emit32(0xF84D_0D04 | rt << 12);
        } else {
            self.emit32(0xE92D_0000 | mask);
        }
    }

    /// POP of the registers in `mask`, narrowest encoding.
    pub fn pop(&mut self, mask: u32) {
        assert!(mask != 0 && mask & SP.mask() == 0);
        assert!(mask & (LR.mask() | PC.mask()) != (LR.mask() | PC.mask()));
        if mask & !(0xFF | PC.mask()) == 0 {
            let p = (mask >> 15) & 1;
            self.emit16(0xBC00 | p << 8 | (mask & 0xFF));
        } else if mask.count_ones() == 1 {
            let rt = mask.trailing_zeros();
            self.emit32(0xF85D_0B04 | rt << 12);
        } else {
            self.emit32(0xE8BD_0000 | mask);
        }
    }
}

// VFP.
impl AssemblerThumb2 {
    pub fn vadd_s(&mut self, sd: SRegister, sn: SRegister, sm: SRegister) {
        self.emit32(cls::vfp_3op_s(0xEE30, 0, sd, sn, sm));
    }

    pub fn vsub_s(&mut self, sd: SRegister, sn: SRegister, sm: SRegister) {
        self.emit32(cls::vfp_3op_s(0xEE30, 0x40, sd, sn, sm));
    }

    pub fn vmul_s(&mut self, sd: SRegister, sn: SRegister, sm: SRegister) {
        self.emit32(cls::vfp_3op_s(0xEE20, 0, sd, sn, sm));
    }

    pub fn vdiv_s(&mut self, sd: SRegister, sn: SRegister, sm: SRegister) {
        self.emit32(cls::vfp_3op_s(0xEE80, 0, sd, sn, sm));
    }

    pub fn vadd_d(&mut self, dd: DRegister, dn: DRegister, dm: DRegister) {
        self.emit32(cls::vfp_3op_d(0xEE30, 0, dd, dn, dm));
    }

    pub fn vsub_d(&mut self, dd: DRegister, dn: DRegister, dm: DRegister) {
        self.emit32(cls::vfp_3op_d(0xEE30, 0x40, dd, dn, dm));
    }

    pub fn vmul_d(&mut self, dd: DRegister, dn: DRegister, dm: DRegister) {
        self.emit32(cls::vfp_3op_d(0xEE20, 0, dd, dn, dm));
    }

    pub fn vdiv_d(&mut self, dd: DRegister, dn: DRegister, dm: DRegister) {
        self.emit32(cls::vfp_3op_d(0xEE80, 0, dd, dn, dm));
    }

    pub fn vmov_s(&mut self, sd: SRegister, sm: SRegister) {
        self.emit32(cls::vfp_2op(0xEEB0, 0xA40, sd.vd(), sd.d(), sm.vd(), sm.d(), false));
    }

    pub fn vmov_d(&mut self, dd: DRegister, dm: DRegister) {
        self.emit32(cls::vfp_2op(0xEEB0, 0xA40, dd.vd(), dd.d(), dm.vd(), dm.d(), true));
    }

    pub fn vneg_s(&mut self, sd: SRegister, sm: SRegister) {
        self.emit32(cls::vfp_2op(0xEEB1, 0xA40, sd.vd(), sd.d(), sm.vd(), sm.d(), false));
    }

    pub fn vneg_d(&mut self, dd: DRegister, dm: DRegister) {
        self.emit32(cls::vfp_2op(0xEEB1, 0xA40, dd.vd(), dd.d(), dm.vd(), dm.d(), true));
    }

    pub fn vabs_s(&mut self, sd: SRegister, sm: SRegister) {
        self.emit32(cls::vfp_2op(0xEEB0, 0xAC0, sd.vd(), sd.d(), sm.vd(), sm.d(), false));
    }

    pub fn vabs_d(&mut self, dd: DRegister, dm: DRegister) {
        self.emit32(cls::vfp_2op(0xEEB0, 0xAC0, dd.vd(), dd.d(), dm.vd(), dm.d(), true));
    }

    pub fn vsqrt_s(&mut self, sd: SRegister, sm: SRegister) {
        self.emit32(cls::vfp_2op(0xEEB1, 0xAC0, sd.vd(), sd.d(), sm.vd(), sm.d(), false));
    }

    pub fn vsqrt_d(&mut self, dd: DRegister, dm: DRegister) {
        self.emit32(cls::vfp_2op(0xEEB1, 0xAC0, dd.vd(), dd.d(), dm.vd(), dm.d(), true));
    }

    pub fn vcmp_s(&mut self, sd: SRegister, sm: SRegister) {
        self.emit32(cls::vfp_2op(0xEEB4, 0xA40, sd.vd(), sd.d(), sm.vd(), sm.d(), false));
    }

    pub fn vcmp_d(&mut self, dd: DRegister, dm: DRegister) {
        self.emit32(cls::vfp_2op(0xEEB4, 0xA40, dd.vd(), dd.d(), dm.vd(), dm.d(), true));
    }

    pub fn vcmp_s_zero(&mut self, sd: SRegister) {
        self.emit32(cls::vfp_2op(0xEEB5, 0xA40, sd.vd(), sd.d(), 0, 0, false));
    }

    pub fn vcmp_d_zero(&mut self, dd: DRegister) {
        self.emit32(cls::vfp_2op(0xEEB5, 0xA40, dd.vd(), dd.d(), 0, 0, true));
    }

    /// VMRS APSR_nzcv, FPSCR
    pub fn vmrs_apsr(&mut self) {
        self.emit32(0xEEF1_FA10);
    }

    pub fn vcvt_f32_s32(&mut self, sd: SRegister, sm: SRegister) {
        self.emit32(cls::vfp_2op(0xEEB8, 0xAC0, sd.vd(), sd.d(), sm.vd(), sm.d(), false));
    }

    pub fn vcvt_f64_s32(&mut self, dd: DRegister, sm: SRegister) {
        self.emit32(cls::vfp_2op(0xEEB8, 0xAC0, dd.vd(), dd.d(), sm.vd(), sm.d(), true));
    }

    /// Round-towards-zero conversion.
    pub fn vcvt_s32_f32(&mut self, sd: SRegister, sm: SRegister) {
        self.emit32(cls::vfp_2op(0xEEBD, 0xAC0, sd.vd(), sd.d(), sm.vd(), sm.d(), false));
    }

    pub fn vcvt_s32_f64(&mut self, sd: SRegister, dm: DRegister) {
        self.emit32(cls::vfp_2op(0xEEBD, 0xAC0, sd.vd(), sd.d(), dm.vd(), dm.d(), true));
    }

    pub fn vcvt_f64_f32(&mut self, dd: DRegister, sm: SRegister) {
        self.emit32(cls::vfp_2op(0xEEB7, 0xAC0, dd.vd(), dd.d(), sm.vd(), sm.d(), false));
    }

    pub fn vcvt_f32_f64(&mut self, sd: SRegister, dm: DRegister) {
        self.emit32(cls::vfp_2op(0xEEB7, 0xAC0, sd.vd(), sd.d(), dm.vd(), dm.d(), true));
    }

    pub fn vmov_s_imm(&mut self, sd: SRegister, imm8: u32) {
        assert!(fits_u8(imm8));
        self.emit32(
            (0xEEB0 | sd.d() << 6 | imm8 >> 4) << 16 | sd.vd() << 12 | 0xA00 | (imm8 & 0xF),
        );
    }

    pub fn vmov_d_imm(&mut self, dd: DRegister, imm8: u32) {
        assert!(fits_u8(imm8));
        self.emit32(
            (0xEEB0 | dd.d() << 6 | imm8 >> 4) << 16 | dd.vd() << 12 | 0xB00 | (imm8 & 0xF),
        );
    }

    /// VMOV Sn, Rt
    pub fn vmov_sr(&mut self, sn: SRegister, rt: Register) {
        self.emit32((0xEE00 | sn.vd()) << 16 | rt.code() << 12 | 0xA10 | sn.d() << 7);
    }

    /// VMOV Rt, Sn
    pub fn vmov_rs(&mut self, rt: Register, sn: SRegister) {
        self.emit32((0xEE10 | sn.vd()) << 16 | rt.code() << 12 | 0xA10 | sn.d() << 7);
    }

    /// VMOV Dm, Rt, Rt2
    pub fn vmov_drr(&mut self, dm: DRegister, rt: Register, rt2: Register) {
        self.emit32((0xEC40 | rt2.code()) << 16 | rt.code() << 12 | 0xB10 | dm.d() << 5 | dm.vd());
    }

    /// VMOV Rt, Rt2, Dm
    pub fn vmov_rrd(&mut self, rt: Register, rt2: Register, dm: DRegister) {
        assert!(rt != rt2);
        self.emit32((0xEC50 | rt2.code()) << 16 | rt.code() << 12 | 0xB10 | dm.d() << 5 | dm.vd());
    }

    pub fn vldr_s(&mut self, sd: SRegister, rn: Register, offset: i32) {
        self.emit32(cls::vfp_load_store(true, false, sd.vd(), sd.d(), rn, offset));
    }

    pub fn vstr_s(&mut self, sd: SRegister, rn: Register, offset: i32) {
        self.emit32(cls::vfp_load_store(false, false, sd.vd(), sd.d(), rn, offset));
    }

    pub fn vldr_d(&mut self, dd: DRegister, rn: Register, offset: i32) {
        self.emit32(cls::vfp_load_store(true, true, dd.vd(), dd.d(), rn, offset));
    }

    pub fn vstr_d(&mut self, dd: DRegister, rn: Register, offset: i32) {
        self.emit32(cls::vfp_load_store(false, true, dd.vd(), dd.d(), rn, offset));
    }

    /// VPUSH of `count` consecutive single registers starting at `first`.
    pub fn vpush_s(&mut self, first: SRegister, count: u32) {
        assert!(count > 0 && first.code() + count <= 32);
        self.emit32((0xED2D | first.d() << 6) << 16 | first.vd() << 12 | 0xA00 | count);
    }

    pub fn vpop_s(&mut self, first: SRegister, count: u32) {
        assert!(count > 0 && first.code() + count <= 32);
        self.emit32((0xECBD | first.d() << 6) << 16 | first.vd() << 12 | 0xA00 | count);
    }
}

// Literal pool and jump tables.
impl AssemblerThumb2 {
    pub fn new_literal_u32(&mut self, value: u32) -> Literal {
        self.new_literal(LiteralValue::Word(value))
    }

    pub fn new_literal_u64(&mut self, value: u64) -> Literal {
        self.new_literal(LiteralValue::DoubleWord(value))
    }

    /// A literal that is never shared with another use of the same value;
    /// its slot gets patched after the code is installed.
    pub fn new_unique_literal_u32(&mut self, value: u32) -> Literal {
        let label = self.create_label();
        self.literals.push(LiteralData {
            value: LiteralValue::Word(value),
            label,
            placed: false,
            unique: true,
        });
        Literal(self.literals.len() - 1)
    }

    /// Code offset of a literal once its pool has been placed.
    pub fn literal_offset(&self, lit: Literal) -> Option<u32> {
        self.offset(self.literals[lit.0].label)
    }

    fn new_literal(&mut self, value: LiteralValue) -> Literal {
        for &lit in &self.pending_literals {
            if self.literals[lit.0].unique {
                continue;
            }
            if self.literals[lit.0].value == value {
                return lit;
            }
        }
        let label = self.create_label();
        self.literals.push(LiteralData {
            value,
            label,
            placed: false,
            unique: false,
        });
        Literal(self.literals.len() - 1)
    }

    pub fn ldr_literal(&mut self, rt: Register, lit: Literal) {
        self.use_literal(lit, LiteralUse::Ldr);
        let label = self.literals[lit.0].label;
        if let Some(target) = self.offset(label) {
            let distance = target as i32 - self.aligned_pc_value();
            self.emit32(inst::ldr_literal(rt, distance));
        } else {
            self.emit_jump_placeholder32(label, JumpKind::LoadLiteral(rt));
        }
    }

    pub fn vldr_literal_s(&mut self, sd: SRegister, lit: Literal) {
        self.use_literal(lit, LiteralUse::Vldr);
        let label = self.literals[lit.0].label;
        if let Some(target) = self.offset(label) {
            let distance = target as i32 - self.aligned_pc_value();
            self.emit32(cls::vfp_load_store(true, false, sd.vd(), sd.d(), PC, distance));
        } else {
            self.emit_jump_placeholder32(label, JumpKind::LoadLiteralS(sd));
        }
    }

    pub fn vldr_literal_d(&mut self, dd: DRegister, lit: Literal) {
        self.use_literal(lit, LiteralUse::Vldr);
        let label = self.literals[lit.0].label;
        if let Some(target) = self.offset(label) {
            let distance = target as i32 - self.aligned_pc_value();
            self.emit32(cls::vfp_load_store(true, true, dd.vd(), dd.d(), PC, distance));
        } else {
            self.emit_jump_placeholder32(label, JumpKind::LoadLiteralD(dd));
        }
    }

    fn use_literal(&mut self, lit: Literal, kind: LiteralUse) {
        if self.literals[lit.0].placed {
            return;
        }
        if !self.pending_literals.contains(&lit) {
            self.pending_literals.push(lit);
        }
        let pos = self.position();
        match self.first_literal_use {
            None => self.first_literal_use = Some((pos, kind)),
            Some((first, first_kind)) => {
                if kind.range() < first_kind.range() {
                    // Keep the tightest constraint, measured from its own use.
                    let remaining_first = first + first_kind.range();
                    let remaining_new = pos + kind.range();
                    if remaining_new < remaining_first {
                        self.first_literal_use = Some((pos, kind));
                    }
                }
            }
        }
    }

    pub fn literal_pool_size(&self) -> usize {
        self.pending_literals
            .iter()
            .map(|lit| match self.literals[lit.0].value {
                LiteralValue::Word(_) => 4,
                LiteralValue::DoubleWord(_) => 8,
            })
            .sum()
    }

    pub fn block_literal_pool(&mut self) {
        self.literal_pool_blocked += 1;
    }

    pub fn release_literal_pool(&mut self) {
        assert!(self.literal_pool_blocked > 0);
        self.literal_pool_blocked -= 1;
    }

    pub fn is_literal_pool_blocked(&self) -> bool {
        self.literal_pool_blocked > 0
    }

    /// Whether the pending pool has to be dumped before `margin` more bytes
    /// of code can be emitted.
    pub fn literal_pool_needed(&self, margin: usize) -> bool {
        match self.first_literal_use {
            None => false,
            Some((first, kind)) => {
                // Branch over the pool plus alignment padding.
                let overhead = 4 + 2;
                let end = self.position() + margin + overhead + self.literal_pool_size();
                end - first + 4 > kind.range()
            }
        }
    }

    /// Dumps pending literals mid-stream behind a branch.
    pub fn emit_literal_pool(&mut self) {
        assert!(self.literal_pool_blocked == 0, "literal pool emission blocked");
        assert!(self.it_remaining == 0);
        if self.pending_literals.is_empty() {
            return;
        }
        let after_pool = self.create_label();
        self.b(after_pool);
        self.place_literals();
        self.bind_label(after_pool);
    }

    /// Places pending literals at the current position without a branch
    /// around them; only valid after the last instruction.
    pub fn emit_literal_pool_at_end(&mut self) {
        if !self.pending_literals.is_empty() {
            self.place_literals();
        }
    }

    fn place_literals(&mut self) {
        self.align(4);
        let pending = std::mem::replace(&mut self.pending_literals, Vec::new());
        // Double words first keeps them 8-byte aligned whenever the pool is.
        let (wide, narrow): (Vec<Literal>, Vec<Literal>) = pending
            .into_iter()
            .partition(|lit| matches!(self.literals[lit.0].value, LiteralValue::DoubleWord(_)));
        for lit in wide.into_iter().chain(narrow) {
            let label = self.literals[lit.0].label;
            self.buffer.bind_label(label);
            match self.literals[lit.0].value {
                LiteralValue::Word(value) => self.buffer.emit_u32(value),
                LiteralValue::DoubleWord(value) => self.buffer.emit_u64(value),
            }
            self.literals[lit.0].placed = true;
        }
        self.first_literal_use = None;
    }

    /// Emits a 32-bit jump table entry holding `target - base + 1`.
    pub fn emit_jump_table_entry(&mut self, base: Label, target: Label) {
        let pc = self.position() as u32;
        self.unresolved_jumps
            .push((pc, target, JumpKind::TableEntry(base)));
        self.buffer.emit_u32(0);
    }
}

mod inst {
    use super::*;

    pub(super) fn b16(distance: i32) -> u32 {
        assert!(fits_branch16(distance), "branch out of range");
        0xE000 | ((distance >> 1) as u32 & 0x7FF)
    }

    pub(super) fn bcond16(cond: Cond, distance: i32) -> u32 {
        assert!(cond != Cond::AL);
        assert!(fits_bcond16(distance), "branch out of range");
        0xD000 | cond.u32() << 8 | ((distance >> 1) as u32 & 0xFF)
    }

    pub(super) fn b32(distance: i32) -> u32 {
        cls::branch_t4(0x9000, distance)
    }

    pub(super) fn bl(distance: i32) -> u32 {
        cls::branch_t4(0xD000, distance)
    }

    pub(super) fn bcond32(cond: Cond, distance: i32) -> u32 {
        assert!(cond != Cond::AL);
        assert!(distance % 2 == 0);
        assert!(fits_i21(distance), "branch out of range");
        let imm = distance as u32;
        let s = (imm >> 20) & 1;
        let j2 = (imm >> 19) & 1;
        let j1 = (imm >> 18) & 1;
        let imm6 = (imm >> 12) & 0x3F;
        let imm11 = (imm >> 1) & 0x7FF;
        (0xF000 | s << 10 | cond.u32() << 6 | imm6) << 16 | 0x8000 | j1 << 13 | j2 << 11 | imm11
    }

    pub(super) fn cbz(nonzero: bool, rn: Register, distance: i32) -> u32 {
        assert!(rn.is_low());
        assert!(distance >= 0 && distance <= 126 && distance % 2 == 0, "cbz out of range");
        let imm = (distance as u32) >> 1;
        let op = if nonzero { 0xB900 } else { 0xB100 };
        op | ((imm >> 5) & 1) << 9 | (imm & 0x1F) << 3 | rn.code()
    }

    pub(super) fn adr32(rd: Register, distance: i32) -> u32 {
        let (hw1, imm) = if distance >= 0 {
            (0xF20F, distance as u32)
        } else {
            (0xF2AF, (-distance) as u32)
        };
        assert!(fits_u12(imm), "adr out of range");
        let i = imm >> 11;
        let imm3 = (imm >> 8) & 7;
        (hw1 | i << 10) << 16 | imm3 << 12 | rd.code() << 8 | (imm & 0xFF)
    }

    pub(super) fn ldr_literal(rt: Register, distance: i32) -> u32 {
        let (hw1, imm) = if distance >= 0 {
            (0xF8DF, distance as u32)
        } else {
            (0xF85F, (-distance) as u32)
        };
        assert!(fits_u12(imm), "literal out of range");
        hw1 << 16 | rt.code() << 12 | imm
    }
}

mod cls {
    use super::*;

    pub(super) fn branch_t4(hw2_base: u32, distance: i32) -> u32 {
        assert!(distance % 2 == 0);
        assert!(fits_i25(distance), "branch out of range");
        let imm = distance as u32;
        let s = (imm >> 24) & 1;
        let i1 = (imm >> 23) & 1;
        let i2 = (imm >> 22) & 1;
        let imm10 = (imm >> 12) & 0x3FF;
        let imm11 = (imm >> 1) & 0x7FF;
        let j1 = (i1 ^ 1) ^ s;
        let j2 = (i2 ^ 1) ^ s;
        (0xF000 | s << 10 | imm10) << 16 | hw2_base | j1 << 13 | j2 << 11 | imm11
    }

    pub(super) fn dp_modified_imm(
        op: DataOp,
        s: bool,
        rd: Register,
        rn: Register,
        imm12: u32,
    ) -> u32 {
        assert!(fits_u12(imm12));
        let i = imm12 >> 11;
        let imm3 = (imm12 >> 8) & 7;
        let imm8 = imm12 & 0xFF;
        (0xF000 | i << 10 | op.u32() << 5 | (s as u32) << 4 | rn.code()) << 16
            | imm3 << 12
            | rd.code() << 8
            | imm8
    }

    pub(super) fn dp_shifted_reg(
        op: DataOp,
        s: bool,
        rd: Register,
        rn: Register,
        rm: Register,
        shift: Shift,
        amount: u32,
    ) -> u32 {
        assert!(amount < 32);
        assert!(rm != PC);
        let imm3 = amount >> 2;
        let imm2 = amount & 3;
        (0xEA00 | op.u32() << 5 | (s as u32) << 4 | rn.code()) << 16
            | imm3 << 12
            | rd.code() << 8
            | imm2 << 6
            | shift.u32() << 4
            | rm.code()
    }

    pub(super) fn plain_imm12(hw1: u32, rd: Register, rn: Register, imm12: u32) -> u32 {
        assert!(fits_u12(imm12));
        let i = imm12 >> 11;
        let imm3 = (imm12 >> 8) & 7;
        (hw1 | i << 10 | rn.code()) << 16 | imm3 << 12 | rd.code() << 8 | (imm12 & 0xFF)
    }

    pub(super) fn mov_wide(hw1: u32, rd: Register, imm16: u32) -> u32 {
        assert!(imm16 <= 0xFFFF);
        assert!(!is_sp_or_pc(rd));
        let imm4 = imm16 >> 12;
        let i = (imm16 >> 11) & 1;
        let imm3 = (imm16 >> 8) & 7;
        (hw1 | i << 10 | imm4) << 16 | imm3 << 12 | rd.code() << 8 | (imm16 & 0xFF)
    }

    pub(super) fn load_store_dual(
        load: bool,
        rt: Register,
        rt2: Register,
        rn: Register,
        offset: i32,
    ) -> u32 {
        assert!(rt != rt2 || !load);
        assert!(offset % 4 == 0 && offset.abs() / 4 < 256, "ldrd/strd offset out of range");
        let u = (offset >= 0) as u32;
        let imm8 = (offset.abs() / 4) as u32;
        let l = load as u32;
        (0xE940 | u << 7 | l << 4 | rn.code()) << 16 | rt.code() << 12 | rt2.code() << 8 | imm8
    }

    pub(super) fn vfp_3op_s(hw1: u32, op: u32, sd: SRegister, sn: SRegister, sm: SRegister) -> u32 {
        (hw1 | sd.d() << 6 | sn.vd()) << 16
            | sd.vd() << 12
            | 0xA00
            | sn.d() << 7
            | op
            | sm.d() << 5
            | sm.vd()
    }

    pub(super) fn vfp_3op_d(hw1: u32, op: u32, dd: DRegister, dn: DRegister, dm: DRegister) -> u32 {
        (hw1 | dd.d() << 6 | dn.vd()) << 16
            | dd.vd() << 12
            | 0xB00
            | dn.d() << 7
            | op
            | dm.d() << 5
            | dm.vd()
    }

    pub(super) fn vfp_2op(
        hw1: u32,
        hw2: u32,
        vd: u32,
        d: u32,
        vm: u32,
        m: u32,
        double: bool,
    ) -> u32 {
        (hw1 | d << 6) << 16 | vd << 12 | hw2 | (double as u32) << 8 | m << 5 | vm
    }

    pub(super) fn vfp_load_store(
        load: bool,
        double: bool,
        vd: u32,
        d: u32,
        rn: Register,
        offset: i32,
    ) -> u32 {
        assert!(offset % 4 == 0 && offset.abs() / 4 < 256, "vldr/vstr offset out of range");
        let u = (offset >= 0) as u32;
        let imm8 = (offset.abs() / 4) as u32;
        let l = load as u32;
        (0xED00 | u << 7 | d << 6 | l << 4 | rn.code()) << 16
            | vd << 12
            | 0xA00
            | (double as u32) << 8
            | imm8
    }
}

/// Encodes `value` as a T32 modified immediate, returning the 12-bit
/// `i:imm3:imm8` field.
pub fn encode_modified_immediate(value: u32) -> Option<u32> {
    if value <= 0xFF {
        return Some(value);
    }

    let b0 = value & 0xFF;
    let b1 = (value >> 8) & 0xFF;

    if value == (b0 << 16 | b0) {
        return Some(0x100 | b0);
    }

    if value == (b1 << 24 | b1 << 8) {
        return Some(0x200 | b1);
    }

    if value == (b0 << 24 | b0 << 16 | b0 << 8 | b0) {
        return Some(0x300 | b0);
    }

    for rot in 8..32 {
        let unrotated = value.rotate_left(rot);
        if unrotated <= 0xFF && unrotated & 0x80 != 0 {
            return Some(rot << 7 | (unrotated & 0x7F));
        }
    }

    None
}

pub fn is_modified_immediate(value: u32) -> bool {
    encode_modified_immediate(value).is_some()
}

/// VFPv3 8-bit immediate for a single-precision constant.
pub fn encode_vfp_imm_f32(value: f32) -> Option<u32> {
    let bits = value.to_bits();
    if bits & 0x7FFFF != 0 {
        return None;
    }
    let b = (bits >> 29) & 1;
    let exp_rest = (bits >> 25) & 0x1F;
    let not_b = (bits >> 30) & 1;
    if not_b == b || exp_rest != if b == 1 { 0x1F } else { 0 } {
        return None;
    }
    let a = bits >> 31;
    Some(a << 7 | b << 6 | ((bits >> 19) & 0x3F))
}

/// VFPv3 8-bit immediate for a double-precision constant.
pub fn encode_vfp_imm_f64(value: f64) -> Option<u32> {
    let bits = value.to_bits();
    if bits & 0xFFFF_FFFF_FFFF != 0 {
        return None;
    }
    let b = ((bits >> 61) & 1) as u32;
    let exp_rest = ((bits >> 54) & 0xFF) as u32;
    let not_b = ((bits >> 62) & 1) as u32;
    if not_b == b || exp_rest != if b == 1 { 0xFF } else { 0 } {
        return None;
    }
    let a = (bits >> 63) as u32;
    Some(a << 7 | b << 6 | ((bits >> 48) & 0x3F) as u32)
}

fn is_sp_or_pc(reg: Register) -> bool {
    reg == SP || reg == PC
}

fn fits_u8(imm: u32) -> bool {
    imm < (1 << 8)
}

fn fits_u12(imm: u32) -> bool {
    imm < (1 << 12)
}

fn fits_branch16(distance: i32) -> bool {
    -2048 <= distance && distance <= 2046 && distance % 2 == 0
}

fn fits_bcond16(distance: i32) -> bool {
    -256 <= distance && distance <= 254 && distance % 2 == 0
}

fn fits_i21(imm: i32) -> bool {
    -(1 << 20) <= imm && imm < (1 << 20)
}

fn fits_i25(imm: i32) -> bool {
    -(1 << 24) <= imm && imm < (1 << 24)
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::{LittleEndian, WriteBytesExt};

    macro_rules! assert_emit {
        (
            $($expr:expr),*;
            $name:ident
            (
                    $($param:expr),*
            )
        ) => {{
            let mut buf = AssemblerThumb2::new();
            buf.$name($($param,)*);
            let mut expected: Vec<u8> = Vec::new();
            $(
                expected.write_u16::<LittleEndian>($expr).unwrap();
            )*
            let data = buf.finalize();

            if expected != data {
                print!("exp: ");

                for (ind, val) in expected.iter().enumerate() {
                    if ind > 0 { print!(", "); }

                    print!("{:02x}", val);
                }

                print!("\ngot: ");

                for (ind, val) in data.iter().enumerate() {
                    if ind > 0 { print!(", "); }

                    print!("{:02x}", val);
                }

                println!("");

                panic!("emitted code wrong.");
            }
        }};
    }

    fn halfwords(code: &[u8]) -> Vec<u16> {
        code.chunks(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect()
    }

    #[test]
    fn test_modified_immediate() {
        assert_eq!(encode_modified_immediate(0), Some(0));
        assert_eq!(encode_modified_immediate(0xFF), Some(0xFF));
        assert_eq!(encode_modified_immediate(0x00AB00AB), Some(0x1AB));
        assert_eq!(encode_modified_immediate(0xAB00AB00), Some(0x2AB));
        assert_eq!(encode_modified_immediate(0xABABABAB), Some(0x3AB));
        assert_eq!(encode_modified_immediate(0x100), Some(0xF80));
        assert_eq!(encode_modified_immediate(0x8000_0000), Some(0x400));
        assert_eq!(encode_modified_immediate(0x101), None);
        assert_eq!(encode_modified_immediate(0x1234_5678), None);
    }

    #[test]
    fn test_vfp_immediates() {
        assert_eq!(encode_vfp_imm_f32(1.0), Some(0x70));
        assert_eq!(encode_vfp_imm_f32(2.0), Some(0x00));
        assert_eq!(encode_vfp_imm_f32(-0.5), Some(0xE0));
        assert_eq!(encode_vfp_imm_f32(0.0), None);
        assert_eq!(encode_vfp_imm_f32(0.1), None);
        assert_eq!(encode_vfp_imm_f64(1.0), Some(0x70));
        assert_eq!(encode_vfp_imm_f64(0.5), Some(0x60));
        assert_eq!(encode_vfp_imm_f64(0.0), None);
    }

    #[test]
    fn test_mov() {
        assert_emit!(0x2001; movs_imm8(R0, 1));
        assert_emit!(0x27ff; movs_imm8(R7, 255));
        assert_emit!(0xf04f, 0x0200; mov_w_imm(false, R2, 0));
        assert_emit!(0xf241, 0x2034; movw(R0, 0x1234));
        assert_emit!(0xf2c0, 0x0001; movt(R0, 1));
        assert_emit!(0x4608; mov_reg16(R0, R1));
        assert_emit!(0x46c4; mov_reg16(R12, R8));
        assert_emit!(0xea4f, 0x0001; mov_w_reg(false, R0, R1));
        assert_emit!(0xf06f, 0x0000; mvn_w_imm(false, R0, 0));
    }

    #[test]
    fn test_add_sub() {
        assert_emit!(0x1c20; adds_imm3(R0, R4, 0));
        assert_emit!(0x1e4a; subs_imm3(R2, R1, 1));
        assert_emit!(0x3002; adds_imm8(R0, 2));
        assert_emit!(0x3802; subs_imm8(R0, 2));
        assert_emit!(0x1888; adds_reg16(R0, R1, R2));
        assert_emit!(0x1a88; subs_reg16(R0, R1, R2));
        assert_emit!(0x44e0; add_reg16(R8, R12));
        assert_emit!(0xf501, 0x7080; dp_imm(DataOp::Add, false, R0, R1, 0x100));
        assert_emit!(0xf201, 0x1023; addw(R0, R1, 0x123));
        assert_emit!(0xf2a1, 0x1023; subw(R0, R1, 0x123));
        assert_emit!(0xeb01, 0x0002; dp_reg(DataOp::Add, false, R0, R1, R2, Shift::LSL, 0));
        assert_emit!(0xeb11, 0x0082; dp_reg(DataOp::Add, true, R0, R1, R2, Shift::LSL, 2));
        assert_emit!(0xb082; sub_sp_imm7(8));
        assert_emit!(0xb002; add_sp_imm7(8));
    }

    #[test]
    fn test_compare() {
        assert_emit!(0x2805; cmp_imm8(R0, 5));
        assert_emit!(0x4288; cmp_reg16(R0, R1));
        assert_emit!(0x45c8; cmp_reg16(R8, R9));
        assert_emit!(0xf1b0, 0x3fff; cmp_w_imm(R0, 0xFFFFFFFF));
        assert_emit!(0xebb0, 0x0f01; cmp_w_reg(R0, R1, Shift::LSL, 0));
        assert_emit!(0xea10, 0x0f01; tst_w_reg(R0, R1));
    }

    #[test]
    fn test_shifts() {
        assert_emit!(0xea4f, 0x0380; shift_imm_w(Shift::LSL, false, R3, R0, 2));
        assert_emit!(0x0083; shift_imm16(Shift::LSL, R3, R0, 2));
        assert_emit!(0x0fc8; shift_imm16(Shift::LSR, R0, R1, 31));
        assert_emit!(0x1008; shift_imm16(Shift::ASR, R0, R1, 32));
        assert_emit!(0xfa01, 0xf002; shift_reg_w(Shift::LSL, false, R0, R1, R2));
        assert_emit!(0xfa61, 0xf002; shift_reg_w(Shift::ROR, false, R0, R1, R2));
    }

    #[test]
    fn test_multiply_divide() {
        assert_emit!(0xfb01, 0xf002; mul(R0, R1, R2));
        assert_emit!(0xfb01, 0x3002; mla(R0, R1, R2, R3));
        assert_emit!(0xfb01, 0x3012; mls(R0, R1, R2, R3));
        assert_emit!(0xfba2, 0x0103; umull(R0, R1, R2, R3));
        assert_emit!(0xfb91, 0xf0f2; sdiv(R0, R1, R2));
        assert_emit!(0xfbb1, 0xf0f2; udiv(R0, R1, R2));
    }

    #[test]
    fn test_load_store() {
        assert_emit!(0x6908; ldr_imm(LoadKind::Word, R0, R1, 16));
        assert_emit!(0x9801; ldr_imm(LoadKind::Word, R0, SP, 4));
        assert_emit!(0xf8d1, 0x0100; ldr_imm(LoadKind::Word, R0, R1, 256));
        assert_emit!(0xf851, 0x0c04; ldr_imm(LoadKind::Word, R0, R1, -4));
        assert_emit!(0xf991, 0x0001; ldr_imm(LoadKind::SignedByte, R0, R1, 1));
        assert_emit!(0x6048; str_imm(StoreKind::Word, R0, R1, 4));
        assert_emit!(0xf8c9, 0x0010; str_imm(StoreKind::Word, R0, R9, 16));
        assert_emit!(0x5888; ldr_reg(LoadKind::Word, R0, R1, R2, 0));
        assert_emit!(0xf851, 0x0022; ldr_reg(LoadKind::Word, R0, R1, R2, 2));
        assert_emit!(0xe9d2, 0x0102; ldrd(R0, R1, R2, 8));
        assert_emit!(0xe942, 0x0102; strd(R0, R1, R2, -8));
    }

    #[test]
    fn test_exclusive() {
        assert_emit!(0xe8d2, 0x017f; ldrexd(R0, R1, R2));
        assert_emit!(0xe8c2, 0x0173; strexd(R3, R0, R1, R2));
        assert_emit!(0xf3bf, 0x8f5b; dmb(BarrierOption::Ish));
        assert_emit!(0xf3bf, 0x8f5a; dmb(BarrierOption::IshSt));
    }

    #[test]
    fn test_push_pop() {
        assert_emit!(0xb510; push(R4.mask() | LR.mask()));
        assert_emit!(0xbd10; pop(R4.mask() | PC.mask()));
        assert_emit!(0xe92d, 0x4ff0; push(0x4FF0));
        assert_emit!(0xe8bd, 0x8ff0; pop(0x8FF0));
        assert_emit!(0xf84d, 0x8d04; push(R8.mask()));
    }

    // Fills the block with nops so the buffer can be finalized.
    fn it_encoding(start: impl FnOnce(&mut AssemblerThumb2), predicated: usize) -> u16 {
        let mut asm = AssemblerThumb2::new();
        start(&mut asm);
        for _ in 0..predicated {
            assert!(asm.in_it_block());
            asm.nop();
        }
        assert!(!asm.in_it_block());
        let code = asm.finalize();
        assert_eq!(code.len(), 2 * (1 + predicated));
        u16::from_le_bytes([code[0], code[1]])
    }

    #[test]
    fn test_it() {
        assert_eq!(it_encoding(|a| a.it(Cond::EQ), 1), 0xbf08);
        assert_eq!(it_encoding(|a| a.ite(Cond::EQ), 2), 0xbf0c);
        assert_eq!(it_encoding(|a| a.itt(Cond::EQ), 2), 0xbf04);
        assert_eq!(it_encoding(|a| a.it(Cond::NE), 1), 0xbf18);
        assert_eq!(it_encoding(|a| a.ite(Cond::NE), 2), 0xbf14);
        assert_eq!(it_encoding(|a| a.itt(Cond::NE), 2), 0xbf1c);
    }

    #[test]
    #[should_panic]
    fn test_unterminated_it_block() {
        let mut asm = AssemblerThumb2::new();
        asm.itt(Cond::EQ);
        asm.movs_imm8(R0, 1);
        asm.finalize();
    }

    #[test]
    fn test_vfp() {
        assert_emit!(0xee30, 0x0a81; vadd_s(S0, S1, S2));
        assert_emit!(0xee30, 0x0b41; vsub_d(D0, D0, D1));
        assert_emit!(0xeef1, 0xfa10; vmrs_apsr());
        assert_emit!(0xee00, 0x0a10; vmov_sr(S0, R0));
        assert_emit!(0xee10, 0x0a90; vmov_rs(R0, S1));
        assert_emit!(0xec41, 0x0b10; vmov_drr(D0, R0, R1));
        assert_emit!(0xec51, 0x0b10; vmov_rrd(R0, R1, D0));
        assert_emit!(0xed90, 0x0a01; vldr_s(S0, R0, 4));
        assert_emit!(0xed9d, 0x0b02; vldr_d(D0, SP, 8));
        assert_emit!(0xed2d, 0x8a10; vpush_s(S16, 16));
        assert_emit!(0xecbd, 0x8a10; vpop_s(S16, 16));
        assert_emit!(0xeeb8, 0x0ac0; vcvt_f32_s32(S0, S0));
        assert_emit!(0xeebd, 0x0ac0; vcvt_s32_f32(S0, S0));
        assert_emit!(0xeeb4, 0x0a41; vcmp_s(S0, S2));
        assert_emit!(0xeeb7, 0x0ac0; vcvt_f64_f32(D0, S0));
        assert_emit!(0xeeb7, 0x0bc0; vcvt_f32_f64(S0, D0));
        assert_emit!(0xeeb7, 0x0a00; vmov_s_imm(S0, 0x70));
    }

    #[test]
    fn test_backward_branches() {
        let mut asm = AssemblerThumb2::new();
        let lbl = asm.create_and_bind_label();
        asm.b(lbl);
        asm.b_cond(Cond::EQ, lbl);
        let code = asm.finalize();
        assert_eq!(halfwords(&code), vec![0xe7fe, 0xd0fd]);
    }

    #[test]
    fn test_forward_branches() {
        let mut asm = AssemblerThumb2::new();
        let lbl = asm.create_label();
        asm.b(lbl);
        asm.b_cond(Cond::NE, lbl);
        asm.cbz(R0, lbl);
        asm.b_cond_near(Cond::EQ, lbl);
        asm.bind_label(lbl);
        let code = asm.finalize();
        assert_eq!(
            halfwords(&code),
            vec![0xf000, 0xb804, 0xf040, 0x8002, 0xb100, 0xd0ff]
        );
    }

    #[test]
    fn test_wide_branch_to_self() {
        let mut asm = AssemblerThumb2::new();
        asm.nop();
        asm.nop();
        let lbl = asm.create_label();
        asm.bind_label(lbl);
        for _ in 0..1200 {
            asm.nop();
        }
        asm.b(lbl);
        let code = asm.finalize();
        let len = code.len();
        // -4 - 2400 bytes
        assert_eq!(halfwords(&code[len - 4..]), vec![0xf7ff, 0xbb4e]);
    }

    #[test]
    #[should_panic]
    fn test_unbound_label() {
        let mut asm = AssemblerThumb2::new();
        let lbl = asm.create_label();
        asm.b(lbl);
        asm.finalize();
    }

    #[test]
    fn test_adr_code() {
        let mut asm = AssemblerThumb2::new();
        let lbl = asm.create_label();
        asm.adr_code(LR, lbl);
        asm.nop();
        asm.bind_label(lbl);
        let code = asm.finalize();
        // Align(PC, 4) = 4, target = 6, plus Thumb bit.
        assert_eq!(halfwords(&code), vec![0xf20f, 0x0e03, 0xbf00]);
    }

    #[test]
    fn test_literal_pool_at_end() {
        let mut asm = AssemblerThumb2::new();
        let lit = asm.new_literal_u32(0x12345678);
        asm.ldr_literal(R0, lit);
        let same = asm.new_literal_u32(0x12345678);
        assert_eq!(lit, same);
        asm.bx(LR);
        let code = asm.finalize();
        // ldr at 0, bx at 4, pad at 6, literal at 8: 8 - 4 = 4.
        assert_eq!(
            halfwords(&code),
            vec![0xf8df, 0x0004, 0x4770, 0x0000, 0x5678, 0x1234]
        );
    }

    #[test]
    fn test_unique_literals_are_not_shared() {
        let mut asm = AssemblerThumb2::new();
        let a = asm.new_unique_literal_u32(0);
        let b = asm.new_unique_literal_u32(0);
        assert_ne!(a, b);
        asm.ldr_literal(R0, a);
        asm.ldr_literal(R1, b);
        let shared = asm.new_literal_u32(0);
        assert_ne!(shared, a);
        asm.bx(LR);
        asm.emit_literal_pool_at_end();
        assert_eq!(asm.literal_offset(a), Some(12));
        assert_eq!(asm.literal_offset(b), Some(16));
        assert_eq!(asm.finalize().len(), 20);
    }

    #[test]
    fn test_literal_pool_mid_stream() {
        let mut asm = AssemblerThumb2::new();
        let lit = asm.new_literal_u64(0x3ff0_0000_0000_0000);
        asm.vldr_literal_d(D0, lit);
        assert!(!asm.literal_pool_needed(0));
        for _ in 0..500 {
            asm.nop();
        }
        assert!(asm.literal_pool_needed(64));
        asm.emit_literal_pool();
        assert!(!asm.literal_pool_needed(4096));
        let code = asm.finalize();
        // vldr, 500 nops, b.w, align, literal.
        assert_eq!(code.len(), 4 + 1000 + 4 + 8);
        let hw = halfwords(&code);
        assert_eq!(hw[0], 0xed9f);
        // Align(4, 4) = 4, literal at 1008.
        assert_eq!(hw[1], 0x0b00 | (1008 - 4) / 4);
    }

    #[test]
    fn test_jump_table_entries() {
        let mut asm = AssemblerThumb2::new();
        let base = asm.create_and_bind_label();
        let target = asm.create_label();
        asm.emit_jump_table_entry(base, target);
        asm.emit_jump_table_entry(base, target);
        asm.bind_label(target);
        asm.nop();
        let code = asm.finalize();
        assert_eq!(&code[0..4], &9u32.to_le_bytes());
        assert_eq!(&code[4..8], &9u32.to_le_bytes());
    }
}
