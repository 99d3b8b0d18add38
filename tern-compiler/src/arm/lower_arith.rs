//! Integer, long and floating point arithmetic.

use tern_asm::thumb2::{is_modified_immediate, Cond, DataOp, Register, Shift};

use crate::arm::codegen::CodeGeneratorArm;
use crate::arm::{dreg, high_reg, low_reg, reg, sreg};
use crate::hir::{BinaryOp, DataType, InstId, OpShift, UnaryOp};
use crate::locations::Location;
use crate::runtime::QuickEntrypoint;

/// Second operand of a data processing instruction.
#[derive(Copy, Clone, Debug)]
enum Operand {
    Imm(u32),
    Reg(Register, Shift, u32),
}

impl Operand {
    fn reg(rm: Register) -> Operand {
        Operand::Reg(rm, Shift::LSL, 0)
    }

    /// A shifted register; an amount of zero is the plain register, since
    /// LSR/ASR #0 would encode a shift by 32.
    fn shifted(rm: Register, shift: Shift, amount: u32) -> Operand {
        if amount == 0 {
            Operand::reg(rm)
        } else {
            Operand::Reg(rm, shift, amount)
        }
    }
}

fn data_op(op: BinaryOp) -> DataOp {
    match op {
        BinaryOp::Add => DataOp::Add,
        BinaryOp::Sub => DataOp::Sub,
        BinaryOp::And => DataOp::And,
        BinaryOp::Or => DataOp::Orr,
        BinaryOp::Xor => DataOp::Eor,
        other => panic!("{:?} is not a data processing operation", other),
    }
}

fn shift_of(shift: OpShift) -> Shift {
    match shift {
        OpShift::Lsl => Shift::LSL,
        OpShift::Lsr => Shift::LSR,
        OpShift::Asr => Shift::ASR,
    }
}

/// Magic multiplier and shift for signed 32-bit division by `divisor`
/// (Hacker's Delight, chapter 10). `divisor` must not be 0, 1 or -1.
pub fn magic_and_shift(divisor: i32) -> (i32, u32) {
    const EXP: u64 = 1 << 31;
    let abs_d = divisor.unsigned_abs() as u64;
    let tmp = EXP + ((divisor as u32) >> 31) as u64;
    let abs_nc = tmp - 1 - tmp % abs_d;
    let mut p = 31u32;
    let (mut q1, mut r1) = (EXP / abs_nc, EXP % abs_nc);
    let (mut q2, mut r2) = (EXP / abs_d, EXP % abs_d);
    loop {
        p += 1;
        q1 *= 2;
        r1 *= 2;
        if r1 >= abs_nc {
            q1 += 1;
            r1 -= abs_nc;
        }
        q2 *= 2;
        r2 *= 2;
        if r2 >= abs_d {
            q2 += 1;
            r2 -= abs_d;
        }
        let delta = abs_d - r2;
        if !(q1 < delta || (q1 == delta && r1 == 0)) {
            break;
        }
    }
    let magic = if divisor > 0 {
        (q2 + 1) as u32 as i32
    } else {
        (q2 + 1).wrapping_neg() as u32 as i32
    };
    (magic, p - 32)
}

impl<'a> CodeGeneratorArm<'a> {
    pub(crate) fn visit_binary(&mut self, inst: InstId, op: BinaryOp) {
        let ty = self.graph.inst(inst).ty.kind();
        match ty {
            DataType::Float32 | DataType::Float64 => self.fp_binary(inst, op),
            DataType::Int64 => match op {
                BinaryOp::Add | BinaryOp::Sub => self.long_add_sub(inst, op),
                BinaryOp::Mul => self.long_mul(inst),
                BinaryOp::Div | BinaryOp::Rem => {
                    let entrypoint = if op == BinaryOp::Div {
                        QuickEntrypoint::Ldiv
                    } else {
                        QuickEntrypoint::Lmod
                    };
                    self.invoke_runtime(entrypoint, Some(inst), None);
                }
                BinaryOp::And | BinaryOp::Or | BinaryOp::Xor => self.long_bitwise(inst, op),
                BinaryOp::Shl | BinaryOp::Shr | BinaryOp::UShr => self.long_shift(inst, op),
                BinaryOp::Ror | BinaryOp::Rol => self.long_rotate(inst, op),
            },
            _ => match op {
                BinaryOp::Add | BinaryOp::Sub => self.int_add_sub(inst, op),
                BinaryOp::Mul => {
                    let locations = self.locations_of(inst);
                    self.masm.mul(
                        reg(locations.out()),
                        reg(locations.in_at(0)),
                        reg(locations.in_at(1)),
                    );
                }
                BinaryOp::Div | BinaryOp::Rem => self.int_div_rem(inst, op),
                BinaryOp::And | BinaryOp::Or | BinaryOp::Xor => {
                    let locations = self.locations_of(inst);
                    let (out, lhs) = (reg(locations.out()), reg(locations.in_at(0)));
                    let rhs = locations.in_at(1);
                    if rhs.is_constant() {
                        let value = self.int_value(rhs) as u32;
                        self.masm.bitwise_const(data_op(op), false, out, lhs, value);
                    } else {
                        self.masm
                            .dp_reg(data_op(op), false, out, lhs, reg(rhs), Shift::LSL, 0);
                    }
                }
                _ => self.int_shift(inst, op),
            },
        }
    }

    fn fp_binary(&mut self, inst: InstId, op: BinaryOp) {
        let locations = self.locations_of(inst);
        let (out, lhs, rhs) = (locations.out(), locations.in_at(0), locations.in_at(1));
        let is_double = self.graph.inst(inst).ty.kind() == DataType::Float64;

        if op == BinaryOp::Rem {
            let entrypoint = if is_double {
                QuickEntrypoint::Fmod
            } else {
                QuickEntrypoint::Fmodf
            };
            self.invoke_runtime(entrypoint, Some(inst), None);
            return;
        }

        if is_double {
            let (dd, dn, dm) = (dreg(out), dreg(lhs), dreg(rhs));
            match op {
                BinaryOp::Add => self.masm.vadd_d(dd, dn, dm),
                BinaryOp::Sub => self.masm.vsub_d(dd, dn, dm),
                BinaryOp::Mul => self.masm.vmul_d(dd, dn, dm),
                BinaryOp::Div => self.masm.vdiv_d(dd, dn, dm),
                other => panic!("{:?} on doubles", other),
            }
        } else {
            let (sd, sn, sm) = (sreg(out), sreg(lhs), sreg(rhs));
            match op {
                BinaryOp::Add => self.masm.vadd_s(sd, sn, sm),
                BinaryOp::Sub => self.masm.vsub_s(sd, sn, sm),
                BinaryOp::Mul => self.masm.vmul_s(sd, sn, sm),
                BinaryOp::Div => self.masm.vdiv_s(sd, sn, sm),
                other => panic!("{:?} on floats", other),
            }
        }
    }

    fn int_add_sub(&mut self, inst: InstId, op: BinaryOp) {
        let locations = self.locations_of(inst);
        let (out, lhs) = (reg(locations.out()), reg(locations.in_at(0)));
        let rhs = locations.in_at(1);
        if rhs.is_constant() {
            let value = self.int_value(rhs) as i32;
            let value = if op == BinaryOp::Sub { value.wrapping_neg() } else { value };
            self.masm.add_constant(out, lhs, value);
        } else {
            self.masm
                .dp_reg(data_op(op), false, out, lhs, reg(rhs), Shift::LSL, 0);
        }
    }

    fn long_add_sub(&mut self, inst: InstId, op: BinaryOp) {
        let locations = self.locations_of(inst);
        let (out, lhs, rhs) = (locations.out(), locations.in_at(0), locations.in_at(1));

        if rhs.is_constant() {
            let value = self.int_value(rhs);
            let value = if op == BinaryOp::Sub { value.wrapping_neg() } else { value };
            let (low, high) = (value as u32, (value >> 32) as u32);
            // The SUBS form chosen for some low words produces the same carry
            // as the corresponding ADDS.
            self.masm
                .add_constant_set_flags(low_reg(out), low_reg(lhs), low as i32);
            if is_modified_immediate(high) {
                self.masm
                    .dp_imm(DataOp::Adc, false, high_reg(out), high_reg(lhs), high);
            } else {
                self.masm
                    .dp_imm(DataOp::Sbc, false, high_reg(out), high_reg(lhs), !high);
            }
            return;
        }

        let (low_op, high_op) = if op == BinaryOp::Add {
            (DataOp::Add, DataOp::Adc)
        } else {
            (DataOp::Sub, DataOp::Sbc)
        };
        self.masm
            .dp_reg(low_op, true, low_reg(out), low_reg(lhs), low_reg(rhs), Shift::LSL, 0);
        self.masm
            .dp_reg(high_op, false, high_reg(out), high_reg(lhs), high_reg(rhs), Shift::LSL, 0);
    }

    fn long_mul(&mut self, inst: InstId) {
        let locations = self.locations_of(inst);
        let (out, lhs, rhs) = (locations.out(), locations.in_at(0), locations.in_at(1));
        // The output overlaps, so out.hi never aliases an input low word.
        debug_assert!(high_reg(out) != low_reg(lhs) && high_reg(out) != low_reg(rhs));

        let temp = self.masm.scratch();
        self.masm.mul(*temp, low_reg(lhs), high_reg(rhs));
        self.masm
            .mla(high_reg(out), high_reg(lhs), low_reg(rhs), *temp);
        self.masm
            .umull(low_reg(out), *temp, low_reg(lhs), low_reg(rhs));
        self.masm
            .dp_reg(DataOp::Add, false, high_reg(out), high_reg(out), *temp, Shift::LSL, 0);
    }

    fn long_bitwise(&mut self, inst: InstId, op: BinaryOp) {
        let locations = self.locations_of(inst);
        let (out, lhs, rhs) = (locations.out(), locations.in_at(0), locations.in_at(1));
        let op = data_op(op);
        if rhs.is_constant() {
            let value = self.int_value(rhs);
            self.masm
                .bitwise_const(op, false, low_reg(out), low_reg(lhs), value as u32);
            self.masm
                .bitwise_const(op, false, high_reg(out), high_reg(lhs), (value >> 32) as u32);
        } else {
            self.masm
                .dp_reg(op, false, low_reg(out), low_reg(lhs), low_reg(rhs), Shift::LSL, 0);
            self.masm
                .dp_reg(op, false, high_reg(out), high_reg(lhs), high_reg(rhs), Shift::LSL, 0);
        }
    }

    fn int_div_rem(&mut self, inst: InstId, op: BinaryOp) {
        let locations = self.locations_of(inst);
        let rhs = locations.in_at(1);

        if rhs.is_constant() {
            let divisor = self.int_value(rhs) as i32;
            match divisor {
                // The preceding DivZeroCheck throws.
                0 => {}
                1 | -1 => self.div_rem_one(inst, op, divisor),
                _ if divisor.unsigned_abs().is_power_of_two() => self.div_rem_power_of_two(inst, op, divisor),
                _ => self.div_rem_any_constant(inst, op, divisor),
            }
            return;
        }

        if !self.options.features.has_div {
            self.invoke_runtime(QuickEntrypoint::Idivmod, Some(inst), None);
            return;
        }

        let (out, lhs, rhs) = (reg(locations.out()), reg(locations.in_at(0)), reg(rhs));
        if op == BinaryOp::Div {
            self.masm.sdiv(out, lhs, rhs);
        } else {
            let temp = reg(locations.temp(0));
            self.masm.sdiv(temp, lhs, rhs);
            self.masm.mls(out, temp, rhs, lhs);
        }
    }

    fn div_rem_one(&mut self, inst: InstId, op: BinaryOp, divisor: i32) {
        let locations = self.locations_of(inst);
        let (out, dividend) = (reg(locations.out()), reg(locations.in_at(0)));
        if op == BinaryOp::Rem {
            self.masm.load_const(out, 0);
        } else if divisor == 1 {
            self.masm.mov(out, dividend);
        } else {
            self.masm.dp_imm(DataOp::Rsb, false, out, dividend, 0);
        }
    }

    fn div_rem_power_of_two(&mut self, inst: InstId, op: BinaryOp, divisor: i32) {
        let locations = self.locations_of(inst);
        let (out, dividend, temp) = (
            reg(locations.out()),
            reg(locations.in_at(0)),
            reg(locations.temp(0)),
        );
        let k = divisor.unsigned_abs().trailing_zeros();

        // temp = dividend < 0 ? 2^k - 1 : 0, the rounding bias towards zero.
        if k == 1 {
            self.masm.shift_imm_w(Shift::LSR, false, temp, dividend, 31);
        } else {
            self.masm.shift_imm_w(Shift::ASR, false, temp, dividend, 31);
            self.masm.shift_imm_w(Shift::LSR, false, temp, temp, 32 - k);
        }
        self.masm
            .dp_reg(DataOp::Add, false, out, temp, dividend, Shift::LSL, 0);

        if op == BinaryOp::Div {
            self.masm.shift_imm_w(Shift::ASR, false, out, out, k);
            if divisor < 0 {
                self.masm.dp_imm(DataOp::Rsb, false, out, out, 0);
            }
        } else {
            // Keep the low k bits.
            self.masm.shift_imm_w(Shift::LSL, false, out, out, 32 - k);
            self.masm.shift_imm_w(Shift::LSR, false, out, out, 32 - k);
            self.masm
                .dp_reg(DataOp::Sub, false, out, out, temp, Shift::LSL, 0);
        }
    }

    fn div_rem_any_constant(&mut self, inst: InstId, op: BinaryOp, divisor: i32) {
        let locations = self.locations_of(inst);
        let (out, dividend) = (reg(locations.out()), reg(locations.in_at(0)));
        let (temp1, temp2) = (reg(locations.temp(0)), reg(locations.temp(1)));
        let (magic, shift) = magic_and_shift(divisor);

        self.masm.load_const(temp1, magic);
        self.masm.smull(temp2, temp1, dividend, temp1);
        if divisor > 0 && magic < 0 {
            self.masm
                .dp_reg(DataOp::Add, false, temp1, temp1, dividend, Shift::LSL, 0);
        } else if divisor < 0 && magic > 0 {
            self.masm
                .dp_reg(DataOp::Sub, false, temp1, temp1, dividend, Shift::LSL, 0);
        }
        if shift != 0 {
            self.masm.shift_imm_w(Shift::ASR, false, temp1, temp1, shift);
        }

        if op == BinaryOp::Div {
            self.masm
                .dp_reg(DataOp::Sub, false, out, temp1, temp1, Shift::ASR, 31);
        } else {
            self.masm
                .dp_reg(DataOp::Sub, false, temp1, temp1, temp1, Shift::ASR, 31);
            self.masm.load_const(temp2, divisor);
            self.masm.mls(out, temp1, temp2, dividend);
        }
    }

    fn int_shift(&mut self, inst: InstId, op: BinaryOp) {
        let locations = self.locations_of(inst);
        let (out, lhs) = (reg(locations.out()), reg(locations.in_at(0)));
        let rhs = locations.in_at(1);

        if rhs.is_constant() {
            let amount = (self.int_value(rhs) & 31) as u32;
            let (shift, amount) = match op {
                BinaryOp::Shl => (Shift::LSL, amount),
                BinaryOp::Shr => (Shift::ASR, amount),
                BinaryOp::UShr => (Shift::LSR, amount),
                BinaryOp::Ror => (Shift::ROR, amount),
                BinaryOp::Rol => (Shift::ROR, (32 - amount) & 31),
                other => panic!("{:?} is not a shift", other),
            };
            if amount == 0 {
                self.masm.mov(out, lhs);
            } else {
                self.masm.shift_imm_w(shift, false, out, lhs, amount);
            }
            return;
        }

        let amount = reg(rhs);
        match op {
            BinaryOp::Ror => self.masm.shift_reg_w(Shift::ROR, false, out, lhs, amount),
            BinaryOp::Rol => {
                self.masm.dp_imm(DataOp::Rsb, false, out, amount, 0);
                self.masm.shift_reg_w(Shift::ROR, false, out, lhs, out);
            }
            _ => {
                let shift = match op {
                    BinaryOp::Shl => Shift::LSL,
                    BinaryOp::Shr => Shift::ASR,
                    _ => Shift::LSR,
                };
                // Register shifts use the whole low byte; the language masks
                // the amount to five bits.
                self.masm.dp_imm(DataOp::And, false, out, amount, 31);
                self.masm.shift_reg_w(shift, false, out, lhs, out);
            }
        }
    }

    fn long_shift(&mut self, inst: InstId, op: BinaryOp) {
        let locations = self.locations_of(inst);
        let (out, lhs, rhs) = (locations.out(), locations.in_at(0), locations.in_at(1));
        let (o_l, o_h) = (low_reg(out), high_reg(out));
        let (low, high) = (low_reg(lhs), high_reg(lhs));

        if rhs.is_constant() {
            let amount = (self.int_value(rhs) & 63) as u32;
            self.long_shift_by_constant(op, (o_l, o_h), (low, high), amount);
            return;
        }

        let amount = reg(rhs);
        let temp = self.masm.scratch();
        match op {
            BinaryOp::Shl => {
                self.masm.dp_imm(DataOp::And, false, o_l, amount, 63);
                self.masm.shift_reg_w(Shift::LSL, false, o_h, high, o_l);
                // Bits crossing from the low word.
                self.masm.dp_imm(DataOp::Rsb, false, *temp, o_l, 32);
                self.masm.shift_reg_w(Shift::LSR, false, *temp, low, *temp);
                self.masm
                    .dp_reg(DataOp::Orr, false, o_h, o_h, *temp, Shift::LSL, 0);
                // Shifts by 32 or more take the high word from the low word only.
                self.masm.dp_imm(DataOp::Sub, true, *temp, o_l, 32);
                self.masm.it(Cond::PL);
                self.masm.shift_reg_w(Shift::LSL, false, o_h, low, *temp);
                self.masm.shift_reg_w(Shift::LSL, false, o_l, low, o_l);
            }
            _ => {
                let shift = if op == BinaryOp::Shr { Shift::ASR } else { Shift::LSR };
                self.masm.dp_imm(DataOp::And, false, o_h, amount, 63);
                self.masm.shift_reg_w(Shift::LSR, false, o_l, low, o_h);
                self.masm.dp_imm(DataOp::Rsb, false, *temp, o_h, 32);
                self.masm.shift_reg_w(Shift::LSL, false, *temp, high, *temp);
                self.masm
                    .dp_reg(DataOp::Orr, false, o_l, o_l, *temp, Shift::LSL, 0);
                self.masm.dp_imm(DataOp::Sub, true, *temp, o_h, 32);
                self.masm.it(Cond::PL);
                self.masm.shift_reg_w(shift, false, o_l, high, *temp);
                self.masm.shift_reg_w(shift, false, o_h, high, o_h);
            }
        }
    }

    fn long_shift_by_constant(
        &mut self,
        op: BinaryOp,
        (o_l, o_h): (Register, Register),
        (low, high): (Register, Register),
        amount: u32,
    ) {
        if amount == 0 {
            self.masm.mov(o_l, low);
            self.masm.mov(o_h, high);
            return;
        }

        match op {
            BinaryOp::Shl => {
                if amount > 32 {
                    self.masm.shift_imm_w(Shift::LSL, false, o_h, low, amount - 32);
                    self.masm.load_const(o_l, 0);
                } else if amount == 32 {
                    self.masm.mov(o_h, low);
                    self.masm.load_const(o_l, 0);
                } else {
                    self.masm.shift_imm_w(Shift::LSL, false, o_h, high, amount);
                    self.masm
                        .dp_reg(DataOp::Orr, false, o_h, o_h, low, Shift::LSR, 32 - amount);
                    self.masm.shift_imm_w(Shift::LSL, false, o_l, low, amount);
                }
            }
            BinaryOp::Shr => {
                if amount > 32 {
                    self.masm.shift_imm_w(Shift::ASR, false, o_l, high, amount - 32);
                    self.masm.shift_imm_w(Shift::ASR, false, o_h, high, 31);
                } else if amount == 32 {
                    self.masm.mov(o_l, high);
                    self.masm.shift_imm_w(Shift::ASR, false, o_h, high, 31);
                } else {
                    self.masm.shift_imm_w(Shift::LSR, false, o_l, low, amount);
                    self.masm
                        .dp_reg(DataOp::Orr, false, o_l, o_l, high, Shift::LSL, 32 - amount);
                    self.masm.shift_imm_w(Shift::ASR, false, o_h, high, amount);
                }
            }
            _ => {
                if amount > 32 {
                    self.masm.shift_imm_w(Shift::LSR, false, o_l, high, amount - 32);
                    self.masm.load_const(o_h, 0);
                } else if amount == 32 {
                    self.masm.mov(o_l, high);
                    self.masm.load_const(o_h, 0);
                } else {
                    self.masm.shift_imm_w(Shift::LSR, false, o_l, low, amount);
                    self.masm
                        .dp_reg(DataOp::Orr, false, o_l, o_l, high, Shift::LSL, 32 - amount);
                    self.masm.shift_imm_w(Shift::LSR, false, o_h, high, amount);
                }
            }
        }
    }

    fn long_rotate(&mut self, inst: InstId, op: BinaryOp) {
        let locations = self.locations_of(inst);
        let (out, lhs, rhs) = (locations.out(), locations.in_at(0), locations.in_at(1));
        let (o_l, o_h) = (low_reg(out), high_reg(out));
        let (mut in_l, mut in_h) = (low_reg(lhs), high_reg(lhs));

        if rhs.is_constant() {
            let value = self.int_value(rhs);
            let value = if op == BinaryOp::Rol { value.wrapping_neg() } else { value };
            let mut rot = (value & 63) as u32;
            // Rotations by a word or more swap the halves first.
            if rot >= 32 {
                rot -= 32;
                std::mem::swap(&mut in_l, &mut in_h);
            }
            if rot == 0 {
                self.masm.mov(o_l, in_l);
                self.masm.mov(o_h, in_h);
            } else {
                self.masm.shift_imm_w(Shift::LSR, false, o_h, in_h, rot);
                self.masm
                    .dp_reg(DataOp::Orr, false, o_h, o_h, in_l, Shift::LSL, 32 - rot);
                self.masm.shift_imm_w(Shift::LSR, false, o_l, in_l, rot);
                self.masm
                    .dp_reg(DataOp::Orr, false, o_l, o_l, in_h, Shift::LSL, 32 - rot);
            }
            return;
        }

        let shift_right = reg(locations.temp(0));
        let shift_left = reg(locations.temp(1));
        let mut amount = reg(rhs);
        if op == BinaryOp::Rol {
            self.masm.dp_imm(DataOp::Rsb, false, shift_left, amount, 0);
            amount = shift_left;
        }
        let below_word = self.masm.create_label();
        let end = self.masm.create_label();

        self.masm.dp_imm(DataOp::And, false, shift_right, amount, 0x1f);
        // Carry holds bit 5 of the amount.
        self.masm.shift_imm_w(Shift::LSR, true, shift_left, amount, 6);
        self.masm.dp_imm(DataOp::Rsb, false, shift_left, shift_right, 32);
        self.masm.b_cond_near(Cond::LO, below_word);

        // Rotation by 32 + shift_right.
        self.masm.shift_reg_w(Shift::LSL, false, o_h, in_h, shift_left);
        self.masm.shift_reg_w(Shift::LSR, false, o_l, in_l, shift_right);
        self.masm
            .dp_reg(DataOp::Add, false, o_h, o_h, o_l, Shift::LSL, 0);
        self.masm.shift_reg_w(Shift::LSL, false, o_l, in_l, shift_left);
        self.masm.shift_reg_w(Shift::LSR, false, shift_left, in_h, shift_right);
        self.masm
            .dp_reg(DataOp::Add, false, o_l, o_l, shift_left, Shift::LSL, 0);
        self.masm.b_near(end);

        self.masm.bind_label(below_word);
        self.masm.shift_reg_w(Shift::LSR, false, o_h, in_h, shift_right);
        self.masm.shift_reg_w(Shift::LSL, false, o_l, in_l, shift_left);
        self.masm
            .dp_reg(DataOp::Add, false, o_h, o_h, o_l, Shift::LSL, 0);
        self.masm.shift_reg_w(Shift::LSR, false, o_l, in_l, shift_right);
        self.masm.shift_reg_w(Shift::LSL, false, shift_right, in_h, shift_left);
        self.masm
            .dp_reg(DataOp::Add, false, o_l, o_l, shift_right, Shift::LSL, 0);
        self.masm.bind_label(end);
    }

    pub(crate) fn visit_unary(&mut self, inst: InstId, op: UnaryOp) {
        let locations = self.locations_of(inst);
        let (out, input) = (locations.out(), locations.in_at(0));
        let ty = self.graph.inst(inst).ty.kind();

        match (op, ty) {
            (UnaryOp::Neg, DataType::Float32) => self.masm.vneg_s(sreg(out), sreg(input)),
            (UnaryOp::Neg, DataType::Float64) => self.masm.vneg_d(dreg(out), dreg(input)),
            (UnaryOp::Neg, DataType::Int64) => {
                let (o_l, o_h) = (low_reg(out), high_reg(out));
                self.masm.dp_imm(DataOp::Rsb, true, o_l, low_reg(input), 0);
                // o_h = -borrow, then subtract the input high word.
                self.masm
                    .dp_reg(DataOp::Sbc, false, o_h, o_h, o_h, Shift::LSL, 0);
                self.masm
                    .dp_reg(DataOp::Sub, false, o_h, o_h, high_reg(input), Shift::LSL, 0);
            }
            (UnaryOp::Neg, _) => self.masm.dp_imm(DataOp::Rsb, false, reg(out), reg(input), 0),
            (UnaryOp::Not, DataType::Int64) => {
                self.masm.mvn_w_reg(false, low_reg(out), low_reg(input));
                self.masm.mvn_w_reg(false, high_reg(out), high_reg(input));
            }
            (UnaryOp::Not, _) => self.masm.mvn_w_reg(false, reg(out), reg(input)),
            (UnaryOp::BooleanNot, _) => self.masm.dp_imm(DataOp::Eor, false, reg(out), reg(input), 1),
        }
    }

    pub(crate) fn visit_bitwise_negated_right(&mut self, inst: InstId, op: BinaryOp) {
        let locations = self.locations_of(inst);
        let (out, lhs, rhs) = (locations.out(), locations.in_at(0), locations.in_at(1));
        let halves = if self.graph.inst(inst).ty.kind() == DataType::Int64 {
            vec![
                (low_reg(out), low_reg(lhs), low_reg(rhs)),
                (high_reg(out), high_reg(lhs), high_reg(rhs)),
            ]
        } else {
            vec![(reg(out), reg(lhs), reg(rhs))]
        };

        for (rd, rn, rm) in halves {
            match op {
                BinaryOp::And => self.masm.dp_reg(DataOp::Bic, false, rd, rn, rm, Shift::LSL, 0),
                BinaryOp::Or => self.masm.dp_reg(DataOp::Orn, false, rd, rn, rm, Shift::LSL, 0),
                BinaryOp::Xor => {
                    self.masm.dp_reg(DataOp::Eor, false, rd, rn, rm, Shift::LSL, 0);
                    self.masm.mvn_w_reg(false, rd, rd);
                }
                other => panic!("{:?} with negated operand", other),
            }
        }
    }

    pub(crate) fn visit_data_proc_with_shifter_op(&mut self, inst: InstId, op: BinaryOp, shift: OpShift, amount: u32) {
        let locations = self.locations_of(inst);
        let (out, lhs, rhs) = (locations.out(), locations.in_at(0), locations.in_at(1));
        let shift = shift_of(shift);

        if self.graph.inst(inst).ty.kind() != DataType::Int64 {
            let operand = Operand::shifted(reg(rhs), shift, amount & 31);
            self.data_proc(op, false, reg(out), reg(lhs), operand);
            return;
        }

        let amount = amount & 63;
        let (r_l, r_h) = (low_reg(rhs), high_reg(rhs));
        if amount >= 32 {
            let (low, high) = match shift {
                Shift::LSL => (Operand::Imm(0), Operand::shifted(r_l, Shift::LSL, amount - 32)),
                Shift::ASR => (
                    Operand::shifted(r_h, Shift::ASR, amount - 32),
                    Operand::Reg(r_h, Shift::ASR, 31),
                ),
                _ => (Operand::shifted(r_h, Shift::LSR, amount - 32), Operand::Imm(0)),
            };
            self.long_data_proc(op, out, lhs, low, high);
            return;
        }

        let temp = self.masm.scratch();
        if shift == Shift::LSL {
            self.masm.shift_imm_w(Shift::LSL, false, *temp, r_h, amount);
            self.masm
                .dp_reg(DataOp::Orr, false, *temp, *temp, r_l, Shift::LSR, 32 - amount);
            self.long_data_proc(op, out, lhs, Operand::shifted(r_l, Shift::LSL, amount), Operand::reg(*temp));
        } else {
            self.masm.shift_imm_w(Shift::LSR, false, *temp, r_l, amount);
            self.masm
                .dp_reg(DataOp::Orr, false, *temp, *temp, r_h, Shift::LSL, 32 - amount);
            self.long_data_proc(op, out, lhs, Operand::reg(*temp), Operand::shifted(r_h, shift, amount));
        }
    }

    /// `out = lhs op (high:low)` for a long, propagating the carry of adds
    /// and subtracts.
    fn long_data_proc(&mut self, op: BinaryOp, out: Location, lhs: Location, low: Operand, high: Operand) {
        let carry_op = match op {
            BinaryOp::Add => Some(DataOp::Adc),
            BinaryOp::Sub => Some(DataOp::Sbc),
            _ => None,
        };
        self.data_proc(op, carry_op.is_some(), low_reg(out), low_reg(lhs), low);
        match carry_op {
            Some(carry_op) => self.raw_data_proc(carry_op, false, high_reg(out), high_reg(lhs), high),
            None => self.data_proc(op, false, high_reg(out), high_reg(lhs), high),
        }
    }

    fn data_proc(&mut self, op: BinaryOp, set_flags: bool, rd: Register, rn: Register, operand: Operand) {
        self.raw_data_proc(data_op(op), set_flags, rd, rn, operand);
    }

    fn raw_data_proc(&mut self, op: DataOp, set_flags: bool, rd: Register, rn: Register, operand: Operand) {
        match operand {
            Operand::Imm(value) => self.masm.dp_imm(op, set_flags, rd, rn, value),
            Operand::Reg(rm, shift, amount) => self.masm.dp_reg(op, set_flags, rd, rn, rm, shift, amount),
        }
    }

    pub(crate) fn visit_type_conversion(&mut self, inst: InstId) {
        let graph = self.graph;
        let instruction = graph.inst(inst);
        let locations = self.locations_of(inst);
        let (out, input) = (locations.out(), locations.in_at(0));
        let from = graph.inst(instruction.input(0)).ty;
        let to = instruction.ty;

        if from == to {
            self.move_location(out, input, to);
            return;
        }

        match (from.kind(), to.kind()) {
            (DataType::Int64, DataType::Float32) => self.invoke_runtime(QuickEntrypoint::L2f, Some(inst), None),
            (DataType::Int64, DataType::Float64) => self.invoke_runtime(QuickEntrypoint::L2d, Some(inst), None),
            (DataType::Float32, DataType::Int64) => self.invoke_runtime(QuickEntrypoint::F2l, Some(inst), None),
            (DataType::Float64, DataType::Int64) => self.invoke_runtime(QuickEntrypoint::D2l, Some(inst), None),

            (DataType::Float32, DataType::Float64) => self.masm.vcvt_f64_f32(dreg(out), sreg(input)),
            (DataType::Float64, DataType::Float32) => self.masm.vcvt_f32_f64(sreg(out), dreg(input)),
            (_, DataType::Float32) => {
                self.masm.vmov_sr(sreg(out), reg(input));
                self.masm.vcvt_f32_s32(sreg(out), sreg(out));
            }
            (_, DataType::Float64) => {
                let low = dreg(out).low();
                self.masm.vmov_sr(low, reg(input));
                self.masm.vcvt_f64_s32(dreg(out), low);
            }
            (DataType::Float32, _) | (DataType::Float64, _) => {
                let temp = sreg(locations.temp(0));
                if from.kind() == DataType::Float32 {
                    self.masm.vcvt_s32_f32(temp, sreg(input));
                } else {
                    self.masm.vcvt_s32_f64(temp, dreg(input));
                }
                self.masm.vmov_rs(reg(out), temp);
                self.narrow_int(to, reg(out), reg(out));
            }
            (_, DataType::Int64) => {
                let source = reg(input);
                self.masm.mov(low_reg(out), source);
                self.masm
                    .shift_imm_w(Shift::ASR, false, high_reg(out), source, 31);
            }
            (DataType::Int64, _) => self.narrow_int(to, reg(out), low_reg(input)),
            _ => self.narrow_int(to, reg(out), reg(input)),
        }
    }

    /// Truncates and extends a 32-bit value to `to`.
    fn narrow_int(&mut self, to: DataType, rd: Register, rm: Register) {
        match to {
            DataType::Int8 => self.masm.sxtb(rd, rm),
            DataType::Uint8 | DataType::Bool => self.masm.uxtb(rd, rm),
            DataType::Int16 => self.masm.sxth(rd, rm),
            DataType::Uint16 => self.masm.uxth(rd, rm),
            _ => self.masm.mov(rd, rm),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arm::test_util::{fixed, lower, method_graph};
    use crate::hir::InstructionKind;
    use tern_asm::thumb2::{R0, R1, R2, R3};

    #[test]
    fn test_magic_numbers() {
        assert_eq!(magic_and_shift(3), (0x5555_5556, 0));
        assert_eq!(magic_and_shift(5), (0x6666_6667, 1));
        assert_eq!(magic_and_shift(7), (0x9249_2493u32 as i32, 2));
        assert_eq!(magic_and_shift(-5), (0x9999_9999u32 as i32, 1));
        assert_eq!(magic_and_shift(-7), (0x6db6_db6d, 2));
        assert_eq!(magic_and_shift(10), (0x6666_6667, 2));
    }

    #[test]
    fn test_long_shift_left_above_word() {
        let (mut graph, entry) = method_graph();
        let value = graph.add(entry, InstructionKind::LongConstant(0), DataType::Int64, &[]);
        let amount = graph.add(entry, InstructionKind::IntConstant(34), DataType::Int32, &[]);
        let shl = graph.add(entry, InstructionKind::Binary(BinaryOp::Shl), DataType::Int64, &[value, amount]);
        graph.inst_mut(shl).locations = Some(fixed(
            &[Location::register_pair(0, 1), Location::Constant(amount)],
            Location::register_pair(2, 3),
        ));

        let lowered = lower(&graph, &Default::default(), &[shl]);
        // lsl r3, r0, #2; mov.w r2, #0
        assert_eq!(lowered.body(), &[0xea4f, 0x0380, 0xf04f, 0x0200]);
    }

    #[test]
    fn test_long_shift_by_word_is_a_move() {
        let (mut graph, entry) = method_graph();
        let value = graph.add(entry, InstructionKind::LongConstant(0), DataType::Int64, &[]);
        let amount = graph.add(entry, InstructionKind::IntConstant(32), DataType::Int32, &[]);
        let ushr = graph.add(entry, InstructionKind::Binary(BinaryOp::UShr), DataType::Int64, &[value, amount]);
        graph.inst_mut(ushr).locations = Some(fixed(
            &[Location::register_pair(0, 1), Location::Constant(amount)],
            Location::register_pair(2, 3),
        ));

        let lowered = lower(&graph, &Default::default(), &[ushr]);
        let mut expected = crate::arm::masm::ArmMacroAssembler::new(false);
        expected.mov(R2, R1);
        expected.load_const(R3, 0);
        assert_eq!(lowered.body(), crate::arm::test_util::halfwords(expected).as_slice());
    }

    #[test]
    fn test_long_mul_sequence() {
        let (mut graph, entry) = method_graph();
        let a = graph.add(entry, InstructionKind::LongConstant(3), DataType::Int64, &[]);
        let b = graph.add(entry, InstructionKind::LongConstant(5), DataType::Int64, &[]);
        let mul = graph.add(entry, InstructionKind::Binary(BinaryOp::Mul), DataType::Int64, &[a, b]);
        graph.inst_mut(mul).locations = Some(fixed(
            &[Location::register_pair(0, 1), Location::register_pair(2, 3)],
            Location::register_pair(4, 5),
        ));

        let lowered = lower(&graph, &Default::default(), &[mul]);
        let mut expected = crate::arm::masm::ArmMacroAssembler::new(false);
        let ip = tern_asm::thumb2::IP;
        expected.mul(ip, R0, R3);
        expected.mla(tern_asm::thumb2::R5, R1, R2, ip);
        expected.umull(tern_asm::thumb2::R4, ip, R0, R2);
        expected.dp_reg(DataOp::Add, false, tern_asm::thumb2::R5, tern_asm::thumb2::R5, ip, Shift::LSL, 0);
        assert_eq!(lowered.body(), crate::arm::test_util::halfwords(expected).as_slice());
    }

    #[test]
    fn test_div_by_power_of_two() {
        let (mut graph, entry) = method_graph();
        let a = graph.add(entry, InstructionKind::IntConstant(0), DataType::Int32, &[]);
        let eight = graph.add(entry, InstructionKind::IntConstant(-8), DataType::Int32, &[]);
        let div = graph.add(entry, InstructionKind::Binary(BinaryOp::Div), DataType::Int32, &[a, eight]);
        let mut summary = fixed(&[Location::Register(1), Location::Constant(eight)], Location::Register(0));
        summary.add_temp(Location::Register(2));
        graph.inst_mut(div).locations = Some(summary);

        let lowered = lower(&graph, &Default::default(), &[div]);
        let mut expected = crate::arm::masm::ArmMacroAssembler::new(false);
        expected.shift_imm_w(Shift::ASR, false, R2, R1, 31);
        expected.shift_imm_w(Shift::LSR, false, R2, R2, 29);
        expected.dp_reg(DataOp::Add, false, R0, R2, R1, Shift::LSL, 0);
        expected.shift_imm_w(Shift::ASR, false, R0, R0, 3);
        expected.dp_imm(DataOp::Rsb, false, R0, R0, 0);
        assert_eq!(lowered.body(), crate::arm::test_util::halfwords(expected).as_slice());
    }
}
