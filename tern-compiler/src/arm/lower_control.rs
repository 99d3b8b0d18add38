//! Conditions, branches, switches, suspend checks and other control flow.

use tern_asm::thumb2::{BarrierOption, Cond, DataOp, LoadKind, Register, Shift, SP};

use crate::arm::codegen::CodeGeneratorArm;
use crate::arm::locations_builder::{long_condition_outcome, PACKED_SWITCH_COMPARE_JUMP_THRESHOLD};
use crate::arm::masm::ScopeSize;
use crate::arm::slow_paths::SlowPathKind;
use crate::arm::{dreg, high_reg, low_reg, reg, sreg, TR};
use crate::hir::{
    BlockId, ComparisonBias, DataType, DeoptimizationKind, IfCondition, InstId, InstructionKind, MemBarrierKind,
};
use crate::locations::Location;
use crate::runtime::thread;

/// How a condition is known after `generate_test`.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub(crate) enum Test {
    /// The flags hold the comparison; the condition holds under `Cond`.
    Flags(Cond),
    /// Decided at compile time; no code was emitted.
    Constant(bool),
}

fn int_cond(cond: IfCondition) -> Cond {
    match cond {
        IfCondition::Eq => Cond::EQ,
        IfCondition::Ne => Cond::NE,
        IfCondition::Lt => Cond::LT,
        IfCondition::Le => Cond::LE,
        IfCondition::Gt => Cond::GT,
        IfCondition::Ge => Cond::GE,
        IfCondition::B => Cond::LO,
        IfCondition::Be => Cond::LS,
        IfCondition::A => Cond::HI,
        IfCondition::Ae => Cond::HS,
    }
}

/// Condition after VMRS. An unordered compare sets C and V, so the
/// unsigned conditions make NaN compare as "greater".
fn fp_cond(cond: IfCondition, gt_bias: bool) -> Cond {
    match (cond, gt_bias) {
        (IfCondition::Lt, true) => Cond::LO,
        (IfCondition::Le, true) => Cond::LS,
        (IfCondition::Gt, true) => Cond::HI,
        (IfCondition::Ge, true) => Cond::HS,
        (other, _) => int_cond(other),
    }
}

impl<'a> CodeGeneratorArm<'a> {
    /// Compares the operands of `condition` and tells which flags hold it.
    pub(crate) fn generate_test(&mut self, condition: InstId) -> Test {
        let graph = self.graph;
        let (cond, bias) = match graph.kind(condition) {
            InstructionKind::Condition { cond, bias } => (*cond, *bias),
            other => panic!("{} is not a condition", other.name()),
        };
        let locations = self.locations_of(condition);
        let (lhs, rhs) = (locations.in_at(0), locations.in_at(1));
        let ty = graph.inst(graph.inst(condition).input(0)).ty.kind();

        match ty {
            DataType::Float32 | DataType::Float64 => {
                let is_double = ty == DataType::Float64;
                match (rhs.is_constant(), is_double) {
                    (true, false) => self.masm.vcmp_s_zero(sreg(lhs)),
                    (true, true) => self.masm.vcmp_d_zero(dreg(lhs)),
                    (false, false) => self.masm.vcmp_s(sreg(lhs), sreg(rhs)),
                    (false, true) => self.masm.vcmp_d(dreg(lhs), dreg(rhs)),
                }
                self.masm.vmrs_apsr();
                Test::Flags(fp_cond(cond, bias == ComparisonBias::GtBias))
            }
            DataType::Int64 => {
                if rhs.is_constant() {
                    let value = self.int_value(rhs);
                    let outcome = long_condition_outcome(cond, value)
                        .expect("long constant operand with a non-trivial outcome");
                    return Test::Constant(outcome);
                }
                self.generate_long_test(cond, lhs, rhs)
            }
            _ => {
                if rhs.is_constant() {
                    let value = self.int_value(rhs) as i32;
                    self.masm.cmp_const(reg(lhs), value);
                } else {
                    self.masm.cmp_reg16(reg(lhs), reg(rhs));
                }
                Test::Flags(int_cond(cond))
            }
        }
    }

    fn generate_long_test(&mut self, cond: IfCondition, lhs: Location, rhs: Location) -> Test {
        match cond {
            IfCondition::Eq | IfCondition::Ne => {
                self.masm.cmp_reg16(high_reg(lhs), high_reg(rhs));
                self.masm.it(Cond::EQ);
                self.masm.cmp_reg16(low_reg(lhs), low_reg(rhs));
                Test::Flags(int_cond(cond))
            }
            _ => {
                // Only LT/GE/LO/HS survive a SBCS; the other conditions swap
                // the operands.
                let (first, second, cond) = match cond {
                    IfCondition::Gt | IfCondition::Le | IfCondition::A | IfCondition::Be => (rhs, lhs, cond.swapped()),
                    _ => (lhs, rhs, cond),
                };
                let temp = self.masm.scratch();
                self.masm.cmp_reg16(low_reg(first), low_reg(second));
                self.masm
                    .dp_reg(DataOp::Sbc, true, *temp, high_reg(first), high_reg(second), Shift::LSL, 0);
                Test::Flags(int_cond(cond))
            }
        }
    }

    pub(crate) fn visit_condition(&mut self, inst: InstId) {
        let out = reg(self.locations_of(inst).out());
        match self.generate_test(inst) {
            Test::Constant(value) => self.masm.load_const(out, value as i32),
            Test::Flags(cond) => {
                // MOV.W with an immediate leaves the flags alone.
                self.masm.load_const(out, 0);
                if out.is_low() {
                    self.masm.it(cond);
                    self.masm.movs_imm8(out, 1);
                } else {
                    let skip = self.masm.create_label();
                    self.masm.b_cond_near(cond.invert(), skip);
                    self.masm.load_const(out, 1);
                    self.masm.bind_label(skip);
                }
            }
        }
    }

    pub(crate) fn visit_compare(&mut self, inst: InstId, bias: ComparisonBias) {
        let graph = self.graph;
        let locations = self.locations_of(inst);
        let (out, lhs, rhs) = (reg(locations.out()), locations.in_at(0), locations.in_at(1));
        let ty = graph.inst(graph.inst(inst).input(0)).ty.kind();

        let less = self.masm.create_label();
        let greater = self.masm.create_label();
        let done = self.masm.create_label();

        let less_cond = match ty {
            DataType::Int64 => {
                self.masm.cmp_reg16(high_reg(lhs), high_reg(rhs));
                self.masm.b_cond_near(Cond::LT, less);
                self.masm.b_cond_near(Cond::GT, greater);
                self.masm.load_const(out, 0);
                self.masm.cmp_reg16(low_reg(lhs), low_reg(rhs));
                Cond::LO
            }
            DataType::Float32 | DataType::Float64 => {
                self.masm.load_const(out, 0);
                let is_double = ty == DataType::Float64;
                match (rhs.is_constant(), is_double) {
                    (true, false) => self.masm.vcmp_s_zero(sreg(lhs)),
                    (true, true) => self.masm.vcmp_d_zero(dreg(lhs)),
                    (false, false) => self.masm.vcmp_s(sreg(lhs), sreg(rhs)),
                    (false, true) => self.masm.vcmp_d(dreg(lhs), dreg(rhs)),
                }
                self.masm.vmrs_apsr();
                fp_cond(IfCondition::Lt, bias == ComparisonBias::GtBias)
            }
            _ => {
                self.masm.load_const(out, 0);
                self.masm.cmp_reg16(reg(lhs), reg(rhs));
                Cond::LT
            }
        };

        self.masm.b_cond_near(Cond::EQ, done);
        self.masm.b_cond_near(less_cond, less);

        self.masm.bind_label(greater);
        self.masm.load_const(out, 1);
        self.masm.b_near(done);

        self.masm.bind_label(less);
        self.masm.load_const(out, -1);

        self.masm.bind_label(done);
    }

    pub(crate) fn visit_goto(&mut self, inst: InstId) {
        let graph = self.graph;
        let block = graph.inst(inst).block;
        let successor = graph.block(block).single_successor();

        let target = graph.block(successor);
        if target.is_loop_header && graph.is_back_edge(block, successor) {
            if let Some(suspend_check) = target.loop_suspend_check {
                self.maybe_increment_hotness(Some(suspend_check));
                self.generate_suspend_check(suspend_check, Some(successor));
                return;
            }
        }

        if graph.is_entry_block(block) {
            if let Some(previous) = graph.previous_instruction(inst) {
                if matches!(graph.kind(previous), InstructionKind::SuspendCheck) {
                    self.generate_suspend_check(previous, None);
                }
            }
        }

        if !self.goes_to_next_block(successor) {
            let label = self.block_label(successor);
            self.masm.b(label);
        }
    }

    pub(crate) fn visit_try_boundary(&mut self, inst: InstId) {
        let graph = self.graph;
        let successor = graph.block(graph.inst(inst).block).successors[0];
        if !self.goes_to_next_block(successor) {
            let label = self.block_label(successor);
            self.masm.b(label);
        }
    }

    pub(crate) fn visit_if(&mut self, inst: InstId) {
        let graph = self.graph;
        let block = graph.block(graph.inst(inst).block);
        let (true_block, false_block) = (block.successors[0], block.successors[1]);
        let true_target = (!self.goes_to_next_block(true_block)).then(|| self.block_label(true_block));
        let false_target = (!self.goes_to_next_block(false_block)).then(|| self.block_label(false_block));
        self.generate_test_and_branch(inst, true_target, false_target);
    }

    /// Branches on input 0 of `inst`. A `None` target is the fall-through.
    fn generate_test_and_branch(
        &mut self,
        inst: InstId,
        true_target: Option<tern_asm::Label>,
        false_target: Option<tern_asm::Label>,
    ) {
        let graph = self.graph;
        let condition = graph.inst(inst).input(0);
        let location = self.locations_of(inst).in_at(0);

        let test = if location.is_constant() {
            Test::Constant(self.int_value(location) != 0)
        } else if graph.inst(condition).emitted_at_use_site {
            self.generate_test(condition)
        } else {
            // A materialized boolean.
            match (true_target, false_target) {
                (Some(target), _) => {
                    self.masm.compare_and_branch(reg(location), true, target, true);
                    if let Some(target) = false_target {
                        self.masm.b(target);
                    }
                }
                (None, Some(target)) => {
                    self.masm.compare_and_branch(reg(location), false, target, true);
                }
                (None, None) => {}
            }
            return;
        };

        match test {
            Test::Constant(true) => {
                if let Some(target) = true_target {
                    self.masm.b(target);
                }
            }
            Test::Constant(false) => {
                if let Some(target) = false_target {
                    self.masm.b(target);
                }
            }
            Test::Flags(cond) => match (true_target, false_target) {
                (None, Some(target)) => self.masm.b_cond(cond.invert(), target),
                (Some(target), other) => {
                    self.masm.b_cond(cond, target);
                    if let Some(target) = other {
                        self.masm.b(target);
                    }
                }
                (None, None) => {}
            },
        }
    }

    pub(crate) fn visit_deoptimize(&mut self, inst: InstId, kind: DeoptimizationKind) {
        let idx = self.add_shared_slow_path(SlowPathKind::Deoptimization(kind), inst);
        let entry = self.slow_path_entry(idx);
        self.generate_test_and_branch(inst, Some(entry), None);
    }

    pub(crate) fn visit_should_deoptimize_flag(&mut self, inst: InstId) {
        let out = reg(self.locations_of(inst).out());
        let offset = self
            .frame
            .should_deoptimize_flag_offset
            .expect("method has no should-deoptimize slot");
        self.masm
            .load_from_offset(LoadKind::Word, out, SP, offset as i32);
    }

    pub(crate) fn visit_select(&mut self, inst: InstId) {
        let graph = self.graph;
        let instruction = graph.inst(inst);
        let locations = self.locations_of(inst);
        let (false_value, true_value, out) = (locations.in_at(0), locations.in_at(1), locations.out());
        let ty = instruction.ty.kind();

        if false_value == true_value {
            self.move_location(out, false_value, ty);
            return;
        }

        let condition = instruction.input(2);
        let condition_location = locations.in_at(2);
        let cond = if condition_location.is_constant() {
            let chosen = if self.int_value(condition_location) != 0 {
                true_value
            } else {
                false_value
            };
            self.move_location(out, chosen, ty);
            return;
        } else if graph.inst(condition).emitted_at_use_site {
            match self.generate_test(condition) {
                Test::Flags(cond) => cond,
                Test::Constant(value) => {
                    let chosen = if value { true_value } else { false_value };
                    self.move_location(out, chosen, ty);
                    return;
                }
            }
        } else {
            self.masm.cmp_const(reg(condition_location), 0);
            Cond::NE
        };

        match ty {
            DataType::Int64 => {
                self.masm.it_block(cond, &[true, false, false]);
                self.masm.mov_reg16(low_reg(out), low_reg(true_value));
                self.masm.mov_reg16(high_reg(out), high_reg(true_value));
                self.masm.mov_reg16(low_reg(out), low_reg(false_value));
                self.masm.mov_reg16(high_reg(out), high_reg(false_value));
            }
            DataType::Float32 => {
                self.masm.ite(cond);
                self.masm.vmov_s(sreg(out), sreg(true_value));
                self.masm.vmov_s(sreg(out), sreg(false_value));
            }
            DataType::Float64 => {
                self.masm.ite(cond);
                self.masm.vmov_d(dreg(out), dreg(true_value));
                self.masm.vmov_d(dreg(out), dreg(false_value));
            }
            _ => {
                let out = reg(out);
                self.masm.ite(cond);
                if true_value.is_constant() {
                    let value = self.int_value(true_value) as u32;
                    if out.is_low() {
                        self.masm.movs_imm8(out, value);
                    } else {
                        self.masm.mov_w_imm(false, out, value);
                    }
                } else {
                    self.masm.mov_reg16(out, reg(true_value));
                }
                self.masm.mov_reg16(out, reg(false_value));
            }
        }
    }

    pub(crate) fn visit_packed_switch(&mut self, inst: InstId, start_value: i32, num_entries: u32) {
        let graph = self.graph;
        let locations = self.locations_of(inst);
        let value = reg(locations.in_at(0));
        let successors = graph.block(graph.inst(inst).block).successors.clone();
        let default_block = successors[num_entries as usize];
        let labels: Vec<_> = successors[..num_entries as usize]
            .iter()
            .map(|&block| self.block_label(block))
            .collect();

        if num_entries <= PACKED_SWITCH_COMPARE_JUMP_THRESHOLD {
            self.generate_switch_cascade(value, start_value, &labels);
        } else {
            self.generate_switch_table(
                value,
                start_value,
                &labels,
                (reg(locations.temp(0)), reg(locations.temp(1))),
                default_block,
            );
            return;
        }

        if !self.goes_to_next_block(default_block) {
            let label = self.block_label(default_block);
            self.masm.b(label);
        }
    }

    /// Compares against two cases per subtraction: after `key -= 2` the
    /// borrow selects the odd case and zero the even one.
    fn generate_switch_cascade(&mut self, value: Register, start_value: i32, labels: &[tern_asm::Label]) {
        let count = labels.len();
        if count == 0 {
            return;
        }
        let temp = self.masm.scratch();
        self.masm
            .add_constant_set_flags(*temp, value, start_value.wrapping_neg());
        self.masm.b_cond(Cond::EQ, labels[0]);

        let mut last = 0;
        while count - last > 2 {
            self.masm.add_constant_set_flags(*temp, *temp, -2);
            self.masm.b_cond(Cond::LO, labels[last + 1]);
            self.masm.b_cond(Cond::EQ, labels[last + 2]);
            last += 2;
        }
        if count - last == 2 {
            self.masm.cmp_w_imm(*temp, 1);
            self.masm.b_cond(Cond::EQ, labels[last + 1]);
        }
    }

    fn generate_switch_table(
        &mut self,
        value: Register,
        start_value: i32,
        labels: &[tern_asm::Label],
        (table_base, target): (Register, Register),
        default_block: BlockId,
    ) {
        let key = if start_value != 0 {
            self.masm
                .add_constant(target, value, start_value.wrapping_neg());
            target
        } else {
            value
        };
        let default_label = self.block_label(default_block);
        self.masm.cmp_const(key, labels.len() as i32 - 1);
        self.masm.b_cond(Cond::HI, default_label);

        let table = self.masm.create_label();
        {
            let mut scope = self.masm.exact_scope(14, ScopeSize::Exact);
            scope.adr(table_base, table);
            scope.ldr_reg(LoadKind::Word, target, table_base, key, 2);
            scope.dp_reg(DataOp::Add, false, table_base, table_base, target, Shift::LSL, 0);
            scope.bx(table_base);
        }
        self.masm.block_literal_pool();
        self.masm.align(4);
        self.masm.bind_label(table);
        for &label in labels {
            self.masm.emit_jump_table_entry(table, label);
        }
        self.masm.release_literal_pool();
    }

    pub(crate) fn visit_return(&mut self, _inst: InstId) {
        // The value already sits in the return register.
        self.generate_frame_exit();
    }

    pub(crate) fn visit_suspend_check(&mut self, inst: InstId) {
        let graph = self.graph;
        let block = graph.inst(inst).block;
        let info = graph.block(block);
        if info.is_loop_header && info.loop_suspend_check == Some(inst) {
            // Emitted at the back edges.
            return;
        }
        if graph.is_entry_block(block) {
            if let Some(next) = graph.next_instruction(inst) {
                if matches!(graph.kind(next), InstructionKind::Goto) {
                    return;
                }
            }
        }
        self.generate_suspend_check(inst, None);
    }

    /// Polls the thread flags. With a successor the check ends the block and
    /// branches there; otherwise execution continues behind it.
    pub(crate) fn generate_suspend_check(&mut self, inst: InstId, successor: Option<BlockId>) {
        if self.options.implicit_suspend_checks {
            let pc = {
                let temp = self.masm.scratch();
                self.masm
                    .load_from_offset(LoadKind::Word, *temp, TR, thread::SUSPEND_TRIGGER_OFFSET);
                let mut scope = self.masm.exact_scope(2, ScopeSize::Exact);
                let pc = scope.position() as u32;
                scope.ldr16_imm(LoadKind::Word, *temp, *temp, 0);
                pc
            };
            self.record_pc_info(Some(inst), pc, None);
            if let Some(block) = successor {
                if !self.goes_to_next_block(block) {
                    let label = self.block_label(block);
                    self.masm.b(label);
                }
            }
            return;
        }

        let idx = match (successor, self.suspend_check_paths.get(&inst)) {
            (Some(_), Some(&idx)) => idx,
            _ => {
                let idx = self.add_slow_path(SlowPathKind::SuspendCheck { successor }, Some(inst));
                if successor.is_some() {
                    self.suspend_check_paths.insert(inst, idx);
                }
                idx
            }
        };
        let entry = self.slow_path_entry(idx);

        {
            let temp = self.masm.scratch();
            self.masm
                .load_from_offset(LoadKind::Word, *temp, TR, thread::FLAGS_OFFSET);
            self.masm
                .tst_w_imm(*temp, thread::SUSPEND_OR_CHECKPOINT_REQUEST);
        }

        match successor {
            None => {
                self.masm.b_cond(Cond::NE, entry);
                let exit = self.slow_path_exit(idx);
                self.masm.bind_label(exit);
            }
            Some(block) => {
                let label = self.block_label(block);
                self.masm.b_cond(Cond::EQ, label);
                self.masm.b(entry);
            }
        }
    }

    pub(crate) fn generate_memory_barrier(&mut self, kind: MemBarrierKind) {
        let option = match kind {
            MemBarrierKind::StoreStore => BarrierOption::IshSt,
            MemBarrierKind::AnyStore | MemBarrierKind::LoadAny | MemBarrierKind::AnyAny => BarrierOption::Ish,
        };
        self.masm.dmb(option);
    }

    /// Calls the method tracing hooks when the thread has a trace buffer.
    pub(crate) fn visit_method_entry_exit_hook(&mut self, inst: InstId) {
        let idx = self.add_slow_path(SlowPathKind::MethodEntryExitHook, Some(inst));
        let entry = self.slow_path_entry(idx);
        let exit = self.slow_path_exit(idx);
        {
            let temp = self.masm.scratch();
            self.masm
                .load_from_offset(LoadKind::Word, *temp, TR, thread::METHOD_TRACE_BUFFER_OFFSET);
            self.masm.cmp_w_imm(*temp, 0);
        }
        self.masm.b_cond(Cond::NE, entry);
        self.masm.bind_label(exit);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arm::masm::ArmMacroAssembler;
    use crate::arm::test_util::{fixed, halfwords, lower, method_graph};
    use crate::hir::Graph;
    use crate::options::CompilerOptions;
    use tern_asm::thumb2::{IP, R0, R1, R2, R3, R4};

    fn condition(graph: &mut Graph, block: BlockId, cond: IfCondition, lhs: InstId, rhs: InstId) -> InstId {
        graph.add(
            block,
            InstructionKind::Condition {
                cond,
                bias: ComparisonBias::NoBias,
            },
            DataType::Bool,
            &[lhs, rhs],
        )
    }

    #[test]
    fn test_packed_switch_cascade() {
        let (mut graph, entry) = method_graph();
        let cases: Vec<BlockId> = (0..4).map(|_| graph.add_block()).collect();
        let value = graph.add(entry, InstructionKind::IntConstant(0), DataType::Int32, &[]);
        let switch = graph.add(
            entry,
            InstructionKind::PackedSwitch {
                start_value: 0,
                num_entries: 3,
            },
            DataType::Void,
            &[value],
        );
        for &case in &cases {
            graph.add_edge(entry, case);
        }
        graph.inst_mut(switch).locations = Some(fixed(&[Location::Register(4)], Location::NoLocation));

        let lowered = lower(&graph, &CompilerOptions::default(), &[switch]);

        // ADDS ip, r4, #0; BEQ S0; SUBS ip, ip, #2; BLO S1; BEQ S2; B default
        let mut expected = ArmMacroAssembler::new(false);
        let labels: Vec<_> = (0..4).map(|_| expected.create_label()).collect();
        expected.dp_imm(DataOp::Add, true, IP, R4, 0);
        expected.b_cond(Cond::EQ, labels[0]);
        expected.dp_imm(DataOp::Sub, true, IP, IP, 2);
        expected.b_cond(Cond::LO, labels[1]);
        expected.b_cond(Cond::EQ, labels[2]);
        expected.b(labels[3]);
        for label in labels {
            expected.bind_label(label);
        }
        assert_eq!(lowered.code, halfwords(expected));
    }

    #[test]
    fn test_packed_switch_table_above_threshold() {
        let (mut graph, entry) = method_graph();
        let cases: Vec<BlockId> = (0..9).map(|_| graph.add_block()).collect();
        let value = graph.add(entry, InstructionKind::IntConstant(0), DataType::Int32, &[]);
        let switch = graph.add(
            entry,
            InstructionKind::PackedSwitch {
                start_value: 0,
                num_entries: 8,
            },
            DataType::Void,
            &[value],
        );
        for &case in &cases {
            graph.add_edge(entry, case);
        }
        let mut summary = fixed(&[Location::Register(1)], Location::NoLocation);
        summary.add_temp(Location::Register(2));
        summary.add_temp(Location::Register(3));
        graph.inst_mut(switch).locations = Some(summary);

        let lowered = lower(&graph, &CompilerOptions::default(), &[switch]);
        // cmp r1, #7; bhi default; adr; ldr; add; bx; then a word aligned
        // table of eight entries.
        let body = lowered.body();
        assert_eq!(body[0], 0x2907);
        // 1 + 2 + 7 halfwords of code end word aligned, then 8 words.
        assert_eq!(body.len(), 10 + 16);
        assert_eq!(body[9], 0x4710);
        // Entries hold the Thumb target relative to the table start.
        let table = &body[10..];
        let first = u32::from(table[0]) | u32::from(table[1]) << 16;
        assert_eq!(first & 1, 1);
    }

    #[test]
    fn test_materialized_condition_uses_it_block() {
        let (mut graph, entry) = method_graph();
        let a = graph.add(entry, InstructionKind::IntConstant(1), DataType::Int32, &[]);
        let b = graph.add(entry, InstructionKind::IntConstant(2), DataType::Int32, &[]);
        let cond = condition(&mut graph, entry, IfCondition::Lt, a, b);
        graph.inst_mut(cond).locations = Some(fixed(
            &[Location::Register(1), Location::Register(2)],
            Location::Register(0),
        ));

        let lowered = lower(&graph, &CompilerOptions::default(), &[cond]);
        let mut expected = ArmMacroAssembler::new(false);
        expected.cmp_reg16(R1, R2);
        expected.load_const(R0, 0);
        expected.it(Cond::LT);
        expected.movs_imm8(R0, 1);
        assert_eq!(lowered.body(), halfwords(expected).as_slice());
    }

    #[test]
    fn test_long_compare_against_extremes_is_trivial() {
        let (mut graph, entry) = method_graph();
        let a = graph.add(entry, InstructionKind::LongConstant(0), DataType::Int64, &[]);
        let min = graph.add(entry, InstructionKind::LongConstant(i64::MIN), DataType::Int64, &[]);
        let max = graph.add(entry, InstructionKind::LongConstant(i64::MAX), DataType::Int64, &[]);
        let lt_min = condition(&mut graph, entry, IfCondition::Lt, a, min);
        let le_max = condition(&mut graph, entry, IfCondition::Le, a, max);
        for (cond, constant) in [(lt_min, min), (le_max, max)] {
            graph.inst_mut(cond).locations = Some(fixed(
                &[Location::register_pair(2, 3), Location::Constant(constant)],
                Location::Register(0),
            ));
        }

        let lowered = lower(&graph, &CompilerOptions::default(), &[lt_min, le_max]);
        // No compare, just the known results.
        let mut expected = ArmMacroAssembler::new(false);
        expected.load_const(R0, 0);
        expected.load_const(R0, 1);
        assert_eq!(lowered.body(), halfwords(expected).as_slice());
    }

    #[test]
    fn test_select_of_same_location_is_empty() {
        let (mut graph, entry) = method_graph();
        let a = graph.add(entry, InstructionKind::IntConstant(1), DataType::Int32, &[]);
        let c = graph.add(entry, InstructionKind::IntConstant(1), DataType::Bool, &[]);
        let select = graph.add(entry, InstructionKind::Select, DataType::Int32, &[a, a, c]);
        graph.inst_mut(select).locations = Some(fixed(
            &[Location::Register(3), Location::Register(3), Location::Register(1)],
            Location::Register(3),
        ));

        let lowered = lower(&graph, &CompilerOptions::default(), &[select]);
        assert!(lowered.body().is_empty());
    }

    #[test]
    fn test_select_on_materialized_boolean() {
        let (mut graph, entry) = method_graph();
        let a = graph.add(entry, InstructionKind::IntConstant(1), DataType::Int32, &[]);
        let b = graph.add(entry, InstructionKind::IntConstant(5), DataType::Int32, &[]);
        let c = graph.add(entry, InstructionKind::IntConstant(1), DataType::Bool, &[]);
        let select = graph.add(entry, InstructionKind::Select, DataType::Int32, &[a, b, c]);
        graph.inst_mut(select).locations = Some(fixed(
            &[Location::Register(1), Location::Register(2), Location::Register(3)],
            Location::Register(0),
        ));

        let lowered = lower(&graph, &CompilerOptions::default(), &[select]);
        let mut expected = ArmMacroAssembler::new(false);
        expected.cmp_imm8(R3, 0);
        expected.ite(Cond::NE);
        expected.mov_reg16(R0, R2);
        expected.mov_reg16(R0, R1);
        assert_eq!(lowered.body(), halfwords(expected).as_slice());
    }

    #[test]
    fn test_suspend_check_polls_thread_flags() {
        let (mut graph, entry) = method_graph();
        let check = graph.add(entry, InstructionKind::SuspendCheck, DataType::Void, &[]);
        let _ret = graph.add(entry, InstructionKind::ReturnVoid, DataType::Void, &[]);
        graph.inst_mut(check).locations = Some(crate::arm::test_util::fixed_with_slow_path(&[], Location::NoLocation));

        let lowered = lower(&graph, &CompilerOptions::default(), &[check]);
        assert_eq!(lowered.slow_paths, 1);
        let mut expected = ArmMacroAssembler::new(false);
        let slow = expected.create_label();
        expected.ldr_imm(LoadKind::Word, IP, TR, thread::FLAGS_OFFSET);
        expected.tst_w_imm(IP, thread::SUSPEND_OR_CHECKPOINT_REQUEST);
        expected.b_cond(Cond::NE, slow);
        expected.bind_label(slow);
        assert_eq!(lowered.body(), &halfwords(expected)[..lowered.body_len]);
    }

    #[test]
    fn test_if_falls_through_to_true_successor() {
        let (mut graph, entry) = method_graph();
        let then_block = graph.add_block();
        let else_block = graph.add_block();
        graph.linear_order = vec![entry, then_block, else_block];
        let a = graph.add(entry, InstructionKind::IntConstant(1), DataType::Int32, &[]);
        let b = graph.add(entry, InstructionKind::IntConstant(2), DataType::Int32, &[]);
        let cond = condition(&mut graph, entry, IfCondition::Eq, a, b);
        graph.inst_mut(cond).emitted_at_use_site = true;
        let branch = graph.add(entry, InstructionKind::If, DataType::Void, &[cond]);
        graph.add_edge(entry, then_block);
        graph.add_edge(entry, else_block);
        graph.inst_mut(cond).locations = Some(fixed(
            &[Location::Register(0), Location::Register(1)],
            Location::NoLocation,
        ));
        graph.inst_mut(branch).locations = Some(fixed(&[Location::NoLocation], Location::NoLocation));

        let lowered = lower(&graph, &CompilerOptions::default(), &[branch]);
        let mut expected = ArmMacroAssembler::new(false);
        let target = expected.create_label();
        expected.cmp_reg16(R0, R1);
        expected.b_cond(Cond::NE, target);
        expected.bind_label(target);
        assert_eq!(lowered.body(), halfwords(expected).as_slice());
    }

    #[test]
    fn test_fp_conditions_with_gt_bias() {
        assert_eq!(fp_cond(IfCondition::Lt, true), Cond::LO);
        assert_eq!(fp_cond(IfCondition::Gt, true), Cond::HI);
        assert_eq!(fp_cond(IfCondition::Lt, false), Cond::LT);
        assert_eq!(fp_cond(IfCondition::Eq, true), Cond::EQ);
    }

    #[test]
    fn test_long_less_than_uses_sbcs() {
        let (mut graph, entry) = method_graph();
        let a = graph.add(entry, InstructionKind::LongConstant(1), DataType::Int64, &[]);
        let b = graph.add(entry, InstructionKind::LongConstant(2), DataType::Int64, &[]);
        let cond = condition(&mut graph, entry, IfCondition::Gt, a, b);
        graph.inst_mut(cond).locations = Some(fixed(
            &[Location::register_pair(0, 1), Location::register_pair(2, 3)],
            Location::Register(4),
        ));

        let lowered = lower(&graph, &CompilerOptions::default(), &[cond]);
        let mut expected = ArmMacroAssembler::new(false);
        expected.cmp_reg16(R2, R0);
        expected.dp_reg(DataOp::Sbc, true, IP, R3, R1, Shift::LSL, 0);
        expected.load_const(R4, 0);
        expected.it(Cond::LT);
        expected.movs_imm8(R4, 1);
        assert_eq!(lowered.body(), halfwords(expected).as_slice());
    }
}
