//! Field and array accesses, null/bounds/zero checks and card marking.

use tern_asm::thumb2::{Cond, DataOp, LoadKind, Register, Shift, StoreKind};

use crate::arm::codegen::CodeGeneratorArm;
use crate::arm::masm::ScopeSize;
use crate::arm::slow_paths::SlowPathKind;
use crate::arm::{dreg, high_reg, low_reg, reg, sreg, TR};
use crate::hir::{DataType, FieldInfo, InstId, InstructionKind, MemBarrierKind};
use crate::locations::Location;
use crate::runtime::{card_table, class, object, thread};

/// Accesses at or beyond this offset may miss the protected zero page.
const IMPLICIT_NULL_CHECK_MAX_OFFSET: u32 = 4096;

pub(crate) fn load_kind(ty: DataType) -> LoadKind {
    match ty {
        DataType::Bool | DataType::Uint8 => LoadKind::UnsignedByte,
        DataType::Int8 => LoadKind::SignedByte,
        DataType::Uint16 => LoadKind::UnsignedHalf,
        DataType::Int16 => LoadKind::SignedHalf,
        DataType::Int32 | DataType::Uint32 | DataType::Reference => LoadKind::Word,
        other => panic!("no core load for {:?}", other),
    }
}

pub(crate) fn store_kind(ty: DataType) -> StoreKind {
    match ty {
        DataType::Bool | DataType::Uint8 | DataType::Int8 => StoreKind::Byte,
        DataType::Uint16 | DataType::Int16 => StoreKind::Half,
        DataType::Int32 | DataType::Uint32 | DataType::Reference => StoreKind::Word,
        other => panic!("no core store for {:?}", other),
    }
}

/// Whether an access of `ty` at `offset` is a single instruction that
/// faults on a null base.
fn is_single_access(ty: DataType, offset: u32) -> bool {
    if ty.is_64bit() || ty.is_floating_point() {
        offset % 4 == 0 && offset <= 1020
    } else {
        offset < IMPLICIT_NULL_CHECK_MAX_OFFSET
    }
}

impl<'a> CodeGeneratorArm<'a> {
    // Null checks.

    pub(crate) fn visit_null_check(&mut self, inst: InstId) {
        if self.options.implicit_null_checks {
            if self.can_fold_null_check(inst) {
                self.pending_null_check = Some(inst);
                return;
            }
            self.generate_implicit_null_check(inst);
        } else {
            self.generate_explicit_null_check(inst);
        }
    }

    /// The next instruction faults on a null `obj` with its first access.
    fn can_fold_null_check(&self, inst: InstId) -> bool {
        let graph = self.graph;
        let obj = graph.inst(inst).input(0);
        let mut next = graph.next_instruction(inst);
        while let Some(candidate) = next {
            if !matches!(graph.kind(candidate), InstructionKind::ParallelMove(_)) {
                break;
            }
            next = graph.next_instruction(candidate);
        }
        let user = match next {
            Some(user) => graph.inst(user),
            None => return false,
        };
        // Users see either the checked value or the check itself.
        if !matches!(user.inputs.first(), Some(&first) if first == obj || first == inst) {
            return false;
        }
        match &user.kind {
            InstructionKind::InstanceFieldGet(info) | InstructionKind::InstanceFieldSet(info) => {
                is_single_access(info.field_type, info.offset)
            }
            InstructionKind::ArrayLength | InstructionKind::InvokeVirtual(..) | InstructionKind::InvokeInterface(..) => {
                true
            }
            _ => false,
        }
    }

    fn generate_implicit_null_check(&mut self, inst: InstId) {
        let obj = reg(self.locations_of(inst).in_at(0));
        let temp = self.masm.scratch();
        let pc = {
            let mut scope = self.masm.exact_scope(4, ScopeSize::Exact);
            let pc = scope.position() as u32;
            scope.ldr_imm(LoadKind::Word, *temp, obj, 0);
            pc
        };
        drop(temp);
        self.record_pc_info(Some(inst), pc, None);
    }

    fn generate_explicit_null_check(&mut self, inst: InstId) {
        let obj = reg(self.locations_of(inst).in_at(0));
        let idx = self.add_shared_slow_path(SlowPathKind::NullCheck, inst);
        let entry = self.slow_path_entry(idx);
        self.masm.compare_and_branch(obj, false, entry, true);
    }

    // Zero and bounds checks.

    pub(crate) fn visit_div_zero_check(&mut self, inst: InstId) {
        let value = self.locations_of(inst).in_at(0);
        let ty = self.graph.inst(self.graph.inst(inst).input(0)).ty.kind();

        if value.is_constant() {
            if self.int_value(value) == 0 {
                let idx = self.add_shared_slow_path(SlowPathKind::DivZeroCheck, inst);
                let entry = self.slow_path_entry(idx);
                self.masm.b(entry);
            }
            return;
        }

        let idx = self.add_shared_slow_path(SlowPathKind::DivZeroCheck, inst);
        let entry = self.slow_path_entry(idx);
        if ty == DataType::Int64 {
            let temp = self.masm.scratch();
            self.masm
                .dp_reg(DataOp::Orr, true, *temp, low_reg(value), high_reg(value), Shift::LSL, 0);
            drop(temp);
            self.masm.b_cond(Cond::EQ, entry);
        } else {
            self.masm.compare_and_branch(reg(value), false, entry, true);
        }
    }

    /// Unsigned compare of index against length, so negative indexes fail
    /// as well.
    pub(crate) fn visit_bounds_check(&mut self, inst: InstId) {
        let locations = self.locations_of(inst);
        let index = locations.in_at(0);
        let length = locations.in_at(1);

        match (index.is_constant(), length.is_constant()) {
            (true, true) => {
                let index = self.int_value(index) as u32;
                let length = self.int_value(length) as u32;
                if index >= length {
                    let idx = self.add_shared_slow_path(SlowPathKind::BoundsCheck, inst);
                    let entry = self.slow_path_entry(idx);
                    self.masm.b(entry);
                }
            }
            (false, true) => {
                let length = self.int_value(length) as i32;
                self.masm.cmp_const(reg(index), length);
                self.branch_to_bounds_check(inst, Cond::HS);
            }
            (true, false) => {
                let index = self.int_value(index) as i32;
                self.masm.cmp_const(reg(length), index);
                self.branch_to_bounds_check(inst, Cond::LS);
            }
            (false, false) => {
                self.masm.cmp_reg16(reg(index), reg(length));
                self.branch_to_bounds_check(inst, Cond::HS);
            }
        }
    }

    fn branch_to_bounds_check(&mut self, inst: InstId, cond: Cond) {
        let idx = self.add_shared_slow_path(SlowPathKind::BoundsCheck, inst);
        let entry = self.slow_path_entry(idx);
        self.masm.b_cond(cond, entry);
    }

    // Fields.

    pub(crate) fn visit_field_get(&mut self, inst: InstId, info: FieldInfo) {
        let locations = self.locations_of(inst);
        let base = reg(locations.in_at(0));
        let out = locations.out();
        let offset = info.offset as i32;
        let ty = info.field_type;
        let wide_atomic = info.is_volatile && ty.is_64bit() && !self.options.features.atomic_ldrd_strd();

        match ty.kind() {
            DataType::Reference => self.generate_reference_field_load(inst, reg(out), base, offset),
            DataType::Int64 if wide_atomic => {
                let pc = self.generate_wide_atomic_load(base, offset, low_reg(out), high_reg(out));
                self.record_implicit_null_check(pc);
            }
            DataType::Float64 if wide_atomic => {
                let lo = reg(locations.temp(0));
                let hi = reg(locations.temp(1));
                let pc = self.generate_wide_atomic_load(base, offset, lo, hi);
                self.record_implicit_null_check(pc);
                self.masm.vmov_drr(dreg(out), lo, hi);
            }
            _ => {
                let pc = self.masm.position() as u32;
                self.load_value(ty, out, base, offset);
                self.record_implicit_null_check(pc);
            }
        }

        if info.is_volatile {
            self.generate_memory_barrier(MemBarrierKind::LoadAny);
        }
    }

    /// `out = *(base + offset)` for a reference field, with whatever read
    /// barrier the options ask for.
    fn generate_reference_field_load(&mut self, inst: InstId, out: Register, base: Register, offset: i32) {
        if self.options.emit_read_barrier && self.options.use_baker_read_barrier {
            self.generate_field_load_with_baker_read_barrier(out, base, offset);
            return;
        }
        let pc = self.masm.position() as u32;
        self.masm.load_from_offset(LoadKind::Word, out, base, offset);
        self.record_implicit_null_check(pc);
        self.maybe_generate_read_barrier_slow(
            inst,
            Location::Register(out.code() as u8),
            Location::Register(base.code() as u8),
            offset as u32,
            Location::NoLocation,
        );
    }

    pub(crate) fn visit_field_set(&mut self, inst: InstId, info: FieldInfo) {
        let locations = self.locations_of(inst);
        let base = reg(locations.in_at(0));
        let value = locations.in_at(1);
        let offset = info.offset as i32;
        let ty = info.field_type;
        let wide_atomic = info.is_volatile && ty.is_64bit() && !self.options.features.atomic_ldrd_strd();

        if info.is_volatile {
            self.generate_memory_barrier(MemBarrierKind::AnyStore);
        }

        match ty.kind() {
            DataType::Reference => {
                let source = if self.options.heap_poisoning {
                    let temp = reg(locations.temp(0));
                    self.masm.mov(temp, reg(value));
                    self.maybe_poison(temp);
                    temp
                } else {
                    reg(value)
                };
                let pc = self.masm.position() as u32;
                self.masm.store_to_offset(StoreKind::Word, source, base, offset);
                self.record_implicit_null_check(pc);
            }
            DataType::Int64 if wide_atomic => {
                let pc = self.generate_wide_atomic_store(
                    base,
                    offset,
                    low_reg(value),
                    high_reg(value),
                    reg(locations.temp(0)),
                    reg(locations.temp(1)),
                );
                self.record_implicit_null_check(pc);
            }
            DataType::Float64 if wide_atomic => {
                let lo = reg(locations.temp(2));
                let hi = reg(locations.temp(3));
                self.masm.vmov_rrd(lo, hi, dreg(value));
                let pc = self.generate_wide_atomic_store(
                    base,
                    offset,
                    lo,
                    hi,
                    reg(locations.temp(0)),
                    reg(locations.temp(1)),
                );
                self.record_implicit_null_check(pc);
            }
            _ => {
                let pc = self.masm.position() as u32;
                self.store_value(ty, value, base, offset);
                self.record_implicit_null_check(pc);
            }
        }

        if ty.is_reference() {
            self.mark_gc_card(
                reg(locations.temp(0)),
                reg(locations.temp(1)),
                base,
                reg(value),
                info.value_can_be_null,
            );
        }

        if info.is_volatile {
            self.generate_memory_barrier(MemBarrierKind::AnyAny);
        }
    }

    /// Single-copy atomic 64-bit load on cores without atomic LDRD.
    /// Returns the offset of the faulting instruction.
    fn generate_wide_atomic_load(&mut self, base: Register, offset: i32, lo: Register, hi: Register) -> u32 {
        let temp = self.masm.scratch();
        let addr = if offset != 0 {
            self.masm.add_constant(*temp, base, offset);
            *temp
        } else {
            base
        };
        let pc = self.masm.position() as u32;
        self.masm.ldrexd(lo, hi, addr);
        pc
    }

    /// Stores `hi:lo` with an LDREXD/STREXD loop; STREXD only succeeds on
    /// the address of the most recent LDREXD.
    fn generate_wide_atomic_store(
        &mut self,
        base: Register,
        offset: i32,
        lo: Register,
        hi: Register,
        temp1: Register,
        temp2: Register,
    ) -> u32 {
        let temp = self.masm.scratch();
        let addr = if offset != 0 {
            self.masm.add_constant(*temp, base, offset);
            *temp
        } else {
            base
        };
        let retry = self.masm.create_and_bind_label();
        let pc = self.masm.position() as u32;
        self.masm.ldrexd(temp1, temp2, addr);
        self.masm.strexd(temp1, lo, hi, addr);
        self.masm.cmp_const(temp1, 0);
        self.masm.b_cond(Cond::NE, retry);
        pc
    }

    fn load_value(&mut self, ty: DataType, out: Location, base: Register, offset: i32) {
        match ty.kind() {
            DataType::Int64 => self
                .masm
                .load_pair_from_offset(low_reg(out), high_reg(out), base, offset),
            DataType::Float32 => self.masm.load_s_from_offset(sreg(out), base, offset),
            DataType::Float64 => self.masm.load_d_from_offset(dreg(out), base, offset),
            _ => self.masm.load_from_offset(load_kind(ty), reg(out), base, offset),
        }
    }

    fn store_value(&mut self, ty: DataType, value: Location, base: Register, offset: i32) {
        match ty.kind() {
            DataType::Int64 => self
                .masm
                .store_pair_to_offset(low_reg(value), high_reg(value), base, offset),
            DataType::Float32 => self.masm.store_s_to_offset(sreg(value), base, offset),
            DataType::Float64 => self.masm.store_d_to_offset(dreg(value), base, offset),
            _ => self.masm.store_to_offset(store_kind(ty), reg(value), base, offset),
        }
    }

    /// Dirties the card of `object` after a reference store of `value`.
    /// The card table base is biased so its low byte is the dirty value.
    pub(crate) fn mark_gc_card(
        &mut self,
        temp: Register,
        card: Register,
        object: Register,
        value: Register,
        value_can_be_null: bool,
    ) {
        let done = self.masm.create_label();
        if value_can_be_null {
            self.masm.compare_and_branch(value, false, done, false);
        }
        self.masm
            .load_from_offset(LoadKind::Word, card, TR, thread::CARD_TABLE_OFFSET);
        self.masm
            .shift_imm_w(Shift::LSR, false, temp, object, card_table::CARD_SHIFT);
        self.masm.str_reg(StoreKind::Byte, card, card, temp, 0);
        self.masm.bind_label(done);
    }

    // Arrays.

    /// Offset of element 0 from the base register of an array access.
    fn array_base_offset(&self, inst: InstId, ty: DataType) -> i32 {
        let array = self.graph.inst(inst).input(0);
        if matches!(self.graph.kind(array), InstructionKind::IntermediateAddress { .. }) {
            0
        } else {
            object::array_data_offset(ty.size_shift())
        }
    }

    pub(crate) fn visit_array_get(&mut self, inst: InstId) {
        let locations = self.locations_of(inst);
        let obj = reg(locations.in_at(0));
        let index = locations.in_at(1);
        let out = locations.out();
        let ty = self.graph.inst(inst).ty;
        let shift = ty.size_shift();
        let data_offset = self.array_base_offset(inst, ty);

        if ty.is_reference() {
            self.generate_reference_array_load(inst, reg(out), obj, data_offset, index);
            return;
        }

        if index.is_constant() {
            let offset = ((self.int_value(index) as i32) << shift).wrapping_add(data_offset);
            self.load_value(ty, out, obj, offset);
            return;
        }

        let index = reg(index);
        let temp = self.masm.scratch();
        match ty.kind() {
            DataType::Int64 | DataType::Float32 | DataType::Float64 => {
                self.masm
                    .dp_reg(DataOp::Add, false, *temp, obj, index, Shift::LSL, shift);
                self.load_value(ty, out, *temp, data_offset);
            }
            _ => {
                let base = if data_offset != 0 {
                    self.masm.add_constant(*temp, obj, data_offset);
                    *temp
                } else {
                    obj
                };
                self.masm.ldr_reg(load_kind(ty), reg(out), base, index, shift);
            }
        }
    }

    fn generate_reference_array_load(
        &mut self,
        inst: InstId,
        out: Register,
        obj: Register,
        data_offset: i32,
        index: Location,
    ) {
        if self.options.emit_read_barrier && self.options.use_baker_read_barrier {
            if index.is_constant() {
                let offset = ((self.int_value(index) as i32) << 2) + data_offset;
                self.generate_field_load_with_baker_read_barrier(out, obj, offset);
            } else {
                let temp = reg(self.locations_of(inst).temp(0));
                self.generate_array_load_with_baker_read_barrier(out, obj, data_offset, reg(index), temp);
            }
            return;
        }

        if index.is_constant() {
            let offset = ((self.int_value(index) as i32) << 2) + data_offset;
            self.masm.load_from_offset(LoadKind::Word, out, obj, offset);
        } else {
            let temp = self.masm.scratch();
            self.masm.add_constant(*temp, obj, data_offset);
            self.masm.ldr_reg(LoadKind::Word, out, *temp, reg(index), 2);
        }
        self.maybe_generate_read_barrier_slow(
            inst,
            Location::Register(out.code() as u8),
            Location::Register(obj.code() as u8),
            data_offset as u32,
            index,
        );
    }

    pub(crate) fn visit_array_set(
        &mut self,
        inst: InstId,
        needs_type_check: bool,
        value_can_be_null: bool,
        static_type_is_object_array: bool,
    ) {
        let locations = self.locations_of(inst);
        let array = reg(locations.in_at(0));
        let index = locations.in_at(1);
        let value = locations.in_at(2);
        let ty = self.graph.inst(self.graph.inst(inst).input(2)).ty;
        let data_offset = self.array_base_offset(inst, ty);

        if !ty.is_reference() {
            self.store_array_element(ty, value, array, index, data_offset);
            return;
        }

        let value_reg = reg(value);
        let temp1 = reg(locations.temp(0));
        let temp2 = reg(locations.temp(1));
        let done = self.masm.create_label();
        let mut slow_path = None;

        if needs_type_check {
            let idx = self.add_slow_path(SlowPathKind::ArraySet, Some(inst));
            let entry = self.slow_path_entry(idx);
            slow_path = Some(idx);

            if value_can_be_null {
                // Null needs neither the type check nor the card mark.
                let non_null = self.masm.create_label();
                self.masm.compare_and_branch(value_reg, true, non_null, false);
                self.store_array_element(ty, value, array, index, data_offset);
                self.masm.b(done);
                self.masm.bind_label(non_null);
            }

            // Poisoned references compare equal iff the references do.
            self.masm
                .load_from_offset(LoadKind::Word, temp1, array, object::CLASS_OFFSET);
            self.maybe_unpoison(temp1);
            self.masm
                .load_from_offset(LoadKind::Word, temp1, temp1, class::COMPONENT_TYPE_OFFSET);
            self.masm
                .load_from_offset(LoadKind::Word, temp2, value_reg, object::CLASS_OFFSET);
            self.masm.cmp_reg16(temp1, temp2);

            if static_type_is_object_array {
                let do_put = self.masm.create_label();
                self.masm.b_cond_near(Cond::EQ, do_put);
                self.maybe_unpoison(temp1);
                self.masm
                    .load_from_offset(LoadKind::Word, temp1, temp1, class::SUPER_CLASS_OFFSET);
                // Only `Object[]` has a component type without a super class.
                self.masm.compare_and_branch(temp1, true, entry, true);
                self.masm.bind_label(do_put);
            } else {
                self.masm.b_cond(Cond::NE, entry);
            }
        }

        let source = if self.options.heap_poisoning {
            self.masm.mov(temp1, value_reg);
            self.maybe_poison(temp1);
            Location::Register(temp1.code() as u8)
        } else {
            value
        };
        self.store_array_element(ty, source, array, index, data_offset);
        self.mark_gc_card(temp1, temp2, array, value_reg, value_can_be_null);

        self.masm.bind_label(done);
        if let Some(idx) = slow_path {
            let exit = self.slow_path_exit(idx);
            self.masm.bind_label(exit);
        }
    }

    fn store_array_element(&mut self, ty: DataType, value: Location, array: Register, index: Location, data_offset: i32) {
        let shift = ty.size_shift();
        if index.is_constant() {
            let offset = ((self.int_value(index) as i32) << shift).wrapping_add(data_offset);
            self.store_value(ty, value, array, offset);
            return;
        }

        let index = reg(index);
        let temp = self.masm.scratch();
        match ty.kind() {
            DataType::Int64 | DataType::Float32 | DataType::Float64 => {
                self.masm
                    .dp_reg(DataOp::Add, false, *temp, array, index, Shift::LSL, shift);
                self.store_value(ty, value, *temp, data_offset);
            }
            _ => {
                let base = if data_offset != 0 {
                    self.masm.add_constant(*temp, array, data_offset);
                    *temp
                } else {
                    array
                };
                self.masm.str_reg(store_kind(ty), reg(value), base, index, shift);
            }
        }
    }

    pub(crate) fn visit_array_length(&mut self, inst: InstId) {
        let locations = self.locations_of(inst);
        let obj = reg(locations.in_at(0));
        let out = reg(locations.out());
        let pc = self.masm.position() as u32;
        self.masm
            .load_from_offset(LoadKind::Word, out, obj, object::ARRAY_LENGTH_OFFSET);
        self.record_implicit_null_check(pc);
    }

    /// `out = array + offset [+ index]`, shared by several element accesses.
    pub(crate) fn visit_intermediate_address(&mut self, inst: InstId, offset: u32) {
        let locations = self.locations_of(inst);
        let first = reg(locations.in_at(0));
        let out = reg(locations.out());
        let offset = offset as i32;

        if locations.inputs.len() < 2 {
            self.masm.add_constant(out, first, offset);
            return;
        }
        let second = locations.in_at(1);
        if second.is_constant() {
            let value = self.int_value(second) as i32;
            self.masm.add_constant(out, first, offset.wrapping_add(value));
        } else {
            self.masm
                .dp_reg(DataOp::Add, false, out, first, reg(second), Shift::LSL, 0);
            self.masm.add_constant(out, out, offset);
        }
    }
}
