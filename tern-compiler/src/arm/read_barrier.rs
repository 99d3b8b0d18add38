//! Read barriers for reference loads.
//!
//! With Baker read barriers every reference load is guarded by the marking
//! register. While the GC marks, the code branches to a thunk picked by the
//! kind of load and its registers. For field and array loads the thunk goes
//! back to the load when the holder is not gray; otherwise, and always for
//! GC roots, it tail-calls the mark entrypoint of the destination register,
//! which performs the load it finds at the return address and marks the
//! result. All kinds share one layout:
//!
//! ```text
//!         ADR   lr, return
//!         CMP   mr, #0
//!         BNE.W thunk
//!         LDR   dest, [...]
//!         RSB   dest, dest, #0      (heap poisoning only)
//! return:
//! ```
//!
//! JIT code carries its thunks behind the method. AOT code branches to a
//! placeholder the linker redirects, using the patch's thunk data.
//!
//! Other read barrier configurations call the runtime from a slow path after
//! every reference load.

use num_enum::{IntoPrimitive, TryFromPrimitive};
use tern_asm::thumb2::{Cond, DataOp, LoadKind, Register, Shift, LR};
use tern_asm::Label;

use crate::arm::codegen::CodeGeneratorArm;
use crate::arm::masm::ScopeSize;
use crate::arm::slow_paths::SlowPathKind;
use crate::arm::{reg, MR, TR};
use crate::hir::InstId;
use crate::locations::Location;
use crate::runtime::{object, read_barrier_mark_entrypoint_offset};

/// Bytes from the patched `BNE` to the reference load.
pub const BNE_TO_LDR_DISTANCE: u32 = 4;

#[derive(Copy, Clone, PartialEq, Eq, Debug, TryFromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum BakerReadBarrierKind {
    Field = 0,
    Array = 1,
    GcRoot = 2,
}

/// What a thunk needs to know about the load it guards. Encoded into the
/// `BakerReadBarrierBranch` patch and used as the JIT thunk key.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct BakerReadBarrierData {
    pub kind: BakerReadBarrierKind,
    pub base: u8,
    /// The holder for field loads, the index for array loads.
    pub holder_or_index: u8,
    pub dest: u8,
    /// The load is a 16-bit instruction.
    pub narrow: bool,
    /// The load is followed by an unpoisoning `RSB`.
    pub poisoned: bool,
}

impl BakerReadBarrierData {
    pub fn encode(&self) -> u32 {
        u32::from(self.kind)
            | (self.base as u32) << 2
            | (self.holder_or_index as u32) << 6
            | (self.dest as u32) << 10
            | (self.narrow as u32) << 14
            | (self.poisoned as u32) << 15
    }

    pub fn decode(data: u32) -> Option<BakerReadBarrierData> {
        if data >> 16 != 0 {
            return None;
        }
        let kind = BakerReadBarrierKind::try_from(data & 0b11).ok()?;
        let data = BakerReadBarrierData {
            kind,
            base: (data >> 2 & 0xf) as u8,
            holder_or_index: (data >> 6 & 0xf) as u8,
            dest: (data >> 10 & 0xf) as u8,
            narrow: data >> 14 & 1 != 0,
            poisoned: data >> 15 & 1 != 0,
        };
        if data.kind == BakerReadBarrierKind::Array && data.narrow {
            return None;
        }
        Some(data)
    }

    pub fn ldr_size(&self) -> u32 {
        if self.narrow {
            2
        } else {
            4
        }
    }

    /// Offset of the reference load from the return address in LR.
    pub fn ldr_offset(&self) -> i32 {
        let poison = if self.poisoned { 4 } else { 0 };
        -((self.ldr_size() + poison) as i32)
    }
}

#[derive(Copy, Clone, Debug)]
enum ReferenceLoad {
    Offset { base: Register, offset: i32 },
    /// `[base, index, LSL #2]`
    Indexed { base: Register, index: Register },
}

impl<'a> CodeGeneratorArm<'a> {
    /// `dest = *(base + offset)` for a field (or constant index element) load.
    pub(crate) fn generate_field_load_with_baker_read_barrier(&mut self, dest: Register, base: Register, offset: i32) {
        let data = BakerReadBarrierData {
            kind: BakerReadBarrierKind::Field,
            base: base.code() as u8,
            holder_or_index: base.code() as u8,
            dest: dest.code() as u8,
            narrow: self.masm.can_use_ldr16(LoadKind::Word, dest, base, offset),
            poisoned: self.options.heap_poisoning,
        };
        let pc = self.generate_baker_read_barrier_load(data, dest, ReferenceLoad::Offset { base, offset });
        self.record_implicit_null_check(pc);
    }

    /// `dest = obj[index]` with `temp` holding the address of element 0,
    /// from which the thunk finds the array's lock word.
    pub(crate) fn generate_array_load_with_baker_read_barrier(
        &mut self,
        dest: Register,
        obj: Register,
        data_offset: i32,
        index: Register,
        temp: Register,
    ) {
        self.masm.add_constant(temp, obj, data_offset);
        let data = BakerReadBarrierData {
            kind: BakerReadBarrierKind::Array,
            base: temp.code() as u8,
            holder_or_index: index.code() as u8,
            dest: dest.code() as u8,
            narrow: false,
            poisoned: self.options.heap_poisoning,
        };
        self.generate_baker_read_barrier_load(data, dest, ReferenceLoad::Indexed { base: temp, index });
    }

    /// `root = *(obj + offset)` for a GC root, which is never poisoned.
    pub(crate) fn generate_gc_root_field_load(
        &mut self,
        inst: InstId,
        root: Register,
        obj: Register,
        offset: i32,
        with_read_barrier: bool,
    ) {
        if !(with_read_barrier && self.options.emit_read_barrier) {
            self.masm.load_from_offset(LoadKind::Word, root, obj, offset);
            return;
        }
        if self.options.use_baker_read_barrier {
            let data = BakerReadBarrierData {
                kind: BakerReadBarrierKind::GcRoot,
                base: obj.code() as u8,
                holder_or_index: obj.code() as u8,
                dest: root.code() as u8,
                narrow: self.masm.can_use_ldr16(LoadKind::Word, root, obj, offset),
                poisoned: false,
            };
            self.generate_baker_read_barrier_load(data, root, ReferenceLoad::Offset { base: obj, offset });
            return;
        }

        // The runtime reads the root through its address.
        self.masm.add_constant(root, obj, offset);
        let location = Location::Register(root.code() as u8);
        let idx = self.add_slow_path(
            SlowPathKind::ReadBarrierForRoot {
                out: location,
                root: location,
            },
            Some(inst),
        );
        let entry = self.slow_path_entry(idx);
        let exit = self.slow_path_exit(idx);
        self.masm.b(entry);
        self.masm.bind_label(exit);
    }

    /// Emits the guarded load and returns the offset of the `LDR`.
    fn generate_baker_read_barrier_load(
        &mut self,
        data: BakerReadBarrierData,
        dest: Register,
        load: ReferenceLoad,
    ) -> u32 {
        let custom_data = data.encode();
        let is_jit = self.options.is_jit;
        let bne_label = self.masm.create_label();
        let ret = self.masm.create_label();
        let target = if is_jit {
            self.baker_thunk_label(custom_data)
        } else {
            self.masm.create_label()
        };

        let poison_size = if data.poisoned { 4 } else { 0 };
        let size = 4 + 4 + BNE_TO_LDR_DISTANCE + data.ldr_size() + poison_size;
        let ldr_pc = {
            let mut scope = self.masm.exact_scope(size as usize, ScopeSize::Exact);
            scope.adr_code(LR, ret);
            scope.cmp_w_imm(MR, 0);
            scope.bind_label(bne_label);
            let bne_pc = scope.position() as u32;
            scope.b_cond(Cond::NE, target);
            if !is_jit {
                scope.bind_label(target);
            }
            let ldr_pc = scope.position() as u32;
            debug_assert_eq!(ldr_pc - bne_pc, BNE_TO_LDR_DISTANCE);
            match load {
                ReferenceLoad::Offset { base, offset } => scope.ldr_imm(LoadKind::Word, dest, base, offset),
                ReferenceLoad::Indexed { base, index } => scope.ldr_reg(LoadKind::Word, dest, base, index, 2),
            }
            if data.poisoned {
                scope.dp_imm(DataOp::Rsb, false, dest, dest, 0);
            }
            scope.bind_label(ret);
            debug_assert_eq!(scope.position() as i32 + data.ldr_offset(), ldr_pc as i32);
            ldr_pc
        };
        self.patches.add_baker_read_barrier(bne_label, custom_data);
        ldr_pc
    }

    fn baker_thunk_label(&mut self, custom_data: u32) -> Label {
        if let Some(&(_, label)) = self.baker_thunks.iter().find(|&&(data, _)| data == custom_data) {
            return label;
        }
        let label = self.masm.create_label();
        self.baker_thunks.push((custom_data, label));
        label
    }

    pub(crate) fn emit_baker_thunks(&mut self) {
        for idx in 0..self.baker_thunks.len() {
            let (custom_data, label) = self.baker_thunks[idx];
            let data = BakerReadBarrierData::decode(custom_data).expect("thunk data encoded by this code generator");
            self.masm.comment(|| format!("BakerReadBarrierThunk {:#x}", custom_data));
            self.masm.bind_label(label);
            self.emit_baker_thunk(data);
        }
    }

    fn emit_baker_thunk(&mut self, data: BakerReadBarrierData) {
        if data.kind != BakerReadBarrierKind::GcRoot {
            let (holder, lock_word_offset) = if data.kind == BakerReadBarrierKind::Field {
                (Register::new(data.holder_or_index), object::MONITOR_OFFSET)
            } else {
                (Register::new(data.base), object::MONITOR_OFFSET - object::array_data_offset(2))
            };
            let gray = self.masm.create_label();
            let temp = self.masm.scratch();
            self.masm
                .load_from_offset(LoadKind::Word, *temp, holder, lock_word_offset);
            // Read barrier state bit into N.
            self.masm.shift_imm_w(
                Shift::LSL,
                true,
                *temp,
                *temp,
                31 - object::LOCK_WORD_READ_BARRIER_STATE_SHIFT,
            );
            self.masm.b_cond(Cond::MI, gray);
            self.masm
                .dp_imm(DataOp::Sub, false, LR, LR, data.ldr_offset().unsigned_abs());
            self.masm.bx(LR);
            self.masm.bind_label(gray);
        }
        let temp = self.masm.scratch();
        self.masm
            .load_from_offset(LoadKind::Word, *temp, TR, read_barrier_mark_entrypoint_offset(data.dest));
        self.masm.bx(*temp);
    }

    /// Non-Baker read barrier for a reference just loaded into `out`.
    pub(crate) fn generate_read_barrier_slow(
        &mut self,
        inst: InstId,
        out: Location,
        reference: Location,
        obj: Location,
        offset: u32,
        index: Location,
    ) {
        let idx = self.add_slow_path(
            SlowPathKind::ReadBarrierForHeapReference {
                out,
                reference,
                obj,
                offset,
                index,
            },
            Some(inst),
        );
        let entry = self.slow_path_entry(idx);
        let exit = self.slow_path_exit(idx);
        self.masm.b(entry);
        self.masm.bind_label(exit);
    }

    pub(crate) fn maybe_generate_read_barrier_slow(
        &mut self,
        inst: InstId,
        out: Location,
        obj: Location,
        offset: u32,
        index: Location,
    ) {
        if self.options.emit_read_barrier {
            self.generate_read_barrier_slow(inst, out, out, obj, offset, index);
        } else {
            self.maybe_unpoison(reg(out));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arm::masm::ArmMacroAssembler;
    use crate::arm::test_util::{fixed, halfwords, lower, method_graph, Lowered};
    use crate::hir::{DataType, FieldInfo, InstructionKind, LoadClassInfo, LoadClassKind};
    use crate::linker_patch::LinkerPatchKind;
    use crate::options::CompilerOptions;
    use tern_asm::thumb2::{IP, R0, R1};

    fn reference_field(offset: u32) -> FieldInfo {
        FieldInfo {
            offset,
            field_type: DataType::Reference,
            is_volatile: false,
            field_index: 0,
            value_can_be_null: true,
        }
    }

    fn lower_field_load(options: &CompilerOptions, dest: u8, base: u8, offset: u32) -> Lowered {
        let (mut graph, entry) = method_graph();
        let obj = graph.add(entry, InstructionKind::ParameterValue { index: 0 }, DataType::Reference, &[]);
        let get = graph.add(
            entry,
            InstructionKind::InstanceFieldGet(reference_field(offset)),
            DataType::Reference,
            &[obj],
        );
        graph.inst_mut(get).locations = Some(fixed(&[Location::Register(base)], Location::Register(dest)));
        lower(&graph, options, &[get])
    }

    fn lower_array_load(options: &CompilerOptions) -> Lowered {
        let (mut graph, entry) = method_graph();
        let array = graph.add(entry, InstructionKind::ParameterValue { index: 0 }, DataType::Reference, &[]);
        let index = graph.add(entry, InstructionKind::ParameterValue { index: 1 }, DataType::Int32, &[]);
        let get = graph.add(entry, InstructionKind::ArrayGet, DataType::Reference, &[array, index]);
        let mut summary = fixed(&[Location::Register(1), Location::Register(2)], Location::Register(0));
        summary.add_temp(Location::Register(3));
        graph.inst_mut(get).locations = Some(summary);
        lower(&graph, options, &[get])
    }

    fn lower_gc_root_load(options: &CompilerOptions) -> Lowered {
        let (mut graph, entry) = method_graph();
        let method = graph.add(entry, InstructionKind::CurrentMethod, DataType::Reference, &[]);
        let info = LoadClassInfo {
            type_index: 7,
            dex_file: 0,
            load_kind: LoadClassKind::ReferrersClass,
            must_resolve_type_on_slow_path: false,
            must_generate_clinit_check: false,
            needs_access_check: false,
            boot_image_offset: 0,
        };
        let cls = graph.add(entry, InstructionKind::LoadClass(info), DataType::Reference, &[method]);
        graph.inst_mut(cls).locations = Some(fixed(&[Location::Register(0)], Location::Register(1)));
        lower(&graph, options, &[cls])
    }

    #[test]
    fn test_thunk_data_encoding() {
        let data = BakerReadBarrierData {
            kind: BakerReadBarrierKind::Array,
            base: 12,
            holder_or_index: 3,
            dest: 11,
            narrow: false,
            poisoned: true,
        };
        assert_eq!(BakerReadBarrierData::decode(data.encode()), Some(data));
        assert_eq!(data.ldr_offset(), -8);
        assert_eq!(BakerReadBarrierData::decode(3), None);
        assert_eq!(BakerReadBarrierData::decode(1 << 16), None);
    }

    #[test]
    fn test_field_load_sequence_and_jit_thunk() {
        let lowered = lower_field_load(&CompilerOptions::default(), 0, 1, 8);
        let data = BakerReadBarrierData {
            kind: BakerReadBarrierKind::Field,
            base: 1,
            holder_or_index: 1,
            dest: 0,
            narrow: true,
            poisoned: false,
        };

        let mut expected = ArmMacroAssembler::new(false);
        let ret = expected.create_label();
        let thunk = expected.create_label();
        let gray = expected.create_label();
        expected.adr_code(LR, ret);
        expected.cmp_w_imm(MR, 0);
        expected.b_cond(Cond::NE, thunk);
        expected.ldr_imm(LoadKind::Word, R0, R1, 8);
        expected.bind_label(ret);
        expected.bind_label(thunk);
        expected.load_from_offset(LoadKind::Word, IP, R1, object::MONITOR_OFFSET);
        expected.shift_imm_w(Shift::LSL, true, IP, IP, 3);
        expected.b_cond(Cond::MI, gray);
        expected.dp_imm(DataOp::Sub, false, LR, LR, 2);
        expected.bx(LR);
        expected.bind_label(gray);
        expected.load_from_offset(LoadKind::Word, IP, TR, read_barrier_mark_entrypoint_offset(0));
        expected.bx(IP);
        assert_eq!(lowered.code, halfwords(expected));
        assert_eq!(lowered.body_len, 7);
        assert_eq!(lowered.body()[6], 0x6888);

        assert_eq!(lowered.patches.len(), 1);
        let patch = lowered.patches[0];
        assert_eq!(patch.kind, LinkerPatchKind::BakerReadBarrierBranch);
        assert_eq!(patch.literal_offset, 8);
        assert_eq!(patch.target, data.encode());
    }

    #[test]
    fn test_aot_load_has_no_thunks() {
        let options = CompilerOptions {
            is_jit: false,
            ..CompilerOptions::default()
        };
        let lowered = lower_field_load(&options, 0, 1, 8);
        assert_eq!(lowered.code.len(), lowered.body_len);
        assert_eq!(lowered.patches.len(), 1);
    }

    #[test]
    fn test_jit_thunks_are_shared_by_equal_loads() {
        let (mut graph, entry) = method_graph();
        let obj = graph.add(entry, InstructionKind::ParameterValue { index: 0 }, DataType::Reference, &[]);
        let first = graph.add(
            entry,
            InstructionKind::InstanceFieldGet(reference_field(8)),
            DataType::Reference,
            &[obj],
        );
        let second = graph.add(
            entry,
            InstructionKind::InstanceFieldGet(reference_field(12)),
            DataType::Reference,
            &[obj],
        );
        for get in [first, second] {
            graph.inst_mut(get).locations = Some(fixed(&[Location::Register(1)], Location::Register(0)));
        }
        let lowered = lower(&graph, &CompilerOptions::default(), &[first, second]);

        assert_eq!(lowered.patches.len(), 2);
        assert_eq!(lowered.patches[0].target, lowered.patches[1].target);
        // One field thunk: LDR, LSLS, BMI, SUB, BX, LDR, BX.
        assert_eq!(lowered.code.len() - lowered.body_len, 2 + 2 + 2 + 2 + 1 + 2 + 1);
    }

    /// The LDR sits `BNE_TO_LDR_DISTANCE` after the patched branch and
    /// `-ldr_offset` before the return address, for every kind of load.
    #[test]
    fn test_layout_matches_thunk_data() {
        for poisoned in [false, true] {
            let options = CompilerOptions {
                is_jit: false,
                heap_poisoning: poisoned,
                ..CompilerOptions::default()
            };
            let cases = [
                (lower_field_load(&options, 0, 1, 8), BakerReadBarrierKind::Field, true),
                (lower_field_load(&options, 0, 1, 200), BakerReadBarrierKind::Field, false),
                (lower_field_load(&options, 10, 1, 8), BakerReadBarrierKind::Field, false),
                (lower_array_load(&options), BakerReadBarrierKind::Array, false),
                (lower_gc_root_load(&options), BakerReadBarrierKind::GcRoot, true),
            ];
            for (lowered, kind, narrow) in cases {
                assert_eq!(lowered.patches.len(), 1);
                let patch = lowered.patches[0];
                let data = BakerReadBarrierData::decode(patch.target).expect("valid thunk data");
                assert_eq!(data.kind, kind);
                assert_eq!(data.narrow, narrow);
                assert_eq!(data.poisoned, poisoned && kind != BakerReadBarrierKind::GcRoot);

                let ldr_pc = patch.literal_offset + BNE_TO_LDR_DISTANCE;
                let end = lowered.body_len as i32 * 2;
                assert_eq!(end + data.ldr_offset(), ldr_pc as i32);

                let ldr = lowered.code[ldr_pc as usize / 2];
                match (kind, narrow) {
                    (_, true) => assert_eq!(ldr & 0xf800, 0x6800),
                    (BakerReadBarrierKind::Array, false) => assert_eq!(ldr, 0xf850 | data.base as u16),
                    (_, false) => assert_eq!(ldr, 0xf8d0 | data.base as u16),
                }
            }
        }
    }
}
