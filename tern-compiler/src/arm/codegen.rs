//! Turns an allocated graph into Thumb-2 code.
//!
//! The generator walks the blocks in linear order and dispatches on the
//! instruction kind; the lowering of each instruction group lives in the
//! `lower_*` modules as further `impl` blocks of `CodeGeneratorArm`. Slow
//! paths and read barrier thunks are emitted behind the method body.

use std::collections::HashMap;

use tern_asm::thumb2::{BarrierOption, Cond, DataOp, LoadKind, Literal, SRegister, StoreKind, LR, PC, R4, SP};
use tern_asm::Label;
use tracing::debug;

use crate::arm::masm::{ArmMacroAssembler, ScopeSize, DEFAULT_POOL_MARGIN};
use crate::arm::slow_paths::{SavedRegisters, SlowPathKind, SlowPathRegistry};
use crate::arm::{dreg, high_reg, low_reg, reg, sreg, METHOD_REGISTER, TR};
use crate::cfi::{CfiWriter, DwarfReg};
use crate::compiled_method::{CompiledMethod, InstructionSet, JitRootKind, JitRootPatch};
use crate::disassembler;
use crate::error::{CompileError, CompileResult};
use crate::hir::{BlockId, DataType, Environment, Graph, InstId, InstructionKind};
use crate::linker_patch::PatchLog;
use crate::locations::{Location, MoveOperands};
use crate::options::CompilerOptions;
use crate::parallel_move::{resolve_parallel_move, MoveEmitter};
use crate::register_allocator::{Allocation, FrameLayout};
use crate::runtime::{self, class, method, profiling, thread, QuickEntrypoint};
use crate::stack_map::{DexRegisterLocation, StackMapKind, StackMapStream};

pub struct CodeGeneratorArm<'a> {
    pub(crate) graph: &'a Graph,
    pub(crate) options: &'a CompilerOptions,
    pub(crate) allocation: &'a Allocation,
    pub(crate) frame: FrameLayout,
    pub(crate) masm: ArmMacroAssembler,
    block_labels: Vec<Label>,
    pub(crate) frame_entry_label: Label,
    stack_maps: StackMapStream,
    pub(crate) slow_paths: SlowPathRegistry,
    pub(crate) patches: PatchLog,
    jit_roots: Vec<(JitRootKind, Literal)>,
    /// Method-local read barrier thunks by encoded thunk data.
    pub(crate) baker_thunks: Vec<(u32, Label)>,
    cfi: CfiWriter,
    pub(crate) current_block: BlockId,
    /// Null check folded into the memory access of the next instruction.
    pub(crate) pending_null_check: Option<InstId>,
    /// Suspend check slow paths shared by all back edges of a loop.
    pub(crate) suspend_check_paths: HashMap<InstId, usize>,
}

impl<'a> CodeGeneratorArm<'a> {
    pub fn new(graph: &'a Graph, options: &'a CompilerOptions, allocation: &'a Allocation) -> CodeGeneratorArm<'a> {
        let mut masm = ArmMacroAssembler::new(options.emit_asm);
        let block_labels = graph.blocks.iter().map(|_| masm.create_label()).collect();
        let frame_entry_label = masm.create_label();

        CodeGeneratorArm {
            graph,
            options,
            allocation,
            frame: allocation.frame.clone(),
            masm,
            block_labels,
            frame_entry_label,
            stack_maps: StackMapStream::new(),
            slow_paths: SlowPathRegistry::new(),
            patches: PatchLog::new(),
            jit_roots: Vec::new(),
            baker_thunks: Vec::new(),
            cfi: CfiWriter::new(options.emit_debug || !options.is_jit),
            current_block: graph.entry_block,
            pending_null_check: None,
            suspend_check_paths: HashMap::new(),
        }
    }

    pub fn generate(mut self) -> CompileResult<CompiledMethod> {
        if self.frame.frame_size > runtime::MAX_FRAME_SIZE {
            return Err(CompileError::FrameTooLarge {
                size: self.frame.frame_size,
                max: runtime::MAX_FRAME_SIZE,
            });
        }

        let graph = self.graph;
        self.stack_maps.begin_method(
            self.frame.frame_size,
            self.frame.core_spill_mask,
            self.frame.fp_spill_mask,
            graph.method.number_of_vregs,
        );

        self.generate_frame_entry();

        for &block in &graph.linear_order {
            self.current_block = block;
            let label = self.block_label(block);
            self.masm.bind_label(label);
            if graph.block(block).is_catch_block {
                self.record_catch_block(block);
            }

            for &inst in &graph.block(block).instructions {
                let instruction = graph.inst(inst);
                if instruction.removed || instruction.emitted_at_use_site {
                    continue;
                }
                self.masm
                    .comment(|| format!("{:?} {}", inst, instruction.kind.name()));
                self.visit(inst);
                if self.pending_null_check.is_none() {
                    self.masm.maybe_emit_literal_pool(DEFAULT_POOL_MARGIN);
                }
            }
        }
        assert!(self.pending_null_check.is_none(), "folded null check without user");

        self.emit_slow_paths();
        self.emit_baker_thunks();
        self.masm.emit_literal_pool_at_end();

        let code_size = self.masm.position() as u32;
        self.stack_maps.end_method(code_size);

        let masm = &self.masm;
        let patches = self
            .patches
            .emit(|label| masm.offset(label).expect("patch label not bound"));
        let jit_roots = self
            .jit_roots
            .iter()
            .map(|&(root, literal)| JitRootPatch {
                root,
                literal_offset: masm.literal_offset(literal).expect("root literal not placed"),
            })
            .collect();
        let safepoints: Vec<u32> = (0..self.stack_maps.number_of_stack_maps())
            .map(|idx| self.stack_maps.stack_map(idx).native_pc)
            .collect();

        let (code, comments) = self.masm.finalize();
        let asm_listing = if self.options.emit_asm {
            Some(disassembler::disassemble(&graph.method.name, &code, &comments, &safepoints))
        } else {
            None
        };

        debug!(
            method = %graph.method.name,
            code_size = code.len(),
            frame_size = self.frame.frame_size,
            stack_maps = safepoints.len(),
            "generated code"
        );

        Ok(CompiledMethod {
            isa: InstructionSet::Thumb2,
            code,
            stack_map: self.stack_maps.encode(),
            cfi: self.cfi.finish(),
            patches,
            jit_roots,
            frame_size: self.frame.frame_size,
            core_spill_mask: self.frame.core_spill_mask,
            fp_spill_mask: self.frame.fp_spill_mask,
            is_intrinsic: false,
            is_osr: graph.is_osr,
            is_baseline: self.options.baseline,
            asm_listing,
        })
    }

    pub(crate) fn block_label(&self, block: BlockId) -> Label {
        self.block_labels[block.idx()]
    }

    /// Whether `to` is laid out right behind the current block.
    pub(crate) fn goes_to_next_block(&self, to: BlockId) -> bool {
        let order = &self.graph.linear_order;
        let position = order
            .iter()
            .position(|&b| b == self.current_block)
            .expect("current block not in linear order");
        order.get(position + 1) == Some(&to)
    }

    pub(crate) fn visit(&mut self, inst: InstId) {
        let graph = self.graph;
        match &graph.inst(inst).kind {
            InstructionKind::IntConstant(_)
            | InstructionKind::LongConstant(_)
            | InstructionKind::FloatConstant(_)
            | InstructionKind::DoubleConstant(_)
            | InstructionKind::NullConstant
            | InstructionKind::ParameterValue { .. }
            | InstructionKind::CurrentMethod
            | InstructionKind::BoundType
            | InstructionKind::Nop
            | InstructionKind::Exit => {}
            InstructionKind::Phi => unreachable!("phis are resolved by parallel moves"),

            InstructionKind::Binary(op) => self.visit_binary(inst, *op),
            InstructionKind::Unary(op) => self.visit_unary(inst, *op),
            InstructionKind::BitwiseNegatedRight(op) => self.visit_bitwise_negated_right(inst, *op),
            InstructionKind::DataProcWithShifterOp { op, shift, amount } => {
                self.visit_data_proc_with_shifter_op(inst, *op, *shift, *amount)
            }
            InstructionKind::Condition { .. } => self.visit_condition(inst),
            InstructionKind::Compare { bias } => self.visit_compare(inst, *bias),
            InstructionKind::TypeConversion => self.visit_type_conversion(inst),

            InstructionKind::InstanceFieldGet(info) | InstructionKind::StaticFieldGet(info) => {
                self.visit_field_get(inst, *info)
            }
            InstructionKind::InstanceFieldSet(info) | InstructionKind::StaticFieldSet(info) => {
                self.visit_field_set(inst, *info)
            }
            InstructionKind::ArrayGet => self.visit_array_get(inst),
            InstructionKind::ArraySet {
                needs_type_check,
                value_can_be_null,
                static_type_of_array_is_object_array,
            } => self.visit_array_set(
                inst,
                *needs_type_check,
                *value_can_be_null,
                *static_type_of_array_is_object_array,
            ),
            InstructionKind::ArrayLength => self.visit_array_length(inst),
            InstructionKind::IntermediateAddress { offset } => self.visit_intermediate_address(inst, *offset),

            InstructionKind::NullCheck => self.visit_null_check(inst),
            InstructionKind::DivZeroCheck => self.visit_div_zero_check(inst),
            InstructionKind::BoundsCheck => self.visit_bounds_check(inst),

            InstructionKind::LoadClass(info) => self.visit_load_class(inst, *info),
            InstructionKind::LoadString(info) => self.visit_load_string(inst, *info),
            InstructionKind::ClinitCheck => self.visit_clinit_check(inst),
            InstructionKind::InstanceOf(info) => self.visit_instance_of(inst, *info),
            InstructionKind::CheckCast(info) => self.visit_check_cast(inst, *info),
            InstructionKind::NewInstance { .. } => self.visit_new_instance(inst),
            InstructionKind::NewArray { component_size_shift } => self.visit_new_array(inst, *component_size_shift),
            InstructionKind::Throw => self.visit_throw(inst),

            InstructionKind::InvokeStaticOrDirect(info, load_kind, code_ptr) => {
                self.visit_invoke_static_or_direct(inst, *info, *load_kind, *code_ptr)
            }
            InstructionKind::InvokeVirtual(_, vtable_index) => self.visit_invoke_virtual(inst, *vtable_index),
            InstructionKind::InvokeInterface(info, imt_index) => self.visit_invoke_interface(inst, *info, *imt_index),
            InstructionKind::InvokePolymorphic(_) => self.visit_invoke_polymorphic(inst),
            InstructionKind::InvokeCustom(_, call_site) => self.visit_invoke_custom(inst, *call_site),
            InstructionKind::InvokeUnresolved(info, invoke_type) => {
                self.visit_invoke_unresolved(inst, *info, *invoke_type)
            }

            InstructionKind::Goto => self.visit_goto(inst),
            InstructionKind::If => self.visit_if(inst),
            InstructionKind::TryBoundary(_) => self.visit_try_boundary(inst),
            InstructionKind::Deoptimize(kind) => self.visit_deoptimize(inst, *kind),
            InstructionKind::ShouldDeoptimizeFlag => self.visit_should_deoptimize_flag(inst),
            InstructionKind::PackedSwitch {
                start_value,
                num_entries,
            } => self.visit_packed_switch(inst, *start_value, *num_entries),
            InstructionKind::Return => self.visit_return(inst),
            InstructionKind::ReturnVoid => self.generate_frame_exit(),
            InstructionKind::SuspendCheck => self.visit_suspend_check(inst),

            InstructionKind::Select => self.visit_select(inst),
            InstructionKind::ParallelMove(moves) => self.parallel_move(moves.clone()),
            InstructionKind::ConstructorFence => self.masm.dmb(BarrierOption::IshSt),
            InstructionKind::MemoryBarrier(kind) => self.generate_memory_barrier(*kind),
            InstructionKind::MethodEntryHook | InstructionKind::MethodExitHook => {
                self.visit_method_entry_exit_hook(inst)
            }
        }
    }

    // Frame setup and teardown.

    fn generate_frame_entry(&mut self) {
        if self.graph.method.requires_clinit_check {
            self.generate_entry_clinit_check();
        }
        let entry = self.frame_entry_label;
        self.masm.bind_label(entry);

        if self.frame.has_empty_frame() {
            return;
        }

        let skip_overflow_check = !self.options.implicit_stack_overflow_checks
            || (self.frame.is_leaf && self.frame.frame_size < runtime::STACK_OVERFLOW_RESERVED_BYTES);
        if !skip_overflow_check {
            // R4 is neither an argument nor a callee-save register.
            self.masm
                .add_constant(R4, SP, -(runtime::STACK_OVERFLOW_RESERVED_BYTES as i32));
            let pc = {
                let mut scope = self.masm.exact_scope(2, ScopeSize::Exact);
                let pc = scope.position() as u32;
                scope.ldr16_imm(LoadKind::Word, R4, R4, 0);
                pc
            };
            self.record_pc_info(None, pc, None);
        }

        let core_mask = self.frame.core_spill_mask;
        let fp_mask = self.frame.fp_spill_mask;
        self.masm.push(core_mask);
        self.cfi_advance();
        self.cfi.adjust_cfa_offset(4 * core_mask.count_ones() as i32);
        self.cfi.rel_offset_for_many(DwarfReg::core, 0, core_mask);

        if fp_mask != 0 {
            let first = fp_mask.trailing_zeros();
            self.masm
                .vpush_s(SRegister::new(first as u8), fp_mask.count_ones());
            self.cfi_advance();
            self.cfi.adjust_cfa_offset(4 * fp_mask.count_ones() as i32);
            self.cfi.rel_offset_for_many(DwarfReg::s, 0, fp_mask);
        }

        let remaining = self.frame.fp_spill_offset();
        self.increase_frame(remaining);
        self.masm
            .store_to_offset(StoreKind::Word, METHOD_REGISTER, SP, 0);

        if let Some(offset) = self.frame.should_deoptimize_flag_offset {
            let temp = self.masm.scratch();
            self.masm.load_const(*temp, 0);
            self.masm
                .store_to_offset(StoreKind::Word, *temp, SP, offset as i32);
        }

        self.maybe_increment_hotness(None);
    }

    /// Methods of classes that may still be initializing re-check the class
    /// status on entry and go through the resolution stub unless the class is
    /// usable by this thread.
    fn generate_entry_clinit_check(&mut self) {
        let resolution = self.masm.create_label();
        let memory_barrier = self.masm.create_label();
        let entry = self.frame_entry_label;
        let status = |value: u32| (value << class::STATUS_LSB_POSITION) as i32;

        let temp = self.masm.scratch();
        self.masm
            .load_from_offset(LoadKind::Word, *temp, METHOD_REGISTER, method::DECLARING_CLASS_OFFSET);
        self.masm
            .load_from_offset(LoadKind::UnsignedByte, R4, *temp, class::STATUS_BYTE_OFFSET);
        self.masm.cmp_imm8(R4, status(class::VISIBLY_INITIALIZED) as u32);
        self.masm.b_cond(Cond::HS, entry);
        self.masm.cmp_imm8(R4, status(class::INITIALIZED) as u32);
        self.masm.b_cond(Cond::HS, memory_barrier);
        self.masm.cmp_imm8(R4, status(class::INITIALIZING) as u32);
        self.masm.b_cond(Cond::LO, resolution);
        self.masm
            .load_from_offset(LoadKind::Word, *temp, *temp, class::CLINIT_THREAD_ID_OFFSET);
        self.masm
            .load_from_offset(LoadKind::Word, R4, TR, thread::TID_OFFSET);
        self.masm.cmp_reg16(*temp, R4);
        self.masm.b_cond(Cond::EQ, entry);
        self.masm.bind_label(resolution);
        self.masm.load_from_offset(
            LoadKind::Word,
            *temp,
            TR,
            QuickEntrypoint::QuickResolutionTrampoline.offset(),
        );
        self.masm.bx(*temp);
        self.masm.bind_label(memory_barrier);
        self.masm.dmb(BarrierOption::Ish);
    }

    pub(crate) fn generate_frame_exit(&mut self) {
        if self.frame.has_empty_frame() {
            self.masm.bx(LR);
            return;
        }

        let core_mask = self.frame.core_spill_mask;
        let fp_mask = self.frame.fp_spill_mask;
        let pop_mask = (core_mask & !LR.mask()) | PC.mask();

        self.cfi.remember_state();
        let remaining = self.frame.fp_spill_offset();
        self.decrease_frame(remaining);
        if fp_mask != 0 {
            let first = fp_mask.trailing_zeros();
            self.masm
                .vpop_s(SRegister::new(first as u8), fp_mask.count_ones());
            self.cfi_advance();
            self.cfi.adjust_cfa_offset(-4 * fp_mask.count_ones() as i32);
            self.cfi.restore_many(DwarfReg::s, fp_mask);
        }
        self.masm.pop(pop_mask);
        self.cfi_advance();
        self.cfi.restore_state();
        self.cfi.def_cfa_offset(self.frame.frame_size as i32);
    }

    fn increase_frame(&mut self, size: u32) {
        if size == 0 {
            return;
        }
        if size % 4 == 0 && size <= 508 {
            self.masm.sub_sp_imm7(size);
        } else {
            self.masm.add_constant(SP, SP, -(size as i32));
        }
        self.cfi_advance();
        self.cfi.adjust_cfa_offset(size as i32);
    }

    fn decrease_frame(&mut self, size: u32) {
        if size == 0 {
            return;
        }
        if size % 4 == 0 && size <= 508 {
            self.masm.add_sp_imm7(size);
        } else {
            self.masm.add_constant(SP, SP, size as i32);
        }
        self.cfi_advance();
        self.cfi.adjust_cfa_offset(-(size as i32));
    }

    fn cfi_advance(&mut self) {
        let pc = self.masm.position() as u32;
        self.cfi.advance_pc(pc);
    }

    /// Decrements the baseline hotness counter and requests an optimized
    /// compile when it underflows. Empty frames keep the return address in LR
    /// and skip the counter.
    pub(crate) fn maybe_increment_hotness(&mut self, suspend_check: Option<InstId>) {
        if !self.options.baseline || !self.options.is_jit || self.frame.has_empty_frame() {
            return;
        }
        let address = match self.graph.profiling_info {
            Some(address) => address,
            None => return,
        };

        let offset = profiling::BASELINE_HOTNESS_COUNT_OFFSET;
        let idx = self.add_slow_path(SlowPathKind::CompileOptimized { base: LR, offset }, suspend_check);
        let entry = self.slow_path_entry(idx);
        let exit = self.slow_path_exit(idx);

        let temp = self.masm.scratch();
        self.masm.load_const(LR, address as i32);
        self.masm
            .load_from_offset(LoadKind::UnsignedHalf, *temp, LR, offset);
        self.masm.dp_imm(DataOp::Sub, true, *temp, *temp, 1);
        self.masm.b_cond(Cond::LO, entry);
        self.masm.store_to_offset(StoreKind::Half, *temp, LR, offset);
        self.masm.bind_label(exit);
    }

    // Runtime calls and safepoints.

    /// Calls a runtime entrypoint through the thread register and records a
    /// stack map at the return address when the callee may walk the stack.
    pub(crate) fn invoke_runtime(
        &mut self,
        entrypoint: QuickEntrypoint,
        inst: Option<InstId>,
        saved: Option<&SavedRegisters>,
    ) {
        self.masm
            .load_from_offset(LoadKind::Word, LR, TR, entrypoint.offset());
        let pc = {
            let mut scope = self.masm.exact_scope(2, ScopeSize::Exact);
            scope.blx(LR);
            scope.position() as u32
        };
        if entrypoint.needs_safepoint() {
            self.record_pc_info(inst, pc, saved);
        }
    }

    /// Records a stack map for `inst` at `native_pc`. Registers saved by a
    /// slow path are described by their spill slots.
    pub(crate) fn record_pc_info(&mut self, inst: Option<InstId>, native_pc: u32, saved: Option<&SavedRegisters>) {
        let inst = match inst {
            Some(inst) => inst,
            None => {
                self.stack_maps
                    .begin_stack_map_entry(0, native_pc, 0, Default::default(), StackMapKind::Default);
                self.stack_maps.end_stack_map_entry();
                return;
            }
        };

        let graph = self.graph;
        let instruction = graph.inst(inst);
        let locations = instruction.locations();
        let no_saves = SavedRegisters::default();
        let saved = saved.unwrap_or(&no_saves);

        let mut register_mask = locations.register_mask;
        let mut stack_mask = locations.stack_mask.clone();
        for &(reg, offset) in &saved.core {
            if register_mask & (1 << reg) != 0 {
                register_mask &= !(1 << reg);
                let bit = (offset / 4) as usize;
                if bit >= stack_mask.len() {
                    stack_mask.grow(bit + 1);
                }
                stack_mask.insert(bit);
            }
        }

        let osr_entry = graph.is_osr
            && matches!(instruction.kind, InstructionKind::SuspendCheck)
            && graph.block(instruction.block).is_loop_header;
        let mut kinds = vec![StackMapKind::Default];
        if osr_entry {
            kinds.push(StackMapKind::Osr);
        }

        for kind in kinds {
            match &instruction.environment {
                Some(env) => {
                    let frames = environment_chain(env);
                    let outer = frames[0];
                    self.stack_maps
                        .begin_stack_map_entry(outer.dex_pc, native_pc, register_mask, stack_mask.clone(), kind);
                    for frame in &frames[1..] {
                        self.stack_maps
                            .add_inline_info(frame.method_index, frame.dex_pc, frame.vregs.len() as u32);
                    }
                    for frame in &frames {
                        self.emit_environment(frame, instruction.lifetime_position, locations.will_call(), saved);
                    }
                }
                None => {
                    self.stack_maps.begin_stack_map_entry(
                        instruction.dex_pc,
                        native_pc,
                        register_mask,
                        stack_mask.clone(),
                        kind,
                    );
                }
            }
            self.stack_maps.end_stack_map_entry();
        }
    }

    fn emit_environment(&mut self, env: &Environment, position: u32, will_call: bool, saved: &SavedRegisters) {
        let graph = self.graph;
        let mut idx = 0;
        while idx < env.vregs.len() {
            let value = match env.vregs[idx] {
                Some(value) => value,
                None => {
                    self.stack_maps.add_dex_register_entry(DexRegisterLocation::None);
                    idx += 1;
                    continue;
                }
            };
            let ty = graph.inst(value).ty;
            let location = self
                .allocation
                .location_at_safepoint(graph, value, position, will_call);
            let wide = ty.is_64bit();

            let entries = match location {
                Location::Constant(constant) => {
                    let bits = self.constant_bits(constant);
                    if wide {
                        vec![
                            DexRegisterLocation::Constant(bits as i32),
                            DexRegisterLocation::Constant((bits >> 32) as i32),
                        ]
                    } else {
                        vec![DexRegisterLocation::Constant(bits as i32)]
                    }
                }
                Location::Register(r) => vec![core_entry(r, saved)],
                Location::RegisterPair(lo, hi) => vec![core_entry(lo, saved), core_entry(hi, saved)],
                Location::FpuRegister(s) => vec![fp_entry(s, saved)],
                Location::FpuRegisterPair(lo, hi) => vec![fp_entry(lo, saved), fp_entry(hi, saved)],
                Location::StackSlot(offset) => vec![DexRegisterLocation::InStack(offset)],
                Location::DoubleStackSlot(offset) => vec![
                    DexRegisterLocation::InStack(offset),
                    DexRegisterLocation::InStack(offset + 4),
                ],
                _ => {
                    if wide {
                        vec![DexRegisterLocation::None, DexRegisterLocation::None]
                    } else {
                        vec![DexRegisterLocation::None]
                    }
                }
            };

            let count = entries.len();
            for entry in entries {
                self.stack_maps.add_dex_register_entry(entry);
            }
            idx += count;
        }
    }

    fn record_catch_block(&mut self, block: BlockId) {
        let pc = self.masm.position() as u32;
        let dex_pc = self.graph.block(block).dex_pc;
        self.stack_maps
            .begin_stack_map_entry(dex_pc, pc, 0, Default::default(), StackMapKind::Catch);
        self.stack_maps.end_stack_map_entry();
    }

    /// Records the stack map of a null check folded into the access at `pc`.
    pub(crate) fn record_implicit_null_check(&mut self, pc: u32) {
        if let Some(null_check) = self.pending_null_check.take() {
            self.record_pc_info(Some(null_check), pc, None);
        }
    }

    // Location helpers.

    pub(crate) fn locations_of(&self, inst: InstId) -> &'a crate::locations::LocationSummary {
        let graph: &'a Graph = self.graph;
        graph.inst(inst).locations()
    }

    /// Raw bits of a constant: floats by their IEEE encoding, null as zero.
    pub(crate) fn constant_bits(&self, constant: InstId) -> u64 {
        match self.graph.kind(constant) {
            InstructionKind::IntConstant(value) => *value as i64 as u64,
            InstructionKind::LongConstant(value) => *value as u64,
            InstructionKind::FloatConstant(value) => value.to_bits() as u64,
            InstructionKind::DoubleConstant(value) => value.to_bits(),
            InstructionKind::NullConstant => 0,
            other => panic!("{} is not a constant", other.name()),
        }
    }

    /// Value of an integral constant location.
    pub(crate) fn int_value(&self, location: Location) -> i64 {
        self.graph
            .constant_as_i64(location.constant())
            .expect("integral constant")
    }

    pub(crate) fn add_jit_root_literal(&mut self, root: JitRootKind) -> Literal {
        let literal = self.masm.new_unique_literal_u32(0);
        self.jit_roots.push((root, literal));
        literal
    }

    // Moves.

    pub(crate) fn parallel_move(&mut self, moves: Vec<MoveOperands>) {
        resolve_parallel_move(self, &moves);
    }

    /// Copies `source` to `destination`. Either may be a register, a pair, an
    /// FP register (pair) or a stack slot; `source` may also be a constant.
    pub(crate) fn move_location(&mut self, destination: Location, source: Location, ty: DataType) {
        if destination == source || destination.is_invalid() {
            return;
        }
        if let Location::Constant(constant) = source {
            self.move_constant(destination, constant);
            return;
        }

        match (destination, source) {
            (Location::FpuRegisterPair(..), Location::FpuRegisterPair(..)) => {
                self.masm.vmov_d(dreg(destination), dreg(source));
            }
            (Location::FpuRegisterPair(..), Location::DoubleStackSlot(offset)) => {
                self.masm.load_d_from_offset(dreg(destination), SP, offset);
            }
            (Location::DoubleStackSlot(offset), Location::FpuRegisterPair(..)) => {
                self.masm.store_d_to_offset(dreg(source), SP, offset);
            }
            (Location::FpuRegisterPair(..), Location::RegisterPair(..)) => {
                self.masm
                    .vmov_drr(dreg(destination), low_reg(source), high_reg(source));
            }
            (Location::RegisterPair(..), Location::FpuRegisterPair(..)) => {
                self.masm
                    .vmov_rrd(low_reg(destination), high_reg(destination), dreg(source));
            }
            (Location::RegisterPair(..), Location::DoubleStackSlot(offset)) => {
                self.masm
                    .load_pair_from_offset(low_reg(destination), high_reg(destination), SP, offset);
            }
            (Location::DoubleStackSlot(offset), Location::RegisterPair(..)) => {
                self.masm
                    .store_pair_to_offset(low_reg(source), high_reg(source), SP, offset);
            }
            (Location::DoubleStackSlot(to), Location::DoubleStackSlot(from)) => {
                let temp = self.masm.scratch_d();
                self.masm.load_d_from_offset(*temp, SP, from);
                self.masm.store_d_to_offset(*temp, SP, to);
            }
            (Location::RegisterPair(..), Location::RegisterPair(..)) => {
                // Move the high half first when it would be clobbered.
                if destination.low() == source.high() {
                    self.masm.mov(high_reg(destination), high_reg(source));
                    self.masm.mov(low_reg(destination), low_reg(source));
                } else {
                    self.masm.mov(low_reg(destination), low_reg(source));
                    self.masm.mov(high_reg(destination), high_reg(source));
                }
            }
            _ if ty.is_64bit() || is_wide_location(destination) || is_wide_location(source) => {
                self.move_word(destination.to_low(), source.to_low());
                self.move_word(destination.to_high(), source.to_high());
            }
            _ => self.move_word(destination, source),
        }
    }

    fn move_word(&mut self, destination: Location, source: Location) {
        if destination == source {
            return;
        }
        match (destination, source) {
            (Location::Register(_), Location::Register(_)) => self.masm.mov(reg(destination), reg(source)),
            (Location::Register(_), Location::FpuRegister(_)) => self.masm.vmov_rs(reg(destination), sreg(source)),
            (Location::FpuRegister(_), Location::Register(_)) => self.masm.vmov_sr(sreg(destination), reg(source)),
            (Location::FpuRegister(_), Location::FpuRegister(_)) => {
                self.masm.vmov_s(sreg(destination), sreg(source))
            }
            (Location::Register(_), Location::StackSlot(offset)) => {
                self.masm
                    .load_from_offset(LoadKind::Word, reg(destination), SP, offset)
            }
            (Location::StackSlot(offset), Location::Register(_)) => {
                self.masm
                    .store_to_offset(StoreKind::Word, reg(source), SP, offset)
            }
            (Location::FpuRegister(_), Location::StackSlot(offset)) => {
                self.masm.load_s_from_offset(sreg(destination), SP, offset)
            }
            (Location::StackSlot(offset), Location::FpuRegister(_)) => {
                self.masm.store_s_to_offset(sreg(source), SP, offset)
            }
            (Location::StackSlot(to), Location::StackSlot(from)) => {
                let temp = self.masm.scratch();
                self.masm.load_from_offset(LoadKind::Word, *temp, SP, from);
                self.masm.store_to_offset(StoreKind::Word, *temp, SP, to);
            }
            _ => panic!("unsupported move {:?} <- {:?}", destination, source),
        }
    }

    fn move_constant(&mut self, destination: Location, constant: InstId) {
        let bits = self.constant_bits(constant);
        match destination {
            Location::Register(_) => self.masm.load_const(reg(destination), bits as i32),
            Location::RegisterPair(..) => {
                self.masm.load_const(low_reg(destination), bits as i32);
                self.masm
                    .load_const(high_reg(destination), (bits >> 32) as i32);
            }
            Location::FpuRegister(_) => {
                self.masm
                    .load_sconst(sreg(destination), f32::from_bits(bits as u32));
            }
            Location::FpuRegisterPair(..) => {
                self.masm.load_dconst(dreg(destination), f64::from_bits(bits));
            }
            Location::StackSlot(offset) => {
                let temp = self.masm.scratch();
                self.masm.load_const(*temp, bits as i32);
                self.masm.store_to_offset(StoreKind::Word, *temp, SP, offset);
            }
            Location::DoubleStackSlot(offset) => {
                let temp = self.masm.scratch();
                self.masm.load_const(*temp, bits as i32);
                self.masm.store_to_offset(StoreKind::Word, *temp, SP, offset);
                self.masm.load_const(*temp, (bits >> 32) as i32);
                self.masm
                    .store_to_offset(StoreKind::Word, *temp, SP, offset + 4);
            }
            other => panic!("cannot materialize a constant into {:?}", other),
        }
    }

    /// Exchanges two 32-bit locations through IP (and S30 when both are on
    /// the stack).
    fn swap_words(&mut self, a: Location, b: Location) {
        if a == b {
            return;
        }
        let temp = self.masm.scratch();
        match (a, b) {
            (Location::StackSlot(x), Location::StackSlot(y)) => {
                let ftemp = self.masm.scratch_s();
                self.masm.load_from_offset(LoadKind::Word, *temp, SP, x);
                self.masm.load_s_from_offset(*ftemp, SP, y);
                self.masm.store_to_offset(StoreKind::Word, *temp, SP, y);
                self.masm.store_s_to_offset(*ftemp, SP, x);
            }
            _ => {
                let ip = Location::Register(temp.code() as u8);
                self.move_word(ip, a);
                self.move_word(a, b);
                self.move_word(b, ip);
            }
        }
    }
}

impl MoveEmitter for CodeGeneratorArm<'_> {
    fn emit_move(&mut self, mv: &MoveOperands) {
        self.move_location(mv.destination, mv.source, mv.ty);
    }

    fn emit_swap(&mut self, mv: &MoveOperands) {
        let (a, b) = (mv.source, mv.destination);
        match (a, b) {
            (Location::FpuRegisterPair(..), Location::FpuRegisterPair(..)) => {
                let temp = self.masm.scratch_d();
                self.masm.vmov_d(*temp, dreg(a));
                self.masm.vmov_d(dreg(a), dreg(b));
                self.masm.vmov_d(dreg(b), *temp);
            }
            (Location::FpuRegisterPair(..), Location::DoubleStackSlot(offset))
            | (Location::DoubleStackSlot(offset), Location::FpuRegisterPair(..)) => {
                let pair = if a.is_fpu_register_pair() { a } else { b };
                let temp = self.masm.scratch_d();
                self.masm.vmov_d(*temp, dreg(pair));
                self.masm.load_d_from_offset(dreg(pair), SP, offset);
                self.masm.store_d_to_offset(*temp, SP, offset);
            }
            _ if is_wide_location(a) || is_wide_location(b) => {
                self.swap_words(a.to_low(), b.to_low());
                self.swap_words(a.to_high(), b.to_high());
            }
            _ => self.swap_words(a, b),
        }
    }
}

#[cfg(test)]
impl<'a> CodeGeneratorArm<'a> {
    /// Opens the stack map stream for instructions lowered one by one.
    pub(crate) fn begin_lowering(&mut self) {
        self.stack_maps.begin_method(
            self.frame.frame_size,
            self.frame.core_spill_mask,
            self.frame.fp_spill_mask,
            self.graph.method.number_of_vregs,
        );
    }

    /// Emits the out-of-line code of instructions lowered one by one and
    /// binds the block labels nothing bound.
    pub(crate) fn finish_lowering(mut self) -> crate::arm::test_util::Lowered {
        let body_len = self.masm.position() / 2;
        self.emit_slow_paths();
        self.emit_baker_thunks();
        for idx in 0..self.block_labels.len() {
            let label = self.block_labels[idx];
            if self.masm.offset(label).is_none() {
                self.masm.bind_label(label);
            }
        }
        let entry = self.frame_entry_label;
        if self.masm.offset(entry).is_none() {
            self.masm.bind_label(entry);
        }
        self.masm.emit_literal_pool_at_end();

        let masm = &self.masm;
        let patches = self
            .patches
            .emit(|label| masm.offset(label).expect("patch label not bound"));
        let safepoints = (0..self.stack_maps.number_of_stack_maps())
            .map(|idx| self.stack_maps.stack_map(idx).native_pc)
            .collect();
        let slow_paths = self.slow_paths.len();
        let (code, _) = self.masm.finalize();
        crate::arm::test_util::Lowered {
            code: crate::arm::test_util::to_halfwords(&code),
            body_len,
            safepoints,
            patches,
            slow_paths,
        }
    }
}

fn is_wide_location(location: Location) -> bool {
    matches!(
        location,
        Location::RegisterPair(..) | Location::FpuRegisterPair(..) | Location::DoubleStackSlot(_)
    )
}

/// Frames of an inlining chain, outermost first.
fn environment_chain(env: &Environment) -> Vec<&Environment> {
    let mut frames = Vec::new();
    let mut current = Some(env);
    while let Some(frame) = current {
        frames.push(frame);
        current = frame.parent.as_deref();
    }
    frames.reverse();
    frames
}

fn core_entry(reg: u8, saved: &SavedRegisters) -> DexRegisterLocation {
    match saved.core_slot(reg) {
        Some(offset) => DexRegisterLocation::InStack(offset),
        None => DexRegisterLocation::InRegister(reg),
    }
}

fn fp_entry(reg: u8, saved: &SavedRegisters) -> DexRegisterLocation {
    match saved.fp_slot(reg) {
        Some(offset) => DexRegisterLocation::InStack(offset),
        None => DexRegisterLocation::InFpuRegister(reg),
    }
}
