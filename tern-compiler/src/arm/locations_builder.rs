//! Location constraints of every instruction for the Thumb-2 backend.
//!
//! The register allocator only sees these summaries, so whatever the
//! lowering needs (fixed argument registers, temps, output overlap, slow
//! path calls) has to be stated here.

use tern_asm::thumb2::is_modified_immediate;

use crate::arm::{return_location, runtime_arg_location, DexCallingConvention};
use crate::error::{CompileError, CompileResult};
use crate::hir::{
    BinaryOp, DataType, FieldInfo, Graph, IfCondition, InstId, InstructionKind, LoadClassKind, LoadStringKind,
    MethodInfo, TypeCheckKind, UnaryOp,
};
use crate::locations::{CallKind, Location, LocationSummary, RegisterSet};
use crate::options::CompilerOptions;

/// Switches with more entries than this use a jump table.
pub const PACKED_SWITCH_COMPARE_JUMP_THRESHOLD: u32 = 7;

/// Largest field offset a Baker read barrier load can encode.
pub const REFERENCE_LOAD_MAX_OFFSET: u32 = 4096;

pub fn build_locations(graph: &mut Graph, options: &CompilerOptions) -> CompileResult<()> {
    let order = graph.linear_order.clone();
    for block in order {
        for inst in graph.block(block).instructions.clone() {
            if graph.inst(inst).removed {
                continue;
            }
            let summary = LocationsBuilder { graph, options }.summary_for(inst)?;
            graph.inst_mut(inst).locations = Some(summary);
        }
    }
    Ok(())
}

struct LocationsBuilder<'a> {
    graph: &'a Graph,
    options: &'a CompilerOptions,
}

impl<'a> LocationsBuilder<'a> {
    fn summary_for(&self, inst: InstId) -> CompileResult<LocationSummary> {
        let graph = self.graph;
        let instruction = graph.inst(inst);
        let inputs = instruction.inputs.len();

        let summary = match &instruction.kind {
            InstructionKind::IntConstant(_)
            | InstructionKind::LongConstant(_)
            | InstructionKind::FloatConstant(_)
            | InstructionKind::DoubleConstant(_)
            | InstructionKind::NullConstant => {
                let mut summary = LocationSummary::new(0, CallKind::NoCall);
                summary.set_out_overlap(Location::Constant(inst), false);
                summary
            }
            InstructionKind::ParameterValue { index } => {
                let mut summary = LocationSummary::new(0, CallKind::NoCall);
                let location = parameter_location(&graph.method, *index).ok_or_else(|| {
                    CompileError::InvalidGraph(format!("parameter {} out of range", index))
                })?;
                summary.set_out_overlap(location, false);
                summary
            }
            InstructionKind::CurrentMethod => {
                let mut summary = LocationSummary::new(0, CallKind::NoCall);
                summary.set_out_overlap(Location::Register(0), false);
                summary
            }
            InstructionKind::Phi => return Err(CompileError::UnsupportedInstruction(inst)),

            InstructionKind::Binary(op) => self.binary(inst, *op),
            InstructionKind::Unary(op) => self.unary(inst, *op),
            InstructionKind::BitwiseNegatedRight(_) => {
                let mut summary = LocationSummary::new(2, CallKind::NoCall);
                summary.set_in_at(0, Location::requires_register());
                summary.set_in_at(1, Location::requires_register());
                summary.set_out_overlap(Location::requires_register(), false);
                summary
            }
            InstructionKind::DataProcWithShifterOp { .. } => {
                let mut summary = LocationSummary::new(2, CallKind::NoCall);
                summary.set_in_at(0, Location::requires_register());
                summary.set_in_at(1, Location::requires_register());
                let overlaps = instruction.ty.kind() == DataType::Int64;
                summary.set_out_overlap(Location::requires_register(), overlaps);
                summary
            }
            InstructionKind::Condition { cond, .. } => self.condition(inst, *cond),
            InstructionKind::Compare { .. } => {
                let mut summary = LocationSummary::new(2, CallKind::NoCall);
                let ty = graph.inst(instruction.input(0)).ty.kind();
                if ty.is_floating_point() {
                    summary.set_in_at(0, Location::requires_fpu_register());
                    summary.set_in_at(1, self.fp_zero_or_register(instruction.input(1)));
                } else {
                    summary.set_in_at(0, Location::requires_register());
                    summary.set_in_at(1, Location::requires_register());
                }
                // The result is cleared before the operands are compared.
                summary.set_out_overlap(Location::requires_register(), true);
                summary
            }
            InstructionKind::TypeConversion => self.type_conversion(inst),

            InstructionKind::InstanceFieldGet(info) | InstructionKind::StaticFieldGet(info) => {
                self.field_get(inst, info)?
            }
            InstructionKind::InstanceFieldSet(info) | InstructionKind::StaticFieldSet(info) => self.field_set(info),
            InstructionKind::ArrayGet => self.array_get(inst),
            InstructionKind::ArraySet { needs_type_check, .. } => self.array_set(inst, *needs_type_check),
            InstructionKind::ArrayLength => {
                let mut summary = LocationSummary::new(1, CallKind::NoCall);
                summary.set_in_at(0, Location::requires_register());
                summary.set_out_overlap(Location::requires_register(), false);
                summary
            }
            InstructionKind::IntermediateAddress { .. } => {
                let mut summary = LocationSummary::new(inputs, CallKind::NoCall);
                summary.set_in_at(0, Location::requires_register());
                if inputs > 1 {
                    summary.set_in_at(1, self.constant_or_register(instruction.input(1)));
                }
                summary.set_out_overlap(Location::requires_register(), false);
                summary
            }

            InstructionKind::NullCheck => {
                let mut summary = self.throwing_summary(1);
                summary.set_in_at(0, Location::requires_register());
                summary
            }
            InstructionKind::DivZeroCheck => {
                let mut summary = self.throwing_summary(1);
                summary.set_in_at(0, self.constant_or_register(instruction.input(0)));
                summary
            }
            InstructionKind::BoundsCheck => {
                let mut summary = self.throwing_summary(2);
                summary.set_in_at(0, self.constant_or_register(instruction.input(0)));
                summary.set_in_at(1, self.constant_or_register(instruction.input(1)));
                summary
            }

            InstructionKind::LoadClass(info) => {
                let call_kind = match info.load_kind {
                    LoadClassKind::RuntimeCall => CallKind::CallOnMainOnly,
                    _ if info.must_generate_clinit_check || self.load_class_needs_slow_path(info.load_kind) => {
                        CallKind::CallOnSlowPath
                    }
                    _ => CallKind::NoCall,
                };
                let mut summary = LocationSummary::new(inputs, call_kind);
                if info.load_kind == LoadClassKind::RuntimeCall {
                    summary.set_out_overlap(Location::Register(0), false);
                    return Ok(summary);
                }
                if info.load_kind == LoadClassKind::ReferrersClass {
                    if inputs == 0 {
                        return Err(CompileError::InvalidGraph(
                            "LoadClass of the referrer without current method".into(),
                        ));
                    }
                    summary.set_in_at(0, Location::requires_register());
                }
                if call_kind == CallKind::CallOnSlowPath && self.resolution_saves_everything(info.load_kind) {
                    summary.set_custom_slow_path_caller_saves(reference_out_save_everything());
                }
                summary.set_out_overlap(Location::requires_register(), false);
                summary
            }
            InstructionKind::LoadString(info) => {
                let call_kind = match info.load_kind {
                    LoadStringKind::RuntimeCall => CallKind::CallOnMainOnly,
                    LoadStringKind::BssEntry => CallKind::CallOnSlowPath,
                    LoadStringKind::JitTableAddress if self.uses_slow_read_barrier() => CallKind::CallOnSlowPath,
                    _ => CallKind::NoCall,
                };
                let mut summary = LocationSummary::new(inputs, call_kind);
                if info.load_kind == LoadStringKind::RuntimeCall {
                    summary.set_out_overlap(Location::Register(0), false);
                    return Ok(summary);
                }
                if info.load_kind == LoadStringKind::BssEntry && !self.uses_slow_read_barrier() {
                    summary.set_custom_slow_path_caller_saves(reference_out_save_everything());
                }
                summary.set_out_overlap(Location::requires_register(), false);
                summary
            }
            InstructionKind::ClinitCheck => {
                let mut summary = LocationSummary::new(1, CallKind::CallOnSlowPath);
                summary.set_in_at(0, Location::requires_register());
                if !instruction.uses.is_empty() {
                    summary.set_out(Location::same_as_first_input());
                }
                summary.set_custom_slow_path_caller_saves(reference_out_save_everything());
                summary
            }
            InstructionKind::InstanceOf(info) => {
                let call_kind = if instance_of_calls(info.kind) || self.instance_of_needs_slow_read_barrier(info) {
                    CallKind::CallOnSlowPath
                } else {
                    CallKind::NoCall
                };
                let mut summary = LocationSummary::new(inputs, call_kind);
                summary.set_in_at(0, Location::requires_register());
                summary.set_in_at(1, Location::requires_register());
                // The result doubles as the class being walked.
                summary.set_out_overlap(Location::requires_register(), true);
                summary
            }
            InstructionKind::CheckCast(info) => {
                let mut summary = LocationSummary::new(inputs, CallKind::CallOnSlowPath);
                summary.set_in_at(0, Location::requires_register());
                summary.set_in_at(1, Location::requires_register());
                let temps = if info.kind == TypeCheckKind::Interface { 3 } else { 1 };
                summary.add_register_temps(temps);
                if self.is_type_check_slow_path_fatal(info.kind) {
                    summary.set_custom_slow_path_caller_saves(RegisterSet::empty());
                }
                summary
            }
            InstructionKind::NewInstance { .. } => {
                let mut summary = LocationSummary::new(inputs, CallKind::CallOnMainOnly);
                summary.set_in_at(0, runtime_arg_location(0, DataType::Reference));
                summary.set_out_overlap(Location::Register(0), false);
                summary
            }
            InstructionKind::NewArray { .. } => {
                let mut summary = LocationSummary::new(inputs, CallKind::CallOnMainOnly);
                summary.set_in_at(0, runtime_arg_location(0, DataType::Reference));
                summary.set_in_at(1, runtime_arg_location(1, DataType::Int32));
                summary.set_out_overlap(Location::Register(0), false);
                summary
            }
            InstructionKind::Throw => {
                let mut summary = LocationSummary::new(1, CallKind::CallOnMainOnly);
                summary.set_in_at(0, runtime_arg_location(0, DataType::Reference));
                summary
            }

            InstructionKind::InvokeStaticOrDirect(..)
            | InstructionKind::InvokeVirtual(..)
            | InstructionKind::InvokeInterface(..)
            | InstructionKind::InvokePolymorphic(_)
            | InstructionKind::InvokeCustom(..)
            | InstructionKind::InvokeUnresolved(..) => self.invoke(inst),

            InstructionKind::Goto
            | InstructionKind::TryBoundary(_)
            | InstructionKind::Exit
            | InstructionKind::ReturnVoid
            | InstructionKind::Nop
            | InstructionKind::BoundType
            | InstructionKind::ConstructorFence
            | InstructionKind::MemoryBarrier(_)
            | InstructionKind::ParallelMove(_) => LocationSummary::new(inputs, CallKind::NoCall),

            InstructionKind::If => {
                let mut summary = LocationSummary::new(1, CallKind::NoCall);
                summary.set_in_at(0, self.condition_input(instruction.input(0)));
                summary
            }
            InstructionKind::Deoptimize(_) => {
                let mut summary = LocationSummary::new(1, CallKind::CallOnSlowPath);
                summary.set_custom_slow_path_caller_saves(RegisterSet::empty());
                summary.set_in_at(0, self.condition_input(instruction.input(0)));
                summary
            }
            InstructionKind::ShouldDeoptimizeFlag => {
                let mut summary = LocationSummary::new(0, CallKind::NoCall);
                summary.set_out_overlap(Location::requires_register(), false);
                summary
            }
            InstructionKind::PackedSwitch { num_entries, .. } => {
                let mut summary = LocationSummary::new(1, CallKind::NoCall);
                summary.set_in_at(0, Location::requires_register());
                if *num_entries > PACKED_SWITCH_COMPARE_JUMP_THRESHOLD {
                    summary.add_register_temps(2);
                }
                summary
            }
            InstructionKind::Return => {
                let mut summary = LocationSummary::new(1, CallKind::NoCall);
                let ty = graph.inst(instruction.input(0)).ty;
                summary.set_in_at(0, return_location(ty));
                summary
            }
            InstructionKind::SuspendCheck => {
                let mut summary = LocationSummary::new(0, CallKind::CallOnSlowPath);
                summary.set_custom_slow_path_caller_saves(RegisterSet::empty());
                summary
            }
            InstructionKind::Select => self.select(inst),
            InstructionKind::MethodEntryHook => LocationSummary::new(0, CallKind::CallOnSlowPath),
            InstructionKind::MethodExitHook => {
                let mut summary = LocationSummary::new(inputs, CallKind::CallOnSlowPath);
                if inputs > 0 {
                    let ty = graph.inst(instruction.input(0)).ty;
                    summary.set_in_at(0, return_location(ty));
                }
                summary
            }
        };
        Ok(summary)
    }

    fn uses_slow_read_barrier(&self) -> bool {
        self.options.emit_read_barrier && !self.options.use_baker_read_barrier
    }

    fn load_class_needs_slow_path(&self, kind: LoadClassKind) -> bool {
        match kind {
            LoadClassKind::BssEntry | LoadClassKind::BssEntryPublic | LoadClassKind::BssEntryPackage => true,
            LoadClassKind::ReferrersClass | LoadClassKind::JitTableAddress => self.uses_slow_read_barrier(),
            _ => false,
        }
    }

    /// Resolution and initialization entrypoints preserve every register but
    /// the one carrying the result, unless a read barrier slow path shares
    /// the summary.
    fn resolution_saves_everything(&self, kind: LoadClassKind) -> bool {
        !(self.uses_slow_read_barrier()
            && matches!(kind, LoadClassKind::ReferrersClass | LoadClassKind::JitTableAddress))
    }

    fn instance_of_needs_slow_read_barrier(&self, info: &crate::hir::TypeCheckInfo) -> bool {
        self.uses_slow_read_barrier() && !info.target_class_in_boot_image
    }

    fn is_type_check_slow_path_fatal(&self, kind: TypeCheckKind) -> bool {
        type_check_slow_path_is_fatal(self.graph, kind)
    }

    /// Summary of a check that throws from a slow path. Without catch blocks
    /// nothing needs to survive the throw.
    fn throwing_summary(&self, inputs: usize) -> LocationSummary {
        let mut summary = LocationSummary::new(inputs, CallKind::CallOnSlowPath);
        if !self.graph.has_try_catch() {
            summary.set_custom_slow_path_caller_saves(RegisterSet::empty());
        }
        summary
    }

    fn constant_or_register(&self, input: InstId) -> Location {
        if self.graph.is_constant(input) && !self.graph.inst(input).ty.is_floating_point() {
            Location::Constant(input)
        } else if self.graph.inst(input).ty.is_floating_point() {
            Location::requires_fpu_register()
        } else {
            Location::requires_register()
        }
    }

    fn register_for(&self, ty: DataType) -> Location {
        if ty.is_floating_point() {
            Location::requires_fpu_register()
        } else {
            Location::requires_register()
        }
    }

    fn fp_zero_or_register(&self, input: InstId) -> Location {
        let is_zero = match self.graph.kind(input) {
            InstructionKind::FloatConstant(value) => value.to_bits() == 0,
            InstructionKind::DoubleConstant(value) => value.to_bits() == 0,
            _ => false,
        };
        if is_zero {
            Location::Constant(input)
        } else {
            Location::requires_fpu_register()
        }
    }

    /// Location of a boolean consumed by `If`, `Deoptimize` or `Select`.
    fn condition_input(&self, input: InstId) -> Location {
        let value = self.graph.inst(input);
        if value.emitted_at_use_site {
            Location::NoLocation
        } else if self.graph.is_constant(input) {
            Location::Constant(input)
        } else {
            Location::requires_register()
        }
    }

    fn binary(&self, inst: InstId, op: BinaryOp) -> LocationSummary {
        let graph = self.graph;
        let instruction = graph.inst(inst);
        let ty = instruction.ty.kind();
        let rhs = instruction.input(1);

        if ty.is_floating_point() {
            if op == BinaryOp::Rem {
                let mut summary = LocationSummary::new(2, CallKind::CallOnMainOnly);
                summary.set_in_at(0, runtime_arg_location(0, ty));
                summary.set_in_at(1, runtime_arg_location(1, ty));
                summary.set_out_overlap(return_location(ty), false);
                return summary;
            }
            let mut summary = LocationSummary::new(2, CallKind::NoCall);
            summary.set_in_at(0, Location::requires_fpu_register());
            summary.set_in_at(1, Location::requires_fpu_register());
            summary.set_out_overlap(Location::requires_fpu_register(), false);
            return summary;
        }

        let is_long = ty == DataType::Int64;
        let mut summary = LocationSummary::new(2, CallKind::NoCall);
        summary.set_in_at(0, Location::requires_register());

        match op {
            BinaryOp::Add | BinaryOp::Sub => {
                let rhs_location = match graph.constant_as_i64(rhs) {
                    Some(_) if !is_long => Location::Constant(rhs),
                    Some(value) => {
                        let value = if op == BinaryOp::Sub { value.wrapping_neg() } else { value };
                        if long_add_constant_encodable(value) {
                            Location::Constant(rhs)
                        } else {
                            Location::requires_register()
                        }
                    }
                    None => Location::requires_register(),
                };
                summary.set_in_at(1, rhs_location);
                summary.set_out_overlap(Location::requires_register(), false);
            }
            BinaryOp::Mul => {
                summary.set_in_at(1, Location::requires_register());
                // The high word is built before the low inputs are read.
                summary.set_out_overlap(Location::requires_register(), is_long);
            }
            BinaryOp::Div | BinaryOp::Rem => return self.div_rem(inst, op),
            BinaryOp::And | BinaryOp::Or | BinaryOp::Xor => {
                summary.set_in_at(1, self.constant_or_register(rhs));
                summary.set_out_overlap(Location::requires_register(), false);
            }
            BinaryOp::Shl | BinaryOp::Shr | BinaryOp::UShr | BinaryOp::Ror | BinaryOp::Rol => {
                let constant = graph.is_constant(rhs);
                summary.set_in_at(1, self.constant_or_register(rhs));
                if is_long {
                    let rotate = matches!(op, BinaryOp::Ror | BinaryOp::Rol);
                    if rotate && !constant {
                        summary.add_register_temps(2);
                    }
                    summary.set_out_overlap(Location::requires_register(), true);
                } else {
                    // A register amount is masked into the output first.
                    summary.set_out_overlap(Location::requires_register(), !constant);
                }
            }
        }
        summary
    }

    fn div_rem(&self, inst: InstId, op: BinaryOp) -> LocationSummary {
        let graph = self.graph;
        let instruction = graph.inst(inst);
        let ty = instruction.ty.kind();
        let rhs = instruction.input(1);

        if ty == DataType::Int64 {
            let mut summary = LocationSummary::new(2, CallKind::CallOnMainOnly);
            summary.set_in_at(0, Location::register_pair(0, 1));
            summary.set_in_at(1, Location::register_pair(2, 3));
            let out = if op == BinaryOp::Div {
                Location::register_pair(0, 1)
            } else {
                Location::register_pair(2, 3)
            };
            summary.set_out_overlap(out, false);
            return summary;
        }

        if let Some(divisor) = graph.int_constant(rhs) {
            let mut summary = LocationSummary::new(2, CallKind::NoCall);
            summary.set_in_at(0, Location::requires_register());
            summary.set_in_at(1, Location::Constant(rhs));
            summary.add_register_temps(div_by_constant_temps(divisor));
            summary.set_out_overlap(Location::requires_register(), false);
            return summary;
        }

        if self.options.features.has_div {
            let mut summary = LocationSummary::new(2, CallKind::NoCall);
            summary.set_in_at(0, Location::requires_register());
            summary.set_in_at(1, Location::requires_register());
            if op == BinaryOp::Rem {
                summary.add_register_temps(1);
            }
            summary.set_out_overlap(Location::requires_register(), false);
            return summary;
        }

        let mut summary = LocationSummary::new(2, CallKind::CallOnMainOnly);
        summary.set_in_at(0, runtime_arg_location(0, DataType::Int32));
        summary.set_in_at(1, runtime_arg_location(1, DataType::Int32));
        // The runtime returns the quotient in R0 and the remainder in R1.
        let out = if op == BinaryOp::Div {
            Location::Register(0)
        } else {
            Location::Register(1)
        };
        summary.set_out_overlap(out, false);
        summary
    }

    fn unary(&self, inst: InstId, op: UnaryOp) -> LocationSummary {
        let ty = self.graph.inst(inst).ty.kind();
        let mut summary = LocationSummary::new(1, CallKind::NoCall);
        summary.set_in_at(0, self.register_for(ty));
        let overlaps = op == UnaryOp::Neg && ty == DataType::Int64;
        summary.set_out_overlap(self.register_for(ty), overlaps);
        summary
    }

    fn condition(&self, inst: InstId, cond: IfCondition) -> LocationSummary {
        let graph = self.graph;
        let instruction = graph.inst(inst);
        let ty = graph.inst(instruction.input(0)).ty.kind();
        let rhs = instruction.input(1);
        let mut summary = LocationSummary::new(2, CallKind::NoCall);

        match ty {
            DataType::Float32 | DataType::Float64 => {
                summary.set_in_at(0, Location::requires_fpu_register());
                summary.set_in_at(1, self.fp_zero_or_register(rhs));
            }
            DataType::Int64 => {
                summary.set_in_at(0, Location::requires_register());
                let decided = graph
                    .constant_as_i64(rhs)
                    .and_then(|value| long_condition_outcome(cond, value));
                let rhs_location = if decided.is_some() {
                    Location::Constant(rhs)
                } else {
                    Location::requires_register()
                };
                summary.set_in_at(1, rhs_location);
            }
            _ => {
                summary.set_in_at(0, Location::requires_register());
                summary.set_in_at(1, self.constant_or_register(rhs));
            }
        }

        if !instruction.emitted_at_use_site {
            // The result is cleared after the compare, so it must not alias
            // an operand.
            summary.set_out_overlap(Location::requires_register(), true);
        }
        summary
    }

    fn type_conversion(&self, inst: InstId) -> LocationSummary {
        let graph = self.graph;
        let instruction = graph.inst(inst);
        let from = graph.inst(instruction.input(0)).ty.kind();
        let to = instruction.ty.kind();

        let runtime = match (from, to) {
            (DataType::Int64, DataType::Float32) | (DataType::Int64, DataType::Float64) => true,
            (DataType::Float32, DataType::Int64) | (DataType::Float64, DataType::Int64) => true,
            _ => false,
        };
        if runtime {
            let mut summary = LocationSummary::new(1, CallKind::CallOnMainOnly);
            summary.set_in_at(0, runtime_arg_location(0, from));
            summary.set_out_overlap(return_location(to), false);
            return summary;
        }

        let mut summary = LocationSummary::new(1, CallKind::NoCall);
        summary.set_in_at(0, self.register_for(from));
        if from.is_floating_point() && !to.is_floating_point() {
            summary.add_temp(Location::requires_fpu_register());
        }
        summary.set_out_overlap(self.register_for(to), false);
        summary
    }

    fn field_get(&self, inst: InstId, info: &FieldInfo) -> CompileResult<LocationSummary> {
        let ty = self.graph.inst(inst).ty.kind();
        let is_reference = info.field_type.is_reference();
        let needs_barrier = is_reference && self.options.emit_read_barrier;
        if needs_barrier && info.offset >= REFERENCE_LOAD_MAX_OFFSET {
            return Err(CompileError::UnsupportedInstruction(inst));
        }

        let call_kind = if needs_barrier && !self.options.use_baker_read_barrier {
            CallKind::CallOnSlowPath
        } else {
            CallKind::NoCall
        };
        let mut summary = LocationSummary::new(1, call_kind);
        summary.set_in_at(0, Location::requires_register());

        let wide_volatile = info.is_volatile && ty.is_64bit() && !self.options.features.atomic_ldrd_strd();
        if wide_volatile && ty == DataType::Float64 {
            summary.add_register_temps(2);
        }
        // A marked reference is written by the thunk while the holder is
        // still needed.
        summary.set_out_overlap(self.register_for(ty), needs_barrier);
        Ok(summary)
    }

    fn field_set(&self, info: &FieldInfo) -> LocationSummary {
        let ty = info.field_type.kind();
        let mut summary = LocationSummary::new(2, CallKind::NoCall);
        summary.set_in_at(0, Location::requires_register());
        summary.set_in_at(1, self.register_for(ty));

        let wide_volatile = info.is_volatile && ty.is_64bit() && !self.options.features.atomic_ldrd_strd();
        if wide_volatile {
            // Exclusive pair for the store loop, plus the value moved to core
            // registers for doubles.
            summary.add_register_temps(2);
            if ty == DataType::Float64 {
                summary.add_register_temps(2);
            }
        } else if ty.is_reference() {
            summary.add_register_temps(2);
        }
        summary
    }

    fn array_get(&self, inst: InstId) -> LocationSummary {
        let graph = self.graph;
        let instruction = graph.inst(inst);
        let ty = instruction.ty.kind();
        let needs_barrier = ty.is_reference() && self.options.emit_read_barrier;
        let call_kind = if needs_barrier && !self.options.use_baker_read_barrier {
            CallKind::CallOnSlowPath
        } else {
            CallKind::NoCall
        };

        let mut summary = LocationSummary::new(2, call_kind);
        summary.set_in_at(0, Location::requires_register());
        let index = instruction.input(1);
        summary.set_in_at(1, self.constant_or_register(index));
        if needs_barrier && self.options.use_baker_read_barrier && !graph.is_constant(index) {
            // Base of the element load, which the thunk reads back.
            summary.add_register_temps(1);
        }
        summary.set_out_overlap(self.register_for(ty), needs_barrier);
        summary
    }

    fn array_set(&self, inst: InstId, needs_type_check: bool) -> LocationSummary {
        let graph = self.graph;
        let instruction = graph.inst(inst);
        let value_type = graph.inst(instruction.input(2)).ty.kind();
        let call_kind = if needs_type_check {
            CallKind::CallOnSlowPath
        } else {
            CallKind::NoCall
        };

        let mut summary = LocationSummary::new(3, call_kind);
        summary.set_in_at(0, Location::requires_register());
        summary.set_in_at(1, self.constant_or_register(instruction.input(1)));
        summary.set_in_at(2, self.register_for(value_type));
        if value_type.is_reference() {
            summary.add_register_temps(2);
        }
        summary
    }

    fn invoke(&self, inst: InstId) -> LocationSummary {
        let graph = self.graph;
        let instruction = graph.inst(inst);
        let argument_count = instruction
            .kind
            .invoke_info()
            .map(|info| info.number_of_arguments as usize)
            .unwrap_or(0)
            .min(instruction.inputs.len());

        let mut summary = LocationSummary::new(instruction.inputs.len(), CallKind::CallOnMainOnly);
        let mut convention = DexCallingConvention::new();
        for idx in 0..argument_count {
            let ty = graph.inst(instruction.input(idx)).ty;
            summary.set_in_at(idx, convention.next(ty));
        }
        // The callee method travels in R0.
        summary.add_temp(Location::Register(0));
        if instruction.has_output() {
            summary.set_out_overlap(return_location(instruction.ty), false);
        }
        summary
    }

    fn select(&self, inst: InstId) -> LocationSummary {
        let graph = self.graph;
        let instruction = graph.inst(inst);
        let ty = instruction.ty.kind();
        let mut summary = LocationSummary::new(3, CallKind::NoCall);

        if ty.is_floating_point() {
            summary.set_in_at(0, Location::requires_fpu_register());
            summary.set_in_at(1, Location::requires_fpu_register());
        } else {
            summary.set_in_at(0, Location::requires_register());
            let true_value = instruction.input(1);
            let narrow_constant = ty != DataType::Int64
                && graph
                    .int_constant(true_value)
                    .map(|value| (0..256).contains(&value))
                    .unwrap_or(false);
            if narrow_constant {
                summary.set_in_at(1, Location::Constant(true_value));
            } else {
                summary.set_in_at(1, Location::requires_register());
            }
        }
        summary.set_in_at(2, self.condition_input(instruction.input(2)));
        summary.set_out(self.register_for(ty));
        summary
    }
}

/// A failing `CheckCast` of these kinds always throws, and without catch
/// blocks nothing needs to survive the throw.
pub fn type_check_slow_path_is_fatal(graph: &Graph, kind: TypeCheckKind) -> bool {
    matches!(
        kind,
        TypeCheckKind::Exact | TypeCheckKind::AbstractClass | TypeCheckKind::ClassHierarchy | TypeCheckKind::ArrayObject
    ) && !graph.has_try_catch()
}

/// SaveEverything entrypoints still clobber R0 with their result.
fn reference_out_save_everything() -> RegisterSet {
    RegisterSet::new(1, 0)
}

fn instance_of_calls(kind: TypeCheckKind) -> bool {
    matches!(
        kind,
        TypeCheckKind::ArrayCheck | TypeCheckKind::Unresolved | TypeCheckKind::Interface
    )
}

/// Location of parameter `index`; the receiver of an instance method is
/// parameter 0.
pub fn parameter_location(method: &MethodInfo, index: u32) -> Option<Location> {
    let mut types = Vec::with_capacity(method.shorty.len());
    if !method.is_static {
        types.push(DataType::Reference);
    }
    types.extend(method.shorty.iter().skip(1).copied());

    let mut convention = DexCallingConvention::new();
    let mut location = None;
    for ty in types.iter().take(index as usize + 1) {
        location = Some(convention.next(*ty));
    }
    if index as usize >= types.len() {
        return None;
    }
    location
}

/// ADDS on the low word always works; the high word needs an ADC or SBC
/// immediate.
pub fn long_add_constant_encodable(value: i64) -> bool {
    let high = (value >> 32) as u32;
    is_modified_immediate(high) || is_modified_immediate(!high)
}

/// Comparisons of a long against the extreme values of its range have a
/// fixed outcome.
pub fn long_condition_outcome(cond: IfCondition, value: i64) -> Option<bool> {
    match cond {
        IfCondition::Lt if value == i64::MIN => Some(false),
        IfCondition::Ge if value == i64::MIN => Some(true),
        IfCondition::Gt if value == i64::MAX => Some(false),
        IfCondition::Le if value == i64::MAX => Some(true),
        IfCondition::B if value == 0 => Some(false),
        IfCondition::Ae if value == 0 => Some(true),
        IfCondition::A if value == -1 => Some(false),
        IfCondition::Be if value == -1 => Some(true),
        _ => None,
    }
}

/// Temps needed to divide by the constant `divisor`.
pub fn div_by_constant_temps(divisor: i32) -> usize {
    let magnitude = divisor.unsigned_abs();
    if divisor == 0 || magnitude == 1 {
        0
    } else if magnitude.is_power_of_two() {
        1
    } else {
        2
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hir::MethodInfo;

    #[test]
    fn test_parameter_locations() {
        let method = MethodInfo::new("m", false, vec![DataType::Void, DataType::Int64, DataType::Float32]);
        assert_eq!(parameter_location(&method, 0), Some(Location::Register(1)));
        assert_eq!(parameter_location(&method, 1), Some(Location::register_pair(2, 3)));
        assert_eq!(parameter_location(&method, 2), Some(Location::FpuRegister(0)));
        assert_eq!(parameter_location(&method, 3), None);
    }

    #[test]
    fn test_long_condition_outcome() {
        assert_eq!(long_condition_outcome(IfCondition::Lt, i64::MIN), Some(false));
        assert_eq!(long_condition_outcome(IfCondition::Ge, i64::MIN), Some(true));
        assert_eq!(long_condition_outcome(IfCondition::Gt, i64::MAX), Some(false));
        assert_eq!(long_condition_outcome(IfCondition::Le, i64::MAX), Some(true));
        assert_eq!(long_condition_outcome(IfCondition::Lt, 0), None);
        assert_eq!(long_condition_outcome(IfCondition::Eq, i64::MIN), None);
    }

    #[test]
    fn test_div_by_constant_temps() {
        assert_eq!(div_by_constant_temps(1), 0);
        assert_eq!(div_by_constant_temps(-1), 0);
        assert_eq!(div_by_constant_temps(8), 1);
        assert_eq!(div_by_constant_temps(i32::MIN), 1);
        assert_eq!(div_by_constant_temps(7), 2);
    }

    #[test]
    fn test_long_add_constant() {
        assert!(long_add_constant_encodable(0x1_0000_0005));
        assert!(long_add_constant_encodable(-1));
        assert!(!long_add_constant_encodable(0x1234_5678_0000_0000));
    }

    #[test]
    fn test_shift_by_register_overlaps() {
        let mut graph = Graph::new(MethodInfo::new("s", true, vec![DataType::Int32, DataType::Int32, DataType::Int32]));
        let entry = graph.entry_block;
        let a = graph.add(entry, InstructionKind::ParameterValue { index: 0 }, DataType::Int32, &[]);
        let b = graph.add(entry, InstructionKind::ParameterValue { index: 1 }, DataType::Int32, &[]);
        let c = graph.add(entry, InstructionKind::IntConstant(3), DataType::Int32, &[]);
        let by_reg = graph.add(entry, InstructionKind::Binary(BinaryOp::Shl), DataType::Int32, &[a, b]);
        let by_const = graph.add(entry, InstructionKind::Binary(BinaryOp::Shl), DataType::Int32, &[a, c]);
        graph.add(entry, InstructionKind::ReturnVoid, DataType::Void, &[]);
        graph.compute_linear_order();

        build_locations(&mut graph, &CompilerOptions::default()).unwrap();
        assert!(graph.inst(by_reg).locations().output_overlaps);
        assert!(!graph.inst(by_const).locations().output_overlaps);
        assert_eq!(graph.inst(by_const).locations().in_at(1), Location::Constant(c));
        assert_eq!(graph.inst(c).locations().out(), Location::Constant(c));
        assert_eq!(graph.inst(b).locations().out(), Location::Register(2));
    }

    #[test]
    fn test_invoke_arguments_follow_dex_convention() {
        let mut graph = Graph::new(MethodInfo::new("i", true, vec![DataType::Void, DataType::Int64]));
        let entry = graph.entry_block;
        let wide = graph.add(entry, InstructionKind::ParameterValue { index: 0 }, DataType::Int64, &[]);
        let info = crate::hir::InvokeInfo {
            method_index: 3,
            dex_file: 0,
            number_of_arguments: 1,
            intrinsified: false,
        };
        let call = graph.add(
            entry,
            InstructionKind::InvokeStaticOrDirect(
                info,
                crate::hir::MethodLoadKind::RuntimeCall,
                crate::hir::CodePtrLocation::CallArtMethod,
            ),
            DataType::Int32,
            &[wide],
        );
        graph.add(entry, InstructionKind::ReturnVoid, DataType::Void, &[]);
        graph.compute_linear_order();

        build_locations(&mut graph, &CompilerOptions::default()).unwrap();
        let summary = graph.inst(call).locations();
        assert_eq!(summary.in_at(0), Location::register_pair(2, 3));
        assert_eq!(summary.temp(0), Location::Register(0));
        assert_eq!(summary.out(), Location::Register(0));
        assert!(summary.will_call());
    }
}
