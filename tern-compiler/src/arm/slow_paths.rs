//! Out-of-line code reached from the fast path of an instruction.
//!
//! Slow paths are collected while the method body is generated and emitted
//! after it, in insertion order. A slow path that returns branches back to
//! its exit label, which the fast path binds right behind the branch into
//! the slow path. Fatal slow paths (throws, deoptimization) never return.

use tern_asm::thumb2::{DataOp, LoadKind, Register, Shift, StoreKind, LR, R0, R1, R2, SP};
use tern_asm::Label;

use crate::arm::codegen::CodeGeneratorArm;
use crate::arm::{caller_save_set, runtime_arg_location, sreg, TR};
use crate::hir::{BlockId, DataType, DeoptimizationKind, Environment, InstId, InstructionKind};
use crate::locations::{Location, MoveOperands, RegisterSet};
use crate::runtime::{profiling, QuickEntrypoint};

#[derive(Clone, PartialEq, Debug)]
pub enum SlowPathKind {
    NullCheck,
    DivZeroCheck,
    BoundsCheck,
    SuspendCheck {
        successor: Option<BlockId>,
    },
    LoadClass {
        cls: InstId,
        must_resolve: bool,
        do_clinit: bool,
    },
    LoadString,
    TypeCheck {
        fatal: bool,
    },
    Deoptimization(DeoptimizationKind),
    ArraySet,
    ReadBarrierForHeapReference {
        out: Location,
        reference: Location,
        obj: Location,
        offset: u32,
        index: Location,
    },
    ReadBarrierForRoot {
        out: Location,
        root: Location,
    },
    MethodEntryExitHook,
    /// Resets the hotness counter at `[base + offset]` and requests an
    /// optimized compile.
    CompileOptimized {
        base: Register,
        offset: i32,
    },
}

impl SlowPathKind {
    pub fn is_fatal(&self) -> bool {
        match self {
            SlowPathKind::NullCheck
            | SlowPathKind::DivZeroCheck
            | SlowPathKind::BoundsCheck
            | SlowPathKind::Deoptimization(_) => true,
            SlowPathKind::TypeCheck { fatal } => *fatal,
            _ => false,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SlowPathKind::NullCheck => "NullCheckSlowPath",
            SlowPathKind::DivZeroCheck => "DivZeroCheckSlowPath",
            SlowPathKind::BoundsCheck => "BoundsCheckSlowPath",
            SlowPathKind::SuspendCheck { .. } => "SuspendCheckSlowPath",
            SlowPathKind::LoadClass { .. } => "LoadClassSlowPath",
            SlowPathKind::LoadString => "LoadStringSlowPath",
            SlowPathKind::TypeCheck { .. } => "TypeCheckSlowPath",
            SlowPathKind::Deoptimization(_) => "DeoptimizationSlowPath",
            SlowPathKind::ArraySet => "ArraySetSlowPath",
            SlowPathKind::ReadBarrierForHeapReference { .. } => "ReadBarrierForHeapReferenceSlowPath",
            SlowPathKind::ReadBarrierForRoot { .. } => "ReadBarrierForRootSlowPath",
            SlowPathKind::MethodEntryExitHook => "MethodEntryExitHookSlowPath",
            SlowPathKind::CompileOptimized { .. } => "CompileOptimizedSlowPath",
        }
    }
}

#[derive(Clone, Debug)]
pub struct SlowPath {
    pub kind: SlowPathKind,
    /// Instruction the slow path belongs to; none for the frame entry
    /// hotness check.
    pub inst: Option<InstId>,
    pub entry: Label,
    pub exit: Label,
}

/// What makes two fatal slow paths interchangeable.
#[derive(PartialEq, Debug)]
struct SharingKey {
    kind: SlowPathKind,
    dex_pc: u32,
    live: RegisterSet,
    inputs: Vec<Location>,
    environment: Option<Environment>,
}

#[derive(Default)]
pub struct SlowPathRegistry {
    paths: Vec<SlowPath>,
    shared: Vec<(SharingKey, usize)>,
}

impl SlowPathRegistry {
    pub fn new() -> SlowPathRegistry {
        SlowPathRegistry::default()
    }

    pub fn add(&mut self, path: SlowPath) -> usize {
        self.paths.push(path);
        self.paths.len() - 1
    }

    pub fn get(&self, idx: usize) -> &SlowPath {
        &self.paths[idx]
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SlowPath> {
        self.paths.iter()
    }

    fn find_shared(&self, key: &SharingKey) -> Option<usize> {
        self.shared.iter().find(|(k, _)| k == key).map(|&(_, idx)| idx)
    }

    fn register_shared(&mut self, key: SharingKey, idx: usize) {
        self.shared.push((key, idx));
    }
}

/// Stack slots (relative to SP) of registers saved by a slow path.
#[derive(Default, Debug)]
pub struct SavedRegisters {
    pub core: Vec<(u8, i32)>,
    pub fp: Vec<(u8, i32)>,
}

impl SavedRegisters {
    pub fn core_slot(&self, reg: u8) -> Option<i32> {
        self.core.iter().find(|&&(r, _)| r == reg).map(|&(_, offset)| offset)
    }

    pub fn fp_slot(&self, reg: u8) -> Option<i32> {
        self.fp.iter().find(|&&(r, _)| r == reg).map(|&(_, offset)| offset)
    }
}

impl<'a> CodeGeneratorArm<'a> {
    pub(crate) fn add_slow_path(&mut self, kind: SlowPathKind, inst: Option<InstId>) -> usize {
        let entry = self.masm.create_label();
        let exit = self.masm.create_label();
        self.slow_paths.add(SlowPath { kind, inst, entry, exit })
    }

    /// Like `add_slow_path`, but reuses an identical fatal slow path of an
    /// earlier instruction.
    pub(crate) fn add_shared_slow_path(&mut self, kind: SlowPathKind, inst: InstId) -> usize {
        debug_assert!(kind.is_fatal());
        let instruction = self.graph.inst(inst);
        let locations = instruction.locations();
        let key = SharingKey {
            kind: kind.clone(),
            dex_pc: instruction.dex_pc,
            live: locations.live_registers,
            inputs: locations.inputs.clone(),
            environment: instruction.environment.clone(),
        };
        if let Some(idx) = self.slow_paths.find_shared(&key) {
            return idx;
        }
        let idx = self.add_slow_path(kind, Some(inst));
        self.slow_paths.register_shared(key, idx);
        idx
    }

    pub(crate) fn slow_path_entry(&self, idx: usize) -> Label {
        self.slow_paths.get(idx).entry
    }

    pub(crate) fn slow_path_exit(&self, idx: usize) -> Label {
        self.slow_paths.get(idx).exit
    }

    /// Stores the live caller-save registers of `inst` to the slow path
    /// spill area.
    pub(crate) fn save_live_registers(&mut self, inst: InstId) -> SavedRegisters {
        let graph = self.graph;
        let locations = graph.inst(inst).locations();
        let caller_saves = locations
            .custom_slow_path_caller_saves
            .unwrap_or_else(caller_save_set);
        let mut live = locations.live_registers.intersect(caller_saves);
        live.remove(locations.out());

        let mut saved = SavedRegisters::default();
        let mut offset = self.frame.slow_path_spill_offset() as i32;
        for reg in 0..16u8 {
            if live.contains_core(reg) {
                self.masm
                    .store_to_offset(StoreKind::Word, Register::new(reg), SP, offset);
                saved.core.push((reg, offset));
                offset += 4;
            }
        }
        for reg in 0..32u8 {
            if live.contains_fp(reg) {
                self.masm.store_s_to_offset(sreg(Location::FpuRegister(reg)), SP, offset);
                saved.fp.push((reg, offset));
                offset += 4;
            }
        }
        debug_assert!(
            offset as u32 <= self.frame.slow_path_spill_offset() + self.frame.slow_path_spill_size,
            "slow path spill area too small"
        );
        saved
    }

    pub(crate) fn restore_live_registers(&mut self, saved: &SavedRegisters) {
        for &(reg, offset) in &saved.core {
            self.masm
                .load_from_offset(LoadKind::Word, Register::new(reg), SP, offset);
        }
        for &(reg, offset) in &saved.fp {
            self.masm.load_s_from_offset(sreg(Location::FpuRegister(reg)), SP, offset);
        }
    }

    pub(crate) fn emit_slow_paths(&mut self) {
        for idx in 0..self.slow_paths.len() {
            let path = self.slow_paths.get(idx).clone();
            self.masm.comment(|| path.kind.name().to_string());
            self.masm.bind_label(path.entry);
            self.emit_slow_path(&path);
            self.masm.maybe_emit_literal_pool(crate::arm::masm::DEFAULT_POOL_MARGIN);
        }
    }

    fn emit_slow_path(&mut self, path: &SlowPath) {
        match path.kind {
            SlowPathKind::NullCheck => self.emit_throwing_slow_path(path, QuickEntrypoint::ThrowNullPointer),
            SlowPathKind::DivZeroCheck => self.emit_throwing_slow_path(path, QuickEntrypoint::ThrowDivZero),
            SlowPathKind::BoundsCheck => self.emit_bounds_check_slow_path(path),
            SlowPathKind::SuspendCheck { successor } => {
                let inst = instruction_of(path);
                let saved = self.save_live_registers(inst);
                self.invoke_runtime(QuickEntrypoint::TestSuspend, Some(inst), Some(&saved));
                self.restore_live_registers(&saved);
                match successor {
                    Some(block) => {
                        let target = self.block_label(block);
                        self.masm.b(target);
                    }
                    None => self.masm.b(path.exit),
                }
            }
            SlowPathKind::LoadClass {
                cls,
                must_resolve,
                do_clinit,
            } => self.emit_load_class_slow_path(path, cls, must_resolve, do_clinit),
            SlowPathKind::LoadString => {
                let inst = instruction_of(path);
                let graph = self.graph;
                let string_index = match graph.kind(inst) {
                    InstructionKind::LoadString(info) => info.string_index,
                    other => panic!("LoadString slow path on {}", other.name()),
                };
                let out = graph.inst(inst).locations().out();
                let saved = self.save_live_registers(inst);
                self.masm.load_const(R0, string_index as i32);
                self.invoke_runtime(QuickEntrypoint::ResolveString, Some(inst), Some(&saved));
                self.move_location(out, Location::Register(0), DataType::Reference);
                self.restore_live_registers(&saved);
                self.masm.b(path.exit);
            }
            SlowPathKind::TypeCheck { fatal } => self.emit_type_check_slow_path(path, fatal),
            SlowPathKind::Deoptimization(kind) => {
                let inst = instruction_of(path);
                let saved = self.save_live_registers(inst);
                self.masm.load_const(R0, u8::from(kind) as i32);
                self.invoke_runtime(QuickEntrypoint::Deoptimize, Some(inst), Some(&saved));
            }
            SlowPathKind::ArraySet => {
                let inst = instruction_of(path);
                let locations = self.graph.inst(inst).locations();
                let saved = self.save_live_registers(inst);
                self.parallel_move(vec![
                    MoveOperands::new(locations.in_at(0), Location::Register(0), DataType::Reference, None),
                    MoveOperands::new(locations.in_at(1), Location::Register(1), DataType::Int32, None),
                    MoveOperands::new(locations.in_at(2), Location::Register(2), DataType::Reference, None),
                ]);
                self.invoke_runtime(QuickEntrypoint::AputObject, Some(inst), Some(&saved));
                self.restore_live_registers(&saved);
                self.masm.b(path.exit);
            }
            SlowPathKind::ReadBarrierForHeapReference {
                out,
                reference,
                obj,
                offset,
                index,
            } => {
                let inst = instruction_of(path);
                let saved = self.save_live_registers(inst);
                let mut moves = vec![
                    MoveOperands::new(reference, Location::Register(0), DataType::Reference, None),
                    MoveOperands::new(obj, Location::Register(1), DataType::Reference, None),
                ];
                if index.is_valid() && !index.is_constant() {
                    moves.push(MoveOperands::new(index, Location::Register(2), DataType::Int32, None));
                }
                self.parallel_move(moves);
                if index.is_constant() {
                    let value = self.graph.int_constant(index.constant()).unwrap_or(0);
                    self.masm.load_const(R2, (value << 2).wrapping_add(offset as i32));
                } else if index.is_valid() {
                    // Element offset of a reference array access.
                    self.masm.shift_imm_w(Shift::LSL, false, R2, R2, 2);
                    self.masm.add_constant(R2, R2, offset as i32);
                } else {
                    self.masm.load_const(R2, offset as i32);
                }
                self.invoke_runtime(QuickEntrypoint::ReadBarrierSlow, Some(inst), Some(&saved));
                self.move_location(out, Location::Register(0), DataType::Reference);
                self.restore_live_registers(&saved);
                self.masm.b(path.exit);
            }
            SlowPathKind::ReadBarrierForRoot { out, root } => {
                let inst = instruction_of(path);
                let saved = self.save_live_registers(inst);
                self.move_location(Location::Register(0), root, DataType::Reference);
                self.invoke_runtime(QuickEntrypoint::ReadBarrierForRootSlow, Some(inst), Some(&saved));
                self.move_location(out, Location::Register(0), DataType::Reference);
                self.restore_live_registers(&saved);
                self.masm.b(path.exit);
            }
            SlowPathKind::MethodEntryExitHook => {
                let inst = instruction_of(path);
                let is_entry = matches!(self.graph.kind(inst), InstructionKind::MethodEntryHook);
                let saved = self.save_live_registers(inst);
                let entrypoint = if is_entry {
                    QuickEntrypoint::MethodEntryHook
                } else {
                    self.masm.load_const(R2, self.frame.frame_size as i32);
                    QuickEntrypoint::MethodExitHook
                };
                self.invoke_runtime(entrypoint, Some(inst), Some(&saved));
                self.restore_live_registers(&saved);
                self.masm.b(path.exit);
            }
            SlowPathKind::CompileOptimized { base, offset } => {
                {
                    let temp = self.masm.scratch();
                    self.masm
                        .load_const(*temp, profiling::INITIAL_HOTNESS as i32);
                    self.masm.store_to_offset(StoreKind::Half, *temp, base, offset);
                }
                // The entrypoint never suspends, so no stack map is recorded.
                self.masm
                    .load_from_offset(LoadKind::Word, LR, TR, QuickEntrypoint::CompileOptimized.offset());
                self.masm.blx(LR);
                self.masm.b(path.exit);
            }
        }
    }

    fn emit_throwing_slow_path(&mut self, path: &SlowPath, entrypoint: QuickEntrypoint) {
        let inst = instruction_of(path);
        let saved = if self.graph.has_try_catch() {
            self.save_live_registers(inst)
        } else {
            SavedRegisters::default()
        };
        self.invoke_runtime(entrypoint, Some(inst), Some(&saved));
    }

    fn emit_bounds_check_slow_path(&mut self, path: &SlowPath) {
        let inst = instruction_of(path);
        let locations = self.graph.inst(inst).locations();
        let saved = if self.graph.has_try_catch() {
            self.save_live_registers(inst)
        } else {
            SavedRegisters::default()
        };
        self.parallel_move(vec![
            MoveOperands::new(locations.in_at(0), runtime_arg_location(0, DataType::Int32), DataType::Int32, None),
            MoveOperands::new(locations.in_at(1), runtime_arg_location(1, DataType::Int32), DataType::Int32, None),
        ]);
        self.invoke_runtime(QuickEntrypoint::ThrowArrayBounds, Some(inst), Some(&saved));
    }

    fn emit_load_class_slow_path(&mut self, path: &SlowPath, cls: InstId, must_resolve: bool, do_clinit: bool) {
        let inst = instruction_of(path);
        let graph = self.graph;
        let locations = graph.inst(inst).locations();
        let out = locations.out();
        let saved = self.save_live_registers(inst);

        let info = match graph.kind(cls) {
            InstructionKind::LoadClass(info) => *info,
            other => panic!("LoadClass slow path on {}", other.name()),
        };
        if must_resolve {
            self.masm.load_const(R0, info.type_index as i32);
            let entrypoint = if info.needs_access_check {
                QuickEntrypoint::ResolveTypeAndVerifyAccess
            } else {
                QuickEntrypoint::ResolveType
            };
            self.invoke_runtime(entrypoint, Some(inst), Some(&saved));
        } else {
            debug_assert!(do_clinit);
            let source = if matches!(graph.kind(inst), InstructionKind::LoadClass(_)) {
                out
            } else {
                locations.in_at(0)
            };
            self.move_location(Location::Register(0), source, DataType::Reference);
        }
        if do_clinit {
            self.invoke_runtime(QuickEntrypoint::InitializeStaticStorage, Some(inst), Some(&saved));
        }
        if out.is_register() {
            debug_assert!(!locations.live_registers.contains_core(out.reg()));
            self.move_location(out, Location::Register(0), DataType::Reference);
        }
        self.restore_live_registers(&saved);
        self.masm.b(path.exit);
    }

    fn emit_type_check_slow_path(&mut self, path: &SlowPath, fatal: bool) {
        let inst = instruction_of(path);
        let graph = self.graph;
        let locations = graph.inst(inst).locations();
        let saved = if !fatal || graph.has_try_catch() {
            self.save_live_registers(inst)
        } else {
            SavedRegisters::default()
        };
        self.parallel_move(vec![
            MoveOperands::new(locations.in_at(0), Location::Register(0), DataType::Reference, None),
            MoveOperands::new(locations.in_at(1), Location::Register(1), DataType::Reference, None),
        ]);
        if matches!(graph.kind(inst), InstructionKind::InstanceOf(_)) {
            self.invoke_runtime(QuickEntrypoint::InstanceofNonTrivial, Some(inst), Some(&saved));
            self.move_location(locations.out(), Location::Register(0), DataType::Int32);
        } else {
            self.invoke_runtime(QuickEntrypoint::CheckInstanceOf, Some(inst), Some(&saved));
        }
        if !fatal {
            self.restore_live_registers(&saved);
            self.masm.b(path.exit);
        }
    }

    /// Finds a caller-save core register not used by `inst`.
    pub(crate) fn free_caller_save_register(&self, inst: InstId) -> Register {
        let locations = self.graph.inst(inst).locations();
        let mut used = 0u32;
        for location in locations.inputs.iter().chain(&locations.temps) {
            used |= location.core_mask();
        }
        used |= locations.out().core_mask();
        for &candidate in &[R2, R1, R0] {
            if used & candidate.mask() == 0 {
                return candidate;
            }
        }
        panic!("no free caller-save register for {:?}", inst);
    }

    /// Unpoisons a reference freshly loaded into `rd`.
    pub(crate) fn maybe_unpoison(&mut self, rd: Register) {
        if self.options.heap_poisoning {
            self.masm.dp_imm(DataOp::Rsb, false, rd, rd, 0);
        }
    }

    pub(crate) fn maybe_poison(&mut self, rd: Register) {
        if self.options.heap_poisoning {
            self.masm.dp_imm(DataOp::Rsb, false, rd, rd, 0);
        }
    }
}

fn instruction_of(path: &SlowPath) -> InstId {
    path.inst
        .unwrap_or_else(|| panic!("{} without instruction", path.kind.name()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_kinds() {
        assert!(SlowPathKind::NullCheck.is_fatal());
        assert!(SlowPathKind::Deoptimization(DeoptimizationKind::Bce).is_fatal());
        assert!(SlowPathKind::TypeCheck { fatal: true }.is_fatal());
        assert!(!SlowPathKind::TypeCheck { fatal: false }.is_fatal());
        assert!(!SlowPathKind::SuspendCheck { successor: None }.is_fatal());
        assert!(!SlowPathKind::LoadString.is_fatal());
    }

    #[test]
    fn test_saved_register_slots() {
        let saved = SavedRegisters {
            core: vec![(1, 16), (3, 20)],
            fp: vec![(4, 24)],
        };
        assert_eq!(saved.core_slot(3), Some(20));
        assert_eq!(saved.core_slot(2), None);
        assert_eq!(saved.fp_slot(4), Some(24));
    }
}
