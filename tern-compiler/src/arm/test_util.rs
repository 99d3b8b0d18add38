//! Lowering tests give instructions hand-written physical locations and
//! lower them one by one, without running the register allocator.

use crate::arm::codegen::CodeGeneratorArm;
use crate::arm::masm::ArmMacroAssembler;
use crate::hir::{BlockId, DataType, Graph, InstId, MethodInfo};
use crate::linker_patch::LinkerPatch;
use crate::locations::{CallKind, Location, LocationSummary, RegisterSet};
use crate::options::CompilerOptions;
use crate::register_allocator::{Allocation, FrameLayout};

pub(crate) struct Lowered {
    pub code: Vec<u16>,
    /// Halfwords emitted by the lowered instructions themselves.
    pub body_len: usize,
    pub safepoints: Vec<u32>,
    pub patches: Vec<LinkerPatch>,
    pub slow_paths: usize,
}

impl Lowered {
    pub fn body(&self) -> &[u16] {
        &self.code[..self.body_len]
    }
}

pub(crate) fn to_halfwords(code: &[u8]) -> Vec<u16> {
    code.chunks(2).map(|c| u16::from_le_bytes([c[0], c[1]])).collect()
}

pub(crate) fn halfwords(masm: ArmMacroAssembler) -> Vec<u16> {
    let (code, _) = masm.finalize();
    to_halfwords(&code)
}

/// A static `void m()` graph with a single block in the linear order.
pub(crate) fn method_graph() -> (Graph, BlockId) {
    let mut graph = Graph::new(MethodInfo::new("m", true, vec![DataType::Void]));
    let entry = graph.entry_block;
    graph.linear_order = vec![entry];
    (graph, entry)
}

/// A summary whose locations are already physical.
pub(crate) fn fixed(inputs: &[Location], out: Location) -> LocationSummary {
    let mut summary = LocationSummary::new(inputs.len(), CallKind::NoCall);
    for (idx, &location) in inputs.iter().enumerate() {
        summary.set_in_at(idx, location);
    }
    if out.is_valid() {
        summary.set_out_overlap(out, false);
    }
    summary
}

/// Like `fixed`, for instructions reaching a slow path that saves nothing.
pub(crate) fn fixed_with_slow_path(inputs: &[Location], out: Location) -> LocationSummary {
    let mut summary = LocationSummary::new(inputs.len(), CallKind::CallOnSlowPath);
    for (idx, &location) in inputs.iter().enumerate() {
        summary.set_in_at(idx, location);
    }
    if out.is_valid() {
        summary.set_out_overlap(out, false);
    }
    summary.set_custom_slow_path_caller_saves(RegisterSet::empty());
    summary
}

/// Lowers `insts` in order inside a 16 byte frame saving LR.
pub(crate) fn lower(graph: &Graph, options: &CompilerOptions, insts: &[InstId]) -> Lowered {
    let allocation = Allocation {
        frame: FrameLayout {
            frame_size: 16,
            core_spill_mask: tern_asm::thumb2::LR.mask(),
            ..Default::default()
        },
        value_locations: Vec::new(),
        ranges: Vec::new(),
    };
    let mut codegen = CodeGeneratorArm::new(graph, options, &allocation);
    codegen.begin_lowering();
    for &inst in insts {
        codegen.current_block = graph.inst(inst).block;
        codegen.visit(inst);
    }
    codegen.finish_lowering()
}

/// Options without read barriers, so reference loads are plain loads.
pub(crate) fn no_read_barrier() -> CompilerOptions {
    CompilerOptions {
        emit_read_barrier: false,
        use_baker_read_barrier: false,
        ..Default::default()
    }
}
