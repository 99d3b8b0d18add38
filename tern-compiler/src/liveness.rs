//! Linear positions, live sets and live intervals.
//!
//! Every block gets an even start position reserved for its phis; each
//! instruction `k` then sits at an even position `p`. Inputs are read at `p`,
//! temps occupy `[p, p + 2)`, outputs are written at `p + 1` and moves
//! inserted before the instruction happen at `p - 1`.

use fixedbitset::FixedBitSet;

use crate::hir::{BlockId, Graph, InstId, InstructionKind};
use crate::locations::{Location, Policy};

/// Replaces checks that only forward their input and decides which
/// conditions are emitted at their use site.
pub fn prepare_for_register_allocation(graph: &mut Graph) {
    let order = graph.linear_order.clone();

    for &block in &order {
        for inst in graph.block(block).instructions.clone() {
            let forwards_input = matches!(
                graph.kind(inst),
                InstructionKind::NullCheck
                    | InstructionKind::BoundsCheck
                    | InstructionKind::DivZeroCheck
                    | InstructionKind::BoundType
            );

            if forwards_input {
                let input = graph.inst(inst).input(0);
                graph.replace_uses(inst, input);
            }
        }
    }

    for &block in &order {
        for inst in graph.block(block).instructions.clone() {
            if matches!(graph.kind(inst), InstructionKind::Condition { .. }) {
                let emit_at_use_site = can_emit_at_use_site(graph, inst);
                graph.inst_mut(inst).emitted_at_use_site = emit_at_use_site;
            }
        }
    }
}

fn can_emit_at_use_site(graph: &Graph, cond: InstId) -> bool {
    let inst = graph.inst(cond);
    if inst.uses.len() != 1 || !inst.env_uses.is_empty() {
        return false;
    }

    let user = inst.uses[0];
    if graph.next_instruction(cond) != Some(user) {
        return false;
    }

    match graph.kind(user) {
        InstructionKind::If | InstructionKind::Deoptimize(_) => true,
        InstructionKind::Select => {
            let select = graph.inst(user);
            select.input(2) == cond && select.input(0) != cond && select.input(1) != cond
        }
        _ => false,
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum UseKind {
    /// Input `index` of `user`, resolved right before `at`.
    Input { user: InstId, index: usize, at: InstId },
    Environment { holder: InstId },
    /// Phi input flowing in from `pred`.
    Phi { phi: InstId, pred: BlockId },
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct UsePosition {
    pub position: u32,
    pub kind: UseKind,
}

#[derive(Clone, Debug)]
pub struct LiveInterval {
    pub value: InstId,
    pub start: u32,
    pub end: u32,
    pub uses: Vec<UsePosition>,
}

impl LiveInterval {
    pub fn covers(&self, position: u32) -> bool {
        self.start <= position && position < self.end
    }

    pub fn intersects(&self, start: u32, end: u32) -> bool {
        self.start < end && start < self.end
    }
}

pub struct Liveness {
    pub live_in: Vec<FixedBitSet>,
    pub live_out: Vec<FixedBitSet>,
    pub intervals: Vec<Option<LiveInterval>>,
    /// Instructions in linear order, indexed by `position / 2`.
    pub instructions_by_index: Vec<Option<InstId>>,
    pub max_position: u32,
}

impl Liveness {
    pub fn interval(&self, value: InstId) -> Option<&LiveInterval> {
        self.intervals[value.idx()].as_ref()
    }

    pub fn instruction_at(&self, position: u32) -> Option<InstId> {
        self.instructions_by_index
            .get((position / 2) as usize)
            .copied()
            .flatten()
    }

    pub fn is_live_at(&self, value: InstId, position: u32) -> bool {
        self.interval(value).map(|i| i.covers(position)).unwrap_or(false)
    }
}

/// Whether `value` gets a live interval. Constants and values without an
/// output location are rematerialized or not needed.
pub fn has_interval(graph: &Graph, value: InstId) -> bool {
    let inst = graph.inst(value);
    if inst.removed || !inst.has_output() || inst.emitted_at_use_site {
        return false;
    }
    if inst.is_phi() {
        return true;
    }
    match &inst.locations {
        Some(locations) => {
            let out = locations.out();
            out.is_valid() && !out.is_constant()
        }
        None => false,
    }
}

/// Whether environment uses keep values alive.
pub fn environment_extends_liveness(graph: &Graph, debuggable: bool, holder: InstId) -> bool {
    debuggable || graph.is_osr || matches!(graph.kind(holder), InstructionKind::Deoptimize(_))
}

pub fn number_instructions(graph: &mut Graph) -> Vec<Option<InstId>> {
    let mut position = 0u32;
    let mut by_index = Vec::new();

    for block in graph.linear_order.clone() {
        graph.block_mut(block).lifetime_start = position;
        for phi in graph.block(block).phis.clone() {
            graph.inst_mut(phi).lifetime_position = position;
        }
        by_index.push(None);
        position += 2;

        for inst in graph.block(block).instructions.clone() {
            graph.inst_mut(inst).lifetime_position = position;
            by_index.push(Some(inst));
            position += 2;
        }

        graph.block_mut(block).lifetime_end = position;
    }

    by_index
}

/// Position at which the value is first written.
pub fn definition_position(graph: &Graph, value: InstId) -> u32 {
    let inst = graph.inst(value);
    let position = inst.lifetime_position;
    if inst.is_phi() {
        return position;
    }
    let locations = inst.locations();
    match locations.out() {
        Location::Unallocated(Policy::SameAsFirstInput) => position - 1,
        Location::Unallocated(_) | Location::Any if locations.output_overlaps => position,
        _ => position + 1,
    }
}

fn use_position_for(location: Location, position: u32) -> u32 {
    match location {
        Location::Register(_)
        | Location::RegisterPair(..)
        | Location::FpuRegister(_)
        | Location::FpuRegisterPair(..)
        | Location::StackSlot(_)
        | Location::DoubleStackSlot(_) => position - 1,
        _ => position,
    }
}

pub fn compute_liveness(graph: &mut Graph, debuggable: bool) -> Liveness {
    let instructions_by_index = number_instructions(graph);
    let n = graph.insts.len();
    let block_count = graph.blocks.len();

    let mut uses: Vec<Vec<UsePosition>> = vec![Vec::new(); n];
    let mut live_gen = vec![FixedBitSet::with_capacity(n); block_count];
    let mut kill = vec![FixedBitSet::with_capacity(n); block_count];

    let order = graph.linear_order.clone();

    for &block in &order {
        let b = block.idx();
        for &phi in &graph.block(block).phis {
            kill[b].insert(phi.idx());
        }

        for &inst in &graph.block(block).instructions {
            let position = graph.inst(inst).lifetime_position;
            collect_input_uses(graph, inst, inst, position, &mut uses, &mut live_gen[b], &kill[b]);

            if let Some(env) = &graph.inst(inst).environment {
                if environment_extends_liveness(graph, debuggable, inst) {
                    env.for_each_value(&mut |value| {
                        if has_interval(graph, value) {
                            uses[value.idx()].push(UsePosition {
                                position: position + 1,
                                kind: UseKind::Environment { holder: inst },
                            });
                            if !kill[b].contains(value.idx()) {
                                live_gen[b].insert(value.idx());
                            }
                        }
                    });
                }
            }

            if has_interval(graph, inst) {
                kill[b].insert(inst.idx());
            }
        }
    }

    let mut live_in = vec![FixedBitSet::with_capacity(n); block_count];
    let mut live_out = vec![FixedBitSet::with_capacity(n); block_count];

    let mut changed = true;
    while changed {
        changed = false;

        for &block in order.iter().rev() {
            let b = block.idx();
            let mut out = FixedBitSet::with_capacity(n);

            for &succ in &graph.block(block).successors {
                out.union_with(&live_in[succ.idx()]);
                for &phi in &graph.block(succ).phis {
                    let idx = graph.predecessor_index(succ, block);
                    let input = graph.inst(phi).input(idx);
                    if has_interval(graph, input) {
                        out.insert(input.idx());
                    }
                }
            }

            let mut inp = out.clone();
            inp.difference_with(&kill[b]);
            inp.union_with(&live_gen[b]);

            if inp != live_in[b] || out != live_out[b] {
                live_in[b] = inp;
                live_out[b] = out;
                changed = true;
            }
        }
    }

    for &block in &order {
        for &succ in &graph.block(block).successors {
            let term = graph
                .block(block)
                .last_instruction()
                .map(|i| graph.inst(i).lifetime_position)
                .unwrap_or(graph.block(block).lifetime_end);
            let idx = graph.predecessor_index(succ, block);
            for &phi in &graph.block(succ).phis {
                let input = graph.inst(phi).input(idx);
                if has_interval(graph, input) {
                    uses[input.idx()].push(UsePosition {
                        position: term - 1,
                        kind: UseKind::Phi { phi, pred: block },
                    });
                }
            }
        }
    }

    let mut intervals: Vec<Option<LiveInterval>> = vec![None; n];
    let mut max_position = 0;

    for &block in &order {
        let values: Vec<InstId> = graph
            .block(block)
            .phis
            .iter()
            .chain(graph.block(block).instructions.iter())
            .copied()
            .collect();
        max_position = max_position.max(graph.block(block).lifetime_end);

        for value in values {
            if !has_interval(graph, value) {
                continue;
            }

            let mut start = definition_position(graph, value);
            let mut end = start + 1;

            if graph.inst(value).is_phi() {
                for &pred in &graph.block(block).predecessors {
                    let term = graph
                        .block(pred)
                        .last_instruction()
                        .map(|i| graph.inst(i).lifetime_position)
                        .unwrap_or(graph.block(pred).lifetime_end);
                    start = start.min(term - 1);
                    end = end.max(term);
                }
            }

            for use_pos in &uses[value.idx()] {
                end = end.max(use_pos.position + 1);
            }

            for &other in &order {
                if live_out[other.idx()].contains(value.idx()) {
                    end = end.max(graph.block(other).lifetime_end);
                }
            }

            let mut value_uses = std::mem::take(&mut uses[value.idx()]);
            value_uses.sort_by_key(|u| u.position);

            intervals[value.idx()] = Some(LiveInterval {
                value,
                start,
                end,
                uses: value_uses,
            });
        }
    }

    Liveness {
        live_in,
        live_out,
        intervals,
        instructions_by_index,
        max_position,
    }
}

/// Records the uses of `user`'s inputs at `position`. Inputs emitted at
/// their use site contribute their own inputs instead.
fn collect_input_uses(
    graph: &Graph,
    user: InstId,
    at: InstId,
    position: u32,
    uses: &mut [Vec<UsePosition>],
    live_gen: &mut FixedBitSet,
    kill: &FixedBitSet,
) {
    let inst = graph.inst(user);
    let locations = match &inst.locations {
        Some(locations) => locations,
        None => return,
    };

    for (index, &input) in inst.inputs.iter().enumerate() {
        let input_inst = graph.inst(input);

        if input_inst.emitted_at_use_site {
            collect_input_uses(graph, input, at, position, uses, live_gen, kill);
            continue;
        }

        if !has_interval(graph, input) {
            continue;
        }

        let location = locations.in_at(index);
        if location.is_invalid() {
            continue;
        }

        let same_as_first = index == 0
            && locations.out() == Location::Unallocated(Policy::SameAsFirstInput);
        let use_position = if same_as_first {
            position - 1
        } else {
            use_position_for(location, position)
        };

        uses[input.idx()].push(UsePosition {
            position: use_position,
            kind: UseKind::Input { user, index, at },
        });

        if !kill.contains(input.idx()) {
            live_gen.insert(input.idx());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hir::{BinaryOp, DataType, MethodInfo};
    use crate::locations::{CallKind, LocationSummary};

    fn with_summary(graph: &mut Graph, inst: InstId, inputs: usize, out: Location) {
        let mut summary = LocationSummary::new(inputs, CallKind::NoCall);
        for i in 0..inputs {
            summary.set_in_at(i, Location::requires_register());
        }
        if out.is_valid() {
            summary.set_out_overlap(out, false);
        }
        graph.inst_mut(inst).locations = Some(summary);
    }

    #[test]
    fn test_straight_line_intervals() {
        let mut graph = Graph::new(MethodInfo::new("f", true, vec![DataType::Int32, DataType::Int32]));
        let entry = graph.entry_block;
        let p = graph.add(entry, InstructionKind::ParameterValue { index: 0 }, DataType::Int32, &[]);
        let add = graph.add(entry, InstructionKind::Binary(BinaryOp::Add), DataType::Int32, &[p, p]);
        let ret = graph.add(entry, InstructionKind::Return, DataType::Void, &[add]);
        graph.compute_linear_order();

        let mut summary = LocationSummary::new(0, CallKind::NoCall);
        summary.set_out(Location::Register(1));
        graph.inst_mut(p).locations = Some(summary);
        with_summary(&mut graph, add, 2, Location::requires_register());
        let mut summary = LocationSummary::new(1, CallKind::NoCall);
        summary.set_in_at(0, Location::Register(0));
        graph.inst_mut(ret).locations = Some(summary);

        let liveness = compute_liveness(&mut graph, false);

        // positions: block start 0, p at 2, add at 4, ret at 6
        let pi = liveness.interval(p).unwrap();
        assert_eq!((pi.start, pi.end), (3, 5));
        let ai = liveness.interval(add).unwrap();
        assert_eq!((ai.start, ai.end), (5, 6));
        assert_eq!(liveness.instruction_at(4), Some(add));
        assert!(liveness.interval(ret).is_none());
    }

    #[test]
    fn test_loop_keeps_value_alive() {
        let mut graph = Graph::new(MethodInfo::new("loop", true, vec![DataType::Void, DataType::Int32]));
        let entry = graph.entry_block;
        let header = graph.add_block();
        let body = graph.add_block();
        let exit = graph.add_block();
        graph.add_edge(entry, header);
        graph.add_edge(header, body);
        graph.add_edge(header, exit);
        graph.add_edge(body, header);

        let p = graph.add(entry, InstructionKind::ParameterValue { index: 0 }, DataType::Int32, &[]);
        let goto = graph.add(entry, InstructionKind::Goto, DataType::Void, &[]);
        let phi = graph.add_phi(header, DataType::Int32, &[p, p]);
        let cond = graph.add(
            header,
            InstructionKind::Condition {
                cond: crate::hir::IfCondition::Eq,
                bias: crate::hir::ComparisonBias::NoBias,
            },
            DataType::Bool,
            &[phi, p],
        );
        let iff = graph.add(header, InstructionKind::If, DataType::Void, &[cond]);
        let next = graph.add(body, InstructionKind::Binary(BinaryOp::Add), DataType::Int32, &[phi, phi]);
        let back = graph.add(body, InstructionKind::Goto, DataType::Void, &[]);
        let ret = graph.add(exit, InstructionKind::ReturnVoid, DataType::Void, &[]);
        graph.set_phi_inputs(phi, &[p, next]);
        graph.compute_linear_order();

        let mut summary = LocationSummary::new(0, CallKind::NoCall);
        summary.set_out(Location::Register(1));
        graph.inst_mut(p).locations = Some(summary);
        with_summary(&mut graph, cond, 2, Location::requires_register());
        with_summary(&mut graph, iff, 1, Location::NoLocation);
        with_summary(&mut graph, next, 2, Location::requires_register());
        for inst in [goto, back, ret] {
            with_summary(&mut graph, inst, 0, Location::NoLocation);
        }
        graph.inst_mut(phi).locations = Some(LocationSummary::new(2, CallKind::NoCall));

        prepare_for_register_allocation(&mut graph);
        assert!(graph.inst(cond).emitted_at_use_site);

        let liveness = compute_liveness(&mut graph, false);
        let pi = liveness.interval(p).unwrap();
        assert!(pi.end >= graph.block(body).lifetime_end);
        assert!(liveness.live_in[header.idx()].contains(p.idx()));
        assert!(liveness.live_out[body.idx()].contains(next.idx()));
        assert!(liveness.interval(cond).is_none());

        let phi_interval = liveness.interval(phi).unwrap();
        assert!(phi_interval.start < graph.block(header).lifetime_start);
        let back_pos = graph.inst(back).lifetime_position;
        assert!(phi_interval.end >= back_pos);
    }
}
