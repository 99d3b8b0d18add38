//! Linear-scan register allocation over the numbered graph.
//!
//! Each value either keeps one register for its whole live range or lives
//! in a spill slot. Spilled values are written from a short-lived definition
//! register and reloaded into short-lived registers at uses that need one.
//! When a short interval cannot be served, the allocation restarts with an
//! overlapping value forced to the stack.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap, HashSet};

use tracing::trace;

use crate::error::{CompileError, CompileResult};
use crate::hir::{DataType, Graph, InstId, InstructionKind};
use crate::liveness::{compute_liveness, definition_position, has_interval, Liveness};
use crate::locations::{Location, LocationSummary, MoveOperands, Policy, RegisterSet};

/// Register file description of the target.
#[derive(Clone, Debug)]
pub struct RegisterConfig {
    pub core: u32,
    pub core_pairs: Vec<(u8, u8)>,
    pub fp: u32,
    pub caller_save_core: u32,
    pub caller_save_fp: u32,
    pub callee_save_core: u32,
    pub callee_save_fp: u32,
    /// Always saved in non-empty frames.
    pub return_address: u8,
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum RegClass {
    Core,
    CorePair,
    Fp,
    FpPair,
}

fn class_for(ty: DataType) -> RegClass {
    match ty.kind() {
        DataType::Int64 => RegClass::CorePair,
        DataType::Float32 => RegClass::Fp,
        DataType::Float64 => RegClass::FpPair,
        _ => RegClass::Core,
    }
}

fn location_for(class: RegClass, reg: u8) -> Location {
    match class {
        RegClass::Core => Location::Register(reg),
        RegClass::CorePair => Location::RegisterPair(reg, reg + 1),
        RegClass::Fp => Location::FpuRegister(reg),
        RegClass::FpPair => Location::FpuRegisterPair(reg, reg + 1),
    }
}

const FP_UNIT_BASE: usize = 16;

fn units_of(location: Location) -> Vec<usize> {
    match location {
        Location::Register(r) => vec![r as usize],
        Location::RegisterPair(lo, hi) => vec![lo as usize, hi as usize],
        Location::FpuRegister(s) => vec![FP_UNIT_BASE + s as usize],
        Location::FpuRegisterPair(lo, hi) => vec![FP_UNIT_BASE + lo as usize, FP_UNIT_BASE + hi as usize],
        _ => Vec::new(),
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum IntervalKind {
    Value(InstId),
    /// Register a spilled value is computed into before the store.
    Definition(InstId),
    /// Register an input is loaded into right before `at`.
    Reload { user: InstId, index: usize, at: InstId, value: InstId },
    Temp { inst: InstId, index: usize },
}

impl IntervalKind {
    fn owner(&self) -> InstId {
        match *self {
            IntervalKind::Value(v) | IntervalKind::Definition(v) => v,
            IntervalKind::Reload { at, .. } => at,
            IntervalKind::Temp { inst, .. } => inst,
        }
    }
}

#[derive(Clone, Debug)]
struct Interval {
    kind: IntervalKind,
    class: RegClass,
    start: u32,
    end: u32,
    hint: Option<Location>,
}

#[derive(Copy, Clone, Debug)]
enum Occupant {
    Fixed(Option<InstId>),
    Interval(usize),
}

#[derive(Copy, Clone, Debug)]
struct Occupation {
    start: u32,
    end: u32,
    occupant: Occupant,
}

#[derive(Clone, Debug, Default)]
pub struct FrameLayout {
    pub frame_size: u32,
    pub core_spill_mask: u32,
    pub fp_spill_mask: u32,
    pub out_args_size: u32,
    pub spill_slots: u32,
    /// Bytes reserved for caller-save registers saved around slow path calls.
    pub slow_path_spill_size: u32,
    pub should_deoptimize_flag_offset: Option<u32>,
    pub is_leaf: bool,
}

impl FrameLayout {
    pub const STACK_ALIGNMENT: u32 = 16;

    pub fn has_empty_frame(&self) -> bool {
        self.frame_size == 0
    }

    pub fn core_spill_size(&self) -> u32 {
        self.core_spill_mask.count_ones() * 4
    }

    pub fn fp_spill_size(&self) -> u32 {
        self.fp_spill_mask.count_ones() * 4
    }

    pub fn spill_area_start(&self) -> u32 {
        4 + self.out_args_size
    }

    /// Start of the area slow paths save live caller-save registers to.
    pub fn slow_path_spill_offset(&self) -> u32 {
        self.spill_area_start() + 4 * self.spill_slots
    }

    /// Offset of the first core register spill relative to SP.
    pub fn core_spill_offset(&self) -> u32 {
        self.frame_size - self.core_spill_size()
    }

    pub fn fp_spill_offset(&self) -> u32 {
        self.core_spill_offset() - self.fp_spill_size()
    }
}

/// Result of register allocation.
pub struct Allocation {
    pub frame: FrameLayout,
    pub value_locations: Vec<Location>,
    pub ranges: Vec<Option<(u32, u32)>>,
}

impl Allocation {
    /// Location of `value` at the safepoint of the instruction at
    /// `position`, or `NoLocation` when the value is dead there.
    pub fn location_at_safepoint(&self, graph: &Graph, value: InstId, position: u32, will_call: bool) -> Location {
        if graph.is_constant(value) {
            return Location::Constant(value);
        }
        match self.ranges.get(value.idx()).copied().flatten() {
            Some((start, end)) => {
                let after = start <= position + 1 && position + 1 < end;
                let at = start <= position && position < end;
                if after || (!will_call && at) {
                    self.value_locations[value.idx()]
                } else {
                    Location::NoLocation
                }
            }
            None => Location::NoLocation,
        }
    }
}

pub struct RegisterAllocator<'a> {
    graph: &'a mut Graph,
    config: &'a RegisterConfig,
    debuggable: bool,
}

struct Attempt {
    intervals: Vec<Interval>,
    assigned: Vec<Option<Location>>,
    spill_slot: HashMap<InstId, Location>,
    slot_ends: Vec<u32>,
}

enum AttemptError {
    Victim(InstId),
    OutOfRegisters(InstId),
}

struct InputSite {
    user: InstId,
    index: usize,
    at: InstId,
    position: u32,
    value: InstId,
    location: Location,
}

impl<'a> RegisterAllocator<'a> {
    pub fn new(graph: &'a mut Graph, config: &'a RegisterConfig, debuggable: bool) -> RegisterAllocator<'a> {
        RegisterAllocator {
            graph,
            config,
            debuggable,
        }
    }

    pub fn allocate(self) -> CompileResult<Allocation> {
        let liveness = compute_liveness(self.graph, self.debuggable);
        let sites = self.input_sites();
        let fixed = self.fixed_occupations();
        let out_args_size = self.out_args_size();
        let spill_base = 4 + out_args_size;

        let mut forced_spill = HashSet::new();
        let attempt = loop {
            match self.try_allocate(&liveness, &sites, &fixed, &forced_spill, spill_base) {
                Ok(attempt) => break attempt,
                Err(AttemptError::Victim(victim)) => {
                    trace!(value = ?victim, "forcing value to the stack");
                    forced_spill.insert(victim);
                }
                Err(AttemptError::OutOfRegisters(inst)) => {
                    return Err(CompileError::OutOfRegisters(inst));
                }
            }
        };

        let frame = self.frame_layout(&attempt, out_args_size);
        Ok(self.resolve(&liveness, &sites, attempt, frame))
    }

    fn linear_instructions(&self) -> Vec<InstId> {
        let mut result = Vec::new();
        for &block in &self.graph.linear_order {
            result.extend(self.graph.block(block).instructions.iter().copied());
        }
        result
    }

    fn input_sites(&self) -> Vec<InputSite> {
        let mut sites = Vec::new();
        for inst in self.linear_instructions() {
            let position = self.graph.inst(inst).lifetime_position;
            self.collect_sites(inst, inst, position, &mut sites);
        }
        sites
    }

    fn collect_sites(&self, user: InstId, at: InstId, position: u32, sites: &mut Vec<InputSite>) {
        let inst = self.graph.inst(user);
        let locations = match &inst.locations {
            Some(locations) => locations,
            None => return,
        };

        for (index, &value) in inst.inputs.iter().enumerate() {
            if self.graph.inst(value).emitted_at_use_site {
                self.collect_sites(value, at, position, sites);
                continue;
            }
            let location = locations.in_at(index);
            if location.is_invalid() {
                continue;
            }
            sites.push(InputSite {
                user,
                index,
                at,
                position,
                value,
                location,
            });
        }
    }

    fn fixed_occupations(&self) -> Vec<Vec<Occupation>> {
        let mut units: Vec<Vec<Occupation>> = vec![Vec::new(); FP_UNIT_BASE + 32];
        let mut block = |location: Location, start: u32, end: u32, owner: Option<InstId>| {
            for unit in units_of(location) {
                units[unit].push(Occupation {
                    start,
                    end,
                    occupant: Occupant::Fixed(owner),
                });
            }
        };

        for inst_id in self.linear_instructions() {
            let inst = self.graph.inst(inst_id);
            let p = inst.lifetime_position;
            let locations = match &inst.locations {
                Some(locations) => locations,
                None => continue,
            };

            if !inst.emitted_at_use_site {
                for (index, input) in locations.inputs.iter().enumerate() {
                    if input.is_register_kind() {
                        // The incoming value may already sit in the register.
                        block(*input, p - 1, p + 1, inst.inputs.get(index).copied());
                    }
                }
            }

            for temp in &locations.temps {
                if temp.is_register_kind() {
                    block(*temp, p, p + 2, Some(inst_id));
                }
            }

            let out = locations.out();
            if out.is_register_kind() {
                let entry_value = matches!(
                    inst.kind,
                    InstructionKind::ParameterValue { .. } | InstructionKind::CurrentMethod
                );
                let start = if entry_value { 0 } else { p + 1 };
                block(out, start, p + 2, Some(inst_id));
            }

            if locations.will_call() {
                for r in 0..16u8 {
                    if self.config.caller_save_core & (1 << r) != 0 {
                        block(Location::Register(r), p + 1, p + 2, Some(inst_id));
                    }
                }
                for s in 0..32u8 {
                    if self.config.caller_save_fp & (1 << s) != 0 {
                        block(Location::FpuRegister(s), p + 1, p + 2, Some(inst_id));
                    }
                }
            }
        }

        units
    }

    fn out_args_size(&self) -> u32 {
        let mut size = 0;
        for inst in self.linear_instructions() {
            let inst = self.graph.inst(inst);
            if matches!(inst.kind, InstructionKind::ParameterValue { .. }) {
                continue;
            }
            if let Some(locations) = &inst.locations {
                for input in &locations.inputs {
                    match *input {
                        Location::StackSlot(offset) => size = size.max(offset as u32 + 4),
                        Location::DoubleStackSlot(offset) => size = size.max(offset as u32 + 8),
                        _ => {}
                    }
                }
            }
        }
        size.saturating_sub(4)
    }

    fn hint_for(&self, liveness: &Liveness, value: InstId, class: RegClass) -> Option<Location> {
        let inst = self.graph.inst(value);
        if let Some(locations) = &inst.locations {
            let out = locations.out();
            if out.is_register_kind() {
                return Some(out);
            }
        }

        let interval = liveness.interval(value)?;
        for use_pos in &interval.uses {
            if let crate::liveness::UseKind::Input { user, index, .. } = use_pos.kind {
                let location = self.graph.inst(user).locations().in_at(index);
                let matches_class = match class {
                    RegClass::Core => location.is_register(),
                    RegClass::CorePair => location.is_register_pair(),
                    RegClass::Fp => location.is_fpu_register(),
                    RegClass::FpPair => location.is_fpu_register_pair(),
                };
                if matches_class {
                    return Some(location);
                }
            }
        }
        None
    }

    fn candidates(&self, class: RegClass) -> Vec<Location> {
        let config = self.config;
        let mut result = Vec::new();
        match class {
            RegClass::Core => {
                for caller_save in [true, false] {
                    for r in 0..16u8 {
                        let is_caller_save = config.caller_save_core & (1 << r) != 0;
                        if config.core & (1 << r) != 0 && is_caller_save == caller_save {
                            result.push(Location::Register(r));
                        }
                    }
                }
            }
            RegClass::CorePair => {
                for &(lo, _) in &config.core_pairs {
                    result.push(Location::RegisterPair(lo, lo + 1));
                }
            }
            RegClass::Fp => {
                for caller_save in [true, false] {
                    for s in 0..32u8 {
                        let is_caller_save = config.caller_save_fp & (1 << s) != 0;
                        if config.fp & (1 << s) != 0 && is_caller_save == caller_save {
                            result.push(Location::FpuRegister(s));
                        }
                    }
                }
            }
            RegClass::FpPair => {
                for caller_save in [true, false] {
                    for d in 0..16u8 {
                        let lo = 2 * d;
                        let mask = 3u32 << lo;
                        let is_caller_save = config.caller_save_fp & mask == mask;
                        if config.fp & mask == mask && is_caller_save == caller_save {
                            result.push(location_for(RegClass::FpPair, lo));
                        }
                    }
                }
            }
        }
        result
    }

    fn try_allocate(
        &self,
        liveness: &Liveness,
        sites: &[InputSite],
        fixed: &[Vec<Occupation>],
        forced_spill: &HashSet<InstId>,
        spill_base: u32,
    ) -> Result<Attempt, AttemptError> {
        let mut attempt = Attempt {
            intervals: Vec::new(),
            assigned: Vec::new(),
            spill_slot: HashMap::new(),
            slot_ends: Vec::new(),
        };
        let mut units = fixed.to_vec();
        let mut worklist = BinaryHeap::new();

        let push = |attempt: &mut Attempt, worklist: &mut BinaryHeap<Reverse<(u32, u32, usize)>>, interval: Interval| {
            let idx = attempt.intervals.len();
            worklist.push(Reverse((interval.start, interval.end, idx)));
            attempt.intervals.push(interval);
            attempt.assigned.push(None);
        };

        for interval in liveness.intervals.iter().flatten() {
            let value = interval.value;
            let ty = self.graph.inst(value).ty;
            let class = class_for(ty);

            if let Some(slot) = self.preassigned_stack_location(value) {
                attempt.spill_slot.insert(value, slot);
                for site in sites.iter().filter(|s| s.value == value) {
                    if let Location::Unallocated(policy) = site.location {
                        push(&mut attempt, &mut worklist, self.reload_interval(site, policy));
                    }
                }
                continue;
            }

            push(
                &mut attempt,
                &mut worklist,
                Interval {
                    kind: IntervalKind::Value(value),
                    class,
                    start: interval.start,
                    end: interval.end,
                    hint: self.hint_for(liveness, value, class),
                },
            );
        }

        for inst_id in self.linear_instructions() {
            let inst = self.graph.inst(inst_id);
            let p = inst.lifetime_position;
            if let Some(locations) = &inst.locations {
                for (index, temp) in locations.temps.iter().enumerate() {
                    let class = match temp {
                        Location::Unallocated(Policy::RequiresRegister) => RegClass::Core,
                        Location::Unallocated(Policy::RequiresFpuRegister) => RegClass::Fp,
                        _ => continue,
                    };
                    push(
                        &mut attempt,
                        &mut worklist,
                        Interval {
                            kind: IntervalKind::Temp { inst: inst_id, index },
                            class,
                            start: p,
                            end: p + 2,
                            hint: None,
                        },
                    );
                }
            }
        }

        for site in sites {
            if !self.graph.is_constant(site.value) {
                continue;
            }
            if let Location::Unallocated(policy) = site.location {
                push(
                    &mut attempt,
                    &mut worklist,
                    self.reload_interval(site, policy),
                );
            }
        }

        while let Some(Reverse((_, _, idx))) = worklist.pop() {
            let interval = attempt.intervals[idx].clone();

            if let IntervalKind::Value(value) = interval.kind {
                let found = if forced_spill.contains(&value) {
                    None
                } else {
                    self.find_free(&units, &attempt, &interval)
                };

                match found {
                    Some(location) => self.assign(&mut units, &mut attempt, idx, location),
                    None => {
                        let slot = self.allocate_spill_slot(&mut attempt, &interval, spill_base);
                        attempt.spill_slot.insert(value, slot);

                        if let Some(def) = self.definition_interval(value, &interval) {
                            push(&mut attempt, &mut worklist, def);
                        }
                        for site in sites.iter().filter(|s| s.value == value) {
                            if let Location::Unallocated(policy) = site.location {
                                if policy != Policy::SameAsFirstInput {
                                    push(&mut attempt, &mut worklist, self.reload_interval(site, policy));
                                }
                            }
                        }
                    }
                }
                continue;
            }

            match self.find_free(&units, &attempt, &interval) {
                Some(location) => self.assign(&mut units, &mut attempt, idx, location),
                None => return Err(self.pick_victim(&units, &attempt, &interval)),
            }
        }

        Ok(attempt)
    }

    fn preassigned_stack_location(&self, value: InstId) -> Option<Location> {
        let inst = self.graph.inst(value);
        if !matches!(inst.kind, InstructionKind::ParameterValue { .. }) {
            return None;
        }
        let out = inst.locations().out();
        if out.is_memory() { Some(out) } else { None }
    }

    fn reload_interval(&self, site: &InputSite, policy: Policy) -> Interval {
        let class = match policy {
            Policy::RequiresFpuRegister => {
                if self.graph.inst(site.value).ty.is_64bit() {
                    RegClass::FpPair
                } else {
                    RegClass::Fp
                }
            }
            _ => class_for(self.graph.inst(site.value).ty),
        };
        Interval {
            kind: IntervalKind::Reload {
                user: site.user,
                index: site.index,
                at: site.at,
                value: site.value,
            },
            class,
            start: site.position - 1,
            end: site.position + 1,
            hint: None,
        }
    }

    fn definition_interval(&self, value: InstId, interval: &Interval) -> Option<Interval> {
        let inst = self.graph.inst(value);
        if inst.is_phi() {
            return None;
        }
        match inst.locations().out() {
            Location::Unallocated(_) => {
                let start = definition_position(self.graph, value);
                Some(Interval {
                    kind: IntervalKind::Definition(value),
                    class: interval.class,
                    start,
                    end: inst.lifetime_position + 2,
                    hint: None,
                })
            }
            _ => None,
        }
    }

    fn is_free(&self, units: &[Vec<Occupation>], attempt: &Attempt, interval: &Interval, location: Location) -> bool {
        let owner = interval.kind.owner();
        for unit in units_of(location) {
            for occ in &units[unit] {
                if occ.start < interval.end && interval.start < occ.end {
                    match occ.occupant {
                        Occupant::Fixed(Some(fixed_owner)) if fixed_owner == owner => {}
                        Occupant::Interval(other) if attempt.intervals[other].kind == interval.kind => {}
                        _ => return false,
                    }
                }
            }
        }
        true
    }

    fn find_free(&self, units: &[Vec<Occupation>], attempt: &Attempt, interval: &Interval) -> Option<Location> {
        if let Some(hint) = interval.hint {
            let hint_class = match hint {
                Location::Register(_) => Some(RegClass::Core),
                Location::RegisterPair(..) => Some(RegClass::CorePair),
                Location::FpuRegister(_) => Some(RegClass::Fp),
                Location::FpuRegisterPair(..) => Some(RegClass::FpPair),
                _ => None,
            };
            let allocatable = units_of(hint).iter().all(|&u| {
                if u < FP_UNIT_BASE {
                    self.config.core & (1 << u) != 0
                } else {
                    self.config.fp & (1 << (u - FP_UNIT_BASE)) != 0
                }
            });
            if hint_class == Some(interval.class) && allocatable && self.is_free(units, attempt, interval, hint) {
                return Some(hint);
            }
        }

        self.candidates(interval.class)
            .into_iter()
            .find(|&location| self.is_free(units, attempt, interval, location))
    }

    fn assign(&self, units: &mut [Vec<Occupation>], attempt: &mut Attempt, idx: usize, location: Location) {
        let interval = &attempt.intervals[idx];
        for unit in units_of(location) {
            units[unit].push(Occupation {
                start: interval.start,
                end: interval.end,
                occupant: Occupant::Interval(idx),
            });
        }
        attempt.assigned[idx] = Some(location);
    }

    fn pick_victim(&self, units: &[Vec<Occupation>], attempt: &Attempt, interval: &Interval) -> AttemptError {
        let mut best: Option<(u32, InstId)> = None;

        for location in self.candidates(interval.class) {
            let mut victims = Vec::new();
            let mut blocked = false;

            for unit in units_of(location) {
                for occ in &units[unit] {
                    if occ.start < interval.end && interval.start < occ.end {
                        match occ.occupant {
                            Occupant::Interval(other) => match attempt.intervals[other].kind {
                                IntervalKind::Value(value) if self.graph.inst(value).ty != DataType::Void => {
                                    victims.push((attempt.intervals[other].end, value));
                                }
                                _ => blocked = true,
                            },
                            Occupant::Fixed(_) => blocked = true,
                        }
                    }
                }
            }

            if blocked {
                continue;
            }

            if let Some(&victim) = victims.iter().max() {
                if best.map(|b| victim.0 > b.0).unwrap_or(true) {
                    best = Some(victim);
                }
            }
        }

        match best {
            Some((_, value)) => AttemptError::Victim(value),
            None => {
                let inst = match interval.kind {
                    IntervalKind::Reload { at, .. } => at,
                    kind => kind.owner(),
                };
                AttemptError::OutOfRegisters(inst)
            }
        }
    }

    fn allocate_spill_slot(&self, attempt: &mut Attempt, interval: &Interval, spill_base: u32) -> Location {
        let value = match interval.kind {
            IntervalKind::Value(value) => value,
            _ => unreachable!(),
        };

        if self.graph.kind(value) == &InstructionKind::CurrentMethod {
            return Location::StackSlot(0);
        }

        let wide = matches!(interval.class, RegClass::CorePair | RegClass::FpPair);
        let words = if wide { 2 } else { 1 };
        let step = words;

        let mut idx = 0;
        loop {
            if idx + words > attempt.slot_ends.len() {
                attempt.slot_ends.resize(idx + words, 0);
            }
            if attempt.slot_ends[idx..idx + words].iter().all(|&end| end <= interval.start) {
                for end in &mut attempt.slot_ends[idx..idx + words] {
                    *end = interval.end;
                }
                break;
            }
            idx += step;
        }

        let offset = (spill_base + 4 * idx as u32) as i32;
        if wide {
            Location::DoubleStackSlot(offset)
        } else {
            Location::StackSlot(offset)
        }
    }

    fn frame_layout(&self, attempt: &Attempt, out_args_size: u32) -> FrameLayout {
        let mut used = RegisterSet::empty();
        for location in attempt.assigned.iter().flatten() {
            used.add(*location);
        }
        for inst in self.linear_instructions() {
            if let Some(locations) = &self.graph.inst(inst).locations {
                for temp in &locations.temps {
                    used.add(*temp);
                }
                used.add(locations.out());
            }
        }

        let is_leaf = self
            .linear_instructions()
            .iter()
            .all(|&inst| self.graph.inst(inst).locations.as_ref().map(|l| !l.can_call()).unwrap_or(true));

        let core_callee = used.core & self.config.callee_save_core;
        let fp_callee = used.fp & self.config.callee_save_fp;
        let spill_slots = attempt.slot_ends.len() as u32;
        let deopt_flag = self.graph.has_should_deoptimize_flag;

        let empty = is_leaf && spill_slots == 0 && core_callee == 0 && fp_callee == 0 && !deopt_flag && out_args_size == 0;
        if empty {
            return FrameLayout {
                is_leaf,
                ..FrameLayout::default()
            };
        }

        let core_spill_mask = core_callee | (1 << self.config.return_address);
        let fp_spill_mask = if fp_callee == 0 {
            0
        } else {
            let low = fp_callee.trailing_zeros();
            let high = 31 - fp_callee.leading_zeros();
            ((1u64 << (high + 1)) - (1u64 << low)) as u32
        };

        let has_slow_path_calls = self.linear_instructions().iter().any(|&inst| {
            self.graph
                .inst(inst)
                .locations
                .as_ref()
                .map(|l| l.only_calls_on_slow_path() || l.calls_on_main_and_slow_path())
                .unwrap_or(false)
        });
        let slow_path_spill_size = if has_slow_path_calls {
            let core = used.core & self.config.caller_save_core & self.config.core;
            let fp = used.fp & self.config.caller_save_fp & self.config.fp;
            4 * (core.count_ones() + fp.count_ones())
        } else {
            0
        };

        let mut size = 4 + out_args_size + 4 * spill_slots + slow_path_spill_size;
        if deopt_flag {
            size += 4;
        }
        size += 4 * fp_spill_mask.count_ones() + 4 * core_spill_mask.count_ones();
        let frame_size = size.div_ceil(FrameLayout::STACK_ALIGNMENT) * FrameLayout::STACK_ALIGNMENT;

        let should_deoptimize_flag_offset = if deopt_flag {
            Some(frame_size - 4 * core_spill_mask.count_ones() - 4 * fp_spill_mask.count_ones() - 4)
        } else {
            None
        };

        FrameLayout {
            frame_size,
            core_spill_mask,
            fp_spill_mask,
            out_args_size,
            spill_slots,
            slow_path_spill_size,
            should_deoptimize_flag_offset,
            is_leaf,
        }
    }

    fn resolve(self, liveness: &Liveness, sites: &[InputSite], attempt: Attempt, frame: FrameLayout) -> Allocation {
        let n = self.graph.insts.len();
        let frame_size = frame.frame_size as i32;

        let in_caller_frame = |location: Location| match location {
            Location::StackSlot(offset) => Location::StackSlot(offset + frame_size),
            Location::DoubleStackSlot(offset) => Location::DoubleStackSlot(offset + frame_size),
            other => other,
        };

        let mut value_locations = vec![Location::NoLocation; n];
        let mut definition_register: HashMap<InstId, Location> = HashMap::new();
        let mut reloads: HashMap<(InstId, usize), Location> = HashMap::new();
        let mut temps: HashMap<(InstId, usize), Location> = HashMap::new();

        for (interval, assigned) in attempt.intervals.iter().zip(&attempt.assigned) {
            let location = match assigned {
                Some(location) => *location,
                None => continue,
            };
            match interval.kind {
                IntervalKind::Value(value) => value_locations[value.idx()] = location,
                IntervalKind::Definition(value) => {
                    definition_register.insert(value, location);
                }
                IntervalKind::Reload { user, index, .. } => {
                    reloads.insert((user, index), location);
                }
                IntervalKind::Temp { inst, index } => {
                    temps.insert((inst, index), location);
                }
            }
        }
        for (&value, &slot) in &attempt.spill_slot {
            value_locations[value.idx()] = if self.preassigned_stack_location(value).is_some() {
                in_caller_frame(slot)
            } else {
                slot
            };
        }
        for (idx, inst) in self.graph.insts.iter().enumerate() {
            if inst.kind.is_constant() && !inst.removed {
                value_locations[idx] = Location::Constant(inst.id);
            }
        }

        // Where a value sits while its definition is still being moved
        // into its final location.
        let mut early: HashMap<InstId, (u32, Location)> = HashMap::new();
        for interval in liveness.intervals.iter().flatten() {
            let value = interval.value;
            let inst = self.graph.inst(value);
            if inst.is_phi() {
                continue;
            }
            let out = inst.locations().out();
            let def_location = if out.is_register_kind() {
                out
            } else if let Some(&reg) = definition_register.get(&value) {
                reg
            } else {
                continue;
            };
            if def_location != value_locations[value.idx()] {
                early.insert(value, (inst.lifetime_position + 1, def_location));
            }
        }

        let location_at = |value: InstId, position: u32| -> Location {
            if let Some(&(until, location)) = early.get(&value) {
                if position <= until {
                    return location;
                }
            }
            value_locations[value.idx()]
        };

        let mut moves: BTreeMap<InstId, Vec<MoveOperands>> = BTreeMap::new();
        let mut add_move = |before: InstId, source: Location, destination: Location, ty: DataType, value: InstId| {
            if source != destination {
                moves
                    .entry(before)
                    .or_default()
                    .push(MoveOperands::new(source, destination, ty, Some(value)));
            }
        };

        let mut summaries: HashMap<InstId, LocationSummary> = HashMap::new();
        for inst in self.linear_instructions() {
            if let Some(locations) = &self.graph.inst(inst).locations {
                summaries.insert(inst, locations.clone());
            }
        }

        for site in sites {
            let ty = self.graph.inst(site.value).ty;
            let current = location_at(site.value, site.position - 1);
            let summary = summaries.get_mut(&site.user).expect("summary");
            let resolved = match site.location {
                Location::Unallocated(Policy::SameAsFirstInput) => continue,
                Location::Unallocated(_) => {
                    if current.is_register_kind() {
                        current
                    } else {
                        let reg = reloads[&(site.user, site.index)];
                        add_move(site.at, current, reg, ty, site.value);
                        reg
                    }
                }
                Location::Any => current,
                Location::Constant(_) => site.location,
                fixed => {
                    add_move(site.at, current, fixed, ty, site.value);
                    fixed
                }
            };
            summary.set_in_at(site.index, resolved);
        }

        for inst_id in self.linear_instructions() {
            let inst = self.graph.inst(inst_id);
            let p = inst.lifetime_position;
            let summary = match summaries.get_mut(&inst_id) {
                Some(summary) => summary,
                None => continue,
            };

            for index in 0..summary.temps.len() {
                if let Some(&location) = temps.get(&(inst_id, index)) {
                    summary.temps[index] = location;
                }
            }

            if has_interval(self.graph, inst_id) {
                let final_location = value_locations[inst_id.idx()];
                let out = summary.out();
                let written = match out {
                    Location::Unallocated(_) => {
                        let reg = if final_location.is_register_kind() {
                            final_location
                        } else {
                            definition_register[&inst_id]
                        };
                        if out == Location::Unallocated(Policy::SameAsFirstInput) {
                            let first = inst.input(0);
                            let source = location_at(first, p - 1);
                            add_move(inst_id, source, reg, inst.ty, first);
                            summary.set_in_at(0, reg);
                        }
                        summary.update_out(reg);
                        reg
                    }
                    Location::StackSlot(_) | Location::DoubleStackSlot(_) => {
                        summary.update_out(final_location);
                        final_location
                    }
                    fixed => fixed,
                };

                let store_needed = written != final_location
                    && !(final_location == Location::StackSlot(0)
                        && inst.kind == InstructionKind::CurrentMethod);
                if store_needed {
                    let next = self
                        .graph
                        .next_instruction(inst_id)
                        .expect("value defined by block terminator");
                    add_move(next, written, final_location, inst.ty, inst_id);
                }
            }

            if summary.needs_safepoint() {
                let will_call = summary.will_call();
                let mut live = RegisterSet::empty();
                let mut register_mask = 0u32;
                let mut stack_bits = Vec::new();

                for interval in liveness.intervals.iter().flatten() {
                    let value = interval.value;
                    if value == inst_id {
                        continue;
                    }
                    let live_after = interval.covers(p + 1);
                    let live_at = interval.covers(p) && !will_call;
                    if !live_after && !live_at {
                        continue;
                    }
                    let location = location_at(value, p + 1);
                    let is_reference = self.graph.inst(value).ty.is_reference();
                    if location.is_register_kind() {
                        live.add(location);
                        if is_reference {
                            register_mask |= location.core_mask();
                        }
                    } else if location.is_memory() && is_reference {
                        let offset = location.stack_index();
                        if offset >= 0 && offset < frame_size {
                            stack_bits.push((offset / 4) as usize);
                        }
                    }
                }

                if summary.only_calls_on_slow_path() || summary.calls_on_main_and_slow_path() {
                    summary.live_registers = live;
                }
                summary.register_mask = register_mask;
                for bit in stack_bits {
                    summary.set_stack_bit(bit);
                }
            }
        }

        // Phi inputs are moved at the end of each predecessor.
        for block in self.graph.linear_order.clone() {
            for phi in self.graph.block(block).phis.clone() {
                let destination = value_locations[phi.idx()];
                if destination.is_invalid() {
                    continue;
                }
                let ty = self.graph.inst(phi).ty;
                for (idx, &pred) in self.graph.block(block).predecessors.iter().enumerate() {
                    let input = self.graph.inst(phi).input(idx);
                    let term = self
                        .graph
                        .block(pred)
                        .last_instruction()
                        .expect("predecessor without terminator");
                    let position = self.graph.inst(term).lifetime_position - 1;
                    add_move(term, location_at(input, position), destination, ty, input);
                }
            }
        }

        let ranges: Vec<Option<(u32, u32)>> = (0..n)
            .map(|idx| liveness.intervals[idx].as_ref().map(|i| (i.start, i.end)))
            .collect();

        let graph = self.graph;
        for (inst, summary) in summaries {
            graph.inst_mut(inst).locations = Some(summary);
        }
        for block in graph.linear_order.clone() {
            for phi in graph.block(block).phis.clone() {
                let mut summary = LocationSummary::new(graph.inst(phi).inputs.len(), crate::locations::CallKind::NoCall);
                summary.update_out(value_locations[phi.idx()]);
                graph.inst_mut(phi).locations = Some(summary);
            }
        }

        for (before, list) in moves {
            let mv = graph.insert_before(before, InstructionKind::ParallelMove(list), DataType::Void, &[]);
            graph.inst_mut(mv).locations = Some(LocationSummary::new(0, crate::locations::CallKind::NoCall));
        }

        Allocation {
            frame,
            value_locations,
            ranges,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hir::{BinaryOp, MethodInfo};
    use crate::locations::CallKind;

    fn config() -> RegisterConfig {
        RegisterConfig {
            core: 0b0000_1101_1111_1111,
            core_pairs: vec![(0, 1), (2, 3), (4, 5), (6, 7), (10, 11)],
            fp: 0x3fff_ffff,
            caller_save_core: 0b0001_0000_0001_1111,
            caller_save_fp: 0x0000_ffff,
            callee_save_core: 0b0100_1101_1110_0000,
            callee_save_fp: 0xffff_0000,
            return_address: 14,
        }
    }

    fn summary(inputs: &[Location], out: Location, call_kind: CallKind) -> LocationSummary {
        let mut summary = LocationSummary::new(inputs.len(), call_kind);
        for (i, input) in inputs.iter().enumerate() {
            summary.set_in_at(i, *input);
        }
        if out.is_valid() {
            summary.set_out_overlap(out, false);
        }
        summary
    }

    fn all_locations_distinct(graph: &Graph, allocation: &Allocation, values: &[InstId]) {
        for (i, &a) in values.iter().enumerate() {
            for &b in &values[i + 1..] {
                let (sa, ea) = allocation.ranges[a.idx()].unwrap();
                let (sb, eb) = allocation.ranges[b.idx()].unwrap();
                if sa < eb && sb < ea {
                    let la = allocation.value_locations[a.idx()];
                    let lb = allocation.value_locations[b.idx()];
                    assert!(!la.overlaps(&lb), "{:?} and {:?} share {:?}", a, b, la);
                }
            }
        }
        let _ = graph;
    }

    #[test]
    fn test_simple_add_reuses_input_register() {
        let mut graph = Graph::new(MethodInfo::new("f", true, vec![DataType::Int32, DataType::Int32, DataType::Int32]));
        let entry = graph.entry_block;
        let a = graph.add(entry, InstructionKind::ParameterValue { index: 0 }, DataType::Int32, &[]);
        let b = graph.add(entry, InstructionKind::ParameterValue { index: 1 }, DataType::Int32, &[]);
        let add = graph.add(entry, InstructionKind::Binary(BinaryOp::Add), DataType::Int32, &[a, b]);
        let ret = graph.add(entry, InstructionKind::Return, DataType::Void, &[add]);
        graph.compute_linear_order();

        graph.inst_mut(a).locations = Some(summary(&[], Location::Register(1), CallKind::NoCall));
        graph.inst_mut(b).locations = Some(summary(&[], Location::Register(2), CallKind::NoCall));
        let rr = Location::requires_register();
        graph.inst_mut(add).locations = Some(summary(&[rr, rr], rr, CallKind::NoCall));
        graph.inst_mut(ret).locations = Some(summary(&[Location::Register(0)], Location::NoLocation, CallKind::NoCall));

        let config = config();
        let allocation = RegisterAllocator::new(&mut graph, &config, false).allocate().unwrap();

        assert!(allocation.frame.has_empty_frame());
        assert_eq!(allocation.value_locations[a.idx()], Location::Register(1));
        assert_eq!(allocation.value_locations[b.idx()], Location::Register(2));
        // The result is hinted into the return register.
        assert_eq!(allocation.value_locations[add.idx()], Location::Register(0));
        assert_eq!(graph.inst(add).locations().in_at(0), Location::Register(1));
        assert_eq!(graph.inst(ret).locations().in_at(0), Location::Register(0));
        assert_eq!(graph.block(entry).instructions.len(), 4);
    }

    #[test]
    fn test_value_live_across_call_uses_callee_save() {
        let mut graph = Graph::new(MethodInfo::new("g", true, vec![DataType::Int32, DataType::Int32]));
        let entry = graph.entry_block;
        let a = graph.add(entry, InstructionKind::ParameterValue { index: 0 }, DataType::Int32, &[]);
        let call = graph.add(entry, InstructionKind::Nop, DataType::Void, &[]);
        let add = graph.add(entry, InstructionKind::Binary(BinaryOp::Add), DataType::Int32, &[a, a]);
        let ret = graph.add(entry, InstructionKind::Return, DataType::Void, &[add]);
        graph.compute_linear_order();

        graph.inst_mut(a).locations = Some(summary(&[], Location::Register(1), CallKind::NoCall));
        graph.inst_mut(call).locations = Some(summary(&[], Location::NoLocation, CallKind::CallOnMainOnly));
        let rr = Location::requires_register();
        graph.inst_mut(add).locations = Some(summary(&[rr, rr], rr, CallKind::NoCall));
        graph.inst_mut(ret).locations = Some(summary(&[Location::Register(0)], Location::NoLocation, CallKind::NoCall));

        let config = config();
        let allocation = RegisterAllocator::new(&mut graph, &config, false).allocate().unwrap();

        let la = allocation.value_locations[a.idx()];
        assert!(la.is_register());
        assert!(config.callee_save_core & la.core_mask() != 0);
        assert!(allocation.frame.core_spill_mask & la.core_mask() != 0);
        assert!(allocation.frame.core_spill_mask & (1 << 14) != 0);
        assert_eq!(allocation.frame.frame_size % 16, 0);

        // r1 -> callee save register before the call.
        let first = graph.block(entry).instructions[1];
        match graph.kind(first) {
            InstructionKind::ParallelMove(moves) => {
                assert_eq!(moves[0].source, Location::Register(1));
                assert_eq!(moves[0].destination, la);
            }
            other => panic!("expected parallel move, got {:?}", other),
        }
    }

    #[test]
    fn test_pressure_spills_and_reloads() {
        let mut graph = Graph::new(MethodInfo::new("h", true, vec![DataType::Int32, DataType::Int32]));
        let entry = graph.entry_block;
        let p = graph.add(entry, InstructionKind::ParameterValue { index: 0 }, DataType::Int32, &[]);
        let rr = Location::requires_register();
        graph.inst_mut(p).locations = Some(summary(&[], Location::Register(1), CallKind::NoCall));

        let mut values = vec![p];
        for i in 0..14 {
            let prev = values[i];
            let v = graph.add(entry, InstructionKind::Binary(BinaryOp::Add), DataType::Int32, &[prev, p]);
            graph.inst_mut(v).locations = Some(summary(&[rr, rr], rr, CallKind::NoCall));
            values.push(v);
        }
        // Every value stays alive until the end.
        let mut acc = values[values.len() - 1];
        for &v in values.iter().rev().skip(1) {
            let sum = graph.add(entry, InstructionKind::Binary(BinaryOp::Add), DataType::Int32, &[acc, v]);
            graph.inst_mut(sum).locations = Some(summary(&[rr, rr], rr, CallKind::NoCall));
            acc = sum;
        }
        let ret = graph.add(entry, InstructionKind::Return, DataType::Void, &[acc]);
        graph.inst_mut(ret).locations = Some(summary(&[Location::Register(0)], Location::NoLocation, CallKind::NoCall));
        graph.compute_linear_order();

        let config = config();
        let allocation = RegisterAllocator::new(&mut graph, &config, false).allocate().unwrap();

        let spilled = values
            .iter()
            .filter(|v| allocation.value_locations[v.idx()].is_stack_slot())
            .count();
        assert!(spilled > 0);
        assert!(allocation.frame.spill_slots > 0);
        all_locations_distinct(&graph, &allocation, &values);

        for inst in &graph.block(entry).instructions {
            if let InstructionKind::Binary(_) = graph.kind(*inst) {
                let locations = graph.inst(*inst).locations();
                assert!(locations.in_at(0).is_register());
                assert!(locations.in_at(1).is_register());
                assert!(locations.out().is_register());
            }
        }
    }
}
