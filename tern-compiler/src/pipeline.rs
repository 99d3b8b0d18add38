//! Runs a list of optimization passes over a graph.
//!
//! Each entry names a pass and optionally the pass it depends on; an entry
//! only runs when the most recent run of its dependency changed the graph.
//! The passes themselves are supplied by a `PassFactory`.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::io::Write;
use std::time::{Duration, Instant};

use tracing::trace;

use crate::error::{CompileError, CompileResult};
use crate::graph_checker::GraphChecker;
use crate::hir::Graph;

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum PassId {
    None,
    SideEffectsAnalysis,
    InductionVarAnalysis,
    LoadStoreAnalysis,
    GlobalValueNumbering,
    InvariantCodeMotion,
    LoopOptimization,
    BoundsCheckElimination,
    LoadStoreElimination,
    ConstantFolding,
    DeadCodeElimination,
    Inliner,
    SelectGenerator,
    InstructionSimplifier,
    AggressiveInstructionSimplifier,
    CHAGuardOptimization,
    CodeSinking,
    ConstructorFenceRedundancyElimination,
    Scheduling,
    WriteBarrierElimination,
    InstructionSimplifierArm,
    CriticalEdgeSplitting,
}

impl PassId {
    pub fn name(self) -> &'static str {
        match self {
            PassId::None => "none",
            PassId::SideEffectsAnalysis => "side_effects",
            PassId::InductionVarAnalysis => "induction_var_analysis",
            PassId::LoadStoreAnalysis => "load_store_analysis",
            PassId::GlobalValueNumbering => "GVN",
            PassId::InvariantCodeMotion => "licm",
            PassId::LoopOptimization => "loop_optimization",
            PassId::BoundsCheckElimination => "BCE",
            PassId::LoadStoreElimination => "load_store_elimination",
            PassId::ConstantFolding => "constant_folding",
            PassId::DeadCodeElimination => "dead_code_elimination",
            PassId::Inliner => "inliner",
            PassId::SelectGenerator => "select_generator",
            PassId::InstructionSimplifier => "instruction_simplifier",
            PassId::AggressiveInstructionSimplifier => "aggressive_instruction_simplifier",
            PassId::CHAGuardOptimization => "cha_guard_optimization",
            PassId::CodeSinking => "code_sinking",
            PassId::ConstructorFenceRedundancyElimination => "constructor_fence_redundancy_elimination",
            PassId::Scheduling => "scheduler",
            PassId::WriteBarrierElimination => "write_barrier_elimination",
            PassId::InstructionSimplifierArm => "instruction_simplifier_arm",
            PassId::CriticalEdgeSplitting => "critical_edge_splitting",
        }
    }

    pub fn from_name(name: &str) -> Option<PassId> {
        ALL_PASSES.iter().copied().find(|p| p.name() == name)
    }
}

const ALL_PASSES: [PassId; 21] = [
    PassId::SideEffectsAnalysis,
    PassId::InductionVarAnalysis,
    PassId::LoadStoreAnalysis,
    PassId::GlobalValueNumbering,
    PassId::InvariantCodeMotion,
    PassId::LoopOptimization,
    PassId::BoundsCheckElimination,
    PassId::LoadStoreElimination,
    PassId::ConstantFolding,
    PassId::DeadCodeElimination,
    PassId::Inliner,
    PassId::SelectGenerator,
    PassId::InstructionSimplifier,
    PassId::AggressiveInstructionSimplifier,
    PassId::CHAGuardOptimization,
    PassId::CodeSinking,
    PassId::ConstructorFenceRedundancyElimination,
    PassId::Scheduling,
    PassId::WriteBarrierElimination,
    PassId::InstructionSimplifierArm,
    PassId::CriticalEdgeSplitting,
];

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct OptimizationDef {
    pub pass: PassId,
    /// Name used in dumps and timings, e.g. `constant_folding$after_inlining`.
    pub name: String,
    pub depends_on: PassId,
}

impl OptimizationDef {
    pub fn new(pass: PassId) -> OptimizationDef {
        OptimizationDef {
            pass,
            name: pass.name().into(),
            depends_on: PassId::None,
        }
    }

    pub fn named(pass: PassId, name: &str) -> OptimizationDef {
        OptimizationDef {
            pass,
            name: name.into(),
            depends_on: PassId::None,
        }
    }

    pub fn depends_on(mut self, pass: PassId) -> OptimizationDef {
        self.depends_on = pass;
        self
    }
}

/// Parses a comma separated pass list. Each entry is a pass name with an
/// optional `$suffix` distinguishing repeated runs.
pub fn parse_pass_list(list: &str) -> CompileResult<Vec<OptimizationDef>> {
    let mut defs = Vec::new();
    for entry in list.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let base = entry.split('$').next().unwrap_or(entry);
        let pass = PassId::from_name(base).ok_or_else(|| CompileError::UnknownPass(entry.into()))?;
        defs.push(OptimizationDef::named(pass, entry));
    }
    Ok(defs)
}

/// Optimizing pipeline used when no pass list is given.
pub fn default_pipeline(baseline: bool) -> Vec<OptimizationDef> {
    if baseline {
        return vec![OptimizationDef::new(PassId::CriticalEdgeSplitting)];
    }

    vec![
        OptimizationDef::new(PassId::ConstantFolding),
        OptimizationDef::new(PassId::InstructionSimplifier),
        OptimizationDef::new(PassId::DeadCodeElimination),
        OptimizationDef::new(PassId::Inliner),
        OptimizationDef::named(PassId::ConstantFolding, "constant_folding$after_inlining")
            .depends_on(PassId::Inliner),
        OptimizationDef::named(PassId::InstructionSimplifier, "instruction_simplifier$after_inlining")
            .depends_on(PassId::Inliner),
        OptimizationDef::named(PassId::DeadCodeElimination, "dead_code_elimination$after_inlining")
            .depends_on(PassId::Inliner),
        OptimizationDef::new(PassId::SideEffectsAnalysis),
        OptimizationDef::new(PassId::GlobalValueNumbering).depends_on(PassId::SideEffectsAnalysis),
        OptimizationDef::new(PassId::SelectGenerator),
        OptimizationDef::new(PassId::InvariantCodeMotion).depends_on(PassId::SideEffectsAnalysis),
        OptimizationDef::new(PassId::InductionVarAnalysis),
        OptimizationDef::new(PassId::BoundsCheckElimination).depends_on(PassId::InductionVarAnalysis),
        OptimizationDef::new(PassId::LoopOptimization).depends_on(PassId::InductionVarAnalysis),
        OptimizationDef::new(PassId::LoadStoreElimination),
        OptimizationDef::new(PassId::CHAGuardOptimization),
        OptimizationDef::new(PassId::CodeSinking),
        OptimizationDef::new(PassId::ConstructorFenceRedundancyElimination),
        OptimizationDef::new(PassId::WriteBarrierElimination),
        OptimizationDef::new(PassId::InstructionSimplifierArm),
        OptimizationDef::new(PassId::Scheduling),
        OptimizationDef::new(PassId::CriticalEdgeSplitting),
    ]
}

pub trait Pass {
    /// Returns whether the graph changed.
    fn run(&mut self, graph: &mut Graph) -> bool;
}

pub trait PassFactory {
    /// `None` when the pass is not available; the entry is skipped.
    fn create(&self, def: &OptimizationDef) -> Option<Box<dyn Pass>>;
}

/// Splits critical edges; the one pass the backend cannot do without.
pub struct CriticalEdgeSplitting;

impl Pass for CriticalEdgeSplitting {
    fn run(&mut self, graph: &mut Graph) -> bool {
        if !graph.has_critical_edges() {
            return false;
        }
        graph.split_critical_edges();
        true
    }
}

/// Factory providing only the passes implemented in this crate.
pub struct BuiltinPasses;

impl PassFactory for BuiltinPasses {
    fn create(&self, def: &OptimizationDef) -> Option<Box<dyn Pass>> {
        match def.pass {
            PassId::CriticalEdgeSplitting => Some(Box::new(CriticalEdgeSplitting)),
            _ => None,
        }
    }
}

/// Hooks run around every pass: CFG dumps, timings and graph checks.
pub struct PassObserver<'a> {
    dump: Option<&'a mut dyn Write>,
    check_graph: bool,
    timings: Vec<(String, Duration)>,
    started: Option<(Instant, usize)>,
}

impl<'a> PassObserver<'a> {
    pub fn new(dump: Option<&'a mut dyn Write>, check_graph: bool) -> PassObserver<'a> {
        PassObserver {
            dump,
            check_graph,
            timings: Vec::new(),
            started: None,
        }
    }

    pub fn start_pass(&mut self, name: &str, graph: &Graph) {
        trace!("pass {} started", name);
        if let Some(w) = self.dump.as_mut() {
            let _ = w.write_all(dump_graph(graph, &format!("{} (before)", name)).as_bytes());
        }
        self.started = Some((Instant::now(), graph.instruction_count()));
    }

    pub fn end_pass(&mut self, name: &str, changed: bool, graph: &Graph) {
        let (start, count_before) = self.started.take().expect("end_pass without start_pass");
        self.timings.push((name.into(), start.elapsed()));

        if let Some(w) = self.dump.as_mut() {
            let _ = w.write_all(dump_graph(graph, &format!("{} (after)", name)).as_bytes());
        }

        if self.check_graph {
            let errors = GraphChecker::new(graph).run();
            if !errors.is_empty() {
                panic!("graph invalid after {}:\n{}", name, errors.join("\n"));
            }
            if !changed {
                assert_eq!(
                    count_before,
                    graph.instruction_count(),
                    "pass {} reported no change but changed the graph",
                    name
                );
            }
        }
    }

    pub fn timings(&self) -> &[(String, Duration)] {
        &self.timings
    }
}

impl Drop for PassObserver<'_> {
    fn drop(&mut self) {
        for (name, duration) in &self.timings {
            trace!("pass {} took {:?}", name, duration);
        }
    }
}

/// Runs `defs` in order. Returns how many passes actually ran.
pub fn run_optimizations(
    graph: &mut Graph,
    defs: &[OptimizationDef],
    factory: &dyn PassFactory,
    observer: &mut PassObserver,
) -> usize {
    let mut changes: HashMap<PassId, bool> = HashMap::new();
    let mut executed = 0;

    for def in defs {
        let should_run = def.depends_on == PassId::None || changes.get(&def.depends_on).copied().unwrap_or(false);
        if !should_run {
            trace!("pass {} skipped", def.name);
            continue;
        }

        let mut pass = match factory.create(def) {
            Some(pass) => pass,
            None => continue,
        };

        observer.start_pass(&def.name, graph);
        let changed = pass.run(graph);
        observer.end_pass(&def.name, changed, graph);

        changes.insert(def.pass, changed);
        executed += 1;
    }

    executed
}

/// Textual CFG dump, including location summaries once they exist.
pub fn dump_graph(graph: &Graph, title: &str) -> String {
    let mut out = String::new();
    writeln!(out, "== {} :: {}", graph.method.name, title).unwrap();

    for (idx, block) in graph.blocks.iter().enumerate() {
        writeln!(
            out,
            "B{} preds {:?} succs {:?}{}",
            idx,
            block.predecessors,
            block.successors,
            if block.is_loop_header { " loop-header" } else { "" }
        )
        .unwrap();

        for &id in block.phis.iter().chain(block.instructions.iter()) {
            let inst = graph.inst(id);
            write!(out, "  {:?} {} {:?} {:?}", id, inst.kind.name(), inst.ty, inst.inputs).unwrap();
            if let Some(locations) = &inst.locations {
                write!(out, " [in {:?} out {:?}", locations.inputs, locations.output).unwrap();
                if !locations.temps.is_empty() {
                    write!(out, " temps {:?}", locations.temps).unwrap();
                }
                write!(out, "]").unwrap();
            }
            writeln!(out).unwrap();
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::hir::{DataType, InstructionKind, MethodInfo};

    #[test]
    fn test_parse_pass_list() {
        let defs = parse_pass_list("constant_folding, GVN,constant_folding$after_gvn").unwrap();
        assert_eq!(defs.len(), 3);
        assert_eq!(defs[1].pass, PassId::GlobalValueNumbering);
        assert_eq!(defs[2].pass, PassId::ConstantFolding);
        assert_eq!(defs[2].name, "constant_folding$after_gvn");

        assert_eq!(
            parse_pass_list("constant_folding,frobnicate$x"),
            Err(CompileError::UnknownPass("frobnicate$x".into()))
        );
    }

    struct Scripted {
        log: Rc<RefCell<Vec<String>>>,
        results: HashMap<PassId, bool>,
    }

    struct ScriptedPass {
        name: String,
        changed: bool,
        log: Rc<RefCell<Vec<String>>>,
    }

    impl Pass for ScriptedPass {
        fn run(&mut self, _graph: &mut Graph) -> bool {
            self.log.borrow_mut().push(self.name.clone());
            self.changed
        }
    }

    impl PassFactory for Scripted {
        fn create(&self, def: &OptimizationDef) -> Option<Box<dyn Pass>> {
            Some(Box::new(ScriptedPass {
                name: def.name.clone(),
                changed: self.results[&def.pass],
                log: self.log.clone(),
            }))
        }
    }

    fn graph() -> Graph {
        let mut graph = Graph::new(MethodInfo::new("m", true, vec![DataType::Void]));
        let entry = graph.entry_block;
        graph.add(entry, InstructionKind::ReturnVoid, DataType::Void, &[]);
        graph
    }

    #[test]
    fn test_dependencies_follow_last_result() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut results = HashMap::new();
        results.insert(PassId::Inliner, false);
        results.insert(PassId::SideEffectsAnalysis, true);
        results.insert(PassId::ConstantFolding, true);
        results.insert(PassId::GlobalValueNumbering, false);
        let factory = Scripted {
            log: log.clone(),
            results,
        };

        let defs = vec![
            OptimizationDef::new(PassId::Inliner),
            OptimizationDef::named(PassId::ConstantFolding, "constant_folding$after_inlining")
                .depends_on(PassId::Inliner),
            OptimizationDef::new(PassId::SideEffectsAnalysis),
            OptimizationDef::new(PassId::GlobalValueNumbering).depends_on(PassId::SideEffectsAnalysis),
            OptimizationDef::new(PassId::InvariantCodeMotion).depends_on(PassId::LoopOptimization),
        ];

        let mut graph = graph();
        let mut observer = PassObserver::new(None, true);
        let executed = run_optimizations(&mut graph, &defs, &factory, &mut observer);

        assert_eq!(executed, 3);
        assert_eq!(*log.borrow(), vec!["inliner", "side_effects", "GVN"]);
        assert_eq!(observer.timings().len(), 3);
    }

    struct Lying;

    impl Pass for Lying {
        fn run(&mut self, graph: &mut Graph) -> bool {
            let entry = graph.entry_block;
            let ret = graph.block(entry).instructions[0];
            graph.insert_before(ret, InstructionKind::Nop, DataType::Void, &[]);
            false
        }
    }

    struct LyingFactory;

    impl PassFactory for LyingFactory {
        fn create(&self, _def: &OptimizationDef) -> Option<Box<dyn Pass>> {
            Some(Box::new(Lying))
        }
    }

    #[test]
    #[should_panic(expected = "reported no change")]
    fn test_unchanged_pass_must_not_change_graph() {
        let mut graph = graph();
        let mut observer = PassObserver::new(None, true);
        run_optimizations(
            &mut graph,
            &[OptimizationDef::new(PassId::ConstantFolding)],
            &LyingFactory,
            &mut observer,
        );
    }

    #[test]
    fn test_dump_contains_blocks() {
        let mut graph = graph();
        let mut out: Vec<u8> = Vec::new();
        {
            let mut observer = PassObserver::new(Some(&mut out), false);
            run_optimizations(
                &mut graph,
                &[OptimizationDef::new(PassId::CriticalEdgeSplitting)],
                &BuiltinPasses,
                &mut observer,
            );
        }
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("critical_edge_splitting (before)"));
        assert!(text.contains("ReturnVoid"));
    }
}
