//! Compiles one method: optimization passes, location building, register
//! allocation and code generation.

use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::{debug, info, warn};

use crate::arm::{CodeGeneratorArm, build_locations, register_config};
use crate::compiled_method::CompiledMethod;
use crate::error::{CompileError, CompileResult};
use crate::graph_checker::GraphChecker;
use crate::hir::Graph;
use crate::options::CompilerOptions;
use crate::pipeline::{BuiltinPasses, PassFactory, PassObserver, default_pipeline, parse_pass_list, run_optimizations};
use crate::register_allocator::RegisterAllocator;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum MethodCompilationStat {
    Compiled,
    CompiledBaseline,
    CompiledOsr,
    NotCompiledFrameTooLarge,
    NotCompiledUnknownPass,
    NotCompiledUnsupportedInstruction,
    NotCompiledOutOfRegisters,
    NotCompiledInvalidGraph,
}

const STAT_COUNT: usize = MethodCompilationStat::NotCompiledInvalidGraph as usize + 1;

impl MethodCompilationStat {
    fn for_error(err: &CompileError) -> MethodCompilationStat {
        match err {
            CompileError::FrameTooLarge { .. } => MethodCompilationStat::NotCompiledFrameTooLarge,
            CompileError::UnknownPass(_) => MethodCompilationStat::NotCompiledUnknownPass,
            CompileError::UnsupportedInstruction(_) => MethodCompilationStat::NotCompiledUnsupportedInstruction,
            CompileError::OutOfRegisters(_) => MethodCompilationStat::NotCompiledOutOfRegisters,
            CompileError::InvalidGraph(_) => MethodCompilationStat::NotCompiledInvalidGraph,
        }
    }
}

/// Counters shared by all compilations of one compiler instance.
pub struct CompilationStats {
    counters: [AtomicUsize; STAT_COUNT],
}

impl CompilationStats {
    pub fn new() -> CompilationStats {
        CompilationStats {
            counters: std::array::from_fn(|_| AtomicUsize::new(0)),
        }
    }

    pub fn record(&self, stat: MethodCompilationStat) {
        self.counters[stat as usize].fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self, stat: MethodCompilationStat) -> usize {
        self.counters[stat as usize].load(Ordering::Relaxed)
    }

    pub fn dump(&self) {
        let compiled = self.get(MethodCompilationStat::Compiled);
        let failed: usize = [
            MethodCompilationStat::NotCompiledFrameTooLarge,
            MethodCompilationStat::NotCompiledUnknownPass,
            MethodCompilationStat::NotCompiledUnsupportedInstruction,
            MethodCompilationStat::NotCompiledOutOfRegisters,
            MethodCompilationStat::NotCompiledInvalidGraph,
        ]
        .iter()
        .map(|&stat| self.get(stat))
        .sum();
        info!(
            compiled,
            baseline = self.get(MethodCompilationStat::CompiledBaseline),
            osr = self.get(MethodCompilationStat::CompiledOsr),
            failed,
            "compilation stats"
        );
    }
}

impl Default for CompilationStats {
    fn default() -> CompilationStats {
        CompilationStats::new()
    }
}

pub struct Compiler<'a> {
    options: CompilerOptions,
    passes: &'a dyn PassFactory,
    stats: CompilationStats,
}

impl Compiler<'static> {
    pub fn new(options: CompilerOptions) -> Compiler<'static> {
        Compiler::with_passes(options, &BuiltinPasses)
    }
}

impl<'a> Compiler<'a> {
    pub fn with_passes(options: CompilerOptions, passes: &'a dyn PassFactory) -> Compiler<'a> {
        Compiler {
            options,
            passes,
            stats: CompilationStats::new(),
        }
    }

    pub fn options(&self) -> &CompilerOptions {
        &self.options
    }

    pub fn stats(&self) -> &CompilationStats {
        &self.stats
    }

    /// Compiles `graph`. Failures are counted and returned; the method
    /// then stays uncompiled.
    pub fn compile(&self, graph: Graph) -> CompileResult<CompiledMethod> {
        let name = graph.method.name.clone();
        match self.compile_graph(graph) {
            Ok(compiled) => {
                self.stats.record(MethodCompilationStat::Compiled);
                if compiled.is_baseline {
                    self.stats.record(MethodCompilationStat::CompiledBaseline);
                }
                if compiled.is_osr {
                    self.stats.record(MethodCompilationStat::CompiledOsr);
                }
                Ok(compiled)
            }
            Err(err) => {
                warn!(method = %name, error = %err, "method not compiled");
                self.stats.record(MethodCompilationStat::for_error(&err));
                Err(err)
            }
        }
    }

    fn compile_graph(&self, mut graph: Graph) -> CompileResult<CompiledMethod> {
        let options = &self.options;
        if graph.linear_order.is_empty() {
            graph.compute_linear_order();
        }

        if options.check_graph {
            let errors = GraphChecker::new(&graph).run();
            if !errors.is_empty() {
                return Err(CompileError::InvalidGraph(errors.join("; ")));
            }
        }

        let defs = match options.pass_list.as_deref() {
            Some(list) => parse_pass_list(list)?,
            None => default_pipeline(options.baseline),
        };

        {
            let mut stdout = std::io::stdout();
            let dump: Option<&mut dyn Write> = if options.dump_cfg { Some(&mut stdout) } else { None };
            let mut observer = PassObserver::new(dump, options.check_graph);
            let executed = run_optimizations(&mut graph, &defs, self.passes, &mut observer);
            debug!(method = %graph.method.name, executed, "optimizations done");
        }

        // Passes may have rewired blocks.
        graph.compute_linear_order();

        build_locations(&mut graph, options)?;
        let config = register_config(options);
        let allocation = RegisterAllocator::new(&mut graph, &config, options.debuggable).allocate()?;

        CodeGeneratorArm::new(&graph, options, &allocation).generate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hir::{DataType, InstructionKind, MethodInfo};

    fn return_void() -> Graph {
        let mut graph = Graph::new(MethodInfo::new("v", true, vec![DataType::Void]));
        let entry = graph.entry_block;
        let exit = graph.add_block();
        graph.add_edge(entry, exit);
        graph.add(entry, InstructionKind::ReturnVoid, DataType::Void, &[]);
        graph.add(exit, InstructionKind::Exit, DataType::Void, &[]);
        graph.set_exit_block(exit);
        graph
    }

    #[test]
    fn test_unknown_pass_is_counted() {
        let compiler = Compiler::new(CompilerOptions {
            pass_list: Some("constant_folding,no_such_pass".into()),
            ..CompilerOptions::default()
        });
        let err = compiler.compile(return_void()).unwrap_err();
        assert_eq!(err, CompileError::UnknownPass("no_such_pass".into()));
        assert_eq!(compiler.stats().get(MethodCompilationStat::NotCompiledUnknownPass), 1);
        assert_eq!(compiler.stats().get(MethodCompilationStat::Compiled), 0);
    }

    #[test]
    fn test_return_void_compiles() {
        let compiler = Compiler::new(CompilerOptions::default());
        let compiled = compiler.compile(return_void()).unwrap();
        assert!(!compiled.code.is_empty());
        assert_eq!(compiled.code.len() % 2, 0);
        assert_eq!(compiler.stats().get(MethodCompilationStat::Compiled), 1);
    }

    #[test]
    fn test_baseline_is_counted() {
        let compiler = Compiler::new(CompilerOptions {
            baseline: true,
            ..CompilerOptions::default()
        });
        compiler.compile(return_void()).unwrap();
        assert_eq!(compiler.stats().get(MethodCompilationStat::CompiledBaseline), 1);
    }
}
