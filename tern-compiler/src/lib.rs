pub mod arm;
pub mod cfi;
pub mod compiled_method;
pub mod disassembler;
pub mod driver;
pub mod error;
pub mod graph_checker;
pub mod hir;
pub mod linker_patch;
pub mod liveness;
pub mod locations;
pub mod options;
pub mod parallel_move;
pub mod pipeline;
pub mod register_allocator;
pub mod runtime;
pub mod stack_map;

pub use compiled_method::{CompiledMethod, InstructionSet};
pub use driver::{CompilationStats, Compiler, MethodCompilationStat};
pub use error::{CompileError, CompileResult};
pub use options::{CompilerOptions, InstructionSetFeatures};
