use tern_compiler::hir::{
    BinaryOp, DataType, Graph, InstructionKind, LoadClassInfo, LoadClassKind, MethodInfo,
};
use tern_compiler::linker_patch::LinkerPatchKind;
use tern_compiler::stack_map::CodeInfo;
use tern_compiler::{CompileError, Compiler, CompilerOptions, InstructionSet, MethodCompilationStat};

fn with_exit(mut graph: Graph) -> Graph {
    let entry = graph.entry_block;
    let exit = graph.add_block();
    graph.add_edge(entry, exit);
    graph.add(exit, InstructionKind::Exit, DataType::Void, &[]);
    graph.set_exit_block(exit);
    graph
}

fn add_ints() -> Graph {
    let mut graph = Graph::new(MethodInfo::new(
        "add",
        true,
        vec![DataType::Int32, DataType::Int32, DataType::Int32],
    ));
    let entry = graph.entry_block;
    let a = graph.add(entry, InstructionKind::ParameterValue { index: 0 }, DataType::Int32, &[]);
    let b = graph.add(entry, InstructionKind::ParameterValue { index: 1 }, DataType::Int32, &[]);
    let sum = graph.add(entry, InstructionKind::Binary(BinaryOp::Add), DataType::Int32, &[a, b]);
    graph.add(entry, InstructionKind::Return, DataType::Void, &[sum]);
    with_exit(graph)
}

fn load_bss_class() -> Graph {
    let mut graph = Graph::new(MethodInfo::new("cls", true, vec![DataType::Reference]));
    let entry = graph.entry_block;
    let info = LoadClassInfo {
        type_index: 7,
        dex_file: 2,
        load_kind: LoadClassKind::BssEntry,
        must_resolve_type_on_slow_path: true,
        must_generate_clinit_check: false,
        needs_access_check: false,
        boot_image_offset: 0,
    };
    let cls = graph.add(entry, InstructionKind::LoadClass(info), DataType::Reference, &[]);
    graph.add(entry, InstructionKind::Return, DataType::Void, &[cls]);
    with_exit(graph)
}

#[test]
fn compiles_integer_add() {
    let compiler = Compiler::new(CompilerOptions::default());
    let compiled = compiler.compile(add_ints()).unwrap();

    assert_eq!(compiled.isa, InstructionSet::Thumb2);
    assert!(compiled.code.len() >= 4);
    assert_eq!(compiled.code.len() % 2, 0);
    assert!(compiled.patches.is_empty());
    assert!(compiled.jit_roots.is_empty());

    let info = CodeInfo::decode(&compiled.stack_map).unwrap();
    assert_eq!(info.frame.frame_size, compiled.frame_size);
    assert_eq!(info.frame.code_size as usize, compiled.code.len());
    assert_eq!(compiler.stats().get(MethodCompilationStat::Compiled), 1);
}

#[test]
fn aot_patches_are_sorted() {
    let compiler = Compiler::new(CompilerOptions::aot());
    let compiled = compiler.compile(load_bss_class()).unwrap();

    assert!(
        compiled
            .patches
            .iter()
            .any(|p| p.kind == LinkerPatchKind::TypeBssEntry && p.target == 7 && p.dex_file == 2)
    );
    assert!(
        compiled
            .patches
            .windows(2)
            .all(|w| w[0].literal_offset <= w[1].literal_offset)
    );
    for patch in &compiled.patches {
        assert!((patch.literal_offset as usize) < compiled.code.len());
    }
}

#[test]
fn missing_terminator_is_invalid() {
    let mut graph = Graph::new(MethodInfo::new("broken", true, vec![DataType::Void]));
    let entry = graph.entry_block;
    graph.add(entry, InstructionKind::IntConstant(1), DataType::Int32, &[]);

    let compiler = Compiler::new(CompilerOptions {
        check_graph: true,
        ..CompilerOptions::default()
    });
    match compiler.compile(graph) {
        Err(CompileError::InvalidGraph(_)) => {}
        other => panic!("expected invalid graph, got {:?}", other.map(|m| m.code.len())),
    }
    assert_eq!(compiler.stats().get(MethodCompilationStat::NotCompiledInvalidGraph), 1);
}

#[test]
fn stats_accumulate_across_methods() {
    let compiler = Compiler::new(CompilerOptions {
        check_graph: true,
        ..CompilerOptions::default()
    });
    compiler.compile(add_ints()).unwrap();
    compiler.compile(add_ints()).unwrap();
    let _ = compiler.compile(Graph::new(MethodInfo::new("empty", true, vec![DataType::Void])));

    assert_eq!(compiler.stats().get(MethodCompilationStat::Compiled), 2);
    compiler.stats().dump();
}
