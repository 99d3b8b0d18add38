use std::sync::{Arc, Weak};
use std::thread;

use parking_lot::Mutex;

use tern_compiler::hir::{BinaryOp, DataType, Graph, InstructionKind, LoadClassInfo, LoadClassKind, MethodInfo};
use tern_compiler::{Compiler, CompilerOptions};
use tern_jit::{
    ArtMethod, CodeToCommit, CompilationKind, JitCodeCache, JitOptions, MethodRef, MutatorThreads, NoMutators,
};

const BRIDGE: usize = 0x4000;

fn options() -> JitOptions {
    JitOptions {
        initial_capacity: 64 * 1024,
        max_capacity: 1024 * 1024,
        interpreter_bridge: BRIDGE,
        ..JitOptions::default()
    }
}

fn commit_raw(cache: &JitCodeCache, method: &MethodRef, code: &[u8], stack_map: &[u8]) -> usize {
    let reservation = cache.reserve(method, code.len(), stack_map.len(), 0).unwrap();
    let code_ptr = reservation.code_ptr();
    assert!(cache.commit(
        method,
        reservation,
        &CodeToCommit::raw(code, stack_map),
        CompilationKind::Optimized,
        &[],
    ));
    code_ptr
}

/// Return addresses the test pretends are on mutator stacks.
#[derive(Default)]
struct FakeStacks {
    return_pcs: Mutex<Vec<usize>>,
}

impl MutatorThreads for FakeStacks {
    fn visit_return_pcs(&self, f: &mut dyn FnMut(usize)) {
        for &pc in self.return_pcs.lock().iter() {
            f(pc);
        }
    }
}

#[test]
fn commit_lookup_zombie_collect() {
    let cache = JitCodeCache::new(options(), Arc::new(NoMutators)).unwrap();
    let method = ArtMethod::new("run", "V", 0, 1, BRIDGE);

    let reservation = cache.reserve(&method, 64, 32, 0).unwrap();
    let code_begin = reservation.code_ptr();
    let code: Vec<u8> = (0..64).collect();
    assert!(cache.commit(
        &method,
        reservation,
        &CodeToCommit::raw(&code, &[0; 32]),
        CompilationKind::Optimized,
        &[],
    ));

    let header = cache.lookup_method_header(code_begin + 16, Some(&method)).unwrap();
    assert_eq!(header.code_ptr(), code_begin);
    assert!(header.contains(code_begin + 16));

    cache.add_zombie_code(&method, code_begin);
    assert_eq!(method.entry_point(), BRIDGE);
    let header = cache.lookup_method_header(code_begin + 16, Some(&method)).unwrap();
    assert_eq!(header.code_ptr(), code_begin);

    cache.do_collection();
    assert!(cache.lookup_method_header(code_begin + 16, Some(&method)).is_none());
}

#[test]
fn lookup_finds_exactly_the_owning_code() {
    let cache = JitCodeCache::new(options(), Arc::new(NoMutators)).unwrap();
    let mut installed = Vec::new();
    for i in 0..20u32 {
        let method = ArtMethod::new("m", "V", 0, i, BRIDGE);
        let code = vec![i as u8; 8 + 6 * i as usize];
        let code_ptr = commit_raw(&cache, &method, &code, &[]);
        installed.push((method, code_ptr, code.len()));
    }

    for (method, code_ptr, size) in &installed {
        for pc in [*code_ptr, code_ptr + size / 2, code_ptr + size - 1] {
            let header = cache.lookup_method_header(pc, None).unwrap();
            assert_eq!(header.code_ptr(), *code_ptr);
            assert_eq!(header.code_size as usize, *size);
        }
        let past_end = cache.lookup_method_header(code_ptr + size, None);
        assert_ne!(past_end.map(|h| h.code_ptr()), Some(*code_ptr));
        assert_eq!(method.entry_point(), code_ptr + 1);
    }

    assert!(cache.lookup_method_header(8, None).is_none());
}

#[test]
fn zombie_on_stack_survives_collection() {
    let stacks = Arc::new(FakeStacks::default());
    let cache = JitCodeCache::new(options(), stacks.clone()).unwrap();
    let method = ArtMethod::new("m", "V", 0, 1, BRIDGE);
    let code = commit_raw(&cache, &method, &[0; 32], &[]);
    cache.add_zombie_code(&method, code);

    stacks.return_pcs.lock().push(code + 12);
    cache.do_collection();
    assert!(cache.lookup_method_header(code + 12, None).is_some());
    assert_eq!(cache.number_of_zombie_code(), 1);

    stacks.return_pcs.lock().clear();
    cache.do_collection();
    assert!(cache.lookup_method_header(code + 12, None).is_none());
    assert_eq!(cache.number_of_zombie_code(), 0);
}

/// Retires a method's code while the collector is scanning the stacks.
#[derive(Default)]
struct RetireDuringScan {
    pending: Mutex<Option<(Weak<JitCodeCache>, MethodRef, usize)>>,
}

impl MutatorThreads for RetireDuringScan {
    fn visit_return_pcs(&self, _f: &mut dyn FnMut(usize)) {
        if let Some((cache, method, code)) = self.pending.lock().take() {
            if let Some(cache) = cache.upgrade() {
                cache.add_zombie_code(&method, code);
            }
        }
    }
}

#[test]
fn zombie_created_during_scan_waits_for_next_collection() {
    let threads = Arc::new(RetireDuringScan::default());
    let cache = Arc::new(JitCodeCache::new(options(), threads.clone()).unwrap());
    let method = ArtMethod::new("m", "V", 0, 1, BRIDGE);
    let code = commit_raw(&cache, &method, &[0; 32], &[]);

    *threads.pending.lock() = Some((Arc::downgrade(&cache), method.clone(), code));
    cache.do_collection();
    assert_eq!(method.entry_point(), BRIDGE);
    let header = cache.lookup_method_header(code + 16, Some(&method)).unwrap();
    assert_eq!(header.code_ptr(), code);
    assert_eq!(cache.number_of_zombie_code(), 1);

    cache.do_collection();
    assert!(cache.lookup_method_header(code + 16, Some(&method)).is_none());
    assert_eq!(cache.number_of_zombie_code(), 0);
}

#[test]
fn concurrent_commits_of_one_method_install_once() {
    let cache = Arc::new(JitCodeCache::new(options(), Arc::new(NoMutators)).unwrap());
    let method = ArtMethod::new("hot", "V", 0, 1, BRIDGE);

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let cache = cache.clone();
            let method = method.clone();
            thread::spawn(move || {
                let reservation = cache.reserve(&method, 16, 4, 0).unwrap();
                let code_ptr = reservation.code_ptr();
                let committed = cache.commit(
                    &method,
                    reservation,
                    &CodeToCommit::raw(&[0; 16], &[0; 4]),
                    CompilationKind::Optimized,
                    &[],
                );
                committed.then_some(code_ptr)
            })
        })
        .collect();

    let winners: Vec<usize> = handles.into_iter().filter_map(|h| h.join().unwrap()).collect();
    assert_eq!(winners.len(), 1);
    assert_eq!(method.entry_point(), winners[0] + 1);
    assert_eq!(cache.number_of_compiled_code(), 1);
}

#[test]
fn reserve_fails_when_full() {
    let options = JitOptions {
        initial_capacity: 16 * 1024,
        max_capacity: 16 * 1024,
        ..options()
    };
    let cache = JitCodeCache::new(options, Arc::new(NoMutators)).unwrap();
    let method = ArtMethod::new("big", "V", 0, 1, BRIDGE);
    assert!(cache.reserve(&method, 64 * 1024, 0, 0).is_none());

    let small = cache.reserve(&method, 64, 0, 0).unwrap();
    cache.free(small);
}

#[test]
fn reserve_grows_capacity() {
    let cache = JitCodeCache::new(options(), Arc::new(NoMutators)).unwrap();
    let initial = cache.current_capacity();
    let method = ArtMethod::new("m", "V", 0, 1, BRIDGE);
    let reservation = cache.reserve(&method, initial / 2, 0, 0).unwrap();
    assert!(cache.current_capacity() > initial);
    cache.free(reservation);
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

fn load_jit_class() -> Graph {
    let mut graph = Graph::new(MethodInfo::new("cls", true, vec![DataType::Reference]));
    let entry = graph.entry_block;
    let info = LoadClassInfo {
        type_index: 3,
        dex_file: 0,
        load_kind: LoadClassKind::JitTableAddress,
        must_resolve_type_on_slow_path: false,
        must_generate_clinit_check: false,
        needs_access_check: false,
        boot_image_offset: 0,
    };
    let cls = graph.add(entry, InstructionKind::LoadClass(info), DataType::Reference, &[]);
    graph.add(entry, InstructionKind::Return, DataType::Void, &[cls]);
    with_exit(graph)
}

fn with_exit(mut graph: Graph) -> Graph {
    let entry = graph.entry_block;
    let exit = graph.add_block();
    graph.add_edge(entry, exit);
    graph.add(exit, InstructionKind::Exit, DataType::Void, &[]);
    graph.set_exit_block(exit);
    graph
}

#[test]
fn compiled_method_round_trip() {
    let compiled = Compiler::new(CompilerOptions::default()).compile(add_ints()).unwrap();
    let cache = JitCodeCache::new(options(), Arc::new(NoMutators)).unwrap();
    let method = ArtMethod::new("add", "III", tern_jit::method::ACC_STATIC, 1, BRIDGE);

    let reservation = cache
        .reserve(&method, compiled.code.len(), compiled.stack_map.len(), 0)
        .unwrap();
    let code_ptr = reservation.code_ptr();
    assert!(cache.commit(
        &method,
        reservation,
        &CodeToCommit::from_compiled(&compiled, &[]),
        CompilationKind::Optimized,
        &[],
    ));

    let header = cache.lookup_method_header(code_ptr, Some(&method)).unwrap();
    assert_eq!(header.frame_info().frame_size, compiled.frame_size);
    assert_eq!(header.core_spill_mask, compiled.core_spill_mask);
    let info = header.code_info(compiled.stack_map.len()).unwrap();
    assert_eq!(info.frame.frame_size, compiled.frame_size);
    assert_eq!(info.frame.code_size as usize, compiled.code.len());
    let body = unsafe { std::slice::from_raw_parts(code_ptr as *const u8, compiled.code.len()) };
    assert_eq!(body, &compiled.code[..]);
}

#[test]
fn jit_root_literals_point_into_the_root_table() {
    let compiled = Compiler::new(CompilerOptions::default()).compile(load_jit_class()).unwrap();
    assert_eq!(compiled.unique_roots().len(), 1);
    let literal_offset = compiled.jit_roots[0].literal_offset as usize;

    let cache = JitCodeCache::new(options(), Arc::new(NoMutators)).unwrap();
    let method = ArtMethod::new("cls", "L", tern_jit::method::ACC_STATIC, 1, BRIDGE);
    let reservation = cache
        .reserve(&method, compiled.code.len(), compiled.stack_map.len(), 1)
        .unwrap();
    let code_ptr = reservation.code_ptr();
    let table = reservation.data() as usize;
    assert!(cache.commit(
        &method,
        reservation,
        &CodeToCommit::from_compiled(&compiled, &[0x1234_5678]),
        CompilationKind::Optimized,
        &[],
    ));

    unsafe {
        let literal = ((code_ptr + literal_offset) as *const u32).read_unaligned();
        assert_eq!(literal, table as u32);
        assert_eq!((table as *const u32).read_unaligned(), 0x1234_5678);
    }
}
