//! The JIT code cache: owns the memory region and every map from methods to
//! their compiled code.
//!
//! Locks are always taken in the order `jit_lock`, `jit_mutator_lock`,
//! `cha_lock`. Lookups from mutators only take `jit_mutator_lock` shared.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::{Deref, DerefMut};
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use byteorder::{ByteOrder, LittleEndian};
use fixedbitset::FixedBitSet;
use parking_lot::{Condvar, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

use tern_compiler::CompiledMethod;

use crate::cha::ChaDependencies;
use crate::error::JitResult;
use crate::histogram::Histogram;
use crate::lock_order::{self, LockLevel, LockLevelGuard};
use crate::memory_region::{CODE_ALIGNMENT, JitMemoryRegion};
use crate::method::{ArtMethod, JniStubKey, MethodRef};
use crate::method_header::{
    HEADER_SIZE, HeaderRef, OatQuickMethodHeader, allocation_size, code_from_entry_point, entry_point_from_code,
};
use crate::options::JitOptions;
use crate::profiling_info::ProfilingInfo;

/// Access to the stacks of mutator threads.
pub trait MutatorThreads: Send + Sync {
    /// Suspends all mutators, calls `f` with every return address found on
    /// their stacks and resumes them.
    fn visit_return_pcs(&self, f: &mut dyn FnMut(usize));
}

/// No mutator is ever running compiled code.
pub struct NoMutators;

impl MutatorThreads for NoMutators {
    fn visit_return_pcs(&self, _f: &mut dyn FnMut(usize)) {}
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum CompilationKind {
    Baseline,
    Optimized,
    Osr,
}

impl CompilationKind {
    fn rank(self) -> u8 {
        match self {
            CompilationKind::Baseline => 0,
            CompilationKind::Optimized | CompilationKind::Osr => 1,
        }
    }
}

/// Code and data memory handed out by `reserve`, consumed by `commit` or
/// `free`.
pub struct Reservation {
    code_writable: *mut u8,
    code_executable: *const u8,
    code_capacity: usize,
    data: *mut u8,
    data_capacity: usize,
    num_roots: usize,
}

unsafe impl Send for Reservation {}

impl Reservation {
    /// Executable address the code body will start at.
    pub fn code_ptr(&self) -> usize {
        self.code_executable as usize + HEADER_SIZE
    }

    pub fn code_capacity(&self) -> usize {
        self.code_capacity - HEADER_SIZE
    }

    pub fn data(&self) -> *const u8 {
        self.data
    }

    pub fn data_capacity(&self) -> usize {
        self.data_capacity
    }

    pub fn num_roots(&self) -> usize {
        self.num_roots
    }
}

/// What `commit` copies into a reservation.
pub struct CodeToCommit<'a> {
    pub code: &'a [u8],
    pub stack_map: &'a [u8],
    pub frame_size: u32,
    pub core_spill_mask: u32,
    pub fp_spill_mask: u32,
    /// Values of the root table, in `CompiledMethod::unique_roots` order.
    pub roots: &'a [u32],
    /// Source of root literal patches.
    pub compiled: Option<&'a CompiledMethod>,
}

impl<'a> CodeToCommit<'a> {
    pub fn from_compiled(compiled: &'a CompiledMethod, roots: &'a [u32]) -> CodeToCommit<'a> {
        assert_eq!(compiled.unique_roots().len(), roots.len(), "one value per jit root");
        CodeToCommit {
            code: &compiled.code,
            stack_map: &compiled.stack_map,
            frame_size: compiled.frame_size,
            core_spill_mask: compiled.core_spill_mask,
            fp_spill_mask: compiled.fp_spill_mask,
            roots,
            compiled: Some(compiled),
        }
    }

    pub fn raw(code: &'a [u8], stack_map: &'a [u8]) -> CodeToCommit<'a> {
        CodeToCommit {
            code,
            stack_map,
            frame_size: 0,
            core_spill_mask: 0,
            fp_spill_mask: 0,
            roots: &[],
            compiled: None,
        }
    }
}

struct CodeEntry {
    method: MethodRef,
    kind: CompilationKind,
}

#[derive(Default)]
struct JniStubData {
    code: Option<usize>,
    methods: Vec<MethodRef>,
}

/// Maps read by mutators; guarded by `jit_mutator_lock`.
#[derive(Default)]
struct CodeMaps {
    method_code_map: BTreeMap<usize, CodeEntry>,
    method_code_map_reversed: HashMap<usize, Vec<usize>>,
    osr_code_map: HashMap<usize, usize>,
    jni_stubs: HashMap<JniStubKey, JniStubData>,
    zombie_code: BTreeMap<usize, MethodRef>,
    zombie_jni_code: HashSet<usize>,
}

impl CodeMaps {
    fn find_header<V>(map: &BTreeMap<usize, V>, pc: usize) -> Option<HeaderRef> {
        let (&code, _) = map.range(..=pc).next_back()?;
        let header = HeaderRef::for_code(code);
        if header.contains(pc) { Some(header) } else { None }
    }

    fn add(&mut self, code: usize, method: &MethodRef, kind: CompilationKind) {
        self.method_code_map.insert(
            code,
            CodeEntry {
                method: method.clone(),
                kind,
            },
        );
        self.method_code_map_reversed
            .entry(method.key())
            .or_default()
            .push(code);
    }

    /// Detaches `code` from its method and keeps it until a collection
    /// proves no stack references it.
    fn zombify(&mut self, code: usize) -> Option<MethodRef> {
        let entry = self.method_code_map.remove(&code)?;
        let key = entry.method.key();
        if let Some(codes) = self.method_code_map_reversed.get_mut(&key) {
            codes.retain(|&c| c != code);
            if codes.is_empty() {
                self.method_code_map_reversed.remove(&key);
            }
        }
        if self.osr_code_map.get(&key) == Some(&code) {
            self.osr_code_map.remove(&key);
        }
        self.zombie_code.insert(code, entry.method.clone());
        Some(entry.method)
    }

    /// Kind of the code `method` currently enters.
    fn current_kind(&self, method: &ArtMethod) -> Option<CompilationKind> {
        let code = code_from_entry_point(method.entry_point());
        self.method_code_map
            .get(&code)
            .filter(|entry| entry.method.key() == method.key())
            .map(|entry| entry.kind)
    }

    fn verify(&self) {
        for (&code, entry) in &self.method_code_map {
            assert!(
                self.method_code_map_reversed
                    .get(&entry.method.key())
                    .is_some_and(|codes| codes.contains(&code)),
                "code {:#x} of {:?} missing from reversed map",
                code,
                entry.method
            );
            assert!(!self.zombie_code.contains_key(&code), "code {:#x} is live and a zombie", code);
            assert_eq!(HeaderRef::for_code(code).code_ptr(), code);
        }
        for (key, codes) in &self.method_code_map_reversed {
            for code in codes {
                assert_eq!(
                    self.method_code_map.get(code).map(|entry| entry.method.key()),
                    Some(*key),
                    "reversed entry {:#x} has no forward entry",
                    code
                );
            }
        }
    }
}

/// State guarded by `jit_lock`.
struct JitState {
    region: JitMemoryRegion,
    saved_compiled_methods: HashMap<usize, (MethodRef, usize)>,
    profiling_infos: HashMap<usize, Arc<ProfilingInfo>>,
    /// Code pointer -> start of its data allocation.
    data_allocations: HashMap<usize, usize>,
    /// One bit per `CODE_ALIGNMENT` bytes of the code half.
    live_bitmap: FixedBitSet,
    collection_in_progress: bool,
    /// Zombies present when the running collection started. Only these are
    /// swept by it.
    processed_zombie_code: HashSet<usize>,
    processed_zombie_jni_code: HashSet<usize>,
    number_of_collections: usize,
    code_histogram: Histogram,
    stack_map_histogram: Histogram,
    profiling_info_histogram: Histogram,
}

impl JitState {
    fn allocate(&mut self, code_size: usize, data_size: usize, num_roots: usize) -> Option<Reservation> {
        let (code_writable, code_executable) = self.region.allocate_code(code_size)?;
        let Some(data) = self.region.allocate_data(data_size) else {
            self.region.free_code(code_executable);
            return None;
        };
        Some(Reservation {
            code_writable,
            code_executable,
            code_capacity: code_size,
            data,
            data_capacity: data_size,
            num_roots,
        })
    }

    fn free_reservation(&mut self, reservation: Reservation) {
        self.region.free_code(reservation.code_executable);
        self.region.free_data(reservation.data);
    }

    fn free_code(&mut self, code: usize) {
        self.region.free_code((code - HEADER_SIZE) as *const u8);
        if let Some(data) = self.data_allocations.remove(&code) {
            self.region.free_data(data as *mut u8);
        }
    }
}

/// A lock guard together with its entry on the lock-level stack.
struct Ordered<G> {
    guard: G,
    _level: LockLevelGuard,
}

impl<G: Deref> Deref for Ordered<G> {
    type Target = G::Target;

    fn deref(&self) -> &G::Target {
        &self.guard
    }
}

impl<G: DerefMut> DerefMut for Ordered<G> {
    fn deref_mut(&mut self) -> &mut G::Target {
        &mut self.guard
    }
}

pub struct JitCodeCache {
    options: JitOptions,
    threads: Arc<dyn MutatorThreads>,
    exec_begin: usize,
    exec_size: usize,

    jit_lock: Mutex<JitState>,
    jit_mutator_lock: RwLock<CodeMaps>,
    cha_lock: Mutex<ChaDependencies>,

    collection_cond: Condvar,
    inline_cache_cond: Condvar,
    is_weak_access_enabled: AtomicBool,
    garbage_collect_code: AtomicBool,
}

impl JitCodeCache {
    pub fn new(options: JitOptions, threads: Arc<dyn MutatorThreads>) -> JitResult<JitCodeCache> {
        let region = JitMemoryRegion::initialize(options.initial_capacity, options.max_capacity, options.rwx_allowed)?;
        let exec_begin = region.exec_begin();
        let exec_size = region.max_capacity() / 2;

        let state = JitState {
            region,
            saved_compiled_methods: HashMap::new(),
            profiling_infos: HashMap::new(),
            data_allocations: HashMap::new(),
            live_bitmap: FixedBitSet::with_capacity(exec_size / CODE_ALIGNMENT),
            collection_in_progress: false,
            processed_zombie_code: HashSet::new(),
            processed_zombie_jni_code: HashSet::new(),
            number_of_collections: 0,
            code_histogram: Histogram::new("code size"),
            stack_map_histogram: Histogram::new("stack map size"),
            profiling_info_histogram: Histogram::new("profiling info size"),
        };

        Ok(JitCodeCache {
            garbage_collect_code: AtomicBool::new(options.garbage_collect_code),
            options,
            threads,
            exec_begin,
            exec_size,
            jit_lock: Mutex::new(state),
            jit_mutator_lock: RwLock::new(CodeMaps::default()),
            cha_lock: Mutex::new(ChaDependencies::new()),
            collection_cond: Condvar::new(),
            inline_cache_cond: Condvar::new(),
            is_weak_access_enabled: AtomicBool::new(true),
        })
    }

    fn lock_jit(&self) -> Ordered<MutexGuard<'_, JitState>> {
        let level = lock_order::enter(LockLevel::JitLock);
        Ordered {
            guard: self.jit_lock.lock(),
            _level: level,
        }
    }

    fn read_maps(&self) -> Ordered<RwLockReadGuard<'_, CodeMaps>> {
        let level = lock_order::enter(LockLevel::JitMutatorLock);
        Ordered {
            guard: self.jit_mutator_lock.read(),
            _level: level,
        }
    }

    fn write_maps(&self) -> Ordered<RwLockWriteGuard<'_, CodeMaps>> {
        let level = lock_order::enter(LockLevel::JitMutatorLock);
        Ordered {
            guard: self.jit_mutator_lock.write(),
            _level: level,
        }
    }

    fn lock_cha(&self) -> Ordered<MutexGuard<'_, ChaDependencies>> {
        let level = lock_order::enter(LockLevel::ChaLock);
        Ordered {
            guard: self.cha_lock.lock(),
            _level: level,
        }
    }

    fn wait_for_collection(&self, state: &mut Ordered<MutexGuard<'_, JitState>>) -> bool {
        let mut waited = false;
        while state.collection_in_progress {
            self.collection_cond.wait(&mut state.guard);
            waited = true;
        }
        waited
    }

    pub fn options(&self) -> &JitOptions {
        &self.options
    }

    pub fn contains_pc(&self, pc: usize) -> bool {
        self.exec_begin <= pc && pc < self.exec_begin + self.exec_size
    }

    pub fn garbage_collect_code(&self) -> bool {
        self.garbage_collect_code.load(Ordering::Relaxed)
    }

    pub fn set_garbage_collect_code(&self, value: bool) {
        self.garbage_collect_code.store(value, Ordering::Relaxed);
    }

    /// Blocks while a collection runs. Returns whether it had to wait.
    pub fn wait_for_potential_collection_to_complete(&self) -> bool {
        let mut state = self.lock_jit();
        self.wait_for_collection(&mut state)
    }

    pub fn current_capacity(&self) -> usize {
        self.lock_jit().region.current_capacity()
    }

    /// Allocates code memory for the header and `code_size` bytes, and data
    /// memory for `num_roots` root slots followed by the stack map.
    pub fn reserve(
        &self,
        method: &MethodRef,
        code_size: usize,
        stack_map_size: usize,
        num_roots: usize,
    ) -> Option<Reservation> {
        debug_assert!(!lock_order::is_held(LockLevel::JitMutatorLock));
        let code_allocation = allocation_size(code_size);
        let data_size = (num_roots * 4 + stack_map_size).max(1);
        let mut collected = false;

        loop {
            {
                let mut state = self.lock_jit();
                self.wait_for_collection(&mut state);

                if let Some(reservation) = state.allocate(code_allocation, data_size, num_roots) {
                    return Some(reservation);
                }
                if state.region.increase_code_cache_capacity() {
                    if let Some(reservation) = state.allocate(code_allocation, data_size, num_roots) {
                        return Some(reservation);
                    }
                }
            }

            if collected || !self.garbage_collect_code() {
                warn!(
                    method = method.name(),
                    code_size,
                    stack_map_size,
                    "code cache full"
                );
                return None;
            }
            self.do_collection();
            collected = true;
        }
    }

    /// Returns an unused reservation.
    pub fn free(&self, reservation: Reservation) {
        self.lock_jit().free_reservation(reservation);
    }

    /// Writes the code and its metadata into `reservation` and installs it
    /// for `method`. Returns false, after freeing the reservation, when the
    /// code lost a race against newer code or relied on an invalidated
    /// single implementation.
    pub fn commit(
        &self,
        method: &MethodRef,
        reservation: Reservation,
        code: &CodeToCommit<'_>,
        kind: CompilationKind,
        cha_single_implementations: &[MethodRef],
    ) -> bool {
        assert!(code.code.len() <= reservation.code_capacity(), "code exceeds reservation");
        assert_eq!(code.roots.len(), reservation.num_roots, "root count differs from reservation");
        let roots_size = code.roots.len() * 4;
        assert!(roots_size + code.stack_map.len() <= reservation.data_capacity, "data exceeds reservation");

        let code_ptr = reservation.code_ptr();
        let stack_map = reservation.data as usize + roots_size;

        let mut state = self.lock_jit();
        unsafe {
            let header = OatQuickMethodHeader {
                stack_map,
                frame_size: code.frame_size,
                core_spill_mask: code.core_spill_mask,
                fp_spill_mask: code.fp_spill_mask,
                code_size: code.code.len() as u32,
            };
            ptr::write(reservation.code_writable as *mut OatQuickMethodHeader, header);

            let body = std::slice::from_raw_parts_mut(reservation.code_writable.add(HEADER_SIZE), code.code.len());
            body.copy_from_slice(code.code);
            if let Some(compiled) = code.compiled {
                compiled.emit_jit_root_patches(body, reservation.data as usize as u32);
            }

            let data = std::slice::from_raw_parts_mut(reservation.data, roots_size + code.stack_map.len());
            LittleEndian::write_u32_into(code.roots, &mut data[..roots_size]);
            data[roots_size..].copy_from_slice(code.stack_map);
        }

        state.region.commit_code(
            reservation.code_writable,
            reservation.code_executable,
            reservation.code_capacity,
        );

        let mut maps = self.write_maps();
        let lost = {
            let cha = self.lock_cha();
            if cha_single_implementations.iter().any(|m| cha.is_invalidated(m)) {
                Some("single implementation invalidated")
            } else if method.is_native() {
                maps.jni_stubs
                    .get(&method.jni_stub_key())
                    .and_then(|stub| stub.code)
                    .map(|_| "jni stub already installed")
            } else if kind != CompilationKind::Osr
                && maps.current_kind(method).is_some_and(|current| current.rank() >= kind.rank())
            {
                Some("newer code already installed")
            } else {
                None
            }
        };

        if let Some(reason) = lost {
            drop(maps);
            state.free_reservation(reservation);
            warn!(method = method.name(), ?kind, reason, "discarding compiled code");
            return false;
        }

        state
            .data_allocations
            .insert(code_ptr, reservation.data as usize);
        state.code_histogram.add_value(code.code.len());
        state.stack_map_histogram.add_value(code.stack_map.len());

        if method.is_native() {
            let stub = maps.jni_stubs.entry(method.jni_stub_key()).or_default();
            stub.code = Some(code_ptr);
            if !stub.methods.iter().any(|m| Arc::ptr_eq(m, method)) {
                stub.methods.push(method.clone());
            }
            for m in &stub.methods {
                m.set_entry_point(entry_point_from_code(code_ptr));
            }
        } else {
            maps.add(code_ptr, method, kind);
            match kind {
                CompilationKind::Osr => {
                    if let Some(old) = maps.osr_code_map.insert(method.key(), code_ptr) {
                        maps.zombify(old);
                    }
                }
                _ if method.needs_clinit_check_before_call() => {
                    if let Some((_, old)) = state
                        .saved_compiled_methods
                        .insert(method.key(), (method.clone(), code_ptr))
                    {
                        maps.zombify(old);
                    }
                }
                _ => {
                    let previous = code_from_entry_point(method.entry_point());
                    method.set_entry_point(entry_point_from_code(code_ptr));
                    if previous != code_ptr {
                        maps.zombify(previous);
                    }
                }
            }

            if !cha_single_implementations.is_empty() {
                let mut cha = self.lock_cha();
                for single in cha_single_implementations {
                    cha.add_dependency(single, method, code_ptr);
                }
            }
        }

        if cfg!(debug_assertions) {
            maps.verify();
        }

        debug!(
            method = method.name(),
            ?kind,
            code = code_ptr,
            code_size = code.code.len(),
            frame_size = code.frame_size,
            "committed"
        );
        true
    }

    /// Detaches `code` from `method`. The method falls back to the
    /// interpreter if it was still entering `code`.
    pub fn add_zombie_code(&self, method: &MethodRef, code: usize) {
        let _state = self.lock_jit();
        let mut maps = self.write_maps();

        if method.is_native() {
            let key = method.jni_stub_key();
            if maps.jni_stubs.get(&key).and_then(|stub| stub.code) == Some(code) {
                if let Some(stub) = maps.jni_stubs.remove(&key) {
                    for m in &stub.methods {
                        m.set_entry_point(self.options.interpreter_bridge);
                    }
                }
                maps.zombie_jni_code.insert(code);
            }
            return;
        }

        if code_from_entry_point(method.entry_point()) == code {
            method.set_entry_point(self.options.interpreter_bridge);
        }
        maps.zombify(code);
    }

    /// Header of the code containing `pc`, live or zombie.
    pub fn lookup_method_header(&self, pc: usize, method: Option<&ArtMethod>) -> Option<HeaderRef> {
        if !self.contains_pc(pc) {
            return None;
        }
        let maps = self.read_maps();

        if let Some(method) = method.filter(|m| m.is_native()) {
            if let Some(code) = maps.jni_stubs.get(&method.jni_stub_key()).and_then(|stub| stub.code) {
                let header = HeaderRef::for_code(code);
                if header.contains(pc) {
                    return Some(header);
                }
            }
        }

        if let Some(header) = CodeMaps::find_header(&maps.method_code_map, pc) {
            return Some(header);
        }
        if let Some(header) = CodeMaps::find_header(&maps.zombie_code, pc) {
            return Some(header);
        }
        maps.jni_stubs
            .values()
            .filter_map(|stub| stub.code)
            .chain(maps.zombie_jni_code.iter().copied())
            .map(HeaderRef::for_code)
            .find(|header| header.contains(pc))
    }

    pub fn lookup_osr_method_header(&self, method: &ArtMethod) -> Option<HeaderRef> {
        let maps = self.read_maps();
        maps.osr_code_map
            .get(&method.key())
            .map(|&code| HeaderRef::for_code(code))
    }

    /// Methods currently owning live compiled code.
    pub fn number_of_compiled_code(&self) -> usize {
        self.read_maps().method_code_map.len()
    }

    pub fn number_of_zombie_code(&self) -> usize {
        let maps = self.read_maps();
        maps.zombie_code.len() + maps.zombie_jni_code.len()
    }

    /// Sends every method back to the interpreter and turns all compiled
    /// code into zombies.
    pub fn invalidate_all_compiled_code(&self) {
        let mut state = self.lock_jit();
        let mut maps = self.write_maps();
        let bridge = self.options.interpreter_bridge;

        let codes: Vec<usize> = maps.method_code_map.keys().copied().collect();
        for &code in &codes {
            if let Some(method) = maps.zombify(code) {
                if code_from_entry_point(method.entry_point()) == code {
                    method.set_entry_point(bridge);
                }
            }
        }
        state.saved_compiled_methods.clear();

        let stubs: Vec<JniStubData> = maps.jni_stubs.drain().map(|(_, stub)| stub).collect();
        for stub in stubs {
            for m in &stub.methods {
                m.set_entry_point(bridge);
            }
            if let Some(code) = stub.code {
                maps.zombie_jni_code.insert(code);
            }
        }

        info!(invalidated = codes.len(), "invalidated all compiled code");
    }

    /// Frees every zombie that no thread stack references.
    pub fn do_collection(&self) {
        {
            let mut state = self.lock_jit();
            self.wait_for_collection(&mut state);
            if !self.garbage_collect_code() {
                return;
            }
            state.collection_in_progress = true;
            let maps = self.read_maps();
            state.processed_zombie_code = maps.zombie_code.keys().copied().collect();
            state.processed_zombie_jni_code = maps.zombie_jni_code.clone();
        }

        let mut return_pcs = Vec::new();
        self.threads.visit_return_pcs(&mut |pc| return_pcs.push(pc));

        let mut state = self.lock_jit();
        state.live_bitmap.clear();
        for &pc in &return_pcs {
            if let Some(header) = self.lookup_method_header(pc, None) {
                let bit = (header.code_ptr() - self.exec_begin) / CODE_ALIGNMENT;
                state.live_bitmap.insert(bit);
            }
        }

        let in_use: HashSet<usize> = state
            .profiling_infos
            .values()
            .filter(|info| info.is_in_use_by_compiler())
            .map(|info| info.method().key())
            .collect();

        let mut maps = self.write_maps();
        for (&code, method) in &maps.zombie_code {
            if in_use.contains(&method.key()) {
                state.live_bitmap.insert((code - self.exec_begin) / CODE_ALIGNMENT);
            }
        }

        let exec_begin = self.exec_begin;
        let is_marked = |bitmap: &FixedBitSet, code: usize| bitmap.contains((code - exec_begin) / CODE_ALIGNMENT);

        // Zombies created while the stacks were scanned wait for the next
        // collection.
        let processed = std::mem::take(&mut state.processed_zombie_code);
        let processed_jni = std::mem::take(&mut state.processed_zombie_jni_code);

        let mut dead = Vec::new();
        let mut dead_methods = Vec::new();
        maps.zombie_code.retain(|&code, method| {
            if !processed.contains(&code) || is_marked(&state.live_bitmap, code) {
                true
            } else {
                dead.push(code);
                dead_methods.push(method.clone());
                false
            }
        });
        maps.zombie_jni_code.retain(|&code| {
            if !processed_jni.contains(&code) || is_marked(&state.live_bitmap, code) {
                true
            } else {
                dead.push(code);
                false
            }
        });

        for &code in &dead {
            state.free_code(code);
        }

        for method in dead_methods {
            let key = method.key();
            let has_code = maps.method_code_map_reversed.contains_key(&key)
                || maps.zombie_code.values().any(|m| m.key() == key);
            let unused = state
                .profiling_infos
                .get(&key)
                .is_some_and(|info| !info.is_in_use_by_compiler());
            if !has_code && unused {
                state.profiling_infos.remove(&key);
            }
        }

        {
            let mut cha = self.lock_cha();
            for &code in &dead {
                cha.remove_dependents_for_code(code);
            }
        }
        drop(maps);

        state.number_of_collections += 1;
        state.collection_in_progress = false;
        info!(
            freed = dead.len(),
            stack_roots = return_pcs.len(),
            used_code = state.region.used_memory_for_code(),
            used_data = state.region.used_memory_for_data(),
            "code cache collection"
        );
        self.collection_cond.notify_all();
    }

    /// Attaches `method` to an installed stub with the same calling
    /// convention. Returns false if no such stub has been compiled yet; the
    /// method is then picked up when one is committed.
    pub fn add_jni_stub_method(&self, method: &MethodRef) -> bool {
        debug_assert!(method.is_native());
        let _state = self.lock_jit();
        let mut maps = self.write_maps();
        let stub = maps.jni_stubs.entry(method.jni_stub_key()).or_default();
        if !stub.methods.iter().any(|m| Arc::ptr_eq(m, method)) {
            stub.methods.push(method.clone());
        }
        match stub.code {
            Some(code) => {
                method.set_entry_point(entry_point_from_code(code));
                true
            }
            None => false,
        }
    }

    /// Drops every method matching `predicate`, e.g. those of an unloaded
    /// class loader.
    pub fn remove_methods_in(&self, predicate: &dyn Fn(&ArtMethod) -> bool) {
        let mut state = self.lock_jit();
        let mut maps = self.write_maps();

        let mut dead_stubs = Vec::new();
        for (key, stub) in maps.jni_stubs.iter_mut() {
            stub.methods.retain(|m| !predicate(m.as_ref()));
            if stub.methods.is_empty() {
                dead_stubs.push(key.clone());
            }
        }
        for key in dead_stubs {
            if let Some(code) = maps.jni_stubs.remove(&key).and_then(|stub| stub.code) {
                maps.zombie_jni_code.insert(code);
            }
        }

        let codes: Vec<usize> = maps
            .method_code_map
            .iter()
            .filter(|(_, entry)| predicate(entry.method.as_ref()))
            .map(|(&code, _)| code)
            .collect();
        for code in codes {
            maps.zombify(code);
        }

        state.saved_compiled_methods.retain(|_, (m, _)| !predicate(m.as_ref()));
        state.profiling_infos.retain(|_, info| !predicate(info.method().as_ref()));
    }

    /// Keeps `code` for `method` until its class is initialized.
    pub fn save_compiled_code(&self, method: &MethodRef, code: usize) {
        let mut state = self.lock_jit();
        if let Some((_, old)) = state
            .saved_compiled_methods
            .insert(method.key(), (method.clone(), code))
        {
            if old != code {
                self.write_maps().zombify(old);
            }
        }
    }

    pub fn saved_compiled_code(&self, method: &ArtMethod) -> Option<usize> {
        self.lock_jit()
            .saved_compiled_methods
            .get(&method.key())
            .map(|&(_, code)| code)
    }

    /// Installs the saved code of every method declared by `class`, which
    /// just finished initializing.
    pub fn notify_class_initialized(&self, class: u32) {
        let mut state = self.lock_jit();
        let ready: Vec<usize> = state
            .saved_compiled_methods
            .iter()
            .filter(|(_, (m, _))| m.declaring_class() == class && !m.needs_clinit_check_before_call())
            .map(|(&key, _)| key)
            .collect();

        for key in ready {
            if let Some((method, code)) = state.saved_compiled_methods.remove(&key) {
                method.set_entry_point(entry_point_from_code(code));
                debug!(method = method.name(), code, "installed saved code");
            }
        }
    }

    pub fn add_profiling_info(&self, method: &MethodRef, dex_pcs: &[u32]) -> Arc<ProfilingInfo> {
        let mut state = self.lock_jit();
        if let Some(info) = state.profiling_infos.get(&method.key()) {
            return info.clone();
        }
        let info = Arc::new(ProfilingInfo::new(method.clone(), dex_pcs));
        state.profiling_info_histogram.add_value(info.memory_size());
        state.profiling_infos.insert(method.key(), info.clone());
        info
    }

    pub fn get_profiling_info(&self, method: &ArtMethod) -> Option<Arc<ProfilingInfo>> {
        self.lock_jit().profiling_infos.get(&method.key()).cloned()
    }

    /// Records `class` at `dex_pc`. Blocks while the GC has weak access to
    /// inline caches disabled. Returns false for megamorphic or unknown
    /// sites.
    pub fn update_inline_cache(&self, info: &ProfilingInfo, dex_pc: u32, class: usize) -> bool {
        if !self.is_weak_access_enabled.load(Ordering::Acquire) {
            self.wait_until_inline_cache_accessible();
        }
        match info.inline_cache(dex_pc) {
            Some(cache) => cache.add_class(class),
            None => false,
        }
    }

    pub fn disallow_inline_cache_access(&self) {
        self.is_weak_access_enabled.store(false, Ordering::Release);
    }

    pub fn allow_inline_cache_access(&self) {
        let _state = self.lock_jit();
        self.is_weak_access_enabled.store(true, Ordering::Release);
        self.inline_cache_cond.notify_all();
    }

    pub fn wait_until_inline_cache_accessible(&self) {
        let mut state = self.lock_jit();
        while !self.is_weak_access_enabled.load(Ordering::Acquire) {
            self.inline_cache_cond.wait(&mut state.guard);
        }
    }

    /// Clears classes for which `is_live` is false from every inline cache.
    pub fn sweep_inline_caches(&self, is_live: &dyn Fn(usize) -> bool) -> usize {
        let state = self.lock_jit();
        state
            .profiling_infos
            .values()
            .flat_map(|info| info.inline_caches())
            .map(|cache| cache.sweep(is_live))
            .sum()
    }

    /// `method` got a second implementation. Code that devirtualized calls
    /// to it is detached. Returns the number of code blobs affected.
    pub fn invalidate_single_implementation(&self, method: &MethodRef) -> usize {
        let mut state = self.lock_jit();
        let mut maps = self.write_maps();
        let dependents = self.lock_cha().invalidate(method);

        let bridge = self.options.interpreter_bridge;
        let mut count = 0;
        for (dependent, code) in dependents {
            if code_from_entry_point(dependent.entry_point()) == code {
                dependent.set_entry_point(bridge);
            }
            if state
                .saved_compiled_methods
                .get(&dependent.key())
                .is_some_and(|&(_, saved)| saved == code)
            {
                state.saved_compiled_methods.remove(&dependent.key());
            }
            if maps.zombify(code).is_some() {
                count += 1;
            }
        }

        if count > 0 {
            info!(method = method.name(), count, "invalidated single implementation");
        }
        count
    }

    pub fn dump(&self) {
        let state = self.lock_jit();
        let maps = self.read_maps();
        info!(
            current_capacity = state.region.current_capacity(),
            max_capacity = state.region.max_capacity(),
            used_code = state.region.used_memory_for_code(),
            used_data = state.region.used_memory_for_data(),
            compiled = maps.method_code_map.len(),
            osr = maps.osr_code_map.len(),
            jni_stubs = maps.jni_stubs.len(),
            zombies = maps.zombie_code.len() + maps.zombie_jni_code.len(),
            profiling_infos = state.profiling_infos.len(),
            collections = state.number_of_collections,
            "jit code cache"
        );
        state.code_histogram.dump();
        state.stack_map_histogram.dump();
        state.profiling_info_histogram.dump();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::method::{ACC_NATIVE, ACC_STATIC};

    const BRIDGE: usize = 0xb00;

    fn cache() -> JitCodeCache {
        let options = JitOptions {
            initial_capacity: 64 * 1024,
            max_capacity: 256 * 1024,
            interpreter_bridge: BRIDGE,
            ..JitOptions::default()
        };
        JitCodeCache::new(options, Arc::new(NoMutators)).unwrap()
    }

    fn install(cache: &JitCodeCache, method: &MethodRef, kind: CompilationKind) -> Option<usize> {
        let code = [0xaau8; 24];
        let reservation = cache.reserve(method, code.len(), 8, 0)?;
        let code_ptr = reservation.code_ptr();
        if cache.commit(method, reservation, &CodeToCommit::raw(&code, &[1; 8]), kind, &[]) {
            Some(code_ptr)
        } else {
            None
        }
    }

    #[test]
    fn test_header_written_before_code() {
        let cache = cache();
        let method = ArtMethod::new("m", "V", 0, 1, BRIDGE);
        let code = [0x70u8, 0x47, 0x00, 0xbf];
        let reservation = cache.reserve(&method, code.len(), 3, 1).unwrap();
        let data = reservation.data() as usize;
        let code_ptr = reservation.code_ptr();
        let to_commit = CodeToCommit {
            frame_size: 16,
            core_spill_mask: 1 << 14,
            roots: &[0xdead_beef],
            ..CodeToCommit::raw(&code, &[7, 8, 9])
        };
        assert!(cache.commit(&method, reservation, &to_commit, CompilationKind::Optimized, &[]));

        let header = HeaderRef::for_code(code_ptr);
        assert_eq!(header.code_size, 4);
        assert_eq!(header.frame_size, 16);
        assert_eq!(header.stack_map, data + 4);
        assert_eq!(method.entry_point(), code_ptr + 1);
        unsafe {
            assert_eq!(std::slice::from_raw_parts(code_ptr as *const u8, 4), &code);
            assert_eq!(std::slice::from_raw_parts(data as *const u8, 7), &[0xef, 0xbe, 0xad, 0xde, 7, 8, 9]);
        }
    }

    #[test]
    fn test_baseline_never_replaces_optimized() {
        let cache = cache();
        let method = ArtMethod::new("m", "V", 0, 1, BRIDGE);
        let optimized = install(&cache, &method, CompilationKind::Optimized).unwrap();
        assert!(install(&cache, &method, CompilationKind::Baseline).is_none());
        assert_eq!(method.entry_point(), optimized + 1);
        assert_eq!(cache.number_of_compiled_code(), 1);
    }

    #[test]
    fn test_optimized_replaces_baseline() {
        let cache = cache();
        let method = ArtMethod::new("m", "V", 0, 1, BRIDGE);
        let baseline = install(&cache, &method, CompilationKind::Baseline).unwrap();
        let optimized = install(&cache, &method, CompilationKind::Optimized).unwrap();
        assert_eq!(method.entry_point(), optimized + 1);
        assert_eq!(cache.number_of_zombie_code(), 1);
        assert!(cache.lookup_method_header(baseline + 4, Some(&method)).is_some());
    }

    #[test]
    fn test_osr_code_is_separate() {
        let cache = cache();
        let method = ArtMethod::new("m", "V", 0, 1, BRIDGE);
        let osr = install(&cache, &method, CompilationKind::Osr).unwrap();
        assert_eq!(method.entry_point(), BRIDGE);
        assert_eq!(cache.lookup_osr_method_header(&method).unwrap().code_ptr(), osr);

        let second = install(&cache, &method, CompilationKind::Osr).unwrap();
        assert_eq!(cache.lookup_osr_method_header(&method).unwrap().code_ptr(), second);
        assert_eq!(cache.number_of_zombie_code(), 1);
    }

    #[test]
    fn test_saved_code_installed_on_class_initialization() {
        let cache = cache();
        let method = ArtMethod::new("clinit", "V", ACC_STATIC, 5, BRIDGE);
        method.set_class_initialized(false);
        let code = install(&cache, &method, CompilationKind::Optimized).unwrap();
        assert_eq!(method.entry_point(), BRIDGE);
        assert_eq!(cache.saved_compiled_code(&method), Some(code));

        cache.notify_class_initialized(5);
        assert_eq!(method.entry_point(), BRIDGE);

        method.set_class_initialized(true);
        cache.notify_class_initialized(5);
        assert_eq!(method.entry_point(), code + 1);
        assert_eq!(cache.saved_compiled_code(&method), None);
    }

    #[test]
    fn test_jni_stub_shared_by_signature() {
        let cache = cache();
        let first = ArtMethod::new("a", "IJ", ACC_NATIVE, 1, BRIDGE);
        let second = ArtMethod::new("b", "IJ", ACC_NATIVE, 2, BRIDGE);
        let other = ArtMethod::new("c", "V", ACC_NATIVE, 2, BRIDGE);

        assert!(!cache.add_jni_stub_method(&second));
        let code = install(&cache, &first, CompilationKind::Optimized).unwrap();
        assert_eq!(first.entry_point(), code + 1);
        assert_eq!(second.entry_point(), code + 1);
        assert!(!cache.add_jni_stub_method(&other));
        assert!(cache.lookup_method_header(code + 2, Some(&second)).is_some());

        // A second stub for the same signature loses.
        assert!(install(&cache, &second, CompilationKind::Optimized).is_none());

        cache.remove_methods_in(&|m| m.declaring_class() == 1);
        assert_eq!(second.entry_point(), code + 1);
        cache.remove_methods_in(&|m| m.declaring_class() == 2);
        assert_eq!(cache.number_of_zombie_code(), 1);
        cache.do_collection();
        assert!(cache.lookup_method_header(code + 2, None).is_none());
    }

    #[test]
    fn test_cha_invalidation() {
        let cache = cache();
        let target = ArtMethod::new("target", "V", 0, 1, BRIDGE);
        let caller = ArtMethod::new("caller", "V", 0, 2, BRIDGE);

        let code = [0u8; 8];
        let reservation = cache.reserve(&caller, code.len(), 0, 0).unwrap();
        let code_ptr = reservation.code_ptr();
        assert!(cache.commit(
            &caller,
            reservation,
            &CodeToCommit::raw(&code, &[]),
            CompilationKind::Optimized,
            std::slice::from_ref(&target),
        ));
        assert_eq!(caller.entry_point(), code_ptr + 1);

        assert_eq!(cache.invalidate_single_implementation(&target), 1);
        assert_eq!(caller.entry_point(), BRIDGE);

        // Later code relying on the same assumption is refused.
        let reservation = cache.reserve(&caller, code.len(), 0, 0).unwrap();
        assert!(!cache.commit(
            &caller,
            reservation,
            &CodeToCommit::raw(&code, &[]),
            CompilationKind::Optimized,
            std::slice::from_ref(&target),
        ));
    }

    #[test]
    fn test_invalidate_all() {
        let cache = cache();
        let methods: Vec<_> = (0..3).map(|i| ArtMethod::new("m", "V", 0, i, BRIDGE)).collect();
        for method in &methods {
            install(&cache, method, CompilationKind::Optimized).unwrap();
        }
        cache.invalidate_all_compiled_code();
        assert!(methods.iter().all(|m| m.entry_point() == BRIDGE));
        assert_eq!(cache.number_of_compiled_code(), 0);
        assert_eq!(cache.number_of_zombie_code(), 3);
    }

    #[test]
    fn test_profiling_info_keeps_zombie_alive() {
        let cache = cache();
        let method = ArtMethod::new("m", "V", 0, 1, BRIDGE);
        let info = cache.add_profiling_info(&method, &[0, 4]);
        let code = install(&cache, &method, CompilationKind::Baseline).unwrap();
        cache.add_zombie_code(&method, code);

        info.increment_inline_use();
        cache.do_collection();
        assert!(cache.lookup_method_header(code, None).is_some());

        info.decrement_inline_use();
        cache.do_collection();
        assert!(cache.lookup_method_header(code, None).is_none());
        assert!(cache.get_profiling_info(&method).is_none());
    }

    #[test]
    fn test_inline_cache_sweep() {
        let cache = cache();
        let method = ArtMethod::new("m", "V", 0, 1, BRIDGE);
        let info = cache.add_profiling_info(&method, &[3]);
        assert!(cache.update_inline_cache(&info, 3, 0x100));
        assert!(cache.update_inline_cache(&info, 3, 0x200));
        assert!(!cache.update_inline_cache(&info, 4, 0x200));

        cache.disallow_inline_cache_access();
        assert_eq!(cache.sweep_inline_caches(&|class| class == 0x200), 1);
        cache.allow_inline_cache_access();
        assert_eq!(info.inline_cache(3).unwrap().classes(), vec![0x200]);
    }

    #[test]
    fn test_collection_disabled() {
        let cache = cache();
        cache.set_garbage_collect_code(false);
        let method = ArtMethod::new("m", "V", 0, 1, BRIDGE);
        let code = install(&cache, &method, CompilationKind::Optimized).unwrap();
        cache.add_zombie_code(&method, code);
        cache.do_collection();
        assert!(cache.lookup_method_header(code, None).is_some());
        assert!(!cache.wait_for_potential_collection_to_complete());
        cache.dump();
    }
}
