/// Features of the target core that change instruction selection.
#[derive(Clone, Debug)]
pub struct InstructionSetFeatures {
    /// SDIV/UDIV are available.
    pub has_div: bool,
    /// LDRD/STRD are single-copy atomic.
    pub has_atomic_ldrd: bool,
    /// Large physical address extension; implies atomic LDRD/STRD.
    pub has_lpae: bool,
}

impl InstructionSetFeatures {
    /// Whether volatile 64-bit accesses may use plain LDRD/STRD.
    pub fn atomic_ldrd_strd(&self) -> bool {
        self.has_atomic_ldrd || self.has_lpae
    }
}

impl Default for InstructionSetFeatures {
    fn default() -> InstructionSetFeatures {
        InstructionSetFeatures {
            has_div: true,
            has_atomic_ldrd: true,
            has_lpae: true,
        }
    }
}

#[derive(Clone, Debug)]
pub struct CompilerOptions {
    pub features: InstructionSetFeatures,
    pub is_jit: bool,
    pub compile_pic: bool,
    pub baseline: bool,
    pub debuggable: bool,
    pub emit_read_barrier: bool,
    /// Read barriers use the inline marking check and per-register thunks;
    /// otherwise every reference load calls the generic slow path.
    pub use_baker_read_barrier: bool,
    pub implicit_null_checks: bool,
    pub implicit_suspend_checks: bool,
    pub implicit_stack_overflow_checks: bool,
    pub heap_poisoning: bool,
    pub emit_asm: bool,
    pub emit_debug: bool,
    pub dump_cfg: bool,
    pub check_graph: bool,
    /// Comma separated list of `name` or `name$suffix` entries overriding the
    /// default pass list.
    pub pass_list: Option<String>,
}

impl Default for CompilerOptions {
    fn default() -> CompilerOptions {
        CompilerOptions {
            features: InstructionSetFeatures::default(),
            is_jit: true,
            compile_pic: true,
            baseline: false,
            debuggable: false,
            emit_read_barrier: true,
            use_baker_read_barrier: true,
            implicit_null_checks: true,
            implicit_suspend_checks: false,
            implicit_stack_overflow_checks: true,
            heap_poisoning: false,
            emit_asm: false,
            emit_debug: false,
            dump_cfg: false,
            check_graph: cfg!(debug_assertions),
            pass_list: None,
        }
    }
}

impl CompilerOptions {
    pub fn aot() -> CompilerOptions {
        CompilerOptions {
            is_jit: false,
            ..CompilerOptions::default()
        }
    }
}
