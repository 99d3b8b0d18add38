use crate::os::K;

#[derive(Clone, Debug)]
pub struct JitOptions {
    /// Bytes of code plus data available before the first growth.
    pub initial_capacity: usize,
    pub max_capacity: usize,
    /// Fall back to a single RWX mapping when dual mapping is impossible.
    pub rwx_allowed: bool,
    /// When false, `do_collection` returns without freeing anything.
    pub garbage_collect_code: bool,
    pub zygote_map_capacity: usize,
    /// Entrypoint restored on methods whose JIT code is discarded.
    pub interpreter_bridge: usize,
}

impl Default for JitOptions {
    fn default() -> JitOptions {
        JitOptions {
            initial_capacity: 64 * K,
            max_capacity: 64 * K * K,
            rwx_allowed: true,
            garbage_collect_code: true,
            zygote_map_capacity: 1024,
            interpreter_bridge: 0,
        }
    }
}
