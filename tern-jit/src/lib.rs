pub mod cha;
pub mod code_cache;
pub mod error;
pub mod histogram;
pub mod lock_order;
pub mod memory_region;
pub mod method;
pub mod method_header;
pub mod mspace;
pub mod options;
pub mod os;
pub mod profiling_info;
pub mod zygote_map;

pub use crate::code_cache::{CodeToCommit, CompilationKind, JitCodeCache, MutatorThreads, NoMutators, Reservation};
pub use crate::error::{JitError, JitResult};
pub use crate::memory_region::JitMemoryRegion;
pub use crate::method::{ArtMethod, MethodRef};
pub use crate::method_header::{HeaderRef, OatQuickMethodHeader};
pub use crate::options::JitOptions;
pub use crate::zygote_map::{ZygoteCompilationState, ZygoteMap, ZygoteMapView};
