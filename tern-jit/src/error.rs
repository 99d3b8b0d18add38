use std::io;

use thiserror::Error;

pub type JitResult<T> = std::result::Result<T, JitError>;

/// Failures setting up JIT memory. Everything after setup reports through
/// `Option`/`bool` returns or aborts.
#[derive(Debug, Error)]
pub enum JitError {
    #[error("invalid code cache capacity: initial {initial} bytes, max {max} bytes")]
    InvalidCapacity { initial: usize, max: usize },

    #[error("could not create backing file: {0}")]
    BackingFile(#[source] io::Error),

    #[error("could not resize backing file to {size} bytes: {source}")]
    Resize {
        size: usize,
        #[source]
        source: io::Error,
    },

    #[error("mmap of {size} bytes failed: {source}")]
    Map {
        size: usize,
        #[source]
        source: io::Error,
    },
}
