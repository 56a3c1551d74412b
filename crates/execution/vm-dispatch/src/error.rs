//! 分派桩错误类型

use vm_core::CodeCacheError;

use crate::stub::StubKind;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StubError {
    /// No executable memory for the stub. Callers fall back to slow dispatch.
    #[error("no code cache space for dispatch stub: {0}")]
    CodeCacheFull(#[from] CodeCacheError),

    /// The slot displacement does not fit the stub's addressing mode.
    #[error("{kind} index {index} exceeds the maximum slot index {max}")]
    IndexOutOfRange { kind: StubKind, index: u32, max: u32 },
}
