//! 编译错误类型

use vm_core::CodeCacheError;

use crate::level::{CompLevel, CompilerKind};

/// Reasons a compile request was not enqueued.
///
/// None of these are fatal: the method keeps running at its current level
/// and the policy may ask again on a later event.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompileRejection {
    /// 编译已被禁用
    #[error("compilation is disabled")]
    CompilationDisabled,

    /// 已在队列中
    #[error("method is already queued for compilation")]
    AlreadyQueued,

    /// 目标代码已存在
    #[error("code at {0} already installed")]
    AlreadyCompiled(CompLevel),

    /// 方法不可编译
    #[error("method is not compilable at {0}")]
    NotCompilable(CompLevel),

    /// 抽象方法没有代码
    #[error("abstract methods cannot be compiled")]
    AbstractMethod,

    /// 没有可用的编译器线程
    #[error("no {0} compiler is available")]
    CompilerUnavailable(CompilerKind),

    /// 代码缓存已满
    #[error("code cache is full")]
    CodeCacheFull,

    /// 方法已卸载
    #[error("method was unloaded")]
    MethodUnloaded,
}

/// Failures reported by a compiler backend for one task.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    /// The compiler gave up on this method at this level.
    #[error("compilation bailed out: {0}")]
    Bailout(String),

    /// The compiler gave up on this OSR entry.
    #[error("OSR compilation bailed out: {0}")]
    OsrBailout(String),

    /// Installing the produced code failed.
    #[error(transparent)]
    CodeCache(#[from] CodeCacheError),
}

impl BackendError {
    /// Whether the failure is a property of the method rather than of
    /// the current state of the code cache.
    pub fn is_permanent(&self) -> bool {
        !matches!(self, BackendError::CodeCache(e) if e.is_exhaustion())
    }
}
