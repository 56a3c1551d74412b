//! 代码缓存错误类型

/// Failures reported by the executable code allocator.
///
/// All of these are recoverable: the caller degrades (slow dispatch,
/// deferred compilation) instead of aborting.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodeCacheError {
    /// 代码缓存已满
    #[error("code cache exhausted: requested {requested} bytes, {available} of {capacity} left")]
    Exhausted {
        requested: usize,
        available: usize,
        capacity: usize,
    },

    /// 操作系统拒绝映射可执行内存
    #[error("failed to map {size} bytes of executable memory")]
    MapFailed { size: usize },

    /// 写入超出分配区域
    #[error("write of {len} bytes overflows a region of {capacity} bytes")]
    RegionOverflow { len: usize, capacity: usize },

    /// 无效的缓存配置
    #[error("invalid code cache configuration: {0}")]
    InvalidConfig(String),
}

impl CodeCacheError {
    /// Exhaustion and mapping failures both mean "no memory right now".
    pub fn is_exhaustion(&self) -> bool {
        matches!(self, Self::Exhausted { .. } | Self::MapFailed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_and_classification() {
        let err = CodeCacheError::Exhausted {
            requested: 64,
            available: 8,
            capacity: 4096,
        };
        assert_eq!(
            err.to_string(),
            "code cache exhausted: requested 64 bytes, 8 of 4096 left"
        );
        assert!(err.is_exhaustion());
        assert!(!CodeCacheError::RegionOverflow { len: 9, capacity: 8 }.is_exhaustion());
    }
}
