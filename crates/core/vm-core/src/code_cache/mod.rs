//! 可执行代码缓存
//!
//! 为分派桩和已编译代码提供共享的可执行内存池。

mod allocator;
mod executable_memory;

pub use allocator::{
    CodeCacheConfig, CodeCacheOccupancy, CodeCacheStats, CodeRegion, ExecutableCodeAllocator,
};
pub use executable_memory::ExecutableMemory;
