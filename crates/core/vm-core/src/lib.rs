//! # vm-core - 虚拟机核心基础设施
//!
//! 为编译策略和分派桩生成提供共享的基础设施。
//!
//! ## 主要组件
//!
//! - **代码缓存**: [`ExecutableCodeAllocator`] 以块为单位分配不可移动的可执行内存区域
//! - **事件通知**: [`CodeEventSink`] / [`EventCollector`] 在锁外投递代码生成与装载事件
//! - **配置**: [`config::Config`] trait 与 [`config::Constraints`] 统一校验所有可调参数
//!
//! ## 示例
//!
//! ```rust,ignore
//! use vm_core::{CodeCacheConfig, ExecutableCodeAllocator};
//!
//! let cache = ExecutableCodeAllocator::new(CodeCacheConfig::default())?;
//! let mut region = cache.allocate(64)?;
//! region.write(&[0xC3])?;
//! ```

pub mod code_cache;
pub mod config;
pub mod error;
pub mod events;

pub use code_cache::{
    CodeCacheConfig, CodeCacheOccupancy, CodeCacheStats, CodeRegion, ExecutableCodeAllocator,
};
pub use config::{Config, ConfigBuilder, ConfigError, Constraints};
pub use error::CodeCacheError;
pub use events::{
    CodeEvent, CodeEventListener, CodeEventSink, EventCollector, RecordingListener,
    SubscriptionId,
};
