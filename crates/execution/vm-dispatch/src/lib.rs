//! # vm-dispatch - 虚方法/接口方法分派桩
//!
//! 为虚方法（vtable）与接口方法（itable）调用生成 x86-64 跳板，并按
//! (kind, slot index) 缓存。
//!
//! - [`DispatchStubCache`]: `find_or_create(kind, index)` 返回桩入口点，代码缓存耗尽时返回 `None`
//! - [`StubGenerator`]: 在由 [`size_model`] 计算的预留空间中生成单个桩
//! - [`emulator`]: 在模拟堆上运行生成的桩
//!
//! ```rust,ignore
//! let cache = DispatchStubCache::new(StubGeneratorConfig::default(), code_cache, events)?;
//! if let Some(entry) = cache.find_or_create(StubKind::Vtable, 5) {
//!     patch_call_site(entry);
//! }
//! ```

pub mod asm;
pub mod cache;
pub mod config;
pub mod emulator;
pub mod error;
pub mod generator;
pub mod layout;
pub mod size_model;
pub mod stub;

pub use cache::{DispatchStubCache, StubCacheStats, TABLE_SIZE, bucket_index};
pub use config::{DedupPolicy, Instrumentation, RuntimeHandlers, StubGeneratorConfig};
pub use emulator::{DispatchOutcome, SimHeap, StubEmulator};
pub use error::StubError;
pub use generator::{GeneratorStats, StubGenerator};
pub use stub::{DispatchStub, StubFault, StubKind};
