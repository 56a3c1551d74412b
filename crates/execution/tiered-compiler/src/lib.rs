//! # tiered-compiler - 分层编译策略
//!
//! 决定方法何时、以何种优化层级编译，并调度后台编译线程。
//!
//! ## 主要组件
//!
//! - **计数器**: [`MethodCounters`] / [`MethodData`] 记录调用与回边次数
//! - **计数器模型**: [`CounterModel`] 计算事件速率、陈旧与"老"方法判定
//! - **转换策略**: [`TieredPolicy`] 在调用与回边检查点上选择目标层级
//! - **编译队列**: [`CompileQueueScheduler`] 按权重挑选任务并淘汰陈旧任务
//! - **编译代理**: [`CompileBroker`] 管理两条队列、编译线程与代码安装
//! - **训练数据**: [`TrainingData`] 允许基于上次运行结果的热启动
//!
//! ## 示例
//!
//! ```rust,ignore
//! let tiered = TieredCompilation::initialize(config, clock, code_cache, events, backends)?;
//! tiered.start()?;
//!
//! // interpreter checkpoints
//! tiered.policy().on_method_entry(&method);
//! if let Some(osr) = tiered.policy().on_back_edge(&method, bci) {
//!     migrate_frame(osr);
//! }
//!
//! tiered.teardown();
//! ```

pub mod broker;
pub mod clock;
pub mod config;
pub mod counter_model;
pub mod counters;
pub mod error;
mod event_log;
pub mod level;
pub mod method;
pub mod policy;
pub mod predicate;
pub mod queue;
pub mod runtime;
pub mod training;

pub use broker::{BrokerStats, CompileBroker, CompileService, CompilerBackend};
pub use clock::{ManualClock, SystemClock, VmClock};
pub use config::{TieredConfig, default_compiler_counts};
pub use counter_model::CounterModel;
pub use counters::{InvocationCounter, MethodCounters, MethodData};
pub use error::{BackendError, CompileRejection};
pub use event_log::TieredEvent;
pub use level::{CompLevel, CompilationMode, CompilerKind, INVOCATION_ENTRY_BCI};
pub use method::{CodeState, CompiledMethod, Method, MethodFlags, MethodId};
pub use policy::TieredPolicy;
pub use predicate::{EventKind, call_predicate, load_feedback_scale, loop_predicate};
pub use queue::{CompileQueue, CompileQueueScheduler, CompileReason, CompileTask, TaskOutcome};
pub use runtime::TieredCompilation;
pub use training::{MethodTrainingData, TrainedCompile, TrainingData};
