//! 分层编译服务
//!
//! 持有单个虚拟机实例的编译代理与策略。由 [`TieredCompilation::initialize`]
//! 在任何应用线程运行前构建一次，并以引用交给解释器；
//! [`TieredCompilation::teardown`] 清空队列并回收编译线程。

use std::sync::Arc;

use vm_core::{CodeEventSink, Config, ConfigError, ExecutableCodeAllocator};

use crate::broker::{CompileBroker, CompileService, CompilerBackend};
use crate::clock::VmClock;
use crate::config::TieredConfig;
use crate::counter_model::CounterModel;
use crate::policy::TieredPolicy;
use crate::training::TrainingData;

pub struct TieredCompilation {
    broker: Arc<CompileBroker>,
    policy: TieredPolicy,
}

impl TieredCompilation {
    /// Validates `config` and wires the broker, its backends and the policy.
    /// Compiler threads are not started yet.
    pub fn initialize(
        config: TieredConfig,
        clock: Arc<dyn VmClock>,
        code_cache: Arc<ExecutableCodeAllocator>,
        events: Arc<CodeEventSink>,
        backends: Vec<Arc<dyn CompilerBackend>>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let model = CounterModel::new(Arc::new(config), clock);

        let mut broker = CompileBroker::new(model.clone(), code_cache, events);
        for backend in backends {
            if !model.config().mode.uses(backend.kind()) {
                tracing::warn!(
                    target: "tiered::broker",
                    kind = %backend.kind(),
                    name = backend.name(),
                    mode = ?model.config().mode,
                    "compiler not used in this mode"
                );
                continue;
            }
            broker = broker.with_backend(backend);
        }
        let broker = Arc::new(broker);
        let policy = TieredPolicy::new(model, Arc::clone(&broker) as Arc<dyn CompileService>);

        tracing::info!(
            target: "tiered::broker",
            mode = ?policy.config().mode,
            highest_level = %policy.highest_compile_level(),
            "tiered compilation initialized"
        );
        Ok(Self { broker, policy })
    }

    pub fn with_training_data(mut self, data: Arc<TrainingData>) -> Self {
        self.policy = self.policy.with_training_data(data);
        self
    }

    pub fn policy(&self) -> &TieredPolicy {
        &self.policy
    }

    pub fn broker(&self) -> &Arc<CompileBroker> {
        &self.broker
    }

    pub fn config(&self) -> &TieredConfig {
        self.policy.config()
    }

    /// Starts the compiler threads.
    pub fn start(&self) -> std::io::Result<usize> {
        self.broker.start()
    }

    pub fn teardown(&self) {
        self.broker.shutdown();
        tracing::info!(target: "tiered::broker", stats = ?self.broker.stats(), "tiered compilation stopped");
    }
}

impl std::fmt::Debug for TieredCompilation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TieredCompilation")
            .field("policy", &self.policy)
            .field("broker", &self.broker)
            .finish()
    }
}
