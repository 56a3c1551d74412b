//! 训练数据
//!
//! 来自上一次运行的记录：每个方法到达过的层级、是否保存了剖析数据，以及优化产物
//! 在类初始化依赖满足后能否复用。在任何应用线程运行前加载一次，此后只有依赖倒计数会变化。

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use serde::{Deserialize, Serialize};
use vm_core::ConfigError;

use crate::level::CompLevel;

/// Top-level compile recorded during training.
#[derive(Debug, Serialize, Deserialize)]
pub struct TrainedCompile {
    pub level: CompLevel,
    /// Class initializations that must happen before the stored code is valid.
    #[serde(default)]
    init_deps_left: AtomicU32,
}

impl TrainedCompile {
    pub fn new(level: CompLevel, init_deps_left: u32) -> Self {
        Self {
            level,
            init_deps_left: AtomicU32::new(init_deps_left),
        }
    }

    pub fn init_deps_left(&self) -> u32 {
        self.init_deps_left.load(Ordering::Acquire)
    }

    pub fn deps_satisfied(&self) -> bool {
        self.init_deps_left() == 0
    }

    /// One dependency became satisfied.
    pub fn dependency_initialized(&self) {
        let _ = self
            .init_deps_left
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }
}

/// Per-method training record.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MethodTrainingData {
    /// Levels the method was compiled at, top-level or inlined.
    pub levels_seen: Vec<CompLevel>,
    /// Highest level of a top-level compile of this method.
    pub highest_top_level: CompLevel,
    /// Only ever compiled as an inlinee.
    pub only_inlined: bool,
    /// A final profile was stored.
    pub has_profile: bool,
    pub invocation_count: u32,
    pub backedge_count: u32,
    /// Last top-level compile at full optimization, if any.
    pub full_optimization_compile: Option<TrainedCompile>,
}

impl MethodTrainingData {
    pub fn saw_level(&self, level: CompLevel) -> bool {
        self.levels_seen.contains(&level)
    }

    pub fn highest_level(&self) -> CompLevel {
        self.levels_seen
            .iter()
            .copied()
            .max()
            .unwrap_or(CompLevel::None)
    }

    pub fn last_toplevel_compile(&self, level: CompLevel) -> Option<&TrainedCompile> {
        self.full_optimization_compile
            .as_ref()
            .filter(|ctd| ctd.level == level)
    }
}

/// Training records keyed by method name.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct TrainingData {
    methods: HashMap<String, Arc<MethodTrainingData>>,
}

impl TrainingData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, method: impl Into<String>, data: MethodTrainingData) {
        self.methods.insert(method.into(), Arc::new(data));
    }

    pub fn find(&self, method: &str) -> Option<&Arc<MethodTrainingData>> {
        self.methods.get(method)
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let data: TrainingData = serde_json::from_str(json)
            .map_err(|e| ConfigError::Parse(format!("training data: {e}")))?;
        tracing::debug!(
            target: "tiered::training",
            methods = data.len(),
            "loaded training data"
        );
        Ok(data)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        serde_json::to_string_pretty(self)
            .map_err(|e| ConfigError::Serialize(format!("training data: {e}")))
    }
}
