//! 分派桩生成配置

use serde::{Deserialize, Serialize};
use vm_core::config::{Config, ConfigError, Constraints};

/// Optional code compiled into every stub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Instrumentation {
    /// Bump a per-kind call counter on every stub entry.
    pub count_calls: bool,
    /// Vtable bounds check and null-entry-point check.
    pub debug_checks: bool,
}

impl Instrumentation {
    pub const NONE: Instrumentation = Instrumentation {
        count_calls: false,
        debug_checks: false,
    };

    pub const ALL: Instrumentation = Instrumentation {
        count_calls: true,
        debug_checks: true,
    };

    /// Every flag combination, for exhaustive checks.
    pub const COMBINATIONS: [Instrumentation; 4] = [
        Instrumentation::NONE,
        Instrumentation {
            count_calls: true,
            debug_checks: false,
        },
        Instrumentation {
            count_calls: false,
            debug_checks: true,
        },
        Instrumentation::ALL,
    ];
}

/// What the stub cache does when two threads miss on the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupPolicy {
    /// Generate under the table lock; exactly one stub per key.
    #[default]
    Strict,
    /// Generate outside the lock; a racing duplicate is discarded on insert.
    Relaxed,
}

/// Shared slow paths the stubs jump to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeHandlers {
    /// Target when the receiver does not implement the interface.
    pub incompatible_class_change: u64,
    /// Target of the debug bounds check, entered with the index in `ebx`.
    pub bad_vtable_index: u64,
}

impl Default for RuntimeHandlers {
    fn default() -> Self {
        Self {
            incompatible_class_change: incompatible_class_change_trap as *const () as usize as u64,
            bad_vtable_index: bad_vtable_index_trap as *const () as usize as u64,
        }
    }
}

extern "C" fn incompatible_class_change_trap() -> ! {
    tracing::error!(target: "dispatch::stubs", "IncompatibleClassChangeError raised without a runtime handler");
    std::process::abort()
}

extern "C" fn bad_vtable_index_trap() -> ! {
    tracing::error!(target: "dispatch::stubs", "vtable index out of bounds");
    std::process::abort()
}

/// 分派桩生成器配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StubGeneratorConfig {
    pub instrumentation: Instrumentation,
    pub dedup: DedupPolicy,
    /// Runtime addresses; never serialized.
    #[serde(skip)]
    pub handlers: RuntimeHandlers,
}

impl Default for StubGeneratorConfig {
    fn default() -> Self {
        Self::defaults()
    }
}

impl Config for StubGeneratorConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        let mut c = Constraints::new("StubGeneratorConfig");
        c.check(
            self.handlers.incompatible_class_change != 0,
            "handlers.incompatible_class_change must be a valid code address",
        )
        .check(
            self.handlers.bad_vtable_index != 0,
            "handlers.bad_vtable_index must be a valid code address",
        );
        c.finish()
    }

    fn defaults() -> Self {
        Self {
            instrumentation: Instrumentation::NONE,
            dedup: DedupPolicy::Strict,
            handlers: RuntimeHandlers::default(),
        }
    }
}
