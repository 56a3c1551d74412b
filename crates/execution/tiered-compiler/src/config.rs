//! 分层编译配置
//!
//! 策略读取的全部可调参数。默认值沿用成熟的生产取值；[`Config::validate`]
//! 检查声明的范围与字段间约束，并一次性报告所有违规项。

use serde::{Deserialize, Serialize};
use vm_core::config::{Config, ConfigError, Constraints};

use crate::level::{CompLevel, CompilationMode, CompilerKind};

/// 分层编译配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TieredConfig {
    pub mode: CompilationMode,
    /// Every target level is clamped to this.
    pub stop_at_level: CompLevel,
    /// The interpreter may collect a profile (method data) at level none.
    pub profile_interpreter: bool,
    /// Submitters do not wait for compiles.
    pub background_compilation: bool,
    /// Replay mode: organic compilation is disabled.
    pub replay_compiles: bool,
    /// Raise tiered events to `info`.
    pub print_tiered_events: bool,
    /// With training data, go straight to full optimization when possible.
    pub skip_tier2_if_possible: bool,
    pub dont_compile_huge_methods: bool,
    /// Bytecode size above which a method is huge.
    pub huge_method_limit: u32,

    // Notification frequencies, as log2 of the event interval.
    pub tier0_invoke_notify_freq_log: u32,
    pub tier0_backedge_notify_freq_log: u32,
    pub tier2_invoke_notify_freq_log: u32,
    pub tier2_backedge_notify_freq_log: u32,
    pub tier3_invoke_notify_freq_log: u32,
    pub tier3_backedge_notify_freq_log: u32,

    pub tier3_invocation_threshold: u32,
    pub tier3_min_invocation_threshold: u32,
    pub tier3_compile_threshold: u32,
    pub tier3_back_edge_threshold: u32,
    pub tier4_invocation_threshold: u32,
    pub tier4_min_invocation_threshold: u32,
    pub tier4_compile_threshold: u32,
    pub tier4_back_edge_threshold: u32,

    /// Queue entries per compiler thread that double the thresholds.
    pub tier3_load_feedback: u32,
    pub tier4_load_feedback: u32,
    /// Full profiling is avoided while the optimizing queue exceeds this many
    /// entries per optimizing thread...
    pub tier3_delay_on: u32,
    /// ...and resumed once it drops to this many.
    pub tier3_delay_off: u32,
    /// Interpreter profiling is delayed while the optimizing queue exceeds
    /// this many entries per optimizing thread.
    pub tier0_delay: u32,
    /// Threshold percentage at which the interpreter starts profiling.
    pub tier0_profiling_start_percentage: u32,
    /// Threshold percentage past which a method is old.
    pub tiered_old_percentage: u32,
    /// Threshold multiplier for standard transitions out of level none after
    /// training found nothing to apply.
    pub tier0_profile_delay_factor: f64,
    /// Same, out of limited_profile.
    pub tier2_profile_delay_factor: f64,

    /// Minimum sampling window in milliseconds.
    pub tiered_rate_update_min_time: u64,
    /// Idle window after which the rate is forced to zero.
    pub tiered_rate_update_max_time: u64,
    /// Idle time after which a queued task is stale.
    pub compile_task_timeout: u64,
    /// Code cache occupancy percentage past which profiling-compiler
    /// thresholds grow exponentially.
    pub increase_first_tier_compile_threshold_at: u32,

    pub profiling_compiler_count: usize,
    pub optimizing_compiler_count: usize,
}

impl Default for TieredConfig {
    fn default() -> Self {
        Self::defaults()
    }
}

/// Compiler thread split for `cpus` processors: `(profiling, optimizing)`.
pub fn default_compiler_counts(cpus: usize) -> (usize, usize) {
    let log_cpu = cpus.max(1).ilog2() as usize;
    let loglog_cpu = log_cpu.max(1).ilog2() as usize;
    let count = (log_cpu * loglog_cpu * 3 / 2).max(2);
    let profiling = (count / 3).max(1);
    let optimizing = (count - profiling).max(1);
    (profiling, optimizing)
}

impl TieredConfig {
    /// Threads serving `kind`; zero when the mode does not use it.
    pub fn compiler_count(&self, kind: CompilerKind) -> usize {
        if !self.mode.uses(kind) {
            return 0;
        }
        match kind {
            CompilerKind::Profiling => self.profiling_compiler_count,
            CompilerKind::Optimizing => self.optimizing_compiler_count,
        }
    }

    /// Highest level any transition may produce.
    pub fn highest_compile_level(&self) -> CompLevel {
        self.stop_at_level.min(self.mode.highest_level())
    }

    /// Reverse free ratio of the code cache past which profiling-compiler
    /// thresholds are inflated.
    pub fn increase_threshold_at_ratio(&self) -> f64 {
        100.0 / (100.0 - f64::from(self.increase_first_tier_compile_threshold_at))
    }

    pub fn is_interpreter_only(&self) -> bool {
        self.mode == CompilationMode::InterpreterOnly
    }
}

impl Config for TieredConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        const MAX_THRESHOLD: u32 = i32::MAX as u32;
        let mut c = Constraints::new("TieredConfig");

        for (name, value) in [
            ("tier0_invoke_notify_freq_log", self.tier0_invoke_notify_freq_log),
            ("tier0_backedge_notify_freq_log", self.tier0_backedge_notify_freq_log),
            ("tier2_invoke_notify_freq_log", self.tier2_invoke_notify_freq_log),
            ("tier2_backedge_notify_freq_log", self.tier2_backedge_notify_freq_log),
            ("tier3_invoke_notify_freq_log", self.tier3_invoke_notify_freq_log),
            ("tier3_backedge_notify_freq_log", self.tier3_backedge_notify_freq_log),
        ] {
            c.range(name, value, 0, 30);
        }

        for (name, value) in [
            ("tier3_invocation_threshold", self.tier3_invocation_threshold),
            ("tier3_compile_threshold", self.tier3_compile_threshold),
            ("tier3_back_edge_threshold", self.tier3_back_edge_threshold),
            ("tier4_invocation_threshold", self.tier4_invocation_threshold),
            ("tier4_compile_threshold", self.tier4_compile_threshold),
            ("tier4_back_edge_threshold", self.tier4_back_edge_threshold),
        ] {
            c.range(name, value, 0, MAX_THRESHOLD);
        }

        c.ordered(
            ("tier3_min_invocation_threshold", self.tier3_min_invocation_threshold),
            ("tier3_invocation_threshold", self.tier3_invocation_threshold),
        )
        .ordered(
            ("tier4_min_invocation_threshold", self.tier4_min_invocation_threshold),
            ("tier4_invocation_threshold", self.tier4_invocation_threshold),
        )
        .ordered(
            ("tier3_delay_off", self.tier3_delay_off),
            ("tier3_delay_on", self.tier3_delay_on),
        )
        .ordered(
            ("tiered_rate_update_min_time", self.tiered_rate_update_min_time),
            ("tiered_rate_update_max_time", self.tiered_rate_update_max_time),
        )
        .range(
            "increase_first_tier_compile_threshold_at",
            self.increase_first_tier_compile_threshold_at,
            0,
            99,
        )
        .range(
            "tier0_profiling_start_percentage",
            self.tier0_profiling_start_percentage,
            0,
            MAX_THRESHOLD,
        )
        .range(
            "tiered_old_percentage",
            self.tiered_old_percentage,
            0,
            1_000_000,
        )
        .range(
            "tier0_profile_delay_factor",
            self.tier0_profile_delay_factor,
            0.0,
            1000.0,
        )
        .range(
            "tier2_profile_delay_factor",
            self.tier2_profile_delay_factor,
            0.0,
            1000.0,
        )
        .at_least("tier3_load_feedback", self.tier3_load_feedback, 1)
        .at_least("tier4_load_feedback", self.tier4_load_feedback, 1);

        if self.mode.uses(CompilerKind::Profiling) {
            c.at_least("profiling_compiler_count", self.profiling_compiler_count, 1);
        }
        if self.mode.uses(CompilerKind::Optimizing) {
            c.at_least("optimizing_compiler_count", self.optimizing_compiler_count, 1);
        }
        c.check(
            self.stop_at_level == CompLevel::None || self.mode.is_valid_level(self.highest_compile_level()),
            format!(
                "stop_at_level = {} cannot be produced in {:?} mode",
                self.stop_at_level, self.mode
            ),
        );
        c.finish()
    }

    fn defaults() -> Self {
        let (profiling, optimizing) = default_compiler_counts(num_cpus::get());
        Self {
            mode: CompilationMode::Tiered,
            stop_at_level: CompLevel::FullOptimization,
            profile_interpreter: true,
            background_compilation: true,
            replay_compiles: false,
            print_tiered_events: false,
            skip_tier2_if_possible: false,
            dont_compile_huge_methods: true,
            huge_method_limit: 8000,

            tier0_invoke_notify_freq_log: 7,
            tier0_backedge_notify_freq_log: 10,
            tier2_invoke_notify_freq_log: 11,
            tier2_backedge_notify_freq_log: 14,
            tier3_invoke_notify_freq_log: 10,
            tier3_backedge_notify_freq_log: 13,

            tier3_invocation_threshold: 200,
            tier3_min_invocation_threshold: 100,
            tier3_compile_threshold: 2000,
            tier3_back_edge_threshold: 60000,
            tier4_invocation_threshold: 5000,
            tier4_min_invocation_threshold: 600,
            tier4_compile_threshold: 15000,
            tier4_back_edge_threshold: 40000,

            tier3_load_feedback: 5,
            tier4_load_feedback: 3,
            tier3_delay_on: 5,
            tier3_delay_off: 2,
            tier0_delay: 20,
            tier0_profiling_start_percentage: 200,
            tiered_old_percentage: 1000,
            tier0_profile_delay_factor: 100.0,
            tier2_profile_delay_factor: 250.0,

            tiered_rate_update_min_time: 1,
            tiered_rate_update_max_time: 25,
            compile_task_timeout: 50,
            increase_first_tier_compile_threshold_at: 50,

            profiling_compiler_count: profiling,
            optimizing_compiler_count: optimizing,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_valid() {
        let config = TieredConfig::defaults();
        assert!(config.validate().is_ok());
        assert_eq!(config.highest_compile_level(), CompLevel::FullOptimization);
        assert!((config.increase_threshold_at_ratio() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_compiler_counts() {
        assert_eq!(default_compiler_counts(1), (1, 1));
        assert_eq!(default_compiler_counts(8), (1, 3));
        // log2(64) = 6, log2(6) = 2 -> 18 threads
        assert_eq!(default_compiler_counts(64), (6, 12));
    }

    #[test]
    fn test_mode_hides_unused_compiler() {
        let config = TieredConfig {
            mode: CompilationMode::QuickOnly,
            optimizing_compiler_count: 0,
            ..TieredConfig::defaults()
        };
        assert!(config.validate().is_ok());
        assert_eq!(config.compiler_count(CompilerKind::Optimizing), 0);
        assert_eq!(config.highest_compile_level(), CompLevel::Simple);
    }

    #[test]
    fn test_every_violation_reported() {
        let config = TieredConfig {
            tier3_min_invocation_threshold: 300,
            tier3_delay_off: 9,
            tier0_invoke_notify_freq_log: 31,
            increase_first_tier_compile_threshold_at: 100,
            tiered_rate_update_min_time: 30,
            ..TieredConfig::defaults()
        };
        match config.validate() {
            Err(ConfigError::Validation(message)) => {
                for name in [
                    "tier3_min_invocation_threshold",
                    "tier3_delay_off",
                    "tier0_invoke_notify_freq_log",
                    "increase_first_tier_compile_threshold_at",
                    "tiered_rate_update_min_time",
                ] {
                    assert!(message.contains(name), "{name} missing from {message}");
                }
            }
            other => panic!("expected validation failure, got {other:?}"),
        }
    }

    #[test]
    fn test_partial_toml() {
        let config = TieredConfig::from_toml(
            "mode = \"high_only\"\ntier3_invocation_threshold = 400\n",
        )
        .unwrap();
        assert_eq!(config.mode, CompilationMode::HighOnly);
        assert_eq!(config.tier3_invocation_threshold, 400);
        assert_eq!(config.tier4_invocation_threshold, 5000);
    }
}
