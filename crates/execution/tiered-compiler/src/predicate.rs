//! 阈值谓词
//!
//! 调用谓词与循环谓词判断计数是否足以离开 `level`。两者都是纯函数，
//! 包括缩放因子在内的所有输入均由参数传入。

use std::fmt;

use crate::config::TieredConfig;
use crate::level::CompLevel;

/// Which counter triggered an evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Method invocation.
    Call,
    /// Loop back-edge.
    Loop,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::Call => f.write_str("call"),
            EventKind::Loop => f.write_str("loop"),
        }
    }
}

impl EventKind {
    /// Whether `(i, b)` crosses the thresholds for leaving `level`, with
    /// every threshold multiplied by `scale` and the method's own scaling.
    pub fn should_transition(
        self,
        config: &TieredConfig,
        level: CompLevel,
        i: u32,
        b: u32,
        scale: f64,
        method_scaling: Option<f64>,
    ) -> bool {
        let scale = scale * method_scaling.unwrap_or(1.0);
        // Without intermediate levels the interpreter profiles, so leaving
        // level none uses the full-profile thresholds.
        let level = if level == CompLevel::None && config.mode.disable_intermediate() {
            CompLevel::FullProfile
        } else {
            level
        };
        match self {
            EventKind::Call => call_predicate(config, level, i, b, scale),
            EventKind::Loop => loop_predicate(config, level, b, scale),
        }
    }
}

/// Invocation thresholds: `i >= inv * s || (i >= min_inv * s && i + b >= compile * s)`.
pub fn call_predicate(config: &TieredConfig, level: CompLevel, i: u32, b: u32, scale: f64) -> bool {
    let (invocation, min_invocation, compile) = match level {
        CompLevel::None | CompLevel::LimitedProfile => (
            config.tier3_invocation_threshold,
            config.tier3_min_invocation_threshold,
            config.tier3_compile_threshold,
        ),
        CompLevel::FullProfile => (
            config.tier4_invocation_threshold,
            config.tier4_min_invocation_threshold,
            config.tier4_compile_threshold,
        ),
        CompLevel::Simple | CompLevel::FullOptimization => return true,
    };
    let (i, b) = (f64::from(i), f64::from(b));
    i >= f64::from(invocation) * scale
        || (i >= f64::from(min_invocation) * scale && i + b >= f64::from(compile) * scale)
}

/// Back-edge threshold: `b >= back_edge * s`.
pub fn loop_predicate(config: &TieredConfig, level: CompLevel, b: u32, scale: f64) -> bool {
    let threshold = match level {
        CompLevel::None | CompLevel::LimitedProfile => config.tier3_back_edge_threshold,
        CompLevel::FullProfile => config.tier4_back_edge_threshold,
        CompLevel::Simple | CompLevel::FullOptimization => return true,
    };
    f64::from(b) >= f64::from(threshold) * scale
}

/// Load feedback factor `k = queue_size / (feedback_k * compiler_count) + 1`.
///
/// With a compiler count of zero the factor is 1. Past
/// `inflate_past_ratio`, `k` additionally grows by
/// `exp(reverse_free_ratio - inflate_past_ratio)`.
pub fn load_feedback_scale(
    queue_size: usize,
    compiler_count: usize,
    feedback_k: u32,
    code_cache_pressure: Option<(f64, f64)>,
) -> f64 {
    if compiler_count == 0 || feedback_k == 0 {
        return 1.0;
    }
    let mut k = queue_size as f64 / (f64::from(feedback_k) * compiler_count as f64) + 1.0;
    if let Some((reverse_free_ratio, inflate_past_ratio)) = code_cache_pressure {
        if reverse_free_ratio > inflate_past_ratio {
            k *= (reverse_free_ratio - inflate_past_ratio).exp();
        }
    }
    k
}

#[cfg(test)]
mod tests {
    use super::*;
    use vm_core::Config;

    #[test]
    fn test_call_predicate_absolute_threshold() {
        let c = TieredConfig::defaults();
        assert!(!call_predicate(&c, CompLevel::None, 199, 0, 1.0));
        assert!(call_predicate(&c, CompLevel::None, 200, 0, 1.0));
        assert!(!call_predicate(&c, CompLevel::FullProfile, 4999, 0, 1.0));
        assert!(call_predicate(&c, CompLevel::FullProfile, 5000, 0, 1.0));
    }

    #[test]
    fn test_call_predicate_combined_threshold() {
        let c = TieredConfig::defaults();
        // min invocation 100, compile threshold 2000
        assert!(!call_predicate(&c, CompLevel::None, 99, 5000, 1.0));
        assert!(call_predicate(&c, CompLevel::None, 100, 1900, 1.0));
        assert!(!call_predicate(&c, CompLevel::None, 100, 1899, 1.0));
    }

    #[test]
    fn test_loop_predicate() {
        let c = TieredConfig::defaults();
        assert!(!loop_predicate(&c, CompLevel::LimitedProfile, 59_999, 1.0));
        assert!(loop_predicate(&c, CompLevel::LimitedProfile, 60_000, 1.0));
        assert!(loop_predicate(&c, CompLevel::FullProfile, 40_000, 1.0));
        assert!(loop_predicate(&c, CompLevel::Simple, 0, 1.0));
    }

    #[test]
    fn test_method_scaling_multiplies() {
        let c = TieredConfig::defaults();
        assert!(!EventKind::Call.should_transition(&c, CompLevel::None, 300, 0, 1.0, Some(2.0)));
        assert!(EventKind::Call.should_transition(&c, CompLevel::None, 400, 0, 1.0, Some(2.0)));
        assert!(EventKind::Loop.should_transition(&c, CompLevel::None, 0, 30_000, 0.5, None));
    }

    #[test]
    fn test_load_feedback_scale() {
        assert_eq!(load_feedback_scale(0, 2, 5, None), 1.0);
        assert_eq!(load_feedback_scale(10, 2, 5, None), 2.0);
        assert_eq!(load_feedback_scale(100, 0, 5, None), 1.0);
        let inflated = load_feedback_scale(0, 1, 5, Some((3.0, 2.0)));
        assert!((inflated - 1f64.exp()).abs() < 1e-9);
        assert_eq!(load_feedback_scale(0, 1, 5, Some((1.5, 2.0))), 1.0);
    }
}
