//! 计数器模型
//!
//! 基于原始计数派生的信号：平滑后的事件速率、陈旧判定、"老"方法判定与剖析成熟度。
//! 转换策略与队列调度共用。

use std::sync::Arc;

use crate::clock::VmClock;
use crate::config::TieredConfig;
use crate::level::CompLevel;
use crate::method::Method;
use crate::predicate::EventKind;

#[derive(Clone)]
pub struct CounterModel {
    config: Arc<TieredConfig>,
    clock: Arc<dyn VmClock>,
    start_time: u64,
}

impl CounterModel {
    pub fn new(config: Arc<TieredConfig>, clock: Arc<dyn VmClock>) -> Self {
        let start_time = clock.now_millis();
        Self {
            config,
            clock,
            start_time,
        }
    }

    pub fn config(&self) -> &TieredConfig {
        &self.config
    }

    pub fn clock(&self) -> &dyn VmClock {
        self.clock.as_ref()
    }

    pub fn now(&self) -> u64 {
        self.clock.now_millis()
    }

    /// Total events seen by the method.
    pub fn event_count(method: &Method) -> u32 {
        method
            .invocation_count()
            .saturating_add(method.backedge_count())
    }

    /// Resamples the event rate of `method` at time `now`.
    ///
    /// Nothing happens unless at least `tiered_rate_update_min_time` passed
    /// since the last safepoint. The rate is recomputed once the sampling
    /// window is long enough and saw events; it is forced to zero after an
    /// idle window longer than `tiered_rate_update_max_time`.
    pub fn update_rate(&self, now: u64, method: &Method) {
        if self.is_old(method) {
            method.counters().set_rate(0.0);
            return;
        }
        let counters = method.counters();
        let prev = match counters.prev_time() {
            0 => self.start_time,
            t => t,
        };
        let delta_s = now.saturating_sub(self.clock.last_safepoint_end_millis());
        let delta_t = now.saturating_sub(prev);
        let event_count = Self::event_count(method);
        let delta_e = event_count.saturating_sub(counters.prev_event_count());

        if delta_s >= self.config.tiered_rate_update_min_time {
            if delta_t >= self.config.tiered_rate_update_min_time && delta_e > 0 {
                counters.set_prev_time(now);
                counters.set_prev_event_count(event_count);
                counters.set_rate(delta_e as f32 / delta_t as f32);
            } else if delta_t > self.config.tiered_rate_update_max_time && delta_e == 0 {
                counters.set_rate(0.0);
            }
        }
    }

    /// No events for longer than `timeout`, measured both from the last
    /// sample and from the last safepoint.
    pub fn is_stale(&self, now: u64, timeout: u64, method: &Method) -> bool {
        let counters = method.counters();
        let delta_s = now.saturating_sub(self.clock.last_safepoint_end_millis());
        let delta_t = now.saturating_sub(counters.prev_time());
        if delta_t > timeout && delta_s > timeout {
            let delta_e = Self::event_count(method).saturating_sub(counters.prev_event_count());
            return delta_e == 0;
        }
        false
    }

    /// Counts are past `tiered_old_percentage` of the level-none thresholds.
    pub fn is_old(&self, method: &Method) -> bool {
        let k = f64::from(self.config.tiered_old_percentage) / 100.0;
        let (i, b) = (method.invocation_count(), method.backedge_count());
        let scaling = method.threshold_scaling();
        EventKind::Call.should_transition(&self.config, CompLevel::None, i, b, k, scaling)
            || EventKind::Loop.should_transition(&self.config, CompLevel::None, i, b, k, scaling)
    }

    /// The profile gathered since the last start-counter reset would let a
    /// full-profile method advance.
    pub fn is_method_profiled(&self, method: &Method) -> bool {
        method.method_data().is_some_and(|mdo| {
            EventKind::Call.should_transition(
                &self.config,
                CompLevel::FullProfile,
                mdo.invocation_count_delta(),
                mdo.backedge_count_delta(),
                1.0,
                method.threshold_scaling(),
            )
        })
    }

    /// Queue priority: `(rate + 1) * (invocations + 1) * (backedges + 1)`.
    pub fn weight(method: &Method) -> f64 {
        (f64::from(method.counters().rate()) + 1.0)
            * (f64::from(method.invocation_count()) + 1.0)
            * (f64::from(method.backedge_count()) + 1.0)
    }

    /// Whether `x` should be compiled before `y`.
    pub fn compare_methods(x: &Method, y: &Method) -> bool {
        let (hx, hy) = (x.highest_comp_level(), y.highest_comp_level());
        if hx != hy {
            return hx > hy;
        }
        Self::weight(x) > Self::weight(y)
    }
}

impl std::fmt::Debug for CounterModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CounterModel")
            .field("start_time", &self.start_time)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use vm_core::Config;

    fn model(clock: &Arc<ManualClock>) -> CounterModel {
        CounterModel::new(Arc::new(TieredConfig::defaults()), Arc::clone(clock) as Arc<dyn VmClock>)
    }

    #[test]
    fn test_rate_sampling() {
        let clock = Arc::new(ManualClock::new(100));
        let model = model(&clock);
        let m = Method::builder(1, "A.f()V").build();

        m.counters().invocation_counter().increment_by(50);
        clock.advance(10);
        model.update_rate(clock.now_millis(), &m);
        assert!((m.counters().rate() - 5.0).abs() < 1e-6);
        assert_eq!(m.counters().prev_time(), 110);
        assert_eq!(m.counters().prev_event_count(), 50);

        // idle past the max window
        clock.advance(30);
        model.update_rate(clock.now_millis(), &m);
        assert_eq!(m.counters().rate(), 0.0);
        assert_eq!(m.counters().prev_time(), 110);
    }

    #[test]
    fn test_rate_ignores_recent_safepoint() {
        let clock = Arc::new(ManualClock::new(100));
        let model = model(&clock);
        let m = Method::builder(1, "A.f()V").build();
        m.counters().invocation_counter().increment_by(50);
        clock.advance(10);
        clock.safepoint();
        model.update_rate(clock.now_millis(), &m);
        assert_eq!(m.counters().rate(), 0.0);
        assert_eq!(m.counters().prev_time(), 0);
    }

    #[test]
    fn test_staleness() {
        let clock = Arc::new(ManualClock::new(100));
        let model = model(&clock);
        let m = Method::builder(1, "A.f()V").build();
        m.counters().invocation_counter().increment_by(10);
        model.update_rate(clock.now_millis() + 5, &m);
        clock.advance(5);
        assert_eq!(m.counters().prev_event_count(), 10);

        clock.advance(40);
        assert!(!model.is_stale(clock.now_millis(), 50, &m));
        clock.advance(20);
        assert!(model.is_stale(clock.now_millis(), 50, &m));

        m.counters().invocation_counter().increment();
        assert!(!model.is_stale(clock.now_millis(), 50, &m));
    }

    #[test]
    fn test_old_and_profiled() {
        let clock = Arc::new(ManualClock::new(0));
        let model = model(&clock);
        let m = Method::builder(1, "A.f()V").build();
        m.counters().invocation_counter().increment_by(1999);
        assert!(!model.is_old(&m));
        m.counters().invocation_counter().increment();
        assert!(model.is_old(&m));

        assert!(!model.is_method_profiled(&m));
        let mdo = m.build_method_data();
        mdo.invocation_counter().increment_by(5000);
        assert!(model.is_method_profiled(&m));
        mdo.reset_start_counters();
        assert!(!model.is_method_profiled(&m));
    }

    #[test]
    fn test_compare_prefers_higher_level_then_weight() {
        let hot = Method::builder(1, "A.hot()V").build();
        let warm = Method::builder(2, "A.warm()V").build();
        hot.counters().invocation_counter().increment_by(1000);
        warm.counters().invocation_counter().increment_by(10);
        assert!(CounterModel::compare_methods(&hot, &warm));
        assert!(!CounterModel::compare_methods(&warm, &hot));

        warm.counters().note_comp_level(CompLevel::FullOptimization);
        assert!(CounterModel::compare_methods(&warm, &hot));
    }
}
