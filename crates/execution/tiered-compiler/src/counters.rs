//! 方法计数器
//!
//! 每个方法的调用计数与回边计数。应用线程无同步地递增（一次读加一次写），
//! 并发递增可能丢失，近似计数只会让层级转换略早或略晚发生。
//! 除重新剖析时的显式重置外，计数不会减少。

use std::sync::atomic::{AtomicBool, AtomicI8, AtomicU32, AtomicU64, Ordering};

use crate::level::CompLevel;

/// Saturating 31-bit event counter with an overflow carry bit.
///
/// Layout: `count << 1 | carry`.
#[derive(Debug, Default)]
pub struct InvocationCounter {
    raw: AtomicU32,
}

impl InvocationCounter {
    pub const COUNT_LIMIT: u32 = (1 << 31) - 1;
    const CARRY: u32 = 1;

    pub fn new() -> Self {
        Self::default()
    }

    /// Raw count, ignoring the carry.
    pub fn raw_count(&self) -> u32 {
        self.raw.load(Ordering::Relaxed) >> 1
    }

    /// Count as seen by the policy; reads as the limit once the carry is set.
    pub fn count(&self) -> u32 {
        let raw = self.raw.load(Ordering::Relaxed);
        if raw & Self::CARRY != 0 {
            Self::COUNT_LIMIT
        } else {
            raw >> 1
        }
    }

    pub fn carry(&self) -> bool {
        self.raw.load(Ordering::Relaxed) & Self::CARRY != 0
    }

    /// Adds one event and returns the new raw count.
    pub fn increment(&self) -> u32 {
        self.increment_by(1)
    }

    /// Adds `n` events, saturating at [`Self::COUNT_LIMIT`].
    pub fn increment_by(&self, n: u32) -> u32 {
        let raw = self.raw.load(Ordering::Relaxed);
        let count = ((raw >> 1).saturating_add(n)).min(Self::COUNT_LIMIT);
        self.raw
            .store((count << 1) | (raw & Self::CARRY), Ordering::Relaxed);
        count
    }

    /// Sets the carry once the count has passed half the limit.
    pub fn set_carry_on_overflow(&self) {
        let raw = self.raw.load(Ordering::Relaxed);
        if raw & Self::CARRY == 0 && (raw >> 1) > Self::COUNT_LIMIT / 2 {
            self.raw.fetch_or(Self::CARRY, Ordering::Relaxed);
        }
    }

    pub fn reset(&self) {
        self.raw.store(0, Ordering::Relaxed);
    }
}

/// True when an incremented count lands on a notification point.
pub fn should_notify(count: u32, freq_log: u32) -> bool {
    let mask = (1u32 << freq_log.min(31)) - 1;
    count & mask == 0
}

/// Interpreter-side counters and rate sampling state.
#[derive(Debug)]
pub struct MethodCounters {
    invocation: InvocationCounter,
    backedge: InvocationCounter,
    /// Events per millisecond, `f32` bits.
    rate: AtomicU32,
    prev_time: AtomicU64,
    prev_event_count: AtomicU32,
    highest_comp_level: AtomicI8,
    highest_osr_comp_level: AtomicI8,
}

impl Default for MethodCounters {
    fn default() -> Self {
        Self::new()
    }
}

impl MethodCounters {
    pub fn new() -> Self {
        Self {
            invocation: InvocationCounter::new(),
            backedge: InvocationCounter::new(),
            rate: AtomicU32::new(0f32.to_bits()),
            prev_time: AtomicU64::new(0),
            prev_event_count: AtomicU32::new(0),
            highest_comp_level: AtomicI8::new(CompLevel::None.as_i8()),
            highest_osr_comp_level: AtomicI8::new(CompLevel::None.as_i8()),
        }
    }

    pub fn invocation_counter(&self) -> &InvocationCounter {
        &self.invocation
    }

    pub fn backedge_counter(&self) -> &InvocationCounter {
        &self.backedge
    }

    pub fn rate(&self) -> f32 {
        f32::from_bits(self.rate.load(Ordering::Relaxed))
    }

    pub fn set_rate(&self, rate: f32) {
        self.rate.store(rate.to_bits(), Ordering::Relaxed);
    }

    pub fn prev_time(&self) -> u64 {
        self.prev_time.load(Ordering::Relaxed)
    }

    pub fn set_prev_time(&self, time: u64) {
        self.prev_time.store(time, Ordering::Relaxed);
    }

    pub fn prev_event_count(&self) -> u32 {
        self.prev_event_count.load(Ordering::Relaxed)
    }

    pub fn set_prev_event_count(&self, count: u32) {
        self.prev_event_count.store(count, Ordering::Relaxed);
    }

    pub fn highest_comp_level(&self) -> CompLevel {
        CompLevel::from_i8(self.highest_comp_level.load(Ordering::Relaxed))
            .unwrap_or(CompLevel::None)
    }

    pub fn highest_osr_comp_level(&self) -> CompLevel {
        CompLevel::from_i8(self.highest_osr_comp_level.load(Ordering::Relaxed))
            .unwrap_or(CompLevel::None)
    }

    /// Raises the recorded highest level; never lowers it.
    pub fn note_comp_level(&self, level: CompLevel) {
        self.highest_comp_level
            .fetch_max(level.as_i8(), Ordering::Relaxed);
    }

    pub fn note_osr_comp_level(&self, level: CompLevel) {
        self.highest_osr_comp_level
            .fetch_max(level.as_i8(), Ordering::Relaxed);
    }

    /// Wholesale reset on reprofiling. Highest-level history is kept.
    pub fn reset(&self) {
        self.invocation.reset();
        self.backedge.reset();
        self.set_rate(0.0);
        self.set_prev_time(0);
        self.set_prev_event_count(0);
    }
}

/// Profile record (method data). Counts here are bumped by profiled code and
/// by the interpreter once the record exists; maturity is judged on the
/// deltas since the last start-counter reset.
#[derive(Debug)]
pub struct MethodData {
    invocation: InvocationCounter,
    backedge: InvocationCounter,
    invocation_start: AtomicU32,
    backedge_start: AtomicU32,
    would_profile: AtomicBool,
}

impl Default for MethodData {
    fn default() -> Self {
        Self::new()
    }
}

impl MethodData {
    pub fn new() -> Self {
        Self {
            invocation: InvocationCounter::new(),
            backedge: InvocationCounter::new(),
            invocation_start: AtomicU32::new(0),
            backedge_start: AtomicU32::new(0),
            would_profile: AtomicBool::new(true),
        }
    }

    pub fn invocation_counter(&self) -> &InvocationCounter {
        &self.invocation
    }

    pub fn backedge_counter(&self) -> &InvocationCounter {
        &self.backedge
    }

    pub fn invocation_count(&self) -> u32 {
        self.invocation.count()
    }

    pub fn backedge_count(&self) -> u32 {
        self.backedge.count()
    }

    pub fn invocation_count_start(&self) -> u32 {
        self.invocation_start.load(Ordering::Relaxed)
    }

    pub fn backedge_count_start(&self) -> u32 {
        self.backedge_start.load(Ordering::Relaxed)
    }

    pub fn invocation_count_delta(&self) -> u32 {
        self.invocation_count()
            .saturating_sub(self.invocation_count_start())
    }

    pub fn backedge_count_delta(&self) -> u32 {
        self.backedge_count()
            .saturating_sub(self.backedge_count_start())
    }

    /// Restarts maturity measurement from the current counts.
    pub fn reset_start_counters(&self) {
        self.invocation_start
            .store(self.invocation_count(), Ordering::Relaxed);
        self.backedge_start
            .store(self.backedge_count(), Ordering::Relaxed);
    }

    /// False when the profiling compiler found nothing worth profiling.
    pub fn would_profile(&self) -> bool {
        self.would_profile.load(Ordering::Relaxed)
    }

    pub fn set_would_profile(&self, value: bool) {
        self.would_profile.store(value, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_saturates() {
        let c = InvocationCounter::new();
        c.increment_by(InvocationCounter::COUNT_LIMIT - 1);
        assert_eq!(c.increment(), InvocationCounter::COUNT_LIMIT);
        assert_eq!(c.increment(), InvocationCounter::COUNT_LIMIT);
        assert!(!c.carry());
    }

    #[test]
    fn test_carry_on_overflow() {
        let c = InvocationCounter::new();
        c.increment_by(InvocationCounter::COUNT_LIMIT / 2);
        c.set_carry_on_overflow();
        assert!(!c.carry());
        c.increment();
        c.set_carry_on_overflow();
        assert!(c.carry());
        assert_eq!(c.count(), InvocationCounter::COUNT_LIMIT);
        assert_eq!(c.raw_count(), InvocationCounter::COUNT_LIMIT / 2 + 1);
        // carry survives further increments
        c.increment();
        assert!(c.carry());
    }

    #[test]
    fn test_notify_points() {
        assert!(should_notify(128, 7));
        assert!(!should_notify(129, 7));
        assert!(should_notify(5, 0));
    }

    #[test]
    fn test_method_data_deltas() {
        let mdo = MethodData::new();
        mdo.invocation_counter().increment_by(300);
        mdo.backedge_counter().increment_by(40);
        assert_eq!(mdo.invocation_count_delta(), 300);
        mdo.reset_start_counters();
        assert_eq!(mdo.invocation_count_delta(), 0);
        mdo.invocation_counter().increment_by(5);
        assert_eq!(mdo.invocation_count_delta(), 5);
        assert_eq!(mdo.backedge_count_delta(), 0);
    }

    #[test]
    fn test_highest_level_only_rises() {
        let mcs = MethodCounters::new();
        mcs.note_comp_level(CompLevel::FullProfile);
        mcs.note_comp_level(CompLevel::Simple);
        assert_eq!(mcs.highest_comp_level(), CompLevel::FullProfile);
        mcs.reset();
        assert_eq!(mcs.highest_comp_level(), CompLevel::FullProfile);
        assert_eq!(mcs.invocation_counter().count(), 0);
    }
}
