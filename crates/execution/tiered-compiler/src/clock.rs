//! 毫秒时钟
//!
//! 用于速率采样与陈旧判定。速率计算需要扣除全局停顿，因此时钟同时报告上一次
//! 安全点结束的时间。

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

pub trait VmClock: Send + Sync {
    /// Milliseconds since an arbitrary fixed origin.
    fn now_millis(&self) -> u64;

    /// End of the most recent safepoint, on the same time base.
    fn last_safepoint_end_millis(&self) -> u64;
}

/// Wall clock measured from construction.
#[derive(Debug)]
pub struct SystemClock {
    origin: Instant,
    last_safepoint_end: AtomicU64,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_safepoint_end: AtomicU64::new(0),
        }
    }

    /// Called by the safepoint machinery when threads resume.
    pub fn record_safepoint_end(&self) {
        self.last_safepoint_end
            .store(self.now_millis(), Ordering::Relaxed);
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl VmClock for SystemClock {
    fn now_millis(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    fn last_safepoint_end_millis(&self) -> u64 {
        self.last_safepoint_end.load(Ordering::Relaxed)
    }
}

/// Clock advanced explicitly; used to make timing behaviour deterministic.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
    last_safepoint_end: AtomicU64,
}

impl ManualClock {
    pub fn new(start_millis: u64) -> Self {
        Self {
            now: AtomicU64::new(start_millis),
            last_safepoint_end: AtomicU64::new(0),
        }
    }

    pub fn advance(&self, millis: u64) {
        self.now.fetch_add(millis, Ordering::Relaxed);
    }

    pub fn set(&self, millis: u64) {
        self.now.store(millis, Ordering::Relaxed);
    }

    /// Records a safepoint that ends now.
    pub fn safepoint(&self) {
        self.last_safepoint_end
            .store(self.now.load(Ordering::Relaxed), Ordering::Relaxed);
    }
}

impl VmClock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::Relaxed)
    }

    fn last_safepoint_end_millis(&self) -> u64 {
        self.last_safepoint_end.load(Ordering::Relaxed)
    }
}
