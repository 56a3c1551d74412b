//! 编译队列与任务选择
//!
//! 每种编译器一条队列。选择并非先进先出：每一轮都会移除已卸载方法与陈旧的任务，
//! 重新采样速率，并挑选当前最值得编译的方法对应的任务。

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicI8, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::counter_model::CounterModel;
use crate::error::BackendError;
use crate::event_log::{TieredEvent, print_event};
use crate::level::{CompLevel, CompilerKind, INVOCATION_ENTRY_BCI};
use crate::method::Method;

/// Why a compile was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompileReason {
    /// Counter-driven request from the transition policy.
    Tiered,
    /// The runtime requires compiled code (e.g. an intrinsic).
    MustBeCompiled,
    /// Explicit request from a test or diagnostic API.
    Whitebox,
    /// Replayed compile.
    Replay,
}

impl CompileReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CompileReason::Tiered => "tiered",
            CompileReason::MustBeCompiled => "must_be_compiled",
            CompileReason::Whitebox => "whitebox",
            CompileReason::Replay => "replay",
        }
    }
}

impl fmt::Display for CompileReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Code was installed at `level`, entry at `entry`.
    Installed { level: CompLevel, entry: usize },
    /// The backend gave up.
    Failed(BackendError),
    /// Removed from the queue without compiling.
    Dropped,
}

/// One pending or in-flight compile request.
pub struct CompileTask {
    id: u64,
    method: Arc<Method>,
    osr_bci: i32,
    comp_level: AtomicI8,
    reason: CompileReason,
    blocking: bool,
    hot_count: u32,
    enqueue_time: u64,
    outcome: Mutex<Option<TaskOutcome>>,
    done: Condvar,
}

impl CompileTask {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: u64,
        method: Arc<Method>,
        osr_bci: i32,
        comp_level: CompLevel,
        reason: CompileReason,
        blocking: bool,
        hot_count: u32,
        enqueue_time: u64,
    ) -> Self {
        Self {
            id,
            method,
            osr_bci,
            comp_level: AtomicI8::new(comp_level.as_i8()),
            reason,
            blocking,
            hot_count,
            enqueue_time,
            outcome: Mutex::new(None),
            done: Condvar::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn method(&self) -> &Arc<Method> {
        &self.method
    }

    pub fn osr_bci(&self) -> i32 {
        self.osr_bci
    }

    pub fn is_osr(&self) -> bool {
        self.osr_bci != INVOCATION_ENTRY_BCI
    }

    pub fn comp_level(&self) -> CompLevel {
        CompLevel::from_i8(self.comp_level.load(Ordering::Acquire)).unwrap_or(CompLevel::None)
    }

    /// Demotes the request in place; only done while the task is queued.
    pub(crate) fn set_comp_level(&self, level: CompLevel) {
        self.comp_level.store(level.as_i8(), Ordering::Release);
    }

    pub fn reason(&self) -> CompileReason {
        self.reason
    }

    pub fn is_blocking(&self) -> bool {
        self.blocking
    }

    pub fn hot_count(&self) -> u32 {
        self.hot_count
    }

    pub fn enqueue_time(&self) -> u64 {
        self.enqueue_time
    }

    /// Counter-driven, non-blocking tasks may be evicted for staleness.
    pub fn can_become_stale(&self) -> bool {
        self.reason == CompileReason::Tiered && !self.blocking
    }

    pub fn outcome(&self) -> Option<TaskOutcome> {
        self.outcome.lock().clone()
    }

    pub fn is_complete(&self) -> bool {
        self.outcome.lock().is_some()
    }

    /// Records the result and wakes waiters. Only the first call counts.
    pub(crate) fn finish(&self, outcome: TaskOutcome) {
        let mut slot = self.outcome.lock();
        if slot.is_none() {
            *slot = Some(outcome);
            self.done.notify_all();
        }
    }

    /// Blocks until the task has finished.
    pub fn wait(&self) -> TaskOutcome {
        let mut slot = self.outcome.lock();
        loop {
            if let Some(outcome) = slot.as_ref() {
                return outcome.clone();
            }
            self.done.wait(&mut slot);
        }
    }

    /// Blocks until the task has finished or `timeout` elapsed.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<TaskOutcome> {
        let mut slot = self.outcome.lock();
        if slot.is_none() {
            self.done.wait_for(&mut slot, timeout);
        }
        slot.clone()
    }
}

impl fmt::Debug for CompileTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompileTask")
            .field("id", &self.id)
            .field("method", &self.method.name())
            .field("osr_bci", &self.osr_bci)
            .field("level", &self.comp_level())
            .field("reason", &self.reason)
            .field("blocking", &self.blocking)
            .finish()
    }
}

/// 任务选择器
#[derive(Debug, Clone)]
pub struct CompileQueueScheduler {
    model: CounterModel,
}

impl CompileQueueScheduler {
    pub fn new(model: CounterModel) -> Self {
        Self { model }
    }

    pub fn model(&self) -> &CounterModel {
        &self.model
    }

    /// Removes and returns the next task to compile from `tasks`.
    ///
    /// Tasks of unloaded methods and stale tasks of methods that are not
    /// old are dropped on the way. A full-profile task whose method is
    /// already profiled is demoted to limited-profile, or dropped if that
    /// code already exists; `None` is returned in that case even if other
    /// tasks remain.
    pub fn select_task(&self, tasks: &mut Vec<Arc<CompileTask>>) -> Option<Arc<CompileTask>> {
        let config = self.model.config();
        let now = self.model.now();
        let mut max: Option<usize> = None;
        let mut max_blocking: Option<usize> = None;

        let mut i = 0;
        while i < tasks.len() {
            let method = Arc::clone(tasks[i].method());
            if method.is_unloaded() {
                let task = tasks.remove(i);
                task.finish(TaskOutcome::Dropped);
                continue;
            }
            if tasks[i].can_become_stale()
                && self.model.is_stale(now, config.compile_task_timeout, &method)
                && !self.model.is_old(&method)
            {
                let task = tasks.remove(i);
                print_event(
                    config,
                    TieredEvent::RemoveFromQueue,
                    &method,
                    &method,
                    task.osr_bci(),
                    task.comp_level(),
                );
                method.clear_queued_for_compilation();
                task.finish(TaskOutcome::Dropped);
                continue;
            }
            self.model.update_rate(now, &method);
            let better = |best: Option<usize>| {
                best.is_none_or(|j| CounterModel::compare_methods(&method, tasks[j].method()))
            };
            if better(max) {
                max = Some(i);
            }
            if tasks[i].is_blocking() && better(max_blocking) {
                max_blocking = Some(i);
            }
            i += 1;
        }

        if max_blocking.is_some() && !config.background_compilation {
            max = max_blocking;
        }
        let index = max?;

        let task = &tasks[index];
        let method = Arc::clone(task.method());
        if task.comp_level() == CompLevel::FullProfile
            && config.highest_compile_level() > CompLevel::FullProfile
            && self.model.is_method_profiled(&method)
        {
            task.set_comp_level(CompLevel::LimitedProfile);
            if method.compilation_is_complete(task.osr_bci(), CompLevel::LimitedProfile) {
                let task = tasks.remove(index);
                method.clear_queued_for_compilation();
                task.finish(TaskOutcome::Dropped);
                return None;
            }
            print_event(
                config,
                TieredEvent::UpdateInQueue,
                &method,
                &method,
                task.osr_bci(),
                task.comp_level(),
            );
        }
        Some(tasks.remove(index))
    }
}

struct QueueState {
    tasks: Vec<Arc<CompileTask>>,
    closed: bool,
}

/// 编译队列
pub struct CompileQueue {
    kind: CompilerKind,
    state: Mutex<QueueState>,
    available: Condvar,
}

impl CompileQueue {
    pub fn new(kind: CompilerKind) -> Self {
        Self {
            kind,
            state: Mutex::new(QueueState {
                tasks: Vec::new(),
                closed: false,
            }),
            available: Condvar::new(),
        }
    }

    pub fn kind(&self) -> CompilerKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.state.lock().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Returns false once the queue is closed.
    pub fn add(&self, task: Arc<CompileTask>) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }
        state.tasks.push(task);
        self.available.notify_one();
        true
    }

    /// Snapshot of pending tasks in insertion order.
    pub fn tasks(&self) -> Vec<Arc<CompileTask>> {
        self.state.lock().tasks.clone()
    }

    /// Non-blocking selection.
    pub fn select(&self, scheduler: &CompileQueueScheduler) -> Option<Arc<CompileTask>> {
        let mut state = self.state.lock();
        scheduler.select_task(&mut state.tasks)
    }

    /// Waits for work. Empty queues are rechecked every `idle` so that
    /// staleness keeps being evaluated; returns `None` once closed.
    pub fn next(&self, scheduler: &CompileQueueScheduler, idle: Duration) -> Option<Arc<CompileTask>> {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return None;
            }
            if let Some(task) = scheduler.select_task(&mut state.tasks) {
                return Some(task);
            }
            if state.tasks.is_empty() {
                self.available.wait_for(&mut state, idle);
            }
        }
    }

    /// Removes every task for `method`.
    pub fn remove_method(&self, method: &Method) -> Vec<Arc<CompileTask>> {
        let mut state = self.state.lock();
        let (removed, kept): (Vec<_>, Vec<_>) = state
            .tasks
            .drain(..)
            .partition(|t| t.method().id() == method.id());
        state.tasks = kept;
        removed
    }

    /// Stops accepting work, wakes all waiters and returns what was pending.
    pub fn close(&self) -> Vec<Arc<CompileTask>> {
        let mut state = self.state.lock();
        state.closed = true;
        self.available.notify_all();
        std::mem::take(&mut state.tasks)
    }
}

impl fmt::Debug for CompileQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("CompileQueue")
            .field("kind", &self.kind)
            .field("pending", &state.tasks.len())
            .field("closed", &state.closed)
            .finish()
    }
}
