//! 编译代理
//!
//! 接收策略提交的编译请求，每种编译器各维护一条队列，并由少量编译线程消费。
//! 生成的代码复制到共享代码缓存并安装到方法上；装载与卸载通知经由
//! [`EventCollector`] 投递，监听器不会在代理的锁内运行。

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use vm_core::{CodeEvent, CodeEventSink, EventCollector, ExecutableCodeAllocator};

use crate::config::TieredConfig;
use crate::counter_model::CounterModel;
use crate::error::{BackendError, CompileRejection};
use crate::level::{CompLevel, CompilerKind};
use crate::method::{CompiledMethod, Method};
use crate::queue::{CompileQueue, CompileQueueScheduler, CompileReason, CompileTask, TaskOutcome};

/// What the transition policy needs from the compilation system.
pub trait CompileService: Send + Sync {
    /// Pending tasks for the compiler that produces `level`.
    fn queue_size(&self, level: CompLevel) -> usize;

    /// Compiler threads serving `level`; zero when that compiler is unavailable.
    fn compiler_count(&self, level: CompLevel) -> usize;

    /// `capacity / unallocated` of the code cache.
    fn reverse_free_ratio(&self) -> f64;

    /// False after the code cache filled up or during shutdown.
    fn should_compile_new_jobs(&self) -> bool {
        true
    }

    fn compilation_is_in_queue(&self, method: &Method) -> bool {
        method.queued_for_compilation()
    }

    /// Enqueues a compile of `method` at `level`, entering at `osr_bci`.
    fn compile_method(
        &self,
        method: &Arc<Method>,
        osr_bci: i32,
        level: CompLevel,
        hot_count: u32,
        reason: CompileReason,
    ) -> Result<Arc<CompileTask>, CompileRejection>;
}

/// A code generator for one compiler kind. Returns the machine code for
/// the task; installation is done by the broker.
pub trait CompilerBackend: Send + Sync {
    fn kind(&self) -> CompilerKind;

    fn name(&self) -> &str;

    fn compile(&self, task: &CompileTask) -> Result<Vec<u8>, BackendError>;
}

/// Broker counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrokerStats {
    pub enqueued: u64,
    pub rejected: u64,
    pub installed: u64,
    pub failed: u64,
    pub dropped: u64,
    pub installed_bytes: u64,
}

#[derive(Debug, Default)]
struct BrokerCounters {
    enqueued: AtomicU64,
    rejected: AtomicU64,
    installed: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
    installed_bytes: AtomicU64,
}

fn kind_index(kind: CompilerKind) -> usize {
    match kind {
        CompilerKind::Profiling => 0,
        CompilerKind::Optimizing => 1,
    }
}

/// 编译代理
pub struct CompileBroker {
    scheduler: CompileQueueScheduler,
    queues: [CompileQueue; 2],
    backends: [Option<Arc<dyn CompilerBackend>>; 2],
    code_cache: Arc<ExecutableCodeAllocator>,
    events: Arc<CodeEventSink>,
    accepting: AtomicBool,
    next_task_id: AtomicU64,
    counters: BrokerCounters,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl CompileBroker {
    pub fn new(
        model: CounterModel,
        code_cache: Arc<ExecutableCodeAllocator>,
        events: Arc<CodeEventSink>,
    ) -> Self {
        Self {
            scheduler: CompileQueueScheduler::new(model),
            queues: [
                CompileQueue::new(CompilerKind::Profiling),
                CompileQueue::new(CompilerKind::Optimizing),
            ],
            backends: [None, None],
            code_cache,
            events,
            accepting: AtomicBool::new(true),
            next_task_id: AtomicU64::new(1),
            counters: BrokerCounters::default(),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Registers the backend for its kind, replacing any previous one.
    pub fn with_backend(mut self, backend: Arc<dyn CompilerBackend>) -> Self {
        tracing::debug!(target: "tiered::broker", kind = %backend.kind(), name = backend.name(), "compiler registered");
        let slot = kind_index(backend.kind());
        self.backends[slot] = Some(backend);
        self
    }

    pub fn config(&self) -> &TieredConfig {
        self.scheduler.model().config()
    }

    pub fn scheduler(&self) -> &CompileQueueScheduler {
        &self.scheduler
    }

    pub fn queue(&self, kind: CompilerKind) -> &CompileQueue {
        &self.queues[kind_index(kind)]
    }

    pub fn code_cache(&self) -> &Arc<ExecutableCodeAllocator> {
        &self.code_cache
    }

    fn backend(&self, kind: CompilerKind) -> Option<&Arc<dyn CompilerBackend>> {
        self.backends[kind_index(kind)].as_ref()
    }

    fn is_available(&self, kind: CompilerKind) -> bool {
        self.backend(kind).is_some() && self.config().compiler_count(kind) > 0
    }

    pub fn stats(&self) -> BrokerStats {
        let c = &self.counters;
        BrokerStats {
            enqueued: c.enqueued.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            installed: c.installed.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            installed_bytes: c.installed_bytes.load(Ordering::Relaxed),
        }
    }

    /// Re-enables compilation after the code cache was cleaned up.
    pub fn resume_compilation(&self) {
        if !self.accepting.swap(true, Ordering::AcqRel) {
            tracing::info!(target: "tiered::broker", "compilation resumed");
        }
    }

    fn check_request(
        &self,
        method: &Method,
        osr_bci: i32,
        level: CompLevel,
    ) -> Result<CompilerKind, CompileRejection> {
        let kind = level
            .compiler()
            .ok_or(CompileRejection::NotCompilable(level))?;
        if method.is_unloaded() {
            return Err(CompileRejection::MethodUnloaded);
        }
        if method.is_abstract() {
            return Err(CompileRejection::AbstractMethod);
        }
        if !self.should_compile_new_jobs() {
            return Err(CompileRejection::CompilationDisabled);
        }
        if !self.is_available(kind) {
            return Err(CompileRejection::CompilerUnavailable(kind));
        }
        let config = self.config();
        let huge = config.dont_compile_huge_methods && method.code_size() > config.huge_method_limit;
        let not_compilable = if osr_bci == crate::level::INVOCATION_ENTRY_BCI {
            method.is_not_compilable(level)
        } else {
            method.is_not_osr_compilable(level)
        };
        if huge || not_compilable {
            return Err(CompileRejection::NotCompilable(level));
        }
        if method.compilation_is_complete(osr_bci, level) {
            return Err(CompileRejection::AlreadyCompiled(level));
        }
        Ok(kind)
    }

    /// Takes one task for `kind`, compiles it on the calling thread and
    /// returns it. `None` when nothing was selectable.
    pub fn process_one(&self, kind: CompilerKind) -> Option<Arc<CompileTask>> {
        let task = self.queue(kind).select(&self.scheduler)?;
        self.invoke_compiler(kind, &task);
        Some(task)
    }

    fn invoke_compiler(&self, kind: CompilerKind, task: &Arc<CompileTask>) {
        let method = task.method();
        let level = task.comp_level();
        let outcome = match self.backend(kind) {
            Some(backend) => backend
                .compile(task)
                .and_then(|code| self.install(task, &code)),
            None => Err(BackendError::Bailout(format!("no {kind} compiler"))),
        };

        let outcome = match outcome {
            Ok(entry) => TaskOutcome::Installed { level, entry },
            Err(err) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                if err.is_permanent() {
                    if task.is_osr() || matches!(err, BackendError::OsrBailout(_)) {
                        method.set_not_osr_compilable(level, "compilation failed");
                    } else {
                        method.set_not_compilable(level, "compilation failed");
                    }
                    tracing::debug!(
                        target: "tiered::broker",
                        method = method.name(),
                        %level,
                        error = %err,
                        "compilation failed"
                    );
                } else {
                    self.handle_full_code_cache();
                }
                TaskOutcome::Failed(err)
            }
        };
        method.clear_queued_for_compilation();
        task.finish(outcome);
    }

    fn install(&self, task: &CompileTask, code: &[u8]) -> Result<usize, BackendError> {
        let method = task.method();
        let level = task.comp_level();
        let mut region = self.code_cache.allocate(code.len())?;
        region.write(code)?;
        let (begin, end) = (region.begin(), region.end());
        let nm = Arc::new(CompiledMethod::new(method.id(), level, task.osr_bci(), region));

        let mut events = EventCollector::new(&self.events);
        if let Some(old) = method.install_code(nm) {
            old.make_not_entrant("replaced");
            events.record(CodeEvent::CompiledMethodUnload {
                method: method.name().to_string(),
                begin: old.entry_point(),
            });
        }
        events.record(CodeEvent::CompiledMethodLoad {
            method: method.name().to_string(),
            level: level.as_i8(),
            begin,
            end,
        });

        self.counters.installed.fetch_add(1, Ordering::Relaxed);
        self.counters
            .installed_bytes
            .fetch_add(code.len() as u64, Ordering::Relaxed);
        tracing::debug!(
            target: "tiered::broker",
            method = method.name(),
            %level,
            osr_bci = task.osr_bci(),
            entry = format_args!("{begin:#x}"),
            size = code.len(),
            "code installed"
        );
        Ok(begin)
    }

    fn handle_full_code_cache(&self) {
        if self.accepting.swap(false, Ordering::AcqRel) {
            let stats = self.code_cache.stats();
            tracing::warn!(
                target: "tiered::broker",
                capacity = stats.capacity,
                allocated = stats.allocated,
                "code cache is full, compiler has been disabled"
            );
        }
    }

    /// Spawns the configured number of compiler threads for every kind
    /// that has a backend. Returns the number of threads started.
    pub fn start(self: &Arc<Self>) -> std::io::Result<usize> {
        let idle = Duration::from_millis(self.config().compile_task_timeout.max(1));
        let mut workers = self.workers.lock();
        let mut started = 0;
        for kind in CompilerKind::ALL {
            if !self.is_available(kind) {
                continue;
            }
            for n in 0..self.config().compiler_count(kind) {
                let broker = Arc::clone(self);
                let handle = std::thread::Builder::new()
                    .name(format!("{kind} compiler {n}"))
                    .spawn(move || broker.compiler_thread_loop(kind, idle))?;
                workers.push(handle);
                started += 1;
            }
        }
        tracing::info!(target: "tiered::broker", threads = started, "compiler threads started");
        Ok(started)
    }

    fn compiler_thread_loop(&self, kind: CompilerKind, idle: Duration) {
        tracing::debug!(target: "tiered::broker", %kind, "compiler thread running");
        while let Some(task) = self.queue(kind).next(&self.scheduler, idle) {
            self.invoke_compiler(kind, &task);
        }
        tracing::debug!(target: "tiered::broker", %kind, "compiler thread exiting");
    }

    /// Stops accepting work, drops pending tasks and joins the compiler threads.
    pub fn shutdown(&self) {
        self.accepting.store(false, Ordering::Release);
        for queue in &self.queues {
            for task in queue.close() {
                self.drop_task(&task);
            }
        }
        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            if handle.join().is_err() {
                tracing::warn!(target: "tiered::broker", "compiler thread panicked");
            }
        }
    }

    fn drop_task(&self, task: &CompileTask) {
        self.counters.dropped.fetch_add(1, Ordering::Relaxed);
        task.method().clear_queued_for_compilation();
        task.finish(TaskOutcome::Dropped);
    }

    /// Unloads `method`: pending tasks are dropped and every installed
    /// version is retired with an unload notification.
    pub fn unload_method(&self, method: &Method) {
        if !method.mark_unloaded() {
            return;
        }
        for queue in &self.queues {
            for task in queue.remove_method(method) {
                self.drop_task(&task);
            }
        }
        let mut events = EventCollector::new(&self.events);
        for nm in method.all_code() {
            nm.make_not_entrant("unloaded");
            events.record(CodeEvent::CompiledMethodUnload {
                method: method.name().to_string(),
                begin: nm.entry_point(),
            });
        }
        tracing::debug!(target: "tiered::broker", method = method.name(), "method unloaded");
    }
}

impl CompileService for CompileBroker {
    fn queue_size(&self, level: CompLevel) -> usize {
        level.compiler().map_or(0, |kind| self.queue(kind).len())
    }

    fn compiler_count(&self, level: CompLevel) -> usize {
        level
            .compiler()
            .filter(|&kind| self.is_available(kind))
            .map_or(0, |kind| self.config().compiler_count(kind))
    }

    fn reverse_free_ratio(&self) -> f64 {
        self.code_cache.reverse_free_ratio()
    }

    fn should_compile_new_jobs(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    fn compile_method(
        &self,
        method: &Arc<Method>,
        osr_bci: i32,
        level: CompLevel,
        hot_count: u32,
        reason: CompileReason,
    ) -> Result<Arc<CompileTask>, CompileRejection> {
        let kind = match self.check_request(method, osr_bci, level) {
            Ok(kind) => kind,
            Err(rejection) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(
                    target: "tiered::broker",
                    method = method.name(),
                    %level,
                    %rejection,
                    "compile request rejected"
                );
                return Err(rejection);
            }
        };
        if !method.try_set_queued_for_compilation() {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(CompileRejection::AlreadyQueued);
        }

        let task = Arc::new(CompileTask::new(
            self.next_task_id.fetch_add(1, Ordering::Relaxed),
            Arc::clone(method),
            osr_bci,
            level,
            reason,
            !self.config().background_compilation,
            hot_count,
            self.scheduler.model().now(),
        ));
        if !self.queue(kind).add(Arc::clone(&task)) {
            method.clear_queued_for_compilation();
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(CompileRejection::CompilationDisabled);
        }
        self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(
            target: "tiered::broker",
            task = task.id(),
            method = method.name(),
            %level,
            osr_bci,
            %reason,
            "compile task queued"
        );
        Ok(task)
    }
}

impl std::fmt::Debug for CompileBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompileBroker")
            .field("queues", &self.queues)
            .field("accepting", &self.should_compile_new_jobs())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, VmClock};
    use crate::level::INVOCATION_ENTRY_BCI;
    use vm_core::{CodeCacheConfig, Config, RecordingListener};

    struct FixedBackend(CompilerKind);

    impl CompilerBackend for FixedBackend {
        fn kind(&self) -> CompilerKind {
            self.0
        }

        fn name(&self) -> &str {
            "fixed"
        }

        fn compile(&self, task: &CompileTask) -> Result<Vec<u8>, BackendError> {
            if task.method().name().contains("bail") {
                return Err(BackendError::Bailout("unsupported bytecode".into()));
            }
            Ok(vec![0xC3; 24])
        }
    }

    fn broker(capacity: usize) -> (CompileBroker, Arc<RecordingListener>) {
        let model = CounterModel::new(
            Arc::new(TieredConfig::defaults()),
            Arc::new(ManualClock::new(1)) as Arc<dyn VmClock>,
        );
        let cache = Arc::new(
            ExecutableCodeAllocator::new(CodeCacheConfig {
                capacity,
                chunk_size: 4096,
                alignment: 8,
            })
            .unwrap(),
        );
        let sink = Arc::new(CodeEventSink::new());
        let listener = RecordingListener::new();
        sink.subscribe(listener.clone());
        let broker = CompileBroker::new(model, cache, sink)
            .with_backend(Arc::new(FixedBackend(CompilerKind::Profiling)))
            .with_backend(Arc::new(FixedBackend(CompilerKind::Optimizing)));
        (broker, listener)
    }

    #[test]
    fn test_compile_and_install() {
        let (broker, listener) = broker(64 * 1024);
        let m = Method::builder(1, "A.f()V").build();
        let task = broker
            .compile_method(&m, INVOCATION_ENTRY_BCI, CompLevel::FullProfile, 200, CompileReason::Tiered)
            .unwrap();
        assert_eq!(broker.queue_size(CompLevel::FullProfile), 1);
        assert_eq!(broker.queue_size(CompLevel::FullOptimization), 0);
        assert_eq!(
            broker.compile_method(&m, INVOCATION_ENTRY_BCI, CompLevel::FullProfile, 200, CompileReason::Tiered).err(),
            Some(CompileRejection::AlreadyQueued)
        );

        assert!(broker.process_one(CompilerKind::Profiling).is_some());
        assert!(matches!(task.outcome(), Some(TaskOutcome::Installed { level: CompLevel::FullProfile, .. })));
        assert_eq!(m.comp_level(), CompLevel::FullProfile);
        assert!(!m.queued_for_compilation());
        assert_eq!(listener.len(), 1);
        assert_eq!(
            broker.compile_method(&m, INVOCATION_ENTRY_BCI, CompLevel::FullProfile, 0, CompileReason::Tiered).err(),
            Some(CompileRejection::AlreadyCompiled(CompLevel::FullProfile))
        );
        assert_eq!(broker.stats().installed, 1);
    }

    #[test]
    fn test_backend_registered_per_kind() {
        let model = CounterModel::new(
            Arc::new(TieredConfig::defaults()),
            Arc::new(ManualClock::new(1)) as Arc<dyn VmClock>,
        );
        let cache = Arc::new(
            ExecutableCodeAllocator::new(CodeCacheConfig {
                capacity: 64 * 1024,
                chunk_size: 4096,
                alignment: 8,
            })
            .unwrap(),
        );
        let broker = CompileBroker::new(model, cache, Arc::new(CodeEventSink::new()))
            .with_backend(Arc::new(FixedBackend(CompilerKind::Profiling)))
            .with_backend(Arc::new(FixedBackend(CompilerKind::Profiling)));
        assert!(broker.compiler_count(CompLevel::Simple) >= 1);
        assert!(broker.compiler_count(CompLevel::FullProfile) >= 1);
        assert_eq!(broker.compiler_count(CompLevel::FullOptimization), 0);
        assert_eq!(broker.compiler_count(CompLevel::None), 0);
    }

    #[test]
    fn test_bailout_marks_not_compilable() {
        let (broker, _) = broker(64 * 1024);
        let m = Method::builder(1, "A.bail()V").build();
        broker
            .compile_method(&m, INVOCATION_ENTRY_BCI, CompLevel::FullOptimization, 0, CompileReason::Tiered)
            .unwrap();
        let task = broker.process_one(CompilerKind::Optimizing).unwrap();
        assert!(matches!(task.outcome(), Some(TaskOutcome::Failed(BackendError::Bailout(_)))));
        assert!(m.is_not_compilable(CompLevel::FullOptimization));
        assert!(!m.is_not_compilable(CompLevel::Simple));
        assert_eq!(
            broker.compile_method(&m, INVOCATION_ENTRY_BCI, CompLevel::FullOptimization, 0, CompileReason::Tiered).err(),
            Some(CompileRejection::NotCompilable(CompLevel::FullOptimization))
        );
    }

    #[test]
    fn test_full_code_cache_disables_compilation() {
        let (broker, _) = broker(4096);
        let mut installed = 0;
        for id in 0..512 {
            let m = Method::builder(id, format!("A.m{id}()V")).build();
            if broker
                .compile_method(&m, INVOCATION_ENTRY_BCI, CompLevel::Simple, 0, CompileReason::Tiered)
                .is_err()
            {
                break;
            }
            match broker.process_one(CompilerKind::Profiling).unwrap().outcome() {
                Some(TaskOutcome::Installed { .. }) => installed += 1,
                Some(TaskOutcome::Failed(e)) => assert!(!e.is_permanent()),
                other => panic!("unexpected outcome {other:?}"),
            }
        }
        assert!(installed > 0);
        assert!(!broker.should_compile_new_jobs());
        let m = Method::builder(9999, "A.late()V").build();
        assert_eq!(
            broker.compile_method(&m, INVOCATION_ENTRY_BCI, CompLevel::Simple, 0, CompileReason::Tiered).err(),
            Some(CompileRejection::CompilationDisabled)
        );
    }

    #[test]
    fn test_rejections() {
        let (broker, _) = broker(64 * 1024);
        let abstract_method = Method::builder(1, "A.a()V")
            .flags(crate::method::MethodFlags {
                is_abstract: true,
                ..Default::default()
            })
            .build();
        assert_eq!(
            broker.compile_method(&abstract_method, INVOCATION_ENTRY_BCI, CompLevel::Simple, 0, CompileReason::Tiered).err(),
            Some(CompileRejection::AbstractMethod)
        );
        let huge = Method::builder(2, "A.huge()V").code_size(9000).build();
        assert_eq!(
            broker.compile_method(&huge, INVOCATION_ENTRY_BCI, CompLevel::Simple, 0, CompileReason::Tiered).err(),
            Some(CompileRejection::NotCompilable(CompLevel::Simple))
        );
        let m = Method::builder(3, "A.f()V").build();
        assert_eq!(
            broker.compile_method(&m, INVOCATION_ENTRY_BCI, CompLevel::None, 0, CompileReason::Tiered).err(),
            Some(CompileRejection::NotCompilable(CompLevel::None))
        );
        assert_eq!(broker.stats().rejected, 3);
    }

    #[test]
    fn test_unload_drops_tasks_and_posts_events() {
        let (broker, listener) = broker(64 * 1024);
        let m = Method::builder(1, "A.f()V").build();
        broker
            .compile_method(&m, INVOCATION_ENTRY_BCI, CompLevel::Simple, 0, CompileReason::Tiered)
            .unwrap();
        broker.process_one(CompilerKind::Profiling).unwrap();
        let pending = broker
            .compile_method(&m, 7, CompLevel::FullOptimization, 0, CompileReason::Tiered)
            .unwrap();

        broker.unload_method(&m);
        assert_eq!(pending.outcome(), Some(TaskOutcome::Dropped));
        assert!(broker.queue(CompilerKind::Optimizing).is_empty());
        assert_eq!(m.comp_level(), CompLevel::None);
        let events = listener.events();
        assert!(matches!(events.last(), Some(CodeEvent::CompiledMethodUnload { .. })));
        assert_eq!(
            broker.compile_method(&m, INVOCATION_ENTRY_BCI, CompLevel::Simple, 0, CompileReason::Tiered).err(),
            Some(CompileRejection::MethodUnloaded)
        );
    }
}
