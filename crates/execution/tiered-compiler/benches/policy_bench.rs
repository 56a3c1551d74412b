//! 分层策略与队列选择性能基准测试

use std::sync::Arc;

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use rand::Rng;
use tiered_compiler::{
    CompLevel, CompileQueueScheduler, CompileReason, CompileRejection, CompileService,
    CompileTask, CounterModel, EventKind, INVOCATION_ENTRY_BCI, ManualClock, Method, TieredConfig,
    TieredPolicy, VmClock,
};
use vm_core::Config;

struct IdleService;

impl CompileService for IdleService {
    fn queue_size(&self, _level: CompLevel) -> usize {
        0
    }

    fn compiler_count(&self, level: CompLevel) -> usize {
        usize::from(level != CompLevel::None)
    }

    fn reverse_free_ratio(&self) -> f64 {
        1.0
    }

    fn compile_method(
        &self,
        _method: &Arc<Method>,
        _osr_bci: i32,
        _level: CompLevel,
        _hot_count: u32,
        _reason: CompileReason,
    ) -> Result<Arc<CompileTask>, CompileRejection> {
        Err(CompileRejection::CompilationDisabled)
    }
}

fn model() -> CounterModel {
    CounterModel::new(
        Arc::new(TieredConfig::defaults()),
        Arc::new(ManualClock::new(1)) as Arc<dyn VmClock>,
    )
}

/// 基准测试: 各层级的转换判定
fn bench_transition(c: &mut Criterion) {
    let mut group = c.benchmark_group("transition");
    let policy = TieredPolicy::new(model(), Arc::new(IdleService));

    let m = Method::builder(1, "B.m()V").build();
    m.counters().invocation_counter().increment_by(150);
    m.build_method_data().invocation_counter().increment_by(3000);

    for level in [CompLevel::None, CompLevel::LimitedProfile, CompLevel::FullProfile] {
        group.bench_with_input(BenchmarkId::new("call", level), &level, |b, &level| {
            b.iter(|| policy.transition(black_box(&m), level, EventKind::Call, false));
        });
        group.bench_with_input(BenchmarkId::new("loop", level), &level, |b, &level| {
            b.iter(|| policy.loop_event(black_box(&m), level));
        });
    }
    group.finish();
}

/// 基准测试: 解释器调用检查点
fn bench_checkpoint(c: &mut Criterion) {
    let policy = TieredPolicy::new(model(), Arc::new(IdleService));
    let m = Method::builder(1, "B.entry()V").build();
    c.bench_function("on_method_entry", |b| {
        b.iter(|| policy.on_method_entry(black_box(&m)));
    });
}

/// 基准测试: 队列任务选择
fn bench_select_task(c: &mut Criterion) {
    let mut group = c.benchmark_group("select_task");
    let scheduler = CompileQueueScheduler::new(model());
    let mut rng = rand::thread_rng();

    for &count in &[8usize, 64, 512] {
        let tasks: Vec<Arc<CompileTask>> = (0..count)
            .map(|i| {
                let m = Method::builder(i as u64, format!("B.m{i}()V")).build();
                m.counters()
                    .invocation_counter()
                    .increment_by(rng.gen_range(0..10_000));
                m.counters()
                    .backedge_counter()
                    .increment_by(rng.gen_range(0..100_000));
                Arc::new(CompileTask::new(
                    i as u64,
                    m,
                    INVOCATION_ENTRY_BCI,
                    CompLevel::FullOptimization,
                    CompileReason::Tiered,
                    false,
                    0,
                    1,
                ))
            })
            .collect();

        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &tasks, |b, tasks| {
            b.iter_batched(
                || tasks.clone(),
                |mut pending| scheduler.select_task(&mut pending),
                criterion::BatchSize::SmallInput,
            );
        });
    }
    group.finish();
}

criterion_group!(benches, bench_transition, bench_checkpoint, bench_select_task);
criterion_main!(benches);
