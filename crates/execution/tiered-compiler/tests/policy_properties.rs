//! 分层策略属性测试

use std::sync::Arc;

use parking_lot::Mutex;
use proptest::prelude::*;
use tiered_compiler::{
    CompLevel, CompileReason, CompileRejection, CompileService, CompileTask, CompiledMethod,
    CounterModel, EventKind, ManualClock, Method, MethodTrainingData, TieredConfig, TieredPolicy,
    TrainedCompile, TrainingData, VmClock,
};
use vm_core::{CodeCacheConfig, Config, ExecutableCodeAllocator};

/// Queue lengths fixed per test case; compile requests are recorded only.
struct StaticLoad {
    profiling_queue: usize,
    optimizing_queue: usize,
    requests: Mutex<u64>,
}

impl StaticLoad {
    fn new(profiling_queue: usize, optimizing_queue: usize) -> Arc<Self> {
        Arc::new(Self {
            profiling_queue,
            optimizing_queue,
            requests: Mutex::new(0),
        })
    }
}

impl CompileService for StaticLoad {
    fn queue_size(&self, level: CompLevel) -> usize {
        match level {
            CompLevel::None => 0,
            CompLevel::FullOptimization => self.optimizing_queue,
            _ => self.profiling_queue,
        }
    }

    fn compiler_count(&self, level: CompLevel) -> usize {
        usize::from(level != CompLevel::None)
    }

    fn reverse_free_ratio(&self) -> f64 {
        1.0
    }

    fn compile_method(
        &self,
        method: &Arc<Method>,
        osr_bci: i32,
        level: CompLevel,
        hot_count: u32,
        reason: CompileReason,
    ) -> Result<Arc<CompileTask>, CompileRejection> {
        let mut requests = self.requests.lock();
        *requests += 1;
        Ok(Arc::new(CompileTask::new(
            *requests,
            Arc::clone(method),
            osr_bci,
            level,
            reason,
            false,
            hot_count,
            0,
        )))
    }
}

fn policy(service: Arc<StaticLoad>) -> TieredPolicy {
    let model = CounterModel::new(
        Arc::new(TieredConfig::defaults()),
        Arc::new(ManualClock::new(1)) as Arc<dyn VmClock>,
    );
    TieredPolicy::new(model, service)
}

#[derive(Debug, Clone)]
enum CounterOp {
    Invoke(u32),
    BackEdge(u32),
    Profiled(u32),
    UpdateRate(u64),
    Safepoint,
    Reprofile,
}

fn counter_op() -> impl Strategy<Value = CounterOp> {
    prop_oneof![
        (1u32..5000).prop_map(CounterOp::Invoke),
        (1u32..50_000).prop_map(CounterOp::BackEdge),
        (1u32..5000).prop_map(CounterOp::Profiled),
        (0u64..100).prop_map(CounterOp::UpdateRate),
        Just(CounterOp::Safepoint),
        Just(CounterOp::Reprofile),
    ]
}

fn level_strategy() -> impl Strategy<Value = CompLevel> {
    prop_oneof![
        Just(CompLevel::None),
        Just(CompLevel::Simple),
        Just(CompLevel::LimitedProfile),
        Just(CompLevel::FullProfile),
        Just(CompLevel::FullOptimization),
    ]
}

fn training_strategy() -> impl Strategy<Value = MethodTrainingData> {
    (
        prop::collection::vec(level_strategy(), 0..4),
        any::<bool>(),
        any::<bool>(),
        0u32..20_000,
        0u32..100_000,
        prop::option::of(0u32..3),
    )
        .prop_map(
            |(levels_seen, only_inlined, has_profile, invocation_count, backedge_count, deps)| {
                let highest_top_level = levels_seen.iter().copied().max().unwrap_or(CompLevel::None);
                MethodTrainingData {
                    levels_seen,
                    highest_top_level,
                    only_inlined,
                    has_profile,
                    invocation_count,
                    backedge_count,
                    full_optimization_compile: deps
                        .map(|n| TrainedCompile::new(CompLevel::FullOptimization, n)),
                }
            },
        )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    /// 属性测试: 计数只增不减，除非重新采样剖析
    #[test]
    fn prop_counters_monotonic_until_reprofile(ops in prop::collection::vec(counter_op(), 1..64)) {
        let clock = Arc::new(ManualClock::new(1));
        let model = CounterModel::new(
            Arc::new(TieredConfig::defaults()),
            Arc::clone(&clock) as Arc<dyn VmClock>,
        );
        let policy = TieredPolicy::new(model.clone(), StaticLoad::new(0, 0));
        let m = Method::builder(1, "P.m()V").build();
        let (mut i, mut b) = (0, 0);

        for op in ops {
            match op {
                CounterOp::Invoke(n) => { m.counters().invocation_counter().increment_by(n); }
                CounterOp::BackEdge(n) => { m.counters().backedge_counter().increment_by(n); }
                CounterOp::Profiled(n) => { m.build_method_data().invocation_counter().increment_by(n); }
                CounterOp::UpdateRate(ms) => {
                    clock.advance(ms);
                    model.update_rate(clock.now_millis(), &m);
                    prop_assert!(m.counters().rate() >= 0.0);
                }
                CounterOp::Safepoint => clock.safepoint(),
                CounterOp::Reprofile => {
                    policy.reprofile(&[&*m]);
                    prop_assert_eq!(m.counters().invocation_counter().count(), 0);
                    prop_assert_eq!(m.counters().backedge_counter().count(), 0);
                    i = m.invocation_count();
                    b = m.backedge_count();
                    continue;
                }
            }
            prop_assert!(m.invocation_count() >= i);
            prop_assert!(m.backedge_count() >= b);
            i = m.invocation_count();
            b = m.backedge_count();
        }
    }

    /// 属性测试: 计数超过所有阈值时至多三步到达完全优化，去优化后回到解释执行
    #[test]
    fn prop_hot_method_reaches_full_optimization(
        invocations in 5_000u32..1_000_000,
        profiled in 20_000u32..1_000_000,
        profiling_queue in 0usize..20,
        optimizing_queue in 0usize..=2,
    ) {
        let policy = policy(StaticLoad::new(profiling_queue, optimizing_queue));
        let m = Method::builder(1, "P.hot()V").build();
        m.counters().invocation_counter().increment_by(invocations);

        let mut cur = CompLevel::None;
        let mut steps = 0;
        while cur != CompLevel::FullOptimization && steps < 3 {
            let next = policy.call_event(&m, cur);
            prop_assert!(next > cur, "{} -> {}", cur, next);
            cur = next;
            steps += 1;
            if cur == CompLevel::FullProfile {
                m.build_method_data().invocation_counter().increment_by(profiled);
            }
        }
        prop_assert_eq!(cur, CompLevel::FullOptimization);

        let cache = ExecutableCodeAllocator::new(CodeCacheConfig {
            capacity: 4096,
            chunk_size: 4096,
            alignment: 8,
        })
        .unwrap();
        let nm = Arc::new(CompiledMethod::new(m.id(), cur, -1, cache.allocate(16).unwrap()));
        m.install_code(Arc::clone(&nm));
        prop_assert_eq!(m.comp_level(), CompLevel::FullOptimization);
        policy.deoptimize(&nm, &[&*m], "class_check");
        prop_assert_eq!(m.comp_level(), CompLevel::None);
    }

    /// 属性测试: 训练数据与标准谓词叠加时不会超过两者各自的结果，也不会降级
    #[test]
    fn prop_training_does_not_double_dip(
        mtd in training_strategy(),
        cur in prop_oneof![
            Just(CompLevel::None),
            Just(CompLevel::LimitedProfile),
            Just(CompLevel::FullProfile),
        ],
        invocations in 0u32..20_000,
        backedges in 0u32..100_000,
        profile in prop::option::of((0u32..10_000, 0u32..60_000, any::<bool>())),
        optimizing_queue in 0usize..10,
        kind in prop_oneof![Just(EventKind::Call), Just(EventKind::Loop)],
    ) {
        let service = StaticLoad::new(0, optimizing_queue);
        let standard = policy(Arc::clone(&service));
        let mut data = TrainingData::new();
        data.insert("P.trained()V", mtd);
        let data = Arc::new(data);
        let trained = policy(service).with_training_data(Arc::clone(&data));
        let mtd = data.find("P.trained()V").unwrap();

        let m = Method::builder(1, "P.trained()V").build();
        m.counters().invocation_counter().increment_by(invocations);
        m.counters().backedge_counter().increment_by(backedges);
        if let Some((i, b, would_profile)) = profile {
            let mdo = m.build_method_data();
            mdo.invocation_counter().increment_by(i);
            mdo.backedge_counter().increment_by(b);
            mdo.set_would_profile(would_profile);
        }

        let from_training = trained.trained_transition(&m, cur, mtd);
        let from_counters = standard.transition(&m, cur, kind, false);
        let combined = trained.transition(&m, cur, kind, false);

        prop_assert!(combined >= cur, "{} regressed to {}", cur, combined);
        prop_assert!(
            combined <= from_training.max(from_counters),
            "{}: training {} counters {} combined {}",
            cur,
            from_training,
            from_counters,
            combined
        );
    }
}

#[test]
fn test_notification_points_follow_frequency() {
    let service = StaticLoad::new(0, 0);
    let model = CounterModel::new(
        Arc::new(TieredConfig {
            tier0_invoke_notify_freq_log: 4,
            tier3_invocation_threshold: 64,
            tier3_min_invocation_threshold: 32,
            ..TieredConfig::defaults()
        }),
        Arc::new(ManualClock::new(1)) as Arc<dyn VmClock>,
    );
    let policy = TieredPolicy::new(model, Arc::clone(&service) as Arc<dyn CompileService>);
    let m = Method::builder(1, "P.freq()V").build();
    for _ in 0..63 {
        policy.on_method_entry(&m);
    }
    assert_eq!(*service.requests.lock(), 0);
    policy.on_method_entry(&m);
    assert_eq!(*service.requests.lock(), 1);
}
