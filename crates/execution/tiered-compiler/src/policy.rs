//! 分层编译策略
//!
//! 在应用线程的调用与回边检查点上内联执行。根据当前层级、计数器、编译器负载
//! 以及可选的训练数据选出目标层级，并向 [`CompileService`] 提交编译请求。
//!
//! ```text
//!              call/loop                 profile mature
//!   none ───────────────────▶ full_profile ─────────────▶ full_optimization
//!     │                          ▲
//!     │ optimizing queue busy    │ queue drained
//!     └──────▶ limited_profile ──┘
//! ```
//!
//! 平凡方法与本地方法直接进入 `simple`（禁用中间层级时进入 `full_optimization`）。
//! 去优化使方法回到 `none`。

use std::sync::Arc;

use crate::broker::CompileService;
use crate::config::TieredConfig;
use crate::counter_model::CounterModel;
use crate::counters::{InvocationCounter, should_notify};
use crate::event_log::{TieredEvent, print_event};
use crate::level::{CompLevel, CompilerKind, INVOCATION_ENTRY_BCI};
use crate::method::{CompiledMethod, Method};
use crate::predicate::{EventKind, load_feedback_scale};
use crate::queue::{CompileReason, CompileTask};
use crate::training::{MethodTrainingData, TrainingData};

/// 分层编译策略
pub struct TieredPolicy {
    model: CounterModel,
    service: Arc<dyn CompileService>,
    training: Option<Arc<TrainingData>>,
}

impl TieredPolicy {
    pub fn new(model: CounterModel, service: Arc<dyn CompileService>) -> Self {
        Self {
            model,
            service,
            training: None,
        }
    }

    /// Enables trained transitions. Training data is loaded once, before
    /// any mutator thread runs.
    pub fn with_training_data(mut self, data: Arc<TrainingData>) -> Self {
        tracing::debug!(target: "tiered::training", methods = data.len(), "training data attached");
        self.training = Some(data);
        self
    }

    pub fn config(&self) -> &TieredConfig {
        self.model.config()
    }

    pub fn model(&self) -> &CounterModel {
        &self.model
    }

    pub fn service(&self) -> &Arc<dyn CompileService> {
        &self.service
    }

    pub fn have_training_data(&self) -> bool {
        self.training.is_some()
    }

    fn training_for(&self, method: &Method) -> Option<&MethodTrainingData> {
        self.training
            .as_ref()?
            .find(method.name())
            .map(Arc::as_ref)
    }

    pub fn highest_compile_level(&self) -> CompLevel {
        self.config().highest_compile_level()
    }

    /// Clamps `level` to what the mode and stop level allow.
    pub fn limit_level(&self, level: CompLevel) -> CompLevel {
        let config = self.config();
        let level = level.min(config.highest_compile_level());
        debug_assert!(
            config.mode.is_valid_level(level),
            "level {level} cannot be produced in {:?} mode",
            config.mode
        );
        level
    }

    pub fn is_compilation_enabled(&self) -> bool {
        !self.config().is_interpreter_only() && self.service.should_compile_new_jobs()
    }

    /// Load feedback factor for the compiler producing `level`.
    pub fn threshold_scale(&self, level: CompLevel, feedback_k: u32) -> f64 {
        let config = self.config();
        let pressure = (!config.mode.disable_intermediate() && level.is_c1_compile()).then(|| {
            (
                self.service.reverse_free_ratio(),
                config.increase_threshold_at_ratio(),
            )
        });
        load_feedback_scale(
            self.service.queue_size(level),
            self.service.compiler_count(level),
            feedback_k,
            pressure,
        )
    }

    /// `kind`'s predicate for leaving `level`, scaled by the load feedback
    /// of the next compiler and by `extra_scale`.
    pub fn should_transition(
        &self,
        kind: EventKind,
        method: &Method,
        level: CompLevel,
        i: u32,
        b: u32,
        extra_scale: f64,
    ) -> bool {
        let config = self.config();
        let k = match level {
            CompLevel::None if config.mode.disable_intermediate() => {
                self.threshold_scale(CompLevel::FullOptimization, config.tier4_load_feedback)
            }
            CompLevel::None | CompLevel::LimitedProfile => {
                self.threshold_scale(CompLevel::FullProfile, config.tier3_load_feedback)
            }
            CompLevel::FullProfile => {
                self.threshold_scale(CompLevel::FullOptimization, config.tier4_load_feedback)
            }
            CompLevel::Simple | CompLevel::FullOptimization => return true,
        };
        kind.should_transition(config, level, i, b, k * extra_scale, method.threshold_scaling())
    }

    fn optimizing_queue_exceeds(&self, per_thread: u32) -> bool {
        let queued = self.service.queue_size(CompLevel::FullOptimization);
        let threads = self.service.compiler_count(CompLevel::FullOptimization);
        queued > per_thread as usize * threads
    }

    fn force_simple(&self, method: &Method) -> bool {
        method.flags().force_simple && self.config().mode.uses(CompilerKind::Profiling)
    }

    /// Whether the interpreter should start collecting a profile.
    pub fn should_create_mdo(&self, method: &Method, cur: CompLevel) -> bool {
        let config = self.config();
        if cur != CompLevel::None
            || self.force_simple(method)
            || config.mode.quick_only()
            || !config.profile_interpreter
        {
            return false;
        }
        if self
            .training_for(method)
            .is_some_and(|mtd| mtd.saw_level(CompLevel::FullOptimization))
        {
            return true;
        }
        if self.model.is_old(method) {
            return true;
        }
        if self.optimizing_queue_exceeds(config.tier0_delay) {
            return false;
        }
        let (i, b) = (method.invocation_count(), method.backedge_count());
        let k = f64::from(config.tier0_profiling_start_percentage) / 100.0;
        self.should_transition(EventKind::Call, method, CompLevel::None, i, b, k)
            || self.should_transition(EventKind::Loop, method, CompLevel::None, i, b, k)
    }

    fn create_mdo(&self, method: &Method) {
        if method.is_native() || method.is_abstract() || method.is_trivial() {
            return;
        }
        method.build_method_data();
    }

    /// Target level for leaving `cur` on a `kind` event.
    pub fn transition(
        &self,
        method: &Method,
        cur: CompLevel,
        kind: EventKind,
        disable_feedback: bool,
    ) -> CompLevel {
        let next = if self.force_simple(method) {
            CompLevel::Simple
        } else if method.is_trivial() || method.is_native() {
            if self.config().mode.disable_intermediate() {
                CompLevel::FullOptimization
            } else {
                CompLevel::Simple
            }
        } else if self.have_training_data() {
            match self.training_for(method) {
                // Cold in training or the behaviour changed.
                None => self.standard_transition(method, cur, kind, false, disable_feedback),
                Some(mtd) => {
                    let next = self.trained_transition(method, cur, mtd);
                    if next == cur && !self.should_delay_standard_transition(method, cur, mtd) {
                        self.standard_transition(method, cur, kind, true, disable_feedback)
                    } else {
                        next
                    }
                }
            }
        } else {
            self.standard_transition(method, cur, kind, false, disable_feedback)
        };
        if next != cur { self.limit_level(next) } else { next }
    }

    fn standard_transition(
        &self,
        method: &Method,
        cur: CompLevel,
        kind: EventKind,
        delay_profiling: bool,
        disable_feedback: bool,
    ) -> CompLevel {
        match cur {
            CompLevel::None => {
                self.transition_from_none(method, kind, delay_profiling, disable_feedback)
            }
            CompLevel::LimitedProfile => {
                self.transition_from_limited_profile(method, kind, delay_profiling, disable_feedback)
            }
            CompLevel::FullProfile => self.transition_from_full_profile(method, kind),
            CompLevel::Simple | CompLevel::FullOptimization => cur,
        }
    }

    fn transition_from_none(
        &self,
        method: &Method,
        kind: EventKind,
        delay_profiling: bool,
        disable_feedback: bool,
    ) -> CompLevel {
        let config = self.config();
        let (i, b) = (method.invocation_count(), method.backedge_count());
        let scale = if delay_profiling {
            config.tier0_profile_delay_factor
        } else {
            1.0
        };
        // Would a full-profile method with this profile move on?
        if self.transition_from_full_profile(method, kind) == CompLevel::FullOptimization {
            return CompLevel::FullOptimization;
        }
        if !config.mode.disable_intermediate()
            && self.should_transition(kind, method, CompLevel::None, i, b, scale)
        {
            // Fully profiled code is slow; while the optimizing compiler is
            // backed up, count only.
            if delay_profiling || (!disable_feedback && self.optimizing_queue_exceeds(config.tier3_delay_on)) {
                return CompLevel::LimitedProfile;
            }
            return CompLevel::FullProfile;
        }
        CompLevel::None
    }

    fn transition_from_limited_profile(
        &self,
        method: &Method,
        kind: EventKind,
        delay_profiling: bool,
        disable_feedback: bool,
    ) -> CompLevel {
        let config = self.config();
        let (i, b) = (method.invocation_count(), method.backedge_count());
        let scale = if delay_profiling {
            config.tier2_profile_delay_factor
        } else {
            1.0
        };
        let ready_to_profile = || {
            disable_feedback
                || (!self.optimizing_queue_exceeds(config.tier3_delay_off)
                    && self.should_transition(kind, method, CompLevel::LimitedProfile, i, b, scale))
        };
        let next = match method.method_data() {
            Some(mdo) if !mdo.would_profile() => CompLevel::FullOptimization,
            _ if ready_to_profile() => CompLevel::FullProfile,
            _ => CompLevel::LimitedProfile,
        };
        if next == CompLevel::FullProfile && self.model.is_method_profiled(method) {
            return CompLevel::FullOptimization;
        }
        next
    }

    fn transition_from_full_profile(&self, method: &Method, kind: EventKind) -> CompLevel {
        let Some(mdo) = method.method_data() else {
            return CompLevel::FullProfile;
        };
        if !mdo.would_profile() && !self.config().mode.disable_intermediate() {
            return CompLevel::FullOptimization;
        }
        let (i, b) = (mdo.invocation_count_delta(), mdo.backedge_count_delta());
        if self.should_transition(kind, method, CompLevel::FullProfile, i, b, 1.0) {
            CompLevel::FullOptimization
        } else {
            CompLevel::FullProfile
        }
    }

    /// Target level derived from the training record alone; `cur` when no
    /// trained strategy applies.
    pub fn trained_transition(
        &self,
        method: &Method,
        cur: CompLevel,
        mtd: &MethodTrainingData,
    ) -> CompLevel {
        let next = match cur {
            CompLevel::None => self.trained_transition_from_none(method, mtd),
            CompLevel::LimitedProfile => self.trained_transition_from_limited_profile(method, mtd),
            CompLevel::FullProfile => self.trained_transition_from_full_profile(method, mtd),
            CompLevel::Simple | CompLevel::FullOptimization => cur,
        };
        if self.config().mode.disable_intermediate() && next < CompLevel::FullOptimization {
            return CompLevel::None;
        }
        if next != cur { self.limit_level(next) } else { next }
    }

    fn trained_transition_from_none(&self, method: &Method, mtd: &MethodTrainingData) -> CompLevel {
        let saw_full_optimization = mtd.saw_level(CompLevel::FullOptimization);
        if mtd.only_inlined && !saw_full_optimization {
            return CompLevel::None;
        }
        if saw_full_optimization && !mtd.has_profile {
            return CompLevel::FullProfile;
        }
        match mtd.highest_top_level {
            CompLevel::LimitedProfile | CompLevel::FullProfile => return CompLevel::LimitedProfile,
            CompLevel::Simple => return CompLevel::Simple,
            CompLevel::None => return CompLevel::None,
            CompLevel::FullOptimization => {}
        }
        if !mtd.has_profile {
            return CompLevel::FullProfile;
        }
        // Deoptimized since: profile again.
        if method.highest_comp_level() == CompLevel::FullOptimization
            && !self.model.is_method_profiled(method)
        {
            return CompLevel::FullProfile;
        }
        let ready = mtd
            .last_toplevel_compile(CompLevel::FullOptimization)
            .is_some_and(|ctd| ctd.deps_satisfied());
        if self.config().skip_tier2_if_possible && ready {
            self.create_mdo(method);
            return CompLevel::FullOptimization;
        }
        CompLevel::LimitedProfile
    }

    fn trained_transition_from_limited_profile(
        &self,
        method: &Method,
        mtd: &MethodTrainingData,
    ) -> CompLevel {
        if !mtd.has_profile {
            return CompLevel::FullProfile;
        }
        // Waiting for the stored optimized code to become usable.
        let ready = mtd
            .last_toplevel_compile(CompLevel::FullOptimization)
            .is_some_and(|ctd| ctd.deps_satisfied());
        if ready {
            self.create_mdo(method);
            return CompLevel::FullOptimization;
        }
        CompLevel::LimitedProfile
    }

    fn trained_transition_from_full_profile(
        &self,
        method: &Method,
        mtd: &MethodTrainingData,
    ) -> CompLevel {
        if mtd.highest_top_level == CompLevel::FullOptimization
            && !mtd.only_inlined
            && self.model.is_method_profiled(method)
        {
            return CompLevel::FullOptimization;
        }
        CompLevel::FullProfile
    }

    /// A lukewarm method (never optimized in training, now at
    /// limited_profile) stays put until its counts exceed the training counts.
    pub fn should_delay_standard_transition(
        &self,
        method: &Method,
        cur: CompLevel,
        mtd: &MethodTrainingData,
    ) -> bool {
        if mtd.highest_top_level == CompLevel::FullOptimization || cur != CompLevel::LimitedProfile {
            return false;
        }
        let counters = method.counters();
        let (inv, be) = (counters.invocation_counter(), counters.backedge_counter());
        if inv.carry() || be.carry() {
            return false;
        }
        inv.count() <= mtd.invocation_count && be.count() <= mtd.backedge_count
    }

    /// Whole-method target after a call event at `cur`.
    pub fn call_event(&self, method: &Method, cur: CompLevel) -> CompLevel {
        let osr_level = method
            .highest_osr_comp_level()
            .min(self.transition(method, cur, EventKind::Loop, true));
        let disable_feedback = !self.have_training_data() && self.model.is_old(method);
        let next = self.transition(method, cur, EventKind::Call, disable_feedback);

        // Raise the whole-method level to a full-optimization OSR version so
        // that every invocation does not OSR again.
        if osr_level == CompLevel::FullOptimization && cur == CompLevel::FullProfile {
            if method
                .method_data()
                .is_some_and(|mdo| mdo.invocation_count() >= 1)
            {
                return CompLevel::FullOptimization;
            }
            return next;
        }
        osr_level.max(next)
    }

    /// OSR target after a loop event at `cur`.
    pub fn loop_event(&self, method: &Method, cur: CompLevel) -> CompLevel {
        let next = self.transition(method, cur, EventKind::Loop, true);
        if cur == CompLevel::None {
            // A live OSR version means we deoptimized for the transition.
            let osr_level = method.highest_osr_comp_level().min(next);
            if osr_level > CompLevel::None {
                return osr_level;
            }
        }
        next
    }

    fn handle_counter_overflow(method: &Method) {
        let counters = method.counters();
        counters.invocation_counter().set_carry_on_overflow();
        counters.backedge_counter().set_carry_on_overflow();
        if let Some(mdo) = method.method_data() {
            mdo.invocation_counter().set_carry_on_overflow();
            mdo.backedge_counter().set_carry_on_overflow();
        }
    }

    /// Policy entry point for a counter notification.
    ///
    /// `method` is the method whose code raised the event at `level`;
    /// `inlinee` is the scope the counter belongs to (the same method unless
    /// the event came from inlined code). `nm` is the code that raised it.
    /// For back-edge events, returns an OSR version above `level` to migrate
    /// into, if one exists.
    pub fn event(
        &self,
        method: &Arc<Method>,
        inlinee: &Arc<Method>,
        bci: i32,
        level: CompLevel,
        nm: Option<&Arc<CompiledMethod>>,
    ) -> Option<Arc<CompiledMethod>> {
        let config = self.config();
        let event = if bci == INVOCATION_ENTRY_BCI {
            TieredEvent::Call
        } else {
            TieredEvent::Loop
        };
        print_event(config, event, method, inlinee, bci, level);

        if config.is_interpreter_only() || config.replay_compiles {
            return None;
        }

        Self::handle_counter_overflow(method);
        if !Arc::ptr_eq(method, inlinee) {
            Self::handle_counter_overflow(inlinee);
        }

        if bci == INVOCATION_ENTRY_BCI {
            self.method_invocation_event(method, level);
            return None;
        }

        self.method_back_branch_event(method, inlinee, bci, level, nm);
        let highest = inlinee.highest_osr_comp_level();
        if highest > level {
            return inlinee
                .lookup_osr(bci, highest, false)
                .filter(|osr| osr.comp_level() > level);
        }
        None
    }

    fn method_invocation_event(&self, method: &Arc<Method>, level: CompLevel) {
        if self.should_create_mdo(method, level) {
            self.create_mdo(method);
        }
        let next = self.call_event(method, level);
        if next != level
            && self.is_compilation_enabled()
            && !self.service.compilation_is_in_queue(method)
        {
            self.compile(method, INVOCATION_ENTRY_BCI, next);
        }
    }

    fn method_back_branch_event(
        &self,
        method: &Arc<Method>,
        inlinee: &Arc<Method>,
        bci: i32,
        level: CompLevel,
        nm: Option<&Arc<CompiledMethod>>,
    ) {
        if self.should_create_mdo(method, level) {
            self.create_mdo(method);
        }
        if self.should_create_mdo(inlinee, level) {
            self.create_mdo(inlinee);
        }
        if !self.is_compilation_enabled() {
            return;
        }

        let next_osr = self.loop_event(inlinee, level);
        let max_osr = inlinee.highest_osr_comp_level();
        // At the very least compile the OSR version.
        if !self.service.compilation_is_in_queue(inlinee) && next_osr != level {
            self.compile(inlinee, bci, next_osr);
        }

        // Also check whether there have been enough calls.
        if !Arc::ptr_eq(method, inlinee) {
            let Some(nm) = nm else {
                tracing::debug!(
                    target: "tiered::events",
                    method = method.name(),
                    inlinee = inlinee.name(),
                    "back-edge in inlined scope without enclosing code"
                );
                return;
            };
            let mut cur = method.comp_level();
            let mut next = self.call_event(method, cur);

            if max_osr == CompLevel::FullOptimization {
                // The inlinee OSRed to full optimization; the enclosing code
                // must not keep running the stale inlined copy.
                let make_not_entrant = if nm.is_osr() {
                    true
                } else if next != CompLevel::FullOptimization {
                    // Recompile the enclosing method without the inlinee.
                    cur = CompLevel::None;
                    true
                } else {
                    false
                };
                if make_not_entrant {
                    let osr_bci = if nm.is_osr() {
                        nm.osr_entry_bci()
                    } else {
                        INVOCATION_ENTRY_BCI
                    };
                    print_event(self.config(), TieredEvent::MakeNotEntrant, method, method, osr_bci, level);
                    nm.make_not_entrant("OSR invalidation for back branch");
                }
            }
            // Avoid a deopt when the OSR version is fully profiled.
            if next == CompLevel::LimitedProfile && max_osr == CompLevel::FullProfile {
                next = CompLevel::FullProfile;
            }
            if cur != next && !self.service.compilation_is_in_queue(method) {
                self.compile(method, INVOCATION_ENTRY_BCI, next);
            }
        } else {
            let cur = method.comp_level();
            let next = self.call_event(method, cur);
            if next != cur
                && !self.service.compilation_is_in_queue(method)
                && !method.compilation_is_complete(INVOCATION_ENTRY_BCI, next)
            {
                self.compile(method, INVOCATION_ENTRY_BCI, next);
            }
        }
    }

    fn can_be_compiled_at_all(&self, method: &Method) -> bool {
        let config = self.config();
        !method.is_abstract()
            && !(config.dont_compile_huge_methods && method.code_size() > config.huge_method_limit)
    }

    pub fn can_be_compiled(&self, method: &Method, level: CompLevel) -> bool {
        level.is_compile() && self.can_be_compiled_at_all(method) && !method.is_not_compilable(level)
    }

    pub fn can_be_osr_compiled(&self, method: &Method, level: CompLevel) -> bool {
        level.is_compile()
            && self.can_be_compiled_at_all(method)
            && !method.is_not_osr_compilable(level)
    }

    /// Requests a compile of `method` at `level` entering at `bci`.
    ///
    /// Level `none` retires the current code so the method goes back to
    /// the interpreter. When full optimization is impossible but `simple`
    /// is not, compiles at `simple` instead. Rejections are absorbed: the
    /// method keeps running as it is.
    pub fn compile(&self, method: &Arc<Method>, bci: i32, level: CompLevel) -> Option<Arc<CompileTask>> {
        if level == CompLevel::None {
            // Switch to the interpreter to profile.
            if let Some(code) = method.code() {
                code.make_not_used();
            }
            return None;
        }

        if !self.config().mode.disable_intermediate() {
            if bci == INVOCATION_ENTRY_BCI && !self.can_be_compiled(method, level) {
                if level == CompLevel::FullOptimization && self.can_be_compiled(method, CompLevel::Simple) {
                    return self.compile(method, bci, CompLevel::Simple);
                }
                return None;
            }
            if bci != INVOCATION_ENTRY_BCI && !self.can_be_osr_compiled(method, level) {
                if level == CompLevel::FullOptimization
                    && self.can_be_osr_compiled(method, CompLevel::Simple)
                {
                    if let Some(osr) = method.lookup_osr(bci, CompLevel::Simple, false) {
                        if osr.comp_level() > CompLevel::Simple {
                            osr.make_not_entrant("OSR invalidation for compiling at simple");
                        }
                    }
                    return self.compile(method, bci, CompLevel::Simple);
                }
                return None;
            }
        }
        if bci != INVOCATION_ENTRY_BCI && method.is_not_osr_compilable(level) {
            return None;
        }
        if self.service.compilation_is_in_queue(method) {
            return None;
        }

        print_event(self.config(), TieredEvent::Compile, method, method, bci, level);
        let hot_count = if bci == INVOCATION_ENTRY_BCI {
            method.invocation_count()
        } else {
            method.backedge_count()
        };
        self.model.update_rate(self.model.now(), method);
        match self
            .service
            .compile_method(method, bci, level, hot_count, CompileReason::Tiered)
        {
            Ok(task) => Some(task),
            Err(rejection) => {
                tracing::trace!(
                    target: "tiered::events",
                    method = method.name(),
                    %level,
                    bci,
                    %rejection,
                    "compile request not queued"
                );
                None
            }
        }
    }

    /// Restarts profile maturity for every scope from the trapping one
    /// outwards. Interpreter counters are reset as well.
    pub fn reprofile(&self, scopes: &[&Method]) {
        for method in scopes {
            print_event(
                self.config(),
                TieredEvent::Reprofile,
                method,
                method,
                INVOCATION_ENTRY_BCI,
                CompLevel::None,
            );
            if let Some(mdo) = method.method_data() {
                mdo.reset_start_counters();
            }
            method.counters().reset();
        }
    }

    /// Deoptimizes a frame running `nm`: the code is made not entrant, the
    /// method drops back to `none` and the scope chain is reprofiled.
    pub fn deoptimize(&self, nm: &CompiledMethod, scopes: &[&Method], reason: &str) {
        nm.make_not_entrant(reason);
        self.reprofile(scopes);
    }

    /// Bumps the counter that code at `level` maintains for `kind`.
    /// Returns whether the new count is a notification point, or `None`
    /// when code at `level` does not count.
    fn bump(&self, method: &Method, level: CompLevel, kind: EventKind) -> Option<bool> {
        let config = self.config();
        let mcs = method.counters();
        let (counters, freq_logs): ((&InvocationCounter, &InvocationCounter), (u32, u32)) =
            match level {
                CompLevel::None => {
                    let counters = match method.method_data() {
                        Some(mdo) => (mdo.invocation_counter(), mdo.backedge_counter()),
                        None => (mcs.invocation_counter(), mcs.backedge_counter()),
                    };
                    (
                        counters,
                        (config.tier0_invoke_notify_freq_log, config.tier0_backedge_notify_freq_log),
                    )
                }
                CompLevel::LimitedProfile => (
                    (mcs.invocation_counter(), mcs.backedge_counter()),
                    (config.tier2_invoke_notify_freq_log, config.tier2_backedge_notify_freq_log),
                ),
                CompLevel::FullProfile => {
                    let mdo = method.build_method_data();
                    (
                        (mdo.invocation_counter(), mdo.backedge_counter()),
                        (config.tier3_invoke_notify_freq_log, config.tier3_backedge_notify_freq_log),
                    )
                }
                CompLevel::Simple | CompLevel::FullOptimization => return None,
            };
        let (counter, freq_log) = match kind {
            EventKind::Call => (counters.0, freq_logs.0),
            EventKind::Loop => (counters.1, freq_logs.1),
        };
        Some(should_notify(counter.increment(), freq_log))
    }

    /// Invocation checkpoint in the method's current code. Counts the
    /// invocation where code at that level counts, and runs the policy on
    /// notification points.
    pub fn on_method_entry(&self, method: &Arc<Method>) {
        let nm = method.code();
        let level = nm.as_ref().map_or(CompLevel::None, |nm| nm.comp_level());
        if self.bump(method, level, EventKind::Call) == Some(true) {
            self.event(method, method, INVOCATION_ENTRY_BCI, level, nm.as_ref());
        }
    }

    /// Back-edge checkpoint at `bci` in the method's current whole-method
    /// code. Returns OSR code to continue in, if any.
    pub fn on_back_edge(&self, method: &Arc<Method>, bci: i32) -> Option<Arc<CompiledMethod>> {
        let nm = method.code();
        let level = nm.as_ref().map_or(CompLevel::None, |nm| nm.comp_level());
        if self.bump(method, level, EventKind::Loop) == Some(true) {
            return self.event(method, method, bci, level, nm.as_ref());
        }
        None
    }
}

impl std::fmt::Debug for TieredPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TieredPolicy")
            .field("mode", &self.config().mode)
            .field("highest_compile_level", &self.highest_compile_level())
            .field("training", &self.have_training_data())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, VmClock};
    use crate::error::CompileRejection;
    use crate::level::CompilationMode;
    use crate::method::MethodFlags;
    use crate::training::TrainedCompile;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use vm_core::Config;

    #[derive(Default)]
    struct FakeService {
        optimizing_queue: AtomicUsize,
        submitted: Mutex<Vec<(String, i32, CompLevel)>>,
        next_id: AtomicU64,
    }

    impl CompileService for FakeService {
        fn queue_size(&self, level: CompLevel) -> usize {
            if level == CompLevel::FullOptimization {
                self.optimizing_queue.load(Ordering::Relaxed)
            } else {
                0
            }
        }

        fn compiler_count(&self, level: CompLevel) -> usize {
            usize::from(level.is_compile())
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
            if !method.try_set_queued_for_compilation() {
                return Err(CompileRejection::AlreadyQueued);
            }
            self.submitted
                .lock()
                .push((method.name().to_string(), osr_bci, level));
            Ok(Arc::new(CompileTask::new(
                self.next_id.fetch_add(1, Ordering::Relaxed),
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

    fn policy_with(config: TieredConfig) -> (TieredPolicy, Arc<FakeService>) {
        let service = Arc::new(FakeService::default());
        let model = CounterModel::new(
            Arc::new(config),
            Arc::new(ManualClock::new(1)) as Arc<dyn VmClock>,
        );
        (TieredPolicy::new(model, service.clone()), service)
    }

    fn policy() -> (TieredPolicy, Arc<FakeService>) {
        policy_with(TieredConfig::defaults())
    }

    #[test]
    fn test_none_to_full_profile() {
        let (policy, _) = policy();
        let m = Method::builder(1, "A.f()V").build();
        m.counters().invocation_counter().increment_by(199);
        assert_eq!(policy.call_event(&m, CompLevel::None), CompLevel::None);
        m.counters().invocation_counter().increment();
        assert_eq!(policy.call_event(&m, CompLevel::None), CompLevel::FullProfile);
    }

    #[test]
    fn test_busy_optimizer_selects_limited_profile() {
        let (policy, service) = policy();
        let m = Method::builder(1, "A.f()V").build();
        m.counters().invocation_counter().increment_by(400);
        // above tier3_delay_on per optimizing thread
        service.optimizing_queue.store(6, Ordering::Relaxed);
        assert_eq!(policy.call_event(&m, CompLevel::None), CompLevel::LimitedProfile);

        // from limited: stays while the queue is above delay_off
        assert_eq!(
            policy.call_event(&m, CompLevel::LimitedProfile),
            CompLevel::LimitedProfile
        );
        service.optimizing_queue.store(2, Ordering::Relaxed);
        assert_eq!(
            policy.call_event(&m, CompLevel::LimitedProfile),
            CompLevel::FullProfile
        );
    }

    #[test]
    fn test_full_profile_to_full_optimization() {
        let (policy, _) = policy();
        let m = Method::builder(1, "A.f()V").build();
        let mdo = m.build_method_data();
        mdo.invocation_counter().increment_by(4999);
        assert_eq!(policy.call_event(&m, CompLevel::FullProfile), CompLevel::FullProfile);
        mdo.invocation_counter().increment();
        assert_eq!(
            policy.call_event(&m, CompLevel::FullProfile),
            CompLevel::FullOptimization
        );
    }

    #[test]
    fn test_would_not_profile_skips_ahead() {
        let (policy, _) = policy();
        let m = Method::builder(1, "A.f()V").build();
        m.build_method_data().set_would_profile(false);
        assert_eq!(
            policy.call_event(&m, CompLevel::LimitedProfile),
            CompLevel::FullOptimization
        );
    }

    #[test]
    fn test_trivial_and_native() {
        let (policy, _) = policy();
        let getter = Method::builder(1, "A.getX()I")
            .flags(MethodFlags {
                is_accessor: true,
                ..Default::default()
            })
            .build();
        assert_eq!(policy.call_event(&getter, CompLevel::None), CompLevel::Simple);

        let (high, _) = policy_with(TieredConfig {
            mode: CompilationMode::HighOnly,
            ..TieredConfig::defaults()
        });
        let native = Method::builder(2, "A.n()V")
            .flags(MethodFlags {
                is_native: true,
                ..Default::default()
            })
            .build();
        assert_eq!(high.call_event(&native, CompLevel::None), CompLevel::FullOptimization);
    }

    #[test]
    fn test_quick_only_clamps_to_simple() {
        let (policy, _) = policy_with(TieredConfig {
            mode: CompilationMode::QuickOnly,
            ..TieredConfig::defaults()
        });
        let m = Method::builder(1, "A.f()V").build();
        m.counters().invocation_counter().increment_by(500);
        assert_eq!(policy.call_event(&m, CompLevel::None), CompLevel::Simple);
        assert!(!policy.should_create_mdo(&m, CompLevel::None));
    }

    #[test]
    fn test_should_create_mdo_at_start_percentage() {
        let (policy, service) = policy();
        let m = Method::builder(1, "A.f()V").build();
        m.counters().invocation_counter().increment_by(399);
        assert!(!policy.should_create_mdo(&m, CompLevel::None));
        m.counters().invocation_counter().increment();
        assert!(policy.should_create_mdo(&m, CompLevel::None));
        assert!(!policy.should_create_mdo(&m, CompLevel::LimitedProfile));
        service.optimizing_queue.store(21, Ordering::Relaxed);
        assert!(!policy.should_create_mdo(&m, CompLevel::None));
    }

    #[test]
    fn test_loop_event_prefers_live_osr() {
        let (policy, _) = policy();
        let cache = vm_core::ExecutableCodeAllocator::new(vm_core::CodeCacheConfig {
            capacity: 64 * 1024,
            chunk_size: 4096,
            alignment: 8,
        })
        .unwrap();
        let m = Method::builder(1, "A.loop()V").build();
        m.counters().backedge_counter().increment_by(60_000);
        assert_eq!(policy.loop_event(&m, CompLevel::None), CompLevel::FullProfile);
        m.install_code(Arc::new(CompiledMethod::new(
            m.id(),
            CompLevel::LimitedProfile,
            10,
            cache.allocate(16).unwrap(),
        )));
        assert_eq!(policy.loop_event(&m, CompLevel::None), CompLevel::LimitedProfile);
    }

    #[test]
    fn test_call_event_follows_full_optimization_osr() {
        let (policy, _) = policy();
        let cache = vm_core::ExecutableCodeAllocator::new(vm_core::CodeCacheConfig {
            capacity: 64 * 1024,
            chunk_size: 4096,
            alignment: 8,
        })
        .unwrap();
        let m = Method::builder(1, "A.osr()V").build();
        m.install_code(Arc::new(CompiledMethod::new(
            m.id(),
            CompLevel::FullOptimization,
            12,
            cache.allocate(16).unwrap(),
        )));
        let mdo = m.build_method_data();
        mdo.backedge_counter().increment_by(40_000);

        // the call predicate alone keeps the method profiling
        assert_eq!(
            policy.transition(&m, CompLevel::FullProfile, EventKind::Call, false),
            CompLevel::FullProfile
        );
        // not invoked since profiling started: no equalization yet
        assert_eq!(policy.call_event(&m, CompLevel::FullProfile), CompLevel::FullProfile);

        mdo.invocation_counter().increment();
        assert_eq!(
            policy.call_event(&m, CompLevel::FullProfile),
            CompLevel::FullOptimization
        );
    }

    #[test]
    fn test_inlinee_osr_invalidates_enclosing_osr_code() {
        let (policy, _) = policy();
        let cache = vm_core::ExecutableCodeAllocator::new(vm_core::CodeCacheConfig {
            capacity: 64 * 1024,
            chunk_size: 4096,
            alignment: 8,
        })
        .unwrap();
        let outer = Method::builder(1, "A.outer()V").build();
        let inlinee = Method::builder(2, "A.inner()V").build();

        let inner_osr = Arc::new(CompiledMethod::new(
            inlinee.id(),
            CompLevel::FullOptimization,
            7,
            cache.allocate(16).unwrap(),
        ));
        inlinee.install_code(Arc::clone(&inner_osr));
        let outer_osr = Arc::new(CompiledMethod::new(
            outer.id(),
            CompLevel::FullProfile,
            30,
            cache.allocate(16).unwrap(),
        ));
        outer.install_code(Arc::clone(&outer_osr));

        let migrate = policy.event(&outer, &inlinee, 7, CompLevel::FullProfile, Some(&outer_osr));
        assert_eq!(outer_osr.state(), crate::method::CodeState::NotEntrant);
        assert!(inner_osr.is_in_use());
        assert!(migrate.is_some_and(|nm| Arc::ptr_eq(&nm, &inner_osr)));
    }

    #[test]
    fn test_invocation_event_submits_compile() {
        let (policy, service) = policy();
        let m = Method::builder(1, "A.f()V").build();
        m.counters().invocation_counter().increment_by(250);
        assert!(policy.event(&m, &m, INVOCATION_ENTRY_BCI, CompLevel::None, None).is_none());
        assert_eq!(
            service.submitted.lock().as_slice(),
            &[("A.f()V".to_string(), INVOCATION_ENTRY_BCI, CompLevel::FullProfile)]
        );
        // already queued: nothing new
        policy.event(&m, &m, INVOCATION_ENTRY_BCI, CompLevel::None, None);
        assert_eq!(service.submitted.lock().len(), 1);
    }

    #[test]
    fn test_replay_mode_is_inert() {
        let (policy, service) = policy_with(TieredConfig {
            replay_compiles: true,
            ..TieredConfig::defaults()
        });
        let m = Method::builder(1, "A.f()V").build();
        m.counters().invocation_counter().increment_by(10_000);
        policy.event(&m, &m, INVOCATION_ENTRY_BCI, CompLevel::None, None);
        assert!(service.submitted.lock().is_empty());
    }

    #[test]
    fn test_compile_falls_back_to_simple() {
        let (policy, service) = policy();
        let m = Method::builder(1, "A.f()V").build();
        m.set_not_compilable(CompLevel::FullOptimization, "test");
        policy.compile(&m, INVOCATION_ENTRY_BCI, CompLevel::FullOptimization);
        assert_eq!(service.submitted.lock()[0].2, CompLevel::Simple);
    }

    #[test]
    fn test_trained_warm_start() {
        let mut data = TrainingData::new();
        data.insert(
            "A.hot()V",
            MethodTrainingData {
                levels_seen: vec![CompLevel::FullProfile, CompLevel::FullOptimization],
                highest_top_level: CompLevel::FullOptimization,
                has_profile: true,
                full_optimization_compile: Some(TrainedCompile::new(CompLevel::FullOptimization, 1)),
                ..Default::default()
            },
        );
        let data = Arc::new(data);
        let (policy, _) = policy_with(TieredConfig {
            skip_tier2_if_possible: true,
            ..TieredConfig::defaults()
        });
        let policy = policy.with_training_data(Arc::clone(&data));
        let m = Method::builder(1, "A.hot()V").build();

        // dependencies outstanding: limited profile while waiting
        assert_eq!(policy.call_event(&m, CompLevel::None), CompLevel::LimitedProfile);
        assert!(policy.should_create_mdo(&m, CompLevel::None));

        let ctd = data
            .find("A.hot()V")
            .and_then(|mtd| mtd.last_toplevel_compile(CompLevel::FullOptimization))
            .unwrap();
        ctd.dependency_initialized();
        assert_eq!(policy.call_event(&m, CompLevel::None), CompLevel::FullOptimization);
        assert!(m.method_data().is_some());
        assert_eq!(
            policy.call_event(&m, CompLevel::LimitedProfile),
            CompLevel::FullOptimization
        );
    }

    #[test]
    fn test_lukewarm_method_delayed() {
        let mut data = TrainingData::new();
        data.insert(
            "A.warm()V",
            MethodTrainingData {
                levels_seen: vec![CompLevel::LimitedProfile],
                highest_top_level: CompLevel::LimitedProfile,
                has_profile: true,
                invocation_count: 1000,
                ..Default::default()
            },
        );
        let (policy, _) = policy();
        let policy = policy.with_training_data(Arc::new(data));
        let m = Method::builder(1, "A.warm()V").build();
        let mtd = policy.training_for(&m).unwrap();
        m.counters().invocation_counter().increment_by(900);
        assert!(policy.should_delay_standard_transition(&m, CompLevel::LimitedProfile, mtd));
        assert_eq!(
            policy.call_event(&m, CompLevel::LimitedProfile),
            CompLevel::LimitedProfile
        );
        m.counters().invocation_counter().increment_by(200);
        assert!(!policy.should_delay_standard_transition(&m, CompLevel::LimitedProfile, mtd));
    }

    #[test]
    fn test_reprofile_resets_counters() {
        let (policy, _) = policy();
        let outer = Method::builder(1, "A.outer()V").build();
        let inner = Method::builder(2, "A.inner()V").build();
        for m in [&outer, &inner] {
            m.counters().invocation_counter().increment_by(300);
            m.build_method_data().invocation_counter().increment_by(6000);
        }
        policy.reprofile(&[&*inner, &*outer]);
        for m in [&outer, &inner] {
            assert_eq!(m.counters().invocation_counter().count(), 0);
            assert_eq!(m.method_data().unwrap().invocation_count_delta(), 0);
            assert!(!policy.model().is_method_profiled(m));
        }
    }

    #[test]
    fn test_checkpoint_notifies_at_frequency() {
        let (policy, service) = policy_with(TieredConfig {
            tier0_invoke_notify_freq_log: 3,
            tier3_invocation_threshold: 16,
            tier3_min_invocation_threshold: 8,
            ..TieredConfig::defaults()
        });
        let m = Method::builder(1, "A.f()V").build();
        for _ in 0..15 {
            policy.on_method_entry(&m);
        }
        assert!(service.submitted.lock().is_empty());
        policy.on_method_entry(&m);
        assert_eq!(service.submitted.lock().len(), 1);
        assert_eq!(m.counters().invocation_counter().count(), 16);
    }
}
