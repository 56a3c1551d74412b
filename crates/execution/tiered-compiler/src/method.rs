//! 方法与已编译代码
//!
//! [`Method`] 持有自身的计数器、可选的剖析数据、当前整方法代码，以及按
//! (bci, level) 索引的 OSR 版本表。已编译代码不反向引用方法；查找一律经由方法的表。

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::{Mutex, RwLock};
use vm_core::CodeRegion;

use crate::counters::{InvocationCounter, MethodCounters, MethodData};
use crate::level::{CompLevel, CompilerKind, INVOCATION_ENTRY_BCI};

/// Stable method identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodId(pub u64);

impl fmt::Display for MethodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Static properties from class loading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MethodFlags {
    pub is_abstract: bool,
    pub is_native: bool,
    /// Field getter or setter.
    pub is_accessor: bool,
    /// Body is a bare return.
    pub is_empty: bool,
    /// Returns a constant.
    pub is_constant_getter: bool,
    /// Always compiled at `simple`, never profiled.
    pub force_simple: bool,
}

/// Lifecycle of installed code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CodeState {
    InUse = 0,
    /// New calls may not enter; activations may finish.
    NotEntrant = 1,
    /// Retired without deoptimizing activations (switch to interpreter).
    NotUsed = 2,
}

/// Installed machine code for one method at one level.
pub struct CompiledMethod {
    method: MethodId,
    level: CompLevel,
    entry_bci: i32,
    region: CodeRegion,
    state: AtomicU8,
}

impl CompiledMethod {
    pub fn new(method: MethodId, level: CompLevel, entry_bci: i32, region: CodeRegion) -> Self {
        Self {
            method,
            level,
            entry_bci,
            region,
            state: AtomicU8::new(CodeState::InUse as u8),
        }
    }

    pub fn method(&self) -> MethodId {
        self.method
    }

    pub fn comp_level(&self) -> CompLevel {
        self.level
    }

    pub fn is_osr(&self) -> bool {
        self.entry_bci != INVOCATION_ENTRY_BCI
    }

    pub fn osr_entry_bci(&self) -> i32 {
        self.entry_bci
    }

    pub fn entry_point(&self) -> usize {
        self.region.begin()
    }

    pub fn region(&self) -> &CodeRegion {
        &self.region
    }

    pub fn state(&self) -> CodeState {
        match self.state.load(Ordering::Acquire) {
            0 => CodeState::InUse,
            1 => CodeState::NotEntrant,
            _ => CodeState::NotUsed,
        }
    }

    pub fn is_in_use(&self) -> bool {
        self.state() == CodeState::InUse
    }

    /// Returns false if the code was already retired.
    pub fn make_not_entrant(&self, reason: &str) -> bool {
        self.retire(CodeState::NotEntrant, reason)
    }

    pub fn make_not_used(&self) -> bool {
        self.retire(CodeState::NotUsed, "switch to interpreter")
    }

    fn retire(&self, state: CodeState, reason: &str) -> bool {
        let retired = self
            .state
            .compare_exchange(
                CodeState::InUse as u8,
                state as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if retired {
            tracing::debug!(
                target: "tiered::code",
                method = %self.method,
                level = %self.level,
                bci = self.entry_bci,
                ?state,
                reason,
                "compiled code retired"
            );
        }
        retired
    }
}

impl fmt::Debug for CompiledMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledMethod")
            .field("method", &self.method)
            .field("level", &self.level)
            .field("entry_bci", &self.entry_bci)
            .field("entry", &format_args!("{:#x}", self.entry_point()))
            .field("state", &self.state())
            .finish()
    }
}

#[derive(Debug, Default)]
struct NotCompilable {
    profiling: AtomicBool,
    optimizing: AtomicBool,
}

impl NotCompilable {
    fn cell(&self, kind: CompilerKind) -> &AtomicBool {
        match kind {
            CompilerKind::Profiling => &self.profiling,
            CompilerKind::Optimizing => &self.optimizing,
        }
    }
}

/// Method metadata as seen by the policy.
pub struct Method {
    id: MethodId,
    name: String,
    code_size: u32,
    flags: MethodFlags,
    /// Per-method multiplier for every threshold.
    threshold_scaling: Option<f64>,
    counters: MethodCounters,
    method_data: OnceLock<MethodData>,
    code: RwLock<Option<Arc<CompiledMethod>>>,
    osr_code: Mutex<Vec<Arc<CompiledMethod>>>,
    not_compilable: NotCompilable,
    not_osr_compilable: NotCompilable,
    queued_for_compilation: AtomicBool,
    unloaded: AtomicBool,
}

impl Method {
    pub fn builder(id: u64, name: impl Into<String>) -> MethodBuilder {
        MethodBuilder {
            id: MethodId(id),
            name: name.into(),
            code_size: 32,
            flags: MethodFlags::default(),
            threshold_scaling: None,
        }
    }

    pub fn id(&self) -> MethodId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn code_size(&self) -> u32 {
        self.code_size
    }

    pub fn flags(&self) -> MethodFlags {
        self.flags
    }

    pub fn is_abstract(&self) -> bool {
        self.flags.is_abstract
    }

    pub fn is_native(&self) -> bool {
        self.flags.is_native
    }

    /// Not worth profiling: accessors, empty methods and constant getters.
    pub fn is_trivial(&self) -> bool {
        self.flags.is_accessor || self.flags.is_empty || self.flags.is_constant_getter
    }

    pub fn threshold_scaling(&self) -> Option<f64> {
        self.threshold_scaling
    }

    pub fn counters(&self) -> &MethodCounters {
        &self.counters
    }

    pub fn method_data(&self) -> Option<&MethodData> {
        self.method_data.get()
    }

    /// Creates the profile record if it does not exist yet.
    pub fn build_method_data(&self) -> &MethodData {
        self.method_data.get_or_init(|| {
            tracing::trace!(target: "tiered::profile", method = %self.name, "method data created");
            MethodData::new()
        })
    }

    fn combined_count(
        &self,
        counter: fn(&MethodCounters) -> &InvocationCounter,
        mdo_counter: fn(&MethodData) -> &InvocationCounter,
    ) -> u32 {
        let mcs = counter(&self.counters);
        let mdo = self.method_data().map(mdo_counter);
        if mcs.carry() || mdo.is_some_and(InvocationCounter::carry) {
            return InvocationCounter::COUNT_LIMIT;
        }
        mcs.count()
            .saturating_add(mdo.map_or(0, InvocationCounter::count))
            .min(InvocationCounter::COUNT_LIMIT)
    }

    /// Interpreter and profile invocations combined.
    pub fn invocation_count(&self) -> u32 {
        self.combined_count(
            MethodCounters::invocation_counter,
            MethodData::invocation_counter,
        )
    }

    pub fn backedge_count(&self) -> u32 {
        self.combined_count(MethodCounters::backedge_counter, MethodData::backedge_counter)
    }

    pub fn highest_comp_level(&self) -> CompLevel {
        self.counters.highest_comp_level()
    }

    pub fn highest_osr_comp_level(&self) -> CompLevel {
        self.counters.highest_osr_comp_level()
    }

    /// Current whole-method code, if any and still entrant.
    pub fn code(&self) -> Option<Arc<CompiledMethod>> {
        self.code
            .read()
            .as_ref()
            .filter(|nm| nm.is_in_use())
            .cloned()
    }

    pub fn has_compiled_code(&self) -> bool {
        self.code().is_some()
    }

    /// Level of the current whole-method code; `none` when interpreted.
    pub fn comp_level(&self) -> CompLevel {
        self.code()
            .map_or(CompLevel::None, |nm| nm.comp_level())
    }

    /// Installs compiled code and returns what it replaced.
    pub fn install_code(&self, nm: Arc<CompiledMethod>) -> Option<Arc<CompiledMethod>> {
        if nm.is_osr() {
            self.counters.note_osr_comp_level(nm.comp_level());
            let mut osr = self.osr_code.lock();
            let replaced = osr
                .iter()
                .position(|old| {
                    old.osr_entry_bci() == nm.osr_entry_bci() && old.comp_level() == nm.comp_level()
                })
                .map(|i| osr.swap_remove(i));
            osr.push(nm);
            replaced
        } else {
            self.counters.note_comp_level(nm.comp_level());
            self.code.write().replace(nm)
        }
    }

    /// Best entrant OSR version at `bci`: exactly `level` when
    /// `match_level`, otherwise the highest at or above `level`.
    pub fn lookup_osr(&self, bci: i32, level: CompLevel, match_level: bool) -> Option<Arc<CompiledMethod>> {
        self.osr_code
            .lock()
            .iter()
            .filter(|nm| nm.is_in_use() && nm.osr_entry_bci() == bci)
            .filter(|nm| {
                if match_level {
                    nm.comp_level() == level
                } else {
                    nm.comp_level() >= level
                }
            })
            .max_by_key(|nm| nm.comp_level())
            .cloned()
    }

    /// Every installed version, entrant or not.
    pub fn all_code(&self) -> Vec<Arc<CompiledMethod>> {
        let mut all: Vec<_> = self.code.read().iter().cloned().collect();
        all.extend(self.osr_code.lock().iter().cloned());
        all
    }

    /// Drops retired OSR versions and returns them.
    pub fn purge_retired_osr(&self) -> Vec<Arc<CompiledMethod>> {
        let mut osr = self.osr_code.lock();
        let (live, retired): (Vec<_>, Vec<_>) = osr.drain(..).partition(|nm| nm.is_in_use());
        *osr = live;
        retired
    }

    pub fn is_not_compilable(&self, level: CompLevel) -> bool {
        level
            .compiler()
            .is_none_or(|kind| self.not_compilable.cell(kind).load(Ordering::Relaxed))
    }

    pub fn is_not_osr_compilable(&self, level: CompLevel) -> bool {
        self.is_not_compilable(level)
            || level
                .compiler()
                .is_none_or(|kind| self.not_osr_compilable.cell(kind).load(Ordering::Relaxed))
    }

    pub fn set_not_compilable(&self, level: CompLevel, reason: &str) {
        if let Some(kind) = level.compiler() {
            if !self.not_compilable.cell(kind).swap(true, Ordering::Relaxed) {
                tracing::debug!(target: "tiered::code", method = %self.name, %kind, reason, "method not compilable");
            }
        }
    }

    pub fn set_not_osr_compilable(&self, level: CompLevel, reason: &str) {
        if let Some(kind) = level.compiler() {
            if !self.not_osr_compilable.cell(kind).swap(true, Ordering::Relaxed) {
                tracing::debug!(target: "tiered::code", method = %self.name, %kind, reason, "method not OSR compilable");
            }
        }
    }

    /// Whether `level` code at `bci` is already there (or never will be).
    pub fn compilation_is_complete(&self, bci: i32, level: CompLevel) -> bool {
        if bci != INVOCATION_ENTRY_BCI {
            self.is_not_osr_compilable(level) || self.lookup_osr(bci, level, true).is_some()
        } else {
            self.is_not_compilable(level) || self.code().is_some_and(|nm| nm.comp_level() == level)
        }
    }

    pub fn queued_for_compilation(&self) -> bool {
        self.queued_for_compilation.load(Ordering::Acquire)
    }

    /// Returns false if the method was already queued.
    pub fn try_set_queued_for_compilation(&self) -> bool {
        !self.queued_for_compilation.swap(true, Ordering::AcqRel)
    }

    pub fn clear_queued_for_compilation(&self) {
        self.queued_for_compilation.store(false, Ordering::Release);
    }

    pub fn is_unloaded(&self) -> bool {
        self.unloaded.load(Ordering::Acquire)
    }

    pub(crate) fn mark_unloaded(&self) -> bool {
        !self.unloaded.swap(true, Ordering::AcqRel)
    }
}

impl fmt::Debug for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Method")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("comp_level", &self.comp_level())
            .field("invocations", &self.invocation_count())
            .field("backedges", &self.backedge_count())
            .finish()
    }
}

pub struct MethodBuilder {
    id: MethodId,
    name: String,
    code_size: u32,
    flags: MethodFlags,
    threshold_scaling: Option<f64>,
}

impl MethodBuilder {
    pub fn code_size(mut self, bytes: u32) -> Self {
        self.code_size = bytes;
        self
    }

    pub fn flags(mut self, flags: MethodFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn threshold_scaling(mut self, scale: f64) -> Self {
        self.threshold_scaling = Some(scale);
        self
    }

    pub fn build(self) -> Arc<Method> {
        Arc::new(Method {
            id: self.id,
            name: self.name,
            code_size: self.code_size,
            flags: self.flags,
            threshold_scaling: self.threshold_scaling,
            counters: MethodCounters::new(),
            method_data: OnceLock::new(),
            code: RwLock::new(None),
            osr_code: Mutex::new(Vec::new()),
            not_compilable: NotCompilable::default(),
            not_osr_compilable: NotCompilable::default(),
            queued_for_compilation: AtomicBool::new(false),
            unloaded: AtomicBool::new(false),
        })
    }
}
