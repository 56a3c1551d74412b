//! 分派桩代码生成
//!
//! 每个 (kind, slot index) 生成一个跳板。入口处接收者位于 `rsi`，itable 桩的
//! IC holder 位于 `rax`；跳转到目标时选中的 `Method*` 位于 `rbx`。
//!
//! 每个桩记录两个故障偏移：加载接收者 klass 的指令（故障表示接收者为空），
//! 以及经方法入口点的最终间接跳转（故障表示方法槽为空，即抽象方法）。

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use vm_core::ExecutableCodeAllocator;

use crate::asm::{Assembler, Cond, Label, Mem, Reg, Scale};
use crate::config::{Instrumentation, RuntimeHandlers, StubGeneratorConfig};
use crate::error::StubError;
use crate::layout::{
    IC_HOLDER_DECLARING_OFFSET, IC_HOLDER_REG, IC_HOLDER_RESOLVED_OFFSET,
    ITABLE_INTERFACE_OFFSET, ITABLE_OFFSET_ENTRY_SIZE, ITABLE_OFFSET_OFFSET,
    KLASS_VTABLE_LENGTH_OFFSET, KLASS_VTABLE_START_OFFSET, MAX_SLOT_INDEX,
    METHOD_FROM_COMPILED_OFFSET, METHOD_REG, OBJECT_KLASS_OFFSET, RECEIVER_REG,
    itable_method_offset, vtable_entry_offset,
};
use crate::size_model;
use crate::stub::{DispatchStub, StubKind};

/// Per-kind entry counters bumped by instrumented stubs.
#[derive(Debug, Default)]
#[repr(C)]
pub struct CallCounters {
    vtable: AtomicU64,
    itable: AtomicU64,
}

impl CallCounters {
    fn cell(&self, kind: StubKind) -> &AtomicU64 {
        match kind {
            StubKind::Vtable => &self.vtable,
            StubKind::Itable => &self.itable,
        }
    }
}

/// Generation bookkeeping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GeneratorStats {
    pub vtable_stubs: u64,
    pub itable_stubs: u64,
    pub code_bytes: u64,
    pub slop_bytes: u64,
}

#[derive(Debug, Default)]
struct GeneratorCounters {
    vtable_stubs: AtomicU64,
    itable_stubs: AtomicU64,
    code_bytes: AtomicU64,
    slop_bytes: AtomicU64,
}

struct Emitted {
    code: Vec<u8>,
    npe_offset: usize,
    ame_offset: usize,
}

pub struct StubGenerator {
    config: StubGeneratorConfig,
    code_cache: Arc<ExecutableCodeAllocator>,
    // Boxed: instrumented stubs embed the counter addresses.
    call_counters: Box<CallCounters>,
    counters: GeneratorCounters,
}

impl StubGenerator {
    pub fn new(config: StubGeneratorConfig, code_cache: Arc<ExecutableCodeAllocator>) -> Self {
        Self {
            config,
            code_cache,
            call_counters: Box::default(),
            counters: GeneratorCounters::default(),
        }
    }

    pub fn config(&self) -> &StubGeneratorConfig {
        &self.config
    }

    pub fn instrumentation(&self) -> Instrumentation {
        self.config.instrumentation
    }

    pub fn handlers(&self) -> RuntimeHandlers {
        self.config.handlers
    }

    pub fn code_cache(&self) -> &Arc<ExecutableCodeAllocator> {
        &self.code_cache
    }

    /// Address of the counter an instrumented stub of `kind` increments.
    pub fn call_counter_address(&self, kind: StubKind) -> u64 {
        self.call_counters.cell(kind) as *const AtomicU64 as usize as u64
    }

    /// Calls counted by instrumented stubs executed natively.
    pub fn call_count(&self, kind: StubKind) -> u64 {
        self.call_counters.cell(kind).load(Ordering::Relaxed)
    }

    /// Bytes reserved per stub of `kind` under the current instrumentation.
    pub fn reserved_size(&self, kind: StubKind) -> usize {
        size_model::reserved_size(kind, self.config.instrumentation)
    }

    /// Generates a stub into freshly allocated code cache memory.
    ///
    /// Code cache exhaustion is reported as [`StubError::CodeCacheFull`];
    /// nothing is retained in that case.
    ///
    /// # Panics
    ///
    /// If the emitted code exceeds the reservation from the size model.
    pub fn generate(&self, kind: StubKind, index: u32) -> Result<DispatchStub, StubError> {
        if index > MAX_SLOT_INDEX {
            return Err(StubError::IndexOutOfRange {
                kind,
                index,
                max: MAX_SLOT_INDEX,
            });
        }

        let instrumentation = self.config.instrumentation;
        let reserved = size_model::reserved_size(kind, instrumentation);
        let mut region = self.code_cache.allocate(reserved)?;

        let emitted = match kind {
            StubKind::Vtable => self.emit_vtable_stub(index),
            StubKind::Itable => self.emit_itable_stub(index),
        };
        size_model::check_fits(kind, index, emitted.code.len(), reserved);
        debug_assert_eq!(
            emitted.code.len(),
            size_model::exact_size(kind, index, instrumentation),
            "size model out of sync for {kind} stub #{index}"
        );
        region.write(&emitted.code)?;

        let code_len = emitted.code.len();
        let slop = region.len() - code_len;
        match kind {
            StubKind::Vtable => self.counters.vtable_stubs.fetch_add(1, Ordering::Relaxed),
            StubKind::Itable => self.counters.itable_stubs.fetch_add(1, Ordering::Relaxed),
        };
        self.counters
            .code_bytes
            .fetch_add(code_len as u64, Ordering::Relaxed);
        self.counters
            .slop_bytes
            .fetch_add(slop as u64, Ordering::Relaxed);

        tracing::trace!(
            target: "dispatch::stubs",
            %kind,
            index,
            entry = format_args!("{:#x}", region.begin()),
            size = code_len,
            slop,
            npe = emitted.npe_offset,
            ame = emitted.ame_offset,
            "generated dispatch stub"
        );

        Ok(DispatchStub::new(
            kind,
            index,
            emitted.npe_offset as u32,
            emitted.ame_offset as u32,
            code_len as u32,
            region,
        ))
    }

    pub fn stats(&self) -> GeneratorStats {
        GeneratorStats {
            vtable_stubs: self.counters.vtable_stubs.load(Ordering::Relaxed),
            itable_stubs: self.counters.itable_stubs.load(Ordering::Relaxed),
            code_bytes: self.counters.code_bytes.load(Ordering::Relaxed),
            slop_bytes: self.counters.slop_bytes.load(Ordering::Relaxed),
        }
    }

    fn emit_call_counter(&self, asm: &mut Assembler, kind: StubKind) {
        if self.config.instrumentation.count_calls {
            asm.mov_imm64(Reg::R11, self.call_counter_address(kind));
            asm.inc_mem64(Mem::base(Reg::R11, 0));
        }
    }

    /// Traps when the vtable slot holds a method without an entry point.
    /// A null slot falls through to the final jump and faults there.
    fn emit_entry_point_check(&self, asm: &mut Assembler) {
        if !self.config.instrumentation.debug_checks {
            return;
        }
        let ok = asm.new_label();
        asm.test_rr(METHOD_REG, METHOD_REG);
        asm.jcc(Cond::Equal, ok);
        asm.cmp_mem64_imm8(Mem::base(METHOD_REG, METHOD_FROM_COMPILED_OFFSET), 0);
        asm.jcc(Cond::NotEqual, ok);
        asm.ud2();
        asm.bind(ok);
    }

    fn emit_vtable_stub(&self, index: u32) -> Emitted {
        let mut asm = Assembler::new();
        let klass = Reg::Rax;

        self.emit_call_counter(&mut asm, StubKind::Vtable);

        let npe_offset = asm.pc();
        asm.mov_load64(klass, Mem::base(RECEIVER_REG, OBJECT_KLASS_OFFSET));

        if self.config.instrumentation.debug_checks {
            let in_bounds = asm.new_label();
            asm.cmp_mem32_imm32(Mem::base(klass, KLASS_VTABLE_LENGTH_OFFSET), index);
            asm.jcc(Cond::Greater, in_bounds);
            asm.mov_imm32(METHOD_REG, index);
            asm.mov_imm64(Reg::R11, self.config.handlers.bad_vtable_index);
            asm.jmp_reg(Reg::R11);
            asm.bind(in_bounds);
        }

        asm.mov_load64(METHOD_REG, Mem::base(klass, vtable_entry_offset(index)));

        self.emit_entry_point_check(&mut asm);

        let ame_offset = asm.pc();
        asm.jmp_mem(Mem::base(METHOD_REG, METHOD_FROM_COMPILED_OFFSET));

        Emitted {
            code: asm.finish(),
            npe_offset,
            ame_offset,
        }
    }

    fn emit_itable_stub(&self, index: u32) -> Emitted {
        let mut asm = Assembler::new();
        let recv_klass = Reg::R10;
        let resolved = Reg::R14;
        let declaring = IC_HOLDER_REG;
        let no_such_interface = asm.new_label();

        self.emit_call_counter(&mut asm, StubKind::Itable);

        asm.mov_load64(resolved, Mem::base(IC_HOLDER_REG, IC_HOLDER_RESOLVED_OFFSET));
        asm.mov_load64(declaring, Mem::base(IC_HOLDER_REG, IC_HOLDER_DECLARING_OFFSET));

        let npe_offset = asm.pc();
        asm.mov_load64(recv_klass, Mem::base(RECEIVER_REG, OBJECT_KLASS_OFFSET));

        // Receiver must implement the referenced interface.
        lookup_interface(&mut asm, recv_klass, resolved, Reg::R13, None, no_such_interface);
        // Select the method through the declaring interface.
        lookup_interface(
            &mut asm,
            recv_klass,
            declaring,
            METHOD_REG,
            Some(index),
            no_such_interface,
        );

        self.emit_entry_point_check(&mut asm);

        let ame_offset = asm.pc();
        asm.jmp_mem(Mem::base(METHOD_REG, METHOD_FROM_COMPILED_OFFSET));

        asm.bind(no_such_interface);
        asm.mov_imm64(Reg::R11, self.config.handlers.incompatible_class_change);
        asm.jmp_reg(Reg::R11);

        Emitted {
            code: asm.finish(),
            npe_offset,
            ame_offset,
        }
    }
}

impl std::fmt::Debug for StubGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StubGenerator")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Scans the itable of `recv_klass` for `interface`.
///
/// ```text
/// for (scan = klass->itable(); scan->interface != 0; scan++)
///     if (scan->interface == interface) goto found;
/// goto no_such_interface;
/// found:
///     method = *(klass + scan->offset + index * 8)
/// ```
///
/// Uses `r11` as the scan cursor. With `select`, `recv_klass` is advanced by
/// the method index and the selected method is left in `result`.
fn lookup_interface(
    asm: &mut Assembler,
    recv_klass: Reg,
    interface: Reg,
    result: Reg,
    select: Option<u32>,
    no_such_interface: Label,
) {
    let scan = Reg::R11;
    let top = asm.new_label();
    let found = asm.new_label();

    asm.mov_load32(scan, Mem::base(recv_klass, KLASS_VTABLE_LENGTH_OFFSET));
    asm.lea(
        scan,
        Mem::indexed(recv_klass, scan, Scale::X8, KLASS_VTABLE_START_OFFSET),
    );
    if let Some(index) = select {
        asm.lea(recv_klass, Mem::base(recv_klass, itable_method_offset(index)));
    }

    asm.bind(top);
    asm.mov_load64(result, Mem::base(scan, ITABLE_INTERFACE_OFFSET));
    asm.cmp_rr(interface, result);
    asm.jcc(Cond::Equal, found);
    asm.test_rr(result, result);
    asm.jcc(Cond::Equal, no_such_interface);
    asm.add_imm8(scan, ITABLE_OFFSET_ENTRY_SIZE as i8);
    asm.jmp(top);
    asm.bind(found);

    if select.is_some() {
        asm.mov_load32(scan, Mem::base(scan, ITABLE_OFFSET_OFFSET));
        asm.mov_load64(result, Mem::indexed(recv_klass, scan, Scale::X1, 0));
    }
}
