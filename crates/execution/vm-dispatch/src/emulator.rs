//! 分派桩模拟器
//!
//! 在按 [`crate::layout`] 布局的模拟堆上解释执行桩汇编器产生的指令子集，
//! 无需执行生成的机器码即可校验分派语义（包括故障路径）。
//! 低于 [`SimHeap::PAGE_SIZE`] 的地址永不映射，空指针解引用会像原生执行一样触发故障。

use std::collections::HashMap;

use crate::asm::{Cond, Reg, Rex, Scale};
use crate::config::RuntimeHandlers;
use crate::layout::{
    IC_HOLDER_DECLARING_OFFSET, IC_HOLDER_REG, IC_HOLDER_RESOLVED_OFFSET,
    ITABLE_INTERFACE_OFFSET, ITABLE_OFFSET_ENTRY_SIZE, ITABLE_OFFSET_OFFSET,
    KLASS_VTABLE_LENGTH_OFFSET, KLASS_VTABLE_START_OFFSET, METHOD_FROM_COMPILED_OFFSET,
    METHOD_REG, OBJECT_KLASS_OFFSET, RECEIVER_REG, VTABLE_ENTRY_SIZE,
};
use crate::stub::{DispatchStub, StubFault};

/// Sparse, page-granular simulated memory.
#[derive(Debug)]
pub struct SimHeap {
    pages: HashMap<u64, Box<[u8]>>,
    next: u64,
}

impl Default for SimHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl SimHeap {
    pub const PAGE_SIZE: u64 = 4096;
    const BASE: u64 = 0x1000_0000;

    pub fn new() -> Self {
        Self {
            pages: HashMap::new(),
            next: Self::BASE,
        }
    }

    /// Maps `[addr, addr + len)`, zero-filled.
    ///
    /// # Panics
    ///
    /// If the range touches the null page.
    pub fn map(&mut self, addr: u64, len: usize) {
        assert!(addr >= Self::PAGE_SIZE, "the null page stays unmapped");
        let first = addr / Self::PAGE_SIZE;
        let last = (addr + len.max(1) as u64 - 1) / Self::PAGE_SIZE;
        for page in first..=last {
            self.pages
                .entry(page)
                .or_insert_with(|| vec![0u8; Self::PAGE_SIZE as usize].into_boxed_slice());
        }
    }

    pub fn is_mapped(&self, addr: u64) -> bool {
        self.pages.contains_key(&(addr / Self::PAGE_SIZE))
    }

    /// Bump-allocates a zeroed, 16-byte aligned block.
    pub fn alloc(&mut self, size: usize) -> u64 {
        let addr = self.next;
        let size = (size.max(1) as u64 + 15) & !15;
        self.next += size;
        self.map(addr, size as usize);
        addr
    }

    fn read<const N: usize>(&self, addr: u64) -> Option<[u8; N]> {
        let mut out = [0u8; N];
        for (i, byte) in out.iter_mut().enumerate() {
            let a = addr.checked_add(i as u64)?;
            let page = self.pages.get(&(a / Self::PAGE_SIZE))?;
            *byte = page[(a % Self::PAGE_SIZE) as usize];
        }
        Some(out)
    }

    fn write<const N: usize>(&mut self, addr: u64, bytes: [u8; N]) -> bool {
        let all_mapped = (0..N as u64).all(|i| {
            addr.checked_add(i)
                .is_some_and(|a| self.is_mapped(a))
        });
        if !all_mapped {
            return false;
        }
        for (i, byte) in bytes.into_iter().enumerate() {
            let a = addr + i as u64;
            if let Some(page) = self.pages.get_mut(&(a / Self::PAGE_SIZE)) {
                page[(a % Self::PAGE_SIZE) as usize] = byte;
            }
        }
        true
    }

    pub fn read_u64(&self, addr: u64) -> Option<u64> {
        self.read::<8>(addr).map(u64::from_le_bytes)
    }

    pub fn read_u32(&self, addr: u64) -> Option<u32> {
        self.read::<4>(addr).map(u32::from_le_bytes)
    }

    pub fn write_u64(&mut self, addr: u64, value: u64) -> bool {
        self.write(addr, value.to_le_bytes())
    }

    pub fn write_u32(&mut self, addr: u64, value: u32) -> bool {
        self.write(addr, value.to_le_bytes())
    }

    fn put_u64(&mut self, base: u64, offset: i32, value: u64) {
        let ok = self.write_u64(base + offset as u64, value);
        debug_assert!(ok, "store into unmapped simulated memory");
    }

    fn put_u32(&mut self, base: u64, offset: i32, value: u32) {
        let ok = self.write_u32(base + offset as u64, value);
        debug_assert!(ok, "store into unmapped simulated memory");
    }

    /// A method whose compiled entry point is `entry`.
    pub fn define_method(&mut self, entry: u64) -> u64 {
        let method = self.alloc(0x20);
        self.put_u64(method, METHOD_FROM_COMPILED_OFFSET, entry);
        method
    }

    /// An interface klass; only its identity matters to dispatch.
    pub fn define_interface(&mut self) -> u64 {
        self.define_klass(&[], &[])
    }

    /// A klass with the given vtable and itable.
    ///
    /// `itable` lists `(interface, methods)` in scan order. A zero method
    /// slot models an abstract method.
    pub fn define_klass(&mut self, vtable: &[u64], itable: &[(u64, &[u64])]) -> u64 {
        let header = KLASS_VTABLE_START_OFFSET as usize;
        let vtable_bytes = vtable.len() * VTABLE_ENTRY_SIZE as usize;
        let offset_table_bytes = (itable.len() + 1) * ITABLE_OFFSET_ENTRY_SIZE as usize;
        let method_bytes: usize = itable.iter().map(|(_, methods)| methods.len() * 8).sum();
        let klass = self.alloc(header + vtable_bytes + offset_table_bytes + method_bytes);

        self.put_u32(klass, KLASS_VTABLE_LENGTH_OFFSET, vtable.len() as u32);
        for (slot, &method) in vtable.iter().enumerate() {
            self.put_u64(
                klass,
                KLASS_VTABLE_START_OFFSET + slot as i32 * VTABLE_ENTRY_SIZE,
                method,
            );
        }

        let offset_table = (header + vtable_bytes) as i32;
        let mut block = (header + vtable_bytes + offset_table_bytes) as i32;
        for (i, (interface, methods)) in itable.iter().enumerate() {
            let entry = offset_table + i as i32 * ITABLE_OFFSET_ENTRY_SIZE;
            self.put_u64(klass, entry + ITABLE_INTERFACE_OFFSET, *interface);
            self.put_u32(klass, entry + ITABLE_OFFSET_OFFSET, block as u32);
            for (j, &method) in methods.iter().enumerate() {
                self.put_u64(klass, block + j as i32 * 8, method);
            }
            block += methods.len() as i32 * 8;
        }
        // Terminator entry is already zero.
        klass
    }

    pub fn new_object(&mut self, klass: u64) -> u64 {
        let object = self.alloc(16);
        self.put_u64(object, OBJECT_KLASS_OFFSET, klass);
        object
    }

    pub fn new_ic_holder(&mut self, resolved: u64, declaring: u64) -> u64 {
        let holder = self.alloc(16);
        self.put_u64(holder, IC_HOLDER_RESOLVED_OFFSET, resolved);
        self.put_u64(holder, IC_HOLDER_DECLARING_OFFSET, declaring);
        holder
    }
}

/// How an emulated stub invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Control left the stub for `entry` with `method` selected.
    Dispatched { method: u64, entry: u64 },
    /// Fault at the recorded null-receiver offset.
    NullPointer,
    /// Fault at the recorded abstract-method offset.
    AbstractMethod,
    /// Jump to the incompatible-class-change handler.
    IncompatibleClassChange,
    /// Jump to the bad-vtable-index handler.
    BadVtableIndex { index: u32 },
    /// Fault at an unrecorded pc; a stub bug.
    Fault { pc: usize, addr: u64 },
    /// `ud2` reached (debug check failed).
    Trap { pc: usize },
    Undecodable { pc: usize },
    StepLimit,
}

#[derive(Debug, Clone, Copy, Default)]
struct Flags {
    zf: bool,
    sf: bool,
    of: bool,
}

impl Flags {
    fn sub64(a: u64, b: u64) -> Flags {
        let r = a.wrapping_sub(b);
        Flags {
            zf: r == 0,
            sf: (r as i64) < 0,
            of: (((a ^ b) & (a ^ r)) as i64) < 0,
        }
    }

    fn sub32(a: u32, b: u32) -> Flags {
        let r = a.wrapping_sub(b);
        Flags {
            zf: r == 0,
            sf: (r as i32) < 0,
            of: (((a ^ b) & (a ^ r)) as i32) < 0,
        }
    }

    fn and64(a: u64, b: u64) -> Flags {
        let r = a & b;
        Flags {
            zf: r == 0,
            sf: (r as i64) < 0,
            of: false,
        }
    }

    fn holds(self, cond: Cond) -> bool {
        match cond {
            Cond::Equal => self.zf,
            Cond::NotEqual => !self.zf,
            Cond::Greater => !self.zf && self.sf == self.of,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Operand {
    Reg(Reg),
    Mem(u64),
}

/// Machine state for one invocation.
struct Cpu<'s> {
    stub: &'s DispatchStub,
    regs: [u64; 16],
    flags: Flags,
    pc: usize,
}

enum Step {
    Continue,
    Exit(DispatchOutcome),
}

pub struct StubEmulator<'h> {
    heap: &'h mut SimHeap,
    handlers: RuntimeHandlers,
    step_limit: usize,
}

impl<'h> StubEmulator<'h> {
    pub fn new(heap: &'h mut SimHeap, handlers: RuntimeHandlers) -> Self {
        Self {
            heap,
            handlers,
            step_limit: 10_000,
        }
    }

    pub fn with_step_limit(mut self, step_limit: usize) -> Self {
        self.step_limit = step_limit;
        self
    }

    /// Runs `stub` with `receiver` and `ic_holder` in the entry registers.
    pub fn run(&mut self, stub: &DispatchStub, receiver: u64, ic_holder: u64) -> DispatchOutcome {
        let mut cpu = Cpu {
            stub,
            regs: [0; 16],
            flags: Flags::default(),
            pc: stub.entry_point(),
        };
        cpu.regs[RECEIVER_REG as usize] = receiver;
        cpu.regs[IC_HOLDER_REG as usize] = ic_holder;

        for _ in 0..self.step_limit {
            match self.step(&mut cpu) {
                Step::Continue => {}
                Step::Exit(outcome) => return outcome,
            }
        }
        DispatchOutcome::StepLimit
    }

    fn fault(&self, cpu: &Cpu<'_>, addr: u64) -> Step {
        Step::Exit(match cpu.stub.classify_fault(cpu.pc) {
            Some(StubFault::NullReceiver) => DispatchOutcome::NullPointer,
            Some(StubFault::AbstractMethod) => DispatchOutcome::AbstractMethod,
            None => DispatchOutcome::Fault { pc: cpu.pc, addr },
        })
    }

    fn transfer(&self, cpu: &mut Cpu<'_>, target: u64) -> Step {
        let target_pc = target as usize;
        if cpu.stub.contains(target_pc) {
            cpu.pc = target_pc;
            return Step::Continue;
        }
        let method = cpu.regs[METHOD_REG as usize];
        Step::Exit(if target == self.handlers.incompatible_class_change {
            DispatchOutcome::IncompatibleClassChange
        } else if target == self.handlers.bad_vtable_index {
            DispatchOutcome::BadVtableIndex {
                index: method as u32,
            }
        } else {
            DispatchOutcome::Dispatched {
                method,
                entry: target,
            }
        })
    }

    fn step(&mut self, cpu: &mut Cpu<'_>) -> Step {
        let stub = cpu.stub;
        let mut d = Decoder {
            code: stub.code(),
            at: cpu.pc - stub.entry_point(),
            rex: Rex::default(),
        };
        let Some(insn) = d.decode(&cpu.regs) else {
            return Step::Exit(DispatchOutcome::Undecodable { pc: cpu.pc });
        };
        let next_pc = stub.entry_point() + d.at;

        match insn {
            Insn::Load { dst, src, wide } => {
                let value = if wide {
                    self.heap.read_u64(src)
                } else {
                    self.heap.read_u32(src).map(u64::from)
                };
                match value {
                    Some(v) => cpu.regs[dst as usize] = v,
                    None => return self.fault(cpu, src),
                }
            }
            Insn::Lea { dst, addr } => cpu.regs[dst as usize] = addr,
            Insn::MovImm { dst, imm } => cpu.regs[dst as usize] = imm,
            Insn::CmpRr { lhs, rhs } => {
                cpu.flags = Flags::sub64(cpu.regs[lhs as usize], cpu.regs[rhs as usize])
            }
            Insn::TestRr { lhs, rhs } => {
                cpu.flags = Flags::and64(cpu.regs[lhs as usize], cpu.regs[rhs as usize])
            }
            Insn::AddImm { dst, imm } => {
                cpu.regs[dst as usize] = cpu.regs[dst as usize].wrapping_add(imm as i64 as u64)
            }
            Insn::CmpMemImm { addr, imm, wide } => {
                let flags = if wide {
                    self.heap
                        .read_u64(addr)
                        .map(|v| Flags::sub64(v, imm as i64 as u64))
                } else {
                    self.heap
                        .read_u32(addr)
                        .map(|v| Flags::sub32(v, imm as u32))
                };
                match flags {
                    Some(f) => cpu.flags = f,
                    None => return self.fault(cpu, addr),
                }
            }
            Insn::IncMem { addr } => {
                let Some(v) = self.heap.read_u64(addr) else {
                    return self.fault(cpu, addr);
                };
                if !self.heap.write_u64(addr, v.wrapping_add(1)) {
                    return self.fault(cpu, addr);
                }
            }
            Insn::JmpOperand(Operand::Reg(reg)) => {
                let target = cpu.regs[reg as usize];
                return self.transfer(cpu, target);
            }
            Insn::JmpOperand(Operand::Mem(addr)) => {
                let Some(target) = self.heap.read_u64(addr) else {
                    return self.fault(cpu, addr);
                };
                return self.transfer(cpu, target);
            }
            Insn::Jmp { rel } => {
                let target = (next_pc as i64 + i64::from(rel)) as u64;
                return self.transfer(cpu, target);
            }
            Insn::Jcc { cond, rel } => {
                if cpu.flags.holds(cond) {
                    let target = (next_pc as i64 + i64::from(rel)) as u64;
                    return self.transfer(cpu, target);
                }
            }
            Insn::Ud2 => return Step::Exit(DispatchOutcome::Trap { pc: cpu.pc }),
        }
        cpu.pc = next_pc;
        Step::Continue
    }
}

#[derive(Debug, Clone, Copy)]
enum Insn {
    Load { dst: Reg, src: u64, wide: bool },
    Lea { dst: Reg, addr: u64 },
    MovImm { dst: Reg, imm: u64 },
    CmpRr { lhs: Reg, rhs: Reg },
    TestRr { lhs: Reg, rhs: Reg },
    AddImm { dst: Reg, imm: i32 },
    CmpMemImm { addr: u64, imm: i32, wide: bool },
    IncMem { addr: u64 },
    JmpOperand(Operand),
    Jmp { rel: i32 },
    Jcc { cond: Cond, rel: i32 },
    Ud2,
}

struct Decoder<'c> {
    code: &'c [u8],
    at: usize,
    rex: Rex,
}

impl Decoder<'_> {
    fn byte(&mut self) -> Option<u8> {
        let b = *self.code.get(self.at)?;
        self.at += 1;
        Some(b)
    }

    fn imm32(&mut self) -> Option<i32> {
        let bytes = self.code.get(self.at..self.at + 4)?;
        self.at += 4;
        Some(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn imm64(&mut self) -> Option<u64> {
        let bytes = self.code.get(self.at..self.at + 8)?;
        self.at += 8;
        let mut out = [0u8; 8];
        out.copy_from_slice(bytes);
        Some(u64::from_le_bytes(out))
    }

    /// Returns (reg field, r/m operand).
    fn modrm(&mut self, regs: &[u64; 16]) -> Option<(u8, Operand)> {
        let m = self.byte()?;
        let mode = m >> 6;
        let reg = ((m >> 3) & 7) | (u8::from(self.rex.r) << 3);
        let rm = m & 7;

        if mode == 0b11 {
            let rm = rm | (u8::from(self.rex.b) << 3);
            return Some((reg, Operand::Reg(Reg::from_encoding(rm))));
        }

        let mut addr = if rm == 0b100 {
            let s = self.byte()?;
            let scale = Scale::from_bits(s >> 6);
            let index = ((s >> 3) & 7) | (u8::from(self.rex.x) << 3);
            let base = s & 7;
            if base == 0b101 && mode == 0 {
                // disp32 without base is never emitted
                return None;
            }
            let base = regs[(base | (u8::from(self.rex.b) << 3)) as usize];
            let index = if index == 0b100 {
                0
            } else {
                regs[index as usize].wrapping_mul(scale.factor())
            };
            base.wrapping_add(index)
        } else if rm == 0b101 && mode == 0 {
            // rip-relative is never emitted
            return None;
        } else {
            regs[(rm | (u8::from(self.rex.b) << 3)) as usize]
        };

        match mode {
            0b01 => addr = addr.wrapping_add(self.byte()? as i8 as i64 as u64),
            0b10 => addr = addr.wrapping_add(self.imm32()? as i64 as u64),
            _ => {}
        }
        Some((reg, Operand::Mem(addr)))
    }

    fn mem(&mut self, regs: &[u64; 16]) -> Option<(u8, u64)> {
        match self.modrm(regs)? {
            (reg, Operand::Mem(addr)) => Some((reg, addr)),
            (_, Operand::Reg(_)) => None,
        }
    }

    fn direct(&mut self, regs: &[u64; 16]) -> Option<(u8, Reg)> {
        match self.modrm(regs)? {
            (reg, Operand::Reg(rm)) => Some((reg, rm)),
            (_, Operand::Mem(_)) => None,
        }
    }

    fn decode(&mut self, regs: &[u64; 16]) -> Option<Insn> {
        let mut op = self.byte()?;
        if let Some(rex) = Rex::decode(op) {
            self.rex = rex;
            op = self.byte()?;
        }
        let wide = self.rex.w;

        Some(match op {
            0x8B => {
                let (reg, src) = self.mem(regs)?;
                Insn::Load {
                    dst: Reg::from_encoding(reg),
                    src,
                    wide,
                }
            }
            0x8D => {
                let (reg, addr) = self.mem(regs)?;
                Insn::Lea {
                    dst: Reg::from_encoding(reg),
                    addr,
                }
            }
            0x3B => {
                let (reg, rm) = self.direct(regs)?;
                Insn::CmpRr {
                    lhs: Reg::from_encoding(reg),
                    rhs: rm,
                }
            }
            0x85 => {
                let (reg, rm) = self.direct(regs)?;
                Insn::TestRr {
                    lhs: rm,
                    rhs: Reg::from_encoding(reg),
                }
            }
            0x83 => match self.modrm(regs)? {
                (0, Operand::Reg(dst)) => Insn::AddImm {
                    dst,
                    imm: i32::from(self.byte()? as i8),
                },
                (7, Operand::Mem(addr)) => Insn::CmpMemImm {
                    addr,
                    imm: i32::from(self.byte()? as i8),
                    wide,
                },
                _ => return None,
            },
            0x81 => match self.modrm(regs)? {
                (7, Operand::Mem(addr)) => Insn::CmpMemImm {
                    addr,
                    imm: self.imm32()?,
                    wide,
                },
                _ => return None,
            },
            0xFF => match self.modrm(regs)? {
                (0, Operand::Mem(addr)) => Insn::IncMem { addr },
                (4, operand) => Insn::JmpOperand(operand),
                _ => return None,
            },
            0xB8..=0xBF => {
                let dst = Reg::from_encoding((op - 0xB8) | (u8::from(self.rex.b) << 3));
                let imm = if wide {
                    self.imm64()?
                } else {
                    u64::from(self.imm32()? as u32)
                };
                Insn::MovImm { dst, imm }
            }
            0xE9 => Insn::Jmp { rel: self.imm32()? },
            0x0F => match self.byte()? {
                0x0B => Insn::Ud2,
                cc @ 0x80..=0x8F => Insn::Jcc {
                    cond: Cond::from_bits(cc & 0xF)?,
                    rel: self.imm32()?,
                },
                _ => return None,
            },
            _ => return None,
        })
    }
}
