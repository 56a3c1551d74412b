//! 桩尺寸上界
//!
//! 生成器在输出任何指令前先预留 [`reserved_size`] 字节，生成后再以此检查实际长度。
//! 这里的函数不依赖汇编器，尺寸模型可以单独校验。
//!
//! 组成部分（字节）:
//!
//! | piece                                   | vtable   | itable   |
//! |-----------------------------------------|----------|----------|
//! | call counter (`mov r11, imm64; inc`)    | 13       | 13       |
//! | ic holder loads                         | -        | 7        |
//! | receiver klass load (npe)               | 4        | 4        |
//! | bounds check (debug)                    | 31       | -        |
//! | method lookup                           | 4 or 7   | 86 to 90 |
//! | null entry point check (debug)          | 22       | 22       |
//! | final jump (ame)                        | 3        | 3        |
//! | no-such-interface exit                  | -        | 13       |

use crate::asm::{Mem, Reg, mem_operand_len};
use crate::config::Instrumentation;
use crate::layout::{
    IC_HOLDER_DECLARING_OFFSET, IC_HOLDER_REG, IC_HOLDER_RESOLVED_OFFSET,
    KLASS_VTABLE_LENGTH_OFFSET, METHOD_FROM_COMPILED_OFFSET, METHOD_REG, OBJECT_KLASS_OFFSET,
    RECEIVER_REG, itable_method_offset, vtable_entry_offset,
};
use crate::stub::StubKind;

const MOV_IMM64: usize = 10;
const MOV_IMM32: usize = 5;
const JCC_REL32: usize = 6;
const JMP_REG_EXT: usize = 3;
const REG_REG: usize = 3;
const UD2: usize = 2;
const ADD_IMM8: usize = 4;
const JMP_REL32: usize = 5;

/// rex + opcode + memory operand
const fn load(mem: Mem) -> usize {
    2 + mem_operand_len(&mem)
}

const fn call_counter() -> usize {
    // mov r11, imm64; inc qword [r11]
    MOV_IMM64 + load(Mem::base(Reg::R11, 0))
}

const fn receiver_klass_load() -> usize {
    load(Mem::base(RECEIVER_REG, OBJECT_KLASS_OFFSET))
}

const fn vtable_bounds_check() -> usize {
    // cmp dword [rax+len], imm32 (no rex); jg; mov ebx, imm32; mov r11, imm64; jmp r11
    1 + mem_operand_len(&Mem::base(Reg::Rax, KLASS_VTABLE_LENGTH_OFFSET))
        + 4
        + JCC_REL32
        + MOV_IMM32
        + MOV_IMM64
        + JMP_REG_EXT
}

const fn null_entry_check() -> usize {
    // test; je; cmp qword [rbx+entry], 0; jne; ud2
    REG_REG
        + JCC_REL32
        + load(Mem::base(METHOD_REG, METHOD_FROM_COMPILED_OFFSET))
        + 1
        + JCC_REL32
        + UD2
}

const fn final_jump() -> usize {
    // no rex for rbx
    1 + mem_operand_len(&Mem::base(METHOD_REG, METHOD_FROM_COMPILED_OFFSET))
}

const fn ic_holder_loads() -> usize {
    load(Mem::base(IC_HOLDER_REG, IC_HOLDER_RESOLVED_OFFSET))
        + load(Mem::base(IC_HOLDER_REG, IC_HOLDER_DECLARING_OFFSET))
}

const fn itable_scan() -> usize {
    // mov r11d, [r10+len]; lea r11, [r10+r11*8+start]
    let setup = load(Mem::base(Reg::R10, KLASS_VTABLE_LENGTH_OFFSET))
        + load(Mem::indexed(
            Reg::R10,
            Reg::R11,
            crate::asm::Scale::X8,
            crate::layout::KLASS_VTABLE_START_OFFSET,
        ));
    // mov; cmp; je; test; je; add; jmp
    let body = load(Mem::base(Reg::R11, 0))
        + REG_REG
        + JCC_REL32
        + REG_REG
        + JCC_REL32
        + ADD_IMM8
        + JMP_REL32;
    setup + body
}

const fn itable_method_select(index: u32) -> usize {
    // lea r10, [r10+index*8]
    let adjust = load(Mem::base(Reg::R10, itable_method_offset(index)));
    // mov r11d, [r11+offset]; mov rbx, [r10+r11]
    let fetch = load(Mem::base(Reg::R11, crate::layout::ITABLE_OFFSET_OFFSET))
        + load(Mem::indexed(Reg::R10, Reg::R11, crate::asm::Scale::X1, 0));
    adjust + itable_scan() + fetch
}

const fn no_such_interface_exit() -> usize {
    MOV_IMM64 + JMP_REG_EXT
}

/// Exact size of the stub the generator emits for `(kind, index)`.
pub const fn exact_size(kind: StubKind, index: u32, instrumentation: Instrumentation) -> usize {
    let mut size = 0;
    if instrumentation.count_calls {
        size += call_counter();
    }
    match kind {
        StubKind::Vtable => {
            size += receiver_klass_load();
            if instrumentation.debug_checks {
                size += vtable_bounds_check();
            }
            size += load(Mem::base(Reg::Rax, vtable_entry_offset(index)));
        }
        StubKind::Itable => {
            size += ic_holder_loads();
            size += receiver_klass_load();
            size += itable_scan();
            size += itable_method_select(index);
        }
    }
    if instrumentation.debug_checks {
        size += null_entry_check();
    }
    size += final_jump();
    if let StubKind::Itable = kind {
        size += no_such_interface_exit();
    }
    size
}

/// Bytes to reserve for any stub of `kind`, over all slot indexes.
pub const fn reserved_size(kind: StubKind, instrumentation: Instrumentation) -> usize {
    // Displacements past 127 need four bytes; that is the largest encoding.
    exact_size(kind, crate::layout::MAX_SLOT_INDEX, instrumentation)
}

/// Checks the emitted length of a stub against its reservation.
///
/// # Panics
///
/// When the stub overran its reservation. The bytes following the
/// reservation belong to another stub, so this is not recoverable.
pub fn check_fits(kind: StubKind, index: u32, emitted: usize, reserved: usize) {
    assert!(
        emitted <= reserved,
        "{kind} stub #{index}: emitted {emitted} bytes into a {reserved}-byte reservation"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vtable_sizes() {
        assert_eq!(reserved_size(StubKind::Vtable, Instrumentation::NONE), 14);
        assert_eq!(reserved_size(StubKind::Vtable, Instrumentation::ALL), 80);
        // disp8 reaches slot 7
        assert_eq!(exact_size(StubKind::Vtable, 7, Instrumentation::NONE), 11);
        assert_eq!(exact_size(StubKind::Vtable, 8, Instrumentation::NONE), 14);
    }

    #[test]
    fn test_itable_sizes() {
        assert_eq!(reserved_size(StubKind::Itable, Instrumentation::NONE), 120);
        assert_eq!(reserved_size(StubKind::Itable, Instrumentation::ALL), 155);
        assert_eq!(exact_size(StubKind::Itable, 0, Instrumentation::NONE), 116);
        assert_eq!(exact_size(StubKind::Itable, 15, Instrumentation::NONE), 117);
        assert_eq!(exact_size(StubKind::Itable, 16, Instrumentation::NONE), 120);
    }

    #[test]
    fn test_reservation_bounds_every_index() {
        for kind in StubKind::ALL {
            for instr in Instrumentation::COMBINATIONS {
                let reserved = reserved_size(kind, instr);
                for index in [0, 1, 7, 8, 15, 16, 511, 512, 100_000] {
                    assert!(exact_size(kind, index, instr) <= reserved);
                }
            }
        }
    }

    #[test]
    #[should_panic(expected = "itable stub #3: emitted 130 bytes into a 120-byte reservation")]
    fn test_overrun_is_fatal() {
        check_fits(StubKind::Itable, 3, 130, 120);
    }
}
