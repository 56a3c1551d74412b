//! 运行时对象布局
//!
//! 分派桩固化在代码中的偏移量。对象模型由运行时负责，这些常量即与其约定的契约。
//!
//! ```text
//! object:       +0x00 mark word
//!               +0x08 klass*
//! klass:        +0x10 vtable length (u32, entries)
//!               +0x40 vtable[0..len]          8 bytes per entry (Method*)
//!               itable offset table           16 bytes per entry:
//!                   +0x00 interface klass*    (0 terminates the table)
//!                   +0x08 offset (u32)        from klass start to the method block
//!               itable method blocks          8 bytes per entry (Method*)
//! method:       +0x10 from-compiled entry point
//! ic holder:    +0x00 resolved (referenced) interface klass*
//!               +0x08 declaring interface klass*
//! ```

use crate::asm::Reg;

pub const OBJECT_KLASS_OFFSET: i32 = 0x08;

pub const KLASS_VTABLE_LENGTH_OFFSET: i32 = 0x10;
pub const KLASS_VTABLE_START_OFFSET: i32 = 0x40;
pub const VTABLE_ENTRY_SIZE: i32 = 8;

pub const ITABLE_OFFSET_ENTRY_SIZE: i32 = 16;
pub const ITABLE_INTERFACE_OFFSET: i32 = 0x00;
pub const ITABLE_OFFSET_OFFSET: i32 = 0x08;
pub const ITABLE_METHOD_ENTRY_SIZE: i32 = 8;

pub const METHOD_FROM_COMPILED_OFFSET: i32 = 0x10;

pub const IC_HOLDER_RESOLVED_OFFSET: i32 = 0x00;
pub const IC_HOLDER_DECLARING_OFFSET: i32 = 0x08;

/// Receiver object on entry to a stub.
pub const RECEIVER_REG: Reg = Reg::Rsi;
/// Inline-cache holder on entry to an itable stub.
pub const IC_HOLDER_REG: Reg = Reg::Rax;
/// Selected `Method*` on exit.
pub const METHOD_REG: Reg = Reg::Rbx;

/// Largest slot index whose table displacement still fits a signed 32-bit
/// field.
pub const MAX_SLOT_INDEX: u32 =
    ((i32::MAX - KLASS_VTABLE_START_OFFSET) / VTABLE_ENTRY_SIZE) as u32;

/// Displacement of vtable slot `index` from the klass.
pub const fn vtable_entry_offset(index: u32) -> i32 {
    KLASS_VTABLE_START_OFFSET + index as i32 * VTABLE_ENTRY_SIZE
}

/// Displacement of itable method `index` from its method block.
pub const fn itable_method_offset(index: u32) -> i32 {
    index as i32 * ITABLE_METHOD_ENTRY_SIZE
}
