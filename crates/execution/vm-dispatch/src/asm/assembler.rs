//! 桩生成用的 x64 汇编器
//!
//! 只提供分派桩需要的指令形式。分支一律使用 rel32，使指令长度与标签距离无关，
//! 从而保证桩尺寸模型精确。

use super::encoder::{Mem, Mod, Reg, Rex, encode_mem, modrm};

/// Condition codes used by the stubs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cond {
    Equal = 0x4,
    NotEqual = 0x5,
    Greater = 0xF,
}

impl Cond {
    pub fn from_bits(bits: u8) -> Option<Cond> {
        match bits {
            0x4 => Some(Cond::Equal),
            0x5 => Some(Cond::NotEqual),
            0xF => Some(Cond::Greater),
            _ => None,
        }
    }
}

/// Forward or backward branch target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

#[derive(Debug)]
struct Fixup {
    /// Position of the rel32 field.
    at: usize,
    label: Label,
}

/// Code buffer for emitting x64 instructions.
#[derive(Debug, Default)]
pub struct Assembler {
    code: Vec<u8>,
    labels: Vec<Option<usize>>,
    fixups: Vec<Fixup>,
}

impl Assembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current offset from the start of the buffer.
    pub fn pc(&self) -> usize {
        self.code.len()
    }

    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    pub fn bind(&mut self, label: Label) {
        let slot = &mut self.labels[label.0];
        assert!(slot.is_none(), "label {} bound twice", label.0);
        *slot = Some(self.code.len());
    }

    pub fn emit(&mut self, bytes: &[u8]) {
        self.code.extend_from_slice(bytes);
    }

    fn rex_mem(&mut self, w: bool, reg: Reg, mem: &Mem) {
        let rex = Rex::rm(w, reg.high_bit(), mem);
        if rex.is_needed() {
            self.code.push(rex.encode());
        }
    }

    fn rex_digit_mem(&mut self, w: bool, mem: &Mem) {
        let rex = Rex::rm(w, false, mem);
        if rex.is_needed() {
            self.code.push(rex.encode());
        }
    }

    /// `mov r64, [mem]`
    pub fn mov_load64(&mut self, dst: Reg, mem: Mem) {
        self.rex_mem(true, dst, &mem);
        self.code.push(0x8B);
        encode_mem(&mut self.code, dst.low_bits(), &mem);
    }

    /// `mov r32, [mem]` (zero-extends into the full register)
    pub fn mov_load32(&mut self, dst: Reg, mem: Mem) {
        self.rex_mem(false, dst, &mem);
        self.code.push(0x8B);
        encode_mem(&mut self.code, dst.low_bits(), &mem);
    }

    /// `lea r64, [mem]`
    pub fn lea(&mut self, dst: Reg, mem: Mem) {
        self.rex_mem(true, dst, &mem);
        self.code.push(0x8D);
        encode_mem(&mut self.code, dst.low_bits(), &mem);
    }

    /// `mov r64, imm64`
    pub fn mov_imm64(&mut self, dst: Reg, imm: u64) {
        self.code.push(
            Rex {
                w: true,
                b: dst.high_bit(),
                ..Rex::default()
            }
            .encode(),
        );
        self.code.push(0xB8 + dst.low_bits());
        self.code.extend_from_slice(&imm.to_le_bytes());
    }

    /// `mov r32, imm32`
    pub fn mov_imm32(&mut self, dst: Reg, imm: u32) {
        if dst.high_bit() {
            self.code.push(
                Rex {
                    b: true,
                    ..Rex::default()
                }
                .encode(),
            );
        }
        self.code.push(0xB8 + dst.low_bits());
        self.code.extend_from_slice(&imm.to_le_bytes());
    }

    /// `cmp r64, r64` (flags from `lhs - rhs`)
    pub fn cmp_rr(&mut self, lhs: Reg, rhs: Reg) {
        let rex = Rex::rr(true, lhs, rhs);
        self.code.push(rex.encode());
        self.code.push(0x3B);
        self.code
            .push(modrm(Mod::Direct, lhs.low_bits(), rhs.low_bits()));
    }

    /// `test r64, r64`
    pub fn test_rr(&mut self, lhs: Reg, rhs: Reg) {
        let rex = Rex::rr(true, rhs, lhs);
        self.code.push(rex.encode());
        self.code.push(0x85);
        self.code
            .push(modrm(Mod::Direct, rhs.low_bits(), lhs.low_bits()));
    }

    /// `add r64, imm8` (sign-extended)
    pub fn add_imm8(&mut self, dst: Reg, imm: i8) {
        let rex = Rex {
            w: true,
            b: dst.high_bit(),
            ..Rex::default()
        };
        self.code.push(rex.encode());
        self.code.push(0x83);
        self.code.push(modrm(Mod::Direct, 0, dst.low_bits()));
        self.code.push(imm as u8);
    }

    /// `cmp qword [mem], imm8` (sign-extended)
    pub fn cmp_mem64_imm8(&mut self, mem: Mem, imm: i8) {
        self.rex_digit_mem(true, &mem);
        self.code.push(0x83);
        encode_mem(&mut self.code, 7, &mem);
        self.code.push(imm as u8);
    }

    /// `cmp dword [mem], imm32`
    pub fn cmp_mem32_imm32(&mut self, mem: Mem, imm: u32) {
        self.rex_digit_mem(false, &mem);
        self.code.push(0x81);
        encode_mem(&mut self.code, 7, &mem);
        self.code.extend_from_slice(&imm.to_le_bytes());
    }

    /// `inc qword [mem]`
    pub fn inc_mem64(&mut self, mem: Mem) {
        self.rex_digit_mem(true, &mem);
        self.code.push(0xFF);
        encode_mem(&mut self.code, 0, &mem);
    }

    /// `jmp qword [mem]`
    pub fn jmp_mem(&mut self, mem: Mem) {
        self.rex_digit_mem(false, &mem);
        self.code.push(0xFF);
        encode_mem(&mut self.code, 4, &mem);
    }

    /// `jmp r64`
    pub fn jmp_reg(&mut self, target: Reg) {
        if target.high_bit() {
            self.code.push(
                Rex {
                    b: true,
                    ..Rex::default()
                }
                .encode(),
            );
        }
        self.code.push(0xFF);
        self.code.push(modrm(Mod::Direct, 4, target.low_bits()));
    }

    /// `jcc rel32`
    pub fn jcc(&mut self, cond: Cond, target: Label) {
        self.code.push(0x0F);
        self.code.push(0x80 | cond as u8);
        self.rel32(target);
    }

    /// `jmp rel32`
    pub fn jmp(&mut self, target: Label) {
        self.code.push(0xE9);
        self.rel32(target);
    }

    pub fn ud2(&mut self) {
        self.code.extend_from_slice(&[0x0F, 0x0B]);
    }

    fn rel32(&mut self, label: Label) {
        self.fixups.push(Fixup {
            at: self.code.len(),
            label,
        });
        self.code.extend_from_slice(&[0; 4]);
    }

    /// Resolves branch targets and returns the machine code.
    ///
    /// # Panics
    ///
    /// If a referenced label was never bound.
    pub fn finish(mut self) -> Vec<u8> {
        for fixup in &self.fixups {
            let target = match self.labels[fixup.label.0] {
                Some(target) => target,
                None => panic!("branch at {:#x} targets an unbound label", fixup.at),
            };
            let rel = target as i64 - (fixup.at as i64 + 4);
            self.code[fixup.at..fixup.at + 4].copy_from_slice(&(rel as i32).to_le_bytes());
        }
        self.code
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::encoder::Scale;

    #[test]
    fn test_loads() {
        let mut asm = Assembler::new();
        asm.mov_load64(Reg::R10, Mem::base(Reg::Rsi, 8));
        asm.mov_load32(Reg::R11, Mem::base(Reg::R10, 0x10));
        asm.lea(Reg::R11, Mem::indexed(Reg::R10, Reg::R11, Scale::X8, 0x40));
        assert_eq!(
            asm.finish(),
            vec![
                0x4C, 0x8B, 0x56, 0x08, // mov r10, [rsi+8]
                0x45, 0x8B, 0x5A, 0x10, // mov r11d, [r10+0x10]
                0x4F, 0x8D, 0x5C, 0xDA, 0x40, // lea r11, [r10+r11*8+0x40]
            ]
        );
    }

    #[test]
    fn test_register_forms() {
        let mut asm = Assembler::new();
        asm.cmp_rr(Reg::R14, Reg::R13);
        asm.test_rr(Reg::Rbx, Reg::Rbx);
        asm.add_imm8(Reg::R11, 16);
        asm.jmp_reg(Reg::R11);
        assert_eq!(
            asm.finish(),
            vec![
                0x4D, 0x3B, 0xF5, // cmp r14, r13
                0x48, 0x85, 0xDB, // test rbx, rbx
                0x49, 0x83, 0xC3, 0x10, // add r11, 16
                0x41, 0xFF, 0xE3, // jmp r11
            ]
        );
    }

    #[test]
    fn test_memory_immediate_forms() {
        let mut asm = Assembler::new();
        asm.jmp_mem(Mem::base(Reg::Rbx, 0x10));
        asm.inc_mem64(Mem::base(Reg::R11, 0));
        asm.cmp_mem32_imm32(Mem::base(Reg::Rax, 0x10), 5);
        asm.cmp_mem64_imm8(Mem::base(Reg::Rbx, 0x10), 0);
        assert_eq!(
            asm.finish(),
            vec![
                0xFF, 0x63, 0x10, // jmp [rbx+0x10]
                0x49, 0xFF, 0x03, // inc qword [r11]
                0x81, 0x78, 0x10, 0x05, 0x00, 0x00, 0x00, // cmp dword [rax+0x10], 5
                0x48, 0x83, 0x7B, 0x10, 0x00, // cmp qword [rbx+0x10], 0
            ]
        );
    }

    #[test]
    fn test_branches_resolve_both_directions() {
        let mut asm = Assembler::new();
        let top = asm.new_label();
        let done = asm.new_label();
        asm.bind(top);
        asm.jcc(Cond::Equal, done);
        asm.jmp(top);
        asm.bind(done);
        asm.ud2();
        let code = asm.finish();
        assert_eq!(&code[0..2], &[0x0F, 0x84]);
        assert_eq!(i32::from_le_bytes([code[2], code[3], code[4], code[5]]), 5);
        assert_eq!(code[6], 0xE9);
        assert_eq!(
            i32::from_le_bytes([code[7], code[8], code[9], code[10]]),
            -11
        );
        assert_eq!(&code[11..], &[0x0F, 0x0B]);
    }

    #[test]
    #[should_panic(expected = "unbound label")]
    fn test_unbound_label_panics() {
        let mut asm = Assembler::new();
        let nowhere = asm.new_label();
        asm.jmp(nowhere);
        let _ = asm.finish();
    }
}
