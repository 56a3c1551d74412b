//! x86-64 指令编码原语
//!
//! 指令格式:
//! ```text
//! [REX] [Opcode] [ModR/M] [SIB] [Disp] [Imm]
//! ```

/// General purpose registers, numbered by hardware encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Reg {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Reg {
    pub const ALL: [Reg; 16] = [
        Reg::Rax,
        Reg::Rcx,
        Reg::Rdx,
        Reg::Rbx,
        Reg::Rsp,
        Reg::Rbp,
        Reg::Rsi,
        Reg::Rdi,
        Reg::R8,
        Reg::R9,
        Reg::R10,
        Reg::R11,
        Reg::R12,
        Reg::R13,
        Reg::R14,
        Reg::R15,
    ];

    #[inline]
    pub const fn encoding(self) -> u8 {
        self as u8
    }

    #[inline]
    pub const fn low_bits(self) -> u8 {
        (self as u8) & 0x7
    }

    #[inline]
    pub const fn high_bit(self) -> bool {
        (self as u8) & 0x8 != 0
    }

    /// RSP/R12 as a base can only be expressed through a SIB byte.
    #[inline]
    pub const fn needs_sib_as_base(self) -> bool {
        self.low_bits() == 0b100
    }

    /// RBP/R13 as a base with mod=00 means RIP-relative; they need disp8 = 0.
    #[inline]
    pub const fn needs_displacement(self) -> bool {
        self.low_bits() == 0b101
    }

    pub const fn from_encoding(enc: u8) -> Reg {
        Reg::ALL[(enc & 0xF) as usize]
    }
}

/// SIB scale factor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Scale {
    X1 = 0,
    X2 = 1,
    X4 = 2,
    X8 = 3,
}

impl Scale {
    pub const fn factor(self) -> u64 {
        1 << (self as u8)
    }

    pub const fn from_bits(bits: u8) -> Scale {
        match bits & 0x3 {
            0 => Scale::X1,
            1 => Scale::X2,
            2 => Scale::X4,
            _ => Scale::X8,
        }
    }
}

/// `[base + index*scale + disp]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mem {
    pub base: Reg,
    pub index: Option<(Reg, Scale)>,
    pub disp: i32,
}

impl Mem {
    pub const fn base(base: Reg, disp: i32) -> Self {
        Mem {
            base,
            index: None,
            disp,
        }
    }

    pub const fn indexed(base: Reg, index: Reg, scale: Scale, disp: i32) -> Self {
        Mem {
            base,
            index: Some((index, scale)),
            disp,
        }
    }

    #[inline]
    pub const fn disp_fits_i8(&self) -> bool {
        self.disp >= i8::MIN as i32 && self.disp <= i8::MAX as i32
    }
}

/// REX prefix: 0100WRXB
#[derive(Debug, Clone, Copy, Default)]
pub struct Rex {
    pub w: bool,
    pub r: bool,
    pub x: bool,
    pub b: bool,
}

impl Rex {
    pub const fn rr(w: bool, reg: Reg, rm: Reg) -> Self {
        Rex {
            w,
            r: reg.high_bit(),
            x: false,
            b: rm.high_bit(),
        }
    }

    pub const fn rm(w: bool, reg_high: bool, mem: &Mem) -> Self {
        Rex {
            w,
            r: reg_high,
            x: match mem.index {
                Some((idx, _)) => idx.high_bit(),
                None => false,
            },
            b: mem.base.high_bit(),
        }
    }

    #[inline]
    pub const fn is_needed(&self) -> bool {
        self.w || self.r || self.x || self.b
    }

    #[inline]
    pub const fn encode(&self) -> u8 {
        0x40 | ((self.w as u8) << 3) | ((self.r as u8) << 2) | ((self.x as u8) << 1) | (self.b as u8)
    }

    pub const fn decode(byte: u8) -> Option<Rex> {
        if byte & 0xF0 != 0x40 {
            return None;
        }
        Some(Rex {
            w: byte & 0x8 != 0,
            r: byte & 0x4 != 0,
            x: byte & 0x2 != 0,
            b: byte & 0x1 != 0,
        })
    }
}

/// ModR/M mod field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Mod {
    Indirect = 0b00,
    IndirectDisp8 = 0b01,
    IndirectDisp32 = 0b10,
    Direct = 0b11,
}

#[inline]
pub const fn modrm(mod_: Mod, reg: u8, rm: u8) -> u8 {
    ((mod_ as u8) << 6) | ((reg & 0x7) << 3) | (rm & 0x7)
}

#[inline]
pub const fn sib(scale: Scale, index: u8, base: u8) -> u8 {
    ((scale as u8) << 6) | ((index & 0x7) << 3) | (base & 0x7)
}

/// Appends ModR/M, optional SIB and displacement for a memory operand.
pub fn encode_mem(buf: &mut Vec<u8>, reg: u8, mem: &Mem) {
    let base = mem.base;
    let mod_field = if mem.disp == 0 && !base.needs_displacement() {
        Mod::Indirect
    } else if mem.disp_fits_i8() {
        Mod::IndirectDisp8
    } else {
        Mod::IndirectDisp32
    };

    match mem.index {
        None if !base.needs_sib_as_base() => {
            buf.push(modrm(mod_field, reg, base.low_bits()));
        }
        None => {
            buf.push(modrm(mod_field, reg, 0b100));
            // index = 100 means "no index"
            buf.push(sib(Scale::X1, 0b100, base.low_bits()));
        }
        Some((index, scale)) => {
            assert!(
                index != Reg::Rsp,
                "rsp cannot be used as an index register"
            );
            buf.push(modrm(mod_field, reg, 0b100));
            buf.push(sib(scale, index.low_bits(), base.low_bits()));
        }
    }

    match mod_field {
        Mod::IndirectDisp8 => buf.push(mem.disp as i8 as u8),
        Mod::IndirectDisp32 => buf.extend_from_slice(&mem.disp.to_le_bytes()),
        _ => {}
    }
}

/// Encoded length of ModR/M + SIB + displacement for `mem`.
pub const fn mem_operand_len(mem: &Mem) -> usize {
    let sib = match mem.index {
        Some(_) => 1,
        None if mem.base.needs_sib_as_base() => 1,
        None => 0,
    };
    let disp = if mem.disp == 0 && !mem.base.needs_displacement() {
        0
    } else if mem.disp_fits_i8() {
        1
    } else {
        4
    };
    1 + sib + disp
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enc(reg: u8, mem: Mem) -> Vec<u8> {
        let mut buf = Vec::new();
        encode_mem(&mut buf, reg, &mem);
        assert_eq!(buf.len(), mem_operand_len(&mem));
        buf
    }

    #[test]
    fn test_rex_encoding() {
        assert_eq!(Rex::rr(true, Reg::Rax, Reg::Rcx).encode(), 0x48);
        assert_eq!(Rex::rr(true, Reg::R11, Reg::R10).encode(), 0x4D);
        assert!(!Rex::rr(false, Reg::Rax, Reg::Rbx).is_needed());
        let rex = Rex::decode(0x4F).unwrap();
        assert!(rex.w && rex.r && rex.x && rex.b);
        assert!(Rex::decode(0x90).is_none());
    }

    #[test]
    fn test_plain_base() {
        // [rax]
        assert_eq!(enc(0, Mem::base(Reg::Rax, 0)), vec![0x00]);
        // [rsi + 8]
        assert_eq!(enc(0, Mem::base(Reg::Rsi, 8)), vec![0x46, 0x08]);
        // [rax + 0x80]
        assert_eq!(
            enc(3, Mem::base(Reg::Rax, 0x80)),
            vec![0x98, 0x80, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn test_special_bases() {
        // [rsp] needs a SIB byte
        assert_eq!(enc(0, Mem::base(Reg::Rsp, 0)), vec![0x04, 0x24]);
        // [r13] needs disp8 = 0
        assert_eq!(enc(0, Mem::base(Reg::R13, 0)), vec![0x45, 0x00]);
        // [r12 + 8]
        assert_eq!(enc(0, Mem::base(Reg::R12, 8)), vec![0x44, 0x24, 0x08]);
    }

    #[test]
    fn test_indexed() {
        // [r10 + r11*8 + 0x40]
        assert_eq!(
            enc(3, Mem::indexed(Reg::R10, Reg::R11, Scale::X8, 0x40)),
            vec![0x5C, 0xDA, 0x40]
        );
        // [r10 + r11]
        assert_eq!(
            enc(3, Mem::indexed(Reg::R10, Reg::R11, Scale::X1, 0)),
            vec![0x1C, 0x1A]
        );
    }
}
