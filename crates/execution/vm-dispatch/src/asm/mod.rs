//! 桩生成器使用的 x86-64 汇编器

mod assembler;
mod encoder;

pub use assembler::{Assembler, Cond, Label};
pub use encoder::{Mem, Mod, Reg, Rex, Scale, encode_mem, mem_operand_len, modrm, sib};
