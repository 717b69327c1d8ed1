//! Field extraction back out of 32-bit instruction words.
//!
//! This is the inspection side of the encoder: the format of a word is
//! classified from its opcode, and the scattered immediates are reassembled
//! with their sign. The test suites use it to round-trip every constructor.

use crate::errors::DisasmError;
use crate::instr::{Format, Instr};
use crate::opcodes::*;
use crate::utils::{extract_field, sign_extend};

pub fn opcode7(word: u32) -> u32 {
    extract_field(word, 6, 0)
}

pub fn rd(word: u32) -> u32 {
    extract_field(word, 11, 7)
}

pub fn funct3(word: u32) -> u32 {
    extract_field(word, 14, 12)
}

pub fn rs1(word: u32) -> u32 {
    extract_field(word, 19, 15)
}

pub fn rs2(word: u32) -> u32 {
    extract_field(word, 24, 20)
}

pub fn funct7(word: u32) -> u32 {
    extract_field(word, 31, 25)
}

pub fn imm_itype(word: u32) -> i32 {
    sign_extend(extract_field(word, 31, 20), 12)
}

pub fn imm_stype(word: u32) -> i32 {
    let imm11_5 = extract_field(word, 31, 25);
    let imm4_0 = extract_field(word, 11, 7);
    sign_extend((imm11_5 << 5) | imm4_0, 12)
}

pub fn imm_btype(word: u32) -> i32 {
    let imm12 = extract_field(word, 31, 31);
    let imm11 = extract_field(word, 7, 7);
    let imm10_5 = extract_field(word, 30, 25);
    let imm4_1 = extract_field(word, 11, 8);
    sign_extend((imm12 << 12) | (imm11 << 11) | (imm10_5 << 5) | (imm4_1 << 1), 13)
}

pub fn imm_utype(word: u32) -> i32 {
    (word & 0xffff_f000) as i32
}

pub fn imm_jtype(word: u32) -> i32 {
    let imm20 = extract_field(word, 31, 31);
    let imm19_12 = extract_field(word, 19, 12);
    let imm11 = extract_field(word, 20, 20);
    let imm10_1 = extract_field(word, 30, 21);
    sign_extend(
        (imm20 << 20) | (imm19_12 << 12) | (imm11 << 11) | (imm10_1 << 1),
        21,
    )
}

/// Classify a word's format from its opcode.
pub fn format_of(word: u32) -> Result<Format, DisasmError> {
    match opcode7(word) {
        OP | OP_32 => Ok(Format::R),
        OP_IMM | OP_IMM_32 | OP_LOAD | OP_JALR | OP_SYSTEM | OP_CUSTOM_0 => Ok(Format::I),
        OP_STORE => Ok(Format::S),
        OP_BRANCH => Ok(Format::B),
        OP_LUI | OP_AUIPC => Ok(Format::U),
        OP_JAL => Ok(Format::J),
        _ => Err(DisasmError::UnknownInstruction { word }),
    }
}

/// Rebuild the instruction value a word was encoded from.
pub fn disassemble(word: u32) -> Result<Instr, DisasmError> {
    let format = format_of(word)?;
    let opcode = opcode7(word);
    let instr = match format {
        Format::R => Instr {
            format,
            opcode,
            funct3: funct3(word),
            funct7: funct7(word),
            rd: rd(word),
            rs1: rs1(word),
            rs2: rs2(word),
            imm: 0,
        },
        Format::I => Instr {
            format,
            opcode,
            funct3: funct3(word),
            funct7: 0,
            rd: rd(word),
            rs1: rs1(word),
            rs2: 0,
            imm: imm_itype(word),
        },
        Format::S => Instr {
            format,
            opcode,
            funct3: funct3(word),
            funct7: 0,
            rd: 0,
            rs1: rs1(word),
            rs2: rs2(word),
            imm: imm_stype(word),
        },
        Format::B => Instr {
            format,
            opcode,
            funct3: funct3(word),
            funct7: 0,
            rd: 0,
            rs1: rs1(word),
            rs2: rs2(word),
            imm: imm_btype(word),
        },
        Format::U => Instr {
            format,
            opcode,
            funct3: 0,
            funct7: 0,
            rd: rd(word),
            rs1: 0,
            rs2: 0,
            imm: imm_utype(word),
        },
        Format::J => Instr {
            format,
            opcode,
            funct3: 0,
            funct7: 0,
            rd: rd(word),
            rs1: 0,
            rs2: 0,
            imm: imm_jtype(word),
        },
    };
    Ok(instr)
}
