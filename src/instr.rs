//! The instruction value type and its constructors.
//!
//! An `Instr` is an immutable record of (format kind, opcode, function
//! fields, registers, immediate); fields unused by a format are zero. One
//! constructor exists per supported mnemonic of the RV64IM subset. The only
//! consumers are `encode`, which packs the fields into a 32-bit word, and
//! `bytes`, which emits the word as four little-endian bytes.

use crate::encode::{btype_imm_fields, itype, jtype_imm_field, rstype, shifts_imm_field, ujtype};
use crate::errors::EncodingError;
use crate::opcodes::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    R,
    I,
    S,
    B,
    U,
    J,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instr {
    pub format: Format,
    pub opcode: u32,
    pub funct3: u32,
    pub funct7: u32,
    pub rd: u32,
    pub rs1: u32,
    pub rs2: u32,
    pub imm: i32,
}

macro_rules! rtype_instr {
    ($name:ident, $funct7:expr, $funct3:expr, $opcode:expr) => {
        pub fn $name(rd: u32, rs1: u32, rs2: u32) -> Self {
            Self::rtype($opcode, $funct3, $funct7, rd, rs1, rs2)
        }
    };
}

macro_rules! itype_instr {
    ($name:ident, $funct3:expr, $opcode:expr) => {
        pub fn $name(rd: u32, rs1: u32, imm: i32) -> Self {
            Self::itype($opcode, $funct3, rd, rs1, imm)
        }
    };
}

/// The shift-by-immediate instructions share the I-type layout; `upper` is
/// zero except for arithmetical right shifts (0b010000).
macro_rules! shift_instr {
    ($name:ident, $upper:expr, $funct3:expr, $opcode:expr) => {
        pub fn $name(rd: u32, rs1: u32, shamt: u32) -> Self {
            Self::itype($opcode, $funct3, rd, rs1, shifts_imm_field(shamt, $upper) as i32)
        }
    };
}

macro_rules! stype_instr {
    ($name:ident, $funct3:expr) => {
        pub fn $name(rs1: u32, rs2: u32, imm: i32) -> Self {
            Self::stype($funct3, rs1, rs2, imm)
        }
    };
}

macro_rules! btype_instr {
    ($name:ident, $funct3:expr) => {
        pub fn $name(rs1: u32, rs2: u32, imm: i32) -> Self {
            Self::btype($funct3, rs1, rs2, imm)
        }
    };
}

impl Instr {
    pub(crate) fn rtype(opcode: u32, funct3: u32, funct7: u32, rd: u32, rs1: u32, rs2: u32) -> Self {
        Self {
            format: Format::R,
            opcode,
            funct3,
            funct7,
            rd,
            rs1,
            rs2,
            imm: 0,
        }
    }

    pub(crate) fn itype(opcode: u32, funct3: u32, rd: u32, rs1: u32, imm: i32) -> Self {
        Self {
            format: Format::I,
            opcode,
            funct3,
            funct7: 0,
            rd,
            rs1,
            rs2: 0,
            imm,
        }
    }

    pub(crate) fn stype(funct3: u32, rs1: u32, rs2: u32, imm: i32) -> Self {
        Self {
            format: Format::S,
            opcode: OP_STORE,
            funct3,
            funct7: 0,
            rd: 0,
            rs1,
            rs2,
            imm,
        }
    }

    pub(crate) fn btype(funct3: u32, rs1: u32, rs2: u32, imm: i32) -> Self {
        Self {
            format: Format::B,
            opcode: OP_BRANCH,
            funct3,
            funct7: 0,
            rd: 0,
            rs1,
            rs2,
            imm,
        }
    }

    /// U-type constructors take the full 32-bit upper value (for instance the
    /// high half of a split offset); only bits 31:12 are kept.
    pub(crate) fn utype(opcode: u32, rd: u32, imm: u32) -> Self {
        Self {
            format: Format::U,
            opcode,
            funct3: 0,
            funct7: 0,
            rd,
            rs1: 0,
            rs2: 0,
            imm: (imm & 0xffff_f000) as i32,
        }
    }

    pub(crate) fn jtype(rd: u32, imm: i32) -> Self {
        Self {
            format: Format::J,
            opcode: OP_JAL,
            funct3: 0,
            funct7: 0,
            rd,
            rs1: 0,
            rs2: 0,
            imm,
        }
    }

    // === RV32I and RV64I ===

    pub fn lui(rd: u32, imm: u32) -> Self {
        Self::utype(OP_LUI, rd, imm)
    }

    pub fn auipc(rd: u32, imm: u32) -> Self {
        Self::utype(OP_AUIPC, rd, imm)
    }

    pub fn jal(rd: u32, imm: i32) -> Self {
        Self::jtype(rd, imm)
    }

    itype_instr!(jalr, 0b000, OP_JALR);

    // Conditional branches
    btype_instr!(beq, FUNCT3_BEQ);
    btype_instr!(bne, FUNCT3_BNE);
    btype_instr!(blt, FUNCT3_BLT);
    btype_instr!(bge, FUNCT3_BGE);
    btype_instr!(bltu, FUNCT3_BLTU);
    btype_instr!(bgeu, FUNCT3_BGEU);

    // Loads
    itype_instr!(lb, 0b000, OP_LOAD);
    itype_instr!(lh, 0b001, OP_LOAD);
    itype_instr!(lw, 0b010, OP_LOAD);
    itype_instr!(lbu, 0b100, OP_LOAD);
    itype_instr!(lhu, 0b101, OP_LOAD);
    // 64-bit
    itype_instr!(lwu, 0b110, OP_LOAD);
    itype_instr!(ld, 0b011, OP_LOAD);

    // Stores
    stype_instr!(sb, 0b000);
    stype_instr!(sh, 0b001);
    stype_instr!(sw, 0b010);
    // 64-bit
    stype_instr!(sd, 0b011);

    // Integer register-immediate instructions
    itype_instr!(addi, 0b000, OP_IMM);
    itype_instr!(slti, 0b010, OP_IMM);
    itype_instr!(sltiu, 0b011, OP_IMM);
    itype_instr!(xori, 0b100, OP_IMM);
    itype_instr!(ori, 0b110, OP_IMM);
    itype_instr!(andi, 0b111, OP_IMM);
    // 64-bit
    itype_instr!(addiw, 0b000, OP_IMM_32);

    // Shift-by-immediate instructions (64-bit shamt)
    shift_instr!(slli, 0b000000, 0b001, OP_IMM);
    shift_instr!(srli, 0b000000, 0b101, OP_IMM);
    shift_instr!(srai, 0b010000, 0b101, OP_IMM);

    // Integer register-register instructions
    rtype_instr!(add, 0b0000000, 0b000, OP);
    rtype_instr!(sub, FUNCT7_SUB_SRA, 0b000, OP);
    rtype_instr!(sll, 0b0000000, 0b001, OP);
    rtype_instr!(slt, 0b0000000, 0b010, OP);
    rtype_instr!(sltu, 0b0000000, 0b011, OP);
    rtype_instr!(xor, 0b0000000, 0b100, OP);
    rtype_instr!(srl, 0b0000000, 0b101, OP);
    rtype_instr!(sra, FUNCT7_SUB_SRA, 0b101, OP);
    rtype_instr!(or, 0b0000000, 0b110, OP);
    rtype_instr!(and, 0b0000000, 0b111, OP);
    // 64-bit
    rtype_instr!(addw, 0b0000000, 0b000, OP_32);
    rtype_instr!(subw, FUNCT7_SUB_SRA, 0b000, OP_32);
    rtype_instr!(sllw, 0b0000000, 0b001, OP_32);
    rtype_instr!(srlw, 0b0000000, 0b101, OP_32);
    rtype_instr!(sraw, FUNCT7_SUB_SRA, 0b101, OP_32);

    // === RV32M and RV64M ===

    rtype_instr!(mul, FUNCT7_MULDIV, 0b000, OP);
    rtype_instr!(mulh, FUNCT7_MULDIV, 0b001, OP);
    rtype_instr!(mulhsu, FUNCT7_MULDIV, 0b010, OP);
    rtype_instr!(mulhu, FUNCT7_MULDIV, 0b011, OP);
    rtype_instr!(div, FUNCT7_MULDIV, 0b100, OP);
    rtype_instr!(divu, FUNCT7_MULDIV, 0b101, OP);
    rtype_instr!(rem, FUNCT7_MULDIV, 0b110, OP);
    rtype_instr!(remu, FUNCT7_MULDIV, 0b111, OP);
    // 64-bit
    rtype_instr!(mulw, FUNCT7_MULDIV, 0b000, OP_32);
    rtype_instr!(divw, FUNCT7_MULDIV, 0b100, OP_32);
    rtype_instr!(divuw, FUNCT7_MULDIV, 0b101, OP_32);
    rtype_instr!(remw, FUNCT7_MULDIV, 0b110, OP_32);
    rtype_instr!(remuw, FUNCT7_MULDIV, 0b111, OP_32);

    // === Pseudo-instructions and system ===

    pub fn nop() -> Self {
        Self::addi(0, 0, 0)
    }

    /// jalr x0, ra, 0
    pub fn ret() -> Self {
        Self::jalr(0, 1, 0)
    }

    /// jalr x0, rs1, 0
    pub fn jr(rs1: u32) -> Self {
        Self::jalr(0, rs1, 0)
    }

    pub fn ebreak() -> Self {
        Self::itype(OP_SYSTEM, 0b000, 0, 0, 1)
    }

    /// Pack the fields into a 32-bit instruction word. Immediate range is
    /// validated against the signed width of the format.
    pub fn encode(&self) -> Result<u32, EncodingError> {
        let out_of_range = |imm: i32| EncodingError {
            format: self.format,
            imm,
        };
        let word = match self.format {
            Format::R => rstype(
                self.funct7,
                self.rs2,
                self.rs1,
                self.funct3,
                self.rd,
                self.opcode,
            ),
            Format::I => {
                if !(-0x800..=0x7ff).contains(&self.imm) {
                    return Err(out_of_range(self.imm));
                }
                itype(self.imm as u32, self.rs1, self.funct3, self.rd, self.opcode)
            }
            Format::S => {
                if !(-0x800..=0x7ff).contains(&self.imm) {
                    return Err(out_of_range(self.imm));
                }
                let imm = self.imm as u32;
                let imm11_5 = (imm >> 5) & 0x7f;
                let imm4_0 = imm & 0x1f;
                rstype(imm11_5, self.rs2, self.rs1, self.funct3, imm4_0, self.opcode)
            }
            Format::B => {
                if !(-0x1000..=0xffe).contains(&self.imm) || self.imm % 2 != 0 {
                    return Err(out_of_range(self.imm));
                }
                let (a, b) = btype_imm_fields(self.imm as u32);
                rstype(a, self.rs2, self.rs1, self.funct3, b, self.opcode)
            }
            Format::U => ujtype((self.imm as u32) >> 12, self.rd, self.opcode),
            Format::J => {
                if !(-0x10_0000..=0xf_fffe).contains(&self.imm) || self.imm % 2 != 0 {
                    return Err(out_of_range(self.imm));
                }
                ujtype(jtype_imm_field(self.imm as u32), self.rd, self.opcode)
            }
        };
        Ok(word)
    }

    /// The instruction word as four little-endian bytes.
    pub fn bytes(&self) -> Result<[u8; 4], EncodingError> {
        Ok(self.encode()?.to_le_bytes())
    }
}

/// Encode a slice of instructions into one contiguous byte vector.
pub fn consolidate_bytes(instructions: &[Instr]) -> Result<Vec<u8>, EncodingError> {
    let mut out = Vec::with_capacity(instructions.len() * 4);
    for instr in instructions {
        out.extend_from_slice(&instr.bytes()?);
    }
    Ok(out)
}
