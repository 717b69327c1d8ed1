//! Opcode and function-field constants for the RV64IM subset emitted by the
//! generator. Values are from the instruction listings in chapter 19 of the
//! RISC-V specification.

pub const OP_LUI: u32 = 0b0110111;
pub const OP_AUIPC: u32 = 0b0010111;
pub const OP_JAL: u32 = 0b1101111;
pub const OP_JALR: u32 = 0b1100111;
pub const OP_BRANCH: u32 = 0b1100011;
pub const OP_LOAD: u32 = 0b0000011;
pub const OP_STORE: u32 = 0b0100011;
pub const OP_IMM: u32 = 0b0010011;
pub const OP: u32 = 0b0110011;
pub const OP_IMM_32: u32 = 0b0011011;
pub const OP_32: u32 = 0b0111011;
pub const OP_SYSTEM: u32 = 0b1110011;

/// Custom-0 opcode, the conventional home for vendor extensions. The
/// domain-switch instructions of the isolation overlay live here.
pub const OP_CUSTOM_0: u32 = 0b0001011;

pub const FUNCT3_BEQ: u32 = 0b000;
pub const FUNCT3_BNE: u32 = 0b001;
pub const FUNCT3_BLT: u32 = 0b100;
pub const FUNCT3_BGE: u32 = 0b101;
pub const FUNCT3_BLTU: u32 = 0b110;
pub const FUNCT3_BGEU: u32 = 0b111;

/// funct7 for the multiply/divide family (RV32M/RV64M).
pub const FUNCT7_MULDIV: u32 = 0b0000001;
/// funct7 distinguishing sub from add and sra from srl.
pub const FUNCT7_SUB_SRA: u32 = 0b0100000;
