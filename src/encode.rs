//! Bit-level packers for the six RISC-V instruction formats.
//!
//! These are pure field shufflers: callers are responsible for range-checking
//! immediates (see `Instr::encode`). Immediates arrive here as u32 bit
//! patterns, already reinterpreted from their signed values.

use crate::utils::extract_field;

/// Make an I-type instruction word.
pub fn itype(imm: u32, rs1: u32, funct3: u32, rd: u32, opcode: u32) -> u32 {
    (imm & 0xfff) << 20 | rs1 << 15 | funct3 << 12 | rd << 7 | opcode
}

/// Make an U- or J-type instruction word. `imm` is the pre-shuffled 20-bit
/// field (use `jtype_imm_field` to build it for J-type).
pub fn ujtype(imm: u32, rd: u32, opcode: u32) -> u32 {
    (imm & 0xfffff) << 12 | rd << 7 | opcode
}

/// Make an R- or S-type instruction word. These formats have the same field
/// layout; the meaning of a and b is:
///
/// R-type: a = funct7, b = rd
/// S-type: a = imm[11:5], b = imm[4:0]
pub fn rstype(a: u32, rs2: u32, rs1: u32, funct3: u32, b: u32, opcode: u32) -> u32 {
    a << 25 | rs2 << 20 | rs1 << 15 | funct3 << 12 | b << 7 | opcode
}

/// Shuffle an immediate into the 20-bit field of the U-type layout, making
/// it a J-type instruction.
pub fn jtype_imm_field(imm: u32) -> u32 {
    let imm20 = extract_field(imm, 20, 20);
    let imm19_12 = extract_field(imm, 19, 12);
    let imm11 = extract_field(imm, 11, 11);
    let imm10_1 = extract_field(imm, 10, 1);
    (imm20 << 19) | (imm10_1 << 9) | (imm11 << 8) | imm19_12
}

/// Returns (a, b) suitable for use with `rstype` for the conditional branch
/// instructions.
pub fn btype_imm_fields(imm: u32) -> (u32, u32) {
    let imm12 = extract_field(imm, 12, 12);
    let imm11 = extract_field(imm, 11, 11);
    let imm10_5 = extract_field(imm, 10, 5);
    let imm4_1 = extract_field(imm, 4, 1);
    let a = (imm12 << 6) | imm10_5;
    let b = (imm4_1 << 1) | imm11;
    (a, b)
}

/// The RV64 shift-by-immediate instructions use the I-type layout with the
/// lower 6 bits holding the shift amount and the upper 6 bits distinguishing
/// arithmetical from logical right shift.
pub fn shifts_imm_field(shamt: u32, upper: u32) -> u32 {
    let shamt = extract_field(shamt, 5, 0);
    (upper << 6) | shamt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_itype_packing() {
        // addi x5, x6, 255
        let word = itype(255, 6, 0b000, 5, 0b0010011);
        assert_eq!(word, 0x0ff3_0293);
    }

    #[test]
    fn check_rstype_r_packing() {
        // add x4, x1, x2
        let word = rstype(0, 2, 1, 0b000, 4, 0b0110011);
        assert_eq!(word, 0x0020_8233);
    }

    #[test]
    fn check_jtype_imm_field_roundtrip() {
        // jal offset bits land back where the decoder expects them
        let field = jtype_imm_field(0x0010_0452 & 0x001f_fffe);
        let word = ujtype(field, 0, 0b1101111);
        let imm20 = extract_field(word, 31, 31);
        let imm10_1 = extract_field(word, 30, 21);
        let imm11 = extract_field(word, 20, 20);
        let imm19_12 = extract_field(word, 19, 12);
        let rebuilt = (imm20 << 20) | (imm19_12 << 12) | (imm11 << 11) | (imm10_1 << 1);
        assert_eq!(rebuilt, 0x0010_0452 & 0x001f_fffe);
    }

    #[test]
    fn check_btype_imm_fields() {
        let (a, b) = btype_imm_fields(8);
        let word = rstype(a, 5, 7, 0b001, b, 0b1100011);
        let imm12 = extract_field(word, 31, 31);
        let imm10_5 = extract_field(word, 30, 25);
        let imm4_1 = extract_field(word, 11, 8);
        let imm11 = extract_field(word, 7, 7);
        let rebuilt = (imm12 << 12) | (imm11 << 11) | (imm10_5 << 5) | (imm4_1 << 1);
        assert_eq!(rebuilt, 8);
    }

    #[test]
    fn check_shifts_imm_field() {
        assert_eq!(shifts_imm_field(63, 0b000000), 63);
        assert_eq!(shifts_imm_field(1, 0b010000), 0x401);
    }
}
