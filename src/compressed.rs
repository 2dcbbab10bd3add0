//! RVC (C extension) expansion: a pure function from a 16-bit compressed
//! parcel to its equivalent 32-bit RV32I/M/A encoding.
//!
//! This module has no dependency on [`crate::cpu::Cpu`] — it is a pure
//! table lookup plus bit twiddling, which is what makes it cheap to put
//! behind the content-addressed decode cache in [`crate::instruction`].
//!
//! Callers must only pass parcels with `c_inst & 0b11 != 0b11`; a 32-bit
//! instruction's low halfword (which always has `inst[1:0] == 0b11`) is not
//! a valid input here.

/// Opcode of a 32-bit `OP-IMM` instruction.
const OP_IMM: u32 = 0b001_0011;
/// Opcode of a 32-bit `LUI` instruction.
const LUI: u32 = 0b011_0111;
/// Opcode of a 32-bit `JAL` instruction.
const JAL: u32 = 0b110_1111;
/// Opcode of a 32-bit `JALR` instruction.
const JALR: u32 = 0b110_0111;
/// Opcode of a 32-bit `BRANCH` instruction.
const BRANCH: u32 = 0b110_0011;
/// Opcode of a 32-bit `LOAD` instruction.
const LOAD: u32 = 0b000_0011;
/// Opcode of a 32-bit `STORE` instruction.
const STORE: u32 = 0b010_0011;
/// Opcode of a 32-bit `OP` (register-register) instruction.
const OP: u32 = 0b011_0011;
/// Opcode of a 32-bit `SYSTEM` instruction.
const SYSTEM: u32 = 0b111_0011;

/// Expands a 16-bit compressed instruction into its 32-bit equivalent.
///
/// Returns `(expansion, true)` for a legal encoding, or `(_, false)` for a
/// reserved or otherwise illegal one; the caller should raise an
/// illegal-instruction trap in the latter case and must not use the
/// returned expansion.
pub fn expand_compressed(c_inst: u16) -> (u32, bool) {
    let c = c_inst as u32;
    let quadrant = c & 0b11;
    let funct3 = (c >> 13) & 0b111;
    match quadrant {
        0b00 => expand_q0(c, funct3),
        0b01 => expand_q1(c, funct3),
        0b10 => expand_q2(c, funct3),
        _ => (0, false), // inst[1:0] == 0b11 is not a compressed parcel
    }
}

/// Maps a 3-bit compressed register field to its `x8..=x15` register number.
fn creg(bits3: u32) -> u32 {
    bits3 + 8
}

fn encode_r(funct7: u32, rs2: u32, rs1: u32, funct3: u32, rd: u32, opcode: u32) -> u32 {
    (funct7 << 25) | (rs2 << 20) | (rs1 << 15) | (funct3 << 12) | (rd << 7) | opcode
}

fn encode_i(imm12: i32, rs1: u32, funct3: u32, rd: u32, opcode: u32) -> u32 {
    (((imm12 as u32) & 0xFFF) << 20) | (rs1 << 15) | (funct3 << 12) | (rd << 7) | opcode
}

fn encode_s(imm12: i32, rs2: u32, rs1: u32, funct3: u32, opcode: u32) -> u32 {
    let imm = imm12 as u32 & 0xFFF;
    let imm_hi = (imm >> 5) & 0x7F;
    let imm_lo = imm & 0x1F;
    (imm_hi << 25) | (rs2 << 20) | (rs1 << 15) | (funct3 << 12) | (imm_lo << 7) | opcode
}

fn encode_b(offset: i32, rs2: u32, rs1: u32, funct3: u32, opcode: u32) -> u32 {
    let imm = offset as u32;
    let b12 = (imm >> 12) & 0b1;
    let b11 = (imm >> 11) & 0b1;
    let b10_5 = (imm >> 5) & 0x3F;
    let b4_1 = (imm >> 1) & 0xF;
    (b12 << 31)
        | (b10_5 << 25)
        | (rs2 << 20)
        | (rs1 << 15)
        | (funct3 << 12)
        | (b4_1 << 8)
        | (b11 << 7)
        | opcode
}

fn encode_u(imm_upper20: u32, rd: u32, opcode: u32) -> u32 {
    (imm_upper20 << 12) | (rd << 7) | opcode
}

fn encode_j(offset: i32, rd: u32, opcode: u32) -> u32 {
    let imm = offset as u32;
    let b20 = (imm >> 20) & 0b1;
    let b19_12 = (imm >> 12) & 0xFF;
    let b11 = (imm >> 11) & 0b1;
    let b10_1 = (imm >> 1) & 0x3FF;
    (b20 << 31) | (b10_1 << 21) | (b11 << 20) | (b19_12 << 12) | (rd << 7) | opcode
}

fn sext(value: u32, sign_bit: u32) -> i32 {
    let shift = 31 - sign_bit;
    (((value << shift) as i32) >> shift) as i32
}

fn expand_q0(c: u32, funct3: u32) -> (u32, bool) {
    let rd_prime = creg((c >> 2) & 0b111);
    let rs1_prime = creg((c >> 7) & 0b111);
    match funct3 {
        0b000 => {
            // C.ADDI4SPN
            let nzuimm = (((c >> 11) & 0b11) << 4)
                | (((c >> 7) & 0b1111) << 6)
                | (((c >> 6) & 0b1) << 2)
                | (((c >> 5) & 0b1) << 3);
            if nzuimm == 0 {
                return (0, false);
            }
            (encode_i(nzuimm as i32, 2, 0b000, rd_prime, OP_IMM), true)
        }
        0b010 => {
            // C.LW
            let uimm = (((c >> 10) & 0b111) << 3) | (((c >> 6) & 0b1) << 2) | (((c >> 5) & 0b1) << 6);
            (
                encode_i(uimm as i32, rs1_prime, 0b010, rd_prime, LOAD),
                true,
            )
        }
        0b110 => {
            // C.SW
            let rs2_prime = creg((c >> 2) & 0b111);
            let uimm = (((c >> 10) & 0b111) << 3) | (((c >> 6) & 0b1) << 2) | (((c >> 5) & 0b1) << 6);
            (
                encode_s(uimm as i32, rs2_prime, rs1_prime, 0b010, STORE),
                true,
            )
        }
        _ => (0, false),
    }
}

fn expand_q1(c: u32, funct3: u32) -> (u32, bool) {
    let rd_rs1 = (c >> 7) & 0x1F;
    match funct3 {
        0b000 => {
            // C.NOP / C.ADDI
            let imm = sext((((c >> 12) & 0b1) << 5) | ((c >> 2) & 0x1F), 5);
            (encode_i(imm, rd_rs1, 0b000, rd_rs1, OP_IMM), true)
        }
        0b001 => {
            // C.JAL (RV32 only)
            let offset = decode_cj_offset(c);
            (encode_j(offset, 1, JAL), true)
        }
        0b010 => {
            // C.LI
            let imm = sext((((c >> 12) & 0b1) << 5) | ((c >> 2) & 0x1F), 5);
            (encode_i(imm, 0, 0b000, rd_rs1, OP_IMM), true)
        }
        0b011 => {
            if rd_rs1 == 2 {
                // C.ADDI16SP
                let imm = sext(
                    (((c >> 12) & 0b1) << 9)
                        | (((c >> 6) & 0b1) << 4)
                        | (((c >> 5) & 0b1) << 6)
                        | (((c >> 3) & 0b11) << 7)
                        | (((c >> 2) & 0b1) << 5),
                    9,
                );
                if imm == 0 {
                    return (0, false);
                }
                (encode_i(imm, 2, 0b000, 2, OP_IMM), true)
            } else if rd_rs1 != 0 {
                // C.LUI
                let raw = (((c >> 12) & 0b1) << 5) | ((c >> 2) & 0x1F);
                if raw == 0 {
                    return (0, false);
                }
                let imm17 = sext(raw, 5); // sign-extend the raw 6-bit field
                let imm_upper20 = (imm17 as u32) & 0xF_FFFF;
                (encode_u(imm_upper20, rd_rs1, LUI), true)
            } else {
                (0, false)
            }
        }
        0b100 => {
            let funct2 = (c >> 10) & 0b11;
            let rd_rs1_prime = creg((c >> 7) & 0b111);
            match funct2 {
                0b00 | 0b01 => {
                    // C.SRLI / C.SRAI
                    if (c >> 12) & 0b1 != 0 {
                        return (0, false); // shamt[5] must be 0 for RV32
                    }
                    let shamt = (c >> 2) & 0x1F;
                    let funct7 = if funct2 == 0b00 { 0b0000000 } else { 0b0100000 };
                    (
                        encode_r(funct7, shamt, rd_rs1_prime, 0b101, rd_rs1_prime, OP_IMM),
                        true,
                    )
                }
                0b10 => {
                    // C.ANDI
                    let imm = sext((((c >> 12) & 0b1) << 5) | ((c >> 2) & 0x1F), 5);
                    (
                        encode_i(imm, rd_rs1_prime, 0b111, rd_rs1_prime, OP_IMM),
                        true,
                    )
                }
                0b11 => {
                    if (c >> 12) & 0b1 != 0 {
                        return (0, false); // *W variants are RV64-only, reserved here
                    }
                    let rs2_prime = creg((c >> 2) & 0b111);
                    let (funct7, funct3_op) = match (c >> 5) & 0b11 {
                        0b00 => (0b0100000, 0b000), // SUB
                        0b01 => (0b0000000, 0b100), // XOR
                        0b10 => (0b0000000, 0b110), // OR
                        0b11 => (0b0000000, 0b111), // AND
                        _ => unreachable!(),
                    };
                    (
                        encode_r(funct7, rs2_prime, rd_rs1_prime, funct3_op, rd_rs1_prime, OP),
                        true,
                    )
                }
                _ => (0, false),
            }
        }
        0b101 => {
            // C.J
            let offset = decode_cj_offset(c);
            (encode_j(offset, 0, JAL), true)
        }
        0b110 | 0b111 => {
            // C.BEQZ / C.BNEZ
            let rs1_prime = creg((c >> 7) & 0b111);
            let offset = decode_cb_offset(c);
            let branch_funct3 = if funct3 == 0b110 { 0b000 } else { 0b001 };
            (
                encode_b(offset, 0, rs1_prime, branch_funct3, BRANCH),
                true,
            )
        }
        _ => (0, false),
    }
}

fn expand_q2(c: u32, funct3: u32) -> (u32, bool) {
    let rd_rs1 = (c >> 7) & 0x1F;
    match funct3 {
        0b000 => {
            // C.SLLI
            if rd_rs1 == 0 {
                return (0, false);
            }
            if (c >> 12) & 0b1 != 0 {
                return (0, false); // shamt[5] must be 0 for RV32
            }
            let shamt = (c >> 2) & 0x1F;
            if shamt == 0 {
                return (0, false);
            }
            (
                encode_r(0b0000000, shamt, rd_rs1, 0b001, rd_rs1, OP_IMM),
                true,
            )
        }
        0b010 => {
            // C.LWSP
            if rd_rs1 == 0 {
                return (0, false);
            }
            let offset =
                (((c >> 12) & 0b1) << 5) | (((c >> 4) & 0b111) << 2) | (((c >> 2) & 0b11) << 6);
            (encode_i(offset as i32, 2, 0b010, rd_rs1, LOAD), true)
        }
        0b100 => {
            let bit12 = (c >> 12) & 0b1;
            let rs2 = (c >> 2) & 0x1F;
            if bit12 == 0 {
                if rs2 == 0 {
                    // C.JR
                    if rd_rs1 == 0 {
                        return (0, false);
                    }
                    (encode_i(0, rd_rs1, 0b000, 0, JALR), true)
                } else {
                    // C.MV
                    if rd_rs1 == 0 {
                        return (0, false);
                    }
                    (encode_r(0, rs2, 0, 0b000, rd_rs1, OP), true)
                }
            } else if rd_rs1 == 0 && rs2 == 0 {
                // C.EBREAK
                (0x0010_0073, true)
            } else if rs2 == 0 {
                // C.JALR
                if rd_rs1 == 0 {
                    return (0, false);
                }
                (encode_i(0, rd_rs1, 0b000, 1, JALR), true)
            } else {
                // C.ADD
                if rd_rs1 == 0 {
                    return (0, false);
                }
                (encode_r(0, rs2, rd_rs1, 0b000, rd_rs1, OP), true)
            }
        }
        0b110 => {
            // C.SWSP
            let rs2 = (c >> 2) & 0x1F;
            let offset = (((c >> 9) & 0xF) << 2) | (((c >> 7) & 0b11) << 6);
            (encode_s(offset as i32, rs2, 2, 0b010, STORE), true)
        }
        _ => {
            let _ = SYSTEM; // SYSTEM is reachable only via the C.EBREAK literal above
            (0, false)
        }
    }
}

fn decode_cj_offset(c: u32) -> i32 {
    let raw = (((c >> 12) & 0b1) << 11)
        | (((c >> 11) & 0b1) << 4)
        | (((c >> 9) & 0b11) << 8)
        | (((c >> 8) & 0b1) << 10)
        | (((c >> 7) & 0b1) << 6)
        | (((c >> 6) & 0b1) << 7)
        | (((c >> 3) & 0b111) << 1)
        | (((c >> 2) & 0b1) << 5);
    sext(raw, 11)
}

fn decode_cb_offset(c: u32) -> i32 {
    let raw = (((c >> 12) & 0b1) << 8)
        | (((c >> 10) & 0b11) << 3)
        | (((c >> 5) & 0b11) << 6)
        | (((c >> 3) & 0b11) << 1)
        | (((c >> 2) & 0b1) << 5);
    sext(raw, 8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn c_li_a0_7() {
        // C.LI a0, 7 => 0x451D
        let (expansion, valid) = expand_compressed(0x451D);
        assert!(valid);
        // addi a0(x10), x0, 7 => 0x00700513
        assert_eq!(0x0070_0513, expansion);
    }

    #[test]
    fn c_addi4spn_zero_immediate_illegal() {
        // quadrant 00, funct3 000, all immediate bits zero -> illegal
        let (_, valid) = expand_compressed(0b000_00000000_00_00);
        assert!(!valid);
    }

    #[test]
    fn c_lui_zero_immediate_illegal() {
        // C.LUI with rd=1, imm bits all zero
        let c: u16 = 0b011_0_00001_00000_01;
        let (_, valid) = expand_compressed(c);
        assert!(!valid);
    }

    #[test]
    fn c_jr_ra() {
        // C.JR ra => funct4=1000, rs1=x1, rs2=0, quadrant 10
        let c: u16 = 0b1000_00001_00000_10;
        let (expansion, valid) = expand_compressed(c);
        assert!(valid);
        assert_eq!(encode_i(0, 1, 0b000, 0, JALR), expansion);
    }

    #[test]
    fn c_ebreak() {
        let c: u16 = 0b1001_00000_00000_10;
        let (expansion, valid) = expand_compressed(c);
        assert!(valid);
        assert_eq!(0x0010_0073, expansion);
    }

    #[test]
    fn c_add() {
        // C.ADD x10, x10, x11 => funct4=1001, rd/rs1=10, rs2=11
        let c: u16 = 0b1001_01010_01011_10;
        let (expansion, valid) = expand_compressed(c);
        assert!(valid);
        assert_eq!(encode_r(0, 11, 10, 0b000, 10, OP), expansion);
    }

    #[test]
    fn c_beqz() {
        // C.BEQZ x8, 0 (offset zero is legal, just a tight loop)
        let c: u16 = 0b110_0_00_000_00_000_01;
        let (_, valid) = expand_compressed(c);
        assert!(valid);
    }

    #[test]
    fn c_slli_zero_shamt_illegal() {
        let c: u16 = 0b000_0_00001_00000_10;
        let (_, valid) = expand_compressed(c);
        assert!(!valid);
    }

    #[test]
    fn c_lwsp_rd_zero_illegal() {
        let c: u16 = 0b010_0_00000_00001_10;
        let (_, valid) = expand_compressed(c);
        assert!(!valid);
    }
}
