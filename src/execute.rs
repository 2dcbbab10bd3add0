//! Per-opcode instruction semantics and the opcode dispatch table that
//! [`crate::cpu::Cpu::execute_32`]/`execute_16` call into.
//!
//! Handlers receive `(cpu, mem, inst, fields)`, matching the reference's
//! `(cpu, mem, inst, rd, funct3, rs1, rs2, funct7)` handler contract —
//! `fields` is the decoded-field tuple, already resolved through the decode
//! cache by the caller.

use crate::cpu::Cpu;
use crate::csr::CsrSpecifier;
use crate::error::StepError;
use crate::instruction::DecodedFields;
use crate::memory::Memory;
use crate::registers::Specifier;
use crate::trap;
use log::info;

const OP_IMM: u32 = 0b001_0011;
const LUI: u32 = 0b011_0111;
const AUIPC: u32 = 0b001_0111;
const JAL: u32 = 0b110_1111;
const JALR: u32 = 0b110_0111;
const BRANCH: u32 = 0b110_0011;
const LOAD: u32 = 0b000_0011;
const STORE: u32 = 0b010_0011;
const MISC_MEM: u32 = 0b000_1111;
const OP: u32 = 0b011_0011;
const AMO: u32 = 0b010_1111;
const SYSTEM: u32 = 0b111_0011;

/// Dispatches a decoded instruction to its opcode handler.
pub fn dispatch(
    cpu: &mut Cpu,
    mem: &mut Memory,
    inst: u32,
    fields: DecodedFields,
) -> Result<(), StepError> {
    match fields.opcode {
        OP_IMM => op_imm(cpu, inst, fields),
        LUI => {
            cpu.set_x(fields.rd, u_imm(inst));
            Ok(())
        }
        AUIPC => {
            cpu.set_x(fields.rd, cpu.pc().wrapping_add(u_imm(inst)));
            Ok(())
        }
        JAL => jal(cpu, inst, fields),
        JALR => jalr(cpu, inst, fields),
        BRANCH => branch(cpu, inst, fields),
        LOAD => load(cpu, mem, inst, fields),
        STORE => store(cpu, mem, inst, fields),
        MISC_MEM => Ok(()), // FENCE / FENCE.I: no-ops
        OP => op(cpu, fields),
        AMO => amo(cpu, mem, inst, fields),
        SYSTEM => system(cpu, mem, inst, fields),
        _ => Ok(cpu.trap(trap::ILLEGAL_INSTRUCTION, inst, true)?),
    }
}

fn sext(value: u32, bits: u32) -> u32 {
    let shift = 32 - bits;
    (((value << shift) as i32) >> shift) as u32
}

fn i_imm(inst: u32) -> u32 {
    sext(inst >> 20, 12)
}

fn s_imm(inst: u32) -> u32 {
    let raw = ((inst >> 25) << 5) | ((inst >> 7) & 0x1F);
    sext(raw, 12)
}

fn b_imm(inst: u32) -> u32 {
    let raw = (((inst >> 31) & 0b1) << 12)
        | (((inst >> 7) & 0b1) << 11)
        | (((inst >> 25) & 0x3F) << 5)
        | (((inst >> 8) & 0xF) << 1);
    sext(raw, 13)
}

fn u_imm(inst: u32) -> u32 {
    inst & 0xFFFF_F000
}

fn j_imm(inst: u32) -> u32 {
    let raw = (((inst >> 31) & 0b1) << 20)
        | (((inst >> 12) & 0xFF) << 12)
        | (((inst >> 20) & 0b1) << 11)
        | (((inst >> 21) & 0x3FF) << 1);
    sext(raw, 21)
}

fn op_imm(cpu: &mut Cpu, inst: u32, fields: DecodedFields) -> Result<(), StepError> {
    let rs1 = cpu.x(fields.rs1);
    let imm = i_imm(inst);
    let shamt = u32::from(fields.rs2) & 0x1F;
    let result = match fields.funct3 {
        0b000 => rs1.wrapping_add(imm), // ADDI
        0b010 => ((rs1 as i32) < (imm as i32)) as u32, // SLTI
        0b011 => (rs1 < imm) as u32,    // SLTIU
        0b100 => rs1 ^ imm,             // XORI
        0b110 => rs1 | imm,             // ORI
        0b111 => rs1 & imm,             // ANDI
        0b001 => rs1 << shamt,          // SLLI
        0b101 => {
            // SRLI / SRAI, distinguished by funct7 bit 5
            if fields.funct7 & 0b010_0000 != 0 {
                ((rs1 as i32) >> shamt) as u32
            } else {
                rs1 >> shamt
            }
        }
        _ => unreachable!("funct3 is 3 bits, all 8 values handled"),
    };
    cpu.set_x(fields.rd, result);
    Ok(())
}

fn op(cpu: &mut Cpu, fields: DecodedFields) -> Result<(), StepError> {
    let rs1 = cpu.x(fields.rs1);
    let rs2 = cpu.x(fields.rs2);
    let result = if fields.funct7 == 0b0000001 {
        match fields.funct3 {
            0b000 => rs1.wrapping_mul(rs2), // MUL
            0b001 => (((rs1 as i32 as i64) * (rs2 as i32 as i64)) >> 32) as u32, // MULH
            0b010 => (((rs1 as i32 as i64) * (rs2 as i64)) >> 32) as u32, // MULHSU
            0b011 => (((rs1 as u64) * (rs2 as u64)) >> 32) as u32, // MULHU
            0b100 => div(rs1 as i32, rs2 as i32) as u32,
            0b101 => divu(rs1, rs2),
            0b110 => rem(rs1 as i32, rs2 as i32) as u32,
            0b111 => remu(rs1, rs2),
            _ => unreachable!("funct3 is 3 bits, all 8 values handled"),
        }
    } else {
        let shamt = rs2 & 0x1F;
        match fields.funct3 {
            0b000 => {
                if fields.funct7 & 0b010_0000 != 0 {
                    rs1.wrapping_sub(rs2) // SUB
                } else {
                    rs1.wrapping_add(rs2) // ADD
                }
            }
            0b001 => rs1 << shamt, // SLL
            0b010 => ((rs1 as i32) < (rs2 as i32)) as u32, // SLT
            0b011 => (rs1 < rs2) as u32, // SLTU
            0b100 => rs1 ^ rs2, // XOR
            0b101 => {
                if fields.funct7 & 0b010_0000 != 0 {
                    ((rs1 as i32) >> shamt) as u32 // SRA
                } else {
                    rs1 >> shamt // SRL
                }
            }
            0b110 => rs1 | rs2, // OR
            0b111 => rs1 & rs2, // AND
            _ => unreachable!("funct3 is 3 bits, all 8 values handled"),
        }
    };
    cpu.set_x(fields.rd, result);
    Ok(())
}

/// Signed division, truncating toward zero, with RISC-V's defined
/// divide-by-zero and overflow corner cases.
fn div(a: i32, b: i32) -> i32 {
    if b == 0 {
        -1
    } else if a == i32::MIN && b == -1 {
        i32::MIN
    } else {
        a.wrapping_div(b)
    }
}

fn divu(a: u32, b: u32) -> u32 {
    if b == 0 {
        u32::MAX
    } else {
        a / b
    }
}

fn rem(a: i32, b: i32) -> i32 {
    if b == 0 {
        a
    } else if a == i32::MIN && b == -1 {
        0
    } else {
        a.wrapping_rem(b)
    }
}

fn remu(a: u32, b: u32) -> u32 {
    if b == 0 {
        a
    } else {
        a % b
    }
}

fn jal(cpu: &mut Cpu, inst: u32, fields: DecodedFields) -> Result<(), StepError> {
    let target = cpu.pc().wrapping_add(j_imm(inst));
    let return_addr = cpu.next_pc();
    cpu.jump_to(target)?;
    cpu.set_x(fields.rd, return_addr);
    Ok(())
}

fn jalr(cpu: &mut Cpu, inst: u32, fields: DecodedFields) -> Result<(), StepError> {
    let base = cpu.x(fields.rs1);
    let target = base.wrapping_add(i_imm(inst)) & !1u32;
    let return_addr = cpu.next_pc();
    cpu.jump_to(target)?;
    cpu.set_x(fields.rd, return_addr);
    Ok(())
}

fn branch(cpu: &mut Cpu, inst: u32, fields: DecodedFields) -> Result<(), StepError> {
    let rs1 = cpu.x(fields.rs1);
    let rs2 = cpu.x(fields.rs2);
    let taken = match fields.funct3 {
        0b000 => rs1 == rs2,                    // BEQ
        0b001 => rs1 != rs2,                    // BNE
        0b100 => (rs1 as i32) < (rs2 as i32),   // BLT
        0b101 => (rs1 as i32) >= (rs2 as i32),  // BGE
        0b110 => rs1 < rs2,                     // BLTU
        0b111 => rs1 >= rs2,                    // BGEU
        _ => return Ok(cpu.trap(trap::ILLEGAL_INSTRUCTION, inst, true)?),
    };
    if taken {
        let target = cpu.pc().wrapping_add(b_imm(inst));
        cpu.jump_to(target)?;
    }
    Ok(())
}

fn load(cpu: &mut Cpu, mem: &mut Memory, inst: u32, fields: DecodedFields) -> Result<(), StepError> {
    let addr = cpu.x(fields.rs1).wrapping_add(i_imm(inst));
    let value = match fields.funct3 {
        0b000 => mem.load_byte(addr, true)?,  // LB
        0b001 => mem.load_half(addr, true)?,  // LH
        0b010 => mem.load_word(addr)?,        // LW
        0b100 => mem.load_byte(addr, false)?, // LBU
        0b101 => mem.load_half(addr, false)?, // LHU
        _ => return Ok(cpu.trap(trap::ILLEGAL_INSTRUCTION, inst, true)?),
    };
    cpu.set_x(fields.rd, value);
    Ok(())
}

fn store(cpu: &mut Cpu, mem: &mut Memory, inst: u32, fields: DecodedFields) -> Result<(), StepError> {
    let addr = cpu.x(fields.rs1).wrapping_add(s_imm(inst));
    let value = cpu.x(fields.rs2);
    match fields.funct3 {
        0b000 => mem.store_byte(addr, value)?, // SB
        0b001 => mem.store_half(addr, value)?, // SH
        0b010 => mem.store_word(addr, value)?, // SW
        _ => return Ok(cpu.trap(trap::ILLEGAL_INSTRUCTION, inst, true)?),
    }
    cpu.clear_reservation();
    Ok(())
}

fn amo(cpu: &mut Cpu, mem: &mut Memory, inst: u32, fields: DecodedFields) -> Result<(), StepError> {
    if fields.funct3 != 0b010 {
        return Ok(cpu.trap(trap::ILLEGAL_INSTRUCTION, inst, true)?);
    }
    let addr = cpu.x(fields.rs1);
    if addr % 4 != 0 {
        return Ok(cpu.trap(trap::STORE_AMO_ADDRESS_MISALIGNED, addr, true)?);
    }
    let funct5 = inst >> 27;
    let rs2 = cpu.x(fields.rs2);

    if funct5 == 0b00010 {
        // LR.W
        let value = mem.load_word(addr)?;
        cpu.set_reservation(addr);
        cpu.set_x(fields.rd, value);
        return Ok(());
    }
    if funct5 == 0b00011 {
        // SC.W
        let success = cpu.reservation() == Some(addr);
        if success {
            mem.store_word(addr, rs2)?;
        }
        cpu.clear_reservation();
        cpu.set_x(fields.rd, if success { 0 } else { 1 });
        return Ok(());
    }

    let old = mem.load_word(addr)?;
    let new = match funct5 {
        0b00001 => rs2,                                         // AMOSWAP.W
        0b00000 => old.wrapping_add(rs2),                        // AMOADD.W
        0b00100 => old ^ rs2,                                    // AMOXOR.W
        0b01100 => old & rs2,                                    // AMOAND.W
        0b01000 => old | rs2,                                    // AMOOR.W
        0b10000 => ((old as i32).min(rs2 as i32)) as u32,        // AMOMIN.W
        0b10100 => ((old as i32).max(rs2 as i32)) as u32,        // AMOMAX.W
        0b11000 => old.min(rs2),                                 // AMOMINU.W
        0b11100 => old.max(rs2),                                 // AMOMAXU.W
        _ => return Ok(cpu.trap(trap::ILLEGAL_INSTRUCTION, inst, true)?),
    };
    mem.store_word(addr, new)?;
    cpu.clear_reservation();
    cpu.set_x(fields.rd, old);
    Ok(())
}

/// a7 threshold above which EBREAK is treated as an in-band diagnostic
/// rather than a breakpoint.
const DEBUG_HOOK_THRESHOLD: u32 = 0xFFFF_0000;
const DEBUG_LOG_INT: u32 = 0xFFFF_0001;
const DEBUG_LOG_STRING: u32 = 0xFFFF_0002;
const DEBUG_PRINT_REGISTERS: u32 = 0xFFFF_0003;

fn a_reg(n: u8) -> Specifier {
    Specifier::from_u5(10 + n)
}

fn run_debug_hook(cpu: &Cpu, mem: &Memory, a7: u32) {
    let a0 = cpu.x(a_reg(0));
    match a7 {
        DEBUG_LOG_INT => info!("EBREAK LOG INT: {a0:#010x} ({a0})"),
        DEBUG_LOG_STRING => match mem.load_cstring(a0, 4096) {
            Ok(s) => info!("EBREAK LOG STR: {s}"),
            Err(e) => info!("EBREAK LOG STR: <unreadable: {e}>"),
        },
        DEBUG_PRINT_REGISTERS => {
            for specifier in Specifier::iter_all() {
                info!("{specifier} = {:#010x}", cpu.x(specifier));
            }
            info!("pc = {:#010x}", cpu.pc());
        }
        _ => {}
    }
}

fn system(cpu: &mut Cpu, mem: &mut Memory, inst: u32, fields: DecodedFields) -> Result<(), StepError> {
    match inst {
        0x0000_0073 => ecall(cpu, mem), // ECALL
        0x3020_0073 => Ok(cpu.mret()?), // MRET
        0x0010_0073 => ebreak(cpu, mem),
        0x1050_0073 => Ok(()), // WFI: no-op
        _ => csr_op(cpu, inst, fields),
    }
}

fn ecall(cpu: &mut Cpu, mem: &mut Memory) -> Result<(), StepError> {
    if cpu.read_csr(crate::csr::MTVEC) == 0 {
        if let Some(mut hook) = cpu.take_ecall_hook() {
            let outcome = hook(cpu.registers_mut(), mem);
            cpu.restore_ecall_hook(hook);
            cpu.bypassed_trap_return(trap::ECALL_FROM_M_MODE);
            return match outcome {
                crate::cpu::EcallOutcome::Continue => Ok(()),
                crate::cpu::EcallOutcome::Exit(code) => {
                    Err(crate::error::ExecutionError::Exited { code }.into())
                }
            };
        }
    }
    Ok(cpu.trap(trap::ECALL_FROM_M_MODE, 0, true)?)
}

fn ebreak(cpu: &mut Cpu, mem: &mut Memory) -> Result<(), StepError> {
    let a7 = cpu.x(a_reg(7));
    if a7 >= DEBUG_HOOK_THRESHOLD {
        run_debug_hook(cpu, mem, a7);
        return Ok(());
    }
    if cpu.read_csr(crate::csr::MTVEC) == 0 {
        Err(crate::error::ExecutionError::DebugBreak.into())
    } else {
        Ok(cpu.trap(trap::BREAKPOINT, 0, true)?)
    }
}

fn csr_op(cpu: &mut Cpu, inst: u32, fields: DecodedFields) -> Result<(), StepError> {
    if !matches!(fields.funct3, 0b001 | 0b010 | 0b011 | 0b101 | 0b110 | 0b111) {
        return Ok(cpu.trap(trap::ILLEGAL_INSTRUCTION, inst, true)?);
    }
    let addr = (inst >> 20) as CsrSpecifier;
    let is_immediate = fields.funct3 >= 0b101;
    let operand = if is_immediate {
        u32::from(fields.rs1)
    } else {
        cpu.x(fields.rs1)
    };
    let old = cpu.read_csr(addr);
    let new_value = match fields.funct3 {
        0b001 | 0b101 => Some(operand),                    // CSRRW / CSRRWI: always effective
        0b010 | 0b110 if operand != 0 => Some(old | operand), // CSRRS / CSRRSI
        0b011 | 0b111 if operand != 0 => Some(old & !operand), // CSRRC / CSRRCI
        _ => None, // CSRRS/CSRRC with a zero operand: read-only, no write attempted
    };
    Ok(cpu.csr_read_modify_write(addr, fields.rd, new_value, inst)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::decode_fields;
    use crate::resources::clint::TimerState;

    fn new_cpu_mem() -> (Cpu, Memory) {
        (Cpu::new(0, TimerState::new_handle()), Memory::new(0, 256))
    }

    fn run(cpu: &mut Cpu, mem: &mut Memory, inst: u32) -> Result<(), StepError> {
        cpu.execute_32(mem, inst)
    }

    #[test]
    fn addi_adds_sign_extended_immediate() {
        let (mut cpu, mut mem) = new_cpu_mem();
        // addi x5, x0, -1
        run(&mut cpu, &mut mem, 0xFFF0_0293).unwrap();
        assert_eq!(0xFFFF_FFFF, cpu.x(Specifier::from_u5(5)));
    }

    #[test]
    fn div_by_zero_matches_table() {
        let (mut cpu, mut mem) = new_cpu_mem();
        cpu.set_x(Specifier::from_u5(6), 5);
        cpu.set_x(Specifier::from_u5(7), 0);
        // div x5, x6, x7
        let inst = encode_r_for_test(0b0000001, 7, 6, 0b100, 5, OP);
        run(&mut cpu, &mut mem, inst).unwrap();
        assert_eq!(0xFFFF_FFFF, cpu.x(Specifier::from_u5(5)));
    }

    #[test]
    fn div_overflow_corner_case() {
        let (mut cpu, mut mem) = new_cpu_mem();
        cpu.set_x(Specifier::from_u5(6), 0x8000_0000);
        cpu.set_x(Specifier::from_u5(7), 0xFFFF_FFFF);
        let inst = encode_r_for_test(0b0000001, 7, 6, 0b100, 5, OP);
        run(&mut cpu, &mut mem, inst).unwrap();
        assert_eq!(0x8000_0000, cpu.x(Specifier::from_u5(5)));

        let rem_inst = encode_r_for_test(0b0000001, 7, 6, 0b110, 5, OP);
        run(&mut cpu, &mut mem, rem_inst).unwrap();
        assert_eq!(0, cpu.x(Specifier::from_u5(5)));
    }

    #[test]
    fn lr_sc_reservation_cleared_by_intervening_store() {
        let (mut cpu, mut mem) = new_cpu_mem();
        cpu.set_x(Specifier::SP, 0x10);
        // lr.w a0, (sp)
        let lr = encode_r_for_test(0b00010_00, 0, 2, 0b010, 10, AMO);
        run(&mut cpu, &mut mem, lr).unwrap();
        assert_eq!(Some(0x10), cpu.reservation());

        // sw x0, 0(sp) clears the reservation
        let sw = encode_s_for_test(0, 0, 2, 0b010, STORE);
        run(&mut cpu, &mut mem, sw).unwrap();
        assert_eq!(None, cpu.reservation());

        // sc.w a1, t0, (sp) must fail (rd = 1)
        cpu.set_x(Specifier::from_u5(5), 0x99); // t0
        let sc = encode_r_for_test(0b00011_00, 5, 2, 0b010, 11, AMO);
        run(&mut cpu, &mut mem, sc).unwrap();
        assert_eq!(1, cpu.x(Specifier::from_u5(11)));
    }

    #[test]
    fn jal_writes_return_address_and_target() {
        let (mut cpu, mut mem) = new_cpu_mem();
        // jal x1, 8
        let inst = encode_j_for_test(8, 1, JAL);
        run(&mut cpu, &mut mem, inst).unwrap();
        assert_eq!(4, cpu.x(Specifier::RA));
        assert_eq!(8, cpu.next_pc());
    }

    #[test]
    fn misaligned_jalr_traps_without_writing_rd() {
        let (mut cpu, mut mem) = new_cpu_mem();
        cpu.set_x(Specifier::from_u5(5), 1); // t0 = 1, odd base
        let inst = encode_i_for_test(0, 5, 0b000, 1, JALR);
        let err = run(&mut cpu, &mut mem, inst).unwrap_err();
        assert!(matches!(err, StepError::Execution(_)));
        assert_eq!(0, cpu.x(Specifier::RA));
    }

    #[test]
    fn csrrw_to_read_only_csr_traps() {
        let (mut cpu, mut mem) = new_cpu_mem();
        let inst = encode_i_for_test(crate::csr::MHARTID as i32, 0, 0b001, 5, SYSTEM);
        let err = run(&mut cpu, &mut mem, inst).unwrap_err();
        assert!(matches!(err, StepError::Execution(_)));
    }

    #[test]
    fn out_of_bounds_load_propagates_memory_error() {
        let (mut cpu, mut mem) = new_cpu_mem();
        cpu.set_x(Specifier::from_u5(5), 10_000);
        let inst = encode_i_for_test(0, 5, 0b010, 6, LOAD);
        let err = run(&mut cpu, &mut mem, inst).unwrap_err();
        assert!(matches!(err, StepError::Memory(_)));
    }

    fn encode_r_for_test(funct7: u32, rs2: u32, rs1: u32, funct3: u32, rd: u32, opcode: u32) -> u32 {
        (funct7 << 25) | (rs2 << 20) | (rs1 << 15) | (funct3 << 12) | (rd << 7) | opcode
    }

    fn encode_i_for_test(imm12: i32, rs1: u32, funct3: u32, rd: u32, opcode: u32) -> u32 {
        (((imm12 as u32) & 0xFFF) << 20) | (rs1 << 15) | (funct3 << 12) | (rd << 7) | opcode
    }

    fn encode_s_for_test(imm12: i32, rs2: u32, rs1: u32, funct3: u32, opcode: u32) -> u32 {
        let imm = imm12 as u32 & 0xFFF;
        ((imm >> 5) << 25) | (rs2 << 20) | (rs1 << 15) | (funct3 << 12) | ((imm & 0x1F) << 7) | opcode
    }

    fn encode_j_for_test(offset: i32, rd: u32, opcode: u32) -> u32 {
        let imm = offset as u32;
        let b20 = (imm >> 20) & 0b1;
        let b19_12 = (imm >> 12) & 0xFF;
        let b11 = (imm >> 11) & 0b1;
        let b10_1 = (imm >> 1) & 0x3FF;
        (b20 << 31) | (b10_1 << 21) | (b11 << 20) | (b19_12 << 12) | (rd << 7) | opcode
    }

    #[test]
    fn decode_fields_matches_manual_extraction() {
        let inst = 0x006282B3u32; // add x5, x5, x6
        let fields = decode_fields(inst);
        assert_eq!(OP, fields.opcode);
        assert_eq!(Specifier::from_u5(5), fields.rd);
        assert_eq!(Specifier::from_u5(5), fields.rs1);
        assert_eq!(Specifier::from_u5(6), fields.rs2);
    }
}
