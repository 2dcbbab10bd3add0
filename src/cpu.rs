//! The hart: architectural registers, CSR file, LR/SC reservation, decode
//! caches, and the trap/interrupt/timer machinery that ties them together.
//!
//! `Cpu` owns everything architecturally visible to a guest program except
//! `Memory` itself, which `Machine` passes in by reference on every fetch
//! and on every `LOAD`/`STORE`/`AMO` handler (see `execute.rs`).

use crate::csr::{self, CsrFile, CsrSpecifier};
use crate::error::{ExecutionError, StepError};
use crate::instruction::{Decode16Cache, Decode32Cache};
use crate::memory::Memory;
use crate::registers::{Registers, Specifier};
use crate::resources::clint::TimerHandle;
use crate::trap;
use bitvec::prelude::*;
use log::{debug, trace, warn};

/// Alignment mask applied to branch/jump targets and to `mepc` on `MRET`:
/// `0x1` when RVC is enabled (2-byte alignment), `0x3` otherwise (4-byte).
fn align_mask_for(rvc_enabled: bool) -> u32 {
    if rvc_enabled {
        0x1
    } else {
        0x3
    }
}

fn bit(value: u32, index: u32) -> bool {
    value.view_bits::<Lsb0>()[index as usize]
}

fn set_bit(value: u32, index: u32, on: bool) -> u32 {
    let mut value = value;
    value.view_bits_mut::<Lsb0>().set(index as usize, on);
    value
}

/// Outcome of an installed ECALL hook: whether the step loop should keep
/// running, or the guest requested termination (Newlib `_exit`).
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum EcallOutcome {
    Continue,
    Exit(i32),
}

/// An external ECALL handler, invoked when `mtvec == 0`. Given mutable
/// access to the registers (for `a0`-`a7` and a return value) and to memory
/// (for syscalls that touch guest buffers, e.g. `_write`/`_read`).
pub type EcallHook = dyn FnMut(&mut Registers, &mut Memory) -> EcallOutcome;

/// A single RISC-V hart: RV32I + M + A + C, machine mode only.
pub struct Cpu {
    registers: Registers,
    next_pc: u32,
    csr: CsrFile,
    timer: TimerHandle,
    /// LR/SC reservation. `None` means invalid.
    reservation: Option<u32>,
    decode32: Decode32Cache,
    decode16: Decode16Cache,
    /// Cached from `misa.C`; refreshed whenever `misa` is changed through
    /// [`Self::set_misa_c`].
    align_mask: u32,
    ecall_hook: Option<Box<EcallHook>>,
}

impl std::fmt::Debug for Cpu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cpu")
            .field("registers", &self.registers)
            .field("next_pc", &self.next_pc)
            .field("reservation", &self.reservation)
            .field("align_mask", &self.align_mask)
            .finish_non_exhaustive()
    }
}

impl Cpu {
    /// Creates a fresh hart with `pc` set to `initial_pc`, sharing `timer`
    /// with whatever peripheral exposes the machine timer's MMIO registers.
    pub fn new(initial_pc: u32, timer: TimerHandle) -> Self {
        let csr = CsrFile::new();
        let rvc_enabled = bit(csr.read_raw(csr::MISA), 2);
        Self {
            registers: Registers::new(initial_pc),
            next_pc: initial_pc,
            csr,
            timer,
            reservation: None,
            decode32: Decode32Cache::new(),
            decode16: Decode16Cache::new(),
            align_mask: align_mask_for(rvc_enabled),
            ecall_hook: None,
        }
    }

    pub fn registers(&self) -> &Registers {
        &self.registers
    }

    pub fn registers_mut(&mut self) -> &mut Registers {
        &mut self.registers
    }

    pub fn x(&self, specifier: Specifier) -> u32 {
        self.registers.x(specifier)
    }

    pub fn set_x(&mut self, specifier: Specifier, value: u32) {
        self.registers.set_x(specifier, value);
    }

    pub fn pc(&self) -> u32 {
        self.registers.pc()
    }

    pub fn next_pc(&self) -> u32 {
        self.next_pc
    }

    /// Commits `pc = next_pc`. Called by the step loop after a retired
    /// instruction's side effects (including the timer tick) have settled.
    pub fn commit_pc(&mut self) {
        *self.registers.pc_mut() = self.next_pc;
    }

    /// Sets `next_pc` unconditionally, bypassing the alignment check. Used
    /// by the handlers that never jump (e.g. arithmetic, loads/stores).
    pub fn set_next_pc(&mut self, value: u32) {
        self.next_pc = value;
    }

    /// Sets `next_pc` to `target`, raising a synchronous instruction address
    /// misaligned trap instead if `target` violates the cached alignment
    /// mask. Used by JAL/JALR/branches/MRET.
    pub fn jump_to(&mut self, target: u32) -> Result<(), ExecutionError> {
        if target & self.align_mask != 0 {
            self.trap(trap::INSTRUCTION_ADDRESS_MISALIGNED, target, true)
        } else {
            self.next_pc = target;
            Ok(())
        }
    }

    pub fn align_mask(&self) -> u32 {
        self.align_mask
    }

    pub fn reservation(&self) -> Option<u32> {
        self.reservation
    }

    pub fn set_reservation(&mut self, addr: u32) {
        self.reservation = Some(addr);
    }

    /// Clears the LR/SC reservation. Called after every non-atomic store and
    /// every completed SC.W (success or fail), and on any trap.
    pub fn clear_reservation(&mut self) {
        self.reservation = None;
    }

    /// Installs the ECALL hook invoked when `mtvec == 0`. This is the seam
    /// through which a Newlib syscall layer, provided entirely outside this
    /// crate, plugs in.
    pub fn install_ecall_hook(&mut self, hook: Box<EcallHook>) {
        self.ecall_hook = Some(hook);
    }

    pub(crate) fn take_ecall_hook(&mut self) -> Option<Box<EcallHook>> {
        self.ecall_hook.take()
    }

    pub(crate) fn restore_ecall_hook(&mut self, hook: Box<EcallHook>) {
        self.ecall_hook = Some(hook);
    }

    pub fn has_ecall_hook(&self) -> bool {
        self.ecall_hook.is_some()
    }

    /// Reads a CSR with architectural overrides applied: the four timer
    /// shadow CSRs are derived from the authoritative 64-bit counters rather
    /// than from the stored CSR value.
    pub fn read_csr(&self, addr: CsrSpecifier) -> u32 {
        match addr {
            csr::MTIME_LO => self.timer.borrow().mtime_lo(),
            csr::MTIME_HI => self.timer.borrow().mtime_hi(),
            csr::MTIMECMP_LO => self.timer.borrow().mtimecmp_lo(),
            csr::MTIMECMP_HI => self.timer.borrow().mtimecmp_hi(),
            _ => self.csr.read_raw(addr),
        }
    }

    /// Performs the read-modify-write of a CSR instruction: reads the old
    /// value into `rd`, then — if `new_value` is present and
    /// the write is "effective" — applies it, subject to the read-only and
    /// write-ignored classifications. Read-only writes raise an illegal
    /// instruction trap instead of writing.
    pub fn csr_read_modify_write(
        &mut self,
        addr: CsrSpecifier,
        rd: Specifier,
        new_value: Option<u32>,
        inst: u32,
    ) -> Result<(), ExecutionError> {
        let old = self.read_csr(addr);
        if let Some(value) = new_value {
            if CsrFile::is_read_only(addr) {
                return self.trap(trap::ILLEGAL_INSTRUCTION, inst, true);
            }
            if !CsrFile::is_write_ignored(addr) {
                self.write_csr_raw(addr, value);
            }
        }
        self.registers.set_x(rd, old);
        Ok(())
    }

    /// Raw CSR write with the architectural side effects attached to
    /// specific addresses (`mtvec` masking, `mstatus.MPP` forcing,
    /// the timer half-write commit discipline). Bypasses the read-only /
    /// write-ignored classification — callers that need it apply that
    /// themselves (see [`Self::csr_read_modify_write`]).
    fn write_csr_raw(&mut self, addr: CsrSpecifier, value: u32) {
        match addr {
            csr::MTVEC => self.csr.write_raw(addr, value & !0x3),
            csr::MSTATUS => {
                self.csr.write_raw(addr, value | csr::MSTATUS_MPP_MASK);
            }
            csr::MTIME_LO => {
                self.timer.borrow_mut().write_mtime_lo(value);
                self.sync_mtip();
            }
            csr::MTIME_HI => {
                self.timer.borrow_mut().write_mtime_hi(value);
                self.sync_mtip();
            }
            csr::MTIMECMP_LO => {
                self.timer.borrow_mut().write_mtimecmp_lo(value);
                self.sync_mtip();
            }
            csr::MTIMECMP_HI => {
                self.timer.borrow_mut().write_mtimecmp_hi(value);
                self.sync_mtip();
            }
            _ => self.csr.write_raw(addr, value),
        }
    }

    /// Recomputes `mip.MTIP` from the authoritative timer comparison and
    /// writes it back into the CSR file. Called after any write that could
    /// change the comparison (CSR or MMIO) and after every timer tick.
    pub fn sync_mtip(&mut self) {
        let asserted = self.timer.borrow().mtip();
        let mip = self.csr.read_raw(csr::MIP);
        self.csr.write_raw(csr::MIP, set_bit(mip, csr::MTIP_BIT, asserted));
    }

    /// Sets or clears `mip.MEIP`. The only path by which an external
    /// peripheral requests an interrupt.
    pub fn assert_external_interrupt(&mut self) {
        let mip = self.csr.read_raw(csr::MIP);
        self.csr.write_raw(csr::MIP, set_bit(mip, csr::MEIP_BIT, true));
    }

    pub fn clear_external_interrupt(&mut self) {
        let mip = self.csr.read_raw(csr::MIP);
        self.csr.write_raw(csr::MIP, set_bit(mip, csr::MEIP_BIT, false));
    }

    /// Enables or disables the C extension directly, bypassing the normal
    /// CSR write path (`misa` is write-ignored there). This is a host-only
    /// control for test harnesses and embedders that need to toggle RVC
    /// support at runtime; guest code cannot reach it through a CSR
    /// instruction.
    pub fn set_misa_c(&mut self, enabled: bool) {
        let misa = self.csr.read_raw(csr::MISA);
        self.csr.write_raw(csr::MISA, set_bit(misa, 2, enabled));
        self.align_mask = align_mask_for(enabled);
    }

    pub fn rvc_enabled(&self) -> bool {
        bit(self.csr.read_raw(csr::MISA), 2)
    }

    /// Raises a trap: if no handler is installed (`mtvec == 0`), aborts
    /// execution with a fatal error; otherwise redirects `next_pc` to
    /// `mtvec` after recording the trap CSRs and updating `mstatus`.
    pub fn trap(&mut self, cause: u32, mtval: u32, sync: bool) -> Result<(), ExecutionError> {
        let mepc = if sync { self.registers.pc() } else { self.next_pc };
        let mtvec = self.csr.read_raw(csr::MTVEC);
        if mtvec == 0 {
            warn!("unhandled trap cause={cause:#010x} mepc={mepc:#010x} mtval={mtval:#010x}");
            return Err(ExecutionError::Trapped { cause, mepc, mtval });
        }
        trace!("trap cause={cause:#010x} mepc={mepc:#010x} mtval={mtval:#010x} sync={sync}");
        self.csr.write_raw(csr::MEPC, mepc);
        self.csr.write_raw(csr::MCAUSE, cause);
        self.csr.write_raw(csr::MTVAL, mtval);
        let mstatus = self.csr.read_raw(csr::MSTATUS);
        let mie = bit(mstatus, csr::MSTATUS_MIE);
        let mut new_status = set_bit(mstatus, csr::MSTATUS_MPIE, mie);
        new_status = set_bit(new_status, csr::MSTATUS_MIE, false);
        new_status |= csr::MSTATUS_MPP_MASK;
        self.csr.write_raw(csr::MSTATUS, new_status);
        self.clear_reservation();
        self.next_pc = mtvec & !0x3;
        Ok(())
    }

    /// The side effects of a combined trap+mret, used when the emulator
    /// itself handles a trap in-band — currently only ECALL with an
    /// installed hook and `mtvec == 0`. Unlike [`Self::trap`], `mie` is left
    /// unchanged and execution simply continues at `next_pc`.
    pub fn bypassed_trap_return(&mut self, cause: u32) {
        let pc = self.registers.pc();
        self.csr.write_raw(csr::MEPC, pc);
        self.csr.write_raw(csr::MCAUSE, cause);
        self.csr.write_raw(csr::MTVAL, 0);
        let mstatus = self.csr.read_raw(csr::MSTATUS);
        let new_status = set_bit(mstatus, csr::MSTATUS_MPIE, true) | csr::MSTATUS_MPP_MASK;
        self.csr.write_raw(csr::MSTATUS, new_status);
    }

    /// `MRET`: restores `mstatus.MIE` from `MPIE`, re-arms `MPIE`, and jumps
    /// to `mepc` (after an alignment check).
    pub fn mret(&mut self) -> Result<(), ExecutionError> {
        let mepc = self.csr.read_raw(csr::MEPC);
        let mstatus = self.csr.read_raw(csr::MSTATUS);
        let mpie = bit(mstatus, csr::MSTATUS_MPIE);
        let mut new_status = set_bit(mstatus, csr::MSTATUS_MIE, mpie);
        new_status = set_bit(new_status, csr::MSTATUS_MPIE, true);
        new_status |= csr::MSTATUS_MPP_MASK;
        self.csr.write_raw(csr::MSTATUS, new_status);
        self.jump_to(mepc)
    }

    /// Advances the machine timer by one tick and delivers an interrupt if
    /// one is pending and enabled. Called by the step loop after each
    /// retired instruction, when the timer is enabled.
    pub fn timer_tick(&mut self) -> Result<(), ExecutionError> {
        self.timer.borrow_mut().tick();
        self.sync_mtip();
        let mstatus = self.csr.read_raw(csr::MSTATUS);
        if !bit(mstatus, csr::MSTATUS_MIE) {
            return Ok(());
        }
        let mip = self.csr.read_raw(csr::MIP);
        let mie_reg = self.csr.read_raw(csr::MIE);
        if bit(mip, csr::MTIP_BIT) && bit(mie_reg, csr::MTIP_BIT) {
            debug!("delivering machine timer interrupt");
            return self.trap(trap::MACHINE_TIMER_INTERRUPT, 0, false);
        }
        if bit(mip, csr::MEIP_BIT) && bit(mie_reg, csr::MEIP_BIT) {
            debug!("delivering machine external interrupt");
            return self.trap(trap::MACHINE_EXTERNAL_INTERRUPT, 0, false);
        }
        Ok(())
    }

    /// Executes one 32-bit instruction. Sets `next_pc = pc + 4`, dispatches
    /// to the opcode handler, then re-asserts the zero-register invariant.
    /// Does not commit `pc`; the caller (`Machine`) does that.
    pub fn execute_32(&mut self, mem: &mut Memory, inst: u32) -> Result<(), StepError> {
        self.next_pc = self.registers.pc().wrapping_add(4);
        let fields = self.decode32.get_or_decode(inst);
        let result = crate::execute::dispatch(self, mem, inst, fields);
        self.registers.reassert_zero();
        result
    }

    /// Executes one 16-bit compressed instruction: expands it via the
    /// content-addressed cache, then dispatches to the same opcode handlers
    /// `execute_32` uses, with `next_pc = pc + 2`.
    pub fn execute_16(&mut self, mem: &mut Memory, c_inst: u16) -> Result<(), StepError> {
        self.next_pc = self.registers.pc().wrapping_add(2);
        let (expansion, valid) = self.decode16.get_or_expand(c_inst);
        let result = if valid {
            let fields = self.decode32.get_or_decode(expansion);
            crate::execute::dispatch(self, mem, expansion, fields)
        } else {
            self.trap(trap::ILLEGAL_INSTRUCTION, c_inst as u32, true).map_err(StepError::from)
        };
        self.registers.reassert_zero();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::clint::TimerState;

    fn new_cpu() -> Cpu {
        Cpu::new(0, TimerState::new_handle())
    }

    #[test]
    fn reset_alignment_mask_is_two_byte_since_c_is_enabled() {
        let cpu = new_cpu();
        assert_eq!(0x1, cpu.align_mask());
        assert!(cpu.rvc_enabled());
    }

    #[test]
    fn set_misa_c_refreshes_alignment_mask() {
        let mut cpu = new_cpu();
        cpu.set_misa_c(false);
        assert_eq!(0x3, cpu.align_mask());
        assert!(!cpu.rvc_enabled());
        cpu.set_misa_c(true);
        assert_eq!(0x1, cpu.align_mask());
    }

    #[test]
    fn trap_with_no_handler_is_fatal() {
        let mut cpu = new_cpu();
        let err = cpu.trap(trap::ILLEGAL_INSTRUCTION, 0xDEAD, true).unwrap_err();
        assert!(matches!(
            err,
            ExecutionError::Trapped { cause, mtval: 0xDEAD, .. } if cause == trap::ILLEGAL_INSTRUCTION
        ));
    }

    #[test]
    fn trap_and_mret_round_trip() {
        let mut cpu = new_cpu();
        cpu.csr.write_raw(csr::MTVEC, 0x1000);
        let mut status = cpu.csr.read_raw(csr::MSTATUS);
        status = set_bit(status, csr::MSTATUS_MIE, true);
        cpu.csr.write_raw(csr::MSTATUS, status);

        cpu.trap(trap::BREAKPOINT, 0, true).unwrap();
        assert_eq!(0x1000, cpu.next_pc());
        assert_eq!(0, cpu.csr.read_raw(csr::MSTATUS) & (1 << csr::MSTATUS_MIE));
        assert_ne!(0, cpu.csr.read_raw(csr::MSTATUS) & (1 << csr::MSTATUS_MPIE));

        cpu.mret().unwrap();
        assert_ne!(0, cpu.csr.read_raw(csr::MSTATUS) & (1 << csr::MSTATUS_MIE));
    }

    #[test]
    fn timer_write_both_halves_commits_and_syncs_mtip() {
        let mut cpu = new_cpu();
        cpu.write_csr_raw(csr::MTIMECMP_LO, 2);
        cpu.write_csr_raw(csr::MTIMECMP_HI, 0);
        assert_eq!(2, cpu.read_csr(csr::MTIMECMP_LO));
        assert_eq!(0, cpu.csr.read_raw(csr::MIP) & (1 << csr::MTIP_BIT));
        cpu.timer_tick().unwrap();
        cpu.timer_tick().unwrap();
        assert_ne!(0, cpu.csr.read_raw(csr::MIP) & (1 << csr::MTIP_BIT));
    }

    #[test]
    fn csr_write_to_read_only_traps() {
        let mut cpu = new_cpu();
        let err = cpu
            .csr_read_modify_write(csr::MHARTID, Specifier::from_u5(5), Some(1), 0)
            .unwrap_err();
        assert!(matches!(err, ExecutionError::Trapped { .. }));
    }

    #[test]
    fn csr_write_ignored_keeps_old_value_readable() {
        let mut cpu = new_cpu();
        let before = cpu.read_csr(csr::MISA);
        cpu.csr_read_modify_write(csr::MISA, Specifier::from_u5(5), Some(0), 0)
            .unwrap();
        assert_eq!(before, cpu.x(Specifier::from_u5(5)));
        assert_eq!(before, cpu.read_csr(csr::MISA));
    }

    #[test]
    fn jump_to_misaligned_target_traps() {
        let mut cpu = new_cpu();
        let err = cpu.jump_to(0x1001).unwrap_err();
        assert!(matches!(
            err,
            ExecutionError::Trapped { cause, .. } if cause == trap::INSTRUCTION_ADDRESS_MISALIGNED
        ));
    }
}
