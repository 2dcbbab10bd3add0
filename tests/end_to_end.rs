//! Crate-level end-to-end scenarios driven entirely through `Machine`,
//! exercising the step loop, timer delivery, and RVC toggling together
//! rather than any single handler in isolation.

use rv32imac_core::machine::{Config, Machine};
use rv32imac_core::registers::Specifier;
use rv32imac_core::{InvariantViolationError, MachineError, StepError};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn config(ram_size: u32) -> Config {
    Config {
        ram_size,
        ..Config::default()
    }
}

#[test]
fn amo_reservation_is_cleared_by_an_intervening_store() {
    init_logging();
    let mut machine = Machine::new(&config(64), 0x8000_0000).unwrap();
    machine.cpu_mut().set_x(Specifier::SP, 0x8000_0020);
    machine.cpu_mut().set_x(Specifier::from_u5(5), 0x99); // t0

    // lr.w a0, (sp)
    machine
        .memory_mut()
        .store_word(0x8000_0000, 0x1001_252F)
        .unwrap();
    // sw x0, 0(sp)
    machine
        .memory_mut()
        .store_word(0x8000_0004, 0x0001_2023)
        .unwrap();
    // sc.w a1, t0, (sp)
    machine
        .memory_mut()
        .store_word(0x8000_0008, 0x1851_25AF)
        .unwrap();

    machine.step().unwrap();
    assert_eq!(Some(0x8000_0020), machine.cpu().reservation());
    machine.step().unwrap();
    assert_eq!(None, machine.cpu().reservation());
    machine.step().unwrap();
    assert_eq!(1, machine.cpu().x(Specifier::from_u5(11))); // a1: failure
}

#[test]
fn timer_interrupt_fires_after_three_ticks_and_saves_mie() {
    init_logging();
    let mut machine = Machine::new(&config(64), 0x8000_0000).unwrap();

    // mtvec, nonzero and 4-byte aligned.
    let mtvec = 0x8000_0040;
    write_csr(&mut machine, rv32imac_core::csr::MTVEC, mtvec);
    let mstatus = machine.cpu().read_csr(rv32imac_core::csr::MSTATUS);
    write_csr(
        &mut machine,
        rv32imac_core::csr::MSTATUS,
        mstatus | (1 << rv32imac_core::csr::MSTATUS_MIE),
    );
    write_csr(
        &mut machine,
        rv32imac_core::csr::MIE,
        1 << rv32imac_core::csr::MTIE_BIT,
    );
    write_csr(&mut machine, rv32imac_core::csr::MTIMECMP_LO, 3);
    write_csr(&mut machine, rv32imac_core::csr::MTIMECMP_HI, 0);

    // Three NOPs (addi x0, x0, 0), one per tick.
    for offset in [0x00, 0x04, 0x08] {
        machine
            .memory_mut()
            .store_word(0x8000_0000 + offset, 0x0000_0013)
            .unwrap();
    }

    machine.step().unwrap();
    machine.step().unwrap();
    // The third tick makes mtime == mtimecmp, so this step's timer_tick
    // delivers the trap after the instruction at 0x08 retires.
    machine.step().unwrap();

    let mcause = machine.cpu().read_csr(rv32imac_core::csr::MCAUSE);
    assert_eq!(0x8000_0007, mcause);
    let mepc = machine.cpu().read_csr(rv32imac_core::csr::MEPC);
    assert_eq!(0x8000_000C, mepc);
    assert_eq!(mtvec, machine.cpu().pc());

    let mstatus = machine.cpu().read_csr(rv32imac_core::csr::MSTATUS);
    assert_eq!(0, mstatus & (1 << rv32imac_core::csr::MSTATUS_MIE));
    assert_ne!(0, mstatus & (1 << rv32imac_core::csr::MSTATUS_MPIE));
}

#[test]
fn rvc_disabled_alignment_trap_then_recovery() {
    init_logging();
    let mut machine = Machine::new(
        &Config {
            rvc_enabled: false,
            ..config(64)
        },
        0x8000_0000,
    )
    .unwrap();

    let t0 = 0x8000_0010;
    machine.cpu_mut().set_x(Specifier::from_u5(5), t0); // t0

    // jalr x1, 2(t0)
    let jalr = 0x0022_80E7u32;
    machine
        .memory_mut()
        .store_word(0x8000_0000, jalr)
        .unwrap();

    let err = machine.step().unwrap_err();
    let mtval = match &err {
        MachineError::Step(StepError::Execution(
            rv32imac_core::ExecutionError::Trapped { cause: 0, mtval, .. },
        )) => *mtval,
        other => panic!("expected an instruction-address-misaligned trap, got {other:?}"),
    };
    assert_eq!(t0 + 2, mtval);
    // The fetch that raised the trap never committed pc, so the next attempt
    // replays the same JALR after re-enabling the C extension.
    machine.cpu_mut().set_misa_c(true);
    machine.step().unwrap();
    assert_eq!(t0 + 2, machine.cpu().pc());
}

#[test]
fn signed_division_corner_cases() {
    init_logging();
    let mut machine = Machine::new(&config(64), 0x8000_0000).unwrap();
    machine.cpu_mut().set_x(Specifier::from_u5(6), 0x8000_0000);
    machine.cpu_mut().set_x(Specifier::from_u5(7), 0xFFFF_FFFF);

    // div x5, x6, x7
    machine
        .memory_mut()
        .store_word(0x8000_0000, 0x0273_42B3)
        .unwrap();
    machine.step().unwrap();
    assert_eq!(0x8000_0000, machine.cpu().x(Specifier::from_u5(5)));

    // rem x5, x6, x7
    machine
        .memory_mut()
        .store_word(0x8000_0004, 0x0273_62B3)
        .unwrap();
    machine.step().unwrap();
    assert_eq!(0, machine.cpu().x(Specifier::from_u5(5)));

    machine.cpu_mut().set_x(Specifier::from_u5(7), 0);
    // div x5, x6, x7
    machine
        .memory_mut()
        .store_word(0x8000_0008, 0x0273_42B3)
        .unwrap();
    machine.step().unwrap();
    assert_eq!(0xFFFF_FFFF, machine.cpu().x(Specifier::from_u5(5)));

    // rem x5, x6, x7
    machine
        .memory_mut()
        .store_word(0x8000_000C, 0x0273_62B3)
        .unwrap();
    machine.step().unwrap();
    assert_eq!(0x8000_0000, machine.cpu().x(Specifier::from_u5(5)));
}

#[test]
fn sign_extension_round_trip_through_memory() {
    init_logging();
    let mut machine = Machine::new(&config(64), 0x8000_0000).unwrap();
    machine.memory_mut().store_byte(0x8000_0020, 0xFF).unwrap();
    assert_eq!(
        0xFFFF_FFFF,
        machine.memory_mut().load_byte(0x8000_0020, true).unwrap()
    );
    assert_eq!(
        0xFF,
        machine.memory_mut().load_byte(0x8000_0020, false).unwrap()
    );
}

#[test]
fn debug_invariants_pass_on_reset_and_catch_pc_escape() {
    init_logging();
    let mut machine = Machine::new(
        &Config {
            debug_invariants: true,
            ..config(64)
        },
        0x8000_0000,
    )
    .unwrap();
    assert!(machine.check_invariants().is_ok());

    machine.cpu_mut().set_next_pc(0xFFFF_FFF0);
    machine.cpu_mut().commit_pc();
    let err = machine.check_invariants().unwrap_err();
    assert!(matches!(err, InvariantViolationError::PcOutOfBounds { .. }));
}

fn write_csr(machine: &mut Machine, addr: rv32imac_core::csr::CsrSpecifier, value: u32) {
    machine
        .cpu_mut()
        .csr_read_modify_write(addr, Specifier::X0, Some(value), 0)
        .unwrap();
}
