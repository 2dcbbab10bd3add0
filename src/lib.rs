//! RV32IMAC instruction-set simulator core.
//!
//! This crate implements a single-hart, machine-mode-only RISC-V simulator:
//! the RV32I base integer ISA plus the M (integer multiply/divide), A
//! (atomics), and C (compressed) extensions, together with the CSR file,
//! trap/interrupt machinery, the machine timer, and a small bus for
//! memory-mapped I/O.
//!
//! It is not a full-system emulator: there is no MMU, no supervisor or user
//! privilege level, no PLIC, and no virtio. ELF/flat-binary loading, Newlib
//! syscall handling, concrete UART/block-device host peripherals, a GDB
//! remote-serial-protocol stub, and CLI/logging setup are all expected to be
//! provided by the embedder; this crate exposes the hooks they plug into
//! (see [`cpu::EcallHook`] and [`bus::Peripheral`]).

#[macro_use]
extern crate static_assertions;

pub mod bus;
pub mod compressed;
pub mod cpu;
pub mod csr;
pub mod error;
pub mod execute;
pub mod instruction;
pub mod machine;
pub mod memory;
pub mod registers;
pub mod resources;
pub mod trap;

pub use cpu::Cpu;
pub use error::{
    ExecutionError, InvariantViolationError, MachineError, MemoryAccessError, SetupError, StepError,
};
pub use machine::Machine;
pub use memory::Memory;

/// Collection of the units in which memory can be addressed (in bytes).
pub mod unit {
    /// A _byte_ is 8 bits.
    pub const BYTE: u32 = 1;
    /// A _halfword_ is 16 bits (2 bytes).
    pub const HALFWORD: u32 = 2;
    /// A _word_ is 32 bits (4 bytes).
    pub const WORD: u32 = 4;
}
