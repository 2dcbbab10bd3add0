//! Error taxonomy for the core.
//!
//! Four classes: architectural traps (not an error type at all — they are
//! observed by the guest through CSR/`pc` state), fatal execution
//! termination, memory access errors, and setup errors, plus invariant
//! violations that only fire in debug mode. See [`crate::machine::Machine`]
//! for how the step loop propagates each class.

use thiserror::Error;

/// Fatal termination of the step loop, surfaced to the host.
///
/// This is distinct from an architectural trap: an architectural trap with
/// `mtvec != 0` is handled entirely inside the guest and never produces an
/// `ExecutionError`. This type only exists for the cases where execution
/// cannot continue.
#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum ExecutionError {
    /// A trap was raised while no trap handler (`mtvec == 0`) was installed.
    #[error("unhandled trap: cause={cause:#010x} mepc={mepc:#010x} mtval={mtval:#010x}")]
    Trapped { cause: u32, mepc: u32, mtval: u32 },
    /// The guest requested termination (Newlib `_exit`, handled externally,
    /// but the core still needs a way to signal "stop stepping" up through
    /// the `ecall` hook's return value).
    #[error("guest exited with code {code}")]
    Exited { code: i32 },
    /// `EBREAK` was executed with no trap handler installed and no in-band
    /// debug hook claimed the `a7` value.
    #[error("EBREAK with no trap handler installed")]
    DebugBreak,
}

/// Out-of-bounds or otherwise invalid memory access.
#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum MemoryAccessError {
    #[error("out-of-bounds access at {address:#010x} (size {size})")]
    OutOfBounds { address: u32, size: u32 },
    #[error("misaligned access at {address:#010x} (size {size})")]
    Misaligned { address: u32, size: u32 },
    #[error("C-string at {address:#010x} exceeds max_len {max_len} without a NUL terminator")]
    CStringTooLong { address: u32, max_len: u32 },
    #[error("illegal non-word MMIO access at {address:#010x} (size {size})")]
    IllegalMmioAccess { address: u32, size: u32 },
}

/// A configuration or setup error, reported before execution begins.
#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum SetupError {
    #[error("RAM size {0} is not large enough to hold the required trailing padding")]
    InvalidRamSize(u32),
    #[error("base address {0:#010x} plus size {1} overflows the 32-bit address space")]
    InvalidBaseAddress(u32, u32),
    #[error("peripheral range [{new_base:#010x}, {new_end:#010x}) overlaps existing range [{existing_base:#010x}, {existing_end:#010x})")]
    OverlappingPeripheral {
        new_base: u32,
        new_end: u32,
        existing_base: u32,
        existing_end: u32,
    },
}

/// The union of error classes a single instruction step can produce: a
/// fatal execution termination, or a memory access error. Memory access
/// errors are surfaced directly to the host rather than mapped to a guest
/// trap; a faulting load/store aborts the step instead of redirecting to
/// `mtvec`.
#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum StepError {
    #[error(transparent)]
    Execution(#[from] ExecutionError),
    #[error(transparent)]
    Memory(#[from] MemoryAccessError),
}

/// The union of everything [`crate::machine::Machine::step`] can fail with:
/// a step error, or (in debug mode) an invariant violation.
#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum MachineError {
    #[error(transparent)]
    Step(#[from] StepError),
    #[error(transparent)]
    Invariant(#[from] InvariantViolationError),
}

/// A debug-mode-only invariant violation. Terminates execution.
#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum InvariantViolationError {
    #[error("x0 was observed to be non-zero")]
    ZeroRegisterNonZero,
    #[error("pc {pc:#010x} is out of RAM bounds (size {size})")]
    PcOutOfBounds { pc: u32, size: u32 },
    #[error("sp {sp:#010x} is above stack_top {stack_top:#010x}")]
    StackOverflow { sp: u32, stack_top: u32 },
    #[error("sp {sp:#010x} is below stack_bottom {stack_bottom:#010x}")]
    StackUnderflow { sp: u32, stack_bottom: u32 },
    #[error("heap_end {heap_end:#010x} is within 256 bytes of stack_bottom {stack_bottom:#010x}")]
    HeapStackCollision { heap_end: u32, stack_bottom: u32 },
    #[error("heap_end {0:#010x} is not 4-byte aligned")]
    HeapMisaligned(u32),
    #[error(".text region was tampered with (first mismatch at offset {offset})")]
    TextTampered { offset: u32 },
}
