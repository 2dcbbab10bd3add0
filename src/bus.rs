//! Defines the word-granular peripheral interface consumed by [`crate::memory::Memory`].
//!
//! This is a deliberately small surface compared to a full bus protocol: the
//! core only ever dispatches whole, aligned 32-bit words to a peripheral.
//! Byte- and half-word-granular access to an MMIO range is not supported —
//! see [`crate::error::MemoryAccessError::IllegalMmioAccess`].

use std::fmt::Debug;

/// A memory-mapped peripheral, addressed over `[base, end)` in word-granular
/// units.
///
/// Implementors decide how to interpret offsets within their own range.
/// `read32`/`write32` are given the absolute address (not an offset), since
/// some peripherals (e.g. the machine timer) have multiple disjoint
/// sub-ranges of registers.
pub trait Peripheral: Debug {
    /// Returns the start address (inclusive) of this peripheral's range.
    fn base(&self) -> u32;

    /// Returns the end address (exclusive) of this peripheral's range.
    fn end(&self) -> u32;

    /// Performs a word read at `address`, which is guaranteed to be
    /// word-aligned and to fall within `[base(), end())`.
    fn read32(&mut self, address: u32) -> u32;

    /// Performs a word write at `address`, which is guaranteed to be
    /// word-aligned and to fall within `[base(), end())`.
    fn write32(&mut self, address: u32, value: u32);

    /// Advances this peripheral by one tick of the step loop, if it has any
    /// periodic behavior (e.g. polling a host file descriptor for new input).
    ///
    /// Most peripherals have no periodic behavior and can leave this as a
    /// no-op; the default implementation does nothing.
    fn tick(&mut self) {}
}
