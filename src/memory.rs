//! Flat byte-addressable RAM with an MMIO range table.
//!
//! Word accesses that fall inside a registered peripheral's `[base, end)`
//! range are dispatched to that peripheral; everything else is served
//! directly out of the backing byte vector. Byte/half-word access to an
//! MMIO range is illegal.

use crate::bus::Peripheral;
use crate::error::{MemoryAccessError, SetupError};
use crate::unit;
use log::trace;

/// Trailing padding appended after `size` bytes of backing storage, so that
/// an aligned word access at the last legal address never reads past the
/// allocation.
const TRAILING_PADDING: usize = 4;

/// Byte-addressable RAM plus a word-granular MMIO dispatch table.
///
/// `base_addr` lets a caller map the backing RAM somewhere other than
/// address zero (e.g. `0x8000_0000`, a common RISC-V RAM base used in unit
/// tests and in several real boards); all addresses passed to the `load_*`
/// and `store_*` methods are absolute, and are translated to an offset into
/// the backing vector by subtracting `base_addr`.
#[derive(Debug)]
pub struct Memory {
    base_addr: u32,
    data: Vec<u8>,
    peripherals: Vec<Box<dyn Peripheral>>,
}

impl Memory {
    /// Creates zero-initialized RAM of `size` bytes, mapped starting at
    /// `base_addr`.
    pub fn new(base_addr: u32, size: u32) -> Self {
        Self {
            base_addr,
            data: vec![0u8; size as usize + TRAILING_PADDING],
            peripherals: Vec::new(),
        }
    }

    /// Fallible form of [`Self::new`], for configuration supplied by an
    /// embedder rather than a test: rejects a zero-sized RAM and a
    /// `base_addr` whose mapped range would overflow the 32-bit address
    /// space.
    pub fn try_new(base_addr: u32, size: u32) -> Result<Self, SetupError> {
        if size == 0 {
            return Err(SetupError::InvalidRamSize(size));
        }
        if base_addr.checked_add(size).is_none() {
            return Err(SetupError::InvalidBaseAddress(base_addr, size));
        }
        Ok(Self::new(base_addr, size))
    }

    /// Creates RAM and fills it according to `mode` (see
    /// [`crate::machine::RamInit`]).
    pub fn with_init(base_addr: u32, size: u32, mode: RamInit) -> Self {
        let mut mem = Self::new(base_addr, size);
        let ram = &mut mem.data[..size as usize];
        match mode {
            RamInit::Zero => {}
            RamInit::Random => rand::Rng::fill(&mut rand::thread_rng(), ram),
            RamInit::AddrPattern => {
                for (i, byte) in ram.iter_mut().enumerate() {
                    *byte = (i as u32 & 0xFF) as u8;
                }
            }
            RamInit::Pattern(pattern) => {
                if !pattern.is_empty() {
                    for (i, byte) in ram.iter_mut().enumerate() {
                        *byte = pattern[i % pattern.len()];
                    }
                }
            }
        }
        mem
    }

    /// Size of the addressable (non-padding) RAM region, in bytes.
    pub fn size(&self) -> u32 {
        (self.data.len() - TRAILING_PADDING) as u32
    }

    /// Base address this RAM is mapped at.
    pub fn base_addr(&self) -> u32 {
        self.base_addr
    }

    /// Registers a peripheral for MMIO dispatch. Word accesses within
    /// `[peripheral.base(), peripheral.end())` will be routed to it.
    ///
    /// Panics if the new range overlaps an already-registered one — this is
    /// a setup-time configuration error, not a runtime condition, so callers
    /// that need a recoverable error should check for overlap themselves
    /// before calling this (see [`crate::machine::Machine::register_peripheral`]).
    pub fn register_peripheral(&mut self, peripheral: Box<dyn Peripheral>) {
        for existing in &self.peripherals {
            assert!(
                peripheral.end() <= existing.base() || peripheral.base() >= existing.end(),
                "peripheral range [{:#010x}, {:#010x}) overlaps existing range [{:#010x}, {:#010x})",
                peripheral.base(),
                peripheral.end(),
                existing.base(),
                existing.end(),
            );
        }
        self.peripherals.push(peripheral);
    }

    /// Fallible form of [`Self::register_peripheral`], for peripherals an
    /// embedder registers at runtime rather than at fixed setup time.
    pub fn try_register_peripheral(&mut self, peripheral: Box<dyn Peripheral>) -> Result<(), SetupError> {
        for existing in &self.peripherals {
            if peripheral.end() > existing.base() && peripheral.base() < existing.end() {
                return Err(SetupError::OverlappingPeripheral {
                    new_base: peripheral.base(),
                    new_end: peripheral.end(),
                    existing_base: existing.base(),
                    existing_end: existing.end(),
                });
            }
        }
        self.peripherals.push(peripheral);
        Ok(())
    }

    /// Advances every registered peripheral by one tick of the step loop.
    pub fn tick_peripherals(&mut self) {
        for peripheral in &mut self.peripherals {
            peripheral.tick();
        }
    }

    fn find_peripheral(&mut self, address: u32) -> Option<&mut Box<dyn Peripheral>> {
        self.peripherals
            .iter_mut()
            .find(|p| address >= p.base() && address < p.end())
    }

    fn offset(&self, address: u32, size: u32) -> Result<usize, MemoryAccessError> {
        let rel = address
            .checked_sub(self.base_addr)
            .ok_or(MemoryAccessError::OutOfBounds { address, size })?;
        if rel.checked_add(size).map(|end| end <= self.size()) != Some(true) {
            return Err(MemoryAccessError::OutOfBounds { address, size });
        }
        Ok(rel as usize)
    }

    /// Loads a single byte. If `signed`, sign-extends to `i32` before
    /// widening back to `u32`'s bit pattern; otherwise zero-extends.
    pub fn load_byte(&mut self, address: u32, signed: bool) -> Result<u32, MemoryAccessError> {
        if self.find_peripheral(address).is_some() {
            return Err(MemoryAccessError::IllegalMmioAccess {
                address,
                size: unit::BYTE,
            });
        }
        let offset = self.offset(address, unit::BYTE)?;
        let byte = self.data[offset];
        Ok(if signed {
            byte as i8 as i32 as u32
        } else {
            byte as u32
        })
    }

    /// Loads a halfword (2 bytes, little-endian).
    pub fn load_half(&mut self, address: u32, signed: bool) -> Result<u32, MemoryAccessError> {
        if self.find_peripheral(address).is_some() {
            return Err(MemoryAccessError::IllegalMmioAccess {
                address,
                size: unit::HALFWORD,
            });
        }
        let offset = self.offset(address, unit::HALFWORD)?;
        let bytes = [self.data[offset], self.data[offset + 1]];
        let half = u16::from_le_bytes(bytes);
        Ok(if signed {
            half as i16 as i32 as u32
        } else {
            half as u32
        })
    }

    /// Loads a word (4 bytes, little-endian), always unsigned.
    ///
    /// If `address` falls within a registered peripheral's range, the load
    /// is delegated to it regardless of alignment (the peripheral is assumed
    /// to only be reachable through word-aligned access in practice, but the
    /// dispatch itself does not check this).
    pub fn load_word(&mut self, address: u32) -> Result<u32, MemoryAccessError> {
        if let Some(peripheral) = self.find_peripheral(address) {
            return Ok(peripheral.read32(address));
        }
        let offset = self.offset(address, unit::WORD)?;
        if offset % 4 == 0 {
            let bytes: [u8; 4] = self.data[offset..offset + 4].try_into().unwrap();
            Ok(u32::from_le_bytes(bytes))
        } else {
            trace!("unaligned word load at {address:#010x}, assembling from bytes");
            let bytes = [
                self.data[offset],
                self.data[offset + 1],
                self.data[offset + 2],
                self.data[offset + 3],
            ];
            Ok(u32::from_le_bytes(bytes))
        }
    }

    /// Stores a single byte.
    pub fn store_byte(&mut self, address: u32, value: u32) -> Result<(), MemoryAccessError> {
        if self.find_peripheral(address).is_some() {
            return Err(MemoryAccessError::IllegalMmioAccess {
                address,
                size: unit::BYTE,
            });
        }
        let offset = self.offset(address, unit::BYTE)?;
        self.data[offset] = value as u8;
        Ok(())
    }

    /// Stores a halfword (2 bytes, little-endian).
    pub fn store_half(&mut self, address: u32, value: u32) -> Result<(), MemoryAccessError> {
        if self.find_peripheral(address).is_some() {
            return Err(MemoryAccessError::IllegalMmioAccess {
                address,
                size: unit::HALFWORD,
            });
        }
        let offset = self.offset(address, unit::HALFWORD)?;
        let bytes = (value as u16).to_le_bytes();
        self.data[offset..offset + 2].copy_from_slice(&bytes);
        Ok(())
    }

    /// Stores a word (4 bytes, little-endian).
    pub fn store_word(&mut self, address: u32, value: u32) -> Result<(), MemoryAccessError> {
        if let Some(peripheral) = self.find_peripheral(address) {
            peripheral.write32(address, value);
            return Ok(());
        }
        let offset = self.offset(address, unit::WORD)?;
        let bytes = value.to_le_bytes();
        self.data[offset..offset + 4].copy_from_slice(&bytes);
        Ok(())
    }

    /// Reads `n` bytes starting at `addr` into a freshly allocated `Vec`.
    /// Used by peripherals (e.g. the block device fixture) to DMA out of RAM.
    pub fn load_binary(&self, addr: u32, n: u32) -> Result<Vec<u8>, MemoryAccessError> {
        let offset = self.offset(addr, n)?;
        Ok(self.data[offset..offset + n as usize].to_vec())
    }

    /// Writes `bytes` starting at `addr`. Used by peripherals to DMA into
    /// RAM.
    pub fn store_binary(&mut self, addr: u32, bytes: &[u8]) -> Result<(), MemoryAccessError> {
        let offset = self.offset(addr, bytes.len() as u32)?;
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Reads a NUL-terminated C string starting at `addr`, scanning at most
    /// `max_len` bytes. Fails if no NUL byte is found within that bound.
    pub fn load_cstring(&self, addr: u32, max_len: u32) -> Result<String, MemoryAccessError> {
        let offset = self.offset(addr, 0)?;
        let available = self.size() - offset as u32;
        let scan_len = max_len.min(available) as usize;
        let bytes = &self.data[offset..offset + scan_len];
        match bytes.iter().position(|&b| b == 0) {
            Some(nul) => Ok(String::from_utf8_lossy(&bytes[..nul]).into_owned()),
            None => Err(MemoryAccessError::CStringTooLong { address: addr, max_len }),
        }
    }

    /// Returns an immutable snapshot of `[addr, addr+len)`, used for `.text`
    /// tamper-detection snapshots.
    pub fn snapshot(&self, addr: u32, len: u32) -> Result<Vec<u8>, MemoryAccessError> {
        self.load_binary(addr, len)
    }
}

/// RAM initialization mode.
#[derive(Debug, Clone)]
pub enum RamInit {
    Zero,
    Random,
    /// Each byte initialized to `address & 0xFF`.
    AddrPattern,
    /// Each byte initialized by repeating the given pattern.
    Pattern(Vec<u8>),
}

impl Default for RamInit {
    fn default() -> Self {
        Self::Zero
    }
}
