//! Instruction field extraction and the two content-addressed decode
//! caches used by [`crate::cpu::Cpu`] to avoid re-decoding hot loop bodies.

use crate::registers::Specifier;

/// Decoded fields of a 32-bit instruction. Handlers in [`crate::execute`]
/// dispatch on `opcode`/`funct3`/`funct7` and read operands through
/// `rd`/`rs1`/`rs2`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct DecodedFields {
    pub opcode: u32,
    pub rd: Specifier,
    pub funct3: u32,
    pub rs1: Specifier,
    pub rs2: Specifier,
    pub funct7: u32,
}

/// Extracts the fixed-position fields of a 32-bit instruction. Not all
/// fields are meaningful for every opcode (e.g. `funct7` is only meaningful
/// for `OP`/`AMO`); it is up to the opcode handler to interpret only the
/// fields its encoding actually uses.
pub fn decode_fields(inst: u32) -> DecodedFields {
    DecodedFields {
        opcode: inst & 0x7F,
        rd: Specifier::from_u5(((inst >> 7) & 0x1F) as u8),
        funct3: (inst >> 12) & 0b111,
        rs1: Specifier::from_u5(((inst >> 15) & 0x1F) as u8),
        rs2: Specifier::from_u5(((inst >> 20) & 0x1F) as u8),
        funct7: (inst >> 25) & 0x7F,
    }
}

/// Number of entries in each direct-mapped decode cache. Kept a power of
/// two so the index is a cheap mask rather than a modulo.
const CACHE_CAPACITY: usize = 1024;

/// Direct-mapped, content-addressed cache from a 32-bit instruction's
/// `inst >> 2` to its decoded fields.
///
/// Content-addressing (keyed by instruction bits, not by `pc`) is what makes
/// the cache automatically coherent with self-modifying code: a store that
/// changes an instruction's bits produces a different key on the next fetch,
/// so there is nothing to invalidate on FENCE.I.
#[derive(Debug)]
pub struct Decode32Cache {
    slots: Vec<Option<(u32, DecodedFields)>>,
}

impl Decode32Cache {
    pub fn new() -> Self {
        Self {
            slots: vec![None; CACHE_CAPACITY],
        }
    }

    /// Returns the decoded fields of `inst`, populating the cache on a miss.
    pub fn get_or_decode(&mut self, inst: u32) -> DecodedFields {
        let key = inst >> 2;
        let index = (key as usize) & (CACHE_CAPACITY - 1);
        if let Some((tag, fields)) = self.slots[index] {
            if tag == key {
                return fields;
            }
        }
        let fields = decode_fields(inst);
        self.slots[index] = Some((key, fields));
        fields
    }
}

impl Default for Decode32Cache {
    fn default() -> Self {
        Self::new()
    }
}

/// Direct-mapped, content-addressed cache from a 16-bit compressed parcel to
/// its `(expansion, valid)` pair (see [`crate::compressed::expand_compressed`]).
#[derive(Debug)]
pub struct Decode16Cache {
    slots: Vec<Option<(u16, u32, bool)>>,
}

impl Decode16Cache {
    pub fn new() -> Self {
        Self {
            slots: vec![None; CACHE_CAPACITY],
        }
    }

    pub fn get_or_expand(&mut self, c_inst: u16) -> (u32, bool) {
        let index = (c_inst as usize) & (CACHE_CAPACITY - 1);
        if let Some((tag, expansion, valid)) = self.slots[index] {
            if tag == c_inst {
                return (expansion, valid);
            }
        }
        let (expansion, valid) = crate::compressed::expand_compressed(c_inst);
        self.slots[index] = Some((c_inst, expansion, valid));
        (expansion, valid)
    }
}

impl Default for Decode16Cache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_cache_is_content_addressed() {
        let mut cache = Decode32Cache::new();
        // addi x5, x0, 0
        let a = cache.get_or_decode(0x0000_0293);
        let b = decode_fields(0x0000_0293);
        assert_eq!(a, b);
    }

    #[test]
    fn decode_cache_coherent_across_collisions() {
        let mut cache = Decode32Cache::new();
        let inst_a = 0x0000_0293u32; // key = 0
        let inst_b = inst_a.wrapping_add((CACHE_CAPACITY as u32) << 2); // same slot, different tag
        let a = cache.get_or_decode(inst_a);
        let b = cache.get_or_decode(inst_b);
        assert_eq!(decode_fields(inst_a), a);
        assert_eq!(decode_fields(inst_b), b);
        // Re-fetching inst_a after inst_b evicted its slot must still be correct.
        assert_eq!(decode_fields(inst_a), cache.get_or_decode(inst_a));
    }

    #[test]
    fn compressed_cache_matches_pure_function() {
        let mut cache = Decode16Cache::new();
        let (expansion, valid) = cache.get_or_expand(0x451D);
        let (expected_expansion, expected_valid) = crate::compressed::expand_compressed(0x451D);
        assert_eq!(expected_expansion, expansion);
        assert_eq!(expected_valid, valid);
    }
}
