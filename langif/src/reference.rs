//! FieldRef: raw handle into the value store, never odd, top bit always clear
//!
//! TaggedRef: same width as FieldRef, may carry the claim bit (bit 0) and/or the
//! demit bit (bit 63). Tags only exist in transit, everything behind the
//! dispatch boundary works on decoded FieldRefs.
use std::fmt;

use bitflags::bitflags;

use crate::{LangifError, Result};

/// Width of every reference word.
pub const REF_BITS: u32 = u64::BITS;

const INDEX_SHIFT: u64 = 1;
const INDEX_MASK: u64 = 0x7FFF_FFFF;
const GENERATION_SHIFT: u64 = 32;
const GENERATION_MASK: u64 = 0x7FFF_FFFF;

pub const MAX_INDEX: u32 = INDEX_MASK as u32;
pub const MAX_GENERATION: u32 = GENERATION_MASK as u32;

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct RefTags: u64 {
        const CLAIM = 1 << 0;
        const DEMIT = 1 << (REF_BITS - 1);
    }
}

// [0 claim]
// [1..32 slot index]
// [32..63 generation]
// [63 demit]
#[repr(transparent)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct FieldRef(u64);

#[repr(transparent)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct TaggedRef(u64);

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DecodedRef {
    pub raw: FieldRef,
    pub claimed: bool,
    pub demitted: bool,
}

/// Where a tagged reference is being consumed.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TagSite {
    /// any store operation, a claim is accepted but a demitted ref is in flight
    Operand,
    /// out/outv
    Output,
}

impl FieldRef {
    #[inline]
    pub fn from_parts(index: u32, generation: u32) -> Self {
        debug_assert!(index <= MAX_INDEX, "slot index out of range");
        debug_assert!(
            generation != 0 && generation <= MAX_GENERATION,
            "generation out of range"
        );
        let bits = (u64::from(generation) << GENERATION_SHIFT)
            | (u64::from(index) << INDEX_SHIFT);
        Self(bits)
    }

    /// Reinterpret a word as a raw reference, `None` if any tag bit is set.
    pub fn from_bits(bits: u64) -> Option<Self> {
        if bits & RefTags::all().bits() != 0 {
            return None;
        }
        Some(Self(bits))
    }

    #[inline]
    pub fn bits(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn index(self) -> u32 {
        ((self.0 >> INDEX_SHIFT) & INDEX_MASK) as u32
    }

    #[inline]
    pub fn generation(self) -> u32 {
        ((self.0 >> GENERATION_SHIFT) & GENERATION_MASK) as u32
    }
}

impl fmt::Display for FieldRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ref#{}.{}", self.index(), self.generation())
    }
}

impl TaggedRef {
    #[inline]
    pub fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    #[inline]
    pub fn bits(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn tags(self) -> RefTags {
        RefTags::from_bits_truncate(self.0)
    }

    #[inline]
    pub fn is_claimed(self) -> bool {
        self.tags().contains(RefTags::CLAIM)
    }

    #[inline]
    pub fn is_demitted(self) -> bool {
        self.tags().contains(RefTags::DEMIT)
    }
}

impl From<FieldRef> for TaggedRef {
    #[inline]
    fn from(value: FieldRef) -> Self {
        Self(value.0)
    }
}

impl TagSite {
    pub fn permitted(self) -> RefTags {
        match self {
            TagSite::Operand => RefTags::CLAIM,
            TagSite::Output => RefTags::all(),
        }
    }
}

/// Sets the claim bit.
/// The raw reference must be even, which holds for every FieldRef.
#[inline]
pub fn encode_claim(r: impl Into<TaggedRef>) -> TaggedRef {
    TaggedRef(r.into().0 | RefTags::CLAIM.bits())
}

#[inline]
pub fn encode_demit(r: impl Into<TaggedRef>) -> TaggedRef {
    TaggedRef(r.into().0 | RefTags::DEMIT.bits())
}

#[inline]
pub fn decode(tagged: TaggedRef) -> DecodedRef {
    let tags = tagged.tags();
    DecodedRef {
        raw: FieldRef(tagged.0 & !RefTags::all().bits()),
        claimed: tags.contains(RefTags::CLAIM),
        demitted: tags.contains(RefTags::DEMIT),
    }
}

/// Decode and reject tags that have no meaning at `site`.
pub fn decode_at(tagged: TaggedRef, site: TagSite) -> Result<DecodedRef> {
    let unexpected = tagged.tags().difference(site.permitted());
    if !unexpected.is_empty() {
        return Err(LangifError::InvalidTag {
            bits: tagged.bits(),
            site,
        });
    }
    Ok(decode(tagged))
}
