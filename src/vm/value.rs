use std::fmt;

/// Quiet-NaN prefix that marks a word as a heap handle.
///
/// Only the upper 13 bits (sign, exponent, quiet bit) take part in the tag
/// test, so negative doubles and the canonical NaN used for arithmetic results
/// never match.
pub const HANDLE_TAG: u64 = 0x7FF8_0000_0000_0000;
const TAG_MASK: u64 = 0xFFF8_0000_0000_0000;

/// NaN produced by double arithmetic. The sign bit keeps it out of the handle tag.
pub const CANONICAL_NAN: u64 = 0xFFF8_0000_0000_0000;

const INDEX_MASK: u64 = 0xFFFF_FFFF;
const GENERATION_SHIFT: u32 = 32;
/// Bits 32..51, everything between the index and the tag.
const GENERATION_MASK: u64 = 0x7_FFFF;

/// Largest generation a handle can carry. A slot that reaches it is retired
/// rather than reused, so generations never wrap.
pub const MAX_GENERATION: u32 = GENERATION_MASK as u32;

/// Reference to a heap array: slot index plus the slot's generation at
/// allocation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    pub index: u32,
    pub generation: u32,
}

impl Handle {
    pub fn new(index: u32) -> Self {
        Self {
            index,
            generation: 0,
        }
    }

    pub fn with_generation(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }
}

/// A 64-bit tagged value.
///
/// One word holds a two's-complement integer, the bit pattern of an IEEE-754
/// double, or a NaN-boxed heap handle. Integers and doubles are not
/// distinguished at runtime; the opcode decides how a word is read.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Value(u64);

impl Value {
    pub const ZERO: Value = Value(0);

    pub fn from_bits(bits: u64) -> Self {
        Value(bits)
    }

    pub fn bits(self) -> u64 {
        self.0
    }

    pub fn from_int(n: i64) -> Self {
        Value(n as u64)
    }

    pub fn from_bool(b: bool) -> Self {
        Value(b as u64)
    }

    /// Box a double. NaN results are canonicalized so they cannot carry the
    /// handle tag.
    pub fn from_f64(f: f64) -> Self {
        if f.is_nan() {
            Value(CANONICAL_NAN)
        } else {
            Value(f.to_bits())
        }
    }

    pub fn from_handle(handle: Handle) -> Self {
        Value(
            HANDLE_TAG
                | (((handle.generation as u64) & GENERATION_MASK) << GENERATION_SHIFT)
                | handle.index as u64,
        )
    }

    pub fn as_int(self) -> i64 {
        self.0 as i64
    }

    pub fn as_f64(self) -> f64 {
        f64::from_bits(self.0)
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Whether this word is a NaN-boxed heap handle.
    pub fn is_array(self) -> bool {
        self.0 & TAG_MASK == HANDLE_TAG
    }

    pub fn handle(self) -> Option<Handle> {
        if !self.is_array() {
            return None;
        }
        Some(Handle {
            index: (self.0 & INDEX_MASK) as u32,
            generation: ((self.0 >> GENERATION_SHIFT) & GENERATION_MASK) as u32,
        })
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::from_int(n)
    }
}

impl From<Handle> for Value {
    fn from(h: Handle) -> Self {
        Value::from_handle(h)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.handle() {
            Some(h) => write!(f, "Array({}#{})", h.index, h.generation),
            None => write!(f, "Value({})", self.as_int()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.handle() {
            Some(h) => write!(f, "<array {}>", h.index),
            None => write!(f, "{}", self.as_int()),
        }
    }
}
