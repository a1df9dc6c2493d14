//! Flat call-stack slots: the i32/i64/f32/f64 values the canonical ABI uses
//! to pass a WIT value across the host/guest boundary (spec.md §3).

/// One of the four flat slot kinds the component model's flattening rules
/// ever produce.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum FlatType {
    I32,
    I64,
    F32,
    F64,
}

/// A single flat call-stack slot, carried host-side as an unsigned 64-bit
/// value regardless of its logical width (spec.md §3: "host-side
/// represented as an unsigned 64-bit carrier").
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum FlatValue {
    I32(u32),
    I64(u64),
    F32(f32),
    F64(f64),
}

impl FlatValue {
    /// The [`FlatType`] this value was constructed with.
    pub fn flat_type(&self) -> FlatType {
        match self {
            FlatValue::I32(_) => FlatType::I32,
            FlatValue::I64(_) => FlatType::I64,
            FlatValue::F32(_) => FlatType::F32,
            FlatValue::F64(_) => FlatType::F64,
        }
    }

    /// Interprets this slot as an `i32`, truncating/zero-extending as
    /// required by the carrier rule in spec.md §3.
    pub fn as_i32(&self) -> i32 {
        match self {
            FlatValue::I32(v) => *v as i32,
            FlatValue::I64(v) => *v as i32,
            FlatValue::F32(v) => v.to_bits() as i32,
            FlatValue::F64(v) => v.to_bits() as i32,
        }
    }

    /// Interprets this slot as a `u32`.
    pub fn as_u32(&self) -> u32 {
        self.as_i32() as u32
    }

    /// Interprets this slot as an `i64`.
    pub fn as_i64(&self) -> i64 {
        match self {
            FlatValue::I32(v) => *v as i32 as i64,
            FlatValue::I64(v) => *v as i64,
            FlatValue::F32(v) => v.to_bits() as i64,
            FlatValue::F64(v) => v.to_bits() as i64,
        }
    }

    /// Interprets this slot as a `u64`.
    pub fn as_u64(&self) -> u64 {
        match self {
            FlatValue::I32(v) => *v as u64,
            FlatValue::I64(v) => *v,
            FlatValue::F32(v) => v.to_bits() as u64,
            FlatValue::F64(v) => v.to_bits(),
        }
    }

    /// Interprets this slot as an `f32`.
    pub fn as_f32(&self) -> f32 {
        match self {
            FlatValue::F32(v) => *v,
            other => f32::from_bits(other.as_i32() as u32),
        }
    }

    /// Interprets this slot as an `f64`.
    pub fn as_f64(&self) -> f64 {
        match self {
            FlatValue::F64(v) => *v,
            other => f64::from_bits(other.as_u64()),
        }
    }

    /// A zero-valued slot of the given [`FlatType`], used to zero-pad unused
    /// variant/option/result payload slots (spec.md §4.D).
    pub fn zero(flat_type: FlatType) -> Self {
        match flat_type {
            FlatType::I32 => FlatValue::I32(0),
            FlatType::I64 => FlatValue::I64(0),
            FlatType::F32 => FlatValue::F32(0.0),
            FlatType::F64 => FlatValue::F64(0.0),
        }
    }
}

/// A sequence of flat slots, the in-memory representation of the call
/// stack the engine is handed for a single lower/lift.
pub type FlatSlots = Vec<FlatValue>;
