use std::fmt;

// DType — Supported element data types
//
// Every tensor carries a DType that determines its element size and
// numeric behavior. The set matches the dtype table the boundary
// protocol speaks:
//
//   F32  — 32-bit float, the default workhorse
//   F64  — 64-bit float, for high-precision work
//   F16  — 16-bit IEEE half float
//   U8   — unsigned byte, for image data
//   I32  — signed 32-bit int
//   I8   — signed byte
//   I64  — signed 64-bit int, for labels/indices
//   Bool — boolean masks
//
// There is deliberately no "unknown" variant here: the boundary's
// unknown sentinel decodes to the absence of a DType (infer from the
// source buffer), never to a tensor actually typed as unknown.

/// Enum of all supported element data types.
///
/// Stored inside every tensor so operations can dispatch to the
/// correct typed implementation at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    F32,
    F64,
    F16,
    U8,
    I32,
    I8,
    I64,
    Bool,
}

impl DType {
    /// Size of one element in bytes.
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DType::F32 => 4,
            DType::F64 => 8,
            DType::F16 => 2,
            DType::U8 => 1,
            DType::I32 => 4,
            DType::I8 => 1,
            DType::I64 => 8,
            DType::Bool => 1,
        }
    }

    /// Whether this dtype is a floating-point type.
    /// Only float tensors may track gradients or drive optimizer updates.
    pub fn is_float(&self) -> bool {
        matches!(self, DType::F16 | DType::F32 | DType::F64)
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DType::F32 => "f32",
            DType::F64 => "f64",
            DType::F16 => "f16",
            DType::U8 => "u8",
            DType::I32 => "i32",
            DType::I8 => "i8",
            DType::I64 => "i64",
            DType::Bool => "bool",
        };
        write!(f, "{}", s)
    }
}

// WithDType — Trait that connects Rust element types to the DType enum
//
// The bridge between Rust's type system and the runtime DType. By
// implementing it for f32, f64, etc., generic code can be written as
//
//   fn decode<T: WithDType>(bytes: &[u8]) -> Vec<T> { ... }
//
// with the DType determined from T. `Bool` has no impl on purpose:
// bool is not a numeric type (no NumCast), so boolean storage is
// handled explicitly where it matters.

/// Trait implemented by Rust types that can be stored in a tensor.
///
/// Provides the mapping between the concrete Rust type and the DType
/// enum, plus conversions to/from f64 for generic numeric code.
pub trait WithDType: Copy + Send + Sync + 'static + num_traits::NumCast + std::fmt::Debug {
    /// The corresponding DType enum variant.
    const DTYPE: DType;

    /// Convert this value to f64 (for generic numeric code).
    fn to_f64(self) -> f64;

    /// Create a value of this type from f64.
    fn from_f64(v: f64) -> Self;
}

impl WithDType for f32 {
    const DTYPE: DType = DType::F32;
    fn to_f64(self) -> f64 {
        self as f64
    }
    fn from_f64(v: f64) -> Self {
        v as f32
    }
}

impl WithDType for f64 {
    const DTYPE: DType = DType::F64;
    fn to_f64(self) -> f64 {
        self
    }
    fn from_f64(v: f64) -> Self {
        v
    }
}

impl WithDType for half::f16 {
    const DTYPE: DType = DType::F16;
    fn to_f64(self) -> f64 {
        self.to_f32() as f64
    }
    fn from_f64(v: f64) -> Self {
        half::f16::from_f64(v)
    }
}

impl WithDType for u8 {
    const DTYPE: DType = DType::U8;
    fn to_f64(self) -> f64 {
        self as f64
    }
    fn from_f64(v: f64) -> Self {
        v as u8
    }
}

impl WithDType for i32 {
    const DTYPE: DType = DType::I32;
    fn to_f64(self) -> f64 {
        self as f64
    }
    fn from_f64(v: f64) -> Self {
        v as i32
    }
}

impl WithDType for i8 {
    const DTYPE: DType = DType::I8;
    fn to_f64(self) -> f64 {
        self as f64
    }
    fn from_f64(v: f64) -> Self {
        v as i8
    }
}

impl WithDType for i64 {
    const DTYPE: DType = DType::I64;
    fn to_f64(self) -> f64 {
        self as f64
    }
    fn from_f64(v: f64) -> Self {
        v as i64
    }
}
