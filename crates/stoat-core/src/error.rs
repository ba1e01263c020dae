use crate::shape::Shape;

/// All errors that can occur inside the engine core.
///
/// This enum captures every failure mode: shape mismatches, dtype
/// mismatches, out-of-bounds axes, allocation failures, and layout
/// restrictions. Using a single error type across the library keeps
/// propagation simple; the boundary crate classifies these into its
/// coarser error kinds.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Shape mismatch between two tensors (e.g., stacking [2,3] with [4,5]).
    #[error("shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: Shape, got: Shape },

    /// DType mismatch between tensors in a multi-input operation.
    #[error("dtype mismatch: expected {expected:?}, got {got:?}")]
    DTypeMismatch {
        expected: crate::DType,
        got: crate::DType,
    },

    /// Axis index out of range for the tensor's rank.
    #[error("dimension out of range: dim {dim} for tensor with {rank} dimensions")]
    DimOutOfRange { dim: i64, rank: usize },

    /// Narrow/split operation out of bounds.
    #[error("narrow out of bounds: dim {dim}, start {start}, len {len}, dim_size {dim_size}")]
    NarrowOutOfBounds {
        dim: usize,
        start: usize,
        len: usize,
        dim_size: usize,
    },

    /// Element count mismatch when creating a tensor from a buffer.
    #[error("element count mismatch: shape {shape} requires {expected} elements, got {got}")]
    ElementCountMismatch {
        shape: Shape,
        expected: usize,
        got: usize,
    },

    /// Cannot reshape because element counts differ.
    #[error(
        "cannot reshape: source has {src} elements, target shape {dst_shape} has {dst} elements"
    )]
    ReshapeElementMismatch {
        src: usize,
        dst: usize,
        dst_shape: Shape,
    },

    /// Storage allocation failed.
    #[error("allocation of {bytes} bytes failed")]
    Allocation { bytes: usize },

    /// The backend does not support the requested layout.
    #[error("unsupported layout: {0}")]
    UnsupportedLayout(&'static str),

    /// Operation requires a floating-point dtype.
    #[error("{op} requires a float dtype, got {dtype:?}")]
    NonFloatDType {
        op: &'static str,
        dtype: crate::DType,
    },

    /// Two in-place operands alias the same storage buffer.
    ///
    /// In-place kernels take a write lock on the destination storage;
    /// aliased operands would deadlock, so they are rejected up front.
    #[error("in-place operands alias the same storage")]
    AliasedInPlace,

    /// Generic message for cases not covered above.
    #[error("{0}")]
    Msg(String),
}

impl Error {
    /// Create an error from any string message.
    pub fn msg(s: impl Into<String>) -> Self {
        Error::Msg(s.into())
    }
}

/// Convenience Result type used throughout the core.
pub type Result<T> = std::result::Result<T, Error>;

/// Macro for early return with a formatted error message.
/// Usage: `bail!("something went wrong: {}", detail)`
#[macro_export]
macro_rules! bail {
    ($($arg:tt)*) => {
        return Err($crate::Error::Msg(format!($($arg)*)))
    };
}
