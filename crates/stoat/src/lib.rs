//! # stoat
//!
//! Handle-based boundary API for the stoat tensor engine.
//!
//! This crate is the surface a cross-language embedding would call:
//! tensors live in a handle table owned by an [`Engine`], and every
//! operation takes opaque [`TensorHandle`]s plus primitives (byte
//! buffers, `i64` shapes and axes, integer dtype/layout/device codes).
//! Nothing crosses the boundary by reference; lifetimes are explicit
//! via `release`.
//!
//! ```no_run
//! use stoat::CpuEngine;
//!
//! fn main() -> Result<(), stoat::EngineError> {
//!     let engine = CpuEngine::new();
//!     let a = engine.zeros(&[2, 3], 0, 0, (0, 0), false)?;
//!     let b = engine.reshape(a, &[3, 2])?;
//!     assert_eq!(engine.shape(b)?, vec![3, 2]);
//!     engine.release(b)?;
//!     engine.release(a)?;
//!     Ok(())
//! }
//! ```
//!
//! Logging goes through the `log` facade; the engine never installs a
//! logger, the embedding application picks the sink.

pub mod engine;
pub mod handle;

pub use engine::{Engine, EngineError};
pub use handle::TensorHandle;

pub use stoat_core::{
    Backend, DType, DeviceKind, DeviceSpec, Error, LayoutKind, Result, Shape, Tensor,
    TensorOptions,
};
pub use stoat_cpu::{CpuBackend, CpuDevice, CpuStorage};
pub use stoat_optim::{Adam, SgdMomentum};

/// The engine instantiated with the CPU backend.
pub type CpuEngine = Engine<CpuBackend>;
