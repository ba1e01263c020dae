//! # stoat-core
//!
//! Core tensor abstractions for the stoat tensor engine: shapes,
//! layouts, dtypes, the backend trait, and the `Tensor` type itself.
//!
//! This crate is backend-agnostic. It defines *what* a tensor is and
//! which operations exist; a backend crate (e.g., `stoat-cpu`)
//! provides the storage and kernels that make them run.
//!
//! ## Module map
//!
//! - [`shape`]: n-dimensional shapes and signed-axis resolution
//! - [`layout`]: strides + offset, the machinery behind zero-copy views
//! - [`dtype`]: the supported element types
//! - [`error`]: the single error enum used across the engine
//! - [`backend`]: the `Backend` trait a compute device implements
//! - [`tensor`]: `Tensor<B>`, factories, shape transforms, in-place ops

#[macro_use]
pub mod error;

pub mod backend;
pub mod dtype;
pub mod layout;
pub mod shape;
pub mod tensor;

pub use backend::{Backend, BackendDevice, BackendStorage, DeviceKind, DeviceSpec};
pub use dtype::{DType, WithDType};
pub use error::{Error, Result};
pub use layout::{Layout, LayoutKind, StridedIter};
pub use shape::{resolve_dim, resolve_insert_dim, Shape};
pub use tensor::{Tensor, TensorId, TensorOptions};
