use crate::dtype::DType;
use crate::error::Result;
use crate::layout::Layout;
use crate::shape::Shape;
use std::fmt;

// Backend — Abstraction over compute devices (CPU, accelerators, ...)
//
// The Backend trait is the central abstraction that keeps the engine
// extensible. Each backend implements this trait, providing its own
// storage type and kernel implementations.
//
// WHY A TRAIT AND NOT AN ENUM?
//
// Using a trait (vs. an enum like `Device::Cpu | Device::Gpu`) means:
// - New backends can be added as separate crates without touching core
// - Each backend has its own associated storage type
// - The compiler can monomorphize for performance
//
// The tradeoff is that Tensor becomes generic: Tensor<B: Backend>.
//
// Creation kernels return fresh storage; the `*_assign` kernels mutate
// storage in place through a layout (the optimizer path, which must not
// allocate in steady state). All kernels are finite and synchronous.

/// Kind half of a device designation: the host CPU, or an attached
/// accelerator addressed by ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    Cpu,
    Accelerator,
}

/// Backend-independent device designation: kind + ordinal index.
///
/// This is what the boundary protocol speaks; each backend decides
/// which specs it can actually host via `BackendDevice::from_spec`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceSpec {
    pub kind: DeviceKind,
    pub ordinal: u32,
}

impl DeviceSpec {
    pub fn cpu() -> Self {
        DeviceSpec {
            kind: DeviceKind::Cpu,
            ordinal: 0,
        }
    }

    pub fn accelerator(ordinal: u32) -> Self {
        DeviceSpec {
            kind: DeviceKind::Accelerator,
            ordinal,
        }
    }
}

impl fmt::Display for DeviceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            DeviceKind::Cpu => write!(f, "cpu"),
            DeviceKind::Accelerator => write!(f, "accel:{}", self.ordinal),
        }
    }
}

/// Identifies a concrete compute device hosted by a backend.
pub trait BackendDevice: Clone + PartialEq + fmt::Debug + Send + Sync + 'static {
    /// A human-readable name for this device (e.g., "cpu").
    fn name(&self) -> String;

    /// The backend-independent designation of this device.
    fn spec(&self) -> DeviceSpec;

    /// Resolve a designation to a device this backend can host.
    /// Fails if the backend has no such device (e.g., an accelerator
    /// spec handed to the CPU backend).
    fn from_spec(spec: DeviceSpec) -> Result<Self>;
}

/// A storage buffer that holds tensor data on a specific device.
///
/// For the CPU this is an enum over per-dtype `Vec`s.
pub trait BackendStorage: Clone + Send + Sync + 'static {
    /// The data type of the elements in this storage.
    fn dtype(&self) -> DType;

    /// Total number of elements in this storage.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The main Backend trait. Implementing this for a struct (e.g.,
/// CpuBackend) makes that struct a complete compute backend.
///
/// Kernels take storage + layout (which encodes shape/strides/offset)
/// so views are handled correctly without materializing them.
pub trait Backend: Clone + Send + Sync + fmt::Debug + 'static {
    /// The device type for this backend.
    type Device: BackendDevice;
    /// The storage type for this backend.
    type Storage: BackendStorage;

    // Creation

    /// Allocate storage filled with zeros.
    fn zeros(shape: &Shape, dtype: DType, device: &Self::Device) -> Result<Self::Storage>;

    /// Allocate storage filled with ones.
    fn ones(shape: &Shape, dtype: DType, device: &Self::Device) -> Result<Self::Storage>;

    /// Allocate storage filled with a constant value.
    fn full(shape: &Shape, val: f64, dtype: DType, device: &Self::Device) -> Result<Self::Storage>;

    /// Create storage from a flat f64 slice, converting to the target dtype.
    fn from_f64_slice(data: &[f64], dtype: DType, device: &Self::Device) -> Result<Self::Storage>;

    /// Reinterpret a raw little-endian byte buffer as elements of
    /// `dtype`. Fails if the byte length is not a whole number of
    /// elements. This is the decode step behind the boundary's
    /// external-buffer factory; the bytes are copied into owned
    /// storage exactly once.
    fn from_bytes(data: &[u8], dtype: DType, device: &Self::Device) -> Result<Self::Storage>;

    /// Create storage with random uniform values in [0, 1).
    fn rand_uniform(shape: &Shape, dtype: DType, device: &Self::Device) -> Result<Self::Storage>;

    /// Create storage with random normal values (mean=0, std=1).
    fn rand_normal(shape: &Shape, dtype: DType, device: &Self::Device) -> Result<Self::Storage>;

    // Data movement

    /// Make a contiguous copy of the storage following the given layout.
    fn to_contiguous(input: &Self::Storage, layout: &Layout) -> Result<Self::Storage>;

    /// Copy data to a Vec<f64> on the host, in logical order.
    fn to_f64_vec(input: &Self::Storage, layout: &Layout) -> Result<Vec<f64>>;

    /// Cast storage to a different dtype.
    fn cast(
        input: &Self::Storage,
        layout: &Layout,
        dtype: DType,
        device: &Self::Device,
    ) -> Result<Self::Storage> {
        let data = Self::to_f64_vec(input, layout)?;
        Self::from_f64_slice(&data, dtype, device)
    }

    /// Copy storage onto another device hosted by this backend.
    /// The one synchronous transfer of the resource model; callers
    /// skip it when source and target devices are equal.
    fn transfer(
        input: &Self::Storage,
        layout: &Layout,
        device: &Self::Device,
    ) -> Result<Self::Storage>;

    // Concatenation

    /// Concatenate multiple storages along `dim` into a single
    /// contiguous storage. Each entry is (storage, layout) so
    /// non-contiguous inputs are handled correctly. `out_shape` is the
    /// pre-validated output shape.
    fn cat(
        inputs: &[(&Self::Storage, &Layout)],
        out_shape: &Shape,
        dim: usize,
    ) -> Result<Self::Storage>;

    // In-place kernels (the optimizer path)
    //
    // These mutate `dst` through its layout. Float dtypes only; the
    // callers validate dtype compatibility before taking write locks.

    /// dst[i] = value for every element addressed by the layout.
    fn fill_assign(dst: &mut Self::Storage, layout: &Layout, value: f64) -> Result<()>;

    /// dst[i] *= factor.
    fn scale_assign(dst: &mut Self::Storage, layout: &Layout, factor: f64) -> Result<()>;

    /// dst[i] = clamp(dst[i], min, max).
    fn clamp_assign(dst: &mut Self::Storage, layout: &Layout, min: f64, max: f64) -> Result<()>;

    /// dst[i] += alpha * src[i].
    fn axpy_assign(
        dst: &mut Self::Storage,
        dst_layout: &Layout,
        src: &Self::Storage,
        src_layout: &Layout,
        alpha: f64,
    ) -> Result<()>;

    /// dst[i] += value * a[i] * b[i].
    fn addcmul_assign(
        dst: &mut Self::Storage,
        dst_layout: &Layout,
        a: &Self::Storage,
        a_layout: &Layout,
        b: &Self::Storage,
        b_layout: &Layout,
        value: f64,
    ) -> Result<()>;

    /// Fused Adam weight step:
    /// dst[i] -= lr * mean[i] / (sqrt(variance[i]) + eps).
    ///
    /// Fusing keeps the steady-state optimizer path allocation-free;
    /// a composite of the generic kernels would need temporaries.
    fn adam_step_assign(
        dst: &mut Self::Storage,
        dst_layout: &Layout,
        mean: &Self::Storage,
        mean_layout: &Layout,
        variance: &Self::Storage,
        variance_layout: &Layout,
        learning_rate: f64,
        eps: f64,
    ) -> Result<()>;
}
