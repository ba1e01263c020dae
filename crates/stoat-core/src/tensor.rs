use std::sync::{Arc, RwLock};

use crate::backend::{Backend, BackendDevice};
use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::layout::{Layout, LayoutKind};
use crate::shape::Shape;

// Tensor — The fundamental data structure
//
// A Tensor is an n-dimensional array of numbers. Like in the big
// frameworks, our Tensor:
//
//   1. Holds data on a specific device
//   2. Has a shape (e.g., [batch, channels, height, width])
//   3. Has a dtype (f32, f64, etc.)
//   4. Optionally tracks gradients (a flag plus an accumulator slot)
//
// ARCHITECTURE:
//
//   Tensor<B: Backend> is generic over the backend, so operations are
//   dispatched via the Backend trait and new backends slot in without
//   touching this file.
//
// MEMORY MODEL:
//
//   The inner data is wrapped in Arc (atomic reference counting).
//   Cloning a Tensor is cheap — just a refcount bump. Multiple tensors
//   can share the same underlying storage (views), and the storage
//   buffer is freed only when the last owning or viewing tensor drops.
//
//   Storage is behind Arc<RwLock<Storage>> so that:
//   - Multiple tensors can read concurrently
//   - In-place kernels (the optimizer path) can write through the lock
//
// WHY Arc + inner struct?
//
//   Separating Tensor (the handle) from TensorInner (the data) means
//   cloning is O(1) and views (transpose, permute, narrow, ...) share
//   the same storage via Arc<RwLock<>> while carrying their own layout.

/// Fallible staging buffer for host-side factory data, so exhaustion
/// surfaces as `Allocation` instead of aborting the process.
fn staging_vec(count: usize) -> Result<Vec<f64>> {
    let mut v = Vec::new();
    v.try_reserve_exact(count).map_err(|_| Error::Allocation {
        bytes: count.saturating_mul(std::mem::size_of::<f64>()),
    })?;
    Ok(v)
}

/// Unique identifier for a tensor (uses a global atomic counter).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TensorId(u64);

impl Default for TensorId {
    fn default() -> Self {
        Self::new()
    }
}

impl TensorId {
    pub fn new() -> Self {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        TensorId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Construction-time configuration bundle: dtype, layout, device, and
/// gradient tracking. Consumed once by the factory operations and
/// never mutated afterward.
#[derive(Debug, Clone)]
pub struct TensorOptions<B: Backend> {
    pub dtype: DType,
    pub layout: LayoutKind,
    pub device: B::Device,
    pub requires_grad: bool,
}

impl<B: Backend> TensorOptions<B> {
    /// Options with the library defaults: f32, dense-strided, no grad.
    pub fn new(device: B::Device) -> Self {
        TensorOptions {
            dtype: DType::F32,
            layout: LayoutKind::Strided,
            device,
            requires_grad: false,
        }
    }

    pub fn dtype(mut self, dtype: DType) -> Self {
        self.dtype = dtype;
        self
    }

    pub fn layout(mut self, layout: LayoutKind) -> Self {
        self.layout = layout;
        self
    }

    pub fn requires_grad(mut self, requires_grad: bool) -> Self {
        self.requires_grad = requires_grad;
        self
    }

    /// Reject configurations the engine cannot honor: sparse layout
    /// (dense-strided storage only) and gradient tracking on
    /// non-float dtypes.
    pub fn validate(&self) -> Result<()> {
        if self.layout == LayoutKind::Sparse {
            return Err(Error::UnsupportedLayout(
                "sparse tensors are not supported; only dense-strided layout",
            ));
        }
        if self.requires_grad && !self.dtype.is_float() {
            return Err(Error::NonFloatDType {
                op: "requires_grad",
                dtype: self.dtype,
            });
        }
        Ok(())
    }
}

/// Inner data of a tensor, shared via Arc.
struct TensorInner<B: Backend> {
    /// Unique identifier for this tensor.
    id: TensorId,
    /// The raw data stored on the backend's device.
    storage: Arc<RwLock<B::Storage>>,
    /// Memory layout: shape + strides + offset.
    layout: Layout,
    /// Data type of the elements.
    dtype: DType,
    /// The device this tensor lives on.
    device: B::Device,
    /// Whether this tensor tracks gradients.
    requires_grad: bool,
    /// Gradient accumulator. Populated lazily by `accumulate_grad`;
    /// cleared (zeroed in place) by the optimizer after each step.
    grad: RwLock<Option<Tensor<B>>>,
}

/// An n-dimensional array of numbers on a specific backend.
///
/// # Type Parameter
/// - `B: Backend` — the compute backend (e.g., `CpuBackend`)
///
/// # Example
/// ```ignore
/// use stoat_core::{Tensor, TensorOptions, DType};
/// use stoat_cpu::{CpuBackend, CpuDevice};
///
/// let opts = TensorOptions::<CpuBackend>::new(CpuDevice).dtype(DType::F64);
/// let a = Tensor::zeros((2, 3), &opts)?;
/// let b = a.unsqueeze(0)?; // view of `a`, shape [1, 2, 3]
/// ```
pub struct Tensor<B: Backend> {
    inner: Arc<TensorInner<B>>,
}

// Manual Clone: Arc::clone is cheap (just increment refcount).
impl<B: Backend> Clone for Tensor<B> {
    fn clone(&self) -> Self {
        Tensor {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: Backend> std::fmt::Debug for Tensor<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Tensor(id={:?}, shape={}, dtype={}, device={:?})",
            self.inner.id,
            self.inner.layout.shape(),
            self.inner.dtype,
            self.inner.device,
        )
    }
}

impl<B: Backend> Tensor<B> {
    // Internal constructors

    /// Create a tensor from freshly allocated storage and layout.
    fn from_storage(
        storage: B::Storage,
        layout: Layout,
        dtype: DType,
        device: B::Device,
        requires_grad: bool,
    ) -> Self {
        Tensor {
            inner: Arc::new(TensorInner {
                id: TensorId::new(),
                storage: Arc::new(RwLock::new(storage)),
                layout,
                dtype,
                device,
                requires_grad,
                grad: RwLock::new(None),
            }),
        }
    }

    /// Create a view tensor sharing the same storage but with a
    /// different layout. Views do not track gradients of their own.
    fn view_with_layout(&self, layout: Layout) -> Self {
        Tensor {
            inner: Arc::new(TensorInner {
                id: TensorId::new(),
                storage: Arc::clone(&self.inner.storage),
                layout,
                dtype: self.inner.dtype,
                device: self.inner.device.clone(),
                requires_grad: false,
                grad: RwLock::new(None),
            }),
        }
    }

    // Accessors

    /// Unique tensor ID.
    pub fn id(&self) -> TensorId {
        self.inner.id
    }

    /// The shape of this tensor.
    pub fn shape(&self) -> &Shape {
        self.inner.layout.shape()
    }

    /// The dimensions as a slice (shortcut for shape().dims()).
    pub fn dims(&self) -> &[usize] {
        self.inner.layout.dims()
    }

    /// Number of dimensions (rank).
    pub fn rank(&self) -> usize {
        self.inner.layout.rank()
    }

    /// Total number of elements.
    pub fn elem_count(&self) -> usize {
        self.inner.layout.elem_count()
    }

    /// Data type of the elements.
    pub fn dtype(&self) -> DType {
        self.inner.dtype
    }

    /// The device this tensor is on.
    pub fn device(&self) -> &B::Device {
        &self.inner.device
    }

    /// The memory layout (shape + strides + offset).
    pub fn layout(&self) -> &Layout {
        &self.inner.layout
    }

    /// Whether this tensor is contiguous in memory.
    pub fn is_contiguous(&self) -> bool {
        self.inner.layout.is_contiguous()
    }

    /// Whether this tensor tracks gradients.
    pub fn requires_grad(&self) -> bool {
        self.inner.requires_grad
    }

    /// Whether `self` and `other` alias the same storage buffer.
    pub fn shares_storage(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner.storage, &other.inner.storage)
    }

    fn read_storage(&self) -> Result<std::sync::RwLockReadGuard<'_, B::Storage>> {
        self.inner
            .storage
            .read()
            .map_err(|_| Error::msg("storage lock poisoned"))
    }

    fn write_storage(&self) -> Result<std::sync::RwLockWriteGuard<'_, B::Storage>> {
        self.inner
            .storage
            .write()
            .map_err(|_| Error::msg("storage lock poisoned"))
    }

    // Factory operations
    //
    // All factories take a TensorOptions bundle and return a tensor
    // that exclusively owns freshly allocated storage.

    /// Allocate a tensor without initializing its contents.
    ///
    /// The element values are unspecified; this implementation happens
    /// to zero-fill, but callers must not rely on that.
    pub fn empty(shape: impl Into<Shape>, opts: &TensorOptions<B>) -> Result<Self> {
        opts.validate()?;
        let shape = shape.into();
        let layout = Layout::contiguous(shape.clone());
        let storage = B::zeros(&shape, opts.dtype, &opts.device)?;
        Ok(Self::from_storage(
            storage,
            layout,
            opts.dtype,
            opts.device.clone(),
            opts.requires_grad,
        ))
    }

    /// Create a tensor filled with zeros.
    pub fn zeros(shape: impl Into<Shape>, opts: &TensorOptions<B>) -> Result<Self> {
        opts.validate()?;
        let shape = shape.into();
        let layout = Layout::contiguous(shape.clone());
        let storage = B::zeros(&shape, opts.dtype, &opts.device)?;
        Ok(Self::from_storage(
            storage,
            layout,
            opts.dtype,
            opts.device.clone(),
            opts.requires_grad,
        ))
    }

    /// Create a tensor filled with ones.
    pub fn ones(shape: impl Into<Shape>, opts: &TensorOptions<B>) -> Result<Self> {
        opts.validate()?;
        let shape = shape.into();
        let layout = Layout::contiguous(shape.clone());
        let storage = B::ones(&shape, opts.dtype, &opts.device)?;
        Ok(Self::from_storage(
            storage,
            layout,
            opts.dtype,
            opts.device.clone(),
            opts.requires_grad,
        ))
    }

    /// Create a tensor filled with a constant value.
    pub fn full(shape: impl Into<Shape>, val: f64, opts: &TensorOptions<B>) -> Result<Self> {
        opts.validate()?;
        let shape = shape.into();
        let layout = Layout::contiguous(shape.clone());
        let storage = B::full(&shape, val, opts.dtype, &opts.device)?;
        Ok(Self::from_storage(
            storage,
            layout,
            opts.dtype,
            opts.device.clone(),
            opts.requires_grad,
        ))
    }

    /// Create a tensor from a flat slice of f64 values.
    /// The data is converted to the configured dtype.
    pub fn from_f64_slice(
        data: &[f64],
        shape: impl Into<Shape>,
        opts: &TensorOptions<B>,
    ) -> Result<Self> {
        opts.validate()?;
        let shape = shape.into();
        if data.len() != shape.elem_count() {
            return Err(Error::ElementCountMismatch {
                shape: shape.clone(),
                expected: shape.elem_count(),
                got: data.len(),
            });
        }
        let layout = Layout::contiguous(shape);
        let storage = B::from_f64_slice(data, opts.dtype, &opts.device)?;
        Ok(Self::from_storage(
            storage,
            layout,
            opts.dtype,
            opts.device.clone(),
            opts.requires_grad,
        ))
    }

    /// Create a tensor by decoding a caller-provided byte buffer whose
    /// declared element type is `data_dtype`.
    ///
    /// The bytes are copied into owned storage exactly once, so the
    /// returned tensor is always independent of the caller's buffer.
    /// If `opts.dtype` differs from `data_dtype` the decoded elements
    /// are cast once; the boundary's "unknown" dtype sentinel is
    /// resolved by the caller passing `opts.dtype == data_dtype`.
    /// Fails if the byte count is not a whole number of elements or
    /// the element count does not match `shape`.
    pub fn from_bytes(
        data: &[u8],
        data_dtype: DType,
        shape: impl Into<Shape>,
        opts: &TensorOptions<B>,
    ) -> Result<Self> {
        opts.validate()?;
        let shape = shape.into();
        let elem_size = data_dtype.size_in_bytes();
        if data.len() % elem_size != 0 {
            bail!(
                "buffer of {} bytes is not a whole number of {} elements",
                data.len(),
                data_dtype
            );
        }
        let got = data.len() / elem_size;
        if got != shape.elem_count() {
            return Err(Error::ElementCountMismatch {
                shape: shape.clone(),
                expected: shape.elem_count(),
                got,
            });
        }
        let storage = B::from_bytes(data, data_dtype, &opts.device)?;
        let layout = Layout::contiguous(shape);
        let storage = if opts.dtype == data_dtype {
            storage
        } else {
            B::cast(&storage, &layout, opts.dtype, &opts.device)?
        };
        Ok(Self::from_storage(
            storage,
            layout,
            opts.dtype,
            opts.device.clone(),
            opts.requires_grad,
        ))
    }

    /// Create a 1-D tensor with values `start, start+step, ...`
    /// strictly before `end` (exclusive end, consistent with the
    /// direction of `step`). Fails if `step == 0`.
    pub fn arange(start: f64, end: f64, step: f64, opts: &TensorOptions<B>) -> Result<Self> {
        if step == 0.0 {
            bail!("arange: step cannot be zero");
        }
        // Count first, then fill, so the staging buffer can be
        // reserved fallibly up front.
        let mut count = 0usize;
        loop {
            // Multiply instead of accumulating so long ranges don't drift.
            let v = step.mul_add(count as f64, start);
            let done = if step > 0.0 { v >= end } else { v <= end };
            if done {
                break;
            }
            count += 1;
        }
        let mut data = staging_vec(count)?;
        data.extend((0..count).map(|i| step.mul_add(i as f64, start)));
        Self::from_f64_slice(&data, count, opts)
    }

    /// Create a 1-D tensor with exactly `steps` evenly spaced values
    /// from `start` to `end` inclusive.
    ///
    /// `steps == 0` yields an empty tensor; for `steps >= 2` the first
    /// element is exactly `start` and the last exactly `end`.
    pub fn linspace(start: f64, end: f64, steps: usize, opts: &TensorOptions<B>) -> Result<Self> {
        if steps == 0 {
            return Self::from_f64_slice(&[], 0usize, opts);
        }
        if steps == 1 {
            return Self::from_f64_slice(&[start], 1usize, opts);
        }
        let step = (end - start) / (steps as f64 - 1.0);
        let mut data = staging_vec(steps)?;
        data.extend((0..steps).map(|i| step.mul_add(i as f64, start)));
        // Pin the endpoint: the incremental formula can land a ulp off.
        data[steps - 1] = end;
        Self::from_f64_slice(&data, steps, opts)
    }

    /// Create an n×m matrix with ones on the main diagonal, zeros
    /// elsewhere. Has exactly `min(n, m)` ones.
    pub fn eye(n: usize, m: usize, opts: &TensorOptions<B>) -> Result<Self> {
        let count = n
            .checked_mul(m)
            .ok_or_else(|| Error::msg(format!("eye: {} x {} element count overflows", n, m)))?;
        let mut data = staging_vec(count)?;
        data.resize(count, 0.0);
        for i in 0..n.min(m) {
            data[i * m + i] = 1.0;
        }
        Self::from_f64_slice(&data, (n, m), opts)
    }

    /// Create a tensor with random uniform values in [0, 1).
    pub fn rand(shape: impl Into<Shape>, opts: &TensorOptions<B>) -> Result<Self> {
        opts.validate()?;
        let shape = shape.into();
        let layout = Layout::contiguous(shape.clone());
        let storage = B::rand_uniform(&shape, opts.dtype, &opts.device)?;
        Ok(Self::from_storage(
            storage,
            layout,
            opts.dtype,
            opts.device.clone(),
            opts.requires_grad,
        ))
    }

    /// Create a tensor with random normal values (mean=0, std=1).
    pub fn randn(shape: impl Into<Shape>, opts: &TensorOptions<B>) -> Result<Self> {
        opts.validate()?;
        let shape = shape.into();
        let layout = Layout::contiguous(shape.clone());
        let storage = B::rand_normal(&shape, opts.dtype, &opts.device)?;
        Ok(Self::from_storage(
            storage,
            layout,
            opts.dtype,
            opts.device.clone(),
            opts.requires_grad,
        ))
    }

    /// Create a tensor of zeros with the same shape, dtype, and device
    /// as `other`.
    pub fn zeros_like(other: &Self) -> Result<Self> {
        let opts = TensorOptions::new(other.device().clone()).dtype(other.dtype());
        Self::zeros(other.shape().clone(), &opts)
    }

    /// Create a tensor of ones with the same shape, dtype, and device
    /// as `other`.
    pub fn ones_like(other: &Self) -> Result<Self> {
        let opts = TensorOptions::new(other.device().clone()).dtype(other.dtype());
        Self::ones(other.shape().clone(), &opts)
    }

    /// Create a constant tensor with the same shape, dtype, and device
    /// as `other`.
    pub fn full_like(other: &Self, val: f64) -> Result<Self> {
        let opts = TensorOptions::new(other.device().clone()).dtype(other.dtype());
        Self::full(other.shape().clone(), val, &opts)
    }

    // Gradient accumulator
    //
    // There is no autograd graph in this engine; the accumulator is a
    // plain buffer the training loop adds into and the optimizer
    // clears after each step.

    /// Add `g` into this tensor's gradient accumulator, allocating the
    /// accumulator (as an independent contiguous copy) on first use.
    /// Fails unless this tensor tracks gradients and `g` matches in
    /// shape and dtype.
    pub fn accumulate_grad(&self, g: &Self) -> Result<()> {
        if !self.inner.requires_grad {
            bail!("accumulate_grad on a tensor that does not track gradients");
        }
        if g.dtype() != self.dtype() {
            return Err(Error::DTypeMismatch {
                expected: self.dtype(),
                got: g.dtype(),
            });
        }
        if g.shape() != self.shape() {
            return Err(Error::ShapeMismatch {
                expected: self.shape().clone(),
                got: g.shape().clone(),
            });
        }
        let mut slot = self
            .inner
            .grad
            .write()
            .map_err(|_| Error::msg("grad lock poisoned"))?;
        match &*slot {
            Some(existing) => existing.axpy_(g, 1.0)?,
            None => *slot = Some(g.contiguous_copy()?),
        }
        Ok(())
    }

    /// The gradient accumulator, if a gradient has been accumulated.
    /// The returned tensor shares the accumulator's storage.
    pub fn grad(&self) -> Option<Self> {
        self.inner.grad.read().ok()?.clone()
    }

    /// Reset the gradient accumulator by zeroing it in place, so any
    /// view of the accumulator observes the reset. A no-op when no
    /// gradient has been accumulated. This is the "detach and zero"
    /// side effect of the optimizer update rules.
    pub fn clear_grad(&self) -> Result<()> {
        let slot = self
            .inner
            .grad
            .read()
            .map_err(|_| Error::msg("grad lock poisoned"))?;
        if let Some(g) = &*slot {
            g.zero_()?;
        }
        Ok(())
    }

    // Shape transforms
    //
    // Unless noted otherwise these return views: the result shares
    // (aliases) the input's storage and only carries a new layout.

    /// Swap two axes (view — aliases storage, no data copy).
    pub fn transpose(&self, dim0: usize, dim1: usize) -> Result<Self> {
        let new_layout = self.inner.layout.transpose(dim0, dim1)?;
        Ok(self.view_with_layout(new_layout))
    }

    /// Transpose a 2-D matrix (shorthand for transpose(0, 1)).
    pub fn t(&self) -> Result<Self> {
        if self.rank() != 2 {
            bail!("t() requires a rank-2 tensor, got rank {}", self.rank());
        }
        self.transpose(0, 1)
    }

    /// Narrow (slice) along a dimension (view — aliases storage).
    pub fn narrow(&self, dim: usize, start: usize, len: usize) -> Result<Self> {
        let new_layout = self.inner.layout.narrow(dim, start, len)?;
        Ok(self.view_with_layout(new_layout))
    }

    /// Present a new shape over the same element sequence (row-major).
    ///
    /// Aliasing: if this tensor is contiguous the result is a view of
    /// the same storage; otherwise the data is copied into fresh
    /// contiguous storage first and the result owns that copy. The
    /// element count must be conserved.
    pub fn reshape(&self, new_shape: impl Into<Shape>) -> Result<Self> {
        let new_shape = new_shape.into();
        let current_count = self.elem_count();
        let new_count = new_shape.elem_count();
        if current_count != new_count {
            return Err(Error::ReshapeElementMismatch {
                src: current_count,
                dst: new_count,
                dst_shape: new_shape,
            });
        }
        let tensor = if self.is_contiguous() {
            self.clone()
        } else {
            self.contiguous()?
        };
        let new_layout = Layout::contiguous(new_shape);
        Ok(tensor.view_with_layout(new_layout))
    }

    /// Ensure the tensor is contiguous in memory.
    /// If already contiguous, returns a storage-sharing clone (cheap).
    /// Otherwise copies the data into new contiguous storage.
    pub fn contiguous(&self) -> Result<Self> {
        if self.is_contiguous() {
            return Ok(self.clone());
        }
        self.contiguous_copy()
    }

    /// Copy into fresh contiguous storage unconditionally.
    fn contiguous_copy(&self) -> Result<Self> {
        let storage = self.read_storage()?;
        let new_storage = B::to_contiguous(&storage, &self.inner.layout)?;
        let new_layout = Layout::contiguous(self.shape().clone());
        Ok(Self::from_storage(
            new_storage,
            new_layout,
            self.inner.dtype,
            self.inner.device.clone(),
            false,
        ))
    }

    /// Insert a size-1 axis at `dim` (view — aliases storage).
    /// unsqueeze(0) on [3, 4] → [1, 3, 4]
    /// unsqueeze(2) on [3, 4] → [3, 4, 1]
    pub fn unsqueeze(&self, dim: usize) -> Result<Self> {
        let rank = self.rank();
        if dim > rank {
            return Err(Error::DimOutOfRange {
                dim: dim as i64,
                rank: rank + 1,
            });
        }
        let mut new_dims = self.dims().to_vec();
        let mut new_strides = self.layout().strides().to_vec();
        // The stride of a size-1 dim never matters (you cannot move
        // along it); convention is the next dimension's stride.
        let stride_val = if dim < rank { new_strides[dim] } else { 1 };
        new_dims.insert(dim, 1);
        new_strides.insert(dim, stride_val);
        let new_layout = Layout::new(Shape::new(new_dims), new_strides, self.layout().offset());
        Ok(self.view_with_layout(new_layout))
    }

    /// Remove every axis of size 1 (view — aliases storage).
    /// squeeze_all on [1, 3, 1, 4] → [3, 4]
    pub fn squeeze_all(&self) -> Self {
        let new_dims: Vec<usize> = self.dims().iter().copied().filter(|&d| d != 1).collect();
        let new_strides: Vec<usize> = self
            .dims()
            .iter()
            .zip(self.layout().strides().iter())
            .filter(|(&d, _)| d != 1)
            .map(|(_, &s)| s)
            .collect();
        let new_layout = Layout::new(Shape::new(new_dims), new_strides, self.layout().offset());
        self.view_with_layout(new_layout)
    }

    /// Remove a specific axis of size 1 (view — aliases storage).
    ///
    /// squeeze(1) on [3, 1, 4] → [3, 4]
    ///
    /// Fails if the specified axis does not have size 1.
    pub fn squeeze(&self, dim: usize) -> Result<Self> {
        let rank = self.rank();
        if dim >= rank {
            return Err(Error::DimOutOfRange {
                dim: dim as i64,
                rank,
            });
        }
        if self.dims()[dim] != 1 {
            bail!(
                "squeeze: dimension {} has size {}, expected 1",
                dim,
                self.dims()[dim]
            );
        }
        let mut new_dims = self.dims().to_vec();
        let mut new_strides = self.layout().strides().to_vec();
        new_dims.remove(dim);
        new_strides.remove(dim);
        let new_layout = Layout::new(Shape::new(new_dims), new_strides, self.layout().offset());
        Ok(self.view_with_layout(new_layout))
    }

    /// Reorder axes per `dims`, a permutation of `0..rank` (view —
    /// aliases storage, no data copy).
    ///
    /// permute(&[2, 0, 1]) on [A, B, C] → [C, A, B]
    pub fn permute(&self, dims: &[usize]) -> Result<Self> {
        let new_layout = self.inner.layout.permute(dims)?;
        Ok(self.view_with_layout(new_layout))
    }

    /// Concatenate tensors along an existing axis.
    ///
    /// All axes other than `dim` must match in size; dtypes and
    /// devices must agree. The result owns fresh contiguous storage
    /// (no aliasing), except for a single-input list where the input
    /// is returned as-is.
    pub fn cat(tensors: &[Self], dim: usize) -> Result<Self> {
        if tensors.is_empty() {
            bail!("cat: empty tensor list");
        }
        if tensors.len() == 1 {
            return Ok(tensors[0].clone());
        }

        let first = &tensors[0];
        let rank = first.rank();
        if dim >= rank {
            return Err(Error::DimOutOfRange {
                dim: dim as i64,
                rank,
            });
        }

        // Validate shapes: all dims must match except `dim`.
        for (i, t) in tensors.iter().enumerate().skip(1) {
            if t.rank() != rank {
                bail!(
                    "cat: tensor {} has rank {} but expected {}",
                    i,
                    t.rank(),
                    rank
                );
            }
            if t.dtype() != first.dtype() {
                return Err(Error::DTypeMismatch {
                    expected: first.dtype(),
                    got: t.dtype(),
                });
            }
            if t.device() != first.device() {
                bail!("cat: tensor {} lives on a different device", i);
            }
            for d in 0..rank {
                if d != dim && t.dims()[d] != first.dims()[d] {
                    bail!(
                        "cat: tensor {} has size {} at dim {} but expected {}",
                        i,
                        t.dims()[d],
                        d,
                        first.dims()[d]
                    );
                }
            }
        }

        let cat_size: usize = tensors.iter().map(|t| t.dims()[dim]).sum();
        let mut out_dims = first.dims().to_vec();
        out_dims[dim] = cat_size;
        let out_shape = Shape::new(out_dims);

        let guards: Vec<_> = tensors
            .iter()
            .map(|t| t.read_storage())
            .collect::<Result<_>>()?;
        let pairs: Vec<(&B::Storage, &Layout)> = tensors
            .iter()
            .enumerate()
            .map(|(i, t)| (&*guards[i], &t.inner.layout))
            .collect();

        let storage = B::cat(&pairs, &out_shape, dim)?;
        let layout = Layout::contiguous(out_shape);
        Ok(Self::from_storage(
            storage,
            layout,
            first.dtype(),
            first.device().clone(),
            false,
        ))
    }

    /// Stack tensors along a new axis inserted at `dim`.
    ///
    /// All tensors must have identical shapes. The result owns fresh
    /// contiguous storage. `stack([a, b], 0)` with a, b of shape
    /// [2, 3] → [2, 2, 3].
    pub fn stack(tensors: &[Self], dim: usize) -> Result<Self> {
        if tensors.is_empty() {
            bail!("stack: empty tensor list");
        }
        let first_shape = tensors[0].shape().clone();
        let rank = first_shape.rank();
        if dim > rank {
            return Err(Error::DimOutOfRange {
                dim: dim as i64,
                rank: rank + 1,
            });
        }
        for t in tensors.iter().skip(1) {
            if t.shape() != &first_shape {
                return Err(Error::ShapeMismatch {
                    expected: first_shape.clone(),
                    got: t.shape().clone(),
                });
            }
        }
        // Unsqueeze each input at `dim`, then cat along it.
        let unsqueezed: Vec<Self> = tensors
            .iter()
            .map(|t| t.unsqueeze(dim))
            .collect::<Result<Vec<_>>>()?;
        if unsqueezed.len() == 1 {
            // cat would hand back the single view; stack promises an
            // independent result, so copy.
            return unsqueezed[0].contiguous_copy();
        }
        Self::cat(&unsqueezed, dim)
    }

    /// Split into consecutive chunks of `chunk_size` along `dim`; the
    /// last chunk may be smaller. Each chunk is a view aliasing this
    /// tensor's storage. Fails if `chunk_size == 0`.
    pub fn split(&self, chunk_size: usize, dim: usize) -> Result<Vec<Self>> {
        if chunk_size == 0 {
            bail!("split: chunk_size cannot be zero");
        }
        if dim >= self.rank() {
            return Err(Error::DimOutOfRange {
                dim: dim as i64,
                rank: self.rank(),
            });
        }
        let dim_size = self.dims()[dim];
        let mut chunks = Vec::new();
        let mut start = 0;
        while start < dim_size {
            let len = chunk_size.min(dim_size - start);
            chunks.push(self.narrow(dim, start, len)?);
            start += len;
        }
        Ok(chunks)
    }

    /// Split into chunks of explicitly given sizes along `dim`. The
    /// sizes must sum to the axis length. Each chunk is a view
    /// aliasing this tensor's storage.
    pub fn split_with_sizes(&self, sizes: &[usize], dim: usize) -> Result<Vec<Self>> {
        if dim >= self.rank() {
            return Err(Error::DimOutOfRange {
                dim: dim as i64,
                rank: self.rank(),
            });
        }
        let dim_size = self.dims()[dim];
        let total: usize = sizes.iter().sum();
        if total != dim_size {
            bail!(
                "split_with_sizes: sizes sum to {} but dim {} has size {}",
                total,
                dim,
                dim_size
            );
        }
        let mut chunks = Vec::with_capacity(sizes.len());
        let mut start = 0;
        for &len in sizes {
            chunks.push(self.narrow(dim, start, len)?);
            start += len;
        }
        Ok(chunks)
    }

    // Conversion

    /// Cast to a different dtype. Returns a storage-sharing clone when
    /// the dtype already matches; otherwise the result owns a fresh
    /// contiguous copy.
    pub fn to_dtype(&self, dtype: DType) -> Result<Self> {
        if dtype == self.dtype() {
            return Ok(self.clone());
        }
        let storage = self.read_storage()?;
        let new_storage = B::cast(&storage, &self.inner.layout, dtype, self.device())?;
        let layout = Layout::contiguous(self.shape().clone());
        Ok(Self::from_storage(
            new_storage,
            layout,
            dtype,
            self.inner.device.clone(),
            false,
        ))
    }

    /// Move to another device. When the target equals the current
    /// device this returns a storage-sharing clone (no transfer);
    /// otherwise exactly one synchronous copy is performed and the
    /// result is independent of this tensor.
    pub fn to_device(&self, device: &B::Device) -> Result<Self> {
        if device == self.device() {
            return Ok(self.clone());
        }
        let storage = self.read_storage()?;
        let new_storage = B::transfer(&storage, &self.inner.layout, device)?;
        let layout = Layout::contiguous(self.shape().clone());
        Ok(Self::from_storage(
            new_storage,
            layout,
            self.inner.dtype,
            device.clone(),
            false,
        ))
    }

    /// Copy the elements to a host Vec<f64> in logical order.
    pub fn to_f64_vec(&self) -> Result<Vec<f64>> {
        let storage = self.read_storage()?;
        B::to_f64_vec(&storage, &self.inner.layout)
    }

    // In-place operations
    //
    // These mutate the storage through this tensor's layout, visible
    // to every view sharing the buffer. Operands that alias the same
    // storage are rejected (the write lock is not reentrant), which
    // doubles as enforcement of the optimizer's destructive-grad
    // contract.

    /// Set every element to `value`.
    pub fn fill_(&self, value: f64) -> Result<()> {
        let mut storage = self.write_storage()?;
        B::fill_assign(&mut storage, &self.inner.layout, value)
    }

    /// Set every element to zero.
    pub fn zero_(&self) -> Result<()> {
        self.fill_(0.0)
    }

    /// Multiply every element by `factor`.
    pub fn scale_(&self, factor: f64) -> Result<()> {
        let mut storage = self.write_storage()?;
        B::scale_assign(&mut storage, &self.inner.layout, factor)
    }

    /// Clamp every element to `[min, max]`.
    pub fn clamp_(&self, min: f64, max: f64) -> Result<()> {
        let mut storage = self.write_storage()?;
        B::clamp_assign(&mut storage, &self.inner.layout, min, max)
    }

    /// self += alpha * other, element-wise.
    pub fn axpy_(&self, other: &Self, alpha: f64) -> Result<()> {
        self.check_inplace_operand(other)?;
        let mut dst = self.write_storage()?;
        let src = other.read_storage()?;
        B::axpy_assign(
            &mut dst,
            &self.inner.layout,
            &src,
            &other.inner.layout,
            alpha,
        )
    }

    /// self += value * a * b, element-wise.
    pub fn addcmul_(&self, a: &Self, b: &Self, value: f64) -> Result<()> {
        self.check_inplace_operand(a)?;
        self.check_inplace_operand(b)?;
        let mut dst = self.write_storage()?;
        let a_guard = a.read_storage()?;
        let b_guard = b.read_storage()?;
        B::addcmul_assign(
            &mut dst,
            &self.inner.layout,
            &a_guard,
            &a.inner.layout,
            &b_guard,
            &b.inner.layout,
            value,
        )
    }

    /// self -= learning_rate * mean / (sqrt(variance) + eps),
    /// element-wise (the fused Adam weight step).
    pub fn adam_step_(&self, mean: &Self, variance: &Self, learning_rate: f64, eps: f64) -> Result<()> {
        self.check_inplace_operand(mean)?;
        self.check_inplace_operand(variance)?;
        let mut dst = self.write_storage()?;
        let mean_guard = mean.read_storage()?;
        let var_guard = variance.read_storage()?;
        B::adam_step_assign(
            &mut dst,
            &self.inner.layout,
            &mean_guard,
            &mean.inner.layout,
            &var_guard,
            &variance.inner.layout,
            learning_rate,
            eps,
        )
    }

    fn check_inplace_operand(&self, other: &Self) -> Result<()> {
        if self.shares_storage(other) {
            return Err(Error::AliasedInPlace);
        }
        if other.dtype() != self.dtype() {
            return Err(Error::DTypeMismatch {
                expected: self.dtype(),
                got: other.dtype(),
            });
        }
        if other.shape() != self.shape() {
            return Err(Error::ShapeMismatch {
                expected: self.shape().clone(),
                got: other.shape().clone(),
            });
        }
        Ok(())
    }

    /// Resolve this tensor's device spec (for boundary introspection).
    pub fn device_spec(&self) -> crate::backend::DeviceSpec {
        self.inner.device.spec()
    }
}
