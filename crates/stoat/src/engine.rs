use stoat_core::{
    resolve_dim, resolve_insert_dim, Backend, BackendDevice, DType, DeviceKind, DeviceSpec,
    LayoutKind, Shape, Tensor, TensorOptions,
};
use stoat_optim::{Adam, SgdMomentum};

use crate::handle::{HandleTable, TensorHandle};

// Engine — The handle-based boundary of the tensor engine
//
// One entry point per operation, speaking only handles and primitives
// (byte buffers, i64 shapes/axes, integer codes). This is the surface
// a cross-language marshaling layer would call: nothing here exposes
// Tensor, and every argument is validated and decoded before it
// reaches the core.
//
// CODE TABLES (matching the original consumption protocol):
//
//   dtype:  0 f32, 1 f64, 2 f16, 3 u8, 4 i32, 5 i8, 6 i64, 7 bool,
//           8 unknown (from_blob only: use the buffer's element type)
//   layout: 0 strided, 1 sparse (decodes, then rejected by the
//           dense-only backend)
//   device: (kind, ordinal) with kind 0 cpu, 1 accelerator

/// Errors reported across the boundary, classified into the four
/// kinds the consumption protocol defines.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Malformed or unsupported argument (bad codes, negative extents,
    /// shape/dtype mismatches, sparse layout, ...).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An index or axis outside the valid range.
    #[error("out of range: {0}")]
    OutOfRange(String),

    /// Storage allocation failed.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// A handle that is not (or no longer) in the table. This is a
    /// caller programming error — a double release or a use after
    /// release — and must be treated as fatal by the caller.
    #[error("invalid handle: {0}")]
    InvalidHandle(u64),
}

impl From<stoat_core::Error> for EngineError {
    fn from(e: stoat_core::Error) -> Self {
        use stoat_core::Error as E;
        match e {
            E::DimOutOfRange { .. } | E::NarrowOutOfBounds { .. } => {
                EngineError::OutOfRange(e.to_string())
            }
            E::Allocation { .. } => EngineError::ResourceExhausted(e.to_string()),
            _ => EngineError::InvalidArgument(e.to_string()),
        }
    }
}

type EngineResult<T> = Result<T, EngineError>;

// Decode helpers

fn decode_dtype(code: i32) -> EngineResult<Option<DType>> {
    Ok(Some(match code {
        0 => DType::F32,
        1 => DType::F64,
        2 => DType::F16,
        3 => DType::U8,
        4 => DType::I32,
        5 => DType::I8,
        6 => DType::I64,
        7 => DType::Bool,
        8 => return Ok(None),
        _ => {
            return Err(EngineError::InvalidArgument(format!(
                "unknown dtype code {}",
                code
            )))
        }
    }))
}

fn encode_dtype(dtype: DType) -> i32 {
    match dtype {
        DType::F32 => 0,
        DType::F64 => 1,
        DType::F16 => 2,
        DType::U8 => 3,
        DType::I32 => 4,
        DType::I8 => 5,
        DType::I64 => 6,
        DType::Bool => 7,
    }
}

fn decode_layout(code: i32) -> EngineResult<LayoutKind> {
    match code {
        0 => Ok(LayoutKind::Strided),
        1 => Ok(LayoutKind::Sparse),
        _ => Err(EngineError::InvalidArgument(format!(
            "unknown layout code {}",
            code
        ))),
    }
}

fn decode_device(kind: i32, ordinal: i32) -> EngineResult<DeviceSpec> {
    if ordinal < 0 {
        return Err(EngineError::InvalidArgument(format!(
            "negative device ordinal {}",
            ordinal
        )));
    }
    let kind = match kind {
        0 => DeviceKind::Cpu,
        1 => DeviceKind::Accelerator,
        _ => {
            return Err(EngineError::InvalidArgument(format!(
                "unknown device kind {}",
                kind
            )))
        }
    };
    Ok(DeviceSpec {
        kind,
        ordinal: ordinal as u32,
    })
}

fn encode_device(spec: DeviceSpec) -> (i32, i32) {
    let kind = match spec.kind {
        DeviceKind::Cpu => 0,
        DeviceKind::Accelerator => 1,
    };
    (kind, spec.ordinal as i32)
}

fn decode_shape(dims: &[i64]) -> EngineResult<Shape> {
    let mut out = Vec::with_capacity(dims.len());
    for &d in dims {
        if d < 0 {
            return Err(EngineError::InvalidArgument(format!(
                "negative shape extent {}",
                d
            )));
        }
        out.push(d as usize);
    }
    Ok(Shape::new(out))
}

fn encode_shape(shape: &Shape) -> Vec<i64> {
    shape.dims().iter().map(|&d| d as i64).collect()
}

fn non_negative(name: &str, v: i64) -> EngineResult<usize> {
    if v < 0 {
        return Err(EngineError::InvalidArgument(format!(
            "{} cannot be negative, got {}",
            name, v
        )));
    }
    Ok(v as usize)
}

/// The boundary engine: a handle table plus one entry point per
/// operation. Construct one per embedding; it is `Send + Sync` and can
/// be shared behind an `Arc` (the table is internally locked).
///
/// The engine logs through the `log` facade and never installs a
/// logger itself; the embedding application chooses the sink.
pub struct Engine<B: Backend> {
    table: HandleTable<B>,
}

impl<B: Backend> Default for Engine<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: Backend> Engine<B> {
    pub fn new() -> Self {
        Engine {
            table: HandleTable::new(),
        }
    }

    /// Decode (dtype, layout, device, requires_grad) codes into
    /// options. `dtype` must be resolved by this point; from_blob
    /// handles the unknown sentinel before calling this.
    fn build_options(
        &self,
        dtype: DType,
        layout_code: i32,
        device: (i32, i32),
        requires_grad: bool,
    ) -> EngineResult<TensorOptions<B>> {
        let layout = decode_layout(layout_code)?;
        let spec = decode_device(device.0, device.1)?;
        let device = B::Device::from_spec(spec)?;
        Ok(TensorOptions::new(device)
            .dtype(dtype)
            .layout(layout)
            .requires_grad(requires_grad))
    }

    fn require_dtype(&self, code: i32) -> EngineResult<DType> {
        decode_dtype(code)?.ok_or_else(|| {
            EngineError::InvalidArgument(
                "dtype code 8 (unknown) is only valid for from_blob".to_string(),
            )
        })
    }

    fn register(&self, tensor: Tensor<B>) -> TensorHandle {
        let handle = self.table.insert(tensor);
        log::trace!("registered tensor as handle {}", handle.0);
        handle
    }

    // Factory entry points

    /// Create a tensor from a caller-owned byte buffer. `data_dtype`
    /// declares the buffer's element type (codes 0–7); `dtype` is the
    /// target type, where code 8 means "use the buffer's type". The
    /// buffer is decoded into owned storage exactly once — the result
    /// never borrows the caller's memory.
    #[allow(clippy::too_many_arguments)]
    pub fn from_blob(
        &self,
        data: &[u8],
        data_dtype: i32,
        shape: &[i64],
        dtype: i32,
        layout: i32,
        device: (i32, i32),
        requires_grad: bool,
    ) -> EngineResult<TensorHandle> {
        let data_dtype = decode_dtype(data_dtype)?.ok_or_else(|| {
            EngineError::InvalidArgument(
                "buffer dtype cannot be unknown: nothing to infer from raw bytes".to_string(),
            )
        })?;
        let target = decode_dtype(dtype)?.unwrap_or(data_dtype);
        let shape = decode_shape(shape)?;
        let opts = self.build_options(target, layout, device, requires_grad)?;
        log::debug!(
            "from_blob: {} bytes of {} as {} {}",
            data.len(),
            data_dtype,
            target,
            shape
        );
        let t = Tensor::from_bytes(data, data_dtype, shape, &opts)?;
        Ok(self.register(t))
    }

    /// Allocate a tensor with unspecified contents.
    pub fn empty(
        &self,
        shape: &[i64],
        dtype: i32,
        layout: i32,
        device: (i32, i32),
        requires_grad: bool,
    ) -> EngineResult<TensorHandle> {
        let dtype = self.require_dtype(dtype)?;
        let shape = decode_shape(shape)?;
        let opts = self.build_options(dtype, layout, device, requires_grad)?;
        Ok(self.register(Tensor::empty(shape, &opts)?))
    }

    pub fn zeros(
        &self,
        shape: &[i64],
        dtype: i32,
        layout: i32,
        device: (i32, i32),
        requires_grad: bool,
    ) -> EngineResult<TensorHandle> {
        let dtype = self.require_dtype(dtype)?;
        let shape = decode_shape(shape)?;
        let opts = self.build_options(dtype, layout, device, requires_grad)?;
        Ok(self.register(Tensor::zeros(shape, &opts)?))
    }

    pub fn ones(
        &self,
        shape: &[i64],
        dtype: i32,
        layout: i32,
        device: (i32, i32),
        requires_grad: bool,
    ) -> EngineResult<TensorHandle> {
        let dtype = self.require_dtype(dtype)?;
        let shape = decode_shape(shape)?;
        let opts = self.build_options(dtype, layout, device, requires_grad)?;
        Ok(self.register(Tensor::ones(shape, &opts)?))
    }

    #[allow(clippy::too_many_arguments)]
    pub fn full(
        &self,
        shape: &[i64],
        value: f64,
        dtype: i32,
        layout: i32,
        device: (i32, i32),
        requires_grad: bool,
    ) -> EngineResult<TensorHandle> {
        let dtype = self.require_dtype(dtype)?;
        let shape = decode_shape(shape)?;
        let opts = self.build_options(dtype, layout, device, requires_grad)?;
        Ok(self.register(Tensor::full(shape, value, &opts)?))
    }

    #[allow(clippy::too_many_arguments)]
    pub fn arange(
        &self,
        start: f64,
        end: f64,
        step: f64,
        dtype: i32,
        layout: i32,
        device: (i32, i32),
        requires_grad: bool,
    ) -> EngineResult<TensorHandle> {
        let dtype = self.require_dtype(dtype)?;
        let opts = self.build_options(dtype, layout, device, requires_grad)?;
        Ok(self.register(Tensor::arange(start, end, step, &opts)?))
    }

    #[allow(clippy::too_many_arguments)]
    pub fn linspace(
        &self,
        start: f64,
        end: f64,
        steps: i64,
        dtype: i32,
        layout: i32,
        device: (i32, i32),
        requires_grad: bool,
    ) -> EngineResult<TensorHandle> {
        let steps = non_negative("linspace steps", steps)?;
        let dtype = self.require_dtype(dtype)?;
        let opts = self.build_options(dtype, layout, device, requires_grad)?;
        Ok(self.register(Tensor::linspace(start, end, steps, &opts)?))
    }

    #[allow(clippy::too_many_arguments)]
    pub fn eye(
        &self,
        n: i64,
        m: i64,
        dtype: i32,
        layout: i32,
        device: (i32, i32),
        requires_grad: bool,
    ) -> EngineResult<TensorHandle> {
        let n = non_negative("eye rows", n)?;
        let m = non_negative("eye cols", m)?;
        let dtype = self.require_dtype(dtype)?;
        let opts = self.build_options(dtype, layout, device, requires_grad)?;
        Ok(self.register(Tensor::eye(n, m, &opts)?))
    }

    pub fn rand(
        &self,
        shape: &[i64],
        dtype: i32,
        layout: i32,
        device: (i32, i32),
        requires_grad: bool,
    ) -> EngineResult<TensorHandle> {
        let dtype = self.require_dtype(dtype)?;
        let shape = decode_shape(shape)?;
        let opts = self.build_options(dtype, layout, device, requires_grad)?;
        Ok(self.register(Tensor::rand(shape, &opts)?))
    }

    pub fn randn(
        &self,
        shape: &[i64],
        dtype: i32,
        layout: i32,
        device: (i32, i32),
        requires_grad: bool,
    ) -> EngineResult<TensorHandle> {
        let dtype = self.require_dtype(dtype)?;
        let shape = decode_shape(shape)?;
        let opts = self.build_options(dtype, layout, device, requires_grad)?;
        Ok(self.register(Tensor::randn(shape, &opts)?))
    }

    // Shape transform entry points
    //
    // Axes arrive as signed integers with negative-from-the-end
    // resolution. View-producing transforms register a new handle
    // whose tensor aliases the input's storage; the input handle
    // stays valid and independent.

    pub fn reshape(&self, handle: TensorHandle, shape: &[i64]) -> EngineResult<TensorHandle> {
        let t = self.table.get(handle)?;
        let shape = decode_shape(shape)?;
        Ok(self.register(t.reshape(shape)?))
    }

    /// Remove every axis of size 1.
    pub fn squeeze_all(&self, handle: TensorHandle) -> EngineResult<TensorHandle> {
        let t = self.table.get(handle)?;
        Ok(self.register(t.squeeze_all()))
    }

    /// Remove the given axis; it must have size 1.
    pub fn squeeze(&self, handle: TensorHandle, dim: i64) -> EngineResult<TensorHandle> {
        let t = self.table.get(handle)?;
        let dim = resolve_dim(dim, t.rank())?;
        Ok(self.register(t.squeeze(dim)?))
    }

    /// Insert a size-1 axis at the given position (rank itself is a
    /// valid insertion point).
    pub fn unsqueeze(&self, handle: TensorHandle, dim: i64) -> EngineResult<TensorHandle> {
        let t = self.table.get(handle)?;
        let dim = resolve_insert_dim(dim, t.rank())?;
        Ok(self.register(t.unsqueeze(dim)?))
    }

    pub fn permute(&self, handle: TensorHandle, dims: &[i64]) -> EngineResult<TensorHandle> {
        let t = self.table.get(handle)?;
        let rank = t.rank();
        let dims = dims
            .iter()
            .map(|&d| resolve_dim(d, rank))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(self.register(t.permute(&dims)?))
    }

    pub fn transpose(
        &self,
        handle: TensorHandle,
        dim0: i64,
        dim1: i64,
    ) -> EngineResult<TensorHandle> {
        let t = self.table.get(handle)?;
        let dim0 = resolve_dim(dim0, t.rank())?;
        let dim1 = resolve_dim(dim1, t.rank())?;
        Ok(self.register(t.transpose(dim0, dim1)?))
    }

    /// Stack along a freshly inserted axis; all inputs must have
    /// identical shapes.
    pub fn stack(&self, handles: &[TensorHandle], dim: i64) -> EngineResult<TensorHandle> {
        if handles.is_empty() {
            return Err(EngineError::InvalidArgument(
                "stack: empty tensor list".to_string(),
            ));
        }
        let tensors = handles
            .iter()
            .map(|&h| self.table.get(h))
            .collect::<Result<Vec<_>, _>>()?;
        let dim = resolve_insert_dim(dim, tensors[0].rank())?;
        Ok(self.register(Tensor::stack(&tensors, dim)?))
    }

    /// Concatenate along an existing axis.
    pub fn cat(&self, handles: &[TensorHandle], dim: i64) -> EngineResult<TensorHandle> {
        if handles.is_empty() {
            return Err(EngineError::InvalidArgument(
                "cat: empty tensor list".to_string(),
            ));
        }
        let tensors = handles
            .iter()
            .map(|&h| self.table.get(h))
            .collect::<Result<Vec<_>, _>>()?;
        let dim = resolve_dim(dim, tensors[0].rank())?;
        Ok(self.register(Tensor::cat(&tensors, dim)?))
    }

    /// Split into chunks of `chunk_size`; the last chunk may be short.
    /// Every returned handle is a view aliasing the input's storage.
    pub fn split(
        &self,
        handle: TensorHandle,
        chunk_size: i64,
        dim: i64,
    ) -> EngineResult<Vec<TensorHandle>> {
        let t = self.table.get(handle)?;
        let chunk_size = non_negative("split chunk_size", chunk_size)?;
        let dim = resolve_dim(dim, t.rank())?;
        let chunks = t.split(chunk_size, dim)?;
        Ok(chunks.into_iter().map(|c| self.register(c)).collect())
    }

    /// Split into explicitly sized chunks; sizes must sum to the axis
    /// length.
    pub fn split_with_sizes(
        &self,
        handle: TensorHandle,
        sizes: &[i64],
        dim: i64,
    ) -> EngineResult<Vec<TensorHandle>> {
        let t = self.table.get(handle)?;
        let sizes = sizes
            .iter()
            .map(|&s| non_negative("split size", s))
            .collect::<Result<Vec<_>, _>>()?;
        let dim = resolve_dim(dim, t.rank())?;
        let chunks = t.split_with_sizes(&sizes, dim)?;
        Ok(chunks.into_iter().map(|c| self.register(c)).collect())
    }

    // Optimizer entry points
    //
    // All referenced buffers are mutated in place; the grad buffer is
    // consumed (zeroed). The handles themselves stay valid.

    #[allow(clippy::too_many_arguments)]
    pub fn sgd_update(
        &self,
        weight: TensorHandle,
        grad: TensorHandle,
        state: Option<TensorHandle>,
        learning_rate: f64,
        weight_decay: f64,
        rescale_grad: f64,
        clip_grad: f64,
        momentum: f64,
    ) -> EngineResult<()> {
        let weight = self.table.get(weight)?;
        let grad = self.table.get(grad)?;
        let state = state.map(|h| self.table.get(h)).transpose()?;
        let sgd = SgdMomentum {
            learning_rate,
            weight_decay,
            rescale_grad,
            clip_grad,
            momentum,
        };
        sgd.step(&weight, &grad, state.as_ref())?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn adam_update(
        &self,
        weight: TensorHandle,
        grad: TensorHandle,
        mean: TensorHandle,
        variance: TensorHandle,
        learning_rate: f64,
        weight_decay: f64,
        rescale_grad: f64,
        clip_grad: f64,
        beta1: f64,
        beta2: f64,
        eps: f64,
    ) -> EngineResult<()> {
        let weight = self.table.get(weight)?;
        let grad = self.table.get(grad)?;
        let mean = self.table.get(mean)?;
        let variance = self.table.get(variance)?;
        let adam = Adam {
            learning_rate,
            weight_decay,
            rescale_grad,
            clip_grad,
            beta1,
            beta2,
            eps,
        };
        adam.step(&weight, &grad, &mean, &variance)?;
        Ok(())
    }

    // Lifecycle and introspection

    /// Release a handle. The tensor's storage is freed once no other
    /// live tensor (view or table entry) references it. Double release
    /// fails with `InvalidHandle`.
    pub fn release(&self, handle: TensorHandle) -> EngineResult<()> {
        log::trace!("releasing handle {}", handle.0);
        self.table.remove(handle)
    }

    pub fn shape(&self, handle: TensorHandle) -> EngineResult<Vec<i64>> {
        Ok(encode_shape(self.table.get(handle)?.shape()))
    }

    pub fn dtype(&self, handle: TensorHandle) -> EngineResult<i32> {
        Ok(encode_dtype(self.table.get(handle)?.dtype()))
    }

    /// The tensor's device as a (kind, ordinal) code pair.
    pub fn device(&self, handle: TensorHandle) -> EngineResult<(i32, i32)> {
        Ok(encode_device(self.table.get(handle)?.device_spec()))
    }

    pub fn requires_grad(&self, handle: TensorHandle) -> EngineResult<bool> {
        Ok(self.table.get(handle)?.requires_grad())
    }

    /// Read the elements back to the host in logical order.
    pub fn to_vec_f64(&self, handle: TensorHandle) -> EngineResult<Vec<f64>> {
        Ok(self.table.get(handle)?.to_f64_vec()?)
    }

    /// The tensor's gradient accumulator, registered as a fresh handle
    /// sharing the accumulator's storage. `None` when nothing has been
    /// accumulated yet.
    pub fn grad(&self, handle: TensorHandle) -> EngineResult<Option<TensorHandle>> {
        let t = self.table.get(handle)?;
        Ok(t.grad().map(|g| self.register(g)))
    }

    /// Add the tensor behind `grad` into `handle`'s accumulator.
    pub fn accumulate_grad(&self, handle: TensorHandle, grad: TensorHandle) -> EngineResult<()> {
        let t = self.table.get(handle)?;
        let g = self.table.get(grad)?;
        t.accumulate_grad(&g)?;
        Ok(())
    }

    /// Number of live handles (for leak checks at shutdown).
    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.len() == 0
    }
}
