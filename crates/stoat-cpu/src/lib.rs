//! # stoat-cpu
//!
//! CPU backend for the stoat tensor engine. Storage is an enum over
//! per-dtype `Vec`s; kernels walk layouts with `StridedIter` so views
//! (transposes, narrows) are handled without materializing them.

use half::f16;
use rand::Rng;

use stoat_core::{
    Backend, BackendDevice, BackendStorage, DType, DeviceKind, DeviceSpec, Error, Layout, Result,
    Shape, WithDType,
};

/// The host CPU. There is exactly one, so this is a unit struct.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuDevice;

impl BackendDevice for CpuDevice {
    fn name(&self) -> String {
        "cpu".to_string()
    }

    fn spec(&self) -> DeviceSpec {
        DeviceSpec::cpu()
    }

    fn from_spec(spec: DeviceSpec) -> Result<Self> {
        match spec.kind {
            DeviceKind::Cpu => Ok(CpuDevice),
            DeviceKind::Accelerator => Err(Error::msg(format!(
                "device {} is not available on the cpu backend",
                spec
            ))),
        }
    }
}

/// CPU storage: one `Vec` per supported dtype.
///
/// Bool gets its own variant rather than a `WithDType` impl because
/// bool is not numeric; the few places that need boolean data handle
/// it explicitly.
#[derive(Debug, Clone)]
pub enum CpuStorage {
    F32(Vec<f32>),
    F64(Vec<f64>),
    F16(Vec<f16>),
    U8(Vec<u8>),
    I32(Vec<i32>),
    I8(Vec<i8>),
    I64(Vec<i64>),
    Bool(Vec<bool>),
}

impl BackendStorage for CpuStorage {
    fn dtype(&self) -> DType {
        match self {
            CpuStorage::F32(_) => DType::F32,
            CpuStorage::F64(_) => DType::F64,
            CpuStorage::F16(_) => DType::F16,
            CpuStorage::U8(_) => DType::U8,
            CpuStorage::I32(_) => DType::I32,
            CpuStorage::I8(_) => DType::I8,
            CpuStorage::I64(_) => DType::I64,
            CpuStorage::Bool(_) => DType::Bool,
        }
    }

    fn len(&self) -> usize {
        match self {
            CpuStorage::F32(v) => v.len(),
            CpuStorage::F64(v) => v.len(),
            CpuStorage::F16(v) => v.len(),
            CpuStorage::U8(v) => v.len(),
            CpuStorage::I32(v) => v.len(),
            CpuStorage::I8(v) => v.len(),
            CpuStorage::I64(v) => v.len(),
            CpuStorage::Bool(v) => v.len(),
        }
    }
}

// CpuDType — per-type access to the storage enum
//
// Connects a concrete element type T to its CpuStorage variant so the
// kernels can be written once, generically, and dispatched by dtype.

trait CpuDType: WithDType {
    fn into_storage(v: Vec<Self>) -> CpuStorage;
    fn vec_ref(s: &CpuStorage) -> Result<&Vec<Self>>;
    fn vec_mut(s: &mut CpuStorage) -> Result<&mut Vec<Self>>;
}

macro_rules! impl_cpu_dtype {
    ($ty:ty, $variant:ident) => {
        impl CpuDType for $ty {
            fn into_storage(v: Vec<Self>) -> CpuStorage {
                CpuStorage::$variant(v)
            }

            fn vec_ref(s: &CpuStorage) -> Result<&Vec<Self>> {
                match s {
                    CpuStorage::$variant(v) => Ok(v),
                    _ => Err(Error::DTypeMismatch {
                        expected: <$ty as WithDType>::DTYPE,
                        got: s.dtype(),
                    }),
                }
            }

            fn vec_mut(s: &mut CpuStorage) -> Result<&mut Vec<Self>> {
                match s {
                    CpuStorage::$variant(v) => Ok(v),
                    _ => Err(Error::DTypeMismatch {
                        expected: <$ty as WithDType>::DTYPE,
                        got: s.dtype(),
                    }),
                }
            }
        }
    };
}

impl_cpu_dtype!(f32, F32);
impl_cpu_dtype!(f64, F64);
impl_cpu_dtype!(f16, F16);
impl_cpu_dtype!(u8, U8);
impl_cpu_dtype!(i32, I32);
impl_cpu_dtype!(i8, I8);
impl_cpu_dtype!(i64, I64);

/// Dispatch `$body` with `$T` bound to the element type for `$dtype`.
/// Bool is rejected: the numeric kernels have no meaning for masks.
macro_rules! dispatch_numeric {
    ($dtype:expr, $op:literal, $T:ident, $body:block) => {
        match $dtype {
            DType::F32 => {
                type $T = f32;
                $body
            }
            DType::F64 => {
                type $T = f64;
                $body
            }
            DType::F16 => {
                type $T = f16;
                $body
            }
            DType::U8 => {
                type $T = u8;
                $body
            }
            DType::I32 => {
                type $T = i32;
                $body
            }
            DType::I8 => {
                type $T = i8;
                $body
            }
            DType::I64 => {
                type $T = i64;
                $body
            }
            DType::Bool => Err(Error::NonFloatDType {
                op: $op,
                dtype: DType::Bool,
            }),
        }
    };
}

/// Allocate a vector of `count` copies of `v`, reporting allocation
/// failure as an error instead of aborting.
fn alloc_filled<T: Clone>(count: usize, elem_size: usize, v: T) -> Result<Vec<T>> {
    let mut out = Vec::new();
    out.try_reserve_exact(count).map_err(|_| Error::Allocation {
        bytes: count * elem_size,
    })?;
    out.resize(count, v);
    Ok(out)
}

fn alloc_empty<T>(count: usize, elem_size: usize) -> Result<Vec<T>> {
    let mut out = Vec::new();
    out.try_reserve_exact(count).map_err(|_| Error::Allocation {
        bytes: count * elem_size,
    })?;
    Ok(out)
}

/// Gather the elements addressed by `layout` into a fresh contiguous vec.
fn gather<T: Copy>(v: &[T], layout: &Layout) -> Result<Vec<T>> {
    let mut out = alloc_empty(layout.elem_count(), std::mem::size_of::<T>())?;
    for idx in layout.strided_indices() {
        out.push(v[idx]);
    }
    Ok(out)
}

/// Concatenate along `dim`. Inputs are gathered to contiguous first,
/// then copied block-by-block: for each index of the axes before
/// `dim`, every input contributes its `dims[dim] * inner` elements.
fn cat_typed<T: Copy>(
    inputs: &[(&CpuStorage, &Layout)],
    out_shape: &Shape,
    dim: usize,
) -> Result<Vec<T>>
where
    T: CpuDType,
{
    let out_dims = out_shape.dims();
    let outer: usize = out_dims[..dim].iter().product();
    let inner: usize = out_dims[dim + 1..].iter().product();

    let mats: Vec<Vec<T>> = inputs
        .iter()
        .map(|(s, l)| gather(T::vec_ref(s)?, l))
        .collect::<Result<_>>()?;

    let mut out = alloc_empty(out_shape.elem_count(), std::mem::size_of::<T>())?;
    for o in 0..outer {
        for (mat, (_, l)) in mats.iter().zip(inputs) {
            let block = l.dims()[dim] * inner;
            out.extend_from_slice(&mat[o * block..(o + 1) * block]);
        }
    }
    Ok(out)
}

fn decode_chunk_u16(c: &[u8]) -> u16 {
    u16::from_le_bytes([c[0], c[1]])
}

fn decode_chunk_u32(c: &[u8]) -> u32 {
    u32::from_le_bytes([c[0], c[1], c[2], c[3]])
}

fn decode_chunk_u64(c: &[u8]) -> u64 {
    u64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]])
}

/// The CPU compute backend.
#[derive(Debug, Clone, Copy)]
pub struct CpuBackend;

impl Backend for CpuBackend {
    type Device = CpuDevice;
    type Storage = CpuStorage;

    fn zeros(shape: &Shape, dtype: DType, _device: &CpuDevice) -> Result<CpuStorage> {
        let n = shape.elem_count();
        let sz = dtype.size_in_bytes();
        Ok(match dtype {
            DType::F32 => CpuStorage::F32(alloc_filled(n, sz, 0.0f32)?),
            DType::F64 => CpuStorage::F64(alloc_filled(n, sz, 0.0f64)?),
            DType::F16 => CpuStorage::F16(alloc_filled(n, sz, f16::ZERO)?),
            DType::U8 => CpuStorage::U8(alloc_filled(n, sz, 0u8)?),
            DType::I32 => CpuStorage::I32(alloc_filled(n, sz, 0i32)?),
            DType::I8 => CpuStorage::I8(alloc_filled(n, sz, 0i8)?),
            DType::I64 => CpuStorage::I64(alloc_filled(n, sz, 0i64)?),
            DType::Bool => CpuStorage::Bool(alloc_filled(n, sz, false)?),
        })
    }

    fn ones(shape: &Shape, dtype: DType, device: &CpuDevice) -> Result<CpuStorage> {
        Self::full(shape, 1.0, dtype, device)
    }

    fn full(shape: &Shape, val: f64, dtype: DType, _device: &CpuDevice) -> Result<CpuStorage> {
        let n = shape.elem_count();
        let sz = dtype.size_in_bytes();
        if dtype == DType::Bool {
            return Ok(CpuStorage::Bool(alloc_filled(n, sz, val != 0.0)?));
        }
        dispatch_numeric!(dtype, "full", T, {
            Ok(T::into_storage(alloc_filled(n, sz, T::from_f64(val))?))
        })
    }

    fn from_f64_slice(data: &[f64], dtype: DType, _device: &CpuDevice) -> Result<CpuStorage> {
        let sz = dtype.size_in_bytes();
        if dtype == DType::Bool {
            let mut out = alloc_empty(data.len(), sz)?;
            out.extend(data.iter().map(|&v| v != 0.0));
            return Ok(CpuStorage::Bool(out));
        }
        dispatch_numeric!(dtype, "from_f64_slice", T, {
            let mut out: Vec<T> = alloc_empty(data.len(), sz)?;
            out.extend(data.iter().map(|&v| T::from_f64(v)));
            Ok(T::into_storage(out))
        })
    }

    fn from_bytes(data: &[u8], dtype: DType, _device: &CpuDevice) -> Result<CpuStorage> {
        let sz = dtype.size_in_bytes();
        if data.len() % sz != 0 {
            return Err(Error::msg(format!(
                "byte buffer of length {} is not a whole number of {} elements",
                data.len(),
                dtype
            )));
        }
        let n = data.len() / sz;
        Ok(match dtype {
            DType::F32 => {
                let mut out = alloc_empty(n, sz)?;
                out.extend(
                    data.chunks_exact(4)
                        .map(|c| f32::from_bits(decode_chunk_u32(c))),
                );
                CpuStorage::F32(out)
            }
            DType::F64 => {
                let mut out = alloc_empty(n, sz)?;
                out.extend(
                    data.chunks_exact(8)
                        .map(|c| f64::from_bits(decode_chunk_u64(c))),
                );
                CpuStorage::F64(out)
            }
            DType::F16 => {
                let mut out = alloc_empty(n, sz)?;
                out.extend(
                    data.chunks_exact(2)
                        .map(|c| f16::from_bits(decode_chunk_u16(c))),
                );
                CpuStorage::F16(out)
            }
            DType::U8 => CpuStorage::U8(data.to_vec()),
            DType::I32 => {
                let mut out = alloc_empty(n, sz)?;
                out.extend(data.chunks_exact(4).map(|c| decode_chunk_u32(c) as i32));
                CpuStorage::I32(out)
            }
            DType::I8 => {
                let mut out = alloc_empty(n, sz)?;
                out.extend(data.iter().map(|&b| b as i8));
                CpuStorage::I8(out)
            }
            DType::I64 => {
                let mut out = alloc_empty(n, sz)?;
                out.extend(data.chunks_exact(8).map(|c| decode_chunk_u64(c) as i64));
                CpuStorage::I64(out)
            }
            DType::Bool => {
                let mut out = alloc_empty(n, sz)?;
                out.extend(data.iter().map(|&b| b != 0));
                CpuStorage::Bool(out)
            }
        })
    }

    fn rand_uniform(shape: &Shape, dtype: DType, _device: &CpuDevice) -> Result<CpuStorage> {
        if !dtype.is_float() {
            return Err(Error::NonFloatDType {
                op: "rand_uniform",
                dtype,
            });
        }
        let n = shape.elem_count();
        let mut rng = rand::thread_rng();
        dispatch_numeric!(dtype, "rand_uniform", T, {
            let mut out: Vec<T> = alloc_empty(n, dtype.size_in_bytes())?;
            out.extend((0..n).map(|_| T::from_f64(rng.gen::<f64>())));
            Ok(T::into_storage(out))
        })
    }

    fn rand_normal(shape: &Shape, dtype: DType, _device: &CpuDevice) -> Result<CpuStorage> {
        if !dtype.is_float() {
            return Err(Error::NonFloatDType {
                op: "rand_normal",
                dtype,
            });
        }
        let n = shape.elem_count();
        let mut rng = rand::thread_rng();
        dispatch_numeric!(dtype, "rand_normal", T, {
            let mut out: Vec<T> = alloc_empty(n, dtype.size_in_bytes())?;
            // Box-Muller: two uniforms give one standard normal.
            // 1 - u keeps the argument of ln strictly positive.
            out.extend((0..n).map(|_| {
                let u1: f64 = 1.0 - rng.gen::<f64>();
                let u2: f64 = rng.gen::<f64>();
                let z = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
                T::from_f64(z)
            }));
            Ok(T::into_storage(out))
        })
    }

    fn to_contiguous(input: &CpuStorage, layout: &Layout) -> Result<CpuStorage> {
        Ok(match input {
            CpuStorage::F32(v) => CpuStorage::F32(gather(v, layout)?),
            CpuStorage::F64(v) => CpuStorage::F64(gather(v, layout)?),
            CpuStorage::F16(v) => CpuStorage::F16(gather(v, layout)?),
            CpuStorage::U8(v) => CpuStorage::U8(gather(v, layout)?),
            CpuStorage::I32(v) => CpuStorage::I32(gather(v, layout)?),
            CpuStorage::I8(v) => CpuStorage::I8(gather(v, layout)?),
            CpuStorage::I64(v) => CpuStorage::I64(gather(v, layout)?),
            CpuStorage::Bool(v) => CpuStorage::Bool(gather(v, layout)?),
        })
    }

    fn to_f64_vec(input: &CpuStorage, layout: &Layout) -> Result<Vec<f64>> {
        let mut out = alloc_empty(layout.elem_count(), 8)?;
        match input {
            CpuStorage::F32(v) => out.extend(layout.strided_indices().map(|i| v[i] as f64)),
            CpuStorage::F64(v) => out.extend(layout.strided_indices().map(|i| v[i])),
            CpuStorage::F16(v) => out.extend(layout.strided_indices().map(|i| v[i].to_f64())),
            CpuStorage::U8(v) => out.extend(layout.strided_indices().map(|i| v[i] as f64)),
            CpuStorage::I32(v) => out.extend(layout.strided_indices().map(|i| v[i] as f64)),
            CpuStorage::I8(v) => out.extend(layout.strided_indices().map(|i| v[i] as f64)),
            CpuStorage::I64(v) => out.extend(layout.strided_indices().map(|i| v[i] as f64)),
            CpuStorage::Bool(v) => out.extend(
                layout
                    .strided_indices()
                    .map(|i| if v[i] { 1.0 } else { 0.0 }),
            ),
        }
        Ok(out)
    }

    fn transfer(input: &CpuStorage, layout: &Layout, _device: &CpuDevice) -> Result<CpuStorage> {
        // Single-device backend: a transfer is a contiguous copy.
        Self::to_contiguous(input, layout)
    }

    fn cat(
        inputs: &[(&CpuStorage, &Layout)],
        out_shape: &Shape,
        dim: usize,
    ) -> Result<CpuStorage> {
        let first = inputs
            .first()
            .ok_or_else(|| Error::msg("cat: empty input list"))?;
        let dtype = first.0.dtype();
        if dtype == DType::Bool {
            let out_dims = out_shape.dims();
            let outer: usize = out_dims[..dim].iter().product();
            let inner: usize = out_dims[dim + 1..].iter().product();
            let mats: Vec<Vec<bool>> = inputs
                .iter()
                .map(|(s, l)| match s {
                    CpuStorage::Bool(v) => gather(v, l),
                    other => Err(Error::DTypeMismatch {
                        expected: DType::Bool,
                        got: other.dtype(),
                    }),
                })
                .collect::<Result<_>>()?;
            let mut out = alloc_empty(out_shape.elem_count(), 1)?;
            for o in 0..outer {
                for (mat, (_, l)) in mats.iter().zip(inputs) {
                    let block = l.dims()[dim] * inner;
                    out.extend_from_slice(&mat[o * block..(o + 1) * block]);
                }
            }
            return Ok(CpuStorage::Bool(out));
        }
        dispatch_numeric!(dtype, "cat", T, {
            Ok(T::into_storage(cat_typed::<T>(inputs, out_shape, dim)?))
        })
    }

    fn fill_assign(dst: &mut CpuStorage, layout: &Layout, value: f64) -> Result<()> {
        if let CpuStorage::Bool(v) = dst {
            let b = value != 0.0;
            for idx in layout.strided_indices() {
                v[idx] = b;
            }
            return Ok(());
        }
        dispatch_numeric!(dst.dtype(), "fill_", T, {
            let v = T::vec_mut(dst)?;
            let value = T::from_f64(value);
            for idx in layout.strided_indices() {
                v[idx] = value;
            }
            Ok(())
        })
    }

    fn scale_assign(dst: &mut CpuStorage, layout: &Layout, factor: f64) -> Result<()> {
        dispatch_numeric!(dst.dtype(), "scale_", T, {
            let v = T::vec_mut(dst)?;
            for idx in layout.strided_indices() {
                v[idx] = T::from_f64(v[idx].to_f64() * factor);
            }
            Ok(())
        })
    }

    fn clamp_assign(dst: &mut CpuStorage, layout: &Layout, min: f64, max: f64) -> Result<()> {
        dispatch_numeric!(dst.dtype(), "clamp_", T, {
            let v = T::vec_mut(dst)?;
            for idx in layout.strided_indices() {
                // max-then-min, so min > max resolves to max without
                // the panic f64::clamp would raise.
                v[idx] = T::from_f64(v[idx].to_f64().max(min).min(max));
            }
            Ok(())
        })
    }

    fn axpy_assign(
        dst: &mut CpuStorage,
        dst_layout: &Layout,
        src: &CpuStorage,
        src_layout: &Layout,
        alpha: f64,
    ) -> Result<()> {
        dispatch_numeric!(dst.dtype(), "axpy_", T, {
            let s = T::vec_ref(src)?;
            let d = T::vec_mut(dst)?;
            for (di, si) in dst_layout
                .strided_indices()
                .zip(src_layout.strided_indices())
            {
                d[di] = T::from_f64(alpha.mul_add(s[si].to_f64(), d[di].to_f64()));
            }
            Ok(())
        })
    }

    fn addcmul_assign(
        dst: &mut CpuStorage,
        dst_layout: &Layout,
        a: &CpuStorage,
        a_layout: &Layout,
        b: &CpuStorage,
        b_layout: &Layout,
        value: f64,
    ) -> Result<()> {
        dispatch_numeric!(dst.dtype(), "addcmul_", T, {
            let av = T::vec_ref(a)?;
            let bv = T::vec_ref(b)?;
            let d = T::vec_mut(dst)?;
            for ((di, ai), bi) in dst_layout
                .strided_indices()
                .zip(a_layout.strided_indices())
                .zip(b_layout.strided_indices())
            {
                let prod = av[ai].to_f64() * bv[bi].to_f64();
                d[di] = T::from_f64(value.mul_add(prod, d[di].to_f64()));
            }
            Ok(())
        })
    }

    fn adam_step_assign(
        dst: &mut CpuStorage,
        dst_layout: &Layout,
        mean: &CpuStorage,
        mean_layout: &Layout,
        variance: &CpuStorage,
        variance_layout: &Layout,
        learning_rate: f64,
        eps: f64,
    ) -> Result<()> {
        dispatch_numeric!(dst.dtype(), "adam_step_", T, {
            let m = T::vec_ref(mean)?;
            let v = T::vec_ref(variance)?;
            let d = T::vec_mut(dst)?;
            for ((di, mi), vi) in dst_layout
                .strided_indices()
                .zip(mean_layout.strided_indices())
                .zip(variance_layout.strided_indices())
            {
                let update = learning_rate * m[mi].to_f64() / (v[vi].to_f64().sqrt() + eps);
                d[di] = T::from_f64(d[di].to_f64() - update);
            }
            Ok(())
        })
    }
}
