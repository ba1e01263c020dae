//! End-to-end tests through the handle boundary: everything a foreign
//! embedding would do — create, transform, update, introspect,
//! release — using only handles and primitive arguments.

use stoat::{CpuEngine, EngineError, TensorHandle};

const F32: i32 = 0;
const F64: i32 = 1;
const I32: i32 = 4;
const STRIDED: i32 = 0;
const SPARSE: i32 = 1;
const CPU: (i32, i32) = (0, 0);

fn f64_bytes(values: &[f64]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * 8);
    for v in values {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

fn f32_bytes(values: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * 4);
    for v in values {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

fn read(engine: &CpuEngine, h: TensorHandle) -> Vec<f64> {
    engine.to_vec_f64(h).unwrap()
}

// Factories

#[test]
fn from_blob_round_trips_f64() {
    let engine = CpuEngine::new();
    let bytes = f64_bytes(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    let h = engine
        .from_blob(&bytes, F64, &[2, 3], F64, STRIDED, CPU, false)
        .unwrap();
    assert_eq!(engine.shape(h).unwrap(), vec![2, 3]);
    assert_eq!(engine.dtype(h).unwrap(), F64);
    assert_eq!(read(&engine, h), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
}

#[test]
fn from_blob_unknown_dtype_uses_buffer_type() {
    let engine = CpuEngine::new();
    let bytes = f32_bytes(&[1.5, -2.5]);
    // dtype code 8 = unknown: the result takes the buffer's type.
    let h = engine
        .from_blob(&bytes, F32, &[2], 8, STRIDED, CPU, false)
        .unwrap();
    assert_eq!(engine.dtype(h).unwrap(), F32);
    assert_eq!(read(&engine, h), vec![1.5, -2.5]);
}

#[test]
fn from_blob_casts_to_requested_dtype() {
    let engine = CpuEngine::new();
    let bytes = f32_bytes(&[1.0, 2.0]);
    let h = engine
        .from_blob(&bytes, F32, &[2], F64, STRIDED, CPU, false)
        .unwrap();
    assert_eq!(engine.dtype(h).unwrap(), F64);
    assert_eq!(read(&engine, h), vec![1.0, 2.0]);
}

#[test]
fn from_blob_rejects_wrong_element_count() {
    let engine = CpuEngine::new();
    let bytes = f32_bytes(&[1.0, 2.0, 3.0]);
    let err = engine
        .from_blob(&bytes, F32, &[2, 2], F32, STRIDED, CPU, false)
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidArgument(_)));
}

#[test]
fn from_blob_rejects_ragged_byte_length() {
    let engine = CpuEngine::new();
    let err = engine
        .from_blob(&[0u8; 6], F32, &[2], F32, STRIDED, CPU, false)
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidArgument(_)));
}

#[test]
fn zeros_ones_full() {
    let engine = CpuEngine::new();
    let z = engine.zeros(&[2, 2], F32, STRIDED, CPU, false).unwrap();
    assert_eq!(read(&engine, z), vec![0.0; 4]);
    let o = engine.ones(&[3], F64, STRIDED, CPU, false).unwrap();
    assert_eq!(read(&engine, o), vec![1.0; 3]);
    let f = engine
        .full(&[2], 7.5, F64, STRIDED, CPU, false)
        .unwrap();
    assert_eq!(read(&engine, f), vec![7.5, 7.5]);
}

#[test]
fn eye_has_min_n_m_ones() {
    let engine = CpuEngine::new();
    let h = engine.eye(2, 3, F32, STRIDED, CPU, false).unwrap();
    assert_eq!(engine.shape(h).unwrap(), vec![2, 3]);
    let data = read(&engine, h);
    assert_eq!(data, vec![1.0, 0.0, 0.0, 0.0, 1.0, 0.0]);
    assert_eq!(data.iter().filter(|&&v| v == 1.0).count(), 2);
}

#[test]
fn arange_is_end_exclusive() {
    let engine = CpuEngine::new();
    let h = engine
        .arange(0.0, 10.0, 2.0, F64, STRIDED, CPU, false)
        .unwrap();
    assert_eq!(read(&engine, h), vec![0.0, 2.0, 4.0, 6.0, 8.0]);

    let down = engine
        .arange(3.0, 0.0, -1.0, F64, STRIDED, CPU, false)
        .unwrap();
    assert_eq!(read(&engine, down), vec![3.0, 2.0, 1.0]);
}

#[test]
fn arange_rejects_zero_step() {
    let engine = CpuEngine::new();
    let err = engine
        .arange(0.0, 1.0, 0.0, F64, STRIDED, CPU, false)
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidArgument(_)));
}

#[test]
fn linspace_includes_both_endpoints() {
    let engine = CpuEngine::new();
    let h = engine
        .linspace(0.0, 1.0, 5, F64, STRIDED, CPU, false)
        .unwrap();
    assert_eq!(read(&engine, h), vec![0.0, 0.25, 0.5, 0.75, 1.0]);

    let empty = engine
        .linspace(0.0, 1.0, 0, F64, STRIDED, CPU, false)
        .unwrap();
    assert_eq!(engine.shape(empty).unwrap(), vec![0]);

    let single = engine
        .linspace(2.0, 9.0, 1, F64, STRIDED, CPU, false)
        .unwrap();
    assert_eq!(read(&engine, single), vec![2.0]);
}

#[test]
fn rand_values_are_in_unit_interval() {
    let engine = CpuEngine::new();
    let h = engine.rand(&[50], F32, STRIDED, CPU, false).unwrap();
    assert!(read(&engine, h).iter().all(|v| (0.0..1.0).contains(v)));
    let n = engine.randn(&[50], F64, STRIDED, CPU, false).unwrap();
    assert!(read(&engine, n).iter().all(|v| v.is_finite()));
}

// Decode rejections

#[test]
fn sparse_layout_is_rejected() {
    let engine = CpuEngine::new();
    let err = engine.zeros(&[2], F32, SPARSE, CPU, false).unwrap_err();
    assert!(matches!(err, EngineError::InvalidArgument(_)));
}

#[test]
fn accelerator_device_is_rejected_on_cpu_backend() {
    let engine = CpuEngine::new();
    let err = engine.zeros(&[2], F32, STRIDED, (1, 0), false).unwrap_err();
    assert!(matches!(err, EngineError::InvalidArgument(_)));
}

#[test]
fn bad_codes_are_rejected() {
    let engine = CpuEngine::new();
    assert!(engine.zeros(&[2], 42, STRIDED, CPU, false).is_err());
    assert!(engine.zeros(&[2], F32, 9, CPU, false).is_err());
    assert!(engine.zeros(&[2], F32, STRIDED, (5, 0), false).is_err());
    assert!(engine.zeros(&[2, -3], F32, STRIDED, CPU, false).is_err());
    // dtype 8 (unknown) is only meaningful for from_blob.
    assert!(engine.zeros(&[2], 8, STRIDED, CPU, false).is_err());
}

#[test]
fn requires_grad_needs_float_dtype() {
    let engine = CpuEngine::new();
    let err = engine.zeros(&[2], I32, STRIDED, CPU, true).unwrap_err();
    assert!(matches!(err, EngineError::InvalidArgument(_)));
    let ok = engine.zeros(&[2], F32, STRIDED, CPU, true).unwrap();
    assert!(engine.requires_grad(ok).unwrap());
}

// Shape transforms

#[test]
fn reshape_conserves_elements() {
    let engine = CpuEngine::new();
    let bytes = f64_bytes(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    let h = engine
        .from_blob(&bytes, F64, &[2, 3], F64, STRIDED, CPU, false)
        .unwrap();
    let r = engine.reshape(h, &[3, 2]).unwrap();
    assert_eq!(engine.shape(r).unwrap(), vec![3, 2]);
    assert_eq!(read(&engine, r), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);

    assert!(matches!(
        engine.reshape(h, &[4, 2]).unwrap_err(),
        EngineError::InvalidArgument(_)
    ));
}

#[test]
fn reshape_of_transposed_view_copies_in_logical_order() {
    let engine = CpuEngine::new();
    let bytes = f64_bytes(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    let h = engine
        .from_blob(&bytes, F64, &[2, 3], F64, STRIDED, CPU, false)
        .unwrap();
    let t = engine.transpose(h, 0, 1).unwrap();
    let r = engine.reshape(t, &[6]).unwrap();
    // Transposed logical order, flattened.
    assert_eq!(read(&engine, r), vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
}

#[test]
fn squeeze_and_unsqueeze() {
    let engine = CpuEngine::new();
    let h = engine.ones(&[1, 3, 1, 4], F32, STRIDED, CPU, false).unwrap();
    let all = engine.squeeze_all(h).unwrap();
    assert_eq!(engine.shape(all).unwrap(), vec![3, 4]);

    let one = engine.squeeze(h, 2).unwrap();
    assert_eq!(engine.shape(one).unwrap(), vec![1, 3, 4]);

    // Negative axis resolves from the end: -2 is the size-1 axis.
    let neg = engine.squeeze(h, -2).unwrap();
    assert_eq!(engine.shape(neg).unwrap(), vec![1, 3, 4]);

    let back = engine.unsqueeze(all, 0).unwrap();
    assert_eq!(engine.shape(back).unwrap(), vec![1, 3, 4]);
    let trailing = engine.unsqueeze(all, 2).unwrap();
    assert_eq!(engine.shape(trailing).unwrap(), vec![3, 4, 1]);
}

#[test]
fn squeeze_rejects_non_unit_axis() {
    let engine = CpuEngine::new();
    let h = engine.ones(&[1, 3], F32, STRIDED, CPU, false).unwrap();
    assert!(matches!(
        engine.squeeze(h, 1).unwrap_err(),
        EngineError::InvalidArgument(_)
    ));
    assert!(matches!(
        engine.squeeze(h, 5).unwrap_err(),
        EngineError::OutOfRange(_)
    ));
}

#[test]
fn transpose_and_permute_reorder_data() {
    let engine = CpuEngine::new();
    let bytes = f64_bytes(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    let h = engine
        .from_blob(&bytes, F64, &[2, 3], F64, STRIDED, CPU, false)
        .unwrap();
    let t = engine.transpose(h, 0, 1).unwrap();
    assert_eq!(engine.shape(t).unwrap(), vec![3, 2]);
    assert_eq!(read(&engine, t), vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);

    let cube = engine.zeros(&[2, 3, 4], F32, STRIDED, CPU, false).unwrap();
    let p = engine.permute(cube, &[2, 0, 1]).unwrap();
    assert_eq!(engine.shape(p).unwrap(), vec![4, 2, 3]);

    assert!(engine.permute(cube, &[0, 0, 1]).is_err());
    assert!(engine.permute(cube, &[0, 1]).is_err());
}

#[test]
fn stack_inserts_a_new_axis() {
    let engine = CpuEngine::new();
    let a = engine
        .from_blob(&f64_bytes(&[1.0, 2.0]), F64, &[2], F64, STRIDED, CPU, false)
        .unwrap();
    let b = engine
        .from_blob(&f64_bytes(&[3.0, 4.0]), F64, &[2], F64, STRIDED, CPU, false)
        .unwrap();
    let s = engine.stack(&[a, b], 0).unwrap();
    assert_eq!(engine.shape(s).unwrap(), vec![2, 2]);
    assert_eq!(read(&engine, s), vec![1.0, 2.0, 3.0, 4.0]);

    let s1 = engine.stack(&[a, b], 1).unwrap();
    assert_eq!(engine.shape(s1).unwrap(), vec![2, 2]);
    assert_eq!(read(&engine, s1), vec![1.0, 3.0, 2.0, 4.0]);
}

#[test]
fn stack_rejects_mismatched_shapes_and_empty_list() {
    let engine = CpuEngine::new();
    let a = engine.ones(&[2], F32, STRIDED, CPU, false).unwrap();
    let b = engine.ones(&[3], F32, STRIDED, CPU, false).unwrap();
    assert!(engine.stack(&[a, b], 0).is_err());
    assert!(engine.stack(&[], 0).is_err());
}

#[test]
fn cat_joins_along_existing_axis() {
    let engine = CpuEngine::new();
    let a = engine
        .from_blob(
            &f64_bytes(&[1.0, 2.0, 3.0, 4.0]),
            F64,
            &[2, 2],
            F64,
            STRIDED,
            CPU,
            false,
        )
        .unwrap();
    let b = engine
        .from_blob(&f64_bytes(&[5.0, 6.0]), F64, &[1, 2], F64, STRIDED, CPU, false)
        .unwrap();
    let c = engine.cat(&[a, b], 0).unwrap();
    assert_eq!(engine.shape(c).unwrap(), vec![3, 2]);
    assert_eq!(read(&engine, c), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);

    // Non-cat axes must match.
    let bad = engine.ones(&[1, 3], F64, STRIDED, CPU, false).unwrap();
    assert!(engine.cat(&[a, bad], 0).is_err());
}

#[test]
fn split_partitions_with_short_tail() {
    let engine = CpuEngine::new();
    let h = engine
        .arange(0.0, 7.0, 1.0, F64, STRIDED, CPU, false)
        .unwrap();
    let parts = engine.split(h, 3, 0).unwrap();
    assert_eq!(parts.len(), 3);
    assert_eq!(read(&engine, parts[0]), vec![0.0, 1.0, 2.0]);
    assert_eq!(read(&engine, parts[1]), vec![3.0, 4.0, 5.0]);
    assert_eq!(read(&engine, parts[2]), vec![6.0]);

    assert!(engine.split(h, 0, 0).is_err());
}

#[test]
fn split_with_sizes_must_cover_the_axis() {
    let engine = CpuEngine::new();
    let h = engine
        .arange(0.0, 6.0, 1.0, F64, STRIDED, CPU, false)
        .unwrap();
    let parts = engine.split_with_sizes(h, &[1, 2, 3], 0).unwrap();
    assert_eq!(read(&engine, parts[0]), vec![0.0]);
    assert_eq!(read(&engine, parts[1]), vec![1.0, 2.0]);
    assert_eq!(read(&engine, parts[2]), vec![3.0, 4.0, 5.0]);

    assert!(matches!(
        engine.split_with_sizes(h, &[2, 2], 0).unwrap_err(),
        EngineError::InvalidArgument(_)
    ));
}

#[test]
fn cat_of_split_chunks_reassembles_the_input() {
    let engine = CpuEngine::new();
    let bytes = f64_bytes(&[0.1, 0.2, 0.3, 0.4, 0.5, 0.6]);
    let h = engine
        .from_blob(&bytes, F64, &[2, 3], F64, STRIDED, CPU, false)
        .unwrap();
    let parts = engine.split(h, 2, 1).unwrap();
    let joined = engine.cat(&parts, 1).unwrap();
    assert_eq!(engine.shape(joined).unwrap(), engine.shape(h).unwrap());
    // Bit-for-bit: the chunks are views, cat only moves bytes.
    assert_eq!(read(&engine, joined), read(&engine, h));
}

#[test]
fn reshape_round_trip_restores_shape_and_bits() {
    let engine = CpuEngine::new();
    let bytes = f64_bytes(&[0.1, 0.2, 0.3, 0.4, 0.5, 0.6]);
    let h = engine
        .from_blob(&bytes, F64, &[2, 3], F64, STRIDED, CPU, false)
        .unwrap();
    let r = engine.reshape(h, &[6]).unwrap();
    let back = engine.reshape(r, &[2, 3]).unwrap();
    assert_eq!(engine.shape(back).unwrap(), vec![2, 3]);
    assert_eq!(read(&engine, back), read(&engine, h));
}

// Lifecycle

#[test]
fn release_drops_the_entry_and_double_release_fails() {
    let engine = CpuEngine::new();
    let h = engine.zeros(&[2], F32, STRIDED, CPU, false).unwrap();
    assert_eq!(engine.len(), 1);
    engine.release(h).unwrap();
    assert_eq!(engine.len(), 0);
    assert!(matches!(
        engine.release(h).unwrap_err(),
        EngineError::InvalidHandle(_)
    ));
    assert!(matches!(
        engine.shape(h).unwrap_err(),
        EngineError::InvalidHandle(_)
    ));
}

#[test]
fn view_storage_outlives_parent_release() {
    let engine = CpuEngine::new();
    let h = engine
        .arange(0.0, 4.0, 1.0, F64, STRIDED, CPU, false)
        .unwrap();
    let parts = engine.split(h, 2, 0).unwrap();
    engine.release(h).unwrap();
    // The chunks alias the released parent's storage; the refcount
    // keeps the buffer alive.
    assert_eq!(read(&engine, parts[0]), vec![0.0, 1.0]);
    assert_eq!(read(&engine, parts[1]), vec![2.0, 3.0]);
}

#[test]
fn no_handles_leak_across_a_session() {
    let engine = CpuEngine::new();
    let a = engine.zeros(&[2, 2], F32, STRIDED, CPU, false).unwrap();
    let b = engine.reshape(a, &[4]).unwrap();
    let parts = engine.split(b, 2, 0).unwrap();
    for h in parts {
        engine.release(h).unwrap();
    }
    engine.release(b).unwrap();
    engine.release(a).unwrap();
    assert!(engine.is_empty());
}

// Gradient hooks and optimizer updates

#[test]
fn accumulate_and_read_grad_through_handles() {
    let engine = CpuEngine::new();
    let w = engine.zeros(&[2], F64, STRIDED, CPU, true).unwrap();
    assert!(engine.grad(w).unwrap().is_none());

    let g = engine
        .from_blob(&f64_bytes(&[1.0, 2.0]), F64, &[2], F64, STRIDED, CPU, false)
        .unwrap();
    engine.accumulate_grad(w, g).unwrap();
    engine.accumulate_grad(w, g).unwrap();

    let acc = engine.grad(w).unwrap().unwrap();
    assert_eq!(read(&engine, acc), vec![2.0, 4.0]);
}

#[test]
fn sgd_update_through_the_boundary() {
    let engine = CpuEngine::new();
    let w = engine
        .from_blob(&f64_bytes(&[1.0, 2.0]), F64, &[2], F64, STRIDED, CPU, true)
        .unwrap();
    let g = engine
        .from_blob(&f64_bytes(&[0.5, -0.5]), F64, &[2], F64, STRIDED, CPU, false)
        .unwrap();
    engine
        .sgd_update(w, g, None, 0.1, 0.0, 1.0, -1.0, 0.0)
        .unwrap();
    assert_eq!(read(&engine, w), vec![0.95, 2.05]);
    // The gradient buffer is consumed.
    assert_eq!(read(&engine, g), vec![0.0, 0.0]);
}

#[test]
fn sgd_update_with_momentum_state() {
    let engine = CpuEngine::new();
    let w = engine
        .from_blob(&f64_bytes(&[1.0]), F64, &[1], F64, STRIDED, CPU, false)
        .unwrap();
    let g = engine
        .from_blob(&f64_bytes(&[2.0]), F64, &[1], F64, STRIDED, CPU, false)
        .unwrap();
    let state = engine.zeros(&[1], F64, STRIDED, CPU, false).unwrap();
    engine
        .sgd_update(w, g, Some(state), 0.1, 0.0, 1.0, -1.0, 0.9)
        .unwrap();
    // state' = 0 * 0.9 + 0.1 * 2.0 = 0.2; w' = 1.0 - 0.2 = 0.8
    assert_eq!(read(&engine, state), vec![0.2]);
    assert_eq!(read(&engine, w), vec![0.8]);

    // Momentum without a state buffer is a caller error.
    let g2 = engine.ones(&[1], F64, STRIDED, CPU, false).unwrap();
    assert!(engine
        .sgd_update(w, g2, None, 0.1, 0.0, 1.0, -1.0, 0.9)
        .is_err());
}

#[test]
fn adam_update_through_the_boundary() {
    let engine = CpuEngine::new();
    let w = engine
        .from_blob(&f64_bytes(&[1.0]), F64, &[1], F64, STRIDED, CPU, false)
        .unwrap();
    let g = engine
        .from_blob(&f64_bytes(&[0.5]), F64, &[1], F64, STRIDED, CPU, false)
        .unwrap();
    let mean = engine.zeros(&[1], F64, STRIDED, CPU, false).unwrap();
    let variance = engine.zeros(&[1], F64, STRIDED, CPU, false).unwrap();
    engine
        .adam_update(w, g, mean, variance, 0.1, 0.0, 1.0, -1.0, 0.9, 0.999, 1e-8)
        .unwrap();
    // Expectations computed with the engine's own float sequence, so
    // they match to tolerance rather than bit-for-bit literals.
    let m = (1.0 - 0.9) * 0.5;
    let v = (1.0 - 0.999) * 0.25;
    let expected = 1.0 - 0.1 * m / (f64::sqrt(v) + 1e-8);
    let got = read(&engine, w)[0];
    assert!((got - expected).abs() < 1e-12);
    let got_mean = read(&engine, mean)[0];
    assert!((got_mean - m).abs() < 1e-12);
    assert_eq!(read(&engine, g), vec![0.0]);
}

#[test]
fn optimizer_rejects_aliased_weight_and_grad() {
    let engine = CpuEngine::new();
    let w = engine
        .from_blob(&f64_bytes(&[1.0, 2.0]), F64, &[2], F64, STRIDED, CPU, false)
        .unwrap();
    let alias = engine.reshape(w, &[2]).unwrap();
    assert!(engine
        .sgd_update(w, alias, None, 0.1, 0.0, 1.0, -1.0, 0.0)
        .is_err());
}
