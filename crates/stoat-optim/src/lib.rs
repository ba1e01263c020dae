//! # stoat-optim
//!
//! In-place optimizer update rules: SGD with momentum and an
//! Adam-style adaptive rule.
//!
//! Both optimizers mutate their operands destructively:
//!
//! - the weight is updated in place (every view of it observes the
//!   new values),
//! - the gradient buffer is consumed: it is scaled/clipped/combined
//!   during the step and **zeroed** at the end, ready for the next
//!   round of accumulation,
//! - optimizer state (momentum buffer, moment estimates) is advanced
//!   in place.
//!
//! The update formulas are kept exactly as the original engine
//! computes them. In particular the SGD rule applies weight decay and
//! the learning rate to the gradient *before* folding it into the
//! momentum buffer:
//!
//! ```text
//! g     = (g + wd * w) * lr
//! state = state * momentum + g
//! w     = w - state
//! ```
//!
//! which differs from the textbook formulation (no dampening term, no
//! Nesterov variant, lr inside the momentum accumulation). Training
//! runs depend on these exact semantics, so this is intentional and
//! must not be "fixed".
//!
//! All steps are allocation-free in steady state: every operation is
//! an in-place kernel on existing buffers.

use stoat_core::{Backend, Error, Result, Tensor};

fn check_float(op: &'static str, weight: &Tensor<impl Backend>) -> Result<()> {
    if !weight.dtype().is_float() {
        return Err(Error::NonFloatDType {
            op,
            dtype: weight.dtype(),
        });
    }
    Ok(())
}

/// Shared preamble of both update rules: gradient rescaling and
/// clipping, applied to the gradient in place.
///
/// Rescaling is skipped when the factor is exactly 1.0; clipping is
/// active only when `clip_grad` is non-negative (negative disables it,
/// matching the original engine's sentinel convention).
fn rescale_and_clip<B: Backend>(
    grad: &Tensor<B>,
    rescale_grad: f64,
    clip_grad: f64,
) -> Result<()> {
    if rescale_grad != 1.0 {
        grad.scale_(rescale_grad)?;
    }
    if clip_grad >= 0.0 {
        grad.clamp_(-clip_grad, clip_grad)?;
    }
    Ok(())
}

/// SGD with (optional) momentum.
///
/// With `momentum == 0.0` no state tensor is needed and the update is
/// a plain scaled gradient descent step; otherwise the caller owns a
/// momentum buffer that must persist across steps.
#[derive(Debug, Clone, Copy)]
pub struct SgdMomentum {
    pub learning_rate: f64,
    pub weight_decay: f64,
    pub rescale_grad: f64,
    pub clip_grad: f64,
    pub momentum: f64,
}

impl SgdMomentum {
    pub fn new(learning_rate: f64) -> Self {
        SgdMomentum {
            learning_rate,
            weight_decay: 0.0,
            rescale_grad: 1.0,
            clip_grad: -1.0,
            momentum: 0.0,
        }
    }

    /// Perform one update step in place.
    ///
    /// `state` is the momentum buffer; it is required exactly when
    /// `momentum != 0.0`. The gradient is consumed (zeroed) at the
    /// end of the step.
    pub fn step<B: Backend>(
        &self,
        weight: &Tensor<B>,
        grad: &Tensor<B>,
        state: Option<&Tensor<B>>,
    ) -> Result<()> {
        check_float("sgd_update", weight)?;
        log::debug!(
            "sgd step: lr={} momentum={} wd={} shape={}",
            self.learning_rate,
            self.momentum,
            self.weight_decay,
            weight.shape()
        );

        rescale_and_clip(grad, self.rescale_grad, self.clip_grad)?;

        // g = (g + wd * w) * lr
        grad.axpy_(weight, self.weight_decay)?;
        grad.scale_(self.learning_rate)?;

        if self.momentum == 0.0 {
            weight.axpy_(grad, -1.0)?;
        } else {
            let state = state.ok_or_else(|| {
                Error::msg("sgd_update: momentum is non-zero but no state tensor was given")
            })?;
            // state = state * momentum + g; w = w - state
            state.scale_(self.momentum)?;
            state.axpy_(grad, 1.0)?;
            weight.axpy_(state, -1.0)?;
        }

        // Consume the gradient for the next accumulation round.
        grad.zero_()?;
        weight.clear_grad()
    }
}

/// Adam-style adaptive update.
///
/// The caller owns the first-moment (`mean`) and second-moment
/// (`variance`) buffers, both persisted across steps. Note that the
/// rule applies no bias correction and folds weight decay into the
/// gradient without the learning-rate scaling SGD uses.
#[derive(Debug, Clone, Copy)]
pub struct Adam {
    pub learning_rate: f64,
    pub weight_decay: f64,
    pub rescale_grad: f64,
    pub clip_grad: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
}

impl Adam {
    pub fn new(learning_rate: f64) -> Self {
        Adam {
            learning_rate,
            weight_decay: 0.0,
            rescale_grad: 1.0,
            clip_grad: -1.0,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
        }
    }

    /// Perform one update step in place. The gradient is consumed
    /// (zeroed) at the end of the step.
    pub fn step<B: Backend>(
        &self,
        weight: &Tensor<B>,
        grad: &Tensor<B>,
        mean: &Tensor<B>,
        variance: &Tensor<B>,
    ) -> Result<()> {
        check_float("adam_update", weight)?;
        log::debug!(
            "adam step: lr={} beta1={} beta2={} shape={}",
            self.learning_rate,
            self.beta1,
            self.beta2,
            weight.shape()
        );

        rescale_and_clip(grad, self.rescale_grad, self.clip_grad)?;

        // g = g + wd * w (no learning-rate scaling here)
        grad.axpy_(weight, self.weight_decay)?;

        // mean = mean * beta1 + g * (1 - beta1)
        mean.scale_(self.beta1)?;
        mean.axpy_(grad, 1.0 - self.beta1)?;

        // variance = variance * beta2 + g^2 * (1 - beta2)
        variance.scale_(self.beta2)?;
        variance.addcmul_(grad, grad, 1.0 - self.beta2)?;

        // w = w - lr * mean / (sqrt(variance) + eps)
        weight.adam_step_(mean, variance, self.learning_rate, self.eps)?;

        grad.zero_()?;
        weight.clear_grad()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stoat_core::{DType, TensorOptions};
    use stoat_cpu::{CpuBackend, CpuDevice};

    fn opts() -> TensorOptions<CpuBackend> {
        TensorOptions::new(CpuDevice).dtype(DType::F64)
    }

    fn tensor(data: &[f64]) -> Tensor<CpuBackend> {
        Tensor::from_f64_slice(data, data.len(), &opts()).unwrap()
    }

    fn assert_close(got: &[f64], want: &[f64]) {
        assert_eq!(got.len(), want.len());
        for (g, w) in got.iter().zip(want) {
            assert!((g - w).abs() < 1e-12, "got {:?}, want {:?}", got, want);
        }
    }

    #[test]
    fn test_sgd_plain_descent() {
        let w = tensor(&[1.0, 2.0, 3.0]);
        let g = tensor(&[0.5, -0.5, 1.0]);
        let sgd = SgdMomentum::new(0.1);
        sgd.step(&w, &g, None).unwrap();
        assert_close(&w.to_f64_vec().unwrap(), &[0.95, 2.05, 2.9]);
        // Gradient is consumed.
        assert_close(&g.to_f64_vec().unwrap(), &[0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_sgd_momentum_folds_lr_into_state() {
        // state' = state * mu + lr * g; w' = w - state'
        let w = tensor(&[1.0]);
        let g = tensor(&[2.0]);
        let state = tensor(&[0.5]);
        let sgd = SgdMomentum {
            momentum: 0.9,
            ..SgdMomentum::new(0.1)
        };
        sgd.step(&w, &g, Some(&state)).unwrap();
        // state' = 0.5*0.9 + 0.1*2.0 = 0.65; w' = 1.0 - 0.65 = 0.35
        assert_close(&state.to_f64_vec().unwrap(), &[0.65]);
        assert_close(&w.to_f64_vec().unwrap(), &[0.35]);
    }

    #[test]
    fn test_sgd_weight_decay() {
        // g' = (g + wd*w) * lr = (1.0 + 0.1*2.0) * 0.5 = 0.6
        let w = tensor(&[2.0]);
        let g = tensor(&[1.0]);
        let sgd = SgdMomentum {
            weight_decay: 0.1,
            ..SgdMomentum::new(0.5)
        };
        sgd.step(&w, &g, None).unwrap();
        assert_close(&w.to_f64_vec().unwrap(), &[1.4]);
    }

    #[test]
    fn test_sgd_rescale_and_clip() {
        // g=4 → rescale 0.5 → 2 → clip to 1 → w' = 10 - 1*1 = 9
        let w = tensor(&[10.0]);
        let g = tensor(&[4.0]);
        let sgd = SgdMomentum {
            rescale_grad: 0.5,
            clip_grad: 1.0,
            ..SgdMomentum::new(1.0)
        };
        sgd.step(&w, &g, None).unwrap();
        assert_close(&w.to_f64_vec().unwrap(), &[9.0]);
    }

    #[test]
    fn test_sgd_negative_clip_disables_clipping() {
        let w = tensor(&[0.0]);
        let g = tensor(&[100.0]);
        let sgd = SgdMomentum::new(1.0); // clip_grad = -1.0
        sgd.step(&w, &g, None).unwrap();
        assert_close(&w.to_f64_vec().unwrap(), &[-100.0]);
    }

    #[test]
    fn test_sgd_momentum_requires_state() {
        let w = tensor(&[1.0]);
        let g = tensor(&[1.0]);
        let sgd = SgdMomentum {
            momentum: 0.9,
            ..SgdMomentum::new(0.1)
        };
        assert!(sgd.step(&w, &g, None).is_err());
    }

    #[test]
    fn test_sgd_rejects_non_float_weight() {
        let o = TensorOptions::<CpuBackend>::new(CpuDevice).dtype(DType::I32);
        let w = Tensor::from_f64_slice(&[1.0], 1usize, &o).unwrap();
        let g = Tensor::from_f64_slice(&[1.0], 1usize, &o).unwrap();
        assert!(SgdMomentum::new(0.1).step(&w, &g, None).is_err());
    }

    #[test]
    fn test_sgd_rejects_aliased_grad() {
        // grad as a view of the weight's own storage must be refused.
        let w = tensor(&[1.0, 2.0]);
        let g = w.reshape(2usize).unwrap();
        assert!(SgdMomentum::new(0.1).step(&w, &g, None).is_err());
    }

    #[test]
    fn test_adam_zero_betas_tracks_raw_gradient() {
        // With beta1 = beta2 = 0: mean' = g, variance' = g^2.
        let w = tensor(&[1.0]);
        let g = tensor(&[0.5]);
        let mean = tensor(&[9.0]);
        let variance = tensor(&[9.0]);
        let adam = Adam {
            beta1: 0.0,
            beta2: 0.0,
            eps: 0.0,
            ..Adam::new(0.1)
        };
        adam.step(&w, &g, &mean, &variance).unwrap();
        assert_close(&mean.to_f64_vec().unwrap(), &[0.5]);
        assert_close(&variance.to_f64_vec().unwrap(), &[0.25]);
        // w' = 1.0 - 0.1 * 0.5 / 0.5 = 0.9
        assert_close(&w.to_f64_vec().unwrap(), &[0.9]);
        assert_close(&g.to_f64_vec().unwrap(), &[0.0]);
    }

    #[test]
    fn test_adam_full_formula() {
        let w = tensor(&[1.0]);
        let g = tensor(&[0.2]);
        let mean = tensor(&[0.1]);
        let variance = tensor(&[0.01]);
        let adam = Adam {
            weight_decay: 0.5,
            ..Adam::new(0.001)
        };
        // g'    = 0.2 + 0.5 * 1.0 = 0.7
        // mean' = 0.1*0.9 + 0.7*0.1 = 0.16
        // var'  = 0.01*0.999 + 0.49*0.001 = 0.01048
        // w'    = 1.0 - 0.001 * 0.16 / (sqrt(0.01048) + 1e-8)
        let expected_mean = 0.16;
        let expected_var: f64 = 0.01 * 0.999 + 0.49 * 0.001;
        let expected_w = 1.0 - 0.001 * expected_mean / (expected_var.sqrt() + 1e-8);
        adam.step(&w, &g, &mean, &variance).unwrap();
        assert_close(&mean.to_f64_vec().unwrap(), &[expected_mean]);
        assert_close(&variance.to_f64_vec().unwrap(), &[expected_var]);
        assert_close(&w.to_f64_vec().unwrap(), &[expected_w]);
    }

    #[test]
    fn test_adam_no_bias_correction() {
        // First step from zeroed moments: mean' = (1-beta1)*g, and the
        // weight moves by lr*mean'/(sqrt(var')+eps) — visibly *not* the
        // bias-corrected textbook step.
        let w = tensor(&[0.0]);
        let g = tensor(&[1.0]);
        let mean = tensor(&[0.0]);
        let variance = tensor(&[0.0]);
        let adam = Adam::new(0.1);
        adam.step(&w, &g, &mean, &variance).unwrap();
        let m = 0.1; // (1 - 0.9) * 1.0
        let v = 0.001; // (1 - 0.999) * 1.0
        let expected = -0.1 * m / (f64::sqrt(v) + 1e-8);
        assert_close(&w.to_f64_vec().unwrap(), &[expected]);
    }

    #[test]
    fn test_step_clears_weight_grad_accumulator() {
        let o = opts().requires_grad(true);
        let w = Tensor::from_f64_slice(&[1.0], 1usize, &o).unwrap();
        w.accumulate_grad(&tensor(&[3.0])).unwrap();
        let g = w.grad().unwrap().contiguous().unwrap();
        // Use an independent copy as the step's gradient; the step must
        // still zero the accumulator attached to the weight.
        let g2 = tensor(&g.to_f64_vec().unwrap());
        SgdMomentum::new(0.1).step(&w, &g2, None).unwrap();
        let acc = w.grad().unwrap().to_f64_vec().unwrap();
        assert_close(&acc, &[0.0]);
    }
}
