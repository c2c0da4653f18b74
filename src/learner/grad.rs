//! Gradient-norm gate in front of the optimizer.
//!
//! Accumulated gradients pass through two checks before a step: clipping to
//! a global L2 norm, and a finiteness gate. A non-finite norm means some
//! micro-batch produced NaN or infinite gradients; applying that step would
//! poison every parameter at once, so the step is skipped and the gradients
//! are dropped.

use std::marker::PhantomData;

use burn::module::{AutodiffModule, ModuleMapper, ParamId};
use burn::optim::{GradientsParams, Optimizer};
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::{ElementConversion, Tensor};

struct SquaredGradNorm<'a, B: AutodiffBackend> {
    grads: &'a GradientsParams,
    sum_squares: f32,
    _backend: PhantomData<B>,
}

impl<'a, B: AutodiffBackend> ModuleMapper<B> for SquaredGradNorm<'a, B> {
    fn map_float<const D: usize>(&mut self, id: ParamId, tensor: Tensor<B, D>) -> Tensor<B, D> {
        if let Some(grad) = self.grads.get::<B::InnerBackend, D>(id) {
            self.sum_squares += grad.powf_scalar(2.0).sum().into_scalar().elem::<f32>();
        }
        tensor
    }
}

struct ScaleGrads<'a, B: AutodiffBackend> {
    grads: &'a GradientsParams,
    factor: f32,
    scaled: GradientsParams,
    _backend: PhantomData<B>,
}

impl<'a, B: AutodiffBackend> ModuleMapper<B> for ScaleGrads<'a, B> {
    fn map_float<const D: usize>(&mut self, id: ParamId, tensor: Tensor<B, D>) -> Tensor<B, D> {
        if let Some(grad) = self.grads.get::<B::InnerBackend, D>(id) {
            self.scaled
                .register::<B::InnerBackend, D>(id, grad.mul_scalar(self.factor));
        }
        tensor
    }
}

/// Global L2 norm of `grads` over every float parameter of `model`.
///
/// Traversal consumes and returns the module unchanged, so the model is
/// passed through by value.
pub fn grad_l2_norm<B, M>(model: M, grads: &GradientsParams) -> (M, f32)
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
{
    let mut visitor = SquaredGradNorm {
        grads,
        sum_squares: 0.0,
        _backend: PhantomData,
    };
    let model = model.map(&mut visitor);
    (model, visitor.sum_squares.sqrt())
}

/// Scale `grads` down to a global norm of `max_norm` when exceeded.
///
/// Returns the (possibly rescaled) gradients and the pre-clip norm. A
/// non-finite norm is passed through untouched for the caller to gate on.
pub fn clip_grads<B, M>(
    model: M,
    grads: GradientsParams,
    max_norm: f32,
) -> (M, GradientsParams, f32)
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
{
    let (model, norm) = grad_l2_norm(model, &grads);
    if !norm.is_finite() || norm <= max_norm {
        return (model, grads, norm);
    }

    let mut mapper = ScaleGrads {
        grads: &grads,
        factor: max_norm / (norm + 1e-6),
        scaled: GradientsParams::new(),
        _backend: PhantomData,
    };
    let model = model.map(&mut mapper);
    (model, mapper.scaled, norm)
}

/// One gated optimizer step.
///
/// Clips to `grad_clip`, then steps. A non-finite norm skips the step
/// entirely: the gradients are dropped, a warning names the rank, and the
/// model comes back unchanged so training continues from the last good
/// parameters.
pub fn optimizer_step<B, M, O>(
    rank: usize,
    learning_rate: f64,
    optimizer: &mut O,
    model: M,
    grads: GradientsParams,
    grad_clip: f32,
) -> (M, f32)
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
    O: Optimizer<M, B>,
{
    let (model, grads, norm) = clip_grads(model, grads, grad_clip);
    if !norm.is_finite() {
        log::warn!(
            "rank {}: gradient norm is {}; dropping gradients and skipping the optimizer step",
            rank,
            norm
        );
        return (model, norm);
    }
    (optimizer.step(learning_rate, model, grads), norm)
}
