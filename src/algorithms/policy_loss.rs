//! Dual-clip PPO policy loss and KL penalties.
//!
//! Losses are computed token-wise over the response window and reduced under
//! a configurable aggregation mode. The dual-clip variant adds a third bound
//! `clip_ratio_c` that caps how much a negative-advantage token can gain
//! from a wildly off-policy ratio.

use burn::tensor::backend::Backend;
use burn::tensor::{ElementConversion, Tensor};
use serde::{Deserialize, Serialize};

/// How a `[batch, response_len]` loss matrix collapses to a scalar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LossAggMode {
    /// Mean over all unmasked tokens; long sequences weigh more.
    TokenMean,
    /// Per-sequence token sum, then mean over sequences.
    SeqMean,
    /// Per-sequence token mean, then mean over sequences; every sequence
    /// weighs the same regardless of length.
    SeqMeanTokenMean,
}

/// Token-level KL penalty variants between the policy and a frozen reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KlPenaltyKind {
    /// Plain `log_prob - ref_log_prob`.
    Kl,
    /// Absolute difference.
    Abs,
    /// Half squared difference.
    Mse,
    /// Low-variance estimator `exp(kl) - kl - 1`, clamped.
    LowVarKl,
    /// Full-distribution KL; needs the whole vocab distribution, which the
    /// per-token interface does not carry.
    Full,
}

/// Failures inside the loss kernels.
#[derive(Debug, PartialEq)]
pub enum PolicyLossError {
    UnsupportedKlPenalty(KlPenaltyKind),
}

impl std::fmt::Display for PolicyLossError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PolicyLossError::UnsupportedKlPenalty(kind) => {
                write!(f, "KL penalty {:?} is not supported", kind)
            }
        }
    }
}

impl std::error::Error for PolicyLossError {}

/// Invalid [`PolicyLossConfig`] values.
#[derive(Debug, PartialEq)]
pub enum PolicyLossConfigError {
    /// Clip ratios must be positive.
    InvalidClipRatio(f32),
    /// The dual-clip bound must exceed 1.0 or it clips everything.
    InvalidClipRatioC(f32),
}

impl std::fmt::Display for PolicyLossConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PolicyLossConfigError::InvalidClipRatio(value) => {
                write!(f, "clip ratio must be positive, got {}", value)
            }
            PolicyLossConfigError::InvalidClipRatioC(value) => {
                write!(f, "dual-clip bound must be greater than 1.0, got {}", value)
            }
        }
    }
}

impl std::error::Error for PolicyLossConfigError {}

/// Clipping bounds and aggregation for [`compute_policy_loss`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyLossConfig {
    /// Symmetric clip width; the fallback when the asymmetric bounds are unset.
    pub clip_ratio: f32,
    /// Lower clip width, `1 - low`.
    pub clip_ratio_low: Option<f32>,
    /// Upper clip width, `1 + high`.
    pub clip_ratio_high: Option<f32>,
    /// Dual-clip bound for negative advantages.
    pub clip_ratio_c: f32,
    /// Loss aggregation mode.
    pub agg_mode: LossAggMode,
}

impl Default for PolicyLossConfig {
    fn default() -> Self {
        Self {
            clip_ratio: 0.2,
            clip_ratio_low: None,
            clip_ratio_high: None,
            clip_ratio_c: 3.0,
            agg_mode: LossAggMode::TokenMean,
        }
    }
}

impl PolicyLossConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_clip_ratio(mut self, clip_ratio: f32) -> Self {
        self.clip_ratio = clip_ratio;
        self
    }

    pub fn with_clip_ratio_low(mut self, low: f32) -> Self {
        self.clip_ratio_low = Some(low);
        self
    }

    pub fn with_clip_ratio_high(mut self, high: f32) -> Self {
        self.clip_ratio_high = Some(high);
        self
    }

    pub fn with_clip_ratio_c(mut self, clip_ratio_c: f32) -> Self {
        self.clip_ratio_c = clip_ratio_c;
        self
    }

    pub fn with_agg_mode(mut self, agg_mode: LossAggMode) -> Self {
        self.agg_mode = agg_mode;
        self
    }

    /// The effective `(low, high)` clip widths.
    pub fn bounds(&self) -> (f32, f32) {
        (
            self.clip_ratio_low.unwrap_or(self.clip_ratio),
            self.clip_ratio_high.unwrap_or(self.clip_ratio),
        )
    }

    pub fn validate(&self) -> Result<(), PolicyLossConfigError> {
        let (low, high) = self.bounds();
        if self.clip_ratio <= 0.0 || low <= 0.0 || high <= 0.0 {
            return Err(PolicyLossConfigError::InvalidClipRatio(
                self.clip_ratio.min(low).min(high),
            ));
        }
        if self.clip_ratio_c <= 1.0 {
            return Err(PolicyLossConfigError::InvalidClipRatioC(self.clip_ratio_c));
        }
        Ok(())
    }
}

/// Loss scalar plus detached diagnostics.
#[derive(Debug)]
pub struct PolicyLossOutput<B: Backend> {
    /// Aggregated policy-gradient loss, still attached to the graph.
    pub pg_loss: Tensor<B, 1>,
    /// Fraction of tokens hitting the clip band.
    pub pg_clipfrac: f32,
    /// Masked mean of `old_log_prob - log_prob`.
    pub ppo_kl: f32,
    /// Fraction of negative-advantage tokens hitting the dual-clip bound.
    pub pg_clipfrac_lower: f32,
}

/// Mean of `values` over unmasked positions.
pub fn masked_mean<B: Backend>(values: Tensor<B, 2>, mask: Tensor<B, 2>) -> Tensor<B, 1> {
    (values * mask.clone()).sum() / mask.sum()
}

/// Collapse a token-level loss matrix under `mode`.
pub fn agg_loss<B: Backend>(
    loss_mat: Tensor<B, 2>,
    mask: Tensor<B, 2>,
    mode: LossAggMode,
) -> Tensor<B, 1> {
    let batch = loss_mat.dims()[0];
    match mode {
        LossAggMode::TokenMean => masked_mean(loss_mat, mask),
        LossAggMode::SeqMean => (loss_mat * mask).sum_dim(1).reshape([batch]).mean(),
        LossAggMode::SeqMeanTokenMean => {
            let sums = (loss_mat * mask.clone()).sum_dim(1).reshape([batch]);
            let counts = mask.sum_dim(1).reshape([batch]);
            (sums / counts).mean()
        }
    }
}

/// Dual-clip PPO loss over one micro-batch.
///
/// `ratio = exp(log_prob - old_log_prob)` with the exponent clamped to
/// `[-20, 20]` so a single corrupt token cannot produce an infinite ratio.
/// Positive advantages use the standard clip band; negative advantages are
/// additionally bounded by `clip_ratio_c` so the loss cannot be dominated by
/// rewarding a collapse of already-unlikely tokens.
pub fn compute_policy_loss<B: Backend>(
    old_log_prob: Tensor<B, 2>,
    log_prob: Tensor<B, 2>,
    advantages: Tensor<B, 2>,
    response_mask: Tensor<B, 2>,
    config: &PolicyLossConfig,
) -> PolicyLossOutput<B> {
    let (low, high) = config.bounds();

    let negative_approx_kl = (log_prob - old_log_prob).clamp(-20.0, 20.0);
    let ratio = negative_approx_kl.clone().exp();
    let ppo_kl = masked_mean(negative_approx_kl.neg(), response_mask.clone())
        .into_scalar()
        .elem::<f32>();

    let losses_unclipped = advantages.clone().neg() * ratio.clone();
    let losses_clipped = advantages.clone().neg() * ratio.clamp(1.0 - low, 1.0 + high);

    let clipped_hit = losses_clipped
        .clone()
        .greater(losses_unclipped.clone())
        .float();
    let pg_clipfrac = masked_mean(clipped_hit, response_mask.clone())
        .into_scalar()
        .elem::<f32>();

    let losses_band = losses_unclipped.max_pair(losses_clipped);

    // Third bound, active only where the advantage is negative.
    let losses_dual = advantages.clone().neg().mul_scalar(config.clip_ratio_c);
    let advantage_negative = advantages.lower_elem(0.0);
    let dual_hit = losses_band.clone().greater(losses_dual.clone()).float()
        * advantage_negative.clone().float();
    let pg_clipfrac_lower = masked_mean(dual_hit, response_mask.clone())
        .into_scalar()
        .elem::<f32>();

    let losses_bounded = losses_band.clone().min_pair(losses_dual);
    let losses = losses_band.mask_where(advantage_negative, losses_bounded);

    PolicyLossOutput {
        pg_loss: agg_loss(losses, response_mask, config.agg_mode),
        pg_clipfrac,
        ppo_kl,
        pg_clipfrac_lower,
    }
}

/// Token-level KL penalty between the policy and a frozen reference.
pub fn kl_penalty<B: Backend>(
    log_prob: Tensor<B, 2>,
    ref_log_prob: Tensor<B, 2>,
    kind: KlPenaltyKind,
) -> Result<Tensor<B, 2>, PolicyLossError> {
    match kind {
        KlPenaltyKind::Kl => Ok(log_prob - ref_log_prob),
        KlPenaltyKind::Abs => Ok((log_prob - ref_log_prob).abs()),
        KlPenaltyKind::Mse => Ok((log_prob - ref_log_prob).powf_scalar(2.0).mul_scalar(0.5)),
        KlPenaltyKind::LowVarKl => {
            let kl = (ref_log_prob - log_prob).clamp(-20.0, 20.0);
            let kld = (kl.clone().exp() - kl).sub_scalar(1.0);
            Ok(kld.clamp(-10.0, 10.0))
        }
        KlPenaltyKind::Full => Err(PolicyLossError::UnsupportedKlPenalty(kind)),
    }
}
