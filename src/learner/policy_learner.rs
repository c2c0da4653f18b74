//! PPO update loop over paired batch views.
//!
//! One call to [`PolicyLearner::update_policy`] runs the full schedule:
//! epochs over the data, mini-batches within an epoch, micro-batches within
//! a mini-batch. Both views of the data (original and augmented rollouts)
//! are forwarded per micro-batch, their losses summed, and gradients
//! accumulated in order; each mini-batch ends with exactly one gated
//! optimizer step.

use burn::module::AutodiffModule;
use burn::optim::{GradientsAccumulator, GradientsParams, Optimizer};
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::{ElementConversion, Tensor};
use serde::{Deserialize, Serialize};

use crate::algorithms::{
    agg_loss, compute_policy_loss, kl_penalty, KlPenaltyKind, LossAggMode, PolicyLossConfig,
    PolicyLossConfigError, PolicyLossError,
};
use crate::data::{rearrange_micro_batches, TrainingBatch};
use crate::metrics::MetricsAccumulator;
use crate::model::{PolicyBackbone, SequenceParallel};

use super::forward::{ForwardEngine, ForwardError, StatRequest};
use super::grad::optimizer_step;

/// Invalid [`PPOConfig`] values, caught before any training step.
#[derive(Debug, PartialEq)]
pub enum PPOConfigError {
    ZeroEpochs,
    ZeroMiniBatch,
    ZeroMicroBatch,
    MicroDoesNotDivideMini { micro: usize, mini: usize },
    ZeroTokenBudget,
    InvalidEntropyCoeff(f32),
    InvalidKlLossCoef(f32),
    InvalidGradClip(f32),
    InvalidLearningRate(f64),
    Loss(PolicyLossConfigError),
}

impl std::fmt::Display for PPOConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PPOConfigError::ZeroEpochs => write!(f, "ppo_epochs must be at least 1"),
            PPOConfigError::ZeroMiniBatch => write!(f, "mini_batch_size must be at least 1"),
            PPOConfigError::ZeroMicroBatch => write!(f, "micro_batch_size must be at least 1"),
            PPOConfigError::MicroDoesNotDivideMini { micro, mini } => write!(
                f,
                "micro_batch_size {} must divide mini_batch_size {}",
                micro, mini
            ),
            PPOConfigError::ZeroTokenBudget => {
                write!(f, "max_token_len_per_rank must be at least 1 under dynamic batching")
            }
            PPOConfigError::InvalidEntropyCoeff(value) => {
                write!(f, "entropy_coeff must be finite, got {}", value)
            }
            PPOConfigError::InvalidKlLossCoef(value) => {
                write!(f, "kl_loss_coef must be non-negative, got {}", value)
            }
            PPOConfigError::InvalidGradClip(value) => {
                write!(f, "grad_clip must be finite and positive, got {}", value)
            }
            PPOConfigError::InvalidLearningRate(value) => {
                write!(f, "learning_rate must be finite and positive, got {}", value)
            }
            PPOConfigError::Loss(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for PPOConfigError {}

impl From<PolicyLossConfigError> for PPOConfigError {
    fn from(err: PolicyLossConfigError) -> Self {
        PPOConfigError::Loss(err)
    }
}

/// Everything the update loop needs to know.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PPOConfig {
    /// Passes over the same rollout data.
    pub ppo_epochs: usize,
    /// Sequences per optimizer step.
    pub mini_batch_size: usize,
    /// Sequences per forward/backward when dynamic batching is off.
    pub micro_batch_size: usize,
    /// Split micro-batches by token budget instead of fixed size.
    pub use_dynamic_bsz: bool,
    /// Token budget per micro-batch under dynamic batching.
    pub max_token_len_per_rank: usize,
    /// Symmetric PPO clip width.
    pub clip_ratio: f32,
    /// Asymmetric lower clip width; falls back to `clip_ratio`.
    pub clip_ratio_low: Option<f32>,
    /// Asymmetric upper clip width; falls back to `clip_ratio`.
    pub clip_ratio_high: Option<f32>,
    /// Dual-clip bound for negative advantages.
    pub clip_ratio_c: f32,
    /// Entropy bonus weight; 0 disables the bonus and its forward cost.
    pub entropy_coeff: f32,
    /// Add a KL penalty against the frozen reference policy.
    pub use_kl_loss: bool,
    /// Weight of that penalty.
    pub kl_loss_coef: f32,
    /// Which KL estimator the penalty uses.
    pub kl_penalty_kind: KlPenaltyKind,
    /// Loss aggregation mode shared by all loss terms.
    pub loss_agg_mode: LossAggMode,
    /// Global gradient-norm clip.
    pub grad_clip: f32,
    /// Optimizer learning rate.
    pub learning_rate: f64,
}

impl Default for PPOConfig {
    fn default() -> Self {
        Self {
            ppo_epochs: 1,
            mini_batch_size: 256,
            micro_batch_size: 8,
            use_dynamic_bsz: false,
            max_token_len_per_rank: 0,
            clip_ratio: 0.2,
            clip_ratio_low: None,
            clip_ratio_high: None,
            clip_ratio_c: 3.0,
            entropy_coeff: 0.0,
            use_kl_loss: false,
            kl_loss_coef: 0.001,
            kl_penalty_kind: KlPenaltyKind::LowVarKl,
            loss_agg_mode: LossAggMode::TokenMean,
            grad_clip: 1.0,
            learning_rate: 1e-6,
        }
    }
}

impl PPOConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ppo_epochs(mut self, ppo_epochs: usize) -> Self {
        self.ppo_epochs = ppo_epochs;
        self
    }

    pub fn with_mini_batch_size(mut self, mini_batch_size: usize) -> Self {
        self.mini_batch_size = mini_batch_size;
        self
    }

    pub fn with_micro_batch_size(mut self, micro_batch_size: usize) -> Self {
        self.micro_batch_size = micro_batch_size;
        self
    }

    pub fn with_dynamic_bsz(mut self, max_token_len_per_rank: usize) -> Self {
        self.use_dynamic_bsz = true;
        self.max_token_len_per_rank = max_token_len_per_rank;
        self
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

    pub fn with_entropy_coeff(mut self, entropy_coeff: f32) -> Self {
        self.entropy_coeff = entropy_coeff;
        self
    }

    pub fn with_kl_loss(mut self, kl_loss_coef: f32, kind: KlPenaltyKind) -> Self {
        self.use_kl_loss = true;
        self.kl_loss_coef = kl_loss_coef;
        self.kl_penalty_kind = kind;
        self
    }

    pub fn with_loss_agg_mode(mut self, loss_agg_mode: LossAggMode) -> Self {
        self.loss_agg_mode = loss_agg_mode;
        self
    }

    pub fn with_grad_clip(mut self, grad_clip: f32) -> Self {
        self.grad_clip = grad_clip;
        self
    }

    pub fn with_learning_rate(mut self, learning_rate: f64) -> Self {
        self.learning_rate = learning_rate;
        self
    }

    /// The loss-kernel view of this configuration.
    pub fn loss_config(&self) -> PolicyLossConfig {
        PolicyLossConfig {
            clip_ratio: self.clip_ratio,
            clip_ratio_low: self.clip_ratio_low,
            clip_ratio_high: self.clip_ratio_high,
            clip_ratio_c: self.clip_ratio_c,
            agg_mode: self.loss_agg_mode,
        }
    }

    pub fn validate(&self) -> Result<(), PPOConfigError> {
        if self.ppo_epochs == 0 {
            return Err(PPOConfigError::ZeroEpochs);
        }
        if self.mini_batch_size == 0 {
            return Err(PPOConfigError::ZeroMiniBatch);
        }
        if self.use_dynamic_bsz {
            if self.max_token_len_per_rank == 0 {
                return Err(PPOConfigError::ZeroTokenBudget);
            }
        } else {
            if self.micro_batch_size == 0 {
                return Err(PPOConfigError::ZeroMicroBatch);
            }
            if self.mini_batch_size % self.micro_batch_size != 0 {
                return Err(PPOConfigError::MicroDoesNotDivideMini {
                    micro: self.micro_batch_size,
                    mini: self.mini_batch_size,
                });
            }
        }
        if !self.entropy_coeff.is_finite() {
            return Err(PPOConfigError::InvalidEntropyCoeff(self.entropy_coeff));
        }
        if self.use_kl_loss && (!self.kl_loss_coef.is_finite() || self.kl_loss_coef < 0.0) {
            return Err(PPOConfigError::InvalidKlLossCoef(self.kl_loss_coef));
        }
        if !self.grad_clip.is_finite() || self.grad_clip <= 0.0 {
            return Err(PPOConfigError::InvalidGradClip(self.grad_clip));
        }
        if !self.learning_rate.is_finite() || self.learning_rate <= 0.0 {
            return Err(PPOConfigError::InvalidLearningRate(self.learning_rate));
        }
        self.loss_config().validate()?;
        Ok(())
    }
}

/// Failures during one policy update.
#[derive(Debug)]
pub enum UpdateError {
    Config(PPOConfigError),
    Forward(ForwardError),
    Loss(PolicyLossError),
    /// The two data views split into different batch counts; pairing them
    /// up would silently train on misaligned data.
    ViewMismatch { ori: usize, aug: usize },
    /// The batch lacks a tensor the update needs.
    MissingField(&'static str),
}

impl std::fmt::Display for UpdateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpdateError::Config(err) => write!(f, "{}", err),
            UpdateError::Forward(err) => write!(f, "{}", err),
            UpdateError::Loss(err) => write!(f, "{}", err),
            UpdateError::ViewMismatch { ori, aug } => write!(
                f,
                "data views split into {} and {} batches; counts must match",
                ori, aug
            ),
            UpdateError::MissingField(field) => {
                write!(f, "batch is missing required tensor `{}`", field)
            }
        }
    }
}

impl std::error::Error for UpdateError {}

impl From<PPOConfigError> for UpdateError {
    fn from(err: PPOConfigError) -> Self {
        UpdateError::Config(err)
    }
}

impl From<ForwardError> for UpdateError {
    fn from(err: ForwardError) -> Self {
        UpdateError::Forward(err)
    }
}

impl From<PolicyLossError> for UpdateError {
    fn from(err: PolicyLossError) -> Self {
        UpdateError::Loss(err)
    }
}

fn scalar<B: Backend>(value: &Tensor<B, 1>) -> f32 {
    value.clone().into_scalar().elem::<f32>()
}

/// Owns the training schedule for one worker's policy.
pub struct PolicyLearner<SP: SequenceParallel> {
    config: PPOConfig,
    engine: ForwardEngine<SP>,
    rank: usize,
}

impl<SP: SequenceParallel> PolicyLearner<SP> {
    pub fn new(
        config: PPOConfig,
        engine: ForwardEngine<SP>,
        rank: usize,
    ) -> Result<Self, PPOConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            engine,
            rank,
        })
    }

    pub fn config(&self) -> &PPOConfig {
        &self.config
    }

    pub fn engine(&self) -> &ForwardEngine<SP> {
        &self.engine
    }

    /// Run the full PPO schedule over both views of one rollout batch.
    ///
    /// Returns the updated model and the per-micro-batch metrics collected
    /// along the way; the metrics accumulator is consumed by the caller, no
    /// state survives the call.
    pub fn update_policy<B, M, O>(
        &self,
        mut model: M,
        optimizer: &mut O,
        data_ori: &TrainingBatch<B>,
        data_aug: &TrainingBatch<B>,
    ) -> Result<(M, MetricsAccumulator), UpdateError>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B> + PolicyBackbone<B>,
        O: Optimizer<M, B>,
    {
        let mut metrics = MetricsAccumulator::new();

        for _epoch in 0..self.config.ppo_epochs {
            let minis_ori = data_ori.split(self.config.mini_batch_size);
            let minis_aug = data_aug.split(self.config.mini_batch_size);
            if minis_ori.len() != minis_aug.len() {
                return Err(UpdateError::ViewMismatch {
                    ori: minis_ori.len(),
                    aug: minis_aug.len(),
                });
            }

            for (mini_ori, mini_aug) in minis_ori.iter().zip(&minis_aug) {
                model = self.update_mini_batch(model, optimizer, mini_ori, mini_aug, &mut metrics)?;
            }
        }

        Ok((model, metrics))
    }

    fn micro_batches<B: Backend>(
        &self,
        mini: &TrainingBatch<B>,
    ) -> Result<Vec<TrainingBatch<B>>, UpdateError> {
        if self.config.use_dynamic_bsz {
            let (micros, _) = rearrange_micro_batches(mini, self.config.max_token_len_per_rank)
                .map_err(ForwardError::DynamicBatch)?;
            Ok(micros)
        } else {
            Ok(mini.split(self.config.micro_batch_size))
        }
    }

    fn update_mini_batch<B, M, O>(
        &self,
        mut model: M,
        optimizer: &mut O,
        mini_ori: &TrainingBatch<B>,
        mini_aug: &TrainingBatch<B>,
        metrics: &mut MetricsAccumulator,
    ) -> Result<M, UpdateError>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B> + PolicyBackbone<B>,
        O: Optimizer<M, B>,
    {
        let micros_ori = self.micro_batches(mini_ori)?;
        let micros_aug = self.micro_batches(mini_aug)?;
        if micros_ori.len() != micros_aug.len() {
            return Err(UpdateError::ViewMismatch {
                ori: micros_ori.len(),
                aug: micros_aug.len(),
            });
        }

        let grad_accum = micros_ori.len();
        let mut accumulator = GradientsAccumulator::new();

        for (micro_ori, micro_aug) in micros_ori.iter().zip(&micros_aug) {
            let (loss_ori, pg_ori) = self.micro_loss(&model, micro_ori, metrics, "ori")?;
            let (loss_aug, pg_aug) = self.micro_loss(&model, micro_aug, metrics, "aug")?;
            metrics.push("actor/pg_loss", pg_ori + pg_aug);

            // One accumulation factor for the pair. Under dynamic batching the
            // two views may bin rows differently; the original view's row
            // share decides the weight for both.
            let scale = if self.config.use_dynamic_bsz {
                micro_ori.batch_size() as f32 / mini_ori.batch_size() as f32
            } else {
                1.0 / grad_accum as f32
            };
            let grads = (loss_ori + loss_aug).mul_scalar(scale).backward();
            let grads = GradientsParams::from_grads(grads, &model);
            accumulator.accumulate(&model, grads);
        }

        let grads = accumulator.grads();
        let (updated, norm) = optimizer_step(
            self.rank,
            self.config.learning_rate,
            optimizer,
            model,
            grads,
            self.config.grad_clip,
        );
        model = updated;
        metrics.push("actor/grad_norm", norm);

        Ok(model)
    }

    /// Unscaled loss for one micro-batch of one view; the caller applies the
    /// shared gradient-accumulation factor to the summed pair.
    fn micro_loss<B, M>(
        &self,
        model: &M,
        micro: &TrainingBatch<B>,
        metrics: &mut MetricsAccumulator,
        view: &str,
    ) -> Result<(Tensor<B, 1>, f32), UpdateError>
    where
        B: AutodiffBackend,
        M: PolicyBackbone<B>,
    {
        let old_log_probs = micro
            .old_log_probs
            .clone()
            .ok_or(UpdateError::MissingField("old_log_probs"))?;
        let advantages = micro
            .advantages
            .clone()
            .ok_or(UpdateError::MissingField("advantages"))?;

        let stats = if self.config.entropy_coeff != 0.0 {
            StatRequest::none().with_entropy()
        } else {
            StatRequest::none()
        };
        let out = self.engine.forward_micro_batch(model, micro, &stats)?;
        let mask = micro.response_mask();

        let loss_out = compute_policy_loss(
            old_log_probs,
            out.log_probs.clone(),
            advantages,
            mask.clone(),
            &self.config.loss_config(),
        );
        let pg_scalar = scalar(&loss_out.pg_loss);
        let mut loss = loss_out.pg_loss;

        if let Some(entropy) = out.entropy {
            let entropy_loss = agg_loss(entropy, mask.clone(), self.config.loss_agg_mode);
            metrics.push(&format!("actor/entropy_loss_{}", view), scalar(&entropy_loss));
            loss = loss - entropy_loss.mul_scalar(self.config.entropy_coeff);
        }

        if self.config.use_kl_loss {
            let ref_log_probs = micro
                .ref_log_probs
                .clone()
                .ok_or(UpdateError::MissingField("ref_log_probs"))?;
            let kld = kl_penalty(out.log_probs, ref_log_probs, self.config.kl_penalty_kind)?;
            let kl_loss = agg_loss(kld, mask, self.config.loss_agg_mode);
            metrics.push(&format!("actor/kl_loss_{}", view), scalar(&kl_loss));
            metrics.push("actor/kl_coef", self.config.kl_loss_coef);
            loss = loss + kl_loss.mul_scalar(self.config.kl_loss_coef);
        }

        metrics.push(&format!("actor/pg_loss_{}", view), pg_scalar);
        metrics.push(&format!("actor/pg_clipfrac_{}", view), loss_out.pg_clipfrac);
        metrics.push(&format!("actor/ppo_kl_{}", view), loss_out.ppo_kl);
        metrics.push(
            &format!("actor/pg_clipfrac_lower_{}", view),
            loss_out.pg_clipfrac_lower,
        );

        Ok((loss, pg_scalar))
    }
}
