//! Micro-batch forward engine.
//!
//! One entry point, four execution paths: padded or packed, single-rank or
//! sequence-parallel. Every path honors the same contract: logits are divided
//! by the sampling temperature before any statistic, positions are shifted by
//! one (the logit at position `t` scores token `t + 1`), and outputs cover
//! only the response suffix, `[batch, response_len]`.

use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor};

use crate::data::{rearrange_micro_batches, reverse_index, DynamicBatchError, TrainingBatch};
use crate::model::{PolicyBackbone, SequenceParallel};

use super::logits::{
    entropy_from_logits, log_probs_from_logits, self_certainty_from_logits, sequence_mean,
};
use super::padding::PackIndex;
use super::sequence_parallel::{pad_to_multiple, slice_for_rank, strip_padding};

/// Path selection for the engine.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct ForwardConfig {
    /// Flatten live tokens into one pad-free stream before the backbone.
    pub use_remove_padding: bool,
    /// Ask the backbone for fused log-prob/entropy kernels.
    pub use_fused_kernels: bool,
}

impl Default for ForwardConfig {
    fn default() -> Self {
        Self {
            use_remove_padding: true,
            use_fused_kernels: false,
        }
    }
}

impl ForwardConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_remove_padding(mut self, enabled: bool) -> Self {
        self.use_remove_padding = enabled;
        self
    }

    pub fn with_fused_kernels(mut self, enabled: bool) -> Self {
        self.use_fused_kernels = enabled;
        self
    }
}

/// Which optional statistics a forward pass should produce.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatRequest {
    pub entropy: bool,
    pub self_certainty: bool,
    pub sentence_certainty: bool,
    pub sentence_entropy: bool,
    pub sentence_avg_prob: bool,
}

impl StatRequest {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_entropy(mut self) -> Self {
        self.entropy = true;
        self
    }

    pub fn with_self_certainty(mut self) -> Self {
        self.self_certainty = true;
        self
    }

    pub fn with_sentence_certainty(mut self) -> Self {
        self.sentence_certainty = true;
        self
    }

    pub fn with_sentence_entropy(mut self) -> Self {
        self.sentence_entropy = true;
        self
    }

    pub fn with_sentence_avg_prob(mut self) -> Self {
        self.sentence_avg_prob = true;
        self
    }

    fn wants_sentence(&self) -> bool {
        self.sentence_certainty || self.sentence_entropy || self.sentence_avg_prob
    }

    fn needs_entropy(&self) -> bool {
        self.entropy || self.sentence_entropy
    }

    fn needs_self_certainty(&self) -> bool {
        self.self_certainty || self.sentence_certainty
    }
}

/// Everything one forward pass can return. Only the log-probs are
/// unconditional; each statistic is present iff it was requested.
#[derive(Debug)]
pub struct ForwardOutput<B: Backend> {
    /// `[batch, response_len]`.
    pub log_probs: Tensor<B, 2>,
    /// `[batch, response_len]`.
    pub entropy: Option<Tensor<B, 2>>,
    /// `[batch, response_len]`.
    pub self_certainty: Option<Tensor<B, 2>>,
    /// `[batch]`.
    pub sentence_certainty: Option<Tensor<B, 1>>,
    /// `[batch]`.
    pub sentence_entropy: Option<Tensor<B, 1>>,
    /// `[batch]`.
    pub sentence_avg_prob: Option<Tensor<B, 1>>,
}

/// Rejected or failed forward passes.
#[derive(Debug, PartialEq)]
pub enum ForwardError {
    /// The batch carries no sampling temperature.
    MissingTemperature,
    /// Zero, negative, or non-finite temperature.
    InvalidTemperature { value: f32 },
    /// Sequence parallelism shards the packed stream; without padding
    /// removal there is no stream to shard.
    SequenceParallelNeedsPacking { sp_size: usize },
    /// The statistic cannot be produced under the configured path.
    UnsupportedStats { stat: &'static str },
    /// Token-budget packing or reordering failed.
    DynamicBatch(DynamicBatchError),
}

impl std::fmt::Display for ForwardError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ForwardError::MissingTemperature => {
                write!(f, "batch has no sampling temperature")
            }
            ForwardError::InvalidTemperature { value } => {
                write!(f, "sampling temperature must be finite and positive, got {}", value)
            }
            ForwardError::SequenceParallelNeedsPacking { sp_size } => {
                write!(
                    f,
                    "sequence parallel size {} requires padding removal",
                    sp_size
                )
            }
            ForwardError::UnsupportedStats { stat } => {
                write!(f, "statistic `{}` is unavailable with fused kernels", stat)
            }
            ForwardError::DynamicBatch(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for ForwardError {}

impl From<DynamicBatchError> for ForwardError {
    fn from(err: DynamicBatchError) -> Self {
        ForwardError::DynamicBatch(err)
    }
}

/// Drives a [`PolicyBackbone`] over micro-batches.
#[derive(Debug, Clone)]
pub struct ForwardEngine<SP: SequenceParallel> {
    config: ForwardConfig,
    group: SP,
}

impl<SP: SequenceParallel> ForwardEngine<SP> {
    pub fn new(config: ForwardConfig, group: SP) -> Self {
        Self { config, group }
    }

    pub fn config(&self) -> &ForwardConfig {
        &self.config
    }

    /// One forward pass over one micro-batch.
    pub fn forward_micro_batch<B: Backend, M: PolicyBackbone<B>>(
        &self,
        model: &M,
        batch: &TrainingBatch<B>,
        stats: &StatRequest,
    ) -> Result<ForwardOutput<B>, ForwardError> {
        let temperature = match batch.meta.temperature {
            None => return Err(ForwardError::MissingTemperature),
            Some(value) if !value.is_finite() || value <= 0.0 => {
                return Err(ForwardError::InvalidTemperature { value })
            }
            Some(value) => value,
        };

        if self.group.size() > 1 && !self.config.use_remove_padding {
            return Err(ForwardError::SequenceParallelNeedsPacking {
                sp_size: self.group.size(),
            });
        }

        if self.config.use_fused_kernels {
            if stats.needs_self_certainty() {
                return Err(ForwardError::UnsupportedStats {
                    stat: "self_certainty",
                });
            }
            if stats.wants_sentence() {
                return Err(ForwardError::UnsupportedStats {
                    stat: "sentence_level",
                });
            }
        }

        let (log_probs, entropy, self_certainty) = if self.config.use_remove_padding {
            self.packed_pass(model, batch, temperature, stats)
        } else {
            if self.config.use_fused_kernels {
                log::warn!(
                    "fused kernels requested but the padded path materializes logits; ignoring"
                );
            }
            padded_pass(model, batch, temperature, stats)
        };

        Ok(assemble(batch, log_probs, entropy, self_certainty, stats))
    }

    /// Eval-mode batched driver: micro-batch, forward, reassemble.
    ///
    /// Under dynamic batching the micro-batches come back permuted; the
    /// reverse index restores the caller's row order, and a partial cover is
    /// fatal rather than silently misaligned.
    pub fn compute_log_prob<B: Backend, M: PolicyBackbone<B>>(
        &self,
        model: &M,
        batch: &TrainingBatch<B>,
        stats: &StatRequest,
    ) -> Result<ForwardOutput<B>, ForwardError> {
        let (micro_batches, order) = if batch.meta.use_dynamic_bsz {
            let (micro_batches, bins) =
                rearrange_micro_batches(batch, batch.meta.max_token_len)?;
            (micro_batches, Some(bins.concat()))
        } else {
            (batch.split(batch.meta.micro_batch_size), None)
        };

        let mut outputs = Vec::with_capacity(micro_batches.len());
        for micro_batch in &micro_batches {
            outputs.push(self.forward_micro_batch(model, micro_batch, stats)?);
        }
        let mut output = cat_outputs(outputs);

        if let Some(order) = order {
            let reverse = reverse_index(&order, batch.batch_size())?;
            output = reorder_rows(output, &reverse);
        }
        Ok(output)
    }

    fn packed_pass<B: Backend, M: PolicyBackbone<B>>(
        &self,
        model: &M,
        batch: &TrainingBatch<B>,
        temperature: f32,
        stats: &StatRequest,
    ) -> (Tensor<B, 2>, Option<Tensor<B, 2>>, Option<Tensor<B, 2>>) {
        let pack = PackIndex::from_mask(&batch.attention_mask);
        let size = self.group.size();
        let rank = self.group.rank();

        let ids = pack.pack(batch.input_ids.clone());
        let positions = pack.pack(batch.position_ids.clone());
        // The logit at stream position t scores the token at t + 1.
        let labels = roll_left(ids.clone());

        let (ids, pad) = pad_to_multiple(ids, size);
        let (positions, _) = pad_to_multiple(positions, size);
        let (labels, _) = pad_to_multiple(labels, size);
        let ids = slice_for_rank(ids, size, rank);
        let positions = slice_for_rank(positions, size, rank);
        let labels = slice_for_rank(labels, size, rank);

        let (log_probs, entropy, self_certainty) = if self.config.use_fused_kernels {
            match model.forward_fused(ids.clone(), positions.clone(), labels.clone(), temperature)
            {
                Some(fused) => {
                    let entropy = stats.needs_entropy().then_some(fused.entropy);
                    (fused.log_probs, entropy, None)
                }
                None => {
                    log::warn!(
                        "fused kernels requested but the backbone has none; using packed logits"
                    );
                    packed_logits_stats(model, ids, positions, labels, temperature, stats)
                }
            }
        } else {
            packed_logits_stats(model, ids, positions, labels, temperature, stats)
        };

        let window = |local: Tensor<B, 1>| {
            let gathered = strip_padding(self.group.all_gather(local), pad);
            response_window(pack.unpad(gathered), batch)
        };

        (
            window(log_probs),
            entropy.map(&window),
            self_certainty.map(&window),
        )
    }
}

/// Per-token statistics from materialized packed logits.
fn packed_logits_stats<B: Backend, M: PolicyBackbone<B>>(
    model: &M,
    ids: Tensor<B, 1, Int>,
    positions: Tensor<B, 1, Int>,
    labels: Tensor<B, 1, Int>,
    temperature: f32,
    stats: &StatRequest,
) -> (Tensor<B, 1>, Option<Tensor<B, 1>>, Option<Tensor<B, 1>>) {
    let logits = model.forward_packed(ids, positions).div_scalar(temperature);
    let log_probs = log_probs_from_logits(logits.clone(), labels);
    let entropy = stats
        .needs_entropy()
        .then(|| entropy_from_logits(logits.clone()));
    let self_certainty = stats
        .needs_self_certainty()
        .then(|| self_certainty_from_logits(logits));
    (log_probs, entropy, self_certainty)
}

fn padded_pass<B: Backend, M: PolicyBackbone<B>>(
    model: &M,
    batch: &TrainingBatch<B>,
    temperature: f32,
    stats: &StatRequest,
) -> (Tensor<B, 2>, Option<Tensor<B, 2>>, Option<Tensor<B, 2>>) {
    let batch_size = batch.batch_size();
    let seq_len = batch.seq_len();
    let response_len = batch.response_len();
    let vocab = model.vocab_size();

    let logits = model
        .forward(
            batch.input_ids.clone(),
            batch.attention_mask.clone(),
            batch.position_ids.clone(),
        )
        .div_scalar(temperature);
    // Logits one position before each response token score that token.
    let window = logits
        .slice([
            0..batch_size,
            seq_len - response_len - 1..seq_len - 1,
            0..vocab,
        ])
        .reshape([batch_size * response_len, vocab]);

    let labels = batch.responses.clone().reshape([batch_size * response_len]);
    let log_probs =
        log_probs_from_logits(window.clone(), labels).reshape([batch_size, response_len]);
    let entropy = stats
        .needs_entropy()
        .then(|| entropy_from_logits(window.clone()).reshape([batch_size, response_len]));
    let self_certainty = stats
        .needs_self_certainty()
        .then(|| self_certainty_from_logits(window).reshape([batch_size, response_len]));

    (log_probs, entropy, self_certainty)
}

/// Shift a packed stream left by one so position `t` holds the token it
/// should predict. The wrap-around at the stream end scores a position that
/// is always masked out downstream.
fn roll_left<B: Backend>(tensor: Tensor<B, 1, Int>) -> Tensor<B, 1, Int> {
    let len = tensor.dims()[0];
    if len <= 1 {
        return tensor;
    }
    Tensor::cat(
        vec![tensor.clone().slice([1..len]), tensor.slice([0..1])],
        0,
    )
}

/// Slice the response-scoring window out of per-position `[batch, seq]`
/// values.
fn response_window<B: Backend>(values: Tensor<B, 2>, batch: &TrainingBatch<B>) -> Tensor<B, 2> {
    let seq_len = batch.seq_len();
    let response_len = batch.response_len();
    values.slice([
        0..batch.batch_size(),
        seq_len - response_len - 1..seq_len - 1,
    ])
}

fn assemble<B: Backend>(
    batch: &TrainingBatch<B>,
    log_probs: Tensor<B, 2>,
    entropy: Option<Tensor<B, 2>>,
    self_certainty: Option<Tensor<B, 2>>,
    stats: &StatRequest,
) -> ForwardOutput<B> {
    let mask = batch.response_mask();

    let sentence_certainty = match (&self_certainty, stats.sentence_certainty) {
        (Some(values), true) => Some(sequence_mean(values.clone(), mask.clone())),
        _ => None,
    };
    let sentence_entropy = match (&entropy, stats.sentence_entropy) {
        (Some(values), true) => Some(sequence_mean(values.clone(), mask.clone())),
        _ => None,
    };
    let sentence_avg_prob = stats
        .sentence_avg_prob
        .then(|| sequence_mean(log_probs.clone().exp(), mask));

    ForwardOutput {
        log_probs,
        entropy: stats.entropy.then_some(()).and(entropy),
        self_certainty: stats.self_certainty.then_some(()).and(self_certainty),
        sentence_certainty,
        sentence_entropy,
        sentence_avg_prob,
    }
}

fn cat_optional<B: Backend, const D: usize>(
    parts: Vec<Option<Tensor<B, D>>>,
) -> Option<Tensor<B, D>> {
    let collected: Option<Vec<_>> = parts.into_iter().collect();
    collected.map(|tensors| Tensor::cat(tensors, 0))
}

fn cat_outputs<B: Backend>(outputs: Vec<ForwardOutput<B>>) -> ForwardOutput<B> {
    let mut log_probs = Vec::with_capacity(outputs.len());
    let mut entropy = Vec::with_capacity(outputs.len());
    let mut self_certainty = Vec::with_capacity(outputs.len());
    let mut sentence_certainty = Vec::with_capacity(outputs.len());
    let mut sentence_entropy = Vec::with_capacity(outputs.len());
    let mut sentence_avg_prob = Vec::with_capacity(outputs.len());

    for output in outputs {
        log_probs.push(output.log_probs);
        entropy.push(output.entropy);
        self_certainty.push(output.self_certainty);
        sentence_certainty.push(output.sentence_certainty);
        sentence_entropy.push(output.sentence_entropy);
        sentence_avg_prob.push(output.sentence_avg_prob);
    }

    ForwardOutput {
        log_probs: Tensor::cat(log_probs, 0),
        entropy: cat_optional(entropy),
        self_certainty: cat_optional(self_certainty),
        sentence_certainty: cat_optional(sentence_certainty),
        sentence_entropy: cat_optional(sentence_entropy),
        sentence_avg_prob: cat_optional(sentence_avg_prob),
    }
}

fn reorder_rows<B: Backend>(output: ForwardOutput<B>, reverse: &[usize]) -> ForwardOutput<B> {
    let device = output.log_probs.device();
    let indices: Vec<i32> = reverse.iter().map(|&p| p as i32).collect();
    let index = Tensor::<B, 1, Int>::from_ints(indices.as_slice(), &device);

    ForwardOutput {
        log_probs: output.log_probs.select(0, index.clone()),
        entropy: output.entropy.map(|t| t.select(0, index.clone())),
        self_certainty: output.self_certainty.map(|t| t.select(0, index.clone())),
        sentence_certainty: output
            .sentence_certainty
            .map(|t| t.select(0, index.clone())),
        sentence_entropy: output.sentence_entropy.map(|t| t.select(0, index.clone())),
        sentence_avg_prob: output.sentence_avg_prob.map(|t| t.select(0, index)),
    }
}
