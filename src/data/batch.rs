//! Batch container for prompt+response token tensors.
//!
//! A [`TrainingBatch`] carries the full `[batch, seq]` token tensors plus the
//! training-only per-response tensors. The invariant throughout the crate is
//! `seq_len = prompt_len + response_len`, with the response always the suffix
//! of the full sequence.

use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor};

/// Batch-level metadata the update loop needs alongside the tensors.
///
/// `temperature` is deliberately optional: generation and training must agree
/// on it, so a batch that arrives without one is a caller error surfaced by
/// the forward engine rather than silently defaulting to 1.0.
#[derive(Debug, Clone)]
pub struct BatchMeta {
    /// Sampling temperature the responses were generated with.
    pub temperature: Option<f32>,
    /// Fixed micro-batch size when dynamic batching is off.
    pub micro_batch_size: usize,
    /// Split micro-batches by token budget instead of fixed size.
    pub use_dynamic_bsz: bool,
    /// Token budget per micro-batch under dynamic batching.
    pub max_token_len: usize,
}

impl Default for BatchMeta {
    fn default() -> Self {
        Self {
            temperature: None,
            micro_batch_size: 1,
            use_dynamic_bsz: false,
            max_token_len: 0,
        }
    }
}

/// One batch of sequences, mini-batch or micro-batch.
#[derive(Debug, Clone)]
pub struct TrainingBatch<B: Backend> {
    /// Prompt+response token ids, `[batch, seq]`.
    pub input_ids: Tensor<B, 2, Int>,
    /// 1 for live tokens, 0 for padding, `[batch, seq]`.
    pub attention_mask: Tensor<B, 2, Int>,
    /// Position ids, `[batch, seq]`.
    pub position_ids: Tensor<B, 2, Int>,
    /// Response token ids, `[batch, response_len]`; always the sequence suffix.
    pub responses: Tensor<B, 2, Int>,
    /// Behavior-policy log-probs, `[batch, response_len]`.
    pub old_log_probs: Option<Tensor<B, 2>>,
    /// Advantage estimates, `[batch, response_len]`.
    pub advantages: Option<Tensor<B, 2>>,
    /// Frozen reference-policy log-probs, `[batch, response_len]`.
    pub ref_log_probs: Option<Tensor<B, 2>>,
    /// Loss mask overriding the attention mask (multi-turn), `[batch, seq]`.
    pub loss_mask: Option<Tensor<B, 2, Int>>,
    /// Batch metadata.
    pub meta: BatchMeta,
}

impl<B: Backend> TrainingBatch<B> {
    /// Number of sequences.
    pub fn batch_size(&self) -> usize {
        self.input_ids.dims()[0]
    }

    /// Full sequence length (prompt + response).
    pub fn seq_len(&self) -> usize {
        self.input_ids.dims()[1]
    }

    /// Response length.
    pub fn response_len(&self) -> usize {
        self.responses.dims()[1]
    }

    /// Response-token mask, `[batch, response_len]`, float.
    ///
    /// The loss mask takes precedence when present (multi-turn training);
    /// otherwise the attention-mask suffix is used.
    pub fn response_mask(&self) -> Tensor<B, 2> {
        let seq_len = self.seq_len();
        let response_len = self.response_len();
        let source = self
            .loss_mask
            .clone()
            .unwrap_or_else(|| self.attention_mask.clone());
        source
            .slice([0..self.batch_size(), seq_len - response_len..seq_len])
            .float()
    }

    /// Live-token count per sequence, from the attention mask.
    pub fn tokens_per_row(&self) -> Vec<usize> {
        let sums = self.attention_mask.clone().float().sum_dim(1);
        sums.into_data().iter::<f32>().map(|v| v as usize).collect()
    }

    /// Split into chunks of at most `size` rows, preserving order.
    pub fn split(&self, size: usize) -> Vec<TrainingBatch<B>> {
        let batch_size = self.batch_size();
        let mut chunks = Vec::new();
        let mut start = 0;
        while start < batch_size {
            let end = (start + size).min(batch_size);
            chunks.push(self.select_rows(&(start..end).collect::<Vec<_>>()));
            start = end;
        }
        chunks
    }

    /// Concatenate batches row-wise. Metadata comes from the first batch;
    /// an optional tensor survives only if every batch carries it. Returns
    /// `None` for an empty input.
    pub fn concat(batches: Vec<TrainingBatch<B>>) -> Option<TrainingBatch<B>> {
        let meta = batches.first()?.meta.clone();

        fn gather_optional<B: Backend, const D: usize, K>(
            parts: Vec<Option<Tensor<B, D, K>>>,
        ) -> Option<Tensor<B, D, K>>
        where
            K: burn::tensor::BasicOps<B>,
        {
            let collected: Option<Vec<_>> = parts.into_iter().collect();
            collected.map(|tensors| Tensor::cat(tensors, 0))
        }

        let mut input_ids = Vec::with_capacity(batches.len());
        let mut attention_mask = Vec::with_capacity(batches.len());
        let mut position_ids = Vec::with_capacity(batches.len());
        let mut responses = Vec::with_capacity(batches.len());
        let mut old_log_probs = Vec::with_capacity(batches.len());
        let mut advantages = Vec::with_capacity(batches.len());
        let mut ref_log_probs = Vec::with_capacity(batches.len());
        let mut loss_mask = Vec::with_capacity(batches.len());

        for batch in batches {
            input_ids.push(batch.input_ids);
            attention_mask.push(batch.attention_mask);
            position_ids.push(batch.position_ids);
            responses.push(batch.responses);
            old_log_probs.push(batch.old_log_probs);
            advantages.push(batch.advantages);
            ref_log_probs.push(batch.ref_log_probs);
            loss_mask.push(batch.loss_mask);
        }

        Some(TrainingBatch {
            input_ids: Tensor::cat(input_ids, 0),
            attention_mask: Tensor::cat(attention_mask, 0),
            position_ids: Tensor::cat(position_ids, 0),
            responses: Tensor::cat(responses, 0),
            old_log_probs: gather_optional(old_log_probs),
            advantages: gather_optional(advantages),
            ref_log_probs: gather_optional(ref_log_probs),
            loss_mask: gather_optional(loss_mask),
            meta,
        })
    }

    /// A new batch containing `rows` in the given order.
    pub fn select_rows(&self, rows: &[usize]) -> TrainingBatch<B> {
        let device = self.input_ids.device();
        let indices: Vec<i32> = rows.iter().map(|&r| r as i32).collect();
        let index = Tensor::<B, 1, Int>::from_ints(indices.as_slice(), &device);

        TrainingBatch {
            input_ids: self.input_ids.clone().select(0, index.clone()),
            attention_mask: self.attention_mask.clone().select(0, index.clone()),
            position_ids: self.position_ids.clone().select(0, index.clone()),
            responses: self.responses.clone().select(0, index.clone()),
            old_log_probs: self
                .old_log_probs
                .clone()
                .map(|t| t.select(0, index.clone())),
            advantages: self.advantages.clone().map(|t| t.select(0, index.clone())),
            ref_log_probs: self
                .ref_log_probs
                .clone()
                .map(|t| t.select(0, index.clone())),
            loss_mask: self.loss_mask.clone().map(|t| t.select(0, index)),
            meta: self.meta.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type B = NdArray<f32>;

    pub(crate) fn small_batch(device: &<B as Backend>::Device) -> TrainingBatch<B> {
        // 3 sequences, seq 4, response 2; row 2 has one pad token.
        TrainingBatch {
            input_ids: Tensor::from_ints([[1, 2, 3, 4], [5, 6, 7, 8], [0, 9, 10, 11]], device),
            attention_mask: Tensor::from_ints([[1, 1, 1, 1], [1, 1, 1, 1], [0, 1, 1, 1]], device),
            position_ids: Tensor::from_ints([[0, 1, 2, 3], [0, 1, 2, 3], [0, 0, 1, 2]], device),
            responses: Tensor::from_ints([[3, 4], [7, 8], [10, 11]], device),
            old_log_probs: None,
            advantages: None,
            ref_log_probs: None,
            loss_mask: None,
            meta: BatchMeta::default(),
        }
    }

    #[test]
    fn test_shapes() {
        let device = Default::default();
        let batch = small_batch(&device);

        assert_eq!(batch.batch_size(), 3);
        assert_eq!(batch.seq_len(), 4);
        assert_eq!(batch.response_len(), 2);
    }

    #[test]
    fn test_tokens_per_row() {
        let device = Default::default();
        let batch = small_batch(&device);

        assert_eq!(batch.tokens_per_row(), vec![4, 4, 3]);
    }

    #[test]
    fn test_response_mask_uses_attention_suffix() {
        let device = Default::default();
        let batch = small_batch(&device);

        let mask = batch.response_mask().into_data();
        let values = mask.as_slice::<f32>().unwrap();
        assert_eq!(values, &[1.0, 1.0, 1.0, 1.0, 1.0, 1.0]);
    }

    #[test]
    fn test_loss_mask_takes_precedence() {
        let device = Default::default();
        let mut batch = small_batch(&device);
        batch.loss_mask =
            Some(Tensor::from_ints([[1, 1, 0, 1], [1, 1, 1, 0], [0, 1, 1, 1]], &device));

        let mask = batch.response_mask().into_data();
        let values = mask.as_slice::<f32>().unwrap();
        assert_eq!(values, &[0.0, 1.0, 1.0, 0.0, 1.0, 1.0]);
    }

    #[test]
    fn test_split_sizes() {
        let device = Default::default();
        let batch = small_batch(&device);

        let chunks = batch.split(2);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].batch_size(), 2);
        assert_eq!(chunks[1].batch_size(), 1);
        assert_eq!(chunks[1].tokens_per_row(), vec![3]);
    }

    #[test]
    fn test_concat_restores_split() {
        let device = Default::default();
        let batch = small_batch(&device);

        let rejoined = TrainingBatch::concat(batch.split(2)).unwrap();
        assert_eq!(rejoined.batch_size(), 3);
        assert_eq!(rejoined.tokens_per_row(), batch.tokens_per_row());

        let diff = (rejoined.input_ids.float() - batch.input_ids.float())
            .abs()
            .sum()
            .into_scalar();
        assert!(diff < 1e-6);
    }

    #[test]
    fn test_concat_drops_partial_optionals() {
        let device = Default::default();
        let mut with_adv = small_batch(&device);
        with_adv.advantages = Some(Tensor::from_floats([[0.1, 0.2]], &device));
        let without_adv = small_batch(&device);

        let joined =
            TrainingBatch::concat(vec![with_adv.select_rows(&[0]), without_adv]).unwrap();
        assert!(joined.advantages.is_none());

        assert!(TrainingBatch::<B>::concat(Vec::new()).is_none());
    }

    #[test]
    fn test_select_rows_reorders() {
        let device = Default::default();
        let batch = small_batch(&device);

        let picked = batch.select_rows(&[2, 0]);
        assert_eq!(picked.batch_size(), 2);
        assert_eq!(picked.tokens_per_row(), vec![3, 4]);
    }
}
