//! Model-side seams the learner drives.
//!
//! The learner never sees a concrete architecture. It talks to a
//! [`PolicyBackbone`] for logits and to a [`SequenceParallel`] group for the
//! collective it needs, so the update loop and the forward engine stay
//! testable on small hand-built models.

use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor};

/// Per-token outputs a backbone can produce in-kernel instead of
/// materializing full logits.
#[derive(Debug, Clone)]
pub struct FusedOutput<B: Backend> {
    /// Log-prob of the label token at each position, `[total_tokens]`.
    pub log_probs: Tensor<B, 1>,
    /// Full-distribution entropy at each position, `[total_tokens]`.
    pub entropy: Tensor<B, 1>,
}

/// A causal language model the learner can query for logits.
///
/// `forward` is the padded path; `forward_packed` takes pad-free flattened
/// tokens and is what sequence parallelism requires. `forward_fused` lets a
/// backbone compute log-probs and entropy without materializing the
/// `[tokens, vocab]` logits; returning `None` (the default) falls back to the
/// logits paths.
pub trait PolicyBackbone<B: Backend> {
    /// Vocabulary size of the output distribution.
    fn vocab_size(&self) -> usize;

    /// Next-token logits for padded input, `[batch, seq, vocab]`.
    fn forward(
        &self,
        input_ids: Tensor<B, 2, Int>,
        attention_mask: Tensor<B, 2, Int>,
        position_ids: Tensor<B, 2, Int>,
    ) -> Tensor<B, 3>;

    /// Next-token logits for pad-free flattened input, `[total_tokens, vocab]`.
    fn forward_packed(
        &self,
        input_ids: Tensor<B, 1, Int>,
        position_ids: Tensor<B, 1, Int>,
    ) -> Tensor<B, 2>;

    /// Fused per-token log-probs and entropy for pad-free flattened input.
    ///
    /// `labels` holds the target token at each position (already shifted by
    /// the caller). Backbones without a fused kernel keep the default.
    fn forward_fused(
        &self,
        _input_ids: Tensor<B, 1, Int>,
        _position_ids: Tensor<B, 1, Int>,
        _labels: Tensor<B, 1, Int>,
        _temperature: f32,
    ) -> Option<FusedOutput<B>> {
        None
    }
}

/// A sequence-parallel process group.
///
/// Packed tokens are padded to a multiple of [`size`](Self::size), each rank
/// runs the backbone on its slice, and per-token results are reassembled with
/// [`all_gather`](Self::all_gather). Only valid together with padding
/// removal; the forward engine rejects the combination otherwise.
pub trait SequenceParallel {
    /// Number of ranks in the group.
    fn size(&self) -> usize;

    /// This process's rank within the group.
    fn rank(&self) -> usize;

    /// Concatenate every rank's per-token values in rank order.
    fn all_gather<B: Backend>(&self, local: Tensor<B, 1>) -> Tensor<B, 1>;
}

/// The single-process group: size 1, gather is the identity.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSequenceParallel;

impl SequenceParallel for NoSequenceParallel {
    fn size(&self) -> usize {
        1
    }

    fn rank(&self) -> usize {
        0
    }

    fn all_gather<B: Backend>(&self, local: Tensor<B, 1>) -> Tensor<B, 1> {
        local
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! A tiny lookup-table policy for exercising the learner.

    use burn::module::{Module, Param};
    use burn::tensor::backend::Backend;
    use burn::tensor::{Distribution, Int, Tensor};

    use super::{PolicyBackbone, SequenceParallel};

    /// Logits come straight from a `[vocab, vocab]` table indexed by the
    /// input token, so expected values are easy to compute by hand and the
    /// table is the only trainable parameter.
    #[derive(Module, Debug)]
    pub struct TablePolicy<B: Backend> {
        pub table: Param<Tensor<B, 2>>,
    }

    impl<B: Backend> TablePolicy<B> {
        pub fn new(vocab_size: usize, device: &B::Device) -> Self {
            let table = Tensor::random(
                [vocab_size, vocab_size],
                Distribution::Normal(0.0, 0.1),
                device,
            );
            Self {
                table: Param::from_tensor(table),
            }
        }

        pub fn from_rows(rows: Vec<Vec<f32>>, device: &B::Device) -> Self {
            let vocab = rows.len();
            let flat: Vec<f32> = rows.into_iter().flatten().collect();
            let table =
                Tensor::<B, 1>::from_floats(flat.as_slice(), device).reshape([vocab, vocab]);
            Self {
                table: Param::from_tensor(table),
            }
        }
    }

    impl<B: Backend> PolicyBackbone<B> for TablePolicy<B> {
        fn vocab_size(&self) -> usize {
            self.table.dims()[0]
        }

        fn forward(
            &self,
            input_ids: Tensor<B, 2, Int>,
            _attention_mask: Tensor<B, 2, Int>,
            _position_ids: Tensor<B, 2, Int>,
        ) -> Tensor<B, 3> {
            let [batch, seq] = input_ids.dims();
            let vocab = self.vocab_size();
            let flat = input_ids.reshape([batch * seq]);
            self.table.val().select(0, flat).reshape([batch, seq, vocab])
        }

        fn forward_packed(
            &self,
            input_ids: Tensor<B, 1, Int>,
            _position_ids: Tensor<B, 1, Int>,
        ) -> Tensor<B, 2> {
            self.table.val().select(0, input_ids)
        }
    }

    /// Claims a group size without any peers behind it. Only for asserting
    /// that invalid configurations are rejected before any collective runs.
    pub struct ClaimedGroup {
        pub size: usize,
    }

    impl SequenceParallel for ClaimedGroup {
        fn size(&self) -> usize {
            self.size
        }

        fn rank(&self) -> usize {
            0
        }

        fn all_gather<B: Backend>(&self, local: Tensor<B, 1>) -> Tensor<B, 1> {
            local
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::TablePolicy;
    use super::*;
    use burn::backend::NdArray;

    type B = NdArray<f32>;

    #[test]
    fn test_table_policy_padded_and_packed_agree() {
        let device = Default::default();
        let policy = TablePolicy::<B>::from_rows(
            vec![
                vec![1.0, 2.0, 3.0],
                vec![4.0, 5.0, 6.0],
                vec![7.0, 8.0, 9.0],
            ],
            &device,
        );

        let ids = Tensor::<B, 2, Int>::from_ints([[0, 2]], &device);
        let mask = Tensor::<B, 2, Int>::from_ints([[1, 1]], &device);
        let pos = Tensor::<B, 2, Int>::from_ints([[0, 1]], &device);

        let padded = policy.forward(ids, mask, pos).into_data();
        let values = padded.as_slice::<f32>().unwrap();
        assert_eq!(values, &[1.0, 2.0, 3.0, 7.0, 8.0, 9.0]);

        let flat_ids = Tensor::<B, 1, Int>::from_ints([0, 2], &device);
        let flat_pos = Tensor::<B, 1, Int>::from_ints([0, 1], &device);
        let packed = policy.forward_packed(flat_ids, flat_pos).into_data();
        assert_eq!(packed.as_slice::<f32>().unwrap(), values);
    }

    #[test]
    fn test_fused_default_is_absent() {
        let device = Default::default();
        let policy = TablePolicy::<B>::new(4, &device);

        let ids = Tensor::<B, 1, Int>::from_ints([0, 1], &device);
        let pos = Tensor::<B, 1, Int>::from_ints([0, 1], &device);
        let labels = Tensor::<B, 1, Int>::from_ints([1, 2], &device);

        assert!(policy.forward_fused(ids, pos, labels, 1.0).is_none());
    }

    #[test]
    fn test_no_sequence_parallel_is_identity() {
        let device = Default::default();
        let group = NoSequenceParallel;

        assert_eq!(group.size(), 1);
        assert_eq!(group.rank(), 0);

        let local = Tensor::<B, 1>::from_floats([1.0, 2.0, 3.0], &device);
        let gathered = group.all_gather(local.clone());
        let diff = (gathered - local).abs().sum().into_scalar();
        assert!(diff < 1e-6);
    }
}
