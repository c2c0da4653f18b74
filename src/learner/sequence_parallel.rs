//! Shard-size bookkeeping for sequence parallelism.
//!
//! A packed token stream is padded to a multiple of the group size, split
//! into equal rank shards, and the per-token results are reassembled in rank
//! order before the padding is stripped again. The ordering is mandatory:
//! pack, shard, compute, gather, unpad. These helpers are pure; the actual
//! collective lives behind [`crate::model::SequenceParallel`].

use burn::tensor::backend::Backend;
use burn::tensor::{Numeric, Tensor};

/// Right-pad `tensor` with zeros to a multiple of `multiple`.
///
/// Returns the padded tensor and the pad size so [`strip_padding`] can undo
/// it after the gather.
pub fn pad_to_multiple<B: Backend, K: Numeric<B>>(
    tensor: Tensor<B, 1, K>,
    multiple: usize,
) -> (Tensor<B, 1, K>, usize) {
    let len = tensor.dims()[0];
    let pad = (multiple - len % multiple) % multiple;
    if pad == 0 {
        return (tensor, 0);
    }
    let device = tensor.device();
    let padded = Tensor::cat(vec![tensor, Tensor::zeros([pad], &device)], 0);
    (padded, pad)
}

/// The contiguous shard rank `rank` of `size` computes on.
pub fn slice_for_rank<B: Backend, K: Numeric<B>>(
    padded: Tensor<B, 1, K>,
    size: usize,
    rank: usize,
) -> Tensor<B, 1, K> {
    let chunk = padded.dims()[0] / size;
    padded.slice([rank * chunk..(rank + 1) * chunk])
}

/// Drop the `pad` trailing values [`pad_to_multiple`] added.
pub fn strip_padding<B: Backend, K: Numeric<B>>(
    gathered: Tensor<B, 1, K>,
    pad: usize,
) -> Tensor<B, 1, K> {
    let len = gathered.dims()[0];
    gathered.slice([0..len - pad])
}
