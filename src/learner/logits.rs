//! Per-token statistics over temperature-scaled logits.
//!
//! All kernels take `[tokens, vocab]` logits (already divided by the
//! sampling temperature) and return one value per token. Callers treat them
//! as pure functions; sentence-level aggregates are masked per-row means of
//! the token values.

use burn::tensor::activation::log_softmax;
use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor};

/// `log p(label)` at every position, `[tokens]`.
pub fn log_probs_from_logits<B: Backend>(
    logits: Tensor<B, 2>,
    labels: Tensor<B, 1, Int>,
) -> Tensor<B, 1> {
    let tokens = labels.dims()[0];
    log_softmax(logits, 1)
        .gather(1, labels.reshape([tokens, 1]))
        .reshape([tokens])
}

/// `logsumexp(logits)` per row, `[tokens]`, computed with the max trick.
fn logsumexp<B: Backend>(logits: Tensor<B, 2>) -> Tensor<B, 1> {
    let tokens = logits.dims()[0];
    let max = logits.clone().max_dim(1);
    let shifted = (logits - max.clone()).exp().sum_dim(1).log();
    (shifted + max).reshape([tokens])
}

/// Shannon entropy of the full distribution at every position, `[tokens]`.
///
/// Uses `H = logsumexp(z) - sum(softmax(z) * z)`, which avoids a separate
/// `p * log p` with its 0-times-minus-infinity corner.
pub fn entropy_from_logits<B: Backend>(logits: Tensor<B, 2>) -> Tensor<B, 1> {
    let tokens = logits.dims()[0];
    let probs = burn::tensor::activation::softmax(logits.clone(), 1);
    let expected_logit = (probs * logits.clone()).sum_dim(1).reshape([tokens]);
    logsumexp(logits) - expected_logit
}

/// Self-certainty at every position, `[tokens]`:
/// `logsumexp(logits) - mean(logits)`.
pub fn self_certainty_from_logits<B: Backend>(logits: Tensor<B, 2>) -> Tensor<B, 1> {
    let tokens = logits.dims()[0];
    let mean = logits.clone().mean_dim(1).reshape([tokens]);
    logsumexp(logits) - mean
}

/// Masked mean of per-token values within each sequence, `[batch]`.
pub fn sequence_mean<B: Backend>(values: Tensor<B, 2>, mask: Tensor<B, 2>) -> Tensor<B, 1> {
    let batch = values.dims()[0];
    let sums = (values * mask.clone()).sum_dim(1).reshape([batch]);
    let counts = mask.sum_dim(1).reshape([batch]);
    sums / counts
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type B = NdArray<f32>;

    fn assert_close(actual: f32, expected: f32) {
        assert!(
            (actual - expected).abs() < 1e-4,
            "expected {}, got {}",
            expected,
            actual
        );
    }

    #[test]
    fn test_log_prob_of_label() {
        let device = Default::default();
        let logits = Tensor::<B, 2>::from_floats([[1.0, 2.0, 3.0]], &device);
        let labels = Tensor::<B, 1, Int>::from_ints([2], &device);

        // logsumexp([1,2,3]) = 3.407606; log p(2) = 3 - 3.407606
        let value = log_probs_from_logits(logits, labels).into_scalar();
        assert_close(value, -0.407606);
    }

    #[test]
    fn test_entropy_hand_computed() {
        let device = Default::default();
        let logits = Tensor::<B, 2>::from_floats([[1.0, 2.0, 3.0]], &device);

        // softmax = [0.090031, 0.244728, 0.665241]
        // H = 3.407606 - (0.090031 + 0.489456 + 1.995723) = 0.832396
        let value = entropy_from_logits(logits).into_scalar();
        assert_close(value, 0.832396);
    }

    #[test]
    fn test_uniform_logits_entropy_is_log_vocab() {
        let device = Default::default();
        let logits = Tensor::<B, 2>::from_floats([[0.5, 0.5, 0.5, 0.5]], &device);

        let value = entropy_from_logits(logits).into_scalar();
        assert_close(value, (4.0f32).ln());
    }

    #[test]
    fn test_self_certainty_hand_computed() {
        let device = Default::default();
        let logits = Tensor::<B, 2>::from_floats([[1.0, 2.0, 3.0]], &device);

        // logsumexp - mean = 3.407606 - 2.0
        let value = self_certainty_from_logits(logits).into_scalar();
        assert_close(value, 1.407606);
    }

    #[test]
    fn test_sequence_mean_ignores_masked_tokens() {
        let device = Default::default();
        let values = Tensor::<B, 2>::from_floats([[1.0, 3.0, 100.0], [2.0, 4.0, 6.0]], &device);
        let mask = Tensor::<B, 2>::from_floats([[1.0, 1.0, 0.0], [1.0, 1.0, 1.0]], &device);

        let means = sequence_mean(values, mask).into_data();
        let means = means.as_slice::<f32>().unwrap();
        assert_close(means[0], 2.0);
        assert_close(means[1], 4.0);
    }
}
