//! Token-budget micro-batching.
//!
//! Fixed-size micro-batches waste compute when sequence lengths vary: a
//! micro-batch of short sequences underfills the device while one long
//! sequence forces a small batch everywhere. Dynamic batching instead packs
//! sequences into micro-batches greedily under a per-batch token budget, then
//! restores the original row order afterwards with a reverse index.

use burn::tensor::backend::Backend;

use super::batch::TrainingBatch;

/// Failures while packing or unpacking dynamic micro-batches.
#[derive(Debug, PartialEq, Eq)]
pub enum DynamicBatchError {
    /// A single sequence exceeds the per-micro-batch token budget.
    SequenceTooLong {
        row: usize,
        tokens: usize,
        max_token_len: usize,
    },
    /// The concatenated index lists do not cover the batch exactly.
    /// Outputs reordered with such an index would be silently wrong,
    /// so this is fatal.
    IndexMismatch { expected: usize, actual: usize },
}

impl std::fmt::Display for DynamicBatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DynamicBatchError::SequenceTooLong {
                row,
                tokens,
                max_token_len,
            } => write!(
                f,
                "sequence {} has {} tokens, exceeding the micro-batch budget of {}",
                row, tokens, max_token_len
            ),
            DynamicBatchError::IndexMismatch { expected, actual } => write!(
                f,
                "micro-batch indices cover {} rows but the batch has {}",
                actual, expected
            ),
        }
    }
}

impl std::error::Error for DynamicBatchError {}

/// Pack `batch` into micro-batches holding at most `max_token_len` live
/// tokens each.
///
/// Rows are placed first-fit-decreasing by live-token count, so the returned
/// micro-batches do not preserve the original row order. The second return
/// value lists, per micro-batch, the original row index of each of its rows;
/// feed the concatenation to [`reverse_index`] to restore order after the
/// forward passes.
pub fn rearrange_micro_batches<B: Backend>(
    batch: &TrainingBatch<B>,
    max_token_len: usize,
) -> Result<(Vec<TrainingBatch<B>>, Vec<Vec<usize>>), DynamicBatchError> {
    let tokens = batch.tokens_per_row();
    for (row, &count) in tokens.iter().enumerate() {
        if count > max_token_len {
            return Err(DynamicBatchError::SequenceTooLong {
                row,
                tokens: count,
                max_token_len,
            });
        }
    }

    let mut order: Vec<usize> = (0..tokens.len()).collect();
    order.sort_by(|&a, &b| tokens[b].cmp(&tokens[a]).then(a.cmp(&b)));

    let mut bins: Vec<Vec<usize>> = Vec::new();
    let mut loads: Vec<usize> = Vec::new();
    for row in order {
        let count = tokens[row];
        match loads
            .iter()
            .position(|&load| load + count <= max_token_len)
        {
            Some(bin) => {
                bins[bin].push(row);
                loads[bin] += count;
            }
            None => {
                bins.push(vec![row]);
                loads.push(count);
            }
        }
    }

    let micro_batches = bins.iter().map(|rows| batch.select_rows(rows)).collect();
    Ok((micro_batches, bins))
}

/// Invert the row placement produced by [`rearrange_micro_batches`].
///
/// `indices` is the concatenation of the per-micro-batch index lists;
/// `reverse[i]` is the position of original row `i` in the concatenated
/// outputs. A partial or duplicated cover means the packing and the outputs
/// disagree and reordering would scramble rows, so both are rejected.
pub fn reverse_index(
    indices: &[usize],
    batch_size: usize,
) -> Result<Vec<usize>, DynamicBatchError> {
    if indices.len() != batch_size {
        return Err(DynamicBatchError::IndexMismatch {
            expected: batch_size,
            actual: indices.len(),
        });
    }

    let mut reverse = vec![usize::MAX; batch_size];
    for (position, &row) in indices.iter().enumerate() {
        if row >= batch_size || reverse[row] != usize::MAX {
            return Err(DynamicBatchError::IndexMismatch {
                expected: batch_size,
                actual: indices.len(),
            });
        }
        reverse[row] = position;
    }
    Ok(reverse)
}
