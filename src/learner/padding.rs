//! Padding removal for packed forward passes.
//!
//! Padded `[batch, seq]` batches waste compute on dead positions. A
//! [`PackIndex`] records where the live tokens sit so per-token tensors can
//! be flattened into one pad-free stream for the backbone and scattered back
//! afterwards. Round trip: `unpad(pack(x)) == x * mask`.

use burn::tensor::backend::Backend;
use burn::tensor::{Int, Numeric, Tensor};

/// Flat positions of the live tokens of one batch, row-major.
#[derive(Debug, Clone)]
pub struct PackIndex {
    live: Vec<i32>,
    batch: usize,
    seq: usize,
}

impl PackIndex {
    /// Scan the attention mask for live positions.
    pub fn from_mask<B: Backend>(mask: &Tensor<B, 2, Int>) -> Self {
        let [batch, seq] = mask.dims();
        let live = mask
            .clone()
            .float()
            .into_data()
            .iter::<f32>()
            .enumerate()
            .filter(|&(_, v)| v > 0.5)
            .map(|(i, _)| i as i32)
            .collect();
        Self { live, batch, seq }
    }

    /// Number of live tokens across the batch.
    pub fn total_tokens(&self) -> usize {
        self.live.len()
    }

    /// Padded shape this index was built from.
    pub fn padded_shape(&self) -> (usize, usize) {
        (self.batch, self.seq)
    }

    fn index_tensor<B: Backend>(&self, device: &B::Device) -> Tensor<B, 1, Int> {
        Tensor::from_ints(self.live.as_slice(), device)
    }

    /// Flatten `[batch, seq]` values into the `[total_tokens]` live stream.
    pub fn pack<B: Backend, K: Numeric<B>>(&self, tensor: Tensor<B, 2, K>) -> Tensor<B, 1, K> {
        let device = tensor.device();
        tensor
            .reshape([self.batch * self.seq])
            .select(0, self.index_tensor(&device))
    }

    /// Scatter `[total_tokens]` values back to `[batch, seq]`, zeros at pads.
    pub fn unpad<B: Backend, K: Numeric<B>>(&self, values: Tensor<B, 1, K>) -> Tensor<B, 2, K> {
        let device = values.device();
        Tensor::<B, 1, K>::zeros([self.batch * self.seq], &device)
            .select_assign(0, self.index_tensor(&device), values)
            .reshape([self.batch, self.seq])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type B = NdArray<f32>;

    #[test]
    fn test_pack_drops_pads_in_row_major_order() {
        let device = Default::default();
        let mask = Tensor::<B, 2, Int>::from_ints([[0, 1, 1], [1, 1, 0]], &device);
        let index = PackIndex::from_mask(&mask);
        assert_eq!(index.total_tokens(), 4);

        let values =
            Tensor::<B, 2>::from_floats([[9.0, 1.0, 2.0], [3.0, 4.0, 9.0]], &device);
        let packed = index.pack(values).into_data();
        assert_eq!(packed.as_slice::<f32>().unwrap(), &[1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_pack_int_ids() {
        let device = Default::default();
        let mask = Tensor::<B, 2, Int>::from_ints([[1, 1, 0]], &device);
        let index = PackIndex::from_mask(&mask);

        let ids = Tensor::<B, 2, Int>::from_ints([[7, 8, 0]], &device);
        let packed = index.pack(ids).into_data();
        assert_eq!(packed.iter::<i32>().collect::<Vec<_>>(), vec![7, 8]);
    }

    #[test]
    fn test_round_trip_zero_fills_pads() {
        let device = Default::default();
        let mask = Tensor::<B, 2, Int>::from_ints([[0, 1, 1], [1, 0, 1]], &device);
        let index = PackIndex::from_mask(&mask);

        let values =
            Tensor::<B, 2>::from_floats([[5.0, 1.0, 2.0], [3.0, 5.0, 4.0]], &device);
        let restored = index.unpad(index.pack(values.clone()));

        let expected = values * mask.float();
        let diff = (restored - expected).abs().sum().into_scalar();
        assert!(diff < 1e-6);
    }

    #[test]
    fn test_full_mask_is_plain_flatten() {
        let device = Default::default();
        let mask = Tensor::<B, 2, Int>::from_ints([[1, 1], [1, 1]], &device);
        let index = PackIndex::from_mask(&mask);

        let values = Tensor::<B, 2>::from_floats([[1.0, 2.0], [3.0, 4.0]], &device);
        let packed = index.pack(values).into_data();
        assert_eq!(packed.as_slice::<f32>().unwrap(), &[1.0, 2.0, 3.0, 4.0]);
    }
}
