//! Real-data loading for the discriminator.
use tch::{Kind, Tensor};

/// A restartable iterator of `(image batch, label)` pairs.
pub trait DataLoader {
    /// The next batch of one pass, `None` when the pass is exhausted.
    fn next_batch(&mut self) -> Option<(Tensor, Tensor)>;

    /// Restarts the loader for another pass.
    fn reset(&mut self);
}

/// In-memory loader over an image tensor `[N, C, H, W]`.
///
/// Batches are drawn in a shuffled order re-drawn on every pass; a trailing
/// partial batch is dropped.
pub struct TensorDataLoader {
    images: Tensor,
    labels: Tensor,
    batch_size: i64,
    order: Vec<i64>,
    cursor: usize,
}

impl TensorDataLoader {
    /// Creates a loader over `images` with per-sample `labels`.
    pub fn new(images: Tensor, labels: Tensor, batch_size: i64) -> Self {
        let n = images.size()[0];
        let mut order: Vec<i64> = (0..n).collect();
        shuffle(&mut order);
        Self {
            images,
            labels,
            batch_size,
            order,
            cursor: 0,
        }
    }

    /// A loader over random noise images, for smoke runs without a dataset.
    pub fn synthetic(obs_shape: (i64, i64, i64), n_samples: i64, batch_size: i64) -> Self {
        let (c, h, w) = obs_shape;
        let images = Tensor::rand([n_samples, c, h, w], (Kind::Float, tch::Device::Cpu));
        let labels = Tensor::zeros([n_samples], (Kind::Float, tch::Device::Cpu));
        Self::new(images, labels, batch_size)
    }
}

fn shuffle(order: &mut [i64]) {
    for i in (1..order.len()).rev() {
        order.swap(i, fastrand::usize(..=i));
    }
}

impl DataLoader for TensorDataLoader {
    fn next_batch(&mut self) -> Option<(Tensor, Tensor)> {
        let end = self.cursor + self.batch_size as usize;
        if end > self.order.len() {
            return None;
        }
        let ixs = Tensor::from_slice(&self.order[self.cursor..end]);
        self.cursor = end;
        Some((
            self.images.index_select(0, &ixs),
            self.labels.index_select(0, &ixs),
        ))
    }

    fn reset(&mut self) {
        shuffle(&mut self.order);
        self.cursor = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passes_drop_the_trailing_partial_batch() {
        let mut loader = TensorDataLoader::synthetic((1, 4, 4), 10, 4);
        let mut batches = 0;
        while let Some((images, labels)) = loader.next_batch() {
            assert_eq!(images.size(), vec![4, 1, 4, 4]);
            assert_eq!(labels.size(), vec![4]);
            batches += 1;
        }
        assert_eq!(batches, 2);

        loader.reset();
        assert!(loader.next_batch().is_some());
    }
}
