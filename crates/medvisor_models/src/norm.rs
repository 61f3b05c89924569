//! Batch normalization with frozen running statistics.

use burn::module::Param;
use burn::prelude::*;

/// Batch normalization that always uses its running statistics.
///
/// burn's `BatchNorm` switches to batch statistics whenever the backend has
/// autodiff enabled. Saliency runs on the autodiff backend with a batch of
/// one, so it needs the inference-mode affine transform on every backend.
#[derive(Module, Debug)]
pub struct FrozenBatchNorm<B: Backend> {
    /// Scale.
    pub gamma: Param<Tensor<B, 1>>,
    /// Shift.
    pub beta: Param<Tensor<B, 1>>,
    /// Running mean.
    pub running_mean: Param<Tensor<B, 1>>,
    /// Running variance.
    pub running_var: Param<Tensor<B, 1>>,
    epsilon: f64,
}

impl<B: Backend> FrozenBatchNorm<B> {
    /// Identity-initialized normalization over `num_features` channels.
    pub fn new(num_features: usize, device: &B::Device) -> Self {
        Self {
            gamma: Param::from_tensor(Tensor::ones([num_features], device)),
            beta: Param::from_tensor(Tensor::zeros([num_features], device)),
            running_mean: Param::from_tensor(Tensor::zeros([num_features], device)),
            running_var: Param::from_tensor(Tensor::ones([num_features], device)),
            epsilon: 1e-3,
        }
    }

    /// Set the variance epsilon.
    #[must_use]
    pub fn with_epsilon(mut self, epsilon: f64) -> Self {
        self.epsilon = epsilon;
        self
    }

    /// Variance epsilon.
    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    /// Number of normalized channels.
    pub fn num_features(&self) -> usize {
        let [n] = self.gamma.val().dims();
        n
    }

    /// Forward pass over `(N, C, H, W)`.
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let [_, channels, _, _] = x.dims();
        let scale = self.gamma.val() / (self.running_var.val() + self.epsilon).sqrt();
        let shift = self.beta.val() - self.running_mean.val() * scale.clone();
        x * scale.reshape([1, channels, 1, 1]) + shift.reshape([1, channels, 1, 1])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray;

    #[test]
    fn test_identity_init() {
        let device = Default::default();
        let bn = FrozenBatchNorm::<TestBackend>::new(4, &device);
        assert_eq!(bn.num_features(), 4);

        let x = Tensor::<TestBackend, 4>::ones([1, 4, 2, 2], &device) * 3.0;
        let y = bn.forward(x);
        let values: Vec<f32> = y.into_data().to_vec().unwrap();
        // 3 / sqrt(1 + 1e-3)
        for v in values {
            assert!((v - 2.998_501).abs() < 1e-4);
        }
    }

    #[test]
    fn test_uses_running_stats() {
        let device = Default::default();
        let mut bn = FrozenBatchNorm::<TestBackend>::new(1, &device);
        bn.running_mean = Param::from_tensor(Tensor::from_floats([2.0], &device));
        bn.running_var = Param::from_tensor(Tensor::from_floats([4.0], &device));

        let x = Tensor::<TestBackend, 1>::from_floats([2.0, 4.0], &device).reshape([1, 1, 1, 2]);
        let values: Vec<f32> = bn.forward(x).into_data().to_vec().unwrap();
        assert!(values[0].abs() < 1e-5);
        assert!((values[1] - 2.0 / (4.0f32 + 1e-3).sqrt()).abs() < 1e-5);
    }

    #[test]
    fn test_custom_epsilon() {
        let device = Default::default();
        let bn = FrozenBatchNorm::<TestBackend>::new(1, &device).with_epsilon(1e-5);
        assert_eq!(bn.epsilon(), 1e-5);

        let x = Tensor::<TestBackend, 4>::ones([1, 1, 1, 1], &device);
        let values: Vec<f32> = bn.forward(x).into_data().to_vec().unwrap();
        assert!((values[0] - 1.0 / (1.0f32 + 1e-5).sqrt()).abs() < 1e-6);
    }
}
