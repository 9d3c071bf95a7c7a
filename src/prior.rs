//! Factorized Gaussian base distribution.
//!
//! \[
//! \log p_Z(z) = -\tfrac12 \sum_i z_i^2/\sigma^2 - N\left(\log\sigma + \tfrac12\log 2\pi\right).
//! \]
//!
//! Samples are drawn on the host from the caller's RNG and then uploaded, so a seed fixes them
//! regardless of backend.

use burn_core as burn;

use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};
use ndarray::Array2;
use rand::Rng;
use rand_distr::{Distribution, StandardNormal};
use serde::{Deserialize, Serialize};

use crate::target::EnergyModel;
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Gaussian {
    shape: Vec<usize>,
    sigma: f32,
}

impl Gaussian {
    /// Standard normal over a sample of shape `shape`.
    pub fn new(shape: Vec<usize>) -> Result<Self> {
        Self::with_sigma(shape, 1.0)
    }

    pub fn with_sigma(shape: Vec<usize>, sigma: f32) -> Result<Self> {
        if shape.is_empty() || shape.iter().any(|&n| n == 0) {
            return Err(Error::Construction(format!("prior shape {shape:?} is empty")));
        }
        if !(sigma.is_finite() && sigma > 0.0) {
            return Err(Error::Construction(format!(
                "prior sigma must be finite and > 0, got {sigma}"
            )));
        }
        Ok(Self { shape, sigma })
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn sigma(&self) -> f32 {
        self.sigma
    }

    pub fn nvars(&self) -> usize {
        self.shape.iter().product()
    }

    /// `[batch_size, nvars]` i.i.d. draws.
    pub fn sample<B: Backend, R: Rng + ?Sized>(
        &self,
        batch_size: usize,
        device: &B::Device,
        rng: &mut R,
    ) -> Result<Tensor<B, 2>> {
        if batch_size == 0 {
            return Err(Error::Domain("batch_size must be >= 1"));
        }
        let n = self.nvars();
        let z = Array2::<f32>::from_shape_simple_fn((batch_size, n), || {
            let v: f32 = StandardNormal.sample(&mut *rng);
            self.sigma * v
        });
        let data = TensorData::new(z.into_raw_vec_and_offset().0, [batch_size, n])
            .convert::<B::FloatElem>();
        Ok(Tensor::from_data(data, device))
    }

    /// Per-row log density of `z: [batch, nvars]`.
    pub fn log_probability<B: Backend>(&self, z: Tensor<B, 2>) -> Result<Tensor<B, 1>> {
        let [batch, n] = z.dims();
        if n != self.nvars() {
            return Err(Error::Shape("prior input width must equal nvars"));
        }
        let var = self.sigma * self.sigma;
        let norm = n as f32 * (self.sigma.ln() + 0.5 * (2.0 * std::f32::consts::PI).ln());
        Ok(z
            .powf_scalar(2.0)
            .sum_dim(1)
            .reshape([batch])
            .div_scalar(-2.0 * var)
            .sub_scalar(norm))
    }
}

/// The prior as a potential, for HMC directly in latent space.
impl<B: Backend> EnergyModel<B> for Gaussian {
    fn nvars(&self) -> usize {
        Gaussian::nvars(self)
    }

    fn energy(&self, x: Tensor<B, 2>) -> Result<Tensor<B, 1>> {
        self.log_probability(x)
    }

    /// Mean of `z²` per row (`σ²` in expectation).
    fn measure(&self, x: Tensor<B, 2>) -> Result<Tensor<B, 1>> {
        let [batch, n] = x.dims();
        if n != self.nvars() {
            return Err(Error::Shape("prior input width must equal nvars"));
        }
        Ok(x.powf_scalar(2.0).mean_dim(1).reshape([batch]))
    }
}
