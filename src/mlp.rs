//! Scale and translation networks.
//!
//! A coupling step needs two functions of the frozen sites: a scale `s` and a translation `t`.
//! Both are small MLPs; the scale network additionally ends in a bounded activation
//! (`ScalableTanh`, i.e. `scale ⊙ tanh(h)`) so `exp(s)` cannot overflow.

use burn_core as burn;

use burn::module::{Ignored, Module, Param};
use burn::tensor::activation;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use burn_nn::{Linear, LinearConfig};
use serde::{Deserialize, Serialize};

use crate::state::StateDict;
use crate::{Error, Result};

/// Hidden-layer nonlinearity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Activation {
    Elu,
    Relu,
    Tanh,
    Sigmoid,
}

impl Default for Activation {
    fn default() -> Self {
        Self::Elu
    }
}

impl Activation {
    pub fn apply<B: Backend, const D: usize>(self, x: Tensor<B, D>) -> Tensor<B, D> {
        match self {
            // elu(x) = max(x, 0) + exp(min(x, 0)) - 1
            Activation::Elu => {
                x.clone().clamp_min(0.0) + x.clamp_max(0.0).exp().sub_scalar(1.0)
            }
            Activation::Relu => activation::relu(x),
            Activation::Tanh => x.tanh(),
            Activation::Sigmoid => activation::sigmoid(x),
        }
    }
}

/// What the last linear layer feeds into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputActivation {
    /// Unbounded output (translation networks).
    Linear,
    /// `scale ⊙ tanh(h)` with a learnable per-output `scale`
    /// (initialised from [`MlpConfig::tanh_scale_init`], zero by default).
    ScalableTanh,
}

/// MLP architecture: `d_in → hidden[0] → ... → d_out`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MlpConfig {
    pub hidden: Vec<usize>,
    pub activation: Activation,
    pub output: OutputActivation,
    /// Zero every weight and bias (the network then outputs exactly zero).
    pub zero_init: bool,
    /// Initial value of the `ScalableTanh` scale (ignored for linear outputs).
    pub tanh_scale_init: f32,
}

impl MlpConfig {
    /// Bounded network for the scale `s`.
    pub fn scale(hidden: Vec<usize>) -> Self {
        Self {
            hidden,
            activation: Activation::Elu,
            output: OutputActivation::ScalableTanh,
            zero_init: false,
            tanh_scale_init: 0.0,
        }
    }

    /// Unbounded network for the translation `t`.
    pub fn translation(hidden: Vec<usize>) -> Self {
        Self {
            hidden,
            activation: Activation::Elu,
            output: OutputActivation::Linear,
            zero_init: false,
            tanh_scale_init: 0.0,
        }
    }

    pub fn with_activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }

    pub fn with_zero_init(mut self, zero_init: bool) -> Self {
        self.zero_init = zero_init;
        self
    }

    pub fn with_tanh_scale_init(mut self, value: f32) -> Self {
        self.tanh_scale_init = value;
        self
    }

    pub fn init<B: Backend>(&self, d_in: usize, d_out: usize, device: &B::Device) -> Result<Mlp<B>> {
        if d_in == 0 || d_out == 0 {
            return Err(Error::Construction(format!(
                "network dimensions must be positive, got {d_in} -> {d_out}"
            )));
        }
        if !self.tanh_scale_init.is_finite() {
            return Err(Error::Construction("tanh_scale_init must be finite".into()));
        }
        if self.hidden.iter().any(|&h| h == 0) {
            return Err(Error::Construction("hidden widths must be positive".into()));
        }

        let mut dims = Vec::with_capacity(self.hidden.len() + 2);
        dims.push(d_in);
        dims.extend_from_slice(&self.hidden);
        dims.push(d_out);

        let layers = dims
            .windows(2)
            .map(|w| {
                let mut linear = LinearConfig::new(w[0], w[1]).init(device);
                if self.zero_init {
                    linear.weight = Param::from_tensor(Tensor::zeros([w[0], w[1]], device));
                    linear.bias = Some(Param::from_tensor(Tensor::zeros([w[1]], device)));
                }
                linear
            })
            .collect();

        let scale = match self.output {
            OutputActivation::Linear => None,
            OutputActivation::ScalableTanh => Some(Param::from_tensor(
                Tensor::ones([d_out], device).mul_scalar(self.tanh_scale_init),
            )),
        };

        Ok(Mlp {
            layers,
            scale,
            activation: Ignored(self.activation),
            d_in,
            d_out,
        })
    }
}

/// A plain MLP on `[batch, d_in]` rows.
#[derive(Module, Debug)]
pub struct Mlp<B: Backend> {
    layers: Vec<Linear<B>>,
    scale: Option<Param<Tensor<B, 1>>>,
    activation: Ignored<Activation>,
    d_in: usize,
    d_out: usize,
}

impl<B: Backend> Mlp<B> {
    pub fn d_in(&self) -> usize {
        self.d_in
    }

    pub fn d_out(&self) -> usize {
        self.d_out
    }

    pub fn is_bounded(&self) -> bool {
        self.scale.is_some()
    }

    pub fn device(&self) -> B::Device {
        self.layers[0].weight.device()
    }

    /// `[batch, d_in] -> [batch, d_out]`.
    pub fn forward(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        let last = self.layers.len() - 1;
        let mut h = x;
        for (k, layer) in self.layers.iter().enumerate() {
            h = layer.forward(h);
            if k < last {
                h = self.activation.0.apply(h);
            }
        }
        match &self.scale {
            Some(scale) => scale.val().unsqueeze::<2>() * h.tanh(),
            None => h,
        }
    }

    pub(crate) fn export(&self, prefix: &str, state: &mut StateDict) -> Result<()> {
        for (k, layer) in self.layers.iter().enumerate() {
            state.insert_tensor(format!("{prefix}.linear.{k}.weight"), layer.weight.val())?;
            if let Some(bias) = &layer.bias {
                state.insert_tensor(format!("{prefix}.linear.{k}.bias"), bias.val())?;
            }
        }
        if let Some(scale) = &self.scale {
            state.insert_tensor(format!("{prefix}.scale"), scale.val())?;
        }
        Ok(())
    }

    pub(crate) fn import(mut self, prefix: &str, state: &mut StateDict) -> Result<Self> {
        let device = self.device();
        for (k, layer) in self.layers.iter_mut().enumerate() {
            let [d_in, d_out] = layer.weight.dims();
            let w = state.take_tensor::<B, 2>(&format!("{prefix}.linear.{k}.weight"), [d_in, d_out], &device)?;
            layer.weight = Param::from_tensor(w);
            if layer.bias.is_some() {
                let b = state.take_tensor::<B, 1>(&format!("{prefix}.linear.{k}.bias"), [d_out], &device)?;
                layer.bias = Some(Param::from_tensor(b));
            }
        }
        if self.scale.is_some() {
            let s = state.take_tensor::<B, 1>(&format!("{prefix}.scale"), [self.d_out], &device)?;
            self.scale = Some(Param::from_tensor(s));
        }
        Ok(self)
    }
}

#[cfg(test)]
impl<B: burn::tensor::backend::AutodiffBackend> Mlp<B> {
    /// Gradients of every parameter, under the keys `export` uses.
    pub(crate) fn export_grads(&self, prefix: &str, grads: &B::Gradients, state: &mut StateDict) -> Result<()> {
        fn grad_or_zero<B: burn::tensor::backend::AutodiffBackend, const D: usize>(
            t: Tensor<B, D>,
            grads: &B::Gradients,
        ) -> Tensor<B::InnerBackend, D> {
            t.grad(grads).unwrap_or_else(|| t.inner().zeros_like())
        }
        for (k, layer) in self.layers.iter().enumerate() {
            state.insert_tensor(format!("{prefix}.linear.{k}.weight"), grad_or_zero(layer.weight.val(), grads))?;
            if let Some(bias) = &layer.bias {
                state.insert_tensor(format!("{prefix}.linear.{k}.bias"), grad_or_zero(bias.val(), grads))?;
            }
        }
        if let Some(scale) = &self.scale {
            state.insert_tensor(format!("{prefix}.scale"), grad_or_zero(scale.val(), grads))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::Distribution;
    use burn_ndarray::NdArray;

    type B = NdArray<f32>;

    #[test]
    fn shapes_and_zero_init() {
        let device = Default::default();
        let x = Tensor::<B, 2>::random([5, 3], Distribution::Normal(0.0, 1.0), &device);

        let t = MlpConfig::translation(vec![8, 8]).init::<B>(3, 2, &device).unwrap();
        assert_eq!(t.forward(x.clone()).dims(), [5, 2]);
        assert!(!t.is_bounded());

        let z = MlpConfig::translation(vec![4])
            .with_zero_init(true)
            .init::<B>(3, 2, &device)
            .unwrap();
        let out = z.forward(x).into_data().to_vec::<f32>().unwrap();
        assert!(out.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn scale_network_starts_at_zero_and_stays_bounded() {
        let device = Default::default();
        let s = MlpConfig::scale(vec![16]).init::<B>(2, 2, &device).unwrap();
        assert!(s.is_bounded());
        let x = Tensor::<B, 2>::random([7, 2], Distribution::Normal(0.0, 100.0), &device);
        let out = s.forward(x).into_data().to_vec::<f32>().unwrap();
        assert!(out.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn scalable_tanh_is_bounded_by_its_scale() {
        let device = Default::default();
        let s = MlpConfig::scale(vec![16])
            .with_tanh_scale_init(0.5)
            .init::<B>(3, 3, &device)
            .unwrap();
        let x = Tensor::<B, 2>::random([64, 3], Distribution::Normal(0.0, 100.0), &device);
        let out = s.forward(x).into_data().to_vec::<f32>().unwrap();
        assert!(out.iter().all(|&v| v.abs() <= 0.5 + 1e-6));
        assert!(out.iter().any(|&v| v != 0.0));
    }

    #[test]
    fn elu_matches_definition() {
        let device = Default::default();
        let x = Tensor::<B, 1>::from_floats([-2.0, -0.5, 0.0, 1.5], &device);
        let y = Activation::Elu.apply(x).into_data().to_vec::<f32>().unwrap();
        let expected = [(-2.0f32).exp() - 1.0, (-0.5f32).exp() - 1.0, 0.0, 1.5];
        for (a, b) in y.iter().zip(expected.iter()) {
            assert!((a - b).abs() < 1e-6, "{a} vs {b}");
        }
    }

    #[test]
    fn empty_dimensions_are_rejected() {
        let device = Default::default();
        assert!(MlpConfig::scale(vec![4]).init::<B>(0, 2, &device).is_err());
        assert!(MlpConfig::scale(vec![0]).init::<B>(2, 2, &device).is_err());
    }
}
