//! RealNVP coupling layer.
//!
//! One layer owns a list of masks in complementary pairs and one `(S, T)` network pair per mask.
//! Mask step `i` updates its active sites conditioned on its frozen sites:
//!
//! \[
//! y_A = x_A \odot e^{S_i(x_F)} + T_i(x_F), \qquad y_F = x_F,
//! \qquad \log|\det J| = \textstyle\sum_A S_i(x_F).
//! \]
//!
//! The Jacobian of each step is triangular, so the log-determinant is exact. Two complementary
//! steps update every site once; the default layer has exactly one such pair.
//!
//! Convention (see crate docs): `forward` is the map above (data → latent), `inverse` undoes it.
//! Sites are gathered with index lists rather than multiplied by a `{0,1}` mask, so a frozen site
//! is never touched by arithmetic.

use burn_core as burn;

use burn::module::{Ignored, Module};
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::mask::{index_tensor, mask_pairs, Mask, Partition};
use crate::mlp::{Mlp, MlpConfig};
use crate::state::StateDict;
use crate::{Error, Result};

/// Architecture of one coupling layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealNvpConfig {
    /// Number of mask steps (even, >= 2).
    pub nlayers: usize,
    pub s_net: MlpConfig,
    pub t_net: MlpConfig,
}

impl Default for RealNvpConfig {
    fn default() -> Self {
        Self {
            nlayers: 2,
            s_net: MlpConfig::scale(vec![32, 32]),
            t_net: MlpConfig::translation(vec![32, 32]),
        }
    }
}

impl RealNvpConfig {
    /// Build a layer for a block of shape `block`, with random complementary mask pairs.
    pub fn init<B: Backend, R: Rng + ?Sized>(
        &self,
        block: &[usize],
        rng: &mut R,
        device: &B::Device,
    ) -> Result<RealNvp<B>> {
        let masks = mask_pairs(block, self.nlayers, rng)?;
        self.init_with_masks(masks, device)
    }

    /// Build a layer with caller-chosen masks.
    pub fn init_with_masks<B: Backend>(&self, masks: Vec<Mask>, device: &B::Device) -> Result<RealNvp<B>> {
        let mut s_nets = Vec::with_capacity(masks.len());
        let mut t_nets = Vec::with_capacity(masks.len());
        for m in &masks {
            s_nets.push(self.s_net.init(m.n_frozen(), m.n_active(), device)?);
            t_nets.push(self.t_net.init(m.n_frozen(), m.n_active(), device)?);
        }
        RealNvp::new(masks, s_nets, t_nets)
    }
}

/// A mask together with its gather/scatter plan.
#[derive(Debug, Clone)]
pub struct MaskStep {
    mask: Mask,
    partition: Partition,
}

/// An invertible coupling layer on rows of `block_len` variables.
#[derive(Module, Debug)]
pub struct RealNvp<B: Backend> {
    s_nets: Vec<Mlp<B>>,
    t_nets: Vec<Mlp<B>>,
    steps: Ignored<Vec<MaskStep>>,
    block_len: usize,
}

impl<B: Backend> RealNvp<B> {
    /// Assemble a layer, validating the masks and the network shapes.
    ///
    /// Masks must share one shape and come in complementary pairs; `s_nets[i]` and `t_nets[i]`
    /// must map `masks[i].n_frozen()` inputs to `masks[i].n_active()` outputs, and every scale
    /// network must have a bounded output.
    pub fn new(masks: Vec<Mask>, s_nets: Vec<Mlp<B>>, t_nets: Vec<Mlp<B>>) -> Result<Self> {
        if masks.is_empty() || masks.len() % 2 != 0 {
            return Err(Error::Construction(format!(
                "a coupling layer needs an even, non-zero number of masks, got {}",
                masks.len()
            )));
        }
        if s_nets.len() != masks.len() || t_nets.len() != masks.len() {
            return Err(Error::Construction(format!(
                "{} masks but {} scale and {} translation networks",
                masks.len(),
                s_nets.len(),
                t_nets.len()
            )));
        }
        let shape = masks[0].shape().to_vec();
        if masks.iter().any(|m| m.shape() != shape.as_slice()) {
            return Err(Error::Construction("all masks of a layer must share one shape".into()));
        }
        for (k, pair) in masks.chunks(2).enumerate() {
            if !pair[0].is_complement_of(&pair[1]) {
                return Err(Error::Construction(format!(
                    "masks {} and {} are not complementary",
                    2 * k,
                    2 * k + 1
                )));
            }
        }
        for (i, m) in masks.iter().enumerate() {
            let (nf, na) = (m.n_frozen(), m.n_active());
            for (kind, net) in [("scale", &s_nets[i]), ("translation", &t_nets[i])] {
                if net.d_in() != nf || net.d_out() != na {
                    return Err(Error::Construction(format!(
                        "{kind} network {i} maps {} -> {}, mask needs {nf} -> {na}",
                        net.d_in(),
                        net.d_out()
                    )));
                }
            }
            if !s_nets[i].is_bounded() {
                return Err(Error::Construction(format!(
                    "scale network {i} has an unbounded output"
                )));
            }
        }

        let block_len = masks[0].len();
        let steps = masks
            .into_iter()
            .map(|mask| {
                let partition = mask.partition();
                MaskStep { mask, partition }
            })
            .collect();
        Ok(Self {
            s_nets,
            t_nets,
            steps: Ignored(steps),
            block_len,
        })
    }

    /// Number of variables in one block.
    pub fn block_len(&self) -> usize {
        self.block_len
    }

    pub fn block_shape(&self) -> &[usize] {
        self.steps.0[0].mask.shape()
    }

    pub fn masks(&self) -> impl Iterator<Item = &Mask> {
        self.steps.0.iter().map(|s| &s.mask)
    }

    pub fn device(&self) -> B::Device {
        self.s_nets[0].device()
    }

    /// `x: [n, block_len] -> (y, logdet: [n])`.
    pub fn forward(&self, x: Tensor<B, 2>) -> Result<(Tensor<B, 2>, Tensor<B, 1>)> {
        self.check_width(&x)?;
        let [n, _] = x.dims();
        let device = x.device();
        let mut y = x;
        let mut logdet = Tensor::<B, 1>::zeros([n], &device);
        for (i, step) in self.steps.0.iter().enumerate() {
            let (frozen, active) = split(y, &step.partition, &device);
            let s = self.s_nets[i].forward(frozen.clone());
            let t = self.t_nets[i].forward(frozen.clone());
            let active = active * s.clone().exp() + t;
            logdet = logdet + s.sum_dim(1).reshape([n]);
            y = merge(frozen, active, &step.partition, &device);
        }
        Ok((y, logdet))
    }

    /// `y: [n, block_len] -> (x, logdet: [n])`, with `logdet` the negated forward value.
    pub fn inverse(&self, y: Tensor<B, 2>) -> Result<(Tensor<B, 2>, Tensor<B, 1>)> {
        self.check_width(&y)?;
        let [n, _] = y.dims();
        let device = y.device();
        let mut x = y;
        let mut logdet = Tensor::<B, 1>::zeros([n], &device);
        for (i, step) in self.steps.0.iter().enumerate().rev() {
            let (frozen, active) = split(x, &step.partition, &device);
            let s = self.s_nets[i].forward(frozen.clone());
            let t = self.t_nets[i].forward(frozen.clone());
            let active = (active - t) * s.clone().neg().exp();
            logdet = logdet - s.sum_dim(1).reshape([n]);
            x = merge(frozen, active, &step.partition, &device);
        }
        Ok((x, logdet))
    }

    fn check_width(&self, x: &Tensor<B, 2>) -> Result<()> {
        if x.dims()[1] != self.block_len {
            return Err(Error::Shape("coupling input width must equal the block size"));
        }
        Ok(())
    }

    pub(crate) fn export(&self, prefix: &str, state: &mut StateDict) -> Result<()> {
        for (i, step) in self.steps.0.iter().enumerate() {
            state.insert_values(
                format!("{prefix}.mask.{i}"),
                step.mask.shape().to_vec(),
                step.mask.to_values(),
            );
            self.s_nets[i].export(&format!("{prefix}.s.{i}"), state)?;
            self.t_nets[i].export(&format!("{prefix}.t.{i}"), state)?;
        }
        Ok(())
    }

    pub(crate) fn import(self, prefix: &str, state: &mut StateDict) -> Result<Self> {
        let Self {
            s_nets,
            t_nets,
            steps,
            block_len,
        } = self;
        for (i, step) in steps.0.iter().enumerate() {
            state.take_exact(&format!("{prefix}.mask.{i}"), step.mask.shape(), &step.mask.to_values())?;
        }
        let s_nets = s_nets
            .into_iter()
            .enumerate()
            .map(|(i, net)| net.import(&format!("{prefix}.s.{i}"), state))
            .collect::<Result<Vec<_>>>()?;
        let t_nets = t_nets
            .into_iter()
            .enumerate()
            .map(|(i, net)| net.import(&format!("{prefix}.t.{i}"), state))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            s_nets,
            t_nets,
            steps,
            block_len,
        })
    }
}

#[cfg(test)]
impl<B: burn::tensor::backend::AutodiffBackend> RealNvp<B> {
    pub(crate) fn export_grads(&self, prefix: &str, grads: &B::Gradients, state: &mut StateDict) -> Result<()> {
        for i in 0..self.steps.0.len() {
            self.s_nets[i].export_grads(&format!("{prefix}.s.{i}"), grads, state)?;
            self.t_nets[i].export_grads(&format!("{prefix}.t.{i}"), grads, state)?;
        }
        Ok(())
    }
}

fn split<B: Backend>(
    x: Tensor<B, 2>,
    partition: &Partition,
    device: &B::Device,
) -> (Tensor<B, 2>, Tensor<B, 2>) {
    let frozen = x.clone().select(1, index_tensor::<B>(&partition.frozen, device));
    let active = x.select(1, index_tensor::<B>(&partition.active, device));
    (frozen, active)
}

fn merge<B: Backend>(
    frozen: Tensor<B, 2>,
    active: Tensor<B, 2>,
    partition: &Partition,
    device: &B::Device,
) -> Tensor<B, 2> {
    // `active` always carries a graph node; burn-autodiff's cat backward misroutes gradients
    // when an untracked operand comes first.
    Tensor::cat(vec![active, frozen], 1).select(1, index_tensor::<B>(&partition.restore, device))
}
