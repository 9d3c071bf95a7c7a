//! Flat brick-wall stack.
//!
//! Round `r` applies layer `2r` to the aligned blocks (origins at even coordinates) and layer
//! `2r + 1` to the shifted blocks (origins at odd coordinates), so information crosses every
//! block boundary once per round. Layers are never reused.

use burn_core as burn;

use burn::module::Module;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use rand::Rng;

use super::hierarchy::{Hierarchy, Placement};
use super::Flow;
use crate::coupling::{RealNvp, RealNvpConfig};
use crate::lattice::Lattice;
use crate::prior::Gaussian;
use crate::state::StateDict;
use crate::{Error, Result};

#[derive(Module, Debug)]
pub struct Tebd<B: Backend> {
    inner: Hierarchy<B>,
    depth: usize,
}

impl<B: Backend> Tebd<B> {
    /// `layers.len()` must be `2 · depth`; the lattice length must be even.
    pub fn new(lattice: Lattice, prior: Gaussian, layers: Vec<RealNvp<B>>) -> Result<Self> {
        if layers.is_empty() || layers.len() % 2 != 0 {
            return Err(Error::Construction(format!(
                "a brick-wall stack needs an even, non-zero number of layers, got {}",
                layers.len()
            )));
        }
        if lattice.length() % 2 != 0 {
            return Err(Error::Construction(format!(
                "lattice length {} is odd; blocks of two do not tile it",
                lattice.length()
            )));
        }
        let depth = layers.len() / 2;
        let plan: Vec<Placement> = (0..depth)
            .flat_map(|r| {
                [
                    Placement { layer: 2 * r, dilation: 1, offset: 0 },
                    Placement { layer: 2 * r + 1, dilation: 1, offset: 1 },
                ]
            })
            .collect();
        let inner = Hierarchy::new("TEBD".into(), lattice, prior, layers, &plan)?;
        Ok(Self { inner, depth })
    }

    /// Fresh layers from `cfg` with random mask pairs, standard normal prior.
    pub fn init<R: Rng + ?Sized>(
        lattice: Lattice,
        depth: usize,
        cfg: &RealNvpConfig,
        rng: &mut R,
        device: &B::Device,
    ) -> Result<Self> {
        let block = lattice.block_shape();
        let layers = (0..2 * depth)
            .map(|_| cfg.init::<B, R>(&block, rng, device))
            .collect::<Result<Vec<_>>>()?;
        Self::new(lattice, Gaussian::new(lattice.shape())?, layers)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.inner.set_name(name.into());
        self
    }

    /// Number of brick-wall rounds.
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn lattice(&self) -> Lattice {
        self.inner.lattice()
    }

    pub fn layers(&self) -> &[RealNvp<B>] {
        self.inner.layers()
    }
}

impl<B: Backend> Flow<B> for Tebd<B> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn prior(&self) -> &Gaussian {
        self.inner.prior()
    }

    fn device(&self) -> B::Device {
        self.inner.device()
    }

    fn forward(&self, x: Tensor<B, 2>) -> Result<(Tensor<B, 2>, Tensor<B, 1>)> {
        self.inner.forward(x)
    }

    fn inverse(&self, z: Tensor<B, 2>) -> Result<(Tensor<B, 2>, Tensor<B, 1>)> {
        self.inner.inverse(z)
    }

    fn save(&self) -> Result<StateDict> {
        self.inner.save()
    }

    fn load(self, state: &StateDict) -> Result<Self> {
        Ok(Self {
            inner: self.inner.load(state)?,
            depth: self.depth,
        })
    }
}
