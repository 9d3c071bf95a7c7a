//! Multi-scale (MERA-shaped) stack.
//!
//! For `L = 2^K`, level `k ∈ 0..K` works on the sub-lattice of sites whose coordinates are all
//! multiples of `2^k`, in blocks of dilation `2^k`. Each level runs `nrepeat` times a shifted
//! step (disentangler, origins at `2^k`) followed by an aligned step (decimator, origins at 0).
//! The aligned blocks' origins are exactly the sites of level `k + 1`, so in the forward
//! direction the coarse degrees of freedom are handed up the hierarchy while the other sites
//! of a block are left behind as fine-scale latents.
//!
//! Which layer runs at which step is a [`LayerMap`]; with anything other than
//! [`LayerMap::Distinct`] the same weights act at several scales.

use burn_core as burn;

use burn::module::Module;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use super::hierarchy::{Hierarchy, Placement};
use super::{Flow, LayerMap};
use crate::coupling::{RealNvp, RealNvpConfig};
use crate::lattice::Lattice;
use crate::prior::Gaussian;
use crate::state::StateDict;
use crate::{Error, Result};

#[derive(Module, Debug)]
pub struct Mera<B: Backend> {
    inner: Hierarchy<B>,
    nrepeat: usize,
}

impl<B: Backend> Mera<B> {
    /// Assemble a hierarchy; `layers.len()` must agree with `layer_map`.
    ///
    /// Fails with [`Error::Construction`] if the lattice length is not a power of two, if
    /// `nrepeat == 0`, or if a layer's block shape is not `[2; d]`.
    pub fn new(
        lattice: Lattice,
        prior: Gaussian,
        layers: Vec<RealNvp<B>>,
        nrepeat: usize,
        layer_map: &LayerMap,
    ) -> Result<Self> {
        let levels = lattice.levels().ok_or_else(|| {
            Error::Construction(format!(
                "lattice length {} is not a power of two",
                lattice.length()
            ))
        })?;
        if nrepeat == 0 {
            return Err(Error::Construction("nrepeat must be >= 1".into()));
        }
        let map = layer_map.resolve(levels, nrepeat, layers.len())?;

        let mut plan = Vec::with_capacity(map.len());
        for k in 0..levels {
            let dilation = 1 << k;
            for r in 0..nrepeat {
                let s = 2 * (k * nrepeat + r);
                plan.push(Placement { layer: map[s], dilation, offset: dilation });
                plan.push(Placement { layer: map[s + 1], dilation, offset: 0 });
            }
        }
        let inner = Hierarchy::new("MERA".into(), lattice, prior, layers, &plan)?;
        Ok(Self { inner, nrepeat })
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.inner.set_name(name.into());
        self
    }

    pub fn nrepeat(&self) -> usize {
        self.nrepeat
    }

    /// Number of coarse-graining levels, `log2(L)`.
    pub fn levels(&self) -> usize {
        self.inner.lattice().length().trailing_zeros() as usize
    }

    pub fn lattice(&self) -> Lattice {
        self.inner.lattice()
    }

    pub fn layers(&self) -> &[RealNvp<B>] {
        self.inner.layers()
    }

    /// Layer index used at each step, in forward order.
    pub fn step_layers(&self) -> Vec<usize> {
        self.inner.step_layers()
    }
}

impl<B: Backend> Flow<B> for Mera<B> {
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
            nrepeat: self.nrepeat,
        })
    }
}

/// Everything needed to build a [`Mera`] from scratch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeraConfig {
    pub length: usize,
    pub dim: usize,
    pub nrepeat: usize,
    pub layer_map: LayerMap,
    pub coupling: RealNvpConfig,
    /// Prior standard deviation.
    pub sigma: f32,
    /// Seed for the random mask pairs.
    pub seed: u64,
}

impl Default for MeraConfig {
    fn default() -> Self {
        Self {
            length: 8,
            dim: 1,
            nrepeat: 1,
            layer_map: LayerMap::Distinct,
            coupling: RealNvpConfig::default(),
            sigma: 1.0,
            seed: 0,
        }
    }
}

/// Build a [`Mera`] with freshly initialised layers, as many as `cfg.layer_map` needs.
pub fn mera_init<B: Backend>(cfg: &MeraConfig, device: &B::Device) -> Result<Mera<B>> {
    let lattice = Lattice::new(cfg.length, cfg.dim)?;
    let levels = lattice.levels().ok_or_else(|| {
        Error::Construction(format!("lattice length {} is not a power of two", cfg.length))
    })?;
    let nlayers = match &cfg.layer_map {
        LayerMap::Explicit(map) => map.iter().max().map_or(0, |&m| m + 1),
        other => other.layers_required(levels, cfg.nrepeat).unwrap_or(0),
    };
    let mut rng = ChaCha8Rng::seed_from_u64(cfg.seed);
    let block = lattice.block_shape();
    let layers = (0..nlayers)
        .map(|_| cfg.coupling.init::<B, _>(&block, &mut rng, device))
        .collect::<Result<Vec<_>>>()?;
    let prior = Gaussian::with_sigma(lattice.shape(), cfg.sigma)?;
    Mera::new(lattice, prior, layers, cfg.nrepeat, &cfg.layer_map)
}
