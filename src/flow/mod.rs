//! Composed flows.
//!
//! A [`Flow`] is a bijection on `[batch, nvars]` rows together with its base distribution.
//! Two topologies are provided, both built from [`RealNvp`](crate::RealNvp) layers applied
//! to every `2^d` block of a periodic lattice at once:
//!
//! - [`Tebd`]: a flat brick-wall stack; layer `i` runs at step `i`.
//! - [`Mera`]: a multi-scale stack of `2·log2(L)·nrepeat` steps, fine to coarse, where the
//!   step → layer assignment is a [`LayerMap`] and may reuse one layer at many steps.
//!
//! [`Symmetrized`] wraps a MERA and averages its density over a group of signed site
//! permutations (e.g. `x → -x` for Ising).
//!
//! The log-determinant of the composition is the sum of the per-step log-determinants, and it
//! is returned with every output, never stored.

mod hierarchy;
mod mera;
mod symmetric;
mod tebd;

use burn_core as burn;

use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::prior::Gaussian;
use crate::state::StateDict;
use crate::{Error, Result};

pub use mera::{mera_init, Mera, MeraConfig};
pub use symmetric::{symmetric_mera_init, Symmetrized, Symmetry};
pub use tebd::Tebd;

/// What a training loop or sampler needs from a flow.
///
/// `forward` maps data → latent (density evaluation), `inverse` maps latent → data (sampling).
/// Both return `(output, logdet)` with `logdet: [batch]` the log-determinant of the map that
/// was applied, so `forward` and `inverse` log-determinants of matching rows sum to zero.
pub trait Flow<B: Backend> {
    /// Used by callers to name checkpoints.
    fn name(&self) -> &str;

    fn prior(&self) -> &Gaussian;

    fn nvars(&self) -> usize {
        self.prior().nvars()
    }

    fn device(&self) -> B::Device;

    fn forward(&self, x: Tensor<B, 2>) -> Result<(Tensor<B, 2>, Tensor<B, 1>)>;

    fn inverse(&self, z: Tensor<B, 2>) -> Result<(Tensor<B, 2>, Tensor<B, 1>)>;

    /// Draw `x = inverse(z)` with `z` from the prior, returning `(x, log q(x))`.
    fn sample<R: Rng + ?Sized>(
        &self,
        batch_size: usize,
        rng: &mut R,
    ) -> Result<(Tensor<B, 2>, Tensor<B, 1>)> {
        let z = self.prior().sample::<B, R>(batch_size, &self.device(), rng)?;
        let log_pz = self.prior().log_probability(z.clone())?;
        let (x, logdet) = self.inverse(z)?;
        Ok((x, log_pz - logdet))
    }

    /// `log q(x) = log p_Z(forward(x)) + logdet_forward`.
    fn log_probability(&self, x: Tensor<B, 2>) -> Result<Tensor<B, 1>> {
        let (z, logdet) = self.forward(x)?;
        Ok(self.prior().log_probability(z)? + logdet)
    }

    /// Snapshot every parameter (and the topology it belongs to).
    fn save(&self) -> Result<StateDict>;

    /// Restore a snapshot into this (identically constructed) flow.
    fn load(self, state: &StateDict) -> Result<Self>
    where
        Self: Sized;
}

/// Which layer runs at each logical step of a [`Mera`].
///
/// Steps are numbered fine to coarse: level `k`, repeat `r`, then shifted before aligned,
/// so step `2·(k·nrepeat + r) + parity` with `parity = 0` for the shifted step.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LayerMap {
    /// One layer per step.
    #[default]
    Distinct,
    /// One shifted/aligned pair per level, shared across repeats.
    PerLevel,
    /// One shifted/aligned pair for the whole hierarchy.
    Shared,
    /// Explicit layer index for every step.
    Explicit(Vec<usize>),
}

impl LayerMap {
    /// Layer count this map expects (`None` for `Explicit`, which takes any count).
    pub fn layers_required(&self, levels: usize, nrepeat: usize) -> Option<usize> {
        match self {
            LayerMap::Distinct => Some(2 * levels * nrepeat),
            LayerMap::PerLevel => Some(2 * levels),
            LayerMap::Shared => Some(2),
            LayerMap::Explicit(_) => None,
        }
    }

    /// Resolve to one layer index per step, checked against `nlayers`.
    pub fn resolve(&self, levels: usize, nrepeat: usize, nlayers: usize) -> Result<Vec<usize>> {
        let nsteps = 2 * levels * nrepeat;
        if let Some(required) = self.layers_required(levels, nrepeat) {
            if nlayers != required {
                return Err(Error::Construction(format!(
                    "{self:?} layer map needs {required} layers, got {nlayers}"
                )));
            }
        }
        let map: Vec<usize> = match self {
            LayerMap::Distinct => (0..nsteps).collect(),
            LayerMap::PerLevel => (0..nsteps).map(|s| 2 * (s / (2 * nrepeat)) + s % 2).collect(),
            LayerMap::Shared => (0..nsteps).map(|s| s % 2).collect(),
            LayerMap::Explicit(v) => v.clone(),
        };
        if map.len() != nsteps {
            return Err(Error::Construction(format!(
                "layer map has {} entries for {nsteps} steps",
                map.len()
            )));
        }
        if let Some(&bad) = map.iter().find(|&&j| j >= nlayers) {
            return Err(Error::Construction(format!(
                "layer map refers to layer {bad}, only {nlayers} layers given"
            )));
        }
        if let Some(unused) = (0..nlayers).find(|j| !map.contains(j)) {
            return Err(Error::Construction(format!("layer {unused} is never used")));
        }
        Ok(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layer_maps_resolve_fine_to_coarse() {
        assert_eq!(LayerMap::Distinct.resolve(2, 1, 4).unwrap(), vec![0, 1, 2, 3]);
        assert_eq!(
            LayerMap::PerLevel.resolve(2, 2, 4).unwrap(),
            vec![0, 1, 0, 1, 2, 3, 2, 3]
        );
        assert_eq!(LayerMap::Shared.resolve(3, 1, 2).unwrap(), vec![0, 1, 0, 1, 0, 1]);
    }

    #[test]
    fn layer_maps_reject_bad_counts_and_indices() {
        assert!(LayerMap::Distinct.resolve(3, 1, 5).is_err());
        assert!(LayerMap::Explicit(vec![0, 1, 2]).resolve(1, 1, 3).is_err());
        assert!(LayerMap::Explicit(vec![0, 3]).resolve(1, 1, 2).is_err());
        // Layer 2 would carry parameters nobody trains.
        assert!(LayerMap::Explicit(vec![0, 1]).resolve(1, 1, 3).is_err());
        assert_eq!(LayerMap::Explicit(vec![1, 0]).resolve(1, 1, 2).unwrap(), vec![1, 0]);
    }
}
