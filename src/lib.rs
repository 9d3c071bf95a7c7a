//! # rgflow
//!
//! Exactly invertible RealNVP flows on periodic lattices, plus an HMC sampler to check them.
//!
//! This crate is intentionally small:
//!
//! - it implements the **coupling layer**, two ways of **composing** coupling layers over a lattice
//!   (a flat brick-wall stack, `Tebd`, and a multi-scale stack with layer reuse, `Mera`),
//!   a factorized Gaussian **prior**, and **HMC** on an arbitrary differentiable potential,
//! - it uses `burn` as the differentiable tensor substrate; everything is generic over the backend,
//! - it does not write files or parse command lines (checkpoints are handed to the caller as
//!   [`state::StateDict`] values).
//!
//! ## Public invariants (must not change)
//!
//! - **One direction convention**: `forward` maps data → latent and is used for density
//!   evaluation; `inverse` maps latent → data and is used for sampling.
//! - **Log-determinants are return values**, never cached on the flow: every transform returns
//!   `(output, logdet)` with `logdet` shaped `[batch]`.
//! - **Determinism knobs are explicit**: every stochastic call takes an RNG from the caller.
//! - **Structural errors are fatal, numerical ones are local**: malformed masks, lattices, or
//!   checkpoints return [`Error`]; a non-finite HMC proposal only rejects its own chain.
//!
//! ## Change of variables
//!
//! With \(z = f(x)\) the forward map and \(p_Z\) the prior,
//! \[
//! \log q(x) = \log p_Z(f(x)) + \log\left|\det \tfrac{\partial f}{\partial x}\right|,
//! \]
//! and sampling uses \(x = f^{-1}(z)\), \(\log q(x) = \log p_Z(z) - \log|\det \partial f^{-1}/\partial z|\).
//!
//! ## References (conceptual anchors)
//!
//! - Dinh, Sohl-Dickstein, Bengio, *Density estimation using Real NVP* (arXiv:1605.08803).
//! - Li, Wang, *Neural Network Renormalization Group* (arXiv:1802.02840): MERA-shaped flows
//!   for lattice field theory and latent-space HMC.
//! - Neal, *MCMC using Hamiltonian dynamics* (arXiv:1206.1901).
//!
//! ## Module map
//!
//! - `mask`: binary partitions of a block and their generators
//! - `mlp`: scale / translation networks
//! - `coupling`: the RealNVP coupling layer (`RealNvp`)
//! - `lattice`: periodic hypercubic lattices and block dispatch plans
//! - `flow`: the `Flow` trait, `Tebd`, `Mera` and the group-averaged `Symmetrized`
//! - `prior`: factorized Gaussian base distribution
//! - `target`: the `EnergyModel` interface and a continuous Ising model
//! - `hmc`: leapfrog integrator and batched HMC with per-chain acceptance
//! - `state`: serializable parameter snapshots
//! - `train`: reverse-KL training loop with HMC diagnostics

pub mod coupling;
pub mod flow;
pub mod hmc;
pub mod lattice;
pub mod mask;
pub mod mlp;
pub mod prior;
pub mod state;
pub mod target;
pub mod train;

use burn_core as burn;

use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use burn_autodiff::Autodiff;
use burn_ndarray::NdArray;

pub use coupling::{RealNvp, RealNvpConfig};
pub use flow::{
    mera_init, symmetric_mera_init, Flow, LayerMap, Mera, MeraConfig, Symmetrized, Symmetry, Tebd,
};
pub use hmc::{hmc, hmc_with_accept, AcceptanceStats, HmcConfig, HmcOutput};
pub use mask::Mask;
pub use prior::Gaussian;
pub use state::StateDict;
pub use target::{EnergyModel, Ising};
pub use train::{learn, StepDecay, TrainConfig, TrainingRecord};

/// Default burn backend: ndarray + autodiff.
pub type BurnBackend = Autodiff<NdArray<f32>>;

/// rgflow error variants.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("shape mismatch: {0}")]
    Shape(&'static str),
    #[error("domain error: {0}")]
    Domain(&'static str),
    #[error("construction error: {0}")]
    Construction(String),
    #[error("topology mismatch: {0}")]
    TopologyMismatch(String),
    #[error("tensor read-back failed: {0}")]
    Tensor(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Copy a tensor back to the host as `f64`s.
pub(crate) fn host_values<B: Backend, const D: usize>(t: Tensor<B, D>) -> Result<Vec<f64>> {
    let v = t
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| Error::Tensor(format!("{e:?}")))?;
    Ok(v.into_iter().map(f64::from).collect())
}
