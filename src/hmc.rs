//! Batched Hamiltonian Monte Carlo.
//!
//! Every row of the position batch is an independent chain. One iteration draws momenta
//! `p ~ N(0, I)`, runs `leapfrog_steps` leapfrog steps of size `step_size` on the potential
//! `U`, and accepts row `i` with probability `min(1, exp(H₀ᵢ - H₁ᵢ))`, `H = U(q) + ½|p|²`.
//!
//! Gradients of `U` come from a private autodiff pass: positions are re-wrapped as fresh leaves
//! from the inner (non-autodiff) backend, `backward` is called on `ΣU`, and the resulting
//! gradient container is dropped before the next step. Nothing is accumulated into any
//! enclosing training step, even when `U` evaluates a trainable flow.
//!
//! A proposal whose Hamiltonian is not finite is rejected for its own row only; the other
//! chains are unaffected. If every chain rejects every measured proposal the run still
//! succeeds and reports an acceptance of zero.

use burn_core as burn;

use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::{Bool, Tensor, TensorData};
use rand::distr::{Distribution, StandardUniform};
use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{host_values, Error, Result};

type Inner<B> = <B as AutodiffBackend>::InnerBackend;

/// Iteration counts and integrator settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HmcConfig {
    /// Burn-in iterations; their acceptance is reported separately.
    pub thermalize: usize,
    /// Measured iterations.
    pub measure: usize,
    pub leapfrog_steps: usize,
    pub step_size: f64,
}

impl Default for HmcConfig {
    fn default() -> Self {
        Self {
            thermalize: 10,
            measure: 10,
            leapfrog_steps: 10,
            step_size: 0.2,
        }
    }
}

impl HmcConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.step_size.is_finite() && self.step_size > 0.0) {
            return Err(Error::Domain("step_size must be finite and > 0"));
        }
        if self.leapfrog_steps == 0 {
            return Err(Error::Domain("leapfrog_steps must be >= 1"));
        }
        if self.measure == 0 {
            return Err(Error::Domain("measure must be >= 1"));
        }
        Ok(())
    }
}

/// Accepted fraction per chain over a phase.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AcceptanceStats {
    pub per_chain: Vec<f64>,
    pub iterations: usize,
}

impl AcceptanceStats {
    fn new(chains: usize) -> Self {
        Self {
            per_chain: vec![0.0; chains],
            iterations: 0,
        }
    }

    fn record(&mut self, accepted: &[bool]) {
        for (acc, &a) in self.per_chain.iter_mut().zip(accepted) {
            if a {
                *acc += 1.0;
            }
        }
        self.iterations += 1;
    }

    fn finish(mut self) -> Self {
        if self.iterations > 0 {
            let n = self.iterations as f64;
            self.per_chain.iter_mut().for_each(|a| *a /= n);
        }
        self
    }

    /// Mean over chains (0 for an empty phase).
    pub fn mean(&self) -> f64 {
        if self.per_chain.is_empty() {
            return 0.0;
        }
        self.per_chain.iter().sum::<f64>() / self.per_chain.len() as f64
    }
}

#[derive(Debug, Clone)]
pub struct HmcOutput<B: Backend> {
    /// Final positions (detached).
    pub x: Tensor<B, 2>,
    pub thermalize: AcceptanceStats,
    pub measure: AcceptanceStats,
}

impl<B: Backend> HmcOutput<B> {
    /// Mean acceptance over the measured iterations.
    pub fn accept_ratio(&self) -> f64 {
        self.measure.mean()
    }
}

#[inline]
fn metropolis_accept(log_accept: f64, u: f64) -> bool {
    // NaN compares false, so non-finite Hamiltonians reject.
    log_accept.is_finite() && u.ln() < log_accept
}

/// Position, cached potential and its gradient, all on the inner backend.
struct Phase<I: Backend> {
    q: Tensor<I, 2>,
    u: Tensor<I, 1>,
    grad: Tensor<I, 2>,
}

fn potential_and_grad<B, F>(potential: &F, q: Tensor<Inner<B>, 2>) -> Result<Phase<Inner<B>>>
where
    B: AutodiffBackend,
    F: Fn(Tensor<B, 2>) -> Result<Tensor<B, 1>>,
{
    let x = Tensor::<B, 2>::from_inner(q.clone()).require_grad();
    let u = potential(x.clone())?;
    if u.dims()[0] != q.dims()[0] {
        return Err(Error::Shape("potential must return one value per row"));
    }
    let grads = u.clone().sum().backward();
    let grad = x.grad(&grads).unwrap_or_else(|| q.zeros_like());
    Ok(Phase {
        q,
        u: u.inner(),
        grad,
    })
}

/// One leapfrog trajectory from `(start, p)`; returns the end point and final momentum.
fn leapfrog<B, F>(
    potential: &F,
    start: &Phase<Inner<B>>,
    p: Tensor<Inner<B>, 2>,
    steps: usize,
    eps: f64,
) -> Result<(Phase<Inner<B>>, Tensor<Inner<B>, 2>)>
where
    B: AutodiffBackend,
    F: Fn(Tensor<B, 2>) -> Result<Tensor<B, 1>>,
{
    let mut p = p - start.grad.clone().mul_scalar(0.5 * eps);
    let mut q = start.q.clone();
    let mut phase = None;
    for i in 0..steps {
        q = q + p.clone().mul_scalar(eps);
        let next = potential_and_grad::<B, F>(potential, q.clone())?;
        if i + 1 < steps {
            p = p - next.grad.clone().mul_scalar(eps);
        }
        phase = Some(next);
    }
    let end = phase.ok_or(Error::Domain("leapfrog_steps must be >= 1"))?;
    let p = p - end.grad.clone().mul_scalar(0.5 * eps);
    Ok((end, p))
}

fn hamiltonian<I: Backend>(u: Tensor<I, 1>, p: Tensor<I, 2>) -> Result<Vec<f64>> {
    let [n, _] = p.dims();
    let h = u + p.powf_scalar(2.0).sum_dim(1).reshape([n]).mul_scalar(0.5);
    host_values(h)
}

fn normals<I: Backend, R: Rng + ?Sized>(shape: [usize; 2], device: &I::Device, rng: &mut R) -> Tensor<I, 2> {
    let v: Vec<f32> = (0..shape[0] * shape[1])
        .map(|_| StandardNormal.sample(&mut *rng))
        .collect();
    Tensor::from_data(TensorData::new(v, shape).convert::<I::FloatElem>(), device)
}

/// Run `cfg.thermalize` burn-in and `cfg.measure` measured iterations from `x0`.
///
/// `potential` maps `[batch, d]` positions to `[batch]` potentials `U` (the negative
/// log-density). It is evaluated on fresh autodiff leaves, so it may close over trainable
/// modules.
pub fn hmc<B, F, R>(potential: F, x0: Tensor<B, 2>, cfg: &HmcConfig, rng: &mut R) -> Result<HmcOutput<B>>
where
    B: AutodiffBackend,
    F: Fn(Tensor<B, 2>) -> Result<Tensor<B, 1>>,
    R: Rng + ?Sized,
{
    cfg.validate()?;
    let [chains, dim] = x0.dims();
    if chains == 0 || dim == 0 {
        return Err(Error::Shape("hmc needs a non-empty [batch, d] start"));
    }
    let device = x0.device();
    let inner_device = x0.clone().inner().device();

    let mut state = potential_and_grad::<B, F>(&potential, x0.detach().inner())?;
    let mut burn_in = AcceptanceStats::new(chains);
    let mut measured = AcceptanceStats::new(chains);

    for it in 0..cfg.thermalize + cfg.measure {
        let p0 = normals::<Inner<B>, R>([chains, dim], &inner_device, rng);
        let h0 = hamiltonian(state.u.clone(), p0.clone())?;
        let (proposal, p1) = leapfrog::<B, F>(&potential, &state, p0, cfg.leapfrog_steps, cfg.step_size)?;
        let h1 = hamiltonian(proposal.u.clone(), p1)?;

        let accepted: Vec<bool> = h0
            .iter()
            .zip(h1.iter())
            .map(|(&a, &b)| {
                let u: f64 = StandardUniform.sample(&mut *rng);
                metropolis_accept(a - b, u)
            })
            .collect();

        let row_mask = Tensor::<Inner<B>, 1, Bool>::from_data(
            TensorData::new(accepted.clone(), [chains]),
            &inner_device,
        );
        let mut cell = Vec::with_capacity(chains * dim);
        for &a in &accepted {
            cell.extend(std::iter::repeat(a).take(dim));
        }
        let cell_mask =
            Tensor::<Inner<B>, 2, Bool>::from_data(TensorData::new(cell, [chains, dim]), &inner_device);

        state = Phase {
            q: state.q.mask_where(cell_mask.clone(), proposal.q),
            u: state.u.mask_where(row_mask, proposal.u),
            grad: state.grad.mask_where(cell_mask, proposal.grad),
        };

        if it < cfg.thermalize {
            burn_in.record(&accepted);
        } else {
            measured.record(&accepted);
        }
    }

    let thermalize = burn_in.finish();
    let measure = measured.finish();
    debug!(
        chains,
        dim,
        thermalize = cfg.thermalize,
        measure = cfg.measure,
        burn_in_accept = thermalize.mean(),
        accept = measure.mean(),
        "hmc run finished"
    );
    if measure.per_chain.iter().all(|&a| a == 0.0) {
        warn!(chains, "every hmc chain rejected every measured proposal");
    }

    Ok(HmcOutput {
        x: Tensor::from_inner(state.q).to_device(&device),
        thermalize,
        measure,
    })
}

/// `n_thermalize` burn-in iterations followed by `n_thermalize` measured ones, each a
/// trajectory of `n_steps` leapfrog steps of size `epsilon`.
///
/// Returns the final positions and the mean measured acceptance.
pub fn hmc_with_accept<B, F, R>(
    potential: F,
    x0: Tensor<B, 2>,
    n_thermalize: usize,
    n_steps: usize,
    epsilon: f64,
    rng: &mut R,
) -> Result<(Tensor<B, 2>, f64)>
where
    B: AutodiffBackend,
    F: Fn(Tensor<B, 2>) -> Result<Tensor<B, 1>>,
    R: Rng + ?Sized,
{
    if n_thermalize == 0 {
        return Err(Error::Domain("n_thermalize must be >= 1"));
    }
    let cfg = HmcConfig {
        thermalize: n_thermalize,
        measure: n_thermalize,
        leapfrog_steps: n_steps,
        step_size: epsilon,
    };
    let out = hmc(potential, x0, &cfg, rng)?;
    let ratio = out.accept_ratio();
    Ok((out.x, ratio))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BurnBackend;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    type B = BurnBackend;

    fn half_square(x: Tensor<B, 2>) -> Result<Tensor<B, 1>> {
        let [n, _] = x.dims();
        Ok(x.powf_scalar(2.0).sum_dim(1).reshape([n]).mul_scalar(0.5))
    }

    #[test]
    fn config_validation() {
        assert!(HmcConfig::default().validate().is_ok());
        for bad in [
            HmcConfig { step_size: 0.0, ..HmcConfig::default() },
            HmcConfig { step_size: f64::NAN, ..HmcConfig::default() },
            HmcConfig { leapfrog_steps: 0, ..HmcConfig::default() },
            HmcConfig { measure: 0, ..HmcConfig::default() },
        ] {
            assert!(matches!(bad.validate(), Err(Error::Domain(_))));
        }
    }

    #[test]
    fn metropolis_rejects_non_finite() {
        assert!(metropolis_accept(0.5, 0.5));
        assert!(!metropolis_accept(-10.0, 0.5));
        assert!(!metropolis_accept(f64::NAN, 0.5));
        assert!(!metropolis_accept(f64::NEG_INFINITY, 0.5));
    }

    #[test]
    fn exact_integration_of_a_flat_potential_always_accepts() {
        let device = Default::default();
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let x0 = Tensor::<B, 2>::zeros([4, 3], &device);
        let flat = |x: Tensor<B, 2>| -> Result<Tensor<B, 1>> {
            let [n, _] = x.dims();
            Ok(x.sum_dim(1).reshape([n]).mul_scalar(0.0))
        };
        let cfg = HmcConfig { thermalize: 2, measure: 3, leapfrog_steps: 4, step_size: 0.1 };
        let out = hmc(flat, x0, &cfg, &mut rng).unwrap();
        assert_eq!(out.measure.iterations, 3);
        assert_eq!(out.thermalize.iterations, 2);
        assert!(out.measure.per_chain.iter().all(|&a| a == 1.0));
    }

    #[test]
    fn nan_rows_are_rejected_without_touching_other_chains() {
        let device = Default::default();
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        let x0 = Tensor::<B, 2>::from_floats([[0.5, 0.5], [-3.0, 0.0]], &device);
        // log(x0 + 2) is NaN once the first coordinate goes below -2.
        let potential = |x: Tensor<B, 2>| -> Result<Tensor<B, 1>> {
            let [n, _] = x.dims();
            let guard = x.clone().add_scalar(2.0).log().sum_dim(1).reshape([n]).mul_scalar(0.0);
            Ok(half_square(x)? + guard)
        };
        let cfg = HmcConfig { thermalize: 0, measure: 5, leapfrog_steps: 3, step_size: 0.1 };
        let out = hmc(potential, x0, &cfg, &mut rng).unwrap();
        assert_eq!(out.measure.per_chain[1], 0.0);
        assert!(out.measure.per_chain[0] > 0.0);
        let x = out.x.into_data().to_vec::<f32>().unwrap();
        assert_eq!(&x[2..], &[-3.0, 0.0]);
        assert!(x.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn all_chains_diverging_reports_zero_acceptance() {
        let device = Default::default();
        let mut rng = ChaCha8Rng::seed_from_u64(4);
        let x0 = Tensor::<B, 2>::ones([5, 3], &device);
        let nan = |x: Tensor<B, 2>| -> Result<Tensor<B, 1>> {
            let [n, _] = x.dims();
            Ok(x.neg().log().sum_dim(1).reshape([n]))
        };
        let cfg = HmcConfig { thermalize: 1, measure: 4, leapfrog_steps: 2, step_size: 0.1 };
        let out = hmc(nan, x0, &cfg, &mut rng).unwrap();
        assert_eq!(out.accept_ratio(), 0.0);
        assert_eq!(out.measure.iterations, 4);
        assert_eq!(out.x.into_data().to_vec::<f32>().unwrap(), vec![1.0; 15]);
    }

    #[test]
    fn hmc_with_accept_needs_a_positive_iteration_count() {
        let device = Default::default();
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let x0 = Tensor::<B, 2>::zeros([2, 2], &device);
        let err = hmc_with_accept(half_square, x0, 0, 5, 0.1, &mut rng).unwrap_err();
        assert!(matches!(err, Error::Domain(msg) if msg.contains("n_thermalize")));
    }

    #[test]
    fn seeded_runs_are_reproducible() {
        let device = Default::default();
        let x0 = Tensor::<B, 2>::ones([3, 2], &device);
        let run = |seed| {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            let (x, r) = hmc_with_accept(half_square, x0.clone(), 3, 5, 0.3, &mut rng).unwrap();
            (x.into_data().to_vec::<f32>().unwrap(), r)
        };
        assert_eq!(run(7), run(7));
    }
}
