//! Reverse-KL training with HMC diagnostics.
//!
//! Each epoch draws a batch from the flow and minimizes
//!
//! \[
//! \mathcal L = \mathbb E_{x\sim q}[\log q(x)] - \mathbb E_{x\sim q}[\log p(x)],
//! \]
//!
//! which equals `KL(q ‖ p)` up to the unknown `log Z` of the target.
//!
//! Every `save_every` epochs (and at the last epoch) two persistent HMC chains are advanced:
//! one in latent space, with the flow as a change of variables, and one directly in data space.
//! Their acceptance ratios and the target observable (mean and standard error) are recorded.
//! The flow's snapshot is then handed to the caller's checkpoint sink. Writing it anywhere is
//! the caller's job.

use burn_core as burn;

use burn::module::AutodiffModule;
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::Tensor;
use burn_optim::decay::WeightDecayConfig;
use burn_optim::{AdamConfig, GradientsParams, Optimizer};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::flow::Flow;
use crate::hmc::{hmc, HmcConfig};
use crate::state::StateDict;
use crate::target::EnergyModel;
use crate::{host_values, Error, Result};

/// Multiply the learning rate by `gamma` every `step_size` epochs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StepDecay {
    pub step_size: usize,
    pub gamma: f64,
}

impl Default for StepDecay {
    fn default() -> Self {
        Self {
            step_size: 500,
            gamma: 0.7,
        }
    }
}

impl StepDecay {
    pub fn lr(&self, base: f64, epoch: usize) -> f64 {
        base * self.gamma.powi((epoch / self.step_size) as i32)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainConfig {
    pub batch_size: usize,
    pub epochs: usize,
    pub lr: f64,
    /// Adam L2 weight decay (0 disables).
    pub weight_decay: f64,
    pub lr_decay: Option<StepDecay>,
    /// Checkpoint (and diagnostics) period in epochs; 0 disables both.
    pub save_every: usize,
    /// HMC settings for the diagnostic chains; `None` skips them.
    pub hmc: Option<HmcConfig>,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            batch_size: 64,
            epochs: 100,
            lr: 1e-3,
            weight_decay: 1e-3,
            lr_decay: Some(StepDecay::default()),
            save_every: 10,
            hmc: Some(HmcConfig::default()),
        }
    }
}

impl TrainConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::Domain("batch_size must be >= 1"));
        }
        if !(self.lr.is_finite() && self.lr > 0.0) {
            return Err(Error::Domain("lr must be finite and > 0"));
        }
        if !(self.weight_decay.is_finite() && self.weight_decay >= 0.0) {
            return Err(Error::Domain("weight_decay must be finite and >= 0"));
        }
        if let Some(decay) = &self.lr_decay {
            if decay.step_size == 0 || !(decay.gamma > 0.0 && decay.gamma <= 1.0) {
                return Err(Error::Domain("lr_decay needs step_size >= 1 and gamma in (0, 1]"));
            }
        }
        if let Some(hmc) = &self.hmc {
            hmc.validate()?;
        }
        Ok(())
    }
}

/// Mean and standard error of an observable over a batch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Observable {
    pub mean: f64,
    pub stderr: f64,
}

impl Observable {
    /// Sample mean and `std / sqrt(n)` with the unbiased standard deviation.
    pub fn from_samples(values: &[f64]) -> Self {
        let n = values.len() as f64;
        if values.is_empty() {
            return Self { mean: f64::NAN, stderr: f64::NAN };
        }
        let mean = values.iter().sum::<f64>() / n;
        let var = if values.len() > 1 {
            values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0)
        } else {
            0.0
        };
        Self {
            mean,
            stderr: var.sqrt() / n.sqrt(),
        }
    }
}

/// Append-only histories: one loss per epoch, one diagnostic entry per checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingRecord {
    pub loss: Vec<f64>,
    /// Epochs at which diagnostics were taken.
    pub checkpoints: Vec<usize>,
    pub latent_accept: Vec<f64>,
    pub data_accept: Vec<f64>,
    pub latent_obs: Vec<Observable>,
    pub data_obs: Vec<Observable>,
}

/// HMC potential in latent space: `U(z) = -(log p(x) - log q(x) + log p_Z(z))` with
/// `x = inverse(z)`, which reduces to `-(log p(x) + logdet_inverse(z))`.
pub fn latent_potential<'a, B, M, E>(
    flow: &'a M,
    target: &'a E,
) -> impl Fn(Tensor<B, 2>) -> Result<Tensor<B, 1>> + 'a
where
    B: Backend,
    M: Flow<B>,
    E: EnergyModel<B>,
{
    move |z| {
        let (x, logdet) = flow.inverse(z)?;
        Ok((target.energy(x)? + logdet).neg())
    }
}

/// HMC potential in data space: `U(x) = -log p(x)`.
pub fn data_potential<'a, B, E>(target: &'a E) -> impl Fn(Tensor<B, 2>) -> Result<Tensor<B, 1>> + 'a
where
    B: Backend,
    E: EnergyModel<B>,
{
    move |x| Ok(target.energy(x)?.neg())
}

/// Train `flow` towards `target` and return it with the recorded histories.
///
/// `checkpoint` receives `(epoch, snapshot)` at every checkpoint epoch; an error from it
/// stops training.
pub fn learn<B, M, E, R, S>(
    mut flow: M,
    target: &E,
    cfg: &TrainConfig,
    rng: &mut R,
    mut checkpoint: S,
) -> Result<(M, TrainingRecord)>
where
    B: AutodiffBackend,
    M: Flow<B> + AutodiffModule<B>,
    M::InnerModule: Flow<B::InnerBackend>,
    E: EnergyModel<B>,
    R: Rng + ?Sized,
    S: FnMut(usize, &StateDict) -> Result<()>,
{
    cfg.validate()?;
    if target.nvars() != flow.nvars() {
        return Err(Error::Construction(format!(
            "flow has {} variables, target has {}",
            flow.nvars(),
            target.nvars()
        )));
    }

    let decay = (cfg.weight_decay > 0.0).then(|| WeightDecayConfig::new(cfg.weight_decay as f32));
    let mut optim = AdamConfig::new().with_weight_decay(decay).init::<B, M>();
    info!(
        flow = flow.name(),
        params = flow.num_params(),
        epochs = cfg.epochs,
        batch_size = cfg.batch_size,
        "training started"
    );

    let device = flow.device();
    let mut record = TrainingRecord::default();
    let mut latent_chain = flow.prior().sample::<B, R>(cfg.batch_size, &device, rng)?;
    let mut data_chain = flow.prior().sample::<B, R>(cfg.batch_size, &device, rng)?;

    for epoch in 0..cfg.epochs {
        let lr = cfg.lr_decay.map_or(cfg.lr, |d| d.lr(cfg.lr, epoch));

        let (x, log_q) = flow.sample(cfg.batch_size, rng)?;
        let log_p = target.energy(x)?;
        let loss = log_q.mean() - log_p.mean();
        let loss_value = host_values(loss.clone().detach())?[0];
        if !loss_value.is_finite() {
            warn!(epoch, loss = loss_value, "non-finite loss");
        }

        let grads = GradientsParams::from_grads(loss.backward(), &flow);
        flow = optim.step(lr, flow, grads);

        info!(epoch, loss = loss_value, lr, "epoch");
        record.loss.push(loss_value);

        let last = epoch + 1 == cfg.epochs;
        if cfg.save_every == 0 || !(epoch % cfg.save_every == 0 || last) {
            continue;
        }

        if let Some(hmc_cfg) = &cfg.hmc {
            let z_run = hmc(latent_potential(&flow, target), latent_chain, hmc_cfg, rng)?;
            let x_run = hmc(data_potential(target), data_chain, hmc_cfg, rng)?;
            latent_chain = z_run.x.clone();
            data_chain = x_run.x.clone();

            let (x_z, _) = flow.valid().inverse(latent_chain.clone().inner())?;
            let z_obs = Observable::from_samples(&host_values(target.measure(Tensor::from_inner(x_z))?)?);
            let x_obs = Observable::from_samples(&host_values(target.measure(data_chain.clone())?)?);

            info!(
                epoch,
                latent_accept = z_run.accept_ratio(),
                latent_obs = z_obs.mean,
                latent_stderr = z_obs.stderr,
                data_accept = x_run.accept_ratio(),
                data_obs = x_obs.mean,
                data_stderr = x_obs.stderr,
                "hmc diagnostics"
            );
            record.checkpoints.push(epoch);
            record.latent_accept.push(z_run.accept_ratio());
            record.data_accept.push(x_run.accept_ratio());
            record.latent_obs.push(z_obs);
            record.data_obs.push(x_obs);
        }

        checkpoint(epoch, &flow.save()?)?;
    }

    Ok((flow, record))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_decay_schedule() {
        let d = StepDecay { step_size: 2, gamma: 0.5 };
        assert_eq!(d.lr(1.0, 0), 1.0);
        assert_eq!(d.lr(1.0, 1), 1.0);
        assert_eq!(d.lr(1.0, 2), 0.5);
        assert_eq!(d.lr(1.0, 5), 0.25);
    }

    #[test]
    fn observable_uses_unbiased_std() {
        let o = Observable::from_samples(&[1.0, 2.0, 3.0, 4.0]);
        assert!((o.mean - 2.5).abs() < 1e-12);
        let std = (5.0f64 / 3.0).sqrt();
        assert!((o.stderr - std / 2.0).abs() < 1e-12);
        assert_eq!(Observable::from_samples(&[3.0]).stderr, 0.0);
    }

    #[test]
    fn config_validation() {
        assert!(TrainConfig::default().validate().is_ok());
        let bad = [
            TrainConfig { batch_size: 0, ..TrainConfig::default() },
            TrainConfig { lr: -1.0, ..TrainConfig::default() },
            TrainConfig { weight_decay: f64::NAN, ..TrainConfig::default() },
            TrainConfig {
                lr_decay: Some(StepDecay { step_size: 0, gamma: 0.7 }),
                ..TrainConfig::default()
            },
            TrainConfig {
                hmc: Some(HmcConfig { step_size: 0.0, ..HmcConfig::default() }),
                ..TrainConfig::default()
            },
        ];
        for cfg in bad {
            assert!(matches!(cfg.validate(), Err(Error::Domain(_))));
        }
    }
}
