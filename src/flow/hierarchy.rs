//! Step engine shared by `Tebd` and `Mera`.
//!
//! A step gathers the sites its blocks cover into `[batch · n_blocks, 2^d]`, runs one coupling
//! layer on all blocks at once, and scatters the result back. Uncovered sites are carried
//! through a separate gather and never touched.

use burn_core as burn;

use burn::module::{Ignored, Module};
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

use crate::coupling::RealNvp;
use crate::lattice::{Dispatch, Lattice};
use crate::mask::index_tensor;
use crate::prior::Gaussian;
use crate::state::StateDict;
use crate::{Error, Result};

/// One placement of a layer: which layer, at which dilation and offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub layer: usize,
    pub dilation: usize,
    pub offset: usize,
}

#[derive(Debug, Clone)]
pub struct BlockStep {
    placement: Placement,
    dispatch: Dispatch,
}

#[derive(Module, Debug)]
pub struct Hierarchy<B: Backend> {
    layers: Vec<RealNvp<B>>,
    steps: Ignored<Vec<BlockStep>>,
    lattice: Ignored<Lattice>,
    prior: Ignored<Gaussian>,
    name: Ignored<String>,
}

impl<B: Backend> Hierarchy<B> {
    pub fn new(
        name: String,
        lattice: Lattice,
        prior: Gaussian,
        layers: Vec<RealNvp<B>>,
        plan: &[Placement],
    ) -> Result<Self> {
        if prior.nvars() != lattice.nvars() {
            return Err(Error::Construction(format!(
                "prior has {} variables, lattice has {}",
                prior.nvars(),
                lattice.nvars()
            )));
        }
        if layers.is_empty() || plan.is_empty() {
            return Err(Error::Construction("a flow needs at least one layer and one step".into()));
        }
        let block = lattice.block_shape();
        for (j, layer) in layers.iter().enumerate() {
            if layer.block_shape() != block.as_slice() {
                return Err(Error::Construction(format!(
                    "layer {j} acts on blocks of shape {:?}, lattice blocks are {block:?}",
                    layer.block_shape()
                )));
            }
        }
        let steps = plan
            .iter()
            .map(|p| {
                if p.layer >= layers.len() {
                    return Err(Error::Construction(format!(
                        "step refers to layer {}, only {} given",
                        p.layer,
                        layers.len()
                    )));
                }
                let blocks = lattice.blocks(p.dilation, p.offset)?;
                Ok(BlockStep {
                    placement: *p,
                    dispatch: Dispatch::new(lattice.nvars(), &blocks)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            layers,
            steps: Ignored(steps),
            lattice: Ignored(lattice),
            prior: Ignored(prior),
            name: Ignored(name),
        })
    }

    pub fn name(&self) -> &str {
        &self.name.0
    }

    pub fn set_name(&mut self, name: String) {
        self.name = Ignored(name);
    }

    pub fn prior(&self) -> &Gaussian {
        &self.prior.0
    }

    pub fn lattice(&self) -> Lattice {
        self.lattice.0
    }

    pub fn layers(&self) -> &[RealNvp<B>] {
        &self.layers
    }

    /// Layer index used at each step, in forward order.
    pub fn step_layers(&self) -> Vec<usize> {
        self.steps.0.iter().map(|s| s.placement.layer).collect()
    }

    pub fn device(&self) -> B::Device {
        self.layers[0].device()
    }

    pub fn forward(&self, x: Tensor<B, 2>) -> Result<(Tensor<B, 2>, Tensor<B, 1>)> {
        let [batch, _] = self.check_width(&x)?;
        let mut logdet = Tensor::<B, 1>::zeros([batch], &x.device());
        let mut y = x;
        for step in self.steps.0.iter() {
            let (out, ld) = self.apply(step, y, false)?;
            y = out;
            logdet = logdet + ld;
        }
        Ok((y, logdet))
    }

    pub fn inverse(&self, z: Tensor<B, 2>) -> Result<(Tensor<B, 2>, Tensor<B, 1>)> {
        let [batch, _] = self.check_width(&z)?;
        let mut logdet = Tensor::<B, 1>::zeros([batch], &z.device());
        let mut x = z;
        for step in self.steps.0.iter().rev() {
            let (out, ld) = self.apply(step, x, true)?;
            x = out;
            logdet = logdet + ld;
        }
        Ok((x, logdet))
    }

    fn apply(
        &self,
        step: &BlockStep,
        x: Tensor<B, 2>,
        inverse: bool,
    ) -> Result<(Tensor<B, 2>, Tensor<B, 1>)> {
        let [batch, n] = x.dims();
        let device = x.device();
        let d = &step.dispatch;
        let covered = d.covered();

        let blocks = x
            .clone()
            .select(1, index_tensor::<B>(&d.gather[..covered], &device))
            .reshape([batch * d.n_blocks, d.block_len]);
        let layer = &self.layers[step.placement.layer];
        let (out, ld) = if inverse {
            layer.inverse(blocks)?
        } else {
            layer.forward(blocks)?
        };
        let out = out.reshape([batch, covered]);
        let ld = ld.reshape([batch, d.n_blocks]).sum_dim(1).reshape([batch]);

        let merged = if covered == n {
            out
        } else {
            // Layer output first: `rest` may be untracked.
            let rest = x.select(1, index_tensor::<B>(&d.gather[covered..], &device));
            Tensor::cat(vec![out, rest], 1)
        };
        Ok((merged.select(1, index_tensor::<B>(&d.restore, &device)), ld))
    }

    fn check_width(&self, x: &Tensor<B, 2>) -> Result<[usize; 2]> {
        let dims = x.dims();
        if dims[1] != self.lattice.0.nvars() {
            return Err(Error::Shape("flow input width must equal nvars"));
        }
        Ok(dims)
    }

    pub fn save(&self) -> Result<StateDict> {
        let mut state = StateDict::new(self.name());
        let (lattice, plan) = self.topology();
        state.insert_values("lattice".into(), vec![lattice.len()], lattice);
        state.insert_values("plan".into(), vec![plan.len() / 3, 3], plan);
        let (shape, sigma) = self.prior_entries();
        state.insert_values("prior.shape".into(), vec![shape.len()], shape);
        state.insert_values("prior.sigma".into(), vec![1], sigma);
        for (j, layer) in self.layers.iter().enumerate() {
            layer.export(&format!("layers.{j}"), &mut state)?;
        }
        Ok(state)
    }

    pub fn load(self, state: &StateDict) -> Result<Self> {
        let mut state = state.clone();
        let (lattice, plan) = self.topology();
        state.take_exact("lattice", &[lattice.len()], &lattice)?;
        state.take_exact("plan", &[plan.len() / 3, 3], &plan)?;
        let (shape, sigma) = self.prior_entries();
        state.take_exact("prior.shape", &[shape.len()], &shape)?;
        state.take_exact("prior.sigma", &[1], &sigma)?;
        let Self {
            layers,
            steps,
            lattice,
            prior,
            name,
        } = self;
        let layers = layers
            .into_iter()
            .enumerate()
            .map(|(j, layer)| layer.import(&format!("layers.{j}"), &mut state))
            .collect::<Result<Vec<_>>>()?;
        state.finish()?;
        Ok(Self {
            layers,
            steps,
            lattice,
            prior,
            name,
        })
    }

    /// Parameter gradients keyed like `save`, without the topology entries.
    #[cfg(test)]
    pub(crate) fn export_grads(&self, grads: &B::Gradients) -> Result<StateDict>
    where
        B: burn::tensor::backend::AutodiffBackend,
    {
        let mut state = StateDict::new(self.name());
        for (j, layer) in self.layers.iter().enumerate() {
            layer.export_grads(&format!("layers.{j}"), grads, &mut state)?;
        }
        Ok(state)
    }

    fn prior_entries(&self) -> (Vec<f32>, Vec<f32>) {
        let prior = &self.prior.0;
        (prior.shape().iter().map(|&n| n as f32).collect(), vec![prior.sigma()])
    }

    /// Lattice `[length, dim]` and one `(layer, dilation, offset)` row per step, as stored in
    /// a snapshot.
    fn topology(&self) -> (Vec<f32>, Vec<f32>) {
        let lattice = vec![self.lattice.0.length() as f32, self.lattice.0.dim() as f32];
        let plan = self
            .steps
            .0
            .iter()
            .flat_map(|s| {
                let p = s.placement;
                [p.layer as f32, p.dilation as f32, p.offset as f32]
            })
            .collect();
        (lattice, plan)
    }
}
