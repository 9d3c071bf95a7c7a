//! Flows averaged over a symmetry group.
//!
//! For a finite group `G` of volume-preserving maps the symmetrized density is
//!
//! \[
//! q_G(x) = \frac{1}{|G|} \sum_{g \in G} q(g\,x).
//! \]
//!
//! Group elements are signed site permutations, `(g x)_i = ±x_{π(i)}`, which covers the Ising
//! `x → -x` symmetry and lattice translations. Sampling draws from the wrapped flow and applies
//! one uniformly chosen element per row. The group is checked for closure at construction.

use burn_core as burn;

use burn::module::{Ignored, Module};
use burn::tensor::backend::Backend;
use burn::tensor::{Bool, Tensor, TensorData};
use rand::Rng;

use super::{mera_init, Flow, Mera, MeraConfig};
use crate::lattice::Lattice;
use crate::mask::index_tensor;
use crate::prior::Gaussian;
use crate::state::StateDict;
use crate::{Error, Result};

/// A signed site permutation `(g x)_i = ±x_{perm[i]}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symmetry {
    perm: Vec<usize>,
    negate: bool,
}

impl Symmetry {
    pub fn new(perm: Vec<usize>, negate: bool) -> Result<Self> {
        if perm.is_empty() {
            return Err(Error::Construction("symmetry acts on no sites".into()));
        }
        let mut seen = vec![false; perm.len()];
        for &p in &perm {
            if p >= perm.len() || seen[p] {
                return Err(Error::Construction(format!(
                    "{perm:?} is not a permutation of 0..{}",
                    perm.len()
                )));
            }
            seen[p] = true;
        }
        Ok(Self { perm, negate })
    }

    pub fn identity(nvars: usize) -> Result<Self> {
        Self::new((0..nvars).collect(), false)
    }

    /// `x → -x`.
    pub fn negation(nvars: usize) -> Result<Self> {
        Self::new((0..nvars).collect(), true)
    }

    /// Cyclic shift by `shift` sites along `axis`.
    pub fn translation(lattice: &Lattice, axis: usize, shift: usize) -> Result<Self> {
        if axis >= lattice.dim() {
            return Err(Error::Construction(format!(
                "axis {axis} out of range for a {}-d lattice",
                lattice.dim()
            )));
        }
        let (len, dim) = (lattice.length(), lattice.dim());
        let mut coords = vec![0usize; dim];
        let perm = (0..lattice.nvars())
            .map(|i| {
                let mut rem = i;
                for a in (0..dim).rev() {
                    coords[a] = rem % len;
                    rem /= len;
                }
                coords[axis] += shift;
                lattice.site(&coords)
            })
            .collect();
        Self::new(perm, false)
    }

    /// `{identity, x → -x}`.
    pub fn z2(nvars: usize) -> Result<Vec<Self>> {
        Ok(vec![Self::identity(nvars)?, Self::negation(nvars)?])
    }

    pub fn nvars(&self) -> usize {
        self.perm.len()
    }

    pub fn permutation(&self) -> &[usize] {
        &self.perm
    }

    pub fn negates(&self) -> bool {
        self.negate
    }

    fn is_identity(&self) -> bool {
        !self.negate && self.perm.iter().enumerate().all(|(i, &p)| i == p)
    }

    /// `self ∘ other`.
    fn compose(&self, other: &Symmetry) -> Symmetry {
        Symmetry {
            perm: self.perm.iter().map(|&p| other.perm[p]).collect(),
            negate: self.negate != other.negate,
        }
    }

    pub fn apply<B: Backend>(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        let device = x.device();
        let y = x.select(1, index_tensor::<B>(&self.perm, &device));
        if self.negate {
            y.neg()
        } else {
            y
        }
    }

    fn to_values(&self) -> Vec<f32> {
        let mut v: Vec<f32> = self.perm.iter().map(|&p| p as f32).collect();
        v.push(if self.negate { 1.0 } else { 0.0 });
        v
    }
}

/// A [`Mera`] whose density is averaged over a symmetry group.
///
/// `forward` and `inverse` are the wrapped bijection; `sample` and `log_probability` use the
/// symmetrized density.
#[derive(Module, Debug)]
pub struct Symmetrized<B: Backend> {
    flow: Mera<B>,
    group: Ignored<Vec<Symmetry>>,
}

impl<B: Backend> Symmetrized<B> {
    /// Fails unless `group` is a duplicate-free set containing the identity and closed under
    /// composition, acting on `flow.nvars()` sites.
    pub fn new(flow: Mera<B>, group: Vec<Symmetry>) -> Result<Self> {
        let n = flow.nvars();
        if let Some(g) = group.iter().find(|g| g.nvars() != n) {
            return Err(Error::Construction(format!(
                "symmetry acts on {} sites, flow has {n}",
                g.nvars()
            )));
        }
        if !group.iter().any(Symmetry::is_identity) {
            return Err(Error::Construction("symmetry group must contain the identity".into()));
        }
        for (i, a) in group.iter().enumerate() {
            if group[..i].contains(a) {
                return Err(Error::Construction(format!("symmetry {i} is listed twice")));
            }
            for b in &group {
                if !group.contains(&a.compose(b)) {
                    return Err(Error::Construction("symmetry group is not closed".into()));
                }
            }
        }
        Ok(Self {
            flow,
            group: Ignored(group),
        })
    }

    pub fn with_name(self, name: impl Into<String>) -> Self {
        Self {
            flow: self.flow.with_name(name),
            group: self.group,
        }
    }

    pub fn flow(&self) -> &Mera<B> {
        &self.flow
    }

    pub fn group(&self) -> &[Symmetry] {
        &self.group.0
    }

    pub fn into_inner(self) -> Mera<B> {
        self.flow
    }
}

impl<B: Backend> Flow<B> for Symmetrized<B> {
    fn name(&self) -> &str {
        self.flow.name()
    }

    fn prior(&self) -> &Gaussian {
        self.flow.prior()
    }

    fn device(&self) -> B::Device {
        self.flow.device()
    }

    fn forward(&self, x: Tensor<B, 2>) -> Result<(Tensor<B, 2>, Tensor<B, 1>)> {
        self.flow.forward(x)
    }

    fn inverse(&self, z: Tensor<B, 2>) -> Result<(Tensor<B, 2>, Tensor<B, 1>)> {
        self.flow.inverse(z)
    }

    fn sample<R: Rng + ?Sized>(
        &self,
        batch_size: usize,
        rng: &mut R,
    ) -> Result<(Tensor<B, 2>, Tensor<B, 1>)> {
        let (x, _) = self.flow.sample(batch_size, &mut *rng)?;
        let group = &self.group.0;
        let [batch, n] = x.dims();
        let choice: Vec<usize> = (0..batch).map(|_| rng.random_range(0..group.len())).collect();

        let device = x.device();
        let mut out = group[0].apply(x.clone());
        for (j, g) in group.iter().enumerate().skip(1) {
            let mut cell = Vec::with_capacity(batch * n);
            for &c in &choice {
                cell.extend(std::iter::repeat(c == j).take(n));
            }
            let mask = Tensor::<B, 2, Bool>::from_data(TensorData::new(cell, [batch, n]), &device);
            out = out.mask_where(mask, g.apply(x.clone()));
        }
        let log_q = self.log_probability(out.clone())?;
        Ok((out, log_q))
    }

    fn log_probability(&self, x: Tensor<B, 2>) -> Result<Tensor<B, 1>> {
        let [batch, _] = x.dims();
        let terms = self
            .group
            .0
            .iter()
            .map(|g| Ok(self.flow.log_probability(g.apply(x.clone()))?.reshape([batch, 1])))
            .collect::<Result<Vec<_>>>()?;
        Ok(log_mean_exp(Tensor::cat(terms, 1)))
    }

    fn save(&self) -> Result<StateDict> {
        let mut state = self.flow.save()?;
        let (shape, values) = self.group_entry();
        state.insert_values("symmetry".into(), shape, values);
        Ok(state)
    }

    fn load(self, state: &StateDict) -> Result<Self> {
        let mut state = state.clone();
        let (shape, values) = self.group_entry();
        state.take_exact("symmetry", &shape, &values)?;
        Ok(Self {
            flow: self.flow.load(&state)?,
            group: self.group,
        })
    }
}

impl<B: Backend> Symmetrized<B> {
    /// One `[perm..., negate]` row per group element.
    fn group_entry(&self) -> (Vec<usize>, Vec<f32>) {
        let group = &self.group.0;
        let values: Vec<f32> = group.iter().flat_map(Symmetry::to_values).collect();
        (vec![group.len(), self.flow.nvars() + 1], values)
    }
}

/// Row-wise `log(mean(exp(v)))` of `v: [batch, k]`.
fn log_mean_exp<B: Backend>(v: Tensor<B, 2>) -> Tensor<B, 1> {
    let [batch, k] = v.dims();
    let m = v.clone().max_dim(1);
    ((v - m.clone()).exp().sum_dim(1).log() + m)
        .reshape([batch])
        .sub_scalar((k as f32).ln())
}

/// [`mera_init`] wrapped in [`Symmetrized`] with `group`.
pub fn symmetric_mera_init<B: Backend>(
    cfg: &MeraConfig,
    group: Vec<Symmetry>,
    device: &B::Device,
) -> Result<Symmetrized<B>> {
    Symmetrized::new(mera_init(cfg, device)?, group)
}
