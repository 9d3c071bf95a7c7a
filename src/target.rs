//! Target distributions.
//!
//! An [`EnergyModel`] supplies an unnormalized log-density (`energy`; higher means more likely,
//! so the HMC potential is its negative) and an observable used for diagnostics.
//!
//! [`Ising`] is the continuous relaxation of the Ising model on a periodic hypercube. With
//! `K·Adj = V diag(w) Vᵀ` and `Λ = w + (1 - min w)` (so `Λ ≥ 1`), the Gaussian integral trick
//! turns the spin sum into
//!
//! \[
//! \log p(x) = -\tfrac12 \sum_k x_k^2/\Lambda_k + \sum_i \log\cosh\,(Vx)_i + \text{const},
//! \]
//!
//! and `tanh((Vx)_i)` is the conditional mean of spin `i`.

use burn_core as burn;

use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};
use nalgebra::{DMatrix, SymmetricEigen};

use crate::lattice::Lattice;
use crate::{Error, Result};

/// An unnormalized log-density on `[batch, nvars]` rows.
pub trait EnergyModel<B: Backend> {
    fn nvars(&self) -> usize;

    /// Unnormalized log-density per row.
    fn energy(&self, x: Tensor<B, 2>) -> Result<Tensor<B, 1>>;

    /// A scalar observable per row.
    fn measure(&self, x: Tensor<B, 2>) -> Result<Tensor<B, 1>>;
}

#[derive(Debug, Clone)]
pub struct Ising {
    lattice: Lattice,
    coupling: f64,
    /// `1 / Λ_k`.
    inv_lambda: Vec<f32>,
    /// `Vᵀ`, row-major `[nvars, nvars]`, so that `x · Vᵀ = (V x)ᵀ`.
    vt: Vec<f32>,
}

impl Ising {
    /// Nearest-neighbour model with coupling `coupling` on a periodic `[length]^dim` lattice.
    pub fn new(length: usize, dim: usize, coupling: f64) -> Result<Self> {
        if !coupling.is_finite() {
            return Err(Error::Construction("coupling must be finite".into()));
        }
        let lattice = Lattice::new(length, dim)?;
        let n = lattice.nvars();
        let k = adjacency(&lattice) * coupling;
        let eig = SymmetricEigen::new(k);

        let w_min = eig.eigenvalues.iter().copied().fold(f64::INFINITY, f64::min);
        let shift = 1.0 - w_min;
        let inv_lambda = eig.eigenvalues.iter().map(|&w| (1.0 / (w + shift)) as f32).collect();

        let v = &eig.eigenvectors;
        let mut vt = Vec::with_capacity(n * n);
        for row in 0..n {
            for col in 0..n {
                vt.push(v[(col, row)] as f32);
            }
        }
        Ok(Self {
            lattice,
            coupling,
            inv_lambda,
            vt,
        })
    }

    pub fn lattice(&self) -> Lattice {
        self.lattice
    }

    pub fn coupling(&self) -> f64 {
        self.coupling
    }

    /// The shifted eigenvalues `Λ` (minimum exactly 1).
    pub fn lambda(&self) -> Vec<f32> {
        self.inv_lambda.iter().map(|&l| 1.0 / l).collect()
    }

    fn check<B: Backend>(&self, x: &Tensor<B, 2>) -> Result<[usize; 2]> {
        let dims = x.dims();
        if dims[1] != self.lattice.nvars() {
            return Err(Error::Shape("Ising input width must equal nvars"));
        }
        Ok(dims)
    }

    /// `(V x)` per row, `[batch, nvars]`.
    fn project<B: Backend>(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        let n = self.lattice.nvars();
        let vt = Tensor::<B, 2>::from_data(TensorData::new(self.vt.clone(), [n, n]).convert::<B::FloatElem>(), &x.device());
        x.matmul(vt)
    }
}

impl<B: Backend> EnergyModel<B> for Ising {
    fn nvars(&self) -> usize {
        self.lattice.nvars()
    }

    fn energy(&self, x: Tensor<B, 2>) -> Result<Tensor<B, 1>> {
        let [batch, n] = self.check(&x)?;
        let inv_lambda = Tensor::<B, 2>::from_data(
            TensorData::new(self.inv_lambda.clone(), [1, n]).convert::<B::FloatElem>(),
            &x.device(),
        );
        let quad = (x.clone().powf_scalar(2.0) * inv_lambda)
            .sum_dim(1)
            .reshape([batch])
            .mul_scalar(-0.5);
        let h = self.project(x);
        let lc = logcosh(h).sum_dim(1).reshape([batch]);
        Ok(quad + lc)
    }

    /// Improved structure-factor estimator `mean(s)² - Σ s²/N² + 1/N` with `s = tanh(Vx)`.
    fn measure(&self, x: Tensor<B, 2>) -> Result<Tensor<B, 1>> {
        let [batch, n] = self.check(&x)?;
        let nf = n as f32;
        let s = self.project(x).tanh();
        let mean_sq = s.clone().mean_dim(1).reshape([batch]).powf_scalar(2.0);
        let sum_sq = s.powf_scalar(2.0).sum_dim(1).reshape([batch]).div_scalar(nf * nf);
        Ok((mean_sq - sum_sq).add_scalar(1.0 / nf))
    }
}

/// `log cosh(a) = |a| + log1p(exp(-2|a|)) - ln 2`, finite for any finite `a`.
fn logcosh<B: Backend, const D: usize>(a: Tensor<B, D>) -> Tensor<B, D> {
    let abs = a.abs();
    abs.clone() + abs.mul_scalar(-2.0).exp().log1p().sub_scalar(std::f32::consts::LN_2)
}

/// Nearest-neighbour adjacency of a periodic lattice (0/1 entries).
fn adjacency(lattice: &Lattice) -> DMatrix<f64> {
    let n = lattice.nvars();
    let (len, dim) = (lattice.length(), lattice.dim());
    let mut adj = DMatrix::<f64>::zeros(n, n);
    let mut coords = vec![0usize; dim];
    for i in 0..n {
        let mut rem = i;
        for a in (0..dim).rev() {
            coords[a] = rem % len;
            rem /= len;
        }
        for a in 0..dim {
            let mut nb = coords.clone();
            nb[a] = (coords[a] + 1) % len;
            let j = lattice.site(&nb);
            if j != i {
                adj[(i, j)] = 1.0;
                adj[(j, i)] = 1.0;
            }
        }
    }
    adj
}
