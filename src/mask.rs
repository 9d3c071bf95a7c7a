//! Binary partitions of a block of variables.
//!
//! A [`Mask`] marks the **active** sites of a block (updated by a coupling step); the remaining
//! sites are **frozen** and condition the update. Masks are validated once, at construction:
//!
//! - every entry is binary,
//! - at least one site is active and at least one is frozen.
//!
//! Generators are pure functions of a shape (and an RNG, for the random ones), called when a
//! flow is built and never again.

use burn_core as burn;

use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor, TensorData};

use crate::{Error, Result};
use ndarray::{ArrayD, Dimension, IxDyn};
use rand::seq::SliceRandom;
use rand::Rng;

/// An immutable binary partition of a block with a fixed shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mask {
    active: ArrayD<bool>,
}

impl Mask {
    /// Wrap a boolean array (`true` = active).
    pub fn new(active: ArrayD<bool>) -> Result<Self> {
        if active.is_empty() {
            return Err(Error::Construction("mask must be non-empty".into()));
        }
        let n_active = active.iter().filter(|&&a| a).count();
        if n_active == 0 {
            return Err(Error::Construction("mask is all-zero (layer would be the identity)".into()));
        }
        if n_active == active.len() {
            return Err(Error::Construction("mask is all-one (nothing left to condition on)".into()));
        }
        Ok(Self { active })
    }

    /// Build a mask from `{0, 1}` values laid out row-major in `shape`.
    ///
    /// Any value other than exactly `0.0` or `1.0` is rejected; we do not round.
    pub fn from_values(shape: &[usize], values: &[f32]) -> Result<Self> {
        let n: usize = shape.iter().product();
        if values.len() != n {
            return Err(Error::Construction(format!(
                "mask has {} values but shape {shape:?} needs {n}",
                values.len()
            )));
        }
        if let Some(bad) = values.iter().find(|&&v| v != 0.0 && v != 1.0) {
            return Err(Error::Construction(format!("mask value {bad} is not binary")));
        }
        let active = values.iter().map(|&v| v == 1.0).collect::<Vec<_>>();
        let active = ArrayD::from_shape_vec(IxDyn(shape), active)
            .map_err(|e| Error::Construction(format!("mask shape: {e}")))?;
        Self::new(active)
    }

    /// Checkerboard partition: a site is active iff the sum of its coordinates has parity `parity`.
    pub fn checkerboard(shape: &[usize], parity: usize) -> Result<Self> {
        let active = ArrayD::from_shape_fn(IxDyn(shape), |idx| {
            let s: usize = idx.slice().iter().sum();
            s % 2 == parity % 2
        });
        Self::new(active)
    }

    /// Random half/half partition: `n / 2` sites chosen by a random permutation are active.
    pub fn random_half<R: Rng + ?Sized>(shape: &[usize], rng: &mut R) -> Result<Self> {
        let n: usize = shape.iter().product();
        if n < 2 {
            return Err(Error::Construction(format!(
                "block {shape:?} has fewer than two sites; it cannot be partitioned"
            )));
        }
        let mut order: Vec<usize> = (0..n).collect();
        order.shuffle(rng);
        let mut flat = vec![false; n];
        for &i in &order[..n / 2] {
            flat[i] = true;
        }
        let active = ArrayD::from_shape_vec(IxDyn(shape), flat)
            .map_err(|e| Error::Construction(format!("mask shape: {e}")))?;
        Self::new(active)
    }

    /// The complementary partition (active ↔ frozen).
    pub fn complement(&self) -> Self {
        Self {
            active: self.active.mapv(|a| !a),
        }
    }

    pub fn shape(&self) -> &[usize] {
        self.active.shape()
    }

    /// Number of sites in the block.
    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    pub fn n_active(&self) -> usize {
        self.active.iter().filter(|&&a| a).count()
    }

    pub fn n_frozen(&self) -> usize {
        self.len() - self.n_active()
    }

    /// `true` iff `other` has the same shape and exactly the opposite entries.
    pub fn is_complement_of(&self, other: &Mask) -> bool {
        self.shape() == other.shape() && self.active.iter().zip(other.active.iter()).all(|(a, b)| a != b)
    }

    /// Row-major `{0, 1}` values.
    pub fn to_values(&self) -> Vec<f32> {
        self.active.iter().map(|&a| if a { 1.0 } else { 0.0 }).collect()
    }

    /// Gather/scatter plan for this mask over the flattened block.
    pub fn partition(&self) -> Partition {
        let mut frozen = Vec::with_capacity(self.n_frozen());
        let mut active = Vec::with_capacity(self.n_active());
        for (i, &a) in self.active.iter().enumerate() {
            if a {
                active.push(i);
            } else {
                frozen.push(i);
            }
        }
        Partition::new(frozen, active)
    }
}

/// Flattened index sets of a mask: `active ++ frozen` is a permutation of `0..n`.
///
/// `restore[i]` is the position of site `i` inside `active ++ frozen`, so selecting
/// `restore` from the concatenation puts every site back where it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub frozen: Vec<usize>,
    pub active: Vec<usize>,
    pub restore: Vec<usize>,
}

impl Partition {
    fn new(frozen: Vec<usize>, active: Vec<usize>) -> Self {
        let n = frozen.len() + active.len();
        let mut restore = vec![0usize; n];
        for (pos, &site) in active.iter().chain(frozen.iter()).enumerate() {
            restore[site] = pos;
        }
        Self {
            frozen,
            active,
            restore,
        }
    }
}

/// Upload a flat index list for `Tensor::select`.
pub(crate) fn index_tensor<B: Backend>(indices: &[usize], device: &B::Device) -> Tensor<B, 1, Int> {
    let data: Vec<i64> = indices.iter().map(|&i| i as i64).collect();
    Tensor::from_data(TensorData::new(data, [indices.len()]).convert::<B::IntElem>(), device)
}

/// `n` masks in complementary pairs: `[b, 1-b, b', 1-b', ...]`, each `b` from [`Mask::random_half`].
///
/// This is the mask list of one multi-step RealNVP layer: every pair updates each site exactly once.
pub fn mask_pairs<R: Rng + ?Sized>(shape: &[usize], n: usize, rng: &mut R) -> Result<Vec<Mask>> {
    if n == 0 || n % 2 != 0 {
        return Err(Error::Construction(format!(
            "mask count must be even and >= 2, got {n}"
        )));
    }
    let mut out = Vec::with_capacity(n);
    for _ in 0..n / 2 {
        let b = Mask::random_half(shape, rng)?;
        let c = b.complement();
        out.push(b);
        out.push(c);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn degenerate_and_non_binary_masks_are_rejected() {
        assert!(Mask::from_values(&[2, 2], &[0.0; 4]).is_err());
        assert!(Mask::from_values(&[2, 2], &[1.0; 4]).is_err());
        assert!(Mask::from_values(&[2, 2], &[1.0, 0.5, 0.0, 1.0]).is_err());
        assert!(Mask::from_values(&[2, 2], &[1.0, 0.0, 1.0]).is_err());
        assert!(Mask::from_values(&[2, 2], &[1.0, 0.0, 0.0, 1.0]).is_ok());
    }

    #[test]
    fn checkerboard_on_2x2_block() {
        let m = Mask::checkerboard(&[2, 2], 0).unwrap();
        assert_eq!(m.to_values(), vec![1.0, 0.0, 0.0, 1.0]);
        assert!(m.is_complement_of(&Mask::checkerboard(&[2, 2], 1).unwrap()));
        // A single site cannot be split.
        assert!(Mask::checkerboard(&[1], 0).is_err());
    }

    #[test]
    fn partition_restore_inverts_the_gather() {
        let m = Mask::from_values(&[4], &[0.0, 1.0, 1.0, 0.0]).unwrap();
        let p = m.partition();
        assert_eq!(p.frozen, vec![0, 3]);
        assert_eq!(p.active, vec![1, 2]);
        let cat: Vec<usize> = p.active.iter().chain(p.frozen.iter()).copied().collect();
        let back: Vec<usize> = p.restore.iter().map(|&pos| cat[pos]).collect();
        assert_eq!(back, vec![0, 1, 2, 3]);
    }

    #[test]
    fn odd_mask_count_is_rejected() {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        assert!(mask_pairs(&[2, 2], 3, &mut rng).is_err());
        assert!(mask_pairs(&[2, 2], 0, &mut rng).is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 64,
            .. ProptestConfig::default()
        })]
        #[test]
        fn prop_mask_pairs_are_complementary_halves(
            seed in any::<u64>(),
            dim in 1usize..4,
            pairs in 1usize..4,
        ) {
            let shape = vec![2usize; dim];
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            let masks = mask_pairs(&shape, 2 * pairs, &mut rng).unwrap();
            prop_assert_eq!(masks.len(), 2 * pairs);
            for pair in masks.chunks(2) {
                prop_assert!(pair[0].is_complement_of(&pair[1]));
                prop_assert_eq!(pair[0].n_active(), pair[0].len() / 2);
            }
        }
    }
}
