//! Periodic hypercubic lattices and block dispatch.
//!
//! Both composition topologies act on a lattice `[L]^d` (flattened row-major) by applying one
//! coupling layer to many disjoint `2^d`-site blocks at once. A block at dilation `δ` with origin
//! `c` covers the sites `c + δ·e (mod L)` for every corner `e ∈ {0,1}^d`; block origins sit on
//! the grid `offset + 2δ·k`.
//!
//! A [`Dispatch`] is the gather/scatter plan for one such set of blocks: covered sites in
//! block-major order first, then every uncovered site (which passes through untouched).

use crate::{Error, Result};

/// A periodic `[length]^dim` lattice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lattice {
    length: usize,
    dim: usize,
}

impl Lattice {
    pub fn new(length: usize, dim: usize) -> Result<Self> {
        if dim == 0 {
            return Err(Error::Construction("lattice dimension must be >= 1".into()));
        }
        if length < 2 {
            return Err(Error::Construction(format!(
                "lattice length must be >= 2, got {length}"
            )));
        }
        length
            .checked_pow(dim as u32)
            .ok_or_else(|| Error::Construction("lattice is too large".into()))?;
        Ok(Self { length, dim })
    }

    pub fn length(&self) -> usize {
        self.length
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn nvars(&self) -> usize {
        self.length.pow(self.dim as u32)
    }

    pub fn shape(&self) -> Vec<usize> {
        vec![self.length; self.dim]
    }

    /// Shape of one block: `[2; dim]`.
    pub fn block_shape(&self) -> Vec<usize> {
        vec![2; self.dim]
    }

    pub fn block_len(&self) -> usize {
        1 << self.dim
    }

    /// `log2(length)` if `length` is a power of two.
    pub fn levels(&self) -> Option<usize> {
        self.length
            .is_power_of_two()
            .then(|| self.length.trailing_zeros() as usize)
    }

    /// Row-major flat index of (periodically wrapped) coordinates.
    pub fn site(&self, coords: &[usize]) -> usize {
        debug_assert_eq!(coords.len(), self.dim);
        coords
            .iter()
            .fold(0usize, |acc, &c| acc * self.length + c % self.length)
    }

    /// All blocks at dilation `dilation` whose origins sit on `offset + 2·dilation·k`.
    ///
    /// Each block lists its `2^d` sites in row-major corner order.
    pub fn blocks(&self, dilation: usize, offset: usize) -> Result<Vec<Vec<usize>>> {
        if dilation == 0 || self.length % (2 * dilation) != 0 {
            return Err(Error::Construction(format!(
                "length {} is not divisible into blocks of dilation {dilation}",
                self.length
            )));
        }
        let per_axis = self.length / (2 * dilation);
        let n_blocks = per_axis.pow(self.dim as u32);
        let corners = self.block_len();

        let mut out = Vec::with_capacity(n_blocks);
        let mut origin = vec![0usize; self.dim];
        let mut coords = vec![0usize; self.dim];
        for b in 0..n_blocks {
            // Decode block index into per-axis block coordinates (row-major).
            let mut rem = b;
            for a in (0..self.dim).rev() {
                origin[a] = offset + 2 * dilation * (rem % per_axis);
                rem /= per_axis;
            }
            let mut block = Vec::with_capacity(corners);
            for e in 0..corners {
                for a in 0..self.dim {
                    let bit = (e >> (self.dim - 1 - a)) & 1;
                    coords[a] = origin[a] + bit * dilation;
                }
                block.push(self.site(&coords));
            }
            out.push(block);
        }
        Ok(out)
    }
}

/// Gather/scatter plan for one set of disjoint blocks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatch {
    /// Covered sites (block-major) followed by uncovered sites.
    pub gather: Vec<usize>,
    /// `restore[site]` = position of `site` in `gather`.
    pub restore: Vec<usize>,
    pub n_blocks: usize,
    pub block_len: usize,
}

impl Dispatch {
    pub fn new(nvars: usize, blocks: &[Vec<usize>]) -> Result<Self> {
        let block_len = blocks.first().map(Vec::len).unwrap_or(0);
        if block_len == 0 || blocks.iter().any(|b| b.len() != block_len) {
            return Err(Error::Construction("blocks must be non-empty and equally sized".into()));
        }
        let mut seen = vec![false; nvars];
        let mut gather = Vec::with_capacity(nvars);
        for &site in blocks.iter().flatten() {
            if site >= nvars || seen[site] {
                return Err(Error::Construction(format!(
                    "site {site} is out of range or covered twice"
                )));
            }
            seen[site] = true;
            gather.push(site);
        }
        gather.extend((0..nvars).filter(|&s| !seen[s]));

        let mut restore = vec![0usize; nvars];
        for (pos, &site) in gather.iter().enumerate() {
            restore[site] = pos;
        }
        Ok(Self {
            gather,
            restore,
            n_blocks: blocks.len(),
            block_len,
        })
    }

    /// Number of sites the blocks cover.
    pub fn covered(&self) -> usize {
        self.n_blocks * self.block_len
    }
}
