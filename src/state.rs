//! Parameter snapshots.
//!
//! A [`StateDict`] is a named key → tensor mapping (plus the flow name and the masks it was
//! built with). It is what `Flow::save` produces and `Flow::load` consumes; writing it to disk
//! is the caller's business (it is `serde`-serializable).
//!
//! Loading is all-or-nothing: every key the target flow expects must be present with the same
//! shape, the masks must match, and no key may be left over. Anything else is
//! [`Error::TopologyMismatch`].

use std::collections::BTreeMap;

use burn_core as burn;

use burn::tensor::backend::Backend;
use burn::tensor::{Tensor, TensorData};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// One stored tensor, row-major.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamEntry {
    pub shape: Vec<usize>,
    pub values: Vec<f32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateDict {
    /// Name of the flow that produced the snapshot (used by callers to derive file names).
    pub name: String,
    pub entries: BTreeMap<String, ParamEntry>,
}

impl StateDict {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&ParamEntry> {
        self.entries.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Number of stored scalars.
    pub fn num_values(&self) -> usize {
        self.entries.values().map(|e| e.values.len()).sum()
    }

    pub(crate) fn insert_tensor<B: Backend, const D: usize>(
        &mut self,
        key: String,
        tensor: Tensor<B, D>,
    ) -> Result<()> {
        let shape = tensor.dims().to_vec();
        let values = tensor
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|e| Error::Tensor(format!("{key}: {e:?}")))?;
        self.insert_values(key, shape, values);
        Ok(())
    }

    pub(crate) fn insert_values(&mut self, key: String, shape: Vec<usize>, values: Vec<f32>) {
        self.entries.insert(key, ParamEntry { shape, values });
    }

    /// Remove `key` and rebuild it as a tensor, checking the shape.
    pub(crate) fn take_tensor<B: Backend, const D: usize>(
        &mut self,
        key: &str,
        shape: [usize; D],
        device: &B::Device,
    ) -> Result<Tensor<B, D>> {
        let entry = self.take_entry(key, &shape)?;
        let data = TensorData::new(entry.values, shape).convert::<B::FloatElem>();
        Ok(Tensor::from_data(data, device))
    }

    /// Remove `key` and check it holds exactly `expected`.
    pub(crate) fn take_exact(&mut self, key: &str, shape: &[usize], expected: &[f32]) -> Result<()> {
        let entry = self.take_entry(key, shape)?;
        if entry.values != expected {
            return Err(Error::TopologyMismatch(format!(
                "`{key}` differs from the value this flow was built with"
            )));
        }
        Ok(())
    }

    /// Fails if any key was not consumed.
    pub(crate) fn finish(self) -> Result<()> {
        if let Some(extra) = self.entries.keys().next() {
            return Err(Error::TopologyMismatch(format!(
                "{} unexpected entries (first: `{extra}`)",
                self.entries.len()
            )));
        }
        Ok(())
    }

    fn take_entry(&mut self, key: &str, shape: &[usize]) -> Result<ParamEntry> {
        let entry = self
            .entries
            .remove(key)
            .ok_or_else(|| Error::TopologyMismatch(format!("missing `{key}`")))?;
        if entry.shape != shape {
            return Err(Error::TopologyMismatch(format!(
                "`{key}` has shape {:?}, expected {shape:?}",
                entry.shape
            )));
        }
        let n: usize = shape.iter().product();
        if entry.values.len() != n {
            return Err(Error::TopologyMismatch(format!(
                "`{key}` holds {} values for shape {shape:?}",
                entry.values.len()
            )));
        }
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type B = NdArray<f32>;

    #[test]
    fn take_checks_presence_and_shape() {
        let device = Default::default();
        let mut state = StateDict::new("t");
        let t = Tensor::<B, 2>::from_floats([[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]], &device);
        state.insert_tensor("w".into(), t).unwrap();
        assert_eq!(state.num_values(), 6);

        let mut wrong = state.clone();
        assert!(matches!(
            wrong.take_tensor::<B, 2>("w", [3, 2], &device),
            Err(Error::TopologyMismatch(_))
        ));
        assert!(matches!(
            state.clone().take_tensor::<B, 2>("v", [2, 3], &device),
            Err(Error::TopologyMismatch(_))
        ));

        let back = state.take_tensor::<B, 2>("w", [2, 3], &device).unwrap();
        assert_eq!(back.into_data().to_vec::<f32>().unwrap(), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        state.finish().unwrap();
    }

    #[test]
    fn leftover_keys_fail_finish() {
        let mut state = StateDict::new("t");
        state.insert_values("mask".into(), vec![2], vec![1.0, 0.0]);
        state.insert_values("extra".into(), vec![1], vec![0.0]);
        state.take_exact("mask", &[2], &[1.0, 0.0]).unwrap();
        assert!(matches!(state.finish(), Err(Error::TopologyMismatch(_))));
    }

    #[test]
    fn serde_round_trip() {
        let mut state = StateDict::new("mera");
        state.insert_values("a".into(), vec![1, 2], vec![0.5, -0.25]);
        let json = serde_json::to_string(&state).unwrap();
        let back: StateDict = serde_json::from_str(&json).unwrap();
        assert_eq!(state, back);
    }
}
