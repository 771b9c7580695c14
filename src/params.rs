//! Named parameter storage owned by a network

use std::collections::{BTreeMap, btree_map};

use ndarray::{ArrayD, ArrayView1, ArrayView2, ArrayViewD, Ix1, Ix2};
use thiserror::Error;

use crate::scalar::Scalar;

/// Errors for looking up and replacing parameters
#[derive(Debug, Error)]
pub enum ParamError {
    #[error("Unknown parameter '{0}'")]
    Unknown(String),
    #[error("Parameter '{key}' has shape {expected:?}, got {got:?}")]
    ShapeMismatch {
        key: String,
        expected: Vec<usize>,
        got: Vec<usize>,
    },
}

/// Per-parameter gradients, keyed like the [`ParamStore`] they were computed for
pub type Gradients<T> = BTreeMap<String, ArrayD<T>>;

/// Owns every learnable array of a model, addressed by a unique string key.
///
/// Keys are fixed once inserted and replacements must keep the shape, so a typo or a
/// mis-shaped update is reported instead of silently creating a new entry.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ParamStore<T> {
    params: BTreeMap<String, ArrayD<T>>,
}

impl<T: Scalar> ParamStore<T> {
    pub fn new() -> Self {
        Self {
            params: BTreeMap::new(),
        }
    }

    /// Registers a new parameter. Intended for model construction.
    pub(crate) fn insert(&mut self, key: impl Into<String>, value: ArrayD<T>) {
        self.params.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Result<&ArrayD<T>, ParamError> {
        self.params
            .get(key)
            .ok_or_else(|| ParamError::Unknown(key.to_string()))
    }

    pub fn view(&self, key: &str) -> Result<ArrayViewD<'_, T>, ParamError> {
        Ok(self.get(key)?.view())
    }

    /// Views a parameter as a matrix (weights)
    pub fn matrix(&self, key: &str) -> Result<ArrayView2<'_, T>, ParamError> {
        let value = self.get(key)?;
        value
            .view()
            .into_dimensionality::<Ix2>()
            .map_err(|_| ParamError::ShapeMismatch {
                key: key.to_string(),
                expected: vec![0, 0],
                got: value.shape().to_vec(),
            })
    }

    /// Views a parameter as a vector (biases, batchnorm scale and shift)
    pub fn vector(&self, key: &str) -> Result<ArrayView1<'_, T>, ParamError> {
        let value = self.get(key)?;
        value
            .view()
            .into_dimensionality::<Ix1>()
            .map_err(|_| ParamError::ShapeMismatch {
                key: key.to_string(),
                expected: vec![0],
                got: value.shape().to_vec(),
            })
    }

    /// Replaces an existing parameter with a value of the same shape, returning the old value
    pub fn replace(&mut self, key: &str, value: ArrayD<T>) -> Result<ArrayD<T>, ParamError> {
        let slot = self
            .params
            .get_mut(key)
            .ok_or_else(|| ParamError::Unknown(key.to_string()))?;
        if slot.shape() != value.shape() {
            return Err(ParamError::ShapeMismatch {
                key: key.to_string(),
                expected: slot.shape().to_vec(),
                got: value.shape().to_vec(),
            });
        }
        Ok(std::mem::replace(slot, value))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.params.contains_key(key)
    }

    /// Keys in sorted order
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.params.keys().map(String::as_str)
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, ArrayD<T>> {
        self.params.iter()
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Total number of scalar parameters
    pub fn n_elements(&self) -> usize {
        self.params.values().map(|p| p.len()).sum()
    }

    /// Checks that `other` has exactly this store's keys, each with the matching shape
    pub fn check_layout(&self, other: &ParamStore<T>) -> Result<(), ParamError> {
        self.check_gradients(&other.params)
    }

    /// Checks that `grads` has exactly this store's keys, each with the matching shape
    pub fn check_gradients(&self, grads: &Gradients<T>) -> Result<(), ParamError> {
        if let Some(extra) = grads.keys().find(|k| !self.params.contains_key(*k)) {
            return Err(ParamError::Unknown(extra.clone()));
        }
        for (key, param) in &self.params {
            let grad = grads
                .get(key)
                .ok_or_else(|| ParamError::Unknown(key.clone()))?;
            if grad.shape() != param.shape() {
                return Err(ParamError::ShapeMismatch {
                    key: key.clone(),
                    expected: param.shape().to_vec(),
                    got: grad.shape().to_vec(),
                });
            }
        }
        Ok(())
    }
}

impl<'a, T> IntoIterator for &'a ParamStore<T> {
    type Item = (&'a String, &'a ArrayD<T>);
    type IntoIter = btree_map::Iter<'a, String, ArrayD<T>>;

    fn into_iter(self) -> Self::IntoIter {
        self.params.iter()
    }
}

#[cfg(test)]
mod tests {
    use ndarray::{Array1, Array2, IxDyn};

    use super::*;

    fn store() -> ParamStore<f64> {
        let mut store = ParamStore::new();
        store.insert("W1", Array2::<f64>::zeros((3, 2)).into_dyn());
        store.insert("b1", Array1::<f64>::zeros(2).into_dyn());
        store
    }

    #[test]
    fn test_lookup() {
        let store = store();
        assert_eq!(store.keys().collect::<Vec<_>>(), vec!["W1", "b1"]);
        assert_eq!(store.matrix("W1").unwrap().dim(), (3, 2));
        assert_eq!(store.vector("b1").unwrap().len(), 2);
        assert_eq!(store.n_elements(), 8);
        assert!(matches!(store.get("w1"), Err(ParamError::Unknown(k)) if k == "w1"));
        assert!(matches!(
            store.vector("W1"),
            Err(ParamError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_replace_keeps_shape() {
        let mut store = store();
        let old = store
            .replace("W1", ArrayD::from_elem(IxDyn(&[3, 2]), 1.0))
            .unwrap();
        assert!(old.iter().all(|v| *v == 0.0));
        assert!(store.get("W1").unwrap().iter().all(|v| *v == 1.0));

        let err = store
            .replace("W1", ArrayD::zeros(IxDyn(&[2, 3])))
            .unwrap_err();
        assert!(matches!(err, ParamError::ShapeMismatch { .. }));
        assert!(matches!(
            store.replace("W2", ArrayD::zeros(IxDyn(&[1]))),
            Err(ParamError::Unknown(_))
        ));
    }

    #[test]
    fn test_check_gradients() {
        let store = store();
        let mut grads: Gradients<f64> = store
            .iter()
            .map(|(k, v)| (k.clone(), ArrayD::zeros(v.raw_dim())))
            .collect();
        store.check_gradients(&grads).unwrap();

        grads.insert("b1".to_string(), ArrayD::zeros(IxDyn(&[3])));
        assert!(store.check_gradients(&grads).is_err());
        grads.remove("b1");
        assert!(store.check_gradients(&grads).is_err());
    }

    #[test]
    fn test_check_layout() {
        let store = store();
        store.check_layout(&store.clone()).unwrap();

        let mut other = ParamStore::new();
        other.insert("W1", Array2::<f64>::zeros((3, 2)).into_dyn());
        assert!(matches!(
            store.check_layout(&other),
            Err(ParamError::Unknown(k)) if k == "b1"
        ));
        other.insert("b1", Array1::<f64>::zeros(3).into_dyn());
        assert!(matches!(
            store.check_layout(&other),
            Err(ParamError::ShapeMismatch { .. })
        ));
    }
}
