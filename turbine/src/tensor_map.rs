//! Named tensor I/O map
//!
//! The engine hands its collaborators (model forward, dynamic decode) a map
//! from symbolic names such as `"logits"` or `"output_ids"` to borrowed
//! backend tensors. Consumers look tensors up with the dtype and shape they
//! expect; any difference is reported as an error instead of being
//! reinterpreted.

use std::collections::BTreeMap;

use crate::dtype::DType;
use crate::tensor::Tensor;
use crate::{Error, Result};

enum Entry<'a, T> {
    Shared(&'a T),
    Exclusive(&'a mut T),
}

/// Mapping from tensor names to borrowed tensors.
pub struct TensorMap<'a, T: Tensor> {
    entries: BTreeMap<String, Entry<'a, T>>,
}

impl<T: Tensor> Default for TensorMap<'_, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a, T: Tensor> TensorMap<'a, T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Insert a read-only tensor, replacing any previous entry.
    pub fn insert(&mut self, name: impl Into<String>, tensor: &'a T) -> &mut Self {
        self.entries.insert(name.into(), Entry::Shared(tensor));
        self
    }

    /// Insert a writable tensor, replacing any previous entry.
    pub fn insert_mut(&mut self, name: impl Into<String>, tensor: &'a mut T) -> &mut Self {
        self.entries.insert(name.into(), Entry::Exclusive(tensor));
        self
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Names present in the map, in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Look up a tensor by name without validation.
    ///
    /// # Errors
    /// Returns [`Error::MissingTensor`] if the name is absent.
    pub fn get(&self, name: &str) -> Result<&T> {
        match self.entries.get(name) {
            Some(Entry::Shared(t)) => Ok(*t),
            Some(Entry::Exclusive(t)) => Ok(&**t),
            None => Err(Error::MissingTensor(name.to_string())),
        }
    }

    /// Look up a writable tensor by name without validation.
    ///
    /// # Errors
    /// Returns [`Error::MissingTensor`] if the name is absent and
    /// [`Error::Other`] if it was inserted read-only.
    pub fn get_mut(&mut self, name: &str) -> Result<&mut T> {
        match self.entries.get_mut(name) {
            Some(Entry::Exclusive(t)) => Ok(&mut **t),
            Some(Entry::Shared(_)) => Err(Error::Other(format!(
                "tensor `{name}` was inserted read-only"
            ))),
            None => Err(Error::MissingTensor(name.to_string())),
        }
    }

    /// Look up a tensor and check its dtype and exact shape.
    ///
    /// # Errors
    /// Returns [`Error::MissingTensor`], [`Error::DtypeMismatch`] or
    /// [`Error::ShapeMismatch`].
    pub fn expect(&self, name: &str, dtype: DType, shape: &[usize]) -> Result<&T> {
        let tensor = self.get(name)?;
        check(name, tensor, dtype, shape)?;
        Ok(tensor)
    }

    /// Writable counterpart of [`expect`](Self::expect).
    ///
    /// # Errors
    /// Same as [`expect`](Self::expect), plus [`Error::Other`] for read-only
    /// entries.
    pub fn expect_mut(&mut self, name: &str, dtype: DType, shape: &[usize]) -> Result<&mut T> {
        let tensor = self.get_mut(name)?;
        check(name, tensor, dtype, shape)?;
        Ok(tensor)
    }
}

fn check<T: Tensor>(name: &str, tensor: &T, dtype: DType, shape: &[usize]) -> Result<()> {
    if tensor.dtype() != dtype {
        return Err(Error::DtypeMismatch {
            name: name.to_string(),
            expected: dtype,
            got: tensor.dtype(),
        });
    }
    if tensor.shape() != shape {
        return Err(Error::ShapeMismatch {
            name: name.to_string(),
            expected: shape.to_vec(),
            got: tensor.shape().to_vec(),
        });
    }
    Ok(())
}
