//! CPU tensor implementation.

use turbine::dtype::{DType, TensorDType};
use turbine::tensor::Tensor;
use turbine::{Error, Result};

/// A host-resident tensor backed by 8-byte aligned storage.
///
/// The backing words are reinterpreted with `bytemuck`, so every supported
/// element type can be viewed in place.
#[derive(Clone)]
pub struct CpuTensor {
    data: Vec<u64>,
    shape: Vec<usize>,
    dtype: DType,
}

impl CpuTensor {
    /// Create a zero-filled tensor.
    #[must_use]
    pub fn zeros(shape: &[usize], dtype: DType) -> Self {
        let numel: usize = shape.iter().product();
        Self::from_storage(vec![0; words_for(numel * dtype.size_in_bytes())], shape, dtype)
    }

    /// Create a tensor from a typed slice.
    ///
    /// # Panics
    /// Panics if `data.len()` does not match the shape.
    #[must_use]
    pub fn from_slice<T: TensorDType>(shape: &[usize], data: &[T]) -> Self {
        let numel: usize = shape.iter().product();
        assert_eq!(
            data.len(),
            numel,
            "data len {} != shape product {numel}",
            data.len()
        );
        let mut tensor = Self::zeros(shape, T::DTYPE);
        tensor.as_bytes_mut().copy_from_slice(bytemuck::cast_slice(data));
        tensor
    }

    /// Wrap recycled storage; the words are used as-is.
    pub(crate) fn from_storage(data: Vec<u64>, shape: &[usize], dtype: DType) -> Self {
        let numel: usize = shape.iter().product();
        debug_assert!(data.len() * 8 >= numel * dtype.size_in_bytes());
        Self {
            data,
            shape: shape.to_vec(),
            dtype,
        }
    }

    pub(crate) fn into_storage(self) -> Vec<u64> {
        self.data
    }

    /// Raw bytes of the tensor.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        let len = self.size_in_bytes();
        &bytemuck::cast_slice(&self.data)[..len]
    }

    /// Mutable raw bytes of the tensor.
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        let len = self.size_in_bytes();
        &mut bytemuck::cast_slice_mut(&mut self.data)[..len]
    }

    /// View the data as `T`.
    ///
    /// # Errors
    /// Returns [`Error::DtypeMismatch`] if `T` is not the tensor's dtype.
    pub fn as_slice<T: TensorDType>(&self) -> Result<&[T]> {
        self.check_dtype::<T>()?;
        Ok(bytemuck::cast_slice(self.as_bytes()))
    }

    /// Mutable view of the data as `T`.
    ///
    /// # Errors
    /// Returns [`Error::DtypeMismatch`] if `T` is not the tensor's dtype.
    pub fn as_mut_slice<T: TensorDType>(&mut self) -> Result<&mut [T]> {
        self.check_dtype::<T>()?;
        Ok(bytemuck::cast_slice_mut(self.as_bytes_mut()))
    }

    /// Copy the data out as `T`.
    ///
    /// # Errors
    /// Returns [`Error::DtypeMismatch`] if `T` is not the tensor's dtype.
    pub fn to_vec<T: TensorDType>(&self) -> Result<Vec<T>> {
        Ok(self.as_slice::<T>()?.to_vec())
    }

    /// Convert to an f32 Vec, casting from bf16/f16 if necessary.
    ///
    /// # Errors
    /// Returns [`Error::UnsupportedDtype`] for non-float tensors.
    pub fn to_f32_vec(&self) -> Result<Vec<f32>> {
        match self.dtype {
            DType::F32 => self.to_vec::<f32>(),
            DType::BF16 => Ok(self
                .as_slice::<half::bf16>()?
                .iter()
                .map(|v| v.to_f32())
                .collect()),
            DType::F16 => Ok(self
                .as_slice::<half::f16>()?
                .iter()
                .map(|v| v.to_f32())
                .collect()),
            other => Err(Error::UnsupportedDtype(other)),
        }
    }

    fn check_dtype<T: TensorDType>(&self) -> Result<()> {
        if self.dtype == T::DTYPE {
            Ok(())
        } else {
            Err(Error::DtypeMismatch {
                name: "cpu tensor".into(),
                expected: T::DTYPE,
                got: self.dtype,
            })
        }
    }
}

impl Tensor for CpuTensor {
    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn dtype(&self) -> DType {
        self.dtype
    }
}

pub(crate) fn words_for(bytes: usize) -> usize {
    bytes.div_ceil(8)
}
