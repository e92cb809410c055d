//! CUDA tensor implementation

use cudarc::driver::{CudaSlice, CudaView, CudaViewMut, DevicePtr, DeviceSlice};

use turbine::dtype::{DType, TensorDType};
use turbine::tensor::Tensor;
use turbine::{Error, Result};

use super::CudaContext;

/// A device tensor.
///
/// Storage is an untyped byte allocation; the element type is carried at
/// runtime so one tensor type serves every dtype the engine moves around.
pub struct CudaTensor {
    data: CudaSlice<u8>,
    shape: Vec<usize>,
    dtype: DType,
}

impl CudaTensor {
    /// Allocate a zero-filled tensor.
    ///
    /// # Errors
    /// Returns an error if GPU memory allocation fails
    pub fn zeros(ctx: &CudaContext, shape: &[usize], dtype: DType) -> Result<Self> {
        let bytes = byte_len(shape, dtype);
        let data = ctx.device().alloc_zeros::<u8>(bytes.max(1))?;
        Ok(Self::from_bytes(data, shape, dtype))
    }

    /// Create a tensor on the GPU from host data.
    ///
    /// # Errors
    /// Returns an error if the length does not match the shape or the copy
    /// fails.
    pub fn from_slice<T: TensorDType>(ctx: &CudaContext, shape: &[usize], data: &[T]) -> Result<Self> {
        let numel: usize = shape.iter().product();
        if data.len() != numel {
            return Err(Error::InvalidShape(format!(
                "{} elements do not fill shape {shape:?}",
                data.len()
            )));
        }
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let data = if bytes.is_empty() {
            ctx.device().alloc_zeros::<u8>(1)?
        } else {
            ctx.device().htod_sync_copy(bytes)?
        };
        Ok(Self::from_bytes(data, shape, T::DTYPE))
    }

    pub(crate) fn from_bytes(data: CudaSlice<u8>, shape: &[usize], dtype: DType) -> Self {
        debug_assert!(data.len() >= byte_len(shape, dtype));
        Self {
            data,
            shape: shape.to_vec(),
            dtype,
        }
    }

    pub(crate) fn into_bytes(self) -> CudaSlice<u8> {
        self.data
    }

    pub(crate) fn bytes(&self) -> &CudaSlice<u8> {
        &self.data
    }

    pub(crate) fn bytes_mut(&mut self) -> &mut CudaSlice<u8> {
        &mut self.data
    }

    /// Byte view of `len` elements starting at element `offset`.
    ///
    /// # Errors
    /// Returns [`Error::IndexOutOfRange`] past the end of the tensor.
    pub fn view(&self, offset: usize, len: usize) -> Result<CudaView<'_, u8>> {
        let (start, end) = self.byte_range(offset, len)?;
        Ok(self.data.slice(start..end))
    }

    /// Mutable byte view of `len` elements starting at element `offset`.
    ///
    /// # Errors
    /// Returns [`Error::IndexOutOfRange`] past the end of the tensor.
    pub fn view_mut(&mut self, offset: usize, len: usize) -> Result<CudaViewMut<'_, u8>> {
        let (start, end) = self.byte_range(offset, len)?;
        Ok(self.data.slice_mut(start..end))
    }

    fn byte_range(&self, offset: usize, len: usize) -> Result<(usize, usize)> {
        if offset + len > self.numel() {
            return Err(Error::IndexOutOfRange {
                index: offset + len,
                len: self.numel(),
            });
        }
        let size = self.dtype.size_in_bytes();
        Ok((offset * size, (offset + len) * size))
    }

    /// Raw device pointer, for nullable kernel arguments.
    pub(crate) fn device_ptr(&self) -> u64 {
        *self.data.device_ptr()
    }

    /// Fail unless the tensor holds `dtype`.
    pub(crate) fn expect_dtype(&self, name: &str, dtype: DType) -> Result<()> {
        if self.dtype == dtype {
            Ok(())
        } else {
            Err(Error::DtypeMismatch {
                name: name.into(),
                expected: dtype,
                got: self.dtype,
            })
        }
    }
}

impl Tensor for CudaTensor {
    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn dtype(&self) -> DType {
        self.dtype
    }
}

fn byte_len(shape: &[usize], dtype: DType) -> usize {
    shape.iter().product::<usize>() * dtype.size_in_bytes()
}
