//! Tensor trait definition

use crate::dtype::DType;

/// Core tensor trait shared by all backend buffers
///
/// Backends (CUDA, CPU) store data however suits the device; the scheduler
/// only relies on shape and dtype metadata, and moves data through the
/// backend op traits.
pub trait Tensor: Send + 'static {
    /// Returns the shape of the tensor as a slice of dimensions
    fn shape(&self) -> &[usize];

    /// Returns the data type of tensor elements
    fn dtype(&self) -> DType;

    /// Returns the total number of elements in the tensor
    fn numel(&self) -> usize {
        self.shape().iter().product()
    }

    /// Returns the number of dimensions (rank) of the tensor
    fn ndim(&self) -> usize {
        self.shape().len()
    }

    /// Number of rows along the leading dimension (1 for scalars)
    fn rows(&self) -> usize {
        self.shape().first().copied().unwrap_or(1)
    }

    /// Number of elements in one leading-dimension row
    fn row_numel(&self) -> usize {
        self.shape().iter().skip(1).product()
    }

    /// Returns the size of the tensor data in bytes
    fn size_in_bytes(&self) -> usize {
        self.numel() * self.dtype().size_in_bytes()
    }
}
