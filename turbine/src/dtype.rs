//! Data types for tensor elements

use std::fmt;

use half::{bf16, f16};

/// Supported data types for tensors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    /// 32-bit floating point
    F32,
    /// 16-bit floating point (IEEE 754)
    F16,
    /// Brain floating point (16-bit)
    BF16,
    /// 32-bit unsigned integer (token ids, lengths)
    U32,
    /// 32-bit signed integer
    I32,
    /// 64-bit unsigned integer (RNG state, block pointers)
    U64,
    /// Single byte (flags)
    U8,
}

impl DType {
    /// Size of the dtype in bytes
    #[must_use]
    pub const fn size_in_bytes(self) -> usize {
        match self {
            Self::U64 => 8,
            Self::F32 | Self::U32 | Self::I32 => 4,
            Self::F16 | Self::BF16 => 2,
            Self::U8 => 1,
        }
    }

    /// Whether values of this dtype can hold logits.
    #[must_use]
    pub const fn is_float(self) -> bool {
        matches!(self, Self::F32 | Self::F16 | Self::BF16)
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::F32 => write!(f, "f32"),
            Self::F16 => write!(f, "f16"),
            Self::BF16 => write!(f, "bf16"),
            Self::U32 => write!(f, "u32"),
            Self::I32 => write!(f, "i32"),
            Self::U64 => write!(f, "u64"),
            Self::U8 => write!(f, "u8"),
        }
    }
}

/// Trait for types that can be used as tensor elements
pub trait TensorDType: bytemuck::Pod + Default + Send + Sync + 'static {
    /// The corresponding `DType` enum value
    const DTYPE: DType;
}

impl TensorDType for f32 {
    const DTYPE: DType = DType::F32;
}

impl TensorDType for f16 {
    const DTYPE: DType = DType::F16;
}

impl TensorDType for bf16 {
    const DTYPE: DType = DType::BF16;
}

impl TensorDType for u32 {
    const DTYPE: DType = DType::U32;
}

impl TensorDType for i32 {
    const DTYPE: DType = DType::I32;
}

impl TensorDType for u64 {
    const DTYPE: DType = DType::U64;
}

impl TensorDType for u8 {
    const DTYPE: DType = DType::U8;
}

/// Element types a logits buffer may hold.
///
/// Arithmetic is always carried out in f32; `MIN_FINITE` is the value
/// written into masked columns so that no max/top-k sampler can pick them.
pub trait LogitDType: TensorDType + PartialOrd {
    /// Most negative finite value of the type
    const MIN_FINITE: Self;

    fn to_f32(self) -> f32;

    fn from_f32(value: f32) -> Self;
}

impl LogitDType for f32 {
    const MIN_FINITE: Self = f32::MIN;

    #[inline]
    fn to_f32(self) -> f32 {
        self
    }

    #[inline]
    fn from_f32(value: f32) -> Self {
        value
    }
}

impl LogitDType for f16 {
    // -65504.0
    const MIN_FINITE: Self = f16::MIN;

    #[inline]
    fn to_f32(self) -> f32 {
        f16::to_f32(self)
    }

    #[inline]
    fn from_f32(value: f32) -> Self {
        f16::from_f32(value)
    }
}

impl LogitDType for bf16 {
    const MIN_FINITE: Self = bf16::MIN;

    #[inline]
    fn to_f32(self) -> f32 {
        bf16::to_f32(self)
    }

    #[inline]
    fn from_f32(value: f32) -> Self {
        bf16::from_f32(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dtype_size_in_bytes() {
        assert_eq!(DType::F32.size_in_bytes(), 4);
        assert_eq!(DType::F16.size_in_bytes(), 2);
        assert_eq!(DType::BF16.size_in_bytes(), 2);
        assert_eq!(DType::U32.size_in_bytes(), 4);
        assert_eq!(DType::U64.size_in_bytes(), 8);
        assert_eq!(DType::U8.size_in_bytes(), 1);
    }

    #[test]
    fn test_dtype_display() {
        assert_eq!(format!("{}", DType::F32), "f32");
        assert_eq!(format!("{}", DType::BF16), "bf16");
        assert_eq!(format!("{}", DType::U64), "u64");
    }

    #[test]
    fn test_tensor_dtype_trait() {
        assert_eq!(f32::DTYPE, DType::F32);
        assert_eq!(f16::DTYPE, DType::F16);
        assert_eq!(bf16::DTYPE, DType::BF16);
        assert_eq!(u64::DTYPE, DType::U64);
        assert!(DType::BF16.is_float());
        assert!(!DType::U32.is_float());
    }

    #[test]
    fn test_min_finite_values() {
        assert_eq!(<f16 as LogitDType>::MIN_FINITE.to_f32(), -65504.0);
        assert_eq!(<f32 as LogitDType>::MIN_FINITE, f32::MIN);
        assert!(<bf16 as LogitDType>::MIN_FINITE.to_f32().is_finite());
    }
}
