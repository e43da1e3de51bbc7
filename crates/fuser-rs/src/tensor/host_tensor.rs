//! Host-backed strided tensor used for fusion inputs and outputs, references and tests.

use super::dtype::DType;
use crate::layout::{contiguous_strides, MemoryFormat};
use anyhow::{bail, ensure, Result};
use half::{bf16, f16};
use rand::Rng;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug, Clone)]
enum Storage {
    F16(Vec<f16>),
    BF16(Vec<bf16>),
    F32(Vec<f32>),
    F64(Vec<f64>),
}

impl Storage {
    fn from_f64(dtype: DType, values: &[f64]) -> Self {
        match dtype {
            DType::F16 => Storage::F16(values.iter().map(|&v| f16::from_f64(v)).collect()),
            DType::BF16 => Storage::BF16(values.iter().map(|&v| bf16::from_f64(v)).collect()),
            DType::F32 => Storage::F32(values.iter().map(|&v| v as f32).collect()),
            DType::F64 => Storage::F64(values.to_vec()),
        }
    }

    fn get(&self, index: usize) -> f64 {
        match self {
            Storage::F16(data) => data[index].to_f64(),
            Storage::BF16(data) => data[index].to_f64(),
            Storage::F32(data) => data[index] as f64,
            Storage::F64(data) => data[index],
        }
    }

    fn set(&mut self, index: usize, value: f64) {
        match self {
            Storage::F16(data) => data[index] = f16::from_f64(value),
            Storage::BF16(data) => data[index] = bf16::from_f64(value),
            Storage::F32(data) => data[index] = value as f32,
            Storage::F64(data) => data[index] = value,
        }
    }

    fn len(&self) -> usize {
        match self {
            Storage::F16(data) => data.len(),
            Storage::BF16(data) => data.len(),
            Storage::F32(data) => data.len(),
            Storage::F64(data) => data.len(),
        }
    }
}

/// Strided view over shared host storage.
///
/// Cloning a `Tensor` clones the handle, not the data: both handles observe writes made through
/// [`Tensor::copy_from`]. Views created by [`Tensor::permute`] share storage the same way.
#[derive(Debug, Clone)]
pub struct Tensor {
    storage: Arc<RwLock<Storage>>,
    sizes: Vec<usize>,
    strides: Vec<usize>,
    dtype: DType,
}

impl Tensor {
    /// Builds a row-major tensor, rounding every value to `dtype`.
    pub fn from_vec(sizes: impl Into<Vec<usize>>, data: Vec<f64>, dtype: DType) -> Result<Self> {
        let sizes = sizes.into();
        let numel: usize = sizes.iter().product();
        if data.len() != numel {
            bail!(
                "tensor data length ({}) does not match shape {:?}",
                data.len(),
                sizes
            );
        }
        Ok(Self::from_storage(Storage::from_f64(dtype, &data), sizes, dtype))
    }

    /// Convenience constructor for `F32` payloads.
    pub fn from_f32(sizes: impl Into<Vec<usize>>, data: Vec<f32>) -> Result<Self> {
        let sizes = sizes.into();
        let numel: usize = sizes.iter().product();
        if data.len() != numel {
            bail!(
                "tensor data length ({}) does not match shape {:?}",
                data.len(),
                sizes
            );
        }
        Ok(Self::from_storage(Storage::F32(data), sizes, DType::F32))
    }

    /// Row-major constructor for callers that already hold `numel` values.
    pub(crate) fn from_values(sizes: Vec<usize>, values: &[f64], dtype: DType) -> Self {
        debug_assert_eq!(values.len(), sizes.iter().product::<usize>());
        Self::from_storage(Storage::from_f64(dtype, values), sizes, dtype)
    }

    fn from_storage(storage: Storage, sizes: Vec<usize>, dtype: DType) -> Self {
        let strides = contiguous_strides(&sizes);
        Tensor {
            storage: Arc::new(RwLock::new(storage)),
            sizes,
            strides,
            dtype,
        }
    }

    pub fn full(sizes: impl Into<Vec<usize>>, value: f64, dtype: DType) -> Self {
        let sizes = sizes.into();
        let numel: usize = sizes.iter().product();
        Self::from_storage(Storage::from_f64(dtype, &vec![value; numel]), sizes, dtype)
    }

    pub fn zeros(sizes: impl Into<Vec<usize>>, dtype: DType) -> Self {
        Self::full(sizes, 0.0, dtype)
    }

    pub fn ones(sizes: impl Into<Vec<usize>>, dtype: DType) -> Self {
        Self::full(sizes, 1.0, dtype)
    }

    /// Rank-0 tensor holding a single value.
    pub fn scalar(value: f64, dtype: DType) -> Self {
        Self::full(Vec::new(), value, dtype)
    }

    /// Samples from a normal distribution (`N(0, std^2)`) using the Box-Muller transform.
    pub fn randn(sizes: impl Into<Vec<usize>>, std: f64, dtype: DType, rng: &mut impl Rng) -> Self {
        let sizes = sizes.into();
        let len: usize = sizes.iter().product();
        let mut values = Vec::with_capacity(len);
        while values.len() < len {
            let u1: f64 = rng.gen::<f64>().max(f64::MIN_POSITIVE);
            let u2: f64 = rng.gen::<f64>();
            let r = (-2.0 * u1.ln()).sqrt();
            let theta = 2.0 * std::f64::consts::PI * u2;
            values.push(r * theta.cos() * std);
            if values.len() < len {
                values.push(r * theta.sin() * std);
            }
        }
        Self::from_storage(Storage::from_f64(dtype, &values), sizes, dtype)
    }

    pub fn sizes(&self) -> &[usize] {
        &self.sizes
    }

    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    pub fn dim(&self) -> usize {
        self.sizes.len()
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Returns the total number of logical elements.
    pub fn numel(&self) -> usize {
        self.sizes.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.numel() == 0
    }

    /// True when both handles refer to the same underlying buffer.
    pub fn shares_storage(&self, other: &Tensor) -> bool {
        Arc::ptr_eq(&self.storage, &other.storage)
    }

    pub fn is_contiguous(&self) -> bool {
        self.is_contiguous_format(MemoryFormat::Contiguous)
    }

    pub fn is_contiguous_format(&self, format: MemoryFormat) -> bool {
        format.is_satisfied_by(&self.sizes, &self.strides)
    }

    /// Reorders the axes without copying: axis `i` of the result is axis `perm[i]` of `self`.
    pub fn permute(&self, perm: &[usize]) -> Result<Tensor> {
        ensure!(
            perm.len() == self.dim(),
            "permutation {:?} does not match tensor rank {}",
            perm,
            self.dim()
        );
        let mut seen = vec![false; perm.len()];
        for &axis in perm {
            ensure!(
                axis < perm.len() && !seen[axis],
                "invalid permutation {:?}",
                perm
            );
            seen[axis] = true;
        }
        Ok(Tensor {
            storage: Arc::clone(&self.storage),
            sizes: perm.iter().map(|&axis| self.sizes[axis]).collect(),
            strides: perm.iter().map(|&axis| self.strides[axis]).collect(),
            dtype: self.dtype,
        })
    }

    /// Returns `self` when already row-major, otherwise a row-major copy.
    pub fn contiguous(&self) -> Tensor {
        if self.is_contiguous() {
            return self.clone();
        }
        Self::from_storage(
            Storage::from_f64(self.dtype, &self.to_vec_f64()),
            self.sizes.clone(),
            self.dtype,
        )
    }

    /// Copies the tensor into a dense buffer laid out in `format`.
    pub fn to_memory_format(&self, format: MemoryFormat) -> Result<Tensor> {
        let Some(strides) = format.strides_for(&self.sizes) else {
            bail!(
                "memory format {:?} does not apply to rank {} tensors",
                format,
                self.dim()
            );
        };
        let numel = self.numel();
        let mut storage = Storage::from_f64(self.dtype, &vec![0.0; numel]);
        let values = self.to_vec_f64();
        for (value, offset) in values.into_iter().zip(offsets(&self.sizes, &strides)) {
            storage.set(offset, value);
        }
        Ok(Tensor {
            storage: Arc::new(RwLock::new(storage)),
            sizes: self.sizes.clone(),
            strides,
            dtype: self.dtype,
        })
    }

    /// Returns a row-major copy converted to `dtype`.
    pub fn to_dtype(&self, dtype: DType) -> Tensor {
        Self::from_storage(
            Storage::from_f64(dtype, &self.to_vec_f64()),
            self.sizes.clone(),
            dtype,
        )
    }

    /// Logical elements in row-major order, widened to `f64`.
    pub fn to_vec_f64(&self) -> Vec<f64> {
        let storage = self.read();
        offsets(&self.sizes, &self.strides)
            .map(|offset| storage.get(offset))
            .collect()
    }

    pub fn to_vec_f32(&self) -> Vec<f32> {
        self.to_vec_f64().into_iter().map(|v| v as f32).collect()
    }

    /// Reads the element at a logical multi-index.
    pub fn get(&self, index: &[usize]) -> Result<f64> {
        ensure!(
            index.len() == self.dim(),
            "index {:?} does not match tensor rank {}",
            index,
            self.dim()
        );
        let mut offset = 0usize;
        for ((&i, &size), &stride) in index.iter().zip(&self.sizes).zip(&self.strides) {
            ensure!(i < size, "index {:?} out of bounds for shape {:?}", index, self.sizes);
            offset += i * stride;
        }
        Ok(self.read().get(offset))
    }

    /// Value of a single-element tensor.
    pub fn item(&self) -> Result<f64> {
        ensure!(
            self.numel() == 1,
            "item() requires a single-element tensor, got shape {:?}",
            self.sizes
        );
        Ok(self.to_vec_f64()[0])
    }

    /// Overwrites this tensor's elements in place with the values of `src`, rounding to this
    /// tensor's dtype. Every handle sharing the storage observes the update.
    pub fn copy_from(&self, src: &Tensor) -> Result<()> {
        ensure!(
            self.sizes == src.sizes,
            "cannot copy a tensor of shape {:?} into shape {:?}",
            src.sizes,
            self.sizes
        );
        let values = src.to_vec_f64();
        let mut storage = self.write();
        ensure!(
            offsets(&self.sizes, &self.strides).all(|offset| offset < storage.len()),
            "tensor view exceeds its storage"
        );
        for (value, offset) in values.into_iter().zip(offsets(&self.sizes, &self.strides)) {
            storage.set(offset, value);
        }
        Ok(())
    }

    fn read(&self) -> RwLockReadGuard<'_, Storage> {
        self.storage.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Storage> {
        self.storage.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Storage offsets of every logical element, in row-major order.
pub(crate) fn offsets<'a>(sizes: &'a [usize], strides: &'a [usize]) -> impl Iterator<Item = usize> + 'a {
    let numel: usize = sizes.iter().product();
    let mut index = vec![0usize; sizes.len()];
    let mut offset = 0usize;
    (0..numel).map(move |step| {
        if step > 0 {
            for axis in (0..sizes.len()).rev() {
                index[axis] += 1;
                offset += strides[axis];
                if index[axis] < sizes[axis] {
                    break;
                }
                offset -= strides[axis] * sizes[axis];
                index[axis] = 0;
            }
        }
        offset
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permute_shares_storage_and_reorders_values() {
        let t = Tensor::from_vec([2, 3], (0..6).map(f64::from).collect(), DType::F32).unwrap();
        let p = t.permute(&[1, 0]).unwrap();
        assert!(p.shares_storage(&t));
        assert_eq!(p.sizes(), &[3, 2]);
        assert_eq!(p.to_vec_f64(), vec![0.0, 3.0, 1.0, 4.0, 2.0, 5.0]);
        assert!(!p.is_contiguous());
        assert!(!p.contiguous().shares_storage(&t));
    }

    #[test]
    fn copy_from_updates_every_handle() {
        let t = Tensor::zeros([3], DType::F16);
        let alias = t.clone();
        let src = Tensor::from_vec([3], vec![1.0, 2.0, 3.0], DType::F32).unwrap();
        t.copy_from(&src).unwrap();
        assert_eq!(alias.to_vec_f64(), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn channels_last_copy_keeps_logical_values() {
        let t = Tensor::from_vec([1, 2, 2, 2], (0..8).map(f64::from).collect(), DType::F64).unwrap();
        let cl = t.to_memory_format(MemoryFormat::ChannelsLast).unwrap();
        assert!(cl.is_contiguous_format(MemoryFormat::ChannelsLast));
        assert!(!cl.is_contiguous());
        assert_eq!(cl.to_vec_f64(), t.to_vec_f64());
    }

    #[test]
    fn values_are_rounded_to_storage_dtype() {
        let t = Tensor::from_vec([1], vec![0.1], DType::BF16).unwrap();
        assert_eq!(t.item().unwrap(), DType::BF16.round(0.1));
    }
}
