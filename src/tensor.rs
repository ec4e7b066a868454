//! Dense row-major tensors of fixed-point (or reference floating-point) values.

use std::fmt::Debug;
use std::ops::{Add, AddAssign, Mul};

use serde::{Deserialize, Serialize};

use crate::error::{GoldenError, Result};
use crate::golden::functional::div_round_half_even;

/// Scalar types the layer primitives are defined over.
///
/// `i32` carries the quantized activations, `i64` the un-rescaled accumulator of
/// the fused layer, and `f64` the floating-point reference path.
pub trait Element:
    Copy
    + Default
    + Debug
    + PartialOrd
    + Add<Output = Self>
    + Mul<Output = Self>
    + AddAssign
    + Send
    + Sync
    + 'static
{
    /// Mean of `n` values whose sum is `sum`, rounded back into `Self`.
    fn mean_of(sum: Self, n: usize) -> Self;

    #[inline]
    fn max_of(a: Self, b: Self) -> Self {
        if b > a { b } else { a }
    }
}

impl Element for i32 {
    #[inline]
    fn mean_of(sum: Self, n: usize) -> Self {
        div_round_half_even(sum as i64, n as i64) as i32
    }
}

impl Element for i64 {
    #[inline]
    fn mean_of(sum: Self, n: usize) -> Self {
        div_round_half_even(sum, n as i64)
    }
}

impl Element for f64 {
    #[inline]
    fn mean_of(sum: Self, n: usize) -> Self {
        sum / n as f64
    }
}

#[derive(Deserialize)]
struct RawTensor<T> {
    shape: Vec<usize>,
    data: Vec<T>,
}

impl<T> TryFrom<RawTensor<T>> for Tensor<T> {
    type Error = GoldenError;
    fn try_from(raw: RawTensor<T>) -> Result<Self> {
        Tensor::new(raw.shape, raw.data)
    }
}

/// A multi-dimensional array stored as one flat vector.
///
/// The element count always equals the product of the shape; every constructor
/// (including deserialization) checks it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawTensor<T>", bound(deserialize = "T: Deserialize<'de>"))]
pub struct Tensor<T> {
    shape: Vec<usize>,
    data: Vec<T>,
}

impl<T> Tensor<T> {
    pub fn new(shape: Vec<usize>, data: Vec<T>) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if data.len() != expected {
            return Err(GoldenError::DataLength { shape, expected, actual: data.len() });
        }
        Ok(Self { shape, data })
    }

    /// One-dimensional tensor owning `data`.
    pub fn from_vec(data: Vec<T>) -> Self {
        Self { shape: vec![data.len()], data }
    }

    pub fn shape(&self) -> &[usize] { &self.shape }
    pub fn data(&self) -> &[T] { &self.data }
    pub fn data_mut(&mut self) -> &mut [T] { &mut self.data }
    pub fn into_data(self) -> Vec<T> { self.data }
    pub fn ndim(&self) -> usize { self.shape.len() }
    pub fn len(&self) -> usize { self.data.len() }
    pub fn is_empty(&self) -> bool { self.data.is_empty() }

    /// Size of one slice along the leading axis.
    pub fn inner_len(&self) -> usize {
        self.shape.iter().skip(1).product()
    }

    /// The contiguous slice `self[k, ...]`.
    pub fn row(&self, k: usize) -> &[T] {
        let n = self.inner_len();
        &self.data[k * n..(k + 1) * n]
    }

    pub fn reshape(self, shape: Vec<usize>) -> Result<Self> {
        Tensor::new(shape, self.data)
    }

    pub fn flatten(self) -> Self {
        Self::from_vec(self.data)
    }

    pub fn map<U, F: FnMut(&T) -> U>(&self, f: F) -> Tensor<U> {
        Tensor { shape: self.shape.clone(), data: self.data.iter().map(f).collect() }
    }

    fn offset(&self, index: &[usize]) -> Option<usize> {
        if index.len() != self.shape.len() { return None; }
        let mut off = 0usize;
        for (&i, &d) in index.iter().zip(&self.shape) {
            if i >= d { return None; }
            off = off * d + i;
        }
        Some(off)
    }
}

impl<T: Copy> Tensor<T> {
    pub fn from_fn<F: FnMut(usize) -> T>(shape: Vec<usize>, f: F) -> Self {
        let n: usize = shape.iter().product();
        Self { shape, data: (0..n).map(f).collect() }
    }

    /// Element at a full multi-index, `None` when out of bounds.
    pub fn at(&self, index: &[usize]) -> Option<T> {
        self.offset(index).map(|o| self.data[o])
    }
}

impl<T: Copy + Default> Tensor<T> {
    pub fn zeros(shape: Vec<usize>) -> Self {
        Self::from_fn(shape, |_| T::default())
    }
}

impl<T: Copy + Into<i64>> Tensor<T> {
    /// Widen into the 64-bit accumulator type.
    pub fn widen(&self) -> Tensor<i64> {
        self.map(|&v| v.into())
    }
}

impl Tensor<i32> {
    pub fn to_f64(&self) -> Tensor<f64> {
        self.map(|&v| v as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_wrong_length() {
        let e = Tensor::new(vec![2, 3], vec![0i32; 5]).unwrap_err();
        assert_eq!(e, GoldenError::DataLength { shape: vec![2, 3], expected: 6, actual: 5 });
    }

    #[test]
    fn row_and_at_follow_row_major_order() {
        let t = Tensor::from_fn(vec![2, 2, 3], |i| i as i32);
        assert_eq!(t.row(1), &[6, 7, 8, 9, 10, 11]);
        assert_eq!(t.at(&[1, 0, 2]), Some(8));
        assert_eq!(t.at(&[2, 0, 0]), None);
    }

    #[test]
    fn integer_mean_rounds_half_to_even() {
        assert_eq!(i32::mean_of(20, 8), 2); // 2.5
        assert_eq!(i32::mean_of(28, 8), 4); // 3.5
        assert_eq!(i32::mean_of(-20, 8), -2);
        assert_eq!(i32::mean_of(-21, 8), -3);
    }

    #[test]
    fn deserialize_checks_length() {
        let ok: Tensor<f64> = serde_json::from_str(r#"{"shape":[2],"data":[1.0,2.0]}"#).unwrap();
        assert_eq!(ok.shape(), &[2]);
        let bad = serde_json::from_str::<Tensor<f64>>(r#"{"shape":[3],"data":[1.0]}"#);
        assert!(bad.is_err());
    }
}
