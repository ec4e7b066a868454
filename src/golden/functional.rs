//! Layer primitives of the golden model.
//!
//! Every function is generic over [`Element`] so the integer golden path, the wide
//! accumulator of the fused layer and the floating-point reference share one
//! definition. Output rows are computed in parallel; each row is a sequential
//! sum, so results do not depend on the schedule.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{ensure_shape, GoldenError, Result};
use crate::golden::config::{Clip, Rounding};
use crate::golden::scale::FactorBias;
use crate::tensor::{Element, Tensor};

/// Division rounding toward negative infinity, for either sign of `b`.
#[inline]
pub fn floor_div(a: i64, b: i64) -> i64 {
    let q = a / b;
    if a % b != 0 && ((a < 0) != (b < 0)) { q - 1 } else { q }
}

/// `a / b` rounded to nearest with ties to even; `b` must be positive.
#[inline]
pub fn div_round_half_even(a: i64, b: i64) -> i64 {
    let q = floor_div(a, b);
    let r2 = 2 * (a - q * b);
    if r2 > b || (r2 == b && q & 1 != 0) { q + 1 } else { q }
}

/// Zero padding `(start, end)` that keeps the length of a "same" convolution.
pub fn same_padding(kernel_len: usize) -> Result<(usize, usize)> {
    match kernel_len {
        0 => Err(GoldenError::InvalidConfig("convolution kernel must not be empty".into())),
        k if k % 2 == 0 => Ok((k / 2 - 1, k / 2)),
        k => Ok(((k - 1) / 2, (k - 1) / 2)),
    }
}

fn expect_ndim<T>(context: &str, x: &Tensor<T>, ndim: usize) -> Result<()> {
    if x.ndim() != ndim {
        return Err(GoldenError::ShapeMismatch {
            context: format!("{} (expected {} dimensions)", context, ndim),
            expected: vec![0; ndim],
            actual: x.shape().to_vec(),
        });
    }
    Ok(())
}

/// One output row of a "same"-mode convolution (kernel reversed, zero padded).
fn convolve_same<A: Element>(x: &[A], w: &[A], out: &mut [A]) {
    let k = w.len();
    let start = if k % 2 == 0 { k / 2 - 1 } else { (k - 1) / 2 };
    for (t, o) in out.iter_mut().enumerate() {
        let mut acc = A::default();
        for j in 0..k {
            let i = t + j;
            if i < start || i - start >= x.len() { continue; }
            acc += x[i - start] * w[k - 1 - j];
        }
        *o = acc;
    }
}

#[inline]
fn dot<A: Element>(a: &[A], b: &[A]) -> A {
    let mut acc = A::default();
    for (&x, &y) in a.iter().zip(b) { acc += x * y; }
    acc
}

/// Rescale integers: `y = (x + bias + (round ? factor // 2 : 0)) // factor`, then clip.
///
/// A per-channel pair is indexed by the leading axis of `x`.
pub fn apply_factor_offset<A: Copy + Into<i64>>(
    x: &Tensor<A>,
    fb: &FactorBias,
    rounding: Rounding,
    clip: Clip,
) -> Result<Tensor<i32>> {
    if let Some(ch) = fb.channels() {
        let lead = x.shape().first().copied().unwrap_or(0);
        if lead != ch {
            return Err(GoldenError::ShapeMismatch {
                context: "apply_factor_offset: leading axis vs factor table".into(),
                expected: vec![ch],
                actual: x.shape().to_vec(),
            });
        }
    }
    let (lo, hi) = clip.bounds();
    let inner = x.inner_len().max(1);
    let mut y = Tensor::<i32>::zeros(x.shape().to_vec());
    y.data_mut().iter_mut().zip(x.data()).enumerate().for_each(|(i, (o, &v))| {
        let (f, b) = fb.get(i / inner);
        let f = f as i64;
        let round = match rounding {
            Rounding::Nearest => floor_div(f, 2),
            Rounding::Floor => 0,
        };
        let q = floor_div(v.into() + b as i64 + round, f);
        *o = q.clamp(lo, hi) as i32;
    });
    Ok(y)
}

/// `y[k] = max(x[k], threshold[k])`; a single threshold broadcasts over all channels.
pub fn relu<A: Element>(x: &Tensor<A>, threshold: &[A]) -> Result<Tensor<A>> {
    let lead = x.shape().first().copied().unwrap_or(0);
    if threshold.len() != 1 && threshold.len() != lead {
        return Err(GoldenError::ShapeMismatch {
            context: "relu threshold".into(),
            expected: vec![lead],
            actual: vec![threshold.len()],
        });
    }
    let inner = x.inner_len().max(1);
    let mut y = x.clone();
    for (i, v) in y.data_mut().iter_mut().enumerate() {
        let th = if threshold.len() == 1 { threshold[0] } else { threshold[i / inner] };
        *v = A::max_of(*v, th);
    }
    Ok(y)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reduction {
    Sum,
    /// Integer tensors round the mean half to even.
    Mean,
    Max,
}

/// Non-overlapping pooling of a `[K, T]` tensor with window `(pk, pt)`; trailing
/// elements that do not fill a window are dropped.
pub fn pool<A: Element>(x: &Tensor<A>, window: (usize, usize), reduction: Reduction) -> Result<Tensor<A>> {
    expect_ndim("pool input", x, 2)?;
    let (pk, pt) = window;
    if pk == 0 || pt == 0 {
        return Err(GoldenError::InvalidConfig(format!("pool window {:?} must be non-zero", window)));
    }
    let (k_in, t_in) = (x.shape()[0], x.shape()[1]);
    let (k_out, t_out) = (k_in / pk, t_in / pt);
    let mut y = Tensor::<A>::zeros(vec![k_out, t_out]);
    for k in 0..k_out {
        for t in 0..t_out {
            let mut acc: Option<A> = None;
            for kk in k * pk..(k + 1) * pk {
                for &v in &x.row(kk)[t * pt..(t + 1) * pt] {
                    acc = Some(match (acc, reduction) {
                        (None, _) => v,
                        (Some(a), Reduction::Max) => A::max_of(a, v),
                        (Some(a), _) => a + v,
                    });
                }
            }
            let acc = acc.unwrap_or_default();
            y.data_mut()[k * t_out + t] = match reduction {
                Reduction::Mean => A::mean_of(acc, pk * pt),
                _ => acc,
            };
        }
    }
    Ok(y)
}

/// Convolution in time with shared filters: `x[C, T]`, `w[K, T']` → `[K, C, T]`.
pub fn conv_time<A: Element>(x: &Tensor<A>, w: &Tensor<A>) -> Result<Tensor<A>> {
    expect_ndim("conv_time input", x, 2)?;
    expect_ndim("conv_time weight", w, 2)?;
    same_padding(w.shape()[1])?;
    let (c, t) = (x.shape()[0], x.shape()[1]);
    let k = w.shape()[0];
    let mut y = Tensor::<A>::zeros(vec![k, c, t]);
    if t == 0 { return Ok(y); }
    y.data_mut().par_chunks_mut(t).enumerate().for_each(|(row, out)| {
        convolve_same(x.row(row % c), w.row(row / c), out);
    });
    Ok(y)
}

/// Grouped dot product over channels at every time step: `x[K1, C, T]`, `w[K2, C]` → `[K2, T]`.
///
/// Output feature `k` reads input feature map `k / D` with `D = K2 / K1`.
pub fn depthwise_conv_space<A: Element>(x: &Tensor<A>, w: &Tensor<A>) -> Result<Tensor<A>> {
    expect_ndim("depthwise_conv_space input", x, 3)?;
    expect_ndim("depthwise_conv_space weight", w, 2)?;
    let (k1, c, t) = (x.shape()[0], x.shape()[1], x.shape()[2]);
    let k2 = w.shape()[0];
    ensure_shape("depthwise_conv_space channels", &[c], &[w.shape()[1]])?;
    if k1 == 0 || k2 % k1 != 0 {
        return Err(GoldenError::InvalidConfig(format!("K2 = {} is not a multiple of K1 = {}", k2, k1)));
    }
    let d = k2 / k1;
    let mut y = Tensor::<A>::zeros(vec![k2, t]);
    if t == 0 { return Ok(y); }
    y.data_mut().par_chunks_mut(t).enumerate().for_each(|(k, out)| {
        let fmap = x.row(k / d);
        let wk = w.row(k);
        for (ti, o) in out.iter_mut().enumerate() {
            let mut acc = A::default();
            for ch in 0..c { acc += fmap[ch * t + ti] * wk[ch]; }
            *o = acc;
        }
    });
    Ok(y)
}

/// Convolution in time with one private filter per channel: `x[K, T]`, `w[K, T']` → `[K, T]`.
pub fn depthwise_conv_time<A: Element>(x: &Tensor<A>, w: &Tensor<A>) -> Result<Tensor<A>> {
    expect_ndim("depthwise_conv_time input", x, 2)?;
    expect_ndim("depthwise_conv_time weight", w, 2)?;
    ensure_shape("depthwise_conv_time channels", &[x.shape()[0]], &[w.shape()[0]])?;
    same_padding(w.shape()[1])?;
    let t = x.shape()[1];
    let mut y = Tensor::<A>::zeros(x.shape().to_vec());
    if t == 0 { return Ok(y); }
    y.data_mut().par_chunks_mut(t).enumerate().for_each(|(k, out)| {
        convolve_same(x.row(k), w.row(k), out);
    });
    Ok(y)
}

/// 1x1 convolution: `x[K, T]`, `w[K', K]` → `[K', T]`.
pub fn pointwise_conv<A: Element>(x: &Tensor<A>, w: &Tensor<A>) -> Result<Tensor<A>> {
    expect_ndim("pointwise_conv input", x, 2)?;
    expect_ndim("pointwise_conv weight", w, 2)?;
    ensure_shape("pointwise_conv channels", &[x.shape()[0]], &[w.shape()[1]])?;
    let (k_in, t) = (x.shape()[0], x.shape()[1]);
    let k_out = w.shape()[0];
    let mut y = Tensor::<A>::zeros(vec![k_out, t]);
    if t == 0 { return Ok(y); }
    y.data_mut().par_chunks_mut(t).enumerate().for_each(|(ko, out)| {
        let wk = w.row(ko);
        for ki in 0..k_in {
            let xr = x.row(ki);
            for (o, &v) in out.iter_mut().zip(xr) { *o += v * wk[ki]; }
        }
    });
    Ok(y)
}

/// Fully connected layer: `x[K]`, `w[N, K]`, `b[N]` → `[N]`.
pub fn linear<A: Element>(x: &Tensor<A>, w: &Tensor<A>, b: &Tensor<A>) -> Result<Tensor<A>> {
    expect_ndim("linear input", x, 1)?;
    expect_ndim("linear weight", w, 2)?;
    expect_ndim("linear bias", b, 1)?;
    ensure_shape("linear input length", &[w.shape()[1]], x.shape())?;
    ensure_shape("linear bias length", &[w.shape()[0]], b.shape())?;
    let n = w.shape()[0];
    let y: Vec<A> = (0..n).map(|i| dot(x.data(), w.row(i)) + b.data()[i]).collect();
    Ok(Tensor::from_vec(y))
}

/// Floating-point batch norm with folded parameters: `y[k] = x[k] * scale[k] + offset[k]`.
pub fn batch_norm(x: &Tensor<f64>, scale: &[f64], offset: &[f64]) -> Result<Tensor<f64>> {
    let lead = x.shape().first().copied().unwrap_or(0);
    ensure_shape("batch_norm scale", &[lead], &[scale.len()])?;
    ensure_shape("batch_norm offset", &[lead], &[offset.len()])?;
    let inner = x.inner_len().max(1);
    let mut y = x.clone();
    for (i, v) in y.data_mut().iter_mut().enumerate() {
        *v = *v * scale[i / inner] + offset[i / inner];
    }
    Ok(y)
}
