//! Padding of tensors to the vector width of the target, and the derived
//! dimension constants the header generator and test harness consume.

use serde::Serialize;

use crate::golden::config::NetParams;
use crate::golden::functional::same_padding;
use crate::tensor::Tensor;

/// The target loads four `i8` values per word.
pub const ALIGN_BOUNDARY: usize = 4;

/// Smallest multiple of `boundary` that is `>= len` (`boundary` 0 acts as 1).
#[inline]
pub fn align_size(len: usize, boundary: usize) -> usize {
    let b = boundary.max(1);
    len.div_ceil(b) * b
}

/// Pad the last axis of `x` to a multiple of `boundary`, filling with `fill`.
pub fn align<T: Copy>(x: &Tensor<T>, boundary: usize, fill: T) -> Tensor<T> {
    let Some(&last) = x.shape().last() else { return x.clone() };
    let aligned = align_size(last, boundary);
    if aligned == last {
        return x.clone();
    }
    let mut shape = x.shape().to_vec();
    if let Some(l) = shape.last_mut() { *l = aligned; }
    let outer: usize = x.shape().iter().rev().skip(1).product();
    let mut data = Vec::with_capacity(outer * aligned);
    for o in 0..outer {
        data.extend_from_slice(&x.data()[o * last..(o + 1) * last]);
        data.extend(std::iter::repeat(fill).take(aligned - last));
    }
    Tensor::from_fn(shape, |i| data[i])
}

/// Dimension constants of one network, including padded and aligned lengths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NetDims {
    pub f1: usize,
    pub f2: usize,
    pub d: usize,
    pub c: usize,
    pub c_align: usize,
    pub t: usize,
    pub t_align: usize,
    pub t8: usize,
    pub t8_align: usize,
    pub t64: usize,
    pub t64_align: usize,
    pub n: usize,
    pub l1_pad_start: usize,
    pub l1_pad_end: usize,
    pub l1_pad_input_len: usize,
    pub l1_pad_input_len_align: usize,
    pub l3_pad_start: usize,
    pub l3_pad_end: usize,
    pub l3_pad_input_len: usize,
    pub l3_pad_input_len_align: usize,
}

pub const L1_KERNEL_LEN: usize = 64;
pub const L3_KERNEL_LEN: usize = 16;

impl NetDims {
    pub fn new(p: &NetParams) -> Self {
        let a = |n| align_size(n, ALIGN_BOUNDARY);
        let (l1_start, l1_end) = same_padding(L1_KERNEL_LEN).unwrap_or((0, 0));
        let (l3_start, l3_end) = same_padding(L3_KERNEL_LEN).unwrap_or((0, 0));
        let l1_len = p.t + l1_start + l1_end;
        let l3_len = p.t8() + l3_start + l3_end;
        Self {
            f1: p.f1,
            f2: p.f2(),
            d: p.d,
            c: p.c,
            c_align: a(p.c),
            t: p.t,
            t_align: a(p.t),
            t8: p.t8(),
            t8_align: a(p.t8()),
            t64: p.t64(),
            t64_align: a(p.t64()),
            n: p.n,
            l1_pad_start: l1_start,
            l1_pad_end: l1_end,
            l1_pad_input_len: l1_len,
            l1_pad_input_len_align: a(l1_len),
            l3_pad_start: l3_start,
            l3_pad_end: l3_end,
            l3_pad_input_len: l3_len,
            l3_pad_input_len_align: a(l3_len),
        }
    }
}
