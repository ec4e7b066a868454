//! The five layers of the quantized EEGNet and the fused variant of layers 1 and 2.
//!
//! Every layer owns its quantized weights and factor/bias tables, is built once from
//! the exported parameters and is a pure function of its input afterwards.

use std::fmt;

use log::debug;

use crate::align::{align, ALIGN_BOUNDARY, L1_KERNEL_LEN, L3_KERNEL_LEN};
use crate::error::{ensure_range, ensure_shape, GoldenError, Result};
use crate::golden::config::{Clip, ModelOptions, NetParams, Rounding};
use crate::golden::functional::{
    apply_factor_offset, conv_time, depthwise_conv_space, depthwise_conv_time, floor_div, linear, pointwise_conv,
    pool, relu, Reduction,
};
use crate::golden::loader::{batch_norm_params, inq_conv2d, inq_linear, ste_quant, NamedTensors};
use crate::golden::quant::Levels;
use crate::golden::scale::{div_factor, div_factor_batch_norm, FactorBias};
use crate::tensor::Tensor;

/// Pooling window in time of layers 2 and 4.
pub const POOL: usize = 8;

/// Common capability of all layers in the pipeline.
pub trait Layer: Send + Sync {
    fn name(&self) -> &'static str;
    fn input_shape(&self) -> Vec<usize>;
    fn output_shape(&self) -> Vec<usize>;
    fn input_scale(&self) -> f64;
    fn output_scale(&self) -> f64;
    fn num_params(&self) -> usize;
    /// Bytes on the target: weights take 1 byte, factor and bias entries 4.
    fn mem_size(&self) -> usize;
    fn apply(&self, x: &Tensor<i32>) -> Result<Tensor<i32>>;
}

impl fmt::Display for dyn Layer + '_ {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.name())?;
        writeln!(f, "  Input:    {:?}", self.input_shape())?;
        writeln!(f, "  Output:   {:?}", self.output_shape())?;
        writeln!(f, "  n params: {}", self.num_params())?;
        write!(f, "  Memory:   {} B", self.mem_size())
    }
}

/// Shape and value range of a layer input. Inputs are outputs of a layer clipped
/// with `clip`, or of the quantizer for the first layer (always balanced).
fn check_input(layer: &dyn Layer, x: &Tensor<i32>, clip: Clip) -> Result<()> {
    ensure_shape(layer.name(), &layer.input_shape(), x.shape())?;
    ensure_range(layer.name(), x.data(), clip.bounds())
}

fn weights_as(weights: Tensor<i32>, layer: &str, stored: &[usize], shape: Vec<usize>) -> Result<Tensor<i32>> {
    ensure_shape(&format!("{} weights", layer), stored, weights.shape())?;
    weights.reshape(shape)
}

fn batch_norm_of(net: &NamedTensors, layer: &str, channels: usize) -> Result<(Vec<f64>, Vec<f64>)> {
    let (scale, offset) = batch_norm_params(net, layer)?;
    ensure_shape(&format!("{} channels", layer), &[channels], &[scale.len()])?;
    Ok((scale, offset))
}

/// ReLU, pooling by [`POOL`] and the batch-norm rescale of layers 2 and 4.
///
/// Pool first: ReLU at `-(bias // 8)`, sum-pool, then rescale with tables that
/// carry the pool multiplier. Reordered: rescale without the multiplier, ReLU at 0,
/// mean-pool.
#[derive(Debug, Clone, PartialEq)]
pub struct BnPool {
    factor_bias: FactorBias,
    threshold: Vec<i32>,
    reorder: bool,
}

impl BnPool {
    fn new(scales: (f64, f64, f64), bn: &(Vec<f64>, Vec<f64>), reorder: bool) -> Result<Self> {
        let (s_x, s_w, s_y) = scales;
        let pool_mult = if reorder { 1 } else { POOL as u32 };
        let factor_bias = div_factor_batch_norm(s_x, s_w, s_y, &bn.0, &bn.1, Levels::DEFAULT, pool_mult)?;
        let threshold = if reorder { vec![0] } else { pool_threshold(&factor_bias.biases()) };
        Ok(Self { factor_bias, threshold, reorder })
    }

    pub fn factor_bias(&self) -> &FactorBias { &self.factor_bias }
    pub fn threshold(&self) -> &[i32] { &self.threshold }
    pub fn is_reordered(&self) -> bool { self.reorder }

    fn run(&self, y: &Tensor<i32>, rounding: Rounding, clip: Clip) -> Result<Tensor<i32>> {
        if self.reorder {
            let y = apply_factor_offset(y, &self.factor_bias, rounding, clip)?;
            let y = relu(&y, &self.threshold)?;
            pool(&y, (1, POOL), Reduction::Mean)
        } else {
            let y = relu(y, &self.threshold)?;
            let y = pool(&y, (1, POOL), Reduction::Sum)?;
            apply_factor_offset(&y, &self.factor_bias, rounding, clip)
        }
    }
}

/// `-(bias // 8)` per channel.
fn pool_threshold(bias: &[i32]) -> Vec<i32> {
    bias.iter().map(|&b| -floor_div(b as i64, POOL as i64) as i32).collect()
}

/// Convolution in time + batch norm: `[C, T]` → `[F1, C, T]`.
#[derive(Debug, Clone)]
pub struct Layer1 {
    c: usize,
    t: usize,
    f1: usize,
    weights: Tensor<i32>,
    weight_scale: f64,
    input_scale: f64,
    output_scale: f64,
    factor_bias: FactorBias,
    rounding: Rounding,
    clip: Clip,
}

impl Layer1 {
    pub fn new(net: &NamedTensors, p: &NetParams, opts: &ModelOptions) -> Result<Self> {
        let (w, weight_scale) = inq_conv2d(net, "conv1", Levels::DEFAULT, false)?;
        let weights = weights_as(w, "conv1", &[p.f1, 1, 1, L1_KERNEL_LEN], vec![p.f1, L1_KERNEL_LEN])?;
        let input_scale = ste_quant(net, "quant1")?;
        let output_scale = ste_quant(net, "quant2")?;
        let (bn_s, bn_o) = batch_norm_of(net, "batch_norm1", p.f1)?;
        let factor_bias = div_factor_batch_norm(input_scale, weight_scale, output_scale, &bn_s, &bn_o, Levels::DEFAULT, 1)?;
        debug!("layer 1: {:?}", factor_bias);
        Ok(Self {
            c: p.c,
            t: p.t,
            f1: p.f1,
            weights,
            weight_scale,
            input_scale,
            output_scale,
            factor_bias,
            rounding: opts.rounding(),
            clip: opts.clip,
        })
    }

    /// `[F1, 64]`, already reversed for convolution.
    pub fn weights(&self) -> &Tensor<i32> { &self.weights }
    pub fn weight_scale(&self) -> f64 { self.weight_scale }
    pub fn factor_bias(&self) -> &FactorBias { &self.factor_bias }
}

impl Layer for Layer1 {
    fn name(&self) -> &'static str { "Layer 1: Convolution in Time + Batch Norm" }
    fn input_shape(&self) -> Vec<usize> { vec![self.c, self.t] }
    fn output_shape(&self) -> Vec<usize> { vec![self.f1, self.c, self.t] }
    fn input_scale(&self) -> f64 { self.input_scale }
    fn output_scale(&self) -> f64 { self.output_scale }
    fn num_params(&self) -> usize { self.weights.len() + self.factor_bias.table_len() }
    fn mem_size(&self) -> usize { self.weights.len() + 4 * self.factor_bias.table_len() }

    fn apply(&self, x: &Tensor<i32>) -> Result<Tensor<i32>> {
        check_input(self, x, Clip::Balanced)?;
        let y = conv_time(x, &self.weights)?;
        apply_factor_offset(&y, &self.factor_bias, self.rounding, self.clip)
    }
}

/// Convolution across channels + batch norm + ReLU + pooling: `[F1, C, T]` → `[F2, T/8]`.
#[derive(Debug, Clone)]
pub struct Layer2 {
    c: usize,
    t: usize,
    f1: usize,
    f2: usize,
    weights: Tensor<i32>,
    weight_scale: f64,
    input_scale: f64,
    output_scale: f64,
    stage: BnPool,
    rounding: Rounding,
    clip: Clip,
}

impl Layer2 {
    pub fn new(net: &NamedTensors, p: &NetParams, opts: &ModelOptions) -> Result<Self> {
        let f2 = p.f2();
        let (w, weight_scale) = inq_conv2d(net, "conv2", Levels::DEFAULT, true)?;
        let weights = weights_as(w, "conv2", &[f2, 1, p.c, 1], vec![f2, p.c])?;
        let input_scale = ste_quant(net, "quant2")?;
        let output_scale = ste_quant(net, "quant3")?;
        let bn = batch_norm_of(net, "batch_norm2", f2)?;
        let stage = BnPool::new((input_scale, weight_scale, output_scale), &bn, opts.reorder_bn)?;
        debug!("layer 2: {:?}", stage);
        Ok(Self {
            c: p.c,
            t: p.t,
            f1: p.f1,
            f2,
            weights,
            weight_scale,
            input_scale,
            output_scale,
            stage,
            rounding: opts.rounding(),
            clip: opts.clip,
        })
    }

    /// `[F2, C]`.
    pub fn weights(&self) -> &Tensor<i32> { &self.weights }
    pub fn weight_scale(&self) -> f64 { self.weight_scale }
    pub fn stage(&self) -> &BnPool { &self.stage }
    pub fn factor_bias(&self) -> &FactorBias { self.stage.factor_bias() }

    /// Weights padded to `[F2, C_ALIGN]` for the target.
    pub fn aligned_weights(&self) -> Tensor<i32> {
        align(&self.weights, ALIGN_BOUNDARY, 0)
    }
}

impl Layer for Layer2 {
    fn name(&self) -> &'static str { "Layer 2: Convolution in Space + Batch Norm + ReLU + Pooling" }
    fn input_shape(&self) -> Vec<usize> { vec![self.f1, self.c, self.t] }
    fn output_shape(&self) -> Vec<usize> { vec![self.f2, self.t / POOL] }
    fn input_scale(&self) -> f64 { self.input_scale }
    fn output_scale(&self) -> f64 { self.output_scale }
    fn num_params(&self) -> usize { self.weights.len() + self.stage.factor_bias.table_len() }
    fn mem_size(&self) -> usize { self.weights.len() + 4 * self.stage.factor_bias.table_len() }

    fn apply(&self, x: &Tensor<i32>) -> Result<Tensor<i32>> {
        check_input(self, x, self.clip)?;
        let y = depthwise_conv_space(x, &self.weights)?;
        self.stage.run(&y, self.rounding, self.clip)
    }
}

/// Depthwise convolution in time: `[F2, T/8]` → `[F2, T/8]`.
#[derive(Debug, Clone)]
pub struct Layer3 {
    f2: usize,
    t8: usize,
    weights: Tensor<i32>,
    weight_scale: f64,
    input_scale: f64,
    output_scale: f64,
    factor: FactorBias,
    rounding: Rounding,
    clip: Clip,
}

impl Layer3 {
    pub fn new(net: &NamedTensors, p: &NetParams, opts: &ModelOptions) -> Result<Self> {
        let f2 = p.f2();
        let (w, weight_scale) = inq_conv2d(net, "sep_conv1", Levels::DEFAULT, false)?;
        let weights = weights_as(w, "sep_conv1", &[f2, 1, 1, L3_KERNEL_LEN], vec![f2, L3_KERNEL_LEN])?;
        let input_scale = ste_quant(net, "quant3")?;
        let output_scale = ste_quant(net, "quant4")?;
        let factor = FactorBias::scalar(div_factor(input_scale, weight_scale, output_scale, Levels::DEFAULT, 1)?)?;
        debug!("layer 3: {:?}", factor);
        Ok(Self {
            f2,
            t8: p.t8(),
            weights,
            weight_scale,
            input_scale,
            output_scale,
            factor,
            rounding: opts.rounding(),
            clip: opts.clip,
        })
    }

    /// `[F2, 16]`, already reversed for convolution.
    pub fn weights(&self) -> &Tensor<i32> { &self.weights }
    pub fn weight_scale(&self) -> f64 { self.weight_scale }
    pub fn factor_bias(&self) -> &FactorBias { &self.factor }
}

impl Layer for Layer3 {
    fn name(&self) -> &'static str { "Layer 3: Convolution in Time" }
    fn input_shape(&self) -> Vec<usize> { vec![self.f2, self.t8] }
    fn output_shape(&self) -> Vec<usize> { vec![self.f2, self.t8] }
    fn input_scale(&self) -> f64 { self.input_scale }
    fn output_scale(&self) -> f64 { self.output_scale }
    fn num_params(&self) -> usize { self.weights.len() + 1 }
    fn mem_size(&self) -> usize { self.weights.len() + 4 }

    fn apply(&self, x: &Tensor<i32>) -> Result<Tensor<i32>> {
        check_input(self, x, self.clip)?;
        let y = depthwise_conv_time(x, &self.weights)?;
        apply_factor_offset(&y, &self.factor, self.rounding, self.clip)
    }
}

/// Pointwise convolution + batch norm + ReLU + pooling: `[F2, T/8]` → `[F2, T/64]`.
#[derive(Debug, Clone)]
pub struct Layer4 {
    f2: usize,
    t8: usize,
    weights: Tensor<i32>,
    weight_scale: f64,
    input_scale: f64,
    output_scale: f64,
    stage: BnPool,
    rounding: Rounding,
    clip: Clip,
}

impl Layer4 {
    pub fn new(net: &NamedTensors, p: &NetParams, opts: &ModelOptions) -> Result<Self> {
        let f2 = p.f2();
        let (w, weight_scale) = inq_conv2d(net, "sep_conv2", Levels::DEFAULT, false)?;
        let weights = weights_as(w, "sep_conv2", &[f2, f2, 1, 1], vec![f2, f2])?;
        let input_scale = ste_quant(net, "quant4")?;
        let output_scale = ste_quant(net, "quant5")?;
        let bn = batch_norm_of(net, "batch_norm3", f2)?;
        let stage = BnPool::new((input_scale, weight_scale, output_scale), &bn, opts.reorder_bn)?;
        debug!("layer 4: {:?}", stage);
        Ok(Self {
            f2,
            t8: p.t8(),
            weights,
            weight_scale,
            input_scale,
            output_scale,
            stage,
            rounding: opts.rounding(),
            clip: opts.clip,
        })
    }

    /// `[F2, F2]`, output feature major.
    pub fn weights(&self) -> &Tensor<i32> { &self.weights }
    pub fn weight_scale(&self) -> f64 { self.weight_scale }
    pub fn stage(&self) -> &BnPool { &self.stage }
    pub fn factor_bias(&self) -> &FactorBias { self.stage.factor_bias() }
}

impl Layer for Layer4 {
    fn name(&self) -> &'static str { "Layer 4: Point Convolution + Batch Norm + ReLU + Pooling" }
    fn input_shape(&self) -> Vec<usize> { vec![self.f2, self.t8] }
    fn output_shape(&self) -> Vec<usize> { vec![self.f2, self.t8 / POOL] }
    fn input_scale(&self) -> f64 { self.input_scale }
    fn output_scale(&self) -> f64 { self.output_scale }
    fn num_params(&self) -> usize { self.weights.len() + self.stage.factor_bias.table_len() }
    fn mem_size(&self) -> usize { self.weights.len() + 4 * self.stage.factor_bias.table_len() }

    fn apply(&self, x: &Tensor<i32>) -> Result<Tensor<i32>> {
        check_input(self, x, self.clip)?;
        let y = pointwise_conv(x, &self.weights)?;
        self.stage.run(&y, self.rounding, self.clip)
    }
}

/// Flatten + fully connected layer: `[F2, T/64]` → `[N]`.
#[derive(Debug, Clone)]
pub struct Layer5 {
    f2: usize,
    t64: usize,
    n: usize,
    weights: Tensor<i32>,
    bias: Tensor<i32>,
    weight_scale: f64,
    input_scale: f64,
    output_scale: f64,
    factor: FactorBias,
    rounding: Rounding,
    clip: Clip,
}

impl Layer5 {
    pub fn new(net: &NamedTensors, p: &NetParams, opts: &ModelOptions) -> Result<Self> {
        let (f2, t64) = (p.f2(), p.t64());
        let (weights, bias, weight_scale) = inq_linear(net, "fc", Levels::DEFAULT)?;
        ensure_shape("fc weights", &[p.n, f2 * t64], weights.shape())?;
        let bias = bias.flatten();
        ensure_shape("fc bias", &[p.n], bias.shape())?;
        let input_scale = ste_quant(net, "quant5")?;
        let output_scale = ste_quant(net, "quant6")?;
        let factor = FactorBias::scalar(div_factor(input_scale, weight_scale, output_scale, Levels::DEFAULT, 1)?)?;
        debug!("layer 5: {:?}", factor);
        Ok(Self {
            f2,
            t64,
            n: p.n,
            weights,
            bias,
            weight_scale,
            input_scale,
            output_scale,
            factor,
            rounding: opts.rounding(),
            clip: opts.clip,
        })
    }

    /// `[N, F2 * T/64]`.
    pub fn weights(&self) -> &Tensor<i32> { &self.weights }
    pub fn bias(&self) -> &Tensor<i32> { &self.bias }
    pub fn weight_scale(&self) -> f64 { self.weight_scale }
    pub fn factor_bias(&self) -> &FactorBias { &self.factor }

    /// Weights with every F2 block padded from `T64` to `T64_ALIGN`: `[N, F2 * T64_ALIGN]`.
    pub fn aligned_weights(&self) -> Result<Tensor<i32>> {
        let blocks = self.weights.clone().reshape(vec![self.n, self.f2, self.t64])?;
        let aligned = align(&blocks, ALIGN_BOUNDARY, 0);
        let width = self.f2 * aligned.shape()[2];
        aligned.reshape(vec![self.n, width])
    }
}

impl Layer for Layer5 {
    fn name(&self) -> &'static str { "Layer 5: Linear Layer" }
    fn input_shape(&self) -> Vec<usize> { vec![self.f2, self.t64] }
    fn output_shape(&self) -> Vec<usize> { vec![self.n] }
    fn input_scale(&self) -> f64 { self.input_scale }
    fn output_scale(&self) -> f64 { self.output_scale }
    fn num_params(&self) -> usize { self.weights.len() + self.bias.len() }
    fn mem_size(&self) -> usize { self.num_params() }

    fn apply(&self, x: &Tensor<i32>) -> Result<Tensor<i32>> {
        check_input(self, x, self.clip)?;
        let y = linear(&x.clone().flatten(), &self.weights, &self.bias)?;
        apply_factor_offset(&y, &self.factor, self.rounding, self.clip)
    }
}

/// Layers 1 and 2 without the intermediate rescale: `[C, T]` → `[F2, T/8]`.
///
/// The layer 1 accumulator plus its bias stays in 64 bits; layer 2's factor and
/// bias are multiplied by layer 1's factor of the feature map they read.
#[derive(Debug, Clone)]
pub struct FusedLayer12 {
    c: usize,
    t: usize,
    f2: usize,
    w1: Tensor<i64>,
    bias1: Vec<i64>,
    w2: Tensor<i64>,
    input_scale: f64,
    output_scale: f64,
    factor_bias: FactorBias,
    threshold: Vec<i64>,
    rounding: Rounding,
    clip: Clip,
}

impl FusedLayer12 {
    pub fn fuse(l1: &Layer1, l2: &Layer2) -> Result<Self> {
        if l2.stage.is_reordered() {
            return Err(GoldenError::InvalidConfig(
                "layer 1+2 fusion is only defined for the pool-first ordering".into(),
            ));
        }
        ensure_shape("fused layer 1+2", &l1.output_shape(), &l2.input_shape())?;
        let d = l2.f2 / l1.f1;
        let factor_bias = l2.factor_bias().compose(&l1.factor_bias.factors(), d, l2.f2)?;
        let threshold = pool_threshold(&factor_bias.biases()).into_iter().map(i64::from).collect();
        debug!("fused layer 1+2: {:?}", factor_bias);
        Ok(Self {
            c: l1.c,
            t: l1.t,
            f2: l2.f2,
            w1: l1.weights.widen(),
            bias1: l1.factor_bias.biases().into_iter().map(i64::from).collect(),
            w2: l2.weights.widen(),
            input_scale: l1.input_scale,
            output_scale: l2.output_scale,
            factor_bias,
            threshold,
            rounding: l2.rounding,
            clip: l2.clip,
        })
    }

    pub fn factor_bias(&self) -> &FactorBias { &self.factor_bias }
    pub fn threshold(&self) -> &[i64] { &self.threshold }
}

impl Layer for FusedLayer12 {
    fn name(&self) -> &'static str { "Layer 1+2: Fused Convolution in Time and Space + Batch Norm + ReLU + Pooling" }
    fn input_shape(&self) -> Vec<usize> { vec![self.c, self.t] }
    fn output_shape(&self) -> Vec<usize> { vec![self.f2, self.t / POOL] }
    fn input_scale(&self) -> f64 { self.input_scale }
    fn output_scale(&self) -> f64 { self.output_scale }

    fn num_params(&self) -> usize {
        self.w1.len() + self.bias1.len() + self.w2.len() + self.factor_bias.table_len()
    }

    fn mem_size(&self) -> usize {
        self.w1.len() + 4 * self.bias1.len() + self.w2.len() + 4 * self.factor_bias.table_len()
    }

    fn apply(&self, x: &Tensor<i32>) -> Result<Tensor<i32>> {
        check_input(self, x, Clip::Balanced)?;
        let mut acc = conv_time(&x.widen(), &self.w1)?;
        let per_map = acc.inner_len();
        for (i, v) in acc.data_mut().iter_mut().enumerate() {
            *v += self.bias1[i / per_map];
        }
        let y = depthwise_conv_space(&acc, &self.w2)?;
        let y = relu(&y, &self.threshold)?;
        let y = pool(&y, (1, POOL), Reduction::Sum)?;
        apply_factor_offset(&y, &self.factor_bias, self.rounding, self.clip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_threshold_floors() {
        assert_eq!(pool_threshold(&[16, 17, -1, -16, 0]), vec![-2, -2, 1, 2, 0]);
    }
}
