//! Deterministic test stimuli: random integer inputs and complete synthetic networks.
//!
//! A synthetic network has random weights and batch-norm statistics. Its activation
//! scale factors are calibrated the way straight-through quantizers are: the absolute
//! maximum of every activation point during a floating-point forward pass.

use log::debug;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rand_distr::Normal;

use crate::align::{L1_KERNEL_LEN, L3_KERNEL_LEN};
use crate::error::{GoldenError, Result};
use crate::golden::config::NetParams;
use crate::golden::functional::{batch_norm, conv_time, depthwise_conv_space, depthwise_conv_time, linear, pointwise_conv, pool, relu, Reduction};
use crate::golden::layers::POOL;
use crate::golden::loader::{batch_norm_params, conv_weights, NamedTensors};
use crate::golden::quant::{quantize, Levels};
use crate::tensor::Tensor;

/// Uniform integers in `[low, high)`; the test harness uses `[-60, 60)`.
pub fn random_input(shape: Vec<usize>, low: i32, high: i32, seed: u64) -> Result<Tensor<i32>> {
    if low >= high {
        return Err(GoldenError::InvalidConfig(format!("empty input range [{}, {})", low, high)));
    }
    let mut rng = SmallRng::seed_from_u64(seed);
    Ok(Tensor::from_fn(shape, |_| rng.gen_range(low..high)))
}

fn normal(rng: &mut SmallRng, shape: Vec<usize>, std: f64) -> Result<Tensor<f64>> {
    let dist = Normal::new(0.0, std).map_err(|e| GoldenError::InvalidConfig(e.to_string()))?;
    Ok(Tensor::from_fn(shape, |_| rng.sample(dist)))
}

fn abs_max(name: &str, x: &Tensor<f64>) -> Result<f64> {
    let m = x.data().iter().fold(0.0f64, |m, v| m.max(v.abs()));
    if m > 0.0 && m.is_finite() {
        Ok(m)
    } else {
        Err(GoldenError::InvalidConfig(format!("activation `{}` has no usable range ({})", name, m)))
    }
}

fn add_weights(net: &mut NamedTensors, rng: &mut SmallRng, layer: &str, shape: Vec<usize>, fan_in: usize) -> Result<()> {
    let w = normal(rng, shape, 1.0 / (fan_in as f64).sqrt())?;
    let scale = abs_max(layer, &w)?;
    net.insert(format!("{}.weightFrozen", layer), w);
    net.insert_scalar(format!("{}.sParam", layer), scale);
    Ok(())
}

fn add_batch_norm(net: &mut NamedTensors, rng: &mut SmallRng, layer: &str, channels: usize) -> Result<()> {
    // gamma > 0 so ReLU commutes with the batch-norm rescale
    let var: Vec<f64> = (0..channels).map(|_| rng.gen_range(0.5..1.5)).collect();
    let gamma: Vec<f64> = (0..channels).map(|_| rng.gen_range(0.5..1.5)).collect();
    net.insert(format!("{}.running_mean", layer), normal(rng, vec![channels], 0.1)?);
    net.insert(format!("{}.running_var", layer), Tensor::from_vec(var));
    net.insert(format!("{}.weight", layer), Tensor::from_vec(gamma));
    net.insert(format!("{}.bias", layer), normal(rng, vec![channels], 0.1)?);
    Ok(())
}

/// A complete named-tensor map for `params` plus the `[C, T]` input it was calibrated on.
pub fn synthetic_network(params: &NetParams, seed: u64) -> Result<(NamedTensors, Tensor<f64>)> {
    params.validate()?;
    let (c, t, f1, f2, n) = (params.c, params.t, params.f1, params.f2(), params.n);
    let flat = f2 * params.t64();
    let mut rng = SmallRng::seed_from_u64(seed);
    let mut net = NamedTensors::new();

    add_weights(&mut net, &mut rng, "conv1", vec![f1, 1, 1, L1_KERNEL_LEN], L1_KERNEL_LEN)?;
    add_batch_norm(&mut net, &mut rng, "batch_norm1", f1)?;
    add_weights(&mut net, &mut rng, "conv2", vec![f2, 1, c, 1], c)?;
    add_batch_norm(&mut net, &mut rng, "batch_norm2", f2)?;
    add_weights(&mut net, &mut rng, "sep_conv1", vec![f2, 1, 1, L3_KERNEL_LEN], L3_KERNEL_LEN)?;
    add_weights(&mut net, &mut rng, "sep_conv2", vec![f2, f2, 1, 1], f2)?;
    add_batch_norm(&mut net, &mut rng, "batch_norm3", f2)?;
    add_weights(&mut net, &mut rng, "fc", vec![n, flat], flat)?;
    net.insert("fc.bias", normal(&mut rng, vec![n], 0.01)?);

    let x = normal(&mut rng, vec![c, t], 1.0)?;
    calibrate(&mut net, params, &x)?;
    Ok((net, x))
}

/// Quantized float weights as the integer layers see them, reshaped to `shape`.
fn snapped(net: &NamedTensors, layer: &str, store_reversed: bool, shape: Vec<usize>) -> Result<Tensor<f64>> {
    let (w, s) = conv_weights(net, layer, store_reversed)?;
    quantize(&w, s, Levels::DEFAULT).reshape(shape)
}

/// Record the scale of activation point `name` and snap `x` onto its grid.
fn observe(net: &mut NamedTensors, name: &str, x: Tensor<f64>) -> Result<(Tensor<f64>, f64)> {
    let s = abs_max(name, &x)?;
    debug!("{}.absMaxValue = {}", name, s);
    net.insert_scalar(format!("{}.absMaxValue", name), s);
    Ok((quantize(&x, s, Levels::DEFAULT), s))
}

fn bn_relu_pool(net: &NamedTensors, layer: &str, x: &Tensor<f64>) -> Result<Tensor<f64>> {
    let (scale, offset) = batch_norm_params(net, layer)?;
    let y = batch_norm(x, &scale, &offset)?;
    let y = relu(&y, &[0.0])?;
    pool(&y, (1, POOL), Reduction::Mean)
}

fn calibrate(net: &mut NamedTensors, p: &NetParams, x: &Tensor<f64>) -> Result<()> {
    let (c, f1, f2, n) = (p.c, p.f1, p.f2(), p.n);
    let (a, _) = observe(net, "quant1", x.clone())?;

    let w1 = snapped(net, "conv1", false, vec![f1, L1_KERNEL_LEN])?;
    let (scale, offset) = batch_norm_params(net, "batch_norm1")?;
    let y = batch_norm(&conv_time(&a, &w1)?, &scale, &offset)?;
    let (a, _) = observe(net, "quant2", y)?;

    let w2 = snapped(net, "conv2", true, vec![f2, c])?;
    let y = bn_relu_pool(net, "batch_norm2", &depthwise_conv_space(&a, &w2)?)?;
    let (a, _) = observe(net, "quant3", y)?;

    let w3 = snapped(net, "sep_conv1", false, vec![f2, L3_KERNEL_LEN])?;
    let (a, _) = observe(net, "quant4", depthwise_conv_time(&a, &w3)?)?;

    let w4 = snapped(net, "sep_conv2", false, vec![f2, f2])?;
    let y = bn_relu_pool(net, "batch_norm3", &pointwise_conv(&a, &w4)?)?;
    let (a, s5) = observe(net, "quant5", y)?;

    // the integer layer adds the bias quantized with the weight scale to the raw accumulator
    let s_fc = net.scalar("fc.sParam")?;
    let w5 = quantize(net.get("fc.weightFrozen")?, s_fc, Levels::DEFAULT);
    let r = Levels::DEFAULT.half_range();
    let b5 = quantize(net.get("fc.bias")?, s_fc, Levels::DEFAULT).map(|&b| b * s5 / r).reshape(vec![n])?;
    let y = linear(&a.flatten(), &w5, &b5)?;
    observe(net, "quant6", y)?;
    Ok(())
}
