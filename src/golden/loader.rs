use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{GoldenError, Result};
use crate::golden::quant::{quantize_to_int, Levels};
use crate::tensor::Tensor;

/// Exported network parameters keyed by their trained names, e.g.
/// `conv1.weightFrozen`, `batch_norm1.running_mean` or `quant1.absMaxValue`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NamedTensors(BTreeMap<String, Tensor<f64>>);

impl NamedTensors {
    pub fn new() -> Self { Self::default() }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn insert(&mut self, name: impl Into<String>, tensor: Tensor<f64>) {
        self.0.insert(name.into(), tensor);
    }

    pub fn insert_scalar(&mut self, name: impl Into<String>, value: f64) {
        self.insert(name, Tensor::from_vec(vec![value]));
    }

    pub fn get(&self, name: &str) -> Result<&Tensor<f64>> {
        self.0.get(name).ok_or_else(|| GoldenError::MissingTensor(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool { self.0.contains_key(name) }
    pub fn names(&self) -> impl Iterator<Item = &str> { self.0.keys().map(String::as_str) }
    pub fn len(&self) -> usize { self.0.len() }
    pub fn is_empty(&self) -> bool { self.0.is_empty() }

    /// First element of a named tensor (scale factors are stored as `[1]` arrays).
    pub fn scalar(&self, name: &str) -> Result<f64> {
        self.get(name)?
            .data()
            .first()
            .copied()
            .ok_or_else(|| GoldenError::MissingTensor(format!("{} (empty)", name)))
    }
}

/// Reverse the last two axes; they are contiguous, so each trailing block is reversed.
pub fn flip_last_two(x: &Tensor<f64>) -> Tensor<f64> {
    let block: usize = x.shape().iter().rev().take(2).product();
    let mut y = x.clone();
    if block > 0 {
        for chunk in y.data_mut().chunks_mut(block) { chunk.reverse(); }
    }
    y
}

/// Float weights and weight scale of an INQ convolution.
///
/// The trained framework computes cross-correlation, so the kernel is reversed
/// for the convolution primitives unless `store_reversed` keeps it as stored.
pub fn conv_weights(net: &NamedTensors, layer: &str, store_reversed: bool) -> Result<(Tensor<f64>, f64)> {
    let weights = net.get(&format!("{}.weightFrozen", layer))?;
    let scale = net.scalar(&format!("{}.sParam", layer))?;
    let weights = if store_reversed { weights.clone() } else { flip_last_two(weights) };
    Ok((weights, scale))
}

/// Quantized weights and weight scale of an INQ convolution.
pub fn inq_conv2d(net: &NamedTensors, layer: &str, levels: Levels, store_reversed: bool) -> Result<(Tensor<i32>, f64)> {
    let (weights, scale) = conv_weights(net, layer, store_reversed)?;
    Ok((quantize_to_int(&weights, scale, levels), scale))
}

/// Quantized weights, bias and weight scale of an INQ linear layer.
///
/// The bias is quantized with the weight scale, as exported.
pub fn inq_linear(net: &NamedTensors, layer: &str, levels: Levels) -> Result<(Tensor<i32>, Tensor<i32>, f64)> {
    let weights = net.get(&format!("{}.weightFrozen", layer))?;
    let bias = net.get(&format!("{}.bias", layer))?;
    let scale = net.scalar(&format!("{}.sParam", layer))?;
    Ok((quantize_to_int(weights, scale, levels), quantize_to_int(bias, scale, levels), scale))
}

/// Fold running statistics into `(scale, offset)`:
/// `scale = gamma / sqrt(var)`, `offset = beta - mean / sqrt(var) * gamma`.
pub fn batch_norm_params(net: &NamedTensors, layer: &str) -> Result<(Vec<f64>, Vec<f64>)> {
    let mean = net.get(&format!("{}.running_mean", layer))?.data();
    let var = net.get(&format!("{}.running_var", layer))?.data();
    let gamma = net.get(&format!("{}.weight", layer))?.data();
    let beta = net.get(&format!("{}.bias", layer))?.data();
    let n = mean.len();
    if var.len() != n || gamma.len() != n || beta.len() != n {
        return Err(GoldenError::ShapeMismatch {
            context: format!("{} statistics (mean, var, weight, bias)", layer),
            expected: vec![n; 4],
            actual: vec![mean.len(), var.len(), gamma.len(), beta.len()],
        });
    }
    let mut scale = Vec::with_capacity(n);
    let mut offset = Vec::with_capacity(n);
    for i in 0..n {
        let sd = var[i].sqrt();
        scale.push(gamma[i] / sd);
        offset.push(beta[i] - mean[i] / sd * gamma[i]);
    }
    Ok((scale, offset))
}

/// Scale factor of a straight-through activation quantizer.
pub fn ste_quant(net: &NamedTensors, layer: &str) -> Result<f64> {
    let direct = format!("{}.absMaxValue", layer);
    if net.contains(&direct) {
        return net.scalar(&direct);
    }
    net.scalar(&format!("{}.quant.absMaxValue", layer))
}
