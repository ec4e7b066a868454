use serde::{Deserialize, Serialize};

use crate::error::{GoldenError, Result};

/// Network hyperparameters as exported by QuantLab (`indiv.net.params`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetParams {
    #[serde(rename = "F1")]
    pub f1: usize,
    #[serde(rename = "F2", default)]
    pub f2: Option<usize>,
    #[serde(rename = "D")]
    pub d: usize,
    #[serde(rename = "C")]
    pub c: usize,
    #[serde(rename = "T")]
    pub t: usize,
    #[serde(rename = "N")]
    pub n: usize,
    #[serde(rename = "weightInqNumLevels", default = "default_levels")]
    pub weight_levels: u32,
    #[serde(rename = "actSTENumLevels", default = "default_levels")]
    pub act_levels: u32,
}

fn default_levels() -> u32 { 255 }

impl NetParams {
    pub fn new(c: usize, t: usize, f1: usize, d: usize, n: usize) -> Self {
        Self { f1, f2: Some(f1 * d), d, c, t, n, weight_levels: 255, act_levels: 255 }
    }

    /// Parse the full QuantLab `config.json` document and pick out the network params.
    pub fn from_quantlab_json(text: &str) -> Result<Self> {
        let doc: serde_json::Value = serde_json::from_str(text)?;
        let params = doc
            .pointer("/indiv/net/params")
            .ok_or_else(|| GoldenError::Parse("config has no `indiv.net.params` record".into()))?;
        Ok(serde_json::from_value(params.clone())?)
    }

    /// F2, defaulting to `F1 * D` when the export left it empty.
    pub fn f2(&self) -> usize {
        self.f2.unwrap_or(self.f1 * self.d)
    }

    pub fn t8(&self) -> usize { self.t / 8 }
    pub fn t64(&self) -> usize { self.t8() / 8 }

    pub fn validate(&self) -> Result<()> {
        if self.weight_levels != 255 {
            return Err(GoldenError::UnsupportedLevels { what: "weights", levels: self.weight_levels });
        }
        if self.act_levels != 255 {
            return Err(GoldenError::UnsupportedLevels { what: "activations", levels: self.act_levels });
        }
        if self.f1 == 0 || self.d == 0 || self.c == 0 || self.n == 0 {
            return Err(GoldenError::InvalidConfig(format!("all dimensions must be positive: {:?}", self)));
        }
        if self.f2() != self.f1 * self.d {
            return Err(GoldenError::FeatureMismatch { f1: self.f1, f2: self.f2(), d: self.d });
        }
        if self.t64() == 0 {
            return Err(GoldenError::InvalidConfig(format!("T = {} is too short for two pooling stages of 8", self.t)));
        }
        Ok(())
    }
}

/// Saturation applied after every rescale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Clip {
    /// [-127, 127], the symmetric quantization grid.
    #[default]
    Balanced,
    /// [-128, 127], what the target's clip intrinsic produces.
    Unbalanced,
    /// Only saturate to the 32-bit range.
    Off,
}

impl Clip {
    pub fn bounds(self) -> (i64, i64) {
        match self {
            Clip::Balanced => (-127, 127),
            Clip::Unbalanced => (-128, 127),
            Clip::Off => (i32::MIN as i64, i32::MAX as i64),
        }
    }
}

/// How the integer division in a rescale treats the remainder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Rounding {
    /// Plain floor division.
    Floor,
    /// Add `factor // 2` before the floor division.
    Nearest,
}

impl From<bool> for Rounding {
    fn from(round: bool) -> Self {
        if round { Rounding::Nearest } else { Rounding::Floor }
    }
}

/// Selects one of the concrete pipelines the factory can build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelOptions {
    pub round: bool,
    pub clip: Clip,
    /// Rescale before ReLU and pooling in layers 2 and 4 instead of after.
    pub reorder_bn: bool,
    /// Replace layers 1 and 2 by one layer without the intermediate rescale.
    pub fuse_layer_1_2: bool,
}

impl Default for ModelOptions {
    fn default() -> Self {
        Self { round: true, clip: Clip::Balanced, reorder_bn: false, fuse_layer_1_2: false }
    }
}

impl ModelOptions {
    pub fn rounding(&self) -> Rounding { self.round.into() }

    pub fn validate(&self) -> Result<()> {
        if self.fuse_layer_1_2 && self.reorder_bn {
            return Err(GoldenError::InvalidConfig(
                "layer 1+2 fusion requires the pool-first batch-norm ordering (reorder_bn = false)".into(),
            ));
        }
        Ok(())
    }
}
