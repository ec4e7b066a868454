//! Golden model of the quantized EEGNet: integer inference exactly as the target computes it.

pub mod compare;
pub mod config;
pub mod functional;
pub mod layers;
pub mod loader;
pub mod quant;
pub mod scale;

use std::fmt;

use log::{info, trace};

use crate::align::NetDims;
use crate::error::{ensure_shape, GoldenError, Result};
use crate::golden::config::{ModelOptions, NetParams};
use crate::golden::layers::{FusedLayer12, Layer, Layer1, Layer2, Layer3, Layer4, Layer5};
use crate::golden::loader::NamedTensors;
use crate::golden::quant::{quantize_to_int, Levels};
use crate::tensor::Tensor;

/// One of the concrete layer sequences the factory builds.
#[derive(Debug, Clone)]
pub enum Pipeline {
    Sequential { l1: Layer1, l2: Layer2, l3: Layer3, l4: Layer4, l5: Layer5 },
    Fused { l12: FusedLayer12, l3: Layer3, l4: Layer4, l5: Layer5 },
}

impl Pipeline {
    pub fn layers(&self) -> Vec<&dyn Layer> {
        match self {
            Pipeline::Sequential { l1, l2, l3, l4, l5 } => {
                vec![l1 as &dyn Layer, l2 as &dyn Layer, l3 as &dyn Layer, l4 as &dyn Layer, l5 as &dyn Layer]
            }
            Pipeline::Fused { l12, l3, l4, l5 } => vec![l12 as &dyn Layer, l3 as &dyn Layer, l4 as &dyn Layer, l5 as &dyn Layer],
        }
    }

    pub fn is_fused(&self) -> bool { matches!(self, Pipeline::Fused { .. }) }
}

#[derive(Debug, Clone)]
pub struct GoldenModel {
    params: NetParams,
    options: ModelOptions,
    dims: NetDims,
    pipeline: Pipeline,
}

impl GoldenModel {
    /// Validate the configuration, convert every layer and check that each layer's
    /// output shape and scale are the next layer's input contract.
    pub fn new(net: &NamedTensors, params: NetParams, options: ModelOptions) -> Result<Self> {
        params.validate()?;
        options.validate()?;
        let l1 = Layer1::new(net, &params, &options)?;
        let l2 = Layer2::new(net, &params, &options)?;
        let l3 = Layer3::new(net, &params, &options)?;
        let l4 = Layer4::new(net, &params, &options)?;
        let l5 = Layer5::new(net, &params, &options)?;
        let pipeline = if options.fuse_layer_1_2 {
            Pipeline::Fused { l12: FusedLayer12::fuse(&l1, &l2)?, l3, l4, l5 }
        } else {
            Pipeline::Sequential { l1, l2, l3, l4, l5 }
        };
        check_chain(&pipeline.layers())?;
        let model = Self { params, options, dims: NetDims::new(&params), pipeline };
        info!(
            "golden model: C={} T={} F1={} D={} N={} fused={} reorder_bn={} memory={} B",
            params.c,
            params.t,
            params.f1,
            params.d,
            params.n,
            options.fuse_layer_1_2,
            options.reorder_bn,
            model.mem_size()
        );
        Ok(model)
    }

    pub fn params(&self) -> &NetParams { &self.params }
    pub fn options(&self) -> &ModelOptions { &self.options }
    pub fn dims(&self) -> &NetDims { &self.dims }
    pub fn pipeline(&self) -> &Pipeline { &self.pipeline }
    pub fn layers(&self) -> Vec<&dyn Layer> { self.pipeline.layers() }

    pub fn input_shape(&self) -> Vec<usize> { vec![self.params.c, self.params.t] }
    pub fn output_shape(&self) -> Vec<usize> { vec![self.params.n] }

    pub fn input_scale(&self) -> f64 {
        self.layers().first().map_or(1.0, |l| l.input_scale())
    }

    pub fn output_scale(&self) -> f64 {
        self.layers().last().map_or(1.0, |l| l.output_scale())
    }

    /// Quantize a real-valued `[C, T]` input with the scale of the first activation.
    pub fn quantize_input(&self, x: &Tensor<f64>) -> Result<Tensor<i32>> {
        ensure_shape("model input", &self.input_shape(), x.shape())?;
        Ok(quantize_to_int(x, self.input_scale(), Levels::DEFAULT))
    }

    pub fn infer(&self, x: &Tensor<i32>) -> Result<Tensor<i32>> {
        let mut y = x.clone();
        for layer in self.layers() {
            y = layer.apply(&y)?;
            trace!("{} -> {:?}", layer.name(), y.shape());
        }
        Ok(y)
    }

    /// Output of every layer, in pipeline order; the last entry equals [`Self::infer`].
    pub fn trace(&self, x: &Tensor<i32>) -> Result<Vec<Tensor<i32>>> {
        let layers = self.layers();
        let mut outputs: Vec<Tensor<i32>> = Vec::with_capacity(layers.len());
        for layer in layers {
            let y = layer.apply(outputs.last().unwrap_or(x))?;
            trace!("{} -> {:?}", layer.name(), y.shape());
            outputs.push(y);
        }
        Ok(outputs)
    }

    pub fn num_params(&self) -> usize {
        self.layers().iter().map(|l| l.num_params()).sum()
    }

    pub fn mem_size(&self) -> usize {
        self.layers().iter().map(|l| l.mem_size()).sum()
    }
}

impl fmt::Display for GoldenModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for layer in self.layers() {
            write!(f, "{}\n\n", layer)?;
        }
        write!(f, "Total Memory: {} B", self.mem_size())
    }
}

fn check_chain(layers: &[&dyn Layer]) -> Result<()> {
    for pair in layers.windows(2) {
        let (a, b) = (pair[0], pair[1]);
        ensure_shape(&format!("{} -> {}", a.name(), b.name()), &b.input_shape(), &a.output_shape())?;
        if a.output_scale() != b.input_scale() {
            return Err(GoldenError::InvalidConfig(format!(
                "scale of `{}` output ({}) differs from `{}` input ({})",
                a.name(),
                a.output_scale(),
                b.name(),
                b.input_scale()
            )));
        }
    }
    Ok(())
}
