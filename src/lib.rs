pub mod align;
pub mod error;
pub mod golden;
pub mod stimuli;
pub mod tensor;

pub use error::{GoldenError, Result};
pub use golden::compare::{compare, Comparison, FUSED_TOLERANCE, LAYER_TOLERANCE};
pub use golden::config::{Clip, ModelOptions, NetParams, Rounding};
pub use golden::layers::Layer;
pub use golden::loader::NamedTensors;
pub use golden::GoldenModel;
pub use tensor::Tensor;
