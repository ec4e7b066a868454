use thiserror::Error;

/// Everything that can go wrong while building or running the golden model.
///
/// All variants are configuration, data or programming errors; once the inputs are
/// validated the arithmetic itself never fails (saturation is silent).
#[derive(Debug, Error, Clone, PartialEq)]
pub enum GoldenError {
    #[error("shape mismatch in {context}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        context: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("tensor of shape {shape:?} needs {expected} elements, got {actual}")]
    DataLength {
        shape: Vec<usize>,
        expected: usize,
        actual: usize,
    },

    #[error("{context}: value {value} outside [{min}, {max}]")]
    OutOfRange {
        context: String,
        value: i64,
        min: i64,
        max: i64,
    },

    #[error("quantization level count must be odd and at least 3, got {0}")]
    InvalidLevels(u32),

    #[error("{what} uses {levels} quantization levels, only 255 is supported")]
    UnsupportedLevels { what: &'static str, levels: u32 },

    #[error("F2 ({f2}) must equal F1 ({f1}) * D ({d})")]
    FeatureMismatch { f1: usize, f2: usize, d: usize },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("missing tensor `{0}`")]
    MissingTensor(String),

    #[error("scale factor `{name}` must be positive and finite, got {value}")]
    InvalidScale { name: &'static str, value: f64 },

    #[error("division factor rounds to zero (exact value {0})")]
    ZeroFactor(f64),

    #[error("division factor or bias {0} does not fit into 32 bits")]
    FactorOverflow(f64),

    #[error("parse error: {0}")]
    Parse(String),
}

impl From<serde_json::Error> for GoldenError {
    fn from(e: serde_json::Error) -> Self {
        GoldenError::Parse(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, GoldenError>;

/// Shorthand used by every shape check in the crate.
pub(crate) fn ensure_shape(context: &str, expected: &[usize], actual: &[usize]) -> Result<()> {
    if expected != actual {
        return Err(GoldenError::ShapeMismatch {
            context: context.to_string(),
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        });
    }
    Ok(())
}

/// Every element of `data` must lie in `[min, max]`.
pub(crate) fn ensure_range(context: &str, data: &[i32], (min, max): (i64, i64)) -> Result<()> {
    match data.iter().map(|&v| v as i64).find(|v| !(min..=max).contains(v)) {
        Some(value) => Err(GoldenError::OutOfRange { context: context.to_string(), value, min, max }),
        None => Ok(()),
    }
}
