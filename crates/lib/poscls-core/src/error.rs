use thiserror::Error;

use crate::settings::DataShape;
use crate::shape::FeatureShape;

/// Errors raised while reading or validating training settings.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SettingsError {
    #[error("optimizer '{0}' is not supported")]
    UnknownOptimizer(String),

    #[error("weight initialization '{0}' is not supported")]
    UnknownInitialization(String),

    #[error("a classifier needs at least one output class")]
    NoClasses,

    #[error("input of {height}x{width} pixels is empty")]
    EmptyInput { height: usize, width: usize },

    #[error("weight decay must be a finite non-negative number, got {0}")]
    InvalidWeightDecay(f64),

    #[error("image of shape {shape} needs {expected} values, got {actual}")]
    PixelCountMismatch {
        shape: DataShape,
        expected: usize,
        actual: usize,
    },
}

/// Errors raised while assembling a classifier.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ArchitectureError {
    #[error(transparent)]
    Settings(#[from] SettingsError),

    #[error("feature map collapsed to {shape} at layer '{layer}', the input is too small")]
    FeatureMapCollapsed { layer: String, shape: FeatureShape },
}
