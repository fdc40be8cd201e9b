//! Error taxonomy for graph construction and definition loading.
//!
//! Construction-time errors (invalid layer wiring, irreconcilable memory
//! formats, bad hyperparameters) are fatal and surfaced immediately; they are
//! never retried. Hot-path shape violations are programming errors and are
//! covered by assertions instead.

use thiserror::Error;

/// Errors raised while building a layer graph or loading a graph definition.
#[derive(Debug, Error)]
pub enum GraphError {
    /// Layer names are unique case-insensitively.
    #[error("duplicate layer name `{0}`")]
    DuplicateName(String),

    /// A layer referenced an input that does not exist or is declared after it.
    #[error("layer `{layer}` references unknown or forward input `{input}`")]
    UnknownInput { layer: String, input: String },

    /// A layer was wired with the wrong number of producers.
    #[error("layer `{layer}` expects {expected} input(s), got {got}")]
    InputArity {
        layer: String,
        expected: usize,
        got: usize,
    },

    /// Producer/consumer shapes cannot be made compatible.
    #[error("shape mismatch at `{layer}`: {details}")]
    ShapeMismatch { layer: String, details: String },

    /// No reorder can reconcile the memory descriptors across a boundary.
    #[error("incompatible memory formats between `{producer}` and `{consumer}`")]
    FormatMismatch { producer: String, consumer: String },

    /// A hyperparameter is outside its valid range.
    #[error("invalid parameter for `{layer}`: {details}")]
    InvalidParameter { layer: String, details: String },

    /// The graph as a whole is malformed (empty, missing input layer, ...).
    #[error("invalid graph definition: {0}")]
    Definition(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("malformed graph definition file: {0}")]
    Json(#[from] serde_json::Error),
}
