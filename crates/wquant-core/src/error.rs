//! Error types for weight export.

use thiserror::Error;

/// Result type alias for export operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Export error types.
///
/// All variants are deterministic, input-driven failures. None of them is
/// retried; the driver decides whether to abort the session or skip a layer.
#[derive(Debug, Error)]
pub enum Error {
    /// Quantized value fell outside the int8 range under strict quantization.
    #[error("quantized value {quantized} out of int8 range at index {index} (weight {value}, scale {scale})")]
    Range {
        index: usize,
        value: f32,
        scale: f32,
        quantized: f32,
    },

    /// Tensor rank or dimensions do not match what the operation expects.
    #[error("shape mismatch in {context}: expected {expected}, got {actual:?}")]
    Shape {
        context: &'static str,
        expected: String,
        actual: Vec<usize>,
    },

    /// Activation tag outside the recognized set.
    #[error("unknown activation {0:?}")]
    InvalidActivation(String),

    /// Array or layer name already registered in this session.
    #[error("duplicate {kind} name {name:?}")]
    DuplicateName { kind: &'static str, name: String },

    /// Array name does not fit the fixed-width blob record.
    #[error("array name {name:?} is {len} bytes, blob records hold at most {max}")]
    NameTooLong { name: String, len: usize, max: usize },

    /// Weight blob is truncated or malformed.
    #[error("invalid weight blob: {message} at offset {offset}")]
    InvalidBlob { message: String, offset: usize },

    /// Configuration could not be parsed or is inconsistent.
    #[error("configuration error: {0}")]
    Config(String),

    /// Error raised while exporting a specific layer.
    #[error("layer {layer:?}: {source}")]
    Layer {
        layer: String,
        #[source]
        source: Box<Error>,
    },

    /// I/O error from an output stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a shape error.
    pub fn shape(context: &'static str, expected: impl Into<String>, actual: &[usize]) -> Self {
        Error::Shape {
            context,
            expected: expected.into(),
            actual: actual.to_vec(),
        }
    }

    /// Create a duplicate array name error.
    pub fn duplicate_array(name: impl Into<String>) -> Self {
        Error::DuplicateName {
            kind: "array",
            name: name.into(),
        }
    }

    /// Create a duplicate layer name error.
    pub fn duplicate_layer(name: impl Into<String>) -> Self {
        Error::DuplicateName {
            kind: "layer",
            name: name.into(),
        }
    }

    /// Create a blob format error.
    pub fn invalid_blob(message: impl Into<String>, offset: usize) -> Self {
        Error::InvalidBlob {
            message: message.into(),
            offset,
        }
    }

    /// Attach the name of the layer being exported.
    ///
    /// Errors that already carry a layer are returned unchanged so nested
    /// layers (a split GRU exporting two linear layers) keep the innermost name.
    pub fn in_layer(self, layer: impl Into<String>) -> Self {
        match self {
            Error::Layer { .. } => self,
            other => Error::Layer {
                layer: layer.into(),
                source: Box::new(other),
            },
        }
    }

    /// Error with any layer context stripped.
    pub fn root(&self) -> &Error {
        match self {
            Error::Layer { source, .. } => source.root(),
            other => other,
        }
    }

    /// Get error category for reporting.
    pub fn category(&self) -> &'static str {
        match self {
            Error::Range { .. } => "range",
            Error::Shape { .. } => "shape",
            Error::InvalidActivation(_) => "invalid_activation",
            Error::DuplicateName { .. } => "duplicate_name",
            Error::NameTooLong { .. } => "name_too_long",
            Error::InvalidBlob { .. } => "invalid_blob",
            Error::Config(_) => "config",
            Error::Layer { source, .. } => source.category(),
            Error::Io(_) => "io_error",
        }
    }
}
