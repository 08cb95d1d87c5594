//! # wquant core
//!
//! Shared types for exporting trained network weights to a quantized,
//! block-sparse representation read by a small inference runtime.
//!
//! - [`WeightTensor`]: flat row-major `f32` buffer with an explicit shape
//! - [`Scale`]: uniform or per-output-channel quantization step
//! - [`Activation`], [`DType`], [`LayerKind`], [`LayerFormat`]: closed tag sets
//! - [`Error`]: the failure taxonomy shared by every crate in the workspace

pub mod error;
pub mod tensor;
pub mod types;

pub use error::{Error, Result};
pub use tensor::WeightTensor;
pub use types::{Activation, DType, LayerFormat, LayerKind, Scale, Q7_STEP};
