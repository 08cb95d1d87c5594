//! # wquant encode
//!
//! Numeric transforms behind the weight exporter. Everything here is a pure
//! function of its inputs.
//!
//! ```text
//!  weight matrix (inputs x outputs)
//!        │
//!        ├── extract_diagonal ──► diagonal (f32)      recurrent layers only
//!        │          │
//!        │          ▼ residual
//!        ├── quantize / quantize_clipped ──► int8, subias, output scale
//!        │
//!        └── encode_sparse ──► index + float tiles (+ int8 tiles)
//! ```
//!
//! ## Example
//!
//! ```
//! use wquant_core::{Scale, WeightTensor};
//! use wquant_encode::encode_sparse;
//!
//! let a = WeightTensor::from_fn(4, 8, |r, c| (r + c) as f32 / 32.0 + 0.01);
//! let enc = encode_sparse(&a, &Scale::q7(), true).unwrap();
//! assert_eq!(enc.index.as_slice(), &[1, 0]);
//! ```

pub mod diagonal;
pub mod layout;
pub mod quantize;
pub mod sparse;

pub use diagonal::{extract_diagonal, scatter_diagonal};
pub use layout::tile_8x4;
pub use quantize::{
    output_scale, quantize, quantize_clipped, quantize_value_clipped, round_steps, subias,
    QuantizedBlock, QMAX, QMIN,
};
pub use sparse::{
    check_tiling, encode_sparse, SparseEncoding, SparseIndex, TILE_COLS, TILE_ROWS, TILE_SIZE,
    ZERO_TILE_EPSILON,
};
