//! # wquant
//!
//! Exports trained network weights for a small int8 inference runtime.
//!
//! One export pass owns a [`Session`] and writes into a [`WeightSink`]:
//!
//! - [`CWriter`] produces a C header/source pair, either with the arrays
//!   compiled in directly or tagged for loading from a weight file
//! - [`BlobWriter`] produces that weight file; [`WeightBlob`] reads it back
//!
//! Layers are written one at a time with the `write_*_layer` functions (or
//! [`export_layer`] driven by a [`LayerConfig`]), then [`Session::finish`]
//! emits the model struct and init function tying everything together.
//!
//! ## Example
//!
//! ```
//! use wquant::{write_dense_layer, CWriter, Session, WriterConfig};
//! use wquant_core::{Activation, LayerFormat, WeightTensor};
//!
//! let config = WriterConfig::default();
//! let mut writer = CWriter::new(Vec::new(), Vec::new(), "tiny", config.clone()).unwrap();
//! let mut session = Session::from_config(&config);
//!
//! let weight = WeightTensor::from_fn(2, 3, |r, c| (r + c) as f32 / 10.0);
//! write_dense_layer(
//!     &mut writer,
//!     &mut session,
//!     "fc",
//!     &weight,
//!     &[0.0, 0.1],
//!     Activation::Tanh,
//!     LayerFormat::Training,
//! )
//! .unwrap();
//!
//! session.finish(&mut writer).unwrap();
//! let (header, _source) = writer.close().unwrap();
//! assert!(String::from_utf8(header).unwrap().contains("DenseLayer fc;"));
//! ```

pub mod blob;
pub mod config;
pub mod layers;
pub mod session;
pub mod sink;
pub mod writer;

pub use blob::{BlobArray, BlobWriter, WeightBlob};
pub use config::{GruOptions, LayerConfig, LinearOptions, SplitGruOptions, WriterConfig};
pub use layers::{
    export_layer, reorder_gates, write_conv1d_layer, write_dense_layer, write_gru_layer,
    write_linear_layer, write_split_gru_layer, GruWeights, LayerSummary, LayerTensors,
};
pub use session::{Arg, ArrayEntry, LayerRecord, Session, SessionSummary};
pub use sink::{ArrayData, ArrayOptions, Condition, NamedArray, WeightSink};
pub use writer::CWriter;

pub use wquant_core::{Error, Result};
