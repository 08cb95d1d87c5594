//! Layer serializers.
//!
//! Each serializer normalizes the incoming tensors to the runtime layout
//! (rows = inputs, columns = outputs), runs the numeric transforms from
//! `wquant_encode`, and stages the resulting named arrays, size constants and
//! [`LayerRecord`](crate::LayerRecord)s. Nothing reaches the sink or the
//! session until the whole layer has been built, so a failed export changes
//! neither. Every error leaves with the layer's name attached.

mod conv1d;
mod dense;
mod gru;
mod linear;

pub use conv1d::write_conv1d_layer;
pub use dense::write_dense_layer;
pub use gru::{reorder_gates, write_gru_layer, write_split_gru_layer, GruWeights};
pub use linear::write_linear_layer;

use std::fmt::Display;

use serde::{Deserialize, Serialize};
use tracing::debug;
use wquant_core::{Error, LayerFormat, Result, WeightTensor};

use crate::config::LayerConfig;
use crate::session::{ArrayEntry, LayerRecord, Session};
use crate::sink::{ArrayOptions, Condition, NamedArray, WeightSink};

/// Sizes of an exported layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerSummary {
    pub nb_inputs: usize,
    pub out_size: usize,
    pub state_size: Option<usize>,
    /// Convolution kernel length, 1 for every other layer.
    pub kernel_size: usize,
}

impl LayerSummary {
    fn new(nb_inputs: usize, out_size: usize) -> Self {
        Self {
            nb_inputs,
            out_size,
            state_size: None,
            kernel_size: 1,
        }
    }

    /// Inputs consumed per output frame.
    pub fn input_window(&self) -> usize {
        self.kernel_size * self.nb_inputs
    }
}

/// Tensors of one layer, tagged with the layer type.
#[derive(Debug, Clone, PartialEq)]
pub enum LayerTensors {
    Dense { weight: WeightTensor, bias: Vec<f32> },
    Conv1d { weight: WeightTensor, bias: Vec<f32> },
    Linear { weight: WeightTensor, bias: Option<Vec<f32>> },
    Gru(GruWeights),
    /// GRU exported as two linear layers.
    SplitGru(GruWeights),
}

/// Export one layer according to `config`.
pub fn export_layer<S: WeightSink + ?Sized>(
    sink: &mut S,
    session: &mut Session,
    name: &str,
    tensors: &LayerTensors,
    config: &LayerConfig,
) -> Result<LayerSummary> {
    match tensors {
        LayerTensors::Dense { weight, bias } => {
            write_dense_layer(sink, session, name, weight, bias, config.activation, config.format)
        }
        LayerTensors::Conv1d { weight, bias } => {
            write_conv1d_layer(sink, session, name, weight, bias, config.activation, config.format)
        }
        LayerTensors::Linear { weight, bias } => {
            write_linear_layer(sink, session, name, weight, bias.as_deref(), &config.linear())
        }
        LayerTensors::Gru(w) => write_gru_layer(sink, session, name, w, &config.gru()),
        LayerTensors::SplitGru(w) => {
            write_split_gru_layer(sink, session, name, w, &config.split_gru())
        }
    }
}

/// One staged write, replayed in order on commit.
#[derive(Debug)]
enum Output {
    Array(NamedArray, ArrayOptions),
    Header(String),
}

/// Everything one layer export produces, held back until it all succeeded.
///
/// Serializers only fill the buffer. [`PendingLayer::commit`] checks every
/// name against the session and every array against the sink before the
/// first write, so a failed export leaves the session untouched and the sink
/// without partial output.
#[derive(Debug, Default)]
pub(crate) struct PendingLayer {
    outputs: Vec<Output>,
    arrays: Vec<ArrayEntry>,
    layers: Vec<LayerRecord>,
}

fn entry(array: &NamedArray) -> ArrayEntry {
    ArrayEntry {
        name: array.name.clone(),
        dtype: array.dtype(),
        len: array.len(),
    }
}

impl PendingLayer {
    pub(crate) fn array(&mut self, array: NamedArray, options: ArrayOptions) {
        self.arrays.push(entry(&array));
        self.outputs.push(Output::Array(array, options));
    }

    /// Two definitions of one array name, selected by `symbol`.
    ///
    /// `preferred` is compiled when `symbol` is defined, `fallback` otherwise.
    /// The name is registered once, with the fallback's type.
    pub(crate) fn alternatives(
        &mut self,
        symbol: &'static str,
        preferred: NamedArray,
        fallback: NamedArray,
    ) {
        debug_assert_eq!(preferred.name, fallback.name);
        self.arrays.push(entry(&fallback));
        self.outputs
            .push(Output::Array(preferred, ArrayOptions::when(Condition::ifdef(symbol))));
        self.outputs
            .push(Output::Array(fallback, ArrayOptions::when(Condition::ifndef(symbol))));
    }

    /// `#define <LAYER>_<SUFFIX> <value>` in the header.
    pub(crate) fn define(&mut self, layer: &str, suffix: &str, value: impl Display) {
        self.outputs.push(Output::Header(format!(
            "\n#define {}_{suffix} {value}\n",
            layer.to_uppercase()
        )));
    }

    pub(crate) fn layer(&mut self, record: LayerRecord) {
        self.layers.push(record);
    }

    /// Validate, write and register.
    pub(crate) fn commit<S: WeightSink + ?Sized>(
        self,
        sink: &mut S,
        session: &mut Session,
    ) -> Result<()> {
        session.check_batch(&self.arrays, &self.layers)?;
        for output in &self.outputs {
            if let Output::Array(array, options) = output {
                sink.check_array(array, *options)?;
            }
        }

        for output in &self.outputs {
            match output {
                Output::Array(array, options) => {
                    sink.write_array(array, *options)?;
                    debug!(name = %array.name, dtype = array.dtype().tag(), len = array.len(), "wrote array");
                }
                Output::Header(text) => sink.write_header(text)?,
            }
        }
        session.register_batch(self.arrays, self.layers)
    }
}

/// Run one serializer into a [`PendingLayer`] and commit its output.
///
/// Errors carry `name` unless an inner layer already named itself.
pub(crate) fn export_staged<S, F>(
    sink: &mut S,
    session: &mut Session,
    name: &str,
    build: F,
) -> Result<LayerSummary>
where
    S: WeightSink + ?Sized,
    F: FnOnce(&mut PendingLayer) -> Result<LayerSummary>,
{
    let mut out = PendingLayer::default();
    let summary = build(&mut out).map_err(|e| e.in_layer(name))?;
    out.commit(sink, session).map_err(|e| e.in_layer(name))?;
    Ok(summary)
}

/// Matrix in runtime layout: training tensors are stored output-major.
pub(crate) fn to_runtime_layout(
    weight: &WeightTensor,
    format: LayerFormat,
    context: &'static str,
) -> Result<WeightTensor> {
    weight.expect_rank(2, context)?;
    match format {
        LayerFormat::Training => weight.transpose(),
        LayerFormat::Runtime => Ok(weight.clone()),
    }
}

pub(crate) fn check_bias(bias: &[f32], nb_outputs: usize, context: &'static str) -> Result<()> {
    if bias.len() != nb_outputs {
        return Err(Error::shape(
            context,
            format!("{nb_outputs} bias values"),
            &[bias.len()],
        ));
    }
    Ok(())
}
