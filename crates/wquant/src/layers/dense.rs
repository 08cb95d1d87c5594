use tracing::debug;
use wquant_core::{Activation, LayerFormat, LayerKind, Result, WeightTensor};

use super::{check_bias, export_staged, to_runtime_layout, LayerSummary, PendingLayer};
use crate::session::{Arg, LayerRecord, Session};
use crate::sink::{ArrayOptions, NamedArray, WeightSink};

/// Export a float dense layer.
///
/// Writes `<name>_weights` (inputs x outputs, row-major) and `<name>_bias`.
pub fn write_dense_layer<S: WeightSink + ?Sized>(
    sink: &mut S,
    session: &mut Session,
    name: &str,
    weight: &WeightTensor,
    bias: &[f32],
    activation: Activation,
    format: LayerFormat,
) -> Result<LayerSummary> {
    export_staged(sink, session, name, |out| {
        dense_layer(out, name, weight, bias, activation, format)
    })
}

fn dense_layer(
    out: &mut PendingLayer,
    name: &str,
    weight: &WeightTensor,
    bias: &[f32],
    activation: Activation,
    format: LayerFormat,
) -> Result<LayerSummary> {
    let weight = to_runtime_layout(weight, format, "write_dense_layer")?;
    let (nb_inputs, nb_outputs) = (weight.rows(), weight.cols());
    check_bias(bias, nb_outputs, "write_dense_layer")?;

    let weights_name = format!("{name}_weights");
    let bias_name = format!("{name}_bias");
    out.array(NamedArray::float(&weights_name, weight.into_data()), ArrayOptions::default());
    out.array(NamedArray::float(&bias_name, bias.to_vec()), ArrayOptions::default());
    out.define(name, "OUT_SIZE", nb_outputs);

    out.layer(LayerRecord {
        name: name.to_string(),
        kind: LayerKind::Dense,
        args: vec![
            Arg::array(bias_name),
            Arg::array(weights_name),
            Arg::Int(nb_inputs),
            Arg::Int(nb_outputs),
            Arg::Ident(activation.c_name()),
        ],
        out_size: nb_outputs,
        state_size: None,
    });

    debug!(layer = name, nb_inputs, nb_outputs, %activation, "exported dense layer");
    Ok(LayerSummary::new(nb_inputs, nb_outputs))
}
