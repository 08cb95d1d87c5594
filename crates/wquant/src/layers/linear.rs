use tracing::{debug, warn};
use wquant_core::{LayerKind, Result, WeightTensor};
use wquant_encode::{encode_sparse, extract_diagonal, output_scale, quantize, subias, tile_8x4};

use super::{check_bias, export_staged, to_runtime_layout, LayerSummary, PendingLayer};
use crate::config::LinearOptions;
use crate::session::{Arg, LayerRecord, Session};
use crate::sink::{ArrayOptions, NamedArray, WeightSink};

/// Export a linear layer for the int8 kernels.
///
/// Arrays written, depending on `options`:
///
/// | array | when |
/// |---|---|
/// | `<name>_weights_diag` | sparse and diagonal |
/// | `<name>_weights_int8` | quantize (8x4 tiles when dense) |
/// | `<name>_weights_float` | always |
/// | `<name>_weights_idx` | sparse |
/// | `<name>_subias`, `<name>_scale` | quantize |
/// | `<name>_bias` | a bias is given |
///
/// Strict quantization always runs, so an out-of-range weight fails the
/// export even when only float weights are written.
pub fn write_linear_layer<S: WeightSink + ?Sized>(
    sink: &mut S,
    session: &mut Session,
    name: &str,
    weight: &WeightTensor,
    bias: Option<&[f32]>,
    options: &LinearOptions,
) -> Result<LayerSummary> {
    export_staged(sink, session, name, |out| linear_layer(out, name, weight, bias, options))
}

pub(super) fn linear_layer(
    out: &mut PendingLayer,
    name: &str,
    weight: &WeightTensor,
    bias: Option<&[f32]>,
    options: &LinearOptions,
) -> Result<LayerSummary> {
    let mut weight = to_runtime_layout(weight, options.format, "write_linear_layer")?;
    let (nb_inputs, nb_outputs) = (weight.rows(), weight.cols());
    if let Some(b) = bias {
        check_bias(b, nb_outputs, "write_linear_layer")?;
    }
    let scale = &options.scale;
    scale.validate(nb_outputs)?;

    let sparse = options.sparse;
    let diagonal = sparse && options.diagonal;
    if options.diagonal && !sparse {
        warn!(layer = name, "diagonal extraction needs sparse weights, ignored");
    }
    let quantized = options.quantize;

    let int8_name = format!("{name}_weights_int8");
    let float_name = format!("{name}_weights_float");
    let idx_name = format!("{name}_weights_idx");
    let diag_name = format!("{name}_weights_diag");
    let subias_name = format!("{name}_subias");
    let scale_name = format!("{name}_scale");
    let bias_name = format!("{name}_bias");

    if diagonal {
        let (diag, residual) = extract_diagonal(&weight)?;
        out.array(NamedArray::float(&diag_name, diag), ArrayOptions::default());
        weight = residual;
    }

    let q = quantize(&weight, scale)?;

    if sparse {
        let enc = encode_sparse(&weight, scale, quantized)?;
        if let Some(values) = enc.quantized {
            out.array(NamedArray::int8(&int8_name, values), ArrayOptions::default());
        }
        out.array(NamedArray::float(&float_name, enc.values), ArrayOptions::debug_float(quantized));
        out.array(NamedArray::int(&idx_name, enc.index.into_vec()), ArrayOptions::default());
    } else {
        if quantized {
            let tiled = tile_8x4(&q.values, nb_inputs, nb_outputs)?;
            out.array(NamedArray::int8(&int8_name, tiled), ArrayOptions::default());
        }
        out.array(
            NamedArray::float(&float_name, weight.into_data()),
            ArrayOptions::debug_float(quantized),
        );
    }

    if quantized {
        let corrected = subias(bias, &q, scale)?;
        out.array(NamedArray::float(&subias_name, corrected), ArrayOptions::default());
        out.array(
            NamedArray::float(&scale_name, output_scale(scale, nb_outputs)),
            ArrayOptions::default(),
        );
    }
    if let Some(b) = bias {
        out.array(NamedArray::float(&bias_name, b.to_vec()), ArrayOptions::default());
    }

    out.define(name, "OUT_SIZE", nb_outputs);

    out.layer(LayerRecord {
        name: name.to_string(),
        kind: LayerKind::Linear,
        args: vec![
            Arg::array_if(bias.is_some(), bias_name),
            Arg::array_if(quantized, subias_name),
            Arg::array_if(quantized, int8_name),
            Arg::array(float_name),
            Arg::array_if(sparse, idx_name),
            Arg::array_if(diagonal, diag_name),
            Arg::array_if(quantized, scale_name),
            Arg::Int(nb_inputs),
            Arg::Int(nb_outputs),
        ],
        out_size: nb_outputs,
        state_size: None,
    });

    debug!(layer = name, nb_inputs, nb_outputs, sparse, diagonal, quantized, "exported linear layer");
    Ok(LayerSummary::new(nb_inputs, nb_outputs))
}
