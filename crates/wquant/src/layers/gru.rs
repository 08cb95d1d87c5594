//! GRU layers.
//!
//! Training weights stack the three gates as row groups in reset, update,
//! candidate order; the runtime expects update, reset, candidate. The first
//! two groups are swapped on the weights and both biases before anything else
//! happens.

use tracing::debug;
use wquant_core::{Error, LayerFormat, LayerKind, Result, WeightTensor};
use wquant_encode::{encode_sparse, quantize_clipped, subias, tile_8x4, QuantizedBlock};

use super::{check_bias, export_staged, linear::linear_layer, LayerSummary, PendingLayer};
use crate::config::{GruOptions, LinearOptions, SplitGruOptions};
use crate::session::{Arg, LayerRecord, Session};
use crate::sink::{ArrayOptions, NamedArray, WeightSink};

const DOT_PROD: &str = "DOT_PROD";

/// Parameters of one GRU.
#[derive(Debug, Clone, PartialEq)]
pub struct GruWeights {
    /// (3N, in) in training layout, (in, 3N) in runtime layout.
    pub input: WeightTensor,
    /// (3N, N) in training layout, (N, 3N) in runtime layout.
    pub recurrent: WeightTensor,
    pub bias: Vec<f32>,
    pub recurrent_bias: Vec<f32>,
}

/// Swap the first two of three row groups. Applying it twice is a no-op.
pub fn reorder_gates(x: &WeightTensor) -> Result<WeightTensor> {
    x.swap_row_groups(3, 0, 1)
}

/// GRU parameters in runtime layout.
#[derive(Debug)]
struct Prepared {
    input: WeightTensor,
    recurrent: WeightTensor,
    bias: Vec<f32>,
    recurrent_bias: Vec<f32>,
    nb_inputs: usize,
    state: usize,
}

fn reorder_bias(bias: &[f32]) -> Result<Vec<f32>> {
    Ok(reorder_gates(&WeightTensor::vector(bias.to_vec()))?.into_data())
}

/// Gate reorder (training layout only), leaving the matrices untransposed.
fn reorder_all(w: &GruWeights, format: LayerFormat) -> Result<GruWeights> {
    match format {
        LayerFormat::Training => Ok(GruWeights {
            input: reorder_gates(&w.input)?,
            recurrent: reorder_gates(&w.recurrent)?,
            bias: reorder_bias(&w.bias)?,
            recurrent_bias: reorder_bias(&w.recurrent_bias)?,
        }),
        LayerFormat::Runtime => Ok(w.clone()),
    }
}

fn prepare(w: &GruWeights, format: LayerFormat) -> Result<Prepared> {
    w.input.expect_rank(2, "write_gru_layer")?;
    w.recurrent.expect_rank(2, "write_gru_layer")?;
    let w = reorder_all(w, format)?;
    let (input, recurrent) = match format {
        LayerFormat::Training => (w.input.transpose()?, w.recurrent.transpose()?),
        LayerFormat::Runtime => (w.input, w.recurrent),
    };

    let gates = input.cols();
    if gates % 3 != 0 {
        return Err(Error::shape("write_gru_layer", "3N gate outputs", input.shape()));
    }
    let state = gates / 3;
    if recurrent.shape() != [state, gates] {
        return Err(Error::shape(
            "write_gru_layer",
            format!("recurrent weights ({state}, {gates})"),
            recurrent.shape(),
        ));
    }
    check_bias(&w.bias, gates, "write_gru_layer")?;
    check_bias(&w.recurrent_bias, gates, "write_gru_layer")?;

    Ok(Prepared {
        nb_inputs: input.rows(),
        input,
        recurrent,
        bias: w.bias,
        recurrent_bias: w.recurrent_bias,
        state,
    })
}

/// Export a GRU as one fused `GRULayer`.
///
/// Input and recurrent weights are quantized with saturation at
/// `options.scale`. With `dot_product`, packed `qweight` tables are emitted
/// under `DOT_PROD` next to the float tables, under the same names.
pub fn write_gru_layer<S: WeightSink + ?Sized>(
    sink: &mut S,
    session: &mut Session,
    name: &str,
    weights: &GruWeights,
    options: &GruOptions,
) -> Result<LayerSummary> {
    export_staged(sink, session, name, |out| gru_layer(out, name, weights, options))
}

/// Float weights, plus the packed alternative when requested.
fn stage_weights(
    out: &mut PendingLayer,
    name: String,
    weight: WeightTensor,
    q: &QuantizedBlock,
    dot_product: bool,
) -> Result<()> {
    if dot_product {
        let packed = tile_8x4(&q.values, q.rows, q.cols)?;
        out.alternatives(
            DOT_PROD,
            NamedArray::qweight(&name, packed),
            NamedArray::float(&name, weight.into_data()),
        );
    } else {
        out.array(NamedArray::float(name, weight.into_data()), ArrayOptions::default());
    }
    Ok(())
}

fn gru_layer(
    out: &mut PendingLayer,
    name: &str,
    weights: &GruWeights,
    options: &GruOptions,
) -> Result<LayerSummary> {
    let p = prepare(weights, options.format)?;
    let scale = &options.scale;
    let gates = 3 * p.state;
    scale.validate(gates)?;

    let weights_name;
    let mut idx_name = None;
    let input_q = quantize_clipped(&p.input, scale)?;
    if options.input_sparse {
        let enc = encode_sparse(&p.input, scale, false)?;
        weights_name = format!("{name}_weights_float");
        let idx = format!("{name}_weights_idx");
        out.array(NamedArray::float(&weights_name, enc.values), ArrayOptions::default());
        out.array(NamedArray::int(&idx, enc.index.into_vec()), ArrayOptions::default());
        idx_name = Some(idx);
    } else {
        weights_name = format!("{name}_weights");
        stage_weights(out, weights_name.clone(), p.input, &input_q, options.dot_product)?;
    }

    let recurrent_name = format!("{name}_recurrent_weights");
    let recurrent_q = quantize_clipped(&p.recurrent, scale)?;
    stage_weights(out, recurrent_name.clone(), p.recurrent, &recurrent_q, options.dot_product)?;

    let input_subias = subias(Some(p.bias.as_slice()), &input_q, scale)?;
    let recurrent_subias = subias(Some(p.recurrent_bias.as_slice()), &recurrent_q, scale)?;

    let bias_name = format!("{name}_bias");
    let subias_name = format!("{name}_subias");
    out.array(NamedArray::float(&bias_name, [p.bias, p.recurrent_bias].concat()), ArrayOptions::default());
    out.array(
        NamedArray::float(&subias_name, [input_subias, recurrent_subias].concat()),
        ArrayOptions::default(),
    );

    out.define(name, "OUT_SIZE", p.state);
    out.define(name, "STATE_SIZE", p.state);

    out.layer(LayerRecord {
        name: name.to_string(),
        kind: LayerKind::Gru,
        args: vec![
            Arg::array(bias_name),
            Arg::array(subias_name),
            Arg::array(weights_name),
            Arg::Array(idx_name),
            Arg::array(recurrent_name),
            Arg::Int(p.nb_inputs),
            Arg::Int(p.state),
            Arg::Ident(options.activation.c_name()),
            Arg::Int(usize::from(options.reset_after)),
        ],
        out_size: p.state,
        state_size: Some(p.state),
    });

    debug!(
        layer = name,
        nb_inputs = p.nb_inputs,
        state = p.state,
        input_sparse = options.input_sparse,
        dot_product = options.dot_product,
        "exported gru layer"
    );
    Ok(LayerSummary {
        state_size: Some(p.state),
        ..LayerSummary::new(p.nb_inputs, p.state)
    })
}

/// Export a GRU as two linear layers, `<name>_input` and `<name>_recurrent`.
///
/// The recurrent half uses sparse weights with diagonal extraction when
/// `recurrent_sparse` is set. Both halves are written only once both
/// exported cleanly.
pub fn write_split_gru_layer<S: WeightSink + ?Sized>(
    sink: &mut S,
    session: &mut Session,
    name: &str,
    weights: &GruWeights,
    options: &SplitGruOptions,
) -> Result<LayerSummary> {
    export_staged(sink, session, name, |out| split_gru_layer(out, name, weights, options))
}

fn split_gru_layer(
    out: &mut PendingLayer,
    name: &str,
    weights: &GruWeights,
    options: &SplitGruOptions,
) -> Result<LayerSummary> {
    weights.input.expect_rank(2, "write_split_gru_layer")?;
    let w = reorder_all(weights, options.format)?;
    let gates = match options.format {
        LayerFormat::Training => w.input.rows(),
        LayerFormat::Runtime => w.input.cols(),
    };
    if gates % 3 != 0 {
        return Err(Error::shape("write_split_gru_layer", "3N gate outputs", w.input.shape()));
    }
    let state = gates / 3;

    let linear = |sparse: bool| LinearOptions {
        format: options.format,
        sparse,
        diagonal: sparse,
        quantize: options.quantize,
        scale: options.scale.clone(),
    };
    let input_name = format!("{name}_input");
    let input = linear_layer(
        out,
        &input_name,
        &w.input,
        Some(w.bias.as_slice()),
        &LinearOptions {
            diagonal: false,
            ..linear(options.input_sparse)
        },
    )
    .map_err(|e| e.in_layer(input_name.as_str()))?;
    let recurrent_name = format!("{name}_recurrent");
    linear_layer(
        out,
        &recurrent_name,
        &w.recurrent,
        Some(w.recurrent_bias.as_slice()),
        &linear(options.recurrent_sparse),
    )
    .map_err(|e| e.in_layer(recurrent_name.as_str()))?;

    out.define(name, "OUT_SIZE", state);
    out.define(name, "STATE_SIZE", state);

    debug!(layer = name, state, "exported split gru layer");
    Ok(LayerSummary {
        state_size: Some(state),
        ..LayerSummary::new(input.nb_inputs, state)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::{BlobWriter, WeightBlob};
    use crate::config::WriterConfig;
    use crate::writer::CWriter;
    use wquant_core::{Activation, Scale};

    /// Training-layout GRU with N = 8 and 4 inputs; gate g rows hold g + 1.
    fn training_weights() -> GruWeights {
        let gate = |r: usize| ((r / 8) + 1) as f32 / 64.0;
        GruWeights {
            input: WeightTensor::from_fn(24, 4, |r, _| gate(r)),
            recurrent: WeightTensor::from_fn(24, 8, |r, _| gate(r)),
            bias: (0..24).map(gate).collect(),
            recurrent_bias: vec![0.0; 24],
        }
    }

    #[test]
    fn test_reorder_gates_is_involution() {
        let x = WeightTensor::from_fn(6, 2, |r, c| (r * 2 + c) as f32);
        let once = reorder_gates(&x).unwrap();
        assert_eq!(once.row(0), x.row(2));
        assert_eq!(once.row(2), x.row(0));
        assert_eq!(once.row(4), x.row(4));
        assert_eq!(reorder_gates(&once).unwrap(), x);

        assert!(reorder_gates(&WeightTensor::zeros(vec![4, 2])).is_err());
    }

    #[test]
    fn test_fused_gru_blob() {
        let mut sink = BlobWriter::new(Vec::new());
        let mut session = Session::new("Model");
        let summary = write_gru_layer(
            &mut sink,
            &mut session,
            "gru",
            &training_weights(),
            &GruOptions::new(Activation::Tanh),
        )
        .unwrap();
        assert_eq!((summary.nb_inputs, summary.out_size, summary.state_size), (4, 8, Some(8)));

        let bytes = sink.finish().unwrap();
        let blob = WeightBlob::parse(&bytes).unwrap();

        // after reorder the first runtime column block holds gate 1 (value 2/64)
        let w = blob.find("gru_weights").unwrap().as_f32();
        assert_eq!(w.len(), 4 * 24);
        assert_eq!(w[0], 2.0 / 64.0);
        assert_eq!(w[8], 1.0 / 64.0);
        assert_eq!(w[16], 3.0 / 64.0);

        let bias = blob.find("gru_bias").unwrap().as_f32();
        assert_eq!(bias.len(), 48);
        assert_eq!(bias[0], 2.0 / 64.0);

        // subias: bias - 4 inputs * q * 1/128 with q = 4 for gate value 2/64
        let subias = blob.find("gru_subias").unwrap().as_f32();
        assert!((subias[0] - (2.0 / 64.0 - 4.0 * 4.0 / 128.0)).abs() < 1e-6);
        assert!((subias[24] + 8.0 * 4.0 / 128.0).abs() < 1e-6);

        assert_eq!(
            session.init_call("gru").unwrap(),
            "gru_init(&model->gru, arrays, \"gru_bias\", \"gru_subias\", \"gru_weights\", NULL, \
             \"gru_recurrent_weights\", 4, 8, ACTIVATION_TANH, 0)"
        );
    }

    #[test]
    fn test_sparse_input_names() {
        let mut sink = BlobWriter::new(Vec::new());
        let mut session = Session::new("Model");
        let options = GruOptions {
            input_sparse: true,
            reset_after: true,
            ..GruOptions::new(Activation::Sigmoid)
        };
        write_gru_layer(&mut sink, &mut session, "gru", &training_weights(), &options).unwrap();

        assert!(session.contains_array("gru_weights_float"));
        assert!(session.contains_array("gru_weights_idx"));
        assert!(!session.contains_array("gru_weights"));
        let call = session.init_call("gru").unwrap();
        assert!(call.contains("\"gru_weights_float\", \"gru_weights_idx\""));
        assert!(call.ends_with("ACTIVATION_SIGMOID, 1)"));

        let blob_bytes = sink.finish().unwrap();
        let blob = WeightBlob::parse(&blob_bytes).unwrap();
        // 4 inputs, 24 outputs: one row tile per column tile, all nonzero
        assert_eq!(blob.find("gru_weights_idx").unwrap().as_i32(), vec![1, 0, 1, 0, 1, 0]);
    }

    #[test]
    fn test_dot_product_conditional_tables() {
        let mut w = CWriter::new(Vec::new(), Vec::new(), "gru", WriterConfig::default()).unwrap();
        let mut session = Session::new("Model");
        let options = GruOptions {
            dot_product: true,
            ..GruOptions::new(Activation::Tanh)
        };
        write_gru_layer(&mut w, &mut session, "gru", &training_weights(), &options).unwrap();
        let (_, s) = w.close().unwrap();
        let s = String::from_utf8(s).unwrap();

        assert!(s.contains("#ifdef DOT_PROD\n"));
        assert!(s.contains("const qweight gru_weights[96]"));
        assert!(s.contains("const float gru_weights[96]"));
        assert!(s.contains("const qweight gru_recurrent_weights[192]"));
        assert_eq!(session.arrays().filter(|a| a.name == "gru_weights").count(), 1);
    }

    #[test]
    fn test_recurrent_shape_checked() {
        let mut weights = training_weights();
        weights.recurrent = WeightTensor::zeros(vec![24, 7]);
        let mut sink = BlobWriter::new(Vec::new());
        let mut session = Session::new("Model");
        let err = write_gru_layer(&mut sink, &mut session, "gru", &weights, &GruOptions::new(Activation::Tanh))
            .unwrap_err();
        assert_eq!(err.category(), "shape");
    }

    #[test]
    fn test_split_gru() {
        let mut w = CWriter::new(Vec::new(), Vec::new(), "gru", WriterConfig::default()).unwrap();
        let mut session = Session::new("Model");
        let options = SplitGruOptions {
            quantize: true,
            recurrent_sparse: true,
            ..SplitGruOptions::default()
        };
        let summary =
            write_split_gru_layer(&mut w, &mut session, "gru", &training_weights(), &options).unwrap();
        assert_eq!((summary.out_size, summary.state_size), (8, Some(8)));

        let layers: Vec<_> = session.layers().map(|l| l.name.as_str()).collect();
        assert_eq!(layers, ["gru_input", "gru_recurrent"]);
        assert!(session.contains_array("gru_recurrent_weights_diag"));
        assert!(session.contains_array("gru_recurrent_weights_idx"));
        assert!(!session.contains_array("gru_input_weights_idx"));

        let (h, _) = w.close().unwrap();
        let h = String::from_utf8(h).unwrap();
        assert!(h.contains("#define GRU_OUT_SIZE 8\n"));
        assert!(h.contains("#define GRU_STATE_SIZE 8\n"));
        assert!(h.contains("#define GRU_INPUT_OUT_SIZE 24\n"));
    }

    #[test]
    fn test_split_gru_errors_name_inner_layer() {
        let mut weights = training_weights();
        weights.input = WeightTensor::from_fn(24, 4, |_, _| 4.0);
        let mut sink = BlobWriter::new(Vec::new());
        let mut session = Session::new("Model");
        let options = SplitGruOptions {
            scale: Scale::q7(),
            ..SplitGruOptions::default()
        };
        let err = write_split_gru_layer(&mut sink, &mut session, "gru", &weights, &options).unwrap_err();
        assert!(matches!(&err, Error::Layer { layer, .. } if layer == "gru_input"));
        assert_eq!(err.category(), "range");
    }

    #[test]
    fn test_split_gru_failure_keeps_input_half_out() {
        let mut weights = training_weights();
        weights.recurrent = WeightTensor::from_fn(24, 8, |_, _| 5.0);
        let mut sink = BlobWriter::new(Vec::new());
        let mut session = Session::new("Model");
        let options = SplitGruOptions {
            quantize: true,
            ..SplitGruOptions::default()
        };
        let err = write_split_gru_layer(&mut sink, &mut session, "gru", &weights, &options).unwrap_err();
        assert!(matches!(&err, Error::Layer { layer, .. } if layer == "gru_recurrent"));
        assert_eq!(session.layers().count(), 0);
        assert_eq!(session.arrays().count(), 0);
        assert_eq!(sink.records(), 0);

        write_split_gru_layer(&mut sink, &mut session, "gru", &training_weights(), &options).unwrap();
        assert!(session.contains_layer("gru_input"));
    }
}
