use tracing::debug;
use wquant_core::{Activation, Error, LayerFormat, LayerKind, Result, WeightTensor};

use super::{check_bias, export_staged, LayerSummary, PendingLayer};
use crate::session::{Arg, LayerRecord, Session};
use crate::sink::{ArrayOptions, NamedArray, WeightSink};

/// Export a 1-D convolution.
///
/// Training weights are (out, in, kernel) and are stored channels last as
/// (kernel, in, out). The returned summary's
/// [`input_window`](LayerSummary::input_window) is `kernel * in`.
pub fn write_conv1d_layer<S: WeightSink + ?Sized>(
    sink: &mut S,
    session: &mut Session,
    name: &str,
    weight: &WeightTensor,
    bias: &[f32],
    activation: Activation,
    format: LayerFormat,
) -> Result<LayerSummary> {
    export_staged(sink, session, name, |out| {
        conv1d_layer(out, name, weight, bias, activation, format)
    })
}

fn conv1d_layer(
    out: &mut PendingLayer,
    name: &str,
    weight: &WeightTensor,
    bias: &[f32],
    activation: Activation,
    format: LayerFormat,
) -> Result<LayerSummary> {
    weight.expect_rank(3, "write_conv1d_layer")?;
    let weight = match format {
        LayerFormat::Training => weight.permute([2, 1, 0])?,
        LayerFormat::Runtime => weight.clone(),
    };
    let (kernel_size, nb_inputs, nb_outputs) = (weight.shape()[0], weight.shape()[1], weight.shape()[2]);
    if kernel_size == 0 {
        return Err(Error::shape(
            "write_conv1d_layer",
            "kernel size of at least 1",
            weight.shape(),
        ));
    }
    check_bias(bias, nb_outputs, "write_conv1d_layer")?;

    let weights_name = format!("{name}_weights");
    let bias_name = format!("{name}_bias");
    out.array(NamedArray::float(&weights_name, weight.into_data()), ArrayOptions::default());
    out.array(NamedArray::float(&bias_name, bias.to_vec()), ArrayOptions::default());

    let history = kernel_size - 1;
    out.define(name, "OUT_SIZE", nb_outputs);
    out.define(name, "STATE_SIZE", format!("({nb_inputs} * ({history}))"));
    out.define(name, "DELAY", history / 2);

    out.layer(LayerRecord {
        name: name.to_string(),
        kind: LayerKind::Conv1d,
        args: vec![
            Arg::array(bias_name),
            Arg::array(weights_name),
            Arg::Int(nb_inputs),
            Arg::Int(kernel_size),
            Arg::Int(nb_outputs),
            Arg::Ident(activation.c_name()),
        ],
        out_size: nb_outputs,
        state_size: Some(nb_inputs * history),
    });

    debug!(layer = name, kernel_size, nb_inputs, nb_outputs, "exported conv1d layer");
    Ok(LayerSummary {
        state_size: Some(nb_inputs * history),
        kernel_size,
        ..LayerSummary::new(nb_inputs, nb_outputs)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WriterConfig;
    use crate::writer::CWriter;

    #[test]
    fn test_conv1d_layout_and_sizes() {
        let mut w = CWriter::new(Vec::new(), Vec::new(), "conv", WriterConfig::default()).unwrap();
        let mut session = Session::new("Model");
        // out=2, in=3, kernel=3; value encodes (o, i, k)
        let data = (0..18)
            .map(|i| {
                let (o, i, k) = (i / 9, (i / 3) % 3, i % 3);
                (o * 100 + i * 10 + k) as f32
            })
            .collect();
        let weight = WeightTensor::new(vec![2, 3, 3], data).unwrap();

        let summary = write_conv1d_layer(
            &mut w,
            &mut session,
            "conv",
            &weight,
            &[0.0, 0.0],
            Activation::Tanh,
            LayerFormat::Training,
        )
        .unwrap();
        assert_eq!(summary.input_window(), 9);
        assert_eq!(summary.state_size, Some(6));

        let (h, s) = w.close().unwrap();
        let h = String::from_utf8(h).unwrap();
        assert!(h.contains("#define CONV_OUT_SIZE 2\n"));
        assert!(h.contains("#define CONV_STATE_SIZE (3 * (2))\n"));
        assert!(h.contains("#define CONV_DELAY 1\n"));

        // (k, i, o): first values are k=0, i=0, o=0..2 then i=1
        let s = String::from_utf8(s).unwrap();
        assert!(s.contains("const float conv_weights[18] = {\n    0.0, 100.0, 10.0, 110.0, 20.0, 120.0, 1.0, 101.0,"));
        assert_eq!(
            session.init_call("conv").unwrap(),
            "conv1d_init(&model->conv, arrays, \"conv_bias\", \"conv_weights\", 3, 3, 2, ACTIVATION_TANH)"
        );
    }

    #[test]
    fn test_empty_kernel_is_rejected() {
        let mut w = CWriter::new(Vec::new(), Vec::new(), "conv", WriterConfig::default()).unwrap();
        let mut session = Session::new("Model");
        let weight = WeightTensor::new(vec![0, 2, 2], vec![]).unwrap();
        let err = write_conv1d_layer(
            &mut w,
            &mut session,
            "conv",
            &weight,
            &[0.0, 0.0],
            Activation::Linear,
            LayerFormat::Runtime,
        )
        .unwrap_err();
        assert_eq!(err.category(), "shape");
    }
}
