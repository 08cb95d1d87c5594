//! Scalar int8 quantization with bias correction.
//!
//! Values are rounded half-to-even, the same rounding the exporter's numeric
//! reference applies, so generated tables match bit for bit.
//!
//! Two entry points exist on purpose:
//!
//! - [`quantize`] rejects any value whose rounded step count reaches 128 in
//!   magnitude and reports where it happened.
//! - [`quantize_clipped`] saturates to `[-128, 127]` and never fails.

use serde::{Deserialize, Serialize};
use wquant_core::{Error, Result, Scale, WeightTensor};

/// Largest representable quantized value.
pub const QMAX: i32 = 127;

/// Smallest representable quantized value.
pub const QMIN: i32 = -128;

/// Int8 matrix produced by quantizing a weight matrix.
///
/// Columns are output channels; per-channel scales index by column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuantizedBlock {
    pub rows: usize,
    pub cols: usize,
    /// Row-major values.
    pub values: Vec<i8>,
}

impl QuantizedBlock {
    #[inline]
    pub fn at(&self, row: usize, col: usize) -> i8 {
        self.values[row * self.cols + col]
    }

    /// Multiply back by the scale.
    pub fn dequantize(&self, scale: &Scale) -> WeightTensor {
        WeightTensor::from_fn(self.rows, self.cols, |r, c| {
            self.at(r, c) as f32 * scale.at(c)
        })
    }

    /// Per-column sum of `q * scale`, accumulated in double precision.
    pub fn column_sums(&self, scale: &Scale) -> Vec<f64> {
        let mut sums = vec![0.0f64; self.cols];
        for r in 0..self.rows {
            for (c, sum) in sums.iter_mut().enumerate() {
                *sum += self.at(r, c) as f64 * scale.at(c) as f64;
            }
        }
        sums
    }
}

/// Round `value / step` to the nearest step count, ties to even.
#[inline]
pub fn round_steps(value: f32, step: f32) -> f32 {
    (value / step).round_ties_even()
}

/// Saturating quantization of a single value.
#[inline]
pub fn quantize_value_clipped(value: f32, step: f32) -> i8 {
    round_steps(value, step).clamp(QMIN as f32, QMAX as f32) as i8
}

fn check_operands(weight: &WeightTensor, scale: &Scale, context: &'static str) -> Result<()> {
    weight.expect_rank(2, context)?;
    scale.validate(weight.cols())
}

/// Strict quantization.
///
/// Fails with [`Error::Range`] on the first element whose step count is above
/// 127, at or below -128, or not a number.
pub fn quantize(weight: &WeightTensor, scale: &Scale) -> Result<QuantizedBlock> {
    check_operands(weight, scale, "quantize")?;
    let cols = weight.cols();

    let mut values = Vec::with_capacity(weight.len());
    for (i, &w) in weight.data().iter().enumerate() {
        let step = scale.at(i % cols);
        let q = round_steps(w, step);
        if !(q > QMIN as f32 && q <= QMAX as f32) {
            return Err(Error::Range {
                index: i,
                value: w,
                scale: step,
                quantized: q,
            });
        }
        values.push(q as i8);
    }

    Ok(QuantizedBlock {
        rows: weight.rows(),
        cols,
        values,
    })
}

/// Saturating quantization. Never fails on values, only on shapes.
pub fn quantize_clipped(weight: &WeightTensor, scale: &Scale) -> Result<QuantizedBlock> {
    check_operands(weight, scale, "quantize_clipped")?;
    let cols = weight.cols();

    let values = weight
        .data()
        .iter()
        .enumerate()
        .map(|(i, &w)| quantize_value_clipped(w, scale.at(i % cols)))
        .collect();

    Ok(QuantizedBlock {
        rows: weight.rows(),
        cols,
        values,
    })
}

/// Bias corrected for the integer product: `bias - sum_rows(q * scale)`.
///
/// A missing bias counts as zeros. The runtime's integer matmul drops the
/// fractional remainder, and adds this term back in floating point.
pub fn subias(bias: Option<&[f32]>, q: &QuantizedBlock, scale: &Scale) -> Result<Vec<f32>> {
    if let Some(b) = bias {
        if b.len() != q.cols {
            return Err(Error::shape("subias", format!("{} bias values", q.cols), &[b.len()]));
        }
    }

    Ok(q.column_sums(scale)
        .into_iter()
        .enumerate()
        .map(|(c, sum)| {
            let b = bias.map_or(0.0, |b| b[c] as f64);
            (b - sum) as f32
        })
        .collect())
}

/// Output scale handed to the runtime: `scale / 127` per output channel.
pub fn output_scale(scale: &Scale, nb_outputs: usize) -> Vec<f32> {
    (0..nb_outputs).map(|c| scale.at(c) / QMAX as f32).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn m(rows: usize, cols: usize, data: &[f32]) -> WeightTensor {
        WeightTensor::matrix(rows, cols, data.to_vec()).unwrap()
    }

    #[test]
    fn test_round_half_to_even() {
        assert_eq!(round_steps(0.5, 1.0), 0.0);
        assert_eq!(round_steps(1.5, 1.0), 2.0);
        assert_eq!(round_steps(2.5, 1.0), 2.0);
        assert_eq!(round_steps(-0.5, 1.0), 0.0);
        assert_eq!(round_steps(-1.5, 1.0), -2.0);
    }

    #[test]
    fn test_quantize_basic() {
        let w = m(2, 2, &[0.5, -0.25, 0.0, 0.99]);
        let q = quantize(&w, &Scale::q7()).unwrap();
        assert_eq!(q.values, vec![64, -32, 0, 127]);
    }

    #[test]
    fn test_quantize_rejects_overflow() {
        let w = m(1, 2, &[0.1, 1.0]);
        match quantize(&w, &Scale::q7()) {
            Err(Error::Range { index, quantized, .. }) => {
                assert_eq!(index, 1);
                assert_eq!(quantized, 128.0);
            }
            other => panic!("expected range error, got {other:?}"),
        }
    }

    #[test]
    fn test_quantize_rejects_negative_128() {
        let w = m(1, 1, &[-1.0]);
        assert!(matches!(quantize(&w, &Scale::q7()), Err(Error::Range { .. })));
    }

    #[test]
    fn test_quantize_rejects_nan() {
        let w = m(1, 1, &[f32::NAN]);
        assert!(matches!(quantize(&w, &Scale::q7()), Err(Error::Range { .. })));
    }

    #[test]
    fn test_clipped_saturates() {
        let w = m(1, 3, &[2.0, -2.0, -1.0]);
        let q = quantize_clipped(&w, &Scale::q7()).unwrap();
        assert_eq!(q.values, vec![127, -128, -128]);
    }

    #[test]
    fn test_per_channel_scale() {
        let w = m(2, 2, &[1.0, 1.0, -1.0, 0.5]);
        let scale = Scale::PerChannel(vec![0.5, 0.25]);
        let q = quantize(&w, &scale).unwrap();
        assert_eq!(q.values, vec![2, 4, -2, 2]);
    }

    #[test]
    fn test_per_channel_scale_length() {
        let w = m(2, 2, &[0.0; 4]);
        let scale = Scale::PerChannel(vec![0.5]);
        assert!(matches!(quantize(&w, &scale), Err(Error::Shape { .. })));
    }

    #[test]
    fn test_subias_identity() {
        let w = m(3, 2, &[0.1, -0.2, 0.3, 0.4, -0.5, 0.05]);
        let scale = Scale::q7();
        let bias = [0.25f32, -0.75];
        let q = quantize(&w, &scale).unwrap();
        let sb = subias(Some(&bias[..]), &q, &scale).unwrap();
        let sums = q.column_sums(&scale);
        for c in 0..2 {
            assert!((sb[c] as f64 + sums[c] - bias[c] as f64).abs() < 1e-6);
        }
    }

    #[test]
    fn test_subias_without_bias() {
        let w = m(2, 1, &[0.5, 0.25]);
        let q = quantize(&w, &Scale::q7()).unwrap();
        let sb = subias(None, &q, &Scale::q7()).unwrap();
        assert_eq!(sb, vec![-0.75]);
    }

    #[test]
    fn test_subias_bias_length() {
        let q = quantize(&m(1, 2, &[0.0, 0.0]), &Scale::q7()).unwrap();
        assert!(subias(Some(&[1.0][..]), &q, &Scale::q7()).is_err());
    }

    #[test]
    fn test_output_scale() {
        let s = output_scale(&Scale::Uniform(1.27), 3);
        assert_eq!(s.len(), 3);
        assert!(s.iter().all(|&v| (v - 0.01).abs() < 1e-7));
    }
}
