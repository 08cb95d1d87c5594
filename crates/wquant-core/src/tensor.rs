//! Dense `f32` tensors with explicit shape.
//!
//! Storage is a flat row-major buffer. Layout changes (transpose, axis
//! permutation, row-block swaps) are explicit index maps that return a new
//! tensor; nothing is a view into another tensor.

use crate::{Error, Result};

/// Row-major `f32` tensor of rank 1 to 3.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightTensor {
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl WeightTensor {
    /// Create a tensor, checking that `data` fills `shape` exactly.
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if shape.is_empty() || shape.len() > 3 || expected != data.len() {
            return Err(Error::shape(
                "WeightTensor::new",
                format!("rank 1..=3 with {} elements", data.len()),
                &shape,
            ));
        }
        Ok(Self { shape, data })
    }

    /// Rank-1 tensor.
    pub fn vector(data: Vec<f32>) -> Self {
        Self {
            shape: vec![data.len()],
            data,
        }
    }

    /// Rank-2 tensor.
    pub fn matrix(rows: usize, cols: usize, data: Vec<f32>) -> Result<Self> {
        Self::new(vec![rows, cols], data)
    }

    /// Rank-2 tensor filled by `f(row, col)`.
    pub fn from_fn(rows: usize, cols: usize, mut f: impl FnMut(usize, usize) -> f32) -> Self {
        let mut data = Vec::with_capacity(rows * cols);
        for r in 0..rows {
            for c in 0..cols {
                data.push(f(r, c));
            }
        }
        Self {
            shape: vec![rows, cols],
            data,
        }
    }

    /// All-zero tensor.
    pub fn zeros(shape: Vec<usize>) -> Self {
        let len = shape.iter().product();
        Self {
            shape,
            data: vec![0.0; len],
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Flat row-major values.
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn into_data(self) -> Vec<f32> {
        self.data
    }

    /// Fail with a shape error unless the tensor has `rank` dimensions.
    pub fn expect_rank(&self, rank: usize, context: &'static str) -> Result<()> {
        if self.rank() != rank {
            return Err(Error::shape(context, format!("rank {rank}"), &self.shape));
        }
        Ok(())
    }

    /// Row count of a matrix.
    pub fn rows(&self) -> usize {
        self.shape[0]
    }

    /// Column count of a matrix (1 for vectors).
    pub fn cols(&self) -> usize {
        self.shape[1..].iter().product()
    }

    /// Element of a matrix.
    #[inline]
    pub fn at(&self, row: usize, col: usize) -> f32 {
        self.data[row * self.cols() + col]
    }

    /// Row slice of a matrix.
    pub fn row(&self, row: usize) -> &[f32] {
        let cols = self.cols();
        &self.data[row * cols..(row + 1) * cols]
    }

    /// Matrix transpose.
    pub fn transpose(&self) -> Result<Self> {
        self.expect_rank(2, "transpose")?;
        let (rows, cols) = (self.shape[0], self.shape[1]);
        let mut data = Vec::with_capacity(self.data.len());
        for c in 0..cols {
            for r in 0..rows {
                data.push(self.data[r * cols + c]);
            }
        }
        Ok(Self {
            shape: vec![cols, rows],
            data,
        })
    }

    /// Rank-3 axis permutation: output axis `i` is input axis `axes[i]`.
    pub fn permute(&self, axes: [usize; 3]) -> Result<Self> {
        self.expect_rank(3, "permute")?;
        let mut seen = [false; 3];
        for &a in &axes {
            if a > 2 || seen[a] {
                return Err(Error::shape("permute", "a permutation of [0, 1, 2]", &axes));
            }
            seen[a] = true;
        }

        let dims = [self.shape[0], self.shape[1], self.shape[2]];
        let strides = [dims[1] * dims[2], dims[2], 1];
        let out_dims = [dims[axes[0]], dims[axes[1]], dims[axes[2]]];
        let out_strides = [strides[axes[0]], strides[axes[1]], strides[axes[2]]];

        let mut data = Vec::with_capacity(self.data.len());
        for i in 0..out_dims[0] {
            for j in 0..out_dims[1] {
                for k in 0..out_dims[2] {
                    data.push(self.data[i * out_strides[0] + j * out_strides[1] + k * out_strides[2]]);
                }
            }
        }
        Ok(Self {
            shape: out_dims.to_vec(),
            data,
        })
    }

    /// Swap two equal-sized groups of leading-axis rows.
    ///
    /// The leading axis is split into `groups` equal parts; groups `a` and `b`
    /// trade places. Works for vectors (rows are single elements) and for
    /// matrices.
    pub fn swap_row_groups(&self, groups: usize, a: usize, b: usize) -> Result<Self> {
        let rows = self.shape[0];
        if groups == 0 || rows % groups != 0 || a >= groups || b >= groups {
            return Err(Error::shape(
                "swap_row_groups",
                format!("leading dimension divisible by {groups}"),
                &self.shape,
            ));
        }
        let group_len = rows / groups * self.cols();
        let mut data = self.data.clone();
        if a != b {
            let (lo, hi) = (a.min(b), a.max(b));
            let (head, tail) = data.split_at_mut(hi * group_len);
            head[lo * group_len..(lo + 1) * group_len].swap_with_slice(&mut tail[..group_len]);
        }
        Ok(Self {
            shape: self.shape.clone(),
            data,
        })
    }

    /// Largest absolute value, 0 for an empty tensor.
    pub fn max_abs(&self) -> f32 {
        self.data.iter().fold(0.0f32, |m, v| m.max(v.abs()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_rejects_bad_len() {
        assert!(WeightTensor::new(vec![2, 3], vec![0.0; 5]).is_err());
        assert!(WeightTensor::new(vec![], vec![]).is_err());
        assert!(WeightTensor::new(vec![1, 1, 1, 1], vec![0.0]).is_err());
    }

    #[test]
    fn test_transpose() {
        let m = WeightTensor::matrix(2, 3, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let t = m.transpose().unwrap();
        assert_eq!(t.shape(), &[3, 2]);
        assert_eq!(t.data(), &[1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
        assert_eq!(t.transpose().unwrap(), m);
    }

    #[test]
    fn test_transpose_requires_matrix() {
        let v = WeightTensor::vector(vec![1.0, 2.0]);
        assert!(matches!(v.transpose(), Err(Error::Shape { .. })));
    }

    #[test]
    fn test_permute_reverses_axes() {
        // (out=2, in=3, k=4) -> (k, in, out)
        let data: Vec<f32> = (0..24).map(|i| i as f32).collect();
        let t = WeightTensor::new(vec![2, 3, 4], data).unwrap();
        let p = t.permute([2, 1, 0]).unwrap();
        assert_eq!(p.shape(), &[4, 3, 2]);
        for o in 0..2 {
            for i in 0..3 {
                for k in 0..4 {
                    let src = t.data()[o * 12 + i * 4 + k];
                    let dst = p.data()[k * 6 + i * 2 + o];
                    assert_eq!(src, dst);
                }
            }
        }
    }

    #[test]
    fn test_permute_rejects_duplicates() {
        let t = WeightTensor::zeros(vec![1, 2, 3]);
        assert!(t.permute([0, 0, 1]).is_err());
    }

    #[test]
    fn test_swap_row_groups() {
        let v = WeightTensor::vector(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let s = v.swap_row_groups(3, 0, 1).unwrap();
        assert_eq!(s.data(), &[3.0, 4.0, 1.0, 2.0, 5.0, 6.0]);

        let m = WeightTensor::from_fn(3, 2, |r, c| (r * 10 + c) as f32);
        let s = m.swap_row_groups(3, 0, 1).unwrap();
        assert_eq!(s.row(0), &[10.0, 11.0]);
        assert_eq!(s.row(1), &[0.0, 1.0]);
        assert_eq!(s.row(2), &[20.0, 21.0]);
    }

    #[test]
    fn test_swap_row_groups_indivisible() {
        let v = WeightTensor::vector(vec![0.0; 4]);
        assert!(v.swap_row_groups(3, 0, 1).is_err());
    }
}
