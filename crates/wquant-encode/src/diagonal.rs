//! Diagonal extraction for recurrent weight matrices.
//!
//! A recurrent matrix of shape (N, k*N) is k square blocks side by side.
//! Self-recurrent terms sit on each block's main diagonal and are usually much
//! larger than everything else, so they are stored separately as floats and
//! the residual is left to the sparse encoder.

use wquant_core::{Error, Result, WeightTensor};

/// Split `a` into its per-block diagonals and the residual matrix.
///
/// The diagonal vector has length k*N, block order. The residual equals `a`
/// with every extracted diagonal entry set to zero.
pub fn extract_diagonal(a: &WeightTensor) -> Result<(Vec<f32>, WeightTensor)> {
    let (n, k) = block_count(a)?;
    let cols = a.cols();

    let mut residual = a.data().to_vec();
    let mut diag = Vec::with_capacity(k * n);
    for block in 0..k {
        for i in 0..n {
            let idx = i * cols + block * n + i;
            diag.push(residual[idx]);
            residual[idx] = 0.0;
        }
    }

    Ok((diag, WeightTensor::matrix(n, cols, residual)?))
}

/// Add `diag` back onto the block diagonals of `residual`.
pub fn scatter_diagonal(diag: &[f32], residual: &WeightTensor) -> Result<WeightTensor> {
    let (n, k) = block_count(residual)?;
    if diag.len() != k * n {
        return Err(Error::shape(
            "scatter_diagonal",
            format!("{} diagonal values", k * n),
            &[diag.len()],
        ));
    }
    let cols = residual.cols();

    let mut data = residual.data().to_vec();
    for block in 0..k {
        for i in 0..n {
            data[i * cols + block * n + i] += diag[block * n + i];
        }
    }
    WeightTensor::matrix(n, cols, data)
}

fn block_count(a: &WeightTensor) -> Result<(usize, usize)> {
    a.expect_rank(2, "extract_diagonal")?;
    let (n, m) = (a.rows(), a.cols());
    if n == 0 || m == 0 || m % n != 0 {
        return Err(Error::shape("extract_diagonal", "(N, k*N) with k >= 1", a.shape()));
    }
    Ok((n, m / n))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_two_blocks() {
        // 2 x 4: blocks [[1,2],[3,4]] and [[5,6],[7,8]]
        let a = WeightTensor::matrix(2, 4, vec![1.0, 2.0, 5.0, 6.0, 3.0, 4.0, 7.0, 8.0]).unwrap();
        let (diag, residual) = extract_diagonal(&a).unwrap();
        assert_eq!(diag, vec![1.0, 4.0, 5.0, 8.0]);
        assert_eq!(residual.data(), &[0.0, 2.0, 0.0, 6.0, 3.0, 0.0, 7.0, 0.0]);
        assert_eq!(scatter_diagonal(&diag, &residual).unwrap(), a);
    }

    #[test]
    fn test_square_matrix() {
        let a = WeightTensor::from_fn(3, 3, |r, c| (r * 3 + c) as f32 + 0.5);
        let (diag, residual) = extract_diagonal(&a).unwrap();
        assert_eq!(diag, vec![0.5, 4.5, 8.5]);
        assert_eq!(scatter_diagonal(&diag, &residual).unwrap(), a);
    }

    #[test]
    fn test_rejects_non_multiple() {
        let a = WeightTensor::zeros(vec![3, 7]);
        assert!(matches!(extract_diagonal(&a), Err(Error::Shape { .. })));
        let v = WeightTensor::vector(vec![1.0; 3]);
        assert!(extract_diagonal(&v).is_err());
    }

    #[test]
    fn test_scatter_length_mismatch() {
        let r = WeightTensor::zeros(vec![2, 4]);
        assert!(scatter_diagonal(&[1.0; 3], &r).is_err());
    }
}
