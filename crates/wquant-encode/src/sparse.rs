//! Block-sparse matrix encoding.
//!
//! The matrix (rows = inputs, columns = outputs) is cut into 4x8 tiles. Tiles
//! are visited column tile by column tile, and row tile by row tile inside
//! each column tile. Tiles whose absolute sum does not exceed
//! [`ZERO_TILE_EPSILON`] are dropped.
//!
//! ```text
//! index:  [n0, off, off, ..., n1, off, ..., n_last, off, ...]
//!          └─ column tile 0 ─┘ └─ column tile 1 ┘
//! values: tile after tile, each tile column-major (8 columns of 4 rows)
//! ```
//!
//! An empty column tile still writes its `0` count, so the index always holds
//! one group per 8 outputs.

use serde::{Deserialize, Serialize};
use tracing::debug;
use wquant_core::{Error, Result, Scale, WeightTensor};

use crate::quantize::quantize_value_clipped;

/// Rows (inputs) per tile.
pub const TILE_ROWS: usize = 4;

/// Columns (outputs) per tile.
pub const TILE_COLS: usize = 8;

/// Values per tile.
pub const TILE_SIZE: usize = TILE_ROWS * TILE_COLS;

/// Absolute-sum threshold at or below which a tile counts as empty.
pub const ZERO_TILE_EPSILON: f32 = 1e-10;

/// Index stream of a block-sparse matrix.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SparseIndex(Vec<i32>);

impl SparseIndex {
    pub fn as_slice(&self) -> &[i32] {
        &self.0
    }

    pub fn into_vec(self) -> Vec<i32> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Walk the stream like the runtime loader does.
    ///
    /// Checks that every count is non-negative and fits in the remaining
    /// stream, every offset is 4-aligned and in range of `nb_inputs`, and that
    /// there is exactly one group per 8 outputs. Returns the block count.
    pub fn validate(&self, nb_inputs: usize, nb_outputs: usize) -> Result<usize> {
        let mut groups = 0usize;
        let mut blocks = 0usize;
        for (_, offsets) in self.groups()? {
            for &offset in offsets {
                if offset < 0
                    || offset as usize % TILE_ROWS != 0
                    || offset as usize + TILE_ROWS > nb_inputs
                {
                    return Err(invalid_index(format!(
                        "offset {offset} outside {nb_inputs} inputs"
                    )));
                }
            }
            groups += 1;
            blocks += offsets.len();
        }
        if groups * TILE_COLS != nb_outputs {
            return Err(invalid_index(format!(
                "{groups} column tiles for {nb_outputs} outputs"
            )));
        }
        Ok(blocks)
    }

    /// Split the stream into (column tile, offsets) groups.
    pub fn groups(&self) -> Result<Vec<(usize, &[i32])>> {
        let mut out = Vec::new();
        let mut pos = 0usize;
        while pos < self.0.len() {
            let count = self.0[pos];
            pos += 1;
            if count < 0 || count as usize > self.0.len() - pos {
                return Err(invalid_index(format!("bad block count {count} at {}", pos - 1)));
            }
            let end = pos + count as usize;
            out.push((out.len(), &self.0[pos..end]));
            pos = end;
        }
        Ok(out)
    }
}

impl From<Vec<i32>> for SparseIndex {
    fn from(index: Vec<i32>) -> Self {
        Self(index)
    }
}

fn invalid_index(detail: String) -> Error {
    Error::shape("SparseIndex", detail, &[])
}

/// Result of [`encode_sparse`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SparseEncoding {
    pub index: SparseIndex,
    /// Retained tiles, each column-major.
    pub values: Vec<f32>,
    /// Same elements as `values`, clipped int8 at the caller's scale.
    pub quantized: Option<Vec<i8>>,
}

impl SparseEncoding {
    /// Number of retained tiles.
    pub fn block_count(&self) -> usize {
        self.values.len() / TILE_SIZE
    }

    /// Fraction of tiles kept.
    pub fn density(&self, rows: usize, cols: usize) -> f32 {
        let total = (rows / TILE_ROWS) * (cols / TILE_COLS);
        if total == 0 {
            0.0
        } else {
            self.block_count() as f32 / total as f32
        }
    }

    /// Rebuild the dense matrix from the index and float values.
    pub fn to_dense(&self, rows: usize, cols: usize) -> Result<WeightTensor> {
        let blocks = self.index.validate(rows, cols)?;
        if blocks * TILE_SIZE != self.values.len() {
            return Err(Error::shape(
                "SparseEncoding::to_dense",
                format!("{} values for {blocks} blocks", blocks * TILE_SIZE),
                &[self.values.len()],
            ));
        }

        let mut data = vec![0.0f32; rows * cols];
        let mut tiles = self.values.chunks_exact(TILE_SIZE);
        for (col_tile, offsets) in self.index.groups()? {
            for &offset in offsets {
                let tile = tiles.next().ok_or_else(|| {
                    Error::shape("SparseEncoding::to_dense", "one tile per offset", &[])
                })?;
                let (row0, col0) = (offset as usize, col_tile * TILE_COLS);
                for c in 0..TILE_COLS {
                    for r in 0..TILE_ROWS {
                        data[(row0 + r) * cols + col0 + c] = tile[c * TILE_ROWS + r];
                    }
                }
            }
        }
        WeightTensor::matrix(rows, cols, data)
    }
}

/// Check that `a` is a matrix that tiles exactly.
pub fn check_tiling(a: &WeightTensor, context: &'static str) -> Result<()> {
    a.expect_rank(2, context)?;
    if a.rows() % TILE_ROWS != 0 || a.cols() % TILE_COLS != 0 {
        return Err(Error::shape(
            context,
            format!("rows multiple of {TILE_ROWS}, columns multiple of {TILE_COLS}"),
            a.shape(),
        ));
    }
    Ok(())
}

/// Encode `a` as 4x8 block-sparse.
///
/// When `quantize` is set, the int8 stream is produced with the clipping
/// quantizer at `scale` (per output column for per-channel scales).
pub fn encode_sparse(a: &WeightTensor, scale: &Scale, quantize: bool) -> Result<SparseEncoding> {
    check_tiling(a, "encode_sparse")?;
    if quantize {
        scale.validate(a.cols())?;
    }
    let (rows, cols) = (a.rows(), a.cols());

    let mut index = Vec::new();
    let mut values = Vec::new();
    let mut quantized = quantize.then(Vec::new);

    for col_tile in 0..cols / TILE_COLS {
        let count_pos = index.len();
        index.push(0);
        let mut nonzero = 0;

        for row_tile in 0..rows / TILE_ROWS {
            let (row0, col0) = (row_tile * TILE_ROWS, col_tile * TILE_COLS);

            let mut abs_sum = 0.0f32;
            for r in row0..row0 + TILE_ROWS {
                for c in col0..col0 + TILE_COLS {
                    abs_sum += a.at(r, c).abs();
                }
            }
            if !(abs_sum > ZERO_TILE_EPSILON) {
                continue;
            }

            nonzero += 1;
            index.push(row0 as i32);
            for c in col0..col0 + TILE_COLS {
                for r in row0..row0 + TILE_ROWS {
                    let v = a.at(r, c);
                    values.push(v);
                    if let Some(q) = quantized.as_mut() {
                        q.push(quantize_value_clipped(v, scale.at(c)));
                    }
                }
            }
        }
        index[count_pos] = nonzero;
    }

    let encoding = SparseEncoding {
        index: SparseIndex(index),
        values,
        quantized,
    };
    debug!(
        rows,
        cols,
        blocks = encoding.block_count(),
        density = encoding.density(rows, cols),
        "encoded block-sparse matrix"
    );
    Ok(encoding)
}
