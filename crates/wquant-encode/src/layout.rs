//! Dense 8x4 tile layout for quantized matrices.
//!
//! The runtime's int8 kernels read a dense matrix in the same per-tile order
//! the sparse encoder writes: column tile, then row tile, then the tile
//! column-major. No tile is dropped.

use wquant_core::{Error, Result};

use crate::sparse::{TILE_COLS, TILE_ROWS};

/// Reorder a row-major `rows x cols` matrix into 8x4 tile order.
pub fn tile_8x4<T: Copy>(values: &[T], rows: usize, cols: usize) -> Result<Vec<T>> {
    if values.len() != rows * cols || rows % TILE_ROWS != 0 || cols % TILE_COLS != 0 {
        return Err(Error::shape(
            "tile_8x4",
            format!("rows multiple of {TILE_ROWS}, columns multiple of {TILE_COLS}, {} values", rows * cols),
            &[rows, cols, values.len()],
        ));
    }

    let mut out = Vec::with_capacity(values.len());
    for col_tile in 0..cols / TILE_COLS {
        for row_tile in 0..rows / TILE_ROWS {
            for c in 0..TILE_COLS {
                for r in 0..TILE_ROWS {
                    out.push(values[(row_tile * TILE_ROWS + r) * cols + col_tile * TILE_COLS + c]);
                }
            }
        }
    }
    Ok(out)
}
