//! Tile staging between strided storage and f32 arena/register tiles.

use crate::dtype::Element;
use crate::tensor::Rows;

/// Stage rows `start..start + len` of `src` into a `tile_rows x ld` tile,
/// widening to f32. Rows past `len` and columns past the row width are zero.
pub(super) fn load_tile<T: Element>(
    src: &Rows<'_, T>,
    start: usize,
    len: usize,
    tile: &mut [f32],
    tile_rows: usize,
    ld: usize,
) {
    let width = src.width();
    for (r, dst) in tile[..tile_rows * ld].chunks_exact_mut(ld).enumerate() {
        if r < len {
            for (d, s) in dst[..width].iter_mut().zip(src.row(start + r)) {
                *d = s.to_f32();
            }
            dst[width..].fill(0.0);
        } else {
            dst.fill(0.0);
        }
    }
}

/// Rectangle of an instance's dense gradient rows.
#[derive(Debug, Clone, Copy)]
pub(super) struct Block {
    /// First sequence row.
    pub row0: usize,
    /// Valid rows.
    pub rows: usize,
    pub col0: usize,
    pub cols: usize,
    /// Row stride of the destination, i.e. its feature width.
    pub stride: usize,
}

/// Read a block into the leading `frag_rows x cols` of a fragment with
/// leading dimension `ld`; rows past the valid count read as zero.
pub(super) fn load_block<T: Element>(
    src: &[T],
    b: &Block,
    frag: &mut [f32],
    ld: usize,
    frag_rows: usize,
) {
    for r in 0..frag_rows {
        let dst = &mut frag[r * ld..r * ld + b.cols];
        if r < b.rows {
            let start = (b.row0 + r) * b.stride + b.col0;
            for (d, s) in dst.iter_mut().zip(&src[start..start + b.cols]) {
                *d = s.to_f32();
            }
        } else {
            dst.fill(0.0);
        }
    }
}

/// Write the valid rows of a fragment into a block, narrowing to storage.
pub(super) fn store_block<T: Element>(frag: &[f32], ld: usize, b: &Block, dst: &mut [T]) {
    for r in 0..b.rows {
        let start = (b.row0 + r) * b.stride + b.col0;
        let src = &frag[r * ld..r * ld + b.cols];
        for (d, &s) in dst[start..start + b.cols].iter_mut().zip(src) {
            *d = T::from_f32(s);
        }
    }
}
