//! Tile multiply-accumulate seam.
//!
//! The backward kernel decides which products happen and in what order; how a
//! single `acc += A · B` is executed belongs to an [`MmaEngine`].

/// Read-only view of an `f32` tile operand.
///
/// A view carries its own strides, so a transposed operand is the same buffer
/// read through [`MatRef::t`]. Reads outside `valid_rows × valid_cols` yield
/// zero, which is how ragged tiles are padded without touching memory. An
/// optional mask with the same indexing multiplies every element on read.
#[derive(Debug, Clone, Copy)]
pub struct MatRef<'a> {
    data: &'a [f32],
    mask: Option<&'a [f32]>,
    rows: usize,
    cols: usize,
    valid_rows: usize,
    valid_cols: usize,
    row_stride: usize,
    col_stride: usize,
}

impl<'a> MatRef<'a> {
    /// Row-major `rows × cols` view with leading dimension `ld`.
    pub fn new(data: &'a [f32], rows: usize, cols: usize, ld: usize) -> Self {
        Self {
            data,
            mask: None,
            rows,
            cols,
            valid_rows: rows,
            valid_cols: cols,
            row_stride: ld,
            col_stride: 1,
        }
    }

    /// Restrict reads to the leading `rows × cols` block; the rest reads as zero.
    pub fn with_valid(mut self, rows: usize, cols: usize) -> Self {
        self.valid_rows = rows.min(self.rows);
        self.valid_cols = cols.min(self.cols);
        self
    }

    /// Multiply every element by `mask` at the same index on read.
    pub fn with_mask(mut self, mask: &'a [f32]) -> Self {
        self.mask = Some(mask);
        self
    }

    /// Transposed view of the same storage.
    pub fn t(self) -> Self {
        Self {
            data: self.data,
            mask: self.mask,
            rows: self.cols,
            cols: self.rows,
            valid_rows: self.valid_cols,
            valid_cols: self.valid_rows,
            row_stride: self.col_stride,
            col_stride: self.row_stride,
        }
    }

    #[inline]
    pub fn rows(&self) -> usize {
        self.rows
    }

    #[inline]
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Element `(i, j)`, zero outside the valid block.
    #[inline]
    pub fn get(&self, i: usize, j: usize) -> f32 {
        if i >= self.valid_rows || j >= self.valid_cols {
            return 0.0;
        }
        let idx = i * self.row_stride + j * self.col_stride;
        match self.mask {
            Some(m) => self.data[idx] * m[idx],
            None => self.data[idx],
        }
    }

    /// Contiguous slice of row `i` when the view is unmasked, row-major and
    /// the row is fully valid.
    #[inline]
    pub fn dense_row(&self, i: usize) -> Option<&'a [f32]> {
        if self.mask.is_some()
            || self.col_stride != 1
            || i >= self.valid_rows
            || self.valid_cols != self.cols
        {
            return None;
        }
        let start = i * self.row_stride;
        Some(&self.data[start..start + self.cols])
    }
}

/// Tile multiply-accumulate engine.
///
/// Implementations must be deterministic: the same operands always produce
/// bit-identical accumulators.
pub trait MmaEngine: Send + Sync {
    /// `acc[i * ld + j] += Σ_p a[i, p] · b[p, j]` for every `i < a.rows()`
    /// and `j < b.cols()`. `a.cols()` must equal `b.rows()`.
    fn mma(&self, a: MatRef<'_>, b: MatRef<'_>, acc: &mut [f32], ld: usize);
}
