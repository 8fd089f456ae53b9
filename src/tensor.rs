//! Borrowed strided views over caller-owned buffers.
//!
//! The kernel never owns tensor storage. Every operand is a flat slice plus
//! element strides for the batch, head and row axes; the feature axis is
//! always contiguous.

use crate::error::{Error, Result};

/// Element strides of a rank-4 `(batch, seq, head, feature)` tensor.
///
/// The feature stride is implicitly 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Strides {
    /// Distance between consecutive batch elements
    pub batch: usize,
    /// Distance between consecutive heads
    pub head: usize,
    /// Distance between consecutive sequence positions
    pub row: usize,
}

impl Strides {
    /// Contiguous `[batch, seq, head, feature]` layout.
    pub fn bshd(seq: usize, heads: usize, dim: usize) -> Self {
        Self {
            batch: seq * heads * dim,
            head: dim,
            row: heads * dim,
        }
    }

    /// Contiguous `[batch, head, seq, feature]` layout.
    pub fn bhsd(heads: usize, seq: usize, dim: usize) -> Self {
        Self {
            batch: heads * seq * dim,
            head: seq * dim,
            row: dim,
        }
    }

    /// Offset of feature 0 at sequence position `row` of instance `coord`.
    ///
    /// `packed` drops the batch term: variable-length rows are already
    /// absolute.
    #[inline]
    pub fn row_offset(&self, coord: HeadCoord, row: usize, packed: bool) -> usize {
        let batch = if packed { 0 } else { coord.batch * self.batch };
        batch + coord.head * self.head + row * self.row
    }
}

/// Logical problem dimensions.
///
/// With variable-length packing `seq_q`/`seq_k` are the maximum per-batch
/// lengths; they still size the workspace and key the dropout counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProblemShape {
    pub batch: usize,
    pub heads: usize,
    pub seq_q: usize,
    pub seq_k: usize,
    pub head_dim: usize,
    pub value_dim: usize,
}

impl ProblemShape {
    /// Shape with equal query/key lengths and equal head/value dims.
    pub fn new(batch: usize, heads: usize, seq: usize, head_dim: usize) -> Self {
        Self {
            batch,
            heads,
            seq_q: seq,
            seq_k: seq,
            head_dim,
            value_dim: head_dim,
        }
    }

    pub fn with_seq_k(mut self, seq_k: usize) -> Self {
        self.seq_k = seq_k;
        self
    }

    pub fn with_value_dim(mut self, value_dim: usize) -> Self {
        self.value_dim = value_dim;
        self
    }

    /// Number of independent (batch, head) instances.
    pub fn instances(&self) -> usize {
        self.batch * self.heads
    }
}

/// Read-only strided tensor.
#[derive(Debug, Clone, Copy)]
pub struct TensorRef<'a, T> {
    pub data: &'a [T],
    pub strides: Strides,
}

impl<'a, T> TensorRef<'a, T> {
    pub fn new(data: &'a [T], strides: Strides) -> Self {
        Self { data, strides }
    }
}

/// Mutable strided tensor.
#[derive(Debug)]
pub struct TensorMut<'a, T> {
    pub data: &'a mut [T],
    pub strides: Strides,
}

impl<'a, T> TensorMut<'a, T> {
    pub fn new(data: &'a mut [T], strides: Strides) -> Self {
        Self { data, strides }
    }
}

/// Per-row log-sum-exp saved by the forward pass, `[batch, head, seq_q]`.
///
/// Both strides must be multiples of [`LSE_ALIGNMENT`].
#[derive(Debug, Clone, Copy)]
pub struct LseRef<'a> {
    pub data: &'a [f32],
    pub batch_stride: usize,
    pub head_stride: usize,
}

/// Mutable log-sum-exp, written by the reference forward pass.
#[derive(Debug)]
pub struct LseMut<'a> {
    pub data: &'a mut [f32],
    pub batch_stride: usize,
    pub head_stride: usize,
}

/// Required alignment, in elements, of both log-sum-exp strides.
pub const LSE_ALIGNMENT: usize = 8;

/// Padded row length of a contiguous log-sum-exp buffer.
pub fn lse_row_len(seq_q: usize) -> usize {
    align_up(seq_q, LSE_ALIGNMENT)
}

impl<'a> LseRef<'a> {
    /// Contiguous `[batch, head, align_up(seq_q, 8)]` layout.
    pub fn contiguous(data: &'a [f32], heads: usize, seq_q: usize) -> Self {
        let row = lse_row_len(seq_q);
        Self {
            data,
            batch_stride: heads * row,
            head_stride: row,
        }
    }
}

impl<'a> LseMut<'a> {
    /// Contiguous `[batch, head, align_up(seq_q, 8)]` layout.
    pub fn contiguous(data: &'a mut [f32], heads: usize, seq_q: usize) -> Self {
        let row = lse_row_len(seq_q);
        Self {
            data,
            batch_stride: heads * row,
            head_stride: row,
        }
    }
}

/// Cumulative sequence offsets for packed variable-length batches.
///
/// Batch `b` owns rows `cu[b]..cu[b + 1]`; tensor batch strides are ignored.
#[derive(Debug, Clone, Copy)]
pub struct VarLen<'a> {
    pub cu_seqlens_q: &'a [i32],
    pub cu_seqlens_k: &'a [i32],
}

impl VarLen<'_> {
    /// Row offset and length of batch `b` along the query axis.
    pub fn query_span(&self, b: usize) -> (usize, usize) {
        span(self.cu_seqlens_q, b)
    }

    /// Row offset and length of batch `b` along the key axis.
    pub fn key_span(&self, b: usize) -> (usize, usize) {
        span(self.cu_seqlens_k, b)
    }

    /// Check that both offset arrays describe `batch` non-empty sequences
    /// no longer than the shape's maxima.
    pub fn validate(&self, shape: &ProblemShape) -> Result<()> {
        check_cu_seqlens("cu_seqlens_q", self.cu_seqlens_q, shape.batch, shape.seq_q)?;
        check_cu_seqlens("cu_seqlens_k", self.cu_seqlens_k, shape.batch, shape.seq_k)
    }
}

fn span(cu: &[i32], b: usize) -> (usize, usize) {
    let start = cu[b] as usize;
    let end = cu[b + 1] as usize;
    (start, end - start)
}

fn check_cu_seqlens(arg: &'static str, cu: &[i32], batch: usize, max_len: usize) -> Result<()> {
    if cu.len() != batch + 1 {
        return Err(Error::InvalidArgument {
            arg,
            reason: format!("expected {} offsets, got {}", batch + 1, cu.len()),
        });
    }
    if cu[0] != 0 {
        return Err(Error::InvalidArgument {
            arg,
            reason: format!("first offset must be 0, got {}", cu[0]),
        });
    }
    for (b, pair) in cu.windows(2).enumerate() {
        let len = i64::from(pair[1]) - i64::from(pair[0]);
        if len <= 0 || len as usize > max_len {
            return Err(Error::InvalidArgument {
                arg,
                reason: format!("sequence {b} has length {len}, expected 1..={max_len}"),
            });
        }
    }
    Ok(())
}

/// Coordinates of one kernel instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeadCoord {
    pub batch: usize,
    pub head: usize,
}

/// Row accessor for one (batch, head) slice of a strided tensor.
#[derive(Debug, Clone, Copy)]
pub struct Rows<'a, T> {
    data: &'a [T],
    base: usize,
    row_stride: usize,
    width: usize,
}

impl<'a, T> Rows<'a, T> {
    pub(crate) fn new(data: &'a [T], base: usize, row_stride: usize, width: usize) -> Self {
        Self {
            data,
            base,
            row_stride,
            width,
        }
    }

    /// Feature vector of sequence position `r`.
    #[inline]
    pub fn row(&self, r: usize) -> &'a [T] {
        let start = self.base + r * self.row_stride;
        &self.data[start..start + self.width]
    }

    pub fn width(&self) -> usize {
        self.width
    }
}

/// Round `x` up to a multiple of `to`.
#[inline]
pub const fn align_up(x: usize, to: usize) -> usize {
    x.div_ceil(to) * to
}

/// Number of elements a strided view addresses, i.e. one past its last index.
pub(crate) fn required_len(
    strides: &Strides,
    batch: usize,
    heads: usize,
    rows: usize,
    width: usize,
) -> usize {
    (batch - 1) * strides.batch + (heads - 1) * strides.head + (rows - 1) * strides.row + width
}
