//! Cross-tile spill workspace.
//!
//! Each (batch, head) instance owns one contiguous partition of
//! `stride` f32 elements. Inside it, every accumulator kept in memory gets a
//! plane sized to the padded tile grid:
//!
//! ```text
//! key   : align_up(Lk, block_j) x align_up(D,  block_i)
//! value : align_up(Lk, block_j) x align_up(Dv, block_i)
//! query : align_up(Lq, block_i) x align_up(D,  block_j)   (only when Lk > block_j)
//! stride = align_up(key + value + query, 4)
//! ```
//!
//! A plane is cut into slots of `tile_rows x chunk` elements addressed by
//! (tile index along the sequence, column chunk). Slots are written before
//! they are read, so the workspace needs no initialization.

use crate::config::AccumMode;
use crate::tensor::{align_up, ProblemShape};

/// Gradient accumulator kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accumulator {
    Key,
    Value,
    Query,
}

/// One accumulator's region within an instance partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Plane {
    offset: usize,
    tile_rows: usize,
    chunk: usize,
    chunks: usize,
    len: usize,
}

impl Plane {
    fn new(
        offset: usize,
        seq: usize,
        tile_rows: usize,
        dim: usize,
        chunk: usize,
        pad: usize,
    ) -> Self {
        Self {
            offset,
            tile_rows,
            chunk,
            chunks: dim.div_ceil(chunk),
            len: align_up(seq, tile_rows) * align_up(dim, pad),
        }
    }

    #[inline]
    fn slot_len(&self) -> usize {
        self.tile_rows * self.chunk
    }

    #[inline]
    fn slot_offset(&self, tile: usize, chunk: usize) -> usize {
        debug_assert!(chunk < self.chunks);
        self.offset + (tile * self.chunks + chunk) * self.slot_len()
    }
}

/// Workspace partitioning for one launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkspaceLayout {
    pub key: Option<Plane>,
    pub value: Option<Plane>,
    pub query: Option<Plane>,
    /// f32 elements per (batch, head) instance.
    pub stride: usize,
}

/// Inputs to [`WorkspaceLayout::new`], all resolved by the plan.
#[derive(Debug, Clone, Copy)]
pub struct WorkspaceParams {
    pub block_i: usize,
    pub block_j: usize,
    pub kv_chunk: usize,
    pub q_chunk: usize,
    pub key_value_mode: AccumMode,
    pub query_mode: AccumMode,
}

impl WorkspaceLayout {
    pub fn new(shape: &ProblemShape, p: &WorkspaceParams) -> Self {
        let mut cursor = 0;
        let mut place = |used: bool, make: &dyn Fn(usize) -> Plane| -> Option<Plane> {
            if !used {
                return None;
            }
            let plane = make(cursor);
            cursor += plane.len;
            Some(plane)
        };

        let kv_spill = p.key_value_mode == AccumMode::InMemory;
        let key = place(kv_spill, &|off| {
            Plane::new(
                off,
                shape.seq_k,
                p.block_j,
                shape.head_dim,
                p.kv_chunk,
                p.block_i,
            )
        });
        let value = place(kv_spill, &|off| {
            Plane::new(
                off,
                shape.seq_k,
                p.block_j,
                shape.value_dim,
                p.kv_chunk,
                p.block_i,
            )
        });
        let q_spill = p.query_mode == AccumMode::InMemory && shape.seq_k > p.block_j;
        let query = place(q_spill, &|off| {
            Plane::new(
                off,
                shape.seq_q,
                p.block_i,
                shape.head_dim,
                p.q_chunk,
                p.block_j,
            )
        });

        Self {
            key,
            value,
            query,
            stride: align_up(cursor, 4),
        }
    }

    /// Total f32 elements for every instance of `shape`.
    pub fn total(&self, shape: &ProblemShape) -> usize {
        shape.instances() * self.stride
    }
}

/// One instance's workspace partition.
pub struct Workspace<'a> {
    buf: &'a mut [f32],
    layout: &'a WorkspaceLayout,
}

impl<'a> Workspace<'a> {
    pub fn new(buf: &'a mut [f32], layout: &'a WorkspaceLayout) -> Self {
        debug_assert!(buf.len() >= layout.stride);
        Self { buf, layout }
    }

    /// Slot of `kind` for sequence tile `tile` and column chunk `chunk`.
    ///
    /// Accumulators without a plane get an empty slot; they never spill.
    pub fn slot(&mut self, kind: Accumulator, tile: usize, chunk: usize) -> &mut [f32] {
        let plane = match kind {
            Accumulator::Key => self.layout.key,
            Accumulator::Value => self.layout.value,
            Accumulator::Query => self.layout.query,
        };
        match plane {
            Some(p) => {
                let start = p.slot_offset(tile, chunk);
                &mut self.buf[start..start + p.slot_len()]
            }
            None => &mut [],
        }
    }
}
