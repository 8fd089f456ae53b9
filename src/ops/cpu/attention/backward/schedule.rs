//! Tile scheduler.
//!
//! Outer loop over key tiles, inner loop over query tiles starting at the
//! key tile's query start. Ragged edge tiles carry their valid extent.

use crate::ops::traits::MaskPolicy;

/// A key tile and the first query row that can attend to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyTile {
    pub index: usize,
    pub start: usize,
    pub len: usize,
    pub query_start: usize,
}

/// One (key tile, query tile) iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileStep {
    pub key: KeyTile,
    pub query_index: usize,
    pub query_start: usize,
    pub query_len: usize,
    /// First query tile of this key tile: initialize key/value accumulators.
    pub first_query: bool,
    /// Last query tile of this key tile: flush key/value accumulators.
    pub last_query: bool,
    /// First key tile visiting this query tile: initialize the query accumulator.
    pub first_key: bool,
    /// Last key tile visiting this query tile: flush the query accumulator.
    pub last_key: bool,
}

/// Unit of scheduled work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visit {
    /// Key tile no query attends to; its gradient rows are zero-filled.
    ZeroFill(KeyTile),
    Tile(TileStep),
}

#[derive(Debug, Clone, Copy)]
pub struct TileScheduler {
    block_i: usize,
    block_j: usize,
    seq_q: usize,
    seq_k: usize,
    mask: MaskPolicy,
}

impl TileScheduler {
    pub fn new(
        block_i: usize,
        block_j: usize,
        seq_q: usize,
        seq_k: usize,
        mask: MaskPolicy,
    ) -> Self {
        Self {
            block_i,
            block_j,
            seq_q,
            seq_k,
            mask,
        }
    }

    /// First query row, rounded down to a query tile, that may attend to a
    /// key tile starting at `key_start`.
    pub fn query_start(&self, key_start: usize) -> usize {
        match self.mask {
            MaskPolicy::None => 0,
            MaskPolicy::Causal => key_start / self.block_i * self.block_i,
        }
    }

    fn key_tile(&self, index: usize) -> Option<KeyTile> {
        let start = index * self.block_j;
        (start < self.seq_k).then(|| KeyTile {
            index,
            start,
            len: self.block_j.min(self.seq_k - start),
            query_start: self.query_start(start),
        })
    }

    pub fn key_tiles(&self) -> impl Iterator<Item = KeyTile> + '_ {
        (0..self.seq_k.div_ceil(self.block_j)).filter_map(move |i| self.key_tile(i))
    }

    /// Whether a later key tile still visits the query tile at `query_start`.
    fn visited_later(&self, key: &KeyTile, query_start: usize) -> bool {
        match self.key_tile(key.index + 1) {
            Some(next) => next.query_start <= query_start && next.query_start < self.seq_q,
            None => false,
        }
    }

    /// Every visit in execution order.
    pub fn visits(&self) -> Vec<Visit> {
        let mut out = Vec::new();
        for key in self.key_tiles() {
            if key.query_start >= self.seq_q {
                out.push(Visit::ZeroFill(key));
                continue;
            }
            let mut q = key.query_start;
            while q < self.seq_q {
                let next = q + self.block_i;
                out.push(Visit::Tile(TileStep {
                    key,
                    query_index: q / self.block_i,
                    query_start: q,
                    query_len: self.block_i.min(self.seq_q - q),
                    first_query: q == key.query_start,
                    last_query: next >= self.seq_q,
                    first_key: key.start == 0,
                    last_key: !self.visited_later(&key, q),
                }));
                q = next;
            }
        }
        out
    }
}
