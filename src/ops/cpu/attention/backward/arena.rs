//! Phase-partitioned fast-memory arena.
//!
//! One `f32` buffer per instance holds every staged tile. Regions whose
//! lifetimes never overlap share storage:
//!
//! ```text
//! ┌───────────────── persistent ─────────────────┐┌─ probs ─┐┌── union ──┐┌─ drop ─┐
//! │ key │ value │ query │ next q/dO/k/v (prologue)││  J x I  ││ dO tile   ││ J x I  │
//! │                                              ││         ││ dS [q, k] ││        │
//! └──────────────────────────────────────────────┘└─────────┘└───────────┘└────────┘
//! ```
//!
//! The output-gradient tile is dead after the score product, so the
//! query-major score gradient reuses its bytes. In key-major layout the score
//! gradient overwrites the weight tile in place instead.
//!
//! Each [`Arena::enter`] bumps a generation counter and hands out a
//! [`PhaseView`] borrowing the arena, so slices from the previous phase are
//! unreachable once the next phase begins. Regions dead in a phase come back
//! empty.

use crate::config::ScoreGradLayout;

/// Named arena region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Region {
    /// `J x K` key tile, resident for one key tile.
    Key,
    /// `J x K` value tile, resident for one key tile.
    Value,
    /// `I x K` query tile.
    Query,
    /// `I x K` output-gradient tile.
    OutGrad,
    /// `J x I` attention weights, later the key-major score gradient.
    Probs,
    /// `J x I` dropout factors.
    DropMask,
    /// `I x J` query-major score gradient.
    ScoreGradQ,
    NextQuery,
    NextOutGrad,
    NextKey,
    NextValue,
}

const REGION_COUNT: usize = 11;

const ALL_REGIONS: [Region; REGION_COUNT] = [
    Region::Key,
    Region::Value,
    Region::Query,
    Region::OutGrad,
    Region::Probs,
    Region::DropMask,
    Region::ScoreGradQ,
    Region::NextQuery,
    Region::NextOutGrad,
    Region::NextKey,
    Region::NextValue,
];

/// Pipeline phase of one tile iteration, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Scores,
    ValueGrad,
    ScoreProduct,
    ScoreGrad,
    QueryGrad,
    KeyGrad,
}

impl Phase {
    fn next(self) -> Phase {
        match self {
            Phase::Scores => Phase::ValueGrad,
            Phase::ValueGrad => Phase::ScoreProduct,
            Phase::ScoreProduct => Phase::ScoreGrad,
            Phase::ScoreGrad => Phase::QueryGrad,
            Phase::QueryGrad => Phase::KeyGrad,
            Phase::KeyGrad => Phase::Scores,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Span {
    offset: usize,
    len: usize,
}

/// Inputs to [`ArenaLayout::new`].
#[derive(Debug, Clone, Copy)]
pub struct ArenaParams {
    pub block_i: usize,
    pub block_j: usize,
    pub max_k: usize,
    pub layout: ScoreGradLayout,
    pub dropout: bool,
    pub prefetch_query: bool,
    pub prefetch_output_grad: bool,
    pub prefetch_key_value: bool,
}

/// Static placement of every region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArenaLayout {
    spans: [Option<Span>; REGION_COUNT],
    layout: ScoreGradLayout,
    total: usize,
}

impl ArenaLayout {
    pub fn new(p: &ArenaParams) -> Self {
        let (i, j, k) = (p.block_i, p.block_j, p.max_k);
        let mut spans = [None; REGION_COUNT];
        let mut cursor = 0;
        let mut push = |r: Region, len: usize, present: bool| {
            if present {
                spans[r as usize] = Some(Span {
                    offset: cursor,
                    len,
                });
                cursor += len;
            }
        };

        push(Region::Key, j * k, true);
        push(Region::Value, j * k, true);
        push(Region::Query, i * k, true);
        push(Region::NextQuery, i * k, p.prefetch_query);
        push(Region::NextOutGrad, i * k, p.prefetch_output_grad);
        push(Region::NextKey, j * k, p.prefetch_key_value);
        push(Region::NextValue, j * k, p.prefetch_key_value);
        push(Region::Probs, j * i, true);
        push(Region::DropMask, j * i, p.dropout);

        let union_at = cursor;
        let query_major = p.layout == ScoreGradLayout::QueryMajor;
        let out_grad = i * k;
        let score_grad = if query_major { i * j } else { 0 };
        spans[Region::OutGrad as usize] = Some(Span {
            offset: union_at,
            len: out_grad,
        });
        if query_major {
            spans[Region::ScoreGradQ as usize] = Some(Span {
                offset: union_at,
                len: score_grad,
            });
        }

        Self {
            spans,
            layout: p.layout,
            total: union_at + out_grad.max(score_grad),
        }
    }

    /// Arena footprint in f32 elements.
    pub fn total(&self) -> usize {
        self.total
    }

    pub fn has(&self, r: Region) -> bool {
        self.spans[r as usize].is_some()
    }

    /// Whether `r` holds live data during `phase`.
    pub fn live(&self, r: Region, phase: Phase) -> bool {
        if !self.has(r) {
            return false;
        }
        use Phase::*;
        match r {
            Region::Key
            | Region::Value
            | Region::Query
            | Region::NextQuery
            | Region::NextOutGrad
            | Region::NextKey
            | Region::NextValue => true,
            Region::OutGrad => matches!(phase, ValueGrad | ScoreProduct),
            Region::DropMask => matches!(phase, ValueGrad | ScoreProduct | ScoreGrad),
            Region::Probs => match self.layout {
                ScoreGradLayout::KeyMajor => true,
                ScoreGradLayout::QueryMajor => !matches!(phase, QueryGrad | KeyGrad),
            },
            Region::ScoreGradQ => matches!(phase, ScoreGrad | QueryGrad | KeyGrad),
        }
    }

    fn overlaps(&self, a: Region, b: Region) -> bool {
        match (self.spans[a as usize], self.spans[b as usize]) {
            (Some(x), Some(y)) => {
                x.len > 0 && y.len > 0 && x.offset < y.offset + y.len && y.offset < x.offset + x.len
            }
            _ => false,
        }
    }
}

/// Per-instance arena.
#[derive(Debug)]
pub struct Arena {
    buf: Vec<f32>,
    layout: ArenaLayout,
    generation: u64,
    phase: Option<Phase>,
}

impl Arena {
    pub fn new(layout: ArenaLayout) -> Self {
        Self {
            buf: vec![0.0; layout.total()],
            layout,
            generation: 0,
            phase: None,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Start `phase` and borrow every region live in it.
    pub fn enter(&mut self, phase: Phase) -> PhaseView<'_> {
        debug_assert!(
            self.phase.map_or(true, |p| p.next() == phase),
            "illegal arena transition {:?} -> {phase:?}",
            self.phase
        );
        self.phase = Some(phase);
        self.generation += 1;

        let mut live: Vec<(Region, Span)> = ALL_REGIONS
            .iter()
            .filter(|&&r| self.layout.live(r, phase))
            .filter_map(|&r| self.layout.spans[r as usize].map(|s| (r, s)))
            .collect();
        live.sort_by_key(|(_, s)| s.offset);

        let mut slots: [&mut [f32]; REGION_COUNT] = Default::default();
        let mut rest: &mut [f32] = &mut self.buf;
        let mut cursor = 0;
        for (r, span) in live {
            let tail = std::mem::take(&mut rest);
            let (_, tail) = tail.split_at_mut(span.offset - cursor);
            let (region, tail) = tail.split_at_mut(span.len);
            slots[r as usize] = region;
            rest = tail;
            cursor = span.offset + span.len;
        }

        PhaseView {
            slots,
            phase,
            generation: self.generation,
        }
    }

    /// Forget the current phase; the next `enter` may start anywhere.
    pub fn reset(&mut self) {
        self.phase = None;
    }
}

/// Disjoint borrows of the regions live in one phase.
pub struct PhaseView<'a> {
    slots: [&'a mut [f32]; REGION_COUNT],
    phase: Phase,
    generation: u64,
}

impl<'a> PhaseView<'a> {
    /// Move region `r` out of the view. Dead or already-taken regions are empty.
    pub fn take(&mut self, r: Region) -> &'a mut [f32] {
        let s = std::mem::take(&mut self.slots[r as usize]);
        debug_assert!(
            !s.is_empty(),
            "{r:?} is not available in {:?} (generation {})",
            self.phase,
            self.generation
        );
        s
    }

    /// Like [`take`](Self::take) but allows the region to be absent.
    #[cfg(test)]
    fn take_opt(&mut self, r: Region) -> Option<&'a mut [f32]> {
        let s = std::mem::take(&mut self.slots[r as usize]);
        (!s.is_empty()).then_some(s)
    }
}
