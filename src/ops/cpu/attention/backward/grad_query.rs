//! Query-gradient accumulation: `dQ += (scale · dS) · K`.

use super::accumulate::{begin, end, ChunkTarget};
use super::plan::KernelPlan;
use super::schedule::TileStep;
use super::tiles::Block;
use super::workspace::{Accumulator, Workspace};
use crate::dtype::Element;
use crate::ops::traits::{MatRef, MmaEngine};

/// Accumulate one tile into the query gradient of `step`'s query tile.
///
/// `score_grad` is a `block_i x block_j` view of the scaled score gradient.
/// The accumulator is initialized on the first key tile visiting the query
/// tile and flushed to the output rows on the last.
#[allow(clippy::too_many_arguments)]
pub(super) fn accumulate<T: Element, E: MmaEngine>(
    engine: &E,
    plan: &KernelPlan,
    step: &TileStep,
    score_grad: MatRef<'_>,
    key: &[f32],
    frag: &mut [f32],
    ws: &mut Workspace<'_>,
    staged: &mut [T],
) {
    let (bi, bj, k) = (plan.block_i, plan.block_j, plan.max_k);
    let d = plan.head_dim;
    let mode = plan.query_mode;

    for c in 0..d.div_ceil(plan.q_chunk) {
        let c0 = c * plan.q_chunk;
        let cw = plan.q_chunk.min(d - c0);
        let frag = &mut frag[..bi * cw];
        let mut target = ChunkTarget {
            slot: ws.slot(Accumulator::Query, step.query_index, c),
            staged: &mut *staged,
            block: Block {
                row0: step.query_start,
                rows: step.query_len,
                col0: c0,
                cols: cw,
                stride: d,
            },
        };
        begin(mode, step.first_key, frag, bi, &target);
        let keys = MatRef::new(&key[c0..], bj, cw, k).with_valid(step.key.len, cw);
        engine.mma(score_grad, keys, frag, cw);
        end(mode, step.last_key, frag, &mut target);
    }
}
