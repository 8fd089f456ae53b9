//! Key-gradient accumulation: `dK += (scale · dS)ᵀ · Q`.

use super::accumulate::{begin, end, ChunkTarget};
use super::plan::KernelPlan;
use super::schedule::TileStep;
use super::tiles::{store_block, Block};
use super::workspace::{Accumulator, Workspace};
use crate::config::AccumMode;
use crate::dtype::Element;
use crate::ops::traits::{MatRef, MmaEngine};

/// Accumulate one tile into the key gradient of `step.key`.
///
/// `score_grad_t` is a `block_j x block_i` view of the scaled score gradient.
#[allow(clippy::too_many_arguments)]
pub(super) fn accumulate<T: Element, E: MmaEngine>(
    engine: &E,
    plan: &KernelPlan,
    step: &TileStep,
    score_grad_t: MatRef<'_>,
    query: &[f32],
    resident: &mut [f32],
    frag: &mut [f32],
    ws: &mut Workspace<'_>,
    staged: &mut [T],
) {
    let (bi, bj, k) = (plan.block_i, plan.block_j, plan.max_k);
    let d = plan.head_dim;
    let rows = Block {
        row0: step.key.start,
        rows: step.key.len,
        col0: 0,
        cols: d,
        stride: d,
    };

    match plan.key_value_mode {
        AccumMode::InRegister => {
            if step.first_query {
                resident.fill(0.0);
            }
            let queries = MatRef::new(query, bi, d, k).with_valid(step.query_len, d);
            engine.mma(score_grad_t, queries, resident, k);
            if step.last_query {
                store_block(resident, k, &rows, staged);
            }
        }
        mode => {
            for c in 0..d.div_ceil(plan.kv_chunk) {
                let c0 = c * plan.kv_chunk;
                let cw = plan.kv_chunk.min(d - c0);
                let frag = &mut frag[..bj * cw];
                let mut target = ChunkTarget {
                    slot: ws.slot(Accumulator::Key, step.key.index, c),
                    staged: &mut *staged,
                    block: Block {
                        col0: c0,
                        cols: cw,
                        ..rows
                    },
                };
                begin(mode, step.first_query, frag, bj, &target);
                let queries = MatRef::new(&query[c0..], bi, cw, k).with_valid(step.query_len, cw);
                engine.mma(score_grad_t, queries, frag, cw);
                end(mode, step.last_query, frag, &mut target);
            }
        }
    }
}
