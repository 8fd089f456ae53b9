//! Value-gradient accumulation: `dV += (P ⊙ Z)ᵀ · dO`.

use super::accumulate::{begin, end, ChunkTarget};
use super::plan::KernelPlan;
use super::schedule::TileStep;
use super::tiles::{store_block, Block};
use super::workspace::{Accumulator, Workspace};
use crate::config::AccumMode;
use crate::dtype::Element;
use crate::ops::traits::{MatRef, MmaEngine};

/// Accumulate one tile into the value gradient of `step.key`.
///
/// `probs` is the key-major weight tile; `drop`, when present, holds the
/// dropout factors with the same indexing and is applied on read.
#[allow(clippy::too_many_arguments)]
pub(super) fn accumulate<T: Element, E: MmaEngine>(
    engine: &E,
    plan: &KernelPlan,
    step: &TileStep,
    probs: &[f32],
    drop: Option<&[f32]>,
    out_grad: &[f32],
    resident: &mut [f32],
    frag: &mut [f32],
    ws: &mut Workspace<'_>,
    staged: &mut [T],
) {
    let (bi, bj, k) = (plan.block_i, plan.block_j, plan.max_k);
    let dv = plan.value_dim;
    let mut weights = MatRef::new(probs, bj, bi, bi);
    if let Some(z) = drop {
        weights = weights.with_mask(z);
    }
    let rows = Block {
        row0: step.key.start,
        rows: step.key.len,
        col0: 0,
        cols: dv,
        stride: dv,
    };

    match plan.key_value_mode {
        AccumMode::InRegister => {
            if step.first_query {
                resident.fill(0.0);
            }
            let dout = MatRef::new(out_grad, bi, dv, k).with_valid(step.query_len, dv);
            engine.mma(weights, dout, resident, k);
            if step.last_query {
                store_block(resident, k, &rows, staged);
            }
        }
        mode => {
            for c in 0..dv.div_ceil(plan.kv_chunk) {
                let c0 = c * plan.kv_chunk;
                let cw = plan.kv_chunk.min(dv - c0);
                let frag = &mut frag[..bj * cw];
                let mut target = ChunkTarget {
                    slot: ws.slot(Accumulator::Value, step.key.index, c),
                    staged: &mut *staged,
                    block: Block {
                        col0: c0,
                        cols: cw,
                        ..rows
                    },
                };
                begin(mode, step.first_query, frag, bj, &target);
                let dout = MatRef::new(&out_grad[c0..], bi, cw, k).with_valid(step.query_len, cw);
                engine.mma(weights, dout, frag, cw);
                end(mode, step.last_query, frag, &mut target);
            }
        }
    }
}
