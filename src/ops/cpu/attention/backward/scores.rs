//! Attention-weight recomputation for one tile.

use super::plan::KernelPlan;
use super::schedule::TileStep;
use crate::dtype::Element;
use crate::ops::traits::{HeadView, MatRef, MmaEngine};

/// `probs[k, q] = exp(scale · K·Qᵀ + bias − lse[q])`, `block_j x block_i`,
/// key-major.
///
/// Elements outside the valid tile or masked by the policy are exactly zero,
/// so later stages may treat the tile as dense.
#[allow(clippy::too_many_arguments)]
pub(super) fn compute<T: Element, E: MmaEngine>(
    engine: &E,
    plan: &KernelPlan,
    view: &HeadView<'_, T>,
    lse: &[f32],
    step: &TileStep,
    key: &[f32],
    query: &[f32],
    probs: &mut [f32],
) {
    let (bi, bj, k) = (plan.block_i, plan.block_j, plan.max_k);
    let d = plan.head_dim;

    probs.fill(0.0);
    engine.mma(
        MatRef::new(key, bj, d, k).with_valid(step.key.len, d),
        MatRef::new(query, bi, d, k)
            .with_valid(step.query_len, d)
            .t(),
        probs,
        bi,
    );

    for (kr, row) in probs.chunks_exact_mut(bi).enumerate() {
        let key_pos = step.key.start + kr;
        for (qc, p) in row.iter_mut().enumerate() {
            let q = step.query_start + qc;
            *p = if kr < step.key.len && qc < step.query_len && view.mask.allows(q, key_pos) {
                (view.scale * *p + view.bias(q, key_pos) - lse[q]).exp()
            } else {
                0.0
            };
        }
    }
}
