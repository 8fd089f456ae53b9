//! Per-instance driver: walks the tile schedule and runs the six phases of
//! every tile through the arena.

use tracing::trace;

use super::arena::{Phase, Region};
use super::delta;
use super::grad_key;
use super::grad_query;
use super::grad_value;
use super::instance::{InstanceState, Prefetched};
use super::plan::KernelPlan;
use super::schedule::{KeyTile, TileScheduler, TileStep, Visit};
use super::score_grad::{self, ScoreGradOut};
use super::scores;
use super::tiles::load_tile;
use super::workspace::Workspace;
use crate::config::ScoreGradLayout;
use crate::dtype::Element;
use crate::error::Result;
use crate::ops::traits::{BackwardInputs, HeadView, MatRef, MmaEngine, SavedRows};
use crate::tensor::HeadCoord;

/// Compute every gradient of one (batch, head) instance into `state`.
pub(super) fn run_instance<T: Element, E: MmaEngine>(
    plan: &KernelPlan,
    engine: &E,
    inputs: &BackwardInputs<'_, T>,
    coord: HeadCoord,
    state: &mut InstanceState<T>,
    workspace: &mut [f32],
) -> Result<()> {
    let view = inputs.problem.advance(coord)?;
    let saved = inputs.saved(coord);
    let (lq, lk) = (view.seq_q, view.seq_k);

    state.seq = (lq, lk);
    state.arena.reset();
    state.prefetched = Prefetched::default();
    for stage in state.bias_a.iter_mut().chain(state.bias_b.iter_mut()) {
        stage.reset(lq, lk);
    }
    delta::compute(&saved, lq, &mut state.delta);

    let visits = TileScheduler::new(plan.block_i, plan.block_j, lq, lk, view.mask).visits();
    trace!(
        batch = coord.batch,
        head = coord.head,
        seq_q = lq,
        seq_k = lk,
        visits = visits.len(),
        "backward instance"
    );

    let mut ws = Workspace::new(workspace, &plan.workspace);
    for (n, visit) in visits.iter().enumerate() {
        match *visit {
            Visit::ZeroFill(key) => zero_fill(plan, key, state),
            Visit::Tile(step) => {
                let next = visits[n + 1..].iter().find_map(|v| match v {
                    Visit::Tile(t) => Some(*t),
                    Visit::ZeroFill(_) => None,
                });
                run_tile(plan, engine, &view, &saved, &step, next, state, &mut ws);
            }
        }
    }
    Ok(())
}

/// No query attends to `key`: its gradient rows are zero.
fn zero_fill<T: Element>(plan: &KernelPlan, key: KeyTile, state: &mut InstanceState<T>) {
    trace!(key_start = key.start, key_len = key.len, "key tile zeroed");
    let zero = T::from_f32(0.0);
    let (d, dv) = (plan.head_dim, plan.value_dim);
    let rows = key.start..key.start + key.len;
    state.grad_k[rows.start * d..rows.end * d].fill(zero);
    state.grad_v[rows.start * dv..rows.end * dv].fill(zero);
}

#[allow(clippy::too_many_arguments)]
fn run_tile<T: Element, E: MmaEngine>(
    plan: &KernelPlan,
    engine: &E,
    view: &HeadView<'_, T>,
    saved: &SavedRows<'_, T>,
    step: &TileStep,
    next: Option<TileStep>,
    state: &mut InstanceState<T>,
    ws: &mut Workspace<'_>,
) {
    let (bi, bj, k) = (plan.block_i, plan.block_j, plan.max_k);
    let dv = plan.value_dim;
    let prefetched = state.prefetched;

    // Stage K/V once per key tile, Q every tile, then recompute the weights.
    {
        let mut v = state.arena.enter(Phase::Scores);
        let key = v.take(Region::Key);
        let value = v.take(Region::Value);
        let query = v.take(Region::Query);
        let probs = v.take(Region::Probs);

        if step.first_query {
            if prefetched.key_value {
                key.copy_from_slice(v.take(Region::NextKey));
                value.copy_from_slice(v.take(Region::NextValue));
            } else {
                load_tile(&view.key, step.key.start, step.key.len, key, bj, k);
                load_tile(&view.value, step.key.start, step.key.len, value, bj, k);
            }
        }
        if prefetched.query {
            query.copy_from_slice(v.take(Region::NextQuery));
        } else {
            load_tile(&view.query, step.query_start, step.query_len, query, bi, k);
        }

        scores::compute(engine, plan, view, saved.lse, step, key, query, probs);
    }

    {
        let mut v = state.arena.enter(Phase::ValueGrad);
        let probs = v.take(Region::Probs);
        let out_grad = v.take(Region::OutGrad);
        if prefetched.output_grad {
            out_grad.copy_from_slice(v.take(Region::NextOutGrad));
        } else {
            load_tile(
                &saved.grad_output,
                step.query_start,
                step.query_len,
                out_grad,
                bi,
                k,
            );
        }

        let drop = match &view.dropout {
            Some(mask) if plan.dropout => {
                let buf = v.take(Region::DropMask);
                for (kr, row) in buf.chunks_exact_mut(bi).enumerate() {
                    for (qc, z) in row.iter_mut().enumerate() {
                        *z = if kr < step.key.len && qc < step.query_len {
                            mask.factor(step.query_start + qc, step.key.start + kr)
                        } else {
                            0.0
                        };
                    }
                }
                let buf: &[f32] = buf;
                Some(buf)
            }
            _ => None,
        };

        grad_value::accumulate(
            engine,
            plan,
            step,
            probs,
            drop,
            out_grad,
            &mut state.regs.value_res,
            &mut state.regs.kv_frag,
            ws,
            &mut state.grad_v,
        );
    }

    {
        let mut v = state.arena.enter(Phase::ScoreProduct);
        let out_grad = v.take(Region::OutGrad);
        let value = v.take(Region::Value);
        let dp = &mut state.regs.dp;
        dp.fill(0.0);
        engine.mma(
            MatRef::new(out_grad, bi, dv, k).with_valid(step.query_len, dv),
            MatRef::new(value, bj, dv, k)
                .with_valid(step.key.len, dv)
                .t(),
            dp,
            bj,
        );
    }

    {
        let mut v = state.arena.enter(Phase::ScoreGrad);
        let probs = v.take(Region::Probs);
        let drop = (plan.dropout && view.dropout.is_some()).then(|| v.take(Region::DropMask));
        let query_major =
            (plan.layout == ScoreGradLayout::QueryMajor).then(|| v.take(Region::ScoreGradQ));
        score_grad::compute(
            plan,
            view,
            step,
            &state.delta,
            &state.regs.dp,
            drop.as_deref(),
            ScoreGradOut {
                probs,
                query_major,
                bias_a: state.bias_a.as_mut(),
                bias_b: state.bias_b.as_mut(),
            },
        );
    }

    {
        let mut v = state.arena.enter(Phase::QueryGrad);
        let key = v.take(Region::Key);
        let score_grad = match plan.layout {
            ScoreGradLayout::KeyMajor => MatRef::new(v.take(Region::Probs), bj, bi, bi).t(),
            ScoreGradLayout::QueryMajor => MatRef::new(v.take(Region::ScoreGradQ), bi, bj, bj),
        };
        grad_query::accumulate(
            engine,
            plan,
            step,
            score_grad,
            key,
            &mut state.regs.q_frag,
            ws,
            &mut state.grad_q,
        );
    }

    {
        let mut v = state.arena.enter(Phase::KeyGrad);
        let query = v.take(Region::Query);
        let score_grad_t = match plan.layout {
            ScoreGradLayout::KeyMajor => MatRef::new(v.take(Region::Probs), bj, bi, bi),
            ScoreGradLayout::QueryMajor => MatRef::new(v.take(Region::ScoreGradQ), bi, bj, bj).t(),
        };
        grad_key::accumulate(
            engine,
            plan,
            step,
            score_grad_t,
            query,
            &mut state.regs.key_res,
            &mut state.regs.kv_frag,
            ws,
            &mut state.grad_k,
        );

        // Prologue of the next iteration, overlapped with this epilogue.
        let mut fetched = Prefetched::default();
        if let Some(n) = next {
            let prologue = plan.prologue;
            if prologue.query {
                let buf = v.take(Region::NextQuery);
                load_tile(&view.query, n.query_start, n.query_len, buf, bi, k);
                fetched.query = true;
            }
            if prologue.output_grad {
                let buf = v.take(Region::NextOutGrad);
                load_tile(&saved.grad_output, n.query_start, n.query_len, buf, bi, k);
                fetched.output_grad = true;
            }
            if prologue.key_value && n.first_query {
                let (kb, vb) = (v.take(Region::NextKey), v.take(Region::NextValue));
                load_tile(&view.key, n.key.start, n.key.len, kb, bj, k);
                load_tile(&view.value, n.key.start, n.key.len, vb, bj, k);
                fetched.key_value = true;
            }
        }
        state.prefetched = fetched;
    }
}
