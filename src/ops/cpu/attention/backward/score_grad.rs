//! Score-gradient correction and bias-gradient epilogue.
//!
//! `dS[q, k] = P[k, q] · (dP[q, k] · Z[k, q] − Δ[q])` where `dP = dO · Vᵀ`.
//! The unscaled `dS` feeds the bias gradients; what is stored for the query
//! and key gradients is `scale · dS`.

use super::plan::KernelPlan;
use super::schedule::TileStep;
use crate::dtype::Element;
use crate::ops::traits::{BiasLayout, HeadView};

/// One instance's reduced bias-gradient plane.
///
/// Axes the layout broadcasts have extent 1, so the plane holds the sum over
/// them.
#[derive(Debug)]
pub(super) struct BiasGradStage {
    pub data: Vec<f32>,
    pub layout: BiasLayout,
    pub q_ext: usize,
    pub k_ext: usize,
}

impl BiasGradStage {
    pub fn new(layout: BiasLayout, max_q: usize, max_k: usize) -> Self {
        let (q_ext, k_ext) = layout.grad_extent(max_q, max_k);
        Self {
            data: vec![0.0; q_ext * k_ext],
            layout,
            q_ext,
            k_ext,
        }
    }

    /// Clear for an instance with the given sequence lengths.
    pub fn reset(&mut self, seq_q: usize, seq_k: usize) {
        let (q_ext, k_ext) = self.layout.grad_extent(seq_q, seq_k);
        self.q_ext = q_ext;
        self.k_ext = k_ext;
        self.data[..q_ext * k_ext].fill(0.0);
    }

    #[inline]
    fn add(&mut self, q: usize, k: usize, v: f32) {
        let qa = if self.layout.query == 0 { 0 } else { q };
        let ka = if self.layout.key == 0 { 0 } else { k };
        self.data[qa * self.k_ext + ka] += v;
    }
}

/// Destinations of the score-gradient stage.
pub(super) struct ScoreGradOut<'a> {
    /// Key-major weight tile; overwritten with `scale · dS` in key-major layout.
    pub probs: &'a mut [f32],
    /// `block_i x block_j` query-major buffer, present in query-major layout.
    pub query_major: Option<&'a mut [f32]>,
    pub bias_a: Option<&'a mut BiasGradStage>,
    pub bias_b: Option<&'a mut BiasGradStage>,
}

pub(super) fn compute<T: Element>(
    plan: &KernelPlan,
    view: &HeadView<'_, T>,
    step: &TileStep,
    delta: &[f32],
    dp: &[f32],
    drop: Option<&[f32]>,
    out: ScoreGradOut<'_>,
) {
    let (bi, bj) = (plan.block_i, plan.block_j);
    let ScoreGradOut {
        probs,
        mut query_major,
        mut bias_a,
        mut bias_b,
    } = out;

    for kr in 0..bj {
        let key_pos = step.key.start + kr;
        for qc in 0..bi {
            let idx = kr * bi + qc;
            let q = step.query_start + qc;
            let valid = kr < step.key.len && qc < step.query_len && view.mask.allows(q, key_pos);

            let ds = if valid {
                let z = drop.map_or(1.0, |m| m[idx]);
                probs[idx] * (dp[qc * bj + kr] * z - delta[q])
            } else {
                0.0
            };

            if valid {
                if let Some(stage) = bias_a.as_deref_mut() {
                    stage.add(q, key_pos, ds);
                }
                if let Some(stage) = bias_b.as_deref_mut() {
                    stage.add(q, key_pos, ds);
                }
            }

            let scaled = ds * view.scale;
            match query_major.as_deref_mut() {
                Some(buf) => buf[qc * bj + kr] = scaled,
                None => probs[idx] = scaled,
            }
        }
    }
}
