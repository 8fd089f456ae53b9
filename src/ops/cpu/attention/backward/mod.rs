//! Fused, tiled attention backward on the CPU.
//!
//! ```text
//! for each (batch, head) instance                        rayon, in waves
//!   Δ = rowsum(O ⊙ dO)
//!   for each key tile j                                  outer
//!     for each query tile i ≥ query_start(j)             inner
//!       P   = exp(scale·K_j·Q_iᵀ + bias − lse)           Scores
//!       dV += (P ⊙ Z)ᵀ·dO_i                              ValueGrad
//!       dP  = dO_i·V_jᵀ                                  ScoreProduct
//!       dS  = P ⊙ (dP ⊙ Z − Δ),  dbias += dS             ScoreGrad
//!       dQ += scale·dS·K_j                               QueryGrad
//!       dK += scale·dSᵀ·Q_i                              KeyGrad
//! ```
//!
//! Each instance stages its gradients densely and the launching thread
//! scatters them to the caller's tensors in instance order, so results do
//! not depend on the thread count.

mod accumulate;
mod arena;
mod delta;
mod grad_key;
mod grad_query;
mod grad_value;
mod instance;
mod kernel;
pub mod plan;
mod schedule;
mod score_grad;
mod scores;
mod tiles;
mod validate;
pub mod workspace;

use rayon::prelude::*;
use tracing::{debug, warn};

pub use plan::KernelPlan;
pub use workspace::WorkspaceLayout;

use crate::config::KernelConfig;
use crate::dtype::Element;
use crate::error::Result;
use crate::ops::cpu::mma::PackedMma;
use crate::ops::traits::{AttentionBackwardOps, BackwardInputs, BackwardOutputs, MmaEngine};
use crate::tensor::{HeadCoord, ProblemShape};
use instance::InstanceState;

/// Tiled backward kernel with fused score recomputation.
#[derive(Debug, Clone)]
pub struct FusedAttentionBackward<E = PackedMma> {
    config: KernelConfig,
    engine: E,
}

impl FusedAttentionBackward<PackedMma> {
    pub fn new(config: KernelConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            engine: PackedMma,
        })
    }
}

impl<E: MmaEngine> FusedAttentionBackward<E> {
    /// Swap the tile multiply-accumulate engine.
    pub fn with_engine<F: MmaEngine>(self, engine: F) -> FusedAttentionBackward<F> {
        FusedAttentionBackward {
            config: self.config,
            engine,
        }
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Resolve the launch plan this kernel would use for `shape`.
    pub fn plan<T: Element>(&self, shape: &ProblemShape) -> Result<KernelPlan> {
        KernelPlan::resolve::<T>(&self.config, shape)
    }
}

impl<T: Element, E: MmaEngine> AttentionBackwardOps<T> for FusedAttentionBackward<E> {
    fn workspace_len(&self, shape: &ProblemShape) -> Result<usize> {
        Ok(self.plan::<T>(shape)?.workspace.total(shape))
    }

    fn attention_backward(
        &self,
        inputs: &BackwardInputs<'_, T>,
        outputs: &mut BackwardOutputs<'_, T>,
        workspace: &mut [f32],
    ) -> Result<()> {
        let plan = validate::check_launch(&self.config, inputs, outputs, workspace.len())
            .inspect_err(|e| warn!(error = %e, dtype = T::NAME, "launch rejected"))?;

        let shape = inputs.problem.shape;
        debug!(
            dtype = T::NAME,
            batch = shape.batch,
            heads = shape.heads,
            seq_q = shape.seq_q,
            seq_k = shape.seq_k,
            block_i = plan.block_i,
            block_j = plan.block_j,
            key_value_mode = ?plan.key_value_mode,
            query_mode = ?plan.query_mode,
            layout = ?plan.layout,
            arena = plan.arena.total(),
            workspace = plan.workspace.total(&shape),
            "attention backward"
        );

        let bias_grads = [&mut outputs.grad_bias_a, &mut outputs.grad_bias_b];
        for grad in bias_grads.into_iter().flatten() {
            grad.fill(0.0);
        }

        let heads = shape.heads;
        let coords: Vec<HeadCoord> = (0..shape.batch * heads)
            .map(|i| HeadCoord {
                batch: i / heads,
                head: i % heads,
            })
            .collect();
        let wave = (2 * rayon::current_num_threads()).max(1).min(coords.len());
        let want_a = outputs.grad_bias_a.is_some();
        let want_b = outputs.grad_bias_b.is_some();
        let mut states: Vec<InstanceState<T>> = (0..wave)
            .map(|_| InstanceState::new(&plan, inputs, want_a, want_b))
            .collect();

        let stride = plan.workspace.stride;
        for (w, chunk) in coords.chunks(wave).enumerate() {
            let parts: Vec<&mut [f32]> = if stride == 0 {
                chunk.iter().map(|_| Default::default()).collect()
            } else {
                let start = w * wave * stride;
                workspace[start..start + chunk.len() * stride]
                    .chunks_mut(stride)
                    .collect()
            };

            states[..chunk.len()]
                .par_iter_mut()
                .zip(chunk.par_iter())
                .zip(parts.into_par_iter())
                .try_for_each(|((state, &coord), part)| {
                    kernel::run_instance(&plan, &self.engine, inputs, coord, state, part)
                })?;

            for (state, &coord) in states.iter().zip(chunk) {
                state.scatter(inputs, outputs, coord);
            }
        }
        Ok(())
    }
}
