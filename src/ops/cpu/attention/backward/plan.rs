//! Launch plan: every static decision resolved once from the configuration,
//! the element type and the problem shape.

use super::arena::{ArenaLayout, ArenaParams};
use super::workspace::{WorkspaceLayout, WorkspaceParams};
use crate::config::{AccumMode, KernelConfig, Prologue, ScoreGradLayout};
use crate::dtype::Element;
use crate::error::{Error, Result};
use crate::tensor::ProblemShape;

/// Resolved kernel plan.
#[derive(Debug, Clone)]
pub struct KernelPlan {
    pub block_i: usize,
    pub block_j: usize,
    pub max_k: usize,
    pub head_dim: usize,
    pub value_dim: usize,
    /// Shared by the key and value gradients.
    pub key_value_mode: AccumMode,
    pub query_mode: AccumMode,
    pub layout: ScoreGradLayout,
    pub prologue: Prologue,
    pub dropout: bool,
    /// Feature columns per key/value accumulator chunk.
    pub kv_chunk: usize,
    /// Feature columns per query accumulator chunk.
    pub q_chunk: usize,
    pub arena: ArenaLayout,
    pub workspace: WorkspaceLayout,
}

impl KernelPlan {
    pub fn resolve<T: Element>(config: &KernelConfig, shape: &ProblemShape) -> Result<Self> {
        config.validate()?;
        for (arg, dim) in [("head_dim", shape.head_dim), ("value_dim", shape.value_dim)] {
            if dim == 0 || dim > config.max_k {
                return Err(Error::InvalidArgument {
                    arg,
                    reason: format!("{dim} must be in 1..={}", config.max_k),
                });
            }
        }

        let (i, j, k) = (config.block_i, config.block_j, config.max_k);
        let key_value_mode = config.accum.key_value.unwrap_or(if T::IS_HALF {
            if k <= i {
                AccumMode::InRegister
            } else {
                AccumMode::InMemory
            }
        } else {
            AccumMode::InOutput
        });
        let query_mode = config.accum.query.unwrap_or(if T::IS_HALF {
            AccumMode::InMemory
        } else {
            AccumMode::InOutput
        });

        let in_output = key_value_mode == AccumMode::InOutput || query_mode == AccumMode::InOutput;
        if T::IS_HALF && in_output {
            return Err(Error::InvalidConfig {
                reason: format!("accumulating in the output needs f32 storage, got {}", T::NAME),
            });
        }
        if config.preload.any() && key_value_mode != AccumMode::InRegister {
            return Err(Error::InvalidConfig {
                reason: format!(
                    "prefetch needs in-register key/value accumulation, got {key_value_mode:?}"
                ),
            });
        }

        let kv_chunk = if k <= i { k } else { i };
        let q_chunk = if k <= j { k } else { j };

        let arena = ArenaLayout::new(&ArenaParams {
            block_i: i,
            block_j: j,
            max_k: k,
            layout: config.score_grad_layout,
            dropout: config.apply_dropout,
            prefetch_query: config.preload.query,
            prefetch_output_grad: config.preload.output_grad,
            prefetch_key_value: config.preload.key_value,
        });
        let workspace = WorkspaceLayout::new(
            shape,
            &WorkspaceParams {
                block_i: i,
                block_j: j,
                kv_chunk,
                q_chunk,
                key_value_mode,
                query_mode,
            },
        );

        Ok(Self {
            block_i: i,
            block_j: j,
            max_k: k,
            head_dim: shape.head_dim,
            value_dim: shape.value_dim,
            key_value_mode,
            query_mode,
            layout: config.score_grad_layout,
            prologue: config.preload,
            dropout: config.apply_dropout,
            kv_chunk,
            q_chunk,
            arena,
            workspace,
        })
    }
}
