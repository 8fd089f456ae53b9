//! Kernel configuration.
//!
//! [`KernelConfig`] is the user-facing knob set. It is resolved once per
//! launch into a [`KernelPlan`](crate::ops::cpu::attention::backward::KernelPlan),
//! which is what the tile loop actually reads.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Largest tile edge accepted by [`KernelConfig::validate`].
pub const MAX_TILE: usize = 512;

/// Largest feature dimension accepted by [`KernelConfig::validate`].
pub const MAX_HEAD_DIM: usize = 1024;

/// Where a gradient accumulator lives between tile iterations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccumMode {
    /// Whole accumulator resident for one outer iteration, flushed once.
    InRegister,
    /// Partial sums spilled to the caller workspace between iterations.
    InMemory,
    /// Partial sums accumulated directly in the output gradient (f32 only).
    InOutput,
}

/// Which orientation of the score-gradient tile is materialized.
///
/// Exactly one is produced per configuration; the other consumer reads it
/// through a transposed view.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreGradLayout {
    /// `[key, query]`, written over the attention-weight tile. The query
    /// gradient reads it transposed.
    #[default]
    KeyMajor,
    /// `[query, key]`, in its own buffer. The key gradient reads it transposed.
    QueryMajor,
}

/// Forced accumulator placement. `None` selects automatically.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccumOverride {
    /// Mode shared by the key and value gradients.
    #[serde(default)]
    pub key_value: Option<AccumMode>,
    /// Mode of the query gradient.
    #[serde(default)]
    pub query: Option<AccumMode>,
}

/// Prologue prefetch set: which of the next iteration's input tiles are
/// staged while the current iteration is still computing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prologue {
    /// Next query tile.
    #[serde(default)]
    pub query: bool,
    /// Next output-gradient tile.
    #[serde(default)]
    pub output_grad: bool,
    /// Next key and value tiles, when the key tile advances.
    #[serde(default)]
    pub key_value: bool,
}

impl Prologue {
    /// Prefetch every input tile.
    pub fn all() -> Self {
        Self {
            query: true,
            output_grad: true,
            key_value: true,
        }
    }

    pub fn any(&self) -> bool {
        self.query || self.output_grad || self.key_value
    }
}

/// Backward kernel configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelConfig {
    /// Query tile height.
    #[serde(default = "default_block")]
    pub block_i: usize,

    /// Key tile height.
    #[serde(default = "default_block")]
    pub block_j: usize,

    /// Feature-dimension ceiling; sizes the fast-memory tiles.
    #[serde(default = "default_max_k")]
    pub max_k: usize,

    /// Require base addresses and strides aligned to the vector-access width.
    #[serde(default = "default_true")]
    pub aligned: bool,

    /// Accept a non-zero dropout probability.
    #[serde(default)]
    pub apply_dropout: bool,

    /// Enable the per-query bias input.
    #[serde(default)]
    pub bias_a: bool,

    /// Enable the pairwise bias input.
    #[serde(default)]
    pub bias_b: bool,

    #[serde(default)]
    pub score_grad_layout: ScoreGradLayout,

    #[serde(default)]
    pub preload: Prologue,

    #[serde(default)]
    pub accum: AccumOverride,
}

fn default_block() -> usize {
    64
}

fn default_max_k() -> usize {
    128
}

fn default_true() -> bool {
    true
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            block_i: default_block(),
            block_j: default_block(),
            max_k: default_max_k(),
            aligned: true,
            apply_dropout: false,
            bias_a: false,
            bias_b: false,
            score_grad_layout: ScoreGradLayout::default(),
            preload: Prologue::default(),
            accum: AccumOverride::default(),
        }
    }
}

impl KernelConfig {
    pub fn with_tiles(mut self, block_i: usize, block_j: usize) -> Self {
        self.block_i = block_i;
        self.block_j = block_j;
        self
    }

    pub fn with_max_k(mut self, max_k: usize) -> Self {
        self.max_k = max_k;
        self
    }

    pub fn with_aligned(mut self, aligned: bool) -> Self {
        self.aligned = aligned;
        self
    }

    pub fn with_dropout(mut self, enabled: bool) -> Self {
        self.apply_dropout = enabled;
        self
    }

    pub fn with_bias(mut self, bias_a: bool, bias_b: bool) -> Self {
        self.bias_a = bias_a;
        self.bias_b = bias_b;
        self
    }

    pub fn with_score_grad_layout(mut self, layout: ScoreGradLayout) -> Self {
        self.score_grad_layout = layout;
        self
    }

    pub fn with_preload(mut self, preload: Prologue) -> Self {
        self.preload = preload;
        self
    }

    pub fn with_key_value_accum(mut self, mode: AccumMode) -> Self {
        self.accum.key_value = Some(mode);
        self
    }

    pub fn with_query_accum(mut self, mode: AccumMode) -> Self {
        self.accum.query = Some(mode);
        self
    }

    /// Check the configuration on its own, independent of element type and
    /// problem shape.
    pub fn validate(&self) -> Result<()> {
        for (name, v) in [("block_i", self.block_i), ("block_j", self.block_j)] {
            if v == 0 || v > MAX_TILE {
                return Err(Error::InvalidConfig {
                    reason: format!("{name} must be in 1..={MAX_TILE}, got {v}"),
                });
            }
        }
        if self.max_k == 0 || self.max_k > MAX_HEAD_DIM {
            return Err(Error::InvalidConfig {
                reason: format!("max_k must be in 1..={MAX_HEAD_DIM}, got {}", self.max_k),
            });
        }
        if self.accum.query == Some(AccumMode::InRegister) {
            return Err(Error::InvalidConfig {
                reason: "query gradient cannot stay in registers across query tiles".into(),
            });
        }
        if self.accum.key_value == Some(AccumMode::InRegister) && self.max_k > self.block_i {
            return Err(Error::InvalidConfig {
                reason: format!(
                    "in-register key/value accumulation needs max_k ({}) <= block_i ({})",
                    self.max_k, self.block_i
                ),
            });
        }
        Ok(())
    }
}
