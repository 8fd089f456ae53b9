//! Attention dropout with a regenerable keep mask.
//!
//! The mask is never saved by the forward pass. Uniform variates come from
//! numr's counter-based `philox_uniform` keyed by `(seed, counter)`, so every
//! consumer that asks for the same instance plane reconstructs exactly the
//! mask the forward pass applied.

use numr::dtype::DType;
use numr::ops::AdvancedRandomOps;
use numr::runtime::cpu::{CpuClient, CpuDevice};

use crate::error::{Error, Result};
use crate::tensor::{HeadCoord, ProblemShape};

/// Dropout parameters shared by the forward and backward passes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DropoutParams {
    /// Drop probability in `[0, 1]`.
    pub prob: f32,
    /// Philox key.
    pub seed: u64,
    /// Added to every element counter; lets callers split one seed across launches.
    pub offset: u64,
    /// Scale kept weights by `1 / (1 - prob)` (inverted dropout).
    pub rescale: bool,
}

impl DropoutParams {
    pub fn new(prob: f32, seed: u64) -> Self {
        Self {
            prob,
            seed,
            offset: 0,
            rescale: true,
        }
    }

    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_rescale(mut self, rescale: bool) -> Self {
        self.rescale = rescale;
        self
    }

    /// Multiplier applied to a kept weight.
    pub fn keep_scale(&self) -> f32 {
        if self.prob >= 1.0 {
            0.0
        } else if self.rescale {
            1.0 / (1.0 - self.prob)
        } else {
            1.0
        }
    }
}

/// Scaling factors of one (batch, head) instance.
///
/// The plane starts at counter `offset + (batch·H + head)·Lq·Lk` and element
/// `(q, k)` sits at `q·Lk + k` inside it, with `Lq`, `Lk` the problem's
/// maximum sequence lengths.
#[derive(Debug, Clone)]
pub struct DropoutMask {
    factors: Vec<f32>,
    row_stride: usize,
}

impl DropoutMask {
    /// Regenerate the first `rows` query rows of the instance plane.
    pub fn for_instance(
        params: &DropoutParams,
        shape: &ProblemShape,
        coord: HeadCoord,
        rows: usize,
    ) -> Result<Self> {
        let plane = shape.seq_q as u64 * shape.seq_k as u64;
        let instance = (coord.batch * shape.heads + coord.head) as u64;
        let counter = params.offset.wrapping_add(instance * plane);
        let keep_below = 1.0 - params.prob;
        let keep_scale = params.keep_scale();

        let mut factors = philox_plane(params.seed, counter, rows, shape.seq_k)?;
        for f in &mut factors {
            *f = if *f < keep_below { keep_scale } else { 0.0 };
        }
        Ok(Self {
            factors,
            row_stride: shape.seq_k,
        })
    }

    /// Scaling factor for `(q, k)`: `keep_scale` if kept, `0` if dropped.
    #[inline]
    pub fn factor(&self, q: usize, k: usize) -> f32 {
        self.factors[q * self.row_stride + k]
    }
}

/// `rows x cols` uniform `[0, 1)` variates starting at Philox `counter`.
fn philox_plane(seed: u64, counter: u64, rows: usize, cols: usize) -> Result<Vec<f32>> {
    if rows == 0 || cols == 0 {
        return Ok(Vec::new());
    }
    let client = CpuClient::new(CpuDevice::new());
    let uniforms = client
        .philox_uniform(&[rows, cols], seed, counter, DType::F32)
        .map_err(Error::Numr)?;
    Ok(uniforms.to_vec::<f32>())
}
