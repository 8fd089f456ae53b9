//! Attention backward op contract.

use super::bias::BiasRef;
use super::dropout::{DropoutMask, DropoutParams};
use crate::dtype::Element;
use crate::error::Result;
use crate::tensor::{HeadCoord, LseRef, ProblemShape, Rows, TensorMut, TensorRef, VarLen};

/// Which (query, key) pairs may attend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MaskPolicy {
    /// Dense: every query sees every key.
    #[default]
    None,
    /// Top-left aligned causal: query `q` sees key `k` iff `k <= q`.
    Causal,
}

impl MaskPolicy {
    #[inline]
    pub fn allows(&self, q: usize, k: usize) -> bool {
        match self {
            MaskPolicy::None => true,
            MaskPolicy::Causal => k <= q,
        }
    }
}

/// Forward-problem description shared by the forward and backward passes.
#[derive(Debug, Clone, Copy)]
pub struct AttentionInputs<'a, T> {
    pub shape: ProblemShape,
    /// `[B, Lq, H, D]` logical
    pub query: TensorRef<'a, T>,
    /// `[B, Lk, H, D]` logical
    pub key: TensorRef<'a, T>,
    /// `[B, Lk, H, Dv]` logical
    pub value: TensorRef<'a, T>,
    /// Softmax scale, usually `1 / sqrt(D)`.
    pub scale: f32,
    pub bias_a: Option<BiasRef<'a, T>>,
    pub bias_b: Option<BiasRef<'a, T>>,
    pub dropout: Option<DropoutParams>,
    pub mask: MaskPolicy,
    pub varlen: Option<VarLen<'a>>,
}

impl<'a, T: Element> AttentionInputs<'a, T> {
    /// Dense problem with default scale `1 / sqrt(head_dim)` and no extras.
    pub fn new(
        shape: ProblemShape,
        query: TensorRef<'a, T>,
        key: TensorRef<'a, T>,
        value: TensorRef<'a, T>,
    ) -> Self {
        Self {
            shape,
            query,
            key,
            value,
            scale: (shape.head_dim as f32).sqrt().recip(),
            bias_a: None,
            bias_b: None,
            dropout: None,
            mask: MaskPolicy::None,
            varlen: None,
        }
    }

    pub fn with_scale(mut self, scale: f32) -> Self {
        self.scale = scale;
        self
    }

    pub fn with_bias_a(mut self, bias: BiasRef<'a, T>) -> Self {
        self.bias_a = Some(bias);
        self
    }

    pub fn with_bias_b(mut self, bias: BiasRef<'a, T>) -> Self {
        self.bias_b = Some(bias);
        self
    }

    pub fn with_dropout(mut self, dropout: DropoutParams) -> Self {
        self.dropout = Some(dropout);
        self
    }

    pub fn with_mask(mut self, mask: MaskPolicy) -> Self {
        self.mask = mask;
        self
    }

    pub fn with_varlen(mut self, varlen: VarLen<'a>) -> Self {
        self.varlen = Some(varlen);
        self
    }

    /// Resolve every per-instance offset for `(batch, head)`.
    ///
    /// Called exactly once per instance, before any tile is touched. Fails
    /// only if the dropout mask cannot be regenerated.
    pub fn advance(&self, coord: HeadCoord) -> Result<HeadView<'a, T>> {
        let (q_row0, seq_q, k_row0, seq_k) = self.spans(coord.batch);
        let s = &self.shape;
        let packed = self.varlen.is_some();
        let dropout = match self.dropout.filter(|d| d.prob > 0.0) {
            Some(d) => Some(DropoutMask::for_instance(&d, s, coord, seq_q)?),
            None => None,
        };
        Ok(HeadView {
            coord,
            seq_q,
            seq_k,
            query: rows(&self.query, coord, q_row0, s.head_dim, packed),
            key: rows(&self.key, coord, k_row0, s.head_dim, packed),
            value: rows(&self.value, coord, k_row0, s.value_dim, packed),
            bias_a: self.bias_a.map(|b| HeadBias {
                data: b.data,
                base: b.layout.base(coord),
                query_stride: b.layout.query,
                key_stride: b.layout.key,
            }),
            bias_b: self.bias_b.map(|b| HeadBias {
                data: b.data,
                base: b.layout.base(coord),
                query_stride: b.layout.query,
                key_stride: b.layout.key,
            }),
            dropout,
            mask: self.mask,
            scale: self.scale,
        })
    }

    /// `(query_row0, seq_q, key_row0, seq_k)` of batch element `b`.
    pub(crate) fn spans(&self, b: usize) -> (usize, usize, usize, usize) {
        match &self.varlen {
            Some(v) => {
                let (q0, lq) = v.query_span(b);
                let (k0, lk) = v.key_span(b);
                (q0, lq, k0, lk)
            }
            None => (0, self.shape.seq_q, 0, self.shape.seq_k),
        }
    }

    /// Sequence lengths of batch element `b`.
    pub fn seq_lens(&self, b: usize) -> (usize, usize) {
        let (_, lq, _, lk) = self.spans(b);
        (lq, lk)
    }
}

fn rows<'a, T>(
    t: &TensorRef<'a, T>,
    coord: HeadCoord,
    row0: usize,
    width: usize,
    packed: bool,
) -> Rows<'a, T> {
    let base = t.strides.row_offset(coord, row0, packed);
    Rows::new(t.data, base, t.strides.row, width)
}

/// Bias plane of one instance.
#[derive(Debug, Clone, Copy)]
pub struct HeadBias<'a, T> {
    data: &'a [T],
    base: usize,
    query_stride: usize,
    key_stride: usize,
}

impl<T: Element> HeadBias<'_, T> {
    #[inline]
    pub fn get(&self, q: usize, k: usize) -> f32 {
        self.data[self.base + q * self.query_stride + k * self.key_stride].to_f32()
    }
}

/// Everything one (batch, head) instance reads, with offsets applied.
#[derive(Debug, Clone)]
pub struct HeadView<'a, T> {
    pub coord: HeadCoord,
    pub seq_q: usize,
    pub seq_k: usize,
    pub query: Rows<'a, T>,
    pub key: Rows<'a, T>,
    pub value: Rows<'a, T>,
    pub bias_a: Option<HeadBias<'a, T>>,
    pub bias_b: Option<HeadBias<'a, T>>,
    /// `None` when dropout is off or its probability is zero.
    pub dropout: Option<DropoutMask>,
    pub mask: MaskPolicy,
    pub scale: f32,
}

impl<T: Element> HeadView<'_, T> {
    /// Sum of the enabled biases at `(q, k)`.
    #[inline]
    pub fn bias(&self, q: usize, k: usize) -> f32 {
        let mut b = 0.0;
        if let Some(a) = &self.bias_a {
            b += a.get(q, k);
        }
        if let Some(p) = &self.bias_b {
            b += p.get(q, k);
        }
        b
    }
}

/// Backward-pass inputs: the forward problem plus what the forward pass saved.
#[derive(Debug, Clone, Copy)]
pub struct BackwardInputs<'a, T> {
    pub problem: AttentionInputs<'a, T>,
    /// Forward output `O`, `[B, Lq, H, Dv]` logical
    pub output: TensorRef<'a, T>,
    /// Upstream gradient `dO`, same layout as `output`
    pub grad_output: TensorRef<'a, T>,
    pub logsumexp: LseRef<'a>,
}

impl<'a, T: Element> BackwardInputs<'a, T> {
    /// Output, output-gradient and log-sum-exp rows of one instance.
    pub fn saved(&self, coord: HeadCoord) -> SavedRows<'a, T> {
        let (q0, _, _, _) = self.problem.spans(coord.batch);
        let packed = self.problem.varlen.is_some();
        let dv = self.problem.shape.value_dim;
        let lse_base =
            coord.batch * self.logsumexp.batch_stride + coord.head * self.logsumexp.head_stride;
        let (lq, _) = self.problem.seq_lens(coord.batch);
        SavedRows {
            output: rows(&self.output, coord, q0, dv, packed),
            grad_output: rows(&self.grad_output, coord, q0, dv, packed),
            lse: &self.logsumexp.data[lse_base..lse_base + lq],
        }
    }
}

/// Per-instance view of the forward pass's saved tensors.
#[derive(Debug, Clone, Copy)]
pub struct SavedRows<'a, T> {
    pub output: Rows<'a, T>,
    pub grad_output: Rows<'a, T>,
    pub lse: &'a [f32],
}

/// Backward-pass outputs.
///
/// Gradient tensors are overwritten. Bias gradients use the layout of the
/// matching bias input and are overwritten with the sum over every axis that
/// layout broadcasts.
#[derive(Debug)]
pub struct BackwardOutputs<'a, T> {
    pub grad_query: TensorMut<'a, T>,
    pub grad_key: TensorMut<'a, T>,
    pub grad_value: TensorMut<'a, T>,
    pub grad_bias_a: Option<&'a mut [f32]>,
    pub grad_bias_b: Option<&'a mut [f32]>,
}

impl<'a, T> BackwardOutputs<'a, T> {
    pub fn new(
        grad_query: TensorMut<'a, T>,
        grad_key: TensorMut<'a, T>,
        grad_value: TensorMut<'a, T>,
    ) -> Self {
        Self {
            grad_query,
            grad_key,
            grad_value,
            grad_bias_a: None,
            grad_bias_b: None,
        }
    }

    pub fn with_grad_bias_a(mut self, grad: &'a mut [f32]) -> Self {
        self.grad_bias_a = Some(grad);
        self
    }

    pub fn with_grad_bias_b(mut self, grad: &'a mut [f32]) -> Self {
        self.grad_bias_b = Some(grad);
        self
    }
}

/// Scaled dot-product attention backward.
///
/// # Layout contract
///
/// - `query`, `key`: feature width `head_dim`; `value`, `output`,
///   `grad_output`: feature width `value_dim`. Feature axis contiguous.
/// - `logsumexp`: `[B, H, Lq]` f32, both strides multiples of 8.
/// - Gradients: same strides as the tensor they differentiate.
/// - With [`VarLen`], batch `b` occupies rows `cu[b]..cu[b + 1]` and batch
///   strides are ignored.
///
/// # Math
///
/// With `P = exp(scale·Q·Kᵀ + bias − lse)`, dropout factors `Z` and
/// `Δ = rowsum(O ⊙ dO)`:
///
/// - `dV = (P ⊙ Z)ᵀ · dO`
/// - `dS = P ⊙ ((dO · Vᵀ) ⊙ Z − Δ)`
/// - `dBias = Σ_broadcast dS`
/// - `dQ = scale · dS · K`, `dK = scale · dSᵀ · Q`
pub trait AttentionBackwardOps<T: Element> {
    /// Number of `f32` workspace elements the backward for `shape` needs.
    fn workspace_len(&self, shape: &ProblemShape) -> Result<usize>;

    /// Compute every gradient for every (batch, head) instance.
    ///
    /// All preconditions are checked before any output or workspace element
    /// is written.
    fn attention_backward(
        &self,
        inputs: &BackwardInputs<'_, T>,
        outputs: &mut BackwardOutputs<'_, T>,
        workspace: &mut [f32],
    ) -> Result<()>;
}
