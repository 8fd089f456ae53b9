//! Shared helpers for flashgrad backend parity tests.

use flashgrad::dtype::{cast_slice_from_f32, cast_slice_to_f32};
use flashgrad::tensor::{
    lse_row_len, LseMut, LseRef, ProblemShape, Strides, TensorMut, TensorRef, VarLen,
};
use flashgrad::{
    attention_forward, AttentionBackwardOps, AttentionInputs, BackwardInputs, BackwardOutputs,
    BiasLayout, BiasRef, DropoutParams, Element, MaskPolicy,
};

/// Deterministic pseudo-random data using a sin-based pattern.
pub fn det_vec(n: usize, seed: f32) -> Vec<f32> {
    (0..n)
        .map(|i| ((i as f32 + seed) * 0.1).sin() * 0.5)
        .collect()
}

pub fn assert_parity_f32_tol(a: &[f32], b: &[f32], op: &str, rtol: f32, atol: f32) {
    assert_eq!(
        a.len(),
        b.len(),
        "parity_f32[{}]: length mismatch: {} vs {}",
        op,
        a.len(),
        b.len()
    );
    for (i, (x, y)) in a.iter().zip(b.iter()).enumerate() {
        let diff = (x - y).abs();
        let tol = atol + rtol * y.abs();
        if !(diff <= tol) {
            panic!(
                "parity_f32[{}] at index {}: {} vs {} (diff={}, tol={})",
                op, i, x, y, diff, tol
            );
        }
    }
}

/// Bitwise equality.
pub fn assert_identical(a: &[f32], b: &[f32], op: &str) {
    assert_eq!(a.len(), b.len(), "identical[{op}]: length mismatch");
    for (i, (x, y)) in a.iter().zip(b).enumerate() {
        assert!(
            x.to_bits() == y.to_bits(),
            "identical[{op}] at index {i}: {x} vs {y}"
        );
    }
}

/// Gradients of one backward run, widened to f32.
#[derive(Debug, Clone)]
pub struct Grads {
    pub dq: Vec<f32>,
    pub dk: Vec<f32>,
    pub dv: Vec<f32>,
    pub dbias_a: Option<Vec<f32>>,
    pub dbias_b: Option<Vec<f32>>,
}

impl Grads {
    pub fn assert_parity(&self, other: &Grads, op: &str, rtol: f32, atol: f32) {
        assert_parity_f32_tol(&self.dq, &other.dq, &format!("{op} dq"), rtol, atol);
        assert_parity_f32_tol(&self.dk, &other.dk, &format!("{op} dk"), rtol, atol);
        assert_parity_f32_tol(&self.dv, &other.dv, &format!("{op} dv"), rtol, atol);
        if let (Some(a), Some(b)) = (&self.dbias_a, &other.dbias_a) {
            assert_parity_f32_tol(a, b, &format!("{op} dbias_a"), rtol, atol);
        }
        if let (Some(a), Some(b)) = (&self.dbias_b, &other.dbias_b) {
            assert_parity_f32_tol(a, b, &format!("{op} dbias_b"), rtol, atol);
        }
    }

    pub fn assert_identical(&self, other: &Grads, op: &str) {
        assert_identical(&self.dq, &other.dq, &format!("{op} dq"));
        assert_identical(&self.dk, &other.dk, &format!("{op} dk"));
        assert_identical(&self.dv, &other.dv, &format!("{op} dv"));
    }
}

/// Owned attention problem in `[batch, seq, head, feature]` layout.
///
/// With variable-length packing the sequence axis holds every batch's rows
/// back to back.
pub struct Fixture<T> {
    pub shape: ProblemShape,
    pub q: Vec<T>,
    pub k: Vec<T>,
    pub v: Vec<T>,
    pub go: Vec<T>,
    pub scale: f32,
    pub mask: MaskPolicy,
    pub dropout: Option<DropoutParams>,
    pub bias_a: Option<(Vec<T>, BiasLayout)>,
    pub bias_b: Option<(Vec<T>, BiasLayout)>,
    pub varlen: Option<(Vec<i32>, Vec<i32>)>,
}

fn cast<T: Element>(v: Vec<f32>) -> Vec<T> {
    cast_slice_from_f32(&v)
}

impl<T: Element> Fixture<T> {
    pub fn dense(shape: ProblemShape) -> Self {
        let rows_q = shape.batch * shape.seq_q;
        let rows_k = shape.batch * shape.seq_k;
        Self::with_rows(shape, rows_q, rows_k)
    }

    /// Packed variable-length problem; `shape.seq_q`/`seq_k` must be the
    /// maximum lengths.
    pub fn packed(shape: ProblemShape, cu_q: Vec<i32>, cu_k: Vec<i32>) -> Self {
        let rows_q = *cu_q.last().unwrap() as usize;
        let rows_k = *cu_k.last().unwrap() as usize;
        let mut f = Self::with_rows(shape, rows_q, rows_k);
        f.varlen = Some((cu_q, cu_k));
        f
    }

    fn with_rows(shape: ProblemShape, rows_q: usize, rows_k: usize) -> Self {
        let h = shape.heads;
        Self {
            shape,
            q: cast(det_vec(rows_q * h * shape.head_dim, 0.0)),
            k: cast(det_vec(rows_k * h * shape.head_dim, 17.0)),
            v: cast(det_vec(rows_k * h * shape.value_dim, 31.0)),
            go: cast(det_vec(rows_q * h * shape.value_dim, 53.0)),
            scale: (shape.head_dim as f32).sqrt().recip(),
            mask: MaskPolicy::None,
            dropout: None,
            bias_a: None,
            bias_b: None,
            varlen: None,
        }
    }

    pub fn with_scale(mut self, scale: f32) -> Self {
        self.scale = scale;
        self
    }

    pub fn causal(mut self) -> Self {
        self.mask = MaskPolicy::Causal;
        self
    }

    pub fn with_dropout(mut self, params: DropoutParams) -> Self {
        self.dropout = Some(params);
        self
    }

    pub fn with_bias_a(mut self, layout: BiasLayout) -> Self {
        let data = cast(det_vec(layout.required_len(&self.shape), 71.0));
        self.bias_a = Some((data, layout));
        self
    }

    pub fn with_bias_b(mut self, layout: BiasLayout) -> Self {
        let data = cast(det_vec(layout.required_len(&self.shape), 89.0));
        self.bias_b = Some((data, layout));
        self
    }

    fn rows(&self, axis_q: bool) -> usize {
        match (&self.varlen, axis_q) {
            (Some((cu, _)), true) => *cu.last().unwrap() as usize,
            (Some((_, cu)), false) => *cu.last().unwrap() as usize,
            (None, true) => self.shape.seq_q,
            (None, false) => self.shape.seq_k,
        }
    }

    pub fn q_strides(&self) -> Strides {
        Strides::bshd(self.rows(true), self.shape.heads, self.shape.head_dim)
    }

    pub fn k_strides(&self) -> Strides {
        Strides::bshd(self.rows(false), self.shape.heads, self.shape.head_dim)
    }

    pub fn v_strides(&self) -> Strides {
        Strides::bshd(self.rows(false), self.shape.heads, self.shape.value_dim)
    }

    pub fn o_strides(&self) -> Strides {
        Strides::bshd(self.rows(true), self.shape.heads, self.shape.value_dim)
    }

    pub fn problem(&self) -> AttentionInputs<'_, T> {
        let mut p = AttentionInputs::new(
            self.shape,
            TensorRef::new(&self.q, self.q_strides()),
            TensorRef::new(&self.k, self.k_strides()),
            TensorRef::new(&self.v, self.v_strides()),
        )
        .with_scale(self.scale)
        .with_mask(self.mask);
        if let Some(d) = self.dropout {
            p = p.with_dropout(d);
        }
        if let Some((data, layout)) = &self.bias_a {
            p = p.with_bias_a(BiasRef::new(data, *layout));
        }
        if let Some((data, layout)) = &self.bias_b {
            p = p.with_bias_b(BiasRef::new(data, *layout));
        }
        if let Some((cu_q, cu_k)) = &self.varlen {
            p = p.with_varlen(VarLen {
                cu_seqlens_q: cu_q,
                cu_seqlens_k: cu_k,
            });
        }
        p
    }

    /// Reference forward pass: `(output, logsumexp)`.
    pub fn forward(&self) -> flashgrad::Result<(Vec<T>, Vec<f32>)> {
        let s = self.shape;
        let mut o = vec![T::default(); self.go.len()];
        let mut lse = vec![0.0f32; s.batch * s.heads * lse_row_len(s.seq_q)];
        {
            let mut out = TensorMut::new(&mut o, self.o_strides());
            let mut l = LseMut::contiguous(&mut lse, s.heads, s.seq_q);
            attention_forward(&self.problem(), &mut out, &mut l)?;
        }
        Ok((o, lse))
    }

    /// Run `op` with NaN-prefilled outputs so unwritten rows are caught.
    pub fn try_backward(&self, op: &dyn AttentionBackwardOps<T>) -> flashgrad::Result<Grads> {
        let (o, lse) = self.forward()?;
        let s = self.shape;
        let inputs = BackwardInputs {
            problem: self.problem(),
            output: TensorRef::new(&o, self.o_strides()),
            grad_output: TensorRef::new(&self.go, self.o_strides()),
            logsumexp: LseRef::contiguous(&lse, s.heads, s.seq_q),
        };

        let nan = T::from_f32(f32::NAN);
        let mut dq = vec![nan; self.q.len()];
        let mut dk = vec![nan; self.k.len()];
        let mut dv = vec![nan; self.v.len()];
        let mut dba = self.bias_a.as_ref().map(|(b, _)| vec![f32::NAN; b.len()]);
        let mut dbb = self.bias_b.as_ref().map(|(b, _)| vec![f32::NAN; b.len()]);
        let mut ws = vec![f32::NAN; op.workspace_len(&s)?];

        {
            let mut outputs = BackwardOutputs::new(
                TensorMut::new(&mut dq, self.q_strides()),
                TensorMut::new(&mut dk, self.k_strides()),
                TensorMut::new(&mut dv, self.v_strides()),
            );
            if let Some(g) = dba.as_deref_mut() {
                outputs = outputs.with_grad_bias_a(g);
            }
            if let Some(g) = dbb.as_deref_mut() {
                outputs = outputs.with_grad_bias_b(g);
            }
            op.attention_backward(&inputs, &mut outputs, &mut ws)?;
        }

        let widen = |v: Vec<T>| cast_slice_to_f32(&v);
        Ok(Grads {
            dq: widen(dq),
            dk: widen(dk),
            dv: widen(dv),
            dbias_a: dba,
            dbias_b: dbb,
        })
    }

    pub fn backward(&self, op: &dyn AttentionBackwardOps<T>) -> Grads {
        self.try_backward(op).unwrap()
    }
}
