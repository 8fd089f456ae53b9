//! Dense composite attention
//!
//! The untiled rendition of the same math the fused kernel implements: the
//! whole `[Lq, Lk]` weight matrix of one instance is materialized in `f64`.
//! It produces the forward output and log-sum-exp the backward consumes and
//! serves as the parity reference for the tiled kernel.

use crate::dtype::Element;
use crate::error::{Error, Result};
use crate::ops::traits::attention::checks::{check_outputs, check_problem, check_saved};
use crate::ops::traits::{
    AttentionBackwardOps, AttentionInputs, BackwardInputs, BackwardOutputs, HeadView,
};
use crate::tensor::{required_len, HeadCoord, LseMut, ProblemShape, TensorMut};

/// Forward attention: writes `output` and the per-row log-sum-exp.
///
/// Rows whose every key is masked get `lse = -inf` and a zero output.
pub fn attention_forward<T: Element>(
    p: &AttentionInputs<'_, T>,
    output: &mut TensorMut<'_, T>,
    lse: &mut LseMut<'_>,
) -> Result<()> {
    check_problem(p)?;
    let s = p.shape;
    if p.varlen.is_none() {
        let required = required_len(&output.strides, s.batch, s.heads, s.seq_q, s.value_dim);
        if required > output.data.len() {
            return Err(Error::OutOfBounds {
                tensor: "output",
                required,
                len: output.data.len(),
            });
        }
    }
    let lse_required = (s.batch - 1) * lse.batch_stride + (s.heads - 1) * lse.head_stride + s.seq_q;
    if lse_required > lse.data.len() {
        return Err(Error::OutOfBounds {
            tensor: "logsumexp",
            required: lse_required,
            len: lse.data.len(),
        });
    }

    let packed = p.varlen.is_some();
    for batch in 0..s.batch {
        let (q0, ..) = p.spans(batch);
        for head in 0..s.heads {
            let coord = HeadCoord { batch, head };
            let view = p.advance(coord)?;
            let lse_base = batch * lse.batch_stride + head * lse.head_stride;
            let lse_rows = &mut lse.data[lse_base..lse_base + view.seq_q];
            forward_instance(&view, lse_rows, |q, vals| {
                let start = output.strides.row_offset(coord, q0 + q, packed);
                for (dst, &v) in output.data[start..start + vals.len()].iter_mut().zip(vals) {
                    *dst = T::from_f32(v as f32);
                }
            });
        }
    }
    Ok(())
}

fn forward_instance<T: Element>(
    view: &HeadView<'_, T>,
    lse: &mut [f32],
    mut write_row: impl FnMut(usize, &[f64]),
) {
    let dv = view.value.width();
    let scale = f64::from(view.scale);
    let mut scores = vec![0.0f64; view.seq_k];
    let mut acc = vec![0.0f64; dv];

    for q in 0..view.seq_q {
        let q_row = view.query.row(q);
        let mut max = f64::NEG_INFINITY;
        for (k, s) in scores.iter_mut().enumerate() {
            *s = if view.mask.allows(q, k) {
                scale * dot64(q_row, view.key.row(k)) + f64::from(view.bias(q, k))
            } else {
                f64::NEG_INFINITY
            };
            max = max.max(*s);
        }

        acc.fill(0.0);
        if max == f64::NEG_INFINITY {
            lse[q] = f32::NEG_INFINITY;
        } else {
            let sum: f64 = scores.iter().map(|&s| (s - max).exp()).sum();
            let l = max + sum.ln();
            lse[q] = l as f32;
            for (k, &s) in scores.iter().enumerate() {
                let z = view
                    .dropout
                    .as_ref()
                    .map_or(1.0, |m| f64::from(m.factor(q, k)));
                let w = (s - l).exp() * z;
                if w == 0.0 {
                    continue;
                }
                for (a, v) in acc.iter_mut().zip(view.value.row(k)) {
                    *a += w * f64::from(v.to_f32());
                }
            }
        }
        write_row(q, &acc);
    }
}

/// Untiled backward. Needs no workspace.
#[derive(Debug, Clone, Copy, Default)]
pub struct DenseAttentionBackward;

impl<T: Element> AttentionBackwardOps<T> for DenseAttentionBackward {
    fn workspace_len(&self, _shape: &ProblemShape) -> Result<usize> {
        Ok(0)
    }

    fn attention_backward(
        &self,
        inputs: &BackwardInputs<'_, T>,
        outputs: &mut BackwardOutputs<'_, T>,
        _workspace: &mut [f32],
    ) -> Result<()> {
        check_problem(&inputs.problem)?;
        check_saved(inputs)?;
        check_outputs(inputs, outputs)?;

        if let Some(g) = outputs.grad_bias_a.as_deref_mut() {
            g.fill(0.0);
        }
        if let Some(g) = outputs.grad_bias_b.as_deref_mut() {
            g.fill(0.0);
        }

        let s = inputs.problem.shape;
        for batch in 0..s.batch {
            for head in 0..s.heads {
                backward_instance(inputs, HeadCoord { batch, head }, outputs)?;
            }
        }
        Ok(())
    }
}

fn backward_instance<T: Element>(
    inputs: &BackwardInputs<'_, T>,
    coord: HeadCoord,
    outputs: &mut BackwardOutputs<'_, T>,
) -> Result<()> {
    let p = &inputs.problem;
    let view = p.advance(coord)?;
    let saved = inputs.saved(coord);
    let (lq, lk) = (view.seq_q, view.seq_k);
    let (d, dv) = (p.shape.head_dim, p.shape.value_dim);
    let scale = f64::from(view.scale);

    let mut prob = vec![0.0f64; lq * lk];
    let mut keep = vec![1.0f64; lq * lk];
    for q in 0..lq {
        let l = f64::from(saved.lse[q]);
        for k in 0..lk {
            if !view.mask.allows(q, k) {
                continue;
            }
            let s = scale * dot64(view.query.row(q), view.key.row(k)) + f64::from(view.bias(q, k));
            prob[q * lk + k] = (s - l).exp();
            if let Some(m) = &view.dropout {
                keep[q * lk + k] = f64::from(m.factor(q, k));
            }
        }
    }

    let delta: Vec<f64> = (0..lq)
        .map(|q| dot64(saved.output.row(q), saved.grad_output.row(q)))
        .collect();

    let mut grad_v = vec![0.0f64; lk * dv];
    let mut grad_s = vec![0.0f64; lq * lk];
    for q in 0..lq {
        let go = saved.grad_output.row(q);
        for k in 0..lk {
            let i = q * lk + k;
            let w = prob[i] * keep[i];
            for (g, o) in grad_v[k * dv..(k + 1) * dv].iter_mut().zip(go) {
                *g += w * f64::from(o.to_f32());
            }
            let dp = dot64(go, view.value.row(k)) * keep[i];
            grad_s[i] = prob[i] * (dp - delta[q]);
        }
    }

    for (bias, grad) in [
        (&p.bias_a, outputs.grad_bias_a.as_deref_mut()),
        (&p.bias_b, outputs.grad_bias_b.as_deref_mut()),
    ] {
        if let (Some(b), Some(g)) = (bias, grad) {
            let base = b.layout.base(coord);
            for q in 0..lq {
                for k in 0..lk {
                    g[base + b.layout.offset(q, k)] += grad_s[q * lk + k] as f32;
                }
            }
        }
    }

    let mut grad_q = vec![0.0f64; lq * d];
    let mut grad_k = vec![0.0f64; lk * d];
    for q in 0..lq {
        let q_row = view.query.row(q);
        for k in 0..lk {
            let ds = grad_s[q * lk + k] * scale;
            if ds == 0.0 {
                continue;
            }
            let k_row = view.key.row(k);
            for f in 0..d {
                grad_q[q * d + f] += ds * f64::from(k_row[f].to_f32());
                grad_k[k * d + f] += ds * f64::from(q_row[f].to_f32());
            }
        }
    }

    let (q0, _, k0, _) = p.spans(coord.batch);
    let packed = p.varlen.is_some();
    write_rows(&mut outputs.grad_query, coord, q0, packed, &grad_q, d);
    write_rows(&mut outputs.grad_key, coord, k0, packed, &grad_k, d);
    write_rows(&mut outputs.grad_value, coord, k0, packed, &grad_v, dv);
    Ok(())
}

fn write_rows<T: Element>(
    dst: &mut TensorMut<'_, T>,
    coord: HeadCoord,
    row0: usize,
    packed: bool,
    src: &[f64],
    width: usize,
) {
    for (r, vals) in src.chunks_exact(width).enumerate() {
        let start = dst.strides.row_offset(coord, row0 + r, packed);
        for (o, &v) in dst.data[start..start + width].iter_mut().zip(vals) {
            *o = T::from_f32(v as f32);
        }
    }
}

fn dot64<T: Element>(a: &[T], b: &[T]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(x, y)| f64::from(x.to_f32()) * f64::from(y.to_f32()))
        .sum()
}
