//! Contract checks shared by every backward implementation.
//!
//! These cover what the op contract itself requires: positive dimensions,
//! well-formed sequence offsets, in-bounds views, a valid dropout probability.
//! Kernel-specific limits (alignment, tile ceilings, enable flags) are checked
//! by the kernel that imposes them.

use super::backward::{AttentionInputs, BackwardInputs, BackwardOutputs};
use crate::error::{Error, Result};
use crate::tensor::{required_len, Strides, LSE_ALIGNMENT};

/// Check the forward-problem description.
pub(crate) fn check_problem<T>(p: &AttentionInputs<'_, T>) -> Result<()> {
    let s = &p.shape;
    for (arg, v) in [
        ("batch", s.batch),
        ("heads", s.heads),
        ("seq_q", s.seq_q),
        ("seq_k", s.seq_k),
        ("head_dim", s.head_dim),
        ("value_dim", s.value_dim),
    ] {
        if v == 0 {
            return Err(Error::InvalidArgument {
                arg,
                reason: "must be > 0".into(),
            });
        }
    }
    if !p.scale.is_finite() {
        return Err(Error::InvalidArgument {
            arg: "scale",
            reason: format!("must be finite, got {}", p.scale),
        });
    }
    if let Some(v) = &p.varlen {
        v.validate(s)?;
    }
    if let Some(d) = &p.dropout {
        if !(0.0..=1.0).contains(&d.prob) {
            return Err(Error::InvalidArgument {
                arg: "dropout.prob",
                reason: format!("must be in [0, 1], got {}", d.prob),
            });
        }
    }

    check_rows(
        p,
        "query",
        p.query.data.len(),
        &p.query.strides,
        Axis::Query,
        s.head_dim,
    )?;
    check_rows(
        p,
        "key",
        p.key.data.len(),
        &p.key.strides,
        Axis::Key,
        s.head_dim,
    )?;
    check_rows(
        p,
        "value",
        p.value.data.len(),
        &p.value.strides,
        Axis::Key,
        s.value_dim,
    )?;

    for (arg, bias) in [("bias_a", &p.bias_a), ("bias_b", &p.bias_b)] {
        if let Some(b) = bias {
            b.layout.validate(arg, s)?;
            check_len(arg, b.layout.required_len(s), b.data.len())?;
        }
    }
    Ok(())
}

/// Check the saved forward tensors of a backward launch.
pub(crate) fn check_saved<T>(inputs: &BackwardInputs<'_, T>) -> Result<()> {
    let p = &inputs.problem;
    let dv = p.shape.value_dim;
    check_rows(
        p,
        "output",
        inputs.output.data.len(),
        &inputs.output.strides,
        Axis::Query,
        dv,
    )?;
    check_rows(
        p,
        "grad_output",
        inputs.grad_output.data.len(),
        &inputs.grad_output.strides,
        Axis::Query,
        dv,
    )?;

    let lse = &inputs.logsumexp;
    for (what, value) in [
        ("batch_stride", lse.batch_stride),
        ("head_stride", lse.head_stride),
    ] {
        if value % LSE_ALIGNMENT != 0 {
            return Err(Error::Misaligned {
                tensor: "logsumexp",
                what,
                value,
                alignment: LSE_ALIGNMENT,
            });
        }
    }
    let s = &p.shape;
    let required = (s.batch - 1) * lse.batch_stride + (s.heads - 1) * lse.head_stride + s.seq_q;
    check_len("logsumexp", required, lse.data.len())
}

/// Check gradient destinations against the inputs they differentiate.
pub(crate) fn check_outputs<T>(
    inputs: &BackwardInputs<'_, T>,
    outputs: &BackwardOutputs<'_, T>,
) -> Result<()> {
    let p = &inputs.problem;
    let s = &p.shape;
    check_rows(
        p,
        "grad_query",
        outputs.grad_query.data.len(),
        &outputs.grad_query.strides,
        Axis::Query,
        s.head_dim,
    )?;
    check_rows(
        p,
        "grad_key",
        outputs.grad_key.data.len(),
        &outputs.grad_key.strides,
        Axis::Key,
        s.head_dim,
    )?;
    check_rows(
        p,
        "grad_value",
        outputs.grad_value.data.len(),
        &outputs.grad_value.strides,
        Axis::Key,
        s.value_dim,
    )?;

    for (arg, bias, grad) in [
        ("grad_bias_a", &p.bias_a, outputs.grad_bias_a.as_deref()),
        ("grad_bias_b", &p.bias_b, outputs.grad_bias_b.as_deref()),
    ] {
        match (bias, grad) {
            (Some(b), Some(g)) => check_len(arg, b.layout.required_len(s), g.len())?,
            (None, Some(_)) => {
                return Err(Error::InvalidArgument {
                    arg,
                    reason: "gradient requested for a bias that was not supplied".into(),
                })
            }
            _ => {}
        }
    }
    Ok(())
}

#[derive(Clone, Copy)]
enum Axis {
    Query,
    Key,
}

fn check_rows<T>(
    p: &AttentionInputs<'_, T>,
    tensor: &'static str,
    len: usize,
    strides: &Strides,
    axis: Axis,
    width: usize,
) -> Result<()> {
    let s = &p.shape;
    let required = match (&p.varlen, axis) {
        (Some(v), Axis::Query) => packed_len(strides, s.heads, v.cu_seqlens_q, width),
        (Some(v), Axis::Key) => packed_len(strides, s.heads, v.cu_seqlens_k, width),
        (None, Axis::Query) => required_len(strides, s.batch, s.heads, s.seq_q, width),
        (None, Axis::Key) => required_len(strides, s.batch, s.heads, s.seq_k, width),
    };
    check_len(tensor, required, len)
}

fn packed_len(strides: &Strides, heads: usize, cu: &[i32], width: usize) -> usize {
    let total = cu.last().copied().unwrap_or(0).max(1) as usize;
    required_len(strides, 1, heads, total, width)
}

fn check_len(tensor: &'static str, required: usize, len: usize) -> Result<()> {
    if required > len {
        return Err(Error::OutOfBounds {
            tensor,
            required,
            len,
        });
    }
    Ok(())
}
