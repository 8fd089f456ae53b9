//! Launch-time validation for the fused kernel.
//!
//! Runs the shared contract checks, resolves the plan, then checks what this
//! kernel adds on top: enable flags, vector-width alignment and workspace size.
//! Nothing is written before every check has passed.

use super::plan::KernelPlan;
use crate::config::KernelConfig;
use crate::dtype::Element;
use crate::error::{Error, Result};
use crate::ops::traits::attention::checks::{check_outputs, check_problem, check_saved};
use crate::ops::traits::{BackwardInputs, BackwardOutputs};
use crate::tensor::Strides;

pub(super) fn check_launch<T: Element>(
    config: &KernelConfig,
    inputs: &BackwardInputs<'_, T>,
    outputs: &BackwardOutputs<'_, T>,
    workspace_len: usize,
) -> Result<KernelPlan> {
    let p = &inputs.problem;
    check_problem(p)?;
    check_saved(inputs)?;
    check_outputs(inputs, outputs)?;

    let plan = KernelPlan::resolve::<T>(config, &p.shape)?;
    check_flags(config, inputs)?;
    if config.aligned {
        check_alignment(inputs, outputs)?;
    }

    let required = plan.workspace.total(&p.shape);
    if workspace_len < required {
        return Err(Error::WorkspaceTooSmall {
            required,
            got: workspace_len,
        });
    }
    Ok(plan)
}

fn check_flags<T>(config: &KernelConfig, inputs: &BackwardInputs<'_, T>) -> Result<()> {
    let p = &inputs.problem;
    if let Some(d) = &p.dropout {
        if d.prob > 0.0 && !config.apply_dropout {
            return Err(Error::InvalidConfig {
                reason: format!("dropout probability {} with dropout disabled", d.prob),
            });
        }
    }
    for (name, enabled, supplied) in [
        ("bias_a", config.bias_a, p.bias_a.is_some()),
        ("bias_b", config.bias_b, p.bias_b.is_some()),
    ] {
        if enabled != supplied {
            let reason = if enabled {
                format!("{name} is enabled but no {name} input was supplied")
            } else {
                format!("{name} input supplied but {name} is disabled")
            };
            return Err(Error::InvalidConfig { reason });
        }
    }
    Ok(())
}

fn check_alignment<T: Element>(
    inputs: &BackwardInputs<'_, T>,
    outputs: &BackwardOutputs<'_, T>,
) -> Result<()> {
    let packed = inputs.problem.varlen.is_some();
    let p = &inputs.problem;
    for (tensor, data, strides) in [
        ("query", p.query.data, &p.query.strides),
        ("key", p.key.data, &p.key.strides),
        ("value", p.value.data, &p.value.strides),
        ("output", inputs.output.data, &inputs.output.strides),
        ("grad_output", inputs.grad_output.data, &inputs.grad_output.strides),
        ("grad_query", &*outputs.grad_query.data, &outputs.grad_query.strides),
        ("grad_key", &*outputs.grad_key.data, &outputs.grad_key.strides),
        ("grad_value", &*outputs.grad_value.data, &outputs.grad_value.strides),
    ] {
        check_base(tensor, data)?;
        check_strides(tensor, strides, T::VECTOR_WIDTH, packed)?;
    }
    Ok(())
}

/// The first element must sit on a vector boundary.
fn check_base<T: Element>(tensor: &'static str, data: &[T]) -> Result<()> {
    let alignment = T::VECTOR_WIDTH * std::mem::size_of::<T>();
    let value = data.as_ptr() as usize;
    if value % alignment != 0 {
        return Err(Error::Misaligned {
            tensor,
            what: "base address",
            value,
            alignment,
        });
    }
    Ok(())
}

fn check_strides(tensor: &'static str, s: &Strides, alignment: usize, packed: bool) -> Result<()> {
    let mut checks = vec![("row stride", s.row), ("head stride", s.head)];
    if !packed {
        checks.push(("batch stride", s.batch));
    }
    for (what, value) in checks {
        if value % alignment != 0 {
            return Err(Error::Misaligned {
                tensor,
                what,
                value,
                alignment,
            });
        }
    }
    Ok(())
}
