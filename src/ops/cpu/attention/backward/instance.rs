//! Per-instance scratch state and the serial scatter to caller outputs.
//!
//! Every in-flight (batch, head) instance owns one [`InstanceState`]. Its
//! gradients are staged densely (`seq x width`) so concurrent instances never
//! write caller memory; the wave's owner copies them out afterwards.

use super::arena::Arena;
use super::plan::KernelPlan;
use super::score_grad::BiasGradStage;
use crate::dtype::Element;
use crate::ops::traits::{BackwardInputs, BackwardOutputs, BiasLayout};
use crate::tensor::{HeadCoord, TensorMut};

/// Register-resident tiles of one instance.
#[derive(Debug)]
pub(super) struct Registers {
    /// `block_i x block_j` score product `dO · Vᵀ`.
    pub dp: Vec<f32>,
    /// `block_j x max_k` resident key-gradient accumulator.
    pub key_res: Vec<f32>,
    /// `block_j x max_k` resident value-gradient accumulator.
    pub value_res: Vec<f32>,
    /// `block_j x kv_chunk` chunk fragment.
    pub kv_frag: Vec<f32>,
    /// `block_i x q_chunk` chunk fragment.
    pub q_frag: Vec<f32>,
}

/// What the previous iteration already staged into the prefetch regions.
#[derive(Debug, Default, Clone, Copy)]
pub(super) struct Prefetched {
    pub query: bool,
    pub output_grad: bool,
    pub key_value: bool,
}

#[derive(Debug)]
pub(super) struct InstanceState<T> {
    pub arena: Arena,
    pub regs: Registers,
    pub delta: Vec<f32>,
    pub grad_q: Vec<T>,
    pub grad_k: Vec<T>,
    pub grad_v: Vec<T>,
    pub bias_a: Option<BiasGradStage>,
    pub bias_b: Option<BiasGradStage>,
    pub prefetched: Prefetched,
    /// Sequence lengths of the instance last run, bounding the staged rows.
    pub seq: (usize, usize),
}

impl<T: Element> InstanceState<T> {
    pub fn new(
        plan: &KernelPlan,
        inputs: &BackwardInputs<'_, T>,
        want_a: bool,
        want_b: bool,
    ) -> Self {
        let s = &inputs.problem.shape;
        let (i, j, k) = (plan.block_i, plan.block_j, plan.max_k);
        let stage = |bias: Option<BiasLayout>, want: bool| {
            let layout = bias.filter(|_| want)?;
            Some(BiasGradStage::new(layout, s.seq_q, s.seq_k))
        };
        Self {
            arena: Arena::new(plan.arena.clone()),
            regs: Registers {
                dp: vec![0.0; i * j],
                key_res: vec![0.0; j * k],
                value_res: vec![0.0; j * k],
                kv_frag: vec![0.0; j * plan.kv_chunk],
                q_frag: vec![0.0; i * plan.q_chunk],
            },
            delta: vec![0.0; s.seq_q],
            grad_q: vec![T::default(); s.seq_q * s.head_dim],
            grad_k: vec![T::default(); s.seq_k * s.head_dim],
            grad_v: vec![T::default(); s.seq_k * s.value_dim],
            bias_a: stage(inputs.problem.bias_a.map(|b| b.layout), want_a),
            bias_b: stage(inputs.problem.bias_b.map(|b| b.layout), want_b),
            prefetched: Prefetched::default(),
            seq: (0, 0),
        }
    }

    /// Copy this instance's staged gradients into the caller's tensors and
    /// add its bias-gradient planes.
    pub fn scatter(
        &self,
        inputs: &BackwardInputs<'_, T>,
        outputs: &mut BackwardOutputs<'_, T>,
        coord: HeadCoord,
    ) {
        let p = &inputs.problem;
        let (q0, _, k0, _) = p.spans(coord.batch);
        let (lq, lk) = self.seq;
        let packed = p.varlen.is_some();
        let (d, dv) = (p.shape.head_dim, p.shape.value_dim);

        let gq = &self.grad_q[..lq * d];
        copy_rows(&mut outputs.grad_query, coord, q0, packed, gq, d);
        let gk = &self.grad_k[..lk * d];
        copy_rows(&mut outputs.grad_key, coord, k0, packed, gk, d);
        let gv = &self.grad_v[..lk * dv];
        copy_rows(&mut outputs.grad_value, coord, k0, packed, gv, dv);

        for (stage, grad) in [
            (&self.bias_a, outputs.grad_bias_a.as_deref_mut()),
            (&self.bias_b, outputs.grad_bias_b.as_deref_mut()),
        ] {
            if let (Some(st), Some(g)) = (stage, grad) {
                let base = st.layout.base(coord);
                for q in 0..st.q_ext {
                    for k in 0..st.k_ext {
                        g[base + st.layout.offset(q, k)] += st.data[q * st.k_ext + k];
                    }
                }
            }
        }
    }
}

fn copy_rows<T: Element>(
    dst: &mut TensorMut<'_, T>,
    coord: HeadCoord,
    row0: usize,
    packed: bool,
    src: &[T],
    width: usize,
) {
    for (r, vals) in src.chunks_exact(width).enumerate() {
        let start = dst.strides.row_offset(coord, row0 + r, packed);
        dst.data[start..start + width].copy_from_slice(vals);
    }
}
