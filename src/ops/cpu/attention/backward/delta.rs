//! Per-row correction term `Δ[q] = Σ_f O[q, f] · dO[q, f]`.

use crate::dtype::Element;
use crate::ops::traits::SavedRows;

/// Fill `delta[..seq_q]`. Accumulates in f64 whatever the storage type.
pub(super) fn compute<T: Element>(saved: &SavedRows<'_, T>, seq_q: usize, delta: &mut [f32]) {
    for (q, d) in delta[..seq_q].iter_mut().enumerate() {
        let sum: f64 = saved
            .output
            .row(q)
            .iter()
            .zip(saved.grad_output.row(q))
            .map(|(o, g)| f64::from(o.to_f32()) * f64::from(g.to_f32()))
            .sum();
        *d = sum as f32;
    }
}
