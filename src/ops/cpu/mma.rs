//! CPU tile multiply-accumulate engines.

use std::cell::RefCell;

use super::kernels::simd::dot_f32;
use crate::ops::traits::{MatRef, MmaEngine};

/// Straight triple loop, reducing `p` in ascending order per output element.
#[derive(Debug, Clone, Copy, Default)]
pub struct NaiveMma;

impl MmaEngine for NaiveMma {
    fn mma(&self, a: MatRef<'_>, b: MatRef<'_>, acc: &mut [f32], ld: usize) {
        debug_assert_eq!(a.cols(), b.rows());
        let (m, k, n) = (a.rows(), a.cols(), b.cols());
        for i in 0..m {
            let row = &mut acc[i * ld..i * ld + n];
            for (j, out) in row.iter_mut().enumerate() {
                let mut s = *out;
                for p in 0..k {
                    s += a.get(i, p) * b.get(p, j);
                }
                *out = s;
            }
        }
    }
}

/// Packed `A` and `B` panels.
type Panels = (Vec<f32>, Vec<f32>);

thread_local! {
    /// Reused by every call on the same worker.
    static PANELS: RefCell<Panels> = const { RefCell::new((Vec::new(), Vec::new())) };
}

/// Packs `A` by rows and `B` by columns into contiguous panels, then reduces
/// each output element with a SIMD dot product.
#[derive(Debug, Clone, Copy, Default)]
pub struct PackedMma;

impl MmaEngine for PackedMma {
    fn mma(&self, a: MatRef<'_>, b: MatRef<'_>, acc: &mut [f32], ld: usize) {
        debug_assert_eq!(a.cols(), b.rows());
        let (m, k, n) = (a.rows(), a.cols(), b.cols());
        if m == 0 || n == 0 || k == 0 {
            return;
        }

        PANELS.with(|cell| {
            let (a_panel, b_panel) = &mut *cell.borrow_mut();
            pack_rows(a, m, k, a_panel);
            pack_rows(b.t(), n, k, b_panel);

            for i in 0..m {
                let a_row = &a_panel[i * k..(i + 1) * k];
                let out = &mut acc[i * ld..i * ld + n];
                for (j, o) in out.iter_mut().enumerate() {
                    *o += dot_f32(a_row, &b_panel[j * k..(j + 1) * k]);
                }
            }
        });
    }
}

/// Copy `rows × cols` of a view into a dense row-major panel.
fn pack_rows(v: MatRef<'_>, rows: usize, cols: usize, panel: &mut Vec<f32>) {
    panel.resize(rows * cols, 0.0);
    for (i, dst) in panel.chunks_exact_mut(cols).enumerate() {
        match v.dense_row(i) {
            Some(src) => dst.copy_from_slice(src),
            None => {
                for (p, d) in dst.iter_mut().enumerate() {
                    *d = v.get(i, p);
                }
            }
        }
    }
}
