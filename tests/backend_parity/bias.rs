//! Backend parity tests for score biases and their gradients.

use super::helpers::*;
use flashgrad::tensor::ProblemShape;
use flashgrad::{BiasLayout, DenseAttentionBackward, FusedAttentionBackward, KernelConfig};

fn fused(config: KernelConfig) -> FusedAttentionBackward {
    FusedAttentionBackward::new(config).unwrap()
}

#[test]
fn test_per_query_bias_matches_dense() {
    let shape = ProblemShape::new(2, 3, 9, 8).with_seq_k(6);
    let fx = Fixture::<f32>::dense(shape).with_bias_a(BiasLayout::per_query(shape.seq_q));
    let cfg = KernelConfig::default()
        .with_tiles(4, 4)
        .with_max_k(8)
        .with_bias(true, false);
    let got = fx.backward(&fused(cfg));
    let reference = fx.backward(&DenseAttentionBackward);
    got.assert_parity(&reference, "per_query", 1e-4, 1e-6);
    assert_eq!(got.dbias_a.as_ref().map(Vec::len), Some(2 * 9));
}

#[test]
fn test_pairwise_grouped_bias_matches_dense() {
    let shape = ProblemShape::new(4, 2, 7, 8).with_seq_k(10);
    let layout = BiasLayout::pairwise(2, shape.heads, shape.seq_q, shape.seq_k);
    let fx = Fixture::<f32>::dense(shape).with_bias_b(layout).causal();
    let cfg = KernelConfig::default()
        .with_tiles(4, 4)
        .with_max_k(8)
        .with_bias(false, true);
    let reference = fx.backward(&DenseAttentionBackward);
    let got = fx.backward(&fused(cfg));
    got.assert_parity(&reference, "pairwise", 1e-4, 1e-5);
}

#[test]
fn test_both_biases_matches_dense() {
    let shape = ProblemShape::new(2, 2, 10, 8).with_seq_k(10);
    let pairwise = BiasLayout::pairwise(1, shape.heads, shape.seq_q, shape.seq_k);
    let fx = Fixture::<f32>::dense(shape)
        .with_bias_a(BiasLayout::per_key(shape.seq_k))
        .with_bias_b(pairwise);
    let cfg = KernelConfig::default()
        .with_tiles(4, 8)
        .with_max_k(8)
        .with_bias(true, true);
    let reference = fx.backward(&DenseAttentionBackward);
    let got = fx.backward(&fused(cfg));
    got.assert_parity(&reference, "both", 1e-4, 1e-5);
}

#[test]
fn test_scalar_bias_gradient_vanishes() {
    // A scalar bias shifts every score equally; softmax is invariant to it,
    // so its gradient vanishes.
    let shape = ProblemShape::new(1, 2, 8, 4).with_seq_k(8);
    let scalar = BiasLayout {
        group_size: 1,
        group: 0,
        member: 0,
        head: 0,
        query: 0,
        key: 0,
    };
    let fx = Fixture::<f32>::dense(shape).with_bias_a(scalar);
    let cfg = KernelConfig::default()
        .with_tiles(4, 4)
        .with_max_k(4)
        .with_bias(true, false);
    let g = fx.backward(&fused(cfg));
    let db = g.dbias_a.unwrap();
    assert_eq!(db.len(), 1);
    assert!(db[0].abs() < 1e-5, "{}", db[0]);
}

fn weighted_output(fx: &Fixture<f32>) -> f64 {
    let (o, _) = fx.forward().unwrap();
    o.iter()
        .zip(&fx.go)
        .map(|(&a, &b)| f64::from(a) * f64::from(b))
        .sum()
}

fn set_bias_b(fx: &mut Fixture<f32>, i: usize, value: f32) {
    if let Some((data, _)) = fx.bias_b.as_mut() {
        data[i] = value;
    }
}

/// Central differences of `L = Σ O ⊙ dO` with respect to every bias element.
#[test]
fn test_bias_gradient_matches_finite_differences() {
    let shape = ProblemShape::new(1, 2, 5, 4).with_seq_k(6);
    let layout = BiasLayout::pairwise(1, shape.heads, shape.seq_q, shape.seq_k);
    let mut fx = Fixture::<f32>::dense(shape).with_bias_b(layout).causal();
    let cfg = KernelConfig::default()
        .with_tiles(2, 4)
        .with_max_k(4)
        .with_bias(false, true);
    let analytic = fx.backward(&fused(cfg)).dbias_b.unwrap();
    assert_eq!(analytic.len(), 2 * 5 * 6);

    let eps = 1e-2f32;
    for (i, &a) in analytic.iter().enumerate() {
        let (q, k) = ((i / 6) % 5, i % 6);
        if k > q {
            assert_eq!(a, 0.0, "masked bias element {i} has gradient {a}");
            continue;
        }
        let orig = fx.bias_b.as_ref().unwrap().0[i];
        set_bias_b(&mut fx, i, orig + eps);
        let plus = weighted_output(&fx);
        set_bias_b(&mut fx, i, orig - eps);
        let minus = weighted_output(&fx);
        set_bias_b(&mut fx, i, orig);

        let numeric = (plus - minus) / (2.0 * f64::from(eps));
        let a = f64::from(a);
        assert!(
            (a - numeric).abs() < 2e-3 + 1e-2 * numeric.abs(),
            "dbias_b[{i}] (q={q}, k={k}): analytic {a}, numeric {numeric}"
        );
    }
}
