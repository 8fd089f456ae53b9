//! Backend parity tests for attention dropout.

use super::helpers::*;
use flashgrad::tensor::ProblemShape;
use flashgrad::{DenseAttentionBackward, DropoutParams, FusedAttentionBackward, KernelConfig};

fn fused(config: KernelConfig) -> FusedAttentionBackward {
    FusedAttentionBackward::new(config).unwrap()
}

fn with_dropout(bi: usize, bj: usize, max_k: usize) -> FusedAttentionBackward {
    let cfg = KernelConfig::default()
        .with_tiles(bi, bj)
        .with_max_k(max_k)
        .with_dropout(true);
    fused(cfg)
}

#[test]
fn test_zero_dropout_identical_to_disabled() {
    let shape = ProblemShape::new(2, 2, 9, 8).with_seq_k(7);
    let plain = Fixture::<f32>::dense(shape);
    let zero = Fixture::<f32>::dense(shape).with_dropout(DropoutParams::new(0.0, 1234));
    let cfg = KernelConfig::default().with_tiles(4, 4).with_max_k(8);

    let off = plain.backward(&fused(cfg.clone()));
    let on = zero.backward(&fused(cfg.clone().with_dropout(true)));
    let flag_off = zero.backward(&fused(cfg));
    on.assert_identical(&off, "p=0 with dropout enabled");
    flag_off.assert_identical(&off, "p=0 with dropout disabled");
}

#[test]
fn test_dropout_matches_dense() {
    let shape = ProblemShape::new(1, 2, 10, 8).with_seq_k(11);
    let params = DropoutParams::new(0.25, 0xDEAD_BEEF).with_offset(17);
    let fx = Fixture::<f32>::dense(shape).with_dropout(params);
    let reference = fx.backward(&DenseAttentionBackward);
    let got = fx.backward(&with_dropout(4, 4, 8));
    got.assert_parity(&reference, "dropout", 1e-4, 1e-6);
}

#[test]
fn test_dropout_without_rescale_matches_dense() {
    let shape = ProblemShape::new(1, 1, 8, 4).with_seq_k(8);
    let params = DropoutParams::new(0.5, 9).with_rescale(false);
    let fx = Fixture::<f32>::dense(shape).causal().with_dropout(params);
    let reference = fx.backward(&DenseAttentionBackward);
    let got = fx.backward(&with_dropout(4, 4, 4));
    got.assert_parity(&reference, "no rescale", 1e-4, 1e-6);
}

#[test]
fn test_dropout_is_tiling_invariant() {
    let shape = ProblemShape::new(1, 1, 12, 8).with_seq_k(12);
    let fx = Fixture::<f32>::dense(shape).with_dropout(DropoutParams::new(0.1, 42));
    let a = fx.backward(&with_dropout(4, 4, 8));
    let b = fx.backward(&with_dropout(8, 3, 8));
    a.assert_parity(&b, "dropout tiles", 1e-4, 1e-6);
}

#[test]
fn test_everything_dropped_gives_zero_gradients() {
    let shape = ProblemShape::new(1, 1, 6, 4).with_seq_k(6);
    let fx = Fixture::<f32>::dense(shape).with_dropout(DropoutParams::new(1.0, 3));
    let g = fx.backward(&with_dropout(4, 4, 4));
    for v in g.dq.iter().chain(&g.dk).chain(&g.dv) {
        assert_eq!(*v, 0.0);
    }
}
