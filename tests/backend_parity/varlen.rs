//! Backend parity tests for packed variable-length batches.

use super::helpers::*;
use flashgrad::tensor::ProblemShape;
use flashgrad::{
    AccumMode, BiasLayout, DenseAttentionBackward, FusedAttentionBackward, KernelConfig,
};
use half::f16;

fn fused(config: KernelConfig) -> FusedAttentionBackward {
    FusedAttentionBackward::new(config).unwrap()
}

#[test]
fn test_varlen_matches_dense() {
    let shape = ProblemShape::new(2, 2, 7, 8).with_seq_k(7);
    let fx = Fixture::<f32>::packed(shape, vec![0, 5, 12], vec![0, 7, 10]);
    let cfg = KernelConfig::default().with_tiles(4, 4).with_max_k(8);
    let reference = fx.backward(&DenseAttentionBackward);
    let got = fx.backward(&fused(cfg));
    got.assert_parity(&reference, "varlen", 1e-4, 1e-6);
}

#[test]
fn test_varlen_causal_with_bias_matches_dense() {
    let shape = ProblemShape::new(3, 2, 6, 8).with_seq_k(9);
    let fx = Fixture::<f32>::packed(shape, vec![0, 6, 8, 13], vec![0, 9, 12, 17])
        .causal()
        .with_bias_a(BiasLayout::per_query(shape.seq_q));
    let cfg = KernelConfig::default()
        .with_tiles(4, 4)
        .with_max_k(8)
        .with_bias(true, false)
        .with_query_accum(AccumMode::InMemory)
        .with_key_value_accum(AccumMode::InMemory);
    let reference = fx.backward(&DenseAttentionBackward);
    let got = fx.backward(&fused(cfg));
    got.assert_parity(&reference, "varlen causal", 1e-4, 1e-6);
}

#[test]
fn test_varlen_f16_matches_dense() {
    let shape = ProblemShape::new(2, 1, 9, 8).with_seq_k(9);
    let fx = Fixture::<f16>::packed(shape, vec![0, 9, 12], vec![0, 4, 13]);
    let cfg = KernelConfig::default().with_tiles(8, 4).with_max_k(8);
    let reference = fx.backward(&DenseAttentionBackward);
    let got = fx.backward(&fused(cfg));
    got.assert_parity(&reference, "varlen f16", 1e-2, 2e-3);
}
