//! Backend parity tests for the fused attention backward.

use super::helpers::*;
use flashgrad::ops::traits::AttentionBackwardOps;
use flashgrad::tensor::ProblemShape;
use flashgrad::{
    AccumMode, DenseAttentionBackward, FusedAttentionBackward, KernelConfig, Prologue,
    ScoreGradLayout,
};
use half::{bf16, f16};
use proptest::prelude::*;

fn fused(config: KernelConfig) -> FusedAttentionBackward {
    FusedAttentionBackward::new(config).unwrap()
}

#[test]
fn test_worked_example_5x5_within_1e3() {
    let fx = Fixture::<f32>::dense(ProblemShape::new(1, 1, 5, 4)).with_scale(0.5);
    let cfg = KernelConfig::default().with_tiles(4, 4).with_max_k(4);
    let got = fx.backward(&fused(cfg));
    let reference = fx.backward(&DenseAttentionBackward);
    got.assert_parity(&reference, "5x5", 1e-3, 1e-6);
}

#[test]
fn test_single_tile_matches_dense() {
    let fx = Fixture::<f32>::dense(ProblemShape::new(2, 3, 8, 8));
    let cfg = KernelConfig::default().with_tiles(8, 8).with_max_k(8);
    let reference = fx.backward(&DenseAttentionBackward);
    let got = fx.backward(&fused(cfg));
    got.assert_parity(&reference, "single tile", 1e-4, 1e-6);
}

#[test]
fn test_ragged_tiles_match_dense() {
    let fx = Fixture::<f32>::dense(ProblemShape::new(1, 2, 13, 8).with_seq_k(7));
    let reference = fx.backward(&DenseAttentionBackward);
    for (bi, bj) in [(4, 4), (3, 5), (16, 2), (1, 7)] {
        let cfg = KernelConfig::default().with_tiles(bi, bj).with_max_k(8);
        let got = fx.backward(&fused(cfg));
        got.assert_parity(&reference, &format!("ragged {bi}x{bj}"), 1e-4, 1e-6);
    }
}

#[test]
fn test_value_dim_differs_from_head_dim() {
    let shape = ProblemShape::new(1, 2, 9, 8)
        .with_seq_k(10)
        .with_value_dim(12);
    let fx = Fixture::<f32>::dense(shape);
    let cfg = KernelConfig::default().with_tiles(4, 4).with_max_k(12);
    let reference = fx.backward(&DenseAttentionBackward);
    let got = fx.backward(&fused(cfg));
    got.assert_parity(&reference, "value_dim", 1e-4, 1e-6);
}

#[test]
fn test_causal_matches_dense() {
    let fx = Fixture::<f32>::dense(ProblemShape::new(2, 2, 13, 8).with_seq_k(13)).causal();
    let reference = fx.backward(&DenseAttentionBackward);
    for (bi, bj) in [(4, 8), (8, 4), (4, 4), (5, 3)] {
        let cfg = KernelConfig::default().with_tiles(bi, bj).with_max_k(8);
        let got = fx.backward(&fused(cfg));
        got.assert_parity(&reference, &format!("causal {bi}x{bj}"), 1e-4, 1e-6);
    }
}

#[test]
fn test_key_tiles_without_queries_are_zero_filled() {
    // Lq = 4 < Lk = 12 with a top-left causal mask: key tiles at 4 and 8 see
    // no query at all. Outputs start as NaN, so a skipped tile would show.
    let fx = Fixture::<f32>::dense(ProblemShape::new(1, 1, 4, 4).with_seq_k(12)).causal();
    let cfg = KernelConfig::default().with_tiles(4, 4).with_max_k(4);
    let got = fx.backward(&fused(cfg));
    assert!(got.dk[4 * 4..].iter().all(|&x| x == 0.0));
    assert!(got.dv[4 * 4..].iter().all(|&x| x == 0.0));
    assert!(got.dq.iter().all(|x| x.is_finite()));
    let reference = fx.backward(&DenseAttentionBackward);
    got.assert_parity(&reference, "zero fill", 1e-4, 1e-6);
}

#[test]
fn test_accumulation_modes_identical() {
    let fx = Fixture::<f32>::dense(ProblemShape::new(1, 2, 13, 8).with_seq_k(10));
    let base = KernelConfig::default().with_tiles(8, 4).with_max_k(8);
    let reference = fx.backward(&fused(base.clone()));
    for kv in [
        AccumMode::InRegister,
        AccumMode::InMemory,
        AccumMode::InOutput,
    ] {
        for q in [AccumMode::InMemory, AccumMode::InOutput] {
            let cfg = base.clone().with_key_value_accum(kv).with_query_accum(q);
            fx.backward(&fused(cfg))
                .assert_identical(&reference, &format!("kv {kv:?} / q {q:?}"));
        }
    }
}

#[test]
fn test_chunked_accumulators_identical() {
    // max_k > block_i splits the key/value accumulators into column chunks;
    // max_k > block_j does the same for the query accumulator.
    let fx = Fixture::<f32>::dense(ProblemShape::new(1, 1, 11, 16).with_seq_k(9));
    let wide = KernelConfig::default().with_tiles(4, 4).with_max_k(16);
    let spilled = wide.clone().with_key_value_accum(AccumMode::InMemory);
    let a = fx.backward(&fused(spilled));
    let b = fx.backward(&fused(wide.with_key_value_accum(AccumMode::InOutput)));
    a.assert_identical(&b, "chunked");
    let reference = fx.backward(&DenseAttentionBackward);
    a.assert_parity(&reference, "chunked vs dense", 1e-4, 1e-6);
}

#[test]
fn test_score_grad_layouts_identical() {
    let fx = Fixture::<f32>::dense(ProblemShape::new(2, 1, 9, 8).with_seq_k(11)).causal();
    let base = KernelConfig::default().with_tiles(4, 4).with_max_k(8);
    let run = |layout| fx.backward(&fused(base.clone().with_score_grad_layout(layout)));
    let km = run(ScoreGradLayout::KeyMajor);
    let qm = run(ScoreGradLayout::QueryMajor);
    km.assert_identical(&qm, "layouts");
}

#[test]
fn test_prologue_prefetch_identical() {
    let fx = Fixture::<f32>::dense(ProblemShape::new(1, 2, 17, 8).with_seq_k(12)).causal();
    let base = KernelConfig::default()
        .with_tiles(8, 4)
        .with_max_k(8)
        .with_key_value_accum(AccumMode::InRegister);
    let plain = fx.backward(&fused(base.clone()));
    for preload in [
        Prologue::all(),
        Prologue {
            query: true,
            ..Prologue::default()
        },
        Prologue {
            key_value: true,
            ..Prologue::default()
        },
    ] {
        fx.backward(&fused(base.clone().with_preload(preload)))
            .assert_identical(&plain, &format!("{preload:?}"));
    }
}

#[test]
fn test_many_instances_are_deterministic() {
    // More instances than one wave holds, so staging buffers are reused.
    let fx = Fixture::<f32>::dense(ProblemShape::new(5, 7, 6, 4).with_seq_k(9));
    let cfg = KernelConfig::default().with_tiles(4, 4).with_max_k(4);
    let a = fx.backward(&fused(cfg.clone()));
    let b = fx.backward(&fused(cfg));
    a.assert_identical(&b, "rerun");
    let reference = fx.backward(&DenseAttentionBackward);
    a.assert_parity(&reference, "many instances", 1e-4, 1e-6);
}

#[test]
fn test_f16_matches_dense() {
    let fx = Fixture::<f16>::dense(ProblemShape::new(1, 2, 12, 8).with_seq_k(10));
    let reference = fx.backward(&DenseAttentionBackward);
    // In-register key/value (max_k <= block_i) and spilled key/value.
    for cfg in [
        KernelConfig::default().with_tiles(8, 4).with_max_k(8),
        KernelConfig::default().with_tiles(4, 4).with_max_k(8),
    ] {
        let got = fx.backward(&fused(cfg));
        got.assert_parity(&reference, "f16", 1e-2, 2e-3);
    }
}

#[test]
fn test_bf16_matches_dense() {
    let fx = Fixture::<bf16>::dense(ProblemShape::new(1, 1, 9, 8).with_seq_k(9)).causal();
    let cfg = KernelConfig::default().with_tiles(4, 4).with_max_k(8);
    let reference = fx.backward(&DenseAttentionBackward);
    let got = fx.backward(&fused(cfg));
    got.assert_parity(&reference, "bf16", 3e-2, 8e-3);
}

#[test]
fn test_workspace_len_follows_plan() {
    let shape = ProblemShape::new(2, 3, 100, 64).with_seq_k(130);
    let op = fused(KernelConfig::default().with_max_k(64));
    // f16, key/value in registers: only the query plane spills.
    let ws = AttentionBackwardOps::<f16>::workspace_len(&op, &shape).unwrap();
    assert_eq!(ws, 6 * (128 * 64));
    // f32 accumulates in the outputs.
    let ws = AttentionBackwardOps::<f32>::workspace_len(&op, &shape).unwrap();
    assert_eq!(ws, 0);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Tile shape changes accumulation order only.
    #[test]
    fn prop_tiling_invariance(bi in 1usize..=9, bj in 1usize..=9, causal in any::<bool>()) {
        let mut fx = Fixture::<f32>::dense(ProblemShape::new(1, 2, 11, 8).with_seq_k(9));
        if causal {
            fx = fx.causal();
        }
        let reference = fx.backward(&fused(KernelConfig::default().with_max_k(8)));
        let cfg = KernelConfig::default().with_tiles(bi, bj).with_max_k(8);
        let got = fx.backward(&fused(cfg));
        got.assert_parity(&reference, &format!("tiles {bi}x{bj}"), 1e-4, 1e-6);
    }
}
