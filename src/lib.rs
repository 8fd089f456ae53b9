//! # flashgrad
//!
//! **Tiled, fused backward pass for scaled dot-product attention.**
//!
//! Given the forward inputs `Q`, `K`, `V`, the forward output `O`, the saved
//! per-row log-sum-exp and the upstream gradient `dO`, flashgrad computes
//! `dQ`, `dK`, `dV` (and optional bias gradients) without ever materializing
//! the full `Lq x Lk` attention matrix. Attention weights are recomputed one
//! `block_j x block_i` tile at a time from the saved log-sum-exp.
//!
//! ## Layers
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │  AttentionBackwardOps                                   │
//! │    FusedAttentionBackward   DenseAttentionBackward      │
//! │    (tiled, rayon waves)     (untiled f64 reference)     │
//! └──────────────┬──────────────────────────────────────────┘
//!                │ KernelPlan: modes, arena, workspace
//! ┌──────────────▼──────────────────────────────────────────┐
//! │  MmaEngine: NaiveMma / PackedMma (SIMD dot)             │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Design
//!
//! - **Borrowed views**: every tensor is a caller-owned slice plus strides
//!   ([`tensor::TensorRef`]); nothing is copied up front.
//! - **Storage types**: `f32`, `f16` and `bf16` via [`dtype::Element`];
//!   accumulation is always `f32`.
//! - **Launch-time validation**: every precondition is checked before the
//!   first tile; failures return [`Error`] and leave outputs untouched.

pub mod config;
pub mod dtype;
pub mod error;
pub mod ops;
pub mod tensor;

pub use config::{AccumMode, KernelConfig, Prologue, ScoreGradLayout};
pub use dtype::Element;
pub use error::{Error, Result};
pub use ops::{
    attention_forward, AttentionBackwardOps, AttentionInputs, BackwardInputs, BackwardOutputs,
    BiasLayout, BiasRef, DenseAttentionBackward, DropoutParams, FusedAttentionBackward, MaskPolicy,
};
pub use tensor::{HeadCoord, LseMut, LseRef, ProblemShape, Strides, TensorMut, TensorRef, VarLen};
