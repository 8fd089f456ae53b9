pub mod cpu;
pub mod impl_generic;
pub mod traits;

pub use cpu::{FusedAttentionBackward, NaiveMma, PackedMma};
pub use impl_generic::{attention_forward, DenseAttentionBackward};
pub use traits::AttentionBackwardOps;
pub use traits::{AttentionInputs, BackwardInputs, BackwardOutputs, MaskPolicy};
pub use traits::{BiasLayout, BiasRef, DropoutParams};
pub use traits::{MatRef, MmaEngine};
