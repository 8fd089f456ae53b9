//! Attention op contracts.

mod backward;
mod bias;
pub(crate) mod checks;
mod dropout;

pub use backward::{
    AttentionBackwardOps, AttentionInputs, BackwardInputs, BackwardOutputs, HeadBias, HeadView,
    MaskPolicy, SavedRows,
};
pub use bias::{BiasLayout, BiasRef};
pub use dropout::{DropoutMask, DropoutParams};
