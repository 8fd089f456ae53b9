pub mod attention;
pub mod mma;

pub use attention::{
    AttentionBackwardOps, AttentionInputs, BackwardInputs, BackwardOutputs, BiasLayout, BiasRef,
    DropoutMask, DropoutParams, HeadView, MaskPolicy, SavedRows,
};
pub use mma::{MatRef, MmaEngine};
