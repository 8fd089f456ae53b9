pub mod attention;
pub mod kernels;
pub mod mma;

pub use attention::FusedAttentionBackward;
pub use mma::{NaiveMma, PackedMma};
