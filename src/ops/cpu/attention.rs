//! CPU attention kernels

pub mod backward;

pub use backward::{FusedAttentionBackward, KernelPlan, WorkspaceLayout};
