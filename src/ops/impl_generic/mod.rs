//! Composite implementations, identical on every backend.

pub mod attention;

pub use attention::{attention_forward, DenseAttentionBackward};
