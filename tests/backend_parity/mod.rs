pub mod helpers;

pub mod attention_backward;
pub mod bias;
pub mod dropout;
pub mod varlen;
