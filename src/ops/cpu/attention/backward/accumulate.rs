//! Initialize/carry/flush policy for chunked gradient accumulators.
//!
//! A chunk fragment lives only for one stage. Between tile iterations its
//! partial sum is carried either in a workspace slot or in the output rows
//! themselves, depending on the resolved [`AccumMode`].

use super::tiles::{load_block, store_block, Block};
use crate::config::AccumMode;
use crate::dtype::Element;

/// Where one chunk's partial sum is carried and finally written.
pub(super) struct ChunkTarget<'a, T> {
    /// Workspace slot; empty for accumulators that never spill.
    pub slot: &'a mut [f32],
    /// Dense output rows of the instance.
    pub staged: &'a mut [T],
    pub block: Block,
}

/// Prepare `frag` (`rows x block.cols`) for this iteration's product.
pub(super) fn begin<T: Element>(
    mode: AccumMode,
    first: bool,
    frag: &mut [f32],
    rows: usize,
    target: &ChunkTarget<'_, T>,
) {
    if first {
        frag.fill(0.0);
        return;
    }
    match mode {
        AccumMode::InMemory => frag.copy_from_slice(&target.slot[..frag.len()]),
        AccumMode::InOutput => {
            load_block(target.staged, &target.block, frag, target.block.cols, rows)
        }
        AccumMode::InRegister => debug_assert!(false, "register accumulators are not chunked"),
    }
}

/// Carry `frag` to the next iteration, or flush it on the last one.
pub(super) fn end<T: Element>(
    mode: AccumMode,
    last: bool,
    frag: &[f32],
    target: &mut ChunkTarget<'_, T>,
) {
    match mode {
        AccumMode::InMemory if !last => target.slot[..frag.len()].copy_from_slice(frag),
        _ => store_block(frag, target.block.cols, &target.block, target.staged),
    }
}
