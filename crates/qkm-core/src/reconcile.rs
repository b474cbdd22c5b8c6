//! Classical error correction for sifted key bits.
//!
//! Blockwise parity bisection: both parties compare the parity of each
//! block, and on a mismatch recursively halve the block until the single
//! flipped bit is found and corrected on the responder's side. An even
//! number of errors inside a block is invisible to parity, so callers must
//! still discard positions that disagree afterwards.

/// Default block size for the parity pass.
pub const DEFAULT_BLOCK_SIZE: usize = 16;

/// Parity of a bit slice.
pub fn parity(bits: &[bool]) -> bool {
    bits.iter().fold(false, |acc, &b| acc ^ b)
}

/// Correct `responder` against `initiator` block by block.
///
/// Returns the number of bits flipped.
pub fn reconcile(initiator: &[bool], responder: &mut [bool], block_size: usize) -> usize {
    debug_assert_eq!(initiator.len(), responder.len());
    let block_size = block_size.max(1);

    initiator
        .chunks(block_size)
        .zip(responder.chunks_mut(block_size))
        .map(|(a, b)| bisect(a, b))
        .sum()
}

fn bisect(initiator: &[bool], responder: &mut [bool]) -> usize {
    if parity(initiator) == parity(responder) {
        return 0;
    }
    if initiator.len() == 1 {
        responder[0] = !responder[0];
        return 1;
    }

    let mid = initiator.len() / 2;
    let (a_left, a_right) = initiator.split_at(mid);
    let (b_left, b_right) = responder.split_at_mut(mid);

    if parity(a_left) != parity(b_left) {
        bisect(a_left, b_left)
    } else {
        bisect(a_right, b_right)
    }
}
