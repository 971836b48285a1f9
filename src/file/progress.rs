//! Progress accounting for vectored transfers.

/// Split `transferred` bytes across buffers of the given lengths, front to back.
///
/// Each buffer takes `min(remaining, len)` before the next one gets anything,
/// which is how the kernel fills and drains an iovec array on a short
/// transfer. Bytes beyond the total length are ignored.
pub(crate) fn distribute(lens: &[usize], transferred: usize) -> Vec<usize> {
    let mut remaining = transferred;
    lens.iter()
        .map(|&len| {
            let taken = remaining.min(len);
            remaining -= taken;
            taken
        })
        .collect()
}
