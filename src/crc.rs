//! CRC-32 helpers for transfer verification.
//!
//! The DFU target reports a rolling CRC-32 (IEEE polynomial) over every byte
//! it has received so far, chained across data objects. `extend` continues a
//! previous checksum the same way the device does.

/// CRC-32 over the whole buffer.
pub fn compute(buf: &[u8]) -> u32 {
    crc32fast::hash(buf)
}

/// CRC-32 over the first `len` bytes of the buffer.
///
/// `len` must not exceed `buf.len()`.
pub fn compute_prefix(buf: &[u8], len: usize) -> u32 {
    crc32fast::hash(&buf[..len])
}

/// Continue a rolling CRC-32 with additional bytes.
///
/// `init` is the result of a previous [`compute`]/[`extend`] call; `extend(0, buf)`
/// is equivalent to `compute(buf)`.
pub fn extend(init: u32, buf: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new_with_initial(init);
    hasher.update(buf);
    hasher.finalize()
}
