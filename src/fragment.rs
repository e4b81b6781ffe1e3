//! Splitting byte buffers into transport-sized fragments.

/// In-order iterator over fixed-size slices of a buffer.
///
/// Every fragment has exactly `size` bytes except possibly the last one.
/// An empty buffer yields no fragments.
pub struct Fragments<'a> {
    rest: &'a [u8],
    size: usize,
}

/// Lazily split `buf` into fragments of at most `size` bytes.
///
/// `size` must be non-zero.
pub fn fragments(buf: &[u8], size: usize) -> Fragments<'_> {
    assert!(size > 0, "fragment size must be non-zero");
    Fragments { rest: buf, size }
}

impl<'a> Iterator for Fragments<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<&'a [u8]> {
        if self.rest.is_empty() {
            return None;
        }
        let split = self.rest.len().min(self.size);
        let (frag, rest) = self.rest.split_at(split);
        self.rest = rest;
        Some(frag)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.rest.len().div_ceil(self.size);
        (n, Some(n))
    }
}

impl ExactSizeIterator for Fragments<'_> {}
