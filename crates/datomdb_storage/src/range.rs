//! Key ranges for scans.

use std::ops::Bound;

/// A range over byte-string keys.
///
/// Every kind can be scanned forward or backward; the direction is an
/// argument to the scan, not part of the range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyRange {
    /// Every key.
    All,
    /// Keys `>= start`.
    AtLeast(Vec<u8>),
    /// Keys `> start`.
    GreaterThan(Vec<u8>),
    /// Keys `<= end`.
    AtMost(Vec<u8>),
    /// Keys `< end`.
    LessThan(Vec<u8>),
    /// Keys in `[start, end]`.
    Closed(Vec<u8>, Vec<u8>),
    /// Keys in `[start, end)`.
    ClosedOpen(Vec<u8>, Vec<u8>),
    /// Keys in `(start, end)`.
    Open(Vec<u8>, Vec<u8>),
    /// Keys in `(start, end]`.
    OpenClosed(Vec<u8>, Vec<u8>),
}

impl KeyRange {
    pub(crate) fn bounds(&self) -> (Bound<&[u8]>, Bound<&[u8]>) {
        match self {
            KeyRange::All => (Bound::Unbounded, Bound::Unbounded),
            KeyRange::AtLeast(s) => (Bound::Included(s.as_slice()), Bound::Unbounded),
            KeyRange::GreaterThan(s) => (Bound::Excluded(s.as_slice()), Bound::Unbounded),
            KeyRange::AtMost(e) => (Bound::Unbounded, Bound::Included(e.as_slice())),
            KeyRange::LessThan(e) => (Bound::Unbounded, Bound::Excluded(e.as_slice())),
            KeyRange::Closed(s, e) => (Bound::Included(s.as_slice()), Bound::Included(e.as_slice())),
            KeyRange::ClosedOpen(s, e) => {
                (Bound::Included(s.as_slice()), Bound::Excluded(e.as_slice()))
            }
            KeyRange::Open(s, e) => (Bound::Excluded(s.as_slice()), Bound::Excluded(e.as_slice())),
            KeyRange::OpenClosed(s, e) => {
                (Bound::Excluded(s.as_slice()), Bound::Included(e.as_slice()))
            }
        }
    }

    /// The closed-open range covering every key starting with `prefix`.
    ///
    /// Returns an at-least range when the prefix has no successor (all
    /// bytes are 0xff).
    #[must_use]
    pub fn prefixed(prefix: &[u8]) -> KeyRange {
        match prefix_successor(prefix) {
            Some(end) => KeyRange::ClosedOpen(prefix.to_vec(), end),
            None => KeyRange::AtLeast(prefix.to_vec()),
        }
    }
}

/// The smallest key strictly greater than every key with this prefix:
/// the prefix with its last non-0xff byte incremented and the tail cut.
#[must_use]
pub(crate) fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut end = prefix.to_vec();
    while let Some(&last) = end.last() {
        if last == 0xff {
            end.pop();
        } else {
            *end.last_mut().expect("nonempty") = last + 1;
            return Some(end);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_successor_increments_last_byte() {
        assert_eq!(prefix_successor(&[1, 2, 3]), Some(vec![1, 2, 4]));
    }

    #[test]
    fn prefix_successor_carries_past_ff() {
        assert_eq!(prefix_successor(&[1, 0xff, 0xff]), Some(vec![2]));
        assert_eq!(prefix_successor(&[0xff, 0xff]), None);
    }

    #[test]
    fn prefixed_covers_extensions_only() {
        let range = KeyRange::prefixed(&[5, 5]);
        assert_eq!(
            range,
            KeyRange::ClosedOpen(vec![5, 5], vec![5, 6])
        );
    }
}
