//! Outbound journal: the ordered buffer of sent-but-unacknowledged chunks (spec.md §4.3).
//!
//! The journal is the single source of truth for retransmission. It never reorders; it is
//! pruned only from the front (oldest-acked-first) and appended only at the back.

use bytes::Bytes;
use std::collections::VecDeque;

/// A chunk in the journal together with the full index it was sent under.
#[derive(Debug, Clone)]
pub struct JournaledChunk {
    pub index: i64,
    pub bytes: Bytes,
}

#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    #[error("remote wants journal[{start}:{end}) but we only have journal[{tail}:{head})")]
    OutOfRange { start: i64, end: i64, tail: i64, head: i64 },
}

#[derive(Debug, Default)]
pub struct Journal {
    chunks: VecDeque<JournaledChunk>,
    /// Index of the next chunk assigned by `push` (== tail_index + chunks.len()).
    next_index: i64,
}

impl Journal {
    pub fn new() -> Self {
        Self {
            chunks: VecDeque::new(),
            next_index: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Index that will be assigned to the next pushed chunk.
    pub fn next_index(&self) -> i64 {
        self.next_index
    }

    /// Index of the oldest chunk still held (derivable: `next_index - len`). spec.md §3 invariant.
    pub fn tail_index(&self) -> i64 {
        self.next_index - self.chunks.len() as i64
    }

    /// Append a chunk, assigning it the current `next_index`. Returns the assigned index.
    pub fn push(&mut self, bytes: Bytes) -> i64 {
        let index = self.next_index;
        self.chunks.push_back(JournaledChunk { index, bytes });
        self.next_index += 1;
        index
    }

    pub fn oldest(&self) -> Option<&JournaledChunk> {
        self.chunks.front()
    }

    /// Remove journal entries with indices in `[tail_index, ack_index)`.
    ///
    /// Returns an error without mutating state if `ack_index` is outside `[tail_index, next_index]`
    /// (spec.md §4.2: "exceeds journal_index or is below tail_index" is fatal).
    pub fn prune_to(&mut self, ack_index: i64) -> Result<(), JournalError> {
        let tail = self.tail_index();
        if ack_index < tail || ack_index > self.next_index {
            return Err(JournalError::OutOfRange {
                start: tail,
                end: ack_index,
                tail,
                head: self.next_index,
            });
        }
        let to_drop = (ack_index - tail) as usize;
        for _ in 0..to_drop {
            self.chunks.pop_front();
        }
        Ok(())
    }

    /// Collect journal chunks `[start, end)`, oldest first, for retransmission.
    pub fn resend_range(&self, start: i64, end: i64) -> Result<Vec<Bytes>, JournalError> {
        if start == end {
            return Ok(Vec::new());
        }
        let tail = self.tail_index();
        if end < start || start < tail || end > self.next_index {
            return Err(JournalError::OutOfRange {
                start,
                end,
                tail,
                head: self.next_index,
            });
        }
        let skip = (start - tail) as usize;
        let take = (end - start) as usize;
        Ok(self.chunks.iter().skip(skip).take(take).map(|c| c.bytes.clone()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_assigns_sequential_indices() {
        let mut j = Journal::new();
        assert_eq!(j.push(Bytes::from_static(b"a")), 0);
        assert_eq!(j.push(Bytes::from_static(b"b")), 1);
        assert_eq!(j.next_index(), 2);
        assert_eq!(j.tail_index(), 0);
    }

    #[test]
    fn prune_advances_tail() {
        let mut j = Journal::new();
        for b in [b"a".as_slice(), b"b", b"c"] {
            j.push(Bytes::copy_from_slice(b));
        }
        j.prune_to(2).unwrap();
        assert_eq!(j.tail_index(), 2);
        assert_eq!(j.len(), 1);
        assert_eq!(j.oldest().unwrap().index, 2);
    }

    #[test]
    fn prune_rejects_impossible_ack() {
        let mut j = Journal::new();
        j.push(Bytes::from_static(b"a"));
        j.prune_to(1).unwrap();
        assert!(j.prune_to(0).is_err(), "below tail_index must be rejected");
        assert!(j.prune_to(5).is_err(), "beyond next_index must be rejected");
    }

    #[test]
    fn resend_range_oldest_first() {
        let mut j = Journal::new();
        for b in [b"a".as_slice(), b"b", b"c"] {
            j.push(Bytes::copy_from_slice(b));
        }
        let got = j.resend_range(1, 3).unwrap();
        assert_eq!(got, vec![Bytes::from_static(b"b"), Bytes::from_static(b"c")]);
    }

    #[test]
    fn resend_range_rejects_pruned_data() {
        let mut j = Journal::new();
        for b in [b"a".as_slice(), b"b", b"c"] {
            j.push(Bytes::copy_from_slice(b));
        }
        j.prune_to(3).unwrap();
        assert!(j.resend_range(1, 3).is_err());
    }
}
