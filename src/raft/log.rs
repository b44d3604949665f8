//! In-memory log storage with a logical base offset hiding the compacted prefix.
//!
//! Absolute indices start at 1. Everything at or below `snapshot_last_index` has already been
//! folded into the snapshot and is not kept in `entries`. This type is pure and synchronous: it
//! never takes a lock of its own, because callers always hold the replica mutex while touching
//! it.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: u64,
    pub index: u64,
    pub command: Vec<u8>,
}

/// Where in the log we failed to find an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLookupError {
    /// The requested index has already been compacted into the snapshot.
    Compacted,
    /// The requested index is past the end of the log.
    OutOfRange,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Log {
    /// Index of the last entry folded into the snapshot (0 if nothing has been compacted yet).
    snapshot_last_index: u64,
    /// Term of `snapshot_last_index`.
    snapshot_last_term: u64,
    /// Entries with indices `(snapshot_last_index, snapshot_last_index + entries.len()]`.
    entries: Vec<LogEntry>,
}

impl Log {
    pub fn new() -> Self {
        Log {
            snapshot_last_index: 0,
            snapshot_last_term: 0,
            entries: Vec::new(),
        }
    }

    pub fn snapshot_last_index(&self) -> u64 {
        self.snapshot_last_index
    }

    pub fn snapshot_last_term(&self) -> u64 {
        self.snapshot_last_term
    }

    pub fn last_index(&self) -> u64 {
        self.snapshot_last_index + self.entries.len() as u64
    }

    pub fn last_term(&self) -> u64 {
        self.entries
            .last()
            .map(|e| e.term)
            .unwrap_or(self.snapshot_last_term)
    }

    /// Slice offset for an absolute index, or `None` if it has been compacted away.
    fn slot(&self, index: u64) -> Option<usize> {
        if index <= self.snapshot_last_index {
            None
        } else {
            Some((index - self.snapshot_last_index - 1) as usize)
        }
    }

    /// Term of the entry at `index`, including the synthetic entry at `snapshot_last_index`.
    pub fn term_at(&self, index: u64) -> Result<u64, LogLookupError> {
        if index == self.snapshot_last_index {
            return Ok(self.snapshot_last_term);
        }
        if index < self.snapshot_last_index {
            return Err(LogLookupError::Compacted);
        }
        let slot = self.slot(index).ok_or(LogLookupError::Compacted)?;
        self.entries
            .get(slot)
            .map(|e| e.term)
            .ok_or(LogLookupError::OutOfRange)
    }

    pub fn entry_at(&self, index: u64) -> Option<&LogEntry> {
        let slot = self.slot(index)?;
        self.entries.get(slot)
    }

    /// Entries in `(after_index, last_index]`, suitable for an AppendEntries payload.
    pub fn entries_after(&self, after_index: u64) -> Vec<LogEntry> {
        if after_index < self.snapshot_last_index {
            // Caller is responsible for sending a snapshot first; we can only offer what we have.
            return self.entries.clone();
        }
        match self.slot(after_index) {
            None => self.entries.clone(),
            Some(slot) => self.entries[slot..].to_vec(),
        }
    }

    /// Append a leader-proposed entry directly (used by `start`). Caller computes `term`/`index`.
    pub fn append(&mut self, entry: LogEntry) {
        debug_assert_eq!(entry.index, self.last_index() + 1);
        self.entries.push(entry);
    }

    /// First index in the log (at or after the snapshot) carrying `term`, used to compute a fast
    /// backtrack `conflict_index` for a follower's reject reply.
    pub fn first_index_with_term(&self, term: u64) -> Option<u64> {
        self.entries
            .iter()
            .find(|e| e.term == term)
            .map(|e| e.index)
    }

    /// Last index in the log carrying `term`, used by a leader to fast-forward `next_index` past
    /// an entire conflicting term in one round trip.
    pub fn last_index_with_term(&self, term: u64) -> Option<u64> {
        self.entries
            .iter()
            .rev()
            .find(|e| e.term == term)
            .map(|e| e.index)
    }

    /// Merge incoming entries starting at `first_new_index`: entries already present with a
    /// matching term are left untouched (idempotent resend); at the first mismatch the suffix is
    /// truncated and the remainder of `incoming` is appended. Never truncates `<= keep_floor`
    /// (the leader's committed prefix).
    pub fn merge(&mut self, first_new_index: u64, incoming: &[LogEntry], keep_floor: u64) {
        let mut idx = first_new_index;
        for (i, entry) in incoming.iter().enumerate() {
            match self.term_at(idx) {
                Ok(existing_term) if existing_term == entry.term => {
                    // Already have this exact entry; nothing to do.
                }
                _ => {
                    if idx > keep_floor {
                        self.truncate_from(idx);
                    }
                    self.entries.extend(incoming[i..].iter().cloned());
                    return;
                }
            }
            idx += 1;
        }
    }

    /// Drop every entry with index `>= from` (from must be `> snapshot_last_index`).
    fn truncate_from(&mut self, from: u64) {
        if let Some(slot) = self.slot(from) {
            self.entries.truncate(slot);
        }
    }

    /// Discard the prefix through `up_to_index` (inclusive), recording its term as the new
    /// snapshot boundary. Keeps any suffix already present.
    pub fn compact(&mut self, up_to_index: u64, up_to_term: u64) {
        if up_to_index <= self.snapshot_last_index {
            return;
        }
        if let Some(slot) = self.slot(up_to_index) {
            if slot < self.entries.len() {
                // `slot` is the entry at `up_to_index` itself; it folds into the snapshot
                // boundary too; an inclusive drain is what leaves the suffix starting at
                // `up_to_index + 1`.
                self.entries.drain(0..=slot);
            } else {
                self.entries.clear();
            }
        } else {
            // up_to_index is beyond anything we hold locally.
            self.entries.clear();
        }
        self.snapshot_last_index = up_to_index;
        self.snapshot_last_term = up_to_term;
    }

    /// Replace the log wholesale with a fresh snapshot boundary and no tail, used when a received
    /// InstallSnapshot doesn't line up with anything we already have.
    pub fn reset_to_snapshot(&mut self, index: u64, term: u64) {
        self.entries.clear();
        self.snapshot_last_index = index;
        self.snapshot_last_term = term;
    }
}

impl Default for Log {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(term: u64, index: u64) -> LogEntry {
        LogEntry {
            term,
            index,
            command: vec![],
        }
    }

    #[test]
    fn fresh_log_reports_zero() {
        let log = Log::new();
        assert_eq!(log.last_index(), 0);
        assert_eq!(log.last_term(), 0);
        assert_eq!(log.term_at(0), Ok(0));
    }

    #[test]
    fn append_and_term_at() {
        let mut log = Log::new();
        log.append(entry(1, 1));
        log.append(entry(1, 2));
        log.append(entry(2, 3));
        assert_eq!(log.last_index(), 3);
        assert_eq!(log.term_at(2), Ok(1));
        assert_eq!(log.term_at(3), Ok(2));
        assert_eq!(log.term_at(4), Err(LogLookupError::OutOfRange));
    }

    #[test]
    fn merge_truncates_on_conflict_but_respects_commit_floor() {
        let mut log = Log::new();
        log.append(entry(1, 1));
        log.append(entry(1, 2));
        log.append(entry(1, 3));

        // Conflicting entry at index 2 with a higher term, nothing committed yet.
        log.merge(2, &[entry(2, 2), entry(2, 3)], 0);
        assert_eq!(log.last_index(), 3);
        assert_eq!(log.term_at(2), Ok(2));
        assert_eq!(log.term_at(3), Ok(2));
    }

    #[test]
    fn merge_is_idempotent_for_matching_entries() {
        let mut log = Log::new();
        log.append(entry(1, 1));
        log.append(entry(1, 2));
        log.merge(1, &[entry(1, 1), entry(1, 2)], 0);
        assert_eq!(log.last_index(), 2);
        assert_eq!(log.term_at(1), Ok(1));
    }

    #[test]
    fn compact_drops_prefix_and_keeps_suffix() {
        let mut log = Log::new();
        for i in 1..=5u64 {
            log.append(entry(1, i));
        }
        log.compact(3, 1);
        assert_eq!(log.snapshot_last_index(), 3);
        assert_eq!(log.term_at(3), Ok(1));
        assert_eq!(log.term_at(4), Ok(1));
        assert_eq!(log.entries_after(3).len(), 2);
        assert_eq!(log.term_at(2), Err(LogLookupError::Compacted));
    }

    #[test]
    fn first_and_last_index_with_term() {
        let mut log = Log::new();
        log.append(entry(1, 1));
        log.append(entry(2, 2));
        log.append(entry(2, 3));
        log.append(entry(3, 4));
        assert_eq!(log.first_index_with_term(2), Some(2));
        assert_eq!(log.last_index_with_term(2), Some(3));
        assert_eq!(log.first_index_with_term(9), None);
    }
}
