//! The replicated log.
//!
//! Entries are 1-indexed and append-only. Index 0 with term 0 is the
//! sentinel "empty log" position used in consistency checks. A conflict at
//! or below the commit index is unrecoverable: it would rewrite committed
//! history, so the caller must halt the group.

use hive_protocol::{Command, LogEntry, LogIndex, Term};

use crate::ConsensusError;

/// Outcome of a follower-side append attempt.
#[derive(Debug, PartialEq)]
pub enum AppendOutcome {
    /// The log does not contain a matching entry at
    /// `(prev_log_index, prev_log_term)`; the leader must retry lower.
    Rejected,
    /// Entries accepted.
    Accepted {
        /// First index removed by conflict truncation, if any.
        truncated_from: Option<LogIndex>,
        /// Entries actually appended (duplicates already present are skipped).
        appended: Vec<LogEntry>,
        /// `prev_log_index` + number of entries the leader sent; the
        /// highest index this follower can vouch for.
        match_index: LogIndex,
    },
}

#[derive(Debug, Default)]
pub struct RaftLog {
    entries: Vec<LogEntry>,
}

impl RaftLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted entries. Indexes must be contiguous from 1.
    pub fn from_entries(entries: Vec<LogEntry>) -> Result<Self, ConsensusError> {
        for (i, entry) in entries.iter().enumerate() {
            let expected = i as LogIndex + 1;
            if entry.index != expected {
                return Err(ConsensusError::CorruptLog(format!(
                    "expected index {expected}, found {}",
                    entry.index
                )));
            }
        }
        Ok(Self { entries })
    }

    pub fn last_index(&self) -> LogIndex {
        self.entries.len() as LogIndex
    }

    pub fn last_term(&self) -> Term {
        self.entries.last().map(|e| e.term).unwrap_or(0)
    }

    /// Term of the entry at `index`. `Some(0)` for the sentinel index 0,
    /// `None` when the index is beyond the log.
    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == 0 {
            return Some(0);
        }
        self.entry(index).map(|e| e.term)
    }

    pub fn entry(&self, index: LogIndex) -> Option<&LogEntry> {
        if index == 0 {
            return None;
        }
        self.entries.get(index as usize - 1)
    }

    /// Leader-side append of a fresh command. Never overwrites.
    pub fn append_new(&mut self, term: Term, command: Command) -> LogEntry {
        let entry = LogEntry {
            term,
            index: self.last_index() + 1,
            command,
            applied: false,
        };
        self.entries.push(entry.clone());
        entry
    }

    /// Entries with `index >= from`, for replication.
    pub fn entries_from(&self, from: LogIndex) -> Vec<LogEntry> {
        if from == 0 || from > self.last_index() {
            return Vec::new();
        }
        self.entries[from as usize - 1..].to_vec()
    }

    /// Follower-side append with the Raft consistency check.
    ///
    /// Rejects when the log has no entry matching `(prev_index, prev_term)`.
    /// On acceptance, entries conflicting with the leader's (same index,
    /// different term) are truncated before the new suffix is appended —
    /// unless the conflict sits at or below `commit_index`, which violates
    /// log matching and is fatal.
    pub fn try_append(
        &mut self,
        prev_index: LogIndex,
        prev_term: Term,
        new_entries: &[LogEntry],
        commit_index: LogIndex,
    ) -> Result<AppendOutcome, ConsensusError> {
        match self.term_at(prev_index) {
            Some(term) if term == prev_term => {}
            _ => return Ok(AppendOutcome::Rejected),
        }

        let mut truncated_from = None;
        let mut appended = Vec::new();
        for entry in new_entries {
            match self.term_at(entry.index) {
                Some(existing) if existing == entry.term => {
                    // Already replicated; idempotent redelivery.
                    continue;
                }
                Some(_) => {
                    if entry.index <= commit_index {
                        return Err(ConsensusError::CorruptLog(format!(
                            "conflicting entry at committed index {}",
                            entry.index
                        )));
                    }
                    self.entries.truncate(entry.index as usize - 1);
                    truncated_from.get_or_insert(entry.index);
                    self.entries.push(entry.clone());
                    appended.push(entry.clone());
                }
                None => {
                    if entry.index != self.last_index() + 1 {
                        return Err(ConsensusError::CorruptLog(format!(
                            "gap while appending: entry {} after last index {}",
                            entry.index,
                            self.last_index()
                        )));
                    }
                    self.entries.push(entry.clone());
                    appended.push(entry.clone());
                }
            }
        }

        Ok(AppendOutcome::Accepted {
            truncated_from,
            appended,
            match_index: prev_index + new_entries.len() as LogIndex,
        })
    }

    /// Flip the `applied` flag on entries up to `index` and return the
    /// freshly applied ones in order.
    pub fn mark_applied_up_to(&mut self, index: LogIndex) -> Vec<LogEntry> {
        let mut applied = Vec::new();
        for entry in self.entries.iter_mut() {
            if entry.index > index {
                break;
            }
            if !entry.applied {
                entry.applied = true;
                applied.push(entry.clone());
            }
        }
        applied
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }
}
