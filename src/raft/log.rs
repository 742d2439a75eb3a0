use serde::{Deserialize, Serialize};

use super::RaftError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: u64,
    pub term: u64,
    pub command: Vec<u8>,
}

/// The replicated log. Entry `k` (1-based) lives at position `k - 1`;
/// index 0 means "no entry" and has term 0.
#[derive(Debug, Clone, Default)]
pub struct Log {
    entries: Vec<LogEntry>,
}

impl Log {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a log from persisted entries, rejecting gaps or misnumbered entries.
    pub fn from_entries(entries: Vec<LogEntry>) -> Result<Self, RaftError> {
        for (pos, entry) in entries.iter().enumerate() {
            if entry.index != pos as u64 + 1 {
                return Err(RaftError::Storage(format!(
                    "persisted log is not contiguous: position {} holds index {}",
                    pos + 1,
                    entry.index
                )));
            }
        }
        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn last_index(&self) -> u64 {
        self.entries.len() as u64
    }

    pub fn last_term(&self) -> u64 {
        self.entries.last().map(|e| e.term).unwrap_or(0)
    }

    pub fn term_at(&self, index: u64) -> Option<u64> {
        if index == 0 {
            return Some(0);
        }
        self.get(index).map(|e| e.term)
    }

    pub fn get(&self, index: u64) -> Option<&LogEntry> {
        if index == 0 {
            return None;
        }
        self.entries.get(index as usize - 1)
    }

    /// Entries from `start` onward, at most `max` of them.
    pub fn entries_from(&self, start: u64, max: usize) -> Vec<LogEntry> {
        let start = start.max(1);
        if start > self.last_index() {
            return Vec::new();
        }
        self.entries[start as usize - 1..]
            .iter()
            .take(max)
            .cloned()
            .collect()
    }

    /// Entries in `start..=end`, clamped to the log.
    pub fn range(&self, start: u64, end: u64) -> Vec<LogEntry> {
        let start = start.max(1);
        let end = end.min(self.last_index());
        if start > end {
            return Vec::new();
        }
        self.entries[start as usize - 1..end as usize].to_vec()
    }

    /// Appends a new entry created in `term`, returning its index.
    pub fn append(&mut self, term: u64, command: Vec<u8>) -> u64 {
        let index = self.last_index() + 1;
        self.entries.push(LogEntry {
            index,
            term,
            command,
        });
        index
    }

    /// Appends an entry received from a leader; it must extend the log by exactly one.
    pub fn append_entry(&mut self, entry: LogEntry) -> Result<(), RaftError> {
        if entry.index != self.last_index() + 1 {
            return Err(RaftError::InvalidLogIndex(entry.index));
        }
        self.entries.push(entry);
        Ok(())
    }

    /// Removes the entry at `index` and everything after it.
    pub fn truncate_from(&mut self, index: u64) -> Result<(), RaftError> {
        if index < 1 {
            return Err(RaftError::InvalidLogIndex(index));
        }
        if index > self.last_index() {
            return Ok(());
        }
        self.entries.truncate(index as usize - 1);
        Ok(())
    }

    /// Whether the log holds an entry at `index` with `term` (index 0 always matches).
    pub fn matches(&self, index: u64, term: u64) -> bool {
        self.term_at(index) == Some(term)
    }

    /// First index of the run of `term` that contains `index`.
    pub fn first_index_of_term_run(&self, index: u64) -> u64 {
        let Some(term) = self.term_at(index) else {
            return index;
        };
        let mut first = index;
        while first > 1 && self.term_at(first - 1) == Some(term) {
            first -= 1;
        }
        first
    }

    /// Last index holding an entry of `term`, if any.
    pub fn last_index_of_term(&self, term: u64) -> Option<u64> {
        self.entries
            .iter()
            .rev()
            .skip_while(|e| e.term > term)
            .find(|e| e.term == term)
            .map(|e| e.index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log_with_terms(terms: &[u64]) -> Log {
        let mut log = Log::new();
        for (i, term) in terms.iter().enumerate() {
            log.append(*term, format!("cmd{}", i + 1).into_bytes());
        }
        log
    }

    #[test]
    fn empty_log_reports_zero_index_and_term() {
        let log = Log::new();
        assert_eq!(log.last_index(), 0);
        assert_eq!(log.last_term(), 0);
        assert_eq!(log.term_at(0), Some(0));
        assert_eq!(log.term_at(1), None);
        assert!(log.get(0).is_none());
        assert!(log.matches(0, 0));
    }

    #[test]
    fn append_assigns_contiguous_indices() {
        let log = log_with_terms(&[1, 1, 2]);
        assert_eq!(log.last_index(), 3);
        assert_eq!(log.last_term(), 2);
        for (pos, entry) in log.entries().iter().enumerate() {
            assert_eq!(entry.index, pos as u64 + 1);
        }
        assert_eq!(log.get(2).map(|e| e.command.clone()), Some(b"cmd2".to_vec()));
    }

    #[test]
    fn append_entry_rejects_gaps() {
        let mut log = log_with_terms(&[1]);
        let err = log
            .append_entry(LogEntry {
                index: 3,
                term: 1,
                command: vec![],
            })
            .unwrap_err();
        assert!(matches!(err, RaftError::InvalidLogIndex(3)));
    }

    #[test]
    fn truncate_from_removes_tail_only() {
        let mut log = log_with_terms(&[1, 1, 2, 3]);
        log.truncate_from(3).expect("truncate");
        assert_eq!(log.last_index(), 2);
        assert_eq!(log.last_term(), 1);

        // Past the end is a no-op, index 0 is invalid.
        log.truncate_from(10).expect("noop");
        assert_eq!(log.last_index(), 2);
        assert!(matches!(
            log.truncate_from(0),
            Err(RaftError::InvalidLogIndex(0))
        ));
    }

    #[test]
    fn entries_from_honors_batch_limit() {
        let log = log_with_terms(&[1, 1, 1, 1, 1]);
        let batch = log.entries_from(2, 2);
        assert_eq!(batch.iter().map(|e| e.index).collect::<Vec<_>>(), vec![2, 3]);
        assert!(log.entries_from(6, 10).is_empty());
        assert_eq!(log.range(4, 99).len(), 2);
        assert!(log.range(3, 2).is_empty());
    }

    #[test]
    fn term_run_and_last_index_of_term() {
        let log = log_with_terms(&[1, 2, 2, 2, 4]);
        assert_eq!(log.first_index_of_term_run(4), 2);
        assert_eq!(log.first_index_of_term_run(1), 1);
        assert_eq!(log.last_index_of_term(2), Some(4));
        assert_eq!(log.last_index_of_term(3), None);
        assert_eq!(log.last_index_of_term(4), Some(5));
    }

    #[test]
    fn from_entries_rejects_misnumbered_log() {
        let entries = vec![
            LogEntry {
                index: 1,
                term: 1,
                command: vec![],
            },
            LogEntry {
                index: 3,
                term: 1,
                command: vec![],
            },
        ];
        assert!(matches!(
            Log::from_entries(entries),
            Err(RaftError::Storage(_))
        ));
    }
}
