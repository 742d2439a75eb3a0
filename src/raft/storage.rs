use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::{HardState, LogEntry, RaftError};

/// Everything a node needs to restore after a restart.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistentState {
    pub hard_state: HardState,
    pub entries: Vec<LogEntry>,
}

/// Durable home of the term, the vote and the log. `persist` must not
/// return before the data is durable; any error is fatal to the node.
pub trait Storage: Send {
    fn persist(&mut self, hard_state: &HardState, entries: &[LogEntry]) -> Result<(), RaftError>;

    fn load(&self) -> Result<PersistentState, RaftError>;
}

/// Keeps the persisted record in memory. Survives node restarts within one
/// process when shared through `clone`.
#[derive(Debug, Clone, Default)]
pub struct MemStorage {
    state: std::sync::Arc<std::sync::Mutex<PersistentState>>,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemStorage {
    fn persist(&mut self, hard_state: &HardState, entries: &[LogEntry]) -> Result<(), RaftError> {
        let mut state = self
            .state
            .lock()
            .map_err(|e| RaftError::Storage(format!("memory storage poisoned: {e}")))?;
        state.hard_state = hard_state.clone();
        state.entries = entries.to_vec();
        Ok(())
    }

    fn load(&self) -> Result<PersistentState, RaftError> {
        let state = self
            .state
            .lock()
            .map_err(|e| RaftError::Storage(format!("memory storage poisoned: {e}")))?;
        Ok(state.clone())
    }
}

/// Stores the record under `<data_dir>/raft/`: the term and vote in
/// `state.bin`, replaced atomically when they change, and the log in
/// `log.bin` as length-prefixed bincode frames. A persist that keeps the
/// durable prefix only appends the new suffix; a conflict cuts the file back
/// to the last matching entry first.
///
/// All I/O is blocking and happens on the caller's thread, which for a
/// running node means under its state lock.
pub struct FileStorage {
    state_file: PathBuf,
    log_file: PathBuf,
    hard_state: HardState,
    // Term and end offset of every entry already in `log.bin`.
    terms: Vec<u64>,
    ends: Vec<u64>,
}

impl FileStorage {
    pub fn new(data_dir: &str) -> Result<Self, RaftError> {
        let raft_dir = PathBuf::from(data_dir).join("raft");
        fs::create_dir_all(&raft_dir)?;

        let state_file = raft_dir.join("state.bin");
        let log_file = raft_dir.join("log.bin");
        let hard_state = read_hard_state(&state_file)?;
        let (entries, ends) = read_log(&log_file)?;

        Ok(Self {
            state_file,
            log_file,
            hard_state,
            terms: entries.iter().map(|e| e.term).collect(),
            ends,
        })
    }

    pub fn path(&self) -> &Path {
        &self.state_file
    }

    pub fn log_path(&self) -> &Path {
        &self.log_file
    }

    fn write_hard_state(&mut self, hard_state: &HardState) -> Result<(), RaftError> {
        let encoded = bincode::serde::encode_to_vec(hard_state, bincode::config::standard())
            .map_err(|e| RaftError::Serialization(e.to_string()))?;

        // Write the new record next to the old one, then swap it in.
        let tmp_file = self.state_file.with_extension("bin.tmp");
        {
            let mut file = File::create(&tmp_file)?;
            file.write_all(&encoded)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_file, &self.state_file)?;
        sync_dir(&self.state_file);

        self.hard_state = hard_state.clone();
        Ok(())
    }

    /// Keeps the first `keep` durable entries and writes `suffix` after them.
    fn write_log(&mut self, keep: usize, suffix: &[LogEntry]) -> Result<(), RaftError> {
        let keep_end = match keep {
            0 => 0,
            n => self.ends[n - 1],
        };

        let mut buffer = Vec::new();
        let mut ends = Vec::with_capacity(suffix.len());
        for entry in suffix {
            let encoded = bincode::serde::encode_to_vec(entry, bincode::config::standard())
                .map_err(|e| RaftError::Serialization(e.to_string()))?;
            let len = u32::try_from(encoded.len()).map_err(|_| {
                RaftError::Storage(format!("entry {} is too large to store", entry.index))
            })?;
            buffer.extend_from_slice(&len.to_be_bytes());
            buffer.extend_from_slice(&encoded);
            ends.push(keep_end + buffer.len() as u64);
        }

        let created = !self.log_file.exists();
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&self.log_file)?;
        // Also drops a torn frame left by an interrupted append.
        if file.metadata()?.len() != keep_end {
            file.set_len(keep_end)?;
        }
        file.seek(SeekFrom::Start(keep_end))?;
        file.write_all(&buffer)?;
        file.sync_all()?;
        if created {
            sync_dir(&self.log_file);
        }

        self.terms.truncate(keep);
        self.terms.extend(suffix.iter().map(|e| e.term));
        self.ends.truncate(keep);
        self.ends.extend(ends);
        Ok(())
    }
}

impl Storage for FileStorage {
    fn persist(&mut self, hard_state: &HardState, entries: &[LogEntry]) -> Result<(), RaftError> {
        if *hard_state != self.hard_state {
            self.write_hard_state(hard_state)?;
        }

        // Same index and term means same entry, so terms identify the prefix.
        let keep = self
            .terms
            .iter()
            .zip(entries)
            .take_while(|(term, entry)| **term == entry.term)
            .count();
        if keep == self.terms.len() && keep == entries.len() {
            return Ok(());
        }
        self.write_log(keep, &entries[keep..])
    }

    fn load(&self) -> Result<PersistentState, RaftError> {
        let hard_state = read_hard_state(&self.state_file)?;
        let (entries, _) = read_log(&self.log_file)?;
        Ok(PersistentState {
            hard_state,
            entries,
        })
    }
}

fn read_hard_state(path: &Path) -> Result<HardState, RaftError> {
    if !path.exists() {
        return Ok(HardState::default());
    }

    let mut file = File::open(path)?;
    let mut buffer = Vec::new();
    file.read_to_end(&mut buffer)?;

    if buffer.is_empty() {
        return Ok(HardState::default());
    }

    let (hard_state, _): (HardState, usize) =
        bincode::serde::decode_from_slice(&buffer, bincode::config::standard())
            .map_err(|e| RaftError::Serialization(e.to_string()))?;
    Ok(hard_state)
}

/// Decodes every complete frame of the log file, with the end offset of each.
/// An incomplete trailing frame is an append that never finished and is
/// skipped.
fn read_log(path: &Path) -> Result<(Vec<LogEntry>, Vec<u64>), RaftError> {
    if !path.exists() {
        return Ok((Vec::new(), Vec::new()));
    }

    let buffer = fs::read(path)?;
    let mut entries = Vec::new();
    let mut ends = Vec::new();
    let mut pos = 0;

    while buffer.len() - pos >= 4 {
        let mut len = [0u8; 4];
        len.copy_from_slice(&buffer[pos..pos + 4]);
        let len = u32::from_be_bytes(len) as usize;
        let start = pos + 4;
        if buffer.len() - start < len {
            break;
        }

        let (entry, _): (LogEntry, usize) = bincode::serde::decode_from_slice(
            &buffer[start..start + len],
            bincode::config::standard(),
        )
        .map_err(|e| RaftError::Serialization(e.to_string()))?;
        pos = start + len;
        entries.push(entry);
        ends.push(pos as u64);
    }

    Ok((entries, ends))
}

fn sync_dir(file: &Path) {
    if let Some(dir) = file.parent() {
        // Directory fsync is not supported everywhere; the data is already written.
        if let Ok(dir) = File::open(dir) {
            let _ = dir.sync_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry(index: u64, term: u64) -> LogEntry {
        LogEntry {
            index,
            term,
            command: format!("cmd{index}").into_bytes(),
        }
    }

    #[test]
    fn file_storage_starts_empty() {
        let tmp = tempdir().expect("tempdir");
        let storage = FileStorage::new(tmp.path().to_str().unwrap()).expect("storage");
        assert_eq!(storage.load().expect("load"), PersistentState::default());
    }

    #[test]
    fn file_storage_round_trips_across_instances() {
        let tmp = tempdir().expect("tempdir");
        let data_dir = tmp.path().to_str().unwrap().to_string();

        let hard_state = HardState {
            current_term: 4,
            voted_for: Some("n2".into()),
        };
        {
            let mut storage = FileStorage::new(&data_dir).expect("storage");
            storage
                .persist(&hard_state, &[entry(1, 1), entry(2, 4)])
                .expect("persist");
        }

        let storage = FileStorage::new(&data_dir).expect("storage");
        let loaded = storage.load().expect("load");
        assert_eq!(loaded.hard_state, hard_state);
        assert_eq!(loaded.entries, vec![entry(1, 1), entry(2, 4)]);
        assert!(!storage.path().with_extension("bin.tmp").exists());
    }

    #[test]
    fn file_storage_overwrites_truncated_log() {
        let tmp = tempdir().expect("tempdir");
        let mut storage = FileStorage::new(tmp.path().to_str().unwrap()).expect("storage");
        let hs = HardState::default();
        storage
            .persist(&hs, &[entry(1, 1), entry(2, 1), entry(3, 1)])
            .expect("persist");
        storage.persist(&hs, &[entry(1, 1)]).expect("persist");
        assert_eq!(storage.load().expect("load").entries, vec![entry(1, 1)]);
    }

    #[test]
    fn file_storage_appends_only_new_entries() {
        let tmp = tempdir().expect("tempdir");
        let data_dir = tmp.path().to_str().unwrap().to_string();
        let mut storage = FileStorage::new(&data_dir).expect("storage");
        let hs = HardState {
            current_term: 2,
            voted_for: Some("n1".into()),
        };
        let log: Vec<LogEntry> = (1..=5).map(|i| entry(i, 1 + i / 4)).collect();

        storage.persist(&hs, &log[..3]).expect("persist");
        let before = fs::read(storage.log_path()).expect("read");
        storage.persist(&hs, &log).expect("persist");
        let after = fs::read(storage.log_path()).expect("read");
        assert!(after.len() > before.len());
        assert_eq!(&after[..before.len()], before.as_slice());

        // Entry 3 is replaced by a newer term and the rest is dropped.
        let rewritten = vec![entry(1, 1), entry(2, 1), entry(3, 2)];
        storage.persist(&hs, &rewritten).expect("persist");

        let reopened = FileStorage::new(&data_dir).expect("storage");
        let loaded = reopened.load().expect("load");
        assert_eq!(loaded.hard_state, hs);
        assert_eq!(loaded.entries, rewritten);
    }

    #[test]
    fn file_storage_skips_torn_tail_and_overwrites_it() {
        let tmp = tempdir().expect("tempdir");
        let data_dir = tmp.path().to_str().unwrap().to_string();
        let hs = HardState::default();
        {
            let mut storage = FileStorage::new(&data_dir).expect("storage");
            storage
                .persist(&hs, &[entry(1, 1), entry(2, 1)])
                .expect("persist");
            // A length prefix promising more bytes than were written.
            let mut file = OpenOptions::new()
                .append(true)
                .open(storage.log_path())
                .expect("open");
            file.write_all(&[0, 0, 0, 40, 1, 2, 3]).expect("write");
        }

        let mut storage = FileStorage::new(&data_dir).expect("storage");
        assert_eq!(
            storage.load().expect("load").entries,
            vec![entry(1, 1), entry(2, 1)]
        );
        storage
            .persist(&hs, &[entry(1, 1), entry(2, 1), entry(3, 1)])
            .expect("persist");
        assert_eq!(
            storage.load().expect("load").entries,
            vec![entry(1, 1), entry(2, 1), entry(3, 1)]
        );
    }

    #[test]
    fn file_storage_reports_corrupt_record() {
        let tmp = tempdir().expect("tempdir");
        let storage = FileStorage::new(tmp.path().to_str().unwrap()).expect("storage");
        fs::write(storage.path(), [0xff, 0xff, 0xff]).expect("write");
        assert!(matches!(storage.load(), Err(RaftError::Serialization(_))));
    }

    #[test]
    fn mem_storage_clones_share_the_record() {
        let mut storage = MemStorage::new();
        let restarted = storage.clone();
        let hs = HardState {
            current_term: 2,
            voted_for: None,
        };
        storage.persist(&hs, &[entry(1, 2)]).expect("persist");
        let loaded = restarted.load().expect("load");
        assert_eq!(loaded.hard_state.current_term, 2);
        assert_eq!(loaded.entries.len(), 1);
    }
}
