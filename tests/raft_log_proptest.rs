use proptest::prelude::*;
use raftcore::raft::{FileStorage, HardState, Log, LogEntry, Storage};
use tempfile::TempDir;

#[derive(Debug, Clone)]
enum LogOp {
    Append { term: u64 },
    Truncate { index: u64 },
}

fn log_op_strategy() -> impl Strategy<Value = LogOp> {
    prop_oneof![
        3 => (1u64..10_000).prop_map(|term| LogOp::Append { term }),
        1 => (0u64..50).prop_map(|index| LogOp::Truncate { index }),
    ]
}

proptest! {
    #[test]
    fn raft_log_preserves_prefix_and_indices(ops in proptest::collection::vec(log_op_strategy(), 1..50)) {
        let mut log = Log::new();
        let mut shadow: Vec<u64> = Vec::new();

        for op in ops {
            match op {
                LogOp::Append { term } => {
                    let index = log.append(term, Vec::new());
                    shadow.push(term);
                    prop_assert_eq!(index as usize, shadow.len());
                }
                LogOp::Truncate { index } => {
                    let result = log.truncate_from(index);
                    if index >= 1 {
                        prop_assert!(result.is_ok());
                        if (index as usize) <= shadow.len() {
                            shadow.truncate(index as usize - 1);
                        }
                    } else {
                        prop_assert!(result.is_err());
                    }
                }
            }
        }

        let last = log.last_index();
        prop_assert_eq!(last as usize, shadow.len());
        prop_assert_eq!(log.term_at(0), Some(0));

        for (i, term) in shadow.iter().enumerate() {
            let index = i as u64 + 1;
            prop_assert_eq!(log.term_at(index), Some(*term), "term mismatch at index {}", index);
            let entry = log.get(index).expect("entry must exist");
            prop_assert_eq!(entry.index, index);
        }

        for index in (last + 1)..=(last + 5) {
            prop_assert!(log.get(index).is_none());
            prop_assert!(log.term_at(index).is_none());
        }
    }

    #[test]
    fn file_storage_restores_what_it_persisted(
        term in 0u64..1_000,
        terms in proptest::collection::vec(1u64..20, 0..30),
    ) {
        let tmp = TempDir::new().expect("tempdir");
        let data_dir = tmp.path().to_str().expect("utf8");

        let entries: Vec<LogEntry> = terms
            .iter()
            .enumerate()
            .map(|(i, &t)| LogEntry { index: i as u64 + 1, term: t, command: vec![i as u8; i % 7] })
            .collect();
        let hard_state = HardState { current_term: term, voted_for: Some("n2".to_string()) };

        let mut storage = FileStorage::new(data_dir).expect("storage");
        storage.persist(&hard_state, &entries).expect("persist");

        let reopened = FileStorage::new(data_dir).expect("storage");
        let loaded = reopened.load().expect("load");
        prop_assert_eq!(loaded.hard_state, hard_state);
        let log = Log::from_entries(loaded.entries).expect("contiguous");
        prop_assert_eq!(log.entries(), entries.as_slice());
    }

    #[test]
    fn file_storage_tracks_a_log_that_grows_and_is_cut_back(
        steps in proptest::collection::vec((0usize..12, proptest::collection::vec(1u64..5, 0..6)), 1..15),
    ) {
        let tmp = TempDir::new().expect("tempdir");
        let data_dir = tmp.path().to_str().expect("utf8");
        let mut storage = FileStorage::new(data_dir).expect("storage");
        let mut log: Vec<LogEntry> = Vec::new();

        for (step, (keep, terms)) in steps.into_iter().enumerate() {
            log.truncate(keep.min(log.len()));
            for term in terms {
                let index = log.len() as u64 + 1;
                // An index and term pair always names the same command.
                log.push(LogEntry { index, term, command: format!("{index}@{term}").into_bytes() });
            }
            let hard_state = HardState { current_term: step as u64 / 3, voted_for: None };
            storage.persist(&hard_state, &log).expect("persist");

            let loaded = FileStorage::new(data_dir).expect("storage").load().expect("load");
            prop_assert_eq!(loaded.hard_state, hard_state);
            prop_assert_eq!(&loaded.entries, &log);
        }
    }
}
