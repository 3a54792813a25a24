//! # comprehensive storage tests
//!
//! why: verify all snapshot storage scenarios work correctly
//! relations: tests fleet-storage crate
//! what: persistence, ordering, crash leftovers, retention, trait polymorphism

use fleet_storage::{FileSnapshotStore, InMemorySnapshotStore, SnapshotMeta, SnapshotStore};
use std::fs;
use std::io::{Read, Write};
use tempfile::tempdir;

fn write(store: &dyn SnapshotStore, index: u64, term: u64, data: &[u8]) -> SnapshotMeta {
    let mut sink = store.create(index, term).unwrap();
    sink.write_all(data).unwrap();
    sink.close().unwrap()
}

fn read(store: &dyn SnapshotStore, id: &str) -> Vec<u8> {
    let (_, mut reader) = store.open(id).unwrap();
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf).unwrap();
    buf
}

// =============================================================================
// SECTION 1: IN-MEMORY STORE TESTS
// =============================================================================

mod in_memory {
    use super::*;

    #[test]
    fn new_store_is_empty() {
        let store = InMemorySnapshotStore::new();
        assert!(store.list().unwrap().is_empty());
        assert!(store.latest().unwrap().is_none());
    }

    #[test]
    fn unclosed_sink_is_invisible() {
        let store = InMemorySnapshotStore::new();
        let mut sink = store.create(1, 1).unwrap();
        sink.write_all(b"in flight").unwrap();

        assert!(store.list().unwrap().is_empty());
        sink.close().unwrap();
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn clones_share_snapshots() {
        let store = InMemorySnapshotStore::new();
        let other = store.clone();
        write(&store, 2, 1, b"shared");

        let (meta, _) = other.latest().unwrap().unwrap();
        assert_eq!(meta.index, 2);
    }

    #[test]
    fn unknown_snapshot_is_not_found() {
        let store = InMemorySnapshotStore::new();
        let err = store.open("missing").err().unwrap();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
    }
}

// =============================================================================
// SECTION 2: FILE STORE TESTS
// =============================================================================

mod file_store {
    use super::*;

    #[test]
    fn meta_file_is_valid_json() {
        let dir = tempdir().unwrap();
        let store = FileSnapshotStore::new(dir.path(), 3).unwrap();
        let meta = write(&store, 4, 2, b"data");

        let contents = fs::read_to_string(dir.path().join(&meta.id).join("meta.json")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&contents).expect("valid JSON");
        assert_eq!(value["index"], 4);
        assert_eq!(value["size"], 4);
    }

    #[test]
    fn no_temp_dirs_remain_after_close() {
        let dir = tempdir().unwrap();
        let store = FileSnapshotStore::new(dir.path(), 3).unwrap();
        write(&store, 1, 1, b"data");

        for entry in fs::read_dir(dir.path()).unwrap() {
            let name = entry.unwrap().file_name().to_string_lossy().into_owned();
            assert!(!name.ends_with(".tmp"), "leftover {}", name);
        }
    }

    #[test]
    fn cancelled_snapshot_is_removed() {
        let dir = tempdir().unwrap();
        let store = FileSnapshotStore::new(dir.path(), 3).unwrap();
        let mut sink = store.create(1, 1).unwrap();
        sink.write_all(b"partial").unwrap();
        sink.cancel().unwrap();

        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn crash_leftovers_are_ignored() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("1-1-0-0.tmp")).unwrap();

        let store = FileSnapshotStore::new(dir.path(), 3).unwrap();
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn large_snapshot() {
        let dir = tempdir().unwrap();
        let store = FileSnapshotStore::new(dir.path(), 1).unwrap();

        // 1MB payload
        let data = vec![7u8; 1024 * 1024];
        let meta = write(&store, 1, 1, &data);

        assert_eq!(meta.size, data.len() as u64);
        assert_eq!(read(&store, &meta.id), data);
    }
}

// =============================================================================
// SECTION 3: ORDERING TESTS
// =============================================================================

mod ordering {
    use super::*;

    #[test]
    fn newest_index_comes_first() {
        let store = InMemorySnapshotStore::new();
        write(&store, 5, 1, b"five");
        write(&store, 9, 1, b"nine");
        write(&store, 7, 1, b"seven");

        let (meta, _) = store.latest().unwrap().unwrap();
        assert_eq!(meta.index, 9);
        assert_eq!(read(&store, &meta.id), b"nine".to_vec());
    }

    #[test]
    fn equal_indexes_prefer_higher_term() {
        let store = InMemorySnapshotStore::new();
        write(&store, 5, 1, b"old term");
        write(&store, 5, 3, b"new term");

        let (meta, _) = store.latest().unwrap().unwrap();
        assert_eq!(meta.term, 3);
    }
}

// =============================================================================
// SECTION 4: STORAGE TRAIT POLYMORPHISM
// =============================================================================

mod trait_polymorphism {
    use super::*;

    fn test_store_impl(store: &dyn SnapshotStore) {
        // write and read back
        let meta = write(store, 3, 1, b"payload");
        assert_eq!(read(store, &meta.id), b"payload".to_vec());

        // newest wins
        write(store, 4, 1, b"newer");
        let (latest, _) = store.latest().unwrap().unwrap();
        assert_eq!(latest.index, 4);

        // clear
        store.clear().unwrap();
        assert!(store.latest().unwrap().is_none());
    }

    #[test]
    fn in_memory_implements_trait() {
        test_store_impl(&InMemorySnapshotStore::new());
    }

    #[test]
    fn file_store_implements_trait() {
        let dir = tempdir().unwrap();
        test_store_impl(&FileSnapshotStore::new(dir.path(), 5).unwrap());
    }
}
