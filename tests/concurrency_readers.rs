//! Snapshot isolation under a concurrent writer

use pakfs::{BatchOp, ContainerSession, Key, PakConfig, PakFs};
use std::sync::atomic::{AtomicBool, Ordering};
use tempfile::TempDir;

const KEYS: u8 = 40;

fn config() -> PakConfig {
    PakConfig {
        block_size: 256,
        key_width: 8,
        cache_capacity: 16,
        ..PakConfig::default()
    }
}

fn key(n: u8) -> Key {
    Key::filled(n, 8)
}

/// Every key of one generation carries the same value
fn generation(generation: u32) -> Vec<BatchOp> {
    (0..KEYS)
        .map(|n| {
            let mut value = generation.to_be_bytes().to_vec();
            // Some values spill into extents
            if n % 5 == 0 {
                value.resize(64, n);
            }
            BatchOp::Insert(key(n), value)
        })
        .collect()
}

fn generation_of(value: &[u8]) -> u32 {
    u32::from_be_bytes([value[0], value[1], value[2], value[3]])
}

#[test]
fn test_snapshot_keeps_pre_commit_view() {
    let dir = TempDir::new().unwrap();
    let session = ContainerSession::create(dir.path().join("r.pak"), config()).unwrap();
    session.apply(generation(0)).unwrap();

    let old = session.snapshot();
    for round in 1..=20 {
        session.apply(generation(round)).unwrap();
    }

    // Twenty commits later the old root is still intact
    for n in 0..KEYS {
        assert_eq!(generation_of(&old.get(&key(n)).unwrap()), 0);
    }
    let fresh = session.snapshot();
    assert_eq!(generation_of(&fresh.get(&key(0)).unwrap()), 20);
    assert!(session.stats().pending_blocks > 0);
    drop(fresh);
    drop(old);

    // The next commit releases everything the old snapshot pinned
    session.apply(generation(21)).unwrap();
    assert_eq!(session.stats().pending_blocks, 0);
    assert!(session.check().unwrap().is_clean());
}

#[test]
fn test_readers_never_see_a_partial_commit() {
    let dir = TempDir::new().unwrap();
    let session = ContainerSession::create(dir.path().join("r.pak"), config()).unwrap();
    session.apply(generation(0)).unwrap();
    let done = AtomicBool::new(false);

    std::thread::scope(|scope| {
        for _ in 0..4 {
            scope.spawn(|| {
                let mut last = 0;
                while !done.load(Ordering::Acquire) {
                    let snapshot = session.snapshot();
                    let first = generation_of(&snapshot.get(&key(0)).unwrap());
                    for n in 1..KEYS {
                        let value = snapshot.get(&key(n)).unwrap();
                        assert_eq!(generation_of(&value), first, "torn read at key {}", n);
                    }
                    assert!(first >= last, "generation went backwards");
                    last = first;
                }
            });
        }

        for round in 1..=150 {
            session.apply(generation(round)).unwrap();
        }
        done.store(true, Ordering::Release);
    });

    assert_eq!(session.stats().readers, 0);
    session.apply(generation(151)).unwrap();
    let report = session.check().unwrap();
    assert!(report.is_clean(), "{:?}", report);
    assert_eq!(report.pending, 0);
}

#[test]
fn test_filesystem_reads_during_writes() {
    let dir = TempDir::new().unwrap();
    let fs = PakFs::create(dir.path().join("fs.pak"), config()).unwrap();
    fs.write_file("/stable.txt", b"unchanging", None).unwrap();
    let done = AtomicBool::new(false);

    std::thread::scope(|scope| {
        scope.spawn(|| {
            while !done.load(Ordering::Acquire) {
                assert_eq!(fs.read_file("/stable.txt").unwrap(), b"unchanging");
                let attr = fs.getattr("/stable.txt").unwrap();
                assert_eq!(attr.size, 10);
            }
        });

        for i in 0..60 {
            let path = format!("/churn/{}.bin", i % 7);
            fs.write_file(&path, &vec![i as u8; 100 + i * 13], None).unwrap();
            if i % 3 == 0 {
                fs.unlink(&path, None).unwrap();
            }
        }
        done.store(true, Ordering::Release);
    });

    assert!(fs.session().check().unwrap().is_clean());
    fs.close().unwrap();
}
