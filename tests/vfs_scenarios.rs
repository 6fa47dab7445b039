//! End-to-end filesystem scenarios driven through the request boundary

use pakfs::{dispatch, EntryKind, PakConfig, PakError, PakFs, Reply, Request};
use std::time::Instant;
use tempfile::TempDir;

fn config() -> PakConfig {
    PakConfig {
        block_size: 1024,
        key_width: 32,
        cache_capacity: 64,
        ..PakConfig::default()
    }
}

fn call(fs: &PakFs, request: Request) -> Reply {
    dispatch(fs, request, None).unwrap()
}

fn errno(fs: &PakFs, request: Request) -> i32 {
    dispatch(fs, request, None).unwrap_err().errno()
}

fn opened(reply: Reply) -> u64 {
    match reply {
        Reply::Opened(handle) => handle,
        other => panic!("expected a handle, got {:?}", other),
    }
}

#[test]
fn test_sword_png_round_trip_through_requests() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("assets.pak");
    let image: Vec<u8> = (0..5000u32).map(|i| (i % 256) as u8).collect();

    let fs = PakFs::create(&path, config()).unwrap();
    let handle = opened(call(
        &fs,
        Request::Create {
            path: "/items/sword.png".into(),
        },
    ));

    // Written in uneven chunks, the way a kernel transport would deliver them
    let mut offset = 0;
    for chunk in image.chunks(1777) {
        let reply = call(
            &fs,
            Request::Write {
                handle,
                offset,
                data: chunk.to_vec(),
            },
        );
        assert_eq!(reply, Reply::Written(chunk.len()));
        offset += chunk.len() as u64;
    }
    assert_eq!(call(&fs, Request::Flush { handle }), Reply::Done);
    assert_eq!(call(&fs, Request::Release { handle }), Reply::Done);

    match call(&fs, Request::ReadDir { path: "/items".into() }) {
        Reply::Entries(entries) => {
            assert_eq!(entries.len(), 1);
            assert_eq!(entries[0].name, "sword.png");
            assert_eq!(entries[0].kind, EntryKind::File);
        }
        other => panic!("unexpected reply {:?}", other),
    }

    call(
        &fs,
        Request::Rename {
            from: "/items/sword.png".into(),
            to: "/items/sword2.png".into(),
        },
    );
    fs.close().unwrap();

    let fs = PakFs::open(&path, config()).unwrap();
    let handle = opened(call(
        &fs,
        Request::Open {
            path: "/items/sword2.png".into(),
            write: false,
        },
    ));
    let mut read_back = Vec::new();
    loop {
        let reply = call(
            &fs,
            Request::Read {
                handle,
                offset: read_back.len() as u64,
                len: 4096,
            },
        );
        match reply {
            Reply::Data(data) if data.is_empty() => break,
            Reply::Data(data) => read_back.extend_from_slice(&data),
            other => panic!("unexpected reply {:?}", other),
        }
    }
    assert_eq!(read_back, image);

    assert_eq!(
        errno(
            &fs,
            Request::GetAttr {
                path: "/items/sword.png".into()
            }
        ),
        libc::ENOENT
    );
    fs.close().unwrap();
}

#[test]
fn test_errors_map_to_errno() {
    let dir = TempDir::new().unwrap();
    let fs = PakFs::create(dir.path().join("e.pak"), config()).unwrap();
    fs.write_file("/dir/file", b"x", None).unwrap();

    assert_eq!(
        errno(&fs, Request::Create { path: "/dir/file".into() }),
        libc::EEXIST
    );
    assert_eq!(
        errno(&fs, Request::ReadDir { path: "/dir/file".into() }),
        libc::ENOTDIR
    );
    assert_eq!(errno(&fs, Request::Rmdir { path: "/dir".into() }), libc::ENOTEMPTY);
    assert_eq!(
        errno(&fs, Request::Unlink { path: "/missing".into() }),
        libc::ENOENT
    );
    assert_eq!(
        errno(
            &fs,
            Request::Open {
                path: "/dir".into(),
                write: false
            }
        ),
        libc::EISDIR
    );
    assert_eq!(errno(&fs, Request::Flush { handle: 999 }), libc::EBADF);
    assert_eq!(
        errno(&fs, Request::GetAttr { path: "/a/../b".into() }),
        libc::EINVAL
    );
}

#[test]
fn test_read_only_requests() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("ro.pak");
    let fs = PakFs::create(&path, config()).unwrap();
    fs.write_file("/readme", b"hello", None).unwrap();
    fs.close().unwrap();

    let fs = PakFs::open(&path, config().read_only(true)).unwrap();
    assert_eq!(
        errno(&fs, Request::Mkdir { path: "/new".into() }),
        libc::EROFS
    );
    let handle = opened(call(
        &fs,
        Request::Open {
            path: "/readme".into(),
            write: false,
        },
    ));
    assert_eq!(
        call(
            &fs,
            Request::Read {
                handle,
                offset: 1,
                len: 3
            }
        ),
        Reply::Data(b"ell".to_vec())
    );
    assert_eq!(call(&fs, Request::Release { handle }), Reply::Done);
    fs.close().unwrap();
}

#[test]
fn test_deadline_aborts_request() {
    let dir = TempDir::new().unwrap();
    let fs = PakFs::create(dir.path().join("d.pak"), config()).unwrap();

    let err = dispatch(
        &fs,
        Request::Mkdir {
            path: "/late".into(),
        },
        Some(Instant::now()),
    )
    .unwrap_err();
    assert!(matches!(err, PakError::TimedOut));
    assert_eq!(err.errno(), libc::ETIMEDOUT);
    assert!(!fs.exists("/late").unwrap());
}

#[test]
fn test_truncate_requests() {
    let dir = TempDir::new().unwrap();
    let fs = PakFs::create(dir.path().join("t.pak"), config()).unwrap();
    fs.write_file("/save.dat", &[7u8; 3000], None).unwrap();

    call(
        &fs,
        Request::Truncate {
            path: "/save.dat".into(),
            size: 10,
        },
    );
    assert_eq!(fs.read_file("/save.dat").unwrap(), vec![7u8; 10]);

    let handle = opened(call(
        &fs,
        Request::Open {
            path: "/save.dat".into(),
            write: true,
        },
    ));
    call(&fs, Request::Ftruncate { handle, size: 0 });
    match call(
        &fs,
        Request::GetAttr {
            path: "/save.dat".into(),
        },
    ) {
        Reply::Attr(attr) => assert_eq!(attr.size, 0),
        other => panic!("unexpected reply {:?}", other),
    }
    call(&fs, Request::Fsync { handle });
    assert!(fs.read_file("/save.dat").unwrap().is_empty());
    call(&fs, Request::Release { handle });

    assert!(fs.session().check().unwrap().is_clean());
}

#[test]
fn test_flush_through_one_handle_updates_the_others() {
    let dir = TempDir::new().unwrap();
    let fs = PakFs::create(dir.path().join("h.pak"), config()).unwrap();
    let first = fs.create_file("/shared.log", None).unwrap();
    let second = fs.open_file("/shared.log", true).unwrap();

    let body: Vec<u8> = (0..100u8).collect();
    fs.write(second, 0, &body).unwrap();
    fs.flush(second, None).unwrap();
    assert_eq!(fs.getattr("/shared.log").unwrap().size, 100);

    // The clean handle sees the committed bytes
    assert_eq!(fs.read(first, 0, 1000).unwrap(), body);

    // Its own write lands on top of them rather than replacing the file
    fs.write(first, 0, b"HELLO").unwrap();
    fs.flush(first, None).unwrap();

    let mut expected = body.clone();
    expected[..5].copy_from_slice(b"HELLO");
    assert_eq!(fs.read_file("/shared.log").unwrap(), expected);
    assert_eq!(fs.read(second, 0, 1000).unwrap(), expected);

    fs.release(first, None).unwrap();
    fs.release(second, None).unwrap();
    assert!(fs.session().check().unwrap().is_clean());
}

#[test]
fn test_dirty_handle_rebases_onto_newer_commit() {
    let dir = TempDir::new().unwrap();
    let fs = PakFs::create(dir.path().join("h.pak"), config()).unwrap();
    fs.write_file("/save.dat", &[1u8; 10], None).unwrap();

    let slow = fs.open_file("/save.dat", true).unwrap();
    let fast = fs.open_file("/save.dat", true).unwrap();
    fs.write(slow, 2, b"ss").unwrap();

    fs.write(fast, 10, &[2u8; 40]).unwrap();
    fs.flush(fast, None).unwrap();

    // The pending handle now covers the grown file
    assert_eq!(fs.getattr("/save.dat").unwrap().size, 50);
    fs.flush(slow, None).unwrap();

    let content = fs.read_file("/save.dat").unwrap();
    assert_eq!(content.len(), 50);
    assert_eq!(&content[..4], &[1, 1, b's', b's']);
    assert_eq!(&content[10..], &[2u8; 40][..]);

    // Replacing the whole file moves open handles too
    fs.write_file("/save.dat", b"short", None).unwrap();
    assert_eq!(fs.read(fast, 0, 100).unwrap(), b"short");
    fs.close().unwrap();
}
