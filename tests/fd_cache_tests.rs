//! File-descriptor cache behavior: staging, fetch-on-demand, flush and
//! release semantics, driven through the filesystem facade.

mod common;

use common::{Call, MIB, MockStore, PART, pattern, test_fs};

use objfs::error::StoreError;
use objfs::fd::EntityState;

#[tokio::test]
async fn small_file_round_trip_uses_single_put() {
    let store = MockStore::new();
    let staging = tempfile::tempdir().unwrap();
    let fs = test_fs(&store, staging.path());

    let data = pattern(1024, 1);
    let handle = fs.create("/f", 0o644, 1000, 1000).await.unwrap();
    fs.write(&handle, 0, &data).await.unwrap();
    fs.release(&handle).await.unwrap();

    assert_eq!(store.object("f").unwrap().body, data);
    assert_eq!(
        store.count_calls(|c| matches!(c, Call::Put { .. })),
        1,
        "a file below the threshold is one simple PUT"
    );
    assert_eq!(store.count_calls(|c| matches!(c, Call::Initiate(_))), 0);

    // Read back through a fresh handle.
    let handle = fs.open("/f", false).await.unwrap();
    let read = fs.read(&handle, 0, 4096).await.unwrap();
    assert_eq!(&read[..], &data[..]);
    fs.release(&handle).await.unwrap();
}

#[tokio::test]
async fn large_file_round_trip_uses_multipart() {
    let store = MockStore::new();
    let staging = tempfile::tempdir().unwrap();
    let fs = test_fs(&store, staging.path());

    let len = 12 * MIB as usize;
    let data = pattern(len, 2);
    let handle = fs.create("/big", 0o644, 1000, 1000).await.unwrap();
    // Write in a few slices to exercise page coalescing.
    for (i, chunk) in data.chunks(4 * MIB as usize).enumerate() {
        fs.write(&handle, (i as u64) * 4 * MIB, chunk).await.unwrap();
    }
    fs.release(&handle).await.unwrap();

    assert_eq!(store.count_calls(|c| matches!(c, Call::Initiate(_))), 1);
    assert!(store.count_calls(|c| matches!(c, Call::UploadPart { .. })) >= 2);
    assert_eq!(store.count_calls(|c| matches!(c, Call::Put { .. })), 0);
    assert_eq!(store.object("big").unwrap().body, data);
}

#[tokio::test]
async fn read_fetches_only_missing_ranges() {
    let store = MockStore::new();
    let staging = tempfile::tempdir().unwrap();
    let fs = test_fs(&store, staging.path());
    store.add_object("f", &pattern(2 * MIB as usize, 3), &[]);

    let handle = fs.open("/f", false).await.unwrap();
    store.clear_calls();

    let read = fs.read(&handle, 100, 200).await.unwrap();
    assert_eq!(&read[..], &pattern(2 * MIB as usize, 3)[100..300]);
    let fetched = store.count_calls(|c| matches!(c, Call::Get { .. }));
    assert!(fetched >= 1, "first read must fetch");

    store.clear_calls();
    let again = fs.read(&handle, 100, 200).await.unwrap();
    assert_eq!(&again[..], &read[..]);
    assert_eq!(
        store.count_calls(|c| matches!(c, Call::Get { .. })),
        0,
        "repeated read is served from the staging file"
    );
    fs.release(&handle).await.unwrap();
}

#[tokio::test]
async fn large_read_is_chunked_at_part_size() {
    let store = MockStore::new();
    let staging = tempfile::tempdir().unwrap();
    let fs = test_fs(&store, staging.path());
    let len = 12 * MIB as usize;
    store.add_object("f", &pattern(len, 4), &[]);

    let handle = fs.open("/f", false).await.unwrap();
    store.clear_calls();
    let read = fs.read(&handle, 0, len as u32).await.unwrap();
    assert_eq!(read.len(), len);

    let gets: Vec<(u64, u64)> = store
        .calls()
        .iter()
        .filter_map(|c| match c {
            Call::Get { offset, len, .. } => Some((*offset, *len)),
            _ => None,
        })
        .collect();
    assert_eq!(gets.len(), 3, "12 MiB at 5 MiB granularity is 3 GETs");
    assert!(gets.iter().all(|(_, len)| *len <= PART));
    fs.release(&handle).await.unwrap();
}

#[tokio::test]
async fn partial_overwrite_of_small_file_loads_then_puts() {
    let store = MockStore::new();
    let staging = tempfile::tempdir().unwrap();
    let fs = test_fs(&store, staging.path());
    let mut expected = pattern(MIB as usize, 5);
    store.add_object("f", &expected, &[]);

    let handle = fs.open("/f", false).await.unwrap();
    fs.write(&handle, 100, b"hello-overwrite").await.unwrap();
    expected[100..115].copy_from_slice(b"hello-overwrite");
    fs.release(&handle).await.unwrap();

    assert_eq!(store.object("f").unwrap().body, expected);
    assert_eq!(store.count_calls(|c| matches!(c, Call::Put { .. })), 1);
}

// S2: a created-but-unflushed file is visible in the namespace.
#[tokio::test]
async fn created_file_is_visible_before_upload() {
    let store = MockStore::new();
    let staging = tempfile::tempdir().unwrap();
    let fs = test_fs(&store, staging.path());

    let handle = fs.create("/x", 0o644, 1000, 1000).await.unwrap();
    assert!(!store.has_object("x"), "nothing uploaded yet");

    let stat = fs.getattr("/x").await.unwrap();
    assert_eq!(stat.size, 0);

    let names: Vec<String> = fs
        .readdir("/")
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();
    assert!(
        names.contains(&"x".to_owned()),
        "readdir must surface the pinned file, got {names:?}"
    );

    fs.release(&handle).await.unwrap();
    assert!(store.has_object("x"), "release uploads the empty file");
    assert_eq!(store.object("x").unwrap().body.len(), 0);
}

// S6 at the fd level: a failed flush keeps the data dirty for a retry.
#[tokio::test]
async fn failed_flush_keeps_entity_dirty_and_retries() {
    let store = MockStore::new();
    let staging = tempfile::tempdir().unwrap();
    let fs = test_fs(&store, staging.path());

    let data = pattern(1024, 6);
    let handle = fs.create("/f", 0o644, 1000, 1000).await.unwrap();
    fs.write(&handle, 0, &data).await.unwrap();

    // Exhaust the 3-attempt budget.
    store.fail_with("put", vec![
        StoreError::ServerTransient("503".into()),
        StoreError::ServerTransient("503".into()),
        StoreError::ServerTransient("503".into()),
    ]);
    let err = fs.flush(&handle).await.unwrap_err();
    assert!(matches!(err, StoreError::ServerTransient(_)));
    assert!(!store.has_object("f"));

    let entity = fs.fd_cache().entity("f").expect("entity still present");
    assert_eq!(entity.state(), EntityState::Error);

    // The sticky error reaches the next operation once, then clears.
    let err = fs.write(&handle, 0, b"y").await.unwrap_err();
    assert!(matches!(err, StoreError::LocalIo(_)));
    assert_eq!(entity.state(), EntityState::Dirty);
    fs.write(&handle, 0, &data).await.unwrap();

    // The next flush retries the upload and succeeds.
    fs.flush(&handle).await.unwrap();
    assert_eq!(entity.state(), EntityState::Clean);
    assert_eq!(store.object("f").unwrap().body, data);
    fs.release(&handle).await.unwrap();
}

#[tokio::test]
async fn transient_put_failure_within_budget_is_invisible() {
    let store = MockStore::new();
    let staging = tempfile::tempdir().unwrap();
    let fs = test_fs(&store, staging.path());

    store.fail_with("put", vec![StoreError::ServerTransient("503".into())]);
    let handle = fs.create("/f", 0o644, 1000, 1000).await.unwrap();
    fs.write(&handle, 0, b"abc").await.unwrap();
    fs.release(&handle).await.unwrap();

    assert_eq!(store.object("f").unwrap().body, b"abc");
    assert_eq!(
        store.count_calls(|c| matches!(c, Call::Put { .. })),
        2,
        "one failed attempt plus the retry"
    );
}

#[tokio::test]
async fn truncate_extends_open_file_with_zeros() {
    let store = MockStore::new();
    let staging = tempfile::tempdir().unwrap();
    let fs = test_fs(&store, staging.path());

    let handle = fs.create("/f", 0o644, 1000, 1000).await.unwrap();
    fs.write(&handle, 0, b"abc").await.unwrap();
    fs.truncate("/f", 10).await.unwrap();
    assert_eq!(fs.getattr("/f").await.unwrap().size, 10);

    let read = fs.read(&handle, 0, 16).await.unwrap();
    assert_eq!(&read[..], b"abc\0\0\0\0\0\0\0");
    fs.release(&handle).await.unwrap();
    assert_eq!(store.object("f").unwrap().body, b"abc\0\0\0\0\0\0\0");
}

#[tokio::test]
async fn truncate_of_closed_file_shrinks_remotely() {
    let store = MockStore::new();
    let staging = tempfile::tempdir().unwrap();
    let fs = test_fs(&store, staging.path());
    store.add_object("f", &pattern(1000, 7), &[]);

    fs.truncate("/f", 100).await.unwrap();

    assert_eq!(store.object("f").unwrap().body, &pattern(1000, 7)[..100]);
    assert!(
        !fs.fd_cache().is_open("f"),
        "the temporary entity is released"
    );
}

#[tokio::test]
async fn open_truncate_discards_remote_content() {
    let store = MockStore::new();
    let staging = tempfile::tempdir().unwrap();
    let fs = test_fs(&store, staging.path());
    store.add_object("f", &pattern(4096, 8), &[]);

    let handle = fs.open("/f", true).await.unwrap();
    store.clear_calls();
    fs.write(&handle, 0, b"new").await.unwrap();
    fs.release(&handle).await.unwrap();

    assert_eq!(store.object("f").unwrap().body, b"new");
    assert_eq!(
        store.count_calls(|c| matches!(c, Call::Get { .. })),
        0,
        "truncated content must never be fetched"
    );
}

#[tokio::test]
async fn second_open_shares_the_entity() {
    let store = MockStore::new();
    let staging = tempfile::tempdir().unwrap();
    let fs = test_fs(&store, staging.path());

    let first = fs.create("/f", 0o644, 1000, 1000).await.unwrap();
    fs.write(&first, 0, b"shared").await.unwrap();

    let second = fs.open("/f", false).await.unwrap();
    assert_ne!(first.fd(), second.fd(), "handles get distinct pseudo-fds");
    let read = fs.read(&second, 0, 16).await.unwrap();
    assert_eq!(&read[..], b"shared");

    fs.release(&first).await.unwrap();
    assert!(
        fs.fd_cache().is_open("f"),
        "entity survives while a handle remains"
    );
    fs.release(&second).await.unwrap();
    assert!(!fs.fd_cache().is_open("f"));
}

#[tokio::test]
async fn staging_file_is_removed_on_release() {
    let store = MockStore::new();
    let staging = tempfile::tempdir().unwrap();
    let fs = test_fs(&store, staging.path());

    let handle = fs.create("/f", 0o644, 1000, 1000).await.unwrap();
    fs.write(&handle, 0, b"z").await.unwrap();
    let staging_path = fs
        .fd_cache()
        .entity("f")
        .expect("entity open")
        .staging_path()
        .to_path_buf();
    assert!(staging_path.exists());

    fs.release(&handle).await.unwrap();
    assert!(!staging_path.exists(), "staging file deleted after release");
}
