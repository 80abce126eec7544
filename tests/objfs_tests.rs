//! Namespace behavior through the facade: directory markers, negative
//! caching, readdir priming, rename and metadata-only updates.

mod common;

use std::time::Duration;

use common::{Call, MockStore, pattern, test_fs, test_fs_with_stat_config};

use objfs::cache::{ExpiryMode, StatCacheConfig};
use objfs::error::StoreError;

// S1: mkdir then readdir; the marker is a zero-byte directory-typed object.
#[tokio::test]
async fn mkdir_creates_canonical_marker() {
    let store = MockStore::new();
    let staging = tempfile::tempdir().unwrap();
    let fs = test_fs(&store, staging.path());

    fs.mkdir("/a", 0o755, 1000, 1000).await.unwrap();

    let marker = store.object("a/").expect("marker object");
    assert!(marker.body.is_empty());
    assert_eq!(
        marker.meta.get("content-type"),
        Some("application/x-directory")
    );

    let entries = fs.readdir("/").await.unwrap();
    let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec!["a"]);
    assert!(entries[0].is_dir);

    let stat = fs.getattr("/a").await.unwrap();
    assert!(stat.is_dir());
    assert_eq!(stat.mode & 0o777, 0o755);
}

#[tokio::test]
async fn getattr_accepts_all_directory_spellings() {
    let store = MockStore::new();
    let staging = tempfile::tempdir().unwrap();
    let fs = test_fs(&store, staging.path());

    // Canonical marker.
    store.add_dir("canonical");
    assert!(fs.getattr("/canonical").await.unwrap().is_dir());

    // Legacy suffix marker.
    store.add_object("legacy_$folder$", b"", &[]);
    assert!(fs.getattr("/legacy").await.unwrap().is_dir());

    // Implicit prefix: children but no marker at all.
    store.add_object("implicit/child", b"x", &[]);
    assert!(fs.getattr("/implicit").await.unwrap().is_dir());
}

// S5: a cached 404 answers until it expires.
#[tokio::test]
async fn negative_cache_expires_into_a_fresh_probe() {
    let store = MockStore::new();
    let staging = tempfile::tempdir().unwrap();
    let fs = test_fs_with_stat_config(&store, staging.path(), StatCacheConfig {
        capacity: 100,
        expire: Some(Duration::from_millis(40)),
        expiry_mode: ExpiryMode::Fixed,
        negative_cache: true,
    });

    let err = fs.getattr("/a/b").await.unwrap_err();
    assert!(matches!(err, StoreError::NotFound));
    let probes = store.count_calls(|c| matches!(c, Call::Head(_) | Call::List { .. }));
    store.clear_calls();

    // Fresh negative entry: no traffic.
    let err = fs.getattr("/a/b").await.unwrap_err();
    assert!(matches!(err, StoreError::NotFound));
    assert!(
        store.calls().is_empty(),
        "a fresh negative entry must answer locally"
    );

    tokio::time::sleep(Duration::from_millis(60)).await;
    let err = fs.getattr("/a/b").await.unwrap_err();
    assert!(matches!(err, StoreError::NotFound));
    assert_eq!(
        store.count_calls(|c| matches!(c, Call::Head(_) | Call::List { .. })),
        probes,
        "an expired negative entry probes the store again"
    );
}

#[tokio::test]
async fn getattr_is_served_from_cache_after_first_head() {
    let store = MockStore::new();
    let staging = tempfile::tempdir().unwrap();
    let fs = test_fs(&store, staging.path());
    store.add_object("f", b"hello", &[("x-amz-meta-mode", "33188")]);

    let stat = fs.getattr("/f").await.unwrap();
    assert_eq!(stat.size, 5);
    store.clear_calls();

    let again = fs.getattr("/f").await.unwrap();
    assert_eq!(again, stat);
    assert!(store.calls().is_empty(), "second getattr is a cache hit");
}

#[tokio::test]
async fn readdir_primes_stats_with_bounded_heads() {
    let store = MockStore::new();
    let staging = tempfile::tempdir().unwrap();
    let fs = test_fs(&store, staging.path());
    store.add_dir("d");
    for i in 0..5 {
        store.add_object(&format!("d/f{i}"), b"abc", &[]);
    }

    let entries = fs.readdir("/d").await.unwrap();
    assert_eq!(entries.len(), 5);
    assert!(
        entries.iter().all(|e| e.stat.is_some()),
        "readdir primes every child's stat"
    );
    assert_eq!(
        store.count_calls(|c| matches!(c, Call::Head(_))),
        5,
        "one HEAD per child on the first listing"
    );

    store.clear_calls();
    let again = fs.readdir("/d").await.unwrap();
    assert_eq!(again.len(), 5);
    assert_eq!(
        store.count_calls(|c| matches!(c, Call::Head(_))),
        0,
        "second readdir reuses cached stats (etags unchanged)"
    );
}

#[tokio::test]
async fn readdir_spots_stale_etags_and_reprimes() {
    let store = MockStore::new();
    let staging = tempfile::tempdir().unwrap();
    let fs = test_fs(&store, staging.path());
    store.add_dir("d");
    store.add_object("d/f", b"v1", &[]);

    fs.readdir("/d").await.unwrap();
    // Out-of-band overwrite changes the etag.
    store.add_object("d/f", b"version-2", &[]);
    store.clear_calls();

    let entries = fs.readdir("/d").await.unwrap();
    let f = entries.iter().find(|e| e.name == "f").unwrap();
    assert_eq!(
        f.stat.expect("primed").size,
        9,
        "stale cached size must be replaced"
    );
    assert_eq!(
        store.count_calls(|c| matches!(c, Call::Head(_))),
        1,
        "etag mismatch forces one HEAD"
    );
}

#[tokio::test]
async fn readdir_paginates_and_merges_markers() {
    let store = MockStore::new();
    let staging = tempfile::tempdir().unwrap();
    let fs = test_fs(&store, staging.path());
    store.set_page_size(2);
    store.add_dir("d");
    store.add_dir("d/sub");
    store.add_object("d/sub/inner", b"x", &[]);
    for i in 0..5 {
        store.add_object(&format!("d/f{i}"), b"", &[]);
    }

    let entries = fs.readdir("/d").await.unwrap();
    let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec!["f0", "f1", "f2", "f3", "f4", "sub"]);
    assert!(entries.last().unwrap().is_dir);
    assert!(
        store.count_calls(|c| matches!(c, Call::List { .. })) > 1,
        "page size 2 forces multiple listing pages"
    );
}

#[tokio::test]
async fn rmdir_refuses_occupied_directories() {
    let store = MockStore::new();
    let staging = tempfile::tempdir().unwrap();
    let fs = test_fs(&store, staging.path());
    store.add_dir("d");
    store.add_object("d/f", b"x", &[]);

    let err = fs.rmdir("/d").await.unwrap_err();
    assert_eq!(err.errno(), libc::ENOTEMPTY);
    assert!(store.has_object("d/"));

    fs.unlink("/d/f").await.unwrap();
    fs.rmdir("/d").await.unwrap();
    assert!(!store.has_object("d/"));
    assert!(
        matches!(fs.getattr("/d").await, Err(StoreError::NotFound)),
        "removed directory disappears from the namespace"
    );
}

#[tokio::test]
async fn rename_moves_object_and_cache_entries() {
    let store = MockStore::new();
    let staging = tempfile::tempdir().unwrap();
    let fs = test_fs(&store, staging.path());
    store.add_object("old", b"content", &[("x-amz-meta-mode", "33152")]);

    fs.getattr("/old").await.unwrap();
    fs.rename("/old", "/new").await.unwrap();

    assert!(!store.has_object("old"));
    assert_eq!(store.object("new").unwrap().body, b"content");
    assert_eq!(
        store.object("new").unwrap().meta.get("x-amz-meta-mode"),
        Some("33152"),
        "rename preserves metadata"
    );
    assert_eq!(store.count_calls(|c| matches!(c, Call::Copy { .. })), 1);
    assert_eq!(store.count_calls(|c| matches!(c, Call::Get { .. })), 0);

    assert!(matches!(
        fs.getattr("/old").await,
        Err(StoreError::NotFound)
    ));
    assert_eq!(fs.getattr("/new").await.unwrap().size, 7);
}

#[tokio::test]
async fn rename_of_dirty_open_file_flushes_first() {
    let store = MockStore::new();
    let staging = tempfile::tempdir().unwrap();
    let fs = test_fs(&store, staging.path());

    let handle = fs.create("/pending", 0o644, 1000, 1000).await.unwrap();
    fs.write(&handle, 0, b"fresh bytes").await.unwrap();
    fs.rename("/pending", "/final").await.unwrap();

    assert_eq!(store.object("final").unwrap().body, b"fresh bytes");
    assert!(!store.has_object("pending"));
    fs.release(&handle).await.unwrap();
}

#[tokio::test]
async fn directory_rename_moves_every_descendant() {
    let store = MockStore::new();
    let staging = tempfile::tempdir().unwrap();
    let fs = test_fs(&store, staging.path());
    store.add_dir("dir");
    store.add_object("dir/a", b"1", &[]);
    store.add_object("dir/sub/b", b"2", &[]);

    fs.rename("/dir", "/moved").await.unwrap();

    assert!(store.has_object("moved/"));
    assert_eq!(store.object("moved/a").unwrap().body, b"1");
    assert_eq!(store.object("moved/sub/b").unwrap().body, b"2");
    assert!(!store.has_object("dir/"));
    assert!(!store.has_object("dir/a"));
    assert!(!store.has_object("dir/sub/b"));
}

#[tokio::test]
async fn chmod_is_a_metadata_only_copy() {
    let store = MockStore::new();
    let staging = tempfile::tempdir().unwrap();
    let fs = test_fs(&store, staging.path());
    store.add_object("f", &pattern(4096, 1), &[
        ("x-amz-meta-mode", "33188"), // 0o100644
    ]);

    fs.chmod("/f", 0o600).await.unwrap();

    let copies: Vec<(String, String)> = store
        .calls()
        .iter()
        .filter_map(|c| match c {
            Call::Copy { src, dst } => Some((src.clone(), dst.clone())),
            _ => None,
        })
        .collect();
    assert_eq!(copies, vec![("f".to_owned(), "f".to_owned())]);
    assert_eq!(store.count_calls(|c| matches!(c, Call::Put { .. })), 0);
    assert_eq!(store.count_calls(|c| matches!(c, Call::Get { .. })), 0);

    let mode: u32 = store
        .object("f")
        .unwrap()
        .meta
        .get("x-amz-meta-mode")
        .unwrap()
        .parse()
        .unwrap();
    assert_eq!(mode & 0o777, 0o600);
    assert_eq!(mode & libc::S_IFMT, libc::S_IFREG, "type bits preserved");

    let stat = fs.getattr("/f").await.unwrap();
    assert_eq!(stat.mode & 0o777, 0o600);
}

#[tokio::test]
async fn chmod_on_pending_file_stays_local_until_flush() {
    let store = MockStore::new();
    let staging = tempfile::tempdir().unwrap();
    let fs = test_fs(&store, staging.path());

    let handle = fs.create("/pending", 0o644, 1000, 1000).await.unwrap();
    fs.chmod("/pending", 0o711).await.unwrap();
    assert_eq!(
        store.count_calls(|c| matches!(c, Call::Copy { .. })),
        0,
        "nothing to copy before the first upload"
    );
    assert_eq!(fs.getattr("/pending").await.unwrap().mode & 0o777, 0o711);

    fs.release(&handle).await.unwrap();
    let mode: u32 = store
        .object("pending")
        .unwrap()
        .meta
        .get("x-amz-meta-mode")
        .unwrap()
        .parse()
        .unwrap();
    assert_eq!(mode & 0o777, 0o711, "mode travels with the first upload");
}

#[tokio::test]
async fn utimens_updates_mtime_metadata() {
    let store = MockStore::new();
    let staging = tempfile::tempdir().unwrap();
    let fs = test_fs(&store, staging.path());
    store.add_object("f", b"x", &[]);

    let mtime = std::time::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
    fs.utimens("/f", None, Some(mtime)).await.unwrap();

    let stored = store.object("f").unwrap();
    assert!(
        stored
            .meta
            .get("x-amz-meta-mtime")
            .unwrap()
            .starts_with("1700000000"),
        "mtime lands in object metadata"
    );
    assert_eq!(fs.getattr("/f").await.unwrap().mtime, mtime);
}

#[tokio::test]
async fn symlink_round_trip() {
    let store = MockStore::new();
    let staging = tempfile::tempdir().unwrap();
    let fs = test_fs(&store, staging.path());

    fs.symlink("target/file", "/link", 1000, 1000).await.unwrap();

    let object = store.object("link").expect("symlink object");
    assert_eq!(object.body, b"target/file");
    let stat = fs.getattr("/link").await.unwrap();
    assert!(stat.is_symlink());

    // Cached resolution, then a cold one through a fresh filesystem.
    assert_eq!(fs.readlink("/link").await.unwrap(), "target/file");
    store.clear_calls();
    assert_eq!(fs.readlink("/link").await.unwrap(), "target/file");
    assert!(store.calls().is_empty(), "readlink hits the symlink cache");

    let cold = test_fs(&store, staging.path());
    assert_eq!(cold.readlink("/link").await.unwrap(), "target/file");
    assert_eq!(
        cold.readlink("/not-a-link").await.unwrap_err().errno(),
        libc::ENOENT
    );
}

#[tokio::test]
async fn unlink_invalidates_caches() {
    let store = MockStore::new();
    let staging = tempfile::tempdir().unwrap();
    let fs = test_fs(&store, staging.path());
    store.add_object("f", b"x", &[]);

    fs.getattr("/f").await.unwrap();
    fs.unlink("/f").await.unwrap();
    assert!(!store.has_object("f"));
    assert!(matches!(
        fs.getattr("/f").await,
        Err(StoreError::NotFound)
    ));
}

#[tokio::test]
async fn root_getattr_never_touches_the_store() {
    let store = MockStore::new();
    let staging = tempfile::tempdir().unwrap();
    let fs = test_fs(&store, staging.path());

    let stat = fs.getattr("/").await.unwrap();
    assert!(stat.is_dir());
    assert!(store.calls().is_empty());
}
