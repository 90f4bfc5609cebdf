mod common;

use common::*;
use photolib_lib::LibraryError;

#[tokio::test]
async fn successful_rebuild_swaps_catalog_and_keeps_backup() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    write_media(root, "in/a.jpg", "a", "2023:01:01 00:00:01");
    write_media(root, "in/b.jpg", "b", "2023:01:01 00:00:02");
    write_media(root, "in/c.jpg", "c", "2023:01:01 00:00:03");

    let fake = FakeMetadata::new();
    let library = open_library(root, &fake).await;
    library.synchronize().await.unwrap();
    let doomed = library.entries().await.unwrap()[0].id;
    library.delete_entries(&[doomed]).await.unwrap();
    let before = snapshot(&library.entries().await.unwrap());

    let report = library.rebuild().await.unwrap();
    assert!(report.success);
    assert_eq!(report.entries, 2);
    let backup = report.backup_path.expect("backup on success");
    assert!(backup.exists());
    assert!(!library.layout().rebuild_temp_path().exists());

    // 文件已在规范路径，重建不移动任何文件
    assert_eq!(snapshot(&library.entries().await.unwrap()), before);
    assert_eq!(library.deleted_entries().await.unwrap().len(), 1);
    assert!(library.incomplete_operations().await.unwrap().is_empty());
}

#[tokio::test]
async fn failed_rebuild_leaves_active_catalog_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    for i in 0..10 {
        write_media(root, &format!("in/{}.jpg", i), &format!("body-{}", i), "2020:05:05 05:05:05");
    }

    let fake = FakeMetadata::new();
    let library = open_library(root, &fake).await;
    library.synchronize().await.unwrap();
    let before = snapshot(&library.entries().await.unwrap());
    let catalog_bytes = std::fs::read(library.layout().catalog_path()).unwrap();

    // 处理到第 4 个文件时磁盘写满
    fake.storage_full_after(4);
    let err = library.rebuild().await.unwrap_err();
    assert!(matches!(err, LibraryError::StorageFull(_)), "{err:?}");

    assert_eq!(std::fs::read(library.layout().catalog_path()).unwrap(), catalog_bytes);
    assert_eq!(snapshot(&library.entries().await.unwrap()), before);
    assert_eq!(count_files(&library.layout().backup_dir()), 0);
    assert!(!library.layout().rebuild_temp_path().exists());
    assert!(library.incomplete_operations().await.unwrap().is_empty());
}

#[tokio::test]
async fn leftover_temporary_catalog_is_removed_on_open() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    let fake = FakeMetadata::new();
    let library = open_library(root, &fake).await;
    let temp = library.layout().rebuild_temp_path();
    library.close().await;
    drop(library);

    std::fs::write(&temp, b"half-built").unwrap();
    let library = open_library(root, &fake).await;
    assert!(!temp.exists());
    assert!(library.entries().await.unwrap().is_empty());
}
