//! Batch export into a ZIP archive.

mod common;

use async_zip::base::read::mem::ZipFileReader;
use common::TestEnv;

async fn entry_names(archive: Vec<u8>) -> Vec<String> {
    let reader = ZipFileReader::new(archive).await.unwrap();
    reader
        .file()
        .entries()
        .iter()
        .map(|e| e.filename().as_str().unwrap().to_string())
        .collect()
}

#[tokio::test]
async fn test_folder_export_has_exactly_nested_entries() {
    let env = TestEnv::new().await;
    let owner = env.owner("alice", 1024).await;

    let f = env.service.create_folder(owner, 0, "F").await.unwrap();
    let g = env.service.create_folder(owner, f.id, "G").await.unwrap();
    env.upload(owner, f.id, "x.txt", b"x").await;
    env.upload(owner, g.id, "y.txt", b"y").await;

    let mut archive = Vec::new();
    let manifest = env
        .service
        .batch_export(owner, &[f.id], &mut archive)
        .await
        .unwrap();
    assert!(manifest.skipped.is_empty());

    let mut names = entry_names(archive).await;
    names.sort();
    assert_eq!(names, vec!["F/G/y.txt", "F/x.txt"]);
}

#[tokio::test]
async fn test_unreadable_nested_leaf_is_skipped() {
    let env = TestEnv::new().await;
    let owner = env.owner("alice", 1024).await;

    let f = env.service.create_folder(owner, 0, "F").await.unwrap();
    env.upload(owner, f.id, "ok.txt", b"fine").await;
    let bad = env.upload(owner, f.id, "bad.txt", b"broken").await;
    let top = env.upload(owner, 0, "top.txt", b"top").await;
    env.backend.break_reads(bad.path.as_deref().unwrap());

    let mut archive = Vec::new();
    let manifest = env
        .service
        .batch_export(owner, &[f.id, top.id], &mut archive)
        .await
        .unwrap();

    assert_eq!(manifest.skipped.len(), 1);
    assert_eq!(manifest.skipped[0].id, bad.id);
    assert_eq!(manifest.skipped[0].name, "F/bad.txt");

    let mut names = entry_names(archive).await;
    names.sort();
    assert_eq!(names, vec!["F/ok.txt", "top.txt"]);
}

#[tokio::test]
async fn test_empty_export_is_a_valid_archive() {
    let env = TestEnv::new().await;
    let owner = env.owner("alice", 1024).await;
    let empty = env.service.create_folder(owner, 0, "empty").await.unwrap();

    let mut archive = Vec::new();
    let manifest = env
        .service
        .batch_export(owner, &[empty.id], &mut archive)
        .await
        .unwrap();
    assert!(manifest.entries.is_empty());
    assert!(entry_names(archive).await.is_empty());
}

#[tokio::test]
async fn test_truncated_entry_is_flagged_in_the_archive() {
    let env = TestEnv::new().await;
    let owner = env.owner("alice", 1024).await;

    let ok = env.upload(owner, 0, "ok.txt", b"complete").await;
    let torn = env.upload(owner, 0, "torn.txt", b"0123456789").await;
    env.backend.tear_reads(torn.path.as_deref().unwrap());

    let mut archive = Vec::new();
    let manifest = env
        .service
        .batch_export(owner, &[ok.id, torn.id], &mut archive)
        .await
        .unwrap();

    assert_eq!(manifest.entries, vec!["ok.txt"]);
    assert_eq!(manifest.skipped.len(), 1);
    assert_eq!(manifest.skipped[0].name, "torn.txt");
    assert!(manifest.skipped[0].reason.contains("mid-stream"));

    let names = entry_names(archive).await;
    assert_eq!(names, vec!["ok.txt", "torn.txt", "torn.txt.partial"]);
}
