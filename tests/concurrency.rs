//! Concurrent mutations against the same owner and the same objects.
//!
//! These tests verify that quota and reference counting stay exact when
//! operations interleave. The `on_disk` variants run over a pool of several
//! connections, so transactions from different tasks genuinely overlap.

mod common;

use common::TestEnv;
use hoard::{HoardError, UploadRequest};

/// Ten uploads race for room for five.
#[tokio::test]
async fn test_concurrent_uploads_never_exceed_quota() {
    uploads_never_exceed_quota(TestEnv::new().await).await;
}

#[tokio::test]
async fn test_concurrent_uploads_never_exceed_quota_on_disk() {
    uploads_never_exceed_quota(TestEnv::on_disk().await).await;
}

async fn uploads_never_exceed_quota(env: TestEnv) {
    let owner = env.owner("alice", 500).await;

    const NUM_UPLOADS: usize = 10;

    let mut handles = Vec::new();
    for i in 0..NUM_UPLOADS {
        let service = env.service.clone();
        let handle = tokio::spawn(async move {
            let body = vec![i as u8; 100];
            service
                .upload(
                    owner,
                    &UploadRequest::new(0, format!("f{i}.bin"), 100),
                    &body[..],
                )
                .await
        });
        handles.push(handle);
    }

    let mut ok = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => ok += 1,
            Err(HoardError::QuotaExceeded { .. }) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    assert_eq!(ok, 5);
    assert_eq!(env.used(owner).await, 500);
    assert_eq!(env.service.list_children(owner, 0).await.unwrap().len(), 5);
    // Objects written by losing uploads are cleaned up
    assert_eq!(env.backend.object_count(), 5);
}

/// Two referencers of one object are purged at the same time.
#[tokio::test]
async fn test_concurrent_purges_delete_shared_object_once() {
    let env = TestEnv::new().await;
    let alice = env.owner("alice", 1024).await;
    let bob = env.owner("bob", 1024).await;

    let a = env.upload(alice, 0, "a.txt", b"shared").await;
    let b = env
        .service
        .upload(
            bob,
            &UploadRequest::new(0, "b.txt", 6).with_hash(a.hash.clone().unwrap()),
            &b"shared"[..],
        )
        .await
        .unwrap();

    let (s1, s2) = (env.service.clone(), env.service.clone());
    let (a_id, b_id) = (a.id, b.id);
    let h1 = tokio::spawn(async move { s1.purge(a_id).await });
    let h2 = tokio::spawn(async move { s2.purge(b_id).await });
    assert_eq!(h1.await.unwrap().unwrap(), 1);
    assert_eq!(h2.await.unwrap().unwrap(), 1);

    assert_eq!(env.backend.deletes(), 1);
    assert_eq!(env.backend.object_count(), 0);
    assert_eq!(env.used(alice).await, 0);
    assert_eq!(env.used(bob).await, 0);
}

/// A node recycled and restored many times concurrently ends up live.
#[tokio::test]
async fn test_concurrent_recycle_and_restore_settle() {
    let env = TestEnv::new().await;
    let owner = env.owner("alice", 1024).await;
    let id = env.upload(owner, 0, "a.txt", b"abc").await.id;

    let mut handles = Vec::new();
    for i in 0..20 {
        let service = env.service.clone();
        handles.push(tokio::spawn(async move {
            if i % 2 == 0 {
                service.soft_delete(owner, id).await
            } else {
                service.restore(owner, id).await.map(|_| ())
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    env.service.restore(owner, id).await.unwrap();
    assert!(env.service.get_node(owner, id).await.unwrap().is_live());
    assert_eq!(env.used(owner).await, 3);
    assert_eq!(env.backend.deletes(), 0);
}

/// Many uploads into one folder, then purges of every child, all racing.
#[tokio::test]
async fn test_racing_uploads_and_purges_in_a_folder_on_disk() {
    let env = TestEnv::on_disk().await;
    let owner = env.owner("alice", 1 << 20).await;
    let folder = env.service.create_folder(owner, 0, "inbox").await.unwrap();

    let mut uploads = Vec::new();
    for i in 0..40 {
        let service = env.service.clone();
        let parent = folder.id;
        uploads.push(tokio::spawn(async move {
            let body = vec![i as u8; 10];
            service
                .upload(owner, &UploadRequest::new(parent, format!("f{i}"), 10), &body[..])
                .await
        }));
    }
    for handle in uploads {
        handle.await.unwrap().unwrap();
    }

    let children = env.service.list_children(owner, folder.id).await.unwrap();
    assert_eq!(children.len(), 40);
    assert_eq!(env.used(owner).await, 400);

    let mut purges = Vec::new();
    for child in &children {
        let service = env.service.clone();
        let id = child.id;
        purges.push(tokio::spawn(async move { service.purge(id).await }));
    }
    for handle in purges {
        assert_eq!(handle.await.unwrap().unwrap(), 1);
    }

    assert!(env.service.list_children(owner, folder.id).await.unwrap().is_empty());
    assert_eq!(env.used(owner).await, 0);
    assert_eq!(env.backend.object_count(), 0);
    assert_eq!(env.backend.deletes(), 40);
}

/// Several sweepers over the same expired recycle bin.
#[tokio::test]
async fn test_racing_sweeps_on_disk() {
    let env = TestEnv::on_disk().await;
    let owner = env.owner("alice", 1 << 20).await;

    for i in 0..20 {
        let node = env.upload(owner, 0, &format!("old{i}.txt"), b"expired").await;
        env.service.soft_delete(owner, node.id).await.unwrap();
        env.backdate_deletion(node.id, 60).await;
    }

    let mut sweeps = Vec::new();
    for _ in 0..4 {
        let service = env.service.clone();
        sweeps.push(tokio::spawn(async move { service.sweep_recycle_bin(30).await }));
    }
    let mut purged = 0;
    for handle in sweeps {
        purged += handle.await.unwrap().unwrap();
    }

    assert_eq!(purged, 20);
    assert!(env.service.list_recycle_bin(owner).await.unwrap().is_empty());
    assert_eq!(env.used(owner).await, 0);
    assert_eq!(env.backend.object_count(), 0);
    assert_eq!(env.backend.deletes(), 20);
}
