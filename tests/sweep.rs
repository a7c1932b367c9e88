//! Recycle bin sweep through the public service.

mod common;

use std::time::Duration;

use common::TestEnv;
use hoard::RecycleSweeper;

#[tokio::test]
async fn test_sweep_honours_retention_window() {
    let env = TestEnv::new().await;
    let owner = env.owner("alice", 1024).await;

    let old = env.upload(owner, 0, "old.txt", b"old").await;
    let recent = env.upload(owner, 0, "recent.txt", b"recent").await;
    let live = env.upload(owner, 0, "live.txt", b"live").await;
    for node in [&old, &recent] {
        env.service.soft_delete(owner, node.id).await.unwrap();
    }
    env.backdate_deletion(old.id, 31).await;
    env.backdate_deletion(recent.id, 29).await;

    assert_eq!(env.service.sweep_recycle_bin(30).await.unwrap(), 1);
    assert!(env.service.get_node(owner, old.id).await.is_err());
    assert!(env.service.get_node(owner, recent.id).await.is_ok());
    assert!(env.service.get_node(owner, live.id).await.is_ok());

    assert!(!env.backend.contains(old.path.as_deref().unwrap()));
    assert_eq!(env.used(owner).await, 10);
}

#[tokio::test]
async fn test_sweep_is_idempotent() {
    let env = TestEnv::new().await;
    let owner = env.owner("alice", 1024).await;

    let folder = env.service.create_folder(owner, 0, "docs").await.unwrap();
    let child = env.upload(owner, folder.id, "a.txt", b"abc").await;
    env.service.soft_delete(owner, child.id).await.unwrap();
    env.service.soft_delete(owner, folder.id).await.unwrap();
    env.backdate_deletion(child.id, 40).await;
    env.backdate_deletion(folder.id, 40).await;

    // The folder purge removes the child before its own turn comes
    let (first, second) = tokio::join!(
        env.service.sweep_recycle_bin(30),
        env.service.sweep_recycle_bin(30)
    );
    assert_eq!(first.unwrap() + second.unwrap(), 2);
    assert_eq!(env.service.sweep_recycle_bin(30).await.unwrap(), 0);
    assert_eq!(env.backend.deletes(), 1);
    assert_eq!(env.used(owner).await, 0);
}

#[tokio::test]
async fn test_background_sweeper_runs_and_stops() {
    let env = TestEnv::new().await;
    let owner = env.owner("alice", 1024).await;
    let node = env.upload(owner, 0, "old.txt", b"old").await;
    env.service.soft_delete(owner, node.id).await.unwrap();
    env.backdate_deletion(node.id, 45).await;

    let sweeper = RecycleSweeper::new(env.service.clone(), 30, 3600);
    let token = sweeper.cancel_token();
    let handle = sweeper.spawn();

    let mut purged = false;
    for _ in 0..100 {
        if env.service.get_node(owner, node.id).await.is_err() {
            purged = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(purged);

    token.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
}
