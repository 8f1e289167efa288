//! Integration tests for named volumes.

mod common;

use common::{Harness, config};
use corral::{ContainerStatus, StateStore, VolumeConfig};
use corral_common::CorralError;

#[test_log::test(tokio::test)]
async fn test_mount_is_reference_counted() {
    let h = Harness::new();
    let data = h.runtime.new_volume(VolumeConfig::new("data")).await.unwrap();

    let first = data.mount().await.unwrap();
    let second = data.mount().await.unwrap();
    assert_eq!(first, second);
    assert_eq!(first, data.data_path());
    assert_eq!(data.mount_count(), 2);
    assert_eq!(h.calls.of("mount_volume"), vec!["data"]);

    data.unmount(false).await.unwrap();
    assert_eq!(data.mount_count(), 1);
    assert!(h.calls.of("unmount_volume").is_empty());

    data.unmount(false).await.unwrap();
    assert_eq!(data.mount_count(), 0);
    assert!(data.state().mountpoint.is_none());
    assert_eq!(h.calls.of("unmount_volume"), vec!["data"]);

    // Unmounting an unmounted volume does nothing.
    data.unmount(false).await.unwrap();
    assert_eq!(h.calls.of("unmount_volume").len(), 1);
}

#[test_log::test(tokio::test)]
async fn test_forced_unmount_drops_every_reference() {
    let h = Harness::new();
    let data = h.runtime.new_volume(VolumeConfig::new("data")).await.unwrap();
    for _ in 0..3 {
        data.mount().await.unwrap();
    }

    data.unmount(true).await.unwrap();
    assert_eq!(data.mount_count(), 0);
    assert_eq!(h.store.volume("data").unwrap().state.mount_count, 0);
}

#[test_log::test(tokio::test)]
async fn test_failed_mount_keeps_count() {
    let h = Harness::new();
    let data = h.runtime.new_volume(VolumeConfig::new("data")).await.unwrap();
    h.storage.fail("mount_volume", "data");

    assert!(data.mount().await.is_err());
    assert_eq!(data.mount_count(), 0);
}

#[test_log::test(tokio::test)]
async fn test_containers_share_a_volume() {
    let h = Harness::new();
    let data = h.runtime.new_volume(VolumeConfig::new("data")).await.unwrap();
    let writer = h
        .runtime
        .new_container(config("writer").with_volume("data", "/data"))
        .await
        .unwrap();
    let reader = h
        .runtime
        .new_container(config("reader").with_volume("data", "/srv"))
        .await
        .unwrap();

    writer.start(false).await.unwrap();
    reader.start(false).await.unwrap();
    assert_eq!(data.mount_count(), 2);
    assert_eq!(h.calls.of("mount_volume").len(), 1);

    let mounts = reader.state().bind_mounts;
    assert_eq!(mounts.len(), 1);
    assert_eq!(mounts[0].source, data.data_path());
    assert_eq!(mounts[0].destination, std::path::PathBuf::from("/srv"));

    writer.stop(Some(0)).await.unwrap();
    writer.cleanup().await.unwrap();
    assert_eq!(data.mount_count(), 1);
    assert_eq!(reader.state().bind_mounts.len(), 1);

    reader.stop(Some(0)).await.unwrap();
    reader.cleanup().await.unwrap();
    assert_eq!(data.mount_count(), 0);
    assert_eq!(h.calls.of("unmount_volume"), vec!["data"]);
}

#[test_log::test(tokio::test)]
async fn test_remove_volume_in_use() {
    let h = Harness::new();
    h.runtime.new_volume(VolumeConfig::new("data")).await.unwrap();
    let app = h
        .runtime
        .new_container(config("app").with_volume("data", "/data"))
        .await
        .unwrap();
    app.start(false).await.unwrap();

    let err = h.runtime.remove_volume("data", false).await.unwrap_err();
    match err {
        CorralError::InUse { kind, dependents, .. } => {
            assert_eq!(kind, "volume");
            assert_eq!(dependents, vec!["app".to_string()]);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(app.status(), ContainerStatus::Running);

    h.runtime.remove_volume("data", true).await.unwrap();
    assert!(!app.is_valid());
    assert!(h.runtime.volume("data").unwrap_err().is_not_found());
    assert!(h.store.all_volumes().unwrap().is_empty());
    assert_eq!(h.runtime.locks().allocated(), 0);
    assert_eq!(h.calls.of("unmount_volume"), vec!["data"]);
}

#[test_log::test(tokio::test)]
async fn test_volume_validation() {
    let h = Harness::new();

    let err = h
        .runtime
        .new_container(config("app").with_volume("missing", "/data"))
        .await
        .unwrap_err();
    assert!(err.is_not_found());

    let err = h.runtime.new_volume(VolumeConfig::new("a/b")).await.unwrap_err();
    assert!(matches!(err, CorralError::Config { .. }));

    h.runtime.new_volume(VolumeConfig::new("data")).await.unwrap();
    let err = h.runtime.new_volume(VolumeConfig::new("data")).await.unwrap_err();
    assert!(matches!(err, CorralError::AlreadyExists { kind: "volume", .. }));
    assert_eq!(h.runtime.locks().allocated(), 1);
}

#[test_log::test(tokio::test)]
async fn test_refresh_resets_mount_counts() {
    let h = Harness::new();
    let data = h.runtime.new_volume(VolumeConfig::new("data")).await.unwrap();
    data.mount().await.unwrap();
    data.mount().await.unwrap();

    h.runtime.refresh().await.unwrap();
    assert_eq!(data.mount_count(), 0);
    assert!(data.state().mountpoint.is_none());
    assert_eq!(h.store.volume("data").unwrap().state.mount_count, 0);
    assert!(h.calls.of("unmount_volume").is_empty());
}

#[test_log::test(tokio::test)]
async fn test_container_refresh_keeps_one_reference() {
    let h = Harness::new();
    let data = h.runtime.new_volume(VolumeConfig::new("data")).await.unwrap();
    let app = h
        .runtime
        .new_container(config("app").with_volume("data", "/data"))
        .await
        .unwrap();
    app.start(false).await.unwrap();
    assert_eq!(data.mount_count(), 1);

    app.refresh().await.unwrap();
    assert_eq!(app.status(), ContainerStatus::Running);
    assert_eq!(data.mount_count(), 1);
    assert_eq!(app.state().bind_mounts.len(), 1);
    assert_eq!(h.calls.of("unmount_volume"), vec!["data"]);
    assert_eq!(h.calls.of("mount_volume").len(), 2);

    app.stop(Some(0)).await.unwrap();
    app.cleanup().await.unwrap();
    assert_eq!(data.mount_count(), 0);
    assert_eq!(h.store.volume("data").unwrap().state.mount_count, 0);
    assert_eq!(h.calls.of("unmount_volume").len(), 2);
}

#[test_log::test(tokio::test)]
async fn test_runtime_refresh_remounts_once() {
    let h = Harness::new();
    let data = h.runtime.new_volume(VolumeConfig::new("data")).await.unwrap();
    let app = h
        .runtime
        .new_container(config("app").with_volume("data", "/data"))
        .await
        .unwrap();
    app.start(false).await.unwrap();

    h.runtime.refresh().await.unwrap();
    assert_eq!(app.status(), ContainerStatus::Running);
    assert_eq!(data.mount_count(), 1);
    assert!(h.calls.of("unmount_volume").is_empty());
}
