//! Integration tests for pods.

mod common;

use std::sync::Arc;

use common::{Harness, config, id};
use corral::store::{ContainerRecord, PodRecord};
use corral::{
    ContainerState, ContainerStatus, MemoryStore, NamespaceMode, PodConfig, PodRef, PodState,
    StateStore, WalkError,
};
use corral_common::{CorralError, PodId};

fn pod_id(name: &str) -> PodId {
    PodId::new(name).unwrap()
}

async fn pod_with_members(h: &Harness, members: &[(&str, &[&str])]) -> PodRef {
    let pod = h
        .runtime
        .new_pod(PodConfig::new(pod_id("web"), "web"))
        .await
        .unwrap();
    for (name, deps) in members {
        let mut member = config(name).with_pod(pod.id().clone());
        for dep in *deps {
            member = member.with_dependency(id(dep));
        }
        h.runtime.new_container(member).await.unwrap();
    }
    pod
}

#[test_log::test(tokio::test)]
async fn test_new_pod_starts_infra() {
    let h = Harness::new();
    let pod = h
        .runtime
        .new_pod(PodConfig::new(pod_id("web"), "web"))
        .await
        .unwrap();

    let infra = pod.infra_container().unwrap();
    assert!(infra.config().is_infra);
    assert_eq!(infra.name(), "web-infra");
    assert_eq!(infra.status(), ContainerStatus::Running);
    assert_eq!(infra.pod_id(), Some(pod.id()));
    assert_eq!(
        pod.state().cgroup_path.as_deref(),
        Some("corral.slice/corral-pod-web")
    );

    let err = h
        .runtime
        .new_pod(PodConfig::new(pod_id("other"), "web"))
        .await
        .unwrap_err();
    assert!(matches!(err, CorralError::AlreadyExists { kind: "pod name", .. }));
}

#[test_log::test(tokio::test)]
async fn test_members_join_infra_namespaces() {
    let h = Harness::new();
    let pod = pod_with_members(&h, &[("app", &[])]).await;
    let infra = pod.infra_container().unwrap();
    let app = h.runtime.container(&id("app")).unwrap();

    let joined = NamespaceMode::Container(infra.id().clone());
    assert_eq!(app.config().namespaces.network, joined);
    assert_eq!(app.config().namespaces.ipc, joined);
    assert_eq!(app.config().namespaces.uts, joined);
    assert_eq!(app.config().namespaces.pid, NamespaceMode::Private);
    assert_eq!(app.config().dependencies(), vec![infra.id().clone()]);

    app.start(false).await.unwrap();
    assert_eq!(h.calls.of("create_netns"), vec![infra.id().to_string()]);
}

#[test_log::test(tokio::test)]
async fn test_group_operations() {
    let h = Harness::new();
    let pod = pod_with_members(&h, &[("db", &[]), ("app", &["db"])]).await;

    pod.start().await.unwrap();
    let statuses = pod.status().await.unwrap();
    assert_eq!(statuses.len(), 3);
    assert!(statuses.values().all(|s| *s == ContainerStatus::Running));
    assert!(h.calls.position("start:db").unwrap() < h.calls.position("start:app").unwrap());

    pod.pause().await.unwrap();
    let statuses = pod.status().await.unwrap();
    assert!(statuses.values().all(|s| *s == ContainerStatus::Paused));

    pod.unpause().await.unwrap();
    pod.stop(Some(0)).await.unwrap();
    let statuses = pod.status().await.unwrap();
    assert!(statuses.values().all(|s| *s == ContainerStatus::Stopped));

    pod.restart(Some(0)).await.unwrap();
    let statuses = pod.status().await.unwrap();
    assert!(statuses.values().all(|s| *s == ContainerStatus::Running));
}

#[test_log::test(tokio::test)]
async fn test_pod_kill_signals_members() {
    let h = Harness::new();
    let pod = pod_with_members(&h, &[("app", &[])]).await;
    pod.start().await.unwrap();

    pod.kill(corral::container::SIGKILL).await.unwrap();
    pod.status().await.unwrap();
    for member in pod.containers() {
        let state = member.state();
        assert_eq!(state.status, ContainerStatus::Stopped);
        assert_eq!(state.exit_code, Some(137));
    }
}

#[test_log::test(tokio::test)]
async fn test_partial_pod_start() {
    let h = Harness::new();
    let pod = pod_with_members(&h, &[("a", &[]), ("b", &["a"]), ("c", &[])]).await;
    h.supervisor.fail("start", "a");

    let err = pod.start().await.unwrap_err();
    let failures = err.failures().unwrap();
    assert_eq!(failures.keys().cloned().collect::<Vec<_>>(), vec![id("a"), id("b")]);
    assert!(matches!(err, WalkError::Partial { total: 4, .. }));

    let statuses = pod.status().await.unwrap();
    assert_eq!(statuses[&id("c")], ContainerStatus::Running);
    assert_eq!(statuses[&id("a")], ContainerStatus::Configured);
}

#[test_log::test(tokio::test)]
async fn test_remove_running_pod_needs_force() {
    let h = Harness::new();
    let pod = pod_with_members(&h, &[("db", &[]), ("app", &["db"])]).await;
    pod.start().await.unwrap();
    let writes = h.store.write_count();

    let err = h.runtime.remove_pod(pod.id(), false).await.unwrap_err();
    assert!(err.is_invalid_state());
    assert_eq!(pod.containers().len(), 3);
    assert_eq!(h.store.write_count(), writes);

    let mut events = h.runtime.subscribe();
    h.runtime.remove_pod(pod.id(), true).await.unwrap();
    assert!(h.runtime.pods().is_empty());
    assert!(h.runtime.containers().is_empty());
    assert!(h.store.all_containers().unwrap().is_empty());
    assert!(h.store.all_pods().unwrap().is_empty());
    assert_eq!(h.runtime.locks().allocated(), 0);
    assert_eq!(h.calls.of("delete_storage").len(), 3);

    let kinds: Vec<_> = common::drain(&mut events).into_iter().map(|e| e.kind).collect();
    assert_eq!(kinds.last(), Some(&corral::EventKind::PodRemove));

    let err = pod.start().await.unwrap_err();
    assert!(matches!(err, WalkError::NotStarted(CorralError::Removed { .. })));
}

#[test_log::test(tokio::test)]
async fn test_remove_pod_refuses_outside_dependents() {
    let store = Arc::new(MemoryStore::new());
    let pod_config = PodConfig::new(pod_id("web"), "web").without_infra();
    store
        .add_pod(&PodRecord {
            config: pod_config,
            state: PodState::default(),
            lock_index: 0,
        })
        .unwrap();
    store
        .add_container(&ContainerRecord {
            config: config("db").with_pod(pod_id("web")),
            state: ContainerState::default(),
            lock_index: 1,
        })
        .unwrap();
    store
        .add_container(&ContainerRecord {
            config: config("client").with_dependency(id("db")),
            state: ContainerState::default(),
            lock_index: 2,
        })
        .unwrap();

    let h = Harness::with_store(store);
    let err = h.runtime.remove_pod(&pod_id("web"), true).await.unwrap_err();
    match err {
        CorralError::InUse { kind, dependents, .. } => {
            assert_eq!(kind, "pod");
            assert_eq!(dependents, vec!["client".to_string()]);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(h.runtime.containers().len(), 2);
    assert!(h.runtime.pod(&pod_id("web")).is_ok());
}

#[test_log::test(tokio::test)]
async fn test_remove_pod_refuses_paused_member_even_with_force() {
    let h = Harness::new();
    let pod = pod_with_members(&h, &[("app", &[])]).await;
    pod.start().await.unwrap();
    pod.pause().await.unwrap();

    let err = h.runtime.remove_pod(pod.id(), true).await.unwrap_err();
    assert!(err.is_invalid_state());
    assert_eq!(pod.containers().len(), 2);
    assert!(h.calls.of("stop").is_empty());
}

#[test_log::test(tokio::test)]
async fn test_forced_pod_removal_stops_every_member_before_failing() {
    let h = Harness::new();
    let pod = pod_with_members(&h, &[("a", &[]), ("b", &[])]).await;
    pod.start().await.unwrap();
    h.supervisor.fail("stop", "a");

    let err = h.runtime.remove_pod(pod.id(), true).await.unwrap_err();
    match err {
        CorralError::RuntimeFailure { operation, id, .. } => {
            assert_eq!(operation, "stop");
            assert_eq!(id, "a");
        }
        other => panic!("unexpected error: {other}"),
    }

    let stopped = h.calls.of("stop");
    assert!(stopped.contains(&"a".to_string()));
    assert!(stopped.contains(&"b".to_string()));
    assert_eq!(stopped.len(), 3);
    assert_eq!(h.runtime.container(&id("b")).unwrap().status(), ContainerStatus::Stopped);

    assert!(h.runtime.pod(pod.id()).is_ok());
    assert_eq!(pod.containers().len(), 3);
    assert!(h.calls.of("delete_storage").is_empty());
}

#[test_log::test(tokio::test)]
async fn test_infra_container_cannot_be_removed_alone() {
    let h = Harness::new();
    let pod = pod_with_members(&h, &[]).await;
    let infra = pod.infra_container().unwrap();

    let err = h.runtime.remove_container(infra.id(), true).await.unwrap_err();
    assert!(err.is_invalid_state());
    assert!(infra.is_valid());
}

#[test_log::test(tokio::test)]
async fn test_pod_without_infra() {
    let h = Harness::new();
    let pod = h
        .runtime
        .new_pod(PodConfig::new(pod_id("batch"), "batch").without_infra())
        .await
        .unwrap();
    assert!(pod.infra_container().is_none());

    let job = h
        .runtime
        .new_container(config("job").with_pod(pod.id().clone()))
        .await
        .unwrap();
    assert_eq!(job.config().namespaces.network, NamespaceMode::Private);
    assert!(job.config().dependencies().is_empty());

    pod.start().await.unwrap();
    assert_eq!(h.calls.of("create_netns"), vec!["job"]);
}

#[test_log::test(tokio::test)]
async fn test_failed_infra_leaves_nothing_behind() {
    let h = Harness::new();
    h.network.not_ready();

    let err = h
        .runtime
        .new_pod(PodConfig::new(pod_id("web"), "web"))
        .await
        .unwrap_err();
    assert!(matches!(err, CorralError::NetworkNotReady { .. }));
    assert!(h.runtime.pods().is_empty());
    assert!(h.runtime.containers().is_empty());
    assert_eq!(h.runtime.locks().allocated(), 0);
}

#[test_log::test(tokio::test)]
async fn test_member_of_missing_pod_is_rejected() {
    let h = Harness::new();
    let err = h
        .runtime
        .new_container(config("app").with_pod(pod_id("ghost")))
        .await
        .unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(h.runtime.locks().allocated(), 0);
}
