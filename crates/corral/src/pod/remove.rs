//! All-or-nothing pod removal.

use std::collections::BTreeSet;
use std::sync::atomic::Ordering;

use corral_common::{ContainerId, CorralError, CorralResult, PodId};

use super::PodRef;
use crate::container::{ContainerRef, ContainerStatus};
use crate::events::EventKind;
use crate::runtime::Runtime;
use crate::teardown::Teardown;

impl Runtime {
    /// Remove a pod and every member container.
    ///
    /// The pod lock and every member lock are held throughout. Validation
    /// runs before anything is touched and fails fast: no member may be
    /// paused or in an unknown state, running members and exec sessions need
    /// `force`, and members may only be depended on by other members. A forced
    /// stop is attempted on every member and any failure aborts before
    /// teardown. Once teardown begins every member is removed on a best-effort basis and the
    /// first error is returned at the end.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` or `InUse` from validation, or the first
    /// teardown error.
    pub async fn remove_pod(&self, id: &PodId, force: bool) -> CorralResult<()> {
        let pod = self.pod(id)?;
        let _pod_guard = pod.inner.lock.lock().await;
        pod.ensure_valid()?;

        let mut members = pod.containers();
        members.sort_by_key(ContainerRef::lock_index);
        let mut guards = Vec::with_capacity(members.len());
        for member in &members {
            guards.push(member.lock().await);
            member.sync_locked().await?;
        }

        self.check_pod_removable(&pod, &members, force)?;

        if force {
            let mut stopping = Teardown::new(format!("pod {id}"));
            for member in &members {
                stopping.record("stop container", member.stop_for_removal_locked().await);
            }
            stopping.finish()?;
        }

        tracing::info!(pod_id = %id, members = members.len(), force, "Removing pod");
        let mut teardown = Teardown::new(format!("pod {id}"));
        for member in &members {
            teardown.record("remove container", member.remove_locked().await);
        }
        drop(guards);

        teardown.record("remove pod from store", self.store().remove_pod(id));
        pod.inner.valid.store(false, Ordering::SeqCst);
        self.locks().free(pod.lock_index());
        self.inner().pods.remove(id);
        pod.emit(EventKind::PodRemove);
        tracing::info!(pod_id = %id, "Removed pod");
        teardown.finish()
    }

    fn check_pod_removable(
        &self,
        pod: &PodRef,
        members: &[ContainerRef],
        force: bool,
    ) -> CorralResult<()> {
        let refuse = |member: &ContainerRef, reason: String| {
            CorralError::invalid_state(
                pod.id(),
                "remove pod",
                format!("container {} {reason}", member.id()),
            )
        };
        let member_ids: BTreeSet<&ContainerId> = members.iter().map(ContainerRef::id).collect();

        for member in members {
            let status = member.status();
            if matches!(status, ContainerStatus::Paused | ContainerStatus::Unknown) {
                return Err(refuse(member, format!("is {status}")));
            }
            if !force {
                if status == ContainerStatus::Running {
                    return Err(refuse(member, "is running".to_string()));
                }
                if !member.exec_sessions().is_empty() {
                    return Err(refuse(member, "has running exec sessions".to_string()));
                }
            }

            let outside: Vec<String> = self
                .store()
                .container_in_use(member.id())?
                .into_iter()
                .filter(|dependent| !member_ids.contains(dependent))
                .map(|dependent| dependent.to_string())
                .collect();
            if !outside.is_empty() {
                return Err(CorralError::InUse {
                    kind: "pod",
                    id: pod.id().to_string(),
                    dependents: outside,
                });
            }
        }
        Ok(())
    }
}
