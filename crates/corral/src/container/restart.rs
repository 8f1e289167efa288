//! Restart policy evaluation.

use serde::{Deserialize, Serialize};

use super::state::ContainerStatus;

/// When a container is restarted after its main process exits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicyKind {
    /// Never restart.
    #[default]
    Never,
    /// Restart on a non-zero exit code.
    OnFailure,
    /// Restart on every exit.
    Always,
}

/// Restart policy with an optional retry cap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RestartPolicy {
    /// Policy kind.
    pub kind: RestartPolicyKind,
    /// Retry cap for `OnFailure`; zero means unlimited.
    #[serde(default)]
    pub max_retries: u32,
}

impl RestartPolicy {
    /// Never restart.
    pub const NEVER: Self = Self {
        kind: RestartPolicyKind::Never,
        max_retries: 0,
    };

    /// Always restart.
    pub const ALWAYS: Self = Self {
        kind: RestartPolicyKind::Always,
        max_retries: 0,
    };

    /// Restart on failure, up to `max_retries` times (zero for unlimited).
    #[must_use]
    pub const fn on_failure(max_retries: u32) -> Self {
        Self {
            kind: RestartPolicyKind::OnFailure,
            max_retries,
        }
    }
}

/// Whether a detected exit should set the restart-policy match flag.
///
/// Only exits of a container that was running count; stops requested by a
/// user are excluded by the caller.
#[must_use]
pub fn policy_matches_exit(policy: RestartPolicy, prior: ContainerStatus) -> bool {
    policy.kind != RestartPolicyKind::Never
        && matches!(prior, ContainerStatus::Running | ContainerStatus::Paused)
}

/// Decide whether to restart after an exit.
#[must_use]
pub fn should_restart(
    policy: RestartPolicy,
    exit_code: i32,
    restart_count: u32,
    matched: bool,
) -> bool {
    if !matched {
        return false;
    }
    match policy.kind {
        RestartPolicyKind::Never => false,
        RestartPolicyKind::Always => true,
        RestartPolicyKind::OnFailure => {
            exit_code != 0 && (policy.max_retries == 0 || restart_count < policy.max_retries)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn on_failure_with_clean_exit_does_not_restart() {
        assert!(!should_restart(RestartPolicy::on_failure(3), 0, 0, true));
    }

    #[test]
    fn on_failure_below_cap_restarts() {
        assert!(should_restart(RestartPolicy::on_failure(3), 1, 2, true));
    }

    #[test]
    fn on_failure_at_cap_does_not_restart() {
        assert!(!should_restart(RestartPolicy::on_failure(3), 1, 3, true));
    }

    #[test]
    fn on_failure_zero_cap_is_unlimited() {
        assert!(should_restart(RestartPolicy::on_failure(0), 137, 10_000, true));
    }

    #[test]
    fn no_match_never_restarts() {
        assert!(!should_restart(RestartPolicy::ALWAYS, 1, 0, false));
    }

    #[test]
    fn match_requires_prior_running() {
        assert!(policy_matches_exit(
            RestartPolicy::ALWAYS,
            ContainerStatus::Running
        ));
        assert!(policy_matches_exit(
            RestartPolicy::on_failure(1),
            ContainerStatus::Paused
        ));
        assert!(!policy_matches_exit(
            RestartPolicy::ALWAYS,
            ContainerStatus::Created
        ));
        assert!(!policy_matches_exit(
            RestartPolicy::NEVER,
            ContainerStatus::Running
        ));
    }

    #[test]
    fn policy_deserializes_kebab_case() {
        let policy: RestartPolicy =
            serde_json::from_str(r#"{"kind":"on-failure","max_retries":5}"#).unwrap();
        assert_eq!(policy, RestartPolicy::on_failure(5));
    }

    proptest! {
        #[test]
        fn always_restarts_on_any_exit(code in any::<i32>(), count in any::<u32>()) {
            prop_assert!(should_restart(RestartPolicy::ALWAYS, code, count, true));
        }

        #[test]
        fn never_never_restarts(code in any::<i32>(), count in any::<u32>(), matched in any::<bool>()) {
            prop_assert!(!should_restart(RestartPolicy::NEVER, code, count, matched));
        }
    }
}
