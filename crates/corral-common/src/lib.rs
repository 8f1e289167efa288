//! # corral-common
//!
//! Shared types for the Corral orchestration engine:
//! - Error taxonomy used by every lifecycle operation
//! - Validated container, pod and exec-session identifiers
//! - Standard filesystem paths (state store, exit markers, exec pid files)

#![warn(missing_docs)]

pub mod error;
pub mod id;
pub mod paths;

pub use error::{CorralError, CorralResult};
pub use id::{ContainerId, ExecSessionId, PodId};
pub use paths::CorralPaths;
