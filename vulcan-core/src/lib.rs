//! Shared domain types, persistence port, backend contract, log broker, and
//! execution engine for the single-node compute platform. Isolation-specific
//! backends (`vulcan-firecracker`) and the in-VM agent (`vulcan-guest-agent`)
//! depend on this crate; it depends on none of them.

pub mod backend;
pub mod broker;
pub mod domain;
pub mod engine;
pub mod error;
pub mod protocol;
pub mod store;

pub use domain::{Isolation, LogLine, Runtime, Workload, WorkloadStatus};
pub use engine::{Engine, SubmitRequest};
pub use error::{Result, VulcanError};
pub use store::Store;
