//! Pure domain types and validation. No I/O, no async, no store/engine imports.

mod id;
mod transitions;
mod workload;

pub use id::generate_workload_id;
pub use transitions::validate_transition;
pub use workload::{
    Isolation, LogLine, Runtime, Workload, WorkloadStatus, DEFAULT_TIMEOUT_S,
};
