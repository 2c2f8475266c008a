//! Keel operator façade (in-process).
//!
//! Wires the registry, reconciler, status poller and status write-back into a
//! per-instance [`Supervisor`], and drives supervisors from product watch events.
//! Frontends (the CLI) depend on this crate rather than on the pieces.

#![forbid(unsafe_code)]

pub mod operator;
pub mod pipeline;
pub mod settings;
pub mod status;
pub mod supervisor;

pub use operator::{run, InstanceKey, Operator};
pub use pipeline::{render, Pipeline};
pub use settings::OperatorSettings;
pub use status::{write_status, ProductStatusReport, StatusWriter, STATUS_CONFLICT_RETRIES};
pub use supervisor::{PassRecord, Supervisor, SupervisorConfig};
