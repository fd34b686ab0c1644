//! tenantry-runtime — external processes and the container fleet.
//!
//! # Architecture
//!
//! ```text
//! FleetController (start / stop / restart / logs)
//!   ├── FleetInspector (docker ps → ContainerRecord, status, ordering)
//!   └── DockerCli (one method per docker subcommand)
//!         └── dyn ProcessRunner (TokioProcessRunner in production)
//! ```
//!
//! Every external invocation goes through [`ProcessRunner`], which bounds it
//! with a wait budget and kills the child when the budget runs out.

pub mod docker;
pub mod error;
pub mod fleet;
pub mod lifecycle;
pub mod runner;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use docker::DockerCli;
pub use error::{FleetError, FleetResult, RunnerError};
pub use fleet::{ContainerRecord, FleetInspector, FleetStatus, StatusReport};
pub use lifecycle::{FleetController, LifecycleAction, LifecycleReport, LogTail};
pub use runner::{ProcessOutput, ProcessRunner, TokioProcessRunner};
