//! Host-side supervision of sandboxed content renderers.
//!
//! A [`HostSupervisor`] launches an isolated child process, talks to it over
//! a versioned JSON envelope protocol, optionally waits for an external
//! dependency first, keeps its presentation in sync and relaunches it after
//! crashes up to a configurable cap.

pub mod backoff;
pub mod config;
pub mod host;
pub mod presentation;
pub mod protocol;
pub mod readiness;
pub mod relay;
pub mod supervisor;
pub mod transport;

pub use config::Config;
pub use host::{ChannelHost, HostNotice, SandboxHost};
pub use supervisor::{
    Failure, HostSupervisor, SandboxState, SupervisorDeps, SupervisorError, SupervisorHandle,
    SupervisorOptions, SupervisorStatus,
};
