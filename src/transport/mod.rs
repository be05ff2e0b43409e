//! Child transport: how an isolated child context is started and wired up.
//!
//! The supervisor only sees the [`ChildLauncher`] trait. A launch yields a
//! [`ChildLink`]: an outbound frame queue, an inbound event stream and a
//! guard whose drop tears the child down.

pub mod process;

#[cfg(test)]
pub(crate) mod mock;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::protocol::Epoch;

pub use process::ProcessLauncher;

/// Capacity of the per-child frame queues.
pub const LINK_CAPACITY: usize = 100;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to spawn child: {0}")]
    Spawn(String),

    #[error("channel closed: {0}")]
    Closed(String),

    #[error("outbound queue full")]
    Backpressure,

    #[error("failed to encode message: {0}")]
    Encode(String),
}

/// Events emitted by a live link
#[derive(Debug)]
pub enum LinkEvent {
    /// Transport-level "child loaded" signal: the child's runtime is up and
    /// producing output. Weaker than the child's own `ready` message.
    Loaded,
    /// One raw inbound frame, not yet validated.
    Frame(String),
    /// The child went away (exit, broken pipe).
    Closed(String),
}

/// Keeps a child context alive. Dropping the guard tears the child down.
pub trait ChildGuard: Send {
    /// OS process id, when the child is a process.
    fn pid(&self) -> Option<u32> {
        None
    }
}

/// Everything the supervisor needs to talk to one child.
pub struct ChildLink {
    pub outbound: mpsc::Sender<String>,
    pub inbound: mpsc::Receiver<LinkEvent>,
    pub guard: Box<dyn ChildGuard>,
}

/// Parameters of a single launch.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub epoch: Epoch,
    pub instance_id: Uuid,
    pub content_ref: String,
}

/// Abstraction over the mechanism that creates isolated child contexts.
#[async_trait]
pub trait ChildLauncher: Send + Sync {
    async fn launch(&self, request: &LaunchRequest) -> Result<ChildLink, TransportError>;

    /// Human-readable description, e.g. `"process (/usr/bin/renderer)"`.
    fn description(&self) -> String;
}
