//! Presentation synchronization.
//!
//! The host publishes its presentation state through a `watch` channel.
//! The synchronizer snapshots a fixed set of named variables out of it and
//! turns the snapshot into a `SetStyle` message. `watch` keeps only the
//! latest value, so bursts of updates collapse into one observed change.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::config::PresentationConfig;
use crate::protocol::HostMessage;

/// Host-level presentation state, e.g. resolved theme variables.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresentationDescriptor {
    pub variables: BTreeMap<String, String>,
}

impl PresentationDescriptor {
    pub fn new(variables: BTreeMap<String, String>) -> Self {
        Self { variables }
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(name.into(), value.into());
        self
    }
}

/// Creates the host-side presentation publisher from config values.
pub fn publisher(
    config: &PresentationConfig,
) -> (
    watch::Sender<PresentationDescriptor>,
    watch::Receiver<PresentationDescriptor>,
) {
    watch::channel(PresentationDescriptor::new(config.values.clone()))
}

pub struct Synchronizer {
    tracked: Vec<String>,
    source: watch::Receiver<PresentationDescriptor>,
    last_pushed: Option<BTreeMap<String, String>>,
}

impl Synchronizer {
    pub fn new(tracked: Vec<String>, source: watch::Receiver<PresentationDescriptor>) -> Self {
        Self {
            tracked,
            source,
            last_pushed: None,
        }
    }

    /// A receiver for observing changes, independent of the one used for
    /// snapshots.
    pub fn subscribe(&self) -> watch::Receiver<PresentationDescriptor> {
        self.source.clone()
    }

    /// Current values of the tracked variables. Unset variables are omitted.
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        let descriptor = self.source.borrow();
        self.tracked
            .iter()
            .filter_map(|name| {
                descriptor
                    .variables
                    .get(name)
                    .map(|value| (name.clone(), value.clone()))
            })
            .collect()
    }

    /// `SetStyle` for the current snapshot.
    ///
    /// With `force` the message is always produced; otherwise only when the
    /// snapshot differs from the last one pushed to this child.
    pub fn style_message(&mut self, force: bool) -> Option<HostMessage> {
        let snapshot = self.snapshot();
        if !force && self.last_pushed.as_ref() == Some(&snapshot) {
            return None;
        }
        self.last_pushed = Some(snapshot.clone());
        Some(HostMessage::SetStyle {
            variables: snapshot,
        })
    }

    /// Forgets what was pushed; called whenever the child is replaced.
    pub fn reset(&mut self) {
        self.last_pushed = None;
    }
}
