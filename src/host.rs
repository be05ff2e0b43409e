//! `SandboxHost` trait: the embedding application's side of the sandbox.
//!
//! The supervisor reports everything observable through this trait. The
//! embedding caller decides how to render notifications, persist content
//! and route navigation.

use tokio::sync::mpsc;

use crate::relay::{ErrorCategory, Notification};
use crate::supervisor::SandboxState;

/// Outbound collaborator notified by the supervisor.
pub trait SandboxHost: Send + Sync {
    /// The child is ready (fires once per child).
    fn on_ready(&self);

    /// A child error report, with how it should be surfaced.
    fn on_error(&self, category: &ErrorCategory, message: &str, notification: Notification);

    /// Forwarded verbatim; the sandbox does not interpret targets.
    fn on_navigate(&self, target: &str);

    /// A distinct content value the host should persist.
    fn on_content_persist(&self, content: &str);

    fn on_title_change(&self, title: &str);

    fn on_height_change(&self, _height: u32) {}

    fn on_state_change(&self, _state: &SandboxState) {}
}

/// Notifications as values, for hosts that prefer a queue.
#[derive(Debug, Clone, PartialEq)]
pub enum HostNotice {
    Ready,
    Error {
        category: ErrorCategory,
        message: String,
        notification: Notification,
    },
    Navigate(String),
    ContentPersist(String),
    TitleChange(String),
    HeightChange(u32),
    StateChange(SandboxState),
}

/// `SandboxHost` that forwards every notification into an mpsc queue.
pub struct ChannelHost {
    tx: mpsc::UnboundedSender<HostNotice>,
}

impl ChannelHost {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<HostNotice>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn emit(&self, notice: HostNotice) {
        // Receiver gone means nobody is listening anymore
        let _ = self.tx.send(notice);
    }
}

impl SandboxHost for ChannelHost {
    fn on_ready(&self) {
        self.emit(HostNotice::Ready);
    }

    fn on_error(&self, category: &ErrorCategory, message: &str, notification: Notification) {
        self.emit(HostNotice::Error {
            category: category.clone(),
            message: message.to_string(),
            notification,
        });
    }

    fn on_navigate(&self, target: &str) {
        self.emit(HostNotice::Navigate(target.to_string()));
    }

    fn on_content_persist(&self, content: &str) {
        self.emit(HostNotice::ContentPersist(content.to_string()));
    }

    fn on_title_change(&self, title: &str) {
        self.emit(HostNotice::TitleChange(title.to_string()));
    }

    fn on_height_change(&self, height: u32) {
        self.emit(HostNotice::HeightChange(height));
    }

    fn on_state_change(&self, state: &SandboxState) {
        self.emit(HostNotice::StateChange(state.clone()));
    }
}
