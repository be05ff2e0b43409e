//! Error/event relay.
//!
//! Classifies child error reports, logs them, and forwards them to the
//! host. Only an explicitly fatal report asks the supervisor to recycle the
//! child; every other report leaves the state machine alone. Navigation,
//! title and height events pass through untouched.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::host::SandboxHost;
use crate::protocol::Epoch;

/// Category of a child-reported error.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Requests from the child failed.
    Network,
    /// Internal child failure.
    Runtime,
    /// A write the child attempted was rejected.
    Mutation,
    Other(String),
}

impl ErrorCategory {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "network" => ErrorCategory::Network,
            "runtime" => ErrorCategory::Runtime,
            "mutation" => ErrorCategory::Mutation,
            other => ErrorCategory::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ErrorCategory::Network => "network",
            ErrorCategory::Runtime => "runtime",
            ErrorCategory::Mutation => "mutation",
            ErrorCategory::Other(name) => name,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the supervisor should do after a report was relayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Notification only, state unaffected.
    Notify,
    /// Treat as a crash.
    Crash,
}

/// How loudly a report is surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Error,
}

/// How a report is presented to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub severity: Severity,
    pub dismissible: bool,
    pub blocking: bool,
}

/// Fatal reports block regardless of category. Runtime failures are shown
/// as errors and everything else as warnings; both can be dismissed.
pub fn classify(category: &ErrorCategory, fatal: bool) -> (Notification, Disposition) {
    if fatal {
        return (
            Notification {
                severity: Severity::Error,
                dismissible: false,
                blocking: true,
            },
            Disposition::Crash,
        );
    }
    let severity = match category {
        ErrorCategory::Runtime => Severity::Error,
        _ => Severity::Warning,
    };
    (
        Notification {
            severity,
            dismissible: true,
            blocking: false,
        },
        Disposition::Notify,
    )
}

pub struct Relay {
    host: Arc<dyn SandboxHost>,
}

impl Relay {
    pub fn new(host: Arc<dyn SandboxHost>) -> Self {
        Self { host }
    }

    pub fn report(&self, epoch: Epoch, category: &str, message: &str, fatal: bool) -> Disposition {
        let category = ErrorCategory::parse(category);
        let (notification, disposition) = classify(&category, fatal);

        match (notification.severity, fatal) {
            (_, true) => error!("[{epoch}] Fatal {category} error from child: {message}"),
            (Severity::Error, false) => error!("[{epoch}] Child {category} error: {message}"),
            (Severity::Warning, false) => warn!("[{epoch}] Child {category} error: {message}"),
        }

        self.host.on_error(&category, message, notification);
        disposition
    }

    pub fn navigate(&self, epoch: Epoch, target: &str) {
        info!("[{epoch}] Navigate request: {target}");
        self.host.on_navigate(target);
    }

    pub fn title(&self, title: &str) {
        self.host.on_title_change(title);
    }

    pub fn height(&self, height: u32) {
        self.host.on_height_change(height);
    }
}
