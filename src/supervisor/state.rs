use std::fmt;

use serde::Serialize;

/// Why the sandbox left `Loading`/`Ready`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "cause", rename_all = "snake_case")]
pub enum Failure {
    SpawnFailed { reason: String },
    ChildExited { reason: String },
    Transport { reason: String },
    LoadTimeout { after_ms: u64 },
    FatalReport { category: String, message: String },
    ManualRetry,
    DependencyNeverReady { after_ms: u64 },
    CrashLimitReached { crashes: u32, last: Box<Failure> },
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Failure::SpawnFailed { reason } => {
                write!(f, "The sandbox could not be started: {reason}")
            }
            Failure::ChildExited { reason } => {
                write!(f, "The sandbox stopped unexpectedly: {reason}")
            }
            Failure::Transport { reason } => {
                write!(f, "Lost contact with the sandbox: {reason}")
            }
            Failure::LoadTimeout { after_ms } => {
                write!(f, "The sandbox did not finish loading within {after_ms} ms")
            }
            Failure::FatalReport { category, message } => {
                write!(f, "The sandbox reported a fatal {category} error: {message}")
            }
            Failure::ManualRetry => write!(f, "The sandbox was restarted on request"),
            Failure::DependencyNeverReady { after_ms } => write!(
                f,
                "The dependency never became ready (gave up after {after_ms} ms)"
            ),
            Failure::CrashLimitReached { crashes, last } => write!(
                f,
                "The sandbox failed {crashes} times in a row and will not be restarted. Last failure: {last}"
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SandboxState {
    Uninitialized,
    WaitingForDependency,
    Loading,
    Ready,
    Error { terminal: bool, failure: Failure },
}

impl SandboxState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SandboxState::Error { terminal: true, .. })
    }

    /// Whether the retry affordance should be offered.
    pub fn can_retry(&self) -> bool {
        !self.is_terminal()
    }

    pub fn name(&self) -> &'static str {
        match self {
            SandboxState::Uninitialized => "uninitialized",
            SandboxState::WaitingForDependency => "waiting_for_dependency",
            SandboxState::Loading => "loading",
            SandboxState::Ready => "ready",
            SandboxState::Error { terminal: false, .. } => "error",
            SandboxState::Error { terminal: true, .. } => "error (terminal)",
        }
    }
}

impl fmt::Display for SandboxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SandboxState::Error { failure, .. } => write!(f, "{}: {failure}", self.name()),
            _ => f.write_str(self.name()),
        }
    }
}

/// Outcome of counting one fatal condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrashVerdict {
    /// Relaunch; `attempt` is the crash count including this one.
    Relaunch { attempt: u32 },
    Exhausted,
}

/// Fatal conditions since the last reset, bounded by `cap`.
///
/// Counting happens before the cap check: with `cap = 3` the first three
/// fatal conditions relaunch and the fourth is terminal.
#[derive(Debug, Clone)]
pub struct CrashRecord {
    count: u32,
    cap: u32,
}

impl CrashRecord {
    pub fn new(cap: u32) -> Self {
        Self { count: 0, cap }
    }

    pub fn record(&mut self) -> CrashVerdict {
        self.count = self.count.saturating_add(1);
        if self.count <= self.cap {
            CrashVerdict::Relaunch {
                attempt: self.count,
            }
        } else {
            CrashVerdict::Exhausted
        }
    }

    pub fn reset(&mut self) {
        self.count = 0;
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn cap(&self) -> u32 {
        self.cap
    }
}
