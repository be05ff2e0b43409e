//! Host supervisor: owns one sandboxed child and its lifecycle.
//!
//! The supervisor runs as a single tokio task. Everything that happens to
//! the child (link events, timers, readiness results, presentation
//! changes) arrives as an [`Event`] on one queue, stamped with the epoch it
//! was issued under, and is handled one at a time. Embedding callers talk
//! to it through a cloneable [`SupervisorHandle`].
//!
//! ```text
//! Uninitialized -> [WaitingForDependency] -> Loading -> Ready
//!                                               \        /
//!                                          Error(terminal?) -> relaunch
//! ```

pub mod content;
pub mod state;
mod timers;


use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::backoff::Backoff;
use crate::config::SupervisorConfig;
use crate::host::SandboxHost;
use crate::presentation::Synchronizer;
use crate::protocol::{Channel, ChildMessage, Epoch, Fault, HostMessage};
use crate::readiness::{PollOutcome, ReadinessPoller};
use crate::relay::{Disposition, Relay};
use crate::transport::{ChildGuard, ChildLauncher, ChildLink, LaunchRequest, LinkEvent, TransportError};

pub use content::ContentSync;
pub use state::{CrashRecord, CrashVerdict, Failure, SandboxState};
use timers::{TaskKind, Tasks};

/// Capacity of the handle → supervisor command queue.
const COMMAND_CAPACITY: usize = 100;

/// Tasks tied to the current child; cancelled on every teardown.
const CHILD_TASKS: [TaskKind; 5] = [
    TaskKind::LoadTimeout,
    TaskKind::ReadyGrace,
    TaskKind::Relaunch,
    TaskKind::Launch,
    TaskKind::Poll,
];

#[derive(Debug, Clone, Copy, Default)]
pub struct SupervisorOptions {
    pub read_only: bool,
    /// Wait for the readiness poller before every launch.
    pub dependency_gate_required: bool,
}

/// Collaborators injected into a supervisor.
pub struct SupervisorDeps {
    pub launcher: Arc<dyn ChildLauncher>,
    pub readiness: Option<ReadinessPoller>,
    pub presentation: Synchronizer,
    pub host: Arc<dyn SandboxHost>,
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("retry is disabled: {0}")]
    RetryDisabled(String),

    #[error("dependency gate required but no readiness probe configured")]
    MissingReadiness,

    #[error("supervisor has been disposed")]
    Disposed,
}

/// Point-in-time view of a supervisor.
#[derive(Debug, Clone, Serialize)]
pub struct SupervisorStatus {
    pub state: SandboxState,
    pub epoch: Epoch,
    pub crashes: u32,
    pub crash_cap: u32,
    /// Instance id of the current child, if one is being launched or runs.
    pub instance_id: Option<Uuid>,
    pub content_ref: String,
}

enum Command {
    Retry(oneshot::Sender<Result<SandboxState, SupervisorError>>),
    Send(HostMessage),
    Status(oneshot::Sender<SupervisorStatus>),
    Dispose(oneshot::Sender<()>),
}

/// Everything the actor reacts to besides commands.
enum Event {
    Launched {
        epoch: Epoch,
        result: Result<ChildLink, TransportError>,
    },
    Link {
        epoch: Epoch,
        event: LinkEvent,
    },
    LoadTimeout {
        epoch: Epoch,
    },
    ReadyGrace {
        epoch: Epoch,
    },
    Relaunch {
        epoch: Epoch,
    },
    Dependency {
        epoch: Epoch,
        outcome: PollOutcome,
    },
    /// Not tied to a child; checked against the current one when handled.
    PresentationChanged,
}

impl Event {
    fn epoch(&self) -> Option<Epoch> {
        match self {
            Event::Launched { epoch, .. }
            | Event::Link { epoch, .. }
            | Event::LoadTimeout { epoch }
            | Event::ReadyGrace { epoch }
            | Event::Relaunch { epoch }
            | Event::Dependency { epoch, .. } => Some(*epoch),
            Event::PresentationChanged => None,
        }
    }
}

/// The live child: its channel, its inbound forwarder and the guard that
/// keeps the context alive. Dropping it tears the child down.
struct ChildContext {
    channel: Channel,
    forwarder: JoinHandle<()>,
    _guard: Box<dyn ChildGuard>,
}

impl Drop for ChildContext {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}

/// Cloneable handle to a running supervisor.
#[derive(Clone)]
pub struct SupervisorHandle {
    commands: mpsc::Sender<Command>,
    states: watch::Receiver<SandboxState>,
}

impl SupervisorHandle {
    /// Counts a fatal condition and relaunches the child, unless the crash
    /// cap is exhausted. Returns the state the sandbox is in afterwards.
    pub async fn retry(&self) -> Result<SandboxState, SupervisorError> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::Retry(tx)).await?;
        rx.await.map_err(|_| SupervisorError::Disposed)?
    }

    pub async fn status(&self) -> Result<SupervisorStatus, SupervisorError> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::Status(tx)).await?;
        rx.await.map_err(|_| SupervisorError::Disposed)
    }

    /// Queues a message for the current child. Dropped when no child exists.
    pub async fn send(&self, message: HostMessage) -> Result<(), SupervisorError> {
        self.command(Command::Send(message)).await
    }

    pub async fn set_content(&self, content: impl Into<String>) -> Result<(), SupervisorError> {
        self.send(HostMessage::SetContent {
            content: content.into(),
        })
        .await
    }

    pub async fn set_read_only(&self, read_only: bool) -> Result<(), SupervisorError> {
        self.send(HostMessage::SetReadOnly { read_only }).await
    }

    pub async fn focus(&self) -> Result<(), SupervisorError> {
        self.send(HostMessage::Focus).await
    }

    pub async fn blur(&self) -> Result<(), SupervisorError> {
        self.send(HostMessage::Blur).await
    }

    /// Tears everything down and waits until it is done. Idempotent.
    pub async fn dispose(&self) {
        let (tx, rx) = oneshot::channel();
        if self.command(Command::Dispose(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Observes state transitions. Only the latest state is kept.
    pub fn states(&self) -> watch::Receiver<SandboxState> {
        self.states.clone()
    }

    async fn command(&self, command: Command) -> Result<(), SupervisorError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SupervisorError::Disposed)
    }
}

/// Queues the actor feeds back into itself.
struct Outlets {
    events: mpsc::UnboundedSender<Event>,
    faults: mpsc::UnboundedSender<Fault>,
    states: watch::Sender<SandboxState>,
}

pub struct HostSupervisor {
    content_ref: String,
    read_only: bool,
    config: SupervisorConfig,

    launcher: Arc<dyn ChildLauncher>,
    readiness: Option<ReadinessPoller>,
    presentation: Synchronizer,
    host: Arc<dyn SandboxHost>,
    relay: Relay,

    state: SandboxState,
    epoch: Epoch,
    instance_id: Option<Uuid>,
    crashes: CrashRecord,
    backoff: Backoff,
    content: ContentSync,
    child: Option<ChildContext>,
    ready_since: Option<Instant>,
    tasks: Tasks,
    outlets: Outlets,
}

impl HostSupervisor {
    /// Creates a supervisor for `content_ref` and starts it.
    ///
    /// Without a dependency gate the child is launched right away; with one,
    /// the readiness poller runs first. Must be called within a tokio runtime.
    pub fn create(
        content_ref: impl Into<String>,
        options: SupervisorOptions,
        config: SupervisorConfig,
        deps: SupervisorDeps,
    ) -> Result<SupervisorHandle, SupervisorError> {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (faults_tx, faults_rx) = mpsc::unbounded_channel();
        let (states_tx, states_rx) = watch::channel(SandboxState::Uninitialized);

        let outlets = Outlets {
            events: events_tx,
            faults: faults_tx,
            states: states_tx,
        };
        let supervisor = Self::new(content_ref.into(), options, config, deps, outlets)?;
        tokio::spawn(supervisor.run(commands_rx, events_rx, faults_rx));

        Ok(SupervisorHandle {
            commands: commands_tx,
            states: states_rx,
        })
    }

    fn new(
        content_ref: String,
        options: SupervisorOptions,
        config: SupervisorConfig,
        deps: SupervisorDeps,
        outlets: Outlets,
    ) -> Result<Self, SupervisorError> {
        let readiness = match (options.dependency_gate_required, deps.readiness) {
            (true, None) => return Err(SupervisorError::MissingReadiness),
            (true, poller) => poller,
            (false, _) => None,
        };

        Ok(Self {
            content_ref,
            read_only: options.read_only,
            crashes: CrashRecord::new(config.crash_cap),
            backoff: Backoff::from_config(&config),
            content: ContentSync::new(config.autosave),
            config,
            launcher: deps.launcher,
            readiness,
            presentation: deps.presentation,
            relay: Relay::new(deps.host.clone()),
            host: deps.host,
            state: SandboxState::Uninitialized,
            epoch: Epoch::default(),
            instance_id: None,
            child: None,
            ready_since: None,
            tasks: Tasks::new(),
            outlets,
        })
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut events: mpsc::UnboundedReceiver<Event>,
        mut faults: mpsc::UnboundedReceiver<Fault>,
    ) {
        info!(
            "Supervisor started for {} ({})",
            self.content_ref,
            self.launcher.description()
        );
        self.watch_presentation();
        self.begin_attempt(Duration::ZERO);

        loop {
            tokio::select! {
                biased;

                command = commands.recv() => {
                    let Some(command) = command else {
                        debug!("All supervisor handles dropped");
                        self.dispose();
                        break;
                    };
                    if !self.handle_command(command) {
                        break;
                    }
                }
                Some(fault) = faults.recv() => self.handle_fault(fault),
                Some(event) = events.recv() => self.handle_event(event),
            }
        }
    }

    // ── Commands ────────────────────────────────────────

    /// Returns false once the supervisor should stop.
    fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Retry(reply) => {
                let result = self.retry();
                let _ = reply.send(result);
            }
            Command::Send(message) => self.send_to_child(message),
            Command::Status(reply) => {
                let _ = reply.send(self.status());
            }
            Command::Dispose(ack) => {
                self.dispose();
                let _ = ack.send(());
                return false;
            }
        }
        true
    }

    fn retry(&mut self) -> Result<SandboxState, SupervisorError> {
        if let SandboxState::Error {
            terminal: true,
            failure,
        } = &self.state
        {
            warn!("Retry rejected, sandbox is terminal");
            return Err(SupervisorError::RetryDisabled(failure.to_string()));
        }
        info!("[{}] Retry requested", self.epoch);
        self.fatal(Failure::ManualRetry);
        Ok(self.state.clone())
    }

    fn send_to_child(&mut self, message: HostMessage) {
        match &message {
            HostMessage::SetContent { content } => self.content.host_applied(content),
            HostMessage::SetReadOnly { read_only } => self.read_only = *read_only,
            _ => {}
        }
        match &self.child {
            Some(child) => child.channel.send(&message),
            None => debug!("No child, dropping {}", message.kind()),
        }
    }

    fn status(&self) -> SupervisorStatus {
        SupervisorStatus {
            state: self.state.clone(),
            epoch: self.epoch,
            crashes: self.crashes.count(),
            crash_cap: self.crashes.cap(),
            instance_id: self.instance_id,
            content_ref: self.content_ref.clone(),
        }
    }

    /// Cancels every task and releases the child. No host callback fires
    /// after this returns.
    fn dispose(&mut self) {
        self.tasks.cancel_all();
        self.child = None;
        self.instance_id = None;
        info!("[{}] Supervisor disposed", self.epoch);
    }

    // ── Events ──────────────────────────────────────────

    fn handle_event(&mut self, event: Event) {
        if let Some(epoch) = event.epoch() {
            if epoch != self.epoch {
                debug!("Discarding event from stale epoch {epoch} (current {})", self.epoch);
                return;
            }
        }

        match event {
            Event::Launched { result, .. } => self.on_launched(result),
            Event::Link { event, .. } => self.on_link(event),
            Event::LoadTimeout { .. } => {
                if self.state == SandboxState::Loading {
                    self.fatal(Failure::LoadTimeout {
                        after_ms: self.config.load_timeout_ms,
                    });
                }
            }
            Event::ReadyGrace { .. } => {
                if self.state == SandboxState::Loading && self.child.is_some() {
                    warn!(
                        "[{}] No ready signal within {}ms of load, assuming ready",
                        self.epoch, self.config.ready_grace_ms
                    );
                    self.mark_ready();
                }
            }
            Event::Relaunch { .. } => {
                if self.state == SandboxState::Loading {
                    self.launch();
                }
            }
            Event::Dependency { outcome, .. } => self.on_dependency(outcome),
            Event::PresentationChanged => {
                if self.state == SandboxState::Ready {
                    self.push_style(false);
                }
            }
        }
    }

    fn handle_fault(&mut self, fault: Fault) {
        if fault.epoch != self.epoch || self.child.is_none() {
            debug!("Discarding fault from {}: {}", fault.epoch, fault.error);
            return;
        }
        self.fatal(Failure::Transport {
            reason: fault.error.to_string(),
        });
    }

    fn on_launched(&mut self, result: Result<ChildLink, TransportError>) {
        let link = match result {
            Ok(link) => link,
            Err(e) => {
                error!("[{}] Launch failed: {e}", self.epoch);
                self.fatal(Failure::SpawnFailed {
                    reason: e.to_string(),
                });
                return;
            }
        };

        let ChildLink {
            outbound,
            mut inbound,
            guard,
        } = link;
        let epoch = self.epoch;
        match guard.pid() {
            Some(pid) => info!("[{epoch}] Child launched (pid {pid})"),
            None => info!("[{epoch}] Child launched"),
        }

        let events = self.outlets.events.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(event) = inbound.recv().await {
                let closed = matches!(event, LinkEvent::Closed(_));
                if events.send(Event::Link { epoch, event }).is_err() || closed {
                    return;
                }
            }
            let _ = events.send(Event::Link {
                epoch,
                event: LinkEvent::Closed("link dropped".into()),
            });
        });

        self.child = Some(ChildContext {
            channel: Channel::new(epoch, outbound, self.outlets.faults.clone()),
            forwarder,
            _guard: guard,
        });
    }

    fn on_link(&mut self, event: LinkEvent) {
        let Some(instance_id) = self.instance_id else {
            return;
        };
        match event {
            LinkEvent::Loaded => {
                debug!("[{}] Child loaded, sending init", self.epoch);
                if let Some(child) = &self.child {
                    child.channel.send(&HostMessage::Init {
                        content_ref: self.content_ref.clone(),
                        read_only: self.read_only,
                        instance_id,
                    });
                }
                if let Some(grace) = self.config.ready_grace() {
                    if self.state == SandboxState::Loading {
                        let events = self.outlets.events.clone();
                        let epoch = self.epoch;
                        self.tasks.spawn_after(TaskKind::ReadyGrace, grace, async move {
                            let _ = events.send(Event::ReadyGrace { epoch });
                        });
                    }
                }
            }
            LinkEvent::Frame(frame) => {
                let message = match &self.child {
                    Some(child) => child.channel.accept(&frame),
                    None => None,
                };
                if let Some(message) = message {
                    self.on_child_message(message);
                }
            }
            LinkEvent::Closed(reason) => {
                warn!("[{}] Child link closed: {reason}", self.epoch);
                self.fatal(Failure::ChildExited { reason });
            }
        }
    }

    fn on_child_message(&mut self, message: ChildMessage) {
        match message {
            ChildMessage::Ready => match self.state {
                SandboxState::Loading => self.mark_ready(),
                _ => debug!("[{}] Ignoring ready in state {}", self.epoch, self.state),
            },
            ChildMessage::ContentChanged { content } => {
                if let Some(persist) = self.content.observe(&content) {
                    self.host.on_content_persist(&persist);
                }
            }
            ChildMessage::SaveRequested => {
                if let Some(persist) = self.content.flush() {
                    self.host.on_content_persist(&persist);
                }
            }
            ChildMessage::TitleChanged { title } => self.relay.title(&title),
            ChildMessage::HeightChanged { height } => self.relay.height(height),
            ChildMessage::NavigateRequest { target } => self.relay.navigate(self.epoch, &target),
            ChildMessage::ErrorReport {
                category,
                message,
                fatal,
            } => {
                if self.relay.report(self.epoch, &category, &message, fatal) == Disposition::Crash {
                    self.fatal(Failure::FatalReport { category, message });
                }
            }
        }
    }

    fn on_dependency(&mut self, outcome: PollOutcome) {
        if self.state != SandboxState::WaitingForDependency {
            return;
        }
        match outcome {
            PollOutcome::Ready { .. } => {
                self.set_state(SandboxState::Loading);
                self.launch();
            }
            PollOutcome::TimedOut { attempts, elapsed } => {
                error!("Dependency not ready after {attempts} poll(s), giving up");
                self.set_state(SandboxState::Error {
                    terminal: true,
                    failure: Failure::DependencyNeverReady {
                        after_ms: elapsed.as_millis() as u64,
                    },
                });
            }
        }
    }

    // ── Lifecycle ───────────────────────────────────────

    /// Enters `WaitingForDependency` or `Loading` and schedules the next
    /// poll run or launch after `delay`.
    fn begin_attempt(&mut self, delay: Duration) {
        let epoch = self.epoch;
        let events = self.outlets.events.clone();

        if let Some(poller) = self.readiness.clone() {
            self.set_state(SandboxState::WaitingForDependency);
            self.tasks.spawn(TaskKind::Poll, async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                let outcome = poller.wait().await;
                let _ = events.send(Event::Dependency { epoch, outcome });
            });
            return;
        }

        self.set_state(SandboxState::Loading);
        if delay.is_zero() {
            self.launch();
        } else {
            self.tasks.spawn_after(TaskKind::Relaunch, delay, async move {
                let _ = events.send(Event::Relaunch { epoch });
            });
        }
    }

    /// Starts a launch and arms the load timeout.
    fn launch(&mut self) {
        let instance_id = Uuid::new_v4();
        self.instance_id = Some(instance_id);
        let request = LaunchRequest {
            epoch: self.epoch,
            instance_id,
            content_ref: self.content_ref.clone(),
        };
        info!(
            "[{}] Launching child {instance_id} for {}",
            self.epoch, self.content_ref
        );

        let events = self.outlets.events.clone();
        let epoch = self.epoch;
        self.tasks
            .spawn_after(TaskKind::LoadTimeout, self.config.load_timeout(), {
                let events = events.clone();
                async move {
                    let _ = events.send(Event::LoadTimeout { epoch });
                }
            });

        let launcher = self.launcher.clone();
        self.tasks.spawn(TaskKind::Launch, async move {
            let result = launcher.launch(&request).await;
            let _ = events.send(Event::Launched {
                epoch: request.epoch,
                result,
            });
        });
    }

    fn mark_ready(&mut self) {
        self.tasks.cancel(TaskKind::LoadTimeout);
        self.tasks.cancel(TaskKind::ReadyGrace);
        self.ready_since = Some(Instant::now());
        self.set_state(SandboxState::Ready);
        self.push_style(true);
        self.host.on_ready();
    }

    fn push_style(&mut self, force: bool) {
        let Some(child) = &self.child else {
            return;
        };
        if let Some(message) = self.presentation.style_message(force) {
            child.channel.send(&message);
        }
    }

    /// Handles a fatal condition: tears the child down, counts the crash
    /// and either relaunches after a backoff or goes terminal.
    fn fatal(&mut self, failure: Failure) {
        let ready_since = self.ready_since.take();
        if let (Some(since), Some(stable_after)) = (ready_since, self.config.stable_after()) {
            if since.elapsed() >= stable_after {
                info!(
                    "Child was stable for {}s, crash record reset",
                    since.elapsed().as_secs()
                );
                self.crashes.reset();
                self.backoff.reset();
            }
        }

        self.teardown();

        match self.crashes.record() {
            CrashVerdict::Relaunch { attempt } => {
                warn!("{failure} (crash {attempt}/{})", self.crashes.cap());
                self.set_state(SandboxState::Error {
                    terminal: false,
                    failure,
                });
                let delay = self.backoff.next_delay();
                info!(
                    "[{}] Relaunching in {}ms (relaunch {})",
                    self.epoch,
                    delay.as_millis(),
                    self.backoff.relaunches
                );
                self.begin_attempt(delay);
            }
            CrashVerdict::Exhausted => {
                let crashes = self.crashes.count();
                error!("{failure}; crash limit reached after {crashes} failures");
                self.set_state(SandboxState::Error {
                    terminal: true,
                    failure: Failure::CrashLimitReached {
                        crashes,
                        last: Box::new(failure),
                    },
                });
            }
        }
    }

    /// Discards the current child and moves to a fresh epoch.
    fn teardown(&mut self) {
        for kind in CHILD_TASKS {
            self.tasks.cancel(kind);
        }
        if self.child.take().is_some() {
            info!("[{}] Child torn down", self.epoch);
        }
        self.instance_id = None;
        self.presentation.reset();
        self.epoch = self.epoch.next();
    }

    fn set_state(&mut self, state: SandboxState) {
        if self.state == state {
            return;
        }
        info!("[{}] {} -> {}", self.epoch, self.state.name(), state);
        self.state = state.clone();
        self.host.on_state_change(&state);
        self.outlets.states.send_replace(state);
    }

    fn watch_presentation(&mut self) {
        let mut changes = self.presentation.subscribe();
        let events = self.outlets.events.clone();
        self.tasks.spawn(TaskKind::PresentationWatch, async move {
            changes.borrow_and_update();
            while changes.changed().await.is_ok() {
                if events.send(Event::PresentationChanged).is_err() {
                    break;
                }
            }
        });
    }
}
