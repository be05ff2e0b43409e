//! Child contexts as OS processes.
//!
//! The child speaks newline-delimited envelopes: host frames are written to
//! its stdin, child frames are read from its stdout. Stderr is forwarded to
//! the host log. The process is killed when its guard is dropped.
//!
//! A spawned process is not yet loaded. The first line on stdout is the
//! load signal: either the bare handshake line [`LOADED_HANDSHAKE`], which is
//! consumed here, or the child's first real frame, which is passed on.

use std::ffi::OsString;
use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{ChildGuard, ChildLauncher, ChildLink, LaunchRequest, LinkEvent, TransportError, LINK_CAPACITY};
use crate::config::ChildConfig;

/// Line a child prints once its runtime is up, before it has anything else
/// to say.
pub const LOADED_HANDSHAKE: &str = "loaded";

/// Launches each child as a separate process.
pub struct ProcessLauncher {
    config: ChildConfig,
}

impl ProcessLauncher {
    pub fn new(config: ChildConfig) -> Self {
        Self { config }
    }

    fn command(&self, request: &LaunchRequest) -> Command {
        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args);

        // Let the child find helper binaries bundled next to it.
        if let Some(path) = child_path(&self.config.command) {
            cmd.env("PATH", path);
        }
        cmd.envs(&self.config.env)
            .env("SANDBOX_INSTANCE_ID", request.instance_id.to_string())
            .env("SANDBOX_EPOCH", request.epoch.value().to_string())
            .env("SANDBOX_CONTENT_REF", &request.content_ref);

        if let Some(ref dir) = self.config.working_dir {
            cmd.current_dir(dir);
        }

        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

/// `PATH` with the command's own directory prepended, if it has one.
fn child_path(command: &Path) -> Option<OsString> {
    let dir = command.parent().filter(|d| !d.as_os_str().is_empty())?;
    let mut paths = vec![dir.to_path_buf()];
    if let Some(current) = std::env::var_os("PATH") {
        paths.extend(std::env::split_paths(&current));
    }
    std::env::join_paths(paths).ok()
}

struct ProcessGuard {
    child: Child,
    tasks: Vec<JoinHandle<()>>,
}

impl ChildGuard for ProcessGuard {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }
}

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
        if let Err(e) = self.child.start_kill() {
            debug!("Child already gone: {e}");
        }
    }
}

#[async_trait]
impl ChildLauncher for ProcessLauncher {
    async fn launch(&self, request: &LaunchRequest) -> Result<ChildLink, TransportError> {
        let epoch = request.epoch;
        let mut child = self.command(request).spawn().map_err(|e| {
            TransportError::Spawn(format!("{}: {e}", self.config.command.display()))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::Spawn("child stdin not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::Spawn("child stdout not captured".into()))?;
        let stderr = child.stderr.take();

        info!(
            "[{epoch}] Spawned child pid {} for {}",
            child.id().map(|p| p.to_string()).unwrap_or_else(|| "?".into()),
            request.content_ref
        );

        let (event_tx, event_rx) = mpsc::channel::<LinkEvent>(LINK_CAPACITY);
        let (frame_tx, mut frame_rx) = mpsc::channel::<String>(LINK_CAPACITY);

        let mut tasks = Vec::with_capacity(3);

        // Read task: one frame per stdout line
        let reader_tx = event_tx.clone();
        tasks.push(tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            let mut loaded = false;
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        if !loaded {
                            loaded = true;
                            debug!("[{epoch}] Child runtime is up");
                            if reader_tx.send(LinkEvent::Loaded).await.is_err() {
                                break;
                            }
                            if line.trim() == LOADED_HANDSHAKE {
                                continue;
                            }
                        }
                        if reader_tx.send(LinkEvent::Frame(line)).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        let _ = reader_tx
                            .send(LinkEvent::Closed("stdout closed".into()))
                            .await;
                        break;
                    }
                    Err(e) => {
                        let _ = reader_tx
                            .send(LinkEvent::Closed(format!("stdout read: {e}")))
                            .await;
                        break;
                    }
                }
            }
        }));

        // Write task: one stdin line per frame
        let writer_tx = event_tx;
        tasks.push(tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(frame) = frame_rx.recv().await {
                let written = async {
                    stdin.write_all(frame.as_bytes()).await?;
                    stdin.write_all(b"\n").await?;
                    stdin.flush().await
                }
                .await;
                if let Err(e) = written {
                    warn!("[{epoch}] Write to child failed: {e}");
                    let _ = writer_tx
                        .send(LinkEvent::Closed(format!("stdin write: {e}")))
                        .await;
                    break;
                }
            }
        }));

        if let Some(stderr) = stderr {
            tasks.push(tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("[{epoch}] child stderr: {line}");
                }
            }));
        }

        Ok(ChildLink {
            outbound: frame_tx,
            inbound: event_rx,
            guard: Box::new(ProcessGuard { child, tasks }),
        })
    }

    fn description(&self) -> String {
        format!("process ({})", self.config.command.display())
    }
}
