//! In-memory launcher for supervisor tests.
//!
//! Every launch hands the test a [`MockChild`] holding the child side of the
//! link, so tests can read host frames and inject child frames.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::{ChildGuard, ChildLauncher, ChildLink, LaunchRequest, LinkEvent, TransportError, LINK_CAPACITY};
use crate::protocol::{decode_host, encode, ChildMessage, Epoch, HostMessage, Inbound};

pub(crate) struct MockChild {
    pub epoch: Epoch,
    pub instance_id: Uuid,
    pub frames: mpsc::Receiver<String>,
    pub events: mpsc::Sender<LinkEvent>,
    alive: Arc<AtomicBool>,
}

impl MockChild {
    /// Next host message, or `None` once the host dropped its side.
    pub async fn next_message(&mut self) -> Option<HostMessage> {
        let frame = self.frames.recv().await?;
        match decode_host(&frame) {
            Inbound::Accepted(message) => Some(message),
            Inbound::Dropped(reason) => panic!("host sent an invalid frame: {reason}"),
        }
    }

    pub async fn send(&self, message: ChildMessage) {
        self.send_raw(encode(&message).unwrap()).await;
    }

    pub async fn send_raw(&self, frame: impl Into<String>) {
        let _ = self.events.send(LinkEvent::Frame(frame.into())).await;
    }

    pub async fn close(&self, reason: &str) {
        let _ = self.events.send(LinkEvent::Closed(reason.into())).await;
    }

    /// False once the host dropped the child's guard.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

struct MockGuard(Arc<AtomicBool>);

impl ChildGuard for MockGuard {}

impl Drop for MockGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub(crate) struct MockLauncher {
    children: mpsc::UnboundedSender<MockChild>,
    failures: AtomicU32,
    announce_loaded: AtomicBool,
    launches: AtomicU32,
}

impl MockLauncher {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<MockChild>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let launcher = Arc::new(Self {
            children: tx,
            failures: AtomicU32::new(0),
            announce_loaded: AtomicBool::new(true),
            launches: AtomicU32::new(0),
        });
        (launcher, rx)
    }

    /// Makes the next `count` launches fail with a spawn error.
    pub fn fail_next(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Future children stay silent, as a hung runtime would: no `Loaded`.
    pub fn without_loaded_signal(&self) {
        self.announce_loaded.store(false, Ordering::SeqCst);
    }

    pub fn launches(&self) -> u32 {
        self.launches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChildLauncher for MockLauncher {
    async fn launch(&self, request: &LaunchRequest) -> Result<ChildLink, TransportError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        let pending = self.failures.load(Ordering::SeqCst);
        if pending > 0 {
            self.failures.store(pending - 1, Ordering::SeqCst);
            return Err(TransportError::Spawn("mock spawn failure".into()));
        }

        let (frame_tx, frame_rx) = mpsc::channel(LINK_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(LINK_CAPACITY);
        if self.announce_loaded.load(Ordering::SeqCst) {
            let _ = event_tx.try_send(LinkEvent::Loaded);
        }

        let alive = Arc::new(AtomicBool::new(true));
        let _ = self.children.send(MockChild {
            epoch: request.epoch,
            instance_id: request.instance_id,
            frames: frame_rx,
            events: event_tx,
            alive: alive.clone(),
        });

        Ok(ChildLink {
            outbound: frame_tx,
            inbound: event_rx,
            guard: Box::new(MockGuard(alive)),
        })
    }

    fn description(&self) -> String {
        "mock".to_string()
    }
}
