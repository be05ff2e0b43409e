use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use super::envelope::{self, ChildMessage, HostMessage, Inbound};
use crate::transport::TransportError;

/// Generation counter for child handles.
///
/// Every asynchronous result is stamped with the epoch it was issued under;
/// results from an older epoch are discarded by the supervisor.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Epoch(u64);

impl Epoch {
    pub fn next(self) -> Self {
        Epoch(self.0 + 1)
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A send failure, reported back to the owning supervisor.
#[derive(Debug)]
pub struct Fault {
    pub epoch: Epoch,
    pub error: TransportError,
}

/// Typed, per-child message channel.
///
/// One channel exists per child handle and is owned by the supervisor that
/// created it. `send` never blocks and never returns an error: failures are
/// pushed onto the supervisor's fault queue instead.
pub struct Channel {
    epoch: Epoch,
    outbound: mpsc::Sender<String>,
    faults: mpsc::UnboundedSender<Fault>,
}

impl Channel {
    pub fn new(
        epoch: Epoch,
        outbound: mpsc::Sender<String>,
        faults: mpsc::UnboundedSender<Fault>,
    ) -> Self {
        Self {
            epoch,
            outbound,
            faults,
        }
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    /// Queues a message for the child (FIFO).
    pub fn send(&self, message: &HostMessage) {
        let frame = match envelope::encode(message) {
            Ok(frame) => frame,
            Err(e) => {
                self.fault(TransportError::Encode(e.to_string()));
                return;
            }
        };

        match self.outbound.try_send(frame) {
            Ok(()) => debug!("[{}] -> {}", self.epoch, message.kind()),
            Err(TrySendError::Full(_)) => self.fault(TransportError::Backpressure),
            Err(TrySendError::Closed(_)) => {
                self.fault(TransportError::Closed("outbound pipe closed".into()))
            }
        }
    }

    /// Validates an inbound frame. Dropped frames are logged and yield `None`.
    pub fn accept(&self, frame: &str) -> Option<ChildMessage> {
        match envelope::decode_child(frame) {
            Inbound::Accepted(message) => {
                debug!("[{}] <- {}", self.epoch, message.kind());
                Some(message)
            }
            Inbound::Dropped(reason) => {
                debug!("[{}] dropped inbound frame: {reason}", self.epoch);
                None
            }
        }
    }

    fn fault(&self, error: TransportError) {
        warn!("[{}] send failed: {error}", self.epoch);
        let _ = self.faults.send(Fault {
            epoch: self.epoch,
            error,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::envelope::decode_host;

    fn channel(capacity: usize) -> (Channel, mpsc::Receiver<String>, mpsc::UnboundedReceiver<Fault>) {
        let (out_tx, out_rx) = mpsc::channel(capacity);
        let (fault_tx, fault_rx) = mpsc::unbounded_channel();
        (Channel::new(Epoch::default().next(), out_tx, fault_tx), out_rx, fault_rx)
    }

    #[test]
    fn test_epoch_ordering() {
        let first = Epoch::default();
        let second = first.next();
        assert!(second > first);
        assert_eq!(second.value(), 1);
        assert_eq!(second.to_string(), "#1");
    }

    #[test]
    fn test_send_preserves_order() {
        let (channel, mut out, mut faults) = channel(8);
        channel.send(&HostMessage::Focus);
        channel.send(&HostMessage::Blur);

        let first = out.try_recv().unwrap();
        let second = out.try_recv().unwrap();
        assert_eq!(decode_host(&first), Inbound::Accepted(HostMessage::Focus));
        assert_eq!(decode_host(&second), Inbound::Accepted(HostMessage::Blur));
        assert!(faults.try_recv().is_err());
    }

    #[test]
    fn test_send_on_closed_pipe_reports_fault() {
        let (channel, out, mut faults) = channel(8);
        drop(out);
        channel.send(&HostMessage::Focus);

        let fault = faults.try_recv().unwrap();
        assert_eq!(fault.epoch, channel.epoch());
        assert!(matches!(fault.error, TransportError::Closed(_)));
    }

    #[test]
    fn test_send_on_full_pipe_reports_backpressure() {
        let (channel, _out, mut faults) = channel(1);
        channel.send(&HostMessage::Focus);
        channel.send(&HostMessage::Blur);

        let fault = faults.try_recv().unwrap();
        assert!(matches!(fault.error, TransportError::Backpressure));
    }

    #[test]
    fn test_accept_filters_invalid_frames() {
        let (channel, _out, _faults) = channel(1);
        assert_eq!(
            channel.accept(r#"{"source":"sandbox-host","version":1,"payload":{"type":"ready"}}"#),
            Some(ChildMessage::Ready)
        );
        assert_eq!(
            channel.accept(r#"{"source":"sandbox-host","version":9,"payload":{"type":"ready"}}"#),
            None
        );
        assert_eq!(channel.accept("garbage"), None);
    }
}
