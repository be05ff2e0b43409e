//! Host/child wire protocol.
//!
//! Frames are newline-delimited JSON envelopes. Each envelope carries a
//! constant source tag and a protocol version; anything that does not match
//! both is dropped at the boundary and never reaches the supervisor.

pub mod channel;
pub mod envelope;

pub use channel::{Channel, Epoch, Fault};
pub use envelope::{
    decode_child, decode_host, encode, ChildMessage, DropReason, HostMessage, Inbound,
    PROTOCOL_VERSION, SOURCE_TAG,
};
