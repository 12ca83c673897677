//! Host-side transport to a simulator living in an embedded frame.
//!
//! [`CommunicationChannel`] binds to one frame element, filters inbound traffic
//! by origin and sender tag, and fans accepted events out to handlers keyed by
//! [`EventKind`](sim_proto::EventKind). [`Correlator`] layers single-reply
//! queries on top of it.

mod channel;
mod correlator;
pub mod frame;
mod registry;

use std::time::Duration;

use sim_proto::EventKind;
use thiserror::Error;

pub use channel::{
    AttachOutcome, ChannelConfig, CommunicationChannel, RetryPolicy, DEFAULT_ELEMENT_ID,
};
pub use correlator::{Correlator, DEFAULT_STATUS_TIMEOUT};
pub use frame::{FrameElement, FrameHost, FrameWindow, LocalFrame, LocalFrameHost, RawInbound};
pub use registry::{Handler, HandlerRegistry, HandlerResult};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("frame element {element_id:?} not found after {attempts} attempts")]
    ElementNotFound { element_id: String, attempts: u32 },
    #[error("frame window unavailable after {attempts} attempts")]
    TargetUnavailable { attempts: u32 },
    #[error("failed to deliver {command}: {reason}")]
    Delivery {
        command: &'static str,
        reason: String,
    },
    #[error("failed to encode command: {0}")]
    Encode(String),
}

pub type ChannelResult<T> = Result<T, ChannelError>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RequestError {
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("timed out after {after:?} waiting for {expect}")]
    Timeout { expect: EventKind, after: Duration },
    #[error("expected a different reply, got {0}")]
    UnexpectedReply(EventKind),
}
