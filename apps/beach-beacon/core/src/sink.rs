use tokio::sync::mpsc::{self, error::TrySendError};

use crate::error::WriteFailure;
use crate::frame::Frame;

/// Outcome of a single non-blocking write into a push sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    Failed(WriteFailure),
}

/// Write half of a push transport.
///
/// Writes must never block: a sink that cannot take the frame right now
/// reports [`WriteFailure::Saturated`] and the hub evicts it.
pub trait EventSink: Send + 'static {
    fn write(&self, frame: &Frame) -> Delivery;
}

impl EventSink for mpsc::Sender<Frame> {
    fn write(&self, frame: &Frame) -> Delivery {
        match self.try_send(frame.clone()) {
            Ok(()) => Delivery::Delivered,
            Err(TrySendError::Full(_)) => Delivery::Failed(WriteFailure::Saturated),
            Err(TrySendError::Closed(_)) => Delivery::Failed(WriteFailure::Closed),
        }
    }
}
