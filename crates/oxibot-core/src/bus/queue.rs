//! Typed pub/sub message bus — the central nervous system of Oxibot.
//!
//! Channels publish `InboundMessage`s; any number of subscribers (the
//! Bus Adapter, diagnostics, future fan-out consumers) may each hold an
//! independent receiver. The Agent Loop's outbound results are
//! published the same way and routed back out to channels.
//!
//! Built on `tokio::sync::broadcast` rather than `mpsc`: broadcast gives
//! every subscriber its own lagging-tolerant queue, so one slow or
//! erroring subscriber can never block another — exactly the
//! independence the bus contract requires.

use super::types::{InboundMessage, OutboundMessage};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;

/// Event kind tag, mostly useful for logging/metrics.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    Inbound,
    Outbound,
}

/// Error returned by bus operations.
#[derive(thiserror::Error, Debug)]
pub enum BusError {
    #[error("message bus is closed")]
    Closed,
}

/// The message bus connecting channels ↔ agent loop via pub/sub.
pub struct MessageBus {
    inbound_tx: broadcast::Sender<InboundMessage>,
    outbound_tx: broadcast::Sender<OutboundMessage>,
    closed: AtomicBool,
}

impl MessageBus {
    /// Create a new message bus. `capacity` bounds each subscriber's lag
    /// buffer (a slow subscriber that falls more than `capacity` events
    /// behind observes `RecvError::Lagged`, not backpressure on publishers).
    pub fn new(capacity: usize) -> Self {
        let (inbound_tx, _) = broadcast::channel(capacity.max(1));
        let (outbound_tx, _) = broadcast::channel(capacity.max(1));
        MessageBus {
            inbound_tx,
            outbound_tx,
            closed: AtomicBool::new(false),
        }
    }

    /// Publish an inbound event. A no-op once the bus is closed.
    /// Returns `Ok(())` even if there are currently no subscribers —
    /// "nobody is listening yet" is not a bus error.
    pub fn publish_inbound(&self, msg: InboundMessage) -> Result<(), BusError> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        let _ = self.inbound_tx.send(msg);
        Ok(())
    }

    /// Publish an outbound event. Same no-op-after-close semantics.
    pub fn publish_outbound(&self, msg: OutboundMessage) -> Result<(), BusError> {
        if self.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        let _ = self.outbound_tx.send(msg);
        Ok(())
    }

    /// Subscribe to inbound events. Fails once the bus has been closed.
    pub fn subscribe_inbound(&self) -> Result<broadcast::Receiver<InboundMessage>, BusError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BusError::Closed);
        }
        Ok(self.inbound_tx.subscribe())
    }

    /// Subscribe to outbound events. Fails once the bus has been closed.
    pub fn subscribe_outbound(&self) -> Result<broadcast::Receiver<OutboundMessage>, BusError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BusError::Closed);
        }
        Ok(self.outbound_tx.subscribe())
    }

    /// Close the bus. Further `publish_*` calls are no-ops and `subscribe_*`
    /// calls fail with `Closed`; receivers already subscribed drain
    /// whatever is left in their own queue and then see the channel close.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
