//! Bounded frame handoff between the delivery context and the tracking
//! worker.
//!
//! Backpressure is expressed as frame dropping, never producer blocking: the
//! delivery callback must return quickly regardless of how far the worker has
//! fallen behind, and the consumer accepts losing frames over unbounded
//! queueing. The occupancy bound is enforced by the channel's atomic
//! capacity, so no check-then-add race can exceed it under any interleaving.

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded, select};

use crate::tracking::data::FramePacket;

/// Build the handoff queue. `pending_limit` is the occupancy at or below
/// which a new packet is still accepted; capacity is therefore
/// `pending_limit + 1`.
pub(crate) fn frame_handoff(pending_limit: usize) -> (FrameSender, FrameReceiver) {
    let (tx, rx) = bounded(pending_limit + 1);
    (FrameSender { tx }, FrameReceiver { rx })
}

/// Producer half, held by the delivery context.
pub(crate) struct FrameSender {
    tx: Sender<FramePacket>,
}

impl FrameSender {
    /// Non-blocking enqueue. `false` means the packet was dropped: the queue
    /// was at capacity or closed.
    pub(crate) fn try_enqueue(&self, packet: FramePacket) -> bool {
        match self.tx.try_send(packet) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => false,
        }
    }

    pub(crate) fn occupancy(&self) -> usize {
        self.tx.len()
    }
}

/// Consumer half, held by the tracking worker. Cloning shares the same
/// queue; only one worker consumes at a time by session construction.
#[derive(Clone)]
pub(crate) struct FrameReceiver {
    rx: Receiver<FramePacket>,
}

impl FrameReceiver {
    /// Block until a packet is available. `None` is the closed signal: every
    /// sender is gone and no packet will ever arrive.
    pub(crate) fn take(&self) -> Option<FramePacket> {
        self.rx.recv().ok()
    }

    /// Block until a packet is available, the queue closes, or `cancel`
    /// signals (by message or by disconnection). `None` in all but the first
    /// case.
    pub(crate) fn take_until(&self, cancel: &Receiver<()>) -> Option<FramePacket> {
        select! {
            recv(cancel) -> _ => None,
            recv(self.rx) -> packet => packet.ok(),
        }
    }
}
