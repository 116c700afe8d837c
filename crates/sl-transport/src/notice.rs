//! Outbound Transport Notices
//!
//! One-way signal path from the engine to UI/automation/control-surface
//! listeners. Notices are fired after the corresponding state mutation
//! completes; the channel is bounded and the send never blocks, so a slow
//! listener costs dropped notices, never a stalled audio callback.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_channel::Sender;
use log::debug;

use sl_core::FramePos;

/// Notification fired by the transport after a state mutation
#[derive(Debug, Clone, PartialEq)]
pub enum TransportNotice {
    /// Transport started or stopped rolling
    StateChanged { rolling: bool },
    /// Playhead jumped discontinuously (locate, loop wrap, micro-seek)
    PositionChanged { frame: FramePos },
    /// Session length changed (a capture pass ended)
    DurationChanged,
    /// A locate completed
    Located { frame: FramePos, rolling: bool },
    /// Loop play wrapped back to the loop start
    TransportLooped,
    /// A new sync source was selected ("internal" when none)
    SyncSourceChanged { name: String },
    /// The active sync source failed and was dropped
    SyncSourceLost { name: String },
    /// Record arm state changed
    RecordStateChanged { enabled: bool },
    /// A non-fatal engine failure the user should see
    Error { what: String },
}

/// Non-blocking producer side of the notice channel
pub(crate) struct NoticeSender {
    tx: Sender<TransportNotice>,
    dropped: Arc<AtomicU64>,
}

impl NoticeSender {
    pub(crate) fn new(tx: Sender<TransportNotice>, dropped: Arc<AtomicU64>) -> Self {
        Self { tx, dropped }
    }

    /// Try-send; a full channel drops the notice and bumps the counter
    pub(crate) fn send(&self, notice: TransportNotice) {
        if self.tx.try_send(notice).is_err() {
            let n = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            debug!("notice channel full, {n} dropped so far");
        }
    }
}

impl Clone for NoticeSender {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            dropped: Arc::clone(&self.dropped),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;

    #[test]
    fn test_full_channel_drops_and_counts() {
        let (tx, rx) = bounded(2);
        let dropped = Arc::new(AtomicU64::new(0));
        let sender = NoticeSender::new(tx, Arc::clone(&dropped));

        sender.send(TransportNotice::TransportLooped);
        sender.send(TransportNotice::TransportLooped);
        sender.send(TransportNotice::DurationChanged);

        assert_eq!(dropped.load(Ordering::Relaxed), 1);
        assert_eq!(rx.try_recv(), Ok(TransportNotice::TransportLooped));
        assert_eq!(rx.try_recv(), Ok(TransportNotice::TransportLooped));
        assert!(rx.try_recv().is_err());
    }
}
