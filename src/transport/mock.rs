//! In-memory [`FrameSink`] for state-machine tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::protocol::Frame;

use super::FrameSink;

/// Records every frame sent through it.
pub(crate) struct MockSink {
    sent: mpsc::UnboundedSender<String>,
    open: AtomicBool,
    fail_sends: AtomicBool,
}

impl MockSink {
    /// Creates an open sink and the receiver of what gets sent on it.
    pub(crate) fn new() -> (Arc<Self>, MockPeer) {
        let (sent, rx) = mpsc::unbounded_channel();
        let sink = Arc::new(Self {
            sent,
            open: AtomicBool::new(true),
            fail_sends: AtomicBool::new(false),
        });
        (sink, MockPeer { rx })
    }

    /// Makes every subsequent send fail while still reporting open.
    pub(crate) fn fail_sends(&self) {
        self.fail_sends.store(true, Ordering::SeqCst);
    }
}

impl FrameSink for MockSink {
    fn send_text(&self, text: String) -> Result<()> {
        if !self.is_open() || self.fail_sends.load(Ordering::SeqCst) {
            return Err(Error::ConnectionClosed);
        }
        self.sent.send(text).map_err(|_| Error::ConnectionClosed)
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

/// The far end of a [`MockSink`].
pub(crate) struct MockPeer {
    rx: mpsc::UnboundedReceiver<String>,
}

impl MockPeer {
    /// Waits for the next frame and parses it.
    pub(crate) async fn next_frame(&mut self) -> Frame {
        let text = self.rx.recv().await.expect("sink dropped");
        Frame::parse(&text).expect("valid frame")
    }

    /// Returns the next frame if one is already queued.
    pub(crate) fn try_next_frame(&mut self) -> Option<Frame> {
        self.rx
            .try_recv()
            .ok()
            .map(|text| Frame::parse(&text).expect("valid frame"))
    }

    /// Waits for the next frame that is not a heartbeat.
    pub(crate) async fn next_non_heartbeat(&mut self) -> Frame {
        loop {
            let frame = self.next_frame().await;
            if !matches!(
                frame,
                Frame::Control(crate::protocol::Control::Ping { .. })
                    | Frame::Control(crate::protocol::Control::Pong { .. })
            ) {
                return frame;
            }
        }
    }
}
