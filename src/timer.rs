//! Cancellable one-shot timers that post an event back to an owning loop.
//!
//! Both the broker and the client run their state on a single task that
//! consumes an event queue. A timer is a spawned sleep that sends one event
//! into that queue. The returned [`TimerHandle`] aborts the sleep when
//! dropped, so storing it inside the entry it belongs to ties the timer's
//! lifetime to the entry.
//!
//! An abort cannot recall an event that was already queued, so handlers must
//! tolerate stale events (look the entry up again, compare sequence numbers).

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Owned handle to a pending timer. Dropping it cancels the timer.
#[derive(Debug)]
pub struct TimerHandle {
    task: JoinHandle<()>,
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Sends `event` on `tx` after `delay`.
///
/// If the receiving loop has gone away the event is discarded.
pub fn schedule<E>(tx: &mpsc::UnboundedSender<E>, delay: Duration, event: E) -> TimerHandle
where
    E: Send + 'static,
{
    let tx = tx.clone();
    let task = tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let _ = tx.send(event);
    });

    TimerHandle { task }
}
