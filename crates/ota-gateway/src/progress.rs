//! Progress relay between protocol tasks and the uploader.
//!
//! A bounded queue of human-readable lines ending in exactly one terminal
//! [`Outcome`]. The write end is shared by the invitation and transfer tasks;
//! the read end belongs to whoever started the upload. Closing the queue
//! without a terminal outcome means the session was torn down underneath the
//! consumer, which the receiver reports as [`Outcome::Expired`].

use std::fmt;
use std::sync::Arc;

use futures_util::Stream;
use tokio::sync::{Mutex, mpsc};

/// Queue depth. Producers wait when the uploader stops reading.
pub const PROGRESS_CAPACITY: usize = 64;

/// How a session or upload ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Failed(String),
    /// The device never connected back, or the queue was closed early.
    Expired,
}

impl Outcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => write!(f, "done"),
            Self::Failed(message) => write!(f, "{}", message),
            Self::Expired => write!(f, "session expired: device never connected"),
        }
    }
}

/// One item on the progress queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Progress {
    Status(String),
    Finished(Outcome),
}

impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Status(line) => write!(f, "{}", line),
            Self::Finished(outcome) => write!(f, "{}", outcome),
        }
    }
}

/// Create a progress queue with the default capacity.
pub fn channel() -> (ProgressSender, ProgressReceiver) {
    with_capacity(PROGRESS_CAPACITY)
}

pub fn with_capacity(capacity: usize) -> (ProgressSender, ProgressReceiver) {
    let (tx, rx) = mpsc::channel(capacity);
    (
        ProgressSender {
            tx: Arc::new(Mutex::new(Some(tx))),
        },
        ProgressReceiver {
            rx,
            finished: false,
        },
    )
}

/// Write end of a progress queue. Clones share the same queue; closing it
/// through any clone closes it for all of them.
#[derive(Debug, Clone)]
pub struct ProgressSender {
    tx: Arc<Mutex<Option<mpsc::Sender<Progress>>>>,
}

impl ProgressSender {
    /// Append a status line. Returns false once the queue is closed or the
    /// reader has gone away.
    pub async fn emit(&self, line: impl Into<String>) -> bool {
        let Some(tx) = self.tx.lock().await.clone() else {
            return false;
        };
        tx.send(Progress::Status(line.into())).await.is_ok()
    }

    /// Deliver the terminal outcome and close the queue. Only the first call
    /// has any effect; returns whether this call closed the queue.
    pub async fn finish(&self, outcome: Outcome) -> bool {
        let Some(tx) = self.tx.lock().await.take() else {
            return false;
        };
        // Reader may already be gone; the queue is closed either way.
        let _ = tx.send(Progress::Finished(outcome)).await;
        true
    }

    /// Close the queue without a terminal outcome.
    pub async fn close(&self) -> bool {
        self.tx.lock().await.take().is_some()
    }

    pub async fn is_closed(&self) -> bool {
        self.tx
            .lock()
            .await
            .as_ref()
            .is_none_or(|tx| tx.is_closed())
    }
}

/// Read end of a progress queue.
#[derive(Debug)]
pub struct ProgressReceiver {
    rx: mpsc::Receiver<Progress>,
    finished: bool,
}

impl ProgressReceiver {
    /// Next item in production order. The last item is always a
    /// [`Progress::Finished`]; after it this returns `None`.
    pub async fn recv(&mut self) -> Option<Progress> {
        if self.finished {
            return None;
        }
        match self.rx.recv().await {
            Some(Progress::Finished(outcome)) => {
                self.finished = true;
                self.rx.close();
                Some(Progress::Finished(outcome))
            }
            Some(status) => Some(status),
            None => {
                self.finished = true;
                Some(Progress::Finished(Outcome::Expired))
            }
        }
    }

    /// Consume the whole sequence, returning the status lines and the outcome.
    pub async fn drain(mut self) -> (Vec<String>, Outcome) {
        let mut lines = Vec::new();
        while let Some(item) = self.recv().await {
            match item {
                Progress::Status(line) => lines.push(line),
                Progress::Finished(outcome) => return (lines, outcome),
            }
        }
        (lines, Outcome::Expired)
    }

    /// Newline-terminated rendering of every item, for streaming to a client.
    pub fn into_lines(self) -> impl Stream<Item = String> + Send + 'static {
        let mut receiver = self;
        async_stream::stream! {
            while let Some(item) = receiver.recv().await {
                yield format!("{}\n", item);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn test_lines_arrive_in_order_then_outcome() {
        let (tx, rx) = channel();
        assert!(tx.emit("Sending Flash Invite").await);
        assert!(tx.emit("connection established").await);
        assert!(tx.finish(Outcome::Completed).await);

        let (lines, outcome) = rx.drain().await;
        assert_eq!(lines, vec!["Sending Flash Invite", "connection established"]);
        assert_eq!(outcome, Outcome::Completed);
    }

    #[tokio::test]
    async fn test_no_writes_after_finish() {
        let (tx, mut rx) = channel();
        let other = tx.clone();
        assert!(tx.finish(Outcome::Failed("boom".into())).await);
        assert!(!other.emit("late").await);
        assert!(!other.finish(Outcome::Completed).await);
        assert!(tx.is_closed().await);

        assert_eq!(
            rx.recv().await,
            Some(Progress::Finished(Outcome::Failed("boom".into())))
        );
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_close_without_outcome_reports_expired() {
        let (tx, mut rx) = channel();
        tx.emit("Sending Flash Invite").await;
        assert!(tx.close().await);
        assert!(!tx.close().await);

        assert_eq!(rx.recv().await, Some(Progress::Status("Sending Flash Invite".into())));
        assert_eq!(rx.recv().await, Some(Progress::Finished(Outcome::Expired)));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_dropped_sender_reports_expired() {
        let (tx, rx) = channel();
        drop(tx);
        let (lines, outcome) = rx.drain().await;
        assert!(lines.is_empty());
        assert_eq!(outcome, Outcome::Expired);
    }

    #[tokio::test]
    async fn test_emit_fails_when_reader_dropped() {
        let (tx, rx) = channel();
        drop(rx);
        assert!(!tx.emit("nobody listening").await);
        assert!(tx.is_closed().await);
    }

    #[tokio::test]
    async fn test_into_lines_renders_outcome() {
        let (tx, rx) = channel();
        tx.emit("try 1/10: timed out").await;
        tx.finish(Outcome::Failed("invitation failed".into())).await;

        let lines: Vec<String> = rx.into_lines().collect().await;
        assert_eq!(lines, vec!["try 1/10: timed out\n", "invitation failed\n"]);
    }
}
