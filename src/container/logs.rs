//! Bounded log line buffers.
//!
//! Every container owns one [`LogPipe`]. Producers (log follow tasks, stdout
//! readers) push [`LogLine`]s through a [`LogSender`]; consumers drain them
//! through a [`LogTail`]. Closing the pipe drops the container's sender and
//! cancels its producers, so tails observe the close promptly.

use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// One line of output from a workload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogLine {
    /// Name of the container that produced the line
    pub source: String,
    /// Line contents without trailing newline
    pub message: String,
    /// When the backend produced the line, or when it was received if the
    /// backend gives no time
    pub timestamp: DateTime<Utc>,
}

impl LogLine {
    /// Create a line stamped with the current time.
    pub fn new(source: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

/// What a full buffer does with new lines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Producer waits until a consumer makes room
    #[default]
    Block,
    /// Oldest buffered lines are discarded to make room
    DropOldest,
}

/// Producer side of a log buffer.
#[derive(Clone)]
pub(crate) enum LogSender {
    Block(mpsc::Sender<LogLine>),
    DropOldest(broadcast::Sender<LogLine>),
}

impl LogSender {
    /// Push a line; returns false once the buffer has been closed.
    pub(crate) async fn send(&self, line: LogLine) -> bool {
        match self {
            Self::Block(tx) => tx.send(line).await.is_ok(),
            Self::DropOldest(tx) => tx.send(line).is_ok(),
        }
    }
}

enum LogReceiver {
    Block(mpsc::Receiver<LogLine>),
    DropOldest(broadcast::Receiver<LogLine>),
}

/// Consumer side of a log buffer.
///
/// Clones share one underlying receiver, so a line is delivered to exactly
/// one of them.
#[derive(Clone)]
pub struct LogTail {
    inner: Arc<tokio::sync::Mutex<LogReceiver>>,
}

impl LogTail {
    /// Take up to `max` buffered lines without waiting for new ones.
    ///
    /// Returns an empty list when nothing is pending, when the buffer is
    /// closed, or when another consumer is currently reading.
    pub fn drain(&self, max: usize) -> Vec<LogLine> {
        let mut lines = Vec::new();
        let Ok(mut receiver) = self.inner.try_lock() else {
            return lines;
        };

        while lines.len() < max {
            match &mut *receiver {
                LogReceiver::Block(rx) => match rx.try_recv() {
                    Ok(line) => lines.push(line),
                    Err(_) => break,
                },
                LogReceiver::DropOldest(rx) => match rx.try_recv() {
                    Ok(line) => lines.push(line),
                    Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                        debug!(skipped, "log tail lagged, oldest lines dropped");
                    }
                    Err(_) => break,
                },
            }
        }

        lines
    }

    /// Wait for the next line; `None` once the buffer is closed and empty.
    pub async fn recv(&self) -> Option<LogLine> {
        let mut receiver = self.inner.lock().await;

        match &mut *receiver {
            LogReceiver::Block(rx) => rx.recv().await,
            LogReceiver::DropOldest(rx) => loop {
                match rx.recv().await {
                    Ok(line) => return Some(line),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "log tail lagged, oldest lines dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            },
        }
    }
}

fn channel(capacity: usize, policy: OverflowPolicy) -> (LogSender, LogTail) {
    let capacity = capacity.max(1);
    let (sender, receiver) = match policy {
        OverflowPolicy::Block => {
            let (tx, rx) = mpsc::channel(capacity);
            (LogSender::Block(tx), LogReceiver::Block(rx))
        }
        OverflowPolicy::DropOldest => {
            let (tx, rx) = broadcast::channel(capacity);
            (LogSender::DropOldest(tx), LogReceiver::DropOldest(rx))
        }
    };

    (
        sender,
        LogTail {
            inner: Arc::new(tokio::sync::Mutex::new(receiver)),
        },
    )
}

struct PipeState {
    sender: Option<LogSender>,
    tail: LogTail,
    producers: CancellationToken,
}

/// A container's log buffer across its start/stop cycles.
///
/// The pipe starts open. [`LogPipe::close`] closes it; the next
/// [`LogPipe::open`] after a close installs a fresh buffer, so a restarted
/// container hands out a new tail.
pub(crate) struct LogPipe {
    capacity: usize,
    policy: OverflowPolicy,
    state: Mutex<PipeState>,
}

impl LogPipe {
    pub(crate) fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        let (sender, tail) = channel(capacity, policy);

        Self {
            capacity,
            policy,
            state: Mutex::new(PipeState {
                sender: Some(sender),
                tail,
                producers: CancellationToken::new(),
            }),
        }
    }

    /// Current consumer handle.
    pub(crate) fn tail(&self) -> LogTail {
        self.state.lock().tail.clone()
    }

    /// Producer handle plus the token that cancels producers on close.
    pub(crate) fn open(&self) -> (LogSender, CancellationToken) {
        let mut state = self.state.lock();

        let sender = match &state.sender {
            Some(sender) => sender.clone(),
            None => {
                let (sender, tail) = channel(self.capacity, self.policy);
                state.sender = Some(sender.clone());
                state.tail = tail;
                state.producers = CancellationToken::new();
                sender
            }
        };

        (sender, state.producers.clone())
    }

    /// Close the buffer. Returns false if it was already closed.
    pub(crate) fn close(&self) -> bool {
        let mut state = self.state.lock();
        state.producers.cancel();
        state.sender.take().is_some()
    }
}

/// A line as read from a backend.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct RawLine {
    pub(crate) message: String,
    pub(crate) timestamp: Option<DateTime<Utc>>,
}

impl RawLine {
    pub(crate) fn at(message: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            message: message.into(),
            timestamp: Some(timestamp),
        }
    }
}

impl From<String> for RawLine {
    fn from(message: String) -> Self {
        Self {
            message,
            timestamp: None,
        }
    }
}

/// Forward lines from `source` into `sender` until the source ends, the
/// buffer closes, or `producers` is cancelled.
pub(crate) async fn pump<S, T>(
    name: String,
    sender: LogSender,
    producers: CancellationToken,
    source: S,
) where
    S: Stream<Item = T>,
    T: Into<RawLine>,
{
    let forward = async {
        let mut source = std::pin::pin!(source);
        while let Some(raw) = source.next().await {
            let raw = raw.into();
            let mut line = LogLine::new(name.as_str(), raw.message);
            if let Some(timestamp) = raw.timestamp {
                line.timestamp = timestamp;
            }
            if !sender.send(line).await {
                break;
            }
        }
    };

    tokio::select! {
        _ = producers.cancelled() => {}
        _ = forward => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_drain_is_bounded_and_non_blocking() {
        let pipe = LogPipe::new(8, OverflowPolicy::Block);
        let (sender, _) = pipe.open();
        for i in 0..3 {
            assert!(sender.send(LogLine::new("web", format!("line {}", i))).await);
        }

        let tail = pipe.tail();
        let lines = tail.drain(2);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].message, "line 0");
        assert_eq!(tail.drain(10).len(), 1);
        assert!(tail.drain(10).is_empty());
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_ends_tail() {
        let pipe = LogPipe::new(8, OverflowPolicy::Block);
        let tail = pipe.tail();

        assert!(pipe.close());
        assert!(!pipe.close());
        assert_eq!(tail.recv().await, None);
    }

    #[tokio::test]
    async fn test_reopen_after_close_gives_fresh_tail() {
        let pipe = LogPipe::new(8, OverflowPolicy::Block);
        pipe.close();

        let (sender, _) = pipe.open();
        assert!(sender.send(LogLine::new("web", "again")).await);
        let lines = pipe.tail().drain(10);
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].message, "again");
    }

    #[tokio::test]
    async fn test_drop_oldest_keeps_newest_lines() {
        let pipe = LogPipe::new(2, OverflowPolicy::DropOldest);
        let (sender, _) = pipe.open();
        for i in 0..5 {
            assert!(sender.send(LogLine::new("web", format!("line {}", i))).await);
        }

        let messages: Vec<_> = pipe
            .tail()
            .drain(10)
            .into_iter()
            .map(|l| l.message)
            .collect();
        assert_eq!(messages, vec!["line 3", "line 4"]);
    }

    #[tokio::test]
    async fn test_pump_stops_when_cancelled() {
        let pipe = LogPipe::new(1, OverflowPolicy::Block);
        let (sender, producers) = pipe.open();
        let spam = futures::stream::repeat("spam".to_string());
        let handle = tokio::spawn(pump("web".to_string(), sender, producers, spam));

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        pipe.close();
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .expect("pump did not stop")
            .unwrap();
    }

    #[tokio::test]
    async fn test_pump_keeps_backend_timestamps() {
        let pipe = LogPipe::new(4, OverflowPolicy::Block);
        let (sender, producers) = pipe.open();
        let produced = DateTime::parse_from_rfc3339("2024-05-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let source = futures::stream::iter(vec![
            RawLine::at("stamped", produced),
            RawLine::from("plain".to_string()),
        ]);
        pump("web".to_string(), sender, producers, source).await;

        let lines = pipe.tail().drain(10);
        assert_eq!(lines[0].message, "stamped");
        assert_eq!(lines[0].timestamp, produced);
        assert_eq!(lines[1].message, "plain");
        assert!(lines[1].timestamp > produced);
    }
}
