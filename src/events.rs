//! Log line publication.
//!
//! Every captured line is published tagged with its instance id, and
//! subscribers pick a single instance or all of them. Delivery is best
//! effort: nobody listening is not an error, and a subscriber only sees lines
//! produced after it subscribed.

use tokio::sync::broadcast;

use crate::output::StreamKind;

const CHANNEL_CAPACITY: usize = 1024;

/// A line of output from one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEvent {
    pub instance_id: String,
    pub stream: StreamKind,
    pub line: String,
}

/// Receives log lines as they are captured.
pub trait LogSink: Send + Sync {
    fn publish(&self, event: LogEvent);
}

/// In-process fan-out of log events over a broadcast channel.
#[derive(Debug, Clone)]
pub struct LogBroadcaster {
    tx: broadcast::Sender<LogEvent>,
}

impl Default for LogBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl LogBroadcaster {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Subscribes to every instance.
    pub fn subscribe_all(&self) -> LogSubscription {
        LogSubscription {
            rx: self.tx.subscribe(),
            instance_id: None,
        }
    }

    /// Subscribes to a single instance's lines.
    pub fn subscribe(&self, instance_id: &str) -> LogSubscription {
        LogSubscription {
            rx: self.tx.subscribe(),
            instance_id: Some(instance_id.to_string()),
        }
    }
}

impl LogSink for LogBroadcaster {
    fn publish(&self, event: LogEvent) {
        let _ = self.tx.send(event);
    }
}

/// A live feed of log events, optionally filtered to one instance.
#[derive(Debug)]
pub struct LogSubscription {
    rx: broadcast::Receiver<LogEvent>,
    instance_id: Option<String>,
}

impl LogSubscription {
    /// Waits for the next matching event. Returns `None` once the publisher is
    /// gone. Events missed because the subscriber lagged are skipped.
    pub async fn recv(&mut self) -> Option<LogEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => {
                    if self.matches(&event) {
                        return Some(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    fn matches(&self, event: &LogEvent) -> bool {
        self.instance_id
            .as_deref()
            .map_or(true, |id| id == event.instance_id)
    }
}
