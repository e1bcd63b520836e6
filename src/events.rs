//! Progress, line and completion sinks, and the events the shell renders.

use serde::Serialize;
use tokio::sync::mpsc;

/// Receives the running byte count of a fetch. `total` is `None` when the
/// server did not declare a content length.
pub trait ProgressSink: Send + Sync {
    fn progress(&self, received: u64, total: Option<u64>);
}

/// Receives one decoded line of log output.
pub trait LineSink: Send + Sync {
    fn line(&self, text: String);
}

/// Receives the final outcome of a run.
pub trait CompletionSink: Send + Sync {
    fn complete(&self, ok: bool, message: String);
}

impl<F> ProgressSink for F
where
    F: Fn(u64, Option<u64>) + Send + Sync,
{
    fn progress(&self, received: u64, total: Option<u64>) {
        self(received, total)
    }
}

impl<F> LineSink for F
where
    F: Fn(String) + Send + Sync,
{
    fn line(&self, text: String) {
        self(text)
    }
}

/// Everything a run reports: its lines and its outcome.
pub trait RunSink: LineSink + CompletionSink {}

impl<T: LineSink + CompletionSink> RunSink for T {}

/// Core -> shell events. The shell renders them as text or JSON lines.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum DeskEvent {
    Line {
        text: String,
    },
    FetchProgress {
        received: u64,
        total: Option<u64>,
    },
    RunStarted {
        url: String,
    },
    Completed {
        ok: bool,
        message: String,
    },
}

/// Channel-backed sink; never blocks the caller.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<DeskEvent>,
}

impl EventSender {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<DeskEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn send(&self, event: DeskEvent) {
        // The receiver only goes away during shutdown; late events are dropped.
        if self.tx.send(event).is_err() {
            log::debug!("event receiver closed, dropping event");
        }
    }
}

impl ProgressSink for EventSender {
    fn progress(&self, received: u64, total: Option<u64>) {
        self.send(DeskEvent::FetchProgress { received, total });
    }
}

impl LineSink for EventSender {
    fn line(&self, text: String) {
        self.send(DeskEvent::Line { text });
    }
}

impl CompletionSink for EventSender {
    fn complete(&self, ok: bool, message: String) {
        self.send(DeskEvent::Completed { ok, message });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_json_shape() {
        let json = serde_json::to_value(DeskEvent::FetchProgress {
            received: 10,
            total: None,
        })
        .unwrap();
        assert_eq!(
            json,
            serde_json::json!({"event": "FetchProgress", "data": {"received": 10, "total": null}})
        );
    }

    #[tokio::test]
    async fn test_sender_preserves_order() {
        let (sender, mut rx) = EventSender::channel();
        sender.line("one".into());
        sender.progress(5, Some(10));
        sender.complete(true, "done".into());
        drop(sender);

        let mut seen = Vec::new();
        while let Some(ev) = rx.recv().await {
            seen.push(ev);
        }
        assert_eq!(
            seen,
            vec![
                DeskEvent::Line { text: "one".into() },
                DeskEvent::FetchProgress {
                    received: 5,
                    total: Some(10)
                },
                DeskEvent::Completed {
                    ok: true,
                    message: "done".into()
                },
            ]
        );
    }

    #[test]
    fn test_closures_are_sinks() {
        use std::sync::Mutex;

        let lines = Mutex::new(Vec::new());
        let sink = |text: String| lines.lock().unwrap().push(text);
        sink.line("hello".into());
        assert_eq!(lines.lock().unwrap().as_slice(), ["hello".to_string()]);
    }
}
