//! JSON-Lines telemetry sink. Writes one event per line; bring your own path.

use async_trait::async_trait;
use notifyhub::telemetry::events::{confirmation_event_to_json, dispatch_event_to_json};
use notifyhub::telemetry::{ConfirmationEvent, DispatchEvent, Sink};

#[derive(Clone, Debug)]
pub struct JsonlSink {
    path: String,
}

impl JsonlSink {
    pub fn new<S: Into<String>>(path: S) -> Self {
        Self { path: path.into() }
    }

    async fn append(&self, line: String) {
        let result: std::io::Result<()> = async {
            use tokio::io::AsyncWriteExt;
            let mut file = tokio::fs::OpenOptions::new().create(true).append(true).open(&self.path).await?;
            file.write_all(line.as_bytes()).await?;
            file.flush().await
        }
        .await;
        if let Err(e) = result {
            tracing::warn!(error = %e, path = %self.path, "jsonl sink write failed");
        }
    }
}

#[async_trait]
impl Sink<DispatchEvent> for JsonlSink {
    async fn emit(&self, event: DispatchEvent) {
        self.append(dispatch_event_to_json(&event).to_string() + "\n").await;
    }
}

#[async_trait]
impl Sink<ConfirmationEvent> for JsonlSink {
    async fn emit(&self, event: ConfirmationEvent) {
        self.append(confirmation_event_to_json(&event).to_string() + "\n").await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn writes_dispatch_event_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        let sink = JsonlSink::new(path.to_string_lossy().to_string());

        sink.emit(DispatchEvent::Dispatched { notification_id: "n1".into(), attempt: 1 }).await;

        let contents = std::fs::read_to_string(&path).expect("file");
        assert!(contents.contains("\"dispatched\""));
        assert!(contents.contains("n1"));
    }

    #[tokio::test]
    async fn appends_multiple_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        let sink = JsonlSink::new(path.to_string_lossy().to_string());

        sink.emit(DispatchEvent::Enqueued { notification_id: "n1".into(), priority: 0 }).await;
        sink.emit(ConfirmationEvent::BatchFlushed { count: 3, flushed_at_ms: 100 }).await;

        let contents = std::fs::read_to_string(&path).expect("file");
        assert_eq!(contents.lines().count(), 2);
    }
}
