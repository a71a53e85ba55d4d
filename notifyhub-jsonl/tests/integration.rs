use notifyhub::telemetry::{DispatchEvent, Sink};
use notifyhub_jsonl::JsonlSink;
use std::path::PathBuf;

#[tokio::test]
async fn writes_json_lines() {
    let path = PathBuf::from("/tmp/notifyhub-jsonl-test.log");
    let _ = std::fs::remove_file(&path);
    let sink = JsonlSink::new(path.to_string_lossy().to_string());

    sink.emit(DispatchEvent::Retrying { notification_id: "n1".into(), attempt: 1, next_delay_ms: 50 }).await;

    let contents = std::fs::read_to_string(&path).expect("file");
    assert!(contents.contains("retrying"));
}
