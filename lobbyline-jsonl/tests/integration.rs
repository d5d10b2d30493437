use lobbyline::prelude::*;
use lobbyline::Signal;
use lobbyline_jsonl::JsonlSink;
use std::time::{Duration, UNIX_EPOCH};
use tower_service::Service;

#[tokio::test]
async fn writes_json_lines() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("join.log");
    let mut sink = JsonlSink::new(&path);

    let entry = LogEntry::new(
        UNIX_EPOCH + Duration::from_secs(1),
        ErrorKind::Timeout,
        FailureCause::Transport,
        "L1",
        "connect timed out",
    )
    .with_attempt(1);
    sink.call(entry.clone()).await.unwrap();
    sink.call(entry).await.unwrap();

    let contents = std::fs::read_to_string(&path).expect("file");
    let lines: Vec<&str> = contents.lines().collect();
    assert_eq!(lines.len(), 2);
    let value: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
    assert_eq!(value["kind"], "timeout");
    assert_eq!(value["attempt"], 1);
}

#[tokio::test]
async fn records_a_whole_join() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("join.log");

    let controller = ConnectionController::builder(
        ScriptedConnector::failing_then_accept(Signal::ConnectTimeout, 1),
        InMemoryLoader::builder().resource("map").failing("texture", ErrorKind::NotFound).build(),
    )
    .config(presets::testing())
    .sleeper(InstantSleeper)
    .log_sink(JsonlSink::new(&path))
    .build();

    let outcome = controller.join("L1", ["map", "texture"]).await;
    assert_eq!(outcome.missing().map(|m| m.len()), Some(1));

    let contents = std::fs::read_to_string(&path).expect("file");
    let kinds: Vec<String> = contents
        .lines()
        .map(|line| serde_json::from_str::<serde_json::Value>(line).unwrap())
        .map(|value| value["kind"].as_str().unwrap_or_default().to_string())
        .collect();
    assert_eq!(kinds, vec!["timeout".to_string(), "not_found".to_string()]);
}
