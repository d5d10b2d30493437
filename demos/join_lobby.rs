//! Join a lobby over a flaky link, load its resources from disk, and print every event.
use lobbyline::prelude::*;
use lobbyline::MulticastSink;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_max_level(tracing::Level::DEBUG).init();

    // A throwaway asset directory: two resources present, one missing.
    let assets = tempfile::tempdir()?;
    std::fs::write(assets.path().join("map.bin"), vec![0u8; 4096])?;
    std::fs::write(assets.path().join("palette.bin"), b"rgb")?;

    let config = JoinConfig::builder()
        .retry(
            RetryConfig::builder()
                .max_attempts(4)
                .base_delay(Duration::from_millis(200))
                .max_delay(Duration::from_secs(2))
                .build()?,
        )
        .per_item_timeout(Duration::from_secs(2))
        .concurrency_limit(2)
        .build()?;

    let connector = ScriptedConnector::new([
        Step::Fail(Signal::ConnectTimeout),
        Step::Fail(Signal::ConnectionRefused),
        Step::AcceptAfter(Duration::from_millis(50)),
    ]);
    let log = MemorySink::new();
    let controller = ConnectionController::builder(connector, FsLoader::new(assets.path()))
        .config(config)
        .log_sink(MulticastSink::new(log.clone(), TracingSink))
        .build();

    let mut events = controller.subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            println!("event: {}", event);
            if event.is_terminal() {
                break;
            }
        }
    });

    let outcome = controller.join("harbor-lobby", ["map.bin", "palette.bin", "music.ogg"]).await;
    printer.await?;

    println!("attempts: {}", outcome.attempts);
    match &outcome.status {
        JoinStatus::Joined => println!("joined"),
        JoinStatus::PartiallyLoaded { missing } => println!("joined without {:?}", missing),
        JoinStatus::Failed { kind, cause } => println!("failed: {} ({})", kind, cause),
    }
    for entry in log.entries() {
        println!("log: {}", entry);
    }
    Ok(())
}
