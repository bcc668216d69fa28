use redq::prelude::*;
use std::time::Duration;
use tokio::sync::watch;

async fn hello(payload: Payload) -> RedqResult<()> {
    let name: String = payload.arg(0)?;
    let greeting: Option<String> = payload.kwarg_opt("greeting")?;
    println!(
        "👋 {} {} (queue: {})",
        greeting.as_deref().unwrap_or("Hello"),
        name,
        payload.queue
    );
    Ok(())
}

async fn reload_config(_payload: Payload) -> RedqResult<()> {
    println!("🔄 Reloading configuration");
    Ok(())
}

async fn heartbeat(_payload: Payload) -> RedqResult<()> {
    println!("💓 Heartbeat");
    Ok(())
}

#[tokio::main]
async fn main() -> RedqResult<()> {
    let config = RedqConfig::development();
    config.logging.init()?;

    println!("🚀 redq in-memory example");

    let redq = Redq::new(config).await?;
    redq.queue("high").await;
    redq.queue("default").await;

    let hello = redq.task("hello", hello).await?;
    let reload = redq.task("reload_config", reload_config).await?;
    let heartbeat = redq.task_on("heartbeat", "high", heartbeat).await?;

    let engine = redq.worker();
    engine.start().await?;

    for name in ["Alice", "Bob", "Charlie"] {
        hello.delay(Invocation::new().arg(name)).await?;
    }
    hello
        .delay(
            Invocation::new()
                .arg("Dave")
                .kwarg("greeting", "Hi")
                .queue("high"),
        )
        .await?;
    hello
        .delay(
            Invocation::new()
                .arg("Eve")
                .countdown(Duration::from_secs(2)),
        )
        .await?;

    // Wait for the listener before broadcasting; messages are not stored.
    while !engine.is_listening() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let receivers = reload.broadcast(Invocation::new()).await?;
    println!("📣 Broadcast delivered to {} worker process(es)", receivers);

    let (stop_tx, stop_rx) = watch::channel(false);
    let scheduler = redq
        .scheduler()
        .every(Duration::from_secs(1), &heartbeat, Invocation::new())?;
    let scheduler = tokio::spawn(scheduler.run(stop_rx));

    tokio::time::sleep(Duration::from_secs(4)).await;

    stop_tx.send_replace(true);
    if let Ok(result) = scheduler.await {
        result?;
    }

    println!("{}", redq.info().await?.to_json()?);
    println!("📊 {:?}", engine.stats().await);

    engine.shutdown().await
}
