use redq::config::{BrokerConfig, RedqConfig};
use redq::prelude::*;
use std::time::Duration;

async fn hello(payload: Payload) -> RedqResult<()> {
    let name: String = payload.kwarg("name")?;
    let message: String = payload.kwarg("message")?;
    println!("👋 Hello {}: {}", name, message);
    tokio::time::sleep(Duration::from_millis(500)).await;
    println!("✅ Task completed for {}", name);
    Ok(())
}

#[tokio::main]
async fn main() -> RedqResult<()> {
    let config = RedqConfig {
        broker: BrokerConfig::redis("redis://localhost:6379".to_string()).with_prefix("redq-demo"),
        ..RedqConfig::development()
    };
    config.logging.init()?;

    println!("🔗 Connecting to Redis");
    let redq = Redq::new(config).await?;
    redq.health_check().await?;

    redq.queue("high").await;
    redq.queue("default").await;
    let hello = redq.task("hello", hello).await?;

    let greetings = [
        ("User", "Welcome to redq"),
        ("Redis", "Task successfully enqueued!"),
        ("Alice", "Hello from Wonderland!"),
        ("Bob", "Greetings from the Builder!"),
    ];

    for (name, message) in greetings {
        hello
            .delay(
                Invocation::new()
                    .kwarg("name", name)
                    .kwarg("message", message),
            )
            .await?;
        println!("📥 Task enqueued: {}", name);
    }

    hello
        .delay(
            Invocation::new()
                .kwarg("name", "Urgent")
                .kwarg("message", "Jumped the line")
                .queue("high"),
        )
        .await?;

    println!("{}", redq.info().await?.to_json()?);

    println!("🔨 Starting workers, press Ctrl+C to stop");
    redq.worker().run_until_signal().await
}
