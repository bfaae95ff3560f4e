use std::error::Error;
use std::time::Duration;

use realtime_pubsub_sdk::{Client, SubscriptionHandlers};
use secrecy::SecretString;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let endpoint = "ws://127.0.0.1:8000/connection/websocket".to_string();
    let token = "REPLACE_WITH_TOKEN".to_string();
    let channel = "news".to_string();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let client = Client::builder(endpoint, SecretString::new(token))
            .on_connect(|ctx| async move {
                println!("connected client_id={:?}", ctx.client_id);
            })
            .on_disconnect(|ctx| async move {
                println!("disconnected reason={} reconnect={}", ctx.reason, ctx.reconnect);
            })
            .build()?;
        client.connect().await?;

        let handlers = SubscriptionHandlers::new()
            .on_subscribe(|ctx| async move {
                println!("subscribed channel={}", ctx.channel);
            })
            .on_message(|publication| async move {
                println!("message channel={} data={}", publication.channel, publication.data);
            })
            .on_error(|error| async move {
                println!("subscription error: {error}");
            });
        let subscription = client.subscribe(channel, handlers).await?;

        let ack = subscription
            .publish(&serde_json::json!({"text": "hello from rust"}))
            .await?;
        println!("publish ack={ack}");

        tokio::time::sleep(Duration::from_secs(30)).await;
        client.close().await?;

        Ok::<(), Box<dyn Error>>(())
    })
}
