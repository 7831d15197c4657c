use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use agora_client::{
    Channel, ConnectionEvent, ConnectionRegistry, EventHandlers, StaticCredentials, StreamClient,
};
use secrecy::SecretString;
use serde_json::json;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let token = "REPLACE_WITH_ACCESS_TOKEN".to_string();
    let debate_id = "42";

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let credentials = StaticCredentials::new(SecretString::new(token));
        let client = StreamClient::new(Arc::new(credentials)).with_endpoint("ws://localhost:8000");
        let registry = ConnectionRegistry::new(client);

        let handlers = EventHandlers::new()
            .on(Channel::Connected, |message| {
                println!("joined debate payload={}", message.payload());
            })
            .on(Channel::Speech, |message| {
                let speaker = message.field("speaker").and_then(|value| value.as_str());
                let content = message.field("content").and_then(|value| value.as_str());
                println!(
                    "speech speaker={} content={}",
                    speaker.unwrap_or("?"),
                    content.unwrap_or("")
                );
            })
            .on(Channel::Score, |message| {
                println!("score {}", message.payload());
            })
            .on_lifecycle(|event| match event {
                ConnectionEvent::ReconnectScheduled { attempt, delay } => {
                    println!("reconnecting attempt={attempt} delay_ms={}", delay.as_millis());
                }
                other => match other.error() {
                    Some(error) => println!("stream failed kind={} error={error}", error.kind()),
                    None => println!("lifecycle {other:?}"),
                },
            });

        let connection = registry.subscribe(debate_id, handlers)?;
        connection.send(&json!({ "type": "join", "role": "audience" }))?;

        tokio::time::sleep(Duration::from_secs(60)).await;
        registry.disconnect_all();
        Ok::<(), Box<dyn Error>>(())
    })
}
