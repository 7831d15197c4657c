use std::error::Error;
use std::sync::Arc;

use agora_client::{ClientConfig, RequestExecutor, RequestSpec, StaticCredentials};
use secrecy::SecretString;
use serde_json::json;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "debug".into()))
        .init();

    let token = "REPLACE_WITH_ACCESS_TOKEN".to_string();
    let config = ClientConfig::from_json_str(
        r#"{ "apiBaseUrl": "http://localhost:8000/api", "maxAttempts": 4, "baseDelay": 500 }"#,
    )?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let credentials = StaticCredentials::new(SecretString::new(token));
        let executor = RequestExecutor::with_options(Arc::new(credentials), config.executor_options()?)?;

        let created = executor
            .execute(&RequestSpec::post(
                "/debates",
                json!({ "topic": "Static typing prevents more bugs than it causes" }),
            ))
            .await;

        match created {
            Ok(body) => println!("created {body:?}"),
            Err(err) => println!(
                "request failed kind={} status={:?} message={}",
                err.kind(),
                err.status(),
                err.message()
            ),
        }
        Ok::<(), Box<dyn Error>>(())
    })
}
