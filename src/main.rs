//! guarded-memcached: command-line front end for the cache client
//!
//! Runs one operation against a memcached server and prints the result as
//! JSON:
//! - `get <key>`
//! - `set <key> <json> [--ttl <secs>]`
//! - `delete <key>`
//! - `expire <key> <ttl>`
//!
//! Configuration via CLI arguments or TOML file.

use guarded_memcached::config::{Config, Operation};
use guarded_memcached::{CacheClient, EventKind};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        server = %config.client.address(),
        cache = %config.client.name,
        timeout_ms = config.client.timeout().as_millis() as u64,
        "Starting guarded-memcached"
    );

    let connect_timeout = config.client.connect_timeout();
    let client = CacheClient::new(config.client);
    client.on(EventKind::Reconnecting, |event, server| {
        warn!(server, ?event, "Server unavailable, retrying");
    });

    client.wait_ready(connect_timeout).await?;
    let result = run(&client, config.operation).await;
    client.quit();

    println!("{}", result?);
    Ok(())
}

/// Run one operation and render its outcome as JSON
async fn run(client: &CacheClient, operation: Operation) -> Result<String, Box<dyn std::error::Error>> {
    let output = match operation {
        Operation::Get { key } => {
            let value: Option<serde_json::Value> = client.get(&key).await?;
            value.unwrap_or(serde_json::Value::Null)
        }
        Operation::Set { key, value, ttl } => {
            let value: serde_json::Value = serde_json::from_str(&value)?;
            client.set_with_ttl(&key, &value, ttl).await?;
            serde_json::json!({ "stored": true })
        }
        Operation::Delete { key } => {
            client.delete(&key).await?;
            serde_json::json!({ "deleted": true })
        }
        Operation::Expire { key, ttl } => {
            let existed = client.expire(&key, ttl).await?;
            serde_json::json!({ "found": existed })
        }
    };
    Ok(serde_json::to_string_pretty(&output)?)
}
