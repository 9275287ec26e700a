use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use central::db::{self, RetryPolicy};
use central::decision;
use central::dispatcher::Dispatcher;
use central::mqtt::{MqttConfig, MqttConnection};
use central::store::SensorStore;

fn hold_on_lights() -> HashSet<String> {
    match std::env::var("HOLD_ON_LIGHTS") {
        Ok(raw) => raw
            .split(',')
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .collect(),
        Err(_) => decision::DEFAULT_HOLD_ON
            .iter()
            .map(|s| s.to_string())
            .collect(),
    }
}

fn retry_cooldown() -> Duration {
    std::env::var("DB_RETRY_COOLDOWN_SECS")
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(db::DEFAULT_RETRY_COOLDOWN)
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let database_url =
        std::env::var("DATABASE_URL").unwrap_or_else(|_| "central.db".to_string());
    let pool = db::init_pool(&database_url);

    // Ingestion never gives up on a flaky store; only the administrative
    // surface gets a fail-fast handle (via SensorStore::with_policy).
    let store = SensorStore::new(
        pool,
        RetryPolicy::RetryForever {
            cooldown: retry_cooldown(),
        },
    );

    let (bus, mut inbound) = match MqttConnection::connect(MqttConfig::from_env()).await {
        Ok(pair) => pair,
        Err(e) => {
            log::error!("MQTT connection failed: {}", e);
            std::process::exit(1);
        }
    };
    let bus = Arc::new(bus);

    let dispatcher = Dispatcher::new(store, bus.clone(), hold_on_lights());
    if let Err(e) = dispatcher.start().await {
        log::error!("Dispatcher startup failed: {}", e);
        std::process::exit(1);
    }

    log::info!("Central control unit running. Press CTRL+C to quit");

    loop {
        tokio::select! {
            Some(msg) = inbound.recv() => dispatcher.handle_message(&msg).await,
            _ = tokio::signal::ctrl_c() => {
                log::info!("Stopped");
                break;
            }
        }
    }

    let _ = bus.disconnect().await;
}
