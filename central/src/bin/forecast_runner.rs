//! Forecast Runner - periodic republish of the stored forecast
//!
//! Runs as a daemon: at startup and every 15 minutes it loads the latest
//! forecast batch from the store and publishes it on the predictions topic,
//! where the central dispatcher overlays live presence and fans the result
//! out to hardware.
//!
//! Environment variables:
//!   DATABASE_URL - SQLite database path (default central.db)
//!   MQTT_HOST / MQTT_PORT / MQTT_USERNAME / MQTT_PASSWORD - broker settings

use std::sync::Arc;

use tokio_cron_scheduler::{Job, JobScheduler};

use central::db::{self, RetryPolicy};
use central::messages::T_PREDICTIONS;
use central::mqtt::{MqttConfig, MqttConnection};
use central::store::SensorStore;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let database_url =
        std::env::var("DATABASE_URL").unwrap_or_else(|_| "central.db".to_string());
    let pool = db::init_pool(&database_url);
    // Automation role: wait out a broken store rather than failing.
    let store = SensorStore::new(pool, RetryPolicy::ingest());

    let (bus, _inbound) = match MqttConnection::connect(MqttConfig::from_env()).await {
        Ok(pair) => pair,
        Err(e) => {
            log::error!("MQTT connection failed: {}", e);
            std::process::exit(1);
        }
    };
    let bus = Arc::new(bus);

    log::info!("Starting forecast scheduler...");

    // Publish once at startup so a restart does not wait for the next slot.
    publish_latest(store.clone(), bus.clone()).await;

    let sched = JobScheduler::new().await.expect("Failed to create scheduler");

    // Cron: "0 */15 * * * *" = second 0, every 15th minute
    let store_job = store.clone();
    let bus_job = bus.clone();
    let job = Job::new_async("0 */15 * * * *", move |_uuid, _l| {
        let store = store_job.clone();
        let bus = bus_job.clone();
        Box::pin(async move {
            log::info!("Scheduled forecast publish triggered");
            publish_latest(store, bus).await;
        })
    })
    .expect("Failed to create forecast job");
    sched.add(job).await.expect("Failed to add forecast job");

    sched.start().await.expect("Failed to start scheduler");

    log::info!("Forecast scheduler running: publish every 15 minutes");

    tokio::signal::ctrl_c().await.ok();
    log::info!("Stopped");
}

async fn publish_latest(store: SensorStore, bus: Arc<MqttConnection>) {
    match store.latest_forecast() {
        Ok(Some((when, forecast))) => {
            log::info!(
                "Publishing forecast from {} ({} lights, {} temperatures)",
                when,
                forecast.lights.len(),
                forecast.temperatures.len()
            );
            if let Err(e) = bus.publish_json(T_PREDICTIONS, &forecast).await {
                log::error!("Forecast publish failed: {}", e);
            }
        }
        Ok(None) => log::info!("No forecast stored yet, nothing to publish"),
        Err(e) => log::error!("Could not load forecast: {}", e),
    }
}
