//! Virtual Device - a simulated module for bench testing
//!
//! Behaves like the firmware: announces itself with the bootstrap marker,
//! then echoes every command it receives back as telemetry, with a random
//! power draw for lights and switches.
//!
//! Environment variables:
//!   VIRTUAL_CLIENT_ID - client id to impersonate (default "V-LIGHT-1")
//!   VIRTUAL_CATEGORY  - light | switch | door (default "light")
//!   MQTT_HOST / MQTT_PORT / MQTT_USERNAME / MQTT_PASSWORD - broker settings

use std::str::FromStr;

use chrono::Utc;
use rand::Rng;
use serde_json::{json, Value};

use central::messages::{self, ONLINE_MARKER, T_SENSOR_PUBLISH};
use central::models::Category;
use central::mqtt::{MessageBus, MqttConfig, MqttConnection};

fn utc_now() -> String {
    Utc::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Map an inbound command to the state value this device would report.
fn simulate(category: Category, command: &Value) -> Option<Value> {
    match category {
        Category::Light => {
            if let Some(irgb) = command.get("irgb").and_then(Value::as_str) {
                // First component of "I,R,G,B" is the intensity.
                let level: i64 = irgb.split(',').next()?.trim().parse().ok()?;
                Some(json!(level))
            } else {
                match command.get("state")? {
                    Value::Number(n) => Some(json!(n.as_i64()?)),
                    Value::String(s) if s.eq_ignore_ascii_case("on") => Some(json!(3)),
                    Value::String(_) => Some(json!(0)),
                    _ => None,
                }
            }
        }
        Category::Switch => {
            let on = matches!(
                command.get("state"),
                Some(Value::String(s)) if s.eq_ignore_ascii_case("on") || s == "1"
            );
            Some(json!(if on { 1 } else { 0 }))
        }
        Category::Door => {
            let locked = matches!(
                command.get("state"),
                Some(Value::String(s)) if s.eq_ignore_ascii_case("lock")
            );
            Some(json!(if locked { "LOCK" } else { "UNLOCK" }))
        }
        _ => None,
    }
}

fn is_off(data: &Value) -> bool {
    data == &json!(0) || data == &json!("0")
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let client_id =
        std::env::var("VIRTUAL_CLIENT_ID").unwrap_or_else(|_| "V-LIGHT-1".to_string());
    let category = std::env::var("VIRTUAL_CATEGORY")
        .ok()
        .and_then(|c| Category::from_str(&c).ok())
        .unwrap_or(Category::Light);

    let mut config = MqttConfig::from_env();
    config.client_id = format!("virtual-{}", client_id);

    let (bus, mut inbound) = match MqttConnection::connect(config).await {
        Ok(pair) => pair,
        Err(e) => {
            log::error!("MQTT connection failed: {}", e);
            std::process::exit(1);
        }
    };

    bus.subscribe(&messages::device_topic(&client_id))
        .await
        .expect("Failed to subscribe to command topic");

    bus.publish_json(
        T_SENSOR_PUBLISH,
        &json!({
            "type": category.as_str(),
            "time": utc_now(),
            "client_id": client_id,
            "data": ONLINE_MARKER,
        }),
    )
    .await
    .expect("Failed to announce");

    log::info!("Virtual {} {} online", category, client_id);

    while let Some(msg) = inbound.recv().await {
        let command: Value = match serde_json::from_slice(&msg.payload) {
            Ok(v) => v,
            Err(e) => {
                log::warn!("Ignoring malformed command: {}", e);
                continue;
            }
        };
        let Some(data) = simulate(category, &command) else {
            log::warn!("Ignoring command with no usable state: {}", command);
            continue;
        };

        let mut report = json!({
            "type": category.as_str(),
            "time": utc_now(),
            "client_id": client_id,
            "data": data,
        });
        if category == Category::Light {
            let power = if is_off(&report["data"]) {
                0
            } else {
                rand::rng().random_range(2..=40)
            };
            report["power"] = json!(power);
        }

        log::info!("Command {} -> reporting {}", command, report["data"]);
        if let Err(e) = bus.publish_json(T_SENSOR_PUBLISH, &report).await {
            log::error!("Telemetry publish failed: {}", e);
        }
    }
}
