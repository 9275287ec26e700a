//! The message dispatcher: telemetry in, commands out.
//!
//! Runs off the connection's inbound channel, one message at a time. Decode
//! failures are logged and the message dropped; the loop itself never stops
//! for a bad payload.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Local;
use log::{debug, error, info, warn};

use crate::decision;
use crate::messages::{
    self, Command, ControlIntent, ControlTarget, TelemetryEvent, T_PREDICTIONS,
    T_SENSOR_MAIN_CTRL, T_SENSOR_PUBLISH,
};
use crate::models::{Category, Forecast};
use crate::mqtt::{MessageBus, MqttError, MqttMessage};
use crate::store::SensorStore;

pub struct Dispatcher {
    store: SensorStore,
    bus: Arc<dyn MessageBus>,
    /// Last reported instantaneous power draw per light, keyed by client id.
    /// Owned here and handed out by accessor; the administrative surface
    /// reads it through [`Dispatcher::light_power`].
    light_power: Mutex<HashMap<String, f64>>,
    /// Lights whose predicted level absence must never force off.
    hold_on: HashSet<String>,
}

impl Dispatcher {
    pub fn new(store: SensorStore, bus: Arc<dyn MessageBus>, hold_on: HashSet<String>) -> Self {
        Self {
            store,
            bus,
            light_power: Mutex::new(HashMap::new()),
            hold_on,
        }
    }

    /// Subscribe to the inbound topics and establish a known baseline:
    /// every light and switch is told "off" and the power map starts at
    /// zero for every known light.
    pub async fn start(&self) -> Result<(), MqttError> {
        self.bus.subscribe(T_SENSOR_PUBLISH).await?;
        self.bus.subscribe(T_SENSOR_MAIN_CTRL).await?;
        self.bus.subscribe(T_PREDICTIONS).await?;
        self.reset_baseline().await;
        Ok(())
    }

    async fn reset_baseline(&self) {
        let sensors = match self.store.all_sensors() {
            Ok(sensors) => sensors,
            Err(e) => {
                error!("Could not walk registry for baseline: {}", e);
                return;
            }
        };

        let mut sent = 0;
        for sensor in sensors {
            let Some(category) = sensor.category() else {
                warn!(
                    "Sensor {} has unknown category {:?}, skipping baseline",
                    sensor.id, sensor.category
                );
                continue;
            };
            if category == Category::Light {
                self.lock_power().insert(sensor.client_id.clone(), 0.0);
            }
            if let Some(command) = Command::off(category) {
                self.send_command(&sensor.client_id, &command).await;
                sent += 1;
            }
        }
        info!("Baseline established: {} off commands sent", sent);
    }

    /// Route one inbound bus message.
    pub async fn handle_message(&self, msg: &MqttMessage) {
        match msg.topic.as_str() {
            T_SENSOR_PUBLISH => self.handle_telemetry(&msg.payload).await,
            T_SENSOR_MAIN_CTRL => self.handle_control(&msg.payload).await,
            T_PREDICTIONS => self.handle_forecast(&msg.payload).await,
            other => debug!("Unhandled topic: {}", other),
        }
    }

    async fn handle_telemetry(&self, payload: &[u8]) {
        let event = match messages::decode_telemetry(payload) {
            Ok(event) => event,
            Err(e) => {
                warn!("Dropping telemetry: {}", e);
                return;
            }
        };

        match event {
            TelemetryEvent::Online {
                client_id,
                category,
            } => {
                if let Err(e) = self.store.add_placeholder(&client_id, category) {
                    error!("Could not register {}: {}", client_id, e);
                }
            }
            TelemetryEvent::Reading {
                client_id,
                category,
                timestamp,
                value,
                power,
            } => {
                if category == Category::Light {
                    self.lock_power()
                        .insert(client_id.clone(), power.unwrap_or(0.0));
                }
                if let Err(e) = self.store.insert_reading(&client_id, timestamp, &value) {
                    error!("Could not store reading from {}: {}", client_id, e);
                }
            }
        }
    }

    async fn handle_control(&self, payload: &[u8]) {
        let intent = match messages::decode_control(payload) {
            Ok(intent) => intent,
            Err(e) => {
                warn!("Dropping control intent: {}", e);
                return;
            }
        };

        match intent.target.clone() {
            ControlTarget::Single(name) => self.control_single(&name, &intent).await,
            ControlTarget::All(category) => self.control_all(category, &intent).await,
        }
    }

    async fn control_single(&self, name: &str, intent: &ControlIntent) {
        let client_id = match self.store.client_id_by_name(name) {
            Ok(Some(client_id)) => client_id,
            Ok(None) => {
                debug!("No device named {}, ignoring command", name);
                return;
            }
            Err(e) => {
                error!("Could not resolve {}: {}", name, e);
                return;
            }
        };
        let category = match self.store.category_by_client_id(&client_id) {
            Ok(Some(category)) => category,
            Ok(None) => {
                debug!("Unknown category for {}, ignoring command", client_id);
                return;
            }
            Err(e) => {
                error!("Could not resolve category for {}: {}", client_id, e);
                return;
            }
        };

        let Some(command) = messages::shape_command(category, intent) else {
            debug!("Intent carries nothing for {} ({}), ignoring", name, category);
            return;
        };
        info!("Command: set {} ({}) to {:?}", name, client_id, command);
        self.send_command(&client_id, &command).await;
    }

    async fn control_all(&self, category: Category, intent: &ControlIntent) {
        let sensors = match self.store.sensors_by_category(category) {
            Ok(sensors) => sensors,
            Err(e) => {
                error!("Could not enumerate {} devices: {}", category, e);
                return;
            }
        };
        let Some(command) = messages::shape_command(category, intent) else {
            debug!("Intent carries nothing for ALL-{}, ignoring", category);
            return;
        };

        info!(
            "Batch command: set {} {} devices to {:?}",
            sensors.len(),
            category,
            command
        );
        for sensor in sensors {
            self.send_command(&sensor.client_id, &command).await;
        }
    }

    /// A raw forecast arrived from the forecasting collaborator: persist it,
    /// overlay live presence, then fan the adjusted states out to hardware.
    async fn handle_forecast(&self, payload: &[u8]) {
        let forecast: Forecast = match serde_json::from_slice(payload) {
            Ok(forecast) => forecast,
            Err(e) => {
                warn!("Dropping forecast: JSON decode failed: {}", e);
                return;
            }
        };
        if forecast.is_empty() {
            debug!("Empty forecast, nothing to do");
            return;
        }

        let now = Local::now().naive_local();
        if let Err(e) = self.store.replace_forecast(now, &forecast) {
            error!("Could not store forecast: {}", e);
        }
        if let Err(e) = self.store.record_forecast_readings(now, &forecast) {
            error!("Could not record forecast readings: {}", e);
        }

        let adjusted = match (self.store.light_names(), self.store.radar_presence()) {
            (Ok(lights), Ok(radar)) => {
                let presence = decision::presence_by_light(&lights, &radar);
                decision::adjust(&forecast, &presence, &self.hold_on)
            }
            (Err(e), _) | (_, Err(e)) => {
                warn!("No presence data ({}), dispatching raw forecast", e);
                forecast
            }
        };

        for (name, level) in &adjusted.lights {
            self.dispatch_to_named(name, Command::Level { state: *level }).await;
        }
        for (name, value) in &adjusted.temperatures {
            self.dispatch_to_named(
                name,
                Command::State {
                    state: value.to_string(),
                },
            )
            .await;
        }
    }

    async fn dispatch_to_named(&self, name: &str, command: Command) {
        match self.store.client_id_by_name(name) {
            Ok(Some(client_id)) => self.send_command(&client_id, &command).await,
            Ok(None) => debug!("Forecast names unknown device {}, skipping", name),
            Err(e) => error!("Could not resolve {}: {}", name, e),
        }
    }

    async fn send_command(&self, client_id: &str, command: &Command) {
        let topic = messages::device_topic(client_id);
        let payload = match serde_json::to_vec(command) {
            Ok(payload) => payload,
            Err(e) => {
                error!("Could not encode command for {}: {}", client_id, e);
                return;
            }
        };
        if let Err(e) = self.bus.publish(&topic, payload).await {
            error!("Publish to {} failed: {}", topic, e);
        }
    }

    /// Last reported power draw for one light; 0.0 when never reported.
    pub fn light_power(&self, client_id: &str) -> f64 {
        self.lock_power().get(client_id).copied().unwrap_or(0.0)
    }

    /// Snapshot of the whole power map for the administrative surface.
    pub fn light_power_snapshot(&self) -> HashMap<String, f64> {
        self.lock_power().clone()
    }

    fn lock_power(&self) -> std::sync::MutexGuard<'_, HashMap<String, f64>> {
        self.light_power
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{RetryPolicy, MIGRATIONS};
    use async_trait::async_trait;
    use diesel::r2d2::{self, ConnectionManager};
    use diesel::sqlite::SqliteConnection;
    use diesel_migrations::MigrationHarness;
    use serde_json::{json, Value};

    struct RecordingBus {
        published: Mutex<Vec<(String, Value)>>,
        subscribed: Mutex<Vec<String>>,
    }

    impl RecordingBus {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                published: Mutex::new(Vec::new()),
                subscribed: Mutex::new(Vec::new()),
            })
        }

        fn published(&self) -> Vec<(String, Value)> {
            self.published.lock().unwrap().clone()
        }

        fn clear(&self) {
            self.published.lock().unwrap().clear();
        }
    }

    #[async_trait]
    impl MessageBus for RecordingBus {
        async fn subscribe(&self, topic: &str) -> Result<(), MqttError> {
            self.subscribed.lock().unwrap().push(topic.to_string());
            Ok(())
        }

        async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), MqttError> {
            let value = serde_json::from_slice(&payload).unwrap();
            self.published.lock().unwrap().push((topic.to_string(), value));
            Ok(())
        }
    }

    fn memory_store() -> SensorStore {
        let manager = ConnectionManager::<SqliteConnection>::new(":memory:");
        let pool = r2d2::Pool::builder().max_size(1).build(manager).unwrap();
        pool.get().unwrap().run_pending_migrations(MIGRATIONS).unwrap();
        SensorStore::new(pool, RetryPolicy::FailFast)
    }

    fn dispatcher(store: SensorStore, bus: Arc<RecordingBus>) -> Dispatcher {
        let hold_on = decision::DEFAULT_HOLD_ON.iter().map(|s| s.to_string()).collect();
        Dispatcher::new(store, bus, hold_on)
    }

    fn telemetry_msg(payload: Value) -> MqttMessage {
        MqttMessage {
            topic: T_SENSOR_PUBLISH.to_string(),
            payload: payload.to_string().into_bytes(),
        }
    }

    fn control_msg(payload: Value) -> MqttMessage {
        MqttMessage {
            topic: T_SENSOR_MAIN_CTRL.to_string(),
            payload: payload.to_string().into_bytes(),
        }
    }

    #[tokio::test]
    async fn test_start_subscribes_and_publishes_baseline_off() {
        let store = memory_store();
        store.provision("L1", "l1", Category::Light).unwrap();
        store.provision("L2", "l2", Category::Light).unwrap();
        store.provision("SW1", "sw1", Category::Switch).unwrap();
        store.provision("D1", "d1", Category::Door).unwrap();

        let bus = RecordingBus::new();
        let dispatcher = dispatcher(store, bus.clone());
        dispatcher.start().await.unwrap();

        let subscribed = bus.subscribed.lock().unwrap().clone();
        assert_eq!(
            subscribed,
            vec![T_SENSOR_PUBLISH, T_SENSOR_MAIN_CTRL, T_PREDICTIONS]
        );

        // Lights get level 0, the switch gets "off", the door gets nothing.
        let mut published = bus.published();
        published.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            published,
            vec![
                ("sensor/update/L1".to_string(), json!({"state": 0})),
                ("sensor/update/L2".to_string(), json!({"state": 0})),
                ("sensor/update/SW1".to_string(), json!({"state": "off"})),
            ]
        );

        assert_eq!(dispatcher.light_power("L1"), 0.0);
        assert_eq!(dispatcher.light_power_snapshot().len(), 2);
    }

    #[tokio::test]
    async fn test_online_marker_registers_placeholder_once() {
        let store = memory_store();
        let bus = RecordingBus::new();
        let dispatcher = dispatcher(store.clone(), bus);

        let msg = telemetry_msg(json!({
            "type": "radar",
            "time": "2026-08-30 10:00:00",
            "client_id": "R1",
            "data": "imOnline"
        }));
        dispatcher.handle_message(&msg).await;
        dispatcher.handle_message(&msg).await;

        let new = store.new_sensors().unwrap();
        assert_eq!(new.len(), 1);
        assert_eq!(new[0].client_id, "R1");
        assert_eq!(new[0].category, "radar");
    }

    #[tokio::test]
    async fn test_light_telemetry_updates_reading_and_power_map() {
        let store = memory_store();
        store.provision("L1", "l1", Category::Light).unwrap();
        let bus = RecordingBus::new();
        let dispatcher = dispatcher(store.clone(), bus);

        dispatcher
            .handle_message(&telemetry_msg(json!({
                "type": "light",
                "time": "2026-08-30 10:00:00",
                "client_id": "L1",
                "data": 3,
                "power": 12
            })))
            .await;
        dispatcher
            .handle_message(&telemetry_msg(json!({
                "type": "light",
                "time": "2026-08-30 10:05:00",
                "client_id": "L1",
                "data": 0,
                "power": 0
            })))
            .await;

        let named = store.named_sensors().unwrap();
        assert_eq!(named[0].last_val.as_deref(), Some("0"));
        assert_eq!(dispatcher.light_power("L1"), 0.0);
    }

    #[tokio::test]
    async fn test_door_telemetry_stores_normalized_state() {
        let store = memory_store();
        store.provision("D1", "front", Category::Door).unwrap();
        let bus = RecordingBus::new();
        let dispatcher = dispatcher(store.clone(), bus);

        dispatcher
            .handle_message(&telemetry_msg(json!({
                "type": "door",
                "time": "2026-08-30 10:00:00",
                "client_id": "D1",
                "data": "LOCK"
            })))
            .await;

        let named = store.named_sensors().unwrap();
        assert_eq!(named[0].last_val.as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn test_control_single_door() {
        let store = memory_store();
        store.provision("D1", "front", Category::Door).unwrap();
        let bus = RecordingBus::new();
        let dispatcher = dispatcher(store, bus.clone());

        dispatcher
            .handle_message(&control_msg(json!({"name": "front", "state": "lock"})))
            .await;

        assert_eq!(
            bus.published(),
            vec![("sensor/update/D1".to_string(), json!({"state": "lock"}))]
        );
    }

    #[tokio::test]
    async fn test_control_light_irgb_wins_over_state() {
        let store = memory_store();
        store.provision("L1", "l1", Category::Light).unwrap();
        let bus = RecordingBus::new();
        let dispatcher = dispatcher(store, bus.clone());

        dispatcher
            .handle_message(&control_msg(
                json!({"name": "l1", "state": "on", "irgb": "2,255,0,0"}),
            ))
            .await;

        assert_eq!(
            bus.published(),
            vec![(
                "sensor/update/L1".to_string(),
                json!({"irgb": "2,255,0,0"})
            )]
        );
    }

    #[tokio::test]
    async fn test_all_light_fans_out_one_publish_per_device() {
        let store = memory_store();
        store.provision("L1", "l1", Category::Light).unwrap();
        store.provision("L2", "l2", Category::Light).unwrap();
        store.provision("L3", "l3", Category::Light).unwrap();
        store.provision("SW1", "sw1", Category::Switch).unwrap();
        let bus = RecordingBus::new();
        let dispatcher = dispatcher(store, bus.clone());

        dispatcher
            .handle_message(&control_msg(json!({"name": "ALL-LIGHT", "state": "off"})))
            .await;

        let mut published = bus.published();
        published.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            published,
            vec![
                ("sensor/update/L1".to_string(), json!({"state": 0})),
                ("sensor/update/L2".to_string(), json!({"state": 0})),
                ("sensor/update/L3".to_string(), json!({"state": 0})),
            ]
        );
    }

    #[tokio::test]
    async fn test_all_light_reaches_unnamed_placeholders() {
        let store = memory_store();
        store.provision("L1", "l1", Category::Light).unwrap();
        // Announced but not yet named; a batch command still reaches it.
        store.add_placeholder("L2", Category::Light).unwrap();
        let bus = RecordingBus::new();
        let dispatcher = dispatcher(store, bus.clone());

        dispatcher
            .handle_message(&control_msg(json!({"name": "ALL-LIGHT", "state": "on"})))
            .await;

        let mut published = bus.published();
        published.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            published,
            vec![
                ("sensor/update/L1".to_string(), json!({"state": 1})),
                ("sensor/update/L2".to_string(), json!({"state": 1})),
            ]
        );
    }

    #[tokio::test]
    async fn test_unknown_target_and_malformed_payloads_are_ignored() {
        let store = memory_store();
        let bus = RecordingBus::new();
        let dispatcher = dispatcher(store, bus.clone());

        dispatcher
            .handle_message(&control_msg(json!({"name": "nobody", "state": "on"})))
            .await;
        dispatcher
            .handle_message(&MqttMessage {
                topic: T_SENSOR_MAIN_CTRL.to_string(),
                payload: b"not json".to_vec(),
            })
            .await;
        dispatcher
            .handle_message(&MqttMessage {
                topic: T_SENSOR_PUBLISH.to_string(),
                payload: b"{\"partial\":".to_vec(),
            })
            .await;

        assert!(bus.published().is_empty());
    }

    #[tokio::test]
    async fn test_forecast_is_adjusted_by_presence_and_dispatched() {
        let store = memory_store();
        store.provision("L1", "l1", Category::Light).unwrap();
        store.provision("R1", "r1", Category::Radar).unwrap();
        // Room occupied.
        store
            .insert_reading("R1", chrono::Local::now().naive_local(), "1")
            .unwrap();

        let bus = RecordingBus::new();
        let dispatcher = dispatcher(store.clone(), bus.clone());
        bus.clear();

        let msg = MqttMessage {
            topic: T_PREDICTIONS.to_string(),
            payload: json!({"lights": {"l1": 0}, "temperatures": {}})
                .to_string()
                .into_bytes(),
        };
        dispatcher.handle_message(&msg).await;

        // Model said off, radar says occupied: level forced to 2.
        assert_eq!(
            bus.published(),
            vec![("sensor/update/L1".to_string(), json!({"state": 2}))]
        );

        // Batch persisted as the single current forecast.
        let (_, stored) = store.latest_forecast().unwrap().unwrap();
        assert_eq!(stored.lights["l1"], 0);
    }

    #[tokio::test]
    async fn test_forecast_absence_turns_light_off_but_not_hold_on() {
        let store = memory_store();
        store.provision("L5", "l5", Category::Light).unwrap();
        store.provision("L9", "l9", Category::Light).unwrap();
        store.provision("R1", "r1", Category::Radar).unwrap();
        store.provision("R2", "r2", Category::Radar).unwrap();
        let now = chrono::Local::now().naive_local();
        store.insert_reading("R1", now, "0").unwrap();
        store.insert_reading("R2", now, "0").unwrap();

        let bus = RecordingBus::new();
        let dispatcher = dispatcher(store, bus.clone());

        let msg = MqttMessage {
            topic: T_PREDICTIONS.to_string(),
            payload: json!({"lights": {"l5": 2, "l9": 2}, "temperatures": {}})
                .to_string()
                .into_bytes(),
        };
        dispatcher.handle_message(&msg).await;

        let mut published = bus.published();
        published.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            published,
            vec![
                // l5 is a hold-on light: absence keeps the prediction.
                ("sensor/update/L5".to_string(), json!({"state": 2})),
                ("sensor/update/L9".to_string(), json!({"state": 0})),
            ]
        );
    }
}
