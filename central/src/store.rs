//! Serialized access to the embedded sensor store.
//!
//! Every operation funnels writes through one process-wide lock (the store
//! runs in WAL mode, so readers are not blocked) and runs under the caller's
//! [`RetryPolicy`]: administrative callers see the first failure as a
//! [`StoreError`], ingestion and automation callers sleep the cool-down and
//! retry the same call until the store heals. Uniqueness violations are
//! expected under races and are logged and swallowed, never retried.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use chrono::NaiveDateTime;
use diesel::prelude::*;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel::sqlite::SqliteConnection;
use log::{debug, info, warn};
use uuid::Uuid;

use crate::db::{DbPool, RetryPolicy};
use crate::models::{Category, Forecast, PredictionRow, Reading, Sensor};
use crate::schema::{predictions, sensor_data, sensors};

/// Error surfaced to fail-fast callers when the store is unavailable.
#[derive(Debug, Clone)]
pub enum StoreError {
    Connection(String),
    Query(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Connection(msg) => write!(f, "database connection error: {}", msg),
            StoreError::Query(msg) => write!(f, "database query failed: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {}

/// Handle to the sensor database. Cheap to clone; clones share the pool and
/// the write lock, so every writer in the process serializes on the same
/// mutex regardless of which handle it came through.
#[derive(Clone)]
pub struct SensorStore {
    pool: DbPool,
    policy: RetryPolicy,
    write_lock: Arc<Mutex<()>>,
}

impl SensorStore {
    pub fn new(pool: DbPool, policy: RetryPolicy) -> Self {
        Self {
            pool,
            policy,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Same pool and write lock, different failure behavior. Used to hand a
    /// fail-fast handle to administrative callers.
    pub fn with_policy(&self, policy: RetryPolicy) -> Self {
        Self {
            pool: self.pool.clone(),
            policy,
            write_lock: self.write_lock.clone(),
        }
    }

    fn run<T>(
        &self,
        what: &str,
        write: bool,
        op: impl Fn(&mut SqliteConnection) -> QueryResult<T>,
    ) -> Result<T, StoreError> {
        loop {
            let attempt = match self.pool.get() {
                Err(e) => Err(StoreError::Connection(e.to_string())),
                Ok(mut conn) => {
                    let _guard = write.then(|| {
                        self.write_lock
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                    });
                    conn.transaction(|conn| op(conn))
                        .map_err(|e| StoreError::Query(e.to_string()))
                }
            };

            match attempt {
                Ok(value) => return Ok(value),
                Err(err) => match self.policy.backoff() {
                    None => {
                        warn!("{} failed: {}", what, err);
                        return Err(err);
                    }
                    Some(cooldown) => {
                        warn!("{} failed ({}), retrying in {:?}", what, err, cooldown);
                        thread::sleep(cooldown);
                    }
                },
            }
        }
    }

    fn read<T>(
        &self,
        what: &str,
        op: impl Fn(&mut SqliteConnection) -> QueryResult<T>,
    ) -> Result<T, StoreError> {
        self.run(what, false, op)
    }

    fn write<T>(
        &self,
        what: &str,
        op: impl Fn(&mut SqliteConnection) -> QueryResult<T>,
    ) -> Result<T, StoreError> {
        self.run(what, true, op)
    }

    // --- registry ---

    /// Register a name-less placeholder for a device that announced itself.
    /// A no-op if the client id is already known.
    pub fn add_placeholder(&self, client_id: &str, category: Category) -> Result<(), StoreError> {
        self.insert_sensor(client_id, None, category)
    }

    /// Explicit provisioning: register a device with a name in one step.
    pub fn provision(
        &self,
        client_id: &str,
        name: &str,
        category: Category,
    ) -> Result<(), StoreError> {
        self.insert_sensor(client_id, Some(name), category)
    }

    fn insert_sensor(
        &self,
        client_id: &str,
        name: Option<&str>,
        category: Category,
    ) -> Result<(), StoreError> {
        self.write("register sensor", |conn| {
            let existing: Option<String> = sensors::table
                .filter(sensors::client_id.eq(client_id))
                .select(sensors::id)
                .first(conn)
                .optional()?;
            if let Some(id) = existing {
                info!(
                    "Client id {} already registered (sensor {}), keeping existing row",
                    client_id, id
                );
                return Ok(());
            }

            let row = Sensor {
                id: Uuid::new_v4().to_string(),
                client_id: client_id.to_string(),
                name: name.map(str::to_string),
                category: category.as_str().to_string(),
                last_val: None,
            };
            match diesel::insert_into(sensors::table).values(&row).execute(conn) {
                Ok(_) => {
                    info!("Sensor registered: {} ({}, {})", row.id, client_id, category);
                    Ok(())
                }
                Err(DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, details)) => {
                    // Two registrations raced; the first one won, which is fine.
                    warn!(
                        "Duplicate registration for client id {}: {}",
                        client_id,
                        details.message()
                    );
                    Ok(())
                }
                Err(e) => Err(e),
            }
        })
    }

    /// Give a placeholder its human name. Returns rows affected so callers
    /// can detect an unknown client id.
    pub fn assign(&self, client_id: &str, name: &str) -> Result<usize, StoreError> {
        self.write("assign sensor name", |conn| {
            diesel::update(sensors::table.filter(sensors::client_id.eq(client_id)))
                .set(sensors::name.eq(name))
                .execute(conn)
        })
    }

    /// Repoint a sensor id at replacement hardware. If the new client id
    /// still holds a name-less placeholder (from the replacement's own
    /// online announcement) that placeholder is removed first; history stays
    /// attached to the surviving sensor id. Both statements share one
    /// transaction but callers get no atomicity promise beyond that.
    pub fn replace(&self, sensor_id: &str, new_client_id: &str) -> Result<usize, StoreError> {
        self.write("replace sensor hardware", |conn| {
            let removed = diesel::delete(
                sensors::table
                    .filter(sensors::client_id.eq(new_client_id))
                    .filter(sensors::name.is_null()),
            )
            .execute(conn)?;
            if removed > 0 {
                debug!("Removed placeholder at client id {}", new_client_id);
            }

            match diesel::update(sensors::table.filter(sensors::id.eq(sensor_id)))
                .set(sensors::client_id.eq(new_client_id))
                .execute(conn)
            {
                Ok(n) => Ok(n),
                Err(DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, details)) => {
                    // Destination client id belongs to a named device.
                    warn!(
                        "Cannot repoint sensor {} to {}: {}",
                        sensor_id,
                        new_client_id,
                        details.message()
                    );
                    Ok(0)
                }
                Err(e) => Err(e),
            }
        })
    }

    /// Delete a sensor. Temp, radar and door devices are refused (0 rows).
    pub fn delete(&self, sensor_id: &str) -> Result<usize, StoreError> {
        self.write("delete sensor", |conn| {
            diesel::delete(
                sensors::table
                    .filter(sensors::id.eq(sensor_id))
                    .filter(sensors::category.ne_all(Category::protected_names())),
            )
            .execute(conn)
        })
    }

    /// All devices an operator has already named.
    pub fn named_sensors(&self) -> Result<Vec<Sensor>, StoreError> {
        self.read("load named sensors", |conn| {
            sensors::table
                .filter(sensors::name.is_not_null())
                .order(sensors::name.asc())
                .load(conn)
        })
    }

    /// Devices that have announced themselves but are still unnamed.
    pub fn new_sensors(&self) -> Result<Vec<Sensor>, StoreError> {
        self.read("load new sensors", |conn| {
            sensors::table.filter(sensors::name.is_null()).load(conn)
        })
    }

    pub fn all_sensors(&self) -> Result<Vec<Sensor>, StoreError> {
        self.read("load all sensors", |conn| sensors::table.load(conn))
    }

    /// Every device of one category, placeholders included.
    pub fn sensors_by_category(&self, category: Category) -> Result<Vec<Sensor>, StoreError> {
        self.read("load sensors by category", |conn| {
            sensors::table
                .filter(sensors::category.eq(category.as_str()))
                .order((sensors::name.asc(), sensors::client_id.asc()))
                .load(conn)
        })
    }

    pub fn client_id_by_name(&self, name: &str) -> Result<Option<String>, StoreError> {
        self.read("resolve client id", |conn| {
            sensors::table
                .filter(sensors::name.eq(name))
                .select(sensors::client_id)
                .first(conn)
                .optional()
        })
    }

    pub fn name_by_id(&self, sensor_id: &str) -> Result<Option<String>, StoreError> {
        self.read("resolve sensor name", |conn| {
            sensors::table
                .filter(sensors::id.eq(sensor_id))
                .select(sensors::name)
                .first::<Option<String>>(conn)
                .optional()
                .map(Option::flatten)
        })
    }

    pub fn sensor_id_by_client_id(&self, client_id: &str) -> Result<Option<String>, StoreError> {
        self.read("resolve sensor id", |conn| {
            sensors::table
                .filter(sensors::client_id.eq(client_id))
                .select(sensors::id)
                .first(conn)
                .optional()
        })
    }

    pub fn category_by_client_id(&self, client_id: &str) -> Result<Option<Category>, StoreError> {
        let category: Option<String> = self.read("resolve category", |conn| {
            sensors::table
                .filter(sensors::client_id.eq(client_id))
                .select(sensors::category)
                .first(conn)
                .optional()
        })?;
        Ok(category.and_then(|c| c.parse().ok()))
    }

    // --- readings ---

    /// Record a telemetry reading. The (sensor, timestamp) key is upserted,
    /// so a redelivered or corrected reading overwrites in place, and the
    /// device's last-known value is refreshed in the same transaction.
    /// Readings from unknown client ids are dropped with a warning.
    pub fn insert_reading(
        &self,
        client_id: &str,
        timestamp: NaiveDateTime,
        value: &str,
    ) -> Result<(), StoreError> {
        self.write("insert reading", |conn| {
            let sensor_id: Option<String> = sensors::table
                .filter(sensors::client_id.eq(client_id))
                .select(sensors::id)
                .first(conn)
                .optional()?;
            let Some(sensor_id) = sensor_id else {
                warn!("Dropping reading from unknown client id {}", client_id);
                return Ok(());
            };

            upsert_reading(conn, &sensor_id, timestamp, value)?;
            diesel::update(sensors::table.filter(sensors::id.eq(&sensor_id)))
                .set(sensors::last_val.eq(value))
                .execute(conn)?;
            Ok(())
        })
    }

    pub fn readings_since(
        &self,
        sensor_id: &str,
        since: NaiveDateTime,
    ) -> Result<Vec<Reading>, StoreError> {
        self.read("load readings", |conn| {
            sensor_data::table
                .filter(sensor_data::sensor_id.eq(sensor_id))
                .filter(sensor_data::timestamp.ge(since))
                .order(sensor_data::timestamp.asc())
                .load(conn)
        })
    }

    /// The most recent N distinct timestamps, oldest first.
    pub fn recent_timestamps(&self, limit: i64) -> Result<Vec<NaiveDateTime>, StoreError> {
        let mut timestamps = self.read("load recent timestamps", |conn| {
            sensor_data::table
                .select(sensor_data::timestamp)
                .distinct()
                .order(sensor_data::timestamp.desc())
                .limit(limit)
                .load::<NaiveDateTime>(conn)
        })?;
        timestamps.reverse();
        Ok(timestamps)
    }

    pub fn timestamps_since(&self, since: NaiveDateTime) -> Result<Vec<NaiveDateTime>, StoreError> {
        self.read("load timestamps", |conn| {
            sensor_data::table
                .select(sensor_data::timestamp)
                .distinct()
                .filter(sensor_data::timestamp.ge(since))
                .order(sensor_data::timestamp.asc())
                .load(conn)
        })
    }

    /// (name, value, category) for every named light/temp reading taken at
    /// one timestamp. This is the row shape the training exporter consumes.
    pub fn readings_for_timestamp(
        &self,
        timestamp: NaiveDateTime,
    ) -> Result<Vec<(String, String, String)>, StoreError> {
        self.read("load readings for timestamp", |conn| {
            sensor_data::table
                .inner_join(sensors::table)
                .filter(sensor_data::timestamp.eq(timestamp))
                .filter(sensors::category.eq_any(["light", "temp"]))
                .filter(sensors::name.is_not_null())
                .select((
                    sensors::name.assume_not_null(),
                    sensor_data::sensor_value,
                    sensors::category,
                ))
                .load(conn)
        })
    }

    // --- forecasts ---

    /// Replace the current forecast batch wholesale. Previous predictions
    /// are discarded first, so at most one batch exists at any time. A name
    /// colliding across the light and temperature maps keeps the first row
    /// (warned), never fails the batch.
    pub fn replace_forecast(
        &self,
        timestamp: NaiveDateTime,
        forecast: &Forecast,
    ) -> Result<(), StoreError> {
        self.write("replace forecast", |conn| {
            diesel::delete(predictions::table).execute(conn)?;

            let mut rows = Vec::new();
            for (name, level) in &forecast.lights {
                rows.push(PredictionRow {
                    timestamp,
                    sensor_name: name.clone(),
                    predicted_value: level.to_string(),
                    category: Category::Light.as_str().to_string(),
                });
            }
            for (name, value) in &forecast.temperatures {
                rows.push(PredictionRow {
                    timestamp,
                    sensor_name: name.clone(),
                    predicted_value: value.to_string(),
                    category: Category::Temp.as_str().to_string(),
                });
            }
            for row in &rows {
                match diesel::insert_into(predictions::table)
                    .values(row)
                    .execute(conn)
                {
                    Ok(_) => {}
                    Err(DieselError::DatabaseError(
                        DatabaseErrorKind::UniqueViolation,
                        details,
                    )) => {
                        warn!(
                            "Duplicate prediction for {}: {}",
                            row.sensor_name,
                            details.message()
                        );
                    }
                    Err(e) => return Err(e),
                }
            }
            Ok(())
        })
    }

    pub fn latest_forecast(&self) -> Result<Option<(NaiveDateTime, Forecast)>, StoreError> {
        self.read("load latest forecast", |conn| {
            let latest: Option<NaiveDateTime> = predictions::table
                .select(diesel::dsl::max(predictions::timestamp))
                .first(conn)?;
            let Some(latest) = latest else {
                return Ok(None);
            };

            let rows: Vec<PredictionRow> = predictions::table
                .filter(predictions::timestamp.eq(latest))
                .order((predictions::category.asc(), predictions::sensor_name.asc()))
                .load(conn)?;

            let mut forecast = Forecast::default();
            for row in rows {
                match row.category.as_str() {
                    "light" => {
                        if let Ok(level) = row.predicted_value.parse() {
                            forecast.lights.insert(row.sensor_name, level);
                        }
                    }
                    "temp" => {
                        if let Ok(value) = row.predicted_value.parse() {
                            forecast.temperatures.insert(row.sensor_name, value);
                        }
                    }
                    other => debug!("Skipping prediction with category {}", other),
                }
            }
            Ok(Some((latest, forecast)))
        })
    }

    /// Write the forecast's values into the time series as readings at the
    /// given timestamp, resolving names to sensor ids. Names without a
    /// registered device are skipped.
    pub fn record_forecast_readings(
        &self,
        timestamp: NaiveDateTime,
        forecast: &Forecast,
    ) -> Result<(), StoreError> {
        self.write("record forecast readings", |conn| {
            let named: Vec<(String, String)> = sensors::table
                .filter(sensors::category.eq_any(["light", "temp"]))
                .filter(sensors::name.is_not_null())
                .select((sensors::name.assume_not_null(), sensors::id))
                .load(conn)?;
            let by_name: HashMap<String, String> = named.into_iter().collect();

            let values = forecast
                .lights
                .iter()
                .map(|(name, level)| (name, level.to_string()))
                .chain(
                    forecast
                        .temperatures
                        .iter()
                        .map(|(name, value)| (name, value.to_string())),
                );
            for (name, value) in values {
                let Some(sensor_id) = by_name.get(name) else {
                    debug!("No registered sensor named {}, skipping", name);
                    continue;
                };
                upsert_reading(conn, sensor_id, timestamp, &value)?;
                diesel::update(sensors::table.filter(sensors::id.eq(sensor_id)))
                    .set(sensors::last_val.eq(&value))
                    .execute(conn)?;
            }
            Ok(())
        })
    }

    // --- decision-engine inputs ---

    /// Current occupancy per named radar, ordered by (lowercased) name. The
    /// last-known value is the live presence sample: any non-zero reading
    /// counts as presence.
    pub fn radar_presence(&self) -> Result<Vec<(String, bool)>, StoreError> {
        let rows: Vec<(String, Option<String>)> = self.read("load radar presence", |conn| {
            sensors::table
                .filter(sensors::category.eq(Category::Radar.as_str()))
                .filter(sensors::name.is_not_null())
                .order(sensors::name.asc())
                .select((sensors::name.assume_not_null(), sensors::last_val))
                .load(conn)
        })?;
        Ok(rows
            .into_iter()
            .map(|(name, last_val)| {
                let present = last_val
                    .and_then(|v| v.trim().parse::<f64>().ok())
                    .map(|v| v != 0.0)
                    .unwrap_or(false);
                (name.to_lowercase(), present)
            })
            .collect())
    }

    /// Named lights, lowercased, ordered by name.
    pub fn light_names(&self) -> Result<Vec<String>, StoreError> {
        let names: Vec<String> = self.read("load light names", |conn| {
            sensors::table
                .filter(sensors::category.eq(Category::Light.as_str()))
                .filter(sensors::name.is_not_null())
                .order(sensors::name.asc())
                .select(sensors::name.assume_not_null())
                .load(conn)
        })?;
        Ok(names.into_iter().map(|n| n.to_lowercase()).collect())
    }
}

fn upsert_reading(
    conn: &mut SqliteConnection,
    sensor_id: &str,
    timestamp: NaiveDateTime,
    value: &str,
) -> QueryResult<usize> {
    diesel::insert_into(sensor_data::table)
        .values(&Reading {
            sensor_id: sensor_id.to_string(),
            timestamp,
            sensor_value: value.to_string(),
        })
        .on_conflict((sensor_data::sensor_id, sensor_data::timestamp))
        .do_update()
        .set(sensor_data::sensor_value.eq(value))
        .execute(conn)
}
