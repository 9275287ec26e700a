//! Central Controller Library
//!
//! This library provides the core of the home-automation central unit,
//! including:
//! - The sensor registry and time-series store (SQLite, WAL mode)
//! - The MQTT dispatcher turning telemetry into state and intents into
//!   per-device commands
//! - The presence-override decision engine applied to incoming forecasts

pub mod db;
pub mod decision;
pub mod dispatcher;
pub mod messages;
pub mod models;
pub mod mqtt;
pub mod schema;
pub mod store;
