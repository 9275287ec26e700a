use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::NaiveDateTime;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

/// A registered hardware endpoint. `name` is NULL until an operator assigns
/// one; such rows are "new" and show up in the provisioning UI.
#[derive(Queryable, Selectable, Insertable, Serialize, Deserialize, Debug, Clone)]
#[diesel(table_name = crate::schema::sensors)]
pub struct Sensor {
    pub id: String,
    pub client_id: String,
    pub name: Option<String>,
    pub category: String,
    pub last_val: Option<String>,
}

impl Sensor {
    pub fn category(&self) -> Option<Category> {
        Category::from_str(&self.category).ok()
    }
}

#[derive(Queryable, Selectable, Insertable, Serialize, Deserialize, Debug, Clone)]
#[diesel(table_name = crate::schema::sensor_data)]
pub struct Reading {
    pub sensor_id: String,
    pub timestamp: NaiveDateTime,
    pub sensor_value: String,
}

#[derive(Queryable, Selectable, Insertable, Serialize, Deserialize, Debug, Clone)]
#[diesel(table_name = crate::schema::predictions)]
pub struct PredictionRow {
    pub timestamp: NaiveDateTime,
    pub sensor_name: String,
    pub predicted_value: String,
    pub category: String,
}

/// Device categories on the wire and in the `sensors.category` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Light,
    Switch,
    Door,
    Temp,
    Radar,
}

impl Category {
    pub const ALL: [Category; 5] = [
        Category::Light,
        Category::Switch,
        Category::Door,
        Category::Temp,
        Category::Radar,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Light => "light",
            Category::Switch => "switch",
            Category::Door => "door",
            Category::Temp => "temp",
            Category::Radar => "radar",
        }
    }

    /// Categories that must never be deleted from the registry.
    pub fn is_protected(&self) -> bool {
        matches!(self, Category::Temp | Category::Radar | Category::Door)
    }

    /// Column values of the protected categories, for registry filters.
    pub fn protected_names() -> Vec<&'static str> {
        Self::ALL
            .iter()
            .filter(|c| c.is_protected())
            .map(Category::as_str)
            .collect()
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "light" => Ok(Category::Light),
            "switch" => Ok(Category::Switch),
            "door" => Ok(Category::Door),
            "temp" => Ok(Category::Temp),
            "radar" => Ok(Category::Radar),
            other => Err(format!("unknown category: {}", other)),
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The forecasting collaborator's output: desired light levels (0 = off,
/// 1-3 = brightness) and temperature setpoints, keyed by device name.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Forecast {
    pub lights: BTreeMap<String, i64>,
    pub temperatures: BTreeMap<String, f64>,
}

impl Forecast {
    pub fn is_empty(&self) -> bool {
        self.lights.is_empty() && self.temperatures.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_round_trip() {
        for cat in [
            Category::Light,
            Category::Switch,
            Category::Door,
            Category::Temp,
            Category::Radar,
        ] {
            assert_eq!(Category::from_str(cat.as_str()), Ok(cat));
        }
        assert!(Category::from_str("toaster").is_err());
    }

    #[test]
    fn test_protected_categories() {
        assert!(Category::Temp.is_protected());
        assert!(Category::Radar.is_protected());
        assert!(Category::Door.is_protected());
        assert!(!Category::Light.is_protected());
        assert!(!Category::Switch.is_protected());
        assert_eq!(Category::protected_names(), vec!["door", "temp", "radar"]);
    }

    #[test]
    fn test_forecast_deserializes_collaborator_payload() {
        let json = r#"{"lights":{"l1":2,"l2":0},"temperatures":{"t1":21.5}}"#;
        let forecast: Forecast = serde_json::from_str(json).unwrap();
        assert_eq!(forecast.lights["l1"], 2);
        assert_eq!(forecast.temperatures["t1"], 21.5);
        assert!(!forecast.is_empty());
    }
}
