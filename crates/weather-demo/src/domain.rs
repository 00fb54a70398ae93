//! Weather domain model and in-memory repository

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Weather data for one city
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CityWeather {
    pub city: String,
    /// Unix timestamp of the last update
    pub updated_at: u64,
    /// Celsius
    pub temperature: f64,
    /// Relative humidity (%)
    pub humidity: f64,
    /// sunny, cloudy, rainy, ...
    pub condition: String,
    /// Wind speed (m/s)
    pub wind_speed: f64,
}

/// In-memory weather repository seeded with a few cities.
pub struct WeatherRepository {
    cities: BTreeMap<String, CityWeather>,
}

impl WeatherRepository {
    pub fn new() -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let mut cities = BTreeMap::new();
        for (key, city, temperature, humidity, condition, wind_speed) in [
            ("tokyo", "Tokyo", 24.0, 65.0, "sunny", 3.2),
            ("new_york", "New York", 18.0, 70.0, "cloudy", 5.1),
            ("london", "London", 12.0, 75.0, "rainy", 4.0),
        ] {
            cities.insert(
                key.to_string(),
                CityWeather {
                    city: city.to_string(),
                    updated_at: now,
                    temperature,
                    humidity,
                    condition: condition.to_string(),
                    wind_speed,
                },
            );
        }
        Self { cities }
    }

    pub fn by_city(&self, city: &str) -> Option<&CityWeather> {
        self.cities.get(city)
    }

    /// Every known city keyed by its URI slug.
    pub fn all(&self) -> impl Iterator<Item = (&str, &CityWeather)> {
        self.cities.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl Default for WeatherRepository {
    fn default() -> Self {
        Self::new()
    }
}
