//! Tool and resource handlers for the weather server

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::Deserialize;
use serde_json::json;
use tracing::debug;
use url::Url;

use mcp_serve::{
    Error, ResourceChangeHandle, ResourceContext, ResourceDescriptor, ResourceListChangeHandle,
    ResourceListContext, Result, ToolContext,
};

use crate::domain::WeatherRepository;

#[derive(Debug, Default, Deserialize)]
pub struct ConvertTemperatureArgs {
    pub temperature: f64,
    pub from_unit: String,
    pub to_unit: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct HumidityIndexArgs {
    pub temperature: f64,
    pub humidity: f64,
}

/// JSON Schema for the convert_temperature tool
pub fn convert_temperature_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {
            "temperature": {"type": "number"},
            "from_unit": {"type": "string", "enum": ["celsius", "fahrenheit"]},
            "to_unit": {"type": "string", "enum": ["celsius", "fahrenheit"]}
        },
        "required": ["temperature", "from_unit", "to_unit"]
    })
}

/// JSON Schema for the calculate_humidity_index tool
pub fn humidity_index_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {
            "temperature": {"type": "number"},
            "humidity": {"type": "number"}
        },
        "required": ["temperature", "humidity"]
    })
}

pub fn convert_temperature(c: &mut ToolContext) -> Result<()> {
    let args: ConvertTemperatureArgs = c.bind()?;

    let result = match (args.from_unit.as_str(), args.to_unit.as_str()) {
        ("celsius", "fahrenheit") => (args.temperature * 9.0 / 5.0) + 32.0,
        ("fahrenheit", "celsius") => (args.temperature - 32.0) * 5.0 / 9.0,
        ("celsius", "celsius") | ("fahrenheit", "fahrenheit") => args.temperature,
        (from, to) => {
            return Err(Error::Handler(format!(
                "unsupported conversion: {from} to {to}"
            )))
        }
    };
    let result = (result * 100.0).round() / 100.0;

    c.text(format!(
        "{:.2} {} = {:.2} {}",
        args.temperature, args.from_unit, result, args.to_unit
    ))
}

pub fn calculate_humidity_index(c: &mut ToolContext) -> Result<()> {
    let args: HumidityIndexArgs = c.bind()?;

    let index =
        0.81 * args.temperature + 0.01 * args.humidity * (0.99 * args.temperature - 14.3) + 46.3;
    let index = (index * 10.0).round() / 10.0;

    let comfort = match index {
        i if i < 55.0 => "Cold",
        i if i < 60.0 => "Slightly cool",
        i if i < 65.0 => "Comfortable",
        i if i < 70.0 => "Pleasant",
        i if i < 75.0 => "Slightly warm",
        i if i < 80.0 => "Warm",
        i if i < 85.0 => "Hot",
        _ => "Very hot",
    };

    c.text(format!(
        "Temperature: {:.1}°C, Humidity: {:.1}%\nComfort Index: {:.1} ({})",
        args.temperature, args.humidity, index, comfort
    ))
}

/// Handler for `weather://forecast/{city}`
pub fn forecast_handler(
    repo: Arc<WeatherRepository>,
) -> impl Fn(&mut ResourceContext) -> Result<()> + Send + Sync {
    move |c: &mut ResourceContext| {
        let city = c.param("city");
        if city.is_empty() {
            return Err(Error::Handler("city is required".to_string()));
        }
        let weather = repo
            .by_city(city)
            .ok_or_else(|| Error::Handler(format!("city '{city}' not found")))?;
        c.json(weather)
    }
}

/// Lists one concrete forecast resource per known city.
pub fn resource_list_handler(
    repo: Arc<WeatherRepository>,
) -> impl Fn(&mut ResourceListContext) -> Result<()> + Send + Sync {
    move |c: &mut ResourceListContext| {
        for (slug, weather) in repo.all() {
            let uri = format!("weather://forecast/{slug}");
            c.set_resource(
                uri.clone(),
                ResourceDescriptor {
                    uri,
                    name: format!("{} Weather Forecast", weather.city),
                    description: Some(format!("Current weather data for {}", weather.city)),
                    mime_type: Some("application/json".to_string()),
                },
            );
        }
        Ok(())
    }
}

/// Periodically announces a forecast change, cycling through the cities.
pub async fn forecast_change_observer(repo: Arc<WeatherRepository>, handle: ResourceChangeHandle) {
    let slugs: Vec<String> = repo.all().map(|(slug, _)| slug.to_string()).collect();
    let cancelled = handle.cancellation();
    let mut ticker = tokio::time::interval(Duration::from_secs(60));
    ticker.tick().await;
    let mut next = 0usize;
    loop {
        tokio::select! {
            _ = cancelled.cancelled() => return,
            _ = ticker.tick() => {}
        }
        if slugs.is_empty() {
            continue;
        }
        let slug = &slugs[next % slugs.len()];
        next += 1;
        if let Ok(uri) = Url::parse(&format!("weather://forecast/{slug}")) {
            debug!(uri = %uri, "publishing forecast change");
            handle.publish(&uri, SystemTime::now());
        }
    }
}

/// Periodically announces a resource-list change.
pub async fn list_change_observer(handle: ResourceListChangeHandle) {
    let cancelled = handle.cancellation();
    let mut ticker = tokio::time::interval(Duration::from_secs(120));
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = cancelled.cancelled() => return,
            _ = ticker.tick() => {}
        }
        debug!("publishing resource list change");
        handle.publish(SystemTime::now());
    }
}
