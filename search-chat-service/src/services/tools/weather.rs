//! Weather tool backed by Open-Meteo geocoding and current conditions.

use super::ToolError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TemperatureUnit {
    #[default]
    Celsius,
    Fahrenheit,
}

impl TemperatureUnit {
    fn as_str(&self) -> &'static str {
        match self {
            TemperatureUnit::Celsius => "celsius",
            TemperatureUnit::Fahrenheit => "fahrenheit",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WeatherArgs {
    pub location: String,
    #[serde(default)]
    pub unit: TemperatureUnit,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WeatherReport {
    pub location: String,
    pub country: Option<String>,
    pub temperature: f64,
    pub feels_like: Option<f64>,
    pub humidity: Option<f64>,
    pub wind_speed: Option<f64>,
    pub conditions: &'static str,
    pub unit: TemperatureUnit,
}

#[derive(Debug, Deserialize)]
struct GeocodingResponse {
    #[serde(default)]
    results: Vec<Place>,
}

#[derive(Debug, Deserialize)]
struct Place {
    name: String,
    latitude: f64,
    longitude: f64,
    #[serde(default)]
    country: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ForecastResponse {
    current: Current,
}

#[derive(Debug, Deserialize)]
struct Current {
    temperature_2m: f64,
    #[serde(default)]
    apparent_temperature: Option<f64>,
    #[serde(default)]
    relative_humidity_2m: Option<f64>,
    #[serde(default)]
    wind_speed_10m: Option<f64>,
    #[serde(default)]
    weather_code: Option<u32>,
}

/// Text for a WMO weather interpretation code.
pub fn describe_weather_code(code: u32) -> &'static str {
    match code {
        0 => "clear sky",
        1 => "mainly clear",
        2 => "partly cloudy",
        3 => "overcast",
        45 | 48 => "fog",
        51 | 53 | 55 => "drizzle",
        56 | 57 => "freezing drizzle",
        61 | 63 | 65 => "rain",
        66 | 67 => "freezing rain",
        71 | 73 | 75 | 77 => "snow",
        80..=82 => "rain showers",
        85 | 86 => "snow showers",
        95 => "thunderstorm",
        96 | 99 => "thunderstorm with hail",
        _ => "unknown",
    }
}

pub struct WeatherClient {
    client: reqwest::Client,
    geocoding_base_url: String,
    forecast_base_url: String,
}

impl WeatherClient {
    pub fn new(
        client: reqwest::Client,
        geocoding_base_url: impl Into<String>,
        forecast_base_url: impl Into<String>,
    ) -> Self {
        Self {
            client,
            geocoding_base_url: geocoding_base_url.into().trim_end_matches('/').to_string(),
            forecast_base_url: forecast_base_url.into().trim_end_matches('/').to_string(),
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: String,
        query: &[(&str, String)],
    ) -> Result<T, ToolError> {
        let response = self
            .client
            .get(url)
            .query(query)
            .send()
            .await
            .map_err(|e| ToolError::Upstream(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ToolError::Upstream(format!("weather service returned HTTP {}", status)));
        }
        response
            .json()
            .await
            .map_err(|e| ToolError::Upstream(e.to_string()))
    }

    pub async fn current(&self, args: &WeatherArgs) -> Result<WeatherReport, ToolError> {
        let location = args.location.trim();
        if location.is_empty() {
            return Err(ToolError::InvalidArguments("location is required".to_string()));
        }

        let geo: GeocodingResponse = self
            .get_json(
                format!("{}/v1/search", self.geocoding_base_url),
                &[
                    ("name", location.to_string()),
                    ("count", "1".to_string()),
                    ("format", "json".to_string()),
                ],
            )
            .await?;
        let place = geo
            .results
            .into_iter()
            .next()
            .ok_or_else(|| ToolError::NotFound(format!("no location named {}", location)))?;

        let forecast: ForecastResponse = self
            .get_json(
                format!("{}/v1/forecast", self.forecast_base_url),
                &[
                    ("latitude", place.latitude.to_string()),
                    ("longitude", place.longitude.to_string()),
                    (
                        "current",
                        "temperature_2m,apparent_temperature,relative_humidity_2m,wind_speed_10m,weather_code"
                            .to_string(),
                    ),
                    ("temperature_unit", args.unit.as_str().to_string()),
                ],
            )
            .await?;

        let current = forecast.current;
        Ok(WeatherReport {
            location: place.name,
            country: place.country,
            temperature: current.temperature_2m,
            feels_like: current.apparent_temperature,
            humidity: current.relative_humidity_2m,
            wind_speed: current.wind_speed_10m,
            conditions: current
                .weather_code
                .map(describe_weather_code)
                .unwrap_or("unknown"),
            unit: args.unit,
        })
    }
}
