//! Weather providers consumed by the RTH calculator

use crate::error::{TrackerError, TrackerResult};

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Snapshot of conditions at a location
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WeatherConditions {
    pub wind_speed_mps: f64,
    /// Direction the wind blows from, degrees clockwise from north
    pub wind_direction_degrees: f64,
    pub temperature_celsius: f64,
    pub humidity_percent: f64,
    pub pressure_hpa: f64,
    pub visibility_meters: f64,
}

impl Default for WeatherConditions {
    fn default() -> Self {
        Self {
            wind_speed_mps: 5.0,
            wind_direction_degrees: 180.0,
            temperature_celsius: 20.0,
            humidity_percent: 60.0,
            pressure_hpa: 1013.25,
            visibility_meters: 10_000.0,
        }
    }
}

#[async_trait]
pub trait WeatherProvider: Send + Sync {
    async fn conditions(&self, latitude: f64, longitude: f64) -> TrackerResult<WeatherConditions>;
}

/// Returns the same conditions everywhere
#[derive(Debug, Clone, Default)]
pub struct FixedWeather(pub WeatherConditions);

#[async_trait]
impl WeatherProvider for FixedWeather {
    async fn conditions(&self, _latitude: f64, _longitude: f64) -> TrackerResult<WeatherConditions> {
        Ok(self.0)
    }
}

/// OpenWeatherMap current-conditions client (metric units)
pub struct OpenWeatherClient {
    client: Client,
    base_url: String,
    api_key: String,
}

#[derive(Debug, Deserialize)]
struct OpenWeatherResponse {
    main: OpenWeatherMain,
    #[serde(default)]
    wind: Option<OpenWeatherWind>,
    #[serde(default)]
    visibility: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct OpenWeatherMain {
    temp: f64,
    humidity: f64,
    pressure: f64,
}

#[derive(Debug, Deserialize)]
struct OpenWeatherWind {
    speed: f64,
    #[serde(default)]
    deg: f64,
}

impl OpenWeatherClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> TrackerResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TrackerError::Weather(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.into(),
            api_key: api_key.into(),
        })
    }
}

#[async_trait]
impl WeatherProvider for OpenWeatherClient {
    async fn conditions(&self, latitude: f64, longitude: f64) -> TrackerResult<WeatherConditions> {
        let response = self
            .client
            .get(&self.base_url)
            .query(&[
                ("lat", latitude.to_string()),
                ("lon", longitude.to_string()),
                ("appid", self.api_key.clone()),
                ("units", "metric".to_string()),
            ])
            .send()
            .await
            .map_err(|e| TrackerError::Weather(e.to_string()))?;

        if !response.status().is_success() {
            return Err(TrackerError::Weather(format!(
                "weather provider returned {}",
                response.status()
            )));
        }

        let body: OpenWeatherResponse = response
            .json()
            .await
            .map_err(|e| TrackerError::Weather(e.to_string()))?;

        debug!(latitude, longitude, "Fetched weather conditions");

        let defaults = WeatherConditions::default();
        let (wind_speed_mps, wind_direction_degrees) = body
            .wind
            .map(|w| (w.speed, w.deg))
            .unwrap_or((0.0, defaults.wind_direction_degrees));

        Ok(WeatherConditions {
            wind_speed_mps,
            wind_direction_degrees,
            temperature_celsius: body.main.temp,
            humidity_percent: body.main.humidity,
            pressure_hpa: body.main.pressure,
            visibility_meters: body.visibility.unwrap_or(defaults.visibility_meters),
        })
    }
}
