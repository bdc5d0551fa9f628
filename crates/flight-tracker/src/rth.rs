//! Return-to-home estimation and triggering

use crate::error::TrackerResult;
use crate::weather::{WeatherConditions, WeatherProvider};

use flight_core::{
    bearing, haversine_distance, Broadcaster, CoreError, GeoPosition, RiskEvent, RthCommand,
    SessionId,
};
use flight_db::FlightStore;
use flight_metrics::MetricsCollector;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

/// Battery consumed per meter flown under neutral conditions (percent)
const BASE_CONSUMPTION_PER_METER: f64 = 0.0001;
/// Extra battery reserved on top of the estimate
const SAFETY_MARGIN: f64 = 0.2;
/// Below this battery level RTH is always critical
const CRITICAL_BATTERY_PERCENT: f64 = 15.0;
/// Return speed never assumed below this (m/s)
const MIN_RETURN_SPEED_MPS: f64 = 5.0;

/// How urgently the vehicle should head home
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Low,
    Medium,
    High,
    Critical,
}

impl Urgency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Urgency::Low => "low",
            Urgency::Medium => "medium",
            Urgency::High => "high",
            Urgency::Critical => "critical",
        }
    }
}

impl fmt::Display for Urgency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current vehicle state an estimate is computed from
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RthInput {
    pub latitude: f64,
    pub longitude: f64,
    pub battery_percent: f64,
    #[serde(default)]
    pub speed_mps: f64,
    #[serde(default)]
    pub heading_degrees: Option<f64>,
    #[serde(default)]
    pub altitude_meters: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RthEstimate {
    pub should_return: bool,
    pub urgency: Urgency,
    pub message: String,
    pub distance_to_home_meters: f64,
    pub estimated_time_to_home_seconds: f64,
    pub battery_needed_percent: f64,
    pub current_battery_percent: f64,
    pub battery_margin_percent: f64,
    pub weather_factor: f64,
    pub heading_to_home_degrees: f64,
    pub home: GeoPosition,
    pub weather: WeatherConditions,
}

/// Consumption multiplier from wind along the home bearing and temperature.
///
/// A 20 m/s headwind costs 1.5x, a 20 m/s tailwind saves down to 0.8x.
pub fn weather_factor(weather: &WeatherConditions, heading_to_home: f64) -> f64 {
    let wind_angle = (weather.wind_direction_degrees - heading_to_home).abs();
    let wind_component = wind_angle.to_radians().cos() * weather.wind_speed_mps;

    let mut factor = if wind_component > 0.0 {
        1.0 + (wind_component / 20.0) * 0.5
    } else {
        1.0 + (wind_component / 20.0) * 0.2
    };

    if weather.temperature_celsius < 0.0 {
        factor *= 1.2;
    } else if weather.temperature_celsius > 30.0 {
        factor *= 1.1;
    }

    factor.clamp(0.7, 1.6)
}

fn speed_factor(speed_mps: f64) -> f64 {
    if speed_mps > 0.0 {
        (10.0 / speed_mps).clamp(0.8, 1.5)
    } else {
        1.0
    }
}

/// Urgency and operator message for a battery level and post-return margin
pub fn classify(battery_percent: f64, margin: f64) -> (Urgency, String) {
    if battery_percent < CRITICAL_BATTERY_PERCENT {
        (
            Urgency::Critical,
            format!("CRITICAL: Battery at {battery_percent:.1}%. Immediate RTH required!"),
        )
    } else if margin < 5.0 {
        (
            Urgency::High,
            format!("WARNING: Low battery margin ({margin:.1}%). RTH recommended."),
        )
    } else if margin < 10.0 {
        (
            Urgency::Medium,
            format!("CAUTION: Battery margin low ({margin:.1}%). Consider RTH."),
        )
    } else if margin < 15.0 {
        (
            Urgency::Low,
            format!("Battery sufficient for return ({margin:.1}% margin)."),
        )
    } else {
        (Urgency::Low, format!("Battery healthy ({margin:.1}% margin)."))
    }
}

/// Pure estimate from the current state, the home position and the weather
pub fn assess(input: &RthInput, home: GeoPosition, weather: &WeatherConditions) -> RthEstimate {
    let distance = haversine_distance(input.latitude, input.longitude, home.latitude, home.longitude);
    let heading_to_home = bearing(input.latitude, input.longitude, home.latitude, home.longitude);
    let weather_factor = weather_factor(weather, heading_to_home);

    let altitude_factor = 1.0 + (input.altitude_meters / 1000.0) * 0.1;
    let consumption_per_meter =
        BASE_CONSUMPTION_PER_METER * altitude_factor * speed_factor(input.speed_mps) * weather_factor;
    let battery_needed = distance * consumption_per_meter * (1.0 + SAFETY_MARGIN);

    let return_speed = (input.speed_mps * (1.0 - weather.wind_speed_mps / 30.0)).max(MIN_RETURN_SPEED_MPS);
    let margin = input.battery_percent - battery_needed;
    let (urgency, message) = classify(input.battery_percent, margin);

    RthEstimate {
        should_return: urgency >= Urgency::Medium,
        urgency,
        message,
        distance_to_home_meters: distance,
        estimated_time_to_home_seconds: distance / return_speed,
        battery_needed_percent: battery_needed,
        current_battery_percent: input.battery_percent,
        battery_margin_percent: margin,
        weather_factor,
        heading_to_home_degrees: heading_to_home,
        home,
        weather: *weather,
    }
}

/// RTH calculator bound to storage, weather and the broadcast hub
pub struct RthCalculator {
    store: Arc<dyn FlightStore>,
    weather: Arc<dyn WeatherProvider>,
    broadcaster: Arc<dyn Broadcaster>,
    metrics: Option<Arc<MetricsCollector>>,
}

impl RthCalculator {
    pub fn new(
        store: Arc<dyn FlightStore>,
        weather: Arc<dyn WeatherProvider>,
        broadcaster: Arc<dyn Broadcaster>,
        metrics: Option<Arc<MetricsCollector>>,
    ) -> Self {
        Self {
            store,
            weather,
            broadcaster,
            metrics,
        }
    }

    async fn home_of(&self, session_id: &SessionId) -> TrackerResult<GeoPosition> {
        let session = self
            .store
            .get_session(session_id)
            .await?
            .ok_or_else(|| CoreError::session_not_found(session_id))?;

        session
            .home()
            .ok_or_else(|| CoreError::NoHomePosition(session_id.to_string()).into())
    }

    pub async fn estimate(&self, session_id: &SessionId, input: &RthInput) -> TrackerResult<RthEstimate> {
        let home = self.home_of(session_id).await?;

        let weather = match self.weather.conditions(input.latitude, input.longitude).await {
            Ok(weather) => weather,
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Weather lookup failed, using defaults");
                WeatherConditions::default()
            }
        };

        let estimate = assess(input, home, &weather);
        if let Some(metrics) = &self.metrics {
            metrics.record_rth_estimate(estimate.urgency.as_str());
        }
        Ok(estimate)
    }

    /// Push an RTH command to the flight's observers and record a risk event
    pub async fn trigger_rth(&self, session_id: &SessionId, reason: &str) -> TrackerResult<RthCommand> {
        let home = self.home_of(session_id).await?;

        let command = RthCommand::new(*session_id, home, reason);
        let delivered = self.broadcaster.publish_rth_command(command.clone());

        // Risk events are child rows, so concurrent triggers never overwrite each other
        self.store
            .append_risk_event(&RiskEvent::rth_triggered(*session_id, reason))
            .await?;

        if let Some(metrics) = &self.metrics {
            metrics.record_rth_triggered();
        }

        info!(
            session_id = %session_id,
            reason,
            home_lat = home.latitude,
            home_lon = home.longitude,
            delivered,
            "RTH triggered"
        );
        Ok(command)
    }
}

// ============================================================================
// TESTS
// ============================================================================
