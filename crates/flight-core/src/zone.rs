//! Danger zones and the violation records opened against them

use crate::error::{CoreError, CoreResult};
use crate::geo::{Coordinate, Polygon};
use crate::{OperatorId, SessionId, Severity};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Unique identifier for a danger zone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ZoneId(pub Uuid);

impl ZoneId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ZoneId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ZoneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ZoneId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Category of a danger zone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZoneType {
    User,
    Community,
    Airport,
    Restricted,
}

impl ZoneType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ZoneType::User => "user",
            ZoneType::Community => "community",
            ZoneType::Airport => "airport",
            ZoneType::Restricted => "restricted",
        }
    }

    /// Severity of a violation opened against a zone of this type
    pub fn violation_severity(&self) -> Severity {
        match self {
            ZoneType::Restricted | ZoneType::Airport => Severity::Critical,
            ZoneType::User | ZoneType::Community => Severity::Warning,
        }
    }
}

impl Default for ZoneType {
    fn default() -> Self {
        Self::User
    }
}

impl fmt::Display for ZoneType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ZoneType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(ZoneType::User),
            "community" => Ok(ZoneType::Community),
            "airport" => Ok(ZoneType::Airport),
            "restricted" => Ok(ZoneType::Restricted),
            other => Err(CoreError::invalid_zone(format!("unknown zone type: {other}"))),
        }
    }
}

/// Who can see a danger zone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZoneVisibility {
    OwnerOnly,
    Public,
}

impl ZoneVisibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            ZoneVisibility::OwnerOnly => "owner_only",
            ZoneVisibility::Public => "public",
        }
    }
}

impl Default for ZoneVisibility {
    fn default() -> Self {
        Self::OwnerOnly
    }
}

impl FromStr for ZoneVisibility {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "owner_only" => Ok(ZoneVisibility::OwnerOnly),
            "public" => Ok(ZoneVisibility::Public),
            other => Err(CoreError::invalid_zone(format!("unknown visibility: {other}"))),
        }
    }
}

/// Set of zones a lookup is evaluated against
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ZoneScope {
    /// Public zones only
    Public,
    /// Public zones plus the ones owned by this operator
    Operator(OperatorId),
}

impl ZoneScope {
    /// Whether `zone` belongs to this scope (ignores the active flag)
    pub fn includes(&self, zone: &DangerZone) -> bool {
        match self {
            ZoneScope::Public => zone.is_public(),
            ZoneScope::Operator(id) => zone.is_visible_to(id),
        }
    }
}

impl fmt::Display for ZoneScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ZoneScope::Public => f.write_str("public"),
            ZoneScope::Operator(id) => write!(f, "operator:{id}"),
        }
    }
}

/// A named polygon with an optional altitude ceiling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DangerZone {
    pub id: ZoneId,
    /// `None` for global zones
    pub owner_id: Option<OperatorId>,
    pub name: String,
    pub description: Option<String>,
    pub zone_type: ZoneType,
    pub polygon: Polygon,
    /// `None` means the zone extends without limit
    pub altitude_limit_meters: Option<f64>,
    pub visibility: ZoneVisibility,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DangerZone {
    /// Build a zone from a create request
    pub fn from_request(owner_id: Option<OperatorId>, request: NewDangerZone) -> CoreResult<Self> {
        let name = request.name.trim().to_string();
        if name.is_empty() {
            return Err(CoreError::invalid_zone("name must not be empty"));
        }
        let polygon = Polygon::new(request.coordinates)?;
        let now = Utc::now();

        Ok(Self {
            id: ZoneId::new(),
            owner_id,
            name,
            description: request.description,
            zone_type: request.zone_type,
            polygon,
            altitude_limit_meters: request.altitude_limit_meters,
            visibility: if request.is_public {
                ZoneVisibility::Public
            } else {
                ZoneVisibility::OwnerOnly
            },
            active: true,
            created_at: now,
            updated_at: now,
        })
    }

    /// Apply a partial update, revalidating the polygon when it changes
    pub fn apply(&mut self, update: DangerZoneUpdate) -> CoreResult<()> {
        if let Some(name) = update.name {
            let name = name.trim().to_string();
            if name.is_empty() {
                return Err(CoreError::invalid_zone("name must not be empty"));
            }
            self.name = name;
        }
        if let Some(description) = update.description {
            self.description = Some(description);
        }
        if let Some(zone_type) = update.zone_type {
            self.zone_type = zone_type;
        }
        if let Some(coordinates) = update.coordinates {
            self.polygon = Polygon::new(coordinates)?;
        }
        if let Some(limit) = update.altitude_limit_meters {
            self.altitude_limit_meters = limit;
        }
        if let Some(is_public) = update.is_public {
            self.visibility = if is_public {
                ZoneVisibility::Public
            } else {
                ZoneVisibility::OwnerOnly
            };
        }
        if let Some(active) = update.active {
            self.active = active;
        }
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn is_public(&self) -> bool {
        self.visibility == ZoneVisibility::Public
    }

    /// Public zones are visible to everyone, private ones only to their owner
    pub fn is_visible_to(&self, operator_id: &OperatorId) -> bool {
        self.is_public() || self.owner_id.as_ref() == Some(operator_id)
    }

    /// Whether a point at this position counts as being inside the zone
    pub fn applies_to(&self, latitude: f64, longitude: f64, altitude_meters: f64) -> bool {
        self.active
            && self
                .altitude_limit_meters
                .is_none_or(|limit| limit >= altitude_meters)
            && self.polygon.contains(latitude, longitude)
    }
}

/// Create request for a danger zone
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewDangerZone {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub zone_type: ZoneType,
    pub coordinates: Vec<Coordinate>,
    #[serde(default)]
    pub altitude_limit_meters: Option<f64>,
    #[serde(default)]
    pub is_public: bool,
}

/// Partial update for a danger zone
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DangerZoneUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub zone_type: Option<ZoneType>,
    pub coordinates: Option<Vec<Coordinate>>,
    /// `Some(None)` clears the ceiling
    #[serde(default, with = "double_option")]
    pub altitude_limit_meters: Option<Option<f64>>,
    pub is_public: Option<bool>,
    pub active: Option<bool>,
}

mod double_option {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Option<f64>>, s: S) -> Result<S::Ok, S::Error> {
        value.flatten().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Option<f64>>, D::Error> {
        Option::<f64>::deserialize(d).map(Some)
    }
}

// ============================================================================
// VIOLATIONS
// ============================================================================

/// Interval during which a session was inside a danger zone
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneViolation {
    pub id: Uuid,
    pub session_id: SessionId,
    pub zone_id: ZoneId,
    pub entered_at: DateTime<Utc>,
    pub exited_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i64>,
    pub max_altitude_meters: f64,
    pub severity: Severity,
}

impl ZoneViolation {
    pub fn open(
        session_id: SessionId,
        zone: &DangerZone,
        altitude_meters: f64,
        entered_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id,
            zone_id: zone.id,
            entered_at,
            exited_at: None,
            duration_seconds: None,
            max_altitude_meters: altitude_meters,
            severity: zone.zone_type.violation_severity(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.exited_at.is_none()
    }

    /// Mark the violation as exited at `at`.
    ///
    /// An exit observed before the entry (late out-of-order telemetry) is
    /// pinned to the entry time, so `exited_at >= entered_at` always holds.
    pub fn close(&mut self, at: DateTime<Utc>) {
        let exited_at = at.max(self.entered_at);
        self.exited_at = Some(exited_at);
        self.duration_seconds = Some((exited_at - self.entered_at).num_seconds());
    }
}
