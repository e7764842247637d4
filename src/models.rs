// Canonical vehicle records, persisted rows and static reference entities.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

/// Sentinel used for text fields the upstream left empty.
pub const UNKNOWN: &str = "unknown";
pub const DEFAULT_DEVIATION: &str = "on time";

// ============================================================================
// Vehicle positions
// ============================================================================

/// Heading as reported upstream: either compass text ("N", "Northbound")
/// or degrees.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Heading {
    Degrees(f64),
    Text(String),
}

impl Heading {
    pub fn unknown() -> Self {
        Heading::Text(UNKNOWN.to_string())
    }

    pub fn from_stored(degrees: Option<f64>, text: Option<String>) -> Self {
        match (degrees, text) {
            (Some(degrees), _) => Heading::Degrees(degrees),
            (None, Some(text)) => Heading::Text(text),
            (None, None) => Heading::unknown(),
        }
    }

    pub fn to_stored(&self) -> (Option<f64>, Option<&str>) {
        match self {
            Heading::Degrees(degrees) => (Some(*degrees), None),
            Heading::Text(text) => (None, Some(text.as_str())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VehicleRecord {
    pub vehicle_id: String,
    pub route_label: String,
    pub latitude: f64,
    pub longitude: f64,
    pub heading: Heading,
    pub speed: f64,
    pub current_location: String,
    pub deviation_status: String,
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionRow {
    pub id: i64,
    #[serde(flatten)]
    pub record: VehicleRecord,
    pub inserted_at: DateTime<Utc>,
}

// ============================================================================
// Static reference data
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteDescriptor {
    pub route_id: String,
    pub route_number: String,
    pub route_name: String,
    #[serde(default)]
    pub color: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopDescriptor {
    pub stop_id: String,
    pub stop_name: String,
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Default, Deserialize)]
pub struct ReferenceSeed {
    #[serde(default)]
    pub routes: Vec<RouteDescriptor>,
    #[serde(default)]
    pub stops: Vec<StopDescriptor>,
}

// ============================================================================
// Time helpers
// ============================================================================

pub fn format_timestamp_full(timestamp: DateTime<Utc>, tz: Tz) -> String {
    timestamp
        .with_timezone(&tz)
        .format("%Y-%m-%d %H:%M:%S %Z")
        .to_string()
}

pub fn parse_display_tz(name: &str) -> Tz {
    name.parse::<Tz>().unwrap_or_else(|_| {
        log::warn!("⚠️  Unknown display timezone '{name}', using UTC");
        Tz::UTC
    })
}
