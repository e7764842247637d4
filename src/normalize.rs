// Record normalization: one raw upstream element in, one canonical
// `VehicleRecord` (or a drop) out. Pure; no I/O.

use chrono::{DateTime, Utc};
use clap::ValueEnum;
use serde::Serialize;
use serde_json::Value;

use crate::models::{DEFAULT_DEVIATION, Heading, UNKNOWN, VehicleRecord};

const ROUTE_SEPARATORS: [char; 4] = ['-', '_', '/', ' '];

/// The three payload shapes the upstream has been observed to send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum PayloadShape {
    FlatArray,
    Wrapped,
    FeatureCollection,
}

impl PayloadShape {
    pub fn as_str(self) -> &'static str {
        match self {
            PayloadShape::FlatArray => "flatArray",
            PayloadShape::Wrapped => "wrapped",
            PayloadShape::FeatureCollection => "featureCollection",
        }
    }
}

/// How compound route codes such as `"09-1"` are simplified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RouteLabelPolicy {
    Passthrough,
    StripSuffix,
    Numeric,
}

impl RouteLabelPolicy {
    pub fn apply(self, raw: &str) -> String {
        let raw = raw.trim();
        match self {
            RouteLabelPolicy::Passthrough => raw.to_string(),
            RouteLabelPolicy::StripSuffix => leading_segment(raw).to_string(),
            RouteLabelPolicy::Numeric => {
                let segment = leading_segment(raw);
                if !segment.is_empty() && segment.bytes().all(|b| b.is_ascii_digit()) {
                    let trimmed = segment.trim_start_matches('0');
                    if trimmed.is_empty() {
                        "0".to_string()
                    } else {
                        trimmed.to_string()
                    }
                } else {
                    segment.to_string()
                }
            }
        }
    }
}

fn leading_segment(raw: &str) -> &str {
    raw.split(ROUTE_SEPARATORS).next().unwrap_or(raw)
}

/// Field-name precedence and route policy for one payload shape. Built once
/// at startup, consulted for every element of that shape.
#[derive(Debug, Clone)]
pub struct ShapeProfile {
    pub id_keys: &'static [&'static str],
    pub route_keys: &'static [&'static str],
    pub lat_keys: &'static [&'static str],
    pub lon_keys: &'static [&'static str],
    pub heading_keys: &'static [&'static str],
    pub speed_keys: &'static [&'static str],
    pub location_keys: &'static [&'static str],
    pub deviation_keys: &'static [&'static str],
    pub route_policy: RouteLabelPolicy,
}

const ROUTE_KEYS: &[&str] = &["route", "routeNumber", "route_number", "line"];
const LAT_KEYS: &[&str] = &["lat", "latitude"];
const LON_KEYS: &[&str] = &["lon", "lng", "longitude"];
const HEADING_KEYS: &[&str] = &["heading", "direction", "bearing"];
const SPEED_KEYS: &[&str] = &["speed", "velocity"];
const LOCATION_KEYS: &[&str] = &["location", "currentLocation", "current_location", "stop"];
const DEVIATION_KEYS: &[&str] = &["deviation", "deviationStatus", "status", "adherence"];

impl ShapeProfile {
    pub fn flat_array(route_policy: RouteLabelPolicy) -> Self {
        ShapeProfile {
            id_keys: &["vehicle", "vehicleId", "vehicle_id", "id"],
            ..Self::unit_keyed(route_policy)
        }
    }

    pub fn wrapped(route_policy: RouteLabelPolicy) -> Self {
        Self::unit_keyed(route_policy)
    }

    pub fn feature_collection(route_policy: RouteLabelPolicy) -> Self {
        Self::unit_keyed(route_policy)
    }

    fn unit_keyed(route_policy: RouteLabelPolicy) -> Self {
        ShapeProfile {
            id_keys: &["unit", "id", "vehicle", "vehicleId"],
            route_keys: ROUTE_KEYS,
            lat_keys: LAT_KEYS,
            lon_keys: LON_KEYS,
            heading_keys: HEADING_KEYS,
            speed_keys: SPEED_KEYS,
            location_keys: LOCATION_KEYS,
            deviation_keys: DEVIATION_KEYS,
            route_policy,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ShapeProfiles {
    pub flat_array: ShapeProfile,
    pub wrapped: ShapeProfile,
    pub feature_collection: ShapeProfile,
}

impl ShapeProfiles {
    pub fn new(
        flat_array: RouteLabelPolicy,
        wrapped: RouteLabelPolicy,
        feature_collection: RouteLabelPolicy,
    ) -> Self {
        ShapeProfiles {
            flat_array: ShapeProfile::flat_array(flat_array),
            wrapped: ShapeProfile::wrapped(wrapped),
            feature_collection: ShapeProfile::feature_collection(feature_collection),
        }
    }

    pub fn for_shape(&self, shape: PayloadShape) -> &ShapeProfile {
        match shape {
            PayloadShape::FlatArray => &self.flat_array,
            PayloadShape::Wrapped => &self.wrapped,
            PayloadShape::FeatureCollection => &self.feature_collection,
        }
    }
}

impl Default for ShapeProfiles {
    fn default() -> Self {
        ShapeProfiles::new(
            RouteLabelPolicy::StripSuffix,
            RouteLabelPolicy::Numeric,
            RouteLabelPolicy::StripSuffix,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    NotAnObject,
    MissingGeometry,
    BadLatitude,
    BadLongitude,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Normalized {
    Record(VehicleRecord),
    Dropped(DropReason),
}

/// Maps one raw element to a canonical record. `ordinal` is the element's
/// index in the batch and only feeds the synthesized id.
pub fn normalize(
    element: &Value,
    shape: PayloadShape,
    profile: &ShapeProfile,
    observed_at: DateTime<Utc>,
    ordinal: usize,
) -> Normalized {
    let (fields, latitude, longitude) = match shape {
        PayloadShape::FlatArray | PayloadShape::Wrapped => {
            let Some(fields) = element.as_object() else {
                return Normalized::Dropped(DropReason::NotAnObject);
            };
            (
                fields,
                first_f64(fields, profile.lat_keys),
                first_f64(fields, profile.lon_keys),
            )
        }
        PayloadShape::FeatureCollection => {
            let Some(fields) = element.get("properties").and_then(Value::as_object) else {
                return Normalized::Dropped(DropReason::NotAnObject);
            };
            let Some(coordinates) = element
                .get("geometry")
                .and_then(|g| g.get("coordinates"))
                .and_then(Value::as_array)
            else {
                return Normalized::Dropped(DropReason::MissingGeometry);
            };
            // GeoJSON order is [longitude, latitude].
            (
                fields,
                coordinates.get(1).and_then(number_from),
                coordinates.first().and_then(number_from),
            )
        }
    };

    let Some(latitude) = latitude.filter(|lat| (-90.0..=90.0).contains(lat)) else {
        return Normalized::Dropped(DropReason::BadLatitude);
    };
    let Some(longitude) = longitude.filter(|lon| (-180.0..=180.0).contains(lon)) else {
        return Normalized::Dropped(DropReason::BadLongitude);
    };

    let vehicle_id = first_string(fields, profile.id_keys).unwrap_or_else(|| {
        format!("{UNKNOWN}-{}-{ordinal}", observed_at.timestamp_millis())
    });

    let route_label = first_string(fields, profile.route_keys)
        .map(|raw| profile.route_policy.apply(&raw))
        .filter(|label| !label.is_empty())
        .unwrap_or_else(|| UNKNOWN.to_string());

    let heading = first_value(fields, profile.heading_keys)
        .and_then(|value| match value {
            Value::Number(n) => n.as_f64().filter(|d| d.is_finite()).map(Heading::Degrees),
            Value::String(s) if !s.trim().is_empty() => Some(Heading::Text(s.trim().to_string())),
            _ => None,
        })
        .unwrap_or_else(Heading::unknown);

    let speed = first_f64(fields, profile.speed_keys).unwrap_or(0.0);

    Normalized::Record(VehicleRecord {
        vehicle_id,
        route_label,
        latitude,
        longitude,
        heading,
        speed,
        current_location: first_string(fields, profile.location_keys)
            .unwrap_or_else(|| UNKNOWN.to_string()),
        deviation_status: first_string(fields, profile.deviation_keys)
            .unwrap_or_else(|| DEFAULT_DEVIATION.to_string()),
        observed_at,
    })
}

fn first_value<'a>(
    fields: &'a serde_json::Map<String, Value>,
    keys: &[&str],
) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|key| fields.get(*key))
        .find(|value| !value.is_null())
}

fn first_string(fields: &serde_json::Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| fields.get(*key))
        .find_map(|value| match value {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
}

fn first_f64(fields: &serde_json::Map<String, Value>, keys: &[&str]) -> Option<f64> {
    first_value(fields, keys).and_then(number_from)
}

fn number_from(value: &Value) -> Option<f64> {
    let n = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    n.is_finite().then_some(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
    }

    fn run(element: Value, shape: PayloadShape) -> Normalized {
        let profiles = ShapeProfiles::default();
        normalize(&element, shape, profiles.for_shape(shape), at(), 3)
    }

    fn record(element: Value, shape: PayloadShape) -> VehicleRecord {
        match run(element, shape) {
            Normalized::Record(record) => record,
            Normalized::Dropped(reason) => panic!("record dropped: {reason:?}"),
        }
    }

    #[test]
    fn feature_coordinates_are_longitude_first() {
        let r = record(
            json!({
                "geometry": {"type": "Point", "coordinates": [-77.03, 38.90]},
                "properties": {"unit": "4410", "route": "09-1"}
            }),
            PayloadShape::FeatureCollection,
        );
        assert!((r.longitude - -77.03).abs() < f64::EPSILON);
        assert!((r.latitude - 38.90).abs() < f64::EPSILON);
        assert_eq!(r.vehicle_id, "4410");
        assert_eq!(r.route_label, "09");
    }

    #[test]
    fn drops_missing_or_non_numeric_coordinates() {
        for shape in [PayloadShape::FlatArray, PayloadShape::Wrapped] {
            assert_eq!(
                run(json!({"vehicle": "1", "lon": -79.5}), shape),
                Normalized::Dropped(DropReason::BadLatitude)
            );
            assert_eq!(
                run(json!({"vehicle": "1", "lat": 9.0, "lon": "west"}), shape),
                Normalized::Dropped(DropReason::BadLongitude)
            );
            assert_eq!(
                run(json!({"vehicle": "1", "lat": null, "lon": -79.5}), shape),
                Normalized::Dropped(DropReason::BadLatitude)
            );
        }
        assert_eq!(
            run(
                json!({"geometry": {"coordinates": ["x", 9.0]}, "properties": {}}),
                PayloadShape::FeatureCollection
            ),
            Normalized::Dropped(DropReason::BadLongitude)
        );
        assert_eq!(
            run(json!({"properties": {"unit": "1"}}), PayloadShape::FeatureCollection),
            Normalized::Dropped(DropReason::MissingGeometry)
        );
    }

    #[test]
    fn drops_out_of_range_coordinates() {
        assert_eq!(
            run(json!({"lat": 91.0, "lon": 0.5}), PayloadShape::FlatArray),
            Normalized::Dropped(DropReason::BadLatitude)
        );
    }

    #[test]
    fn accepts_numeric_strings() {
        let r = record(
            json!({"vehicle": "55", "lat": " 8.98 ", "lng": "-79.52"}),
            PayloadShape::FlatArray,
        );
        assert!((r.latitude - 8.98).abs() < f64::EPSILON);
        assert!((r.longitude - -79.52).abs() < f64::EPSILON);
    }

    #[test]
    fn route_policies_follow_shape_configuration() {
        assert_eq!(RouteLabelPolicy::StripSuffix.apply("09-1"), "09");
        assert_eq!(RouteLabelPolicy::Numeric.apply("09-1"), "9");
        assert_eq!(RouteLabelPolicy::Numeric.apply("000"), "0");
        assert_eq!(RouteLabelPolicy::Numeric.apply("E04 Express"), "E04");
        assert_eq!(RouteLabelPolicy::Passthrough.apply(" 09-1 "), "09-1");

        let flat = record(
            json!({"vehicle": "1", "route": "09-1", "lat": 9.0, "lon": -79.5}),
            PayloadShape::FlatArray,
        );
        assert_eq!(flat.route_label, "09");

        let wrapped = record(
            json!({"unit": "1", "route": "09-1", "lat": 9.0, "lon": -79.5}),
            PayloadShape::Wrapped,
        );
        assert_eq!(wrapped.route_label, "9");
    }

    #[test]
    fn fills_sentinels_for_missing_fields() {
        let r = record(json!({"lat": 9.0, "lon": -79.5}), PayloadShape::Wrapped);
        assert_eq!(r.vehicle_id, format!("unknown-{}-3", at().timestamp_millis()));
        assert_eq!(r.route_label, "unknown");
        assert_eq!(r.heading, Heading::unknown());
        assert!(r.speed.abs() < f64::EPSILON);
        assert_eq!(r.current_location, "unknown");
        assert_eq!(r.deviation_status, "on time");
        assert_eq!(r.observed_at, at());
    }

    #[test]
    fn bad_speed_defaults_to_zero() {
        let r = record(
            json!({"unit": 12, "lat": 9.0, "lon": -79.5, "speed": "fast"}),
            PayloadShape::Wrapped,
        );
        assert!(r.speed.abs() < f64::EPSILON);
        assert_eq!(r.vehicle_id, "12");
    }

    #[test]
    fn heading_passes_through_text_or_degrees() {
        let r = record(
            json!({"unit": "1", "lat": 9.0, "lon": -79.5, "heading": 270}),
            PayloadShape::Wrapped,
        );
        assert_eq!(r.heading, Heading::Degrees(270.0));
        let r = record(
            json!({"unit": "1", "lat": 9.0, "lon": -79.5, "direction": "Norte"}),
            PayloadShape::Wrapped,
        );
        assert_eq!(r.heading, Heading::Text("Norte".to_string()));
    }

    #[test]
    fn id_precedence_differs_by_shape() {
        let element = json!({"vehicle": "V-1", "unit": "U-1", "lat": 9.0, "lon": -79.5});
        assert_eq!(record(element.clone(), PayloadShape::FlatArray).vehicle_id, "V-1");
        assert_eq!(record(element, PayloadShape::Wrapped).vehicle_id, "U-1");
    }

    #[test]
    fn non_objects_are_dropped() {
        assert_eq!(
            run(json!("bus"), PayloadShape::FlatArray),
            Normalized::Dropped(DropReason::NotAnObject)
        );
    }
}
