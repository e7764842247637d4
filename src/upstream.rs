// Upstream fetcher: bounded-timeout call to the vehicle feed, top-level
// shape classification, per-element normalization.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::{FetchError, SchemaMismatch};
use crate::models::VehicleRecord;
use crate::normalize::{self, Normalized, PayloadShape, ShapeProfiles};

pub const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

pub const WRAPPER_KEYS: [&str; 5] = ["buses", "vehicles", "data", "results", "items"];

/// A decoded upstream payload, tagged with the shape it was recognized as.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamPayload {
    FlatArray(Vec<Value>),
    Wrapped { key: String, items: Vec<Value> },
    FeatureCollection(Vec<Value>),
}

impl UpstreamPayload {
    pub fn shape(&self) -> PayloadShape {
        match self {
            UpstreamPayload::FlatArray(_) => PayloadShape::FlatArray,
            UpstreamPayload::Wrapped { .. } => PayloadShape::Wrapped,
            UpstreamPayload::FeatureCollection(_) => PayloadShape::FeatureCollection,
        }
    }

    pub fn elements(&self) -> &[Value] {
        match self {
            UpstreamPayload::FlatArray(items)
            | UpstreamPayload::Wrapped { items, .. }
            | UpstreamPayload::FeatureCollection(items) => items,
        }
    }
}

pub fn classify(payload: Value) -> Result<UpstreamPayload, SchemaMismatch> {
    match payload {
        Value::Array(items) => Ok(UpstreamPayload::FlatArray(items)),
        Value::Object(mut object) => {
            let array_key = std::iter::once("features")
                .chain(WRAPPER_KEYS)
                .find(|key| object.get(*key).is_some_and(Value::is_array));

            match array_key.and_then(|key| object.remove(key).map(|value| (key, value))) {
                Some(("features", Value::Array(features))) => {
                    Ok(UpstreamPayload::FeatureCollection(features))
                }
                Some((key, Value::Array(items))) => Ok(UpstreamPayload::Wrapped {
                    key: key.to_string(),
                    items,
                }),
                _ => {
                    let mut keys: Vec<&str> = object.keys().map(String::as_str).take(8).collect();
                    keys.sort_unstable();
                    Err(SchemaMismatch {
                        found: format!("object with keys [{}]", keys.join(", ")),
                    })
                }
            }
        }
        other => Err(SchemaMismatch {
            found: json_kind(&other).to_string(),
        }),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Anything that can hand back the raw upstream payload.
#[async_trait]
pub trait VehicleSource: Send + Sync {
    fn describe(&self) -> &str;

    async fn fetch_payload(&self) -> Result<Value, FetchError>;
}

pub struct MetrobusClient {
    client: reqwest::Client,
    url: String,
}

impl MetrobusClient {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(MetrobusClient {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl VehicleSource for MetrobusClient {
    fn describe(&self) -> &str {
        &self.url
    }

    async fn fetch_payload(&self) -> Result<Value, FetchError> {
        let response = self
            .client
            .get(&self.url)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(FetchError::Status(response.status()));
        }

        let body = response.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }
}

/// Outcome of one fetch: the normalized batch plus what was seen on the wire.
#[derive(Debug, Clone)]
pub struct FetchReport {
    pub shape: Option<PayloadShape>,
    pub received: usize,
    pub records: Vec<VehicleRecord>,
    pub mismatch: Option<SchemaMismatch>,
}

impl FetchReport {
    pub fn dropped(&self) -> usize {
        self.received.saturating_sub(self.records.len())
    }
}

pub fn normalize_payload(
    payload: &UpstreamPayload,
    profiles: &ShapeProfiles,
    observed_at: DateTime<Utc>,
) -> Vec<VehicleRecord> {
    let shape = payload.shape();
    let profile = profiles.for_shape(shape);
    payload
        .elements()
        .iter()
        .enumerate()
        .filter_map(|(ordinal, element)| {
            match normalize::normalize(element, shape, profile, observed_at, ordinal) {
                Normalized::Record(record) => Some(record),
                Normalized::Dropped(reason) => {
                    log::debug!("Dropped {} element #{ordinal}: {reason:?}", shape.as_str());
                    None
                }
            }
        })
        .collect()
}

/// Fetches, classifies and normalizes. Transport failures are errors; an
/// unrecognized payload is an empty report with `mismatch` set.
pub async fn fetch_vehicles(
    source: &dyn VehicleSource,
    profiles: &ShapeProfiles,
    observed_at: DateTime<Utc>,
) -> Result<FetchReport, FetchError> {
    let payload = source.fetch_payload().await?;

    match classify(payload) {
        Ok(payload) => {
            let records = normalize_payload(&payload, profiles, observed_at);
            Ok(FetchReport {
                shape: Some(payload.shape()),
                received: payload.elements().len(),
                records,
                mismatch: None,
            })
        }
        Err(mismatch) => {
            log::warn!("⚠️  Schema mismatch from {}: {mismatch}", source.describe());
            Ok(FetchReport {
                shape: None,
                received: 0,
                records: Vec::new(),
                mismatch: Some(mismatch),
            })
        }
    }
}
