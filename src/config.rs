// Command-line / environment configuration.

use std::path::PathBuf;

use clap::Parser;

use crate::normalize::{RouteLabelPolicy, ShapeProfiles};

#[derive(Debug, Clone, Parser)]
#[command(name = "metrobus-live", version, about = "Live Metrobus vehicle positions API")]
pub struct Config {
    /// Upstream vehicle-location feed.
    #[arg(long, env = "UPSTREAM_URL")]
    pub upstream_url: String,

    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0")]
    pub bind_addr: String,

    #[arg(long, env = "PORT", default_value_t = 8080)]
    pub port: u16,

    /// SQLite file holding recent positions and reference tables.
    #[arg(long, env = "DATABASE_PATH", default_value = "data/metrobus.db")]
    pub database_path: PathBuf,

    /// JSON file with `routes` and `stops` to load at startup.
    #[arg(long, env = "SEED_PATH")]
    pub seed_path: Option<PathBuf>,

    /// IANA zone for human-readable timestamps.
    #[arg(long, env = "DISPLAY_TZ", default_value = "America/Panama")]
    pub display_tz: String,

    /// Route-label policy for top-level array payloads.
    #[arg(long, value_enum, default_value_t = RouteLabelPolicy::StripSuffix)]
    pub array_route_policy: RouteLabelPolicy,

    /// Route-label policy for payloads wrapping the list in a named property.
    #[arg(long, value_enum, default_value_t = RouteLabelPolicy::Numeric)]
    pub wrapped_route_policy: RouteLabelPolicy,

    /// Route-label policy for GeoJSON feature payloads.
    #[arg(long, value_enum, default_value_t = RouteLabelPolicy::StripSuffix)]
    pub geojson_route_policy: RouteLabelPolicy,
}

impl Config {
    pub fn shape_profiles(&self) -> ShapeProfiles {
        ShapeProfiles::new(
            self.array_route_policy,
            self.wrapped_route_policy,
            self.geojson_route_policy,
        )
    }
}
