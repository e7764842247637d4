// SQLite-backed retention store: a trailing window of vehicle positions plus
// the static route/stop reference tables.

use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, TimeDelta, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use serde::Serialize;

use crate::error::StoreError;
use crate::models::{
    Heading, PositionRow, ReferenceSeed, RouteDescriptor, StopDescriptor, VehicleRecord,
};

/// Rows older than this are pruned at the start of every persist.
pub const RETENTION_HORIZON_SECS: i64 = 10 * 60;
pub const RECENT_WINDOW_SECS: i64 = 5 * 60;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS bus_positions (
        id               INTEGER PRIMARY KEY AUTOINCREMENT,
        vehicle_id       TEXT NOT NULL CHECK (length(vehicle_id) > 0),
        route_number     TEXT NOT NULL,
        latitude         REAL NOT NULL CHECK (latitude BETWEEN -90 AND 90),
        longitude        REAL NOT NULL CHECK (longitude BETWEEN -180 AND 180),
        heading_degrees  REAL,
        heading_text     TEXT,
        speed            REAL NOT NULL,
        current_location TEXT NOT NULL,
        deviation_status TEXT NOT NULL,
        observed_at      TEXT NOT NULL,
        inserted_at      INTEGER NOT NULL,
        CHECK ((heading_degrees IS NULL) <> (heading_text IS NULL))
    );
    CREATE INDEX IF NOT EXISTS idx_bus_positions_inserted_at
        ON bus_positions (inserted_at);

    CREATE TABLE IF NOT EXISTS routes (
        route_id     TEXT PRIMARY KEY,
        route_number TEXT NOT NULL,
        route_name   TEXT NOT NULL,
        color        TEXT
    );

    CREATE TABLE IF NOT EXISTS stops (
        stop_id   TEXT PRIMARY KEY,
        stop_name TEXT NOT NULL,
        latitude  REAL NOT NULL,
        longitude REAL NOT NULL
    );
";

const POSITION_COLUMNS: &str = "id, vehicle_id, route_number, latitude, longitude, heading_degrees, \
     heading_text, speed, current_location, deviation_status, observed_at, inserted_at";

/// Filters for historical position queries. Empty means "no filter".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PositionFilter {
    pub routes: Option<Vec<String>>,
    pub vehicle: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistSummary {
    pub pruned: usize,
    pub inserted: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    pub positions: i64,
    pub routes: i64,
    pub stops: i64,
    pub oldest_inserted_at: Option<DateTime<Utc>>,
    pub newest_inserted_at: Option<DateTime<Utc>>,
}

pub struct RetentionStore {
    conn: Mutex<Connection>,
}

impl RetentionStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        let mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        log::debug!("SQLite journal mode: {mode}");
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(RetentionStore {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub async fn run<T, F>(self: &Arc<Self>, work: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&RetentionStore) -> Result<T, StoreError> + Send + 'static,
    {
        let store = Arc::clone(self);
        tokio::task::spawn_blocking(move || work(&store))
            .await
            .map_err(|e| StoreError::Task(e.to_string()))?
    }

    // ========================================================================
    // Positions
    // ========================================================================

    pub fn persist(&self, batch: &[VehicleRecord]) -> PersistSummary {
        self.persist_at(batch, Utc::now())
    }

    /// Prunes rows past the retention horizon, then inserts one row per
    /// record. Neither a failed prune nor a failed row stops the rest.
    pub fn persist_at(&self, batch: &[VehicleRecord], now: DateTime<Utc>) -> PersistSummary {
        let mut summary = PersistSummary::default();

        match self.prune_older_than(now - TimeDelta::seconds(RETENTION_HORIZON_SECS)) {
            Ok(pruned) => summary.pruned = pruned,
            Err(e) => log::warn!("⚠️  Failed to prune old positions: {e}"),
        }

        for record in batch {
            match self.insert_position(record, now) {
                Ok(_) => summary.inserted += 1,
                Err(e) => {
                    summary.failed += 1;
                    log::warn!("⚠️  Skipping position for vehicle '{}': {e}", record.vehicle_id);
                }
            }
        }

        summary
    }

    pub fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let pruned = self.conn().execute(
            "DELETE FROM bus_positions WHERE inserted_at < ?1",
            params![cutoff.timestamp_millis()],
        )?;
        Ok(pruned)
    }

    pub fn insert_position(
        &self,
        record: &VehicleRecord,
        inserted_at: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let (heading_degrees, heading_text) = record.heading.to_stored();
        let conn = self.conn();
        conn.execute(
            "INSERT INTO bus_positions (vehicle_id, route_number, latitude, longitude, \
             heading_degrees, heading_text, speed, current_location, deviation_status, \
             observed_at, inserted_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                record.vehicle_id,
                record.route_label,
                record.latitude,
                record.longitude,
                heading_degrees,
                heading_text,
                record.speed,
                record.current_location,
                record.deviation_status,
                record.observed_at.to_rfc3339(),
                inserted_at.timestamp_millis(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn query_recent(&self, filter: &PositionFilter) -> Result<Vec<PositionRow>, StoreError> {
        self.query_recent_at(filter, Utc::now())
    }

    pub fn query_recent_at(
        &self,
        filter: &PositionFilter,
        now: DateTime<Utc>,
    ) -> Result<Vec<PositionRow>, StoreError> {
        let since = now - TimeDelta::seconds(RECENT_WINDOW_SECS);
        let mut sql = format!("SELECT {POSITION_COLUMNS} FROM bus_positions WHERE inserted_at >= ?");
        let mut values = vec![SqlValue::Integer(since.timestamp_millis())];

        if let Some(routes) = filter.routes.as_ref().filter(|r| !r.is_empty()) {
            let placeholders = vec!["?"; routes.len()].join(", ");
            sql.push_str(&format!(" AND route_number IN ({placeholders})"));
            values.extend(routes.iter().cloned().map(SqlValue::Text));
        }

        if let Some(vehicle) = filter.vehicle.as_ref().filter(|v| !v.is_empty()) {
            sql.push_str(" AND instr(vehicle_id, ?) > 0");
            values.push(SqlValue::Text(vehicle.clone()));
        }

        sql.push_str(" ORDER BY inserted_at DESC, id DESC");

        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(values.iter()), position_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    #[cfg(test)]
    pub(crate) fn execute_raw(&self, sql: &str) -> Result<(), StoreError> {
        self.conn().execute_batch(sql)?;
        Ok(())
    }

    // ========================================================================
    // Reference data
    // ========================================================================

    pub fn routes(&self) -> Result<Vec<RouteDescriptor>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT route_id, route_number, route_name, color FROM routes \
             ORDER BY CAST(route_number AS INTEGER), route_number, route_id",
        )?;
        let routes = stmt
            .query_map([], |row| {
                Ok(RouteDescriptor {
                    route_id: row.get(0)?,
                    route_number: row.get(1)?,
                    route_name: row.get(2)?,
                    color: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(routes)
    }

    pub fn stops(&self, limit: Option<usize>) -> Result<Vec<StopDescriptor>, StoreError> {
        let limit = limit.map_or(-1, |n| i64::try_from(n).unwrap_or(i64::MAX));
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT stop_id, stop_name, latitude, longitude FROM stops \
             ORDER BY stop_id LIMIT ?1",
        )?;
        let stops = stmt
            .query_map(params![limit], |row| {
                Ok(StopDescriptor {
                    stop_id: row.get(0)?,
                    stop_name: row.get(1)?,
                    latitude: row.get(2)?,
                    longitude: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(stops)
    }

    pub fn load_seed(&self, path: &Path) -> Result<(usize, usize), StoreError> {
        let body = std::fs::read(path)?;
        let seed: ReferenceSeed = serde_json::from_slice(&body)?;
        self.upsert_reference(&seed)
    }

    pub fn upsert_reference(&self, seed: &ReferenceSeed) -> Result<(usize, usize), StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        for route in &seed.routes {
            tx.execute(
                "INSERT OR REPLACE INTO routes (route_id, route_number, route_name, color) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![route.route_id, route.route_number, route.route_name, route.color],
            )?;
        }
        for stop in &seed.stops {
            tx.execute(
                "INSERT OR REPLACE INTO stops (stop_id, stop_name, latitude, longitude) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![stop.stop_id, stop.stop_name, stop.latitude, stop.longitude],
            )?;
        }
        tx.commit()?;
        Ok((seed.routes.len(), seed.stops.len()))
    }

    pub fn stats(&self) -> Result<StoreStats, StoreError> {
        let conn = self.conn();
        let count = |table: &str| -> Result<i64, rusqlite::Error> {
            conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
        };
        let (oldest, newest): (Option<i64>, Option<i64>) = conn
            .query_row(
                "SELECT MIN(inserted_at), MAX(inserted_at) FROM bus_positions",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?
            .unwrap_or((None, None));

        Ok(StoreStats {
            positions: count("bus_positions")?,
            routes: count("routes")?,
            stops: count("stops")?,
            oldest_inserted_at: oldest.and_then(DateTime::from_timestamp_millis),
            newest_inserted_at: newest.and_then(DateTime::from_timestamp_millis),
        })
    }
}

fn position_from_row(row: &Row<'_>) -> rusqlite::Result<PositionRow> {
    let heading = Heading::from_stored(row.get(5)?, row.get(6)?);
    let observed_at: String = row.get(10)?;
    let inserted_at: i64 = row.get(11)?;

    let observed_at = DateTime::parse_from_rfc3339(&observed_at)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(10, rusqlite::types::Type::Text, Box::new(e))
        })?;
    let inserted_at = DateTime::from_timestamp_millis(inserted_at)
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(11, inserted_at))?;

    Ok(PositionRow {
        id: row.get(0)?,
        record: VehicleRecord {
            vehicle_id: row.get(1)?,
            route_label: row.get(2)?,
            latitude: row.get(3)?,
            longitude: row.get(4)?,
            heading,
            speed: row.get(7)?,
            current_location: row.get(8)?,
            deviation_status: row.get(9)?,
            observed_at,
        },
        inserted_at,
    })
}

/// Keeps the newest row per vehicle; `rows` must already be newest first.
pub fn latest_per_vehicle(rows: Vec<PositionRow>) -> Vec<PositionRow> {
    let mut seen = std::collections::HashSet::new();
    rows.into_iter()
        .filter(|row| seen.insert(row.record.vehicle_id.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
    }

    fn vehicle(id: &str, route: &str) -> VehicleRecord {
        VehicleRecord {
            vehicle_id: id.to_string(),
            route_label: route.to_string(),
            latitude: 8.98,
            longitude: -79.52,
            heading: Heading::Degrees(180.0),
            speed: 32.5,
            current_location: "Albrook".to_string(),
            deviation_status: "on time".to_string(),
            observed_at: now(),
        }
    }

    fn ids(rows: &[PositionRow]) -> Vec<&str> {
        rows.iter().map(|r| r.record.vehicle_id.as_str()).collect()
    }

    #[test]
    fn persist_prunes_past_retention_horizon() {
        let store = RetentionStore::open_in_memory().unwrap();
        store
            .insert_position(&vehicle("old", "1"), now() - TimeDelta::minutes(11))
            .unwrap();
        store
            .insert_position(&vehicle("recent", "1"), now() - TimeDelta::minutes(9))
            .unwrap();

        let summary = store.persist_at(&[vehicle("new", "1")], now());
        assert_eq!(summary.pruned, 1);
        assert_eq!(summary.inserted, 1);

        let stats = store.stats().unwrap();
        assert_eq!(stats.positions, 2);
        assert_eq!(
            stats.oldest_inserted_at,
            Some(now() - TimeDelta::minutes(9))
        );
    }

    #[test]
    fn failed_row_does_not_abort_batch() {
        let store = RetentionStore::open_in_memory().unwrap();
        let summary = store.persist_at(&[vehicle("a", "1"), vehicle("", "1"), vehicle("c", "2")], now());
        assert_eq!(summary.inserted, 2);
        assert_eq!(summary.failed, 1);

        let rows = store.query_recent_at(&PositionFilter::default(), now()).unwrap();
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn recent_query_is_windowed_and_newest_first() {
        let store = RetentionStore::open_in_memory().unwrap();
        store
            .insert_position(&vehicle("stale", "1"), now() - TimeDelta::minutes(6))
            .unwrap();
        store
            .insert_position(&vehicle("older", "1"), now() - TimeDelta::minutes(2))
            .unwrap();
        store
            .insert_position(&vehicle("tie-a", "1"), now() - TimeDelta::minutes(1))
            .unwrap();
        store
            .insert_position(&vehicle("tie-b", "1"), now() - TimeDelta::minutes(1))
            .unwrap();

        let rows = store.query_recent_at(&PositionFilter::default(), now()).unwrap();
        assert_eq!(ids(&rows), ["tie-b", "tie-a", "older"]);
    }

    #[test]
    fn filters_by_route_set_and_vehicle_substring() {
        let store = RetentionStore::open_in_memory().unwrap();
        store.persist_at(
            &[
                vehicle("8101", "1"),
                vehicle("8102", "2"),
                vehicle("9101", "3"),
                vehicle("8201", "3"),
            ],
            now(),
        );

        let by_route = PositionFilter {
            routes: Some(vec!["1".to_string(), "3".to_string()]),
            vehicle: None,
        };
        let mut found = ids(&store.query_recent_at(&by_route, now()).unwrap())
            .into_iter()
            .map(str::to_string)
            .collect::<Vec<_>>();
        found.sort();
        assert_eq!(found, ["8101", "8201", "9101"]);

        let by_vehicle = PositionFilter {
            routes: None,
            vehicle: Some("10".to_string()),
        };
        let mut found = ids(&store.query_recent_at(&by_vehicle, now()).unwrap())
            .into_iter()
            .map(str::to_string)
            .collect::<Vec<_>>();
        found.sort();
        assert_eq!(found, ["8101", "8102", "9101"]);

        let both = PositionFilter {
            routes: Some(vec!["3".to_string()]),
            vehicle: Some("91".to_string()),
        };
        assert_eq!(ids(&store.query_recent_at(&both, now()).unwrap()), ["9101"]);
    }

    #[test]
    fn stored_rows_round_trip_fields() {
        let store = RetentionStore::open_in_memory().unwrap();
        store.persist_at(&[vehicle("8101", "1")], now());
        let rows = store.query_recent_at(&PositionFilter::default(), now()).unwrap();
        assert_eq!(rows[0].record, vehicle("8101", "1"));
        assert_eq!(rows[0].inserted_at, now());
    }

    #[test]
    fn numeric_looking_text_heading_stays_text() {
        let store = RetentionStore::open_in_memory().unwrap();
        let mut record = vehicle("8101", "1");
        record.heading = Heading::Text("270".to_string());
        store.persist_at(&[record.clone()], now());

        let rows = store.query_recent_at(&PositionFilter::default(), now()).unwrap();
        assert_eq!(rows[0].record.heading, Heading::Text("270".to_string()));
        let json = serde_json::to_value(&rows[0]).unwrap();
        assert_eq!(json["heading"], "270");
    }

    #[test]
    fn latest_per_vehicle_keeps_first_occurrence() {
        let store = RetentionStore::open_in_memory().unwrap();
        store.persist_at(&[vehicle("a", "1")], now() - TimeDelta::minutes(2));
        store.persist_at(&[vehicle("a", "1"), vehicle("b", "1")], now());

        let rows = store.query_recent_at(&PositionFilter::default(), now()).unwrap();
        assert_eq!(rows.len(), 3);
        let latest = latest_per_vehicle(rows);
        assert_eq!(latest.len(), 2);
        assert!(latest.iter().all(|r| r.inserted_at == now()));
    }

    #[test]
    fn reference_tables_upsert_and_limit() {
        let store = RetentionStore::open_in_memory().unwrap();
        let seed: ReferenceSeed = serde_json::from_value(serde_json::json!({
            "routes": [
                {"routeId": "r10", "routeNumber": "10", "routeName": "Albrook - Condado"},
                {"routeId": "r2", "routeNumber": "2", "routeName": "Via Espana", "color": "#ff0000"}
            ],
            "stops": [
                {"stopId": "s2", "stopName": "Albrook", "latitude": 8.97, "longitude": -79.55},
                {"stopId": "s1", "stopName": "5 de Mayo", "latitude": 8.96, "longitude": -79.54},
                {"stopId": "s3", "stopName": "Iglesia del Carmen", "latitude": 8.99, "longitude": -79.52}
            ]
        }))
        .unwrap();

        assert_eq!(store.upsert_reference(&seed).unwrap(), (2, 3));
        assert_eq!(store.upsert_reference(&seed).unwrap(), (2, 3));

        let routes = store.routes().unwrap();
        assert_eq!(routes.len(), 2);
        assert_eq!(routes[0].route_number, "2");
        assert_eq!(routes[0].color.as_deref(), Some("#ff0000"));

        assert_eq!(store.stops(None).unwrap().len(), 3);
        let first_two = store.stops(Some(2)).unwrap();
        assert_eq!(
            first_two.iter().map(|s| s.stop_id.as_str()).collect::<Vec<_>>(),
            ["s1", "s2"]
        );
    }

    #[test]
    fn stats_on_empty_store() {
        let store = RetentionStore::open_in_memory().unwrap();
        let stats = store.stats().unwrap();
        assert_eq!(stats.positions, 0);
        assert!(stats.oldest_inserted_at.is_none());
    }

    #[tokio::test]
    async fn run_executes_off_the_executor() {
        let store = Arc::new(RetentionStore::open_in_memory().unwrap());
        let summary = store
            .run(|s| Ok(s.persist(&[vehicle("async", "1")])))
            .await
            .unwrap();
        assert_eq!(summary.inserted, 1);
    }
}
