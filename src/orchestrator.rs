// Refresh orchestrator: owns the snapshot cache and the retention store,
// keeps at most one upstream fetch in flight, and walks the fallback chain
// (fresh cache -> live fetch -> stale cache -> store) when serving vehicles.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

use crate::cache::{Snapshot, SnapshotCache};
use crate::error::{FetchError, HardFailure, StoreFallbackError};
use crate::models::{PositionRow, VehicleRecord};
use crate::normalize::{PayloadShape, ShapeProfiles};
use crate::store::{self, PositionFilter, RetentionStore};
use crate::upstream::{self, FetchReport, VehicleSource};

pub const REFRESH_PERIOD: Duration = Duration::from_secs(30);

pub type CycleResult = Result<Arc<Snapshot>, Arc<FetchError>>;

type SharedCycle = Shared<BoxFuture<'static, CycleResult>>;

#[derive(Debug)]
pub enum VehiclesOutcome {
    Fresh(Arc<Snapshot>),
    Refreshed(Arc<Snapshot>),
    StaleFallback {
        snapshot: Arc<Snapshot>,
        cause: Arc<FetchError>,
    },
    StoreFallback {
        rows: Vec<PositionRow>,
        cause: Arc<FetchError>,
    },
}

/// Last-cycle upstream health. Separates "zero vehicles" from "format
/// changed", which callers of `/api/buses` cannot tell apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum UpstreamState {
    NotYetFetched,
    Ok,
    Empty,
    SchemaMismatch,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamStatus {
    pub state: UpstreamState,
    pub shape: Option<PayloadShape>,
    pub received: usize,
    pub kept: usize,
    pub dropped: usize,
    pub last_error: Option<String>,
    pub last_attempt: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
}

impl Default for UpstreamStatus {
    fn default() -> Self {
        UpstreamStatus {
            state: UpstreamState::NotYetFetched,
            shape: None,
            received: 0,
            kept: 0,
            dropped: 0,
            last_error: None,
            last_attempt: None,
            last_success: None,
            consecutive_failures: 0,
        }
    }
}

impl UpstreamStatus {
    fn record_report(&mut self, report: &FetchReport, at: DateTime<Utc>) {
        self.state = match (&report.mismatch, report.records.is_empty()) {
            (Some(_), _) => UpstreamState::SchemaMismatch,
            (None, true) => UpstreamState::Empty,
            (None, false) => UpstreamState::Ok,
        };
        self.shape = report.shape;
        self.received = report.received;
        self.kept = report.records.len();
        self.dropped = report.dropped();
        self.last_error = report.mismatch.as_ref().map(ToString::to_string);
        self.last_attempt = Some(at);
        self.last_success = Some(at);
        self.consecutive_failures = 0;
    }

    fn record_failure(&mut self, error: &FetchError, at: DateTime<Utc>) {
        self.state = UpstreamState::Failed;
        self.last_error = Some(error.to_string());
        self.last_attempt = Some(at);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamProbe {
    pub source: String,
    pub shape: Option<PayloadShape>,
    pub wrapper_key: Option<String>,
    pub mismatch: Option<String>,
    pub received: usize,
    pub kept: usize,
    pub dropped: usize,
    pub sample_raw: Option<Value>,
    pub sample_normalized: Option<VehicleRecord>,
}

// Empties the in-flight slot when a cycle ends, including by panic, so the
// next trigger starts a new fetch.
struct InFlightSlot(Arc<RefreshOrchestrator>);

impl Drop for InFlightSlot {
    fn drop(&mut self) {
        *self.0.in_flight.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

pub struct RefreshOrchestrator {
    source: Arc<dyn VehicleSource>,
    profiles: ShapeProfiles,
    cache: SnapshotCache,
    store: Arc<RetentionStore>,
    fetch_timeout: Duration,
    in_flight: Mutex<Option<SharedCycle>>,
    upstream: Mutex<UpstreamStatus>,
}

impl RefreshOrchestrator {
    pub fn new(
        source: Arc<dyn VehicleSource>,
        profiles: ShapeProfiles,
        store: Arc<RetentionStore>,
    ) -> Arc<Self> {
        Self::with_cache(source, profiles, store, SnapshotCache::default())
    }

    pub fn with_cache(
        source: Arc<dyn VehicleSource>,
        profiles: ShapeProfiles,
        store: Arc<RetentionStore>,
        cache: SnapshotCache,
    ) -> Arc<Self> {
        Arc::new(RefreshOrchestrator {
            source,
            profiles,
            cache,
            store,
            fetch_timeout: upstream::FETCH_TIMEOUT,
            in_flight: Mutex::new(None),
            upstream: Mutex::new(UpstreamStatus::default()),
        })
    }

    pub fn cache(&self) -> &SnapshotCache {
        &self.cache
    }

    pub fn store(&self) -> &Arc<RetentionStore> {
        &self.store
    }

    pub fn upstream_status(&self) -> UpstreamStatus {
        self.upstream
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub async fn refresh(self: &Arc<Self>) -> CycleResult {
        let cycle = {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            match in_flight.as_ref() {
                Some(cycle) => {
                    log::debug!("Joining in-flight refresh");
                    cycle.clone()
                }
                None => {
                    let this = Arc::clone(self);
                    // Spawned so the fetch completes even if every caller
                    // drops its handle.
                    let handle = tokio::spawn(async move {
                        let _slot = InFlightSlot(Arc::clone(&this));
                        this.run_cycle().await
                    });
                    let cycle = async move {
                        handle
                            .await
                            .unwrap_or_else(|e| Err(Arc::new(FetchError::Aborted(e.to_string()))))
                    }
                    .boxed()
                    .shared();
                    *in_flight = Some(cycle.clone());
                    cycle
                }
            }
        };
        cycle.await
    }

    async fn run_cycle(self: &Arc<Self>) -> CycleResult {
        let started = Utc::now();

        let report = match time::timeout(
            self.fetch_timeout,
            upstream::fetch_vehicles(self.source.as_ref(), &self.profiles, started),
        )
        .await
        {
            Ok(Ok(report)) => report,
            Ok(Err(e)) => return Err(self.fail_cycle(e, started)),
            Err(_) => return Err(self.fail_cycle(FetchError::Timeout(self.fetch_timeout), started)),
        };

        self.upstream
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record_report(&report, started);

        log::info!(
            "✓ Fetched {} vehicles ({} received, {} dropped, shape {})",
            report.records.len(),
            report.received,
            report.dropped(),
            report.shape.map_or("unrecognized", PayloadShape::as_str),
        );

        let snapshot = self.cache.replace(report.records, started);

        // Publishing is done; a persist failure only costs fallback history.
        let persisted = Arc::clone(&snapshot);
        match self
            .store
            .run(move |store| Ok(store.persist(&persisted.batch)))
            .await
        {
            Ok(summary) => log::debug!(
                "Persisted {} positions ({} pruned, {} failed)",
                summary.inserted,
                summary.pruned,
                summary.failed
            ),
            Err(e) => log::warn!("⚠️  Failed to persist positions: {e}"),
        }

        Ok(snapshot)
    }

    fn fail_cycle(&self, error: FetchError, at: DateTime<Utc>) -> Arc<FetchError> {
        log::warn!("⚠️  Upstream fetch from {} failed: {error}", self.source.describe());
        self.upstream
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record_failure(&error, at);
        Arc::new(error)
    }

    /// Serves the live vehicle list, degrading through the fallback chain.
    pub async fn current_vehicles(self: &Arc<Self>) -> Result<VehiclesOutcome, HardFailure> {
        if let Some(snapshot) = self.cache.read().filter(|s| s.is_fresh(Utc::now())) {
            return Ok(VehiclesOutcome::Fresh(snapshot));
        }

        let cause = match self.refresh().await {
            Ok(snapshot) => return Ok(VehiclesOutcome::Refreshed(snapshot)),
            Err(cause) => cause,
        };

        if let Some(snapshot) = self.cache.read() {
            log::warn!(
                "⚠️  Serving stale snapshot from {} ({} vehicles)",
                snapshot.fetched_at,
                snapshot.batch.len()
            );
            return Ok(VehiclesOutcome::StaleFallback { snapshot, cause });
        }

        match self
            .store
            .run(|store| store.query_recent(&PositionFilter::default()))
            .await
        {
            Ok(rows) if !rows.is_empty() => {
                let rows = store::latest_per_vehicle(rows);
                log::warn!("⚠️  Serving {} stored positions", rows.len());
                Ok(VehiclesOutcome::StoreFallback { rows, cause })
            }
            Ok(_) => Err(HardFailure {
                fetch: cause,
                store: StoreFallbackError::Empty,
            }),
            Err(e) => Err(HardFailure {
                fetch: cause,
                store: StoreFallbackError::Query(e),
            }),
        }
    }

    pub async fn probe_upstream(&self) -> Result<UpstreamProbe, FetchError> {
        let payload = time::timeout(self.fetch_timeout, self.source.fetch_payload())
            .await
            .map_err(|_| FetchError::Timeout(self.fetch_timeout))??;

        let mut probe = UpstreamProbe {
            source: self.source.describe().to_string(),
            shape: None,
            wrapper_key: None,
            mismatch: None,
            received: 0,
            kept: 0,
            dropped: 0,
            sample_raw: None,
            sample_normalized: None,
        };

        match upstream::classify(payload) {
            Ok(payload) => {
                let records = upstream::normalize_payload(&payload, &self.profiles, Utc::now());
                probe.shape = Some(payload.shape());
                if let upstream::UpstreamPayload::Wrapped { key, .. } = &payload {
                    probe.wrapper_key = Some(key.clone());
                }
                probe.received = payload.elements().len();
                probe.kept = records.len();
                probe.dropped = probe.received.saturating_sub(probe.kept);
                probe.sample_raw = payload.elements().first().cloned();
                probe.sample_normalized = records.into_iter().next();
            }
            Err(mismatch) => probe.mismatch = Some(mismatch.to_string()),
        }

        Ok(probe)
    }

    /// Refreshes once immediately, then every `REFRESH_PERIOD`, regardless
    /// of request traffic.
    pub fn spawn_periodic_refresh(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = time::interval(REFRESH_PERIOD);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                interval.tick().await;
                log::info!("🔄 Auto-refreshing vehicle positions...");
                if let Err(e) = this.refresh().await {
                    log::warn!("⚠️  Auto-refresh failed: {e}");
                }
            }
        })
    }
}
