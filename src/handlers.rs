// HTTP handlers for the vehicle API.

use std::sync::Arc;

use actix_web::{HttpRequest, HttpResponse, web};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::models::{self, PositionRow, VehicleRecord};
use crate::orchestrator::{RefreshOrchestrator, VehiclesOutcome};
use crate::store::PositionFilter;

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<RefreshOrchestrator>,
    pub display_tz: Tz,
}

// ============================================================================
// Response envelopes
// ============================================================================

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ApiResponse<T> {
    success: bool,
    data: T,
    count: usize,
    timestamp: i64,
}

impl<T: Serialize> ApiResponse<Vec<T>> {
    fn list(data: Vec<T>) -> Self {
        ApiResponse {
            success: true,
            count: data.len(),
            data,
            timestamp: Utc::now().timestamp(),
        }
    }
}

#[derive(Serialize)]
struct ApiError {
    success: bool,
    error: String,
    message: String,
}

impl ApiError {
    fn new(error: &str, message: impl ToString) -> Self {
        ApiError {
            success: false,
            error: error.to_string(),
            message: message.to_string(),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BusesResponse<T> {
    success: bool,
    data: Vec<T>,
    cached: bool,
    source: &'static str,
    last_updated: DateTime<Utc>,
    count: usize,
}

impl<T: Serialize> BusesResponse<T> {
    fn new(data: Vec<T>, cached: bool, source: &'static str, last_updated: DateTime<Utc>) -> Self {
        BusesResponse {
            success: true,
            count: data.len(),
            data,
            cached,
            source,
            last_updated,
        }
    }
}

// ============================================================================
// Query parameters
// ============================================================================

// Everything arrives as text so a malformed value degrades to "no filter"
// instead of a 400.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusFilterParams {
    pub routes: Option<String>,
    pub bus_number: Option<String>,
}

impl BusFilterParams {
    pub fn to_filter(&self) -> PositionFilter {
        let routes: Vec<String> = self
            .routes
            .as_deref()
            .map(|csv| {
                csv.split(',')
                    .map(str::trim)
                    .filter(|r| !r.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        PositionFilter {
            routes: (!routes.is_empty()).then_some(routes),
            vehicle: self
                .bus_number
                .as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(String::from),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct StopsParams {
    pub limit: Option<String>,
}

fn lenient_query<T: for<'de> Deserialize<'de> + Default>(req: &HttpRequest) -> T {
    web::Query::<T>::from_query(req.query_string())
        .map(web::Query::into_inner)
        .unwrap_or_default()
}

// ============================================================================
// Vehicles
// ============================================================================

pub async fn get_buses(state: web::Data<AppState>) -> HttpResponse {
    match state.orchestrator.current_vehicles().await {
        Ok(VehiclesOutcome::Fresh(snapshot)) => HttpResponse::Ok().json(BusesResponse::new(
            snapshot.batch.clone(),
            true,
            "cache",
            snapshot.fetched_at,
        )),
        Ok(VehiclesOutcome::Refreshed(snapshot)) => HttpResponse::Ok().json(BusesResponse::new(
            snapshot.batch.clone(),
            false,
            "live",
            snapshot.fetched_at,
        )),
        Ok(VehiclesOutcome::StaleFallback { snapshot, cause }) => {
            log::debug!("Answering /api/buses from stale cache after: {cause}");
            HttpResponse::Ok().json(BusesResponse::new(
                snapshot.batch.clone(),
                true,
                "stale-cache",
                snapshot.fetched_at,
            ))
        }
        Ok(VehiclesOutcome::StoreFallback { rows, cause }) => {
            log::debug!("Answering /api/buses from the position store after: {cause}");
            let last_updated = rows.iter().map(|r| r.inserted_at).max().unwrap_or_else(Utc::now);
            let data: Vec<VehicleRecord> = rows.into_iter().map(|r| r.record).collect();
            HttpResponse::Ok().json(BusesResponse::new(data, true, "database", last_updated))
        }
        Err(e) => {
            log::error!("❌ No vehicle data available: {e}");
            HttpResponse::InternalServerError()
                .json(ApiError::new("Failed to fetch bus data", &e))
        }
    }
}

pub async fn get_filtered_buses(state: web::Data<AppState>, req: HttpRequest) -> HttpResponse {
    let params: BusFilterParams = lenient_query(&req);
    let filter = params.to_filter();

    let store = Arc::clone(state.orchestrator.store());
    match store.run(move |s| s.query_recent(&filter)).await {
        Ok(rows) => HttpResponse::Ok().json(ApiResponse::<Vec<PositionRow>>::list(rows)),
        Err(e) => {
            log::error!("❌ Filtered position query failed: {e}");
            HttpResponse::InternalServerError()
                .json(ApiError::new("Failed to query bus positions", &e))
        }
    }
}

pub async fn force_refresh(state: web::Data<AppState>) -> HttpResponse {
    log::info!("🔄 Manual refresh requested...");

    match state.orchestrator.refresh().await {
        Ok(snapshot) => HttpResponse::Ok().json(serde_json::json!({
            "success": true,
            "count": snapshot.batch.len(),
            "lastUpdated": snapshot.fetched_at,
        })),
        Err(e) => {
            log::warn!("⚠️  Manual refresh failed: {e}");
            HttpResponse::BadGateway().json(ApiError::new("Refresh failed", &e))
        }
    }
}

// ============================================================================
// Reference data
// ============================================================================

pub async fn get_routes(state: web::Data<AppState>) -> HttpResponse {
    let store = Arc::clone(state.orchestrator.store());
    match store.run(|s| s.routes()).await {
        Ok(routes) => HttpResponse::Ok().json(ApiResponse::list(routes)),
        Err(e) => {
            log::error!("❌ Route query failed: {e}");
            HttpResponse::InternalServerError().json(ApiError::new("Failed to fetch routes", &e))
        }
    }
}

pub async fn get_stops(state: web::Data<AppState>, req: HttpRequest) -> HttpResponse {
    let params: StopsParams = lenient_query(&req);
    let limit = params.limit.and_then(|l| l.trim().parse::<usize>().ok());

    let store = Arc::clone(state.orchestrator.store());
    match store.run(move |s| s.stops(limit)).await {
        Ok(stops) => HttpResponse::Ok().json(ApiResponse::list(stops)),
        Err(e) => {
            log::error!("❌ Stop query failed: {e}");
            HttpResponse::InternalServerError().json(ApiError::new("Failed to fetch stops", &e))
        }
    }
}

// ============================================================================
// Health & diagnostics
// ============================================================================

/// `GET /api/health`. Always 200; `status` reports degradation.
pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let now = Utc::now();
    let snapshot = state.orchestrator.cache().read();
    let upstream = state.orchestrator.upstream_status();

    let fresh = state.orchestrator.cache().is_fresh(now);
    let cache = match &snapshot {
        Some(s) => serde_json::json!({
            "present": true,
            "fresh": fresh,
            "ageSeconds": s.age(now).num_seconds(),
            "count": s.batch.len(),
            "lastUpdated": s.fetched_at,
            "lastUpdatedLocal": models::format_timestamp_full(s.fetched_at, state.display_tz),
        }),
        None => serde_json::json!({
            "present": false,
            "fresh": false,
            "ageSeconds": null,
            "count": 0,
            "lastUpdated": null,
            "lastUpdatedLocal": null,
        }),
    };

    let status = if fresh && upstream.consecutive_failures == 0 {
        "healthy"
    } else {
        "degraded"
    };

    HttpResponse::Ok().json(serde_json::json!({
        "success": true,
        "status": status,
        "service": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "cache": cache,
        "upstream": upstream,
        "timestamp": now.timestamp(),
    }))
}

pub async fn test_upstream(state: web::Data<AppState>) -> HttpResponse {
    match state.orchestrator.probe_upstream().await {
        Ok(probe) => HttpResponse::Ok().json(serde_json::json!({
            "success": true,
            "data": probe,
        })),
        Err(e) => {
            log::warn!("⚠️  Upstream probe failed: {e}");
            HttpResponse::BadGateway().json(ApiError::new("Upstream request failed", &e))
        }
    }
}

pub async fn debug_database(state: web::Data<AppState>) -> HttpResponse {
    let store = Arc::clone(state.orchestrator.store());
    match store.run(|s| s.stats()).await {
        Ok(stats) => HttpResponse::Ok().json(serde_json::json!({
            "success": true,
            "data": stats,
        })),
        Err(e) => {
            log::error!("❌ Store stats query failed: {e}");
            HttpResponse::InternalServerError()
                .json(ApiError::new("Failed to inspect database", &e))
        }
    }
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api")
            .route("/buses", web::get().to(get_buses))
            .route("/buses/filtered", web::get().to(get_filtered_buses))
            .route("/buses/refresh", web::post().to(force_refresh))
            .route("/routes", web::get().to(get_routes))
            .route("/stops", web::get().to(get_stops))
            .route("/health", web::get().to(health_check))
            .route("/test-metrobus", web::get().to(test_upstream))
            .route("/debug/database", web::get().to(debug_database)),
    );
}
