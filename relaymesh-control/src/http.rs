/**
 * RELAYMESH REST API - control plane HTTP server
 *
 * ROLE:
 * Receives agent heartbeats and exposes node ranking to clients.
 *
 * ROUTES:
 * - POST /api/v1/node/heartbeat       agent telemetry (x-node-secret)
 * - GET  /api/v1/nodes/ranked         nodes by ai_score, ?jitter=true for load spread
 * - PUT  /api/v1/nodes/{id}/load      operator load factor (x-api-key)
 * - POST /api/v1/scheduler/run        manual scoring pass (x-api-key)
 * - GET  /health, /system/health      liveness and counters
 *
 * SECURITY:
 * - Admin routes check x-api-key in a route layer; no key configured = denied
 * - Heartbeats authenticate per node, see ingest.rs
 */

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use time::OffsetDateTime;

use crate::error::{ControlError, Result};
use crate::health::ControlHealth;
use crate::ingest::{ingest_heartbeat, secrets_match};
use crate::models::HeartbeatIn;
use crate::scheduler::PassReport;
use crate::selection::{rank_by_score, rank_with_jitter, RankInput, RankedNode};
use crate::state::AppState;
use crate::store::ScoreStore;

pub fn build_router(app_state: AppState) -> Router {
    let admin = Router::new()
        .route("/api/v1/nodes/{id}/load", put(set_load_factor))
        .route("/api/v1/scheduler/run", post(run_scheduler))
        .route_layer(middleware::from_fn_with_state(app_state.clone(), require_api_key));

    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/system/health", get(get_system_health))
        .route("/api/v1/node/heartbeat", post(post_heartbeat))
        .route("/api/v1/nodes/ranked", get(get_ranked))
        .merge(admin)
        .with_state(app_state)
}

async fn require_api_key(
    State(app): State<AppState>,
    req: Request,
    next: Next,
) -> std::result::Result<Response, StatusCode> {
    let presented = req.headers().get("x-api-key").and_then(|v| v.to_str().ok());
    if !api_key_ok(app.cfg.api_key.as_deref(), presented) {
        tracing::warn!(path = %req.uri().path(), "admin request without valid api key");
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

fn api_key_ok(expected: Option<&str>, presented: Option<&str>) -> bool {
    match (expected, presented) {
        (Some(expected), Some(presented)) if !expected.is_empty() => {
            secrets_match(expected, presented)
        }
        _ => false,
    }
}

// POST /api/v1/node/heartbeat
async fn post_heartbeat(
    State(app): State<AppState>,
    headers: HeaderMap,
    payload: std::result::Result<Json<HeartbeatIn>, JsonRejection>,
) -> Result<Json<serde_json::Value>> {
    let result = payload
        .map_err(|e| ControlError::Validation(e.body_text()))
        .and_then(|Json(report)| {
            let secret = headers.get("x-node-secret").and_then(|v| v.to_str().ok());
            ingest_heartbeat(&app.store, &app.cfg, secret, &report, OffsetDateTime::now_utc())
        });

    app.health_tracker.record_heartbeat(result.is_ok());
    let stored = result?;
    Ok(Json(serde_json::json!({ "ok": true, "stored": stored })))
}

#[derive(Debug, Default, Deserialize)]
struct RankedParams {
    #[serde(default)]
    jitter: bool,
}

// GET /api/v1/nodes/ranked
async fn get_ranked(
    State(app): State<AppState>,
    Query(params): Query<RankedParams>,
) -> Result<Json<Vec<RankedNode>>> {
    let now = OffsetDateTime::now_utc();
    let window = time::Duration::minutes(app.cfg.retention.window_minutes as i64);
    let nodes = app.store.active_nodes()?;
    let latencies = app.store.mean_latency_since(now - window)?;

    let input = RankInput {
        nodes,
        latencies: &latencies,
        now,
        heartbeat_timeout: time::Duration::seconds(app.cfg.heartbeat_timeout_secs as i64),
    };
    let ranked = if params.jitter {
        rank_with_jitter(&input, &app.cfg.selection, &mut rand::rng())
    } else {
        rank_by_score(&input)
    };
    Ok(Json(ranked))
}

#[derive(Debug, Deserialize)]
struct LoadIn {
    load_factor: f64,
}

// PUT /api/v1/nodes/{id}/load
async fn set_load_factor(
    State(app): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<LoadIn>,
) -> Result<Json<serde_json::Value>> {
    app.store.set_load_factor(&id, body.load_factor)?;
    tracing::info!(node = %id, load_factor = body.load_factor, "load factor updated");
    Ok(Json(serde_json::json!({ "ok": true, "node_id": id, "load_factor": body.load_factor })))
}

// POST /api/v1/scheduler/run
async fn run_scheduler(State(app): State<AppState>) -> Result<Json<PassReport>> {
    let report = app.scheduler.run_now().await?;
    Ok(Json(report))
}

async fn get_system_health(State(app): State<AppState>) -> Result<Json<ControlHealth>> {
    let timeout = time::Duration::seconds(app.cfg.heartbeat_timeout_secs as i64);
    let health = app.health_tracker.get_health(&app.store, &app.scheduler, timeout)?;
    Ok(Json(health))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::HealthTracker;
    use crate::ingest::tests::{fixture, report};
    use crate::scheduler::ScoringScheduler;
    use crate::store::ScoreUpdate;
    use axum::http::HeaderValue;
    use axum::response::IntoResponse;
    use std::sync::Arc;

    fn app() -> AppState {
        let (store, cfg) = fixture();
        let store = Arc::new(store);
        let scheduler = ScoringScheduler::new(store.clone(), &cfg).manual();
        AppState {
            store,
            cfg: Arc::new(cfg),
            health_tracker: HealthTracker::new(),
            scheduler,
        }
    }

    fn secret_headers(secret: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("x-node-secret", HeaderValue::from_str(secret).unwrap());
        headers
    }

    #[tokio::test]
    async fn test_heartbeat_accepted_and_counted() {
        let app = app();
        let Json(body) = post_heartbeat(
            State(app.clone()),
            secret_headers("s3cret"),
            Ok(Json(report("hk-01"))),
        )
        .await
        .unwrap();

        assert_eq!(body["ok"], true);
        assert_eq!(body["stored"], 1);
        let Json(health) = get_system_health(State(app)).await.unwrap();
        assert_eq!(health.heartbeats_accepted, 1);
        assert_eq!(health.samples_stored, 1);
    }

    #[tokio::test]
    async fn test_heartbeat_bad_secret_is_401() {
        let app = app();
        let err = post_heartbeat(State(app.clone()), secret_headers("nope"), Ok(Json(report("hk-01"))))
            .await
            .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::UNAUTHORIZED);
        assert_eq!(app.store.sample_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_ranked_orders_by_score() {
        let app = app();
        app.store
            .upsert_node("sg-01", &crate::store::tests::node_conf("SG-01", 0.0))
            .unwrap();
        app.store
            .commit_scores(
                &[
                    ScoreUpdate { node_id: "hk-01".into(), ai_score: 40.0 },
                    ScoreUpdate { node_id: "sg-01".into(), ai_score: 75.5 },
                ],
                OffsetDateTime::now_utc(),
            )
            .unwrap();

        let Json(ranked) =
            get_ranked(State(app.clone()), Query(RankedParams::default())).await.unwrap();
        let ids: Vec<_> = ranked.iter().map(|r| r.id.as_str()).collect();
        // the inactive fixture node is never offered
        assert_eq!(ids, vec!["sg-01", "hk-01"]);
        assert!(ranked.iter().all(|r| r.selection_score.is_none()));

        let Json(jittered) =
            get_ranked(State(app), Query(RankedParams { jitter: true })).await.unwrap();
        assert_eq!(jittered.len(), 2);
        assert!(jittered.iter().all(|r| r.selection_score.is_some()));
    }

    #[tokio::test]
    async fn test_set_load_factor_route() {
        let app = app();
        let Json(body) =
            set_load_factor(State(app.clone()), Path("hk-01".into()), Json(LoadIn { load_factor: 0.6 }))
                .await
                .unwrap();
        assert_eq!(body["ok"], true);
        assert_eq!(body["load_factor"], 0.6);
        assert_eq!(app.store.get_node("hk-01").unwrap().unwrap().load_factor, 0.6);

        let err = set_load_factor(State(app), Path("hk-01".into()), Json(LoadIn { load_factor: 2.0 }))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn test_manual_run_scores_nodes() {
        let app = app();
        let Json(ack) =
            post_heartbeat(State(app.clone()), secret_headers("s3cret"), Ok(Json(report("hk-01"))))
                .await
                .unwrap();
        assert_eq!(ack["stored"], 1);

        let Json(pass) = run_scheduler(State(app.clone())).await.unwrap();
        assert_eq!(pass.scored, 1);
        assert!(app.store.get_node("hk-01").unwrap().unwrap().ai_score > 0.0);
    }

    #[test]
    fn test_api_key_check() {
        assert!(api_key_ok(Some("k"), Some("k")));
        assert!(!api_key_ok(Some("k"), Some("x")));
        assert!(!api_key_ok(Some("k"), None));
        assert!(!api_key_ok(None, Some("k")));
        assert!(!api_key_ok(Some(""), Some("")));
    }
}
