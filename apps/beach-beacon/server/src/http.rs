use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use beach_beacon_core::{
    BroadcastHub, ConnectionInfo, Event, Frame, HubError, MatchMode, PollGateway, PollOutcome,
    PollResponse, Publication, RefreshNotice,
};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::sync::mpsc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::warn;
use uuid::Uuid;

use crate::stream::{event_stream, ConnectionGuard};
use crate::telemetry::names;

pub struct AppState {
    pub hub: BroadcastHub,
    pub gateway: PollGateway,
    pub channel_depth: usize,
    pub metrics: PrometheusHandle,
}

impl AppState {
    pub fn new(hub: BroadcastHub, channel_depth: usize, metrics: PrometheusHandle) -> Self {
        Self {
            gateway: PollGateway::new(hub.clone()),
            hub,
            channel_depth,
            metrics,
        }
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    // The event stream sets its own CORS header; the permissive layer would
    // append a second one.
    let push_routes = Router::new()
        .route("/events", get(events_handler))
        .with_state(state.clone());

    let api_routes = Router::new()
        .route("/poll", get(poll_handler))
        .route("/refresh", post(refresh_handler))
        .route("/clients", get(clients_handler))
        .route("/healthz", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
        .layer(CorsLayer::permissive());

    Router::new()
        .merge(push_routes)
        .merge(api_routes)
        .layer(TraceLayer::new_for_http())
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(&'static str),
    #[error(transparent)]
    Hub(#[from] HubError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Hub(HubError::Handshake { .. }) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Hub(HubError::Frame(_)) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            warn!(error = %self, "request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    #[serde(rename = "clientId")]
    client_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PollQuery {
    #[serde(rename = "sinceId")]
    since_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RefreshRequest {
    url: String,
    #[serde(default, rename = "match")]
    match_mode: MatchMode,
    #[serde(default)]
    action: Option<String>,
}

#[derive(Debug, Serialize)]
struct RefreshResponse {
    event: Event,
    delivered: usize,
    evicted: usize,
    connections: usize,
}

#[derive(Debug, Serialize)]
struct ClientsResponse {
    count: usize,
    clients: Vec<ConnectionInfo>,
}

async fn events_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<EventsQuery>,
) -> Result<Response, ApiError> {
    let client_id = query
        .client_id
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let (tx, rx) = mpsc::channel::<Frame>(state.channel_depth);
    let connection = state.hub.register(client_id, tx)?;

    counter!(names::CONNECTIONS_TOTAL, 1);
    gauge!(names::CONNECTIONS_ACTIVE, state.hub.count() as f64);

    let guard = ConnectionGuard::new(state.hub.clone(), connection);
    Ok(event_stream(rx, guard))
}

async fn poll_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PollQuery>,
) -> Json<PollResponse> {
    let outcome = state.gateway.poll(query.since_id.as_deref().unwrap_or(""));
    let label = match outcome {
        PollOutcome::Update(_) => "update",
        PollOutcome::NoUpdate => "none",
    };
    counter!(names::POLLS_TOTAL, 1, "outcome" => label);
    Json(PollResponse::from(outcome))
}

async fn refresh_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RefreshRequest>,
) -> Result<Json<RefreshResponse>, ApiError> {
    let url = request.url.trim();
    if url.is_empty() {
        return Err(ApiError::BadRequest("url must not be empty"));
    }

    let mut notice = RefreshNotice::new(url, request.match_mode);
    if let Some(action) = request.action.filter(|action| !action.trim().is_empty()) {
        notice = notice.with_action(action);
    }

    let publication = state.hub.broadcast(notice)?;
    record_publication(&publication);

    Ok(Json(RefreshResponse {
        delivered: publication.report.delivered,
        evicted: publication.report.evicted.len(),
        connections: publication.connections,
        event: publication.event,
    }))
}

async fn clients_handler(State(state): State<Arc<AppState>>) -> Json<ClientsResponse> {
    let clients = state.hub.list();
    Json(ClientsResponse {
        count: clients.len(),
        clients,
    })
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({ "status": "ok", "connections": state.hub.count() }))
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

fn record_publication(publication: &Publication) {
    let report = &publication.report;
    counter!(
        names::EVENTS_PUBLISHED,
        1,
        "match" => publication.event.match_mode.as_str()
    );
    counter!(names::DELIVERIES_TOTAL, report.delivered as u64);
    for eviction in &report.evicted {
        counter!(
            names::EVICTIONS_TOTAL,
            1,
            "reason" => eviction.reason.metric_label()
        );
    }
    histogram!(names::BROADCAST_FANOUT, report.attempted as f64);
    gauge!(names::CONNECTIONS_ACTIVE, publication.connections as f64);
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{self, Body};
    use axum::http::Request;
    use beach_beacon_core::HubConfig;
    use std::time::Duration;
    use futures_util::StreamExt;
    use metrics_exporter_prometheus::PrometheusBuilder;
    use serde_json::Value;
    use tower::ServiceExt;

    fn test_state() -> Arc<AppState> {
        let handle = PrometheusBuilder::new().build_recorder().handle();
        Arc::new(AppState::new(BroadcastHub::default(), 8, handle))
    }

    async fn get_json(app: &Router, uri: &str) -> (StatusCode, Value) {
        let response = app
            .clone()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    async fn post_refresh(app: &Router, body: Value) -> (StatusCode, Value) {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/refresh")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    async fn open_stream(app: &Router, uri: &str) -> Response {
        app.clone()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    #[test_timeout::tokio_timeout_test]
    async fn poll_round_trip_through_http() {
        let app = build_router(test_state());

        let (status, body) = get_json(&app, "/poll").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "type": "none" }));

        let (status, published) =
            post_refresh(&app, json!({ "url": "https://x/y", "match": "exact" })).await;
        assert_eq!(status, StatusCode::OK);
        let id = published["event"]["id"].as_str().unwrap().to_string();
        assert_eq!(published["event"]["resourceUrl"], "https://x/y");
        assert_eq!(published["delivered"], 0);

        let (_, body) = get_json(&app, "/poll?sinceId=").await;
        assert_eq!(body["type"], "refresh");
        assert_eq!(body["id"], id.as_str());
        assert_eq!(body["url"], "https://x/y");
        assert_eq!(body["match"], "exact");

        let (_, body) = get_json(&app, &format!("/poll?sinceId={id}")).await;
        assert_eq!(body, json!({ "type": "none" }));

        let (_, published) =
            post_refresh(&app, json!({ "url": "https://x/z", "match": "prefix" })).await;
        let (_, body) = get_json(&app, &format!("/poll?sinceId={id}")).await;
        assert_eq!(body["id"], published["event"]["id"]);
        assert_eq!(body["match"], "prefix");
    }

    #[test_timeout::tokio_timeout_test]
    async fn refresh_rejects_an_empty_url() {
        let app = build_router(test_state());
        let (status, body) = post_refresh(&app, json!({ "url": "   " })).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "url must not be empty");
    }

    #[test_timeout::tokio_timeout_test]
    async fn event_stream_delivers_connected_then_refresh() {
        let state = test_state();
        let app = build_router(state.clone());

        let response = open_stream(&app, "/events?clientId=c1").await;
        assert_eq!(response.status(), StatusCode::OK);
        let headers = response.headers();
        assert_eq!(headers[header::CONTENT_TYPE], "text/event-stream");
        assert_eq!(headers[header::CACHE_CONTROL], "no-cache");
        assert_eq!(headers[header::CONNECTION], "keep-alive");
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");

        let mut frames = response.into_body().into_data_stream();
        let hello = frames.next().await.unwrap().unwrap();
        assert!(hello.starts_with(b"event: connected\ndata: {\"clientId\":\"c1\""));

        let (_, published) = post_refresh(
            &app,
            json!({ "url": "https://x/y", "action": "reload" }),
        )
        .await;
        assert_eq!(published["delivered"], 1);

        let refresh = frames.next().await.unwrap().unwrap();
        let text = std::str::from_utf8(&refresh).unwrap();
        assert!(text.starts_with("event: refresh\ndata: {\"action\":\"reload\",\"url\":\"https://x/y\""));

        let (_, clients) = get_json(&app, "/clients").await;
        assert_eq!(clients["count"], 1);
        assert_eq!(clients["clients"][0]["id"], "c1");
        assert!(clients["clients"][0]["connectedAt"].is_string());

        drop(frames);
        assert_eq!(state.hub.count(), 0);
    }

    #[test_timeout::tokio_timeout_test]
    async fn duplicate_client_id_closes_the_older_stream() {
        let state = test_state();
        let app = build_router(state.clone());

        let first = open_stream(&app, "/events?clientId=c1").await;
        let mut first = first.into_body().into_data_stream();
        assert!(first.next().await.is_some());

        let second = open_stream(&app, "/events?clientId=c1").await;
        let mut second = second.into_body().into_data_stream();
        assert!(second.next().await.is_some());

        assert!(first.next().await.is_none());
        drop(first);
        assert_eq!(state.hub.count(), 1);

        state.hub.publish("https://x/y", MatchMode::Exact).unwrap();
        let refresh = second.next().await.unwrap().unwrap();
        assert!(refresh.starts_with(b"event: refresh\n"));
    }

    #[test_timeout::tokio_timeout_test]
    async fn missing_client_id_gets_a_generated_one() {
        let state = test_state();
        let app = build_router(state.clone());

        let response = open_stream(&app, "/events").await;
        let mut frames = response.into_body().into_data_stream();
        let hello = frames.next().await.unwrap().unwrap();
        let text = std::str::from_utf8(&hello).unwrap();
        let data = text.lines().nth(1).unwrap().strip_prefix("data: ").unwrap();
        let payload: Value = serde_json::from_str(data).unwrap();
        let client_id = payload["clientId"].as_str().unwrap();

        assert!(Uuid::parse_str(client_id).is_ok());
        assert_eq!(state.hub.list()[0].id, client_id);
    }

    #[test_timeout::tokio_timeout_test(10, paused)]
    async fn event_stream_carries_heartbeat_comments() {
        let handle = PrometheusBuilder::new().build_recorder().handle();
        let hub = BroadcastHub::new(HubConfig {
            heartbeat_interval: Duration::from_secs(5),
        });
        let app = build_router(Arc::new(AppState::new(hub, 8, handle)));

        let response = open_stream(&app, "/events?clientId=c1").await;
        let mut frames = response.into_body().into_data_stream();
        let hello = frames.next().await.unwrap().unwrap();
        assert!(hello.starts_with(b"event: connected\n"));

        let beat = frames.next().await.unwrap().unwrap();
        assert_eq!(&beat[..], b": heartbeat\n\n");
    }

    #[test_timeout::tokio_timeout_test]
    async fn health_reports_connection_count() {
        let state = test_state();
        let app = build_router(state.clone());
        let (status, body) = get_json(&app, "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "status": "ok", "connections": 0 }));
    }
}
