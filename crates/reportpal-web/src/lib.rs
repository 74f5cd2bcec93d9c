//! Axum JSON surface exposing entity state to host-platform consumers.

use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use reportpal_core::{AttrMap, EntityDescriptor, EntityValue, XmlValue, ATTRIBUTION};
use reportpal_entities::{discover_entities, entity_state, forecast, resort_status};
use reportpal_sync::{DocumentSnapshot, FeedConfig};
use serde::Serialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::debug;

pub const CRATE_NAME: &str = "reportpal-web";

#[derive(Clone)]
pub struct AppState {
    receiver: watch::Receiver<Option<DocumentSnapshot>>,
    config: FeedConfig,
}

impl AppState {
    pub fn new(receiver: watch::Receiver<Option<DocumentSnapshot>>, config: FeedConfig) -> Self {
        Self { receiver, config }
    }

    fn snapshot(&self) -> Option<DocumentSnapshot> {
        self.receiver.borrow().clone()
    }
}

/// One entity in an API response. Failed extractions stay scoped to their own
/// row so a malformed branch of the document never blanks out the rest.
#[derive(Debug, Clone, Serialize)]
struct EntityRow {
    #[serde(flatten)]
    descriptor: EntityDescriptor,
    available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<EntityValue>,
    attributes: AttrMap,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/status", get(status_handler))
        .route("/api/entities", get(entities_handler))
        .route("/api/entities/{id}", get(entity_detail_handler))
        .route("/api/forecast", get(forecast_handler))
        .with_state(Arc::new(state))
}

pub fn port_from_env() -> u16 {
    std::env::var("REPORTPAL_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000)
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    let has_document = state.snapshot().is_some();
    Json(json!({ "status": "ok", "has_document": has_document })).into_response()
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Response {
    let Some(snapshot) = state.snapshot() else {
        return no_document();
    };
    match resort_status(&snapshot.document) {
        Ok(entity) => Json(json!({
            "value": entity.value,
            "attributes": entity.attributes,
            "attribution": ATTRIBUTION,
            "fetched_at": snapshot.fetched_at.to_rfc3339(),
        }))
        .into_response(),
        Err(err) => (
            StatusCode::BAD_GATEWAY,
            Json(json!({ "error": err.to_string() })),
        )
            .into_response(),
    }
}

async fn entities_handler(State(state): State<Arc<AppState>>) -> Response {
    let Some(snapshot) = state.snapshot() else {
        return no_document();
    };
    let rows: Vec<_> = discover_entities(&snapshot.document, state.config.discovery_options())
        .into_iter()
        .map(|descriptor| entity_row(&snapshot.document, descriptor))
        .collect();
    Json(rows).into_response()
}

async fn entity_detail_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<String>,
) -> Response {
    let Some(snapshot) = state.snapshot() else {
        return no_document();
    };
    let descriptor = discover_entities(&snapshot.document, state.config.discovery_options())
        .into_iter()
        .find(|descriptor| descriptor.unique_id == id);
    match descriptor {
        Some(descriptor) => Json(entity_row(&snapshot.document, descriptor)).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("no entity {id}") })),
        )
            .into_response(),
    }
}

async fn forecast_handler(State(state): State<Arc<AppState>>) -> Response {
    let Some(snapshot) = state.snapshot() else {
        return no_document();
    };
    Json(forecast(&snapshot.document)).into_response()
}

fn entity_row(document: &XmlValue, descriptor: EntityDescriptor) -> EntityRow {
    match entity_state(document, &descriptor.kind) {
        Ok(Some(state)) => EntityRow {
            descriptor,
            available: true,
            value: Some(state.value),
            attributes: state.attributes,
            error: None,
        },
        Ok(None) => EntityRow {
            descriptor,
            available: false,
            value: None,
            attributes: AttrMap::new(),
            error: None,
        },
        Err(err) => {
            debug!(entity = %descriptor.unique_id, error = %err, "entity read failed");
            EntityRow {
                descriptor,
                available: false,
                value: None,
                attributes: AttrMap::new(),
                error: Some(err.to_string()),
            }
        }
    }
}

fn no_document() -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({ "error": "no feed document fetched yet" })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use reportpal_feed::parse_document;
    use std::path::Path;
    use tower::ServiceExt;
    use uuid::Uuid;

    fn state_with_fixture() -> AppState {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/mtnxml/sample.xml");
        let bytes = std::fs::read(path).expect("read fixture feed");
        let document = Arc::new(parse_document(&bytes).expect("parse fixture feed"));
        let (_sender, receiver) = watch::channel(Some(DocumentSnapshot {
            run_id: Uuid::new_v4(),
            fetched_at: chrono::Utc::now(),
            document,
        }));
        AppState::new(receiver, FeedConfig::default())
    }

    fn empty_state() -> AppState {
        let (_sender, receiver) = watch::channel(None);
        AppState::new(receiver, FeedConfig::default())
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let value = serde_json::from_slice(&body).unwrap();
        (status, value)
    }

    #[tokio::test]
    async fn health_reports_document_presence() {
        let (status, body) = get_json(app(empty_state()), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["has_document"], json!(false));

        let (status, body) = get_json(app(state_with_fixture()), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["has_document"], json!(true));
    }

    #[tokio::test]
    async fn status_is_unavailable_before_the_first_refresh() {
        let (status, body) = get_json(app(empty_state()), "/api/status").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn status_reflects_the_current_document() {
        let (status, body) = get_json(app(state_with_fixture()), "/api/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["value"], json!(true));
        assert_eq!(body["attributes"]["open_time"], json!("9:00 AM"));
        assert_eq!(body["attribution"], json!(ATTRIBUTION));
    }

    #[tokio::test]
    async fn entities_list_includes_fixed_and_discovered_rows() {
        let (status, body) = get_json(app(state_with_fixture()), "/api/entities").await;
        assert_eq!(status, StatusCode::OK);
        let rows = body.as_array().expect("rows");
        assert!(rows
            .iter()
            .any(|row| row["unique_id"] == json!("reportpal_resort_open")));
        assert!(rows
            .iter()
            .any(|row| row["unique_id"] == json!("reportpal_lift_ramcharger_8")));
        assert!(rows.iter().all(|row| row["available"] == json!(true)));
    }

    #[tokio::test]
    async fn a_malformed_branch_does_not_blank_out_other_entities() {
        // No currentConditions block: the summary-backed sensors fail while
        // lifts and resort status keep reading.
        let document = Arc::new(
            parse_document(
                b"<report><operations resortStatus=\"Open\"/><facilities><areas>\
                  <area name=\"A\"><lifts><lift name=\"L\" status=\"Open\" type=\"Quad\"/></lifts></area>\
                  </areas></facilities></report>",
            )
            .expect("parse"),
        );
        let (_sender, receiver) = watch::channel(Some(DocumentSnapshot {
            run_id: Uuid::new_v4(),
            fetched_at: chrono::Utc::now(),
            document,
        }));
        let state = AppState::new(receiver, FeedConfig::default());

        let (status, body) = get_json(app(state), "/api/entities").await;
        assert_eq!(status, StatusCode::OK);
        let rows = body.as_array().expect("rows");
        let by_id = |id: &str| {
            rows.iter()
                .find(|row| row["unique_id"] == json!(id))
                .unwrap_or_else(|| panic!("missing row {id}"))
        };
        assert_eq!(by_id("reportpal_resort_open")["available"], json!(true));
        assert_eq!(by_id("reportpal_lift_l")["available"], json!(true));
        let parks = by_id("reportpal_terrain_parks");
        assert_eq!(parks["available"], json!(false));
        assert!(parks["error"].is_string());
    }

    #[tokio::test]
    async fn entity_detail_resolves_ids_or_404s() {
        let (status, body) =
            get_json(app(state_with_fixture()), "/api/entities/reportpal_tram").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["value"], json!("Open"));
        assert_eq!(body["attributes"]["skier_wait_time"], json!("15"));

        let (status, _) =
            get_json(app(state_with_fixture()), "/api/entities/reportpal_lift_nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn forecast_returns_the_canonical_sequence() {
        let (status, body) = get_json(app(state_with_fixture()), "/api/forecast").await;
        assert_eq!(status, StatusCode::OK);
        let days = body.as_array().expect("days");
        assert_eq!(days.len(), 3);
        assert_eq!(days[0]["condition"], json!("snowy"));
    }
}
