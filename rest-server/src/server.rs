use crate::api::{
    HealthResponse, OnlineReadRequest, OnlineReadResponse, OnlineWriteRequest, OnlineWriteResponse,
};
use anyhow::{Result, anyhow};
use axum::{
    Json, Router,
    extract::{State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use axum_prometheus::PrometheusMetricLayer;
use axum_server::tls_rustls::RustlsConfig;
use hybrid_store_core::HybridOnlineStore;
use hybrid_store_core::error::StoreError;
use serde::Serialize;
use std::net::SocketAddr;
use std::net::ToSocketAddrs;
use std::sync::Arc;

#[derive(Clone)]
pub struct HybridStoreServer {
    store: Arc<HybridOnlineStore>,
}

impl HybridStoreServer {
    pub fn new(store: Arc<HybridOnlineStore>) -> Self {
        Self { store }
    }
}

pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub tls_enabled: bool,
    pub tls_cert_path: Option<String>,
    pub tls_key_path: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6566,
            tls_enabled: false,
            tls_cert_path: None,
            tls_key_path: None,
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    message: String,
}

#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn bad_request(err: anyhow::Error) -> Self {
        Self::new(StatusCode::BAD_REQUEST, err.to_string())
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        Self::new(rejection.status(), rejection.body_text())
    }
}

/// Caller mistakes are 400, unreachable backends 503, partial writes 502.
pub fn status_for(err: &StoreError) -> StatusCode {
    match err {
        StoreError::UnroutableViews { .. }
        | StoreError::Schema { .. }
        | StoreError::UnknownBackend { .. } => StatusCode::BAD_REQUEST,
        StoreError::PartialWrite(_) => StatusCode::BAD_GATEWAY,
        StoreError::BackendClosed { .. } => StatusCode::SERVICE_UNAVAILABLE,
        err if err.is_retryable() => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        Self::new(status_for(&err), err.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status;
        let body = Json(ErrorResponse {
            message: self.message,
        });
        (status, body).into_response()
    }
}

pub fn router(server: HybridStoreServer, metrics_enabled: bool) -> Router {
    let mut app = Router::new()
        .route("/online-read", post(handle_online_read))
        .route("/online-write", post(handle_online_write))
        .route("/health", get(handle_health))
        .with_state(server);
    let trace = tower_http::trace::TraceLayer::new_for_http();
    app = app.layer(trace);
    if metrics_enabled {
        let (prometheus_layer, metric_handle) = PrometheusMetricLayer::pair();
        app = app
            .route("/metrics", get(|| async move { metric_handle.render() }))
            .layer(prometheus_layer)
    }
    app
}

pub async fn start_server(
    server_config: ServerConfig,
    store: Arc<HybridOnlineStore>,
    metrics_enabled: bool,
    shutdown_handler: axum_server::Handle,
) -> Result<()> {
    let app = router(HybridStoreServer::new(store), metrics_enabled);

    let addr: SocketAddr = format!("{}:{}", server_config.host, server_config.port)
        .to_socket_addrs()?
        .next()
        .ok_or(anyhow!("Cannot resolve host"))?;

    tracing::info!(
        "Server listening on {}:{}",
        server_config.host,
        server_config.port
    );
    if server_config.tls_enabled {
        let cert_path = server_config
            .tls_cert_path
            .ok_or(anyhow!("TLS is enabled but cert path is not provided"))?;
        let key_path = server_config
            .tls_key_path
            .ok_or(anyhow!("TLS is enabled but key path is not provided"))?;
        let rustls_config = RustlsConfig::from_pem_file(cert_path, key_path)
            .await
            .map_err(|e| anyhow!("Failed to load TLS config: {}", e))?;
        axum_server::bind_rustls(addr, rustls_config)
            .handle(shutdown_handler)
            .serve(app.into_make_service())
            .await?;
    } else {
        axum_server::bind(addr)
            .handle(shutdown_handler)
            .serve(app.into_make_service())
            .await?;
    }
    Ok(())
}

async fn handle_online_read(
    State(server): State<HybridStoreServer>,
    payload: Result<Json<OnlineReadRequest>, JsonRejection>,
) -> Result<Json<OnlineReadResponse>, AppError> {
    let Json(request) = payload?;
    let entity_keys = request.entity_keys().map_err(AppError::bad_request)?;
    let features = request.feature_refs().map_err(AppError::bad_request)?;
    let rows = server.store.online_read(entity_keys, &features).await?;
    Ok(Json(OnlineReadResponse::build(&request, &features, rows)))
}

async fn handle_online_write(
    State(server): State<HybridStoreServer>,
    payload: Result<Json<OnlineWriteRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<OnlineWriteResponse>), AppError> {
    let Json(request) = payload?;
    let rows = request.into_rows(&server.store);
    match server.store.online_write(rows).await {
        Ok(report) => Ok((StatusCode::OK, Json(OnlineWriteResponse::from(&report)))),
        Err(StoreError::PartialWrite(report)) => {
            let mut response = OnlineWriteResponse::from(&report);
            let err = StoreError::PartialWrite(report);
            response.message = Some(err.to_string());
            Ok((status_for(&err), Json(response)))
        }
        Err(err) => Err(err.into()),
    }
}

async fn handle_health(
    State(server): State<HybridStoreServer>,
) -> (StatusCode, Json<HealthResponse>) {
    let health = HealthResponse::from_checks(server.store.health_check().await);
    let status = if health.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(health))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use hybrid_store_core::config::RepoConfig;
    use serde_json::{Value as JsonValue, json};

    const REPO_YAML: &str = r#"
project: rest
online_store:
  default_backend: hot
  backends:
    hot:
      type: memory
    cold:
      type: memory
  bindings:
    driver_history: cold
feature_views:
  - name: driver_stats
    features:
      - name: conv_rate
        dtype: double
      - name: trips
        dtype: int32
"#;

    fn server() -> HybridStoreServer {
        let config = RepoConfig::from_yaml_str(REPO_YAML).unwrap();
        let store = HybridOnlineStore::from_config(&config, None).unwrap();
        HybridStoreServer::new(Arc::new(store))
    }

    async fn body_json(response: Response) -> JsonValue {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn write_request(body: JsonValue) -> Result<Json<OnlineWriteRequest>, JsonRejection> {
        Ok(Json(serde_json::from_value(body).unwrap()))
    }

    fn read_request(body: JsonValue) -> Result<Json<OnlineReadRequest>, JsonRejection> {
        Ok(Json(serde_json::from_value(body).unwrap()))
    }

    #[tokio::test]
    async fn write_then_read() {
        let server = server();
        let response = handle_online_write(
            State(server.clone()),
            write_request(json!({
                "rows": [
                    {
                        "feature_view": "driver_stats",
                        "entities": {"driver_id": 1001},
                        "features": {"conv_rate": 1, "trips": 12},
                        "event_timestamp": "2025-01-01T00:00:00Z"
                    },
                    {
                        "feature_view": "driver_history",
                        "entities": {"driver_id": 1001},
                        "features": {"last_city": "Lisbon"}
                    }
                ]
            })),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["rows_written"], 3);
        assert_eq!(body["backends"].as_array().unwrap().len(), 2);

        let response = handle_online_read(
            State(server),
            read_request(json!({
                "entities": {"driver_id": [1001, 1002]},
                "features": [
                    "driver_stats:conv_rate",
                    "driver_stats:trips",
                    "driver_history:last_city"
                ]
            })),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(
            body["metadata"]["feature_names"],
            json!(["driver_id", "conv_rate", "trips", "last_city"])
        );
        assert_eq!(body["results"][1]["values"], json!([1.0, null]));
        assert_eq!(body["results"][1]["statuses"], json!(["PRESENT", "NOT_FOUND"]));
        assert_eq!(body["results"][2]["values"], json!([12, null]));
        assert_eq!(body["results"][3]["values"], json!(["Lisbon", null]));
    }

    #[tokio::test]
    async fn schema_errors_are_bad_requests() {
        let response = handle_online_write(
            State(server()),
            write_request(json!({
                "rows": [{
                    "feature_view": "driver_stats",
                    "entities": {"driver_id": 1},
                    "features": {"conv_rate": "high"}
                }]
            })),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert!(body["message"].as_str().unwrap().contains("conv_rate"));
    }

    #[tokio::test]
    async fn malformed_feature_refs_are_bad_requests() {
        let response = handle_online_read(
            State(server()),
            read_request(json!({
                "entities": {"driver_id": [1]},
                "features": ["conv_rate"]
            })),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn health_reports_connected_backends() {
        let server = server();
        let body = body_json(handle_health(State(server.clone())).await.into_response()).await;
        assert_eq!(body["backends"], json!({}));

        handle_online_write(
            State(server.clone()),
            write_request(json!({
                "rows": [{
                    "feature_view": "driver_stats",
                    "entities": {"driver_id": 1},
                    "features": {"conv_rate": 0.5}
                }]
            })),
        )
        .await
        .unwrap();
        let response = handle_health(State(server)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["healthy"], true);
        assert_eq!(body["backends"], json!({"hot": "ok"}));
    }

    #[test]
    fn error_status_mapping() {
        assert_eq!(
            status_for(&StoreError::unroutable(vec!["v".to_string()])),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&StoreError::backend(
                "redis",
                hybrid_store_core::error::AdapterError::connection("refused")
            )),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_for(&StoreError::PartialWrite(Default::default())),
            StatusCode::BAD_GATEWAY
        );
    }
}
