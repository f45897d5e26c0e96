//! JSON query and manual-trigger API over the spotcheck streams.

use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Months, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use spotcheck_adapters::adapter_info;
use spotcheck_core::{ContentType, DataSource, MismatchType, ReferenceType, SortOrder};
use spotcheck_engine::{
    QueryError, ReportError, SpotcheckConfig, SpotcheckRegistry, SpotcheckStream,
};
use spotcheck_storage::StorageError;
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "spotcheck-web";

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SpotcheckRegistry>,
}

impl AppState {
    pub fn new(registry: Arc<SpotcheckRegistry>) -> Self {
        Self { registry }
    }

    fn stream(&self, reference_type: &str) -> Result<Arc<dyn SpotcheckStream>, ApiError> {
        let parsed: ReferenceType = reference_type
            .parse()
            .map_err(|_| ApiError::UnknownReferenceType(reference_type.to_string()))?;
        self.registry
            .get(parsed)
            .ok_or(ApiError::StreamNotEnabled(parsed))
    }
}

#[derive(Debug, Serialize)]
pub struct ReferenceTypeRow {
    pub reference_type: ReferenceType,
    pub data_source: DataSource,
    pub content_type: ContentType,
    pub enabled: bool,
    pub parser_format: &'static str,
    pub rules: &'static [MismatchType],
}

#[derive(Debug, Deserialize, Default)]
struct ReportsQuery {
    from: Option<String>,
    to: Option<String>,
    order: Option<String>,
    limit: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct OpenMismatchQuery {
    #[serde(default)]
    include_ignored: bool,
}

#[derive(Debug, Deserialize)]
struct IgnoreRequest {
    content_id: String,
    mismatch_type: MismatchType,
}

#[derive(Debug)]
enum ApiError {
    UnknownReferenceType(String),
    StreamNotEnabled(ReferenceType),
    BadRequest { error: &'static str, detail: String },
    Query(QueryError),
    Run(ReportError),
}

impl From<QueryError> for ApiError {
    fn from(err: QueryError) -> Self {
        Self::Query(err)
    }
}

impl From<ReportError> for ApiError {
    fn from(err: ReportError) -> Self {
        Self::Run(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            Self::UnknownReferenceType(input) => (
                StatusCode::NOT_FOUND,
                json!({ "error": "unknown_reference_type", "reference_type": input }),
            ),
            Self::StreamNotEnabled(reference_type) => (
                StatusCode::NOT_FOUND,
                json!({ "error": "stream_not_enabled", "reference_type": reference_type }),
            ),
            Self::BadRequest { error, detail } => {
                (StatusCode::BAD_REQUEST, json!({ "error": error, "detail": detail }))
            }
            Self::Query(QueryError::Storage(StorageError::ReportNotFound(report_id))) => (
                StatusCode::NOT_FOUND,
                json!({ "error": "report_not_found", "report_id": report_id }),
            ),
            Self::Query(QueryError::Storage(err @ StorageError::MismatchNotOpen { .. })) => (
                StatusCode::CONFLICT,
                json!({ "error": "mismatch_not_open", "detail": err.to_string() }),
            ),
            Self::Query(QueryError::InvalidContentId(err)) => (
                StatusCode::BAD_REQUEST,
                json!({ "error": "invalid_content_id", "detail": err.to_string() }),
            ),
            Self::Query(err) => {
                warn!(error = %err, "spotcheck query failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "error": "storage_failure", "detail": err.to_string() }),
                )
            }
            Self::Run(err) => {
                let status = match &err {
                    ReportError::ReferenceDataUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
                    ReportError::Cancelled { .. } => StatusCode::CONFLICT,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (
                    status,
                    json!({
                        "error": err.kind(),
                        "detail": err.to_string(),
                        "context": err.context(),
                    }),
                )
            }
        };
        (status, Json(body)).into_response()
    }
}

fn parse_time(value: &str) -> Result<DateTime<Utc>, ApiError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|err| ApiError::BadRequest {
            error: "invalid_timestamp",
            detail: format!("{value}: {err}"),
        })
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/spotcheck/types", get(types_handler))
        .route("/api/spotcheck/{reference_type}/reports", get(list_reports_handler))
        .route(
            "/api/spotcheck/{reference_type}/reports/{reference_time}",
            get(get_report_handler),
        )
        .route(
            "/api/spotcheck/{reference_type}/reports/{reference_time}/open-mismatches",
            get(open_mismatches_handler),
        )
        .route("/api/spotcheck/{reference_type}/run", post(run_handler))
        .route(
            "/api/spotcheck/{reference_type}/mismatches/ignore",
            post(ignore_handler),
        )
        .route(
            "/api/spotcheck/{reference_type}/mismatches/unignore",
            post(unignore_handler),
        )
        .with_state(Arc::new(state))
}

pub async fn serve(registry: Arc<SpotcheckRegistry>, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "spotcheck api listening");
    axum::serve(listener, app(AppState::new(registry))).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = SpotcheckConfig::from_env();
    let streams = config.load_stream_registry().await?;
    let registry = Arc::new(SpotcheckRegistry::from_config(&config, &streams).await?);
    serve(registry, config.web_port).await
}

async fn types_handler(State(state): State<Arc<AppState>>) -> Json<Vec<ReferenceTypeRow>> {
    let rows = ReferenceType::ALL
        .into_iter()
        .map(|reference_type| {
            let info = adapter_info(reference_type);
            ReferenceTypeRow {
                reference_type,
                data_source: reference_type.data_source(),
                content_type: reference_type.content_type(),
                enabled: state.registry.get(reference_type).is_some(),
                parser_format: info.parser_format,
                rules: info.rules,
            }
        })
        .collect();
    Json(rows)
}

async fn list_reports_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(reference_type): AxumPath<String>,
    Query(query): Query<ReportsQuery>,
) -> Result<Response, ApiError> {
    let stream = state.stream(&reference_type)?;
    let to = match query.to.as_deref() {
        Some(value) => parse_time(value)?,
        None => Utc::now(),
    };
    let from = match query.from.as_deref() {
        Some(value) => parse_time(value)?,
        None => to.checked_sub_months(Months::new(6)).unwrap_or(to),
    };
    let order = match query.order.as_deref() {
        Some(value) => value.parse::<SortOrder>().map_err(|err| ApiError::BadRequest {
            error: "invalid_order",
            detail: err.to_string(),
        })?,
        None => SortOrder::Desc,
    };
    let ids = stream.list_report_ids(from, to, order, query.limit).await?;
    Ok(Json(ids).into_response())
}

async fn get_report_handler(
    State(state): State<Arc<AppState>>,
    AxumPath((reference_type, reference_time)): AxumPath<(String, String)>,
) -> Result<Response, ApiError> {
    let stream = state.stream(&reference_type)?;
    let view = stream.get_report(parse_time(&reference_time)?).await?;
    Ok(Json(view).into_response())
}

async fn open_mismatches_handler(
    State(state): State<Arc<AppState>>,
    AxumPath((reference_type, reference_time)): AxumPath<(String, String)>,
    Query(query): Query<OpenMismatchQuery>,
) -> Result<Response, ApiError> {
    let stream = state.stream(&reference_type)?;
    let count = stream
        .open_mismatch_count(parse_time(&reference_time)?, query.include_ignored)
        .await?;
    Ok(Json(json!({ "open_mismatches": count })).into_response())
}

async fn run_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(reference_type): AxumPath<String>,
) -> Result<Response, ApiError> {
    let stream = state.stream(&reference_type)?;
    let view = stream.generate_report().await?;
    Ok(Json(view).into_response())
}

async fn ignore_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(reference_type): AxumPath<String>,
    Json(body): Json<IgnoreRequest>,
) -> Result<Response, ApiError> {
    let stream = state.stream(&reference_type)?;
    stream
        .ignore_mismatch(&body.content_id, body.mismatch_type)
        .await?;
    Ok(Json(json!({ "ignored": true })).into_response())
}

async fn unignore_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(reference_type): AxumPath<String>,
    Json(body): Json<IgnoreRequest>,
) -> Result<Response, ApiError> {
    let stream = state.stream(&reference_type)?;
    let removed = stream
        .unignore_mismatch(&body.content_id, body.mismatch_type)
        .await?;
    Ok(Json(json!({ "unignored": removed })).into_response())
}
