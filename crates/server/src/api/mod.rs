use std::{sync::Arc, time::Instant};

use axum::{
    extract::{multipart::MultipartError, DefaultBodyLimit, Multipart, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde_json::Value;
use shared::{
    error::{ApiError, ErrorCode},
    protocol::{
        ExtractResponse, ExtractionSchema, EXTRACT_ROUTE, FIELD_LABEL, FIELD_PDF, FIELD_SCHEMA_JSON,
    },
};
use tower_http::{services::ServeDir, trace::TraceLayer};
use tracing::{debug, error, info};

use crate::{app_state::AppState, config::Settings};

type ApiResult<T> = Result<T, (StatusCode, Json<ApiError>)>;

pub(crate) fn build_router(state: Arc<AppState>, settings: &Settings) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route(EXTRACT_ROUTE, post(extract))
        .fallback_service(ServeDir::new(&settings.static_dir))
        .layer(DefaultBodyLimit::max(settings.max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz(State(state): State<Arc<AppState>>) -> ApiResult<&'static str> {
    state
        .pipeline
        .storage()
        .health_check()
        .await
        .map_err(|e| {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ApiError::new(ErrorCode::Storage, e.to_string())),
            )
        })?;
    Ok("ok")
}

#[derive(Debug)]
struct ExtractForm {
    pdf: Vec<u8>,
    pdf_filename: Option<String>,
    label: String,
    schema_json: String,
}

async fn extract(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> ApiResult<Json<ExtractResponse>> {
    let form = read_extract_form(&mut multipart).await?;
    let schema = parse_schema(&form.schema_json)?;

    let started = Instant::now();
    let result = state
        .pipeline
        .run(&form.pdf, &form.label, &schema)
        .await
        .map_err(|e| {
            error!(
                label = %form.label,
                filename = ?form.pdf_filename,
                error = %e,
                "extract: pipeline failed"
            );
            (status_for(e.code()), Json(ApiError::from(&e)))
        })?;
    let runtime = started.elapsed().as_secs_f64();

    info!(
        label = %form.label,
        filename = ?form.pdf_filename,
        size_bytes = form.pdf.len(),
        fields = result.len(),
        runtime_seconds = runtime,
        "extract: completed"
    );
    Ok(Json(ExtractResponse::new(runtime, result)))
}

async fn read_extract_form(multipart: &mut Multipart) -> ApiResult<ExtractForm> {
    let mut pdf = None;
    let mut pdf_filename = None;
    let mut label = None;
    let mut schema_json = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| multipart_error("failed to parse multipart data", e))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            FIELD_PDF => {
                pdf_filename = field.file_name().map(str::to_string);
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| multipart_error(&format!("failed to read `{FIELD_PDF}`"), e))?;
                pdf = Some(bytes.to_vec());
            }
            FIELD_LABEL => {
                label = Some(
                    field
                        .text()
                        .await
                        .map_err(|e| {
                            multipart_error(&format!("failed to read `{FIELD_LABEL}`"), e)
                        })?,
                );
            }
            FIELD_SCHEMA_JSON => {
                schema_json = Some(field.text().await.map_err(|e| {
                    multipart_error(&format!("failed to read `{FIELD_SCHEMA_JSON}`"), e)
                })?);
            }
            other => debug!(field = other, "extract: ignoring unknown form field"),
        }
    }

    Ok(ExtractForm {
        pdf: pdf.ok_or_else(|| missing(FIELD_PDF))?,
        pdf_filename,
        label: label.ok_or_else(|| missing(FIELD_LABEL))?,
        schema_json: schema_json.ok_or_else(|| missing(FIELD_SCHEMA_JSON))?,
    })
}

fn parse_schema(raw: &str) -> ApiResult<ExtractionSchema> {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(schema)) => Ok(schema),
        Ok(_) => Err(validation(format!("`{FIELD_SCHEMA_JSON}` must be a JSON object"))),
        Err(e) => Err(validation(format!("`{FIELD_SCHEMA_JSON}` is not valid JSON: {e}"))),
    }
}

fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::Pdf => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorCode::Llm => StatusCode::BAD_GATEWAY,
        ErrorCode::Storage => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn validation(message: impl Into<String>) -> (StatusCode, Json<ApiError>) {
    (
        StatusCode::BAD_REQUEST,
        Json(ApiError::new(ErrorCode::Validation, message)),
    )
}

/// Keeps the rejection's own status, so an oversized body stays a 413.
fn multipart_error(context: &str, e: MultipartError) -> (StatusCode, Json<ApiError>) {
    (
        e.status(),
        Json(ApiError::new(
            ErrorCode::Validation,
            format!("{context}: {}", e.body_text()),
        )),
    )
}

fn missing(field: &str) -> (StatusCode, Json<ApiError>) {
    validation(format!("missing form field `{field}`"))
}

#[cfg(test)]
#[path = "tests/mod_tests.rs"]
mod tests;
