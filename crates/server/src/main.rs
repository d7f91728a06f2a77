use std::{net::SocketAddr, sync::Arc, time::Instant};

use axum::{
    extract::{
        multipart::{Field, MultipartError, MultipartRejection},
        rejection::JsonRejection,
        DefaultBodyLimit, Multipart, Request, State,
    },
    http::StatusCode,
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use reqwest::Client;
use shared::{
    error::{ApiError, ErrorCode},
    protocol::{
        ErrorResponse, MessageResponse, PredictUrlRequest, PredictionResponse, ReportForm,
        PREDICT_ROUTE, PREDICT_UPLOAD_ROUTE, PREDICT_URL_ALIAS_ROUTE, REPORT_ALIAS_ROUTE,
        REPORT_ROUTE, UPLOAD_FILE_FIELD,
    },
};
use storage::Storage;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod api;
mod classifier;
mod config;
mod imaging;

use api::{ApiContext, ArchiveSettings, PredictionSettings, UploadedImage};
use classifier::RemoteClassifier;
use config::{load_settings, prepare_database_url};

/// Room for multipart boundaries and the other form fields.
const FORM_OVERHEAD_BYTES: usize = 64 * 1024;

type HttpError = (StatusCode, Json<ErrorResponse>);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = load_settings();
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;

    let http = Client::builder()
        .timeout(std::time::Duration::from_secs(settings.request_timeout_secs))
        .build()?;
    let classifier = RemoteClassifier::new(
        http.clone(),
        settings.prediction_api_url.clone(),
        settings.upload_api_url(),
    );
    let ctx = ApiContext {
        storage,
        classifier: Arc::new(classifier),
        http,
        prediction: PredictionSettings::from(&settings),
        archive: ArchiveSettings::from(&settings),
    };
    info!(
        predict_url = %settings.prediction_api_url,
        upload_url = %settings.upload_api_url(),
        nsfw_threshold = settings.nsfw_threshold,
        archive_enabled = settings.archive_enabled,
        production = settings.is_production(),
        "prediction gateway configured"
    );

    let app = build_router(Arc::new(ctx), settings.max_upload_bytes);
    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(ctx: Arc<ApiContext>, max_upload_bytes: usize) -> Router {
    let body_limit = max_upload_bytes.saturating_add(FORM_OVERHEAD_BYTES);
    Router::new()
        .route("/healthz", get(healthz))
        .route(PREDICT_ROUTE, post(predict_url))
        .route(PREDICT_URL_ALIAS_ROUTE, post(predict_url))
        .route(PREDICT_UPLOAD_ROUTE, post(predict_upload))
        .route(REPORT_ROUTE, post(report_prediction))
        .route(REPORT_ALIAS_ROUTE, post(report_prediction))
        .layer(middleware::from_fn(log_timing))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(ctx)
}

async fn healthz(State(ctx): State<Arc<ApiContext>>) -> Result<&'static str, HttpError> {
    ctx.storage
        .health_check()
        .await
        .map_err(|e| reject(ApiError::internal(e.to_string())))?;
    Ok("ok")
}

async fn predict_url(
    State(ctx): State<Arc<ApiContext>>,
    payload: Result<Json<PredictUrlRequest>, JsonRejection>,
) -> Result<Json<PredictionResponse>, HttpError> {
    let image_url = match payload {
        Ok(Json(request)) => request.image_url,
        Err(rejection) if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE => {
            return Err(too_large());
        }
        Err(rejection) => {
            warn!(%rejection, "unreadable predict body");
            None
        }
    };
    api::predict_from_url(&ctx, image_url.as_deref())
        .await
        .map(Json)
        .map_err(reject)
}

async fn predict_upload(
    State(ctx): State<Arc<ApiContext>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<PredictionResponse>, HttpError> {
    let mut upload = None;
    if let Ok(mut multipart) = multipart {
        while let Some(field) = multipart.next_field().await.map_err(multipart_failed)? {
            if field.name() == Some(UPLOAD_FILE_FIELD) {
                upload = Some(read_upload(field).await?);
                break;
            }
        }
    }
    api::predict_from_upload(&ctx, upload)
        .await
        .map(Json)
        .map_err(reject)
}

async fn read_upload(field: Field<'_>) -> Result<UploadedImage, HttpError> {
    let filename = field
        .file_name()
        .filter(|name| !name.trim().is_empty())
        .unwrap_or("upload")
        .to_string();
    let content_type = field.content_type().map(str::to_string);
    let bytes = field.bytes().await.map_err(multipart_failed)?;
    Ok(UploadedImage {
        filename,
        content_type,
        bytes,
    })
}

async fn report_prediction(
    State(ctx): State<Arc<ApiContext>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<MessageResponse>, HttpError> {
    let mut form = ReportForm::default();
    if let Ok(mut multipart) = multipart {
        while let Some(field) = multipart.next_field().await.map_err(multipart_failed)? {
            let Some(name) = field.name().map(str::to_string) else {
                continue;
            };
            let value = field.text().await.map_err(multipart_failed)?;
            form.set_field(&name, value);
        }
    }
    api::file_report(&ctx, form).await.map(Json).map_err(reject)
}

async fn log_timing(request: Request, next: Next) -> Response {
    let label = match request.uri().path() {
        PREDICT_ROUTE | PREDICT_URL_ALIAS_ROUTE => Some("PREDICT_URL"),
        PREDICT_UPLOAD_ROUTE => Some("PREDICT_UPLOAD"),
        REPORT_ROUTE | REPORT_ALIAS_ROUTE => Some("REPORT"),
        _ => None,
    };
    let started = Instant::now();
    let response = next.run(request).await;
    if let Some(label) = label {
        info!(
            status = response.status().as_u16(),
            "{label} | {} ms",
            started.elapsed().as_millis()
        );
    }
    response
}

fn status_for(code: &ErrorCode) -> StatusCode {
    match code {
        ErrorCode::Validation | ErrorCode::FetchFailed | ErrorCode::UnsupportedImage => {
            StatusCode::BAD_REQUEST
        }
        ErrorCode::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
        ErrorCode::Upstream => StatusCode::BAD_GATEWAY,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn reject(err: ApiError) -> HttpError {
    (status_for(&err.code), Json(ErrorResponse::from(err)))
}

fn too_large() -> HttpError {
    reject(ApiError::new(
        ErrorCode::PayloadTooLarge,
        "request body is too large",
    ))
}

fn multipart_failed(err: MultipartError) -> HttpError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        return too_large();
    }
    reject(ApiError::validation(format!("malformed form data: {}", err.body_text())))
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
