use std::{sync::Arc, time::Duration};

use axum::body::Bytes;
use chrono::{DateTime, Utc};
use reqwest::Client;
use shared::{
    domain::{SourceKind, Verdict},
    error::{ApiError, ErrorCode},
    protocol::{MessageResponse, PredictionResponse, ReportForm, REPORT_ACCEPTED_MESSAGE},
};
use storage::{NewReport, Storage};
use tracing::{error, info, warn};

use crate::{
    classifier::{finalize_scores, Classifier, ClassifierError},
    config::{BucketNames, Settings},
    imaging::{archive_jpeg, ensure_decodable, fetch_image, parse_image_url, ARCHIVE_CONTENT_TYPE},
};

#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
    pub classifier: Arc<dyn Classifier>,
    pub http: Client,
    pub prediction: PredictionSettings,
    pub archive: ArchiveSettings,
}

#[derive(Debug, Clone)]
pub struct PredictionSettings {
    pub nsfw_threshold: f64,
    pub fetch_timeout: Duration,
    pub max_image_bytes: usize,
}

#[derive(Debug, Clone)]
pub struct ArchiveSettings {
    pub enabled: bool,
    pub buckets: BucketNames,
}

impl ArchiveSettings {
    fn verdict_bucket(&self, verdict: Verdict) -> &str {
        match verdict {
            Verdict::Nsfw => &self.buckets.nsfw_reported,
            Verdict::Sfw => &self.buckets.sfw_reported,
        }
    }
}

impl From<&Settings> for PredictionSettings {
    fn from(settings: &Settings) -> Self {
        Self {
            nsfw_threshold: settings.nsfw_threshold,
            fetch_timeout: Duration::from_secs(settings.request_timeout_secs),
            max_image_bytes: settings.max_upload_bytes,
        }
    }
}

impl From<&Settings> for ArchiveSettings {
    fn from(settings: &Settings) -> Self {
        Self {
            enabled: settings.archive_enabled,
            buckets: settings.buckets.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct UploadedImage {
    pub filename: String,
    pub content_type: Option<String>,
    pub bytes: Bytes,
}

pub async fn predict_from_url(
    ctx: &ApiContext,
    image_url: Option<&str>,
) -> Result<PredictionResponse, ApiError> {
    let image_url = image_url
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .ok_or_else(|| ApiError::validation("No image URL provided"))?;
    let url = parse_image_url(image_url)?;

    let bytes = fetch_image(
        &ctx.http,
        &url,
        ctx.prediction.fetch_timeout,
        ctx.prediction.max_image_bytes,
    )
    .await
    .map_err(|err| {
        error!(%image_url, error = %err.message, "image fetch failed");
        err
    })?;
    let jpeg = inspect_image(ctx, bytes).await?;

    let raw = ctx
        .classifier
        .classify_url(image_url)
        .await
        .map_err(prediction_failed)?;
    let response = finalize_scores(raw, ctx.prediction.nsfw_threshold).map_err(prediction_failed)?;
    info!(
        source = %SourceKind::Url,
        %image_url,
        prediction = %response.prediction,
        confidence = response.confidence,
        "prediction completed"
    );

    archive_image(ctx, response.prediction, jpeg, Utc::now()).await;
    Ok(response)
}

pub async fn predict_from_upload(
    ctx: &ApiContext,
    upload: Option<UploadedImage>,
) -> Result<PredictionResponse, ApiError> {
    let upload = upload
        .filter(|upload| !upload.bytes.is_empty())
        .ok_or_else(|| ApiError::validation("No image file provided"))?;
    if upload.bytes.len() > ctx.prediction.max_image_bytes {
        return Err(ApiError::new(
            ErrorCode::PayloadTooLarge,
            format!("image exceeds {} bytes", ctx.prediction.max_image_bytes),
        ));
    }
    let jpeg = inspect_image(ctx, upload.bytes.clone()).await?;

    let raw = ctx
        .classifier
        .classify_upload(&upload)
        .await
        .map_err(prediction_failed)?;
    let response = finalize_scores(raw, ctx.prediction.nsfw_threshold).map_err(prediction_failed)?;
    info!(
        source = %SourceKind::Upload,
        filename = %upload.filename,
        prediction = %response.prediction,
        confidence = response.confidence,
        "prediction completed"
    );

    archive_image(ctx, response.prediction, jpeg, Utc::now()).await;
    Ok(response)
}

pub async fn file_report(ctx: &ApiContext, form: ReportForm) -> Result<MessageResponse, ApiError> {
    let report = validate_report(form)?;
    let report_id = ctx.storage.insert_report(&report).await.map_err(internal)?;
    info!(
        report_id = report_id.0,
        prediction = %report.prediction,
        source = %report.source,
        image_url = report.image_url.as_deref().unwrap_or("-"),
        "reported prediction"
    );
    Ok(MessageResponse {
        message: REPORT_ACCEPTED_MESSAGE.to_string(),
    })
}

fn validate_report(form: ReportForm) -> Result<NewReport, ApiError> {
    let prediction = required(form.prediction.as_deref(), "prediction")?;
    let prediction = Verdict::parse(prediction)
        .ok_or_else(|| ApiError::validation(format!("Unknown prediction label: {prediction}")))?;
    let source = required(form.source_type.as_deref(), "source_type")?;
    let source = SourceKind::parse(source)
        .ok_or_else(|| ApiError::validation(format!("Unknown source_type: {source}")))?;

    let image_url = form
        .image_url
        .map(|url| url.trim().to_string())
        .filter(|url| !url.is_empty());
    if source == SourceKind::Url && image_url.is_none() {
        return Err(ApiError::validation(
            "image_url is required when source_type is url",
        ));
    }

    Ok(NewReport {
        prediction,
        source,
        confidence: optional_score(form.confidence.as_deref(), "confidence")?,
        sfw_confidence: optional_score(form.sfw_confidence.as_deref(), "sfw_confidence")?,
        nsfw_confidence: optional_score(form.nsfw_confidence.as_deref(), "nsfw_confidence")?,
        image_url,
    })
}

fn required<'a>(value: Option<&'a str>, name: &str) -> Result<&'a str, ApiError> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ApiError::validation(format!("Missing field: {name}")))
}

fn optional_score(value: Option<&str>, name: &str) -> Result<Option<f64>, ApiError> {
    let Some(value) = value.map(str::trim).filter(|value| !value.is_empty()) else {
        return Ok(None);
    };
    match value.parse::<f64>() {
        Ok(score) if score.is_finite() && (0.0..=1.0).contains(&score) => Ok(Some(score)),
        _ => Err(ApiError::validation(format!(
            "{name} must be a number between 0 and 1"
        ))),
    }
}

/// Refuses undecodable images. Returns the archive JPEG only when archiving
/// is enabled.
async fn inspect_image(ctx: &ApiContext, bytes: Bytes) -> Result<Option<Vec<u8>>, ApiError> {
    let archive = ctx.archive.enabled;
    tokio::task::spawn_blocking(move || {
        if archive {
            archive_jpeg(&bytes).map(Some)
        } else {
            ensure_decodable(&bytes).map(|()| None)
        }
    })
    .await
    .map_err(|e| ApiError::internal(format!("image decoding task failed: {e}")))?
}

pub(crate) fn archive_key(verdict: Verdict, at: DateTime<Utc>) -> String {
    format!("{}_{}.jpg", verdict, at.format("%Y%m%d_%H%M%S"))
}

/// Stores the thumbnail in the catch-all bucket and the verdict's bucket.
/// Failures are logged only.
async fn archive_image(
    ctx: &ApiContext,
    verdict: Verdict,
    jpeg: Option<Vec<u8>>,
    at: DateTime<Utc>,
) {
    let Some(jpeg) = jpeg else {
        return;
    };
    let key = archive_key(verdict, at);
    for bucket in [
        ctx.archive.buckets.all_images.as_str(),
        ctx.archive.verdict_bucket(verdict),
    ] {
        match ctx
            .storage
            .put_object(bucket, &key, &jpeg, Some(ARCHIVE_CONTENT_TYPE))
            .await
        {
            Ok(object_id) => info!(%bucket, %key, object_id = object_id.0, "archived image"),
            Err(error) => warn!(%bucket, %key, %error, "failed to archive image"),
        }
    }
}

fn prediction_failed(err: ClassifierError) -> ApiError {
    error!(error = %err, "error during prediction");
    ApiError::new(
        ErrorCode::Upstream,
        format!("Error during prediction: {err}"),
    )
}

fn internal(err: anyhow::Error) -> ApiError {
    ApiError::internal(err.to_string())
}

#[cfg(test)]
#[path = "tests/mod_tests.rs"]
mod tests;
