use async_trait::async_trait;
use reqwest::{multipart, Client};
use serde::{Deserialize, Serialize};
use shared::{
    domain::{round_score, ConfidenceScores, Verdict},
    protocol::{PredictionResponse, UPLOAD_FILE_FIELD},
};
use thiserror::Error;
use tracing::{debug, error};

use crate::api::UploadedImage;

/// Scores as the prediction service reports them, before labelling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawScores {
    #[serde(default)]
    pub prediction: Option<String>,
    #[serde(default)]
    pub confidence: Option<f64>,
    pub sfw_confidence: f64,
    pub nsfw_confidence: f64,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum UpstreamReply {
    Failure { error: String },
    Scores(RawScores),
}

#[derive(Debug, Error)]
pub enum ClassifierError {
    #[error("prediction service request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("prediction service returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    /// Error string reported by the service itself.
    #[error("{0}")]
    Rejected(String),
    #[error("prediction service returned an unusable body: {0}")]
    Decode(String),
}

#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify_url(&self, image_url: &str) -> Result<RawScores, ClassifierError>;
    async fn classify_upload(&self, upload: &UploadedImage) -> Result<RawScores, ClassifierError>;
}

#[derive(Debug, Serialize)]
struct ClassifyUrlRequest<'a> {
    image_url: &'a str,
}

/// Prediction service reached over HTTP.
pub struct RemoteClassifier {
    http: Client,
    predict_url: String,
    upload_url: String,
}

impl RemoteClassifier {
    pub fn new(http: Client, predict_url: impl Into<String>, upload_url: impl Into<String>) -> Self {
        Self {
            http,
            predict_url: predict_url.into(),
            upload_url: upload_url.into(),
        }
    }

    async fn read_reply(response: reqwest::Response) -> Result<RawScores, ClassifierError> {
        let status = response.status();
        let body = response.text().await?;
        match (serde_json::from_str::<UpstreamReply>(&body), status.is_success()) {
            (Ok(UpstreamReply::Failure { error }), _) => {
                error!(status = status.as_u16(), %error, "prediction service rejected request");
                Err(ClassifierError::Rejected(error))
            }
            (Ok(UpstreamReply::Scores(scores)), true) => Ok(scores),
            (_, false) => {
                error!(status = status.as_u16(), "prediction service returned an error status");
                Err(ClassifierError::Status {
                    status: status.as_u16(),
                    body: truncate(&body, 200),
                })
            }
            (Err(err), true) => {
                error!(%err, "error decoding prediction service response");
                Err(ClassifierError::Decode(err.to_string()))
            }
        }
    }
}

#[async_trait]
impl Classifier for RemoteClassifier {
    async fn classify_url(&self, image_url: &str) -> Result<RawScores, ClassifierError> {
        debug!(predict_url = %self.predict_url, %image_url, "requesting url prediction");
        let response = self
            .http
            .post(&self.predict_url)
            .json(&ClassifyUrlRequest { image_url })
            .send()
            .await?;
        Self::read_reply(response).await
    }

    async fn classify_upload(&self, upload: &UploadedImage) -> Result<RawScores, ClassifierError> {
        debug!(upload_url = %self.upload_url, filename = %upload.filename, "requesting upload prediction");
        let mut part = multipart::Part::bytes(upload.bytes.to_vec()).file_name(upload.filename.clone());
        if let Some(content_type) = &upload.content_type {
            part = part.mime_str(content_type)?;
        }
        let form = multipart::Form::new().part(UPLOAD_FILE_FIELD, part);
        let response = self.http.post(&self.upload_url).multipart(form).send().await?;
        Self::read_reply(response).await
    }
}

/// Rounds the scores, keeps a recognised upstream label and otherwise labels
/// by threshold. `confidence` falls back to the chosen class's score.
pub fn finalize_scores(raw: RawScores, nsfw_threshold: f64) -> Result<PredictionResponse, ClassifierError> {
    for (name, value) in [
        ("sfw_confidence", Some(raw.sfw_confidence)),
        ("nsfw_confidence", Some(raw.nsfw_confidence)),
        ("confidence", raw.confidence),
    ] {
        if let Some(value) = value {
            if !value.is_finite() || !(0.0..=1.0).contains(&value) {
                return Err(ClassifierError::Decode(format!(
                    "{name} out of range: {value}"
                )));
            }
        }
    }

    let sfw_confidence = round_score(raw.sfw_confidence);
    let nsfw_confidence = round_score(raw.nsfw_confidence);
    let (derived, _) = Verdict::from_scores(raw.nsfw_confidence, raw.sfw_confidence, nsfw_threshold);

    let prediction = raw
        .prediction
        .as_deref()
        .and_then(Verdict::parse)
        .unwrap_or(derived);
    let mut scores = ConfidenceScores {
        confidence: 0.0,
        sfw_confidence,
        nsfw_confidence,
    };
    scores.confidence = match raw.confidence {
        Some(confidence) => round_score(confidence),
        None => prediction.confidence_in(&scores),
    };

    Ok(PredictionResponse::new(prediction, scores))
}

fn truncate(body: &str, max_chars: usize) -> String {
    if body.chars().count() <= max_chars {
        return body.to_string();
    }
    let mut cut: String = body.chars().take(max_chars).collect();
    cut.push('…');
    cut
}

#[cfg(test)]
#[path = "tests/classifier_tests.rs"]
mod tests;
