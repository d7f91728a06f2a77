use std::path::Path;

use reqwest::{multipart, Client, Response};
use serde::{de::DeserializeOwned, Deserialize};
use shared::protocol::{
    PredictUrlRequest, PredictionResponse, ReportForm, PREDICT_ROUTE, PREDICT_UPLOAD_ROUTE,
    REPORT_ROUTE, UPLOAD_FILE_FIELD,
};
use tracing::{debug, warn};

pub mod controller;
pub mod error;

pub use controller::{LastPrediction, PageController, PageView, ResultView, UiEvent};
pub use error::ClientError;

/// An image picked from disk, ready to be sent as the `file` form field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageUpload {
    pub filename: String,
    pub mime_type: Option<String>,
    pub bytes: Vec<u8>,
}

impl ImageUpload {
    /// Guesses the MIME type from the file extension.
    pub fn new(filename: impl Into<String>, bytes: Vec<u8>) -> Self {
        let filename = filename.into();
        let mime_type = mime_guess::from_path(&filename)
            .first_raw()
            .map(str::to_string);
        Self {
            filename,
            mime_type,
            bytes,
        }
    }

    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, ClientError> {
        let path = path.as_ref();
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|source| ClientError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        let filename = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_string());
        Ok(Self::new(filename, bytes))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PredictOutcome {
    Prediction(PredictionResponse),
    /// The server's `error` string, verbatim.
    Rejected(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportOutcome {
    Accepted(Option<String>),
    Rejected(String),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PredictReply {
    Failure { error: String },
    Prediction(PredictionResponse),
}

#[derive(Debug, Deserialize)]
struct ReportReply {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// HTTP client for the prediction gateway.
#[derive(Debug, Clone)]
pub struct DetectorClient {
    http: Client,
    server_url: String,
}

impl DetectorClient {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self::with_http(Client::new(), server_url)
    }

    pub fn with_http(http: Client, server_url: impl Into<String>) -> Self {
        Self {
            http,
            server_url: server_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    fn endpoint(&self, route: &str) -> String {
        format!("{}{route}", self.server_url)
    }

    pub async fn predict_url(&self, image_url: &str) -> Result<PredictOutcome, ClientError> {
        debug!(%image_url, "submitting url prediction");
        let response = self
            .http
            .post(self.endpoint(PREDICT_ROUTE))
            .json(&PredictUrlRequest {
                image_url: Some(image_url.to_string()),
            })
            .send()
            .await?;
        Ok(decode::<PredictReply>(response).await?.into())
    }

    pub async fn predict_upload(&self, upload: &ImageUpload) -> Result<PredictOutcome, ClientError> {
        debug!(filename = %upload.filename, size = upload.bytes.len(), "submitting upload prediction");
        let mut part = multipart::Part::bytes(upload.bytes.clone()).file_name(upload.filename.clone());
        if let Some(mime_type) = &upload.mime_type {
            part = part.mime_str(mime_type)?;
        }
        let form = multipart::Form::new().part(UPLOAD_FILE_FIELD, part);
        let response = self
            .http
            .post(self.endpoint(PREDICT_UPLOAD_ROUTE))
            .multipart(form)
            .send()
            .await?;
        Ok(decode::<PredictReply>(response).await?.into())
    }

    pub async fn report(&self, report: &ReportForm) -> Result<ReportOutcome, ClientError> {
        let form = report
            .fields()
            .into_iter()
            .fold(multipart::Form::new(), |form, (name, value)| form.text(name, value));
        let response = self
            .http
            .post(self.endpoint(REPORT_ROUTE))
            .multipart(form)
            .send()
            .await?;
        let reply = decode::<ReportReply>(response).await?;
        Ok(match reply.error {
            Some(error) => ReportOutcome::Rejected(error),
            None => ReportOutcome::Accepted(reply.message),
        })
    }
}

impl From<PredictReply> for PredictOutcome {
    fn from(reply: PredictReply) -> Self {
        match reply {
            PredictReply::Failure { error } => PredictOutcome::Rejected(error),
            PredictReply::Prediction(prediction) => PredictOutcome::Prediction(prediction),
        }
    }
}

/// Reads the body whatever the status; the gateway reports failures in JSON.
async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, ClientError> {
    let status = response.status();
    let body = response.text().await?;
    serde_json::from_str(&body).map_err(|err| {
        warn!(status = status.as_u16(), %err, "undecodable response body");
        ClientError::Decode {
            status: status.as_u16(),
            body,
        }
    })
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
