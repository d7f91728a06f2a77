use std::fmt;

use shared::{
    domain::{ConfidenceScores, SourceKind, Verdict},
    protocol::ReportForm,
};
use tokio::sync::{broadcast, Mutex};
use tracing::{info, warn};

use crate::{ClientError, DetectorClient, ImageUpload, PredictOutcome, ReportOutcome};

pub const ENTER_URL_ALERT: &str = "Please enter an image URL";
pub const SELECT_FILE_ALERT: &str = "Please select an image file";
pub const NOTHING_TO_REPORT_ALERT: &str = "No prediction to report";
pub const REPORTED_FALLBACK_ALERT: &str = "Reported successfully";

/// The most recent successful prediction, kept for filing a report.
#[derive(Debug, Clone, PartialEq)]
pub struct LastPrediction {
    pub source: SourceKind,
    /// Present only for [`SourceKind::Url`].
    pub image_url: Option<String>,
    pub prediction: Verdict,
    pub scores: ConfidenceScores,
}

impl LastPrediction {
    pub fn report_form(&self) -> ReportForm {
        ReportForm {
            prediction: Some(self.prediction.to_string()),
            source_type: Some(self.source.to_string()),
            confidence: Some(self.scores.confidence.to_string()),
            sfw_confidence: Some(self.scores.sfw_confidence.to_string()),
            nsfw_confidence: Some(self.scores.nsfw_confidence.to_string()),
            image_url: match self.source {
                SourceKind::Url => self.image_url.clone(),
                SourceKind::Upload => None,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum ResultView {
    #[default]
    Empty,
    Analyzing,
    Prediction {
        prediction: Verdict,
        sfw_confidence: f64,
        nsfw_confidence: f64,
    },
    Error(String),
}

impl fmt::Display for ResultView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResultView::Empty => Ok(()),
            ResultView::Analyzing => f.write_str("Analyzing image..."),
            ResultView::Prediction {
                prediction,
                sfw_confidence,
                nsfw_confidence,
            } => write!(
                f,
                "Prediction: {prediction}\nSFW Confidence: {sfw_confidence}\nNSFW Confidence: {nsfw_confidence}"
            ),
            ResultView::Error(message) => write!(f, "Error: {message}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct PageView {
    pub url_input: String,
    pub selected_file: Option<String>,
    pub preview_visible: bool,
    pub result: ResultView,
    pub report_button_visible: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum UiEvent {
    Alert(String),
    ResultChanged(ResultView),
    ReportButtonChanged(bool),
    /// Filename of the previewed upload.
    PreviewChanged(Option<String>),
}

#[derive(Default)]
struct PageState {
    view: PageView,
    upload: Option<ImageUpload>,
    last_prediction: Option<LastPrediction>,
}

/// Drives the checker page: reads the inputs, talks to the gateway and
/// publishes what the front-end should show.
pub struct PageController {
    client: DetectorClient,
    state: Mutex<PageState>,
    events: broadcast::Sender<UiEvent>,
}

impl PageController {
    pub fn new(client: DetectorClient) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            client,
            state: Mutex::new(PageState::default()),
            events,
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<UiEvent> {
        self.events.subscribe()
    }

    pub async fn view(&self) -> PageView {
        self.state.lock().await.view.clone()
    }

    pub async fn last_prediction(&self) -> Option<LastPrediction> {
        self.state.lock().await.last_prediction.clone()
    }

    pub async fn set_url_input(&self, text: impl Into<String>) {
        let mut state = self.state.lock().await;
        state.view.url_input = text.into();
        self.set_report_button(&mut state, false);
    }

    pub async fn select_file(&self, upload: Option<ImageUpload>) {
        let Some(upload) = upload else {
            return;
        };
        let mut state = self.state.lock().await;
        state.view.selected_file = Some(upload.filename.clone());
        state.view.preview_visible = true;
        self.emit(UiEvent::PreviewChanged(Some(upload.filename.clone())));
        state.upload = Some(upload);
        self.set_report_button(&mut state, false);
    }

    /// Returns the new prediction, or `None` when nothing was recorded.
    pub async fn predict_url(&self) -> Result<Option<LastPrediction>, ClientError> {
        let image_url = {
            let mut state = self.state.lock().await;
            let image_url = state.view.url_input.trim().to_string();
            if image_url.is_empty() {
                drop(state);
                self.emit(UiEvent::Alert(ENTER_URL_ALERT.to_string()));
                return Ok(None);
            }
            self.set_result(&mut state, ResultView::Analyzing);
            image_url
        };

        let outcome = self.client.predict_url(&image_url).await;
        self.finish_prediction(SourceKind::Url, Some(image_url), outcome)
            .await
    }

    /// Returns the new prediction, or `None` when nothing was recorded.
    pub async fn predict_upload(&self) -> Result<Option<LastPrediction>, ClientError> {
        let upload = {
            let mut state = self.state.lock().await;
            let Some(upload) = state.upload.clone() else {
                drop(state);
                self.emit(UiEvent::Alert(SELECT_FILE_ALERT.to_string()));
                return Ok(None);
            };
            self.set_result(&mut state, ResultView::Analyzing);
            upload
        };

        let outcome = self.client.predict_upload(&upload).await;
        self.finish_prediction(SourceKind::Upload, None, outcome)
            .await
    }

    /// Files the last prediction as wrong. Returns the alert shown, or `None`
    /// when there was nothing to report.
    pub async fn report_prediction(&self) -> Result<Option<String>, ClientError> {
        let Some(last) = self.last_prediction().await else {
            self.emit(UiEvent::Alert(NOTHING_TO_REPORT_ALERT.to_string()));
            return Ok(None);
        };

        let outcome = self.client.report(&last.report_form()).await;
        let mut state = self.state.lock().await;
        self.set_report_button(&mut state, false);
        let alert = match outcome {
            Ok(ReportOutcome::Accepted(message)) => {
                info!(prediction = %last.prediction, source = %last.source, "prediction reported");
                message.unwrap_or_else(|| REPORTED_FALLBACK_ALERT.to_string())
            }
            Ok(ReportOutcome::Rejected(error)) => {
                warn!(%error, "report rejected");
                error
            }
            Err(err) => {
                warn!(%err, "report failed");
                self.set_result(&mut state, ResultView::Error(err.to_string()));
                return Err(err);
            }
        };
        drop(state);
        self.emit(UiEvent::Alert(alert.clone()));
        Ok(Some(alert))
    }

    async fn finish_prediction(
        &self,
        source: SourceKind,
        image_url: Option<String>,
        outcome: Result<PredictOutcome, ClientError>,
    ) -> Result<Option<LastPrediction>, ClientError> {
        let mut state = self.state.lock().await;
        match outcome {
            Ok(PredictOutcome::Prediction(response)) => {
                let last = LastPrediction {
                    source,
                    image_url,
                    prediction: response.prediction,
                    scores: response.scores(),
                };
                info!(%source, prediction = %last.prediction, confidence = last.scores.confidence, "prediction received");
                state.last_prediction = Some(last.clone());
                self.set_result(
                    &mut state,
                    ResultView::Prediction {
                        prediction: response.prediction,
                        sfw_confidence: response.sfw_confidence,
                        nsfw_confidence: response.nsfw_confidence,
                    },
                );
                self.set_report_button(&mut state, true);
                Ok(Some(last))
            }
            Ok(PredictOutcome::Rejected(error)) => {
                warn!(%source, %error, "prediction rejected");
                self.set_result(&mut state, ResultView::Error(error));
                self.set_report_button(&mut state, false);
                Ok(None)
            }
            Err(err) => {
                warn!(%source, %err, "prediction request failed");
                self.set_result(&mut state, ResultView::Error(err.to_string()));
                self.set_report_button(&mut state, false);
                Err(err)
            }
        }
    }

    fn set_result(&self, state: &mut PageState, result: ResultView) {
        state.view.result = result.clone();
        self.emit(UiEvent::ResultChanged(result));
    }

    fn set_report_button(&self, state: &mut PageState, visible: bool) {
        if state.view.report_button_visible != visible {
            state.view.report_button_visible = visible;
            self.emit(UiEvent::ReportButtonChanged(visible));
        }
    }

    fn emit(&self, event: UiEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
#[path = "tests/controller_tests.rs"]
mod tests;
