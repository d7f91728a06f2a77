use serde::{Deserialize, Serialize};

use crate::domain::{ConfidenceScores, Verdict};

pub const PREDICT_ROUTE: &str = "/predict";
pub const PREDICT_URL_ALIAS_ROUTE: &str = "/predict-url";
pub const PREDICT_UPLOAD_ROUTE: &str = "/predict-upload";
pub const REPORT_ROUTE: &str = "/report";
pub const REPORT_ALIAS_ROUTE: &str = "/report-prediction";

/// Multipart field carrying the image on `/predict-upload`.
pub const UPLOAD_FILE_FIELD: &str = "file";

pub const REPORT_ACCEPTED_MESSAGE: &str = "Prediction reported successfully!";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictUrlRequest {
    #[serde(default)]
    pub image_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PredictionResponse {
    pub prediction: Verdict,
    pub confidence: f64,
    pub sfw_confidence: f64,
    pub nsfw_confidence: f64,
}

impl PredictionResponse {
    pub fn new(prediction: Verdict, scores: ConfidenceScores) -> Self {
        Self {
            prediction,
            confidence: scores.confidence,
            sfw_confidence: scores.sfw_confidence,
            nsfw_confidence: scores.nsfw_confidence,
        }
    }

    pub fn scores(&self) -> ConfidenceScores {
        ConfidenceScores {
            confidence: self.confidence,
            sfw_confidence: self.sfw_confidence,
            nsfw_confidence: self.nsfw_confidence,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

/// Text fields of a `/report` form exactly as submitted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportForm {
    pub prediction: Option<String>,
    pub source_type: Option<String>,
    pub confidence: Option<String>,
    pub sfw_confidence: Option<String>,
    pub nsfw_confidence: Option<String>,
    pub image_url: Option<String>,
}

impl ReportForm {
    /// Records one multipart field; unknown names are ignored.
    pub fn set_field(&mut self, name: &str, value: String) {
        let slot = match name {
            "prediction" => &mut self.prediction,
            "source_type" => &mut self.source_type,
            "confidence" => &mut self.confidence,
            "sfw_confidence" => &mut self.sfw_confidence,
            "nsfw_confidence" => &mut self.nsfw_confidence,
            "image_url" => &mut self.image_url,
            _ => return,
        };
        *slot = Some(value);
    }

    /// Present fields in submission order.
    pub fn fields(&self) -> Vec<(&'static str, String)> {
        [
            ("prediction", &self.prediction),
            ("source_type", &self.source_type),
            ("confidence", &self.confidence),
            ("sfw_confidence", &self.sfw_confidence),
            ("nsfw_confidence", &self.nsfw_confidence),
            ("image_url", &self.image_url),
        ]
        .into_iter()
        .filter_map(|(name, value)| value.clone().map(|value| (name, value)))
        .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prediction_response_uses_flat_wire_shape() {
        let response = PredictionResponse {
            prediction: Verdict::Sfw,
            confidence: 0.93,
            sfw_confidence: 0.93,
            nsfw_confidence: 0.07,
        };
        let value = serde_json::to_value(response).expect("json");
        assert_eq!(
            value,
            serde_json::json!({
                "prediction": "SFW",
                "confidence": 0.93,
                "sfw_confidence": 0.93,
                "nsfw_confidence": 0.07,
            })
        );
    }

    #[test]
    fn report_form_ignores_unknown_fields_and_keeps_order() {
        let mut form = ReportForm::default();
        form.set_field("image_url", "https://example.com/a.png".into());
        form.set_field("prediction", "NSFW".into());
        form.set_field("extra", "ignored".into());

        let names: Vec<_> = form.fields().into_iter().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["prediction", "image_url"]);
    }

    #[test]
    fn missing_image_url_deserializes_as_none() {
        let request: PredictUrlRequest = serde_json::from_str("{}").expect("json");
        assert!(request.image_url.is_none());
    }
}
