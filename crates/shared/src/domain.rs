use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub i64);
    };
}

id_newtype!(ObjectId);
id_newtype!(ReportId);

/// Score at or above which an image is labelled NSFW when the upstream
/// classifier does not name a label itself.
pub const DEFAULT_NSFW_THRESHOLD: f64 = 0.8;

const SCORE_DECIMALS: f64 = 10_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Verdict {
    #[serde(rename = "NSFW")]
    Nsfw,
    #[serde(rename = "SFW")]
    Sfw,
}

impl Verdict {
    pub fn as_str(self) -> &'static str {
        match self {
            Verdict::Nsfw => "NSFW",
            Verdict::Sfw => "SFW",
        }
    }

    /// Accepts upstream labels regardless of case or surrounding whitespace.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.eq_ignore_ascii_case("nsfw") {
            Some(Verdict::Nsfw)
        } else if raw.eq_ignore_ascii_case("sfw") {
            Some(Verdict::Sfw)
        } else {
            None
        }
    }

    /// Picks the label for a pair of class probabilities and returns it with
    /// the probability of the chosen class.
    pub fn from_scores(nsfw_confidence: f64, sfw_confidence: f64, threshold: f64) -> (Self, f64) {
        if nsfw_confidence >= threshold {
            (Verdict::Nsfw, nsfw_confidence)
        } else {
            (Verdict::Sfw, sfw_confidence)
        }
    }

    pub fn confidence_in(self, scores: &ConfidenceScores) -> f64 {
        match self {
            Verdict::Nsfw => scores.nsfw_confidence,
            Verdict::Sfw => scores.sfw_confidence,
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Url,
    Upload,
}

impl SourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SourceKind::Url => "url",
            SourceKind::Upload => "upload",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "url" => Some(SourceKind::Url),
            "upload" => Some(SourceKind::Upload),
            _ => None,
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceScores {
    pub confidence: f64,
    pub sfw_confidence: f64,
    pub nsfw_confidence: f64,
}

pub fn round_score(score: f64) -> f64 {
    (score * SCORE_DECIMALS).round() / SCORE_DECIMALS
}
