//! Scored readings and normalization of analysis payloads
//!
//! Both the analysis endpoint and the event feed deliver the same loosely typed
//! result shape. Everything is normalized into a [`ScoredReading`] before it
//! reaches the history buffer or the alert aggregator.

use std::collections::BTreeMap;
use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

/// Upper bound of the pain scale
pub const MAX_SCORE: f64 = 10.0;

/// Label the backend uses when no cry was classified
const BACKEND_NO_CRY: &str = "no_cry";

/// Normalized label for "no cry"
pub const NO_CRY: &str = "none";

/// Backend patient key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PatientId(pub i64);

impl fmt::Display for PatientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PatientId {
    type Err = ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(PatientId)
    }
}

/// Where a reading entered the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadingSource {
    /// Produced by the frame capture scheduler
    Capture,
    /// Pushed by the backend over the event channel
    Channel,
}

/// Result shape returned by `POST /api/analyze/frame` and embedded in
/// `pain_update` events
///
/// Every field except `composite_score` is optional on the wire. Unknown
/// fields (`alert_level`, `pain_label`, ...) are ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    #[serde(default)]
    pub face_detected: bool,

    #[serde(default)]
    pub landmarks: Option<Vec<[f64; 2]>>,

    #[serde(default)]
    pub facial_score: Option<f64>,

    #[serde(default)]
    pub audio_score: Option<f64>,

    #[serde(default)]
    pub composite_score: Option<f64>,

    #[serde(default)]
    pub cry_detected: bool,

    #[serde(default)]
    pub cry_type: Option<String>,

    #[serde(default)]
    pub features: Option<BTreeMap<String, f64>>,

    /// ISO-8601, usually without a zone offset
    #[serde(default)]
    pub timestamp: Option<String>,

    // The event feed flattens four facial ratios to the top level instead of
    // sending a `features` map.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brow_furrow: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eye_squeeze: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nasolabial_furrow: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mouth_stretch: Option<f64>,
}

impl AnalysisResult {
    /// Feature ratios, falling back to the flattened event-feed fields
    fn feature_map(&self) -> Option<BTreeMap<String, f64>> {
        if let Some(features) = &self.features {
            return Some(features.clone());
        }

        let flattened: BTreeMap<String, f64> = [
            ("brow_furrow", self.brow_furrow),
            ("eye_squeeze", self.eye_squeeze),
            ("nasolabial_furrow", self.nasolabial_furrow),
            ("mouth_stretch", self.mouth_stretch),
        ]
        .into_iter()
        .filter_map(|(name, value)| value.map(|v| (name.to_string(), v)))
        .collect();

        if flattened.is_empty() {
            None
        } else {
            Some(flattened)
        }
    }
}

/// Reasons a payload is refused admission to the pipeline
#[derive(Debug, Clone, PartialEq)]
pub enum ReadingError {
    /// No composite score in the payload
    MissingComposite,

    /// Composite score is NaN or infinite
    NonFiniteComposite(f64),
}

impl fmt::Display for ReadingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadingError::MissingComposite => write!(f, "payload has no composite score"),
            ReadingError::NonFiniteComposite(v) => {
                write!(f, "composite score is not finite: {}", v)
            }
        }
    }
}

impl std::error::Error for ReadingError {}

/// One point in time for one patient
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredReading {
    pub timestamp: DateTime<Utc>,

    /// Always within `[0, MAX_SCORE]`
    pub composite_score: f64,

    pub facial_score: Option<f64>,

    pub audio_score: Option<f64>,

    pub face_detected: bool,

    pub cry_detected: bool,

    /// Categorical cry label, `"none"` when no cry was classified
    pub cry_type: String,

    /// Named geometric ratios for overlays
    pub features: Option<BTreeMap<String, f64>>,

    /// Landmark (x, y) pairs for overlays
    pub landmarks: Option<Vec<[f64; 2]>>,

    pub source: ReadingSource,
}

impl ScoredReading {
    /// Minimal reading with only a composite score
    pub fn new(timestamp: DateTime<Utc>, composite_score: f64, source: ReadingSource) -> Self {
        Self {
            timestamp,
            composite_score: clamp_score(composite_score),
            facial_score: None,
            audio_score: None,
            face_detected: false,
            cry_detected: false,
            cry_type: NO_CRY.to_string(),
            features: None,
            landmarks: None,
            source,
        }
    }

    /// Normalize an analysis payload
    ///
    /// `received_at` is used when the payload carries no usable timestamp.
    pub fn from_analysis(
        result: AnalysisResult,
        source: ReadingSource,
        received_at: DateTime<Utc>,
    ) -> Result<Self, ReadingError> {
        let composite = result
            .composite_score
            .ok_or(ReadingError::MissingComposite)?;

        if !composite.is_finite() {
            return Err(ReadingError::NonFiniteComposite(composite));
        }

        let timestamp = result
            .timestamp
            .as_deref()
            .and_then(parse_timestamp)
            .unwrap_or(received_at);

        let features = result.feature_map();

        Ok(Self {
            timestamp,
            composite_score: clamp_score(composite),
            facial_score: result.facial_score.and_then(sub_score),
            audio_score: result.audio_score.and_then(sub_score),
            face_detected: result.face_detected,
            cry_detected: result.cry_detected,
            cry_type: normalize_cry_type(result.cry_type.as_deref()),
            features,
            landmarks: result.landmarks,
            source,
        })
    }

    /// Display label for the composite score
    pub fn pain_level(&self) -> PainLevel {
        PainLevel::from_score(self.composite_score)
    }
}

/// Human-readable pain band
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PainLevel {
    NoPain,
    MildDiscomfort,
    ModeratePain,
    SeverePain,
}

impl PainLevel {
    pub fn from_score(score: f64) -> Self {
        if score <= 1.0 {
            PainLevel::NoPain
        } else if score <= 3.0 {
            PainLevel::MildDiscomfort
        } else if score <= 6.0 {
            PainLevel::ModeratePain
        } else {
            PainLevel::SeverePain
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            PainLevel::NoPain => "No Pain",
            PainLevel::MildDiscomfort => "Mild Discomfort",
            PainLevel::ModeratePain => "Moderate Pain",
            PainLevel::SeverePain => "Severe Pain",
        }
    }
}

impl fmt::Display for PainLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

fn clamp_score(score: f64) -> f64 {
    score.clamp(0.0, MAX_SCORE)
}

fn sub_score(score: f64) -> Option<f64> {
    score.is_finite().then(|| clamp_score(score))
}

fn normalize_cry_type(raw: Option<&str>) -> String {
    match raw.map(str::trim) {
        None | Some("") | Some(BACKEND_NO_CRY) => NO_CRY.to_string(),
        Some(label) => label.to_string(),
    }
}

/// Parse RFC 3339, or a naive ISO-8601 timestamp interpreted as UTC
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();

    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }

    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}
