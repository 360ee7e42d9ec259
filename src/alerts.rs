//! Alert derivation from scored readings
//!
//! ## Debounce
//!
//! ```text
//! score < moderate                          → no alert
//! score >= moderate, recent active alert    → suppressed
//! score >= moderate, no recent active alert → new AlertRecord
//! ```
//!
//! "Recent" means created less than `debounce` before the evaluation time,
//! keyed by patient only. A score that rises from moderate to urgent inside
//! the window is still suppressed.
//!
//! Creation times are tracked per patient apart from the capped active list,
//! so an alert pushed out by overflow still holds its window. Dismissing the
//! alert clears it.

use std::collections::{HashMap, VecDeque};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, trace};

use crate::config::AlertConfig;
use crate::reading::{PatientId, ScoredReading};

pub type AlertId = u64;

/// Alert severity level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Moderate,
    Urgent,
}

impl Severity {
    pub fn classify(score: f64, urgent_threshold: f64) -> Self {
        if score >= urgent_threshold {
            Severity::Urgent
        } else {
            Severity::Moderate
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Moderate => write!(f, "moderate"),
            Severity::Urgent => write!(f, "urgent"),
        }
    }
}

/// An active alert for one patient
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertRecord {
    pub id: AlertId,
    pub patient: PatientId,
    pub score: f64,
    pub created_at: DateTime<Utc>,

    #[serde(skip)]
    urgent_threshold: f64,
}

impl AlertRecord {
    /// Severity is derived from the score every time it is read
    pub fn severity(&self) -> Severity {
        Severity::classify(self.score, self.urgent_threshold)
    }
}

/// Thresholds and limits applied by the aggregator
#[derive(Debug, Clone)]
pub struct AlertPolicy {
    pub moderate_threshold: f64,
    pub urgent_threshold: f64,
    pub debounce: chrono::Duration,
    pub max_active: usize,
}

impl From<&AlertConfig> for AlertPolicy {
    fn from(config: &AlertConfig) -> Self {
        Self {
            moderate_threshold: config.moderate_threshold,
            urgent_threshold: config.urgent_threshold,
            debounce: config.debounce(),
            max_active: config.max_active,
        }
    }
}

impl Default for AlertPolicy {
    fn default() -> Self {
        Self::from(&AlertConfig::default())
    }
}

/// Creates, holds and dismisses alerts
#[derive(Debug)]
pub struct AlertAggregator {
    policy: AlertPolicy,

    /// Oldest first
    active: VecDeque<AlertRecord>,

    /// Latest creation time per patient, pruned once outside the window
    last_created: HashMap<PatientId, DateTime<Utc>>,

    last_id: AlertId,
}

impl AlertAggregator {
    pub fn new(policy: AlertPolicy) -> Self {
        let capacity = policy.max_active.max(1);

        Self {
            policy: AlertPolicy {
                max_active: capacity,
                ..policy
            },
            active: VecDeque::with_capacity(capacity),
            last_created: HashMap::new(),
            last_id: 0,
        }
    }

    /// Evaluate a reading against the wall clock
    pub fn evaluate(&mut self, reading: &ScoredReading, patient: PatientId) -> Option<AlertRecord> {
        self.evaluate_at(reading, patient, Utc::now())
    }

    /// Evaluate a reading as if the current time were `now`
    pub fn evaluate_at(
        &mut self,
        reading: &ScoredReading,
        patient: PatientId,
        now: DateTime<Utc>,
    ) -> Option<AlertRecord> {
        let score = reading.composite_score;

        if score < self.policy.moderate_threshold {
            trace!(
                "patient {patient}: score {score:.2} below threshold {}",
                self.policy.moderate_threshold
            );
            return None;
        }

        // Alerts timestamped after `now` (clock skew) count as recent.
        let debounce = self.policy.debounce;
        self.last_created
            .retain(|_, created_at| now.signed_duration_since(*created_at) < debounce);

        let debounced = self.last_created.contains_key(&patient)
            || self.active.iter().any(|alert| {
                alert.patient == patient && now.signed_duration_since(alert.created_at) < debounce
            });

        if debounced {
            trace!("patient {patient}: score {score:.2} suppressed by debounce window");
            return None;
        }

        let alert = AlertRecord {
            id: self.next_id(now),
            patient,
            score,
            created_at: now,
            urgent_threshold: self.policy.urgent_threshold,
        };

        debug!(
            "patient {patient}: raised {} alert {} (score {score:.2})",
            alert.severity(),
            alert.id
        );

        self.active.push_back(alert.clone());
        self.last_created.insert(patient, now);

        while self.active.len() > self.policy.max_active {
            if let Some(evicted) = self.active.pop_front() {
                trace!("evicted alert {} (capacity {})", evicted.id, self.policy.max_active);
            }
        }

        Some(alert)
    }

    /// Remove an alert by id. Returns whether it was present.
    pub fn dismiss(&mut self, id: AlertId) -> bool {
        let Some(index) = self.active.iter().position(|alert| alert.id == id) else {
            return false;
        };

        if let Some(alert) = self.active.remove(index)
            && self.last_created.get(&alert.patient) == Some(&alert.created_at)
        {
            self.last_created.remove(&alert.patient);
        }

        debug!("dismissed alert {id}");
        true
    }

    /// Active alerts, oldest first
    pub fn active(&self) -> Vec<AlertRecord> {
        self.active.iter().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.active.clear();
        self.last_created.clear();
    }

    pub fn policy(&self) -> &AlertPolicy {
        &self.policy
    }

    /// Millisecond timestamp, bumped to stay strictly increasing
    fn next_id(&mut self, now: DateTime<Utc>) -> AlertId {
        let candidate = now.timestamp_millis().max(0) as AlertId;
        self.last_id = candidate.max(self.last_id + 1);
        self.last_id
    }
}

impl Default for AlertAggregator {
    fn default() -> Self {
        Self::new(AlertPolicy::default())
    }
}
