//! The evaluation record and its lifecycle.
//!
//! ```text
//!   pending ──► running ──┬──► complete
//!                         └──► failed
//! ```
//!
//! A record is written twice: once when created `running`, once when it
//! reaches a terminal state. Score and report travel together, and
//! `completed_at` is set exactly when the status is terminal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::report::{DimensionScores, EvaluationReport};

/// Status of an evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvaluationStatus {
    Pending,
    Running,
    Complete,
    Failed,
}

impl EvaluationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, EvaluationStatus::Complete | EvaluationStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EvaluationStatus::Pending => "pending",
            EvaluationStatus::Running => "running",
            EvaluationStatus::Complete => "complete",
            EvaluationStatus::Failed => "failed",
        }
    }

    /// Parses the lowercase storage form.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(EvaluationStatus::Pending),
            "running" => Some(EvaluationStatus::Running),
            "complete" => Some(EvaluationStatus::Complete),
            "failed" => Some(EvaluationStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for EvaluationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The terminal state written by the second and final update of a record.
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationVerdict {
    pub status: EvaluationStatus,
    pub contextual_debt_score: f64,
    pub report: EvaluationReport,
    pub completed_at: DateTime<Utc>,
}

impl EvaluationVerdict {
    /// Verdict for a flow whose children all reached a terminal state.
    ///
    /// The evaluation fails only when no dimension produced a result.
    pub fn from_dimensions(scores: DimensionScores) -> Self {
        let status = if scores.all_failed() {
            EvaluationStatus::Failed
        } else {
            EvaluationStatus::Complete
        };

        Self {
            status,
            contextual_debt_score: scores.contextual_debt_score(),
            report: EvaluationReport::Dimensions(scores),
            completed_at: Utc::now(),
        }
    }

    /// Verdict for an evaluation that never reached the analyzers.
    pub fn failure(reason: impl Into<String>) -> Self {
        Self {
            status: EvaluationStatus::Failed,
            contextual_debt_score: 0.0,
            report: EvaluationReport::Failure {
                error: reason.into(),
            },
            completed_at: Utc::now(),
        }
    }
}

/// The top-level record tracking one submission from dispatch to outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Evaluation {
    pub id: Uuid,
    pub status: EvaluationStatus,
    pub contextual_debt_score: Option<f64>,
    pub report: Option<EvaluationReport>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Evaluation {
    /// Creates a running record with a fresh time-ordered id.
    pub fn start() -> Self {
        Self::start_with_id(Uuid::now_v7())
    }

    pub fn start_with_id(id: Uuid) -> Self {
        Self {
            id,
            status: EvaluationStatus::Running,
            contextual_debt_score: None,
            report: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Applies a terminal verdict. Returns `false` and leaves the record
    /// untouched if it is already terminal.
    pub fn finish(&mut self, verdict: EvaluationVerdict) -> bool {
        if self.status.is_terminal() {
            return false;
        }

        self.status = verdict.status;
        self.contextual_debt_score = Some(verdict.contextual_debt_score);
        self.report = Some(verdict.report);
        self.completed_at = Some(verdict.completed_at);
        true
    }

    /// Checks the record invariants.
    pub fn is_consistent(&self) -> bool {
        let scored = self.contextual_debt_score.is_some() == self.report.is_some();
        let timed = self.completed_at.is_some() == self.status.is_terminal();
        let in_range = self
            .contextual_debt_score
            .map_or(true, |s| (0.0..=1.0).contains(&s));
        scored && timed && in_range
    }
}
