//! Per-dimension analysis results and the aggregated evaluation report.

use serde::{Deserialize, Serialize, Serializer};

/// Context id recorded when the judgment itself could not be obtained.
pub const SYSTEM_ERROR_CONTEXT_ID: &str = "SYSTEM_ERROR";

/// A detected case where consumed context caused a flawed rationale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DebtEvent {
    pub step_index: u32,
    pub incurred_by_context_id: String,
    pub debt_score: f64,
    pub details: String,
}

impl DebtEvent {
    /// Worst-case event for a step whose judgment failed.
    pub fn system_error(step_index: u32, details: impl Into<String>) -> Self {
        Self {
            step_index,
            incurred_by_context_id: SYSTEM_ERROR_CONTEXT_ID.to_string(),
            debt_score: 1.0,
            details: details.into(),
        }
    }

    pub fn is_system_error(&self) -> bool {
        self.incurred_by_context_id == SYSTEM_ERROR_CONTEXT_ID
    }
}

/// Output of the rationale analyzer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RationaleAnalysis {
    pub overall_score: f64,
    pub trace: Vec<DebtEvent>,
}

impl RationaleAnalysis {
    /// Builds the result from recorded events: 1.0 for an empty trace,
    /// otherwise one minus the mean debt score.
    pub fn from_trace(trace: Vec<DebtEvent>) -> Self {
        let overall_score = if trace.is_empty() {
            1.0
        } else {
            let mean = trace.iter().map(|e| e.debt_score).sum::<f64>() / trace.len() as f64;
            (1.0 - mean).clamp(0.0, 1.0)
        };

        Self {
            overall_score,
            trace,
        }
    }
}

/// Raw complexity figures for a parsed source file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComplexityMetrics {
    pub cyclomatic: u32,
    pub maintainability_index: f64,
    pub halstead_volume: f64,
    pub sloc: u32,
    pub functions: u32,
}

/// Output of the architectural analyzer. `metrics` is `None` on parse failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchitecturalAnalysis {
    pub score: f64,
    pub details: String,
    pub metrics: Option<ComplexityMetrics>,
}

/// Output of the testing analyzer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestingAnalysis {
    pub score: f64,
    pub details: String,
}

/// One dimension of the evaluation report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DimensionReport {
    pub score: f64,
    pub details: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<Vec<DebtEvent>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<ComplexityMetrics>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub failed: bool,
}

impl DimensionReport {
    /// Zero-score entry for a dimension whose job failed or whose result is unusable.
    pub fn failed(details: impl Into<String>) -> Self {
        Self {
            score: 0.0,
            details: details.into(),
            trace: None,
            metrics: None,
            failed: true,
        }
    }
}

impl From<RationaleAnalysis> for DimensionReport {
    fn from(analysis: RationaleAnalysis) -> Self {
        let system_errors = analysis.trace.iter().filter(|e| e.is_system_error()).count();
        let details = match (analysis.trace.len(), system_errors) {
            (0, _) => "No rationale debt detected.".to_string(),
            (n, 0) => format!("{} debt event(s) detected in the reasoning trace.", n),
            (n, e) => format!(
                "{} debt event(s) detected in the reasoning trace ({} could not be judged).",
                n, e
            ),
        };

        Self {
            score: analysis.overall_score,
            details,
            trace: Some(analysis.trace),
            metrics: None,
            failed: false,
        }
    }
}

impl From<ArchitecturalAnalysis> for DimensionReport {
    fn from(analysis: ArchitecturalAnalysis) -> Self {
        Self {
            score: analysis.score,
            details: analysis.details,
            trace: None,
            metrics: analysis.metrics,
            failed: false,
        }
    }
}

impl From<TestingAnalysis> for DimensionReport {
    fn from(analysis: TestingAnalysis) -> Self {
        Self {
            score: analysis.score,
            details: analysis.details,
            trace: None,
            metrics: None,
            failed: false,
        }
    }
}

/// The three scored dimensions of a finished evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DimensionScores {
    pub rationale_debt: DimensionReport,
    #[serde(serialize_with = "serialize_with_metrics")]
    pub architectural_coherence_debt: DimensionReport,
    pub testing_verification_debt: DimensionReport,
}

impl DimensionScores {
    /// Mean of the three dimension scores rounded to two decimals.
    pub fn contextual_debt_score(&self) -> f64 {
        let sum = self.rationale_debt.score
            + self.architectural_coherence_debt.score
            + self.testing_verification_debt.score;
        round_score(sum / 3.0)
    }

    /// Returns whether every dimension failed.
    pub fn all_failed(&self) -> bool {
        self.rationale_debt.failed
            && self.architectural_coherence_debt.failed
            && self.testing_verification_debt.failed
    }
}

/// Writes the architectural entry with `metrics` always present, `null`
/// when the source could not be parsed.
fn serialize_with_metrics<S: Serializer>(
    report: &DimensionReport,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    #[derive(Serialize)]
    struct WithMetrics<'a> {
        score: f64,
        details: &'a str,
        metrics: &'a Option<ComplexityMetrics>,
        #[serde(skip_serializing_if = "std::ops::Not::not")]
        failed: bool,
    }

    WithMetrics {
        score: report.score,
        details: &report.details,
        metrics: &report.metrics,
        failed: report.failed,
    }
    .serialize(serializer)
}

/// Report stored on a terminal evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EvaluationReport {
    /// The flow ran and every dimension has an entry.
    Dimensions(DimensionScores),
    /// The evaluation never reached the analyzers.
    Failure { error: String },
}

/// Rounds a score to two decimal places.
pub fn round_score(score: f64) -> f64 {
    (score * 100.0).round() / 100.0
}
