//! Fan-in of child results into the evaluation verdict.

use serde::de::DeserializeOwned;

use crate::evaluation::{
    ArchitecturalAnalysis, DimensionReport, DimensionScores, RationaleAnalysis, TestingAnalysis,
    ARCHITECTURAL_QUEUE, RATIONALE_QUEUE, TESTING_QUEUE,
};
use crate::scheduler::{ChildOutcome, ChildStatus};

/// Builds the three report dimensions from the children's outcomes.
///
/// Each dimension is looked up by queue name. A missing, failed or
/// unreadable child yields a zero-score entry whose details say why.
pub fn aggregate(outcomes: &[ChildOutcome]) -> DimensionScores {
    DimensionScores {
        rationale_debt: dimension::<RationaleAnalysis>(outcomes, RATIONALE_QUEUE),
        architectural_coherence_debt: dimension::<ArchitecturalAnalysis>(
            outcomes,
            ARCHITECTURAL_QUEUE,
        ),
        testing_verification_debt: dimension::<TestingAnalysis>(outcomes, TESTING_QUEUE),
    }
}

fn dimension<T>(outcomes: &[ChildOutcome], queue: &str) -> DimensionReport
where
    T: DeserializeOwned + Into<DimensionReport>,
{
    let Some(outcome) = outcomes.iter().find(|o| o.queue_name == queue) else {
        return DimensionReport::failed(format!("{}: no result was recorded.", queue));
    };

    if outcome.status == ChildStatus::Failed {
        return DimensionReport::failed(format!(
            "{}: job failed: {}",
            queue,
            outcome.error.as_deref().unwrap_or("unknown error")
        ));
    }

    let Some(value) = outcome.return_value.clone() else {
        return DimensionReport::failed(format!("{}: job returned no result.", queue));
    };

    match serde_json::from_value::<T>(value) {
        Ok(analysis) => {
            let report: DimensionReport = analysis.into();
            if (0.0..=1.0).contains(&report.score) {
                report
            } else {
                DimensionReport::failed(format!(
                    "{}: score {} is outside [0, 1].",
                    queue, report.score
                ))
            }
        }
        Err(e) => DimensionReport::failed(format!("{}: unreadable result: {}", queue, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluation::{EvaluationStatus, EvaluationVerdict};
    use crate::scheduler::Job;
    use serde_json::json;

    fn completed(queue: &str, value: serde_json::Value) -> ChildOutcome {
        ChildOutcome::completed(&Job::new(queue, json!({})), value)
    }

    fn failed(queue: &str, error: &str) -> ChildOutcome {
        ChildOutcome::failed(&Job::new(queue, json!({})), error)
    }

    #[test]
    fn test_mean_of_three_children() {
        let outcomes = vec![
            completed(RATIONALE_QUEUE, json!({"overallScore": 0.8, "trace": []})),
            completed(
                ARCHITECTURAL_QUEUE,
                json!({"score": 1.0, "details": "fine", "metrics": null}),
            ),
            completed(TESTING_QUEUE, json!({"score": 0.9, "details": "All tests passed."})),
        ];

        let scores = aggregate(&outcomes);
        assert_eq!(scores.contextual_debt_score(), 0.9);

        let verdict = EvaluationVerdict::from_dimensions(scores);
        assert_eq!(verdict.status, EvaluationStatus::Complete);
        assert_eq!(verdict.contextual_debt_score, 0.9);
    }

    #[test]
    fn test_failed_child_scores_zero_and_evaluation_completes() {
        let outcomes = vec![
            completed(RATIONALE_QUEUE, json!({"overallScore": 0.6, "trace": []})),
            failed(ARCHITECTURAL_QUEUE, "Job timed out after 300s"),
            completed(TESTING_QUEUE, json!({"score": 0.9, "details": ""})),
        ];

        let scores = aggregate(&outcomes);
        assert!(scores.architectural_coherence_debt.failed);
        assert_eq!(scores.architectural_coherence_debt.score, 0.0);
        assert!(scores
            .architectural_coherence_debt
            .details
            .contains("timed out"));
        assert_eq!(scores.contextual_debt_score(), 0.5);
        assert_eq!(
            EvaluationVerdict::from_dimensions(scores).status,
            EvaluationStatus::Complete
        );
    }

    #[test]
    fn test_missing_and_corrupt_children() {
        let outcomes = vec![
            completed(RATIONALE_QUEUE, json!({"unexpected": true})),
            completed(TESTING_QUEUE, json!({"score": 7.5, "details": "?"})),
        ];

        let scores = aggregate(&outcomes);
        assert!(scores.rationale_debt.details.contains("unreadable"));
        assert!(scores
            .architectural_coherence_debt
            .details
            .contains("no result"));
        assert!(scores.testing_verification_debt.details.contains("outside"));
        assert!(scores.all_failed());
        assert_eq!(
            EvaluationVerdict::from_dimensions(scores).status,
            EvaluationStatus::Failed
        );
    }
}
