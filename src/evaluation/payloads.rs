//! Job payloads for the evaluation flow.
//!
//! Each child job carries exactly the fields its analyzer needs. Payloads
//! reject unknown fields so a producer that leaks extra submission data is
//! caught by the consumer.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::submission::{ReasoningStep, Submission};

/// Job and queue name of the parent aggregation job.
pub const EVALUATION_FLOW_QUEUE: &str = "evaluation-flow";
/// Job and queue name of the rationale child.
pub const RATIONALE_QUEUE: &str = "rationale-analysis";
/// Job and queue name of the architectural child.
pub const ARCHITECTURAL_QUEUE: &str = "architectural-analysis";
/// Job and queue name of the testing child.
pub const TESTING_QUEUE: &str = "testing-analysis";

/// Every queue the evaluator consumes.
pub const ALL_QUEUES: [&str; 4] = [
    EVALUATION_FLOW_QUEUE,
    RATIONALE_QUEUE,
    ARCHITECTURAL_QUEUE,
    TESTING_QUEUE,
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct FlowJobData {
    pub evaluation_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RationaleJobData {
    pub steps: Vec<ReasoningStep>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ArchitecturalJobData {
    pub source_code: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TestingJobData {
    pub source_code: String,
    #[serde(default)]
    pub test_code: Option<String>,
}

impl From<&Submission> for RationaleJobData {
    fn from(submission: &Submission) -> Self {
        Self {
            steps: submission.reasoning_trace(),
        }
    }
}

impl From<&Submission> for ArchitecturalJobData {
    fn from(submission: &Submission) -> Self {
        Self {
            source_code: submission.source_code.clone(),
        }
    }
}

impl From<&Submission> for TestingJobData {
    fn from(submission: &Submission) -> Self {
        Self {
            source_code: submission.source_code.clone(),
            test_code: submission.test_code.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn submission() -> Submission {
        Submission::new("function add(a, b) { return a + b; }")
            .with_test_code("assert.equal(add(1, 2), 3);")
            .with_steps(vec![ReasoningStep::new(0, "add", "simple")])
    }

    #[test]
    fn test_rationale_payload_carries_only_steps() {
        let json = serde_json::to_value(RationaleJobData::from(&submission())).expect("serialize");
        let keys: Vec<&String> = json.as_object().expect("object").keys().collect();
        assert_eq!(keys, vec!["steps"]);
    }

    #[test]
    fn test_architectural_payload_carries_only_source() {
        let json =
            serde_json::to_value(ArchitecturalJobData::from(&submission())).expect("serialize");
        let keys: Vec<&String> = json.as_object().expect("object").keys().collect();
        assert_eq!(keys, vec!["sourceCode"]);
    }

    #[test]
    fn test_testing_payload_carries_source_and_tests() {
        let json = serde_json::to_value(TestingJobData::from(&submission())).expect("serialize");
        let object = json.as_object().expect("object");
        assert_eq!(object.len(), 2);
        assert!(object.contains_key("sourceCode"));
        assert!(object.contains_key("testCode"));
    }

    #[test]
    fn test_payloads_reject_leaked_fields() {
        let leaked = serde_json::json!({"steps": [], "sourceCode": "secret"});
        assert!(serde_json::from_value::<RationaleJobData>(leaked).is_err());

        let leaked = serde_json::json!({"sourceCode": "x", "testCode": "y"});
        assert!(serde_json::from_value::<ArchitecturalJobData>(leaked).is_err());
    }

    #[test]
    fn test_flow_payload_wire_name() {
        let id = Uuid::new_v4();
        let json = serde_json::to_value(FlowJobData { evaluation_id: id }).expect("serialize");
        assert_eq!(json["evaluationId"], id.to_string());
    }
}
