//! Rationale debt analysis.
//!
//! Every reasoning step is judged independently by an LLM: was the
//! rationale flawed because of one specific irrelevant or misleading
//! context item? Judgments that cannot be obtained or trusted are recorded
//! as worst-case `SYSTEM_ERROR` events, never dropped.
//!
//! An optional total budget bounds the whole trace: each step gets the
//! smaller of the step timeout and what is left of the budget, and steps
//! reached after it runs out are recorded as `SYSTEM_ERROR` without a call.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tracing::{debug, warn};

use crate::evaluation::{DebtEvent, RationaleAnalysis, ReasoningStep};
use crate::llm::{GenerationRequest, LlmProvider, Message};
use crate::metrics::{LlmRequestStatus, MetricsCollector};
use crate::utils::extract_json_object;

/// Default per-step judgment timeout.
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(60);

const JUDGE_MAX_TOKENS: u32 = 1024;

/// Fixed instruction for the judge.
pub const RATIONALE_JUDGE_PROMPT: &str = r#"You are auditing one step of an AI coding agent's reasoning for contextual debt.

Contextual debt occurs when a rationale is flawed specifically because the agent relied on a piece of consumed context that was irrelevant, outdated or misleading for the stated goal.

You will receive the step's goal, the context items the agent consumed (each with an "id"), and the agent's rationale.

Decide whether the rationale is flawed BECAUSE OF exactly one consumed context item. Do not flag weak reasoning that no context item caused.

Respond with a single JSON object and nothing else:
- If there is no contextual debt: {"debtIncurred": false}
- If there is: {"debtIncurred": true, "incurredByContextId": "<id of the offending context item>", "debtScore": <number between 0 and 1, higher means more damaging>, "details": "<one or two sentences explaining the flaw>"}"#;

/// Parsed verdict for one step.
#[derive(Debug, Clone, PartialEq)]
pub enum DebtJudgment {
    NoDebt,
    Debt {
        context_id: String,
        score: f64,
        details: String,
    },
    /// The reply could not be used as a judgment.
    Malformed(String),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawJudgment {
    debt_incurred: Option<bool>,
    incurred_by_context_id: Option<String>,
    debt_score: Option<f64>,
    details: Option<String>,
}

impl DebtJudgment {
    /// Parses a judge reply for `step`.
    ///
    /// A reply is malformed when it carries no JSON object, lacks
    /// `debtIncurred`, scores outside `[0, 1]`, or blames a context id the
    /// step never consumed.
    pub fn parse(reply: &str, step: &ReasoningStep) -> Self {
        let object = match extract_json_object(reply) {
            Ok(object) => object,
            Err(e) => return DebtJudgment::Malformed(e.to_string()),
        };
        let raw: RawJudgment = match serde_json::from_value(serde_json::Value::Object(object)) {
            Ok(raw) => raw,
            Err(e) => return DebtJudgment::Malformed(format!("unexpected judgment shape: {}", e)),
        };

        match raw.debt_incurred {
            None => DebtJudgment::Malformed("judgment is missing debtIncurred".to_string()),
            Some(false) => DebtJudgment::NoDebt,
            Some(true) => {
                let context_id = match raw.incurred_by_context_id {
                    Some(id) if !id.trim().is_empty() => id,
                    _ => {
                        return DebtJudgment::Malformed(
                            "judgment flags debt without incurredByContextId".to_string(),
                        )
                    }
                };
                if !step.consumed(&context_id) {
                    return DebtJudgment::Malformed(format!(
                        "judgment blames context id '{}' which the step did not consume",
                        context_id
                    ));
                }
                let score = match raw.debt_score {
                    Some(score) if score.is_finite() && (0.0..=1.0).contains(&score) => score,
                    Some(score) => {
                        return DebtJudgment::Malformed(format!(
                            "debtScore {} is outside [0, 1]",
                            score
                        ))
                    }
                    None => {
                        return DebtJudgment::Malformed(
                            "judgment flags debt without debtScore".to_string(),
                        )
                    }
                };

                DebtJudgment::Debt {
                    context_id,
                    score,
                    details: raw.details.unwrap_or_default(),
                }
            }
        }
    }

    /// The event this judgment contributes to the trace, if any.
    pub fn into_event(self, step_index: u32) -> Option<DebtEvent> {
        match self {
            DebtJudgment::NoDebt => None,
            DebtJudgment::Debt {
                context_id,
                score,
                details,
            } => Some(DebtEvent {
                step_index,
                incurred_by_context_id: context_id,
                debt_score: score,
                details,
            }),
            DebtJudgment::Malformed(reason) => Some(DebtEvent::system_error(
                step_index,
                format!("Analysis failed: {}", reason),
            )),
        }
    }
}

/// Judges reasoning steps with an injected LLM provider.
#[derive(Clone)]
pub struct RationaleAnalyzer {
    llm: Arc<dyn LlmProvider>,
    model: String,
    temperature: f64,
    step_timeout: Duration,
    total_budget: Option<Duration>,
    metrics: MetricsCollector,
}

impl RationaleAnalyzer {
    /// Creates an analyzer. An empty `model` defers to the provider's default.
    pub fn new(llm: Arc<dyn LlmProvider>, model: impl Into<String>) -> Self {
        Self {
            llm,
            model: model.into(),
            temperature: 0.0,
            step_timeout: DEFAULT_STEP_TIMEOUT,
            total_budget: None,
            metrics: MetricsCollector::new(),
        }
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_step_timeout(mut self, step_timeout: Duration) -> Self {
        self.step_timeout = step_timeout;
        self
    }

    /// Bounds the time spent judging one whole trace.
    pub fn with_total_budget(mut self, budget: Duration) -> Self {
        self.total_budget = Some(budget);
        self
    }

    /// Judges every step in order and folds the events into a score.
    pub async fn analyze(&self, steps: &[ReasoningStep]) -> RationaleAnalysis {
        let deadline = self.total_budget.map(|budget| Instant::now() + budget);
        let mut trace = Vec::new();
        for step in steps {
            let timeout = match deadline {
                Some(deadline) => self
                    .step_timeout
                    .min(deadline.saturating_duration_since(Instant::now())),
                None => self.step_timeout,
            };
            let judgment = if timeout.is_zero() {
                DebtJudgment::Malformed(format!(
                    "judge budget of {} seconds exhausted before this step",
                    self.total_budget.unwrap_or_default().as_secs()
                ))
            } else {
                self.judge_step_within(step, timeout).await
            };
            if let Some(event) = judgment.into_event(step.step_index) {
                debug!(
                    step_index = event.step_index,
                    context_id = %event.incurred_by_context_id,
                    debt_score = event.debt_score,
                    "Debt event recorded"
                );
                trace.push(event);
            }
        }
        RationaleAnalysis::from_trace(trace)
    }

    /// Obtains and parses the judgment for one step.
    pub async fn judge_step(&self, step: &ReasoningStep) -> DebtJudgment {
        self.judge_step_within(step, self.step_timeout).await
    }

    async fn judge_step_within(&self, step: &ReasoningStep, timeout: Duration) -> DebtJudgment {
        let request = match self.build_request(step) {
            Ok(request) => request,
            Err(e) => return DebtJudgment::Malformed(format!("failed to encode step: {}", e)),
        };

        let started = Instant::now();
        let result = tokio::time::timeout(timeout, self.llm.generate(request)).await;
        let latency = started.elapsed();

        match result {
            Ok(Ok(response)) => {
                self.metrics
                    .record_llm_request(&self.model, LlmRequestStatus::Success, latency);
                match response.first_content() {
                    Some(content) => DebtJudgment::parse(content, step),
                    None => DebtJudgment::Malformed("judge returned no content".to_string()),
                }
            }
            Ok(Err(e)) => {
                self.metrics
                    .record_llm_request(&self.model, LlmRequestStatus::Error, latency);
                warn!(step_index = step.step_index, error = %e, "Judge request failed");
                DebtJudgment::Malformed(format!("judge request failed: {}", e))
            }
            Err(_) => {
                self.metrics
                    .record_llm_request(&self.model, LlmRequestStatus::Timeout, latency);
                warn!(
                    step_index = step.step_index,
                    timeout_ms = timeout.as_millis() as u64,
                    "Judge request timed out"
                );
                DebtJudgment::Malformed(format!(
                    "judge request timed out after {} ms",
                    timeout.as_millis()
                ))
            }
        }
    }

    fn build_request(&self, step: &ReasoningStep) -> Result<GenerationRequest, serde_json::Error> {
        let context = serde_json::to_string_pretty(&step.consumed_context)?;
        let user = format!(
            "Goal:\n{}\n\nConsumed context:\n{}\n\nRationale:\n{}",
            step.goal, context, step.rationale
        );

        Ok(GenerationRequest::new(
            self.model.clone(),
            vec![Message::system(RATIONALE_JUDGE_PROMPT), Message::user(user)],
        )
        .with_temperature(self.temperature)
        .with_max_tokens(JUDGE_MAX_TOKENS)
        .with_json_mode())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LlmError;
    use crate::evaluation::ContextItem;
    use crate::llm::GenerationResponse;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays scripted replies in order and records prompts.
    struct ScriptedLlm {
        replies: Mutex<VecDeque<Result<String, LlmError>>>,
        prompts: Mutex<Vec<GenerationRequest>>,
        delay: Option<Duration>,
    }

    impl ScriptedLlm {
        fn new(replies: Vec<Result<String, LlmError>>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                prompts: Mutex::new(Vec::new()),
                delay: None,
            }
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedLlm {
        async fn generate(
            &self,
            request: GenerationRequest,
        ) -> Result<GenerationResponse, LlmError> {
            self.prompts.lock().unwrap().push(request);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let reply = self
                .replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(r#"{"debtIncurred": false}"#.to_string()))?;
            Ok(GenerationResponse::from_content("judge", reply))
        }
    }

    fn step(index: u32) -> ReasoningStep {
        ReasoningStep::new(index, "Add two numbers", "Use the helper from ctx")
            .with_context(ContextItem::new("ctx-1", "file", "function add(a, b) {}"))
            .with_context(ContextItem::new("ctx-2", "search", "unrelated blog post"))
    }

    #[tokio::test]
    async fn test_empty_trace_scores_one() {
        let llm = Arc::new(ScriptedLlm::new(vec![]));
        let analyzer = RationaleAnalyzer::new(llm.clone(), "judge");
        let analysis = analyzer.analyze(&[]).await;
        assert_eq!(analysis.overall_score, 1.0);
        assert!(analysis.trace.is_empty());
        assert!(llm.prompts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_second_step_flagged() {
        let llm = Arc::new(ScriptedLlm::new(vec![
            Ok(r#"{"debtIncurred": false}"#.to_string()),
            Ok(r#"{"debtIncurred": true, "incurredByContextId": "ctx-2", "debtScore": 0.7, "details": "followed the blog"}"#.to_string()),
        ]));
        let analyzer = RationaleAnalyzer::new(llm, "judge");
        let analysis = analyzer.analyze(&[step(0), step(1)]).await;

        assert!((analysis.overall_score - 0.3).abs() < 1e-9);
        assert_eq!(analysis.trace.len(), 1);
        assert_eq!(analysis.trace[0].step_index, 1);
        assert_eq!(analysis.trace[0].incurred_by_context_id, "ctx-2");
    }

    #[tokio::test]
    async fn test_prompt_carries_goal_context_and_rationale() {
        let llm = Arc::new(ScriptedLlm::new(vec![]));
        let analyzer = RationaleAnalyzer::new(llm.clone(), "judge");
        analyzer.analyze(&[step(0)]).await;

        let prompts = llm.prompts.lock().unwrap();
        let request = &prompts[0];
        assert_eq!(request.messages[0].content, RATIONALE_JUDGE_PROMPT);
        let user = &request.messages[1].content;
        assert!(user.contains("Add two numbers"));
        assert!(user.contains("ctx-2"));
        assert!(user.contains("Use the helper from ctx"));
        assert_eq!(request.temperature, Some(0.0));
    }

    #[tokio::test]
    async fn test_llm_failure_becomes_system_error() {
        let llm = Arc::new(ScriptedLlm::new(vec![Err(LlmError::RequestFailed(
            "connection refused".to_string(),
        ))]));
        let analyzer = RationaleAnalyzer::new(llm, "judge");
        let analysis = analyzer.analyze(&[step(3)]).await;

        assert_eq!(analysis.trace.len(), 1);
        assert!(analysis.trace[0].is_system_error());
        assert_eq!(analysis.trace[0].debt_score, 1.0);
        assert_eq!(analysis.trace[0].step_index, 3);
        assert_eq!(analysis.overall_score, 0.0);
    }

    #[tokio::test]
    async fn test_step_timeout_becomes_system_error() {
        let mut llm = ScriptedLlm::new(vec![]);
        llm.delay = Some(Duration::from_millis(200));
        let analyzer = RationaleAnalyzer::new(Arc::new(llm), "judge")
            .with_step_timeout(Duration::from_millis(20));
        let analysis = analyzer.analyze(&[step(0)]).await;

        assert_eq!(analysis.trace.len(), 1);
        assert!(analysis.trace[0].is_system_error());
        assert!(analysis.trace[0].details.contains("timed out"));
    }

    #[tokio::test]
    async fn test_hung_judge_is_bounded_by_total_budget() {
        let mut llm = ScriptedLlm::new(vec![]);
        llm.delay = Some(Duration::from_secs(30));
        let llm = Arc::new(llm);
        let analyzer = RationaleAnalyzer::new(llm.clone(), "judge")
            .with_step_timeout(Duration::from_millis(200))
            .with_total_budget(Duration::from_millis(300));

        let steps: Vec<_> = (0..5).map(step).collect();
        let started = Instant::now();
        let analysis = analyzer.analyze(&steps).await;

        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(analysis.trace.len(), 5);
        assert!(analysis.trace.iter().all(|e| e.is_system_error()));
        assert_eq!(analysis.overall_score, 0.0);
        // Two calls fit in the budget; the rest are recorded without one.
        assert_eq!(llm.prompts.lock().unwrap().len(), 2);
        assert!(analysis.trace[4].details.contains("budget"));
    }

    #[test]
    fn test_parse_variants() {
        let s = step(0);
        assert_eq!(
            DebtJudgment::parse("```json\n{\"debtIncurred\": false}\n```", &s),
            DebtJudgment::NoDebt
        );
        assert!(matches!(
            DebtJudgment::parse(
                r#"{"debtIncurred": true, "incurredByContextId": "ctx-1", "debtScore": 0.25}"#,
                &s
            ),
            DebtJudgment::Debt { score, .. } if score == 0.25
        ));
    }

    #[test]
    fn test_parse_rejects_untrustworthy_judgments() {
        let s = step(0);
        let malformed = [
            "no json here",
            r#"{"details": "missing flag"}"#,
            r#"{"debtIncurred": true, "incurredByContextId": "ctx-1", "debtScore": 1.5}"#,
            r#"{"debtIncurred": true, "incurredByContextId": "ctx-1", "debtScore": -0.1}"#,
            r#"{"debtIncurred": true, "debtScore": 0.5}"#,
            r#"{"debtIncurred": true, "incurredByContextId": "ctx-9", "debtScore": 0.5}"#,
            r#"{"debtIncurred": true, "incurredByContextId": "ctx-1"}"#,
            r#"{"debtIncurred": "yes"}"#,
        ];
        for reply in malformed {
            assert!(
                matches!(DebtJudgment::parse(reply, &s), DebtJudgment::Malformed(_)),
                "expected malformed for {}",
                reply
            );
        }
    }

    #[test]
    fn test_malformed_event_is_worst_case() {
        let event = DebtJudgment::Malformed("bad".to_string())
            .into_event(2)
            .expect("event");
        assert!(event.is_system_error());
        assert_eq!(event.debt_score, 1.0);
        assert!(DebtJudgment::NoDebt.into_event(0).is_none());
    }
}
