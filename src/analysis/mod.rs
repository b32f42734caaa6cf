//! The three contextual debt analyzers.
//!
//! - `rationale`: LLM-judged debt in each reasoning step
//! - `architectural`: static complexity of the submitted source
//! - `testing`: sandboxed execution of the submitted tests
//!
//! Analyzers never return errors. Collaborator failures are folded into
//! the score and details of their dimension.

pub mod architectural;
pub mod rationale;
pub mod testing;

pub use architectural::{
    compute_metrics, maintainability_index, ArchitecturalAnalyzer, ParseFailure,
    DEFAULT_COMPLEXITY_THRESHOLD, DEFAULT_MAINTAINABILITY_CEILING,
};
pub use rationale::{DebtJudgment, RationaleAnalyzer, DEFAULT_STEP_TIMEOUT, RATIONALE_JUDGE_PROMPT};
pub use testing::{score_outcome, TestingAnalyzer, FAILED_SCORE, NO_TESTS_DETAILS, PASSED_SCORE};
