//! Testing verification analysis.
//!
//! Runs the agent's tests against its source inside a sandbox and maps
//! the outcome to a score:
//!
//! | Outcome                   | Score |
//! |---------------------------|-------|
//! | no tests                  | 0.0   |
//! | runtime error             | 0.0   |
//! | timeout or isolate fault  | 0.0   |
//! | tests passed              | 0.9   |
//! | tests failed              | 0.2   |

use crate::evaluation::TestingAnalysis;
use crate::sandbox::{RunOutcome, SandboxExecutor, SandboxProgram, SandboxReport};

/// Score for a run whose tests passed. Passing is evidence, not proof.
pub const PASSED_SCORE: f64 = 0.9;

/// Score for a run whose tests ran and failed.
pub const FAILED_SCORE: f64 = 0.2;

/// Details recorded when a submission carries no tests.
pub const NO_TESTS_DETAILS: &str = "No tests were provided.";

/// Maps sandbox outcomes to testing scores.
#[derive(Clone)]
pub struct TestingAnalyzer {
    executor: SandboxExecutor,
}

impl TestingAnalyzer {
    pub fn new(executor: SandboxExecutor) -> Self {
        Self { executor }
    }

    /// Scores the submission. Never fails.
    pub async fn analyze(&self, source_code: &str, test_code: Option<&str>) -> TestingAnalysis {
        self.analyze_with_report(source_code, test_code).await.0
    }

    /// Scores the submission and returns the sandbox record when one ran.
    pub async fn analyze_with_report(
        &self,
        source_code: &str,
        test_code: Option<&str>,
    ) -> (TestingAnalysis, Option<SandboxReport>) {
        let test_code = match test_code {
            Some(code) if !code.trim().is_empty() => code,
            _ => {
                return (
                    TestingAnalysis {
                        score: 0.0,
                        details: NO_TESTS_DETAILS.to_string(),
                    },
                    None,
                )
            }
        };

        let report = self
            .executor
            .execute(&SandboxProgram::new(source_code, test_code))
            .await;
        (score_outcome(&report.outcome), Some(report))
    }
}

/// Maps one sandbox outcome to a testing result.
pub fn score_outcome(outcome: &RunOutcome) -> TestingAnalysis {
    match outcome {
        RunOutcome::Completed {
            passed: true,
            details,
        } => TestingAnalysis {
            score: PASSED_SCORE,
            details: if details.is_empty() {
                "All tests passed.".to_string()
            } else {
                details.clone()
            },
        },
        RunOutcome::Completed {
            passed: false,
            details,
        } => TestingAnalysis {
            score: FAILED_SCORE,
            details: format!("Tests failed: {}", details),
        },
        RunOutcome::RuntimeError { message } => TestingAnalysis {
            score: 0.0,
            details: format!("Runtime Error: {}", message),
        },
        RunOutcome::TimedOut { timeout_ms } => TestingAnalysis {
            score: 0.0,
            details: format!("Timeout: test execution exceeded {} ms.", timeout_ms),
        },
        RunOutcome::Faulted { reason } => TestingAnalysis {
            score: 0.0,
            details: format!("Sandbox Fault: {}", reason),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SandboxError;
    use crate::sandbox::{Isolate, IsolateProvider, NodeIsolateProvider, SandboxLimits};
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Counts provisioning attempts and always fails them.
    #[derive(Default)]
    struct CountingProvider {
        provisioned: AtomicUsize,
    }

    #[async_trait]
    impl IsolateProvider for CountingProvider {
        fn name(&self) -> &str {
            "counting"
        }

        async fn provision(
            &self,
            _workdir: &Path,
            _limits: &SandboxLimits,
        ) -> Result<Box<dyn Isolate>, SandboxError> {
            self.provisioned.fetch_add(1, Ordering::SeqCst);
            Err(SandboxError::ProvisionFailed("no isolates here".to_string()))
        }
    }

    fn counting() -> (TestingAnalyzer, Arc<CountingProvider>) {
        let provider = Arc::new(CountingProvider::default());
        let executor = SandboxExecutor::new(provider.clone(), SandboxLimits::default());
        (TestingAnalyzer::new(executor), provider)
    }

    #[tokio::test]
    async fn test_missing_tests_never_provision() {
        let (analyzer, provider) = counting();

        for tests in [None, Some(""), Some("   \n")] {
            let result = analyzer.analyze("function add(a,b){return a+b;}", tests).await;
            assert_eq!(result.score, 0.0);
            assert_eq!(result.details, NO_TESTS_DETAILS);
        }
        assert_eq!(provider.provisioned.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_provision_failure_scores_zero() {
        let (analyzer, provider) = counting();
        let result = analyzer.analyze("let a = 1;", Some("assert.ok(a)")).await;
        assert_eq!(result.score, 0.0);
        assert!(result.details.starts_with("Sandbox Fault:"));
        assert_eq!(provider.provisioned.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_outcome_mapping() {
        let passed = score_outcome(&RunOutcome::Completed {
            passed: true,
            details: String::new(),
        });
        assert_eq!(passed.score, 0.9);
        assert_eq!(passed.details, "All tests passed.");

        let failed = score_outcome(&RunOutcome::Completed {
            passed: false,
            details: "expected 3".to_string(),
        });
        assert_eq!(failed.score, 0.2);
        assert!(failed.details.contains("expected 3"));

        let runtime = score_outcome(&RunOutcome::RuntimeError {
            message: "TypeError: x is not a function".to_string(),
        });
        assert_eq!(runtime.score, 0.0);
        assert!(runtime.details.starts_with("Runtime Error:"));

        let timeout = score_outcome(&RunOutcome::TimedOut { timeout_ms: 4500 });
        assert_eq!(timeout.score, 0.0);
        assert!(timeout.details.contains("Timeout"));
        assert!(timeout.details.contains("4500"));
    }

    fn node_analyzer() -> TestingAnalyzer {
        let executor = SandboxExecutor::new(
            Arc::new(NodeIsolateProvider::default()),
            SandboxLimits::default(),
        );
        TestingAnalyzer::new(executor)
    }

    #[tokio::test]
    #[ignore = "requires node >= 20 on PATH; the permission model flag is picked per release"]
    async fn test_node_passing_tests() {
        let analyzer = node_analyzer();
        let result = analyzer
            .analyze(
                "function add(a, b) { return a + b; }",
                Some("assert.strictEqual(add(1, 2), 3);"),
            )
            .await;
        assert_eq!(result.score, 0.9, "details: {}", result.details);
    }

    #[tokio::test]
    #[ignore = "requires node >= 20 on PATH; the permission model flag is picked per release"]
    async fn test_node_failing_assertion() {
        let analyzer = node_analyzer();
        let result = analyzer
            .analyze(
                "function add(a, b) { return a - b; }",
                Some("assert.strictEqual(add(1, 2), 3);"),
            )
            .await;
        assert_eq!(result.score, 0.2, "details: {}", result.details);
    }

    #[tokio::test]
    #[ignore = "requires node >= 20 on PATH; the permission model flag is picked per release"]
    async fn test_node_runtime_error_cleans_workdir() {
        let analyzer = node_analyzer();
        let (result, report) = analyzer
            .analyze_with_report("let a = 1;", Some("throw new TypeError('boom');"))
            .await;
        assert_eq!(result.score, 0.0);
        assert!(result.details.starts_with("Runtime Error:"), "{}", result.details);
        let workdir = report.and_then(|r| r.workdir).expect("workdir");
        assert!(!workdir.exists());
    }

    #[tokio::test]
    #[ignore = "requires node >= 20 on PATH; the permission model flag is picked per release"]
    async fn test_node_infinite_loop_times_out() {
        let executor = SandboxExecutor::new(
            Arc::new(NodeIsolateProvider::default()),
            SandboxLimits::default().with_timeout_ms(500),
        );
        let result = TestingAnalyzer::new(executor)
            .analyze("let a = 1;", Some("while (true) {}"))
            .await;
        assert_eq!(result.score, 0.0);
        assert!(result.details.contains("Timeout"));
    }

    #[tokio::test]
    #[ignore = "requires node >= 20 on PATH; the permission model flag is picked per release"]
    async fn test_node_scoped_file_round_trip() {
        let analyzer = node_analyzer();
        let result = analyzer
            .analyze(
                "async function save(v) { await writeFile('out/v.txt', String(v)); }",
                Some("await save(5); assert.strictEqual(await readFile('out/v.txt'), '5');"),
            )
            .await;
        assert_eq!(result.score, 0.9, "details: {}", result.details);
    }

    #[tokio::test]
    #[ignore = "requires node >= 20 on PATH; the permission model flag is picked per release"]
    async fn test_node_tests_cannot_reach_the_host_realm() {
        let outside = tempfile::tempdir().expect("tempdir");
        let marker = outside.path().join("escaped.txt");
        let target = serde_json::to_string(&marker.to_string_lossy()).expect("path literal");
        let analyzer = node_analyzer();

        for entry in [
            "assert.constructor.constructor",
            "writeFile.constructor",
            "console.log.constructor",
            "(async () => {}).constructor",
        ] {
            let tests = format!(
                "const host = {entry}('return process')();\n\
                 host.mainModule.require('fs').writeFileSync({target}, 'x');\n\
                 report(true, 'left the context');"
            );
            let result = analyzer.analyze("let a = 1;", Some(tests.as_str())).await;
            assert_eq!(result.score, 0.0, "{}: {}", entry, result.details);
            assert!(result.details.contains("EvalError"), "{}: {}", entry, result.details);
            assert!(!marker.exists(), "{} wrote outside the workdir", entry);
        }
    }

    #[tokio::test]
    #[ignore = "requires node >= 20 on PATH; the permission model flag is picked per release"]
    async fn test_node_array_buffers_count_against_memory_limit() {
        let executor = SandboxExecutor::new(
            Arc::new(NodeIsolateProvider::default()),
            SandboxLimits::default().with_memory_mb(128),
        );
        let result = TestingAnalyzer::new(executor)
            .analyze(
                "const held = [];",
                Some(
                    "for (let i = 0; i < 8; i++) held.push(new Uint8Array(64 * 1024 * 1024));\n\
                     report(true, 'allocated ' + held.length * 64 + ' MB');",
                ),
            )
            .await;
        assert_eq!(result.score, 0.0, "details: {}", result.details);
        assert!(!result.details.contains("allocated"), "{}", result.details);
    }
}
