//! Evaluator configuration.
//!
//! Every setting has a default and can be overridden from the environment.
//! The language-model endpoint is configured separately through
//! `LiteLlmClient::from_env`.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::analysis::{DEFAULT_COMPLEXITY_THRESHOLD, DEFAULT_MAINTAINABILITY_CEILING};
use crate::sandbox::{SandboxLimits, DEFAULT_SANDBOX_IMAGE};
use crate::scheduler::DEFAULT_KEY_PREFIX;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Which isolate provider runs the testing sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxBackend {
    /// A local `node` process.
    Process,
    /// A `node` container driven through the Docker daemon.
    Docker,
}

impl FromStr for SandboxBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "process" | "node" => Ok(SandboxBackend::Process),
            "docker" => Ok(SandboxBackend::Docker),
            other => Err(format!("expected 'process' or 'docker', got '{}'", other)),
        }
    }
}

impl std::fmt::Display for SandboxBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SandboxBackend::Process => write!(f, "process"),
            SandboxBackend::Docker => write!(f, "docker"),
        }
    }
}

/// Configuration for the evaluation service and its workers.
#[derive(Debug, Clone)]
pub struct EvaluatorConfig {
    // Service
    pub bind_addr: String,

    // Queues
    /// Redis URL. `None` selects the in-process queue.
    pub redis_url: Option<String>,
    pub queue_prefix: String,
    pub workers_per_queue: usize,
    pub job_timeout: Duration,
    pub job_max_attempts: u32,
    pub poll_interval: Duration,

    // Storage
    /// PostgreSQL URL. `None` selects the in-memory store.
    pub database_url: Option<String>,
    /// JSON task list seeding the in-memory task pool.
    pub task_file: Option<PathBuf>,

    // Collaborators
    pub agent_timeout: Duration,
    pub llm_temperature: f64,
    pub rationale_step_timeout: Duration,

    // Sandbox
    pub sandbox_backend: SandboxBackend,
    pub sandbox_memory_mb: u64,
    pub sandbox_timeout_ms: u64,
    pub node_binary: PathBuf,
    pub sandbox_image: String,

    // Architectural analysis
    pub maintainability_ceiling: f64,
    pub complexity_threshold: u32,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        let limits = SandboxLimits::default();
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),

            redis_url: None,
            queue_prefix: DEFAULT_KEY_PREFIX.to_string(),
            workers_per_queue: 2,
            job_timeout: Duration::from_secs(300),
            job_max_attempts: 3,
            poll_interval: Duration::from_secs(1),

            database_url: None,
            task_file: None,

            agent_timeout: Duration::from_secs(120),
            llm_temperature: 0.0,
            rationale_step_timeout: Duration::from_secs(60),

            sandbox_backend: SandboxBackend::Process,
            sandbox_memory_mb: limits.memory_mb,
            sandbox_timeout_ms: limits.timeout_ms,
            node_binary: PathBuf::from("node"),
            sandbox_image: DEFAULT_SANDBOX_IMAGE.to_string(),

            maintainability_ceiling: DEFAULT_MAINTAINABILITY_CEILING,
            complexity_threshold: DEFAULT_COMPLEXITY_THRESHOLD,
        }
    }
}

impl EvaluatorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `DEBT_FORGE_BIND_ADDR`: HTTP bind address (default: 0.0.0.0:8080)
    /// - `REDIS_URL`: Redis URL; unset uses the in-process queue
    /// - `DEBT_FORGE_QUEUE_PREFIX`: Redis key prefix (default: debt-forge)
    /// - `DEBT_FORGE_WORKERS_PER_QUEUE`: workers per analyzer queue (default: 2)
    /// - `DEBT_FORGE_JOB_TIMEOUT_SECS`: per-job timeout (default: 300)
    /// - `DEBT_FORGE_JOB_MAX_ATTEMPTS`: attempts before dead-lettering (default: 3)
    /// - `DEBT_FORGE_POLL_INTERVAL_SECS`: dequeue wait (default: 1)
    /// - `DATABASE_URL`: PostgreSQL URL; unset uses the in-memory store
    /// - `DEBT_FORGE_TASK_FILE`: JSON task list for the in-memory task pool
    /// - `DEBT_FORGE_AGENT_TIMEOUT_SECS`: agent call timeout (default: 120)
    /// - `DEBT_FORGE_LLM_TEMPERATURE`: judge temperature (default: 0.0)
    /// - `DEBT_FORGE_RATIONALE_STEP_TIMEOUT_SECS`: per-step judge timeout (default: 60)
    /// - `DEBT_FORGE_SANDBOX_BACKEND`: `process` or `docker` (default: process)
    /// - `DEBT_FORGE_SANDBOX_MEMORY_MB`: isolate memory ceiling (default: 128)
    /// - `DEBT_FORGE_SANDBOX_TIMEOUT_MS`: isolate wall-clock timeout (default: 4500)
    /// - `DEBT_FORGE_NODE_BINARY`: node executable (default: node)
    /// - `DEBT_FORGE_SANDBOX_IMAGE`: image for the docker backend (default: node:20-alpine)
    /// - `DEBT_FORGE_MAINTAINABILITY_CEILING`: MI mapped to score 1.0 (default: 171)
    /// - `DEBT_FORGE_COMPLEXITY_THRESHOLD`: CC above which a note is added (default: 10)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value or the
    /// result fails validation.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let present = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(val) = present("DEBT_FORGE_BIND_ADDR") {
            config.bind_addr = val;
        }

        config.redis_url = present("REDIS_URL");
        if let Some(val) = present("DEBT_FORGE_QUEUE_PREFIX") {
            config.queue_prefix = val;
        }
        if let Some(val) = present("DEBT_FORGE_WORKERS_PER_QUEUE") {
            config.workers_per_queue = parse_env_value(&val, "DEBT_FORGE_WORKERS_PER_QUEUE")?;
        }
        if let Some(val) = present("DEBT_FORGE_JOB_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "DEBT_FORGE_JOB_TIMEOUT_SECS")?;
            config.job_timeout = Duration::from_secs(secs);
        }
        if let Some(val) = present("DEBT_FORGE_JOB_MAX_ATTEMPTS") {
            config.job_max_attempts = parse_env_value(&val, "DEBT_FORGE_JOB_MAX_ATTEMPTS")?;
        }
        if let Some(val) = present("DEBT_FORGE_POLL_INTERVAL_SECS") {
            let secs: u64 = parse_env_value(&val, "DEBT_FORGE_POLL_INTERVAL_SECS")?;
            config.poll_interval = Duration::from_secs(secs);
        }

        config.database_url = present("DATABASE_URL");
        config.task_file = present("DEBT_FORGE_TASK_FILE").map(PathBuf::from);

        if let Some(val) = present("DEBT_FORGE_AGENT_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "DEBT_FORGE_AGENT_TIMEOUT_SECS")?;
            config.agent_timeout = Duration::from_secs(secs);
        }
        if let Some(val) = present("DEBT_FORGE_LLM_TEMPERATURE") {
            config.llm_temperature = parse_env_value(&val, "DEBT_FORGE_LLM_TEMPERATURE")?;
        }
        if let Some(val) = present("DEBT_FORGE_RATIONALE_STEP_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "DEBT_FORGE_RATIONALE_STEP_TIMEOUT_SECS")?;
            config.rationale_step_timeout = Duration::from_secs(secs);
        }

        if let Some(val) = present("DEBT_FORGE_SANDBOX_BACKEND") {
            config.sandbox_backend = val.parse().map_err(|message| ConfigError::InvalidValue {
                key: "DEBT_FORGE_SANDBOX_BACKEND".to_string(),
                message,
            })?;
        }
        if let Some(val) = present("DEBT_FORGE_SANDBOX_MEMORY_MB") {
            config.sandbox_memory_mb = parse_env_value(&val, "DEBT_FORGE_SANDBOX_MEMORY_MB")?;
        }
        if let Some(val) = present("DEBT_FORGE_SANDBOX_TIMEOUT_MS") {
            config.sandbox_timeout_ms = parse_env_value(&val, "DEBT_FORGE_SANDBOX_TIMEOUT_MS")?;
        }
        if let Some(val) = present("DEBT_FORGE_NODE_BINARY") {
            config.node_binary = PathBuf::from(val);
        }
        if let Some(val) = present("DEBT_FORGE_SANDBOX_IMAGE") {
            config.sandbox_image = val;
        }

        if let Some(val) = present("DEBT_FORGE_MAINTAINABILITY_CEILING") {
            config.maintainability_ceiling =
                parse_env_value(&val, "DEBT_FORGE_MAINTAINABILITY_CEILING")?;
        }
        if let Some(val) = present("DEBT_FORGE_COMPLEXITY_THRESHOLD") {
            config.complexity_threshold = parse_env_value(&val, "DEBT_FORGE_COMPLEXITY_THRESHOLD")?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` naming the first invalid field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bind_addr.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::ValidationFailed(format!(
                "bind_addr '{}' is not a socket address",
                self.bind_addr
            )));
        }

        if self.queue_prefix.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "queue_prefix cannot be empty".to_string(),
            ));
        }

        if self.workers_per_queue == 0 {
            return Err(ConfigError::ValidationFailed(
                "workers_per_queue must be greater than 0".to_string(),
            ));
        }

        if self.job_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "job_timeout must be greater than 0".to_string(),
            ));
        }

        if self.job_max_attempts == 0 {
            return Err(ConfigError::ValidationFailed(
                "job_max_attempts must be greater than 0".to_string(),
            ));
        }

        if self.agent_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "agent_timeout must be greater than 0".to_string(),
            ));
        }

        if !(0.0..=2.0).contains(&self.llm_temperature) {
            return Err(ConfigError::ValidationFailed(
                "llm_temperature must be between 0.0 and 2.0".to_string(),
            ));
        }

        if self.rationale_step_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "rationale_step_timeout must be greater than 0".to_string(),
            ));
        }

        if self.rationale_step_timeout >= self.rationale_budget() {
            return Err(ConfigError::ValidationFailed(
                "rationale_step_timeout must be shorter than 90% of job_timeout".to_string(),
            ));
        }

        if self.sandbox_memory_mb < 16 {
            return Err(ConfigError::ValidationFailed(
                "sandbox_memory_mb must be at least 16 MB".to_string(),
            ));
        }

        if self.sandbox_timeout_ms == 0 {
            return Err(ConfigError::ValidationFailed(
                "sandbox_timeout_ms must be greater than 0".to_string(),
            ));
        }

        // The job must outlive the sandbox it waits on.
        if self.job_timeout <= Duration::from_millis(self.sandbox_timeout_ms) {
            return Err(ConfigError::ValidationFailed(
                "job_timeout must exceed sandbox_timeout_ms".to_string(),
            ));
        }

        if self.sandbox_backend == SandboxBackend::Docker && self.sandbox_image.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "sandbox_image cannot be empty with the docker backend".to_string(),
            ));
        }

        if !(self.maintainability_ceiling.is_finite() && self.maintainability_ceiling > 0.0) {
            return Err(ConfigError::ValidationFailed(
                "maintainability_ceiling must be a positive number".to_string(),
            ));
        }

        Ok(())
    }

    /// Sandbox limits derived from this configuration.
    /// Time allowed for judging a whole trace: 90% of `job_timeout`, so a
    /// hung judge ends in `SYSTEM_ERROR` events before the job times out.
    pub fn rationale_budget(&self) -> Duration {
        self.job_timeout.mul_f64(0.9)
    }

    pub fn sandbox_limits(&self) -> SandboxLimits {
        SandboxLimits::default()
            .with_memory_mb(self.sandbox_memory_mb)
            .with_timeout_ms(self.sandbox_timeout_ms)
    }

    pub fn with_bind_addr(mut self, addr: impl Into<String>) -> Self {
        self.bind_addr = addr.into();
        self
    }

    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = Some(url.into());
        self
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = Some(url.into());
        self
    }

    pub fn with_task_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.task_file = Some(path.into());
        self
    }

    pub fn with_workers_per_queue(mut self, workers: usize) -> Self {
        self.workers_per_queue = workers;
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    pub fn with_job_max_attempts(mut self, attempts: u32) -> Self {
        self.job_max_attempts = attempts;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_agent_timeout(mut self, timeout: Duration) -> Self {
        self.agent_timeout = timeout;
        self
    }

    pub fn with_llm_temperature(mut self, temperature: f64) -> Self {
        self.llm_temperature = temperature;
        self
    }

    pub fn with_rationale_step_timeout(mut self, timeout: Duration) -> Self {
        self.rationale_step_timeout = timeout;
        self
    }

    pub fn with_sandbox_backend(mut self, backend: SandboxBackend) -> Self {
        self.sandbox_backend = backend;
        self
    }

    pub fn with_sandbox_memory_mb(mut self, memory_mb: u64) -> Self {
        self.sandbox_memory_mb = memory_mb;
        self
    }

    pub fn with_sandbox_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.sandbox_timeout_ms = timeout_ms;
        self
    }

    pub fn with_maintainability_ceiling(mut self, ceiling: f64) -> Self {
        self.maintainability_ceiling = ceiling;
        self
    }

    pub fn with_complexity_threshold(mut self, threshold: u32) -> Self {
        self.complexity_threshold = threshold;
        self
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}
