//! Resource limits applied to every sandbox run.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default heap ceiling for an isolate, in megabytes.
pub const DEFAULT_MEMORY_MB: u64 = 128;

/// Default wall-clock budget for a run, in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 4500;

/// Largest file the scoped capabilities will write or return.
pub const DEFAULT_MAX_FILE_BYTES: usize = 1024 * 1024;

/// Resource limits for one sandbox run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxLimits {
    /// Memory ceiling in megabytes.
    pub memory_mb: u64,
    /// Wall-clock timeout in milliseconds, covering run and collect.
    pub timeout_ms: u64,
    /// Maximum size of a single file read or written through the capabilities.
    pub max_file_bytes: usize,
    /// Maximum number of processes (Docker isolates only).
    pub max_processes: i64,
    /// CPU cores available (Docker isolates only).
    pub cpu_cores: f64,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            memory_mb: DEFAULT_MEMORY_MB,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            max_file_bytes: DEFAULT_MAX_FILE_BYTES,
            max_processes: 64,
            cpu_cores: 1.0,
        }
    }
}

impl SandboxLimits {
    pub fn with_memory_mb(mut self, memory_mb: u64) -> Self {
        self.memory_mb = memory_mb;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_max_file_bytes(mut self, max_file_bytes: usize) -> Self {
        self.max_file_bytes = max_file_bytes;
        self
    }

    /// Returns the timeout as a `Duration`.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Returns memory limit in bytes.
    pub fn memory_bytes(&self) -> i64 {
        (self.memory_mb * 1024 * 1024) as i64
    }

    /// Returns CPU period in microseconds (fixed at 100ms).
    pub fn cpu_period(&self) -> i64 {
        100_000
    }

    /// Returns CPU quota for the allocated cores.
    pub fn cpu_quota(&self) -> i64 {
        (self.cpu_period() as f64 * self.cpu_cores) as i64
    }
}
