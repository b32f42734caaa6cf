//! Child-process isolates running the Node harness.
//!
//! Each run gets its own `node` process with:
//! - a V8 heap ceiling (`--max-old-space-size`)
//! - an OS data-segment limit (`RLIMIT_DATA`) at the same ceiling, which
//!   also covers array buffers outside the V8 heap
//! - the Node permission model, which denies fs, child_process and workers
//! - an empty environment and the run's working directory as cwd
//! - `kill_on_drop`, so a dropped isolate never outlives the run
//!
//! The permission model flag depends on the Node release, so the provider
//! asks the binary for its version once. Releases without a permission
//! model are refused rather than run without a filesystem jail.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::harness::node_args;
use super::isolate::{Isolate, IsolateChannel, IsolateProvider};
use super::limits::SandboxLimits;
use crate::error::SandboxError;

/// Cap on captured stderr per run.
const MAX_DIAGNOSTIC_BYTES: usize = 8 * 1024;

/// Grace period for the process to exit after it is killed.
const KILL_GRACE: Duration = Duration::from_secs(2);

/// Budget for `node --version`.
const VERSION_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

/// Provides isolates backed by a local `node` binary.
#[derive(Debug, Clone)]
pub struct NodeIsolateProvider {
    node_binary: PathBuf,
    major_version: Arc<OnceCell<u32>>,
}

impl NodeIsolateProvider {
    pub fn new(node_binary: impl Into<PathBuf>) -> Self {
        Self {
            node_binary: node_binary.into(),
            major_version: Arc::new(OnceCell::new()),
        }
    }

    /// Major version of the configured binary, asked once per provider.
    async fn major_version(&self) -> Result<u32, SandboxError> {
        self.major_version
            .get_or_try_init(|| detect_major_version(&self.node_binary))
            .await
            .copied()
    }
}

/// Returns the flag enabling the permission model on a Node major release.
///
/// Node 20 and 21 ship it as `--experimental-permission`; 22 made it
/// `--permission`. Older releases have none.
pub fn permission_flag(major: u32) -> Option<&'static str> {
    match major {
        0..=19 => None,
        20 | 21 => Some("--experimental-permission"),
        _ => Some("--permission"),
    }
}

/// Parses the major version out of `node --version` output (`v20.11.1`).
pub fn parse_major_version(output: &str) -> Option<u32> {
    output
        .trim()
        .strip_prefix('v')?
        .split('.')
        .next()?
        .parse()
        .ok()
}

async fn detect_major_version(node_binary: &Path) -> Result<u32, SandboxError> {
    let mut command = Command::new(node_binary);
    command
        .arg("--version")
        .env_clear()
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    let output = tokio::time::timeout(VERSION_CHECK_TIMEOUT, command.output())
        .await
        .map_err(|_| {
            SandboxError::ProvisionFailed(format!(
                "{} --version did not answer within {:?}",
                node_binary.display(),
                VERSION_CHECK_TIMEOUT
            ))
        })?
        .map_err(|e| {
            SandboxError::ProvisionFailed(format!(
                "failed to run {} --version: {}",
                node_binary.display(),
                e
            ))
        })?;

    let text = String::from_utf8_lossy(&output.stdout);
    let major = parse_major_version(&text).ok_or_else(|| {
        SandboxError::ProvisionFailed(format!(
            "unrecognized node version output: {:?}",
            text.trim()
        ))
    })?;
    debug!(node = %node_binary.display(), major, "Detected node version");
    Ok(major)
}

/// Caps the child's data segment (heap, anonymous mappings, array buffers).
#[cfg(unix)]
fn apply_memory_ceiling(command: &mut Command, memory_mb: u64) {
    let bytes = memory_mb.saturating_mul(1024 * 1024) as libc::rlim_t;
    let limit = libc::rlimit {
        rlim_cur: bytes,
        rlim_max: bytes,
    };
    // SAFETY: the closure runs in the forked child before exec and only
    // calls setrlimit, which is async-signal-safe.
    unsafe {
        command.pre_exec(move || {
            if libc::setrlimit(libc::RLIMIT_DATA, &limit) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

#[cfg(not(unix))]
fn apply_memory_ceiling(_command: &mut Command, memory_mb: u64) {
    warn!(memory_mb, "No OS memory limit on this platform; relying on the V8 heap ceiling");
}

impl Default for NodeIsolateProvider {
    fn default() -> Self {
        Self::new("node")
    }
}

#[async_trait]
impl IsolateProvider for NodeIsolateProvider {
    fn name(&self) -> &str {
        "process"
    }

    async fn provision(
        &self,
        workdir: &Path,
        limits: &SandboxLimits,
    ) -> Result<Box<dyn Isolate>, SandboxError> {
        let major = self.major_version().await?;
        let flag = permission_flag(major).ok_or_else(|| {
            SandboxError::ProvisionFailed(format!(
                "node v{} has no permission model; refusing to run without a filesystem jail",
                major
            ))
        })?;

        Ok(Box::new(NodeIsolate {
            node_binary: self.node_binary.clone(),
            args: node_args(limits.memory_mb, Some(flag)),
            memory_mb: limits.memory_mb,
            workdir: workdir.to_path_buf(),
            child: None,
            stderr: Arc::new(Mutex::new(String::new())),
            stderr_task: None,
        }))
    }
}

/// One `node` process.
struct NodeIsolate {
    node_binary: PathBuf,
    args: Vec<String>,
    memory_mb: u64,
    workdir: PathBuf,
    child: Option<Child>,
    stderr: Arc<Mutex<String>>,
    stderr_task: Option<JoinHandle<()>>,
}

#[async_trait]
impl Isolate for NodeIsolate {
    async fn start(&mut self) -> Result<IsolateChannel, SandboxError> {
        let mut command = Command::new(&self.node_binary);
        command
            .args(&self.args)
            .current_dir(&self.workdir)
            .env_clear()
            .env("PATH", std::env::var_os("PATH").unwrap_or_default())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        apply_memory_ceiling(&mut command, self.memory_mb);

        let mut child = command.spawn().map_err(|e| {
            SandboxError::ProvisionFailed(format!(
                "failed to spawn {}: {}",
                self.node_binary.display(),
                e
            ))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SandboxError::ProvisionFailed("stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SandboxError::ProvisionFailed("stdout not captured".to_string()))?;

        if let Some(mut stderr) = child.stderr.take() {
            let buffer = Arc::clone(&self.stderr);
            self.stderr_task = Some(tokio::spawn(async move {
                let mut chunk = [0u8; 1024];
                loop {
                    match stderr.read(&mut chunk).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if let Ok(mut text) = buffer.lock() {
                                if text.len() < MAX_DIAGNOSTIC_BYTES {
                                    text.push_str(&String::from_utf8_lossy(&chunk[..n]));
                                }
                            }
                        }
                    }
                }
            }));
        }

        debug!(pid = ?child.id(), workdir = %self.workdir.display(), "Node isolate started");
        self.child = Some(child);
        Ok(IsolateChannel::new(BufReader::new(stdout), stdin))
    }

    fn diagnostics(&self) -> Option<String> {
        let text = self.stderr.lock().ok()?;
        let trimmed = text.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    }

    async fn dispose(mut self: Box<Self>) -> Result<(), SandboxError> {
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.start_kill() {
                // Already exited.
                debug!(error = %e, "Node isolate kill skipped");
            }
            if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_err() {
                warn!("Node isolate did not exit within the kill grace period");
            }
        }
        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_binary_fails_to_provision() {
        let dir = tempfile::tempdir().expect("tempdir");
        let provider = NodeIsolateProvider::new("/nonexistent/node-binary");
        let result = provider
            .provision(dir.path(), &SandboxLimits::default())
            .await;
        assert!(matches!(result, Err(SandboxError::ProvisionFailed(_))));
    }

    #[test]
    fn test_provider_defaults() {
        let provider = NodeIsolateProvider::default();
        assert_eq!(provider.name(), "process");
        assert_eq!(provider.node_binary, PathBuf::from("node"));
        assert!(provider.major_version.get().is_none());
    }

    #[test]
    fn test_permission_flag_per_release() {
        assert_eq!(permission_flag(18), None);
        assert_eq!(permission_flag(19), None);
        assert_eq!(permission_flag(20), Some("--experimental-permission"));
        assert_eq!(permission_flag(21), Some("--experimental-permission"));
        assert_eq!(permission_flag(22), Some("--permission"));
        assert_eq!(permission_flag(24), Some("--permission"));
    }

    #[test]
    fn test_parse_major_version() {
        assert_eq!(parse_major_version("v20.20.2\n"), Some(20));
        assert_eq!(parse_major_version("v22.3.0"), Some(22));
        assert_eq!(parse_major_version("20.1.0"), None);
        assert_eq!(parse_major_version(""), None);
        assert_eq!(parse_major_version("vnext"), None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_old_release_is_refused() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().expect("tempdir");
        let fake = dir.path().join("node");
        std::fs::write(&fake, "#!/bin/sh\necho v18.19.0\n").expect("write fake node");
        std::fs::set_permissions(&fake, std::fs::Permissions::from_mode(0o755))
            .expect("chmod");

        let provider = NodeIsolateProvider::new(&fake);
        let err = provider
            .provision(dir.path(), &SandboxLimits::default())
            .await
            .err()
            .expect("node 18 must be refused");
        assert!(err.to_string().contains("no permission model"), "{}", err);
        assert_eq!(provider.major_version.get(), Some(&18));
    }
}
