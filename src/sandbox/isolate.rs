//! Isolation seam for sandbox runs.
//!
//! An [`IsolateProvider`] hands out one [`Isolate`] per run. The executor
//! starts it, talks to it over an [`IsolateChannel`], and always disposes
//! it. Implementations decide the isolation technology: a resource-capped
//! child process ([`super::process`]) or a locked-down container
//! ([`super::docker`]).

use std::path::Path;

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncWrite};

use super::limits::SandboxLimits;
use crate::error::SandboxError;

/// Duplex byte channel to a running isolate.
pub struct IsolateChannel {
    /// Protocol lines coming from the isolate.
    pub reader: Box<dyn AsyncBufRead + Send + Unpin>,
    /// Protocol lines going to the isolate.
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
}

impl IsolateChannel {
    pub fn new(
        reader: impl AsyncBufRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }
}

/// One isolated execution context.
#[async_trait]
pub trait Isolate: Send {
    /// Launches the harness and returns the protocol channel.
    async fn start(&mut self) -> Result<IsolateChannel, SandboxError>;

    /// Diagnostic output collected outside the protocol, such as stderr.
    fn diagnostics(&self) -> Option<String> {
        None
    }

    /// Destroys the isolate. Called exactly once on every exit path.
    async fn dispose(self: Box<Self>) -> Result<(), SandboxError>;
}

/// Factory for isolates.
#[async_trait]
pub trait IsolateProvider: Send + Sync {
    /// Short name used in logs and metrics.
    fn name(&self) -> &str;

    /// Allocates an isolate bound to `workdir` with the given limits.
    async fn provision(
        &self,
        workdir: &Path,
        limits: &SandboxLimits,
    ) -> Result<Box<dyn Isolate>, SandboxError>;
}
