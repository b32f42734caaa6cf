//! Sandboxed execution of agent-submitted tests.
//!
//! A run provisions a fresh isolate and a fresh working directory, sends
//! the program over a line protocol, answers scoped file capabilities, and
//! tears everything down on every exit path.
//!
//! ```text
//! SandboxExecutor ──provision──► IsolateProvider ──► Isolate (node process | container)
//!        │                                               │
//!        └──── ScopedFs ◄── write/read ── protocol ◄─────┘
//! ```

pub mod docker;
pub mod executor;
pub mod harness;
pub mod isolate;
pub mod limits;
pub mod process;
pub mod protocol;
pub mod scoped_fs;

pub use docker::{DockerIsolateProvider, DEFAULT_SANDBOX_IMAGE};
pub use executor::{RunOutcome, SandboxExecutor, SandboxProgram, SandboxReport, SandboxState};
pub use isolate::{Isolate, IsolateChannel, IsolateProvider};
pub use limits::SandboxLimits;
pub use process::NodeIsolateProvider;
pub use scoped_fs::ScopedFs;
