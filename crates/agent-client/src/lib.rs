//! `ag-client` — the Agent Client: a bidirectional conduit to one agent
//! subprocess (the "Claude Code" CLI).
//!
//! Mirrors the spawn/monitor/drain shape used by the exec tool this
//! crate was generalized from: a background task owns the child process,
//! reads its stdout as newline-delimited JSON, and forwards parsed
//! events to whoever called `ask`.

mod options;
mod process;

pub use options::{AgentOptions, McpServerSpec, ResumeToken};
pub use process::{AgentClient, AgentEventStream};
