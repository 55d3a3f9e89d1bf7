//! Error taxonomy for external tool invocations.
//!
//! Everything stagehand shells out to (git, npm, the service command itself)
//! fails in one of three distinguishable ways: the binary is absent, the
//! command ran and failed, or the command exceeded its time budget. Keeping
//! the three apart matters because the messages are surfaced verbatim to the
//! user and a timeout must not read like a hard failure.

/// Failure of an external tool invocation.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    /// The tool binary could not be found on PATH.
    #[error("{tool} not found — {hint}")]
    Missing { tool: &'static str, hint: &'static str },
    /// The tool ran but exited non-zero; stderr carries the detail.
    #[error("{tool} failed: {stderr}")]
    Failed { tool: &'static str, stderr: String },
    /// The tool exceeded its time budget and was killed.
    #[error("{tool} timed out")]
    TimedOut { tool: &'static str },
}

impl ToolError {
    /// Classifies a spawn error: a missing binary becomes `Missing`, anything
    /// else (permissions, fd exhaustion) becomes `Failed`.
    pub fn from_spawn(tool: &'static str, hint: &'static str, err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            ToolError::Missing { tool, hint }
        } else {
            ToolError::Failed {
                tool,
                stderr: err.to_string(),
            }
        }
    }
}
