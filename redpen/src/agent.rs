//! Waking the coding agent.
//!
//! The agent runs in a tmux pane named after the review target. Waking it
//! means typing one line of instructions into that pane and pressing Enter.

use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::process::Command;
use tracing::{debug, info};

/// Upper bound on each `tmux` invocation.
pub const TMUX_TIMEOUT: Duration = Duration::from_secs(5);

/// Instruction sent after an approval.
pub const COMMIT_INSTRUCTION: &str = "Commit the current changes.";

#[derive(Debug, thiserror::Error)]
pub enum WakeError {
    #[error("failed to run tmux: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("tmux did not finish within {}s", TMUX_TIMEOUT.as_secs())]
    Timeout,

    #[error("tmux send-keys failed: {0}")]
    Failed(String),
}

/// Delivers an instruction to the agent working on `target`.
pub trait AgentWake: Send + Sync + 'static {
    fn wake<'a>(&'a self, target: &'a str, instruction: &'a str) -> BoxFuture<'a, Result<(), WakeError>>;
}

/// Types into the agent's tmux pane.
#[derive(Debug, Clone)]
pub struct TmuxWake {
    session: String,
}

impl TmuxWake {
    pub fn new(session: impl Into<String>) -> Self {
        Self { session: session.into() }
    }

    /// `tmux` target for the first pane of the agent session of `target`.
    pub fn pane(&self, target: &str) -> String {
        format!("{}-agent-{}:0.0", self.session, sanitize_session_name(target))
    }
}

impl AgentWake for TmuxWake {
    fn wake<'a>(&'a self, target: &'a str, instruction: &'a str) -> BoxFuture<'a, Result<(), WakeError>> {
        async move {
            let pane = self.pane(target);
            let line = one_line(instruction);
            // Literal text and Enter go separately; with `-l` a trailing
            // "Enter" would be typed as a word.
            send_keys(&["send-keys", "-t", &pane, "-l", &line]).await?;
            send_keys(&["send-keys", "-t", &pane, "Enter"]).await?;
            info!(%pane, "agent woken");
            Ok(())
        }
        .boxed()
    }
}

async fn send_keys(args: &[&str]) -> Result<(), WakeError> {
    let mut cmd = Command::new("tmux");
    cmd.args(args).kill_on_drop(true);
    let output = tokio::time::timeout(TMUX_TIMEOUT, cmd.output())
        .await
        .map_err(|_| WakeError::Timeout)??;
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_owned();
    Err(WakeError::Failed(if stderr.is_empty() {
        format!("exit status {}", output.status)
    } else {
        stderr
    }))
}

/// Logs instead of waking anyone. Used when tmux is disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopWake;

impl AgentWake for NoopWake {
    fn wake<'a>(&'a self, target: &'a str, instruction: &'a str) -> BoxFuture<'a, Result<(), WakeError>> {
        async move {
            debug!(target_name = target, instruction, "agent wake skipped (tmux disabled)");
            Ok(())
        }
        .boxed()
    }
}

/// Restricts a target name to `[A-Za-z0-9_-]` for use in a tmux session name.
///
/// Other characters become `_`, runs of `_` collapse, and leading/trailing
/// `_` are trimmed. An empty result becomes `default`.
pub fn sanitize_session_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        let c = if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' };
        if c == '_' && out.ends_with('_') {
            continue;
        }
        out.push(c);
    }
    let trimmed = out.trim_matches('_');
    if trimmed.is_empty() {
        "default".to_owned()
    } else {
        trimmed.to_owned()
    }
}

/// Collapses all whitespace runs to single spaces.
pub fn one_line(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Instruction pointing the agent at a hand-off document.
///
/// `handoff` is relative to the target root, which is the agent's cwd.
pub fn review_instruction(handoff: &str) -> String {
    format!(
        "Read {handoff} and address each review comment in it. \
         Every item names a file and line range."
    )
}
