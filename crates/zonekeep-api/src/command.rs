use std::time::Duration;

use anyhow::Context;
use tokio::process::Command;

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// Runs a short-lived administrative command with a hard timeout.
pub async fn run(program: &str, args: &[&str], timeout: Duration) -> anyhow::Result<CommandOutput> {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(std::process::Stdio::null())
        .kill_on_drop(true);

    let out = tokio::time::timeout(timeout, cmd.output())
        .await
        .map_err(|_| {
            anyhow::anyhow!(
                "`{program} {}` timed out after {}ms",
                args.join(" "),
                timeout.as_millis()
            )
        })?
        .with_context(|| format!("run `{program} {}`", args.join(" ")))?;

    Ok(CommandOutput {
        success: out.status.success(),
        code: out.status.code(),
        stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
    })
}
