use std::path::Path;
use std::process::Stdio;

use anyhow::{bail, Context, Result};
use tokio::process::Command;

/// Runs `git` in `work_dir` with optional extra environment, discarding stdout.
/// Failures surface the trimmed stderr under a `git <subcommand>` prefix.
pub(crate) async fn git(
    work_dir: &Path,
    extra_env: &[(String, String)],
    args: &[&str],
) -> Result<()> {
    let output = git_raw(work_dir, extra_env, args).await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("git {}: {}", args[0], stderr.trim());
    }
    Ok(())
}

/// Runs `git` in `work_dir` and returns its stdout as a string.
pub(crate) async fn git_output(
    work_dir: &Path,
    extra_env: &[(String, String)],
    args: &[&str],
) -> Result<String> {
    let output = git_raw(work_dir, extra_env, args).await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("git {}: {}", args[0], stderr.trim());
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

async fn git_raw(
    work_dir: &Path,
    extra_env: &[(String, String)],
    args: &[&str],
) -> Result<std::process::Output> {
    let mut command = Command::new("git");
    command
        .args(args)
        .current_dir(work_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for (key, value) in extra_env {
        command.env(key, value);
    }
    command
        .output()
        .await
        .with_context(|| format!("running git {}", args[0]))
}
