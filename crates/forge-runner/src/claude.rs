use std::path::Path;
use std::process::Stdio;
use std::time::Instant as WallInstant;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;

use crate::{CliRunner, RunOptions, RunOutcome, RunnerError};

const LINE_BUFFER_BYTES: usize = 1024 * 1024;
const STDERR_SNIPPET_CHARS: usize = 500;

/// Adapter for the Claude Code CLI in `--output-format stream-json` mode.
///
/// Relative binary paths containing a separator are resolved to absolute ones
/// so they stay valid after the working directory switches to the task
/// workspace; bare names resolve through `PATH`.
pub struct ClaudeCodeRunner {
    binary_path: String,
}

impl ClaudeCodeRunner {
    pub fn new(binary_path: impl Into<String>) -> Self {
        let mut binary_path = binary_path.into();
        if binary_path.contains(std::path::MAIN_SEPARATOR) {
            if let Ok(absolute) = std::fs::canonicalize(&binary_path) {
                binary_path = absolute.display().to_string();
            }
        }
        Self { binary_path }
    }
}

#[async_trait]
impl CliRunner for ClaudeCodeRunner {
    async fn run(&self, opts: RunOptions) -> Result<RunOutcome, RunnerError> {
        let mut args: Vec<String> = vec![
            "-p".to_string(),
            opts.prompt.clone(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
            "--permission-mode".to_string(),
            "bypassPermissions".to_string(),
        ];
        if !opts.model.is_empty() {
            args.push("--model".to_string());
            args.push(opts.model.clone());
        }
        if opts.max_turns > 0 {
            args.push("--max-turns".to_string());
            args.push(opts.max_turns.to_string());
        }
        if opts.max_budget_usd > 0.0 {
            args.push("--max-budget-usd".to_string());
            args.push(format!("{:.2}", opts.max_budget_usd));
        }

        let mut command = Command::new(&self.binary_path);
        command
            .args(&args)
            .current_dir(&opts.work_dir)
            .env("ANTHROPIC_API_KEY", &opts.api_key)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        {
            command.process_group(0);
            apply_privilege_drop(&mut command);
        }

        let started = WallInstant::now();
        let mut child = command.spawn().map_err(|source| RunnerError::Spawn {
            binary: self.binary_path.clone(),
            source,
        })?;
        let pid = child.id();

        tracing::info!(
            pid,
            work_dir = %opts.work_dir.display(),
            "claude CLI started"
        );

        let stdout = child.stdout.take().ok_or_else(|| {
            RunnerError::Io(std::io::Error::other("child stdout pipe missing"))
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            RunnerError::Io(std::io::Error::other("child stderr pipe missing"))
        })?;

        let stderr_task = tokio::spawn(async move {
            let mut buffer = String::new();
            let mut reader = BufReader::new(stderr);
            let _ = reader.read_to_string(&mut buffer).await;
            buffer
        });

        let mut lines = BufReader::with_capacity(LINE_BUFFER_BYTES, stdout).lines();
        let deadline = tokio::time::sleep_until(opts.deadline);
        tokio::pin!(deadline);

        let mut extraction = StreamExtraction::default();

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    match line? {
                        Some(line) => {
                            if line.is_empty() {
                                continue;
                            }
                            if let Some(sink) = &opts.event_sink {
                                let _ = sink.send(line.clone());
                            }
                            extraction.absorb(&line);
                        }
                        None => break,
                    }
                }
                _ = opts.cancel.cancelled() => {
                    kill_process_group(pid);
                    let _ = child.wait().await;
                    return Err(RunnerError::Cancelled);
                }
                () = &mut deadline => {
                    kill_process_group(pid);
                    let _ = child.wait().await;
                    return Err(RunnerError::DeadlineExceeded);
                }
            }
        }

        let status = tokio::select! {
            status = child.wait() => status?,
            _ = opts.cancel.cancelled() => {
                kill_process_group(pid);
                let _ = child.wait().await;
                return Err(RunnerError::Cancelled);
            }
            () = &mut deadline => {
                kill_process_group(pid);
                let _ = child.wait().await;
                return Err(RunnerError::DeadlineExceeded);
            }
        };

        let duration = started.elapsed();
        let outcome = RunOutcome {
            output: extraction.output(),
            exit_code: status.code().unwrap_or(-1),
            duration,
            input_tokens: extraction.input_tokens,
            output_tokens: extraction.output_tokens,
        };

        if !status.success() {
            let stderr = stderr_task.await.unwrap_or_default();
            tracing::warn!(
                exit_code = outcome.exit_code,
                stderr = %stderr.trim(),
                ?duration,
                "claude CLI exited with error"
            );
            return Err(RunnerError::NonZeroExit {
                exit_code: outcome.exit_code,
                stderr: truncate_chars(stderr.trim(), STDERR_SNIPPET_CHARS),
                outcome,
            });
        }

        tracing::info!(
            exit_code = outcome.exit_code,
            ?duration,
            input_tokens = outcome.input_tokens,
            output_tokens = outcome.output_tokens,
            "claude CLI completed"
        );
        Ok(outcome)
    }
}

/// Running state of result-text and usage extraction over the stream.
#[derive(Debug, Default)]
struct StreamExtraction {
    result_text: String,
    last_assistant_text: String,
    input_tokens: u64,
    output_tokens: u64,
}

impl StreamExtraction {
    fn absorb(&mut self, line: &str) {
        let Ok(event) = serde_json::from_str::<Value>(line) else {
            return;
        };
        match event.get("type").and_then(Value::as_str) {
            Some("result") => {
                if let Some(result) = event.get("result").and_then(Value::as_str) {
                    if !result.is_empty() {
                        self.result_text = result.to_string();
                    }
                }
                if let Some(usage) = event.get("usage") {
                    self.input_tokens += usage
                        .get("input_tokens")
                        .and_then(Value::as_u64)
                        .unwrap_or(0);
                    self.output_tokens += usage
                        .get("output_tokens")
                        .and_then(Value::as_u64)
                        .unwrap_or(0);
                }
            }
            Some("assistant") => {
                // When the final result event carries subtype
                // "error_during_execution" its result field is empty; the
                // latest assistant text is the only usable output.
                let text = assistant_text(&event);
                if !text.is_empty() {
                    self.last_assistant_text = text;
                }
            }
            _ => {}
        }
    }

    fn output(&self) -> String {
        if !self.result_text.is_empty() {
            return self.result_text.clone();
        }
        self.last_assistant_text.clone()
    }
}

fn assistant_text(event: &Value) -> String {
    let Some(content) = event
        .get("message")
        .and_then(|message| message.get("content"))
        .and_then(Value::as_array)
    else {
        return String::new();
    };
    let mut text = String::new();
    for block in content {
        if block.get("type").and_then(Value::as_str) == Some("text") {
            if let Some(part) = block.get("text").and_then(Value::as_str) {
                text.push_str(part);
            }
        }
    }
    text
}

/// Kills the child's entire process group so agent-spawned descendants
/// (notably MCP subprocesses) cannot outlive a cancelled task.
#[cfg(unix)]
fn kill_process_group(pid: Option<u32>) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pid) = pid else { return };
    let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
}

#[cfg(not(unix))]
fn kill_process_group(_pid: Option<u32>) {}

/// When running as root, execute the agent as the unprivileged `codeforge`
/// user (its root check refuses `bypassPermissions`) and point
/// HOME/SHELL/USER at that account.
#[cfg(unix)]
fn apply_privilege_drop(command: &mut Command) {
    use nix::unistd::{Uid, User};

    if !Uid::effective().is_root() {
        return;
    }
    let Ok(Some(user)) = User::from_name("codeforge") else {
        return;
    };

    command.uid(user.uid.as_raw());
    command.gid(user.gid.as_raw());
    command.env("HOME", user.dir.display().to_string());
    command.env("SHELL", "/bin/sh");
    command.env("USER", "codeforge");
    tracing::debug!(
        uid = user.uid.as_raw(),
        gid = user.gid.as_raw(),
        "dropping privileges for claude CLI"
    );
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut shortened: String = text.chars().take(max).collect();
    shortened.push_str("...");
    shortened
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};
    use std::time::Duration;

    use forge_core::CancelToken;
    use tokio::sync::mpsc;
    use tokio::time::Instant;

    use super::{ClaudeCodeRunner, StreamExtraction};
    use crate::{CliRunner, RunOptions, RunnerError};

    #[cfg(unix)]
    fn write_script(dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let script = dir.join("mock-claude.sh");
        let content = format!("#!/bin/sh\n{body}\n");
        std::fs::write(&script, content).expect("write script");
        let mut perms = std::fs::metadata(&script)
            .expect("script metadata")
            .permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&script, perms).expect("chmod script");
        script
    }

    fn options(work_dir: &Path, sink: Option<mpsc::UnboundedSender<String>>) -> RunOptions {
        RunOptions {
            prompt: "Add a hello world function".to_string(),
            work_dir: work_dir.to_path_buf(),
            model: String::new(),
            api_key: "test-key".to_string(),
            max_turns: 0,
            max_budget_usd: 0.0,
            event_sink: sink,
            cancel: CancelToken::new(),
            deadline: Instant::now() + Duration::from_secs(30),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn integration_stream_json_run_extracts_result_and_usage() {
        let dir = tempfile::tempdir().expect("tempdir");
        let script = write_script(
            dir.path(),
            r#"
printf '%s\n' '{"type":"system","subtype":"init","model":"mock-claude"}'
printf '%s\n' '{"type":"assistant","message":{"content":[{"type":"text","text":"working on it"}]}}'
printf '%s\n' '{"type":"result","subtype":"success","result":"done: hello world added","usage":{"input_tokens":150,"output_tokens":50}}'
"#,
        );
        let (tx, mut rx) = mpsc::unbounded_channel();

        let outcome = ClaudeCodeRunner::new(script.display().to_string())
            .run(options(dir.path(), Some(tx)))
            .await
            .expect("run");

        assert_eq!(outcome.output, "done: hello world added");
        assert_eq!(outcome.exit_code, 0);
        assert_eq!(outcome.input_tokens, 150);
        assert_eq!(outcome.output_tokens, 50);

        let mut forwarded = Vec::new();
        while let Ok(line) = rx.try_recv() {
            forwarded.push(line);
        }
        assert_eq!(forwarded.len(), 3);
        assert!(forwarded[0].contains("\"system\""));
        assert!(forwarded[2].contains("\"result\""));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn functional_empty_result_falls_back_to_assistant_text() {
        let dir = tempfile::tempdir().expect("tempdir");
        let script = write_script(
            dir.path(),
            r#"
printf '%s\n' '{"type":"assistant","message":{"content":[{"type":"text","text":"partial answer"}]}}'
printf '%s\n' '{"type":"result","subtype":"error_during_execution","result":"","usage":{"input_tokens":10,"output_tokens":2}}'
"#,
        );

        let outcome = ClaudeCodeRunner::new(script.display().to_string())
            .run(options(dir.path(), None))
            .await
            .expect("run");
        assert_eq!(outcome.output, "partial answer");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn regression_non_zero_exit_carries_stderr_and_outcome() {
        let dir = tempfile::tempdir().expect("tempdir");
        let script = write_script(
            dir.path(),
            r#"
printf '%s\n' '{"type":"assistant","message":{"content":[{"type":"text","text":"got partway"}]}}'
echo "mock CLI: simulated failure" >&2
exit 1
"#,
        );

        let error = ClaudeCodeRunner::new(script.display().to_string())
            .run(options(dir.path(), None))
            .await
            .expect_err("non-zero exit must fail");
        match error {
            RunnerError::NonZeroExit {
                exit_code,
                stderr,
                outcome,
            } => {
                assert_eq!(exit_code, 1);
                assert!(stderr.contains("simulated failure"));
                assert_eq!(outcome.output, "got partway");
            }
            other => panic!("expected NonZeroExit, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn regression_deadline_kills_the_run() {
        let dir = tempfile::tempdir().expect("tempdir");
        let script = write_script(dir.path(), "sleep 600");

        let mut opts = options(dir.path(), None);
        opts.deadline = Instant::now() + Duration::from_millis(200);

        let started = std::time::Instant::now();
        let error = ClaudeCodeRunner::new(script.display().to_string())
            .run(opts)
            .await
            .expect_err("deadline must fail the run");
        assert!(matches!(error, RunnerError::DeadlineExceeded));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn functional_cancel_token_kills_the_run() {
        let dir = tempfile::tempdir().expect("tempdir");
        let script = write_script(dir.path(), "sleep 600");

        let cancel = CancelToken::new();
        let mut opts = options(dir.path(), None);
        opts.cancel = cancel.clone();

        let handle = tokio::spawn(async move {
            ClaudeCodeRunner::new(script.display().to_string())
                .run(opts)
                .await
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();

        let error = handle.await.expect("join").expect_err("cancel must fail the run");
        assert!(matches!(error, RunnerError::Cancelled));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn functional_no_events_yield_empty_completion() {
        let dir = tempfile::tempdir().expect("tempdir");
        let script = write_script(dir.path(), "exit 0");

        let outcome = ClaudeCodeRunner::new(script.display().to_string())
            .run(options(dir.path(), None))
            .await
            .expect("run");
        assert_eq!(outcome.output, "");
        assert_eq!(outcome.exit_code, 0);
    }

    #[test]
    fn unit_extraction_prefers_result_text_and_sums_usage() {
        let mut extraction = StreamExtraction::default();
        extraction.absorb(
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"draft"}]}}"#,
        );
        extraction.absorb(
            r#"{"type":"result","result":"final","usage":{"input_tokens":5,"output_tokens":7}}"#,
        );
        assert_eq!(extraction.output(), "final");
        assert_eq!(extraction.input_tokens, 5);
        assert_eq!(extraction.output_tokens, 7);
    }

    #[test]
    fn unit_extraction_ignores_unparseable_lines() {
        let mut extraction = StreamExtraction::default();
        extraction.absorb("not json at all");
        extraction.absorb(r#"{"type":"unknown","payload":true}"#);
        assert_eq!(extraction.output(), "");
    }
}
