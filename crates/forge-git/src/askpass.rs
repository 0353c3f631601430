use std::io::Write;

use anyhow::{Context, Result};
use tempfile::NamedTempFile;

/// Askpass helper script handed to git through `GIT_ASKPASS`.
///
/// Git invokes the script for username and password prompts; it answers with
/// the access token, so the token never appears in the remote URL or in
/// `.git/config`. The temporary script is removed when the guard drops.
pub struct AskPass {
    script: NamedTempFile,
}

impl AskPass {
    /// Writes the helper script for the given token and marks it executable.
    pub fn create(token: &str) -> Result<Self> {
        let mut script = tempfile::Builder::new()
            .prefix("codeforge-askpass-")
            .suffix(".sh")
            .tempfile()
            .context("creating askpass script")?;

        let escaped = shell_escape(token);
        script
            .write_all(format!("#!/bin/sh\necho '{escaped}'\n").as_bytes())
            .context("writing askpass script")?;
        script.flush().context("flushing askpass script")?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let permissions = std::fs::Permissions::from_mode(0o700);
            std::fs::set_permissions(script.path(), permissions)
                .context("marking askpass script executable")?;
        }

        Ok(Self { script })
    }

    /// Environment entries for authenticated git invocations. An empty token
    /// yields only `GIT_TERMINAL_PROMPT=0`.
    pub fn env(token: &str) -> Result<(Vec<(String, String)>, Option<AskPass>)> {
        if token.is_empty() {
            return Ok((
                vec![("GIT_TERMINAL_PROMPT".to_string(), "0".to_string())],
                None,
            ));
        }
        let helper = Self::create(token)?;
        let env = vec![
            (
                "GIT_ASKPASS".to_string(),
                helper.script.path().display().to_string(),
            ),
            ("GIT_TERMINAL_PROMPT".to_string(), "0".to_string()),
        ];
        Ok((env, Some(helper)))
    }
}

/// Escapes single quotes for safe embedding inside a single-quoted shell string.
fn shell_escape(value: &str) -> String {
    value.replace('\'', "'\"'\"'")
}

#[cfg(test)]
mod tests {
    use super::{shell_escape, AskPass};

    #[test]
    fn unit_shell_escape_handles_single_quotes() {
        assert_eq!(shell_escape("plain-token"), "plain-token");
        assert_eq!(shell_escape("to'ken"), "to'\"'\"'ken");
    }

    #[test]
    fn unit_empty_token_disables_prompts_only() {
        let (env, helper) = AskPass::env("").expect("askpass env");
        assert!(helper.is_none());
        assert_eq!(
            env,
            vec![("GIT_TERMINAL_PROMPT".to_string(), "0".to_string())]
        );
    }

    #[cfg(unix)]
    #[test]
    fn functional_script_echoes_token_and_is_removed_on_drop() {
        use std::os::unix::fs::PermissionsExt;

        let (env, helper) = AskPass::env("secret-token").expect("askpass env");
        let helper = helper.expect("helper for non-empty token");
        let path = env
            .iter()
            .find(|(key, _)| key == "GIT_ASKPASS")
            .map(|(_, value)| std::path::PathBuf::from(value))
            .expect("GIT_ASKPASS entry");

        let mode = std::fs::metadata(&path)
            .expect("script metadata")
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o700);

        let body = std::fs::read_to_string(&path).expect("script body");
        assert!(body.contains("echo 'secret-token'"));

        drop(helper);
        assert!(!path.exists(), "script must be removed when the guard drops");
    }
}
