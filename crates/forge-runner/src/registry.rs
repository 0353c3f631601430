use std::collections::HashMap;
use std::sync::Arc;

use crate::{CliRunner, RunnerError};

/// Named registry of available CLI runners with a configurable default.
pub struct RunnerRegistry {
    runners: HashMap<String, Arc<dyn CliRunner>>,
    default_name: String,
}

impl RunnerRegistry {
    pub fn new(default_name: impl Into<String>) -> Self {
        Self {
            runners: HashMap::new(),
            default_name: default_name.into(),
        }
    }

    /// Adds a runner under the given name.
    pub fn register(&mut self, name: impl Into<String>, runner: Arc<dyn CliRunner>) {
        let name = name.into();
        tracing::info!(cli = %name, "CLI registered");
        self.runners.insert(name, runner);
    }

    /// Returns the runner for the given name, or the default when empty.
    pub fn get(&self, name: &str) -> Result<Arc<dyn CliRunner>, RunnerError> {
        let effective = if name.is_empty() {
            self.default_name.as_str()
        } else {
            name
        };
        self.runners
            .get(effective)
            .cloned()
            .ok_or_else(|| RunnerError::UnknownCli(effective.to_string()))
    }

    /// Names of all registered runners.
    pub fn available(&self) -> Vec<String> {
        self.runners.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;

    use super::RunnerRegistry;
    use crate::{CliRunner, RunOptions, RunOutcome, RunnerError};

    struct NoopRunner;

    #[async_trait]
    impl CliRunner for NoopRunner {
        async fn run(&self, _opts: RunOptions) -> Result<RunOutcome, RunnerError> {
            Ok(RunOutcome::default())
        }
    }

    #[test]
    fn unit_empty_name_resolves_the_default_runner() {
        let mut registry = RunnerRegistry::new("claude-code");
        registry.register("claude-code", Arc::new(NoopRunner));

        assert!(registry.get("").is_ok());
        assert!(registry.get("claude-code").is_ok());
        let error = match registry.get("missing") {
            Err(error) => error,
            Ok(_) => panic!("unknown CLI must fail"),
        };
        assert!(error.to_string().contains("unknown CLI: missing"));
    }
}
