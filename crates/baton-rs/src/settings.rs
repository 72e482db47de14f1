//! File configuration for a complete session.
//!
//! [`Settings`] mirrors the TOML layout the `baton` binary reads. Every table
//! is optional and falls back to its defaults:
//!
//! ```toml
//! [orchestrator]
//! max_iterations = 40
//! system_prompt = "You are a careful operator."
//!
//! [retry]
//! max_retries = 3
//!
//! [cache]
//! min_prompt_length = 8000
//!
//! [compactor]
//! max_prompt_length = 120000
//! min_prompt_length = 60000
//!
//! [sandbox.allow]
//! ls = "List directory contents"
//!
//! [sandbox.deny]
//! "rm -rf" = "destructive"
//!
//! [shell]
//! timeout = 30000
//! ```
//!
//! [`Settings::build_orchestrator`] turns the settings into an
//! [`Orchestrator`] with the standard extension stack.

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::budget::{CacheConfig, CachePlacer, Compactor, CompactorConfig};
use crate::error::OrchestratorError;
use crate::extension::LoggingObserver;
use crate::orchestrator::{Orchestrator, OrchestratorConfig};
use crate::provider::{Provider, RetryConfig};
use crate::sandbox::SandboxPolicy;
use crate::tools::{ShellCapability, ShellConfig};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub orchestrator: OrchestratorConfig,
    pub retry: RetryConfig,
    pub cache: CacheConfig,
    pub compactor: CompactorConfig,
    pub sandbox: SandboxPolicy,
    pub shell: ShellConfig,
}

impl Settings {
    pub fn from_toml(text: &str) -> Result<Self, OrchestratorError> {
        let settings: Settings =
            toml::from_str(text).map_err(|e| OrchestratorError::Config(e.to_string()))?;
        settings.compactor.validate()?;
        Ok(settings)
    }

    /// Read settings from `path`.
    pub fn load(path: &Path) -> Result<Self, OrchestratorError> {
        debug!("Loading settings from {}", path.display());
        let text = std::fs::read_to_string(path).map_err(|e| {
            OrchestratorError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml(&text)
    }

    /// Orchestrator config with the `[retry]` table merged in.
    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        self.orchestrator.clone().with_retry(self.retry.clone())
    }

    /// Cache placer, compactor, shell capability and logging observer, in
    /// that order.
    pub fn build_orchestrator(
        &self,
        provider: Arc<dyn Provider>,
    ) -> Result<Orchestrator, OrchestratorError> {
        let compactor = Compactor::new(self.compactor.clone())?;
        Ok(Orchestrator::new(provider, self.orchestrator_config())
            .with_extension(CachePlacer::new(self.cache.clone()))
            .with_extension(compactor)
            .with_capability(ShellCapability::new(
                self.sandbox.clone(),
                self.shell.clone(),
            ))
            .with_observer(LoggingObserver::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    use crate::orchestrator::ParseMode;

    #[test]
    fn empty_file_uses_defaults() {
        let settings = Settings::from_toml("").unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.orchestrator.max_iterations, 1000);
    }

    #[test]
    fn tables_are_read() {
        let settings = Settings::from_toml(
            r#"
            [orchestrator]
            max_iterations = 12
            parse_mode = "tool_use"

            [retry]
            max_retries = 7

            [sandbox.allow]
            ls = "List files"

            [sandbox.deny]
            "rm -rf" = "destructive"
            "#,
        )
        .unwrap();
        assert_eq!(settings.orchestrator.max_iterations, 12);
        assert_eq!(settings.orchestrator.parse_mode, ParseMode::ToolUse);
        assert_eq!(settings.orchestrator_config().retry.max_retries, 7);
        assert_eq!(settings.sandbox.allow["ls"], "List files");
        assert_eq!(settings.sandbox.deny["rm -rf"], "destructive");
    }

    #[test]
    fn inverted_compactor_limits_are_rejected() {
        let err = Settings::from_toml(
            r#"
            [compactor]
            max_prompt_length = 10
            min_prompt_length = 20
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, OrchestratorError::Config(_)));
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[orchestrator]\nmax_iterations = 5").unwrap();
        let settings = Settings::load(file.path()).unwrap();
        assert_eq!(settings.orchestrator.max_iterations, 5);
        assert!(Settings::load(Path::new("/nonexistent/baton.toml")).is_err());
    }
}
