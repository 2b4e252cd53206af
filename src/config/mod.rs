//! Configuration (layered: explicit > env > TOML file > defaults).

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SessionError};
use crate::util::retry::RetryPolicy;

const ENV_PREFIX: &str = "ROCI_SESSION_";

/// Tunables for the agent loop and its collaborators.
///
/// Nothing in the loop hard-codes these values; every component reads them
/// from the config it was constructed with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    /// Safety margin subtracted from the model context limit. When unset, the
    /// model's output limit (capped at `output_token_max`) is reserved instead.
    pub overflow_reserve_tokens: Option<u64>,
    pub output_token_max: u64,
    /// Disables the overflow check entirely when false.
    pub auto_compaction: bool,
    /// Step budget used when the active agent declares none. Unset means unbounded.
    pub max_steps: Option<usize>,
    pub prune: bool,
    pub prune_minimum_tokens: u64,
    pub prune_protect_tokens: u64,
    pub tool_output_max_lines: usize,
    pub tool_output_max_bytes: usize,
    /// Keep looping after the user rejects a permission prompt.
    pub continue_on_deny: bool,
    pub retry_max_attempts: u32,
    pub retry_initial_backoff_ms: u64,
    pub retry_max_backoff_ms: u64,
    pub bus_capacity: usize,
    pub data_dir: Option<PathBuf>,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            overflow_reserve_tokens: None,
            output_token_max: 32_000,
            auto_compaction: true,
            max_steps: None,
            prune: true,
            prune_minimum_tokens: 20_000,
            prune_protect_tokens: 40_000,
            tool_output_max_lines: 2_000,
            tool_output_max_bytes: 50 * 1024,
            continue_on_deny: false,
            retry_max_attempts: 4,
            retry_initial_backoff_ms: 2_000,
            retry_max_backoff_ms: 30_000,
            bus_capacity: 1024,
            data_dir: None,
        }
    }
}

impl LoopConfig {
    /// Defaults overridden by a TOML file (if given) and then by the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        let _ = dotenvy::dotenv(); // load .env if present, ignore error
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Defaults overridden by `ROCI_SESSION_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::load(None)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| SessionError::Configuration(e.to_string()))
    }

    /// Apply overrides from a variable lookup (normally the process environment).
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        if let Some(value) = get("OVERFLOW_RESERVE_TOKENS") {
            self.overflow_reserve_tokens = Some(parse_number(&value, "OVERFLOW_RESERVE_TOKENS")?);
        }
        if let Some(value) = get("OUTPUT_TOKEN_MAX") {
            self.output_token_max = parse_number(&value, "OUTPUT_TOKEN_MAX")?;
        }
        if let Some(value) = get("AUTO_COMPACTION") {
            self.auto_compaction = parse_bool(&value, "AUTO_COMPACTION")?;
        }
        if let Some(value) = get("MAX_STEPS") {
            let steps: usize = parse_number(&value, "MAX_STEPS")?;
            self.max_steps = (steps > 0).then_some(steps);
        }
        if let Some(value) = get("PRUNE") {
            self.prune = parse_bool(&value, "PRUNE")?;
        }
        if let Some(value) = get("CONTINUE_ON_DENY") {
            self.continue_on_deny = parse_bool(&value, "CONTINUE_ON_DENY")?;
        }
        if let Some(value) = get("RETRY_MAX_ATTEMPTS") {
            self.retry_max_attempts = parse_number(&value, "RETRY_MAX_ATTEMPTS")?;
        }
        if let Some(value) = get("DATA_DIR") {
            self.data_dir = Some(PathBuf::from(value));
        }
        Ok(())
    }

    pub fn with_overflow_reserve_tokens(mut self, tokens: u64) -> Self {
        self.overflow_reserve_tokens = Some(tokens);
        self
    }

    pub fn with_max_steps(mut self, steps: usize) -> Self {
        self.max_steps = Some(steps);
        self
    }

    pub fn with_auto_compaction(mut self, enabled: bool) -> Self {
        self.auto_compaction = enabled;
        self
    }

    pub fn with_prune(mut self, enabled: bool) -> Self {
        self.prune = enabled;
        self
    }

    pub fn with_retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_max_attempts = attempts;
        self
    }

    pub fn with_continue_on_deny(mut self, enabled: bool) -> Self {
        self.continue_on_deny = enabled;
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_max_attempts.max(1),
            initial_backoff: Duration::from_millis(self.retry_initial_backoff_ms),
            max_backoff: Duration::from_millis(self.retry_max_backoff_ms),
            ..RetryPolicy::default()
        }
    }

    /// Directory for the file-backed store.
    pub fn resolve_data_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.data_dir {
            return Ok(dir.clone());
        }
        directories::ProjectDirs::from("dev", "roci", "roci-session")
            .map(|dirs| dirs.data_dir().join("storage"))
            .ok_or_else(|| SessionError::Configuration("no home directory available".into()))
    }
}

fn parse_number<T: std::str::FromStr>(value: &str, name: &str) -> Result<T> {
    value.trim().parse::<T>().map_err(|_| {
        SessionError::Configuration(format!("{ENV_PREFIX}{name}: invalid number '{value}'"))
    })
}

fn parse_bool(value: &str, name: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(SessionError::Configuration(format!(
            "{ENV_PREFIX}{name}: invalid boolean '{value}'"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn toml_overrides_defaults() {
        let config = LoopConfig::from_toml_str(
            r#"
            overflow_reserve_tokens = 1000
            max_steps = 3
            prune = false
            "#,
        )
        .unwrap();
        assert_eq!(config.overflow_reserve_tokens, Some(1000));
        assert_eq!(config.max_steps, Some(3));
        assert!(!config.prune);
        assert_eq!(config.prune_protect_tokens, 40_000);
    }

    #[test]
    fn env_overrides_file_values() {
        let mut config = LoopConfig::from_toml_str("max_steps = 3").unwrap();
        let env: HashMap<&str, &str> = [
            ("ROCI_SESSION_MAX_STEPS", "7"),
            ("ROCI_SESSION_AUTO_COMPACTION", "off"),
        ]
        .into_iter()
        .collect();
        config
            .apply_env(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.max_steps, Some(7));
        assert!(!config.auto_compaction);
    }

    #[test]
    fn zero_max_steps_means_unbounded() {
        let mut config = LoopConfig::default().with_max_steps(4);
        config
            .apply_env(|key| (key == "ROCI_SESSION_MAX_STEPS").then(|| "0".to_string()))
            .unwrap();
        assert_eq!(config.max_steps, None);
    }

    #[test]
    fn invalid_env_value_is_configuration_error() {
        let mut config = LoopConfig::default();
        let err = config
            .apply_env(|key| (key == "ROCI_SESSION_PRUNE").then(|| "maybe".to_string()))
            .unwrap_err();
        assert!(matches!(err, SessionError::Configuration(_)));
    }

    #[test]
    fn retry_policy_reflects_config() {
        let policy = LoopConfig::default().with_retry_attempts(0).retry_policy();
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.initial_backoff, Duration::from_secs(2));
    }
}
