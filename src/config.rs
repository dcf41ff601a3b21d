use std::time::Duration;

const VERIFY_RANKINGS_ENV: &str = "MEMODATA_VERIFY_RANKINGS";
const SCOPE_LOCK_TIMEOUT_ENV: &str = "MEMODATA_SCOPE_LOCK_TIMEOUT_MS";
const MAX_EAGER_DEPTH_ENV: &str = "MEMODATA_MAX_EAGER_DEPTH";

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Re-read every touched ranking scope after a mutation and check it is
    /// exactly `1..=N`
    pub verify_rankings: bool,

    /// How long a transaction waits for a ranking-scope lock (`None` waits forever)
    pub scope_lock_timeout: Option<Duration>,

    /// Eager belongs-to chains deeper than this are loaded lazily
    pub max_eager_depth: usize,

    /// Length limit of the string field type
    pub max_string_length: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            verify_rankings: true,
            scope_lock_timeout: Some(Duration::from_secs(30)),
            max_eager_depth: 4,
            max_string_length: 255,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `MEMODATA_*` environment variables.
    /// Unparseable values are ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(verify) = lookup(VERIFY_RANKINGS_ENV).and_then(|v| parse_flag(&v)) {
            config.verify_rankings = verify;
        }

        if let Some(millis) = lookup(SCOPE_LOCK_TIMEOUT_ENV).and_then(|v| v.trim().parse::<u64>().ok()) {
            // 0 disables the timeout
            config.scope_lock_timeout = (millis > 0).then(|| Duration::from_millis(millis));
        }

        if let Some(depth) = lookup(MAX_EAGER_DEPTH_ENV).and_then(|v| v.trim().parse().ok()) {
            config.max_eager_depth = depth;
        }

        config
    }

    pub fn verify_rankings(mut self, verify: bool) -> Self {
        self.verify_rankings = verify;
        self
    }

    pub fn scope_lock_timeout(mut self, timeout: Duration) -> Self {
        self.scope_lock_timeout = Some(timeout);
        self
    }

    pub fn without_scope_lock_timeout(mut self) -> Self {
        self.scope_lock_timeout = None;
        self
    }

    pub fn max_eager_depth(mut self, depth: usize) -> Self {
        self.max_eager_depth = depth;
        self
    }

    pub fn max_string_length(mut self, length: usize) -> Self {
        self.max_string_length = length;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.max_string_length == 0 {
            return Err("max_string_length must be > 0".to_string());
        }

        if self.scope_lock_timeout == Some(Duration::ZERO) {
            return Err("scope_lock_timeout must be > 0".to_string());
        }

        Ok(())
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert!(config.verify_rankings);
        assert_eq!(config.scope_lock_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.max_eager_depth, 4);
        assert_eq!(config.max_string_length, 255);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            (VERIFY_RANKINGS_ENV, "off"),
            (SCOPE_LOCK_TIMEOUT_ENV, "250"),
            (MAX_EAGER_DEPTH_ENV, "not a number"),
        ]
        .into_iter()
        .collect();

        let config = EngineConfig::from_lookup(|key| env.get(key).map(|v| v.to_string()));
        assert!(!config.verify_rankings);
        assert_eq!(config.scope_lock_timeout, Some(Duration::from_millis(250)));
        assert_eq!(config.max_eager_depth, 4);
    }

    #[test]
    fn test_zero_timeout_env_disables_timeout() {
        let config = EngineConfig::from_lookup(|key| (key == SCOPE_LOCK_TIMEOUT_ENV).then(|| "0".to_string()));
        assert_eq!(config.scope_lock_timeout, None);
    }

    #[test]
    fn test_builder_and_validation() {
        let config = EngineConfig::new()
            .verify_rankings(false)
            .scope_lock_timeout(Duration::from_millis(10))
            .max_eager_depth(1)
            .max_string_length(0);
        assert!(!config.verify_rankings);
        assert_eq!(config.max_eager_depth, 1);
        assert!(config.validate().is_err());
        assert_eq!(config.without_scope_lock_timeout().scope_lock_timeout, None);
    }
}
