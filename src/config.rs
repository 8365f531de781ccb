//! Rate-limit configuration for resource classes.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{ConfigError, ConfigResult};

/// Environment variable prefix for configuration overrides,
/// e.g. `MODELQUEUE__CLASSES__LOCAL__TOKEN_CAPACITY=60000`.
pub const ENV_PREFIX: &str = "MODELQUEUE";

/// Default number of attempts per call.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Default fixed delay between attempts (milliseconds).
pub const DEFAULT_BACKOFF_MS: u64 = 10_000;

/// Limits and retry policy for one resource class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceClassConfig {
    /// Requests allowed per minute
    pub request_capacity: u64,

    /// Tokens allowed per minute
    pub token_capacity: u64,

    /// Attempts before a call fails for good
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay after a failed attempt (milliseconds)
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,

    /// Fail calls whose estimate can never fit in one minute of tokens,
    /// instead of letting them wait forever
    #[serde(default = "default_reject_oversized")]
    pub reject_oversized: bool,
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_backoff_ms() -> u64 {
    DEFAULT_BACKOFF_MS
}

fn default_reject_oversized() -> bool {
    true
}

impl ResourceClassConfig {
    /// Create a config with the given per-minute capacities and default retry policy.
    pub fn new(request_capacity: u64, token_capacity: u64) -> Self {
        Self {
            request_capacity,
            token_capacity,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_ms: DEFAULT_BACKOFF_MS,
            reject_oversized: true,
        }
    }

    /// Set the number of attempts per call.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Set the delay after a failed attempt.
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Set whether oversized calls are rejected up front.
    pub fn with_reject_oversized(mut self, reject: bool) -> Self {
        self.reject_oversized = reject;
        self
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    /// Check that the limits can admit at least one call.
    pub fn validate(&self, name: &str) -> ConfigResult<()> {
        let invalid = |reason: &str| ConfigError::InvalidClass {
            name: name.to_string(),
            reason: reason.to_string(),
        };

        if name.trim().is_empty() {
            return Err(invalid("name must not be empty"));
        }
        if self.request_capacity == 0 {
            return Err(invalid("request_capacity must be positive"));
        }
        if self.token_capacity == 0 {
            return Err(invalid("token_capacity must be positive"));
        }
        if self.max_attempts == 0 {
            return Err(invalid("max_attempts must be at least 1"));
        }
        Ok(())
    }
}

/// Configuration for every resource class served by a dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatcherConfig {
    #[serde(default)]
    pub classes: BTreeMap<String, ResourceClassConfig>,
}

impl Default for DispatcherConfig {
    /// Published limits for the common OpenAI chat models.
    fn default() -> Self {
        let mut classes = BTreeMap::new();
        for name in ["gpt-3.5-turbo", "gpt-3.5-turbo-0301"] {
            classes.insert(name.to_string(), ResourceClassConfig::new(3_500, 90_000));
        }
        for name in ["gpt-4", "gpt-4-0314"] {
            classes.insert(name.to_string(), ResourceClassConfig::new(200, 40_000));
        }
        Self { classes }
    }
}

impl DispatcherConfig {
    /// A config with no classes.
    pub fn empty() -> Self {
        Self {
            classes: BTreeMap::new(),
        }
    }

    /// Add or replace a class.
    pub fn with_class(mut self, name: impl Into<String>, class: ResourceClassConfig) -> Self {
        self.classes.insert(name.into(), class);
        self
    }

    /// Overlay `custom` on top of this config; classes in `custom` win.
    pub fn merged(mut self, custom: DispatcherConfig) -> Self {
        self.classes.extend(custom.classes);
        self
    }

    /// The built-in defaults overlaid with this config.
    pub fn with_builtin_defaults(self) -> Self {
        DispatcherConfig::default().merged(self)
    }

    /// Parse a TOML document.
    pub fn from_toml_str(source: &str) -> ConfigResult<Self> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML file, then apply `MODELQUEUE__*` environment overrides.
    ///
    /// Class names keep the case written in the file. Environment variable
    /// names are matched to them case-insensitively.
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let source = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Self = toml::from_str(&source)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> ConfigResult<()> {
        let overrides: EnvOverrides = ::config::Config::builder()
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        for (key, class) in overrides.classes {
            let existing = self
                .classes
                .keys()
                .find(|name| name.eq_ignore_ascii_case(&key))
                .cloned();
            if let Some(target) = existing.and_then(|name| self.classes.get_mut(&name)) {
                class.apply_to(target);
                continue;
            }
            match class.into_class() {
                Some(new_class) => {
                    self.classes.insert(key, new_class);
                }
                None => warn!(
                    resource_class = %key,
                    "ignoring environment override for a class without both capacities"
                ),
            }
        }
        Ok(())
    }

    /// Validate every class.
    pub fn validate(&self) -> ConfigResult<()> {
        for (name, class) in &self.classes {
            class.validate(name)?;
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&ResourceClassConfig> {
        self.classes.get(name)
    }
}

/// Per-class fields set through the environment.
#[derive(Debug, Default, Deserialize)]
struct EnvOverrides {
    #[serde(default)]
    classes: BTreeMap<String, ClassOverride>,
}

#[derive(Debug, Default, Deserialize)]
struct ClassOverride {
    request_capacity: Option<u64>,
    token_capacity: Option<u64>,
    max_attempts: Option<u32>,
    backoff_ms: Option<u64>,
    reject_oversized: Option<bool>,
}

impl ClassOverride {
    fn apply_to(self, class: &mut ResourceClassConfig) {
        if let Some(v) = self.request_capacity {
            class.request_capacity = v;
        }
        if let Some(v) = self.token_capacity {
            class.token_capacity = v;
        }
        if let Some(v) = self.max_attempts {
            class.max_attempts = v;
        }
        if let Some(v) = self.backoff_ms {
            class.backoff_ms = v;
        }
        if let Some(v) = self.reject_oversized {
            class.reject_oversized = v;
        }
    }

    /// A new class, if both capacities were given.
    fn into_class(self) -> Option<ResourceClassConfig> {
        let mut class = ResourceClassConfig::new(self.request_capacity?, self.token_capacity?);
        self.apply_to(&mut class);
        Some(class)
    }
}
