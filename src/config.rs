//! Startup configuration for reference-counted objects.
//!
//! `RefConfig` is a plain value handed to `RefContext::new`. The
//! process-wide context builds one from the environment exactly once;
//! everything else should construct it explicitly.

use core::fmt;

/// Environment variable consulted by `RefConfig::from_env`.
pub const THREAD_SAFE_ENV: &str = "REFERENCED_THREAD_SAFE_REF_UNREF";

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct RefConfig {
    /// Thread-safety applied to objects that do not opt in or out.
    pub default_thread_safe: bool,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ConfigError {
    InvalidValue { var: &'static str, value: String },
    NotUnicode { var: &'static str },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidValue { var, value } => {
                write!(f, "invalid boolean {value:?} in {var}")
            }
            ConfigError::NotUnicode { var } => write!(f, "{var} is not valid unicode"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl RefConfig {
    pub const fn new() -> Self {
        Self {
            default_thread_safe: false,
        }
    }

    pub const fn with_default_thread_safe(mut self, thread_safe: bool) -> Self {
        self.default_thread_safe = thread_safe;
        self
    }

    /// Read the configuration from the process environment.
    ///
    /// An unset variable yields the defaults. A variable that is present
    /// but empty counts as enabled.
    pub fn from_env() -> Result<Self, ConfigError> {
        match std::env::var(THREAD_SAFE_ENV) {
            Ok(v) => Self::from_lookup(|_| Some(v.clone())),
            Err(std::env::VarError::NotPresent) => Ok(Self::new()),
            Err(std::env::VarError::NotUnicode(_)) => Err(ConfigError::NotUnicode {
                var: THREAD_SAFE_ENV,
            }),
        }
    }

    /// Build a configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::new();
        if let Some(raw) = lookup(THREAD_SAFE_ENV) {
            cfg.default_thread_safe = parse_flag(&raw).ok_or(ConfigError::InvalidValue {
                var: THREAD_SAFE_ENV,
                value: raw,
            })?;
        }
        Ok(cfg)
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "" | "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
