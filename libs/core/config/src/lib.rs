pub mod tracing;

use std::env;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Configuration error type
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Environment variable '{0}' is required but not set")]
    MissingEnvVar(String),

    #[error("Failed to parse environment variable '{key}': {details}")]
    ParseError { key: String, details: String },

    #[error("Invalid value for '{key}': {details}")]
    InvalidValue { key: String, details: String },
}

/// Application environment (dev = local broker, prod = deployed workers)
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    pub fn from_env() -> Self {
        let app_env = env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());

        if app_env.eq_ignore_ascii_case("production") {
            Environment::Production
        } else {
            Environment::Development
        }
    }

    pub fn is_production(&self) -> bool {
        matches!(self, Environment::Production)
    }

    pub fn is_development(&self) -> bool {
        matches!(self, Environment::Development)
    }
}

/// Trait for configuration that can be loaded from environment variables
pub trait FromEnv: Sized {
    fn from_env() -> Result<Self, ConfigError>;
}

/// Helper to load an environment variable with a default value
pub fn env_or_default(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Helper to load an environment variable or return error
pub fn env_required(key: &str) -> Result<String, ConfigError> {
    env::var(key).map_err(|_| ConfigError::MissingEnvVar(key.to_string()))
}

/// Parse an environment variable, falling back to `default` when unset.
///
/// A set-but-unparsable value is an error rather than a silent fallback.
pub fn env_parse_or<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::ParseError {
            key: key.to_string(),
            details: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

/// Read a whole-second duration from the environment.
pub fn env_duration_secs(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    env_parse_or(key, default.as_secs()).map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_defaults_to_development() {
        temp_env::with_var_unset("APP_ENV", || {
            let env = Environment::from_env();
            assert_eq!(env, Environment::Development);
            assert!(env.is_development());
            assert!(!env.is_production());
        });
    }

    #[test]
    fn test_environment_production_case_insensitive() {
        temp_env::with_var("APP_ENV", Some("PRODUCTION"), || {
            assert_eq!(Environment::from_env(), Environment::Production);
        });

        temp_env::with_var("APP_ENV", Some("Production"), || {
            assert!(Environment::from_env().is_production());
        });
    }

    #[test]
    fn test_environment_unknown_defaults_to_development() {
        temp_env::with_var("APP_ENV", Some("staging"), || {
            assert_eq!(Environment::from_env(), Environment::Development);
        });
    }

    #[test]
    fn test_env_or_default() {
        temp_env::with_var("QUEUE_TEST_VAR", Some("tube-a"), || {
            assert_eq!(env_or_default("QUEUE_TEST_VAR", "default"), "tube-a");
        });

        temp_env::with_var_unset("QUEUE_TEST_VAR", || {
            assert_eq!(env_or_default("QUEUE_TEST_VAR", "default"), "default");
        });
    }

    #[test]
    fn test_env_required_missing() {
        temp_env::with_var_unset("QUEUE_MISSING_REQUIRED", || {
            let err = env_required("QUEUE_MISSING_REQUIRED").unwrap_err();
            assert!(err.to_string().contains("QUEUE_MISSING_REQUIRED"));
            assert!(err.to_string().contains("required"));
        });
    }

    #[test]
    fn test_env_parse_or() {
        temp_env::with_var("QUEUE_POOL", Some(" 16 "), || {
            assert_eq!(env_parse_or("QUEUE_POOL", 4usize).unwrap(), 16);
        });

        temp_env::with_var_unset("QUEUE_POOL", || {
            assert_eq!(env_parse_or("QUEUE_POOL", 4usize).unwrap(), 4);
        });

        temp_env::with_var("QUEUE_POOL", Some("many"), || {
            let err = env_parse_or("QUEUE_POOL", 4usize).unwrap_err();
            assert!(matches!(err, ConfigError::ParseError { ref key, .. } if key == "QUEUE_POOL"));
        });
    }

    #[test]
    fn test_env_duration_secs() {
        temp_env::with_var("QUEUE_TIMEOUT", Some("90"), || {
            let timeout = env_duration_secs("QUEUE_TIMEOUT", Duration::from_secs(5)).unwrap();
            assert_eq!(timeout, Duration::from_secs(90));
        });

        temp_env::with_var_unset("QUEUE_TIMEOUT", || {
            let timeout = env_duration_secs("QUEUE_TIMEOUT", Duration::from_secs(5)).unwrap();
            assert_eq!(timeout, Duration::from_secs(5));
        });
    }
}
