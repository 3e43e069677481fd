//! Runtime configuration, loaded from the environment.
//!
//! No singleton: call `RuntimeConfig::from_env()` once at startup and pass
//! the result down explicitly (see the `Services` bundle in `transport`).

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Development,
    #[default]
    Production,
    Test,
}

impl Environment {
    fn from_str(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "development" | "dev" => Self::Development,
            "test" => Self::Test,
            _ => Self::Production,
        }
    }
}

/// Process-wide configuration read from environment variables. Construct
/// once with `from_env()` and thread it through explicitly — no global
/// singleton.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub environment: Environment,
    pub api_url: String,
    pub access_token: Option<String>,
    pub openai_api_key: Option<String>,
    pub anthropic_api_key: Option<String>,
    pub gemini_api_key: Option<String>,
    /// Path to the agent fleet's declarative config file, if any.
    pub agents_config_file: Option<String>,
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        Self {
            environment: std::env::var("ENVIRONMENT")
                .map(|v| Environment::from_str(&v))
                .unwrap_or_default(),
            api_url: std::env::var("API_URL").unwrap_or_default(),
            access_token: std::env::var("ACCESS_TOKEN").ok(),
            openai_api_key: std::env::var("OPENAI_API_KEY").ok(),
            anthropic_api_key: std::env::var("ANTHROPIC_API_KEY").ok(),
            gemini_api_key: std::env::var("GEMINI_API_KEY").ok(),
            agents_config_file: std::env::var("AGENTS_CONFIG_FILE").ok(),
        }
    }

    pub fn is_production(&self) -> bool {
        self.environment == Environment::Production
    }

    pub fn is_development(&self) -> bool {
        self.environment == Environment::Development
    }

    pub fn is_test(&self) -> bool {
        self.environment == Environment::Test || cfg!(test)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_environment_is_production() {
        let cfg = RuntimeConfig {
            environment: Environment::default(),
            api_url: String::new(),
            access_token: None,
            openai_api_key: None,
            anthropic_api_key: None,
            gemini_api_key: None,
            agents_config_file: None,
        };
        assert!(cfg.is_production());
        assert!(!cfg.is_development());
    }

    #[test]
    fn test_environment_from_str_is_case_insensitive() {
        assert_eq!(Environment::from_str("DEVELOPMENT"), Environment::Development);
        assert_eq!(Environment::from_str("dev"), Environment::Development);
        assert_eq!(Environment::from_str("test"), Environment::Test);
        assert_eq!(Environment::from_str("anything-else"), Environment::Production);
    }
}
