//! Persisted settings and the editable form built on top of them.
//!
//! The settings file holds base64 of a JSON object. This is an encoding,
//! not encryption: anyone who can read the file can read the API key.

use anyhow::{Context, Result};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

use crate::llm::RequestParameters;

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-3.5-turbo";
pub const DEFAULT_TEMPERATURE: &str = "0.7";
pub const DEFAULT_MAX_TOKENS: &str = "150";

const TEMPERATURE_RANGE: std::ops::RangeInclusive<f32> = 0.0..=2.0;
const MAX_TOKENS_RANGE: std::ops::RangeInclusive<i64> = 1..=8192;

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

/// The record written to disk. Unknown or missing keys fall back to
/// their defaults so older files keep loading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<String>,
}

impl Default for StoredConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: default_base_url(),
            model_name: default_model(),
            temperature: None,
            max_length: None,
        }
    }
}

pub fn encode(config: &StoredConfig) -> Result<String> {
    let json = serde_json::to_string(config).context("Failed to serialize config")?;
    Ok(STANDARD.encode(json))
}

pub fn decode(encoded: &str) -> Result<StoredConfig> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .context("Config is not valid base64")?;
    serde_json::from_slice(&bytes).context("Config is not valid JSON")
}

pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Never fails: a missing or empty file gives the defaults, and so
    /// does one that cannot be decoded (with a warning).
    pub fn load(&self) -> StoredConfig {
        let encoded = match fs::read_to_string(&self.path) {
            Ok(encoded) => encoded,
            Err(_) => return StoredConfig::default(),
        };

        if encoded.trim().is_empty() {
            return StoredConfig::default();
        }

        match decode(&encoded) {
            Ok(config) => config,
            Err(e) => {
                warn!(
                    "Error loading config file {}: {:#}. Using defaults.",
                    self.path.display(),
                    e
                );
                StoredConfig::default()
            }
        }
    }

    pub fn save(&self, config: &StoredConfig) -> Result<()> {
        let encoded = encode(config)?;
        fs::write(&self.path, encoded)
            .with_context(|| format!("Failed to write config file {}", self.path.display()))?;
        info!("Saved configuration to {}", self.path.display());
        Ok(())
    }
}

/// Raised before any request is made when the form can't be submitted.
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("{0} is required")]
    MissingField(&'static str),

    #[error("Prompt cannot be empty")]
    EmptyPrompt,

    #[error("Temperature must be a number, got {0:?}")]
    TemperatureNotANumber(String),

    #[error("Temperature must be between 0.0 and 2.0, got {0}")]
    TemperatureOutOfRange(f32),

    #[error("Max length must be a whole number, got {0:?}")]
    MaxTokensNotANumber(String),

    #[error("Max length must be between 1 and 8192, got {0}")]
    MaxTokensOutOfRange(i64),
}

pub fn parse_temperature(raw: &str) -> Result<f32, ValidationError> {
    let value: f32 = raw
        .trim()
        .parse()
        .map_err(|_| ValidationError::TemperatureNotANumber(raw.to_string()))?;
    if !TEMPERATURE_RANGE.contains(&value) {
        return Err(ValidationError::TemperatureOutOfRange(value));
    }
    Ok(value)
}

pub fn parse_max_tokens(raw: &str) -> Result<u32, ValidationError> {
    let value: i64 = raw
        .trim()
        .parse()
        .map_err(|_| ValidationError::MaxTokensNotANumber(raw.to_string()))?;
    if !MAX_TOKENS_RANGE.contains(&value) {
        return Err(ValidationError::MaxTokensOutOfRange(value));
    }
    // the range check keeps this lossless
    Ok(value as u32)
}

/// The five user-editable settings, kept as the text the user typed.
#[derive(Debug, Clone, PartialEq)]
pub struct Form {
    pub api_key: String,
    pub base_url: String,
    pub model_name: String,
    pub temperature: String,
    pub max_tokens: String,
}

impl Default for Form {
    fn default() -> Self {
        Self::from_stored(&StoredConfig::default())
    }
}

impl Form {
    pub fn from_stored(config: &StoredConfig) -> Self {
        Self {
            api_key: config.api_key.clone(),
            base_url: config.base_url.clone(),
            model_name: config.model_name.clone(),
            temperature: config
                .temperature
                .clone()
                .unwrap_or_else(|| DEFAULT_TEMPERATURE.to_string()),
            max_tokens: config
                .max_length
                .clone()
                .unwrap_or_else(|| DEFAULT_MAX_TOKENS.to_string()),
        }
    }

    pub fn to_stored(&self) -> StoredConfig {
        StoredConfig {
            api_key: self.api_key.clone(),
            base_url: self.base_url.clone(),
            model_name: self.model_name.clone(),
            temperature: Some(self.temperature.clone()),
            max_length: Some(self.max_tokens.clone()),
        }
    }

    /// Checks the fields in display order and builds the request for
    /// `prompt`.
    pub fn validate(&self, prompt: &str) -> Result<RequestParameters, ValidationError> {
        let required = [
            ("API key", &self.api_key),
            ("Base URL", &self.base_url),
            ("Model name", &self.model_name),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(ValidationError::MissingField(name));
            }
        }

        if prompt.trim().is_empty() {
            return Err(ValidationError::EmptyPrompt);
        }

        let temperature = parse_temperature(&self.temperature)?;
        let max_output_tokens = parse_max_tokens(&self.max_tokens)?;

        Ok(RequestParameters {
            api_key: self.api_key.trim().to_string(),
            base_url: self.base_url.trim().to_string(),
            model_name: self.model_name.trim().to_string(),
            prompt: prompt.to_string(),
            temperature,
            max_output_tokens,
        })
    }
}

/// `****` plus the last four characters. Short keys are hidden entirely.
pub fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.is_empty() {
        return "(not set)".to_string();
    }
    if chars.len() <= 4 {
        return "****".to_string();
    }
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("****{}", tail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine as _;

    fn filled_form() -> Form {
        Form {
            api_key: "sk-test".to_string(),
            ..Form::default()
        }
    }

    #[test]
    fn encode_decode_round_trip() {
        let config = StoredConfig {
            api_key: "sk-abc".to_string(),
            base_url: "http://localhost:8080/v1".to_string(),
            model_name: "llama-3".to_string(),
            temperature: Some("1.2".to_string()),
            max_length: None,
        };

        assert_eq!(decode(&encode(&config).unwrap()).unwrap(), config);
    }

    #[test]
    fn encoded_form_is_base64_of_json() {
        let config = StoredConfig {
            api_key: "k".to_string(),
            ..StoredConfig::default()
        };
        let encoded = encode(&config).unwrap();
        let json: serde_json::Value =
            serde_json::from_slice(&STANDARD.decode(encoded).unwrap()).unwrap();

        assert_eq!(json["api_key"], "k");
        assert_eq!(json["base_url"], DEFAULT_BASE_URL);
        assert_eq!(json["model_name"], DEFAULT_MODEL);
        assert!(json.get("temperature").is_none());
    }

    #[test]
    fn decode_fills_missing_keys_with_defaults() {
        let encoded = STANDARD.encode(r#"{"api_key": "sk-only"}"#);
        let config = decode(&encoded).unwrap();

        assert_eq!(config.api_key, "sk-only");
        assert_eq!(config.base_url, DEFAULT_BASE_URL);
        assert_eq!(config.model_name, DEFAULT_MODEL);
    }

    #[test]
    fn load_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path().join("config.json"));

        assert_eq!(store.load(), StoredConfig::default());
    }

    #[test]
    fn load_empty_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "").unwrap();

        assert_eq!(ConfigStore::new(path).load(), StoredConfig::default());
    }

    #[test]
    fn load_garbage_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "%%% not base64 %%%").unwrap();

        assert_eq!(ConfigStore::new(path).load(), StoredConfig::default());
    }

    #[test]
    fn load_whitespace_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "  \n").unwrap();

        assert_eq!(ConfigStore::new(path).load(), StoredConfig::default());
    }

    #[test]
    fn load_base64_of_non_json_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, STANDARD.encode("not json")).unwrap();

        assert!(decode(&STANDARD.encode("not json")).is_err());
        assert_eq!(ConfigStore::new(path).load(), StoredConfig::default());
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path().join("config.json"));
        let config = filled_form().to_stored();

        store.save(&config).unwrap();

        assert_eq!(store.load(), config);
    }

    #[test]
    fn form_defaults() {
        let form = Form::default();
        assert_eq!(form.base_url, "https://api.openai.com/v1");
        assert_eq!(form.model_name, "gpt-3.5-turbo");
        assert_eq!(form.temperature, "0.7");
        assert_eq!(form.max_tokens, "150");
    }

    #[test]
    fn validate_builds_request() {
        let params = filled_form().validate("Hello").unwrap();

        assert_eq!(params.api_key, "sk-test");
        assert_eq!(params.prompt, "Hello");
        assert_eq!(params.temperature, 0.7);
        assert_eq!(params.max_output_tokens, 150);
    }

    #[test]
    fn validate_requires_fields_in_order() {
        let mut form = Form {
            api_key: String::new(),
            base_url: String::new(),
            ..Form::default()
        };
        assert_eq!(
            form.validate("hi"),
            Err(ValidationError::MissingField("API key"))
        );

        form.api_key = "sk".to_string();
        assert_eq!(
            form.validate("hi"),
            Err(ValidationError::MissingField("Base URL"))
        );

        form.base_url = DEFAULT_BASE_URL.to_string();
        form.model_name = "  ".to_string();
        assert_eq!(
            form.validate("hi"),
            Err(ValidationError::MissingField("Model name"))
        );

        form.model_name = DEFAULT_MODEL.to_string();
        assert_eq!(form.validate(" \n "), Err(ValidationError::EmptyPrompt));
    }

    #[test]
    fn temperature_bounds_are_inclusive() {
        assert_eq!(parse_temperature("0.0"), Ok(0.0));
        assert_eq!(parse_temperature("2.0"), Ok(2.0));
        assert!(matches!(
            parse_temperature("2.01"),
            Err(ValidationError::TemperatureOutOfRange(_))
        ));
        assert!(matches!(
            parse_temperature("-0.01"),
            Err(ValidationError::TemperatureOutOfRange(_))
        ));
        assert!(matches!(
            parse_temperature("warm"),
            Err(ValidationError::TemperatureNotANumber(_))
        ));
        assert!(matches!(
            parse_temperature("NaN"),
            Err(ValidationError::TemperatureOutOfRange(_))
        ));
    }

    #[test]
    fn max_tokens_bounds_are_inclusive() {
        assert_eq!(parse_max_tokens("1"), Ok(1));
        assert_eq!(parse_max_tokens("8192"), Ok(8192));
        assert_eq!(parse_max_tokens("0"), Err(ValidationError::MaxTokensOutOfRange(0)));
        assert_eq!(
            parse_max_tokens("8193"),
            Err(ValidationError::MaxTokensOutOfRange(8193))
        );
        assert_eq!(
            parse_max_tokens("12.5"),
            Err(ValidationError::MaxTokensNotANumber("12.5".to_string()))
        );
    }

    #[test]
    fn validate_rejects_bad_numbers() {
        let form = Form {
            temperature: "3".to_string(),
            ..filled_form()
        };
        assert_eq!(
            form.validate("hi"),
            Err(ValidationError::TemperatureOutOfRange(3.0))
        );

        let form = Form {
            max_tokens: "lots".to_string(),
            ..filled_form()
        };
        assert!(matches!(
            form.validate("hi"),
            Err(ValidationError::MaxTokensNotANumber(_))
        ));
    }

    #[test]
    fn mask_secret_keeps_last_four() {
        assert_eq!(mask_secret("sk-1234567890"), "****7890");
        assert_eq!(mask_secret("abc"), "****");
        assert_eq!(mask_secret(""), "(not set)");
    }
}
