use serde::Deserialize;
use std::path::PathBuf;

use crate::error::{AppError, Result};
use crate::parser::PayloadFormat;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub vision: VisionConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub image: ImageConfig,
    #[serde(default)]
    pub package: PackageConfig,
}

/// Hosted completion providers that speak the OpenAI chat-completions shape.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    #[default]
    OpenAi,
    Groq,
}

impl Provider {
    pub fn default_base_url(&self) -> &'static str {
        match self {
            Provider::OpenAi => "https://api.openai.com/v1",
            Provider::Groq => "https://api.groq.com/openai/v1",
        }
    }

    pub fn default_model(&self) -> &'static str {
        match self {
            Provider::OpenAi => "gpt-4o-mini",
            Provider::Groq => "llama-3.2-11b-vision-preview",
        }
    }

    /// Conventional environment variable holding this provider's key.
    pub fn api_key_env(&self) -> &'static str {
        match self {
            Provider::OpenAi => "OPENAI_API_KEY",
            Provider::Groq => "GROQ_API_KEY",
        }
    }
}

#[derive(Deserialize, Clone)]
pub struct VisionConfig {
    #[serde(default)]
    pub provider: Provider,
    #[serde(default)]
    pub api_key: String,
    pub base_url: Option<String>,
    pub model: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

// Manual Debug impl to avoid leaking the API key
impl std::fmt::Debug for VisionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VisionConfig")
            .field("provider", &self.provider)
            .field("api_key", &"[REDACTED]")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("max_tokens", &self.max_tokens)
            .field("temperature", &self.temperature)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            provider: Provider::default(),
            api_key: String::new(),
            base_url: None,
            model: None,
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl VisionConfig {
    pub fn base_url(&self) -> &str {
        self.base_url
            .as_deref()
            .unwrap_or_else(|| self.provider.default_base_url())
    }

    pub fn model(&self) -> &str {
        self.model
            .as_deref()
            .unwrap_or_else(|| self.provider.default_model())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_input_extension")]
    pub input_extension: String,
    #[serde(default)]
    pub format: PayloadFormat,
    /// First id of an explicit id range. Without a range the directory listing is used.
    pub start_id: Option<u64>,
    pub end_id: Option<u64>,
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    pub prompt_file: Option<PathBuf>,
    /// When false, failed items are marked and skipped on later runs.
    #[serde(default = "default_retry_failed_on_rerun")]
    pub retry_failed_on_rerun: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            input_extension: default_input_extension(),
            format: PayloadFormat::default(),
            start_id: None,
            end_id: None,
            max_workers: default_max_workers(),
            prompt_file: None,
            retry_failed_on_rerun: default_retry_failed_on_rerun(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_secs")]
    pub backoff_base_secs: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base_secs: default_backoff_base_secs(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ImageConfig {
    #[serde(default = "default_resize")]
    pub resize: bool,
    #[serde(default = "default_max_dimension")]
    pub max_dimension: u32,
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            resize: default_resize(),
            max_dimension: default_max_dimension(),
            jpeg_quality: default_jpeg_quality(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PackageConfig {
    #[serde(default = "default_package_output")]
    pub output: PathBuf,
}

impl Default for PackageConfig {
    fn default() -> Self {
        Self {
            output: default_package_output(),
        }
    }
}

fn default_max_tokens() -> u32 {
    1024
}

fn default_temperature() -> f32 {
    1.0
}

fn default_timeout_secs() -> u64 {
    120
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("fine-tuning/data")
}

fn default_input_extension() -> String {
    "png".to_string()
}

fn default_max_workers() -> usize {
    10
}

fn default_retry_failed_on_rerun() -> bool {
    true
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base_secs() -> f64 {
    2.0
}

fn default_resize() -> bool {
    true
}

fn default_max_dimension() -> u32 {
    300
}

fn default_jpeg_quality() -> u8 {
    70
}

fn default_package_output() -> PathBuf {
    PathBuf::from("data.json")
}

impl AppConfig {
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();

        // Load from file if specified
        if let Some(path) = config_path {
            builder = builder.add_source(config::File::with_name(path));
        } else {
            builder = builder.add_source(
                config::File::with_name("disaster-labeler")
                    .required(false),
            );
        }

        // Environment variable overrides with LABELER_ prefix
        builder = builder.add_source(
            config::Environment::with_prefix("LABELER")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder
            .build()
            .map_err(|e| AppError::Config(e.to_string()))?;

        let mut app: AppConfig = config
            .try_deserialize()
            .map_err(|e| AppError::Config(e.to_string()))?;

        if app.vision.api_key.is_empty() {
            if let Ok(key) = std::env::var(app.vision.provider.api_key_env()) {
                app.vision.api_key = key;
            }
        }

        app.validate()?;
        Ok(app)
    }

    pub fn validate(&self) -> Result<()> {
        if self.pipeline.max_workers == 0 {
            return Err(AppError::Config("pipeline.max_workers must be at least 1".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(AppError::Config("retry.max_attempts must be at least 1".into()));
        }
        let base = self.retry.backoff_base_secs;
        if !base.is_finite() || base < 0.0 {
            return Err(AppError::Config(format!(
                "retry.backoff_base_secs must be a finite, non-negative number, got {base}"
            )));
        }
        if let (Some(start), Some(end)) = (self.pipeline.start_id, self.pipeline.end_id) {
            if start > end {
                return Err(AppError::Config(format!(
                    "pipeline.start_id ({start}) is greater than pipeline.end_id ({end})"
                )));
            }
        }
        if !(1..=100).contains(&self.image.jpeg_quality) {
            return Err(AppError::Config("image.jpeg_quality must be within 1..=100".into()));
        }
        Ok(())
    }

    pub fn vision_api_key(&self) -> &str {
        &self.vision.api_key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.pipeline.max_workers, 10);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.backoff_base_secs, 2.0);
        assert_eq!(config.pipeline.format, PayloadFormat::Csv);
        assert!(config.pipeline.retry_failed_on_rerun);
        assert_eq!(config.vision.model(), "gpt-4o-mini");
        assert_eq!(config.vision.base_url(), "https://api.openai.com/v1");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_groq_provider_defaults() {
        let vision = VisionConfig {
            provider: Provider::Groq,
            ..VisionConfig::default()
        };
        assert_eq!(vision.base_url(), "https://api.groq.com/openai/v1");
        assert_eq!(vision.model(), "llama-3.2-11b-vision-preview");
    }

    #[test]
    fn test_debug_redacts_api_key() {
        let vision = VisionConfig {
            api_key: "sk-secret".to_string(),
            ..VisionConfig::default()
        };
        let rendered = format!("{vision:?}");
        assert!(!rendered.contains("sk-secret"));
        assert!(rendered.contains("[REDACTED]"));
    }

    #[test]
    fn test_load_from_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("labeler.toml");
        std::fs::write(
            &path,
            r#"
[vision]
provider = "groq"
api_key = "gsk-test"

[pipeline]
format = "json"
max_workers = 4
start_id = 107
end_id = 1200

[retry]
max_attempts = 5
"#,
        )
        .unwrap();

        let config = AppConfig::load(path.to_str()).unwrap();
        assert_eq!(config.vision.provider, Provider::Groq);
        assert_eq!(config.vision_api_key(), "gsk-test");
        assert_eq!(config.pipeline.format, PayloadFormat::Json);
        assert_eq!(config.pipeline.max_workers, 4);
        assert_eq!(config.pipeline.start_id, Some(107));
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.image.max_dimension, 300);
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let mut config = AppConfig::default();
        config.pipeline.max_workers = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_inverted_range() {
        let mut config = AppConfig::default();
        config.pipeline.start_id = Some(10);
        config.pipeline.end_id = Some(5);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_non_finite_backoff() {
        for base in [f64::NAN, f64::INFINITY, -1.0] {
            let mut config = AppConfig::default();
            config.retry.backoff_base_secs = base;
            assert!(matches!(config.validate(), Err(AppError::Config(_))));
        }
    }
}
