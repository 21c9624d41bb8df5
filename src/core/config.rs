/// Queue configuration — generation knobs and worker settings, loaded from RON.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("RON deserialization error: {0}")]
    Ron(#[from] ron::error::SpannedError),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Tuning knobs handed unchanged to the engine on every call.
///
/// The queue never interprets these; only the engine does.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationParams {
    /// Token budget for one generation.
    pub max_tokens: usize,
    pub temperature: f32,
    pub repetition_penalty: f32,
    /// Context window of the engine, prompt included.
    pub context_size: usize,
    /// Layers offloaded to the GPU (-1 = all). Only native engines use it.
    pub gpu_layers: i32,
    /// Threads the engine may use internally.
    pub threads: usize,
    /// Fixed sampling seed. `None` seeds from the clock at engine construction.
    pub seed: Option<u64>,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_tokens: 200,
            temperature: 0.8,
            repetition_penalty: 1.2,
            context_size: 4096,
            gpu_layers: -1,
            threads: 8,
            seed: None,
        }
    }
}

/// Settings of the single worker thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// How long the worker waits on an empty queue before re-checking for shutdown.
    pub poll_interval_ms: u64,
    pub thread_name: String,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            thread_name: "llm-worker".to_string(),
        }
    }
}

/// Everything `RequestQueue::start` needs besides the engine itself.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub generation: GenerationParams,
    pub worker: WorkerSettings,
}

impl QueueConfig {
    /// Parse a configuration from a RON string. Missing fields take defaults.
    pub fn parse_ron(input: &str) -> Result<Self, ConfigError> {
        let config: QueueConfig = ron::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration from a RON file.
    pub fn load_from_ron(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse_ron(&contents)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let gen = &self.generation;
        if gen.max_tokens == 0 {
            return Err(ConfigError::Invalid("max_tokens must be positive".to_string()));
        }
        if gen.context_size < gen.max_tokens {
            return Err(ConfigError::Invalid(format!(
                "context_size ({}) is smaller than max_tokens ({})",
                gen.context_size, gen.max_tokens
            )));
        }
        if gen.temperature.is_nan() || gen.temperature < 0.0 {
            return Err(ConfigError::Invalid("temperature must be >= 0".to_string()));
        }
        if gen.repetition_penalty.is_nan() || gen.repetition_penalty <= 0.0 {
            return Err(ConfigError::Invalid(
                "repetition_penalty must be > 0".to_string(),
            ));
        }
        if self.worker.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "poll_interval_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.worker.poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_game_constants() {
        let config = QueueConfig::default();
        assert_eq!(config.generation.max_tokens, 200);
        assert_eq!(config.generation.context_size, 4096);
        assert!((config.generation.temperature - 0.8).abs() < f32::EPSILON);
        assert!((config.generation.repetition_penalty - 1.2).abs() < f32::EPSILON);
        assert_eq!(config.poll_interval(), Duration::from_millis(100));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn parse_partial_ron_fills_defaults() {
        let config = QueueConfig::parse_ron(
            r#"(
                generation: (max_tokens: 64, seed: Some(7)),
            )"#,
        )
        .unwrap();
        assert_eq!(config.generation.max_tokens, 64);
        assert_eq!(config.generation.seed, Some(7));
        assert_eq!(config.generation.context_size, 4096);
        assert_eq!(config.worker.thread_name, "llm-worker");
    }

    #[test]
    fn parse_rejects_zero_budget() {
        let result = QueueConfig::parse_ron("(generation: (max_tokens: 0))");
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn parse_rejects_budget_above_context() {
        let result =
            QueueConfig::parse_ron("(generation: (max_tokens: 512, context_size: 128))");
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn parse_reports_syntax_errors() {
        let result = QueueConfig::parse_ron("(generation: (max_tokens: ))");
        assert!(matches!(result, Err(ConfigError::Ron(_))));
    }

    #[test]
    fn load_missing_file_is_io_error() {
        let result = QueueConfig::load_from_ron(Path::new("does/not/exist.ron"));
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }

    #[test]
    fn ron_file_round_trip() {
        let mut config = QueueConfig::default();
        config.generation.seed = Some(99);
        config.worker.poll_interval_ms = 25;

        let path = std::path::PathBuf::from("target/test_queue_config.ron");
        let serialized =
            ron::ser::to_string_pretty(&config, ron::ser::PrettyConfig::default()).unwrap();
        std::fs::create_dir_all("target").unwrap();
        std::fs::write(&path, serialized).unwrap();

        let loaded = QueueConfig::load_from_ron(&path).unwrap();
        assert_eq!(loaded, config);

        let _ = std::fs::remove_file(&path);
    }
}
