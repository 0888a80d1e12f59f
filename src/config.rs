use crate::api::RetryPolicy;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub fish_speech_url: String,
    pub database_path: PathBuf,
    pub media_root: PathBuf,
    pub poll_interval_secs: u64,
    pub request_timeout_secs: u64,
    pub stuck_threshold_secs: u64,
    pub batch_concurrency: usize,
    pub max_new_tokens: u32,
    pub regeneration_rounds: u32,
    pub timeout_attempts: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            fish_speech_url: "http://127.0.0.1:8080".to_string(),
            database_path: PathBuf::from("tts.db"),
            media_root: PathBuf::from("media"),
            poll_interval_secs: 2,
            request_timeout_secs: 180,
            stuck_threshold_secs: 600,
            batch_concurrency: 2,
            max_new_tokens: 2048,
            regeneration_rounds: 2,
            timeout_attempts: 3,
        }
    }
}

impl Config {
    /// Reads `path` when it exists, then applies environment overrides and validates.
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if fs::metadata(path).await.is_ok() {
            let content = fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read config: {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse config: {}", path.display()))?
        } else {
            Config::default()
        };

        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("FISH_SPEECH_URL") {
            self.fish_speech_url = url;
        }
        if let Some(path) = lookup("TTS_DATABASE_PATH") {
            self.database_path = PathBuf::from(path);
        }
        if let Some(path) = lookup("TTS_MEDIA_ROOT") {
            self.media_root = PathBuf::from(path);
        }
        if let Some(v) = lookup("TTS_POLL_INTERVAL_SECS") {
            self.poll_interval_secs = parse_env("TTS_POLL_INTERVAL_SECS", &v)?;
        }
        if let Some(v) = lookup("TTS_REQUEST_TIMEOUT_SECS") {
            self.request_timeout_secs = parse_env("TTS_REQUEST_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("TTS_STUCK_THRESHOLD_SECS") {
            self.stuck_threshold_secs = parse_env("TTS_STUCK_THRESHOLD_SECS", &v)?;
        }
        if let Some(v) = lookup("TTS_BATCH_CONCURRENCY") {
            self.batch_concurrency = parse_env("TTS_BATCH_CONCURRENCY", &v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let url = self.fish_speech_url.trim();
        if url.is_empty() {
            anyhow::bail!("config: fish_speech_url missing");
        }
        if !url.starts_with("http://") && !url.starts_with("https://") {
            anyhow::bail!("config: fish_speech_url must be http(s): {}", url);
        }
        if self.poll_interval_secs == 0 {
            anyhow::bail!("config: poll_interval_secs must be positive");
        }
        if self.request_timeout_secs == 0 {
            anyhow::bail!("config: request_timeout_secs must be positive");
        }
        if self.stuck_threshold_secs == 0 {
            anyhow::bail!("config: stuck_threshold_secs must be positive");
        }
        if self.batch_concurrency == 0 {
            anyhow::bail!("config: batch_concurrency must be at least 1");
        }
        if self.timeout_attempts == 0 {
            anyhow::bail!("config: timeout_attempts must be at least 1");
        }
        let round = self.synthesis_worst_case();
        if round >= self.stuck_threshold() {
            anyhow::bail!(
                "config: one synthesis round can take {}s ({}s timeout x {} attempts plus backoff), \
                 which is not below stuck_threshold_secs ({}s)",
                round.as_secs(),
                self.request_timeout_secs,
                self.timeout_attempts,
                self.stuck_threshold_secs
            );
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn stuck_threshold(&self) -> Duration {
        Duration::from_secs(self.stuck_threshold_secs)
    }

    /// Longest gap between two heartbeats of a job: one full retried synthesis call.
    pub fn synthesis_worst_case(&self) -> Duration {
        RetryPolicy {
            attempts: self.timeout_attempts,
            ..RetryPolicy::default()
        }
        .worst_case(self.request_timeout())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .trim()
        .parse()
        .with_context(|| format!("invalid value for {key}: {value:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.poll_interval(), Duration::from_secs(2));
        assert_eq!(config.request_timeout(), Duration::from_secs(180));
        assert_eq!(config.stuck_threshold(), Duration::from_secs(600));
        assert_eq!(config.batch_concurrency, 2);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"fish_speech_url": "http://tts:9881", "poll_interval_secs": 5}"#)
                .unwrap();
        assert_eq!(config.fish_speech_url, "http://tts:9881");
        assert_eq!(config.poll_interval_secs, 5);
        assert_eq!(config.request_timeout_secs, 180);
    }

    #[test]
    fn env_overrides_win() {
        let env: HashMap<&str, &str> = [
            ("FISH_SPEECH_URL", "http://speech:9881"),
            ("TTS_STUCK_THRESHOLD_SECS", "120"),
            ("TTS_BATCH_CONCURRENCY", "4"),
        ]
        .into_iter()
        .collect();
        let mut config = Config::default();
        config
            .apply_env(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.fish_speech_url, "http://speech:9881");
        assert_eq!(config.stuck_threshold_secs, 120);
        assert_eq!(config.batch_concurrency, 4);
    }

    #[test]
    fn bad_env_number_is_an_error() {
        let mut config = Config::default();
        let err = config
            .apply_env(|k| (k == "TTS_POLL_INTERVAL_SECS").then(|| "soon".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("TTS_POLL_INTERVAL_SECS"));
    }

    #[test]
    fn rejects_invalid_values() {
        let mut config = Config::default();
        config.fish_speech_url = "tts:9881".into();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.batch_concurrency = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_rounds_that_outlast_the_stuck_threshold() {
        let mut config = Config::default();
        config.request_timeout_secs = 300;
        config.timeout_attempts = 3;
        config.stuck_threshold_secs = 600;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("stuck_threshold_secs"));

        config.stuck_threshold_secs = 904;
        assert!(config.validate().is_ok());
    }

    #[tokio::test]
    async fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(dir.path().join("absent.json")).await.unwrap();
        assert_eq!(config.stuck_threshold_secs, 600);
    }

    #[tokio::test]
    async fn malformed_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        tokio::fs::write(&path, "{ not json").await.unwrap();
        let err = Config::load(&path).await.unwrap_err();
        assert!(err.to_string().contains("Failed to parse config"));
    }
}
