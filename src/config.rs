use anyhow::{Context, Result};
use std::{path::PathBuf, time::Duration};

use crate::audio::{
    engine::EngineSettings,
    queue::QueueLimits,
    retry::RetryPolicy,
};

#[derive(Debug, Clone)]
pub struct Config {
    // Discord
    pub discord_token: String,
    pub guild_id: Option<u64>, // Para comandos de desarrollo

    // Audio
    pub default_volume: f32,
    pub max_queue_size: usize,
    pub max_history_size: usize,

    // Reintentos
    pub max_retries: u32,
    pub retry_backoff: Duration,
    pub connect_attempts: u32,
    pub connect_retry_delay: Duration,

    // Canal de voz
    pub idle_timeout: Duration,

    // yt-dlp
    pub ytdlp_path: String,
    pub ytdlp_cookies: Option<PathBuf>,
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from any key lookup. `load` uses the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let config = Self {
            // Discord
            discord_token: var("DISCORD_TOKEN").context("DISCORD_TOKEN is not set")?,
            guild_id: var("GUILD_ID")
                .map(|s| s.trim().parse())
                .transpose()
                .context("GUILD_ID must be a numeric guild id")?,

            // Audio
            default_volume: parse_or(var("DEFAULT_VOLUME"), defaults.default_volume, "DEFAULT_VOLUME")?,
            max_queue_size: parse_or(var("MAX_QUEUE_SIZE"), defaults.max_queue_size, "MAX_QUEUE_SIZE")?,
            max_history_size: parse_or(
                var("MAX_HISTORY_SIZE"),
                defaults.max_history_size,
                "MAX_HISTORY_SIZE",
            )?,

            // Reintentos
            max_retries: parse_or(var("MAX_RETRIES"), defaults.max_retries, "MAX_RETRIES")?,
            retry_backoff: duration_or(var("RETRY_BACKOFF"), defaults.retry_backoff, "RETRY_BACKOFF")?,
            connect_attempts: parse_or(
                var("CONNECT_ATTEMPTS"),
                defaults.connect_attempts,
                "CONNECT_ATTEMPTS",
            )?,
            connect_retry_delay: duration_or(
                var("CONNECT_RETRY_DELAY"),
                defaults.connect_retry_delay,
                "CONNECT_RETRY_DELAY",
            )?,

            idle_timeout: duration_or(var("IDLE_TIMEOUT"), defaults.idle_timeout, "IDLE_TIMEOUT")?,

            ytdlp_path: var("YTDLP_PATH").unwrap_or(defaults.ytdlp_path),
            ytdlp_cookies: var("YTDLP_COOKIES").map(PathBuf::from),
        };

        config.validate()?;

        Ok(config)
    }

    /// Validates configuration values for correctness.
    ///
    /// # Validation Rules
    ///
    /// - Volume must be between 0.0 and 1.0
    /// - Queue size and attempt counts must be greater than 0
    /// - The cookie file, when given, must exist
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.default_volume) {
            anyhow::bail!("Default volume must be between 0.0 and 1.0, got: {}", self.default_volume);
        }

        if self.max_queue_size == 0 {
            anyhow::bail!("Max queue size must be greater than 0");
        }

        if self.max_retries == 0 {
            anyhow::bail!("Max retries must be greater than 0");
        }

        if self.connect_attempts == 0 {
            anyhow::bail!("Connect attempts must be greater than 0");
        }

        if let Some(cookies) = &self.ytdlp_cookies {
            if !cookies.is_file() {
                anyhow::bail!("yt-dlp cookie file not found: {}", cookies.display());
            }
        }

        Ok(())
    }

    /// The subset of settings the playback engine needs.
    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            limits: QueueLimits {
                max_size: self.max_queue_size,
                max_history: self.max_history_size,
            },
            default_volume: self.default_volume,
            retry: RetryPolicy::new(self.max_retries, self.retry_backoff),
            connect_attempts: self.connect_attempts,
            connect_retry_delay: self.connect_retry_delay,
        }
    }

    /// Returns a summary of the current configuration for logging.
    ///
    /// Never includes the token.
    pub fn summary(&self) -> String {
        format!(
            "Config Summary:\n  \
            Discord: commands {}\n  \
            Audio: {}% vol, {} queue, {} history\n  \
            Retries: {} x {} playback, {} x {} connect\n  \
            Idle timeout: {}\n  \
            yt-dlp: {} (cookies: {})",
            self.guild_id.map_or("global".to_string(), |id| format!("on guild {id}")),
            (self.default_volume * 100.0).round() as u32,
            self.max_queue_size,
            self.max_history_size,
            self.max_retries,
            humantime::format_duration(self.retry_backoff),
            self.connect_attempts,
            humantime::format_duration(self.connect_retry_delay),
            humantime::format_duration(self.idle_timeout),
            self.ytdlp_path,
            self.ytdlp_cookies.as_ref().map_or("none".to_string(), |p| p.display().to_string()),
        )
    }
}

fn parse_or<T>(value: Option<String>, default: T, key: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match value {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{key} has an invalid value: {raw}")),
        None => Ok(default),
    }
}

fn duration_or(value: Option<String>, default: Duration, key: &str) -> Result<Duration> {
    match value {
        Some(raw) => humantime::parse_duration(raw.trim())
            .with_context(|| format!("{key} must be a duration like `1s` or `500ms`, got: {raw}")),
        None => Ok(default),
    }
}

/// Default configuration values.
///
/// Used as fallbacks when environment variables are not provided.
impl Default for Config {
    fn default() -> Self {
        let engine = EngineSettings::default();
        Self {
            // Discord (sin valores por defecto, es obligatorio)
            discord_token: String::new(),
            guild_id: None,

            default_volume: engine.default_volume,
            max_queue_size: engine.limits.max_size,
            max_history_size: engine.limits.max_history,

            max_retries: engine.retry.max_retries,
            retry_backoff: engine.retry.backoff,
            connect_attempts: engine.connect_attempts,
            connect_retry_delay: engine.connect_retry_delay,

            idle_timeout: Duration::from_secs(60),

            ytdlp_path: "yt-dlp".to_string(),
            ytdlp_cookies: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_match_engine_defaults() {
        let config = load(&[("DISCORD_TOKEN", "token")]).expect("valid config");
        assert_eq!(config.engine_settings(), EngineSettings::default());
        assert_eq!(config.idle_timeout, Duration::from_secs(60));
        assert_eq!(config.ytdlp_path, "yt-dlp");
        assert_eq!(config.guild_id, None);
    }

    #[test]
    fn token_is_required() {
        assert!(load(&[]).is_err());
        assert!(load(&[("DISCORD_TOKEN", "  ")]).is_err());
    }

    #[test]
    fn parses_overrides() {
        let config = load(&[
            ("DISCORD_TOKEN", "token"),
            ("GUILD_ID", "1234"),
            ("DEFAULT_VOLUME", "0.8"),
            ("MAX_QUEUE_SIZE", "10"),
            ("RETRY_BACKOFF", "250ms"),
            ("IDLE_TIMEOUT", "2m"),
        ])
        .expect("valid config");

        assert_eq!(config.guild_id, Some(1234));
        assert_eq!(config.default_volume, 0.8);
        assert_eq!(config.engine_settings().limits.max_size, 10);
        assert_eq!(config.engine_settings().retry.backoff, Duration::from_millis(250));
        assert_eq!(config.idle_timeout, Duration::from_secs(120));
    }

    #[test]
    fn rejects_bad_values() {
        assert!(load(&[("DISCORD_TOKEN", "t"), ("DEFAULT_VOLUME", "1.5")]).is_err());
        assert!(load(&[("DISCORD_TOKEN", "t"), ("MAX_QUEUE_SIZE", "0")]).is_err());
        assert!(load(&[("DISCORD_TOKEN", "t"), ("RETRY_BACKOFF", "soon")]).is_err());
        assert!(load(&[("DISCORD_TOKEN", "t"), ("GUILD_ID", "abc")]).is_err());
    }

    #[test]
    fn summary_hides_token() {
        let config = load(&[("DISCORD_TOKEN", "super-secret")]).expect("valid config");
        let summary = config.summary();
        assert!(!summary.contains("super-secret"));
        assert!(summary.contains("50% vol"));
        assert!(summary.contains("commands global"));
    }
}
