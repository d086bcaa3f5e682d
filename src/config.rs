//! # Configuration Management
//!
//! Loads the relay configuration from several sources:
//! - Default values (built into the code)
//! - TOML configuration file (config.toml)
//! - Environment variables (with APP_ prefix)
//!
//! ## Key Rust Concepts Used:
//! - **Serde**: the same structs round-trip through TOML, environment variables and JSON
//! - **derive macros**: Debug, Clone, Serialize, Deserialize generated for every section
//! - **Result<T, E>**: loading and validation both report failures instead of panicking
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Platform variables `HOST`, `PORT` and `OPENAI_API_KEY`
//! 2. Environment variables (`APP_SERVER__PORT`, `APP_RELAY__MAX_PENDING_MESSAGES`, ...)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)

use crate::animation::scheduler::SchedulerConfig;
use crate::audio::analyzer::{default_bands, AnalyzerConfig, FrequencyBand};
use crate::audio::buffer::BoundaryPolicy;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Bands starting below this frequency must map to a vowel viseme.
const LOW_BAND_CEILING_HZ: f32 = 500.0;

/// Main application configuration.
///
/// ## Sections:
/// - **server**: where the HTTP/websocket listener binds
/// - **relay**: the upstream endpoint and per-session limits
/// - **animation**: the optional lip-sync pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub relay: RelayConfig,
    pub animation: AnimationConfig,
}

/// Listener settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: accept connections from any address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub workers: usize,
}

/// Upstream endpoint and session limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// The only request path accepted for websocket upgrades
    pub path: String,
    pub upstream_url: String,
    pub model: String,
    pub api_key: String,
    pub connect_timeout_ms: u64,
    /// Client messages that may queue while the upstream is connecting
    pub max_pending_messages: usize,
    pub max_concurrent_sessions: usize,
    pub heartbeat_interval_secs: u64,
    pub client_timeout_secs: u64,
}

impl RelayConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout_secs)
    }
}

/// Which input drives the viseme scheduler. One per deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnimationMode {
    /// Playback audio → spectrum analysis → interpolated targets
    #[default]
    Continuous,
    /// Transcript text → phonemes → timed viseme events
    Discrete,
}

/// Lip-sync pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnimationConfig {
    pub enabled: bool,
    pub mode: AnimationMode,
    pub sample_rate: u32,
    pub frame_duration_ms: u64,
    pub boundary: BoundaryPolicy,
    pub smoothing_rate: f32,
    pub frame_interval_ms: u64,
    pub tick_interval_ms: u64,
    pub activation_level: f32,
    pub phoneme_duration_ms: u64,
    pub settle_epsilon: f32,
    pub bands: Vec<FrequencyBand>,
}

impl AnimationConfig {
    pub fn analyzer_config(&self) -> AnalyzerConfig {
        AnalyzerConfig {
            sample_rate: self.sample_rate,
            frame_duration: Duration::from_millis(self.frame_duration_ms),
            boundary: self.boundary,
            bands: self.bands.clone(),
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            tick_interval: Duration::from_millis(self.tick_interval_ms),
            activation_level: self.activation_level,
            frame_interval: Duration::from_millis(self.frame_interval_ms),
            smoothing_rate: self.smoothing_rate,
            settle_epsilon: self.settle_epsilon,
        }
    }

    pub fn phoneme_duration(&self) -> Duration {
        Duration::from_millis(self.phoneme_duration_ms)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8081,
                workers: 1,
            },
            relay: RelayConfig {
                path: "/".to_string(),
                upstream_url: "wss://api.openai.com/v1/realtime".to_string(),
                model: "gpt-4o-realtime-preview-2024-10-01".to_string(),
                api_key: String::new(),
                connect_timeout_ms: 10_000,
                max_pending_messages: 1024,
                max_concurrent_sessions: 32,
                heartbeat_interval_secs: 30,
                client_timeout_secs: 60,
            },
            animation: AnimationConfig {
                enabled: false,
                mode: AnimationMode::Continuous,
                sample_rate: 24_000,
                frame_duration_ms: 30,
                boundary: BoundaryPolicy::Carry,
                smoothing_rate: 15.0,
                frame_interval_ms: 16,  // ~60 Hz
                tick_interval_ms: 200,  // 5 ticks per second
                activation_level: 0.5,
                phoneme_duration_ms: 100,
                settle_epsilon: 0.001,
                bands: default_bands(),
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from every source in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=9000`: override server port
    /// - `APP_RELAY__MAX_PENDING_MESSAGES=64`: override the pending bound
    /// - `APP_ANIMATION__ENABLED=true`: turn on lip-sync
    /// - `OPENAI_API_KEY=sk-...`: upstream credential
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        if let Ok(api_key) = env::var("OPENAI_API_KEY") {
            settings = settings.set_override("relay.api_key", api_key)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Reject configurations the relay cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.server.workers == 0 {
            return Err(anyhow::anyhow!("Server workers must be greater than 0"));
        }

        let relay = &self.relay;
        if relay.api_key.trim().is_empty() {
            return Err(anyhow::anyhow!(
                "Upstream API key is required (set OPENAI_API_KEY or relay.api_key)"
            ));
        }

        if !relay.path.starts_with('/') {
            return Err(anyhow::anyhow!("Relay path must start with '/': {:?}", relay.path));
        }

        if relay.connect_timeout_ms == 0 {
            return Err(anyhow::anyhow!("Connect timeout must be greater than 0"));
        }

        if relay.max_pending_messages == 0 {
            return Err(anyhow::anyhow!("Max pending messages must be greater than 0"));
        }

        if relay.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        if relay.heartbeat_interval_secs == 0 || relay.client_timeout_secs == 0 {
            return Err(anyhow::anyhow!("Heartbeat interval and client timeout must be greater than 0"));
        }

        self.validate_animation()
    }

    fn validate_animation(&self) -> Result<()> {
        let animation = &self.animation;

        if animation.sample_rate == 0 {
            return Err(anyhow::anyhow!("Animation sample rate must be greater than 0"));
        }

        if animation.frame_duration_ms == 0
            || animation.frame_interval_ms == 0
            || animation.tick_interval_ms == 0
            || animation.phoneme_duration_ms == 0
        {
            return Err(anyhow::anyhow!("Animation durations and intervals must be greater than 0"));
        }

        if !(animation.smoothing_rate > 0.0) {
            return Err(anyhow::anyhow!("Smoothing rate must be greater than 0"));
        }

        if !(animation.activation_level > 0.0 && animation.activation_level <= 1.0) {
            return Err(anyhow::anyhow!("Activation level must be in (0, 1]"));
        }

        // Voiced low-frequency energy is an open mouth
        if let Some(band) = animation
            .bands
            .iter()
            .find(|b| b.min_hz < LOW_BAND_CEILING_HZ && !b.viseme.is_vowel())
        {
            return Err(anyhow::anyhow!(
                "Band '{}' starts below {}Hz but maps to non-vowel {}",
                band.name,
                LOW_BAND_CEILING_HZ,
                band.viseme
            ));
        }

        if let Some(band) = animation.bands.iter().find(|b| b.min_hz > b.max_hz) {
            return Err(anyhow::anyhow!(
                "Band '{}' has min_hz {} above max_hz {}",
                band.name,
                band.min_hz,
                band.max_hz
            ));
        }

        Ok(())
    }

    /// Copy safe to show over HTTP: the API key is masked.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if !copy.relay.api_key.is_empty() {
            let hint: String = copy.relay.api_key.chars().take(3).collect();
            copy.relay.api_key = format!("{}...", hint);
        }
        copy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.relay.api_key = "sk-test-key".to_string();
        config
    }

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8081);
        assert_eq!(config.relay.path, "/");
        assert_eq!(config.animation.boundary, BoundaryPolicy::Carry);
        assert_eq!(config.animation.bands.len(), 7);

        // The only thing missing from the defaults is the credential
        assert!(config.validate().is_err());
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = valid_config();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.relay.path = "relay".to_string();
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.relay.max_pending_messages = 0;
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.animation.activation_level = 1.5;
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.animation.smoothing_rate = f32::NAN;
        assert!(config.validate().is_err());

        let mut config = valid_config();
        config.animation.bands[0].min_hz = 5_000.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_low_band_must_map_to_vowel() {
        let mut config = valid_config();
        config.animation.bands.push(FrequencyBand::new(
            "bilabial",
            crate::animation::viseme::Viseme::PP,
            60.0,
            180.0,
        ));

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("bilabial"));
    }

    #[test]
    fn test_redacted_hides_api_key() {
        let redacted = valid_config().redacted();
        assert_eq!(redacted.relay.api_key, "sk-...");
    }

    #[test]
    fn test_defaults_survive_config_round_trip() {
        let source = config::Config::try_from(&AppConfig::default()).unwrap();
        let loaded: AppConfig = config::Config::builder()
            .add_source(source)
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(loaded.animation.bands, default_bands());
        assert_eq!(loaded.animation.mode, AnimationMode::Continuous);
        assert_eq!(loaded.relay.max_pending_messages, 1024);
    }

    #[test]
    fn test_derived_component_configs() {
        let config = AppConfig::default();
        let analyzer = config.animation.analyzer_config();
        let scheduler = config.animation.scheduler_config();

        assert_eq!(analyzer.frame_duration, Duration::from_millis(30));
        assert_eq!(scheduler.tick_interval, Duration::from_millis(200));
        assert_eq!(scheduler.activation_level, 0.5);
    }
}
