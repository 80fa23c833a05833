//! Kiosk session settings and validation.
//!
//! All fields are optional so a partial settings file (or a handful of
//! environment variables) can override just what it needs; everything else
//! falls back to the `DEFAULT_*` constants through the `effective_*` getters.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default live model.
pub const DEFAULT_MODEL: &str = "gemini-2.5-flash-native-audio-preview-09-2025";

/// Default prebuilt voice for agent speech.
pub const DEFAULT_VOICE: &str = "Zephyr";

/// Synthetic directive sent once when the channel opens so the agent speaks first.
pub const DEFAULT_GREETING: &str = "The customer has connected. Greet them warmly, ask for their name, and then wait for their response.";

/// Capture chunk size in samples (≈128 ms at 16 kHz).
pub const DEFAULT_CHUNK_SAMPLES: u32 = 2048;

/// How long to wait for the channel to report ready.
pub const DEFAULT_OPEN_TIMEOUT_SECS: u64 = 15;

/// Environment variables read by [`KioskSettings::from_env`].
pub const ENV_MODEL: &str = "KIOSK_MODEL";
pub const ENV_VOICE: &str = "KIOSK_VOICE";
pub const ENV_GREETING: &str = "KIOSK_GREETING";
pub const ENV_SYSTEM_INSTRUCTION: &str = "KIOSK_SYSTEM_INSTRUCTION";
pub const ENV_CHUNK_SAMPLES: &str = "KIOSK_CHUNK_SAMPLES";
pub const ENV_OPEN_TIMEOUT_SECS: &str = "KIOSK_OPEN_TIMEOUT_SECS";

/// Settings for one kiosk session controller.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct KioskSettings {
    /// Live model name, without the `models/` prefix.
    pub model: Option<String>,

    /// Prebuilt voice used for agent speech.
    pub voice_name: Option<String>,

    /// Text sent as the first user turn once the channel is open.
    pub greeting: Option<String>,

    /// Persona / instructions for the agent. When unset the session composes
    /// a minimal instruction from the menu.
    pub system_instruction: Option<String>,

    /// Samples per outbound capture frame (power of two, 256-16384).
    pub chunk_samples: Option<u32>,

    /// Seconds to wait for the channel to open before giving up (1-120).
    pub open_timeout_secs: Option<u64>,
}

impl KioskSettings {
    /// Create settings with sensible defaults.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self {
            model: Some(DEFAULT_MODEL.to_string()),
            voice_name: Some(DEFAULT_VOICE.to_string()),
            greeting: Some(DEFAULT_GREETING.to_string()),
            system_instruction: None,
            chunk_samples: Some(DEFAULT_CHUNK_SAMPLES),
            open_timeout_secs: Some(DEFAULT_OPEN_TIMEOUT_SECS),
        }
    }

    /// Load a `.env` file if present, then overlay `KIOSK_*` variables on
    /// the defaults. Unparseable numeric values are ignored with a warning.
    pub fn from_env() -> Result<Self, SettingsError> {
        load_dotenv();
        let settings = Self::from_lookup(|key| std::env::var(key).ok());
        validate_settings(&settings)?;
        Ok(settings)
    }

    /// Overlay values produced by `lookup` on the defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut settings = Self::with_defaults();

        if let Some(model) = lookup(ENV_MODEL) {
            settings.model = Some(model);
        }
        if let Some(voice) = lookup(ENV_VOICE) {
            settings.voice_name = Some(voice);
        }
        if let Some(greeting) = lookup(ENV_GREETING) {
            settings.greeting = Some(greeting);
        }
        if let Some(instruction) = lookup(ENV_SYSTEM_INSTRUCTION) {
            settings.system_instruction = Some(instruction);
        }
        if let Some(raw) = lookup(ENV_CHUNK_SAMPLES) {
            match raw.trim().parse() {
                Ok(n) => settings.chunk_samples = Some(n),
                Err(_) => tracing::warn!(value = %raw, "Ignoring invalid {ENV_CHUNK_SAMPLES}"),
            }
        }
        if let Some(raw) = lookup(ENV_OPEN_TIMEOUT_SECS) {
            match raw.trim().parse() {
                Ok(n) => settings.open_timeout_secs = Some(n),
                Err(_) => tracing::warn!(value = %raw, "Ignoring invalid {ENV_OPEN_TIMEOUT_SECS}"),
            }
        }

        settings
    }

    pub fn effective_model(&self) -> &str {
        self.model.as_deref().unwrap_or(DEFAULT_MODEL)
    }

    pub fn effective_voice(&self) -> &str {
        self.voice_name.as_deref().unwrap_or(DEFAULT_VOICE)
    }

    pub fn effective_greeting(&self) -> &str {
        self.greeting.as_deref().unwrap_or(DEFAULT_GREETING)
    }

    #[must_use]
    pub const fn effective_chunk_samples(&self) -> usize {
        match self.chunk_samples {
            Some(n) => n as usize,
            None => DEFAULT_CHUNK_SAMPLES as usize,
        }
    }

    #[must_use]
    pub const fn effective_open_timeout(&self) -> Duration {
        match self.open_timeout_secs {
            Some(secs) => Duration::from_secs(secs),
            None => Duration::from_secs(DEFAULT_OPEN_TIMEOUT_SECS),
        }
    }
}

/// Settings validation error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SettingsError {
    #[error("Chunk size must be a power of two between 256 and 16384, got {0}")]
    InvalidChunkSize(u32),

    #[error("Open timeout must be between 1 and 120 seconds, got {0}")]
    InvalidOpenTimeout(u64),

    #[error("Model name cannot be empty")]
    EmptyModel,

    #[error("Voice name cannot be empty")]
    EmptyVoice,

    #[error("Greeting cannot be empty")]
    EmptyGreeting,
}

/// Validate settings values.
pub fn validate_settings(settings: &KioskSettings) -> Result<(), SettingsError> {
    if let Some(chunk) = settings.chunk_samples {
        if !(256..=16_384).contains(&chunk) || !chunk.is_power_of_two() {
            return Err(SettingsError::InvalidChunkSize(chunk));
        }
    }

    if let Some(secs) = settings.open_timeout_secs {
        if !(1..=120).contains(&secs) {
            return Err(SettingsError::InvalidOpenTimeout(secs));
        }
    }

    if settings.model.as_ref().is_some_and(|m| m.trim().is_empty()) {
        return Err(SettingsError::EmptyModel);
    }

    if settings
        .voice_name
        .as_ref()
        .is_some_and(|v| v.trim().is_empty())
    {
        return Err(SettingsError::EmptyVoice);
    }

    if settings.greeting.as_ref().is_some_and(|g| g.trim().is_empty()) {
        return Err(SettingsError::EmptyGreeting);
    }

    Ok(())
}

fn load_dotenv() {
    if let Ok(path) = dotenvy::dotenv() {
        tracing::debug!(path = %path.display(), "Loaded .env file");
    }
}

/// Read the live API key from `GEMINI_API_KEY`, falling back to `API_KEY`.
/// A `.env` file in the working directory is loaded first.
pub fn api_key_from_env() -> Option<String> {
    load_dotenv();
    api_key_from_lookup(|key| std::env::var(key).ok())
}

/// Pick the first non-blank API key produced by `lookup`.
pub fn api_key_from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Option<String> {
    ["GEMINI_API_KEY", "API_KEY"]
        .into_iter()
        .filter_map(lookup)
        .find(|value| !value.trim().is_empty())
}
