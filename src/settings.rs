//! User preferences persisted as `settings.json` in the data directory

use crate::context::DEFAULT_MAX_TOKENS;
use crate::error::{KaedeError, Result};
use crate::gateway::{DEFAULT_CLOUD_MODEL, DEFAULT_TEMPERATURE};
use crate::local_model::{LocalModelConfig, DEFAULT_LOCAL_MODEL, DEFAULT_OLLAMA_URL};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::{Path, PathBuf};

pub const SETTINGS_FILE: &str = "settings.json";

/// Which backend path a chat turn takes
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RoutingMode {
    /// Full context assembled locally and sent to the cloud model
    #[default]
    Cloud,
    /// Local model compresses the context first
    #[serde(alias = "pc")]
    Hybrid,
}

impl RoutingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cloud => "cloud",
            Self::Hybrid => "hybrid",
        }
    }
}

impl fmt::Display for RoutingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    #[default]
    Light,
    Dark,
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VoiceSettings {
    pub tts_enabled: bool,
    pub stt_enabled: bool,
    pub voice_rate: f32,
    pub voice_pitch: f32,
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self {
            tts_enabled: false,
            stt_enabled: false,
            voice_rate: 1.1,
            voice_pitch: 1.15,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub max_tokens: i64,
    pub temperature: f32,
    pub haptic_enabled: bool,
    pub mode: RoutingMode,
    pub theme: Theme,
    pub cloud_model: String,
    pub ollama_url: String,
    pub ollama_model: String,
    /// Empty means talk to the local model directly
    pub bridge_url: String,
    pub voice: VoiceSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: DEFAULT_TEMPERATURE,
            haptic_enabled: true,
            mode: RoutingMode::Cloud,
            theme: Theme::Light,
            cloud_model: DEFAULT_CLOUD_MODEL.to_string(),
            ollama_url: DEFAULT_OLLAMA_URL.to_string(),
            ollama_model: DEFAULT_LOCAL_MODEL.to_string(),
            bridge_url: String::new(),
            voice: VoiceSettings::default(),
        }
    }
}

impl Settings {
    pub fn path_in(data_dir: impl AsRef<Path>) -> PathBuf {
        data_dir.as_ref().join(SETTINGS_FILE)
    }

    pub fn local_model_config(&self) -> LocalModelConfig {
        LocalModelConfig {
            ollama_url: self.ollama_url.clone(),
            model: self.ollama_model.clone(),
            bridge_url: Some(self.bridge_url.trim())
                .filter(|url| !url.is_empty())
                .map(str::to_string),
        }
    }

    /// Overlay a partial JSON object. Top-level keys replace, `voice` merges
    /// key by key. Unknown keys are ignored.
    pub fn merged(&self, patch: &Value) -> Result<Self> {
        let patch = patch
            .as_object()
            .ok_or_else(|| KaedeError::Validation("settings patch must be a JSON object".into()))?;

        let mut current = serde_json::to_value(self)?;
        if let Some(target) = current.as_object_mut() {
            for (key, value) in patch {
                if key == "voice" {
                    if let (Some(Value::Object(voice)), Value::Object(fields)) =
                        (target.get_mut("voice"), value)
                    {
                        for (k, v) in fields {
                            voice.insert(k.clone(), v.clone());
                        }
                        continue;
                    }
                }
                target.insert(key.clone(), value.clone());
            }
        }

        serde_json::from_value(current)
            .map_err(|e| KaedeError::Validation(format!("invalid settings: {e}")))
    }

    /// Read settings from disk. A missing file yields defaults; an unreadable
    /// one is logged and also yields defaults.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Self::default(),
            Err(e) => {
                tracing::warn!(path = %path.display(), "failed to read settings: {e}");
                return Self::default();
            }
        };

        match serde_json::from_str::<Value>(&raw)
            .map_err(KaedeError::from)
            .and_then(|value| Self::default().merged(&value))
        {
            Ok(settings) => settings,
            Err(e) => {
                tracing::warn!(path = %path.display(), "failed to parse settings: {e}");
                Self::default()
            }
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults() {
        let settings = Settings::default();
        assert_eq!(settings.max_tokens, 2000);
        assert_eq!(settings.temperature, 0.8);
        assert_eq!(settings.cloud_model, "gpt-5.2");
        assert_eq!(settings.ollama_model, "llama3.2");
        assert_eq!(settings.mode, RoutingMode::Cloud);
        assert_eq!(settings.voice.voice_pitch, 1.15);
        assert!(settings.local_model_config().bridge_url.is_none());
    }

    #[test]
    fn merge_keeps_unmentioned_voice_fields() {
        let settings = Settings::default()
            .merged(&json!({"theme": "dark", "voice": {"ttsEnabled": true}}))
            .unwrap();
        assert_eq!(settings.theme, Theme::Dark);
        assert!(settings.voice.tts_enabled);
        assert_eq!(settings.voice.voice_rate, 1.1);
        assert_eq!(settings.max_tokens, 2000);
    }

    #[test]
    fn legacy_pc_mode_is_hybrid() {
        let settings = Settings::default()
            .merged(&json!({"mode": "pc", "ollamaModel": "qwen2.5"}))
            .unwrap();
        assert_eq!(settings.mode, RoutingMode::Hybrid);
        assert_eq!(settings.local_model_config().model, "qwen2.5");
        assert_eq!(serde_json::to_value(&settings).unwrap()["mode"], "hybrid");
    }

    #[test]
    fn bad_patch_is_rejected() {
        assert!(matches!(
            Settings::default().merged(&json!({"maxTokens": "lots"})),
            Err(KaedeError::Validation(_))
        ));
        assert!(Settings::default().merged(&json!([1])).is_err());
    }

    #[test]
    fn bridge_url_is_trimmed() {
        let settings = Settings::default()
            .merged(&json!({"bridgeUrl": " http://192.168.1.20:5001 "}))
            .unwrap();
        assert_eq!(
            settings.local_model_config().bridge_url.as_deref(),
            Some("http://192.168.1.20:5001")
        );
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = Settings::path_in(dir.path());
        assert_eq!(Settings::load(&path), Settings::default());

        let settings = Settings::default().merged(&json!({"maxTokens": 3500})).unwrap();
        settings.save(&path).unwrap();
        assert_eq!(Settings::load(&path).max_tokens, 3500);

        std::fs::write(&path, "{ broken").unwrap();
        assert_eq!(Settings::load(&path), Settings::default());
    }
}
