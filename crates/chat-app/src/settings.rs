use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use murmur_llm::{BackendConfig, OPENAI_BACKEND_ID, ToolSpec};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use crate::conversation::PaginationTuning;
use crate::orchestrator::StreamTuning;

pub const SETTINGS_DIRECTORY_NAME: &str = "murmur";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const DATABASE_FILE_NAME: &str = "murmur.db";
pub const ENV_PREFIX: &str = "MURMUR_";
pub const DEFAULT_PROFILE_ID: &str = "default";
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// One configured backend. Converted into a fresh [`BackendConfig`] per send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendProfile {
    #[serde(default = "default_profile_id")]
    pub id: String,
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<u64>,
    #[serde(default = "default_streaming")]
    pub streaming: bool,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub tools: Vec<ToolSpec>,
}

impl Default for BackendProfile {
    fn default() -> Self {
        Self {
            id: default_profile_id(),
            backend: default_backend(),
            api_key: String::new(),
            base_url: String::new(),
            model: default_model(),
            temperature: None,
            top_p: None,
            max_tokens: None,
            streaming: true,
            system_prompt: None,
            tools: Vec::new(),
        }
    }
}

impl BackendProfile {
    /// Returns `None` when no API key is configured.
    pub fn to_backend_config(&self) -> Option<BackendConfig> {
        if self.api_key.trim().is_empty() {
            return None;
        }

        let mut config = BackendConfig::new(&self.backend, &self.api_key, &self.model)
            .with_base_url(&self.base_url)
            .with_streaming(self.streaming)
            .with_tools(self.tools.clone());
        config.temperature = self.temperature;
        config.top_p = self.top_p;
        config.max_tokens = self.max_tokens;
        if let Some(system_prompt) = &self.system_prompt
            && !system_prompt.trim().is_empty()
        {
            config = config.with_system_prompt(system_prompt.clone());
        }
        Some(config)
    }

    fn normalized(mut self) -> Option<Self> {
        self.id = self.id.trim().to_string();
        if self.id.is_empty() {
            return None;
        }
        self.backend = self.backend.trim().to_ascii_lowercase();
        self.api_key = self.api_key.trim().to_string();
        self.base_url = self.base_url.trim().to_string();
        self.model = if self.model.trim().is_empty() {
            default_model()
        } else {
            self.model.trim().to_string()
        };
        Some(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamSettings {
    pub ui_interval_ms: u64,
    pub store_quiet_period_ms: u64,
    pub store_growth_threshold: usize,
    pub final_echo_delay_ms: u64,
}

impl Default for StreamSettings {
    fn default() -> Self {
        let tuning = StreamTuning::default();
        Self {
            ui_interval_ms: tuning.ui_interval.as_millis() as u64,
            store_quiet_period_ms: tuning.store_quiet_period.as_millis() as u64,
            store_growth_threshold: tuning.store_growth_threshold,
            final_echo_delay_ms: tuning.final_echo_delay.as_millis() as u64,
        }
    }
}

impl StreamSettings {
    pub fn tuning(&self) -> StreamTuning {
        StreamTuning {
            ui_interval: Duration::from_millis(self.ui_interval_ms),
            store_quiet_period: Duration::from_millis(self.store_quiet_period_ms),
            store_growth_threshold: self.store_growth_threshold,
            final_echo_delay: Duration::from_millis(self.final_echo_delay_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaginationSettings {
    pub initial_page: u64,
    pub page_size: u64,
    pub cooldown_ms: u64,
    pub sync_window: u64,
}

impl Default for PaginationSettings {
    fn default() -> Self {
        let tuning = PaginationTuning::default();
        Self {
            initial_page: tuning.initial_page,
            page_size: tuning.page_size,
            cooldown_ms: tuning.cooldown.as_millis() as u64,
            sync_window: tuning.sync_window,
        }
    }
}

impl PaginationSettings {
    pub fn tuning(&self) -> PaginationTuning {
        PaginationTuning {
            initial_page: self.initial_page.max(1),
            page_size: self.page_size.max(1),
            cooldown: Duration::from_millis(self.cooldown_ms),
            sync_window: self.sync_window,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_database")]
    pub database: String,
    #[serde(default = "default_profile_id")]
    pub active_profile: String,
    #[serde(default = "default_profiles")]
    pub profiles: Vec<BackendProfile>,
    #[serde(default)]
    pub stream: StreamSettings,
    #[serde(default)]
    pub pagination: PaginationSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database: default_database(),
            active_profile: default_profile_id(),
            profiles: default_profiles(),
            stream: StreamSettings::default(),
            pagination: PaginationSettings::default(),
        }
    }
}

impl Settings {
    /// The profile named by `active_profile`, falling back to the first one.
    pub fn active_profile(&self) -> Option<&BackendProfile> {
        self.profiles
            .iter()
            .find(|profile| profile.id == self.active_profile)
            .or_else(|| self.profiles.first())
    }

    pub fn normalized(mut self) -> Self {
        self.database = if self.database.trim().is_empty() {
            default_database()
        } else {
            self.database.trim().to_string()
        };
        self.active_profile = self.active_profile.trim().to_string();

        // Blank profile rows are dropped rather than surfacing as an unusable backend.
        self.profiles = self
            .profiles
            .into_iter()
            .filter_map(BackendProfile::normalized)
            .collect();
        if self.profiles.is_empty() {
            self.profiles.push(BackendProfile::default());
        }

        self
    }
}

pub struct SettingsStore {
    settings: Arc<ArcSwap<Settings>>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".murmur"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    pub fn new(config_path: PathBuf) -> Self {
        let settings = Self::load_layers(&config_path);
        Self {
            settings: Arc::new(ArcSwap::from_pointee(settings)),
            config_path,
        }
    }

    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn settings(&self) -> Arc<Settings> {
        self.settings.load_full()
    }

    pub fn update(&self, settings: Settings) -> Result<(), SettingsError> {
        let normalized_settings = settings.normalized();
        self.persist(&normalized_settings)?;
        self.settings.store(Arc::new(normalized_settings));
        Ok(())
    }

    /// Defaults, then the JSON file if present, then `MURMUR_*` variables
    /// (`__` separates nested keys, e.g. `MURMUR_STREAM__UI_INTERVAL_MS`).
    fn load_layers(path: &Path) -> Settings {
        let mut figment = Figment::from(Serialized::defaults(Settings::default()));
        if path.exists() {
            figment = figment.merge(Json::file(path));
        } else {
            tracing::info!(path = ?path, "settings file not found, using defaults");
        }
        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        match figment.extract::<Settings>() {
            Ok(settings) => settings.normalized(),
            Err(error) => {
                tracing::warn!(
                    path = ?path,
                    error = %error,
                    "failed to parse settings, using defaults"
                );
                Settings::default()
            }
        }
    }

    fn persist(&self, settings: &Settings) -> Result<(), SettingsError> {
        if let Some(parent) = self.config_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).context(CreateDirSnafu {
                stage: "create-settings-directory",
                path: parent.to_path_buf(),
            })?;
        }

        let content = serde_json::to_string_pretty(settings).context(SerializeSettingsSnafu {
            stage: "serialize-settings-json",
        })?;

        let temp_path = self.config_path.with_extension("json.tmp");
        std::fs::write(&temp_path, content).context(WriteFileSnafu {
            stage: "write-temporary-settings-file",
            path: temp_path.clone(),
        })?;

        std::fs::rename(&temp_path, &self.config_path).context(RenameTempFileSnafu {
            stage: "rename-temporary-settings-file",
            from: temp_path,
            to: self.config_path.clone(),
        })?;

        tracing::info!(path = ?self.config_path, "saved settings");
        Ok(())
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("failed to create settings directory at {path:?} on `{stage}`: {source}"))]
    CreateDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to serialize settings on `{stage}`: {source}"))]
    SerializeSettings {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to write settings file at {path:?} on `{stage}`: {source}"))]
    WriteFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display(
        "failed to replace settings file from {from:?} to {to:?} on `{stage}`: {source}"
    ))]
    RenameTempFile {
        stage: &'static str,
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

fn default_profile_id() -> String {
    DEFAULT_PROFILE_ID.to_string()
}

fn default_backend() -> String {
    OPENAI_BACKEND_ID.to_string()
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_streaming() -> bool {
    true
}

fn default_profiles() -> Vec<BackendProfile> {
    vec![BackendProfile::default()]
}

fn default_database() -> String {
    dirs::data_dir()
        .map(|path| path.join(SETTINGS_DIRECTORY_NAME).join(DATABASE_FILE_NAME))
        .unwrap_or_else(|| PathBuf::from(".murmur").join(DATABASE_FILE_NAME))
        .to_string_lossy()
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_path(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("murmur-settings-{}-{name}", std::process::id()))
            .join(SETTINGS_FILE_NAME)
    }

    #[test]
    fn defaults_match_stream_and_pagination_constants() {
        let settings = Settings::default();
        assert_eq!(settings.stream.tuning(), StreamTuning::default());
        assert_eq!(settings.pagination.tuning(), PaginationTuning::default());
        assert_eq!(
            settings.active_profile().map(|p| p.backend.as_str()),
            Some("openai")
        );
    }

    #[test]
    fn profile_without_key_yields_no_config() {
        let profile = BackendProfile::default();
        assert!(profile.to_backend_config().is_none());

        let profile = BackendProfile {
            api_key: " sk-live ".to_string(),
            backend: "anthropic".to_string(),
            model: "claude-3-5-haiku-latest".to_string(),
            temperature: Some(0.2),
            streaming: false,
            ..BackendProfile::default()
        };
        let config = profile.to_backend_config().expect("config");
        assert_eq!(config.api_key, "sk-live");
        assert_eq!(config.backend_id, "anthropic");
        assert_eq!(config.temperature, Some(0.2));
        assert!(!config.streaming);
    }

    #[test]
    fn file_layer_overrides_defaults_and_keeps_missing_fields() {
        let path = scratch_path("layered");
        let _ = std::fs::remove_file(&path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("scratch dir");
        }
        std::fs::write(
            &path,
            r#"{
                "active_profile": "work",
                "profiles": [
                    {"id": "work", "backend": "Anthropic", "api_key": "k", "model": ""},
                    {"id": "  "}
                ],
                "stream": {"ui_interval_ms": 60, "store_quiet_period_ms": 200,
                           "store_growth_threshold": 100, "final_echo_delay_ms": 50}
            }"#,
        )
        .expect("write settings");

        let store = SettingsStore::new(path.clone());
        let settings = store.settings();
        assert_eq!(settings.profiles.len(), 1);
        let active = settings.active_profile().expect("active profile");
        assert_eq!(active.id, "work");
        assert_eq!(active.backend, "anthropic");
        assert_eq!(active.model, DEFAULT_MODEL);
        assert_eq!(settings.stream.ui_interval_ms, 60);
        assert_eq!(settings.pagination, PaginationSettings::default());

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn update_persists_atomically_and_reloads() {
        let path = scratch_path("persist");
        let _ = std::fs::remove_file(&path);
        let store = SettingsStore::new(path.clone());

        let mut settings = (*store.settings()).clone();
        settings.active_profile = "default".to_string();
        settings.profiles[0].api_key = "sk-saved".to_string();
        store.update(settings).expect("persist settings");

        assert!(!path.with_extension("json.tmp").exists());
        let reloaded = SettingsStore::new(path.clone());
        assert_eq!(
            reloaded.settings().active_profile().map(|p| p.api_key.as_str()),
            Some("sk-saved")
        );

        let _ = std::fs::remove_file(&path);
    }
}
