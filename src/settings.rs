use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const SETTINGS_DIR_NAME: &str = "speaksea-session";
const SETTINGS_FILE_NAME: &str = "settings.json";
const CONVERSATION_PATH: &str = "/api/chat/conversation";

pub const DEFAULT_GREETING: &str = "Good morning! Welcome to this PSLE Oral Examination. You may start by introducing yourself, and then I will ask you the first question about the video you just watched.";
pub const DEFAULT_APOLOGY: &str =
    "I'm sorry, I'm having trouble processing your response. Could you try again?";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExamSettings {
    /// Conversation pipeline endpoint that receives one turn per POST.
    pub conversation_endpoint: String,

    /// Endpoint issuing real-time connection details (server address + token).
    pub connection_details_endpoint: String,

    /// Number of conversation steps after which the exam is complete.
    pub turn_limit: u32,

    /// Capture microphone audio before the real-time connection is up.
    pub pre_connect_buffer_enabled: bool,

    /// Upper bound on audio held while waiting for the connection.
    pub pre_connect_buffer_secs: f32,

    /// How long the "session ended" signal stays active before navigation.
    pub session_ended_display_ms: u64,

    /// Video stimulus viewing period before the exam conversation begins.
    pub stimulus_countdown_secs: u64,

    /// Timeout applied by the HTTP layer to each turn submission.
    pub request_timeout_secs: u64,

    /// Opening examiner line shown before the first turn. Never sent upstream.
    pub greeting: Option<String>,

    /// Examiner line appended when a turn submission fails.
    pub apology_message: String,
}

impl Default for ExamSettings {
    fn default() -> Self {
        Self {
            conversation_endpoint: format!("http://localhost:8000{}", CONVERSATION_PATH),
            connection_details_endpoint: "http://localhost:3000/api/connection-details"
                .to_string(),
            turn_limit: 3,
            pre_connect_buffer_enabled: true,
            pre_connect_buffer_secs: 10.0,
            session_ended_display_ms: 3000,
            stimulus_countdown_secs: 180,
            request_timeout_secs: 60,
            greeting: Some(DEFAULT_GREETING.to_string()),
            apology_message: DEFAULT_APOLOGY.to_string(),
        }
    }
}

impl ExamSettings {
    pub fn session_ended_display(&self) -> Duration {
        Duration::from_millis(self.session_ended_display_ms)
    }

    pub fn stimulus_countdown(&self) -> Duration {
        Duration::from_secs(self.stimulus_countdown_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Apply `SPEAKSEA_*` environment overrides on top of the loaded values.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(base) = lookup("SPEAKSEA_API_URL").filter(|v| !v.is_empty()) {
            self.conversation_endpoint =
                format!("{}{}", base.trim_end_matches('/'), CONVERSATION_PATH);
        }
        if let Some(url) = lookup("SPEAKSEA_CONNECTION_DETAILS_URL").filter(|v| !v.is_empty()) {
            self.connection_details_endpoint = url;
        }
        if let Some(raw) = lookup("SPEAKSEA_TURN_LIMIT") {
            match raw.parse::<u32>() {
                Ok(limit) if limit > 0 => self.turn_limit = limit,
                _ => log::warn!("Settings: ignoring invalid SPEAKSEA_TURN_LIMIT={:?}", raw),
            }
        }
    }
}

/// Default settings location: `<config_dir>/speaksea-session/settings.json`.
pub fn default_settings_path() -> Result<PathBuf, String> {
    let dir = dirs::config_dir()
        .ok_or_else(|| "Could not determine config directory".to_string())?;
    Ok(dir.join(SETTINGS_DIR_NAME).join(SETTINGS_FILE_NAME))
}

pub fn load_settings(path: &Path) -> ExamSettings {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str::<ExamSettings>(&contents) {
            Ok(settings) => settings,
            Err(e) => {
                log::warn!("Settings: failed to parse {:?}: {}", path, e);
                ExamSettings::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => ExamSettings::default(),
        Err(e) => {
            log::warn!("Settings: failed to read {:?}: {}", path, e);
            ExamSettings::default()
        }
    }
}

pub fn save_settings(path: &Path, settings: &ExamSettings) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory {:?}: {}", parent, e))?;
    }

    let contents =
        serde_json::to_string_pretty(settings).map_err(|e| format!("Serialize settings: {}", e))?;

    // Write to a sibling temp file then rename so a crash never leaves a torn file.
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &contents)
        .map_err(|e| format!("Write temp settings {:?}: {}", tmp_path, e))?;

    // rename() does not replace an existing file on Windows
    if cfg!(windows) && path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(format!("Remove existing settings file {:?}: {}", path, e));
            }
        }
    }

    std::fs::rename(&tmp_path, path)
        .map_err(|e| format!("Rename temp settings {:?} to {:?}: {}", tmp_path, path, e))?;
    Ok(())
}
