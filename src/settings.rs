use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::streaming::{DEFAULT_MODEL, DEFAULT_VOICE, LIVE_API_URL};

const APP_DIR_NAME: &str = "live-voice";
const SETTINGS_FILE_NAME: &str = "settings.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    /// Live API model, with or without the `models/` prefix.
    pub model: String,

    /// Prebuilt voice used for replies.
    pub voice_name: String,

    /// WebSocket endpoint; the API key is appended as `?key=`.
    pub endpoint: String,

    /// Plain-text file sent as the system instruction. Relative paths resolve
    /// against the settings file's directory.
    pub instructions_path: Option<PathBuf>,

    /// Input device name. Falls back to the system default when missing.
    pub input_device: Option<String>,

    /// Output device name. Falls back to the system default when missing.
    pub output_device: Option<String>,

    /// Linear gain applied to captured audio before framing.
    pub input_gain: f32,

    /// Linear gain applied to the playback mix.
    pub output_gain: f32,

    /// Outbound frames buffered while the socket is slow (256 frames ≈ 4s).
    /// Frames beyond this are dropped.
    pub outbound_queue_frames: usize,

    /// Capacity of the controller's event queue.
    pub event_queue_capacity: usize,

    /// Start the microphone at launch. Frames are only streamed once the
    /// session is open; earlier ones are discarded.
    pub auto_record: bool,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            voice_name: DEFAULT_VOICE.to_string(),
            endpoint: LIVE_API_URL.to_string(),
            instructions_path: None,
            input_device: None,
            output_device: None,
            input_gain: 1.0,
            output_gain: 1.0,
            outbound_queue_frames: 256,
            event_queue_capacity: 1024,
            auto_record: false,
        }
    }
}

impl AppSettings {
    /// Read the system instruction file, if one is configured.
    ///
    /// A missing or unreadable file is logged and treated as "no instruction".
    pub fn load_instructions(&self, base_dir: Option<&Path>) -> Option<String> {
        let path = self.instructions_path.as_ref()?;
        let path = match base_dir {
            Some(dir) if path.is_relative() => dir.join(path),
            _ => path.clone(),
        };

        match std::fs::read_to_string(&path) {
            Ok(text) if text.trim().is_empty() => {
                log::warn!("Settings: instructions file {:?} is empty", path);
                None
            }
            Ok(text) => Some(text),
            Err(e) => {
                log::warn!("Settings: failed to read instructions {:?}: {}", path, e);
                None
            }
        }
    }
}

/// `<config_dir>/live-voice/settings.json`
pub fn default_settings_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(APP_DIR_NAME).join(SETTINGS_FILE_NAME))
}

pub fn load_settings(path: &Path) -> AppSettings {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str::<AppSettings>(&contents) {
            Ok(settings) => {
                log::info!("Settings: loaded {:?}", path);
                settings
            }
            Err(e) => {
                log::warn!("Settings: failed to parse {:?}: {}", path, e);
                AppSettings::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => AppSettings::default(),
        Err(e) => {
            log::warn!("Settings: failed to read {:?}: {}", path, e);
            AppSettings::default()
        }
    }
}
