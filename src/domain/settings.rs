use crate::domain::models::{DeviceId, ScanFilter};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_false")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_false")]
    pub show_file_line: bool,
    #[serde(default = "default_false")]
    pub show_thread_ids: bool,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "minutely", "never"
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_logging_enabled: default_false(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_false(),
            show_thread_ids: default_false(),
            show_target: default_true(),
            ansi_colors: default_true(),
            rotation: default_rotation(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_prefix() -> String {
    "ble_link_manager".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub log_settings: LogSettings,

    // Liveness
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_staleness_threshold_ms")]
    pub staleness_threshold_ms: u64,
    #[serde(default = "default_ping_timeout_ms")]
    pub ping_timeout_ms: u64,

    // Pending operations
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,

    // Scanning
    #[serde(default = "default_discovery_prune_interval_ms")]
    pub discovery_prune_interval_ms: u64,
    #[serde(default = "default_reconnect_scan_window_ms")]
    pub reconnect_scan_window_ms: u64,
    #[serde(default)]
    pub scan_service_uuids: Vec<String>,
    #[serde(default)]
    pub scan_name_prefixes: Vec<String>,
    #[serde(default)]
    pub scan_min_rssi: Option<i16>,

    // Reconnection
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,
    #[serde(default)]
    pub known_device_ids: Vec<DeviceId>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_settings: LogSettings::default(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            staleness_threshold_ms: default_staleness_threshold_ms(),
            ping_timeout_ms: default_ping_timeout_ms(),
            operation_timeout_ms: default_operation_timeout_ms(),
            sweep_interval_ms: default_sweep_interval_ms(),
            discovery_prune_interval_ms: default_discovery_prune_interval_ms(),
            reconnect_scan_window_ms: default_reconnect_scan_window_ms(),
            scan_service_uuids: Vec::new(),
            scan_name_prefixes: Vec::new(),
            scan_min_rssi: None,
            auto_reconnect: true,
            known_device_ids: Vec::new(),
        }
    }
}

fn default_heartbeat_interval_ms() -> u64 {
    2000
}
fn default_staleness_threshold_ms() -> u64 {
    5000
}
fn default_ping_timeout_ms() -> u64 {
    3000
}
fn default_operation_timeout_ms() -> u64 {
    10_000
}
fn default_sweep_interval_ms() -> u64 {
    1000
}
fn default_discovery_prune_interval_ms() -> u64 {
    3000
}
fn default_reconnect_scan_window_ms() -> u64 {
    250
}

impl Settings {
    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
            staleness_threshold: Duration::from_millis(self.staleness_threshold_ms),
            ping_timeout: Duration::from_millis(self.ping_timeout_ms),
            operation_timeout: Duration::from_millis(self.operation_timeout_ms),
            sweep_interval: Duration::from_millis(self.sweep_interval_ms),
            discovery_prune_interval: Duration::from_millis(self.discovery_prune_interval_ms),
            reconnect_scan_window: Duration::from_millis(self.reconnect_scan_window_ms),
            auto_reconnect: self.auto_reconnect,
            known_device_ids: self.known_device_ids.clone(),
        }
    }

    pub fn scan_filter(&self) -> ScanFilter {
        ScanFilter {
            service_uuids: self.scan_service_uuids.clone(),
            name_prefixes: self.scan_name_prefixes.clone(),
            min_rssi: self.scan_min_rssi,
        }
    }
}

/// Runtime parameters of the connection manager
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Period of the heartbeat tick
    pub heartbeat_interval: Duration,
    /// Silence after which a connected device gets pinged
    pub staleness_threshold: Duration,
    /// How long a ping may stay unanswered before the link is declared lost
    pub ping_timeout: Duration,
    /// Upper bound for any caller-visible pending operation
    pub operation_timeout: Duration,
    pub sweep_interval: Duration,
    pub discovery_prune_interval: Duration,
    pub reconnect_scan_window: Duration,
    pub auto_reconnect: bool,
    pub known_device_ids: Vec<DeviceId>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Settings::default().manager_config()
    }
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::with_path(settings_path))
    }

    /// Load from an explicit location, falling back to defaults
    pub fn with_path(settings_path: PathBuf) -> Self {
        let settings = Self::load_from_file(&settings_path).unwrap_or_default();
        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("BleLinkManager");
        fs::create_dir_all(&path)?;
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    pub fn add_known_device(&mut self, id: &DeviceId) -> anyhow::Result<()> {
        if !self.settings.known_device_ids.contains(id) {
            self.settings.known_device_ids.push(id.clone());
            self.save()?;
        }
        Ok(())
    }

    pub fn remove_known_device(&mut self, id: &DeviceId) -> anyhow::Result<()> {
        let before = self.settings.known_device_ids.len();
        self.settings.known_device_ids.retain(|known| known != id);
        if self.settings.known_device_ids.len() != before {
            self.save()?;
        }
        Ok(())
    }
}
