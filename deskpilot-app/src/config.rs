use anyhow::{Context, Result};
use deskpilot_autonomy::OrchestratorConfig;
use deskpilot_bridge::BridgeConfig;
use deskpilot_core::ExecutorMode;
use deskpilot_desktop::DesktopConfig;
use deskpilot_executor::BrowserSettings;
use deskpilot_infra::infra::sqlite_store::RetentionPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_PATH: &str = "deskpilot.yaml";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub bridge: BridgeConfig,
    pub desktop: DesktopConfig,
    pub autonomy: AutonomySection,
    pub store: StoreSection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AutonomySection {
    pub executor: ExecutorMode,
    #[serde(flatten)]
    pub orchestrator: OrchestratorConfig,
    pub browser: BrowserSettings,
}

impl Default for AutonomySection {
    fn default() -> Self {
        Self {
            executor: ExecutorMode::Auto,
            orchestrator: OrchestratorConfig::default(),
            browser: BrowserSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StoreSection {
    pub path: PathBuf,
    #[serde(flatten)]
    pub retention: RetentionPolicy,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/deskpilot.db"),
            retention: RetentionPolicy::default(),
        }
    }
}

/// Accepts 1/0, true/false, yes/no and on/off.
pub fn env_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn env_u64(value: &str) -> Option<u64> {
    value.trim().parse().ok()
}

impl Config {
    /// Read the YAML file if present, otherwise start from defaults, then
    /// apply environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            serde_yaml::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))?
        } else {
            Config::default()
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    /// Apply `DESKPILOT_*` overrides read through `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(url) = lookup("DESKPILOT_WS_URL") {
            self.bridge.url = url;
        }
        if let Some(addr) = lookup("DESKPILOT_LISTEN") {
            self.bridge.listen_addr = addr;
        }
        if let Some(ms) = lookup("DESKPILOT_COMMAND_TIMEOUT_MS").as_deref().and_then(env_u64) {
            self.bridge.command_timeout_ms = ms;
        }
        if let Some(ms) = lookup("DESKPILOT_IDLE_THRESHOLD_MS").as_deref().and_then(env_u64) {
            self.desktop.idle_threshold_ms = ms;
        }
        if let Some(enabled) = lookup("DESKPILOT_IDLE").as_deref().and_then(env_bool) {
            self.desktop.idle_enabled = enabled;
        }
        if let Some(enabled) = lookup("DESKPILOT_SCREENSHOT").as_deref().and_then(env_bool) {
            self.desktop.screenshot_enabled = enabled;
        }
        if let Some(enabled) = lookup("DESKPILOT_ATSPI").as_deref().and_then(env_bool) {
            self.desktop.atspi_enabled = enabled;
        }
        if let Some(mode) = lookup("DESKPILOT_EXECUTOR") {
            self.autonomy.executor = mode
                .parse()
                .map_err(|e: String| anyhow::anyhow!("DESKPILOT_EXECUTOR: {}", e))?;
        }
        if let Some(max) = lookup("DESKPILOT_MAX_ITERATIONS").as_deref().and_then(env_u64) {
            self.autonomy.orchestrator.max_iterations = u32::try_from(max).unwrap_or(u32::MAX);
        }
        if let Some(headless) = lookup("DESKPILOT_BROWSER_HEADLESS").as_deref().and_then(env_bool) {
            self.autonomy.browser.headless = headless;
        }
        if let Some(path) = lookup("DESKPILOT_DB") {
            self.store.path = PathBuf::from(path);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.bridge.heartbeat_timeout_ms <= self.bridge.heartbeat_interval_ms {
            anyhow::bail!("bridge.heartbeat_timeout_ms must exceed bridge.heartbeat_interval_ms");
        }
        if !(0.0..=1.0).contains(&self.autonomy.orchestrator.min_confidence) {
            anyhow::bail!("autonomy.min_confidence must be between 0 and 1");
        }
        if !(1..=100).contains(&self.desktop.jpeg_quality) {
            anyhow::bail!("desktop.jpeg_quality must be between 1 and 100");
        }
        if self.store.path.as_os_str().is_empty() {
            anyhow::bail!("store.path cannot be empty");
        }
        Ok(())
    }
}
