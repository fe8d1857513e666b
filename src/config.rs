use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

use crate::error::Quack2TexError;

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct Config {
    #[serde(default)]
    pub menu: MenuConfig,
    #[serde(default)]
    pub workers: WorkersConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub ui: UiConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MenuConfig {
    #[serde(default = "default_root_icon")]
    pub root_icon: String,
    #[serde(default = "default_fallback_icon")]
    pub fallback_icon: String,
    #[serde(default = "default_root_size")]
    pub root_size: f64,
    #[serde(default = "default_item_size")]
    pub item_size: f64,
    #[serde(default = "default_distance")]
    pub distance_to_center: f64,
    #[serde(default)]
    pub start_angle: f64,
    #[serde(default = "default_end_angle")]
    pub end_angle: f64,
    #[serde(default = "default_animation_ms")]
    pub animation_ms: u64,
    #[serde(default = "default_center")]
    pub center_x: f64,
    #[serde(default = "default_center")]
    pub center_y: f64,
}

fn default_root_icon() -> String {
    "icons/rubber-duck.png".to_string()
}

fn default_fallback_icon() -> String {
    "icons/menu-item.png".to_string()
}

fn default_root_size() -> f64 {
    64.0
}

fn default_item_size() -> f64 {
    32.0
}

fn default_distance() -> f64 {
    100.0
}

fn default_end_angle() -> f64 {
    360.0
}

fn default_animation_ms() -> u64 {
    500
}

fn default_center() -> f64 {
    200.0
}

impl Default for MenuConfig {
    fn default() -> Self {
        Self {
            root_icon: default_root_icon(),
            fallback_icon: default_fallback_icon(),
            root_size: default_root_size(),
            item_size: default_item_size(),
            distance_to_center: default_distance(),
            start_angle: 0.0,
            end_angle: default_end_angle(),
            animation_ms: default_animation_ms(),
            center_x: default_center(),
            center_y: default_center(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkersConfig {
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
}

fn default_pool_size() -> usize {
    num_cpus::get().clamp(1, 8)
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LlmConfig {
    #[serde(default = "default_model")]
    pub default_model: String,
    #[serde(default)]
    pub google_api_key: String,
    #[serde(default)]
    pub openai_api_key: String,
    #[serde(default = "default_openai_endpoint")]
    pub openai_endpoint: String,
    #[serde(default = "default_ollama_endpoint")]
    pub ollama_endpoint: String,
    #[serde(default = "default_llm_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

fn default_model() -> String {
    "models/gemini-1.5-flash-latest".to_string()
}

fn default_openai_endpoint() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_ollama_endpoint() -> String {
    "http://localhost:11434".to_string()
}

fn default_llm_timeout_ms() -> u64 {
    60000
}

fn default_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    2000
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            default_model: default_model(),
            google_api_key: String::new(),
            openai_api_key: String::new(),
            openai_endpoint: default_openai_endpoint(),
            ollama_endpoint: default_ollama_endpoint(),
            timeout_ms: default_llm_timeout_ms(),
            retries: default_retries(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
    #[serde(default = "default_max_prompts")]
    pub max_prompts: u32,
}

pub fn data_dir_fallback() -> PathBuf {
    dirs::data_dir().unwrap_or_else(|| {
        // Fall back to $HOME/.local/share instead of unexpandable tilde
        std::env::var("HOME")
            .map(|h| PathBuf::from(h).join(".local/share"))
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    })
}

fn default_db_path() -> String {
    data_dir_fallback()
        .join("quack2tex/quack2tex.db")
        .to_string_lossy()
        .to_string()
}

fn default_max_prompts() -> u32 {
    500
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            max_prompts: default_max_prompts(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CaptureConfig {
    #[serde(default = "default_screen_tool")]
    pub screen_tool: String,
    #[serde(default = "default_region_tool")]
    pub region_tool: String,
}

fn default_screen_tool() -> String {
    "grim".to_string()
}

fn default_region_tool() -> String {
    "slurp".to_string()
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            screen_tool: default_screen_tool(),
            region_tool: default_region_tool(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UiConfig {
    #[serde(default = "default_true")]
    pub show_notifications: bool,
    #[serde(default = "default_notification_timeout")]
    pub notification_timeout_ms: u64,
}

fn default_true() -> bool {
    true
}

fn default_notification_timeout() -> u64 {
    5000
}

impl Default for UiConfig {
    fn default() -> Self {
        Self {
            show_notifications: true,
            notification_timeout_ms: default_notification_timeout(),
        }
    }
}

impl Config {
    pub async fn load(path: &Path) -> Result<Self> {
        Self::validate_config_path(path)?;

        if !path.exists() {
            debug!("Config file not found at {:?}, creating default", path);
            let config = Self::default();
            config.save(path).await?;
            return Ok(config);
        }

        let content = fs::read_to_string(path).await?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;

        Ok(config)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        self.validate()?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(path, content).await?;
        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let menu = &self.menu;
        if menu.root_size <= 0.0 || menu.item_size <= 0.0 {
            return Err(Quack2TexError::Config("icon sizes must be greater than 0".to_string()).into());
        }
        if menu.distance_to_center < 0.0 {
            return Err(Quack2TexError::Config(
                "distance_to_center cannot be negative".to_string(),
            )
            .into());
        }
        let span = menu.end_angle - menu.start_angle;
        if span <= 0.0 || span > 360.0 {
            return Err(Quack2TexError::Config(
                "menu span (end_angle - start_angle) must be within 1..=360 degrees".to_string(),
            )
            .into());
        }
        if menu.animation_ms > 10000 {
            return Err(Quack2TexError::Config(
                "animation_ms cannot exceed 10000ms".to_string(),
            )
            .into());
        }

        if self.workers.pool_size == 0 || self.workers.pool_size > 32 {
            return Err(Quack2TexError::Config(
                "pool_size must be between 1 and 32".to_string(),
            )
            .into());
        }

        if self.llm.default_model.trim().is_empty() {
            return Err(Quack2TexError::Config("default_model cannot be empty".to_string()).into());
        }
        if self.llm.timeout_ms < 1000 || self.llm.timeout_ms > 120000 {
            return Err(Quack2TexError::Config(
                "LLM timeout_ms must be between 1000 and 120000".to_string(),
            )
            .into());
        }
        if self.llm.retries == 0 {
            return Err(Quack2TexError::Config("retries must be at least 1".to_string()).into());
        }

        if self.storage.db_path.contains("..") {
            return Err(Quack2TexError::Config(
                "db_path cannot contain path traversal sequences".to_string(),
            )
            .into());
        }
        if self.storage.max_prompts == 0 {
            return Err(Quack2TexError::Config(
                "max_prompts must be greater than 0".to_string(),
            )
            .into());
        }

        Ok(())
    }

    fn validate_config_path(path: &Path) -> Result<()> {
        let path_str = path.to_string_lossy();
        if path_str.contains("..") {
            return Err(Quack2TexError::Config(
                "Config path cannot contain path traversal sequences".to_string(),
            )
            .into());
        }

        Ok(())
    }
}
