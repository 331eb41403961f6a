use crate::types::*;
use bevy::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

pub const API_KEY_ENV: &str = "FIREBASE_API_KEY";
pub const CUSTOM_TOKEN_ENV: &str = "FIREBASE_CUSTOM_TOKEN";

#[derive(Debug, Clone, Serialize, Deserialize, Resource)]
pub struct AppConfig {
    pub backend: BackendConfig,
    pub session: SessionConfig,
    pub board: BoardConfig,
    pub ui: UiConfig,
    pub debug: DebugConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Firestore,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub kind: BackendKind,
    pub api_key: String,
    pub project_id: String,
    pub app_id: String,
    /// Token for `signInWithCustomToken`. Empty means anonymous sign-up.
    pub custom_token: String,
    pub poll_interval_ms: u64,
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub session_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoardConfig {
    pub width: u32,
    pub height: u32,
    pub cell_size: f32,
    pub viewport_width: f32,
    pub viewport_height: f32,
    pub move_duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UiConfig {
    pub font_size: f32,
    pub show_debug_panel: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebugConfig {
    pub log_level: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            backend: BackendConfig {
                kind: BackendKind::Memory,
                api_key: String::new(),
                project_id: String::new(),
                app_id: "default-app-id".to_string(),
                custom_token: String::new(),
                poll_interval_ms: 500,
                timeout_seconds: 10,
            },
            session: SessionConfig {
                session_id: DEFAULT_SESSION_ID.to_string(),
            },
            board: BoardConfig {
                width: DEFAULT_BOARD_WIDTH,
                height: DEFAULT_BOARD_HEIGHT,
                cell_size: DEFAULT_CELL_SIZE,
                viewport_width: 800.0,
                viewport_height: 600.0,
                move_duration_ms: 300,
            },
            ui: UiConfig {
                font_size: 16.0,
                show_debug_panel: false,
            },
            debug: DebugConfig {
                log_level: "info".to_string(),
            },
        }
    }
}

impl AppConfig {
    pub fn load_or_create(path: &Path) -> anyhow::Result<Self> {
        let mut config = if path.exists() {
            let content = fs::read_to_string(path)?;
            toml::from_str(&content)?
        } else {
            let config = AppConfig::default();
            config.save(path)?;
            config
        };
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, content)?;
        Ok(())
    }

    /// Secrets from the environment take precedence over the file.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(key) = lookup(API_KEY_ENV).filter(|v| !v.is_empty()) {
            self.backend.api_key = key;
        }
        if let Some(token) = lookup(CUSTOM_TOKEN_ENV).filter(|v| !v.is_empty()) {
            self.backend.custom_token = token;
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.board.width == 0 || self.board.height == 0 {
            anyhow::bail!("board must be at least 1x1 tiles");
        }
        if self.board.cell_size <= 0.0 {
            anyhow::bail!("board.cell_size must be positive");
        }
        if self.session.session_id.is_empty() {
            anyhow::bail!("session.session_id must not be empty");
        }
        if self.backend.kind == BackendKind::Firestore
            && (self.backend.api_key.is_empty() || self.backend.project_id.is_empty())
        {
            anyhow::bail!(
                "Firestore backend needs backend.project_id and an API key. \
                Set backend.api_key in config.toml or add {}=your-key to .env",
                API_KEY_ENV
            );
        }
        Ok(())
    }

    pub fn viewport(&self) -> Vec2 {
        Vec2::new(self.board.viewport_width, self.board.viewport_height)
    }
}
