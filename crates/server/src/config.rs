use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use notifier_core::EngineSettings;
use serde::Deserialize;
use tracing::warn;

const SETTINGS_FILE: &str = "notifier.toml";

#[derive(Debug, Deserialize)]
pub struct Settings {
    pub bind_addr: String,
    pub database_url: String,
    pub backend_url: String,
    pub dedup_window_secs: u64,
    pub discovery_timeout_secs: u64,
    pub join_timeout_secs: u64,
    pub max_reconnect_attempts: u32,
    pub constrained_platform: bool,
}

impl Default for Settings {
    fn default() -> Self {
        let engine = EngineSettings::default();
        Self {
            bind_addr: "127.0.0.1:8443".into(),
            database_url: "sqlite://./data/notifier.db".into(),
            backend_url: "http://127.0.0.1:9000".into(),
            dedup_window_secs: engine.dedup_window.as_secs(),
            discovery_timeout_secs: engine.discovery_timeout.as_secs(),
            join_timeout_secs: engine.join_timeout.as_secs(),
            max_reconnect_attempts: engine.max_reconnect_attempts,
            constrained_platform: engine.constrained_platform,
        }
    }
}

impl Settings {
    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            dedup_window: Duration::from_secs(self.dedup_window_secs),
            discovery_timeout: Duration::from_secs(self.discovery_timeout_secs),
            join_timeout: Duration::from_secs(self.join_timeout_secs),
            max_reconnect_attempts: self.max_reconnect_attempts,
            constrained_platform: self.constrained_platform,
            ..EngineSettings::default()
        }
    }

    fn apply(&mut self, key: &str, value: &str) {
        match key {
            "bind_addr" => self.bind_addr = value.to_string(),
            "database_url" => self.database_url = value.to_string(),
            "backend_url" => self.backend_url = value.to_string(),
            "dedup_window_secs" => parse_into(key, value, &mut self.dedup_window_secs),
            "discovery_timeout_secs" => parse_into(key, value, &mut self.discovery_timeout_secs),
            "join_timeout_secs" => parse_into(key, value, &mut self.join_timeout_secs),
            "max_reconnect_attempts" => parse_into(key, value, &mut self.max_reconnect_attempts),
            "constrained_platform" => parse_into(key, value, &mut self.constrained_platform),
            _ => warn!(%key, "ignoring unknown setting"),
        }
    }
}

fn parse_into<T: std::str::FromStr>(key: &str, value: &str, slot: &mut T) {
    match value.trim().parse::<T>() {
        Ok(parsed) => *slot = parsed,
        Err(_) => warn!(%key, %value, "ignoring unparsable setting"),
    }
}

pub fn load_settings() -> Settings {
    let file = fs::read_to_string(SETTINGS_FILE).ok();
    let env: Vec<(String, String)> = std::env::vars().collect();
    settings_from(file.as_deref(), &env)
}

/// Defaults, then the toml file, then `APP__*` environment overrides.
pub fn settings_from(file: Option<&str>, env: &[(String, String)]) -> Settings {
    let mut settings = Settings::default();

    if let Some(raw) = file {
        match toml::from_str::<HashMap<String, toml::Value>>(raw) {
            Ok(file_cfg) => {
                for (key, value) in file_cfg {
                    let value = match value {
                        toml::Value::String(text) => text,
                        other => other.to_string(),
                    };
                    settings.apply(&key, &value);
                }
            }
            Err(err) => warn!(file = SETTINGS_FILE, %err, "ignoring malformed settings file"),
        }
    }

    for (name, value) in env {
        if let Some(key) = name.strip_prefix("APP__") {
            settings.apply(&key.to_ascii_lowercase(), value);
        }
    }
    if let Some((_, value)) = env.iter().find(|(name, _)| name == "DATABASE_URL") {
        if !env.iter().any(|(name, _)| name == "APP__DATABASE_URL") {
            settings.database_url = value.clone();
        }
    }

    settings
}

pub fn prepare_database_url(raw_database_url: &str) -> anyhow::Result<String> {
    let database_url = normalize_database_url(raw_database_url);
    ensure_parent_dir_exists(&database_url)?;
    Ok(database_url)
}

fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return Settings::default().database_url;
    }

    if raw_database_url.starts_with("sqlite::memory:") {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite://") {
        if is_windows_drive_path(path) {
            return format!("sqlite:{}", path.replace('\\', "/"));
        }
        return raw_database_url.to_string();
    }

    if raw_database_url.contains("://") {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        let path = path.replace('\\', "/");
        if is_windows_drive_path(&path) {
            return format!("sqlite:{path}");
        }
        return format!("sqlite://{path}");
    }

    let path = raw_database_url.replace('\\', "/");
    if is_windows_drive_path(&path) {
        return format!("sqlite:{path}");
    }
    format!("sqlite://{path}")
}

fn is_windows_drive_path(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 3
        && bytes[0].is_ascii_alphabetic()
        && bytes[1] == b':'
        && matches!(bytes[2], b'/' | b'\\')
}

fn ensure_parent_dir_exists(database_url: &str) -> anyhow::Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url.starts_with("sqlite::memory:") || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
