use std::fs;

use serde::Deserialize;

const CONFIG_FILE: &str = "server.toml";

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub server_bind: String,
    pub database_url: String,
    pub static_dir: String,
    pub openai_api_key: Option<String>,
    pub openai_model: String,
    pub openai_base_url: String,
    pub llm_timeout_seconds: u64,
    pub max_upload_bytes: usize,
    pub layout_cache_capacity: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_bind: "127.0.0.1:8000".into(),
            database_url: "sqlite://./data/layout_memory.db".into(),
            static_dir: "./static".into(),
            openai_api_key: None,
            openai_model: extraction::llm::DEFAULT_MODEL.into(),
            openai_base_url: extraction::llm::DEFAULT_BASE_URL.into(),
            llm_timeout_seconds: 120,
            max_upload_bytes: 16 * 1024 * 1024,
            layout_cache_capacity: storage::DEFAULT_CACHE_CAPACITY,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    bind_addr: Option<String>,
    database_url: Option<String>,
    static_dir: Option<String>,
    openai_model: Option<String>,
    openai_base_url: Option<String>,
    llm_timeout_seconds: Option<u64>,
    max_upload_bytes: Option<usize>,
    layout_cache_capacity: Option<u64>,
}

pub fn load_settings() -> Settings {
    let file = fs::read_to_string(CONFIG_FILE).ok();
    load_settings_from(file.as_deref(), |key| std::env::var(key).ok())
}

/// Defaults, then `server.toml`, then environment. For each setting the
/// `APP__` variable wins over the plain one.
pub fn load_settings_from(
    file_contents: Option<&str>,
    env: impl Fn(&str) -> Option<String>,
) -> Settings {
    let mut settings = Settings::default();

    if let Some(raw) = file_contents {
        match toml::from_str::<FileSettings>(raw) {
            Ok(file_cfg) => {
                if let Some(v) = file_cfg.bind_addr {
                    settings.server_bind = v;
                }
                if let Some(v) = file_cfg.database_url {
                    settings.database_url = v;
                }
                if let Some(v) = file_cfg.static_dir {
                    settings.static_dir = v;
                }
                if let Some(v) = file_cfg.openai_model {
                    settings.openai_model = v;
                }
                if let Some(v) = file_cfg.openai_base_url {
                    settings.openai_base_url = v;
                }
                if let Some(v) = file_cfg.llm_timeout_seconds {
                    settings.llm_timeout_seconds = v;
                }
                if let Some(v) = file_cfg.max_upload_bytes {
                    settings.max_upload_bytes = v;
                }
                if let Some(v) = file_cfg.layout_cache_capacity {
                    settings.layout_cache_capacity = v;
                }
            }
            Err(error) => {
                tracing::warn!(%error, "ignoring unreadable {CONFIG_FILE}");
            }
        }
    }

    let pick = |plain: Option<&str>, prefixed: &str| -> Option<String> {
        env(prefixed).or_else(|| plain.and_then(&env))
    };

    if let Some(v) = pick(Some("SERVER_BIND"), "APP__BIND_ADDR") {
        settings.server_bind = v;
    }
    if let Some(v) = pick(Some("DATABASE_URL"), "APP__DATABASE_URL") {
        settings.database_url = v;
    }
    if let Some(v) = pick(None, "APP__STATIC_DIR") {
        settings.static_dir = v;
    }
    if let Some(v) = pick(Some("OPENAI_API_KEY"), "APP__OPENAI_API_KEY") {
        settings.openai_api_key = Some(v).filter(|key| !key.trim().is_empty());
    }
    if let Some(v) = pick(Some("OPENAI_MODEL"), "APP__OPENAI_MODEL") {
        settings.openai_model = v;
    }
    if let Some(v) = pick(Some("OPENAI_BASE_URL"), "APP__OPENAI_BASE_URL") {
        settings.openai_base_url = v;
    }
    if let Some(parsed) = pick(None, "APP__LLM_TIMEOUT_SECONDS").and_then(|v| v.parse().ok()) {
        settings.llm_timeout_seconds = parsed;
    }
    if let Some(parsed) = pick(None, "APP__MAX_UPLOAD_BYTES").and_then(|v| v.parse().ok()) {
        settings.max_upload_bytes = parsed;
    }
    if let Some(parsed) = pick(None, "APP__LAYOUT_CACHE_CAPACITY").and_then(|v| v.parse().ok()) {
        settings.layout_cache_capacity = parsed;
    }

    settings
}

pub fn prepare_database_url(raw_database_url: &str) -> anyhow::Result<String> {
    let database_url = normalize_database_url(raw_database_url);
    storage::ensure_sqlite_parent_dir_exists(&database_url)?;
    Ok(database_url)
}

fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return Settings::default().database_url;
    }

    if raw_database_url.starts_with("sqlite::memory:")
        || raw_database_url.starts_with("sqlite://")
        || raw_database_url.contains("://")
    {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        let path = path.replace('\\', "/");
        return format!("sqlite://{path}");
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
