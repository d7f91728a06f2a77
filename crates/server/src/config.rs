use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::Context;
use shared::domain::DEFAULT_NSFW_THRESHOLD;
use tracing::warn;
use url::Url;

const SETTINGS_FILE: &str = "server.toml";
const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: &str = "5000";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppEnvironment {
    Development,
    Production,
}

impl AppEnvironment {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Some(Self::Development),
            "production" | "prod" => Some(Self::Production),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketNames {
    pub all_images: String,
    pub nsfw_reported: String,
    pub sfw_reported: String,
}

impl Default for BucketNames {
    fn default() -> Self {
        Self {
            all_images: "allimages".into(),
            nsfw_reported: "nsfwreported".into(),
            sfw_reported: "sfwreported".into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub server_bind: String,
    pub database_url: String,
    pub environment: AppEnvironment,
    pub prediction_api_url: String,
    pub prediction_upload_api_url: Option<String>,
    pub nsfw_threshold: f64,
    pub request_timeout_secs: u64,
    pub archive_enabled: bool,
    pub buckets: BucketNames,
    pub max_upload_bytes: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_bind: format!("{DEFAULT_HOST}:{DEFAULT_PORT}"),
            database_url: "sqlite://./data/server.db".into(),
            environment: AppEnvironment::Development,
            prediction_api_url: "https://nsfw-detection.todos.monster/predict".into(),
            prediction_upload_api_url: None,
            nsfw_threshold: DEFAULT_NSFW_THRESHOLD,
            request_timeout_secs: 10,
            archive_enabled: true,
            buckets: BucketNames::default(),
            max_upload_bytes: 8 * 1024 * 1024,
        }
    }
}

impl Settings {
    pub fn is_production(&self) -> bool {
        self.environment == AppEnvironment::Production
    }

    /// Explicit upload endpoint, or the predict endpoint with its last path
    /// segment replaced by `predict-upload`.
    pub fn upload_api_url(&self) -> String {
        if let Some(url) = &self.prediction_upload_api_url {
            return url.clone();
        }
        derive_upload_url(&self.prediction_api_url)
    }
}

pub fn load_settings() -> Settings {
    let file = fs::read_to_string(SETTINGS_FILE).ok();
    load_settings_from(file.as_deref(), |key| std::env::var(key).ok())
}

/// Defaults, then the flat `server.toml` table, then environment variables.
/// For every setting the `APP__` spelling wins over the plain one.
pub fn load_settings_from(
    file_contents: Option<&str>,
    env: impl Fn(&str) -> Option<String>,
) -> Settings {
    let mut settings = Settings::default();

    if let Some(raw) = file_contents {
        match toml::from_str::<toml::Table>(raw) {
            Ok(table) => {
                let get = |key: &str| {
                    table.get(key).map(|value| match value {
                        toml::Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                };
                apply(&mut settings, |key| get(key));
            }
            Err(error) => warn!(%error, file = SETTINGS_FILE, "ignoring unreadable settings file"),
        }
    }

    let host = lookup(&env, &["HOST", "APP__HOST"]);
    let port = lookup(&env, &["PORT", "APP__PORT"]);
    if host.is_some() || port.is_some() {
        settings.server_bind = format!(
            "{}:{}",
            host.as_deref().unwrap_or(DEFAULT_HOST),
            port.as_deref().unwrap_or(DEFAULT_PORT)
        );
    }

    apply(&mut settings, |key| {
        let upper = key.to_ascii_uppercase();
        let aliases: &[&str] = match key {
            "bind_addr" => &["SERVER_BIND"],
            "environment" => &["FLASK_ENV", "APP_ENV"],
            "request_timeout" => &["REQUEST_TIMEOUT"],
            "archive_enabled" => &["S3_UPLOAD_ENABLED", "ARCHIVE_ENABLED"],
            "bucket_all_images" => &["S3_BUCKET_ALL_IMAGES", "BUCKET_ALL_IMAGES"],
            "bucket_nsfw_reported" => &["S3_BUCKET_NSFW_REPORTED", "BUCKET_NSFW_REPORTED"],
            "bucket_sfw_reported" => &["S3_BUCKET_SFW_REPORTED", "BUCKET_SFW_REPORTED"],
            _ => &[],
        };
        let mut keys: Vec<String> = aliases.iter().map(|alias| alias.to_string()).collect();
        if aliases.is_empty() {
            keys.push(upper.clone());
        }
        keys.push(format!("APP__{upper}"));
        let keys: Vec<&str> = keys.iter().map(String::as_str).collect();
        lookup(&env, &keys)
    });

    settings
}

fn lookup(env: &impl Fn(&str) -> Option<String>, keys: &[&str]) -> Option<String> {
    keys.iter().rev().find_map(|key| env(key))
}

fn apply(settings: &mut Settings, source: impl Fn(&str) -> Option<String>) {
    if let Some(v) = source("bind_addr") {
        settings.server_bind = v;
    }
    if let Some(v) = source("database_url") {
        settings.database_url = v;
    }
    if let Some(v) = source("environment") {
        match AppEnvironment::parse(&v) {
            Some(environment) => settings.environment = environment,
            None => warn!(value = %v, "unknown environment, keeping {:?}", settings.environment),
        }
    }
    if let Some(v) = source("prediction_api_url") {
        settings.prediction_api_url = v;
    }
    if let Some(v) = source("prediction_upload_api_url") {
        settings.prediction_upload_api_url = Some(v).filter(|v| !v.trim().is_empty());
    }
    if let Some(v) = source("nsfw_threshold") {
        match v.trim().parse::<f64>() {
            Ok(parsed) if (0.0..=1.0).contains(&parsed) => settings.nsfw_threshold = parsed,
            _ => warn!(value = %v, "nsfw_threshold must be a number in [0, 1]"),
        }
    }
    if let Some(v) = source("request_timeout") {
        match v.trim().parse::<u64>() {
            Ok(parsed) if parsed > 0 => settings.request_timeout_secs = parsed,
            _ => warn!(value = %v, "request_timeout must be a positive number of seconds"),
        }
    }
    if let Some(v) = source("archive_enabled") {
        settings.archive_enabled = v.trim().eq_ignore_ascii_case("true");
    }
    if let Some(v) = source("bucket_all_images") {
        settings.buckets.all_images = v;
    }
    if let Some(v) = source("bucket_nsfw_reported") {
        settings.buckets.nsfw_reported = v;
    }
    if let Some(v) = source("bucket_sfw_reported") {
        settings.buckets.sfw_reported = v;
    }
    if let Some(v) = source("max_upload_bytes") {
        match v.trim().parse::<usize>() {
            Ok(parsed) if parsed > 0 => settings.max_upload_bytes = parsed,
            _ => warn!(value = %v, "max_upload_bytes must be a positive integer"),
        }
    }
}

fn derive_upload_url(predict_url: &str) -> String {
    let Ok(mut url) = Url::parse(predict_url) else {
        return format!("{}-upload", predict_url.trim_end_matches('/'));
    };
    let replaced = match url.path_segments_mut() {
        Ok(mut segments) => {
            segments.pop_if_empty().pop().push("predict-upload");
            true
        }
        Err(()) => false,
    };
    if !replaced {
        return format!("{}-upload", predict_url.trim_end_matches('/'));
    }
    url.to_string()
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
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
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
