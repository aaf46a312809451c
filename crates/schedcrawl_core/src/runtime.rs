use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::config::AppConfig;

pub const CONFIG_FILENAME: &str = "schedcrawl.toml";
pub const DEFAULT_DB_RELATIVE_PATH: &str = "data/schedule.db";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueSource {
    Flag,
    Env,
    Config,
    Default,
}

impl ValueSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Flag => "flag",
            Self::Env => "env",
            Self::Config => "config",
            Self::Default => "default",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PathOverrides {
    pub db: Option<PathBuf>,
    pub config: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ResolutionContext {
    pub cwd: PathBuf,
}

impl ResolutionContext {
    pub fn from_process() -> Result<Self> {
        let cwd = env::current_dir().context("failed to read current directory")?;
        Ok(Self { cwd })
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedPaths {
    pub db_path: PathBuf,
    pub config_path: PathBuf,
    pub db_source: ValueSource,
    pub config_source: ValueSource,
}

#[derive(Debug, Clone)]
pub struct RuntimeStatus {
    pub db_exists: bool,
    pub db_size_bytes: Option<u64>,
    pub config_exists: bool,
    pub warnings: Vec<String>,
}

impl ResolvedPaths {
    pub fn diagnostics(&self) -> String {
        format!(
            "db_path={} ({})\nconfig_path={} ({})",
            normalize_for_display(&self.db_path),
            self.db_source.as_str(),
            normalize_for_display(&self.config_path),
            self.config_source.as_str(),
        )
    }
}

pub fn inspect_runtime(paths: &ResolvedPaths) -> Result<RuntimeStatus> {
    let config_exists = paths.config_path.exists();
    let db_exists = paths.db_path.exists();
    let db_size_bytes = if db_exists {
        let metadata = fs::metadata(&paths.db_path)
            .with_context(|| format!("failed to inspect {}", paths.db_path.display()))?;
        Some(metadata.len())
    } else {
        None
    };

    let mut warnings = Vec::new();
    if !db_exists {
        warnings.push("schedule database does not exist yet; run `schedcrawl crawl`".to_string());
    }
    if !config_exists && paths.config_source != ValueSource::Default {
        warnings.push(format!(
            "config file {} is missing; using defaults",
            normalize_for_display(&paths.config_path)
        ));
    }

    Ok(RuntimeStatus {
        db_exists,
        db_size_bytes,
        config_exists,
        warnings,
    })
}

/// Config path: flag > env SCHEDCRAWL_CONFIG > `./schedcrawl.toml`.
pub fn resolve_config_path(
    context: &ResolutionContext,
    overrides: &PathOverrides,
) -> (PathBuf, ValueSource) {
    resolve_config_path_with_lookup(context, overrides, &|key| env::var(key).ok())
}

/// Database path: flag > env SCHEDCRAWL_DB > `[storage] db_path` > `./data/schedule.db`.
pub fn resolve_paths(
    context: &ResolutionContext,
    overrides: &PathOverrides,
    config: &AppConfig,
) -> ResolvedPaths {
    resolve_paths_with_lookup(context, overrides, config, |key| env::var(key).ok())
}

fn resolve_config_path_with_lookup<F>(
    context: &ResolutionContext,
    overrides: &PathOverrides,
    lookup_env: &F,
) -> (PathBuf, ValueSource)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(path) = overrides.config.as_deref() {
        (absolutize(path, &context.cwd), ValueSource::Flag)
    } else if let Some(value) = non_blank(lookup_env("SCHEDCRAWL_CONFIG")) {
        (absolutize(Path::new(&value), &context.cwd), ValueSource::Env)
    } else {
        (context.cwd.join(CONFIG_FILENAME), ValueSource::Default)
    }
}

fn resolve_paths_with_lookup<F>(
    context: &ResolutionContext,
    overrides: &PathOverrides,
    config: &AppConfig,
    lookup_env: F,
) -> ResolvedPaths
where
    F: Fn(&str) -> Option<String>,
{
    let (config_path, config_source) =
        resolve_config_path_with_lookup(context, overrides, &lookup_env);

    let (db_path, db_source) = if let Some(path) = overrides.db.as_deref() {
        (absolutize(path, &context.cwd), ValueSource::Flag)
    } else if let Some(value) = non_blank(lookup_env("SCHEDCRAWL_DB")) {
        (absolutize(Path::new(&value), &context.cwd), ValueSource::Env)
    } else if let Some(value) = non_blank(config.storage.db_path.clone()) {
        // Relative to the config file, not the working directory.
        let base = config_path.parent().unwrap_or(&context.cwd);
        (absolutize(Path::new(&value), base), ValueSource::Config)
    } else {
        (
            context.cwd.join(DEFAULT_DB_RELATIVE_PATH),
            ValueSource::Default,
        )
    };

    ResolvedPaths {
        db_path,
        config_path,
        db_source,
        config_source,
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

pub fn normalize_for_display(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}
