use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::crawl::DEFAULT_WEEK_OFFSETS;
use crate::query::AcademicCalendar;

pub const DEFAULT_API_URL: &str = "https://abiturient-api.vlsu.ru";
pub const DEFAULT_USER_AGENT: &str = "schedcrawl/0.1";
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_PAUSE_MS: u64 = 300;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct AppConfig {
    #[serde(default)]
    pub api: ApiSection,
    #[serde(default)]
    pub crawl: CrawlSection,
    #[serde(default)]
    pub calendar: CalendarSection,
    #[serde(default)]
    pub storage: StorageSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct ApiSection {
    pub base_url: Option<String>,
    pub user_agent: Option<String>,
    pub timeout_ms: Option<u64>,
    pub pause_ms: Option<u64>,
    pub max_attempts: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct CrawlSection {
    /// Study form codes: 0 full-time, 1 part-time, 2 evening.
    pub forms: Option<Vec<i64>>,
    pub weeks: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct CalendarSection {
    /// `YYYY-MM-DD`
    pub semester_start: Option<String>,
    pub parity_block_weeks: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct StorageSection {
    pub db_path: Option<String>,
}

impl AppConfig {
    /// Resolve the schedule API base URL: env SCHEDULE_API_URL > config > default.
    pub fn api_url(&self) -> String {
        env_value("SCHEDULE_API_URL")
            .or_else(|| self.api.base_url.clone())
            .unwrap_or_else(|| DEFAULT_API_URL.to_string())
    }

    /// Resolve user agent: env SCHEDULE_USER_AGENT > config > DEFAULT_USER_AGENT.
    pub fn user_agent(&self) -> String {
        env_value("SCHEDULE_USER_AGENT")
            .or_else(|| self.api.user_agent.clone())
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string())
    }

    pub fn timeout_ms(&self) -> u64 {
        numeric_override("SCHEDULE_HTTP_TIMEOUT_MS", self.api.timeout_ms, DEFAULT_TIMEOUT_MS)
    }

    pub fn pause_ms(&self) -> u64 {
        numeric_override("SCHEDULE_PAUSE_MS", self.api.pause_ms, DEFAULT_PAUSE_MS)
    }

    pub fn max_attempts(&self) -> u32 {
        numeric_override(
            "SCHEDULE_HTTP_ATTEMPTS",
            self.api.max_attempts,
            DEFAULT_MAX_ATTEMPTS,
        )
    }

    pub fn form_codes(&self) -> Vec<i64> {
        self.crawl
            .forms
            .clone()
            .unwrap_or_else(|| vec![0, 1, 2])
    }

    pub fn week_offsets(&self) -> Vec<u8> {
        self.crawl
            .weeks
            .clone()
            .unwrap_or_else(|| DEFAULT_WEEK_OFFSETS.to_vec())
    }

    pub fn calendar(&self) -> Result<AcademicCalendar> {
        let mut calendar = AcademicCalendar::default();
        if let Some(raw) = self.calendar.semester_start.as_deref() {
            calendar.semester_start = NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
                .with_context(|| format!("invalid calendar.semester_start {raw:?}"))?;
        }
        if let Some(weeks) = self.calendar.parity_block_weeks {
            if weeks == 0 {
                bail!("calendar.parity_block_weeks must be at least 1");
            }
            calendar.parity_block_weeks = weeks;
        }
        Ok(calendar)
    }
}

/// Load and parse an AppConfig from a TOML file. Returns default if file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<AppConfig> {
    if !config_path.exists() {
        return Ok(AppConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: AppConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

fn env_value(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn numeric_override<T: std::str::FromStr + Copy>(key: &str, configured: Option<T>, default: T) -> T {
    resolve_numeric(env_value(key).as_deref(), configured, default)
}

/// Unparseable env values fall through to the config value.
fn resolve_numeric<T: std::str::FromStr + Copy>(
    env: Option<&str>,
    configured: Option<T>,
    default: T,
) -> T {
    env.and_then(|value| value.parse::<T>().ok())
        .or(configured)
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn default_config_has_no_overrides() {
        let config = AppConfig::default();
        assert!(config.api.base_url.is_none());
        assert!(config.crawl.forms.is_none());
        assert_eq!(config.form_codes(), vec![0, 1, 2]);
        assert_eq!(config.week_offsets(), vec![1, 2]);
    }

    #[test]
    fn load_config_returns_default_for_missing_file() {
        let config = load_config(Path::new("/nonexistent/schedcrawl.toml")).expect("load config");
        assert_eq!(config, AppConfig::default());
    }

    #[test]
    fn load_config_parses_all_sections() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("schedcrawl.toml");
        fs::write(
            &config_path,
            r#"
[api]
base_url = "https://schedule.example.org"
user_agent = "test-agent/1.0"
timeout_ms = 5000
pause_ms = 1000
max_attempts = 5

[crawl]
forms = [0, 2]
weeks = [0]

[calendar]
semester_start = "2026-02-09"
parity_block_weeks = 1

[storage]
db_path = "data/schedule.db"
"#,
        )
        .expect("write config");

        let config = load_config(&config_path).expect("load config");
        assert_eq!(
            config.api.base_url.as_deref(),
            Some("https://schedule.example.org")
        );
        assert_eq!(config.api.timeout_ms, Some(5000));
        assert_eq!(config.api.max_attempts, Some(5));
        assert_eq!(config.form_codes(), vec![0, 2]);
        assert_eq!(config.week_offsets(), vec![0]);
        assert_eq!(config.storage.db_path.as_deref(), Some("data/schedule.db"));

        let calendar = config.calendar().expect("calendar");
        assert_eq!(
            calendar.semester_start,
            NaiveDate::from_ymd_opt(2026, 2, 9).expect("date")
        );
        assert_eq!(calendar.parity_block_weeks, 1);
    }

    #[test]
    fn load_config_tolerates_partial_toml() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("schedcrawl.toml");
        fs::write(&config_path, "[storage]\ndb_path = \"/tmp/x.db\"\n").expect("write config");

        let config = load_config(&config_path).expect("load config");
        assert!(config.api.base_url.is_none());
        assert_eq!(config.calendar().expect("calendar"), AcademicCalendar::default());
    }

    #[test]
    fn load_config_returns_error_for_invalid_toml() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("schedcrawl.toml");
        fs::write(&config_path, "[api\nbase_url = \"oops\"").expect("write config");
        let error = load_config(&config_path).expect_err("must fail");
        assert!(error.to_string().contains("failed to parse"));
    }

    #[test]
    fn calendar_rejects_bad_values() {
        let mut config = AppConfig::default();
        config.calendar.semester_start = Some("first of september".to_string());
        assert!(config.calendar().is_err());

        let mut config = AppConfig::default();
        config.calendar.parity_block_weeks = Some(0);
        assert!(config.calendar().is_err());
    }

    #[test]
    fn numeric_resolution_prefers_env_then_config() {
        assert_eq!(resolve_numeric(Some("750"), Some(100u64), 300), 750);
        assert_eq!(resolve_numeric(Some("soon"), Some(100u64), 300), 100);
        assert_eq!(resolve_numeric(None, None, 300u64), 300);
    }
}
