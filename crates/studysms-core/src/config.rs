//! studysms configuration system.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{Result, StudySmsError};

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StudySmsConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub twilio: TwilioConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub inbound: InboundConfig,
}

impl StudySmsConfig {
    /// Load config from `STUDYSMS_CONFIG` or the default path (~/.studysms/config.toml).
    pub fn load() -> Result<Self> {
        let path = std::env::var("STUDYSMS_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| Self::default_path());
        if path.exists() {
            Self::load_from(&path)
        } else {
            tracing::debug!("No config at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| StudySmsError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| StudySmsError::Config(format!("Failed to parse config: {e}")))?;
        Ok(config)
    }

    /// Save config to the given path.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| StudySmsError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the studysms home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".studysms")
    }

    /// Overlay Twilio credentials from the environment (`TWILIO_ACCOUNT_SID`,
    /// `TWILIO_AUTH_TOKEN`, `TWILIO_FROM_NUMBER`).
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Overlay credentials from any key lookup; empty values are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(sid) = get("TWILIO_ACCOUNT_SID") {
            self.twilio.account_sid = sid;
        }
        if let Some(token) = get("TWILIO_AUTH_TOKEN") {
            self.twilio.auth_token = token;
        }
        if let Some(number) = get("TWILIO_FROM_NUMBER") {
            self.twilio.from_number = number;
        }
    }
}

/// SQLite location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String { "~/.studysms/participants.db".into() }

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { path: default_db_path() }
    }
}

impl DatabaseConfig {
    /// Tilde-expanded database path.
    pub fn resolved_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.path).to_string())
    }

    /// Lock file guarding dispatch runs against this database.
    pub fn lock_path(&self) -> PathBuf {
        let mut path = self.resolved_path().into_os_string();
        path.push(".lock");
        PathBuf::from(path)
    }
}

/// Twilio REST credentials and call limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TwilioConfig {
    #[serde(default)]
    pub account_sid: String,
    #[serde(default)]
    pub auth_token: String,
    /// Number texts are sent from.
    #[serde(default)]
    pub from_number: String,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Total attempts per message, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_api_base() -> String { "https://api.twilio.com".into() }
fn default_timeout_secs() -> u64 { 15 }
fn default_max_attempts() -> u32 { 2 }

impl Default for TwilioConfig {
    fn default() -> Self {
        Self {
            account_sid: String::new(),
            auth_token: String::new(),
            from_number: String::new(),
            api_base: default_api_base(),
            timeout_secs: default_timeout_secs(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl TwilioConfig {
    pub fn is_configured(&self) -> bool {
        !self.account_sid.is_empty() && !self.auth_token.is_empty() && !self.from_number.is_empty()
    }
}

/// Calendar settings for the schedule engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// IANA zone used to decide what "today" is.
    #[serde(default = "default_timezone")]
    pub timezone: String,
    /// A lock file older than this is treated as abandoned.
    #[serde(default = "default_stale_lock_secs")]
    pub stale_lock_secs: u64,
}

fn default_timezone() -> String { "US/Pacific".into() }
fn default_stale_lock_secs() -> u64 { 3600 }

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            timezone: default_timezone(),
            stale_lock_secs: default_stale_lock_secs(),
        }
    }
}

impl ScheduleConfig {
    pub fn tz(&self) -> Result<chrono_tz::Tz> {
        self.timezone
            .parse::<chrono_tz::Tz>()
            .map_err(|e| StudySmsError::Config(format!("Unknown timezone '{}': {e}", self.timezone)))
    }

    /// Today's calendar date in the study time zone.
    pub fn today(&self) -> Result<chrono::NaiveDate> {
        let tz = self.tz()?;
        Ok(chrono::Utc::now().with_timezone(&tz).date_naive())
    }
}

/// Gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
    /// Upload size cap for bulk import files.
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

fn default_port() -> u16 { 5000 }
fn default_host() -> String { "127.0.0.1".into() }
fn default_max_upload_bytes() -> usize { 5 * 1024 * 1024 }

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

/// Staff accounts for HTTP basic auth.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AuthConfig {
    /// username => password. Usernames are matched title-cased.
    #[serde(default)]
    pub users: BTreeMap<String, String>,
}

impl AuthConfig {
    pub fn verify(&self, username: &str, password: &str) -> bool {
        if username.is_empty() || password.is_empty() {
            return false;
        }
        let username = crate::types::normalize_name(username);
        self.users
            .iter()
            .any(|(user, pw)| crate::types::normalize_name(user) == username && pw == password)
    }
}

/// Auto-reply for inbound texts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundConfig {
    #[serde(default = "default_reply")]
    pub reply: String,
}

fn default_reply() -> String {
    "Give us a call at (650) 223-5997 if you have any questions!".into()
}

impl Default for InboundConfig {
    fn default() -> Self {
        Self { reply: default_reply() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = StudySmsConfig::default();
        assert_eq!(config.schedule.timezone, "US/Pacific");
        assert_eq!(config.twilio.api_base, "https://api.twilio.com");
        assert_eq!(config.twilio.max_attempts, 2);
        assert!(!config.twilio.is_configured());
        assert!(config.auth.users.is_empty());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            [database]
            path = "/tmp/study.db"

            [twilio]
            account_sid = "AC123"
            auth_token = "secret"
            from_number = "+15550001111"

            [auth.users]
            Ian = "pw1"
            sydney = "pw2"
        "#;

        let config: StudySmsConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.database.resolved_path(), PathBuf::from("/tmp/study.db"));
        assert_eq!(config.database.lock_path(), PathBuf::from("/tmp/study.db.lock"));
        assert!(config.twilio.is_configured());
        assert_eq!(config.twilio.timeout_secs, 15);
        assert!(config.auth.verify("ian", "pw1"));
        assert!(config.auth.verify("Sydney", "pw2"));
        assert!(!config.auth.verify("Ian", "pw2"));
        assert!(!config.auth.verify("", ""));
    }

    #[test]
    fn test_config_missing_fields_use_defaults() {
        let config: StudySmsConfig = toml::from_str("").unwrap();
        assert_eq!(config.gateway.port, 5000);
        assert_eq!(config.inbound.reply, default_reply());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("TWILIO_ACCOUNT_SID", "AC999"),
            ("TWILIO_AUTH_TOKEN", ""),
            ("TWILIO_FROM_NUMBER", "+15552223333"),
        ]
        .into_iter()
        .collect();

        let mut config = StudySmsConfig::default();
        config.twilio.auth_token = "kept".into();
        config.apply_overrides(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.twilio.account_sid, "AC999");
        assert_eq!(config.twilio.auth_token, "kept");
        assert_eq!(config.twilio.from_number, "+15552223333");
    }

    #[test]
    fn test_timezone() {
        let mut schedule = ScheduleConfig::default();
        assert!(schedule.tz().is_ok());
        assert!(schedule.today().is_ok());
        schedule.timezone = "Mars/Olympus".into();
        assert!(matches!(schedule.tz(), Err(StudySmsError::Config(_))));
    }

    #[test]
    fn test_save_and_reload() {
        let dir = std::env::temp_dir().join("studysms-config-test");
        let path = dir.join("config.toml");
        let mut config = StudySmsConfig::default();
        config.gateway.port = 8088;
        config.save_to(&path).unwrap();
        let loaded = StudySmsConfig::load_from(&path).unwrap();
        assert_eq!(loaded.gateway.port, 8088);
        std::fs::remove_dir_all(&dir).ok();
    }
}
