use anyhow::anyhow;
use clap::Parser;
use fern::colors::{Color, ColoredLevelConfig};
use log::LevelFilter;
use serde::{Deserialize, Serialize};
use std::{
    env,
    fs::{self, File},
    io::{Read, Write},
    path::PathBuf,
};
use time::{format_description::well_known::Iso8601, OffsetDateTime};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to Settings.toml file holding configuration options
    #[arg(short, long)]
    pub config: Option<String>,

    /// Log level to run with the service (default: info)
    #[arg(short, long)]
    pub level: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct Settings {
    pub config: Option<String>,
    pub level: Option<String>,
    pub db_settings: DBSettings,
    pub api_settings: ApiSettings,
}

impl ConfigurableSettings for Settings {
    fn apply_cli_overrides(&mut self, cli_settings: &CliSettings) {
        if let Some(level) = &cli_settings.level {
            self.level = Some(level.clone());
        }
    }

    fn default_config_path() -> PathBuf {
        PathBuf::from("./config/local.toml")
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DBSettings {
    pub data_folder: String,
    pub read_max_connections: u32,
    pub read_min_connections: u32,
    pub write_max_connections: u32,
    pub write_min_connections: u32,
    pub idle_timeout_secs: u64,
    pub acquire_timeout_secs: u64,
    pub sqlite_config: SqliteConfigSerde,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SqliteConfigSerde {
    pub mode: String,
    pub cache: String,
    pub busy_timeout_ms: u32,
    pub journal_mode: String,
    pub synchronous: String,
    pub cache_size: i32,
    pub foreign_keys: bool,
    pub wal_autocheckpoint: Option<u32>,
    pub temp_store: String,
    pub mmap_size: Option<u64>,
    pub page_size: Option<u32>,
}

impl Default for DBSettings {
    fn default() -> Self {
        DBSettings {
            data_folder: String::from("./data"),
            read_max_connections: 12,
            read_min_connections: 2,
            write_max_connections: 5,
            write_min_connections: 1,
            idle_timeout_secs: 600,   // 10 minutes
            acquire_timeout_secs: 15, // 15 seconds
            sqlite_config: SqliteConfigSerde::default(),
        }
    }
}

impl Default for SqliteConfigSerde {
    fn default() -> Self {
        Self {
            mode: "ReadWriteCreate".to_string(),
            cache: "Shared".to_string(),
            busy_timeout_ms: 5000,
            journal_mode: "WAL".to_string(),
            synchronous: "NORMAL".to_string(),
            cache_size: 1000000,
            foreign_keys: true,
            wal_autocheckpoint: Some(1000),
            temp_store: "Memory".to_string(),
            mmap_size: Some(268435456), // 256MB
            page_size: Some(4096),
        }
    }
}

impl SqliteConfigSerde {
    pub fn development() -> Self {
        Self {
            busy_timeout_ms: 10000,
            cache_size: 100000,
            ..Default::default()
        }
    }

    pub fn production() -> Self {
        Self {
            synchronous: "FULL".to_string(),
            cache_size: 2000000,
            wal_autocheckpoint: Some(10000),
            mmap_size: Some(1073741824), // 1GB
            ..Default::default()
        }
    }

    pub fn testing() -> Self {
        Self {
            mode: "Memory".to_string(),
            journal_mode: "MEMORY".to_string(),
            synchronous: "OFF".to_string(),
            temp_store: "Memory".to_string(),
            busy_timeout_ms: 1000,
            cache_size: 10000,
            wal_autocheckpoint: None,
            mmap_size: None,
            page_size: None,
            ..Default::default()
        }
    }
}

/// Bind address/port for the HTTP surface. CORS origins are sourced from `ALLOW_ORIGINS`
/// (required env var), not from this file, per the original implementation's fail-fast check.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ApiSettings {
    pub domain: String,
    pub port: String,
}

impl Default for ApiSettings {
    fn default() -> Self {
        ApiSettings {
            domain: String::from("127.0.0.1"),
            port: String::from("9990"),
        }
    }
}

pub fn get_settings() -> Result<Settings, anyhow::Error> {
    get_settings_with_cli(Cli::parse().into())
}

pub struct CliSettings {
    pub config: Option<String>,
    pub level: Option<String>,
}

impl From<Cli> for CliSettings {
    fn from(cli: Cli) -> Self {
        Self {
            config: cli.config,
            level: cli.level,
        }
    }
}
pub trait ConfigurableSettings: Serialize + for<'de> Deserialize<'de> + Default {
    /// Apply CLI settings after loading from file
    fn apply_cli_overrides(&mut self, cli_settings: &CliSettings);

    /// Get the default config file path
    fn default_config_path() -> PathBuf {
        PathBuf::from("./config/settings.toml")
    }

    /// Get the config directory path
    fn config_directory() -> PathBuf {
        PathBuf::from("./config")
    }
}

pub fn get_settings_with_cli<T: ConfigurableSettings>(
    cli_settings: CliSettings,
) -> Result<T, anyhow::Error> {
    let mut settings = if let Some(config_path) = cli_settings.config.clone() {
        let path = PathBuf::from(config_path);

        let absolute_path = if path.is_absolute() {
            path
        } else {
            env::current_dir()?.join(path)
        };

        let file_settings = match File::open(absolute_path) {
            Ok(mut file) => {
                let mut content = String::new();
                file.read_to_string(&mut content)
                    .map_err(|e| anyhow!("Failed to read config: {}", e))?;
                toml::from_str(&content)
                    .map_err(|e| anyhow!("Failed to map config to settings: {}", e))?
            }
            Err(err) => return Err(anyhow!("Failed to find file: {}", err)),
        };
        file_settings
    } else {
        let default_path = T::default_config_path();
        match File::open(&default_path) {
            Ok(mut file) => {
                let mut content = String::new();
                file.read_to_string(&mut content)
                    .map_err(|e| anyhow!("Failed to read default config: {}", e))?;
                toml::from_str(&content)
                    .map_err(|e| anyhow!("Failed to parse default config: {}", e))?
            }
            Err(_) => {
                // Create default settings
                let default_settings = T::default();

                // Create config directory if it doesn't exist
                fs::create_dir_all(T::config_directory())
                    .map_err(|e| anyhow!("Failed to create config directory: {}", e))?;

                let toml_content = toml::to_string(&default_settings)
                    .map_err(|e| anyhow!("Failed to serialize default settings: {}", e))?;

                let mut file = fs::File::create(&default_path)
                    .map_err(|e| anyhow!("Failed to create config file: {}", e))?;
                file.write_all(toml_content.as_bytes())
                    .map_err(|e| anyhow!("Failed to write default config: {}", e))?;

                default_settings
            }
        }
    };

    settings.apply_cli_overrides(&cli_settings);

    Ok(settings)
}

pub fn setup_logger(
    level: Option<String>,
    filter_targets: Vec<String>,
) -> Result<(), fern::InitError> {
    let rust_log = get_log_level(level);
    let colors = ColoredLevelConfig::new()
        .trace(Color::White)
        .debug(Color::Cyan)
        .info(Color::Blue)
        .warn(Color::Yellow)
        .error(Color::Magenta);

    fern::Dispatch::new()
        .format(move |out, message, record| {
            out.finish(format_args!(
                "[{} {}] {}: {}",
                OffsetDateTime::now_utc().format(&Iso8601::DEFAULT).unwrap(),
                colors.color(record.level()),
                record.target(),
                message
            ));
        })
        .level(rust_log)
        .filter(move |metadata| {
            !filter_targets
                .iter()
                .any(|filter| metadata.target().starts_with(filter))
        })
        .chain(std::io::stdout())
        .apply()?;
    Ok(())
}

pub fn get_log_level(level: Option<String>) -> LevelFilter {
    if let Some(level) = &level {
        match level.as_ref() {
            "trace" => LevelFilter::Trace,
            "debug" => LevelFilter::Debug,
            "info" => LevelFilter::Info,
            "warn" => LevelFilter::Warn,
            "error" => LevelFilter::Error,
            _ => LevelFilter::Info,
        }
    } else {
        let rust_log = env::var("RUST_LOG").unwrap_or_else(|_| String::from(""));
        match rust_log.to_lowercase().as_str() {
            "trace" => LevelFilter::Trace,
            "debug" => LevelFilter::Debug,
            "info" => LevelFilter::Info,
            "warn" => LevelFilter::Warn,
            "error" => LevelFilter::Error,
            _ => LevelFilter::Info,
        }
    }
}

// ---------------------------------------------------------------------------
// Escrow-domain operational knobs, sourced directly from the environment per
// the external interface section: BTC_CORE_*, API_KEYS, WOO_*, WEBHOOK_*,
// STUCK_*, SIGNING_DEADLINE_DAYS, RATE_LIMIT, ORDERS_DB, ALLOW_ORIGINS.
// ---------------------------------------------------------------------------

#[derive(Clone, Debug)]
pub struct WalletRpcSettings {
    pub url: String,
    pub user: String,
    pub pass: String,
    pub wallet: String,
}

fn env_var(name: &str) -> Result<String, anyhow::Error> {
    env::var(name).map_err(|_| anyhow!("missing required environment variable {name}"))
}

fn env_var_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

impl WalletRpcSettings {
    pub fn from_env() -> Result<Self, anyhow::Error> {
        Ok(Self {
            url: env_var("BTC_CORE_URL")?,
            user: env_var("BTC_CORE_USER")?,
            pass: env_var("BTC_CORE_PASS")?,
            wallet: env_var("BTC_CORE_WALLET")?,
        })
    }
}

#[derive(Clone, Debug)]
pub struct ApiKeySettings {
    pub keys: Vec<String>,
    pub revoked: Vec<String>,
}

impl ApiKeySettings {
    pub fn from_env() -> Self {
        let parse_set = |name: &str| -> Vec<String> {
            env::var(name)
                .unwrap_or_default()
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        };
        Self {
            keys: parse_set("API_KEYS"),
            revoked: parse_set("API_KEY_REVOKED"),
        }
    }

    /// A key is accepted only if the configured set is non-empty, the key is present in it,
    /// and it is not present in the revoked set (revoked wins even if also listed as active).
    pub fn is_authorized(&self, key: &str) -> bool {
        !self.keys.is_empty()
            && self.keys.iter().any(|k| k == key)
            && !self.revoked.iter().any(|k| k == key)
    }
}

/// `ALLOW_ORIGINS` is required: startup fails fast if unset or empty, mirroring the
/// original implementation's `RuntimeError` on missing CORS origins.
pub fn load_allow_origins() -> Result<Vec<String>, anyhow::Error> {
    let raw = env_var("ALLOW_ORIGINS")?;
    let origins: Vec<String> = raw
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if origins.is_empty() {
        return Err(anyhow!("ALLOW_ORIGINS is set but contains no origins"));
    }
    Ok(origins)
}

#[derive(Clone, Debug)]
pub struct WebhookSettings {
    pub callback_url: String,
    pub hmac_secret: String,
    pub retries: u32,
    pub backoff: f64,
}

impl WebhookSettings {
    pub fn from_env() -> Result<Self, anyhow::Error> {
        Ok(Self {
            callback_url: env_var("WOO_CALLBACK_URL")?,
            hmac_secret: env_var("WOO_HMAC_SECRET")?,
            retries: env_var_or("WEBHOOK_RETRIES", "3").parse()?,
            backoff: env_var_or("WEBHOOK_BACKOFF", "2").parse()?,
        })
    }
}

#[derive(Clone, Debug)]
pub struct DeadlineSettings {
    pub stuck_order_hours: i64,
    pub check_interval_secs: u64,
    pub signing_deadline_days: i64,
}

impl DeadlineSettings {
    pub fn from_env() -> Result<Self, anyhow::Error> {
        Ok(Self {
            stuck_order_hours: env_var_or("STUCK_ORDER_HOURS", "24").parse()?,
            check_interval_secs: env_var_or("STUCK_CHECK_INTERVAL", "600").parse()?,
            signing_deadline_days: env_var_or("SIGNING_DEADLINE_DAYS", "7").parse()?,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateLimitUnit {
    Second,
    Minute,
    Hour,
}

impl RateLimitUnit {
    pub fn as_secs(&self) -> u64 {
        match self {
            RateLimitUnit::Second => 1,
            RateLimitUnit::Minute => 60,
            RateLimitUnit::Hour => 3600,
        }
    }
}

#[derive(Clone, Debug)]
pub struct RateLimitSettings {
    pub count: u32,
    pub unit: RateLimitUnit,
}

impl RateLimitSettings {
    /// Parses `<count>/<unit>` where unit is `second|minute|hour`, e.g. `100/minute`.
    pub fn parse(raw: &str) -> Result<Self, anyhow::Error> {
        let (count_str, unit_str) = raw
            .split_once('/')
            .ok_or_else(|| anyhow!("RATE_LIMIT must be formatted as <count>/<unit>, got {raw}"))?;
        let count: u32 = count_str
            .trim()
            .parse()
            .map_err(|_| anyhow!("RATE_LIMIT count {count_str} is not a number"))?;
        let unit = match unit_str.trim() {
            "second" => RateLimitUnit::Second,
            "minute" => RateLimitUnit::Minute,
            "hour" => RateLimitUnit::Hour,
            other => return Err(anyhow!("RATE_LIMIT unit {other} must be second|minute|hour")),
        };
        Ok(Self { count, unit })
    }

    pub fn from_env() -> Result<Self, anyhow::Error> {
        Self::parse(&env_var_or("RATE_LIMIT", "100/minute"))
    }
}

pub fn orders_db_path() -> String {
    env_var_or("ORDERS_DB", "./data")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_parses_count_and_unit() {
        let limit = RateLimitSettings::parse("100/minute").unwrap();
        assert_eq!(limit.count, 100);
        assert_eq!(limit.unit, RateLimitUnit::Minute);
        assert_eq!(limit.unit.as_secs(), 60);
    }

    #[test]
    fn rate_limit_rejects_malformed_input() {
        assert!(RateLimitSettings::parse("100").is_err());
        assert!(RateLimitSettings::parse("abc/minute").is_err());
        assert!(RateLimitSettings::parse("100/fortnight").is_err());
    }

    #[test]
    fn api_key_revocation_wins_over_active_set() {
        let keys = ApiKeySettings {
            keys: vec!["a".to_string(), "b".to_string()],
            revoked: vec!["b".to_string()],
        };
        assert!(keys.is_authorized("a"));
        assert!(!keys.is_authorized("b"));
        assert!(!keys.is_authorized("c"));
    }

    #[test]
    fn empty_key_set_authorizes_nothing_and_blocks_nothing_ambiguously() {
        let keys = ApiKeySettings {
            keys: vec![],
            revoked: vec![],
        };
        assert!(!keys.is_authorized("anything"));
    }
}
