use chrono_tz::Tz;
use meter_client::domain::TariffWindow;
use serde::Deserialize;
use std::fs;
use time::macros::time;
use time::Time;

pub const DEFAULT_TIMEZONE: &str = "Europe/Madrid";
pub const DEFAULT_BILLED_POWER_KW: f64 = 3.5;
pub const DEFAULT_SUN_WINDOW: TariffWindow = TariffWindow::new(time!(12:00), time!(18:00));
pub const DEFAULT_PEAK_WINDOW: TariffWindow = TariffWindow::new(time!(08:00), time!(00:00));

/// Upper bound the metering API accepts for `first`.
pub const MAX_PAGE_SIZE: u32 = 500;

pub const MAX_FREQUENCY_HOURS: u64 = 24 * 7;
pub const MAX_BACKFILL_DAYS: u64 = 3650;

#[derive(Debug, Clone, Deserialize)]
pub struct OctopusConfig {
    #[serde(default = "default_graphql_url")]
    pub graphql_url: String,
    pub property_id: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QuestDbConfig {
    pub uri: String,
    pub max_connections: u32,
    pub ilp_tcp_addr: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WriteMode {
    #[default]
    Ilp,
    Pgwire,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub write_mode: WriteMode,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            write_mode: WriteMode::default(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_frequency_hours")]
    pub frequency_hours: u64,
    #[serde(default)]
    pub backfill_days: u64,
    #[serde(default)]
    pub reset_on_startup: bool,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            frequency_hours: default_frequency_hours(),
            backfill_days: 0,
            reset_on_startup: false,
        }
    }
}

/// Tariff settings as written in the config file.
#[derive(Debug, Clone, Deserialize)]
pub struct TariffConfig {
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_billed_power")]
    pub billed_power: f64,
    #[serde(default)]
    pub sun_start: Option<String>,
    #[serde(default)]
    pub sun_end: Option<String>,
    #[serde(default)]
    pub peak_start: Option<String>,
    #[serde(default)]
    pub peak_end: Option<String>,
}

impl Default for TariffConfig {
    fn default() -> Self {
        Self {
            timezone: default_timezone(),
            billed_power: default_billed_power(),
            sun_start: None,
            sun_end: None,
            peak_start: None,
            peak_end: None,
        }
    }
}

/// Tariff settings after parsing, as consumed by the classifier.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TariffSettings {
    pub zone: Tz,
    pub billed_power_kw: f64,
    pub sun_window: TariffWindow,
    pub peak_window: TariffWindow,
}

impl Default for TariffSettings {
    fn default() -> Self {
        Self {
            zone: chrono_tz::Europe::Madrid,
            billed_power_kw: DEFAULT_BILLED_POWER_KW,
            sun_window: DEFAULT_SUN_WINDOW,
            peak_window: DEFAULT_PEAK_WINDOW,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub bind_addr: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub octopus: OctopusConfig,
    pub questdb: QuestDbConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub tariff: TariffConfig,
    pub metrics: Option<MetricsConfig>,
}

fn default_graphql_url() -> String {
    "https://octopusenergy.es/api/graphql/kraken".to_string()
}

fn default_page_size() -> u32 {
    MAX_PAGE_SIZE
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    500
}

fn default_frequency_hours() -> u64 {
    12
}

fn default_timezone() -> String {
    DEFAULT_TIMEZONE.to_string()
}

fn default_billed_power() -> f64 {
    DEFAULT_BILLED_POWER_KW
}

/// Parse `HH:MM` or `HH:MM:SS`.
pub fn parse_local_time(s: &str) -> Option<Time> {
    let mut parts = s.trim().split(':');
    let hour: u8 = parts.next()?.parse().ok()?;
    let minute: u8 = parts.next()?.parse().ok()?;
    let second: u8 = match parts.next() {
        Some(p) => p.parse().ok()?,
        None => 0,
    };
    if parts.next().is_some() {
        return None;
    }
    Time::from_hms(hour, minute, second).ok()
}

fn resolve_time(field: &str, raw: Option<&str>, default: Time) -> Time {
    let Some(raw) = raw else {
        return default;
    };
    match parse_local_time(raw) {
        Some(t) => t,
        None => {
            tracing::warn!(field, value = raw, default = %default, "malformed window time, using default");
            default
        }
    }
}

impl TariffConfig {
    /// Resolve into classifier inputs. Never fails: malformed values fall
    /// back to their defaults with a warning.
    pub fn resolve(&self) -> TariffSettings {
        let zone = match self.timezone.parse::<Tz>() {
            Ok(tz) => tz,
            Err(_) => {
                tracing::warn!(
                    timezone = %self.timezone,
                    default = DEFAULT_TIMEZONE,
                    "unknown time zone, using default"
                );
                chrono_tz::Europe::Madrid
            }
        };

        let sun_window = TariffWindow::new(
            resolve_time("sun_start", self.sun_start.as_deref(), DEFAULT_SUN_WINDOW.start),
            resolve_time("sun_end", self.sun_end.as_deref(), DEFAULT_SUN_WINDOW.end),
        );
        let peak_window = TariffWindow::new(
            resolve_time("peak_start", self.peak_start.as_deref(), DEFAULT_PEAK_WINDOW.start),
            resolve_time("peak_end", self.peak_end.as_deref(), DEFAULT_PEAK_WINDOW.end),
        );

        TariffSettings {
            zone,
            billed_power_kw: self.billed_power,
            sun_window,
            peak_window,
        }
    }
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        use std::env;

        let path = env::var("INGESTION_CONFIG").unwrap_or_else(|_| "ingestion-config.toml".to_string());
        let contents = fs::read_to_string(&path)?;
        let mut cfg = Self::from_toml(&contents)?;

        // Credentials are usually kept out of the config file.
        if let Ok(user) = env::var("OCTOPUS_USER") {
            cfg.octopus.email = user;
        }
        if let Ok(pass) = env::var("OCTOPUS_PASS") {
            cfg.octopus.password = pass;
        }

        Ok(cfg)
    }

    pub fn from_toml(contents: &str) -> anyhow::Result<Self> {
        let mut cfg: AppConfig = toml::from_str(contents)?;
        cfg.validate()?;
        cfg.octopus.page_size = cfg.octopus.page_size.clamp(1, MAX_PAGE_SIZE);
        Ok(cfg)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if !(1..=MAX_FREQUENCY_HOURS).contains(&self.schedule.frequency_hours) {
            anyhow::bail!("schedule.frequency_hours must be between 1 and {MAX_FREQUENCY_HOURS}");
        }
        if self.schedule.backfill_days > MAX_BACKFILL_DAYS {
            anyhow::bail!("schedule.backfill_days must be at most {MAX_BACKFILL_DAYS}");
        }
        if !self.tariff.billed_power.is_finite() || self.tariff.billed_power < 0.0 {
            anyhow::bail!("tariff.billed_power must be a non-negative number");
        }
        Ok(())
    }
}
