/// config.rs – Load settings from config.yaml + environment variables.
///
/// Environment variables always override YAML values.
/// The user / session identity can come from YAML, env or the command line.
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ---------------------------------------------------------------------------
// Sub-configs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BackendConfig {
    pub host: String,
    pub port: u16,
    /// `http` or `https`.
    pub protocol: String,
    /// `ws` or `wss`.
    pub ws_protocol: String,
    pub sim_base_path: String,
    pub chart_base_path: String,
    pub request_timeout_ms: u64,
    /// Delay before the dashboard retries a dropped stream.
    pub ws_reconnect_delay_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 8000,
            protocol: "http".into(),
            ws_protocol: "ws".into(),
            sim_base_path: "/sim".into(),
            chart_base_path: "/chart_data".into(),
            request_timeout_ms: 10_000,
            ws_reconnect_delay_ms: 3_000,
        }
    }
}

impl BackendConfig {
    pub fn base_url(&self) -> String {
        format!("{}://{}:{}", self.protocol, self.host, self.port)
    }

    pub fn ws_base_url(&self) -> String {
        format!("{}://{}:{}", self.ws_protocol, self.host, self.port)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.ws_reconnect_delay_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Chart data TTL in milliseconds.
    pub duration_ms: u64,
    /// Maximum number of cached chart series.
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            duration_ms: 30_000,
            max_entries: 100,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionConfig {
    pub user_id: String,
    pub session_id: String,
    /// Symbol selected when the session opens.
    pub symbol: String,
    /// Chart bar interval (e.g. "30s", "1min").
    pub interval: String,
    /// Days of chart history to request.
    pub days: u32,
    /// Quiet period before a trade-validation call is sent.
    pub validation_debounce_ms: u64,
    /// Simulated ticks per 24h of session duration.
    pub ticks_per_day: f64,
    /// Session start and length; the progress readout needs both.
    pub start_time: Option<DateTime<Utc>>,
    pub duration_seconds: Option<f64>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            user_id: String::new(),
            session_id: String::new(),
            symbol: "AAPL".into(),
            interval: "30s".into(),
            days: 7,
            validation_debounce_ms: 300,
            ticks_per_day: 780.0,
            start_time: None,
            duration_seconds: None,
        }
    }
}

impl SessionConfig {
    pub fn validation_debounce(&self) -> Duration {
        Duration::from_millis(self.validation_debounce_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientConfig {
    pub log_level: String,
    /// How often (seconds) quote and portfolio are re-polled.
    pub poll_interval_seconds: f64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            log_level: "INFO".into(),
            poll_interval_seconds: 5.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DashboardConfig {
    /// Dashboard refresh rate in seconds.
    pub refresh_rate: f64,
}

impl ClientConfig {
    /// Portfolio poll period, never shorter than a millisecond.
    pub fn poll_interval(&self) -> Duration {
        secs_at_least_1ms(self.poll_interval_seconds)
    }
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self { refresh_rate: 1.0 }
    }
}

// ---------------------------------------------------------------------------
// Top-level settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    pub backend: BackendConfig,
    pub cache: CacheConfig,
    pub session: SessionConfig,
    pub client: ClientConfig,
    pub dashboard: DashboardConfig,
}

impl Settings {
    /// Load settings from *config_path* YAML file, then overlay env vars.
    pub fn load(config_path: &str) -> Result<Self> {
        // Try to load .env file (ignore error if absent)
        let _ = dotenvy::dotenv();

        let mut settings = if std::path::Path::new(config_path).exists() {
            let yaml = std::fs::read_to_string(config_path).context("reading config file")?;
            serde_yaml::from_str::<Settings>(&yaml).context("parsing config YAML")?
        } else {
            Settings::default()
        };

        settings.apply_env(|key| std::env::var(key).ok())?;
        settings.validate()?;
        Ok(settings)
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(host) = var("TRADESIM_BACKEND_HOST") {
            self.backend.host = host;
        }
        if let Some(port) = var("TRADESIM_BACKEND_PORT") {
            self.backend.port = port
                .parse()
                .with_context(|| format!("TRADESIM_BACKEND_PORT is not a port: {port}"))?;
        }
        if let Some(proto) = var("TRADESIM_BACKEND_PROTOCOL") {
            // https implies wss for the stream
            self.backend.ws_protocol = if proto == "https" { "wss" } else { "ws" }.into();
            self.backend.protocol = proto;
        }
        if let Some(user) = var("TRADESIM_USER_ID") {
            self.session.user_id = user;
        }
        if let Some(session) = var("TRADESIM_SESSION_ID") {
            self.session.session_id = session;
        }
        Ok(())
    }

    pub fn has_identity(&self) -> bool {
        !self.session.user_id.is_empty() && !self.session.session_id.is_empty()
    }

    pub fn validate(&self) -> Result<()> {
        if self.backend.host.trim().is_empty() {
            bail!("backend.host must not be empty");
        }
        if !matches!(self.backend.protocol.as_str(), "http" | "https") {
            bail!("backend.protocol must be http or https");
        }
        if !matches!(self.backend.ws_protocol.as_str(), "ws" | "wss") {
            bail!("backend.ws_protocol must be ws or wss");
        }
        for (name, path) in [
            ("backend.sim_base_path", &self.backend.sim_base_path),
            ("backend.chart_base_path", &self.backend.chart_base_path),
        ] {
            if !path.starts_with('/') {
                bail!("{name} must start with '/'");
            }
        }
        if self.backend.request_timeout_ms == 0 {
            bail!("backend.request_timeout_ms must be > 0");
        }
        if self.cache.max_entries == 0 {
            bail!("cache.max_entries must be > 0");
        }
        if self.session.days == 0 {
            bail!("session.days must be > 0");
        }
        if self.session.interval.trim().is_empty() {
            bail!("session.interval must not be empty");
        }
        validate_positive("session.ticks_per_day", self.session.ticks_per_day)?;
        if let Some(d) = self.session.duration_seconds {
            validate_positive("session.duration_seconds", d)?;
        }
        validate_positive("client.poll_interval_seconds", self.client.poll_interval_seconds)?;
        validate_positive("dashboard.refresh_rate", self.dashboard.refresh_rate)?;
        Ok(())
    }
}

impl DashboardConfig {
    pub fn refresh_interval(&self) -> Duration {
        secs_at_least_1ms(self.refresh_rate)
    }
}

/// `tokio::time::interval` panics on a zero period.
fn secs_at_least_1ms(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs)
        .unwrap_or(Duration::ZERO)
        .max(Duration::from_millis(1))
}

fn validate_positive(name: &str, value: f64) -> Result<()> {
    if !value.is_finite() || value <= 0.0 {
        bail!("{name} must be a finite number > 0");
    }
    Ok(())
}
