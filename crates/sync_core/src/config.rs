use std::{fs, path::Path, time::Duration};

use anyhow::Context;
use serde::Deserialize;
use shared::domain::Side;
use url::Url;

use crate::error::SyncError;

pub const DEFAULT_SETTINGS_FILE: &str = "dashboard.toml";
pub const MIN_POLL_INTERVAL_MS: u64 = 100;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    pub api_base_url: String,
    pub left_lane_url: Option<String>,
    pub right_lane_url: Option<String>,
    pub left_flush_url: Option<String>,
    pub right_flush_url: Option<String>,
    pub refresh_url: Option<String>,
    pub channel_origin: Option<String>,
    pub channel_path: String,
    pub poll_interval_ms: u64,
    pub request_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub reconnect: bool,
    pub reconnect_min_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub page_size: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            api_base_url: "http://127.0.0.1:3000".into(),
            left_lane_url: None,
            right_lane_url: None,
            left_flush_url: None,
            right_flush_url: None,
            refresh_url: None,
            channel_origin: None,
            channel_path: "/socket.io/?EIO=4&transport=websocket".into(),
            poll_interval_ms: 5000,
            request_timeout_ms: 10_000,
            connect_timeout_ms: 20_000,
            reconnect: true,
            reconnect_min_delay_ms: 1000,
            reconnect_max_delay_ms: 5000,
            page_size: 10,
        }
    }
}

impl SyncSettings {
    pub fn with_api_base(api_base_url: impl Into<String>) -> Self {
        Self {
            api_base_url: api_base_url.into(),
            ..Self::default()
        }
    }

    pub fn lane_url(&self, side: Side) -> Result<Url, SyncError> {
        let explicit = match side {
            Side::Left => self.left_lane_url.as_deref(),
            Side::Right => self.right_lane_url.as_deref(),
        };
        self.endpoint(explicit, &format!("/api/sequence/{side}"))
    }

    pub fn flush_url(&self, side: Side) -> Result<Url, SyncError> {
        let explicit = match side {
            Side::Left => self.left_flush_url.as_deref(),
            Side::Right => self.right_flush_url.as_deref(),
        };
        self.endpoint(explicit, &format!("/api/sequence/{side}/flush"))
    }

    pub fn refresh_url(&self) -> Result<Url, SyncError> {
        self.endpoint(self.refresh_url.as_deref(), "/api/sequence/refresh")
    }

    /// WebSocket URL of the push channel, derived from the API origin unless overridden.
    pub fn channel_url(&self) -> Result<Url, SyncError> {
        let origin = self
            .channel_origin
            .as_deref()
            .unwrap_or(self.api_base_url.as_str());
        let mut url = Url::parse(origin.trim())?;
        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => {
                return Err(SyncError::Config(format!(
                    "channel origin must be http(s) or ws(s), got '{other}'"
                )))
            }
        };
        url.set_scheme(scheme)
            .map_err(|()| SyncError::Config(format!("cannot use scheme {scheme} for {origin}")))?;
        Ok(url.join(&self.channel_path)?)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(MIN_POLL_INTERVAL_MS))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Upper bound on one push-channel connect attempt, handshake included.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms.max(1))
    }

    pub fn reconnect_delays(&self) -> (Duration, Duration) {
        let min = self.reconnect_min_delay_ms.max(1);
        (
            Duration::from_millis(min),
            Duration::from_millis(self.reconnect_max_delay_ms.max(min)),
        )
    }

    /// Resolves every endpoint once so a bad URL fails at construction, not mid-session.
    pub fn validate(&self) -> Result<(), SyncError> {
        for side in Side::BOTH {
            self.lane_url(side)?;
            self.flush_url(side)?;
        }
        self.refresh_url()?;
        if self.page_size == 0 {
            return Err(SyncError::Config("page_size must be at least 1".into()));
        }
        Ok(())
    }

    fn endpoint(&self, explicit: Option<&str>, default_path: &str) -> Result<Url, SyncError> {
        match explicit {
            Some(url) => Ok(Url::parse(url.trim())?),
            None => Ok(Url::parse(self.api_base_url.trim())?.join(default_path)?),
        }
    }
}

/// Defaults, then the settings file, then environment variables.
pub fn load_settings(path: Option<&Path>) -> anyhow::Result<SyncSettings> {
    let mut settings = match path {
        Some(path) => read_settings_file(path)?,
        None if Path::new(DEFAULT_SETTINGS_FILE).exists() => {
            read_settings_file(Path::new(DEFAULT_SETTINGS_FILE))?
        }
        None => SyncSettings::default(),
    };
    apply_env_overrides(&mut settings, |key| std::env::var(key).ok());
    Ok(settings)
}

fn read_settings_file(path: &Path) -> anyhow::Result<SyncSettings> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read settings file '{}'", path.display()))?;
    toml::from_str(&raw)
        .with_context(|| format!("failed to parse settings file '{}'", path.display()))
}

/// Each key is read as `NAME` and then `APP__NAME`; the prefixed form wins.
pub fn apply_env_overrides(settings: &mut SyncSettings, lookup: impl Fn(&str) -> Option<String>) {
    let read = |name: &str| lookup(&format!("APP__{name}")).or_else(|| lookup(name));

    if let Some(v) = read("API_BASE_URL") {
        settings.api_base_url = v;
    }
    if let Some(v) = read("LEFT_LANE_URL") {
        settings.left_lane_url = Some(v);
    }
    if let Some(v) = read("RIGHT_LANE_URL") {
        settings.right_lane_url = Some(v);
    }
    if let Some(v) = read("LEFT_FLUSH_URL") {
        settings.left_flush_url = Some(v);
    }
    if let Some(v) = read("RIGHT_FLUSH_URL") {
        settings.right_flush_url = Some(v);
    }
    if let Some(v) = read("REFRESH_URL") {
        settings.refresh_url = Some(v);
    }
    if let Some(v) = read("CHANNEL_ORIGIN") {
        settings.channel_origin = Some(v);
    }
    if let Some(parsed) = read("POLL_INTERVAL_MS").and_then(|v| v.parse().ok()) {
        settings.poll_interval_ms = parsed;
    }
    if let Some(parsed) = read("REQUEST_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
        settings.request_timeout_ms = parsed;
    }
    if let Some(parsed) = read("CONNECT_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
        settings.connect_timeout_ms = parsed;
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        env,
        time::{SystemTime, UNIX_EPOCH},
    };

    use super::*;

    #[test]
    fn default_endpoints_hang_off_the_api_base() {
        let settings = SyncSettings::with_api_base("http://backend:8080");
        assert_eq!(
            settings.lane_url(Side::Left).expect("left").as_str(),
            "http://backend:8080/api/sequence/left"
        );
        assert_eq!(
            settings.flush_url(Side::Right).expect("flush").as_str(),
            "http://backend:8080/api/sequence/right/flush"
        );
        assert_eq!(
            settings.refresh_url().expect("refresh").as_str(),
            "http://backend:8080/api/sequence/refresh"
        );
    }

    #[test]
    fn explicit_lane_url_overrides_default() {
        let settings = SyncSettings {
            right_lane_url: Some("http://other:9000/right.json".into()),
            ..SyncSettings::default()
        };
        assert_eq!(
            settings.lane_url(Side::Right).expect("right").as_str(),
            "http://other:9000/right.json"
        );
    }

    #[test]
    fn channel_url_maps_http_schemes_to_websocket() {
        let settings = SyncSettings::with_api_base("https://dash.example.com/app/");
        assert_eq!(
            settings.channel_url().expect("channel").as_str(),
            "wss://dash.example.com/socket.io/?EIO=4&transport=websocket"
        );

        let overridden = SyncSettings {
            channel_origin: Some("http://10.0.0.5:4000".into()),
            ..SyncSettings::default()
        };
        assert_eq!(
            overridden.channel_url().expect("channel").as_str(),
            "ws://10.0.0.5:4000/socket.io/?EIO=4&transport=websocket"
        );
    }

    #[test]
    fn channel_url_rejects_unusable_origins() {
        let settings = SyncSettings {
            channel_origin: Some("ftp://files.example.com".into()),
            ..SyncSettings::default()
        };
        assert!(matches!(settings.channel_url(), Err(SyncError::Config(_))));

        let garbage = SyncSettings {
            channel_origin: Some("not a url".into()),
            ..SyncSettings::default()
        };
        assert!(garbage.channel_url().is_err());
    }

    #[test]
    fn poll_interval_is_clamped() {
        let settings = SyncSettings {
            poll_interval_ms: 5,
            ..SyncSettings::default()
        };
        assert_eq!(
            settings.poll_interval(),
            Duration::from_millis(MIN_POLL_INTERVAL_MS)
        );
        assert_eq!(
            SyncSettings::default().poll_interval(),
            Duration::from_millis(5000)
        );
    }

    #[test]
    fn validate_rejects_zero_page_size_and_bad_urls() {
        assert!(SyncSettings::default().validate().is_ok());
        let zero_page = SyncSettings {
            page_size: 0,
            ..SyncSettings::default()
        };
        assert!(zero_page.validate().is_err());
        let bad_base = SyncSettings::with_api_base("::nope::");
        assert!(bad_base.validate().is_err());
    }

    #[test]
    fn prefixed_env_names_win() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("API_BASE_URL", "http://plain:1"),
            ("APP__API_BASE_URL", "http://prefixed:2"),
            ("POLL_INTERVAL_MS", "750"),
            ("REQUEST_TIMEOUT_MS", "not-a-number"),
            ("CHANNEL_ORIGIN", "http://socket:3"),
            ("APP__CONNECT_TIMEOUT_MS", "1500"),
        ]);
        let mut settings = SyncSettings::default();
        apply_env_overrides(&mut settings, |key| env.get(key).map(|v| v.to_string()));

        assert_eq!(settings.api_base_url, "http://prefixed:2");
        assert_eq!(settings.poll_interval_ms, 750);
        assert_eq!(settings.request_timeout_ms, 10_000);
        assert_eq!(settings.channel_origin.as_deref(), Some("http://socket:3"));
        assert_eq!(settings.connect_timeout(), Duration::from_millis(1500));
    }

    #[test]
    fn settings_file_fills_missing_keys_with_defaults() {
        let suffix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        let path = env::temp_dir().join(format!("sequencing_dashboard_settings_{suffix}.toml"));
        fs::write(
            &path,
            "api_base_url = \"http://yard:8080\"\npoll_interval_ms = 2500\n",
        )
        .expect("write settings");

        let settings = read_settings_file(&path).expect("read settings");
        assert_eq!(settings.api_base_url, "http://yard:8080");
        assert_eq!(settings.poll_interval_ms, 2500);
        assert_eq!(settings.page_size, 10);
        assert!(settings.reconnect);

        fs::remove_file(path).expect("cleanup");
    }
}
