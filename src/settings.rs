use std::{path::PathBuf, time::Duration};

/// Server configuration read from the environment (after `.env` is loaded).
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub port: u16,
    pub database_url: Option<String>,
    pub media_storage_dir: PathBuf,
    pub admin_password_hash: Option<String>,
    pub webhook_secret: String,
    pub sweep_interval: Duration,
    pub firm_name: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            port: 4000,
            database_url: None,
            media_storage_dir: PathBuf::from("./media_uploads"),
            admin_password_hash: None,
            webhook_secret: String::new(),
            sweep_interval: Duration::from_secs(15),
            firm_name: String::new(),
        }
    }
}

impl ServerSettings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let defaults = Self::default();

        Self {
            port: non_empty("PORT")
                .and_then(|v| v.parse::<u16>().ok())
                .unwrap_or(defaults.port),
            database_url: non_empty("DATABASE_URL"),
            media_storage_dir: non_empty("MEDIA_STORAGE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.media_storage_dir),
            admin_password_hash: non_empty("ADMIN_PASSWORD_HASH"),
            webhook_secret: non_empty("PROVIDER_WEBHOOK_SECRET").unwrap_or_default(),
            sweep_interval: non_empty("ESCALATION_SWEEP_SECS")
                .and_then(|v| v.parse::<u64>().ok())
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.sweep_interval),
            firm_name: non_empty("FIRM_NAME").unwrap_or_default(),
        }
    }
}

/// Reconnect delays for the push subscriber: starts at `initial`, doubles on
/// every failed attempt, never exceeds `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffSettings {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorSettings {
    pub list_interval: Duration,
    pub detail_interval: Duration,
    pub backoff: BackoffSettings,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            list_interval: Duration::from_secs(5),
            detail_interval: Duration::from_secs(2),
            backoff: BackoffSettings::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let settings = ServerSettings::from_lookup(lookup(&[]));
        assert_eq!(settings.port, 4000);
        assert!(settings.database_url.is_none());
        assert!(settings.admin_password_hash.is_none());
        assert_eq!(settings.webhook_secret, "");
        assert_eq!(settings.sweep_interval, Duration::from_secs(15));
    }

    #[test]
    fn values_are_read_and_bad_numbers_ignored() {
        let settings = ServerSettings::from_lookup(lookup(&[
            ("PORT", "8080"),
            ("DATABASE_URL", "  "),
            ("MEDIA_STORAGE_DIR", "/tmp/media"),
            ("PROVIDER_WEBHOOK_SECRET", "s3cret"),
            ("ESCALATION_SWEEP_SECS", "zero"),
        ]));
        assert_eq!(settings.port, 8080);
        assert!(settings.database_url.is_none());
        assert_eq!(settings.media_storage_dir, PathBuf::from("/tmp/media"));
        assert_eq!(settings.webhook_secret, "s3cret");
        assert_eq!(settings.sweep_interval, Duration::from_secs(15));
    }

    #[test]
    fn monitor_intervals_match_the_polling_contract() {
        let settings = MonitorSettings::default();
        assert_eq!(settings.list_interval, Duration::from_secs(5));
        assert_eq!(settings.detail_interval, Duration::from_secs(2));
        assert_eq!(settings.backoff.initial, Duration::from_millis(500));
        assert_eq!(settings.backoff.max, Duration::from_secs(30));
    }
}
