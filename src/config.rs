use std::str::FromStr;
use std::time::Duration;

use chrono::Weekday;
use ulid::Ulid;

use crate::limits::{MAX_LOOKAHEAD_DAYS, MIN_GRANULARITY_MINUTES};
use crate::model::{BusinessHours, Schedule, minutes_from_hours};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    pub var: &'static str,
    pub value: String,
    pub reason: &'static str,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}={:?}: {}", self.var, self.value, self.reason)
    }
}

impl std::error::Error for ConfigError {}

/// Service settings, read from `AVAILD_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub max_connections: usize,
    pub metrics_port: Option<u16>,

    pub schedule: Schedule,
    pub cache_ttl: Duration,
    pub sweep_interval: Duration,
    pub debounce: Duration,

    pub look_ahead_days: u32,
    pub preload_services: Vec<Ulid>,
    pub preload_duration_minutes: u32,
    pub preload_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 7433,
            max_connections: 256,
            metrics_port: None,
            schedule: Schedule::default(),
            cache_ttl: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(60),
            debounce: Duration::from_millis(300),
            look_ahead_days: 14,
            preload_services: Vec::new(),
            preload_duration_minutes: 120,
            preload_interval: Duration::from_secs(900),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from any variable lookup. Unset variables keep their default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env(&lookup);
        let mut config = Config::default();

        config.bind = env.raw("AVAILD_BIND").unwrap_or(config.bind);
        config.port = env.parsed("AVAILD_PORT")?.unwrap_or(config.port);
        config.max_connections = env
            .parsed("AVAILD_MAX_CONNECTIONS")?
            .unwrap_or(config.max_connections);
        config.metrics_port = env.parsed("AVAILD_METRICS_PORT")?;

        if let Some(hours) = env.raw("AVAILD_BUSINESS_HOURS") {
            config.schedule.default_hours = BusinessHours::parse(&hours).ok_or(ConfigError {
                var: "AVAILD_BUSINESS_HOURS",
                value: hours,
                reason: "expected HH:MM-HH:MM with open before close",
            })?;
        }
        if let Some(minutes) = env.parsed::<u32>("AVAILD_SLOT_MINUTES")? {
            if minutes < MIN_GRANULARITY_MINUTES {
                return Err(ConfigError {
                    var: "AVAILD_SLOT_MINUTES",
                    value: minutes.to_string(),
                    reason: "slot granularity too fine",
                });
            }
            config.schedule.granularity_minutes = minutes;
        }
        if let Some(days) = env.raw("AVAILD_CLOSED_DAYS") {
            for day in weekdays("AVAILD_CLOSED_DAYS", &days)? {
                config.schedule.overrides.insert(day, None);
            }
        }
        if let Some(spec) = env.raw("AVAILD_WEEKDAY_HOURS") {
            for (day, hours) in weekday_hours(&spec)? {
                config.schedule.overrides.insert(day, Some(hours));
            }
        }

        if let Some(secs) = env.parsed("AVAILD_CACHE_TTL_SECS")? {
            config.cache_ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = env.parsed::<u64>("AVAILD_SWEEP_INTERVAL_SECS")? {
            config.sweep_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(ms) = env.parsed("AVAILD_DEBOUNCE_MS")? {
            config.debounce = Duration::from_millis(ms);
        }

        if let Some(days) = env.parsed::<u32>("AVAILD_LOOKAHEAD_DAYS")? {
            if days > MAX_LOOKAHEAD_DAYS {
                return Err(ConfigError {
                    var: "AVAILD_LOOKAHEAD_DAYS",
                    value: days.to_string(),
                    reason: "look-ahead too long",
                });
            }
            config.look_ahead_days = days;
        }
        if let Some(ids) = env.raw("AVAILD_PRELOAD_SERVICES") {
            config.preload_services = ids
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| {
                    Ulid::from_string(s).map_err(|_| ConfigError {
                        var: "AVAILD_PRELOAD_SERVICES",
                        value: s.to_string(),
                        reason: "not a ULID",
                    })
                })
                .collect::<Result<_, _>>()?;
        }
        if let Some(hours) = env.raw("AVAILD_PRELOAD_DURATION_HOURS") {
            config.preload_duration_minutes = hours
                .parse::<f64>()
                .ok()
                .and_then(minutes_from_hours)
                .ok_or(ConfigError {
                    var: "AVAILD_PRELOAD_DURATION_HOURS",
                    value: hours,
                    reason: "expected a positive number of hours",
                })?;
        }
        if let Some(secs) = env.parsed::<u64>("AVAILD_PRELOAD_INTERVAL_SECS")? {
            config.preload_interval = Duration::from_secs(secs.max(1));
        }

        Ok(config)
    }
}

struct Env<'a, F: Fn(&str) -> Option<String>>(&'a F);

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn raw(&self, var: &str) -> Option<String> {
        (self.0)(var)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parsed<T: FromStr>(&self, var: &'static str) -> Result<Option<T>, ConfigError> {
        match self.raw(var) {
            None => Ok(None),
            Some(value) => value.parse().map(Some).map_err(|_| ConfigError {
                var,
                value,
                reason: "not a valid number",
            }),
        }
    }
}

fn weekdays(var: &'static str, list: &str) -> Result<Vec<Weekday>, ConfigError> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<Weekday>().map_err(|_| ConfigError {
                var,
                value: s.to_string(),
                reason: "unknown weekday",
            })
        })
        .collect()
}

/// `sat=09:00-13:00,sun=10:00-14:00`
fn weekday_hours(spec: &str) -> Result<Vec<(Weekday, BusinessHours)>, ConfigError> {
    const VAR: &str = "AVAILD_WEEKDAY_HOURS";
    spec.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|entry| {
            let bad = |reason| ConfigError {
                var: VAR,
                value: entry.to_string(),
                reason,
            };
            let (day, hours) = entry.split_once('=').ok_or_else(|| bad("expected day=HH:MM-HH:MM"))?;
            let day = day.trim().parse::<Weekday>().map_err(|_| bad("unknown weekday"))?;
            let hours = BusinessHours::parse(hours.trim()).ok_or_else(|| bad("bad hours"))?;
            Ok((day, hours))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use chrono::NaiveTime;

    use super::*;

    fn from(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn defaults() {
        let c = from(&[]).unwrap();
        assert_eq!(c, Config::default());
        assert_eq!(c.schedule.granularity_minutes, 30);
        assert_eq!(c.cache_ttl, Duration::from_secs(300));
        assert_eq!(c.debounce, Duration::from_millis(300));
    }

    #[test]
    fn overrides() {
        let svc = Ulid::new();
        let services = format!("{svc}, ");
        let c = from(&[
            ("AVAILD_PORT", "9000"),
            ("AVAILD_BUSINESS_HOURS", "09:00-17:00"),
            ("AVAILD_SLOT_MINUTES", "15"),
            ("AVAILD_CLOSED_DAYS", "sun, Sat"),
            ("AVAILD_WEEKDAY_HOURS", "fri=09:00-13:00"),
            ("AVAILD_CACHE_TTL_SECS", "60"),
            ("AVAILD_PRELOAD_SERVICES", &services),
            ("AVAILD_PRELOAD_DURATION_HOURS", "1.5"),
        ])
        .unwrap();
        assert_eq!(c.port, 9000);
        assert_eq!(c.schedule.default_hours.open, NaiveTime::from_hms_opt(9, 0, 0).unwrap());
        assert_eq!(c.schedule.granularity_minutes, 15);
        assert_eq!(c.schedule.overrides.get(&Weekday::Sun), Some(&None));
        assert_eq!(c.schedule.overrides.get(&Weekday::Sat), Some(&None));
        assert_eq!(
            c.schedule.overrides.get(&Weekday::Fri),
            Some(&BusinessHours::parse("09:00-13:00"))
        );
        assert_eq!(c.cache_ttl, Duration::from_secs(60));
        assert_eq!(c.preload_services, vec![svc]);
        assert_eq!(c.preload_duration_minutes, 90);
    }

    #[test]
    fn rejects_bad_values() {
        assert_eq!(from(&[("AVAILD_PORT", "http")]).unwrap_err().var, "AVAILD_PORT");
        assert!(from(&[("AVAILD_BUSINESS_HOURS", "18:00-08:00")]).is_err());
        assert!(from(&[("AVAILD_SLOT_MINUTES", "1")]).is_err());
        assert!(from(&[("AVAILD_CLOSED_DAYS", "someday")]).is_err());
        assert!(from(&[("AVAILD_WEEKDAY_HOURS", "mon")]).is_err());
        assert!(from(&[("AVAILD_PRELOAD_SERVICES", "not-an-id")]).is_err());
        assert!(from(&[("AVAILD_PRELOAD_DURATION_HOURS", "-2")]).is_err());
        assert!(from(&[("AVAILD_LOOKAHEAD_DAYS", "400")]).is_err());
    }

    #[test]
    fn blank_means_unset() {
        let c = from(&[("AVAILD_METRICS_PORT", "  ")]).unwrap();
        assert_eq!(c.metrics_port, None);
    }
}
