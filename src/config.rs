use std::env;
use std::time::Duration;

use crate::error::AppError;

#[derive(Debug, Clone)]
pub struct Config {
    pub http_port: u16,
    pub log_level: String,
    pub event_buffer_size: usize,
    pub queue_table_enabled: bool,
    pub dispatch: DispatchConfig,
    pub sweeper: SweeperConfig,
}

/// Tunables of a single dispatch decision.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// A best candidate must score strictly above this to be auto-assigned.
    pub auto_assign_threshold: f64,
    pub broadcast_fanout: usize,
    pub search_radius_miles: f64,
    /// Radius used when re-dispatching after a rejection.
    pub rejection_radius_miles: f64,
    /// Lost assignment races tolerated before falling back to a broadcast.
    pub max_assign_attempts: u32,
    /// Extra attempts for each collaborator call after the first one fails.
    pub collaborator_retries: u32,
    pub retry_backoff: Duration,
    /// Waiting queue entries shown to a driver who just came online.
    pub queue_notify_limit: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            auto_assign_threshold: 0.7,
            broadcast_fanout: 5,
            search_radius_miles: 15.0,
            rejection_radius_miles: 20.0,
            max_assign_attempts: 3,
            collaborator_retries: 1,
            retry_backoff: Duration::from_millis(100),
            queue_notify_limit: 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SweeperConfig {
    pub sweep_interval: Duration,
    pub stale_after: Duration,
    pub maintenance_interval: Duration,
    pub purge_interval: Duration,
    pub notification_retention: Duration,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(30),
            stale_after: Duration::from_secs(5 * 60),
            maintenance_interval: Duration::from_secs(60),
            purge_interval: Duration::from_secs(5 * 60),
            notification_retention: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_port: 3000,
            log_level: "info".to_string(),
            event_buffer_size: 1024,
            queue_table_enabled: true,
            dispatch: DispatchConfig::default(),
            sweeper: SweeperConfig::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        let _ = dotenvy::dotenv();

        let dispatch_defaults = DispatchConfig::default();
        let sweeper_defaults = SweeperConfig::default();

        let dispatch = DispatchConfig {
            auto_assign_threshold: parse_or_default(
                "AUTO_ASSIGN_THRESHOLD",
                dispatch_defaults.auto_assign_threshold,
            )?,
            broadcast_fanout: parse_or_default("BROADCAST_FANOUT", dispatch_defaults.broadcast_fanout)?,
            search_radius_miles: parse_or_default(
                "SEARCH_RADIUS_MILES",
                dispatch_defaults.search_radius_miles,
            )?,
            rejection_radius_miles: parse_or_default(
                "REJECTION_RADIUS_MILES",
                dispatch_defaults.rejection_radius_miles,
            )?,
            max_assign_attempts: parse_or_default(
                "MAX_ASSIGN_ATTEMPTS",
                dispatch_defaults.max_assign_attempts,
            )?,
            collaborator_retries: parse_or_default(
                "COLLABORATOR_RETRIES",
                dispatch_defaults.collaborator_retries,
            )?,
            retry_backoff: Duration::from_millis(parse_or_default("RETRY_BACKOFF_MS", 100)?),
            queue_notify_limit: parse_or_default(
                "QUEUE_NOTIFY_LIMIT",
                dispatch_defaults.queue_notify_limit,
            )?,
        };

        if !(0.0..=1.0).contains(&dispatch.auto_assign_threshold) {
            return Err(AppError::Internal(
                "invalid AUTO_ASSIGN_THRESHOLD: must be within [0, 1]".to_string(),
            ));
        }
        if dispatch.max_assign_attempts == 0 {
            return Err(AppError::Internal(
                "invalid MAX_ASSIGN_ATTEMPTS: must be > 0".to_string(),
            ));
        }

        let sweeper = SweeperConfig {
            sweep_interval: secs("SWEEP_INTERVAL_SECS", sweeper_defaults.sweep_interval)?,
            stale_after: secs("STALE_AFTER_SECS", sweeper_defaults.stale_after)?,
            maintenance_interval: secs(
                "MAINTENANCE_INTERVAL_SECS",
                sweeper_defaults.maintenance_interval,
            )?,
            purge_interval: secs("PURGE_INTERVAL_SECS", sweeper_defaults.purge_interval)?,
            notification_retention: Duration::from_secs(
                parse_or_default::<u64>("NOTIFICATION_RETENTION_DAYS", 7)? * 24 * 60 * 60,
            ),
        };

        Ok(Self {
            http_port: parse_or_default("HTTP_PORT", 3000)?,
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            event_buffer_size: parse_or_default("EVENT_BUFFER_SIZE", 1024)?,
            queue_table_enabled: parse_or_default("QUEUE_TABLE_ENABLED", true)?,
            dispatch,
            sweeper,
        })
    }
}

fn secs(key: &str, default: Duration) -> Result<Duration, AppError> {
    let value: u64 = parse_or_default(key, default.as_secs())?;
    if value == 0 {
        return Err(AppError::Internal(format!("invalid {key}: must be > 0")));
    }
    Ok(Duration::from_secs(value))
}

fn parse_or_default<T>(key: &str, default: T) -> Result<T, AppError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|err| AppError::Internal(format!("invalid {key}: {err}"))),
        Err(_) => Ok(default),
    }
}
