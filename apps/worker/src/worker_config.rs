use std::env;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use kestrel_application::{
    ControllerSettings, DEFAULT_KEY_NAMESPACE, InstanceSettings, KeyNamespace, ScanSchedule,
};
use kestrel_core::{AppError, AppResult};
use tracing_subscriber::EnvFilter;

/// Runtime configuration of one worker process.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub redis_url: Option<String>,
    pub database_url: Option<String>,
    pub key_namespace: String,
    pub worker_host: String,
    pub worker_port: u16,
    pub concurrency: usize,
    pub queue_capacity: usize,
    pub drain_grace_ms: u64,
    pub drain_timeout_ms: u64,
    pub lease_seconds: u64,
    pub renew_interval_ms: u64,
    pub scan_interval_seconds: u64,
    pub scan_jitter_seconds: u64,
    pub buildjob_processing_delay_ms: u64,
}

impl WorkerConfig {
    pub fn load() -> AppResult<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Builds the configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> AppResult<Self> {
        let redis_url = optional_value(&lookup, "REDIS_URL");
        let database_url = optional_value(&lookup, "DATABASE_URL");
        let key_namespace = optional_value(&lookup, "KESTREL_KEY_NAMESPACE")
            .unwrap_or_else(|| DEFAULT_KEY_NAMESPACE.to_owned());
        let worker_host =
            optional_value(&lookup, "WORKER_HOST").unwrap_or_else(|| "127.0.0.1".to_owned());
        let worker_port = parse_value::<u16>(&lookup, "WORKER_PORT", 3002)?;

        let config = Self {
            redis_url,
            database_url,
            key_namespace,
            worker_host,
            worker_port,
            concurrency: parse_value(&lookup, "WORKER_CONCURRENCY", 100)?,
            queue_capacity: parse_value(&lookup, "WORKER_QUEUE_CAPACITY", 2000)?,
            drain_grace_ms: parse_value(&lookup, "WORKER_DRAIN_GRACE_MS", 2000)?,
            drain_timeout_ms: parse_value(&lookup, "WORKER_DRAIN_TIMEOUT_MS", 15_000)?,
            lease_seconds: parse_value(&lookup, "INSTANCE_LEASE_SECONDS", 6)?,
            renew_interval_ms: parse_value(&lookup, "INSTANCE_RENEW_INTERVAL_MS", 3000)?,
            scan_interval_seconds: parse_value(&lookup, "TAKEOVER_SCAN_INTERVAL_SECONDS", 30)?,
            scan_jitter_seconds: parse_value(&lookup, "TAKEOVER_SCAN_JITTER_SECONDS", 20)?,
            buildjob_processing_delay_ms: parse_value(
                &lookup,
                "BUILDJOB_PROCESSING_DELAY_MS",
                10_000,
            )?,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> AppResult<()> {
        for (name, value) in [
            ("WORKER_CONCURRENCY", self.concurrency as u64),
            ("WORKER_QUEUE_CAPACITY", self.queue_capacity as u64),
            ("WORKER_DRAIN_TIMEOUT_MS", self.drain_timeout_ms),
            ("INSTANCE_LEASE_SECONDS", self.lease_seconds),
            ("INSTANCE_RENEW_INTERVAL_MS", self.renew_interval_ms),
            ("TAKEOVER_SCAN_INTERVAL_SECONDS", self.scan_interval_seconds),
        ] {
            if value == 0 {
                return Err(AppError::Validation(format!(
                    "{name} must be greater than zero"
                )));
            }
        }

        if self.renew_interval_ms >= self.lease_seconds.saturating_mul(1000) {
            return Err(AppError::Validation(
                "INSTANCE_RENEW_INTERVAL_MS must be shorter than INSTANCE_LEASE_SECONDS"
                    .to_owned(),
            ));
        }

        Ok(())
    }

    pub fn listen_address(&self) -> AppResult<SocketAddr> {
        let host = IpAddr::from_str(&self.worker_host).map_err(|error| {
            AppError::Validation(format!(
                "invalid WORKER_HOST '{}': {error}",
                self.worker_host
            ))
        })?;

        Ok(SocketAddr::from((host, self.worker_port)))
    }

    pub fn key_namespace(&self) -> AppResult<KeyNamespace> {
        KeyNamespace::new(self.key_namespace.as_str())
    }

    pub fn controller_settings(&self) -> ControllerSettings {
        ControllerSettings {
            concurrency: self.concurrency,
            queue_capacity: self.queue_capacity,
            drain_grace: Duration::from_millis(self.drain_grace_ms),
            worker_drain_timeout: Duration::from_millis(self.drain_timeout_ms),
        }
    }

    pub fn instance_settings(&self) -> InstanceSettings {
        InstanceSettings {
            lease_ttl: Duration::from_secs(self.lease_seconds),
            renew_interval: Duration::from_millis(self.renew_interval_ms),
            scan_schedule: ScanSchedule {
                base_interval: Duration::from_secs(self.scan_interval_seconds),
                jitter: Duration::from_secs(self.scan_jitter_seconds),
            },
            ..InstanceSettings::default()
        }
    }

    pub fn buildjob_processing_delay(&self) -> Duration {
        Duration::from_millis(self.buildjob_processing_delay_ms)
    }
}

pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}

fn optional_value(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    lookup(name)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn parse_value<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> AppResult<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match optional_value(lookup, name) {
        Some(value) => value.parse::<T>().map_err(|error| {
            AppError::Validation(format!("invalid {name} value '{value}': {error}"))
        }),
        None => Ok(default),
    }
}
