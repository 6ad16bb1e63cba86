use std::env;
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use queue_worker::messaging::ConsumerSettings;
use queue_worker::storage::RetryPolicy;
use queue_worker::worker::ShutdownSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecretSource {
    Env,
    File { dir: PathBuf },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub rabbitmq_url: String,
    pub service_name: String,
    pub queue_name: String,
    pub rust_log: String,
    pub log_format: LogFormat,
    pub metrics_port: u16,
    pub visibility_timeout: Duration,
    pub idle_delay: Duration,
    pub drain_delay: Duration,
    pub shutdown_grace: Duration,
    pub max_delivery_attempts: Option<u32>,
    pub lease_renewal_interval: Option<Duration>,
    pub secret_source: SecretSource,
    pub secret_ttl: Duration,
    pub storage_secret_name: String,
    pub storage_max_retries: u32,
    pub storage_retry_delay: Duration,
    pub storage_backoff_multiplier: f64,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars(lookup);

        let rabbitmq_url = vars.required("RABBITMQ_URL")?;
        let service_name = vars.required("SERVICE_NAME")?;

        let log_format = match vars.get("LOG_FORMAT").as_deref() {
            None | Some("text") => LogFormat::Text,
            Some("json") => LogFormat::Json,
            Some(other) => return Err(ConfigError::invalid("LOG_FORMAT", other, "expected text or json")),
        };

        let secret_source = match vars.get("SECRET_PROVIDER").as_deref() {
            None | Some("env") => SecretSource::Env,
            Some("file") => SecretSource::File {
                dir: PathBuf::from(vars.required("SECRETS_DIR")?),
            },
            Some(other) => return Err(ConfigError::invalid("SECRET_PROVIDER", other, "expected env or file")),
        };

        let storage_backoff_multiplier: f64 = vars.parsed("STORAGE_BACKOFF_MULTIPLIER", 1.0)?;
        if !storage_backoff_multiplier.is_finite() || storage_backoff_multiplier < 1.0 {
            return Err(ConfigError::invalid(
                "STORAGE_BACKOFF_MULTIPLIER",
                storage_backoff_multiplier,
                "must be a finite number >= 1.0",
            ));
        }

        let visibility_timeout_secs: u64 = vars.parsed("VISIBILITY_TIMEOUT_SECS", 30)?;
        if visibility_timeout_secs == 0 {
            return Err(ConfigError::invalid("VISIBILITY_TIMEOUT_SECS", 0, "must be greater than zero"));
        }

        let idle_delay_ms: u64 = vars.parsed("IDLE_DELAY_MS", 2000)?;
        if idle_delay_ms == 0 {
            return Err(ConfigError::invalid("IDLE_DELAY_MS", 0, "must be greater than zero"));
        }

        let lease_renewal_secs: Option<u64> = vars.parsed_opt("LEASE_RENEWAL_SECS")?;
        if let Some(secs) = lease_renewal_secs {
            if secs == 0 || secs >= visibility_timeout_secs {
                return Err(ConfigError::invalid(
                    "LEASE_RENEWAL_SECS",
                    secs,
                    format!("must be between 1 and {}", visibility_timeout_secs - 1),
                ));
            }
        }

        Ok(Self {
            rabbitmq_url,
            service_name,
            queue_name: vars.get("QUEUE_NAME").unwrap_or_else(|| "orders".to_string()),
            rust_log: vars.get("RUST_LOG").unwrap_or_else(|| "info".to_string()),
            log_format,
            metrics_port: vars.parsed("METRICS_PORT", 9090)?,
            visibility_timeout: Duration::from_secs(visibility_timeout_secs),
            idle_delay: Duration::from_millis(idle_delay_ms),
            drain_delay: Duration::from_millis(vars.parsed("DRAIN_DELAY_MS", 2000)?),
            shutdown_grace: Duration::from_secs(vars.parsed("SHUTDOWN_GRACE_SECS", 10)?),
            max_delivery_attempts: vars.parsed_opt("MAX_DELIVERY_ATTEMPTS")?,
            lease_renewal_interval: lease_renewal_secs.map(Duration::from_secs),
            secret_source,
            secret_ttl: Duration::from_secs(vars.parsed("SECRET_TTL_SECS", 1800)?),
            storage_secret_name: vars
                .get("STORAGE_SECRET_NAME")
                .unwrap_or_else(|| "StorageConnectionString".to_string()),
            storage_max_retries: vars.parsed("STORAGE_MAX_RETRIES", 3)?,
            storage_retry_delay: Duration::from_millis(vars.parsed("STORAGE_RETRY_DELAY_MS", 1000)?),
            storage_backoff_multiplier,
        })
    }

    pub fn consumer_settings(&self) -> ConsumerSettings {
        ConsumerSettings {
            visibility_timeout: self.visibility_timeout,
            idle_delay: self.idle_delay,
            max_delivery_attempts: self.max_delivery_attempts,
            lease_renewal_interval: self.lease_renewal_interval,
            ..Default::default()
        }
    }

    pub fn shutdown_settings(&self) -> ShutdownSettings {
        ShutdownSettings {
            drain_delay: self.drain_delay,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(
            self.storage_max_retries,
            self.storage_retry_delay,
            self.storage_backoff_multiplier,
        )
    }
}

struct Vars<F>(F);

impl<F> Vars<F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Unset and blank values both count as missing.
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }

    fn required(&self, key: &'static str) -> Result<String, ConfigError> {
        self.get(key).ok_or(ConfigError::MissingRequired(key))
    }

    fn parsed<T>(&self, key: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: Display,
    {
        Ok(self.parsed_opt(key)?.unwrap_or(default))
    }

    fn parsed_opt<T>(&self, key: &'static str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: Display,
    {
        self.get(key)
            .map(|raw| raw.parse().map_err(|e: T::Err| ConfigError::invalid(key, &raw, e)))
            .transpose()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingRequired(&'static str),

    #[error("Invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    fn invalid(key: &'static str, value: impl Display, reason: impl Display) -> Self {
        Self::Invalid {
            key,
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }
}
