use event_bus::{
    AckMode, DeliveryConfig, OverflowPolicy, PublisherConfig, ReconnectPolicy, RetryConfig,
};
use std::env;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var}='{value}' is invalid: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("inconsistent configuration: {0}")]
    Inconsistent(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusType {
    Nats,
    /// Dev/test only: an in-process log that keeps the most recent records
    /// per topic and loses everything on restart
    InMemory,
}

impl FromStr for BusType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "nats" => Ok(BusType::Nats),
            "inmemory" => Ok(BusType::InMemory),
            _ => Err("must be 'nats' or 'inmemory'".to_string()),
        }
    }
}

/// Application configuration parsed from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub bus_type: BusType,
    pub nats_url: String,
    pub topic: String,
    pub ack_mode: AckMode,

    // Broker sessions
    pub pool_size: usize,
    pub reconnect: ReconnectPolicy,

    pub publisher: PublisherConfig,
    pub delivery: DeliveryConfig,

    // JetStream stream provisioned for the topic
    pub stream_max_age: Duration,
    pub stream_duplicate_window: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key lookup; unset keys take their defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |var: &'static str, default: &str| -> (&'static str, String) {
            (var, lookup(var).unwrap_or_else(|| default.to_string()))
        };
        let millis = |var: &'static str, default: &str| -> Result<Duration, ConfigError> {
            parse::<u64>(get(var, default)).map(Duration::from_millis)
        };

        let config = Config {
            host: get("HOST", "0.0.0.0").1,
            port: parse(get("PORT", "8080"))?,
            bus_type: parse(get("BUS_TYPE", "nats"))?,
            nats_url: get("NATS_URL", "nats://localhost:4222").1,
            topic: get("ORDERS_TOPIC", "orders_processing").1,
            ack_mode: parse(get("PUBLISH_ACK_MODE", "all"))?,

            pool_size: parse(get("NATS_POOL_SIZE", "2"))?,
            reconnect: ReconnectPolicy {
                base: millis("NATS_RECONNECT_BASE_MS", "100")?,
                max: millis("NATS_RECONNECT_MAX_MS", "10000")?,
            },

            publisher: PublisherConfig {
                ack_timeout: millis("PUBLISH_ACK_TIMEOUT_MS", "1000")?,
                linger: millis("PUBLISH_LINGER_MS", "5")?,
                batch_max_records: parse(get("PUBLISH_BATCH_MAX_RECORDS", "100"))?,
                batch_max_bytes: parse(get("PUBLISH_BATCH_MAX_BYTES", "1048576"))?,
                max_payload_bytes: parse(get("PUBLISH_MAX_PAYLOAD_BYTES", "1048576"))?,
                queue_capacity: parse(get("PUBLISH_QUEUE_CAPACITY", "1024"))?,
                overflow: parse::<OverflowPolicy>(get("PUBLISH_OVERFLOW", "block"))?,
                lanes: parse(get("PUBLISH_LANES", "4"))?,
            },
            delivery: DeliveryConfig {
                retry: RetryConfig {
                    max_attempts: parse(get("DELIVERY_MAX_ATTEMPTS", "3"))?,
                    initial_backoff: millis("DELIVERY_INITIAL_BACKOFF_MS", "100")?,
                    max_backoff: millis("DELIVERY_MAX_BACKOFF_MS", "2000")?,
                },
                deadline: millis("DELIVERY_DEADLINE_MS", "5000")?,
            },

            stream_max_age: Duration::from_secs(parse(get("STREAM_MAX_AGE_SECS", "1209600"))?),
            stream_duplicate_window: Duration::from_secs(parse(get(
                "STREAM_DUPLICATE_WINDOW_SECS",
                "120",
            ))?),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.publisher
            .validate()
            .map_err(|e| ConfigError::Inconsistent(e.to_string()))?;

        if self.topic.trim().is_empty() {
            return Err(ConfigError::Inconsistent("ORDERS_TOPIC must not be empty".into()));
        }
        if self.pool_size == 0 {
            return Err(ConfigError::Inconsistent("NATS_POOL_SIZE must be greater than 0".into()));
        }
        if self.delivery.retry.max_attempts == 0 {
            return Err(ConfigError::Inconsistent(
                "DELIVERY_MAX_ATTEMPTS must be greater than 0".into(),
            ));
        }
        if self.delivery.retry.initial_backoff > self.delivery.retry.max_backoff {
            return Err(ConfigError::Inconsistent(
                "DELIVERY_INITIAL_BACKOFF_MS exceeds DELIVERY_MAX_BACKOFF_MS".into(),
            ));
        }
        if self.delivery.deadline < self.publisher.ack_timeout {
            return Err(ConfigError::Inconsistent(format!(
                "DELIVERY_DEADLINE_MS ({}) is shorter than PUBLISH_ACK_TIMEOUT_MS ({})",
                self.delivery.deadline.as_millis(),
                self.publisher.ack_timeout.as_millis()
            )));
        }
        Ok(())
    }
}

fn parse<T>((var, value): (&'static str, String)) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        var,
        value: value.clone(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_with(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_with(&[]).unwrap();

        assert_eq!(config.port, 8080);
        assert_eq!(config.bus_type, BusType::Nats);
        assert_eq!(config.topic, "orders_processing");
        assert_eq!(config.ack_mode, AckMode::All);
        assert_eq!(config.pool_size, 2);
        assert_eq!(config.publisher.overflow, OverflowPolicy::Block);
        assert_eq!(config.publisher.ack_timeout, Duration::from_millis(1000));
        assert_eq!(config.delivery.retry.max_attempts, 3);
        assert_eq!(config.delivery.deadline, Duration::from_secs(5));
        assert_eq!(config.stream_max_age, Duration::from_secs(14 * 24 * 60 * 60));
    }

    #[test]
    fn test_overrides() {
        let config = config_with(&[
            ("BUS_TYPE", "InMemory"),
            ("PUBLISH_ACK_MODE", "1"),
            ("PUBLISH_OVERFLOW", "reject"),
            ("DELIVERY_MAX_ATTEMPTS", "5"),
        ])
        .unwrap();

        assert_eq!(config.bus_type, BusType::InMemory);
        assert_eq!(config.ack_mode, AckMode::Leader);
        assert_eq!(config.publisher.overflow, OverflowPolicy::Reject);
        assert_eq!(config.delivery.retry.max_attempts, 5);
    }

    #[test]
    fn test_invalid_value_names_variable() {
        let err = config_with(&[("PORT", "eighty")]).unwrap_err();
        assert!(err.to_string().starts_with("PORT='eighty'"), "got: {}", err);

        let err = config_with(&[("PUBLISH_ACK_MODE", "some")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "PUBLISH_ACK_MODE", .. }));
    }

    #[test]
    fn test_rejects_zero_capacity() {
        assert!(config_with(&[("PUBLISH_QUEUE_CAPACITY", "0")]).is_err());
        assert!(config_with(&[("NATS_POOL_SIZE", "0")]).is_err());
        assert!(config_with(&[("DELIVERY_MAX_ATTEMPTS", "0")]).is_err());
    }

    #[test]
    fn test_deadline_must_cover_ack_timeout() {
        let err = config_with(&[
            ("PUBLISH_ACK_TIMEOUT_MS", "2000"),
            ("DELIVERY_DEADLINE_MS", "1000"),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::Inconsistent(_)));
    }
}
