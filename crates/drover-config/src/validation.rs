//! Configuration validation module.
//!
//! Provides comprehensive validation for all configuration values,
//! failing fast on invalid configuration rather than at runtime.

use crate::{AppConfig, QueueSettings, StoreBackend};
use std::fmt;
use url::Url;

/// Configuration validation error variants.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValidationError {
    /// Queue names are used in store keys and must be non-empty.
    EmptyQueueName,
    /// Queue name contains characters that would break key layout.
    InvalidQueueName { name: String },
    /// A queue must run at least one worker slot.
    ZeroConcurrency { queue: String },
    /// A queue needs at least one priority tier.
    ZeroPriorityLevels { queue: String },
    /// A job must be allowed at least one execution.
    ZeroMaxAttempts { queue: String },
    /// Backoff must not shrink between attempts.
    InvalidMultiplier { queue: String, value: f64 },
    /// The first retry delay exceeds the cap.
    BaseDelayExceedsMax { queue: String, base: u64, max: u64 },
    /// The claim lock must outlive the handler deadline.
    LockTtlTooShort { queue: String, lock_ttl_ms: u64, job_timeout_ms: u64 },
    /// Idle poll bounds are inverted.
    InvalidPollBounds { queue: String, min: u64, max: u64 },
    /// Timeout value must be positive.
    NonPositiveTimeout { name: String, value: u64 },
    /// Pool size must be positive.
    ZeroPoolSize,
    /// Pool size exceeds maximum allowed.
    PoolSizeTooLarge { value: usize, maximum: usize },
    /// URL format is invalid.
    InvalidUrl { url_type: String, message: String },
    /// Sampling ratio must be between 0.0 and 1.0.
    InvalidSamplingRatio { value: f64 },
    /// Metrics listen address is not a socket address.
    InvalidListenAddr { value: String },
}

impl fmt::Display for ConfigValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyQueueName => write!(f, "Queue name must not be empty"),
            Self::InvalidQueueName { name } => {
                write!(f, "Queue name '{}' must not contain ':', '{{' or '}}'", name)
            }
            Self::ZeroConcurrency { queue } => {
                write!(f, "Queue '{}': concurrency must be at least 1", queue)
            }
            Self::ZeroPriorityLevels { queue } => {
                write!(f, "Queue '{}': priority_levels must be at least 1", queue)
            }
            Self::ZeroMaxAttempts { queue } => {
                write!(f, "Queue '{}': max_attempts must be at least 1", queue)
            }
            Self::InvalidMultiplier { queue, value } => {
                write!(f, "Queue '{}': multiplier {} must be >= 1.0", queue, value)
            }
            Self::BaseDelayExceedsMax { queue, base, max } => {
                write!(
                    f,
                    "Queue '{}': base_delay_ms ({}) cannot exceed max_delay_ms ({})",
                    queue, base, max
                )
            }
            Self::LockTtlTooShort {
                queue,
                lock_ttl_ms,
                job_timeout_ms,
            } => {
                write!(
                    f,
                    "Queue '{}': lock_ttl_ms ({}) must be greater than job_timeout_ms ({})",
                    queue, lock_ttl_ms, job_timeout_ms
                )
            }
            Self::InvalidPollBounds { queue, min, max } => {
                write!(
                    f,
                    "Queue '{}': poll_interval_min_ms ({}) cannot exceed poll_interval_max_ms ({})",
                    queue, min, max
                )
            }
            Self::NonPositiveTimeout { name, value } => {
                write!(f, "Timeout '{}' must be positive, got {}", name, value)
            }
            Self::ZeroPoolSize => write!(f, "Redis pool_size must be at least 1"),
            Self::PoolSizeTooLarge { value, maximum } => {
                write!(f, "Pool size {} exceeds maximum allowed ({})", value, maximum)
            }
            Self::InvalidUrl { url_type, message } => {
                write!(f, "Invalid {} URL: {}", url_type, message)
            }
            Self::InvalidSamplingRatio { value } => {
                write!(
                    f,
                    "Invalid sampling ratio: {} (must be between 0.0 and 1.0)",
                    value
                )
            }
            Self::InvalidListenAddr { value } => {
                write!(f, "Invalid metrics listen address: '{}'", value)
            }
        }
    }
}

impl std::error::Error for ConfigValidationError {}

/// Result of configuration validation containing all errors found.
#[derive(Debug)]
struct ValidationResult {
    errors: Vec<ConfigValidationError>,
}

impl ValidationResult {
    fn new() -> Self {
        Self { errors: Vec::new() }
    }

    fn add_error(&mut self, error: ConfigValidationError) {
        self.errors.push(error);
    }

    fn into_result(self) -> Result<(), Vec<ConfigValidationError>> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(self.errors)
        }
    }
}

/// Configuration validator.
pub struct ConfigValidator;

impl ConfigValidator {
    /// Maximum connection pool size.
    const MAX_POOL_SIZE: usize = 1000;

    /// Validates the entire application configuration.
    ///
    /// Returns Ok(()) if valid, or Err with all validation errors found.
    pub fn validate(config: &AppConfig) -> Result<(), Vec<ConfigValidationError>> {
        let mut result = ValidationResult::new();

        if config.store.backend == StoreBackend::Redis {
            Self::validate_redis(&config.redis, &mut result);
        }
        Self::validate_manager(&config.manager, &mut result);
        Self::validate_telemetry(&config.telemetry, &mut result);
        Self::validate_metrics(&config.metrics, &mut result);

        for (name, settings) in &config.queues {
            Self::validate_queue(name, settings, &mut result);
        }

        result.into_result()
    }

    /// Validates a single queue's settings.
    pub fn validate_queue_settings(
        name: &str,
        settings: &QueueSettings,
    ) -> Result<(), Vec<ConfigValidationError>> {
        let mut result = ValidationResult::new();
        Self::validate_queue(name, settings, &mut result);
        result.into_result()
    }

    fn validate_queue(name: &str, settings: &QueueSettings, result: &mut ValidationResult) {
        if name.is_empty() {
            result.add_error(ConfigValidationError::EmptyQueueName);
        } else if name.contains([':', '{', '}']) {
            result.add_error(ConfigValidationError::InvalidQueueName {
                name: name.to_string(),
            });
        }

        let queue = name.to_string();

        if settings.concurrency == 0 {
            result.add_error(ConfigValidationError::ZeroConcurrency { queue: queue.clone() });
        }
        if settings.priority_levels == 0 {
            result.add_error(ConfigValidationError::ZeroPriorityLevels { queue: queue.clone() });
        }
        if settings.max_attempts == 0 {
            result.add_error(ConfigValidationError::ZeroMaxAttempts { queue: queue.clone() });
        }
        if settings.multiplier.is_nan() || settings.multiplier < 1.0 {
            result.add_error(ConfigValidationError::InvalidMultiplier {
                queue: queue.clone(),
                value: settings.multiplier,
            });
        }
        if settings.base_delay_ms > settings.max_delay_ms {
            result.add_error(ConfigValidationError::BaseDelayExceedsMax {
                queue: queue.clone(),
                base: settings.base_delay_ms,
                max: settings.max_delay_ms,
            });
        }
        if settings.job_timeout_ms == 0 {
            result.add_error(ConfigValidationError::NonPositiveTimeout {
                name: format!("queues.{}.job_timeout_ms", name),
                value: 0,
            });
        }
        if settings.lock_ttl_ms == 0 {
            result.add_error(ConfigValidationError::NonPositiveTimeout {
                name: format!("queues.{}.lock_ttl_ms", name),
                value: 0,
            });
        } else if settings.lock_ttl_ms <= settings.job_timeout_ms {
            result.add_error(ConfigValidationError::LockTtlTooShort {
                queue: queue.clone(),
                lock_ttl_ms: settings.lock_ttl_ms,
                job_timeout_ms: settings.job_timeout_ms,
            });
        }
        if settings.poll_interval_min_ms > settings.poll_interval_max_ms {
            result.add_error(ConfigValidationError::InvalidPollBounds {
                queue,
                min: settings.poll_interval_min_ms,
                max: settings.poll_interval_max_ms,
            });
        }
        if settings.promoter_max_interval_ms == 0 {
            result.add_error(ConfigValidationError::NonPositiveTimeout {
                name: format!("queues.{}.promoter_max_interval_ms", name),
                value: 0,
            });
        }
    }

    fn validate_redis(config: &crate::RedisConfig, result: &mut ValidationResult) {
        match Url::parse(&config.url) {
            Ok(url) if url.scheme() == "redis" || url.scheme() == "rediss" => {}
            Ok(url) => result.add_error(ConfigValidationError::InvalidUrl {
                url_type: "redis".to_string(),
                message: format!("Unsupported scheme '{}'", url.scheme()),
            }),
            Err(e) => result.add_error(ConfigValidationError::InvalidUrl {
                url_type: "redis".to_string(),
                message: e.to_string(),
            }),
        }

        if config.pool_size == 0 {
            result.add_error(ConfigValidationError::ZeroPoolSize);
        } else if config.pool_size > Self::MAX_POOL_SIZE {
            result.add_error(ConfigValidationError::PoolSizeTooLarge {
                value: config.pool_size,
                maximum: Self::MAX_POOL_SIZE,
            });
        }

        if config.connect_timeout_secs == 0 {
            result.add_error(ConfigValidationError::NonPositiveTimeout {
                name: "redis.connect_timeout_secs".to_string(),
                value: 0,
            });
        }
    }

    fn validate_manager(config: &crate::ManagerConfig, result: &mut ValidationResult) {
        if config.drain_timeout_secs == 0 {
            result.add_error(ConfigValidationError::NonPositiveTimeout {
                name: "manager.drain_timeout_secs".to_string(),
                value: 0,
            });
        }
    }

    fn validate_telemetry(config: &drover_core::TelemetryConfig, result: &mut ValidationResult) {
        if !(0.0..=1.0).contains(&config.sampling_ratio) {
            result.add_error(ConfigValidationError::InvalidSamplingRatio {
                value: config.sampling_ratio,
            });
        }

        if let Some(ref endpoint) = config.otlp_endpoint {
            if Url::parse(endpoint).is_err() {
                result.add_error(ConfigValidationError::InvalidUrl {
                    url_type: "otlp_endpoint".to_string(),
                    message: format!("Invalid URL format: {}", endpoint),
                });
            }
        }
    }

    fn validate_metrics(config: &crate::MetricsConfig, result: &mut ValidationResult) {
        if config.enabled && config.listen_addr.parse::<std::net::SocketAddr>().is_err() {
            result.add_error(ConfigValidationError::InvalidListenAddr {
                value: config.listen_addr.clone(),
            });
        }
    }
}

/// Formats validation errors for display.
pub fn format_validation_errors(errors: &[ConfigValidationError]) -> String {
    let mut output = String::from("Configuration validation failed:\n");
    for (i, error) in errors.iter().enumerate() {
        output.push_str(&format!("  {}. {}\n", i + 1, error));
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.queues.insert("emails".to_string(), QueueSettings::default());
        config
    }

    #[test]
    fn test_valid_config() {
        assert!(ConfigValidator::validate(&valid_config()).is_ok());
    }

    #[test]
    fn test_zero_concurrency() {
        let mut config = valid_config();
        config.queues.get_mut("emails").unwrap().concurrency = 0;

        let errors = ConfigValidator::validate(&config).unwrap_err();
        assert!(errors.iter().any(|e| matches!(
            e,
            ConfigValidationError::ZeroConcurrency { queue } if queue == "emails"
        )));
    }

    #[test]
    fn test_invalid_queue_name() {
        let mut config = valid_config();
        config.queues.insert("bad:name".to_string(), QueueSettings::default());

        let errors = ConfigValidator::validate(&config).unwrap_err();
        assert!(errors
            .iter()
            .any(|e| matches!(e, ConfigValidationError::InvalidQueueName { .. })));
    }

    #[test]
    fn test_lock_ttl_must_exceed_job_timeout() {
        let settings = QueueSettings {
            lock_ttl_ms: 1_000,
            job_timeout_ms: 1_000,
            ..Default::default()
        };

        let errors = ConfigValidator::validate_queue_settings("emails", &settings).unwrap_err();
        assert!(errors
            .iter()
            .any(|e| matches!(e, ConfigValidationError::LockTtlTooShort { .. })));
    }

    #[test]
    fn test_retry_settings() {
        let settings = QueueSettings {
            max_attempts: 0,
            multiplier: 0.5,
            base_delay_ms: 10_000,
            max_delay_ms: 100,
            ..Default::default()
        };

        let errors = ConfigValidator::validate_queue_settings("emails", &settings).unwrap_err();
        assert_eq!(errors.len(), 3);
    }

    #[test]
    fn test_invalid_redis_url() {
        let mut config = valid_config();
        config.redis.url = "http://localhost:6379".to_string();

        let errors = ConfigValidator::validate(&config).unwrap_err();
        assert!(errors.iter().any(|e| matches!(
            e,
            ConfigValidationError::InvalidUrl { url_type, .. } if url_type == "redis"
        )));
    }

    #[test]
    fn test_redis_ignored_for_memory_backend() {
        let mut config = valid_config();
        config.store.backend = StoreBackend::Memory;
        config.redis.url = "not a url".to_string();
        config.redis.pool_size = 0;

        assert!(ConfigValidator::validate(&config).is_ok());
    }

    #[test]
    fn test_invalid_sampling_ratio() {
        let mut config = valid_config();
        config.telemetry.sampling_ratio = 1.5;

        let errors = ConfigValidator::validate(&config).unwrap_err();
        assert!(errors
            .iter()
            .any(|e| matches!(e, ConfigValidationError::InvalidSamplingRatio { .. })));
    }

    #[test]
    fn test_invalid_metrics_addr() {
        let mut config = valid_config();
        config.metrics.enabled = true;
        config.metrics.listen_addr = "localhost".to_string();

        let errors = ConfigValidator::validate(&config).unwrap_err();
        assert!(errors
            .iter()
            .any(|e| matches!(e, ConfigValidationError::InvalidListenAddr { .. })));
    }

    #[test]
    fn test_multiple_errors() {
        let mut config = valid_config();
        config.redis.pool_size = 0;
        config.manager.drain_timeout_secs = 0;
        config.queues.get_mut("emails").unwrap().priority_levels = 0;

        let errors = ConfigValidator::validate(&config).unwrap_err();
        assert!(errors.len() >= 3);
    }

    #[test]
    fn test_format_validation_errors() {
        let errors = vec![
            ConfigValidationError::ZeroPoolSize,
            ConfigValidationError::ZeroConcurrency {
                queue: "emails".to_string(),
            },
        ];

        let output = format_validation_errors(&errors);
        assert!(output.contains("pool_size"));
        assert!(output.contains("concurrency"));
    }
}
