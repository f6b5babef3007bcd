use std::time::Duration;

use apm_config::{ConfigurationError, GenericConfiguration};

const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_MAX_GROUPS: usize = 10_000;
const DEFAULT_SHARDS: usize = 16;
const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration for a single aggregator.
#[derive(Clone, Debug, PartialEq)]
pub struct AggregatorConfiguration {
    enabled: bool,
    interval: Duration,
    max_groups: usize,
    shards: usize,
    publish_timeout: Duration,
}

impl AggregatorConfiguration {
    /// Creates a new `AggregatorConfiguration` with default values.
    ///
    /// The aggregator is enabled, flushes every 60 seconds, and tracks up to 10,000 groups per window.
    pub fn with_defaults() -> Self {
        Self {
            enabled: true,
            interval: DEFAULT_INTERVAL,
            max_groups: DEFAULT_MAX_GROUPS,
            shards: DEFAULT_SHARDS,
            publish_timeout: DEFAULT_PUBLISH_TIMEOUT,
        }
    }

    /// Creates a new `AggregatorConfiguration` from the keys under `aggregation.<kind>`.
    ///
    /// Missing keys take their default value, with `enabled` defaulting to `default_enabled`.
    ///
    /// # Errors
    ///
    /// If a key holds a value of the wrong type, or a value that fails validation, an error is returned.
    pub fn from_configuration(
        config: &GenericConfiguration, kind: &str, default_enabled: bool,
    ) -> Result<Self, ConfigurationError> {
        let key = |field: &str| format!("aggregation.{}.{}", kind, field);

        let mut aggregator_config = Self::with_defaults().with_enabled(default_enabled);
        if let Some(enabled) = config.try_get_typed::<bool>(&key("enabled"))? {
            aggregator_config.enabled = enabled;
        }
        if let Some(interval) = try_get_seconds(config, &key("interval"))? {
            aggregator_config.interval = interval;
        }
        if let Some(max_groups) = config.try_get_typed::<usize>(&key("max_groups"))? {
            aggregator_config.max_groups = max_groups;
        }
        if let Some(shards) = config.try_get_typed::<usize>(&key("shards"))? {
            aggregator_config.shards = shards;
        }
        if let Some(publish_timeout) = try_get_seconds(config, &key("publish_timeout"))? {
            aggregator_config.publish_timeout = publish_timeout;
        }

        aggregator_config.validate(&key(""))?;
        Ok(aggregator_config)
    }

    /// Sets whether the aggregator is enabled.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Sets the rotation interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Sets the maximum number of groups per window.
    pub fn with_max_groups(mut self, max_groups: usize) -> Self {
        self.max_groups = max_groups;
        self
    }

    /// Sets the number of bucket map shards.
    pub fn with_shards(mut self, shards: usize) -> Self {
        self.shards = shards;
        self
    }

    /// Sets how long a publish may take before it is abandoned.
    pub fn with_publish_timeout(mut self, publish_timeout: Duration) -> Self {
        self.publish_timeout = publish_timeout;
        self
    }

    /// Returns `true` if the aggregator is enabled.
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Returns the rotation interval.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Returns the maximum number of groups per window.
    pub fn max_groups(&self) -> usize {
        self.max_groups
    }

    /// Returns the number of bucket map shards.
    pub fn shards(&self) -> usize {
        self.shards
    }

    /// Returns how long a publish may take before it is abandoned.
    pub fn publish_timeout(&self) -> Duration {
        self.publish_timeout
    }

    /// Checks that every setting is usable.
    ///
    /// # Errors
    ///
    /// If the interval is zero, or the group limit or shard count is zero, an error is returned.
    pub fn validate(&self, prefix: &str) -> Result<(), ConfigurationError> {
        if self.interval.is_zero() {
            return Err(invalid_value(prefix, "interval", "must be greater than zero"));
        }
        if self.max_groups == 0 {
            return Err(invalid_value(prefix, "max_groups", "must be at least 1"));
        }
        if self.shards == 0 {
            return Err(invalid_value(prefix, "shards", "must be at least 1"));
        }
        Ok(())
    }
}

fn invalid_value(prefix: &str, field: &str, reason: &str) -> ConfigurationError {
    ConfigurationError::InvalidValue {
        field: format!("{}{}", prefix, field),
        reason: reason.to_string(),
    }
}

fn try_get_seconds(config: &GenericConfiguration, key: &str) -> Result<Option<Duration>, ConfigurationError> {
    match config.try_get_typed::<f64>(key)? {
        None => Ok(None),
        Some(secs) => Duration::try_from_secs_f64(secs)
            .map(Some)
            .map_err(|e| ConfigurationError::InvalidValue {
                field: key.to_string(),
                reason: e.to_string(),
            }),
    }
}

/// Configuration for every aggregator.
#[derive(Clone, Debug, PartialEq)]
pub struct AggregationConfiguration {
    /// Transaction metrics.
    pub transactions: AggregatorConfiguration,

    /// Service destination metrics.
    pub service_destinations: AggregatorConfiguration,
}

impl AggregationConfiguration {
    /// Creates a new `AggregationConfiguration` from the given configuration.
    ///
    /// Transaction metrics are enabled unless configured otherwise, and service destination metrics are disabled unless
    /// configured otherwise.
    ///
    /// # Errors
    ///
    /// If either aggregator's configuration is invalid, an error is returned.
    pub fn from_configuration(config: &GenericConfiguration) -> Result<Self, ConfigurationError> {
        Ok(Self {
            transactions: AggregatorConfiguration::from_configuration(config, "transactions", true)?,
            service_destinations: AggregatorConfiguration::from_configuration(config, "service_destinations", false)?,
        })
    }

    /// Creates a new `AggregationConfiguration` with default values.
    pub fn with_defaults() -> Self {
        Self {
            transactions: AggregatorConfiguration::with_defaults(),
            service_destinations: AggregatorConfiguration::with_defaults().with_enabled(false),
        }
    }
}
