use std::{
    collections::HashMap,
    fmt::Display,
    str::FromStr,
    time::Duration,
};

use thiserror::Error;

use crate::{
    dentry::{DEFAULT_CACHE_SIZE, DEFAULT_MAX_PATH_DEPTH, ResolverConfig},
    pipeline::{ErrorPolicy, PipelineConfig, ShutdownPolicy},
    reorderer::{DEFAULT_POOL_CAPACITY, DEFAULT_RETENTION, ReOrdererConfig},
};

/// Key/value pairs of a single configuration file section.
#[derive(Debug, Clone, Default)]
pub struct SectionConfig {
    inner: HashMap<String, String>,
}

#[derive(Error, Debug, Clone)]
pub enum ConfigError {
    #[error("field {field} is required")]
    RequiredValue { field: String },
    #[error("{value} is not a valid value for field {field}: {err}")]
    InvalidValue {
        field: String,
        value: String,
        err: String,
    },
}

impl SectionConfig {
    /// Inserts a new configuration value.
    pub fn insert(&mut self, key: String, value: String) -> Option<String> {
        self.inner.insert(key, value)
    }

    /// Returns a typed configuration value.
    pub fn required<T>(&self, config_name: &str) -> Result<T, ConfigError>
    where
        T: FromStr,
        <T as FromStr>::Err: Display,
    {
        match self.inner.get(config_name) {
            None => Err(ConfigError::RequiredValue {
                field: config_name.to_string(),
            }),
            Some(value) => parse(value, config_name),
        }
    }

    /// Returns an optional typed configuration value.
    pub fn optional<T>(&self, config_name: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        <T as FromStr>::Err: Display,
    {
        self.inner
            .get(config_name)
            .map(|value| parse(value, config_name))
            .transpose()
    }

    /// Returns a typed configuration value, or `default` if missing.
    pub fn with_default<T>(&self, config_name: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        <T as FromStr>::Err: Display,
    {
        Ok(self.optional(config_name)?.unwrap_or(default))
    }

    /// Return a comma separed list of values. Return empty vector if field is missing.
    pub fn get_list<T>(&self, config_name: &str) -> Result<Vec<T>, ConfigError>
    where
        T: FromStr,
        <T as FromStr>::Err: Display,
    {
        self.inner
            .get(config_name)
            .iter()
            .flat_map(|config| config.split(','))
            .filter(|item| !item.trim().is_empty())
            .map(|item| parse(item.trim(), config_name))
            .collect()
    }
}

impl FromIterator<(String, String)> for SectionConfig {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self {
            inner: iter.into_iter().collect(),
        }
    }
}

fn parse<T>(value: &str, config_name: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    <T as FromStr>::Err: Display,
{
    T::from_str(value).map_err(|err| ConfigError::InvalidValue {
        field: config_name.to_string(),
        value: value.to_string(),
        err: err.to_string(),
    })
}

fn positive<T>(value: T, config_name: &str) -> Result<T, ConfigError>
where
    T: Default + PartialEq + Display,
{
    if value == T::default() {
        return Err(ConfigError::InvalidValue {
            field: config_name.to_string(),
            value: value.to_string(),
            err: "must be greater than zero".to_string(),
        });
    }
    Ok(value)
}

impl TryFrom<&SectionConfig> for ResolverConfig {
    type Error = ConfigError;

    fn try_from(config: &SectionConfig) -> Result<Self, Self::Error> {
        Ok(ResolverConfig {
            cache_size: positive(
                config.with_default("cache_size", DEFAULT_CACHE_SIZE)?,
                "cache_size",
            )?,
            max_path_depth: positive(
                config.with_default("max_path_depth", DEFAULT_MAX_PATH_DEPTH)?,
                "max_path_depth",
            )?,
        })
    }
}

impl TryFrom<&SectionConfig> for ReOrdererConfig {
    type Error = ConfigError;

    /// Without an explicit `cpus` value there is one partition per CPU of
    /// the machine. A `retention` of 0 would release records in the tick
    /// that received them, so it is refused.
    fn try_from(config: &SectionConfig) -> Result<Self, Self::Error> {
        Ok(ReOrdererConfig {
            partitions: positive(config.with_default("cpus", num_cpus::get())?, "cpus")?,
            retention: positive(
                config.with_default("retention", DEFAULT_RETENTION)?,
                "retention",
            )?,
            pool_capacity: config.with_default("pool_capacity", DEFAULT_POOL_CAPACITY)?,
        })
    }
}

impl PipelineConfig {
    /// Build from the `[reorderer]` and `[dentry-resolver]` sections.
    pub fn from_sections(
        reorderer: &SectionConfig,
        resolver: &SectionConfig,
    ) -> Result<Self, ConfigError> {
        let tick_interval_ms = positive(
            reorderer.with_default("tick_interval_ms", 50_u64)?,
            "tick_interval_ms",
        )?;
        Ok(PipelineConfig {
            tick_interval: Duration::from_millis(tick_interval_ms),
            stats_interval: reorderer.with_default("stats_interval", 100)?,
            shutdown_policy: reorderer.with_default("shutdown_policy", ShutdownPolicy::Drain)?,
            reorderer: ReOrdererConfig::try_from(reorderer)?,
            resolver: ResolverConfig::try_from(resolver)?,
            on_resolution_error: resolver
                .with_default("on_resolution_error", ErrorPolicy::Annotate)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn section(values: &[(&str, &str)]) -> SectionConfig {
        values
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect()
    }

    #[test]
    fn typed_getters() {
        let config = section(&[("size", "12"), ("list", "a, b,,c"), ("bad", "x")]);
        assert_eq!(config.required::<u32>("size").unwrap(), 12);
        assert_eq!(config.optional::<u32>("missing").unwrap(), None);
        assert_eq!(config.with_default("missing", 3_u32).unwrap(), 3);
        assert_eq!(
            config.get_list::<String>("list").unwrap(),
            vec!["a", "b", "c"]
        );
        assert!(config.get_list::<String>("missing").unwrap().is_empty());
        assert!(matches!(
            config.required::<u32>("missing"),
            Err(ConfigError::RequiredValue { .. })
        ));
        assert!(matches!(
            config.required::<u32>("bad"),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn pipeline_defaults() {
        let config =
            PipelineConfig::from_sections(&SectionConfig::default(), &SectionConfig::default())
                .unwrap();
        assert_eq!(config.tick_interval, Duration::from_millis(50));
        assert_eq!(config.reorderer.retention, DEFAULT_RETENTION);
        assert_eq!(config.reorderer.partitions, num_cpus::get());
        assert_eq!(config.resolver.cache_size, DEFAULT_CACHE_SIZE);
        assert_eq!(config.shutdown_policy, ShutdownPolicy::Drain);
        assert_eq!(config.on_resolution_error, ErrorPolicy::Annotate);
    }

    #[test]
    fn pipeline_overrides() {
        let reorderer = section(&[
            ("tick_interval_ms", "10"),
            ("retention", "2"),
            ("cpus", "4"),
            ("shutdown_policy", "discard"),
        ]);
        let resolver = section(&[("cache_size", "16"), ("on_resolution_error", "drop")]);
        let config = PipelineConfig::from_sections(&reorderer, &resolver).unwrap();
        assert_eq!(config.tick_interval, Duration::from_millis(10));
        assert_eq!(config.reorderer.partitions, 4);
        assert_eq!(config.reorderer.retention, 2);
        assert_eq!(config.resolver.cache_size, 16);
        assert_eq!(config.shutdown_policy, ShutdownPolicy::Discard);
        assert_eq!(config.on_resolution_error, ErrorPolicy::Drop);
    }

    #[test]
    fn invalid_values() {
        let resolver = section(&[("cache_size", "0")]);
        assert!(matches!(
            ResolverConfig::try_from(&resolver),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "cache_size"
        ));
        let reorderer = section(&[("shutdown_policy", "later")]);
        assert!(PipelineConfig::from_sections(&reorderer, &SectionConfig::default()).is_err());
        let reorderer = section(&[("retention", "0")]);
        assert!(matches!(
            ReOrdererConfig::try_from(&reorderer),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "retention"
        ));
    }
}
