use std::{collections::HashMap, fs::File, path::PathBuf, str::FromStr};

use anyhow::{Context, Result, bail};
use bpf_common::program::{PERF_PAGES_DEFAULT, ProgramSpec};
use runsec_core::{ConfigError, PipelineConfig, SectionConfig};

const DEFAULT_CONFIG_FILE: &str = "/var/lib/runsec/runsec.ini";

pub const GENERAL: &str = "general";
pub const REORDERER: &str = "reorderer";
pub const DENTRY_RESOLVER: &str = "dentry-resolver";
pub const EVENT_LOGGER: &str = "event-logger";

/// Daemon configuration, one [`SectionConfig`] per `INI` section.
#[derive(Debug, Clone)]
pub struct RunsecConfig {
    config_file: PathBuf,
    sections: HashMap<String, SectionConfig>,
}

impl RunsecConfig {
    /// Load the default file, creating an empty one if needed.
    pub fn new() -> Result<Self> {
        let config_file = PathBuf::from(DEFAULT_CONFIG_FILE);
        if !config_file.exists() {
            if let Some(prefix) = config_file.parent() {
                std::fs::create_dir_all(prefix)
                    .with_context(|| format!("Error creating {}", prefix.display()))?;
            }
            File::create(&config_file)
                .with_context(|| format!("Error creating {}", config_file.display()))?;
        }
        Self::from_config_file(config_file)
    }

    /// Load a custom file, which must exist.
    pub fn with_custom_file(config_file: PathBuf) -> Result<Self> {
        if !config_file.exists() {
            bail!("Configuration file {} not found", config_file.display());
        }
        Self::from_config_file(config_file)
    }

    fn from_config_file(config_file: PathBuf) -> Result<Self> {
        let conf = ini::Ini::load_from_file(&config_file)
            .with_context(|| format!("Error loading configuration from {config_file:?}"))?;
        Ok(Self::from_ini(config_file, &conf))
    }

    fn from_ini(config_file: PathBuf, conf: &ini::Ini) -> Self {
        let mut sections: HashMap<String, SectionConfig> = HashMap::new();
        for (section, prop) in conf {
            if let Some(section) = section {
                let config = sections.entry(section.to_string()).or_default();
                for (key, value) in prop.iter() {
                    log::debug!("{}.{}={}", section, key, value);
                    config.insert(key.to_string(), value.to_string());
                }
            }
        }
        Self {
            config_file,
            sections,
        }
    }

    pub fn config_file(&self) -> &PathBuf {
        &self.config_file
    }

    /// Configuration of a section, empty if the file doesn't have it.
    pub fn section(&self, name: &str) -> SectionConfig {
        self.sections.get(name).cloned().unwrap_or_default()
    }

    pub fn general(&self) -> Result<GeneralConfig, ConfigError> {
        GeneralConfig::try_from(&self.section(GENERAL))
    }

    pub fn pipeline(&self) -> Result<PipelineConfig, ConfigError> {
        PipelineConfig::from_sections(&self.section(REORDERER), &self.section(DENTRY_RESOLVER))
    }
}

/// `[general]` section: what to load and which maps to use.
#[derive(Debug, Clone)]
pub struct GeneralConfig {
    pub probe_object: PathBuf,
    pub perf_pages: usize,
    pub events_map: String,
    pub pathnames_map: String,
    pub revisions_map: String,
    /// Maps are not pinned when empty
    pub pin_path: Option<PathBuf>,
    pub attach: Vec<ProgramSpec>,
}

impl TryFrom<&SectionConfig> for GeneralConfig {
    type Error = ConfigError;

    fn try_from(config: &SectionConfig) -> Result<Self, Self::Error> {
        let pin_path: String = config.with_default("pin_path", "/sys/fs/bpf/runsec".to_string())?;
        Ok(Self {
            probe_object: config.required("probe_object")?,
            perf_pages: config.with_default("perf_pages", PERF_PAGES_DEFAULT)?,
            events_map: config.with_default("events_map", "events".to_string())?,
            pathnames_map: config.with_default("pathnames_map", "pathnames".to_string())?,
            revisions_map: config
                .with_default("revisions_map", "discarder_revisions".to_string())?,
            pin_path: (!pin_path.is_empty()).then(|| PathBuf::from(pin_path)),
            attach: config.get_list("attach")?,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    Plaintext,
    Json,
}

impl FromStr for OutputFormat {
    type Err = ConfigError;
    fn from_str(format: &str) -> Result<Self, Self::Err> {
        match format.to_lowercase().as_str() {
            "plaintext" => Ok(OutputFormat::Plaintext),
            "json" => Ok(OutputFormat::Json),
            _ => Err(ConfigError::InvalidValue {
                field: String::from("output_format"),
                value: format.to_string(),
                err: String::from("Output format must be one of [plaintext, json]"),
            }),
        }
    }
}

/// `[event-logger]` section.
#[derive(Clone, Debug)]
pub struct LoggerConfig {
    pub console: bool,
    pub output_format: OutputFormat,
}

impl TryFrom<&SectionConfig> for LoggerConfig {
    type Error = ConfigError;

    fn try_from(config: &SectionConfig) -> Result<Self, Self::Error> {
        Ok(Self {
            console: config.with_default("console", true)?,
            output_format: config.with_default("output_format", OutputFormat::Plaintext)?,
        })
    }
}
