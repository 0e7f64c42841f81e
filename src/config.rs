//! Engine Configuration
//!
//! One immutable [`EngineConfig`] is built at startup and handed to
//! [`ProcessEngine::new`](crate::execution::ProcessEngine::new).
//!
//! # Config File Resolution Priority
//!
//! 1. `$FLOWRUNNER_CONFIG`
//! 2. `flowrunner.yaml` next to the flowrunner executable
//! 3. `flowrunner.yaml` in the current working directory
//!
//! A missing file means defaults.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::calendar::{BusinessCalendar, CalendarConfig, CalendarError};
use crate::graph::JoinLockMode;
use crate::variables::{TypeRegistry, VariableError, DEFAULT_TYPES};

/// Name of the calendar used when a timer names none.
pub const DEFAULT_CALENDAR: &str = "default";

const CONFIG_FILE: &str = "flowrunner.yaml";

/// Lazily-resolved path of the engine config file.
pub static DEFAULT_CONFIG_PATH: Lazy<PathBuf> = Lazy::new(|| {
    // Priority 1: explicit override
    if let Ok(path) = std::env::var("FLOWRUNNER_CONFIG") {
        debug!("Using config from FLOWRUNNER_CONFIG: {}", path);
        return PathBuf::from(path);
    }

    // Priority 2: next to the executable
    if let Ok(exe_path) = std::env::current_exe() {
        if let Some(exe_dir) = exe_path.parent() {
            let prod_path = exe_dir.join(CONFIG_FILE);
            if prod_path.exists() {
                debug!("Using config next to executable: {}", prod_path.display());
                return prod_path;
            }
        }
    }

    // Priority 3: current working directory
    PathBuf::from(CONFIG_FILE)
});

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error(transparent)]
    UnknownVariableType(#[from] VariableError),

    #[error("config defines no 'default' business calendar")]
    MissingDefaultCalendar,

    #[error("business calendar '{name}': {source}")]
    Calendar {
        name: String,
        #[source]
        source: CalendarError,
    },
}

fn default_max_retries() -> u32 {
    3
}

fn default_workers() -> usize {
    num_cpus::get()
}

fn default_executor_name() -> String {
    "flowrunner-executor".to_string()
}

fn default_variable_types() -> Vec<String> {
    DEFAULT_TYPES.iter().map(|name| name.to_string()).collect()
}

fn default_calendars() -> BTreeMap<String, CalendarConfig> {
    BTreeMap::from([(DEFAULT_CALENDAR.to_string(), CalendarConfig::default())])
}

/// Job executor settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobConfig {
    /// Failures after which a job stays locked for manual handling
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Prefix of worker lock owners
    #[serde(default = "default_executor_name")]
    pub executor_name: String,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            workers: default_workers(),
            executor_name: default_executor_name(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    #[serde(default)]
    pub jobs: JobConfig,
    /// Lock joins take on the parent token unless the join overrides it
    #[serde(default)]
    pub join_lock_mode: JoinLockMode,
    /// Ordered type mappings tried when a variable is first written
    #[serde(default = "default_variable_types")]
    pub variable_types: Vec<String>,
    #[serde(default = "default_calendars")]
    pub calendars: BTreeMap<String, CalendarConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            jobs: JobConfig::default(),
            join_lock_mode: JoinLockMode::default(),
            variable_types: default_variable_types(),
            calendars: default_calendars(),
        }
    }
}

impl EngineConfig {
    /// Parses and validates YAML config text.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        info!("Loading engine config from: {}", path.display());
        let yaml = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&yaml)
    }

    /// Loads the resolved default config file, or defaults when it is absent.
    pub fn load_or_default() -> Result<Self, ConfigError> {
        let path = DEFAULT_CONFIG_PATH.as_path();
        if path.exists() {
            Self::load(path)
        } else {
            debug!("No config at {}; using defaults", path.display());
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.type_registry()?;
        self.business_calendars()?;
        Ok(())
    }

    pub fn type_registry(&self) -> Result<TypeRegistry, ConfigError> {
        Ok(TypeRegistry::from_names(self.variable_types.as_slice())?)
    }

    /// Builds every configured calendar; `default` must be among them.
    pub fn business_calendars(&self) -> Result<BTreeMap<String, BusinessCalendar>, ConfigError> {
        if !self.calendars.contains_key(DEFAULT_CALENDAR) {
            return Err(ConfigError::MissingDefaultCalendar);
        }
        self.calendars
            .iter()
            .map(|(name, config)| {
                BusinessCalendar::from_config(config)
                    .map(|calendar| (name.clone(), calendar))
                    .map_err(|source| ConfigError::Calendar {
                        name: name.clone(),
                        source,
                    })
            })
            .collect()
    }
}
