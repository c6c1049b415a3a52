//! This module controls configuration parsing from the end user, providing a
//! convenience mechanism for the rest of the program. Crashes are most likely
//! to originate from this code, intentionally.

use std::{env, fs, io, net::SocketAddr, path::PathBuf};

use dripfeed_payload::senml::ValueKind;
use http::Uri;
use rustc_hash::FxHashSet;
use serde::Deserialize;
use tracing::debug;

use crate::registry::{Aggregation, SourceType};

/// Environment variable that, when set, replaces the on-disk configuration
/// file wholesale.
pub const CONFIG_ENV_VAR: &str = "DRIPFEED_CONFIG";

/// Errors produced by [`Config`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Error for a serde [`serde_yaml`].
    #[error("Failed to deserialize yaml: {0}")]
    SerdeYaml(#[from] serde_yaml::Error),
    /// Error reading config file
    #[error("Failed to read config file {path:?}: {source}")]
    ReadFile {
        /// File path
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: Box<io::Error>,
    },
    /// Error for an invalid URI override
    #[error("Failed to parse URI: {0}")]
    Uri(#[from] http::uri::InvalidUri),
    /// Error for duplicate source names
    #[error("Duplicate source name found: {0}")]
    DuplicateSourceName(String),
    /// Error when no sources are configured
    #[error("At least one source must be configured")]
    NoSources,
    /// Error when the publish interval is zero
    #[error("publish_interval_seconds must not be zero")]
    ZeroPublishInterval,
}

fn default_target_uri() -> Uri {
    Uri::from_static("http://hds:8085")
}

fn default_publish_interval() -> u64 {
    5
}

fn default_retry_interval() -> u64 {
    1
}

fn default_resource_prefix() -> String {
    String::from("http://dummy/")
}

fn default_retention() -> String {
    String::from("1h")
}

fn default_aggregation() -> Vec<Aggregation> {
    vec![
        Aggregation {
            interval: String::from("1m"),
            aggregates: vec![String::from("min"), String::from("max")],
            retention: String::from("1w"),
        },
        Aggregation {
            interval: String::from("1h"),
            aggregates: vec![String::from("mean"), String::from("stddev")],
            retention: String::from("1w"),
        },
    ]
}

/// Main configuration struct for this program
#[derive(Debug, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Base URI of the historical datastore
    #[serde(with = "http_serde::uri", default = "default_target_uri")]
    pub target_uri: Uri,
    /// Seconds between submissions of synthesized readings
    #[serde(default = "default_publish_interval")]
    pub publish_interval_seconds: u64,
    /// Seconds between registration attempts after a transient failure
    #[serde(default = "default_retry_interval")]
    pub retry_interval_seconds: u64,
    /// The seed for random operations, OS entropy when unset
    #[serde(default)]
    pub seed: Option<[u8; 32]>,
    /// The data sources to register and stream readings for
    pub sources: Vec<SourceConfig>,
    /// Registration metadata applied to every source
    #[serde(default)]
    pub defaults: SourceDefaults,
    /// Address and port for the prometheus exporter, disabled when unset
    #[serde(default)]
    pub prometheus_addr: Option<SocketAddr>,
}

/// One data source to register and stream readings for
#[derive(Debug, Deserialize, PartialEq, Clone)]
#[serde(deny_unknown_fields)]
pub struct SourceConfig {
    /// Name of the source, used as the resource suffix for registry lookup
    pub name: String,
    /// Full resource URL, derived from the defaults' prefix when unset
    #[serde(default)]
    pub resource: Option<String>,
    /// SenML unit attached to every reading, omitted when unset
    #[serde(default)]
    pub unit: Option<String>,
    /// Distribution of synthesized values for this source
    #[serde(default)]
    pub value: Option<ValueKind>,
}

impl SourceConfig {
    /// Resolve the full resource URL for this source.
    #[must_use]
    pub fn resource(&self, defaults: &SourceDefaults) -> String {
        self.resource
            .clone()
            .unwrap_or_else(|| format!("{}{}", defaults.resource_prefix, self.name))
    }
}

/// Registration metadata shared by all sources
#[derive(Debug, Deserialize, PartialEq, Clone)]
#[serde(deny_unknown_fields)]
pub struct SourceDefaults {
    /// Prefix used to derive a resource URL from a source name
    #[serde(default = "default_resource_prefix")]
    pub resource_prefix: String,
    /// Raw data retention period advertised at registration
    #[serde(default = "default_retention")]
    pub retention: String,
    /// Registry value type for the sources
    #[serde(default, rename = "type")]
    pub kind: SourceType,
    /// Aggregations requested at registration
    #[serde(default = "default_aggregation")]
    pub aggregation: Vec<Aggregation>,
}

impl Default for SourceDefaults {
    fn default() -> Self {
        Self {
            resource_prefix: default_resource_prefix(),
            retention: default_retention(),
            kind: SourceType::default(),
            aggregation: default_aggregation(),
        }
    }
}

impl Config {
    /// Check the parsed configuration for inconsistencies a deserializer
    /// cannot catch.
    ///
    /// # Errors
    ///
    /// Returns an error if no sources are configured, if source names repeat
    /// or if the publish interval is zero.
    pub fn validate(&self) -> Result<(), Error> {
        if self.sources.is_empty() {
            return Err(Error::NoSources);
        }
        if self.publish_interval_seconds == 0 {
            return Err(Error::ZeroPublishInterval);
        }
        let mut seen_names = FxHashSet::default();
        for source in &self.sources {
            if !seen_names.insert(source.name.clone()) {
                return Err(Error::DuplicateSourceName(source.name.clone()));
            }
        }
        Ok(())
    }
}

/// Load raw configuration contents, preferring [`CONFIG_ENV_VAR`] over the
/// file at `config_path`.
///
/// # Errors
///
/// Returns an error if the file cannot be read.
pub fn load_contents(config_path: &str) -> Result<String, Error> {
    if let Ok(env_var_value) = env::var(CONFIG_ENV_VAR) {
        debug!("Using config from env var '{CONFIG_ENV_VAR}'");
        return Ok(env_var_value);
    }
    debug!("Attempting to open configuration file at: {config_path}");
    fs::read_to_string(config_path).map_err(|source| Error::ReadFile {
        path: PathBuf::from(config_path),
        source: Box::new(source),
    })
}

/// Parse and validate configuration contents.
///
/// # Errors
///
/// Returns an error if the contents are not valid YAML or fail validation.
pub fn parse(contents: &str) -> Result<Config, Error> {
    let config: Config = serde_yaml::from_str(contents)?;
    config.validate()?;
    Ok(config)
}
