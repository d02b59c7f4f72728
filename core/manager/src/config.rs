//! Disk configuration: loading, env-var substitution and materialization.

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::Path;

use stowage_common::{Error, Result};
use stowage_storage::Options;

/// Key path of the storage section inside a larger application config.
pub const DEFAULT_EMBED_KEY: &str = "storage";

static ENV_VAR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)")
        .expect("env var pattern is valid")
});

/// Substitute `${NAME}` and `$NAME` references from the process environment.
///
/// Names are matched greedily, so `$FOO_suffix` refers to `FOO_suffix`.
/// References to unset or empty variables are left exactly as written.
pub fn expand_env_vars(raw: &str) -> String {
    expand_with(raw, |name| std::env::var(name).ok())
}

/// [`expand_env_vars`] against an arbitrary lookup.
pub fn expand_with<F>(raw: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    ENV_VAR
        .replace_all(raw, |caps: &Captures| {
            let name = caps
                .get(1)
                .or_else(|| caps.get(2))
                .map(|m| m.as_str())
                .unwrap_or_default();
            match lookup(name) {
                Some(value) if !value.is_empty() => value,
                _ => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Serialization format of a config file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Yaml,
    Json,
}

impl ConfigFormat {
    /// `.json` files are JSON; anything else is read as YAML.
    pub fn from_path(path: impl AsRef<Path>) -> Self {
        match path.as_ref().extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => ConfigFormat::Json,
            _ => ConfigFormat::Yaml,
        }
    }

    fn parse(self, text: &str) -> Result<Value> {
        match self {
            ConfigFormat::Yaml => serde_yaml::from_str(text)
                .map_err(|e| Error::ConfigParse(format!("invalid YAML: {}", e))),
            ConfigFormat::Json => serde_json::from_str(text)
                .map_err(|e| Error::ConfigParse(format!("invalid JSON: {}", e))),
        }
    }
}

/// One configured disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskConfig {
    /// Registered driver name.
    pub driver: String,
    /// Options handed verbatim to the driver factory.
    #[serde(default)]
    pub options: Options,
}

impl DiskConfig {
    pub fn new(driver: impl Into<String>) -> Self {
        Self {
            driver: driver.into(),
            options: Options::new(),
        }
    }

    /// Set one option.
    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }
}

/// Fully materialized storage configuration.
///
/// `default` is not checked against `disks` here; an unknown default is
/// reported when it is first resolved.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResolvedConfig {
    #[serde(default)]
    pub default: String,
    #[serde(default)]
    pub disks: BTreeMap<String, DiskConfig>,
}

impl ResolvedConfig {
    /// Empty configuration with the given default disk name.
    pub fn new(default: impl Into<String>) -> Self {
        Self {
            default: default.into(),
            disks: BTreeMap::new(),
        }
    }

    /// Add or replace a disk.
    pub fn with_disk(mut self, name: impl Into<String>, disk: DiskConfig) -> Self {
        self.disks.insert(name.into(), disk);
        self
    }

    pub fn disk(&self, name: &str) -> Option<&DiskConfig> {
        self.disks.get(name)
    }

    pub fn disk_names(&self) -> impl Iterator<Item = &str> {
        self.disks.keys().map(String::as_str)
    }

    /// Parse a top-level storage config.
    ///
    /// Environment references are expanded on the raw text before parsing.
    ///
    /// # Errors
    /// - `ConfigParse` for invalid UTF-8, invalid syntax or a malformed tree
    pub fn from_bytes(raw: &[u8], format: ConfigFormat) -> Result<Self> {
        let tree = parse_tree(raw, format)?;
        Self::from_value(&tree)
    }

    /// Parse a storage section nested under a dotted `key_path` of a larger
    /// application config.
    ///
    /// # Errors
    /// - `KeyNotFound` if any segment of `key_path` is missing
    /// - `ConfigParse` as for [`ResolvedConfig::from_bytes`]
    pub fn from_bytes_embedded(raw: &[u8], format: ConfigFormat, key_path: &str) -> Result<Self> {
        let tree = parse_tree(raw, format)?;

        let mut section = &tree;
        for segment in key_path.split('.').filter(|s| !s.is_empty()) {
            section = section
                .get(segment)
                .ok_or_else(|| Error::KeyNotFound(key_path.to_string()))?;
        }
        Self::from_value(section)
    }

    /// Load a top-level storage config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read(path)?;
        Self::from_bytes(&raw, ConfigFormat::from_path(path))
    }

    /// Load the storage section from the `storage` key of an application
    /// config file.
    pub fn load_embedded(path: impl AsRef<Path>) -> Result<Self> {
        Self::load_embedded_with_key(path, DEFAULT_EMBED_KEY)
    }

    pub fn load_embedded_with_key(path: impl AsRef<Path>, key_path: &str) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read(path)?;
        Self::from_bytes_embedded(&raw, ConfigFormat::from_path(path), key_path)
    }

    /// Materialize from an already-parsed tree.
    ///
    /// No env expansion happens here; callers feeding values from another
    /// configuration library get them as that library produced them.
    pub fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Object(map) => Self::from_map(map),
            _ => Err(Error::ConfigParse(
                "storage config must be a mapping".to_string(),
            )),
        }
    }

    /// Materialize from a mapping with `default` and `disks`/`storages`.
    ///
    /// Each disk takes its options from an `options` sub-mapping when
    /// present, otherwise from every key other than `driver`.
    pub fn from_map(map: &Map<String, Value>) -> Result<Self> {
        let default = match map.get("default") {
            None | Some(Value::Null) => String::new(),
            Some(Value::String(name)) => name.clone(),
            Some(other) => {
                return Err(Error::ConfigParse(format!(
                    "'default' must be a string, got {}",
                    other
                )))
            }
        };

        let present = |key: &str| map.get(key).filter(|v| !v.is_null());
        let raw_disks = present("disks")
            .or_else(|| present("storages"))
            .ok_or_else(|| {
                Error::ConfigParse("no 'disks' or 'storages' found in config".to_string())
            })?
            .as_object()
            .ok_or_else(|| {
                Error::ConfigParse("'disks' must be a mapping of disk names".to_string())
            })?;

        let mut disks = BTreeMap::new();
        for (name, raw) in raw_disks {
            disks.insert(name.clone(), parse_disk(name, raw)?);
        }

        Ok(Self { default, disks })
    }
}

fn parse_tree(raw: &[u8], format: ConfigFormat) -> Result<Value> {
    let text = std::str::from_utf8(raw)
        .map_err(|e| Error::ConfigParse(format!("config is not valid UTF-8: {}", e)))?;
    format.parse(&expand_env_vars(text))
}

fn parse_disk(name: &str, raw: &Value) -> Result<DiskConfig> {
    let entry = raw
        .as_object()
        .ok_or_else(|| Error::ConfigParse(format!("disk '{}' must be a mapping", name)))?;

    let driver = entry
        .get("driver")
        .and_then(Value::as_str)
        .filter(|d| !d.is_empty())
        .ok_or_else(|| Error::ConfigParse(format!("disk '{}' missing 'driver'", name)))?;

    let options = match entry.get("options") {
        Some(Value::Object(options)) => options.clone(),
        Some(Value::Null) => Options::new(),
        Some(_) => {
            return Err(Error::ConfigParse(format!(
                "disk '{}': 'options' must be a mapping",
                name
            )))
        }
        None => entry
            .iter()
            .filter(|(key, _)| key.as_str() != "driver")
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect(),
    };

    Ok(DiskConfig {
        driver: driver.to_string(),
        options,
    })
}
