//! Configuration management for tether.
use regex::Regex;
use serde::Deserialize;
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};
use strum_macros::{AsRefStr, EnumString};

use crate::{constants::*, error::ManagerError};

/// Where the downloaded binary is cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, EnumString, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CacheScope {
    /// One cache shared by every workspace of the current user.
    #[default]
    Global,
    /// A cache inside the workspace's base directory.
    Workspace,
}

/// Settings consumed by the manager. Every field has a default.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Fetch and cache the binary, or use one already on `PATH`.
    pub download_binary: bool,
    /// Base name of the binary inside release assets and archives.
    pub binary_name: String,
    /// Program used when `download_binary` is false.
    pub system_binary: Option<String>,
    /// `owner/name` of the repository publishing releases.
    pub release_repository: String,
    /// Base URL of the release API.
    pub release_api: String,
    /// Base directory handed to the server.
    pub base_directory: PathBuf,
    /// Node name handed to the server.
    pub node_name: String,
    /// Where to cache the binary.
    pub cache_scope: CacheScope,
    /// Explicit cache location, overriding `cache_scope`.
    pub cache_path: Option<PathBuf>,
    /// Extra environment for the server process.
    pub environment_variables: HashMap<String, String>,
    /// Extra environment in `KEY1=VALUE1;KEY2=VALUE2` form.
    pub environment: Option<String>,
    /// Stdout substring that marks the server as ready.
    pub readiness_marker: String,
    /// Base URL of the control plane's admin API.
    pub control_plane: String,
    /// Deployment URI registered with the control plane.
    pub deployment_uri: String,
    /// Grace period after a termination request, e.g. `"5s"`.
    pub stop_timeout: String,
    /// Wait after a forced kill, e.g. `"2s"`.
    pub kill_timeout: String,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            download_binary: true,
            binary_name: DEFAULT_BINARY_NAME.to_string(),
            system_binary: None,
            release_repository: DEFAULT_RELEASE_REPOSITORY.to_string(),
            release_api: DEFAULT_RELEASE_API.to_string(),
            base_directory: PathBuf::from(DEFAULT_BASE_DIRECTORY),
            node_name: DEFAULT_NODE_NAME.to_string(),
            cache_scope: CacheScope::Global,
            cache_path: None,
            environment_variables: HashMap::new(),
            environment: None,
            readiness_marker: DEFAULT_READINESS_MARKER.to_string(),
            control_plane: DEFAULT_CONTROL_PLANE.to_string(),
            deployment_uri: DEFAULT_DEPLOYMENT_URI.to_string(),
            stop_timeout: format!("{}s", DEFAULT_STOP_TIMEOUT.as_secs()),
            kill_timeout: format!("{}s", DEFAULT_KILL_TIMEOUT.as_secs()),
        }
    }
}

impl ManagerConfig {
    /// Program to execute when the binary is not self-managed.
    pub fn system_binary(&self) -> &str {
        self.system_binary.as_deref().unwrap_or(&self.binary_name)
    }

    /// Resolves the install location of the cached binary.
    pub fn cache_location(&self) -> Result<PathBuf, ManagerError> {
        if let Some(path) = &self.cache_path {
            return Ok(path.clone());
        }

        let dir = match self.cache_scope {
            CacheScope::Global => {
                let home = env::var_os("HOME").ok_or_else(|| {
                    ManagerError::ConfigValueError(
                        "HOME is not set; use cache_scope: workspace or cache_path".into(),
                    )
                })?;
                PathBuf::from(home).join(GLOBAL_CACHE_DIR)
            }
            CacheScope::Workspace => self.base_directory.join("bin"),
        };
        Ok(dir.join(&self.binary_name))
    }

    /// Environment overrides for the server, with the mapping taking
    /// precedence over the `KEY=VALUE;...` string.
    pub fn merged_environment(&self) -> HashMap<String, String> {
        let mut merged = self
            .environment
            .as_deref()
            .map(parse_env_assignments)
            .unwrap_or_default();
        for (key, value) in &self.environment_variables {
            merged.insert(key.clone(), value.clone());
        }
        merged
    }

    pub fn stop_timeout(&self) -> Result<Duration, ManagerError> {
        parse_duration(&self.stop_timeout)
    }

    pub fn kill_timeout(&self) -> Result<Duration, ManagerError> {
        parse_duration(&self.kill_timeout)
    }

    /// Rejects values that would fail later in a less obvious place.
    pub fn validate(&self) -> Result<(), ManagerError> {
        if self.binary_name.trim().is_empty() {
            return Err(ManagerError::ConfigValueError(
                "binary_name cannot be empty".into(),
            ));
        }
        if self.readiness_marker.is_empty() {
            return Err(ManagerError::ConfigValueError(
                "readiness_marker cannot be empty".into(),
            ));
        }
        if !self.release_repository.contains('/') {
            return Err(ManagerError::ConfigValueError(format!(
                "release_repository '{}' must be of the form owner/name",
                self.release_repository
            )));
        }
        self.stop_timeout()?;
        self.kill_timeout()?;
        Ok(())
    }
}

/// Parses `KEY1=VALUE1;KEY2=VALUE2`, skipping blank and malformed entries.
pub fn parse_env_assignments(raw: &str) -> HashMap<String, String> {
    raw.split(';')
        .filter(|entry| !entry.trim().is_empty())
        .filter_map(|entry| {
            let (key, value) = entry.split_once('=')?;
            let key = key.trim();
            (!key.is_empty()).then(|| (key.to_string(), value.trim().to_string()))
        })
        .collect()
}

/// Parses a user-facing duration string in the format `<number>[ms|s|m|h]`.
pub fn parse_duration(raw: &str) -> Result<Duration, ManagerError> {
    let value = raw.trim();
    if value.is_empty() {
        return Err(ManagerError::ConfigValueError(
            "Duration value cannot be empty".into(),
        ));
    }

    let invalid = || ManagerError::ConfigValueError(format!("Invalid duration value: '{raw}'"));

    if let Some(stripped) = value.strip_suffix("ms") {
        let amount: u64 = stripped.trim().parse().map_err(|_| invalid())?;
        return Ok(Duration::from_millis(amount));
    }

    let (amount_str, multiplier) = if let Some(stripped) = value.strip_suffix('s') {
        (stripped.trim(), 1)
    } else if let Some(stripped) = value.strip_suffix('m') {
        (stripped.trim(), 60)
    } else if let Some(stripped) = value.strip_suffix('h') {
        (stripped.trim(), 3600)
    } else {
        (value, 1)
    };

    let amount: u64 = amount_str.parse().map_err(|_| invalid())?;
    Ok(Duration::from_secs(amount.saturating_mul(multiplier)))
}

/// Expands `$VAR` and `${VAR}` references; unknown variables are an error.
fn expand_env_vars(input: &str) -> Result<String, ManagerError> {
    let re = Regex::new(r"\$\{?([A-Za-z_][A-Za-z0-9_]*)\}?")
        .map_err(|err| ManagerError::ConfigValueError(err.to_string()))?;

    let mut missing = None;
    let result = re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        match env::var(var_name) {
            Ok(value) => value,
            Err(_) => {
                missing.get_or_insert_with(|| var_name.to_string());
                String::new()
            }
        }
    });

    match missing {
        Some(var_name) => Err(ManagerError::ConfigValueError(format!(
            "Missing environment variable: {var_name}"
        ))),
        None => Ok(result.into_owned()),
    }
}

/// Loads the configuration file, falling back to defaults when it does not exist.
///
/// Relative `base_directory` and `cache_path` values are resolved against the
/// file's directory.
pub fn load_config(config_path: Option<&str>) -> Result<ManagerConfig, ManagerError> {
    let config_path = Path::new(config_path.unwrap_or("tether.yaml"));
    if !config_path.exists() {
        let config = ManagerConfig::default();
        config.validate()?;
        return Ok(config);
    }

    let content = fs::read_to_string(config_path).map_err(|e| {
        ManagerError::ConfigReadError(std::io::Error::new(
            e.kind(),
            format!("{} ({})", e, config_path.display()),
        ))
    })?;

    let expanded = expand_env_vars(&content)?;
    let mut config: ManagerConfig = if expanded.trim().is_empty() {
        ManagerConfig::default()
    } else {
        serde_yaml::from_str(&expanded).map_err(ManagerError::ConfigParseError)?
    };

    let base_path = config_path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    if config.base_directory.is_relative() {
        config.base_directory = base_path.join(&config.base_directory);
    }
    if let Some(cache_path) = config.cache_path.as_mut()
        && cache_path.is_relative()
    {
        *cache_path = base_path.join(&*cache_path);
    }

    config.validate()?;
    Ok(config)
}
