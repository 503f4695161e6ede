use crate::process::InvocationLimits;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Where the external search executable lives and how to call it.
///
/// The final argv is `command [args...] search <query> <output_flag>`.
///
/// Example in `~/.localsearch/config.json` or `.localsearch.json`:
/// ```json
/// {
///   "search": {
///     "command": "python3",
///     "args": ["/opt/local-search/scripts/local_search.py"],
///     "output_flag": "--json"
///   },
///   "timeout_secs": 30
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchCommandConfig {
    #[serde(default = "default_command")]
    pub command: String,
    /// Leading arguments, typically the script path for an interpreter.
    #[serde(default = "default_args")]
    pub args: Vec<String>,
    #[serde(default = "default_output_flag")]
    pub output_flag: String,
}

fn default_command() -> String {
    std::env::var("LOCALSEARCH_COMMAND").unwrap_or_else(|_| "python3".to_string())
}

fn default_args() -> Vec<String> {
    let script = dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".claude")
        .join("skills")
        .join("local-search")
        .join("scripts")
        .join("local_search.py");
    vec![script.to_string_lossy().into_owned()]
}

fn default_output_flag() -> String {
    "--json".to_string()
}

impl Default for SearchCommandConfig {
    fn default() -> Self {
        Self {
            command: default_command(),
            args: default_args(),
            output_flag: default_output_flag(),
        }
    }
}

impl SearchCommandConfig {
    /// Build the argument vector for one query. The query stays a single
    /// element no matter what characters it contains.
    pub fn argv(&self, query: &str) -> Vec<String> {
        let mut argv = self.args.clone();
        argv.push("search".to_string());
        argv.push(query.to_string());
        if !self.output_flag.is_empty() {
            argv.push(self.output_flag.clone());
        }
        argv
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Name reported to clients in the handshake.
    #[serde(default = "default_server_name")]
    pub server_name: String,
    #[serde(default)]
    pub search: SearchCommandConfig,
    /// Seconds before a running search is killed. 0 disables the deadline.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Cap on captured bytes per output stream.
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
}

fn default_server_name() -> String {
    "local-search".to_string()
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_max_output_bytes() -> usize {
    4 * 1024 * 1024
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            server_name: default_server_name(),
            search: SearchCommandConfig::default(),
            timeout_secs: default_timeout_secs(),
            max_output_bytes: default_max_output_bytes(),
        }
    }
}

impl BridgeConfig {
    /// Load `~/.localsearch/config.json` (or `explicit` when given), then
    /// apply `./.localsearch.json` on top, key by key.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let config_path = explicit
            .map(Path::to_path_buf)
            .unwrap_or_else(|| Self::resolve_path("config.json"));

        let config = if config_path.exists() {
            Self::load_from(&config_path)?
        } else if explicit.is_some() {
            anyhow::bail!("config file {} does not exist", config_path.display());
        } else {
            tracing::debug!("No config file at {}, using defaults", config_path.display());
            BridgeConfig::default()
        };

        let local_path = std::env::current_dir()
            .ok()
            .map(|d| d.join(".localsearch.json"))
            .filter(|p| p.exists());

        match local_path {
            Some(local) => config.merge_file(&local),
            None => Ok(config),
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        serde_json::from_str(&data)
            .with_context(|| format!("Failed to parse config from {}", path.display()))
    }

    /// Overlay the top-level keys of a JSON file onto this config.
    pub fn merge_file(self, path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        let override_val: serde_json::Value = serde_json::from_str(&data)
            .with_context(|| format!("Failed to parse config from {}", path.display()))?;
        let mut base = serde_json::to_value(&self)?;
        if let (Some(base_obj), Some(over_obj)) = (base.as_object_mut(), override_val.as_object())
        {
            for (k, v) in over_obj {
                base_obj.insert(k.clone(), v.clone());
            }
        }
        Ok(serde_json::from_value(base)?)
    }

    pub fn limits(&self) -> InvocationLimits {
        InvocationLimits {
            timeout: (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs)),
            max_output_bytes: self.max_output_bytes,
        }
    }

    pub fn resolve_path(relative: &str) -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".localsearch")
            .join(relative)
    }
}
