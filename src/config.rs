use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub engine: EngineConfig,
    pub log: LogConfig,
}

/// Tunables of the process engine
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Bytes requested per read on a readable channel
    pub read_block_size: usize,
    /// Interpreter used when a program is not a native executable
    pub shell: String,
    /// Library search-path variable inherited across an environment override
    pub library_path_var: String,
    /// Search path used when no PATH is available
    pub default_path: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// tracing-subscriber filter directive
    pub filter: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            read_block_size: 4096,
            shell: "/bin/sh".to_string(),
            library_path_var: default_library_path_var().to_string(),
            default_path: "/usr/local/bin:/usr/bin:/bin".to_string(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "warn".to_string(),
        }
    }
}

fn default_library_path_var() -> &'static str {
    if cfg!(target_os = "macos") {
        "DYLD_LIBRARY_PATH"
    } else {
        "LD_LIBRARY_PATH"
    }
}

impl Config {
    pub fn load() -> Self {
        let paths = [
            dirs::config_dir().map(|p| p.join("childmux/config.toml")),
            dirs::home_dir().map(|p| p.join(".childmux.toml")),
            Some(PathBuf::from("childmux.toml")),
        ];

        for path in paths.into_iter().flatten() {
            if let Some(config) = Self::load_from(&path) {
                return config;
            }
        }

        Config::default()
    }

    /// Load one specific file, `None` if it is missing or unparsable
    pub fn load_from(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }
        let content = std::fs::read_to_string(path).ok()?;
        Self::from_toml_str(&content).ok()
    }

    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        let mut config: Config = toml::from_str(content)?;
        if config.engine.read_block_size == 0 {
            config.engine.read_block_size = EngineConfig::default().read_block_size;
        }
        Ok(config)
    }
}
