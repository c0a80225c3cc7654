//! Engine configuration file support.
//!
//! Settings are layered: global `~/.forge/config.toml`, then local `.forgerc`,
//! then `FORGE_*` environment variables, then explicit caller overrides.
//! Every layer is optional and merged field by field.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_PROJECTS: &str = "FORGE_PROJECTS";
pub const ENV_LLAMA_CPP_DIR: &str = "FORGE_LLAMA_CPP_DIR";
pub const ENV_PYTHON: &str = "FORGE_PYTHON";
pub const ENV_OLLAMA: &str = "FORGE_OLLAMA";

const DEFAULT_INGEST_PACING_MS: u64 = 500;
const DEFAULT_ACTIVE_POLL_MS: u64 = 300;
const DEFAULT_IDLE_POLL_MS: u64 = 1000;

/// One layer of engine settings as written in a TOML file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Directory holding one subdirectory per project.
    pub projects_dir: Option<PathBuf>,
    /// llama.cpp checkout containing `convert_hf_to_gguf.py`.
    pub llama_cpp_dir: Option<PathBuf>,
    /// Python interpreter used for conversion.
    pub python: Option<String>,
    /// Model runtime binary.
    pub ollama: Option<String>,
    /// Delay before ingestion starts, in milliseconds.
    pub ingest_pacing_ms: Option<u64>,
    /// Progress poll interval while a job is active, in milliseconds.
    pub active_poll_ms: Option<u64>,
    /// Progress poll interval when idle, in milliseconds.
    pub idle_poll_ms: Option<u64>,
}

impl EngineSettings {
    /// Loads settings from a TOML file.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.display().to_string(), source })?;

        toml::from_str(&content)
            .map_err(|source| ConfigError::Parse { path: path.display().to_string(), source })
    }

    /// Saves settings to a TOML file, creating parent directories.
    pub fn save_to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|source| ConfigError::Write { path: parent.display().to_string(), source })?;
        }

        std::fs::write(path, content)
            .map_err(|source| ConfigError::Write { path: path.display().to_string(), source })
    }

    /// Gets the default global config path (~/.forge/config.toml).
    pub fn default_global_path() -> PathBuf {
        home_dir().join(".forge").join("config.toml")
    }

    /// Gets the default local config path (./.forgerc).
    pub fn default_local_path() -> PathBuf {
        PathBuf::from(".forgerc")
    }

    /// Reads the `FORGE_*` variables through `lookup`.
    pub fn from_env_with(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        Self {
            projects_dir: non_empty(ENV_PROJECTS).map(PathBuf::from),
            llama_cpp_dir: non_empty(ENV_LLAMA_CPP_DIR).map(PathBuf::from),
            python: non_empty(ENV_PYTHON),
            ollama: non_empty(ENV_OLLAMA),
            ..Self::default()
        }
    }

    pub fn from_env() -> Self {
        Self::from_env_with(|key| std::env::var(key).ok())
    }

    /// Discovers and merges global, local and environment settings.
    ///
    /// Missing files are skipped; unreadable or malformed files are logged and skipped.
    pub fn discover_and_load() -> Self {
        let mut settings = Self::default();

        for path in [Self::default_global_path(), Self::default_local_path()] {
            if !path.exists() {
                continue;
            }
            match Self::load_from_file(&path) {
                Ok(layer) => settings.merge(&layer),
                Err(e) => tracing::warn!(error = %e, "Ignoring engine config file"),
            }
        }

        settings.merge(&Self::from_env());
        settings
    }

    /// Merges `other` on top of `self`; set fields in `other` win.
    pub fn merge(&mut self, other: &Self) {
        if let Some(ref dir) = other.projects_dir {
            self.projects_dir = Some(dir.clone());
        }
        if let Some(ref dir) = other.llama_cpp_dir {
            self.llama_cpp_dir = Some(dir.clone());
        }
        if let Some(ref python) = other.python {
            self.python = Some(python.clone());
        }
        if let Some(ref ollama) = other.ollama {
            self.ollama = Some(ollama.clone());
        }
        if other.ingest_pacing_ms.is_some() {
            self.ingest_pacing_ms = other.ingest_pacing_ms;
        }
        if other.active_poll_ms.is_some() {
            self.active_poll_ms = other.active_poll_ms;
        }
        if other.idle_poll_ms.is_some() {
            self.idle_poll_ms = other.idle_poll_ms;
        }
    }

    /// Fills unset fields with defaults.
    #[must_use]
    pub fn resolve(&self) -> EngineConfig {
        let defaults = EngineConfig::default();
        EngineConfig {
            projects_dir: self.projects_dir.clone().unwrap_or(defaults.projects_dir),
            llama_cpp_dir: self.llama_cpp_dir.clone().unwrap_or(defaults.llama_cpp_dir),
            python: self.python.clone().unwrap_or(defaults.python),
            ollama: self.ollama.clone().unwrap_or(defaults.ollama),
            ingest_pacing: self.ingest_pacing_ms.map_or(defaults.ingest_pacing, Duration::from_millis),
            active_poll: self.active_poll_ms.map_or(defaults.active_poll, Duration::from_millis),
            idle_poll: self.idle_poll_ms.map_or(defaults.idle_poll, Duration::from_millis),
        }
    }
}

/// Effective engine configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub projects_dir: PathBuf,
    pub llama_cpp_dir: PathBuf,
    pub python: String,
    pub ollama: String,
    pub ingest_pacing: Duration,
    pub active_poll: Duration,
    pub idle_poll: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self {
            projects_dir: home_dir().join(".forge").join("projects"),
            llama_cpp_dir: cwd.join(".llama.cpp"),
            python: "python3".to_string(),
            ollama: "ollama".to_string(),
            ingest_pacing: Duration::from_millis(DEFAULT_INGEST_PACING_MS),
            active_poll: Duration::from_millis(DEFAULT_ACTIVE_POLL_MS),
            idle_poll: Duration::from_millis(DEFAULT_IDLE_POLL_MS),
        }
    }
}

impl EngineConfig {
    /// Configuration from config files and environment.
    pub fn discover() -> Self {
        EngineSettings::discover_and_load().resolve()
    }

    /// Root directory of a project.
    #[must_use]
    pub fn project_root(&self, project: &str) -> PathBuf {
        self.projects_dir.join(project)
    }
}

pub(crate) fn home_dir() -> PathBuf {
    std::env::var("HOME").map_or_else(|_| PathBuf::from("."), PathBuf::from)
}
