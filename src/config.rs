use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::FetchError;
use crate::filter::InstanceFilter;

/// Persisted tracked-project set. The tree mutates it only through
/// `add`/`remove`; both report whether the set actually changed.
pub trait ProjectRegistry: Send + Sync {
    fn list(&self) -> Result<Vec<String>, FetchError>;
    fn add(&self, id: &str) -> Result<bool, FetchError>;
    fn remove(&self, id: &str) -> Result<bool, FetchError>;
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
struct StratusConfigFile {
    #[serde(default)]
    projects: Vec<String>,
    #[serde(default)]
    filter: FilterDefaults,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    console_base: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    gcloud_binary: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
struct FilterDefaults {
    #[serde(default = "default_show")]
    windows: bool,
    #[serde(default = "default_show")]
    linux: bool,
}

impl Default for FilterDefaults {
    fn default() -> Self {
        Self {
            windows: true,
            linux: true,
        }
    }
}

fn default_show() -> bool {
    true
}

/// Resolved startup settings. `path` backs the registry even when no file
/// existed yet; the first `add` creates it.
#[derive(Debug, Clone)]
pub struct Settings {
    pub path: PathBuf,
    pub loaded: bool,
    pub projects: Vec<String>,
    pub filter: InstanceFilter,
    pub console_base: Option<String>,
    pub gcloud_binary: Option<String>,
}

pub fn load_settings(explicit: Option<PathBuf>) -> Result<Settings> {
    let path = explicit
        .or_else(discover_config_path)
        .unwrap_or_else(default_config_path);
    if !path.exists() {
        return Ok(Settings {
            path,
            loaded: false,
            projects: Vec::new(),
            filter: InstanceFilter::default(),
            console_base: None,
            gcloud_binary: None,
        });
    }

    let parsed = read_config_file(&path)?;
    Ok(Settings {
        path,
        loaded: true,
        projects: parsed.projects,
        filter: InstanceFilter {
            show_windows: parsed.filter.windows,
            show_linux: parsed.filter.linux,
            name_pattern: String::new(),
        },
        console_base: parsed.console_base,
        gcloud_binary: parsed.gcloud_binary,
    })
}

fn read_config_file(path: &Path) -> Result<StratusConfigFile> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    serde_yaml::from_str(&raw).with_context(|| format!("failed to parse config {}", path.display()))
}

fn write_config_file(path: &Path, config: &StratusConfigFile) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory {}", parent.display()))?;
    }
    let rendered = serde_yaml::to_string(config)
        .with_context(|| format!("failed to render config {}", path.display()))?;
    fs::write(path, rendered).with_context(|| format!("failed to write config {}", path.display()))
}

fn discover_config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("STRATUS_CONFIG")
        && !path.trim().is_empty()
    {
        return Some(PathBuf::from(path));
    }

    let cwd_candidates = [
        PathBuf::from("stratus.yaml"),
        PathBuf::from("stratus.yml"),
        PathBuf::from(".stratus.yaml"),
    ];
    for candidate in cwd_candidates {
        if candidate.exists() {
            return Some(candidate);
        }
    }

    if let Ok(home) = std::env::var("HOME") {
        let user_candidates = [
            PathBuf::from(&home).join(".config/stratus/config.yaml"),
            PathBuf::from(&home).join(".config/stratus/config.yml"),
            PathBuf::from(&home).join(".stratus.yaml"),
        ];
        for candidate in user_candidates {
            if candidate.exists() {
                return Some(candidate);
            }
        }
    }

    None
}

fn default_config_path() -> PathBuf {
    match std::env::var("HOME") {
        Ok(home) => PathBuf::from(home).join(".config/stratus/config.yaml"),
        Err(_) => PathBuf::from("stratus.yaml"),
    }
}

/// File-backed registry over the settings file. Mutations rewrite the file
/// and preserve every non-project setting it holds. The mutex serializes
/// read-modify-write cycles.
pub struct FileProjectRegistry {
    path: PathBuf,
    write_guard: Mutex<()>,
}

impl FileProjectRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_guard: Mutex::new(()),
        }
    }

    fn load(&self) -> Result<StratusConfigFile> {
        if self.path.exists() {
            read_config_file(&self.path)
        } else {
            Ok(StratusConfigFile::default())
        }
    }

    fn mutate(&self, apply: impl FnOnce(&mut Vec<String>) -> bool) -> Result<bool> {
        let _guard = self
            .write_guard
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut config = self.load()?;
        if !apply(&mut config.projects) {
            return Ok(false);
        }
        write_config_file(&self.path, &config)?;
        Ok(true)
    }
}

impl ProjectRegistry for FileProjectRegistry {
    fn list(&self) -> Result<Vec<String>, FetchError> {
        let config = self
            .load()
            .map_err(|error| FetchError::backend(format!("{error:#}")))?;
        Ok(config.projects)
    }

    fn add(&self, id: &str) -> Result<bool, FetchError> {
        self.mutate(|projects| {
            if projects.iter().any(|existing| existing == id) {
                return false;
            }
            projects.push(id.to_string());
            true
        })
        .map_err(|error| FetchError::backend(format!("{error:#}")))
    }

    fn remove(&self, id: &str) -> Result<bool, FetchError> {
        self.mutate(|projects| {
            let before = projects.len();
            projects.retain(|existing| existing != id);
            projects.len() != before
        })
        .map_err(|error| FetchError::backend(format!("{error:#}")))
    }
}
