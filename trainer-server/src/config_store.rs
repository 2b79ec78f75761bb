//! Application configuration store
//!
//! The authoritative in-memory map of declared applications, persisted to a
//! single JSON file on every mutation. Mutations are serialized behind one
//! mutex; readers get snapshot copies.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use trainer_core::{ApplicationConfiguration, VersionConfig};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no such application '{0}'")]
    NotFound(String),

    #[error("application '{0}' already exists")]
    AlreadyExists(String),

    #[error("{0}")]
    InvalidArgument(String),

    #[error("failed to persist configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode configuration: {0}")]
    Encode(#[from] serde_json::Error),
}

pub struct ConfigStore {
    path: PathBuf,
    apps: Mutex<BTreeMap<String, ApplicationConfiguration>>,
}

impl ConfigStore {
    /// Open the store at `path`, reading existing declarations if the file
    /// is present.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let apps = if path.exists() {
            let raw = fs::read_to_string(&path)?;
            serde_json::from_str(&raw)?
        } else {
            BTreeMap::new()
        };
        Ok(Self {
            path,
            apps: Mutex::new(apps),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Snapshot of all declared applications, sorted by name.
    pub fn get_all(&self) -> BTreeMap<String, ApplicationConfiguration> {
        self.apps.lock().clone()
    }

    pub fn get(&self, name: &str) -> Result<ApplicationConfiguration, ConfigError> {
        self.apps
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| ConfigError::NotFound(name.to_string()))
    }

    /// Declare a new application. The version map starts empty; versions are
    /// only ever added through `append_version`.
    pub fn add(
        &self,
        name: &str,
        mut config: ApplicationConfiguration,
    ) -> Result<ApplicationConfiguration, ConfigError> {
        validate_counts(config.min_deployment, config.desired_deployment)?;

        let mut apps = self.apps.lock();
        if apps.contains_key(name) {
            return Err(ConfigError::AlreadyExists(name.to_string()));
        }
        config.name = name.to_string();
        config.config.clear();
        apps.insert(name.to_string(), config.clone());
        self.save_locked(&apps)?;
        Ok(config)
    }

    pub fn update_deployment_counts(
        &self,
        name: &str,
        min: u32,
        desired: u32,
    ) -> Result<ApplicationConfiguration, ConfigError> {
        validate_counts(min, desired)?;

        let mut apps = self.apps.lock();
        let app = apps
            .get_mut(name)
            .ok_or_else(|| ConfigError::NotFound(name.to_string()))?;
        app.min_deployment = min;
        app.desired_deployment = desired;
        let updated = app.clone();
        self.save_locked(&apps)?;
        Ok(updated)
    }

    /// Publish a new version for an application. The store assigns the next
    /// integer version; version slots are never reused.
    pub fn append_version(
        &self,
        name: &str,
        mut version_config: VersionConfig,
    ) -> Result<VersionConfig, ConfigError> {
        let mut apps = self.apps.lock();
        let app = apps
            .get_mut(name)
            .ok_or_else(|| ConfigError::NotFound(name.to_string()))?;
        let version = app.next_version();
        version_config.version = version;
        app.config.insert(version, version_config.clone());
        self.save_locked(&apps)?;
        Ok(version_config)
    }

    /// Serialize the full store, write-temp-then-rename so a crash mid-write
    /// never leaves a torn file.
    pub fn save(&self) -> Result<(), ConfigError> {
        let apps = self.apps.lock();
        self.save_locked(&apps)
    }

    fn save_locked(
        &self,
        apps: &BTreeMap<String, ApplicationConfiguration>,
    ) -> Result<(), ConfigError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let encoded = serde_json::to_vec_pretty(apps)?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, encoded)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

fn validate_counts(min: u32, desired: u32) -> Result<(), ConfigError> {
    if min > desired {
        return Err(ConfigError::InvalidArgument(format!(
            "min deployment {min} exceeds desired deployment {desired}"
        )));
    }
    Ok(())
}
