//! Persistent defaults for the command line
//!
//! Stored as JSON in the platform-specific config folder:
//! - Linux: ~/.config/s3-bucket-manager/settings.json
//! - Windows: %APPDATA%/s3-bucket-manager/settings.json
//! - macOS: ~/Library/Application Support/s3-bucket-manager/settings.json

use anyhow::{bail, Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::s3::config::{MultipartConfig, S3ClientConfig, DEFAULT_MAX_CONCURRENCY, DEFAULT_MULTIPART_THRESHOLD};
use crate::s3::types::StorageClass;

const DEFAULT_PRESIGN_TTL_SECS: u64 = 3600;

/// Defaults applied when a flag is not given
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// AWS profile name
    pub profile: Option<String>,

    pub region: Option<String>,

    /// Custom S3 endpoint, e.g. MinIO
    pub endpoint_url: Option<String>,

    pub force_path_style: bool,

    /// Bucket used when none is given
    pub bucket: Option<String>,

    /// Create the bucket on bind when it is missing
    pub create_if_missing: bool,

    pub storage_class: StorageClass,

    /// Bytes above which uploads go multipart
    pub multipart_threshold: usize,

    pub max_concurrency: usize,

    pub presign_ttl_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            profile: None,
            region: None,
            endpoint_url: None,
            force_path_style: false,
            bucket: None,
            create_if_missing: false,
            storage_class: StorageClass::default(),
            multipart_threshold: DEFAULT_MULTIPART_THRESHOLD,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            presign_ttl_secs: DEFAULT_PRESIGN_TTL_SECS,
        }
    }
}

impl Settings {
    /// Load settings from the config folder, returning defaults if the file doesn't exist
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::settings_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!("Settings file not found, using defaults");
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings from {:?}", path))?;

        let settings: Settings = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse settings from {:?}", path))?;

        tracing::info!(
            "Loaded settings: profile={:?}, region={:?}, bucket={:?}",
            settings.profile,
            settings.region,
            settings.bucket
        );

        Ok(settings)
    }

    /// Save settings to the config folder
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::settings_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        // Create parent directories if they don't exist
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create settings directory {:?}", parent))?;
        }

        let contents = serde_json::to_string_pretty(self).context("Failed to serialize settings")?;

        fs::write(path, contents).with_context(|| format!("Failed to write settings to {:?}", path))?;

        tracing::debug!("Saved settings to {:?}", path);

        Ok(())
    }

    /// Change one setting by its JSON field name. An empty value clears
    /// optional fields.
    pub fn set(&mut self, name: &str, value: &str) -> Result<()> {
        fn optional(value: &str) -> Option<String> {
            (!value.is_empty()).then(|| value.to_string())
        }
        fn parsed<T>(name: &str, value: &str) -> Result<T>
        where
            T: std::str::FromStr,
            T::Err: std::error::Error + Send + Sync + 'static,
        {
            value
                .parse()
                .with_context(|| format!("Invalid value '{}' for {}", value, name))
        }

        match name {
            "profile" => self.profile = optional(value),
            "region" => self.region = optional(value),
            "endpoint_url" => self.endpoint_url = optional(value),
            "bucket" => self.bucket = optional(value),
            "force_path_style" => self.force_path_style = parsed(name, value)?,
            "create_if_missing" => self.create_if_missing = parsed(name, value)?,
            "storage_class" => self.storage_class = parsed(name, value)?,
            "multipart_threshold" => self.multipart_threshold = parsed(name, value)?,
            "max_concurrency" => self.max_concurrency = parsed(name, value)?,
            "presign_ttl_secs" => self.presign_ttl_secs = parsed(name, value)?,
            _ => bail!("Unknown setting '{}'", name),
        }

        tracing::debug!("Set {} = {:?}", name, value);
        Ok(())
    }

    /// Get the path to the settings file
    pub fn settings_path() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("org", "github.n-orlov", "s3-bucket-manager")
            .context("Failed to determine settings directory")?;

        Ok(proj_dirs.config_dir().join("settings.json"))
    }

    /// Client settings; credentials are left to the SDK's default chain
    pub fn client_config(&self) -> S3ClientConfig {
        S3ClientConfig {
            profile: self.profile.clone(),
            endpoint_url: self.endpoint_url.clone(),
            force_path_style: self.force_path_style,
            region: self.region.clone(),
            access_key_id: None,
            secret_access_key: None,
            multipart: MultipartConfig {
                threshold: self.multipart_threshold,
                max_concurrency: self.max_concurrency,
                ..Default::default()
            },
        }
    }

    pub fn presign_ttl(&self) -> Duration {
        Duration::from_secs(self.presign_ttl_secs)
    }
}
