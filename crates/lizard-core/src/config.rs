//! Offline cache configuration

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::error::{LizardError, LizardResult};

const ICON_SVG: &str = "data:image/svg+xml,<svg xmlns=\"http://www.w3.org/2000/svg\" viewBox=\"0 0 192 192\"><rect width=\"192\" height=\"192\" fill=\"%23000\" rx=\"20\"/><text x=\"96\" y=\"130\" text-anchor=\"middle\" font-size=\"120\">\u{1F98E}</text></svg>";
const BADGE_SVG: &str = "data:image/svg+xml,<svg xmlns=\"http://www.w3.org/2000/svg\" viewBox=\"0 0 96 96\"><text x=\"48\" y=\"65\" text-anchor=\"middle\" font-size=\"60\">\u{1F98E}</text></svg>";

/// Offline cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OfflineConfig {
    /// Logical bucket name, without the version suffix
    pub cache_name: String,

    /// Deployed version; the current bucket is `{cache_name}-v{version}`
    pub version: String,

    /// Origin the worker serves; relative manifest entries resolve against it
    pub origin: String,

    /// Assets required for offline operation, in install order
    pub manifest: Vec<String>,

    /// Document served when a navigation fails while offline
    pub shell_url: String,

    /// Directory holding the on-disk bucket store
    pub cache_dir: PathBuf,

    /// Optional bound on network fetches during serve. Unset means no timeout.
    pub network_timeout_secs: Option<u64>,

    /// How many times the host attempts an install before giving up
    pub install_attempts: u32,

    /// Tag dispatched by the background sync trigger
    pub sync_tag: String,

    /// Push notification settings
    pub notification: NotificationConfig,
}

/// Push notification settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub title: String,
    pub body: String,
    pub icon: String,
    pub badge: String,

    /// Vibration pattern in milliseconds
    pub vibrate: Vec<u32>,

    /// Page opened when the user clicks the notification
    pub open_url: String,
}

impl Default for OfflineConfig {
    fn default() -> Self {
        Self {
            cache_name: "lizard-tap".to_string(),
            version: "1.0.0".to_string(),
            origin: "http://localhost:8080/".to_string(),
            manifest: [
                "/",
                "/index.html",
                "/style.css",
                "/script.js",
                "/lizard-button.mp3",
                "/lizard-sound.wav",
                "/manifest.json",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            shell_url: "/index.html".to_string(),
            cache_dir: dirs::cache_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("lizard-tap"),
            network_timeout_secs: None,
            install_attempts: 1,
            sync_tag: "background-sync-score".to_string(),
            notification: NotificationConfig::default(),
        }
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            title: "Lizard Tap Game".to_string(),
            body: "Come back and tap more lizards!".to_string(),
            icon: ICON_SVG.to_string(),
            badge: BADGE_SVG.to_string(),
            vibrate: vec![100, 50, 100],
            open_url: "/".to_string(),
        }
    }
}

impl OfflineConfig {
    /// Load a configuration file. Missing fields fall back to defaults.
    pub fn load(path: impl AsRef<Path>) -> LizardResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        debug!(path = %path.display(), bucket = %config.bucket_name(), "Loaded configuration");
        Ok(config)
    }

    /// Write the configuration as pretty JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> LizardResult<()> {
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Full name of the current bucket.
    pub fn bucket_name(&self) -> String {
        format!("{}-v{}", self.cache_name, self.version)
    }

    /// Parsed origin.
    pub fn origin_url(&self) -> LizardResult<Url> {
        let origin = Url::parse(&self.origin)?;
        if !matches!(origin.scheme(), "http" | "https") {
            return Err(LizardError::config(format!(
                "origin must be http or https, got {}",
                origin.scheme()
            )));
        }
        Ok(origin)
    }

    /// Resolve a manifest entry or any relative URL against the origin.
    pub fn resolve(&self, url: &str) -> LizardResult<Url> {
        Ok(self.origin_url()?.join(url)?)
    }

    /// The manifest as absolute URLs, in order.
    pub fn manifest_urls(&self) -> LizardResult<Vec<Url>> {
        let origin = self.origin_url()?;
        self.manifest
            .iter()
            .map(|entry| origin.join(entry).map_err(LizardError::from))
            .collect()
    }

    /// Network timeout for the serve path, if one is configured.
    pub fn network_timeout(&self) -> Option<Duration> {
        self.network_timeout_secs.map(Duration::from_secs)
    }

    /// Check the configuration for values the cache layer cannot work with.
    pub fn validate(&self) -> LizardResult<()> {
        if self.cache_name.trim().is_empty() {
            return Err(LizardError::config("cache_name must not be empty"));
        }
        if self.version.trim().is_empty() {
            return Err(LizardError::config("version must not be empty"));
        }
        if self.install_attempts == 0 {
            return Err(LizardError::config("install_attempts must be at least 1"));
        }
        self.manifest_urls()?;
        self.resolve(&self.shell_url)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = OfflineConfig::default();
        assert_eq!(config.bucket_name(), "lizard-tap-v1.0.0");
        assert_eq!(config.manifest.len(), 7);
        assert_eq!(config.shell_url, "/index.html");
        assert_eq!(config.network_timeout(), None);
        assert_eq!(config.notification.vibrate, vec![100, 50, 100]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_manifest_resolves_against_origin() {
        let config = OfflineConfig {
            origin: "https://lizard.example/game/".to_string(),
            manifest: vec!["/".to_string(), "style.css".to_string()],
            ..Default::default()
        };

        let urls = config.manifest_urls().unwrap();
        assert_eq!(urls[0].as_str(), "https://lizard.example/");
        assert_eq!(urls[1].as_str(), "https://lizard.example/game/style.css");
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let empty_name = OfflineConfig {
            cache_name: " ".to_string(),
            ..Default::default()
        };
        assert!(matches!(empty_name.validate(), Err(LizardError::Config(_))));

        let ftp = OfflineConfig {
            origin: "ftp://lizard.example/".to_string(),
            ..Default::default()
        };
        assert!(matches!(ftp.validate(), Err(LizardError::Config(_))));

        let bad_origin = OfflineConfig {
            origin: "not a url".to_string(),
            ..Default::default()
        };
        assert!(matches!(bad_origin.validate(), Err(LizardError::Url(_))));

        let no_attempts = OfflineConfig {
            install_attempts: 0,
            ..Default::default()
        };
        assert!(no_attempts.validate().is_err());
    }

    #[test]
    fn test_load_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lizard.json");
        std::fs::write(&path, r#"{ "version": "2.0.0", "network_timeout_secs": 5 }"#).unwrap();

        let config = OfflineConfig::load(&path).unwrap();
        assert_eq!(config.bucket_name(), "lizard-tap-v2.0.0");
        assert_eq!(config.network_timeout(), Some(Duration::from_secs(5)));
        assert_eq!(config.sync_tag, "background-sync-score");
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lizard.json");
        let config = OfflineConfig {
            cache_dir: dir.path().join("caches"),
            ..Default::default()
        };

        config.save(&path).unwrap();
        assert_eq!(OfflineConfig::load(&path).unwrap(), config);
    }
}
