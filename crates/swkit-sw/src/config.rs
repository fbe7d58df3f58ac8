//! Deploy-time worker configuration.
//!
//! The generation tag and the precache manifest are the only inputs that
//! change between deployments. Both are fixed for the lifetime of a worker.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::store::Generation;

/// Configuration loading errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid generation tag {tag:?}: {reason}")]
    InvalidGeneration { tag: String, reason: &'static str },

    #[error("Invalid precache entry {entry:?}: {source}")]
    InvalidManifestEntry {
        entry: String,
        #[source]
        source: url::ParseError,
    },

    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Ordered, duplicate-free list of URLs populated at install time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<String>", into = "Vec<String>")]
pub struct PrecacheManifest {
    entries: Vec<String>,
}

impl PrecacheManifest {
    /// Build a manifest; later duplicates are dropped.
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut unique: Vec<String> = Vec::new();
        for entry in entries {
            let entry = entry.into();
            if !unique.contains(&entry) {
                unique.push(entry);
            }
        }
        Self { entries: unique }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(String::as_str)
    }

    /// Resolve every entry against the worker scope.
    pub fn resolve(&self, scope: &Url) -> Result<Vec<Url>, ConfigError> {
        let mut resolved: Vec<Url> = Vec::with_capacity(self.entries.len());
        for entry in &self.entries {
            let url = scope
                .join(entry)
                .map_err(|source| ConfigError::InvalidManifestEntry {
                    entry: entry.clone(),
                    source,
                })?;
            // "/" and "./" may resolve to the same URL.
            if !resolved.contains(&url) {
                resolved.push(url);
            }
        }
        Ok(resolved)
    }
}

impl From<Vec<String>> for PrecacheManifest {
    fn from(entries: Vec<String>) -> Self {
        Self::new(entries)
    }
}

impl From<PrecacheManifest> for Vec<String> {
    fn from(manifest: PrecacheManifest) -> Self {
        manifest.entries
    }
}

/// Worker configuration, supplied at build or deploy time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkerConfig {
    /// Tag of the generation this worker installs and activates.
    pub generation: Generation,

    /// Resources that must be resident before activation.
    #[serde(default)]
    pub precache: PrecacheManifest,
}

impl WorkerConfig {
    pub fn new(generation: Generation, precache: PrecacheManifest) -> Self {
        Self {
            generation,
            precache,
        }
    }

    /// Parse a JSON configuration document.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load a JSON configuration file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SCENARIO: &str = r#"{
        "generation": "ssait-odonto-v1",
        "precache": ["/", "/static/css/main.css", "/static/js/main.js", "/manifest.json", "/favicon.ico"]
    }"#;

    #[test]
    fn test_parse_config() {
        let config = WorkerConfig::from_json_str(SCENARIO).unwrap();
        assert_eq!(config.generation.as_str(), "ssait-odonto-v1");
        assert_eq!(config.precache.len(), 5);
        assert_eq!(config.precache.iter().nth(3), Some("/manifest.json"));
    }

    #[test]
    fn test_invalid_generation_rejected_at_load() {
        let result = WorkerConfig::from_json_str(r#"{ "generation": "", "precache": [] }"#);
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let result = WorkerConfig::from_json_str(r#"{ "generation": "v1", "debug": true }"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_manifest_dedup_keeps_first_position() {
        let manifest = PrecacheManifest::new(["/a.js", "/b.css", "/a.js", "/c.png"]);
        let entries: Vec<&str> = manifest.iter().collect();
        assert_eq!(entries, vec!["/a.js", "/b.css", "/c.png"]);
    }

    #[test]
    fn test_manifest_resolves_against_scope() {
        let scope = Url::parse("https://clinic.example/app/").unwrap();
        let manifest = PrecacheManifest::new(["./", "/favicon.ico", "static/js/main.js"]);
        let urls = manifest.resolve(&scope).unwrap();

        assert_eq!(urls[0].as_str(), "https://clinic.example/app/");
        assert_eq!(urls[1].as_str(), "https://clinic.example/favicon.ico");
        assert_eq!(urls[2].as_str(), "https://clinic.example/app/static/js/main.js");
    }

    #[test]
    fn test_from_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SCENARIO.as_bytes()).unwrap();

        let config = WorkerConfig::from_path(file.path()).unwrap();
        assert_eq!(config.generation.as_str(), "ssait-odonto-v1");
    }

    #[test]
    fn test_from_missing_path() {
        let result = WorkerConfig::from_path("/nonexistent/swkit/worker.json");
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }
}
