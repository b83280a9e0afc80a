//! Named connection environments read from a TOML file.
//!
//! ```toml
//! [local]
//! uri = "bolt://localhost:7687"
//! user = "neo4j"
//! password = "secret"
//! description = "Local development instance"
//! ```

use crate::config;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

const INSECURE_PASSWORDS: &[&str] = &["password", "neo4j", "123456", "admin"];
const KNOWN_SCHEMES: &[&str] = &[
    "bolt://",
    "bolt+s://",
    "bolt+ssc://",
    "neo4j://",
    "neo4j+s://",
    "neo4j+ssc://",
];

#[derive(Debug, Error)]
pub enum EnvironmentError {
    #[error("failed to read environment file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid environment file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("environment '{name}' not found (available: {available})")]
    Unknown { name: String, available: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSettings {
    pub uri: String,
    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub description: Option<String>,
}

fn default_user() -> String {
    config::DEFAULT_USER.to_string()
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            uri: config::DEFAULT_BOLT_URI.to_string(),
            user: default_user(),
            password: String::new(),
            description: None,
        }
    }
}

/// Values given explicitly on the command line. Each one that is set wins
/// over whatever the environment file says.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub uri: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
}

impl ConnectionSettings {
    pub fn with_overrides(mut self, overrides: &Overrides) -> Self {
        if let Some(uri) = &overrides.uri {
            self.uri = uri.clone();
        }
        if let Some(user) = &overrides.user {
            self.user = user.clone();
        }
        if let Some(password) = &overrides.password {
            self.password = password.clone();
        }
        self
    }

    /// Non-fatal problems worth a warning.
    pub fn warnings(&self, name: &str) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.uri.trim().is_empty() {
            warnings.push(format!("environment '{name}' has an empty uri"));
        } else if !KNOWN_SCHEMES.iter().any(|s| self.uri.starts_with(s)) {
            warnings.push(format!(
                "environment '{name}' uri {:?} should start with bolt:// or neo4j://",
                self.uri
            ));
        }
        if INSECURE_PASSWORDS.contains(&self.password.as_str()) {
            warnings.push(format!("environment '{name}' uses a default or insecure password"));
        }
        warnings
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct Environments {
    entries: BTreeMap<String, ConnectionSettings>,
}

impl Environments {
    pub fn parse(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    pub fn load(path: &Path) -> Result<Self, EnvironmentError> {
        let text = std::fs::read_to_string(path).map_err(|source| EnvironmentError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text).map_err(|source| EnvironmentError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Loads `path` if it exists; a missing file means no named environments.
    pub fn load_optional(path: &Path) -> Result<Self, EnvironmentError> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn get(&self, name: &str) -> Result<&ConnectionSettings, EnvironmentError> {
        self.entries.get(name).ok_or_else(|| EnvironmentError::Unknown {
            name: name.to_string(),
            available: if self.entries.is_empty() {
                "none".to_string()
            } else {
                self.names().collect::<Vec<_>>().join(", ")
            },
        })
    }

    /// Settings for `name` (or the built-in defaults when no name is given)
    /// with explicit overrides applied on top.
    pub fn resolve(
        &self,
        name: Option<&str>,
        overrides: &Overrides,
    ) -> Result<ConnectionSettings, EnvironmentError> {
        let base = match name {
            Some(name) => self.get(name)?.clone(),
            None => ConnectionSettings::default(),
        };
        Ok(base.with_overrides(overrides))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ConnectionSettings)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn warnings(&self) -> Vec<String> {
        self.iter().flat_map(|(name, s)| s.warnings(name)).collect()
    }
}

/// Starter file written by `envs --init`.
pub const EXAMPLE_ENVIRONMENTS: &str = r#"[local]
uri = "bolt://localhost:7687"
user = "neo4j"
password = "change-me"
description = "Local development instance"

[remote]
uri = "bolt://remote-server:7687"
user = "neo4j"
password = "change-me-too"
description = "Remote production instance"
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SAMPLE: &str = r#"
[local]
uri = "bolt://localhost:7687"
user = "neo4j"
password = "password"
description = "dev box"

[remote]
uri = "http://graph.example.org:7474"
password = "s3cret"
"#;

    #[test]
    fn parse_environments() {
        let envs = Environments::parse(SAMPLE).unwrap();
        assert_eq!(envs.names().collect::<Vec<_>>(), vec!["local", "remote"]);
        let local = envs.get("local").unwrap();
        assert_eq!(local.uri, "bolt://localhost:7687");
        assert_eq!(local.description.as_deref(), Some("dev box"));
        let remote = envs.get("remote").unwrap();
        assert_eq!(remote.user, "neo4j");
    }

    #[test]
    fn unknown_environment_lists_available() {
        let envs = Environments::parse(SAMPLE).unwrap();
        let err = envs.get("staging").unwrap_err();
        assert!(err.to_string().contains("local, remote"));
    }

    #[test]
    fn explicit_values_override_file() {
        let envs = Environments::parse(SAMPLE).unwrap();
        let overrides = Overrides {
            uri: Some("bolt://other:7687".into()),
            user: None,
            password: Some("override".into()),
        };
        let settings = envs.resolve(Some("local"), &overrides).unwrap();
        assert_eq!(settings.uri, "bolt://other:7687");
        assert_eq!(settings.user, "neo4j");
        assert_eq!(settings.password, "override");
    }

    #[test]
    fn resolve_without_name_uses_defaults() {
        let envs = Environments::default();
        let settings = envs.resolve(None, &Overrides::default()).unwrap();
        assert_eq!(settings.uri, config::DEFAULT_BOLT_URI);
        assert_eq!(settings.user, config::DEFAULT_USER);
    }

    #[test]
    fn validation_warnings() {
        let envs = Environments::parse(SAMPLE).unwrap();
        let warnings = envs.warnings();
        assert_eq!(warnings.len(), 2);
        assert!(warnings.iter().any(|w| w.contains("'local'") && w.contains("insecure")));
        assert!(warnings.iter().any(|w| w.contains("'remote'") && w.contains("bolt://")));
    }

    #[test]
    fn secure_schemes_are_accepted() {
        let settings = ConnectionSettings {
            uri: "neo4j+s://abc.databases.neo4j.io".into(),
            password: "long-random".into(),
            ..ConnectionSettings::default()
        };
        assert!(settings.warnings("aura").is_empty());
    }

    #[test]
    fn load_optional_missing_file() {
        let dir = TempDir::new().unwrap();
        let envs = Environments::load_optional(&dir.path().join("nope.toml")).unwrap();
        assert!(envs.is_empty());
    }

    #[test]
    fn load_reports_parse_errors() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[local\nuri = 1").unwrap();
        assert!(matches!(
            Environments::load(&path),
            Err(EnvironmentError::Parse { .. })
        ));
    }

    #[test]
    fn example_file_parses() {
        let envs = Environments::parse(EXAMPLE_ENVIRONMENTS).unwrap();
        assert!(envs.get("local").is_ok());
        assert!(envs.get("remote").is_ok());
        assert!(envs.warnings().is_empty());
    }
}
