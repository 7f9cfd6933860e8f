//! Scheduling configuration and the static directory file format.

use std::path::{Path, PathBuf};

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::error::{SchedulingError, SchedulingResult};
use crate::services::Principal;

/// Prefix for environment overrides, e.g. `CALDAV_SCHED_IMIP_ENABLED=true`.
const ENV_PREFIX: &str = "CALDAV_SCHED";

/// Scheduling configuration at ~/.config/caldav-sched/config.toml
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulingConfig {
    /// Email-based delivery (iMIP) to `mailto:` organizers and attendees.
    pub imip_enabled: bool,
    /// Server-to-server scheduling (iSchedule) with non-local users.
    pub ischedule_enabled: bool,
}

impl SchedulingConfig {
    pub fn config_path() -> SchedulingResult<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| SchedulingError::Config("Could not determine config directory".into()))?
            .join("caldav-sched");

        Ok(config_dir.join("config.toml"))
    }

    /// Load from `path` (or the default location) layered with environment overrides.
    ///
    /// A missing file is not an error.
    pub fn load(path: Option<&Path>) -> SchedulingResult<Self> {
        let config_path = match path {
            Some(p) => expand_path(p),
            None => Self::config_path()?,
        };

        Config::builder()
            .add_source(File::from(config_path).required(false))
            .add_source(Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()
            .map_err(|e| SchedulingError::Config(e.to_string()))?
            .try_deserialize()
            .map_err(|e| SchedulingError::Config(e.to_string()))
    }
}

/// Principals served by a [`StaticDirectory`](crate::directory::StaticDirectory).
///
/// ```toml
/// [[principals]]
/// uid = "alice"
/// canonical_address = "urn:uuid:alice"
/// addresses = ["mailto:alice@example.com"]
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DirectoryConfig {
    #[serde(default)]
    pub principals: Vec<Principal>,
}

impl DirectoryConfig {
    pub fn load(path: &Path) -> SchedulingResult<Self> {
        let path = expand_path(path);
        let content = std::fs::read_to_string(&path).map_err(|e| {
            SchedulingError::Config(format!("Could not read {}: {e}", path.display()))
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> SchedulingResult<Self> {
        toml::from_str(content).map_err(|e| SchedulingError::Config(e.to_string()))
    }
}

fn expand_path(path: &Path) -> PathBuf {
    PathBuf::from(shellexpand::tilde(&path.to_string_lossy()).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Hosting;

    #[test]
    fn test_missing_config_file_uses_defaults() {
        let config = SchedulingConfig::load(Some(Path::new("/nonexistent/caldav-sched.toml")))
            .expect("Should load defaults");
        assert!(!config.ischedule_enabled);
    }

    #[test]
    fn test_parse_directory_config() {
        let config = DirectoryConfig::parse(
            r#"
[[principals]]
uid = "alice"
canonical_address = "urn:uuid:alice"
addresses = ["mailto:alice@example.com"]

[[principals]]
uid = "bob"
canonical_address = "mailto:bob@example.com"
enabled_as_organizer = false
hosting = "other-server"
"#,
        )
        .expect("Should parse");

        assert_eq!(config.principals.len(), 2);
        assert!(config.principals[0].enabled_as_organizer);
        assert_eq!(config.principals[0].hosting, Hosting::Local);
        assert!(!config.principals[1].enabled_as_organizer);
        assert_eq!(config.principals[1].hosting, Hosting::OtherServer);
    }
}
