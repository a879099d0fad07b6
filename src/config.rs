use std::{collections::HashSet, fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::{Error, data_source::cursor::DEFAULT_CHUNK_SIZE};

fn default_max_connections() -> u32 {
    10
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_export_partition_size() -> usize {
    10_000
}

/// A named backend connection configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    /// Data source this profile belongs to (`postgres`, `mysql`, `sqlite`).
    #[serde(rename = "type")]
    pub source_type: String,
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Rows buffered per cursor page.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Rows per exported file.
    #[serde(default = "default_export_partition_size")]
    pub export_partition_size: usize,
}

impl Profile {
    pub fn new(
        name: impl Into<String>,
        source_type: impl Into<String>,
        url: impl Into<String>,
    ) -> Self {
        Profile {
            name: name.into(),
            source_type: source_type.into(),
            url: url.into(),
            max_connections: default_max_connections(),
            chunk_size: default_chunk_size(),
            export_partition_size: default_export_partition_size(),
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub fn with_export_partition_size(mut self, rows: usize) -> Self {
        self.export_partition_size = rows;
        self
    }
}

/// All profiles known to the process, usually read from a `profiles.toml`:
///
/// ```toml
/// [[profiles]]
/// name = "pg"
/// type = "postgres"
/// url = "postgres://localhost/app"
/// chunk_size = 500
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileConfig {
    #[serde(default)]
    profiles: Vec<Profile>,
}

impl ProfileConfig {
    pub fn new(profiles: Vec<Profile>) -> Result<Self, Error> {
        let config = ProfileConfig { profiles };
        config.check_unique_names()?;
        Ok(config)
    }

    pub fn from_toml_str(source: &str) -> Result<Self, Error> {
        let config: ProfileConfig = toml::from_str(source)?;
        config.check_unique_names()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let source = fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&source)
    }

    pub fn get(&self, name: &str) -> Option<&Profile> {
        self.profiles.iter().find(|p| p.name == name)
    }

    pub fn profiles(&self) -> &[Profile] {
        &self.profiles
    }

    pub fn profiles_of_type<'a>(&'a self, source_type: &'a str) -> impl Iterator<Item = &'a Profile> {
        self.profiles.iter().filter(move |p| p.source_type == source_type)
    }

    fn check_unique_names(&self) -> Result<(), Error> {
        let mut seen = HashSet::new();
        for profile in &self.profiles {
            if !seen.insert(profile.name.as_str()) {
                return Err(Error::Configuration(format!(
                    "profile `{}` is defined more than once",
                    profile.name
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROFILES: &str = r#"
[[profiles]]
name = "warehouse"
type = "postgres"
url = "postgres://localhost/warehouse"
chunk_size = 500

[[profiles]]
name = "local"
type = "sqlite"
url = "sqlite::memory:"
"#;

    #[test]
    fn parses_profiles_with_defaults() {
        let config = ProfileConfig::from_toml_str(PROFILES).unwrap();
        let warehouse = config.get("warehouse").unwrap();
        assert_eq!(warehouse.chunk_size, 500);
        assert_eq!(warehouse.max_connections, 10);

        let local = config.get("local").unwrap();
        assert_eq!(local.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(local.export_partition_size, 10_000);
        assert_eq!(config.profiles_of_type("sqlite").count(), 1);
        assert!(config.get("missing").is_none());
    }

    #[test]
    fn duplicate_profile_names_are_rejected() {
        let twice = format!("{PROFILES}\n[[profiles]]\nname = \"local\"\ntype = \"sqlite\"\nurl = \"sqlite::memory:\"\n");
        assert!(matches!(
            ProfileConfig::from_toml_str(&twice),
            Err(Error::Configuration(_))
        ));
        let profiles = vec![
            Profile::new("a", "sqlite", "sqlite::memory:"),
            Profile::new("a", "sqlite", "sqlite::memory:"),
        ];
        assert!(ProfileConfig::new(profiles).is_err());
    }

    #[test]
    fn load_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = ProfileConfig::load(dir.path().join("profiles.toml")).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }
}
