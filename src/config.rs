//! Configuration file loading.
//!
//! A hydra file declares one stack and, optionally, a set of local programs
//! to supervise alongside it. YAML (`.yaml`, `.yml`) and TOML (`.toml`) are
//! both accepted:
//!
//! ```yaml
//! name: demo
//! stack:
//!   engine: docker://
//!   timeout: 30s
//!   containers:
//!     - name: web
//!       image: nginx
//!       cmd: ["nginx", "-g", "daemon off;"]
//!       ports: ["8080:80/tcp"]
//! services:
//!   programs:
//!     - name: worker
//!       command: ./worker.sh
//! ```
//!
//! When no path is given, the current directory is searched for the names in
//! [`env::CONFIG_FILE_NAMES`].

use crate::env;
use crate::process::ProcessManager;
use crate::stack::Stack;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Configuration loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File could not be read
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// YAML parse error
    #[error("invalid YAML in {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// TOML parse error
    #[error("invalid TOML in {path}: {source}")]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    /// File extension is neither YAML nor TOML
    #[error("unsupported config format {0:?}; expected .yaml, .yml or .toml")]
    UnsupportedFormat(PathBuf),

    /// No path given and nothing found in the search directory
    #[error("no config file found (looked for {})", env::CONFIG_FILE_NAMES.join(", "))]
    NotFound,
}

/// Supported file formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Yaml,
    Toml,
}

impl Format {
    /// Format implied by a path's extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()?.to_ascii_lowercase().as_str() {
            "yaml" | "yml" => Some(Format::Yaml),
            "toml" => Some(Format::Toml),
            _ => None,
        }
    }
}

/// A parsed hydra file.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HydraConfig {
    /// Project name; used as the stack name when the stack has none
    pub name: String,
    /// The container stack
    pub stack: Stack,
    /// Local programs supervised next to the stack
    pub services: ProcessManager,
}

impl HydraConfig {
    /// Load a file, picking the parser from its extension.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read, has an unknown extension or
    /// does not parse.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let format =
            Format::from_path(path).ok_or_else(|| ConfigError::UnsupportedFormat(path.into()))?;

        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.into(),
            source,
        })?;

        let config = Self::parse(&content, format).map_err(|e| match e {
            ParseError::Yaml(source) => ConfigError::Yaml {
                path: path.into(),
                source,
            },
            ParseError::Toml(source) => ConfigError::Toml {
                path: path.into(),
                source,
            },
        })?;

        info!(path = %path.display(), containers = config.stack.containers.len(), "loaded config");
        Ok(config)
    }

    /// Load `path`, or the first known config file in `dir` when `path` is
    /// `None`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NotFound`] when nothing is found, or any
    /// [`HydraConfig::load`] error.
    pub fn discover(path: Option<&Path>, dir: &Path) -> Result<Self, ConfigError> {
        if let Some(path) = path {
            return Self::load(path);
        }

        for name in env::CONFIG_FILE_NAMES {
            let candidate = dir.join(name);
            debug!("Checking for config file: {:?}", candidate);
            if candidate.is_file() {
                return Self::load(candidate);
            }
        }

        Err(ConfigError::NotFound)
    }

    fn parse(content: &str, format: Format) -> Result<Self, ParseError> {
        let mut config: Self = match format {
            Format::Yaml => serde_yaml::from_str(content).map_err(ParseError::Yaml)?,
            Format::Toml => toml::from_str(content).map_err(ParseError::Toml)?,
        };

        if config.stack.name.is_empty() {
            config.stack.name = config.name.clone();
        }

        Ok(config)
    }

    /// Render as YAML.
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails.
    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }
}

enum ParseError {
    Yaml(serde_yaml::Error),
    Toml(toml::de::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::OverflowPolicy;
    use std::io::Write;
    use tempfile::TempDir;

    const YAML: &str = r#"
name: demo
stack:
  engine: docker://
  timeout: 5s
  log_overflow: drop_oldest
  scripts:
    hello: echo hello
  containers:
    - name: web
      image: nginx
      cmd: ["nginx", "-g", "daemon off;"]
      ports: ["8080:80/tcp"]
      shm: 64m
      pwd: /srv
      env:
        MODE: prod
    - engine: shell://hello
services:
  programs:
    - name: worker
      command: sleep 1
      autorestart: true
"#;

    const TOML: &str = r#"
name = "demo"

[stack]
engine = "kubernetes://myns"

[[stack.containers]]
name = "web"
image = "nginx"
ports = ["8080:80"]
"#;

    fn write(dir: &TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_load_yaml() {
        let dir = TempDir::new().unwrap();
        let config = HydraConfig::load(write(&dir, "hydra.yaml", YAML)).unwrap();

        assert_eq!(config.name, "demo");
        assert_eq!(config.stack.name, "demo");
        assert_eq!(config.stack.engine, "docker://");
        assert_eq!(config.stack.timeout, "5s");
        assert_eq!(config.stack.log_overflow, OverflowPolicy::DropOldest);
        assert_eq!(config.stack.scripts["hello"], "echo hello");

        let web = &config.stack.containers[0];
        assert_eq!(web.cmd, vec!["nginx", "-g", "daemon off;"]);
        assert_eq!(web.shared_memory, "64m");
        assert_eq!(web.working_dir, "/srv");
        assert_eq!(web.env["MODE"], "prod");
        assert_eq!(config.stack.containers[1].engine, "shell://hello");

        assert_eq!(config.services.programs.len(), 1);
        assert!(config.services.programs[0].autorestart);
    }

    #[test]
    fn test_load_toml() {
        let dir = TempDir::new().unwrap();
        let config = HydraConfig::load(write(&dir, "hydra.toml", TOML)).unwrap();

        assert_eq!(config.stack.engine, "kubernetes://myns");
        assert_eq!(config.stack.containers[0].ports, vec!["8080:80"]);
        assert!(config.services.programs.is_empty());
    }

    #[test]
    fn test_unsupported_extension() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "hydra.json", "{}");
        assert!(matches!(
            HydraConfig::load(path),
            Err(ConfigError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_parse_error_names_file() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "broken.yaml", "stack: [unterminated");
        let err = HydraConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Yaml { .. }));
        assert!(err.to_string().contains("broken.yaml"));
    }

    #[test]
    fn test_missing_file() {
        let dir = TempDir::new().unwrap();
        let err = HydraConfig::load(dir.path().join("absent.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_discover() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            HydraConfig::discover(None, dir.path()),
            Err(ConfigError::NotFound)
        ));

        write(&dir, "hydra.toml", TOML);
        let config = HydraConfig::discover(None, dir.path()).unwrap();
        assert_eq!(config.stack.containers[0].name, "web");
    }
}
