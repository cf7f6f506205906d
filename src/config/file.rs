//! Locating and reading the proxy's TOML file
//!
//! The proxy normally runs as a system service, so the system-wide file is
//! the usual one. A file next to the working directory or in the invoking
//! user's config directory takes precedence for local runs.

use std::path::{Path, PathBuf};

use super::Config;
use crate::error::{Error, Result};

/// A parsed configuration and where it came from
#[derive(Debug, Clone)]
pub struct ConfigFile {
    /// Empty when no file was found and defaults are in use
    pub path: PathBuf,
    pub config: Config,
}

/// One place the proxy looks for its configuration
#[derive(Debug, Clone)]
pub struct SearchLocation {
    pub path: PathBuf,
    /// Short label for `config --paths`
    pub label: &'static str,
}

const FILE_STEM: &str = "ssh-audit-proxy";

/// Locations checked when no `--config` is given, first match wins
///
/// 1. `./ssh-audit-proxy.toml`
/// 2. `<user config dir>/ssh-audit-proxy/config.toml`
///    (`$XDG_CONFIG_HOME` or `~/.config` on Linux)
/// 3. `/etc/ssh-audit-proxy/config.toml`
pub fn config_search_paths() -> Vec<SearchLocation> {
    let mut locations = Vec::with_capacity(3);

    if let Ok(cwd) = std::env::current_dir() {
        locations.push(SearchLocation {
            path: cwd.join(format!("{}.toml", FILE_STEM)),
            label: "working directory",
        });
    }

    if let Some(dir) = dirs::config_dir() {
        locations.push(SearchLocation {
            path: dir.join(FILE_STEM).join("config.toml"),
            label: "user config directory",
        });
    }

    locations.push(SearchLocation {
        path: Path::new("/etc").join(FILE_STEM).join("config.toml"),
        label: "system-wide",
    });

    locations
}

/// First existing file among the search locations
pub fn find_config_file() -> Option<PathBuf> {
    let found = config_search_paths()
        .into_iter()
        .map(|location| location.path)
        .find(|path| path.is_file());
    match &found {
        Some(path) => tracing::info!(path = %path.display(), "Found configuration file"),
        None => tracing::debug!("No configuration file in any search location"),
    }
    found
}

/// Read and parse one configuration file
pub fn load_config(path: &Path) -> Result<ConfigFile> {
    tracing::debug!(path = %path.display(), "Reading configuration");

    let text = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Cannot read {}: {}", path.display(), e)))?;
    let config = toml::from_str::<Config>(&text)
        .map_err(|e| Error::Config(format!("Invalid configuration in {}: {}", path.display(), e)))?;

    Ok(ConfigFile {
        path: path.to_path_buf(),
        config,
    })
}

/// Load `path` if given, else the first file found, else the defaults
pub fn load_config_from_path_or_default(path: Option<&Path>) -> Result<ConfigFile> {
    if let Some(path) = path {
        return load_config(path);
    }
    match find_config_file() {
        Some(found) => load_config(&found),
        None => {
            tracing::info!("No configuration file found, using defaults");
            Ok(ConfigFile {
                path: PathBuf::new(),
                config: Config::default(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_search_ends_with_system_wide_file() {
        let locations = config_search_paths();
        assert!(locations.iter().all(|l| l.path.is_absolute() && !l.label.is_empty()));

        let last = locations.last().unwrap();
        assert_eq!(last.path, PathBuf::from("/etc/ssh-audit-proxy/config.toml"));
        assert_eq!(last.label, "system-wide");
    }

    #[test]
    fn test_working_directory_file_is_checked_first() {
        let cwd = std::env::current_dir().unwrap();
        let first = &config_search_paths()[0];
        assert_eq!(first.path, cwd.join("ssh-audit-proxy.toml"));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("proxy.toml");
        std::fs::write(
            &path,
            "[server]\nlisten = \"127.0.0.1:2022\"\n\n[directory]\nhost = \"tunnels.example.com\"\n",
        )
        .unwrap();

        let file = load_config(&path).unwrap();
        assert_eq!(file.path, path);
        assert_eq!(file.config.server.listen, "127.0.0.1:2022");
        assert_eq!(file.config.directory.host, "tunnels.example.com");
        assert_eq!(file.config.directory.timeout, "10s");
        assert_eq!(file.config.relay.buffer_size, 1024);
    }

    #[test]
    fn test_unreadable_and_malformed_files_are_config_errors() {
        let missing = load_config(Path::new("/nonexistent/ssh-audit-proxy.toml"));
        assert!(matches!(missing, Err(Error::Config(ref m)) if m.starts_with("Cannot read")));

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.toml");
        std::fs::write(&path, "[server\nlisten =").unwrap();
        let broken = load_config(&path);
        assert!(matches!(broken, Err(Error::Config(ref m)) if m.starts_with("Invalid configuration")));
    }

    #[test]
    fn test_explicit_path_skips_search() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(&path, "log_level = \"warn\"\n").unwrap();

        let file = load_config_from_path_or_default(Some(&path)).unwrap();
        assert_eq!(file.config.log_level, "warn");
        assert_eq!(file.path, path);
    }
}
