use directories::ProjectDirs;
use std::path::PathBuf;

use crate::{Error, Result};

/// Application directories following XDG spec
#[derive(Debug, Clone)]
pub struct Directories {
    /// Config directory (~/.config/plugmon)
    pub config: PathBuf,

    /// Data directory (~/.local/share/plugmon)
    pub data: PathBuf,

    /// Config file path
    pub config_file: PathBuf,

    /// Persisted service registry
    pub services_file: PathBuf,

    /// Where the default report handler writes `<sid>_report.json`
    pub reports: PathBuf,
}

impl Directories {
    /// Create a new `Directories` instance with standard XDG paths.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if no home directory can be determined.
    pub fn new() -> Result<Self> {
        let project = ProjectDirs::from("", "", "plugmon").ok_or_else(|| {
            Error::Config("failed to determine project directories".to_string())
        })?;

        let config = project.config_dir().to_path_buf();
        let data = project.data_dir().to_path_buf();

        Ok(Self {
            config_file: config.join("config.json"),
            services_file: data.join("services.json"),
            reports: data.join("reports"),
            config,
            data,
        })
    }

    /// Put every path under `base`. Used for tests and `--data-dir`.
    #[must_use]
    pub fn with_base(base: PathBuf) -> Self {
        Self {
            config_file: base.join("config.json"),
            services_file: base.join("services.json"),
            reports: base.join("reports"),
            config: base.clone(),
            data: base,
        }
    }

    /// Ensure all directories exist.
    ///
    /// # Errors
    ///
    /// Returns an error if any directory cannot be created.
    pub fn ensure_exists(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.config)?;
        std::fs::create_dir_all(&self.data)?;
        std::fs::create_dir_all(&self.reports)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_base_sets_all_paths() {
        let base = PathBuf::from("/tmp/test-plugmon");
        let dirs = Directories::with_base(base.clone());

        assert_eq!(dirs.config, base);
        assert_eq!(dirs.data, base);
        assert_eq!(dirs.config_file, base.join("config.json"));
        assert_eq!(dirs.services_file, base.join("services.json"));
        assert_eq!(dirs.reports, base.join("reports"));
    }

    #[test]
    fn test_ensure_exists_creates_directories() {
        let temp_dir = tempfile::tempdir().unwrap();
        let base = temp_dir.path().join("plugmon-test-subdir");
        let dirs = Directories::with_base(base);

        assert!(!dirs.reports.exists());

        dirs.ensure_exists().unwrap();
        dirs.ensure_exists().unwrap();

        assert!(dirs.config.exists());
        assert!(dirs.reports.exists());
    }

    #[test]
    fn test_new_returns_valid_xdg_paths() {
        let Ok(dirs) = Directories::new() else {
            return;
        };

        assert!(dirs.config.to_string_lossy().contains("plugmon"));
        assert!(dirs.config_file.to_string_lossy().ends_with("config.json"));
        assert!(
            dirs.services_file
                .to_string_lossy()
                .ends_with("services.json")
        );
    }
}
