use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::errors::ChemsimError;
use crate::store::{render_document, write_atomic};
use crate::workspace::{ensure_directory, path_is_file};

pub(crate) const MAX_RECENT_PROJECTS: usize = 5;
pub(crate) const GLOBAL_SETTINGS_FILE: &str = "settings.json";
const CONFIG_DIR_ENV: &str = "CHEMSIM_CONFIG_DIR";
const MD_ENGINE_ENV: &str = "CHEMSIM_GMX_BIN";
const PACKER_ENV: &str = "CHEMSIM_PACKMOL_BIN";
const TRAVIS_ENV: &str = "CHEMSIM_TRAVIS_BIN";
const MAXWARN_ENV: &str = "CHEMSIM_GROMPP_MAXWARN";
const DEFAULT_MD_ENGINE: &str = "gmx";
const DEFAULT_PACKER: &str = "packmol";
const DEFAULT_TRAVIS: &str = "travis";
const DEFAULT_GROMPP_MAXWARN: u32 = 2;

/// Process-wide settings document, stored outside any project.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalSettings {
    #[serde(default)]
    pub recent_projects: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub md_engine_binary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub packer_binary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub travis_binary: Option<String>,
}

impl GlobalSettings {
    /// Moves `path` to the front, dropping duplicates and anything past the limit.
    pub fn push_recent_project(&mut self, path: &str) {
        let path = path.trim();
        if path.is_empty() {
            return;
        }
        self.recent_projects.retain(|existing| existing != path);
        self.recent_projects.insert(0, path.to_string());
        self.recent_projects.truncate(MAX_RECENT_PROJECTS);
    }
}

/// Effective configuration: environment over the settings document over defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub config_dir: PathBuf,
    pub md_engine_binary: String,
    pub packer_binary: String,
    pub travis_binary: String,
    pub grompp_maxwarn: u32,
}

impl AppConfig {
    pub fn resolve() -> Self {
        let config_dir = std::env::var_os(CONFIG_DIR_ENV)
            .map(PathBuf::from)
            .filter(|value| !value.as_os_str().is_empty())
            .unwrap_or_else(default_config_dir);
        let settings = read_global_settings(&config_dir).unwrap_or_else(|error| {
            log::warn!("[config] ignoring unreadable global settings: {error}");
            GlobalSettings::default()
        });
        Self::layered(config_dir, &settings, |key| std::env::var(key).ok())
    }

    pub(crate) fn layered(
        config_dir: PathBuf,
        settings: &GlobalSettings,
        env: impl Fn(&str) -> Option<String>,
    ) -> Self {
        let pick = |key: &str, stored: &Option<String>, fallback: &str| {
            env(key)
                .or_else(|| stored.clone())
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| fallback.to_string())
        };

        let grompp_maxwarn = match env(MAXWARN_ENV) {
            Some(raw) => raw.trim().parse::<u32>().unwrap_or_else(|_| {
                log::warn!("[config] {MAXWARN_ENV}={raw} is not a number; using {DEFAULT_GROMPP_MAXWARN}");
                DEFAULT_GROMPP_MAXWARN
            }),
            None => DEFAULT_GROMPP_MAXWARN,
        };

        AppConfig {
            md_engine_binary: pick(MD_ENGINE_ENV, &settings.md_engine_binary, DEFAULT_MD_ENGINE),
            packer_binary: pick(PACKER_ENV, &settings.packer_binary, DEFAULT_PACKER),
            travis_binary: pick(TRAVIS_ENV, &settings.travis_binary, DEFAULT_TRAVIS),
            grompp_maxwarn,
            config_dir,
        }
    }

    pub fn for_config_dir(config_dir: &Path) -> Self {
        Self::layered(config_dir.to_path_buf(), &GlobalSettings::default(), |_| None)
    }
}

fn default_config_dir() -> PathBuf {
    dirs_home()
        .map(|home| home.join(".config").join("chemsim"))
        .unwrap_or_else(|| PathBuf::from(".chemsim"))
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("USERPROFILE").map(PathBuf::from))
}

pub(crate) fn global_settings_file(config_dir: &Path) -> PathBuf {
    config_dir.join(GLOBAL_SETTINGS_FILE)
}

pub fn read_global_settings(config_dir: &Path) -> Result<GlobalSettings, ChemsimError> {
    let path = global_settings_file(config_dir);
    if !path_is_file(&path) {
        return Ok(GlobalSettings::default());
    }

    let raw = fs::read_to_string(&path).map_err(|error| ChemsimError::io_at("read", &path, error))?;
    serde_json::from_str::<GlobalSettings>(&raw).map_err(|error| ChemsimError::CorruptDocument {
        path: path.display().to_string(),
        message: error.to_string(),
    })
}

pub fn write_global_settings(
    config_dir: &Path,
    settings: &GlobalSettings,
) -> Result<(), ChemsimError> {
    ensure_directory(config_dir)?;
    write_atomic(&global_settings_file(config_dir), &render_document(settings)?)
}

/// Records a project open/create in the recent list and persists it.
pub fn record_recent_project(config_dir: &Path, project_root: &Path) -> Result<Vec<String>, ChemsimError> {
    let mut settings = read_global_settings(config_dir).unwrap_or_default();
    settings.push_recent_project(&project_root.display().to_string());
    write_global_settings(config_dir, &settings)?;
    Ok(settings.recent_projects)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn moves_existing_recent_project_to_front() {
        let mut settings = GlobalSettings::default();
        for path in ["/p/a", "/p/b", "/p/c"] {
            settings.push_recent_project(path);
        }
        settings.push_recent_project("/p/a");
        assert_eq!(settings.recent_projects, vec!["/p/a", "/p/c", "/p/b"]);
    }

    #[test]
    fn keeps_only_five_recent_projects() {
        let mut settings = GlobalSettings::default();
        for index in 1..=6 {
            settings.push_recent_project(&format!("/p/{index}"));
        }
        assert_eq!(
            settings.recent_projects,
            vec!["/p/6", "/p/5", "/p/4", "/p/3", "/p/2"]
        );
    }

    #[test]
    fn persists_recent_projects() {
        let dir = TempDir::new().unwrap();
        record_recent_project(dir.path(), Path::new("/p/one")).unwrap();
        let recent = record_recent_project(dir.path(), Path::new("/p/two")).unwrap();
        assert_eq!(recent, vec!["/p/two", "/p/one"]);
        assert_eq!(read_global_settings(dir.path()).unwrap().recent_projects, recent);
    }

    #[test]
    fn layers_environment_over_settings() {
        let settings = GlobalSettings {
            recent_projects: Vec::new(),
            md_engine_binary: Some("gmx_mpi".to_string()),
            packer_binary: Some("/opt/packmol".to_string()),
            travis_binary: None,
        };
        let env = HashMap::from([
            (PACKER_ENV, "/usr/local/bin/packmol"),
            (MAXWARN_ENV, "5"),
        ]);
        let config = AppConfig::layered(PathBuf::from("/cfg"), &settings, |key| {
            env.get(key).map(|value| value.to_string())
        });

        assert_eq!(config.md_engine_binary, "gmx_mpi");
        assert_eq!(config.packer_binary, "/usr/local/bin/packmol");
        assert_eq!(config.grompp_maxwarn, 5);
    }

    #[test]
    fn falls_back_to_defaults() {
        let config = AppConfig::for_config_dir(Path::new("/cfg"));
        assert_eq!(config.md_engine_binary, "gmx");
        assert_eq!(config.packer_binary, "packmol");
        assert_eq!(config.travis_binary, "travis");
        assert_eq!(config.grompp_maxwarn, 2);
    }
}
