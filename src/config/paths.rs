//! Where `settings.toml` lives.
//!
//! | Platform | Default                                                   |
//! |----------|-----------------------------------------------------------|
//! | Linux    | `~/.config/voice-duplex/settings.toml`                    |
//! | macOS    | `~/Library/Application Support/voice-duplex/settings.toml`|
//! | Windows  | `%APPDATA%\voice-duplex\settings.toml`                    |
//!
//! Setting `VOICE_DUPLEX_CONFIG` to a file path overrides the default, so two
//! clients on one machine can join the same session with different devices.

use std::path::{Path, PathBuf};

/// Environment variable naming an explicit settings file.
pub const CONFIG_ENV: &str = "VOICE_DUPLEX_CONFIG";

const APP_DIR: &str = "voice-duplex";
const SETTINGS_FILE: &str = "settings.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppPaths {
    pub config_dir: PathBuf,
    pub settings_file: PathBuf,
}

impl AppPaths {
    /// Resolve from the environment and the platform config directory.
    pub fn new() -> Self {
        let explicit = std::env::var_os(CONFIG_ENV)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);
        Self::resolve(explicit, dirs::config_dir())
    }

    /// Paths for a settings file inside `dir`.
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        let config_dir = dir.as_ref().to_path_buf();
        Self {
            settings_file: config_dir.join(SETTINGS_FILE),
            config_dir,
        }
    }

    /// An explicit file wins; otherwise `<platform dir>/voice-duplex/`, or
    /// the working directory when the platform has no config dir.
    fn resolve(explicit: Option<PathBuf>, platform_dir: Option<PathBuf>) -> Self {
        if let Some(settings_file) = explicit {
            let config_dir = settings_file
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."));
            return Self {
                config_dir,
                settings_file,
            };
        }
        Self::in_dir(platform_dir.unwrap_or_else(|| PathBuf::from(".")).join(APP_DIR))
    }
}

impl Default for AppPaths {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_dir_gets_app_subdirectory() {
        let paths = AppPaths::resolve(None, Some(PathBuf::from("/home/u/.config")));
        assert_eq!(paths.config_dir, PathBuf::from("/home/u/.config/voice-duplex"));
        assert_eq!(
            paths.settings_file,
            PathBuf::from("/home/u/.config/voice-duplex/settings.toml")
        );
    }

    #[test]
    fn explicit_file_overrides_platform_dir() {
        let paths = AppPaths::resolve(
            Some(PathBuf::from("/tmp/alice/client.toml")),
            Some(PathBuf::from("/home/u/.config")),
        );
        assert_eq!(paths.settings_file, PathBuf::from("/tmp/alice/client.toml"));
        assert_eq!(paths.config_dir, PathBuf::from("/tmp/alice"));
    }

    #[test]
    fn missing_platform_dir_falls_back_to_cwd() {
        let paths = AppPaths::resolve(None, None);
        assert!(paths.settings_file.starts_with("."));
        assert!(paths.settings_file.ends_with("voice-duplex/settings.toml"));
    }

    #[test]
    fn in_dir_layout() {
        let dir = tempfile::tempdir().unwrap();
        let paths = AppPaths::in_dir(dir.path());
        assert_eq!(paths.settings_file, dir.path().join("settings.toml"));
    }
}
