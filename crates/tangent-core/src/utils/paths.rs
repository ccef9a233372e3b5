use std::path::{Path, PathBuf};

/// Standardized application directories for Tangent.
///
/// - Project-level: ./.tangent
/// - User-level config and data: OS-specific dirs
pub struct AppPaths;

impl AppPaths {
    /// Return the project-level .tangent directory (relative to current working dir)
    pub fn project_dir() -> PathBuf {
        PathBuf::from(".tangent")
    }

    pub fn project_config() -> PathBuf {
        Self::project_dir().join("config.toml")
    }

    /// Return the user-level config directory (platform-specific)
    pub fn user_config_dir() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "tangent").map(|d| d.config_dir().to_path_buf())
    }

    /// Return the user-level data directory (platform-specific)
    pub fn user_data_dir() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "tangent").map(|d| d.data_dir().to_path_buf())
    }

    pub fn user_config() -> Option<PathBuf> {
        Self::user_config_dir().map(|d| d.join("config.toml"))
    }

    /// Where per-conversation client state is cached.
    pub fn client_state_dir() -> PathBuf {
        Self::user_data_dir()
            .unwrap_or_else(|| Self::project_dir().join("data"))
            .join("client-state")
    }

    /// Default snapshot file for `tangent serve`.
    pub fn server_snapshot() -> PathBuf {
        Self::user_data_dir()
            .unwrap_or_else(|| Self::project_dir().join("data"))
            .join("conversations.json")
    }

    /// Config discovery order: explicit path, project config, user config.
    ///
    /// An explicit path is returned even if it does not exist so that the
    /// caller can report it.
    pub fn discover_config(explicit: Option<&Path>) -> Option<PathBuf> {
        if let Some(path) = explicit {
            return Some(path.to_path_buf());
        }
        let project = Self::project_config();
        if project.exists() {
            return Some(project);
        }
        Self::user_config().filter(|path| path.exists())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_paths_are_static() {
        assert_eq!(AppPaths::project_dir(), PathBuf::from(".tangent"));
        assert_eq!(
            AppPaths::project_config(),
            PathBuf::from(".tangent/config.toml")
        );
    }

    #[test]
    fn explicit_config_wins() {
        let explicit = PathBuf::from("/tmp/elsewhere/tangent.toml");
        assert_eq!(
            AppPaths::discover_config(Some(&explicit)),
            Some(explicit.clone())
        );
    }
}
