//! `server.properties` lookups and world path resolution.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::types::{BackupConfiguration, DEFAULT_LEVEL_NAME};

const LEVEL_NAME_KEY: &str = "level-name=";

/// Directory holding the server executable (and its `server.properties`).
pub fn server_dir(exe_path: &Path) -> Option<PathBuf> {
    exe_path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .map(Path::to_path_buf)
}

/// Read `level-name` from a properties file.
///
/// Returns `None` if the file is missing, unreadable, or has no non-empty
/// `level-name` entry. Key matching ignores ASCII case.
pub fn read_level_name(properties: &Path) -> Option<String> {
    let contents = match std::fs::read_to_string(properties) {
        Ok(contents) => contents,
        Err(err) => {
            tracing::warn!(
                path = %properties.display(),
                error = %err,
                "server.properties unreadable, using default level name",
            );
            return None;
        }
    };

    contents.lines().find_map(|line| {
        let line = line.trim();
        let head = line.get(..LEVEL_NAME_KEY.len())?;
        if !head.eq_ignore_ascii_case(LEVEL_NAME_KEY) {
            return None;
        }
        let value = line[LEVEL_NAME_KEY.len()..].trim();
        (!value.is_empty()).then(|| value.to_string())
    })
}

/// Cached level-name lookup.
///
/// The first successful read is cached until [`invalidate`](Self::invalidate)
/// is called. Fallbacks to [`DEFAULT_LEVEL_NAME`] are never cached so a file
/// that appears later is still picked up.
#[derive(Debug)]
pub struct LevelNameResolver {
    properties: Option<PathBuf>,
    cached: Mutex<Option<String>>,
}

impl LevelNameResolver {
    /// Resolver for the `server.properties` next to `exe_path`.
    pub fn for_executable(exe_path: &Path) -> Self {
        Self::new(server_dir(exe_path).map(|dir| dir.join("server.properties")))
    }

    pub fn new(properties: Option<PathBuf>) -> Self {
        Self {
            properties,
            cached: Mutex::new(None),
        }
    }

    /// Resolver that always answers `name`.
    pub fn fixed(name: impl Into<String>) -> Self {
        Self {
            properties: None,
            cached: Mutex::new(Some(name.into())),
        }
    }

    pub fn properties_path(&self) -> Option<&Path> {
        self.properties.as_deref()
    }

    pub fn current(&self) -> String {
        let mut cached = self.cached.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(name) = cached.as_ref() {
            return name.clone();
        }

        let Some(path) = self.properties.as_deref() else {
            tracing::warn!("server directory unknown, using default level name");
            return DEFAULT_LEVEL_NAME.to_string();
        };

        match read_level_name(path) {
            Some(name) => {
                tracing::info!(level_name = %name, "level name from server.properties");
                *cached = Some(name.clone());
                name
            }
            None => {
                tracing::warn!(path = %path.display(), "level-name not found, using default");
                DEFAULT_LEVEL_NAME.to_string()
            }
        }
    }

    /// Forget the cached name; the next [`current`](Self::current) re-reads the file.
    ///
    /// Resolvers built with [`fixed`](Self::fixed) keep their answer.
    pub fn invalidate(&self) {
        if self.properties.is_none() {
            return;
        }
        *self.cached.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

/// Where the live world lives: explicit `world_path` wins, else
/// `<server dir>/worlds/<level name>`.
pub fn resolve_world_path(
    backup: &BackupConfiguration,
    server_dir: Option<&Path>,
    level_name: &str,
) -> PathBuf {
    if let Some(explicit) = backup
        .world_path
        .as_ref()
        .filter(|p| !p.as_os_str().is_empty())
    {
        return explicit.clone();
    }
    server_dir
        .map(Path::to_path_buf)
        .unwrap_or_default()
        .join("worlds")
        .join(level_name)
}
