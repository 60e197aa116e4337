//! Starting the installed game.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::error::UpdateError;
use crate::manifest::{resolve_under, validate_relative_path, Manifest};

#[cfg(windows)]
const CONVENTIONAL_NAMES: &[&str] = &["Wayfarer.exe", "Game.exe", "game.exe", "launcher.exe"];
#[cfg(not(windows))]
const CONVENTIONAL_NAMES: &[&str] = &["wayfarer", "Wayfarer", "game", "Game"];

/// Locates and starts the game executable.
#[derive(Debug, Clone)]
pub struct GameLaunchService {
    install_root: PathBuf,
}

impl GameLaunchService {
    pub fn new(install_root: PathBuf) -> Self {
        Self { install_root }
    }

    pub fn install_root(&self) -> &Path {
        &self.install_root
    }

    /// Find the executable to start.
    ///
    /// Order: the manifest's executable, a conventional name, then the
    /// first executable file at the install root (sorted by name).
    pub fn locate_executable(&self, manifest: Option<&Manifest>) -> Result<PathBuf, UpdateError> {
        if let Some(name) = manifest
            .map(|m| m.executable_name.as_str())
            .filter(|n| !n.is_empty())
        {
            match validate_relative_path(name) {
                Ok(()) => {
                    let candidate = resolve_under(&self.install_root, name);
                    if candidate.is_file() {
                        return Ok(candidate);
                    }
                    warn!(executable = name, "manifest executable not found, falling back");
                }
                Err(reason) => warn!(executable = name, reason, "ignoring unsafe executable name"),
            }
        }

        for name in CONVENTIONAL_NAMES {
            let candidate = self.install_root.join(name);
            if candidate.is_file() {
                debug!(path = %candidate.display(), "using conventional executable name");
                return Ok(candidate);
            }
        }

        let mut entries: Vec<PathBuf> = std::fs::read_dir(&self.install_root)
            .map_err(|_| UpdateError::ExecutableNotFound(self.install_root.display().to_string()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| is_executable(path))
            .collect();
        entries.sort();

        entries
            .into_iter()
            .next()
            .ok_or_else(|| UpdateError::ExecutableNotFound(self.install_root.display().to_string()))
    }

    /// Start the game as a child process.
    ///
    /// The working directory is the install root; `launchArguments` are
    /// split on whitespace.
    pub fn launch(&self, manifest: Option<&Manifest>) -> Result<GameProcess, UpdateError> {
        let executable = self.locate_executable(manifest)?;
        let args: Vec<&str> = manifest
            .and_then(|m| m.launch_arguments.as_deref())
            .map(|a| a.split_whitespace().collect())
            .unwrap_or_default();

        info!(executable = %executable.display(), ?args, "launching game");
        let child = Command::new(&executable)
            .args(&args)
            .current_dir(&self.install_root)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| UpdateError::Launch(format!("{}: {e}", executable.display())))?;

        Ok(GameProcess { child, executable })
    }
}

/// A running game.
#[derive(Debug)]
pub struct GameProcess {
    child: Child,
    executable: PathBuf,
}

impl GameProcess {
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    /// Whether the process has not exited yet.
    pub fn is_running(&mut self) -> Result<bool, UpdateError> {
        Ok(self.child.try_wait()?.is_none())
    }

    /// Wait for the process to exit.
    pub async fn wait(&mut self) -> Result<ExitStatus, UpdateError> {
        let status = self.child.wait().await?;
        info!(%status, "game exited");
        Ok(status)
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("exe"))
            .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::tests::sample_manifest;
    use tempfile::TempDir;

    #[cfg(unix)]
    fn make_executable(path: &Path) {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[test]
    fn test_manifest_executable_preferred() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("bin")).unwrap();
        std::fs::write(dir.path().join("bin").join("game"), b"x").unwrap();
        std::fs::write(dir.path().join(CONVENTIONAL_NAMES[0]), b"x").unwrap();

        let service = GameLaunchService::new(dir.path().to_path_buf());
        let found = service.locate_executable(Some(&sample_manifest())).unwrap();
        assert_eq!(found, dir.path().join("bin").join("game"));
    }

    #[test]
    fn test_falls_back_to_conventional_name() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(CONVENTIONAL_NAMES[1]), b"x").unwrap();

        let service = GameLaunchService::new(dir.path().to_path_buf());
        let found = service.locate_executable(Some(&sample_manifest())).unwrap();
        assert_eq!(found, dir.path().join(CONVENTIONAL_NAMES[1]));
    }

    #[cfg(unix)]
    #[test]
    fn test_falls_back_to_any_executable() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("readme.txt"), b"x").unwrap();
        let tool = dir.path().join("zz-client");
        std::fs::write(&tool, b"x").unwrap();
        make_executable(&tool);

        let service = GameLaunchService::new(dir.path().to_path_buf());
        assert_eq!(service.locate_executable(None).unwrap(), tool);
    }

    #[test]
    fn test_nothing_to_launch() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("readme.txt"), b"x").unwrap();
        let service = GameLaunchService::new(dir.path().to_path_buf());
        assert!(matches!(
            service.locate_executable(None),
            Err(UpdateError::ExecutableNotFound(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_launch_and_wait() {
        let dir = TempDir::new().unwrap();
        let script = dir.path().join("game");
        std::fs::write(&script, "#!/bin/sh\n[ \"$1\" = \"--windowed\" ] && exit 0\nexit 3\n").unwrap();
        make_executable(&script);

        let mut manifest = sample_manifest();
        manifest.executable_name = "game".to_string();

        let service = GameLaunchService::new(dir.path().to_path_buf());
        let mut process = service.launch(Some(&manifest)).unwrap();
        let status = process.wait().await.unwrap();
        assert!(status.success());
        assert!(!process.is_running().unwrap());
    }
}
