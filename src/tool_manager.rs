//! Tool Manager
//!
//! Discovery and version checking for the yt-dlp executable.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::process::Command;

use crate::decode::LineDecoder;
use crate::platform::Platform;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("failed to execute {}: {source}", path.display())]
    Spawn {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("version check timed out after {0:?}")]
    Timeout(Duration),

    #[error("tool returned non-zero exit code: {0}")]
    Exit(std::process::ExitStatus),

    #[error("could not parse version from output")]
    Unparsable,
}

/// Where a yt-dlp executable was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolOrigin {
    /// Next to the application, usually placed there by the fetcher.
    InstallDir,
    /// Somewhere on `PATH`.
    SystemPath,
}

/// A located yt-dlp executable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolBinary {
    pub path: PathBuf,
    pub origin: ToolOrigin,
}

impl ToolBinary {
    pub fn fetched(path: PathBuf) -> Self {
        Self {
            path,
            origin: ToolOrigin::InstallDir,
        }
    }

    /// Release binaries replace themselves with `-U`; package-manager installs
    /// on `PATH` refuse to.
    pub fn update_capable(&self) -> bool {
        self.origin == ToolOrigin::InstallDir
    }
}

/// Health status for the tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Ok,
    Missing,
    Broken,
}

/// Information about the installed tool.
#[derive(Debug, Clone, Serialize)]
pub struct ToolInfo {
    pub binary: Option<ToolBinary>,
    pub version: Option<String>,
    pub status: ToolStatus,
    pub last_checked: DateTime<Utc>,
}

/// Finds yt-dlp and asks it for its version.
#[derive(Debug, Clone)]
pub struct ToolManager {
    install_dir: PathBuf,
    platform: Platform,
    search_path: bool,
    version_timeout: Duration,
}

impl ToolManager {
    pub fn new(install_dir: impl Into<PathBuf>, platform: Platform) -> Self {
        Self {
            install_dir: install_dir.into(),
            platform,
            search_path: true,
            version_timeout: Duration::from_secs(10),
        }
    }

    /// Only consider the install directory.
    pub fn install_dir_only(mut self) -> Self {
        self.search_path = false;
        self
    }

    pub fn version_timeout(mut self, timeout: Duration) -> Self {
        self.version_timeout = timeout;
        self
    }

    /// Path the fetcher installs to.
    pub fn installed_path(&self) -> PathBuf {
        self.install_dir.join(self.platform.binary_name())
    }

    /// Find yt-dlp.
    ///
    /// Priority:
    /// 1. The install directory
    /// 2. System PATH
    pub fn locate(&self) -> Option<ToolBinary> {
        let installed = self.installed_path();
        if installed.is_file() {
            return Some(ToolBinary {
                path: installed,
                origin: ToolOrigin::InstallDir,
            });
        }

        if !self.search_path {
            return None;
        }

        match which::which(self.platform.binary_name()) {
            Ok(path) => Some(ToolBinary {
                path,
                origin: ToolOrigin::SystemPath,
            }),
            Err(e) => {
                log::debug!("{} not on PATH: {}", self.platform.binary_name(), e);
                None
            }
        }
    }

    /// Locate the tool and check that it runs.
    pub async fn status(&self) -> ToolInfo {
        match self.locate() {
            Some(binary) => self.probe(binary).await,
            None => ToolInfo {
                binary: None,
                version: None,
                status: ToolStatus::Missing,
                last_checked: Utc::now(),
            },
        }
    }

    /// Run `--version` on a located binary.
    pub async fn probe(&self, binary: ToolBinary) -> ToolInfo {
        let (version, status) = match self.get_version(&binary.path).await {
            Ok(v) => (Some(v), ToolStatus::Ok),
            Err(e) => {
                log::warn!("yt-dlp at {} failed its version check: {}", binary.path.display(), e);
                (None, ToolStatus::Broken)
            }
        };

        ToolInfo {
            binary: Some(binary),
            version,
            status,
            last_checked: Utc::now(),
        }
    }

    /// Get the version string from the tool.
    pub async fn get_version(&self, path: &Path) -> Result<String, ProbeError> {
        let mut cmd = Command::new(path);
        cmd.arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        self.platform.suppress_console(&mut cmd);

        let output = tokio::time::timeout(self.version_timeout, cmd.output())
            .await
            .map_err(|_| ProbeError::Timeout(self.version_timeout))?
            .map_err(|source| ProbeError::Spawn {
                path: path.to_path_buf(),
                source,
            })?;

        if !output.status.success() {
            return Err(ProbeError::Exit(output.status));
        }

        let stdout = LineDecoder::new(self.platform.legacy_decoding()).decode_text(&output.stdout);
        parse_version(&stdout).ok_or(ProbeError::Unparsable)
    }
}

/// Find yt-dlp for `platform`: `install_dir` first, then the system PATH.
pub fn locate(install_dir: &Path, platform: Platform) -> Option<PathBuf> {
    ToolManager::new(install_dir, platform)
        .locate()
        .map(|binary| binary.path)
}

/// yt-dlp prints just the version, e.g. "2024.01.01".
pub(crate) fn parse_version(output: &str) -> Option<String> {
    output
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(str::to_string)
}
