//! Self-update of the yt-dlp executable via `yt-dlp --update`.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::OnceLock;

use regex::Regex;
use thiserror::Error;
use tokio::process::Command;

use crate::decode::LineDecoder;
use crate::fetcher::redact_proxy;
use crate::platform::Platform;

const PROXY_VARS: [&str; 4] = ["HTTP_PROXY", "HTTPS_PROXY", "http_proxy", "https_proxy"];

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("failed to execute {}: {source}", path.display())]
    Spawn {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("yt-dlp update failed (exit code {code:?})")]
    Failed { code: Option<i32>, output: String },
}

impl UpdateError {
    /// What yt-dlp printed, when it got that far.
    pub fn output(&self) -> Option<&str> {
        match self {
            UpdateError::Failed { output, .. } => Some(output),
            UpdateError::Spawn { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateReport {
    /// stdout followed by stderr.
    pub output: String,
    /// Version yt-dlp reports being at after the update, if it said so.
    pub version: Option<String>,
}

/// Run `yt-dlp --update`, routing its downloads through `proxy` when set.
pub async fn self_update(
    exe: &Path,
    proxy: Option<&str>,
    platform: Platform,
) -> Result<UpdateReport, UpdateError> {
    let mut cmd = Command::new(exe);
    cmd.arg("--update")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(proxy) = proxy.map(str::trim).filter(|p| !p.is_empty()) {
        for var in PROXY_VARS {
            cmd.env(var, proxy);
        }
    }
    platform.suppress_console(&mut cmd);

    log::info!(
        "Updating {} (proxy: {})",
        exe.display(),
        proxy.map(redact_proxy).as_deref().unwrap_or("none")
    );

    let out = cmd.output().await.map_err(|source| UpdateError::Spawn {
        path: exe.to_path_buf(),
        source,
    })?;

    let decoder = LineDecoder::new(platform.legacy_decoding());
    let mut output = decoder.decode_text(&out.stdout);
    output.push_str(&decoder.decode_text(&out.stderr));

    if !out.status.success() {
        log::error!("yt-dlp --update exited with {}: {}", out.status, output.trim());
        return Err(UpdateError::Failed {
            code: out.status.code(),
            output,
        });
    }

    let version = reported_version(&output);
    log::info!("yt-dlp update finished, version {:?}", version);
    Ok(UpdateReport { output, version })
}

/// Pull the version out of "Updated yt-dlp to stable@2024.12.13 ..." or
/// "yt-dlp is up to date (stable@2024.12.13 ...)".
fn reported_version(output: &str) -> Option<String> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    let re = RE
        .get_or_init(|| {
            Regex::new(
                r"(?:Updated yt-dlp to|yt-dlp is up to date \()\s*(?:[\w-]+@)?(\d{4}\.\d{2}\.\d{2}(?:\.\d+)?)",
            )
            .ok()
        })
        .as_ref()?;
    re.captures(output)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_reported_version() {
        assert_eq!(
            reported_version(
                "Current version: stable@2024.08.06 from yt-dlp/yt-dlp\n\
                 Updated yt-dlp to stable@2024.12.13 from yt-dlp/yt-dlp\n"
            ),
            Some("2024.12.13".to_string())
        );
        assert_eq!(
            reported_version("yt-dlp is up to date (stable@2024.12.13 from yt-dlp/yt-dlp)\n"),
            Some("2024.12.13".to_string())
        );
        assert_eq!(
            reported_version("yt-dlp is up to date (2023.03.04)"),
            Some("2023.03.04".to_string())
        );
        assert_eq!(reported_version("ERROR: Unable to write to file"), None);
    }

    #[cfg(unix)]
    fn fake_ytdlp(dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("yt-dlp");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[serial]
    #[tokio::test]
    async fn test_update_injects_proxy() {
        let dir = tempfile::tempdir().unwrap();
        let exe = fake_ytdlp(
            dir.path(),
            "echo \"$1 $HTTP_PROXY $HTTPS_PROXY $http_proxy $https_proxy\"\n\
             echo 'yt-dlp is up to date (stable@2024.12.13 from yt-dlp/yt-dlp)'",
        );

        let report = self_update(&exe, Some("http://127.0.0.1:7890"), Platform::Unix)
            .await
            .unwrap();

        let first = report.output.lines().next().unwrap();
        assert_eq!(
            first,
            "--update http://127.0.0.1:7890 http://127.0.0.1:7890 http://127.0.0.1:7890 http://127.0.0.1:7890"
        );
        assert_eq!(report.version.as_deref(), Some("2024.12.13"));
    }

    #[cfg(unix)]
    #[serial]
    #[tokio::test]
    async fn test_update_failure_keeps_output() {
        let dir = tempfile::tempdir().unwrap();
        let exe = fake_ytdlp(
            dir.path(),
            "echo 'Current version: stable@2024.08.06'\n\
             echo 'ERROR: Unable to write to file' >&2\n\
             exit 1",
        );

        let err = self_update(&exe, None, Platform::Unix).await.unwrap_err();
        match &err {
            UpdateError::Failed { code, output } => {
                assert_eq!(*code, Some(1));
                assert_eq!(
                    output,
                    "Current version: stable@2024.08.06\nERROR: Unable to write to file\n"
                );
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(err.output().unwrap().contains("Unable to write"));
    }

    #[tokio::test]
    async fn test_update_missing_binary() {
        let dir = tempfile::tempdir().unwrap();
        let err = self_update(&dir.path().join("yt-dlp"), None, Platform::current())
            .await
            .unwrap_err();
        assert!(matches!(err, UpdateError::Spawn { .. }));
        assert!(err.output().is_none());
    }
}
