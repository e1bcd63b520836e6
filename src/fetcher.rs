//! Binary Fetcher
//!
//! Downloads the yt-dlp executable, streaming it into a temporary file with
//! progress reporting, and moves it into place once complete.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use url::Url;

use crate::events::ProgressSink;
use crate::platform::Platform;
use crate::retry::RetryPolicy;
use crate::tool_manager::ToolBinary;

/// Size of the pieces the body is written (and reported) in.
pub const CHUNK_SIZE: usize = 32 * 1024;

const USER_AGENT: &str = concat!("ytdlp-desk/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid download URL {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("invalid proxy {proxy:?}: {source}")]
    Proxy {
        proxy: String,
        source: reqwest::Error,
    },

    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("request to {url} failed: {source}")]
    Request { url: Url, source: reqwest::Error },

    #[error("download failed: {url} returned {status}")]
    Status { url: Url, status: StatusCode },

    #[error("download interrupted: {0}")]
    Stream(#[source] reqwest::Error),

    #[error("I/O error on {}: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    Checksum { expected: String, actual: String },

    #[error("could not move the download into {}: {source}", path.display())]
    Install { path: PathBuf, source: io::Error },
}

/// Result of a completed fetch.
#[derive(Debug)]
pub struct Installed {
    pub path: PathBuf,
    pub size: u64,
    pub sha256: String,
    /// Set when the file is in place but could not be marked executable.
    /// The install still counts; callers should surface this as a warning.
    pub chmod_error: Option<io::Error>,
}

impl Installed {
    pub fn binary(&self) -> ToolBinary {
        ToolBinary::fetched(self.path.clone())
    }
}

/// Downloads and installs the yt-dlp binary for one platform.
#[derive(Debug, Clone)]
pub struct BinaryFetcher {
    platform: Platform,
    install_retry: RetryPolicy,
    connect_timeout: Duration,
}

impl BinaryFetcher {
    pub fn new(platform: Platform) -> Self {
        Self {
            platform,
            install_retry: RetryPolicy::default(),
            connect_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_install_retry(mut self, policy: RetryPolicy) -> Self {
        self.install_retry = policy;
        self
    }

    /// Where the binary ends up inside `dest_dir`.
    pub fn target_path(&self, dest_dir: &Path) -> PathBuf {
        dest_dir.join(self.platform.binary_name())
    }

    /// URL to download from: `source_url` when given, the latest release otherwise.
    pub fn resolve_url(&self, source_url: Option<&str>) -> Result<Url, FetchError> {
        let raw = match source_url.map(str::trim).filter(|s| !s.is_empty()) {
            Some(custom) => custom.to_string(),
            None => self.platform.default_source_url(),
        };

        let url = Url::parse(&raw).map_err(|e| FetchError::InvalidUrl {
            url: raw.clone(),
            reason: e.to_string(),
        })?;

        match url.scheme() {
            "http" | "https" => Ok(url),
            other => Err(FetchError::InvalidUrl {
                url: raw,
                reason: format!("unsupported scheme {other}"),
            }),
        }
    }

    /// Download yt-dlp into `dest_dir`, reporting progress after every chunk.
    pub async fn fetch(
        &self,
        dest_dir: &Path,
        proxy: Option<&str>,
        source_url: Option<&str>,
        progress: &dyn ProgressSink,
    ) -> Result<Installed, FetchError> {
        self.fetch_checked(dest_dir, proxy, source_url, None, progress)
            .await
    }

    /// Like [`fetch`](Self::fetch), additionally rejecting a body whose
    /// SHA-256 differs from `expected_sha256` (hex).
    pub async fn fetch_checked(
        &self,
        dest_dir: &Path,
        proxy: Option<&str>,
        source_url: Option<&str>,
        expected_sha256: Option<&str>,
        progress: &dyn ProgressSink,
    ) -> Result<Installed, FetchError> {
        let url = self.resolve_url(source_url)?;
        let client = build_client(proxy, self.connect_timeout)?;

        fs::create_dir_all(dest_dir)
            .await
            .map_err(|source| FetchError::Io {
                path: dest_dir.to_path_buf(),
                source,
            })?;

        let final_path = self.target_path(dest_dir);
        let temp_path = temp_path_for(&final_path);

        log::info!(
            "Downloading yt-dlp from {} to {} (proxy: {})",
            url,
            final_path.display(),
            proxy.map(redact_proxy).as_deref().unwrap_or("none")
        );

        let response = client
            .get(url.clone())
            .send()
            .await
            .map_err(|source| FetchError::Request {
                url: url.clone(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status { url, status });
        }

        let total = response.content_length();
        log::debug!("Content-Length: {:?}", total);

        let (size, sha256) = match stream_to_file(response, &temp_path, total, progress).await {
            Ok(done) => done,
            Err(e) => {
                remove_quietly(&temp_path).await;
                return Err(e);
            }
        };

        if let Some(expected) = expected_sha256 {
            let expected = expected.trim().to_lowercase();
            if sha256 != expected {
                remove_quietly(&temp_path).await;
                return Err(FetchError::Checksum {
                    expected,
                    actual: sha256,
                });
            }
        }

        self.install(&temp_path, &final_path).await?;

        let chmod_error = self.platform.make_executable(&final_path).err();
        if let Some(ref e) = chmod_error {
            log::warn!(
                "Installed {} but could not mark it executable: {}",
                final_path.display(),
                e
            );
        }

        log::info!("Installed yt-dlp at {} ({} bytes)", final_path.display(), size);

        Ok(Installed {
            path: final_path,
            size,
            sha256,
            chmod_error,
        })
    }

    /// Move the finished download into place.
    ///
    /// The target can be held open by another process (a virus scanner, a
    /// running yt-dlp), so the move is retried, deleting the old target in
    /// between. The temporary file is removed when all attempts fail.
    async fn install(&self, temp_path: &Path, final_path: &Path) -> Result<(), FetchError> {
        let result = self
            .install_retry
            .run(
                |attempt| async move {
                    if attempt > 1 {
                        remove_quietly(final_path).await;
                    }
                    fs::rename(temp_path, final_path).await
                },
                |err, attempt| {
                    log::warn!(
                        "Install attempt {} for {} failed: {}",
                        attempt,
                        final_path.display(),
                        err
                    );
                },
                |err| {
                    log::error!(
                        "Giving up installing {}: {}",
                        final_path.display(),
                        err
                    );
                },
            )
            .await;

        if let Err(source) = result {
            remove_quietly(temp_path).await;
            return Err(FetchError::Install {
                path: final_path.to_path_buf(),
                source,
            });
        }
        Ok(())
    }
}

/// `proxy` with any user name and password masked, for log records and errors.
pub(crate) fn redact_proxy(proxy: &str) -> String {
    // reqwest accepts proxies without a scheme and assumes http.
    let parsed = if proxy.contains("://") {
        Url::parse(proxy).ok()
    } else {
        Url::parse(&format!("http://{proxy}")).ok()
    };

    match parsed {
        Some(mut url) => {
            if url.password().is_some() {
                let _ = url.set_password(Some("***"));
            }
            if !url.username().is_empty() {
                let _ = url.set_username("***");
            }
            url.to_string()
        }
        None => "<unparsable proxy>".to_string(),
    }
}

fn build_client(proxy: Option<&str>, connect_timeout: Duration) -> Result<reqwest::Client, FetchError> {
    let mut builder = reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .connect_timeout(connect_timeout);

    if let Some(p) = proxy.map(str::trim).filter(|p| !p.is_empty()) {
        let proxy = reqwest::Proxy::all(p).map_err(|source| FetchError::Proxy {
            proxy: redact_proxy(p),
            source,
        })?;
        builder = builder.proxy(proxy);
    }

    builder.build().map_err(FetchError::Client)
}

fn temp_path_for(final_path: &Path) -> PathBuf {
    let mut name = final_path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Stream the body into `path` in [`CHUNK_SIZE`] pieces.
///
/// Returns the byte count and the hex SHA-256 of the body. The file handle is
/// closed before returning.
async fn stream_to_file(
    response: reqwest::Response,
    path: &Path,
    total: Option<u64>,
    progress: &dyn ProgressSink,
) -> Result<(u64, String), FetchError> {
    let io_err = |source: io::Error| FetchError::Io {
        path: path.to_path_buf(),
        source,
    };

    let mut file = fs::File::create(path).await.map_err(io_err)?;
    let mut hasher = Sha256::new();
    let mut received: u64 = 0;

    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(FetchError::Stream)?;
        for piece in chunk.chunks(CHUNK_SIZE) {
            file.write_all(piece).await.map_err(io_err)?;
            hasher.update(piece);
            received += piece.len() as u64;
            progress.progress(received, total);
        }
    }

    file.flush().await.map_err(io_err)?;
    file.sync_all().await.map_err(io_err)?;
    // An open handle blocks the rename on Windows; wait for pending
    // operations and close it for real.
    drop(file.into_std().await);

    Ok((received, hex::encode(hasher.finalize())))
}

async fn remove_quietly(path: &Path) {
    match fs::remove_file(path).await {
        Ok(()) => log::debug!("Removed {}", path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => log::warn!("Could not remove {}: {}", path.display(), e),
    }
}
