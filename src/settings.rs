//! Settings Manager
//!
//! Handles persistence of the user's settings in a small INI file next to the
//! program, and seeds yt-dlp's own configuration file on first run.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use ini::{EscapePolicy, Ini, ParseOption, WriteOption};
use serde::Serialize;
use thiserror::Error;

/// Settings file name, kept in the install directory.
pub const SETTINGS_FILE_NAME: &str = "ytdlp-desk.ini";

/// yt-dlp picks this file up when it sits next to the executable.
pub const TOOL_CONFIG_FILE_NAME: &str = "yt-dlp.conf";

/// Output directory used when the settings do not name one.
pub const DEFAULT_OUTPUT_DIR: &str = "downloads";

const DEFAULT_SETTINGS_TEMPLATE: &str = include_str!("../res/ytdlp-desk.ini");
const DEFAULT_TOOL_CONFIG_TEMPLATE: &str = include_str!("../res/yt-dlp.conf");

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// Settings keys used in the INI file.
pub mod keys {
    pub const SECTION: &str = "app";
    pub const OUTPUT_DIR: &str = "output_dir";
    pub const DOWNLOAD_PROXY: &str = "download_proxy";
    pub const YT_DLP_URL: &str = "yt_dlp_url";
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read { path: PathBuf, source: io::Error },

    #[error("malformed settings file {}: {message}", path.display())]
    Parse { path: PathBuf, message: String },

    #[error("failed to write {}: {source}", path.display())]
    Write { path: PathBuf, source: io::Error },

    #[error("failed to create output directory {}: {source}", path.display())]
    CreateDir { path: PathBuf, source: io::Error },
}

/// Persistent user settings. Empty strings mean "not set".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Settings {
    /// Download folder; relative paths are relative to the install directory.
    pub output_dir: String,

    /// Proxy used for fetching and updating yt-dlp (e.g., "http://127.0.0.1:7890").
    pub download_proxy: String,

    /// Overrides the default yt-dlp release URL.
    pub yt_dlp_url: String,
}

impl Settings {
    pub fn proxy(&self) -> Option<&str> {
        non_empty(&self.download_proxy)
    }

    pub fn source_url(&self) -> Option<&str> {
        non_empty(&self.yt_dlp_url)
    }

    /// Absolute output directory, resolving relative values against `install_dir`.
    pub fn resolve_output_dir(&self, install_dir: &Path) -> PathBuf {
        resolve_against(install_dir, &self.output_dir)
    }

    /// Value to store for a directory the user picked: relative when it lies
    /// inside `install_dir`, absolute otherwise.
    pub fn relative_output_dir(install_dir: &Path, chosen: &Path) -> String {
        match chosen.strip_prefix(install_dir) {
            Ok(rel) if rel.as_os_str().is_empty() => ".".to_string(),
            Ok(rel) => rel.to_string_lossy().into_owned(),
            Err(_) => chosen.to_string_lossy().into_owned(),
        }
    }
}

fn non_empty(s: &str) -> Option<&str> {
    let t = s.trim();
    if t.is_empty() {
        None
    } else {
        Some(t)
    }
}

/// Join `path` onto `base` unless it is already absolute, dropping `.` components.
pub fn resolve_against(base: &Path, path: &str) -> PathBuf {
    let p = Path::new(path);
    let joined = if p.is_absolute() {
        p.to_path_buf()
    } else {
        base.join(p)
    };
    joined
        .components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect()
}

fn parse_options() -> ParseOption {
    // Windows paths carry backslashes; keep them literal.
    ParseOption {
        enabled_escape: false,
        ..Default::default()
    }
}

/// Load settings from `path`.
///
/// Returns `Ok(None)` when the file does not exist. Missing keys read as
/// empty strings; unknown keys and sections are ignored.
pub fn load(path: &Path) -> Result<Option<Settings>, ConfigError> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    let body = raw.strip_prefix(UTF8_BOM).unwrap_or(&raw);
    let text = std::str::from_utf8(body).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    let conf = Ini::load_from_str_opt(text, parse_options()).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    let get = |key: &str| {
        conf.section(Some(keys::SECTION))
            .and_then(|sec| sec.get(key))
            .unwrap_or_default()
            .to_string()
    };

    Ok(Some(Settings {
        output_dir: get(keys::OUTPUT_DIR),
        download_proxy: get(keys::DOWNLOAD_PROXY),
        yt_dlp_url: get(keys::YT_DLP_URL),
    }))
}

/// Write all settings to `path`, replacing any existing file.
pub fn save(path: &Path, settings: &Settings) -> Result<(), ConfigError> {
    let mut conf = Ini::new();
    conf.with_section(Some(keys::SECTION))
        .set(keys::OUTPUT_DIR, settings.output_dir.as_str())
        .set(keys::DOWNLOAD_PROXY, settings.download_proxy.as_str())
        .set(keys::YT_DLP_URL, settings.yt_dlp_url.as_str());

    let write_err = |source: io::Error| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    };

    let mut buf = Vec::new();
    conf.write_to_opt(
        &mut buf,
        WriteOption {
            escape_policy: EscapePolicy::Nothing,
            ..Default::default()
        },
    )
    .map_err(write_err)?;
    fs::write(path, buf).map_err(write_err)
}

/// Embedded defaults written on first run.
#[derive(Debug, Clone, Copy)]
pub struct Templates {
    pub settings: Option<&'static str>,
    pub tool_config: Option<&'static str>,
}

impl Default for Templates {
    fn default() -> Self {
        Self {
            settings: Some(DEFAULT_SETTINGS_TEMPLATE),
            tool_config: Some(DEFAULT_TOOL_CONFIG_TEMPLATE),
        }
    }
}

/// Owns the settings file and the companion yt-dlp configuration of one
/// install directory.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    install_dir: PathBuf,
    settings_path: PathBuf,
    tool_config_path: PathBuf,
    templates: Templates,
}

impl ConfigStore {
    pub fn new(install_dir: impl Into<PathBuf>) -> Self {
        let install_dir = install_dir.into();
        Self {
            settings_path: install_dir.join(SETTINGS_FILE_NAME),
            tool_config_path: install_dir.join(TOOL_CONFIG_FILE_NAME),
            install_dir,
            templates: Templates::default(),
        }
    }

    pub fn with_templates(mut self, templates: Templates) -> Self {
        self.templates = templates;
        self
    }

    pub fn install_dir(&self) -> &Path {
        &self.install_dir
    }

    pub fn settings_path(&self) -> &Path {
        &self.settings_path
    }

    pub fn tool_config_path(&self) -> &Path {
        &self.tool_config_path
    }

    pub fn load(&self) -> Result<Option<Settings>, ConfigError> {
        load(&self.settings_path)
    }

    pub fn save(&self, settings: &Settings) -> Result<(), ConfigError> {
        save(&self.settings_path, settings)
    }

    /// Apply a user edit and persist it before returning.
    pub fn update<F>(&self, settings: &mut Settings, edit: F) -> Result<(), ConfigError>
    where
        F: FnOnce(&mut Settings),
    {
        let mut next = settings.clone();
        edit(&mut next);
        self.save(&next)?;
        log::info!("Settings saved to {}", self.settings_path.display());
        *settings = next;
        Ok(())
    }

    /// Make sure both configuration files and the output directory exist.
    ///
    /// Returns the effective settings (with `fallback_output_dir` filled in
    /// when the file names none) and the absolute output directory.
    /// Running it again on an initialized directory changes nothing.
    pub fn ensure_defaults(
        &self,
        fallback_output_dir: &str,
    ) -> Result<(Settings, PathBuf), ConfigError> {
        if let Some(template) = self.templates.tool_config {
            if !self.tool_config_path.exists() {
                let mut data = UTF8_BOM.to_vec();
                data.extend_from_slice(template.as_bytes());
                fs::write(&self.tool_config_path, data).map_err(|source| ConfigError::Write {
                    path: self.tool_config_path.clone(),
                    source,
                })?;
                log::info!(
                    "Wrote default yt-dlp configuration to {}",
                    self.tool_config_path.display()
                );
            }
        }

        let mut settings = match self.load()? {
            Some(existing) => existing,
            None => match self.templates.settings {
                Some(template) => {
                    fs::write(&self.settings_path, template).map_err(|source| {
                        ConfigError::Write {
                            path: self.settings_path.clone(),
                            source,
                        }
                    })?;
                    log::info!("Wrote default settings to {}", self.settings_path.display());
                    let mut seeded = self.load()?.ok_or_else(|| ConfigError::Read {
                        path: self.settings_path.clone(),
                        source: io::Error::new(
                            io::ErrorKind::NotFound,
                            "settings file vanished after writing it",
                        ),
                    })?;
                    if seeded.output_dir.trim().is_empty() {
                        seeded.output_dir = fallback_output_dir.to_string();
                        self.save(&seeded)?;
                    }
                    seeded
                }
                None => {
                    let minimal = Settings {
                        output_dir: fallback_output_dir.to_string(),
                        ..Settings::default()
                    };
                    self.save(&minimal)?;
                    log::info!("Wrote minimal settings to {}", self.settings_path.display());
                    minimal
                }
            },
        };

        if settings.output_dir.trim().is_empty() {
            settings.output_dir = fallback_output_dir.to_string();
        }

        let resolved = settings.resolve_output_dir(&self.install_dir);
        fs::create_dir_all(&resolved).map_err(|source| ConfigError::CreateDir {
            path: resolved.clone(),
            source,
        })?;

        Ok((settings, resolved))
    }
}
