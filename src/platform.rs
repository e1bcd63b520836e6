//! Platform capabilities
//!
//! Everything that differs between operating-system families lives here and is
//! selected once at startup via [`Platform::current`].

use std::io;
use std::path::Path;

use tokio::process::Command;

/// Windows flag to prevent console window from appearing when spawning processes.
#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x08000000;

const RELEASE_BASE_URL: &str = "https://github.com/yt-dlp/yt-dlp/releases/latest/download";

/// Operating-system family the core is running on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Windows,
    Unix,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(windows) {
            Platform::Windows
        } else {
            Platform::Unix
        }
    }

    /// File name of the yt-dlp executable.
    pub fn binary_name(self) -> &'static str {
        match self {
            Platform::Windows => "yt-dlp.exe",
            Platform::Unix => "yt-dlp",
        }
    }

    /// Latest-release download asset for this platform.
    pub fn default_source_url(self) -> String {
        format!("{}/{}", RELEASE_BASE_URL, self.binary_name())
    }

    /// Whether child output may arrive in a legacy regional code page
    /// (GBK/GB18030 consoles) rather than UTF-8.
    pub fn legacy_decoding(self) -> bool {
        matches!(self, Platform::Windows)
    }

    /// Keep the child from popping up a console window.
    pub fn suppress_console(self, cmd: &mut Command) {
        #[cfg(windows)]
        if self == Platform::Windows {
            cmd.creation_flags(CREATE_NO_WINDOW);
        }
        #[cfg(not(windows))]
        let _ = cmd;
    }

    /// Mark a freshly installed binary as executable (0755). No-op on Windows.
    pub fn make_executable(self, path: &Path) -> io::Result<()> {
        if self == Platform::Windows {
            return Ok(());
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))?;
        }
        #[cfg(not(unix))]
        let _ = path;

        Ok(())
    }
}
