use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub mod decode;
pub mod events;
pub mod fetcher;
pub mod logging;
pub mod platform;
pub mod retry;
pub mod settings;
pub mod tool_manager;
pub mod updater;
pub mod ytdlp;

use events::{DeskEvent, EventSender, LineSink};
use fetcher::BinaryFetcher;
use platform::Platform;
use settings::{ConfigStore, Settings, DEFAULT_OUTPUT_DIR};
use tool_manager::{ToolBinary, ToolManager};
use ytdlp::{RunError, YtDlpRunner};

#[derive(Parser, Debug)]
#[command(name = "ytdlp-desk")]
#[command(about = "Fetch, update and drive yt-dlp")]
#[command(version)]
struct Cli {
    /// Directory holding yt-dlp, its configuration and the settings file
    /// (defaults to the directory of this program)
    #[arg(long, global = true, value_name = "DIR")]
    home: Option<PathBuf>,

    /// Emit events as JSON lines on stdout
    #[arg(long, global = true)]
    json: bool,

    /// More log output (-v debug, -vv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Download a video with yt-dlp, fetching yt-dlp first if it is missing
    Download {
        /// Page or video URL handed to yt-dlp
        url: String,

        /// Fail instead of fetching yt-dlp when it is not installed
        #[arg(long)]
        no_fetch: bool,
    },

    /// Download the yt-dlp executable into the install directory
    Fetch {
        /// Expected SHA-256 of the executable (hex)
        #[arg(long)]
        sha256: Option<String>,
    },

    /// Let yt-dlp update itself
    Update,

    /// Show where yt-dlp is and which version it reports
    Status,

    /// Show or change the settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Open the output directory in the file browser
    Open,
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the current settings
    Show,

    /// Change settings; an empty value clears proxy or URL
    Set {
        /// Download folder
        #[arg(long)]
        output_dir: Option<PathBuf>,

        /// Proxy for fetching and updating yt-dlp (e.g. http://127.0.0.1:7890)
        #[arg(long)]
        proxy: Option<String>,

        /// Custom yt-dlp download URL
        #[arg(long)]
        url: Option<String>,
    },
}

/// Everything the commands share.
struct AppState {
    platform: Platform,
    store: ConfigStore,
    settings: Settings,
    output_dir: PathBuf,
    tools: ToolManager,
    fetcher: BinaryFetcher,
    runner: YtDlpRunner,
    events: EventSender,
}

impl AppState {
    fn install_dir(&self) -> &Path {
        self.store.install_dir()
    }
}

/// Turns the byte counts of a fetch into progress text, one line per
/// percent (or per MiB when the size is unknown).
#[derive(Debug, Default)]
pub struct ProgressLine {
    last: Option<u64>,
}

impl ProgressLine {
    pub fn update(&mut self, received: u64, total: Option<u64>) -> Option<String> {
        let (step, text) = match total.filter(|t| *t > 0) {
            Some(total) => {
                let percent = received.min(total) * 100 / total;
                (percent, format!("Downloading yt-dlp: {percent}%"))
            }
            None => (
                received / (1024 * 1024),
                format!("Downloading yt-dlp: {} KiB", received / 1024),
            ),
        };

        if self.last == Some(step) {
            return None;
        }
        self.last = Some(step);
        Some(text)
    }
}

fn print_event(event: DeskEvent, progress: &mut ProgressLine) {
    match event {
        DeskEvent::Line { text } => println!("{text}"),
        DeskEvent::FetchProgress { received, total } => {
            if let Some(text) = progress.update(received, total) {
                println!("{text}");
            }
        }
        DeskEvent::RunStarted { url } => println!("Starting download: {url}"),
        DeskEvent::Completed { ok: true, message } => println!("{message}"),
        DeskEvent::Completed { ok: false, message } => eprintln!("{message}"),
    }
}

/// Forward core events to stdout until every sender is gone.
fn spawn_renderer(mut rx: mpsc::UnboundedReceiver<DeskEvent>, json: bool) -> JoinHandle<()> {
    tokio::spawn(async move {
        log::debug!("Event forwarding task started");
        let mut progress = ProgressLine::default();
        while let Some(event) = rx.recv().await {
            if json {
                match serde_json::to_string(&event) {
                    Ok(line) => println!("{line}"),
                    Err(e) => log::error!("Failed to serialize event: {}", e),
                }
            } else {
                print_event(event, &mut progress);
            }
        }
        log::debug!("Event forwarding task ended");
    })
}

fn emit_json<T: Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string(value).context("Failed to serialize output")?
    );
    Ok(())
}

fn default_install_dir() -> Result<PathBuf> {
    let exe = std::env::current_exe().context("Cannot determine the program location")?;
    exe.parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| anyhow!("Program path {} has no parent directory", exe.display()))
}

/// Absolute form of a directory the user typed, relative to the working directory.
fn absolute_from_cwd(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir().context("Cannot determine the working directory")?;
    Ok(settings::resolve_against(&cwd, &path.to_string_lossy()))
}

async fn fetch_binary(state: &AppState, sha256: Option<&str>) -> Result<ToolBinary> {
    let installed = state
        .fetcher
        .fetch_checked(
            state.install_dir(),
            state.settings.proxy(),
            state.settings.source_url(),
            sha256,
            &state.events,
        )
        .await
        .context("Failed to download yt-dlp")?;

    if let Some(e) = &installed.chmod_error {
        log::warn!(
            "yt-dlp was installed but is not executable ({}); fix its permissions manually",
            e
        );
    }
    state.events.line(format!(
        "yt-dlp installed at {} ({} bytes, sha256 {})",
        installed.path.display(),
        installed.size,
        installed.sha256
    ));
    Ok(installed.binary())
}

async fn cmd_download(state: &AppState, url: &str, no_fetch: bool) -> Result<()> {
    let binary = match state.tools.locate() {
        Some(binary) => binary,
        None if no_fetch => bail!("yt-dlp not found; run `ytdlp-desk fetch` first"),
        None => {
            log::info!("yt-dlp not found, fetching it first");
            fetch_binary(state, None).await?
        }
    };

    state.events.send(DeskEvent::RunStarted {
        url: url.to_string(),
    });

    let sink = Arc::new(state.events.clone());
    match state
        .runner
        .run(&binary.path, &state.settings.output_dir, url, sink)
        .await
    {
        Ok(report) => {
            log::info!(
                "Saved to {}",
                report.output_template.parent().unwrap_or(state.output_dir.as_path()).display()
            );
            Ok(())
        }
        Err(RunError::AlreadyRunning) => bail!("Another download is still running"),
        Err(e) => Err(e).context("Download failed"),
    }
}

async fn cmd_update(state: &AppState) -> Result<()> {
    let binary = state
        .tools
        .locate()
        .ok_or_else(|| anyhow!("yt-dlp not found; run `ytdlp-desk fetch` first"))?;
    if !binary.update_capable() {
        log::warn!(
            "{} was not installed by ytdlp-desk; its package manager may refuse --update",
            binary.path.display()
        );
    }

    match updater::self_update(&binary.path, state.settings.proxy(), state.platform).await {
        Ok(report) => {
            state.events.line(report.output.trim_end().to_string());
            if let Some(v) = &report.version {
                state.events.line(format!("yt-dlp version: {v}"));
            }
            Ok(())
        }
        Err(e) => {
            if let Some(output) = e.output() {
                state.events.line(output.trim_end().to_string());
            }
            Err(e).context("yt-dlp update failed")
        }
    }
}

#[derive(Serialize)]
struct StatusView<'a> {
    install_dir: &'a Path,
    output_dir: &'a Path,
    tool: tool_manager::ToolInfo,
}

async fn cmd_status(state: &AppState, json: bool) -> Result<()> {
    let view = StatusView {
        install_dir: state.install_dir(),
        output_dir: &state.output_dir,
        tool: state.tools.status().await,
    };
    if json {
        return emit_json(&view);
    }

    println!("Install directory: {}", view.install_dir.display());
    println!("Output directory:  {}", view.output_dir.display());
    match &view.tool.binary {
        Some(binary) => {
            println!("yt-dlp:            {}", binary.path.display());
            println!(
                "Version:           {}",
                view.tool.version.as_deref().unwrap_or("unknown (not runnable)")
            );
        }
        None => println!("yt-dlp:            not installed"),
    }
    Ok(())
}

fn cmd_config(state: &mut AppState, action: ConfigAction, json: bool) -> Result<()> {
    match action {
        ConfigAction::Show => {
            if json {
                return emit_json(&state.settings);
            }
            println!("Settings file:  {}", state.store.settings_path().display());
            println!("output_dir:     {}", state.settings.output_dir);
            println!("download_proxy: {}", state.settings.download_proxy);
            println!("yt_dlp_url:     {}", state.settings.yt_dlp_url);
            Ok(())
        }
        ConfigAction::Set {
            output_dir,
            proxy,
            url,
        } => {
            if output_dir.is_none() && proxy.is_none() && url.is_none() {
                bail!("Nothing to change; pass --output-dir, --proxy or --url");
            }

            let chosen = output_dir.as_deref().map(absolute_from_cwd).transpose()?;
            if let Some(dir) = &chosen {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("Failed to create {}", dir.display()))?;
            }

            let install_dir = state.install_dir().to_path_buf();
            state
                .store
                .update(&mut state.settings, |s| {
                    if let Some(dir) = &chosen {
                        s.output_dir = Settings::relative_output_dir(&install_dir, dir);
                    }
                    if let Some(p) = proxy {
                        s.download_proxy = p.trim().to_string();
                    }
                    if let Some(u) = url {
                        s.yt_dlp_url = u.trim().to_string();
                    }
                })
                .context("Failed to save settings")?;

            println!("Settings saved to {}", state.store.settings_path().display());
            Ok(())
        }
    }
}

fn cmd_open(state: &AppState) -> Result<()> {
    log::info!("Opening {}", state.output_dir.display());
    open::that(&state.output_dir)
        .with_context(|| format!("Failed to open {}", state.output_dir.display()))
}

fn bootstrap(cli: &Cli) -> Result<(AppState, JoinHandle<()>)> {
    let install_dir = match &cli.home {
        Some(home) => {
            let home = absolute_from_cwd(home)?;
            std::fs::create_dir_all(&home)
                .with_context(|| format!("Failed to create {}", home.display()))?;
            home
        }
        None => default_install_dir()?,
    };

    logging::init_logger(
        logging::level_for(cli.verbose, cli.quiet),
        &install_dir.join(logging::LOG_FILE_NAME),
    )?;
    log::info!(
        "ytdlp-desk {} starting in {}",
        env!("CARGO_PKG_VERSION"),
        install_dir.display()
    );

    let platform = Platform::current();
    let store = ConfigStore::new(&install_dir);
    let (settings, output_dir) = store
        .ensure_defaults(DEFAULT_OUTPUT_DIR)
        .context("Failed to initialize configuration")?;
    log::debug!("Settings: {:?}, output directory {}", settings, output_dir.display());

    let (events, rx) = EventSender::channel();
    let renderer = spawn_renderer(rx, cli.json);

    let state = AppState {
        platform,
        tools: ToolManager::new(&install_dir, platform),
        fetcher: BinaryFetcher::new(platform),
        runner: YtDlpRunner::new(&install_dir, platform),
        store,
        settings,
        output_dir,
        events,
    };
    Ok((state, renderer))
}

async fn dispatch(cli: Cli) -> Result<()> {
    let (mut state, renderer) = bootstrap(&cli)?;
    let json = cli.json;

    let result = match cli.command {
        Commands::Download { url, no_fetch } => cmd_download(&state, &url, no_fetch).await,
        Commands::Fetch { sha256 } => fetch_binary(&state, sha256.as_deref()).await.map(|_| ()),
        Commands::Update => cmd_update(&state).await,
        Commands::Status => cmd_status(&state, json).await,
        Commands::Config { action } => cmd_config(&mut state, action, json),
        Commands::Open => cmd_open(&state),
    };

    if let Err(e) = &result {
        log::error!("{:#}", e);
    }

    // The renderer stops once the last sender is gone; let it print
    // everything that is still queued.
    drop(state);
    if let Err(e) = renderer.await {
        log::warn!("Event forwarding task failed: {}", e);
    }
    result
}

/// Entry point of the `ytdlp-desk` binary.
pub fn run() -> Result<()> {
    let cli = Cli::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start the async runtime")?;

    runtime.block_on(dispatch(cli))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_line_dedups_percent() {
        let mut line = ProgressLine::default();
        assert_eq!(line.update(0, Some(1000)).as_deref(), Some("Downloading yt-dlp: 0%"));
        assert_eq!(line.update(5, Some(1000)), None);
        assert_eq!(line.update(10, Some(1000)).as_deref(), Some("Downloading yt-dlp: 1%"));
        assert_eq!(line.update(1000, Some(1000)).as_deref(), Some("Downloading yt-dlp: 100%"));
        assert_eq!(line.update(1000, Some(1000)), None);
    }

    #[test]
    fn test_progress_line_unknown_total() {
        let mut line = ProgressLine::default();
        assert_eq!(line.update(32 * 1024, None).as_deref(), Some("Downloading yt-dlp: 32 KiB"));
        assert_eq!(line.update(64 * 1024, None), None);
        assert_eq!(
            line.update(1024 * 1024, None).as_deref(),
            Some("Downloading yt-dlp: 1024 KiB")
        );
        // A zero total is treated as unknown.
        assert_eq!(line.update(1024 * 1024 + 1, Some(0)), None);
    }

    #[test]
    fn test_cli_parses_download() {
        let cli = Cli::try_parse_from([
            "ytdlp-desk",
            "--home",
            "/tmp/desk",
            "-vv",
            "download",
            "https://example.com/watch?v=1",
        ])
        .unwrap();
        assert_eq!(cli.home, Some(PathBuf::from("/tmp/desk")));
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Commands::Download { url, no_fetch } => {
                assert_eq!(url, "https://example.com/watch?v=1");
                assert!(!no_fetch);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_cli_parses_config_set() {
        let cli = Cli::try_parse_from([
            "ytdlp-desk",
            "config",
            "set",
            "--proxy",
            "http://127.0.0.1:7890",
            "--json",
        ])
        .unwrap();
        assert!(cli.json);
        match cli.command {
            Commands::Config {
                action:
                    ConfigAction::Set {
                        output_dir,
                        proxy,
                        url,
                    },
            } => {
                assert_eq!(output_dir, None);
                assert_eq!(proxy.as_deref(), Some("http://127.0.0.1:7890"));
                assert_eq!(url, None);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_cli_requires_url() {
        assert!(Cli::try_parse_from(["ytdlp-desk", "download"]).is_err());
    }

    #[test]
    fn test_absolute_from_cwd() {
        let cwd = std::env::current_dir().unwrap();
        assert_eq!(absolute_from_cwd(Path::new("media")).unwrap(), cwd.join("media"));
        #[cfg(unix)]
        assert_eq!(
            absolute_from_cwd(Path::new("/srv/media")).unwrap(),
            PathBuf::from("/srv/media")
        );
    }
}
