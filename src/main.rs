//! Speedrack: runs the Ookla speedtest CLI and shows its progress.
//!
//! This is the entry point of the application. It parses command-line arguments,
//! loads configuration, and drives either the terminal UI or the plain-text
//! mode until the test reports a result.

mod app;
mod assemble;
mod classify;
mod clipboard;
mod commands;
mod config;
mod errors;
mod events;
mod history;
mod orchestrator;
mod output;
mod process;
mod progress;
mod record;
mod runner;
mod tui;

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::builder::styling::{AnsiColor, Effects, Style};
use clap::builder::Styles;
use clap::{Parser, Subcommand};
use clap_verbosity_flag::{Verbosity, WarnLevel};
use log::{debug, warn, LevelFilter};
use tokio::sync::mpsc;

use crate::app::{App, AppAction};
use crate::clipboard::{copy_report, SystemClipboard, TextSink};
use crate::commands::{Launcher, LauncherCommand, Outcome};
use crate::config::Config;
use crate::events::{ChannelSink, Event};
use crate::history::{default_history_path, default_log_path, History, HistoryEntry};
use crate::orchestrator::TestOrchestrator;
use crate::process::{OutputFormat, TestOptions};
use crate::progress::Stage;
use crate::record::SpeedTestRecord;
use crate::runner::{ProcessRunner, RunnerConfig, DEFAULT_GRACE_MS, DEFAULT_TIMEOUT_SECS};

/// Command-line interface definition.
#[derive(Debug, Parser)]
#[command(
    name = "speedrack",
    version,
    about = "Internet speed test runner with TUI",
    styles = help_styles(),
    color = clap::ColorChoice::Always,
    disable_help_subcommand = true
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
    /// Path to speedrack.toml configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Ignore any speedrack.toml.
    #[arg(long, global = true)]
    no_config: bool,
    /// Disable the TUI and print to stdout.
    #[arg(long, global = true)]
    no_ui: bool,
    /// Path to the speedtest executable.
    #[arg(long, global = true)]
    cli: Option<String>,
    /// Test against this server id.
    #[arg(long, global = true)]
    server_id: Option<u64>,
    /// Output mode requested from the tool.
    #[arg(long, value_enum, global = true)]
    format: Option<OutputFormat>,
    /// Stop the test after this many seconds (0 disables the limit).
    #[arg(long, global = true)]
    timeout_secs: Option<u64>,
    /// Time the tool gets to exit after a cancel before it is killed (ms).
    #[arg(long, global = true)]
    grace_ms: Option<u64>,
    /// Max output lines kept per test.
    #[arg(long, global = true)]
    max_lines: Option<usize>,
    /// Do not copy the report to the clipboard.
    #[arg(long, global = true)]
    no_clipboard: bool,
    /// Do not record the result in the history file.
    #[arg(long, global = true)]
    no_history: bool,
    #[command(flatten)]
    verbose: Verbosity<WarnLevel>,
}

#[derive(Debug, Clone, Subcommand)]
enum Commands {
    /// Run a full speed test (default).
    Run,
    /// Measure latency and download only.
    Quick,
    /// Show recent results.
    History {
        /// Number of entries to show.
        #[arg(long, default_value_t = 10)]
        limit: usize,
        /// Delete all recorded results.
        #[arg(long)]
        clear: bool,
    },
    /// List the servers the tool can test against.
    Servers,
    /// Print the launcher entries.
    Commands,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = load_settings(&cli)?;
    let command = cli.command.clone().unwrap_or(Commands::Run);
    let interactive = matches!(command, Commands::Run | Commands::Quick) && !settings.no_ui;
    init_logger(cli.verbose.log_level_filter(), interactive);

    let (event_tx, event_rx) = mpsc::channel(256);
    let launcher = build_launcher(&settings, event_tx.clone());

    match command {
        Commands::Run | Commands::Quick => {
            let test = if matches!(command, Commands::Quick) {
                LauncherCommand::RunQuickTest
            } else {
                LauncherCommand::RunTest
            };
            if interactive {
                run_tui(&launcher, test, &settings, event_tx, event_rx).await
            } else {
                run_plain(&launcher, test, &settings, event_tx, event_rx).await
            }
        }
        Commands::History { limit, clear } => {
            show_history(&launcher.with_history_limit(limit), &settings, clear)
        }
        Commands::Servers => list_servers(&launcher).await,
        Commands::Commands => {
            for entry in launcher.query() {
                let name = entry.command.map(|command| command.name()).unwrap_or("-");
                println!("{:<8} {}  ({})", name, entry.title, entry.subtitle);
            }
            Ok(())
        }
    }
}

fn build_launcher(settings: &RunSettings, tx: mpsc::Sender<Event>) -> Launcher {
    let sink = Arc::new(ChannelSink::new(tx));
    let runner = ProcessRunner::new(RunnerConfig::new(settings.grace_ms, settings.timeout_secs));
    let orchestrator = TestOrchestrator::new(runner, sink.clone(), sink)
        .with_program(settings.cli_path.clone())
        .with_max_lines(settings.max_lines);
    Launcher::new(
        orchestrator,
        settings.options.clone(),
        settings.history_file.clone(),
    )
}

/// Sends log records to stderr, or to the log file while the TUI owns the screen.
fn init_logger(level: LevelFilter, interactive: bool) {
    let mut builder = env_logger::Builder::new();
    builder.filter_level(level).parse_env("SPEEDRACK_LOG");
    if interactive {
        match open_log_file() {
            Some(file) => builder.target(env_logger::Target::Pipe(Box::new(file))),
            None => builder.filter_level(LevelFilter::Off),
        };
    }
    let _ = builder.try_init();
}

fn open_log_file() -> Option<File> {
    let path = default_log_path()?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).ok()?;
    }
    OpenOptions::new().create(true).append(true).open(path).ok()
}

async fn run_tui(
    launcher: &Launcher,
    test: LauncherCommand,
    settings: &RunSettings,
    event_tx: mpsc::Sender<Event>,
    mut event_rx: mpsc::Receiver<Event>,
) -> Result<()> {
    start_test(launcher, test)?;
    let mut terminal = tui::init_terminal().context("failed to initialise terminal")?;
    spawn_input_listener(event_tx.clone());
    spawn_signal_listener(event_tx);

    let mut app = App::new(settings.decimal_comma);
    let mut clipboard = SystemClipboard::default();
    let mut ticker = tokio::time::interval(Duration::from_millis(150));
    let mut result = Ok(());

    loop {
        tokio::select! {
            Some(event) = event_rx.recv() => {
                match event {
                    Event::Key(key) => {
                        let action = app.handle_key(key);
                        handle_app_action(action, &mut app, launcher, test, &mut clipboard);
                    }
                    Event::Interrupt => {
                        let action = app.request_cancel(true);
                        handle_app_action(action, &mut app, launcher, test, &mut clipboard);
                    }
                    Event::Resize { .. } => {}
                    Event::Completed(record) => {
                        let copied = finish_record(&record, settings, &mut clipboard);
                        app.on_event(Event::Completed(record));
                        if copied {
                            app.set_status_message("Report copied to clipboard");
                        }
                    }
                    other => app.on_event(other),
                }
            }
            _ = ticker.tick() => {}
        }

        if app.should_quit {
            break;
        }
        if let Err(err) = tui::draw(&app, &mut terminal) {
            result = Err(anyhow::Error::from(err).context("failed to draw"));
            break;
        }
    }

    launcher.orchestrator().cancel();
    tui::restore_terminal(terminal)?;
    result
}

fn handle_app_action(
    action: AppAction,
    app: &mut App,
    launcher: &Launcher,
    test: LauncherCommand,
    clipboard: &mut dyn TextSink,
) {
    match action {
        AppAction::Cancel => {
            if let Ok(Outcome::CancelRequested(false)) =
                launcher.execute(LauncherCommand::CancelTest)
            {
                app.set_status_warning_for("No test is running", Duration::from_secs(2));
            }
        }
        AppAction::Rerun => match launcher.execute(test) {
            Ok(Outcome::Started(_)) => app.restart(),
            Ok(_) => app.set_status_warning_for(
                "The previous test is still finishing",
                Duration::from_secs(2),
            ),
            Err(err) => app.set_status_warning_for(
                format!("could not start test: {}", err),
                Duration::from_secs(3),
            ),
        },
        AppAction::CopyReport => {
            let Some(report) = app.record.as_ref().map(|record| record.report(app.decimal_comma))
            else {
                app.set_status_warning_for("nothing to copy", Duration::from_secs(2));
                return;
            };
            if copy_report(clipboard, &report) {
                app.set_status_message("Report copied to clipboard");
            } else {
                app.set_status_warning_for("clipboard unavailable", Duration::from_secs(3));
            }
        }
        AppAction::Quit | AppAction::None => {}
    }
}

async fn run_plain(
    launcher: &Launcher,
    test: LauncherCommand,
    settings: &RunSettings,
    event_tx: mpsc::Sender<Event>,
    mut event_rx: mpsc::Receiver<Event>,
) -> Result<()> {
    start_test(launcher, test)?;
    spawn_signal_listener(event_tx);
    let mut clipboard = SystemClipboard::default();
    let mut last_stage: Option<Stage> = None;
    let mut server_shown = false;

    while let Some(event) = event_rx.recv().await {
        match event {
            Event::Stage(state) => {
                if last_stage != Some(state.stage) {
                    println!("{}", state.stage.label());
                    last_stage = Some(state.stage);
                }
                if !server_shown {
                    if let Some(server) = state.server_label() {
                        println!("Server: {}", server);
                        server_shown = true;
                    }
                }
            }
            Event::Completed(record) => {
                println!();
                println!("{}", record.report(settings.decimal_comma));
                if finish_record(&record, settings, &mut clipboard) {
                    println!("(copied to clipboard)");
                }
                return Ok(());
            }
            Event::Failed { kind, message } => {
                bail!("{}: {}", kind.description(), message);
            }
            Event::Cancelled => bail!("speed test cancelled"),
            Event::Interrupt => {
                eprintln!("Cancelling...");
                launcher.execute(LauncherCommand::CancelTest)?;
            }
            Event::Live(_) | Event::Key(_) | Event::Resize { .. } => {}
        }
    }
    Err(anyhow!("speed test ended without a result"))
}

fn start_test(launcher: &Launcher, test: LauncherCommand) -> Result<()> {
    match launcher.execute(test)? {
        Outcome::Started(_) => Ok(()),
        _ => Err(anyhow!("a speed test is already running")),
    }
}

/// Copies, records and announces a finished test. Returns whether the report was copied.
fn finish_record(
    record: &SpeedTestRecord,
    settings: &RunSettings,
    clipboard: &mut dyn TextSink,
) -> bool {
    if settings.save_history {
        if let Some(path) = &settings.history_file {
            debug!("recording result in {}", path.display());
            if let Err(err) = append_history(path, record) {
                warn!("could not save history: {:#}", err);
            }
        }
    }
    if settings.show_notifications {
        let mut stdout = std::io::stdout();
        let _ = stdout.write_all(b"\x07");
        let _ = stdout.flush();
    }
    settings.copy_to_clipboard && copy_report(clipboard, &record.report(settings.decimal_comma))
}

fn append_history(path: &std::path::Path, record: &SpeedTestRecord) -> Result<()> {
    let mut history = History::load(path)?;
    history.push(HistoryEntry::from(record));
    history.save()
}

fn show_history(launcher: &Launcher, settings: &RunSettings, clear: bool) -> Result<()> {
    if clear {
        let path = settings
            .history_file
            .as_deref()
            .ok_or_else(|| anyhow!("no history location (set history_file)"))?;
        let mut history = History::load(path)?;
        let removed = history.len();
        history.clear();
        history.save()?;
        println!("Removed {} entries from {}", removed, history.path().display());
        return Ok(());
    }
    match launcher.execute(LauncherCommand::ShowHistory)? {
        Outcome::History(entries) if entries.is_empty() => println!("No speed tests recorded yet"),
        Outcome::History(entries) => {
            for entry in entries {
                println!("{}", entry.summary(settings.decimal_comma));
            }
        }
        _ => {}
    }
    Ok(())
}

async fn list_servers(launcher: &Launcher) -> Result<()> {
    let servers = launcher.orchestrator().list_servers().await?;
    if servers.is_empty() {
        println!("No servers found");
    }
    for server in servers {
        println!(
            "{:>6}  {}  {}, {}",
            server.id, server.name, server.location, server.country
        );
    }
    Ok(())
}

fn spawn_input_listener(tx: mpsc::Sender<Event>) {
    std::thread::spawn(move || loop {
        if crossterm::event::poll(Duration::from_millis(100)).unwrap_or(false) {
            let sent = match crossterm::event::read() {
                Ok(crossterm::event::Event::Key(key)) => tx.blocking_send(Event::Key(key)),
                Ok(crossterm::event::Event::Resize(width, height)) => {
                    tx.blocking_send(Event::Resize { width, height })
                }
                _ => Ok(()),
            };
            if sent.is_err() {
                break;
            }
        }
    });
}

fn spawn_signal_listener(tx: mpsc::Sender<Event>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(_) => return,
            };
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
                if tx.send(Event::Interrupt).await.is_err() {
                    break;
                }
            }
        }
        #[cfg(not(unix))]
        {
            while tokio::signal::ctrl_c().await.is_ok() {
                if tx.send(Event::Interrupt).await.is_err() {
                    break;
                }
            }
        }
    });
}

fn load_settings(cli: &Cli) -> Result<RunSettings> {
    let mut config = Config::default();
    if !cli.no_config {
        if let Some(path) = cli.config.clone().or_else(config::default_config_path) {
            config = config::load_config(&path)?;
        }
    }
    RunSettings::from_cli(cli, &config)
}

fn help_styles() -> Styles {
    Styles::styled()
        .header(
            Style::new()
                .fg_color(Some(AnsiColor::Cyan.into()))
                .effects(Effects::BOLD),
        )
        .usage(
            Style::new()
                .fg_color(Some(AnsiColor::Green.into()))
                .effects(Effects::BOLD),
        )
        .literal(Style::new().fg_color(Some(AnsiColor::Yellow.into())))
        .placeholder(Style::new().fg_color(Some(AnsiColor::Magenta.into())))
        .valid(Style::new().fg_color(Some(AnsiColor::Green.into())))
        .invalid(
            Style::new()
                .fg_color(Some(AnsiColor::Red.into()))
                .effects(Effects::BOLD),
        )
}

/// Runtime configuration derived from CLI arguments and the config file.
#[derive(Debug, Clone, PartialEq)]
struct RunSettings {
    options: TestOptions,
    cli_path: Option<String>,
    no_ui: bool,
    copy_to_clipboard: bool,
    show_notifications: bool,
    save_history: bool,
    timeout_secs: u64,
    grace_ms: u64,
    max_lines: usize,
    decimal_comma: bool,
    history_file: Option<PathBuf>,
}

impl RunSettings {
    fn from_cli(cli: &Cli, config: &Config) -> Result<Self> {
        const DEFAULT_MAX_LINES: usize = 500;
        let format = match cli.format {
            Some(format) => format,
            None => config.output_format()?.unwrap_or_default(),
        };
        let options = TestOptions {
            format,
            server_id: cli.server_id.or(config.preferred_server_id),
            no_upload: false,
            extra_args: config.extra_args()?,
        };
        let history_file = config.history_file.clone().or_else(default_history_path);
        Ok(Self {
            options,
            cli_path: cli.cli.clone().or_else(|| config.cli_path.clone()),
            no_ui: cli.no_ui,
            copy_to_clipboard: !cli.no_clipboard && config.copy_to_clipboard.unwrap_or(true),
            show_notifications: config.show_notifications.unwrap_or(true),
            save_history: !cli.no_history && config.save_history.unwrap_or(true),
            timeout_secs: cli
                .timeout_secs
                .or(config.timeout_secs)
                .unwrap_or(DEFAULT_TIMEOUT_SECS),
            grace_ms: cli.grace_ms.or(config.grace_ms).unwrap_or(DEFAULT_GRACE_MS),
            max_lines: cli
                .max_lines
                .or(config.max_lines)
                .unwrap_or(DEFAULT_MAX_LINES)
                .max(1),
            decimal_comma: config.decimal_comma.unwrap_or(false),
            history_file,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("speedrack").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn defaults_without_config() {
        let cli = parse(&[]);
        assert!(cli.command.is_none());
        let settings = RunSettings::from_cli(&cli, &Config::default()).unwrap();
        assert_eq!(settings.options, TestOptions::default());
        assert!(settings.copy_to_clipboard);
        assert!(settings.show_notifications);
        assert!(settings.save_history);
        assert_eq!(settings.timeout_secs, 120);
        assert_eq!(settings.grace_ms, 3000);
        assert_eq!(settings.max_lines, 500);
        assert!(!settings.decimal_comma);
    }

    #[test]
    fn flags_override_config() {
        let config: Config = toml::from_str(
            r#"
preferred_server_id = 1
cli_path = "/opt/speedtest"
output = "human"
timeout_secs = 30
grace_ms = 100
copy_to_clipboard = true
extra_args = "--interface eth0"
decimal_comma = true
history_file = "/tmp/speedrack-history.json"
"#,
        )
        .unwrap();
        let cli = parse(&[
            "--server-id",
            "2445",
            "--cli",
            "./speedtest",
            "--format",
            "json",
            "--timeout-secs",
            "0",
            "--no-clipboard",
            "--no-history",
        ]);
        let settings = RunSettings::from_cli(&cli, &config).unwrap();
        assert_eq!(settings.options.server_id, Some(2445));
        assert_eq!(settings.options.format, OutputFormat::Json);
        assert_eq!(settings.options.extra_args, vec!["--interface", "eth0"]);
        assert_eq!(settings.cli_path.as_deref(), Some("./speedtest"));
        assert_eq!(settings.timeout_secs, 0);
        assert_eq!(settings.grace_ms, 100);
        assert!(!settings.copy_to_clipboard);
        assert!(!settings.save_history);
        assert!(settings.decimal_comma);
        assert_eq!(
            settings.history_file,
            Some(PathBuf::from("/tmp/speedrack-history.json"))
        );
    }

    #[test]
    fn config_output_mode_applies_without_flag() {
        let config: Config = toml::from_str(r#"output = "text""#).unwrap();
        let settings = RunSettings::from_cli(&parse(&[]), &config).unwrap();
        assert_eq!(settings.options.format, OutputFormat::Human);
        let config: Config = toml::from_str(r#"output = "xml""#).unwrap();
        assert!(RunSettings::from_cli(&parse(&[]), &config).is_err());
    }

    #[test]
    fn parses_subcommands_with_global_flags() {
        let cli = parse(&["history", "--limit", "5", "--no-config"]);
        assert!(cli.no_config);
        assert!(matches!(
            cli.command,
            Some(Commands::History {
                limit: 5,
                clear: false
            })
        ));
        let cli = parse(&["quick", "--no-ui", "--format", "text"]);
        assert!(matches!(cli.command, Some(Commands::Quick)));
        assert!(cli.no_ui);
        assert_eq!(cli.format, Some(OutputFormat::Human));
        assert!(Cli::try_parse_from(["speedrack", "--format", "xml"]).is_err());
    }
}
