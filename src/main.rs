mod app;
mod cli;
mod config;
mod context;
mod diff;
mod divergence;
mod error;
mod input;
mod k8s;
mod manifest;
mod model;
mod notification;
mod operator;
mod session;
#[cfg(test)]
mod testing;
mod ui;
mod watch;

use anyhow::{Context, Result};
use app::{App, AppCommand, ChannelLogWriter, ChannelSurface, UiEvent};
use clap::Parser;
use cli::CliArgs;
use config::RuntimeConfig;
use context::{ContextManager, ModelChangeObservable};
use crossterm::event::{
    Event, EventStream, KeyEventKind, KeyboardEnhancementFlags, PopKeyboardEnhancementFlags,
    PushKeyboardEnhancementFlags,
};
use crossterm::execute;
use crossterm::terminal::{
    EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode,
    supports_keyboard_enhancement,
};
use error::ActionError;
use futures::StreamExt;
use k8s::{ContextSettings, kube_context_factory, named_context};
use manifest::ManifestFile;
use model::ConnectionStatus;
use operator::Subscription;
use ratatui::Terminal;
use ratatui::backend::CrosstermBackend;
use session::EditSession;
use std::io::{self, Stdout};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{mpsc, watch as status_watch};
use tokio::time::{Duration, MissedTickBehavior, interval};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

type TuiTerminal = Terminal<CrosstermBackend<Stdout>>;

struct Runtime {
    config: RuntimeConfig,
    manifest: ManifestFile,
    session: EditSession,
    ui_tx: mpsc::UnboundedSender<UiEvent>,
    logs: Option<Subscription>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();
    init_tracing(&args.log_filter, args.log_file.as_deref())?;

    let config = RuntimeConfig::load(args.config.as_deref())?;
    if let Some(source) = &config.source {
        info!("loaded runtime config from {source}");
    }

    let mut manifest = ManifestFile::new(&args.manifest);
    let body = manifest.load()?;

    let settings = ContextSettings {
        namespace: args.namespace.clone(),
        watch: config.watch.settings(),
        watch_timeout_secs: config.watch.timeout_secs,
    };
    let mut contexts = ContextManager::new(
        kube_context_factory(settings),
        ModelChangeObservable::default(),
    );
    let named = args.context.as_deref().map(named_context).transpose()?;
    let context = contexts.activate(named).await?;

    let (ui_tx, ui_rx) = mpsc::unbounded_channel();
    let surface = Arc::new(ChannelSurface::new(ui_tx.clone()));
    let session = EditSession::open(context.as_ref(), body, surface).await?;

    let mut app = App::new(manifest.path().display().to_string());
    app.set_context(context.name(), context.current_namespace());
    app.set_resource(session.identity().to_string(), session.supports_logs());
    app.set_manifest_text(manifest.contents().to_string());
    app.set_status(format!("Watching {} for cluster changes", session.identity()));

    let status = context.connection_status();
    let mut runtime = Runtime {
        config,
        manifest,
        session,
        ui_tx,
        logs: None,
    };
    let result = run(&mut app, &mut runtime, ui_rx, status, args.refresh_ms.max(100)).await;

    if let Some(logs) = runtime.logs.take() {
        logs.cancel();
    }
    contexts.close().await;
    result
}

fn init_tracing(level_filter: &str, log_file: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::try_new(level_filter)
        .or_else(|_| EnvFilter::try_new("info"))
        .context("failed to initialize tracing filter")?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(false)
        .compact();

    // the terminal belongs to the UI; logs go to a file or nowhere
    match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            let _ = builder.with_writer(std::sync::Mutex::new(file)).try_init();
        }
        None => {
            let _ = builder.with_writer(std::io::sink).try_init();
        }
    }

    Ok(())
}

async fn run(
    app: &mut App,
    runtime: &mut Runtime,
    ui_rx: mpsc::UnboundedReceiver<UiEvent>,
    status: status_watch::Receiver<ConnectionStatus>,
    refresh_ms: u64,
) -> Result<()> {
    let (mut terminal, keyboard_enhanced) = init_terminal()?;
    let run_result = run_loop(&mut terminal, app, runtime, ui_rx, status, refresh_ms).await;
    let restore_result = restore_terminal(&mut terminal, keyboard_enhanced);

    match (run_result, restore_result) {
        (Err(run_error), Err(restore_error)) => Err(anyhow::anyhow!(
            "{run_error:#}\nterminal restore error: {restore_error:#}"
        )),
        (Err(error), _) => Err(error),
        (_, Err(error)) => Err(error),
        (Ok(()), Ok(())) => Ok(()),
    }
}

fn init_terminal() -> Result<(TuiTerminal, bool)> {
    enable_raw_mode().context("failed to enable raw mode")?;
    let mut stdout = io::stdout();
    let keyboard_enhanced = matches!(supports_keyboard_enhancement(), Ok(true));
    if keyboard_enhanced {
        execute!(
            stdout,
            EnterAlternateScreen,
            PushKeyboardEnhancementFlags(
                KeyboardEnhancementFlags::DISAMBIGUATE_ESCAPE_CODES
                    | KeyboardEnhancementFlags::REPORT_EVENT_TYPES
            )
        )
        .context("failed to enter alternate screen with keyboard enhancement")?;
    } else {
        execute!(stdout, EnterAlternateScreen).context("failed to enter alternate screen")?;
    }
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend).context("failed to create terminal backend")?;
    terminal.clear().context("failed to clear terminal")?;
    Ok((terminal, keyboard_enhanced))
}

fn restore_terminal(terminal: &mut TuiTerminal, keyboard_enhanced: bool) -> Result<()> {
    if keyboard_enhanced {
        execute!(terminal.backend_mut(), PopKeyboardEnhancementFlags)
            .context("failed to pop keyboard enhancement flags")?;
    }
    disable_raw_mode().context("failed to disable raw mode")?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)
        .context("failed to leave alternate screen")?;
    terminal.show_cursor().context("failed to show cursor")?;
    Ok(())
}

async fn run_loop(
    terminal: &mut TuiTerminal,
    app: &mut App,
    runtime: &mut Runtime,
    mut ui_rx: mpsc::UnboundedReceiver<UiEvent>,
    mut status: status_watch::Receiver<ConnectionStatus>,
    refresh_ms: u64,
) -> Result<()> {
    let mut reader = EventStream::new();
    let mut ticker = interval(Duration::from_millis(refresh_ms));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    app.set_connection(status.borrow_and_update().clone());

    loop {
        terminal
            .draw(|frame| ui::render(frame, app))
            .context("failed to render terminal frame")?;

        if !app.running() {
            break;
        }

        tokio::select! {
            maybe_event = reader.next() => {
                match maybe_event {
                    Some(Ok(Event::Key(key))) if key.kind == KeyEventKind::Press => {
                        if let Some(action) = input::map_key(key) {
                            debug!("action={action:?}");
                            let command = app.apply_action(action);
                            execute_app_command(app, runtime, command).await;
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(error)) => {
                        app.set_status(format!("terminal event error: {error}"));
                    }
                    None => {
                        app.set_status("terminal event stream closed");
                        break;
                    }
                }
            }
            _ = ticker.tick() => {
                refresh_manifest(app, runtime).await;
            }
            maybe_event = ui_rx.recv() => {
                match maybe_event {
                    Some(UiEvent::Notify(notification)) => app.set_notification(notification),
                    Some(UiEvent::Clear) => app.clear_notification(),
                    Some(UiEvent::Logs(chunk)) => app.append_logs(&chunk),
                    None => break,
                }
            }
            changed = status.changed() => {
                if changed.is_err() {
                    app.set_status("cluster context closed");
                    break;
                }
                app.set_connection(status.borrow_and_update().clone());
            }
        }

        if runtime.logs.as_ref().is_some_and(Subscription::is_finished) && app.logs_active() {
            runtime.logs = None;
            app.set_logs_stopped();
            app.set_status("Log stream ended");
        }
    }

    Ok(())
}

async fn refresh_manifest(app: &mut App, runtime: &mut Runtime) {
    match runtime.manifest.reload_if_changed() {
        Ok(Some(body)) => {
            debug!(
                "manifest changed on disk (mtime {:?})",
                runtime.manifest.modified()
            );
            runtime.session.update_local(body).await;
            app.set_manifest_text(runtime.manifest.contents().to_string());
            app.set_status("Local edit recorded");
        }
        Ok(None) => {}
        Err(error) => {
            warn!("manifest reload failed: {error:#}");
            app.set_error("Manifest not reloaded", &compact_error(&error));
        }
    }
}

async fn execute_app_command(app: &mut App, runtime: &mut Runtime, command: AppCommand) {
    let controller = Arc::clone(runtime.session.controller());
    match command {
        AppCommand::None => {}
        AppCommand::Pull(token) => match controller.pull(token).await {
            Ok(snapshot) => match runtime.manifest.save(&snapshot.body) {
                Ok(()) => {
                    app.set_manifest_text(runtime.manifest.contents().to_string());
                    app.set_status(format!(
                        "Pulled {} at version {}",
                        snapshot.identity,
                        version_label(snapshot.version.as_ref())
                    ));
                }
                Err(error) => app.set_error("Pulled but failed to write manifest", &compact_error(&error)),
            },
            Err(error) => report_action_error(app, "Pull failed", &error),
        },
        AppCommand::Push => match controller.push().await {
            Ok(snapshot) => {
                if let Err(error) = runtime.manifest.save(&snapshot.body) {
                    app.set_error("Pushed but failed to write manifest", &compact_error(&error));
                    return;
                }
                app.set_manifest_text(runtime.manifest.contents().to_string());
                app.set_status(format!(
                    "Pushed {} now at version {}",
                    snapshot.identity,
                    version_label(snapshot.version.as_ref())
                ));
            }
            Err(error) => report_action_error(app, "Push rejected", &error),
        },
        AppCommand::Diff => match controller.diff().await {
            Ok(view) => match diff::unified_diff(&view, runtime.config.diff.context_lines) {
                Ok(text) => app.set_diff(text),
                Err(error) => app.set_error("Diff failed", &compact_error(&error)),
            },
            Err(error) => report_action_error(app, "Diff failed", &error),
        },
        AppCommand::Ignore => match controller.ignore().await {
            Ok(()) => app.set_status(format!("Ignored cluster change to {}", controller.identity())),
            Err(error) => report_action_error(app, "Ignore failed", &error),
        },
        AppCommand::StartLogs => {
            let sink = Box::new(ChannelLogWriter::new(runtime.ui_tx.clone()));
            match runtime.session.watch_logs(sink).await {
                Ok(subscription) => {
                    runtime.logs = Some(subscription);
                    app.set_logs_started();
                    app.set_status(format!("Following logs of {}", controller.identity()));
                }
                Err(error) => app.set_error("Logs unavailable", &error.to_string()),
            }
        }
        AppCommand::StopLogs => {
            if let Some(logs) = runtime.logs.take() {
                logs.cancel();
            }
            app.set_logs_stopped();
            app.set_status("Stopped following logs");
        }
    }
}

fn report_action_error(app: &mut App, prefix: &str, error: &ActionError) {
    warn!("{prefix}: {error}");
    app.set_error(prefix, &error.to_string());
}

fn version_label(version: Option<&model::ResourceVersion>) -> String {
    version
        .map(ToString::to_string)
        .unwrap_or_else(|| "-".to_string())
}

fn compact_error(error: &anyhow::Error) -> String {
    let mut out = Vec::new();
    for (index, cause) in error.chain().enumerate() {
        if index == 0 {
            out.push(cause.to_string());
        } else if index <= 2 {
            out.push(format!("caused by: {cause}"));
        } else {
            break;
        }
    }

    out.join("\n")
}
