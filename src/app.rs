use chrono::{DateTime, Local};
use std::io::Write;
use tokio::sync::mpsc;

use crate::input::Action;
use crate::model::ConnectionStatus;
use crate::notification::{Notification, NotificationSurface, NotificationToken};

const MAX_LOG_CHARS: usize = 500_000;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum BodyView {
    Manifest,
    Diff,
    Logs,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppCommand {
    None,
    Pull(NotificationToken),
    Push,
    Diff,
    Ignore,
    StartLogs,
    StopLogs,
}

#[derive(Debug, Clone)]
pub enum UiEvent {
    Notify(Notification),
    Clear,
    Logs(String),
}

#[derive(Debug, Clone)]
pub struct ChannelSurface {
    tx: mpsc::UnboundedSender<UiEvent>,
}

impl ChannelSurface {
    pub fn new(tx: mpsc::UnboundedSender<UiEvent>) -> Self {
        Self { tx }
    }
}

impl NotificationSurface for ChannelSurface {
    fn on_notify(&self, notification: &Notification) {
        let _ = self.tx.send(UiEvent::Notify(notification.clone()));
    }

    fn on_clear(&self) {
        let _ = self.tx.send(UiEvent::Clear);
    }
}

pub struct ChannelLogWriter {
    tx: mpsc::UnboundedSender<UiEvent>,
}

impl ChannelLogWriter {
    pub fn new(tx: mpsc::UnboundedSender<UiEvent>) -> Self {
        Self { tx }
    }
}

impl Write for ChannelLogWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.tx
            .send(UiEvent::Logs(String::from_utf8_lossy(buf).into_owned()))
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "ui closed"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

pub struct App {
    running: bool,
    context: String,
    namespace: String,
    resource: String,
    manifest_path: String,
    connection: ConnectionStatus,
    manifest_text: String,
    notification: Option<Notification>,
    view: BodyView,
    diff_text: String,
    logs: String,
    logs_active: bool,
    supports_logs: bool,
    show_help: bool,
    scroll: u16,
    view_width: u16,
    view_height: u16,
    status: String,
    status_at: DateTime<Local>,
}

impl App {
    pub fn new(manifest_path: String) -> Self {
        Self {
            running: true,
            context: "-".to_string(),
            namespace: "-".to_string(),
            resource: "-".to_string(),
            manifest_path,
            connection: ConnectionStatus::Connecting,
            manifest_text: String::new(),
            notification: None,
            view: BodyView::Manifest,
            diff_text: String::new(),
            logs: String::new(),
            logs_active: false,
            supports_logs: false,
            show_help: false,
            scroll: 0,
            view_width: 80,
            view_height: 20,
            status: "Starting".to_string(),
            status_at: Local::now(),
        }
    }

    pub fn running(&self) -> bool {
        self.running
    }

    pub fn context(&self) -> &str {
        &self.context
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn manifest_path(&self) -> &str {
        &self.manifest_path
    }

    pub fn connection(&self) -> &ConnectionStatus {
        &self.connection
    }

    pub fn notification(&self) -> Option<&Notification> {
        self.notification.as_ref()
    }

    pub fn view(&self) -> BodyView {
        self.view
    }

    pub fn show_help(&self) -> bool {
        self.show_help
    }

    pub fn scroll(&self) -> u16 {
        self.scroll
    }

    pub fn status(&self) -> &str {
        &self.status
    }

    pub fn status_at(&self) -> DateTime<Local> {
        self.status_at
    }

    pub fn logs_active(&self) -> bool {
        self.logs_active
    }

    pub fn body_title(&self) -> String {
        match self.view {
            BodyView::Manifest => format!("Manifest {}", self.manifest_path),
            BodyView::Diff => "Diff local → cluster (Esc to close)".to_string(),
            BodyView::Logs => format!("Logs {} (l to stop)", self.resource),
        }
    }

    pub fn body_text(&self) -> &str {
        match self.view {
            BodyView::Manifest => &self.manifest_text,
            BodyView::Diff => &self.diff_text,
            BodyView::Logs => &self.logs,
        }
    }

    pub fn set_context(&mut self, context: impl Into<String>, namespace: impl Into<String>) {
        self.context = context.into();
        self.namespace = namespace.into();
    }

    pub fn set_resource(&mut self, resource: impl Into<String>, supports_logs: bool) {
        self.resource = resource.into();
        self.supports_logs = supports_logs;
    }

    pub fn set_connection(&mut self, connection: ConnectionStatus) {
        if connection != self.connection {
            match &connection {
                ConnectionStatus::Disconnected { reason } => {
                    self.set_status(format!("Cluster connection lost: {reason}"));
                }
                ConnectionStatus::Connected
                    if matches!(self.connection, ConnectionStatus::Disconnected { .. }) =>
                {
                    self.set_status("Cluster connection restored");
                }
                _ => {}
            }
        }
        self.connection = connection;
    }

    pub fn set_manifest_text(&mut self, text: String) {
        self.manifest_text = text;
        if self.view == BodyView::Manifest {
            self.scroll = self.scroll.min(self.max_scroll());
        }
    }

    pub fn set_notification(&mut self, notification: Notification) {
        self.set_status(notification.message());
        self.notification = Some(notification);
    }

    pub fn clear_notification(&mut self) {
        self.notification = None;
        if self.view == BodyView::Diff {
            self.close_view();
        }
    }

    pub fn set_diff(&mut self, diff: String) {
        self.diff_text = if diff.is_empty() {
            "No differences after normalization".to_string()
        } else {
            diff
        };
        self.view = BodyView::Diff;
        self.scroll = 0;
    }

    pub fn set_logs_started(&mut self) {
        self.logs.clear();
        self.logs_active = true;
        self.view = BodyView::Logs;
        self.scroll = 0;
    }

    pub fn set_logs_stopped(&mut self) {
        self.logs_active = false;
        if self.view == BodyView::Logs {
            self.close_view();
        }
    }

    pub fn append_logs(&mut self, chunk: &str) {
        if !self.logs_active {
            return;
        }
        let follow = self.scroll >= self.max_scroll();
        self.logs.push_str(chunk);
        if self.logs.chars().count() > MAX_LOG_CHARS {
            let trimmed = self
                .logs
                .chars()
                .rev()
                .take(MAX_LOG_CHARS)
                .collect::<String>()
                .chars()
                .rev()
                .collect::<String>();
            self.logs = trimmed;
        }
        if follow && self.view == BodyView::Logs {
            self.scroll = self.max_scroll();
        }
    }

    pub fn set_viewport(&mut self, width: u16, height: u16) {
        self.view_width = width.max(1);
        self.view_height = height.max(1);
    }

    pub fn set_status(&mut self, status: impl Into<String>) {
        self.status = normalize_status_text(status.into());
        self.status_at = Local::now();
    }

    pub fn set_error(&mut self, prefix: &str, error: &str) {
        self.set_status(format!("{prefix}: {}", summarize_error_line(error)));
    }

    pub fn apply_action(&mut self, action: Action) -> AppCommand {
        if self.show_help && !matches!(action, Action::ToggleHelp) {
            self.show_help = false;
        }

        match action {
            Action::Quit => {
                self.running = false;
                self.status = "Exit requested".to_string();
                AppCommand::None
            }
            Action::Pull => match self.pending() {
                Some((token, _, _)) if self.connection_allows_sync() => AppCommand::Pull(token),
                Some(_) => {
                    self.set_status("Pull unavailable while the cluster connection is down");
                    AppCommand::None
                }
                None => {
                    self.set_status("Nothing to pull: no cluster change pending");
                    AppCommand::None
                }
            },
            Action::Push => match self.pending() {
                Some((_, _, true)) => {
                    self.set_status("Resource was deleted on cluster; pull to recreate it");
                    AppCommand::None
                }
                Some((_, false, _)) => {
                    self.set_status("Push unavailable: no local changes against the baseline");
                    AppCommand::None
                }
                Some(_) if !self.connection_allows_sync() => {
                    self.set_status("Push unavailable while the cluster connection is down");
                    AppCommand::None
                }
                Some(_) => AppCommand::Push,
                None => {
                    self.set_status("Nothing to push: no cluster change pending");
                    AppCommand::None
                }
            },
            Action::ShowDiff => {
                if self.notification.is_some() {
                    AppCommand::Diff
                } else {
                    self.set_status("Nothing to diff: no cluster change pending");
                    AppCommand::None
                }
            }
            Action::Ignore => {
                if self.notification.is_some() {
                    AppCommand::Ignore
                } else {
                    AppCommand::None
                }
            }
            Action::ToggleLogs => {
                if !self.supports_logs {
                    self.set_status(format!("Logs are not available for {}", self.resource));
                    AppCommand::None
                } else if self.logs_active {
                    AppCommand::StopLogs
                } else {
                    AppCommand::StartLogs
                }
            }
            Action::CloseView => {
                if self.view == BodyView::Logs && self.logs_active {
                    return AppCommand::StopLogs;
                }
                self.close_view();
                AppCommand::None
            }
            Action::ToggleHelp => {
                self.show_help = !self.show_help;
                AppCommand::None
            }
            Action::Down => {
                self.scroll_by(1);
                AppCommand::None
            }
            Action::Up => {
                self.scroll_by(-1);
                AppCommand::None
            }
            Action::PageDown => {
                self.scroll_by(self.page_step());
                AppCommand::None
            }
            Action::PageUp => {
                self.scroll_by(-self.page_step());
                AppCommand::None
            }
            Action::Top => {
                self.scroll = 0;
                AppCommand::None
            }
            Action::Bottom => {
                self.scroll = self.max_scroll();
                AppCommand::None
            }
        }
    }

    fn pending(&self) -> Option<(NotificationToken, bool, bool)> {
        self.notification.as_ref().map(|notification| {
            (
                notification.token,
                notification.can_push,
                notification.resource.is_deleted(),
            )
        })
    }

    fn connection_allows_sync(&self) -> bool {
        !matches!(self.connection, ConnectionStatus::Disconnected { .. })
    }

    fn close_view(&mut self) {
        self.view = BodyView::Manifest;
        self.scroll = 0;
    }

    fn page_step(&self) -> isize {
        self.view_height.saturating_sub(1).max(1) as isize
    }

    fn scroll_by(&mut self, delta: isize) {
        let max = self.max_scroll() as isize;
        let current = self.scroll as isize;
        self.scroll = (current + delta).clamp(0, max) as u16;
    }

    fn max_scroll(&self) -> u16 {
        let lines = visual_line_count(self.body_text(), self.view_width as usize);
        u16::try_from(lines.saturating_sub(self.view_height as usize)).unwrap_or(u16::MAX)
    }
}

fn visual_line_count(text: &str, width: usize) -> usize {
    let width = width.max(1);
    text.lines()
        .map(|line| line.chars().count().div_ceil(width).max(1))
        .sum::<usize>()
        .max(1)
}

fn summarize_error_line(error: &str) -> String {
    error
        .lines()
        .find(|line| !line.trim().is_empty())
        .map(|line| line.trim().to_string())
        .unwrap_or_else(|| "unknown error".to_string())
}

fn normalize_status_text(status: String) -> String {
    const MAX_STATUS_LEN: usize = 180;
    if status.chars().count() <= MAX_STATUS_LEN {
        return status;
    }

    let mut shortened = status
        .chars()
        .take(MAX_STATUS_LEN.saturating_sub(1))
        .collect::<String>();
    shortened.push('…');
    shortened
}

#[cfg(test)]
mod tests {
    use super::{App, AppCommand, BodyView, ChannelLogWriter, ChannelSurface, UiEvent};
    use crate::input::Action;
    use crate::model::ConnectionStatus;
    use crate::notification::{Notification, NotificationSurface, NotificationToken, RemoteState};
    use crate::testing::deployment;
    use std::io::Write;
    use tokio::sync::mpsc;

    fn remote_change(can_push: bool) -> Notification {
        Notification {
            token: NotificationToken::default(),
            resource: RemoteState::Present(deployment("web", "2", 5)),
            can_push,
        }
    }

    #[test]
    fn channel_surface_forwards_notifications() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let surface = ChannelSurface::new(tx);
        surface.on_notify(&remote_change(true));
        surface.on_clear();

        assert!(matches!(rx.try_recv(), Ok(UiEvent::Notify(n)) if n.can_push));
        assert!(matches!(rx.try_recv(), Ok(UiEvent::Clear)));
    }

    #[test]
    fn pull_carries_the_displayed_token() {
        let mut app = App::new("web.yaml".to_string());
        let notification = remote_change(false);
        app.set_notification(notification.clone());

        assert_eq!(app.apply_action(Action::Pull), AppCommand::Pull(notification.token));
        assert!(app.status().contains("changed on cluster"));
    }

    #[test]
    fn push_is_only_requested_when_allowed() {
        let mut app = App::new("web.yaml".to_string());
        assert_eq!(app.apply_action(Action::Push), AppCommand::None);

        app.set_notification(remote_change(false));
        assert_eq!(app.apply_action(Action::Push), AppCommand::None);
        assert!(app.status().starts_with("Push unavailable"));

        app.set_notification(remote_change(true));
        assert_eq!(app.apply_action(Action::Push), AppCommand::Push);

        app.set_connection(ConnectionStatus::Disconnected {
            reason: "timeout".to_string(),
        });
        assert_eq!(app.apply_action(Action::Push), AppCommand::None);
        assert_eq!(app.apply_action(Action::Pull), AppCommand::None);
    }

    #[test]
    fn clearing_the_notification_closes_the_diff() {
        let mut app = App::new("web.yaml".to_string());
        app.set_notification(remote_change(false));
        assert_eq!(app.apply_action(Action::ShowDiff), AppCommand::Diff);
        app.set_diff("-  replicas: 3\n+  replicas: 5\n".to_string());
        assert_eq!(app.view(), BodyView::Diff);

        app.clear_notification();
        assert_eq!(app.view(), BodyView::Manifest);
        assert!(app.notification().is_none());
    }

    #[test]
    fn logs_toggle_only_for_supported_resources() {
        let mut app = App::new("web.yaml".to_string());
        app.set_resource("Deployment shop/web", false);
        assert_eq!(app.apply_action(Action::ToggleLogs), AppCommand::None);

        app.set_resource("Pod shop/web-0", true);
        assert_eq!(app.apply_action(Action::ToggleLogs), AppCommand::StartLogs);
        app.set_logs_started();
        app.append_logs("ready\n");
        assert_eq!(app.body_text(), "ready\n");
        assert_eq!(app.apply_action(Action::CloseView), AppCommand::StopLogs);
        app.set_logs_stopped();
        assert_eq!(app.view(), BodyView::Manifest);
    }

    #[test]
    fn log_writer_forwards_chunks() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut writer = ChannelLogWriter::new(tx);
        writeln!(writer, "starting").expect("channel open");

        match rx.try_recv() {
            Ok(UiEvent::Logs(chunk)) => assert_eq!(chunk, "starting\n"),
            other => panic!("unexpected event {other:?}"),
        }
        drop(rx);
        assert!(writeln!(writer, "late").is_err());
    }

    #[test]
    fn scrolling_is_clamped_to_the_text() {
        let mut app = App::new("web.yaml".to_string());
        app.set_viewport(40, 2);
        app.set_manifest_text("a\nb\nc\nd\n".to_string());

        app.apply_action(Action::Bottom);
        assert_eq!(app.scroll(), 2);
        app.apply_action(Action::PageDown);
        assert_eq!(app.scroll(), 2);
        app.apply_action(Action::Top);
        app.apply_action(Action::Up);
        assert_eq!(app.scroll(), 0);
    }

    #[test]
    fn very_long_text_scrolls_to_the_largest_offset() {
        let mut app = App::new("web.yaml".to_string());
        app.set_viewport(40, 10);
        app.set_manifest_text("x\n".repeat(70_000));

        app.apply_action(Action::Bottom);
        assert_eq!(app.scroll(), u16::MAX);
    }
}
