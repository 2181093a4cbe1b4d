use ratatui::Frame;
use ratatui::layout::{Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span, Text};
use ratatui::widgets::{Block, Borders, Clear, Paragraph, Wrap};

use crate::app::{App, BodyView};
use crate::model::ConnectionStatus;
use crate::notification::Notification;

const BG: Color = Color::Rgb(9, 15, 25);
const PANEL: Color = Color::Rgb(16, 27, 44);
const ACCENT: Color = Color::Rgb(52, 211, 153);
const MUTED: Color = Color::Rgb(140, 156, 178);
const WARN: Color = Color::Rgb(251, 191, 36);
const ERROR: Color = Color::Rgb(248, 113, 113);
const PL_A: Color = Color::Rgb(17, 94, 89);
const PL_B: Color = Color::Rgb(30, 64, 175);
const PL_C: Color = Color::Rgb(55, 48, 163);
const PL_D: Color = Color::Rgb(82, 24, 124);

pub fn render(frame: &mut Frame, app: &mut App) {
    let notification_height = if app.notification().is_some() { 1 } else { 0 };
    let root = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(1),
            Constraint::Min(4),
            Constraint::Length(notification_height),
            Constraint::Length(1),
        ])
        .split(frame.area());

    render_header(frame, root[0], app);
    render_body(frame, root[1], app);
    if let Some(notification) = app.notification() {
        render_notification(frame, root[2], notification, app.connection());
    }
    render_footer(frame, root[3], app);

    if app.show_help() {
        render_help_modal(frame, app);
    }
}

fn render_header(frame: &mut Frame, area: Rect, app: &App) {
    let mut spans = Vec::new();
    push_powerline_segment(&mut spans, " 󱃾 kubesync ", Color::White, PL_A, PL_B);
    push_powerline_segment(
        &mut spans,
        format!(" 󰠳 {} ", compact_text(app.context(), 24)),
        Color::White,
        PL_B,
        PL_C,
    );
    push_powerline_segment(
        &mut spans,
        format!(" 󰅩 {} ", compact_text(app.namespace(), 20)),
        Color::White,
        PL_C,
        PL_D,
    );
    let (connection_bg, connection_fg) = connection_colors(app.connection());
    push_powerline_segment(
        &mut spans,
        format!(" {} ", compact_text(app.resource(), 40)),
        Color::White,
        PL_D,
        connection_bg,
    );
    push_powerline_segment(
        &mut spans,
        format!(" {} ", app.connection().label()),
        connection_fg,
        connection_bg,
        BG,
    );

    let line = Line::from(spans);
    let line = if spans_width(&line.spans) > area.width as usize {
        Line::from(vec![Span::styled(
            compact_text(
                &format!("kubesync {} {}", app.context(), app.resource()),
                area.width as usize,
            ),
            Style::default().fg(Color::White),
        )])
    } else {
        line
    };
    frame.render_widget(
        Paragraph::new(line).style(Style::default().bg(BG).fg(Color::White)),
        area,
    );
}

fn connection_colors(connection: &ConnectionStatus) -> (Color, Color) {
    match connection {
        ConnectionStatus::Connected => (ACCENT, Color::Black),
        ConnectionStatus::Connecting => (WARN, Color::Black),
        ConnectionStatus::Disconnected { .. } => (ERROR, Color::Black),
    }
}

fn render_body(frame: &mut Frame, area: Rect, app: &mut App) {
    let (width, height) = body_viewport(area);
    app.set_viewport(width, height);

    let text = match app.view() {
        BodyView::Manifest => highlight_yaml_text(app.body_text()),
        BodyView::Diff => highlight_diff_text(app.body_text()),
        BodyView::Logs => Text::from(app.body_text().to_string()),
    };
    let border = match app.view() {
        BodyView::Manifest => MUTED,
        BodyView::Diff => WARN,
        BodyView::Logs => ACCENT,
    };
    let block = Block::default()
        .title(app.body_title())
        .borders(Borders::ALL)
        .border_style(Style::default().fg(border))
        .style(Style::default().bg(PANEL));
    let paragraph = Paragraph::new(text)
        .block(block)
        .style(Style::default().fg(Color::White))
        .wrap(Wrap { trim: false })
        .scroll((app.scroll(), 0));

    frame.render_widget(paragraph, area);
}

fn render_notification(
    frame: &mut Frame,
    area: Rect,
    notification: &Notification,
    connection: &ConnectionStatus,
) {
    let bg = if notification.resource.is_deleted() {
        ERROR
    } else {
        WARN
    };
    let mut spans = Vec::new();
    push_powerline_segment(
        &mut spans,
        format!(" 󰂚 {} ", notification.message()),
        Color::Black,
        bg,
        BG,
    );
    let reachable = !matches!(connection, ConnectionStatus::Disconnected { .. });
    spans.push(Span::raw(" "));
    spans.extend(notification_key_spans(notification, reachable));

    frame.render_widget(
        Paragraph::new(Line::from(spans)).style(Style::default().bg(BG)),
        area,
    );
}

fn notification_key_spans(notification: &Notification, reachable: bool) -> Vec<Span<'static>> {
    let mut keys = vec![("p", "pull")];
    if notification.can_push && !notification.resource.is_deleted() {
        keys.push(("u", "push"));
    }
    keys.extend([("d", "diff"), ("i", "ignore")]);

    let mut spans = Vec::new();
    for (key, label) in keys {
        let enabled = reachable || !matches!(key, "p" | "u");
        let key_style = if enabled {
            Style::default().fg(ACCENT).add_modifier(Modifier::BOLD)
        } else {
            Style::default().fg(MUTED)
        };
        spans.push(Span::styled(format!("[{key}]"), key_style));
        spans.push(Span::styled(format!(" {label}  "), Style::default().fg(MUTED)));
    }
    spans
}

fn render_footer(frame: &mut Frame, area: Rect, app: &App) {
    let status_text = app.status();
    let status_bg = if footer_status_icon(status_text) == "󰅚" {
        ERROR
    } else {
        PL_B
    };
    let mut spans = Vec::new();
    push_powerline_segment(
        &mut spans,
        format!(" {} ", app.status_at().format("%H:%M:%S")),
        Color::White,
        PL_A,
        status_bg,
    );
    let status_width_hint = area.width.saturating_sub(24).min(140) as usize;
    push_powerline_segment(
        &mut spans,
        format!(
            " {} {} ",
            footer_status_icon(status_text),
            compact_text(status_text, status_width_hint.max(24))
        ),
        Color::White,
        status_bg,
        BG,
    );
    if app.logs_active() && app.view() != BodyView::Logs {
        spans.push(Span::styled(" 󰍩 logs", Style::default().fg(ACCENT)));
    }
    spans.push(Span::styled("  ? help", Style::default().fg(MUTED)));

    frame.render_widget(
        Paragraph::new(Line::from(spans)).style(Style::default().bg(BG)),
        area,
    );
}

fn footer_status_icon(status_text: &str) -> &'static str {
    let status = status_text.to_ascii_lowercase();
    let has_failure = [
        "failed",
        "error",
        "timed out",
        "timeout",
        "unreachable",
        "refused",
        "forbidden",
        "conflict",
        "rejected",
        "lost",
    ]
    .iter()
    .any(|needle| status.contains(needle));
    if has_failure { "󰅚" } else { "󰄬" }
}

fn highlight_diff_text(input: &str) -> Text<'static> {
    Text::from(input.lines().map(highlight_diff_line).collect::<Vec<_>>())
}

fn highlight_diff_line(line: &str) -> Line<'static> {
    let style = if line.starts_with("+++") || line.starts_with("---") {
        Style::default().fg(Color::White).add_modifier(Modifier::BOLD)
    } else if line.starts_with("@@") {
        Style::default().fg(Color::Rgb(103, 232, 249))
    } else if line.starts_with('+') {
        Style::default().fg(ACCENT)
    } else if line.starts_with('-') {
        Style::default().fg(ERROR)
    } else {
        Style::default().fg(MUTED)
    };
    Line::from(Span::styled(line.to_string(), style))
}

fn highlight_yaml_text(input: &str) -> Text<'static> {
    let lines = input
        .lines()
        .map(highlight_yaml_line)
        .collect::<Vec<Line<'static>>>();
    Text::from(lines)
}

fn highlight_yaml_line(line: &str) -> Line<'static> {
    let indent_len = line
        .as_bytes()
        .iter()
        .take_while(|byte| **byte == b' ' || **byte == b'\t')
        .count();
    let indent = &line[..indent_len];
    let trimmed = &line[indent_len..];

    let mut spans = vec![Span::raw(indent.to_string())];
    if trimmed.is_empty() {
        return Line::from(spans);
    }

    if let Some(comment) = trimmed.strip_prefix('#') {
        spans.push(Span::styled(
            format!("#{comment}"),
            Style::default().fg(MUTED),
        ));
        return Line::from(spans);
    }

    if let Some(rest) = trimmed.strip_prefix("- ") {
        spans.push(Span::styled("- ", Style::default().fg(ACCENT)));
        spans.extend(highlight_yaml_content(rest));
        return Line::from(spans);
    }

    spans.extend(highlight_yaml_content(trimmed));
    Line::from(spans)
}

fn highlight_yaml_content(content: &str) -> Vec<Span<'static>> {
    let Some((key, value)) = split_yaml_key_value(content) else {
        return vec![Span::styled(
            content.to_string(),
            Style::default().fg(Color::White),
        )];
    };

    let mut spans = vec![
        Span::styled(
            key.to_string(),
            Style::default().fg(Color::Rgb(103, 232, 249)),
        ),
        Span::styled(":", Style::default().fg(MUTED)),
    ];
    if !value.trim().is_empty() {
        spans.push(Span::raw(" "));
        spans.push(Span::styled(
            value.trim_start().to_string(),
            Style::default().fg(yaml_value_color(value.trim())),
        ));
    }
    spans
}

fn split_yaml_key_value(content: &str) -> Option<(&str, &str)> {
    let (key, value) = content.split_once(':')?;
    let key = key.trim_end();
    if key.is_empty() || key.contains(' ') {
        return None;
    }
    Some((key, value))
}

fn yaml_value_color(value: &str) -> Color {
    if value.starts_with('"') || value.starts_with('\'') {
        Color::Rgb(125, 211, 252)
    } else if matches!(value, "true" | "false" | "null" | "~") {
        WARN
    } else if value.parse::<f64>().is_ok() {
        Color::Rgb(251, 146, 60)
    } else if value.starts_with('{') || value.starts_with('[') {
        MUTED
    } else {
        Color::Rgb(147, 197, 253)
    }
}

fn push_powerline_segment(
    spans: &mut Vec<Span<'static>>,
    content: impl Into<String>,
    fg: Color,
    bg: Color,
    next_bg: Color,
) {
    spans.push(Span::styled(
        content.into(),
        Style::default().fg(fg).bg(bg).add_modifier(Modifier::BOLD),
    ));
    spans.push(Span::styled("", Style::default().fg(bg).bg(next_bg)));
}

fn spans_width(spans: &[Span<'_>]) -> usize {
    spans.iter().map(|span| span.content.chars().count()).sum()
}

fn render_help_modal(frame: &mut Frame, app: &App) {
    let area = centered_rect(70, 60, frame.area());
    frame.render_widget(Clear, area);

    let lines = vec![
        Line::from(format!(
            "kubesync help  context:{}  namespace:{}",
            app.context(),
            app.namespace()
        )),
        Line::from(format!("Editing {} as {}", app.resource(), app.manifest_path())),
        Line::from(""),
        Line::from("Edit the manifest in any editor; saved changes are picked up automatically."),
        Line::from(""),
        Line::from("When the cluster copy changes:"),
        Line::from("  p  pull the cluster version into the manifest (recreates a deleted resource)"),
        Line::from("  u  push local edits over the cluster version (only when both sides changed)"),
        Line::from("  d  show a diff from local to cluster"),
        Line::from("  i  ignore this change until the next one"),
        Line::from(""),
        Line::from("  l  follow pod logs       Esc  close diff or logs"),
        Line::from("  j/k  scroll  g/G  top/bottom  Ctrl+d/Ctrl+u  page"),
        Line::from("  q  quit                 ?  toggle this help"),
    ];

    let modal = Paragraph::new(lines)
        .wrap(Wrap { trim: false })
        .block(
            Block::default()
                .title("Help")
                .borders(Borders::ALL)
                .border_style(Style::default().fg(ACCENT))
                .style(Style::default().bg(PANEL)),
        )
        .style(Style::default().fg(Color::White));

    frame.render_widget(modal, area);
}

fn body_viewport(area: Rect) -> (u16, u16) {
    let width = area.width.saturating_sub(2).max(1);
    let height = area.height.saturating_sub(2).max(1);
    (width, height)
}

fn compact_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }

    if max_chars <= 1 {
        return "…".to_string();
    }

    let mut out = value
        .chars()
        .take(max_chars.saturating_sub(1))
        .collect::<String>();
    out.push('…');
    out
}

fn centered_rect(percent_x: u16, percent_y: u16, area: Rect) -> Rect {
    let popup_layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage((100 - percent_y) / 2),
            Constraint::Percentage(percent_y),
            Constraint::Percentage((100 - percent_y) / 2),
        ])
        .split(area);

    Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100 - percent_x) / 2),
            Constraint::Percentage(percent_x),
            Constraint::Percentage((100 - percent_x) / 2),
        ])
        .split(popup_layout[1])[1]
}

#[cfg(test)]
mod tests {
    use super::{compact_text, highlight_diff_line, notification_key_spans, render, ACCENT, ERROR};
    use crate::app::App;
    use crate::notification::{Notification, NotificationToken, RemoteState};
    use crate::testing::deployment;
    use ratatui::Terminal;
    use ratatui::backend::TestBackend;

    fn keys(notification: &Notification, reachable: bool) -> String {
        notification_key_spans(notification, reachable)
            .iter()
            .map(|span| span.content.to_string())
            .collect()
    }

    #[test]
    fn push_key_is_offered_only_when_allowed() {
        let mut notification = Notification {
            token: NotificationToken::default(),
            resource: RemoteState::Present(deployment("web", "2", 5)),
            can_push: false,
        };
        assert!(!keys(&notification, true).contains("[u]"));

        notification.can_push = true;
        assert!(keys(&notification, true).contains("[u] push"));

        notification.resource = RemoteState::Deleted(deployment("web", "2", 5));
        assert!(!keys(&notification, true).contains("[u]"));
    }

    #[test]
    fn diff_lines_are_colored_by_side() {
        assert_eq!(highlight_diff_line("+  replicas: 5").spans[0].style.fg, Some(ACCENT));
        assert_eq!(highlight_diff_line("-  replicas: 3").spans[0].style.fg, Some(ERROR));
        assert_eq!(compact_text("kubernetes", 5), "kube…");
    }

    #[test]
    fn notification_bar_is_drawn_below_the_manifest() {
        let mut app = App::new("web.yaml".to_string());
        app.set_manifest_text("kind: Deployment\n".to_string());
        app.set_notification(Notification {
            token: NotificationToken::default(),
            resource: RemoteState::Present(deployment("web", "2", 5)),
            can_push: false,
        });
        let mut terminal = Terminal::new(TestBackend::new(100, 12)).expect("test backend");

        terminal
            .draw(|frame| render(frame, &mut app))
            .expect("frame renders");

        let buffer = terminal.backend().buffer().clone();
        let row = (0..buffer.area.width)
            .map(|x| buffer[(x, 10)].symbol().to_string())
            .collect::<String>();
        assert!(row.contains("Deployment 'web' changed on cluster. Pull?"));
        assert!(row.contains("[p] pull"));
    }
}
