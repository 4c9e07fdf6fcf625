//! Terminal User Interface (TUI) rendering and management.
//!
//! This module handles initializing the terminal in raw mode, restoring it on exit,
//! and drawing the progress and result screens using `ratatui`.

use std::io::{self, Stdout};

use crossterm::execute;
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen, SetTitle,
};
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span, Text};
use ratatui::widgets::{Block, BorderType, Borders, Gauge, Paragraph, Wrap};
use ratatui::{Frame, Terminal};

use crate::app::{App, Screen, StatusLevel};
use crate::output::{sanitize_text, strip_carriage};
use crate::progress::Stage;
use crate::record::format_decimal;

/// Type alias for the specific terminal backend used.
pub type TuiTerminal = Terminal<CrosstermBackend<Stdout>>;

/// Initializes the terminal for TUI mode.
///
/// Enables raw mode, enters the alternate screen, and creates a `ratatui` Terminal instance.
pub fn init_terminal() -> io::Result<TuiTerminal> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    Terminal::new(backend)
}

/// Restores the terminal to its original state.
pub fn restore_terminal(mut terminal: TuiTerminal) -> io::Result<()> {
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;
    Ok(())
}

/// Draws the current application state to the terminal.
pub fn draw(app: &App, terminal: &mut TuiTerminal) -> io::Result<()> {
    execute!(terminal.backend_mut(), SetTitle(window_title(app)))?;
    terminal.draw(|frame| render(frame, app))?;
    Ok(())
}

pub fn render(frame: &mut Frame, app: &App) {
    let area = frame.size();
    let mut constraints = vec![Constraint::Length(3), Constraint::Min(8)];
    if app.show_output {
        constraints.push(Constraint::Percentage(40));
    }
    constraints.push(Constraint::Length(3));
    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints(constraints)
        .split(area);

    render_gauge(frame, app, rows[0]);
    match app.screen {
        Screen::Progress => render_progress(frame, app, rows[1]),
        Screen::Result => render_result(frame, app, rows[1]),
        Screen::Failure => render_failure(frame, app, rows[1]),
        Screen::Cancelled => {
            let text = Paragraph::new("The speed test was cancelled.")
                .style(Style::default().fg(Color::DarkGray))
                .block(panel("Cancelled", Color::DarkGray));
            frame.render_widget(text, rows[1]);
        }
    }
    if app.show_output {
        render_output(frame, app, rows[2]);
    }
    render_status(frame, app, rows[rows.len() - 1]);
}

fn render_gauge(frame: &mut Frame, app: &App, area: Rect) {
    let color = stage_color(app.progress.stage);
    let gauge = Gauge::default()
        .block(panel("Speed Test", color))
        .gauge_style(Style::default().fg(color))
        .ratio(app.ratio().clamp(0.0, 1.0))
        .label(app.progress.stage.label());
    frame.render_widget(gauge, area);
}

fn render_progress(frame: &mut Frame, app: &App, area: Rect) {
    let state = &app.progress;
    let mut lines = vec![Line::from(Span::styled(
        state.stage.label(),
        Style::default().add_modifier(Modifier::BOLD),
    ))];
    lines.push(Line::from(""));
    if let Some(server) = state.server_label() {
        lines.push(reading("Server", server));
    }
    if let Some(latency) = state.latency_ms {
        lines.push(reading(
            "Ping",
            format!("{} ms", format_decimal(latency, app.decimal_comma)),
        ));
    }
    if let Some(speed) = state.live_speed_mbps {
        let label = match state.stage {
            Stage::Uploading => "Upload",
            _ => "Download",
        };
        lines.push(reading(
            label,
            format!("{} Mbps", format_decimal(speed, app.decimal_comma)),
        ));
    }
    let steps = [
        Stage::Connecting,
        Stage::MeasuringLatency,
        Stage::Downloading,
        Stage::Uploading,
    ];
    lines.push(Line::from(""));
    lines.push(Line::from(
        steps
            .iter()
            .map(|stage| step_span(*stage, state.stage))
            .collect::<Vec<_>>(),
    ));
    let body = Paragraph::new(Text::from(lines))
        .wrap(Wrap { trim: false })
        .block(panel("Progress", stage_color(state.stage)));
    frame.render_widget(body, area);
}

fn render_result(frame: &mut Frame, app: &App, area: Rect) {
    let Some(record) = &app.record else {
        return;
    };
    let comma = app.decimal_comma;
    let mut lines = vec![
        reading(
            "Download",
            format!("{} Mbps", format_decimal(record.download.mbps(), comma)),
        ),
        reading(
            "Upload",
            format!("{} Mbps", format_decimal(record.upload.mbps(), comma)),
        ),
    ];
    let ping = match record.jitter_ms {
        Some(jitter) => format!(
            "{} ms (jitter {} ms)",
            format_decimal(record.latency_ms, comma),
            format_decimal(jitter, comma)
        ),
        None => format!("{} ms", format_decimal(record.latency_ms, comma)),
    };
    lines.push(reading("Ping", ping));
    if let Some(loss) = record.packet_loss {
        lines.push(reading("Packet loss", format!("{} %", format_decimal(loss, comma))));
    }
    let server = record.server.describe();
    if !server.is_empty() {
        lines.push(reading("Server", server));
    }
    if let Some(isp) = record.isp.as_deref() {
        lines.push(reading("ISP", isp.to_string()));
    }
    if record.interface.is_some() {
        lines.push(reading("Connection", record.connection_type().to_string()));
    }
    if !record.result.url.is_empty() {
        lines.push(reading("URL", record.result.url.clone()));
    }
    if let Some(image) = record.image_url() {
        lines.push(reading("Image", image));
    }
    lines.push(Line::from(""));
    lines.push(Line::from(Span::styled(
        format!("from {}", record.provenance.label()),
        Style::default().fg(Color::DarkGray),
    )));
    let body = Paragraph::new(Text::from(lines))
        .wrap(Wrap { trim: false })
        .block(panel("Result", Color::Green));
    frame.render_widget(body, area);
}

fn render_failure(frame: &mut Frame, app: &App, area: Rect) {
    let Some((kind, message)) = &app.failure else {
        return;
    };
    let mut lines = vec![
        Line::from(Span::styled(
            kind.description(),
            Style::default().fg(Color::Red).add_modifier(Modifier::BOLD),
        )),
        Line::from(""),
    ];
    lines.extend(message.lines().map(|line| Line::from(clean(line))));
    let body = Paragraph::new(Text::from(lines))
        .wrap(Wrap { trim: false })
        .block(panel("Error occurred", Color::Red));
    frame.render_widget(body, area);
}

fn render_output(frame: &mut Frame, app: &App, area: Rect) {
    let height = area.height.saturating_sub(2) as usize;
    let lines = output_tail(&app.live_output, height)
        .into_iter()
        .map(Line::from)
        .collect::<Vec<_>>();
    let body = if lines.is_empty() {
        Paragraph::new("No output yet").style(Style::default().fg(Color::DarkGray))
    } else {
        Paragraph::new(Text::from(lines))
    };
    frame.render_widget(body.block(panel("Output", Color::DarkGray)), area);
}

fn render_status(frame: &mut Frame, app: &App, area: Rect) {
    let (text, style) = match app.status_message() {
        Some((message, StatusLevel::Warning)) => {
            (message.to_string(), Style::default().fg(Color::Yellow))
        }
        Some((message, StatusLevel::Info)) => (message.to_string(), Style::default()),
        None => (app.status_line(), Style::default().fg(Color::Gray)),
    };
    let status = Paragraph::new(text)
        .style(style)
        .block(panel("", Color::DarkGray));
    frame.render_widget(status, area);
}

fn panel(title: &str, color: Color) -> Block<'_> {
    Block::default()
        .title(title)
        .borders(Borders::ALL)
        .border_type(BorderType::Rounded)
        .border_style(Style::default().fg(color))
}

fn reading(label: &str, value: String) -> Line<'static> {
    Line::from(vec![
        Span::styled(
            format!("{:<12}", format!("{}:", label)),
            Style::default().fg(Color::Gray),
        ),
        Span::styled(value, Style::default().add_modifier(Modifier::BOLD)),
    ])
}

fn step_span(stage: Stage, current: Stage) -> Span<'static> {
    let name = match stage {
        Stage::Connecting => "connect",
        Stage::MeasuringLatency => "ping",
        Stage::Downloading => "download",
        Stage::Uploading => "upload",
        Stage::Complete | Stage::Failed => "done",
    };
    let style = if stage == current {
        Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD)
    } else if stage < current && current != Stage::Failed {
        Style::default().fg(Color::Green)
    } else {
        Style::default().fg(Color::DarkGray)
    };
    Span::styled(format!(" {} ", name), style)
}

fn stage_color(stage: Stage) -> Color {
    match stage {
        Stage::Complete => Color::Green,
        Stage::Failed => Color::Red,
        _ => Color::Cyan,
    }
}

fn window_title(app: &App) -> String {
    match app.screen {
        Screen::Progress => format!("speedrack · {}", app.progress.stage.label()),
        Screen::Result => "speedrack · result".to_string(),
        Screen::Failure => "speedrack · error".to_string(),
        Screen::Cancelled => "speedrack · cancelled".to_string(),
    }
}

fn clean(text: &str) -> String {
    sanitize_text(&strip_carriage(text), true)
}

/// Last `height` displayable lines of captured output.
fn output_tail(text: &str, height: usize) -> Vec<String> {
    let lines = text
        .lines()
        .map(clean)
        .filter(|line| !line.trim().is_empty())
        .collect::<Vec<_>>();
    let skip = lines.len().saturating_sub(height);
    lines.into_iter().skip(skip).collect()
}
