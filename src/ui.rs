//! Terminal UI for the flasher.
//!
//! One screen with the connect, model, board, flash, logging and download
//! controls, the status line and the serial log. Long operations keep the
//! screen redrawing from the session's shared handles while they run.

use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Gauge, List, ListItem, Paragraph},
    Frame, Terminal,
};

use crate::catalog::{self, DeviceModel};
use crate::device::Connector;
use crate::firmware::FirmwareSource;
use crate::serial::{self, PortEntry};
use crate::session::{Controls, Session, SessionHandles, SessionState};

const REDRAW: Duration = Duration::from_millis(100);

type Term = Terminal<CrosstermBackend<io::Stdout>>;

/// What the user asked for with a key press.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    ToggleConnection,
    CyclePort,
    CycleModel,
    CycleBoard,
    Flash,
    ToggleLogging,
    Download,
    Quit,
}

fn action_for(key: KeyEvent) -> Option<Action> {
    if key.modifiers.contains(KeyModifiers::CONTROL) {
        return matches!(key.code, KeyCode::Char('c') | KeyCode::Char('q')).then_some(Action::Quit);
    }
    match key.code {
        KeyCode::Char('c') => Some(Action::ToggleConnection),
        KeyCode::Char('p') => Some(Action::CyclePort),
        KeyCode::Char('m') => Some(Action::CycleModel),
        KeyCode::Char('b') => Some(Action::CycleBoard),
        KeyCode::Char('f') => Some(Action::Flash),
        KeyCode::Char('l') => Some(Action::ToggleLogging),
        KeyCode::Char('d') => Some(Action::Download),
        KeyCode::Char('q') | KeyCode::Esc => Some(Action::Quit),
        _ => None,
    }
}

/// Screen state that is not part of the session.
struct App {
    handles: SessionHandles,
    /// Session flags as of the last idle moment.
    state: SessionState,
    device: Option<String>,
    model: Option<DeviceModel>,
    board: Option<String>,
    port_hint: Option<String>,
    ports: Vec<PortEntry>,
    export_dir: PathBuf,
    should_quit: bool,
}

impl App {
    fn sync<C: Connector, F: FirmwareSource>(&mut self, session: &Session<C, F>) {
        self.state = session.state();
        self.device = session.connection().map(|c| c.description().to_string());
        self.model = session.selection().model();
        self.board = session.selection().board_version().map(str::to_string);
        self.port_hint = session.endpoint_hint().map(str::to_string);
    }

    /// Flags including whatever is in flight right now.
    fn live_state(&self) -> SessionState {
        self.handles.overlay(self.state)
    }
}

/// Run the terminal UI until the user quits.
pub async fn run<C: Connector, F: FirmwareSource>(
    mut session: Session<C, F>,
    export_dir: PathBuf,
) -> Result<()> {
    let mut app = App {
        handles: session.handles(),
        state: SessionState::default(),
        device: None,
        model: None,
        board: None,
        port_hint: None,
        ports: serial::list_ports().unwrap_or_default(),
        export_dir,
        should_quit: false,
    };
    app.sync(&session);

    // Set up terminal
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let result = run_ui_loop(&mut terminal, &mut session, &mut app).await;

    // Release the device before giving the terminal back.
    if let Err(e) = session.disconnect().await {
        tracing::warn!("Disconnect on exit failed: {e}");
    }

    // Clean up
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    result
}

async fn run_ui_loop<C: Connector, F: FirmwareSource>(
    terminal: &mut Term,
    session: &mut Session<C, F>,
    app: &mut App,
) -> Result<()> {
    loop {
        app.sync(session);
        terminal.draw(|f| draw_ui(f, app, app.live_state()))?;

        if app.should_quit {
            return Ok(());
        }

        if !event::poll(REDRAW)? {
            continue;
        }
        let Event::Key(key) = event::read()? else {
            continue;
        };
        if key.kind != KeyEventKind::Press {
            continue;
        }
        let Some(action) = action_for(key) else {
            continue;
        };
        handle(action, terminal, session, app).await?;
    }
}

async fn handle<C: Connector, F: FirmwareSource>(
    action: Action,
    terminal: &mut Term,
    session: &mut Session<C, F>,
    app: &mut App,
) -> Result<()> {
    let controls = Controls::for_state(&session.state());

    // Failures are already on the status line.
    match action {
        Action::Quit => app.should_quit = true,
        Action::ToggleConnection if controls.connect => {
            if session.state().connected {
                let _ = while_drawing(terminal, app, session.disconnect()).await?;
            } else {
                let _ = while_drawing(terminal, app, session.connect()).await?;
            }
        }
        Action::CyclePort if !session.state().connected => {
            app.ports = serial::list_ports().unwrap_or_default();
            let next = next_port(&app.ports, session.endpoint_hint());
            session.set_endpoint_hint(next);
        }
        Action::CycleModel if controls.model_picker => {
            if let Some(next) = cycle(&DeviceModel::ALL, session.selection().model()) {
                session.select_model(next);
            }
        }
        Action::CycleBoard if controls.board_picker => {
            let boards = session
                .selection()
                .model()
                .map(catalog::board_versions)
                .unwrap_or_default();
            let current = session
                .selection()
                .board_version()
                .and_then(|b| boards.iter().copied().find(|x| *x == b));
            if let Some(next) = cycle(&boards, current) {
                let _ = session.select_board_version(next);
            }
        }
        Action::Flash if controls.flash => {
            let _ = while_drawing(terminal, app, session.start_flashing()).await?;
        }
        Action::ToggleLogging if controls.logging => {
            if session.is_logging() {
                while_drawing(terminal, app, session.stop_logging()).await?;
            } else {
                let _ = session.start_logging();
            }
        }
        Action::Download if controls.download => {
            let _ = session.export_logs(&app.export_dir);
        }
        _ => tracing::debug!("{action:?} is not available right now"),
    }
    Ok(())
}

/// Drive `op` to completion, redrawing from the shared handles meanwhile.
/// Key presses during the operation are discarded.
async fn while_drawing<T>(
    terminal: &mut Term,
    app: &App,
    op: impl Future<Output = T>,
) -> Result<T> {
    tokio::pin!(op);
    let mut tick = tokio::time::interval(REDRAW);
    loop {
        tokio::select! {
            out = &mut op => return Ok(out),
            _ = tick.tick() => {
                terminal.draw(|f| draw_ui(f, app, app.live_state()))?;
                while event::poll(Duration::ZERO)? {
                    let _ = event::read()?;
                }
            }
        }
    }
}

/// The item after `current`, wrapping; the first one when nothing is chosen.
fn cycle<T: Copy + PartialEq>(items: &[T], current: Option<T>) -> Option<T> {
    let next = current
        .and_then(|c| items.iter().position(|i| *i == c))
        .map(|i| (i + 1) % items.len())
        .unwrap_or(0);
    items.get(next).copied()
}

/// Next port name to prefer; `None` (auto-select) after the last one.
fn next_port(ports: &[PortEntry], current: Option<&str>) -> Option<String> {
    let names: Vec<&str> = ports.iter().map(|p| p.name.as_str()).collect();
    match current.and_then(|c| names.iter().position(|n| *n == c)) {
        Some(i) => names.get(i + 1).map(|n| n.to_string()),
        None => names.first().map(|n| n.to_string()),
    }
}

fn draw_ui(f: &mut Frame, app: &App, state: SessionState) {
    let controls = Controls::for_state(&state);

    let main_chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3), // Header
            Constraint::Length(3), // Device selection
            Constraint::Length(3), // Controls
            Constraint::Length(3), // Status + progress
            Constraint::Min(5),    // Serial log
        ])
        .split(f.size());

    draw_header(f, app, state, main_chunks[0]);
    draw_selection(f, app, controls, main_chunks[1]);
    draw_controls(f, state, controls, main_chunks[2]);
    draw_status(f, app, state, main_chunks[3]);
    draw_log(f, app, state, main_chunks[4]);
}

fn draw_header(f: &mut Frame, app: &App, state: SessionState, area: Rect) {
    let device = match (&app.device, state.connecting) {
        (_, true) => "connecting...".to_string(),
        (Some(d), false) => d.clone(),
        (None, false) => "not connected".to_string(),
    };
    let header = Paragraph::new(format!(" Bitaxe Web Flasher | {device} "))
        .style(Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD))
        .block(Block::default().borders(Borders::ALL));
    f.render_widget(header, area);
}

fn draw_selection(f: &mut Frame, app: &App, controls: Controls, area: Rect) {
    let value = |v: Option<&str>| v.unwrap_or("-").to_string();
    let port = app
        .port_hint
        .clone()
        .unwrap_or_else(|| format!("auto ({} found)", app.ports.len()));

    let mut spans = vec![
        Span::styled("Port: ", Style::default().fg(Color::DarkGray)),
        Span::raw(port),
        Span::raw("   "),
        Span::styled("Model: ", Style::default().fg(Color::DarkGray)),
        Span::raw(value(app.model.map(|m| m.display_name()))),
    ];
    if controls.board_picker_visible {
        spans.push(Span::raw("   "));
        spans.push(Span::styled("Board: ", Style::default().fg(Color::DarkGray)));
        spans.push(Span::raw(value(app.board.as_deref())));
    }

    let selection = Paragraph::new(Line::from(spans))
        .block(Block::default().title(" Device ").borders(Borders::ALL));
    f.render_widget(selection, area);
}

fn draw_controls(f: &mut Frame, state: SessionState, controls: Controls, area: Rect) {
    let key = |k: &str, label: &str, enabled: bool| {
        let style = if enabled {
            Style::default().fg(Color::Yellow)
        } else {
            Style::default().fg(Color::DarkGray)
        };
        vec![
            Span::styled(format!("[{k}] "), style.add_modifier(Modifier::BOLD)),
            Span::styled(format!("{label}  "), style),
        ]
    };

    let connect_label = if state.connected { "Disconnect" } else { "Connect" };
    let logging_label = if state.logging {
        "Stop Logging"
    } else {
        "Start Logging"
    };

    let mut spans = Vec::new();
    spans.extend(key("c", connect_label, controls.connect));
    spans.extend(key("p", "Port", controls.connect && !state.connected));
    spans.extend(key("m", "Model", controls.model_picker));
    spans.extend(key("b", "Board", controls.board_picker));
    spans.extend(key("f", "Start Flashing", controls.flash));
    spans.extend(key("l", logging_label, controls.logging));
    spans.extend(key("d", "Download Logs", controls.download));
    spans.extend(key("q", "Quit", true));

    let bar = Paragraph::new(Line::from(spans)).block(Block::default().borders(Borders::ALL));
    f.render_widget(bar, area);
}

fn draw_status(f: &mut Frame, app: &App, state: SessionState, area: Rect) {
    let text = app.handles.status.text();

    if state.flashing {
        if let Some(p) = app.handles.status.progress() {
            let gauge = Gauge::default()
                .block(Block::default().title(" Status ").borders(Borders::ALL))
                .gauge_style(Style::default().fg(Color::Green))
                .percent(u16::from(p.percent))
                .label(text);
            f.render_widget(gauge, area);
            return;
        }
    }

    let lower = text.to_lowercase();
    let color = if lower.contains("failed") || lower.contains("error") {
        Color::Red
    } else if lower.contains("success") {
        Color::Green
    } else {
        Color::White
    };
    let status = Paragraph::new(text)
        .style(Style::default().fg(color))
        .block(Block::default().title(" Status ").borders(Borders::ALL));
    f.render_widget(status, area);
}

fn draw_log(f: &mut Frame, app: &App, state: SessionState, area: Rect) {
    let height = area.height.saturating_sub(2) as usize;
    let lines: Vec<ListItem> = app
        .handles
        .sink
        .tail(height)
        .into_iter()
        .map(|l| ListItem::new(Line::from(l)))
        .collect();

    let title = if state.logging {
        " Serial Log (live) "
    } else {
        " Serial Log "
    };
    let log = List::new(lines).block(Block::default().title(title).borders(Borders::ALL));
    f.render_widget(log, area);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn port(name: &str) -> PortEntry {
        PortEntry {
            name: name.to_string(),
            usb: None,
            product: None,
            manufacturer: None,
        }
    }

    #[test]
    fn test_cycle_wraps() {
        assert_eq!(cycle(&DeviceModel::ALL, None), Some(DeviceModel::Max));
        assert_eq!(
            cycle(&DeviceModel::ALL, Some(DeviceModel::Max)),
            Some(DeviceModel::Ultra)
        );
        assert_eq!(
            cycle(&DeviceModel::ALL, Some(DeviceModel::UltraHex)),
            Some(DeviceModel::Max)
        );
        assert_eq!(cycle(&["601"], Some("601")), Some("601"));
        assert_eq!(cycle::<&str>(&[], None), None);
    }

    #[test]
    fn test_next_port_returns_to_auto() {
        let ports = [port("/dev/ttyACM0"), port("/dev/ttyUSB0")];
        assert_eq!(next_port(&ports, None).as_deref(), Some("/dev/ttyACM0"));
        assert_eq!(
            next_port(&ports, Some("/dev/ttyACM0")).as_deref(),
            Some("/dev/ttyUSB0")
        );
        assert_eq!(next_port(&ports, Some("/dev/ttyUSB0")), None);
        assert_eq!(next_port(&[], None), None);
    }

    #[test]
    fn test_key_bindings() {
        let press = |code| KeyEvent::new(code, KeyModifiers::NONE);
        assert_eq!(action_for(press(KeyCode::Char('f'))), Some(Action::Flash));
        assert_eq!(
            action_for(press(KeyCode::Char('c'))),
            Some(Action::ToggleConnection)
        );
        assert_eq!(
            action_for(KeyEvent::new(KeyCode::Char('c'), KeyModifiers::CONTROL)),
            Some(Action::Quit)
        );
        assert_eq!(action_for(press(KeyCode::Char('x'))), None);
    }
}
