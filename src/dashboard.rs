/// dashboard.rs – ratatui live terminal dashboard for one session.
///
/// Layout (5 panels):
///  ┌─ Header ──────────────────────────────────────────────────────────┐
///  │ Session │ Tick / progress │ Cash │ P&L │ stream phase │ keys      │
///  ├─ Positions ───────────────────┬─ Market ──────────────────────────┤
///  │ holdings with SL / TP         │ quote, OHLC, validation           │
///  ├─ Orders ──────────────────────┼─ Logs ────────────────────────────┤
///  │ pending and recent orders     │ timestamped log lines             │
///  └───────────────────────────────┴───────────────────────────────────┘
use crossterm::{
    event::{DisableMouseCapture, EnableMouseCapture, Event, KeyCode, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Cell, List, ListItem, Paragraph, Row, Table},
    Frame, Terminal,
};
use std::io::{self, Stdout};

use crate::clock::SessionClock;
use crate::models::{Action, ConnectionPhase, OrderStatus, SessionState};
use crate::positions::{ExitField, Tracked};

pub type CrossTerm = Terminal<CrosstermBackend<Stdout>>;

// ---------------------------------------------------------------------------
// Setup / teardown
// ---------------------------------------------------------------------------

pub fn setup_terminal() -> anyhow::Result<CrossTerm> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = CrosstermBackend::new(stdout);
    Ok(Terminal::new(backend)?)
}

pub fn teardown_terminal(terminal: &mut CrossTerm) -> anyhow::Result<()> {
    disable_raw_mode()?;
    execute!(
        terminal.backend_mut(),
        LeaveAlternateScreen,
        DisableMouseCapture
    )?;
    terminal.show_cursor()?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Key event handling
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAction {
    Quit,
    Reconnect,
    RefreshPortfolio,
    NextSymbol,
}

pub fn handle_event(event: &Event) -> Option<KeyAction> {
    let Event::Key(k) = event else {
        return None;
    };
    match k.code {
        KeyCode::Char('q') | KeyCode::Char('Q') => Some(KeyAction::Quit),
        KeyCode::Char('c') if k.modifiers.contains(KeyModifiers::CONTROL) => Some(KeyAction::Quit),
        KeyCode::Char('r') | KeyCode::Char('R') => Some(KeyAction::Reconnect),
        KeyCode::Char('p') | KeyCode::Char('P') => Some(KeyAction::RefreshPortfolio),
        KeyCode::Char('s') | KeyCode::Char('S') => Some(KeyAction::NextSymbol),
        _ => None,
    }
}

/// The symbol after `current` in `symbols`, wrapping round. Falls back to the
/// first entry when `current` is not listed.
pub fn next_symbol(symbols: &[String], current: &str) -> Option<String> {
    let next = match symbols.iter().position(|s| s.eq_ignore_ascii_case(current)) {
        Some(i) => symbols.get((i + 1) % symbols.len()),
        None => symbols.first(),
    };
    next.filter(|s| !s.eq_ignore_ascii_case(current)).cloned()
}

// ---------------------------------------------------------------------------
// Render
// ---------------------------------------------------------------------------

pub fn render(frame: &mut Frame, state: &SessionState, clock: Option<&SessionClock>) {
    let area = frame.size();

    let outer = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(3), Constraint::Min(0)])
        .split(area);

    render_header(frame, outer[0], state, clock);

    let body = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(55), Constraint::Percentage(45)])
        .split(outer[1]);

    let left = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Percentage(55), Constraint::Percentage(45)])
        .split(body[0]);

    let right = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Percentage(45), Constraint::Percentage(55)])
        .split(body[1]);

    render_positions(frame, left[0], state);
    render_orders(frame, left[1], state);
    render_market(frame, right[0], state);
    render_logs(frame, right[1], state);
}

fn pnl_color(v: f64) -> Color {
    if v >= 0.0 {
        Color::Green
    } else {
        Color::Red
    }
}

// ---------------------------------------------------------------------------
// Header
// ---------------------------------------------------------------------------

fn render_header(frame: &mut Frame, area: Rect, state: &SessionState, clock: Option<&SessionClock>) {
    let phase = match state.phase {
        ConnectionPhase::Streaming => Span::styled("WS●", Style::default().fg(Color::Green)),
        ConnectionPhase::Connecting => Span::styled("WS◐", Style::default().fg(Color::Yellow)),
        ConnectionPhase::Disconnected => Span::styled("WS○", Style::default().fg(Color::Red)),
    };

    let progress = match clock {
        Some(c) => format!(
            "Tick {}/{} ({:.0}%)  │ ",
            state.current_tick,
            c.total_ticks(),
            c.progress(state.current_tick) * 100.0
        ),
        None => format!("Tick {}  │ ", state.current_tick),
    };

    let total_pnl = state.positions.total_pnl();
    let equity = state.cash + state.positions.total_market_value();

    let mut spans = vec![
        Span::styled(
            format!("  {}  │ ", state.session_id),
            Style::default()
                .fg(Color::Cyan)
                .add_modifier(Modifier::BOLD),
        ),
        Span::raw(progress),
        Span::raw(format!("Cash: ${:.2}  │ ", state.cash)),
        Span::raw(format!("Equity: ${:.2}  │ ", equity)),
        Span::styled(
            format!("P&L: {:+.2}  │ ", total_pnl),
            Style::default()
                .fg(pnl_color(total_pnl))
                .add_modifier(Modifier::BOLD),
        ),
        phase,
    ];
    if state.ended {
        spans.push(Span::styled(
            "  [ENDED]",
            Style::default()
                .fg(Color::Yellow)
                .add_modifier(Modifier::BOLD),
        ));
    }
    spans.push(Span::styled(
        "  [q] quit [r] reconnect [p] portfolio [s] next symbol",
        Style::default().fg(Color::DarkGray),
    ));

    let header = Paragraph::new(Line::from(spans)).block(
        Block::default()
            .borders(Borders::ALL)
            .title(" TradeSim Session "),
    );
    frame.render_widget(header, area);
}

// ---------------------------------------------------------------------------
// Positions table
// ---------------------------------------------------------------------------

/// Exit price cell; a trailing `*` marks a value the server has not confirmed yet.
fn exit_cell(value: Tracked<Option<f64>>) -> String {
    let base = value
        .value()
        .map(|p| format!("{:.2}", p))
        .unwrap_or_else(|| "—".into());
    if value.is_local() {
        format!("{base}*")
    } else {
        base
    }
}

fn render_positions(frame: &mut Frame, area: Rect, state: &SessionState) {
    let header_cells = ["Symbol", "Qty", "Avg", "Last", "SL", "TP", "P&L"]
        .iter()
        .map(|h| Cell::from(*h).style(Style::default().add_modifier(Modifier::BOLD)));
    let header = Row::new(header_cells)
        .style(Style::default().bg(Color::DarkGray))
        .height(1);

    let rows: Vec<Row> = state
        .positions
        .iter()
        .map(|tracked| {
            let pos = tracked.server();
            let pnl = if pos.pnl != 0.0 {
                pos.pnl
            } else {
                pos.unrealised_pnl()
            };
            Row::new(vec![
                Cell::from(pos.symbol.clone()),
                Cell::from(format!("{:.0}", pos.holdings)),
                Cell::from(format!("{:.2}", pos.avg_price)),
                Cell::from(format!("{:.2}", pos.current_price)),
                Cell::from(exit_cell(tracked.field(ExitField::StopLoss)))
                    .style(Style::default().fg(Color::Red)),
                Cell::from(exit_cell(tracked.field(ExitField::TakeProfit)))
                    .style(Style::default().fg(Color::Green)),
                Cell::from(format!("{:+.2}", pnl))
                    .style(Style::default().fg(pnl_color(pnl)).add_modifier(Modifier::BOLD)),
            ])
        })
        .collect();

    let table = Table::new(
        rows,
        [
            Constraint::Length(8),
            Constraint::Length(6),
            Constraint::Length(9),
            Constraint::Length(9),
            Constraint::Length(9),
            Constraint::Length(9),
            Constraint::Min(10),
        ],
    )
    .header(header)
    .block(
        Block::default()
            .borders(Borders::ALL)
            .title(format!(" Positions ({}) ", state.positions.len())),
    );

    frame.render_widget(table, area);
}

// ---------------------------------------------------------------------------
// Orders table
// ---------------------------------------------------------------------------

fn render_orders(frame: &mut Frame, area: Rect, state: &SessionState) {
    let header_cells = ["Id", "Symbol", "Side", "Type", "Qty", "Price", "Status"]
        .iter()
        .map(|h| Cell::from(*h).style(Style::default().add_modifier(Modifier::BOLD)));
    let header = Row::new(header_cells)
        .style(Style::default().bg(Color::DarkGray))
        .height(1);

    let rows: Vec<Row> = state
        .orders
        .iter()
        .take(20)
        .map(|o| {
            let status_color = match o.status {
                OrderStatus::Filled => Color::Green,
                OrderStatus::Canceled => Color::Gray,
                OrderStatus::Pending => Color::Yellow,
            };
            let side_color = match o.action {
                Action::Buy => Color::Green,
                Action::Sell => Color::Red,
            };
            Row::new(vec![
                Cell::from(o.id.chars().take(8).collect::<String>()),
                Cell::from(o.symbol.clone()),
                Cell::from(o.action.as_str()).style(Style::default().fg(side_color)),
                Cell::from(o.order_type.as_str()),
                Cell::from(format!("{:.0}", o.quantity)),
                Cell::from(format!("{:.2}", o.price)),
                Cell::from(o.status.as_str()).style(Style::default().fg(status_color)),
            ])
        })
        .collect();

    let pending = state
        .orders
        .iter()
        .filter(|o| !o.status.is_terminal())
        .count();

    let table = Table::new(
        rows,
        [
            Constraint::Length(9),
            Constraint::Length(7),
            Constraint::Length(5),
            Constraint::Length(7),
            Constraint::Length(6),
            Constraint::Length(9),
            Constraint::Min(9),
        ],
    )
    .header(header)
    .block(
        Block::default()
            .borders(Borders::ALL)
            .title(format!(" Orders ({} pending) ", pending)),
    );

    frame.render_widget(table, area);
}

// ---------------------------------------------------------------------------
// Market panel
// ---------------------------------------------------------------------------

fn render_market(frame: &mut Frame, area: Rect, state: &SessionState) {
    let dash = || "—".to_string();
    let mut lines = Vec::new();

    match &state.quote {
        Some(q) => lines.push(Line::from(vec![
            Span::styled(
                format!("{} {:.2}  ", state.symbol, q.last_price),
                Style::default().add_modifier(Modifier::BOLD),
            ),
            Span::styled(
                format!("{:+.2} ({:+.2}%)", q.abs_change, q.pct_change),
                Style::default().fg(pnl_color(q.abs_change)),
            ),
        ])),
        None => lines.push(Line::from(format!("{} —", state.symbol))),
    }

    if let Some(bar) = &state.ohlc {
        lines.push(Line::from(format!(
            "O {:.2}  H {:.2}  L {:.2}  C {:.2}  V {:.0}",
            bar.open, bar.high, bar.low, bar.close, bar.volume
        )));
    }

    if let Some(bar) = &state.live_bar {
        lines.push(Line::from(format!(
            "Live {:.2} @ tick {}",
            bar.close,
            bar.tick.map(|t| t.to_string()).unwrap_or_else(dash)
        )));
    }

    if let Some(ind) = &state.indicators {
        let pick = |k: &str| {
            ind.get(k)
                .and_then(crate::models::value_as_f64)
                .map(|v| format!("{:.2}", v))
                .unwrap_or_else(dash)
        };
        lines.push(Line::from(format!(
            "P/E {}  RSI {}  MACD {}",
            pick("pe_ratio"),
            pick("rsi"),
            pick("macd")
        )));
    }

    let v = &state.validation;
    let validation = if v.valid {
        Span::styled(
            format!(
                "Order OK  max buy {:.0}  max sell {:.0}",
                v.max_affordable_quantity, v.max_sellable_quantity
            ),
            Style::default().fg(Color::Green),
        )
    } else {
        Span::styled(
            format!("Order blocked: {}", v.error.clone().unwrap_or_else(dash)),
            Style::default().fg(Color::Red),
        )
    };
    lines.push(Line::from(validation));

    if let Some(err) = &state.last_error {
        lines.push(Line::from(Span::styled(
            format!("Last error: {err}"),
            Style::default().fg(Color::Red),
        )));
    }

    let panel = Paragraph::new(lines).block(
        Block::default()
            .borders(Borders::ALL)
            .title(format!(" Market {} ", state.symbol)),
    );
    frame.render_widget(panel, area);
}

// ---------------------------------------------------------------------------
// Logs panel
// ---------------------------------------------------------------------------

fn render_logs(frame: &mut Frame, area: Rect, state: &SessionState) {
    let items: Vec<ListItem> = state
        .logs
        .iter()
        .take(area.height as usize)
        .map(|line| {
            let color = if line.contains("failed") || line.contains("rejected") {
                Color::Red
            } else if line.contains("disconnected") || line.contains("ended") {
                Color::Yellow
            } else if line.contains("BUY") || line.contains("SELL") || line.contains("connected")
            {
                Color::Green
            } else {
                Color::Gray
            };
            ListItem::new(Line::from(Span::styled(
                line.clone(),
                Style::default().fg(color),
            )))
        })
        .collect();

    let list = List::new(items)
        .block(Block::default().borders(Borders::ALL).title(" Logs "))
        .style(Style::default().fg(Color::White));

    frame.render_widget(list, area);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossterm::event::{KeyEvent, KeyEventKind, KeyEventState};

    fn key(code: KeyCode, modifiers: KeyModifiers) -> Event {
        Event::Key(KeyEvent {
            code,
            modifiers,
            kind: KeyEventKind::Press,
            state: KeyEventState::NONE,
        })
    }

    #[test]
    fn keys_map_to_actions() {
        assert_eq!(
            handle_event(&key(KeyCode::Char('q'), KeyModifiers::NONE)),
            Some(KeyAction::Quit)
        );
        assert_eq!(
            handle_event(&key(KeyCode::Char('c'), KeyModifiers::CONTROL)),
            Some(KeyAction::Quit)
        );
        assert_eq!(
            handle_event(&key(KeyCode::Char('r'), KeyModifiers::NONE)),
            Some(KeyAction::Reconnect)
        );
        assert_eq!(
            handle_event(&key(KeyCode::Char('p'), KeyModifiers::NONE)),
            Some(KeyAction::RefreshPortfolio)
        );
        assert_eq!(
            handle_event(&key(KeyCode::Char('s'), KeyModifiers::NONE)),
            Some(KeyAction::NextSymbol)
        );
        assert_eq!(handle_event(&key(KeyCode::Char('x'), KeyModifiers::NONE)), None);
    }

    #[test]
    fn next_symbol_cycles_through_catalog() {
        let symbols: Vec<String> = ["AAPL", "MSFT", "TSLA"].iter().map(|s| s.to_string()).collect();
        assert_eq!(next_symbol(&symbols, "MSFT").as_deref(), Some("TSLA"));
        assert_eq!(next_symbol(&symbols, "tsla").as_deref(), Some("AAPL"));
        assert_eq!(next_symbol(&symbols, "NVDA").as_deref(), Some("AAPL"));
        assert_eq!(next_symbol(&symbols[..1], "AAPL"), None);
        assert_eq!(next_symbol(&[], "AAPL"), None);
    }

    #[test]
    fn pending_exit_values_are_starred() {
        assert_eq!(exit_cell(Tracked::Local(Some(350.0))), "350.00*");
        assert_eq!(exit_cell(Tracked::Confirmed(Some(350.0))), "350.00");
        assert_eq!(exit_cell(Tracked::Confirmed(None)), "—");
    }
}
