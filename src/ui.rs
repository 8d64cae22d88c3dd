use greenledger::market::{MarketCategory, MarketPrice, MarketSimulator};
use anyhow::Result;
use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Cell, Paragraph, Row, Sparkline, Table, TableState},
    Frame, Terminal,
};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::time::{Duration, Instant};

/// Points of history kept per market for the sparkline.
const HISTORY_LEN: usize = 120;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum View {
    All,
    Compliance,
    Voluntary,
}

impl View {
    pub fn next(&self) -> Self {
        match self {
            View::All => View::Compliance,
            View::Compliance => View::Voluntary,
            View::Voluntary => View::All,
        }
    }

    pub fn title(&self) -> &str {
        match self {
            View::All => "All Markets",
            View::Compliance => "Compliance",
            View::Voluntary => "Voluntary",
        }
    }

    fn category(&self) -> Option<MarketCategory> {
        match self {
            View::All => None,
            View::Compliance => Some(MarketCategory::Compliance),
            View::Voluntary => Some(MarketCategory::Voluntary),
        }
    }
}

pub struct App {
    pub simulator: MarketSimulator,
    pub prices: Vec<MarketPrice>,
    pub history: HashMap<String, VecDeque<f64>>,
    pub state: TableState,
    pub view: View,
    pub paused: bool,
    pub tick_rate: Duration,
}

impl App {
    pub fn new(simulator: MarketSimulator, tick_rate: Duration) -> Self {
        let mut state = TableState::default();
        state.select(Some(0));

        let mut app = Self {
            prices: Vec::new(),
            simulator,
            history: HashMap::new(),
            state,
            view: View::All,
            paused: false,
            tick_rate,
        };
        let initial = app.simulator.snapshot();
        app.record(initial);
        app
    }

    fn record(&mut self, prices: Vec<MarketPrice>) {
        for p in &prices {
            let points = self.history.entry(p.market.clone()).or_default();
            if points.len() == HISTORY_LEN {
                points.pop_front();
            }
            points.push_back(p.price);
        }
        self.prices = prices;
    }

    pub fn on_tick(&mut self) {
        if !self.paused {
            let prices = self.simulator.tick();
            self.record(prices);
        }
    }

    pub fn reset(&mut self) {
        self.history.clear();
        let prices = self.simulator.initialize();
        self.record(prices);
    }

    pub fn visible(&self) -> Vec<&MarketPrice> {
        self.prices
            .iter()
            .filter(|p| self.view.category().map_or(true, |c| p.category == c))
            .collect()
    }

    pub fn next_view(&mut self) {
        self.view = self.view.next();
        self.state.select(Some(0));
    }

    pub fn selected_market(&self) -> Option<&MarketPrice> {
        self.state.selected().and_then(|i| self.visible().get(i).copied())
    }

    pub fn next(&mut self) {
        let len = self.visible().len();
        if len == 0 {
            return;
        }
        let i = match self.state.selected() {
            Some(i) if i + 1 < len => i + 1,
            _ => 0,
        };
        self.state.select(Some(i));
    }

    pub fn previous(&mut self) {
        let len = self.visible().len();
        if len == 0 {
            return;
        }
        let i = match self.state.selected() {
            Some(0) | None => len - 1,
            Some(i) => i - 1,
        };
        self.state.select(Some(i));
    }
}

pub fn run_ui(app: &mut App) -> Result<()> {
    // Setup terminal
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    // Run the app
    let res = run_app(&mut terminal, app);

    // Restore terminal
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    if let Err(err) = res {
        println!("Error: {:?}", err);
    }

    Ok(())
}

fn run_app<B: ratatui::backend::Backend>(
    terminal: &mut Terminal<B>,
    app: &mut App,
) -> io::Result<()> {
    let mut last_tick = Instant::now();

    loop {
        terminal.draw(|f| ui(f, app))?;

        let timeout = app.tick_rate.saturating_sub(last_tick.elapsed());
        if event::poll(timeout)? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    match key.code {
                        KeyCode::Char('q') | KeyCode::Esc => return Ok(()),
                        KeyCode::Char('p') | KeyCode::Char(' ') => app.paused = !app.paused,
                        KeyCode::Char('r') => app.reset(),
                        KeyCode::Tab => app.next_view(),
                        KeyCode::Down | KeyCode::Char('j') => app.next(),
                        KeyCode::Up | KeyCode::Char('k') => app.previous(),
                        _ => {}
                    }
                }
            }
        }

        if last_tick.elapsed() >= app.tick_rate {
            app.on_tick();
            last_tick = Instant::now();
        }
    }
}

fn ui(f: &mut Frame, app: &mut App) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3), // Header
            Constraint::Min(0),    // Price table
            Constraint::Length(7), // Sparkline of selected market
            Constraint::Length(3), // Status bar
        ])
        .split(f.size());

    render_header(f, chunks[0], app);
    render_table(f, chunks[1], app);
    render_history(f, chunks[2], app);
    render_status_bar(f, chunks[3], app);
}

fn render_header(f: &mut Frame, area: Rect, app: &App) {
    let mut spans = vec![];
    for (i, view) in [View::All, View::Compliance, View::Voluntary].iter().enumerate() {
        if i > 0 {
            spans.push(Span::raw(" │ "));
        }
        let style = if *view == app.view {
            Style::default().fg(Color::Green).add_modifier(Modifier::BOLD)
        } else {
            Style::default().fg(Color::Gray)
        };
        spans.push(Span::styled(view.title().to_string(), style));
    }

    let header = Paragraph::new(Line::from(spans)).block(
        Block::default()
            .borders(Borders::ALL)
            .title(" GreenLedger Carbon Market "),
    );
    f.render_widget(header, area);
}

fn render_table(f: &mut Frame, area: Rect, app: &mut App) {
    let header_cells = ["Market", "Type", "Price", "Change"].iter().map(|h| {
        Cell::from(*h).style(
            Style::default()
                .fg(Color::Yellow)
                .add_modifier(Modifier::BOLD),
        )
    });

    let header = Row::new(header_cells)
        .style(Style::default().bg(Color::DarkGray))
        .height(1);

    let rows: Vec<Row> = app
        .visible()
        .into_iter()
        .map(|p| {
            let color = if p.change >= 0.0 { Color::Green } else { Color::Red };
            let arrow = if p.change >= 0.0 { "▲" } else { "▼" };

            Row::new(vec![
                Cell::from(p.market.clone()),
                Cell::from(p.category.as_str()),
                Cell::from(format!("{} {:.2}", p.currency, p.price)),
                Cell::from(format!("{} {:+.2}%", arrow, p.change)).style(Style::default().fg(color)),
            ])
            .height(1)
        })
        .collect();

    let table = Table::new(
        rows,
        [
            Constraint::Length(28),
            Constraint::Length(12),
            Constraint::Length(14),
            Constraint::Length(12),
        ],
    )
    .header(header)
    .block(
        Block::default()
            .borders(Borders::ALL)
            .border_style(Style::default().fg(Color::White))
            .title(" Prices "),
    )
    .highlight_style(
        Style::default()
            .bg(Color::DarkGray)
            .add_modifier(Modifier::BOLD),
    )
    .highlight_symbol("→ ");

    f.render_stateful_widget(table, area, &mut app.state);
}

fn render_history(f: &mut Frame, area: Rect, app: &App) {
    let (title, data) = match app.selected_market() {
        Some(p) => {
            let data: Vec<u64> = app
                .history
                .get(&p.market)
                .map(|h| h.iter().map(|v| (v * 100.0).round() as u64).collect())
                .unwrap_or_default();
            (format!(" {} ", p.market), data)
        }
        None => (" History ".to_string(), Vec::new()),
    };

    let sparkline = Sparkline::default()
        .block(Block::default().borders(Borders::ALL).title(title))
        .data(&data)
        .style(Style::default().fg(Color::Green));
    f.render_widget(sparkline, area);
}

fn render_status_bar(f: &mut Frame, area: Rect, app: &App) {
    let state = if app.paused {
        Span::styled(" PAUSED ", Style::default().fg(Color::Black).bg(Color::Yellow))
    } else {
        Span::styled(" LIVE ", Style::default().fg(Color::Black).bg(Color::Green))
    };

    let spans = vec![
        state,
        Span::raw(format!(" tick {} ", app.simulator.ticks())),
        Span::styled(
            " q quit · p pause · r reset · Tab view · ↑/↓ select ",
            Style::default().fg(Color::Gray),
        ),
    ];

    let status = Paragraph::new(Line::from(spans)).block(Block::default().borders(Borders::ALL));
    f.render_widget(status, area);
}
