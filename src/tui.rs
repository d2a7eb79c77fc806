use anyhow::Result;
use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind},
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
    ExecutableCommand,
};
use ratatui::{
    prelude::*,
    widgets::{Block, Borders, List, ListItem, ListState, Paragraph, Wrap},
};
use std::io::stdout;

use crate::db::Database;
use crate::models::{AppliedMethod, Job, JobStatus};

enum Mode {
    Browse,
    /// Collecting a rejection reason for the selected job.
    RejectReason(String),
}

struct AppState {
    jobs: Vec<Job>,
    selected: usize,
    scroll_offset: u16,
    mode: Mode,
    message: Option<String>,
}

impl AppState {
    fn new(jobs: Vec<Job>) -> Self {
        Self {
            jobs,
            selected: 0,
            scroll_offset: 0,
            mode: Mode::Browse,
            message: None,
        }
    }

    fn current_job(&self) -> Option<&Job> {
        self.jobs.get(self.selected)
    }

    fn next(&mut self) {
        if !self.jobs.is_empty() && self.selected < self.jobs.len() - 1 {
            self.selected += 1;
            self.scroll_offset = 0;
        }
    }

    fn prev(&mut self) {
        if self.selected > 0 {
            self.selected -= 1;
            self.scroll_offset = 0;
        }
    }

    fn scroll_down(&mut self) {
        self.scroll_offset = self.scroll_offset.saturating_add(3);
    }

    fn scroll_up(&mut self) {
        self.scroll_offset = self.scroll_offset.saturating_sub(3);
    }

    fn set_status(
        &mut self,
        db: &Database,
        status: JobStatus,
        method: Option<AppliedMethod>,
        reason: Option<&str>,
    ) {
        let Some(job) = self.jobs.get_mut(self.selected) else { return };
        match db.update_status(&job.id, status, method, reason) {
            Ok(true) => {
                job.status = status;
                if method.is_some() {
                    job.applied_method = method;
                }
                if let Some(reason) = reason {
                    job.rejection_reason = Some(reason.to_string());
                }
                self.message = Some(format!("{} -> {}", job.company, status));
            }
            Ok(false) => self.message = Some("Job no longer exists".to_string()),
            Err(e) => self.message = Some(format!("Update failed: {:#}", e)),
        }
    }

    fn toggle_curated(&mut self, db: &Database) {
        let Some(job) = self.jobs.get_mut(self.selected) else { return };
        match db.set_curated(&job.id, !job.curated) {
            Ok(_) => job.curated = !job.curated,
            Err(e) => self.message = Some(format!("Update failed: {:#}", e)),
        }
    }
}

/// Interactive review of the queue, highest rank first.
pub fn run_browse(db: &Database, status: Option<JobStatus>) -> Result<()> {
    let jobs = db.list_jobs(Some(status.unwrap_or(JobStatus::Queued)), None)?;
    if jobs.is_empty() {
        println!("No jobs found.");
        return Ok(());
    }

    let mut state = AppState::new(jobs);

    // Setup terminal
    enable_raw_mode()?;
    stdout().execute(EnterAlternateScreen)?;
    let mut terminal = Terminal::new(CrosstermBackend::new(stdout()))?;

    let result = run_loop(&mut terminal, &mut state, db);

    // Restore terminal
    disable_raw_mode()?;
    stdout().execute(LeaveAlternateScreen)?;

    result
}

fn run_loop(
    terminal: &mut Terminal<CrosstermBackend<std::io::Stdout>>,
    state: &mut AppState,
    db: &Database,
) -> Result<()> {
    let mut list_state = ListState::default();
    list_state.select(Some(0));

    loop {
        terminal.draw(|frame| draw(frame, state, &mut list_state))?;

        let Event::Key(key) = event::read()? else { continue };
        if key.kind != KeyEventKind::Press {
            continue;
        }

        if let Mode::RejectReason(input) = &mut state.mode {
            match key.code {
                KeyCode::Esc => state.mode = Mode::Browse,
                KeyCode::Enter => {
                    let reason = std::mem::take(input);
                    state.mode = Mode::Browse;
                    let reason = reason.trim();
                    state.set_status(
                        db,
                        JobStatus::Rejected,
                        None,
                        (!reason.is_empty()).then_some(reason),
                    );
                }
                KeyCode::Backspace => {
                    input.pop();
                }
                KeyCode::Char(c) => input.push(c),
                _ => {}
            }
            continue;
        }

        state.message = None;
        match key.code {
            KeyCode::Char('q') | KeyCode::Esc => break,
            KeyCode::Down | KeyCode::Char('j') => state.next(),
            KeyCode::Up | KeyCode::Char('k') => state.prev(),
            KeyCode::Char('J') | KeyCode::PageDown => state.scroll_down(),
            KeyCode::Char('K') | KeyCode::PageUp => state.scroll_up(),
            KeyCode::Char('s') => state.set_status(db, JobStatus::Skipped, None, None),
            KeyCode::Char('i') => state.set_status(db, JobStatus::Interview, None, None),
            KeyCode::Char('a') => {
                state.set_status(db, JobStatus::Applied, Some(AppliedMethod::Manual), None)
            }
            KeyCode::Char('x') if state.current_job().is_some() => {
                state.mode = Mode::RejectReason(String::new())
            }
            KeyCode::Char('c') => state.toggle_curated(db),
            _ => {}
        }
        list_state.select(Some(state.selected));
    }
    Ok(())
}

fn status_style(status: JobStatus) -> Style {
    match status {
        JobStatus::Queued => Style::default().fg(Color::Green),
        JobStatus::Interview => Style::default().fg(Color::Yellow),
        JobStatus::Applied => Style::default().fg(Color::Cyan),
        JobStatus::Rejected => Style::default().fg(Color::Red),
        JobStatus::Skipped | JobStatus::Reported => Style::default().fg(Color::DarkGray),
    }
}

fn draw(frame: &mut Frame, state: &AppState, list_state: &mut ListState) {
    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Min(0), Constraint::Length(1)])
        .split(frame.area());

    let chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(35), Constraint::Percentage(65)])
        .split(rows[0]);

    // Left panel: queue
    let items: Vec<ListItem> = state
        .jobs
        .iter()
        .map(|job| {
            let status_icon = match job.status {
                JobStatus::Queued => " ",
                JobStatus::Interview => "*",
                JobStatus::Applied => "+",
                JobStatus::Rejected => "x",
                JobStatus::Skipped | JobStatus::Reported => "-",
            };
            let rank = job.rank.map(|r| format!("{:>3.0}", r)).unwrap_or_else(|| "  ?".into());
            let title: String = if job.title.chars().count() > 35 {
                format!("{}...", job.title.chars().take(32).collect::<String>())
            } else {
                job.title.clone()
            };
            let curated = if job.curated { "!" } else { " " };
            ListItem::new(format!("{}{} {} {} | {}", status_icon, curated, rank, title, job.company))
        })
        .collect();

    let list = List::new(items)
        .block(Block::default().borders(Borders::ALL).title(format!(" Queue ({}) ", state.jobs.len())))
        .highlight_style(Style::default().bg(Color::DarkGray).add_modifier(Modifier::BOLD))
        .highlight_symbol("> ");

    frame.render_stateful_widget(list, chunks[0], list_state);

    // Right panel: job detail
    let detail_widget = Paragraph::new(build_detail(state))
        .block(Block::default().borders(Borders::ALL).title(" Detail "))
        .wrap(Wrap { trim: false })
        .scroll((state.scroll_offset, 0));

    frame.render_widget(detail_widget, chunks[1]);

    // Footer: prompt, last message, or help
    let footer = match (&state.mode, &state.message) {
        (Mode::RejectReason(input), _) => Paragraph::new(format!(" Rejection reason: {}_", input))
            .style(Style::default().fg(Color::Yellow)),
        (Mode::Browse, Some(message)) => Paragraph::new(format!(" {}", message)),
        (Mode::Browse, None) => Paragraph::new(
            " j/k:navigate  J/K:scroll  s:skip i:interview a:applied x:reject c:curate  q:quit",
        )
        .style(Style::default().fg(Color::DarkGray)),
    };
    frame.render_widget(footer, rows[1]);
}

fn section<'a>(lines: &mut Vec<Line<'a>>, heading: &'a str, items: &'a [String], color: Color) {
    if items.is_empty() {
        return;
    }
    lines.push(Line::from(Span::styled(heading, Style::default().add_modifier(Modifier::BOLD))));
    for item in items {
        lines.push(Line::from(Span::styled(format!("  - {}", item), Style::default().fg(color))));
    }
    lines.push(Line::from(""));
}

fn build_detail(state: &AppState) -> Text<'_> {
    let Some(job) = state.current_job() else {
        return Text::raw("No job selected");
    };

    let mut lines: Vec<Line> = Vec::new();

    // Header
    lines.push(Line::from(Span::styled(
        &job.title,
        Style::default().add_modifier(Modifier::BOLD),
    )));
    lines.push(Line::from(format!("at {}", job.company)));
    lines.push(Line::from(Span::styled(
        format!("Status: {}", job.status),
        status_style(job.status),
    )));
    if let Some(rank) = job.rank {
        lines.push(Line::from(format!("Rank: {:.1}", rank)));
    }
    if let Some(profile) = &job.search_profile {
        lines.push(Line::from(format!("Profile: {}", profile)));
    }
    if job.quick_apply {
        lines.push(Line::from("Quick apply"));
    }
    lines.push(Line::from(format!("URL: {}", job.url)));
    if let Some(reason) = &job.rejection_reason {
        lines.push(Line::from(Span::styled(
            format!("Rejected: {}", reason),
            Style::default().fg(Color::Red),
        )));
    }
    lines.push(Line::from(""));

    // Fit details
    if !job.fit.category_scores.is_empty() {
        lines.push(Line::from(Span::styled("Scores", Style::default().add_modifier(Modifier::BOLD))));
        for (category, score) in &job.fit.category_scores {
            lines.push(Line::from(format!("  {:<12} {:>5.1}", category, score)));
        }
        lines.push(Line::from(""));
    }
    section(&mut lines, "Why it fits", &job.fit.reasons, Color::Green);
    section(&mut lines, "Blockers", &job.fit.blockers, Color::Red);
    section(&mut lines, "Must haves", &job.fit.must_haves, Color::Cyan);
    section(&mut lines, "Missing keywords", &job.fit.missing_keywords, Color::Yellow);

    match &job.description {
        Some(text) => {
            lines.push(Line::from(Span::styled(
                "Description",
                Style::default().add_modifier(Modifier::BOLD),
            )));
            for line in textwrap::fill(text, 70).lines() {
                lines.push(Line::from(line.to_string()));
            }
        }
        None => lines.push(Line::from(Span::styled(
            "(No description captured)",
            Style::default().fg(Color::DarkGray),
        ))),
    }

    Text::from(lines)
}
