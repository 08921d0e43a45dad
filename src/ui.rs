use ratatui::Frame;
use ratatui::layout::{Alignment, Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Clear, List, ListItem, ListState, Paragraph, Wrap};

use crate::app::{App, InputMode, TreeRow};
use crate::model::{ImageVariant, InstanceStatus};
use crate::selection::Selection;
use crate::tree::NodePayload;

const BG: Color = Color::Rgb(9, 15, 25);
const PANEL: Color = Color::Rgb(16, 27, 44);
const ACCENT: Color = Color::Rgb(52, 211, 153);
const MUTED: Color = Color::Rgb(140, 156, 178);
const WARN: Color = Color::Rgb(251, 191, 36);
const ERROR: Color = Color::Rgb(248, 113, 113);
const PL_A: Color = Color::Rgb(17, 94, 89);
const PL_B: Color = Color::Rgb(30, 64, 175);

pub fn render(frame: &mut Frame, app: &App) {
    let root = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(1),
            Constraint::Min(6),
            Constraint::Length(1),
        ])
        .split(frame.area());

    render_header(frame, root[0], app);
    render_body(frame, root[1], app);
    render_footer(frame, root[2], app);

    if app.show_help() {
        render_help_modal(frame);
    }
}

fn render_header(frame: &mut Frame, area: Rect, app: &App) {
    let left_line = build_left_header_line(app);
    if area.width < 42 {
        frame.render_widget(
            Paragraph::new(left_line).style(Style::default().bg(BG).fg(Color::White)),
            area,
        );
        return;
    }

    let right_line = build_right_header_line(app);
    let right_width = spans_width(&right_line.spans) as u16;
    if right_width == 0 || right_width >= area.width {
        frame.render_widget(
            Paragraph::new(left_line).style(Style::default().bg(BG).fg(Color::White)),
            area,
        );
        return;
    }
    let chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Min(1), Constraint::Length(right_width)])
        .split(area);
    frame.render_widget(
        Paragraph::new(left_line).style(Style::default().bg(BG).fg(Color::White)),
        chunks[0],
    );
    frame.render_widget(
        Paragraph::new(right_line)
            .style(Style::default().bg(BG))
            .alignment(Alignment::Right),
        chunks[1],
    );
}

fn build_left_header_line(app: &App) -> Line<'static> {
    let mut spans = vec![
        Span::styled(
            " 󰅟 stratus ",
            Style::default().fg(ACCENT).add_modifier(Modifier::BOLD),
        ),
        Span::styled(
            format!(" {} ", app.filter().summary()),
            Style::default().fg(MUTED),
        ),
    ];
    if !app.filter().is_unrestricted() {
        spans.push(Span::styled(" 󰈲 filtered", Style::default().fg(WARN)));
    }
    Line::from(spans)
}

fn build_right_header_line(app: &App) -> Line<'static> {
    let updated = app
        .last_refreshed()
        .map(|at| format!("updated {} ", at.format("%H:%M:%S")))
        .unwrap_or_else(|| "not loaded yet ".to_string());
    Line::from(vec![Span::styled(updated, Style::default().fg(MUTED))])
}

fn render_body(frame: &mut Frame, area: Rect, app: &App) {
    if area.width < 70 {
        render_tree(frame, area, app);
        return;
    }
    let chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(62), Constraint::Percentage(38)])
        .split(area);
    render_tree(frame, chunks[0], app);
    render_detail(frame, chunks[1], app);
}

fn render_tree(frame: &mut Frame, area: Rect, app: &App) {
    let items = app
        .rows()
        .iter()
        .map(|row| ListItem::new(tree_row_line(row)))
        .collect::<Vec<_>>();

    let block = Block::default()
        .title(format!("Resources ({})", app.rows().len()))
        .borders(Borders::ALL)
        .border_style(Style::default().fg(ACCENT))
        .style(Style::default().bg(PANEL));

    let list = List::new(items)
        .block(block)
        .highlight_style(
            Style::default()
                .bg(Color::Rgb(24, 36, 58))
                .add_modifier(Modifier::BOLD),
        )
        .highlight_symbol("󰜴 ");

    let mut state = ListState::default();
    if !app.rows().is_empty() {
        state.select(Some(app.selected_index()));
    }
    frame.render_stateful_widget(list, area, &mut state);
}

fn tree_row_line(row: &TreeRow) -> Line<'static> {
    let indent = "  ".repeat(row.depth);
    let (glyph, glyph_color) = variant_glyph(row.node.image_variant());
    let mut spans = vec![
        Span::raw(indent),
        Span::styled(format!("{glyph} "), Style::default().fg(glyph_color)),
        Span::styled(row.node.display_text(), Style::default().fg(Color::White)),
    ];
    if let NodePayload::Instance(detail) = row.node.payload() {
        spans.push(Span::styled(
            format!("  {}", detail.os.label()),
            Style::default().fg(MUTED),
        ));
        spans.push(Span::styled(
            format!(" {}", detail.status.label()),
            Style::default().fg(status_color(&detail.status)),
        ));
        if row.connected {
            spans.push(Span::styled("  󰌘", Style::default().fg(ACCENT)));
        }
    }
    Line::from(spans)
}

fn variant_glyph(variant: ImageVariant) -> (&'static str, Color) {
    match variant {
        ImageVariant::Root => ("󰅟", ACCENT),
        ImageVariant::Project => ("󰆧", Color::White),
        ImageVariant::ProjectInaccessible => ("󰌾", ERROR),
        ImageVariant::Zone => ("󰒋", MUTED),
        ImageVariant::InstanceRunning => ("󰐊", ACCENT),
        ImageVariant::InstanceStopped => ("󰓛", WARN),
        ImageVariant::InstanceOther => ("󰏤", MUTED),
    }
}

fn status_color(status: &InstanceStatus) -> Color {
    match status {
        InstanceStatus::Running => ACCENT,
        InstanceStatus::Stopped => WARN,
        InstanceStatus::Other(_) => MUTED,
    }
}

fn render_detail(frame: &mut Frame, area: Rect, app: &App) {
    let panel = Paragraph::new(detail_lines(app))
        .wrap(Wrap { trim: false })
        .block(
            Block::default()
                .title("Details")
                .borders(Borders::ALL)
                .border_style(Style::default().fg(MUTED))
                .style(Style::default().bg(PANEL)),
        )
        .style(Style::default().fg(Color::White));
    frame.render_widget(panel, area);
}

fn detail_lines(app: &App) -> Vec<Line<'static>> {
    if matches!(app.selection(), Selection::None) {
        return vec![
            Line::from("Nothing selected"),
            Line::from(Span::styled(
                "j/k move  Enter expand  ? help",
                Style::default().fg(MUTED),
            )),
        ];
    }

    let mut lines = match app.rows().get(app.selected_index()) {
        Some(row) => node_detail_lines(row),
        None => vec![Line::from("Nothing selected")],
    };
    lines.push(Line::from(""));
    lines.push(Line::from(Span::styled(
        available_commands(app),
        Style::default().fg(MUTED),
    )));
    lines
}

fn node_detail_lines(row: &TreeRow) -> Vec<Line<'static>> {
    let heading = Style::default()
        .fg(Color::White)
        .add_modifier(Modifier::BOLD);
    match row.node.payload() {
        NodePayload::Root => vec![
            Line::from(Span::styled(row.node.display_text(), heading)),
            Line::from("All tracked projects"),
        ],
        NodePayload::Project(summary) => {
            let mut lines = vec![
                Line::from(Span::styled(summary.display_text(), heading)),
                Line::from(format!("Project id: {}", summary.id)),
            ];
            if !summary.is_accessible() {
                lines.push(Line::from(Span::styled(
                    "Access denied at last load",
                    Style::default().fg(ERROR),
                )));
            }
            lines
        }
        NodePayload::Zone(zone) => vec![
            Line::from(Span::styled(zone.zone.clone(), heading)),
            Line::from(format!("Project: {}", zone.project)),
        ],
        NodePayload::Instance(detail) => {
            let mut lines = vec![
                Line::from(Span::styled(detail.locator.name.clone(), heading)),
                Line::from(format!("Project: {}", detail.locator.project)),
                Line::from(format!("Zone: {}", detail.locator.zone)),
                Line::from(format!("Instance id: {}", detail.id)),
                Line::from(format!("OS: {}", detail.os.label())),
                Line::from(format!("Status: {}", detail.status.label())),
            ];
            if row.connected {
                lines.push(Line::from(Span::styled(
                    "Tunnel: connected 󰌘",
                    Style::default().fg(ACCENT),
                )));
            } else {
                lines.push(Line::from(Span::styled(
                    "Tunnel: none",
                    Style::default().fg(MUTED),
                )));
            }
            lines
        }
    }
}

fn available_commands(app: &App) -> String {
    let commands = app.commands();
    let mut hints: Vec<&str> = Vec::new();
    if commands.refresh_subtree {
        hints.push("r refresh");
    }
    if commands.refresh_all_projects {
        hints.push("R refresh-all");
    }
    if commands.unload_project {
        hints.push("x unload");
    }
    if commands.open_in_console {
        hints.push("o console");
    }
    if commands.configure_access {
        hints.push("g access");
    }
    if matches!(app.selection(), Selection::Instance(_)) {
        hints.push("t tunnel");
        hints.push("T drop tunnel");
    }
    hints.join("  ")
}

fn render_footer(frame: &mut Frame, area: Rect, app: &App) {
    if matches!(app.mode(), InputMode::Normal) {
        let status_text = app
            .pending_confirmation_prompt()
            .map(|pending| format!("{pending}? (y/n)"))
            .unwrap_or_else(|| app.status().to_string());

        let pending = app.pending_confirmation_prompt().is_some();
        let status_bg = if pending { WARN } else { PL_B };
        let status_fg = if pending { Color::Black } else { Color::White };

        let mut spans = Vec::new();
        push_powerline_segment(&mut spans, " 󰘳 nrm ", Color::White, PL_A, status_bg);
        let status_width = area.width.saturating_sub(12).min(150) as usize;
        push_powerline_segment(
            &mut spans,
            format!(" {} ", compact_text(&status_text, status_width.max(24))),
            status_fg,
            status_bg,
            BG,
        );
        frame.render_widget(
            Paragraph::new(Line::from(spans)).style(Style::default().bg(BG)),
            area,
        );
        return;
    }

    let (label, prompt) = match app.mode() {
        InputMode::Filter => (" 󰈲 flt ", format!("/{}", app.input())),
        InputMode::AddProject => (" 󰐕 add ", format!("+{}", app.input())),
        InputMode::Normal => unreachable!(),
    };

    let mut spans = Vec::new();
    push_powerline_segment(&mut spans, label, Color::Black, WARN, PL_B);
    push_powerline_segment(&mut spans, format!(" {prompt} "), Color::White, PL_B, BG);
    frame.render_widget(
        Paragraph::new(Line::from(spans)).style(Style::default().bg(BG)),
        area,
    );
}

fn render_help_modal(frame: &mut Frame) {
    let area = centered_rect(70, 60, frame.area());
    frame.render_widget(Clear, area);

    let lines = vec![
        Line::from("stratus help"),
        Line::from(""),
        Line::from("Move: j/k or arrows  Home/End jump  Enter expand or collapse"),
        Line::from("Tree: Right expand  Left collapse  Esc clear selection"),
        Line::from("Refresh: r selected scope  R all loaded projects  Ctrl+r re-list projects"),
        Line::from("Projects: a add  x unload (asks for confirmation)"),
        Line::from("Filter: / name substring  w toggle windows  l toggle linux"),
        Line::from("Tunnels: t connect  T disconnect"),
        Line::from("Console: o open in browser  g access settings"),
        Line::from("Quit: q or Ctrl+c"),
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
