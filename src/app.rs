use std::collections::HashSet;

use chrono::{DateTime, Local};

use crate::filter::InstanceFilter;
use crate::input::Action;
use crate::model::InstanceLocator;
use crate::selection::{CommandSet, RefreshScope, Selection, SelectionController};
use crate::tree::{Node, NodePayload, NodeRef, ResourceTree};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputMode {
    Normal,
    AddProject,
    Filter,
}

/// Side effect requested by [`App::apply_action`]. The event loop owns every
/// async operation; the app itself only mutates view state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppCommand {
    None,
    LoadChildren { node: NodeRef },
    ApplyRefresh { scope: RefreshScope },
    RefreshAll { reload_projects: bool },
    ApplyFilter,
    AddProject { id: String },
    RemoveProject { id: String },
    OpenInstanceList { project: String },
    OpenInstanceDetails { locator: InstanceLocator },
    ConfigureAccess { project: String },
    Connect { locator: InstanceLocator },
    Disconnect { locator: InstanceLocator },
}

#[derive(Debug, Clone)]
struct PendingConfirmation {
    prompt: String,
    command: AppCommand,
}

/// One visible line of the tree pane. `connected` is sampled from the
/// connection tracker at rebuild time so rendering stays lock-free.
#[derive(Clone)]
pub struct TreeRow {
    pub node: Node,
    pub depth: usize,
    pub connected: bool,
}

pub struct App {
    running: bool,
    mode: InputMode,
    rows: Vec<TreeRow>,
    expanded: HashSet<NodeRef>,
    selected_index: usize,
    has_selection: bool,
    selection: SelectionController,
    filter: InstanceFilter,
    input: String,
    status: String,
    show_help: bool,
    pending_confirmation: Option<PendingConfirmation>,
    last_refreshed: Option<DateTime<Local>>,
}

impl App {
    pub fn new(filter: InstanceFilter) -> Self {
        Self {
            running: true,
            mode: InputMode::Normal,
            rows: Vec::new(),
            expanded: HashSet::new(),
            selected_index: 0,
            has_selection: false,
            selection: SelectionController::new(),
            filter,
            input: String::new(),
            status: "Press ? for help".to_string(),
            show_help: false,
            pending_confirmation: None,
            last_refreshed: None,
        }
    }

    pub fn running(&self) -> bool {
        self.running
    }

    pub fn mode(&self) -> InputMode {
        self.mode
    }

    pub fn rows(&self) -> &[TreeRow] {
        &self.rows
    }

    pub fn selected_index(&self) -> usize {
        self.selected_index
    }

    pub fn selection(&self) -> &Selection {
        self.selection.current()
    }

    pub fn commands(&self) -> CommandSet {
        self.selection.commands()
    }

    pub fn filter(&self) -> &InstanceFilter {
        &self.filter
    }

    pub fn input(&self) -> &str {
        &self.input
    }

    pub fn status(&self) -> &str {
        &self.status
    }

    pub fn show_help(&self) -> bool {
        self.show_help
    }

    pub fn last_refreshed(&self) -> Option<DateTime<Local>> {
        self.last_refreshed
    }

    pub fn expanded_refs(&self) -> Vec<NodeRef> {
        self.expanded.iter().cloned().collect()
    }

    pub fn pending_confirmation_prompt(&self) -> Option<&str> {
        self.pending_confirmation
            .as_ref()
            .map(|pending| pending.prompt.as_str())
    }

    pub fn set_status(&mut self, status: impl Into<String>) {
        self.status = normalize_status_text(status.into());
    }

    pub fn mark_refreshed(&mut self) {
        self.last_refreshed = Some(Local::now());
    }

    /// Rebuilds the visible rows from cached tree state. Rendering never
    /// triggers a fetch; collapsed or unloaded nodes contribute no rows.
    pub fn rebuild_rows(&mut self, tree: &ResourceTree) {
        let mut rows = Vec::new();
        collect_rows(tree, tree.root(), 0, &self.expanded, &mut rows);
        self.rows = rows;
        self.selected_index = self
            .selected_index
            .min(self.rows.len().saturating_sub(1));
        self.sync_selection();
    }

    pub fn apply_action(&mut self, action: Action) -> AppCommand {
        if let Some(pending) = self.pending_confirmation.take() {
            return match action {
                Action::ConfirmYes => {
                    self.set_status(format!("Confirmed: {}", pending.prompt));
                    pending.command
                }
                Action::ConfirmNo | Action::CancelInput | Action::ClearSelection => {
                    self.set_status("Action cancelled");
                    AppCommand::None
                }
                _ => {
                    self.pending_confirmation = Some(pending);
                    self.set_status("Press y to confirm or n to cancel");
                    AppCommand::None
                }
            };
        }

        if self.show_help && !matches!(action, Action::ToggleHelp) {
            self.show_help = false;
        }

        match action {
            Action::Quit => {
                self.running = false;
                self.set_status("Exit requested");
                AppCommand::None
            }
            Action::Down => {
                self.move_selection(1);
                AppCommand::None
            }
            Action::Up => {
                self.move_selection(-1);
                AppCommand::None
            }
            Action::Top => {
                self.select_first();
                AppCommand::None
            }
            Action::Bottom => {
                self.select_last();
                AppCommand::None
            }
            Action::ExpandOrCollapse => self.toggle_selected(),
            Action::Expand => self.expand_selected(),
            Action::Collapse => self.collapse_selected(),
            Action::ClearSelection => {
                self.has_selection = false;
                self.selection.clear();
                self.set_status("Selection cleared");
                AppCommand::None
            }
            Action::Refresh => {
                let scope = self.selection.refresh_scope();
                self.set_status(refresh_status(&scope));
                AppCommand::ApplyRefresh { scope }
            }
            Action::RefreshAll => {
                self.set_status("Refreshing every loaded project");
                AppCommand::RefreshAll {
                    reload_projects: false,
                }
            }
            Action::ReloadProjects => {
                self.set_status("Reloading the tracked project list");
                AppCommand::RefreshAll {
                    reload_projects: true,
                }
            }
            Action::StartAddProject => {
                self.mode = InputMode::AddProject;
                self.input.clear();
                self.set_status("Add project: type an id and press Enter");
                AppCommand::None
            }
            Action::UnloadProject => {
                if let Selection::Project(id) = self.current_selection() {
                    self.pending_confirmation = Some(PendingConfirmation {
                        prompt: format!("Unload project '{id}'"),
                        command: AppCommand::RemoveProject { id },
                    });
                    self.set_status("Press y to confirm or n to cancel");
                } else {
                    self.set_status("Select a project to unload");
                }
                AppCommand::None
            }
            Action::OpenConsole => match self.current_selection() {
                Selection::Project(project) => {
                    self.set_status(format!("Opening instance list for {project}"));
                    AppCommand::OpenInstanceList { project }
                }
                Selection::Zone(zone) => {
                    self.set_status(format!("Opening instance list for {}", zone.project));
                    AppCommand::OpenInstanceList {
                        project: zone.project,
                    }
                }
                Selection::Instance(locator) => {
                    self.set_status(format!("Opening details for {}", locator.name));
                    AppCommand::OpenInstanceDetails { locator }
                }
                Selection::None | Selection::Root => {
                    self.set_status("Select a project, zone or instance to open");
                    AppCommand::None
                }
            },
            Action::ConfigureAccess => {
                if let Selection::Project(project) = self.current_selection() {
                    self.set_status(format!("Opening access settings for {project}"));
                    AppCommand::ConfigureAccess { project }
                } else {
                    self.set_status("Select a project to configure access");
                    AppCommand::None
                }
            }
            Action::Connect => {
                if let Selection::Instance(locator) = self.current_selection() {
                    self.set_status(format!("Starting tunnel to {}", locator.name));
                    AppCommand::Connect { locator }
                } else {
                    self.set_status("Select an instance to connect");
                    AppCommand::None
                }
            }
            Action::Disconnect => {
                if let Selection::Instance(locator) = self.current_selection() {
                    self.set_status(format!("Stopping tunnel to {}", locator.name));
                    AppCommand::Disconnect { locator }
                } else {
                    self.set_status("Select an instance to disconnect");
                    AppCommand::None
                }
            }
            Action::StartFilter => {
                self.mode = InputMode::Filter;
                self.input = self.filter.name_pattern.clone();
                self.set_status("Filter: type a name substring and press Enter");
                AppCommand::None
            }
            Action::ToggleWindows => {
                self.filter.show_windows = !self.filter.show_windows;
                self.set_status(format!("Filter: {}", self.filter.summary()));
                AppCommand::ApplyFilter
            }
            Action::ToggleLinux => {
                self.filter.show_linux = !self.filter.show_linux;
                self.set_status(format!("Filter: {}", self.filter.summary()));
                AppCommand::ApplyFilter
            }
            Action::ToggleHelp => {
                self.show_help = !self.show_help;
                AppCommand::None
            }
            Action::ConfirmYes | Action::ConfirmNo => {
                self.set_status("No pending confirmation");
                AppCommand::None
            }
            Action::SubmitInput => self.submit_input(),
            Action::CancelInput => {
                self.mode = InputMode::Normal;
                self.input.clear();
                self.set_status("Input cancelled");
                AppCommand::None
            }
            Action::Backspace => {
                self.input.pop();
                AppCommand::None
            }
            Action::InputChar(c) => {
                self.input.push(c);
                AppCommand::None
            }
        }
    }

    fn submit_input(&mut self) -> AppCommand {
        match self.mode {
            InputMode::Normal => AppCommand::None,
            InputMode::AddProject => {
                let id = self.input.trim().to_string();
                self.mode = InputMode::Normal;
                self.input.clear();
                if id.is_empty() {
                    self.set_status("No project id entered");
                    return AppCommand::None;
                }
                self.set_status(format!("Adding project {id}"));
                AppCommand::AddProject { id }
            }
            InputMode::Filter => {
                self.filter.name_pattern = self.input.trim().to_string();
                self.mode = InputMode::Normal;
                self.input.clear();
                self.set_status(format!("Filter: {}", self.filter.summary()));
                AppCommand::ApplyFilter
            }
        }
    }

    fn current_selection(&self) -> Selection {
        self.selection.current().clone()
    }

    fn selected_row_summary(&self) -> Option<(NodeRef, bool, String)> {
        let row = self.rows.get(self.selected_index)?;
        Some((
            row.node.node_ref(),
            row.node.can_expand(),
            row.node.display_text(),
        ))
    }

    fn toggle_selected(&mut self) -> AppCommand {
        let Some((node_ref, can_expand, caption)) = self.selected_row_summary() else {
            return AppCommand::None;
        };
        self.has_selection = true;
        self.sync_selection();
        if !can_expand {
            self.set_status(format!("{caption} has no children to expand"));
            return AppCommand::None;
        }
        if self.expanded.remove(&node_ref) {
            AppCommand::None
        } else {
            self.expanded.insert(node_ref.clone());
            AppCommand::LoadChildren { node: node_ref }
        }
    }

    fn expand_selected(&mut self) -> AppCommand {
        let Some((node_ref, can_expand, _)) = self.selected_row_summary() else {
            return AppCommand::None;
        };
        self.has_selection = true;
        self.sync_selection();
        if !can_expand || self.expanded.contains(&node_ref) {
            return AppCommand::None;
        }
        self.expanded.insert(node_ref.clone());
        AppCommand::LoadChildren { node: node_ref }
    }

    fn collapse_selected(&mut self) -> AppCommand {
        let Some((node_ref, _, _)) = self.selected_row_summary() else {
            return AppCommand::None;
        };
        self.has_selection = true;
        self.sync_selection();
        self.expanded.remove(&node_ref);
        AppCommand::None
    }

    fn move_selection(&mut self, delta: isize) {
        if self.rows.is_empty() {
            self.selected_index = 0;
            return;
        }
        let max_index = self.rows.len().saturating_sub(1) as isize;
        let current = self.selected_index.min(max_index as usize) as isize;
        self.selected_index = (current + delta).clamp(0, max_index) as usize;
        self.has_selection = true;
        self.sync_selection();
    }

    fn select_first(&mut self) {
        if self.rows.is_empty() {
            return;
        }
        self.selected_index = 0;
        self.has_selection = true;
        self.sync_selection();
    }

    fn select_last(&mut self) {
        if self.rows.is_empty() {
            return;
        }
        self.selected_index = self.rows.len() - 1;
        self.has_selection = true;
        self.sync_selection();
    }

    fn sync_selection(&mut self) {
        if !self.has_selection {
            self.selection.clear();
            return;
        }
        let selection = match self.rows.get(self.selected_index) {
            None => Selection::None,
            Some(row) => match row.node.payload() {
                NodePayload::Root => Selection::Root,
                NodePayload::Project(summary) => Selection::Project(summary.id.clone()),
                NodePayload::Zone(zone) => Selection::Zone(zone.clone()),
                NodePayload::Instance(detail) => Selection::Instance(detail.locator.clone()),
            },
        };
        self.selection.select(selection);
    }
}

fn collect_rows(
    tree: &ResourceTree,
    node: &Node,
    depth: usize,
    expanded: &HashSet<NodeRef>,
    out: &mut Vec<TreeRow>,
) {
    let connected = match node.payload() {
        NodePayload::Instance(detail) => tree.is_connected(&detail.locator),
        _ => false,
    };
    out.push(TreeRow {
        node: node.clone(),
        depth,
        connected,
    });
    if !expanded.contains(&node.node_ref()) {
        return;
    }
    let Some(children) = tree.cached_children(node) else {
        return;
    };
    for child in &children {
        collect_rows(tree, child, depth + 1, expanded, out);
    }
}

fn refresh_status(scope: &RefreshScope) -> String {
    match scope {
        RefreshScope::AllProjects => "Refreshing all projects".to_string(),
        RefreshScope::ZonesOf(project) => format!("Refreshing zones of {project}"),
        RefreshScope::InstancesOf(zone) => format!("Refreshing instances in {}", zone.zone),
    }
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
