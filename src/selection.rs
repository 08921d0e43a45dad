use crate::model::{InstanceLocator, ZoneLocator};

/// What the operator currently has highlighted in the tree.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Selection {
    #[default]
    None,
    Root,
    Project(String),
    Zone(ZoneLocator),
    Instance(InstanceLocator),
}

/// Visibility flags for the context commands. Derived from the selection
/// alone; whether a command is currently runnable is the caller's problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandSet {
    pub unload_project: bool,
    pub refresh_subtree: bool,
    pub refresh_all_projects: bool,
    pub open_in_console: bool,
    pub configure_access: bool,
}

impl CommandSet {
    const ROOT_LEVEL: Self = Self {
        unload_project: false,
        refresh_subtree: false,
        refresh_all_projects: true,
        open_in_console: false,
        configure_access: false,
    };

    const PROJECT: Self = Self {
        unload_project: true,
        refresh_subtree: true,
        refresh_all_projects: true,
        open_in_console: true,
        configure_access: true,
    };

    const SUBTREE: Self = Self {
        unload_project: false,
        refresh_subtree: true,
        refresh_all_projects: true,
        open_in_console: true,
        configure_access: false,
    };
}

/// Which slice of the cache a refresh should invalidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshScope {
    AllProjects,
    ZonesOf(String),
    InstancesOf(ZoneLocator),
}

#[derive(Default)]
pub struct SelectionController {
    current: Selection,
}

impl SelectionController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn select(&mut self, selection: Selection) {
        self.current = selection;
    }

    pub fn clear(&mut self) {
        self.current = Selection::None;
    }

    pub fn current(&self) -> &Selection {
        &self.current
    }

    pub fn commands(&self) -> CommandSet {
        match &self.current {
            Selection::None | Selection::Root => CommandSet::ROOT_LEVEL,
            Selection::Project(_) => CommandSet::PROJECT,
            Selection::Zone(_) | Selection::Instance(_) => CommandSet::SUBTREE,
        }
    }

    /// An instance refresh reloads its parent zone; there is no narrower
    /// scope than one zone's instance list.
    pub fn refresh_scope(&self) -> RefreshScope {
        match &self.current {
            Selection::None | Selection::Root => RefreshScope::AllProjects,
            Selection::Project(id) => RefreshScope::ZonesOf(id.clone()),
            Selection::Zone(zone) => RefreshScope::InstancesOf(zone.clone()),
            Selection::Instance(locator) => RefreshScope::InstancesOf(locator.zone_locator()),
        }
    }
}
