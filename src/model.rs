use std::fmt::{Display, Formatter};

pub const ROOT_CAPTION: &str = "Google Cloud";

/// Identity of a zone within a project. Zones are synthesized from instance
/// listings, so the pair is the whole identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ZoneLocator {
    pub project: String,
    pub zone: String,
}

impl ZoneLocator {
    pub fn new(project: impl Into<String>, zone: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            zone: zone.into(),
        }
    }
}

impl Display for ZoneLocator {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.project, self.zone)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceLocator {
    pub project: String,
    pub zone: String,
    pub name: String,
}

impl InstanceLocator {
    pub fn new(
        project: impl Into<String>,
        zone: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            project: project.into(),
            zone: zone.into(),
            name: name.into(),
        }
    }

    pub fn zone_locator(&self) -> ZoneLocator {
        ZoneLocator::new(self.project.clone(), self.zone.clone())
    }
}

impl Display for InstanceLocator {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.project, self.zone, self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OsKind {
    Windows,
    Linux,
}

impl OsKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::Windows => "windows",
            Self::Linux => "linux",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum InstanceStatus {
    Running,
    Stopped,
    Other(String),
}

impl InstanceStatus {
    pub fn from_backend(status: &str) -> Self {
        match status {
            "RUNNING" => Self::Running,
            "TERMINATED" | "STOPPED" => Self::Stopped,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn label(&self) -> &str {
        match self {
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Other(status) => status,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectMetadata {
    pub display_name: String,
}

/// One instance as reported by the inventory backend, OS tag already derived
/// from disk metadata and zone reduced to its short name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceRecord {
    pub id: String,
    pub name: String,
    pub zone: String,
    pub os: OsKind,
    pub status: InstanceStatus,
}

/// A tracked project as the tree sees it. `metadata` is `None` when the
/// backend denied access; such a project stays listed but has no children.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectSummary {
    pub id: String,
    pub metadata: Option<ProjectMetadata>,
}

impl ProjectSummary {
    pub fn accessible(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            metadata: Some(ProjectMetadata {
                display_name: display_name.into(),
            }),
        }
    }

    pub fn inaccessible(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            metadata: None,
        }
    }

    pub fn is_accessible(&self) -> bool {
        self.metadata.is_some()
    }

    pub fn display_text(&self) -> String {
        match &self.metadata {
            Some(metadata) if metadata.display_name != self.id => {
                format!("{} ({})", metadata.display_name, self.id)
            }
            Some(metadata) => metadata.display_name.clone(),
            None => format!("inaccessible project ({})", self.id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceDetail {
    pub locator: InstanceLocator,
    pub id: String,
    pub os: OsKind,
    pub status: InstanceStatus,
}

/// Icon vocabulary exposed to the UI; derived from a node's payload, never
/// stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageVariant {
    Root,
    Project,
    ProjectInaccessible,
    Zone,
    InstanceRunning,
    InstanceStopped,
    InstanceOther,
}
